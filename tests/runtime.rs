use std::collections::BTreeSet;

use icogen::ir::builder::*;
use icogen::ir::{
    Expr, FieldDims, FieldId, Interval, IterationSpace, LocationType, LoopOrder, Reduction,
    ReductionOp,
};
use icogen::mesh::table::DEVICE_MISSING_VALUE;
use icogen::mesh::trimesh::TriMesh;
use icogen::mesh::GlobalMeshDescriptor;
use icogen::runtime::{GlobalValue, Tolerance};
use icogen::{iterspace, CodegenOptions, StencilContext, StencilInstantiation};
use LocationType::*;

const K: usize = 6;

fn ce() -> IterationSpace {
    IterationSpace::new(vec![Cells, Edges], false)
}

/// `div = div + dt * sum_e(geofac * vn)` over the edges of each cell.
fn divergence() -> StencilInstantiation {
    let mut b = InstantiationBuilder::new("divergence");
    let vn = b.api_field("vn", FieldDims::dense(Edges));
    let geofac = b.api_field("geofac", FieldDims::sparse(ce()));
    let div = b.api_field("div", FieldDims::dense(Cells));
    b.global("dt", icogen::ir::GlobalType::Double);
    let flux = Expr::reduce(Reduction {
        op: ReductionOp::Sum,
        init: lit(0.0),
        rhs: mul(sparse(geofac), nbh(vn)),
        weights: None,
        space: ce(),
    });
    b.multistage(
        LoopOrder::Parallel,
        vec![StageBuilder::new(Cells).do_method(
            Interval::full(),
            vec![store(div, add(at(div), mul(global("dt"), flux)))],
        )],
    );
    b.build()
}

fn descriptor(inst: &StencilInstantiation) -> GlobalMeshDescriptor {
    let mesh = TriMesh::new(5, 10).unwrap();
    let mut desc = GlobalMeshDescriptor::from_topology(&mesh);
    desc.build_tables(&mesh, &iterspace::instantiation_spaces(inst))
        .unwrap();
    desc
}

#[test]
fn test_cec_table_with_center_shape() {
    let mesh = TriMesh::new(5, 10).unwrap();
    let space = IterationSpace::new(vec![Cells, Edges, Cells], true);
    let mut desc = GlobalMeshDescriptor::from_topology(&mesh);
    desc.build_tables(&mesh, &BTreeSet::from([space.clone()]))
        .unwrap();

    let table = desc.table(&space).unwrap();
    assert_eq!(table.slots(), 7);
    assert_eq!(table.num_elements(), 100);
    assert_eq!(table.len(), 700);
    assert!(table
        .as_slice()
        .iter()
        .all(|v| (DEVICE_MISSING_VALUE..100).contains(v)));
    for cell in 0..100 {
        assert_eq!(table.get(0, cell), Some(cell as i32));
        let filled = (0..7)
            .filter(|&s| table.get(s, cell) != Some(DEVICE_MISSING_VALUE))
            .count();
        assert_eq!(filled, 4);
    }
}

#[test]
fn test_divergence_matches_host_reference() {
    let inst = divergence();
    let desc = descriptor(&inst);
    let mut ctx = StencilContext::new(&inst, &CodegenOptions::default()).unwrap();
    ctx.setup(&desc, K, 0, &[K]).unwrap();
    ctx.set_global("dt", GlobalValue::Double(0.5)).unwrap();

    let (cells, edges) = (100, 150);
    // host layout: [element][level][slot]
    let vn: Vec<f64> = (0..edges * K).map(|i| (i % 17) as f64 - 8.0).collect();
    let geofac: Vec<f64> = (0..cells * K * 3).map(|i| 0.25 * (i % 5) as f64).collect();
    let div: Vec<f64> = (0..cells * K).map(|i| i as f64).collect();

    let table = ctx.mesh().unwrap().table(&ce()).unwrap().clone();
    let mut expected = div.clone();
    for c in 0..cells {
        for k in 0..K {
            let mut flux = 0.0;
            for s in 0..3 {
                let e = table.get(s, c).unwrap() as usize;
                flux += geofac[(c * K + k) * 3 + s] * vn[e * K + k];
            }
            expected[c * K + k] += 0.5 * flux;
        }
    }

    let mut device = ctx.copy_memory(&[&vn, &geofac, &div], true).unwrap();
    let launches = ctx.run(&mut device).unwrap();
    assert_eq!(launches.len(), 1);
    assert_eq!(
        launches[0].params,
        vec![
            "globals", "NumCells", "NumEdges", "kSize", "hSize", "ceTable", "vn", "geofac", "div"
        ]
    );

    let mut out = vec![0.0; cells * K];
    ctx.copy_result_to_host(&device, &mut [out.as_mut_slice()], true)
        .unwrap();
    for (got, want) in out.iter().zip(&expected) {
        assert!((got - want).abs() < 1e-12, "{} != {}", got, want);
    }
}

#[test]
fn test_run_and_verify_flags_wrong_reference() {
    let inst = divergence();
    let desc = descriptor(&inst);
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = StencilContext::new(&inst, &CodegenOptions::default())
        .unwrap()
        .with_serialize_dir(dir.path());
    ctx.setup(&desc, K, 0, &[K]).unwrap();
    ctx.set_global("dt", GlobalValue::Double(1.0)).unwrap();

    let vn = vec![1.0; 150 * K];
    let geofac = vec![1.0; 100 * K * 3];
    let mut div = vec![0.0; 100 * K];
    // every cell has three edges: div becomes 3 everywhere
    let right = ctx
        .copy_memory(&[&vn, &geofac, &vec![3.0; 100 * K]], true)
        .unwrap();
    let report = ctx
        .run_and_verify(&right, vec![div.as_mut_slice()], &[Tolerance::default()])
        .unwrap();
    assert!(report.passed(), "{:?}", report);
    assert_eq!(ctx.iteration(), 1);

    div.iter_mut().for_each(|v| *v = 0.0);
    let wrong = ctx
        .copy_memory(&[&vn, &geofac, &vec![2.0; 100 * K]], true)
        .unwrap();
    let report = ctx
        .run_and_verify(&wrong, vec![div.as_mut_slice()], &[Tolerance::default()])
        .unwrap();
    assert!(!report.passed());
    assert_eq!(report.field("div").unwrap().failures, 100 * K);
    assert!(std::fs::read_dir(dir.path()).unwrap().count() > 0);
}

#[test]
fn test_copy_pointers_aliases_device_buffers() {
    let inst = divergence();
    let desc = descriptor(&inst);
    let mut ctx = StencilContext::new(&inst, &CodegenOptions::default()).unwrap();
    ctx.setup(&desc, K, 0, &[K]).unwrap();
    ctx.set_global("dt", GlobalValue::Double(2.0)).unwrap();

    let mut vn = vec![1.0; 150 * K];
    let mut geofac = vec![0.5; 100 * K * 3];
    let mut div = vec![1.0; 100 * K];
    {
        let mut device = ctx
            .copy_pointers(vec![
                vn.as_mut_slice(),
                geofac.as_mut_slice(),
                div.as_mut_slice(),
            ])
            .unwrap();
        ctx.run(&mut device).unwrap();
        assert!(device.get(FieldId(2)).is_some());
    }
    // 1 + 2 * (3 * 0.5 * 1)
    assert!(div.iter().all(|v| *v == 4.0));
}
