use super::*;
use LocationType::*;

fn cec() -> IterationSpace {
    IterationSpace::new(vec![Cells, Edges, Cells], true)
}

#[test]
fn test_subdomain_codes() {
    assert_eq!(Subdomain::from_code(0).unwrap(), Subdomain::LateralBoundary);
    assert_eq!(Subdomain::from_code(1000).unwrap(), Subdomain::Nudging);
    assert_eq!(Subdomain::from_code(2000).unwrap(), Subdomain::Interior);
    assert_eq!(Subdomain::from_code(3000).unwrap(), Subdomain::Halo);
    assert_eq!(Subdomain::from_code(4000).unwrap(), Subdomain::End);
    for s in Subdomain::ALL {
        assert_eq!(Subdomain::from_code(s.code()).unwrap(), s);
    }
}

#[test]
fn test_unknown_subdomain_code() {
    let err = Subdomain::from_code(1500).unwrap_err();
    assert!(err.is_error());
    assert_eq!(err.message, "unknown horizontal subdomain code 1500");
}

#[test]
fn test_descriptor_from_topology() {
    let mesh = TriMesh::new(5, 10).unwrap();
    let desc = GlobalMeshDescriptor::from_topology(&mesh);
    assert_eq!(desc.num_elements(Cells), 100);
    assert_eq!(desc.stride(Edges), 150);
    assert_eq!(
        desc.horizontal_domain.index(Cells, Subdomain::End, 0).unwrap(),
        100
    );
    assert!(desc
        .horizontal_domain
        .index(Cells, Subdomain::Halo, 0)
        .is_err());
}

#[test]
fn test_stride_cannot_shrink_below_count() {
    let mesh = TriMesh::new(3, 3).unwrap();
    let mut desc = GlobalMeshDescriptor::from_topology(&mesh);
    assert!(desc.set_stride(Cells, 10).is_err());
    desc.set_stride(Cells, 32).unwrap();
    assert_eq!(desc.stride(Cells), 32);
    assert_eq!(desc.num_elements(Cells), 18);
}

#[test]
fn test_gpu_mesh_copies_required_tables() {
    let mesh = TriMesh::new(5, 10).unwrap();
    let mut desc = GlobalMeshDescriptor::from_topology(&mesh);
    let ev = IterationSpace::new(vec![Edges, Vertices], false);
    desc.build_tables(&mesh, [&cec(), &ev]).unwrap();

    let required: BTreeSet<IterationSpace> = [cec()].into_iter().collect();
    let gpu = GpuTriMesh::from_global(&desc, &required).unwrap();
    assert_eq!(gpu.spaces().count(), 1);
    let t = gpu.table(&cec()).unwrap();
    assert_eq!(t.slots(), 7);
    assert_eq!(t.num_elements(), 100);
    assert!(gpu.table(&ev).is_none());
    assert_eq!(gpu.num_elements(Vertices), 50);
}

#[test]
fn test_gpu_mesh_shares_table_storage() {
    let mesh = TriMesh::new(3, 4).unwrap();
    let mut desc = GlobalMeshDescriptor::from_topology(&mesh);
    desc.build_tables(&mesh, [&cec()]).unwrap();
    let required: BTreeSet<IterationSpace> = [cec()].into_iter().collect();
    let a = GpuTriMesh::from_global(&desc, &required).unwrap();
    let b = GpuTriMesh::from_global(&desc, &required).unwrap();
    let pa = a.table(&cec()).unwrap().as_slice().as_ptr();
    let pb = b.table(&cec()).unwrap().as_slice().as_ptr();
    assert_eq!(pa, pb);
}

#[test]
fn test_missing_table_is_fatal() {
    let mesh = TriMesh::new(3, 3).unwrap();
    let desc = GlobalMeshDescriptor::from_topology(&mesh);
    let required: BTreeSet<IterationSpace> = [cec()].into_iter().collect();
    let err = GpuTriMesh::from_global(&desc, &required).unwrap_err();
    assert!(err.message.contains("missing from the mesh descriptor"));
    assert_eq!(
        err.help.as_deref(),
        Some("upload a 'cecWithCenterTable' table before setup")
    );
}

#[test]
fn test_table_rows_follow_stride() {
    let mesh = TriMesh::new(3, 3).unwrap();
    let mut desc = GlobalMeshDescriptor::from_topology(&mesh);
    desc.set_stride(Cells, 24).unwrap();
    desc.build_tables(&mesh, [&cec()]).unwrap();
    let required: BTreeSet<IterationSpace> = [cec()].into_iter().collect();
    let gpu = GpuTriMesh::from_global(&desc, &required).unwrap();
    assert_eq!(gpu.table(&cec()).unwrap().num_elements(), 24);

    // a table built before the stride changed no longer fits
    let mut stale = GlobalMeshDescriptor::from_topology(&mesh);
    stale.build_tables(&mesh, [&cec()]).unwrap();
    stale.set_stride(Cells, 24).unwrap();
    assert!(GpuTriMesh::from_global(&stale, &required).is_err());
}

#[test]
fn test_horizontal_index_by_code() {
    let mesh = TriMesh::new(3, 3).unwrap();
    let mut desc = GlobalMeshDescriptor::from_topology(&mesh);
    desc.set_splitter_index(Edges, Subdomain::Interior, 1, 7);
    let gpu = GpuTriMesh::from_global(&desc, &BTreeSet::new()).unwrap();
    assert_eq!(gpu.horizontal_index(Edges, 2000, 1).unwrap(), 7);
    assert!(gpu.horizontal_index(Edges, 2000, 0).is_err());
    assert!(gpu.horizontal_index(Edges, 42, 1).is_err());
}
