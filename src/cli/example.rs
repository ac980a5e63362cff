use std::path::{Path, PathBuf};

use clap::Args;
use icogen::codegen::write_if_changed;
use icogen::diagnostic::Diagnostic;
use icogen::ir::builder::*;
use icogen::ir::{
    Expr, FieldDims, GlobalType, Interval, IterationSpace, LocationType, LoopOrder, Reduction,
    ReductionOp, StencilInstantiation,
};

use super::fail;

#[derive(Args)]
pub struct ExampleArgs {
    /// Where to write the IR (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Divergence of an edge-normal field plus an explicit time step, the
/// shape of a typical dycore stencil.
fn divergence() -> StencilInstantiation {
    use LocationType::*;
    let ce = IterationSpace::new(vec![Cells, Edges], false);

    let mut b = InstantiationBuilder::new("divergence");
    let vn = b.api_field("vn", FieldDims::dense(Edges));
    let geofac = b.api_field("geofac_div", FieldDims::sparse(ce.clone()).horizontal_only());
    let div = b.api_field("div", FieldDims::dense(Cells));
    let tend = b.temporary("tend", FieldDims::dense(Cells));
    b.global("dt", GlobalType::Double);

    let flux = Expr::reduce(Reduction {
        op: ReductionOp::Sum,
        init: lit(0.0),
        rhs: mul(sparse(geofac), nbh(vn)),
        weights: None,
        space: ce,
    });
    b.multistage(
        LoopOrder::Parallel,
        vec![
            StageBuilder::new(Cells).do_method(Interval::full(), vec![store(tend, flux)]),
            StageBuilder::new(Cells).do_method(
                Interval::full(),
                vec![store(div, add(at(div), mul(global("dt"), at(tend))))],
            ),
        ],
    );
    b.build()
}

pub fn cmd_example(args: ExampleArgs) {
    let json = match serde_json::to_string_pretty(&divergence()) {
        Ok(json) => json,
        Err(e) => fail(
            &Diagnostic::error(format!("cannot serialize the example: {}", e)),
            Path::new("divergence"),
        ),
    };
    match args.output {
        Some(path) => {
            if let Err(d) = write_if_changed(&path, &format!("{}\n", json)) {
                fail(&d, &path);
            }
            eprintln!("Wrote -> {}", path.display());
        }
        None => println!("{}", json),
    }
}
