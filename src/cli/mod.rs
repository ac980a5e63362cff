pub mod example;
pub mod generate;
pub mod spaces;

use std::path::Path;
use std::process;

use icogen::diagnostic::{render_diagnostics, Diagnostic};
use icogen::ir::StencilInstantiation;

/// Load instantiations from an IR file and report every lint finding.
/// Exits on a load failure or on any error among the findings.
pub fn load_ir(path: &Path) -> Vec<StencilInstantiation> {
    let insts = icogen::ir::load(path).unwrap_or_else(|diag| fail(&diag, path));
    let diags = icogen::ir::lint(&insts);
    render_diagnostics(&diags, &path.display().to_string(), "");
    if diags.iter().any(Diagnostic::is_error) {
        process::exit(1);
    }
    insts
}

/// Render a fatal diagnostic concerning `origin` and exit.
pub fn fail(diag: &Diagnostic, origin: &Path) -> ! {
    diag.render(&origin.display().to_string(), "");
    process::exit(1);
}
