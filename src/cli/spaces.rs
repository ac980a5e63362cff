use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::Args;
use icogen::iterspace;

use super::load_ir;

#[derive(Args)]
pub struct SpacesArgs {
    /// Input IR file (JSON: one instantiation or a list)
    pub input: PathBuf,
}

pub fn cmd_spaces(args: SpacesArgs) {
    let insts = load_ir(&args.input);
    let spaces: BTreeSet<_> = insts
        .iter()
        .flat_map(iterspace::instantiation_spaces)
        .collect();
    if spaces.is_empty() {
        eprintln!("No neighbor iteration in '{}'", args.input.display());
        return;
    }
    println!("{:<28} {:<24} {:>8} {:>6}", "SPACE", "TABLE", "CAPACITY", "SIZE");
    for space in &spaces {
        println!(
            "{:<28} {:<24} {:>8} {:>6}",
            space.to_string(),
            space.table_name(),
            space.chain_capacity(),
            space.table_size()
        );
    }
}
