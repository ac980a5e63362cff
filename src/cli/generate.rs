use std::path::PathBuf;

use clap::Args;
use icogen::codegen::{self, CodegenOptions};

use super::{fail, load_ir};

#[derive(Args)]
pub struct GenerateArgs {
    /// Input IR file (JSON: one instantiation or a list)
    pub input: PathBuf,
    /// Output translation unit (default: <input>.cu)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Options file with a [codegen] section
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Also write a C header declaring the entry points
    #[arg(long, value_name = "PATH")]
    pub c_header: Option<PathBuf>,
    /// Also write a Fortran interface module
    #[arg(long, value_name = "PATH")]
    pub fortran_interface: Option<PathBuf>,
    /// Threads per block (default: 128)
    #[arg(long)]
    pub block_size: Option<u32>,
    /// Vertical levels per thread in parallel multistages (default: 1)
    #[arg(long)]
    pub levels_per_thread: Option<u32>,
}

pub fn cmd_generate(args: GenerateArgs) {
    let GenerateArgs {
        input,
        output,
        config,
        c_header,
        fortran_interface,
        block_size,
        levels_per_thread,
    } = args;

    let mut options = match &config {
        Some(path) => CodegenOptions::load(path).unwrap_or_else(|d| fail(&d, path)),
        None => CodegenOptions::default(),
    };
    if let Some(n) = block_size {
        options.block_size = n;
    }
    if let Some(n) = levels_per_thread {
        options.levels_per_thread = n;
    }
    if c_header.is_some() {
        options.output_c_header = c_header;
    }
    if fortran_interface.is_some() {
        options.output_fortran_interface = fortran_interface;
    }

    let insts = load_ir(&input);
    let artifacts = codegen::generate(&insts, &options).unwrap_or_else(|d| fail(&d, &input));
    let unit_path = output.unwrap_or_else(|| input.with_extension("cu"));
    let written = codegen::write_artifacts(&artifacts, &unit_path, &options)
        .unwrap_or_else(|d| fail(&d, &unit_path));
    for (path, changed) in written {
        if changed {
            eprintln!("Generated -> {}", path.display());
        } else {
            eprintln!("Unchanged -> {}", path.display());
        }
    }
}
