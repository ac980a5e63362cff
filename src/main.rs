mod cli;

use clap::{Parser, Subcommand};

use cli::example::ExampleArgs;
use cli::generate::GenerateArgs;
use cli::spaces::SpacesArgs;

#[derive(Parser)]
#[command(
    name = "icogen",
    version,
    about = "CUDA code generation for unstructured-mesh stencils"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate the CUDA translation unit (and optional interfaces) from IR
    Generate(GenerateArgs),
    /// List the neighbor iteration spaces an IR file needs tables for
    Spaces(SpacesArgs),
    /// Write a sample instantiation as IR JSON
    Example(ExampleArgs),
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Generate(args) => cli::generate::cmd_generate(args),
        Command::Spaces(args) => cli::spaces::cmd_spaces(args),
        Command::Example(args) => cli::example::cmd_example(args),
    }
}
