use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = kavi::cli::Cli::parse();
    kavi::cli::run(cli)
}
