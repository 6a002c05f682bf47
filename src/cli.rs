//! The command line front end: run a source file or a one-liner.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use atty::Stream;
use clap::Parser;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::engine::Engine;
use crate::errors::{CompileReport, EngineError};
use crate::interceptor::ConsoleInterceptor;

#[derive(Debug, Parser)]
#[command(
    name = "kavi",
    version,
    about = "An embeddable expression language with a SECD bytecode VM"
)]
pub struct Cli {
    /// Source file to run.
    pub file: Option<PathBuf>,

    /// Evaluate the given expression instead of a file.
    #[arg(short = 'e', long = "eval", value_name = "EXPR", conflicts_with = "file")]
    pub expression: Option<String>,

    /// Print the compiled bytecode before running it.
    #[arg(long)]
    pub show_bytecode: bool,

    /// Print engine statistics as JSON after the run.
    #[arg(long)]
    pub stats: bool,

    /// Additional directories searched by include().
    #[arg(short = 'I', long = "include", value_name = "DIR")]
    pub include_dirs: Vec<PathBuf>,
}

pub fn run(cli: Cli) -> ExitCode {
    let (source, filename) = match load_input(&cli) {
        Ok(input) => input,
        Err(message) => {
            print_error(&message);
            return ExitCode::FAILURE;
        }
    };

    let mut engine = Engine::new(Box::new(ConsoleInterceptor));
    for dir in &cli.include_dirs {
        engine.add_source_path(dir.clone());
    }

    // Compiled silently so errors are rendered once, with source labels.
    let code = match engine.compile_source(&filename, &source, true, true) {
        Ok(code) => code,
        Err(EngineError::Compilation { errors, .. }) => {
            let report = CompileReport::new(&filename, &source, errors);
            eprintln!("{:?}", miette::Report::new(report));
            return ExitCode::FAILURE;
        }
        Err(error) => {
            print_error(&error.to_string());
            return ExitCode::FAILURE;
        }
    };
    if cli.show_bytecode {
        println!("{}", engine.to_string(code));
    }

    let outcome = engine.run_code(code, &filename);
    if cli.stats {
        match serde_json::to_string_pretty(&engine.status()) {
            Ok(json) => eprintln!("{json}"),
            Err(error) => print_error(&format!("cannot serialise statistics: {error}")),
        }
    }
    match outcome {
        Ok(result) => {
            if !result.is_nil() {
                println!("{}", engine.to_string(result));
            }
            ExitCode::SUCCESS
        }
        Err(_) => {
            // The panic report already went through the interceptor.
            ExitCode::FAILURE
        }
    }
}

fn load_input(cli: &Cli) -> Result<(String, String), String> {
    if let Some(expression) = &cli.expression {
        return Ok((expression.clone(), "(eval)".to_string()));
    }
    let Some(file) = &cli.file else {
        return Err("nothing to run: pass a source file or use --eval".to_string());
    };
    let source = std::fs::read_to_string(file)
        .map_err(|error| format!("cannot read {}: {error}", file.display()))?;
    Ok((source, file.display().to_string()))
}

fn print_error(message: &str) {
    let choice = if atty::is(Stream::Stderr) {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    };
    let mut stderr = StandardStream::stderr(choice);
    let _ = stderr.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true));
    let _ = write!(stderr, "error");
    let _ = stderr.reset();
    let _ = writeln!(stderr, ": {message}");
}
