//! Error types of the engine.
//!
//! Two worlds meet here. Compilation problems are *collected*: the compiler
//! keeps parsing after an error and reports the whole batch with positions,
//! rendered through miette so the CLI can point into the source. Runtime
//! problems are a single kind — the VM panic — which stops the current
//! execution, is reported through the Interceptor and never unwinds past the
//! engine boundary.

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

/// A single problem found while compiling. Line and column are 1-based;
/// `span` points at the offending token for diagnostic rendering.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("{line}:{column}: {message}")]
pub struct CompileError {
    pub message: String,
    pub line: u32,
    pub column: u32,
    #[label("{message}")]
    pub span: SourceSpan,
}

/// Everything that went wrong in one compilation run, bundled with the
/// source so miette can render labels into it.
#[derive(Debug, Error, Diagnostic)]
#[error("compilation of {file} failed with {} error(s)", .errors.len())]
pub struct CompileReport {
    pub file: String,
    #[source_code]
    pub src: NamedSource<String>,
    #[related]
    pub errors: Vec<CompileError>,
}

impl CompileReport {
    pub fn new(file: &str, source: &str, errors: Vec<CompileError>) -> Self {
        CompileReport {
            file: file.to_string(),
            src: NamedSource::new(file, source.to_string()),
            errors,
        }
    }

    /// The plain-text form sent through the Interceptor, one error per line.
    pub fn to_report_string(&self) -> String {
        let mut buffer = format!("Compilation error(s) in: {}\n", self.file);
        for error in &self.errors {
            buffer.push_str(&format!(
                "{}:{}: {}\n",
                error.line, error.column, error.message
            ));
        }
        buffer
    }
}

/// The engine-level error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The source did not compile; the details were already delivered to
    /// the Interceptor unless the caller asked for silence.
    #[error("compilation of {file} failed with {} error(s)", .errors.len())]
    Compilation {
        file: String,
        errors: Vec<CompileError>,
    },

    /// A VM panic. The formatted register dump and stack trace went to the
    /// Interceptor; this carries the bare message.
    #[error("{0}")]
    Panic(String),

    /// Attempt to write a read-only engine parameter.
    #[error("the engine parameter {0} is read only")]
    ReadOnly(String),
}
