//! Kavi: an embeddable, Smalltalk- and Lisp-influenced expression language.
//!
//! The crate is built around a tagged-word memory system ([`atom`],
//! [`storage`]), a single-pass compiler that lowers source text directly
//! into list-structured bytecode ([`syntax`], [`compiler`]) and a SECD-style
//! virtual machine with tail-call optimisation ([`engine`]). Native
//! functions plug in through [`bif`]; all I/O flows through the
//! [`interceptor`] sink.

pub mod atom;
pub mod bif;
pub mod bifs_std;
pub mod cli;
pub mod compiler;
pub mod engine;
pub mod errors;
pub mod interceptor;
pub mod storage;
pub mod syntax;

pub use atom::Atom;
pub use engine::Engine;
pub use errors::EngineError;
pub use interceptor::{ConsoleInterceptor, Interceptor, MemoryInterceptor, NullInterceptor};
