//! Shared test harness: runs sources through a full engine and captures
//! everything the program printed, plus any panic reports.
#![allow(dead_code)] // not every test binary uses every helper

use std::cell::RefCell;
use std::rc::Rc;

use kavi::atom::Atom;
use kavi::engine::Engine;
use kavi::errors::EngineError;
use kavi::interceptor::MemoryInterceptor;

pub struct Harness {
    pub engine: Engine,
    output: Rc<RefCell<Vec<String>>>,
    panics: Rc<RefCell<Vec<String>>>,
}

impl Harness {
    pub fn new() -> Self {
        let interceptor = MemoryInterceptor::new();
        let output = interceptor.lines_handle();
        let panics = interceptor.panics_handle();
        Harness {
            engine: Engine::new(Box::new(interceptor)),
            output,
            panics,
        }
    }

    pub fn run(&mut self, source: &str) -> Result<Atom, EngineError> {
        self.engine.run(source, "test.kv")
    }

    /// Runs `source` and returns the rendered result; fails the test on any
    /// compile error or panic.
    pub fn run_value(&mut self, source: &str) -> String {
        match self.run(source) {
            Ok(atom) => self.engine.to_string(atom),
            Err(error) => panic!("{source:?} should evaluate, got: {error}\n{:?}", self.panics()),
        }
    }

    /// Everything the program printed, in order.
    pub fn output(&self) -> Vec<String> {
        self.output.borrow().clone()
    }

    pub fn panics(&self) -> Vec<String> {
        self.panics.borrow().clone()
    }
}

/// One-shot helper: run and return (printed lines, rendered result).
pub fn eval_lines(source: &str) -> (Vec<String>, String) {
    let mut harness = Harness::new();
    let rendered = harness.run_value(source);
    (harness.output(), rendered)
}

/// One-shot helper for sources that must panic the VM; returns the panic
/// messages that reached the interceptor.
pub fn eval_panic(source: &str) -> Vec<String> {
    let mut harness = Harness::new();
    match harness.run(source) {
        Ok(atom) => panic!(
            "{source:?} should panic, got {}",
            harness.engine.to_string(atom)
        ),
        Err(EngineError::Panic(_)) => harness.panics(),
        Err(error) => panic!("{source:?} should panic the VM, got: {error}"),
    }
}
