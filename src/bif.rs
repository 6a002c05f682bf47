//! Built-in function plumbing.
//!
//! A built-in function receives a [`CallContext`] bound to the engine, the
//! storage and its argument list. The context owns strong roots for the
//! arguments and the result, so a collection triggered by an allocating BIF
//! cannot reclaim either. Typed fetchers raise a formatted VM panic when an
//! argument is missing or of the wrong kind — the language has no other
//! error channel.

use std::cell::RefCell;
use std::rc::Rc;

use crate::atom::Atom;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::storage::array::Array;
use crate::storage::reference::Reference;
use crate::storage::AtomRef;

/// The native function type callable from bytecode.
pub type Bif = fn(&mut CallContext) -> Result<(), EngineError>;

pub struct CallContext<'a> {
    pub engine: &'a mut Engine,
    /// Cursor into the remaining arguments.
    current: Atom,
    /// Number of arguments fetched so far, for error messages.
    index: usize,
    /// The callee's name as compiled into the call site.
    name: String,
    /// Keeps the whole argument list alive while the BIF runs.
    _args: AtomRef,
    result: AtomRef,
}

impl<'a> CallContext<'a> {
    pub fn new(engine: &'a mut Engine, args: Atom, name_symbol: Atom) -> Self {
        let args_root = engine.storage_mut().ref_atom(args);
        let result = engine.storage_mut().ref_atom(Atom::NIL);
        let name = if name_symbol.is_symbol() {
            engine.storage().get_symbol_name(name_symbol).to_string()
        } else {
            "(anonymous)".to_string()
        };
        CallContext {
            engine,
            current: args,
            index: 0,
            name,
            _args: args_root,
            result,
        }
    }

    pub fn has_more_arguments(&self) -> bool {
        self.current.is_cons()
    }

    /// Fetches the next argument or panics the VM with the callee's name.
    pub fn fetch_argument(&mut self) -> Result<Atom, EngineError> {
        self.index += 1;
        if !self.current.is_cons() {
            let message = format!(
                "The built in function {} requires at least {} argument(s)!",
                self.name, self.index
            );
            return Err(self.engine.panic(&message));
        }
        let cell = self.engine.storage().get_cons(self.current);
        self.current = cell.cdr;
        Ok(cell.car)
    }

    fn wrong_kind(&mut self, expected: &str) -> EngineError {
        let message = format!(
            "The {}. argument of {} must be {}!",
            self.index, self.name, expected
        );
        self.engine.panic(&message)
    }

    pub fn fetch_string(&mut self) -> Result<String, EngineError> {
        let atom = self.fetch_argument()?;
        if !atom.is_string() {
            return Err(self.wrong_kind("a string"));
        }
        Ok(self.engine.storage().get_string(atom).to_string())
    }

    pub fn fetch_number(&mut self) -> Result<i64, EngineError> {
        let atom = self.fetch_argument()?;
        if !atom.is_number() {
            return Err(self.wrong_kind("a number"));
        }
        Ok(self.engine.storage().get_number(atom))
    }

    /// A decimal argument; plain numbers convert implicitly.
    pub fn fetch_double(&mut self) -> Result<f64, EngineError> {
        let atom = self.fetch_argument()?;
        if atom.is_decimal() {
            Ok(self.engine.storage().get_decimal(atom))
        } else if atom.is_number() {
            Ok(self.engine.storage().get_number(atom) as f64)
        } else {
            Err(self.wrong_kind("a number"))
        }
    }

    /// The next argument as a cons cell (copied out of the heap).
    pub fn fetch_cons(&mut self) -> Result<crate::storage::Cell, EngineError> {
        let atom = self.fetch_argument()?;
        if !atom.is_cons() {
            return Err(self.wrong_kind("a list"));
        }
        Ok(self.engine.storage().get_cons(atom))
    }

    /// The next argument as a list head, without opening the first cell.
    pub fn fetch_list(&mut self) -> Result<Atom, EngineError> {
        let atom = self.fetch_argument()?;
        if !atom.is_cons() {
            return Err(self.wrong_kind("a list"));
        }
        Ok(atom)
    }

    /// The next argument as an array, together with the atom carrying it.
    pub fn fetch_array(&mut self) -> Result<(Atom, Rc<RefCell<Array>>), EngineError> {
        let atom = self.fetch_argument()?;
        if !atom.is_array() {
            return Err(self.wrong_kind("an array"));
        }
        Ok((atom, self.engine.storage().get_array(atom)))
    }

    /// The next argument as an opaque reference, together with its atom.
    pub fn fetch_reference(&mut self) -> Result<(Atom, Rc<dyn Reference>), EngineError> {
        let atom = self.fetch_argument()?;
        if !atom.is_reference() {
            return Err(self.wrong_kind("a reference"));
        }
        Ok((atom, self.engine.storage().get_reference(atom)))
    }

    /// A reference that must wrap a host object of type `T`.
    pub fn fetch_typed_reference<T: 'static>(
        &mut self,
    ) -> Result<(Atom, Rc<dyn Reference>), EngineError> {
        let (atom, reference) = self.fetch_reference()?;
        if reference.as_any().downcast_ref::<T>().is_none() {
            let expected = format!("a '{}'", std::any::type_name::<T>());
            return Err(self.wrong_kind(&expected));
        }
        Ok((atom, reference))
    }

    /// Sets the result value. Without a call, NIL is returned implicitly.
    pub fn set_result(&mut self, atom: Atom) {
        self.result.set(atom);
    }

    pub fn set_string_result(&mut self, value: impl Into<String>) {
        let atom = self.engine.storage_mut().make_string(value.into());
        self.result.set(atom);
    }

    pub fn set_number_result(&mut self, value: i64) {
        let atom = self.engine.storage_mut().make_number(value);
        self.result.set(atom);
    }

    pub fn set_double_result(&mut self, value: f64) {
        let atom = self.engine.storage_mut().make_decimal(value);
        self.result.set(atom);
    }

    pub fn set_reference_result(&mut self, value: Rc<dyn Reference>) {
        let atom = self.engine.storage_mut().make_reference(value);
        self.result.set(atom);
    }

    /// Read by the VM after the call returned.
    pub fn result(&self) -> Atom {
        self.result.atom()
    }
}
