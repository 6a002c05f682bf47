//! The evaluation engine.
//!
//! A SECD machine with one extra register: besides stack, environment, code
//! and dump it keeps a position trace (`P`) holding one `(file . line)` pair
//! per active call, which turns a VM panic into a readable stack trace.
//!
//! All five registers are strong GC roots ([`AtomRef`]), so a collection
//! triggered by any allocation inside an opcode cannot reclaim live machine
//! state. The engine is strictly single-threaded; the only concession to the
//! outside world is the atomic `running` flag that [`Engine::interrupt`]
//! flips to stop the dispatch loop at the next instruction boundary.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::atom::{self, Atom, Tag};
use crate::bif::{Bif, CallContext};
use crate::bifs_std;
use crate::compiler::Compiler;
use crate::errors::{CompileReport, EngineError};
use crate::interceptor::{EngineStatus, Interceptor};
use crate::storage::lookup_table::LookupTable;
use crate::storage::{AtomRef, Storage};

/// Instructions between two periodic status reports.
const DEFAULT_REPORT_INTERVAL: u64 = 250_000;

/// Upper bound on elements rendered by the pretty printer, so cyclic lists
/// terminate.
const PRINT_LIST_LIMIT: usize = 1000;

/// The machine registers. Used to address a register without borrowing the
/// underlying [`AtomRef`] fields individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reg {
    /// Operand stack.
    S,
    /// Environment: a chain of frames.
    E,
    /// Code: the list whose head is the next opcode.
    C,
    /// Dump: save area for calls.
    D,
    /// Position trace, one `(file . line)` pair per active call.
    P,
}

/// One queued evaluation. The bytecode is pinned while it waits.
struct Execution {
    filename: String,
    code: AtomRef,
}

pub struct Engine {
    storage: Storage,
    bif_table: LookupTable<Atom, Bif>,
    interceptor: Box<dyn Interceptor>,
    s: AtomRef,
    e: AtomRef,
    c: AtomRef,
    d: AtomRef,
    p: AtomRef,
    /// Set by the `FILE` bytecode.
    current_file: Atom,
    /// Set by the `LINE` bytecode.
    current_line: i64,
    instruction_counter: u64,
    last_status_report: u64,
    gc_count_at_start: u64,
    start_time: Instant,
    running: Arc<AtomicBool>,
    executions: VecDeque<Execution>,
    home_dir: PathBuf,
    source_paths: Vec<PathBuf>,
    report_interval: u64,
}

impl Engine {
    pub fn new(interceptor: Box<dyn Interceptor>) -> Self {
        let mut storage = Storage::new();
        let s = storage.ref_atom(Atom::NIL);
        let e = storage.ref_atom(Atom::NIL);
        let c = storage.ref_atom(Atom::NIL);
        let d = storage.ref_atom(Atom::NIL);
        let p = storage.ref_atom(Atom::NIL);
        let boot_file = storage.make_symbol("(boot)");
        let mut engine = Engine {
            storage,
            bif_table: LookupTable::new(),
            interceptor,
            s,
            e,
            c,
            d,
            p,
            current_file: boot_file,
            current_line: 1,
            instruction_counter: 0,
            last_status_report: 0,
            gc_count_at_start: 0,
            start_time: Instant::now(),
            running: Arc::new(AtomicBool::new(false)),
            executions: VecDeque::new(),
            home_dir: std::env::current_dir().unwrap_or_default(),
            source_paths: Vec::new(),
            report_interval: DEFAULT_REPORT_INTERVAL,
        };
        bifs_std::register_core_bifs(&mut engine);
        engine
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    pub fn set_report_interval(&mut self, instructions: u64) {
        self.report_interval = instructions.max(1);
    }

    // ------------------------------------------------------------------
    // Register plumbing
    // ------------------------------------------------------------------

    fn reg(&self, reg: Reg) -> &AtomRef {
        match reg {
            Reg::S => &self.s,
            Reg::E => &self.e,
            Reg::C => &self.c,
            Reg::D => &self.d,
            Reg::P => &self.p,
        }
    }

    fn reg_get(&self, reg: Reg) -> Atom {
        self.reg(reg).atom()
    }

    fn reg_set(&self, reg: Reg, atom: Atom) {
        self.reg(reg).set(atom);
    }

    fn push(&mut self, reg: Reg, value: Atom) {
        let top = self.reg_get(reg);
        let cell = self.storage.make_cons(value, top);
        self.reg_set(reg, cell);
    }

    /// Popping from an exhausted register yields NIL; opcodes that need a
    /// real value check for it themselves.
    fn pop(&mut self, reg: Reg) -> Atom {
        let list = self.reg_get(reg);
        if !list.is_cons() {
            return Atom::NIL;
        }
        let cell = self.storage.get_cons(list);
        self.reg_set(reg, cell.cdr);
        cell.car
    }

    fn head(&self, reg: Reg) -> Atom {
        let list = self.reg_get(reg);
        if list.is_cons() {
            self.storage.get_cons(list).car
        } else {
            Atom::NIL
        }
    }

    // ------------------------------------------------------------------
    // Built-in functions
    // ------------------------------------------------------------------

    pub fn make_built_in_function(&mut self, name_symbol: Atom, function: Bif) -> Atom {
        assert!(name_symbol.is_symbol(), "BIF names must be symbols");
        let index = self.bif_table.add(name_symbol, function);
        Atom::tag_index(index, Tag::Bif)
    }

    /// Interns `name` and registers `function` under it.
    pub fn register_bif(&mut self, name: &str, function: Bif) -> Atom {
        let symbol = self.storage.make_symbol(name);
        self.make_built_in_function(symbol, function)
    }

    pub fn find_built_in_function(&self, name_symbol: Atom) -> Option<Atom> {
        self.bif_table
            .find(&name_symbol)
            .map(|index| Atom::tag_index(index, Tag::Bif))
    }

    pub fn get_built_in_function(&self, atom: Atom) -> Bif {
        assert!(atom.is_bif());
        *self.bif_table.value(atom.index())
    }

    pub fn get_bif_name(&self, atom: Atom) -> &str {
        assert!(atom.is_bif());
        self.storage.get_symbol_name(*self.bif_table.key(atom.index()))
    }

    // ------------------------------------------------------------------
    // Panics
    // ------------------------------------------------------------------

    /// Stops the current execution: formats the register dump and the
    /// position trace, hands both to the Interceptor and returns the error
    /// the opcode handlers propagate with `?`.
    pub fn panic(&mut self, message: &str) -> EngineError {
        let dump = self.stack_dump(message);
        let file = self.to_simple_string(self.current_file);
        let line = self.current_line;
        self.interceptor.panic(&file, line, message, &dump);
        EngineError::Panic(message.to_string())
    }

    fn expect(&mut self, expectation: bool, message: &str) -> Result<(), EngineError> {
        if expectation {
            Ok(())
        } else {
            Err(self.panic(message))
        }
    }

    /// The full panic report: message, stack trace and registers.
    pub fn stack_dump(&self, message: &str) -> String {
        let mut buffer = String::new();
        buffer.push_str("Error:\n");
        buffer.push_str("--------------------------------------------\n");
        buffer.push_str(message);
        buffer.push('\n');
        buffer.push_str("Stacktrace:\n");
        buffer.push_str("--------------------------------------------\n");
        buffer.push_str(&format!(
            "{}:{}\n",
            self.to_simple_string(self.current_file),
            self.current_line
        ));
        let mut trace = self.reg_get(Reg::P);
        while trace.is_cons() {
            let entry = self.storage.get_cons(trace);
            if entry.car.is_cons() {
                let location = self.storage.get_cons(entry.car);
                buffer.push_str(&format!(
                    "{}:{}\n",
                    self.to_simple_string(location.car),
                    self.to_simple_string(location.cdr)
                ));
            }
            trace = entry.cdr;
        }
        buffer.push('\n');
        buffer.push_str("Registers:\n");
        buffer.push_str("--------------------------------------------\n");
        buffer.push_str(&format!("S: {}\n", self.to_string(self.reg_get(Reg::S))));
        buffer.push_str(&format!("E: {}\n", self.to_string(self.reg_get(Reg::E))));
        buffer.push_str(&format!("C: {}\n", self.to_string(self.reg_get(Reg::C))));
        buffer.push_str(&format!("D: {}\n", self.to_string(self.reg_get(Reg::D))));
        buffer
    }

    // ------------------------------------------------------------------
    // Environment access
    // ------------------------------------------------------------------

    fn position_indices(&mut self, pos: Atom, what: &str) -> Result<(i64, i64), EngineError> {
        self.expect(pos.is_cons(), &format!("{what}: position is not a pair!"))?;
        let cell = self.storage.get_cons(pos);
        self.expect(
            cell.car.is_number(),
            &format!("{what}: major index is not a number!"),
        )?;
        self.expect(
            cell.cdr.is_number(),
            &format!("{what}: minor index is not a number!"),
        )?;
        Ok((
            self.storage.get_number(cell.car),
            self.storage.get_number(cell.cdr),
        ))
    }

    /// Reads environment slot `(major, minor)`. Unset slots read as NIL;
    /// walking off the chain is not an error either, it is a read of a
    /// variable that was never written.
    fn locate(&mut self, pos: Atom) -> Result<Atom, EngineError> {
        let (mut major, mut minor) = self.position_indices(pos, "locate")?;
        let mut env = self.reg_get(Reg::E);
        while major > 1 {
            if !env.is_cons() {
                return Ok(Atom::NIL);
            }
            env = self.storage.get_cons(env).cdr;
            major -= 1;
        }
        if !env.is_cons() {
            return Ok(Atom::NIL);
        }
        let mut frame = self.storage.get_cons(env).car;
        while minor > 1 {
            if !frame.is_cons() {
                return Ok(Atom::NIL);
            }
            frame = self.storage.get_cons(frame).cdr;
            minor -= 1;
        }
        if !frame.is_cons() {
            return Ok(Atom::NIL);
        }
        Ok(self.storage.get_cons(frame).car)
    }

    /// Writes environment slot `(major, minor)`, materialising missing
    /// frame cells on the way.
    fn store(&mut self, pos: Atom, value: Atom) -> Result<(), EngineError> {
        let (mut major, mut minor) = self.position_indices(pos, "store")?;
        let pinned_value = self.storage.ref_atom(value);
        let mut env = self.reg_get(Reg::E);
        while major > 1 {
            if !env.is_cons() {
                return Ok(());
            }
            env = self.storage.get_cons(env).cdr;
            major -= 1;
        }
        if !env.is_cons() {
            return Ok(());
        }
        if self.storage.get_cons(env).car.is_nil() {
            let fresh = self.storage.make_cons(Atom::NIL, Atom::NIL);
            self.storage.set_car(env, fresh);
        }
        let mut frame = self.storage.get_cons(env).car;
        while minor > 1 {
            if !frame.is_cons() {
                return Ok(());
            }
            if self.storage.get_cons(frame).cdr.is_nil() {
                let fresh = self.storage.make_cons(Atom::NIL, Atom::NIL);
                self.storage.set_cdr(frame, fresh);
            }
            frame = self.storage.get_cons(frame).cdr;
            minor -= 1;
        }
        if frame.is_cons() {
            self.storage.set_car(frame, pinned_value.atom());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Opcodes
    // ------------------------------------------------------------------

    fn op_nil(&mut self) {
        self.push(Reg::S, Atom::NIL);
    }

    fn op_ldc(&mut self) {
        let constant = self.pop(Reg::C);
        self.push(Reg::S, constant);
    }

    fn op_ld(&mut self) -> Result<(), EngineError> {
        let pos = self.pop(Reg::C);
        let value = self.locate(pos)?;
        self.push(Reg::S, value);
        Ok(())
    }

    fn op_st(&mut self) -> Result<(), EngineError> {
        let pos = self.pop(Reg::C);
        let value = self.pop(Reg::S);
        self.store(pos, value)
    }

    fn op_ldg(&mut self) -> Result<(), EngineError> {
        let global = self.pop(Reg::C);
        self.expect(global.is_global(), "#LDG: code top was not a global!")?;
        let value = self.storage.read_global(global);
        self.push(Reg::S, value);
        Ok(())
    }

    fn op_stg(&mut self) -> Result<(), EngineError> {
        let global = self.pop(Reg::C);
        self.expect(global.is_global(), "#STG: code top was not a global!")?;
        let value = self.pop(Reg::S);
        self.storage.write_global(global, value);
        Ok(())
    }

    /// When the discriminator is TRUE the branch replaces the remaining
    /// code, so a taken branch returns from the enclosing function.
    fn op_bt(&mut self) {
        let discriminator = self.pop(Reg::S);
        let branch = self.pop(Reg::C);
        if discriminator == atom::SYMBOL_TRUE {
            self.reg_set(Reg::C, branch);
        }
    }

    fn op_ldf(&mut self) {
        let body = self.pop(Reg::C);
        let env = self.reg_get(Reg::E);
        let closure = self.storage.make_cons(body, env);
        self.push(Reg::S, closure);
    }

    fn op_ap(&mut self, has_arguments: bool) -> Result<(), EngineError> {
        // The callee's name symbol travels inline behind the opcode; it only
        // feeds diagnostics.
        let name = self.pop(Reg::C);
        let fun = self.pop(Reg::S);
        let args = if has_arguments {
            self.pop(Reg::S)
        } else {
            Atom::NIL
        };
        if fun.is_bif() {
            let function = self.get_built_in_function(fun);
            let result = {
                let mut ctx = CallContext::new(self, args, name);
                function(&mut ctx)?;
                ctx.result()
            };
            self.push(Reg::S, result);
            return Ok(());
        }
        self.expect(
            fun.is_cons(),
            "#AP: stack top was neither a built in function nor a closure!",
        )?;
        // Both were just popped off the stack; pin them across the dump
        // pushes so an intervening collection cannot reclaim them.
        let _pinned_fun = self.storage.ref_atom(fun);
        let _pinned_args = self.storage.ref_atom(args);
        let closure = self.storage.get_cons(fun);
        if self.head(Reg::C) == atom::OP_RTN && closure.car == self.head(Reg::D) {
            // Tail recursion: the dump already describes this frame. Flush
            // the stack, restart the body with the new arguments.
            self.reg_set(Reg::S, Atom::NIL);
            self.reg_set(Reg::C, closure.car);
            let env = self.storage.make_cons(args, closure.cdr);
            self.reg_set(Reg::E, env);
        } else {
            let old_env = self.reg_get(Reg::E);
            self.push(Reg::D, old_env);
            let old_stack = self.reg_get(Reg::S);
            self.push(Reg::D, old_stack);
            let old_code = self.reg_get(Reg::C);
            self.push(Reg::D, old_code);
            self.reg_set(Reg::S, Atom::NIL);
            self.reg_set(Reg::C, closure.car);
            // The body is saved on top of the dump so the tail-call check
            // above can recognise the active frame.
            self.push(Reg::D, closure.car);
            let env = self.storage.make_cons(args, closure.cdr);
            self.reg_set(Reg::E, env);
            let line = self.storage.make_number(self.current_line);
            let position = self.storage.make_cons(self.current_file, line);
            self.push(Reg::P, position);
        }
        Ok(())
    }

    fn op_rtn(&mut self) {
        let result = self.pop(Reg::S);
        self.pop(Reg::D); // the saved body, only needed by the tail-call check
        let code = self.pop(Reg::D);
        self.reg_set(Reg::C, code);
        let stack = self.pop(Reg::D);
        self.reg_set(Reg::S, stack);
        self.push(Reg::S, result);
        let env = self.pop(Reg::D);
        self.reg_set(Reg::E, env);
        self.pop(Reg::P);
    }

    fn op_car(&mut self) -> Result<(), EngineError> {
        let atom = self.pop(Reg::S);
        self.expect(atom.is_cons(), "#CAR: stack top was not a cons!")?;
        let value = self.storage.get_cons(atom).car;
        self.push(Reg::S, value);
        Ok(())
    }

    fn op_cdr(&mut self) -> Result<(), EngineError> {
        let atom = self.pop(Reg::S);
        self.expect(atom.is_cons(), "#CDR: stack top was not a cons!")?;
        let value = self.storage.get_cons(atom).cdr;
        self.push(Reg::S, value);
        Ok(())
    }

    /// The stack top becomes the car: `NIL <v> CONS` yields the list `(v)`,
    /// which is how call sites assemble argument lists.
    fn op_cons(&mut self) {
        let car = self.pop(Reg::S);
        let cdr = self.pop(Reg::S);
        let cell = self.storage.make_cons(car, cdr);
        self.push(Reg::S, cell);
    }

    fn op_rplcar(&mut self) -> Result<(), EngineError> {
        let element = self.pop(Reg::S);
        let cell = self.pop(Reg::S);
        self.expect(cell.is_cons(), "#RPLCAR: stack top was not a cons!")?;
        self.storage.set_car(cell, element);
        self.push(Reg::S, cell);
        Ok(())
    }

    fn op_rplcdr(&mut self) -> Result<(), EngineError> {
        let element = self.pop(Reg::S);
        let cell = self.pop(Reg::S);
        self.expect(cell.is_cons(), "#RPLCDR: stack top was not a cons!")?;
        self.storage.set_cdr(cell, element);
        self.push(Reg::S, cell);
        Ok(())
    }

    /// Appends to a list under construction. The handle on the stack is a
    /// `(start . tail)` header cell so appends stay O(1).
    fn op_chain(&mut self) -> Result<(), EngineError> {
        let element = self.pop(Reg::S);
        let header = self.pop(Reg::S);
        if header.is_nil() {
            let first = self.storage.make_cons(element, Atom::NIL);
            let header = self.storage.make_cons(first, first);
            self.push(Reg::S, header);
            return Ok(());
        }
        self.expect(header.is_cons(), "#CHAIN: stack top was not a cons!")?;
        let pinned = self.storage.ref_atom(header);
        let fresh = self.storage.make_cons(element, Atom::NIL);
        let tail = self.storage.get_cons(pinned.atom()).cdr;
        self.storage.set_cdr(tail, fresh);
        self.storage.set_cdr(pinned.atom(), fresh);
        self.push(Reg::S, pinned.atom());
        Ok(())
    }

    fn op_chain_end(&mut self) {
        let header = self.pop(Reg::S);
        if header.is_cons() {
            let list = self.storage.get_cons(header).car;
            self.push(Reg::S, list);
        } else {
            let list = self.storage.make_cons(header, Atom::NIL);
            self.push(Reg::S, list);
        }
    }

    fn op_split(&mut self) -> Result<(), EngineError> {
        let cell = self.pop(Reg::S);
        let head_pos = self.pop(Reg::C);
        let tail_pos = self.pop(Reg::C);
        if cell.is_cons() {
            // The first store may allocate frame cells; keep the pair alive
            // until both halves are written.
            let _pinned = self.storage.ref_atom(cell);
            let pair = self.storage.get_cons(cell);
            self.store(head_pos, pair.car)?;
            self.store(tail_pos, pair.cdr)?;
            self.push(Reg::S, atom::SYMBOL_TRUE);
        } else {
            self.push(Reg::S, atom::SYMBOL_FALSE);
        }
        Ok(())
    }

    fn numeric_as_f64(&self, atom: Atom) -> f64 {
        if atom.is_decimal() {
            self.storage.get_decimal(atom)
        } else {
            self.storage.get_number(atom) as f64
        }
    }

    /// Strings compare lexically, numerics numerically, everything else by
    /// the raw atom word.
    fn compare(&self, a: Atom, b: Atom) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        if a.is_string() && b.is_string() {
            self.storage.get_string(a).cmp(self.storage.get_string(b))
        } else if a.is_numeric() && b.is_numeric() {
            if a.is_decimal() || b.is_decimal() {
                self.numeric_as_f64(a)
                    .partial_cmp(&self.numeric_as_f64(b))
                    .unwrap_or(Ordering::Equal)
            } else {
                self.storage.get_number(a).cmp(&self.storage.get_number(b))
            }
        } else {
            a.raw().cmp(&b.raw())
        }
    }

    fn op_comparison(&mut self, opcode: Atom) {
        use std::cmp::Ordering::*;
        let b = self.pop(Reg::S);
        let a = self.pop(Reg::S);
        let ordering = self.compare(a, b);
        let result = match opcode {
            atom::OP_EQ => ordering == Equal,
            atom::OP_NE => ordering != Equal,
            atom::OP_LT => ordering == Less,
            atom::OP_LTQ => ordering != Greater,
            atom::OP_GT => ordering == Greater,
            _ => ordering != Less,
        };
        self.push(Reg::S, boolean(result));
    }

    fn op_add(&mut self) -> Result<(), EngineError> {
        let b = self.pop(Reg::S);
        let a = self.pop(Reg::S);
        if a.is_numeric() && b.is_numeric() {
            if a.is_decimal() || b.is_decimal() {
                let sum = self.numeric_as_f64(a) + self.numeric_as_f64(b);
                let result = self.storage.make_decimal(sum);
                self.push(Reg::S, result);
            } else {
                let x = self.storage.get_number(a);
                let y = self.storage.get_number(b);
                let sum = match x.checked_add(y) {
                    Some(sum) => sum,
                    None => return Err(self.panic("#ADD: numeric overflow!")),
                };
                let result = self.storage.make_number(sum);
                self.push(Reg::S, result);
            }
            return Ok(());
        }
        if a.is_string() || b.is_string() {
            let text = format!("{}{}", self.to_simple_string(a), self.to_simple_string(b));
            let result = self.storage.make_string(text);
            self.push(Reg::S, result);
            return Ok(());
        }
        let message = format!(
            "Invalid operands for addition: '{}' and '{}'",
            self.to_simple_string(a),
            self.to_simple_string(b)
        );
        Err(self.panic(&message))
    }

    fn op_arithmetic(&mut self, opcode: Atom) -> Result<(), EngineError> {
        let b = self.pop(Reg::S);
        let a = self.pop(Reg::S);
        self.expect(
            a.is_numeric() && b.is_numeric(),
            "Arithmetic: operands must be numbers!",
        )?;
        if a.is_decimal() || b.is_decimal() {
            let x = self.numeric_as_f64(a);
            let y = self.numeric_as_f64(b);
            if (opcode == atom::OP_DIV || opcode == atom::OP_REM) && y == 0.0 {
                return Err(self.panic("Arithmetic: division by zero!"));
            }
            let value = match opcode {
                atom::OP_SUB => x - y,
                atom::OP_MUL => x * y,
                atom::OP_DIV => x / y,
                _ => x % y,
            };
            let result = self.storage.make_decimal(value);
            self.push(Reg::S, result);
        } else {
            let x = self.storage.get_number(a);
            let y = self.storage.get_number(b);
            if (opcode == atom::OP_DIV || opcode == atom::OP_REM) && y == 0 {
                return Err(self.panic("Arithmetic: division by zero!"));
            }
            let value = match opcode {
                atom::OP_SUB => x.checked_sub(y),
                atom::OP_MUL => x.checked_mul(y),
                atom::OP_DIV => x.checked_div(y),
                _ => x.checked_rem(y),
            };
            let value = match value {
                Some(value) => value,
                None => return Err(self.panic("Arithmetic: numeric overflow!")),
            };
            let result = self.storage.make_number(value);
            self.push(Reg::S, result);
        }
        Ok(())
    }

    fn op_and(&mut self) {
        let b = self.pop(Reg::S);
        let a = self.pop(Reg::S);
        self.push(
            Reg::S,
            boolean(a == atom::SYMBOL_TRUE && b == atom::SYMBOL_TRUE),
        );
    }

    fn op_or(&mut self) {
        let b = self.pop(Reg::S);
        let a = self.pop(Reg::S);
        self.push(
            Reg::S,
            boolean(a == atom::SYMBOL_TRUE || b == atom::SYMBOL_TRUE),
        );
    }

    fn op_not(&mut self) {
        let a = self.pop(Reg::S);
        self.push(Reg::S, boolean(a != atom::SYMBOL_TRUE));
    }

    /// Concatenates two lists, or the string forms of the operands when
    /// either side is no list.
    fn op_concat(&mut self) -> Result<(), EngineError> {
        let b = self.pop(Reg::S);
        let a = self.pop(Reg::S);
        let lists = (a.is_cons() || a.is_nil()) && (b.is_cons() || b.is_nil());
        if !lists {
            let text = format!("{}{}", self.to_simple_string(a), self.to_simple_string(b));
            let result = self.storage.make_string(text);
            self.push(Reg::S, result);
            return Ok(());
        }
        let left = self.storage.ref_atom(a);
        let right = self.storage.ref_atom(b);
        let result = self.storage.ref_atom(Atom::NIL);
        let tail = self.storage.ref_atom(Atom::NIL);
        for source in [&left, &right] {
            let mut cursor = source.atom();
            while cursor.is_cons() {
                let cell = self.storage.get_cons(cursor);
                if result.atom().is_nil() {
                    let first = self.storage.make_cons(cell.car, Atom::NIL);
                    result.set(first);
                    tail.set(first);
                } else {
                    let appended = self.storage.append(tail.atom(), cell.car);
                    tail.set(appended);
                }
                cursor = cell.cdr;
            }
        }
        self.push(Reg::S, result.atom());
        Ok(())
    }

    fn op_file(&mut self) -> Result<(), EngineError> {
        let symbol = self.pop(Reg::C);
        self.expect(symbol.is_symbol(), "#FILE: code top is not a symbol!")?;
        self.current_file = symbol;
        Ok(())
    }

    fn op_line(&mut self) -> Result<(), EngineError> {
        let line = self.pop(Reg::C);
        self.expect(line.is_number(), "#LINE: code top is not a number!")?;
        self.current_line = self.storage.get_number(line);
        Ok(())
    }

    fn dispatch(&mut self, opcode: Atom) -> Result<(), EngineError> {
        match opcode {
            atom::OP_NIL => self.op_nil(),
            atom::OP_LDC => self.op_ldc(),
            atom::OP_LD => self.op_ld()?,
            atom::OP_ST => self.op_st()?,
            atom::OP_LDG => self.op_ldg()?,
            atom::OP_STG => self.op_stg()?,
            atom::OP_BT => self.op_bt(),
            atom::OP_LDF => self.op_ldf(),
            atom::OP_AP0 => self.op_ap(false)?,
            atom::OP_AP => self.op_ap(true)?,
            atom::OP_RTN => self.op_rtn(),
            atom::OP_EQ | atom::OP_NE | atom::OP_LT | atom::OP_LTQ | atom::OP_GT
            | atom::OP_GTQ => self.op_comparison(opcode),
            atom::OP_ADD => self.op_add()?,
            atom::OP_SUB | atom::OP_MUL | atom::OP_DIV | atom::OP_REM => {
                self.op_arithmetic(opcode)?
            }
            atom::OP_AND => self.op_and(),
            atom::OP_OR => self.op_or(),
            atom::OP_NOT => self.op_not(),
            atom::OP_CAR => self.op_car()?,
            atom::OP_CDR => self.op_cdr()?,
            atom::OP_CONS => self.op_cons(),
            atom::OP_RPLCAR => self.op_rplcar()?,
            atom::OP_RPLCDR => self.op_rplcdr()?,
            atom::OP_CHAIN => self.op_chain()?,
            atom::OP_CHAIN_END => self.op_chain_end(),
            atom::OP_SPLIT => self.op_split()?,
            atom::OP_CONCAT => self.op_concat()?,
            atom::OP_NOOP => {}
            atom::OP_FILE => self.op_file()?,
            atom::OP_LINE => self.op_line()?,
            _ => {
                let message = format!("Invalid op-code: {}", self.to_string(opcode));
                return Err(self.panic(&message));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Compiles `source` and queues it for evaluation. Compile errors are
    /// reported through the Interceptor; nothing is queued then.
    pub fn eval(&mut self, source: &str, filename: &str) {
        match self.compile_source(filename, source, true, false) {
            Ok(code) => {
                let code = self.storage.ref_atom(code);
                self.executions.push_back(Execution {
                    filename: filename.to_string(),
                    code,
                });
            }
            Err(_) => {
                // Already reported; the execution is not queued.
            }
        }
    }

    pub fn is_runnable(&self) -> bool {
        !self.executions.is_empty()
    }

    /// Flushes the execution queue and stops the engine.
    pub fn terminate(&mut self) {
        self.executions.clear();
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stops the dispatch loop at the next instruction boundary.
    pub fn interrupt(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// A handle that can flip the running flag from another thread.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Runs all queued executions to completion, in submission order. A
    /// panic finishes only the execution it occurred in.
    pub fn continue_evaluation(&mut self) {
        while let Some(execution) = self.executions.pop_front() {
            self.prepare_registers(execution.code.atom(), &execution.filename);
            let _ = self.run_execution();
        }
    }

    /// Compiles and runs `source`, returning the execution result. This is
    /// the embedder's one-stop entry point.
    pub fn run(&mut self, source: &str, filename: &str) -> Result<Atom, EngineError> {
        let code = self.compile_source(filename, source, true, false)?;
        self.run_code(code, filename)
    }

    /// Runs previously compiled bytecode (ending in `STOP`).
    pub fn run_code(&mut self, code: Atom, filename: &str) -> Result<Atom, EngineError> {
        let code = self.storage.ref_atom(code);
        self.prepare_registers(code.atom(), filename);
        self.run_execution()
    }

    fn prepare_registers(&mut self, code: Atom, filename: &str) {
        self.reg_set(Reg::S, Atom::NIL);
        self.reg_set(Reg::E, Atom::NIL);
        self.reg_set(Reg::C, code);
        self.reg_set(Reg::D, Atom::NIL);
        self.reg_set(Reg::P, Atom::NIL);
        self.current_file = self.storage.make_symbol(filename);
        self.current_line = 1;
        let line = self.storage.make_number(1);
        let position = self.storage.make_cons(self.current_file, line);
        self.push(Reg::P, position);
    }

    fn run_execution(&mut self) -> Result<Atom, EngineError> {
        self.instruction_counter = 0;
        self.last_status_report = 0;
        self.gc_count_at_start = self.storage.gc_count();
        self.start_time = Instant::now();
        self.running.store(true, Ordering::SeqCst);
        let outcome = self.run_loop();
        let result = self.storage.ref_atom(*outcome.as_ref().unwrap_or(&Atom::NIL));
        self.storage.gc(false, Atom::NIL, Atom::NIL);
        self.report_status();
        outcome.map(|_| result.atom())
    }

    fn run_loop(&mut self) -> Result<Atom, EngineError> {
        while self.running.load(Ordering::Relaxed) {
            let code = self.reg_get(Reg::C);
            if !code.is_cons() {
                // The code register ran dry, e.g. after a taken top-level
                // branch: the execution is finished.
                return Ok(self.head(Reg::S));
            }
            let opcode = self.pop(Reg::C);
            if opcode == atom::OP_STOP {
                return Ok(self.pop(Reg::S));
            }
            self.instruction_counter += 1;
            self.dispatch(opcode)?;
            if self.instruction_counter - self.last_status_report >= self.report_interval {
                self.report_status();
            }
        }
        Ok(Atom::NIL)
    }

    /// Calls a closure or jumps into a bytecode list, without arguments. A
    /// closure is recognised by its car being the body list; bytecode lists
    /// start with an opcode symbol.
    pub fn call_value(&mut self, value: Atom) {
        if !value.is_cons() {
            return;
        }
        let cell = self.storage.get_cons(value);
        if !cell.car.is_cons() {
            self.call(value);
            return;
        }
        let _pinned = self.storage.ref_atom(value);
        let old_env = self.reg_get(Reg::E);
        self.push(Reg::D, old_env);
        let old_stack = self.reg_get(Reg::S);
        self.push(Reg::D, old_stack);
        let old_code = self.reg_get(Reg::C);
        self.push(Reg::D, old_code);
        self.reg_set(Reg::S, Atom::NIL);
        self.reg_set(Reg::C, cell.car);
        self.push(Reg::D, cell.car);
        let env = self.storage.make_cons(Atom::NIL, cell.cdr);
        self.reg_set(Reg::E, env);
        let line = self.storage.make_number(self.current_line);
        let position = self.storage.make_cons(self.current_file, line);
        self.push(Reg::P, position);
    }

    /// Jumps into the given bytecode list, like a call without arguments.
    /// The current environment stays visible; the list is expected to end
    /// with a return.
    pub fn call(&mut self, code: Atom) {
        // The code may have no other owner yet (e.g. fresh from `compile`).
        let _pinned = self.storage.ref_atom(code);
        let env = self.reg_get(Reg::E);
        self.push(Reg::D, env);
        let stack = self.reg_get(Reg::S);
        self.push(Reg::D, stack);
        let old_code = self.reg_get(Reg::C);
        self.push(Reg::D, old_code);
        self.reg_set(Reg::S, Atom::NIL);
        self.reg_set(Reg::C, code);
        self.push(Reg::D, code);
        let line = self.storage.make_number(self.current_line);
        let position = self.storage.make_cons(self.current_file, line);
        self.push(Reg::P, position);
    }

    /// A snapshot of the running (or just finished) evaluation.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            time_ms: self.start_time.elapsed().as_millis() as u64,
            instructions: self.instruction_counter,
            gc_runs: self.storage.gc_count() - self.gc_count_at_start,
            storage: self.storage.status(),
        }
    }

    fn report_status(&mut self) {
        let status = self.status();
        self.interceptor.report_status(&status);
        self.last_status_report = self.instruction_counter;
    }

    /// Program output.
    pub fn println(&mut self, line: &str) {
        self.interceptor.println(line);
    }

    // ------------------------------------------------------------------
    // Compilation entry points
    // ------------------------------------------------------------------

    /// Compiles `source`. On errors the report goes to the Interceptor
    /// (unless `silent`) and an error is returned; the bytecode of a
    /// successful run ends with `STOP` or `RTN` depending on `insert_stop`.
    pub fn compile_source(
        &mut self,
        filename: &str,
        source: &str,
        insert_stop: bool,
        silent: bool,
    ) -> Result<Atom, EngineError> {
        let compiler = Compiler::new(self, filename, source);
        match compiler.compile(insert_stop) {
            Ok(code) => Ok(code),
            Err(errors) => {
                if !silent {
                    let report = CompileReport::new(filename, source, errors.clone());
                    let text = report.to_report_string();
                    self.interceptor.println(&text);
                }
                Err(EngineError::Compilation {
                    file: filename.to_string(),
                    errors,
                })
            }
        }
    }

    /// Registers a directory searched by `include`.
    pub fn add_source_path(&mut self, dir: impl Into<PathBuf>) {
        self.source_paths.insert(0, dir.into());
    }

    /// Resolves `file_name` against the home directory and the registered
    /// source paths, in insertion order.
    pub fn lookup_source(&self, file_name: &str) -> PathBuf {
        let direct = self.home_dir.join(file_name);
        if direct.is_file() {
            return direct;
        }
        for path in &self.source_paths {
            let candidate = path.join(file_name);
            if candidate.is_file() {
                return candidate;
            }
        }
        PathBuf::from(file_name)
    }

    pub fn compile_file(&mut self, file_name: &str, insert_stop: bool) -> Result<Atom, EngineError> {
        let path = self.lookup_source(file_name);
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(_) => {
                let message = format!("Cannot compile: {file_name}. File was not found!");
                return Err(self.panic(&message));
            }
        };
        self.compile_source(file_name, &source, insert_stop, false)
    }

    // ------------------------------------------------------------------
    // The engine parameter bag
    // ------------------------------------------------------------------

    /// Writes an engine parameter. Only `HOME_PATH` is writable; every
    /// statistic key is read only.
    pub fn set_value(&mut self, name: Atom, value: Atom) -> Result<(), EngineError> {
        if !name.is_symbol() {
            return Err(EngineError::ReadOnly(self.to_simple_string(name)));
        }
        if name == atom::KEY_HOME_PATH {
            if value.is_string() {
                self.home_dir = PathBuf::from(self.storage.get_string(value));
                return Ok(());
            }
            return Err(EngineError::ReadOnly("HOME_PATH must be a string".into()));
        }
        Err(EngineError::ReadOnly(
            self.storage.get_symbol_name(name).to_string(),
        ))
    }

    /// Reads an engine parameter; unknown keys read as NIL.
    pub fn get_value(&mut self, name: Atom) -> Atom {
        let status = self.storage.status();
        match name {
            atom::KEY_HOME_PATH => {
                let home = self.home_dir.display().to_string();
                self.storage.make_string(home)
            }
            atom::KEY_OP_COUNT => self.storage.make_number(self.instruction_counter as i64),
            atom::KEY_GC_COUNT => {
                let count = self.storage.gc_count() as i64;
                self.storage.make_number(count)
            }
            atom::KEY_GC_EFFICIENCY => {
                let efficiency = self.storage.gc_efficiency();
                self.storage.make_decimal(efficiency)
            }
            atom::KEY_NUM_GC_ROOTS => self.storage.make_number(status.num_gc_roots as i64),
            atom::KEY_NUM_SYMBOLS => self.storage.make_number(status.num_symbols as i64),
            atom::KEY_NUM_GLOBALS => self.storage.make_number(status.num_globals as i64),
            atom::KEY_NUM_TOTAL_CELLS => self.storage.make_number(status.total_cells as i64),
            atom::KEY_NUM_CELLS_USED => self.storage.make_number(status.cells_used as i64),
            atom::KEY_NUM_TOTAL_STRINGS => self.storage.make_number(status.total_strings as i64),
            atom::KEY_NUM_STRINGS_USED => self.storage.make_number(status.strings_used as i64),
            atom::KEY_NUM_TOTAL_NUMBERS => self.storage.make_number(status.total_numbers as i64),
            atom::KEY_NUM_NUMBERS_USED => self.storage.make_number(status.numbers_used as i64),
            atom::KEY_NUM_TOTAL_DECIMALS => self.storage.make_number(status.total_decimals as i64),
            atom::KEY_NUM_DECIMALS_USED => self.storage.make_number(status.decimals_used as i64),
            atom::KEY_NUM_TOTAL_REFERENCES => {
                self.storage.make_number(status.total_references as i64)
            }
            atom::KEY_NUM_REFERENCES_USED => {
                self.storage.make_number(status.references_used as i64)
            }
            atom::KEY_NUM_TOTAL_ARRAYS => self.storage.make_number(status.total_arrays as i64),
            atom::KEY_NUM_ARRAYS_USED => self.storage.make_number(status.arrays_used as i64),
            _ => Atom::NIL,
        }
    }

    // ------------------------------------------------------------------
    // Pretty printing
    // ------------------------------------------------------------------

    fn print_list(&self, atom: Atom) -> String {
        let mut buffer = String::from("(");
        let cell = self.storage.get_cons(atom);
        buffer.push_str(&self.to_string(cell.car));
        if cell.cdr.is_cons() || cell.cdr.is_nil() {
            let mut cursor = cell.cdr;
            let mut printed = 1;
            while cursor.is_cons() {
                if printed >= PRINT_LIST_LIMIT {
                    buffer.push_str(" ...");
                    cursor = Atom::NIL;
                    break;
                }
                let cell = self.storage.get_cons(cursor);
                buffer.push(' ');
                buffer.push_str(&self.to_string(cell.car));
                printed += 1;
                cursor = cell.cdr;
            }
            if !cursor.is_cons() && !cursor.is_nil() {
                buffer.push(' ');
                buffer.push_str(&self.to_string(cursor));
            }
        } else {
            buffer.push_str(" . ");
            buffer.push_str(&self.to_string(cell.cdr));
        }
        buffer.push(')');
        buffer
    }

    fn print_array(&self, atom: Atom) -> String {
        let array = self.storage.get_array(atom);
        let array = array.borrow();
        let mut buffer = String::from("[");
        for (index, element) in array.elements().iter().enumerate() {
            if index >= PRINT_LIST_LIMIT {
                buffer.push_str(" ...");
                break;
            }
            if index > 0 {
                buffer.push(' ');
            }
            buffer.push_str(&self.to_string(*element));
        }
        buffer.push(']');
        buffer
    }

    /// A re-parseable representation: strings quoted, symbols with `#`,
    /// globals with `@`, built-ins with `$`.
    pub fn to_string(&self, atom: Atom) -> String {
        if atom.is_nil() {
            return "NIL".to_string();
        }
        match atom.tag() {
            Tag::SmallNumber | Tag::LargeNumber => self.storage.get_number(atom).to_string(),
            Tag::Decimal => format!("{:?}", self.storage.get_decimal(atom)),
            Tag::Bif => format!("${}", self.get_bif_name(atom)),
            Tag::Global => format!("@{}", self.storage.get_global_name(atom)),
            Tag::String => format!("'{}'", self.storage.get_string(atom)),
            Tag::Symbol => format!("#{}", self.storage.get_symbol_name(atom)),
            Tag::Cons => self.print_list(atom),
            Tag::Reference => self.storage.get_reference(atom).describe(),
            Tag::Array => self.print_array(atom),
            Tag::Nil => "NIL".to_string(),
        }
    }

    /// The plain rendering used for program output: no quotes or sigils.
    pub fn to_simple_string(&self, atom: Atom) -> String {
        if atom.is_nil() {
            return String::new();
        }
        match atom.tag() {
            Tag::SmallNumber | Tag::LargeNumber => self.storage.get_number(atom).to_string(),
            Tag::Decimal => format!("{:?}", self.storage.get_decimal(atom)),
            Tag::Bif => self.get_bif_name(atom).to_string(),
            Tag::Global => self.storage.get_global_name(atom).to_string(),
            Tag::String => self.storage.get_string(atom).to_string(),
            Tag::Symbol => self.storage.get_symbol_name(atom).to_string(),
            Tag::Cons => self.print_list(atom),
            Tag::Reference => self.storage.get_reference(atom).describe(),
            Tag::Array => self.print_array(atom),
            Tag::Nil => String::new(),
        }
    }
}

fn boolean(value: bool) -> Atom {
    if value {
        atom::SYMBOL_TRUE
    } else {
        atom::SYMBOL_FALSE
    }
}
