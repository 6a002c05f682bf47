//! The single-pass compiler.
//!
//! A recursive-descent parser over the token stream that emits bytecode
//! directly while parsing: there is no AST. The code under construction is
//! an ordinary list in the cell heap, reached through the `code`/`tail`
//! pair of [`AtomRef`]s so a garbage collection triggered by any allocation
//! cannot sweep the half-built program away.
//!
//! Design constraints inherited from the language: no keywords, one token
//! of context plus two of lookahead suffice, and every non-terminal of the
//! grammar is one method emitting its own code.
//!
//! Errors are collected, not thrown. The compiler keeps parsing so a single
//! run reports as many problems as possible; [`Compiler::compile`] fails if
//! at least one was recorded.

use crate::atom::{self, Atom};
use crate::engine::Engine;
use crate::errors::CompileError;
use crate::storage::AtomRef;
use crate::syntax::token::{InputToken, TokenType};
use crate::syntax::Tokenizer;

pub struct Compiler<'a> {
    engine: &'a mut Engine,
    tokenizer: Tokenizer,
    source: &'a str,
    /// Head of the code list under construction.
    code: AtomRef,
    /// Last cell of the code list, for O(1) appends.
    tail: AtomRef,
    /// The file symbol emitted by `FILE` position updates.
    file: AtomRef,
    last_line: u32,
    /// Stack of frames, innermost first. Each frame lists the local names
    /// of one function in slot order.
    symbol_table: Vec<Vec<String>>,
    errors: Vec<CompileError>,
}

impl<'a> Compiler<'a> {
    pub fn new(engine: &'a mut Engine, filename: &str, source: &'a str) -> Self {
        let file_symbol = engine.storage_mut().make_symbol(filename);
        let code = engine.storage_mut().ref_atom(Atom::NIL);
        let tail = engine.storage_mut().ref_atom(Atom::NIL);
        let file = engine.storage_mut().ref_atom(file_symbol);
        Compiler {
            engine,
            tokenizer: Tokenizer::new(source, false),
            source,
            code,
            tail,
            file,
            last_line: 0,
            symbol_table: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Compiles the whole input. The program ends with `STOP` for top-level
    /// evaluation or with `RTN` when the result is meant to be called.
    ///
    /// The returned atom is not rooted; the caller pins it before the next
    /// allocation.
    pub fn compile(mut self, append_stop: bool) -> Result<Atom, Vec<CompileError>> {
        self.tokenizer.fetch();
        self.update_position(true);
        while !self.tokenizer.is_current(TokenType::Eof) {
            self.block();
            if !self.tokenizer.is_current(TokenType::Eof) {
                self.error_here("Missing Semicolon!");
            }
        }
        if append_stop {
            self.add_code(atom::OP_STOP);
        } else {
            self.add_code(atom::OP_RTN);
        }
        if self.errors.is_empty() {
            Ok(self.code.atom())
        } else {
            Err(self.errors)
        }
    }

    // ------------------------------------------------------------------
    // Emission and error plumbing
    // ------------------------------------------------------------------

    fn add_code(&mut self, atom: Atom) {
        if self.code.atom().is_nil() {
            let cell = self.engine.storage_mut().make_cons(atom, Atom::NIL);
            self.code.set(cell);
            self.tail.set(cell);
        } else {
            let appended = self.engine.storage_mut().append(self.tail.atom(), atom);
            self.tail.set(appended);
        }
    }

    fn add_error(&mut self, token: InputToken, message: String) {
        let start = byte_offset(self.source, token.absolute_offset);
        let end = byte_offset(self.source, token.absolute_offset + token.length);
        self.errors.push(CompileError {
            message,
            line: token.line,
            column: token.column,
            span: (start, end.saturating_sub(start)).into(),
        });
    }

    fn error_here(&mut self, message: impl Into<String>) {
        let token = self.tokenizer.current();
        self.add_error(token, message.into());
    }

    /// Consumes the expected token or records an error and leaves the
    /// stream where it is.
    fn expect_token(&mut self, token_type: TokenType, rendering: &str) {
        if self.tokenizer.is_current(token_type) {
            self.tokenizer.fetch();
        } else {
            let text = self.tokenizer.current_text();
            self.error_here(format!("Unexpected token: {text}. Expected: {rendering}"));
        }
    }

    /// Emits `FILE`/`LINE` markers. Unforced updates only fire when the
    /// line actually changed, which also swallows the duplicate `LINE`
    /// emissions back-to-back statements would otherwise produce.
    fn update_position(&mut self, force: bool) {
        let line = self.tokenizer.current().line;
        if force {
            self.add_code(atom::OP_FILE);
            let file = self.file.atom();
            self.add_code(file);
            self.add_code(atom::OP_LINE);
            let number = self.engine.storage_mut().make_number(line as i64);
            self.add_code(number);
        } else if self.last_line != line {
            self.add_code(atom::OP_LINE);
            let number = self.engine.storage_mut().make_number(line as i64);
            self.add_code(number);
        }
        self.last_line = line;
    }

    // ------------------------------------------------------------------
    // Symbol table
    // ------------------------------------------------------------------

    /// Searches the frames innermost-first; indices are 1-based.
    fn find_symbol(&self, name: &str) -> Option<(usize, usize)> {
        for (major, frame) in self.symbol_table.iter().enumerate() {
            if let Some(minor) = frame.iter().position(|n| n == name) {
                return Some((major + 1, minor + 1));
            }
        }
        None
    }

    /// Slot of `name` in the innermost frame, appending it when new.
    fn frame_slot(&mut self, name: &str) -> usize {
        let frame = &mut self.symbol_table[0];
        match frame.iter().position(|n| n == name) {
            Some(index) => index + 1,
            None => {
                frame.push(name.to_string());
                frame.len()
            }
        }
    }

    fn emit_position(&mut self, major: usize, minor: usize) {
        let major_atom = self.engine.storage_mut().make_number(major as i64);
        let minor_atom = self.engine.storage_mut().make_number(minor as i64);
        let pair = self.engine.storage_mut().make_cons(major_atom, minor_atom);
        self.add_code(pair);
    }

    // ------------------------------------------------------------------
    // Grammar
    // ------------------------------------------------------------------

    fn block(&mut self) {
        self.statement();
        while !self.tokenizer.is_current(TokenType::RCurly)
            && !self.tokenizer.is_current(TokenType::RBracket)
            && !self.tokenizer.is_current(TokenType::Eof)
        {
            if self.tokenizer.is_current(TokenType::Semicolon) {
                self.tokenizer.fetch();
            } else {
                self.statement();
            }
        }
    }

    fn statement(&mut self) {
        self.update_position(false);
        self.expression();
    }

    fn expression(&mut self) {
        let parenthesised_params = self.tokenizer.is_current(TokenType::LParen)
            && ((self.tokenizer.is_lookahead(TokenType::Name)
                && self.tokenizer.is_lookahead2(TokenType::Comma))
                || (self.tokenizer.is_lookahead(TokenType::RParen)
                    && self.tokenizer.is_lookahead2(TokenType::Arrow)));
        if parenthesised_params {
            self.normal_definition();
        } else if self.tokenizer.is_current(TokenType::Name)
            && self.tokenizer.is_lookahead(TokenType::Arrow)
        {
            self.short_definition();
        } else if self.tokenizer.is_current(TokenType::LBracket) {
            self.conditional();
        } else if self.tokenizer.is_current(TokenType::LCurly) {
            self.inline_definition();
        } else {
            self.basic_exp();
        }
    }

    /// `(a, b) -> body` and `() -> body`.
    fn normal_definition(&mut self) {
        self.tokenizer.fetch(); // (
        let mut symbols = Vec::new();
        if !self.tokenizer.is_current(TokenType::RParen) {
            symbols.push(self.tokenizer.current_text());
            self.tokenizer.fetch();
            while self.tokenizer.is_current(TokenType::Comma) {
                self.tokenizer.fetch();
                symbols.push(self.tokenizer.current_text());
                self.tokenizer.fetch();
            }
        }
        self.expect_token(TokenType::RParen, ")");
        self.expect_token(TokenType::Arrow, "->");
        self.definition_body(symbols);
    }

    /// `x -> body`.
    fn short_definition(&mut self) {
        let symbols = vec![self.tokenizer.current_text()];
        self.tokenizer.fetch(); // parameter name
        self.expect_token(TokenType::Arrow, "->");
        self.definition_body(symbols);
    }

    fn definition_body(&mut self, symbols: Vec<String>) {
        self.symbol_table.insert(0, symbols);
        let mut brackets = false;
        if self.tokenizer.is_current(TokenType::LCurly) {
            self.tokenizer.fetch();
            brackets = true;
        }
        self.add_code(atom::OP_LDF);
        self.generate_function_code(brackets, true);
        self.symbol_table.remove(0);
    }

    /// `{ block }` or `{ a, b -> block }`: an anonymous function value.
    fn inline_definition(&mut self) {
        self.tokenizer.fetch(); // {
        let mut symbols = Vec::new();
        if self.tokenizer.is_current(TokenType::Name)
            && (self.tokenizer.is_lookahead(TokenType::Arrow)
                || self.tokenizer.is_lookahead(TokenType::Comma))
        {
            symbols.push(self.tokenizer.current_text());
            self.tokenizer.fetch();
            while self.tokenizer.is_current(TokenType::Comma) {
                self.tokenizer.fetch();
                symbols.push(self.tokenizer.current_text());
                self.tokenizer.fetch();
            }
            self.expect_token(TokenType::Arrow, "->");
        }
        self.symbol_table.insert(0, symbols);
        self.add_code(atom::OP_LDF);
        self.generate_function_code(true, true);
        self.symbol_table.remove(0);
    }

    /// `[cond : block]`. The branch replaces the remaining code when taken,
    /// so it is compiled like a body: it ends with `RTN` and returns its
    /// value from the enclosing function.
    fn conditional(&mut self) {
        self.expect_token(TokenType::LBracket, "[");
        self.update_position(false);
        self.basic_exp();
        self.add_code(atom::OP_BT);
        self.expect_token(TokenType::Colon, ":");
        let backup_code = self.engine.storage_mut().ref_atom(self.code.atom());
        let backup_tail = self.engine.storage_mut().ref_atom(self.tail.atom());
        self.code.set(Atom::NIL);
        self.tail.set(Atom::NIL);
        self.block();
        self.add_code(atom::OP_RTN);
        if !self.tokenizer.is_current(TokenType::RBracket) {
            self.error_here("Missing Semicolon!");
        }
        self.expect_token(TokenType::RBracket, "]");
        let branch = self.code.atom();
        self.code.set(backup_code.atom());
        self.tail.set(backup_tail.atom());
        self.add_code(branch);
    }

    /// Compiles a function body into its own list and appends that list as
    /// one inline operand (for `LDF`).
    fn generate_function_code(&mut self, expect_bracket: bool, as_sublist: bool) {
        let backup_code = self.engine.storage_mut().ref_atom(self.code.atom());
        let backup_tail = self.engine.storage_mut().ref_atom(self.tail.atom());
        if as_sublist {
            self.code.set(Atom::NIL);
            self.tail.set(Atom::NIL);
        }
        self.update_position(true);
        if expect_bracket {
            while !self.tokenizer.is_current(TokenType::RCurly)
                && !self.tokenizer.is_current(TokenType::Eof)
            {
                self.block();
                if !self.tokenizer.is_current(TokenType::RCurly) {
                    self.error_here("Missing Semicolon!");
                }
            }
            self.expect_token(TokenType::RCurly, "}");
        } else {
            self.statement();
        }
        self.add_code(atom::OP_RTN);
        if as_sublist {
            let function = self.code.atom();
            self.code.set(backup_code.atom());
            self.tail.set(backup_tail.atom());
            self.add_code(function);
        }
    }

    /// `&&` and `||`.
    fn basic_exp(&mut self) {
        self.log_exp();
        loop {
            if self.tokenizer.is_current(TokenType::And) {
                self.tokenizer.fetch();
                self.log_exp();
                self.add_code(atom::OP_AND);
            } else if self.tokenizer.is_current(TokenType::Or) {
                self.tokenizer.fetch();
                self.log_exp();
                self.add_code(atom::OP_OR);
            } else {
                return;
            }
        }
    }

    /// `+`, `-` and `&` (concatenation). A numeric token with a negative
    /// value in this position is the tokenizer having glued a sign to the
    /// literal; it is rewritten into an addition.
    fn log_exp(&mut self) {
        self.rel_exp();
        loop {
            if self.tokenizer.is_current(TokenType::Plus) {
                self.tokenizer.fetch();
                self.rel_exp();
                self.add_code(atom::OP_ADD);
            } else if self.tokenizer.is_current(TokenType::Concat) {
                self.tokenizer.fetch();
                self.rel_exp();
                self.add_code(atom::OP_CONCAT);
            } else if self.tokenizer.is_current(TokenType::Minus) {
                self.tokenizer.fetch();
                self.rel_exp();
                self.add_code(atom::OP_SUB);
            } else if self.tokenizer.is_current(TokenType::Number)
                && self
                    .tokenizer
                    .current_text()
                    .parse::<i64>()
                    .is_ok_and(|value| value < 0)
            {
                self.add_code(atom::OP_LDC);
                let value = self.tokenizer.current_text().parse::<i64>().unwrap_or(0);
                let number = self.engine.storage_mut().make_number(value);
                self.add_code(number);
                self.add_code(atom::OP_ADD);
                self.tokenizer.fetch();
            } else {
                return;
            }
        }
    }

    /// Relational operators. Chains like `1 < x < 10` duplicate the middle
    /// operand and conjoin: `1 < x && x < 10`.
    fn rel_exp(&mut self) {
        self.term_exp();
        let mut last_start = Atom::NIL;
        let mut last_end = Atom::NIL;
        loop {
            let opcode = match self.tokenizer.current().token_type {
                TokenType::Eq => atom::OP_EQ,
                TokenType::Ne => atom::OP_NE,
                TokenType::Lt => atom::OP_LT,
                TokenType::LtEq => atom::OP_LTQ,
                TokenType::Gt => atom::OP_GT,
                TokenType::GtEq => atom::OP_GTQ,
                _ => return,
            };
            self.tokenizer.fetch();
            let conjunction = !last_start.is_nil();
            if conjunction {
                let mut cursor = self.engine.storage().get_cons(last_start).cdr;
                while cursor.is_cons() && cursor != last_end {
                    let cell = self.engine.storage().get_cons(cursor);
                    self.add_code(cell.car);
                    cursor = cell.cdr;
                }
            }
            last_start = self.tail.atom();
            self.term_exp();
            self.add_code(opcode);
            last_end = self.tail.atom();
            if conjunction {
                self.add_code(atom::OP_AND);
            }
        }
    }

    /// `*`, `/` and `%`.
    fn term_exp(&mut self) {
        self.factor_exp();
        loop {
            if self.tokenizer.is_current(TokenType::Mul) {
                self.tokenizer.fetch();
                self.factor_exp();
                self.add_code(atom::OP_MUL);
            } else if self.tokenizer.is_current(TokenType::Div) {
                self.tokenizer.fetch();
                self.factor_exp();
                self.add_code(atom::OP_DIV);
            } else if self.tokenizer.is_current(TokenType::Mod) {
                self.tokenizer.fetch();
                self.factor_exp();
                self.add_code(atom::OP_REM);
            } else {
                return;
            }
        }
    }

    fn factor_exp(&mut self) {
        if self.tokenizer.is_current(TokenType::LParen) {
            self.tokenizer.fetch();
            self.expression();
            self.expect_token(TokenType::RParen, ")");
        } else if self.tokenizer.is_current(TokenType::Not) {
            self.tokenizer.fetch();
            self.factor_exp();
            self.add_code(atom::OP_NOT);
        } else if self.tokenizer.is_current(TokenType::Symbol)
            || self.tokenizer.is_current(TokenType::Str)
            || self.tokenizer.is_current(TokenType::Decimal)
            || self.tokenizer.is_current(TokenType::Number)
        {
            self.literal();
        } else if self.tokenizer.is_current(TokenType::ListStart) {
            self.inline_list();
        } else if self.tokenizer.is_current(TokenType::Caret) {
            self.rtn_statement();
        } else if self.tokenizer.is_current(TokenType::Name) {
            if self.tokenizer.is_lookahead(TokenType::LParen) {
                self.call();
            } else if self.tokenizer.is_lookahead(TokenType::Assignment) {
                self.local_assignment();
            } else if self.tokenizer.is_lookahead(TokenType::GlobalAssignment) {
                self.global_assignment();
            } else if self.tokenizer.is_lookahead(TokenType::Split) {
                self.split_assignment();
            } else if self.tokenizer.current_text().ends_with(':')
                && !self.tokenizer.is_lookahead(TokenType::RParen)
                && !self.tokenizer.is_lookahead(TokenType::RBracket)
                && !self.tokenizer.is_lookahead(TokenType::Comma)
                && !self.tokenizer.is_lookahead(TokenType::Eof)
                && !self.tokenizer.is_lookahead(TokenType::Semicolon)
            {
                self.call();
            } else {
                self.variable();
            }
        } else {
            let text = self.tokenizer.current_text();
            self.error_here(format!("Unexpected token: {text}"));
            self.tokenizer.fetch();
        }
    }

    /// `#(a, b, c)` and the dotted pair `#(a . b)`. The list form is built
    /// in source order via `CHAIN`.
    fn inline_list(&mut self) {
        self.tokenizer.fetch(); // #(
        if self.tokenizer.is_current(TokenType::RParen) {
            self.tokenizer.fetch();
            self.add_code(atom::OP_NIL);
            return;
        }
        if self.tokenizer.is_lookahead(TokenType::Dot) {
            let car = self.compile_literal();
            self.tokenizer.fetch(); // .
            let cdr = self.compile_literal();
            self.add_code(atom::OP_LDC);
            let pair = self.engine.storage_mut().make_cons(car, cdr);
            self.add_code(pair);
        } else {
            self.add_code(atom::OP_NIL);
            while !self.tokenizer.is_current(TokenType::RParen)
                && !self.tokenizer.is_current(TokenType::Eof)
            {
                self.expression();
                self.add_code(atom::OP_CHAIN);
                if self.tokenizer.is_current(TokenType::Comma) {
                    self.tokenizer.fetch();
                }
            }
            self.add_code(atom::OP_CHAIN_END);
        }
        self.expect_token(TokenType::RParen, ")");
    }

    /// Turns the current literal token into an atom, without emitting code.
    fn compile_literal(&mut self) -> Atom {
        let text = self.tokenizer.current_text();
        let result = match self.tokenizer.current().token_type {
            TokenType::Symbol => self.engine.storage_mut().make_symbol(&text[1..]),
            TokenType::Str => {
                let mut chars: Vec<char> = text.chars().collect();
                if chars.len() >= 2 && chars.last() == Some(&'\'') {
                    chars.pop();
                }
                if !chars.is_empty() {
                    chars.remove(0);
                }
                let inner: String = chars.into_iter().collect();
                let unescaped = unescape(&inner);
                self.engine.storage_mut().make_string(unescaped)
            }
            TokenType::Number => match text.parse::<i64>() {
                Ok(value) => self.engine.storage_mut().make_number(value),
                Err(_) => {
                    self.error_here(format!("Invalid number: {text}"));
                    Atom::NIL
                }
            },
            TokenType::Decimal => match text.parse::<f64>() {
                Ok(value) => self.engine.storage_mut().make_decimal(value),
                Err(_) => {
                    self.error_here(format!("Invalid decimal number: {text}"));
                    Atom::NIL
                }
            },
            _ => {
                self.error_here("Unexpected token! Expected a literal.");
                Atom::NIL
            }
        };
        self.tokenizer.fetch();
        result
    }

    fn literal(&mut self) {
        self.add_code(atom::OP_LDC);
        let value = self.compile_literal();
        self.add_code(value);
    }

    fn variable(&mut self) {
        let name = self.tokenizer.current_text();
        self.tokenizer.fetch();
        self.load(&name);
    }

    /// Emits the load for a name: local slot, then built-in function, then
    /// global (created on first use).
    fn load(&mut self, name: &str) {
        if let Some((major, minor)) = self.find_symbol(name) {
            self.add_code(atom::OP_LD);
            self.emit_position(major, minor);
            return;
        }
        let symbol = self.engine.storage_mut().make_symbol(name);
        match self.engine.find_built_in_function(symbol) {
            Some(bif) => {
                self.add_code(atom::OP_LDC);
                self.add_code(bif);
            }
            None => {
                let global = self.engine.storage_mut().find_global(symbol);
                self.add_code(atom::OP_LDG);
                self.add_code(global);
            }
        }
    }

    fn call(&mut self) {
        if self.tokenizer.current_text().ends_with(':') {
            self.colon_call();
        } else {
            self.standard_call();
        }
    }

    /// Compiles one argument into a detached list and prepends it to the
    /// argument code collected so far. Arguments therefore evaluate
    /// right-to-left and the `CONS` chain yields the list in argument
    /// order.
    fn compile_argument(&mut self, args_code: &AtomRef, args_tail: &AtomRef) {
        self.code.set(Atom::NIL);
        self.tail.set(Atom::NIL);
        self.expression();
        self.add_code(atom::OP_CONS);
        if args_code.atom().is_nil() {
            args_code.set(self.code.atom());
            args_tail.set(self.tail.atom());
        } else {
            self.engine
                .storage_mut()
                .set_cdr(self.tail.atom(), args_code.atom());
            args_code.set(self.code.atom());
        }
    }

    fn standard_call(&mut self) {
        let name = self.tokenizer.current_text();
        self.tokenizer.fetch(); // name
        self.tokenizer.fetch(); // (
        if self.tokenizer.is_current(TokenType::RParen) {
            self.tokenizer.fetch();
            self.load(&name);
            self.add_code(atom::OP_AP0);
            let symbol = self.engine.storage_mut().make_symbol(&name);
            self.add_code(symbol);
            return;
        }
        self.add_code(atom::OP_NIL);
        let backup_code = self.engine.storage_mut().ref_atom(self.code.atom());
        let backup_tail = self.engine.storage_mut().ref_atom(self.tail.atom());
        let args_code = self.engine.storage_mut().ref_atom(Atom::NIL);
        let args_tail = self.engine.storage_mut().ref_atom(Atom::NIL);
        while !self.tokenizer.is_current(TokenType::RParen)
            && !self.tokenizer.is_current(TokenType::Eof)
        {
            self.compile_argument(&args_code, &args_tail);
            if self.tokenizer.is_current(TokenType::Comma) {
                self.tokenizer.fetch();
            }
        }
        self.expect_token(TokenType::RParen, ")");
        self.code.set(backup_code.atom());
        self.engine
            .storage_mut()
            .set_cdr(backup_tail.atom(), args_code.atom());
        self.tail.set(args_tail.atom());
        self.load(&name);
        self.add_code(atom::OP_AP);
        let symbol = self.engine.storage_mut().make_symbol(&name);
        self.add_code(symbol);
    }

    /// `if: c then: a else: b` — the joined selector `if:then:else:` is one
    /// symbol, the argument after each segment one list element.
    fn colon_call(&mut self) {
        let mut name = String::new();
        self.add_code(atom::OP_NIL);
        let backup_code = self.engine.storage_mut().ref_atom(self.code.atom());
        let backup_tail = self.engine.storage_mut().ref_atom(self.tail.atom());
        let args_code = self.engine.storage_mut().ref_atom(Atom::NIL);
        let args_tail = self.engine.storage_mut().ref_atom(Atom::NIL);
        while self.tokenizer.is_current(TokenType::Name)
            && self.tokenizer.current_text().ends_with(':')
        {
            name.push_str(&self.tokenizer.current_text());
            self.tokenizer.fetch();
            self.compile_argument(&args_code, &args_tail);
        }
        self.code.set(backup_code.atom());
        self.engine
            .storage_mut()
            .set_cdr(backup_tail.atom(), args_code.atom());
        self.tail.set(args_tail.atom());
        self.load(&name);
        self.add_code(atom::OP_AP);
        let symbol = self.engine.storage_mut().make_symbol(&name);
        self.add_code(symbol);
    }

    /// `h | t := e` destructures a cons into two slots of the innermost
    /// frame.
    fn split_assignment(&mut self) {
        if self.symbol_table.is_empty() {
            self.error_here("Split-assignments are not allowed on top-level!");
            self.tokenizer.fetch(); // head name
            self.tokenizer.fetch(); // |
            self.tokenizer.fetch(); // tail name
            self.expect_token(TokenType::Assignment, ":=");
            return;
        }
        let head_name = self.tokenizer.current_text();
        self.tokenizer.fetch(); // head name
        self.tokenizer.fetch(); // |
        let tail_name = self.tokenizer.current_text();
        self.tokenizer.fetch(); // tail name
        self.expect_token(TokenType::Assignment, ":=");
        let head_minor = self.frame_slot(&head_name);
        let tail_minor = self.frame_slot(&tail_name);
        self.factor_exp();
        self.add_code(atom::OP_SPLIT);
        self.emit_position(1, head_minor);
        self.emit_position(1, tail_minor);
    }

    /// `^e` returns from the enclosing function.
    fn rtn_statement(&mut self) {
        self.expect_token(TokenType::Caret, "^");
        self.expression();
        self.add_code(atom::OP_RTN);
    }

    /// `x := e`. On top level there is no frame, so the assignment is
    /// silently rewritten as a global one.
    fn local_assignment(&mut self) {
        if self.symbol_table.is_empty() {
            self.global_assignment();
            return;
        }
        let name = self.tokenizer.current_text();
        self.tokenizer.fetch(); // name
        self.tokenizer.fetch(); // :=
        let (major, minor) = match self.find_symbol(&name) {
            Some(position) => position,
            None => (1, self.frame_slot(&name)),
        };
        self.expression();
        self.add_code(atom::OP_ST);
        self.emit_position(major, minor);
    }

    /// `x ::= e`. When `x` is bound locally the store targets the local
    /// slot; otherwise a global cell is created or reused.
    fn global_assignment(&mut self) {
        let name = self.tokenizer.current_text();
        self.tokenizer.fetch(); // name
        self.tokenizer.fetch(); // ::= (or := on top level)
        self.expression();
        match self.find_symbol(&name) {
            Some((major, minor)) => {
                self.add_code(atom::OP_ST);
                self.emit_position(major, minor);
            }
            None => {
                let symbol = self.engine.storage_mut().make_symbol(&name);
                let global = self.engine.storage_mut().find_global(symbol);
                self.add_code(atom::OP_STG);
                self.add_code(global);
            }
        }
    }
}

/// Resolves the escapes the tokenizer left in place: `\n` and `\t` become
/// control characters, any other escaped character stands for itself.
fn unescape(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some(other) => result.push(other),
                None => {}
            }
        } else {
            result.push(ch);
        }
    }
    result
}

/// Converts a character offset into a byte offset for diagnostic spans.
fn byte_offset(source: &str, char_offset: usize) -> usize {
    source
        .char_indices()
        .nth(char_offset)
        .map(|(index, _)| index)
        .unwrap_or(source.len())
}
