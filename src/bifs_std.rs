//! The core library of built-in functions.
//!
//! Everything here goes through the [`CallContext`] fetchers, so argument
//! errors carry the function name the compiler wrote into the call site.
//! [`register_core_bifs`] is called once while the engine is constructed;
//! hosts may register further functions afterwards.

use crate::atom::{self, Atom, Tag};
use crate::bif::CallContext;
use crate::engine::Engine;
use crate::errors::EngineError;

pub fn register_core_bifs(engine: &mut Engine) {
    // Type system
    engine.register_bif("typeOf", bif_type_of);
    engine.register_bif("symbol", bif_symbol);
    engine.register_bif("asString", bif_as_string);
    engine.register_bif("parse", bif_parse);

    // Compilation and evaluation
    engine.register_bif("compile", bif_compile);
    engine.register_bif("eval", bif_eval);
    engine.register_bif("include", bif_include);
    engine.register_bif("call", bif_call);

    // Strings
    engine.register_bif("println", bif_println);
    engine.register_bif("strlen", bif_strlen);
    engine.register_bif("substr", bif_substr);

    // Arrays
    engine.register_bif("makeArray", bif_make_array);
    engine.register_bif("arrayAt", bif_array_at);
    engine.register_bif("arrayPut", bif_array_put);
    engine.register_bif("arrayLength", bif_array_length);

    // Engine introspection
    engine.register_bif("engineValue", bif_engine_value);
    engine.register_bif("setEngineValue", bif_set_engine_value);
    engine.register_bif("gc", bif_gc);
}

/// Returns the TYPE_* symbol matching the argument's tag; NIL for NIL.
fn bif_type_of(ctx: &mut CallContext) -> Result<(), EngineError> {
    let argument = ctx.fetch_argument()?;
    let result = match argument.tag() {
        Tag::Nil => Atom::NIL,
        Tag::Symbol => atom::SYMBOL_TYPE_SYMBOL,
        Tag::SmallNumber | Tag::LargeNumber => atom::SYMBOL_TYPE_NUMBER,
        Tag::Cons => atom::SYMBOL_TYPE_CONS,
        Tag::Bif => atom::SYMBOL_TYPE_BIF,
        Tag::Global => atom::SYMBOL_TYPE_GLOBAL,
        Tag::String => atom::SYMBOL_TYPE_STRING,
        Tag::Decimal => atom::SYMBOL_TYPE_DECIMAL,
        Tag::Reference => atom::SYMBOL_TYPE_REFERENCE,
        // Arrays came later; their marker is interned on first use.
        Tag::Array => ctx.engine.storage_mut().make_symbol("TYPE_ARRAY"),
    };
    ctx.set_result(result);
    Ok(())
}

/// Interns a string as a symbol.
fn bif_symbol(ctx: &mut CallContext) -> Result<(), EngineError> {
    let name = ctx.fetch_string()?;
    let symbol = ctx.engine.storage_mut().make_symbol(&name);
    ctx.set_result(symbol);
    Ok(())
}

fn bif_as_string(ctx: &mut CallContext) -> Result<(), EngineError> {
    let argument = ctx.fetch_argument()?;
    let text = ctx.engine.to_simple_string(argument);
    ctx.set_string_result(text);
    Ok(())
}

/// Parses a string into a number, trying the integer reading first. An
/// unparseable string yields NIL so programs can test the outcome.
fn bif_parse(ctx: &mut CallContext) -> Result<(), EngineError> {
    let text = ctx.fetch_string()?;
    if let Ok(value) = text.parse::<i64>() {
        ctx.set_number_result(value);
    } else if let Ok(value) = text.parse::<f64>() {
        ctx.set_double_result(value);
    }
    Ok(())
}

/// Compiles the given source and returns the bytecode list; NIL when the
/// compilation failed. A TRUE second argument suppresses error output.
fn bif_compile(ctx: &mut CallContext) -> Result<(), EngineError> {
    let source = ctx.fetch_string()?;
    let mut silent = false;
    if ctx.has_more_arguments() {
        silent = ctx.fetch_argument()? == atom::SYMBOL_TRUE;
    }
    match ctx.engine.compile_source("(eval)", &source, false, silent) {
        Ok(code) => ctx.set_result(code),
        Err(_) => ctx.set_result(Atom::NIL),
    }
    Ok(())
}

/// Compiles the given source and jumps into it.
fn bif_eval(ctx: &mut CallContext) -> Result<(), EngineError> {
    let source = ctx.fetch_string()?;
    let mut silent = false;
    if ctx.has_more_arguments() {
        silent = ctx.fetch_argument()? == atom::SYMBOL_TRUE;
    }
    if let Ok(code) = ctx.engine.compile_source("(eval)", &source, false, silent) {
        if !code.is_nil() {
            ctx.engine.call(code);
        }
    }
    Ok(())
}

/// Compiles a source file found on the search path and jumps into it.
fn bif_include(ctx: &mut CallContext) -> Result<(), EngineError> {
    let file = ctx.fetch_string()?;
    match ctx.engine.compile_file(&file, false) {
        Ok(code) => {
            if !code.is_nil() {
                ctx.engine.call(code);
            }
            Ok(())
        }
        Err(error @ EngineError::Panic(_)) => Err(error),
        // Compile errors were already reported; the include yields NIL.
        Err(_) => Ok(()),
    }
}

/// Calls a closure or jumps into a bytecode list, without arguments.
fn bif_call(ctx: &mut CallContext) -> Result<(), EngineError> {
    let code = ctx.fetch_list()?;
    ctx.engine.call_value(code);
    Ok(())
}

fn bif_println(ctx: &mut CallContext) -> Result<(), EngineError> {
    let argument = ctx.fetch_argument()?;
    let text = ctx.engine.to_simple_string(argument);
    ctx.engine.println(&text);
    Ok(())
}

fn bif_strlen(ctx: &mut CallContext) -> Result<(), EngineError> {
    let text = ctx.fetch_string()?;
    ctx.set_number_result(text.chars().count() as i64);
    Ok(())
}

/// `substr(string, start, length)` with a 1-based start; both the start and
/// the length clamp to the string bounds.
fn bif_substr(ctx: &mut CallContext) -> Result<(), EngineError> {
    let text = ctx.fetch_string()?;
    let start = ctx.fetch_number()?;
    let length = ctx.fetch_number()?;
    let chars: Vec<char> = text.chars().collect();
    let from = ((start - 1).max(0) as usize).min(chars.len());
    let take = (length.max(0) as usize).min(chars.len() - from);
    let result: String = chars[from..from + take].iter().collect();
    ctx.set_string_result(result);
    Ok(())
}

fn bif_make_array(ctx: &mut CallContext) -> Result<(), EngineError> {
    let size = ctx.fetch_number()?;
    if size < 0 {
        let message = format!("makeArray: the size must not be negative (got {size})!");
        return Err(ctx.engine.panic(&message));
    }
    let array = ctx.engine.storage_mut().make_array(size as usize);
    ctx.set_result(array);
    Ok(())
}

fn bif_array_at(ctx: &mut CallContext) -> Result<(), EngineError> {
    let (_, array) = ctx.fetch_array()?;
    let index = ctx.fetch_number()?;
    if index < 1 {
        let message = format!("arrayAt: indices start at 1 (got {index})!");
        return Err(ctx.engine.panic(&message));
    }
    let value = array.borrow_mut().at(index as usize);
    ctx.set_result(value);
    Ok(())
}

/// Writes an array slot and returns the array, so stores chain.
fn bif_array_put(ctx: &mut CallContext) -> Result<(), EngineError> {
    let (atom, array) = ctx.fetch_array()?;
    let index = ctx.fetch_number()?;
    let value = ctx.fetch_argument()?;
    if index < 1 {
        let message = format!("arrayPut: indices start at 1 (got {index})!");
        return Err(ctx.engine.panic(&message));
    }
    array.borrow_mut().put(index as usize, value);
    ctx.set_result(atom);
    Ok(())
}

fn bif_array_length(ctx: &mut CallContext) -> Result<(), EngineError> {
    let (_, array) = ctx.fetch_array()?;
    let length = array.borrow().len() as i64;
    ctx.set_number_result(length);
    Ok(())
}

/// Reads a slot of the engine parameter bag (`engineValue(#GC_COUNT)`).
fn bif_engine_value(ctx: &mut CallContext) -> Result<(), EngineError> {
    let name = ctx.fetch_argument()?;
    if !name.is_symbol() {
        let message = "engineValue: the parameter name must be a symbol!";
        return Err(ctx.engine.panic(message));
    }
    let value = ctx.engine.get_value(name);
    ctx.set_result(value);
    Ok(())
}

/// Writes a slot of the engine parameter bag; statistics are read only.
fn bif_set_engine_value(ctx: &mut CallContext) -> Result<(), EngineError> {
    let name = ctx.fetch_argument()?;
    let value = ctx.fetch_argument()?;
    if !name.is_symbol() {
        let message = "setEngineValue: the parameter name must be a symbol!";
        return Err(ctx.engine.panic(message));
    }
    if let Err(error) = ctx.engine.set_value(name, value) {
        let message = error.to_string();
        return Err(ctx.engine.panic(&message));
    }
    Ok(())
}

/// Forces a major collection.
fn bif_gc(ctx: &mut CallContext) -> Result<(), EngineError> {
    ctx.engine.storage_mut().gc(true, Atom::NIL, Atom::NIL);
    Ok(())
}
