//! Bytecode emission: compiled programs are lists, so the pretty-printed
//! code is a convenient, readable assertion target.

mod common;

use common::Harness;

/// Compiles `source` and renders the emitted bytecode.
fn emit(source: &str) -> String {
    let mut harness = Harness::new();
    let code = harness
        .engine
        .compile_source("t.kv", source, true, false)
        .expect("should compile");
    harness.engine.to_string(code)
}

fn emit_errors(source: &str) -> Vec<kavi::errors::CompileError> {
    let mut harness = Harness::new();
    match harness.engine.compile_source("t.kv", source, true, true) {
        Ok(code) => panic!(
            "{source:?} should not compile, got {}",
            harness.engine.to_string(code)
        ),
        Err(kavi::errors::EngineError::Compilation { errors, .. }) => errors,
        Err(other) => panic!("unexpected error: {other}"),
    }
}

#[test]
fn literals_load_constants() {
    assert_eq!(emit("42;"), "(#FILE #t.kv #LINE 1 #LDC 42 #STOP)");
    assert_eq!(emit("'hi';"), "(#FILE #t.kv #LINE 1 #LDC 'hi' #STOP)");
    assert_eq!(emit("#foo;"), "(#FILE #t.kv #LINE 1 #LDC #foo #STOP)");
    assert_eq!(emit("2.5;"), "(#FILE #t.kv #LINE 1 #LDC 2.5 #STOP)");
}

#[test]
fn operators_emit_postfix_opcodes() {
    assert_eq!(
        emit("1 + 2 * 3;"),
        "(#FILE #t.kv #LINE 1 #LDC 1 #LDC 2 #LDC 3 #MUL #ADD #STOP)"
    );
    assert!(emit("1 = 2;").contains("#EQ"));
    assert!(emit("1 != 2;").contains("#NE"));
    assert!(emit("1 <= 2;").contains("#LTQ"));
    assert!(emit("1 >= 2;").contains("#GTQ"));
    assert!(emit("!(1 < 2);").contains("#LT #NOT"));
    assert!(emit("1 % 2;").contains("#REM"));
}

#[test]
fn negative_literal_in_additive_position_becomes_addition() {
    assert_eq!(
        emit("1 -2;"),
        "(#FILE #t.kv #LINE 1 #LDC 1 #LDC -2 #ADD #STOP)"
    );
}

#[test]
fn chained_comparisons_duplicate_the_middle_operand() {
    let code = emit("f := x -> [1 < x < 10 : 1];");
    assert!(
        code.contains("#LDC 1 #LD (1 . 1) #LT #LD (1 . 1) #LDC 10 #LT #AND"),
        "got: {code}"
    );
}

#[test]
fn top_level_assignment_becomes_global() {
    let code = emit("x := 5;");
    assert_eq!(code, "(#FILE #t.kv #LINE 1 #LDC 5 #STG @x #STOP)");
}

#[test]
fn known_built_ins_load_as_constants() {
    let code = emit("println(1);");
    assert!(
        code.contains("#NIL #LDC 1 #CONS #LDC $println #AP #println"),
        "got: {code}"
    );
}

#[test]
fn unknown_names_load_globals() {
    let code = emit("mystery;");
    assert_eq!(code, "(#FILE #t.kv #LINE 1 #LDG @mystery #STOP)");
}

#[test]
fn short_definitions_compile_to_closure_bodies() {
    let code = emit("f := n -> n;");
    assert_eq!(
        code,
        "(#FILE #t.kv #LINE 1 #LDF (#FILE #t.kv #LINE 1 #LD (1 . 1) #RTN) #STG @f #STOP)"
    );
}

#[test]
fn zero_parameter_definitions_are_supported() {
    let code = emit("f := () -> 1;");
    assert!(code.contains("#LDF (#FILE #t.kv #LINE 1 #LDC 1 #RTN)"), "got: {code}");
}

#[test]
fn call_arguments_compile_right_to_left() {
    let code = emit("f(1, 2);");
    assert!(
        code.contains("#NIL #LDC 2 #CONS #LDC 1 #CONS #LDG @f #AP #f"),
        "got: {code}"
    );
}

#[test]
fn zero_argument_calls_use_ap0() {
    let code = emit("f();");
    assert!(code.contains("#LDG @f #AP0 #f"), "got: {code}");
}

#[test]
fn keyword_calls_join_segments_into_one_selector() {
    let code = emit("from: 1 to: 2;");
    assert!(
        code.contains("#NIL #LDC 2 #CONS #LDC 1 #CONS #LDG @from:to: #AP #from:to:"),
        "got: {code}"
    );
}

#[test]
fn conditionals_branch_into_a_returning_block() {
    let code = emit("[1 = 1 : 2];");
    assert!(code.contains("#EQ #BT (#LDC 2 #RTN)"), "got: {code}");
}

#[test]
fn inline_lists_chain_in_source_order() {
    let code = emit("#(1, 2, 3);");
    assert!(
        code.contains("#NIL #LDC 1 #CHAIN #LDC 2 #CHAIN #LDC 3 #CHAIN #CHAINEND"),
        "got: {code}"
    );
    assert!(emit("#();").contains("#NIL #STOP"));
    assert!(emit("#(1 . 2);").contains("#LDC (1 . 2)"));
}

#[test]
fn split_assignment_emits_two_frame_positions() {
    let code = emit("f := x -> { h | t := x; };");
    assert!(code.contains("#SPLIT (1 . 2) (1 . 3)"), "got: {code}");
}

#[test]
fn line_markers_are_emitted_once_per_line() {
    let code = emit("1;\n2;\n");
    assert_eq!(
        code,
        "(#FILE #t.kv #LINE 1 #LDC 1 #LINE 2 #LDC 2 #STOP)"
    );
    // Statements on the same line share one marker.
    let code = emit("1; 2;");
    assert_eq!(code, "(#FILE #t.kv #LINE 1 #LDC 1 #LDC 2 #STOP)");
}

#[test]
fn function_bodies_restate_the_position() {
    let code = emit("f := n -> {\n n;\n};");
    assert!(code.contains("#LDF (#FILE #t.kv #LINE 2"), "got: {code}");
}

#[test]
fn compile_without_stop_ends_in_a_return() {
    let mut harness = Harness::new();
    let code = harness
        .engine
        .compile_source("t.kv", "1;", false, false)
        .expect("should compile");
    assert!(harness.engine.to_string(code).ends_with("#RTN)"));
}

#[test]
fn top_level_split_assignment_is_rejected() {
    let errors = emit_errors("h | t := 1;");
    assert!(
        errors[0].message.contains("top-level"),
        "got: {:?}",
        errors[0].message
    );
}

#[test]
fn unexpected_tokens_are_reported_with_positions() {
    let errors = emit_errors("x := ;");
    assert_eq!(errors[0].line, 1);
    assert!(errors[0].message.contains("Unexpected token"));
}

#[test]
fn multiple_errors_are_collected_in_one_run() {
    let errors = emit_errors("x := ;\ny := 2 +;\n");
    assert!(errors.len() >= 2, "got: {errors:?}");
    assert!(errors.iter().any(|error| error.line == 2));
}

#[test]
fn blocks_ending_in_a_stray_bracket_are_diagnosed() {
    let errors = emit_errors("f := () -> { 1 ] };");
    assert!(
        errors.iter().any(|error| error.message.contains("Missing Semicolon")),
        "got: {errors:?}"
    );
}
