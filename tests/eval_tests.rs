//! End-to-end evaluation: source text through tokenizer, compiler and VM.

mod common;

use common::{eval_lines, eval_panic, Harness};

#[test]
fn hello_prints_and_returns_nil() {
    let (lines, result) = eval_lines("println('Hello');");
    assert_eq!(lines, vec!["Hello"]);
    assert_eq!(result, "NIL");
}

#[test]
fn arithmetic_respects_precedence() {
    let (lines, _) = eval_lines("println(1 + 2 * 3);");
    assert_eq!(lines, vec!["7"]);
    let (lines, _) = eval_lines("println((1 + 2) * 3);");
    assert_eq!(lines, vec!["9"]);
    let (lines, _) = eval_lines("println(10 - 2 - 3);");
    assert_eq!(lines, vec!["5"]);
    let (lines, _) = eval_lines("println(17 % 5);");
    assert_eq!(lines, vec!["2"]);
    let (lines, _) = eval_lines("println(17 / 5);");
    assert_eq!(lines, vec!["3"]);
}

#[test]
fn decimals_propagate_through_arithmetic() {
    let (lines, _) = eval_lines("println(1.5 + 2);");
    assert_eq!(lines, vec!["3.5"]);
    let (lines, _) = eval_lines("println(7 / 2.0);");
    assert_eq!(lines, vec!["3.5"]);
}

#[test]
fn addition_concatenates_strings() {
    let (lines, _) = eval_lines("println('answer: ' + 42);");
    assert_eq!(lines, vec!["answer: 42"]);
}

#[test]
fn glued_minus_acts_as_subtraction() {
    // "1 -2" tokenizes as two numbers; the compiler rewrites the negative
    // literal into an addition.
    let (lines, _) = eval_lines("println(10 -2);");
    assert_eq!(lines, vec!["8"]);
}

#[test]
fn factorial_via_conditional_early_return() {
    let source = "fact := n -> { [n = 0 : 1]; n * fact(n - 1); }; println(fact(5));";
    let (lines, _) = eval_lines(source);
    assert_eq!(lines, vec!["120"]);
}

#[test]
fn caret_returns_early() {
    let source = "fact := n -> { [n = 0 : ^1]; n * fact(n - 1); }; println(fact(6));";
    let (lines, _) = eval_lines(source);
    assert_eq!(lines, vec!["720"]);
}

#[test]
fn inline_lists_build_in_source_order() {
    let (lines, _) = eval_lines("xs := #(1, 2, 3); println(xs);");
    assert_eq!(lines, vec!["(1 2 3)"]);
    let (lines, _) = eval_lines("println(#());");
    assert_eq!(lines, vec![""]);
    let (lines, _) = eval_lines("println(#(1 . 2));");
    assert_eq!(lines, vec!["(1 . 2)"]);
}

#[test]
fn tail_recursion_runs_unbounded_iterations() {
    let source = "loop := n -> { [n = 0 : 0] ; loop(n - 1) }; println(loop(100000));";
    let (lines, _) = eval_lines(source);
    assert_eq!(lines, vec!["0"]);
}

#[test]
fn global_mutation_is_visible_across_calls() {
    let source = "counter ::= 0; \
                  inc := () -> { counter ::= counter + 1 }; \
                  inc(); inc(); println(counter);";
    let (lines, _) = eval_lines(source);
    assert_eq!(lines, vec!["2"]);
}

#[test]
fn chained_comparison_matches_explicit_conjunction() {
    for x in [0, 1, 2, 5, 9, 10, 11] {
        let chained = format!("x := {x}; f := y -> [1 < y < 10 : 1]; println(f(x));");
        let explicit = format!("x := {x}; f := y -> [1 < y && y < 10 : 1]; println(f(x));");
        let (chained_lines, _) = eval_lines(&chained);
        let (explicit_lines, _) = eval_lines(&explicit);
        assert_eq!(chained_lines, explicit_lines, "x = {x}");
    }
}

#[test]
fn keyword_calls_join_their_selector() {
    let source = "between ::= (value, low, high) -> { [low <= value && value <= high : 'yes']; 'no'; }; \
                  check:from:to: ::= between; \
                  println(check: 5 from: 1 to: 10);";
    let (lines, _) = eval_lines(source);
    assert_eq!(lines, vec!["yes"]);
}

#[test]
fn keyword_call_arguments_arrive_in_order() {
    let source = "first:second: ::= (a, b) -> a; \
                  println(first: 1 second: 2);";
    let (lines, _) = eval_lines(source);
    assert_eq!(lines, vec!["1"]);
}

#[test]
fn multi_parameter_functions_see_their_arguments_in_order() {
    let source = "sub ::= (a, b) -> a - b; println(sub(10, 4));";
    let (lines, _) = eval_lines(source);
    assert_eq!(lines, vec!["6"]);
}

#[test]
fn local_assignments_stay_in_their_frame() {
    let source = "f := () -> { x := 41; x + 1 }; println(f()); println(typeOf(x));";
    let (lines, _) = eval_lines(source);
    // The global `x` created by the lookup was never written.
    assert_eq!(lines, vec!["42", ""]);
}

#[test]
fn split_assignment_destructures_a_cons() {
    let source = "f := xs -> { h | t := xs; println(h); println(t); }; f(#(1, 2, 3));";
    let (lines, _) = eval_lines(source);
    assert_eq!(lines, vec!["1", "(2 3)"]);
}

#[test]
fn split_assignment_reports_non_cons() {
    let source = "f := xs -> { h | t := xs; }; println(f(17));";
    let (lines, _) = eval_lines(source);
    assert_eq!(lines, vec!["FALSE"]);
}

#[test]
fn booleans_and_logic_use_the_truth_symbols() {
    let (lines, _) = eval_lines("println(1 < 2);");
    assert_eq!(lines, vec!["TRUE"]);
    let (lines, _) = eval_lines("println(!(1 < 2));");
    assert_eq!(lines, vec!["FALSE"]);
    let (lines, _) = eval_lines("println(1 < 2 && 2 < 1);");
    assert_eq!(lines, vec!["FALSE"]);
    let (lines, _) = eval_lines("println(1 < 2 || 2 < 1);");
    assert_eq!(lines, vec!["TRUE"]);
    // Non-boolean operands count as FALSE.
    let (lines, _) = eval_lines("println(1 && 1);");
    assert_eq!(lines, vec!["FALSE"]);
}

#[test]
fn strings_compare_lexically() {
    let (lines, _) = eval_lines("println('abc' < 'abd');");
    assert_eq!(lines, vec!["TRUE"]);
    let (lines, _) = eval_lines("println('same' = 'same');");
    assert_eq!(lines, vec!["TRUE"]);
    let (lines, _) = eval_lines("println('a' != 'b');");
    assert_eq!(lines, vec!["TRUE"]);
}

#[test]
fn concat_joins_lists_and_strings() {
    let (lines, _) = eval_lines("println(#(1, 2) & #(3));");
    assert_eq!(lines, vec!["(1 2 3)"]);
    let (lines, _) = eval_lines("println('foo' & 'bar');");
    assert_eq!(lines, vec!["foobar"]);
    let (lines, _) = eval_lines("println('n = ' & 42);");
    assert_eq!(lines, vec!["n = 42"]);
}

#[test]
fn inline_blocks_are_callable_values() {
    let source = "twice := f -> { call(f); call(f); }; twice({ println('tick') });";
    let (lines, _) = eval_lines(source);
    assert_eq!(lines, vec!["tick", "tick"]);
}

#[test]
fn core_bifs_cover_strings_and_types() {
    let (lines, _) = eval_lines("println(strlen('hello'));");
    assert_eq!(lines, vec!["5"]);
    let (lines, _) = eval_lines("println(substr('hello world', 7, 5));");
    assert_eq!(lines, vec!["world"]);
    // Out-of-range requests clamp instead of failing.
    let (lines, _) = eval_lines("println(substr('abc', 2, 99));");
    assert_eq!(lines, vec!["bc"]);
    let (lines, _) = eval_lines("println(typeOf('x')); println(typeOf(1)); println(typeOf(#(1, 2)));");
    assert_eq!(lines, vec!["TYPE_STRING", "TYPE_NUMBER", "TYPE_CONS"]);
    let (lines, _) = eval_lines("println(typeOf(#foo));");
    assert_eq!(lines, vec!["TYPE_SYMBOL"]);
    let (lines, _) = eval_lines("println(asString(#(1, 2)));");
    assert_eq!(lines, vec!["(1 2)"]);
    let (lines, _) = eval_lines("println(parse('42') + 1);");
    assert_eq!(lines, vec!["43"]);
    let (lines, _) = eval_lines("println(parse('2.5'));");
    assert_eq!(lines, vec!["2.5"]);
    let (lines, _) = eval_lines("println(typeOf(parse('no number')));");
    assert_eq!(lines, vec![""]);
}

#[test]
fn symbols_are_first_class_literals() {
    let (lines, _) = eval_lines("println(#foo = symbol('foo'));");
    assert_eq!(lines, vec!["TRUE"]);
}

#[test]
fn eval_and_compile_run_nested_programs() {
    let (lines, _) = eval_lines("eval('println(1 + 1);');");
    assert_eq!(lines, vec!["2"]);
    let (lines, _) = eval_lines("code := compile('println(40 + 2);'); call(code);");
    assert_eq!(lines, vec!["42"]);
    // Silent compilation of broken source yields NIL without output.
    let (lines, _) = eval_lines("println(typeOf(compile(')', #TRUE)));");
    assert_eq!(lines, vec![""]);
}

#[test]
fn arrays_grow_and_hold_values() {
    let source = "a := makeArray(2); arrayPut(a, 5, 99); \
                  println(arrayAt(a, 5)); println(arrayAt(a, 1)); println(arrayLength(a));";
    let (lines, _) = eval_lines(source);
    assert_eq!(lines, vec!["99", "", "5"]);
}

#[test]
fn engine_values_are_readable_from_the_language() {
    let (lines, _) = eval_lines("println(0 <= engineValue(#NUM_SYMBOLS));");
    assert_eq!(lines, vec!["TRUE"]);
    let panics = eval_panic("setEngineValue(#OP_COUNT, 7);");
    assert!(panics[0].contains("read only"), "got: {panics:?}");
}

#[test]
fn forced_gc_leaves_live_data_intact() {
    let source = "xs ::= #(1, 2, 3); gc(); println(xs);";
    let (lines, _) = eval_lines(source);
    assert_eq!(lines, vec!["(1 2 3)"]);
}

#[test]
fn allocation_pressure_triggers_collections_without_corruption() {
    let source = "grow := n -> { [n = 0 : 0] ; x := #(n, n, n); grow(n - 1) }; \
                  grow(5000); println('done');";
    let mut harness = Harness::new();
    harness.run(source).expect("should survive collection pressure");
    assert_eq!(harness.output(), vec!["done"]);
    assert!(harness.engine.storage().gc_count() > 0, "GC should have run");
}

#[test]
fn arithmetic_type_errors_panic() {
    let panics = eval_panic("'a' * 2;");
    assert!(panics[0].contains("Arithmetic"), "got: {panics:?}");
    let panics = eval_panic("1 / 0;");
    assert!(panics[0].contains("division by zero"), "got: {panics:?}");
}

#[test]
fn missing_bif_arguments_panic_with_the_callee_name() {
    let panics = eval_panic("strlen();");
    assert!(panics[0].contains("strlen"), "got: {panics:?}");
    let panics = eval_panic("strlen(42);");
    assert!(panics[0].contains("must be a string"), "got: {panics:?}");
}

#[test]
fn panic_reports_carry_the_source_position() {
    let mut harness = Harness::new();
    let result = harness.run("x ::= 1;\n'a' * 2;\n");
    assert!(result.is_err());
    let panics = harness.panics();
    assert!(panics[0].starts_with("test.kv:2"), "got: {panics:?}");
}

#[test]
fn compile_errors_are_collected_with_positions() {
    let mut harness = Harness::new();
    let error = harness.run("x := ;\ny := 2 +;").unwrap_err();
    match error {
        kavi::errors::EngineError::Compilation { errors, .. } => {
            assert!(!errors.is_empty());
            assert!(errors.iter().any(|e| e.line == 1));
        }
        other => panic!("expected compile errors, got {other}"),
    }
}

#[test]
fn numbers_promote_to_large_and_back() {
    let (lines, _) = eval_lines("big := 200000000 * 4; println(big); println(big - 800000000);");
    assert_eq!(lines, vec!["800000000", "0"]);
}

#[test]
fn top_level_conditional_ends_the_execution() {
    let mut harness = Harness::new();
    let result = harness.run("[1 < 2 : 'early']; println('late');").unwrap();
    assert_eq!(harness.engine.to_string(result), "'early'");
    assert_eq!(harness.output(), Vec::<String>::new());
}

#[test]
fn queued_executions_run_in_submission_order() {
    let mut harness = Harness::new();
    harness.engine.eval("println('first');", "a.kv");
    harness.engine.eval("println('second');", "b.kv");
    assert!(harness.engine.is_runnable());
    harness.engine.continue_evaluation();
    assert_eq!(harness.output(), vec!["first", "second"]);
    assert!(!harness.engine.is_runnable());
}

#[test]
fn a_panicking_execution_does_not_block_the_queue() {
    let mut harness = Harness::new();
    harness.engine.eval("1 / 0;", "bad.kv");
    harness.engine.eval("println('still here');", "good.kv");
    harness.engine.continue_evaluation();
    assert_eq!(harness.output(), vec!["still here"]);
    assert!(!harness.panics().is_empty());
}

#[test]
fn include_loads_files_from_registered_source_paths() {
    let dir = std::env::temp_dir().join(format!("kavi-include-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");
    std::fs::write(dir.join("lib.kv"), "greet ::= () -> println('from lib');")
        .expect("library file");

    let mut harness = Harness::new();
    harness.engine.add_source_path(&dir);
    harness
        .run("include('lib.kv'); greet();")
        .expect("include should run");
    assert_eq!(harness.output(), vec!["from lib"]);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn including_a_missing_file_panics() {
    let panics = eval_panic("include('no-such-file.kv');");
    assert!(panics[0].contains("no-such-file.kv"), "got: {panics:?}");
}

#[test]
fn host_references_flow_through_custom_bifs() {
    use std::any::Any;
    use std::rc::Rc;

    #[derive(Debug)]
    struct Ticket {
        id: i64,
    }

    impl kavi::storage::reference::Reference for Ticket {
        fn describe(&self) -> String {
            format!("ticket#{}", self.id)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn bif_make_ticket(ctx: &mut kavi::bif::CallContext) -> Result<(), kavi::EngineError> {
        ctx.set_reference_result(Rc::new(Ticket { id: 7 }));
        Ok(())
    }

    fn bif_ticket_id(ctx: &mut kavi::bif::CallContext) -> Result<(), kavi::EngineError> {
        let (_, reference) = ctx.fetch_typed_reference::<Ticket>()?;
        let id = reference
            .as_any()
            .downcast_ref::<Ticket>()
            .expect("checked by the fetcher")
            .id;
        ctx.set_number_result(id);
        Ok(())
    }

    let mut harness = Harness::new();
    harness.engine.register_bif("makeTicket", bif_make_ticket);
    harness.engine.register_bif("ticketId", bif_ticket_id);
    harness
        .run("t ::= makeTicket(); println(ticketId(t)); println(typeOf(t));")
        .expect("reference round trip");
    assert_eq!(harness.output(), vec!["7", "TYPE_REFERENCE"]);

    // The wrong reference type is rejected with the callee's name.
    let panics = {
        let mut harness = Harness::new();
        harness.engine.register_bif("ticketId", bif_ticket_id);
        harness
            .run("ticketId(1);")
            .expect_err("a number is not a ticket");
        harness.panics()
    };
    assert!(panics[0].contains("ticketId"), "got: {panics:?}");
}

#[test]
fn interrupting_between_instructions_stops_an_endless_loop() {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    // Flips the engine's running flag as soon as the first status report
    // arrives, stopping the loop at the next instruction boundary.
    #[derive(Default)]
    struct StopOnReport {
        flag: Rc<RefCell<Option<Arc<AtomicBool>>>>,
    }

    impl kavi::Interceptor for StopOnReport {
        fn println(&mut self, _line: &str) {}

        fn report_status(&mut self, _status: &kavi::interceptor::EngineStatus) {
            if let Some(flag) = self.flag.borrow().as_ref() {
                flag.store(false, Ordering::SeqCst);
            }
        }

        fn panic(&mut self, _file: &str, _line: i64, _message: &str, _dump: &str) {}
    }

    let interceptor = StopOnReport::default();
    let flag = Rc::clone(&interceptor.flag);
    let mut engine = kavi::Engine::new(Box::new(interceptor));
    engine.set_report_interval(10_000);
    *flag.borrow_mut() = Some(engine.interrupt_handle());

    // Tail recursion keeps the dump flat, so only the interrupt ends this.
    let result = engine.run("spin := n -> { spin(n + 1) }; spin(0);", "test.kv");
    assert!(result.is_ok());
}
