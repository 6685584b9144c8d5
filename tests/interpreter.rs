//! In-process integration tests that drive the library API directly, with
//! `print` output captured through the VM's output stream.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use lox::{InterpretError, RuntimeConfig, Vm};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run_with_config(source: &str, config: RuntimeConfig) -> Result<String, InterpretError> {
    let buffer = SharedBuf::default();
    let mut vm = Vm::with_output(config, Box::new(buffer.clone()));
    vm.interpret(source)?;
    let bytes = buffer.0.lock().unwrap().clone();
    Ok(String::from_utf8(bytes).unwrap())
}

fn run(source: &str) -> Result<String, InterpretError> {
    run_with_config(source, RuntimeConfig::default())
}

fn assert_output(source: &str, expected: &str) {
    assert_eq!(run(source).unwrap(), expected, "source:\n{}", source);
}

fn compile_diagnostics(source: &str) -> Vec<String> {
    match run(source) {
        Err(InterpretError::Compile(e)) => e.diagnostics,
        other => panic!("expected compile error, got {:?}", other),
    }
}

// =============================================================================
// Language semantics
// =============================================================================

#[test]
fn test_arithmetic_precedence() {
    assert_output("print 1 + 2 * 3;", "7\n");
}

#[test]
fn test_string_concatenation() {
    assert_output("var a = \"foo\"; var b = \"bar\"; print a + b;", "foobar\n");
}

#[test]
fn test_closure_captures_argument() {
    assert_output(
        "fun make(x){ fun inner(){ return x; } return inner; } var f = make(42); print f();",
        "42\n",
    );
}

#[test]
fn test_counter_closure_mutates_upvalue() {
    assert_output(
        "fun counter(){ var i=0; fun next(){ i = i+1; return i; } return next; } \
         var c = counter(); print c(); print c(); print c();",
        "1\n2\n3\n",
    );
}

#[test]
fn test_class_method() {
    assert_output(
        "class A { greet(){ print \"hi\"; } } var a = A(); a.greet();",
        "hi\n",
    );
}

#[test]
fn test_super_call() {
    assert_output(
        "class A { greet(){ print \"hi\"; } } \
         class B < A { greet(){ super.greet(); print \"bye\"; } } \
         B().greet();",
        "hi\nbye\n",
    );
}

#[test]
fn test_interned_strings_compare_by_identity() {
    assert_output("print \"a\" + \"b\" == \"ab\";", "true\n");
}

#[test]
fn test_number_printing_round_trips() {
    assert_output("print 0.1;", "0.1\n");
    assert_output("print 3.5;", "3.5\n");
    assert_output("print 123456789;", "123456789\n");
    assert_output("print 0 / 0;", "NaN\n");
}

#[test]
fn test_for_loop_desugars_like_while() {
    let for_output = run("for (var i = 0; i < 5; i = i + 1) print i;").unwrap();
    let while_output =
        run("{ var i = 0; while (i < 5) { print i; i = i + 1; } }").unwrap();
    assert_eq!(for_output, while_output);
}

#[test]
fn test_deterministic_output() {
    let source = "\
        fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }\n\
        var total = 0;\n\
        for (var i = 0; i < 15; i = i + 1) total = total + fib(i);\n\
        print total;\n\
        print \"a\" + \"b\" + \"c\";\n";
    let first = run(source).unwrap();
    let second = run(source).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, "986\nabc\n");
}

#[test]
fn test_same_name_globals_are_one_variable() {
    // Both surface strings intern to the same name object.
    assert_output("var x = 1; { x = 2; } print x;", "2\n");
}

// =============================================================================
// Boundaries
// =============================================================================

fn locals_source(count: usize) -> String {
    let mut source = String::from("{\n");
    for i in 0..count {
        source.push_str(&format!("var l{} = {};\n", i, i % 200));
    }
    source.push_str("}\n");
    source
}

#[test]
fn test_locals_fill_one_frame() {
    // 255 declared locals plus the reserved slot fill the window exactly.
    assert!(run(&locals_source(255)).is_ok());
}

#[test]
fn test_one_local_too_many() {
    let diagnostics = compile_diagnostics(&locals_source(256));
    assert!(diagnostics
        .iter()
        .any(|d| d.contains("Too many local variables")));
}

fn call_source(param_count: usize, arg_count: usize) -> String {
    let params: Vec<String> = (0..param_count).map(|i| format!("p{}", i)).collect();
    // Boolean arguments: number literals would each take a constant slot
    // and overflow the pool long before the argument limit.
    let args = vec!["true"; arg_count];
    format!(
        "fun f({}) {{ return p0; }} print f({});",
        params.join(", "),
        args.join(", ")
    )
}

#[test]
fn test_255_arguments_compile_and_run() {
    assert_eq!(run(&call_source(255, 255)).unwrap(), "true\n");
}

#[test]
fn test_256_arguments_is_a_compile_error() {
    let diagnostics = compile_diagnostics(&call_source(256, 256));
    assert!(diagnostics
        .iter()
        .any(|d| d.contains("Can't have more than 255 arguments")
            || d.contains("Can't have more than 255 parameters")));
}

#[test]
fn test_jump_distance_limit() {
    // Only locals, so the body emits no constants and can exceed the 16-bit
    // jump operand.
    let mut body = String::new();
    for _ in 0..9000 {
        body.push_str("x = x + x; ");
    }
    let source = format!("{{ var x = 1; if (x) {{ {} }} }}", body);
    let diagnostics = compile_diagnostics(&source);
    assert!(diagnostics
        .iter()
        .any(|d| d.contains("Too much code to jump over")));
}

#[test]
fn test_loop_body_size_limit() {
    let mut body = String::new();
    for _ in 0..9000 {
        body.push_str("x = x + x; ");
    }
    let source = format!("{{ var x = 1; while (x) {{ {} }} }}", body);
    let diagnostics = compile_diagnostics(&source);
    assert!(diagnostics.iter().any(|d| d.contains("Loop body too large")));
}

#[test]
fn test_call_depth_limit() {
    let ok = "\
        fun down(n) { if (n == 0) return 0; return down(n - 1); }\n\
        print down(62);";
    assert_eq!(run(ok).unwrap(), "0\n");

    let over = "\
        fun down(n) { if (n == 0) return 0; return down(n - 1); }\n\
        print down(63);";
    match run(over) {
        Err(InterpretError::Runtime(e)) => assert_eq!(e.message, "Stack overflow"),
        other => panic!("expected stack overflow, got {:?}", other),
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

#[test]
fn test_multiple_compile_errors_in_one_run() {
    let diagnostics = compile_diagnostics("var 1;\nprint;\n1 = 2;");
    assert!(diagnostics.len() >= 3, "diagnostics: {:?}", diagnostics);
}

#[test]
fn test_diagnostic_format() {
    let diagnostics = compile_diagnostics("1 +;");
    assert_eq!(
        diagnostics[0],
        "[line 1] Error at ';': Expected expression"
    );
}

#[test]
fn test_runtime_error_reports_line_and_frame() {
    let source = "var a = 1;\n\na + \"x\";";
    match run(source) {
        Err(InterpretError::Runtime(e)) => {
            assert_eq!(e.message, "Operands must be two numbers or two strings");
            assert_eq!(e.trace, vec!["[line 3] in script"]);
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[test]
fn test_side_effects_before_runtime_error_stick() {
    let buffer = SharedBuf::default();
    let mut vm = Vm::with_output(RuntimeConfig::default(), Box::new(buffer.clone()));
    let result = vm.interpret("print \"before\"; nothing();");
    assert!(result.is_err());
    let bytes = buffer.0.lock().unwrap().clone();
    assert_eq!(String::from_utf8(bytes).unwrap(), "before\n");
}

// =============================================================================
// Collector behavior
// =============================================================================

fn stress() -> RuntimeConfig {
    RuntimeConfig {
        gc_stress: true,
        ..RuntimeConfig::default()
    }
}

#[test]
fn test_scenarios_unchanged_under_gc_stress() {
    let scenarios: &[(&str, &str)] = &[
        ("print 1 + 2 * 3;", "7\n"),
        ("var a = \"foo\"; var b = \"bar\"; print a + b;", "foobar\n"),
        (
            "fun make(x){ fun inner(){ return x; } return inner; } var f = make(42); print f();",
            "42\n",
        ),
        (
            "fun counter(){ var i=0; fun next(){ i = i+1; return i; } return next; } \
             var c = counter(); print c(); print c(); print c();",
            "1\n2\n3\n",
        ),
        (
            "class A { greet(){ print \"hi\"; } } var a = A(); a.greet();",
            "hi\n",
        ),
        (
            "class A { greet(){ print \"hi\"; } } \
             class B < A { greet(){ super.greet(); print \"bye\"; } } \
             B().greet();",
            "hi\nbye\n",
        ),
    ];

    for (source, expected) in scenarios {
        assert_eq!(
            run_with_config(source, stress()).unwrap(),
            *expected,
            "stressed source:\n{}",
            source
        );
    }
}

#[test]
fn test_discarded_closures_stay_bounded() {
    let source = "\
        fun make(n) { fun inner() { return n; } return inner; }\n\
        var i = 0;\n\
        while (i < 50000) { make(i); i = i + 1; }\n\
        print i;";
    let buffer = SharedBuf::default();
    let mut vm = Vm::with_output(RuntimeConfig::default(), Box::new(buffer.clone()));
    vm.interpret(source).unwrap();

    assert!(vm.gc_stats().cycles > 0, "the loop never triggered a cycle");
    assert!(
        vm.heap().bytes_allocated() < 2 * 1024 * 1024,
        "live bytes grew without bound: {}",
        vm.heap().bytes_allocated()
    );
    let bytes = buffer.0.lock().unwrap().clone();
    assert_eq!(String::from_utf8(bytes).unwrap(), "50000\n");
}

#[test]
fn test_intern_table_is_clean_after_collections() {
    let source = "\
        fun shout(s) { return s + \"!\"; }\n\
        print shout(\"a\") + shout(\"b\") + shout(\"c\");";
    let buffer = SharedBuf::default();
    let mut vm = Vm::with_output(stress(), Box::new(buffer));
    vm.interpret(source).unwrap();

    assert!(vm.gc_stats().cycles > 0);
    assert!(vm.heap().verify_intern_table());
}

#[test]
fn test_fields_survive_stress_collections() {
    let source = "\
        class Node { init(v) { this.v = v; this.next = nil; } }\n\
        var head = Node(0);\n\
        var cur = head;\n\
        for (var i = 1; i < 20; i = i + 1) { cur.next = Node(i); cur = cur.next; }\n\
        var sum = 0;\n\
        cur = head;\n\
        while (cur != nil) { sum = sum + cur.v; cur = cur.next; }\n\
        print sum;";
    assert_eq!(run_with_config(source, stress()).unwrap(), "190\n");
}
