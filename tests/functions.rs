use pikey::{interpret, InterpretError, RuntimeError};
use pikey::vm::VmError;

fn run(source: &str) -> String {
    let mut out = Vec::new();
    if let Err(e) = interpret(source, &mut out) {
        panic!("{e}");
    }
    String::from_utf8(out).unwrap()
}

fn runtime_error(source: &str) -> RuntimeError {
    let mut out = Vec::new();
    match interpret(source, &mut out) {
        Err(InterpretError::Runtime(failure)) => match failure.error {
            VmError::RuntimeError(e) => e,
            other => panic!("internal error: {other}"),
        },
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn call_and_return() {
    let source = r#"
def add(a, b) {
    return a + b;
}
type add(1, 2);
type add('a', 'b');"#;
    assert_eq!(run(source), "3\nab\n");
}

#[test]
fn implicit_null_return() {
    let source = "def f() { type 'body'; } type f(); def g() { return; } type g();";
    assert_eq!(run(source), "body\nnull\nnull\n");
}

#[test]
fn recursion() {
    let source = r#"
def fib(n) {
    if (n < 2) return n;
    return fib(n - 2) + fib(n - 1);
}
type fib(15);"#;
    assert_eq!(run(source), "610\n");
}

#[test]
fn functions_are_values() {
    let source = r#"
def twice(f, x) { return f(f(x)); }
def inc(x) { return x + 1; }
type twice(inc, 5);
type inc;
let alias = inc;
type alias(1);"#;
    assert_eq!(run(source), "7\n<fn inc>\n2\n");
}

#[test]
fn local_functions() {
    let source = r#"
{
    def local() { return 'inner'; }
    type local();
}"#;
    assert_eq!(run(source), "inner\n");
}

#[test]
fn arity_is_enforced() {
    assert_eq!(
        runtime_error("def f(a, b) {} f(1);"),
        RuntimeError::ArityMismatch {
            expected: 2,
            got: 1
        }
    );
    assert_eq!(
        runtime_error("def f() {} f(1, 2, 3);").to_string(),
        "Expected 0 arguments but got 3."
    );
}

#[test]
fn only_functions_are_callable() {
    assert_eq!(runtime_error("let a = 1; a();"), RuntimeError::NotCallable);
    assert_eq!(runtime_error("'str'();"), RuntimeError::NotCallable);
    assert_eq!(runtime_error("null();"), RuntimeError::NotCallable);
}

#[test]
fn stack_overflow() {
    assert_eq!(
        runtime_error("def f(n) { return f(n + 1); } f(0);"),
        RuntimeError::StackOverflow
    );
}

#[test]
fn error_trace_names_functions() {
    let source = "def fail() {\n  return -'x';\n}\n\nfail();";
    let mut out = Vec::new();
    let err = interpret(source, &mut out).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Operand must be a number.\n[line 2] in fail()\n[line 5] in script"
    );
}

#[test]
fn too_many_parameters() {
    let params: Vec<String> = (0..256).map(|i| format!("p{i}")).collect();
    let source = format!("def f({}) {{}}", params.join(", "));
    let mut out = Vec::new();
    let err = interpret(&source, &mut out).unwrap_err();
    assert!(err
        .to_string()
        .contains("Error at 'p255': Can't have more than 255 parameters."));
}
