use pikey::natives::NativeContext;
use pikey::{InterpretError, InterpretResult, RuntimeError, Value, Vm};

#[test]
fn globals_persist_across_runs() {
    let mut vm = Vm::new(Vec::new());
    vm.run("let greeting = 'hello';").unwrap();
    vm.run("def shout(s) { return upper(s); }").unwrap();
    vm.run("type shout(greeting);").unwrap();
}

#[test]
fn usable_after_runtime_error() {
    let mut out = Vec::new();
    let mut vm = Vm::new(&mut out);
    vm.run("let total = 1;").unwrap();
    let err = vm.run("def f() { return total + null; } f();").unwrap_err();
    assert!(matches!(err, InterpretError::Runtime(_)));
    vm.run("total += 1; type total; type f;").unwrap();
    drop(vm);
    assert_eq!(String::from_utf8(out).unwrap(), "2\n<fn f>\n");
}

#[test]
fn usable_after_compile_error() {
    let mut out = Vec::new();
    let mut vm = Vm::new(&mut out);
    assert!(matches!(vm.run("let = ;"), Err(InterpretError::Compile(_))));
    vm.run("type 'still fine';").unwrap();
    drop(vm);
    assert_eq!(String::from_utf8(out).unwrap(), "still fine\n");
}

#[test]
fn interpret_result_codes() {
    let mut vm = Vm::new(Vec::new());
    vm.set_diagnostics(std::io::sink());
    assert_eq!(vm.interpret("let a = 1;"), InterpretResult::Ok);
    assert_eq!(vm.interpret("let a = ;"), InterpretResult::CompileError);
    assert_eq!(vm.interpret("a();"), InterpretResult::RuntimeError);
}

fn double(_ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    match args {
        [Value::Number(n)] => Ok(Value::Number(n * 2.0)),
        _ => Err(RuntimeError::Native("double takes one number.".to_string())),
    }
}

#[test]
fn host_natives() {
    let mut out = Vec::new();
    let mut vm = Vm::new(&mut out);
    vm.define_native("double", double);
    vm.run("type double(21);").unwrap();
    let err = vm.run("double('x');").unwrap_err();
    assert_eq!(err.to_string(), "double takes one number.\n[line 1] in script");
    drop(vm);
    assert_eq!(String::from_utf8(out).unwrap(), "42\n");
}

#[test]
fn escaped_closures_survive_runtime_error() {
    let mut out = Vec::new();
    let mut vm = Vm::new(&mut out);
    let source = r#"
let g;
def outer() {
    let x = 111;
    def inner() { return x; }
    g = inner;
    type -null;
}
outer();"#;
    assert!(matches!(vm.run(source), Err(InterpretError::Runtime(_))));
    vm.run("def h(p, q) { return g(); } type h(5, 6);").unwrap();
    vm.run("type g();").unwrap();
    drop(vm);
    assert_eq!(String::from_utf8(out).unwrap(), "111\n111\n");
}

#[test]
fn literals_are_interned_across_runs() {
    let mut out = Vec::new();
    let mut vm = Vm::new(&mut out);
    vm.run("let a = \"x\";").unwrap();
    vm.run("type a == \"x\"; type a == 'x';").unwrap();
    drop(vm);
    assert_eq!(String::from_utf8(out).unwrap(), "true\ntrue\n");
}
