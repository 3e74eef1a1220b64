use pikey::{interpret, InterpretError};

#[test]
fn locals_1() {
    let source = r#"
let a = "a";
type a;
{
    let b = "b";
    type b;
    {
        let a = "c";
        type a;
    }
    type a;
}"#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "a\nb\nc\na\n";
    assert_eq!(&out, expected);
}

#[test]
fn own_initializer() {
    let source = r#"
let a = "a";
{
    let a = a;
}"#;
    let mut out = Vec::new();
    let err = interpret(source, &mut out).unwrap_err();
    assert_eq!(
        err.to_string(),
        "[line 4] Error at 'a': Can't read local variable in its own initializer."
    );
}

#[test]
fn redeclaration() {
    let source = "{\n  let a = 1;\n  let a = 2;\n}";
    let mut out = Vec::new();
    let err = interpret(source, &mut out).unwrap_err();
    let InterpretError::Compile(errors) = err else {
        panic!("expected compile errors, got {err}");
    };
    assert_eq!(errors.errors().len(), 1);
    assert_eq!(errors.errors()[0].line(), 3);
}

#[test]
fn shadowing_in_nested_scope() {
    let source = "{ let a = 1; { let a = a + 1; type a; } type a; }";
    let mut out = Vec::new();
    let err = interpret(source, &mut out);
    // The inner initializer refers to the inner, not yet initialized, `a`.
    assert!(matches!(err, Err(InterpretError::Compile(_))));

    let source = "{ let a = 1; { let b = a + 1; let a = b; type a; } type a; }";
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert_eq!(&out, "2\n1\n");
}

#[test]
fn compound_assignment() {
    let source = "{ let n = 10; n -= 3; n += 0.5; type n; }";
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert_eq!(&out, "7.5\n");
}
