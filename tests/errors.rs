use pikey::{interpret, InterpretError};

#[test]
fn errors() {
    let source = r#""hi" "i";
!;
naf;
"#;
    let mut out = Vec::new();
    let err = interpret(source, &mut out).unwrap_err();
    let errs = match err {
        InterpretError::Compile(e) => e,
        InterpretError::Runtime(_) => panic!(),
    };
    assert_eq!(errs.errors().len(), 2);
    assert_eq!(errs.errors()[0].line(), 1);
    assert_eq!(errs.errors()[1].line(), 2);
}

#[test]
fn unknown_character() {
    let mut out = Vec::new();
    let err = interpret("type 1;\ntype #;", &mut out).unwrap_err();
    assert!(out.is_empty());
    assert_eq!(err.to_string(), "[line 2] Error: Unexpected character.");
}

#[test]
fn missing_semicolon_at_end() {
    let mut out = Vec::new();
    let err = interpret("let a = 1", &mut out).unwrap_err();
    assert_eq!(
        err.to_string(),
        "[line 1] Error at end: Expect ';' after variable declaration."
    );
}

#[test]
fn runtime_error_stops_execution() {
    let source = "type 'before';\ntype -'x';\ntype 'after';";
    let mut out = Vec::new();
    let err = interpret(source, &mut out).unwrap_err();
    let out = String::from_utf8(out).unwrap();
    assert_eq!(&out, "before\n");
    let InterpretError::Runtime(failure) = err else {
        panic!("expected a runtime error");
    };
    assert_eq!(failure.trace.len(), 1);
    assert_eq!(failure.trace[0].line, 2);
    assert_eq!(failure.trace[0].function, None);
}
