use pikey::interpret;

#[test]
fn integers() {
    let source = "type 3 & 1; type 6 | 1; type 6 ^ 3; type 1 << 4; type 256 >> 4; type -8 >> 1;";
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "1\n7\n5\n16\n16\n-4\n";
    assert_eq!(&out, expected);
}

#[test]
fn booleans() {
    let source = "type true & false; type true | false; type true ^ true; type true << false;";
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "false\ntrue\nfalse\ntrue\n";
    assert_eq!(&out, expected);
}

#[test]
fn precedence() {
    // & binds tighter than ^, which binds tighter than |. Shifts sit between
    // comparison and addition.
    let source = "type 1 | 2 & 3; type 1 ^ 3 & 1; type 1 << 1 + 1; type 1 < 1 << 1;";
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "3\n0\n4\ntrue\n";
    assert_eq!(&out, expected);
}

#[test]
fn floats_are_rejected() {
    let mut out = Vec::new();
    let err = interpret("type 1.5 & 1;", &mut out).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Operands of bitwise operator must be integers not floats.\n[line 1] in script"
    );
    assert!(out.is_empty());
}

#[test]
fn mixed_operands_are_rejected() {
    let mut out = Vec::new();
    let err = interpret("type true | 1;", &mut out).unwrap_err();
    assert!(err
        .to_string()
        .starts_with("Operands of a bitwise operator must be an integer or a boolean."));
    let err = interpret("type 'a' ^ 'b';", &mut out).unwrap_err();
    assert!(err
        .to_string()
        .starts_with("Operands of a bitwise operator must be an integer or a boolean."));
}
