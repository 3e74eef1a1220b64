use pikey::interpret;

#[test]
fn simple_arithmetic_1() {
    let source = "type 1 + 2 + -3 * 4/(3-5);";
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "9\n";
    assert_eq!(&out, expected);
}

#[test]
fn simple_arithmetic_2() {
    let source = "type (-1 + 2) * 3 - -4;";
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "7\n";
    assert_eq!(&out, expected);
}

#[test]
fn fractions() {
    let source = "type 5 / 2; type 0.1 * 3 == 0.3;";
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "2.5\nfalse\n";
    assert_eq!(&out, expected);
}

#[test]
fn power_is_right_associative() {
    let source = "type 2 ** 3 ** 2; type -2 ** 2; type 2 * 3 ** 2;";
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "512\n4\n18\n";
    assert_eq!(&out, expected);
}

#[test]
fn modulo_truncates() {
    let source = "type 7 % 3; type -7 % 3; type 7 % -3; type 1 + 7 % 4;";
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "1\n-1\n1\n4\n";
    assert_eq!(&out, expected);
}

#[test]
fn modulo_errors() {
    let mut out = Vec::new();
    let err = interpret("type 7.5 % 2;", &mut out).unwrap_err();
    assert!(err.to_string().starts_with("Operands of modulo must be integers."));
    let err = interpret("type 7 % 0;", &mut out).unwrap_err();
    assert!(err.to_string().starts_with("Modulo by zero."));
    let err = interpret("type 'a' % 2;", &mut out).unwrap_err();
    assert!(err.to_string().starts_with("Operands must be numbers."));
    assert!(out.is_empty());
}

#[test]
fn adding_mixed_types() {
    let mut out = Vec::new();
    interpret("type 1 + 2;", &mut out).unwrap();
    let err = interpret("type 'a' + 1;", &mut out).unwrap_err();
    let out = String::from_utf8(out).unwrap();
    assert_eq!(&out, "3\n");
    assert_eq!(
        err.to_string(),
        "Operands must be two numbers or two strings.\n[line 1] in script"
    );
}

#[test]
fn negating_non_numbers() {
    let mut out = Vec::new();
    let err = interpret("type -true;", &mut out).unwrap_err();
    assert!(err.to_string().starts_with("Operand must be a number."));
}
