use pikey::interpret;

#[test]
fn statements_1() {
    let source = r#"
type "Hi!";
"ignored";
type "How are you!";
    "#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "Hi!\nHow are you!\n";
    assert_eq!(&out, expected);
}

#[test]
fn if_else() {
    let source = r#"
if (1 < 2) type "then"; else type "else";
if (null) type "then"; else type "else";
if (0) type "zero is truthy";
if (false) { type "skipped"; }"#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "then\nelse\nzero is truthy\n";
    assert_eq!(&out, expected);
}

#[test]
fn logical_operators() {
    let source = r#"
type 1 and 2;
type null and 2;
type false or "default";
type 1 or unknown;
type false and unknown;"#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "2\nnull\ndefault\n1\nfalse\n";
    assert_eq!(&out, expected);
}

#[test]
fn while_loop() {
    let source = r#"
let i = 0;
while (i < 3) {
    type i;
    i += 1;
}"#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "0\n1\n2\n";
    assert_eq!(&out, expected);
}

#[test]
fn for_loop() {
    let source = r#"
for (let i = 0; i < 3; i = i + 1) type i;
let total = 0;
for (let j = 1; j <= 4; j += 1) {
    total += j;
}
type total;
let k = 5;
for (; k > 3;) k -= 1;
type k;"#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "0\n1\n2\n10\n3\n";
    assert_eq!(&out, expected);
}

#[test]
fn for_loop_variable_is_scoped() {
    let source = "for (let i = 0; i < 1; i += 1) {} type i;";
    let mut out = Vec::new();
    let err = interpret(source, &mut out).unwrap_err();
    assert!(err.to_string().starts_with("Undefined variable 'i'."));
}
