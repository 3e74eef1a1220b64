use pikey::interpret;

#[test]
fn blocks_1() {
    let source = r#"
type "a";
{
    type "b";
    { type "c";}
}"#;
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let expected = "a\nb\nc\n";
    assert_eq!(&out, expected);
}

#[test]
fn locals_end_with_their_block() {
    let source = r#"
{
    let inner = "scoped";
    type inner;
}
type inner;"#;
    let mut out = Vec::new();
    let err = interpret(source, &mut out).unwrap_err();
    let out = String::from_utf8(out).unwrap();
    assert_eq!(&out, "scoped\n");
    assert_eq!(
        err.to_string(),
        "Undefined variable 'inner'.\n[line 6] in script"
    );
}

#[test]
fn empty_block() {
    let source = "{} { {} } type 'after';";
    let mut out = Vec::new();
    interpret(source, &mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert_eq!(&out, "after\n");
}
