use pikey::{InterpretError, Vm, VmConfig};

fn seeded() -> Vm<Vec<u8>> {
    Vm::with_config(
        Vec::new(),
        VmConfig {
            seed: Some(7),
            ..VmConfig::default()
        },
    )
}

fn run(source: &str) -> String {
    let mut out = Vec::new();
    let mut vm = Vm::with_config(
        &mut out,
        VmConfig {
            seed: Some(7),
            ..VmConfig::default()
        },
    );
    if let Err(e) = vm.run(source) {
        panic!("{e}");
    }
    drop(vm);
    String::from_utf8(out).unwrap()
}

fn error(source: &str) -> String {
    let mut vm = seeded();
    match vm.run(source) {
        Err(InterpretError::Runtime(failure)) => failure.error.to_string(),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn case_conversion() {
    assert_eq!(run("type lower('MiXeD'); type upper('MiXeD');"), "mixed\nMIXED\n");
    assert_eq!(error("lower();"), "The lower function takes exactly one argument.");
    assert_eq!(error("upper(1);"), "The upper function takes a string as an argument.");
}

#[test]
fn converted_strings_are_interned() {
    assert_eq!(run("type lower('ABC') == 'abc';"), "true\n");
}

#[test]
fn slice() {
    let source = "type slice('keyboard', 3); type slice('keyboard', 0, 3); type slice('keyboard', 3, 5);";
    assert_eq!(run(source), "y\nkey\nboard\n");
    assert_eq!(
        error("slice('abc', 2, 2);"),
        "The slice function's range is outside of the string."
    );
    assert!(error("slice('abc');").contains("slice"));
    assert!(error("slice(1, 0);").contains("slice"));
}

#[test]
fn length() {
    assert_eq!(run("type length('hello'); type length([1, 2]); type length('');"), "5\n2\n0\n");
    assert_eq!(
        error("length(1);"),
        "The length function takes the following argument: str(string) or list."
    );
}

#[test]
fn rand_ranges() {
    let source = r#"
let ok = true;
for (let i = 0; i < 200; i += 1) {
    let f = rand();
    if (f < 0 or f >= 1) ok = false;
    let g = rand(5, 6);
    if (g < 5 or g >= 6) ok = false;
    let n = rand_int(1, 3);
    if (n < 1 or n > 3 or n % 1 != 0) ok = false;
    let b = rand_int();
    if (b != 0 and b != 1) ok = false;
}
type ok;"#;
    assert_eq!(run(source), "true\n");
    assert_eq!(
        error("rand(1, 'x');"),
        "The minimum and maximum for rand must be numbers."
    );
    assert_eq!(
        error("rand_int(3, 1);"),
        "The minimum for rand_int must not be greater than the maximum."
    );
}

#[test]
fn rand_int_reaches_both_ends() {
    let source = r#"
let low = false;
let high = false;
for (let i = 0; i < 200; i += 1) {
    let n = rand_int(1, 3);
    if (n == 1) low = true;
    if (n == 3) high = true;
}
type low and high;"#;
    assert_eq!(run(source), "true\n");
}

#[test]
fn random_characters() {
    let source = r#"
let ok = true;
for (let i = 0; i < 100; i += 1) {
    if (length(rand_digit()) != 1 or length(rand_let()) != 1) ok = false;
    if (length(rand_spcc()) != 1 or length(rand_char()) != 1) ok = false;
    let d = rand_digit();
    if (lower(d) != d or upper(d) != d) ok = false;
    let l = rand_let();
    if (lower(l) != l or upper(l) == l) ok = false;
}
type ok;"#;
    assert_eq!(run(source), "true\n");
}

#[test]
fn seeded_runs_repeat() {
    let source = "type rand_int(0, 1000000); type rand_char();";
    assert_eq!(run(source), run(source));
}

#[test]
fn clock_advances() {
    assert_eq!(run("let t = clock(); type t >= 0; type clock() >= t;"), "true\ntrue\n");
}

#[test]
fn natives_display() {
    assert_eq!(run("type clock;"), "<native fn>\n");
}
