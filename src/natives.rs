use crate::heap::{Heap, Object};
use crate::value::Value;
use crate::vm::RuntimeError;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Signature of every host function callable from scripts.
pub type NativeFn = fn(&mut NativeContext<'_>, &[Value]) -> Result<Value, RuntimeError>;

/// What a native may touch while it runs. The heap never collects during a
/// native call, so freshly allocated results are safe to return.
pub struct NativeContext<'a> {
    pub heap: &'a mut Heap,
    pub rng: &'a mut Rng,
    pub started: Instant,
}

/// The natives every VM starts with.
pub const STANDARD_NATIVES: &[(&str, NativeFn)] = &[
    ("clock", clock),
    ("lower", lower),
    ("upper", upper),
    ("rand", rand),
    ("rand_int", rand_int),
    ("rand_digit", rand_digit),
    ("rand_let", rand_let),
    ("rand_spcc", rand_spcc),
    ("rand_char", rand_char),
    ("slice", slice),
    ("length", length),
];

const DIGITS: &str = "0123456789";
const LETTERS: &str = "abcdefghijklmnopqrstuvwxyz";
const SPECIAL: &str = "!@#$%^&*()";
const SLICE_USAGE: &str = "The slice function takes the following arguments: str(string), start(int), length(int - optional).";

// Knuth MMIX LCG constants.
const LCG_MULTIPLIER: u64 = 6364136223846793005;
const LCG_INCREMENT: u64 = 1442695040888963407;

/// Linear congruential generator. Seedable so script output can be
/// reproduced.
#[derive(Debug, Clone)]
pub struct Rng {
    state: u64,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn from_time() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self::new(seed)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT);
        self.state
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        // The high bits of an LCG are the well distributed ones.
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform in `[0, n)`; `n` must be non-zero.
    pub fn below(&mut self, n: u64) -> u64 {
        ((self.next_f64() * n as f64) as u64).min(n - 1)
    }
}

fn native_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::Native(message.into())
}

fn string_arg<'h>(heap: &'h Heap, value: Value) -> Option<&'h str> {
    value.as_obj().and_then(|obj| heap.str(obj))
}

fn clock(ctx: &mut NativeContext<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Number(ctx.started.elapsed().as_secs_f64()))
}

fn convert_case(
    ctx: &mut NativeContext<'_>,
    args: &[Value],
    name: &str,
    convert: fn(&str) -> String,
) -> Result<Value, RuntimeError> {
    let [arg] = args else {
        return Err(native_error(format!(
            "The {name} function takes exactly one argument."
        )));
    };
    let converted = string_arg(ctx.heap, *arg).map(convert).ok_or_else(|| {
        native_error(format!("The {name} function takes a string as an argument."))
    })?;
    Ok(Value::Obj(ctx.heap.intern_owned(converted)))
}

fn lower(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    convert_case(ctx, args, "lower", str::to_lowercase)
}

fn upper(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    convert_case(ctx, args, "upper", str::to_uppercase)
}

/// Bounds from `(min, max)` arguments, or `default` for any other arity.
fn bounds(args: &[Value], name: &str, default: (f64, f64)) -> Result<(f64, f64), RuntimeError> {
    match args {
        [min, max] => match (min.as_number(), max.as_number()) {
            (Some(min), Some(max)) => Ok((min, max)),
            _ => Err(native_error(format!(
                "The minimum and maximum for {name} must be numbers."
            ))),
        },
        _ => Ok(default),
    }
}

fn rand(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let (min, max) = bounds(args, "rand", (0.0, 1.0))?;
    Ok(Value::Number(min + ctx.rng.next_f64() * (max - min)))
}

fn rand_int(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let (min, max) = bounds(args, "rand_int", (0.0, 1.0))?;
    let (min, max) = (min.trunc() as i64, max.trunc() as i64);
    if min > max {
        return Err(native_error(
            "The minimum for rand_int must not be greater than the maximum.",
        ));
    }
    let span = max.abs_diff(min).saturating_add(1);
    let offset = ctx.rng.below(span);
    Ok(Value::Number(min.wrapping_add(offset as i64) as f64))
}

fn random_char(ctx: &mut NativeContext<'_>, alphabet: &[&str]) -> Value {
    let total: usize = alphabet.iter().map(|part| part.len()).sum();
    let mut index = ctx.rng.below(total as u64) as usize;
    for part in alphabet {
        if index < part.len() {
            return Value::Obj(ctx.heap.intern(&part[index..index + 1]));
        }
        index -= part.len();
    }
    Value::Null
}

fn rand_digit(ctx: &mut NativeContext<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(random_char(ctx, &[DIGITS]))
}

fn rand_let(ctx: &mut NativeContext<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(random_char(ctx, &[LETTERS]))
}

fn rand_spcc(ctx: &mut NativeContext<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(random_char(ctx, &[SPECIAL]))
}

fn rand_char(ctx: &mut NativeContext<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(random_char(ctx, &[LETTERS, DIGITS, SPECIAL]))
}

fn slice(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let (string, start, length) = match args {
        [string, start] => (*string, *start, Value::Number(1.0)),
        [string, start, length] => (*string, *start, *length),
        _ => return Err(native_error(SLICE_USAGE)),
    };
    let (Some(string), Some(start), Some(length)) = (
        string_arg(ctx.heap, string),
        start.as_integer().and_then(|n| usize::try_from(n).ok()),
        length.as_integer().and_then(|n| usize::try_from(n).ok()),
    ) else {
        return Err(native_error(SLICE_USAGE));
    };
    if start.saturating_add(length) > string.chars().count() {
        return Err(native_error(
            "The slice function's range is outside of the string.",
        ));
    }
    let sliced: String = string.chars().skip(start).take(length).collect();
    Ok(Value::Obj(ctx.heap.intern_owned(sliced)))
}

fn length(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let len = match args {
        [Value::Obj(obj)] => match ctx.heap.get(*obj) {
            Some(Object::String(s)) => Some(s.as_str().chars().count()),
            Some(Object::List(list)) => Some(list.items.len()),
            _ => None,
        },
        _ => None,
    };
    len.map(|len| Value::Number(len as f64)).ok_or_else(|| {
        native_error("The length function takes the following argument: str(string) or list.")
    })
}
