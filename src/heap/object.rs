use crate::chunk::Chunk;
use crate::heap::ObjRef;
use crate::natives::NativeFn;
use crate::value::Value;
use std::fmt::{Debug, Formatter};
use std::mem;
use std::rc::Rc;

pub enum Object {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    List(ObjList),
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::String(_) => "string",
            Object::Function(_) => "function",
            Object::Native(_) => "native",
            Object::Closure(_) => "closure",
            Object::Upvalue(_) => "upvalue",
            Object::List(_) => "list",
        }
    }

    /// Pushes every value this object keeps alive onto `out`.
    pub fn trace(&self, out: &mut Vec<Value>) {
        match self {
            Object::String(_) => {}
            Object::Function(function) => {
                out.extend(function.name.map(Value::Obj));
                out.extend_from_slice(function.chunk.constants());
            }
            Object::Native(native) => out.push(Value::Obj(native.name)),
            Object::Closure(closure) => {
                out.push(Value::Obj(closure.function));
                out.extend(closure.upvalues.iter().copied().map(Value::Obj));
            }
            // An open upvalue's slot is reachable through the stack.
            Object::Upvalue(ObjUpvalue::Open(_)) => {}
            Object::Upvalue(ObjUpvalue::Closed(value)) => out.push(*value),
            Object::List(list) => out.extend_from_slice(&list.items),
        }
    }

    /// Bytes charged against the collection threshold for this object.
    pub fn byte_size(&self) -> usize {
        let payload = match self {
            Object::String(s) => s.chars.len(),
            Object::Function(function) => function.chunk.byte_size(),
            Object::Native(_) => 0,
            Object::Closure(closure) => closure.upvalues.capacity() * mem::size_of::<ObjRef>(),
            Object::Upvalue(_) => 0,
            Object::List(list) => list.items.capacity() * mem::size_of::<Value>(),
        };
        mem::size_of::<Object>() + payload
    }
}

impl Debug for Object {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Object::String(s) => write!(f, "String({:?})", s.as_str()),
            Object::Function(function) => write!(
                f,
                "Function(arity: {}, upvalues: {}, name: {:?})",
                function.arity, function.upvalue_count, function.name
            ),
            Object::Native(native) => write!(f, "Native({:?})", native.name),
            Object::Closure(closure) => write!(
                f,
                "Closure({:?}, upvalues: {:?})",
                closure.function, closure.upvalues
            ),
            Object::Upvalue(upvalue) => write!(f, "{upvalue:?}"),
            Object::List(list) => write!(f, "List({:?})", list.items),
        }
    }
}

pub struct ObjString {
    chars: Box<str>,
    hash: u32,
}

impl ObjString {
    pub fn new(chars: Box<str>) -> Self {
        let hash = hash_str(&chars);
        Self { chars, hash }
    }

    pub fn as_str(&self) -> &str {
        &self.chars
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }
}

/// 32-bit FNV-1a.
pub fn hash_str(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Rc<Chunk>,
    /// `None` for the top-level script.
    pub name: Option<ObjRef>,
}

pub struct ObjNative {
    pub name: ObjRef,
    pub function: NativeFn,
}

pub struct ObjClosure {
    pub function: ObjRef,
    /// Filled in one by one while the closure instruction runs.
    pub upvalues: Vec<ObjRef>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObjUpvalue {
    /// Index of the captured stack slot.
    Open(usize),
    Closed(Value),
}

#[derive(Default)]
pub struct ObjList {
    pub items: Vec<Value>,
}

impl ObjList {
    /// Maps a possibly negative index onto a position in the list.
    /// Negative indices count from the end, `-1` being the last element.
    pub fn resolve_index(&self, index: i64) -> Option<usize> {
        let len = self.items.len() as i64;
        let index = if index < 0 { len + index } else { index };
        (0..len).contains(&index).then_some(index as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a() {
        assert_eq!(hash_str(""), 2166136261);
        assert_eq!(hash_str("a"), 0xe40c292c);
        assert_eq!(hash_str("foobar"), 0xbf9cf968);
    }

    #[test]
    fn list_indices() {
        let list = ObjList {
            items: vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)],
        };
        assert_eq!(list.resolve_index(0), Some(0));
        assert_eq!(list.resolve_index(2), Some(2));
        assert_eq!(list.resolve_index(3), None);
        assert_eq!(list.resolve_index(-1), Some(2));
        assert_eq!(list.resolve_index(-3), Some(0));
        assert_eq!(list.resolve_index(-4), None);
        assert_eq!(ObjList::default().resolve_index(-1), None);
    }
}
