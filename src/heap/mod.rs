use crate::heap::allocator::Allocator;
use crate::heap::hash_table::{HashTable, TableKey};
use crate::value::Value;
use log::{debug, trace};
use std::fmt::{self, Debug, Display, Formatter};

pub mod allocator;
pub mod hash_table;
mod object;

pub use object::{
    hash_str, ObjClosure, ObjFunction, ObjList, ObjNative, ObjString, ObjUpvalue, Object,
};

const MAX_DISPLAY_DEPTH: usize = 16;

/// Handle to an object living in a [`Heap`]. Stays valid until the object
/// is swept; handles are plain indices and carry no ownership.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(u32);

impl ObjRef {
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl Debug for ObjRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

struct HeapEntry {
    marked: bool,
    size: usize,
    object: Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub freed_objects: usize,
    pub freed_bytes: usize,
}

/// Arena owning every runtime object plus the string intern table.
///
/// Allocation never collects. Whoever allocates checks
/// [`Heap::should_collect`] first and runs [`Heap::collect_garbage`] with
/// its roots, since only the caller knows what is reachable.
pub struct Heap {
    objects: Vec<Option<HeapEntry>>,
    free: Vec<u32>,
    strings: HashTable,
    allocator: Allocator,
    gray: Vec<ObjRef>,
}

impl Heap {
    pub fn new(allocator: Allocator) -> Self {
        Self {
            objects: Vec::new(),
            free: Vec::new(),
            strings: HashTable::new(),
            allocator,
            gray: Vec::new(),
        }
    }

    pub fn alloc(&mut self, object: Object) -> ObjRef {
        let size = object.byte_size();
        self.allocator.record_allocation(size);
        trace!("Allocating {}", object.type_name());
        let entry = HeapEntry {
            marked: false,
            size,
            object,
        };
        match self.free.pop() {
            Some(index) => {
                self.objects[index as usize] = Some(entry);
                ObjRef(index)
            }
            None => {
                self.objects.push(Some(entry));
                ObjRef((self.objects.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, obj: ObjRef) -> Option<&Object> {
        self.objects
            .get(obj.0 as usize)
            .and_then(Option::as_ref)
            .map(|entry| &entry.object)
    }

    pub fn get_mut(&mut self, obj: ObjRef) -> Option<&mut Object> {
        self.objects
            .get_mut(obj.0 as usize)
            .and_then(Option::as_mut)
            .map(|entry| &mut entry.object)
    }

    pub fn string(&self, obj: ObjRef) -> Option<&ObjString> {
        match self.get(obj)? {
            Object::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn str(&self, obj: ObjRef) -> Option<&str> {
        self.string(obj).map(ObjString::as_str)
    }

    pub fn function(&self, obj: ObjRef) -> Option<&ObjFunction> {
        match self.get(obj)? {
            Object::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn closure(&self, obj: ObjRef) -> Option<&ObjClosure> {
        match self.get(obj)? {
            Object::Closure(closure) => Some(closure),
            _ => None,
        }
    }

    pub fn closure_mut(&mut self, obj: ObjRef) -> Option<&mut ObjClosure> {
        match self.get_mut(obj)? {
            Object::Closure(closure) => Some(closure),
            _ => None,
        }
    }

    pub fn upvalue(&self, obj: ObjRef) -> Option<&ObjUpvalue> {
        match self.get(obj)? {
            Object::Upvalue(upvalue) => Some(upvalue),
            _ => None,
        }
    }

    pub fn upvalue_mut(&mut self, obj: ObjRef) -> Option<&mut ObjUpvalue> {
        match self.get_mut(obj)? {
            Object::Upvalue(upvalue) => Some(upvalue),
            _ => None,
        }
    }

    pub fn list(&self, obj: ObjRef) -> Option<&ObjList> {
        match self.get(obj)? {
            Object::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn list_mut(&mut self, obj: ObjRef) -> Option<&mut ObjList> {
        match self.get_mut(obj)? {
            Object::List(list) => Some(list),
            _ => None,
        }
    }

    /// Returns the canonical string object for `s`, allocating it if this
    /// content has not been seen.
    pub fn intern(&mut self, s: &str) -> ObjRef {
        let hash = hash_str(s);
        match self.find_interned(s, hash) {
            Some(obj) => obj,
            None => self.insert_string(ObjString::new(s.into())),
        }
    }

    pub fn intern_owned(&mut self, s: String) -> ObjRef {
        let hash = hash_str(&s);
        match self.find_interned(&s, hash) {
            Some(obj) => obj,
            None => self.insert_string(ObjString::new(s.into_boxed_str())),
        }
    }

    /// The table key for a string object, used for globals.
    pub fn key(&self, obj: ObjRef) -> Option<TableKey> {
        self.string(obj).map(|s| TableKey { obj, hash: s.hash() })
    }

    fn find_interned(&self, s: &str, hash: u32) -> Option<ObjRef> {
        self.strings
            .find_string(hash, |obj| self.str(obj) == Some(s))
    }

    fn insert_string(&mut self, string: ObjString) -> ObjRef {
        let hash = string.hash();
        let obj = self.alloc(Object::String(string));
        self.strings.insert(TableKey { obj, hash }, Value::Null);
        obj
    }

    pub fn should_collect(&self) -> bool {
        self.allocator.should_collect()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.allocator.allocated()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len() - self.free.len()
    }

    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }

    /// Mark-sweep over everything reachable from `roots`.
    pub fn collect_garbage(&mut self, roots: impl IntoIterator<Item = Value>) -> GcStats {
        let before = self.allocator.allocated();
        debug!("-- gc begin ({before} bytes)");

        for root in roots {
            self.mark_value(root);
        }
        self.trace_references();

        let objects = &self.objects;
        self.strings.remove_white(|obj| {
            objects
                .get(obj.0 as usize)
                .and_then(Option::as_ref)
                .map_or(false, |entry| entry.marked)
        });
        let stats = self.sweep();
        self.allocator.finish_collection();

        debug!(
            "-- gc end: collected {} bytes ({} objects), {} remaining, next at {}",
            stats.freed_bytes,
            stats.freed_objects,
            self.allocator.allocated(),
            self.allocator.next_gc()
        );
        stats
    }

    fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    fn mark_object(&mut self, obj: ObjRef) {
        let Some(Some(entry)) = self.objects.get_mut(obj.0 as usize) else {
            return;
        };
        if entry.marked {
            return;
        }
        trace!("Marking {obj:?} {:?}", entry.object);
        entry.marked = true;
        self.gray.push(obj);
    }

    fn trace_references(&mut self) {
        let mut children = Vec::new();
        while let Some(obj) = self.gray.pop() {
            if let Some(object) = self.get(obj) {
                object.trace(&mut children);
            }
            for child in children.drain(..) {
                self.mark_value(child);
            }
        }
    }

    fn sweep(&mut self) -> GcStats {
        let mut stats = GcStats {
            freed_objects: 0,
            freed_bytes: 0,
        };
        for (index, slot) in self.objects.iter_mut().enumerate() {
            match slot {
                Some(entry) if entry.marked => entry.marked = false,
                Some(entry) => {
                    trace!("Freeing @{index} {:?}", entry.object);
                    self.allocator.record_free(entry.size);
                    stats.freed_bytes += entry.size;
                    stats.freed_objects += 1;
                    *slot = None;
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
        stats
    }

    /// Renders a value the way `type` prints it.
    pub fn display(&self, value: Value) -> ValueDisplay<'_> {
        ValueDisplay { heap: self, value }
    }

    fn write_value(&self, f: &mut Formatter<'_>, value: Value, depth: usize) -> fmt::Result {
        match value {
            Value::Number(num) => write!(f, "{num}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Null => write!(f, "null"),
            Value::Obj(obj) => self.write_object(f, obj, depth),
        }
    }

    fn write_object(&self, f: &mut Formatter<'_>, obj: ObjRef, depth: usize) -> fmt::Result {
        let Some(object) = self.get(obj) else {
            return write!(f, "<freed {obj:?}>");
        };
        match object {
            Object::String(s) => write!(f, "{}", s.as_str()),
            Object::Function(function) => self.write_function(f, function),
            Object::Closure(closure) => match self.function(closure.function) {
                Some(function) => self.write_function(f, function),
                None => write!(f, "<fn ?>"),
            },
            Object::Native(_) => write!(f, "<native fn>"),
            Object::Upvalue(_) => write!(f, "upvalue"),
            Object::List(_) if depth >= MAX_DISPLAY_DEPTH => write!(f, "[...]"),
            Object::List(list) => {
                write!(f, "[")?;
                for (i, item) in list.items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    self.write_value(f, *item, depth + 1)?;
                }
                write!(f, "]")
            }
        }
    }

    fn write_function(&self, f: &mut Formatter<'_>, function: &ObjFunction) -> fmt::Result {
        match function.name.and_then(|name| self.str(name)) {
            Some(name) => write!(f, "<fn {name}>"),
            None => write!(f, "<script>"),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(Allocator::default())
    }
}

impl Debug for Heap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("objects", &self.object_count())
            .field("allocator", &self.allocator)
            .field("strings", &self.strings)
            .finish()
    }
}

pub struct ValueDisplay<'h> {
    heap: &'h Heap,
    value: Value,
}

impl Display for ValueDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.heap.write_value(f, self.value, 0)
    }
}
