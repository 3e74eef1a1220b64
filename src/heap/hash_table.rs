use crate::heap::ObjRef;
use crate::value::Value;
use std::fmt::{Debug, Formatter};

/// An interned string handle together with its precomputed hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableKey {
    pub obj: ObjRef,
    pub hash: u32,
}

/// Open-addressing table keyed by interned strings.
///
/// Deleted slots become tombstones (no key, non-null value) so that linear
/// probe sequences running through them stay intact. Tombstones count
/// towards the load factor until the next resize drops them.
#[derive(Default)]
pub struct HashTable {
    count: usize,
    entries: Vec<Entry>,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<TableKey>,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry {
        key: None,
        value: Value::Null,
    };

    const TOMBSTONE: Entry = Entry {
        key: None,
        value: Value::Boolean(true),
    };

    fn is_empty(&self) -> bool {
        self.key.is_none() && self.value == Value::Null
    }
}

impl HashTable {
    const MAX_LOAD: f64 = 0.75;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: TableKey) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[Self::find_entry(&self.entries, key)];
        entry.key.map(|_| entry.value)
    }

    /// Returns `true` if the key was not present before.
    pub fn insert(&mut self, key: TableKey, value: Value) -> bool {
        if (self.count + 1) as f64 > (self.entries.len() as f64) * Self::MAX_LOAD {
            let new_capacity = self.grow_capacity();
            self.adjust_capacity(new_capacity);
        }

        let idx = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[idx];
        let is_new_key = entry.key.is_none();
        // Reusing a tombstone doesn't change the count.
        if entry.is_empty() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new_key
    }

    pub fn delete(&mut self, key: TableKey) -> bool {
        if self.count == 0 {
            return false;
        }
        let idx = Self::find_entry(&self.entries, key);
        if self.entries[idx].key.is_none() {
            return false;
        }
        self.entries[idx] = Entry::TOMBSTONE;
        true
    }

    /// Looks a string up by content rather than by handle, for interning.
    pub fn find_string(&self, hash: u32, matches: impl Fn(ObjRef) -> bool) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        for _ in 0..capacity {
            let entry = &self.entries[index];
            match entry.key {
                Some(key) if key.hash == hash && matches(key.obj) => return Some(key.obj),
                Some(_) => {}
                None if entry.is_empty() => return None,
                None => {}
            }
            index = (index + 1) % capacity;
        }
        None
    }

    /// Turns every entry whose key is not marked into a tombstone.
    pub fn remove_white(&mut self, is_marked: impl Fn(ObjRef) -> bool) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key {
                if !is_marked(key.obj) {
                    *entry = Entry::TOMBSTONE;
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TableKey, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn grow_capacity(&self) -> usize {
        if self.entries.len() < 8 {
            8
        } else {
            self.entries.len() * 2
        }
    }

    fn adjust_capacity(&mut self, new_capacity: usize) {
        let mut entries = vec![Entry::EMPTY; new_capacity];
        self.count = 0;
        for source in self.entries.iter() {
            if let Some(key) = source.key {
                let dest = Self::find_entry(&entries, key);
                entries[dest] = *source;
                self.count += 1;
            }
        }
        self.entries = entries;
    }

    fn find_entry(entries: &[Entry], key: TableKey) -> usize {
        let capacity = entries.len();
        let mut index = key.hash as usize % capacity;
        let mut tombstone = None;
        for _ in 0..capacity {
            let entry = &entries[index];
            match entry.key {
                Some(k) if k.obj == key.obj => return index,
                Some(_) => {}
                None if entry.is_empty() => return tombstone.unwrap_or(index),
                None => {
                    tombstone.get_or_insert(index);
                }
            }
            index = (index + 1) % capacity;
        }
        // The load factor keeps at least one slot free, so the probe only
        // gets here when every free slot is a tombstone.
        tombstone.unwrap_or_else(|| unreachable!("Didn't find entry for {key:?}"))
    }
}

impl Debug for HashTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(k, v)| (k.obj, v)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = if cfg!(miri) { 17 } else { 2500 };

    fn key(i: u32) -> TableKey {
        // Deliberately poor hash so probe chains get long.
        TableKey {
            obj: ObjRef::from_index(i),
            hash: i % 7,
        }
    }

    #[test]
    fn insert() {
        let mut table = HashTable::new();
        let value = Value::Number(1.5);
        assert!(table.insert(key(1), value));
        assert!(!table.insert(key(1), value));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn insert_multiple() {
        let mut table = HashTable::new();
        for i in 0..MAX {
            let v = Value::Number(i as f64);
            assert!(table.insert(key(i), v), "{i}");
            assert_eq!(table.get(key(i)), Some(v), "{i}");
            assert!(!table.insert(key(i), v), "{i}");
        }
        for i in 0..MAX {
            assert_eq!(table.get(key(i)), Some(Value::Number(i as f64)), "{i}");
        }
        assert_eq!(table.len(), MAX as usize);
    }

    #[test]
    fn get() {
        let mut table = HashTable::new();
        let value = Value::Number(1.5);
        assert_eq!(table.get(key(3)), None);
        assert!(table.insert(key(3), value));
        assert_eq!(table.get(key(3)), Some(value));
        assert_eq!(table.get(key(10)), None);
    }

    #[test]
    fn delete() {
        let mut table = HashTable::new();
        for i in 0..MAX {
            let v = Value::Number(i as f64);
            assert!(table.insert(key(i), v), "{i}");
            assert!(table.delete(key(i)), "{i}");
            assert_eq!(table.get(key(i)), None, "{i}");
            assert!(!table.delete(key(i)), "{i}");
        }
        assert!(table.is_empty());
    }

    #[test]
    fn tombstones_keep_probe_chains() {
        let mut table = HashTable::new();
        // Same hash bucket: 0, 7 and 14 collide.
        for i in [0, 7, 14] {
            table.insert(key(i), Value::Number(i as f64));
        }
        assert!(table.delete(key(7)));
        assert_eq!(table.get(key(14)), Some(Value::Number(14.0)));
        // Reinsertion reuses the tombstone.
        assert!(table.insert(key(7), Value::Null));
        assert_eq!(table.get(key(7)), Some(Value::Null));
    }

    #[test]
    fn find_string_by_content() {
        let mut table = HashTable::new();
        table.insert(key(4), Value::Null);
        table.insert(key(11), Value::Null);
        let eleven = ObjRef::from_index(11);
        assert_eq!(table.find_string(4, |obj| obj == eleven), Some(eleven));
        assert_eq!(table.find_string(4, |_| false), None);
    }

    #[test]
    fn remove_white() {
        let mut table = HashTable::new();
        for i in 0..20 {
            table.insert(key(i), Value::Null);
        }
        table.remove_white(|obj| obj.index() % 2 == 0);
        assert_eq!(table.len(), 10);
        assert_eq!(table.get(key(2)), Some(Value::Null));
        assert_eq!(table.get(key(3)), None);
    }
}
