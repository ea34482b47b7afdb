//! table.rs — open-addressed hash table, per `spec.md` §4.5.
//!
//! Grounded on `original_source/Olive-bci/table.c`: linear probing,
//! tombstone deletion (`key = Null`, `value = Bool(true)`), 0.75 max load
//! factor, and `tableSetGlobal`'s insert-only-if-new semantics (used by the
//! compiler for `global_constant_index`).
//!
//! Keys are heterogeneous `Value`s (`Bool`/`Null`/`Number`/`String`-object).
//! The original hashes a string key via `ObjString::hash` (content FNV-1a);
//! here a `String` key is an already-interned `ObjHandle`, and the intern
//! invariant (equal content => equal handle, enforced by `Heap::intern_str`)
//! means two keys compare equal iff their handles are equal — so hashing and
//! comparing a `String` key needs only the handle's index, never the `Heap`.
//! Content-based hashing happens exactly once, earlier, inside the intern
//! table itself (`heap::StringInterner`).

use crate::value::{Value, ValueKind};

const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy, PartialEq)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(Value, Value),
}

#[derive(Clone)]
pub struct Table {
    entries: Vec<Slot>,
    count: usize, // occupied + tombstones, mirrors the original's `table->count`
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|s| matches!(s, Slot::Occupied(..)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hash_key(key: &Value) -> u32 {
        match key.kind {
            ValueKind::Bool(b) => u32::from(b),
            ValueKind::Null | ValueKind::Newline => 0,
            ValueKind::Number(n) => (n.to_bits() as u32) ^ ((n.to_bits() >> 32) as u32),
            ValueKind::Obj(h) => h.index().wrapping_mul(2_654_435_761),
        }
    }

    fn keys_equal(a: &Value, b: &Value) -> bool {
        match (a.kind, b.kind) {
            (ValueKind::Bool(x), ValueKind::Bool(y)) => x == y,
            (ValueKind::Null, ValueKind::Null) => true,
            (ValueKind::Newline, ValueKind::Newline) => true,
            (ValueKind::Number(x), ValueKind::Number(y)) => x == y,
            (ValueKind::Obj(x), ValueKind::Obj(y)) => x == y,
            _ => false,
        }
    }

    /// Find the entry for `key`, or the first empty/tombstone slot a new
    /// insertion should use. Returns the slot index.
    fn find_entry(&self, key: &Value) -> usize {
        let cap = self.entries.len();
        let mut index = (Self::hash_key(key) as usize) % cap;
        let mut tombstone: Option<usize> = None;
        loop {
            match &self.entries[index] {
                Slot::Empty => return tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _) => {
                    if Self::keys_equal(k, key) {
                        return index;
                    }
                }
            }
            index = (index + 1) % cap;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let old = std::mem::replace(&mut self.entries, vec![Slot::Empty; new_capacity]);
        self.count = 0;
        for slot in old {
            if let Slot::Occupied(k, v) = slot {
                let idx = self.find_entry(&k);
                self.entries[idx] = Slot::Occupied(k, v);
                self.count += 1;
            }
        }
    }

    fn ensure_capacity(&mut self) {
        if self.entries.is_empty() {
            self.grow(8);
            return;
        }
        if (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD {
            self.grow(self.entries.len() * 2);
        }
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        match &self.entries[self.find_entry(key)] {
            Slot::Occupied(_, v) => Some(*v),
            _ => None,
        }
    }

    /// Inserts or overwrites. Returns `true` if this created a new key.
    pub fn set(&mut self, key: Value, value: Value) -> bool {
        self.ensure_capacity();
        let idx = self.find_entry(&key);
        let is_new = !matches!(self.entries[idx], Slot::Occupied(..));
        if is_new && matches!(self.entries[idx], Slot::Empty) {
            self.count += 1;
        }
        self.entries[idx] = Slot::Occupied(key, value);
        is_new
    }

    /// Insert only if `key` is new; never overwrites an existing value.
    /// Used by the compiler for `global_constant_index` (§3, §4.5).
    pub fn set_global(&mut self, key: Value, value: Value) -> bool {
        self.ensure_capacity();
        let idx = self.find_entry(&key);
        let is_new = !matches!(self.entries[idx], Slot::Occupied(..));
        if is_new {
            if matches!(self.entries[idx], Slot::Empty) {
                self.count += 1;
            }
            self.entries[idx] = Slot::Occupied(key, value);
        }
        is_new
    }

    pub fn delete(&mut self, key: &Value) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = self.find_entry(key);
        if !matches!(self.entries[idx], Slot::Occupied(..)) {
            return false;
        }
        self.entries[idx] = Slot::Tombstone;
        true
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    /// Copies every entry of `from` into `self`, overwriting on conflict.
    /// Used for `INHERIT` (copying the base class's method table).
    pub fn add_all(&mut self, from: &Table) {
        for slot in &from.entries {
            if let Slot::Occupied(k, v) = slot {
                self.set(*k, *v);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().filter_map(|s| match s {
            Slot::Occupied(k, v) => Some((*k, *v)),
            _ => None,
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn set_get_delete_roundtrip() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern_str("x");
        assert!(table.set(Value::obj(key), Value::number(1.0)));
        assert_eq!(table.get(&Value::obj(key)), Some(Value::number(1.0)));
        assert!(!table.set(Value::obj(key), Value::number(2.0)));
        assert_eq!(table.get(&Value::obj(key)), Some(Value::number(2.0)));
        assert!(table.delete(&Value::obj(key)));
        assert_eq!(table.get(&Value::obj(key)), None);
    }

    #[test]
    fn set_global_does_not_overwrite() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern_str("y");
        assert!(table.set_global(Value::obj(key), Value::number(1.0)));
        assert!(!table.set_global(Value::obj(key), Value::number(99.0)));
        assert_eq!(table.get(&Value::obj(key)), Some(Value::number(1.0)));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..100 {
            let key = heap.intern_str(&format!("k{i}"));
            table.set(Value::obj(key), Value::number(f64::from(i)));
        }
        assert_eq!(table.len(), 100);
        for i in 0..100 {
            let key = heap.intern_str(&format!("k{i}"));
            assert_eq!(table.get(&Value::obj(key)), Some(Value::number(f64::from(i))));
        }
    }

    #[test]
    fn interning_gives_same_handle() {
        let mut heap = Heap::new();
        let a = heap.intern_str("same");
        let b = heap.intern_str("same");
        assert_eq!(a, b);
    }
}
