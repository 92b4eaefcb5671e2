//! Mutable, reference-typed tables with a cached array length.
//!
//! A table is a map from `Value` to `Value` plus `array_len`: the length of
//! the longest contiguous run of integer keys `1..N` currently present.
//! The cache is maintained incrementally — it grows greedily when key
//! `array_len + 1` is assigned and truncates when a key inside the run is
//! deleted — so it is always consistent with the live key set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::ValueError;

use super::Value;

#[derive(Debug, Default)]
struct TableData {
    map: HashMap<Value, Value>,
    array_len: usize,
}

/// A shared, mutable table. Clones alias the same storage; equality between
/// `Value::Table`s is identity of that storage.
#[derive(Clone, Debug, Default)]
pub struct TableRef(Arc<Mutex<TableData>>);

/// Reject invalid keys and normalize integral float keys to integer keys
/// (Lua 5.3 key semantics: `t[2.0]` and `t[2]` are the same slot).
fn normalize_key(key: Value) -> Result<Value, ValueError> {
    match key {
        Value::Nil => Err(ValueError::NilKey),
        Value::Float(f) if f.is_nan() => Err(ValueError::NanKey),
        Value::Float(f) if f.fract() == 0.0 && f >= -(2f64.powi(63)) && f < 2f64.powi(63) => {
            Ok(Value::Int(f as i64))
        }
        other => Ok(other),
    }
}

impl TableRef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stable identity of the underlying storage.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub(crate) fn same_identity(&self, other: &TableRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // A poisoned lock only means another thread panicked mid-operation;
    // table data stays usable, so recover rather than propagate.
    fn lock(&self) -> MutexGuard<'_, TableData> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current cached array length.
    pub fn array_len(&self) -> usize {
        self.lock().array_len
    }

    /// Total number of entries (array and hash part together).
    pub fn entry_count(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    /// Look up a key; missing keys yield `Nil`, never an error.
    pub fn get(&self, key: &Value) -> Value {
        let key = match normalize_key(key.clone()) {
            Ok(k) => k,
            Err(_) => return Value::Nil,
        };
        self.lock().map.get(&key).cloned().unwrap_or(Value::Nil)
    }

    /// Assign a key. A nil value deletes the key; a nil or NaN key fails.
    pub fn set(&self, key: Value, value: Value) -> Result<(), ValueError> {
        let key = normalize_key(key)?;
        let mut data = self.lock();
        if value.is_nil() {
            if data.map.remove(&key).is_some()
                && let Value::Int(n) = key
                && n >= 1
                && (n as usize) <= data.array_len
            {
                data.array_len = (n - 1) as usize;
            }
            return Ok(());
        }
        data.map.insert(key.clone(), value);
        if let Value::Int(n) = key
            && n >= 1
            && n as usize == data.array_len + 1
        {
            // Greedy extension across any previously-stranded integer keys.
            data.array_len = n as usize;
            while data.map.contains_key(&Value::Int(data.array_len as i64 + 1)) {
                data.array_len += 1;
            }
        }
        Ok(())
    }

    /// Append at position `array_len + 1`.
    pub fn insert(&self, value: Value) -> Result<(), ValueError> {
        let index = self.array_len() as i64 + 1;
        self.set(Value::Int(index), value)
    }

    /// Insert at `index`, shifting entries `index..=array_len` up by one.
    /// Valid for `1 <= index <= array_len + 1`.
    pub fn insert_at(&self, index: i64, value: Value) -> Result<(), ValueError> {
        let mut data = self.lock();
        let len = data.array_len;
        if index < 1 || index as usize > len + 1 {
            return Err(ValueError::IndexOutOfRange { index, len });
        }
        for i in (index as usize..=len).rev() {
            if let Some(v) = data.map.remove(&Value::Int(i as i64)) {
                data.map.insert(Value::Int(i as i64 + 1), v);
            }
        }
        data.map.insert(Value::Int(index), value);
        data.array_len = len + 1;
        while data.map.contains_key(&Value::Int(data.array_len as i64 + 1)) {
            data.array_len += 1;
        }
        Ok(())
    }

    /// Remove the entry at `index`, shifting entries down and clearing the
    /// vacated trailing slot. Valid for `1 <= index <= array_len`.
    /// Returns the removed value.
    pub fn remove(&self, index: i64) -> Result<Value, ValueError> {
        let mut data = self.lock();
        let len = data.array_len;
        if index < 1 || index as usize > len {
            return Err(ValueError::IndexOutOfRange { index, len });
        }
        let removed = data
            .map
            .remove(&Value::Int(index))
            .unwrap_or(Value::Nil);
        for i in index as usize + 1..=len {
            if let Some(v) = data.map.remove(&Value::Int(i as i64)) {
                data.map.insert(Value::Int(i as i64 - 1), v);
            }
        }
        data.array_len = len - 1;
        Ok(removed)
    }

    /// Snapshot of all entries, for iteration and marshalling. Order is
    /// unspecified, matching Lua's `pairs`.
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.lock()
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Structural comparison per the value model: identity short-circuit,
    /// then array length and entry count, then every pair.
    pub fn deep_equals(&self, other: &TableRef) -> bool {
        if self.same_identity(other) {
            return true;
        }
        // Lock ordering by identity so aliased comparisons cannot deadlock.
        let (first, second) = if self.identity() <= other.identity() {
            (self, other)
        } else {
            (other, self)
        };
        let a = first.lock();
        let b = second.lock();
        if a.array_len != b.array_len || a.map.len() != b.map.len() {
            return false;
        }
        let pairs: Vec<(Value, Value)> = a.map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let b_snapshot: HashMap<Value, Value> = b.map.clone();
        drop(a);
        drop(b);
        pairs.iter().all(|(k, va)| match b_snapshot.get(k) {
            Some(vb) => va.deep_equals(vb),
            None => false,
        })
    }
}
