//! Immutable, positionally-indexed argument/result lists.
//!
//! Call sites overwhelmingly pass 0–4 values, so small lists live inline
//! without touching the heap. Larger lists share an `Arc<[Value]>` slice,
//! which makes `select` sub-range views and tail concatenation O(1) clones
//! of the backing storage instead of full copies.

use std::fmt;
use std::sync::Arc;

use super::Value;

const INLINE_CAP: usize = 4;

#[derive(Clone, Debug)]
enum Repr {
    Inline { buf: [Value; INLINE_CAP], len: u8 },
    Shared { values: Arc<[Value]>, start: usize, len: usize },
}

/// An immutable sequence of values representing call arguments or results.
/// Indexing past the end yields `Nil`, never an error.
#[derive(Clone, Debug)]
pub struct ArgList(Repr);

impl ArgList {
    pub fn empty() -> Self {
        Self(Repr::Inline {
            buf: [const { Value::Nil }; INLINE_CAP],
            len: 0,
        })
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        if values.len() <= INLINE_CAP {
            let mut buf = [const { Value::Nil }; INLINE_CAP];
            let len = values.len() as u8;
            for (slot, v) in buf.iter_mut().zip(values) {
                *slot = v;
            }
            Self(Repr::Inline { buf, len })
        } else {
            let len = values.len();
            Self(Repr::Shared {
                values: values.into(),
                start: 0,
                len,
            })
        }
    }

    pub fn of(values: &[Value]) -> Self {
        Self::from_values(values.to_vec())
    }

    pub fn len(&self) -> usize {
        match &self.0 {
            Repr::Inline { len, .. } => *len as usize,
            Repr::Shared { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slice(&self) -> &[Value] {
        match &self.0 {
            Repr::Inline { buf, len } => &buf[..*len as usize],
            Repr::Shared { values, start, len } => &values[*start..*start + *len],
        }
    }

    /// Positional access; out-of-range yields `Nil`.
    pub fn get(&self, index: usize) -> Value {
        self.slice().get(index).cloned().unwrap_or(Value::Nil)
    }

    pub fn first(&self) -> Value {
        self.get(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.slice().iter()
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.slice().to_vec()
    }

    /// Sub-range view from `offset` to the end, Lua `select(offset+1, ...)`
    /// style. O(1) on shared lists; inline lists copy at most four values.
    pub fn select(&self, offset: usize) -> ArgList {
        let len = self.len();
        if offset >= len {
            return ArgList::empty();
        }
        match &self.0 {
            Repr::Inline { .. } => ArgList::of(&self.slice()[offset..]),
            Repr::Shared { values, start, .. } => Self(Repr::Shared {
                values: Arc::clone(values),
                start: start + offset,
                len: len - offset,
            }),
        }
    }

    /// Concatenation without copying when either side is empty and without
    /// heap allocation when the combined length stays inline.
    pub fn concat(&self, other: &ArgList) -> ArgList {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let total = self.len() + other.len();
        if total <= INLINE_CAP {
            let mut buf = [const { Value::Nil }; INLINE_CAP];
            for (slot, v) in buf.iter_mut().zip(self.iter().chain(other.iter())) {
                *slot = v.clone();
            }
            Self(Repr::Inline {
                buf,
                len: total as u8,
            })
        } else {
            let mut values = Vec::with_capacity(total);
            values.extend(self.iter().cloned());
            values.extend(other.iter().cloned());
            Self::from_values(values)
        }
    }
}

impl Default for ArgList {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for ArgList {
    fn eq(&self, other: &Self) -> bool {
        self.slice() == other.slice()
    }
}

impl From<Vec<Value>> for ArgList {
    fn from(values: Vec<Value>) -> Self {
        Self::from_values(values)
    }
}

impl FromIterator<Value> for ArgList {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self::from_values(iter.into_iter().collect())
    }
}

impl fmt::Display for ArgList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> ArgList {
        values.iter().map(|i| Value::Int(*i)).collect()
    }

    #[test]
    fn test_index_past_end_yields_nil() {
        let args = ints(&[1, 2]);
        assert_eq!(args.get(0), Value::Int(1));
        assert_eq!(args.get(2), Value::Nil);
        assert_eq!(ArgList::empty().get(0), Value::Nil);
    }

    #[test]
    fn test_small_lists_stay_inline() {
        let args = ints(&[1, 2, 3, 4]);
        assert!(matches!(args.0, Repr::Inline { .. }));
        assert_eq!(args.len(), 4);
    }

    #[test]
    fn test_overflow_lists_share_storage() {
        let args = ints(&[1, 2, 3, 4, 5, 6]);
        assert!(matches!(args.0, Repr::Shared { .. }));
        assert_eq!(args.get(5), Value::Int(6));
    }

    #[test]
    fn test_select_view_on_shared_list() {
        let args = ints(&[10, 20, 30, 40, 50]);
        let tail = args.select(2);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail.get(0), Value::Int(30));
        assert_eq!(tail.get(2), Value::Int(50));
        // A view of a view still works.
        let tail2 = tail.select(1);
        assert_eq!(tail2.get(0), Value::Int(40));
    }

    #[test]
    fn test_select_past_end_is_empty() {
        assert!(ints(&[1]).select(5).is_empty());
    }

    #[test]
    fn test_concat() {
        let a = ints(&[1, 2]);
        let b = ints(&[3]);
        assert_eq!(a.concat(&b), ints(&[1, 2, 3]));
        assert_eq!(a.concat(&ArgList::empty()), a);
        assert_eq!(ArgList::empty().concat(&b), b);

        let big = ints(&[1, 2, 3]).concat(&ints(&[4, 5, 6]));
        assert_eq!(big.len(), 6);
        assert_eq!(big.get(5), Value::Int(6));
    }
}
