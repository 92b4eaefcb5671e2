//! The tagged-union value model shared by host and bridge code.
//!
//! [`Value`] is everything that can cross the host/engine boundary. Its
//! equality follows Lua 5.3 semantics: integers and floats compare
//! numerically, the two string representations compare by content, and all
//! reference kinds compare by identity. `Hash` is consistent with that
//! equality so values can serve as table keys.

mod args;
mod callback;
mod handle;
mod object;
mod table;

pub use args::ArgList;
pub use callback::{CallbackFault, CallbackOutcome, Continuation, HostCallback};
pub use handle::{
    CoroutineHandle, FunctionHandle, HandleReleaser, WeakCoroutineHandle, WeakFunctionHandle,
};
pub use object::{HostObject, HostObjectRef, ObjectClass};
pub use table::TableRef;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::ValueError;

/// An immutable, cheaply-shareable byte string.
///
/// This is the engine-independent representation of a Lua string that is
/// not valid UTF-8 (Lua strings are arbitrary byte sequences).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ByteString(Arc<[u8]>);

impl ByteString {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for ByteString {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

/// An opaque raw pointer surfaced from the engine (light userdata).
///
/// Carried as an address only; the host never dereferences it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawPtr(pub usize);

/// A dynamically-typed value crossing the host/engine boundary.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Host-native string (valid UTF-8).
    Str(String),
    /// Immutable byte-string (arbitrary bytes).
    Bytes(ByteString),
    Table(TableRef),
    Object(HostObjectRef),
    Function(FunctionHandle),
    Callback(HostCallback),
    Coroutine(CoroutineHandle),
    Pointer(RawPtr),
}

/// Exact integer/float comparison, Lua 5.3 style: compare mathematical
/// values without the precision loss of a blind `as f64` cast.
fn num_eq(i: i64, f: f64) -> bool {
    if f.is_nan() || f.is_infinite() {
        return false;
    }
    if f.fract() != 0.0 {
        return false;
    }
    // Integral float: safe to compare in the integer domain when in range.
    if f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
        f as i64 == i
    } else {
        false
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => num_eq(*a, *b),
            (Str(a), Str(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Str(a), Bytes(b)) | (Bytes(b), Str(a)) => a.as_bytes() == b.as_bytes(),
            (Table(a), Table(b)) => a.same_identity(b),
            (Object(a), Object(b)) => a == b,
            (Function(a), Function(b)) => a == b,
            (Callback(a), Callback(b)) => a.same_identity(b),
            (Coroutine(a), Coroutine(b)) => a == b,
            (Pointer(a), Pointer(b)) => a == b,
            _ => false,
        }
    }
}

// Table keys are guaranteed NaN-free (`TableRef::set` rejects NaN), so the
// reflexivity Eq requires holds for every value that can be a key.
impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        use Value::*;
        match self {
            Nil => state.write_u8(0),
            Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            Int(i) => {
                state.write_u8(2);
                i.hash(state);
            }
            Float(f) => {
                // Integral floats must hash like the equal integer.
                if f.fract() == 0.0 && *f >= -(2f64.powi(63)) && *f < 2f64.powi(63) {
                    state.write_u8(2);
                    (*f as i64).hash(state);
                } else {
                    state.write_u8(3);
                    f.to_bits().hash(state);
                }
            }
            // Both string kinds hash their bytes so content equality holds.
            Str(s) => {
                state.write_u8(4);
                s.as_bytes().hash(state);
            }
            Bytes(b) => {
                state.write_u8(4);
                b.as_bytes().hash(state);
            }
            Table(t) => {
                state.write_u8(5);
                t.identity().hash(state);
            }
            Object(o) => {
                state.write_u8(6);
                o.identity().hash(state);
            }
            Function(f) => {
                state.write_u8(7);
                f.identity().hash(state);
            }
            Callback(c) => {
                state.write_u8(8);
                c.identity().hash(state);
            }
            Coroutine(c) => {
                state.write_u8(9);
                c.identity().hash(state);
            }
            Pointer(p) => {
                state.write_u8(10);
                p.hash(state);
            }
        }
    }
}

impl Value {
    /// Kind name used in diagnostics, matching Lua's `type()` vocabulary
    /// where one exists.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Table(_) => "table",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Callback(_) => "callback",
            Value::Coroutine(_) => "coroutine",
            Value::Pointer(_) => "pointer",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Value::Float(_))
    }

    pub fn is_str(&self) -> bool {
        matches!(self, Value::Str(_))
    }

    pub fn is_bytes(&self) -> bool {
        matches!(self, Value::Bytes(_))
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Value::Table(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    pub fn is_coroutine(&self) -> bool {
        matches!(self, Value::Coroutine(_))
    }

    fn mismatch(&self, expected: &'static str) -> ValueError {
        ValueError::TypeMismatch {
            expected,
            actual: self.kind(),
        }
    }

    pub fn as_bool(&self) -> Result<bool, ValueError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.mismatch("boolean")),
        }
    }

    /// Exact integer accessor. No string coercion; floats are rejected even
    /// when integral, matching the "no implicit coercion" rule.
    pub fn as_int(&self) -> Result<i64, ValueError> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(other.mismatch("integer")),
        }
    }

    pub fn as_float(&self) -> Result<f64, ValueError> {
        match self {
            Value::Float(f) => Ok(*f),
            other => Err(other.mismatch("float")),
        }
    }

    /// Numeric accessor accepting either numeric kind.
    pub fn as_number(&self) -> Result<f64, ValueError> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            other => Err(other.mismatch("number")),
        }
    }

    pub fn as_str(&self) -> Result<&str, ValueError> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    /// Byte view over either string representation.
    pub fn as_string_bytes(&self) -> Result<&[u8], ValueError> {
        match self {
            Value::Str(s) => Ok(s.as_bytes()),
            Value::Bytes(b) => Ok(b.as_bytes()),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn as_table(&self) -> Result<&TableRef, ValueError> {
        match self {
            Value::Table(t) => Ok(t),
            other => Err(other.mismatch("table")),
        }
    }

    pub fn as_object(&self) -> Result<&HostObjectRef, ValueError> {
        match self {
            Value::Object(o) => Ok(o),
            other => Err(other.mismatch("object")),
        }
    }

    pub fn as_function(&self) -> Result<&FunctionHandle, ValueError> {
        match self {
            Value::Function(f) => Ok(f),
            other => Err(other.mismatch("function")),
        }
    }

    pub fn as_coroutine(&self) -> Result<&CoroutineHandle, ValueError> {
        match self {
            Value::Coroutine(c) => Ok(c),
            other => Err(other.mismatch("coroutine")),
        }
    }

    /// Lua truthiness: everything except `nil` and `false` is true.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Structural table comparison: reference-equality short-circuit, then
    /// identical array lengths and entry counts, then per-pair recursion.
    /// Non-table values fall back to ordinary equality.
    pub fn deep_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Table(a), Value::Table(b)) => a.deep_equals(b),
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Value::Str(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b.as_bytes())),
            Value::Table(t) => write!(f, "table: {:#x}", t.identity()),
            Value::Object(o) => write!(f, "object: {:#x}", o.identity()),
            Value::Function(h) => write!(f, "function: {}", h.id()),
            Value::Callback(c) => write!(f, "callback: {:#x}", c.identity()),
            Value::Coroutine(h) => write!(f, "coroutine: {}", h.id()),
            Value::Pointer(p) => write!(f, "pointer: {:#x}", p.0),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_float_compare_numerically() {
        assert_eq!(Value::Int(3), Value::Float(3.0));
        assert_ne!(Value::Int(3), Value::Float(3.5));
        assert_ne!(Value::Int(0), Value::Float(f64::NAN));
    }

    #[test]
    fn test_large_int_float_compare_exactly() {
        // 2^63 - 1 is not representable as f64; the nearest float is 2^63.
        assert_ne!(Value::Int(i64::MAX), Value::Float(9.223372036854776e18));
    }

    #[test]
    fn test_string_representations_compare_by_content() {
        let s = Value::Str("abc".into());
        let b = Value::Bytes(ByteString::from(&b"abc"[..]));
        assert_eq!(s, b);
        assert_ne!(s, Value::Bytes(ByteString::from(&b"abd"[..])));
    }

    #[test]
    fn test_tables_compare_by_identity() {
        let a = TableRef::new();
        let b = TableRef::new();
        assert_eq!(Value::Table(a.clone()), Value::Table(a.clone()));
        assert_ne!(Value::Table(a), Value::Table(b));
    }

    #[test]
    fn test_no_string_number_coercion() {
        assert_ne!(Value::Str("3".into()), Value::Int(3));
        assert!(Value::Str("3".into()).as_int().is_err());
    }

    #[test]
    fn test_accessor_error_names_both_kinds() {
        let err = Value::Bool(true).as_table().unwrap_err();
        assert_eq!(
            err,
            ValueError::TypeMismatch {
                expected: "table",
                actual: "boolean"
            }
        );
    }

    #[test]
    fn test_hash_consistency_across_numeric_kinds() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(Value::Int(2), "two");
        assert_eq!(map.get(&Value::Float(2.0)), Some(&"two"));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.truthy());
        assert!(!Value::Bool(false).truthy());
        assert!(Value::Int(0).truthy());
        assert!(Value::Str(String::new()).truthy());
    }

    #[test]
    fn test_deep_equals_on_structurally_equal_tables() {
        let a = TableRef::new();
        let b = TableRef::new();
        a.insert(Value::Int(1)).unwrap();
        a.insert(Value::Str("x".into())).unwrap();
        b.insert(Value::Int(1)).unwrap();
        b.insert(Value::Str("x".into())).unwrap();
        assert!(Value::Table(a.clone()).deep_equals(&Value::Table(b.clone())));

        b.set(Value::Str("k".into()), Value::Bool(true)).unwrap();
        assert!(!Value::Table(a).deep_equals(&Value::Table(b)));
    }
}
