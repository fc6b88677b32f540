//! The in-memory value model the codec round-trips.
//!
//! Leaves are owned directly. Composites (arrays, plain records, maps,
//! sets) live behind a shared [`Handle`] so that object identity, shared
//! subgraphs, and cycles survive an encode/decode round-trip. Identity is
//! pointer equality on handles; a cyclic graph stays alive until every
//! handle into it is dropped.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use num_bigint::BigInt;
use url::Url;

/// A rich value as seen by handlers and the session store.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    /// The "absent" marker, distinct from `Null`.
    Undefined,
    Bool(bool),
    /// A 64-bit float, covering infinities, NaN, and negative zero.
    Number(f64),
    BigInt(BigInt),
    String(String),
    Date(DateValue),
    RegExp(RegExpValue),
    Url(Url),
    Error(Box<ErrorValue>),
    /// A raw byte buffer.
    Bytes(Vec<u8>),
    TypedArray(TypedArrayValue),
    DataView(DataViewValue),
    Blob(BlobValue),
    /// An identity-bearing composite node.
    Composite(Handle),
}

/// An ISO date-time, or the explicit "invalid" sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum DateValue {
    Valid(DateTime<Utc>),
    Invalid,
}

impl DateValue {
    /// The wire form: RFC 3339 with milliseconds, or `"Invalid Date"`.
    pub fn to_wire(&self) -> String {
        match self {
            DateValue::Valid(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            DateValue::Invalid => "Invalid Date".to_string(),
        }
    }
}

/// A regular expression by source and flag string; never compiled here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegExpValue {
    pub source: String,
    pub flags: String,
}

/// An error value: name, message, and optional stack, code, and cause.
#[derive(Debug, Clone)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub code: Option<String>,
    pub cause: Option<Value>,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            code: None,
            cause: None,
        }
    }
}

/// Element kind of a typed numeric array view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Int8 => "int8",
            ElementKind::Uint8 => "uint8",
            ElementKind::Uint8Clamped => "uint8clamped",
            ElementKind::Int16 => "int16",
            ElementKind::Uint16 => "uint16",
            ElementKind::Int32 => "int32",
            ElementKind::Uint32 => "uint32",
            ElementKind::Float32 => "float32",
            ElementKind::Float64 => "float64",
            ElementKind::BigInt64 => "bigint64",
            ElementKind::BigUint64 => "biguint64",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "int8" => ElementKind::Int8,
            "uint8" => ElementKind::Uint8,
            "uint8clamped" => ElementKind::Uint8Clamped,
            "int16" => ElementKind::Int16,
            "uint16" => ElementKind::Uint16,
            "int32" => ElementKind::Int32,
            "uint32" => ElementKind::Uint32,
            "float32" => ElementKind::Float32,
            "float64" => ElementKind::Float64,
            "bigint64" => ElementKind::BigInt64,
            "biguint64" => ElementKind::BigUint64,
            _ => return None,
        })
    }

    /// Byte width of one element.
    pub fn element_size(&self) -> usize {
        match self {
            ElementKind::Int8 | ElementKind::Uint8 | ElementKind::Uint8Clamped => 1,
            ElementKind::Int16 | ElementKind::Uint16 => 2,
            ElementKind::Int32 | ElementKind::Uint32 | ElementKind::Float32 => 4,
            ElementKind::Float64 | ElementKind::BigInt64 | ElementKind::BigUint64 => 8,
        }
    }
}

/// A typed numeric array view. Bytes are the little-endian raw storage of
/// the logical element content; `source_offset` records the view's original
/// starting offset for the encode-time warning, and is reset to zero by the
/// decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedArrayValue {
    pub kind: ElementKind,
    pub bytes: Vec<u8>,
    pub source_offset: usize,
}

impl TypedArrayValue {
    pub fn new(kind: ElementKind, bytes: Vec<u8>) -> Self {
        Self {
            kind,
            bytes,
            source_offset: 0,
        }
    }
}

/// An aligned buffer view over raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataViewValue {
    pub bytes: Vec<u8>,
    pub source_offset: usize,
}

impl DataViewValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            source_offset: 0,
        }
    }
}

/// Byte source behind a blob. Reading is asynchronous; the synchronous
/// encoder refuses values containing blobs.
#[async_trait]
pub trait BlobSource: Send + Sync {
    /// Total byte length, known without reading.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Produce the full byte content.
    async fn read(&self) -> std::io::Result<Vec<u8>>;
}

/// An in-memory blob source.
pub struct MemoryBlob(pub Vec<u8>);

#[async_trait]
impl BlobSource for MemoryBlob {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    async fn read(&self) -> std::io::Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

/// An opaque byte blob carrying a media type and size.
#[derive(Clone)]
pub struct BlobValue {
    pub media_type: String,
    pub size: u64,
    pub source: Arc<dyn BlobSource>,
}

impl BlobValue {
    pub fn from_bytes(media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self {
            media_type: media_type.into(),
            size,
            source: Arc::new(MemoryBlob(bytes)),
        }
    }
}

impl std::fmt::Debug for BlobValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobValue")
            .field("media_type", &self.media_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// The interior of a composite node.
#[derive(Debug)]
pub enum Composite {
    Array(Vec<Value>),
    /// A plain keyed record; key order is preserved.
    Object(IndexMap<String, Value>),
    /// A keyed mapping with arbitrary key types; entry order is preserved.
    Map(Vec<(Value, Value)>),
    /// An unordered uniqueness set; element order is preserved on the wire.
    Set(Vec<Value>),
}

/// Shared, mutable handle to a composite node. Cloning a handle preserves
/// identity; `ptr_eq` compares it.
#[derive(Clone)]
pub struct Handle(Arc<RwLock<Composite>>);

impl Handle {
    pub fn new(composite: Composite) -> Self {
        Self(Arc::new(RwLock::new(composite)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Composite> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Composite> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Stable address for identity tables during a single encode pass.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Cycles make a full debug print diverge; show the node kind only.
        let kind = match &*self.read() {
            Composite::Array(items) => format!("Array(len={})", items.len()),
            Composite::Object(map) => format!("Object(len={})", map.len()),
            Composite::Map(entries) => format!("Map(len={})", entries.len()),
            Composite::Set(items) => format!("Set(len={})", items.len()),
        };
        write!(f, "Handle({kind})")
    }
}

impl Value {
    // ── constructors ──────────────────────────────────────────────

    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn int(n: i64) -> Self {
        Value::Number(n as f64)
    }

    pub fn bigint(n: impl Into<BigInt>) -> Self {
        Value::BigInt(n.into())
    }

    pub fn date(dt: DateTime<Utc>) -> Self {
        Value::Date(DateValue::Valid(dt))
    }

    pub fn invalid_date() -> Self {
        Value::Date(DateValue::Invalid)
    }

    pub fn regexp(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Value::RegExp(RegExpValue {
            source: source.into(),
            flags: flags.into(),
        })
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Value::Error(Box::new(ErrorValue::new(name, message)))
    }

    pub fn blob(media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Value::Blob(BlobValue::from_bytes(media_type, bytes))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Composite(Handle::new(Composite::Array(items)))
    }

    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect::<IndexMap<_, _>>();
        Value::Composite(Handle::new(Composite::Object(map)))
    }

    pub fn map(entries: Vec<(Value, Value)>) -> Self {
        Value::Composite(Handle::new(Composite::Map(entries)))
    }

    pub fn set(items: Vec<Value>) -> Self {
        Value::Composite(Handle::new(Composite::Set(items)))
    }

    // ── accessors ─────────────────────────────────────────────────

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<&BigInt> {
        match self {
            Value::BigInt(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&Handle> {
        match self {
            Value::Composite(h) => Some(h),
            _ => None,
        }
    }

    /// Field of a plain record, cloned.
    pub fn get(&self, key: &str) -> Option<Value> {
        match &*self.as_handle()?.read() {
            Composite::Object(map) => map.get(key).cloned(),
            _ => None,
        }
    }

    /// Element of an array, cloned.
    pub fn at(&self, index: usize) -> Option<Value> {
        match &*self.as_handle()?.read() {
            Composite::Array(items) => items.get(index).cloned(),
            _ => None,
        }
    }

    /// Value for a map key, compared by [`Value::deep_eq`].
    pub fn map_get(&self, key: &Value) -> Option<Value> {
        match &*self.as_handle()?.read() {
            Composite::Map(entries) => entries
                .iter()
                .find(|(k, _)| k.deep_eq(key))
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    /// Whether a set contains an element, compared by [`Value::deep_eq`].
    pub fn set_has(&self, item: &Value) -> bool {
        match self.as_handle().map(|h| h.read()) {
            Some(guard) => match &*guard {
                Composite::Set(items) => items.iter().any(|v| v.deep_eq(item)),
                _ => false,
            },
            None => false,
        }
    }

    /// Number of children of a composite node.
    pub fn len(&self) -> Option<usize> {
        let handle = self.as_handle()?;
        let len = match &*handle.read() {
            Composite::Array(items) => items.len(),
            Composite::Object(map) => map.len(),
            Composite::Map(entries) => entries.len(),
            Composite::Set(items) => items.len(),
        };
        Some(len)
    }

    /// Structural equality that also terminates on cyclic graphs.
    ///
    /// Two composites already being compared are assumed equal (the
    /// coinductive reading), so isomorphic cycles compare equal. NaN
    /// equals NaN; negative zero differs from zero.
    pub fn deep_eq(&self, other: &Value) -> bool {
        let mut in_progress = Vec::new();
        deep_eq_inner(self, other, &mut in_progress)
    }
}

fn number_eq(a: f64, b: f64) -> bool {
    a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
}

fn deep_eq_inner(a: &Value, b: &Value, in_progress: &mut Vec<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Undefined, Value::Undefined) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => number_eq(*x, *y),
        (Value::BigInt(x), Value::BigInt(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Date(x), Value::Date(y)) => x == y,
        (Value::RegExp(x), Value::RegExp(y)) => x == y,
        (Value::Url(x), Value::Url(y)) => x == y,
        (Value::Error(x), Value::Error(y)) => {
            x.name == y.name
                && x.message == y.message
                && x.stack == y.stack
                && x.code == y.code
                && match (&x.cause, &y.cause) {
                    (None, None) => true,
                    (Some(cx), Some(cy)) => deep_eq_inner(cx, cy, in_progress),
                    _ => false,
                }
        }
        (Value::Bytes(x), Value::Bytes(y)) => x == y,
        (Value::TypedArray(x), Value::TypedArray(y)) => x.kind == y.kind && x.bytes == y.bytes,
        (Value::DataView(x), Value::DataView(y)) => x.bytes == y.bytes,
        // Blobs compare by metadata; their byte content is behind an async source.
        (Value::Blob(x), Value::Blob(y)) => x.media_type == y.media_type && x.size == y.size,
        (Value::Composite(ha), Value::Composite(hb)) => {
            if ha.ptr_eq(hb) {
                return true;
            }
            let pair = (ha.addr(), hb.addr());
            if in_progress.contains(&pair) {
                return true;
            }
            in_progress.push(pair);
            let result = match (&*ha.read(), &*hb.read()) {
                (Composite::Array(xs), Composite::Array(ys)) => {
                    xs.len() == ys.len()
                        && xs
                            .iter()
                            .zip(ys)
                            .all(|(x, y)| deep_eq_inner(x, y, in_progress))
                }
                (Composite::Object(xs), Composite::Object(ys)) => {
                    xs.len() == ys.len()
                        && xs.iter().zip(ys).all(|((kx, x), (ky, y))| {
                            kx == ky && deep_eq_inner(x, y, in_progress)
                        })
                }
                (Composite::Map(xs), Composite::Map(ys)) => {
                    xs.len() == ys.len()
                        && xs.iter().zip(ys).all(|((kx, x), (ky, y))| {
                            deep_eq_inner(kx, ky, in_progress)
                                && deep_eq_inner(x, y, in_progress)
                        })
                }
                (Composite::Set(xs), Composite::Set(ys)) => {
                    xs.len() == ys.len()
                        && xs
                            .iter()
                            .zip(ys)
                            .all(|(x, y)| deep_eq_inner(x, y, in_progress))
                }
                _ => false,
            };
            in_progress.pop();
            result
        }
        _ => false,
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_identity_is_preserved_by_clone() {
        let v = Value::object([("a", Value::int(1))]);
        let w = v.clone();
        let (h1, h2) = (v.as_handle().unwrap(), w.as_handle().unwrap());
        assert!(h1.ptr_eq(h2));
    }

    #[test]
    fn deep_eq_compares_structure() {
        let a = Value::object([("x", Value::int(1)), ("y", Value::string("s"))]);
        let b = Value::object([("x", Value::int(1)), ("y", Value::string("s"))]);
        let c = Value::object([("y", Value::string("s")), ("x", Value::int(1))]);
        assert!(a.deep_eq(&b));
        // Key order is part of record equality.
        assert!(!a.deep_eq(&c));
    }

    #[test]
    fn deep_eq_handles_nan_and_negative_zero() {
        assert!(Value::Number(f64::NAN).deep_eq(&Value::Number(f64::NAN)));
        assert!(!Value::Number(0.0).deep_eq(&Value::Number(-0.0)));
    }

    #[test]
    fn deep_eq_terminates_on_cycles() {
        let a = Value::object([("name", Value::string("A"))]);
        let b = Value::object([("name", Value::string("A"))]);
        if let Composite::Object(map) = &mut *a.as_handle().unwrap().write() {
            map.insert("next".into(), a.clone());
        }
        if let Composite::Object(map) = &mut *b.as_handle().unwrap().write() {
            map.insert("next".into(), b.clone());
        }
        assert!(a.deep_eq(&b));
    }

    #[test]
    fn map_get_finds_by_value_equality() {
        let m = Value::map(vec![(Value::string("k"), Value::string("v"))]);
        assert_eq!(
            m.map_get(&Value::string("k")).unwrap().as_str(),
            Some("v")
        );
        assert!(m.map_get(&Value::string("missing")).is_none());
    }

    #[test]
    fn element_kind_round_trips_names() {
        for kind in [
            ElementKind::Int8,
            ElementKind::Uint8,
            ElementKind::Uint8Clamped,
            ElementKind::Int16,
            ElementKind::Uint16,
            ElementKind::Int32,
            ElementKind::Uint32,
            ElementKind::Float32,
            ElementKind::Float64,
            ElementKind::BigInt64,
            ElementKind::BigUint64,
        ] {
            assert_eq!(ElementKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ElementKind::from_str("float16"), None);
    }
}
