//! Loosely-typed values produced by parsers, before sanitization.
//!
//! Parsers hand back [`RawValue`] trees that may contain:
//!
//! - native primitives (`Int`, `Float`, `Str`, ...),
//! - shared compound nodes ([`SharedList`], [`SharedMap`]) whose pointer identity is stable, so
//!   the same node can appear in several branches or even inside itself,
//! - foreign values ([`ForeignValue`]): boxed numerics, tensors, and attribute bags coming from
//!   numeric libraries that do not map onto JSON directly.
//!
//! Nothing in this module guarantees JSON safety; that is the sanitizer's job.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use time::OffsetDateTime;

/// Shared, mutable ordered sequence. Identity is the `Arc` pointer.
pub type SharedList = Arc<RwLock<Vec<RawValue>>>;
/// Shared, mutable key/value node. Keys are values too (foreign integer keys are legal).
pub type SharedMap = Arc<RwLock<Vec<(RawValue, RawValue)>>>;

/// A value as produced by a parser.
#[derive(Clone)]
pub enum RawValue {
    /// Absent value.
    Null,
    /// Native boolean.
    Bool(bool),
    /// Native signed integer.
    Int(i64),
    /// Native unsigned integer (only used above `i64::MAX` by JSON conversion).
    UInt(u64),
    /// Native double; may be non-finite.
    Float(f64),
    /// Native string.
    Str(String),
    /// Point in time, rendered as RFC 3339.
    Timestamp(OffsetDateTime),
    /// Opaque bytes, rendered as UTF-8 when possible.
    Bytes(Vec<u8>),
    /// Ordered sequence.
    List(SharedList),
    /// Mapping.
    Map(SharedMap),
    /// Value from a foreign numeric library or any other introspectable object.
    Foreign(Arc<dyn ForeignValue>),
}

/// Native scalar a foreign value can coerce into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeScalar {
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Double precision float.
    Float(f64),
    /// Boolean.
    Bool(bool),
}

/// Capability checks for values that are not native JSON primitives.
///
/// The sanitizer probes these in declaration order and stops at the first `Some`:
/// scalar coercion, element conversion, field introspection, then string description.
/// Every method defaults to `None`, so an implementation only answers what it can.
pub trait ForeignValue: Send + Sync {
    /// Library-level type name, used in logs.
    fn type_name(&self) -> &str;

    /// Coerce a boxed scalar into the nearest native scalar.
    fn as_scalar(&self) -> Option<NativeScalar> {
        None
    }

    /// Convert an array-like value into an ordered sequence.
    fn as_elements(&self) -> Option<Vec<RawValue>> {
        None
    }

    /// Expose a finite field set to be treated as a mapping.
    fn fields(&self) -> Option<Vec<(String, RawValue)>> {
        None
    }

    /// Best-effort string representation.
    fn describe(&self) -> Option<String> {
        None
    }
}

impl RawValue {
    /// Build a shared list node.
    pub fn list(items: impl IntoIterator<Item = RawValue>) -> Self {
        Self::List(Arc::new(RwLock::new(items.into_iter().collect())))
    }

    /// Build a shared map node.
    pub fn map<K: Into<RawValue>>(entries: impl IntoIterator<Item = (K, RawValue)>) -> Self {
        Self::Map(Arc::new(RwLock::new(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )))
    }

    /// Build an empty map node, typically to be filled (or made cyclic) with [`RawValue::insert`].
    pub fn empty_map() -> Self {
        Self::map(Vec::<(RawValue, RawValue)>::new())
    }

    /// Wrap a foreign value.
    pub fn foreign(value: impl ForeignValue + 'static) -> Self {
        Self::Foreign(Arc::new(value))
    }

    /// Insert or replace an entry in a map node. Returns `false` for non-map values.
    pub fn insert(&self, key: impl Into<RawValue>, value: RawValue) -> bool {
        let Self::Map(map) = self else {
            return false;
        };
        let key = key.into();
        let mut entries = map.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = entries
            .iter_mut()
            .find(|(existing, _)| existing.same_key(&key))
        {
            slot.1 = value;
        } else {
            entries.push((key, value));
        }
        true
    }

    /// Append to a list node. Returns `false` for non-list values.
    pub fn push(&self, value: RawValue) -> bool {
        let Self::List(list) = self else {
            return false;
        };
        list.write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
        true
    }

    /// Pointer identity of compound values; `None` for primitives.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Self::List(list) => Some(Arc::as_ptr(list) as *const () as usize),
            Self::Map(map) => Some(Arc::as_ptr(map) as *const () as usize),
            Self::Foreign(value) => Some(Arc::as_ptr(value) as *const () as usize),
            _ => None,
        }
    }

    /// Whether this is [`RawValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Number of entries in a list or map node.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::List(list) => Some(list.read().unwrap_or_else(PoisonError::into_inner).len()),
            Self::Map(map) => Some(map.read().unwrap_or_else(PoisonError::into_inner).len()),
            _ => None,
        }
    }

    fn same_key(&self, other: &RawValue) -> bool {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::UInt(a), Self::UInt(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Null, Self::Null) => true,
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Debug for RawValue {
    // Compound nodes print as summaries so cyclic graphs stay printable.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(value) => write!(f, "Bool({value})"),
            Self::Int(value) => write!(f, "Int({value})"),
            Self::UInt(value) => write!(f, "UInt({value})"),
            Self::Float(value) => write!(f, "Float({value})"),
            Self::Str(value) => write!(f, "Str({value:?})"),
            Self::Timestamp(value) => write!(f, "Timestamp({value})"),
            Self::Bytes(value) => write!(f, "Bytes(len={})", value.len()),
            Self::List(_) => write!(f, "List(len={})", self.len().unwrap_or_default()),
            Self::Map(_) => write!(f, "Map(len={})", self.len().unwrap_or_default()),
            Self::Foreign(value) => write!(f, "Foreign({})", value.type_name()),
        }
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(flag),
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    Self::Int(int)
                } else if let Some(uint) = number.as_u64() {
                    Self::UInt(uint)
                } else {
                    Self::Float(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(text) => Self::Str(text),
            Value::Array(items) => Self::list(items.into_iter().map(Self::from)),
            Value::Object(entries) => Self::map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Self::from(value))),
            ),
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for RawValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<usize> for RawValue {
    fn from(value: usize) -> Self {
        i64::try_from(value)
            .map(Self::Int)
            .unwrap_or(Self::UInt(value as u64))
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<OffsetDateTime> for RawValue {
    fn from(value: OffsetDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<RawValue>> From<Option<T>> for RawValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Boxed scalar as emitted by numeric libraries (one variant per dtype).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    /// 8-bit signed integer.
    Int8(i8),
    /// 16-bit signed integer.
    Int16(i16),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 8-bit unsigned integer.
    UInt8(u8),
    /// 16-bit unsigned integer.
    UInt16(u16),
    /// 32-bit unsigned integer.
    UInt32(u32),
    /// 64-bit unsigned integer.
    UInt64(u64),
    /// IEEE half precision, stored as raw bits.
    Float16(u16),
    /// Single precision float.
    Float32(f32),
    /// Double precision float.
    Float64(f64),
    /// Boolean.
    Bool(bool),
    /// Complex number; has no native JSON counterpart.
    Complex64 {
        /// Real part.
        re: f32,
        /// Imaginary part.
        im: f32,
    },
}

impl Scalar {
    /// Library-style dtype name.
    pub fn dtype(&self) -> &'static str {
        match self {
            Self::Int8(_) => "int8",
            Self::Int16(_) => "int16",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::UInt8(_) => "uint8",
            Self::UInt16(_) => "uint16",
            Self::UInt32(_) => "uint32",
            Self::UInt64(_) => "uint64",
            Self::Float16(_) => "float16",
            Self::Float32(_) => "float32",
            Self::Float64(_) => "float64",
            Self::Bool(_) => "bool",
            Self::Complex64 { .. } => "complex64",
        }
    }
}

impl ForeignValue for Scalar {
    fn type_name(&self) -> &str {
        self.dtype()
    }

    fn as_scalar(&self) -> Option<NativeScalar> {
        let native = match *self {
            Self::Int8(value) => NativeScalar::Int(i64::from(value)),
            Self::Int16(value) => NativeScalar::Int(i64::from(value)),
            Self::Int32(value) => NativeScalar::Int(i64::from(value)),
            Self::Int64(value) => NativeScalar::Int(value),
            Self::UInt8(value) => NativeScalar::Int(i64::from(value)),
            Self::UInt16(value) => NativeScalar::Int(i64::from(value)),
            Self::UInt32(value) => NativeScalar::Int(i64::from(value)),
            Self::UInt64(value) => match i64::try_from(value) {
                Ok(fits) => NativeScalar::Int(fits),
                Err(_) => NativeScalar::UInt(value),
            },
            Self::Float16(bits) => NativeScalar::Float(half::f16::from_bits(bits).to_f64()),
            Self::Float32(value) => NativeScalar::Float(f64::from(value)),
            Self::Float64(value) => NativeScalar::Float(value),
            Self::Bool(value) => NativeScalar::Bool(value),
            Self::Complex64 { .. } => return None,
        };
        Some(native)
    }

    fn describe(&self) -> Option<String> {
        Some(match *self {
            Self::Complex64 { re, im } if im < 0.0 => format!("({re}{im}j)"),
            Self::Complex64 { re, im } => format!("({re}+{im}j)"),
            other => format!("{other:?}"),
        })
    }
}

/// Dense n-dimensional array of scalars in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<Scalar>,
}

impl Tensor {
    /// Build a tensor from its shape and row-major data.
    pub fn new(shape: Vec<usize>, data: Vec<Scalar>) -> Self {
        Self { shape, data }
    }

    /// One-dimensional tensor.
    pub fn from_vec(data: Vec<Scalar>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Dimensions of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn shape_matches(&self) -> bool {
        self.shape.iter().product::<usize>() == self.data.len()
    }
}

impl ForeignValue for Tensor {
    fn type_name(&self) -> &str {
        "ndarray"
    }

    fn as_scalar(&self) -> Option<NativeScalar> {
        // Zero-dimensional arrays behave like their single element.
        if self.shape.is_empty() && self.data.len() == 1 {
            return self.data[0].as_scalar();
        }
        None
    }

    fn as_elements(&self) -> Option<Vec<RawValue>> {
        if self.shape.len() <= 1 || !self.shape_matches() {
            return Some(self.data.iter().copied().map(RawValue::foreign).collect());
        }
        Some(nest(&self.shape, &self.data))
    }

    fn describe(&self) -> Option<String> {
        Some(format!("ndarray(shape={:?})", self.shape))
    }
}

fn nest(shape: &[usize], data: &[Scalar]) -> Vec<RawValue> {
    match shape {
        [] => Vec::new(),
        [_] => data.iter().copied().map(RawValue::foreign).collect(),
        [outer, inner @ ..] => {
            let stride: usize = inner.iter().product();
            if stride == 0 {
                return (0..*outer).map(|_| RawValue::list(Vec::new())).collect();
            }
            data.chunks(stride)
                .map(|chunk| RawValue::list(nest(inner, chunk)))
                .collect()
        }
    }
}

/// Attribute bag: a named object exposing its fields.
#[derive(Debug, Clone)]
pub struct Object {
    type_name: String,
    fields: Vec<(String, RawValue)>,
}

impl Object {
    /// Create an object with no fields.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }
}

impl ForeignValue for Object {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn fields(&self) -> Option<Vec<(String, RawValue)>> {
        Some(self.fields.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_replaces_existing_string_key() {
        let map = RawValue::empty_map();
        assert!(map.insert("a", RawValue::Int(1)));
        assert!(map.insert("a", RawValue::Int(2)));
        assert_eq!(map.len(), Some(1));
        assert!(!RawValue::Null.insert("a", RawValue::Null));
    }

    #[test]
    fn clones_share_identity() {
        let list = RawValue::list(vec![RawValue::Int(1)]);
        let alias = list.clone();
        assert_eq!(list.identity(), alias.identity());
        assert!(alias.push(RawValue::Int(2)));
        assert_eq!(list.len(), Some(2));
        assert_ne!(list.identity(), RawValue::list(Vec::new()).identity());
    }

    #[test]
    fn debug_output_terminates_on_cycles() {
        let map = RawValue::empty_map();
        map.insert("self", map.clone());
        assert_eq!(format!("{map:?}"), "Map(len=1)");
    }

    #[test]
    fn json_numbers_keep_their_width() {
        let raw = RawValue::from(json!([1, u64::MAX, 1.5]));
        let RawValue::List(list) = raw else {
            panic!("expected list");
        };
        let items = list.read().unwrap();
        assert!(matches!(items[0], RawValue::Int(1)));
        assert!(matches!(items[1], RawValue::UInt(u64::MAX)));
        assert!(matches!(items[2], RawValue::Float(value) if value == 1.5));
    }

    #[test]
    fn scalar_coercion_widens_to_native() {
        assert_eq!(Scalar::Int8(-4).as_scalar(), Some(NativeScalar::Int(-4)));
        assert_eq!(
            Scalar::UInt64(u64::MAX).as_scalar(),
            Some(NativeScalar::UInt(u64::MAX))
        );
        assert_eq!(
            Scalar::Float32(2.5).as_scalar(),
            Some(NativeScalar::Float(2.5))
        );
        // 0x3C00 is 1.0 in IEEE half precision.
        assert_eq!(
            Scalar::Float16(0x3C00).as_scalar(),
            Some(NativeScalar::Float(1.0))
        );
        assert_eq!(Scalar::Complex64 { re: 1.0, im: 2.0 }.as_scalar(), None);
        assert_eq!(
            Scalar::Complex64 { re: 1.0, im: -2.0 }.describe().as_deref(),
            Some("(1-2j)")
        );
    }

    #[test]
    fn tensor_nests_by_shape() {
        let tensor = Tensor::new(
            vec![2, 3],
            (0..6).map(Scalar::Int32).collect::<Vec<_>>(),
        );
        let rows = tensor.as_elements().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), Some(3));
    }

    #[test]
    fn tensor_with_mismatched_shape_flattens() {
        let tensor = Tensor::new(vec![4, 4], vec![Scalar::Bool(true); 3]);
        assert_eq!(tensor.as_elements().unwrap().len(), 3);
    }

    #[test]
    fn tensor_with_zero_sized_axis_yields_empty_rows() {
        let tensor = Tensor::new(vec![2, 0], Vec::new());
        let rows = tensor.as_elements().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].len(), Some(0));
    }

    #[test]
    fn zero_dimensional_tensor_is_a_scalar() {
        let tensor = Tensor::new(Vec::new(), vec![Scalar::Int64(7)]);
        assert_eq!(tensor.as_scalar(), Some(NativeScalar::Int(7)));
    }
}
