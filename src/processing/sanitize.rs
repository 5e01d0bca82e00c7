//! Normalization of parser output into JSON-safe values.
//!
//! The sanitizer walks a [`RawValue`] and produces a `serde_json::Value` restricted to strings,
//! numbers, booleans, null, arrays, and string-keyed objects. It never fails: anything that cannot
//! be classified degrades to a string marker.
//!
//! Classification order:
//!
//! 1. `Null` → `null`.
//! 2. Foreign values, before any native check: scalar coercion, then element conversion, then
//!    field introspection, then the value's own description.
//! 3. Native primitives pass through. Non-finite floats become their string form.
//! 4. Timestamps render as RFC 3339; bytes as UTF-8 (hex when not valid UTF-8).
//! 5. Maps sanitize keys and values; non-string keys are stringified.
//! 6. Lists sanitize elements in order.
//!
//! Compound nodes are tracked by pointer identity while they are being visited. Re-entering a
//! node that is still on the current path yields [`CIRCULAR_REFERENCE`]; a node shared by
//! sibling branches is sanitized once per branch. Nesting deeper than the configured bound yields
//! [`MAX_DEPTH_EXCEEDED`].

use std::collections::HashSet;
use std::ops::AddAssign;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError};

use serde::Serialize;
use serde_json::{Map, Number, Value};
use time::format_description::well_known::Rfc3339;

use crate::config::DEFAULT_SANITIZE_MAX_DEPTH;

use super::value::{ForeignValue, NativeScalar, RawValue};

/// Marker substituted for a node that contains itself.
pub const CIRCULAR_REFERENCE: &str = "<circular_reference>";
/// Marker substituted for a value with no usable representation.
pub const NON_SERIALIZABLE: &str = "<non_serializable>";
/// Marker substituted for nodes nested beyond the depth bound.
pub const MAX_DEPTH_EXCEEDED: &str = "<max_depth_exceeded>";

/// Counters describing how much of a value had to be degraded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SanitizeReport {
    /// Values that could only be represented as strings or markers.
    pub degraded: usize,
    /// Back-references replaced by [`CIRCULAR_REFERENCE`].
    pub circular_references: usize,
    /// Nodes replaced by [`MAX_DEPTH_EXCEEDED`].
    pub depth_truncations: usize,
}

impl AddAssign for SanitizeReport {
    fn add_assign(&mut self, other: Self) {
        self.degraded += other.degraded;
        self.circular_references += other.circular_references;
        self.depth_truncations += other.depth_truncations;
    }
}

/// Stateless sanitizer configured with a nesting bound.
#[derive(Debug, Clone, Copy)]
pub struct Sanitizer {
    max_depth: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_SANITIZE_MAX_DEPTH)
    }
}

impl Sanitizer {
    /// Create a sanitizer that truncates compound nodes nested `max_depth` levels deep.
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
        }
    }

    /// Sanitize a value.
    pub fn sanitize(&self, value: &RawValue) -> Value {
        self.sanitize_with_report(value).0
    }

    /// Sanitize a value and report how much of it degraded.
    pub fn sanitize_with_report(&self, value: &RawValue) -> (Value, SanitizeReport) {
        Walk::new(self.max_depth).run(value)
    }

    /// Re-sanitize an already JSON-shaped value. A no-op for sanitizer output.
    pub fn resanitize(&self, value: Value) -> Value {
        self.resanitize_with_report(value).0
    }

    /// Re-sanitize a JSON document that embeds earlier sanitizer output.
    ///
    /// JSON is finite and acyclic, so no depth bound applies here: a value that fit within the
    /// bound keeps its shape after being nested inside a larger document.
    pub fn resanitize_with_report(&self, value: Value) -> (Value, SanitizeReport) {
        Walk::new(usize::MAX).run(&RawValue::from(value))
    }
}

/// Sanitize with the default depth bound.
pub fn sanitize(value: &RawValue) -> Value {
    Sanitizer::default().sanitize(value)
}

struct Walk {
    visiting: HashSet<usize>,
    report: SanitizeReport,
    max_depth: usize,
}

impl Walk {
    fn new(max_depth: usize) -> Self {
        Self {
            visiting: HashSet::new(),
            report: SanitizeReport::default(),
            max_depth,
        }
    }

    fn run(mut self, value: &RawValue) -> (Value, SanitizeReport) {
        let sanitized = self.value(value, 0);
        if self.report.degraded > 0 || self.report.circular_references > 0 {
            tracing::debug!(
                degraded = self.report.degraded,
                circular = self.report.circular_references,
                truncated = self.report.depth_truncations,
                "Sanitized value with substitutions"
            );
        }
        (sanitized, self.report)
    }

    fn value(&mut self, value: &RawValue, depth: usize) -> Value {
        match value {
            RawValue::Null => Value::Null,
            RawValue::Foreign(foreign) => self.foreign(foreign, depth),
            RawValue::Bool(flag) => Value::Bool(*flag),
            RawValue::Int(int) => Value::from(*int),
            RawValue::UInt(uint) => Value::from(*uint),
            RawValue::Float(float) => self.float(*float),
            RawValue::Str(text) => Value::String(text.clone()),
            RawValue::Timestamp(timestamp) => match timestamp.format(&Rfc3339) {
                Ok(text) => Value::String(text),
                Err(_) => self.degrade(timestamp.to_string()),
            },
            RawValue::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => Value::String(text.to_string()),
                Err(_) => self.degrade(hex::encode(bytes)),
            },
            RawValue::List(list) => {
                let id = Arc::as_ptr(list) as *const () as usize;
                // Snapshot under the lock so no guard is held while recursing.
                let items = list.read().unwrap_or_else(PoisonError::into_inner).clone();
                self.nested(id, depth, |walk| walk.sequence(&items, depth))
            }
            RawValue::Map(map) => {
                let id = Arc::as_ptr(map) as *const () as usize;
                let entries = map.read().unwrap_or_else(PoisonError::into_inner).clone();
                self.nested(id, depth, |walk| walk.mapping(&entries, depth))
            }
        }
    }

    fn foreign(&mut self, foreign: &Arc<dyn ForeignValue>, depth: usize) -> Value {
        let id = Arc::as_ptr(foreign) as *const () as usize;

        if let Some(native) = probe(|| foreign.as_scalar()) {
            return self.native(native);
        }
        if let Some(elements) = probe(|| foreign.as_elements()) {
            return self.nested(id, depth, |walk| walk.sequence(&elements, depth));
        }
        if let Some(fields) = probe(|| foreign.fields()) {
            return self.nested(id, depth, |walk| {
                let mut object = Map::new();
                for (name, field) in &fields {
                    let sanitized = walk.value(field, depth + 1);
                    object.insert(name.clone(), sanitized);
                }
                Value::Object(object)
            });
        }

        tracing::trace!(type_name = foreign.type_name(), "Stringifying foreign value");
        match probe(|| foreign.describe()) {
            Some(text) => self.degrade(text),
            None => self.degrade(NON_SERIALIZABLE.to_string()),
        }
    }

    fn native(&mut self, native: NativeScalar) -> Value {
        match native {
            NativeScalar::Int(int) => Value::from(int),
            NativeScalar::UInt(uint) => Value::from(uint),
            NativeScalar::Float(float) => self.float(float),
            NativeScalar::Bool(flag) => Value::Bool(flag),
        }
    }

    fn float(&mut self, float: f64) -> Value {
        match Number::from_f64(float) {
            Some(number) => Value::Number(number),
            None => self.degrade(non_finite_label(float).to_string()),
        }
    }

    fn sequence(&mut self, items: &[RawValue], depth: usize) -> Value {
        Value::Array(
            items
                .iter()
                .map(|item| self.value(item, depth + 1))
                .collect(),
        )
    }

    fn mapping(&mut self, entries: &[(RawValue, RawValue)], depth: usize) -> Value {
        let mut object = Map::new();
        for (key, value) in entries {
            let key = match self.value(key, depth + 1) {
                Value::String(text) => text,
                other => other.to_string(),
            };
            let value = self.value(value, depth + 1);
            object.insert(key, value);
        }
        Value::Object(object)
    }

    fn nested(&mut self, id: usize, depth: usize, body: impl FnOnce(&mut Self) -> Value) -> Value {
        if depth >= self.max_depth {
            self.report.depth_truncations += 1;
            return self.degrade(MAX_DEPTH_EXCEEDED.to_string());
        }
        if !self.visiting.insert(id) {
            self.report.circular_references += 1;
            return Value::String(CIRCULAR_REFERENCE.to_string());
        }
        let sanitized = body(self);
        self.visiting.remove(&id);
        sanitized
    }

    fn degrade(&mut self, text: String) -> Value {
        self.report.degraded += 1;
        Value::String(text)
    }
}

/// Call into a foreign implementation; a panic counts as "capability absent".
fn probe<T>(call: impl FnOnce() -> Option<T>) -> Option<T> {
    catch_unwind(AssertUnwindSafe(call)).unwrap_or(None)
}

fn non_finite_label(float: f64) -> &'static str {
    if float.is_nan() {
        "NaN"
    } else if float.is_sign_positive() {
        "inf"
    } else {
        "-inf"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::value::{Object, Scalar, Tensor};
    use serde_json::json;
    use time::OffsetDateTime;

    struct Opaque;

    impl ForeignValue for Opaque {
        fn type_name(&self) -> &str {
            "opaque"
        }
    }

    struct Exploding;

    impl ForeignValue for Exploding {
        fn type_name(&self) -> &str {
            "exploding"
        }

        fn as_scalar(&self) -> Option<NativeScalar> {
            panic!("conversion blew up")
        }

        fn describe(&self) -> Option<String> {
            Some("exploding()".into())
        }
    }

    #[test]
    fn self_referencing_map_terminates() {
        let a = RawValue::empty_map();
        a.insert("self", a.clone());
        let (value, report) = Sanitizer::default().sanitize_with_report(&a);
        assert_eq!(value, json!({ "self": CIRCULAR_REFERENCE }));
        assert_eq!(report.circular_references, 1);
    }

    #[test]
    fn shared_siblings_are_not_flagged_as_cycles() {
        let shared = RawValue::map(vec![("n", RawValue::Int(1))]);
        let root = RawValue::map(vec![("left", shared.clone()), ("right", shared)]);
        assert_eq!(
            sanitize(&root),
            json!({ "left": { "n": 1 }, "right": { "n": 1 } })
        );
    }

    #[test]
    fn list_cycle_through_map_is_detected() {
        let list = RawValue::list(Vec::new());
        let holder = RawValue::map(vec![("items", list.clone())]);
        list.push(holder);
        assert_eq!(
            sanitize(&list),
            json!([{ "items": CIRCULAR_REFERENCE }])
        );
    }

    #[test]
    fn foreign_scalars_become_native_numbers() {
        let value = RawValue::map(vec![
            ("count", RawValue::foreign(Scalar::Int64(5))),
            ("value", RawValue::foreign(Scalar::Float32(2.5))),
            ("flag", RawValue::foreign(Scalar::Bool(true))),
        ]);
        assert_eq!(
            sanitize(&value),
            json!({ "count": 5, "value": 2.5, "flag": true })
        );
    }

    #[test]
    fn foreign_keys_are_stringified() {
        let value = RawValue::map(vec![
            (RawValue::foreign(Scalar::Int32(7)), RawValue::from("seven")),
            (RawValue::Bool(true), RawValue::Null),
        ]);
        assert_eq!(sanitize(&value), json!({ "7": "seven", "true": null }));
    }

    #[test]
    fn tensors_become_nested_lists() {
        let tensor = Tensor::new(
            vec![2, 2],
            vec![
                Scalar::Float64(1.0),
                Scalar::Float64(2.0),
                Scalar::Float64(3.0),
                Scalar::Float64(4.0),
            ],
        );
        assert_eq!(
            sanitize(&RawValue::foreign(tensor)),
            json!([[1.0, 2.0], [3.0, 4.0]])
        );
    }

    #[test]
    fn attribute_bags_become_objects() {
        let object = Object::new("ColumnDescriptor")
            .with_field("name", "age")
            .with_field("position", RawValue::foreign(Scalar::UInt8(2)));
        assert_eq!(
            sanitize(&RawValue::foreign(object)),
            json!({ "name": "age", "position": 2 })
        );
    }

    #[test]
    fn unclassifiable_values_degrade_to_strings() {
        let value = RawValue::list(vec![
            RawValue::foreign(Opaque),
            RawValue::foreign(Scalar::Complex64 { re: 1.0, im: 2.0 }),
            RawValue::Float(f64::NAN),
            RawValue::Float(f64::NEG_INFINITY),
            RawValue::Bytes(vec![0xff, 0x00]),
        ]);
        let (sanitized, report) = Sanitizer::default().sanitize_with_report(&value);
        assert_eq!(
            sanitized,
            json!([NON_SERIALIZABLE, "(1+2j)", "NaN", "-inf", "ff00"])
        );
        assert_eq!(report.degraded, 5);
    }

    #[test]
    fn panicking_foreign_impl_does_not_escape() {
        let value = RawValue::foreign(Exploding);
        assert_eq!(sanitize(&value), json!("exploding()"));
    }

    #[test]
    fn timestamps_render_as_rfc3339() {
        let epoch = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(
            sanitize(&RawValue::Timestamp(epoch)),
            json!("1970-01-01T00:00:00Z")
        );
    }

    #[test]
    fn deep_nesting_is_truncated() {
        let mut value = RawValue::Int(0);
        for _ in 0..5 {
            value = RawValue::list(vec![value]);
        }
        let (sanitized, report) = Sanitizer::new(3).sanitize_with_report(&value);
        assert_eq!(sanitized, json!([[[MAX_DEPTH_EXCEEDED]]]));
        assert_eq!(report.depth_truncations, 1);
    }

    #[test]
    fn resanitizing_a_wrapped_value_keeps_in_bound_nesting() {
        let mut value = RawValue::Int(7);
        for _ in 0..3 {
            value = RawValue::list(vec![value]);
        }
        let sanitizer = Sanitizer::new(3);
        let (inner, report) = sanitizer.sanitize_with_report(&value);
        assert_eq!(inner, json!([[[7]]]));
        assert_eq!(report, SanitizeReport::default());

        let wrapped = json!({ "outer": { "metadata": inner.clone() } });
        let (again, report) = sanitizer.resanitize_with_report(wrapped.clone());
        assert_eq!(again, wrapped);
        assert_eq!(report, SanitizeReport::default());
    }

    #[test]
    fn output_is_a_fixed_point() {
        let cyclic = RawValue::empty_map();
        cyclic.insert("me", cyclic.clone());
        let value = RawValue::map(vec![
            ("cyclic", cyclic),
            ("scalar", RawValue::foreign(Scalar::UInt16(9))),
            ("tensor", RawValue::foreign(Tensor::from_vec(vec![Scalar::Int8(1)]))),
            ("nan", RawValue::Float(f64::NAN)),
            ("big", RawValue::UInt(u64::MAX)),
        ]);
        let sanitizer = Sanitizer::default();
        let once = sanitizer.sanitize(&value);
        assert_eq!(sanitizer.resanitize(once.clone()), once);
    }
}
