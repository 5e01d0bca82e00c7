use docingest::processing::{
    RawValue, Sanitizer, Scalar, Tensor,
    columnar::Row,
    sampling::{EmbeddingSampler, sample_indices},
};
use proptest::prelude::*;
use serde_json::{Value, json};

fn raw_leaf() -> impl Strategy<Value = RawValue> {
    prop_oneof![
        Just(RawValue::Null),
        any::<bool>().prop_map(RawValue::Bool),
        any::<i64>().prop_map(RawValue::Int),
        any::<u64>().prop_map(RawValue::UInt),
        any::<f64>().prop_map(RawValue::Float),
        ".{0,12}".prop_map(RawValue::Str),
        proptest::collection::vec(any::<u8>(), 0..8).prop_map(RawValue::Bytes),
        any::<i32>().prop_map(|v| RawValue::foreign(Scalar::Int32(v))),
        any::<u16>().prop_map(|bits| RawValue::foreign(Scalar::Float16(bits))),
        any::<f32>().prop_map(|v| RawValue::foreign(Scalar::Float32(v))),
        (any::<f32>(), any::<f32>())
            .prop_map(|(re, im)| RawValue::foreign(Scalar::Complex64 { re, im })),
        proptest::collection::vec(any::<i16>(), 0..6).prop_map(|values| {
            RawValue::foreign(Tensor::from_vec(values.into_iter().map(Scalar::Int16).collect()))
        }),
    ]
}

fn raw_value() -> impl Strategy<Value = RawValue> {
    raw_leaf().prop_recursive(4, 32, 6, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..6).prop_map(RawValue::list),
            proptest::collection::vec(("[a-z]{1,4}", inner.clone()), 0..6).prop_map(|entries| {
                RawValue::map(entries.into_iter().map(|(k, v)| (RawValue::Str(k), v)))
            }),
            (inner.clone(), inner).prop_map(|(key, value)| RawValue::map(vec![(key, value)])),
        ]
    })
}

/// Builds a value that contains itself somewhere below the root.
fn cyclic_value() -> impl Strategy<Value = RawValue> {
    (raw_value(), "[a-z]{1,4}").prop_map(|(payload, key)| {
        let root = RawValue::map(vec![("payload", payload)]);
        let child = RawValue::list(vec![root.clone()]);
        root.insert(key, child);
        root
    })
}

fn only_json_safe(value: &Value) -> bool {
    match value {
        Value::Number(number) => number.as_f64().is_some_and(f64::is_finite),
        Value::Array(items) => items.iter().all(only_json_safe),
        Value::Object(object) => object.values().all(only_json_safe),
        _ => true,
    }
}

proptest! {
    #[test]
    fn sanitize_is_idempotent(value in raw_value()) {
        let sanitizer = Sanitizer::default();
        let once = sanitizer.sanitize(&value);
        prop_assert_eq!(sanitizer.resanitize(once.clone()), once);
    }

    #[test]
    fn sanitize_terminates_on_cycles(value in cyclic_value()) {
        let sanitizer = Sanitizer::default();
        let (once, report) = sanitizer.sanitize_with_report(&value);
        prop_assert!(report.circular_references >= 1);
        prop_assert!(once.to_string().contains("<circular_reference>"));
        prop_assert_eq!(sanitizer.resanitize(once.clone()), once);
    }

    #[test]
    fn sanitize_output_is_json_safe(value in raw_value()) {
        let sanitized = Sanitizer::default().sanitize(&value);
        prop_assert!(only_json_safe(&sanitized));
        prop_assert!(serde_json::to_string(&sanitized).is_ok());
    }

    #[test]
    fn sample_size_is_ceiling_of_len_over_stride(len in 0usize..500, stride in 1usize..40) {
        let rows: Vec<Row> = (0..len)
            .map(|n| match json!({ "n": n }) {
                Value::Object(row) => row,
                _ => unreachable!(),
            })
            .collect();
        let sample = EmbeddingSampler::new(stride).unwrap().sample(&rows);
        prop_assert_eq!(sample.len(), len.div_ceil(stride));
        prop_assert!(sample.indices().iter().all(|index| index % stride == 0 && *index < len));
        prop_assert_eq!(sample_indices(len, stride).count(), sample.len());
    }
}
