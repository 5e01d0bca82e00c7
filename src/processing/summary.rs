//! Metadata-only summary of a parse result.

use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;

use super::sanitize::{SanitizeReport, Sanitizer};
use super::types::ParseResult;

/// Keys that hold raw row payloads and never leave the pipeline.
pub const PAYLOAD_KEYS: [&str; 3] = ["tables", "records", "data"];

/// Build the sanitized summary for `result`, without any row payloads.
pub fn build_summary(result: &ParseResult, sanitizer: &Sanitizer) -> (Value, SanitizeReport) {
    let mut report = SanitizeReport::default();

    let (mut metadata, metadata_report) = sanitizer.sanitize_with_report(&result.metadata);
    report += metadata_report;
    strip_payload_keys(&mut metadata);

    let (mut structure, structure_report) = sanitizer.sanitize_with_report(&result.structure);
    report += structure_report;
    strip_payload_keys(&mut structure);

    let mut summary = Map::new();
    summary.insert("success".into(), Value::Bool(result.success));
    summary.insert(
        "content_type".into(),
        Value::String(result.content_kind.as_str().to_string()),
    );
    summary.insert(
        "file_type".into(),
        result
            .file_type
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    summary.insert("metadata".into(), metadata);
    summary.insert("structure".into(), structure);
    summary.insert("table_count".into(), Value::from(result.table_count()));
    summary.insert("record_count".into(), Value::from(result.record_count()));
    summary.insert("row_count".into(), Value::from(result.row_count()));
    summary.insert(
        "parsed_at".into(),
        result
            .parsed_at
            .and_then(|at| at.format(&Rfc3339).ok())
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    if let Some(error) = &result.error {
        summary.insert("error".into(), Value::String(error.clone()));
    }
    (Value::Object(summary), report)
}

/// Remove payload keys from every object nested in `value`.
pub fn strip_payload_keys(value: &mut Value) {
    match value {
        Value::Object(object) => {
            for key in PAYLOAD_KEYS {
                object.remove(key);
            }
            object.values_mut().for_each(strip_payload_keys);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_payload_keys),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::types::ContentKind;
    use crate::processing::value::RawValue;
    use serde_json::json;

    #[test]
    fn rows_never_reach_the_summary() {
        let result = ParseResult::success(ContentKind::Structured)
            .with_file_type("csv")
            .with_metadata(RawValue::from(json!({
                "row_count": 2,
                "records": [{ "secret": 1 }],
                "sheets": [{ "name": "s1", "data": [[1, 2]] }],
            })))
            .with_records(vec![
                RawValue::from(json!({ "secret": 1 })),
                RawValue::from(json!({ "secret": 2 })),
            ]);
        let (summary, report) = build_summary(&result, &Sanitizer::default());

        assert_eq!(summary["record_count"], json!(2));
        assert_eq!(summary["row_count"], json!(2));
        assert_eq!(summary["file_type"], json!("csv"));
        assert_eq!(summary["content_type"], json!("structured"));
        assert_eq!(summary["metadata"]["sheets"], json!([{ "name": "s1" }]));
        assert!(!summary.to_string().contains("secret"));
        assert_eq!(report, SanitizeReport::default());
    }

    #[test]
    fn failures_keep_their_detail() {
        let (summary, _) =
            build_summary(&ParseResult::failure("bad header"), &Sanitizer::default());
        assert_eq!(summary["success"], json!(false));
        assert_eq!(summary["error"], json!("bad header"));
        assert_eq!(summary["parsed_at"], Value::Null);
    }
}
