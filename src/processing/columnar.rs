//! Row-to-Parquet composition with mandatory validation.
//!
//! Rows from every collection in a [`ParseResult`] are sanitized, flattened, and unioned into one
//! schema. The encoded bytes are then re-read: the `PAR1` marker must open and close the buffer
//! and the footer must report the expected row count. [`ColumnarArtifact`] can only be obtained
//! through that check.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::{Compression, Type as PhysicalType};
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::ColumnarCompression;

use super::sanitize::{SanitizeReport, Sanitizer};
use super::types::ParseResult;
use super::value::RawValue;

/// Four-byte marker that opens and closes every Parquet file.
pub const PARQUET_MAGIC: [u8; 4] = *b"PAR1";

/// Row type the composer works on.
pub type Row = Map<String, Value>;

/// Reasons composition produced no artifact.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// The parse result held no rows.
    #[error("no structured rows to convert")]
    NoRows,
    /// Every row was empty.
    #[error("rows contain no columns")]
    NoColumns,
    /// Building the in-memory batch failed.
    #[error("failed to build columnar batch: {0}")]
    Arrow(#[from] ArrowError),
    /// Encoding or reading back the Parquet bytes failed.
    #[error("failed to encode parquet: {0}")]
    Parquet(#[from] ParquetError),
    /// Header or footer marker missing.
    #[error("artifact failed magic marker validation")]
    InvalidMagic,
    /// Footer reported a different row count than was written.
    #[error("artifact row count mismatch: expected {expected}, found {actual}")]
    RowCountMismatch {
        /// Rows handed to the writer.
        expected: usize,
        /// Rows reported by the footer.
        actual: usize,
    },
}

/// Inferred column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Every non-null cell is a boolean.
    Boolean,
    /// Every non-null cell is an integer that fits in `i64`.
    Int64,
    /// Every non-null cell is a number.
    Float64,
    /// Anything else; nested values are stored as compact JSON.
    Utf8,
}

impl ColumnType {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Boolean),
            Value::Number(number) if number.is_i64() => Some(Self::Int64),
            Value::Number(_) => Some(Self::Float64),
            _ => Some(Self::Utf8),
        }
    }

    fn merge(self, other: Self) -> Self {
        match (self, other) {
            (a, b) if a == b => a,
            (Self::Int64, Self::Float64) | (Self::Float64, Self::Int64) => Self::Float64,
            _ => Self::Utf8,
        }
    }

    fn data_type(self) -> DataType {
        match self {
            Self::Boolean => DataType::Boolean,
            Self::Int64 => DataType::Int64,
            Self::Float64 => DataType::Float64,
            Self::Utf8 => DataType::Utf8,
        }
    }

    fn from_physical(physical: PhysicalType) -> Self {
        match physical {
            PhysicalType::BOOLEAN => Self::Boolean,
            PhysicalType::INT32 | PhysicalType::INT64 => Self::Int64,
            PhysicalType::FLOAT | PhysicalType::DOUBLE => Self::Float64,
            _ => Self::Utf8,
        }
    }
}

/// Column name and type as written to the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    /// Column name.
    pub name: String,
    /// Inferred type.
    pub column_type: ColumnType,
}

/// Leading rows and columns of an artifact, rendered as display strings.
///
/// Null cells render as empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactPreview {
    /// Names of the previewed columns.
    pub columns: Vec<String>,
    /// Previewed cells, row-major.
    pub rows: Vec<Vec<String>>,
    /// Rows in the whole artifact.
    pub total_rows: usize,
    /// Columns in the whole artifact.
    pub total_columns: usize,
    /// Rows returned.
    pub preview_rows: usize,
    /// Columns returned.
    pub preview_columns: usize,
}

/// Validated Parquet bytes plus metadata read back from the footer.
#[derive(Debug, Clone)]
pub struct ColumnarArtifact {
    bytes: Bytes,
    row_count: usize,
    compressed: bool,
    columns: Vec<ColumnDescriptor>,
}

impl ColumnarArtifact {
    /// Validate arbitrary bytes as a Parquet artifact.
    ///
    /// Checks the magic marker at both ends, then reads the footer for row count, schema, and
    /// codec.
    pub fn from_parquet(bytes: impl Into<Bytes>) -> Result<Self, ComposeError> {
        let bytes = bytes.into();
        if !has_valid_magic(&bytes) {
            return Err(ComposeError::InvalidMagic);
        }
        let reader = SerializedFileReader::new(bytes.clone())?;
        let metadata = reader.metadata();
        let row_count = usize::try_from(metadata.file_metadata().num_rows()).unwrap_or_default();
        let columns = metadata
            .file_metadata()
            .schema_descr()
            .columns()
            .iter()
            .map(|column| ColumnDescriptor {
                name: column.name().to_string(),
                column_type: ColumnType::from_physical(column.physical_type()),
            })
            .collect();
        let compressed = metadata
            .row_groups()
            .iter()
            .flat_map(|group| group.columns())
            .any(|chunk| !matches!(chunk.compression(), Compression::UNCOMPRESSED));
        Ok(Self {
            bytes,
            row_count,
            compressed,
            columns,
        })
    }

    /// Encoded bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Artifact format label.
    pub fn format(&self) -> &'static str {
        "parquet"
    }

    /// Rows in the artifact.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Columns in the artifact.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Whether pages are block-compressed.
    pub fn compressed(&self) -> bool {
        self.compressed
    }

    /// Column descriptors in schema order.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Encoded size in bytes.
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Decode at most `max_rows` rows of the first `max_columns` columns.
    pub fn preview(
        &self,
        max_rows: usize,
        max_columns: usize,
    ) -> Result<ArtifactPreview, ComposeError> {
        let columns: Vec<String> = self
            .columns
            .iter()
            .take(max_columns)
            .map(|column| column.name.clone())
            .collect();
        let mut rows = Vec::new();
        if !columns.is_empty() && max_rows > 0 {
            let builder = ParquetRecordBatchReaderBuilder::try_new(self.bytes.clone())?;
            let mask = ProjectionMask::roots(builder.parquet_schema(), 0..columns.len());
            let reader = builder
                .with_projection(mask)
                .with_limit(max_rows)
                .build()?;
            for batch in reader {
                let batch = batch?;
                for row in 0..batch.num_rows() {
                    if rows.len() == max_rows {
                        break;
                    }
                    let cells = batch
                        .columns()
                        .iter()
                        .map(|column| display_cell(column, row))
                        .collect::<Result<Vec<_>, _>>()?;
                    rows.push(cells);
                }
            }
        }
        Ok(ArtifactPreview {
            total_rows: self.row_count,
            total_columns: self.columns.len(),
            preview_rows: rows.len(),
            preview_columns: columns.len(),
            columns,
            rows,
        })
    }

    /// Metadata-only description for summaries and manifests.
    pub fn describe(&self) -> Value {
        serde_json::json!({
            "format": self.format(),
            "row_count": self.row_count,
            "column_count": self.column_count(),
            "compressed": self.compressed,
            "byte_len": self.byte_len(),
            "columns": self.columns,
        })
    }
}

/// True when `bytes` starts and ends with [`PARQUET_MAGIC`].
///
/// Buffers shorter than two markers are rejected so a lone `PAR1` does not pass.
pub fn has_valid_magic(bytes: &[u8]) -> bool {
    let marker = PARQUET_MAGIC.len();
    bytes.len() >= 2 * marker
        && bytes[..marker] == PARQUET_MAGIC
        && bytes[bytes.len() - marker..] == PARQUET_MAGIC
}

/// Converts parse results into validated columnar artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnarComposer {
    compression: ColumnarCompression,
    sanitizer: Sanitizer,
}

impl ColumnarComposer {
    /// Create a composer.
    pub fn new(compression: ColumnarCompression, sanitizer: Sanitizer) -> Self {
        Self {
            compression,
            sanitizer,
        }
    }

    /// Sanitize and flatten tables, then records, then the data block into one row list.
    pub fn flatten_rows(&self, result: &ParseResult) -> (Vec<Row>, SanitizeReport) {
        let mut rows = Vec::new();
        let mut report = SanitizeReport::default();
        for table in &result.tables {
            report += self.extend_block(&mut rows, table);
        }
        for record in &result.records {
            let (value, record_report) = self.sanitizer.sanitize_with_report(record);
            report += record_report;
            rows.push(into_row(value));
        }
        if let Some(data) = &result.data {
            report += self.extend_block(&mut rows, data);
        }
        (rows, report)
    }

    /// A block contributes rows only when it sanitizes to a list (one row per element) or a
    /// mapping (one row). Null and scalar blocks contribute nothing.
    fn extend_block(&self, rows: &mut Vec<Row>, block: &RawValue) -> SanitizeReport {
        let (value, report) = self.sanitizer.sanitize_with_report(block);
        match value {
            Value::Array(items) => rows.extend(items.into_iter().map(into_row)),
            Value::Object(row) => rows.push(row),
            Value::Null => {}
            other => {
                tracing::debug!(block = %other, "Ignoring scalar block during flattening");
            }
        }
        report
    }

    /// Compose a parse result, returning `None` when there is nothing valid to persist.
    pub fn compose(&self, result: &ParseResult) -> Option<ColumnarArtifact> {
        match self.try_compose(result) {
            Ok(artifact) => Some(artifact),
            Err(error) => {
                tracing::debug!(error = %error, "Columnar conversion produced no artifact");
                None
            }
        }
    }

    /// Compose a parse result, reporting why no artifact was produced.
    pub fn try_compose(&self, result: &ParseResult) -> Result<ColumnarArtifact, ComposeError> {
        let (rows, _) = self.flatten_rows(result);
        self.compose_rows(&rows)
    }

    /// Encode already-sanitized rows.
    pub fn compose_rows(&self, rows: &[Row]) -> Result<ColumnarArtifact, ComposeError> {
        if rows.is_empty() {
            return Err(ComposeError::NoRows);
        }
        let columns = infer_columns(rows);
        if columns.is_empty() {
            return Err(ComposeError::NoColumns);
        }

        let batch = build_batch(rows, &columns)?;
        let codec = if self.compression.is_compressed() {
            Compression::SNAPPY
        } else {
            Compression::UNCOMPRESSED
        };
        let properties = WriterProperties::builder().set_compression(codec).build();

        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(properties))?;
        writer.write(&batch)?;
        writer.close()?;

        let artifact = ColumnarArtifact::from_parquet(buffer)?;
        if artifact.row_count() != rows.len() {
            return Err(ComposeError::RowCountMismatch {
                expected: rows.len(),
                actual: artifact.row_count(),
            });
        }
        tracing::debug!(
            rows = artifact.row_count(),
            columns = artifact.column_count(),
            bytes = artifact.byte_len(),
            compressed = artifact.compressed(),
            "Composed columnar artifact"
        );
        Ok(artifact)
    }
}

fn display_cell(column: &ArrayRef, row: usize) -> Result<String, ArrowError> {
    if column.is_null(row) {
        return Ok(String::new());
    }
    array_value_to_string(column.as_ref(), row)
}

fn into_row(value: Value) -> Row {
    match value {
        Value::Object(row) => row,
        other => {
            let mut row = Map::new();
            row.insert("value".into(), other);
            row
        }
    }
}

/// Union of keys in first-appearance order, each with a merged type.
fn infer_columns(rows: &[Row]) -> Vec<ColumnDescriptor> {
    let mut columns: Vec<(String, Option<ColumnType>)> = Vec::new();
    for row in rows {
        for (key, value) in row {
            let observed = ColumnType::of(value);
            match columns.iter_mut().find(|(name, _)| name == key) {
                Some((_, slot)) => {
                    *slot = match (*slot, observed) {
                        (Some(current), Some(next)) => Some(current.merge(next)),
                        (current, next) => current.or(next),
                    };
                }
                None => columns.push((key.clone(), observed)),
            }
        }
    }
    columns
        .into_iter()
        .map(|(name, column_type)| ColumnDescriptor {
            name,
            column_type: column_type.unwrap_or(ColumnType::Utf8),
        })
        .collect()
}

fn build_batch(rows: &[Row], columns: &[ColumnDescriptor]) -> Result<RecordBatch, ArrowError> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|column| Field::new(&column.name, column.column_type.data_type(), true))
        .collect();
    let arrays: Vec<ArrayRef> = columns
        .iter()
        .map(|column| build_array(rows, column))
        .collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
}

fn build_array(rows: &[Row], column: &ColumnDescriptor) -> ArrayRef {
    let cells = rows.iter().map(|row| row.get(&column.name));
    match column.column_type {
        ColumnType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(rows.len());
            for cell in cells {
                builder.append_option(cell.and_then(Value::as_bool));
            }
            Arc::new(builder.finish())
        }
        ColumnType::Int64 => {
            let mut builder = Int64Builder::with_capacity(rows.len());
            for cell in cells {
                builder.append_option(cell.and_then(Value::as_i64));
            }
            Arc::new(builder.finish())
        }
        ColumnType::Float64 => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for cell in cells {
                builder.append_option(cell.and_then(Value::as_f64));
            }
            Arc::new(builder.finish())
        }
        ColumnType::Utf8 => {
            let mut builder = StringBuilder::new();
            for cell in cells {
                match cell {
                    None | Some(Value::Null) => builder.append_null(),
                    Some(Value::String(text)) => builder.append_value(text),
                    Some(other) => builder.append_value(other.to_string()),
                }
            }
            Arc::new(builder.finish())
        }
    }
}
