//! The fixed criteo click-log layout and its field-level parsers.
//!
//! Every input row carries exactly 40 columns: a binary `label`, thirteen
//! integer count features `I1..I13`, and twenty-six categorical features
//! `C1..C26` encoded as 32-bit hex strings. Both feature groups are nullable
//! in the raw data; the converted parquet keeps them as nullable `Int32`
//! columns, with hex values reinterpreted as signed integers (`ffffffff`
//! becomes -1, not an overflow).

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use thiserror::Error;

/// Name of the click label column.
pub const LABEL: &str = "label";
/// Number of integer count features (`I1..I13`).
pub const NUM_CONTINUOUS: usize = 13;
/// Number of hex-encoded categorical features (`C1..C26`).
pub const NUM_CATEGORICAL: usize = 26;
/// Total column count of a criteo row.
pub const NUM_COLUMNS: usize = 1 + NUM_CONTINUOUS + NUM_CATEGORICAL;

/// Position of the label in the raw and converted layouts.
pub const LABEL_INDEX: usize = 0;
/// First continuous column in the raw and converted layouts.
pub const CONTINUOUS_START: usize = 1;
/// First categorical column in the raw and converted layouts.
pub const CATEGORICAL_START: usize = 1 + NUM_CONTINUOUS;

// ============================================================================
// Column dtype map
// ============================================================================

/// How a raw CSV field is decoded into its `Int32` storage value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnDtype {
    /// Plain decimal integer, possibly negative, empty means null.
    Int32,
    /// Up to eight hex digits reinterpreted as a signed 32-bit value,
    /// empty means null.
    Hex,
}

/// `I1..I13` in order.
pub fn continuous_columns() -> Vec<String> {
    (1..=NUM_CONTINUOUS).map(|i| format!("I{i}")).collect()
}

/// `C1..C26` in order.
pub fn categorical_columns() -> Vec<String> {
    (1..=NUM_CATEGORICAL).map(|i| format!("C{i}")).collect()
}

/// All 40 column names in raw CSV order: label, counts, categoricals.
pub fn column_names() -> Vec<String> {
    let mut names = Vec::with_capacity(NUM_COLUMNS);
    names.push(LABEL.to_string());
    names.extend(continuous_columns());
    names.extend(categorical_columns());
    names
}

/// The per-column decode rules, keyed in raw CSV order. Always 40 entries.
pub fn criteo_column_dtypes() -> Vec<(String, ColumnDtype)> {
    let mut dtypes = Vec::with_capacity(NUM_COLUMNS);
    dtypes.push((LABEL.to_string(), ColumnDtype::Int32));
    for name in continuous_columns() {
        dtypes.push((name, ColumnDtype::Int32));
    }
    for name in categorical_columns() {
        dtypes.push((name, ColumnDtype::Hex));
    }
    dtypes
}

// ============================================================================
// Arrow schemas
// ============================================================================

/// Schema of converted parquet: raw CSV order, everything `Int32`, only the
/// label non-nullable.
pub fn converted_schema() -> SchemaRef {
    let mut fields = Vec::with_capacity(NUM_COLUMNS);
    fields.push(Field::new(LABEL, DataType::Int32, false));
    for name in continuous_columns() {
        fields.push(Field::new(name, DataType::Int32, true));
    }
    for name in categorical_columns() {
        fields.push(Field::new(name, DataType::Int32, true));
    }
    Arc::new(Schema::new(fields))
}

/// Schema of transformed parquet: categorical codes first, then normalized
/// counts, label last. No nulls survive the transform.
pub fn transformed_schema() -> SchemaRef {
    let mut fields = Vec::with_capacity(NUM_COLUMNS);
    for name in categorical_columns() {
        fields.push(Field::new(name, DataType::Int32, false));
    }
    for name in continuous_columns() {
        fields.push(Field::new(name, DataType::Float32, false));
    }
    fields.push(Field::new(LABEL, DataType::Int32, false));
    Arc::new(Schema::new(fields))
}

// ============================================================================
// Field parsers
// ============================================================================

/// A raw CSV field that does not decode under its column's dtype rule.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("invalid integer literal `{0}`")]
    Int(String),
    #[error("invalid hex literal `{0}`")]
    Hex(String),
}

/// Decode a decimal integer field. Empty (or all-whitespace) means null.
pub fn parse_i32_field(field: &[u8]) -> Result<Option<i32>, FieldError> {
    if field.is_empty() {
        return Ok(None);
    }
    let text = std::str::from_utf8(field)
        .map_err(|_| FieldError::Int(String::from_utf8_lossy(field).into_owned()))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<i32>()
        .map(Some)
        .map_err(|_| FieldError::Int(trimmed.to_string()))
}

/// Decode a hex categorical field. Empty means null; a leading `0x`/`0X` is
/// tolerated; more than eight digits is an error rather than a silent wrap.
/// The u32 value is reinterpreted as i32, so `ffffffff` decodes to -1.
pub fn parse_hex32(field: &[u8]) -> Result<Option<i32>, FieldError> {
    if field.is_empty() {
        return Ok(None);
    }
    let digits = match field {
        [b'0', b'x', rest @ ..] | [b'0', b'X', rest @ ..] => rest,
        _ => field,
    };
    if digits.is_empty() || digits.len() > 8 {
        return Err(FieldError::Hex(String::from_utf8_lossy(field).into_owned()));
    }
    let mut value: u32 = 0;
    for &b in digits {
        let nibble = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(FieldError::Hex(String::from_utf8_lossy(field).into_owned())),
        };
        value = (value << 4) | u32::from(nibble);
    }
    Ok(Some(value as i32))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_map_covers_all_forty_columns() {
        let dtypes = criteo_column_dtypes();
        assert_eq!(dtypes.len(), 40);
        assert_eq!(dtypes[0], (LABEL.to_string(), ColumnDtype::Int32));
        let ints = dtypes
            .iter()
            .filter(|(name, dt)| name.starts_with('I') && *dt == ColumnDtype::Int32)
            .count();
        let hexes = dtypes
            .iter()
            .filter(|(name, dt)| name.starts_with('C') && *dt == ColumnDtype::Hex)
            .count();
        assert_eq!(ints, 13);
        assert_eq!(hexes, 26);
        assert_eq!(dtypes[1].0, "I1");
        assert_eq!(dtypes[13].0, "I13");
        assert_eq!(dtypes[14].0, "C1");
        assert_eq!(dtypes[39].0, "C26");
    }

    #[test]
    fn converted_schema_matches_raw_order() {
        let schema = converted_schema();
        assert_eq!(schema.fields().len(), 40);
        assert_eq!(schema.field(0).name(), "label");
        assert!(!schema.field(0).is_nullable());
        assert_eq!(schema.field(1).name(), "I1");
        assert_eq!(schema.field(14).name(), "C1");
        for field in schema.fields().iter().skip(1) {
            assert_eq!(field.data_type(), &DataType::Int32);
            assert!(field.is_nullable());
        }
    }

    #[test]
    fn transformed_schema_orders_categoricals_first() {
        let schema = transformed_schema();
        assert_eq!(schema.fields().len(), 40);
        assert_eq!(schema.field(0).name(), "C1");
        assert_eq!(schema.field(25).name(), "C26");
        assert_eq!(schema.field(26).name(), "I1");
        assert_eq!(schema.field(38).name(), "I13");
        assert_eq!(schema.field(39).name(), "label");
        assert_eq!(schema.field(0).data_type(), &DataType::Int32);
        assert_eq!(schema.field(26).data_type(), &DataType::Float32);
        assert!(schema.fields().iter().all(|f| !f.is_nullable()));
    }

    #[test]
    fn parses_decimal_fields() {
        assert_eq!(parse_i32_field(b""), Ok(None));
        assert_eq!(parse_i32_field(b"  "), Ok(None));
        assert_eq!(parse_i32_field(b"42"), Ok(Some(42)));
        assert_eq!(parse_i32_field(b"-3"), Ok(Some(-3)));
        assert_eq!(parse_i32_field(b" 7 "), Ok(Some(7)));
        assert!(parse_i32_field(b"4.5").is_err());
        assert!(parse_i32_field(b"abc").is_err());
    }

    #[test]
    fn parses_hex_fields() {
        assert_eq!(parse_hex32(b""), Ok(None));
        assert_eq!(parse_hex32(b"68fd1e64"), Ok(Some(0x68fd_1e64_u32 as i32)));
        assert_eq!(parse_hex32(b"ABCD"), Ok(Some(0xabcd)));
        assert_eq!(parse_hex32(b"0xff"), Ok(Some(255)));
        assert_eq!(parse_hex32(b"0"), Ok(Some(0)));
        assert_eq!(parse_hex32(b"ffffffff"), Ok(Some(-1)));
        assert!(parse_hex32(b"123456789").is_err());
        assert!(parse_hex32(b"0x").is_err());
        assert!(parse_hex32(b"xyz").is_err());
    }
}
