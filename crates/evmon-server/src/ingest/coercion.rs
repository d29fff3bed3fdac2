//! Field type coercion
//!
//! Every log file declares a type tag per column. Values arrive as text and
//! are converted according to that tag:
//!
//! | tag                              | result                         |
//! |----------------------------------|--------------------------------|
//! | `String`, `Id`, `EscapedText`    | text, unchanged                |
//! | `Number`                         | number                         |
//! | `DateTime`                       | UTC timestamp                  |
//! | `Error`                          | always fails the whole batch   |
//! | anything else / column not typed | text, unchanged, with a warning |
//!
//! A `Number` or `DateTime` value that does not parse is kept as text and
//! logged. Empty values stay empty text.

use evmon_common::types::{parse_timestamp, EventLogFile, EventRecord, FieldValue, RawEventRecord};
use evmon_common::CommonError;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoercionError {
    #[error("Field '{field}' is tagged Error (value: '{value}')")]
    ErrorTag { field: String, value: String },

    #[error(transparent)]
    Schema(#[from] CommonError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Id,
    EscapedText,
    Number,
    DateTime,
    /// Forces a failure; used to exercise error paths end to end
    Error,
    Unknown(String),
}

impl FieldType {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "String" => FieldType::String,
            "Id" => FieldType::Id,
            "EscapedText" => FieldType::EscapedText,
            "Number" => FieldType::Number,
            "DateTime" => FieldType::DateTime,
            "Error" => FieldType::Error,
            other => FieldType::Unknown(other.to_string()),
        }
    }
}

/// Column name to type, built once per log file
#[derive(Debug, Clone, Default)]
pub struct FieldTypeMap {
    types: HashMap<String, FieldType>,
}

impl FieldTypeMap {
    /// Zip the descriptor's field names with its field types
    pub fn from_descriptor(file: &EventLogFile) -> Result<Self, CoercionError> {
        file.validate_schema()?;
        Ok(Self::from_pairs(file.field_names().zip(file.field_types())))
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let types = pairs
            .into_iter()
            .map(|(name, tag)| (name.to_string(), FieldType::from_tag(tag)))
            .collect();
        Self { types }
    }

    pub fn get(&self, field: &str) -> Option<&FieldType> {
        self.types.get(field)
    }

    pub fn coerce_value(&self, field: &str, value: String) -> Result<FieldValue, CoercionError> {
        let Some(field_type) = self.types.get(field) else {
            return Ok(FieldValue::Text(value));
        };

        match field_type {
            FieldType::String | FieldType::Id | FieldType::EscapedText | FieldType::Unknown(_) => {
                Ok(FieldValue::Text(value))
            }
            FieldType::Error => Err(CoercionError::ErrorTag {
                field: field.to_string(),
                value,
            }),
            _ if value.is_empty() => Ok(FieldValue::Text(value)),
            FieldType::Number => match value.trim().parse::<f64>() {
                Ok(number) if number.is_finite() => Ok(FieldValue::Number(number)),
                _ => {
                    tracing::warn!(field, value = %value, "Value is not a number, keeping text");
                    Ok(FieldValue::Text(value))
                }
            },
            FieldType::DateTime => match parse_timestamp(value.trim()) {
                Some(ts) => Ok(FieldValue::Timestamp(ts)),
                None => {
                    tracing::warn!(field, value = %value, "Value is not a timestamp, keeping text");
                    Ok(FieldValue::Text(value))
                }
            },
        }
    }

    pub fn coerce_record(&self, record: RawEventRecord) -> Result<EventRecord, CoercionError> {
        record
            .into_iter()
            .map(|(field, value)| {
                let value = self.coerce_value(&field, value)?;
                Ok((field, value))
            })
            .collect()
    }

    /// Warn once per column that has no usable conversion
    fn report_untyped<'a>(&self, fields: impl Iterator<Item = &'a String>) {
        let mut seen = HashSet::new();
        for field in fields {
            if !seen.insert(field.as_str()) {
                continue;
            }
            match self.types.get(field) {
                None => tracing::warn!(field = %field, "Field has no declared type, keeping text"),
                Some(FieldType::Unknown(tag)) => {
                    tracing::warn!(field = %field, tag = %tag, "Unrecognized field type, keeping text")
                }
                Some(_) => {}
            }
        }
    }
}

/// Coerce every record of one log file; the first `Error` tagged value fails all of them
pub fn coerce_records(
    file: &EventLogFile,
    records: Vec<RawEventRecord>,
) -> Result<Vec<EventRecord>, CoercionError> {
    let map = FieldTypeMap::from_descriptor(file)?;
    map.report_untyped(records.iter().flat_map(|record| record.keys()));

    records
        .into_iter()
        .map(|record| map.coerce_record(record))
        .collect()
}
