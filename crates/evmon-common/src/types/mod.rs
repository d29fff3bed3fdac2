//! Common types used across the event monitoring workspace

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CommonError, Result};

/// Field list separator used by `LogFileFieldNames` and `LogFileFieldTypes`
pub const FIELD_SEPARATOR: char = ',';

/// Metadata describing one remote event log file.
///
/// Field names follow the remote API so a serialized descriptor is the same
/// document the remote system returned, minus its `attributes` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventLogFile {
    pub id: String,
    #[serde(default)]
    pub created_date: Option<String>,
    pub event_type: String,
    #[serde(default)]
    pub log_date: Option<String>,
    /// Path (relative to the instance URL) of the raw log content
    pub log_file: String,
    #[serde(default)]
    pub log_file_length: Option<f64>,
    #[serde(default)]
    pub log_file_content_type: Option<String>,
    #[serde(default)]
    pub log_file_field_names: String,
    #[serde(default)]
    pub log_file_field_types: String,
}

impl EventLogFile {
    /// Decode a descriptor from a raw JSON record
    pub fn from_record(record: serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(record))?)
    }

    /// Ordered column names of the log file
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        split_fields(&self.log_file_field_names)
    }

    /// Ordered column type tags of the log file, aligned with [`Self::field_names`]
    pub fn field_types(&self) -> impl Iterator<Item = &str> {
        split_fields(&self.log_file_field_types)
    }

    /// Check that every column name has exactly one type tag
    pub fn validate_schema(&self) -> Result<()> {
        let names = self.field_names().count();
        let types = self.field_types().count();

        if names != types {
            return Err(CommonError::invalid_descriptor(
                &self.id,
                format!("{} field names but {} field types", names, types),
            ));
        }

        Ok(())
    }

    /// Parse `LogDate` into a UTC timestamp
    pub fn log_timestamp(&self) -> Option<DateTime<Utc>> {
        self.log_date.as_deref().and_then(parse_timestamp)
    }
}

fn split_fields(joined: &str) -> impl Iterator<Item = &str> {
    joined
        .split(FIELD_SEPARATOR)
        .map(str::trim)
        .filter(|field| !field.is_empty())
}

/// Parse the timestamp formats the remote API emits.
///
/// Accepts RFC 3339 (`2019-11-13T22:29:34.366Z`) and the offset-without-colon
/// form used in SOQL results (`2019-11-13T00:00:00.000+0000`).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
}

/// One row extracted from a log file, before type coercion
pub type RawEventRecord = BTreeMap<String, String>;

/// One row after type coercion
pub type EventRecord = BTreeMap<String, FieldValue>;

/// A typed log field value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}
