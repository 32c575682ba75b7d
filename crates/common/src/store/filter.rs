use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Record;

/// How filter values are compared against record attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Exact JSON equality
    #[default]
    Equal,
    /// Case-insensitive substring match for strings, equality otherwise
    Contains,
}

/// Field-name/value predicate applied during scans
///
/// An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub mode: MatchMode,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn with_mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.fields.iter().all(|(field, expected)| {
            let Some(actual) = record.get(field) else {
                return expected.is_null();
            };
            match (self.mode, expected, actual) {
                (MatchMode::Contains, Value::String(needle), Value::String(haystack)) => haystack
                    .to_lowercase()
                    .contains(&needle.to_lowercase()),
                _ => expected == actual,
            }
        })
    }

    /// Stable textual key, used to group subscriptions on the same predicate
    pub fn key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
