use std::collections::{BTreeMap, BTreeSet};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AccessControlEntry, ContractError};
use crate::store::Record;

/// Whether a class holds a single entity or a collection of them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassKind {
    Object,
    Array,
}

/// Type tag of a declared field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl FieldType {
    /// Whether a JSON value is acceptable for this type. `null` always is.
    pub fn admits(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (FieldType::Any, _) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            (FieldType::Array, Value::Array(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type", default)]
    pub ty: FieldType,
    /// Obsolete fields stay in storage but can no longer be read or written
    #[serde(default)]
    pub obsolete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("unknown field '{0}'")]
    Unknown(String),
    #[error("field '{0}' is obsolete")]
    Obsolete(String),
    #[error("field '{field}' expects a value of type {expected:?}")]
    TypeMismatch { field: String, expected: FieldType },
    #[error("missing primary key '{0}'")]
    MissingPrimaryKey(String),
    #[error("field '{0}' is not a counter field")]
    NotCounter(String),
}

/// A named data class of a service contract
///
/// The field map drives validation of everything flowing in and out of the engine.
/// A class without declared fields is schema-less: any attribute is accepted and
/// returned as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataClass {
    #[serde(rename = "type")]
    pub kind: ClassKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub counter: Vec<String>,
    #[serde(default)]
    pub index: Vec<String>,
    /// Lifetime in seconds of appended entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_after: Option<u64>,
    #[serde(default)]
    pub acl: Vec<AccessControlEntry>,
}

impl DataClass {
    pub fn new(kind: ClassKind) -> Self {
        Self {
            kind,
            primary_key: None,
            fields: BTreeMap::new(),
            counter: Vec::new(),
            index: Vec::new(),
            expires_after: None,
            acl: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                ty,
                obsolete: false,
            },
        );
        self
    }

    pub fn obsolete_field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.insert(name.into(), FieldSpec { ty, obsolete: true });
        self
    }

    pub fn entry(mut self, entry: AccessControlEntry) -> Self {
        self.acl.push(entry);
        self
    }

    pub fn is_array(&self) -> bool {
        self.kind == ClassKind::Array
    }

    fn is_schemaless(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields callers may see, or `None` when the class is schema-less
    pub fn visible_fields(&self) -> Option<BTreeSet<String>> {
        if self.is_schemaless() {
            return None;
        }
        Some(
            self.fields
                .iter()
                .filter(|(_, spec)| !spec.obsolete)
                .map(|(name, _)| name.clone())
                .collect(),
        )
    }

    fn check_field(&self, name: &str) -> Result<Option<&FieldSpec>, FieldError> {
        if self.is_schemaless() {
            return Ok(None);
        }
        match self.fields.get(name) {
            None => Err(FieldError::Unknown(name.to_string())),
            Some(spec) if spec.obsolete => Err(FieldError::Obsolete(name.to_string())),
            Some(spec) => Ok(Some(spec)),
        }
    }

    /// Validate a full record for storage
    pub fn validate_record(&self, record: &Record) -> Result<(), FieldError> {
        self.validate_patch(record)?;
        if let Some(pk) = &self.primary_key {
            match record.get(pk) {
                None | Some(Value::Null) => return Err(FieldError::MissingPrimaryKey(pk.clone())),
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Validate a partial record used to update existing entries
    pub fn validate_patch(&self, patch: &Record) -> Result<(), FieldError> {
        for (name, value) in patch {
            if let Some(spec) = self.check_field(name)? {
                if !spec.ty.admits(value) {
                    return Err(FieldError::TypeMismatch {
                        field: name.clone(),
                        expected: spec.ty,
                    });
                }
            }
        }
        Ok(())
    }

    /// Validate the field names referenced by a filter
    pub fn validate_filter_fields<'a>(
        &self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> Result<(), FieldError> {
        for name in names {
            self.check_field(name)?;
        }
        Ok(())
    }

    /// Validate the field names of a counter subscription filter
    pub fn validate_counter_fields<'a>(
        &self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> Result<(), FieldError> {
        for name in names {
            self.check_field(name)?;
            if !self.counter.is_empty() && !self.counter.contains(name) {
                return Err(FieldError::NotCounter(name.clone()));
            }
        }
        Ok(())
    }

    /// Lifetime of appended entries, if the class expires them
    pub fn ttl(&self) -> Option<TimeDelta> {
        self.expires_after
            .and_then(|seconds| i64::try_from(seconds).ok())
            .and_then(TimeDelta::try_seconds)
    }

    /// Strip obsolete and undeclared attributes from a stored record
    pub fn redact(&self, record: &mut Record) {
        if let Some(visible) = self.visible_fields() {
            record.retain(|name, _| visible.contains(name));
        }
    }

    pub(super) fn check_shape(&self, name: &str) -> Result<(), ContractError> {
        let invalid = |reason: String| ContractError::InvalidClass {
            class: name.to_string(),
            reason,
        };

        if self.kind == ClassKind::Object {
            if self.expires_after.is_some() {
                return Err(invalid("object classes cannot expire".to_string()));
            }
            if self.primary_key.is_some() || !self.counter.is_empty() {
                return Err(invalid(
                    "primary_key and counter apply to array classes only".to_string(),
                ));
            }
        }
        if let Some(seconds) = self.expires_after {
            if seconds == 0 {
                return Err(invalid("expires_after must be positive".to_string()));
            }
            if self.ttl().is_none() {
                return Err(invalid(format!(
                    "expires_after of {} seconds is out of range",
                    seconds
                )));
            }
        }

        let declared = self
            .primary_key
            .iter()
            .chain(self.counter.iter())
            .chain(self.index.iter());
        for field in declared {
            self.check_field(field)
                .map_err(|e| invalid(format!("{} ({})", e, field)))?;
        }
        Ok(())
    }
}
