//! Table schemas and change validation.
//!
//! Every document is created with a [`TableSchema`]. The gateway validates each
//! proposed [`Change`] against it before any conflict handling happens, so a
//! schema violation never reaches the log.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Change, FieldValue};

/// Cell type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    Text,
    Number,
    Checkbox,
    SingleSelect,
    MultipleSelect,
}

/// One column definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// Required fields must be present on create and can never be cleared
    #[serde(default)]
    pub required: bool,
    /// Allowed options for select fields; empty accepts any text
    #[serde(default)]
    pub choices: Vec<String>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            choices: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    fn check_value(&self, value: &FieldValue) -> Result<(), SchemaViolation> {
        let mismatch = || SchemaViolation::TypeMismatch {
            field: self.name.clone(),
            expected: self.field_type,
        };

        match (self.field_type, value) {
            (_, FieldValue::Null) => Ok(()),
            (FieldType::Text, FieldValue::Text(_)) => Ok(()),
            (FieldType::Number, FieldValue::Number(n)) if n.is_finite() => Ok(()),
            (FieldType::Checkbox, FieldValue::Bool(_)) => Ok(()),
            (FieldType::SingleSelect, FieldValue::Text(choice)) => self.check_choice(choice),
            (FieldType::MultipleSelect, FieldValue::List(items)) => {
                for item in items {
                    match item {
                        FieldValue::Text(choice) => self.check_choice(choice)?,
                        _ => return Err(mismatch()),
                    }
                }
                Ok(())
            }
            _ => Err(mismatch()),
        }
    }

    fn check_choice(&self, choice: &str) -> Result<(), SchemaViolation> {
        if self.choices.is_empty() || self.choices.iter().any(|c| c == choice) {
            Ok(())
        } else {
            Err(SchemaViolation::InvalidChoice {
                field: self.name.clone(),
                value: choice.to_string(),
            })
        }
    }
}

/// Reasons a change does not fit its table.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaViolation {
    #[error("record id must not be empty")]
    EmptyRecordId,
    #[error("change sets no fields")]
    EmptyChange,
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("field '{field}' expects a {expected:?} value")]
    TypeMismatch { field: String, expected: FieldType },
    #[error("'{value}' is not an option of field '{field}'")]
    InvalidChoice { field: String, value: String },
    #[error("required field '{0}' is missing")]
    MissingRequired(String),
    #[error("required field '{0}' cannot be cleared")]
    RequiredCleared(String),
    #[error("duplicate field name '{0}' in schema")]
    DuplicateField(String),
}

/// Column layout of one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub fields: Vec<FieldDef>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldDef>) -> Result<Self, SchemaViolation> {
        let schema = Self { fields };
        schema.check()?;
        Ok(schema)
    }

    /// Reject schemas with repeated field names.
    pub fn check(&self) -> Result<(), SchemaViolation> {
        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(SchemaViolation::DuplicateField(field.name.clone()));
            }
        }
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a proposed change against this schema.
    pub fn validate(&self, change: &Change) -> Result<(), SchemaViolation> {
        if change.record_id().is_empty() {
            return Err(SchemaViolation::EmptyRecordId);
        }

        match change {
            Change::CreateRecord { fields, .. } => {
                for (name, value) in fields {
                    self.known(name)?.check_value(value)?;
                }
                for def in self.fields.iter().filter(|f| f.required) {
                    match fields.get(&def.name) {
                        Some(value) if !value.is_null() => {}
                        _ => return Err(SchemaViolation::MissingRequired(def.name.clone())),
                    }
                }
                Ok(())
            }
            Change::SetFields { fields, .. } => {
                if fields.is_empty() {
                    return Err(SchemaViolation::EmptyChange);
                }
                for (name, value) in fields {
                    let def = self.known(name)?;
                    if def.required && value.is_null() {
                        return Err(SchemaViolation::RequiredCleared(name.clone()));
                    }
                    def.check_value(value)?;
                }
                Ok(())
            }
            Change::DeleteRecord { .. } => Ok(()),
        }
    }

    fn known(&self, name: &str) -> Result<&FieldDef, SchemaViolation> {
        self.field(name)
            .ok_or_else(|| SchemaViolation::UnknownField(name.to_string()))
    }
}
