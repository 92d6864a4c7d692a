#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Elected type of a dataset column after profiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Numeric,
    Boolean,
    Text,
    Unknown,
}

/// One cell of a data point. Serializes untagged so that the wire formats
/// carry plain scalars (`10`, `true`, `"x"`, `null`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Float(f64),
    Text(String),
}

impl FieldValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Human-readable tag for error messages.
    #[must_use]
    pub fn type_label(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Float(_) => "numeric",
            Self::Text(_) => "text",
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Tentative numeric reading of a raw value. Text converts iff float parsing
/// consumes the whole trimmed string; booleans never convert here.
#[must_use]
pub fn numeric_coercion(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::Float(v) => Some(*v),
        FieldValue::Text(v) => {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<f64>().ok()
        }
        _ => None,
    }
}

/// Tentative boolean reading of a raw value: native booleans, the usual
/// true/yes/1 and false/no/0 spellings, and floats exactly 0 or 1.
#[must_use]
pub fn boolean_coercion(value: &FieldValue) -> Option<bool> {
    match value {
        FieldValue::Bool(v) => Some(*v),
        FieldValue::Text(v) => match v.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        FieldValue::Float(v) if *v == 0.0 => Some(false),
        FieldValue::Float(v) if *v == 1.0 => Some(true),
        _ => None,
    }
}

/// Display form used when a non-text value lands in a text column.
#[must_use]
pub fn display_text(value: &FieldValue) -> String {
    match value {
        FieldValue::Text(v) => v.clone(),
        FieldValue::Float(v) => v.to_string(),
        FieldValue::Bool(v) => v.to_string(),
        FieldValue::Null => String::new(),
    }
}
