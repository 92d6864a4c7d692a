use serde::Serialize;

use crate::error::ServiceError;

const MIME_JSON: &str = "application/json";
const MIME_YAML: &str = "application/x-yaml";
const MIME_YAML_ALT: &str = "application/yaml";
const MIME_YAML_TEXT: &str = "text/yaml";

/// The two wire formats the service speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Json,
    Yaml,
}

impl MediaType {
    /// Canonical MIME name used on replies.
    #[must_use]
    pub fn mime(self) -> &'static str {
        match self {
            Self::Json => MIME_JSON,
            Self::Yaml => MIME_YAML,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Json => "JSON",
            Self::Yaml => "YAML",
        }
    }
}

/// Lowercases and strips the parameter section of a `Content-Type` value
/// (`application/json; charset=utf-8` → `application/json`).
#[must_use]
pub fn normalize_mime(header: &str) -> String {
    let base = header.split(';').next().unwrap_or(header);
    base.trim().to_ascii_lowercase()
}

#[must_use]
pub fn media_type_for(mime: &str) -> Option<MediaType> {
    match mime {
        MIME_JSON => Some(MediaType::Json),
        MIME_YAML | MIME_YAML_ALT | MIME_YAML_TEXT => Some(MediaType::Yaml),
        _ => None,
    }
}

/// Picks the reply format from the `Accept` header: YAML when any YAML alias
/// is named, JSON otherwise.
#[must_use]
pub fn response_format(accept: Option<&str>) -> MediaType {
    let Some(header) = accept else {
        return MediaType::Json;
    };
    let lowered = header.to_ascii_lowercase();
    if [MIME_YAML, MIME_YAML_ALT, MIME_YAML_TEXT]
        .iter()
        .any(|alias| lowered.contains(alias))
    {
        MediaType::Yaml
    } else {
        MediaType::Json
    }
}

pub fn encode<T: Serialize>(value: &T, format: MediaType) -> Result<String, ServiceError> {
    match format {
        MediaType::Json => {
            serde_json::to_string(value).map_err(|error| ServiceError::Encode(error.to_string()))
        }
        MediaType::Yaml => {
            serde_yaml::to_string(value).map_err(|error| ServiceError::Encode(error.to_string()))
        }
    }
}
