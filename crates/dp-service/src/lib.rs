#![forbid(unsafe_code)]

use dp_dataset::Dataset;
use dp_engine::{IndicatorEngine, OperationResult, OperationStatus, iso_timestamp_utc};
use dp_preprocess::{PreprocessReport, Preprocessor};
use serde::{Deserialize, Serialize};

pub mod codec;
mod config;
mod envelope;
mod error;

pub use codec::MediaType;
pub use config::ServiceConfig;
pub use error::{ErrorBody, ErrorKind, ServiceError};

use envelope::ParsedRequest;

/// Wire shape of a successful analysis. `operation_results` is present only
/// when the request carried operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub cleaned_dataset: Dataset,
    pub outliers_dataset: Dataset,
    pub report: PreprocessReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_results: Option<Vec<OperationResult>>,
}

/// One rendered reply: the status code, the negotiated media type, and the
/// encoded body. The surrounding transport maps these onto its own response
/// object.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceReply {
    pub status: u16,
    pub media_type: &'static str,
    pub body: String,
}

/// Request handler for the preprocessing-and-indicators pipeline: decode,
/// validate, preprocess, evaluate operations, encode. Stateless; one
/// instance can serve any number of independent requests.
#[derive(Debug, Clone, Default)]
pub struct AnalysisService {
    config: ServiceConfig,
}

impl AnalysisService {
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Full request → reply cycle. Failures before the operation stage turn
    /// into an error reply; per-operation failures are captured inside the
    /// success payload.
    #[must_use]
    pub fn handle_request(
        &self,
        body: &str,
        content_type: &str,
        accept: Option<&str>,
    ) -> ServiceReply {
        let response_format = codec::response_format(accept);

        match self.process(body, content_type) {
            Ok(response) => match codec::encode(&response, response_format) {
                Ok(encoded) => ServiceReply {
                    status: 200,
                    media_type: response_format.mime(),
                    body: encoded,
                },
                Err(error) => self.error_reply(&error, response_format),
            },
            Err(error) => self.error_reply(&error, response_format),
        }
    }

    /// Decodes and runs one request, returning the response model.
    pub fn process(&self, body: &str, content_type: &str) -> Result<AnalysisResponse, ServiceError> {
        let mime = codec::normalize_mime(content_type);
        let body_format = codec::media_type_for(&mime)
            .ok_or_else(|| ServiceError::UnsupportedContentType(mime))?;

        let request = match body_format {
            MediaType::Json => envelope::parse_json_request(body)?,
            MediaType::Yaml => envelope::parse_yaml_request(body)?,
        };
        self.check_declared_content_type(&request, body_format)?;
        self.check_ceilings(&request)?;

        tracing::info!(
            origin = %request.origin,
            rows = request.dataset.row_count(),
            operations = request.operations.len(),
            format = body_format.label(),
            "analysis request accepted"
        );

        let multiplier = request
            .multiplier
            .unwrap_or(self.config.default_multiplier);
        let preprocessor = Preprocessor::new(multiplier)?;
        let outcome = preprocessor.process(&request.dataset);
        tracing::debug!(
            outliers_removed = outcome.report.outliers_removed,
            missing_values_replaced = outcome.report.missing_values_replaced,
            normalized_fields = outcome.report.normalized_fields.len(),
            "preprocessing finished"
        );

        let operation_results = if request.operations.is_empty() {
            None
        } else {
            let results = IndicatorEngine::new().execute(&outcome.cleaned, &request.operations);
            for result in &results {
                if result.status == OperationStatus::Error {
                    tracing::warn!(
                        expr = %result.expr,
                        error = result.error_message.as_deref().unwrap_or(""),
                        "operation failed"
                    );
                }
            }
            Some(results)
        };

        Ok(AnalysisResponse {
            cleaned_dataset: outcome.cleaned,
            outliers_dataset: outcome.outliers,
            report: outcome.report,
            operation_results,
        })
    }

    /// A declared `data_descriptor.content_type` must agree with the format
    /// the body was actually parsed as, unless autodetection is requested.
    fn check_declared_content_type(
        &self,
        request: &ParsedRequest,
        body_format: MediaType,
    ) -> Result<(), ServiceError> {
        let Some(declared) = request
            .declared_content_type
            .as_deref()
            .map(codec::normalize_mime)
            .filter(|declared| !declared.is_empty())
        else {
            return Ok(());
        };

        if codec::media_type_for(&declared) == Some(body_format) || request.autodetect {
            return Ok(());
        }
        Err(ServiceError::ContentTypeMismatch {
            declared,
            actual: body_format.label(),
        })
    }

    fn check_ceilings(&self, request: &ParsedRequest) -> Result<(), ServiceError> {
        if request.dataset.row_count() > self.config.max_rows {
            return Err(ServiceError::TooManyRows {
                limit: self.config.max_rows,
            });
        }
        for operation in &request.operations {
            if operation.expr.len() > self.config.max_expression_chars {
                return Err(ServiceError::ExpressionTooLong {
                    limit: self.config.max_expression_chars,
                });
            }
        }
        Ok(())
    }

    fn error_reply(&self, error: &ServiceError, format: MediaType) -> ServiceReply {
        let kind = error.kind();
        tracing::warn!(kind = ?kind, error = %error, "request failed");

        let body = ErrorBody {
            error: kind,
            details: error.to_string(),
            timestamp: iso_timestamp_utc(),
        };
        let encoded = codec::encode(&body, format).unwrap_or_else(|_| {
            format!(
                "{{\"error\":\"internal_error\",\"details\":\"failed to encode error reply\",\"timestamp\":\"{}\"}}",
                iso_timestamp_utc()
            )
        });

        ServiceReply {
            status: kind.status(),
            media_type: format.mime(),
            body: encoded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AnalysisService, ServiceConfig};

    #[test]
    fn unsupported_content_types_are_unprocessable() {
        let service = AnalysisService::default();
        let reply = service.handle_request("{}", "text/csv", None);
        assert_eq!(reply.status, 422);
        assert!(reply.body.contains("unsupported content type"));
    }

    #[test]
    fn declared_content_type_mismatch_requires_autodetect() {
        let service = AnalysisService::default();
        let body = r#"{
            "data_descriptor": {"origin": "t", "content_type": "text/yaml"},
            "data": []
        }"#;
        let reply = service.handle_request(body, "application/json", None);
        assert_eq!(reply.status, 422);

        let body = r#"{
            "data_descriptor": {"origin": "t", "content_type": "text/yaml", "autodetect": true},
            "data": []
        }"#;
        let reply = service.handle_request(body, "application/json", None);
        assert_eq!(reply.status, 200);
    }

    #[test]
    fn row_ceiling_is_enforced_before_the_core() {
        let service = AnalysisService::new(ServiceConfig {
            max_rows: 1,
            ..ServiceConfig::default()
        });
        let body = r#"{
            "data_descriptor": {"origin": "t"},
            "data": [{"a": 1}, {"a": 2}]
        }"#;
        let reply = service.handle_request(body, "application/json", None);
        assert_eq!(reply.status, 422);
        assert!(reply.body.contains("row ceiling"));
    }

    #[test]
    fn non_numeric_multiplier_is_unprocessable() {
        let service = AnalysisService::default();
        let body = r#"{
            "data_descriptor": {"origin": "t"},
            "options": {"drop_outliers_percent": "abc"},
            "data": [{"a": 1}]
        }"#;
        let reply = service.handle_request(body, "application/json", None);
        assert_eq!(reply.status, 422);
        assert!(reply.body.contains("drop_outliers_percent"));
    }

    #[test]
    fn invalid_multiplier_is_an_internal_error() {
        let service = AnalysisService::default();
        let body = r#"{
            "data_descriptor": {"origin": "t"},
            "options": {"drop_outliers_percent": -1.0},
            "data": [{"a": 1}]
        }"#;
        let reply = service.handle_request(body, "application/json", None);
        assert_eq!(reply.status, 500);
        assert!(reply.body.contains("internal_error"));
    }
}
