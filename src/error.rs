//! Error taxonomy for the proxy.
//!
//! Startup errors (`ContractError`, `RuleError`, `TokenError`) are fatal and
//! stop the process before any traffic is accepted. `ProxyError` covers the
//! per-request rejections surfaced to the client.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Response header naming the rejection code on proxy-generated errors.
pub const ERROR_HEADER: &str = "x-contract-proxy-error";

/// The contract document could not be loaded (`ContractInvalid`).
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("failed to read contract {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("contract document is not valid YAML or JSON: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("not an OpenAPI 3 document: {0}")]
    UnsupportedDocument(String),

    #[error("invalid path template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("{method} {template}: {reason}")]
    InvalidOperation {
        method: String,
        template: String,
        reason: String,
    },

    #[error("ambiguous operations: {method} {first} and {method} {second} match the same paths")]
    Ambiguous {
        method: String,
        first: String,
        second: String,
    },
}

/// The selection rule file could not be loaded (`RuleInvalid`).
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read rule file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rule file is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{entry}: {reason}")]
    Invalid { entry: String, reason: String },
}

/// The selection token configuration cannot produce a valid token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid selection token name '{0}'")]
    InvalidName(String),

    #[error("invalid selection token template: {0}")]
    Template(#[from] Box<handlebars::TemplateError>),

    #[error("failed to render selection token for example '{example}': {source}")]
    Render {
        example: String,
        #[source]
        source: Box<handlebars::RenderError>,
    },

    #[error("selection token for example '{example}' is not a valid header value: '{value}'")]
    InvalidValue { example: String, value: String },
}

/// Failure talking to the upstream mock engine.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("upstream mock engine unreachable: {0}")]
    Unreachable(String),

    #[error("request did not complete within its {timeout_ms} ms budget")]
    Timeout { timeout_ms: u64 },
}

/// Why an operation was resolved but no example could be selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoExampleReason {
    /// No rule matched and no default example is configured.
    NoRuleMatched,
    /// The request body had to be interpreted as JSON but could not be parsed.
    MalformedBody { detail: String },
    /// The body exceeded the configured size limit.
    BodyTooLarge { limit: usize },
    /// The body could not be read from the client.
    BodyUnreadable { detail: String },
    /// A parameter the operation marks as required is missing.
    MissingParameter { location: String, name: String },
    /// No selection token was prepared for the resolved example.
    TokenUnavailable { example: String },
}

impl fmt::Display for NoExampleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoExampleReason::NoRuleMatched => {
                write!(f, "no selection rule matched and no default example is configured")
            }
            NoExampleReason::MalformedBody { detail } => {
                write!(f, "request body is not valid JSON: {}", detail)
            }
            NoExampleReason::BodyTooLarge { limit } => {
                write!(f, "request body exceeds {} bytes", limit)
            }
            NoExampleReason::BodyUnreadable { detail } => {
                write!(f, "request body could not be read: {}", detail)
            }
            NoExampleReason::MissingParameter { location, name } => {
                write!(f, "required {} parameter '{}' is missing", location, name)
            }
            NoExampleReason::TokenUnavailable { example } => {
                write!(f, "no selection token available for example '{}'", example)
            }
        }
    }
}

/// A client-visible rejection of a single request.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("no operation in the contract matches {method} {path}")]
    NoOperation { method: String, path: String },

    #[error("operation {operation_id} matched but no example could be selected: {reason}")]
    NoExample {
        operation_id: String,
        reason: NoExampleReason,
    },

    #[error(transparent)]
    Upstream(#[from] RelayError),
}

impl ProxyError {
    /// Stable machine-readable code for this rejection.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::NoOperation { .. } => "no_operation",
            ProxyError::NoExample {
                reason: NoExampleReason::BodyTooLarge { .. },
                ..
            } => "request_body_too_large",
            ProxyError::NoExample { .. } => "no_example",
            ProxyError::Upstream(RelayError::Unreachable(_)) => "upstream_unreachable",
            ProxyError::Upstream(RelayError::Timeout { .. }) => "upstream_timeout",
        }
    }

    /// HTTP status returned to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoOperation { .. } => StatusCode::NOT_FOUND,
            ProxyError::NoExample {
                reason: NoExampleReason::BodyTooLarge { .. },
                ..
            } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::NoExample { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ProxyError::Upstream(RelayError::Unreachable(_)) => StatusCode::BAD_GATEWAY,
            ProxyError::Upstream(RelayError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a NoExampleReason>,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (operation_id, reason) = match &self {
            ProxyError::NoExample {
                operation_id,
                reason,
            } => (Some(operation_id.as_str()), Some(reason)),
            _ => (None, None),
        };
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            operation_id,
            reason,
        };

        let mut response = (self.status(), Json(body)).into_response();
        response
            .headers_mut()
            .insert(ERROR_HEADER, HeaderValue::from_static(self.code()));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_map_to_distinct_statuses() {
        let no_op = ProxyError::NoOperation {
            method: "DELETE".to_string(),
            path: "/api/items".to_string(),
        };
        let no_example = ProxyError::NoExample {
            operation_id: "createItem".to_string(),
            reason: NoExampleReason::NoRuleMatched,
        };
        let timeout = ProxyError::Upstream(RelayError::Timeout { timeout_ms: 50 });
        let unreachable = ProxyError::Upstream(RelayError::Unreachable("refused".to_string()));

        assert_eq!(no_op.status(), StatusCode::NOT_FOUND);
        assert_eq!(no_example.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(unreachable.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(no_op.code(), "no_operation");
        assert_eq!(timeout.code(), "upstream_timeout");
    }

    #[test]
    fn test_body_too_large_is_distinguished() {
        let err = ProxyError::NoExample {
            operation_id: "createItem".to_string(),
            reason: NoExampleReason::BodyTooLarge { limit: 16 },
        };
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.code(), "request_body_too_large");
    }

    #[test]
    fn test_error_response_carries_code_header() {
        let response = ProxyError::NoOperation {
            method: "GET".to_string(),
            path: "/nowhere".to_string(),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(ERROR_HEADER).unwrap(),
            "no_operation"
        );
    }

    #[test]
    fn test_reason_serializes_with_kind_tag() {
        let reason = NoExampleReason::MissingParameter {
            location: "query".to_string(),
            name: "page".to_string(),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "missing_parameter");
        assert_eq!(json["name"], "page");
    }
}
