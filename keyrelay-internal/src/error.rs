use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::quota::RateLimitHeaders;

/// The crate-wide error type.
///
/// The details are boxed to keep the type a single pointer wide, since it
/// travels through every `Result` in the crate. Constructing an `Error`
/// through [`Error::new`] logs it at the level of its variant, so call
/// sites never log the same failure twice.
#[derive(Debug, PartialEq)]
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    /// For cases where the caller handles or rewraps the failure itself
    /// and a log line would be noise.
    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    /// The status code and JSON body this error presents to a client.
    ///
    /// Rejections on the admission path have fixed, documented bodies.
    /// Everything else collapses into the generic internal-error shape
    /// with the display string as the diagnostic, so upstream and parse
    /// failures never leak more than their message.
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        match self.get_details() {
            ErrorDetails::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                json!({"error": "Method not allowed"}),
            ),
            ErrorDetails::OriginRejected => {
                (StatusCode::FORBIDDEN, json!({"error": "Origin not allowed"}))
            }
            ErrorDetails::RateLimitExceeded { headers } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": "Rate limit exceeded",
                    "message": format!(
                        "Request quota of {} per window is exhausted; the quota resets at {}",
                        headers.limit, headers.reset
                    ),
                    "remaining": 0,
                    "resetAt": headers.reset,
                }),
            ),
            _ => (
                self.status_code(),
                json!({
                    "error": "Internal server error",
                    "details": self.to_string(),
                }),
            ),
        }
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    Config {
        message: String,
    },
    MethodNotAllowed,
    OriginRejected,
    RateLimitExceeded {
        headers: RateLimitHeaders,
    },
    InvalidRequestJson {
        message: String,
    },
    UpstreamRequest {
        message: String,
    },
    UpstreamResponseParse {
        message: String,
    },
    /// The quota store could not be read or written. Recovered by the
    /// admission gate (fail open), so this never reaches a client.
    QuotaStoreUnavailable {
        message: String,
    },
}

impl ErrorDetails {
    /// The tracing level at which this error should be logged.
    pub fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::MethodNotAllowed => tracing::Level::DEBUG,
            ErrorDetails::OriginRejected => tracing::Level::DEBUG,
            ErrorDetails::RateLimitExceeded { .. } => tracing::Level::DEBUG,
            ErrorDetails::InvalidRequestJson { .. } => tracing::Level::WARN,
            ErrorDetails::UpstreamRequest { .. } => tracing::Level::ERROR,
            ErrorDetails::UpstreamResponseParse { .. } => tracing::Level::ERROR,
            ErrorDetails::QuotaStoreUnavailable { .. } => tracing::Level::WARN,
        }
    }

    /// The HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorDetails::OriginRejected => StatusCode::FORBIDDEN,
            ErrorDetails::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::InvalidRequestJson { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::UpstreamRequest { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::UpstreamResponseParse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::QuotaStoreUnavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Log this error at the level returned by [`level`](Self::level).
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::MethodNotAllowed => write!(f, "Method not allowed"),
            ErrorDetails::OriginRejected => write!(f, "Origin not allowed"),
            ErrorDetails::RateLimitExceeded { .. } => write!(f, "Rate limit exceeded"),
            ErrorDetails::InvalidRequestJson { message } => {
                write!(f, "Failed to parse request body as JSON: {message}")
            }
            ErrorDetails::UpstreamRequest { message } => {
                write!(f, "Upstream request failed: {message}")
            }
            ErrorDetails::UpstreamResponseParse { message } => {
                write!(f, "Failed to parse upstream response as JSON: {message}")
            }
            ErrorDetails::QuotaStoreUnavailable { message } => {
                write!(f, "Quota store unavailable: {message}")
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        let mut response = (status_code, Json(body)).into_response();
        if let ErrorDetails::RateLimitExceeded { headers } = self.get_details() {
            response.headers_mut().extend(headers.to_header_map());
        }
        response
    }
}
