//! Cross-origin response headers.
//!
//! Browser clients must receive a usable CORS response on every exit path,
//! rejections included, so [`apply_cors`] runs as the outermost middleware
//! layer and stamps the headers onto whatever response came back.

use axum::extract::{Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, ORIGIN,
};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;

use crate::gateway_util::AppState;
use crate::origin::OriginPolicy;

/// Build the CORS header set for a request origin.
///
/// Pure function of the origin and the immutable policy: an allowed origin
/// is reflected back, anything else (a disallowed origin or none at all)
/// gets the wildcard. Methods and headers are fixed to what the relay
/// accepts, and preflight results may be cached for a day.
pub fn cors_headers(request_origin: Option<&str>, policy: &OriginPolicy) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let allow_origin = match request_origin {
        Some(origin) if policy.is_allowed(origin) => origin,
        _ => "*",
    };
    if let Ok(value) = HeaderValue::from_str(allow_origin) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));

    headers
}

/// Middleware attaching the CORS headers of [`cors_headers`] to every
/// response.
pub async fn apply_cors(State(state): AppState, request: Request, next: Next) -> Response {
    let request_origin = request
        .headers()
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .extend(cors_headers(request_origin.as_deref(), &state.origin_policy));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_origin_is_reflected() {
        let policy = OriginPolicy::new(vec!["https://app.example.com".to_string()]);
        let headers = cors_headers(Some("https://app.example.com"), &policy);
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://app.example.com"
        );
    }

    #[test]
    fn test_disallowed_origin_falls_back_to_wildcard() {
        let policy = OriginPolicy::default();
        let headers = cors_headers(Some("https://evil.example.com"), &policy);
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }

    #[test]
    fn test_missing_origin_falls_back_to_wildcard() {
        let policy = OriginPolicy::default();
        let headers = cors_headers(None, &policy);
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }

    #[test]
    fn test_fixed_header_values() {
        let headers = cors_headers(None, &OriginPolicy::default());
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
            "POST, OPTIONS"
        );
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "Content-Type"
        );
        assert_eq!(headers.get(ACCESS_CONTROL_MAX_AGE).unwrap(), "86400");
    }

    #[test]
    fn test_dev_origin_is_reflected_without_configuration() {
        let headers = cors_headers(Some("http://localhost:3000"), &OriginPolicy::default());
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://localhost:3000"
        );
    }
}
