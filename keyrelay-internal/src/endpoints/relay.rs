//! The relay surface: method dispatch, admission, and the single-attempt
//! forward to the upstream API.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::ORIGIN;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use secrecy::ExposeSecret;
use serde_json::Value;
use tracing::debug;

use crate::admission::AdmissionDecision;
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData};

/// Largest inbound body the relay will read.
const MAX_BODY_SIZE: usize = 100 * 1024 * 1024;

/// Entry point for every path that is not carved out explicitly.
///
/// The relay speaks one method dispatch regardless of path: preflights get
/// an empty 204 (the CORS layer supplies the headers), POST goes through
/// admission and forwarding, and everything else is the 405 contract
/// response. Admission never runs for OPTIONS, so preflights succeed even
/// without an Origin header.
pub async fn relay_entrypoint(State(state): AppState, request: Request) -> Response {
    if request.method() == Method::OPTIONS {
        return preflight().await.into_response();
    }
    if request.method() != Method::POST {
        return Error::new(ErrorDetails::MethodNotAllowed).into_response();
    }
    match relay_request(&state, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

/// Preflight response: an empty 204. The CORS layer supplies the headers,
/// and it runs for every path, carved-out routes included.
pub async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// 405 handler for unmatched methods on the carved-out routes, so the
/// whole surface shares one method-not-allowed response.
pub async fn method_not_allowed() -> Response {
    Error::new(ErrorDetails::MethodNotAllowed).into_response()
}

async fn relay_request(state: &AppStateData, request: Request) -> Result<Response, Error> {
    let request_origin = request
        .headers()
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let supplied_admin_token = admin_token_from_query(request.uri().query());
    let client_id = client_identifier(request.headers(), peer_addr(&request));

    let decision = state
        .gate
        .evaluate(
            request_origin.as_deref(),
            &client_id,
            supplied_admin_token.as_deref(),
            state.config.quota.limit,
            state.config.quota.window_seconds,
        )
        .await?;

    let quota_headers = match decision {
        AdmissionDecision::Allow(headers) => headers,
        AdmissionDecision::Deny(headers) => {
            return Err(Error::new(ErrorDetails::RateLimitExceeded { headers }));
        }
    };

    let body_bytes = axum::body::to_bytes(request.into_body(), MAX_BODY_SIZE)
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::InvalidRequestJson {
                message: format!("failed to read request body: {e}"),
            })
        })?;
    let payload: Value = serde_json::from_slice(&body_bytes).map_err(|e| {
        Error::new(ErrorDetails::InvalidRequestJson {
            message: e.to_string(),
        })
    })?;

    debug!(client_id, "Forwarding request upstream");

    let upstream_response = state
        .http_client
        .post(state.config.upstream.url.clone())
        .header(
            state.config.upstream.credential_header.as_str(),
            state.config.upstream_api_key.expose_secret(),
        )
        .timeout(Duration::from_secs(state.config.upstream.timeout_seconds))
        .json(&payload)
        .send()
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::UpstreamRequest {
                message: e.to_string(),
            })
        })?;

    let upstream_status = upstream_response.status();
    let upstream_bytes = upstream_response.bytes().await.map_err(|e| {
        Error::new(ErrorDetails::UpstreamRequest {
            message: format!("failed to read upstream response: {e}"),
        })
    })?;
    let upstream_json: Value = serde_json::from_slice(&upstream_bytes).map_err(|e| {
        Error::new(ErrorDetails::UpstreamResponseParse {
            message: e.to_string(),
        })
    })?;

    // Relay the upstream verdict untouched, whatever it was.
    let status =
        StatusCode::from_u16(upstream_status.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(upstream_json)).into_response();
    if let Some(headers) = quota_headers {
        response.headers_mut().extend(headers.to_header_map());
    }
    Ok(response)
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// The quota key for a request: the first `X-Forwarded-For` hop when
/// present (the gateway normally runs behind an edge or load balancer),
/// else the socket peer address, else the literal `"unknown"`.
fn client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// The `admin_key` query parameter, accepted on any path.
fn admin_token_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "admin_key")
        .map(|(_, value)| value.into_owned())
}
