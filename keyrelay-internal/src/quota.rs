//! Per-client usage tracking against the shared quota store.
//!
//! The store holds one JSON [`QuotaRecord`] per client key, expired by the
//! store's own TTL mechanism. The read-modify-write in
//! [`QuotaLimiter::check`] is not atomic: N requests from one client that
//! are in flight at the same instant can overcount by at most N - 1, so the
//! enforced guarantee is approximately `limit` per window, not an exact
//! count. Store failures surface as
//! [`ErrorDetails::QuotaStoreUnavailable`] and are left unlogged here so
//! the admission gate can decide how to degrade.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::admission::AdmissionDecision;
use crate::error::{Error, ErrorDetails};

/// Seconds since the unix epoch.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn quota_key(client_id: &str) -> String {
    format!("keyrelay:quota:{client_id}")
}

/// Per-client usage state as stored in the quota store.
///
/// `count` never exceeds the configured limit while `now < reset_at`; once
/// `reset_at` has passed the record is logically expired and is replaced,
/// never incremented. Field names are camelCase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRecord {
    pub count: u32,
    pub reset_at: u64,
}

/// Rate limit headers to include in HTTP responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset: u64,
    pub retry_after: Option<u32>,
}

impl RateLimitHeaders {
    /// Convert to an HTTP header map.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        // Numeric strings are always valid header values.
        if let Ok(value) = HeaderValue::from_str(&self.limit.to_string()) {
            headers.insert("X-RateLimit-Limit", value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.remaining.to_string()) {
            headers.insert("X-RateLimit-Remaining", value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.reset.to_string()) {
            headers.insert("X-RateLimit-Reset", value);
        }
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert("Retry-After", value);
            }
        }

        headers
    }
}

/// What to do with a client's stored record for one more request.
#[derive(Debug, PartialEq, Eq)]
enum QuotaOutcome {
    /// Write `record` back with the given TTL and admit the request.
    Admitted {
        record: QuotaRecord,
        ttl_seconds: u64,
    },
    /// Reject without touching the store.
    Denied { reset_at: u64 },
}

/// The window arithmetic of the quota check, separated from store access.
///
/// An absent record and an expired one are treated identically: the window
/// restarts at `count = 1` with a full TTL. Inside an open window the
/// write-back TTL is the time left until `reset_at`, so a write never
/// extends the window.
fn evaluate_record(
    existing: Option<QuotaRecord>,
    now: u64,
    limit: u32,
    window_seconds: u64,
) -> QuotaOutcome {
    match existing {
        Some(record) if now < record.reset_at => {
            if record.count >= limit {
                QuotaOutcome::Denied {
                    reset_at: record.reset_at,
                }
            } else {
                QuotaOutcome::Admitted {
                    record: QuotaRecord {
                        count: record.count + 1,
                        reset_at: record.reset_at,
                    },
                    ttl_seconds: record.reset_at - now,
                }
            }
        }
        _ => QuotaOutcome::Admitted {
            record: QuotaRecord {
                count: 1,
                reset_at: now + window_seconds,
            },
            ttl_seconds: window_seconds,
        },
    }
}

/// Reads and writes per-client [`QuotaRecord`]s in the quota store.
///
/// Connection setup and every store operation are bounded by the same
/// short timeout: a store that stops answering surfaces as a startup
/// error or as [`ErrorDetails::QuotaStoreUnavailable`] instead of
/// stalling the gateway.
#[derive(Clone)]
pub struct QuotaLimiter {
    connection: MultiplexedConnection,
    timeout_ms: u64,
}

impl std::fmt::Debug for QuotaLimiter {
    // Manual impl: `MultiplexedConnection` has no `Debug`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLimiter")
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

impl QuotaLimiter {
    pub async fn new(redis_url: &str, timeout_ms: u64) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid quota store URL: {e}"),
            })
        })?;
        let connection = match timeout(
            Duration::from_millis(timeout_ms),
            client.get_multiplexed_tokio_connection(),
        )
        .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!("Failed to connect to quota store: {e}"),
                }));
            }
            Err(_) => {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!(
                        "Failed to connect to quota store: timed out after {timeout_ms}ms"
                    ),
                }));
            }
        };
        tracing::info!("Connected to quota store");
        Ok(Self {
            connection,
            timeout_ms,
        })
    }

    /// Count one request against `client_id` and decide whether it is
    /// within quota.
    ///
    /// A denied request leaves the stored record untouched.
    pub async fn check(
        &self,
        client_id: &str,
        limit: u32,
        window_seconds: u64,
    ) -> Result<AdmissionDecision, Error> {
        let key = quota_key(client_id);
        let now = current_unix_timestamp();
        let mut conn = self.connection.clone();

        let data = match timeout(
            Duration::from_millis(self.timeout_ms),
            conn.get::<_, Option<String>>(&key),
        )
        .await
        {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                return Err(Error::new_without_logging(
                    ErrorDetails::QuotaStoreUnavailable {
                        message: format!("read failed: {e}"),
                    },
                ));
            }
            Err(_) => {
                return Err(Error::new_without_logging(
                    ErrorDetails::QuotaStoreUnavailable {
                        message: format!("read timed out after {}ms", self.timeout_ms),
                    },
                ));
            }
        };

        // A value that fails to parse is treated as absent, restarting the
        // client's window.
        let existing = data.and_then(|raw| serde_json::from_str::<QuotaRecord>(&raw).ok());

        match evaluate_record(existing, now, limit, window_seconds) {
            QuotaOutcome::Admitted {
                record,
                ttl_seconds,
            } => {
                self.write_record(&key, &record, ttl_seconds).await?;
                Ok(AdmissionDecision::Allow(Some(RateLimitHeaders {
                    limit,
                    remaining: limit.saturating_sub(record.count),
                    reset: record.reset_at,
                    retry_after: None,
                })))
            }
            QuotaOutcome::Denied { reset_at } => {
                Ok(AdmissionDecision::Deny(RateLimitHeaders {
                    limit,
                    remaining: 0,
                    reset: reset_at,
                    retry_after: Some(
                        u32::try_from(reset_at.saturating_sub(now)).unwrap_or(u32::MAX),
                    ),
                }))
            }
        }
    }

    async fn write_record(
        &self,
        key: &str,
        record: &QuotaRecord,
        ttl_seconds: u64,
    ) -> Result<(), Error> {
        let payload = serde_json::to_string(record).map_err(|e| {
            Error::new_without_logging(ErrorDetails::QuotaStoreUnavailable {
                message: format!("failed to serialize record: {e}"),
            })
        })?;
        let mut conn = self.connection.clone();

        match timeout(
            Duration::from_millis(self.timeout_ms),
            conn.set_ex::<_, _, ()>(key, payload, ttl_seconds),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::new_without_logging(
                ErrorDetails::QuotaStoreUnavailable {
                    message: format!("write failed: {e}"),
                },
            )),
            Err(_) => Err(Error::new_without_logging(
                ErrorDetails::QuotaStoreUnavailable {
                    message: format!("write timed out after {}ms", self.timeout_ms),
                },
            )),
        }
    }
}

/// In-process stand-ins for the store, for exercising connection and
/// failure behavior without a live server.
#[cfg(test)]
pub(crate) mod test_store {
    use std::net::SocketAddr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn bind() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    /// A bound port that never answers anything. Connections complete in
    /// the accept backlog, so the client sees an open socket that stays
    /// silent from the first byte.
    pub(crate) async fn unresponsive() -> SocketAddr {
        let (listener, addr) = bind().await;
        tokio::spawn(async move {
            let _listener = listener;
            std::future::pending::<()>().await;
        });
        addr
    }

    /// Answers the client's connection-setup commands, then never replies
    /// again once a data command arrives.
    pub(crate) async fn silent_after_setup() -> SocketAddr {
        let (listener, addr) = bind().await;
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve(socket, false));
            }
        });
        addr
    }

    /// A store with no data in it: setup commands and `SETEX` get `+OK`,
    /// `GET` answers nil.
    pub(crate) async fn empty() -> SocketAddr {
        let (listener, addr) = bind().await;
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve(socket, true));
            }
        });
        addr
    }

    async fn serve(mut socket: TcpStream, answer_data_commands: bool) {
        let mut buf = [0u8; 4096];
        let mut silent = false;
        loop {
            let Ok(n) = socket.read(&mut buf).await else {
                return;
            };
            if n == 0 {
                return;
            }
            let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
            let reply = if chunk.contains("SETEX") {
                "+OK\r\n".to_string()
            } else if chunk.contains("GET") {
                "$-1\r\n".to_string()
            } else {
                // One status reply per pipelined setup command.
                "+OK\r\n".repeat(chunk.matches('*').count())
            };
            let is_data_command = chunk.contains("SETEX") || chunk.contains("GET");
            if silent || (is_data_command && !answer_data_commands) {
                // Keep reading so the peer sees a live, mute connection.
                silent = true;
                continue;
            }
            if socket.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}
