//! Gateway configuration.
//!
//! Structural settings come from an optional TOML file; secrets and
//! operator overrides come from the environment. Every file field has a
//! default, so a bare deployment only needs the two secret variables.

use std::net::SocketAddr;
use std::path::Path;

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

use crate::error::{Error, ErrorDetails};

pub const ENV_UPSTREAM_API_KEY: &str = "KEYRELAY_UPSTREAM_API_KEY";
pub const ENV_ADMIN_TOKEN: &str = "KEYRELAY_ADMIN_TOKEN";
pub const ENV_ALLOWED_ORIGINS: &str = "KEYRELAY_ALLOWED_ORIGINS";

/// Shortest admin token accepted at startup. There is no built-in
/// fallback secret; a deployment without a real token refuses to boot.
pub const MIN_ADMIN_TOKEN_LEN: usize = 16;

/// The validated runtime configuration.
///
/// Both secrets are held as [`SecretString`] and never appear in logs or
/// client responses.
#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub upstream: UpstreamConfig,
    pub quota: QuotaConfig,
    /// Exact-match origin allow-list: the TOML `[origins] allowed` list
    /// plus the comma-separated `KEYRELAY_ALLOWED_ORIGINS` entries.
    pub allowed_origins: Vec<String>,
    pub upstream_api_key: SecretString,
    pub admin_token: SecretString,
}

/// The TOML file as written on disk, before env merge and validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub origins: OriginsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// The single endpoint every admitted request is forwarded to. The
    /// inbound path plays no part in routing.
    #[serde(default = "default_upstream_url")]
    pub url: Url,
    /// Header name the upstream credential is sent under.
    #[serde(default = "default_credential_header")]
    pub credential_header: String,
    #[serde(default = "default_upstream_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[expect(clippy::unwrap_used)]
fn default_upstream_url() -> Url {
    // The literal is a valid URL.
    Url::parse("https://api.anthropic.com/v1/messages").unwrap()
}

fn default_credential_header() -> String {
    "x-api-key".to_string()
}

fn default_upstream_timeout_seconds() -> u64 {
    30
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            credential_header: default_credential_header(),
            timeout_seconds: default_upstream_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    /// Whether per-client quotas are enforced at all. Off by default so
    /// the availability/enforcement trade-off is an explicit operator
    /// choice rather than a side effect of wiring up a store.
    #[serde(default)]
    pub enforce: bool,
    #[serde(default = "default_quota_limit")]
    pub limit: u32,
    #[serde(default = "default_quota_window_seconds")]
    pub window_seconds: u64,
    /// Required when `enforce` is set.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_redis_timeout_ms")]
    pub redis_timeout_ms: u64,
}

fn default_quota_limit() -> u32 {
    50
}

fn default_quota_window_seconds() -> u64 {
    86400
}

fn default_redis_timeout_ms() -> u64 {
    500
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enforce: false,
            limit: default_quota_limit(),
            window_seconds: default_quota_window_seconds(),
            redis_url: None,
            redis_timeout_ms: default_redis_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OriginsConfig {
    #[serde(default)]
    pub allowed: Vec<String>,
}

/// Values gathered from the process environment, separated from the merge
/// logic so tests never have to mutate real env vars. Not `Debug`: two of
/// the fields hold secrets in the clear.
#[derive(Default)]
pub struct EnvOverrides {
    pub upstream_api_key: Option<String>,
    pub admin_token: Option<String>,
    pub allowed_origins: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            upstream_api_key: std::env::var(ENV_UPSTREAM_API_KEY).ok(),
            admin_token: std::env::var(ENV_ADMIN_TOKEN).ok(),
            allowed_origins: std::env::var(ENV_ALLOWED_ORIGINS).ok(),
        }
    }
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file {}: {e}", path.display()),
            })
        })?;
        toml::from_str::<FileConfig>(&contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file {}: {e}", path.display()),
            })
        })
    }
}

impl Config {
    /// Read the optional config file, merge the environment, validate.
    pub fn load(config_path: Option<&Path>) -> Result<Self, Error> {
        let file = match config_path {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        Self::from_parts(file, EnvOverrides::from_env())
    }

    /// Merge file and environment configuration and validate the result.
    pub fn from_parts(file: FileConfig, env: EnvOverrides) -> Result<Self, Error> {
        let upstream_api_key = env
            .upstream_api_key
            .filter(|value| !value.is_empty())
            .map(SecretString::from)
            .ok_or_else(|| {
                Error::new(ErrorDetails::Config {
                    message: format!("{ENV_UPSTREAM_API_KEY} must be set"),
                })
            })?;

        let admin_token = match env.admin_token {
            Some(token) if token.len() >= MIN_ADMIN_TOKEN_LEN => SecretString::from(token),
            Some(_) => {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!(
                        "{ENV_ADMIN_TOKEN} must be at least {MIN_ADMIN_TOKEN_LEN} characters"
                    ),
                }));
            }
            None => {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!(
                        "{ENV_ADMIN_TOKEN} must be set; there is no built-in admin secret"
                    ),
                }));
            }
        };

        let mut allowed_origins = file.origins.allowed;
        if let Some(extra) = env.allowed_origins {
            allowed_origins.extend(
                extra
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(String::from),
            );
        }

        if http::HeaderName::try_from(file.upstream.credential_header.as_str()).is_err() {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "[upstream] credential_header {:?} is not a valid header name",
                    file.upstream.credential_header
                ),
            }));
        }

        if file.quota.enforce && file.quota.redis_url.is_none() {
            return Err(Error::new(ErrorDetails::Config {
                message: "[quota] enforce = true requires [quota] redis_url".to_string(),
            }));
        }
        if file.quota.limit == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "[quota] limit must be positive".to_string(),
            }));
        }
        if file.quota.window_seconds == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "[quota] window_seconds must be positive".to_string(),
            }));
        }

        Ok(Config {
            gateway: file.gateway,
            upstream: file.upstream,
            quota: file.quota,
            allowed_origins,
            upstream_api_key,
            admin_token,
        })
    }
}
