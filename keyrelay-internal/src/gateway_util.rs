//! Shared application state for the gateway.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::{info, warn};

use crate::admission::AdmissionGate;
use crate::config::Config;
use crate::error::{Error, ErrorDetails};
use crate::origin::OriginPolicy;
use crate::quota::QuotaLimiter;

/// Overall cap on any outbound HTTP request. Individual relay calls set
/// their own, shorter timeout from the configuration.
pub const DEFAULT_HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// State shared by all request handlers.
#[derive(Clone, Debug)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub http_client: Client,
    pub origin_policy: Arc<OriginPolicy>,
    pub gate: Arc<AdmissionGate>,
}

pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    /// Wire up the shared state: origin policy, quota limiter (only when
    /// enforcement is on), the admission gate, and the outbound client.
    pub async fn new(config: Config) -> Result<Self, Error> {
        let origin_policy = Arc::new(OriginPolicy::new(config.allowed_origins.clone()));

        let limiter = if config.quota.enforce {
            match &config.quota.redis_url {
                Some(redis_url) => {
                    let limiter =
                        QuotaLimiter::new(redis_url, config.quota.redis_timeout_ms).await?;
                    info!(
                        limit = config.quota.limit,
                        window_seconds = config.quota.window_seconds,
                        "Quota enforcement enabled"
                    );
                    Some(limiter)
                }
                // Unreachable through Config::load; guards direct
                // construction.
                None => {
                    return Err(Error::new(ErrorDetails::Config {
                        message: "[quota] enforce = true requires [quota] redis_url".to_string(),
                    }));
                }
            }
        } else {
            warn!("Quota enforcement is disabled; requests are not counted per client");
            None
        };

        let gate = Arc::new(AdmissionGate::new(
            origin_policy.clone(),
            config.admin_token.clone(),
            limiter,
            config.quota.enforce,
        ));

        let http_client = setup_http_client()?;

        Ok(Self {
            config: Arc::new(config),
            http_client,
            origin_policy,
            gate,
        })
    }
}

pub fn setup_http_client() -> Result<Client, Error> {
    Client::builder()
        .timeout(DEFAULT_HTTP_CLIENT_TIMEOUT)
        .build()
        .map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to build outbound HTTP client: {e}"),
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        EnvOverrides, FileConfig, GatewayConfig, QuotaConfig, UpstreamConfig,
    };
    use secrecy::SecretString;
    use tracing_test::traced_test;

    fn test_config() -> Config {
        let env = EnvOverrides {
            upstream_api_key: Some("sk-test-key".to_string()),
            admin_token: Some("0123456789abcdef".to_string()),
            allowed_origins: None,
        };
        Config::from_parts(FileConfig::default(), env).unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn test_state_without_enforcement() {
        let state = AppStateData::new(test_config()).await.unwrap();
        assert!(!state.config.quota.enforce);
        assert!(logs_contain("Quota enforcement is disabled"));
    }

    #[tokio::test]
    async fn test_enforcement_without_store_url_is_rejected() {
        let mut config = test_config();
        config.quota = QuotaConfig {
            enforce: true,
            redis_url: None,
            ..QuotaConfig::default()
        };
        let err = AppStateData::new(config).await.unwrap_err();
        assert!(err.to_string().contains("redis_url"));
    }

    #[tokio::test]
    async fn test_state_shares_one_origin_policy() {
        let mut config = test_config();
        config.allowed_origins = vec!["https://app.example.com".to_string()];
        let state = AppStateData::new(config).await.unwrap();
        assert!(state.origin_policy.is_allowed("https://app.example.com"));
        assert!(!state.origin_policy.is_allowed("https://evil.example.com"));
    }

    #[test]
    fn test_setup_http_client() {
        assert!(setup_http_client().is_ok());
    }

    #[test]
    fn test_config_sections_construct_directly() {
        // Handlers and tests build partial configs; the section types stay
        // independently constructible.
        let config = Config {
            gateway: GatewayConfig::default(),
            upstream: UpstreamConfig::default(),
            quota: QuotaConfig::default(),
            allowed_origins: Vec::new(),
            upstream_api_key: SecretString::from("sk-test-key".to_string()),
            admin_token: SecretString::from("0123456789abcdef".to_string()),
        };
        assert_eq!(config.upstream.credential_header, "x-api-key");
    }
}
