//! The admission gate: decides, per request, whether it may reach the
//! upstream API. One implementation covers every deployment shape,
//! parameterized by the enforcement flag and the presence of a quota
//! store.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use crate::error::{Error, ErrorDetails};
use crate::origin::OriginPolicy;
use crate::quota::{QuotaLimiter, RateLimitHeaders};

/// The gate's verdict for one request. Never persisted; computed fresh
/// every time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// The request may proceed. Headers are present when quota state was
    /// consulted and `None` when it was not (admin bypass, enforcement
    /// off, or store degraded).
    Allow(Option<RateLimitHeaders>),
    /// The client is over quota for the current window.
    Deny(RateLimitHeaders),
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Allow(_))
    }

    pub fn headers(&self) -> Option<&RateLimitHeaders> {
        match self {
            AdmissionDecision::Allow(headers) => headers.as_ref(),
            AdmissionDecision::Deny(headers) => Some(headers),
        }
    }
}

#[derive(Debug)]
pub struct AdmissionGate {
    origin_policy: Arc<OriginPolicy>,
    admin_token: SecretString,
    limiter: Option<QuotaLimiter>,
    enforce_quota: bool,
}

impl AdmissionGate {
    pub fn new(
        origin_policy: Arc<OriginPolicy>,
        admin_token: SecretString,
        limiter: Option<QuotaLimiter>,
        enforce_quota: bool,
    ) -> Self {
        Self {
            origin_policy,
            admin_token,
            limiter,
            enforce_quota,
        }
    }

    /// Evaluate one request.
    ///
    /// The order is fixed: origin check first (pure, independent of quota
    /// state), then the admin bypass (before any store access, so it
    /// stays usable when the store is down), then the quota itself. Store
    /// failures degrade to [`AdmissionDecision::Allow`]; quota
    /// enforcement is best-effort and never takes the relay down with it.
    pub async fn evaluate(
        &self,
        request_origin: Option<&str>,
        client_id: &str,
        supplied_admin_token: Option<&str>,
        limit: u32,
        window_seconds: u64,
    ) -> Result<AdmissionDecision, Error> {
        match request_origin {
            Some(origin) if self.origin_policy.is_allowed(origin) => {}
            _ => return Err(Error::new(ErrorDetails::OriginRejected)),
        }

        if let Some(token) = supplied_admin_token {
            if token == self.admin_token.expose_secret() {
                tracing::debug!(client_id, "Admin token accepted, bypassing quota");
                return Ok(AdmissionDecision::Allow(None));
            }
        }

        if !self.enforce_quota {
            return Ok(AdmissionDecision::Allow(None));
        }
        let Some(limiter) = &self.limiter else {
            return Ok(AdmissionDecision::Allow(None));
        };

        match limiter.check(client_id, limit, window_seconds).await {
            Ok(decision) => Ok(decision),
            Err(e) => {
                warn!(client_id, "{e}; allowing request without a quota check");
                Ok(AdmissionDecision::Allow(None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::test_store;
    use tracing_test::traced_test;

    const ADMIN_TOKEN: &str = "0123456789abcdef";

    fn gate(enforce_quota: bool) -> AdmissionGate {
        AdmissionGate::new(
            Arc::new(OriginPolicy::new(vec![
                "https://app.example.com".to_string()
            ])),
            SecretString::from(ADMIN_TOKEN.to_string()),
            None,
            enforce_quota,
        )
    }

    #[tokio::test]
    async fn test_missing_origin_is_rejected() {
        let err = gate(false)
            .evaluate(None, "1.2.3.4", None, 50, 86400)
            .await
            .unwrap_err();
        assert_eq!(err.get_details(), &ErrorDetails::OriginRejected);
    }

    #[tokio::test]
    async fn test_empty_origin_is_rejected() {
        let err = gate(false)
            .evaluate(Some(""), "1.2.3.4", None, 50, 86400)
            .await
            .unwrap_err();
        assert_eq!(err.get_details(), &ErrorDetails::OriginRejected);
    }

    #[tokio::test]
    async fn test_admin_token_does_not_override_origin_check() {
        let err = gate(false)
            .evaluate(
                Some("https://evil.example.com"),
                "1.2.3.4",
                Some(ADMIN_TOKEN),
                50,
                86400,
            )
            .await
            .unwrap_err();
        assert_eq!(err.get_details(), &ErrorDetails::OriginRejected);
    }

    #[tokio::test]
    async fn test_admin_token_bypasses_quota() {
        let decision = gate(true)
            .evaluate(
                Some("https://app.example.com"),
                "1.2.3.4",
                Some(ADMIN_TOKEN),
                50,
                86400,
            )
            .await
            .unwrap();
        assert_eq!(decision, AdmissionDecision::Allow(None));
    }

    #[tokio::test]
    async fn test_wrong_admin_token_is_not_a_bypass() {
        // With enforcement off the request is still allowed, but through
        // the normal path rather than the bypass.
        let decision = gate(false)
            .evaluate(
                Some("https://app.example.com"),
                "1.2.3.4",
                Some("not-the-token"),
                50,
                86400,
            )
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_enforcement_off_allows_without_quota_state() {
        let decision = gate(false)
            .evaluate(Some("http://localhost:3000"), "1.2.3.4", None, 50, 86400)
            .await
            .unwrap();
        assert_eq!(decision, AdmissionDecision::Allow(None));
    }

    #[tokio::test]
    async fn test_enforcement_without_store_allows() {
        let decision = gate(true)
            .evaluate(Some("http://localhost:3000"), "1.2.3.4", None, 50, 86400)
            .await
            .unwrap();
        assert_eq!(decision, AdmissionDecision::Allow(None));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_store_failure_fails_open_with_a_warning() {
        // The store completes the connection handshake, then stops
        // answering. The gate must admit the request anyway and say so.
        let addr = test_store::silent_after_setup().await;
        let limiter = QuotaLimiter::new(&format!("redis://{addr}"), 200)
            .await
            .unwrap();
        let gate = AdmissionGate::new(
            Arc::new(OriginPolicy::new(vec![
                "https://app.example.com".to_string()
            ])),
            SecretString::from(ADMIN_TOKEN.to_string()),
            Some(limiter),
            true,
        );

        let decision = gate
            .evaluate(Some("https://app.example.com"), "1.2.3.4", None, 50, 86400)
            .await
            .unwrap();

        assert_eq!(decision, AdmissionDecision::Allow(None));
        assert!(logs_contain("allowing request without a quota check"));
    }

    #[test]
    fn test_decision_accessors() {
        let headers = RateLimitHeaders {
            limit: 50,
            remaining: 0,
            reset: 1_700_000_000,
            retry_after: Some(60),
        };
        let deny = AdmissionDecision::Deny(headers.clone());
        assert!(!deny.is_allowed());
        assert_eq!(deny.headers(), Some(&headers));

        let allow = AdmissionDecision::Allow(None);
        assert!(allow.is_allowed());
        assert!(allow.headers().is_none());
    }
}
