//! Origin validation for the admission gate.

/// Development hosts trusted by substring match, so any scheme and port
/// combination of a local frontend passes without configuration.
const DEV_ORIGIN_PATTERNS: &[&str] = &["localhost", "127.0.0.1"];

/// Hosting domain trusted by suffix match, covering every deployment of
/// the static frontend without enumerating preview URLs.
const TRUSTED_HOSTING_SUFFIX: &str = ".pages.dev";

/// The process-wide origin policy: built-in development patterns, the
/// built-in hosting suffix, and an exact-match allow-list from
/// configuration. Immutable once constructed and read on every request.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed_origins: Vec<String>,
}

impl OriginPolicy {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self { allowed_origins }
    }

    /// Whether `origin` may use the relay.
    ///
    /// Pure: no side effects, same answer for the same input on every
    /// call. Matching is substring for the development patterns, suffix
    /// for the hosting domain, and exact string for the allow-list. An
    /// empty origin never matches.
    pub fn is_allowed(&self, origin: &str) -> bool {
        if origin.is_empty() {
            return false;
        }
        if DEV_ORIGIN_PATTERNS
            .iter()
            .any(|pattern| origin.contains(pattern))
        {
            return true;
        }
        if origin.ends_with(TRUSTED_HOSTING_SUFFIX) {
            return true;
        }
        self.allowed_origins.iter().any(|allowed| allowed == origin)
    }
}
