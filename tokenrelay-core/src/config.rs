//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::credentials::{DEFAULT_KEY_PREFIX, DEFAULT_PROACTIVE_MARGIN_SECS};
use crate::error::ClientError;

/// Settings for an [`ApiClient`](crate::ApiClient).
///
/// Every field has a default, so a partial TOML table is enough:
///
/// ```
/// use tokenrelay_core::ClientConfig;
///
/// let config: ClientConfig = toml::from_str(r#"
///     base_url = "https://api.example.com"
///     refresh_timeout_secs = 10
/// "#).unwrap();
///
/// assert_eq!(config.refresh_path, "/token/refresh");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relative request paths are joined onto this URL.
    pub base_url: Url,

    /// Path of the token-refresh endpoint.
    pub refresh_path: String,

    /// Path of the sign-in endpoint.
    pub login_path: String,

    /// URL path substrings whose 401 responses never trigger a refresh.
    ///
    /// `refresh_path` is always excluded in addition to these.
    pub excluded_endpoints: Vec<String>,

    /// Deadline for the refresh call.
    pub refresh_timeout_secs: u64,

    /// Deadline for every other request.
    pub request_timeout_secs: u64,

    /// Refresh before dispatch when the access token is about to expire.
    pub proactive_refresh: bool,

    /// How long before expiry a token counts as about to expire.
    pub proactive_margin_secs: i64,

    /// Send the current access token to the refresh endpoint.
    pub send_access_token_on_refresh: bool,

    /// Namespace for credential keys in the secret store.
    pub key_prefix: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://localhost:8080").expect("static URL is valid"),
            refresh_path: "/token/refresh".to_string(),
            login_path: "/auth/login".to_string(),
            excluded_endpoints: default_excluded_endpoints(),
            refresh_timeout_secs: 30,
            request_timeout_secs: 30,
            proactive_refresh: false,
            proactive_margin_secs: DEFAULT_PROACTIVE_MARGIN_SECS,
            send_access_token_on_refresh: true,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

fn default_excluded_endpoints() -> Vec<String> {
    ["login", "signup", "refresh", "reset-password", "forgot-password"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl ClientConfig {
    /// Config pointing at `base_url` with every other field defaulted.
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            ..Self::default()
        }
    }

    /// Resolve `target` against [`base_url`](Self::base_url).
    ///
    /// Absolute URLs are returned as-is.
    pub fn resolve(&self, target: &str) -> Result<String, ClientError> {
        if let Ok(url) = Url::parse(target) {
            return Ok(url.into());
        }
        self.base_url
            .join(target)
            .map(String::from)
            .map_err(|e| ClientError::InvalidRequest {
                message: format!("cannot resolve {:?} against {}: {}", target, self.base_url, e),
            })
    }

    pub fn refresh_url(&self) -> Result<String, ClientError> {
        self.resolve(&self.refresh_path)
    }

    pub fn login_url(&self) -> Result<String, ClientError> {
        self.resolve(&self.login_path)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn proactive_margin(&self) -> Result<chrono::Duration, ClientError> {
        chrono::Duration::try_seconds(self.proactive_margin_secs).ok_or_else(|| {
            ClientError::InvalidRequest {
                message: format!(
                    "proactive_margin_secs {} is out of range",
                    self.proactive_margin_secs
                ),
            }
        })
    }

    /// Excluded endpoints plus the refresh endpoint itself.
    pub fn refresh_exclusions(&self) -> Vec<String> {
        let mut exclusions = self.excluded_endpoints.clone();
        if !exclusions.contains(&self.refresh_path) {
            exclusions.push(self.refresh_path.clone());
        }
        exclusions
    }
}
