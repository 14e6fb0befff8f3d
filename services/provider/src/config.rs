//! Provider configuration.
//!
//! Resolves the auth token and endpoint the provider talks to. Precedence is
//! explicit configuration value, then environment variable, then the
//! built-in default. A value that is declared but not yet known is an error:
//! the provider never builds a client from a partially resolved setting.

use std::fmt;
use std::time::Duration;

use reqwest::Url;
use serde::de::{Deserializer, Error as _};
use serde::Deserialize;
use thiserror::Error;

use crate::diagnostics::{AttributePath, Diagnostic, Diagnostics};
use crate::error::ErrorKind;

/// Environment variable consulted when `endpoint` is not configured.
pub const ENDPOINT_ENV: &str = "FLINTLOCK_ENDPOINT";

/// Environment variable consulted when `authtoken` is not configured.
pub const AUTHTOKEN_ENV: &str = "FLINTLOCK_AUTHTOKEN";

/// Dial target used when neither configuration nor environment name one.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:9090";

/// Per-call deadline for control plane requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors building the client side of the session.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("HTTP client construction failed: {0}")]
    Client(#[from] reqwest::Error),
}

impl ConfigError {
    /// Every configuration error is the user's to fix; none is retried.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// A declared value that may be absent, not yet known, or set.
///
/// `Null` and `Value(0)` are different things: defaults only ever replace
/// `Null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Configured<T> {
    /// Not declared.
    Null,
    /// Declared, but its value is not resolved yet.
    Unknown,
    /// Declared with this value.
    Value(T),
}

impl<T> Configured<T> {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl<T> Default for Configured<T> {
    fn default() -> Self {
        Self::Null
    }
}

impl<T> From<T> for Configured<T> {
    fn from(value: T) -> Self {
        Self::Value(value)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UnknownMarker {
    unknown: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConfiguredRepr<T> {
    Unknown(UnknownMarker),
    Value(T),
}

// Missing and `null` are Null, `{"unknown": true}` is Unknown, anything else
// is a value.
impl<'de, T> Deserialize<'de> for Configured<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<ConfiguredRepr<T>>::deserialize(deserializer)? {
            None => Ok(Self::Null),
            Some(ConfiguredRepr::Unknown(UnknownMarker { unknown: true })) => Ok(Self::Unknown),
            Some(ConfiguredRepr::Unknown(_)) => {
                Err(D::Error::custom("the `unknown` marker must be `true`"))
            }
            Some(ConfiguredRepr::Value(value)) => Ok(Self::Value(value)),
        }
    }
}

/// Authentication token. Never printed.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for building request headers only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken(<redacted>)")
    }
}

impl fmt::Display for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted>")
    }
}

/// Declared provider configuration block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default)]
    pub authtoken: Configured<AuthToken>,

    #[serde(default)]
    pub endpoint: Configured<String>,
}

/// Resolved client settings, shared read-only by every reconciliation in a
/// session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    endpoint: Url,
    auth_token: Option<AuthToken>,
    request_timeout: Duration,
}

impl ClientConfig {
    /// Build a client config directly, bypassing the declared-config layer.
    pub fn new(endpoint: &str, auth_token: Option<AuthToken>) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: parse_endpoint(endpoint)?,
            auth_token,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Resolve the declared configuration against the process environment.
    pub fn from_env(config: &ProviderConfig) -> Result<Self, Diagnostics> {
        Self::resolve(config, |name| std::env::var(name).ok())
    }

    /// Resolve the declared configuration, looking variables up with `env`.
    ///
    /// Returns every problem found rather than stopping at the first.
    pub fn resolve<F>(config: &ProviderConfig, env: F) -> Result<Self, Diagnostics>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut diagnostics = Diagnostics::new();

        if config.authtoken.is_unknown() {
            diagnostics.append(
                Diagnostic::error(
                    "Unknown Flintlock API AuthToken",
                    format!(
                        "The provider cannot create the Flintlock API client as there is an unknown \
                         configuration value for the Flintlock API auth token. Either apply the source \
                         of the value first, set the value statically in the configuration, or use \
                         the `{AUTHTOKEN_ENV}` environment variable."
                    ),
                )
                .at(AttributePath::root("authtoken")),
            );
        }
        if config.endpoint.is_unknown() {
            diagnostics.append(
                Diagnostic::error(
                    "Unknown Flintlock API Endpoint",
                    format!(
                        "The provider cannot create the Flintlock API client as there is an unknown \
                         configuration value for the Flintlock API endpoint. Either apply the source \
                         of the value first, set the value statically in the configuration, or use \
                         the `{ENDPOINT_ENV}` environment variable."
                    ),
                )
                .at(AttributePath::root("endpoint")),
            );
        }
        if diagnostics.has_error() {
            return Err(diagnostics);
        }

        let env_value = |name: &str| env(name).filter(|v| !v.is_empty());

        let auth_token = match &config.authtoken {
            Configured::Value(token) if token.expose().is_empty() => None,
            Configured::Value(token) => Some(token.clone()),
            _ => env_value(AUTHTOKEN_ENV).map(AuthToken::new),
        };

        // An explicit empty endpoint means "use the default", not "use the environment".
        let endpoint = match &config.endpoint {
            Configured::Value(endpoint) if endpoint.is_empty() => DEFAULT_ENDPOINT.to_string(),
            Configured::Value(endpoint) => endpoint.clone(),
            _ => env_value(ENDPOINT_ENV).unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        };

        match Self::new(&endpoint, auth_token) {
            Ok(config) => Ok(config),
            Err(e) => {
                diagnostics.append(
                    Diagnostic::error(
                        "Invalid Flintlock API Endpoint",
                        format!(
                            "The provider cannot create the Flintlock API client. Please check the \
                             configuration and try again. Received error: {e}"
                        ),
                    )
                    .at(AttributePath::root("endpoint")),
                );
                Err(diagnostics)
            }
        }
    }

    /// Override the per-call deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn auth_token(&self) -> Option<&AuthToken> {
        self.auth_token.as_ref()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

/// Parse an endpoint, accepting bare `host:port` dial targets.
fn parse_endpoint(endpoint: &str) -> Result<Url, ConfigError> {
    let trimmed = endpoint.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    let invalid = |reason: String| ConfigError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };

    let url = Url::parse(&candidate).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_explicit_endpoint_wins_over_env() {
        let config = ProviderConfig {
            endpoint: Configured::Value("http://explicit:9090".to_string()),
            ..Default::default()
        };
        let resolved =
            ClientConfig::resolve(&config, env_of(&[(ENDPOINT_ENV, "http://env:9090")])).unwrap();
        assert_eq!(resolved.endpoint().host_str(), Some("explicit"));
    }

    #[test]
    fn test_env_endpoint_used_when_unset() {
        let resolved = ClientConfig::resolve(
            &ProviderConfig::default(),
            env_of(&[(ENDPOINT_ENV, "http://env:9090")]),
        )
        .unwrap();
        assert_eq!(resolved.endpoint().host_str(), Some("env"));
    }

    #[test]
    fn test_default_endpoint_when_nothing_set() {
        let resolved = ClientConfig::resolve(&ProviderConfig::default(), env_of(&[])).unwrap();
        assert_eq!(resolved.endpoint().as_str(), "http://127.0.0.1:9090/");
        assert!(resolved.auth_token().is_none());
        assert_eq!(resolved.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_empty_env_counts_as_unset() {
        let resolved = ClientConfig::resolve(
            &ProviderConfig::default(),
            env_of(&[(ENDPOINT_ENV, ""), (AUTHTOKEN_ENV, "")]),
        )
        .unwrap();
        assert_eq!(resolved.endpoint().host_str(), Some("127.0.0.1"));
        assert!(resolved.auth_token().is_none());
    }

    #[test]
    fn test_explicit_empty_endpoint_falls_back_to_default() {
        let config = ProviderConfig {
            endpoint: Configured::Value(String::new()),
            ..Default::default()
        };
        let resolved =
            ClientConfig::resolve(&config, env_of(&[(ENDPOINT_ENV, "http://env:9090")])).unwrap();
        assert_eq!(resolved.endpoint().host_str(), Some("127.0.0.1"));
    }

    #[test]
    fn test_token_precedence() {
        let config = ProviderConfig {
            authtoken: Configured::Value(AuthToken::new("explicit")),
            ..Default::default()
        };
        let resolved =
            ClientConfig::resolve(&config, env_of(&[(AUTHTOKEN_ENV, "from-env")])).unwrap();
        assert_eq!(resolved.auth_token().unwrap().expose(), "explicit");

        let resolved = ClientConfig::resolve(
            &ProviderConfig::default(),
            env_of(&[(AUTHTOKEN_ENV, "from-env")]),
        )
        .unwrap();
        assert_eq!(resolved.auth_token().unwrap().expose(), "from-env");
    }

    #[test]
    fn test_unknown_values_are_errors() {
        let config = ProviderConfig {
            authtoken: Configured::Unknown,
            endpoint: Configured::Unknown,
        };
        let diags = ClientConfig::resolve(
            &config,
            env_of(&[(ENDPOINT_ENV, "http://env:9090"), (AUTHTOKEN_ENV, "t")]),
        )
        .unwrap_err();

        assert_eq!(diags.len(), 2);
        assert!(diags.has_error());
        let paths: Vec<_> = diags
            .all()
            .iter()
            .map(|d| d.path().unwrap().to_string())
            .collect();
        assert_eq!(paths, vec!["authtoken", "endpoint"]);
    }

    #[test]
    fn test_invalid_endpoint_is_error() {
        let config = ProviderConfig {
            endpoint: Configured::Value("ftp://host".to_string()),
            ..Default::default()
        };
        let diags = ClientConfig::resolve(&config, env_of(&[])).unwrap_err();
        assert_eq!(diags.all()[0].summary(), "Invalid Flintlock API Endpoint");
    }

    #[test]
    fn test_config_error_kind() {
        let err = parse_endpoint("ftp://host").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.kind().is_retryable());
    }

    #[test]
    fn test_bare_dial_target_gets_scheme() {
        let url = parse_endpoint("flintlock.local:9090").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.port(), Some(9090));

        let url = parse_endpoint("https://flintlock.local").unwrap();
        assert_eq!(url.scheme(), "https");
    }

    #[test]
    fn test_token_is_redacted() {
        let config = ProviderConfig {
            authtoken: Configured::Value(AuthToken::new("s3cret")),
            ..Default::default()
        };
        let resolved = ClientConfig::resolve(&config, env_of(&[])).unwrap();
        assert!(!format!("{resolved:?}").contains("s3cret"));
        assert!(!format!("{config:?}").contains("s3cret"));
    }

    #[test]
    fn test_configured_deserialization() {
        let config: ProviderConfig =
            serde_json::from_str(r#"{"authtoken": null, "endpoint": {"unknown": true}}"#).unwrap();
        assert!(config.authtoken.is_null());
        assert!(config.endpoint.is_unknown());

        let config: ProviderConfig = serde_json::from_str(r#"{"endpoint": ""}"#).unwrap();
        assert_eq!(config.endpoint, Configured::Value(String::new()));
        assert!(config.authtoken.is_null());

        assert!(serde_json::from_str::<ProviderConfig>(r#"{"endpoint": {"unknown": false}}"#)
            .is_err());
    }
}
