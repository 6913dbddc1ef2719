//! Configuration for the Sluice gateway.
//!
//! Service settings are loaded in priority order:
//! 1. Environment variables prefixed with `SLUICE_` (highest priority)
//! 2. Configuration file (`sluice.toml`)
//! 3. Built-in defaults (lowest priority)
//!
//! Webhook sources live under the `webhooks` table, keyed by source name.
//! Source entries use the camelCase keys providers document, e.g.
//!
//! ```toml
//! [webhooks.gitlab-push]
//! provider = "gitlab"
//! endpoint = "/push"
//! port = "12000"
//! method = "POST"
//! url = "https://hooks.example.com"
//! projectId = "1001"
//! accessToken = { name = "gitlab-access", key = "accesskey" }
//! ```

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use axum::http::Method;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use sluice_core::{IngestError, SecretRef, SourceKind};

use crate::retry::{BackoffStrategy, RetryPolicy};

const CONFIG_FILE: &str = "sluice.toml";

const ALLOWED_METHODS: [Method; 5] =
    [Method::POST, Method::PUT, Method::PATCH, Method::GET, Method::DELETE];

/// Complete service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address every webhook port binds on.
    ///
    /// Environment variable: `SLUICE_HOST`
    #[serde(default = "default_host")]
    pub host: String,
    /// Upper bound on draining all listeners at shutdown, in seconds.
    ///
    /// Environment variable: `SLUICE_DRAIN_TIMEOUT_SECS`
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    // Registration
    /// Attempts per provider hook registration before the source is marked
    /// degraded.
    ///
    /// Environment variable: `SLUICE_REGISTRATION_MAX_ATTEMPTS`
    #[serde(default = "default_registration_attempts")]
    pub registration_max_attempts: u32,
    /// Base delay for registration backoff in milliseconds.
    ///
    /// Environment variable: `SLUICE_REGISTRATION_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms")]
    pub registration_base_delay_ms: u64,
    /// Maximum delay between registration attempts in milliseconds.
    ///
    /// Environment variable: `SLUICE_REGISTRATION_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms")]
    pub registration_max_delay_ms: u64,

    /// Directory holding mounted secrets as `<name>/<key>` files.
    ///
    /// Environment variable: `SLUICE_SECRETS_DIR`
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: PathBuf,

    /// Log filter used when `RUST_LOG` is unset.
    ///
    /// Environment variable: `SLUICE_RUST_LOG`
    #[serde(default = "default_log_level")]
    pub rust_log: String,

    /// Webhook sources by name.
    #[serde(default)]
    pub webhooks: BTreeMap<String, WebhookSourceConfig>,
}

impl Config {
    /// Loads configuration from defaults, `sluice.toml`, and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Loads configuration using `path` as the configuration file.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SLUICE_"));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Drain timeout as a duration.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Retry policy for provider hook registration.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.registration_max_attempts,
            base_delay: Duration::from_millis(self.registration_base_delay_ms),
            max_delay: Duration::from_millis(self.registration_max_delay_ms),
            jitter_factor: 0.1,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.drain_timeout_secs == 0 {
            anyhow::bail!("drain_timeout_secs must be greater than 0");
        }

        if self.registration_max_attempts == 0 {
            anyhow::bail!("registration_max_attempts must be greater than 0");
        }

        if self.registration_base_delay_ms > self.registration_max_delay_ms {
            anyhow::bail!("registration_base_delay_ms cannot exceed registration_max_delay_ms");
        }

        if self.host.trim().is_empty() {
            anyhow::bail!("host must not be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            drain_timeout_secs: default_drain_timeout(),
            registration_max_attempts: default_registration_attempts(),
            registration_base_delay_ms: default_base_delay_ms(),
            registration_max_delay_ms: default_max_delay_ms(),
            secrets_dir: default_secrets_dir(),
            rust_log: default_log_level(),
            webhooks: BTreeMap::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_registration_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_secrets_dir() -> PathBuf {
    PathBuf::from("/etc/sluice/secrets")
}

fn default_log_level() -> String {
    "info,sluice=debug".to_string()
}

fn default_method() -> String {
    "POST".to_string()
}

/// A value providers write either as a number or as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    /// Numeric form.
    Number(i64),
    /// String form.
    Text(String),
}

impl NumberOrString {
    fn as_text(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.trim().to_string(),
        }
    }

    fn to_port(&self) -> std::result::Result<u16, String> {
        let text = self.as_text();
        match text.parse::<u16>() {
            Ok(0) | Err(_) => Err(format!("port must be between 1 and 65535, got '{text}'")),
            Ok(port) => Ok(port),
        }
    }
}

impl From<u16> for NumberOrString {
    fn from(port: u16) -> Self {
        Self::Number(i64::from(port))
    }
}

/// One webhook source as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSourceConfig {
    /// URL path the listener serves, e.g. `/push`.
    pub endpoint: String,
    /// Port to listen on; string or integer.
    pub port: NumberOrString,
    /// The single HTTP method accepted.
    #[serde(default = "default_method")]
    pub method: String,
    /// Public base URL providers call back on; used for registration.
    #[serde(default)]
    pub url: Option<String>,
    /// PEM certificate chain for TLS.
    #[serde(default)]
    pub server_cert_path: Option<PathBuf>,
    /// PEM private key for TLS.
    #[serde(default)]
    pub server_key_path: Option<PathBuf>,
    /// PEM CA bundle used to verify client certificates.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// Require verified TLS on this listener.
    #[serde(default, rename = "enableSSLVerification")]
    pub enable_ssl_verification: bool,
    /// Shared secret the provider presents on every call.
    pub access_token: SecretRef,
    /// Provider-specific settings.
    #[serde(flatten)]
    pub provider: ProviderConfig,
}

/// Provider discriminator and its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// GitLab project hook.
    Gitlab(GitlabOptions),
    /// GitHub repository hook.
    Github(GithubOptions),
    /// Generic bearer-authenticated webhook.
    Webhook,
}

/// GitLab hook settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitlabOptions {
    /// Project id or `namespace/project` path.
    #[serde(default)]
    pub project_id: Option<NumberOrString>,
    /// Hook event, e.g. `PushEvents`.
    #[serde(default = "default_gitlab_event")]
    pub event: String,
    /// GitLab instance base URL.
    #[serde(default = "default_gitlab_url")]
    pub gitlab_base_url: String,
}

fn default_gitlab_event() -> String {
    "PushEvents".to_string()
}

fn default_gitlab_url() -> String {
    "https://gitlab.com".to_string()
}

/// GitHub hook settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubOptions {
    /// Repository owner.
    #[serde(default)]
    pub owner: Option<String>,
    /// Repository name.
    #[serde(default)]
    pub repository: Option<String>,
    /// Events the hook subscribes to.
    #[serde(default = "default_github_events")]
    pub events: Vec<String>,
    /// HMAC secret for `X-Hub-Signature-256`; defaults to the access token.
    #[serde(default)]
    pub webhook_secret: Option<SecretRef>,
    /// GitHub API base URL.
    #[serde(default = "default_github_api")]
    pub api_url: String,
    /// Payload content type requested from GitHub.
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Whether the hook is created active.
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Default for GithubOptions {
    fn default() -> Self {
        Self {
            owner: None,
            repository: None,
            events: default_github_events(),
            webhook_secret: None,
            api_url: default_github_api(),
            content_type: default_content_type(),
            active: default_active(),
        }
    }
}

fn default_github_events() -> Vec<String> {
    vec!["push".to_string()]
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_content_type() -> String {
    "json".to_string()
}

fn default_active() -> bool {
    true
}

/// TLS material for one listener port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// PEM certificate chain.
    pub cert_path: PathBuf,
    /// PEM private key.
    pub key_path: PathBuf,
    /// CA bundle for client verification, when verification is enabled.
    pub client_ca_path: Option<PathBuf>,
}

/// Provider settings after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Provider {
    /// GitLab project hook.
    Gitlab {
        /// Project id, if the hook should be registered.
        project_id: Option<String>,
        /// Hook event name.
        event: String,
        /// Instance base URL.
        base_url: String,
    },
    /// GitHub repository hook.
    Github {
        /// Repository owner.
        owner: Option<String>,
        /// Repository name.
        repository: Option<String>,
        /// Subscribed events.
        events: Vec<String>,
        /// HMAC secret reference.
        webhook_secret: SecretRef,
        /// API base URL.
        api_url: String,
        /// Requested payload content type.
        content_type: String,
        /// Create the hook active.
        active: bool,
    },
    /// Generic bearer webhook.
    Webhook,
}

/// A validated webhook source, ready to start.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookSource {
    /// Unique source name.
    pub name: String,
    /// Listener path.
    pub endpoint: String,
    /// Listener port.
    pub port: u16,
    /// Accepted method.
    pub method: Method,
    /// Public base URL.
    pub url: Option<String>,
    /// TLS material, when the port serves HTTPS.
    pub tls: Option<TlsSettings>,
    /// Whether providers are asked to verify our certificate.
    pub enable_ssl_verification: bool,
    /// Shared secret reference.
    pub access_token: SecretRef,
    /// Provider settings.
    pub provider: Provider,
}

impl WebhookSource {
    /// Producer kind for envelopes from this source.
    pub fn kind(&self) -> SourceKind {
        match self.provider {
            Provider::Gitlab { .. } => SourceKind::ScmGitlab,
            Provider::Github { .. } => SourceKind::ScmGithub,
            Provider::Webhook => SourceKind::GenericWebhook,
        }
    }

    /// Full callback URL registered with the provider.
    pub fn callback_url(&self) -> Option<String> {
        self.url.as_ref().map(|base| format!("{}{}", base.trim_end_matches('/'), self.endpoint))
    }
}

impl WebhookSourceConfig {
    /// Validates the entry, producing a startable source.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::ConfigInvalid`] for a bad port, method, or
    /// endpoint, incomplete TLS material, or SSL verification requested
    /// without TLS and a CA bundle.
    pub fn validate(&self, name: &str) -> sluice_core::Result<WebhookSource> {
        let invalid = |reason: String| IngestError::config(name, reason);

        let port = self.port.to_port().map_err(invalid)?;
        let method = parse_method(&self.method).map_err(invalid)?;
        validate_endpoint(&self.endpoint).map_err(invalid)?;

        let tls = match (&self.server_cert_path, &self.server_key_path) {
            (Some(cert), Some(key)) => Some(TlsSettings {
                cert_path: cert.clone(),
                key_path: key.clone(),
                client_ca_path: self
                    .enable_ssl_verification
                    .then(|| self.ca_cert_path.clone())
                    .flatten(),
            }),
            (None, None) => None,
            _ => {
                return Err(invalid(
                    "serverCertPath and serverKeyPath must be set together".to_string(),
                ))
            },
        };

        if self.enable_ssl_verification {
            match &tls {
                None => {
                    return Err(invalid(
                        "enableSSLVerification requires serverCertPath and serverKeyPath"
                            .to_string(),
                    ))
                },
                Some(settings) if settings.client_ca_path.is_none() => {
                    return Err(invalid(
                        "enableSSLVerification requires caCertPath".to_string(),
                    ))
                },
                Some(_) => {},
            }
        }

        if let Some(url) = &self.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid(format!("url must be http(s), got '{url}'")));
            }
        }

        let provider = match &self.provider {
            ProviderConfig::Gitlab(options) => Provider::Gitlab {
                project_id: options.project_id.as_ref().map(NumberOrString::as_text),
                event: options.event.clone(),
                base_url: options.gitlab_base_url.clone(),
            },
            ProviderConfig::Github(options) => Provider::Github {
                owner: options.owner.clone(),
                repository: options.repository.clone(),
                events: options.events.clone(),
                webhook_secret: options
                    .webhook_secret
                    .clone()
                    .unwrap_or_else(|| self.access_token.clone()),
                api_url: options.api_url.clone(),
                content_type: options.content_type.clone(),
                active: options.active,
            },
            ProviderConfig::Webhook => Provider::Webhook,
        };

        Ok(WebhookSource {
            name: name.to_string(),
            endpoint: self.endpoint.clone(),
            port,
            method,
            url: self.url.clone(),
            tls,
            enable_ssl_verification: self.enable_ssl_verification,
            access_token: self.access_token.clone(),
            provider,
        })
    }
}

fn parse_method(method: &str) -> std::result::Result<Method, String> {
    let upper = method.trim().to_ascii_uppercase();
    ALLOWED_METHODS
        .iter()
        .find(|allowed| allowed.as_str() == upper)
        .cloned()
        .ok_or_else(|| format!("unsupported HTTP method '{method}'"))
}

fn validate_endpoint(endpoint: &str) -> std::result::Result<(), String> {
    if !endpoint.starts_with('/') {
        return Err(format!("endpoint must start with '/', got '{endpoint}'"));
    }
    if endpoint.chars().any(|c| c.is_whitespace() || c == '?' || c == '#') {
        return Err(format!("endpoint must be a plain path, got '{endpoint}'"));
    }
    Ok(())
}
