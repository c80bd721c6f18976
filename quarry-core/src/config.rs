//! Configuration system for Quarry.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> Foundry/Azure environment variables -> `QUARRY_`
//! environment variables. Configuration is read once at startup.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Default deployment behind the primary (chat) endpoint.
pub const DEFAULT_PRIMARY_DEPLOYMENT: &str = "gpt-5.2";
/// Default deployment behind the deep-research endpoint.
pub const DEFAULT_DEEP_RESEARCH_DEPLOYMENT: &str = "o3-deep-research";
/// Token scope for Azure AI services.
pub const COGNITIVE_SERVICES_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

/// Environment variables used by Foundry deployments, mapped onto config paths.
const FOUNDRY_ENV_KEYS: &[(&str, &str)] = &[
    ("AI_FOUNDRY_ENDPOINT", "primary.endpoint"),
    ("MODEL_DEPLOYMENT_NAME", "primary.deployment"),
    ("AI_FOUNDRY_DEEP_RESEARCH_ENDPOINT", "deep_research.endpoint"),
    ("DEEP_RESEARCH_MODEL_DEPLOYMENT_NAME", "deep_research.deployment"),
    ("AZURE_TENANT_ID", "auth.tenant_id"),
    ("AZURE_CLIENT_ID", "auth.client_id"),
    ("AZURE_CLIENT_SECRET", "auth.client_secret"),
    ("AZURE_AUTHORITY_HOST", "auth.authority_host"),
    ("IDENTITY_ENDPOINT", "auth.identity_endpoint"),
    ("IDENTITY_HEADER", "auth.identity_header"),
];

/// Top-level configuration for the Quarry service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Chat/Responses endpoint used by `ask`, `web_research` and the
    /// non-research phases of `deep_research`.
    pub primary: EndpointConfig,
    /// Endpoint hosting the deep-research model.
    pub deep_research: EndpointConfig,
    pub auth: AuthConfig,
    pub retry: RetryConfig,
    pub polling: PollingConfig,
    pub timeouts: TimeoutConfig,
    pub server: ServerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            primary: EndpointConfig::new(DEFAULT_PRIMARY_DEPLOYMENT),
            deep_research: EndpointConfig::new(DEFAULT_DEEP_RESEARCH_DEPLOYMENT),
            auth: AuthConfig::default(),
            retry: RetryConfig::default(),
            polling: PollingConfig::default(),
            timeouts: TimeoutConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Check that everything required to serve requests is present.
    ///
    /// A missing endpoint is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.primary
            .validate("primary.endpoint", "AI_FOUNDRY_ENDPOINT")?;
        self.deep_research
            .validate("deep_research.endpoint", "AI_FOUNDRY_DEEP_RESEARCH_ENDPOINT")?;

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: "retry.max_attempts must be at least 1".into(),
            });
        }
        if self.retry.multiplier < 1.0 || self.polling.multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                message: "backoff multipliers must be >= 1.0".into(),
            });
        }
        if self.polling.initial_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                message: "polling.initial_interval_ms must be greater than zero".into(),
            });
        }
        if self.polling.max_interval_ms < self.polling.initial_interval_ms {
            return Err(ConfigError::Invalid {
                message: "polling.max_interval_ms must be >= polling.initial_interval_ms".into(),
            });
        }
        if self.server.mount_path.is_empty() || !self.server.mount_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                message: format!(
                    "server.mount_path must start with '/', got '{}'",
                    self.server.mount_path
                ),
            });
        }
        Ok(())
    }
}

/// One remote inference endpoint and the model deployment behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL of the OpenAI-compatible API (e.g. `https://x.openai.azure.com/openai/v1`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Model deployment name sent as `model`.
    pub deployment: String,
}

impl EndpointConfig {
    fn new(deployment: &str) -> Self {
        Self {
            endpoint: None,
            deployment: deployment.to_string(),
        }
    }

    /// The configured base URL without a trailing slash.
    pub fn base_url(&self) -> Option<&str> {
        self.endpoint
            .as_deref()
            .map(|e| e.trim_end_matches('/'))
            .filter(|e| !e.is_empty())
    }

    fn validate(&self, field: &str, env_var: &str) -> Result<(), ConfigError> {
        let base = self.base_url().ok_or_else(|| ConfigError::MissingField {
            field: field.to_string(),
            hint: env_var.to_string(),
        })?;
        let parsed = url::Url::parse(base).map_err(|e| ConfigError::Invalid {
            message: format!("{field} is not a valid URL ({e}): {base}"),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                message: format!("{field} must use http or https: {base}"),
            });
        }
        if self.deployment.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: format!("deployment name for {field} must not be empty"),
            });
        }
        Ok(())
    }
}

/// Authentication settings. Which strategy is used is decided by
/// [`crate::credential::resolve`].
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Client id of a service principal, or of a user-assigned managed identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Microsoft Entra authority used for client-credential grants.
    pub authority_host: String,
    /// Set by the hosting platform when a managed identity is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_header: Option<String>,
    /// OAuth scope requested for the inference endpoints.
    pub scope: String,
    /// Azure CLI executable used for the CLI-session strategy.
    pub az_command: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tenant_id: None,
            client_id: None,
            client_secret: None,
            authority_host: "https://login.microsoftonline.com".to_string(),
            identity_endpoint: None,
            identity_header: None,
            scope: COGNITIVE_SERVICES_SCOPE.to_string(),
            az_command: "az".to_string(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("authority_host", &self.authority_host)
            .field("identity_endpoint", &self.identity_endpoint)
            .field(
                "identity_header",
                &self.identity_header.as_ref().map(|_| "[REDACTED]"),
            )
            .field("scope", &self.scope)
            .field("az_command", &self.az_command)
            .finish()
    }
}

/// Retry policy for transient failures (network errors, 429, 5xx).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Poll schedule for long-running (background) operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    /// How often a running operation logs a progress line.
    pub progress_log_interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 2_000,
            max_interval_ms: 15_000,
            multiplier: 1.5,
            progress_log_interval_secs: 30,
        }
    }
}

/// Wall-clock budgets per operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub ask_secs: u64,
    pub web_research_secs: u64,
    pub deep_research_secs: u64,
    /// Budget for each auxiliary chat call (triage, brief, synthesis).
    pub chat_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ask_secs: 30,
            web_research_secs: 600,
            deep_research_secs: 1_800,
            chat_secs: 300,
        }
    }
}

impl TimeoutConfig {
    pub fn ask(&self) -> Duration {
        Duration::from_secs(self.ask_secs)
    }

    pub fn web_research(&self) -> Duration {
        Duration::from_secs(self.web_research_secs)
    }

    pub fn deep_research(&self) -> Duration {
        Duration::from_secs(self.deep_research_secs)
    }

    pub fn chat(&self) -> Duration {
        Duration::from_secs(self.chat_secs)
    }
}

/// Settings for the HTTP front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path of the MCP endpoint.
    pub mount_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            mount_path: "/mcp".to_string(),
        }
    }
}

/// Environment provider for the variable names Foundry deployments use.
fn foundry_env() -> Env {
    Env::raw().filter_map(|key| {
        FOUNDRY_ENV_KEYS
            .iter()
            .find(|(var, _)| key.as_str().eq_ignore_ascii_case(var))
            .map(|(_, path)| (*path).into())
    })
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. `QUARRY_`-prefixed environment variables (`QUARRY_RETRY__MAX_ATTEMPTS`, ...)
/// 2. Foundry/Azure environment variables (`AI_FOUNDRY_ENDPOINT`, `AZURE_CLIENT_ID`, ...)
/// 3. The explicit config file, if given
/// 4. User config (`~/.config/quarry/config.toml`)
/// 5. Built-in defaults
pub fn load_config(config_file: Option<&Path>) -> Result<ServiceConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(ServiceConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "quarry", "quarry") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment
        .merge(foundry_env())
        .merge(Env::prefixed("QUARRY_").split("__"));

    figment
        .extract()
        .map_err(|e| ConfigError::Parse(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    fn configured() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.primary.endpoint = Some("https://foundry.example.com/openai/v1/".into());
        config.deep_research.endpoint = Some("https://deep.example.com/openai/v1".into());
        config
    }

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.primary.deployment, "gpt-5.2");
        assert_eq!(config.deep_research.deployment, "o3-deep-research");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.timeouts.ask_secs, 30);
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.mount_path, "/mcp");
        assert_eq!(config.auth.scope, COGNITIVE_SERVICES_SCOPE);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = configured();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: ServiceConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.primary.endpoint, config.primary.endpoint);
        assert_eq!(deserialized.polling.max_interval_ms, 15_000);
    }

    #[test]
    fn test_validate_requires_endpoints() {
        let err = ServiceConfig::default().validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingField { ref field, .. } if field == "primary.endpoint"
        ));

        let mut config = ServiceConfig::default();
        config.primary.endpoint = Some("https://foundry.example.com".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("AI_FOUNDRY_DEEP_RESEARCH_ENDPOINT"));

        assert!(configured().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = configured();
        config.primary.endpoint = Some("not a url".into());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = configured();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = configured();
        config.polling.max_interval_ms = 10;
        assert!(config.validate().is_err());

        let mut config = configured();
        config.server.mount_path = "mcp".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_base_url_trims_trailing_slash() {
        let config = configured();
        assert_eq!(
            config.primary.base_url(),
            Some("https://foundry.example.com/openai/v1")
        );

        let empty = EndpointConfig {
            endpoint: Some("".into()),
            deployment: "x".into(),
        };
        assert_eq!(empty.base_url(), None);
    }

    #[test]
    fn test_auth_debug_redacts_secret() {
        let auth = AuthConfig {
            client_secret: Some("super-secret-value".into()),
            ..AuthConfig::default()
        };
        let debug = format!("{auth:?}");
        assert!(!debug.contains("super-secret-value"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_load_config_from_foundry_env() {
        Jail::expect_with(|jail| {
            jail.set_env("AI_FOUNDRY_ENDPOINT", "https://chat.example.com/openai/v1");
            jail.set_env(
                "AI_FOUNDRY_DEEP_RESEARCH_ENDPOINT",
                "https://deep.example.com/openai/v1",
            );
            jail.set_env("MODEL_DEPLOYMENT_NAME", "gpt-5.2-mini");
            jail.set_env("AZURE_CLIENT_ID", "11111111-2222-3333-4444-555555555555");
            jail.set_env("IDENTITY_ENDPOINT", "http://169.254.169.254/msi/token");

            let config = load_config(None).expect("config loads");
            assert_eq!(
                config.primary.endpoint.as_deref(),
                Some("https://chat.example.com/openai/v1")
            );
            assert_eq!(config.primary.deployment, "gpt-5.2-mini");
            assert_eq!(config.deep_research.deployment, "o3-deep-research");
            assert_eq!(
                config.auth.client_id.as_deref(),
                Some("11111111-2222-3333-4444-555555555555")
            );
            assert_eq!(
                config.auth.identity_endpoint.as_deref(),
                Some("http://169.254.169.254/msi/token")
            );
            assert!(config.auth.client_secret.is_none());
            assert!(config.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_load_config_file_then_prefixed_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "quarry.toml",
                r#"
[primary]
endpoint = "https://file.example.com/v1"
deployment = "from-file"

[retry]
max_attempts = 5
initial_backoff_ms = 10
max_backoff_ms = 100
multiplier = 3.0
jitter = false

[timeouts]
ask_secs = 45
web_research_secs = 600
deep_research_secs = 1800
chat_secs = 300
"#,
            )?;
            jail.set_env("QUARRY_RETRY__MAX_ATTEMPTS", "7");

            let config = load_config(Some(Path::new("quarry.toml"))).expect("config loads");
            assert_eq!(
                config.primary.endpoint.as_deref(),
                Some("https://file.example.com/v1")
            );
            assert_eq!(config.primary.deployment, "from-file");
            assert_eq!(config.retry.max_attempts, 7);
            assert_eq!(config.retry.initial_backoff_ms, 10);
            assert_eq!(config.timeouts.ask_secs, 45);
            Ok(())
        });
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = load_config(Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
