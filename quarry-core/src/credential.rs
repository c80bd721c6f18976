//! Credential resolution and token caching for outbound calls.
//!
//! Three strategies are supported, in priority order:
//!
//! | Strategy | Selected when | Token source |
//! |----------|---------------|--------------|
//! | Service principal | tenant, client id and secret are all set | OAuth 2.0 client credentials |
//! | Managed identity | the host advertises `IDENTITY_ENDPOINT` | local identity endpoint |
//! | CLI session | otherwise | `az account get-access-token` |
//!
//! Resolution is pure; the first token is fetched lazily on first use.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::error::{ResearchError, Result};

/// Guidance shown when no usable credential can be found.
pub const LOGIN_GUIDANCE: &str =
    "run `az login` or set AZURE_CLIENT_ID/AZURE_CLIENT_SECRET/AZURE_TENANT_ID";

const MANAGED_IDENTITY_API_VERSION: &str = "2019-08-01";

// ── Types ───────────────────────────────────────────────────────────────────

/// The authentication strategy chosen at startup.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    ServicePrincipal {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    ManagedIdentity {
        endpoint: String,
        header: Option<String>,
        /// Selects a user-assigned identity.
        client_id: Option<String>,
    },
    CliSession,
}

impl AuthStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            AuthStrategy::ServicePrincipal { .. } => "service_principal",
            AuthStrategy::ManagedIdentity { .. } => "managed_identity",
            AuthStrategy::CliSession => "cli_session",
        }
    }
}

impl std::fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStrategy::ServicePrincipal {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ServicePrincipal")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"[REDACTED]")
                .finish(),
            AuthStrategy::ManagedIdentity {
                endpoint,
                client_id,
                ..
            } => f
                .debug_struct("ManagedIdentity")
                .field("endpoint", endpoint)
                .field("client_id", client_id)
                .finish(),
            AuthStrategy::CliSession => f.write_str("CliSession"),
        }
    }
}

impl std::fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A bearer token and the instant it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    /// Whether the token is still usable at `now`, keeping a 5-minute margin.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - chrono::Duration::minutes(5)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Something that can mint a fresh access token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<AccessToken>;
}

// ── Resolution ──────────────────────────────────────────────────────────────

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Pick the authentication strategy. Performs no I/O.
pub fn resolve_strategy(auth: &AuthConfig) -> AuthStrategy {
    if let (Some(tenant_id), Some(client_id), Some(client_secret)) = (
        non_empty(&auth.tenant_id),
        non_empty(&auth.client_id),
        non_empty(&auth.client_secret),
    ) {
        return AuthStrategy::ServicePrincipal {
            tenant_id,
            client_id,
            client_secret,
        };
    }

    if let Some(endpoint) = non_empty(&auth.identity_endpoint) {
        return AuthStrategy::ManagedIdentity {
            endpoint,
            header: non_empty(&auth.identity_header),
            client_id: non_empty(&auth.client_id),
        };
    }

    AuthStrategy::CliSession
}

/// Resolve the process-wide credential from configuration.
pub fn resolve(auth: &AuthConfig) -> Result<Credential> {
    let strategy = resolve_strategy(auth);
    let resource = auth.scope.trim_end_matches("/.default").to_string();
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| ResearchError::Authentication {
            message: format!("Failed to build token HTTP client: {e}"),
        })?;

    let source: Box<dyn TokenSource> = match &strategy {
        AuthStrategy::ServicePrincipal {
            tenant_id,
            client_id,
            client_secret,
        } => Box::new(ClientSecretSource {
            http,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                auth.authority_host.trim_end_matches('/'),
                tenant_id
            ),
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            scope: auth.scope.clone(),
        }),
        AuthStrategy::ManagedIdentity {
            endpoint,
            header,
            client_id,
        } => Box::new(ManagedIdentitySource {
            http,
            endpoint: endpoint.clone(),
            header: header.clone(),
            client_id: client_id.clone(),
            resource,
        }),
        AuthStrategy::CliSession => Box::new(AzureCliSource {
            command: auth.az_command.clone(),
            resource,
        }),
    };

    info!(strategy = strategy.name(), "Resolved credential");
    Ok(Credential::new(strategy, source))
}

// ── Credential ──────────────────────────────────────────────────────────────

/// The process-wide credential: a fixed strategy plus a token cache.
///
/// Concurrent callers serialize on the cache lock, so a refresh happens at
/// most once no matter how many calls need a token at the same moment.
pub struct Credential {
    strategy: AuthStrategy,
    source: Box<dyn TokenSource>,
    cache: Mutex<Option<AccessToken>>,
}

impl Credential {
    pub fn new(strategy: AuthStrategy, source: Box<dyn TokenSource>) -> Self {
        Self {
            strategy,
            source,
            cache: Mutex::new(None),
        }
    }

    pub fn strategy(&self) -> &AuthStrategy {
        &self.strategy
    }

    /// Return a valid bearer token, fetching a new one if the cached token is
    /// missing or inside the expiry margin.
    pub async fn token(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref()
            && token.is_fresh(Utc::now())
        {
            return Ok(token.secret.clone());
        }

        debug!(strategy = self.strategy.name(), "Acquiring access token");
        let token = self.source.fetch().await?;
        debug!(expires_at = %token.expires_at, "Access token acquired");
        let secret = token.secret.clone();
        *cache = Some(token);
        Ok(secret)
    }

    /// Drop the cached token so the next call fetches a new one.
    pub async fn invalidate(&self) {
        if self.cache.lock().await.take().is_some() {
            warn!(strategy = self.strategy.name(), "Cached access token invalidated");
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

// ── Token Sources ───────────────────────────────────────────────────────────

fn auth_error(message: impl Into<String>) -> ResearchError {
    ResearchError::Authentication {
        message: message.into(),
    }
}

/// A non-success reply from a token endpoint. Throttling and server errors are
/// transient; anything else means the credential itself was refused.
fn token_endpoint_error(source: &str, status: reqwest::StatusCode, body: &str) -> ResearchError {
    let message = format!("{source} token request failed (HTTP {status}): {body}");
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ResearchError::RemoteService {
            status: Some(status.as_u16()),
            message,
            retryable: true,
        }
    } else {
        auth_error(message)
    }
}

/// Read `access_token` out of a token endpoint body.
fn access_token_field(body: &Value) -> Result<String> {
    body.get("access_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| auth_error("Token response did not contain an access_token"))
}

/// Numbers in token responses arrive either as JSON numbers or strings.
fn as_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// OAuth 2.0 client-credentials grant against Microsoft Entra ID.
struct ClientSecretSource {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
}

#[async_trait]
impl TokenSource for ClientSecretSource {
    async fn fetch(&self) -> Result<AccessToken> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        debug!(url = %self.token_url, "Requesting client credentials token");

        // Transport failures convert to retryable errors.
        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await?;
        let status = response.status();
        let body_text = response.text().await?;

        if !status.is_success() {
            return Err(token_endpoint_error(
                "Client credentials",
                status,
                &body_text,
            ));
        }

        let body: Value = serde_json::from_str(&body_text)
            .map_err(|e| auth_error(format!("Invalid token response: {e}")))?;
        let secret = access_token_field(&body)?;
        let expires_in = body.get("expires_in").and_then(as_i64).unwrap_or(3600);
        Ok(AccessToken::new(
            secret,
            Utc::now() + chrono::Duration::seconds(expires_in),
        ))
    }
}

/// Token from the hosting platform's managed identity endpoint.
struct ManagedIdentitySource {
    http: reqwest::Client,
    endpoint: String,
    header: Option<String>,
    client_id: Option<String>,
    resource: String,
}

#[async_trait]
impl TokenSource for ManagedIdentitySource {
    async fn fetch(&self) -> Result<AccessToken> {
        let mut query = vec![
            ("api-version", MANAGED_IDENTITY_API_VERSION),
            ("resource", self.resource.as_str()),
        ];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }

        let mut request = self.http.get(&self.endpoint).query(&query);
        if let Some(header) = &self.header {
            request = request.header("X-IDENTITY-HEADER", header);
        }

        debug!(endpoint = %self.endpoint, "Requesting managed identity token");

        let response = request.send().await?;
        let status = response.status();
        let body_text = response.text().await?;

        if !status.is_success() {
            return Err(token_endpoint_error(
                "Managed identity",
                status,
                &body_text,
            ));
        }

        let body: Value = serde_json::from_str(&body_text)
            .map_err(|e| auth_error(format!("Invalid managed identity response: {e}")))?;
        let secret = access_token_field(&body)?;
        let expires_at = body
            .get("expires_on")
            .and_then(as_i64)
            .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
            .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(1));
        Ok(AccessToken::new(secret, expires_at))
    }
}

/// Token borrowed from the developer's Azure CLI login.
struct AzureCliSource {
    command: String,
    resource: String,
}

#[async_trait]
impl TokenSource for AzureCliSource {
    async fn fetch(&self) -> Result<AccessToken> {
        debug!(command = %self.command, "Requesting token from Azure CLI");

        let output = tokio::process::Command::new(&self.command)
            .args([
                "account",
                "get-access-token",
                "--resource",
                &self.resource,
                "--output",
                "json",
            ])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                auth_error(format!(
                    "Could not run '{}' ({e}); {LOGIN_GUIDANCE}",
                    self.command
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(auth_error(format!(
                "No Azure CLI session available ({}); {LOGIN_GUIDANCE}",
                stderr.trim()
            )));
        }

        parse_cli_token(&output.stdout)
    }
}

/// Parse the JSON printed by `az account get-access-token`.
fn parse_cli_token(stdout: &[u8]) -> Result<AccessToken> {
    let body: Value = serde_json::from_slice(stdout)
        .map_err(|e| auth_error(format!("Invalid Azure CLI output: {e}")))?;
    let secret = body
        .get("accessToken")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| auth_error(format!("Azure CLI returned no token; {LOGIN_GUIDANCE}")))?;

    // Newer CLIs emit `expires_on` as epoch seconds; older ones only the
    // local-time `expiresOn` string.
    let expires_at = body
        .get("expires_on")
        .and_then(as_i64)
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
        .or_else(|| {
            body.get("expiresOn")
                .and_then(Value::as_str)
                .and_then(parse_local_timestamp)
        })
        .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(10));

    Ok(AccessToken::new(secret, expires_at))
}

fn parse_local_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}
