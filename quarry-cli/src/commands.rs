//! Startup and subcommand handlers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use quarry_core::credential::{self, AuthStrategy, LOGIN_GUIDANCE};
use quarry_core::{Credential, FoundryClient, ServiceConfig};
use quarry_mcp::McpServer;
use quarry_mcp::handlers::RequestHandler;
use quarry_mcp::registry::ToolRegistry;
use quarry_mcp::register_research_tools;
use quarry_mcp::transport::StdioTransport;
use tracing::info;

/// Validate the config and resolve the credential.
///
/// Only a CLI session is asked for a token up front.
async fn resolve_credential(config: &ServiceConfig) -> anyhow::Result<Arc<Credential>> {
    config.validate().context("Invalid configuration")?;

    let credential = Arc::new(credential::resolve(&config.auth)?);
    info!(strategy = credential.strategy().name(), "Resolved credential");

    if matches!(credential.strategy(), AuthStrategy::CliSession) {
        credential
            .token()
            .await
            .with_context(|| format!("No usable Azure CLI session; {LOGIN_GUIDANCE}"))?;
    }
    Ok(credential)
}

async fn build_registry(config: &ServiceConfig) -> anyhow::Result<ToolRegistry> {
    let credential = resolve_credential(config).await?;
    let client = FoundryClient::new(config, credential)?;

    let mut registry = ToolRegistry::new();
    register_research_tools(&mut registry, Arc::new(client))?;
    Ok(registry)
}

pub async fn serve_stdio(config: &ServiceConfig) -> anyhow::Result<()> {
    let registry = build_registry(config).await?;
    info!(tools = ?registry.names(), "Serving MCP over stdio");

    let server = McpServer::new(registry);
    let mut transport = StdioTransport::new();
    server.run(&mut transport).await?;
    Ok(())
}

pub async fn serve_http(config: &ServiceConfig) -> anyhow::Result<()> {
    let registry = build_registry(config).await?;
    info!(tools = ?registry.names(), "Serving MCP over HTTP");

    let handler = Arc::new(RequestHandler::stateless(Arc::new(registry)));
    quarry_mcp::http::serve(handler, &config.server).await?;
    Ok(())
}

/// `quarry check`: validate configuration, resolve the credential and fetch a token.
pub async fn check(config: &ServiceConfig) -> anyhow::Result<()> {
    let credential = resolve_credential(config).await?;
    credential
        .token()
        .await
        .context("Credential resolved but no token could be acquired")?;

    println!("Configuration OK");
    println!(
        "  primary:        {} ({})",
        config.primary.base_url().unwrap_or_default(),
        config.primary.deployment
    );
    println!(
        "  deep research:  {} ({})",
        config.deep_research.base_url().unwrap_or_default(),
        config.deep_research.deployment
    );
    println!("  credential:     {}", credential.strategy().name());
    println!("  token:          acquired");
    Ok(())
}

fn user_config_path() -> anyhow::Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("dev", "quarry", "quarry")
        .context("Could not determine the user config directory")?;
    Ok(dirs.config_dir().join("config.toml"))
}

pub fn config_init() -> anyhow::Result<()> {
    let config_path = user_config_path()?;
    if config_path.exists() {
        println!(
            "Configuration file already exists at: {}",
            config_path.display()
        );
        return Ok(());
    }
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&config_path, render_config(&ServiceConfig::default())?)?;
    println!(
        "Created default configuration at: {}",
        config_path.display()
    );
    Ok(())
}

pub fn config_show(config: &ServiceConfig) -> anyhow::Result<()> {
    println!("{}", render_config(config)?);
    Ok(())
}

/// TOML for a config, with the client secret masked.
fn render_config(config: &ServiceConfig) -> anyhow::Result<String> {
    let mut shown = config.clone();
    if shown.auth.client_secret.is_some() {
        shown.auth.client_secret = Some("********".to_string());
    }
    Ok(toml::to_string_pretty(&shown)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_config_masks_secret() {
        let mut config = ServiceConfig::default();
        config.auth.client_secret = Some("hunter2".into());

        let rendered = render_config(&config).unwrap();
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("********"));
    }

    #[test]
    fn test_rendered_defaults_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, render_config(&ServiceConfig::default()).unwrap()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: ServiceConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.primary.deployment, "gpt-5.2");
        assert_eq!(parsed.deep_research.deployment, "o3-deep-research");
        assert_eq!(parsed.server.mount_path, "/mcp");
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_fatal() {
        let config = ServiceConfig::default();
        let err = resolve_credential(&config).await.unwrap_err();
        assert!(format!("{err:#}").contains("AI_FOUNDRY_ENDPOINT"));
    }
}
