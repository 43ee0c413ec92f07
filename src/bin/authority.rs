//! Standalone render authority.
//!
//! Loads a `RefreshConfig` (first argument, or the default config path),
//! registers the configured template partials and serves render batches
//! over HTTP until Ctrl-C.

use anyhow::Context;
use partial_refresh::authority::{AuthorityPartial, TemplateRenderer, TokenRegistry};
use partial_refresh::{AuthorityServer, ContextSigner, InMemorySettings, RefreshConfig, RenderAuthority};
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(RefreshConfig::default_config_path);
    let config = if path.exists() {
        RefreshConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?
    } else {
        RefreshConfig::default()
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.filter)),
        )
        .init();

    tracing::info!(config = %path.display(), "partial-authority starting");

    let tokens = TokenRegistry::from_config(&config.authority.tokens);
    if config.authority.tokens.is_empty() {
        let token = tokens.issue(true);
        tracing::warn!(%token, "no tokens configured; issued a session token");
    }
    if config.authority.signing_secret.is_empty() {
        tracing::warn!("signing_secret is empty; structural contexts are forgeable");
    }

    let authority = Arc::new(RenderAuthority::new(
        Arc::new(tokens),
        ContextSigner::new(config.authority.signing_secret.as_bytes()),
        Arc::new(InMemorySettings::new()),
    ));
    for partial in &config.authority.partials {
        let settings = if partial.settings.is_empty() {
            vec![partial.id.clone()]
        } else {
            partial.settings.clone()
        };
        let kind = partial.kind.as_deref().unwrap_or("default");
        authority.add_partial_with_renderer(
            AuthorityPartial::new(&partial.id, kind).with_settings(settings),
            Arc::new(TemplateRenderer::new(&partial.template)),
        );
    }
    tracing::info!(partials = config.authority.partials.len(), "template partials registered");

    let server = AuthorityServer::start(authority, &config.authority)
        .await
        .map_err(|e| anyhow::anyhow!("partial-authority failed to start: {e}"))?;
    tracing::info!(url = %server.url(), "serving render batches");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    server.shutdown();
    tracing::info!("partial-authority shut down cleanly");
    Ok(())
}
