//! Bigin sync job
//!
//! Single-run batch binary that:
//! 1. Loads the stored OAuth credential for the service id
//! 2. Fetches every configured module page by page, refreshing as needed
//! 3. Flattens records and writes one JSON Lines file per module
//! 4. Writes a Prometheus textfile snapshot and persists any pending refresh

mod config;
mod error;
mod export;
mod flatten;
mod metrics;
mod sync;

use std::sync::Arc;

use anyhow::{Context, Result};
use crm_auth::{FileCredentialStore, HttpTokenExchange, TokenAuthority};
use crm_fetch::{HttpPageSource, PagedFetcher};
use tracing::{Instrument, debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let run_id = uuid::Uuid::new_v4();
    run(cli_config_path.as_deref())
        .instrument(tracing::info_span!("sync_run", %run_id))
        .await
}

async fn run(cli_config_path: Option<&str>) -> Result<()> {
    info!("starting bigin-sync");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder().context("failed to install metrics recorder")?;

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.zoho.base_url,
        token_url = %config.zoho.token_url,
        service_id = %config.zoho.service_id,
        modules = config.fetch.modules.len(),
        per_page = config.fetch.records_per_page,
        output_dir = %config.output.dir.display(),
        "configuration loaded"
    );
    if config.zoho.client_id.is_empty() || config.zoho.client_secret.is_none() {
        warn!("client_id or client secret not configured, token refresh will fail");
    }

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let store = Arc::new(
        FileCredentialStore::load(config.storage.credentials_path.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to open credential store {}",
                    config.storage.credentials_path.display()
                )
            })?,
    );
    let exchange = Arc::new(HttpTokenExchange::new(
        http.clone(),
        config.zoho.token_url.clone(),
        config.oauth_client(),
    ));
    let authority = Arc::new(
        TokenAuthority::load(
            config.zoho.service_id.clone(),
            store,
            exchange,
            config.seed(),
        )
        .await
        .context("failed to load stored credential")?,
    );

    let source = Arc::new(
        HttpPageSource::new(
            http,
            config.zoho.base_url.clone(),
            config.zoho.auth_scheme.clone(),
            config.request_timeout(),
        )
        .context("invalid API settings")?,
    );
    let fetcher = PagedFetcher::new(source, authority.clone(), config.fetch_policy());

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let outcome = sync::run_sync(
        &fetcher,
        &config.fetch.modules,
        &config.output.dir,
        &timestamp,
    )
    .await;

    if let Err(e) = metrics::write_snapshot(&prometheus, &config.output.dir) {
        warn!(error = %e, "failed to write metrics snapshot");
    }

    // A rotated refresh token that never reached the store is lost with the process
    authority
        .flush()
        .await
        .context("failed to persist refreshed credential")?;

    match outcome {
        Ok(summary) => {
            for m in &summary.modules {
                debug!(
                    module = %m.module,
                    records = m.records,
                    outcome = m.outcome.as_str(),
                    path = ?m.path,
                    "module summary"
                );
            }
            info!(
                service_id = authority.service_id(),
                synced = summary.synced(),
                attempted = summary.modules.len(),
                "sync complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "sync failed");
            Err(e.into())
        }
    }
}
