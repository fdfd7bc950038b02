// ABOUTME: PostgreSQL connection management with TLS
// ABOUTME: Spawns the connection driver on tokio and retries transient failures

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_postgres::Client;

use crate::utils::{redact_url, retry_with_backoff};

static ALLOW_SELF_SIGNED_CERTS: OnceLock<bool> = OnceLock::new();

/// Set the process-wide certificate policy. Only the first call has effect.
pub fn init_tls_policy(allow_self_signed: bool) {
    if ALLOW_SELF_SIGNED_CERTS.set(allow_self_signed).is_err() {
        tracing::debug!("TLS policy already initialized; ignoring");
    }
}

fn allow_self_signed_certs() -> bool {
    ALLOW_SELF_SIGNED_CERTS.get().copied().unwrap_or(false)
}

fn make_tls_connector() -> Result<MakeTlsConnector> {
    let mut builder = TlsConnector::builder();
    if allow_self_signed_certs() {
        tracing::warn!("Accepting self-signed TLS certificates (insecure)");
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Open a connection and spawn its driver task.
pub async fn connect(url: &str) -> Result<Client> {
    let tls = make_tls_connector()?;
    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", redact_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    tracing::debug!("Connected to {}", redact_url(url));
    Ok(client)
}

/// `connect` with up to three retries and exponential backoff from one second.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    retry_with_backoff(|| connect(url), 3, Duration::from_secs(1))
        .await
        .with_context(|| format!("Giving up connecting to {}", redact_url(url)))
}
