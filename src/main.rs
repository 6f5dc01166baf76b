use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::audit::ChannelAuditSink;
use turnstile::config::{StoreBackend, TurnstileConfig};
use turnstile::guard::Guard;
use turnstile::http::{DecisionService, HttpServer};
use turnstile::ratelimit::{CounterStore, MemoryCounterStore, RedisCounterStore};
use turnstile::settings::{
    EnvOverrides, InMemorySettings, LayeredSettings, SettingsProvider, ThrottleSettings,
};
use turnstile::users::InMemoryUserDirectory;

/// Upper bound for logging queued audit events at shutdown.
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Adaptive request throttling decision service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address, overrides the configuration file
    #[arg(short, long)]
    listen: Option<std::net::SocketAddr>,

    /// Use the Redis counter store at this URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Initial throttle settings (YAML)
    #[arg(long)]
    settings: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(url) = args.redis_url {
        config.store.backend = StoreBackend::Redis;
        config.store.redis_url = url;
    }
    if let Some(path) = args.settings {
        config.settings.path = Some(path);
    }
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryCounterStore::new());
            spawn_purge(store.clone(), config.store.purge_interval_secs);
            store
        }
        StoreBackend::Redis => Arc::new(
            RedisCounterStore::connect(&config.store.redis_url, config.store.key_prefix.clone())
                .await?,
        ),
    };

    let initial = match config.settings.path.as_deref() {
        Some(path) => ThrottleSettings::from_file(path)?,
        None => ThrottleSettings::default(),
    };
    let dynamic = Arc::new(InMemorySettings::new(initial));
    let overrides = EnvOverrides::from_env()?;
    if !overrides.is_empty() {
        info!("Environment overrides active for throttle settings");
    }
    let effective: Arc<dyn SettingsProvider> =
        Arc::new(LayeredSettings::new(dynamic.clone(), overrides));

    let users = Arc::new(InMemoryUserDirectory::from_entries(&config.users));
    info!(users = users.len(), "User directory loaded");

    let (audit, audit_task) = ChannelAuditSink::spawn(users.clone(), config.audit.queue_capacity);
    let audit = Arc::new(audit);

    let guard = Arc::new(Guard::with_timeout(
        effective.clone(),
        store,
        users,
        audit.clone(),
        config.store.timeout(),
    )?);

    let router = DecisionService::new(guard, dynamic, effective, config.server.admin_token.clone())
        .router();

    HttpServer::new(config.server.listen_addr, router)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    if audit.dropped() > 0 {
        warn!(dropped = audit.dropped(), "Audit events were dropped");
    }
    match Arc::try_unwrap(audit) {
        Ok(audit) => {
            audit.shutdown(audit_task, AUDIT_DRAIN_TIMEOUT).await;
        }
        Err(_) => warn!("Audit sink still in use, queued events not drained"),
    }

    info!("Turnstile stopped");
    Ok(())
}

/// Periodically drop expired counters from the memory store.
fn spawn_purge(store: Arc<MemoryCounterStore>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            interval.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, remaining = store.len(), "Purged expired counters");
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
