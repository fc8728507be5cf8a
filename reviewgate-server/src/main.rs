use anyhow::{Context, Result};
use reviewgate_core::{PolicyHandle, PolicySet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use reviewgate_server::config::{Config, LogFormat};
use reviewgate_server::dispatcher::Dispatcher;
use reviewgate_server::state_machine::repository::{
    SqliteRepository, StateRepository, COMPLETED_CLAIM_TTL_SECONDS,
    COMPLETED_DISPATCH_TTL_SECONDS,
};
use reviewgate_server::{app, AppState, GateService, GitHubClient, RecordingLogger, StateStore};

const CLAIM_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Swap in the policy file's current contents on every SIGHUP.
#[cfg(unix)]
fn spawn_policy_reloader(policy: PolicyHandle, path: PathBuf) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            match PolicySet::load(&path) {
                Ok(rules) => {
                    let count = rules.rules.len();
                    policy.replace(rules);
                    info!("Reloaded {} policy rule(s) from {}", count, path.display());
                }
                Err(e) => {
                    error!("Policy reload failed, keeping previous rules: {}", e);
                }
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_policy_reloader(_policy: PolicyHandle, _path: PathBuf) -> Result<()> {
    Ok(())
}

fn spawn_claim_cleanup(repository: Arc<dyn StateRepository>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLAIM_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            match repository
                .cleanup_expired_deliveries(COMPLETED_CLAIM_TTL_SECONDS)
                .await
            {
                Ok(0) => {}
                Ok(removed) => info!("Removed {} expired delivery claim(s)", removed),
                Err(e) => warn!("Delivery claim cleanup failed: {}", e),
            }
            match repository
                .cleanup_expired_dispatches(COMPLETED_DISPATCH_TTL_SECONDS)
                .await
            {
                Ok(0) => {}
                Ok(removed) => info!("Removed {} expired dispatch ledger entr(ies)", removed),
                Err(e) => warn!("Dispatch ledger cleanup failed: {}", e),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration from environment")?;

    init_tracing(config.log_format);

    info!("Starting reviewgate {}", reviewgate_server::get_version());

    let recording_logger = if config.recording_enabled {
        match RecordingLogger::new(PathBuf::from(&config.recording_log_path)) {
            Ok(logger) => {
                info!("Recording enabled, logging to: {}", logger.path().display());
                Some(logger)
            }
            Err(e) => {
                error!("Failed to initialize recording logger: {}", e);
                None
            }
        }
    } else {
        None
    };

    let rules = PolicySet::load(&config.policy_path).with_context(|| {
        format!("Failed to load policy from {}", config.policy_path.display())
    })?;
    info!(
        "Loaded {} policy rule(s) from {}",
        rules.rules.len(),
        config.policy_path.display()
    );
    let policy = PolicyHandle::new(rules);
    spawn_policy_reloader(policy.clone(), config.policy_path.clone())?;

    let platform = Arc::new(GitHubClient::with_api_url(
        &config.github_api_url,
        config.github_app_id,
        config.github_private_key.clone(),
        recording_logger.clone(),
    ));

    let db_path = config.database_path();
    info!("Using state database: {}", db_path.display());
    let repository: Arc<dyn StateRepository> = Arc::new(
        SqliteRepository::new(&db_path)
            .with_context(|| format!("Failed to open state database {}", db_path.display()))?,
    );

    let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(Dispatcher::new(
        platform.clone(),
        repository.clone(),
        config.dispatch,
        feedback_tx,
    ));
    let store = Arc::new(StateStore::new(
        repository.clone(),
        platform.clone(),
        dispatcher.clone(),
    ));
    let service = Arc::new(GateService::new(store, platform, policy));

    tokio::spawn(service.clone().run_feedback_loop(feedback_rx));
    spawn_claim_cleanup(repository);

    let app_state = Arc::new(AppState {
        service,
        webhook_secret: config.github_webhook_secret.clone(),
        status_auth_token: config.status_auth_token.clone(),
        recording_logger,
    });

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatcher.drain().await;

    Ok(())
}
