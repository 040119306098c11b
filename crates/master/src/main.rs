use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dr_domain::config::{Config, ConfigSeverity};
use dr_master::api;
use dr_master::cli::{Cli, Command, ConfigCommand};
use dr_master::processor;
use dr_master::state::AppState;
use dr_master::workers::{HttpWorkerRpc, WorkerPool, WorkerRpc};
use dr_store::{CampaignStore, ChatHistoryStore, QueueStore};

/// Exit codes: 1 invalid config, 2 store unusable, 3 bind failure.
const EXIT_CONFIG: i32 = 1;
const EXIT_STORE: i32 = 2;
const EXIT_BIND: i32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config_or_exit();
            run_master(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = load_config_or_exit();
            if !dr_master::cli::validate(&config) {
                std::process::exit(EXIT_CONFIG);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = load_config_or_exit();
            dr_master::cli::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("drover-master {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dr_master=debug")),
        )
        .json()
        .init();
}

fn load_config_or_exit() -> Config {
    match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    }
}

async fn run_master(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("drover master starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.is_error()) {
        std::process::exit(EXIT_CONFIG);
    }

    // ── Stores ───────────────────────────────────────────────────────
    let state_path = &config.storage.state_path;
    let (queue, history, campaigns) = match (
        QueueStore::new(state_path),
        ChatHistoryStore::new(state_path),
        CampaignStore::new(state_path),
    ) {
        (Ok(q), Ok(h), Ok(c)) => (Arc::new(q), Arc::new(h), Arc::new(c)),
        (q, h, c) => {
            for e in [q.err(), h.err(), c.err()].into_iter().flatten() {
                tracing::error!(error = %e, path = %state_path.display(), "store unusable");
            }
            std::process::exit(EXIT_STORE);
        }
    };
    tracing::info!("stores ready");

    // ── Worker fleet ─────────────────────────────────────────────────
    let mut rpcs: Vec<Arc<dyn WorkerRpc>> = Vec::new();
    for url in &config.fleet.worker_urls {
        let rpc = HttpWorkerRpc::new(url).context("building worker client")?;
        rpcs.push(Arc::new(rpc));
    }
    if rpcs.is_empty() {
        tracing::warn!(
            "no workers configured — batches will be admitted but nothing can dispatch"
        );
    } else {
        tracing::info!(workers = rpcs.len(), "worker fleet ready");
    }
    let pool = Arc::new(WorkerPool::new(rpcs));

    // ── API key (read once, hash for constant-time comparison) ───────
    let api_key_hash = match &config.auth.api_key {
        Some(key) => {
            tracing::info!("ingress API-key auth enabled");
            Some(api::auth::hash_key(key))
        }
        None => {
            tracing::warn!("ingress API-key auth DISABLED — set API_KEY to enable");
            None
        }
    };

    let state = AppState {
        config: config.clone(),
        queue: queue.clone(),
        history: history.clone(),
        campaigns: campaigns.clone(),
        pool,
        api_key_hash,
    };

    // ── Queue processor (500 ms tick) ────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let state = state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            processor::run(state, cancel).await;
        });
    }

    // ── Periodic store flush ─────────────────────────────────────────
    {
        let (queue, history, campaigns) =
            (queue.clone(), history.clone(), campaigns.clone());
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                for result in [queue.flush(), history.flush(), campaigns.flush()] {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "store flush failed");
                    }
                }
            }
        });
    }

    // ── HTTP surface ─────────────────────────────────────────────────
    let app = api::router(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(256));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "cannot bind ingress port");
            std::process::exit(EXIT_BIND);
        }
    };
    tracing::info!(addr = %addr, "drover master listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("master server error")?;

    // Drain: stop accepting ticks, then flush stores one last time.
    cancel.cancel();
    for result in [queue.flush(), history.flush(), campaigns.flush()] {
        if let Err(e) = result {
            tracing::warn!(error = %e, "final store flush failed");
        }
    }
    tracing::info!("drover master stopped");
    Ok(())
}
