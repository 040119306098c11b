use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dr_chatwire::fake::FakeService;
use dr_chatwire::{Dialer, ProxyEndpoint, StaticProxyPool};
use dr_domain::config::{Config, ConfigSeverity};
use dr_store::{AccountStore, SessionFiles};
use dr_worker::api;
use dr_worker::cli::{Cli, Command, ConfigCommand};
use dr_worker::humanizer::PauseRange;
use dr_worker::runtime::{RuntimeConfig, WorkerRuntime};
use dr_worker::state::WorkerState;
use dr_worker::warmup::WARMUP_SWEEP_SECS;

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
            run_worker(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = load_config_or_exit();
            if !dr_worker::cli::validate(&config) {
                std::process::exit(EXIT_CONFIG);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = load_config_or_exit();
            dr_worker::cli::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("drover-worker {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dr_worker=debug")),
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

async fn run_worker(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("drover worker starting");

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
    let files = match SessionFiles::new(&config.storage.sessions_path) {
        Ok(files) => Arc::new(files),
        Err(e) => {
            tracing::error!(error = %e, path = %config.storage.sessions_path.display(), "session store unusable");
            std::process::exit(EXIT_STORE);
        }
    };
    let accounts = match AccountStore::new(&config.storage.state_path) {
        Ok(accounts) => Arc::new(accounts),
        Err(e) => {
            tracing::error!(error = %e, path = %config.storage.state_path.display(), "account store unusable");
            std::process::exit(EXIT_STORE);
        }
    };
    tracing::info!("stores ready");

    // ── Proxy pool ───────────────────────────────────────────────────
    let endpoints: Vec<ProxyEndpoint> = config
        .proxy
        .endpoints
        .iter()
        .enumerate()
        .map(|(i, addr)| ProxyEndpoint {
            id: format!("p{}", i + 1),
            addr: addr.clone(),
        })
        .collect();
    if endpoints.is_empty() {
        tracing::info!("no PROXY_LIST configured, sessions connect directly");
    } else {
        tracing::info!(proxies = endpoints.len(), "proxy pool ready");
    }
    let proxies = Arc::new(StaticProxyPool::new(endpoints));

    // ── Chat adapter ─────────────────────────────────────────────────
    // The vendor wire-protocol adapter is linked in at this seam. Without
    // one, the in-memory loopback keeps the worker runnable for
    // development and tests.
    let dialer: Arc<dyn Dialer> = Arc::new(FakeService::new());
    tracing::warn!("no vendor chat adapter linked — using in-memory loopback (development only)");

    // ── Runtime ──────────────────────────────────────────────────────
    let runtime = WorkerRuntime::new(
        dialer,
        proxies,
        files,
        accounts.clone(),
        RuntimeConfig {
            pacing: config.pacing.clone(),
            slot_count: config.worker.slots_per_identity,
            warmup_external: config.warmup.external_targets.clone(),
            pause: PauseRange::default(),
        },
    );
    runtime
        .startup(chrono::Utc::now())
        .await
        .context("scanning session stores")?;

    // ── Periodic account flush ───────────────────────────────────────
    {
        let accounts = accounts.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                if let Err(e) = accounts.flush() {
                    tracing::warn!(error = %e, "account store flush failed");
                }
            }
        });
    }

    // ── Internal warmup sweep (30 min) ───────────────────────────────
    {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(WARMUP_SWEEP_SECS));
            loop {
                interval.tick().await;
                runtime.warmup_sweep(chrono::Utc::now()).await;
            }
        });
    }

    // ── HTTP surface ─────────────────────────────────────────────────
    let state = WorkerState {
        runtime: runtime.clone(),
    };
    let app = api::router(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(64));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "cannot bind worker port");
            std::process::exit(EXIT_BIND);
        }
    };
    tracing::info!(addr = %addr, "drover worker listening");

    let shutdown_runtime = runtime.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("worker server error")?;

    shutdown_runtime.shutdown().await;
    tracing::info!("drover worker stopped");
    Ok(())
}
