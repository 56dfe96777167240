//! Cabinet daemon: opens both stores and runs the reconciliation sweep.

use anyhow::{Context, Result};
use cabinet_core::config::{AppConfig, LogFormat};
use cabinet_server::{AppState, run_sweep};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Cabinet - multi-tenant file hosting engine
#[derive(Parser, Debug)]
#[command(name = "cabinetd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "CABINET_CONFIG",
        default_value = "config/cabinet.toml"
    )]
    config: String,

    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,

    /// Report what the sweep would remove without removing it
    #[arg(long)]
    dry_run: bool,
}

fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        figment = figment.merge(Toml::file(path));
    }
    figment
        .merge(Env::prefixed("CABINET_").split("__"))
        .extract()
        .context("failed to load configuration")
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if args.dry_run {
        config.sweep.dry_run = true;
    }
    init_tracing(config.log.format);

    tracing::info!("Cabinet v{}", env!("CARGO_PKG_VERSION"));
    if std::path::Path::new(&args.config).exists() {
        tracing::info!(config_path = %args.config, "loaded configuration file");
    } else {
        tracing::debug!("no config file found at {}, using defaults and environment", args.config);
    }

    cabinet_server::metrics::register_metrics();

    let state = AppState::init(config)
        .await
        .context("failed to initialize application state")?;
    let sweep = state.config.sweep.clone();

    if args.once {
        let result = run_sweep(&state, &sweep).await;
        state.shutdown().await;
        let stats = result.context("sweep failed")?;
        tracing::info!(?stats, "single sweep done");
        tracing::debug!(metrics = %cabinet_server::metrics::gather_metrics(), "final metrics");
        return Ok(());
    }

    if !sweep.enabled {
        tracing::warn!("sweep disabled in configuration, nothing to do");
        state.shutdown().await;
        return Ok(());
    }

    tracing::info!(interval_secs = sweep.interval_secs, "periodic sweep enabled");
    let mut ticker = tokio::time::interval(sweep.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Failures are logged and metered by the sweep; the next tick retries
                if let Err(e) = run_sweep(&state, &sweep).await {
                    tracing::warn!(error = %e, "sweep failed, retrying next interval");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    state.shutdown().await;
    Ok(())
}
