//! Beacon Node
//!
//! Runs a randomness beacon generator, a pulse store, or both.
//!
//! Usage:
//!   beacon-node [OPTIONS]
//!
//! See `beacon-node --help` for every option; each one can also be set
//! through its `BEACON_*` environment variable.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use beacon_node::{
    api::{self, events::EventLog, AppState},
    config::{BeaconConfig, Mode},
    crypto::{KeypairSigner, RemoteSigner, Signer},
    entropy::EntropyPool,
    scheduler::Scheduler,
    storage::{PulseSink, PulseStore},
    transport::{self, CommandClient},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = BeaconConfig::parse();
    config.validate().context("invalid configuration")?;

    println!(r#"
    ╔═══════════════════════════════════════════════════════════╗
    ║                                                           ║
    ║   🎲  BEACON NODE                                         ║
    ║       Signed, chained public randomness                   ║
    ║                                                           ║
    ╚═══════════════════════════════════════════════════════════╝
    "#);

    info!("Starting Beacon Node...");
    info!("  Mode: {:?}", config.mode);
    info!("  Data Dir: {}", config.data_dir.display());
    info!("  Period: {}ms", config.period_ms);
    info!("  Skip list: {} x {} layers", config.layer_size, config.num_layers);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("🛑 Termination signal received");
        let _ = shutdown_tx.send(true);
    });

    match config.mode {
        Mode::Standalone => run_standalone(&config, shutdown_rx).await,
        Mode::Generator => run_generator(&config, shutdown_rx).await,
        Mode::Storage => run_storage(&config, shutdown_rx).await,
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();
}

async fn load_signer(config: &BeaconConfig) -> anyhow::Result<Arc<dyn Signer>> {
    let signer: Arc<dyn Signer> = match &config.signer_url {
        Some(url) => Arc::new(
            RemoteSigner::connect(url, config.signing_timeout())
                .await
                .context("connecting to the signing module")?,
        ),
        None => Arc::new(
            KeypairSigner::load_or_generate(config.key_path()).context("loading the signing key")?,
        ),
    };
    info!("  Certificate: {}...", signer.certificate_id().short());
    Ok(signer)
}

fn open_store(config: &BeaconConfig) -> anyhow::Result<Arc<PulseStore>> {
    let store = PulseStore::open(config.store_path()).context("opening the pulse store")?;
    Ok(Arc::new(store))
}

async fn build_scheduler(config: &BeaconConfig, sink: Arc<dyn PulseSink>) -> anyhow::Result<Scheduler> {
    let signer = load_signer(config).await?;
    let scheduler = Scheduler::new(
        config.timings()?,
        config.builder()?,
        signer,
        EntropyPool::local(),
        sink,
        config.signing_timeout(),
    )?;
    Ok(scheduler)
}

/// Generator, store and read API in one process.
async fn run_standalone(config: &BeaconConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let events = EventLog::new();
    let mut scheduler = build_scheduler(config, store.clone()).await?.with_events(events.clone());

    let state = AppState { store: store.clone(), events };
    let addr = config.api_addr();
    tokio::spawn(async move {
        if let Err(e) = api::start_server(state, &addr).await {
            error!("API server failed: {}", e);
        }
    });

    scheduler.run(shutdown).await.context("scheduler failed")?;
    store.flush()?;
    info!("👋 Beacon node stopped");
    Ok(())
}

/// Generator sending pulses to a remote storage server.
async fn run_generator(config: &BeaconConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let client = CommandClient::connect(&config.storage_addr)
        .await
        .with_context(|| format!("connecting to storage at {}", config.storage_addr))?;
    info!("📡 Connected to storage at {}", config.storage_addr);

    let mut scheduler = build_scheduler(config, Arc::new(client)).await?;
    scheduler.run(shutdown).await.context("scheduler failed")?;
    info!("👋 Generator stopped");
    Ok(())
}

/// Storage server: command transport plus read API.
async fn run_storage(config: &BeaconConfig, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let listener = tokio::net::TcpListener::bind(config.command_addr())
        .await
        .with_context(|| format!("binding {}", config.command_addr()))?;

    let state = AppState { store: store.clone(), events: EventLog::new() };
    let addr = config.api_addr();

    tokio::select! {
        result = transport::serve(listener, store.clone()) => {
            result.context("command transport failed")?;
        }
        result = api::start_server(state, &addr) => {
            result.context("API server failed")?;
        }
        _ = shutdown.changed() => {}
    }

    store.flush()?;
    info!("👋 Storage server stopped");
    Ok(())
}
