use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use bridge_cli::process_engine::ConfiguredEngineRouter;
use bridge_core::ApiClient;
use bridge_core::BridgeConfig;
use bridge_core::DispatchLoop;
use bridge_core::PgEventQueue;
use bridge_core::RunOrchestrator;
use bridge_core::SessionRegistry;
use bridge_core::client::RemoteApi;
use bridge_core::queue::EventQueue;
use clap::Parser;
use tracing::error;
use tracing::info;

/// Pause before reconnecting after the dispatch loop hits a storage error.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "agent-bridge", about = "Bridge gateway webhook events to an engine")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "bridge.toml")]
    config: PathBuf,

    /// Engine to use, overriding `default_engine` from the config.
    #[arg(long)]
    engine: Option<String>,
}

fn setup_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    let mut config = BridgeConfig::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    if let Some(engine) = cli.engine {
        anyhow::ensure!(
            config.engines.contains_key(&engine),
            "engine {engine:?} has no [engines.{engine}] entry in the config",
        );
        config.default_engine = Some(engine);
    }

    let api = Arc::new(
        ApiClient::new(
            &config.api_token,
            &config.api_url,
            config.rate_limit.max_requests,
            config.rate_limit.window(),
        )
        .context("building API client")?,
    );
    let viewer = api
        .get_viewer()
        .await
        .context("API auth check failed (is the token valid?)")?;
    info!(
        viewer = viewer["name"].as_str().unwrap_or("unknown"),
        api_url = config.api_url,
        "authenticated against remote API"
    );

    let queue = Arc::new(
        PgEventQueue::connect(&config.queue_url, &config.source, config.batch_size)
            .await
            .context("connecting to the gateway queue")?,
    );
    info!(source = config.source, batch_size = config.batch_size, "connected to gateway queue");

    let engines: HashMap<String, Vec<String>> = config
        .engines
        .iter()
        .map(|(name, engine)| (name.clone(), engine.command.clone()))
        .collect();
    let router = Arc::new(ConfiguredEngineRouter::new(engines));
    let orchestrator = Arc::new(RunOrchestrator::new(
        Arc::clone(&api) as Arc<dyn RemoteApi>,
        router,
        config.default_engine.clone(),
    ));
    let dispatch = Arc::new(DispatchLoop::new(
        queue as Arc<dyn EventQueue>,
        api as Arc<dyn RemoteApi>,
        Arc::new(SessionRegistry::new()),
        orchestrator,
        config.poll_interval(),
        config.projects.clone(),
    ));

    tokio::select! {
        () = run_with_retries(dispatch) => Ok(()),
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for shutdown signal")?;
            info!("shutting down");
            Ok(())
        }
    }
}

/// The dispatch loop only returns on queue storage errors; log and re-enter
/// after a pause rather than dying on a transient database hiccup.
async fn run_with_retries(dispatch: Arc<DispatchLoop>) {
    loop {
        if let Err(err) = Arc::clone(&dispatch).run().await {
            error!(%err, retry_in_secs = RETRY_INTERVAL.as_secs(), "dispatch loop failed");
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}
