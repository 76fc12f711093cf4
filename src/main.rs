//! DUSTER — Cross-Chain Dust Consolidation Engine
//!
//! Entry point. Loads configuration, initialises structured logging and
//! the SQLite-backed store/queue, wires the oracle, aggregators, and
//! settlement boundary into the orchestrator, and runs the worker +
//! scheduler loop with graceful shutdown and a bounded drain.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use duster::aggregators::jupiter::JupiterAggregator;
use duster::aggregators::lifi::LiFiAggregator;
use duster::aggregators::metadata::TokenMetadataCache;
use duster::aggregators::zerox::ZeroExAggregator;
use duster::aggregators::{QuoteAggregator, QuoteSelector};
use duster::config::AppConfig;
use duster::gate::{AllowAllVerifier, PaymentGate};
use duster::oracle::sources::{CoinGeckoSource, DexScreenerSource, JupiterPriceSource, PriceSource};
use duster::oracle::{OracleSettings, PriceOracle};
use duster::orchestrator::jobs::EngineJobHandler;
use duster::orchestrator::{OrchestratorSettings, SweepOrchestrator};
use duster::queue::JobQueue;
use duster::settlement::RpcSettlement;
use duster::storage::Store;
use duster::types::Chain;

const BANNER: &str = r#"
 ____  _   _ ____ _____ _____ ____
|  _ \| | | / ___|_   _| ____|  _ \
| | | | | | \___ \ | | |  _| | |_) |
| |_| | |_| |___) || | | |___|  _ <
|____/ \___/|____/ |_| |_____|_| \_\

  Dust Unified Sweep & Transfer Execution Runtime
  v0.1.0 — Sweep Engine Worker
"#;

/// Jobs claimed per worker pass.
const WORKER_BATCH: u32 = 16;

/// Worker passes allowed to flush in-flight jobs at shutdown.
const DRAIN_PASSES: u32 = 20;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let cfg = AppConfig::load("config.toml")?;

    // Initialise structured logging
    init_logging();

    println!("{BANNER}");
    info!(
        service = %cfg.service.name,
        tick_interval_secs = cfg.service.tick_interval_secs,
        dust_threshold_usd = %cfg.service.dust_threshold_usd,
        "DUSTER starting up"
    );

    // -- Storage and queue ------------------------------------------------

    let connect_options = sqlx::sqlite::SqliteConnectOptions::from_str(&cfg.database.url)
        .context("Invalid database URL")?
        .create_if_missing(true);
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect_with(connect_options)
        .await
        .context("Failed to open database")?;

    let store = Arc::new(Store::new(pool.clone()));
    store.migrate().await?;
    let queue = Arc::new(JobQueue::new(pool, &cfg.queue));
    queue.migrate().await?;

    // -- Price oracle -----------------------------------------------------

    let mut sources: Vec<Arc<dyn PriceSource>> = Vec::new();
    if cfg.oracle.coingecko.enabled {
        let key = cfg
            .oracle
            .coingecko
            .api_key_env
            .as_deref()
            .and_then(|env| std::env::var(env).ok());
        sources.push(Arc::new(CoinGeckoSource::new(key)?));
    }
    if cfg.oracle.dexscreener.enabled {
        sources.push(Arc::new(DexScreenerSource::new()?));
    }
    if cfg.oracle.jupiter.enabled {
        sources.push(Arc::new(JupiterPriceSource::new()?));
    }
    info!(sources = sources.len(), "Price sources configured");
    let oracle = Arc::new(PriceOracle::new(
        sources,
        OracleSettings::from_config(&cfg.oracle),
    ));

    // -- Quote aggregators ------------------------------------------------

    let mut adapters: Vec<Arc<dyn QuoteAggregator>> = Vec::new();
    if cfg.aggregators.zerox.enabled {
        let key_env = cfg
            .aggregators
            .zerox
            .api_key_env
            .as_deref()
            .unwrap_or("ZEROX_API_KEY");
        adapters.push(Arc::new(ZeroExAggregator::new(
            AppConfig::resolve_env(key_env)?,
            oracle.clone(),
            cfg.aggregators.quote_ttl_secs,
        )?));
    }
    if cfg.aggregators.jupiter.enabled {
        adapters.push(Arc::new(JupiterAggregator::new(
            oracle.clone(),
            cfg.aggregators.quote_ttl_secs,
        )?));
    }
    if cfg.aggregators.lifi.enabled {
        adapters.push(Arc::new(LiFiAggregator::new(cfg.aggregators.quote_ttl_secs)?));
    }
    info!(adapters = adapters.len(), "Quote aggregators configured");

    let metadata = Arc::new(TokenMetadataCache::new()?);
    let selector = Arc::new(QuoteSelector::new(adapters, oracle.clone(), metadata));

    // -- Settlement boundary ----------------------------------------------

    let mut rpc_urls: HashMap<Chain, String> = HashMap::new();
    for chain_cfg in cfg.enabled_evm_chains() {
        let url = match &chain_cfg.api_key_env {
            Some(env) => format!("{}/{}", chain_cfg.rpc_url, AppConfig::resolve_env(env)?),
            None => chain_cfg.rpc_url.clone(),
        };
        rpc_urls.insert(chain_cfg.chain, url);
    }
    if cfg.chains.solana.enabled {
        rpc_urls.insert(Chain::Solana, cfg.chains.solana.rpc_url.clone());
    }
    let settlement = Arc::new(RpcSettlement::new(rpc_urls)?);

    // -- Orchestrator and worker ------------------------------------------

    let gate = Arc::new(PaymentGate::new(
        Arc::new(AllowAllVerifier),
        cfg.gate.enabled,
    ));
    let settings = OrchestratorSettings::from_config(&cfg.queue, &cfg.aggregators);

    let orchestrator = SweepOrchestrator::new(
        store.clone(),
        queue.clone(),
        selector,
        gate.clone(),
        settings.clone(),
    );
    let handler = EngineJobHandler::new(
        store.clone(),
        queue.clone(),
        settlement,
        oracle.clone(),
        settings,
    );

    // -- Main loop --------------------------------------------------------

    let mut worker_interval =
        tokio::time::interval(Duration::from_millis(cfg.queue.poll_interval_ms));
    let mut scheduler_interval =
        tokio::time::interval(Duration::from_secs(cfg.service.tick_interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Entering worker loop. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = worker_interval.tick() => {
                match queue.run_due(&handler, WORKER_BATCH).await {
                    Ok(ran) if ran > 0 => debug!(ran, "Worker pass complete"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Worker pass failed"),
                }
            }
            _ = scheduler_interval.tick() => {
                if let Err(e) = orchestrator.tick().await {
                    error!(error = %e, "Scheduler tick failed");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    // Bounded drain so an in-flight execution job is not cut mid-broadcast.
    for _ in 0..DRAIN_PASSES {
        match queue.run_due(&handler, WORKER_BATCH).await {
            Ok(0) => break,
            Ok(ran) => debug!(ran, "Drained jobs"),
            Err(e) => {
                error!(error = %e, "Drain pass failed");
                break;
            }
        }
    }

    info!("DUSTER shut down cleanly.");
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("duster=info"));

    let json_logging = std::env::var("DUSTER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
