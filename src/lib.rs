pub mod catalog;
pub mod error;
pub mod executor;
pub mod llm;
pub mod orderbook;
pub mod position_store;
pub mod rate_limiter;
pub mod strategy;
pub mod streamer;
pub mod utils;
pub mod venue;

pub use catalog::{CatalogClient, Market};
pub use error::{EngineError, EngineResult};
pub use executor::OrderExecutor;
pub use llm::SemanticMatcher;
pub use orderbook::{OrderBook, Side};
pub use position_store::{Position, PositionStore};
pub use rate_limiter::MultiTierRateLimiter;
pub use strategy::{Opportunity, Strategy, StrategyContext, StrategyRuntime};
pub use streamer::MarketStreamer;
pub use utils::{setup_tracing, Config, Credentials};
pub use venue::{ClobVenue, CrossVenue, VenueClient};

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[cfg(not(feature = "jemalloc"))]
#[global_allocator]
static GLOBAL: std::alloc::System = std::alloc::System;

const LLM_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Parser)]
#[command(name = "polyarb")]
#[command(about = "Multi-strategy prediction-market arbitrage engine", long_about = None)]
pub struct Cli {
    /// Built-in strategy to run.
    #[arg(long, conflicts_with = "strategy_path")]
    pub strategy: Option<String>,

    /// Out-of-tree strategy path (unsupported in compiled builds).
    #[arg(long)]
    pub strategy_path: Option<String>,

    /// Credential file for one account; repeat for multiple accounts.
    #[arg(long = "env")]
    pub env: Vec<PathBuf>,

    /// JSON object of extra strategy parameters.
    #[arg(long = "strategy-args")]
    pub strategy_args: Option<String>,

    /// Simulate fills without posting orders; venue surface is read-only.
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long, default_value = "INFO")]
    pub log_level: String,

    #[arg(long, value_enum, default_value = "size")]
    pub log_rotation: utils::LogRotation,
}

/// Builds every per-account component set, starts one strategy runtime per
/// account, and waits for all of them. Exit codes: 0 normal shutdown,
/// 1 configuration error, 2 strategy crashed.
pub async fn run(cli: Cli) -> EngineResult<()> {
    let config = Arc::new(
        Config::load().map_err(|e| EngineError::Configuration(format!("{:#}", e)))?,
    );

    setup_tracing(
        &cli.log_level,
        &config.monitoring.log_file,
        cli.log_rotation,
    );

    info!("🚀 Polyarb engine starting");
    if cli.dry_run {
        info!("🎮 DRY-RUN MODE - no real trades will be executed");
    } else {
        warn!("⚡ LIVE TRADING MODE - REAL MONEY AT RISK");
    }

    if cli.strategy_path.is_some() {
        return Err(EngineError::Configuration(
            "out-of-tree strategies are compiled in, not loaded at runtime; \
             implement the Strategy trait and register it, then use --strategy"
                .to_string(),
        ));
    }
    let strategy_name = cli.strategy.as_deref().ok_or_else(|| {
        EngineError::Configuration(format!(
            "--strategy is required; available: {}",
            strategy::STRATEGY_NAMES.join(", ")
        ))
    })?;

    let strategy_args: Option<serde_json::Value> = match &cli.strategy_args {
        Some(raw) => {
            let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
                EngineError::Configuration(format!("failed to parse --strategy-args: {}", e))
            })?;
            if !value.is_object() {
                return Err(EngineError::Configuration(
                    "--strategy-args must be a JSON object".to_string(),
                ));
            }
            Some(value)
        }
        None => None,
    };

    // One runtime per account env file; no env files means one runtime on
    // the process environment.
    let account_envs: Vec<Option<PathBuf>> = if cli.env.is_empty() {
        vec![None]
    } else {
        cli.env.iter().cloned().map(Some).collect()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(true);
    let mut handles = Vec::new();

    for env_path in account_envs {
        let credentials = match &env_path {
            Some(path) => Credentials::from_env_file(path)?,
            None => Credentials::from_process_env(),
        };
        credentials.validate(cli.dry_run)?;

        let strategy = strategy::build_strategy(strategy_name, strategy_args.as_ref())?;
        let runtime = build_runtime(
            config.clone(),
            credentials,
            strategy,
            cli.dry_run,
            shutdown_rx.clone(),
        )?;

        handles.push(tokio::spawn(runtime.run()));
    }

    info!("▶️ Launched {} strategy runtime(s)", handles.len());

    let mut all_runtimes = futures::future::join_all(handles);
    let results = tokio::select! {
        results = &mut all_runtimes => results,
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutting down gracefully...");
            let _ = shutdown_tx.send(false);
            all_runtimes.await
        }
    };

    let mut crashed = false;
    for result in results {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("🚨 Strategy runtime failed: {:#}", e);
                crashed = true;
            }
            Err(e) => {
                error!("🚨 Strategy runtime panicked: {}", e);
                crashed = true;
            }
        }
    }

    if crashed {
        Err(EngineError::CriticalHazard(
            "one or more strategy runtimes crashed".to_string(),
        ))
    } else {
        info!("👋 All strategies stopped");
        Ok(())
    }
}

/// Wires one account's component graph: rate-limited venue clients, the
/// catalog poller, executor, wallet-keyed position store, optional
/// semantic matcher, streamer, and the runtime that owns them.
fn build_runtime(
    config: Arc<Config>,
    credentials: Credentials,
    strategy: Arc<dyn Strategy>,
    dry_run: bool,
    shutdown: watch::Receiver<bool>,
) -> EngineResult<Arc<StrategyRuntime>> {
    let http_timeout = Duration::from_secs(config.execution.http_timeout_secs);
    let balance_timeout = Duration::from_secs(config.execution.balance_timeout_secs);

    let limiter = Arc::new(MultiTierRateLimiter::venue_default("primary"));
    let venue: Arc<dyn VenueClient> = Arc::new(ClobVenue::new(
        &config.server.clob_url,
        &config.server.rpc_url,
        credentials.clone(),
        dry_run,
        limiter,
        http_timeout,
        balance_timeout,
    )?);

    let cross_venue = match &credentials.secondary_venue_api_key {
        Some(api_key) => {
            let limiter = Arc::new(MultiTierRateLimiter::venue_default("secondary"));
            Some(Arc::new(CrossVenue::new(
                &config.server.secondary_venue_url,
                api_key,
                limiter,
                http_timeout,
            )?))
        }
        None => None,
    };

    let matcher = credentials.llm_api_key.as_ref().map(|key| {
        Arc::new(SemanticMatcher::new(
            &config.server.llm_url,
            key,
            LLM_MODEL,
            Duration::from_secs(45),
        ))
    });

    let wallet_short = utils::short_addr(&venue.get_address());
    let store_path = PathBuf::from(&config.trading.data_dir)
        .join(format!("positions_{}.json", wallet_short));
    let store = Arc::new(
        PositionStore::open(store_path)
            .map_err(|e| EngineError::Configuration(format!("position store: {}", e)))?,
    );

    let streamer = Arc::new(MarketStreamer::new(streamer::StreamerConfig {
        wss_url: config.server.wss_url.clone(),
        connect_timeout: Duration::from_secs(config.execution.ws_connect_timeout_secs),
        max_retries: config.execution.max_retries,
        max_silence: Duration::from_secs(config.execution.max_silence_secs),
        max_reconnect_delay: Duration::from_secs(config.execution.max_reconnect_delay_secs),
    }));

    let estimated_fee = credentials
        .default_slippage
        .unwrap_or(config.trading.estimated_fee);

    let ctx = Arc::new(StrategyContext {
        config: config.clone(),
        credentials: Arc::new(credentials),
        venue,
        cross_venue,
        catalog: Arc::new(CatalogClient::new(&config.server.catalog_url, http_timeout)),
        executor: Arc::new(OrderExecutor::new(dry_run)),
        store,
        matcher,
        dry_run,
        estimated_fee,
        stats: Arc::new(strategy::StrategyStats::default()),
    });

    Ok(Arc::new(StrategyRuntime::new(
        strategy, ctx, streamer, shutdown,
    )))
}
