//! Strategy trait, runtime loops, and the static strategy registry.
//!
//! One `StrategyRuntime` owns one strategy instance bound to one account.
//! Three cooperative loops run concurrently per runtime: scan (find and
//! enter opportunities), monitor (exit checks every 30s, including the
//! streamer's force-exit flag), and stats (counters every 10 minutes).
//! The launcher in `lib.rs` starts N runtimes, one per account env file.

pub mod calendar;
pub mod cross_platform;
pub mod extreme_price;
pub mod spread;

pub use calendar::CalendarArbitrageStrategy;
pub use cross_platform::CrossPlatformStrategy;
pub use extreme_price::ExtremePriceStrategy;
pub use spread::SpreadArbitrageStrategy;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::catalog::{CatalogClient, VenueTag};
use crate::error::{EngineError, EngineResult};
use crate::executor::OrderExecutor;
use crate::llm::SemanticMatcher;
use crate::orderbook::Side;
use crate::position_store::{Position, PositionLeg, PositionStatus, PositionStore};
use crate::streamer::{MarketStreamer, UpdateHandler};
use crate::utils::{short_addr, Config, Credentials};
use crate::venue::{CrossVenue, VenueClient};

// =============================================================================
// Opportunity
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpportunityKind {
    ExtremePrice,
    CalendarPair,
    CrossPlatformPair,
    SpreadEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityLeg {
    pub token_id: String,
    pub side: Side,
    pub limit_price: Decimal,
    pub size: Decimal,
    pub venue: VenueTag,
}

/// Immutable record proposed by a detector and consumed within the same
/// scan pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub kind: OpportunityKind,
    pub question: String,
    pub legs: Vec<OpportunityLeg>,
    /// Derived exit target for single-leg entries.
    pub target_price: Option<Decimal>,
    /// Sum of leg limit prices (per unit).
    pub total_cost: Decimal,
    pub expected_profit: Decimal,
    pub annualized_roi: Option<Decimal>,
    pub days_until_close: Option<Decimal>,
    /// Stable hash of participating tokens; dedup key across scans.
    pub fingerprint: String,
}

impl Opportunity {
    /// Stable fingerprint over the participating tokens.
    pub fn fingerprint_for<S: AsRef<str>>(token_ids: &[S]) -> String {
        let mut hasher = Sha256::new();
        for token in token_ids {
            hasher.update(token.as_ref().as_bytes());
            hasher.update(b":");
        }
        hex::encode(hasher.finalize())[..16].to_string()
    }
}

impl std::fmt::Display for Opportunity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} [{}]: cost ${:.4}, profit ${:.4}",
            self.kind,
            self.question.chars().take(40).collect::<String>(),
            self.total_cost,
            self.expected_profit
        )
    }
}

// =============================================================================
// Context shared by detectors, executor and runtime
// =============================================================================

#[derive(Default)]
pub struct StrategyStats {
    pub scans: AtomicU64,
    pub opportunities_found: AtomicU64,
    pub entered: AtomicU64,
    pub exited: AtomicU64,
    pub total_pnl: RwLock<Decimal>,
}

impl StrategyStats {
    pub fn record_pnl(&self, pnl: Decimal) {
        *self.total_pnl.write() += pnl;
    }
}

pub struct StrategyContext {
    pub config: Arc<Config>,
    pub credentials: Arc<Credentials>,
    pub venue: Arc<dyn VenueClient>,
    pub cross_venue: Option<Arc<CrossVenue>>,
    pub catalog: Arc<CatalogClient>,
    pub executor: Arc<OrderExecutor>,
    pub store: Arc<PositionStore>,
    pub matcher: Option<Arc<SemanticMatcher>>,
    pub dry_run: bool,
    pub estimated_fee: Decimal,
    pub stats: Arc<StrategyStats>,
}

impl StrategyContext {
    pub fn secondary(&self) -> Option<Arc<dyn VenueClient>> {
        self.cross_venue
            .clone()
            .map(|v| v as Arc<dyn VenueClient>)
    }

    pub fn venue_for(&self, tag: VenueTag) -> EngineResult<Arc<dyn VenueClient>> {
        match tag {
            VenueTag::Primary => Ok(self.venue.clone()),
            VenueTag::Secondary => self.secondary().ok_or_else(|| {
                EngineError::Configuration("secondary venue not configured".to_string())
            }),
        }
    }
}

// =============================================================================
// Strategy trait
// =============================================================================

#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn scan_interval(&self) -> Duration;

    /// Cold pass over a fresh market catalog and order books.
    async fn scan(&self, ctx: &StrategyContext) -> Result<Vec<Opportunity>>;

    /// Warm sanity check: balance, liquidity, not-already-open.
    async fn should_enter(&self, ctx: &StrategyContext, opp: &Opportunity) -> Result<bool>;

    /// Re-evaluate an open position against current books.
    async fn should_exit(&self, ctx: &StrategyContext, position: &Position) -> Result<bool>;

    /// Single-leg default; two-leg strategies override to drive atomic
    /// execution.
    async fn enter_position(&self, ctx: &StrategyContext, opp: &Opportunity) -> Result<bool> {
        enter_single_leg(self.name(), ctx, opp).await
    }

    async fn exit_position(&self, ctx: &StrategyContext, position: &Position) -> Result<bool> {
        exit_single_leg(ctx, position).await
    }
}

/// Default single-leg entry: one BUY, then persist the position (disk
/// before memory) and count it.
pub async fn enter_single_leg(
    strategy_name: &str,
    ctx: &StrategyContext,
    opp: &Opportunity,
) -> Result<bool> {
    let Some(leg) = opp.legs.first() else {
        warn!("Opportunity without legs: {}", opp.fingerprint);
        return Ok(false);
    };

    info!(
        "🎯 Entering position: {}",
        opp.question.chars().take(50).collect::<String>()
    );
    info!("   {} units @ ${:.4}", leg.size, leg.limit_price);

    let venue = ctx.venue_for(leg.venue)?;
    let report = ctx
        .executor
        .execute(
            &venue,
            &leg.token_id,
            leg.side,
            leg.size,
            leg.limit_price,
            crate::venue::OrderType::Gtc,
        )
        .await;

    if !report.success {
        return Ok(false);
    }

    let position = Position {
        group_id: opp.fingerprint.clone(),
        strategy_name: strategy_name.to_string(),
        question: opp.question.clone(),
        legs: vec![PositionLeg {
            token_id: leg.token_id.clone(),
            side: leg.side,
            entry_price: report.avg_fill_price,
            size: report.filled_size,
            venue: leg.venue,
        }],
        entry_time: Utc::now(),
        target_price: opp.target_price,
        status: PositionStatus::Open,
        force_exit: false,
    };

    ctx.store.add(position)?;
    ctx.stats.entered.fetch_add(1, Ordering::Relaxed);
    info!("✅ Position entered successfully (size: {})", report.filled_size);
    Ok(true)
}

/// Default single-leg exit: sell at best bid, then drop the position
/// (memory before disk) and book the P&L.
pub async fn exit_single_leg(ctx: &StrategyContext, position: &Position) -> Result<bool> {
    let Some(leg) = position.legs.first() else {
        return Ok(false);
    };

    info!(
        "🚪 Exiting position: {}",
        position.question.chars().take(50).collect::<String>()
    );

    ctx.store
        .update(&leg.token_id, |p| p.status = PositionStatus::Exiting);

    let venue = ctx.venue_for(leg.venue)?;
    let (report, pnl) = ctx
        .executor
        .exit_single(&venue, &leg.token_id, leg.entry_price, leg.size, None)
        .await?;

    if report.success {
        ctx.store.remove(&leg.token_id);
        ctx.stats.exited.fetch_add(1, Ordering::Relaxed);
        if let Some(pnl) = pnl {
            ctx.stats.record_pnl(pnl.pnl);
            info!("✅ Position exited: ${:.2} ({:+.1}%)", pnl.pnl, pnl.pnl_pct);
        }
        Ok(true)
    } else {
        ctx.store
            .update(&leg.token_id, |p| p.status = PositionStatus::Open);
        warn!("Failed to close position in executor");
        Ok(false)
    }
}

/// Shared two-leg entry driver: runs the executor's atomic path and turns
/// the outcome into position-store state. Both legs filled → persist the
/// pair (disk before memory); a failed rollback → persist a `Failed`
/// position for manual reconciliation; everything else → no position.
pub async fn enter_pair(
    strategy_name: &str,
    group_id: &str,
    ctx: &StrategyContext,
    opp: &Opportunity,
    max_total_cost: Decimal,
) -> Result<bool> {
    use crate::executor::{LegPlan, PairOutcome};

    let plan = |leg: &OpportunityLeg| -> Result<LegPlan> {
        Ok(LegPlan {
            venue: ctx.venue_for(leg.venue)?,
            venue_tag: leg.venue,
            token_id: leg.token_id.clone(),
            side: leg.side,
            price: leg.limit_price,
            size: leg.size,
        })
    };

    let outcome = ctx
        .executor
        .enter_two_leg(
            group_id,
            plan(&opp.legs[0])?,
            plan(&opp.legs[1])?,
            max_total_cost,
        )
        .await;

    match outcome {
        PairOutcome::Entered { fill_a, fill_b } => {
            let legs = vec![
                PositionLeg {
                    token_id: opp.legs[0].token_id.clone(),
                    side: opp.legs[0].side,
                    entry_price: fill_a.avg_fill_price,
                    size: fill_a.filled_size,
                    venue: opp.legs[0].venue,
                },
                PositionLeg {
                    token_id: opp.legs[1].token_id.clone(),
                    side: opp.legs[1].side,
                    entry_price: fill_b.avg_fill_price,
                    size: fill_b.filled_size,
                    venue: opp.legs[1].venue,
                },
            ];
            let position = Position {
                group_id: group_id.to_string(),
                strategy_name: strategy_name.to_string(),
                question: opp.question.clone(),
                legs,
                entry_time: Utc::now(),
                target_price: None,
                status: PositionStatus::Open,
                force_exit: false,
            };

            ctx.store.add(position)?;
            ctx.stats.entered.fetch_add(1, Ordering::Relaxed);
            info!("✅ Both legs filled ({})", group_id);
            Ok(true)
        }
        PairOutcome::Aborted { reason } => {
            warn!("⚠️ Entry aborted for {}: {}", group_id, reason);
            Ok(false)
        }
        PairOutcome::RolledBack { orphan_token } => {
            warn!(
                "Rolled back orphan leg {} for {}",
                short_addr(&orphan_token),
                group_id
            );
            Ok(false)
        }
        PairOutcome::CriticalOrphan { orphan, fill, error } => {
            error!(
                "🚨 CRITICAL: rollback failed for {} ({}): {}",
                group_id, orphan.token_id, error
            );
            let failed = Position {
                group_id: group_id.to_string(),
                strategy_name: strategy_name.to_string(),
                question: opp.question.clone(),
                legs: vec![PositionLeg {
                    token_id: orphan.token_id,
                    side: orphan.side,
                    entry_price: fill.avg_fill_price,
                    size: fill.filled_size,
                    venue: orphan.venue_tag,
                }],
                entry_time: Utc::now(),
                target_price: None,
                status: PositionStatus::Failed,
                force_exit: false,
            };
            ctx.store.add(failed)?;
            Ok(false)
        }
        PairOutcome::BothFailed { error_a, error_b } => {
            error!("❌ Both legs failed: {} | {}", error_a, error_b);
            Ok(false)
        }
    }
}

/// Shared two-leg exit driver: sells both legs concurrently at their best
/// bids. A split outcome marks the position failed for manual attention;
/// a double failure leaves it open for the next monitor tick.
pub async fn exit_pair(ctx: &StrategyContext, position: &Position) -> Result<bool> {
    use crate::executor::LegPlan;

    if position.legs.len() < 2 {
        return exit_single_leg(ctx, position).await;
    }

    let token = position.legs[0].token_id.clone();
    ctx.store
        .update(&token, |p| p.status = PositionStatus::Exiting);

    let plan = |leg: &PositionLeg| -> Result<LegPlan> {
        Ok(LegPlan {
            venue: ctx.venue_for(leg.venue)?,
            venue_tag: leg.venue,
            token_id: leg.token_id.clone(),
            side: leg.side,
            price: leg.entry_price,
            size: leg.size,
        })
    };

    let (result_a, result_b) = ctx
        .executor
        .exit_two_leg(
            &position.group_id,
            plan(&position.legs[0])?,
            plan(&position.legs[1])?,
        )
        .await;

    match (result_a.success, result_b.success) {
        (true, true) => {
            let entries: Vec<(Decimal, Decimal)> = position
                .legs
                .iter()
                .map(|l| (l.entry_price, l.size))
                .collect();
            let exits = vec![
                (result_a.avg_fill_price, result_a.filled_size),
                (result_b.avg_fill_price, result_b.filled_size),
            ];
            let fees = Decimal::from(2) * ctx.estimated_fee * position.legs[0].size;
            let pnl = OrderExecutor::pair_pnl(&entries, &exits, fees);

            ctx.store.remove(&token);
            ctx.stats.exited.fetch_add(1, Ordering::Relaxed);
            ctx.stats.record_pnl(pnl);
            info!(
                "✅ Successfully exited both legs of {} (P&L ${:.2})",
                position.group_id, pnl
            );
            Ok(true)
        }
        (false, false) => {
            ctx.store
                .update(&token, |p| p.status = PositionStatus::Open);
            error!("❌ Both exit legs failed for {}", position.group_id);
            Ok(false)
        }
        _ => {
            let hazard = EngineError::PartialFillHazard {
                group_id: position.group_id.clone(),
                detail: "one exit leg filled, the other failed".to_string(),
            };
            error!("🚨 {} - manual intervention required", hazard);
            ctx.store
                .update(&token, |p| p.status = PositionStatus::Failed);
            Ok(false)
        }
    }
}

// =============================================================================
// Penny defense
// =============================================================================

/// Handler the runtime registers with the streamer: when an inbound tick
/// shows the market bidding through a leg's entry price, flag the position
/// for immediate exit. The monitor loop picks the flag up within one tick.
pub fn penny_defense_handler(store: Arc<PositionStore>) -> UpdateHandler {
    Arc::new(move |token_id, update| {
        let store = store.clone();
        Box::pin(async move {
            let Some(best_bid) = update.best_bid else {
                return;
            };
            let Some(position) = store.get(&token_id) else {
                return;
            };
            if position.status != PositionStatus::Open || position.force_exit {
                return;
            }
            let Some(leg) = position.legs.iter().find(|l| l.token_id == token_id) else {
                return;
            };
            if leg.side == Side::Buy && best_bid > leg.entry_price {
                warn!(
                    "🚨 PENNY DEFENSE: {} was out-bid: ${:.4} → ${:.4}, flagging force exit",
                    short_addr(&token_id),
                    leg.entry_price,
                    best_bid
                );
                store.update(&token_id, |p| p.force_exit = true);
            }
        })
    })
}

// =============================================================================
// Runtime
// =============================================================================

pub struct StrategyRuntime {
    strategy: Arc<dyn Strategy>,
    ctx: Arc<StrategyContext>,
    streamer: Arc<MarketStreamer>,
    shutdown: watch::Receiver<bool>,
    seen_opportunities: Mutex<HashSet<String>>,
    label: String,
}

impl StrategyRuntime {
    pub fn new(
        strategy: Arc<dyn Strategy>,
        ctx: Arc<StrategyContext>,
        streamer: Arc<MarketStreamer>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let label = format!(
            "{}_{}",
            strategy.name(),
            short_addr(&ctx.venue.get_address())
        );
        Self {
            strategy,
            ctx,
            streamer,
            shutdown,
            seen_opportunities: Mutex::new(HashSet::new()),
            label,
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mode = if self.ctx.dry_run { "DRY-RUN" } else { "LIVE" };
        info!("🤖 Initializing {} - {}", self.label, mode);

        match self.ctx.venue.get_balance(false).await {
            Ok(balance) => info!("💰 Balance: ${:.2} USDC", balance),
            Err(e) => warn!("Could not fetch starting balance: {}", e),
        }

        // Restore positions persisted by a previous run and resume
        // streaming their tokens.
        let restored = self.ctx.store.get_by_strategy(self.strategy.name());
        if !restored.is_empty() {
            info!("📂 Restored {} positions from disk", restored.len());
            let tokens: Vec<String> = restored.iter().flat_map(|p| p.token_ids()).collect();
            self.streamer.subscribe_batch(&tokens, 100).await;
        }

        self.streamer
            .set_handler(penny_defense_handler(self.ctx.store.clone()));

        let streamer = self.streamer.clone();
        let streamer_task = tokio::spawn(async move { streamer.run().await });

        info!("🚀 Starting {}", self.label);

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = self.scan_loop() => {
                error!("Scan loop ended unexpectedly");
            }
            _ = self.monitor_loop() => {
                error!("Monitor loop ended unexpectedly");
            }
            _ = self.stats_loop() => {}
            _ = shutdown.changed() => {
                info!("🛑 Stopping {}", self.label);
            }
        }

        // Graceful shutdown: loops are cancelled by the select, in-flight
        // awaits have completed, the store persists on every mutation;
        // close the streamer last.
        self.streamer.stop();
        let _ = streamer_task.await;
        Ok(())
    }

    async fn scan_loop(&self) {
        let backoff = Duration::from_secs(self.ctx.config.execution.scan_error_backoff_secs);

        loop {
            match self.scan_pass().await {
                Ok(()) => {
                    tokio::time::sleep(self.strategy.scan_interval()).await;
                }
                Err(e) => {
                    error!("Error in scan loop: {:#}", e);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn scan_pass(&self) -> Result<()> {
        let scan_number = self.ctx.stats.scans.fetch_add(1, Ordering::Relaxed) + 1;
        info!("🔍 Scan #{}", scan_number);

        let mut opportunities = self.strategy.scan(&self.ctx).await?;
        if opportunities.is_empty() {
            return Ok(());
        }

        info!("💡 Found {} opportunities", opportunities.len());
        self.ctx
            .stats
            .opportunities_found
            .fetch_add(opportunities.len() as u64, Ordering::Relaxed);

        // Deterministic iteration order regardless of detector internals.
        opportunities.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

        for opp in opportunities {
            if self.seen_opportunities.lock().contains(&opp.fingerprint) {
                continue;
            }
            // No two open positions may share a token.
            if opp
                .legs
                .iter()
                .any(|leg| self.ctx.store.has(&leg.token_id))
            {
                continue;
            }

            self.seen_opportunities.lock().insert(opp.fingerprint.clone());

            match self.strategy.should_enter(&self.ctx, &opp).await {
                Ok(true) => {
                    debug!("Entering {}", opp);
                    match self.strategy.enter_position(&self.ctx, &opp).await {
                        Ok(true) => {
                            let tokens: Vec<String> =
                                opp.legs.iter().map(|l| l.token_id.clone()).collect();
                            self.streamer.subscribe_batch(&tokens, 100).await;
                        }
                        Ok(false) => debug!("Entry declined by executor for {}", opp.fingerprint),
                        Err(e) => error!("Entry failed for {}: {:#}", opp.fingerprint, e),
                    }
                }
                Ok(false) => debug!("should_enter rejected {}", opp.fingerprint),
                Err(e) => warn!("should_enter errored for {}: {:#}", opp.fingerprint, e),
            }

            // Yield between candidates so the monitor loop is never
            // starved during a large scan.
            tokio::task::yield_now().await;
        }

        Ok(())
    }

    async fn monitor_loop(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            // Snapshot: concurrent insertions during iteration are fine.
            let positions = self.ctx.store.get_by_strategy(self.strategy.name());
            for position in positions {
                if position.status != PositionStatus::Open {
                    continue;
                }

                let wants_exit = if position.force_exit {
                    info!("🚨 Force exit flagged for {}", position.group_id);
                    true
                } else {
                    match self.strategy.should_exit(&self.ctx, &position).await {
                        Ok(decision) => decision,
                        Err(e) => {
                            debug!("should_exit errored for {}: {:#}", position.group_id, e);
                            false
                        }
                    }
                };

                if wants_exit {
                    if let Err(e) = self.strategy.exit_position(&self.ctx, &position).await {
                        error!("Exit failed for {}: {:#}", position.group_id, e);
                    }
                }
            }
        }
    }

    async fn stats_loop(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        interval.tick().await;

        loop {
            interval.tick().await;

            let stats = &self.ctx.stats;
            let open = self.ctx.store.get_by_strategy(self.strategy.name()).len();
            info!("{}", "=".repeat(60));
            info!("📊 {} Statistics", self.label);
            info!("   Scans: {}", stats.scans.load(Ordering::Relaxed));
            info!(
                "   Opportunities: {}",
                stats.opportunities_found.load(Ordering::Relaxed)
            );
            info!("   Trades Entered: {}", stats.entered.load(Ordering::Relaxed));
            info!("   Trades Exited: {}", stats.exited.load(Ordering::Relaxed));
            info!("   Total P&L: ${:.2}", *stats.total_pnl.read());
            info!("   Open Positions: {}", open);
            info!(
                "   Committed Capital: ${:.2}",
                self.ctx.store.committed_capital()
            );
            info!("{}", "=".repeat(60));
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// CLI strategy names, resolved at build time. Out-of-tree strategies are
/// added by recompiling against the `Strategy` trait.
pub const STRATEGY_NAMES: &[&str] = &[
    "extreme_price",
    "calendar_arbitrage",
    "cross_platform",
    "spread_arbitrage",
    "arbitrage",
];

pub fn build_strategy(
    name: &str,
    args: Option<&serde_json::Value>,
) -> EngineResult<Arc<dyn Strategy>> {
    let args = args.cloned().unwrap_or_else(|| serde_json::json!({}));

    fn params<T: serde::de::DeserializeOwned>(args: serde_json::Value) -> EngineResult<T> {
        serde_json::from_value(args)
            .map_err(|e| EngineError::Configuration(format!("bad --strategy-args: {}", e)))
    }

    match name {
        "extreme_price" => Ok(Arc::new(ExtremePriceStrategy::new(params(args)?))),
        "calendar_arbitrage" => Ok(Arc::new(CalendarArbitrageStrategy::new(params(args)?))),
        "cross_platform" => Ok(Arc::new(CrossPlatformStrategy::new(params(args)?))),
        "spread_arbitrage" => Ok(Arc::new(SpreadArbitrageStrategy::new(params(args)?))),
        // Hierarchical event arbitrage: the calendar detector with
        // normalization-only clustering.
        "arbitrage" => {
            let mut p: calendar::CalendarParams = params(args)?;
            p.use_similarity = false;
            p.use_llm = false;
            Ok(Arc::new(CalendarArbitrageStrategy::named("ArbitrageStrategy", p)))
        }
        other => Err(EngineError::Configuration(format!(
            "unknown strategy '{}'; available: {}",
            other,
            STRATEGY_NAMES.join(", ")
        ))),
    }
}
