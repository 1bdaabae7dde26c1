//! Order executor.
//!
//! Translates accepted opportunities into confirmed orders and owns the
//! atomicity contract for two-leg entries: both legs are simulated against
//! fresh ladders, submitted concurrently, and an orphan leg left by a
//! partial failure is rolled back immediately. A rollback that itself
//! fails is escalated as a critical hazard for manual reconciliation —
//! never retried automatically.
//!
//! In dry-run mode fills are simulated at the observed limit prices
//! without contacting the venue; a virtual balance tracks simulated P&L.

use futures::join;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::catalog::VenueTag;
use crate::error::{EngineError, EngineResult};
use crate::orderbook::{FillSimulation, LiquidityProbe, Side};
use crate::utils::{calculate_pnl, PnlReport};
use crate::venue::{OrderRequest, OrderType, VenueClient};

/// Rollback fallback when no bid is readable. Whether the venue treats a
/// 0.01 limit as "sell at any price" is venue-dependent.
const ROLLBACK_FLOOR: Decimal = dec!(0.01);

/// Venue precision: prices to 3 decimals, sizes to 2.
const PRICE_DP: u32 = 3;
const SIZE_DP: u32 = 2;

/// Outcome of one order attempt.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub success: bool,
    pub venue_order_id: Option<String>,
    pub filled_size: Decimal,
    pub avg_fill_price: Decimal,
    pub error: Option<String>,
}

impl ExecutionReport {
    fn failed(error: String) -> Self {
        Self {
            success: false,
            venue_order_id: None,
            filled_size: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            error: Some(error),
        }
    }
}

/// One planned leg of a multi-leg entry or exit.
#[derive(Clone)]
pub struct LegPlan {
    pub venue: Arc<dyn VenueClient>,
    pub venue_tag: VenueTag,
    pub token_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

impl std::fmt::Debug for LegPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegPlan")
            .field("token_id", &self.token_id)
            .field("side", &self.side)
            .field("price", &self.price)
            .field("size", &self.size)
            .field("venue_tag", &self.venue_tag)
            .finish()
    }
}

/// Result of a two-leg atomic entry attempt.
#[derive(Debug)]
pub enum PairOutcome {
    /// Both legs filled; entry prices are the simulated averages actually
    /// paid.
    Entered {
        fill_a: ExecutionReport,
        fill_b: ExecutionReport,
    },
    /// Pre-trade gate failed (liquidity or slippage); nothing submitted.
    Aborted { reason: String },
    /// One leg filled and was successfully sold back.
    RolledBack { orphan_token: String },
    /// One leg filled and the rollback failed. The caller must record a
    /// failed position for operator attention.
    CriticalOrphan {
        orphan: LegPlan,
        fill: ExecutionReport,
        error: String,
    },
    /// Neither leg filled.
    BothFailed { error_a: String, error_b: String },
}

pub struct OrderExecutor {
    dry_run: bool,
    /// Simulated P&L accumulator (dry-run only).
    sim_pnl: RwLock<Decimal>,
}

impl OrderExecutor {
    pub fn new(dry_run: bool) -> Self {
        if dry_run {
            info!("🎮 Simulation mode enabled - NO REAL TRADES");
        }
        Self {
            dry_run,
            sim_pnl: RwLock::new(Decimal::ZERO),
        }
    }

    #[inline]
    pub fn round_price(price: Decimal) -> Decimal {
        price.round_dp(PRICE_DP)
    }

    #[inline]
    pub fn round_size(size: Decimal) -> Decimal {
        size.round_dp(SIZE_DP)
    }

    pub async fn simulated_pnl(&self) -> Decimal {
        *self.sim_pnl.read().await
    }

    /// Single-order contract. Prices and sizes are rounded to venue
    /// precision; venue rejections carry the venue-reported reason.
    pub async fn execute(
        &self,
        venue: &Arc<dyn VenueClient>,
        token_id: &str,
        side: Side,
        size: Decimal,
        limit_price: Decimal,
        order_type: OrderType,
    ) -> ExecutionReport {
        let price = Self::round_price(limit_price);
        let size = Self::round_size(size);

        if self.dry_run {
            info!(
                "🎮 SIMULATED: {} {} {} @ ${:.4}",
                side, size, token_id, price
            );
            return ExecutionReport {
                success: true,
                venue_order_id: Some(format!("SIM_{}", uuid::Uuid::new_v4())),
                filled_size: size,
                avg_fill_price: price,
                error: None,
            };
        }

        let request = OrderRequest {
            token_id: token_id.to_string(),
            side,
            size,
            price,
            order_type,
        };

        match venue.post_order(&request).await {
            Ok(receipt) => ExecutionReport {
                success: true,
                venue_order_id: Some(receipt.venue_order_id),
                filled_size: receipt.filled_size,
                avg_fill_price: receipt.avg_fill_price,
                error: None,
            },
            Err(e) => {
                error!("❌ Order failed: {} - {}", token_id, e);
                ExecutionReport::failed(e.to_string())
            }
        }
    }

    /// Top-of-ladder probe used by `should_enter`.
    pub async fn check_liquidity(
        &self,
        venue: &Arc<dyn VenueClient>,
        token_id: &str,
        side: Side,
        requested_size: Decimal,
    ) -> EngineResult<LiquidityProbe> {
        let book = venue.get_order_book(token_id).await?;
        Ok(book.liquidity_probe(side, requested_size))
    }

    /// Fresh-ladder fill simulation; read-only.
    pub async fn simulate_fill(
        &self,
        venue: &Arc<dyn VenueClient>,
        token_id: &str,
        side: Side,
        size: Decimal,
    ) -> EngineResult<Option<FillSimulation>> {
        let book = venue.get_order_book(token_id).await?;
        Ok(book.simulate_fill(side, size))
    }

    /// Two-leg atomic entry.
    ///
    /// 1. Simulate both fills; abort if either is short or the
    ///    slippage-adjusted total cost breaches `max_total_cost`.
    /// 2. Submit both orders concurrently.
    /// 3. On a split outcome, roll the filled leg back at best-bid (or the
    ///    0.01 floor) and report what happened.
    pub async fn enter_two_leg(
        &self,
        group_id: &str,
        leg_a: LegPlan,
        leg_b: LegPlan,
        max_total_cost: Decimal,
    ) -> PairOutcome {
        let sim_a = match self
            .simulate_fill(&leg_a.venue, &leg_a.token_id, leg_a.side, leg_a.size)
            .await
        {
            Ok(Some(sim)) => sim,
            Ok(None) => {
                return PairOutcome::Aborted {
                    reason: format!("no ladder for {}", leg_a.token_id),
                }
            }
            Err(e) => return PairOutcome::Aborted { reason: e.to_string() },
        };
        let sim_b = match self
            .simulate_fill(&leg_b.venue, &leg_b.token_id, leg_b.side, leg_b.size)
            .await
        {
            Ok(Some(sim)) => sim,
            Ok(None) => {
                return PairOutcome::Aborted {
                    reason: format!("no ladder for {}", leg_b.token_id),
                }
            }
            Err(e) => return PairOutcome::Aborted { reason: e.to_string() },
        };

        if !sim_a.fully_filled || !sim_b.fully_filled {
            return PairOutcome::Aborted {
                reason: format!(
                    "insufficient liquidity: A={:.1}/{:.1}, B={:.1}/{:.1}",
                    sim_a.filled_size, sim_a.requested_size, sim_b.filled_size, sim_b.requested_size
                ),
            };
        }

        let cost_with_slippage = sim_a.avg_price + sim_b.avg_price;
        if cost_with_slippage >= max_total_cost {
            return PairOutcome::Aborted {
                reason: format!(
                    "slippage kills profit: ${:.4} >= ${:.4}",
                    cost_with_slippage, max_total_cost
                ),
            };
        }

        info!(
            "🧮 {} entry: A ${:.4} (avg ${:.4}) + B ${:.4} (avg ${:.4}) = ${:.4}",
            group_id, leg_a.price, sim_a.avg_price, leg_b.price, sim_b.avg_price, cost_with_slippage
        );

        // Submit both legs concurrently at the simulated average prices.
        let (result_a, result_b) = join!(
            self.execute(
                &leg_a.venue,
                &leg_a.token_id,
                leg_a.side,
                leg_a.size,
                sim_a.avg_price,
                OrderType::Gtc,
            ),
            self.execute(
                &leg_b.venue,
                &leg_b.token_id,
                leg_b.side,
                leg_b.size,
                sim_b.avg_price,
                OrderType::Gtc,
            ),
        );

        match (result_a.success, result_b.success) {
            (true, true) => PairOutcome::Entered {
                fill_a: result_a,
                fill_b: result_b,
            },
            (true, false) => {
                error!("❌ Leg B failed for {}, rolling back leg A", group_id);
                self.rollback_leg(group_id, leg_a, result_a).await
            }
            (false, true) => {
                error!("❌ Leg A failed for {}, rolling back leg B", group_id);
                self.rollback_leg(group_id, leg_b, result_b).await
            }
            (false, false) => {
                error!("❌ Both legs failed for {}", group_id);
                PairOutcome::BothFailed {
                    error_a: result_a.error.unwrap_or_default(),
                    error_b: result_b.error.unwrap_or_default(),
                }
            }
        }
    }

    /// Compensating sell for an orphan leg: best bid when readable, the
    /// 0.01 floor otherwise.
    async fn rollback_leg(
        &self,
        group_id: &str,
        orphan: LegPlan,
        fill: ExecutionReport,
    ) -> PairOutcome {
        let price = match orphan.venue.get_order_book(&orphan.token_id).await {
            Ok(book) => book.best_bid().map(|(p, _)| p).unwrap_or(ROLLBACK_FLOOR),
            Err(_) => ROLLBACK_FLOOR,
        };

        let result = self
            .execute(
                &orphan.venue,
                &orphan.token_id,
                orphan.side.opposite(),
                fill.filled_size,
                price,
                OrderType::Gtc,
            )
            .await;

        if result.success {
            info!("✅ Rollback successful for {}", group_id);
            PairOutcome::RolledBack {
                orphan_token: orphan.token_id,
            }
        } else {
            let error = result.error.unwrap_or_default();
            error!(
                "🚨 ROLLBACK FAILED for {} - manual intervention required: {}",
                group_id, error
            );
            PairOutcome::CriticalOrphan { orphan, fill, error }
        }
    }

    /// Sells both legs concurrently at their best bids. The same split
    /// case analysis as entry governs partial exits: (true, true) is a
    /// clean exit, a split leaves the unsold leg flagged for the caller.
    pub async fn exit_two_leg(
        &self,
        group_id: &str,
        leg_a: LegPlan,
        leg_b: LegPlan,
    ) -> (ExecutionReport, ExecutionReport) {
        let price_a = self.exit_price(&leg_a).await;
        let price_b = self.exit_price(&leg_b).await;

        info!("🚪 Exiting {} (both legs concurrently)", group_id);

        join!(
            self.execute(
                &leg_a.venue,
                &leg_a.token_id,
                Side::Sell,
                leg_a.size,
                price_a,
                OrderType::Gtc,
            ),
            self.execute(
                &leg_b.venue,
                &leg_b.token_id,
                Side::Sell,
                leg_b.size,
                price_b,
                OrderType::Gtc,
            ),
        )
    }

    async fn exit_price(&self, leg: &LegPlan) -> Decimal {
        match leg.venue.get_order_book(&leg.token_id).await {
            Ok(book) => book.best_bid().map(|(p, _)| p).unwrap_or(ROLLBACK_FLOOR),
            Err(e) => {
                warn!("Could not read book for {}: {}", leg.token_id, e);
                ROLLBACK_FLOOR
            }
        }
    }

    /// Single-leg exit at best bid or a caller-supplied price. Returns the
    /// report plus realized P&L on success.
    pub async fn exit_single(
        &self,
        venue: &Arc<dyn VenueClient>,
        token_id: &str,
        entry_price: Decimal,
        size: Decimal,
        exit_price: Option<Decimal>,
    ) -> EngineResult<(ExecutionReport, Option<PnlReport>)> {
        let price = match exit_price {
            Some(p) => p,
            None => {
                let book = venue.get_order_book(token_id).await?;
                book.best_bid()
                    .map(|(p, _)| p)
                    .ok_or_else(|| EngineError::DataIntegrity("no bids to exit into".into()))?
            }
        };

        let report = self
            .execute(venue, token_id, Side::Sell, size, price, OrderType::Gtc)
            .await;

        if report.success {
            let pnl = calculate_pnl(entry_price, report.avg_fill_price, report.filled_size);
            info!(
                "💰 Position closed: P&L ${:.2} ({:+.1}%)",
                pnl.pnl, pnl.pnl_pct
            );
            if self.dry_run {
                *self.sim_pnl.write().await += pnl.pnl;
                let total = *self.sim_pnl.read().await;
                info!("🎮 SIMULATED P&L total: ${:.2}", total);
            }
            Ok((report, Some(pnl)))
        } else {
            Ok((report, None))
        }
    }

    /// Total P&L for a multi-leg round trip: exits minus entries minus fees.
    pub fn pair_pnl(
        entries: &[(Decimal, Decimal)],
        exits: &[(Decimal, Decimal)],
        fees: Decimal,
    ) -> Decimal {
        let entry_total: Decimal = entries.iter().map(|(p, s)| p * s).sum();
        let exit_total: Decimal = exits.iter().map(|(p, s)| p * s).sum();
        exit_total - entry_total - fees
    }
}

/// Convenience used by detectors needing the freshest top-of-book.
pub async fn best_ask(
    venue: &Arc<dyn VenueClient>,
    token_id: &str,
) -> Option<(Decimal, Decimal)> {
    match venue.get_order_book(token_id).await {
        Ok(book) => book.best_ask(),
        Err(e) => {
            debug!("best_ask({}) failed: {}", token_id, e);
            None
        }
    }
}

pub async fn best_bid(
    venue: &Arc<dyn VenueClient>,
    token_id: &str,
) -> Option<(Decimal, Decimal)> {
    match venue.get_order_book(token_id).await {
        Ok(book) => book.best_bid(),
        Err(e) => {
            debug!("best_bid({}) failed: {}", token_id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_precision_rounding() {
        assert_eq!(OrderExecutor::round_price(dec!(0.123456)), dec!(0.123));
        assert_eq!(OrderExecutor::round_price(dec!(0.9995)), dec!(1.000));
        assert_eq!(OrderExecutor::round_size(dec!(10.005)), dec!(10.00));
        assert_eq!(OrderExecutor::round_size(dec!(1249.999)), dec!(1250.00));
    }

    #[test]
    fn pair_pnl_subtracts_fees() {
        let entries = [(dec!(0.40), dec!(10)), (dec!(0.55), dec!(10))];
        let exits = [(dec!(0.45), dec!(10)), (dec!(0.57), dec!(10))];
        let pnl = OrderExecutor::pair_pnl(&entries, &exits, dec!(0.20));
        // (4.5 + 5.7) - (4.0 + 5.5) - 0.2 = 0.5
        assert_eq!(pnl, dec!(0.50));
    }

    #[tokio::test]
    async fn dry_run_fills_at_limit_price() {
        let executor = OrderExecutor::new(true);
        // The stub holds no books and records no orders; dry-run must
        // never touch it.
        let venue: Arc<dyn VenueClient> = Arc::new(crate::venue::StubVenue::empty());

        let report = executor
            .execute(&venue, "tok", Side::Buy, dec!(10), dec!(0.404), OrderType::Gtc)
            .await;
        assert!(report.success);
        assert_eq!(report.avg_fill_price, dec!(0.404));
        assert_eq!(report.filled_size, dec!(10));
        assert!(report.venue_order_id.unwrap().starts_with("SIM_"));
    }
}
