//! Spread arbitrage (single venue, single leg).
//!
//! Hunts for wide-spread, low-price books: enter one tick above the best
//! bid, exit at entry plus a fixed profit target capped one tick under
//! the ask. Positions that sit too long walk their exit price down one
//! step per minute past the timeout. The streamer's penny defense covers
//! the case where the market bids through the entry before the monitor
//! loop notices.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use super::{Opportunity, OpportunityKind, OpportunityLeg, Strategy, StrategyContext};
use crate::catalog::VenueTag;
use crate::orderbook::Side;
use crate::position_store::Position;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpreadParams {
    pub scan_interval_secs: u64,
    /// Maximum entry price.
    pub max_price: Decimal,
    /// Minimum bid/ask spread to bother with.
    pub min_spread: Decimal,
    /// Profit target above entry.
    pub target_profit: Decimal,
    /// Entry offset above best bid.
    pub entry_offset: Decimal,
    /// Minutes before the exit target starts stepping down.
    pub timeout_minutes: i64,
    /// Exit-price step per minute past the timeout.
    pub timeout_price_step: Decimal,
    /// 24h volume floor.
    pub min_volume: f64,
    pub size: Decimal,
    /// Books read per scan.
    pub market_cap: usize,
}

impl Default for SpreadParams {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            max_price: dec!(0.30),
            min_spread: dec!(0.40),
            target_profit: dec!(0.20),
            entry_offset: dec!(0.01),
            timeout_minutes: 60,
            timeout_price_step: dec!(0.05),
            min_volume: 100.0,
            size: dec!(10),
            market_cap: 200,
        }
    }
}

pub struct SpreadArbitrageStrategy {
    params: SpreadParams,
}

impl SpreadArbitrageStrategy {
    pub fn new(params: SpreadParams) -> Self {
        info!("⚙️ Configuration:");
        info!("   Max price: ${:.2}", params.max_price);
        info!("   Min spread: ${:.2}", params.min_spread);
        info!("   Target profit: ${:.2}", params.target_profit);
        info!(
            "   Timeout: {}min ({:.2}/min)",
            params.timeout_minutes, params.timeout_price_step
        );
        Self { params }
    }

    /// Dynamic exit target: entry + profit, capped one tick under the
    /// current ask, stepping down once the position outstays its welcome.
    fn exit_target(
        &self,
        entry_price: Decimal,
        best_ask: Option<Decimal>,
        minutes_open: i64,
    ) -> Decimal {
        let mut target = entry_price + self.params.target_profit;
        if let Some(ask) = best_ask {
            target = target.min(ask - dec!(0.01));
        }
        if minutes_open > self.params.timeout_minutes {
            let overdue = Decimal::from(minutes_open - self.params.timeout_minutes);
            target -= self.params.timeout_price_step * overdue;
        }
        target
    }
}

#[async_trait]
impl Strategy for SpreadArbitrageStrategy {
    fn name(&self) -> &str {
        "SpreadArbitrageStrategy"
    }

    fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.params.scan_interval_secs)
    }

    async fn scan(&self, ctx: &StrategyContext) -> Result<Vec<Opportunity>> {
        let markets = ctx
            .catalog
            .fetch_all_open_markets(&ctx.config.markets)
            .await?;

        let mut opportunities = Vec::new();
        let mut books_read = 0usize;

        for market in &markets {
            if books_read >= self.params.market_cap {
                break;
            }
            if market
                .volume_24h
                .is_some_and(|v| v < self.params.min_volume)
            {
                continue;
            }

            for token_id in &market.token_ids {
                if books_read >= self.params.market_cap {
                    break;
                }
                books_read += 1;

                let Ok(book) = ctx.venue.get_order_book(token_id).await else {
                    continue;
                };
                let (Some((bid, _)), Some(spread)) = (book.best_bid(), book.spread()) else {
                    continue;
                };

                if bid >= self.params.max_price || spread < self.params.min_spread {
                    continue;
                }

                let entry = bid + self.params.entry_offset;
                let fingerprint = Opportunity::fingerprint_for(&[token_id]);
                debug!(
                    "Wide spread on {}: bid {:.2}, spread {:.2}",
                    token_id, bid, spread
                );

                opportunities.push(Opportunity {
                    kind: OpportunityKind::SpreadEntry,
                    question: market.question.clone(),
                    legs: vec![OpportunityLeg {
                        token_id: token_id.clone(),
                        side: Side::Buy,
                        limit_price: entry,
                        size: self.params.size,
                        venue: VenueTag::Primary,
                    }],
                    target_price: Some(entry + self.params.target_profit),
                    total_cost: entry,
                    expected_profit: self.params.target_profit * self.params.size,
                    annualized_roi: None,
                    days_until_close: None,
                    fingerprint,
                });
            }
        }

        Ok(opportunities)
    }

    async fn should_enter(&self, ctx: &StrategyContext, opp: &Opportunity) -> Result<bool> {
        let Some(leg) = opp.legs.first() else {
            return Ok(false);
        };
        let balance = ctx.venue.get_balance(false).await?;
        Ok(balance >= leg.limit_price * leg.size)
    }

    async fn should_exit(&self, ctx: &StrategyContext, position: &Position) -> Result<bool> {
        let Some(leg) = position.legs.first() else {
            return Ok(false);
        };

        let book = ctx.venue.get_order_book(&leg.token_id).await?;
        let best_bid = book.best_bid().map(|(p, _)| p);
        let best_ask = book.best_ask().map(|(p, _)| p);

        let minutes_open = Utc::now()
            .signed_duration_since(position.entry_time)
            .num_minutes();
        let target = self.exit_target(leg.entry_price, best_ask, minutes_open);

        // Past the point where the ladder has stepped below entry, any
        // exit beats holding a stale position.
        if target <= leg.entry_price {
            info!(
                "⏰ Timeout exit for {} ({}min open)",
                position.group_id, minutes_open
            );
            return Ok(true);
        }

        if let Some(bid) = best_bid {
            if bid >= target {
                info!(
                    "🎯 Spread target reached: bid {:.2} >= target {:.2}",
                    bid, target
                );
                return Ok(true);
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_target_caps_at_ask_minus_tick() {
        let strategy = SpreadArbitrageStrategy::new(SpreadParams::default());
        // entry 0.10, profit target 0.20 → 0.30, but ask 0.25 caps at 0.24.
        let target = strategy.exit_target(dec!(0.10), Some(dec!(0.25)), 0);
        assert_eq!(target, dec!(0.24));

        // Without an ask, the raw target stands.
        let target = strategy.exit_target(dec!(0.10), None, 0);
        assert_eq!(target, dec!(0.30));
    }

    #[test]
    fn exit_target_steps_down_past_timeout() {
        let strategy = SpreadArbitrageStrategy::new(SpreadParams::default());
        // 70 minutes open = 10 minutes overdue = 10 × 0.05 off the target.
        let target = strategy.exit_target(dec!(0.10), None, 70);
        assert_eq!(target, dec!(0.30) - dec!(0.50));
        assert!(target <= dec!(0.10));
    }
}
