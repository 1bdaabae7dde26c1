//! Extreme-price detector (single-leg mean reversion).
//!
//! A binary market quoted at a fraction of a cent has asymmetric payoff if
//! the outcome is even modestly probable. Buy the cheap side, wait for the
//! quote to multiply, sell into the bid.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use super::{Opportunity, OpportunityKind, OpportunityLeg, Strategy, StrategyContext};
use crate::catalog::{CatalogClient, VenueTag};
use crate::executor::best_bid;
use crate::orderbook::Side;
use crate::position_store::Position;
use crate::utils::{calculate_position_size, days_until_close};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtremePriceParams {
    /// Maximum entry price.
    pub buy_threshold: Decimal,
    /// Exit target = entry × multiplier.
    pub sell_multiplier: Decimal,
    pub min_hours_until_close: Decimal,
    /// Fraction of the wallet per trade.
    pub portfolio_percent: Decimal,
    /// Units floor per trade.
    pub min_size: Decimal,
    pub scan_interval_secs: u64,
}

impl Default for ExtremePriceParams {
    fn default() -> Self {
        Self {
            buy_threshold: dec!(0.004),
            sell_multiplier: dec!(2.0),
            min_hours_until_close: dec!(1),
            portfolio_percent: dec!(0.005),
            min_size: dec!(5),
            scan_interval_secs: 300,
        }
    }
}

pub struct ExtremePriceStrategy {
    params: ExtremePriceParams,
}

impl ExtremePriceStrategy {
    pub fn new(params: ExtremePriceParams) -> Self {
        info!("⚙️ Configuration:");
        info!(
            "   Buy threshold: ${} ({:.1} cents)",
            params.buy_threshold,
            params.buy_threshold * Decimal::ONE_HUNDRED
        );
        info!("   Sell multiplier: {}x", params.sell_multiplier);
        info!("   Min hours until close: {}h", params.min_hours_until_close);
        info!(
            "   Portfolio %: {:.1}%",
            params.portfolio_percent * Decimal::ONE_HUNDRED
        );
        Self { params }
    }
}

#[async_trait]
impl Strategy for ExtremePriceStrategy {
    fn name(&self) -> &str {
        "ExtremePriceStrategy"
    }

    fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.params.scan_interval_secs)
    }

    async fn scan(&self, ctx: &StrategyContext) -> Result<Vec<Opportunity>> {
        let markets = ctx
            .catalog
            .fetch_all_open_markets(&ctx.config.markets)
            .await?;
        let markets =
            CatalogClient::filter_by_min_hours(markets, self.params.min_hours_until_close);

        let hits =
            CatalogClient::find_extreme_prices(&markets, self.params.buy_threshold, dec!(0.99));

        let balance = ctx.venue.get_balance(false).await.unwrap_or(Decimal::ZERO);
        let mut opportunities = Vec::new();

        for hit in hits {
            // Only the cheap side is a buy; the 0.99+ side is ignored.
            if hit.price > self.params.buy_threshold || hit.price <= Decimal::ZERO {
                continue;
            }
            let Some(token_id) = hit.market.token_ids.get(hit.outcome_index).cloned() else {
                continue;
            };

            let size = calculate_position_size(
                balance,
                self.params.portfolio_percent,
                hit.price,
                self.params.min_size,
            );

            let fingerprint = Opportunity::fingerprint_for(&[&token_id]);
            opportunities.push(Opportunity {
                kind: OpportunityKind::ExtremePrice,
                question: hit.market.question.clone(),
                legs: vec![OpportunityLeg {
                    token_id,
                    side: Side::Buy,
                    limit_price: hit.price,
                    size,
                    venue: VenueTag::Primary,
                }],
                target_price: Some(hit.price * self.params.sell_multiplier),
                total_cost: hit.price,
                expected_profit: hit.price * (self.params.sell_multiplier - Decimal::ONE),
                annualized_roi: None,
                days_until_close: Some(days_until_close(hit.market.end_date.as_deref())),
                fingerprint,
            });
        }

        Ok(opportunities)
    }

    async fn should_enter(&self, ctx: &StrategyContext, opp: &Opportunity) -> Result<bool> {
        let Some(leg) = opp.legs.first() else {
            return Ok(false);
        };

        let balance = ctx.venue.get_balance(false).await?;
        let required = leg.limit_price * leg.size;
        if balance < required {
            debug!("Insufficient balance: ${:.2} < ${:.2}", balance, required);
            return Ok(false);
        }

        let probe = ctx
            .executor
            .check_liquidity(&ctx.venue, &leg.token_id, Side::Buy, leg.size)
            .await?;
        if !probe.available {
            debug!(
                "Insufficient liquidity for {}: {:.1} available",
                leg.token_id, probe.available_size
            );
            return Ok(false);
        }

        Ok(true)
    }

    async fn should_exit(&self, ctx: &StrategyContext, position: &Position) -> Result<bool> {
        let Some(leg) = position.legs.first() else {
            return Ok(false);
        };
        let Some(target) = position.target_price else {
            return Ok(false);
        };

        let Some((current_bid, _)) = best_bid(&ctx.venue, &leg.token_id).await else {
            return Ok(false);
        };

        if current_bid >= target {
            info!(
                "🎯 Target reached! {:.4} → {:.4}",
                leg.entry_price, current_bid
            );
            return Ok(true);
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_match_documented_thresholds() {
        let p = ExtremePriceParams::default();
        assert_eq!(p.buy_threshold, dec!(0.004));
        assert_eq!(p.sell_multiplier, dec!(2.0));
        assert_eq!(p.portfolio_percent, dec!(0.005));
    }

    #[test]
    fn params_reject_unknown_keys() {
        let parsed: Result<ExtremePriceParams, _> =
            serde_json::from_value(serde_json::json!({"buy_threshold": "0.01"}));
        assert!(parsed.is_ok());

        let parsed: Result<ExtremePriceParams, _> =
            serde_json::from_value(serde_json::json!({"nonsense": 1}));
        assert!(parsed.is_err());
    }
}
