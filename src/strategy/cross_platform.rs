//! Cross-platform arbitrage (two legs, two venues).
//!
//! The same real-world event listed on both venues may quote prices whose
//! sum across complementary sides is below 1. Tickers differ across
//! venues, so matching runs in two stages: a cheap keyword-overlap
//! prefilter, then semantic verification through the matcher. The number
//! of verified matches per scan is bounded to control matcher cost.

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Opportunity, OpportunityKind, OpportunityLeg, Strategy, StrategyContext};
use crate::catalog::{Market, VenueTag};
use crate::executor::{best_ask, best_bid};
use crate::orderbook::Side;
use crate::position_store::Position;
use crate::utils::short_addr;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    ["the", "a", "an", "in", "on", "at", "to", "for", "of", "by", "will", "be"]
        .into_iter()
        .collect()
});

/// Significant-word overlap between two questions.
pub fn keyword_overlap(text_a: &str, text_b: &str) -> usize {
    fn significant(text: &str) -> HashSet<String> {
        text.to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > 3 && !STOP_WORDS.contains(*w))
            .map(str::to_string)
            .collect()
    }
    significant(text_a).intersection(&significant(text_b)).count()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrossPlatformParams {
    pub scan_interval_secs: u64,
    pub min_profit_threshold: Decimal,
    pub early_exit_threshold: Decimal,
    pub max_positions: usize,
    /// Verified matches per scan (matcher cost bound).
    pub max_matches: usize,
    /// Keyword overlap needed before a pair is worth verifying.
    pub min_overlap: usize,
    pub primary_market_cap: usize,
    pub secondary_market_cap: usize,
    pub pair_size: Option<Decimal>,
}

impl Default for CrossPlatformParams {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            min_profit_threshold: dec!(0.02),
            early_exit_threshold: dec!(0.005),
            max_positions: 10,
            max_matches: 50,
            min_overlap: 2,
            primary_market_cap: 500,
            secondary_market_cap: 200,
            pair_size: None,
        }
    }
}

pub struct CrossPlatformStrategy {
    params: CrossPlatformParams,
}

impl CrossPlatformStrategy {
    pub fn new(params: CrossPlatformParams) -> Self {
        info!("⚙️ Cross-Platform Arbitrage Configuration:");
        info!("   Min profit threshold: {:.3}", params.min_profit_threshold);
        info!("   Max positions: {}", params.max_positions);
        info!("   Max verified matches/scan: {}", params.max_matches);
        Self { params }
    }

    /// Matches equivalent markets across venues: keyword prefilter, then
    /// the semantic matcher when available. Without a matcher a stricter
    /// overlap stands in.
    async fn match_markets(
        &self,
        ctx: &StrategyContext,
        primary: &[Market],
        secondary: &[Market],
    ) -> Vec<(Market, Market)> {
        let mut pairs = Vec::new();

        'outer: for p_market in primary {
            for s_market in secondary {
                let overlap = keyword_overlap(&p_market.question, &s_market.question);
                if overlap < self.params.min_overlap {
                    continue;
                }

                let matched = match &ctx.matcher {
                    Some(matcher) => {
                        matcher
                            .verify_equivalence(&p_market.question, &s_market.question)
                            .await
                    }
                    // No matcher: require a stronger lexical signal.
                    None => overlap >= self.params.min_overlap + 1,
                };

                if matched {
                    debug!(
                        "Match: {} ↔ {}",
                        p_market.question.chars().take(40).collect::<String>(),
                        s_market.question.chars().take(40).collect::<String>()
                    );
                    pairs.push((p_market.clone(), s_market.clone()));
                    if pairs.len() >= self.params.max_matches {
                        break 'outer;
                    }
                }
            }
        }

        pairs
    }

    /// Checks both leg combinations and keeps the better one if it clears
    /// the profit threshold after per-venue fees.
    async fn evaluate_pair(
        &self,
        ctx: &StrategyContext,
        primary: &Market,
        secondary: &Market,
    ) -> Option<Opportunity> {
        let secondary_venue = ctx.secondary()?;

        let p_yes = primary.yes_token()?.to_string();
        let p_no = primary.no_token()?.to_string();
        let s_yes = secondary.yes_token()?.to_string();
        let s_no = secondary.no_token()?.to_string();

        let (p_yes_ask, _) = best_ask(&ctx.venue, &p_yes).await?;
        let (p_no_ask, _) = best_ask(&ctx.venue, &p_no).await?;
        let (s_yes_ask, _) = best_ask(&secondary_venue, &s_yes).await?;
        let (s_no_ask, _) = best_ask(&secondary_venue, &s_no).await?;

        let fees = dec!(2) * ctx.estimated_fee;

        // Strategy A: YES here + NO there; strategy B is the mirror.
        let cost_a = p_yes_ask + s_no_ask;
        let profit_a = Decimal::ONE - cost_a - fees;
        let cost_b = p_no_ask + s_yes_ask;
        let profit_b = Decimal::ONE - cost_b - fees;

        let size = self
            .params
            .pair_size
            .unwrap_or(ctx.config.trading.pair_size);

        let (primary_token, primary_price, secondary_token, secondary_price, cost, profit) =
            if profit_a > self.params.min_profit_threshold && profit_a > profit_b {
                (p_yes, p_yes_ask, s_no, s_no_ask, cost_a, profit_a)
            } else if profit_b > self.params.min_profit_threshold {
                (p_no, p_no_ask, s_yes, s_yes_ask, cost_b, profit_b)
            } else {
                return None;
            };

        let fingerprint = Opportunity::fingerprint_for(&[&primary_token, &secondary_token]);
        Some(Opportunity {
            kind: OpportunityKind::CrossPlatformPair,
            question: primary.question.clone(),
            legs: vec![
                OpportunityLeg {
                    token_id: primary_token,
                    side: Side::Buy,
                    limit_price: primary_price,
                    size,
                    venue: VenueTag::Primary,
                },
                OpportunityLeg {
                    token_id: secondary_token,
                    side: Side::Buy,
                    limit_price: secondary_price,
                    size,
                    venue: VenueTag::Secondary,
                },
            ],
            target_price: None,
            total_cost: cost,
            expected_profit: profit,
            annualized_roi: None,
            days_until_close: None,
            fingerprint,
        })
    }
}

#[async_trait]
impl Strategy for CrossPlatformStrategy {
    fn name(&self) -> &str {
        "CrossPlatformArbitrageStrategy"
    }

    fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.params.scan_interval_secs)
    }

    async fn scan(&self, ctx: &StrategyContext) -> Result<Vec<Opportunity>> {
        let Some(cross_venue) = &ctx.cross_venue else {
            warn!("Counterparty venue not available - cross-platform scan skipped");
            return Ok(Vec::new());
        };

        let mut primary = ctx
            .catalog
            .fetch_all_open_markets(&ctx.config.markets)
            .await?;
        primary.truncate(self.params.primary_market_cap);

        let secondary = cross_venue
            .fetch_open_markets(self.params.secondary_market_cap)
            .await?;

        info!(
            "📊 Comparing {} primary vs {} counterparty markets",
            primary.len(),
            secondary.len()
        );

        let matched = self.match_markets(ctx, &primary, &secondary).await;
        info!("🔗 Found {} potentially equivalent market pairs", matched.len());

        let mut opportunities = Vec::new();
        for (p_market, s_market) in matched {
            if let Some(opp) = self.evaluate_pair(ctx, &p_market, &s_market).await {
                info!(
                    "🌐 Cross-platform opportunity: cost ${:.4}, profit {:.2}%",
                    opp.total_cost,
                    opp.expected_profit * dec!(100)
                );
                opportunities.push(opp);
            }
        }

        Ok(opportunities)
    }

    async fn should_enter(&self, ctx: &StrategyContext, opp: &Opportunity) -> Result<bool> {
        let open = ctx.store.get_by_strategy(self.name()).len();
        if open >= self.params.max_positions {
            warn!("Max positions ({}) reached", self.params.max_positions);
            return Ok(false);
        }

        let balance = ctx.venue.get_balance(false).await?;
        let required: Decimal = opp
            .legs
            .iter()
            .map(|leg| leg.limit_price * leg.size)
            .sum();
        Ok(balance >= required)
    }

    async fn enter_position(&self, ctx: &StrategyContext, opp: &Opportunity) -> Result<bool> {
        let group_id = format!(
            "CROSS-{}-{}",
            short_addr(&opp.legs[0].token_id),
            short_addr(&opp.legs[1].token_id)
        );
        let max_total_cost =
            Decimal::ONE - self.params.min_profit_threshold - dec!(2) * ctx.estimated_fee;

        info!("🌐 Cross-platform arbitrage:");
        info!("   Primary: BUY @ {:.3}", opp.legs[0].limit_price);
        info!("   Counterparty: BUY @ {:.3}", opp.legs[1].limit_price);
        info!(
            "   Expected profit: {:.2}%",
            opp.expected_profit * dec!(100)
        );

        super::enter_pair(self.name(), &group_id, ctx, opp, max_total_cost).await
    }

    /// Hold to resolution by default; take profit early when the bids
    /// across both venues add up past entry plus fees plus margin.
    async fn should_exit(&self, ctx: &StrategyContext, position: &Position) -> Result<bool> {
        if position.legs.len() < 2 {
            return Ok(false);
        }

        let venue_a = ctx.venue_for(position.legs[0].venue)?;
        let venue_b = ctx.venue_for(position.legs[1].venue)?;

        let Some((bid_a, _)) = best_bid(&venue_a, &position.legs[0].token_id).await else {
            return Ok(false);
        };
        let Some((bid_b, _)) = best_bid(&venue_b, &position.legs[1].token_id).await else {
            return Ok(false);
        };

        let exit_value = bid_a + bid_b;
        let entry_cost = position.entry_cost_per_unit();
        let fees = dec!(2) * ctx.estimated_fee;

        Ok(exit_value >= entry_cost + fees + self.params.early_exit_threshold)
    }

    async fn exit_position(&self, ctx: &StrategyContext, position: &Position) -> Result<bool> {
        super::exit_pair(ctx, position).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_overlap_ignores_stop_words_and_short_words() {
        let a = "Will Bitcoin reach $100,000 by December?";
        let b = "Bitcoin price above $100,000 at year end?";
        // "bitcoin" and "$100,000" survive the filters.
        assert_eq!(keyword_overlap(a, b), 2);

        assert_eq!(keyword_overlap("will the be of", "will the be of"), 0);
    }

    #[test]
    fn unrelated_questions_have_no_overlap() {
        assert_eq!(
            keyword_overlap("Will Bitcoin reach $100k?", "Super Bowl winner 2025?"),
            0
        );
    }
}
