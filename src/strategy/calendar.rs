//! Calendar (logical-subset) arbitrage.
//!
//! Two markets about the same event at different expiries satisfy subset
//! monotonicity: if the earlier resolves YES the later must too. Buying
//! NO on the earlier and YES on the later therefore pays exactly 1 at the
//! later resolution, so any total cost below 1 minus fees is locked-in
//! profit.
//!
//! The hard part is clustering "same event, different expiry". Three
//! cooperating mechanisms: temporal-phrase normalization (fast, exact),
//! token-frequency cosine similarity (fuzzy), and the external semantic
//! matcher (precise, optional, rate-limited by `llm_market_cap`).

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Opportunity, OpportunityKind, OpportunityLeg, Strategy, StrategyContext};
use crate::catalog::{Market, VenueTag};
use crate::executor::{best_ask, best_bid};
use crate::orderbook::Side;
use crate::position_store::Position;
use crate::utils::{annualized_roi, days_until_close, short_addr};

const MONTHS: &str = "january|february|march|april|may|june|july|august|september|october|november|december";

static TEMPORAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        format!(r"by\s+end\s+of\s+({MONTHS})"),
        r"by\s+(the\s+)?end\s+of\s+\d{4}".to_string(),
        format!(r"by\s+({MONTHS})(\s+\d{{4}})?"),
        r"until\s+(the\s+)?end\s+of\s+\d{4}".to_string(),
        format!(r"until\s+({MONTHS})(\s+\d{{4}})?"),
        format!(r"before\s+({MONTHS})(\s+\d{{4}})?"),
        format!(r"\b\d{{1,2}}\s+({MONTHS})\b"),
        format!(r"\b({MONTHS})\s+\d{{1,2}}\b"),
        r"\b\d{4}\b".to_string(),
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid temporal pattern"))
    .collect()
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("invalid pattern"));

/// Strips temporal phrases so markets about the same underlying event
/// collapse onto one key.
pub fn normalize_question(question: &str) -> String {
    if question.is_empty() {
        return String::new();
    }
    let mut s = question.to_lowercase();
    for pattern in TEMPORAL_PATTERNS.iter() {
        s = pattern.replace_all(&s, "").into_owned();
    }
    WHITESPACE.replace_all(&s, " ").trim().to_string()
}

/// Token-frequency cosine similarity between two questions. Stands in for
/// sentence embeddings: cheap, deterministic, gated by the same threshold.
pub fn question_similarity(a: &str, b: &str) -> f64 {
    fn term_freq(text: &str) -> HashMap<String, f64> {
        let mut freq = HashMap::new();
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
        {
            *freq.entry(word.to_string()).or_insert(0.0) += 1.0;
        }
        freq
    }

    let fa = term_freq(a);
    let fb = term_freq(b);
    if fa.is_empty() || fb.is_empty() {
        return 0.0;
    }

    let dot: f64 = fa
        .iter()
        .filter_map(|(w, va)| fb.get(w).map(|vb| va * vb))
        .sum();
    let norm_a: f64 = fa.values().map(|v| v * v).sum::<f64>().sqrt();
    let norm_b: f64 = fb.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CalendarParams {
    pub scan_interval_secs: u64,
    pub min_profit_threshold: Decimal,
    /// Extra margin above break-even before an early take-profit.
    pub early_exit_threshold: Decimal,
    pub min_annualized_roi: Decimal,
    /// Stop-loss on the pair's per-unit exit value.
    pub max_loss_tolerance: Decimal,
    pub max_pairs: usize,
    pub check_invalid_risk: bool,
    pub use_similarity: bool,
    pub similarity_threshold: f64,
    pub use_llm: bool,
    /// Markets handed to the semantic matcher per scan (cost bound).
    pub llm_market_cap: usize,
    /// Contracts per leg; defaults to the engine-wide knob.
    pub pair_size: Option<Decimal>,
}

impl Default for CalendarParams {
    fn default() -> Self {
        Self {
            scan_interval_secs: 10,
            min_profit_threshold: dec!(0.02),
            early_exit_threshold: dec!(0.005),
            min_annualized_roi: dec!(0.15),
            max_loss_tolerance: dec!(0.02),
            max_pairs: 1000,
            check_invalid_risk: true,
            use_similarity: true,
            similarity_threshold: 0.85,
            use_llm: false,
            llm_market_cap: 100,
            pair_size: None,
        }
    }
}

pub struct CalendarArbitrageStrategy {
    name: String,
    params: CalendarParams,
}

impl CalendarArbitrageStrategy {
    pub fn new(params: CalendarParams) -> Self {
        Self::named("CalendarArbitrageStrategy", params)
    }

    pub fn named(name: &str, params: CalendarParams) -> Self {
        info!("⚙️ Configuration:");
        info!("   Min profit threshold: {:.3}", params.min_profit_threshold);
        info!("   Early exit threshold: {:.3}", params.early_exit_threshold);
        info!("   Min annualized ROI: {:.1}%", params.min_annualized_roi * dec!(100));
        info!("   Check invalid risk: {}", params.check_invalid_risk);
        info!("   Use similarity: {}", params.use_similarity);
        if params.use_similarity {
            info!("   Similarity threshold: {:.2}", params.similarity_threshold);
        }
        info!("   Use LLM matcher: {}", params.use_llm);
        Self {
            name: name.to_string(),
            params,
        }
    }

    fn are_similar(&self, q1: &str, q2: &str) -> bool {
        if q1.is_empty() || q2.is_empty() {
            return false;
        }
        let n1 = normalize_question(q1);
        let n2 = normalize_question(q2);
        if !n1.is_empty() && n1 == n2 {
            return true;
        }
        self.params.use_similarity
            && question_similarity(q1, q2) >= self.params.similarity_threshold
    }

    /// Groups markets by "same underlying event". Greedy single pass:
    /// each market seeds a group and absorbs every later similar one.
    pub fn cluster_markets(&self, markets: &[Market]) -> Vec<Vec<Market>> {
        if self.params.use_similarity {
            let mut groups: Vec<Vec<Market>> = Vec::new();
            let mut processed = vec![false; markets.len()];

            for i in 0..markets.len() {
                if processed[i] || markets[i].question.is_empty() {
                    continue;
                }
                processed[i] = true;
                let mut group = vec![markets[i].clone()];

                for j in (i + 1)..markets.len() {
                    if processed[j] {
                        continue;
                    }
                    if self.are_similar(&markets[i].question, &markets[j].question) {
                        group.push(markets[j].clone());
                        processed[j] = true;
                    }
                }

                if group.len() >= 2 {
                    groups.push(group);
                }
            }
            groups
        } else {
            let mut by_key: HashMap<String, Vec<Market>> = HashMap::new();
            for market in markets {
                let key = normalize_question(&market.question);
                if key.is_empty() {
                    continue;
                }
                by_key.entry(key).or_default().push(market.clone());
            }
            by_key.into_values().filter(|g| g.len() >= 2).collect()
        }
    }

    fn pair_size(&self, ctx: &StrategyContext) -> Decimal {
        self.params
            .pair_size
            .unwrap_or(ctx.config.trading.pair_size)
    }

    /// Evaluates one (early, late) pair: reads the two ask ladders and
    /// emits an opportunity when the total cost clears the profit and ROI
    /// gates.
    pub async fn evaluate_pair(
        &self,
        ctx: &StrategyContext,
        early: &Market,
        late: &Market,
    ) -> Option<Opportunity> {
        if self.params.check_invalid_risk
            && (early.has_invalidity_risk() || late.has_invalidity_risk())
        {
            debug!(
                "Skipping pair with invalid risk: {}",
                early.question.chars().take(40).collect::<String>()
            );
            return None;
        }

        let no_early = early.no_token()?.to_string();
        let yes_late = late.yes_token()?.to_string();

        let (ask_no_early, size_no) = best_ask(&ctx.venue, &no_early).await?;
        let (ask_yes_late, size_yes) = best_ask(&ctx.venue, &yes_late).await?;

        let total_cost = ask_no_early + ask_yes_late;
        let fee_budget = dec!(2) * ctx.estimated_fee;
        let threshold = Decimal::ONE - self.params.min_profit_threshold - fee_budget;

        if total_cost >= threshold {
            return None;
        }

        let size_cap = size_no.min(size_yes);
        if size_cap <= Decimal::ZERO {
            return None;
        }

        // ROI gates on the gross edge; the reported profit nets out the
        // per-leg fee budget.
        let gross_profit = Decimal::ONE - total_cost;
        let expected_profit = gross_profit - fee_budget;
        let days = days_until_close(late.end_date.as_deref());
        let roi = annualized_roi(gross_profit, days);
        if roi < self.params.min_annualized_roi {
            debug!(
                "Skipping low annualized ROI: {:.1}% < {:.1}%",
                roi * dec!(100),
                self.params.min_annualized_roi * dec!(100)
            );
            return None;
        }

        let size = Decimal::ONE.max(self.pair_size(ctx).min(size_cap));
        let fingerprint = Opportunity::fingerprint_for(&[&no_early, &yes_late]);

        Some(Opportunity {
            kind: OpportunityKind::CalendarPair,
            question: early.question.clone(),
            legs: vec![
                OpportunityLeg {
                    token_id: no_early,
                    side: Side::Buy,
                    limit_price: ask_no_early,
                    size,
                    venue: VenueTag::Primary,
                },
                OpportunityLeg {
                    token_id: yes_late,
                    side: Side::Buy,
                    limit_price: ask_yes_late,
                    size,
                    venue: VenueTag::Primary,
                },
            ],
            target_price: None,
            total_cost,
            expected_profit,
            annualized_roi: Some(roi),
            days_until_close: Some(days),
            fingerprint,
        })
    }

    fn group_id_for(opp: &Opportunity) -> String {
        format!(
            "CAL-{}-{}",
            short_addr(&opp.legs[0].token_id),
            short_addr(&opp.legs[1].token_id)
        )
    }
}

#[async_trait]
impl Strategy for CalendarArbitrageStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.params.scan_interval_secs)
    }

    async fn scan(&self, ctx: &StrategyContext) -> Result<Vec<Opportunity>> {
        let markets = ctx
            .catalog
            .fetch_all_open_markets(&ctx.config.markets)
            .await?;

        // Mechanism 1+2: normalization and cosine similarity.
        let groups = self.cluster_markets(&markets);

        // Candidate (early, late) pairs: adjacent expiries within each
        // cluster.
        let mut pairs: Vec<(Market, Market)> = Vec::new();
        for mut group in groups {
            group.sort_by(|a, b| {
                let ea = a.end_date.as_deref().unwrap_or("9999-12-31T00:00:00Z");
                let eb = b.end_date.as_deref().unwrap_or("9999-12-31T00:00:00Z");
                ea.cmp(eb)
            });
            for window in group.windows(2) {
                pairs.push((window[0].clone(), window[1].clone()));
            }
        }

        // Mechanism 3: the semantic matcher proposes pairs the cheap
        // mechanisms miss. Bounded per scan to control cost.
        if self.params.use_llm {
            if let Some(matcher) = &ctx.matcher {
                let capped: Vec<&Market> =
                    markets.iter().take(self.params.llm_market_cap).collect();
                let described: Vec<(String, Option<String>)> = capped
                    .iter()
                    .map(|m| (m.question.clone(), m.end_date.clone()))
                    .collect();
                for pair in matcher.cluster_markets(&described, 50).await {
                    let early = capped[pair.early_index].clone();
                    let late = capped[pair.late_index].clone();
                    debug!("LLM pair: {}", pair.reasoning);
                    pairs.push((early, late));
                }
            }
        }

        let mut opportunities = Vec::new();
        for (early, late) in pairs {
            if let Some(opp) = self.evaluate_pair(ctx, &early, &late).await {
                opportunities.push(opp);
            }
            if opportunities.len() >= self.params.max_pairs {
                break;
            }
        }

        Ok(opportunities)
    }

    async fn should_enter(&self, ctx: &StrategyContext, opp: &Opportunity) -> Result<bool> {
        // Thresholds were applied against live asks during the scan; the
        // remaining gate is capital.
        let balance = ctx.venue.get_balance(false).await?;
        let required: Decimal = opp
            .legs
            .iter()
            .map(|leg| leg.limit_price * leg.size)
            .sum();
        Ok(balance >= required)
    }

    /// Two-leg atomic entry: fresh fill simulation, concurrent
    /// submission, rollback of any orphan leg.
    async fn enter_position(&self, ctx: &StrategyContext, opp: &Opportunity) -> Result<bool> {
        let group_id = Self::group_id_for(opp);
        let fee_budget = dec!(2) * ctx.estimated_fee;
        let max_total_cost = Decimal::ONE - self.params.min_profit_threshold - fee_budget;

        info!("🧮 Calendar arbitrage opportunity:");
        info!("   Early(NO) ask: ${:.4}", opp.legs[0].limit_price);
        info!("   Late(YES) ask: ${:.4}", opp.legs[1].limit_price);
        info!(
            "   Total cost: ${:.4} | Annualized ROI: {:.1}% ({:.1} days)",
            opp.total_cost,
            opp.annualized_roi.unwrap_or_default() * dec!(100),
            opp.days_until_close.unwrap_or_default()
        );

        super::enter_pair(&self.name, &group_id, ctx, opp, max_total_cost).await
    }

    /// Hold to resolution by default; exit early on take-profit or
    /// stop-loss against the current bids.
    async fn should_exit(&self, ctx: &StrategyContext, position: &Position) -> Result<bool> {
        if position.legs.len() < 2 {
            return Ok(false);
        }

        let entry_cost = position.entry_cost_per_unit();
        let Some((bid_a, _)) = best_bid(&ctx.venue, &position.legs[0].token_id).await else {
            return Ok(false);
        };
        let Some((bid_b, _)) = best_bid(&ctx.venue, &position.legs[1].token_id).await else {
            return Ok(false);
        };

        let exit_value = bid_a + bid_b;
        let fee_budget = dec!(2) * ctx.estimated_fee;
        let take_profit = entry_cost + fee_budget + self.params.early_exit_threshold;

        if exit_value >= take_profit {
            let profit = exit_value - entry_cost - fee_budget;
            info!(
                "💰 Early exit triggered! Exit value: ${:.4} > Threshold: ${:.4} (Profit: ${:.4})",
                exit_value, take_profit, profit
            );
            return Ok(true);
        }

        if entry_cost - exit_value > self.params.max_loss_tolerance {
            warn!(
                "📉 Early exit: spread reversed! Loss: ${:.4} (Exit: ${:.4} < Entry: ${:.4})",
                entry_cost - exit_value,
                exit_value,
                entry_cost
            );
            return Ok(true);
        }

        Ok(false)
    }

    /// Sells both legs concurrently; a split outcome marks the position
    /// failed for manual attention rather than retrying.
    async fn exit_position(&self, ctx: &StrategyContext, position: &Position) -> Result<bool> {
        super::exit_pair(ctx, position).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_temporal_phrases() {
        assert_eq!(
            normalize_question("Will Bitcoin hit $100k by end of March?"),
            normalize_question("Will Bitcoin hit $100k by December 2025?")
        );
        assert_eq!(
            normalize_question("Will X happen by end of 2025?"),
            "will x happen ?"
        );
        assert_eq!(normalize_question(""), "");
    }

    #[test]
    fn normalization_keeps_distinct_events_apart() {
        let a = normalize_question("Will Bitcoin hit $100k by March 2025?");
        let b = normalize_question("Will Ethereum hit $10k by March 2025?");
        assert_ne!(a, b);
    }

    #[test]
    fn similarity_is_high_for_rewordings() {
        let sim = question_similarity(
            "Will Bitcoin reach $100k before January 2025?",
            "Will Bitcoin reach $100k before June 2025?",
        );
        assert!(sim > 0.85, "similarity was {}", sim);

        let sim = question_similarity(
            "Will Bitcoin reach $100k?",
            "Will the Lakers win the championship?",
        );
        assert!(sim < 0.5, "similarity was {}", sim);
    }

    #[test]
    fn clustering_groups_same_event_different_expiry() {
        let strategy = CalendarArbitrageStrategy::new(CalendarParams::default());

        let market = |q: &str, end: &str| -> Market {
            serde_json::from_str(&format!(
                r#"{{"id":"x","question":"{q}","endDate":"{end}",
                    "clobTokenIds":"[\"y\",\"n\"]","outcomes":"[\"Yes\",\"No\"]",
                    "active":true,"closed":false}}"#
            ))
            .unwrap()
        };

        let markets = vec![
            market("Will Bitcoin hit $100k by March 2025?", "2025-03-31T00:00:00Z"),
            market("Will Bitcoin hit $100k by December 2025?", "2025-12-31T00:00:00Z"),
            market("Will it rain in Paris tomorrow?", "2025-01-02T00:00:00Z"),
        ];

        let groups = strategy.cluster_markets(&markets);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }
}
