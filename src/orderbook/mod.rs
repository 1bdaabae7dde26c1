//! Order book model shared by detectors and the executor.
//!
//! Books arrive from the venues as `{bids, asks}` objects whose levels may
//! encode price/size as strings or numbers. Parsing normalizes both into
//! `Decimal` and rejects out-of-range values as data-integrity errors so a
//! bad payload can never reach the trading path.

use crate::error::{EngineError, EngineResult};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Levels summed by the liquidity probe.
const PROBE_DEPTH: usize = 5;

/// Residual below which a simulated fill counts as complete.
const FILL_TOLERANCE: Decimal = dec!(0.01);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (price, size) rung of a ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Wire shape: both sides present, possibly empty, levels as string or
/// number pairs.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOrderBook {
    #[serde(default)]
    pub bids: Vec<RawLevel>,
    #[serde(default)]
    pub asks: Vec<RawLevel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLevel {
    #[serde(deserialize_with = "flexible_decimal")]
    pub price: Decimal,
    #[serde(deserialize_with = "flexible_decimal")]
    pub size: Decimal,
}

/// Venues disagree on whether numeric fields are JSON strings or numbers.
fn flexible_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => s
            .parse::<Decimal>()
            .map_err(|e| Error::custom(format!("bad decimal string '{}': {}", s, e))),
        serde_json::Value::Number(n) => n
            .to_string()
            .parse::<Decimal>()
            .map_err(|e| Error::custom(format!("bad decimal number '{}': {}", n, e))),
        other => Err(Error::custom(format!("expected decimal, got {}", other))),
    }
}

/// Result of walking a ladder with a requested size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillSimulation {
    pub avg_price: Decimal,
    pub filled_size: Decimal,
    pub requested_size: Decimal,
    pub fully_filled: bool,
    /// avg_price minus the top-of-book price (positive = paid up for depth).
    pub slippage_from_top: Decimal,
}

/// Result of the top-of-book liquidity probe.
#[derive(Debug, Clone)]
pub struct LiquidityProbe {
    pub available: bool,
    pub available_size: Decimal,
    pub best_price: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub token_id: String,
    pub bids: BTreeMap<Decimal, Decimal>,
    pub asks: BTreeMap<Decimal, Decimal>,
    pub timestamp: i64,
}

impl OrderBook {
    pub fn new(token_id: &str) -> Self {
        Self {
            token_id: token_id.to_string(),
            ..Default::default()
        }
    }

    /// Builds a validated book from the wire shape. Prices outside [0, 1]
    /// or non-positive sizes poison the whole payload.
    pub fn from_raw(token_id: &str, raw: &RawOrderBook, timestamp: i64) -> EngineResult<Self> {
        let mut book = OrderBook::new(token_id);
        book.timestamp = timestamp;

        for (levels, side) in [(&raw.bids, "bid"), (&raw.asks, "ask")] {
            for level in levels.iter() {
                if level.price < Decimal::ZERO || level.price > Decimal::ONE {
                    return Err(EngineError::DataIntegrity(format!(
                        "{} price {} out of [0,1] for {}",
                        side, level.price, token_id
                    )));
                }
                if level.size <= Decimal::ZERO {
                    // Zero-size rungs are deletions in delta feeds; in a
                    // snapshot they are just noise.
                    continue;
                }
                match side {
                    "bid" => book.bids.insert(level.price, level.size),
                    _ => book.asks.insert(level.price, level.size),
                };
            }
        }

        debug!(
            "📖 Parsed book for {}: {} bids, {} asks",
            token_id,
            book.bids.len(),
            book.asks.len()
        );
        Ok(book)
    }

    #[inline]
    pub fn update_level(&mut self, price: Decimal, size: Decimal, side: Side) {
        let ladder = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        if size > Decimal::ZERO {
            ladder.insert(price, size);
        } else {
            ladder.remove(&price);
        }
    }

    #[inline]
    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.last_key_value().map(|(p, s)| (*p, *s))
    }

    #[inline]
    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.first_key_value().map(|(p, s)| (*p, *s))
    }

    #[inline]
    pub fn spread(&self) -> Option<Decimal> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        (ask > bid).then(|| ask - bid)
    }

    #[inline]
    pub fn mid(&self) -> Option<Decimal> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        Some((ask + bid) / Decimal::from(2))
    }

    /// Walks the opposite ladder level-by-level until `requested_size` is
    /// consumed or the ladder is exhausted. Read-only; must run immediately
    /// before any two-leg entry.
    pub fn simulate_fill(&self, side: Side, requested_size: Decimal) -> Option<FillSimulation> {
        let levels: Vec<(Decimal, Decimal)> = match side {
            // BUY consumes asks ascending, SELL consumes bids descending.
            Side::Buy => self.asks.iter().map(|(p, s)| (*p, *s)).collect(),
            Side::Sell => self.bids.iter().rev().map(|(p, s)| (*p, *s)).collect(),
        };

        if levels.is_empty() || requested_size <= Decimal::ZERO {
            return None;
        }

        let top_price = levels[0].0;
        let mut remaining = requested_size;
        let mut total_cost = Decimal::ZERO;
        let mut filled = Decimal::ZERO;

        for (price, size) in levels {
            if remaining <= Decimal::ZERO {
                break;
            }
            let take = remaining.min(size);
            total_cost += take * price;
            filled += take;
            remaining -= take;
        }

        if filled.is_zero() {
            return None;
        }

        let avg_price = total_cost / filled;

        Some(FillSimulation {
            avg_price,
            filled_size: filled,
            requested_size,
            fully_filled: remaining <= FILL_TOLERANCE,
            slippage_from_top: match side {
                Side::Buy => avg_price - top_price,
                Side::Sell => top_price - avg_price,
            },
        })
    }

    /// Sums the first `PROBE_DEPTH` levels of the ladder an order of
    /// `side` would trade against.
    pub fn liquidity_probe(&self, side: Side, requested_size: Decimal) -> LiquidityProbe {
        let levels: Vec<(Decimal, Decimal)> = match side {
            Side::Buy => self.asks.iter().take(PROBE_DEPTH).map(|(p, s)| (*p, *s)).collect(),
            Side::Sell => self
                .bids
                .iter()
                .rev()
                .take(PROBE_DEPTH)
                .map(|(p, s)| (*p, *s))
                .collect(),
        };

        let available_size: Decimal = levels.iter().map(|(_, s)| *s).sum();
        let best_price = levels.first().map(|(p, _)| *p).unwrap_or(Decimal::ZERO);

        LiquidityProbe {
            available: !levels.is_empty() && available_size >= requested_size,
            available_size,
            best_price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book_with(asks: &[(Decimal, Decimal)], bids: &[(Decimal, Decimal)]) -> OrderBook {
        let mut book = OrderBook::new("tok");
        for (p, s) in asks {
            book.asks.insert(*p, *s);
        }
        for (p, s) in bids {
            book.bids.insert(*p, *s);
        }
        book
    }

    #[test]
    fn parses_string_and_number_levels() {
        let raw: RawOrderBook = serde_json::from_str(
            r#"{"bids":[{"price":"0.48","size":"100"}],"asks":[{"price":0.52,"size":250.5}]}"#,
        )
        .unwrap();

        let book = OrderBook::from_raw("tok", &raw, 0).unwrap();
        assert_eq!(book.best_bid(), Some((dec!(0.48), dec!(100))));
        assert_eq!(book.best_ask(), Some((dec!(0.52), dec!(250.5))));
        assert_eq!(book.spread(), Some(dec!(0.04)));
        assert_eq!(book.mid(), Some(dec!(0.50)));
    }

    #[test]
    fn rejects_negative_prices() {
        let raw: RawOrderBook =
            serde_json::from_str(r#"{"bids":[{"price":"-0.1","size":"5"}],"asks":[]}"#).unwrap();
        assert!(matches!(
            OrderBook::from_raw("tok", &raw, 0),
            Err(EngineError::DataIntegrity(_))
        ));
    }

    #[test]
    fn empty_sides_are_valid() {
        let raw: RawOrderBook = serde_json::from_str(r#"{"bids":[],"asks":[]}"#).unwrap();
        let book = OrderBook::from_raw("tok", &raw, 0).unwrap();
        assert!(book.best_bid().is_none());
        assert!(book.best_ask().is_none());
    }

    #[test]
    fn buy_fill_walks_asks_and_reports_slippage() {
        let book = book_with(
            &[(dec!(0.40), dec!(10)), (dec!(0.45), dec!(10)), (dec!(0.50), dec!(100))],
            &[],
        );

        let sim = book.simulate_fill(Side::Buy, dec!(20)).unwrap();
        assert!(sim.fully_filled);
        assert_eq!(sim.filled_size, dec!(20));
        // 10 @ 0.40 + 10 @ 0.45 = 8.5 / 20
        assert_eq!(sim.avg_price, dec!(0.425));
        // avg is never better than top-of-book for a BUY
        assert!(sim.avg_price >= dec!(0.40));
        assert_eq!(sim.slippage_from_top, dec!(0.025));
    }

    #[test]
    fn sell_fill_walks_bids_descending() {
        let book = book_with(&[], &[(dec!(0.30), dec!(50)), (dec!(0.35), dec!(5))]);

        let sim = book.simulate_fill(Side::Sell, dec!(10)).unwrap();
        assert!(sim.fully_filled);
        // 5 @ 0.35 + 5 @ 0.30
        assert_eq!(sim.avg_price, dec!(0.325));
        assert!(sim.avg_price <= dec!(0.35));
    }

    #[test]
    fn partial_fill_reports_not_fully_filled() {
        let book = book_with(&[(dec!(0.40), dec!(3))], &[]);
        let sim = book.simulate_fill(Side::Buy, dec!(10)).unwrap();
        assert!(!sim.fully_filled);
        assert_eq!(sim.filled_size, dec!(3));
        assert!(sim.filled_size <= sim.requested_size);
    }

    #[test]
    fn probe_sums_first_five_levels_only() {
        let asks: Vec<(Decimal, Decimal)> = (1..=8)
            .map(|i| (Decimal::new(40 + i, 2), dec!(10)))
            .collect();
        let book = book_with(&asks, &[]);

        let probe = book.liquidity_probe(Side::Buy, dec!(45));
        assert_eq!(probe.available_size, dec!(50));
        assert!(probe.available);
        assert_eq!(probe.best_price, dec!(0.41));

        let probe = book.liquidity_probe(Side::Buy, dec!(60));
        assert!(!probe.available);
    }
}
