//! Market catalog client.
//!
//! The catalog endpoint is an opaque paginated source of market metadata.
//! Markets arrive with JSON-string-encoded arrays for outcomes, token ids
//! and outcome prices, so deserialization unwraps those before anything
//! downstream sees them. Every scan starts cold: the poller never caches
//! across scans.

use anyhow::{Context, Result};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::utils::{hours_until_close, MarketsConfig};

/// Which venue a market snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VenueTag {
    #[default]
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketStatus {
    Open,
    Closed,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub question: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "category", default)]
    pub category: Option<String>,
    #[serde(rename = "endDate", default)]
    pub end_date: Option<String>,
    #[serde(
        rename = "clobTokenIds",
        default,
        deserialize_with = "deserialize_string_array"
    )]
    pub token_ids: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_string_array")]
    pub outcomes: Vec<String>,
    #[serde(
        rename = "outcomePrices",
        default,
        deserialize_with = "deserialize_decimal_array"
    )]
    pub outcome_prices: Vec<Decimal>,
    #[serde(rename = "volume24hr", default)]
    pub volume_24h: Option<f64>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub closed: bool,
    #[serde(skip, default)]
    pub venue: VenueTag,
}

// The catalog encodes arrays as JSON strings ("[\"Yes\", \"No\"]").
fn deserialize_string_array<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let s: Option<String> = Option::deserialize(deserializer)?;
    match s {
        Some(s) if !s.is_empty() => serde_json::from_str(&s)
            .map_err(|e| Error::custom(format!("failed to parse string array: {}", e))),
        _ => Ok(Vec::new()),
    }
}

fn deserialize_decimal_array<'de, D>(deserializer: D) -> Result<Vec<Decimal>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let s: Option<String> = Option::deserialize(deserializer)?;
    match s {
        Some(s) if !s.is_empty() => {
            let raw: Vec<String> = serde_json::from_str(&s)
                .map_err(|e| Error::custom(format!("failed to parse price array: {}", e)))?;
            raw.iter()
                .map(|p| {
                    p.parse::<Decimal>()
                        .map_err(|e| Error::custom(format!("bad price '{}': {}", p, e)))
                })
                .collect()
        }
        _ => Ok(Vec::new()),
    }
}

impl Market {
    #[inline]
    pub fn status(&self) -> MarketStatus {
        if self.closed {
            MarketStatus::Closed
        } else if !self.active {
            MarketStatus::Resolved
        } else {
            MarketStatus::Open
        }
    }

    #[inline]
    pub fn is_binary(&self) -> bool {
        self.token_ids.len() == 2
    }

    /// Index 0 is YES by venue convention.
    #[inline]
    pub fn yes_token(&self) -> Option<&str> {
        self.token_ids.first().map(|s| s.as_str())
    }

    #[inline]
    pub fn no_token(&self) -> Option<&str> {
        self.token_ids.get(1).map(|s| s.as_str())
    }

    /// A market whose outcome set exceeds YES/NO, or whose text mentions
    /// "invalid", can resolve to neither side and breaks the subset
    /// assumption behind calendar pairs.
    pub fn has_invalidity_risk(&self) -> bool {
        if self.outcomes.len() > 2 {
            return true;
        }
        let question = self.question.to_lowercase();
        let description = self
            .description
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        question.contains("invalid") || description.contains("invalid")
    }
}

/// A market whose catalog quote sits at an extreme.
#[derive(Debug, Clone)]
pub struct ExtremePriceHit {
    pub market: Market,
    pub price: Decimal,
    /// Outcome index (0 = YES, 1 = NO).
    pub outcome_index: usize,
}

pub struct CatalogClient {
    client: Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(base_url: &str, http_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(http_timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_page(&self, limit: usize, offset: usize) -> Result<Vec<Market>> {
        let url = format!("{}/markets", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("active", "true".to_string()),
                ("closed", "false".to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ])
            .send()
            .await
            .context("Failed to fetch markets from catalog")?;

        if !response.status().is_success() {
            anyhow::bail!("Catalog returned status: {}", response.status());
        }

        let markets: Vec<Market> = response
            .json()
            .await
            .context("Failed to parse catalog response")?;

        debug!("Fetched {} markets (offset={})", markets.len(), offset);
        Ok(markets)
    }

    /// Pulls all open markets page by page, dropping malformed entries.
    pub async fn fetch_all_open_markets(&self, config: &MarketsConfig) -> Result<Vec<Market>> {
        info!("🔍 Scanning markets (max: {})...", config.max_markets);

        let mut all = Vec::new();
        let mut offset = 0;

        while all.len() < config.max_markets {
            let batch = match self.fetch_page(config.page_size, offset).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("Catalog page fetch failed at offset {}: {:#}", offset, e);
                    break;
                }
            };

            let batch_len = batch.len();
            all.extend(batch.into_iter().filter(|m| {
                m.status() == MarketStatus::Open
                    && m.is_binary()
                    && m.token_ids.len() == m.outcomes.len().max(2)
            }));

            if batch_len < config.page_size {
                break;
            }
            offset += config.page_size;
        }

        all.truncate(config.max_markets);
        info!("✅ Found {} active markets", all.len());
        Ok(all)
    }

    /// Keeps markets with at least `min_hours` remaining before close.
    pub fn filter_by_min_hours(markets: Vec<Market>, min_hours: Decimal) -> Vec<Market> {
        let before = markets.len();
        let filtered: Vec<Market> = markets
            .into_iter()
            .filter(|m| {
                m.end_date
                    .as_deref()
                    .and_then(hours_until_close)
                    .is_some_and(|h| h >= min_hours)
            })
            .collect();
        debug!("Filtered {} → {} markets by time", before, filtered.len());
        filtered
    }

    /// Finds markets where either outcome's catalog quote is at or below
    /// `low` or at or above `high`.
    pub fn find_extreme_prices(
        markets: &[Market],
        low: Decimal,
        high: Decimal,
    ) -> Vec<ExtremePriceHit> {
        let mut hits = Vec::new();

        for market in markets {
            if market.outcome_prices.len() < 2 {
                continue;
            }
            for (idx, price) in market.outcome_prices.iter().take(2).enumerate() {
                if *price <= low || *price >= high {
                    hits.push(ExtremePriceHit {
                        market: market.clone(),
                        price: *price,
                        outcome_index: idx,
                    });
                    break;
                }
            }
        }

        info!("💎 Found {} markets with extreme prices", hits.len());
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market_json(question: &str, end_date: &str) -> String {
        format!(
            r#"{{
                "id": "m1",
                "question": "{question}",
                "endDate": "{end_date}",
                "clobTokenIds": "[\"tokyes\", \"tokno\"]",
                "outcomes": "[\"Yes\", \"No\"]",
                "outcomePrices": "[\"0.004\", \"0.996\"]",
                "active": true,
                "closed": false
            }}"#
        )
    }

    #[test]
    fn parses_string_encoded_arrays() {
        let m: Market =
            serde_json::from_str(&market_json("Will it rain?", "2030-01-01T00:00:00Z")).unwrap();
        assert_eq!(m.token_ids, vec!["tokyes", "tokno"]);
        assert_eq!(m.outcomes, vec!["Yes", "No"]);
        assert_eq!(m.outcome_prices, vec![dec!(0.004), dec!(0.996)]);
        assert_eq!(m.status(), MarketStatus::Open);
        assert_eq!(m.yes_token(), Some("tokyes"));
        assert_eq!(m.no_token(), Some("tokno"));
        assert!(m.is_binary());
    }

    #[test]
    fn invalidity_risk_detection() {
        let mut m: Market =
            serde_json::from_str(&market_json("Normal question", "2030-01-01T00:00:00Z")).unwrap();
        assert!(!m.has_invalidity_risk());

        m.description = Some("Resolves INVALID if postponed".to_string());
        assert!(m.has_invalidity_risk());

        m.description = None;
        m.outcomes = vec!["Yes".into(), "No".into(), "Invalid".into()];
        assert!(m.has_invalidity_risk());
    }

    #[test]
    fn extreme_price_scan_flags_low_outcome() {
        let m: Market =
            serde_json::from_str(&market_json("Cheap?", "2030-01-01T00:00:00Z")).unwrap();
        let hits = CatalogClient::find_extreme_prices(&[m], dec!(0.004), dec!(0.99));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].price, dec!(0.004));
        assert_eq!(hits[0].outcome_index, 0);
    }

    #[test]
    fn time_filter_drops_imminent_markets() {
        let near: Market =
            serde_json::from_str(&market_json("Soon", "2020-01-01T00:00:00Z")).unwrap();
        let far: Market =
            serde_json::from_str(&market_json("Later", "2030-01-01T00:00:00Z")).unwrap();

        let kept = CatalogClient::filter_by_min_hours(vec![near, far], dec!(1));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].question, "Later");
    }
}
