//! Cross-platform counterparty venue client.
//!
//! The counterparty quotes prices in cents (0-100) and trades integer
//! contract counts keyed by ticker rather than token id. This client
//! normalizes both: prices become probabilities and the two sides of a
//! market are addressed as pseudo-tokens `<TICKER>:YES` / `<TICKER>:NO`,
//! so everything upstream sees the standard venue contract.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{OrderReceipt, OrderRequest, VenueClient};
use crate::catalog::{Market, VenueTag};
use crate::error::{EngineError, EngineResult};
use crate::orderbook::{OrderBook, Side};
use crate::rate_limiter::MultiTierRateLimiter;
use crate::utils::now_ms;

const CENTS: Decimal = Decimal::ONE_HUNDRED;

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    #[serde(default)]
    markets: Vec<RawCrossMarket>,
}

#[derive(Debug, Deserialize)]
struct RawCrossMarket {
    ticker: String,
    title: String,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    close_time: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderbookResponse {
    #[serde(default)]
    orderbook: RawCrossBook,
}

#[derive(Debug, Default, Deserialize)]
struct RawCrossBook {
    #[serde(default)]
    yes: Vec<CrossLevel>,
    #[serde(default)]
    no: Vec<CrossLevel>,
}

#[derive(Debug, Deserialize)]
struct CrossLevel {
    /// Price in cents.
    price: Decimal,
    quantity: Decimal,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(default)]
    order: RawCrossOrder,
}

#[derive(Debug, Default, Deserialize)]
struct RawCrossOrder {
    #[serde(default)]
    order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    #[serde(default)]
    balance: RawCrossBalance,
}

#[derive(Debug, Default, Deserialize)]
struct RawCrossBalance {
    /// Cents.
    #[serde(default)]
    balance: Decimal,
}

pub struct CrossVenue {
    client: Client,
    base_url: String,
    api_key: String,
    limiter: Arc<MultiTierRateLimiter>,
}

impl CrossVenue {
    pub fn new(
        base_url: &str,
        api_key: &str,
        limiter: Arc<MultiTierRateLimiter>,
        http_timeout: Duration,
    ) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|e| EngineError::Configuration(format!("HTTP client: {}", e)))?;

        info!("🔌 Connected to counterparty venue: {}", base_url);
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            limiter,
        })
    }

    /// Splits a `<TICKER>:YES|NO` pseudo-token.
    fn split_token(token_id: &str) -> EngineResult<(&str, Side)> {
        match token_id.rsplit_once(':') {
            Some((ticker, "YES")) => Ok((ticker, Side::Buy)),
            Some((ticker, "NO")) => Ok((ticker, Side::Sell)),
            _ => Err(EngineError::DataIntegrity(format!(
                "not a counterparty token id: {}",
                token_id
            ))),
        }
    }

    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> EngineResult<T> {
        self.limiter.acquire().await;

        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self
            .client
            .request(method, &url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(EngineError::from)?;
        if !response.status().is_success() {
            return Err(EngineError::VenueRejection(format!(
                "counterparty returned {} for {}",
                response.status(),
                path
            )));
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::DataIntegrity(format!("counterparty payload: {}", e)))
    }

    /// Fetches open markets normalized into the standard `Market` shape,
    /// with pseudo-token ids for the two sides.
    pub async fn fetch_open_markets(&self, limit: usize) -> EngineResult<Vec<Market>> {
        let response: MarketsResponse = self
            .request_json(
                reqwest::Method::GET,
                &format!("markets?limit={}&status=open", limit),
                None,
            )
            .await?;

        let markets = response
            .markets
            .into_iter()
            .map(|raw| Market {
                id: raw.ticker.clone(),
                question: raw.title,
                description: raw.subtitle,
                category: None,
                end_date: raw.close_time,
                token_ids: vec![format!("{}:YES", raw.ticker), format!("{}:NO", raw.ticker)],
                outcomes: vec!["Yes".to_string(), "No".to_string()],
                outcome_prices: Vec::new(),
                volume_24h: None,
                active: raw.status.as_deref().unwrap_or("open") == "open",
                closed: raw.status.as_deref() == Some("closed"),
                venue: VenueTag::Secondary,
            })
            .collect::<Vec<_>>();

        debug!("Fetched {} counterparty markets", markets.len());
        Ok(markets)
    }
}

#[async_trait]
impl VenueClient for CrossVenue {
    /// Book for one side of a market. The requested side's resting offers
    /// become asks; the opposite side's offers imply the bids at the
    /// complementary price (YES bid = 1 − NO ask).
    async fn get_order_book(&self, token_id: &str) -> EngineResult<OrderBook> {
        let (ticker, side) = Self::split_token(token_id)?;

        let response: OrderbookResponse = self
            .request_json(
                reqwest::Method::GET,
                &format!("markets/{}/orderbook", ticker),
                None,
            )
            .await?;

        let (own, other) = match side {
            Side::Buy => (response.orderbook.yes, response.orderbook.no),
            Side::Sell => (response.orderbook.no, response.orderbook.yes),
        };

        let mut book = OrderBook::new(token_id);
        book.timestamp = now_ms();
        for level in own {
            let price = level.price / CENTS;
            if price > Decimal::ZERO && price <= Decimal::ONE && level.quantity > Decimal::ZERO {
                book.asks.insert(price, level.quantity);
            }
        }
        for level in other {
            let price = Decimal::ONE - level.price / CENTS;
            if price > Decimal::ZERO && price < Decimal::ONE && level.quantity > Decimal::ZERO {
                book.bids.insert(price, level.quantity);
            }
        }

        Ok(book)
    }

    async fn get_balance(&self, _force_refresh: bool) -> EngineResult<Decimal> {
        let response: BalanceResponse = self
            .request_json(reqwest::Method::GET, "portfolio/balance", None)
            .await?;
        Ok(response.balance.balance / CENTS)
    }

    async fn post_order(&self, order: &OrderRequest) -> EngineResult<OrderReceipt> {
        let (ticker, market_side) = Self::split_token(&order.token_id)?;

        // Counterparty trades whole contracts at integer cent prices.
        let quantity = order
            .size
            .round()
            .to_i64()
            .filter(|q| *q > 0)
            .ok_or_else(|| {
                EngineError::DataIntegrity(format!("bad contract count {}", order.size))
            })?;
        let price_cents = (order.price * CENTS)
            .round()
            .to_i64()
            .filter(|p| (1..=99).contains(p))
            .ok_or_else(|| {
                EngineError::DataIntegrity(format!("price {} out of cents range", order.price))
            })?;

        let side_str = match market_side {
            Side::Buy => "yes",
            Side::Sell => "no",
        };
        let action = match order.side {
            Side::Buy => "buy",
            Side::Sell => "sell",
        };

        let body = serde_json::json!({
            "ticker": ticker,
            "client_order_id": uuid::Uuid::new_v4().to_string(),
            "side": side_str,
            "action": action,
            "count": quantity,
            "type": "limit",
            "yes_price": (market_side == Side::Buy).then_some(price_cents),
            "no_price": (market_side == Side::Sell).then_some(price_cents),
        });

        let response: OrderResponse = self
            .request_json(reqwest::Method::POST, "portfolio/orders", Some(body))
            .await?;

        match response.order.order_id {
            Some(order_id) => {
                info!(
                    "✅ Counterparty order: {} {} {} {} @ {}¢",
                    ticker, action, quantity, side_str, price_cents
                );
                Ok(OrderReceipt {
                    venue_order_id: order_id,
                    filled_size: Decimal::from(quantity),
                    avg_fill_price: order.price,
                })
            }
            None => Err(EngineError::VenueRejection(
                "counterparty did not return an order id".to_string(),
            )),
        }
    }

    fn get_address(&self) -> String {
        format!("secondary:{}", crate::utils::short_addr(&self.api_key))
    }

    async fn cancel_order(&self, order_id: &str) -> EngineResult<bool> {
        match self
            .request_json::<serde_json::Value>(
                reqwest::Method::DELETE,
                &format!("portfolio/orders/{}", order_id),
                None,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Failed to cancel counterparty order {}: {}", order_id, e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn token_splitting() {
        assert!(matches!(
            CrossVenue::split_token("INXD-23DEC31:YES"),
            Ok(("INXD-23DEC31", Side::Buy))
        ));
        assert!(matches!(
            CrossVenue::split_token("FEDRATE:NO"),
            Ok(("FEDRATE", Side::Sell))
        ));
        assert!(CrossVenue::split_token("nocolon").is_err());
    }

    #[test]
    fn cents_normalization_in_book_payload() {
        let raw: OrderbookResponse = serde_json::from_str(
            r#"{"orderbook":{"yes":[{"price":52,"quantity":100}],"no":[{"price":46,"quantity":50}]}}"#,
        )
        .unwrap();

        // YES side: own asks at 0.52, bids implied from NO at 1-0.46.
        let yes = raw.orderbook.yes;
        assert_eq!(yes[0].price / CENTS, dec!(0.52));
        let no = raw.orderbook.no;
        assert_eq!(Decimal::ONE - no[0].price / CENTS, dec!(0.54));
    }
}
