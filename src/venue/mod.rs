//! Uniform venue contract exposed to detectors and the executor.
//!
//! Two concrete clients implement it: the primary CLOB venue and the
//! cross-platform counterparty venue. Price units are normalized inside
//! each client (the counterparty quotes cents 0-100), so everything above
//! this boundary works in probabilities.

pub mod clob;
pub mod cross;
pub mod stub;

pub use clob::ClobVenue;
pub use cross::CrossVenue;
pub use stub::StubVenue;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::orderbook::{OrderBook, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Good till cancelled.
    Gtc,
    /// Fill or kill.
    Fok,
    /// Immediate or cancel.
    Ioc,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Gtc => "GTC",
            OrderType::Fok => "FOK",
            OrderType::Ioc => "IOC",
        }
    }
}

/// An order as handed to a venue client. Prices are probabilities in
/// [0, 1]; rounding to venue precision happens in the executor.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub order_type: OrderType,
}

/// Confirmed order outcome as reported by the venue.
#[derive(Debug, Clone)]
pub struct OrderReceipt {
    pub venue_order_id: String,
    pub filled_size: Decimal,
    pub avg_fill_price: Decimal,
}

#[async_trait]
pub trait VenueClient: Send + Sync {
    async fn get_order_book(&self, token_id: &str) -> EngineResult<OrderBook>;

    /// Cached wallet balance; `force_refresh` bypasses the cache.
    async fn get_balance(&self, force_refresh: bool) -> EngineResult<Decimal>;

    async fn post_order(&self, order: &OrderRequest) -> EngineResult<OrderReceipt>;

    fn get_address(&self) -> String;

    async fn cancel_order(&self, order_id: &str) -> EngineResult<bool>;
}
