//! In-memory venue used by the test suite.
//!
//! Books are seeded per token; order outcomes can be scripted per token to
//! exercise the executor's split-leg case analysis. Every accepted order
//! is recorded for assertions.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};

use super::{OrderReceipt, OrderRequest, VenueClient};
use crate::error::{EngineError, EngineResult};
use crate::orderbook::{OrderBook, Side};

#[derive(Default)]
pub struct StubVenue {
    books: RwLock<HashMap<String, OrderBook>>,
    /// Tokens whose orders the venue rejects.
    rejects: RwLock<HashSet<String>>,
    /// Tokens whose SELL orders the venue rejects (rollback failures).
    sell_rejects: RwLock<HashSet<String>>,
    pub orders: Mutex<Vec<OrderRequest>>,
    balance: RwLock<Decimal>,
}

impl StubVenue {
    pub fn empty() -> Self {
        Self {
            balance: RwLock::new(dec!(1000)),
            ..Default::default()
        }
    }

    pub fn with_balance(balance: Decimal) -> Self {
        Self {
            balance: RwLock::new(balance),
            ..Default::default()
        }
    }

    pub fn set_book(
        &self,
        token_id: &str,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
    ) {
        let mut book = OrderBook::new(token_id);
        for (p, s) in bids {
            book.bids.insert(*p, *s);
        }
        for (p, s) in asks {
            book.asks.insert(*p, *s);
        }
        self.books.write().insert(token_id.to_string(), book);
    }

    /// Scripts every subsequent order on `token_id` to fail.
    pub fn reject_orders_for(&self, token_id: &str) {
        self.rejects.write().insert(token_id.to_string());
    }

    /// Scripts only SELL orders on `token_id` to fail.
    pub fn reject_sells_for(&self, token_id: &str) {
        self.sell_rejects.write().insert(token_id.to_string());
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().len()
    }

    pub fn orders_for(&self, token_id: &str) -> Vec<OrderRequest> {
        self.orders
            .lock()
            .iter()
            .filter(|o| o.token_id == token_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl VenueClient for StubVenue {
    async fn get_order_book(&self, token_id: &str) -> EngineResult<OrderBook> {
        self.books
            .read()
            .get(token_id)
            .cloned()
            .ok_or_else(|| EngineError::DataIntegrity(format!("no book for {}", token_id)))
    }

    async fn get_balance(&self, _force_refresh: bool) -> EngineResult<Decimal> {
        Ok(*self.balance.read())
    }

    async fn post_order(&self, order: &OrderRequest) -> EngineResult<OrderReceipt> {
        if self.rejects.read().contains(&order.token_id)
            || (order.side == Side::Sell && self.sell_rejects.read().contains(&order.token_id))
        {
            return Err(EngineError::VenueRejection(format!(
                "scripted rejection for {}",
                order.token_id
            )));
        }

        self.orders.lock().push(order.clone());
        Ok(OrderReceipt {
            venue_order_id: format!("STUB_{}", self.orders.lock().len()),
            filled_size: order.size,
            avg_fill_price: order.price,
        })
    }

    fn get_address(&self) -> String {
        "0xSTUBVENUE0000000000000000000000000000000".to_string()
    }

    async fn cancel_order(&self, _order_id: &str) -> EngineResult<bool> {
        Ok(true)
    }
}
