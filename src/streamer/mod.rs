//! Reconnecting market-data streamer.
//!
//! Receives push order-book updates for a dynamic subscription set and
//! hands them to a registered handler with minimal latency. The streamer
//! survives disconnects: the full subscription set is retained in memory
//! and re-issued in batches after every reconnect. A health watchdog
//! degrades the connection when the feed goes silent.
//!
//! The streamer is a trigger, never an executor — the handler closure
//! decides what a tick means; no orders are placed here.

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
const SUBSCRIBE_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerState {
    Disconnected,
    Connecting,
    Connected,
    /// Socket open but silent past the health threshold.
    Degraded,
    Closed,
}

/// Best-of-book update delivered to the handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriceUpdate {
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
}

/// Async handler invoked per (token, update). Awaited in-line; its
/// failures are logged and never touch connection state.
pub type UpdateHandler =
    Arc<dyn Fn(String, PriceUpdate) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub wss_url: String,
    pub connect_timeout: Duration,
    pub max_retries: usize,
    /// Silence past this threshold flips Connected → Degraded.
    pub max_silence: Duration,
    pub max_reconnect_delay: Duration,
}

#[derive(Debug, Clone, Deserialize)]
struct WsMessage {
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    asset_id: String,
    #[serde(default)]
    bids: Option<Vec<WsLevel>>,
    #[serde(default)]
    asks: Option<Vec<WsLevel>>,
    #[serde(default)]
    price_changes: Option<Vec<WsPriceChange>>,
}

#[derive(Debug, Clone, Deserialize)]
struct WsLevel {
    price: String,
    #[allow(dead_code)]
    size: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WsPriceChange {
    asset_id: String,
    #[serde(default)]
    best_bid: String,
    #[serde(default)]
    best_ask: String,
}

pub struct MarketStreamer {
    config: StreamerConfig,
    state: Arc<RwLock<StreamerState>>,
    subscribed: Arc<RwLock<HashSet<String>>>,
    handler: Arc<RwLock<Option<UpdateHandler>>>,
    outbox: Arc<Mutex<Option<mpsc::Sender<Message>>>>,
    running_tx: watch::Sender<bool>,
    running_rx: watch::Receiver<bool>,
    last_message: Arc<RwLock<Instant>>,
    /// Latest best-of-book per token, kept for late-joining readers.
    last_prices: DashMap<String, PriceUpdate>,
}

impl MarketStreamer {
    pub fn new(config: StreamerConfig) -> Self {
        let (running_tx, running_rx) = watch::channel(true);
        Self {
            config,
            state: Arc::new(RwLock::new(StreamerState::Disconnected)),
            subscribed: Arc::new(RwLock::new(HashSet::new())),
            handler: Arc::new(RwLock::new(None)),
            outbox: Arc::new(Mutex::new(None)),
            running_tx,
            running_rx,
            last_message: Arc::new(RwLock::new(Instant::now())),
            last_prices: DashMap::new(),
        }
    }

    /// Registers the update handler. The streamer holds only this opaque
    /// closure — it never knows the strategy's type.
    pub fn set_handler(&self, handler: UpdateHandler) {
        *self.handler.write() = Some(handler);
    }

    #[inline]
    pub fn state(&self) -> StreamerState {
        *self.state.read()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), StreamerState::Connected)
    }

    pub fn subscribed_tokens(&self) -> HashSet<String> {
        self.subscribed.read().clone()
    }

    /// Adds tokens to the retained subscription set and, if connected,
    /// issues the subscription immediately.
    pub async fn subscribe(&self, token_ids: &[String]) {
        if token_ids.is_empty() {
            return;
        }
        {
            let mut set = self.subscribed.write();
            set.extend(token_ids.iter().cloned());
        }

        let outbox = self.outbox.lock().await;
        if let Some(tx) = outbox.as_ref() {
            if Self::send_subscription(tx, token_ids).await {
                info!("📡 Subscribed to {} tokens", token_ids.len());
            }
        }
    }

    /// Large sets go out in batches so a single frame stays small.
    pub async fn subscribe_batch(&self, token_ids: &[String], batch_size: usize) {
        let batch_size = if batch_size == 0 {
            SUBSCRIBE_BATCH_SIZE
        } else {
            batch_size
        };
        for chunk in token_ids.chunks(batch_size) {
            self.subscribe(chunk).await;
        }
    }

    async fn send_subscription(tx: &mpsc::Sender<Message>, token_ids: &[String]) -> bool {
        let payload = serde_json::json!({
            "assets_ids": token_ids,
            "type": "market",
        });
        match tx.send(Message::Text(payload.to_string())).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Subscription send failed: {}", e);
                false
            }
        }
    }

    /// Initial connect: up to `max_retries` attempts with exponential
    /// backoff (2^attempt seconds, capped by max_reconnect_delay).
    pub async fn connect(&self) -> bool {
        for attempt in 0..self.config.max_retries {
            info!(
                "🔌 Connecting to streamer... (attempt {}/{})",
                attempt + 1,
                self.config.max_retries
            );
            *self.state.write() = StreamerState::Connecting;

            match self.try_open().await {
                Ok(()) => return true,
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempt + 1, e);
                    *self.state.write() = StreamerState::Disconnected;
                    let backoff = Duration::from_secs(1u64 << attempt.min(6))
                        .min(self.config.max_reconnect_delay);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        error!("❌ Failed to connect to streamer");
        false
    }

    /// One connection lifetime: open the socket, resubscribe, pump
    /// messages until close, error, degradation or shutdown.
    async fn try_open(&self) -> anyhow::Result<()> {
        let connect = tokio_tungstenite::connect_async(self.config.wss_url.as_str());
        let (ws_stream, _) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| anyhow::anyhow!("connect timeout"))??;

        info!("✅ Streamer connected to {}", self.config.wss_url);
        *self.state.write() = StreamerState::Connected;
        *self.last_message.write() = Instant::now();

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Message>(100);
        *self.outbox.lock().await = Some(tx.clone());

        // Writer task owns the sink; ping task keeps the socket warm.
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });
        let ping_tx = tx.clone();
        let pinger = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                interval.tick().await;
                if ping_tx.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }
        });

        // Re-issue the retained subscription set in batches.
        let tokens: Vec<String> = self.subscribed.read().iter().cloned().collect();
        if !tokens.is_empty() {
            info!("📡 Re-subscribing to {} tokens...", tokens.len());
            for chunk in tokens.chunks(SUBSCRIBE_BATCH_SIZE) {
                Self::send_subscription(&tx, chunk).await;
            }
        }

        let mut watchdog = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut running = self.running_rx.clone();

        let result = loop {
            tokio::select! {
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            *self.last_message.write() = Instant::now();
                            self.handle_text(&text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = tx.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            *self.last_message.write() = Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("Streamer socket closed: {:?}", frame);
                            break Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(anyhow::anyhow!("socket error: {}", e)),
                        None => break Ok(()),
                    }
                }
                _ = watchdog.tick() => {
                    let silence = self.last_message.read().elapsed();
                    if silence > self.config.max_silence {
                        warn!(
                            "⚠️ No messages for {:.0}s (threshold {:.0}s), marking degraded",
                            silence.as_secs_f64(),
                            self.config.max_silence.as_secs_f64()
                        );
                        *self.state.write() = StreamerState::Degraded;
                        break Ok(());
                    }
                }
                _ = running.changed() => {
                    if !*running.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        *self.outbox.lock().await = None;
        writer.abort();
        pinger.abort();
        result
    }

    async fn handle_text(&self, text: &str) {
        if text.len() > MAX_MESSAGE_SIZE {
            warn!("Message too large: {} bytes", text.len());
            return;
        }

        // The feed sends both bare objects and arrays of them.
        let messages: Vec<WsMessage> = if text.trim_start().starts_with('[') {
            match serde_json::from_str(text) {
                Ok(msgs) => msgs,
                Err(e) => {
                    debug!("Unparseable message array: {}", e);
                    return;
                }
            }
        } else {
            match serde_json::from_str::<WsMessage>(text) {
                Ok(msg) => vec![msg],
                Err(e) => {
                    debug!("Unparseable message: {}", e);
                    return;
                }
            }
        };

        for msg in messages {
            match msg.event_type.as_str() {
                "book" => {
                    let best_bid = msg
                        .bids
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .filter_map(|l| l.price.parse::<Decimal>().ok())
                        .max();
                    let best_ask = msg
                        .asks
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .filter_map(|l| l.price.parse::<Decimal>().ok())
                        .min();
                    self.dispatch(&msg.asset_id, PriceUpdate { best_bid, best_ask })
                        .await;
                }
                "price_change" => {
                    for change in msg.price_changes.unwrap_or_default() {
                        let update = PriceUpdate {
                            best_bid: change.best_bid.parse().ok(),
                            best_ask: change.best_ask.parse().ok(),
                        };
                        self.dispatch(&change.asset_id, update).await;
                    }
                }
                other => debug!("❓ Unknown event type: {}", other),
            }
        }
    }

    pub fn last_price(&self, token_id: &str) -> Option<PriceUpdate> {
        self.last_prices.get(token_id).map(|entry| *entry.value())
    }

    async fn dispatch(&self, token_id: &str, update: PriceUpdate) {
        if token_id.is_empty() {
            return;
        }
        self.last_prices.insert(token_id.to_string(), update);
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            // Awaited in-line; handler errors are its own business.
            handler(token_id.to_string(), update).await;
        }
    }

    /// Run loop: stream, and on any drop reconnect with a delay that
    /// doubles from 1s up to the cap, resetting after each success.
    pub async fn run(&self) {
        let mut reconnect_delay = Duration::from_secs(1);

        while *self.running_rx.borrow() {
            *self.state.write() = StreamerState::Connecting;

            match self.try_open().await {
                Ok(()) => {
                    reconnect_delay = Duration::from_secs(1);
                }
                Err(e) => {
                    error!("Streamer error: {}", e);
                }
            }

            if !*self.running_rx.borrow() {
                break;
            }

            *self.state.write() = StreamerState::Disconnected;
            info!("⏳ Reconnecting in {:.0}s...", reconnect_delay.as_secs_f64());
            tokio::time::sleep(reconnect_delay).await;
            reconnect_delay = (reconnect_delay * 2).min(self.config.max_reconnect_delay);
        }

        *self.state.write() = StreamerState::Closed;
        info!("⏹️ Streamer stopped");
    }

    /// Cooperative shutdown: the run loop observes the flag and closes
    /// the socket before exiting.
    pub fn stop(&self) {
        let _ = self.running_tx.send(false);
        *self.state.write() = StreamerState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_streamer() -> MarketStreamer {
        MarketStreamer::new(StreamerConfig {
            wss_url: "wss://example.invalid/ws".to_string(),
            connect_timeout: Duration::from_secs(1),
            max_retries: 1,
            max_silence: Duration::from_secs(60),
            max_reconnect_delay: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn subscription_set_is_retained() {
        let streamer = test_streamer();
        let tokens: Vec<String> = (0..100).map(|i| format!("T{}", i)).collect();

        streamer.subscribe_batch(&tokens, 30).await;
        assert_eq!(streamer.subscribed_tokens().len(), 100);

        // Re-subscribing the same tokens does not grow the set.
        streamer.subscribe(&tokens[..10].to_vec()).await;
        assert_eq!(streamer.subscribed_tokens().len(), 100);
    }

    #[tokio::test]
    async fn book_message_dispatches_best_of_book() {
        let streamer = test_streamer();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(RwLock::new(None::<(String, PriceUpdate)>));

        let hits_clone = hits.clone();
        let seen_clone = seen.clone();
        streamer.set_handler(Arc::new(move |token, update| {
            let hits = hits_clone.clone();
            let seen = seen_clone.clone();
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                *seen.write() = Some((token, update));
            })
        }));

        let text = r#"{
            "event_type": "book",
            "asset_id": "tok1",
            "bids": [{"price":"0.05","size":"10"},{"price":"0.06","size":"4"}],
            "asks": [{"price":"0.08","size":"3"}]
        }"#;
        streamer.handle_text(text).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let (token, update) = seen.read().clone().unwrap();
        assert_eq!(token, "tok1");
        assert_eq!(update.best_bid, Some(dec!(0.06)));
        assert_eq!(update.best_ask, Some(dec!(0.08)));

        // Cached for late-joining readers.
        let cached = streamer.last_price("tok1").unwrap();
        assert_eq!(cached.best_bid, Some(dec!(0.06)));
    }

    #[tokio::test]
    async fn price_change_array_dispatches_per_asset() {
        let streamer = test_streamer();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        streamer.set_handler(Arc::new(move |_, _| {
            let count = count_clone.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        }));

        let text = r#"[{
            "event_type": "price_change",
            "asset_id": "m1",
            "price_changes": [
                {"asset_id":"tokA","best_bid":"0.41","best_ask":"0.44"},
                {"asset_id":"tokB","best_bid":"0.55","best_ask":"0.58"}
            ]
        }]"#;
        streamer.handle_text(text).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn garbage_messages_are_ignored() {
        let streamer = test_streamer();
        streamer.set_handler(Arc::new(|_, _| Box::pin(async {})));
        streamer.handle_text("not json").await;
        streamer.handle_text(r#"{"event_type":"mystery"}"#).await;
        // Still in the initial state; nothing panicked.
        assert_eq!(streamer.state(), StreamerState::Disconnected);
    }

    #[tokio::test]
    async fn stop_transitions_to_closed() {
        let streamer = test_streamer();
        streamer.stop();
        assert_eq!(streamer.state(), StreamerState::Closed);
    }
}
