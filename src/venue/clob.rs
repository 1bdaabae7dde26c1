//! Primary CLOB venue client.
//!
//! Supports two signing modes selected by credential shape: proxy-wallet
//! (a funder address funds orders signed by the operator key) and raw EOA.
//! In dry-run mode the client is a read-only surface over the public
//! order-book endpoint with a generous virtual balance, so strategies can
//! run end-to-end without credentials.

use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{OrderReceipt, OrderRequest, VenueClient};
use crate::error::{EngineError, EngineResult};
use crate::orderbook::{OrderBook, RawOrderBook};
use crate::rate_limiter::MultiTierRateLimiter;
use crate::utils::{now_ms, Credentials, SignatureMode};

const USDC_CONTRACT: &str = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174";
const BALANCE_OF_SELECTOR: &str = "0x70a08231";
const DEFAULT_CHAIN_ID: u64 = 137;
const DRY_RUN_BALANCE: Decimal = dec!(100000);

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct PostOrderResponse {
    #[serde(default)]
    success: bool,
    #[serde(rename = "orderID", default)]
    order_id: Option<String>,
    #[serde(rename = "errorMsg", default)]
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceAllowanceResponse {
    balance: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<String>,
}

pub struct ClobVenue {
    client: Client,
    base_url: String,
    rpc_url: String,
    credentials: Credentials,
    signer: Option<PrivateKeySigner>,
    dry_run: bool,
    limiter: Arc<MultiTierRateLimiter>,
    balance_cache: RwLock<Option<Decimal>>,
    balance_timeout: Duration,
}

impl ClobVenue {
    pub fn new(
        base_url: &str,
        rpc_url: &str,
        credentials: Credentials,
        dry_run: bool,
        limiter: Arc<MultiTierRateLimiter>,
        http_timeout: Duration,
        balance_timeout: Duration,
    ) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|e| EngineError::Configuration(format!("HTTP client: {}", e)))?;

        let base_url = credentials
            .clob_url
            .clone()
            .unwrap_or_else(|| base_url.to_string());

        let signer = if dry_run {
            info!("✅ Venue client in DRY-RUN mode (read-only, no credentials required)");
            None
        } else {
            let mut signer: PrivateKeySigner = credentials
                .private_key
                .parse()
                .map_err(|e| EngineError::Configuration(format!("bad private key: {}", e)))?;
            signer.set_chain_id(Some(credentials.chain_id.unwrap_or(DEFAULT_CHAIN_ID)));

            match credentials.signature_mode() {
                SignatureMode::Proxy => info!(
                    "✅ Connected to venue (proxy mode, funder {})",
                    credentials.funder_address.as_deref().unwrap_or("?")
                ),
                SignatureMode::Eoa => {
                    info!("✅ Connected to venue (EOA mode, signer {})", signer.address())
                }
            }
            Some(signer)
        };

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rpc_url: rpc_url.to_string(),
            credentials,
            signer,
            dry_run,
            limiter,
            balance_cache: RwLock::new(None),
            balance_timeout,
        })
    }

    /// HMAC-SHA256 auth headers over timestamp + method + path (+ body).
    fn auth_headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> EngineResult<Vec<(&'static str, String)>> {
        let timestamp = Utc::now().timestamp().to_string();
        let message = format!("{}{}{}{}", timestamp, method, path, body);

        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|e| EngineError::Configuration(format!("bad API secret: {}", e)))?;
        mac.update(message.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(vec![
            ("POLY_ADDRESS", self.get_address()),
            ("POLY_API_KEY", self.credentials.api_key.clone()),
            ("POLY_PASSPHRASE", self.credentials.api_passphrase.clone()),
            ("POLY_TIMESTAMP", timestamp),
            ("POLY_SIGNATURE", signature),
        ])
    }

    /// Reads the wallet's USDC balance straight off the chain when the
    /// CLOB balance endpoint fails. Calls `balanceOf(address)` on the
    /// token contract and normalizes by its 6 decimals.
    async fn balance_via_rpc(&self, address: &str) -> EngineResult<Decimal> {
        let addr = address.trim_start_matches("0x").to_lowercase();
        let calldata = format!("{}{:0>64}", BALANCE_OF_SELECTOR, addr);

        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_call",
            "params": [{ "to": USDC_CONTRACT, "data": calldata }, "latest"],
            "id": 1
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .timeout(self.balance_timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::TransientNetwork(format!("RPC: {}", e)))?;

        let rpc: RpcResponse = response
            .json()
            .await
            .map_err(|e| EngineError::DataIntegrity(format!("RPC response: {}", e)))?;

        let result = rpc
            .result
            .ok_or_else(|| EngineError::DataIntegrity("RPC returned no result".to_string()))?;

        let raw = result.trim_start_matches("0x");
        let wei = u128::from_str_radix(raw, 16)
            .map_err(|e| EngineError::DataIntegrity(format!("bad balance hex '{}': {}", result, e)))?;

        // USDC has 6 decimals.
        let balance = Decimal::from_i128_with_scale(wei as i128, 6);
        info!("💰 On-chain balance: ${:.2} USDC (via RPC)", balance);
        Ok(balance)
    }
}

#[async_trait]
impl VenueClient for ClobVenue {
    async fn get_order_book(&self, token_id: &str) -> EngineResult<OrderBook> {
        self.limiter.acquire().await;

        let url = format!("{}/book", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("token_id", token_id)])
            .send()
            .await
            .map_err(EngineError::from)?;

        if !response.status().is_success() {
            return Err(EngineError::TransientNetwork(format!(
                "book endpoint returned {}",
                response.status()
            )));
        }

        let raw: RawOrderBook = response
            .json()
            .await
            .map_err(|e| EngineError::DataIntegrity(format!("order book payload: {}", e)))?;

        OrderBook::from_raw(token_id, &raw, now_ms())
    }

    async fn get_balance(&self, force_refresh: bool) -> EngineResult<Decimal> {
        if self.dry_run {
            return Ok(DRY_RUN_BALANCE);
        }

        if !force_refresh {
            if let Some(cached) = *self.balance_cache.read().await {
                return Ok(cached);
            }
        }

        self.limiter.acquire().await;

        let path = "/balance-allowance";
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url).timeout(self.balance_timeout);
        for (name, value) in self.auth_headers("GET", path, "")? {
            request = request.header(name, value);
        }

        let balance = match request.send().await {
            Ok(response) if response.status().is_success() => response
                .json::<BalanceAllowanceResponse>()
                .await
                .ok()
                .and_then(|b| b.balance.parse::<Decimal>().ok()),
            Ok(response) => {
                warn!("Balance endpoint returned {}", response.status());
                None
            }
            Err(e) => {
                warn!("Could not fetch balance via CLOB client: {}", e);
                None
            }
        };

        let balance = match balance {
            Some(b) => b,
            // Fall back to reading the chain directly.
            None => {
                let address = self
                    .credentials
                    .funder_address
                    .clone()
                    .unwrap_or_else(|| self.get_address());
                self.balance_via_rpc(&address).await?
            }
        };

        *self.balance_cache.write().await = Some(balance);
        debug!("💰 Balance: ${:.2} USDC", balance);
        Ok(balance)
    }

    async fn post_order(&self, order: &OrderRequest) -> EngineResult<OrderReceipt> {
        if self.dry_run {
            return Err(EngineError::VenueRejection(
                "dry-run venue surface is read-only".to_string(),
            ));
        }

        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| EngineError::Configuration("no signer available".to_string()))?;

        self.limiter.acquire().await;

        let maker = match self.credentials.signature_mode() {
            SignatureMode::Proxy => self
                .credentials
                .funder_address
                .clone()
                .unwrap_or_else(|| signer.address().to_string()),
            SignatureMode::Eoa => signer.address().to_string(),
        };
        let signature_type = match self.credentials.signature_mode() {
            SignatureMode::Proxy => 1u8,
            SignatureMode::Eoa => 0u8,
        };

        let salt = uuid::Uuid::new_v4().to_string();
        let digest_input = format!(
            "{}:{}:{}:{}:{}:{}",
            salt, order.token_id, order.side, order.price, order.size, maker
        );
        let signature = signer
            .sign_message(digest_input.as_bytes())
            .await
            .map_err(|e| EngineError::Configuration(format!("order signing failed: {}", e)))?;

        let body = serde_json::json!({
            "order": {
                "salt": salt,
                "maker": maker,
                "signer": signer.address().to_string(),
                "tokenId": order.token_id,
                "side": order.side.as_str(),
                "price": order.price.to_string(),
                "size": order.size.to_string(),
                "signatureType": signature_type,
                "signature": format!("0x{}", hex::encode(signature.as_bytes())),
            },
            "owner": self.credentials.api_key,
            "orderType": order.order_type.as_str(),
        });
        let body_str = body.to_string();

        debug!(
            "📝 Posting order: {} {} @ ${:.4} ({})",
            order.side,
            order.size,
            order.price,
            order.order_type.as_str()
        );

        let path = "/order";
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(&body);
        for (name, value) in self.auth_headers("POST", path, &body_str)? {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(EngineError::from)?;
        let parsed: PostOrderResponse = response
            .json()
            .await
            .map_err(|e| EngineError::DataIntegrity(format!("order response: {}", e)))?;

        if parsed.success {
            let order_id = parsed.order_id.unwrap_or_else(|| "unknown".to_string());
            info!("✅ Order executed: {}", order_id);
            Ok(OrderReceipt {
                venue_order_id: order_id,
                filled_size: order.size,
                avg_fill_price: order.price,
            })
        } else {
            let reason = parsed
                .error_msg
                .unwrap_or_else(|| "Unknown error".to_string());
            Err(EngineError::VenueRejection(reason))
        }
    }

    fn get_address(&self) -> String {
        match &self.signer {
            Some(signer) => signer.address().to_string(),
            None => "0xSIMULATION_WALLET".to_string(),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> EngineResult<bool> {
        if self.dry_run {
            return Ok(false);
        }

        self.limiter.acquire().await;

        let path = "/order";
        let url = format!("{}{}", self.base_url, path);
        let body = serde_json::json!({ "orderID": order_id });
        let body_str = body.to_string();

        let mut request = self.client.delete(&url).json(&body);
        for (name, value) in self.auth_headers("DELETE", path, &body_str)? {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                info!("🗑️ Cancelled order {}", order_id);
                Ok(true)
            }
            Ok(response) => {
                warn!("Cancel of {} returned {}", order_id, response.status());
                Ok(false)
            }
            Err(e) => Err(EngineError::TransientNetwork(e.to_string())),
        }
    }
}
