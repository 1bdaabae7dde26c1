use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use config::{Config as ConfigLoader, Environment};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub trading: TradingConfig,
    pub execution: ExecutionConfig,
    pub markets: MarketsConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub clob_url: String,
    pub wss_url: String,
    pub catalog_url: String,
    pub rpc_url: String,
    pub secondary_venue_url: String,
    pub llm_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            clob_url: "https://clob.polymarket.com".to_string(),
            wss_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            catalog_url: "https://gamma-api.polymarket.com".to_string(),
            rpc_url: "https://polygon-rpc.com".to_string(),
            secondary_venue_url: "https://api.kalshi.com/trade-api/v2".to_string(),
            llm_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Conservative per-leg fee/slippage upper bound.
    pub estimated_fee: Decimal,
    /// Contracts per leg for two-leg strategies (clamped by ladder depth).
    pub pair_size: Decimal,
    pub min_position_usd: Decimal,
    pub data_dir: String,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            estimated_fee: dec!(0.01),
            pair_size: dec!(10),
            min_position_usd: dec!(1),
            data_dir: "data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub http_timeout_secs: u64,
    pub balance_timeout_secs: u64,
    pub ws_connect_timeout_secs: u64,
    /// Streamer silence threshold before the connection counts as degraded.
    pub max_silence_secs: u64,
    pub max_retries: usize,
    pub max_reconnect_delay_secs: u64,
    pub scan_error_backoff_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 30,
            balance_timeout_secs: 10,
            ws_connect_timeout_secs: 15,
            max_silence_secs: 90,
            max_retries: 5,
            max_reconnect_delay_secs: 60,
            scan_error_backoff_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketsConfig {
    pub max_markets: usize,
    pub page_size: usize,
}

impl Default for MarketsConfig {
    fn default() -> Self {
        Self {
            max_markets: 5000,
            page_size: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub log_file: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: "logs/polyarb.log".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        use config::File;

        let settings = ConfigLoader::builder()
            .add_source(File::with_name("config/config").required(false))
            .add_source(Environment::default().prefix("POLYARB").separator("__"))
            .build()?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize config")?;

        if config.server.clob_url.is_empty() || config.server.wss_url.is_empty() {
            anyhow::bail!("Server URLs must be configured");
        }

        info!("✅ Configuration loaded successfully");
        Ok(config)
    }
}

// =============================================================================
// Account credentials (one key=value .env file per account)
// =============================================================================

/// Signing mode, selected by the presence of a funder address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMode {
    /// Proxy wallet: orders funded by `FUNDER_ADDRESS`, signed by the key.
    Proxy,
    /// Raw externally-owned account.
    Eoa,
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    pub private_key: String,
    pub funder_address: Option<String>,
    pub clob_url: Option<String>,
    pub chain_id: Option<u64>,
    pub secondary_venue_api_key: Option<String>,
    pub llm_api_key: Option<String>,
    pub default_slippage: Option<Decimal>,
}

impl Credentials {
    /// Parses a key=value credential file without touching the process
    /// environment, so concurrent accounts never clobber each other.
    pub fn from_env_file(path: &Path) -> EngineResult<Self> {
        let mut creds = Credentials::default();

        let iter = dotenv::from_path_iter(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;

        for item in iter {
            let (key, value) = item.map_err(|e| {
                EngineError::Configuration(format!("bad line in {}: {}", path.display(), e))
            })?;
            match key.as_str() {
                "API_KEY" => creds.api_key = value,
                "API_SECRET" => creds.api_secret = value,
                "API_PASSPHRASE" => creds.api_passphrase = value,
                "PRIVATE_KEY" => creds.private_key = value,
                "FUNDER_ADDRESS" if !value.is_empty() => creds.funder_address = Some(value),
                "CLOB_URL" if !value.is_empty() => creds.clob_url = Some(value),
                "CHAIN_ID" => {
                    creds.chain_id = Some(value.parse().map_err(|_| {
                        EngineError::Configuration(format!("invalid CHAIN_ID '{}'", value))
                    })?)
                }
                "SECONDARY_VENUE_API_KEY" if !value.is_empty() => {
                    creds.secondary_venue_api_key = Some(value)
                }
                "GEMINI_API_KEY" | "OPENAI_API_KEY" if !value.is_empty() => {
                    creds.llm_api_key.get_or_insert(value);
                }
                "DEFAULT_SLIPPAGE" => {
                    creds.default_slippage = value.parse().ok();
                }
                _ => {}
            }
        }

        Ok(creds)
    }

    /// Fallback when no `--env` file is given.
    pub fn from_process_env() -> Self {
        let get = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
        Credentials {
            api_key: get("API_KEY").unwrap_or_default(),
            api_secret: get("API_SECRET").unwrap_or_default(),
            api_passphrase: get("API_PASSPHRASE").unwrap_or_default(),
            private_key: get("PRIVATE_KEY").unwrap_or_default(),
            funder_address: get("FUNDER_ADDRESS"),
            clob_url: get("CLOB_URL"),
            chain_id: get("CHAIN_ID").and_then(|v| v.parse().ok()),
            secondary_venue_api_key: get("SECONDARY_VENUE_API_KEY"),
            llm_api_key: get("GEMINI_API_KEY").or_else(|| get("OPENAI_API_KEY")),
            default_slippage: get("DEFAULT_SLIPPAGE").and_then(|v| v.parse().ok()),
        }
    }

    #[inline]
    pub fn signature_mode(&self) -> SignatureMode {
        if self.funder_address.is_some() {
            SignatureMode::Proxy
        } else {
            SignatureMode::Eoa
        }
    }

    /// Dry-run needs no credentials; live trading needs the full key set.
    pub fn validate(&self, dry_run: bool) -> EngineResult<()> {
        if dry_run {
            return Ok(());
        }

        let mut missing = Vec::new();
        for (name, value) in [
            ("API_KEY", &self.api_key),
            ("API_SECRET", &self.api_secret),
            ("API_PASSPHRASE", &self.api_passphrase),
            ("PRIVATE_KEY", &self.private_key),
        ] {
            if value.is_empty() {
                missing.push(name);
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Configuration(format!(
                "missing required credentials: {}",
                missing.join(", ")
            )))
        }
    }
}

// =============================================================================
// Tracing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogRotation {
    #[default]
    Size,
    Time,
}

pub fn setup_tracing(log_level: &str, log_file: &str, rotation: LogRotation) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let dir = Path::new(log_file)
        .parent()
        .unwrap_or_else(|| Path::new("."));
    let file = Path::new(log_file)
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("polyarb.log"));

    let file_appender = match rotation {
        LogRotation::Time => tracing_appender::rolling::daily(dir, file),
        LogRotation::Size => tracing_appender::rolling::never(dir, file),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_appender),
        )
        .init();
}

// =============================================================================
// P&L and time math
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PnlReport {
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
}

#[inline]
pub fn calculate_pnl(entry_price: Decimal, exit_price: Decimal, size: Decimal) -> PnlReport {
    let pnl = (exit_price - entry_price) * size;
    let pnl_pct = if entry_price > Decimal::ZERO {
        (exit_price / entry_price - Decimal::ONE) * Decimal::ONE_HUNDRED
    } else {
        Decimal::ZERO
    };
    PnlReport { pnl, pnl_pct }
}

/// Units purchasable with `percent_of_balance` of the wallet at `price`,
/// floored at `min_size` units.
#[inline]
pub fn calculate_position_size(
    balance: Decimal,
    percent_of_balance: Decimal,
    price: Decimal,
    min_size: Decimal,
) -> Decimal {
    if price <= Decimal::ZERO {
        return min_size;
    }
    let usd_to_invest = balance * percent_of_balance;
    (usd_to_invest / price).max(min_size)
}

pub fn parse_end_date(end_date: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(end_date)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn hours_until_close(end_date: &str) -> Option<Decimal> {
    let end = parse_end_date(end_date)?;
    let secs = end.signed_duration_since(Utc::now()).num_seconds();
    Some(Decimal::from(secs) / dec!(3600))
}

/// Days until market close, clamped to at least 0.1; unparseable expiries
/// fall back to a full year so the ROI gate stays conservative.
pub fn days_until_close(end_date: Option<&str>) -> Decimal {
    let fallback = dec!(365);
    let Some(end_date) = end_date else {
        return fallback;
    };
    match parse_end_date(end_date) {
        Some(end) => {
            let secs = end.signed_duration_since(Utc::now()).num_seconds();
            (Decimal::from(secs) / dec!(86400)).max(dec!(0.1))
        }
        None => fallback,
    }
}

/// profit × (365 / days): the simple annualization behind the ROI gate.
#[inline]
pub fn annualized_roi(profit: Decimal, days: Decimal) -> Decimal {
    if days <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    profit * dec!(365) / days
}

/// First six characters of a wallet address; used in logger names and
/// position-store file names.
#[inline]
pub fn short_addr(address: &str) -> String {
    address.chars().take(6).collect()
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pnl_math() {
        let report = calculate_pnl(dec!(0.05), dec!(0.08), dec!(100));
        assert_eq!(report.pnl, dec!(3.00));
        assert_eq!(report.pnl_pct, dec!(60));

        // Zero entry never divides.
        let report = calculate_pnl(Decimal::ZERO, dec!(0.08), dec!(100));
        assert_eq!(report.pnl_pct, Decimal::ZERO);
    }

    #[test]
    fn position_sizing_floors_at_min() {
        // $1000 balance, 0.5% per trade, price 0.004 → 1250 units.
        let size = calculate_position_size(dec!(1000), dec!(0.005), dec!(0.004), dec!(5));
        assert_eq!(size, dec!(1250));

        // Tiny balance clamps to the floor.
        let size = calculate_position_size(dec!(1), dec!(0.005), dec!(0.5), dec!(5));
        assert_eq!(size, dec!(5));
    }

    #[test]
    fn annualization() {
        // 0.05 profit over 36.5 days = 0.5 annualized.
        assert_eq!(annualized_roi(dec!(0.05), dec!(36.5)), dec!(0.5));
        assert_eq!(annualized_roi(dec!(0.05), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn days_until_close_fallbacks() {
        assert_eq!(days_until_close(None), dec!(365));
        assert_eq!(days_until_close(Some("not a date")), dec!(365));
        // A past date clamps to the 0.1-day floor.
        assert_eq!(days_until_close(Some("2020-01-01T00:00:00Z")), dec!(0.1));
    }

    #[test]
    fn credential_signature_mode() {
        let mut creds = Credentials::default();
        assert_eq!(creds.signature_mode(), SignatureMode::Eoa);
        creds.funder_address = Some("0xabc".to_string());
        assert_eq!(creds.signature_mode(), SignatureMode::Proxy);
    }

    #[test]
    fn validation_skipped_in_dry_run() {
        let creds = Credentials::default();
        assert!(creds.validate(true).is_ok());
        assert!(creds.validate(false).is_err());
    }
}
