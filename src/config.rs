// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : touchguard — price-triggered settlement engine in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Streams per-symbol last-trade prices (mock/Binance futures),
          aggregates per-cycle high/low windows, matches live contracts
          against claim/stop thresholds, settles each contract exactly once
          on a bounded worker pool, moves balances through the ledger with
          compensation on partial failure, and cancels venue hedges.
=============================================================================
*/
use std::env;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use dotenvy::dotenv;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Mode sumber market data / venue hedge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarketMode {
    Mock,
    BinanceTestnet,
    BinanceMainnet,
}

impl MarketMode {
    pub fn from_env(key: &str, default_mode: MarketMode) -> MarketMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock"            => MarketMode::Mock,
            "binance_testnet" => MarketMode::BinanceTestnet,
            "binance_mainnet" => MarketMode::BinanceMainnet,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketMode::Mock => "mock",
            MarketMode::BinanceTestnet => "binance_testnet",
            MarketMode::BinanceMainnet => "binance_mainnet",
        }
    }

    // Endpoint default per mode (USD-M futures)
    pub fn default_ws_url(&self) -> &'static str {
        match self {
            MarketMode::Mock            => "wss://stream.binancefuture.com/ws", // tidak dipakai saat mock
            MarketMode::BinanceTestnet  => "wss://stream.binancefuture.com/ws",
            MarketMode::BinanceMainnet  => "wss://fstream.binance.com/ws",
        }
    }

    pub fn default_rest_url(&self) -> &'static str {
        match self {
            MarketMode::Mock            => "https://testnet.binancefuture.com", // placeholder
            MarketMode::BinanceTestnet  => "https://testnet.binancefuture.com",
            MarketMode::BinanceMainnet  => "https://fapi.binance.com",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} missing (required when {mode_key}={mode})")]
    Missing { key: &'static str, mode_key: &'static str, mode: &'static str },
    #[error("invalid {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("read {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("parse {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
}

/// API key pair for one hedge sub-account.
#[derive(Clone, Debug, Deserialize)]
pub struct VenueCredential {
    pub id: u64,
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub symbols: Vec<String>,

    // files/metrics
    pub contracts_file: Option<String>,
    pub record_file: Option<String>,
    pub metrics_port: u16,
    pub admin_port: u16,

    // market mode
    pub feed_mode: MarketMode,
    pub venue_mode: MarketMode,
    pub binance_ws_url: String,
    pub binance_rest_url: String,
    pub binance_recv_window: u64,
    pub default_credential: Option<VenueCredential>,
    pub hedge_accounts: Vec<VenueCredential>,

    // external services
    pub ledger_url: Option<String>,
    pub alert_webhook_url: Option<String>,
    pub pool_user_id: String,

    // cadence
    pub scan_interval: Duration,
    pub stale_after: Duration,
    pub stale_check: Duration,
}

#[derive(Clone, Debug)]
pub struct Limits {
    pub settle_workers: usize,
    pub ledger_timeout: Duration,
    pub exchange_timeout: Duration,
    pub store_timeout: Duration,
    pub retry: RetryPolicy,
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: v }),
        _ => Ok(default),
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// SYMBOLS=BTCUSDT,ETHUSDT -> ["BTCUSDT", "ETHUSDT"]
pub fn parse_symbols(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = raw
        .split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .collect();
    out.dedup();
    out
}

fn load_accounts(path: &str) -> Result<Vec<VenueCredential>, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.to_string(), source })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.to_string(), source })
}

pub fn load() -> Result<(Args, Limits), ConfigError> {
    // Pastikan .env dibaca
    let _ = dotenv();

    let symbols = env_opt("SYMBOLS")
        .map(|s| parse_symbols(&s))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec!["BTCUSDT".to_string()]);

    let feed_mode = MarketMode::from_env("FEED_MODE", MarketMode::Mock);
    let venue_mode = MarketMode::from_env("VENUE_MODE", MarketMode::Mock);

    let binance_ws_url = env_opt("BINANCE_WS_URL")
        .unwrap_or_else(|| feed_mode.default_ws_url().to_string());
    let binance_rest_url = env_opt("BINANCE_REST_URL")
        .unwrap_or_else(|| venue_mode.default_rest_url().to_string());

    let default_credential = match (env_opt("BINANCE_API_KEY"), env_opt("BINANCE_API_SECRET")) {
        (Some(api_key), Some(api_secret)) => Some(VenueCredential { id: 0, api_key, api_secret }),
        _ => None,
    };
    let hedge_accounts = match env_opt("HEDGE_ACCOUNTS_FILE") {
        Some(path) => load_accounts(&path)?,
        None => Vec::new(),
    };
    if venue_mode != MarketMode::Mock && default_credential.is_none() && hedge_accounts.is_empty() {
        return Err(ConfigError::Missing {
            key: "BINANCE_API_KEY/BINANCE_API_SECRET",
            mode_key: "VENUE_MODE",
            mode: venue_mode.as_str(),
        });
    }

    let workers_default = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);

    let args = Args {
        symbols,
        contracts_file: env_opt("CONTRACTS_FILE"),
        record_file: env_opt("RECORD_FILE"),
        metrics_port: env_or("METRICS_PORT", 9898)?,
        admin_port: env_or("ADMIN_PORT", 9899)?,
        feed_mode,
        venue_mode,
        binance_ws_url,
        binance_rest_url,
        binance_recv_window: env_or("BINANCE_RECV_WINDOW", 5000)?,
        default_credential,
        hedge_accounts,
        ledger_url: env_opt("LEDGER_URL"),
        alert_webhook_url: env_opt("ALERT_WEBHOOK_URL"),
        pool_user_id: env_or("POOL_USER_ID", "pool".to_string())?,
        scan_interval: Duration::from_millis(env_or("SCAN_INTERVAL_MS", 5_000)?),
        stale_after: Duration::from_secs(env_or("STALE_AFTER_SECS", 180)?),
        stale_check: Duration::from_secs(env_or("STALE_CHECK_SECS", 10)?),
    };

    let limits = Limits {
        settle_workers: env_or("SETTLE_WORKERS", workers_default)?.max(1),
        ledger_timeout: Duration::from_millis(env_or("LEDGER_TIMEOUT_MS", 5_000)?),
        exchange_timeout: Duration::from_millis(env_or("EXCHANGE_TIMEOUT_MS", 10_000)?),
        store_timeout: Duration::from_millis(env_or("STORE_TIMEOUT_MS", 5_000)?),
        retry: RetryPolicy::new(env_or("RETRY_MAX_ATTEMPTS", 3)?, env_or("RETRY_BASE_MS", 1_000)?, 10_000),
    };
    Ok((args, limits))
}

// ===== CLI =====

#[derive(Debug, Parser)]
#[command(name = "touchguard", about = "Price-triggered contract settlement engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Stream prices, scan contracts and settle matches (default)
    Run,
    /// Settle one still-available contract by hand
    Replay {
        #[arg(long)]
        contract_id: String,
        #[arg(long, value_enum)]
        outcome: ReplayOutcome,
        /// Defaults to the contract's claim/stop price for the outcome
        #[arg(long, value_parser = parse_decimal)]
        close_price: Option<Decimal>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayOutcome {
    Claimed,
    Liquidated,
}

fn parse_decimal(s: &str) -> Result<Decimal, String> {
    Decimal::from_str(s.trim()).map_err(|e| format!("{s}: {e}"))
}
