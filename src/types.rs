/// Core type definitions for the rate streaming service
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::time::normalize_to_utc;

/// Live price observation decoded from the upstream feed
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub pair: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn new(pair: impl Into<String>, price: f64, timestamp: DateTime<Utc>) -> Self {
        Tick {
            pair: pair.into(),
            price,
            timestamp,
        }
    }

    /// Build a tick from a timestamp carrying any zone; stored as UTC
    pub fn from_zoned<Tz: TimeZone>(pair: impl Into<String>, price: f64, timestamp: DateTime<Tz>) -> Self {
        Tick::new(pair, price, normalize_to_utc(timestamp))
    }
}

/// Public view of one pair, rebuilt on demand from the aggregation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairState {
    pub pair: String,
    pub price: Option<f64>,
    pub hourly_avg: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Finalized (or persisted) average for one pair over one UTC hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyAverage {
    pub pair: String,
    pub hour_start: DateTime<Utc>,
    pub avg_price: f64,
    pub count: u64,
}

/// Pushed to subscribers after every processed tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateUpdateMessage {
    pub pair: String,
    pub price: f64,
    pub hourly_avg: f64,
    pub last_update: DateTime<Utc>,
}

/// Point-in-time view of every configured pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatesSnapshot {
    pub pairs: Vec<PairState>,
}

/// Frames written to subscriber connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "rate_update")]
    RateUpdate(RateUpdateMessage),
    #[serde(rename = "snapshot")]
    Snapshot(RatesSnapshot),
}

/// Internal pair identifier and the symbol the feed knows it by
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairMapping {
    pub pair: String,
    pub symbol: String,
}

impl PairMapping {
    pub fn new(pair: &str, symbol: &str) -> Self {
        PairMapping {
            pair: pair.to_string(),
            symbol: symbol.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Logging
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,

    // Upstream feed
    #[serde(default)]
    pub feed: FeedConfig,

    // Supported pairs, in snapshot order
    #[serde(default = "default_pairs")]
    pub pairs: Vec<PairMapping>,

    // Subscriber transport
    #[serde(default)]
    pub server: ServerConfig,

    // Hourly average storage
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub subscriber_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            base_url: "wss://ws.finnhub.io".to_string(),
            api_key: None,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "127.0.0.1:8000".to_string(),
            subscriber_buffer: 256,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            path: "data/hourly_averages.jsonl".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            feed: FeedConfig::default(),
            pairs: default_pairs(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_pairs() -> Vec<PairMapping> {
    vec![
        PairMapping::new("ETH/USDC", "BINANCE:ETHUSDC"),
        PairMapping::new("ETH/USDT", "BINANCE:ETHUSDT"),
        PairMapping::new("ETH/BTC", "BINANCE:ETHBTC"),
    ]
}

impl Config {
    pub fn supported_pairs(&self) -> Vec<String> {
        self.pairs.iter().map(|m| m.pair.clone()).collect()
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.feed.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.feed.reconnect_max_delay_ms)
    }
}
