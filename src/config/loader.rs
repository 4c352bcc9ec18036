/// Configuration loading from TOML file
use std::collections::HashSet;
use std::path::Path;

use crate::error::{Result, StreamError};
use crate::types::Config;

/// Environment variable that overrides `feed.api_key`
pub const API_KEY_ENV: &str = "FINNHUB_API_KEY";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| StreamError::ConfigError(format!("Failed to read config file: {}", e)))?;

    let mut config = parse_config(&content)?;

    if let Ok(api_key) = std::env::var(API_KEY_ENV) {
        if !api_key.trim().is_empty() {
            config.feed.api_key = Some(api_key);
        }
    }

    validate_config(&config)?;

    Ok(config)
}

/// Parse without environment overrides or validation
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content)
        .map_err(|e| StreamError::ConfigError(format!("Failed to parse config: {}", e)))
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Credential
    match config.feed.api_key.as_deref() {
        Some(key) if !key.trim().is_empty() => {}
        _ => {
            return Err(StreamError::ConfigError(format!(
                "{} is not set. Please configure it in the environment or feed.api_key",
                API_KEY_ENV
            )));
        }
    }

    if config.feed.base_url.is_empty() {
        return Err(StreamError::ConfigError("feed.base_url is empty".to_string()));
    }

    // Backoff
    if config.feed.reconnect_base_delay_ms == 0 {
        return Err(StreamError::InvalidParameter(
            "reconnect_base_delay_ms must be > 0".to_string(),
        ));
    }

    if config.feed.reconnect_max_delay_ms < config.feed.reconnect_base_delay_ms {
        return Err(StreamError::InvalidParameter(format!(
            "reconnect_max_delay_ms ({}) must be >= reconnect_base_delay_ms ({})",
            config.feed.reconnect_max_delay_ms, config.feed.reconnect_base_delay_ms
        )));
    }

    // Pairs
    if config.pairs.is_empty() {
        return Err(StreamError::ConfigError("No pairs configured".to_string()));
    }

    let mut pairs = HashSet::new();
    let mut symbols = HashSet::new();
    for mapping in &config.pairs {
        if mapping.pair.is_empty() || mapping.symbol.is_empty() {
            return Err(StreamError::ConfigError(
                "Pair and symbol must not be empty".to_string(),
            ));
        }
        if !pairs.insert(mapping.pair.as_str()) {
            return Err(StreamError::ConfigError(format!("Duplicate pair: {}", mapping.pair)));
        }
        if !symbols.insert(mapping.symbol.as_str()) {
            return Err(StreamError::ConfigError(format!(
                "Duplicate feed symbol: {}",
                mapping.symbol
            )));
        }
    }

    // Subscribers
    if config.server.subscriber_buffer == 0 {
        return Err(StreamError::InvalidParameter(
            "subscriber_buffer must be > 0".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogFormat;

    const SAMPLE: &str = r#"
log_level = "debug"
log_format = "json"

[feed]
api_key = "abc123"
reconnect_base_delay_ms = 500
reconnect_max_delay_ms = 8000

[[pairs]]
pair = "ETH/USDC"
symbol = "BINANCE:ETHUSDC"

[[pairs]]
pair = "ETH/BTC"
symbol = "BINANCE:ETHBTC"

[server]
bind_addr = "0.0.0.0:9001"
"#;

    #[test]
    fn test_parse_config() {
        let config = parse_config(SAMPLE).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.feed.base_url, "wss://ws.finnhub.io");
        assert_eq!(config.feed.reconnect_base_delay_ms, 500);
        assert_eq!(config.supported_pairs(), vec!["ETH/USDC", "ETH/BTC"]);
        assert_eq!(config.server.bind_addr, "0.0.0.0:9001");
        assert_eq!(config.server.subscriber_buffer, 256);
        assert_eq!(config.storage.path, "data/hourly_averages.jsonl");
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_defaults_from_empty_file() {
        let config = parse_config("").unwrap();
        assert_eq!(config.pairs.len(), 3);
        assert_eq!(config.feed.reconnect_max_delay_ms, 30_000);
    }

    #[test]
    fn test_missing_credential_is_config_error() {
        let config = parse_config("").unwrap();
        let err = validate_config(&config).unwrap_err();
        assert_eq!(err.error_code(), "CFG_001");
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains(API_KEY_ENV));
    }

    #[test]
    fn test_rejects_bad_backoff() {
        let mut config = parse_config(SAMPLE).unwrap();
        config.feed.reconnect_max_delay_ms = 100;
        assert!(validate_config(&config).is_err());

        config.feed.reconnect_max_delay_ms = 8000;
        config.feed.reconnect_base_delay_ms = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_duplicate_symbols() {
        let mut config = parse_config(SAMPLE).unwrap();
        config.pairs[1].symbol = "BINANCE:ETHUSDC".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_unreadable_file() {
        let err = load_config("/definitely/not/here.toml").unwrap_err();
        assert_eq!(err.error_code(), "CFG_001");
    }
}
