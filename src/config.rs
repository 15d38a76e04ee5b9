use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::risk::RiskParams;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_DB_TIMEOUT_MS: u64 = 750;
const DEFAULT_RATE_LIMIT_RPM: u32 = 120;
const DEFAULT_DISPATCH_INTERVAL_SECS: u64 = 5;
const DEFAULT_DISPATCH_BATCH_SIZE: i64 = 16;
const DEFAULT_DEDUP_WINDOW_SECS: i64 = 300;
const DEFAULT_BYBIT_BASE_URL: &str = "https://api.bybit.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not found in environment")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime configuration, read once from the environment at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub webhook_token: String,
    /// Upper bound on database work inside the webhook request cycle
    pub db_timeout: Duration,
    /// Webhook requests allowed per client IP per minute
    pub rate_limit_rpm: u32,
    pub dispatch: DispatchConfig,
    /// Present only when exchange credentials are configured; the dispatcher
    /// is not started without them
    pub exchange: Option<ExchangeConfig>,
    pub risk: RiskParams,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub interval: Duration,
    pub batch_size: i64,
    /// Signals for the same (symbol, action) inside this window are ignored
    pub dedup_window_secs: i64,
    /// Signals stuck in processing longer than this are re-queued
    pub stale_after_secs: i64,
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = require("DATABASE_URL")?;
        let webhook_token = require("WEBHOOK_TOKEN")?;

        let bind_addr: SocketAddr = parse_or("BIND_ADDR", DEFAULT_BIND_ADDR.parse().unwrap())?;
        let db_timeout_ms: u64 = parse_or("DB_TIMEOUT_MS", DEFAULT_DB_TIMEOUT_MS)?;
        let rate_limit_rpm: u32 = parse_or("RATE_LIMIT_RPM", DEFAULT_RATE_LIMIT_RPM)?;
        if rate_limit_rpm == 0 {
            return Err(ConfigError::Invalid {
                key: "RATE_LIMIT_RPM",
                value: "0".to_string(),
            });
        }

        let interval_secs: u64 =
            parse_or("DISPATCH_INTERVAL_SECS", DEFAULT_DISPATCH_INTERVAL_SECS)?;
        let dispatch = DispatchConfig {
            interval: Duration::from_secs(interval_secs.max(1)),
            batch_size: parse_or("DISPATCH_BATCH_SIZE", DEFAULT_DISPATCH_BATCH_SIZE)?,
            dedup_window_secs: parse_or("DEDUP_WINDOW_SECS", DEFAULT_DEDUP_WINDOW_SECS)?,
            // Generous multiple of the poll interval; a crashed dispatcher
            // releases its claims on the next pass
            stale_after_secs: (interval_secs as i64).max(1) * 10,
        };

        let exchange = match (
            std::env::var("BYBIT_API_KEY").ok(),
            std::env::var("BYBIT_API_SECRET").ok(),
        ) {
            (Some(api_key), Some(api_secret)) if !api_key.is_empty() && !api_secret.is_empty() => {
                Some(ExchangeConfig {
                    base_url: std::env::var("BYBIT_BASE_URL")
                        .unwrap_or_else(|_| DEFAULT_BYBIT_BASE_URL.to_string()),
                    api_key,
                    api_secret,
                })
            }
            _ => None,
        };

        let risk = RiskParams {
            max_position_usd: parse_or("MAX_POSITION_USD", RiskParams::default().max_position_usd)?,
            leverage: parse_or("LEVERAGE", RiskParams::default().leverage)?,
            stop_loss_pct: parse_or("STOP_LOSS_PCT", RiskParams::default().stop_loss_pct)?,
            take_profit_pct: parse_or("TAKE_PROFIT_PCT", RiskParams::default().take_profit_pct)?,
        };
        risk.validate().map_err(|e| ConfigError::Invalid {
            key: "risk parameters",
            value: e.to_string(),
        })?;

        Ok(Self {
            database_url,
            bind_addr,
            webhook_token,
            db_timeout: Duration::from_millis(db_timeout_ms),
            rate_limit_rpm,
            dispatch,
            exchange,
            risk,
        })
    }
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn parse_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::Invalid { key, value: v }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them serialized by testing
    // the parse helpers directly instead.

    #[test]
    fn test_parse_or_uses_default_when_unset() {
        let value: u64 = parse_or("TRADEHOOK_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_default_bind_addr_is_valid() {
        let addr: SocketAddr = DEFAULT_BIND_ADDR.parse().unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_missing_database_url_is_reported() {
        // DATABASE_URL may be set in dev shells; exercise the helper with a
        // key that is never set.
        let err = require("TRADEHOOK_TEST_REQUIRED_KEY").unwrap_err();
        assert!(err.to_string().contains("TRADEHOOK_TEST_REQUIRED_KEY"));
    }
}
