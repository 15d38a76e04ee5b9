//! Webhook payload normalization
//!
//! Alert producers disagree on field names: TradingView templates send
//! `ticker`/`action`, other bots send `symbol`/`signal` or `side`. This
//! module maps the known aliases onto a `NewSignal` and keeps every
//! unrecognized top-level key in the signal's metadata.

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;
use thiserror::Error;

use crate::models::{NewSignal, SignalAction};

const SYMBOL_KEYS: &[&str] = &["symbol", "ticker"];
const ACTION_KEYS: &[&str] = &["action", "signal", "side"];
const PRICE_KEYS: &[&str] = &["price", "close"];
const VOLUME_KEYS: &[&str] = &["volume", "qty", "quantity"];
const STRATEGY_KEYS: &[&str] = &["strategy"];
const TIMEFRAME_KEYS: &[&str] = &["timeframe", "interval"];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum NormalizeError {
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("missing symbol field (symbol or ticker)")]
    MissingSymbol,
    #[error("missing action field (action, signal or side)")]
    MissingAction,
    #[error("price must be a non-negative number")]
    InvalidPrice,
    #[error("volume must be a non-negative number")]
    InvalidVolume,
}

/// Map a raw webhook payload onto a `NewSignal`
///
/// Symbol and action are required; unknown action words degrade to `hold`
/// rather than rejecting the alert. Remaining top-level keys survive in
/// metadata.
pub fn normalize(source: &str, payload: &Value) -> Result<NewSignal, NormalizeError> {
    let obj = payload.as_object().ok_or(NormalizeError::NotAnObject)?;

    let symbol = first_string(obj, SYMBOL_KEYS)
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .ok_or(NormalizeError::MissingSymbol)?;

    let action_raw = first_string(obj, ACTION_KEYS).ok_or(NormalizeError::MissingAction)?;
    let action = parse_action(&action_raw);

    let price = first_decimal(obj, PRICE_KEYS, NormalizeError::InvalidPrice)?;
    let volume = first_decimal(obj, VOLUME_KEYS, NormalizeError::InvalidVolume)?;

    let strategy = first_string(obj, STRATEGY_KEYS).map(|s| s.trim().to_string());
    let timeframe = first_string(obj, TIMEFRAME_KEYS).map(|s| s.trim().to_string());

    Ok(NewSignal {
        source: source.to_string(),
        symbol,
        action,
        price,
        volume,
        strategy,
        timeframe,
        metadata: leftover_metadata(obj),
    })
}

/// Translate an action word into a `SignalAction`
///
/// Unknown words become `hold`; the alert is still recorded so the sender
/// can be diagnosed from the audit trail.
fn parse_action(raw: &str) -> SignalAction {
    match raw.trim().to_lowercase().as_str() {
        "buy" | "long" => SignalAction::Buy,
        "sell" | "short" => SignalAction::Sell,
        "close" | "exit" | "flat" => SignalAction::Close,
        "hold" | "wait" => SignalAction::Hold,
        other => {
            tracing::warn!("Unknown action '{}', defaulting to hold", other);
            SignalAction::Hold
        }
    }
}

fn first_string(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(|v| v.as_str().map(|s| s.to_string()))
}

fn first_decimal(
    obj: &Map<String, Value>,
    keys: &[&str],
    err: NormalizeError,
) -> Result<Option<Decimal>, NormalizeError> {
    for key in keys {
        match obj.get(*key) {
            None | Some(Value::Null) => continue,
            Some(value) => {
                let parsed = parse_decimal(value).ok_or_else(|| err.clone())?;
                if parsed < Decimal::ZERO {
                    return Err(err);
                }
                return Ok(Some(parsed));
            }
        }
    }
    Ok(None)
}

fn parse_decimal(value: &Value) -> Option<Decimal> {
    match value {
        // Numbers go through their string form to avoid f64 artifacts
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// Everything not consumed by the alias mapping stays with the signal
fn leftover_metadata(obj: &Map<String, Value>) -> Value {
    let consumed: Vec<&str> = SYMBOL_KEYS
        .iter()
        .chain(ACTION_KEYS)
        .chain(PRICE_KEYS)
        .chain(VOLUME_KEYS)
        .chain(STRATEGY_KEYS)
        .chain(TIMEFRAME_KEYS)
        .copied()
        .collect();

    let rest: Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| !consumed.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Value::Object(rest)
}
