use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Raw webhook event, stored verbatim for auditing
///
/// The payload is immutable once recorded; only `status` advances when the
/// event is normalized (or rejected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: i64,
    pub source: String,
    pub received_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub client_ip: Option<String>,
    pub status: RawEventStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RawEventStatus {
    Received,
    Processed,
    Failed,
}

impl RawEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RawEventStatus::Received => "received",
            RawEventStatus::Processed => "processed",
            RawEventStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(RawEventStatus::Received),
            "processed" => Some(RawEventStatus::Processed),
            "failed" => Some(RawEventStatus::Failed),
            _ => None,
        }
    }
}

/// Trading action carried by a signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Close,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Close => "close",
            SignalAction::Hold => "hold",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(SignalAction::Buy),
            "sell" => Some(SignalAction::Sell),
            "close" => Some(SignalAction::Close),
            "hold" => Some(SignalAction::Hold),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a normalized signal, driven by the dispatcher
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Pending,
    Processing,
    Executed,
    Failed,
    Ignored,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Pending => "pending",
            SignalStatus::Processing => "processing",
            SignalStatus::Executed => "executed",
            SignalStatus::Failed => "failed",
            SignalStatus::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SignalStatus::Pending),
            "processing" => Some(SignalStatus::Processing),
            "executed" => Some(SignalStatus::Executed),
            "failed" => Some(SignalStatus::Failed),
            "ignored" => Some(SignalStatus::Ignored),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized trading signal persisted alongside its raw event
///
/// Either references a raw event or carries a synthetic source tag when the
/// producer skipped raw storage. Symbol and action are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedSignal {
    pub id: i64,
    pub raw_event_id: Option<i64>,
    pub source: String,
    pub symbol: String,
    pub action: SignalAction,
    pub price: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub strategy: Option<String>,
    pub timeframe: Option<String>,
    pub metadata: serde_json::Value,
    pub status: SignalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A normalized signal that has not been persisted yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewSignal {
    pub source: String,
    pub symbol: String,
    pub action: SignalAction,
    pub price: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub strategy: Option<String>,
    pub timeframe: Option<String>,
    pub metadata: serde_json::Value,
}
