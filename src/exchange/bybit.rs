use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::time::{sleep, Duration};

use crate::risk::{OrderPlan, OrderSide};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: &str = "5000";
const CATEGORY: &str = "linear";
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;
// Leverage already set to the requested value
const RET_LEVERAGE_NOT_MODIFIED: i64 = 110043;

/// Bybit v5 REST client for the dispatcher
///
/// Signed requests use the server clock: the local/server offset is captured
/// by `sync_time` and applied to every request timestamp.
pub struct BybitClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    time_offset_ms: AtomicI64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ServerTimeResult {
    #[serde(rename = "timeNano")]
    time_nano: String,
}

#[derive(Debug, Deserialize)]
struct TickerList {
    list: Vec<TickerEntry>,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    #[serde(rename = "lastPrice")]
    last_price: String,
}

#[derive(Debug, Deserialize)]
struct PositionList {
    list: Vec<PositionEntry>,
}

#[derive(Debug, Deserialize)]
struct PositionEntry {
    side: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct OrderResult {
    #[serde(rename = "orderId")]
    order_id: String,
}

impl BybitClient {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            time_offset_ms: AtomicI64::new(0),
        }
    }

    /// Capture the local/server clock offset
    ///
    /// Signed requests are rejected when the timestamp drifts outside the
    /// receive window, so this runs before the first order.
    pub async fn sync_time(&self) -> Result<()> {
        let url = format!("{}/v5/market/time", self.base_url);
        let before = Utc::now().timestamp_millis();
        let resp = self.client.get(&url).send().await?;
        let envelope: ApiResponse<ServerTimeResult> = read_envelope(resp).await?;
        let result = check(envelope)?;

        let server_ms: i64 = result
            .time_nano
            .parse::<i64>()
            .map(|nanos| nanos / 1_000_000)
            .with_context(|| format!("Unparseable server time '{}'", result.time_nano))?;

        let offset = server_ms - before;
        self.time_offset_ms.store(offset, Ordering::Relaxed);

        tracing::info!("Synchronized exchange clock (offset {}ms)", offset);

        Ok(())
    }

    fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// HMAC-SHA256 over timestamp + key + recv_window + payload, hex encoded
    fn sign(&self, timestamp: i64, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(format!("{}{}{}{}", timestamp, self.api_key, RECV_WINDOW, payload).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Last traded price for a symbol
    pub async fn last_price(&self, symbol: &str) -> Result<Decimal> {
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match self.fetch_price_once(symbol).await {
                Ok(price) => return Ok(price),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRIES {
                        let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                        tracing::warn!(
                            "Attempt {}/{} failed for {} ticker: {}. Retrying in {}ms...",
                            attempt,
                            MAX_RETRIES,
                            symbol,
                            last_error.as_ref().unwrap(),
                            backoff_ms
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("All retry attempts failed")))
    }

    async fn fetch_price_once(&self, symbol: &str) -> Result<Decimal> {
        let url = format!(
            "{}/v5/market/tickers?category={}&symbol={}",
            self.base_url, CATEGORY, symbol
        );
        let resp = self.client.get(&url).send().await?;
        let envelope: ApiResponse<TickerList> = read_envelope(resp).await?;
        let result = check(envelope)?;

        let entry = result
            .list
            .first()
            .ok_or_else(|| anyhow!("No ticker returned for {}", symbol))?;

        Decimal::from_str(&entry.last_price)
            .with_context(|| format!("Unparseable ticker price '{}'", entry.last_price))
    }

    /// Open position for a symbol, if any: (side, size)
    pub async fn position(&self, symbol: &str) -> Result<Option<(OrderSide, Decimal)>> {
        let query = format!("category={}&symbol={}", CATEGORY, symbol);
        let resp = self.signed_get("/v5/position/list", &query).await?;
        let envelope: ApiResponse<PositionList> = read_envelope(resp).await?;
        let result = check(envelope)?;

        for entry in result.list {
            let size = Decimal::from_str(&entry.size).unwrap_or(Decimal::ZERO);
            if size <= Decimal::ZERO {
                continue;
            }
            let side = match entry.side.as_str() {
                "Buy" => OrderSide::Buy,
                "Sell" => OrderSide::Sell,
                _ => continue,
            };
            return Ok(Some((side, size)));
        }

        Ok(None)
    }

    /// Set symbol leverage; already-set leverage is not an error
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        })
        .to_string();

        let resp = self.signed_post("/v5/position/set-leverage", body).await?;
        let envelope: ApiResponse<serde_json::Value> = read_envelope(resp).await?;

        if envelope.ret_code != 0 && envelope.ret_code != RET_LEVERAGE_NOT_MODIFIED {
            return Err(anyhow!(
                "Bybit error {}: {}",
                envelope.ret_code,
                envelope.ret_msg
            ));
        }

        Ok(())
    }

    /// Submit a market order, returning the exchange order id
    ///
    /// The order link id stays constant across retries, so a replay after a
    /// transport error cannot place the order twice.
    pub async fn place_order(&self, plan: &OrderPlan) -> Result<String> {
        let order_link_id = uuid::Uuid::new_v4().to_string();
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match self.place_order_once(plan, &order_link_id).await {
                Ok(order_id) => {
                    if attempt > 1 {
                        tracing::info!(
                            "✓ Order for {} placed after {} attempts",
                            plan.symbol,
                            attempt
                        );
                    }
                    return Ok(order_id);
                }
                Err(OrderError::Transport(e)) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRIES {
                        let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                        tracing::warn!(
                            "Attempt {}/{} failed for {} order: {}. Retrying in {}ms...",
                            attempt,
                            MAX_RETRIES,
                            plan.symbol,
                            last_error.as_ref().unwrap(),
                            backoff_ms
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                    }
                }
                // The exchange understood and refused; retrying cannot help
                Err(OrderError::Rejected(msg)) => return Err(anyhow!(msg)),
            }
        }

        Err(anyhow!(last_error
            .unwrap_or_else(|| "All retry attempts failed".to_string())))
    }

    async fn place_order_once(
        &self,
        plan: &OrderPlan,
        order_link_id: &str,
    ) -> std::result::Result<String, OrderError> {
        let mut body = serde_json::json!({
            "category": CATEGORY,
            "symbol": plan.symbol,
            "side": plan.side.as_str(),
            "orderType": "Market",
            "qty": plan.qty.to_string(),
            "orderLinkId": order_link_id,
        });
        if plan.reduce_only {
            body["reduceOnly"] = serde_json::json!(true);
        }
        if let Some(sl) = plan.stop_loss {
            body["stopLoss"] = serde_json::json!(sl.to_string());
        }
        if let Some(tp) = plan.take_profit {
            body["takeProfit"] = serde_json::json!(tp.to_string());
        }

        let resp = self
            .signed_post("/v5/order/create", body.to_string())
            .await
            .map_err(|e| OrderError::Transport(e.to_string()))?;

        let envelope: ApiResponse<OrderResult> = read_envelope(resp)
            .await
            .map_err(|e| OrderError::Transport(e.to_string()))?;

        if envelope.ret_code != 0 {
            return Err(OrderError::Rejected(format!(
                "Bybit error {}: {}",
                envelope.ret_code, envelope.ret_msg
            )));
        }

        envelope
            .result
            .map(|r| r.order_id)
            .ok_or_else(|| OrderError::Transport("Missing result in order response".to_string()))
    }

    async fn signed_get(&self, path: &str, query: &str) -> Result<reqwest::Response> {
        let timestamp = self.timestamp_ms();
        let signature = self.sign(timestamp, query);
        let url = format!("{}{}?{}", self.base_url, path, query);

        Ok(self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .send()
            .await?)
    }

    async fn signed_post(&self, path: &str, body: String) -> Result<reqwest::Response> {
        let timestamp = self.timestamp_ms();
        let signature = self.sign(timestamp, &body);
        let url = format!("{}{}", self.base_url, path);

        Ok(self
            .client
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?)
    }
}

enum OrderError {
    /// Network/serialization failure; the request may not have arrived
    Transport(String),
    /// The exchange rejected the order outright
    Rejected(String),
}

async fn read_envelope<T: DeserializeOwned>(resp: reqwest::Response) -> Result<ApiResponse<T>> {
    if !resp.status().is_success() {
        let status = resp.status();
        let error_text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("Exchange HTTP {}: {}", status, error_text));
    }

    Ok(resp.json::<ApiResponse<T>>().await?)
}

fn check<T>(envelope: ApiResponse<T>) -> Result<T> {
    if envelope.ret_code != 0 {
        return Err(anyhow!(
            "Bybit error {}: {}",
            envelope.ret_code,
            envelope.ret_msg
        ));
    }
    envelope
        .result
        .ok_or_else(|| anyhow!("Missing result in exchange response"))
}
