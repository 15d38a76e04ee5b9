use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use crate::models::{NewSignal, NormalizedSignal, RawEvent, RawEventStatus, SignalAction, SignalStatus};
use crate::Result;

const SIGNAL_COLUMNS: &str = "id, raw_event_id, source, symbol, action, price, volume, \
                              strategy, timeframe, metadata, status, created_at, updated_at";

/// Postgres persistence for raw events and normalized signals
pub struct SignalStore {
    pool: PgPool,
}

impl SignalStore {
    /// Connect to Postgres and run pending migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests, embedding)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record an accepted alert: raw event plus normalized signal, one transaction
    ///
    /// The raw row is inserted as `received`, the signal as `pending`, and the
    /// raw row is flipped to `processed` before commit. Returns
    /// (raw_event_id, signal_id).
    pub async fn record_signal(
        &self,
        payload: &serde_json::Value,
        client_ip: Option<&str>,
        signal: &NewSignal,
    ) -> Result<(i64, i64)> {
        let mut tx = self.pool.begin().await?;

        let raw_id: i64 = sqlx::query(
            r#"
            INSERT INTO raw_events (source, payload, client_ip, status)
            VALUES ($1, $2, $3, 'received')
            RETURNING id
            "#,
        )
        .bind(&signal.source)
        .bind(payload)
        .bind(client_ip)
        .fetch_one(&mut *tx)
        .await?
        .get("id");

        let signal_id: i64 = sqlx::query(
            r#"
            INSERT INTO signals (
                raw_event_id, source, symbol, action, price, volume,
                strategy, timeframe, metadata, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending')
            RETURNING id
            "#,
        )
        .bind(raw_id)
        .bind(&signal.source)
        .bind(&signal.symbol)
        .bind(signal.action.as_str())
        .bind(signal.price)
        .bind(signal.volume)
        .bind(&signal.strategy)
        .bind(&signal.timeframe)
        .bind(&signal.metadata)
        .fetch_one(&mut *tx)
        .await?
        .get("id");

        sqlx::query("UPDATE raw_events SET status = 'processed' WHERE id = $1")
            .bind(raw_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(
            "Recorded signal {} ({} {}) from raw event {}",
            signal_id,
            signal.action,
            signal.symbol,
            raw_id
        );

        Ok((raw_id, signal_id))
    }

    /// Audit a payload that parsed as JSON but failed normalization
    pub async fn record_rejected_event(
        &self,
        source: &str,
        payload: &serde_json::Value,
        client_ip: Option<&str>,
    ) -> Result<i64> {
        let raw_id: i64 = sqlx::query(
            r#"
            INSERT INTO raw_events (source, payload, client_ip, status)
            VALUES ($1, $2, $3, 'failed')
            RETURNING id
            "#,
        )
        .bind(source)
        .bind(payload)
        .bind(client_ip)
        .fetch_one(&self.pool)
        .await?
        .get("id");

        Ok(raw_id)
    }

    /// Claim up to `limit` of the oldest pending signals for processing
    ///
    /// `FOR UPDATE SKIP LOCKED` keeps concurrent dispatchers from claiming
    /// the same rows.
    pub async fn claim_pending(&self, limit: i64) -> Result<Vec<NormalizedSignal>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE signals SET status = 'processing', updated_at = NOW()
            WHERE id IN (
                SELECT id FROM signals
                WHERE status = 'pending'
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {SIGNAL_COLUMNS}
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(signal_from_row).collect()
    }

    /// Mark a signal executed, recording the exchange order id
    pub async fn complete(&self, signal_id: i64, order_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE signals
            SET status = 'executed',
                metadata = metadata || jsonb_build_object('order_id', $2::text),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(signal_id)
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a signal failed, keeping the reason in its metadata
    pub async fn fail(&self, signal_id: i64, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE signals
            SET status = 'failed',
                metadata = metadata || jsonb_build_object('error', $2::text),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(signal_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a signal ignored (duplicate, hold, no order intent)
    pub async fn ignore(&self, signal_id: i64, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE signals
            SET status = 'ignored',
                metadata = metadata || jsonb_build_object('ignored_reason', $2::text),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(signal_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Dedup probe: has an equivalent signal been dispatched inside the window?
    ///
    /// Checks executed and in-flight signals for the same (symbol, action),
    /// excluding the signal currently being processed.
    pub async fn recently_dispatched(
        &self,
        symbol: &str,
        action: SignalAction,
        window_secs: i64,
        exclude_id: i64,
    ) -> Result<bool> {
        let cutoff = Utc::now() - chrono::Duration::seconds(window_secs);

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as count
            FROM signals
            WHERE symbol = $1
              AND action = $2
              AND status IN ('executed', 'processing')
              AND created_at >= $3
              AND id <> $4
            "#,
        )
        .bind(symbol)
        .bind(action.as_str())
        .bind(cutoff)
        .bind(exclude_id)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    /// Re-queue signals stuck in processing (dispatcher crash recovery)
    pub async fn requeue_stale(&self, older_than_secs: i64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than_secs);

        let result = sqlx::query(
            r#"
            UPDATE signals SET status = 'pending', updated_at = NOW()
            WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected() as usize;
        if count > 0 {
            tracing::warn!("Re-queued {} signals stuck in processing", count);
        }

        Ok(count)
    }

    /// Load a signal by id
    pub async fn get_signal(&self, id: i64) -> Result<Option<NormalizedSignal>> {
        let row = sqlx::query(&format!(
            "SELECT {SIGNAL_COLUMNS} FROM signals WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(signal_from_row).transpose()
    }

    /// Load the most recent signals, optionally filtered by status
    pub async fn recent_signals(
        &self,
        limit: i64,
        status: Option<SignalStatus>,
    ) -> Result<Vec<NormalizedSignal>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    r#"
                    SELECT {SIGNAL_COLUMNS} FROM signals
                    WHERE status = $1
                    ORDER BY created_at DESC
                    LIMIT $2
                    "#
                ))
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    r#"
                    SELECT {SIGNAL_COLUMNS} FROM signals
                    ORDER BY created_at DESC
                    LIMIT $1
                    "#
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(signal_from_row).collect()
    }

    /// Signal counts grouped by status
    pub async fn status_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) as count FROM signals GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("status"), row.get("count")))
            .collect())
    }

    /// Load a raw event by id (audit lookups)
    pub async fn get_raw_event(&self, id: i64) -> Result<Option<RawEvent>> {
        let row = sqlx::query(
            r#"
            SELECT id, source, received_at, payload, client_ip, status
            FROM raw_events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let status_str: String = row.get("status");
                let status = RawEventStatus::parse(&status_str)
                    .ok_or_else(|| format!("Invalid raw event status '{}'", status_str))?;

                Ok(Some(RawEvent {
                    id: row.get("id"),
                    source: row.get("source"),
                    received_at: row.get("received_at"),
                    payload: row.get("payload"),
                    client_ip: row.get("client_ip"),
                    status,
                }))
            }
            None => Ok(None),
        }
    }

    /// Cheap liveness probe for the health endpoint
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Delete all rows (testing only)
    #[cfg(test)]
    pub async fn clear_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM signals").execute(&self.pool).await?;
        sqlx::query("DELETE FROM raw_events")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn signal_from_row(row: &sqlx::postgres::PgRow) -> Result<NormalizedSignal> {
    let action_str: String = row.get("action");
    let action = SignalAction::parse(&action_str)
        .ok_or_else(|| format!("Invalid signal action '{}'", action_str))?;

    let status_str: String = row.get("status");
    let status = SignalStatus::parse(&status_str)
        .ok_or_else(|| format!("Invalid signal status '{}'", status_str))?;

    let price: Option<Decimal> = row.get("price");
    let volume: Option<Decimal> = row.get("volume");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");

    Ok(NormalizedSignal {
        id: row.get("id"),
        raw_event_id: row.get("raw_event_id"),
        source: row.get("source"),
        symbol: row.get("symbol"),
        action,
        price,
        volume,
        strategy: row.get("strategy"),
        timeframe: row.get("timeframe"),
        metadata: row.get("metadata"),
        status,
        created_at,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    async fn get_test_store() -> SignalStore {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/tradehook_test".to_string());

        SignalStore::connect(&database_url)
            .await
            .expect("Failed to connect to test database")
    }

    fn sample_signal(symbol: &str, action: SignalAction) -> NewSignal {
        NewSignal {
            source: "test".to_string(),
            symbol: symbol.to_string(),
            action,
            price: Some(Decimal::from_str("100.5").unwrap()),
            volume: None,
            strategy: Some("momentum".to_string()),
            timeframe: Some("5m".to_string()),
            metadata: json!({"comment": "test alert"}),
        }
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_record_and_load_signal() {
        let store = get_test_store().await;
        store.clear_all().await.unwrap();

        let payload = json!({"ticker": "BTCUSDT", "action": "buy", "price": "100.5"});
        let signal = sample_signal("BTCUSDT", SignalAction::Buy);

        let (raw_id, signal_id) = store
            .record_signal(&payload, Some("203.0.113.9"), &signal)
            .await
            .unwrap();

        let loaded = store.get_signal(signal_id).await.unwrap().unwrap();
        assert_eq!(loaded.symbol, "BTCUSDT");
        assert_eq!(loaded.action, SignalAction::Buy);
        assert_eq!(loaded.status, SignalStatus::Pending);
        assert_eq!(loaded.raw_event_id, Some(raw_id));
        assert_eq!(loaded.price, Some(Decimal::from_str("100.5").unwrap()));

        let raw = store.get_raw_event(raw_id).await.unwrap().unwrap();
        assert_eq!(raw.status, RawEventStatus::Processed);
        assert_eq!(raw.payload, payload);
        assert_eq!(raw.client_ip.as_deref(), Some("203.0.113.9"));

        store.clear_all().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_rejected_event_is_audited() {
        let store = get_test_store().await;
        store.clear_all().await.unwrap();

        let payload = json!({"action": "buy"});
        let raw_id = store
            .record_rejected_event("tradingview", &payload, None)
            .await
            .unwrap();

        let raw = store.get_raw_event(raw_id).await.unwrap().unwrap();
        assert_eq!(raw.status, RawEventStatus::Failed);
        assert_eq!(raw.payload, payload);

        store.clear_all().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_claim_pending_moves_to_processing() {
        let store = get_test_store().await;
        store.clear_all().await.unwrap();

        let payload = json!({"ticker": "SOLUSDT", "action": "buy"});
        let (_, first_id) = store
            .record_signal(&payload, None, &sample_signal("SOLUSDT", SignalAction::Buy))
            .await
            .unwrap();
        store
            .record_signal(&payload, None, &sample_signal("ETHUSDT", SignalAction::Sell))
            .await
            .unwrap();

        let claimed = store.claim_pending(1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        // Oldest first
        assert_eq!(claimed[0].id, first_id);
        assert_eq!(claimed[0].status, SignalStatus::Processing);

        // Claimed rows are not handed out twice
        let claimed_again = store.claim_pending(10).await.unwrap();
        assert_eq!(claimed_again.len(), 1);
        assert_ne!(claimed_again[0].id, first_id);

        store.clear_all().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_terminal_transitions_keep_reasons() {
        let store = get_test_store().await;
        store.clear_all().await.unwrap();

        let payload = json!({"ticker": "SOLUSDT", "action": "buy"});
        let (_, a) = store
            .record_signal(&payload, None, &sample_signal("SOLUSDT", SignalAction::Buy))
            .await
            .unwrap();
        let (_, b) = store
            .record_signal(&payload, None, &sample_signal("ETHUSDT", SignalAction::Buy))
            .await
            .unwrap();
        let (_, c) = store
            .record_signal(&payload, None, &sample_signal("JUPUSDT", SignalAction::Hold))
            .await
            .unwrap();

        store.complete(a, "order-123").await.unwrap();
        store.fail(b, "exchange rejected order").await.unwrap();
        store.ignore(c, "hold carries no order intent").await.unwrap();

        let a = store.get_signal(a).await.unwrap().unwrap();
        assert_eq!(a.status, SignalStatus::Executed);
        assert_eq!(a.metadata["order_id"], "order-123");

        let b = store.get_signal(b).await.unwrap().unwrap();
        assert_eq!(b.status, SignalStatus::Failed);
        assert_eq!(b.metadata["error"], "exchange rejected order");

        let c = store.get_signal(c).await.unwrap().unwrap();
        assert_eq!(c.status, SignalStatus::Ignored);
        assert_eq!(c.metadata["ignored_reason"], "hold carries no order intent");

        // Original metadata survives the merge
        assert_eq!(a.metadata["comment"], "test alert");

        store.clear_all().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_recently_dispatched_window() {
        let store = get_test_store().await;
        store.clear_all().await.unwrap();

        let payload = json!({"ticker": "BTCUSDT", "action": "buy"});
        let (_, executed_id) = store
            .record_signal(&payload, None, &sample_signal("BTCUSDT", SignalAction::Buy))
            .await
            .unwrap();
        store.complete(executed_id, "order-1").await.unwrap();

        let (_, current_id) = store
            .record_signal(&payload, None, &sample_signal("BTCUSDT", SignalAction::Buy))
            .await
            .unwrap();

        // Same symbol+action inside the window
        let dup = store
            .recently_dispatched("BTCUSDT", SignalAction::Buy, 300, current_id)
            .await
            .unwrap();
        assert!(dup);

        // Different action is not a duplicate
        let dup = store
            .recently_dispatched("BTCUSDT", SignalAction::Sell, 300, current_id)
            .await
            .unwrap();
        assert!(!dup);

        // Zero-width window finds nothing
        let dup = store
            .recently_dispatched("BTCUSDT", SignalAction::Buy, 0, current_id)
            .await
            .unwrap();
        assert!(!dup);

        store.clear_all().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_requeue_stale_processing() {
        let store = get_test_store().await;
        store.clear_all().await.unwrap();

        let payload = json!({"ticker": "BTCUSDT", "action": "buy"});
        let (_, id) = store
            .record_signal(&payload, None, &sample_signal("BTCUSDT", SignalAction::Buy))
            .await
            .unwrap();

        let claimed = store.claim_pending(10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Backdate the claim so it looks abandoned
        sqlx::query("UPDATE signals SET updated_at = NOW() - INTERVAL '10 minutes' WHERE id = $1")
            .bind(id)
            .execute(&store.pool)
            .await
            .unwrap();

        let requeued = store.requeue_stale(60).await.unwrap();
        assert_eq!(requeued, 1);

        let signal = store.get_signal(id).await.unwrap().unwrap();
        assert_eq!(signal.status, SignalStatus::Pending);

        store.clear_all().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_recent_signals_filter_and_counts() {
        let store = get_test_store().await;
        store.clear_all().await.unwrap();

        let payload = json!({"ticker": "BTCUSDT", "action": "buy"});
        let (_, a) = store
            .record_signal(&payload, None, &sample_signal("BTCUSDT", SignalAction::Buy))
            .await
            .unwrap();
        store
            .record_signal(&payload, None, &sample_signal("ETHUSDT", SignalAction::Sell))
            .await
            .unwrap();
        store.complete(a, "order-1").await.unwrap();

        let all = store.recent_signals(10, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let executed = store
            .recent_signals(10, Some(SignalStatus::Executed))
            .await
            .unwrap();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].id, a);

        let counts = store.status_counts().await.unwrap();
        assert!(counts.contains(&("executed".to_string(), 1)));
        assert!(counts.contains(&("pending".to_string(), 1)));

        store.clear_all().await.unwrap();
    }
}
