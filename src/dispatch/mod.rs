//! Asynchronous signal consumer
//!
//! Polls the signal table by status and drives each claimed signal to a
//! terminal state. Runs only when exchange credentials are configured;
//! without them, signals stay pending for an external consumer.

pub mod executor;

pub use executor::{DispatchAction, DispatchDecision, SignalExecutor};

use std::sync::Arc;

use crate::config::DispatchConfig;
use crate::db::SignalStore;
use crate::exchange::BybitClient;
use crate::models::{NormalizedSignal, SignalAction};
use crate::risk::RiskParams;

pub struct Dispatcher {
    store: Arc<SignalStore>,
    client: BybitClient,
    executor: SignalExecutor,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<SignalStore>,
        client: BybitClient,
        risk: RiskParams,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            client,
            executor: SignalExecutor::new(risk),
            config,
        }
    }

    /// Poll loop; ticks are skipped rather than bunched when a batch runs long
    pub async fn run(self) {
        tracing::info!(
            "💹 Dispatcher starting (every {:?}, batch {})",
            self.config.interval,
            self.config.batch_size
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            if let Err(e) = self.tick().await {
                tracing::error!("Dispatch tick failed: {}", e);
            }
        }
    }

    async fn tick(&self) -> crate::Result<()> {
        self.store
            .requeue_stale(self.config.stale_after_secs)
            .await?;

        let claimed = self.store.claim_pending(self.config.batch_size).await?;
        if claimed.is_empty() {
            return Ok(());
        }

        tracing::info!("Claimed {} pending signals", claimed.len());

        for signal in claimed {
            if let Err(e) = self.handle_signal(&signal).await {
                tracing::error!("Signal {} failed: {}", signal.id, e);
                if let Err(db_err) = self.store.fail(signal.id, &e.to_string()).await {
                    tracing::error!("Could not mark signal {} failed: {}", signal.id, db_err);
                }
            }
        }

        Ok(())
    }

    async fn handle_signal(&self, signal: &NormalizedSignal) -> crate::Result<()> {
        // Webhook senders retry; an equivalent signal dispatched inside the
        // window means this one is a replay
        if self
            .store
            .recently_dispatched(
                &signal.symbol,
                signal.action,
                self.config.dedup_window_secs,
                signal.id,
            )
            .await?
        {
            tracing::info!(
                "Signal {} ({} {}) is a duplicate, ignoring",
                signal.id,
                signal.action,
                signal.symbol
            );
            return self
                .store
                .ignore(signal.id, "duplicate within dedup window")
                .await;
        }

        let reference_price = match signal.price {
            Some(p) if p > rust_decimal::Decimal::ZERO => Some(p),
            _ => match signal.action {
                SignalAction::Buy | SignalAction::Sell => {
                    Some(self.client.last_price(&signal.symbol).await?)
                }
                _ => None,
            },
        };

        let position = if signal.action == SignalAction::Close {
            self.client.position(&signal.symbol).await?
        } else {
            None
        };

        let decision = self.executor.decide(signal, reference_price, position)?;

        tracing::info!(
            "Signal {} ({} {}): {}",
            signal.id,
            signal.action,
            signal.symbol,
            decision.reason
        );

        match decision.action {
            DispatchAction::Skip => self.store.ignore(signal.id, &decision.reason).await,
            DispatchAction::Submit { plan } => {
                if let Some(leverage) = plan.leverage {
                    // Wrong leverage changes sizing, not correctness; the
                    // order still goes out
                    if let Err(e) = self.client.set_leverage(&plan.symbol, leverage).await {
                        tracing::warn!("Failed to set leverage for {}: {}", plan.symbol, e);
                    }
                }

                match self.client.place_order(&plan).await {
                    Ok(order_id) => {
                        tracing::info!(
                            "✓ Order {} placed for signal {} ({} {} {})",
                            order_id,
                            signal.id,
                            plan.side.as_str(),
                            plan.qty,
                            plan.symbol
                        );
                        self.store.complete(signal.id, &order_id).await
                    }
                    Err(e) => {
                        tracing::error!("✗ Order failed for signal {}: {}", signal.id, e);
                        self.store.fail(signal.id, &e.to_string()).await
                    }
                }
            }
        }
    }
}
