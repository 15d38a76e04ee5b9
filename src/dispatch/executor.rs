use rust_decimal::Decimal;

use crate::models::{NormalizedSignal, SignalAction};
use crate::risk::{OrderPlan, OrderSide, RiskError, RiskParams};

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchAction {
    Submit { plan: OrderPlan },
    Skip,
}

#[derive(Debug, Clone)]
pub struct DispatchDecision {
    pub action: DispatchAction,
    pub reason: String,
}

/// Turns a claimed signal into an order plan (or a reason not to trade)
pub struct SignalExecutor {
    risk: RiskParams,
}

impl SignalExecutor {
    pub fn new(risk: RiskParams) -> Self {
        Self { risk }
    }

    /// Decide what to do with a signal
    ///
    /// `reference_price` is the signal's own price when present, otherwise
    /// the ticker price fetched by the dispatcher. `position` is only looked
    /// up for close signals.
    pub fn decide(
        &self,
        signal: &NormalizedSignal,
        reference_price: Option<Decimal>,
        position: Option<(OrderSide, Decimal)>,
    ) -> Result<DispatchDecision, RiskError> {
        match signal.action {
            SignalAction::Hold => Ok(DispatchDecision {
                action: DispatchAction::Skip,
                reason: "hold carries no order intent".to_string(),
            }),

            SignalAction::Buy | SignalAction::Sell => {
                let price = match reference_price {
                    Some(p) if p > Decimal::ZERO => p,
                    _ => {
                        return Ok(DispatchDecision {
                            action: DispatchAction::Skip,
                            reason: "no reference price available".to_string(),
                        })
                    }
                };

                let side = if signal.action == SignalAction::Buy {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                };

                let plan = self.risk.plan_entry(&signal.symbol, side, price)?;

                Ok(DispatchDecision {
                    action: DispatchAction::Submit { plan },
                    reason: format!("{} signal within risk limits @ {}", signal.action, price),
                })
            }

            SignalAction::Close => match position {
                Some((side, qty)) if qty > Decimal::ZERO => {
                    let plan = self.risk.plan_close(&signal.symbol, side, qty);
                    Ok(DispatchDecision {
                        action: DispatchAction::Submit { plan },
                        reason: format!("closing open {:?} position of {}", side, qty),
                    })
                }
                _ => Ok(DispatchDecision {
                    action: DispatchAction::Skip,
                    reason: "no open position to close".to_string(),
                }),
            },
        }
    }
}
