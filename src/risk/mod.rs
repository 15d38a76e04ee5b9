use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_LEVERAGE: u32 = 25;
/// Quantity precision accepted by the exchange order endpoint
const QTY_SCALE: u32 = 6;
const PRICE_SCALE: u32 = 8;

/// Order side as the exchange expects it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Concrete order derived from a signal and the configured risk limits
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPlan {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub reduce_only: bool,
    pub leverage: Option<u32>,
}

#[derive(Debug, Error, PartialEq)]
pub enum RiskError {
    #[error("max position size must be positive")]
    NonPositivePosition,
    #[error("leverage must be between 1 and {MAX_LEVERAGE}")]
    LeverageOutOfRange,
    #[error("stop-loss percent must be between 0 and 1 (exclusive)")]
    StopLossOutOfRange,
    #[error("take-profit percent must be between 0 and 1 (exclusive)")]
    TakeProfitOutOfRange,
    #[error("reference price must be positive")]
    NonPositivePrice,
    #[error("position size rounds to zero at this price")]
    QtyTooSmall,
}

/// Risk limits applied to every dispatched order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    /// Notional cap per order, in quote currency
    pub max_position_usd: Decimal,
    pub leverage: u32,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            max_position_usd: Decimal::new(100, 0), // $100 per order
            leverage: 5,
            stop_loss_pct: Decimal::new(2, 2),   // 2%
            take_profit_pct: Decimal::new(4, 2), // 4%
        }
    }
}

impl RiskParams {
    pub fn validate(&self) -> Result<(), RiskError> {
        if self.max_position_usd <= Decimal::ZERO {
            return Err(RiskError::NonPositivePosition);
        }
        if self.leverage < 1 || self.leverage > MAX_LEVERAGE {
            return Err(RiskError::LeverageOutOfRange);
        }
        if self.stop_loss_pct <= Decimal::ZERO || self.stop_loss_pct >= Decimal::ONE {
            return Err(RiskError::StopLossOutOfRange);
        }
        if self.take_profit_pct <= Decimal::ZERO || self.take_profit_pct >= Decimal::ONE {
            return Err(RiskError::TakeProfitOutOfRange);
        }
        Ok(())
    }

    /// Build an entry order for a buy/sell signal
    ///
    /// Quantity is the notional cap divided by the reference price. Stop-loss
    /// sits against the position, take-profit with it: below/above entry for
    /// longs, above/below for shorts.
    pub fn plan_entry(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
    ) -> Result<OrderPlan, RiskError> {
        if price <= Decimal::ZERO {
            return Err(RiskError::NonPositivePrice);
        }

        let qty = (self.max_position_usd / price).round_dp(QTY_SCALE);
        if qty <= Decimal::ZERO {
            return Err(RiskError::QtyTooSmall);
        }

        let (stop_loss, take_profit) = match side {
            OrderSide::Buy => (
                price * (Decimal::ONE - self.stop_loss_pct),
                price * (Decimal::ONE + self.take_profit_pct),
            ),
            OrderSide::Sell => (
                price * (Decimal::ONE + self.stop_loss_pct),
                price * (Decimal::ONE - self.take_profit_pct),
            ),
        };

        Ok(OrderPlan {
            symbol: symbol.to_string(),
            side,
            qty,
            stop_loss: Some(stop_loss.round_dp(PRICE_SCALE)),
            take_profit: Some(take_profit.round_dp(PRICE_SCALE)),
            reduce_only: false,
            leverage: Some(self.leverage),
        })
    }

    /// Build a reduce-only order that flattens an existing position
    pub fn plan_close(&self, symbol: &str, position_side: OrderSide, qty: Decimal) -> OrderPlan {
        OrderPlan {
            symbol: symbol.to_string(),
            side: position_side.opposite(),
            qty,
            stop_loss: None,
            take_profit: None,
            reduce_only: true,
            leverage: None,
        }
    }
}
