use broker_trait::{BrokerClient, ExitOrderRequest};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

/// Broker IDs of the take-profit and stop-loss legs. A leg that failed to
/// submit is `None`; the position still stands and the exit monitor
/// remains the fallback for that side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafetyOrders {
    pub take_profit_order_id: Option<String>,
    pub stop_loss_order_id: Option<String>,
}

impl SafetyOrders {
    pub fn is_complete(&self) -> bool {
        self.take_profit_order_id.is_some() && self.stop_loss_order_id.is_some()
    }
}

/// Submit the limit sell at `take_profit` and the stop sell at `stop_loss`
/// for `qty` shares.
///
/// Called exactly once per filled entry: by the coordinator when the entry
/// filled synchronously, otherwise by the reconciler watcher that promoted
/// the position.
pub async fn place_safety_orders(
    broker: &dyn BrokerClient,
    symbol: &str,
    qty: f64,
    take_profit: f64,
    stop_loss: f64,
) -> SafetyOrders {
    let mut placed = SafetyOrders::default();

    let qty = match Decimal::from_f64(qty) {
        Some(q) if q > Decimal::ZERO => q.round_dp(9),
        _ => {
            tracing::error!("Cannot place safety orders for {}: bad quantity {}", symbol, qty);
            return placed;
        }
    };
    let (Some(tp), Some(sl)) = (Decimal::from_f64(take_profit), Decimal::from_f64(stop_loss)) else {
        tracing::error!(
            "Cannot place safety orders for {}: bad prices tp={} sl={}",
            symbol,
            take_profit,
            stop_loss
        );
        return placed;
    };

    match broker
        .place_limit_order(ExitOrderRequest::sell(symbol, qty, tp))
        .await
    {
        Ok(order) => {
            tracing::info!("Take-profit for {} x{} @ ${:.2}: order {}", symbol, qty, take_profit, order.id);
            placed.take_profit_order_id = Some(order.id);
        }
        Err(e) => tracing::error!("Take-profit order for {} failed: {:#}", symbol, e),
    }

    match broker
        .place_stop_order(ExitOrderRequest::sell(symbol, qty, sl))
        .await
    {
        Ok(order) => {
            tracing::info!("Stop-loss for {} x{} @ ${:.2}: order {}", symbol, qty, stop_loss, order.id);
            placed.stop_loss_order_id = Some(order.id);
        }
        Err(e) => tracing::error!("Stop-loss order for {} failed: {:#}", symbol, e),
    }

    placed
}
