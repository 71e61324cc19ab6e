// ===============================
// src/canceller.rs (hedge cleanup after settlement)
// ===============================
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use crate::alert::{Alert, Alerter};
use crate::domain::Contract;
use crate::exchange::{CloseOrder, HedgeLeg, HedgeVenue, VenueError};
use crate::metrics::VENUE_ERRORS;
use crate::retry::RetryPolicy;

/// Per-leg result of a cancel run; `None` means the leg did not exist.
#[derive(Debug, Default)]
pub struct CancelReport {
    pub take_profit: Option<Result<(), String>>,
    pub stop: Option<Result<(), String>>,
    pub position: Option<Result<(), String>>,
}

impl CancelReport {
    pub fn failures(&self) -> usize {
        [&self.take_profit, &self.stop, &self.position]
            .iter()
            .filter(|r| matches!(r, Some(Err(_))))
            .count()
    }
}

pub struct HedgeCanceller {
    venue: Arc<dyn HedgeVenue>,
    alerter: Arc<dyn Alerter>,
    retry: RetryPolicy,
}

impl HedgeCanceller {
    pub fn new(venue: Arc<dyn HedgeVenue>, alerter: Arc<dyn Alerter>, retry: RetryPolicy) -> Self {
        Self { venue, alerter, retry }
    }

    /// Cancels TP, SL and closes the position, each independently and each
    /// with bounded retry. Never fails.
    pub async fn cancel(&self, contract: &Contract) -> CancelReport {
        let mut report = CancelReport::default();
        let Some(hedge) = contract.hedge.as_ref() else { return report };
        let symbol = contract.symbol();
        let account = hedge.account_id;

        if let Some(order_id) = hedge.take_profit_order_id {
            let res = self.cancel_leg(&symbol, order_id, account).await;
            report.take_profit = Some(self.settle_leg(contract, HedgeLeg::TakeProfit, res));
        }
        if let Some(order_id) = hedge.stop_order_id {
            let res = self.cancel_leg(&symbol, order_id, account).await;
            report.stop = Some(self.settle_leg(contract, HedgeLeg::Stop, res));
        }
        if let (Some(_), Some(qty)) = (hedge.position_order_id, hedge.position_qty()) {
            let order = CloseOrder::for_contract(contract, qty);
            let what = format!("venue close {}", order.client_order_id);
            let res = self.retry.run(&what, |_| self.venue.close_position(&order, account)).await;
            report.position = Some(self.settle_leg(contract, HedgeLeg::Position, res.map(|_| ())));
        }
        report
    }

    async fn cancel_leg(&self, symbol: &str, order_id: i64, account: Option<u64>) -> Result<(), VenueError> {
        let what = format!("venue cancel {symbol} {order_id}");
        self.retry.run(&what, |_| self.venue.cancel_order(symbol, order_id, account)).await.map(|_| ())
    }

    fn settle_leg(&self, contract: &Contract, leg: HedgeLeg, res: Result<(), VenueError>) -> Result<(), String> {
        match res {
            Ok(()) => {
                info!(contract_id = %contract.id, leg = leg.as_str(), "hedge leg cancelled");
                Ok(())
            }
            Err(e) => {
                VENUE_ERRORS.with_label_values(&[leg.as_str()]).inc();
                error!(contract_id = %contract.id, leg = leg.as_str(), error = %e, "hedge cancel failed");
                self.alerter.alert(Alert::new(
                    &format!("HEDGE CANCEL {} FAILED", leg.as_str().to_uppercase()),
                    Some(&contract.id),
                    json!({ "symbol": contract.symbol(), "account": contract.hedge.as_ref().and_then(|h| h.account_id), "error": e.to_string() }),
                ));
                Err(e.to_string())
            }
        }
    }
}
