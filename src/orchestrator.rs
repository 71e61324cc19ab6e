// ===============================
// src/orchestrator.rs (balance movements of one settlement)
// ===============================
//
// Three independent ledger calls, in order:
//   unlock : owner's margin hold released   (locked -= margin)
//   pool   : underwriting pool              (value  -= pnl_user)
//   owner  : owner's balance                (value  += pnl_user)
// No two-phase commit. A failure part way undoes the applied prefix with
// bounded retry; if that also fails, an operator has to reconcile by hand.
//
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::alert::{Alert, Alerter};
use crate::calculator::Outcome;
use crate::domain::{Contract, ContractState, Millis};
use crate::ledger::{BalanceChange, Ledger, LedgerError, Transaction};
use crate::metrics::{COMPENSATION_FAILURES, LEDGER_ERRORS};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Unlock,
    Pool,
    Owner,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Unlock => "unlock",
            Step::Pool => "pool",
            Step::Owner => "owner",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceOp {
    pub step: Step,
    pub change: BalanceChange,
}

#[derive(Debug, Error)]
#[error("balance step {failed} failed after {} applied: {source}", .applied.len())]
pub struct PartialApply {
    pub applied: Vec<Transaction>,
    pub failed: &'static str,
    #[source]
    pub source: LedgerError,
}

#[derive(Debug)]
pub enum BalanceResult {
    /// All three movements booked.
    Applied(Vec<Transaction>),
    /// A step failed and everything before it was undone.
    Compensated { failed: &'static str, error: String },
    /// A step failed and the undo failed too.
    Inconsistent { failed: &'static str, error: String, applied: Vec<Transaction> },
}

pub struct BalanceOrchestrator {
    ledger: Arc<dyn Ledger>,
    alerter: Arc<dyn Alerter>,
    pool_user_id: String,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl BalanceOrchestrator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        alerter: Arc<dyn Alerter>,
        pool_user_id: &str,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self { ledger, alerter, pool_user_id: pool_user_id.to_string(), retry, call_timeout }
    }

    /// Idempotency keys are `<contract>:<attempt>:<step>`: retries of one
    /// attempt dedupe, a later attempt after a rollback books afresh.
    pub fn build_ops(&self, contract: &Contract, outcome: &Outcome, attempt: Millis) -> Vec<BalanceOp> {
        let (category, reason, owner_action) = match outcome.state {
            ContractState::Liquidated => ("insurance_liquidated", "LIQUIDATED", "DECREMENT"),
            _ => ("insurance_claimed", "CLAIM", "INCREMENT"),
        };
        let metadata = json!({
            "contract_id": contract.id,
            "state": outcome.state,
            "close_price": outcome.close_price,
            "pnl_user": outcome.pnl_user,
            "pnl_venue": outcome.pnl_venue,
            "pnl_net": outcome.pnl_net,
        });
        let op = |step: Step, user_id: &str, value: Decimal, locked: Decimal, note: String| BalanceOp {
            step,
            change: BalanceChange {
                user_id: user_id.to_string(),
                asset_id: contract.unit.clone(),
                value_change: value,
                locked_value_change: locked,
                category: category.to_string(),
                note,
                metadata: metadata.clone(),
                idempotency_key: format!("{}:{}:{}", contract.id, attempt, step.as_str()),
            },
        };
        let zero = Decimal::ZERO;
        vec![
            op(Step::Unlock, &contract.owner, zero, -contract.margin, format!("#{} {} UNLOCK", contract.id, reason)),
            op(Step::Pool, &self.pool_user_id, -outcome.pnl_user, zero, format!("INSURANCE POOL: #{}", contract.id)),
            op(Step::Owner, &contract.owner, outcome.pnl_user, zero, format!("#{} {} {}", contract.id, reason, owner_action)),
        ]
    }

    async fn timed<T, F>(&self, call: F) -> Result<T, LedgerError>
    where
        F: std::future::Future<Output = Result<T, LedgerError>>,
    {
        timeout(self.call_timeout, call).await.map_err(|_| LedgerError::Timeout(self.call_timeout))?
    }

    /// Books `ops` in order; on failure returns the transactions applied so far.
    pub async fn apply_all(&self, ops: &[BalanceOp]) -> Result<Vec<Transaction>, PartialApply> {
        let mut applied = Vec::with_capacity(ops.len());
        for op in ops {
            let what = format!("ledger {}", op.change.idempotency_key);
            let res = self.retry.run(&what, |_| self.timed(self.ledger.change_balance(&op.change))).await;
            match res {
                Ok(tx) => applied.push(tx),
                Err(e) => {
                    LEDGER_ERRORS.with_label_values(&[op.step.as_str()]).inc();
                    return Err(PartialApply { applied, failed: op.step.as_str(), source: e });
                }
            }
        }
        Ok(applied)
    }

    /// Undoes `applied`. Failures are alerted, not retried past the policy.
    pub async fn compensate(&self, contract_id: &str, applied: &[Transaction]) -> Result<(), LedgerError> {
        if applied.is_empty() {
            return Ok(());
        }
        let what = format!("ledger rollback {contract_id}");
        match self.retry.run(&what, |_| self.timed(self.ledger.rollback(applied))).await {
            Ok(undo) => {
                warn!(contract_id, rolled_back = undo.len(), "balance movements rolled back");
                Ok(())
            }
            Err(e) => {
                COMPENSATION_FAILURES.inc();
                LEDGER_ERRORS.with_label_values(&["rollback"]).inc();
                error!(contract_id, error = %e, "rollback failed, manual reconciliation needed");
                let ids: Vec<&str> = applied.iter().map(|t| t.id.as_str()).collect();
                self.alerter.alert(Alert::new(
                    "WALLET ROLLBACK FAILED",
                    Some(contract_id),
                    json!({ "transactions": ids, "error": e.to_string() }),
                ));
                Err(e)
            }
        }
    }

    pub async fn settle(&self, contract: &Contract, outcome: &Outcome, attempt: Millis) -> BalanceResult {
        let ops = self.build_ops(contract, outcome, attempt);
        match self.apply_all(&ops).await {
            Ok(applied) => {
                info!(contract_id = %contract.id, transactions = applied.len(), "balances applied");
                BalanceResult::Applied(applied)
            }
            Err(PartialApply { applied, failed, source }) => {
                let error = source.to_string();
                error!(contract_id = %contract.id, step = failed, %error, applied = applied.len(), "balance transfer failed");
                self.alerter.alert(Alert::new(
                    "SETTLEMENT TRANSFER ERROR",
                    Some(&contract.id),
                    json!({ "owner": contract.owner, "step": failed, "error": error }),
                ));
                match self.compensate(&contract.id, &applied).await {
                    Ok(()) => BalanceResult::Compensated { failed, error },
                    Err(_) => BalanceResult::Inconsistent { failed, error, applied },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::testing::RecordingAlerter;
    use crate::calculator::compute;
    use crate::domain::fixtures::bull_contract;
    use crate::domain::TriggerKind;
    use crate::ledger::{Balance, MemoryLedger};
    use rust_decimal_macros::dec;

    struct Rig {
        ledger: Arc<MemoryLedger>,
        alerts: Arc<RecordingAlerter>,
        orch: BalanceOrchestrator,
    }

    async fn rig() -> Rig {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.deposit("user-1", "USDT", dec!(100), dec!(10)).await;
        ledger.deposit("pool", "USDT", dec!(1000), dec!(0)).await;
        let alerts = Arc::new(RecordingAlerter::default());
        let orch = BalanceOrchestrator::new(
            ledger.clone(),
            alerts.clone(),
            "pool",
            RetryPolicy::new(2, 1, 1),
            Duration::from_secs(1),
        );
        Rig { ledger, alerts, orch }
    }

    fn claim() -> (Contract, Outcome) {
        let c = bull_contract("c1");
        let out = compute(&c, dec!(111), TriggerKind::Claim).unwrap();
        (c, out)
    }

    #[tokio::test]
    async fn ops_follow_unlock_pool_owner_order() {
        let r = rig().await;
        let (c, out) = claim();
        let ops = r.orch.build_ops(&c, &out, 7);
        let steps: Vec<Step> = ops.iter().map(|o| o.step).collect();
        assert_eq!(steps, vec![Step::Unlock, Step::Pool, Step::Owner]);
        assert_eq!(ops[0].change.locked_value_change, dec!(-10));
        assert_eq!(ops[1].change.user_id, "pool");
        assert_eq!(ops[1].change.value_change, dec!(-40));
        assert_eq!(ops[2].change.value_change, dec!(40));
        assert_eq!(ops[2].change.idempotency_key, "c1:7:owner");
    }

    #[tokio::test]
    async fn happy_path_moves_balances() {
        let r = rig().await;
        let (c, out) = claim();
        assert!(matches!(r.orch.settle(&c, &out, 1).await, BalanceResult::Applied(ref t) if t.len() == 3));
        assert_eq!(r.ledger.balance("user-1", "USDT").await, Balance { value: dec!(140), locked: dec!(0) });
        assert_eq!(r.ledger.balance("pool", "USDT").await.value, dec!(960));
        assert!(r.alerts.titles().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let r = rig().await;
        r.ledger.fail_step("pool", 1).await;
        let (c, out) = claim();
        assert!(matches!(r.orch.settle(&c, &out, 1).await, BalanceResult::Applied(_)));
        assert_eq!(r.ledger.journal().await.len(), 3);
    }

    #[tokio::test]
    async fn failure_mid_sequence_rolls_back_prefix() {
        let r = rig().await;
        r.ledger.fail_step("owner", 5).await;
        let (c, out) = claim();
        let res = r.orch.settle(&c, &out, 1).await;
        assert!(matches!(res, BalanceResult::Compensated { failed: "owner", .. }));
        assert_eq!(r.ledger.balance("user-1", "USDT").await, Balance { value: dec!(100), locked: dec!(10) });
        assert_eq!(r.ledger.balance("pool", "USDT").await.value, dec!(1000));
        assert_eq!(r.alerts.titles(), vec!["SETTLEMENT TRANSFER ERROR"]);
    }

    #[tokio::test]
    async fn failure_on_first_step_needs_no_rollback() {
        let r = rig().await;
        r.ledger.fail_step("unlock", 5).await;
        r.ledger.fail_rollbacks(5).await;
        let (c, out) = claim();
        assert!(matches!(r.orch.settle(&c, &out, 1).await, BalanceResult::Compensated { failed: "unlock", .. }));
    }

    #[tokio::test]
    async fn failed_rollback_is_inconsistent_and_alerted() {
        let r = rig().await;
        r.ledger.fail_step("owner", 5).await;
        r.ledger.fail_rollbacks(5).await;
        let (c, out) = claim();
        let before = COMPENSATION_FAILURES.get();
        match r.orch.settle(&c, &out, 1).await {
            BalanceResult::Inconsistent { failed, applied, .. } => {
                assert_eq!(failed, "owner");
                assert_eq!(applied.len(), 2);
            }
            other => panic!("expected inconsistent, got {other:?}"),
        }
        assert!(COMPENSATION_FAILURES.get() > before);
        assert_eq!(r.alerts.titles(), vec!["SETTLEMENT TRANSFER ERROR", "WALLET ROLLBACK FAILED"]);
    }
}
