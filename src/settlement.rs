// ===============================
// src/settlement.rs (settlement worker)
// ===============================
//
// One job, under the contract lock held by the dispatcher:
//   1) re-read the contract; not Available any more -> another path won, stop
//   2) compute the outcome from the trigger close price
//   3) move balances (orchestrator, compensates on failure)
//   4) write the terminal state, only if the contract is still Available
//   5) clean up the hedge (advisory, never fails the settlement)
//
use async_trait::async_trait;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, Alerter};
use crate::calculator::{compute, Outcome};
use crate::canceller::HedgeCanceller;
use crate::dispatcher::JobHandler;
use crate::domain::{now_ms, Contract, ContractState, Event, SettlementJob};
use crate::metrics::SETTLEMENTS;
use crate::orchestrator::{BalanceOrchestrator, BalanceResult};
use crate::retry::RetryPolicy;
use crate::store::{ContractStore, SettlementUpdate, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    Settled(Outcome),
    /// Contract was no longer Available when the job started.
    Race,
    /// Balance transfer failed and was rolled back; contract stays Available.
    Compensated,
    /// Partially applied and not undone; contract flagged for reconciliation.
    Inconsistent,
    Failed(String),
}

impl SettleOutcome {
    fn label(&self) -> &'static str {
        match self {
            SettleOutcome::Settled(_) => "settled",
            SettleOutcome::Race => "race",
            SettleOutcome::Compensated => "compensated",
            SettleOutcome::Inconsistent => "inconsistent",
            SettleOutcome::Failed(_) => "error",
        }
    }
}

pub struct Settler {
    store: Arc<dyn ContractStore>,
    orchestrator: BalanceOrchestrator,
    canceller: HedgeCanceller,
    alerter: Arc<dyn Alerter>,
    retry: RetryPolicy,
    store_timeout: Duration,
    rec_tx: mpsc::Sender<Event>,
}

impl Settler {
    pub fn new(
        store: Arc<dyn ContractStore>,
        orchestrator: BalanceOrchestrator,
        canceller: HedgeCanceller,
        alerter: Arc<dyn Alerter>,
        retry: RetryPolicy,
        store_timeout: Duration,
        rec_tx: mpsc::Sender<Event>,
    ) -> Self {
        Self { store, orchestrator, canceller, alerter, retry, store_timeout, rec_tx }
    }

    /// A store call that outlives `store_timeout` counts as failed.
    async fn timed<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        timeout(self.store_timeout, call).await.map_err(|_| StoreError::Timeout(self.store_timeout))?
    }

    pub async fn settle(&self, job: SettlementJob) -> SettleOutcome {
        let result = self.run(&job).await;
        SETTLEMENTS.with_label_values(&[result.label()]).inc();
        result
    }

    async fn run(&self, job: &SettlementJob) -> SettleOutcome {
        let id = job.contract_id.as_str();

        let fetched = self.retry.run("store get", |_| self.timed(self.store.get(id))).await;
        let contract = match fetched {
            Ok(Some(c)) => c,
            Ok(None) => return self.fail(id, "contract not found".into()),
            Err(e) => return self.fail(id, format!("contract lookup failed: {e}")),
        };
        if !contract.is_matchable() {
            debug!(contract_id = %id, state = ?contract.state, "contract already resolved, job aborted");
            return SettleOutcome::Race;
        }

        let outcome = match compute(&contract, job.trigger.close_price, job.trigger.kind) {
            Ok(o) => o,
            Err(e) => return self.fail(id, format!("calculation rejected: {e}")),
        };

        match self.orchestrator.settle(&contract, &outcome, job.triggered_at_ms).await {
            BalanceResult::Applied(_) => {}
            BalanceResult::Compensated { failed, error } => {
                warn!(contract_id = %id, step = failed, %error, "settlement rolled back, contract left Available");
                let _ = self.rec_tx.try_send(Event::Compensated {
                    contract_id: id.to_string(),
                    reason: format!("{failed}: {error}"),
                    ts_ms: now_ms(),
                });
                return SettleOutcome::Compensated;
            }
            BalanceResult::Inconsistent { failed, error, .. } => {
                return self.inconsistent(id, format!("step {failed} failed ({error}) and rollback failed")).await;
            }
        }

        let update = SettlementUpdate {
            state: outcome.state,
            close_price: outcome.close_price,
            pnl_user: outcome.pnl_user,
            pnl_venue: outcome.pnl_venue,
            pnl_net: outcome.pnl_net,
            payback: true,
            settled_at_ms: now_ms(),
        };
        let written = self
            .retry
            .run("store apply_settlement", |_| {
                self.timed(self.store.apply_settlement(id, ContractState::Available, &update))
            })
            .await;
        match written {
            Ok(true) => {}
            Ok(false) => {
                return self.inconsistent(id, "balances applied but contract changed state before write".into()).await;
            }
            Err(e) => return self.inconsistent(id, format!("balances applied but state write failed: {e}")).await,
        }

        info!(
            contract_id = %id,
            state = ?outcome.state,
            close_price = %outcome.close_price,
            pnl_user = %outcome.pnl_user,
            pnl_venue = %outcome.pnl_venue,
            pnl_net = %outcome.pnl_net,
            "contract settled"
        );
        let _ = self.rec_tx.try_send(Event::Settled {
            contract_id: id.to_string(),
            state: outcome.state,
            close_price: outcome.close_price,
            pnl_user: outcome.pnl_user,
            pnl_venue: outcome.pnl_venue,
            pnl_net: outcome.pnl_net,
            ts_ms: update.settled_at_ms,
        });

        self.cleanup_hedge(&contract).await;
        SettleOutcome::Settled(outcome)
    }

    async fn cleanup_hedge(&self, contract: &Contract) {
        if contract.hedge.is_none() {
            return;
        }
        let report = self.canceller.cancel(contract).await;
        if report.failures() > 0 {
            warn!(contract_id = %contract.id, failures = report.failures(), "hedge cleanup incomplete");
        }
    }

    fn fail(&self, id: &str, reason: String) -> SettleOutcome {
        error!(contract_id = %id, %reason, "settlement failed");
        self.alerter.alert(Alert::new("SETTLEMENT ERROR", Some(id), json!({ "reason": reason })));
        SettleOutcome::Failed(reason)
    }

    async fn inconsistent(&self, id: &str, reason: String) -> SettleOutcome {
        error!(contract_id = %id, %reason, "settlement inconsistent, flagging for reconciliation");
        self.alerter.alert(Alert::new("SETTLEMENT INCONSISTENT", Some(id), json!({ "reason": reason })));
        let flagged = self.retry.run("store flag", |_| self.timed(self.store.flag_for_reconciliation(id, &reason))).await;
        if let Err(e) = flagged {
            error!(contract_id = %id, error = %e, "could not flag contract for reconciliation");
        }
        let _ = self.rec_tx.try_send(Event::Inconsistent { contract_id: id.to_string(), reason, ts_ms: now_ms() });
        SettleOutcome::Inconsistent
    }
}

#[async_trait]
impl JobHandler for Settler {
    async fn handle(&self, job: SettlementJob) {
        self.settle(job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::testing::RecordingAlerter;
    use crate::dispatcher::{Dispatcher, SubmitMode, Submitted};
    use crate::domain::fixtures::bull_contract;
    use crate::domain::{HedgeRef, Trigger, TriggerKind};
    use crate::exchange::MockVenue;
    use crate::ledger::{Balance, MemoryLedger};
    use crate::store::{MemoryStore, StoreError};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Rig {
        store: Arc<MemoryStore>,
        ledger: Arc<MemoryLedger>,
        venue: Arc<MockVenue>,
        alerts: Arc<RecordingAlerter>,
        events: mpsc::Receiver<Event>,
        settler: Settler,
    }

    async fn rig_with(store: Arc<dyn ContractStore>, memory: Arc<MemoryStore>) -> Rig {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.deposit("user-1", "USDT", dec!(100), dec!(10)).await;
        ledger.deposit("pool", "USDT", dec!(1000), dec!(0)).await;
        let venue = Arc::new(MockVenue::new());
        let alerts = Arc::new(RecordingAlerter::default());
        let retry = RetryPolicy::new(2, 1, 1);
        let (rec_tx, events) = mpsc::channel(64);
        let orchestrator =
            BalanceOrchestrator::new(ledger.clone(), alerts.clone(), "pool", retry.clone(), Duration::from_secs(1));
        let canceller = HedgeCanceller::new(venue.clone(), alerts.clone(), retry.clone());
        let settler =
            Settler::new(store, orchestrator, canceller, alerts.clone(), retry, Duration::from_millis(50), rec_tx);
        Rig { store: memory, ledger, venue, alerts, events, settler }
    }

    async fn rig(contract: Contract) -> Rig {
        let store = Arc::new(MemoryStore::new(vec![contract]));
        rig_with(store.clone(), store).await
    }

    fn hedged(id: &str) -> Contract {
        let mut c = bull_contract(id);
        c.hedge = Some(HedgeRef {
            account_id: None,
            take_profit_order_id: Some(101),
            stop_order_id: Some(201),
            position_order_id: Some(301),
            filled_qty: Some(dec!(0.5)),
        });
        c
    }

    fn claim_job(c: &Contract) -> SettlementJob {
        SettlementJob::new(c.clone(), Trigger { kind: TriggerKind::Claim, close_price: dec!(111) }, 1_000)
    }

    #[tokio::test]
    async fn claim_settles_end_to_end() {
        let c = hedged("c1");
        let mut r = rig(c.clone()).await;

        let out = r.settler.settle(claim_job(&c)).await;
        let SettleOutcome::Settled(o) = out else { panic!("not settled: {out:?}") };
        assert_eq!(o.pnl_user, dec!(40));
        assert_eq!(o.pnl_venue, dec!(5.5));

        let stored = r.store.get("c1").await.unwrap().unwrap();
        assert_eq!(stored.state, ContractState::Claimed);
        assert!(stored.payback);
        assert_eq!(stored.close_price, Some(dec!(111)));
        assert_eq!(stored.pnl_net, dec!(-34.5));

        assert_eq!(r.ledger.balance("user-1", "USDT").await, Balance { value: dec!(140), locked: dec!(0) });
        assert_eq!(r.ledger.balance("pool", "USDT").await.value, dec!(960));
        assert_eq!(r.venue.calls().await.len(), 3);
        assert!(matches!(r.events.try_recv(), Ok(Event::Settled { .. })));
        assert!(r.alerts.titles().is_empty());
    }

    #[tokio::test]
    async fn resolved_contract_aborts_silently() {
        let c = bull_contract("c1");
        let r = rig(c.clone()).await;
        r.store.set_state("c1", ContractState::Canceled).await.unwrap();

        assert_eq!(r.settler.settle(claim_job(&c)).await, SettleOutcome::Race);
        assert!(r.ledger.journal().await.is_empty());
        assert!(r.alerts.titles().is_empty());
    }

    #[tokio::test]
    async fn rolled_back_transfer_leaves_contract_available() {
        let c = bull_contract("c1");
        let mut r = rig(c.clone()).await;
        r.ledger.fail_step("owner", 2).await; // both attempts of the retry policy

        assert_eq!(r.settler.settle(claim_job(&c)).await, SettleOutcome::Compensated);
        let stored = r.store.get("c1").await.unwrap().unwrap();
        assert_eq!(stored.state, ContractState::Available);
        assert!(!stored.payback);
        assert_eq!(r.ledger.balance("user-1", "USDT").await, Balance { value: dec!(100), locked: dec!(10) });
        assert!(matches!(r.events.try_recv(), Ok(Event::Compensated { .. })));

        // next trigger is a new attempt and books normally
        let retry = SettlementJob::new(c.clone(), Trigger { kind: TriggerKind::Claim, close_price: dec!(111) }, 2_000);
        assert!(matches!(r.settler.settle(retry).await, SettleOutcome::Settled(_)));
        assert_eq!(r.ledger.balance("user-1", "USDT").await, Balance { value: dec!(140), locked: dec!(0) });
    }

    #[tokio::test]
    async fn failed_rollback_flags_contract() {
        let c = bull_contract("c1");
        let mut r = rig(c.clone()).await;
        r.ledger.fail_step("owner", 5).await;
        r.ledger.fail_rollbacks(5).await;

        assert_eq!(r.settler.settle(claim_job(&c)).await, SettleOutcome::Inconsistent);
        let stored = r.store.get("c1").await.unwrap().unwrap();
        assert!(stored.reconciliation.is_some());
        assert!(r.store.active_contracts().await.unwrap().is_empty());
        assert!(matches!(r.events.try_recv(), Ok(Event::Inconsistent { .. })));
        assert!(r.alerts.titles().contains(&"SETTLEMENT INCONSISTENT".to_string()));
    }

    /// Store whose contract gets cancelled between read and write.
    struct CancelledMidway(Arc<MemoryStore>);

    #[async_trait]
    impl ContractStore for CancelledMidway {
        async fn active_contracts(&self) -> Result<Vec<Contract>, StoreError> {
            self.0.active_contracts().await
        }
        async fn get(&self, id: &str) -> Result<Option<Contract>, StoreError> {
            self.0.get(id).await
        }
        async fn apply_settlement(
            &self,
            id: &str,
            expected: ContractState,
            update: &SettlementUpdate,
        ) -> Result<bool, StoreError> {
            self.0.set_state(id, ContractState::Canceled).await?;
            self.0.apply_settlement(id, expected, update).await
        }
        async fn flag_for_reconciliation(&self, id: &str, note: &str) -> Result<(), StoreError> {
            self.0.flag_for_reconciliation(id, note).await
        }
    }

    #[tokio::test]
    async fn write_conflict_after_transfer_is_flagged() {
        let c = bull_contract("c1");
        let memory = Arc::new(MemoryStore::new(vec![c.clone()]));
        let r = rig_with(Arc::new(CancelledMidway(memory.clone())), memory).await;

        assert_eq!(r.settler.settle(claim_job(&c)).await, SettleOutcome::Inconsistent);
        let stored = r.store.get("c1").await.unwrap().unwrap();
        assert_eq!(stored.state, ContractState::Canceled);
        assert!(stored.reconciliation.is_some());
    }

    /// Store that never answers the calls it is told to hang on.
    struct Hanging {
        inner: Arc<MemoryStore>,
        reads: bool,
    }

    #[async_trait]
    impl ContractStore for Hanging {
        async fn active_contracts(&self) -> Result<Vec<Contract>, StoreError> {
            self.inner.active_contracts().await
        }
        async fn get(&self, id: &str) -> Result<Option<Contract>, StoreError> {
            if self.reads {
                std::future::pending::<()>().await;
            }
            self.inner.get(id).await
        }
        async fn apply_settlement(
            &self,
            _id: &str,
            _expected: ContractState,
            _update: &SettlementUpdate,
        ) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn flag_for_reconciliation(&self, id: &str, note: &str) -> Result<(), StoreError> {
            self.inner.flag_for_reconciliation(id, note).await
        }
    }

    #[tokio::test]
    async fn hanging_store_read_fails_the_job() {
        let c = bull_contract("c1");
        let memory = Arc::new(MemoryStore::new(vec![c.clone()]));
        let r = rig_with(Arc::new(Hanging { inner: memory.clone(), reads: true }), memory).await;

        let out = tokio::time::timeout(Duration::from_secs(5), r.settler.settle(claim_job(&c)))
            .await
            .expect("settlement must not hang on the store");
        let SettleOutcome::Failed(reason) = out else { panic!("expected failure, got {out:?}") };
        assert!(reason.contains("timed out"));
        assert!(r.ledger.journal().await.is_empty());
        assert_eq!(r.alerts.titles(), vec!["SETTLEMENT ERROR"]);
    }

    #[tokio::test]
    async fn hanging_state_write_is_flagged_inconsistent() {
        let c = bull_contract("c1");
        let memory = Arc::new(MemoryStore::new(vec![c.clone()]));
        let r = rig_with(Arc::new(Hanging { inner: memory.clone(), reads: false }), memory).await;

        let out = tokio::time::timeout(Duration::from_secs(5), r.settler.settle(claim_job(&c)))
            .await
            .expect("settlement must not hang on the store");
        assert_eq!(out, SettleOutcome::Inconsistent);
        let stored = r.store.get("c1").await.unwrap().unwrap();
        assert!(stored.reconciliation.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn duplicate_trigger_settles_once() {
        let c = bull_contract("c1");
        let r = rig(c.clone()).await;
        let Rig { store, ledger, settler, .. } = r;
        let (dispatcher, task) = Dispatcher::start(Arc::new(settler), 4);

        let first = dispatcher.submit(claim_job(&c), SubmitMode::Drop).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = dispatcher.submit(claim_job(&c), SubmitMode::Drop).unwrap();

        if let Submitted::Queued(t) = first {
            t.finished().await;
        }
        if let Submitted::Queued(t) = second {
            t.finished().await; // ran after the first: must see a resolved contract
        }
        drop(dispatcher);
        task.await.unwrap();

        assert_eq!(store.get("c1").await.unwrap().unwrap().state, ContractState::Claimed);
        assert_eq!(ledger.journal().await.len(), 3);
    }
}
