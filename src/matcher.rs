// ===============================
// src/matcher.rs (contract matcher / scan loop)
// ===============================
//
// Single scanner: one pass at a time, each pass
//   1) loads the active contracts,
//   2) takes the aggregator's windows (once-only),
//   3) checks each contract against its window restricted to [created, expiry],
//   4) hands every crossing to the dispatcher.
// A contract that fails lookup is skipped for this pass only.
//
use ahash::AHashMap as HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregator::PriceAggregator;
use crate::calculator::reaches;
use crate::dispatcher::{DispatchError, Dispatcher, SubmitMode, Submitted};
use crate::domain::{now_ms, Contract, Event, Millis, PriceWindow, SettlementJob, Side, Trigger, TriggerKind};
use crate::metrics::{ACTIVE_CONTRACTS, DATA_GAPS, MATCHES, SCANS, SCAN_DURATION_MS};
use crate::store::{ContractStore, StoreError};

/// Settlement quote used for cross-rate legs.
pub const CROSS_QUOTE: &str = "USDT";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("no ticks for {0} this cycle")]
    NoData(String),
    #[error("ticks for {0} fall outside the contract's validity range")]
    OutOfRange(String),
}

/// Which threshold, if any, the window crossed. Stop wins a tie.
///
/// Close price is the extreme that crossed: for a Bull contract the claim
/// closes at the window high and the stop at the low (mirrored for Bear).
pub fn evaluate(contract: &Contract, window: &PriceWindow) -> Option<Trigger> {
    let (claim_px, stop_px) = match contract.side {
        Side::Bull => (window.high, window.low),
        Side::Bear => (window.low, window.high),
    };
    if reaches(contract, TriggerKind::Stop, stop_px) {
        return Some(Trigger { kind: TriggerKind::Stop, close_price: stop_px });
    }
    if reaches(contract, TriggerKind::Claim, claim_px) {
        return Some(Trigger { kind: TriggerKind::Claim, close_price: claim_px });
    }
    None
}

fn restricted(
    snapshot: &HashMap<String, PriceWindow>,
    symbol: &str,
    from: Millis,
    to: Millis,
) -> Result<PriceWindow, WindowError> {
    let w = snapshot.get(symbol).ok_or_else(|| WindowError::NoData(symbol.to_string()))?;
    w.restrict(from, to).ok_or_else(|| WindowError::OutOfRange(symbol.to_string()))
}

/// Window for the contract's symbol, or a cross through `CROSS_QUOTE` when
/// the pair itself is not streamed.
pub fn resolve_window(
    snapshot: &HashMap<String, PriceWindow>,
    contract: &Contract,
) -> Result<PriceWindow, WindowError> {
    let symbol = contract.symbol();
    let (from, to) = (contract.created_at_ms, contract.expires_at_ms);
    match restricted(snapshot, &symbol, from, to) {
        Err(WindowError::NoData(_)) if contract.unit != CROSS_QUOTE && contract.asset != CROSS_QUOTE => {
            let base = restricted(snapshot, &format!("{}{}", contract.asset, CROSS_QUOTE), from, to)?;
            let quote = restricted(snapshot, &format!("{}{}", contract.unit, CROSS_QUOTE), from, to)?;
            PriceWindow::cross(&symbol, &base, &quote).ok_or(WindowError::NoData(symbol))
        }
        other => other,
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub contracts: usize,
    pub matched: usize,
    pub dropped: usize,
    pub gaps: usize,
}

pub struct Matcher {
    store: Arc<dyn ContractStore>,
    agg: Arc<PriceAggregator>,
    dispatcher: Arc<Dispatcher>,
    rec_tx: mpsc::Sender<Event>,
}

impl Matcher {
    pub fn new(
        store: Arc<dyn ContractStore>,
        agg: Arc<PriceAggregator>,
        dispatcher: Arc<Dispatcher>,
        rec_tx: mpsc::Sender<Event>,
    ) -> Self {
        Self { store, agg, dispatcher, rec_tx }
    }

    pub async fn scan_once(&self) -> Result<ScanReport, StoreError> {
        // contracts first: if the store is down the windows stay for the next pass
        let contracts = self.store.active_contracts().await?;
        let snapshot = self.agg.drain();
        let now = now_ms();
        ACTIVE_CONTRACTS.set(contracts.len() as i64);

        let mut report = ScanReport { contracts: contracts.len(), ..Default::default() };
        for contract in contracts {
            if !contract.is_matchable() {
                continue;
            }
            let window = match resolve_window(&snapshot, &contract) {
                Ok(w) => w,
                // expired contracts are never a data gap, whatever the window lookup says
                Err(e) if contract.expires_at_ms < now => {
                    debug!(contract_id = %contract.id, error = %e, "contract past expiry, not matched");
                    continue;
                }
                Err(e) => {
                    let symbol = contract.symbol();
                    warn!(contract_id = %contract.id, %symbol, error = %e, "data gap, contract skipped this cycle");
                    DATA_GAPS.with_label_values(&[&symbol]).inc();
                    report.gaps += 1;
                    continue;
                }
            };
            let Some(trigger) = evaluate(&contract, &window) else { continue };

            MATCHES.with_label_values(&[trigger.kind.as_str()]).inc();
            info!(
                contract_id = %contract.id,
                symbol = %window.symbol,
                trigger = trigger.kind.as_str(),
                close_price = %trigger.close_price,
                high = %window.high,
                low = %window.low,
                "threshold crossed"
            );
            let _ = self.rec_tx.try_send(Event::Match {
                contract_id: contract.id.clone(),
                symbol: window.symbol.clone(),
                trigger,
                ts_ms: now,
            });

            let id = contract.id.clone();
            match self.dispatcher.submit(SettlementJob::new(contract, trigger, now), SubmitMode::Drop) {
                Ok(Submitted::Queued(_)) => report.matched += 1,
                Ok(Submitted::Dropped) => report.dropped += 1,
                Err(DispatchError::Busy(_)) => report.dropped += 1,
                Err(e @ DispatchError::Closed) => {
                    error!(contract_id = %id, error = %e, "dispatcher closed, trigger lost");
                }
            }
        }
        Ok(report)
    }

    /// Fixed-cadence scan loop. A pass that overruns delays the next one,
    /// passes never overlap.
    pub async fn run(self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(?every, "matcher: started");
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            let started = Instant::now();
            match self.scan_once().await {
                Ok(r) => debug!(contracts = r.contracts, matched = r.matched, dropped = r.dropped, gaps = r.gaps, "scan done"),
                Err(e) => error!(error = %e, "active contracts query failed, scan skipped"),
            }
            SCANS.inc();
            SCAN_DURATION_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
        }
        info!("matcher: shutdown");
    }
}
