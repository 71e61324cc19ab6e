// ===============================
// src/dispatcher.rs (settlement dispatcher + per-contract lock)
// ===============================
//
// submit() takes the contract lock *before* queueing, so a second trigger
// for a contract already queued or running never reaches the worker pool.
// The guard travels with the job and is dropped when the job task ends,
// on success, error or panic alike.
//
// Queue is unbounded (the scanner must never block on it); concurrency is
// bounded by a semaphore and jobs start in FIFO order.
//
use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::domain::SettlementJob;
use crate::metrics::{IN_FLIGHT, JOBS};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("settlement for contract {0} already in progress")]
    Busy(String),
    #[error("dispatcher is shut down")]
    Closed,
}

/// What to do when the contract lock is already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Drop the new job quietly (scanner path).
    Drop,
    /// Reject with `DispatchError::Busy` (administrative path).
    Strict,
}

// ---- Lock manager ----

#[derive(Debug, Default)]
pub struct LockManager {
    held: DashSet<String>,
}

impl LockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Exclusive lock on `id`, or `None` if someone else holds it.
    pub fn try_acquire(self: &Arc<Self>, id: &str) -> Option<LockGuard> {
        if self.held.insert(id.to_string()) {
            Some(LockGuard { locks: Arc::clone(self), id: id.to_string() })
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn is_held(&self, id: &str) -> bool {
        self.held.contains(id)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

#[derive(Debug)]
pub struct LockGuard {
    locks: Arc<LockManager>,
    id: String,
}

impl LockGuard {
    #[cfg(test)]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locks.held.remove(&self.id);
    }
}

// ---- Dispatcher ----

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: SettlementJob);
}

struct Queued {
    job: SettlementJob,
    guard: LockGuard,
    done: oneshot::Sender<()>,
}

/// Resolves once the submitted job has finished (or was lost to a panic).
#[derive(Debug)]
pub struct JobTicket(oneshot::Receiver<()>);

impl JobTicket {
    pub async fn finished(self) {
        let _ = self.0.await;
    }
}

#[derive(Debug)]
pub enum Submitted {
    Queued(JobTicket),
    Dropped,
}

pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Queued>,
    locks: Arc<LockManager>,
}

impl Dispatcher {
    /// Spawns the worker loop. It ends once every `Dispatcher` handle is
    /// dropped and all queued and running jobs have finished.
    pub fn start(handler: Arc<dyn JobHandler>, workers: usize) -> (Dispatcher, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_workers(rx, handler, workers.max(1)));
        (Dispatcher { tx, locks: LockManager::new() }, task)
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn submit(&self, job: SettlementJob, mode: SubmitMode) -> Result<Submitted, DispatchError> {
        let Some(guard) = self.locks.try_acquire(&job.contract_id) else {
            return match mode {
                SubmitMode::Drop => {
                    JOBS.with_label_values(&["dropped"]).inc();
                    debug!(contract_id = %job.contract_id, "settlement already in progress, job dropped");
                    Ok(Submitted::Dropped)
                }
                SubmitMode::Strict => {
                    JOBS.with_label_values(&["busy"]).inc();
                    Err(DispatchError::Busy(job.contract_id))
                }
            };
        };

        let (done, rx) = oneshot::channel();
        if self.tx.send(Queued { job, guard, done }).is_err() {
            // the guard inside the rejected message is dropped here
            JOBS.with_label_values(&["closed"]).inc();
            return Err(DispatchError::Closed);
        }
        JOBS.with_label_values(&["queued"]).inc();
        Ok(Submitted::Queued(JobTicket(rx)))
    }
}

struct InFlight;

impl InFlight {
    fn enter() -> Self {
        IN_FLIGHT.inc();
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        IN_FLIGHT.dec();
    }
}

fn reap(res: Result<(), JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            error!(?e, "settlement task panicked");
        } else {
            warn!(?e, "settlement task cancelled");
        }
    }
}

async fn run_workers(mut rx: mpsc::UnboundedReceiver<Queued>, handler: Arc<dyn JobHandler>, workers: usize) {
    info!(workers, "dispatcher: started");
    let slots = Arc::new(Semaphore::new(workers));
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(Queued { job, guard, done }) = next else { break };
                // wait for a slot before taking the next job: keeps FIFO start order
                let permit = match Arc::clone(&slots).acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let handler = Arc::clone(&handler);
                running.spawn(async move {
                    let _permit = permit;
                    let _in_flight = InFlight::enter();
                    handler.handle(job).await;
                    drop(guard);
                    let _ = done.send(());
                });
            }
            Some(res) = running.join_next(), if !running.is_empty() => reap(res),
        }
    }

    info!(pending = running.len(), "dispatcher: queue closed, draining");
    while let Some(res) = running.join_next().await {
        reap(res);
    }
    info!("dispatcher: stopped");
}
