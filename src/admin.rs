// ===============================
// src/admin.rs (manual replay entry point)
// ===============================
//
// A running engine owns the contracts file (StoreLease) and listens on
// 127.0.0.1:ADMIN_PORT for one JSON request per line:
//   {"contract_id":"c1","outcome":"claimed","close_price":"111"}
// Replays go through the live Dispatcher in strict mode, so they share the
// per-contract lock with the scheduled scan.
//
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tracing::{info, warn};

use crate::config::ReplayOutcome;
use crate::dispatcher::{DispatchError, Dispatcher, SubmitMode, Submitted};
use crate::domain::{now_ms, ContractState, SettlementJob, Trigger, TriggerKind};
use crate::store::ContractStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub contract_id: String,
    pub outcome: ReplayOutcome,
    #[serde(default)]
    pub close_price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplayReply {
    Settled { state: ContractState, pnl_user: Decimal, pnl_net: Decimal },
    /// A settlement for this contract is already running.
    Busy,
    NotFound,
    NotAvailable { state: ContractState, reconciliation: Option<String> },
    /// The job ran but left the contract unsettled (rolled back or flagged).
    Unsettled { state: ContractState, reconciliation: Option<String> },
    Error { message: String },
}

/// Settles one contract through `dispatcher` and reports where it ended up.
pub async fn replay_contract(store: &dyn ContractStore, dispatcher: &Dispatcher, req: &ReplayRequest) -> ReplayReply {
    let contract = match store.get(&req.contract_id).await {
        Ok(Some(c)) => c,
        Ok(None) => return ReplayReply::NotFound,
        Err(e) => return ReplayReply::Error { message: e.to_string() },
    };
    if !contract.is_matchable() {
        return ReplayReply::NotAvailable { state: contract.state, reconciliation: contract.reconciliation };
    }

    let trigger = match req.outcome {
        ReplayOutcome::Claimed => Trigger {
            kind: TriggerKind::Claim,
            close_price: req.close_price.unwrap_or(contract.claim_price),
        },
        ReplayOutcome::Liquidated => Trigger {
            kind: TriggerKind::Stop,
            close_price: req.close_price.unwrap_or(contract.stop_price),
        },
    };
    info!(
        contract_id = %req.contract_id,
        trigger = trigger.kind.as_str(),
        close_price = %trigger.close_price,
        "manual replay"
    );

    match dispatcher.submit(SettlementJob::new(contract, trigger, now_ms()), SubmitMode::Strict) {
        Ok(Submitted::Queued(ticket)) => ticket.finished().await,
        Ok(Submitted::Dropped) | Err(DispatchError::Busy(_)) => return ReplayReply::Busy,
        Err(e) => return ReplayReply::Error { message: e.to_string() },
    }

    match store.get(&req.contract_id).await {
        Ok(Some(c)) if c.state.is_terminal() => {
            ReplayReply::Settled { state: c.state, pnl_user: c.pnl_user, pnl_net: c.pnl_net }
        }
        Ok(Some(c)) => ReplayReply::Unsettled { state: c.state, reconciliation: c.reconciliation },
        Ok(None) => ReplayReply::NotFound,
        Err(e) => ReplayReply::Error { message: e.to_string() },
    }
}

pub async fn bind(port: u16) -> io::Result<TcpListener> {
    TcpListener::bind(("127.0.0.1", port)).await
}

/// Serves replay requests until shutdown; each connection gets its own task.
pub async fn serve(
    listener: TcpListener,
    store: Arc<dyn ContractStore>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "admin: listening");
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let store = store.clone();
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_conn(stream, store.as_ref(), &dispatcher).await {
                            warn!(?e, %peer, "admin: connection error");
                        }
                    });
                }
                Err(e) => warn!(?e, "admin: accept failed"),
            },
            _ = shutdown.changed() => {
                info!("admin: shutdown");
                break;
            }
        }
    }
}

async fn handle_conn(stream: TcpStream, store: &dyn ContractStore, dispatcher: &Dispatcher) -> io::Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match serde_json::from_str::<ReplayRequest>(&line) {
            Ok(req) => replay_contract(store, dispatcher, &req).await,
            Err(e) => ReplayReply::Error { message: format!("bad request: {e}") },
        };
        let mut out = serde_json::to_vec(&reply).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        out.push(b'\n');
        wr.write_all(&out).await?;
    }
    Ok(())
}

/// Sends one request to a running engine and waits for its reply.
pub async fn request(addr: SocketAddr, req: &ReplayRequest) -> io::Result<ReplayReply> {
    let stream = TcpStream::connect(addr).await?;
    let (rd, mut wr) = stream.into_split();
    let mut body = serde_json::to_vec(req).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    body.push(b'\n');
    wr.write_all(&body).await?;

    let mut lines = BufReader::new(rd).lines();
    let Some(line) = lines.next_line().await? else {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "engine closed the connection"));
    };
    serde_json::from_str(&line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::JobHandler;
    use crate::domain::fixtures::bull_contract;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    /// Marks every job's contract as claimed.
    struct MarkClaimed(Arc<MemoryStore>);

    #[async_trait]
    impl JobHandler for MarkClaimed {
        async fn handle(&self, job: SettlementJob) {
            self.0.set_state(&job.contract_id, ContractState::Claimed).await.unwrap();
        }
    }

    fn claim(id: &str) -> ReplayRequest {
        ReplayRequest { contract_id: id.into(), outcome: ReplayOutcome::Claimed, close_price: None }
    }

    #[tokio::test]
    async fn replay_is_busy_while_the_scan_holds_the_contract() {
        let store = Arc::new(MemoryStore::new(vec![bull_contract("c1")]));
        let (dispatcher, _task) = Dispatcher::start(Arc::new(MarkClaimed(store.clone())), 2);

        // a scheduled settlement of c1 is in flight
        let scan_lock = dispatcher.locks().try_acquire("c1").unwrap();
        assert_eq!(replay_contract(store.as_ref(), &dispatcher, &claim("c1")).await, ReplayReply::Busy);
        assert_eq!(store.get("c1").await.unwrap().unwrap().state, ContractState::Available);

        drop(scan_lock);
        let reply = replay_contract(store.as_ref(), &dispatcher, &claim("c1")).await;
        assert!(matches!(reply, ReplayReply::Settled { state: ContractState::Claimed, .. }));
        assert!(matches!(
            replay_contract(store.as_ref(), &dispatcher, &claim("c1")).await,
            ReplayReply::NotAvailable { state: ContractState::Claimed, .. }
        ));
        assert_eq!(replay_contract(store.as_ref(), &dispatcher, &claim("nope")).await, ReplayReply::NotFound);
    }

    #[tokio::test]
    async fn requests_reach_the_running_dispatcher() {
        let store = Arc::new(MemoryStore::new(vec![bull_contract("c1")]));
        let (dispatcher, _task) = Dispatcher::start(Arc::new(MarkClaimed(store.clone())), 2);
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, store.clone(), Arc::new(dispatcher), stop_rx));

        let req = ReplayRequest { close_price: Some(dec!(112)), ..claim("c1") };
        let reply = request(addr, &req).await.unwrap();
        assert!(matches!(reply, ReplayReply::Settled { state: ContractState::Claimed, .. }));
        assert_eq!(store.get("c1").await.unwrap().unwrap().state, ContractState::Claimed);

        stop_tx.send(true).unwrap();
        server.await.unwrap();
    }

    #[test]
    fn request_wire_format() {
        let req: ReplayRequest =
            serde_json::from_str(r#"{"contract_id":"c1","outcome":"liquidated"}"#).unwrap();
        assert_eq!(req.outcome, ReplayOutcome::Liquidated);
        assert_eq!(req.close_price, None);
        let reply = serde_json::to_value(ReplayReply::Busy).unwrap();
        assert_eq!(reply["status"], "busy");
    }
}
