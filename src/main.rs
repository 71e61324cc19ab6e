// ===============================
// src/main.rs
// ===============================
/*
 # jalankan engine (mock feed + mock venue + in-memory ledger)
 CONTRACTS_FILE=./contracts.json RECORD_FILE=./data/events.jsonl cargo run --release

 # settle satu kontrak secara manual (lewat engine yang sedang jalan kalau ada)
 cargo run --release -- replay --contract-id 65f0c1 --outcome claimed

 # cek konfigurasi & aktivitas
 curl -s localhost:9898/metrics | egrep '^config_(feed_mode|venue_mode|symbol|settle_workers)'
 curl -s localhost:9898/metrics | egrep '^(matches_total|settlements_total|data_gaps_total)'
*/
/*
=============================================================================
Project : touchguard — price-triggered settlement engine in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Streams per-symbol last-trade prices (mock/Binance futures),
          aggregates per-cycle high/low windows, matches live contracts
          against claim/stop thresholds, settles each contract exactly once
          on a bounded worker pool, moves balances through the ledger with
          compensation on partial failure, and cancels venue hedges.
=============================================================================
*/
mod admin;            // manual replay: admin listener + client
mod aggregator;
mod alert;
mod binance;          // signer + ticker/order models for Binance futures
mod calculator;
mod canceller;
mod config;
mod dispatcher;
mod domain;
mod exchange;         // hedge venue: Binance futures REST or mock
mod feed;
mod ledger;
mod matcher;
mod metrics;
mod orchestrator;
mod recorder;
mod retry;
mod settlement;
mod store;

use ahash::AHashMap as HashMap;
use clap::Parser;
use rust_decimal::Decimal;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    select,
    sync::{mpsc, watch},
    time::{sleep, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::admin::{ReplayReply, ReplayRequest};
use crate::aggregator::PriceAggregator;
use crate::alert::{Alerter, LogAlerter, WebhookAlerter};
use crate::canceller::HedgeCanceller;
use crate::config::{Args, Command, Limits, MarketMode, ReplayOutcome};
use crate::dispatcher::Dispatcher;
use crate::domain::{now_ms, Event};
use crate::exchange::{BinanceFutures, HedgeVenue, MockVenue, VenueError};
use crate::ledger::{HttpLedger, Ledger, LedgerError, MemoryLedger};
use crate::matcher::Matcher;
use crate::orchestrator::BalanceOrchestrator;
use crate::settlement::Settler;
use crate::store::{ContractStore, MemoryStore, StoreError, StoreLease};

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Venue(#[from] VenueError),
    #[error("admin listener: {0}")]
    Admin(#[from] std::io::Error),
    #[error("alert webhook: {0}")]
    Alert(#[from] reqwest::Error),
    #[error("replay: {0}")]
    Replay(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = config::Cli::parse();
    match dispatch(cli.command.unwrap_or(Command::Run)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Command) -> Result<(), AppError> {
    let (args, limits) = config::load()?;
    match command {
        Command::Run => run(args, limits).await,
        Command::Replay { contract_id, outcome, close_price } => {
            replay(args, limits, contract_id, outcome, close_price).await
        }
    }
}

// ---- Shared service construction ----

/// Takes the contracts file for this process; `None` when no file is configured.
fn lease_store(args: &Args) -> Result<Option<StoreLease>, StoreError> {
    args.contracts_file.as_ref().map(StoreLease::acquire).transpose()
}

async fn open_store(args: &Args) -> Result<Arc<MemoryStore>, AppError> {
    match &args.contracts_file {
        Some(path) => Ok(Arc::new(MemoryStore::open(path).await?)),
        None => {
            warn!("CONTRACTS_FILE not set, contract store starts empty");
            Ok(Arc::new(MemoryStore::default()))
        }
    }
}

fn build_settler(
    args: &Args,
    limits: &Limits,
    store: Arc<dyn ContractStore>,
    rec_tx: mpsc::Sender<Event>,
) -> Result<Settler, AppError> {
    let alerter: Arc<dyn Alerter> = match &args.alert_webhook_url {
        Some(url) => Arc::new(WebhookAlerter::new(url, limits.exchange_timeout)?),
        None => Arc::new(LogAlerter),
    };
    let ledger: Arc<dyn Ledger> = match &args.ledger_url {
        Some(url) => Arc::new(HttpLedger::new(url, limits.ledger_timeout)?),
        None => {
            warn!("LEDGER_URL not set, balances are booked in memory only");
            Arc::new(MemoryLedger::new())
        }
    };
    let venue: Arc<dyn HedgeVenue> = match args.venue_mode {
        MarketMode::Mock => Arc::new(MockVenue::new()),
        MarketMode::BinanceTestnet | MarketMode::BinanceMainnet => Arc::new(BinanceFutures::new(
            &args.binance_rest_url,
            args.binance_recv_window,
            limits.exchange_timeout,
            args.default_credential.clone(),
            args.hedge_accounts.clone(),
        )?),
    };

    let orchestrator = BalanceOrchestrator::new(
        ledger,
        alerter.clone(),
        &args.pool_user_id,
        limits.retry.clone(),
        limits.ledger_timeout,
    );
    let canceller = HedgeCanceller::new(venue, alerter.clone(), limits.retry.clone());
    Ok(Settler::new(store, orchestrator, canceller, alerter, limits.retry.clone(), limits.store_timeout, rec_tx))
}

fn export_config(args: &Args, limits: &Limits) {
    info!(
        feed_mode = args.feed_mode.as_str(),
        venue_mode = args.venue_mode.as_str(),
        symbols = ?args.symbols,
        settle_workers = limits.settle_workers,
        scan_interval = ?args.scan_interval,
        stale_after = ?args.stale_after,
        binance_ws = %args.binance_ws_url,
        binance_rest = %args.binance_rest_url,
        hedge_accounts = args.hedge_accounts.len(),
        ledger = args.ledger_url.as_deref().unwrap_or("memory"),
        "startup config"
    );
    metrics::CONFIG_FEED_MODE.with_label_values(&[args.feed_mode.as_str()]).set(1);
    metrics::CONFIG_VENUE_MODE.with_label_values(&[args.venue_mode.as_str()]).set(1);
    for s in &args.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[s]).set(1);
    }
    metrics::CONFIG_WORKERS.set(limits.settle_workers as i64);
}

// ---- run ----

async fn run(args: Args, limits: Limits) -> Result<(), AppError> {
    // one engine per contracts file; replays reach it over the admin port
    let _lease = lease_store(&args)?;

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);
    export_config(&args, &limits);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    let recorder_task = args.record_file.clone().map(|path| tokio::spawn(recorder::run(rec_rx, path)));

    // ---- Store + settlement pipeline ----
    let store = open_store(&args).await?;
    let settler = build_settler(&args, &limits, store.clone(), rec_tx.clone())?;
    let (dispatcher, dispatch_task) = Dispatcher::start(Arc::new(settler), limits.settle_workers);
    let dispatcher = Arc::new(dispatcher);

    // ---- Admin (manual replay) ----
    let listener = admin::bind(args.admin_port).await?;
    let admin_task = tokio::spawn(admin::serve(listener, store.clone(), dispatcher.clone(), shutdown_rx.clone()));

    // ---- Price streams: feed -> ingest -> aggregator ----
    let agg = Arc::new(PriceAggregator::new());
    let mut start_px: HashMap<String, Decimal> = HashMap::new();
    for c in store.active_contracts().await? {
        start_px.entry(c.symbol()).or_insert(c.open_price);
    }
    let mut controls = HashMap::new();
    for sym in args.symbols.iter().cloned() {
        let (tick_tx, tick_rx) = mpsc::channel(4096);
        let (ctl_tx, ctl_rx) = mpsc::channel(4);
        controls.insert(sym.clone(), ctl_tx);
        agg.register(&sym, now_ms());
        tokio::spawn(aggregator::run_ingest(sym.clone(), tick_rx, agg.clone()));

        let stop = shutdown_rx.clone();
        match args.feed_mode {
            MarketMode::Mock => {
                let px = start_px.get(&sym).copied().unwrap_or_else(|| Decimal::from(100));
                tokio::spawn(feed::run_mock(tick_tx, sym, px, ctl_rx, stop));
            }
            MarketMode::BinanceTestnet | MarketMode::BinanceMainnet => {
                let base = args.binance_ws_url.clone();
                tokio::spawn(feed::run_binance(tick_tx, sym, base, args.stale_after, ctl_rx, stop));
            }
        }
    }
    let watchdog_task = tokio::spawn(aggregator::run_watchdog(
        agg.clone(),
        controls,
        args.stale_after,
        args.stale_check,
        rec_tx.clone(),
        shutdown_rx.clone(),
    ));

    // ---- Matcher ----
    let matcher = Matcher::new(store, agg, dispatcher.clone(), rec_tx);
    let matcher_task = tokio::spawn(matcher.run(args.scan_interval, shutdown_rx));

    // ---- Heartbeat until ctrl-c ----
    loop {
        select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!(?e, "ctrl_c listener failed, shutting down");
                }
                break;
            }
            _ = sleep(Duration::from_secs(30)) => {
                info!(
                    in_flight = metrics::IN_FLIGHT.get(),
                    locked = dispatcher.locks().held_count(),
                    "heartbeat"
                );
            }
        }
    }

    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    for (name, task) in [("matcher", matcher_task), ("watchdog", watchdog_task), ("admin", admin_task)] {
        if let Err(e) = task.await {
            error!(?e, task = name, "task ended abnormally");
        }
    }
    // last handle: the worker loop drains in-flight settlements and exits
    drop(dispatcher);
    if let Err(e) = dispatch_task.await {
        error!(?e, "dispatcher task ended abnormally");
    }
    // every event sender is gone now; the recorder flushes and stops
    if let Some(task) = recorder_task {
        if let Err(e) = task.await {
            error!(?e, "recorder task ended abnormally");
        }
    }
    info!("bye");
    Ok(())
}

// ---- replay ----

async fn replay(
    args: Args,
    limits: Limits,
    contract_id: String,
    outcome: ReplayOutcome,
    close_price: Option<Decimal>,
) -> Result<(), AppError> {
    let req = ReplayRequest { contract_id, outcome, close_price };

    let lease = match lease_store(&args) {
        Ok(lease) => lease,
        Err(StoreError::Locked(path, _)) => {
            // a running engine owns the store: settle through its dispatcher
            info!(%path, port = args.admin_port, "store held by a running engine, replaying through it");
            let addr = SocketAddr::from(([127, 0, 0, 1], args.admin_port));
            let reply = admin::request(addr, &req).await.map_err(|e| {
                AppError::Replay(format!("engine admin port {} unreachable ({e}); stale lock file?", args.admin_port))
            })?;
            return report(&req.contract_id, reply);
        }
        Err(e) => return Err(e.into()),
    };

    let store = open_store(&args).await?;
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(64);
    let recorder_task = args.record_file.clone().map(|path| tokio::spawn(recorder::run(rec_rx, path)));

    let settler = build_settler(&args, &limits, store.clone(), rec_tx)?;
    let (dispatcher, dispatch_task) = Dispatcher::start(Arc::new(settler), 1);
    let reply = admin::replay_contract(store.as_ref(), &dispatcher, &req).await;
    drop(dispatcher);
    let _ = dispatch_task.await;
    if let Some(task) = recorder_task {
        let _ = task.await;
    }
    drop(lease);
    report(&req.contract_id, reply)
}

fn report(contract_id: &str, reply: ReplayReply) -> Result<(), AppError> {
    match reply {
        ReplayReply::Settled { state, pnl_user, pnl_net } => {
            info!(%contract_id, ?state, %pnl_user, %pnl_net, "replay settled");
            Ok(())
        }
        ReplayReply::Busy => Err(AppError::Replay(format!("contract {contract_id} is already being settled"))),
        ReplayReply::NotFound => Err(AppError::Replay(format!("contract {contract_id} not found"))),
        ReplayReply::NotAvailable { state, reconciliation } => Err(AppError::Replay(format!(
            "contract {contract_id} is {state:?}, not available for settlement (reconciliation: {})",
            reconciliation.as_deref().unwrap_or("none")
        ))),
        ReplayReply::Unsettled { state, reconciliation } => Err(AppError::Replay(format!(
            "contract {contract_id} still {state:?} (reconciliation: {})",
            reconciliation.as_deref().unwrap_or("none")
        ))),
        ReplayReply::Error { message } => Err(AppError::Replay(message)),
    }
}
