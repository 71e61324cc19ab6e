// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Price stream --------
pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_symbol", "last-trade ticks ingested per symbol"),
        &["symbol"],
    )
    .unwrap()
});

pub static STREAM_RESTARTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("stream_restarts_total", "price stream restarts (reason: stale|error)"),
        &["symbol", "reason"],
    )
    .unwrap()
});

pub static STREAM_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("stream_connected", "1 if the symbol's price stream is connected"),
        &["symbol"],
    )
    .unwrap()
});

// -------- Matcher --------
pub static SCANS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("scans_total", "matcher scan passes").unwrap());

pub static SCAN_DURATION_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("scan_duration_ms", "matcher pass duration (ms)")
            .buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
    )
    .unwrap()
});

pub static ACTIVE_CONTRACTS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("active_contracts", "contracts in the last active snapshot").unwrap());

pub static DATA_GAPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("data_gaps_total", "contracts skipped for lack of price data"),
        &["symbol"],
    )
    .unwrap()
});

pub static MATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("matches_total", "threshold crossings"), &["trigger"]).unwrap()
});

// -------- Dispatcher --------
pub static JOBS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("settlement_jobs_total", "settlement submissions (result: queued|dropped|busy|closed)"),
        &["result"],
    )
    .unwrap()
});

pub static IN_FLIGHT: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("settlements_in_flight", "settlements currently running").unwrap());

// -------- Settlement --------
pub static SETTLEMENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "settlements_total",
            "settlement outcomes (outcome: settled|race|compensated|inconsistent|error)",
        ),
        &["outcome"],
    )
    .unwrap()
});

pub static LEDGER_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("ledger_errors_total", "failed ledger calls"), &["op"]).unwrap()
});

pub static COMPENSATION_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("compensation_failures_total", "rollbacks that could not be applied").unwrap()
});

pub static VENUE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("venue_errors_total", "failed hedge cancel requests"),
        &["leg"],
    )
    .unwrap()
});

pub static ALERTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("alerts_total", "operator alerts emitted").unwrap());

// ---- Config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_feed_mode", "feed mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_VENUE_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_venue_mode", "venue mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_symbol", "configured symbols (label: symbol)"), &["symbol"])
        .unwrap()
});

pub static CONFIG_WORKERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("config_settle_workers", "settlement worker pool size").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS_BY_SYMBOL.clone())),
        REGISTRY.register(Box::new(STREAM_RESTARTS.clone())),
        REGISTRY.register(Box::new(STREAM_CONNECTED.clone())),
        REGISTRY.register(Box::new(SCANS.clone())),
        REGISTRY.register(Box::new(SCAN_DURATION_MS.clone())),
        REGISTRY.register(Box::new(ACTIVE_CONTRACTS.clone())),
        REGISTRY.register(Box::new(DATA_GAPS.clone())),
        REGISTRY.register(Box::new(MATCHES.clone())),
        REGISTRY.register(Box::new(JOBS.clone())),
        REGISTRY.register(Box::new(IN_FLIGHT.clone())),
        REGISTRY.register(Box::new(SETTLEMENTS.clone())),
        REGISTRY.register(Box::new(LEDGER_ERRORS.clone())),
        REGISTRY.register(Box::new(COMPENSATION_FAILURES.clone())),
        REGISTRY.register(Box::new(VENUE_ERRORS.clone())),
        REGISTRY.register(Box::new(ALERTS.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_VENUE_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
        REGISTRY.register(Box::new(CONFIG_WORKERS.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics)
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Metrics server di OS thread sendiri (runtime Tokio tetap bersih)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(?e, %addr, "metrics bind failed, metrics disabled");
                return;
            }
        };
        tracing::info!(%addr, "metrics listening (GET / or /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}
