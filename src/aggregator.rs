// ===============================
// src/aggregator.rs (per-cycle high/low windows)
// ===============================
//
// One ingest task per symbol feeds the shared aggregator. Windows live in a
// sharded map so unrelated symbols never serialize on one lock; the matcher
// takes (removes) the windows once per pass, so every observed extreme is
// attributed to exactly one scan.
//
use ahash::AHashMap as HashMap;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::{now_ms, Event, Millis, PriceTick, PriceWindow};
use crate::feed::FeedCommand;
use crate::metrics::{STREAM_RESTARTS, TICKS_BY_SYMBOL};

#[derive(Debug, Default)]
pub struct PriceAggregator {
    windows: DashMap<String, PriceWindow>,
    last_seen: DashMap<String, Millis>,
}

impl PriceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts staleness tracking for a symbol before its first tick arrives.
    pub fn register(&self, symbol: &str, at_ms: Millis) {
        self.last_seen.insert(symbol.to_string(), at_ms);
    }

    pub fn ingest(&self, tick: PriceTick) {
        TICKS_BY_SYMBOL.with_label_values(&[&tick.symbol]).inc();
        self.last_seen.insert(tick.symbol.clone(), now_ms());
        self.windows
            .entry(tick.symbol.clone())
            .and_modify(|w| w.observe(&tick))
            .or_insert_with(|| PriceWindow::open(&tick));
    }

    /// Current window for `symbol`, cleared for the next cycle. `None` means
    /// no tick arrived since the last reset.
    pub fn consume_and_reset(&self, symbol: &str) -> Option<PriceWindow> {
        self.windows.remove(symbol).map(|(_, w)| w)
    }

    /// Consumes every window at once; the matcher's per-pass snapshot.
    pub fn drain(&self) -> HashMap<String, PriceWindow> {
        let symbols: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();
        symbols
            .into_iter()
            .filter_map(|s| self.consume_and_reset(&s).map(|w| (s, w)))
            .collect()
    }

    /// Symbols with no tick for longer than `stale_after_ms`, with their idle time.
    pub fn stale_symbols(&self, now: Millis, stale_after_ms: Millis) -> Vec<(String, Millis)> {
        self.last_seen
            .iter()
            .filter_map(|e| {
                let idle = now - *e.value();
                (idle > stale_after_ms).then(|| (e.key().clone(), idle))
            })
            .collect()
    }

    /// Asks the feed of every stale symbol to reconnect. Returns the symbols restarted.
    pub fn restart_stale(
        &self,
        now: Millis,
        stale_after_ms: Millis,
        controls: &HashMap<String, mpsc::Sender<FeedCommand>>,
        rec_tx: &mpsc::Sender<Event>,
    ) -> Vec<String> {
        let mut restarted = Vec::new();
        for (symbol, idle_ms) in self.stale_symbols(now, stale_after_ms) {
            let Some(ctl) = controls.get(&symbol) else {
                debug!(%symbol, "stale symbol has no feed control");
                continue;
            };
            warn!(%symbol, idle_ms, "price stream stale, requesting restart");
            if ctl.try_send(FeedCommand::Restart).is_ok() {
                STREAM_RESTARTS.with_label_values(&[&symbol, "stale"]).inc();
                let _ = rec_tx.try_send(Event::StreamRestart { symbol: symbol.clone(), idle_ms, ts_ms: now });
            }
            // reset so the next check waits a full window for the new connection
            self.last_seen.insert(symbol.clone(), now);
            restarted.push(symbol);
        }
        restarted
    }
}

/// Ingest task for one symbol's tick channel.
pub async fn run_ingest(symbol: String, mut rx: mpsc::Receiver<PriceTick>, agg: Arc<PriceAggregator>) {
    while let Some(tick) = rx.recv().await {
        if tick.symbol != symbol {
            debug!(expected = %symbol, got = %tick.symbol, "tick on wrong channel, ingesting anyway");
        }
        agg.ingest(tick);
    }
    info!(%symbol, "tick channel closed, ingest stopped");
}

/// Periodic staleness check over all registered symbols.
pub async fn run_watchdog(
    agg: Arc<PriceAggregator>,
    controls: HashMap<String, mpsc::Sender<FeedCommand>>,
    stale_after: Duration,
    check_every: Duration,
    rec_tx: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(check_every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let stale_after_ms = stale_after.as_millis() as Millis;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                agg.restart_stale(now_ms(), stale_after_ms, &controls, &rec_tx);
            }
            _ = shutdown.changed() => {
                info!("watchdog: shutdown");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fixtures::tick;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[test]
    fn consume_twice_returns_empty_second_time() {
        let agg = PriceAggregator::new();
        agg.ingest(tick("BTCUSDT", dec!(100), 1));
        agg.ingest(tick("BTCUSDT", dec!(111), 2));
        agg.ingest(tick("BTCUSDT", dec!(98), 3));

        let w = agg.consume_and_reset("BTCUSDT").unwrap();
        assert_eq!(w.high, dec!(111));
        assert_eq!(w.low, dec!(98));
        assert_eq!(w.last_ts_ms, 3);
        assert!(agg.consume_and_reset("BTCUSDT").is_none());
    }

    #[test]
    fn ticks_after_reset_start_a_new_window() {
        let agg = PriceAggregator::new();
        agg.ingest(tick("ETHUSDT", dec!(2000), 1));
        let _ = agg.consume_and_reset("ETHUSDT");
        agg.ingest(tick("ETHUSDT", dec!(1990), 2));
        let w = agg.consume_and_reset("ETHUSDT").unwrap();
        assert_eq!(w.high, dec!(1990));
        assert_eq!(w.samples().len(), 1);
    }

    #[test]
    fn drain_takes_every_symbol_once() {
        let agg = PriceAggregator::new();
        agg.ingest(tick("BTCUSDT", dec!(1), 1));
        agg.ingest(tick("ETHUSDT", dec!(2), 1));
        let snap = agg.drain();
        assert_eq!(snap.len(), 2);
        assert!(agg.drain().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ingest_keeps_every_extreme() {
        let agg = Arc::new(PriceAggregator::new());
        let mut handles = Vec::new();
        for sym in ["AUSDT", "BUSDT", "CUSDT", "DUSDT"] {
            for worker in 0..2i64 {
                let agg = agg.clone();
                handles.push(tokio::spawn(async move {
                    for i in 0..200i64 {
                        let px = Decimal::from(1_000 + worker * 1_000 + i);
                        agg.ingest(tick(sym, px, i));
                    }
                }));
            }
        }
        for h in handles {
            h.await.unwrap();
        }
        let snap = agg.drain();
        assert_eq!(snap.len(), 4);
        for w in snap.values() {
            assert_eq!(w.low, dec!(1000));
            assert_eq!(w.high, dec!(2199));
            assert_eq!(w.samples().len(), 400);
        }
    }

    #[test]
    fn silent_symbols_are_reported_stale() {
        let agg = PriceAggregator::new();
        agg.register("BTCUSDT", 0);
        agg.register("ETHUSDT", 150_000);
        let stale = agg.stale_symbols(200_000, 180_000);
        assert_eq!(stale, vec![("BTCUSDT".to_string(), 200_000)]);
    }

    #[tokio::test]
    async fn restart_stale_signals_feed_once_per_window() {
        let agg = PriceAggregator::new();
        agg.register("BTCUSDT", 0);
        let (ctl_tx, mut ctl_rx) = mpsc::channel(4);
        let (rec_tx, mut rec_rx) = mpsc::channel(4);
        let mut controls = HashMap::new();
        controls.insert("BTCUSDT".to_string(), ctl_tx);

        let restarted = agg.restart_stale(200_000, 180_000, &controls, &rec_tx);
        assert_eq!(restarted, vec!["BTCUSDT".to_string()]);
        assert!(matches!(ctl_rx.try_recv(), Ok(FeedCommand::Restart)));
        assert!(matches!(rec_rx.try_recv(), Ok(Event::StreamRestart { .. })));

        // last_seen was reset: not stale again right away
        assert!(agg.restart_stale(210_000, 180_000, &controls, &rec_tx).is_empty());
    }
}
