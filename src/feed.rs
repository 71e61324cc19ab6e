// ===============================
// src/feed.rs
// ===============================
//
// Price stream adapters, one task per symbol:
// - run_mock    : random-walk last price (~5 ticks/s)
// - run_binance : Binance USD-M futures `<symbol>@ticker` (testnet & mainnet)
//
// Each task pushes PriceTick into its own channel (consumed by the
// aggregator's ingest task) and listens on a control channel for restart
// requests from the staleness watchdog.
//
use futures_util::StreamExt;
use rand::Rng;
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};
use url::Url;

use crate::binance::parse_ticker;
use crate::domain::{now_ms, round_money, PriceTick};
use crate::metrics::{STREAM_CONNECTED, STREAM_RESTARTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedCommand {
    Restart,
}

/// Random walk around `start_px`, steps of up to ±5 bps.
pub async fn run_mock(
    tick_tx: mpsc::Sender<PriceTick>,
    symbol: String,
    start_px: Decimal,
    mut ctl_rx: mpsc::Receiver<FeedCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut px = start_px;
    let floor = start_px / Decimal::from(10);
    STREAM_CONNECTED.with_label_values(&[&symbol]).set(1);
    loop {
        // jangan simpan ThreadRng melewati .await
        let step_bps = rand::thread_rng().gen_range(-5..=5);
        px = round_money(px + px * Decimal::new(step_bps, 4)).max(floor);
        let tick = PriceTick { symbol: symbol.clone(), price: px, ts_ms: now_ms() };
        if tick_tx.send(tick).await.is_err() {
            return;
        }
        tokio::select! {
            _ = sleep(Duration::from_millis(200)) => {}
            Some(cmd) = ctl_rx.recv() => info!(%symbol, ?cmd, "mock feed: command ignored"),
            _ = shutdown.changed() => break,
        }
    }
    STREAM_CONNECTED.with_label_values(&[&symbol]).set(0);
}

/// Binance futures 24h ticker stream; only the last price `c` is used.
///
/// A connection that stays silent for `stale_after` is torn down and
/// reopened, as is one the watchdog asks to restart.
pub async fn run_binance(
    tick_tx: mpsc::Sender<PriceTick>,
    symbol: String,
    ws_base: String,
    stale_after: Duration,
    mut ctl_rx: mpsc::Receiver<FeedCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let topic = format!("{}@ticker", symbol.to_lowercase());
    let ws_url = format!("{}/{}", ws_base.trim_end_matches('/'), topic);
    let url = match Url::parse(&ws_url) {
        Ok(u) => u,
        Err(e) => {
            error!(?e, %ws_url, "bad ws url");
            return;
        }
    };

    let mut attempt: u32 = 0;
    loop {
        info!(%ws_url, "connecting ticker stream");
        match connect_async(url.clone()).await {
            Ok((mut ws, _resp)) => {
                info!(%symbol, "ticker stream connected");
                STREAM_CONNECTED.with_label_values(&[&symbol]).set(1);
                attempt = 0; // reset backoff

                loop {
                    tokio::select! {
                        frame = timeout(stale_after, ws.next()) => match frame {
                            Err(_) => {
                                warn!(%symbol, ?stale_after, "no ticker frame within staleness window");
                                STREAM_RESTARTS.with_label_values(&[&symbol, "timeout"]).inc();
                                break;
                            }
                            Ok(None) => {
                                info!(%symbol, "ticker stream closed by peer");
                                break;
                            }
                            Ok(Some(Err(e))) => {
                                error!(?e, %symbol, "ws read error");
                                STREAM_RESTARTS.with_label_values(&[&symbol, "error"]).inc();
                                break;
                            }
                            Ok(Some(Ok(m))) if m.is_text() => {
                                let txt = match m.into_text() {
                                    Ok(t) => t,
                                    Err(e) => {
                                        warn!(?e, "failed to read text frame");
                                        continue;
                                    }
                                };
                                // {"e":"24hrTicker","E":1672515782136,"s":"BTCUSDT","c":"0.0025",...}
                                match parse_ticker(&txt) {
                                    Some(tick) => {
                                        if tick_tx.send(tick).await.is_err() {
                                            info!(%symbol, "tick channel closed, feed stopped");
                                            return;
                                        }
                                    }
                                    None => warn!(%symbol, payload = %txt, "unparseable ticker frame"),
                                }
                            }
                            Ok(Some(Ok(_))) => {
                                // ping/pong dijawab otomatis oleh tungstenite
                            }
                        },
                        Some(FeedCommand::Restart) = ctl_rx.recv() => {
                            info!(%symbol, "restart requested");
                            let _ = ws.close(None).await;
                            break;
                        }
                        _ = shutdown.changed() => {
                            let _ = ws.close(None).await;
                            STREAM_CONNECTED.with_label_values(&[&symbol]).set(0);
                            info!(%symbol, "ticker stream shut down");
                            return;
                        }
                    }
                }
                STREAM_CONNECTED.with_label_values(&[&symbol]).set(0);
            }
            Err(e) => {
                error!(?e, %symbol, "connect failed");
            }
        }

        // Exponential backoff + jitter
        attempt = attempt.saturating_add(1);
        let shift = attempt.min(6);                   // 0..=6
        let factor = 1u64 << shift;                   // 1,2,4,...,64
        let base_ms = 500u64.saturating_mul(factor);  // 0.5s..32s
        let jitter = rand::thread_rng().gen_range(0..=250);
        tokio::select! {
            _ = sleep(Duration::from_millis(base_ms + jitter)) => {}
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn mock_feed_emits_ticks_until_shutdown() {
        let (tick_tx, mut tick_rx) = mpsc::channel(16);
        let (_ctl_tx, ctl_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_mock(tick_tx, "BTCUSDT".into(), dec!(100), ctl_rx, stop_rx));

        let first = tick_rx.recv().await.unwrap();
        assert_eq!(first.symbol, "BTCUSDT");
        assert!(first.price >= dec!(99.9) && first.price <= dec!(100.1));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
