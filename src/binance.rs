// ===============================
// src/binance.rs
// ===============================
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;

use crate::domain::{now_ms, PriceTick};

pub fn sign_query(secret: &str, query: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// `k=v&...` with values url-encoded, in the given order.
pub fn build_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ---- Market stream models ----

/// Futures `<symbol>@ticker` payload (only the fields we read).
#[derive(Debug, Deserialize)]
pub struct TickerEvent {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub last_price: String,
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
}

pub fn parse_ticker(txt: &str) -> Option<PriceTick> {
    let ev: TickerEvent = serde_json::from_str(txt).ok()?;
    let price = Decimal::from_str(&ev.last_price).ok()?;
    if price <= Decimal::ZERO {
        return None;
    }
    Some(PriceTick {
        symbol: ev.symbol.to_ascii_uppercase(),
        price,
        ts_ms: ev.event_time.unwrap_or_else(now_ms),
    })
}

// ---- REST models ----

/// Error body returned by the REST API, e.g. `{"code":-2011,"msg":"Unknown order sent."}`.
#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

/// Successful order / cancel response (subset).
#[derive(Debug, Deserialize)]
pub struct OrderResponse {
    #[serde(rename = "orderId")]
    pub order_id: i64,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "clientOrderId", default)]
    pub client_order_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signature_matches_documented_example() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn query_skips_empty_values_and_encodes() {
        let q = build_query(&[
            ("symbol", "BTCUSDT".into()),
            ("origClientOrderId", "".into()),
            ("newClientOrderId", "c 1_CLOSE".into()),
        ]);
        assert_eq!(q, "symbol=BTCUSDT&newClientOrderId=c%201_CLOSE");
    }

    #[test]
    fn ticker_payload_parses_last_price() {
        let txt = r#"{"e":"24hrTicker","E":1672515782136,"s":"BTCUSDT","p":"0.0015","c":"16543.10","v":"1"}"#;
        let t = parse_ticker(txt).unwrap();
        assert_eq!(t.symbol, "BTCUSDT");
        assert_eq!(t.price, dec!(16543.10));
        assert_eq!(t.ts_ms, 1672515782136);
    }

    #[test]
    fn ticker_rejects_garbage() {
        assert!(parse_ticker("{\"result\":null,\"id\":1}").is_none());
        assert!(parse_ticker(r#"{"s":"BTCUSDT","c":"abc"}"#).is_none());
        assert!(parse_ticker(r#"{"s":"BTCUSDT","c":"0"}"#).is_none());
    }
}
