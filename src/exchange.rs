// ===============================
// src/exchange.rs (hedge venue REST client)
// ===============================
//
// Binance USD-M futures, signed requests:
//   DELETE /fapi/v1/order  -> cancel a TP / SL order
//   POST   /fapi/v1/order  -> MARKET order closing the hedge position
// A body with a negative `code` is a failure even on HTTP 200.
//
// Requests are signed with the hedge sub-account named on the contract,
// falling back to the default key pair.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::binance::{build_query, sign_query, ApiError, OrderResponse};
use crate::config::VenueCredential;
use crate::domain::{now_ms, Contract, Side};

const ORDER_PATH: &str = "/fapi/v1/order";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HedgeLeg {
    TakeProfit,
    Stop,
    Position,
}

impl HedgeLeg {
    pub fn as_str(&self) -> &'static str {
        match self {
            HedgeLeg::TakeProfit => "take_profit",
            HedgeLeg::Stop => "stop",
            HedgeLeg::Position => "position",
        }
    }
}

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("venue request timed out")]
    Timeout,
    #[error("venue transport error: {0}")]
    Transport(String),
    #[error("venue rejected request: code {code} {msg}")]
    Api { code: i64, msg: String },
    #[error("venue HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("no credentials for hedge account {0:?}")]
    NoCredentials(Option<u64>),
}

impl From<reqwest::Error> for VenueError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            VenueError::Timeout
        } else {
            VenueError::Transport(e.to_string())
        }
    }
}

/// Reduce-side MARKET order that flattens a contract's hedge position.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseOrder {
    pub symbol: String,
    pub side: &'static str,
    pub position_side: &'static str,
    pub quantity: Decimal,
    pub client_order_id: String,
}

impl CloseOrder {
    pub fn for_contract(contract: &Contract, quantity: Decimal) -> Self {
        // Bull contracts are hedged LONG, Bear contracts SHORT
        let (side, position_side) = match contract.side {
            Side::Bull => ("SELL", "LONG"),
            Side::Bear => ("BUY", "SHORT"),
        };
        Self {
            symbol: contract.symbol(),
            side,
            position_side,
            quantity,
            client_order_id: format!("{}_CLOSE", contract.id),
        }
    }
}

#[async_trait]
pub trait HedgeVenue: Send + Sync {
    async fn cancel_order(&self, symbol: &str, order_id: i64, account: Option<u64>) -> Result<OrderResponse, VenueError>;

    async fn close_position(&self, order: &CloseOrder, account: Option<u64>) -> Result<OrderResponse, VenueError>;
}

// ---- Binance futures ----

pub struct BinanceFutures {
    http: reqwest::Client,
    rest_base: String,
    recv_window: u64,
    default_credential: Option<VenueCredential>,
    accounts: HashMap<u64, VenueCredential>,
}

impl BinanceFutures {
    pub fn new(
        rest_base: &str,
        recv_window: u64,
        timeout: Duration,
        default_credential: Option<VenueCredential>,
        accounts: Vec<VenueCredential>,
    ) -> Result<Self, VenueError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            rest_base: rest_base.trim_end_matches('/').to_string(),
            recv_window,
            default_credential,
            accounts: accounts.into_iter().map(|c| (c.id, c)).collect(),
        })
    }

    fn credential(&self, account: Option<u64>) -> Result<&VenueCredential, VenueError> {
        account
            .and_then(|id| self.accounts.get(&id))
            .or(self.default_credential.as_ref())
            .ok_or(VenueError::NoCredentials(account))
    }

    async fn signed(
        &self,
        method: reqwest::Method,
        mut params: Vec<(&str, String)>,
        account: Option<u64>,
    ) -> Result<OrderResponse, VenueError> {
        let cred = self.credential(account)?;
        params.push(("recvWindow", self.recv_window.to_string()));
        params.push(("timestamp", now_ms().to_string()));
        let query = build_query(&params);
        let sig = sign_query(&cred.api_secret, &query);
        let url = format!("{}{}?{}&signature={}", self.rest_base, ORDER_PATH, query, sig);

        debug!(%method, account = cred.id, %query, "binance request");
        let rsp = self.http.request(method, url).header("X-MBX-APIKEY", &cred.api_key).send().await?;
        let status = rsp.status();
        let body = rsp.text().await?;
        parse_order_response(status.as_u16(), &body)
    }
}

fn parse_order_response(status: u16, body: &str) -> Result<OrderResponse, VenueError> {
    if let Ok(err) = serde_json::from_str::<ApiError>(body) {
        if err.code < 0 {
            return Err(VenueError::Api { code: err.code, msg: err.msg });
        }
    }
    if !(200..300).contains(&status) {
        return Err(VenueError::Http { status, body: body.to_string() });
    }
    serde_json::from_str::<OrderResponse>(body)
        .map_err(|e| VenueError::Transport(format!("unexpected order response: {e}")))
}

#[async_trait]
impl HedgeVenue for BinanceFutures {
    async fn cancel_order(&self, symbol: &str, order_id: i64, account: Option<u64>) -> Result<OrderResponse, VenueError> {
        let params = vec![("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        self.signed(reqwest::Method::DELETE, params, account).await
    }

    async fn close_position(&self, order: &CloseOrder, account: Option<u64>) -> Result<OrderResponse, VenueError> {
        let params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.to_string()),
            ("positionSide", order.position_side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", order.quantity.normalize().to_string()),
            ("newClientOrderId", order.client_order_id.clone()),
        ];
        self.signed(reqwest::Method::POST, params, account).await
    }
}

// ---- Mock venue ----

#[derive(Debug, Default)]
struct MockBook {
    calls: Vec<String>,
    // order id -> remaining injected timeouts
    failing_orders: HashMap<i64, u32>,
    failing_closes: u32,
    next_id: i64,
}

fn take_failure(left: &mut u32) -> bool {
    if *left == 0 {
        return false;
    }
    *left -= 1;
    true
}

/// Accepts every request unless told to fail it, and remembers each call.
#[derive(Debug, Default)]
pub struct MockVenue {
    book: Mutex<MockBook>,
}

impl MockVenue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next `times` cancels of `order_id` time out.
    #[cfg(test)]
    pub async fn fail_cancel(&self, order_id: i64, times: u32) {
        self.book.lock().await.failing_orders.insert(order_id, times);
    }

    #[cfg(test)]
    pub async fn fail_close(&self, times: u32) {
        self.book.lock().await.failing_closes = times;
    }

    #[cfg(test)]
    pub async fn calls(&self) -> Vec<String> {
        self.book.lock().await.calls.clone()
    }
}

#[async_trait]
impl HedgeVenue for MockVenue {
    async fn cancel_order(&self, symbol: &str, order_id: i64, _account: Option<u64>) -> Result<OrderResponse, VenueError> {
        let mut book = self.book.lock().await;
        book.calls.push(format!("cancel {symbol} {order_id}"));
        if book.failing_orders.get_mut(&order_id).map_or(false, take_failure) {
            return Err(VenueError::Timeout);
        }
        info!(%symbol, order_id, "mock venue: order canceled");
        Ok(OrderResponse { order_id, status: "CANCELED".into(), client_order_id: String::new() })
    }

    async fn close_position(&self, order: &CloseOrder, _account: Option<u64>) -> Result<OrderResponse, VenueError> {
        let mut book = self.book.lock().await;
        book.calls.push(format!("close {} {} {}", order.symbol, order.side, order.client_order_id));
        if take_failure(&mut book.failing_closes) {
            return Err(VenueError::Timeout);
        }
        book.next_id += 1;
        info!(symbol = %order.symbol, qty = %order.quantity, "mock venue: position closed");
        Ok(OrderResponse { order_id: book.next_id, status: "FILLED".into(), client_order_id: order.client_order_id.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fixtures::{bear_contract, bull_contract};
    use rust_decimal_macros::dec;

    #[test]
    fn close_order_direction_follows_side() {
        let bull = CloseOrder::for_contract(&bull_contract("c1"), dec!(0.5));
        assert_eq!((bull.side, bull.position_side), ("SELL", "LONG"));
        assert_eq!(bull.client_order_id, "c1_CLOSE");
        let bear = CloseOrder::for_contract(&bear_contract("c2"), dec!(0.5));
        assert_eq!((bear.side, bear.position_side), ("BUY", "SHORT"));
    }

    #[test]
    fn negative_code_is_an_error_even_on_200() {
        let err = parse_order_response(200, r#"{"code":-2011,"msg":"Unknown order sent."}"#).unwrap_err();
        assert!(matches!(err, VenueError::Api { code: -2011, .. }));
    }

    #[test]
    fn order_body_parses() {
        let ok = parse_order_response(200, r#"{"orderId":42,"status":"CANCELED","clientOrderId":"x"}"#).unwrap();
        assert_eq!(ok.order_id, 42);
        assert!(matches!(parse_order_response(502, "bad gateway"), Err(VenueError::Http { status: 502, .. })));
    }

    #[test]
    fn credential_prefers_sub_account() {
        let cred = |id: u64| VenueCredential { id, api_key: format!("k{id}"), api_secret: format!("s{id}") };
        let venue = BinanceFutures::new("https://example", 5000, Duration::from_secs(1), Some(cred(0)), vec![cred(7)]).unwrap();
        assert_eq!(venue.credential(Some(7)).unwrap().api_key, "k7");
        assert_eq!(venue.credential(Some(9)).unwrap().api_key, "k0");
        assert_eq!(venue.credential(None).unwrap().api_key, "k0");

        let bare = BinanceFutures::new("https://example", 5000, Duration::from_secs(1), None, vec![]).unwrap();
        assert!(matches!(bare.credential(Some(3)), Err(VenueError::NoCredentials(Some(3)))));
    }
}
