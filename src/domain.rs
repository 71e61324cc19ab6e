// ===============================
// src/domain.rs
// ===============================
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Unix epoch milliseconds.
pub type Millis = i64;

pub fn now_ms() -> Millis {
    Utc::now().timestamp_millis()
}

/// Money and prices are carried at 8 fractional digits.
pub const MONEY_DP: u32 = 8;

/// Half-up rounding to MONEY_DP, the convention the ledger books with.
pub fn round_money(v: Decimal) -> Decimal {
    v.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Bull,
    Bear,
}

impl Side {
    /// Side is fixed at creation: claim above open is a Bull contract.
    #[cfg(test)]
    pub fn from_prices(open: Decimal, claim: Decimal) -> Side {
        if claim > open { Side::Bull } else { Side::Bear }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Bull => "bull",
            Side::Bear => "bear",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractState {
    Available,
    Claimed,
    Liquidated,
    Canceled,
    Invalid,
    Expired,
}

impl ContractState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ContractState::Available)
    }
}

/// Reference to the offsetting position held at the hedge venue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HedgeRef {
    /// Venue sub-account the orders were placed with.
    #[serde(default)]
    pub account_id: Option<u64>,
    #[serde(default)]
    pub stop_order_id: Option<i64>,
    #[serde(default)]
    pub take_profit_order_id: Option<i64>,
    #[serde(default)]
    pub position_order_id: Option<i64>,
    #[serde(default)]
    pub filled_qty: Option<Decimal>,
}

impl HedgeRef {
    /// Filled hedge quantity, if a position was actually opened.
    pub fn position_qty(&self) -> Option<Decimal> {
        self.filled_qty.filter(|q| !q.is_zero())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub owner: String,
    /// Covered asset, e.g. "BTC".
    pub asset: String,
    /// Quote unit the margin and payout are denominated in, e.g. "USDT".
    pub unit: String,
    pub side: Side,
    pub open_price: Decimal,
    pub claim_price: Decimal,
    pub stop_price: Decimal,
    pub margin: Decimal,
    pub claim_qty: Decimal,
    pub created_at_ms: Millis,
    pub expires_at_ms: Millis,
    pub state: ContractState,
    #[serde(default)]
    pub close_price: Option<Decimal>,
    #[serde(default)]
    pub pnl_user: Decimal,
    #[serde(default)]
    pub pnl_venue: Decimal,
    #[serde(default)]
    pub pnl_net: Decimal,
    #[serde(default)]
    pub payback: bool,
    #[serde(default)]
    pub settled_at_ms: Option<Millis>,
    #[serde(default)]
    pub hedge: Option<HedgeRef>,
    /// Set when a settlement was partially applied and could not be undone.
    #[serde(default)]
    pub reconciliation: Option<String>,
}

impl Contract {
    pub fn symbol(&self) -> String {
        format!("{}{}", self.asset, self.unit)
    }

    pub fn is_matchable(&self) -> bool {
        self.state == ContractState::Available && self.reconciliation.is_none()
    }
}

/// Last-trade tick from a price stream. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: Decimal,
    pub ts_ms: Millis,
}

/// High/low of one symbol over one scan cycle.
///
/// Samples are kept so a window can be cut down to a contract's validity range.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceWindow {
    pub symbol: String,
    pub high: Decimal,
    pub low: Decimal,
    pub first_ts_ms: Millis,
    pub last_ts_ms: Millis,
    samples: Vec<(Millis, Decimal)>,
}

impl PriceWindow {
    pub fn open(tick: &PriceTick) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            high: tick.price,
            low: tick.price,
            first_ts_ms: tick.ts_ms,
            last_ts_ms: tick.ts_ms,
            samples: vec![(tick.ts_ms, tick.price)],
        }
    }

    pub fn observe(&mut self, tick: &PriceTick) {
        if tick.price > self.high {
            self.high = tick.price;
        }
        if tick.price < self.low {
            self.low = tick.price;
        }
        self.first_ts_ms = self.first_ts_ms.min(tick.ts_ms);
        self.last_ts_ms = self.last_ts_ms.max(tick.ts_ms);
        self.samples.push((tick.ts_ms, tick.price));
    }

    #[cfg(test)]
    pub fn samples(&self) -> &[(Millis, Decimal)] {
        &self.samples
    }

    /// Window limited to prices observed within `[from, to]`, or `None` if
    /// nothing falls inside.
    pub fn restrict(&self, from: Millis, to: Millis) -> Option<PriceWindow> {
        if from <= self.first_ts_ms && self.last_ts_ms <= to {
            return Some(self.clone());
        }
        let mut inside = self.samples.iter().filter(|(ts, _)| *ts >= from && *ts <= to);
        let &(ts, price) = inside.next()?;
        let mut out = PriceWindow::open(&PriceTick { symbol: self.symbol.clone(), price, ts_ms: ts });
        for &(ts, price) in inside {
            out.observe(&PriceTick { symbol: self.symbol.clone(), price, ts_ms: ts });
        }
        Some(out)
    }

    /// Cross window `base / quote` (both legs against the same third asset).
    /// Samples are not carried over, restrict the legs before dividing.
    pub fn cross(symbol: &str, base: &PriceWindow, quote: &PriceWindow) -> Option<PriceWindow> {
        let high = round_money(base.high.checked_div(quote.high)?);
        let low = round_money(base.low.checked_div(quote.low)?);
        Some(PriceWindow {
            symbol: symbol.to_string(),
            high: high.max(low),
            low: low.min(high),
            first_ts_ms: base.first_ts_ms.min(quote.first_ts_ms),
            last_ts_ms: base.last_ts_ms.max(quote.last_ts_ms),
            samples: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Claim,
    Stop,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Claim => "claim",
            TriggerKind::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub close_price: Decimal,
}

/// One unit of settlement work, created by the matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementJob {
    pub contract_id: String,
    pub contract: Contract,
    pub trigger: Trigger,
    pub triggered_at_ms: Millis,
}

impl SettlementJob {
    pub fn new(contract: Contract, trigger: Trigger, triggered_at_ms: Millis) -> Self {
        Self { contract_id: contract.id.clone(), contract, trigger, triggered_at_ms }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Match { contract_id: String, symbol: String, trigger: Trigger, ts_ms: Millis },
    Settled {
        contract_id: String,
        state: ContractState,
        close_price: Decimal,
        pnl_user: Decimal,
        pnl_venue: Decimal,
        pnl_net: Decimal,
        ts_ms: Millis,
    },
    Compensated { contract_id: String, reason: String, ts_ms: Millis },
    Inconsistent { contract_id: String, reason: String, ts_ms: Millis },
    StreamRestart { symbol: String, idle_ms: Millis, ts_ms: Millis },
}

#[cfg(test)]
pub mod fixtures {
    use super::*;
    use rust_decimal_macros::dec;

    /// Bull BTCUSDT contract: open 100, claim 110, stop 95, margin 10, payout 50.
    pub fn bull_contract(id: &str) -> Contract {
        Contract {
            id: id.to_string(),
            owner: "user-1".to_string(),
            asset: "BTC".to_string(),
            unit: "USDT".to_string(),
            side: Side::Bull,
            open_price: dec!(100),
            claim_price: dec!(110),
            stop_price: dec!(95),
            margin: dec!(10),
            claim_qty: dec!(50),
            created_at_ms: 0,
            expires_at_ms: i64::MAX,
            state: ContractState::Available,
            close_price: None,
            pnl_user: Decimal::ZERO,
            pnl_venue: Decimal::ZERO,
            pnl_net: Decimal::ZERO,
            payback: false,
            settled_at_ms: None,
            hedge: None,
            reconciliation: None,
        }
    }

    /// Bear mirror: open 100, claim 90, stop 105.
    pub fn bear_contract(id: &str) -> Contract {
        Contract {
            side: Side::Bear,
            claim_price: dec!(90),
            stop_price: dec!(105),
            ..bull_contract(id)
        }
    }

    pub fn tick(symbol: &str, price: Decimal, ts_ms: Millis) -> PriceTick {
        PriceTick { symbol: symbol.to_string(), price, ts_ms }
    }

    pub fn window(symbol: &str, points: &[(Millis, Decimal)]) -> PriceWindow {
        let mut w = PriceWindow::open(&tick(symbol, points[0].1, points[0].0));
        for &(ts, px) in &points[1..] {
            w.observe(&tick(symbol, px, ts));
        }
        w
    }
}
