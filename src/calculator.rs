// ===============================
// src/calculator.rs (settlement PnL)
// ===============================
//
// Pure: no clock, no I/O. Every intermediate is rounded to 8 places so the
// amounts match what the ledger books, digit for digit.
//
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{round_money, Contract, ContractState, Side, TriggerKind};

#[derive(Debug, Error, PartialEq)]
pub enum CalcError {
    #[error("close {close} does not reach the {kind:?} threshold {threshold} of a {side:?} contract")]
    CloseNotBeyondThreshold { kind: TriggerKind, side: Side, threshold: Decimal, close: Decimal },
    #[error("margin must be positive, got {0}")]
    InvalidMargin(Decimal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub state: ContractState,
    pub close_price: Decimal,
    pub pnl_user: Decimal,
    pub pnl_venue: Decimal,
    pub pnl_net: Decimal,
}

/// Whether `price` is at or beyond the contract's `kind` threshold.
pub fn reaches(contract: &Contract, kind: TriggerKind, price: Decimal) -> bool {
    match (contract.side, kind) {
        (Side::Bull, TriggerKind::Claim) => price >= contract.claim_price,
        (Side::Bull, TriggerKind::Stop) => price <= contract.stop_price,
        (Side::Bear, TriggerKind::Claim) => price <= contract.claim_price,
        (Side::Bear, TriggerKind::Stop) => price >= contract.stop_price,
    }
}

fn r(v: Decimal) -> Decimal {
    round_money(v)
}

pub fn compute(contract: &Contract, close: Decimal, kind: TriggerKind) -> Result<Outcome, CalcError> {
    if contract.margin <= Decimal::ZERO {
        return Err(CalcError::InvalidMargin(contract.margin));
    }
    if !reaches(contract, kind, close) {
        let threshold = match kind {
            TriggerKind::Claim => contract.claim_price,
            TriggerKind::Stop => contract.stop_price,
        };
        return Err(CalcError::CloseNotBeyondThreshold { kind, side: contract.side, threshold, close });
    }

    // hedge PnL: filled qty x distance travelled from the open price
    let hedge_move = contract
        .hedge
        .as_ref()
        .and_then(|h| h.position_qty())
        .map(|q| r(q * r((contract.open_price - close).abs())))
        .unwrap_or(Decimal::ZERO);

    let (state, pnl_user, pnl_venue) = match kind {
        TriggerKind::Claim => (ContractState::Claimed, r(contract.claim_qty - contract.margin), hedge_move),
        TriggerKind::Stop => (ContractState::Liquidated, r(-contract.margin), -hedge_move),
    };

    Ok(Outcome {
        state,
        close_price: r(close),
        pnl_user,
        pnl_venue,
        pnl_net: r(pnl_venue - pnl_user),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fixtures::{bear_contract, bull_contract};
    use crate::domain::HedgeRef;
    use rust_decimal_macros::dec;

    fn hedged(mut c: Contract, qty: Decimal) -> Contract {
        c.hedge = Some(HedgeRef { filled_qty: Some(qty), ..Default::default() });
        c
    }

    #[test]
    fn claim_without_hedge() {
        let out = compute(&bull_contract("c"), dec!(111), TriggerKind::Claim).unwrap();
        assert_eq!(out.state, ContractState::Claimed);
        assert_eq!(out.close_price, dec!(111));
        assert_eq!(out.pnl_user, dec!(40)); // claim_qty - margin
        assert_eq!(out.pnl_venue, dec!(0));
        assert_eq!(out.pnl_net, dec!(-40));
    }

    #[test]
    fn claim_with_hedge_position() {
        let c = hedged(bull_contract("c"), dec!(0.5));
        let out = compute(&c, dec!(111), TriggerKind::Claim).unwrap();
        assert_eq!(out.pnl_venue, dec!(5.5));
        assert_eq!(out.pnl_net, dec!(-34.5));
    }

    #[test]
    fn stop_without_hedge() {
        let out = compute(&bull_contract("c"), dec!(94), TriggerKind::Stop).unwrap();
        assert_eq!(out.state, ContractState::Liquidated);
        assert_eq!(out.pnl_user, dec!(-10));
        assert_eq!(out.pnl_venue, dec!(0));
        assert_eq!(out.pnl_net, dec!(10));
    }

    #[test]
    fn stop_with_hedge_position_loses_on_venue() {
        let c = hedged(bull_contract("c"), dec!(0.5));
        let out = compute(&c, dec!(94), TriggerKind::Stop).unwrap();
        assert_eq!(out.pnl_venue, dec!(-3));
        assert_eq!(out.pnl_net, dec!(7));
    }

    #[test]
    fn zero_filled_hedge_counts_as_no_position() {
        let c = hedged(bull_contract("c"), dec!(0));
        let out = compute(&c, dec!(111), TriggerKind::Claim).unwrap();
        assert_eq!(out.pnl_venue, dec!(0));
    }

    #[test]
    fn bear_claim_uses_downward_move() {
        let c = hedged(bear_contract("c"), dec!(2));
        let out = compute(&c, dec!(89), TriggerKind::Claim).unwrap();
        assert_eq!(out.state, ContractState::Claimed);
        assert_eq!(out.pnl_venue, dec!(22));
        assert_eq!(out.pnl_net, dec!(-18));
    }

    #[test]
    fn amounts_are_rounded_to_eight_places() {
        let c = hedged(bull_contract("c"), dec!(0.333333333));
        let out = compute(&c, dec!(94.123456789), TriggerKind::Stop).unwrap();
        assert!(out.pnl_venue.scale() <= 8);
        assert!(out.pnl_net.scale() <= 8);
        assert_eq!(out.close_price, dec!(94.12345679));
        // 0.333333333 * 5.87654321 = 1.95884773... -> 1.95884773
        assert_eq!(out.pnl_venue, dec!(-1.95884773));
    }

    #[test]
    fn compute_is_idempotent() {
        let c = hedged(bull_contract("c"), dec!(1.25));
        let a = compute(&c, dec!(112.5), TriggerKind::Claim).unwrap();
        let b = compute(&c, dec!(112.5), TriggerKind::Claim).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn close_on_wrong_side_is_rejected() {
        let err = compute(&bull_contract("c"), dec!(109), TriggerKind::Claim).unwrap_err();
        assert!(matches!(err, CalcError::CloseNotBeyondThreshold { kind: TriggerKind::Claim, .. }));
        assert!(compute(&bear_contract("c"), dec!(104), TriggerKind::Stop).is_err());
    }

    #[test]
    fn zero_margin_is_rejected() {
        let mut c = bull_contract("c");
        c.margin = dec!(0);
        assert_eq!(compute(&c, dec!(111), TriggerKind::Claim), Err(CalcError::InvalidMargin(dec!(0))));
    }
}
