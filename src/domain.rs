// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved position key holding the cash balance.
pub const CASH_KEY: &str = "CASH";

/// Holdings for one agent identity: symbol -> quantity, plus "CASH" -> balance.
pub type Position = HashMap<String, f64>;

pub fn initial_position(init_cash: f64) -> Position {
    let mut p = Position::new();
    p.insert(CASH_KEY.to_string(), init_cash);
    p
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Market inferred from the symbol suffix. CN A-shares carry lot-size and
/// T+1 restrictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Market {
    Us,
    Cn,
}

impl Market {
    pub fn infer(symbol: &str) -> Market {
        if symbol.ends_with(".SH") || symbol.ends_with(".SZ") {
            Market::Cn
        } else {
            Market::Us
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeAction {
    pub action: Side,
    pub symbol: String,
    pub amount: i64,
}

/// One immutable ledger line. `id` is strictly the previous max id plus one;
/// `positions` is the full post-trade snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub date: String,
    pub id: i64,
    pub this_action: TradeAction,
    pub positions: Position,
}

/// Limit-order instruction embedded as trailing bytes in a token transfer.
/// Consumed by an off-chain settlement watcher; NOT a protocol primitive.
/// `request`/`offer` are decimal-string amounts in each token's smallest unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderMemo {
    pub did_id: String,
    pub request: String,
    pub offer: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub token_address: String,
    pub customer_id: String,
    pub expiry_days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    LotSize,
    SymbolNotFound,
    InsufficientFunds,
    NoPosition,
    InsufficientShares,
    T1Violation,
    ChainSubmissionFailed,
}

impl RejectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectKind::LotSize => "lot_size",
            RejectKind::SymbolNotFound => "symbol_not_found",
            RejectKind::InsufficientFunds => "insufficient_funds",
            RejectKind::NoPosition => "no_position",
            RejectKind::InsufficientShares => "insufficient_shares",
            RejectKind::T1Violation => "t1_violation",
            RejectKind::ChainSubmissionFailed => "chain_submission_failed",
        }
    }
}

/// Structured rejection: serialized as `{"error": ..., ...context}` so that
/// callers distinguish the two result shapes by the presence of `error`.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRejection {
    #[serde(skip)]
    pub kind: RejectKind,
    pub error: String,
    #[serde(flatten)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl OrderRejection {
    pub fn new(kind: RejectKind, error: String) -> Self {
        Self { kind, error, context: serde_json::Map::new() }
    }

    pub fn with(mut self, key: &str, value: serde_json::Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

/// Terminal state of one order request. `Accepted` carries the full mutated
/// position; `Rejected` carries the structured error and implies no side
/// effect beyond the read.
#[derive(Debug, Clone)]
pub enum OrderOutcome {
    Accepted(Position),
    Rejected(OrderRejection),
}

impl OrderOutcome {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            OrderOutcome::Accepted(p) => serde_json::to_value(p).unwrap_or_default(),
            OrderOutcome::Rejected(r) => serde_json::to_value(r).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_inference_from_suffix() {
        assert_eq!(Market::infer("600519.SH"), Market::Cn);
        assert_eq!(Market::infer("000001.SZ"), Market::Cn);
        assert_eq!(Market::infer("AAPL"), Market::Us);
        assert_eq!(Market::infer("BRK.B"), Market::Us);
    }

    #[test]
    fn rejection_serializes_with_error_and_context() {
        let r = OrderRejection::new(RejectKind::SymbolNotFound, "Symbol X not found!".into())
            .with("symbol", serde_json::json!("X"))
            .with("date", serde_json::json!("2025-11-11"));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["error"], "Symbol X not found!");
        assert_eq!(v["symbol"], "X");
        assert_eq!(v["date"], "2025-11-11");
    }

    #[test]
    fn action_record_round_trips_side_lowercase() {
        let rec = ActionRecord {
            date: "2025-11-11".into(),
            id: 3,
            this_action: TradeAction { action: Side::Buy, symbol: "AAPL".into(), amount: 10 },
            positions: initial_position(100.0),
        };
        let line = serde_json::to_string(&rec).unwrap();
        assert!(line.contains("\"action\":\"buy\""));
        let back: ActionRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, 3);
        assert_eq!(back.this_action.amount, 10);
    }
}
