// ===============================
// src/engine.rs (order execution engine)
// ===============================
//
// One request walks Validate -> Price -> Compute -> Dispatch -> Record.
// Terminal states: Accepted (mutated position returned) or Rejected
// (structured error, no mutation, no write). Validation failures are data;
// config/store/network faults are Err.
//
// Ledger-mode orders hold the per-signature lock across the whole
// read-validate-compute-append sequence so concurrent orders serialize and
// ids stay gap-free. Chain-mode orders do not take the ledger lock; the
// chain's own nonce ordering is the only sequencing there.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ethers::types::{H256, U256};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::domain::{
    ActionRecord, Market, OrderMemo, OrderOutcome, OrderRejection, Position, RejectKind, Side,
    TradeAction, CASH_KEY,
};
use crate::evm::{EvmClient, ASSET_DECIMALS, USDC_DECIMALS};
use crate::ledger::{Ledger, LedgerError};
use crate::metrics::{CHAIN_TX, ORDERS_ACCEPTED, ORDERS_REJECTED};
use crate::positions::{PositionStore, StoreError};
use crate::pricing::{PriceSource, SourceError};

// Process-wide "an order occurred" flag; last writer wins.
static IF_TRADE: AtomicBool = AtomicBool::new(false);

pub fn trade_occurred() -> bool {
    IF_TRADE.load(Ordering::Relaxed)
}

#[derive(Debug, Error)]
pub enum EngineError {
    // Misconfiguration, not a bad order: raised, never returned inline.
    #[error("SIGNATURE is not set")]
    SignatureMissing,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("price lookup failed: {0}")]
    Price(#[from] SourceError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Chain-mode dispatch parameters: which client, whose wallet, where trades
/// settle, and the token universe.
pub struct ChainTrade {
    pub client: Arc<EvmClient>,
    pub wallet_address: String,
    pub private_key: Zeroizing<String>,
    pub trading_address: String,
    pub usdc_address: String,
    pub stock_tokens: HashMap<String, String>,
    pub customer_id: String,
}

/// Backend selected once per engine instance (no per-call mode re-reads).
pub enum Dispatch {
    Ledger(Ledger),
    Chain(ChainTrade),
}

/// Smallest-unit amounts for one trade: (quote/USDC units, asset units).
pub fn scaled_amounts(price: f64, amount: i64) -> (u128, u128) {
    let usdc = (price * amount as f64 * 10f64.powi(USDC_DECIMALS as i32)) as u128;
    let asset = (amount as u128) * 10u128.pow(ASSET_DECIMALS);
    (usdc, asset)
}

pub struct OrderEngine {
    signature: String,
    today_date: String,
    store: PositionStore,
    prices: Arc<dyn PriceSource>,
    dispatch: Dispatch,
}

impl OrderEngine {
    pub fn new(
        signature: Option<String>,
        today_date: String,
        store: PositionStore,
        prices: Arc<dyn PriceSource>,
        dispatch: Dispatch,
    ) -> Result<Self, EngineError> {
        let signature = signature.ok_or(EngineError::SignatureMissing)?;
        Ok(Self { signature, today_date, store, prices, dispatch })
    }

    pub async fn buy(
        &self,
        symbol: &str,
        amount: i64,
        expiry_days: i64,
    ) -> Result<OrderOutcome, EngineError> {
        self.execute(Side::Buy, symbol, amount, expiry_days).await
    }

    pub async fn sell(
        &self,
        symbol: &str,
        amount: i64,
        expiry_days: i64,
    ) -> Result<OrderOutcome, EngineError> {
        self.execute(Side::Sell, symbol, amount, expiry_days).await
    }

    fn reject(&self, r: OrderRejection) -> Result<OrderOutcome, EngineError> {
        ORDERS_REJECTED.with_label_values(&[r.kind.as_str()]).inc();
        warn!(reason = r.kind.as_str(), error = %r.error, "order rejected");
        Ok(OrderOutcome::Rejected(r))
    }

    async fn execute(
        &self,
        side: Side,
        symbol: &str,
        amount: i64,
        expiry_days: i64,
    ) -> Result<OrderOutcome, EngineError> {
        let date = self.today_date.clone();
        let market = Market::infer(symbol);

        // CN A-shares trade in lots of 100 (1 lot = 100 shares)
        if market == Market::Cn && amount % 100 != 0 {
            let floor = (amount / 100) * 100;
            let ceil = floor + 100;
            return self.reject(
                OrderRejection::new(
                    RejectKind::LotSize,
                    format!(
                        "Chinese A-shares must be traded in multiples of 100 shares (1 lot = 100 shares). You tried to {} {} shares.",
                        side.as_str(),
                        amount
                    ),
                )
                .with("symbol", json!(symbol))
                .with("amount", json!(amount))
                .with("date", json!(date))
                .with("suggestion", json!(format!("Please use {floor} or {ceil} shares instead."))),
            );
        }

        // Ledger mode serializes read-validate-compute-append per signature.
        let _guard = match &self.dispatch {
            Dispatch::Ledger(ledger) => Some(ledger.lock(&self.signature).await?),
            Dispatch::Chain(_) => None,
        };

        let (current, last_id) = self.store.latest(&date, &self.signature).await?;

        let price = match self.prices.open_price(&date, symbol, market).await? {
            Some(p) => p,
            None => {
                return self.reject(
                    OrderRejection::new(
                        RejectKind::SymbolNotFound,
                        format!("Symbol {symbol} not found! This action will not be allowed."),
                    )
                    .with("symbol", json!(symbol))
                    .with("date", json!(date)),
                );
            }
        };

        let mut new_position: Position = current.clone();
        match side {
            Side::Buy => {
                let required = price * amount as f64;
                let cash_available = current.get(CASH_KEY).copied().unwrap_or(0.0);
                let cash_left = cash_available - required;
                if cash_left < 0.0 {
                    return self.reject(
                        OrderRejection::new(
                            RejectKind::InsufficientFunds,
                            "Insufficient cash! This action will not be allowed.".to_string(),
                        )
                        .with("required_cash", json!(required))
                        .with("cash_available", json!(cash_available))
                        .with("symbol", json!(symbol))
                        .with("date", json!(date)),
                    );
                }
                new_position.insert(CASH_KEY.to_string(), cash_left);
                *new_position.entry(symbol.to_string()).or_insert(0.0) += amount as f64;
            }
            Side::Sell => {
                let held = match current.get(symbol) {
                    Some(h) => *h,
                    None => {
                        return self.reject(
                            OrderRejection::new(
                                RejectKind::NoPosition,
                                format!(
                                    "No position for {symbol}! This action will not be allowed."
                                ),
                            )
                            .with("symbol", json!(symbol))
                            .with("date", json!(date)),
                        );
                    }
                };
                if held < amount as f64 {
                    return self.reject(
                        OrderRejection::new(
                            RejectKind::InsufficientShares,
                            "Insufficient shares! This action will not be allowed.".to_string(),
                        )
                        .with("have", json!(held))
                        .with("want_to_sell", json!(amount))
                        .with("symbol", json!(symbol))
                        .with("date", json!(date)),
                    );
                }
                // T+1: same-day CN buys cannot be resold; re-scan the ledger
                if market == Market::Cn {
                    let bought_today = match &self.dispatch {
                        Dispatch::Ledger(ledger) => {
                            ledger.bought_today(&self.signature, &date, symbol).await?
                        }
                        // No file ledger is authoritative in chain mode
                        Dispatch::Chain(_) => 0,
                    };
                    if bought_today > 0 {
                        let sellable = held - bought_today as f64;
                        if amount as f64 > sellable {
                            return self.reject(
                                OrderRejection::new(
                                    RejectKind::T1Violation,
                                    format!(
                                        "T+1 restriction violated! You bought {bought_today} shares of {symbol} today and cannot sell them until tomorrow."
                                    ),
                                )
                                .with("symbol", json!(symbol))
                                .with("total_position", json!(held))
                                .with("bought_today", json!(bought_today))
                                .with("sellable_today", json!(sellable.max(0.0)))
                                .with("want_to_sell", json!(amount))
                                .with("date", json!(date)),
                            );
                        }
                    }
                }
                *new_position.entry(symbol.to_string()).or_insert(0.0) -= amount as f64;
                let cash = new_position.get(CASH_KEY).copied().unwrap_or(0.0);
                new_position.insert(CASH_KEY.to_string(), cash + price * amount as f64);
            }
        }

        match &self.dispatch {
            Dispatch::Ledger(ledger) => {
                let record = ActionRecord {
                    date: date.clone(),
                    id: last_id + 1,
                    this_action: TradeAction { action: side, symbol: symbol.to_string(), amount },
                    positions: new_position.clone(),
                };
                ledger.append(&self.signature, &record).await?;
                info!(
                    id = record.id,
                    action = side.as_str(),
                    symbol,
                    amount,
                    "action recorded to ledger"
                );
            }
            Dispatch::Chain(chain) => {
                match self.submit_chain_order(chain, side, symbol, amount, price, expiry_days).await
                {
                    Ok(hash) => {
                        info!(tx = ?hash, symbol, "limit order submitted on-chain");
                    }
                    Err(cause) => {
                        // Discard the computed position; nothing was recorded
                        CHAIN_TX
                            .with_label_values(&[chain.client.network().name(), "failed"])
                            .inc();
                        return self.reject(
                            OrderRejection::new(
                                RejectKind::ChainSubmissionFailed,
                                format!("Blockchain transaction failed: {cause}"),
                            )
                            .with("symbol", json!(symbol))
                            .with("date", json!(date)),
                        );
                    }
                }
            }
        }

        let mode = match &self.dispatch {
            Dispatch::Ledger(_) => "ledger",
            Dispatch::Chain(_) => "blockchain",
        };
        ORDERS_ACCEPTED.with_label_values(&[side.as_str(), mode]).inc();
        IF_TRADE.store(true, Ordering::Relaxed);
        Ok(OrderOutcome::Accepted(new_position))
    }

    /// Express the trade as a limit order: buy offers USDC and requests asset
    /// tokens; sell is the reverse. The transferred token is the offered one.
    async fn submit_chain_order(
        &self,
        chain: &ChainTrade,
        side: Side,
        symbol: &str,
        amount: i64,
        price: f64,
        expiry_days: i64,
    ) -> Result<H256, String> {
        let stock_token = chain
            .stock_tokens
            .get(symbol)
            .ok_or_else(|| format!("Stock token address not found for {symbol}"))?;

        let (usdc_units, asset_units) = scaled_amounts(price, amount);
        let memo = OrderMemo {
            did_id: chain.wallet_address.clone(),
            request: match side {
                Side::Buy => asset_units.to_string(),
                Side::Sell => usdc_units.to_string(),
            },
            offer: match side {
                Side::Buy => usdc_units.to_string(),
                Side::Sell => asset_units.to_string(),
            },
            order_type: "LIMIT".to_string(),
            token_address: stock_token.clone(),
            customer_id: chain.customer_id.clone(),
            expiry_days,
        };
        let memo_text = serde_json::to_string(&memo).map_err(|e| e.to_string())?;

        let (source_token, transfer_amount) = match side {
            Side::Buy => (chain.usdc_address.as_str(), U256::from(usdc_units)),
            Side::Sell => (stock_token.as_str(), U256::from(asset_units)),
        };

        info!(
            action = side.as_str(),
            symbol,
            amount,
            price,
            "placing limit order via memo-tagged transfer"
        );

        let hash = chain
            .client
            .send_token_with_memo(
                source_token,
                &chain.trading_address,
                transfer_amount,
                &memo_text,
                &chain.private_key,
            )
            .await
            .map_err(|e| e.to_string())?;

        CHAIN_TX.with_label_values(&[chain.client.network().name(), "submitted"]).inc();
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::initial_position;
    use crate::evm::Network;
    use crate::pricing::BalanceProvider;
    use async_trait::async_trait;

    struct FixedPrices(HashMap<String, f64>);

    impl FixedPrices {
        fn table(pairs: &[(&str, f64)]) -> Arc<Self> {
            Arc::new(Self(pairs.iter().map(|(s, p)| (s.to_string(), *p)).collect()))
        }
    }

    #[async_trait]
    impl PriceSource for FixedPrices {
        async fn open_price(
            &self,
            _date: &str,
            symbol: &str,
            _market: Market,
        ) -> Result<Option<f64>, SourceError> {
            Ok(self.0.get(symbol).copied())
        }
    }

    fn ledger_engine(base: &std::path::Path, init_cash: f64, prices: Arc<FixedPrices>) -> OrderEngine {
        let ledger = Ledger::new(base.to_path_buf());
        OrderEngine::new(
            Some("agent".to_string()),
            "2025-11-11".to_string(),
            PositionStore::Ledger { ledger: ledger.clone(), init_cash },
            prices,
            Dispatch::Ledger(ledger),
        )
        .unwrap()
    }

    fn accepted(outcome: OrderOutcome) -> Position {
        match outcome {
            OrderOutcome::Accepted(p) => p,
            OrderOutcome::Rejected(r) => panic!("unexpected rejection: {}", r.error),
        }
    }

    fn rejected(outcome: OrderOutcome) -> OrderRejection {
        match outcome {
            OrderOutcome::Rejected(r) => r,
            OrderOutcome::Accepted(_) => panic!("expected rejection"),
        }
    }

    #[test]
    fn missing_signature_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(tmp.path().to_path_buf());
        let err = OrderEngine::new(
            None,
            "2025-11-11".into(),
            PositionStore::Ledger { ledger: ledger.clone(), init_cash: 1.0 },
            FixedPrices::table(&[]),
            Dispatch::Ledger(ledger),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::SignatureMissing));
    }

    #[tokio::test]
    async fn buy_then_sell_arithmetic() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ledger_engine(tmp.path(), 10_000.0, FixedPrices::table(&[("AAPL", 150.0)]));

        let pos = accepted(engine.buy("AAPL", 10, 2).await.unwrap());
        assert_eq!(pos.get("AAPL"), Some(&10.0));
        assert_eq!(pos.get(CASH_KEY), Some(&8_500.0));

        let pos = accepted(engine.sell("AAPL", 5, 2).await.unwrap());
        assert_eq!(pos.get("AAPL"), Some(&5.0));
        assert_eq!(pos.get(CASH_KEY), Some(&9_250.0));

        assert!(trade_occurred());
    }

    #[tokio::test]
    async fn lot_size_rejection_suggests_rounded_quantities() {
        let tmp = tempfile::tempdir().unwrap();
        let engine =
            ledger_engine(tmp.path(), 1_000_000.0, FixedPrices::table(&[("600519.SH", 1500.0)]));

        let r = rejected(engine.buy("600519.SH", 150, 2).await.unwrap());
        assert_eq!(r.kind, RejectKind::LotSize);
        assert_eq!(
            r.context["suggestion"],
            json!("Please use 100 or 200 shares instead.")
        );

        // No mutation: ledger stays empty
        let ledger = Ledger::new(tmp.path().to_path_buf());
        assert!(ledger.latest("agent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_symbol_is_rejected_not_raised() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ledger_engine(tmp.path(), 10_000.0, FixedPrices::table(&[]));
        let r = rejected(engine.buy("ZZZZ", 1, 2).await.unwrap());
        assert_eq!(r.kind, RejectKind::SymbolNotFound);
        assert_eq!(r.context["symbol"], json!("ZZZZ"));
    }

    #[tokio::test]
    async fn insufficient_cash_reports_both_amounts() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ledger_engine(tmp.path(), 10_000.0, FixedPrices::table(&[("AAPL", 150.0)]));
        let r = rejected(engine.buy("AAPL", 100, 2).await.unwrap());
        assert_eq!(r.kind, RejectKind::InsufficientFunds);
        assert_eq!(r.context["required_cash"], json!(15_000.0));
        assert_eq!(r.context["cash_available"], json!(10_000.0));
    }

    #[tokio::test]
    async fn sell_validations() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ledger_engine(tmp.path(), 10_000.0, FixedPrices::table(&[("AAPL", 150.0)]));

        let r = rejected(engine.sell("AAPL", 1, 2).await.unwrap());
        assert_eq!(r.kind, RejectKind::NoPosition);

        accepted(engine.buy("AAPL", 10, 2).await.unwrap());
        let r = rejected(engine.sell("AAPL", 11, 2).await.unwrap());
        assert_eq!(r.kind, RejectKind::InsufficientShares);
        assert_eq!(r.context["have"], json!(10.0));
        assert_eq!(r.context["want_to_sell"], json!(11));
    }

    #[tokio::test]
    async fn t1_rule_blocks_same_day_resale() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(tmp.path().to_path_buf());

        // Yesterday's snapshot: 300 shares held, plenty of cash
        let mut pos = initial_position(1_000_000.0);
        pos.insert("600519.SH".to_string(), 300.0);
        ledger
            .append(
                "agent",
                &ActionRecord {
                    date: "2025-11-10".into(),
                    id: 1,
                    this_action: TradeAction {
                        action: Side::Buy,
                        symbol: "600519.SH".into(),
                        amount: 300,
                    },
                    positions: pos,
                },
            )
            .await
            .unwrap();

        let engine =
            ledger_engine(tmp.path(), 1_000_000.0, FixedPrices::table(&[("600519.SH", 100.0)]));

        // Buy 100 more today (id 2), then try to sell 400
        accepted(engine.buy("600519.SH", 100, 2).await.unwrap());
        let r = rejected(engine.sell("600519.SH", 400, 2).await.unwrap());
        assert_eq!(r.kind, RejectKind::T1Violation);
        assert_eq!(r.context["bought_today"], json!(100));
        assert_eq!(r.context["sellable_today"], json!(300.0));
        assert_eq!(r.context["want_to_sell"], json!(400));

        // Selling within the sellable window passes
        let pos = accepted(engine.sell("600519.SH", 300, 2).await.unwrap());
        assert_eq!(pos.get("600519.SH"), Some(&100.0));
    }

    #[tokio::test]
    async fn concurrent_orders_serialize_with_gap_free_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(ledger_engine(
            tmp.path(),
            100_000.0,
            FixedPrices::table(&[("AAPL", 150.0)]),
        ));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let eng = engine.clone();
            handles.push(tokio::spawn(async move {
                accepted(eng.buy("AAPL", 1, 2).await.unwrap());
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let raw = std::fs::read_to_string(
            tmp.path().join("agent/position/position.jsonl"),
        )
        .unwrap();
        let mut ids: Vec<i64> = raw
            .lines()
            .map(|l| serde_json::from_str::<ActionRecord>(l).unwrap().id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=10).collect::<Vec<i64>>());

        let ledger = Ledger::new(tmp.path().to_path_buf());
        let (pos, id) = ledger.latest("agent").await.unwrap().unwrap();
        assert_eq!(id, 10);
        assert_eq!(pos.get("AAPL"), Some(&10.0));
        assert_eq!(pos.get(CASH_KEY), Some(&(100_000.0 - 1_500.0)));
    }

    #[test]
    fn amount_scaling_to_smallest_units() {
        let (usdc, asset) = scaled_amounts(150.0, 10);
        assert_eq!(usdc, 1_500_000_000); // 1500 USDC @ 6 decimals
        assert_eq!(asset, 10 * 10u128.pow(18));
    }

    struct FixedBalances(Position);

    #[async_trait]
    impl BalanceProvider for FixedBalances {
        async fn position_snapshot(&self, _wallet: &str) -> Result<Position, SourceError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn chain_dispatch_failure_rejects_without_mutation() {
        // Missing stock token address fails dispatch before any RPC happens
        let chain = ChainTrade {
            client: Arc::new(EvmClient::new(Network::Arbitrum, "unused").unwrap()),
            wallet_address: "0x1111111111111111111111111111111111111111".into(),
            private_key: Zeroizing::new("00".repeat(32)),
            trading_address: "0x2222222222222222222222222222222222222222".into(),
            usdc_address: Network::Arbitrum.usdc_address().into(),
            stock_tokens: HashMap::new(),
            customer_id: "SVIM".into(),
        };
        let engine = OrderEngine::new(
            Some("agent".into()),
            "2025-11-11".into(),
            PositionStore::Chain {
                provider: Arc::new(FixedBalances(initial_position(10_000.0))),
                wallet_address: "0x1111111111111111111111111111111111111111".into(),
            },
            FixedPrices::table(&[("AAPL", 150.0)]),
            Dispatch::Chain(chain),
        )
        .unwrap();

        let r = rejected(engine.buy("AAPL", 10, 2).await.unwrap());
        assert_eq!(r.kind, RejectKind::ChainSubmissionFailed);
        assert!(r.error.contains("Stock token address not found"));
    }

    #[test]
    fn memo_wire_format() {
        let memo = OrderMemo {
            did_id: "0xwallet".into(),
            request: "10000000000000000000".into(),
            offer: "1500000000".into(),
            order_type: "LIMIT".into(),
            token_address: "0xtoken".into(),
            customer_id: "SVIM".into(),
            expiry_days: 2,
        };
        let v = serde_json::to_value(&memo).unwrap();
        assert_eq!(v["type"], "LIMIT");
        assert_eq!(v["request"], "10000000000000000000");
        assert_eq!(v["offer"], "1500000000");
        assert_eq!(v["expiry_days"], 2);
    }
}
