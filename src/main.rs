// ===============================
// src/main.rs
// ===============================
/*
 # order via ENV, ledger mode:
 USE_BLOCKCHAIN_POSITION=false SIGNATURE=agent-1 PRICE_FILE=./prices.json \
   ACTION=buy SYMBOL=AAPL AMOUNT=10 cargo run --release

 # metrics:
 curl -s localhost:9898/metrics | egrep '^(orders_|chain_tx|gas_)'
*/
/*
=============================================================================
Project : evm_trader_rust — portfolio/order execution engine with on-chain
          limit-order submission for an automated trading agent
Module  : main.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Validates buy/sell orders against lot-size, cash and T+1 rules,
          mutates an append-only JSONL position ledger or submits the trade
          as a memo-tagged ERC-20 transfer (limit order) on an EVM chain,
          with cached gas pricing, EIP-1559/legacy fee selection and local
          signing. Exposes Prometheus metrics.
=============================================================================
*/
mod alchemy;
mod config;
mod domain;
mod engine;
mod evm;
mod ledger;
mod metrics;
mod positions;
mod pricing;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use crate::config::TradeMode;
use crate::domain::Side;
use crate::engine::{ChainTrade, Dispatch, OrderEngine};
use crate::evm::EvmClient;
use crate::ledger::Ledger;
use crate::positions::PositionStore;
use crate::pricing::FilePriceSource;

const DEFAULT_EXPIRY_DAYS: i64 = 2;

/// One order request read from the environment.
struct OrderRequest {
    side: Side,
    symbol: String,
    amount: i64,
    expiry_days: i64,
}

fn order_from_env() -> Result<OrderRequest, String> {
    let side = match env::var("ACTION").unwrap_or_default().to_ascii_lowercase().as_str() {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        other => return Err(format!("ACTION must be buy or sell (got {other:?})")),
    };
    let symbol = env::var("SYMBOL").map_err(|_| "SYMBOL is not set".to_string())?;
    let amount = env::var("AMOUNT")
        .map_err(|_| "AMOUNT is not set".to_string())?
        .parse::<i64>()
        .map_err(|e| format!("AMOUNT must be an integer: {e}"))?;
    if amount <= 0 {
        return Err(format!("AMOUNT must be positive (got {amount})"));
    }
    let expiry_days = env::var("EXPIRY_DAYS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_EXPIRY_DAYS);
    Ok(OrderRequest { side, symbol, amount, expiry_days })
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // ---- Load config ----
    let (args, chain_cfg) = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    // ---- Human-friendly startup info + export config to metrics ----
    info!(
        mode = args.trade_mode.as_str(),
        date = %args.today_date,
        ledger_base = %args.ledger_base.display(),
        "startup config"
    );
    metrics::CONFIG_TRADE_MODE.with_label_values(&[args.trade_mode.as_str()]).set(1);

    // ---- Price source ----
    let price_path: PathBuf =
        env::var("PRICE_FILE").unwrap_or_else(|_| "./prices.json".to_string()).into();
    let prices = Arc::new(FilePriceSource::load(&price_path)?);

    // ---- Backend wiring per trade mode ----
    let (store, dispatch) = match args.trade_mode {
        TradeMode::Ledger => {
            let ledger = Ledger::new(args.ledger_base.clone());
            (
                PositionStore::Ledger { ledger: ledger.clone(), init_cash: args.init_cash },
                Dispatch::Ledger(ledger),
            )
        }
        TradeMode::Blockchain => {
            let cfg = chain_cfg.ok_or(
                "blockchain mode requires ARB_WALLET_ADDRESS, ARB_PRIVATE_KEY and TRADING_ADDRESS",
            )?;
            metrics::CONFIG_NETWORK.with_label_values(&[cfg.network.name()]).set(1);

            let client = Arc::new(EvmClient::new(cfg.network, &cfg.api_key)?);
            let balances = alchemy::AlchemyBalances::new(cfg.network, cfg.api_key.clone())?;
            (
                PositionStore::Chain {
                    provider: Arc::new(balances),
                    wallet_address: cfg.wallet_address.clone(),
                },
                Dispatch::Chain(ChainTrade {
                    client,
                    wallet_address: cfg.wallet_address,
                    private_key: cfg.private_key,
                    trading_address: cfg.trading_address,
                    usdc_address: cfg.usdc_address,
                    stock_tokens: cfg.stock_tokens,
                    customer_id: cfg.customer_id,
                }),
            )
        }
    };

    let engine = OrderEngine::new(args.signature, args.today_date, store, prices, dispatch)?;

    // ---- Execute the requested order ----
    let req = order_from_env()?;
    info!(
        action = req.side.as_str(),
        symbol = %req.symbol,
        amount = req.amount,
        "executing order"
    );
    let outcome = match req.side {
        Side::Buy => engine.buy(&req.symbol, req.amount, req.expiry_days).await?,
        Side::Sell => engine.sell(&req.symbol, req.amount, req.expiry_days).await?,
    };

    println!("{}", serde_json::to_string_pretty(&outcome.to_json())?);
    info!(traded = engine::trade_occurred(), "done");
    Ok(())
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt().with_env_filter("info").init();

    if let Err(e) = run().await {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}
