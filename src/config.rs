// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : evm_trader_rust — portfolio/order execution engine with on-chain
          limit-order submission for an automated trading agent
Module  : config.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Validates buy/sell orders against lot-size, cash and T+1 rules,
          mutates an append-only JSONL position ledger or submits the trade
          as a memo-tagged ERC-20 transfer (limit order) on an EVM chain,
          with cached gas pricing, EIP-1559/legacy fee selection and local
          signing. Exposes Prometheus metrics.
=============================================================================
*/
use dotenvy::dotenv;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use zeroize::Zeroizing;

use crate::evm::Network;

/// Which backend an accepted order mutates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TradeMode {
    /// Append to the per-agent position.jsonl ledger.
    Ledger,
    /// Submit a memo-tagged limit order on-chain.
    Blockchain,
}

impl TradeMode {
    // USE_BLOCKCHAIN_POSITION=true|1|yes -> Blockchain (default true)
    pub fn from_env(key: &str) -> TradeMode {
        match env::var(key).unwrap_or_else(|_| "true".to_string()).to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => TradeMode::Blockchain,
            _ => TradeMode::Ledger,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeMode::Ledger => "ledger",
            TradeMode::Blockchain => "blockchain",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    /// Agent identity (model signature); selects the ledger directory.
    /// Missing signature is a configuration fault, surfaced by the engine.
    pub signature: Option<String>,
    /// Current trading date, YYYY-MM-DD.
    pub today_date: String,
    pub trade_mode: TradeMode,
    /// Base directory for per-agent ledgers.
    pub ledger_base: PathBuf,
    /// Cash balance of a fresh (empty-ledger) position.
    pub init_cash: f64,
    pub metrics_port: u16,
}

/// On-chain trading parameters. Private key is zeroized on drop and excluded
/// from Debug output.
#[derive(Clone)]
pub struct ChainArgs {
    pub network: Network,
    pub wallet_address: String,
    pub private_key: Zeroizing<String>,
    /// Settlement custodian that receives every memo-tagged transfer.
    pub trading_address: String,
    /// Quote-currency (USDC) contract on the configured network.
    pub usdc_address: String,
    /// Tokenized-asset contracts, symbol -> address.
    pub stock_tokens: HashMap<String, String>,
    pub customer_id: String,
    /// RPC API key for the configured network.
    pub api_key: String,
}

impl std::fmt::Debug for ChainArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainArgs")
            .field("network", &self.network)
            .field("wallet_address", &self.wallet_address)
            .field("trading_address", &self.trading_address)
            .field("usdc_address", &self.usdc_address)
            .field("stock_tokens", &self.stock_tokens.len())
            .field("customer_id", &self.customer_id)
            .finish()
    }
}

fn parse_network(s: &str) -> Network {
    match s.to_ascii_lowercase().as_str() {
        "ethereum" | "eth" => Network::Ethereum,
        "base" => Network::Base,
        "bnb" | "bsc" => Network::Bnb,
        _ => Network::Arbitrum,
    }
}

/// STOCK_TOKENS=AAPL=0xabc...,MSFT=0xdef...
fn parse_stock_tokens(val: &str) -> HashMap<String, String> {
    val.split(',')
        .filter_map(|pair| {
            let mut it = pair.trim().splitn(2, '=');
            match (it.next(), it.next()) {
                (Some(sym), Some(addr)) if !sym.is_empty() && !addr.is_empty() => {
                    Some((sym.to_ascii_uppercase(), addr.trim().to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

pub fn load() -> (Args, Option<ChainArgs>) {
    // Pastikan .env dibaca
    let _ = dotenv();

    let signature = env::var("SIGNATURE").ok().filter(|s| !s.is_empty());
    let today_date = env::var("TODAY_DATE")
        .unwrap_or_else(|_| chrono::Local::now().format("%Y-%m-%d").to_string());

    let trade_mode = TradeMode::from_env("USE_BLOCKCHAIN_POSITION");

    // Ledger lives at <base>/<signature>/position/position.jsonl
    let ledger_base = env::var("LOG_PATH")
        .unwrap_or_else(|_| "./data/agent_data".to_string())
        .into();

    let init_cash = env::var("INIT_CASH").ok().and_then(|s| s.parse().ok()).unwrap_or(10_000.0);
    let metrics_port = env::var("METRICS_PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(9898);

    let args = Args { signature, today_date, trade_mode, ledger_base, init_cash, metrics_port };

    // Chain config is optional: only required when trade_mode is Blockchain.
    let network = parse_network(&env::var("CHAIN_NETWORK").unwrap_or_default());
    let chain = match (
        env::var("ARB_WALLET_ADDRESS").ok(),
        env::var("ARB_PRIVATE_KEY").ok(),
        env::var("TRADING_ADDRESS").ok(),
    ) {
        (Some(wallet_address), Some(pk), Some(trading_address)) => Some(ChainArgs {
            network,
            wallet_address,
            private_key: Zeroizing::new(pk),
            trading_address,
            usdc_address: env::var("USDC_ADDRESS")
                .unwrap_or_else(|_| network.usdc_address().to_string()),
            stock_tokens: env::var("STOCK_TOKENS")
                .map(|v| parse_stock_tokens(&v))
                .unwrap_or_default(),
            customer_id: env::var("CUSTOMER_ID").unwrap_or_else(|_| "SVIM".to_string()),
            api_key: env::var(network.api_key_env()).unwrap_or_default(),
        }),
        _ => None,
    };

    (args, chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_token_parsing() {
        let m = parse_stock_tokens("AAPL=0xaaa, msft=0xbbb ,,bad");
        assert_eq!(m.get("AAPL").map(String::as_str), Some("0xaaa"));
        assert_eq!(m.get("MSFT").map(String::as_str), Some("0xbbb"));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn network_parsing_defaults_to_arbitrum() {
        assert_eq!(parse_network("ethereum"), Network::Ethereum);
        assert_eq!(parse_network("bsc"), Network::Bnb);
        assert_eq!(parse_network(""), Network::Arbitrum);
        assert_eq!(parse_network("unknown"), Network::Arbitrum);
    }
}
