// ===============================
// src/alchemy.rs (portfolio balance provider)
// ===============================
//
// Edge adapter: Alchemy Portfolio API -> Position. Used by the blockchain
// PositionStore; the core only depends on the BalanceProvider trait.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use crate::domain::{Position, CASH_KEY};
use crate::evm::Network;
use crate::pricing::{BalanceProvider, SourceError};

const PORTFOLIO_API_BASE: &str = "https://api.g.alchemy.com/data/v1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

fn alchemy_network_id(network: Network) -> &'static str {
    match network {
        Network::Ethereum => "eth-mainnet",
        Network::Arbitrum => "arb-mainnet",
        Network::Base => "base-mainnet",
        Network::Bnb => "bnb-mainnet",
    }
}

#[derive(Debug, Deserialize)]
struct PortfolioResponse {
    data: PortfolioData,
}

#[derive(Debug, Deserialize)]
struct PortfolioData {
    #[serde(default)]
    tokens: Vec<TokenEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenEntry {
    #[serde(default)]
    token_balance: Option<String>,
    #[serde(default)]
    token_metadata: Option<TokenMetadata>,
}

#[derive(Debug, Deserialize)]
struct TokenMetadata {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    decimals: Option<u32>,
}

fn parse_hex_balance(raw: &str) -> Option<u128> {
    u128::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
}

/// Translate the token list into a Position: USDC becomes CASH, every other
/// token keys by its symbol, scaled out of smallest units.
fn to_position(tokens: &[TokenEntry]) -> Position {
    let mut pos = Position::new();
    for t in tokens {
        let meta = match &t.token_metadata {
            Some(m) => m,
            None => continue,
        };
        let symbol = match &meta.symbol {
            Some(s) if !s.is_empty() => s.clone(),
            _ => continue,
        };
        let raw = t.token_balance.as_deref().and_then(parse_hex_balance).unwrap_or(0);
        if raw == 0 {
            continue;
        }
        let decimals = meta.decimals.unwrap_or(18);
        let qty = raw as f64 / 10f64.powi(decimals as i32);
        if symbol == "USDC" {
            *pos.entry(CASH_KEY.to_string()).or_insert(0.0) += qty;
        } else {
            *pos.entry(symbol).or_insert(0.0) += qty;
        }
    }
    pos.entry(CASH_KEY.to_string()).or_insert(0.0);
    pos
}

pub struct AlchemyBalances {
    http: reqwest::Client,
    network: Network,
    api_key: String,
}

impl AlchemyBalances {
    pub fn new(network: Network, api_key: String) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| SourceError::Http(e.to_string()))?;
        Ok(Self { http, network, api_key })
    }
}

#[async_trait]
impl BalanceProvider for AlchemyBalances {
    async fn position_snapshot(&self, wallet_address: &str) -> Result<Position, SourceError> {
        let url = format!("{}/{}/assets/tokens/by-address", PORTFOLIO_API_BASE, self.api_key);
        let body = serde_json::json!({
            "addresses": [{
                "address": wallet_address,
                "networks": [alchemy_network_id(self.network)],
            }],
            "withMetadata": true,
            "withPrices": true,
            "includeNativeTokens": true,
            "includeErc20Tokens": true,
        });

        let rsp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SourceError::Http(e.to_string()))?;
        if !rsp.status().is_success() {
            let code = rsp.status();
            let text = rsp.text().await.unwrap_or_default();
            return Err(SourceError::Upstream(format!("portfolio api {code}: {text}")));
        }

        let parsed: PortfolioResponse =
            rsp.json().await.map_err(|e| SourceError::Upstream(e.to_string()))?;
        let pos = to_position(&parsed.data.tokens);
        info!(wallet = %wallet_address, tokens = parsed.data.tokens.len(), "token balances fetched");
        Ok(pos)
    }
}
