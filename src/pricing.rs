// ===============================
// src/pricing.rs (external collaborator seams)
// ===============================
//
// The core does not implement price discovery or portfolio REST lookups.
// These traits are the two call signatures it needs; concrete impls live at
// the edge (alchemy.rs, plus the file-backed price table below used by the
// one-shot driver).

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::domain::{Market, Position};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http error: {0}")]
    Http(String),
    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Spot/open price lookup for one symbol on one trading date.
/// `Ok(None)` means the symbol (or its price for that date) does not exist —
/// the engine turns that into a rejection, never a raise.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn open_price(
        &self,
        date: &str,
        symbol: &str,
        market: Market,
    ) -> Result<Option<f64>, SourceError>;
}

/// Live balance query for blockchain-mode position synthesis: translates a
/// wallet's token balances into a Position keyed by symbol (plus CASH).
#[async_trait]
pub trait BalanceProvider: Send + Sync {
    async fn position_snapshot(&self, wallet_address: &str) -> Result<Position, SourceError>;
}

/// Open prices loaded from a JSON table on disk. Accepts either the dated
/// form `{"2025-11-11": {"AAPL": 150.0}}` or a flat `{"AAPL": 150.0}` map.
#[derive(Debug)]
pub struct FilePriceSource {
    by_date: HashMap<String, HashMap<String, f64>>,
    flat: HashMap<String, f64>,
}

impl FilePriceSource {
    pub fn load(path: &Path) -> Result<Self, SourceError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SourceError::Upstream(format!("{}: {e}", path.display())))?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| SourceError::Upstream(format!("{}: {e}", path.display())))?;

        let mut by_date = HashMap::new();
        let mut flat = HashMap::new();
        if let serde_json::Value::Object(map) = value {
            for (key, v) in map {
                match v {
                    serde_json::Value::Object(inner) => {
                        let table: HashMap<String, f64> = inner
                            .into_iter()
                            .filter_map(|(sym, p)| p.as_f64().map(|p| (sym, p)))
                            .collect();
                        by_date.insert(key, table);
                    }
                    other => {
                        if let Some(p) = other.as_f64() {
                            flat.insert(key, p);
                        }
                    }
                }
            }
        }
        info!(path = %path.display(), dates = by_date.len(), symbols = flat.len(), "price table loaded");
        Ok(Self { by_date, flat })
    }
}

#[async_trait]
impl PriceSource for FilePriceSource {
    async fn open_price(
        &self,
        date: &str,
        symbol: &str,
        _market: Market,
    ) -> Result<Option<f64>, SourceError> {
        if let Some(table) = self.by_date.get(date) {
            if let Some(p) = table.get(symbol) {
                return Ok(Some(*p));
            }
        }
        Ok(self.flat.get(symbol).copied())
    }
}
