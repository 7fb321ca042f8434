// ===============================
// src/positions.rs (PositionStore)
// ===============================
//
// Read-only view over the current position and the next available action id.
// File mode scans the agent's ledger; blockchain mode synthesizes a Position
// from live token balances and returns the sentinel id -1, meaning "no file
// ledger is authoritative".

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::domain::{initial_position, Position};
use crate::ledger::{Ledger, LedgerError};
use crate::pricing::{BalanceProvider, SourceError};

/// Sentinel last-id for blockchain-backed positions.
pub const CHAIN_SENTINEL_ID: i64 = -1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Balance(#[from] SourceError),
}

pub enum PositionStore {
    Ledger { ledger: Ledger, init_cash: f64 },
    Chain { provider: Arc<dyn BalanceProvider>, wallet_address: String },
}

impl PositionStore {
    /// Latest position snapshot plus the highest used action id.
    /// Empty ledger -> configured initial position and last_id = 0.
    pub async fn latest(
        &self,
        _date: &str,
        signature: &str,
    ) -> Result<(Position, i64), StoreError> {
        match self {
            PositionStore::Ledger { ledger, init_cash } => {
                match ledger.latest(signature).await? {
                    Some((pos, id)) => Ok((pos, id)),
                    None => Ok((initial_position(*init_cash), 0)),
                }
            }
            PositionStore::Chain { provider, wallet_address } => {
                let pos = provider.position_snapshot(wallet_address).await?;
                info!(wallet = %wallet_address, symbols = pos.len(), "position synthesized from chain balances");
                Ok((pos, CHAIN_SENTINEL_ID))
            }
        }
    }
}
