// ===============================
// src/ledger.rs (append-only JSONL position ledger)
// ===============================
//
// One ledger per agent identity:
//   <base>/<signature>/position/position.jsonl
// Append-only; consumers reconstruct state by scanning for the maximum id.
// A zero-length `.position.lock` marker sits beside the ledger; the actual
// mutual exclusion is a per-signature process-wide async mutex (the invariant
// is "serialize per agent identity", not "use flock").

use ahash::AHashMap as HashMap;
use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::{Mutex as TokioMutex, OwnedMutexGuard},
};
use tracing::warn;

use crate::domain::{ActionRecord, Position, Side};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

// Per-signature locks, process-wide. Guards the read-validate-compute-append
// sequence so concurrent orders for one agent cannot observe the same lastId.
static LOCKS: Lazy<StdMutex<HashMap<String, Arc<TokioMutex<()>>>>> =
    Lazy::new(|| StdMutex::new(HashMap::new()));

#[derive(Clone, Debug)]
pub struct Ledger {
    base: PathBuf,
}

impl Ledger {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    fn dir(&self, signature: &str) -> PathBuf {
        self.base.join(signature).join("position")
    }

    pub fn file_path(&self, signature: &str) -> PathBuf {
        self.dir(signature).join("position.jsonl")
    }

    fn lock_path(&self, signature: &str) -> PathBuf {
        self.dir(signature).join(".position.lock")
    }

    /// Acquire the exclusive per-signature lock. Also ensures the ledger
    /// directory and the on-disk lock marker exist.
    pub async fn lock(&self, signature: &str) -> Result<OwnedMutexGuard<()>, LedgerError> {
        fs::create_dir_all(self.dir(signature)).await?;
        // Marker beside the ledger; zero-length, kept purely as a handle.
        let _ = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.lock_path(signature))
            .await?;

        let m = {
            let mut map = LOCKS.lock().expect("ledger lock registry poisoned");
            map.entry(signature.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(())))
                .clone()
        };
        Ok(m.lock_owned().await)
    }

    /// Scan the ledger for the highest id and its position snapshot.
    /// Returns `None` for a missing or empty ledger.
    pub async fn latest(&self, signature: &str) -> Result<Option<(Position, i64)>, LedgerError> {
        let path = self.file_path(signature);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).await?;

        let mut best: Option<(Position, i64)> = None;
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ActionRecord>(line) {
                Ok(rec) => {
                    if best.as_ref().map_or(true, |(_, id)| rec.id > *id) {
                        best = Some((rec.positions, rec.id));
                    }
                }
                Err(e) => {
                    // Baris rusak: skip, jangan gagalkan seluruh scan
                    warn!(?e, path = %path.display(), "skipping malformed ledger line");
                }
            }
        }
        Ok(best)
    }

    /// Total shares bought of `symbol` on `date`, for the T+1 rule.
    pub async fn bought_today(
        &self,
        signature: &str,
        date: &str,
        symbol: &str,
    ) -> Result<i64, LedgerError> {
        let path = self.file_path(signature);
        if !path.exists() {
            return Ok(0);
        }
        let raw = fs::read_to_string(&path).await?;

        let mut total = 0i64;
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(rec) = serde_json::from_str::<ActionRecord>(line) {
                if rec.date == date
                    && rec.this_action.action == Side::Buy
                    && rec.this_action.symbol == symbol
                {
                    total += rec.this_action.amount;
                }
            }
        }
        Ok(total)
    }

    /// Append one record. Caller must hold the per-signature lock.
    pub async fn append(&self, signature: &str, record: &ActionRecord) -> Result<(), LedgerError> {
        fs::create_dir_all(self.dir(signature)).await?;
        let line = serde_json::to_string(record)?;

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path(signature))
            .await?;
        f.write_all(line.as_bytes()).await?;
        f.write_all(b"\n").await?;
        f.flush().await?;

        crate::metrics::LEDGER_APPENDS.inc();
        Ok(())
    }
}
