//! Wallet Store
//!
//! Keyed merge-upsert of wallet records with persistent state. Records keep
//! insertion order, which is also the order the execution queue is served in.

use crate::types::{WalletPatch, WalletRecord, WalletStatus, WalletSummary, normalize_phrase};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn find(&self, secret_phrase: &str) -> Result<Option<WalletRecord>>;

    async fn find_by_public_key(&self, public_key: &str) -> Result<Option<WalletRecord>>;

    /// Merge `patch` into the record for its secret phrase, creating the
    /// record when absent (a new record needs a status). Never deletes.
    async fn upsert(&self, patch: WalletPatch) -> Result<WalletRecord>;

    /// Merge `patch` only when the record exists and its current status is
    /// one of `from`. Check and write happen under one lock; `Ok(None)` means
    /// the record was missing or in another status and nothing changed.
    async fn upsert_if(
        &self,
        patch: WalletPatch,
        from: &[WalletStatus],
    ) -> Result<Option<WalletRecord>>;

    /// Create the record for `patch` unless one already exists for its
    /// secret phrase. `Ok(None)` leaves the existing record untouched.
    async fn insert_if_absent(&self, patch: WalletPatch) -> Result<Option<WalletRecord>>;

    async fn list_by_status(&self, status: WalletStatus) -> Result<Vec<WalletRecord>>;

    async fn list_all(&self) -> Result<Vec<WalletRecord>>;

    async fn summary(&self) -> Result<WalletSummary>;

    /// Drop every record.
    async fn clear(&self) -> Result<()>;
}

#[derive(Default)]
struct StoreState {
    records: Vec<WalletRecord>,
    index: HashMap<String, usize>,
}

impl StoreState {
    fn from_records(records: Vec<WalletRecord>) -> Self {
        let mut state = StoreState::default();
        for mut record in records {
            record.secret_phrase = normalize_phrase(&record.secret_phrase);
            match state.index.get(&record.secret_phrase) {
                Some(&pos) => state.records[pos] = record,
                None => {
                    state
                        .index
                        .insert(record.secret_phrase.clone(), state.records.len());
                    state.records.push(record);
                }
            }
        }
        state
    }
}

/// Wallet store persisted as a JSON array.
pub struct JsonWalletStore {
    state: RwLock<StoreState>,
    file_path: PathBuf,
}

impl JsonWalletStore {
    /// Loads records from disk, starting empty when the file does not exist.
    pub async fn load(file_path: PathBuf) -> Result<Self> {
        let records = if fs::try_exists(&file_path).await.unwrap_or(false) {
            info!("Loading wallets from {}", file_path.display());
            let content = fs::read_to_string(&file_path)
                .await
                .context("Failed to read wallet store")?;

            if content.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str::<Vec<WalletRecord>>(&content)
                    .context("Failed to parse wallet store")?
            }
        } else {
            info!("No wallet store found, starting empty.");
            Vec::new()
        };

        let state = StoreState::from_records(records);
        debug!("Wallet store holds {} records", state.records.len());

        Ok(Self {
            state: RwLock::new(state),
            file_path,
        })
    }

    async fn persist_locked(&self, state: &StoreState) -> Result<()> {
        let json =
            serde_json::to_string_pretty(&state.records).context("Failed to serialize wallets")?;

        let temp_path = self.file_path.with_extension("json.tmp");

        fs::write(&temp_path, &json)
            .await
            .context("Failed to write temporary wallet store")?;

        let file = fs::File::open(&temp_path).await?;
        file.sync_all()
            .await
            .context("Failed to fsync wallet store")?;

        fs::rename(&temp_path, &self.file_path)
            .await
            .context("Failed to rename wallet store")?;

        debug!("Wallets persisted to {}", self.file_path.display());

        Ok(())
    }
}

#[async_trait]
impl WalletStore for JsonWalletStore {
    async fn find(&self, secret_phrase: &str) -> Result<Option<WalletRecord>> {
        let key = normalize_phrase(secret_phrase);
        let state = self.state.read().await;
        Ok(state.index.get(&key).map(|&pos| state.records[pos].clone()))
    }

    async fn find_by_public_key(&self, public_key: &str) -> Result<Option<WalletRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .iter()
            .find(|r| r.public_key.as_deref() == Some(public_key))
            .cloned())
    }

    async fn upsert(&self, mut patch: WalletPatch) -> Result<WalletRecord> {
        patch.secret_phrase = normalize_phrase(&patch.secret_phrase);
        let now = chrono::Utc::now();
        let mut state = self.state.write().await;

        let record = match state.index.get(&patch.secret_phrase).copied() {
            Some(pos) => {
                let record = &mut state.records[pos];
                patch.apply_to(record, now);
                record.clone()
            }
            None => {
                let key = patch.secret_phrase.clone();
                let record = patch
                    .into_record(now)
                    .ok_or_else(|| anyhow!("cannot create a wallet record without a status"))?;
                let pos = state.records.len();
                state.records.push(record.clone());
                state.index.insert(key, pos);
                record
            }
        };

        self.persist_locked(&state)
            .await
            .context("Failed to persist wallet store after upsert")?;

        Ok(record)
    }

    async fn upsert_if(
        &self,
        mut patch: WalletPatch,
        from: &[WalletStatus],
    ) -> Result<Option<WalletRecord>> {
        patch.secret_phrase = normalize_phrase(&patch.secret_phrase);
        let mut state = self.state.write().await;

        let Some(pos) = state.index.get(&patch.secret_phrase).copied() else {
            return Ok(None);
        };
        let current = state.records[pos].status;
        if !from.contains(&current) {
            debug!("Conditional update skipped: record is {}", current);
            return Ok(None);
        }

        let record = &mut state.records[pos];
        patch.apply_to(record, chrono::Utc::now());
        let record = record.clone();

        self.persist_locked(&state)
            .await
            .context("Failed to persist wallet store after conditional update")?;

        Ok(Some(record))
    }

    async fn insert_if_absent(&self, mut patch: WalletPatch) -> Result<Option<WalletRecord>> {
        patch.secret_phrase = normalize_phrase(&patch.secret_phrase);
        let mut state = self.state.write().await;

        if state.index.contains_key(&patch.secret_phrase) {
            return Ok(None);
        }

        let key = patch.secret_phrase.clone();
        let record = patch
            .into_record(chrono::Utc::now())
            .ok_or_else(|| anyhow!("cannot create a wallet record without a status"))?;
        let pos = state.records.len();
        state.records.push(record.clone());
        state.index.insert(key, pos);

        self.persist_locked(&state)
            .await
            .context("Failed to persist wallet store after insert")?;

        Ok(Some(record))
    }

    async fn list_by_status(&self, status: WalletStatus) -> Result<Vec<WalletRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<WalletRecord>> {
        Ok(self.state.read().await.records.clone())
    }

    async fn summary(&self) -> Result<WalletSummary> {
        let state = self.state.read().await;
        let mut summary = WalletSummary::default();
        for record in &state.records {
            summary.record(record.status);
        }
        Ok(summary)
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;
        *state = StoreState::default();
        info!("Wallet store cleared");
        self.persist_locked(&state).await
    }
}
