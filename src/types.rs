//! Core data types for the lockup sweeper

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ledger public key in strkey form (`G...`).
pub type PublicKey = String;

/// Persisted wallet lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletStatus {
    Pending,
    Scheduled,
    AwaitingExecution,
    Executing,
    Success,
    Failed,
    Invalid,
    Inactive,
}

impl WalletStatus {
    pub const ALL: [WalletStatus; 8] = [
        WalletStatus::Pending,
        WalletStatus::Scheduled,
        WalletStatus::AwaitingExecution,
        WalletStatus::Executing,
        WalletStatus::Success,
        WalletStatus::Failed,
        WalletStatus::Invalid,
        WalletStatus::Inactive,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WalletStatus::Success
                | WalletStatus::Failed
                | WalletStatus::Invalid
                | WalletStatus::Inactive
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WalletStatus::Pending => "PENDING",
            WalletStatus::Scheduled => "SCHEDULED",
            WalletStatus::AwaitingExecution => "AWAITING_EXECUTION",
            WalletStatus::Executing => "EXECUTING",
            WalletStatus::Success => "SUCCESS",
            WalletStatus::Failed => "FAILED",
            WalletStatus::Invalid => "INVALID",
            WalletStatus::Inactive => "INACTIVE",
        }
    }
}

impl fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a busy sponsor is doing right now. In-memory only; the persisted
/// status stays `EXECUTING` for the whole pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelinePhase {
    Funding,
    /// Funded and holding the sponsor until the wallet's lockup expires.
    AwaitingUnlock,
    Executing,
    Sweeping,
    Finalizing,
    Maintenance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub secret_phrase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    pub status: WalletStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sponsor_public_key: Option<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Partial write for [`crate::store::WalletStore::upsert`]. `None` fields
/// leave the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct WalletPatch {
    pub secret_phrase: String,
    pub public_key: Option<PublicKey>,
    pub status: Option<WalletStatus>,
    pub unlock_time: Option<DateTime<Utc>>,
    pub sponsor_public_key: Option<PublicKey>,
    pub reason: Option<String>,
}

impl WalletPatch {
    pub fn new(secret_phrase: impl Into<String>) -> Self {
        Self {
            secret_phrase: secret_phrase.into(),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: WalletStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn public_key(mut self, public_key: impl Into<PublicKey>) -> Self {
        self.public_key = Some(public_key.into());
        self
    }

    pub fn unlock_time(mut self, unlock_time: DateTime<Utc>) -> Self {
        self.unlock_time = Some(unlock_time);
        self
    }

    pub fn sponsor(mut self, sponsor_public_key: impl Into<PublicKey>) -> Self {
        self.sponsor_public_key = Some(sponsor_public_key.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Shallow-overwrite `record` with every field present in this patch.
    pub fn apply_to(&self, record: &mut WalletRecord, now: DateTime<Utc>) {
        if let Some(public_key) = &self.public_key {
            record.public_key = Some(public_key.clone());
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(unlock_time) = self.unlock_time {
            record.unlock_time = Some(unlock_time);
        }
        if let Some(sponsor) = &self.sponsor_public_key {
            record.sponsor_public_key = Some(sponsor.clone());
        }
        if let Some(reason) = &self.reason {
            record.reason = Some(reason.clone());
        }
        record.updated_at = now;
    }

    /// Build a fresh record, which requires a status.
    pub fn into_record(self, now: DateTime<Utc>) -> Option<WalletRecord> {
        let status = self.status?;
        Some(WalletRecord {
            secret_phrase: self.secret_phrase,
            public_key: self.public_key,
            status,
            unlock_time: self.unlock_time,
            sponsor_public_key: self.sponsor_public_key,
            reason: self.reason,
            updated_at: now,
        })
    }
}

/// Counters returned by wallet intake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleStats {
    pub scheduled: usize,
    pub pending: usize,
    pub invalid: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WalletSummary {
    pub pending: usize,
    pub scheduled: usize,
    pub awaiting_execution: usize,
    pub executing: usize,
    pub success: usize,
    pub failed: usize,
    pub invalid: usize,
    pub inactive: usize,
    pub total: usize,
}

impl WalletSummary {
    pub fn record(&mut self, status: WalletStatus) {
        let slot = match status {
            WalletStatus::Pending => &mut self.pending,
            WalletStatus::Scheduled => &mut self.scheduled,
            WalletStatus::AwaitingExecution => &mut self.awaiting_execution,
            WalletStatus::Executing => &mut self.executing,
            WalletStatus::Success => &mut self.success,
            WalletStatus::Failed => &mut self.failed,
            WalletStatus::Invalid => &mut self.invalid,
            WalletStatus::Inactive => &mut self.inactive,
        };
        *slot += 1;
        self.total += 1;
    }

    pub fn count(&self, status: WalletStatus) -> usize {
        match status {
            WalletStatus::Pending => self.pending,
            WalletStatus::Scheduled => self.scheduled,
            WalletStatus::AwaitingExecution => self.awaiting_execution,
            WalletStatus::Executing => self.executing,
            WalletStatus::Success => self.success,
            WalletStatus::Failed => self.failed,
            WalletStatus::Invalid => self.invalid,
            WalletStatus::Inactive => self.inactive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorStatus {
    pub public_key: PublicKey,
    pub busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<PipelinePhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_public_key: Option<PublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotStatus {
    pub running: bool,
    pub sponsors: Vec<SponsorStatus>,
    pub in_flight: usize,
}

/// Terminal result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Success(String),
    Failed(String),
}

impl TaskOutcome {
    pub fn status(&self) -> WalletStatus {
        match self {
            TaskOutcome::Success(_) => WalletStatus::Success,
            TaskOutcome::Failed(_) => WalletStatus::Failed,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            TaskOutcome::Success(reason) | TaskOutcome::Failed(reason) => reason,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Success(hash) => write!(f, "transaction {} accepted", hash),
            TaskOutcome::Failed(reason) => write!(f, "task failed: {}", reason),
        }
    }
}

/// Collapse runs of whitespace so the same phrase always maps to one record.
pub fn normalize_phrase(phrase: &str) -> String {
    phrase.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn truncate_key(key: &str) -> String {
    if key.len() <= 12 {
        return key.to_string();
    }
    format!("{}...{}", &key[..6], &key[key.len() - 4..])
}
