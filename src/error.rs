//! Error types shared across the orchestrator

use std::time::Duration;

/// Structured rejection code reported by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerErrorCode {
    InsufficientBalance,
    BadAuth,
    Underfunded,
    NoDestination,
    InsufficientFee,
    BadSequence,
    Other(String),
}

impl LedgerErrorCode {
    pub fn from_code(code: &str) -> Self {
        match code {
            "tx_insufficient_balance" | "op_low_reserve" => LedgerErrorCode::InsufficientBalance,
            "tx_bad_auth" | "tx_bad_auth_extra" | "op_bad_auth" => LedgerErrorCode::BadAuth,
            "op_underfunded" => LedgerErrorCode::Underfunded,
            "op_no_destination" => LedgerErrorCode::NoDestination,
            "tx_insufficient_fee" => LedgerErrorCode::InsufficientFee,
            "tx_bad_seq" => LedgerErrorCode::BadSequence,
            other => LedgerErrorCode::Other(other.to_string()),
        }
    }

    /// Pick the most specific code out of a `result_codes` block: the first
    /// operation code that is not a success, falling back to the
    /// transaction-level code.
    pub fn from_result_codes(transaction: Option<&str>, operations: &[String]) -> (Self, String) {
        let raw = operations
            .iter()
            .find(|code| code.as_str() != "op_success")
            .map(String::as_str)
            .or(transaction)
            .unwrap_or("unknown");
        (Self::from_code(raw), raw.to_string())
    }

    pub fn description(&self) -> &str {
        match self {
            LedgerErrorCode::InsufficientBalance => {
                "source balance cannot cover the fee and minimum reserve"
            }
            LedgerErrorCode::BadAuth => "missing or invalid signature",
            LedgerErrorCode::Underfunded => "source account is underfunded",
            LedgerErrorCode::NoDestination => "destination account does not exist",
            LedgerErrorCode::InsufficientFee => "fee below the network minimum",
            LedgerErrorCode::BadSequence => "sequence number out of date",
            LedgerErrorCode::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("account {0} not found")]
    NotFound(String),
    #[error("{raw}: {}", code.description())]
    Rejected { code: LedgerErrorCode, raw: String },
    #[error("submission timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed ledger response: {0}")]
    Decode(String),
    #[error("failed to encode transaction: {0}")]
    Encode(String),
}

impl LedgerError {
    pub fn rejected(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        LedgerError::Rejected {
            code: LedgerErrorCode::from_code(&raw),
            raw,
        }
    }

    pub fn code(&self) -> Option<&LedgerErrorCode> {
        match self {
            LedgerError::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Funder could not fund the sponsor. Critical: usually means the funder
    /// itself is exhausted or misconfigured.
    #[error("critical: sponsor funding failed: {0}")]
    Funding(LedgerError),
    #[error("nothing to claim/send")]
    NothingToSend,
    #[error("{0}")]
    Execution(LedgerError),
    #[error("key derivation failed: {0}")]
    Derivation(String),
}

impl PipelineError {
    pub fn is_critical(&self) -> bool {
        matches!(self, PipelineError::Funding(_))
    }

    /// Human-readable reason stored on the wallet record.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("bot is already running")]
    AlreadyRunning,
    #[error("bot is not running")]
    NotRunning,
    #[error("{0} pipeline run(s) from the previous session are still in flight")]
    Draining(usize),
    #[error("wallet not found")]
    UnknownWallet,
    #[error("wallet is already executing")]
    WalletBusy,
    #[error("no sponsor available")]
    NoSponsorAvailable,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("key derivation failed: {0}")]
    Derivation(String),
    #[error("wallet store error: {0:#}")]
    Store(#[from] anyhow::Error),
}
