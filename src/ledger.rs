//! Ledger gateway contract and models
//!
//! The orchestrator only ever talks to the ledger through [`LedgerGateway`].
//! Production uses [`crate::horizon::HorizonGateway`]; tests inject a fake.

use crate::amount::Amount;
use crate::error::LedgerError;
use crate::keys::Keypair;
use crate::types::PublicKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub account_id: PublicKey,
    pub sequence: i64,
    pub native_balance: Amount,
    pub subentry_count: u32,
}

impl AccountInfo {
    /// Minimum native balance the ledger requires this account to keep.
    pub fn minimum_balance(&self, base_reserve: Amount) -> Amount {
        minimum_balance(self.subentry_count, base_reserve)
    }

    /// Balance above the minimum reserve.
    pub fn spendable(&self, base_reserve: Amount) -> Amount {
        self.native_balance
            .saturating_sub(self.minimum_balance(base_reserve))
    }
}

/// `(2 + subentries) * base_reserve`
pub fn minimum_balance(subentry_count: u32, base_reserve: Amount) -> Amount {
    base_reserve
        .checked_mul(2 + i64::from(subentry_count))
        .unwrap_or(Amount::from_stroops(i64::MAX))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimableBalance {
    pub id: String,
    pub amount: Amount,
    /// Predicate attached to the claimant entry for the queried account.
    pub predicate: ClaimPredicate,
}

impl ClaimableBalance {
    pub fn is_unlocked(&self, now: DateTime<Utc>) -> bool {
        self.predicate.is_satisfied(now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimPredicate {
    Unconditional,
    And(Vec<ClaimPredicate>),
    Or(Vec<ClaimPredicate>),
    Not(Box<ClaimPredicate>),
    /// Satisfied strictly before the given instant.
    AbsBefore(DateTime<Utc>),
    /// Relative to balance creation, which the gateway does not report; never
    /// treated as satisfied.
    RelBefore(i64),
}

impl ClaimPredicate {
    pub fn is_satisfied(&self, now: DateTime<Utc>) -> bool {
        match self {
            ClaimPredicate::Unconditional => true,
            ClaimPredicate::And(parts) => parts.iter().all(|p| p.is_satisfied(now)),
            ClaimPredicate::Or(parts) => parts.iter().any(|p| p.is_satisfied(now)),
            ClaimPredicate::Not(inner) => !inner.is_satisfied(now),
            ClaimPredicate::AbsBefore(deadline) => now < *deadline,
            ClaimPredicate::RelBefore(_) => false,
        }
    }

    /// Instant from which a `not(abs_before)` lockup can be claimed.
    pub fn unlock_time(&self) -> Option<DateTime<Utc>> {
        match self {
            ClaimPredicate::Not(inner) => match inner.as_ref() {
                ClaimPredicate::AbsBefore(at) => Some(*at),
                _ => None,
            },
            ClaimPredicate::And(parts) => parts.iter().filter_map(|p| p.unlock_time()).max(),
            _ => None,
        }
    }
}

/// Wire shape of a claimant predicate: an object with one populated key.
#[derive(Debug, Default, Deserialize)]
pub struct RawPredicate {
    #[serde(default)]
    pub unconditional: Option<bool>,
    #[serde(default)]
    pub and: Option<Vec<RawPredicate>>,
    #[serde(default)]
    pub or: Option<Vec<RawPredicate>>,
    #[serde(default)]
    pub not: Option<Box<RawPredicate>>,
    #[serde(default)]
    pub abs_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rel_before: Option<String>,
}

impl TryFrom<RawPredicate> for ClaimPredicate {
    type Error = LedgerError;

    fn try_from(raw: RawPredicate) -> Result<Self, Self::Error> {
        let convert_all = |parts: Vec<RawPredicate>| {
            parts
                .into_iter()
                .map(ClaimPredicate::try_from)
                .collect::<Result<Vec<_>, _>>()
        };

        if let Some(parts) = raw.and {
            return Ok(ClaimPredicate::And(convert_all(parts)?));
        }
        if let Some(parts) = raw.or {
            return Ok(ClaimPredicate::Or(convert_all(parts)?));
        }
        if let Some(inner) = raw.not {
            return Ok(ClaimPredicate::Not(Box::new(ClaimPredicate::try_from(*inner)?)));
        }
        if let Some(at) = raw.abs_before {
            return Ok(ClaimPredicate::AbsBefore(at));
        }
        if let Some(seconds) = raw.rel_before {
            let seconds = seconds
                .parse()
                .map_err(|_| LedgerError::Decode(format!("bad rel_before {:?}", seconds)))?;
            return Ok(ClaimPredicate::RelBefore(seconds));
        }
        if raw.unconditional.unwrap_or(false) {
            return Ok(ClaimPredicate::Unconditional);
        }
        Err(LedgerError::Decode("empty claim predicate".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateAccount {
        destination: PublicKey,
        starting_balance: Amount,
    },
    Payment {
        /// Operation source; `None` means the transaction source.
        source: Option<PublicKey>,
        destination: PublicKey,
        amount: Amount,
    },
    ClaimClaimableBalance {
        source: Option<PublicKey>,
        balance_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub source_account: PublicKey,
    /// Current sequence of the source account; the transaction uses `+ 1`.
    pub sequence: i64,
    pub base_fee: u32,
    pub operations: Vec<Operation>,
    pub timeout: Duration,
}

impl TransactionRequest {
    pub fn new(source: &AccountInfo, base_fee: u32, timeout: Duration) -> Self {
        Self {
            source_account: source.account_id.clone(),
            sequence: source.sequence,
            base_fee,
            operations: Vec::new(),
            timeout,
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Total fee bid: base fee per operation.
    pub fn total_fee(&self) -> u32 {
        let ops = u32::try_from(self.operations.len()).unwrap_or(u32::MAX);
        self.base_fee.saturating_mul(ops.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub hash: String,
}

#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// `Ok(None)` when the account does not exist.
    async fn load_account(&self, public_key: &str) -> Result<Option<AccountInfo>, LedgerError>;

    /// Claimable balances where `public_key` is a claimant. The predicate on
    /// each entry is the one attached to that claimant.
    async fn claimable_balances(
        &self,
        public_key: &str,
    ) -> Result<Vec<ClaimableBalance>, LedgerError>;

    /// Current base fee in stroops per operation.
    async fn base_fee(&self) -> Result<u32, LedgerError>;

    async fn submit(
        &self,
        request: &TransactionRequest,
        signers: &[&Keypair],
    ) -> Result<SubmitReceipt, LedgerError>;
}

/// Per-source-account async locks.
///
/// Two transactions from the same source built off the same loaded sequence
/// would collide, so every load-sequence-then-submit section takes the lock
/// for its source account. Only same-account submissions are serialized.
#[derive(Debug, Default)]
pub struct SequenceLocks {
    locks: DashMap<PublicKey, Arc<Mutex<()>>>,
}

impl SequenceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, account: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}
