#![allow(dead_code)]

use async_trait::async_trait;
use bip39::Mnemonic;
use chrono::{DateTime, Utc};
use lockup_sweeper::alert::AlertSink;
use lockup_sweeper::amount::Amount;
use lockup_sweeper::config::{EngineSettings, RunConfig};
use lockup_sweeper::error::LedgerError;
use lockup_sweeper::keys::Keypair;
use lockup_sweeper::ledger::{
    AccountInfo, ClaimPredicate, ClaimableBalance, LedgerGateway, Operation, SubmitReceipt,
    TransactionRequest,
};
use lockup_sweeper::orchestrator::{Orchestrator, RunContext};
use lockup_sweeper::store::{JsonWalletStore, WalletStore};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const BASE_FEE: u32 = 100;

/// Accepted transaction as seen by the fake ledger.
#[derive(Debug, Clone)]
pub struct Submission {
    pub request: TransactionRequest,
    pub signers: Vec<String>,
    pub hash: String,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<String, AccountInfo>,
    claimables: HashMap<String, Vec<ClaimableBalance>>,
    submissions: Vec<Submission>,
    reject_sources: HashMap<String, String>,
    reject_destinations: HashMap<String, String>,
    panic_on_load: HashSet<String>,
    next_hash: u64,
}

/// In-memory ledger that applies create/pay/claim effects and charges fees.
/// Reserves are not enforced.
#[derive(Default)]
pub struct FakeLedger {
    state: Mutex<LedgerState>,
    calls: AtomicUsize,
}

impl FakeLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fund(&self, public_key: &str, balance: &str) {
        self.fund_with_subentries(public_key, balance, 0);
    }

    pub fn fund_with_subentries(&self, public_key: &str, balance: &str, subentries: u32) {
        let mut state = self.state.lock().unwrap();
        state.accounts.insert(
            public_key.to_string(),
            AccountInfo {
                account_id: public_key.to_string(),
                sequence: 1000,
                native_balance: balance.parse().unwrap(),
                subentry_count: subentries,
            },
        );
    }

    pub fn add_claimable(&self, public_key: &str, id: &str, amount: &str, predicate: ClaimPredicate) {
        let mut state = self.state.lock().unwrap();
        state
            .claimables
            .entry(public_key.to_string())
            .or_default()
            .push(ClaimableBalance {
                id: id.to_string(),
                amount: amount.parse().unwrap(),
                predicate,
            });
    }

    /// Every submission with this transaction source fails with `code`.
    pub fn reject_source(&self, public_key: &str, code: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .reject_sources
            .insert(public_key.to_string(), code.to_string());
    }

    /// Every submission paying `public_key` fails with `code`.
    pub fn reject_destination(&self, public_key: &str, code: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .reject_destinations
            .insert(public_key.to_string(), code.to_string());
    }

    /// Looking up `public_key` panics inside the caller's task.
    pub fn panic_on_load(&self, public_key: &str) {
        let mut state = self.state.lock().unwrap();
        state.panic_on_load.insert(public_key.to_string());
    }

    pub fn account(&self, public_key: &str) -> Option<AccountInfo> {
        self.state.lock().unwrap().accounts.get(public_key).cloned()
    }

    pub fn balance(&self, public_key: &str) -> Amount {
        self.account(public_key)
            .map(|a| a.native_balance)
            .unwrap_or(Amount::ZERO)
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn credit(state: &mut LedgerState, account: &str, amount: Amount) -> Result<(), LedgerError> {
    let entry = state
        .accounts
        .get_mut(account)
        .ok_or_else(|| LedgerError::rejected("op_no_destination"))?;
    entry.native_balance = entry.native_balance + amount;
    Ok(())
}

fn debit(state: &mut LedgerState, account: &str, amount: Amount) -> Result<(), LedgerError> {
    let entry = state
        .accounts
        .get_mut(account)
        .ok_or_else(|| LedgerError::rejected("op_no_source_account"))?;
    if entry.native_balance < amount {
        return Err(LedgerError::rejected("op_underfunded"));
    }
    entry.native_balance = entry.native_balance - amount;
    Ok(())
}

#[async_trait]
impl LedgerGateway for FakeLedger {
    async fn load_account(&self, public_key: &str) -> Result<Option<AccountInfo>, LedgerError> {
        self.touch();
        // Guard dropped before panicking so the mutex is not poisoned
        let explode = self.state.lock().unwrap().panic_on_load.contains(public_key);
        if explode {
            panic!("ledger lookup for {} blew up", public_key);
        }
        Ok(self.account(public_key))
    }

    async fn claimable_balances(
        &self,
        public_key: &str,
    ) -> Result<Vec<ClaimableBalance>, LedgerError> {
        self.touch();
        Ok(self
            .state
            .lock()
            .unwrap()
            .claimables
            .get(public_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn base_fee(&self) -> Result<u32, LedgerError> {
        self.touch();
        Ok(BASE_FEE)
    }

    async fn submit(
        &self,
        request: &TransactionRequest,
        signers: &[&Keypair],
    ) -> Result<SubmitReceipt, LedgerError> {
        self.touch();
        let mut state = self.state.lock().unwrap();

        if let Some(code) = state.reject_sources.get(&request.source_account) {
            return Err(LedgerError::rejected(code.clone()));
        }
        for op in &request.operations {
            if let Operation::Payment { destination, .. } = op {
                if let Some(code) = state.reject_destinations.get(destination) {
                    return Err(LedgerError::rejected(code.clone()));
                }
            }
        }

        let source = request.source_account.clone();
        let current = state
            .accounts
            .get(&source)
            .ok_or_else(|| LedgerError::NotFound(source.clone()))?;
        if current.sequence != request.sequence {
            return Err(LedgerError::rejected("tx_bad_seq"));
        }

        let fee = Amount::from_stroops(i64::from(request.total_fee()));
        debit(&mut state, &source, fee)?;

        for op in &request.operations {
            match op {
                Operation::CreateAccount {
                    destination,
                    starting_balance,
                } => {
                    debit(&mut state, &source, *starting_balance)?;
                    state.accounts.insert(
                        destination.clone(),
                        AccountInfo {
                            account_id: destination.clone(),
                            sequence: 5000,
                            native_balance: *starting_balance,
                            subentry_count: 0,
                        },
                    );
                }
                Operation::Payment {
                    source: op_source,
                    destination,
                    amount,
                } => {
                    let from = op_source.clone().unwrap_or_else(|| source.clone());
                    debit(&mut state, &from, *amount)?;
                    credit(&mut state, destination, *amount)?;
                }
                Operation::ClaimClaimableBalance {
                    source: op_source,
                    balance_id,
                } => {
                    let claimant = op_source.clone().unwrap_or_else(|| source.clone());
                    let claims = state.claimables.entry(claimant.clone()).or_default();
                    let pos = claims
                        .iter()
                        .position(|c| &c.id == balance_id)
                        .ok_or_else(|| LedgerError::rejected("op_does_not_exist"))?;
                    let claim = claims.remove(pos);
                    credit(&mut state, &claimant, claim.amount)?;
                }
            }
        }

        if let Some(account) = state.accounts.get_mut(&source) {
            account.sequence += 1;
        }

        state.next_hash += 1;
        let hash = format!("{:064x}", state.next_hash);
        state.submissions.push(Submission {
            request: request.clone(),
            signers: signers.iter().map(|k| k.public_key().to_string()).collect(),
            hash: hash.clone(),
        });

        Ok(SubmitReceipt { hash })
    }
}

/// Alert sink that keeps every message.
#[derive(Default)]
pub struct RecordingAlerts {
    messages: Mutex<Vec<String>>,
}

impl RecordingAlerts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl AlertSink for RecordingAlerts {
    fn notify(&self, message: String) {
        self.messages.lock().unwrap().push(message);
    }
}

/// Deterministic valid 12-word phrase.
pub fn phrase(seed: u8) -> String {
    Mnemonic::from_entropy(&[seed; 16]).unwrap().to_string()
}

pub fn public_key(phrase: &str) -> String {
    Keypair::from_phrase(phrase).unwrap().public_key().to_string()
}

pub fn funder_phrase() -> String {
    phrase(100)
}

pub fn recipient() -> String {
    public_key(&phrase(200))
}

pub fn sponsor_phrases(count: u8) -> Vec<String> {
    (1..=count).map(phrase).collect()
}

pub fn run_config(sponsors: u8, workers: usize) -> RunConfig {
    RunConfig {
        recipient: recipient(),
        funding_phrase: funder_phrase(),
        sponsor_phrases: sponsor_phrases(sponsors),
        concurrent_workers: workers,
        ..RunConfig::default()
    }
}

/// Loops effectively never fire on their own; tests drive ticks by hand.
pub fn manual_settings() -> EngineSettings {
    EngineSettings {
        tick_interval: Duration::from_secs(3600),
        maintenance_interval: Duration::from_secs(3600),
        ..EngineSettings::default()
    }
}

/// Ledger with a rich funder and an existing recipient.
pub fn seeded_ledger() -> Arc<FakeLedger> {
    let ledger = FakeLedger::new();
    ledger.fund(&public_key(&funder_phrase()), "1000");
    ledger.fund(&recipient(), "10");
    ledger
}

pub async fn temp_store() -> (Arc<JsonWalletStore>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = JsonWalletStore::load(temp_dir.path().join("wallets.json"))
        .await
        .unwrap();
    (Arc::new(store), temp_dir)
}

pub fn build_context(
    ledger: Arc<FakeLedger>,
    store: Arc<JsonWalletStore>,
    alerts: Arc<RecordingAlerts>,
    config: RunConfig,
) -> RunContext {
    let store: Arc<dyn WalletStore> = store;
    RunContext::new(config, manual_settings(), ledger, store, alerts).unwrap()
}

pub fn build_orchestrator(
    ledger: Arc<FakeLedger>,
    store: Arc<JsonWalletStore>,
    alerts: Arc<RecordingAlerts>,
) -> Orchestrator {
    Orchestrator::new(ledger, store, alerts, manual_settings())
}

/// `not(abs_before(at))`: claimable from `at` on.
pub fn unlocks_at(at: DateTime<Utc>) -> ClaimPredicate {
    ClaimPredicate::Not(Box::new(ClaimPredicate::AbsBefore(at)))
}
