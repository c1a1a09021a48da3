//! Horizon REST gateway
//!
//! Rotates requests round-robin across a fixed endpoint list, builds and
//! signs transaction envelopes locally and submits them as base64 XDR.

use crate::amount::Amount;
use crate::error::{LedgerError, LedgerErrorCode};
use crate::keys::{Keypair, decode_public_key};
use crate::ledger::{
    AccountInfo, ClaimPredicate, ClaimableBalance, LedgerGateway, Operation, RawPredicate,
    SubmitReceipt, TransactionRequest,
};
use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use stellar_xdr::curr::{
    AccountId, Asset, ClaimClaimableBalanceOp, ClaimableBalanceId, CreateAccountOp,
    DecoratedSignature, Hash, Limits, Memo, MuxedAccount, Operation as XdrOperation,
    OperationBody, PaymentOp, Preconditions, PublicKey as XdrPublicKey, SequenceNumber,
    Signature, SignatureHint, TimeBounds, TimePoint, Transaction, TransactionEnvelope,
    TransactionExt, TransactionSignaturePayload, TransactionSignaturePayloadTaggedTransaction,
    TransactionV1Envelope, Uint256, WriteXdr,
};
use tracing::{debug, warn};

const CLAIMABLE_PAGE_LIMIT: u32 = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HorizonGateway {
    client: reqwest::Client,
    /// Default for reads; submissions carry their own timeout.
    request_timeout: Duration,
    endpoints: Vec<String>,
    next_endpoint: AtomicUsize,
    network_id: [u8; 32],
}

impl HorizonGateway {
    pub fn new(endpoints: Vec<String>, network_passphrase: &str) -> Result<Self> {
        Self::with_request_timeout(endpoints, network_passphrase, REQUEST_TIMEOUT)
    }

    pub fn with_request_timeout(
        endpoints: Vec<String>,
        network_passphrase: &str,
        request_timeout: Duration,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            bail!("at least one ledger endpoint is required");
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        let endpoints = endpoints
            .into_iter()
            .map(|e| e.trim_end_matches('/').to_string())
            .collect();

        Ok(Self {
            client,
            request_timeout,
            endpoints,
            next_endpoint: AtomicUsize::new(0),
            network_id: network_id(network_passphrase),
        })
    }

    fn endpoint(&self) -> &str {
        let index = self.next_endpoint.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[index]
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
    ) -> Result<Option<T>, LedgerError> {
        let url = format!("{}{}", self.endpoint(), path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport(e, self.request_timeout))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(LedgerError::Transport(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| LedgerError::Decode(e.to_string()))
    }

    /// Build the signed envelope. Returns the base64 XDR and the hex hash.
    pub fn build_envelope(
        &self,
        request: &TransactionRequest,
        signers: &[&Keypair],
    ) -> Result<(String, String), LedgerError> {
        let operations = request
            .operations
            .iter()
            .map(xdr_operation)
            .collect::<Result<Vec<_>, _>>()?;

        let max_time = u64::try_from(Utc::now().timestamp())
            .unwrap_or(0)
            .saturating_add(request.timeout.as_secs());

        let tx = Transaction {
            source_account: muxed_account(&request.source_account)?,
            fee: request.total_fee(),
            seq_num: SequenceNumber(request.sequence + 1),
            cond: Preconditions::Time(TimeBounds {
                min_time: TimePoint(0),
                max_time: TimePoint(max_time),
            }),
            memo: Memo::None,
            operations: operations.try_into().map_err(encode)?,
            ext: TransactionExt::V0,
        };

        let payload = TransactionSignaturePayload {
            network_id: Hash(self.network_id),
            tagged_transaction: TransactionSignaturePayloadTaggedTransaction::Tx(tx.clone()),
        };
        let payload_bytes = payload.to_xdr(Limits::none()).map_err(encode)?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&Sha256::digest(&payload_bytes));

        let signatures = signers
            .iter()
            .map(|signer| {
                Ok(DecoratedSignature {
                    hint: SignatureHint(signer.signature_hint()),
                    signature: Signature(signer.sign(&hash).to_vec().try_into().map_err(encode)?),
                })
            })
            .collect::<Result<Vec<_>, LedgerError>>()?;

        let envelope = TransactionEnvelope::Tx(TransactionV1Envelope {
            tx,
            signatures: signatures.try_into().map_err(encode)?,
        });

        let xdr = envelope.to_xdr_base64(Limits::none()).map_err(encode)?;
        Ok((xdr, hex::encode(hash)))
    }
}

#[async_trait]
impl LedgerGateway for HorizonGateway {
    async fn load_account(&self, public_key: &str) -> Result<Option<AccountInfo>, LedgerError> {
        let Some(account) = self
            .get_json::<AccountResponse>(&format!("/accounts/{}", public_key))
            .await?
        else {
            return Ok(None);
        };

        let sequence = account
            .sequence
            .parse()
            .map_err(|_| LedgerError::Decode(format!("bad sequence {:?}", account.sequence)))?;

        let native_balance = match account.balances.iter().find(|b| b.asset_type == "native") {
            Some(line) => parse_amount(&line.balance)?,
            None => Amount::ZERO,
        };

        Ok(Some(AccountInfo {
            account_id: account.account_id,
            sequence,
            native_balance,
            subentry_count: account.subentry_count,
        }))
    }

    async fn claimable_balances(
        &self,
        public_key: &str,
    ) -> Result<Vec<ClaimableBalance>, LedgerError> {
        let path = format!(
            "/claimable_balances?claimant={}&limit={}",
            public_key, CLAIMABLE_PAGE_LIMIT
        );
        let Some(page) = self.get_json::<Page<ClaimableRecord>>(&path).await? else {
            return Ok(Vec::new());
        };

        let mut balances = Vec::with_capacity(page.embedded.records.len());
        for record in page.embedded.records {
            let Some(claimant) = record
                .claimants
                .into_iter()
                .find(|c| c.destination == public_key)
            else {
                continue;
            };
            balances.push(ClaimableBalance {
                id: record.id,
                amount: parse_amount(&record.amount)?,
                predicate: ClaimPredicate::try_from(claimant.predicate)?,
            });
        }
        Ok(balances)
    }

    async fn base_fee(&self) -> Result<u32, LedgerError> {
        let stats = self
            .get_json::<FeeStats>("/fee_stats")
            .await?
            .ok_or_else(|| LedgerError::Decode("fee stats unavailable".to_string()))?;
        stats
            .last_ledger_base_fee
            .parse()
            .map_err(|_| LedgerError::Decode(format!("bad base fee {:?}", stats.last_ledger_base_fee)))
    }

    async fn submit(
        &self,
        request: &TransactionRequest,
        signers: &[&Keypair],
    ) -> Result<SubmitReceipt, LedgerError> {
        let (envelope, local_hash) = self.build_envelope(request, signers)?;
        let url = format!("{}/transactions", self.endpoint());
        debug!(
            "POST {} ({} ops, source {})",
            url,
            request.operations.len(),
            request.source_account
        );

        // The per-request timeout replaces the client default and covers the
        // body read as well.
        let response = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .form(&[("tx", envelope)])
            .send()
            .await
            .map_err(|e| transport(e, request.timeout))?;

        let status = response.status();
        let body: SubmitResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                LedgerError::Timeout(request.timeout)
            } else {
                LedgerError::Decode(e.to_string())
            }
        })?;

        if status.is_success() {
            return Ok(SubmitReceipt {
                hash: body.hash.unwrap_or(local_hash),
            });
        }

        if status == StatusCode::GATEWAY_TIMEOUT {
            return Err(LedgerError::Timeout(request.timeout));
        }

        match body.extras.and_then(|extras| extras.result_codes) {
            Some(codes) => {
                let (code, raw) = LedgerErrorCode::from_result_codes(
                    codes.transaction.as_deref(),
                    &codes.operations,
                );
                warn!("transaction rejected: {}", raw);
                Err(LedgerError::Rejected { code, raw })
            }
            None => Err(LedgerError::Transport(format!(
                "submission returned {}: {}",
                status,
                body.detail.or(body.title).unwrap_or_default()
            ))),
        }
    }
}

pub fn network_id(passphrase: &str) -> [u8; 32] {
    let mut id = [0u8; 32];
    id.copy_from_slice(&Sha256::digest(passphrase.as_bytes()));
    id
}

fn xdr_operation(operation: &Operation) -> Result<XdrOperation, LedgerError> {
    let op = match operation {
        Operation::CreateAccount {
            destination,
            starting_balance,
        } => XdrOperation {
            source_account: None,
            body: OperationBody::CreateAccount(CreateAccountOp {
                destination: account_id(destination)?,
                starting_balance: starting_balance.stroops(),
            }),
        },
        Operation::Payment {
            source,
            destination,
            amount,
        } => XdrOperation {
            source_account: source.as_deref().map(muxed_account).transpose()?,
            body: OperationBody::Payment(PaymentOp {
                destination: muxed_account(destination)?,
                asset: Asset::Native,
                amount: amount.stroops(),
            }),
        },
        Operation::ClaimClaimableBalance { source, balance_id } => XdrOperation {
            source_account: source.as_deref().map(muxed_account).transpose()?,
            body: OperationBody::ClaimClaimableBalance(ClaimClaimableBalanceOp {
                balance_id: claimable_balance_id(balance_id)?,
            }),
        },
    };
    Ok(op)
}

fn key_bytes(public_key: &str) -> Result<[u8; 32], LedgerError> {
    decode_public_key(public_key).map_err(|e| LedgerError::Encode(e.to_string()))
}

fn muxed_account(public_key: &str) -> Result<MuxedAccount, LedgerError> {
    Ok(MuxedAccount::Ed25519(Uint256(key_bytes(public_key)?)))
}

fn account_id(public_key: &str) -> Result<AccountId, LedgerError> {
    Ok(AccountId(XdrPublicKey::PublicKeyTypeEd25519(Uint256(
        key_bytes(public_key)?,
    ))))
}

/// Balance ids arrive as hex: a 4-byte type discriminant followed by the
/// 32-byte hash.
fn claimable_balance_id(id: &str) -> Result<ClaimableBalanceId, LedgerError> {
    let bytes = hex::decode(id).map_err(encode)?;
    let hash = match bytes.len() {
        36 => &bytes[4..],
        32 => &bytes[..],
        n => {
            return Err(LedgerError::Encode(format!(
                "claimable balance id has {} bytes",
                n
            )));
        }
    };
    let mut out = [0u8; 32];
    out.copy_from_slice(hash);
    Ok(ClaimableBalanceId::ClaimableBalanceIdTypeV0(Hash(out)))
}

fn parse_amount(raw: &str) -> Result<Amount, LedgerError> {
    raw.parse()
        .map_err(|e| LedgerError::Decode(format!("{}", e)))
}

fn encode(e: impl Display) -> LedgerError {
    LedgerError::Encode(e.to_string())
}

fn transport(e: reqwest::Error, timeout: Duration) -> LedgerError {
    if e.is_timeout() {
        return LedgerError::Timeout(timeout);
    }
    LedgerError::Transport(e.to_string())
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    account_id: String,
    sequence: String,
    #[serde(default)]
    subentry_count: u32,
    #[serde(default)]
    balances: Vec<BalanceLine>,
}

#[derive(Debug, Deserialize)]
struct BalanceLine {
    asset_type: String,
    balance: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(rename = "_embedded")]
    embedded: Embedded<T>,
}

#[derive(Debug, Deserialize)]
struct Embedded<T> {
    records: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ClaimableRecord {
    id: String,
    amount: String,
    claimants: Vec<ClaimantRecord>,
}

#[derive(Debug, Deserialize)]
struct ClaimantRecord {
    destination: String,
    predicate: RawPredicate,
}

#[derive(Debug, Deserialize)]
struct FeeStats {
    last_ledger_base_fee: String,
}

#[derive(Debug, Default, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    extras: Option<SubmitExtras>,
}

#[derive(Debug, Deserialize)]
struct SubmitExtras {
    #[serde(default)]
    result_codes: Option<ResultCodes>,
}

#[derive(Debug, Deserialize)]
struct ResultCodes {
    #[serde(default)]
    transaction: Option<String>,
    #[serde(default)]
    operations: Vec<String>,
}
