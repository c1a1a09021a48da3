//! Secret phrase handling
//!
//! Phrases are BIP39 mnemonics. Keys are derived with SLIP-10 for ed25519
//! (hardened steps only) on `m/44'/314159'/0'` and rendered as strkey
//! public keys.

use crate::types::PublicKey;
use anyhow::{Context, Result, anyhow};
use bip39::Mnemonic;
use ed25519_dalek::{Signer, SigningKey};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use std::fmt;

type HmacSha512 = Hmac<Sha512>;

const SLIP10_ED25519_KEY: &[u8] = b"ed25519 seed";
const HARDENED: u32 = 0x8000_0000;

/// Derivation path used for every managed identity: purpose 44, coin type
/// 314159, account 0.
pub const DERIVATION_PATH: [u32; 3] = [44, 314_159, 0];

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl Keypair {
    pub fn from_phrase(phrase: &str) -> Result<Self> {
        Self::from_phrase_with_path(phrase, &DERIVATION_PATH)
    }

    /// Derive along an arbitrary hardened path (each index is hardened).
    pub fn from_phrase_with_path(phrase: &str, path: &[u32]) -> Result<Self> {
        let mnemonic = Mnemonic::parse(phrase.trim()).context("invalid BIP39 phrase")?;
        let seed = mnemonic.to_seed("");
        let secret = derive_slip10(&seed, path)?;
        Ok(Self::from_secret_bytes(secret))
    }

    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&secret);
        let public_key =
            stellar_strkey::ed25519::PublicKey(signing_key.verifying_key().to_bytes()).to_string();
        Self {
            signing_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Last four bytes of the public key, used as the signature hint.
    pub fn signature_hint(&self) -> [u8; 4] {
        let bytes = self.public_key_bytes();
        [bytes[28], bytes[29], bytes[30], bytes[31]]
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// True when `phrase` is a well-formed BIP39 mnemonic with a valid checksum.
pub fn validate_phrase(phrase: &str) -> bool {
    Mnemonic::parse(phrase.trim()).is_ok()
}

/// Decode a strkey public key into its raw ed25519 bytes.
pub fn decode_public_key(public_key: &str) -> Result<[u8; 32]> {
    stellar_strkey::ed25519::PublicKey::from_string(public_key)
        .map(|key| key.0)
        .map_err(|e| anyhow!("invalid public key {}: {:?}", public_key, e))
}

fn derive_slip10(seed: &[u8], path: &[u32]) -> Result<[u8; 32]> {
    let (mut key, mut chain_code) = hmac_split(SLIP10_ED25519_KEY, &[seed])?;

    for index in path {
        let hardened = (index | HARDENED).to_be_bytes();
        (key, chain_code) = hmac_split(&chain_code, &[&[0u8][..], &key[..], &hardened[..]])?;
    }

    Ok(key)
}

fn hmac_split(key: &[u8], parts: &[&[u8]]) -> Result<([u8; 32], [u8; 32])> {
    let mut mac = HmacSha512::new_from_slice(key).map_err(|e| anyhow!("invalid HMAC key: {}", e))?;
    for part in parts {
        mac.update(part);
    }
    let digest = mac.finalize().into_bytes();

    let mut left = [0u8; 32];
    let mut right = [0u8; 32];
    left.copy_from_slice(&digest[..32]);
    right.copy_from_slice(&digest[32..]);
    Ok((left, right))
}
