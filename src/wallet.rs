//! Wallet port and the daemon's ECDSA signer.
//!
//! Key-store management and balance queries live outside the core; the
//! daemon consumes them through the [`Wallet`] trait. [`Signer`] is the
//! concrete signing half: a secp256k1 key derived from a BIP-39
//! mnemonic, producing recoverable ECDSA signatures over SHA3-256
//! digests (the scheme counterparties and the delay oracle verify).

use crate::error::{Error, Result};
use crate::types::{Blockchain, Token};
use anyhow::Context;
use async_trait::async_trait;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use rust_decimal::Decimal;
use sha3::{Digest, Sha3_256};
use std::str::FromStr;

/// Read-only wallet view the request preparer validates against.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// This wallet's receive address on `chain`.
    fn address(&self, chain: Blockchain) -> Result<String>;

    /// Verify the spendable balance in `token` (minus reserved costs)
    /// covers `amount`. `None` only checks the token account is usable.
    async fn verify_balance(&self, token: &Token, amount: Option<Decimal>) -> Result<()>;
}

/// The daemon's signing key.
pub struct Signer {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl Signer {
    /// Derive the signing key from a BIP-39 mnemonic.
    pub fn from_mnemonic(phrase: &str) -> Result<Signer> {
        let mnemonic = bip39::Mnemonic::from_str(phrase)
            .map_err(|e| Error::KeyDerivation(format!("invalid mnemonic: {}", e)))?;
        let seed = mnemonic.to_seed("");
        let master = bitcoin::bip32::Xpriv::new_master(bitcoin::Network::Bitcoin, &seed)
            .context("failed to derive master key")?;

        let secp = Secp256k1::new();
        let secret_key = master.private_key;
        let public_key = secret_key.public_key(&secp);
        Ok(Signer {
            secret_key,
            public_key,
        })
    }

    /// Generate a signer from a fresh random mnemonic. Returns the
    /// phrase so the caller can store it.
    pub fn generate() -> Result<(Signer, String)> {
        use bip39::{Language, Mnemonic};
        use rand::rngs::OsRng;

        let mnemonic = Mnemonic::generate_in_with(&mut OsRng, Language::English, 12)
            .map_err(|e| Error::KeyDerivation(format!("failed to generate mnemonic: {}", e)))?;
        let phrase = mnemonic.to_string();
        let signer = Signer::from_mnemonic(&phrase)?;
        Ok((signer, phrase))
    }

    /// Recoverable ECDSA signature over the SHA3-256 digest of
    /// `message`, serialized as 65 bytes `r || s || v`.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let digest: [u8; 32] = Sha3_256::digest(message).into();
        let secp = Secp256k1::new();
        let sig = secp.sign_ecdsa_recoverable(&Message::from_digest(digest), &self.secret_key);
        let (recovery_id, bytes) = sig.serialize_compact();

        let mut out = Vec::with_capacity(65);
        out.extend_from_slice(&bytes);
        out.push(recovery_id.to_i32() as u8);
        Ok(out)
    }

    /// Verify a signature produced by [`Signer::sign`].
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        if signature.len() < 64 {
            return false;
        }
        let digest: [u8; 32] = Sha3_256::digest(message).into();
        let secp = Secp256k1::new();
        match Signature::from_compact(&signature[..64]) {
            Ok(sig) => secp
                .verify_ecdsa(&Message::from_digest(digest), &sig, &self.public_key)
                .is_ok(),
            Err(_) => false,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }
}
