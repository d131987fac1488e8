//! Swap domain model: identifiers, blobs, receipts, statuses, and the
//! per-side HTLC terms derived from a blob.

use crate::error::{Error, Result};
use crate::types::{Cost, Token, parse_amount};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use rand::RngCore;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use std::fmt;
use std::sync::Arc;

/// Number of seconds in one protocol expiry unit (two hours). The
/// initiator locks three units out; the responder one unit less, leaving
/// each party a full unit to act after observing the other.
pub const EXPIRY_UNIT: i64 = 2 * 60 * 60;

/// Opaque swap identifier: the URL-safe base64 encoding of 32 random
/// bytes. Globally unique within a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct SwapId(String);

impl SwapId {
    /// Fresh identifier from the OS RNG.
    pub fn random() -> SwapId {
        let mut id = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut id);
        SwapId(URL_SAFE_NO_PAD.encode(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SwapId {
    fn from(s: &str) -> Self {
        SwapId(s.to_string())
    }
}

/// The two parties of a swap. The initiator picks the secret and locks
/// first with the longer timelock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Derive the initiator's swap secret.
///
/// Deterministic so that a restarted daemon can regenerate the secret
/// from the bootload password; neither the secret nor the password is
/// ever persisted.
pub fn derive_secret(password: &str, id: &SwapId) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(password.as_bytes());
    hasher.update(id.as_str().as_bytes());
    hasher.finalize().into()
}

/// SHA-256 of a secret: the lock hash published on-chain.
pub fn hash_secret(secret: &[u8; 32]) -> [u8; 32] {
    Sha256::digest(secret).into()
}

/// Encode a 32-byte secret hash for transport in a blob.
pub fn encode_secret_hash(hash: &[u8; 32]) -> String {
    STANDARD.encode(hash)
}

/// Decode a blob's secret hash; anything but 32 bytes is rejected.
pub fn decode_secret_hash(encoded: &str) -> Result<[u8; 32]> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| Error::InvalidSecretHash)?;
    bytes.try_into().map_err(|_| Error::InvalidSecretHash)
}

/// User-visible swap progress.
///
/// Initiator path:
///   inactive → initiated → audited → redeemed
/// Responder path:
///   inactive → audited → initiated → redeemed_by_secret
///
/// Fallbacks land in `refunded` (own lock reclaimed), `failed` (permanent
/// chain error), `expired` (counterparty never appeared) or `cancelled`
/// (delayed swap never resolved). Terminal states absorb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    #[default]
    Inactive,
    Initiated,
    Audited,
    Redeemed,
    RedeemedBySecret,
    Refunded,
    Failed,
    Expired,
    Cancelled,
}

impl SwapStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SwapStatus::Redeemed
                | SwapStatus::RedeemedBySecret
                | SwapStatus::Refunded
                | SwapStatus::Failed
                | SwapStatus::Expired
                | SwapStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` follows the state diagram
    /// (union of both role paths).
    pub fn can_advance_to(self, next: SwapStatus) -> bool {
        use SwapStatus::*;
        if self.is_terminal() || self == next {
            return false;
        }
        match (self, next) {
            (Inactive, Initiated) | (Inactive, Audited) => true,
            // Initiator audits after locking; the responder locks after
            // auditing.
            (Initiated, Audited) | (Audited, Initiated) => true,
            (Audited, Redeemed) => true,
            (Initiated, RedeemedBySecret) => true,
            (_, Refunded) | (_, Failed) | (_, Expired) | (_, Cancelled) => true,
            _ => false,
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A user-supplied swap intent, persisted until the swap terminates.
///
/// Amounts are decimal integer strings in the token's smallest unit. The
/// clear `password` travels only in memory; persisted copies carry the
/// bcrypt `password_hash` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SwapBlob {
    pub id: SwapId,
    pub send_token: String,
    pub receive_token: String,

    pub send_amount: String,
    pub receive_amount: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub minimum_receive_amount: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub send_fee: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub receive_fee: String,

    pub send_to: String,
    pub receive_from: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub withdraw_address: String,
    pub time_lock: i64,
    pub secret_hash: String,
    pub should_initiate_first: bool,

    #[serde(skip_serializing_if = "is_false")]
    pub delay: bool,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub delay_info: serde_json::Value,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub delay_callback_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub response_url: String,

    /// Broker fee in basis points (1/10000).
    pub broker_fee: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub broker_send_token_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub broker_receive_token_addr: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password_hash: String,
}

impl SwapBlob {
    /// The role this daemon plays in the swap.
    pub fn role(&self) -> Role {
        if self.should_initiate_first {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    /// Copy with the clear password stripped, safe to persist.
    pub fn sanitized(&self) -> SwapBlob {
        let mut blob = self.clone();
        blob.password.clear();
        blob
    }

    /// Derive the `(send, receive)` HTLC sides this party drives.
    ///
    /// `time_lock` is always the initiator's lock; the responder's side
    /// expires one expiry unit earlier on whichever side the responder
    /// funds.
    pub fn htlc_sides(&self) -> Result<(Htlc, Htlc)> {
        let send_token = Token::from_name(&self.send_token)?;
        let receive_token = Token::from_name(&self.receive_token)?;
        let secret_hash = decode_secret_hash(&self.secret_hash)?;
        let send_value = parse_amount(&self.send_amount)?;
        let receive_value = parse_amount(&self.receive_amount)?;

        let (send_lock, receive_lock) = match self.role() {
            Role::Initiator => (self.time_lock, self.time_lock - EXPIRY_UNIT),
            Role::Responder => (self.time_lock - EXPIRY_UNIT, self.time_lock),
        };

        let send = Htlc {
            id: self.id.clone(),
            token: send_token,
            value: send_value,
            broker_fee: broker_fee(send_value, self.broker_fee),
            broker_address: self.broker_send_token_addr.clone(),
            secret_hash,
            time_lock: send_lock,
            counterparty: self.send_to.clone(),
            withdraw_address: None,
        };
        let receive = Htlc {
            id: self.id.clone(),
            token: receive_token,
            value: receive_value,
            broker_fee: broker_fee(receive_value, self.broker_fee),
            broker_address: self.broker_receive_token_addr.clone(),
            secret_hash,
            time_lock: receive_lock,
            counterparty: self.receive_from.clone(),
            withdraw_address: if self.withdraw_address.is_empty() {
                None
            } else {
                Some(self.withdraw_address.clone())
            },
        };
        Ok((send, receive))
    }
}

/// Broker fee in basis points, truncated toward zero.
fn broker_fee(value: Decimal, bips: i64) -> Decimal {
    (value * Decimal::from(bips) / Decimal::from(10_000_i64)).trunc()
}

/// One party's HTLC terms on a single chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Htlc {
    pub id: SwapId,
    pub token: Token,
    pub value: Decimal,
    pub broker_fee: Decimal,
    pub broker_address: String,
    pub secret_hash: [u8; 32],
    /// Absolute UNIX expiry of this side's lock.
    pub time_lock: i64,
    /// Counterparty address allowed to claim this lock (send side) or
    /// expected to have funded it (receive side).
    pub counterparty: String,
    /// Sweep destination after redemption, receive side only.
    pub withdraw_address: Option<String>,
}

/// User-visible status record for a swap. Outlives the pending-swap
/// entry; the `password_hash` scopes reads to the submitting account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SwapReceipt {
    pub id: SwapId,
    pub send_token: String,
    pub receive_token: String,
    pub send_amount: String,
    pub receive_amount: String,
    pub send_cost: Cost,
    pub receive_cost: Cost,
    pub timestamp: i64,
    pub status: SwapStatus,
    /// Whether a state machine for this swap is live in this process.
    pub active: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub delay: bool,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub delay_info: serde_json::Value,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password_hash: String,
}

impl SwapReceipt {
    /// Fresh receipt for a newly accepted blob.
    pub fn new(blob: &SwapBlob, now: i64) -> SwapReceipt {
        SwapReceipt {
            id: blob.id.clone(),
            send_token: blob.send_token.clone(),
            receive_token: blob.receive_token.clone(),
            send_amount: blob.send_amount.clone(),
            receive_amount: blob.receive_amount.clone(),
            send_cost: Cost::new(),
            receive_cost: Cost::new(),
            timestamp: now,
            status: SwapStatus::Inactive,
            active: true,
            delay: blob.delay,
            delay_info: blob.delay_info.clone(),
            password_hash: blob.password_hash.clone(),
        }
    }

    /// Monotonic status advance; out-of-order and post-terminal moves are
    /// ignored. Returns whether the status changed.
    pub fn advance(&mut self, next: SwapStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// A mutation of one receipt, applied both by the status registry and by
/// storage under the per-id lock.
#[derive(Clone)]
pub struct ReceiptUpdate {
    id: SwapId,
    mutate: Arc<dyn Fn(&mut SwapReceipt) + Send + Sync>,
}

impl ReceiptUpdate {
    pub fn new(id: SwapId, mutate: impl Fn(&mut SwapReceipt) + Send + Sync + 'static) -> Self {
        ReceiptUpdate {
            id,
            mutate: Arc::new(mutate),
        }
    }

    /// Update that advances the status monotonically.
    pub fn status(id: SwapId, status: SwapStatus) -> Self {
        ReceiptUpdate::new(id, move |receipt| {
            receipt.advance(status);
        })
    }

    pub fn id(&self) -> &SwapId {
        &self.id
    }

    pub fn apply(&self, receipt: &mut SwapReceipt) {
        (self.mutate)(receipt)
    }
}

impl fmt::Debug for ReceiptUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiptUpdate")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn initiator_blob() -> SwapBlob {
        SwapBlob {
            id: SwapId::from("test-swap"),
            send_token: "BTC".to_string(),
            receive_token: "ETH".to_string(),
            send_amount: "100000".to_string(),
            receive_amount: "2000000000000000000".to_string(),
            send_to: "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2".to_string(),
            receive_from: "0xC4323499B809fa8bF421970D9662D37804F23852".to_string(),
            time_lock: 1_021_600,
            secret_hash: encode_secret_hash(&[7u8; 32]),
            should_initiate_first: true,
            ..SwapBlob::default()
        }
    }

    #[test]
    fn test_secret_derivation_is_deterministic() {
        let id = SwapId::from("id-1");
        let secret = derive_secret("pw", &id);
        assert_eq!(secret, derive_secret("pw", &id));
        assert_ne!(secret, derive_secret("pw2", &id));
        assert_ne!(secret, derive_secret("pw", &SwapId::from("id-2")));
        assert_eq!(hash_secret(&secret), hash_secret(&secret));
    }

    #[test]
    fn test_secret_hash_round_trip() {
        let hash = hash_secret(&[9u8; 32]);
        let encoded = encode_secret_hash(&hash);
        assert_eq!(decode_secret_hash(&encoded).unwrap(), hash);
        assert!(decode_secret_hash("c2hvcnQ").is_err());
        assert!(decode_secret_hash("!!!").is_err());
    }

    #[test]
    fn test_random_ids_are_unique() {
        let a = SwapId::random();
        let b = SwapId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 43);
    }

    #[test]
    fn test_status_transitions() {
        use SwapStatus::*;
        // initiator path
        assert!(Inactive.can_advance_to(Initiated));
        assert!(Initiated.can_advance_to(Audited));
        assert!(Audited.can_advance_to(Redeemed));
        // responder path
        assert!(Inactive.can_advance_to(Audited));
        assert!(Audited.can_advance_to(Initiated));
        assert!(Initiated.can_advance_to(RedeemedBySecret));
        // fallbacks from any live state
        assert!(Initiated.can_advance_to(Refunded));
        assert!(Inactive.can_advance_to(Cancelled));
        assert!(Audited.can_advance_to(Expired));
        // terminal states absorb
        assert!(!Redeemed.can_advance_to(Refunded));
        assert!(!Refunded.can_advance_to(Initiated));
        assert!(!Cancelled.can_advance_to(Failed));
        // no skipping ahead
        assert!(!Inactive.can_advance_to(Redeemed));
        assert!(!Initiated.can_advance_to(Redeemed));
    }

    #[test]
    fn test_receipt_advance_is_monotonic() {
        let mut receipt = SwapReceipt::new(&initiator_blob(), 1_000_000);
        assert!(receipt.advance(SwapStatus::Initiated));
        assert!(receipt.advance(SwapStatus::Audited));
        assert!(!receipt.advance(SwapStatus::Initiated));
        assert!(receipt.advance(SwapStatus::Redeemed));
        assert!(!receipt.advance(SwapStatus::Refunded));
        assert_eq!(receipt.status, SwapStatus::Redeemed);
    }

    #[test]
    fn test_blob_json_round_trip() {
        let mut blob = initiator_blob();
        blob.broker_fee = 25;
        blob.broker_send_token_addr = "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2".to_string();
        blob.delay_info = serde_json::json!({"order": 42});
        let encoded = serde_json::to_string(&blob).unwrap();
        let decoded: SwapBlob = serde_json::from_str(&encoded).unwrap();
        assert_eq!(blob, decoded);
        assert_eq!(encoded, serde_json::to_string(&decoded).unwrap());
    }

    #[test]
    fn test_blob_never_serializes_clear_password() {
        let mut blob = initiator_blob();
        blob.password = "hunter2".to_string();
        let sanitized = blob.sanitized();
        assert!(sanitized.password.is_empty());
        let encoded = serde_json::to_string(&sanitized).unwrap();
        assert!(!encoded.contains("hunter2"));
    }

    #[test]
    fn test_htlc_sides_initiator_timelocks() {
        let (send, receive) = initiator_blob().htlc_sides().unwrap();
        assert_eq!(send.time_lock, 1_021_600);
        assert_eq!(receive.time_lock, 1_021_600 - EXPIRY_UNIT);
        assert_eq!(send.token, Token::BTC);
        assert_eq!(receive.token, Token::ETH);
        assert_eq!(send.value, dec!(100000));
        assert_eq!(receive.withdraw_address, None);
    }

    #[test]
    fn test_htlc_sides_responder_timelocks() {
        let mut blob = initiator_blob();
        blob.should_initiate_first = false;
        blob.withdraw_address = "0xC4323499B809fa8bF421970D9662D37804F23852".to_string();
        let (send, receive) = blob.htlc_sides().unwrap();
        assert_eq!(send.time_lock, 1_021_600 - EXPIRY_UNIT);
        assert_eq!(receive.time_lock, 1_021_600);
        assert_eq!(
            receive.withdraw_address.as_deref(),
            Some("0xC4323499B809fa8bF421970D9662D37804F23852")
        );
    }

    #[test]
    fn test_broker_fee_truncates_toward_zero() {
        let mut blob = initiator_blob();
        blob.broker_fee = 3;
        blob.send_amount = "12345".to_string();
        let (send, _) = blob.htlc_sides().unwrap();
        // 12345 * 3 / 10000 = 3.7035
        assert_eq!(send.broker_fee, dec!(3));
    }

    #[test]
    fn test_receipt_update_applies_by_closure() {
        let mut receipt = SwapReceipt::new(&initiator_blob(), 1_000_000);
        let update = ReceiptUpdate::new(receipt.id.clone(), |r| {
            r.active = false;
        });
        update.apply(&mut receipt);
        assert!(!receipt.active);
        let status = ReceiptUpdate::status(receipt.id.clone(), SwapStatus::Initiated);
        status.apply(&mut receipt);
        assert_eq!(receipt.status, SwapStatus::Initiated);
    }
}
