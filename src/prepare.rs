//! Request preparation: validation, identifier and secret derivation,
//! and symmetric response construction for initiator/responder pairing.
//!
//! Everything here runs before a blob reaches the supervisor; a blob
//! that fails preparation never exists as a swap.

use crate::callback;
use crate::error::{Error, Result};
use crate::swap::{
    EXPIRY_UNIT, SwapBlob, SwapId, decode_secret_hash, derive_secret, encode_secret_hash,
    hash_secret,
};
use crate::types::{Token, parse_amount};
use crate::wallet::{Signer, Wallet};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Response returned to an immediate-swap submitter. Initiators also get
/// the mirrored blob and its signature to forward to the counterparty;
/// responders only learn the id.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SwapResponse {
    pub id: SwapId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<SwapBlob>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

/// Validates and normalizes swap submissions.
pub struct Preparer<W: Wallet> {
    wallet: W,
    signer: Signer,
}

impl<W: Wallet> Preparer<W> {
    pub fn new(wallet: W, signer: Signer) -> Self {
        Preparer { wallet, signer }
    }

    pub fn wallet(&self) -> &W {
        &self.wallet
    }

    /// Validate and normalize an immediate swap.
    ///
    /// Assigns the id and bcrypt password hash; derives the secret hash
    /// and timelock for initiators; enforces the two-expiry-unit margin
    /// for responders.
    pub async fn prepare_swap(&self, mut blob: SwapBlob, now: i64) -> Result<SwapBlob> {
        let send_token = Token::from_name(&blob.send_token)?;
        let receive_token = Token::from_name(&blob.receive_token)?;

        send_token.verify_address(&blob.send_to)?;
        receive_token.verify_address(&blob.receive_from)?;
        if !blob.withdraw_address.is_empty() {
            receive_token.verify_address(&blob.withdraw_address)?;
        }

        self.verify_send_amount(&send_token, &blob.send_amount)
            .await?;
        self.verify_receive_amount(&receive_token, &blob.receive_amount)
            .await?;

        blob.id = SwapId::random();
        blob.password_hash = bcrypt::hash(&blob.password, bcrypt::DEFAULT_COST)?;

        if blob.should_initiate_first {
            blob.time_lock = now + 3 * EXPIRY_UNIT;
            let secret = derive_secret(&blob.password, &blob.id);
            blob.secret_hash = encode_secret_hash(&hash_secret(&secret));
            return Ok(blob);
        }

        decode_secret_hash(&blob.secret_hash)?;
        if now + 2 * EXPIRY_UNIT > blob.time_lock {
            return Err(Error::NotEnoughTime);
        }
        Ok(blob)
    }

    /// Validate a delayed swap and sign its delay info.
    ///
    /// Counterparty addresses are unknown until the oracle answers, so
    /// only tokens, amounts and balance are checked here. The swap is
    /// prepared as an initiator: the oracle cannot choose our secret.
    pub async fn prepare_delayed_swap(&self, mut blob: SwapBlob, now: i64) -> Result<SwapBlob> {
        if blob.delay_callback_url.is_empty() {
            return Err(Error::Validation(
                "delay callback url cannot be empty".to_string(),
            ));
        }

        let send_token = Token::from_name(&blob.send_token)?;
        let receive_token = Token::from_name(&blob.receive_token)?;
        self.verify_send_amount(&send_token, &blob.send_amount)
            .await?;
        self.verify_receive_amount(&receive_token, &blob.receive_amount)
            .await?;

        blob.id = SwapId::random();
        blob.password_hash = bcrypt::hash(&blob.password, bcrypt::DEFAULT_COST)?;
        blob.delay = true;
        blob.time_lock = now + 3 * EXPIRY_UNIT;
        let secret = derive_secret(&blob.password, &blob.id);
        blob.secret_hash = encode_secret_hash(&hash_secret(&secret));

        blob.delay_info = self.sign_delay_info(&blob.delay_info)?;
        Ok(blob)
    }

    /// Build the mirrored response blob for the counterparty and sign
    /// it. If the submitter supplied a response URL the response is
    /// POSTed there; a non-2xx answer aborts the submission.
    pub async fn build_response(&self, blob: &SwapBlob) -> Result<SwapResponse> {
        let mut mirrored = SwapBlob {
            send_token: blob.receive_token.clone(),
            receive_token: blob.send_token.clone(),
            send_amount: blob.receive_amount.clone(),
            receive_amount: blob.send_amount.clone(),
            secret_hash: blob.secret_hash.clone(),
            time_lock: blob.time_lock,
            broker_fee: blob.broker_fee,
            broker_send_token_addr: blob.broker_receive_token_addr.clone(),
            broker_receive_token_addr: blob.broker_send_token_addr.clone(),
            ..SwapBlob::default()
        };

        let their_send_token = Token::from_name(&mirrored.send_token)?;
        let their_receive_token = Token::from_name(&mirrored.receive_token)?;
        mirrored.send_to = self.wallet.address(their_send_token.chain)?;
        mirrored.receive_from = self.wallet.address(their_receive_token.chain)?;

        let encoded = serde_json::to_vec(&mirrored)?;
        let signature = STANDARD.encode(self.signer.sign(&encoded)?);

        let mut response = SwapResponse {
            id: blob.id.clone(),
            swap: None,
            signature: String::new(),
        };
        if blob.should_initiate_first {
            response.swap = Some(mirrored);
            response.signature = signature;
        }

        if !blob.response_url.is_empty() {
            callback::post_swap_response(&blob.response_url, &response).await?;
        }
        Ok(response)
    }

    /// Wrap the raw delay info as `{message, signature}` so the oracle
    /// can verify who asked.
    fn sign_delay_info(&self, info: &serde_json::Value) -> Result<serde_json::Value> {
        let message = serde_json::to_vec(info)?;
        let signature = self.signer.sign(&message)?;
        Ok(serde_json::json!({
            "message": info,
            "signature": STANDARD.encode(signature),
        }))
    }

    async fn verify_send_amount(&self, token: &Token, amount: &str) -> Result<()> {
        let value = parse_amount(amount)?;
        self.wallet.verify_balance(token, Some(value)).await
    }

    async fn verify_receive_amount(&self, token: &Token, amount: &str) -> Result<()> {
        let value = parse_amount(amount)?;
        if value <= Decimal::ZERO {
            return Err(Error::InvalidAmount(
                "receive amount must be positive".to_string(),
            ));
        }
        self.wallet.verify_balance(token, None).await
    }
}
