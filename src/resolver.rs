//! Delayed-swap resolver task.
//!
//! A delayed swap arrives with its counterparty details blank; an
//! external decision oracle owns them. The resolver keeps such swaps
//! parked, asks the oracle on every tick, validates the answer and
//! promotes the completed blob back to the supervisor as an ordinary
//! swap request. Retries are bounded by the swap's derived timelock:
//! past it the swap is cancelled.

use crate::callback::DelayCallback;
use crate::error::{Error, Result};
use crate::supervisor::Message;
use crate::swap::{EXPIRY_UNIT, ReceiptUpdate, SwapBlob, SwapId, SwapStatus, decode_secret_hash};
use crate::types::parse_amount;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Messages accepted by the resolver.
#[derive(Debug)]
pub enum ResolverMessage {
    /// Park a delayed swap until the oracle completes it.
    Swap(SwapBlob),
    /// Poll the oracle for every parked swap.
    Tick { now: i64 },
}

/// Spawn the resolver task; returns the sender its messages arrive on.
pub fn spawn<C: DelayCallback + 'static>(
    cap: usize,
    callback: Arc<C>,
    out: mpsc::Sender<Message>,
    mut done: watch::Receiver<bool>,
) -> mpsc::Sender<ResolverMessage> {
    let (tx, mut rx) = mpsc::channel(cap);
    tokio::spawn(async move {
        let mut pending: HashMap<SwapId, SwapBlob> = HashMap::new();
        loop {
            tokio::select! {
                _ = done.changed() => break,
                msg = rx.recv() => match msg {
                    Some(ResolverMessage::Swap(blob)) => {
                        log::info!("swap {}: parked until the delay oracle answers", blob.id);
                        pending.insert(blob.id.clone(), blob);
                    }
                    Some(ResolverMessage::Tick { now }) => {
                        poll(&mut pending, callback.as_ref(), &out, now).await;
                    }
                    None => break,
                },
            }
        }
        log::debug!("delayed-swap resolver shut down");
    });
    tx
}

async fn poll(
    pending: &mut HashMap<SwapId, SwapBlob>,
    callback: &dyn DelayCallback,
    out: &mpsc::Sender<Message>,
    now: i64,
) {
    let ids: Vec<SwapId> = pending.keys().cloned().collect();
    for id in ids {
        let Some(blob) = pending.get(&id) else {
            continue;
        };

        if now >= blob.time_lock {
            log::warn!("swap {}: delay oracle never answered; cancelling", id);
            let _ = out
                .send(Message::ReceiptUpdate(ReceiptUpdate::new(
                    id.clone(),
                    |r| {
                        r.advance(SwapStatus::Cancelled);
                        r.active = false;
                    },
                )))
                .await;
            let _ = out.send(Message::DeleteSwap(id.clone())).await;
            pending.remove(&id);
            continue;
        }

        match callback.delay_callback(blob).await {
            Ok(filled) => match promote(blob, filled, now) {
                Ok(promoted) => {
                    log::info!("swap {}: promoted by the delay oracle", id);
                    let _ = out.send(Message::SwapRequest(promoted)).await;
                    pending.remove(&id);
                }
                Err(err) => {
                    log::error!("swap {}: rejected oracle answer: {}", id, err);
                    let _ = out.send(Message::Error(err)).await;
                }
            },
            Err(err) => {
                log::debug!("swap {}: delay oracle not ready: {}", id, err);
            }
        }
    }
}

/// Validate the oracle's answer against the user's original intent and
/// build the executable blob. The oracle fills counterparty and role
/// fields; it must not touch what the user committed to.
fn promote(original: &SwapBlob, mut filled: SwapBlob, now: i64) -> Result<SwapBlob> {
    if filled.send_token != original.send_token || filled.receive_token != original.receive_token {
        return Err(Error::Promotion("oracle changed the token pair".to_string()));
    }

    let offered = parse_amount(&original.send_amount)?;
    if parse_amount(&filled.send_amount)? > offered {
        return Err(Error::Promotion(
            "oracle increased the send amount".to_string(),
        ));
    }

    let floor = if original.minimum_receive_amount.is_empty() {
        parse_amount(&original.receive_amount)?
    } else {
        parse_amount(&original.minimum_receive_amount)?
    };
    if parse_amount(&filled.receive_amount)? < floor {
        return Err(Error::Promotion(
            "receive amount below the agreed floor".to_string(),
        ));
    }

    if filled.should_initiate_first {
        // Our secret, our timelock: both were derived at preparation.
        if filled.secret_hash != original.secret_hash {
            return Err(Error::Promotion(
                "oracle changed the secret hash".to_string(),
            ));
        }
        filled.time_lock = original.time_lock;
    } else {
        decode_secret_hash(&filled.secret_hash)?;
        if now + 2 * EXPIRY_UNIT > filled.time_lock {
            return Err(Error::NotEnoughTime);
        }
    }

    filled.id = original.id.clone();
    filled.delay = false;
    filled.delay_info = original.delay_info.clone();
    filled.delay_callback_url = original.delay_callback_url.clone();
    filled.password = original.password.clone();
    filled.password_hash = original.password_hash.clone();
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{derive_secret, encode_secret_hash, hash_secret};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const NOW: i64 = 1_000_000;

    fn delayed_blob() -> SwapBlob {
        let id = SwapId::from("delayed");
        let secret = derive_secret("pw", &id);
        SwapBlob {
            id,
            send_token: "BTC".to_string(),
            receive_token: "ETH".to_string(),
            send_amount: "100000".to_string(),
            receive_amount: "2000000000000000000".to_string(),
            minimum_receive_amount: "1900000000000000000".to_string(),
            time_lock: NOW + 3 * EXPIRY_UNIT,
            secret_hash: encode_secret_hash(&hash_secret(&secret)),
            should_initiate_first: true,
            delay: true,
            delay_info: serde_json::json!({"message": {"order": 7}, "signature": "sig"}),
            delay_callback_url: "http://oracle.example/swaps".to_string(),
            password: "pw".to_string(),
            password_hash: "$2b$04$stub".to_string(),
            ..SwapBlob::default()
        }
    }

    fn oracle_answer() -> SwapBlob {
        let mut filled = delayed_blob();
        filled.id = SwapId::from("oracle-renamed");
        filled.send_to = "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2".to_string();
        filled.receive_from = "0xC4323499B809fa8bF421970D9662D37804F23852".to_string();
        filled.receive_amount = "1950000000000000000".to_string();
        filled.delay = false;
        filled.password.clear();
        filled.password_hash.clear();
        filled
    }

    /// Oracle stub answering from a script of results.
    struct StubCallback {
        answers: Mutex<Vec<Result<SwapBlob>>>,
    }

    #[async_trait]
    impl DelayCallback for StubCallback {
        async fn delay_callback(&self, _blob: &SwapBlob) -> Result<SwapBlob> {
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                Err(Error::Network("oracle has no answer yet".to_string()))
            } else {
                answers.remove(0)
            }
        }
    }

    #[test]
    fn test_promote_keeps_user_commitments() {
        let original = delayed_blob();
        let promoted = promote(&original, oracle_answer(), NOW).unwrap();
        assert_eq!(promoted.id, original.id);
        assert!(!promoted.delay);
        assert_eq!(promoted.password, "pw");
        assert_eq!(promoted.password_hash, original.password_hash);
        assert_eq!(promoted.secret_hash, original.secret_hash);
        assert_eq!(promoted.time_lock, original.time_lock);
        assert_eq!(promoted.delay_info, original.delay_info);
    }

    #[test]
    fn test_promote_rejects_bad_answers() {
        let original = delayed_blob();

        let mut wrong_pair = oracle_answer();
        wrong_pair.receive_token = "WBTC".to_string();
        assert!(matches!(
            promote(&original, wrong_pair, NOW),
            Err(Error::Promotion(_))
        ));

        let mut too_expensive = oracle_answer();
        too_expensive.send_amount = "100001".to_string();
        assert!(matches!(
            promote(&original, too_expensive, NOW),
            Err(Error::Promotion(_))
        ));

        let mut underfilled = oracle_answer();
        underfilled.receive_amount = "1000000000000000000".to_string();
        assert!(matches!(
            promote(&original, underfilled, NOW),
            Err(Error::Promotion(_))
        ));

        let mut new_hash = oracle_answer();
        new_hash.secret_hash = encode_secret_hash(&[1u8; 32]);
        assert!(matches!(
            promote(&original, new_hash, NOW),
            Err(Error::Promotion(_))
        ));
    }

    #[test]
    fn test_promote_responder_answer_needs_margin() {
        let original = delayed_blob();
        let mut as_responder = oracle_answer();
        as_responder.should_initiate_first = false;
        as_responder.secret_hash = encode_secret_hash(&[2u8; 32]);
        as_responder.time_lock = NOW + 3600;
        assert!(matches!(
            promote(&original, as_responder.clone(), NOW),
            Err(Error::NotEnoughTime)
        ));

        as_responder.time_lock = NOW + 3 * EXPIRY_UNIT;
        promote(&original, as_responder, NOW).unwrap();
    }

    #[tokio::test]
    async fn test_resolver_promotes_when_oracle_answers() {
        let (_done_tx, done) = watch::channel(false);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let callback = Arc::new(StubCallback {
            answers: Mutex::new(vec![
                Err(Error::Network("busy".to_string())),
                Ok(oracle_answer()),
            ]),
        });
        let resolver = spawn(16, callback, out_tx, done);

        resolver
            .send(ResolverMessage::Swap(delayed_blob()))
            .await
            .unwrap();
        resolver.send(ResolverMessage::Tick { now: NOW }).await.unwrap();
        resolver
            .send(ResolverMessage::Tick { now: NOW + 30 })
            .await
            .unwrap();

        let msg = out_rx.recv().await.unwrap();
        match msg {
            Message::SwapRequest(blob) => {
                assert_eq!(blob.id, SwapId::from("delayed"));
                assert!(!blob.delay);
                assert_eq!(blob.password, "pw");
            }
            other => panic!("expected a swap request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolver_cancels_at_timelock() {
        let (_done_tx, done) = watch::channel(false);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let callback = Arc::new(StubCallback {
            answers: Mutex::new(Vec::new()),
        });
        let resolver = spawn(16, callback, out_tx, done);

        let blob = delayed_blob();
        let deadline = blob.time_lock;
        resolver.send(ResolverMessage::Swap(blob)).await.unwrap();
        resolver
            .send(ResolverMessage::Tick { now: deadline })
            .await
            .unwrap();

        let mut receipt = crate::swap::SwapReceipt::new(&delayed_blob(), NOW);
        let update = match out_rx.recv().await.unwrap() {
            Message::ReceiptUpdate(update) => update,
            other => panic!("expected a receipt update, got {:?}", other),
        };
        update.apply(&mut receipt);
        assert_eq!(receipt.status, SwapStatus::Cancelled);
        assert!(!receipt.active);
        assert!(matches!(
            out_rx.recv().await.unwrap(),
            Message::DeleteSwap(_)
        ));
    }
}
