//! HTTP callback clients: the delayed-swap decision oracle and the
//! initiator's swap-response notification.

use crate::error::{Error, Result};
use crate::swap::SwapBlob;
use async_trait::async_trait;

/// Decision oracle for delayed swaps.
///
/// Implementations complete a partially-specified blob with the
/// counterparty details. Errors are retried by the resolver on every
/// tick until the swap's timelock elapses.
#[async_trait]
pub trait DelayCallback: Send + Sync {
    async fn delay_callback(&self, blob: &SwapBlob) -> Result<SwapBlob>;
}

/// Oracle client POSTing the signed delay info to the blob's callback
/// URL and parsing the completed blob from the response body.
#[derive(Debug, Clone, Default)]
pub struct HttpDelayCallback {
    client: reqwest::Client,
}

impl HttpDelayCallback {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DelayCallback for HttpDelayCallback {
    async fn delay_callback(&self, blob: &SwapBlob) -> Result<SwapBlob> {
        let url = &blob.delay_callback_url;
        if url.is_empty() {
            return Err(Error::Validation(
                "delay callback url cannot be empty".to_string(),
            ));
        }

        let response = self
            .client
            .post(url)
            .json(&blob.delay_info)
            .send()
            .await
            .map_err(|e| Error::Network(format!("failed to reach delay oracle {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "delay oracle {} returned {}",
                url,
                response.status()
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("failed to read oracle response: {}", e)))?;

        log::debug!("POST {} response: {}", url, text);

        serde_json::from_str(&text).map_err(|e| {
            Error::Parse(format!(
                "failed to parse oracle response: {}. Body: {}",
                e, text
            ))
        })
    }
}

/// POST an initiator's swap response to the counterparty's response URL.
/// Any non-2xx status aborts the swap submission.
pub async fn post_swap_response<T: serde::Serialize>(url: &str, response: &T) -> Result<()> {
    let client = reqwest::Client::new();
    let reply = client
        .post(url)
        .json(response)
        .send()
        .await
        .map_err(|e| Error::Network(format!("failed to post swap response to {}: {}", url, e)))?;

    let status = reply.status();
    if !status.is_success() {
        let body = reply.text().await.unwrap_or_default();
        return Err(Error::Network(format!(
            "unexpected status {} while posting to the response url: {}",
            status, body
        )));
    }
    Ok(())
}
