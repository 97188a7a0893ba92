//! HTTP relay implementation of the chain gateway.
//!
//! The daemon does not embed a chain SDK. It talks JSON over HTTPS to a
//! relay that owns transaction signing and nonce sequencing; one POST per
//! gateway operation. Keeping nonce ordering inside the relay is what allows
//! reconciliations for different weeks to run concurrently without callers
//! coordinating.
//!
//! # Failure mapping
//!
//! - transport errors, 5xx, malformed bodies -> [`ChainError::Unavailable`]
//! - 401 / 403 -> [`ChainError::Authorization`]
//! - relay-reported revert (`revert_reason` in the body) -> [`ChainError::Revert`]

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{
    ChainClient, ChainError, ConfirmStatus, PlayerRecord, ScoreEntry, SignerCheck, TxHandle,
};

/// Maximum length for configuration string fields.
const MAX_CONFIG_STRING_LENGTH: usize = 2048;

/// How often the confirm loop re-polls the relay for transaction status.
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Relay client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcChainConfig {
    /// Relay base URL, e.g. `https://relay.example.net`.
    pub endpoint: String,

    /// The address this process signs with. Compared against the contract's
    /// authorized writer by [`ChainClient::verify_signer`].
    pub signer_address: String,

    /// Bearer token for the relay, if it requires one.
    #[serde(default)]
    pub api_token: Option<String>,
}

impl RpcChainConfig {
    /// Validates field lengths and presence.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Unavailable`] describing the offending field.
    /// Validation failures are configuration bugs caught at startup, before
    /// any request is made.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.endpoint.is_empty() {
            return Err(ChainError::Unavailable(
                "relay endpoint must not be empty".to_string(),
            ));
        }
        if self.signer_address.is_empty() {
            return Err(ChainError::Unavailable(
                "signer address must not be empty".to_string(),
            ));
        }
        for (name, value) in [
            ("endpoint", &self.endpoint),
            ("signer_address", &self.signer_address),
        ] {
            if value.len() > MAX_CONFIG_STRING_LENGTH {
                return Err(ChainError::Unavailable(format!(
                    "{name} exceeds maximum length ({} > {MAX_CONFIG_STRING_LENGTH})",
                    value.len()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CurrentWeekResponse {
    week: u64,
}

#[derive(Debug, Deserialize)]
struct PlayerRecordResponse {
    score: u64,
    present: bool,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    tx: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
enum TxStatusResponse {
    Pending,
    Success,
    Reverted {
        #[serde(default)]
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct AuthorizedWriterResponse {
    address: String,
}

#[derive(Debug, Deserialize)]
struct RelayErrorBody {
    #[serde(default)]
    revert_reason: Option<String>,
    #[serde(default)]
    authorized_address: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// JSON-over-HTTPS chain gateway talking to a signing relay.
pub struct RpcChainClient {
    config: RpcChainConfig,
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl RpcChainClient {
    /// Creates a relay client.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Unavailable`] if the configuration is invalid.
    pub fn new(config: RpcChainConfig) -> Result<Self, ChainError> {
        config.validate()?;

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self { config, client })
    }

    /// The configured signer address.
    #[must_use]
    pub fn signer_address(&self) -> &str {
        &self.config.signer_address
    }

    /// POSTs `body` to `{endpoint}/v1/{method}` and returns the response
    /// body on success.
    async fn post(&self, method: &str, body: &serde_json::Value) -> Result<Bytes, ChainError> {
        let url = format!(
            "{}/v1/{method}",
            self.config.endpoint.trim_end_matches('/')
        );
        let body_bytes =
            serde_json::to_vec(body).map_err(|e| ChainError::Unavailable(e.to_string()))?;

        let mut request = Request::builder()
            .method("POST")
            .uri(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("User-Agent", "tally-daemon/0.1");
        if let Some(token) = &self.config.api_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let request = request
            .body(Full::new(Bytes::from(body_bytes)))
            .map_err(|e| ChainError::Unavailable(e.to_string()))?;

        debug!(url = %url, "posting relay request");

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ChainError::Unavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map(http_body_util::Collected::to_bytes)
            .map_err(|e| ChainError::Unavailable(e.to_string()))?;

        if status.is_success() {
            return Ok(body);
        }

        let parsed: RelayErrorBody = serde_json::from_slice(&body).unwrap_or(RelayErrorBody {
            revert_reason: None,
            authorized_address: None,
            message: None,
        });

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ChainError::Authorization {
                configured: self.config.signer_address.clone(),
                authorized: parsed
                    .authorized_address
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }

        if let Some(reason) = parsed.revert_reason {
            return Err(ChainError::Revert { reason });
        }

        Err(ChainError::Unavailable(
            parsed
                .message
                .unwrap_or_else(|| format!("relay returned HTTP {status}")),
        ))
    }

    fn decode<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ChainError> {
        serde_json::from_slice(body)
            .map_err(|e| ChainError::Unavailable(format!("malformed relay response: {e}")))
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn current_week(&self) -> Result<u64, ChainError> {
        let body = self.post("current_week", &json!({})).await?;
        let parsed: CurrentWeekResponse = Self::decode(&body)?;
        Ok(parsed.week)
    }

    async fn player_record(&self, player: &str, week: u64) -> Result<PlayerRecord, ChainError> {
        let body = self
            .post("player_record", &json!({ "player": player, "week": week }))
            .await?;
        let parsed: PlayerRecordResponse = Self::decode(&body)?;
        Ok(PlayerRecord {
            score: parsed.score,
            present: parsed.present,
        })
    }

    async fn submit_score_batch(
        &self,
        week: u64,
        entries: &[ScoreEntry],
    ) -> Result<TxHandle, ChainError> {
        let body = self
            .post(
                "submit_score_batch",
                &json!({
                    "week": week,
                    "signer": self.config.signer_address,
                    "entries": entries,
                }),
            )
            .await?;
        let parsed: SubmitResponse = Self::decode(&body)?;
        Ok(TxHandle(parsed.tx))
    }

    async fn confirm_transaction(
        &self,
        handle: &TxHandle,
        timeout: Duration,
    ) -> Result<ConfirmStatus, ChainError> {
        // Poll until mined or the timeout budget is spent. The timeout does
        // not cancel the transaction; the caller re-checks on TimedOut.
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let body = self.post("tx_status", &json!({ "tx": handle.0 })).await?;
            let parsed: TxStatusResponse = Self::decode(&body)?;
            match parsed {
                TxStatusResponse::Success => return Ok(ConfirmStatus::Success),
                TxStatusResponse::Reverted { reason } => {
                    return Ok(ConfirmStatus::Reverted { reason });
                },
                TxStatusResponse::Pending => {
                    if tokio::time::Instant::now() + CONFIRM_POLL_INTERVAL > deadline {
                        return Ok(ConfirmStatus::TimedOut);
                    }
                    tokio::time::sleep(CONFIRM_POLL_INTERVAL).await;
                },
            }
        }
    }

    async fn verify_signer(&self) -> Result<SignerCheck, ChainError> {
        let body = self.post("authorized_writer", &json!({})).await?;
        let parsed: AuthorizedWriterResponse = Self::decode(&body)?;
        let is_match = parsed.address == self.config.signer_address;
        Ok(SignerCheck {
            configured: self.config.signer_address.clone(),
            authorized: parsed.address,
            is_match,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RpcChainConfig {
        RpcChainConfig {
            endpoint: "https://relay.example.net".to_string(),
            signer_address: "0xabc".to_string(),
            api_token: None,
        }
    }

    #[test]
    fn config_validation_rejects_empty_fields() {
        let mut c = config();
        c.endpoint = String::new();
        assert!(c.validate().is_err());

        let mut c = config();
        c.signer_address = String::new();
        assert!(c.validate().is_err());

        assert!(config().validate().is_ok());
    }

    #[test]
    fn config_validation_rejects_oversized_fields() {
        let mut c = config();
        c.endpoint = "x".repeat(MAX_CONFIG_STRING_LENGTH + 1);
        assert!(c.validate().is_err());
    }

    #[test]
    fn tx_status_response_decodes_all_variants() {
        let pending: TxStatusResponse = serde_json::from_str(r#"{"status":"pending"}"#).unwrap();
        assert!(matches!(pending, TxStatusResponse::Pending));

        let success: TxStatusResponse = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        assert!(matches!(success, TxStatusResponse::Success));

        let reverted: TxStatusResponse =
            serde_json::from_str(r#"{"status":"reverted","reason":"IncorrectBidAmount"}"#).unwrap();
        match reverted {
            TxStatusResponse::Reverted { reason } => assert_eq!(reason, "IncorrectBidAmount"),
            other => panic!("expected reverted, got {other:?}"),
        }
    }
}
