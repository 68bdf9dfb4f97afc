//! HTTP client for compute parties (MPC engines and the FHE server).
//!
//! Every party exposes the same tiny contract: `POST /analyse` accepting a
//! single job or its batched parallel-array form, `GET /status/{id}`, and
//! `GET /offline` to kick preprocessing. Replies are decoded once, here:
//! a body carrying a non-null `error` field fails the call with the raw
//! payload preserved; anything that does not parse fails the same way.

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{EngineResult, OrchestratorError};
use crate::models::MpcParty;

/// A single compute job, as pushed to one party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyseRequest {
    pub analysis_id: String,
    pub user_id: String,
    pub data_index: Vec<i64>,
    /// Absent on the FHE path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
    pub analysis_type: String,
}

/// A batched compute job. Field names stay singular on the wire; each
/// carries one entry per member analysis, index-aligned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAnalyseRequest {
    pub analysis_id: Vec<String>,
    pub user_id: Vec<String>,
    pub data_index: Vec<Vec<i64>>,
    pub analysis_type: String,
    pub online_only: bool,
    /// `[start_time, keys_exp_at]` per member for streaming batches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<Vec<[i64; 2]>>,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    #[serde(rename = "type")]
    status: String,
}

/// Transport to a compute party.
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Pushes a single job to the party's `analyse` endpoint.
    async fn analyse(&self, party: &MpcParty, request: &AnalyseRequest) -> EngineResult<()>;

    /// Pushes a batched job to the party's `analyse` endpoint.
    async fn analyse_batch(
        &self,
        party: &MpcParty,
        request: &BatchAnalyseRequest,
    ) -> EngineResult<()>;

    /// Asks the party for its status of one analysis. Returns the reported
    /// status string verbatim.
    async fn status(&self, party: &MpcParty, analysis_id: &str) -> EngineResult<String>;

    /// Kicks the party's offline preprocessing phase.
    async fn trigger_offline(&self, party: &MpcParty) -> EngineResult<()>;
}

/// Decodes a party reply into `T`, failing with the raw payload when the
/// party signalled an error or sent something unparsable.
fn decode_party_reply<T: DeserializeOwned>(mpc_id: &str, raw: &str) -> EngineResult<T> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|_| OrchestratorError::party(mpc_id, format!("unparsable response: {raw}")))?;

    match value.get("error") {
        Some(error) if !error.is_null() => Err(OrchestratorError::party(mpc_id, error.to_string())),
        _ => serde_json::from_value(value)
            .map_err(|_| OrchestratorError::party(mpc_id, format!("unparsable response: {raw}"))),
    }
}

/// [`ComputeClient`] over plain HTTP.
pub struct HttpComputeClient {
    client: reqwest::Client,
    timeout_seconds: u64,
}

impl HttpComputeClient {
    pub fn new(timeout_seconds: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            timeout_seconds,
        }
    }

    fn request_error(&self, party: &MpcParty, e: reqwest::Error) -> OrchestratorError {
        if e.is_timeout() {
            OrchestratorError::party(
                &party.mpc_id,
                format!("request timed out after {}s", self.timeout_seconds),
            )
        } else if e.is_connect() {
            OrchestratorError::party(
                &party.mpc_id,
                format!("cannot connect to party at {}", party.host),
            )
        } else {
            OrchestratorError::party(&party.mpc_id, format!("request failed: {e}"))
        }
    }

    /// Sends the request and hands back the raw body of a 2xx reply.
    async fn send(&self, party: &MpcParty, request: reqwest::RequestBuilder) -> EngineResult<String> {
        let response = request
            .send()
            .await
            .map_err(|e| self.request_error(party, e))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(OrchestratorError::party(
                &party.mpc_id,
                format!("HTTP {status}: {body}"),
            ));
        }
        Ok(body)
    }
}

#[async_trait]
impl ComputeClient for HttpComputeClient {
    async fn analyse(&self, party: &MpcParty, request: &AnalyseRequest) -> EngineResult<()> {
        debug!(
            "Pushing analysis {} to party {}",
            request.analysis_id, party.mpc_id
        );
        let url = format!("{}/analyse", party.host);
        let body = self.send(party, self.client.post(&url).json(request)).await?;
        decode_party_reply::<Value>(&party.mpc_id, &body)?;
        Ok(())
    }

    async fn analyse_batch(
        &self,
        party: &MpcParty,
        request: &BatchAnalyseRequest,
    ) -> EngineResult<()> {
        debug!(
            "Pushing batch of {} analyses to party {}",
            request.analysis_id.len(),
            party.mpc_id
        );
        let url = format!("{}/analyse", party.host);
        let body = self.send(party, self.client.post(&url).json(request)).await?;
        decode_party_reply::<Value>(&party.mpc_id, &body)?;
        Ok(())
    }

    async fn status(&self, party: &MpcParty, analysis_id: &str) -> EngineResult<String> {
        let url = format!("{}/status/{}", party.host, analysis_id);
        let body = self.send(party, self.client.get(&url)).await?;
        let reply: StatusReply = decode_party_reply(&party.mpc_id, &body)?;
        Ok(reply.status)
    }

    async fn trigger_offline(&self, party: &MpcParty) -> EngineResult<()> {
        let url = format!("{}/offline", party.host);
        let body = self.send(party, self.client.get(&url)).await?;
        // Parties answer the kick with an empty body or a bare ack.
        if !body.trim().is_empty() {
            decode_party_reply::<Value>(&party.mpc_id, &body)?;
        }
        Ok(())
    }
}
