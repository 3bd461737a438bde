//! HTTP client implementing `ReplicationTransport`.

use crate::{ReplicateRequest, ReplicateResponse};
use keel_common::{Node, Record};
use keel_kv::{ReplicationTransport, TransportError};
use std::time::Duration;

/// Replica transport over HTTP. One pooled client serves all peers.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    local_id: String,
}

impl HttpTransport {
    pub fn new(local_id: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction");
        Self {
            client,
            local_id: local_id.into(),
        }
    }

    fn replicate_url(target: &Node) -> String {
        format!("http://{}/internal/replicate", target.rpc_addr())
    }

    fn read_url(target: &Node, key: &[u8]) -> String {
        format!(
            "http://{}/internal/read?key={}",
            target.rpc_addr(),
            hex::encode(key)
        )
    }

    fn map_error(e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::RpcFailed(e.to_string())
        }
    }
}

#[async_trait::async_trait]
impl ReplicationTransport for HttpTransport {
    async fn replicate(
        &self,
        target: &Node,
        record: &Record,
        is_handoff: bool,
    ) -> Result<(), TransportError> {
        let request = ReplicateRequest {
            entry: record.clone(),
            from_node: self.local_id.clone(),
            is_handoff,
        };

        let response = self
            .client
            .post(Self::replicate_url(target))
            .json(&request)
            .send()
            .await
            .map_err(Self::map_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response
                .json::<ReplicateResponse>()
                .await
                .ok()
                .and_then(|r| r.message)
                .unwrap_or_default();
            return Err(TransportError::RpcFailed(format!(
                "replicate to {} returned {}: {}",
                target.id, status, detail
            )));
        }
        Ok(())
    }

    async fn fetch(&self, target: &Node, key: &[u8]) -> Result<Option<Record>, TransportError> {
        let response = self
            .client
            .get(Self::read_url(target, key))
            .send()
            .await
            .map_err(Self::map_error)?;

        match response.status() {
            reqwest::StatusCode::OK => {
                let record = response
                    .json::<Record>()
                    .await
                    .map_err(|e| TransportError::RpcFailed(e.to_string()))?;
                Ok(Some(record))
            }
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status => Err(TransportError::RpcFailed(format!(
                "read from {} returned {}",
                target.id, status
            ))),
        }
    }
}
