//! The notary peer: `getbestproofroot` over JSON-RPC.
//!
//! The driver talks to its peer system through [`NotaryPeer`]. The HTTP
//! implementation wraps a `jsonrpsee` client; the scripted mock drives
//! tests without a network.

use std::collections::VecDeque;

use async_trait::async_trait;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use concord_notary::{CurrencyState, ProofRoot};

use crate::errors::{ProtocolError, Result};

/// Request body of `getbestproofroot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestProofRootRequest {
    /// Proof roots of the peer system, one per known notarization.
    #[serde(rename = "proofroots")]
    pub proof_roots: Vec<ProofRoot>,
    /// Index of our last confirmed notarization.
    #[serde(rename = "lastconfirmed")]
    pub last_confirmed: u32,
}

/// Response body of `getbestproofroot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestProofRootResponse {
    /// Index of the root the peer agrees with, -1 for no agreement.
    #[serde(rename = "bestproofrootindex")]
    pub best_index: i32,
    /// Indices of roots the peer still considers valid.
    #[serde(rename = "validproofroots")]
    pub valid_indices: Vec<u32>,
    /// The peer's current proof root.
    #[serde(rename = "latestproofroot")]
    pub latest_proof_root: Option<ProofRoot>,
    /// Current states of currencies hosted on the peer system.
    #[serde(rename = "currencystates")]
    pub currency_states: Vec<CurrencyState>,
}

/// A peer system that can be asked for its best agreed proof root.
#[async_trait]
pub trait NotaryPeer: Send + Sync {
    /// Ask the peer which of our proof roots it agrees with.
    ///
    /// Transport failures and timeouts surface as [`ProtocolError::NoNotary`].
    async fn get_best_proof_root(
        &self,
        request: BestProofRootRequest,
    ) -> Result<BestProofRootResponse>;
}

/// JSON-RPC-over-HTTP peer client.
pub struct HttpNotaryPeer {
    client: HttpClient,
    host: String,
}

impl HttpNotaryPeer {
    /// Connect to a peer RPC endpoint.
    pub fn new(host: impl Into<String>) -> Result<Self> {
        let host = host.into();
        let client = HttpClientBuilder::default()
            .build(&host)
            .map_err(|_| ProtocolError::NoNotary)?;
        Ok(Self { client, host })
    }

    /// The endpoint this client talks to.
    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl NotaryPeer for HttpNotaryPeer {
    async fn get_best_proof_root(
        &self,
        request: BestProofRootRequest,
    ) -> Result<BestProofRootResponse> {
        debug!(host = %self.host, roots = request.proof_roots.len(), "querying peer for best proof root");
        self.client
            .request("getbestproofroot", rpc_params![request])
            .await
            .map_err(|e| {
                debug!(error = %e, "peer RPC failed");
                ProtocolError::NoNotary
            })
    }
}

/// Scripted peer for tests: queued responses plus an optional side effect
/// run on every call (e.g. advancing the local chain mid-RPC).
#[derive(Default)]
pub struct MockNotaryPeer {
    responses: Mutex<VecDeque<BestProofRootResponse>>,
    side_effect: Mutex<Option<Box<dyn FnMut() + Send>>>,
    /// Requests received, for assertions.
    pub requests: Mutex<Vec<BestProofRootRequest>>,
}

impl MockNotaryPeer {
    /// A peer with no scripted responses (every call fails `no-notary`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response.
    pub fn push_response(&self, response: BestProofRootResponse) {
        self.responses.lock().push_back(response);
    }

    /// Run `effect` during every RPC call, while locks are released.
    pub fn set_side_effect(&self, effect: impl FnMut() + Send + 'static) {
        *self.side_effect.lock() = Some(Box::new(effect));
    }
}

#[async_trait]
impl NotaryPeer for MockNotaryPeer {
    async fn get_best_proof_root(
        &self,
        request: BestProofRootRequest,
    ) -> Result<BestProofRootResponse> {
        self.requests.lock().push(request);
        if let Some(effect) = self.side_effect.lock().as_mut() {
            effect();
        }
        self.responses
            .lock()
            .pop_front()
            .ok_or(ProtocolError::NoNotary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_request() -> BestProofRootRequest {
        BestProofRootRequest {
            proof_roots: vec![],
            last_confirmed: 0,
        }
    }

    #[tokio::test]
    async fn test_mock_peer_scripted_responses() {
        let peer = MockNotaryPeer::new();
        peer.push_response(BestProofRootResponse {
            best_index: 0,
            valid_indices: vec![0],
            latest_proof_root: None,
            currency_states: vec![],
        });

        let response = peer.get_best_proof_root(empty_request()).await.unwrap();
        assert_eq!(response.best_index, 0);
        // Queue exhausted: next call maps to no-notary.
        assert!(matches!(
            peer.get_best_proof_root(empty_request()).await,
            Err(ProtocolError::NoNotary)
        ));
    }

    #[tokio::test]
    async fn test_mock_peer_side_effect_runs() {
        let peer = MockNotaryPeer::new();
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag_clone = flag.clone();
        peer.set_side_effect(move || {
            flag_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        let _ = peer.get_best_proof_root(empty_request()).await;
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_request_json_field_names() {
        let value = serde_json::to_value(empty_request()).unwrap();
        assert!(value.get("proofroots").is_some());
        assert!(value.get("lastconfirmed").is_some());
    }

    #[test]
    fn test_response_json_field_names() {
        let response = BestProofRootResponse {
            best_index: -1,
            valid_indices: vec![],
            latest_proof_root: None,
            currency_states: vec![],
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value.get("bestproofrootindex").unwrap(), -1);
        assert!(value.get("validproofroots").is_some());
        assert!(value.get("currencystates").is_some());
    }
}
