//! Pull/push sync engine (spec §4.8, §6.2).

mod engine;
#[cfg(feature = "http-client")]
mod http;
mod mock;

pub use engine::{SyncConfig, SyncEngine, SyncHost};
#[cfg(feature = "http-client")]
pub use http::HttpTransport;
pub use mock::MockTransport;

use crate::error::Result;
use crate::sync_op::SyncOp;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Abstract `fetch(path, method, body) -> (status, json)` the sync engine
/// depends on (spec §1: "the sync engine depends only on an abstract
/// `fetch`"). Production hosts bind [`HttpTransport`]; tests bind
/// [`MockTransport`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, path: &str, method: Method, body: Option<serde_json::Value>) -> Result<(u16, serde_json::Value)>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BootstrapResponse {
    #[serde(rename = "datasetGenerationKey")]
    pub dataset_generation_key: String,
    pub snapshot: Option<String>,
    #[serde(rename = "serverSeq")]
    pub server_seq: u64,
    pub ops: Vec<SyncOp>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PushRequest {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "datasetGenerationKey")]
    pub dataset_generation_key: String,
    pub ops: Vec<SyncOp>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PushResponseOk {
    #[serde(rename = "serverSeq")]
    pub server_seq: u64,
    #[serde(rename = "datasetGenerationKey")]
    pub dataset_generation_key: Option<String>,
}

/// Shared 409 shape returned by push/pull/reset (spec §6.2).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ConflictResponse {
    #[serde(rename = "datasetGenerationKey")]
    pub dataset_generation_key: String,
    pub snapshot: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PullResponseOk {
    #[serde(rename = "serverSeq")]
    pub server_seq: u64,
    #[serde(rename = "datasetGenerationKey")]
    pub dataset_generation_key: String,
    pub ops: Vec<SyncOp>,
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ResetRequest {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "datasetGenerationKey")]
    pub dataset_generation_key: String,
    pub snapshot: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ResetResponseOk {
    #[serde(rename = "serverSeq")]
    pub server_seq: u64,
    #[serde(rename = "datasetGenerationKey")]
    pub dataset_generation_key: String,
}
