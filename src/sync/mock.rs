use super::{Method, Transport};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// Records every call made through it and answers from a pre-scripted
/// response queue, keyed loosely by `(method, path-prefix)`. Test tooling
/// mirroring the abstract `fetch` (spec §1, SPEC_FULL §2 item 14).
pub struct MockTransport {
    responses: Mutex<VecDeque<(u16, serde_json::Value)>>,
    pub calls: Mutex<Vec<(String, Method, Option<serde_json::Value>)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self { responses: Mutex::new(VecDeque::new()), calls: Mutex::new(Vec::new()) }
    }

    pub async fn push_response(&self, status: u16, body: serde_json::Value) {
        self.responses.lock().await.push_back((status, body));
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn call(&self, path: &str, method: Method, body: Option<serde_json::Value>) -> Result<(u16, serde_json::Value)> {
        self.calls.lock().await.push((path.to_string(), method, body));
        self.responses
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| crate::error::Error::transport(format!("no scripted response for {path}")))
    }
}
