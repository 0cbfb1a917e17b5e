use super::{Method, Transport};
use crate::error::{Error, Result};
use async_trait::async_trait;

/// Production [`Transport`] binding over `reqwest`. No auth, retries, or
/// connection pooling policy beyond `reqwest`'s defaults — transport chrome
/// is explicitly out of scope (spec §1 non-goals).
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, path: &str, method: Method, body: Option<serde_json::Value>) -> Result<(u16, serde_json::Value)> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        if let Some(body) = &body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| Error::transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let json = resp.json::<serde_json::Value>().await.unwrap_or(serde_json::Value::Null);
        Ok((status, json))
    }
}
