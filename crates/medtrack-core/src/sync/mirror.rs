//! HTTP client for a JSON-tree Mirror Store (`{base}/{path}.json`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Response};
use url::Url;

use super::rest::error_from_response;
use super::store::MirrorStore;
use super::types::MirrorPath;
use crate::error::{ConfigError, StoreError};

#[derive(Debug, Clone)]
pub struct HttpMirror {
    client: reqwest::Client,
    base: Url,
    auth: Option<String>,
}

impl HttpMirror {
    pub fn new(base_url: &str, auth: Option<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base = Url::parse(&normalized).map_err(|e| ConfigError::InvalidValue {
            key: "store.mirror_base_url".into(),
            message: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "store.request_timeout_secs".into(),
                message: e.to_string(),
            })?;
        Ok(Self { client, base, auth })
    }

    fn url(&self, path: &MirrorPath) -> Result<Url, StoreError> {
        let mut url = self
            .base
            .join(&format!("{path}.json"))
            .map_err(|e| StoreError::Rejected {
                status: 0,
                message: format!("bad mirror path '{path}': {e}"),
            })?;
        if let Some(auth) = &self.auth {
            url.query_pairs_mut().append_pair("auth", auth);
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        path: &MirrorPath,
        body: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut req = self.client.request(method, self.url(path)?);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        check(resp).await
    }
}

async fn check(resp: Response) -> Result<(), StoreError> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(error_from_response(resp).await)
    }
}

#[async_trait]
impl MirrorStore for HttpMirror {
    async fn put(&self, path: &MirrorPath, value: &serde_json::Value) -> Result<(), StoreError> {
        self.send(Method::PUT, path, Some(value)).await
    }

    async fn remove(&self, path: &MirrorPath) -> Result<(), StoreError> {
        self.send(Method::DELETE, path, None).await
    }

    async fn append(&self, path: &MirrorPath, value: &serde_json::Value) -> Result<(), StoreError> {
        self.send(Method::POST, path, Some(value)).await
    }
}
