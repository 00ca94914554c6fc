use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::ResolverConfig;

pub type Headers = Vec<(String, String)>;

/// Outbound HTTP used by every pipeline stage.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get_bytes(&self, url: &str, headers: &Headers) -> Result<Vec<u8>>;

    async fn post_text(&self, url: &str, body: &str, headers: &Headers) -> Result<String>;

    async fn get_text(&self, url: &str, headers: &Headers) -> Result<String> {
        let bytes = self.get_bytes(url, headers).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// The fixed browser-like header set sent with manifest and API requests.
pub fn default_headers(cfg: &ResolverConfig) -> Headers {
    vec![
        ("User-Agent".to_string(), cfg.user_agent.clone()),
        ("Accept".to_string(), cfg.accept.clone()),
        ("Accept-Language".to_string(), cfg.accept_language.clone()),
    ]
}

pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(cfg: &ResolverConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(cfg.http_timeout_secs.max(1)))
            .build()
            .context("building http client")?;
        Ok(Self { inner })
    }

    fn apply(mut req: reqwest::RequestBuilder, headers: &Headers) -> reqwest::RequestBuilder {
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_bytes(&self, url: &str, headers: &Headers) -> Result<Vec<u8>> {
        let resp = Self::apply(self.inner.get(url), headers)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?
            .error_for_status()?;
        let bytes = resp.bytes().await.with_context(|| format!("reading body of {}", url))?;
        Ok(bytes.to_vec())
    }

    async fn post_text(&self, url: &str, body: &str, headers: &Headers) -> Result<String> {
        let resp = Self::apply(self.inner.post(url), headers)
            .body(body.to_string())
            .send()
            .await
            .with_context(|| format!("POST {}", url))?
            .error_for_status()?;
        Ok(resp.text().await?)
    }
}
