use crate::config::Settings;
use crate::error::StageError;
use crate::ingest::types::SourceQuery;
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

const BODY_EXCERPT_LEN: usize = 200;

/// Where market snapshots come from. The HTTP implementation talks to the
/// markets endpoint; tests substitute fixed bodies.
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// Returns the raw response body of one snapshot request.
    async fn fetch_body(&self, query: &SourceQuery) -> Result<Vec<u8>, StageError>;
}

#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    http: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
}

impl HttpSnapshotSource {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api_key = settings
            .source_api_key
            .as_deref()
            .map(|key| (settings.source_api_key_header.as_str(), key));
        Self::new(&settings.source_endpoint, settings.request_timeout, api_key)
    }

    pub fn new(endpoint: &str, timeout: Duration, api_key: Option<(&str, &str)>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some((name, value)) = api_key {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid api key header name {name:?}"))?;
            let mut value = HeaderValue::from_str(value).context("invalid api key value")?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build snapshot source http client")?;

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            headers,
        })
    }
}

#[async_trait::async_trait]
impl SnapshotSource for HttpSnapshotSource {
    fn source_name(&self) -> &'static str {
        "http_markets"
    }

    async fn fetch_body(&self, query: &SourceQuery) -> Result<Vec<u8>, StageError> {
        let res = self
            .http
            .get(&self.endpoint)
            .headers(self.headers.clone())
            .query(&query.to_pairs())
            .send()
            .await
            .map_err(|e| StageError::source_unavailable(format!("request failed: {e}")))?;

        let status = res.status();
        let body = res
            .bytes()
            .await
            .map_err(|e| StageError::source_unavailable(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            return Err(StageError::source_unavailable(format!(
                "HTTP {status}: {}",
                excerpt(&body)
            )));
        }

        Ok(body.to_vec())
    }
}

pub(crate) fn excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let mut out: String = text.chars().take(BODY_EXCERPT_LEN).collect();
    if text.chars().count() > BODY_EXCERPT_LEN {
        out.push_str("...");
    }
    out
}
