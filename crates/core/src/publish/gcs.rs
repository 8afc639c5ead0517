use crate::config::Settings;
use crate::ingest::provider::excerpt;
use crate::publish::sink::{ContainerStatus, CreateOutcome, Md5Digest, ObjectKey, ObjectSink};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

/// Google Cloud Storage through its JSON API, authenticated with a bearer
/// token (for example `gcloud auth print-access-token`).
#[derive(Debug, Clone)]
pub struct GcsObjectSink {
    http: reqwest::Client,
    base_url: String,
    project: String,
    bucket: String,
    location: String,
    storage_class: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMetadata {
    #[serde(default)]
    md5_hash: Option<String>,
}

impl GcsObjectSink {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            &settings.gcs_base_url,
            settings.require_gcs_project()?,
            &settings.sink_container_name,
            &settings.sink_location,
            &settings.sink_storage_class,
            settings.require_gcs_access_token()?,
            settings.request_timeout,
        )
    }

    pub fn new(
        base_url: &str,
        project: &str,
        bucket: &str,
        location: &str,
        storage_class: &str,
        access_token: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build GCS http client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            project: project.to_string(),
            bucket: bucket.to_string(),
            location: location.to_string(),
            storage_class: storage_class.to_string(),
            access_token: access_token.to_string(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid GCS base url {:?}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("GCS base url cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn bucket_url(&self) -> Result<Url> {
        self.url(&["storage", "v1", "b", &self.bucket])
    }

    fn object_url(&self, key: &ObjectKey) -> Result<Url> {
        // A single path segment: `/` inside the key is percent-encoded.
        self.url(&["storage", "v1", "b", &self.bucket, "o", key.as_str()])
    }

    fn upload_url(&self) -> Result<Url> {
        self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])
    }

    async fn create_bucket(&self) -> Result<ContainerStatus> {
        let url = self.url(&["storage", "v1", "b"])?;
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .query(&[("project", self.project.as_str())])
            .json(&serde_json::json!({
                "name": self.bucket,
                "location": self.location,
                "storageClass": self.storage_class,
            }))
            .send()
            .await
            .context("GCS bucket create request failed")?;

        match res.status() {
            s if s.is_success() => Ok(ContainerStatus::Created),
            StatusCode::CONFLICT => Ok(ContainerStatus::AlreadyExists),
            s => {
                let body = res.bytes().await.unwrap_or_default();
                anyhow::bail!("GCS bucket create HTTP {s}: {}", excerpt(&body))
            }
        }
    }
}

#[async_trait::async_trait]
impl ObjectSink for GcsObjectSink {
    fn sink_name(&self) -> &'static str {
        "gcs"
    }

    fn container(&self) -> &str {
        &self.bucket
    }

    async fn ensure_container(&self) -> Result<ContainerStatus> {
        let res = self
            .http
            .get(self.bucket_url()?)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("GCS bucket lookup request failed")?;

        match res.status() {
            s if s.is_success() => Ok(ContainerStatus::AlreadyExists),
            StatusCode::NOT_FOUND => self.create_bucket().await,
            s => {
                let body = res.bytes().await.unwrap_or_default();
                anyhow::bail!("GCS bucket lookup HTTP {s}: {}", excerpt(&body))
            }
        }
    }

    async fn object_md5(&self, key: &ObjectKey) -> Result<Option<Md5Digest>> {
        let res = self
            .http
            .get(self.object_url(key)?)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("GCS object lookup request failed")?;

        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = res.bytes().await.unwrap_or_default();
            anyhow::bail!("GCS object lookup HTTP {status}: {}", excerpt(&body));
        }

        let meta: ObjectMetadata = res
            .json()
            .await
            .context("failed to parse GCS object metadata")?;
        let encoded = meta
            .md5_hash
            .with_context(|| format!("GCS object {key} has no md5Hash"))?;
        let raw = BASE64
            .decode(encoded.as_bytes())
            .with_context(|| format!("GCS md5Hash for {key} is not base64"))?;
        let digest: Md5Digest = raw
            .try_into()
            .map_err(|_| anyhow::anyhow!("GCS md5Hash for {key} is not 16 bytes"))?;
        Ok(Some(digest))
    }

    async fn create_object(
        &self,
        key: &ObjectKey,
        body: Vec<u8>,
        md5: Md5Digest,
    ) -> Result<CreateOutcome> {
        let res = self
            .http
            .post(self.upload_url()?)
            .bearer_auth(&self.access_token)
            .query(&[
                ("uploadType", "media"),
                ("name", key.as_str()),
                // Only create; never replace an existing generation.
                ("ifGenerationMatch", "0"),
            ])
            .header(reqwest::header::CONTENT_TYPE, key.content_type())
            .header("x-goog-hash", format!("md5={}", BASE64.encode(md5)))
            .body(body)
            .send()
            .await
            .context("GCS upload request failed")?;

        match res.status() {
            s if s.is_success() => Ok(CreateOutcome::Created),
            StatusCode::PRECONDITION_FAILED => Ok(CreateOutcome::AlreadyExists),
            s => {
                let body = res.bytes().await.unwrap_or_default();
                anyhow::bail!("GCS upload HTTP {s}: {}", excerpt(&body))
            }
        }
    }
}
