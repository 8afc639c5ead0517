use md5::{Digest, Md5};
use std::fmt;

use crate::domain::run::RunId;

pub type Md5Digest = [u8; 16];

pub fn md5_digest(bytes: &[u8]) -> Md5Digest {
    Md5::digest(bytes).into()
}

/// Destination key inside the container. Always relative, `/`-separated and
/// free of `.`/`..` segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(key: impl Into<String>) -> anyhow::Result<Self> {
        let key = key.into();
        anyhow::ensure!(
            !key.is_empty()
                && key
                    .split('/')
                    .all(|seg| !seg.is_empty() && seg != "." && seg != ".."),
            "invalid object key {key:?}"
        );
        Ok(Self(key))
    }

    /// `raw_data/<pipeline>/<run-id>.json`
    pub fn raw(pipeline: &str, run_id: &RunId) -> anyhow::Result<Self> {
        Self::new(format!("raw_data/{pipeline}/{run_id}.json"))
    }

    /// `transformed_data/<pipeline>/<run-id>.csv`
    pub fn transformed(pipeline: &str, run_id: &RunId) -> anyhow::Result<Self> {
        Self::new(format!("transformed_data/{pipeline}/{run_id}.csv"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn content_type(&self) -> &'static str {
        if self.0.ends_with(".json") {
            "application/json"
        } else if self.0.ends_with(".csv") {
            "text/csv"
        } else {
            "application/octet-stream"
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Durable object storage. Implementations must make `create_object` atomic
/// and create-if-absent: it never replaces an existing object.
#[async_trait::async_trait]
pub trait ObjectSink: Send + Sync {
    fn sink_name(&self) -> &'static str;

    fn container(&self) -> &str;

    async fn ensure_container(&self) -> anyhow::Result<ContainerStatus>;

    /// Digest of the stored object, `None` if absent.
    async fn object_md5(&self, key: &ObjectKey) -> anyhow::Result<Option<Md5Digest>>;

    async fn create_object(
        &self,
        key: &ObjectKey,
        body: Vec<u8>,
        md5: Md5Digest,
    ) -> anyhow::Result<CreateOutcome>;
}
