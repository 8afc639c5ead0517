pub mod gcs;
pub mod local;
pub mod sink;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::config::{SinkBackend, Settings};
use crate::error::StageError;
use crate::staging::{StagedArtifact, StagingArea};
use sink::{md5_digest, ContainerStatus, CreateOutcome, Md5Digest, ObjectKey, ObjectSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Created,
    /// The key already held identical content; nothing was written.
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct PublishedObject {
    pub container: String,
    pub key: ObjectKey,
    pub bytes: u64,
    pub md5_base64: String,
    pub outcome: PublishOutcome,
}

pub fn sink_from_settings(settings: &Settings) -> anyhow::Result<Arc<dyn ObjectSink>> {
    let sink: Arc<dyn ObjectSink> = match settings.sink_backend {
        SinkBackend::Local => Arc::new(local::LocalObjectSink::new(
            &settings.sink_root,
            &settings.sink_container_name,
        )),
        SinkBackend::Gcs => Arc::new(
            gcs::GcsObjectSink::from_settings(settings).context("failed to configure GCS sink")?,
        ),
    };
    Ok(sink)
}

/// Copies staged artifacts to the object sink under deterministic keys.
///
/// Publishing is idempotent per key: identical content is a no-op, different
/// content under an existing key is refused rather than overwritten.
pub struct Publisher {
    sink: Arc<dyn ObjectSink>,
    staging: StagingArea,
    container_ready: AtomicBool,
}

impl Publisher {
    pub fn new(sink: Arc<dyn ObjectSink>, staging: StagingArea) -> Self {
        Self {
            sink,
            staging,
            container_ready: AtomicBool::new(false),
        }
    }

    pub fn container(&self) -> &str {
        self.sink.container()
    }

    pub async fn ensure_container(&self) -> Result<ContainerStatus, StageError> {
        let status = self
            .sink
            .ensure_container()
            .await
            .map_err(|e| StageError::publish(self.sink.container(), &e))?;
        self.container_ready.store(true, Ordering::Release);

        tracing::info!(
            sink = self.sink.sink_name(),
            container = self.sink.container(),
            ?status,
            "object container ready"
        );
        Ok(status)
    }

    pub async fn publish(
        &self,
        artifact: &StagedArtifact,
        key: &ObjectKey,
    ) -> Result<PublishedObject, StageError> {
        if !self.container_ready.load(Ordering::Acquire) {
            self.ensure_container().await?;
        }

        let body = self.staging.read(artifact).await?;
        let bytes = body.len() as u64;
        let md5 = md5_digest(&body);
        let fail = |e: anyhow::Error| StageError::publish(key.as_str(), &e);

        let outcome = match self.sink.object_md5(key).await.map_err(fail)? {
            Some(existing) => same_content(key, existing, md5)?,
            None => match self.sink.create_object(key, body, md5).await.map_err(fail)? {
                CreateOutcome::Created => {
                    let stored = self.sink.object_md5(key).await.map_err(fail)?;
                    if stored != Some(md5) {
                        return Err(fail(anyhow::anyhow!(
                            "stored object does not match the uploaded artifact"
                        )));
                    }
                    PublishOutcome::Created
                }
                // Lost a race with another writer of the same key.
                CreateOutcome::AlreadyExists => {
                    let existing = self
                        .sink
                        .object_md5(key)
                        .await
                        .map_err(fail)?
                        .ok_or_else(|| {
                            fail(anyhow::anyhow!("object reported present but not found"))
                        })?;
                    same_content(key, existing, md5)?
                }
            },
        };

        tracing::info!(
            sink = self.sink.sink_name(),
            container = self.sink.container(),
            key = %key,
            bytes,
            ?outcome,
            "artifact published"
        );

        Ok(PublishedObject {
            container: self.sink.container().to_string(),
            key: key.clone(),
            bytes,
            md5_base64: BASE64.encode(md5),
            outcome,
        })
    }
}

fn same_content(
    key: &ObjectKey,
    existing: Md5Digest,
    local: Md5Digest,
) -> Result<PublishOutcome, StageError> {
    if existing == local {
        Ok(PublishOutcome::Unchanged)
    } else {
        Err(StageError::conflict(
            key.as_str(),
            format!(
                "existing md5 {} differs from artifact md5 {}",
                BASE64.encode(existing),
                BASE64.encode(local)
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::RunContext;
    use crate::error::ErrorKind;
    use crate::staging::ArtifactKind;
    use chrono::{TimeZone, Utc};
    use local::LocalObjectSink;

    struct Fixture {
        _dir: tempfile::TempDir,
        staging: StagingArea,
        sink: Arc<LocalObjectSink>,
        publisher: Publisher,
        ctx: RunContext,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path().join("staging"));
        let sink = Arc::new(LocalObjectSink::new(dir.path().join("objects"), "bucket"));
        let publisher = Publisher::new(sink.clone(), staging.clone());
        let ctx = RunContext::new(
            "crypto_markets",
            Utc.with_ymd_and_hms(2024, 7, 5, 12, 10, 0).unwrap(),
        );
        Fixture {
            _dir: dir,
            staging,
            sink,
            publisher,
            ctx,
        }
    }

    #[tokio::test]
    async fn publishing_twice_yields_one_identical_object() {
        let f = fixture();
        let artifact = f
            .staging
            .write_atomic(&f.ctx, ArtifactKind::Raw, b"[{\"id\":\"bitcoin\"}]")
            .await
            .unwrap();
        let key = ObjectKey::raw(&f.ctx.pipeline, &f.ctx.run_id).unwrap();

        let first = f.publisher.publish(&artifact, &key).await.unwrap();
        let second = f.publisher.publish(&artifact, &key).await.unwrap();

        assert_eq!(first.outcome, PublishOutcome::Created);
        assert_eq!(second.outcome, PublishOutcome::Unchanged);
        assert_eq!(first.md5_base64, second.md5_base64);

        let path = f.sink.object_path(&key);
        assert_eq!(std::fs::read(&path).unwrap(), b"[{\"id\":\"bitcoin\"}]");
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn different_content_under_existing_key_is_refused() {
        let f = fixture();
        let key = ObjectKey::raw(&f.ctx.pipeline, &f.ctx.run_id).unwrap();

        let artifact = f
            .staging
            .write_atomic(&f.ctx, ArtifactKind::Raw, b"[1]")
            .await
            .unwrap();
        f.publisher.publish(&artifact, &key).await.unwrap();

        let artifact = f
            .staging
            .write_atomic(&f.ctx, ArtifactKind::Raw, b"[2]")
            .await
            .unwrap();
        let err = f.publisher.publish(&artifact, &key).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PublishFailed);
        assert!(err.to_string().contains(key.as_str()));
        assert!(err.to_string().contains("conflicting content"));
        assert_eq!(std::fs::read(f.sink.object_path(&key)).unwrap(), b"[1]");
    }

    #[tokio::test]
    async fn missing_artifact_is_a_staging_failure() {
        let f = fixture();
        let key = ObjectKey::raw(&f.ctx.pipeline, &f.ctx.run_id).unwrap();
        let artifact = StagedArtifact {
            kind: ArtifactKind::Raw,
            path: f.staging.artifact_path(&f.ctx, ArtifactKind::Raw),
            bytes: 0,
        };

        let err = f.publisher.publish(&artifact, &key).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StagingIoFailure);
        assert!(f.sink.object_md5(&key).await.unwrap().is_none());
    }

    /// Sink that answers digest lookups from a script and reports a fixed
    /// create outcome without storing anything.
    struct ScriptedSink {
        digests: std::sync::Mutex<std::collections::VecDeque<Option<Md5Digest>>>,
        create: CreateOutcome,
    }

    impl ScriptedSink {
        fn new(digests: Vec<Option<Md5Digest>>, create: CreateOutcome) -> Arc<Self> {
            Arc::new(Self {
                digests: std::sync::Mutex::new(digests.into()),
                create,
            })
        }
    }

    #[async_trait::async_trait]
    impl ObjectSink for ScriptedSink {
        fn sink_name(&self) -> &'static str {
            "scripted"
        }

        fn container(&self) -> &str {
            "bucket"
        }

        async fn ensure_container(&self) -> anyhow::Result<ContainerStatus> {
            Ok(ContainerStatus::AlreadyExists)
        }

        async fn object_md5(&self, _key: &ObjectKey) -> anyhow::Result<Option<Md5Digest>> {
            Ok(self.digests.lock().unwrap().pop_front().flatten())
        }

        async fn create_object(
            &self,
            _key: &ObjectKey,
            _body: Vec<u8>,
            _md5: Md5Digest,
        ) -> anyhow::Result<CreateOutcome> {
            Ok(self.create)
        }
    }

    async fn publish_through(sink: Arc<ScriptedSink>) -> Result<PublishedObject, StageError> {
        let f = fixture();
        let artifact = f
            .staging
            .write_atomic(&f.ctx, ArtifactKind::Raw, b"[1]")
            .await
            .unwrap();
        let key = ObjectKey::raw(&f.ctx.pipeline, &f.ctx.run_id).unwrap();
        Publisher::new(sink, f.staging.clone())
            .publish(&artifact, &key)
            .await
    }

    #[tokio::test]
    async fn lost_create_race_with_same_content_is_unchanged() {
        let sink = ScriptedSink::new(
            vec![None, Some(md5_digest(b"[1]"))],
            CreateOutcome::AlreadyExists,
        );
        let published = publish_through(sink).await.unwrap();
        assert_eq!(published.outcome, PublishOutcome::Unchanged);
    }

    #[tokio::test]
    async fn lost_create_race_with_other_content_is_a_conflict() {
        let sink = ScriptedSink::new(
            vec![None, Some(md5_digest(b"[2]"))],
            CreateOutcome::AlreadyExists,
        );
        let err = publish_through(sink).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PublishFailed);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("conflicting content"));
    }

    #[tokio::test]
    async fn stored_digest_is_verified_after_create() {
        let sink = ScriptedSink::new(vec![None, Some(md5_digest(b"[2]"))], CreateOutcome::Created);
        let err = publish_through(sink).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PublishFailed);
        assert!(err
            .to_string()
            .contains("stored object does not match the uploaded artifact"));

        let sink = ScriptedSink::new(vec![None, None], CreateOutcome::Created);
        assert!(publish_through(sink).await.is_err());
    }

    #[tokio::test]
    async fn ensure_container_is_idempotent() {
        let f = fixture();
        assert_eq!(
            f.publisher.ensure_container().await.unwrap(),
            ContainerStatus::Created
        );
        assert_eq!(
            f.publisher.ensure_container().await.unwrap(),
            ContainerStatus::AlreadyExists
        );
    }
}
