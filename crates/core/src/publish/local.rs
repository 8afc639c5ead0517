use anyhow::Context;
use std::io;
use std::path::PathBuf;

use crate::publish::sink::{
    md5_digest, ContainerStatus, CreateOutcome, Md5Digest, ObjectKey, ObjectSink,
};
use crate::staging::create_file_atomic;

/// Object storage on a local directory tree: `<root>/<container>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalObjectSink {
    root: PathBuf,
    container: String,
}

impl LocalObjectSink {
    pub fn new(root: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            container: container.into(),
        }
    }

    fn container_dir(&self) -> PathBuf {
        self.root.join(&self.container)
    }

    pub fn object_path(&self, key: &ObjectKey) -> PathBuf {
        self.container_dir().join(key.as_str())
    }
}

#[async_trait::async_trait]
impl ObjectSink for LocalObjectSink {
    fn sink_name(&self) -> &'static str {
        "local"
    }

    fn container(&self) -> &str {
        &self.container
    }

    async fn ensure_container(&self) -> anyhow::Result<ContainerStatus> {
        let dir = self.container_dir();
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => return Ok(ContainerStatus::AlreadyExists),
            Ok(_) => anyhow::bail!("{} exists and is not a directory", dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to stat {}", dir.display()))
            }
        }

        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create container {}", dir.display()))?;
        Ok(ContainerStatus::Created)
    }

    async fn object_md5(&self, key: &ObjectKey) -> anyhow::Result<Option<Md5Digest>> {
        let path = self.object_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(md5_digest(&bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn create_object(
        &self,
        key: &ObjectKey,
        body: Vec<u8>,
        _md5: Md5Digest,
    ) -> anyhow::Result<CreateOutcome> {
        let dir = self.container_dir();
        anyhow::ensure!(
            tokio::fs::metadata(&dir).await.is_ok(),
            "container {} does not exist",
            self.container
        );

        let path = self.object_path(key);
        let created = create_file_atomic(&path, &body)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        Ok(if created {
            CreateOutcome::Created
        } else {
            CreateOutcome::AlreadyExists
        })
    }
}
