use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::domain::run::RunContext;
use crate::error::StageError;

const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Raw,
    Transformed,
}

impl ArtifactKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Raw => "json",
            Self::Transformed => "csv",
        }
    }
}

/// A file in the staging area, handed from one stage to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Local run-scoped staging: `<root>/<pipeline>/<run-id>.<ext>`.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pipeline_dir(&self, pipeline: &str) -> PathBuf {
        self.root.join(pipeline)
    }

    pub fn artifact_path(&self, ctx: &RunContext, kind: ArtifactKind) -> PathBuf {
        self.pipeline_dir(&ctx.pipeline)
            .join(format!("{}.{}", ctx.run_id, kind.extension()))
    }

    /// Writes `bytes` under the artifact's final name without ever exposing a
    /// partial file there: temp file in the same directory, fsync, rename.
    pub async fn write_atomic(
        &self,
        ctx: &RunContext,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<StagedArtifact, StageError> {
        let path = self.artifact_path(ctx, kind);
        write_file_atomic(&path, bytes)
            .await
            .map_err(|e| StageError::staging(&path, e))?;

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "staged artifact written");
        Ok(StagedArtifact {
            kind,
            path,
            bytes: bytes.len() as u64,
        })
    }

    /// Returns the staged artifact if it exists under its final name and is
    /// non-empty.
    pub async fn existing(
        &self,
        ctx: &RunContext,
        kind: ArtifactKind,
    ) -> Result<Option<StagedArtifact>, StageError> {
        let path = self.artifact_path(ctx, kind);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(Some(StagedArtifact {
                kind,
                path,
                bytes: meta.len(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StageError::staging(&path, e)),
        }
    }

    /// Like [`existing`](Self::existing) but a missing or empty artifact is a
    /// staging failure.
    pub async fn require(
        &self,
        ctx: &RunContext,
        kind: ArtifactKind,
    ) -> Result<StagedArtifact, StageError> {
        let path = self.artifact_path(ctx, kind);
        self.existing(ctx, kind).await?.ok_or_else(|| {
            StageError::staging(
                path,
                io::Error::new(io::ErrorKind::NotFound, "artifact missing or empty"),
            )
        })
    }

    pub async fn read(&self, artifact: &StagedArtifact) -> Result<Vec<u8>, StageError> {
        let bytes = tokio::fs::read(&artifact.path)
            .await
            .map_err(|e| StageError::staging(&artifact.path, e))?;
        if bytes.is_empty() {
            return Err(StageError::staging(
                &artifact.path,
                io::Error::new(io::ErrorKind::InvalidData, "artifact is empty"),
            ));
        }
        Ok(bytes)
    }

    /// Removes leftover temp files of one run (interrupted writes).
    pub async fn sweep_run(&self, ctx: &RunContext) -> Result<usize, StageError> {
        let prefix = format!("{}.", ctx.run_id);
        sweep_dir(&self.pipeline_dir(&ctx.pipeline), |name| {
            name.starts_with(&prefix)
        })
        .await
    }

    /// Removes every leftover temp file of a pipeline. Only safe while no run
    /// of that pipeline is in flight (worker startup).
    pub async fn sweep_pipeline(&self, pipeline: &str) -> Result<usize, StageError> {
        sweep_dir(&self.pipeline_dir(pipeline), |_| true).await
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        "{file_name}.{}{TEMP_SUFFIX}",
        uuid::Uuid::new_v4().simple()
    ))
}

pub(crate) async fn write_file_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path_for(path);
    let res = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if res.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    res
}

/// Writes `bytes` to `path` only if nothing exists there yet. Returns `false`
/// when the destination was already present.
pub(crate) async fn create_file_atomic(path: &Path, bytes: &[u8]) -> io::Result<bool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path_for(path);
    let staged = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;
    if let Err(e) = staged {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    // hard_link refuses to replace an existing destination.
    let linked = tokio::fs::hard_link(&tmp, path).await;
    let _ = tokio::fs::remove_file(&tmp).await;
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

async fn sweep_dir<F>(dir: &Path, matches: F) -> Result<usize, StageError>
where
    F: Fn(&str) -> bool,
{
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StageError::staging(dir, e)),
    };

    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StageError::staging(dir, e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(TEMP_SUFFIX) || !matches(&name) {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                removed += 1;
                tracing::info!(path = %path.display(), "removed stale staging temp file");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StageError::staging(&path, e)),
        }
    }
    Ok(removed)
}
