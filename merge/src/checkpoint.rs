//! Checkpoint lineage: the published snapshot and the time it covers.
//!
//! Each publish uploads one artifact under the current-artifact name holding
//! two files: the snapshot and a `checkpoint` file with an RFC 3339
//! timestamp. Uploading both together is what keeps them consistent; there
//! is never a snapshot without its checkpoint or the reverse.
//!
//! The newest artifact under that name is authoritative. Older ones are
//! ignored (and eventually expire from the store).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hyaline_artifact_store::artifact::{format_timestamp, parse_timestamp};
use hyaline_artifact_store::{Artifact, ArtifactStore, latest};

use crate::CHECKPOINT_FILE;
use crate::error::{MergeError, Result};

/// The most recently published snapshot and its checkpoint timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Creation time of the newest extraction folded into `snapshot`.
    pub timestamp: DateTime<Utc>,
    /// Local copy of the published snapshot.
    pub snapshot: PathBuf,
    /// The artifact it was downloaded from.
    pub artifact: Artifact,
}

/// Reads and writes the checkpoint lineage in an artifact store.
pub struct CheckpointStore<'a, S: ArtifactStore + ?Sized> {
    store: &'a S,
    name: &'a str,
    snapshot_file: &'a str,
}

impl<'a, S: ArtifactStore + ?Sized> CheckpointStore<'a, S> {
    pub fn new(store: &'a S, name: &'a str, snapshot_file: &'a str) -> Self {
        Self {
            store,
            name,
            snapshot_file,
        }
    }

    /// Download the newest checkpoint artifact into `work_dir`.
    ///
    /// `Ok(None)` means nothing has ever been published. An artifact missing
    /// either file, or with an unreadable timestamp, is a broken lineage and
    /// reported as a configuration error rather than silently treated as
    /// "no checkpoint".
    pub async fn load(&self, work_dir: &Path) -> Result<Option<Checkpoint>> {
        let Some(artifact) = latest(self.store, self.name)
            .await
            .map_err(|e| MergeError::from_store(format!("looking up {}", self.name), e))?
        else {
            tracing::info!(name = self.name, "no checkpoint artifact found");
            return Ok(None);
        };

        let dest = work_dir.join("current").join(artifact.id.to_string());
        reset_dir(&dest).await?;
        let dir = self.store.download(&artifact, &dest).await.map_err(|e| {
            MergeError::from_store(format!("downloading {} (id {})", self.name, artifact.id), e)
        })?;

        let checkpoint_path = dir.join(CHECKPOINT_FILE);
        let raw = match tokio::fs::read_to_string(&checkpoint_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MergeError::config(format!(
                    "checkpoint artifact {} has no {CHECKPOINT_FILE} file",
                    artifact.id
                )));
            }
            Err(e) => {
                return Err(MergeError::io(
                    format!("reading {}", checkpoint_path.display()),
                    e,
                ));
            }
        };
        let timestamp = parse_checkpoint(&raw).map_err(|e| match e {
            MergeError::Configuration { message, source } => MergeError::Configuration {
                message: format!("checkpoint artifact {}: {message}", artifact.id),
                source,
            },
            other => other,
        })?;

        let snapshot = dir.join(self.snapshot_file);
        if !is_file(&snapshot).await {
            return Err(MergeError::config(format!(
                "checkpoint artifact {} has no {} file",
                artifact.id, self.snapshot_file
            )));
        }

        tracing::info!(
            artifact_id = artifact.id,
            checkpoint = %format_timestamp(&timestamp),
            "loaded checkpoint"
        );
        Ok(Some(Checkpoint {
            timestamp,
            snapshot,
            artifact,
        }))
    }

    /// Upload `snapshot` with `timestamp` as one new checkpoint artifact.
    ///
    /// Files are staged in `{work_dir}/publish/` first. This is the commit
    /// point of a merge run; nothing before it is visible to other runs.
    pub async fn publish(
        &self,
        snapshot: &Path,
        timestamp: &DateTime<Utc>,
        work_dir: &Path,
    ) -> Result<Artifact> {
        let staging = work_dir.join("publish");
        reset_dir(&staging).await?;

        let staged = staging.join(self.snapshot_file);
        tokio::fs::copy(snapshot, &staged)
            .await
            .map_err(|e| MergeError::io(format!("staging {}", snapshot.display()), e))?;
        let checkpoint_path = staging.join(CHECKPOINT_FILE);
        tokio::fs::write(&checkpoint_path, format_checkpoint(timestamp))
            .await
            .map_err(|e| MergeError::io(format!("writing {}", checkpoint_path.display()), e))?;

        let artifact = self
            .store
            .upload(self.name, &staging, &[self.snapshot_file, CHECKPOINT_FILE])
            .await
            .map_err(|e| MergeError::from_store(format!("uploading {}", self.name), e))?;

        tracing::info!(
            artifact_id = artifact.id,
            checkpoint = %format_timestamp(timestamp),
            "published checkpoint"
        );
        Ok(artifact)
    }

    /// Copy the published snapshot to `dest`.
    ///
    /// Returns the checkpoint it belongs to, or `None` when nothing has been
    /// published yet (in which case `dest` is left untouched).
    pub async fn fetch_current(&self, work_dir: &Path, dest: &Path) -> Result<Option<Checkpoint>> {
        let Some(checkpoint) = self.load(work_dir).await? else {
            return Ok(None);
        };

        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MergeError::io(format!("creating {}", parent.display()), e))?;
        }
        tokio::fs::copy(&checkpoint.snapshot, dest)
            .await
            .map_err(|e| MergeError::io(format!("writing {}", dest.display()), e))?;
        Ok(Some(checkpoint))
    }
}

/// Parse the contents of a checkpoint file.
pub fn parse_checkpoint(raw: &str) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(MergeError::config("checkpoint file is empty"));
    }
    parse_timestamp(trimmed).map_err(|e| {
        MergeError::config_with_source(format!("invalid checkpoint timestamp {trimmed:?}"), e)
    })
}

/// Render a checkpoint file. Always UTC with a `Z` suffix.
pub fn format_checkpoint(timestamp: &DateTime<Utc>) -> String {
    format_timestamp(timestamp)
}

pub(crate) async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file())
}

/// Remove leftovers from an earlier attempt and recreate `dir`.
pub(crate) async fn reset_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(MergeError::io(format!("clearing {}", dir.display()), e)),
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| MergeError::io(format!("creating {}", dir.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use chrono::TimeZone;
    use hyaline_artifact_store::LocalArtifactStore;
    use pretty_assertions::assert_eq;

    const CURRENT: &str = "_current-documentation";
    const SNAPSHOT: &str = "documentation.db";

    #[test]
    fn parses_rfc3339_with_offset() {
        let ts = parse_checkpoint("2025-03-04T12:30:00+02:00\n").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2025, 3, 4, 10, 30, 0).unwrap());
    }

    #[test]
    fn empty_checkpoint_is_a_configuration_error() {
        let err = parse_checkpoint(" \n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        let err = parse_checkpoint("yesterday").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn format_keeps_subsecond_precision() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_000_000).unwrap();
        let rendered = format_checkpoint(&ts);
        assert!(rendered.ends_with('Z'));
        assert_eq!(parse_checkpoint(&rendered).unwrap(), ts);
    }

    #[tokio::test]
    async fn load_without_any_publish_is_none() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path().join("store")).unwrap();
        let checkpoints = CheckpointStore::new(&store, CURRENT, SNAPSHOT);

        assert_eq!(checkpoints.load(&tmp.path().join("work")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn publish_then_load_returns_the_newest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path().join("store")).unwrap();
        let work = tmp.path().join("work");
        let checkpoints = CheckpointStore::new(&store, CURRENT, SNAPSHOT);

        let snapshot = tmp.path().join("merged.db");
        std::fs::write(&snapshot, "first").unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        checkpoints.publish(&snapshot, &t1, &work).await.unwrap();

        std::fs::write(&snapshot, "second").unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let published = checkpoints.publish(&snapshot, &t2, &work).await.unwrap();

        let loaded = checkpoints.load(&work).await.unwrap().unwrap();
        assert_eq!(loaded.timestamp, t2);
        assert_eq!(loaded.artifact, published);
        assert_eq!(std::fs::read_to_string(&loaded.snapshot).unwrap(), "second");
    }

    #[tokio::test]
    async fn artifact_without_checkpoint_file_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path().join("store")).unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join(SNAPSHOT), "db").unwrap();
        store.upload(CURRENT, &src, &[SNAPSHOT]).await.unwrap();

        let err = CheckpointStore::new(&store, CURRENT, SNAPSHOT)
            .load(&tmp.path().join("work"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("no checkpoint file"));
    }

    #[tokio::test]
    async fn fetch_current_copies_the_snapshot() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path().join("store")).unwrap();
        let work = tmp.path().join("work");
        let checkpoints = CheckpointStore::new(&store, CURRENT, SNAPSHOT);

        let dest = tmp.path().join("out").join("documentation.db");
        assert!(checkpoints.fetch_current(&work, &dest).await.unwrap().is_none());
        assert!(!dest.exists());

        let snapshot = tmp.path().join("merged.db");
        std::fs::write(&snapshot, "merged").unwrap();
        let t = Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap();
        checkpoints.publish(&snapshot, &t, &work).await.unwrap();

        let checkpoint = checkpoints.fetch_current(&work, &dest).await.unwrap().unwrap();
        assert_eq!(checkpoint.timestamp, t);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "merged");
    }
}
