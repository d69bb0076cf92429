//! Download candidates and put them in fold order.

use std::path::{Path, PathBuf};

use hyaline_artifact_store::{Artifact, ArtifactStore};

use crate::checkpoint::{is_file, reset_dir};
use crate::error::{MergeError, Result};

/// Download `candidates` (newest first, as discovered) and return the local
/// snapshot paths oldest first.
///
/// Each artifact is unpacked into `{work_dir}/extracted/{run_id}-{artifact_id}/`
/// so two extractions never collide. Downloads are sequential; the first
/// failure aborts the whole fetch.
pub async fn fetch_ordered<S: ArtifactStore + ?Sized>(
    store: &S,
    candidates: &[Artifact],
    work_dir: &Path,
    snapshot_file: &str,
) -> Result<Vec<PathBuf>> {
    let root = work_dir.join("extracted");
    let mut snapshots = Vec::with_capacity(candidates.len());

    for artifact in candidates.iter().rev() {
        let dest = root.join(format!("{}-{}", artifact.run_id, artifact.id));
        reset_dir(&dest).await?;

        tracing::debug!(
            artifact_id = artifact.id,
            dest = %dest.display(),
            "downloading extraction"
        );
        let dir = store.download(artifact, &dest).await.map_err(|e| {
            MergeError::from_store(
                format!("downloading {} (id {})", artifact.name, artifact.id),
                e,
            )
        })?;

        let snapshot = dir.join(snapshot_file);
        if !is_file(&snapshot).await {
            return Err(MergeError::transient(format!(
                "extraction {} (run {}) has no {snapshot_file}",
                artifact.id, artifact.run_id
            )));
        }
        snapshots.push(snapshot);
    }

    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hyaline_artifact_store::LocalArtifactStore;
    use pretty_assertions::assert_eq;

    const NAME: &str = "_extracted-documentation";
    const SNAPSHOT: &str = "documentation.db";

    #[tokio::test]
    async fn snapshots_come_back_oldest_first() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path().join("store")).unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();

        // Upload order differs from creation order.
        for (secs, body) in [(20, "b"), (10, "a"), (30, "c")] {
            std::fs::write(src.join(SNAPSHOT), body).unwrap();
            let at = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
            store
                .upload_at(NAME, &src, &[SNAPSHOT], Some(at), secs as u64)
                .await
                .unwrap();
        }

        let newest_first = store.list_page(NAME, 1, 10).await.unwrap();
        let work = tmp.path().join("work");
        let paths = fetch_ordered(&store, &newest_first, &work, SNAPSHOT)
            .await
            .unwrap();

        let bodies: Vec<_> = paths
            .iter()
            .map(|p| std::fs::read_to_string(p).unwrap())
            .collect();
        assert_eq!(bodies, vec!["a", "b", "c"]);
        assert!(paths[0].starts_with(work.join("extracted").join("10-2")));
    }

    #[tokio::test]
    async fn extraction_without_snapshot_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path().join("store")).unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("other.txt"), "x").unwrap();
        let artifact = store.upload(NAME, &src, &["other.txt"]).await.unwrap();

        let err = fetch_ordered(&store, &[artifact], &tmp.path().join("work"), SNAPSHOT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::TransientIo);
    }

    #[tokio::test]
    async fn missing_artifact_is_transient() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path().join("store")).unwrap();
        let ghost = Artifact {
            id: 99,
            name: NAME.to_string(),
            created_at: Utc::now(),
            run_id: 1,
        };

        let err = fetch_ordered(&store, &[ghost], &tmp.path().join("work"), SNAPSHOT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::TransientIo);
    }
}
