//! Extraction side: publish one freshly extracted snapshot.
//!
//! Producers never coordinate with each other or with the merge. Each upload
//! is a new immutable artifact under the extraction name; the store assigns
//! its creation time.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use hyaline_artifact_store::{Artifact, ArtifactStore};

use crate::checkpoint::reset_dir;
use crate::config::MergeSettings;
use crate::error::{MergeError, Result};

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Upload `snapshot` as a new extraction artifact.
///
/// The file is staged as `{work_dir}/extract/{pid}-{seq}/{snapshot_file}`
/// so it lands in the artifact under the name the merge expects, whatever it
/// was called locally.
pub async fn upload_extraction<S: ArtifactStore + ?Sized>(
    store: &S,
    settings: &MergeSettings,
    snapshot: &Path,
) -> Result<Artifact> {
    settings.validate()?;

    match tokio::fs::metadata(snapshot).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => {
            return Err(MergeError::config(format!(
                "{} is not a file",
                snapshot.display()
            )));
        }
        Err(e) => {
            return Err(MergeError::config_with_source(
                format!("cannot read snapshot {}", snapshot.display()),
                e,
            ));
        }
    }

    // Producers may share a work directory, so each upload stages alone.
    let staging = settings.work_dir.join("extract").join(format!(
        "{}-{}",
        std::process::id(),
        STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    reset_dir(&staging).await?;
    let uploaded = stage_and_upload(store, settings, snapshot, &staging).await;
    if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
        tracing::debug!(staging = %staging.display(), "could not remove staging directory: {e}");
    }
    let artifact = uploaded?;

    tracing::info!(
        artifact_id = artifact.id,
        created_at = %artifact.created_at_string(),
        "uploaded extraction"
    );
    Ok(artifact)
}

async fn stage_and_upload<S: ArtifactStore + ?Sized>(
    store: &S,
    settings: &MergeSettings,
    snapshot: &Path,
    staging: &Path,
) -> Result<Artifact> {
    let staged = staging.join(&settings.snapshot_file);
    tokio::fs::copy(snapshot, &staged)
        .await
        .map_err(|e| MergeError::io(format!("staging {}", snapshot.display()), e))?;

    store
        .upload(
            &settings.extract_artifact_name,
            staging,
            &[settings.snapshot_file.as_str()],
        )
        .await
        .map_err(|e| {
            MergeError::from_store(format!("uploading {}", settings.extract_artifact_name), e)
        })
}
