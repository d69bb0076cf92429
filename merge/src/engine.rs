//! The merge run: load checkpoint, discover, fetch, fold, publish.

use chrono::{DateTime, Utc};
use hyaline_artifact_store::ArtifactStore;
use hyaline_artifact_store::artifact::format_timestamp;
use serde::Serialize;

use crate::checkpoint::CheckpointStore;
use crate::config::MergeSettings;
use crate::discovery::discover_candidates;
use crate::error::{MergeError, Result};
use crate::fetch::fetch_ordered;
use crate::fold::{Fold, FoldPlan, MergeMode};

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub mode: MergeMode,
    /// Whether a checkpoint artifact was uploaded.
    pub published: bool,
    /// Checkpoint recorded by this run (the prior one on republish).
    pub checkpoint: Option<DateTime<Utc>>,
    /// Checkpoint the run started from.
    pub previous_checkpoint: Option<DateTime<Utc>>,
    /// Extractions folded in by this run.
    pub candidates: usize,
    pub pages_fetched: u32,
    /// Id of the published checkpoint artifact.
    pub artifact_id: Option<u64>,
}

/// Runs merges against one store and checkpoint lineage.
pub struct MergeEngine<S, F> {
    store: S,
    fold: F,
    settings: MergeSettings,
}

impl<S: ArtifactStore, F: Fold> MergeEngine<S, F> {
    pub fn new(store: S, fold: F, settings: MergeSettings) -> Self {
        Self {
            store,
            fold,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &MergeSettings {
        &self.settings
    }

    /// Perform one merge run.
    ///
    /// Publishing is the last step: on any error nothing has been uploaded
    /// and the previous checkpoint still stands.
    pub async fn run_merge(&self) -> Result<MergeOutcome> {
        self.settings.validate()?;
        let settings = &self.settings;
        let work_dir = settings.work_dir.as_path();
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| MergeError::io(format!("creating {}", work_dir.display()), e))?;

        let checkpoints = CheckpointStore::new(
            &self.store,
            &settings.current_artifact_name,
            &settings.snapshot_file,
        );
        let prior = checkpoints.load(work_dir).await?;
        let previous_checkpoint = prior.as_ref().map(|c| c.timestamp);

        let discovery = discover_candidates(
            &self.store,
            &settings.extract_artifact_name,
            previous_checkpoint.as_ref(),
            settings.per_page,
        )
        .await?;

        let snapshots = fetch_ordered(
            &self.store,
            &discovery.candidates,
            work_dir,
            &settings.snapshot_file,
        )
        .await?;

        let plan = FoldPlan::new(prior.as_ref().map(|c| c.snapshot.as_path()), &snapshots);
        let mode = plan.mode();
        // With candidates, the first listed entry is itself a candidate and so
        // strictly newer than the previous checkpoint.
        let checkpoint = if discovery.candidates.is_empty() {
            previous_checkpoint
        } else {
            discovery.new_checkpoint
        };
        tracing::info!(
            mode = mode.as_str(),
            candidates = discovery.candidates.len(),
            "merge plan decided"
        );

        let mut outcome = MergeOutcome {
            mode,
            published: false,
            checkpoint,
            previous_checkpoint,
            candidates: discovery.candidates.len(),
            pages_fetched: discovery.pages_fetched,
            artifact_id: None,
        };

        let output = work_dir.join("merged").join(&settings.snapshot_file);
        let Some(snapshot) = plan.execute(&self.fold, &output).await? else {
            tracing::info!("no current documentation and no extractions; nothing to publish");
            return Ok(outcome);
        };
        let Some(timestamp) = checkpoint else {
            return Err(MergeError::transient(
                "listing returned extractions without a creation time",
            ));
        };

        let artifact = checkpoints.publish(&snapshot, &timestamp, work_dir).await?;
        outcome.published = true;
        outcome.artifact_id = Some(artifact.id);

        tracing::info!(
            mode = mode.as_str(),
            candidates = outcome.candidates,
            checkpoint = %format_timestamp(&timestamp),
            artifact_id = artifact.id,
            "merge complete"
        );
        Ok(outcome)
    }
}
