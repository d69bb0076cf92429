//! Candidate discovery: which extractions are newer than the checkpoint.
//!
//! Listings are newest-first, so everything after the checkpoint sits at the
//! head of the listing. Discovery walks pages only until it meets the first
//! artifact at or before the checkpoint; the rest of the history is never
//! fetched.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use hyaline_artifact_store::artifact::format_timestamp;
use hyaline_artifact_store::{Artifact, ArtifactStore, Pages};

use crate::error::{MergeError, Result};

/// Result of a discovery scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    /// Extractions strictly newer than the checkpoint, newest first.
    pub candidates: Vec<Artifact>,
    /// Creation time of the newest extraction seen on the first page.
    ///
    /// Taken before the scan finishes. With a checkpoint and no candidates it
    /// may be at or before the checkpoint; callers keep the old one then.
    pub new_checkpoint: Option<DateTime<Utc>>,
    /// Number of list calls made.
    pub pages_fetched: u32,
}

/// Collect extractions named `name` created strictly after `checkpoint`.
///
/// An artifact created exactly at the checkpoint is already merged. Without
/// a checkpoint every extraction is a candidate.
pub async fn discover_candidates<S: ArtifactStore + ?Sized>(
    store: &S,
    name: &str,
    checkpoint: Option<&DateTime<Utc>>,
    per_page: u32,
) -> Result<Discovery> {
    let mut pages = Pages::new(store, name, per_page);
    let mut candidates = Vec::new();
    let mut seen = HashSet::new();
    let mut new_checkpoint = None;

    'pages: loop {
        let page = pages.next_page().await.map_err(|e| {
            MergeError::from_store(
                format!("listing {name} page {}", pages.pages_fetched() + 1),
                e,
            )
        })?;
        let Some(page) = page else {
            break;
        };

        if new_checkpoint.is_none() {
            new_checkpoint = page.first().map(|a| a.created_at);
        }

        for artifact in page {
            if let Some(checkpoint) = checkpoint
                && artifact.created_at <= *checkpoint
            {
                tracing::info!(
                    artifact_id = artifact.id,
                    created_at = %artifact.created_at_string(),
                    checkpoint = %format_timestamp(checkpoint),
                    "reached checkpoint, stopping pagination"
                );
                break 'pages;
            }

            // Offset pagination shifts when an upload lands mid-scan, which
            // repeats the previous page's tail.
            if !seen.insert(artifact.id) {
                tracing::debug!(artifact_id = artifact.id, "skipping repeated listing entry");
                continue;
            }

            tracing::info!(
                artifact_id = artifact.id,
                run_id = artifact.run_id,
                created_at = %artifact.created_at_string(),
                "adding extraction to merge"
            );
            candidates.push(artifact);
        }
    }

    tracing::info!(
        candidates = candidates.len(),
        pages = pages.pages_fetched(),
        "discovery complete"
    );
    Ok(Discovery {
        candidates,
        new_checkpoint,
        pages_fetched: pages.pages_fetched(),
    })
}
