//! `hyaline-artifact-store`: immutable named artifact storage.
//!
//! Extraction jobs and the merge job exchange documentation snapshots as
//! artifacts: immutable bundles of files stored under a name, tagged with a
//! creation timestamp and the id of the run that produced them. Many
//! artifacts share a name; listings are always newest-first.
//!
//! ## Backends
//! - [`GitHubArtifactStore`]: GitHub Actions artifacts (REST API for list and
//!   download, results service for upload).
//! - [`LocalArtifactStore`]: a plain directory tree, for self-hosted setups
//!   and tests.

pub mod archive;
pub mod artifact;
pub mod error;
pub mod github;
pub mod local;
pub mod store;

pub use artifact::Artifact;
pub use error::{Result, StoreError};
pub use github::{GitHubArtifactStore, GitHubConfig};
pub use local::LocalArtifactStore;
pub use store::{ArtifactStore, Pages, latest};

/// Largest page size the GitHub artifacts API accepts.
pub const MAX_PER_PAGE: u32 = 100;
