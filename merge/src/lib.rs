//! `hyaline-merge`: incremental documentation snapshot merge.
//!
//! Extraction jobs upload snapshots concurrently and in no particular order.
//! A merge run folds every snapshot produced since the last successful run
//! into the current snapshot and publishes the result together with a new
//! checkpoint, all as one artifact:
//!
//! ```text
//! checkpoint store ─▶ discovery ─▶ fetch & order ─▶ fold ─▶ publish ─┐
//!        ▲                                                            │
//!        └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Preconditions
//! At most one merge run may execute against a checkpoint lineage at a
//! time. The engine holds no lock; the scheduler must enforce a concurrency
//! limit of one. Extraction jobs need no coordination with the merge.
//!
//! ## Failure model
//! Publishing is the last step of a run. Any failure before it aborts the
//! run and leaves the previous checkpoint authoritative, so the next run
//! rediscovers the same candidates and retries the whole run.

pub mod checkpoint;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod fold;
pub mod producer;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{FoldSettings, MergeConfig, MergeSettings, StoreBackend, StoreSettings};
pub use discovery::{Discovery, discover_candidates};
pub use engine::{MergeEngine, MergeOutcome};
pub use error::{ErrorKind, MergeError, Result};
pub use fetch::fetch_ordered;
pub use fold::{CommandFold, Fold, FoldPlan, MergeMode};
pub use producer::upload_extraction;

/// Name of the checkpoint file stored next to the snapshot.
pub const CHECKPOINT_FILE: &str = "checkpoint";
