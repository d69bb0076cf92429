//! Directory-backed artifact store.
//!
//! ## Layout
//!
//! ```text
//! {root}/.store.lock    held while an upload allocates its id
//! {root}/{name}/{id}/
//!   artifact.json       Artifact metadata
//!   files/...           uploaded files, relative layout preserved
//! ```
//!
//! Artifacts are staged under a per-upload `{id}.{pid}.{nanos}.tmp`
//! directory and renamed into place, so a listing never observes a
//! half-written artifact. Several processes may share one root: uploads take
//! an exclusive lock on `.store.lock`, so ids and implicit creation times are
//! allocated in one order across all of them.
//!
//! Filesystem work runs on the blocking thread pool.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;

use crate::archive::checked_relative;
use crate::artifact::Artifact;
use crate::error::{Result, StoreError};
use crate::store::{ArtifactStore, blocking};

const META_FILE: &str = "artifact.json";
const FILES_DIR: &str = "files";
const LOCK_FILE: &str = ".store.lock";

/// Artifact store rooted at a local directory.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Upload with an explicit creation time and run id.
    ///
    /// When `created_at` is `None` the current time is used, bumped forward
    /// if needed so creation times stay strictly increasing.
    pub async fn upload_at(
        &self,
        name: &str,
        root: &Path,
        files: &[&str],
        created_at: Option<DateTime<Utc>>,
        run_id: u64,
    ) -> Result<Artifact> {
        let upload = Upload {
            store_root: self.root.clone(),
            name_dir: self.name_dir(name)?,
            name: name.to_string(),
            src_root: root.to_path_buf(),
            files: files.iter().map(|f| (*f).to_string()).collect(),
            created_at,
            run_id,
        };
        let artifact = blocking(move || upload.commit()).await?;

        tracing::debug!(
            artifact_id = artifact.id,
            name = %artifact.name,
            created_at = %artifact.created_at_string(),
            "stored local artifact"
        );
        Ok(artifact)
    }

    fn name_dir(&self, name: &str) -> Result<PathBuf> {
        let rel = checked_relative(name)?;
        if rel.components().count() != 1 {
            return Err(StoreError::Config(format!(
                "artifact name must be a single path component: {name}"
            )));
        }
        Ok(self.root.join(rel))
    }

    fn artifact_dir(&self, artifact: &Artifact) -> Result<PathBuf> {
        Ok(self.name_dir(&artifact.name)?.join(artifact.id.to_string()))
    }
}

/// One upload, owned so it can move onto the blocking pool.
struct Upload {
    store_root: PathBuf,
    name_dir: PathBuf,
    name: String,
    src_root: PathBuf,
    files: Vec<String>,
    created_at: Option<DateTime<Utc>>,
    run_id: u64,
}

impl Upload {
    fn commit(self) -> Result<Artifact> {
        let rel_paths = self
            .files
            .iter()
            .map(|f| checked_relative(f.as_str()))
            .collect::<Result<Vec<_>>>()?;

        // Released when `_lock` drops, after the rename below.
        let _lock = lock_store(&self.store_root)?;

        let existing = scan_all(&self.store_root)?;
        let id = existing.iter().map(|a| a.id).max().unwrap_or(0) + 1;
        let created_at = match self.created_at {
            Some(ts) => ts,
            None => {
                let now = Utc::now();
                match existing.iter().map(|a| a.created_at).max() {
                    Some(last) if now <= last => last + Duration::milliseconds(1),
                    _ => now,
                }
            }
        };

        let artifact = Artifact {
            id,
            name: self.name,
            created_at,
            run_id: self.run_id,
        };

        let staging = self.name_dir.join(format!(
            "{id}.{}.{}.tmp",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let files_dir = staging.join(FILES_DIR);
        std::fs::create_dir_all(&files_dir).map_err(|e| StoreError::io(&files_dir, e))?;

        let staged = stage_files(&self.src_root, &rel_paths, &files_dir)
            .and_then(|()| {
                let meta = serde_json::to_string_pretty(&artifact)?;
                let meta_path = staging.join(META_FILE);
                std::fs::write(&meta_path, meta).map_err(|e| StoreError::io(&meta_path, e))
            })
            .and_then(|()| {
                let final_dir = self.name_dir.join(id.to_string());
                std::fs::rename(&staging, &final_dir).map_err(|e| StoreError::io(&final_dir, e))
            });
        if let Err(err) = staged {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(err);
        }
        Ok(artifact)
    }
}

fn stage_files(src_root: &Path, rel_paths: &[PathBuf], files_dir: &Path) -> Result<()> {
    for rel_path in rel_paths {
        let src = src_root.join(rel_path);
        let dst = files_dir.join(rel_path);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        std::fs::copy(&src, &dst).map_err(|e| StoreError::io(&src, e))?;
    }
    Ok(())
}

/// Take the store-wide upload lock, blocking until it is free.
fn lock_store(store_root: &Path) -> Result<File> {
    let path = store_root.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| StoreError::io(&path, e))?;
    file.lock_exclusive().map_err(|e| StoreError::io(&path, e))?;
    Ok(file)
}

/// Read every committed artifact in the store, across names.
fn scan_all(store_root: &Path) -> Result<Vec<Artifact>> {
    let entries = match std::fs::read_dir(store_root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(store_root, e)),
    };

    let mut all = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(store_root, e))?;
        if entry.path().is_dir() {
            all.extend(read_artifacts(&entry.path())?);
        }
    }
    Ok(all)
}

fn read_artifacts(dir: &Path) -> Result<Vec<Artifact>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let meta_path = entry.path().join(META_FILE);
        // Staging directories have no artifact.json until they are renamed.
        if entry.file_name().to_string_lossy().ends_with(".tmp") || !meta_path.exists() {
            continue;
        }
        let data = std::fs::read_to_string(&meta_path).map_err(|e| StoreError::io(&meta_path, e))?;
        artifacts.push(serde_json::from_str(&data)?);
    }
    Ok(artifacts)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(|e| StoreError::io(dst, e))?;
    let entries = std::fs::read_dir(src).map_err(|e| StoreError::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(|e| StoreError::io(&from, e))?;
        }
    }
    Ok(())
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn list_page(&self, name: &str, page: u32, per_page: u32) -> Result<Vec<Artifact>> {
        let dir = self.name_dir(name)?;
        let mut artifacts = blocking(move || read_artifacts(&dir)).await?;
        artifacts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let per_page = per_page.max(1) as usize;
        let skip = (page.max(1) as usize - 1) * per_page;
        Ok(artifacts.into_iter().skip(skip).take(per_page).collect())
    }

    async fn download(&self, artifact: &Artifact, dest: &Path) -> Result<PathBuf> {
        let files = self.artifact_dir(artifact)?.join(FILES_DIR);
        let missing = format!("{} (id {})", artifact.name, artifact.id);
        let dest = dest.to_path_buf();
        blocking(move || {
            if !files.exists() {
                return Err(StoreError::NotFound(missing));
            }
            copy_tree(&files, &dest)?;
            Ok(dest)
        })
        .await
    }

    async fn upload(&self, name: &str, root: &Path, files: &[&str]) -> Result<Artifact> {
        self.upload_at(name, root, files, None, 0).await
    }
}
