//! The artifact store contract and the lazy page sequence built on it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::artifact::Artifact;
use crate::error::{Result, StoreError};

/// A store of immutable, named artifacts.
///
/// Implementations must return every page newest-first, and each page must be
/// older than the page before it. Nothing else about ordering is assumed.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// List one page (1-based) of artifacts named `name`, newest first.
    async fn list_page(&self, name: &str, page: u32, per_page: u32) -> Result<Vec<Artifact>>;

    /// Download `artifact` and unpack its files into `dest`.
    ///
    /// Returns the directory the files were written to.
    async fn download(&self, artifact: &Artifact, dest: &Path) -> Result<PathBuf>;

    /// Upload `files` (paths relative to `root`) as a new artifact named `name`.
    async fn upload(&self, name: &str, root: &Path, files: &[&str]) -> Result<Artifact>;
}

#[async_trait]
impl<S: ArtifactStore + ?Sized> ArtifactStore for &S {
    async fn list_page(&self, name: &str, page: u32, per_page: u32) -> Result<Vec<Artifact>> {
        (**self).list_page(name, page, per_page).await
    }

    async fn download(&self, artifact: &Artifact, dest: &Path) -> Result<PathBuf> {
        (**self).download(artifact, dest).await
    }

    async fn upload(&self, name: &str, root: &Path, files: &[&str]) -> Result<Artifact> {
        (**self).upload(name, root, files).await
    }
}

#[async_trait]
impl<S: ArtifactStore + ?Sized> ArtifactStore for std::sync::Arc<S> {
    async fn list_page(&self, name: &str, page: u32, per_page: u32) -> Result<Vec<Artifact>> {
        (**self).list_page(name, page, per_page).await
    }

    async fn download(&self, artifact: &Artifact, dest: &Path) -> Result<PathBuf> {
        (**self).download(artifact, dest).await
    }

    async fn upload(&self, name: &str, root: &Path, files: &[&str]) -> Result<Artifact> {
        (**self).upload(name, root, files).await
    }
}

/// Run filesystem or archive work on the blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

/// Newest artifact named `name`, if any.
pub async fn latest<S: ArtifactStore + ?Sized>(store: &S, name: &str) -> Result<Option<Artifact>> {
    let page = store.list_page(name, 1, 1).await?;
    Ok(page.into_iter().next())
}

/// Lazy, restartable sequence of listing pages.
///
/// Nothing is fetched until [`Pages::next_page`] is called, so a consumer that
/// stops early never pays for the pages it did not look at.
pub struct Pages<'a, S: ArtifactStore + ?Sized> {
    store: &'a S,
    name: String,
    per_page: u32,
    next: u32,
    exhausted: bool,
    fetched: u32,
}

impl<'a, S: ArtifactStore + ?Sized> Pages<'a, S> {
    pub fn new(store: &'a S, name: impl Into<String>, per_page: u32) -> Self {
        Self {
            store,
            name: name.into(),
            per_page: per_page.max(1),
            next: 1,
            exhausted: false,
            fetched: 0,
        }
    }

    /// Fetch the next page.
    ///
    /// Returns `Ok(None)` once the listing is exhausted: after an empty page,
    /// or after a page shorter than `per_page`.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Artifact>>> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self
            .store
            .list_page(&self.name, self.next, self.per_page)
            .await?;
        self.fetched += 1;
        self.next += 1;

        if (page.len() as u32) < self.per_page {
            self.exhausted = true;
        }
        if page.is_empty() {
            return Ok(None);
        }
        Ok(Some(page))
    }

    /// Rewind to the first page.
    pub fn restart(&mut self) {
        self.next = 1;
        self.exhausted = false;
    }

    /// Number of list calls made so far (across restarts).
    pub fn pages_fetched(&self) -> u32 {
        self.fetched
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Serves a fixed newest-first listing and records which pages were asked for.
    struct FixedListing {
        artifacts: Vec<Artifact>,
        requested: Mutex<Vec<u32>>,
    }

    impl FixedListing {
        fn new(count: u64) -> Self {
            let artifacts = (1..=count)
                .rev()
                .map(|id| Artifact {
                    id,
                    name: "_extracted-documentation".to_string(),
                    created_at: Utc.timestamp_opt(1_700_000_000 + id as i64, 0).unwrap(),
                    run_id: id * 10,
                })
                .collect();
            Self {
                artifacts,
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ArtifactStore for FixedListing {
        async fn list_page(&self, _name: &str, page: u32, per_page: u32) -> Result<Vec<Artifact>> {
            self.requested.lock().unwrap().push(page);
            let start = ((page - 1) * per_page) as usize;
            Ok(self
                .artifacts
                .iter()
                .skip(start)
                .take(per_page as usize)
                .cloned()
                .collect())
        }

        async fn download(&self, artifact: &Artifact, _dest: &Path) -> Result<PathBuf> {
            Err(StoreError::NotFound(artifact.id.to_string()))
        }

        async fn upload(&self, name: &str, _root: &Path, _files: &[&str]) -> Result<Artifact> {
            Err(StoreError::Config(format!("read-only listing: {name}")))
        }
    }

    fn ids(page: &[Artifact]) -> Vec<u64> {
        page.iter().map(|a| a.id).collect()
    }

    #[tokio::test]
    async fn pages_are_fetched_lazily() {
        let store = FixedListing::new(5);
        let mut pages = Pages::new(&store, "_extracted-documentation", 3);
        assert_eq!(pages.pages_fetched(), 0);

        let first = pages.next_page().await.unwrap().unwrap();
        assert_eq!(ids(&first), vec![5, 4, 3]);
        assert_eq!(*store.requested.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn short_page_ends_the_sequence() {
        let store = FixedListing::new(5);
        let mut pages = Pages::new(&store, "_extracted-documentation", 3);

        pages.next_page().await.unwrap();
        let second = pages.next_page().await.unwrap().unwrap();
        assert_eq!(ids(&second), vec![2, 1]);
        assert!(pages.next_page().await.unwrap().is_none());
        assert_eq!(pages.pages_fetched(), 2);
    }

    #[tokio::test]
    async fn full_last_page_needs_one_empty_probe() {
        let store = FixedListing::new(4);
        let mut pages = Pages::new(&store, "_extracted-documentation", 2);

        assert!(pages.next_page().await.unwrap().is_some());
        assert!(pages.next_page().await.unwrap().is_some());
        assert!(pages.next_page().await.unwrap().is_none());
        assert_eq!(*store.requested.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn restart_rewinds_to_first_page() {
        let store = FixedListing::new(3);
        let mut pages = Pages::new(&store, "_extracted-documentation", 2);

        pages.next_page().await.unwrap();
        pages.next_page().await.unwrap();
        pages.restart();
        let again = pages.next_page().await.unwrap().unwrap();
        assert_eq!(ids(&again), vec![3, 2]);
        assert_eq!(pages.pages_fetched(), 3);
    }

    #[tokio::test]
    async fn latest_returns_newest_or_none() {
        let store = FixedListing::new(3);
        assert_eq!(latest(&store, "x").await.unwrap().map(|a| a.id), Some(3));

        let empty = FixedListing::new(0);
        assert!(latest(&empty, "x").await.unwrap().is_none());
    }
}
