//! Zip packaging for artifact payloads.
//!
//! GitHub serves and accepts artifacts as zip archives. Both helpers work on
//! flat file lists relative to a root directory.

use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Result, StoreError};

/// Pack `files` (relative to `root`) into an in-memory zip archive.
pub fn pack(root: &Path, files: &[&str]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for rel in files {
        let rel_path = checked_relative(rel)?;
        let path = root.join(&rel_path);
        let mut data = Vec::new();
        std::fs::File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut data))
            .map_err(|e| StoreError::io(&path, e))?;

        // Zip entry names always use forward slashes.
        let entry = rel_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        writer.start_file(entry, options)?;
        writer
            .write_all(&data)
            .map_err(|e| StoreError::io(&path, e))?;
    }

    let cursor = writer.finish()?;
    Ok(cursor.into_inner())
}

/// Unpack a zip archive into `dest`, creating it if needed.
///
/// Entries that would land outside `dest` are rejected. Returns the
/// relative paths of the files written.
pub fn unpack(bytes: &[u8], dest: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest).map_err(|e| StoreError::io(dest, e))?;
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut written = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(StoreError::Archive(format!(
                "entry escapes destination: {}",
                entry.name()
            )));
        };
        let out_path = dest.join(&rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|e| StoreError::io(&out_path, e))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let mut out = std::fs::File::create(&out_path).map_err(|e| StoreError::io(&out_path, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| StoreError::io(&out_path, e))?;
        written.push(rel);
    }

    Ok(written)
}

/// Reject absolute paths and `..` so uploads cannot reach outside `root`.
pub(crate) fn checked_relative(rel: &str) -> Result<PathBuf> {
    let path = PathBuf::from(rel);
    let ok = !rel.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(path)
    } else {
        Err(StoreError::Config(format!(
            "artifact file must be a relative path inside the upload root: {rel}"
        )))
    }
}
