//! Unpacked export archive layout.
//!
//! An archive root holds a descriptor (`*.ovf`) inside a named subdirectory
//! and an `images/<group-id>/<image-id>[.meta]` tree. The scan is a single
//! sorted walk, so lookups are deterministic when a name occurs twice.

use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::descriptor::DESCRIPTOR_EXTENSION;
use crate::error::{Error, Result};
use crate::sidecar::{sidecar_name, SIDECAR_EXTENSION};

/// Directory holding the image tree, relative to the archive root.
pub const IMAGES_DIR: &str = "images";

/// Name of the commit journal kept at the archive root while committing.
pub const JOURNAL_FILE_NAME: &str = ".ovfremap.journal";

/// Files found under an archive root.
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    root: PathBuf,
    files: Vec<PathBuf>,
}

impl ArchiveLayout {
    /// Walk `root` and record every regular file beneath it.
    pub fn scan(root: &Path) -> Result<Self> {
        let mut files = Vec::new();

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                match e.into_io_error() {
                    Some(io) => Error::io(io, path),
                    None => Error::conflict(format!("filesystem loop under '{}'", path.display())),
                }
            })?;

            if entry.file_type().is_file() && entry.file_name() != JOURNAL_FILE_NAME {
                files.push(entry.into_path());
            }
        }

        debug!(root = %root.display(), files = files.len(), "scanned archive");
        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    /// The archive root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The first descriptor file in walk order.
    pub fn descriptor(&self) -> Result<&Path> {
        self.files
            .iter()
            .find(|p| has_extension(p, DESCRIPTOR_EXTENSION))
            .map(PathBuf::as_path)
            .ok_or_else(|| Error::MissingDescriptor {
                root: self.root.clone(),
            })
    }

    /// The first file named exactly `name`, anywhere under the root.
    pub fn find_file(&self, name: &str) -> Option<&Path> {
        self.files
            .iter()
            .find(|p| p.file_name().is_some_and(|n| n == name))
            .map(PathBuf::as_path)
    }

    /// The sidecar of `image_id`, anywhere under the root.
    pub fn find_sidecar(&self, image_id: &str) -> Option<&Path> {
        self.find_file(&sidecar_name(image_id))
    }

    /// Every sidecar file in walk order.
    pub fn sidecars(&self) -> impl Iterator<Item = &Path> {
        self.files
            .iter()
            .filter(|p| has_extension(p, SIDECAR_EXTENSION))
            .map(PathBuf::as_path)
    }

    /// `path` relative to the archive root.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    /// True if `dir` is the archive root itself.
    pub fn is_root(&self, dir: &Path) -> bool {
        dir == self.root
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e == ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn layout() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("master/vms/t1")).unwrap();
        fs::create_dir_all(root.join("images/g1")).unwrap();
        fs::write(root.join("master/vms/t1/t1.ovf"), "<Envelope/>").unwrap();
        fs::write(root.join("images/g1/i1"), b"data").unwrap();
        fs::write(root.join("images/g1/i1.meta"), "IMAGE=g1\n").unwrap();
        fs::write(root.join(JOURNAL_FILE_NAME), "").unwrap();
        dir
    }

    #[test]
    fn test_scan_finds_descriptor() {
        let dir = layout();
        let archive = ArchiveLayout::scan(dir.path()).unwrap();
        let descriptor = archive.descriptor().unwrap();
        assert_eq!(
            archive.relative(descriptor),
            Path::new("master/vms/t1/t1.ovf")
        );
    }

    #[test]
    fn test_find_image_and_sidecar() {
        let dir = layout();
        let archive = ArchiveLayout::scan(dir.path()).unwrap();
        assert_eq!(
            archive.find_file("i1").unwrap(),
            dir.path().join("images/g1/i1")
        );
        assert_eq!(
            archive.find_sidecar("i1").unwrap(),
            dir.path().join("images/g1/i1.meta")
        );
        assert!(archive.find_sidecar("i2").is_none());
    }

    #[test]
    fn test_sidecars_listing() {
        let dir = layout();
        let archive = ArchiveLayout::scan(dir.path()).unwrap();
        assert_eq!(archive.sidecars().count(), 1);
    }

    #[test]
    fn test_journal_is_not_listed() {
        let dir = layout();
        let archive = ArchiveLayout::scan(dir.path()).unwrap();
        assert!(archive.find_file(JOURNAL_FILE_NAME).is_none());
    }

    #[test]
    fn test_missing_descriptor() {
        let dir = TempDir::new().unwrap();
        let archive = ArchiveLayout::scan(dir.path()).unwrap();
        assert!(matches!(
            archive.descriptor(),
            Err(Error::MissingDescriptor { .. })
        ));
    }

    #[test]
    fn test_is_root() {
        let dir = layout();
        let archive = ArchiveLayout::scan(dir.path()).unwrap();
        assert!(archive.is_root(dir.path()));
        assert!(!archive.is_root(&dir.path().join("images")));
    }
}
