//! Cross-file synchronization of image files, sidecars and group directories.
//!
//! Nothing here touches the filesystem except to read sidecars. Renames are
//! planned against the paths found by the initial archive scan and rewritten
//! sidecars are held in memory until [`CrossFileSync::finish`] hands them to
//! the [`RenamePlan`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::archive::ArchiveLayout;
use crate::error::{Error, Result};
use crate::ids::{IdSource, RemapContext};
use crate::plan::RenamePlan;
use crate::sidecar::{sidecar_name, Sidecar, IMAGE_KEY, PUUID_KEY};

/// Keeps image files, sidecars and group directories in step with the
/// descriptor while disks are remapped.
pub struct CrossFileSync<'a> {
    layout: &'a ArchiveLayout,
    plan: &'a mut RenamePlan,
    sidecars: BTreeMap<PathBuf, Sidecar>,
    dirty: BTreeSet<PathBuf>,
}

impl<'a> CrossFileSync<'a> {
    /// Start synchronizing against a scanned archive, planning into `plan`.
    pub fn new(layout: &'a ArchiveLayout, plan: &'a mut RenamePlan) -> Self {
        Self {
            layout,
            plan,
            sidecars: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Plan the file-level changes for one remapped disk.
    ///
    /// The sidecar gets `IMAGE=<new_group_id>` and is renamed to
    /// `<new_image_id>.meta`, the image file is renamed to `<new_image_id>`,
    /// and the image's directory is renamed to `<new_group_id>`.
    pub fn sync_disk(
        &mut self,
        old_image_id: &str,
        new_image_id: &str,
        new_group_id: &str,
    ) -> Result<()> {
        let layout = self.layout;
        let sidecar_path = layout
            .find_sidecar(old_image_id)
            .ok_or_else(|| Error::MissingSidecar {
                image_id: old_image_id.to_string(),
            })?
            .to_path_buf();

        let sidecar = self.sidecar(&sidecar_path)?;
        if sidecar.set(IMAGE_KEY, new_group_id) {
            self.dirty.insert(sidecar_path.clone());
        } else {
            warn!(
                sidecar = %layout.relative(&sidecar_path).display(),
                "sidecar has no IMAGE line"
            );
        }
        self.plan
            .rename_file(&sidecar_path, sibling(&sidecar_path, &sidecar_name(new_image_id)))?;

        let image_path = layout
            .find_file(old_image_id)
            .ok_or_else(|| Error::MissingImage {
                image_id: old_image_id.to_string(),
            })?;
        self.plan
            .rename_file(image_path, sibling(image_path, new_image_id))?;

        let group_dir = image_path.parent().unwrap_or(image_path);
        if layout.is_root(group_dir) {
            return Err(Error::conflict(format!(
                "image '{}' lies directly in the archive root; refusing to rename the root",
                old_image_id
            )));
        }
        self.plan
            .rename_dir(group_dir, sibling(group_dir, new_group_id))?;

        debug!(
            old = old_image_id,
            new = new_image_id,
            group = new_group_id,
            "planned disk file renames"
        );
        Ok(())
    }

    /// Rewrite `PUUID` in every sidecar whose parent was remapped.
    ///
    /// Must run after every disk has been visited, so the identifier map is complete.
    pub fn sweep_parents<S: IdSource>(&mut self, ctx: &RemapContext<S>) -> Result<usize> {
        let paths: Vec<PathBuf> = self.layout.sidecars().map(Path::to_path_buf).collect();
        let mut updated = 0;

        for path in paths {
            let sidecar = self.sidecar(&path)?;
            let Some(new_parent) = sidecar.parent_image().and_then(|p| ctx.mapped_image(p))
            else {
                continue;
            };
            let new_parent = new_parent.to_string();
            sidecar.set(PUUID_KEY, &new_parent);
            self.dirty.insert(path);
            updated += 1;
        }

        info!(updated, "updated sidecar parent pointers");
        Ok(updated)
    }

    /// Hand every modified sidecar to the plan as a rewrite at its original path.
    pub fn finish(self) -> usize {
        let count = self.dirty.len();
        for path in self.dirty {
            if let Some(sidecar) = self.sidecars.get(&path) {
                self.plan.write(path.clone(), sidecar.render());
            }
        }
        count
    }

    fn sidecar(&mut self, path: &Path) -> Result<&mut Sidecar> {
        if !self.sidecars.contains_key(path) {
            let sidecar = Sidecar::load(path)?;
            self.sidecars.insert(path.to_path_buf(), sidecar);
        }
        self.sidecars
            .get_mut(path)
            .ok_or_else(|| Error::MissingSidecar {
                image_id: path.display().to_string(),
            })
    }
}

fn sibling(path: &Path, name: &str) -> PathBuf {
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIds;
    use crate::plan::PlannedOp;
    use std::fs;
    use tempfile::TempDir;

    fn archive() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("images/g1")).unwrap();
        fs::write(root.join("images/g1/i1"), b"base").unwrap();
        fs::write(root.join("images/g1/i1.meta"), "IMAGE=g1\nPUUID=\nEOF\n").unwrap();
        fs::write(root.join("images/g1/i2"), b"snap").unwrap();
        fs::write(root.join("images/g1/i2.meta"), "IMAGE=g1\nPUUID=i1\nEOF\n").unwrap();
        dir
    }

    #[test]
    fn test_sync_disk_plans_renames() {
        let dir = archive();
        let root = dir.path();
        let layout = ArchiveLayout::scan(root).unwrap();
        let mut plan = RenamePlan::new();

        let mut sync = CrossFileSync::new(&layout, &mut plan);
        sync.sync_disk("i1", "n1", "ng").unwrap();
        assert_eq!(sync.finish(), 1);

        let ops = plan.operations();
        assert_eq!(
            ops[0],
            &PlannedOp::Write {
                path: root.join("images/g1/i1.meta"),
                content: "IMAGE=ng\nPUUID=\nEOF\n".to_string()
            }
        );
        assert!(ops.contains(&&PlannedOp::RenameFile {
            from: root.join("images/g1/i1"),
            to: root.join("images/g1/n1"),
        }));
        assert!(ops.contains(&&PlannedOp::RenameFile {
            from: root.join("images/g1/i1.meta"),
            to: root.join("images/g1/n1.meta"),
        }));
        assert_eq!(
            ops.last().unwrap(),
            &&PlannedOp::RenameDir {
                from: root.join("images/g1"),
                to: root.join("images/ng"),
            }
        );
    }

    #[test]
    fn test_shared_group_renamed_once() {
        let dir = archive();
        let layout = ArchiveLayout::scan(dir.path()).unwrap();
        let mut plan = RenamePlan::new();

        let mut sync = CrossFileSync::new(&layout, &mut plan);
        sync.sync_disk("i1", "n1", "ng").unwrap();
        sync.sync_disk("i2", "n2", "ng").unwrap();
        sync.finish();

        let dir_renames = plan
            .operations()
            .into_iter()
            .filter(|op| matches!(op, PlannedOp::RenameDir { .. }))
            .count();
        assert_eq!(dir_renames, 1);
    }

    #[test]
    fn test_same_dir_two_groups_is_conflict() {
        let dir = archive();
        let layout = ArchiveLayout::scan(dir.path()).unwrap();
        let mut plan = RenamePlan::new();

        let mut sync = CrossFileSync::new(&layout, &mut plan);
        sync.sync_disk("i1", "n1", "ga").unwrap();
        let err = sync.sync_disk("i2", "n2", "gb").unwrap_err();
        assert!(matches!(err, Error::FilesystemConflict { .. }));
    }

    #[test]
    fn test_missing_sidecar() {
        let dir = archive();
        fs::remove_file(dir.path().join("images/g1/i1.meta")).unwrap();
        let layout = ArchiveLayout::scan(dir.path()).unwrap();
        let mut plan = RenamePlan::new();

        let mut sync = CrossFileSync::new(&layout, &mut plan);
        let err = sync.sync_disk("i1", "n1", "ng").unwrap_err();
        assert!(matches!(err, Error::MissingSidecar { image_id } if image_id == "i1"));
    }

    #[test]
    fn test_missing_image() {
        let dir = archive();
        fs::remove_file(dir.path().join("images/g1/i1")).unwrap();
        let layout = ArchiveLayout::scan(dir.path()).unwrap();
        let mut plan = RenamePlan::new();

        let mut sync = CrossFileSync::new(&layout, &mut plan);
        let err = sync.sync_disk("i1", "n1", "ng").unwrap_err();
        assert!(matches!(err, Error::MissingImage { .. }));
    }

    #[test]
    fn test_image_in_root_is_conflict() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("i1"), b"data").unwrap();
        fs::write(dir.path().join("i1.meta"), "IMAGE=g1\n").unwrap();
        let layout = ArchiveLayout::scan(dir.path()).unwrap();
        let mut plan = RenamePlan::new();

        let mut sync = CrossFileSync::new(&layout, &mut plan);
        let err = sync.sync_disk("i1", "n1", "ng").unwrap_err();
        assert!(matches!(err, Error::FilesystemConflict { .. }));
    }

    #[test]
    fn test_sweep_parents_uses_identifier_map() {
        let dir = archive();
        let root = dir.path();
        let layout = ArchiveLayout::scan(root).unwrap();
        let mut plan = RenamePlan::new();
        let mut ctx = RemapContext::new(SequentialIds::new("n"));
        ctx.record_image("i1", "n1");
        ctx.record_image("i2", "n2");

        let mut sync = CrossFileSync::new(&layout, &mut plan);
        sync.sync_disk("i1", "n1", "ng").unwrap();
        sync.sync_disk("i2", "n2", "ng").unwrap();
        assert_eq!(sync.sweep_parents(&ctx).unwrap(), 1);
        sync.finish();

        let writes: Vec<_> = plan
            .operations()
            .into_iter()
            .filter_map(|op| match op {
                PlannedOp::Write { path, content } => Some((path.clone(), content.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(writes.len(), 2);
        assert!(writes.contains(&(
            root.join("images/g1/i2.meta"),
            "IMAGE=ng\nPUUID=n1\nEOF\n".to_string()
        )));
    }
}
