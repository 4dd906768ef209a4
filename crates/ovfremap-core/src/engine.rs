//! Remap orchestrator for unpacked export archives.
//!
//! A run goes through these passes, all against in-memory state:
//! 1. Scan the archive and load the descriptor
//! 2. Optional edits: strip network adapters, rename, new descriptor identity
//! 3. Remap every disk, planning the matching file and directory renames
//! 4. Rewrite parent references in the descriptor and the sidecars
//! 5. Commit the plan through the journal
//!
//! # Example
//!
//! ```no_run
//! use ovfremap_core::engine::{remap, RemapOptions};
//! use std::path::Path;
//!
//! let report = remap(Path::new("/var/tmp/export"), RemapOptions::default()).unwrap();
//! println!("{} disks remapped", report.disks.len());
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::archive::{ArchiveLayout, IMAGES_DIR, JOURNAL_FILE_NAME};
use crate::descriptor::{
    split_composite, Descriptor, DescriptorLayout, DESCRIPTOR_EXTENSION, NIL_ID,
};
use crate::editor;
use crate::error::{Error, Result};
use crate::finalize::finalize;
use crate::ids::{IdSource, RemapContext, UuidSource};
use crate::plan::{self, RenamePlan};
use crate::remap::{remap_disks, reserve_existing, DiskMapping};
use crate::sidecar::SIDECAR_EXTENSION;
use crate::sync::CrossFileSync;

/// Options for a remap run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapOptions {
    /// Remove network adapter items from the descriptor.
    pub strip_nics: bool,
    /// New display name, if the virtual machine should be renamed.
    pub new_name: Option<String>,
    /// Give every disk and disk group a fresh id.
    pub remap_disks: bool,
    /// Give the descriptor a fresh id and rename its file and directory.
    pub rename_descriptor: bool,
}

impl Default for RemapOptions {
    fn default() -> Self {
        Self {
            strip_nics: true,
            new_name: None,
            remap_disks: true,
            rename_descriptor: true,
        }
    }
}

impl RemapOptions {
    /// Default options with a new display name.
    pub fn renamed(name: impl Into<String>) -> Self {
        Self {
            new_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Options that keep every existing identity; only the optional edits run.
    pub fn preserve_ids() -> Self {
        Self {
            remap_disks: false,
            rename_descriptor: false,
            ..Self::default()
        }
    }
}

/// Phase of a remap run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapPhase {
    /// Scanning the archive and parsing the descriptor.
    Loading,
    /// Applying the optional descriptor edits.
    EditingDescriptor,
    /// Assigning new disk identities.
    RemappingDisks,
    /// Rewriting parent references.
    Finalizing,
    /// Applying planned changes to the filesystem.
    Committing,
    /// Run complete.
    Complete,
}

impl std::fmt::Display for RemapPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemapPhase::Loading => write!(f, "Loading"),
            RemapPhase::EditingDescriptor => write!(f, "Editing descriptor"),
            RemapPhase::RemappingDisks => write!(f, "Remapping disks"),
            RemapPhase::Finalizing => write!(f, "Finalizing"),
            RemapPhase::Committing => write!(f, "Committing"),
            RemapPhase::Complete => write!(f, "Complete"),
        }
    }
}

/// Progress information for a remap run.
#[derive(Debug, Clone)]
pub struct RemapProgress {
    /// Current phase.
    pub phase: RemapPhase,
    /// Disks remapped so far.
    pub current_disk: usize,
    /// Total number of disks, once known.
    pub total_disks: usize,
}

impl RemapProgress {
    /// Create progress information for `phase`.
    pub fn new(phase: RemapPhase) -> Self {
        Self {
            phase,
            current_disk: 0,
            total_disks: 0,
        }
    }

    /// Percentage of disks remapped.
    pub fn percent_complete(&self) -> f64 {
        if self.total_disks == 0 {
            return match self.phase {
                RemapPhase::Complete => 100.0,
                _ => 0.0,
            };
        }
        (self.current_disk as f64 / self.total_disks as f64) * 100.0
    }
}

/// Type alias for the progress callback function.
pub type ProgressCallback = Box<dyn Fn(RemapProgress) + Send>;

/// What a remap run changed.
#[derive(Debug, Clone)]
pub struct RemapReport {
    /// Descriptor location after the run.
    pub descriptor_path: PathBuf,
    /// New descriptor id, if it was reassigned.
    pub descriptor_id: Option<String>,
    /// Per-disk identity changes in document order.
    pub disks: Vec<DiskMapping>,
    /// Old group id → new group id.
    pub group_map: BTreeMap<String, String>,
    /// New composite id of the snapshot chain root, if one was found.
    pub chain_root: Option<String>,
    /// Network adapter items removed.
    pub nics_removed: usize,
    /// Filesystem operations committed.
    pub operations: usize,
}

/// Remap an unpacked archive with fresh random ids.
pub fn remap(archive_dir: &Path, options: RemapOptions) -> Result<RemapReport> {
    remap_with_progress(archive_dir, options, None)
}

/// Remap an unpacked archive, reporting progress through `progress_callback`.
pub fn remap_with_progress(
    archive_dir: &Path,
    options: RemapOptions,
    progress_callback: Option<ProgressCallback>,
) -> Result<RemapReport> {
    remap_with_source(archive_dir, options, UuidSource, progress_callback)
}

/// Remap an unpacked archive, drawing new ids from `source`.
///
/// Either every change lands or, on error, the archive is left as it was.
pub fn remap_with_source<S: IdSource>(
    archive_dir: &Path,
    options: RemapOptions,
    source: S,
    progress_callback: Option<ProgressCallback>,
) -> Result<RemapReport> {
    let report_progress = |progress: RemapProgress| {
        if let Some(ref callback) = progress_callback {
            callback(progress);
        }
    };

    let mut progress = RemapProgress::new(RemapPhase::Loading);
    report_progress(progress.clone());

    let layout = ArchiveLayout::scan(archive_dir)?;
    let descriptor_path = layout.descriptor()?.to_path_buf();
    let mut descriptor = Descriptor::load(&descriptor_path)?;
    info!(
        archive = %archive_dir.display(),
        descriptor = %layout.relative(&descriptor_path).display(),
        "loaded archive"
    );

    let mut ctx = RemapContext::new(source);
    let mut plan = RenamePlan::new();
    reserve_existing(descriptor.root(), &mut ctx)?;

    // Descriptor edits
    progress.phase = RemapPhase::EditingDescriptor;
    report_progress(progress.clone());

    let root = descriptor.root_mut();
    let nics_removed = if options.strip_nics {
        editor::strip_nics(root)?
    } else {
        0
    };
    if let Some(name) = &options.new_name {
        editor::rename(root, name)?;
    }
    let descriptor_id = if options.rename_descriptor {
        Some(editor::reassign_identity(
            root,
            &mut ctx,
            &layout,
            &descriptor_path,
            &mut plan,
        )?)
    } else {
        None
    };

    // Disks
    let mut disks = Vec::new();
    if options.remap_disks {
        progress.phase = RemapPhase::RemappingDisks;
        report_progress(progress.clone());

        let mut sync = CrossFileSync::new(&layout, &mut plan);
        disks = remap_disks(root, &mut ctx, &mut sync, |done, total| {
            progress.current_disk = done;
            progress.total_disks = total;
            report_progress(progress.clone());
        })?;

        progress.phase = RemapPhase::Finalizing;
        report_progress(progress.clone());

        finalize(root, &ctx)?;
        sync.sweep_parents(&ctx)?;
        sync.finish();
    }

    // Commit
    progress.phase = RemapPhase::Committing;
    report_progress(progress.clone());

    let edited = nics_removed > 0
        || options.new_name.is_some()
        || descriptor_id.is_some()
        || !disks.is_empty();
    if edited {
        plan.write(&descriptor_path, descriptor.render()?);
    } else {
        debug!("descriptor unchanged, not rewriting it");
    }
    let operations = plan.commit(&layout.root().join(JOURNAL_FILE_NAME))?;

    let final_path = match &descriptor_id {
        Some(id) => {
            let dir = descriptor_path.parent().unwrap_or(&descriptor_path);
            dir.with_file_name(id).join(format!("{}.{}", id, DESCRIPTOR_EXTENSION))
        }
        None => descriptor_path.clone(),
    };

    progress.phase = RemapPhase::Complete;
    report_progress(progress);

    info!(
        disks = disks.len(),
        operations,
        descriptor = %final_path.display(),
        "remap complete"
    );

    Ok(RemapReport {
        descriptor_path: final_path,
        descriptor_id,
        disks,
        group_map: ctx.ids.group_map().clone(),
        chain_root: ctx.chain_root,
        nics_removed,
        operations,
    })
}

/// Files to copy to the target store, relative to the archive root.
///
/// Every referenced image and its sidecar, in reference-table order, followed
/// by the descriptor.
pub fn files_to_transfer(archive_dir: &Path) -> Result<Vec<PathBuf>> {
    let layout = ArchiveLayout::scan(archive_dir)?;
    let descriptor_path = layout.descriptor()?;
    if layout.is_root(descriptor_path.parent().unwrap_or(descriptor_path)) {
        return Err(Error::layout(format!(
            "descriptor '{}' is not inside a named directory",
            layout.relative(descriptor_path).display()
        )));
    }

    let descriptor = Descriptor::load(descriptor_path)?;
    let images = Path::new(IMAGES_DIR);
    let mut files = Vec::new();

    for file in descriptor.root().reference_files() {
        let Some(href) = file.href() else {
            warn!(id = file.id().unwrap_or_default(), "reference entry without href");
            continue;
        };
        files.push(images.join(href));
        files.push(images.join(format!("{}.{}", href, SIDECAR_EXTENSION)));
    }
    files.push(layout.relative(descriptor_path).to_path_buf());

    Ok(files)
}

/// Summary of one disk in an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSummary {
    /// Image id.
    pub image_id: String,
    /// Owning group id.
    pub group_id: String,
    /// Parent image id for snapshot disks.
    pub parent: Option<String>,
    /// Image size in bytes.
    pub size_bytes: u64,
}

/// Summary information about an archive.
#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    /// Descriptor path relative to the archive root.
    pub descriptor: PathBuf,
    /// Display name.
    pub name: Option<String>,
    /// Template id.
    pub template_id: Option<String>,
    /// Disks in document order.
    pub disks: Vec<DiskSummary>,
    /// Number of network adapters.
    pub nics: usize,
    /// Total size of all disks in bytes.
    pub total_disk_size: u64,
}

/// Get information about an archive without changing it.
pub fn inspect(archive_dir: &Path) -> Result<ArchiveInfo> {
    let layout = ArchiveLayout::scan(archive_dir)?;
    let descriptor_path = layout.descriptor()?;
    let descriptor = Descriptor::load(descriptor_path)?;
    let root = descriptor.root();
    let content = root.content()?;

    let sizes: BTreeMap<String, u64> = root
        .reference_files()
        .iter()
        .filter_map(|f| Some((f.id()?.to_string(), f.size()?)))
        .collect();

    let items = root.device_items()?;
    let mut disks = Vec::new();
    for item in items.iter().filter(|i| i.is_disk()) {
        let image_id = item.instance_id().unwrap_or_default();
        let host_resource = item.host_resource().unwrap_or_default();
        let group_id = split_composite(&host_resource).0.to_string();

        let size_bytes = match sizes.get(&image_id) {
            Some(size) => *size,
            None => match layout.find_file(&image_id) {
                Some(path) => fs::metadata(path).map_err(|e| Error::io(e, path))?.len(),
                None => 0,
            },
        };

        disks.push(DiskSummary {
            parent: item.parent().filter(|p| !p.is_empty() && p != NIL_ID),
            image_id,
            group_id,
            size_bytes,
        });
    }

    Ok(ArchiveInfo {
        descriptor: layout.relative(descriptor_path).to_path_buf(),
        name: content.child("Name").map(|e| e.text()),
        template_id: content.child("TemplateId").map(|e| e.text()),
        nics: items.iter().filter(|i| i.is_nic()).count(),
        total_disk_size: disks.iter().map(|d| d.size_bytes).sum(),
        disks,
    })
}

/// Undo a commit that was interrupted before it finished.
///
/// Returns `None` when the archive has no journal, otherwise the number of
/// journaled steps undone.
pub fn recover(archive_dir: &Path) -> Result<Option<usize>> {
    plan::recover(&archive_dir.join(JOURNAL_FILE_NAME))
}
