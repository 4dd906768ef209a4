//! Ordered, journaled commit of filesystem changes.
//!
//! The remapping passes never touch the filesystem directly. They record
//! content rewrites and renames in a [`RenamePlan`], which is applied in one
//! step: all rewrites (at their original paths), then file renames, then
//! directory renames. Before each step a record is appended to a write-ahead
//! journal so that a failed commit can be undone in-process and an
//! interrupted one can be undone later by [`recover`].
//!
//! Journal format: one record per line, `{crc32_hex}|{json}`.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A planned filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedOp {
    /// Replace the content of an existing file.
    Write { path: PathBuf, content: String },
    /// Rename a file within its directory.
    RenameFile { from: PathBuf, to: PathBuf },
    /// Rename a directory.
    RenameDir { from: PathBuf, to: PathBuf },
}

impl PlannedOp {
    fn phase(&self) -> u8 {
        match self {
            PlannedOp::Write { .. } => 0,
            PlannedOp::RenameFile { .. } => 1,
            PlannedOp::RenameDir { .. } => 2,
        }
    }
}

/// Filesystem changes collected during a run, applied by [`commit`](Self::commit).
#[derive(Debug, Default, Clone)]
pub struct RenamePlan {
    ops: Vec<PlannedOp>,
    sources: HashSet<PathBuf>,
    targets: HashSet<PathBuf>,
}

impl RenamePlan {
    /// Create an empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Planned operations in commit order.
    pub fn operations(&self) -> Vec<&PlannedOp> {
        let mut ops: Vec<&PlannedOp> = self.ops.iter().collect();
        ops.sort_by_key(|op| op.phase());
        ops
    }

    /// Number of planned operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if nothing is planned.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Plan a content rewrite. A later write to the same path replaces an earlier one.
    pub fn write(&mut self, path: impl Into<PathBuf>, content: impl Into<String>) {
        let path = path.into();
        let content = content.into();

        for op in &mut self.ops {
            if let PlannedOp::Write { path: p, content: c } = op {
                if *p == path {
                    *c = content;
                    return;
                }
            }
        }
        self.ops.push(PlannedOp::Write { path, content });
    }

    /// Plan a file rename.
    ///
    /// # Errors
    ///
    /// [`Error::FilesystemConflict`] if the file is already planned to move,
    /// or the target already exists or is the target of another planned rename.
    pub fn rename_file(&mut self, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Result<()> {
        let (from, to) = (from.into(), to.into());
        if self.sources.contains(&from) {
            return Err(Error::conflict(format!(
                "file '{}' would be renamed twice",
                from.display()
            )));
        }
        self.claim_target(&to)?;
        self.sources.insert(from.clone());
        self.ops.push(PlannedOp::RenameFile { from, to });
        Ok(())
    }

    /// Plan a directory rename. Planning the same rename twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::FilesystemConflict`] if the directory is already planned to
    /// move elsewhere, or the target exists or is otherwise claimed.
    pub fn rename_dir(&mut self, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Result<()> {
        let (from, to) = (from.into(), to.into());

        let existing = self.ops.iter().find_map(|op| match op {
            PlannedOp::RenameDir { from: f, to: t } if *f == from => Some(t),
            _ => None,
        });
        if let Some(planned_to) = existing {
            if *planned_to == to {
                return Ok(());
            }
            return Err(Error::conflict(format!(
                "directory '{}' would be renamed to both '{}' and '{}'",
                from.display(),
                planned_to.display(),
                to.display()
            )));
        }

        self.claim_target(&to)?;
        self.ops.push(PlannedOp::RenameDir { from, to });
        Ok(())
    }

    fn claim_target(&mut self, to: &Path) -> Result<()> {
        if to.symlink_metadata().is_ok() || !self.targets.insert(to.to_path_buf()) {
            return Err(Error::conflict(format!(
                "rename target '{}' already exists",
                to.display()
            )));
        }
        Ok(())
    }

    /// Apply the plan, journaling each step to `journal_path`.
    ///
    /// Journaled paths are stored relative to the journal's directory, so
    /// [`recover`] finds them however the archive path is spelled later.
    ///
    /// On failure every applied step is undone in reverse order and the
    /// original error is returned. The journal is removed unless the undo
    /// itself fails, in which case [`Error::Rollback`] is returned and the
    /// journal is left for [`recover`].
    pub fn commit(&self, journal_path: &Path) -> Result<usize> {
        if journal_path.exists() {
            return Err(Error::conflict(format!(
                "journal '{}' from an interrupted run exists; recover the archive first",
                journal_path.display()
            )));
        }
        if self.ops.is_empty() {
            debug!("nothing to commit");
            return Ok(0);
        }

        let ops = self.operations();
        let mut journal = Journal::create(journal_path)?;
        journal.append(&JournalRecord::Begin {
            operations: ops.len(),
        })?;

        let mut applied: Vec<JournalRecord> = Vec::with_capacity(ops.len());
        for op in ops {
            if let Err(err) = apply(op, &mut journal, &mut applied) {
                warn!(error = %err, applied = applied.len(), "commit failed, rolling back");
                return match undo_all(&journal.root, &applied) {
                    Ok(()) => {
                        journal.discard()?;
                        Err(err)
                    }
                    Err(undo_err) => Err(Error::Rollback {
                        cause: err.to_string(),
                        message: undo_err.to_string(),
                    }),
                };
            }
        }

        journal.append(&JournalRecord::Done)?;
        journal.discard()?;
        info!(operations = applied.len(), "committed plan");
        Ok(applied.len())
    }
}

/// Undo an interrupted commit recorded in `journal_path`.
///
/// Returns `None` if there is no journal, otherwise the number of steps
/// undone (zero for a journal that reached its final record). The journal
/// is only removed once every step has been undone.
pub fn recover(journal_path: &Path) -> Result<Option<usize>> {
    if !journal_path.exists() {
        return Ok(None);
    }

    let root = journal_root(journal_path);
    let records = Journal::read(journal_path)?;
    let undone = if matches!(records.last(), Some(JournalRecord::Done)) {
        0
    } else {
        let steps: Vec<JournalRecord> = records
            .into_iter()
            .filter(|r| !matches!(r, JournalRecord::Begin { .. } | JournalRecord::Done))
            .collect();
        undo_all(&root, &steps)?;
        steps.len()
    };

    fs::remove_file(journal_path).map_err(|e| Error::io(e, journal_path))?;
    info!(undone, "recovered archive from journal");
    Ok(Some(undone))
}

/// A journal line. Paths are relative to the journal's directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
enum JournalRecord {
    /// Commit started.
    Begin { operations: usize },
    /// About to overwrite `path`; `previous` is its old content.
    Wrote { path: PathBuf, previous: String },
    /// About to rename `from` to `to`.
    Renamed { from: PathBuf, to: PathBuf },
    /// Commit finished.
    Done,
}

fn apply(op: &PlannedOp, journal: &mut Journal, applied: &mut Vec<JournalRecord>) -> Result<()> {
    match op {
        PlannedOp::Write { path, content } => {
            let previous = fs::read_to_string(path).map_err(|e| Error::io(e, path))?;
            let record = JournalRecord::Wrote {
                path: journal.relative(path),
                previous,
            };
            journal.append(&record)?;
            applied.push(record);
            fs::write(path, content).map_err(|e| Error::io(e, path))?;
            debug!(path = %path.display(), "rewrote file");
        }
        PlannedOp::RenameFile { from, to } | PlannedOp::RenameDir { from, to } => {
            if to.symlink_metadata().is_ok() {
                return Err(Error::conflict(format!(
                    "rename target '{}' already exists",
                    to.display()
                )));
            }
            let record = JournalRecord::Renamed {
                from: journal.relative(from),
                to: journal.relative(to),
            };
            journal.append(&record)?;
            fs::rename(from, to).map_err(|e| Error::io(e, from))?;
            applied.push(record);
            debug!(from = %from.display(), to = %to.display(), "renamed");
        }
    }
    Ok(())
}

/// Undo journaled steps in reverse order, resolving paths against `root`.
///
/// A rename whose target is missing but whose source is present was never
/// performed and is skipped. A rename with neither side on disk cannot be
/// undone and is an error.
fn undo_all(root: &Path, steps: &[JournalRecord]) -> Result<()> {
    for step in steps.iter().rev() {
        match step {
            JournalRecord::Wrote { path, previous } => {
                let path = root.join(path);
                fs::write(&path, previous).map_err(|e| Error::io(e, &path))?;
            }
            JournalRecord::Renamed { from, to } => {
                let (from, to) = (root.join(from), root.join(to));
                let from_exists = from.symlink_metadata().is_ok();
                let to_exists = to.symlink_metadata().is_ok();
                if to_exists && !from_exists {
                    fs::rename(&to, &from).map_err(|e| Error::io(e, &to))?;
                } else if !to_exists && !from_exists {
                    return Err(Error::journal(format!(
                        "cannot undo rename of '{}' to '{}': neither exists",
                        from.display(),
                        to.display()
                    )));
                }
            }
            JournalRecord::Begin { .. } | JournalRecord::Done => {}
        }
    }
    Ok(())
}

/// Directory journaled paths are relative to.
fn journal_root(journal_path: &Path) -> PathBuf {
    journal_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// Append-only journal file.
struct Journal {
    path: PathBuf,
    root: PathBuf,
    file: File,
}

impl Journal {
    fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::io(e, path))?;
        Ok(Self {
            path: path.to_path_buf(),
            root: journal_root(path),
            file,
        })
    }

    /// `path` as stored in a record.
    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| Error::journal(format!("failed to serialize record: {}", e)))?;
        let crc = crc32fast::hash(json.as_bytes());
        writeln!(self.file, "{:08x}|{}", crc, json).map_err(|e| Error::io(e, &self.path))?;
        self.file.sync_data().map_err(|e| Error::io(e, &self.path))?;
        Ok(())
    }

    fn discard(self) -> Result<()> {
        drop(self.file);
        fs::remove_file(&self.path).map_err(|e| Error::io(e, &self.path))
    }

    fn read(path: &Path) -> Result<Vec<JournalRecord>> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let mut records = Vec::new();

        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| Error::io(e, path))?;
            if line.is_empty() {
                continue;
            }

            let Some((crc, json)) = line.split_once('|') else {
                warn!(line = line_num + 1, "malformed journal line, stopping");
                break;
            };
            let expected = u32::from_str_radix(crc, 16)
                .map_err(|_| Error::journal(format!("invalid CRC32 at line {}", line_num + 1)))?;
            if crc32fast::hash(json.as_bytes()) != expected {
                // A torn final write; everything before it is intact.
                warn!(line = line_num + 1, "journal CRC mismatch, stopping");
                break;
            }

            let record = serde_json::from_str(json).map_err(|e| {
                Error::journal(format!("bad record at line {}: {}", line_num + 1, e))
            })?;
            records.push(record);
        }

        Ok(records)
    }
}
