//! OVFRemap Core Library
//!
//! This crate reassigns the identities inside an unpacked OVF export archive
//! so it can be imported next to the virtual machine it was exported from.
//!
//! # Overview
//!
//! An archive holds an OVF descriptor and an `images/<group-id>/<image-id>`
//! tree with a `<image-id>.meta` sidecar per image. Every disk and disk group
//! gets a fresh id, and the change is carried consistently through the
//! descriptor, the sidecars and the file and directory names, keeping
//! snapshot chains intact. The main entry point is [`remap`].
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`descriptor`] - Descriptor parsing, serialization and typed access
//! - [`sidecar`] - `.meta` sidecar files
//! - [`archive`] - Archive scanning and file lookup
//! - [`ids`] - Id allocation and per-run remapping state
//! - [`editor`] - Network adapter, name and descriptor identity edits
//! - [`remap`] - Disk remapping pass
//! - [`sync`] - Image, sidecar and directory synchronization
//! - [`finalize`] - Parent reference rewrite
//! - [`plan`] - Journaled commit of planned filesystem changes
//! - [`engine`] - Orchestrator tying the passes together
//!
//! # Quick Start
//!
//! ```no_run
//! use ovfremap_core::{remap, files_to_transfer, RemapOptions};
//! use std::path::Path;
//!
//! let archive = Path::new("/var/tmp/export");
//! remap(archive, RemapOptions::renamed("web01-copy")).unwrap();
//! for file in files_to_transfer(archive).unwrap() {
//!     println!("{}", file.display());
//! }
//! ```

pub mod archive;
pub mod descriptor;
pub mod editor;
pub mod engine;
pub mod error;
pub mod finalize;
pub mod ids;
pub mod plan;
pub mod remap;
pub mod sidecar;
pub mod sync;

pub use error::{Error, Result};

// Re-export main remap functionality for convenience
pub use engine::{
    files_to_transfer, inspect, recover, remap, remap_with_progress, remap_with_source,
    ArchiveInfo, DiskSummary, ProgressCallback, RemapOptions, RemapPhase, RemapProgress,
    RemapReport,
};

pub use ids::{IdSource, SequentialIds, UuidSource};
pub use remap::DiskMapping;
