//! Descriptor store.
//!
//! Loads an OVF descriptor into a mutable element tree and renders it back to
//! text. The typed views in [`accessors`] are what the remapping passes use.

pub mod accessors;
pub mod tree;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

pub use accessors::{
    composite_id, split_composite, DescriptorLayout, DeviceItem, DiskSectionEntry, ReferenceFile,
    ResourceType, SectionKind, DISK_RESOURCE_TYPE, NIC_RESOURCE_TYPE, NIL_ID,
};
pub use tree::{local_name, Document, Element, Node};

/// File extension of descriptor files.
pub const DESCRIPTOR_EXTENSION: &str = "ovf";

/// A descriptor loaded from disk.
#[derive(Debug, Clone)]
pub struct Descriptor {
    path: PathBuf,
    document: Document,
}

impl Descriptor {
    /// Read and parse the descriptor at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(e, path))?;
        let document = Document::parse(&content)?;
        debug!(path = %path.display(), "loaded descriptor");

        Ok(Self {
            path: path.to_path_buf(),
            document,
        })
    }

    /// Build a descriptor from already-parsed content.
    pub fn from_document(path: impl Into<PathBuf>, document: Document) -> Self {
        Self {
            path: path.into(),
            document,
        }
    }

    /// Where the descriptor was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The `ovf:Envelope` root.
    pub fn root(&self) -> &Element {
        self.document.root()
    }

    /// The `ovf:Envelope` root, mutably.
    pub fn root_mut(&mut self) -> &mut Element {
        self.document.root_mut()
    }

    /// Serialize the current tree.
    pub fn render(&self) -> Result<String> {
        self.document.to_xml()
    }
}
