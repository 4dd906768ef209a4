//! Typed access to the parts of an OVF descriptor the remapping passes touch.
//!
//! Sections are classified once by their `xsi:type`, device items by their
//! `ResourceType`, and all element/attribute lookups go through local names,
//! so the passes never inspect raw qualified names.

use std::ops::{Deref, DerefMut};

use super::tree::{local_name, Element};
use crate::error::{Error, Result};

/// `ResourceType` value of a disk drive item.
pub const DISK_RESOURCE_TYPE: &str = "17";

/// `ResourceType` value of a network adapter item.
pub const NIC_RESOURCE_TYPE: &str = "10";

/// Reserved all-zero identity that is never replaced.
pub const NIL_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Kind of an OVF `Section`, derived from its `xsi:type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// `ovf:VirtualHardwareSection_Type` holding device items.
    VirtualHardware,
    /// `ovf:DiskSection_Type` holding disk entries.
    Disk,
    /// `ovf:OperatingSystemSection_Type`.
    OperatingSystem,
    /// `ovf:NetworkSection_Type`.
    Network,
    /// Anything else.
    Other,
}

impl SectionKind {
    /// Classify a `Section` element.
    pub fn of(section: &Element) -> Self {
        match section.attr("type").map(local_name) {
            Some("VirtualHardwareSection_Type") => SectionKind::VirtualHardware,
            Some("DiskSection_Type") => SectionKind::Disk,
            Some("OperatingSystemSection_Type") => SectionKind::OperatingSystem,
            Some("NetworkSection_Type") => SectionKind::Network,
            _ => SectionKind::Other,
        }
    }
}

/// Resource type of a hardware device item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceType {
    /// A disk drive (`17`).
    Disk,
    /// A network adapter (`10`).
    NetworkAdapter,
    /// Any other resource type, kept verbatim.
    Other(String),
}

impl ResourceType {
    fn parse(value: &str) -> Self {
        match value.trim() {
            DISK_RESOURCE_TYPE => ResourceType::Disk,
            NIC_RESOURCE_TYPE => ResourceType::NetworkAdapter,
            other => ResourceType::Other(other.to_string()),
        }
    }
}

/// Split a composite `<group-id>/<image-id>` reference at its last separator.
///
/// A reference without a separator has an empty group id.
pub fn split_composite(composite: &str) -> (&str, &str) {
    composite.rsplit_once('/').unwrap_or(("", composite))
}

/// Join a group id and an image id into a composite reference.
pub fn composite_id(group_id: &str, image_id: &str) -> String {
    format!("{}/{}", group_id, image_id)
}

/// A hardware `Item` element.
#[derive(Debug)]
pub struct DeviceItem<E>(E);

impl<E: Deref<Target = Element>> DeviceItem<E> {
    /// Wrap an `Item` element.
    pub fn new(element: E) -> Self {
        Self(element)
    }

    fn field(&self, local: &str) -> Option<String> {
        self.0.child(local).map(|e| e.text().trim().to_string())
    }

    /// The item's resource type, if it has one.
    pub fn resource_type(&self) -> Option<ResourceType> {
        self.field("ResourceType").map(|v| ResourceType::parse(&v))
    }

    /// `InstanceId` text.
    pub fn instance_id(&self) -> Option<String> {
        self.field("InstanceId")
    }

    /// `HostResource` text (a composite id for disks).
    pub fn host_resource(&self) -> Option<String> {
        self.field("HostResource")
    }

    /// `Parent` text (the parent image id for snapshot disks).
    pub fn parent(&self) -> Option<String> {
        self.field("Parent")
    }

    /// True if the item is a disk drive with both an instance id and a host resource.
    pub fn is_disk(&self) -> bool {
        self.resource_type() == Some(ResourceType::Disk)
            && self.0.child("InstanceId").is_some()
            && self.0.child("HostResource").is_some()
    }

    /// True if the item is a network adapter.
    pub fn is_nic(&self) -> bool {
        self.resource_type() == Some(ResourceType::NetworkAdapter)
    }
}

impl<E: DerefMut<Target = Element>> DeviceItem<E> {
    fn set_field(&mut self, local: &str, value: &str) -> bool {
        match self.0.child_mut(local) {
            Some(e) => {
                e.set_text(value);
                true
            }
            None => false,
        }
    }

    /// Overwrite `InstanceId`.
    pub fn set_instance_id(&mut self, value: &str) -> bool {
        self.set_field("InstanceId", value)
    }

    /// Overwrite `HostResource`.
    pub fn set_host_resource(&mut self, value: &str) -> bool {
        self.set_field("HostResource", value)
    }

    /// Overwrite `Parent`.
    pub fn set_parent(&mut self, value: &str) -> bool {
        self.set_field("Parent", value)
    }
}

/// A `References/File` entry.
#[derive(Debug)]
pub struct ReferenceFile<E>(E);

impl<E: Deref<Target = Element>> ReferenceFile<E> {
    /// Wrap a `File` element.
    pub fn new(element: E) -> Self {
        Self(element)
    }

    /// `ovf:id`.
    pub fn id(&self) -> Option<&str> {
        self.0.attr("id")
    }

    /// `ovf:href`, the composite id relative to `images/`.
    pub fn href(&self) -> Option<&str> {
        self.0.attr("href")
    }

    /// `ovf:size` in bytes, if present and numeric.
    pub fn size(&self) -> Option<u64> {
        self.0.attr("size").and_then(|s| s.trim().parse().ok())
    }
}

impl<E: DerefMut<Target = Element>> ReferenceFile<E> {
    /// Point the entry at a new image.
    pub fn retarget(&mut self, image_id: &str, composite: &str) {
        self.0.set_attr("id", image_id);
        self.0.set_attr("href", composite);
    }
}

/// A `Disk` entry of the disk section.
#[derive(Debug)]
pub struct DiskSectionEntry<E>(E);

impl<E: Deref<Target = Element>> DiskSectionEntry<E> {
    /// Wrap a `Disk` element.
    pub fn new(element: E) -> Self {
        Self(element)
    }

    /// `ovf:diskId`.
    pub fn disk_id(&self) -> Option<&str> {
        self.0.attr("diskId")
    }

    /// `ovf:fileRef`.
    pub fn file_ref(&self) -> Option<&str> {
        self.0.attr("fileRef")
    }

    /// `ovf:parentRef`, only when non-blank.
    pub fn parent_ref(&self) -> Option<&str> {
        self.0.attr("parentRef").filter(|v| !v.trim().is_empty())
    }

    /// True if the entry marks the root of a snapshot chain: its file
    /// reference equals its own parent reference.
    pub fn is_chain_root(&self) -> bool {
        matches!((self.file_ref(), self.parent_ref()), (Some(f), Some(p)) if f == p)
    }
}

impl<E: DerefMut<Target = Element>> DiskSectionEntry<E> {
    /// Point the entry at a new image.
    pub fn retarget(&mut self, image_id: &str, composite: &str) {
        self.0.set_attr("diskId", image_id);
        self.0.set_attr("fileRef", composite);
    }

    /// Overwrite a non-blank `ovf:parentRef`. Returns `false` if there was none.
    pub fn set_parent_ref(&mut self, composite: &str) -> bool {
        if self.parent_ref().is_none() {
            return false;
        }
        self.0.set_attr("parentRef", composite)
    }
}

/// Typed queries over a descriptor root (`ovf:Envelope`).
pub trait DescriptorLayout {
    /// The single `Content` element.
    fn content(&self) -> Result<&Element>;

    /// The single `Content` element, mutably.
    fn content_mut(&mut self) -> Result<&mut Element>;

    /// Hardware device items in document order.
    fn device_items(&self) -> Result<Vec<DeviceItem<&Element>>>;

    /// Hardware device items in document order, mutably.
    fn device_items_mut(&mut self) -> Result<Vec<DeviceItem<&mut Element>>>;

    /// Every `References/File` entry.
    fn reference_files(&self) -> Vec<ReferenceFile<&Element>>;

    /// Every `References/File` entry, mutably.
    fn reference_files_mut(&mut self) -> Vec<ReferenceFile<&mut Element>>;

    /// Every `Disk` entry of the root-level disk sections.
    fn disk_entries(&self) -> Vec<DiskSectionEntry<&Element>>;

    /// Every `Disk` entry of the root-level disk sections, mutably.
    fn disk_entries_mut(&mut self) -> Vec<DiskSectionEntry<&mut Element>>;
}

impl DescriptorLayout for Element {
    fn content(&self) -> Result<&Element> {
        exactly_one(self.children_named("Content").collect(), "Content")
    }

    fn content_mut(&mut self) -> Result<&mut Element> {
        exactly_one(self.children_named_mut("Content").collect(), "Content")
    }

    fn device_items(&self) -> Result<Vec<DeviceItem<&Element>>> {
        Ok(self
            .content()?
            .children_named("Section")
            .filter(|s| SectionKind::of(s) == SectionKind::VirtualHardware)
            .flat_map(|s| s.children_named("Item"))
            .map(DeviceItem::new)
            .collect())
    }

    fn device_items_mut(&mut self) -> Result<Vec<DeviceItem<&mut Element>>> {
        Ok(self
            .content_mut()?
            .children_named_mut("Section")
            .filter(|s| SectionKind::of(s) == SectionKind::VirtualHardware)
            .flat_map(|s| s.children_named_mut("Item"))
            .map(DeviceItem::new)
            .collect())
    }

    fn reference_files(&self) -> Vec<ReferenceFile<&Element>> {
        self.children_named("References")
            .flat_map(|r| r.children_named("File"))
            .map(ReferenceFile::new)
            .collect()
    }

    fn reference_files_mut(&mut self) -> Vec<ReferenceFile<&mut Element>> {
        self.children_named_mut("References")
            .flat_map(|r| r.children_named_mut("File"))
            .map(ReferenceFile::new)
            .collect()
    }

    fn disk_entries(&self) -> Vec<DiskSectionEntry<&Element>> {
        self.children_named("Section")
            .filter(|s| SectionKind::of(s) == SectionKind::Disk)
            .flat_map(|s| s.children_named("Disk"))
            .map(DiskSectionEntry::new)
            .collect()
    }

    fn disk_entries_mut(&mut self) -> Vec<DiskSectionEntry<&mut Element>> {
        self.children_named_mut("Section")
            .filter(|s| SectionKind::of(s) == SectionKind::Disk)
            .flat_map(|s| s.children_named_mut("Disk"))
            .map(DiskSectionEntry::new)
            .collect()
    }
}

/// Require exactly one element, reporting `what` otherwise.
pub(crate) fn exactly_one<T>(mut found: Vec<T>, what: &str) -> Result<T> {
    if found.len() != 1 {
        return Err(Error::malformed(format!(
            "expected exactly one {} element, found {}",
            what,
            found.len()
        )));
    }
    Ok(found.remove(0))
}
