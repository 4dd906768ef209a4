//! Disk remapping pass.
//!
//! Walks the disk device items in document order, gives each a fresh image
//! id and a (per old group) fresh group id, and carries the change through the
//! reference table, the disk section and the files on disk.

use tracing::{debug, info, warn};

use crate::descriptor::{composite_id, split_composite, DescriptorLayout, Element, SectionKind};
use crate::error::{Error, Result};
use crate::ids::{IdSource, RemapContext};
use crate::sync::CrossFileSync;

/// Old and new identity of one remapped disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskMapping {
    /// Image id before the run.
    pub old_image_id: String,
    /// Image id after the run.
    pub new_image_id: String,
    /// Group id before the run.
    pub old_group_id: String,
    /// Group id after the run.
    pub new_group_id: String,
}

impl DiskMapping {
    /// The new `<group>/<image>` reference.
    pub fn new_composite(&self) -> String {
        composite_id(&self.new_group_id, &self.new_image_id)
    }
}

/// Mark every image and group id already in the descriptor as taken.
pub fn reserve_existing<S: IdSource>(root: &Element, ctx: &mut RemapContext<S>) -> Result<()> {
    for item in root.device_items()? {
        if let Some(id) = item.instance_id() {
            ctx.ids.reserve(id);
        }
        if let Some(host) = item.host_resource() {
            let (group, image) = split_composite(&host);
            ctx.ids.reserve(group);
            ctx.ids.reserve(image);
        }
    }
    for file in root.reference_files() {
        if let Some(id) = file.id() {
            ctx.ids.reserve(id);
        }
    }
    for disk in root.disk_entries() {
        if let Some(id) = disk.disk_id() {
            ctx.ids.reserve(id);
        }
    }
    Ok(())
}

/// Remap every disk entry in the descriptor.
///
/// Existing ids must already be reserved with [`reserve_existing`].
/// `on_disk` is called with `(disks_done, total_disks)` after each disk.
pub fn remap_disks<S, F>(
    root: &mut Element,
    ctx: &mut RemapContext<S>,
    sync: &mut CrossFileSync<'_>,
    mut on_disk: F,
) -> Result<Vec<DiskMapping>>
where
    S: IdSource,
    F: FnMut(usize, usize),
{
    let has_hardware = root
        .content()?
        .children_named("Section")
        .any(|s| SectionKind::of(s) == SectionKind::VirtualHardware);
    if !has_hardware {
        return Err(Error::malformed("no virtual hardware section in Content"));
    }

    let mut mappings = Vec::new();
    for mut item in root.device_items_mut()? {
        if !item.is_disk() {
            continue;
        }

        let old_image_id = item.instance_id().unwrap_or_default();
        let host_resource = item.host_resource().unwrap_or_default();
        if old_image_id.is_empty() || host_resource.is_empty() {
            return Err(Error::malformed(
                "disk item with an empty InstanceId or HostResource",
            ));
        }

        let (old_group_id, suffix) = split_composite(&host_resource);
        if suffix != old_image_id {
            warn!(
                instance_id = %old_image_id,
                host_resource = %host_resource,
                "disk instance id does not match its host resource"
            );
        }

        let mapping = DiskMapping {
            new_image_id: ctx.ids.new_image_id(),
            new_group_id: ctx.ids.new_group_id(old_group_id),
            old_group_id: old_group_id.to_string(),
            old_image_id,
        };
        item.set_instance_id(&mapping.new_image_id);
        item.set_host_resource(&mapping.new_composite());
        ctx.record_image(&mapping.old_image_id, &mapping.new_image_id);
        mappings.push(mapping);
    }

    let total = mappings.len();
    for (index, mapping) in mappings.iter().enumerate() {
        retarget_reference(root, mapping);
        retarget_disk_entry(root, ctx, mapping);
        sync.sync_disk(
            &mapping.old_image_id,
            &mapping.new_image_id,
            &mapping.new_group_id,
        )?;

        debug!(
            old = %mapping.old_image_id,
            new = %mapping.new_image_id,
            group = %mapping.new_group_id,
            "remapped disk"
        );
        on_disk(index + 1, total);
    }

    info!(disks = total, groups = ctx.ids.group_map().len(), "remapped disks");
    Ok(mappings)
}

fn retarget_reference(root: &mut Element, mapping: &DiskMapping) {
    let composite = mapping.new_composite();
    match root
        .reference_files_mut()
        .into_iter()
        .find(|f| f.id() == Some(mapping.old_image_id.as_str()))
    {
        Some(mut file) => file.retarget(&mapping.new_image_id, &composite),
        None => warn!(image_id = %mapping.old_image_id, "no reference entry for disk"),
    }
}

fn retarget_disk_entry<S: IdSource>(
    root: &mut Element,
    ctx: &mut RemapContext<S>,
    mapping: &DiskMapping,
) {
    let composite = mapping.new_composite();
    let Some(mut disk) = root
        .disk_entries_mut()
        .into_iter()
        .find(|d| d.disk_id() == Some(mapping.old_image_id.as_str()))
    else {
        warn!(image_id = %mapping.old_image_id, "no disk section entry for disk");
        return;
    };

    let chain_root = disk.is_chain_root();
    disk.retarget(&mapping.new_image_id, &composite);
    if chain_root {
        ctx.set_chain_root(composite);
    }
}
