//! Optional descriptor edits: network adapters, display name and the
//! descriptor's own identity.

use std::path::Path;

use tracing::{debug, info};

use crate::archive::ArchiveLayout;
use crate::descriptor::accessors::exactly_one;
use crate::descriptor::{
    DescriptorLayout, DeviceItem, Element, SectionKind, DESCRIPTOR_EXTENSION, NIL_ID,
};
use crate::error::{Error, Result};
use crate::ids::{IdSource, RemapContext};
use crate::plan::RenamePlan;

/// Remove every network adapter item. Returns how many were removed.
pub fn strip_nics(root: &mut Element) -> Result<usize> {
    let removed: usize = root
        .content_mut()?
        .children_named_mut("Section")
        .filter(|s| SectionKind::of(s) == SectionKind::VirtualHardware)
        .map(|section| {
            section.remove_elements(|e| e.local_name() == "Item" && DeviceItem::new(e).is_nic())
        })
        .sum();

    info!(removed, "stripped network adapters");
    Ok(removed)
}

/// Set the display name (`Content/Name`).
pub fn rename(root: &mut Element, name: &str) -> Result<()> {
    let content = root.content_mut()?;
    let element = exactly_one(content.children_named_mut("Name").collect(), "Content/Name")?;
    element.set_text(name);
    info!(name, "renamed virtual machine");
    Ok(())
}

/// Give the descriptor a fresh identity and plan the matching renames.
///
/// `Content/TemplateId` takes the new id unless it holds the nil id, the
/// operating system section's `id` follows, and the descriptor is renamed
/// to `<new-id>.ovf` inside a directory renamed to `<new-id>`.
pub fn reassign_identity<S: IdSource>(
    root: &mut Element,
    ctx: &mut RemapContext<S>,
    layout: &ArchiveLayout,
    descriptor_path: &Path,
    plan: &mut RenamePlan,
) -> Result<String> {
    let descriptor_dir = descriptor_path.parent().unwrap_or(descriptor_path);
    if layout.is_root(descriptor_dir) {
        return Err(Error::conflict(
            "descriptor lies directly in the archive root; refusing to rename the root",
        ));
    }

    let content = root.content_mut()?;
    let template = exactly_one(
        content.children_named_mut("TemplateId").collect(),
        "Content/TemplateId",
    )?;
    let old_id = template.text().trim().to_string();
    ctx.ids.reserve(old_id.clone());
    let new_id = ctx.ids.new_descriptor_id();

    if old_id == NIL_ID {
        debug!("template id is nil, leaving it in place");
    } else {
        template.set_text(new_id.clone());
    }

    if let Some(os) = content
        .children_named_mut("Section")
        .find(|s| SectionKind::of(s) == SectionKind::OperatingSystem && s.attr("id").is_some())
    {
        os.set_attr("id", new_id.clone());
    }

    let new_file = descriptor_path.with_file_name(format!("{}.{}", new_id, DESCRIPTOR_EXTENSION));
    plan.rename_file(descriptor_path, new_file)?;
    plan.rename_dir(descriptor_dir, descriptor_dir.with_file_name(&new_id))?;

    info!(
        old = %old_id,
        new = %new_id,
        descriptor = %layout.relative(descriptor_path).display(),
        "reassigned descriptor identity"
    );
    Ok(new_id)
}
