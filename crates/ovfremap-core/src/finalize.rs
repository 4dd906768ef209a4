//! Descriptor-wide parent reference rewrite, run once every disk is remapped.

use tracing::{debug, info, warn};

use crate::descriptor::{DescriptorLayout, Element};
use crate::error::Result;
use crate::ids::{IdSource, RemapContext};

/// Counts of references rewritten by [`finalize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeSummary {
    /// Device item `Parent` values replaced.
    pub item_parents: usize,
    /// Disk section `parentRef` values replaced.
    pub disk_parents: usize,
}

/// Point snapshot parents at the new image ids and disk section parent
/// references at the chain root.
///
/// Without a recorded chain root the disk section parent references are left
/// as they are.
pub fn finalize<S: IdSource>(root: &mut Element, ctx: &RemapContext<S>) -> Result<FinalizeSummary> {
    let mut summary = FinalizeSummary::default();

    for mut item in root.device_items_mut()? {
        let Some(parent) = item.parent() else {
            continue;
        };
        if let Some(new_parent) = ctx.mapped_image(&parent) {
            item.set_parent(new_parent);
            debug!(old = %parent, new = new_parent, "rewrote item parent");
            summary.item_parents += 1;
        }
    }

    let mut disks = root.disk_entries_mut();
    match &ctx.chain_root {
        Some(chain_root) => {
            for disk in &mut disks {
                if disk.set_parent_ref(chain_root) {
                    summary.disk_parents += 1;
                }
            }
        }
        None => {
            let with_parent = disks.iter().filter(|d| d.parent_ref().is_some()).count();
            if with_parent > 0 {
                warn!(
                    disks = with_parent,
                    "no snapshot chain root found; leaving disk parent references unchanged"
                );
            }
        }
    }

    info!(
        item_parents = summary.item_parents,
        disk_parents = summary.disk_parents,
        "finalized parent references"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Document, NIL_ID};
    use crate::ids::SequentialIds;

    const OVF: &str = r#"<ovf:Envelope xmlns:ovf="urn:ovf" xmlns:rasd="urn:rasd" xmlns:xsi="urn:xsi">
  <Section xsi:type="ovf:DiskSection_Type">
    <Disk ovf:diskId="n1" ovf:fileRef="ng/n1" ovf:parentRef="g1/i1"/>
    <Disk ovf:diskId="n2" ovf:fileRef="ng/n2" ovf:parentRef="g1/i1"/>
    <Disk ovf:diskId="n3" ovf:fileRef="ng/n3" ovf:parentRef=""/>
  </Section>
  <Content>
    <Section xsi:type="ovf:VirtualHardwareSection_Type">
      <Item>
        <rasd:ResourceType>17</rasd:ResourceType>
        <rasd:InstanceId>n1</rasd:InstanceId>
        <rasd:Parent>00000000-0000-0000-0000-000000000000</rasd:Parent>
      </Item>
      <Item>
        <rasd:ResourceType>17</rasd:ResourceType>
        <rasd:InstanceId>n2</rasd:InstanceId>
        <rasd:Parent>i1</rasd:Parent>
      </Item>
    </Section>
  </Content>
</ovf:Envelope>"#;

    fn context() -> RemapContext<SequentialIds> {
        let mut ctx = RemapContext::new(SequentialIds::new("n"));
        ctx.record_image("i1", "n1");
        ctx.record_image("i2", "n2");
        ctx
    }

    #[test]
    fn test_item_parents_follow_identifier_map() {
        let mut doc = Document::parse(OVF).unwrap();
        let summary = finalize(doc.root_mut(), &context()).unwrap();
        assert_eq!(summary.item_parents, 1);

        let items = doc.root().device_items().unwrap();
        assert_eq!(items[0].parent().as_deref(), Some(NIL_ID));
        assert_eq!(items[1].parent().as_deref(), Some("n1"));
    }

    #[test]
    fn test_disk_parents_set_to_chain_root() {
        let mut ctx = context();
        ctx.set_chain_root("ng/n1");
        let mut doc = Document::parse(OVF).unwrap();
        let summary = finalize(doc.root_mut(), &ctx).unwrap();
        assert_eq!(summary.disk_parents, 2);

        let disks = doc.root().disk_entries();
        assert_eq!(disks[0].parent_ref(), Some("ng/n1"));
        assert_eq!(disks[1].parent_ref(), Some("ng/n1"));
        assert_eq!(disks[2].parent_ref(), None);
    }

    #[test]
    fn test_without_chain_root_parent_refs_untouched() {
        let mut doc = Document::parse(OVF).unwrap();
        let summary = finalize(doc.root_mut(), &context()).unwrap();
        assert_eq!(summary.disk_parents, 0);
        assert_eq!(doc.root().disk_entries()[0].parent_ref(), Some("g1/i1"));
    }
}
