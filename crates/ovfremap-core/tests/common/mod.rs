//! Shared fixtures for the integration tests.
//!
//! [`ArchiveBuilder`] writes an unpacked export archive to a temporary
//! directory: a descriptor under `master/vms/<dir>/` plus an
//! `images/<group>/<image>[.meta]` tree.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use walkdir::WalkDir;

pub const NIL: &str = "00000000-0000-0000-0000-000000000000";

#[derive(Debug, Clone)]
struct DiskSpec {
    group: String,
    image: String,
    parent: Option<String>,
    size: u64,
}

/// Builder for archive fixtures.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    name: Option<String>,
    template_id: String,
    descriptor_dir: String,
    disks: Vec<DiskSpec>,
    image_dirs: HashMap<String, String>,
    nics: usize,
    prolog: String,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self {
            name: Some("web01".to_string()),
            template_id: "t1".to_string(),
            descriptor_dir: "master/vms/t1".to_string(),
            disks: Vec::new(),
            image_dirs: HashMap::new(),
            nics: 0,
            prolog: String::new(),
        }
    }
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a base disk.
    pub fn disk(mut self, group: &str, image: &str) -> Self {
        self.disks.push(DiskSpec {
            group: group.to_string(),
            image: image.to_string(),
            parent: None,
            size: 1024,
        });
        self
    }

    /// Add a snapshot disk on top of `parent`.
    pub fn snapshot(mut self, group: &str, image: &str, parent: &str) -> Self {
        self.disks.push(DiskSpec {
            group: group.to_string(),
            image: image.to_string(),
            parent: Some(parent.to_string()),
            size: 512,
        });
        self
    }

    /// Store an image (and its sidecar) under `dir` instead of `images/<group>`.
    pub fn image_dir(mut self, image: &str, dir: &str) -> Self {
        self.image_dirs.insert(image.to_string(), dir.to_string());
        self
    }

    pub fn nics(mut self, count: usize) -> Self {
        self.nics = count;
        self
    }

    pub fn template_id(mut self, id: &str) -> Self {
        self.template_id = id.to_string();
        self
    }

    /// Markup placed between the XML declaration and the root element.
    pub fn prolog(mut self, markup: &str) -> Self {
        self.prolog = markup.to_string();
        self
    }

    pub fn without_name(mut self) -> Self {
        self.name = None;
        self
    }

    /// Place the descriptor at `dir` (relative to the root, may be empty).
    pub fn descriptor_dir(mut self, dir: &str) -> Self {
        self.descriptor_dir = dir.to_string();
        self
    }

    /// Relative path of the descriptor.
    pub fn descriptor_path(&self) -> PathBuf {
        Path::new(&self.descriptor_dir).join("t1.ovf")
    }

    pub fn build(&self) -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        for disk in &self.disks {
            let image_dir = root.join(self.dir_of(disk));
            fs::create_dir_all(&image_dir).unwrap();
            fs::write(image_dir.join(&disk.image), vec![0u8; disk.size as usize]).unwrap();
            let meta = format!(
                "DOMAIN=d1\nIMAGE={}\nPUUID={}\nVOLTYPE=LEAF\nEOF\n",
                disk.group,
                disk.parent.as_deref().unwrap_or(NIL)
            );
            fs::write(image_dir.join(format!("{}.meta", disk.image)), meta).unwrap();
        }

        let descriptor = root.join(self.descriptor_path());
        fs::create_dir_all(descriptor.parent().unwrap()).unwrap();
        fs::write(descriptor, self.descriptor()).unwrap();
        dir
    }

    fn dir_of(&self, disk: &DiskSpec) -> String {
        self.image_dirs
            .get(&disk.image)
            .cloned()
            .unwrap_or_else(|| format!("images/{}", disk.group))
    }

    fn composite(&self, image: &str) -> String {
        let disk = self.disks.iter().find(|d| d.image == image).unwrap();
        format!("{}/{}", disk.group, disk.image)
    }

    fn chain_root(&self, image: &str) -> String {
        let mut current = image.to_string();
        while let Some(parent) = self
            .disks
            .iter()
            .find(|d| d.image == current)
            .and_then(|d| d.parent.clone())
        {
            current = parent;
        }
        current
    }

    fn descriptor(&self) -> String {
        let mut refs = String::new();
        let mut disk_section = String::new();
        let mut items = String::new();

        for disk in &self.disks {
            let composite = self.composite(&disk.image);
            refs.push_str(&format!(
                "    <File ovf:href=\"{}\" ovf:id=\"{}\" ovf:size=\"{}\" ovf:description=\"disk\"/>\n",
                composite, disk.image, disk.size
            ));

            let has_children = self
                .disks
                .iter()
                .any(|d| d.parent.as_deref() == Some(disk.image.as_str()));
            let parent_ref = match (&disk.parent, has_children) {
                (Some(_), _) => self.composite(&self.chain_root(&disk.image)),
                (None, true) => composite.clone(),
                (None, false) => String::new(),
            };
            disk_section.push_str(&format!(
                "    <Disk ovf:diskId=\"{}\" ovf:size=\"1\" ovf:fileRef=\"{}\" ovf:parentRef=\"{}\" ovf:format=\"http://www.vmware.com/specifications/vmdk.html#sparse\"/>\n",
                disk.image, composite, parent_ref
            ));

            items.push_str(&format!(
                "      <Item>\n        <rasd:Caption>Drive {img}</rasd:Caption>\n        <rasd:InstanceId>{img}</rasd:InstanceId>\n        <rasd:ResourceType>17</rasd:ResourceType>\n        <rasd:HostResource>{comp}</rasd:HostResource>\n        <rasd:Parent>{parent}</rasd:Parent>\n      </Item>\n",
                img = disk.image,
                comp = composite,
                parent = disk.parent.as_deref().unwrap_or(NIL)
            ));
        }

        for n in 0..self.nics {
            items.push_str(&format!(
                "      <Item>\n        <rasd:Caption>eth{n}</rasd:Caption>\n        <rasd:InstanceId>nic{n}</rasd:InstanceId>\n        <rasd:ResourceType>10</rasd:ResourceType>\n      </Item>\n",
                n = n
            ));
        }

        let name = self
            .name
            .as_ref()
            .map(|n| format!("    <Name>{}</Name>\n", n))
            .unwrap_or_default();

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
{prolog}<ovf:Envelope xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1/" xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData" xmlns:vssd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" ovf:version="3.1.0.0">
  <References>
{refs}  </References>
  <Section xsi:type="ovf:NetworkSection_Type">
    <Info>List of networks</Info>
  </Section>
  <Section xsi:type="ovf:DiskSection_Type">
    <Info>List of Virtual Disks</Info>
{disks}  </Section>
  <Content ovf:id="out" xsi:type="ovf:VirtualSystem_Type">
{name}    <TemplateId>{template}</TemplateId>
    <!-- exported by the source manager -->
    <Section ovf:id="{template}" ovf:required="false" xsi:type="ovf:OperatingSystemSection_Type">
      <Info>Guest Operating System</Info>
      <Description>rhel_6x64</Description>
    </Section>
    <Section xsi:type="ovf:VirtualHardwareSection_Type">
      <Info>2 CPU, 1024 Memory</Info>
      <Item>
        <rasd:Caption>2 virtual cpu</rasd:Caption>
        <rasd:InstanceId>cpu0</rasd:InstanceId>
        <rasd:ResourceType>3</rasd:ResourceType>
      </Item>
{items}    </Section>
  </Content>
</ovf:Envelope>
"#,
            prolog = self.prolog,
            refs = refs,
            disks = disk_section,
            name = name,
            template = self.template_id,
            items = items
        )
    }
}

/// Every file under `root`, relative path to content. The journal is included.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

/// Read a sidecar key from a `.meta` file.
pub fn meta_value(path: &Path, key: &str) -> Option<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .find_map(|l| l.strip_prefix(&format!("{}=", key)).map(str::to_string))
}

/// The single `*.ovf` file under `root`.
pub fn find_descriptor(root: &Path) -> PathBuf {
    let found: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .map(|e| e.unwrap().into_path())
        .filter(|p| p.extension().is_some_and(|e| e == "ovf"))
        .collect();
    assert_eq!(found.len(), 1, "expected one descriptor, found {:?}", found);
    found.into_iter().next().unwrap()
}
