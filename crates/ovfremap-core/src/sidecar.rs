//! Per-image metadata sidecar (`<image-id>.meta`) handling.
//!
//! Sidecars are line-oriented `KEY=VALUE` text. Only `IMAGE` (owning group id)
//! and `PUUID` (parent image id) are interpreted; every other line, including
//! the trailing `EOF` marker, is carried through untouched.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// File extension of sidecar files.
pub const SIDECAR_EXTENSION: &str = "meta";

/// Key holding the owning group id.
pub const IMAGE_KEY: &str = "IMAGE";

/// Key holding the parent image id.
pub const PUUID_KEY: &str = "PUUID";

/// Sidecar file name for an image id.
pub fn sidecar_name(image_id: &str) -> String {
    format!("{}.{}", image_id, SIDECAR_EXTENSION)
}

/// A parsed sidecar, line structure preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sidecar {
    lines: Vec<String>,
    trailing_newline: bool,
}

impl Sidecar {
    /// Parse sidecar text.
    pub fn parse(content: &str) -> Self {
        Self {
            lines: content.lines().map(str::to_string).collect(),
            trailing_newline: content.ends_with('\n'),
        }
    }

    /// Read and parse a sidecar file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(e, path))?;
        Ok(Self::parse(&content))
    }

    /// Every value stored under `key`, in file order.
    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.lines
            .iter()
            .filter_map(move |line| line_value(line, key))
    }

    /// The first value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| line_value(line, key))
    }

    /// Replace the value of every line carrying `key`.
    ///
    /// Returns `false` if no such line exists; the sidecar is unchanged then.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        let mut found = false;
        for line in &mut self.lines {
            if line.split_once('=').is_some_and(|(k, _)| k == key) {
                *line = format!("{}={}", key, value);
                found = true;
            }
        }
        found
    }

    /// Owning group id.
    pub fn image_group(&self) -> Option<&str> {
        self.get(IMAGE_KEY)
    }

    /// Parent image id, if exactly one `PUUID` line is present.
    pub fn parent_image(&self) -> Option<&str> {
        let mut values = self.values(PUUID_KEY);
        match (values.next(), values.next()) {
            (Some(v), None) => Some(v),
            _ => None,
        }
    }

    /// Render back to text.
    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }
}

/// The value of a `KEY=VALUE` line if its key is exactly `key`.
fn line_value<'l>(line: &'l str, key: &str) -> Option<&'l str> {
    line.split_once('=')
        .filter(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    const META: &str = "DOMAIN=d1\nIMAGE=g1\nPUUID=00000000-0000-0000-0000-000000000000\nDESCRIPTION=disk=boot\nEOF\n";

    #[test]
    fn test_sidecar_name() {
        assert_eq!(sidecar_name("abc"), "abc.meta");
    }

    #[test]
    fn test_parse_fields() {
        let meta = Sidecar::parse(META);
        assert_eq!(meta.image_group(), Some("g1"));
        assert_eq!(
            meta.parent_image(),
            Some("00000000-0000-0000-0000-000000000000")
        );
        assert_eq!(meta.get("DESCRIPTION"), Some("disk=boot"));
        assert_eq!(meta.get("EOF"), None);
    }

    #[test]
    fn test_render_round_trip() {
        assert_eq!(Sidecar::parse(META).render(), META);
        let no_newline = "IMAGE=g1\nEOF";
        assert_eq!(Sidecar::parse(no_newline).render(), no_newline);
    }

    #[test]
    fn test_set_replaces_value() {
        let mut meta = Sidecar::parse(META);
        assert!(meta.set(IMAGE_KEY, "g2"));
        assert_eq!(meta.image_group(), Some("g2"));
        assert!(meta.render().contains("IMAGE=g2\n"));
        assert!(meta.render().contains("DESCRIPTION=disk=boot\n"));
    }

    #[test]
    fn test_set_missing_key() {
        let mut meta = Sidecar::parse("IMAGE=g1\n");
        assert!(!meta.set(PUUID_KEY, "p"));
        assert_eq!(meta.render(), "IMAGE=g1\n");
    }

    #[test]
    fn test_empty_puuid() {
        let meta = Sidecar::parse("IMAGE=g1\nPUUID=\n");
        assert_eq!(meta.parent_image(), Some(""));
    }

    #[test]
    fn test_ambiguous_puuid_is_ignored() {
        let meta = Sidecar::parse("PUUID=a\nPUUID=b\n");
        assert_eq!(meta.parent_image(), None);
    }

    #[test]
    fn test_get_with_temporary_key() {
        let meta = Sidecar::parse(META);
        let value = {
            let key = String::from("DOMAIN");
            meta.get(&key)
        };
        assert_eq!(value, Some("d1"));
        assert_eq!(meta.get(&IMAGE_KEY.to_string()), Some("g1"));
    }

    #[test]
    fn test_key_prefix_does_not_match() {
        let meta = Sidecar::parse("IMAGEX=nope\nIMAGE=g1\n");
        assert_eq!(meta.image_group(), Some("g1"));
    }
}
