// src/mount/table.rs

//! Parser for the kernel mount table (`/proc/self/mounts` format)
//!
//! Each line is `source target fstype options dump pass`, with spaces, tabs,
//! newlines and backslashes in paths escaped as three-digit octal sequences.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// One line of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fs_type: String,
    pub options: BTreeSet<String>,
}

/// Parsed mount table, in kernel order (later entries are stacked on top)
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Parse mount table text; malformed lines are skipped
    pub fn parse(content: &str) -> Self {
        let entries = content.lines().filter_map(parse_line).collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// The visible (topmost) mount at `target`, if any
    pub fn find(&self, target: &Path) -> Option<&MountEntry> {
        self.entries.iter().rev().find(|e| e.target == target)
    }
}

fn parse_line(line: &str) -> Option<MountEntry> {
    let mut fields = line.split_whitespace();
    let source = fields.next()?;
    let target = fields.next()?;
    let fs_type = fields.next()?;
    let options = fields.next()?;

    Some(MountEntry {
        source: unescape(source),
        target: PathBuf::from(unescape(target)),
        fs_type: fs_type.to_string(),
        options: options.split(',').map(str::to_string).collect(),
    })
}

/// Decode `\ooo` octal escapes
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda1 / ext4 rw,relatime 0 0
/dev/loop0 /var/lib/iso_mounts/alpine-3.23 iso9660 ro,relatime,nojoliet,check=s,map=n,blocksize=2048 0 0
/dev/loop1 /mnt/with\\040space iso9660 ro,relatime 0 0
garbage
tmpfs /var/lib/iso_mounts/alpine-3.23 tmpfs rw,relatime 0 0
";

    #[test]
    fn test_parse_entries() {
        let table = MountTable::parse(SAMPLE);
        assert_eq!(table.entries().len(), 5);

        let root = table.find(Path::new("/")).unwrap();
        assert_eq!(root.source, "/dev/sda1");
        assert_eq!(root.fs_type, "ext4");
        assert!(root.options.contains("rw"));
    }

    #[test]
    fn test_escaped_target() {
        let table = MountTable::parse(SAMPLE);
        let entry = table.find(Path::new("/mnt/with space")).unwrap();
        assert_eq!(entry.fs_type, "iso9660");
        assert!(entry.options.contains("ro"));
    }

    #[test]
    fn test_topmost_mount_wins() {
        let table = MountTable::parse(SAMPLE);
        let entry = table
            .find(Path::new("/var/lib/iso_mounts/alpine-3.23"))
            .unwrap();
        assert_eq!(entry.fs_type, "tmpfs");
    }

    #[test]
    fn test_not_mounted() {
        let table = MountTable::parse(SAMPLE);
        assert!(table.find(Path::new("/var/lib/iso_mounts/other-1")).is_none());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("a\\040b\\011c\\134d"), "a b\tc\\d");
        assert_eq!(unescape("trailing\\04"), "trailing\\04");
        assert_eq!(unescape("plain"), "plain");
    }
}
