// src/catalog.rs

//! Image catalog and desired-set resolution
//!
//! The catalog maps a short image name (e.g. `alpine-3.23`) to the URL it is
//! fetched from. A name determines everything downstream: the artifact file
//! is `<name><ext>` under the storage root and the mount point is `<name>`
//! under the mount root.
//!
//! All validation here is pure; nothing touches the filesystem or network.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Read-only filesystem image kinds we know how to mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Iso,
    Squashfs,
}

impl ImageFormat {
    const ALL: [ImageFormat; 2] = [ImageFormat::Iso, ImageFormat::Squashfs];

    /// File extension including the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Iso => ".iso",
            ImageFormat::Squashfs => ".squashfs",
        }
    }

    /// Filesystem type passed to mount(8) and expected in the mount table
    pub fn filesystem_type(&self) -> &'static str {
        match self {
            ImageFormat::Iso => "iso9660",
            ImageFormat::Squashfs => "squashfs",
        }
    }

    /// Detect the format from the trailing extension of a URL
    pub fn from_url(url: &str) -> Option<Self> {
        let lower = url.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| lower.ends_with(format.extension()))
    }
}

/// A validated catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub url: String,
    pub sha256: Option<String>,
    pub format: ImageFormat,
}

impl CatalogEntry {
    /// Validate and build an entry
    pub fn new(name: &str, url: &str, sha256: Option<&str>) -> Result<Self> {
        validate_name(name)?;
        let format = validate_url(name, url)?;
        let sha256 = sha256.map(|s| validate_sha256(name, s)).transpose()?;

        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            sha256,
            format,
        })
    }

    /// Artifact file name, e.g. `alpine-3.23.iso`
    pub fn file_name(&self) -> String {
        format!("{}{}", self.name, self.format.extension())
    }

    /// Mount point directory name
    pub fn mount_dir_name(&self) -> &str {
        &self.name
    }
}

/// URL and optional checksum for one catalog name, as written in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSource {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// One image selected for provisioning: a catalog name or an inline definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DesiredImageRef {
    Named(String),
    Inline {
        name: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },
}

impl DesiredImageRef {
    /// The image name this reference selects
    pub fn name(&self) -> &str {
        match self {
            DesiredImageRef::Named(name) => name,
            DesiredImageRef::Inline { name, .. } => name,
        }
    }
}

/// Immutable name -> source lookup, built once per run
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    sources: BTreeMap<String, CatalogSource>,
}

impl Catalog {
    pub fn new(sources: BTreeMap<String, CatalogSource>) -> Self {
        Self { sources }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Validate every catalog entry, selected or not
    pub fn validate(&self) -> Result<Vec<CatalogEntry>> {
        self.sources
            .iter()
            .map(|(name, source)| CatalogEntry::new(name, &source.url, source.sha256.as_deref()))
            .collect()
    }

    /// Resolve a single reference into a validated entry
    ///
    /// Inline references bypass the catalog entirely.
    pub fn resolve_one(&self, desired: &DesiredImageRef) -> Result<CatalogEntry> {
        match desired {
            DesiredImageRef::Named(name) => {
                let source = self
                    .sources
                    .get(name)
                    .ok_or_else(|| Error::UnknownImage(name.clone()))?;
                debug!("Resolved {} from catalog to {}", name, source.url);
                CatalogEntry::new(name, &source.url, source.sha256.as_deref())
            }
            DesiredImageRef::Inline { name, url, sha256 } => {
                debug!("Using inline definition for {}", name);
                CatalogEntry::new(name, url, sha256.as_deref())
            }
        }
    }

    /// Resolve the whole desired set, failing on the first bad reference
    pub fn resolve(&self, desired: &[DesiredImageRef]) -> Result<Vec<CatalogEntry>> {
        desired.iter().map(|d| self.resolve_one(d)).collect()
    }
}

fn invalid(name: &str, field: &'static str, reason: impl Into<String>) -> Error {
    Error::InvalidCatalogEntry {
        name: name.to_string(),
        field,
        reason: reason.into(),
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid(name, "name", "must not be empty"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '.' || *c == '-'))
    {
        return Err(invalid(
            name,
            "name",
            format!("contains '{}', only [a-z0-9.-] allowed", bad),
        ));
    }
    if !name.chars().any(|c| c.is_ascii_digit()) {
        return Err(invalid(name, "name", "must contain a version digit"));
    }
    Ok(())
}

fn validate_url(name: &str, url: &str) -> Result<ImageFormat> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(invalid(name, "url", "must start with http:// or https://"));
    }
    if url.chars().any(char::is_whitespace) {
        return Err(invalid(name, "url", "must not contain whitespace"));
    }
    ImageFormat::from_url(url).ok_or_else(|| {
        let known: Vec<_> = ImageFormat::ALL.iter().map(|f| f.extension()).collect();
        invalid(
            name,
            "url",
            format!("must end with one of {}", known.join(", ")),
        )
    })
}

fn validate_sha256(name: &str, digest: &str) -> Result<String> {
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid(name, "sha256", "must be 64 hex characters"));
    }
    Ok(digest.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        let mut sources = BTreeMap::new();
        sources.insert(
            "alpine-3.23".to_string(),
            CatalogSource {
                url: "https://dl.example.org/alpine/alpine-3.23.iso".to_string(),
                sha256: None,
            },
        );
        Catalog::new(sources)
    }

    #[test]
    fn test_naming_correspondence() {
        let entry = catalog()
            .resolve_one(&DesiredImageRef::Named("alpine-3.23".to_string()))
            .unwrap();
        assert_eq!(entry.file_name(), "alpine-3.23.iso");
        assert_eq!(entry.mount_dir_name(), "alpine-3.23");
        assert_eq!(entry.format.filesystem_type(), "iso9660");
    }

    #[test]
    fn test_unknown_image() {
        let result = catalog().resolve_one(&DesiredImageRef::Named("debian-12".to_string()));
        assert!(matches!(result, Err(Error::UnknownImage(name)) if name == "debian-12"));
    }

    #[test]
    fn test_inline_bypasses_catalog() {
        let desired = DesiredImageRef::Inline {
            name: "tools-1".to_string(),
            url: "http://mirror.local/tools-1.squashfs".to_string(),
            sha256: None,
        };
        let entry = catalog().resolve_one(&desired).unwrap();
        assert_eq!(entry.format, ImageFormat::Squashfs);
        assert_eq!(entry.file_name(), "tools-1.squashfs");
    }

    #[test]
    fn test_name_validation() {
        let url = "https://example.com/x.iso";
        assert!(CatalogEntry::new("alpine-3.23", url, None).is_ok());

        for bad in ["", "Alpine-3", "alpine", "alpine_3", "alpine 3", "alpine/3"] {
            let err = CatalogEntry::new(bad, url, None).unwrap_err();
            assert!(
                matches!(err, Error::InvalidCatalogEntry { field: "name", .. }),
                "expected name error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_url_validation() {
        for bad in [
            "ftp://example.com/a.iso",
            "example.com/a.iso",
            "https://example.com/a b.iso",
            "https://example.com/a.img",
            "https://example.com/a.iso?x=1",
        ] {
            let err = CatalogEntry::new("a-1", bad, None).unwrap_err();
            assert!(
                matches!(err, Error::InvalidCatalogEntry { field: "url", .. }),
                "expected url error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_uppercase_extension_accepted() {
        let entry = CatalogEntry::new("a-1", "https://example.com/A-1.ISO", None).unwrap();
        assert_eq!(entry.format, ImageFormat::Iso);
        assert_eq!(entry.file_name(), "a-1.iso");
    }

    #[test]
    fn test_sha256_validation() {
        let url = "https://example.com/a.iso";
        let digest = "AB".repeat(32);
        let entry = CatalogEntry::new("a-1", url, Some(&digest)).unwrap();
        assert_eq!(entry.sha256.as_deref(), Some("ab".repeat(32).as_str()));

        let err = CatalogEntry::new("a-1", url, Some("abc")).unwrap_err();
        assert!(matches!(err, Error::InvalidCatalogEntry { field: "sha256", .. }));
    }

    #[test]
    fn test_resolve_fails_fast() {
        let desired = vec![
            DesiredImageRef::Named("alpine-3.23".to_string()),
            DesiredImageRef::Named("missing-1".to_string()),
        ];
        assert!(catalog().resolve(&desired).is_err());
        assert_eq!(catalog().resolve(&desired[..1]).unwrap().len(), 1);
    }

    #[test]
    fn test_desired_ref_deserializes_both_forms() {
        let json = r#"["alpine-3.23", {"name": "tools-1", "url": "https://x/tools-1.iso"}]"#;
        let refs: Vec<DesiredImageRef> = serde_json::from_str(json).unwrap();
        assert_eq!(refs[0], DesiredImageRef::Named("alpine-3.23".to_string()));
        assert_eq!(refs[1].name(), "tools-1");
        assert!(matches!(refs[1], DesiredImageRef::Inline { .. }));
    }
}
