//! Typed view of registry package metadata ("packument").
//!
//! Only the fields the installer needs are modelled; everything else in the
//! registry document is ignored during deserialization.

use super::error::PkgError;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Package metadata as served by `GET <registry>/<name>`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Packument {
    /// Declared package identifier. Names the directory under the modules root.
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    /// Tag name to version (`latest`, `next`, ...).
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    /// Version key to per-version record.
    #[serde(default)]
    pub versions: BTreeMap<String, VersionMeta>,
}

/// Per-version record of a packument.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionMeta {
    #[serde(default)]
    pub dist: Dist,
    /// Runtime dependencies as `name -> spec`.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

/// Download location of a version.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dist {
    #[serde(default)]
    pub tarball: String,
    /// Subresource integrity string. Carried, never verified.
    #[serde(default)]
    pub integrity: Option<String>,
}

impl Packument {
    /// Decode a packument from a response body.
    ///
    /// # Errors
    /// Returns `PKG_METADATA_MALFORMED` if the body is not a packument.
    pub fn from_slice(body: &[u8]) -> Result<Self, PkgError> {
        serde_json::from_slice(body)
            .map_err(|e| PkgError::malformed_metadata(format!("Invalid packument: {e}")))
    }

    /// The `latest` dist-tag, if present.
    #[must_use]
    pub fn latest(&self) -> Option<&str> {
        self.dist_tags.get("latest").map(String::as_str)
    }

    /// Look up the record for an exact version key.
    #[must_use]
    pub fn version(&self, version: &str) -> Option<&VersionMeta> {
        self.versions.get(version)
    }

    /// Whether `version` is a key of `versions`.
    #[must_use]
    pub fn has_version(&self, version: &str) -> bool {
        self.versions.contains_key(version)
    }

    /// Directory name for this package: `_id`, falling back to `requested`.
    #[must_use]
    pub fn package_id<'a>(&'a self, requested: &'a str) -> &'a str {
        self.id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(requested)
    }
}
