//! Root manifest (`package.json`) loading.
//!
//! The installer only needs the flattened `(name, spec)` pairs of each
//! dependency group. Groups are returned in install order: production,
//! dev, peer.

use super::error::{codes, PkgError};
use super::spec::PackageSpec;
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::Path;

/// Manifest file name looked up in the project root.
pub const MANIFEST_NAME: &str = "package.json";

/// A named dependency category of the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyGroup {
    Production,
    Dev,
    Peer,
}

impl DependencyGroup {
    /// All groups in install order.
    pub const ALL: [Self; 3] = [Self::Production, Self::Dev, Self::Peer];

    /// The `package.json` key holding this group.
    #[must_use]
    pub fn field(self) -> &'static str {
        match self {
            Self::Production => "dependencies",
            Self::Dev => "devDependencies",
            Self::Peer => "peerDependencies",
        }
    }
}

impl fmt::Display for DependencyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

/// A problem with a single manifest entry. The entry is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestIssue {
    /// Dependency name, or the group field for whole-group problems.
    pub name: String,
    pub code: &'static str,
    pub message: String,
}

/// Dependency groups read from a manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// Non-empty groups in install order, entries sorted by name.
    pub groups: Vec<(DependencyGroup, Vec<PackageSpec>)>,
    pub issues: Vec<ManifestIssue>,
}

impl Manifest {
    /// Entries of one group, if present.
    #[must_use]
    pub fn group(&self, group: DependencyGroup) -> Option<&[PackageSpec]> {
        self.groups
            .iter()
            .find(|(g, _)| *g == group)
            .map(|(_, specs)| specs.as_slice())
    }

    /// Keep only the listed groups.
    #[must_use]
    pub fn only(mut self, keep: &[DependencyGroup]) -> Self {
        self.groups.retain(|(g, _)| keep.contains(g));
        self
    }
}

/// Read the dependency groups of a `package.json`.
///
/// # Errors
/// Returns `PKG_MANIFEST_NOT_FOUND` if the file is missing and
/// `PKG_MANIFEST_INVALID` if it cannot be read or is not a JSON object.
pub fn read_manifest(path: &Path) -> Result<Manifest, PkgError> {
    if !path.exists() {
        return Err(PkgError::manifest_not_found(path));
    }

    let content = fs::read_to_string(path)
        .map_err(|e| PkgError::manifest_invalid(format!("Failed to read: {e}")))?;

    let json: Value = serde_json::from_str(&content)
        .map_err(|e| PkgError::manifest_invalid(format!("Invalid JSON: {e}")))?;

    let root = json
        .as_object()
        .ok_or_else(|| PkgError::manifest_invalid("package.json must be a JSON object"))?;

    let mut manifest = Manifest::default();
    for group in DependencyGroup::ALL {
        let specs = extract_group(root, group, &mut manifest.issues);
        if !specs.is_empty() {
            manifest.groups.push((group, specs));
        }
    }

    Ok(manifest)
}

fn extract_group(
    root: &Map<String, Value>,
    group: DependencyGroup,
    issues: &mut Vec<ManifestIssue>,
) -> Vec<PackageSpec> {
    let field = group.field();
    let Some(value) = root.get(field) else {
        return Vec::new();
    };

    let Some(entries) = value.as_object() else {
        issues.push(ManifestIssue {
            name: field.to_string(),
            code: codes::PKG_MANIFEST_INVALID,
            message: format!("'{field}' must be an object, got {}", json_type_name(value)),
        });
        return Vec::new();
    };

    let mut specs = Vec::with_capacity(entries.len());
    for (name, spec) in entries {
        match spec.as_str() {
            Some(spec) => specs.push(PackageSpec::new(name.clone(), spec)),
            None => issues.push(ManifestIssue {
                name: name.clone(),
                code: codes::PKG_SPEC_INVALID,
                message: format!(
                    "Invalid range for '{name}' in {field}: expected string, got {}",
                    json_type_name(spec)
                ),
            }),
        }
    }
    specs.sort_by(|a, b| a.name.cmp(&b.name));
    specs
}

/// Get a human-readable type name for a JSON value.
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
