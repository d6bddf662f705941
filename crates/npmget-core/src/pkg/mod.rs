//! Package installation.
//!
//! Provides:
//! - Parsing install requests (`name@spec`)
//! - Fetching packuments and tarballs from an npm-compatible registry
//! - Picking a concrete version for a request
//! - Extracting `.tgz` archives into the module tree
//! - Deduplicating installs across a run
//! - Scheduling the install of whole dependency trees
//! - Reading dependency groups from `package.json`

pub mod error;
pub mod graph;
pub mod install;
pub mod manifest;
pub mod packument;
pub mod registry;
pub mod spec;
pub mod tarball;
pub mod version;

pub use error::{codes as pkg_codes, PkgError};
pub use graph::{Claim, InstallGraph, InstallKey, KeyState};
pub use install::{
    BranchFailure, FailurePolicy, InstallOptions, InstallReport, Installer, RequestOutcome,
    Shadowed, DEFAULT_CONCURRENCY,
};
pub use manifest::{read_manifest, DependencyGroup, Manifest, ManifestIssue, MANIFEST_NAME};
pub use packument::{Dist, Packument, VersionMeta};
pub use registry::{
    HttpTimeouts, Registry, RegistryClient, DEFAULT_REGISTRY, MAX_TARBALL_SIZE, REGISTRY_ENV,
};
pub use spec::PackageSpec;
pub use tarball::{extract_tgz, ArchiveLayout, ExtractStats};
pub use version::{resolve_version, VersionStrategy};
