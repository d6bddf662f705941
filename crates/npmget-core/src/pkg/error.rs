//! Package manager error types.

use std::fmt;
use std::io;

/// Package manager error codes.
pub mod codes {
    pub const PKG_REGISTRY_UNAVAILABLE: &str = "PKG_REGISTRY_UNAVAILABLE";
    pub const PKG_NOT_FOUND: &str = "PKG_NOT_FOUND";
    pub const PKG_METADATA_MALFORMED: &str = "PKG_METADATA_MALFORMED";
    pub const PKG_VERSION_UNRESOLVABLE: &str = "PKG_VERSION_UNRESOLVABLE";
    pub const PKG_UNSAFE_ARCHIVE_PATH: &str = "PKG_UNSAFE_ARCHIVE_PATH";
    pub const PKG_UNSUPPORTED_ENTRY_KIND: &str = "PKG_UNSUPPORTED_ENTRY_KIND";
    pub const PKG_FILESYSTEM_ERROR: &str = "PKG_FILESYSTEM_ERROR";
    pub const PKG_SPEC_INVALID: &str = "PKG_SPEC_INVALID";

    // Manifest loading
    pub const PKG_MANIFEST_NOT_FOUND: &str = "PKG_MANIFEST_NOT_FOUND";
    pub const PKG_MANIFEST_INVALID: &str = "PKG_MANIFEST_INVALID";

    // Run control
    pub const PKG_INSTALL_CANCELLED: &str = "PKG_INSTALL_CANCELLED";
    pub const PKG_INSTALL_TIMEOUT: &str = "PKG_INSTALL_TIMEOUT";
}

/// Package manager error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgError {
    code: &'static str,
    message: String,
}

impl PkgError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Transport failure reaching the registry or tarball host.
    pub fn registry_unavailable(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_REGISTRY_UNAVAILABLE, msg)
    }

    /// Create a package not found error.
    #[must_use]
    pub fn not_found(name: &str) -> Self {
        Self::new(codes::PKG_NOT_FOUND, format!("Package not found: {name}"))
    }

    /// Response body is not a valid packument.
    pub fn malformed_metadata(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_METADATA_MALFORMED, msg)
    }

    /// No version of `name` matches `spec`.
    #[must_use]
    pub fn unresolvable(name: &str, spec: &str) -> Self {
        Self::new(
            codes::PKG_VERSION_UNRESOLVABLE,
            format!("No version of {name} satisfies '{spec}'"),
        )
    }

    /// Archive entry would land outside the destination root.
    #[must_use]
    pub fn unsafe_path(path: &str) -> Self {
        Self::new(
            codes::PKG_UNSAFE_ARCHIVE_PATH,
            format!("Archive entry escapes destination: {path}"),
        )
    }

    /// Archive entry is neither a directory nor a regular file.
    #[must_use]
    pub fn unsupported_entry(kind: &str, path: &str) -> Self {
        Self::new(
            codes::PKG_UNSUPPORTED_ENTRY_KIND,
            format!("Unsupported archive entry type {kind} at {path}"),
        )
    }

    /// Directory or file creation/write failure.
    pub fn filesystem(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_FILESYSTEM_ERROR, msg)
    }

    /// Create a spec invalid error.
    pub fn spec_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_SPEC_INVALID, msg)
    }

    /// Create a manifest not found error.
    #[must_use]
    pub fn manifest_not_found(path: &std::path::Path) -> Self {
        Self::new(
            codes::PKG_MANIFEST_NOT_FOUND,
            format!("package.json not found: {}", path.display()),
        )
    }

    /// Create a manifest invalid error.
    pub fn manifest_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_MANIFEST_INVALID, msg)
    }

    /// The run was cancelled before this unit finished.
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_INSTALL_CANCELLED, msg)
    }

    /// The run exceeded its time budget.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_INSTALL_TIMEOUT, msg)
    }

    /// Whether this error only reports that the run was stopped elsewhere.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        self.code == codes::PKG_INSTALL_CANCELLED
    }
}

impl fmt::Display for PkgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PkgError {}

impl From<io::Error> for PkgError {
    fn from(e: io::Error) -> Self {
        Self::filesystem(e.to_string())
    }
}

impl From<reqwest::Error> for PkgError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::malformed_metadata(format!("Invalid response body: {e}"))
        } else if e.is_timeout() {
            Self::registry_unavailable(format!("Request timed out: {e}"))
        } else if e.is_connect() {
            Self::registry_unavailable(format!("Connection failed: {e}"))
        } else {
            Self::registry_unavailable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for PkgError {
    fn from(e: serde_json::Error) -> Self {
        Self::malformed_metadata(format!("Invalid JSON: {e}"))
    }
}
