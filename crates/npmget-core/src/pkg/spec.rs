//! Install requests.
//!
//! A request pairs a package name with a raw version specifier. Requests
//! come from the command line (`react`, `react@^18`, `@types/node@20`) or
//! from a manifest's dependency groups.

use super::error::PkgError;
use std::fmt;

/// One `(name, version spec)` pair to install.
///
/// An empty `spec` means "latest".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageSpec {
    /// Full package name (e.g., "@scope/name" or "name").
    pub name: String,
    /// Raw version specifier, possibly empty.
    pub spec: String,
}

impl PackageSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, spec: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spec: spec.into(),
        }
    }

    /// A request for the latest version of `name`.
    #[must_use]
    pub fn latest(name: impl Into<String>) -> Self {
        Self::new(name, "")
    }

    /// Parse a command-line argument of the form `name[@spec]`.
    ///
    /// # Errors
    /// Returns `PKG_SPEC_INVALID` if the argument is malformed.
    pub fn parse(input: &str) -> Result<Self, PkgError> {
        let input = input.trim();

        if input.is_empty() {
            return Err(PkgError::spec_invalid("Empty package spec"));
        }

        // The version delimiter is the first '@' after position 0, since
        // scoped names start with one
        let (name, spec) = match input.char_indices().skip(1).find(|&(_, c)| c == '@') {
            Some((pos, _)) => {
                let (name, rest) = input.split_at(pos);
                let spec = &rest[1..];
                if spec.is_empty() {
                    return Err(PkgError::spec_invalid(format!(
                        "Invalid package spec: empty version range in '{input}'"
                    )));
                }
                (name, spec)
            }
            None => (input, ""),
        };

        validate_name(name)?;
        Ok(Self::new(name, spec))
    }

    /// Check if this is a scoped package.
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.name.starts_with('@')
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.spec.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}@{}", self.name, self.spec)
        }
    }
}

fn validate_name(name: &str) -> Result<(), PkgError> {
    let bare = if let Some(scoped) = name.strip_prefix('@') {
        let Some((scope, bare)) = scoped.split_once('/') else {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: missing '/' in '{name}'"
            )));
        };
        if scope.is_empty() {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: empty scope in '{name}'"
            )));
        }
        validate_segment(name, scope)?;
        bare
    } else {
        name
    };

    if bare.is_empty() {
        return Err(PkgError::spec_invalid(format!(
            "Invalid package spec: empty name in '{name}'"
        )));
    }
    validate_segment(name, bare)
}

fn validate_segment(name: &str, segment: &str) -> Result<(), PkgError> {
    if segment == "." || segment == ".." {
        return Err(PkgError::spec_invalid(format!(
            "Invalid package name '{name}'"
        )));
    }

    for c in segment.chars() {
        if !c.is_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(PkgError::spec_invalid(format!(
                "Invalid character '{c}' in package name '{name}'"
            )));
        }
    }

    Ok(())
}
