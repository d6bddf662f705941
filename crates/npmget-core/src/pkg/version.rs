//! Version resolution using semver.

use super::error::PkgError;
use super::packument::Packument;
use semver::{Version, VersionReq};

/// How a version specifier is turned into a version key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionStrategy {
    /// Drop one leading non-digit character and require an exact key match.
    StripPrefix,
    /// Pick the highest published version satisfying the npm range.
    #[default]
    HighestMatching,
}

/// Resolve a version specifier against a packument.
///
/// # Rules
/// - An empty `spec` returns `dist-tags.latest`
/// - [`VersionStrategy::StripPrefix`]: a spec starting with a non-digit loses
///   exactly one character; the remainder must be a published version
/// - [`VersionStrategy::HighestMatching`]: dist-tags are used as-is and a
///   bare `1.2.3` must be published. Anything else is an npm range and the
///   highest satisfying version wins. OR ranges like `^1.0.0 || ^2.0.0` are
///   supported
///
/// # Errors
/// Returns `PKG_VERSION_UNRESOLVABLE` if no version satisfies the spec.
pub fn resolve_version(
    spec: &str,
    packument: &Packument,
    strategy: VersionStrategy,
) -> Result<String, PkgError> {
    let name = packument.package_id("unknown");
    let spec = spec.trim();

    if spec.is_empty() {
        return packument
            .latest()
            .map(String::from)
            .ok_or_else(|| PkgError::unresolvable(name, "latest (no dist-tags.latest found)"));
    }

    match strategy {
        VersionStrategy::StripPrefix => {
            let key = strip_operator(spec);
            if packument.has_version(key) {
                Ok(key.to_string())
            } else {
                Err(PkgError::unresolvable(name, spec))
            }
        }
        VersionStrategy::HighestMatching => resolve_highest(name, spec, packument),
    }
}

/// Strip a single leading non-digit character (`^1.2.3` -> `1.2.3`).
fn strip_operator(spec: &str) -> &str {
    match spec.chars().next() {
        Some(c) if !c.is_ascii_digit() => &spec[c.len_utf8()..],
        _ => spec,
    }
}

fn resolve_highest(name: &str, spec: &str, packument: &Packument) -> Result<String, PkgError> {
    if packument.has_version(spec) {
        return Ok(spec.to_string());
    }

    if let Some(tagged) = packument.dist_tags.get(spec) {
        if packument.has_version(tagged) {
            return Ok(tagged.clone());
        }
        return Err(PkgError::unresolvable(name, spec));
    }

    // Sorted descending so the first match is the highest
    let mut parsed: Vec<(Version, &str)> = packument
        .versions
        .keys()
        .filter_map(|key| Version::parse(key).ok().map(|v| (v, key.as_str())))
        .collect();
    parsed.sort_by(|a, b| b.0.cmp(&a.0));

    let reqs = if spec.contains("||") {
        parse_or_range(name, spec)?
    } else {
        vec![parse_range(name, spec)?]
    };

    parsed
        .iter()
        .find(|(version, _)| reqs.iter().any(|req| req.matches(version)))
        .map(|(_, key)| (*key).to_string())
        .ok_or_else(|| PkgError::unresolvable(name, spec))
}

/// Parse an OR range like "^1.0.0 || ^2.0.0", skipping invalid alternatives.
fn parse_or_range(name: &str, range: &str) -> Result<Vec<VersionReq>, PkgError> {
    let reqs: Vec<VersionReq> = range
        .split("||")
        .map(str::trim)
        .filter(|alt| !alt.is_empty())
        .filter_map(|alt| parse_range(name, alt).ok())
        .collect();

    if reqs.is_empty() {
        return Err(PkgError::new(
            super::error::codes::PKG_VERSION_UNRESOLVABLE,
            format!("Invalid version range '{range}' for {name}: no valid alternatives"),
        ));
    }

    Ok(reqs)
}

/// Parse a single version range, handling npm-specific syntax.
///
/// Handles:
/// - Standard semver ranges: ^1.0.0, ~1.0.0, >=1.0.0, etc.
/// - Hyphen ranges: 1.0.0 - 2.0.0
/// - X-ranges: 1.x, 1.0.x, *
/// - Space-separated comparators: >= 2.1.2 < 3.0.0
/// - Bare versions: 1.2.3 is exact, 1.2 and 1 are x-ranges
fn parse_range(name: &str, range: &str) -> Result<VersionReq, PkgError> {
    let range = range.trim();

    let converted = if Version::parse(range).is_ok() {
        // semver reads a bare version as a caret range; npm means exact
        format!("={range}")
    } else if is_partial_version(range) {
        convert_x_range(&format!("{range}.x"))
    } else if let Some((start, end)) = parse_hyphen_range(range) {
        format!(">={start}, <={end}")
    } else if range.contains(['x', 'X']) || range == "*" {
        convert_x_range(range)
    } else {
        convert_space_separated_comparators(range)
    };

    VersionReq::parse(&converted).map_err(|e| {
        PkgError::new(
            super::error::codes::PKG_VERSION_UNRESOLVABLE,
            format!("Invalid version range '{range}' for {name}: {e}"),
        )
    })
}

/// `1` or `1.2`: numeric parts only, fewer than three.
fn is_partial_version(range: &str) -> bool {
    let parts: Vec<&str> = range.split('.').collect();
    parts.len() < 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Parse a hyphen range like "1.0.0 - 2.0.0".
fn parse_hyphen_range(range: &str) -> Option<(&str, &str)> {
    let (start, end) = range.split_once(" - ")?;
    let (start, end) = (start.trim(), end.trim());
    if start.is_empty() || end.is_empty() {
        return None;
    }
    Some((start, end))
}

/// Convert space-separated comparators to comma-separated.
///
/// npm allows ">= 2.1.2 < 3.0.0"; the semver crate wants ">=2.1.2, <3.0.0".
/// A token without digits is an operator and glues onto the next token.
fn convert_space_separated_comparators(range: &str) -> String {
    let mut comparators: Vec<String> = Vec::new();
    let mut pending_op = String::new();

    for token in range.split_whitespace() {
        if token.chars().any(|c| c.is_ascii_digit()) {
            comparators.push(format!("{pending_op}{token}"));
            pending_op.clear();
        } else {
            pending_op.push_str(token);
        }
    }

    if !pending_op.is_empty() {
        comparators.push(pending_op);
    }

    if comparators.is_empty() {
        return range.to_string();
    }

    comparators.join(", ")
}

/// Convert x-range to semver range.
fn convert_x_range(range: &str) -> String {
    if matches!(range, "*" | "x" | "X") {
        return ">=0.0.0".to_string();
    }

    let parts: Vec<&str> = range.split('.').collect();

    match parts.as_slice() {
        [major, "x" | "X" | "*"] | [major, "x" | "X" | "*", "x" | "X" | "*"] => {
            // "1.x" -> ">=1.0.0, <2.0.0"
            if let Ok(m) = major.parse::<u64>() {
                return format!(">={m}.0.0, <{}.0.0", m + 1);
            }
        }
        [major, minor, "x" | "X" | "*"] => {
            // "1.2.x" -> ">=1.2.0, <1.3.0"
            if let (Ok(m), Ok(n)) = (major.parse::<u64>(), minor.parse::<u64>()) {
                return format!(">={m}.{n}.0, <{m}.{}.0", n + 1);
            }
        }
        _ => {}
    }

    range.replace(['x', 'X'], "0")
}
