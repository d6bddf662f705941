//! Tarball extraction.
//!
//! Entries are written straight into the destination root. Only directories
//! and regular files are accepted; anything else aborts the extraction.

use super::error::PkgError;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};

/// How archive entry paths map onto the destination root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveLayout {
    /// Drop the single wrapping directory (`package/index.js` -> `index.js`).
    #[default]
    StripFirst,
    /// Use entry paths unchanged.
    Verbatim,
}

/// Counters for one extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

/// Extract a gzip-compressed tarball into `dest_root`.
///
/// Existing files at the same paths are overwritten. The first failing entry
/// stops the extraction; entries written before it stay on disk.
///
/// # Errors
/// - `PKG_UNSAFE_ARCHIVE_PATH` if an entry resolves outside `dest_root`
/// - `PKG_UNSUPPORTED_ENTRY_KIND` for links, devices and other special entries
/// - `PKG_FILESYSTEM_ERROR` for unreadable archives and write failures
pub fn extract_tgz(
    bytes: &[u8],
    dest_root: &Path,
    layout: ArchiveLayout,
) -> Result<ExtractStats, PkgError> {
    let gz = GzDecoder::new(bytes);
    let mut archive = Archive::new(gz);
    let mut stats = ExtractStats::default();

    fs::create_dir_all(dest_root).map_err(|e| fs_error("create", dest_root, &e))?;

    let entries = archive
        .entries()
        .map_err(|e| PkgError::filesystem(format!("Failed to read tarball entries: {e}")))?;

    for entry in entries {
        let mut entry = entry
            .map_err(|e| PkgError::filesystem(format!("Failed to read tarball entry: {e}")))?;

        let raw_path = entry
            .path()
            .map_err(|e| PkgError::filesystem(format!("Failed to read entry path: {e}")))?
            .into_owned();
        let display = raw_path.to_string_lossy().into_owned();

        let relative = relative_target(&raw_path, layout)?;
        let target = dest_root.join(&relative);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target).map_err(|e| fs_error("create", &target, &e))?;
                stats.directories += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                if relative.as_os_str().is_empty() {
                    return Err(PkgError::unsafe_path(&display));
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| fs_error("create", parent, &e))?;
                }

                let mut file = File::create(&target).map_err(|e| fs_error("create", &target, &e))?;
                stats.bytes +=
                    io::copy(&mut entry, &mut file).map_err(|e| fs_error("write", &target, &e))?;
                stats.files += 1;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Ok(mode) = entry.header().mode() {
                        // Keep the owner able to read and overwrite on reinstall
                        let perms = fs::Permissions::from_mode((mode & 0o777) | 0o600);
                        if let Err(e) = fs::set_permissions(&target, perms) {
                            tracing::trace!(
                                path = %target.display(),
                                error = %e,
                                "Failed to set permissions"
                            );
                        }
                    }
                }
            }
            other => {
                return Err(PkgError::unsupported_entry(&format!("{other:?}"), &display));
            }
        }
    }

    Ok(stats)
}

/// Map an entry path to a normalized path relative to the destination root.
///
/// `..` pops a previous segment; popping past the root, absolute paths and
/// drive prefixes are rejected.
fn relative_target(raw: &Path, layout: ArchiveLayout) -> Result<PathBuf, PkgError> {
    let display = raw.to_string_lossy();
    let mut segments: Vec<&std::ffi::OsStr> = Vec::new();

    for component in raw.components() {
        match component {
            Component::Normal(part) => segments.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if segments.pop().is_none() {
                    return Err(PkgError::unsafe_path(&display));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PkgError::unsafe_path(&display));
            }
        }
    }

    // A lone segment is a top-level file; keep it rather than writing to the root itself
    let skip = match layout {
        ArchiveLayout::StripFirst if segments.len() > 1 || raw_is_dir_entry(&display) => 1,
        _ => 0,
    };

    Ok(segments.into_iter().skip(skip).collect())
}

/// Whether the raw entry name denotes a directory (`package/`).
fn raw_is_dir_entry(display: &str) -> bool {
    display.ends_with('/')
}

fn fs_error(action: &str, path: &Path, err: &io::Error) -> PkgError {
    PkgError::filesystem(format!("Failed to {action} {}: {err}", path.display()))
}
