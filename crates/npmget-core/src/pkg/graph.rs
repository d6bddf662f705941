//! Per-run record of claimed packages.
//!
//! Every install unit claims its `(name, version)` key here before touching
//! the network. The first claimant installs; everyone after it skips. Because
//! a package that is still in progress counts as claimed, a dependency cycle
//! ends at the second visit instead of recursing forever.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Unit of deduplication: one concrete version of one package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstallKey {
    pub name: String,
    pub version: String,
}

impl InstallKey {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for InstallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Lifecycle of a claimed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Claimed, waiting for a fetch permit.
    Pending,
    /// Downloading or extracting.
    InProgress,
    /// Extracted into the module tree.
    Done,
}

/// Outcome of [`InstallGraph::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// First claim in this run; the caller must install the key.
    Granted,
    /// Someone else already holds the key.
    Skipped(KeyState),
    /// Another version of the package owns the target directory.
    Shadowed(InstallKey),
}

#[derive(Debug, Default)]
struct GraphInner {
    states: HashMap<InstallKey, KeyState>,
    /// Directory id -> key that extracts into it.
    owners: HashMap<String, InstallKey>,
}

/// Shared claim table for one install run.
#[derive(Debug, Default)]
pub struct InstallGraph {
    inner: Mutex<GraphInner>,
}

impl InstallGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GraphInner> {
        // State transitions are single assignments; a poisoned guard is still consistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `key`, which extracts into directory `dir_id`.
    pub fn claim(&self, key: &InstallKey, dir_id: &str) -> Claim {
        let mut inner = self.lock();

        if let Some(state) = inner.states.get(key) {
            return Claim::Skipped(*state);
        }

        if let Some(owner) = inner.owners.get(dir_id) {
            if owner != key {
                return Claim::Shadowed(owner.clone());
            }
        }

        inner.states.insert(key.clone(), KeyState::Pending);
        inner.owners.insert(dir_id.to_string(), key.clone());
        Claim::Granted
    }

    /// Claim `key` using its package name as the directory id.
    ///
    /// Returns true only for the first claimant of the key.
    pub fn claim_or_skip(&self, key: &InstallKey) -> bool {
        matches!(self.claim(key, &key.name), Claim::Granted)
    }

    /// Pending -> InProgress.
    pub fn start(&self, key: &InstallKey) {
        if let Some(state) = self.lock().states.get_mut(key) {
            *state = KeyState::InProgress;
        }
    }

    /// Mark a key as fully extracted.
    pub fn mark_done(&self, key: &InstallKey) {
        if let Some(state) = self.lock().states.get_mut(key) {
            *state = KeyState::Done;
        }
    }

    /// Drop a failed claim so a later request may try again.
    pub fn release(&self, key: &InstallKey) {
        let mut inner = self.lock();
        inner.states.remove(key);
        inner.owners.retain(|_, owner| owner != key);
    }

    #[must_use]
    pub fn state(&self, key: &InstallKey) -> Option<KeyState> {
        self.lock().states.get(key).copied()
    }

    /// All keys in the Done state, sorted.
    #[must_use]
    pub fn done_keys(&self) -> Vec<InstallKey> {
        let mut keys: Vec<InstallKey> = self
            .lock()
            .states
            .iter()
            .filter(|(_, state)| **state == KeyState::Done)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}
