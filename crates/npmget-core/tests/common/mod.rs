//! Shared fixtures: an in-memory registry and tarball builders.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use npmget_core::pkg::{Packument, PkgError, Registry};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tar::{Builder, Header};

/// Build a gzip tarball from `(path, contents)` pairs. Paths are written
/// into the header verbatim so tests can produce hostile entries.
pub fn tgz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut tar_bytes = Vec::new();
    {
        let mut builder = Builder::new(&mut tar_bytes);
        for (path, contents) in entries {
            let mut header = Header::new_gnu();
            let name = path.as_bytes();
            header.as_old_mut().name[..name.len()].copy_from_slice(name);
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder.append(&header, *contents).unwrap();
        }
        builder.finish().unwrap();
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}

/// A regular npm-style tarball: `package/package.json` and `package/index.js`.
pub fn package_tgz(name: &str, version: &str) -> Vec<u8> {
    let pkg_json = format!(r#"{{"name":"{name}","version":"{version}","main":"index.js"}}"#);
    let index_js = format!("module.exports = '{name}@{version}';\n");
    tgz(&[
        ("package/package.json", pkg_json.as_bytes()),
        ("package/index.js", index_js.as_bytes()),
    ])
}

pub fn tarball_url(name: &str, version: &str) -> String {
    let bare = name.rsplit('/').next().unwrap_or(name);
    format!("mem://{name}/-/{bare}-{version}.tgz")
}

/// Decrements the in-flight counter when a fetch ends or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry served from memory, counting every request.
#[derive(Default)]
pub struct MemoryRegistry {
    packuments: HashMap<String, Value>,
    tarballs: HashMap<String, Vec<u8>>,
    first_tarballs: HashMap<String, Vec<u8>>,
    delays: HashMap<String, Duration>,
    metadata_fetches: Mutex<HashMap<String, usize>>,
    tarball_fetches: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `name@version` with the given dependencies. The last
    /// published version becomes `latest`.
    pub fn publish(self, name: &str, version: &str, deps: &[(&str, &str)]) -> Self {
        self.publish_with(name, version, deps, package_tgz(name, version))
    }

    /// Publish a version whose tarball is `tarball`.
    pub fn publish_with(
        mut self,
        name: &str,
        version: &str,
        deps: &[(&str, &str)],
        tarball: Vec<u8>,
    ) -> Self {
        let url = tarball_url(name, version);
        let dependencies: Map<String, Value> = deps
            .iter()
            .map(|(n, s)| ((*n).to_string(), Value::String((*s).to_string())))
            .collect();

        let doc = self
            .packuments
            .entry(name.to_string())
            .or_insert_with(|| json!({"_id": name, "name": name, "dist-tags": {}, "versions": {}}));
        doc["dist-tags"]["latest"] = Value::String(version.to_string());
        doc["versions"][version] = json!({
            "name": name,
            "version": version,
            "dependencies": dependencies,
            "dist": { "tarball": url, "integrity": "sha512-test" }
        });

        self.tarballs.insert(url, tarball);
        self
    }

    /// Serve `tarball` for the first download of `name@version` only.
    pub fn first_fetch_returns(mut self, name: &str, version: &str, tarball: Vec<u8>) -> Self {
        self.first_tarballs.insert(tarball_url(name, version), tarball);
        self
    }

    /// Delay every tarball download of `name@version`.
    pub fn slow(mut self, name: &str, version: &str, delay: Duration) -> Self {
        self.delays.insert(tarball_url(name, version), delay);
        self
    }

    pub fn tarball_fetches(&self, name: &str, version: &str) -> usize {
        let url = tarball_url(name, version);
        self.tarball_fetches
            .lock()
            .unwrap()
            .get(&url)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_tarball_fetches(&self) -> usize {
        self.tarball_fetches.lock().unwrap().values().sum()
    }

    pub fn metadata_fetches(&self, name: &str) -> usize {
        self.metadata_fetches
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of simultaneous fetches observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn fetch_metadata(&self, name: &str) -> Result<Packument, PkgError> {
        let _guard = self.enter();
        *self
            .metadata_fetches
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default() += 1;
        tokio::task::yield_now().await;

        let doc = self
            .packuments
            .get(name)
            .ok_or_else(|| PkgError::not_found(name))?;
        Packument::from_slice(&serde_json::to_vec(doc).unwrap())
    }

    async fn fetch_tarball(&self, url: &str) -> Result<Bytes, PkgError> {
        let _guard = self.enter();
        let attempt = {
            let mut fetches = self.tarball_fetches.lock().unwrap();
            let count = fetches.entry(url.to_string()).or_default();
            *count += 1;
            *count
        };

        match self.delays.get(url) {
            Some(delay) => tokio::time::sleep(*delay).await,
            None => tokio::time::sleep(Duration::from_millis(5)).await,
        }

        if attempt == 1 {
            if let Some(first) = self.first_tarballs.get(url) {
                return Ok(Bytes::from(first.clone()));
            }
        }

        self.tarballs
            .get(url)
            .map(|b| Bytes::from(b.clone()))
            .ok_or_else(|| PkgError::registry_unavailable(format!("No tarball at '{url}'")))
    }
}
