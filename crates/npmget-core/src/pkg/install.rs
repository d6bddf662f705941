//! Concurrent install scheduler.
//!
//! [`Installer::install`] spawns one task per request. Each task resolves
//! its version, claims the `(name, version)` key in the run's
//! [`InstallGraph`], downloads and extracts the tarball, then installs the
//! version's dependencies the same way. Every level joins all of its children
//! before returning, so a top-level call only finishes once the whole tree
//! below it is done.
//!
//! Network and extraction work is bounded by a semaphore. A permit is held
//! for one fetch or one fetch+extract and is never held while waiting on
//! children, so even a limit of one cannot deadlock on a deep chain.

use super::error::PkgError;
use super::graph::{Claim, InstallGraph, InstallKey};
use super::manifest::DependencyGroup;
use super::packument::{Packument, VersionMeta};
use super::registry::Registry;
use super::spec::PackageSpec;
use super::tarball::{extract_tgz, ArchiveLayout};
use super::version::{resolve_version, VersionStrategy};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, debug_span, info, warn, Instrument};

/// Default number of concurrent fetches.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// What a branch failure does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Keep installing sibling branches and report every failure.
    #[default]
    BestEffort,
    /// Stop the whole run at the first failure.
    FailFast,
}

/// Options for one install run.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Directory packages are extracted into (`node_modules`).
    pub modules_root: PathBuf,
    /// Maximum concurrent fetch/extract operations.
    pub concurrency: usize,
    pub failure_policy: FailurePolicy,
    pub version_strategy: VersionStrategy,
    pub archive_layout: ArchiveLayout,
    /// Upper bound on the whole run.
    pub run_timeout: Option<Duration>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self::new("node_modules")
    }
}

impl InstallOptions {
    #[must_use]
    pub fn new(modules_root: impl Into<PathBuf>) -> Self {
        Self {
            modules_root: modules_root.into(),
            concurrency: DEFAULT_CONCURRENCY,
            failure_policy: FailurePolicy::default(),
            version_strategy: VersionStrategy::default(),
            archive_layout: ArchiveLayout::default(),
            run_timeout: None,
        }
    }

    /// Set the fetch concurrency limit (at least 1).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    #[must_use]
    pub fn with_version_strategy(mut self, strategy: VersionStrategy) -> Self {
        self.version_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_archive_layout(mut self, layout: ArchiveLayout) -> Self {
        self.archive_layout = layout;
        self
    }

    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }
}

/// One failed install branch.
#[derive(Debug, Clone)]
pub struct BranchFailure {
    /// The request that failed.
    pub package: PackageSpec,
    /// Resolved version, if resolution got that far.
    pub version: Option<String>,
    /// Package whose dependency list contained the request.
    pub parent: Option<InstallKey>,
    pub error: PkgError,
}

/// A version that was not installed because another version of the same
/// package already occupies its directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shadowed {
    pub requested: InstallKey,
    pub kept: InstallKey,
}

/// Result of one top-level request.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub request: PackageSpec,
    /// Manifest group the request came from, if any.
    pub group: Option<DependencyGroup>,
    pub version: Option<String>,
    /// Failures anywhere in the request's subtree.
    pub failures: Vec<BranchFailure>,
}

impl RequestOutcome {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Summary of an install run.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    pub outcomes: Vec<RequestOutcome>,
    /// Keys extracted during the run, sorted.
    pub installed: Vec<InstallKey>,
    /// Units that found their key already claimed.
    pub skipped: usize,
    pub shadowed: Vec<Shadowed>,
}

impl InstallReport {
    /// True if every request's subtree installed cleanly.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.outcomes.iter().all(RequestOutcome::is_ok)
    }

    /// All branch failures across requests.
    pub fn failures(&self) -> impl Iterator<Item = &BranchFailure> {
        self.outcomes.iter().flat_map(|o| o.failures.iter())
    }
}

/// Run-wide stop signal carrying the reason for stopping.
#[derive(Debug, Default)]
struct CancelSignal {
    flag: AtomicBool,
    reason: Mutex<Option<PkgError>>,
    notify: Notify,
}

impl CancelSignal {
    /// Record `reason` and wake every waiter. The first reason wins.
    fn cancel(&self, reason: PkgError) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reason(&self) -> PkgError {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| PkgError::cancelled("Install cancelled"))
    }

    fn check(&self) -> Result<(), PkgError> {
        if self.is_cancelled() {
            Err(self.reason())
        } else {
            Ok(())
        }
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

struct RunState<R: ?Sized> {
    registry: Arc<R>,
    options: InstallOptions,
    graph: InstallGraph,
    permits: Semaphore,
    /// Packuments fetched during this run.
    packuments: RwLock<HashMap<String, Arc<Packument>>>,
    cancel: CancelSignal,
    skipped: AtomicUsize,
    shadowed: Mutex<Vec<Shadowed>>,
}

/// A resolved request, ready to claim.
struct Resolved {
    key: InstallKey,
    dir_id: String,
    meta: VersionMeta,
}

/// What happened to a unit that did not fail.
enum Placement {
    Installed(Vec<PackageSpec>),
    Skipped,
}

/// Result of one unit and its subtree.
struct UnitResult {
    version: Option<String>,
    failures: Vec<BranchFailure>,
}

/// Installs packages and their dependency trees.
///
/// One `Installer` is one install run: its claim table and packument cache
/// live as long as the installer. Create a new one for every run.
pub struct Installer<R: Registry + ?Sized> {
    state: Arc<RunState<R>>,
}

impl<R: Registry + ?Sized> Clone for Installer<R> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<R: Registry + ?Sized> Installer<R> {
    #[must_use]
    pub fn new(registry: Arc<R>, options: InstallOptions) -> Self {
        let permits = Semaphore::new(options.concurrency.max(1));
        Self {
            state: Arc::new(RunState {
                registry,
                options,
                graph: InstallGraph::new(),
                permits,
                packuments: RwLock::new(HashMap::new()),
                cancel: CancelSignal::default(),
                skipped: AtomicUsize::new(0),
                shadowed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The run's claim table.
    #[must_use]
    pub fn graph(&self) -> &InstallGraph {
        &self.state.graph
    }

    #[must_use]
    pub fn options(&self) -> &InstallOptions {
        &self.state.options
    }

    /// Install `requests` and everything they depend on.
    pub async fn install(&self, requests: Vec<PackageSpec>) -> InstallReport {
        let deadline = self.deadline();
        let outcomes = self.run_batch(requests, None, deadline).await;
        self.report(outcomes)
    }

    /// Install manifest groups one batch at a time, in the given order.
    ///
    /// All batches share the run's claim table, so a package installed by an
    /// earlier group is skipped by later ones.
    pub async fn install_groups(
        &self,
        groups: Vec<(DependencyGroup, Vec<PackageSpec>)>,
    ) -> InstallReport {
        let deadline = self.deadline();
        let mut outcomes = Vec::new();
        for (group, requests) in groups {
            debug!(%group, count = requests.len(), "Installing dependency group");
            outcomes.extend(self.run_batch(requests, Some(group), deadline).await);
        }
        self.report(outcomes)
    }

    fn deadline(&self) -> Option<Instant> {
        self.state.options.run_timeout.map(|t| Instant::now() + t)
    }

    async fn run_batch(
        &self,
        requests: Vec<PackageSpec>,
        group: Option<DependencyGroup>,
        deadline: Option<Instant>,
    ) -> Vec<RequestOutcome> {
        info!(
            count = requests.len(),
            modules = %self.state.options.modules_root.display(),
            "Starting install"
        );

        let mut run = self.clone().install_all(requests.clone(), None);
        let results = match deadline {
            Some(deadline) => {
                if let Ok(results) = tokio::time::timeout_at(deadline, &mut run).await {
                    results
                } else {
                    let limit = self.state.options.run_timeout.unwrap_or_default();
                    warn!(?limit, "Install timed out, cancelling");
                    self.state.cancel.cancel(PkgError::timeout(format!(
                        "Install did not finish within {limit:?}"
                    )));
                    run.await
                }
            }
            None => run.await,
        };

        requests
            .into_iter()
            .zip(results)
            .map(|(request, result)| RequestOutcome {
                request,
                group,
                version: result.version,
                failures: result.failures,
            })
            .collect()
    }

    fn report(&self, outcomes: Vec<RequestOutcome>) -> InstallReport {
        let report = InstallReport {
            outcomes,
            installed: self.state.graph.done_keys(),
            skipped: self.state.skipped.load(Ordering::SeqCst),
            shadowed: self
                .state
                .shadowed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };

        info!(
            installed = report.installed.len(),
            skipped = report.skipped,
            failed = report.failures().count(),
            "Install completed"
        );
        report
    }

    /// Install a dependency list concurrently and wait for every subtree.
    ///
    /// Results are returned in request order.
    fn install_all(
        self,
        requests: Vec<PackageSpec>,
        parent: Option<InstallKey>,
    ) -> BoxFuture<'static, Vec<UnitResult>> {
        Box::pin(async move {
            let mut set = JoinSet::new();
            for (index, request) in requests.iter().cloned().enumerate() {
                let this = self.clone();
                let parent = parent.clone();
                let span = debug_span!("install", package = %request);
                set.spawn(
                    async move { (index, this.install_one(request, parent).await) }
                        .instrument(span),
                );
            }

            let mut results: Vec<Option<UnitResult>> = requests.iter().map(|_| None).collect();
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((index, result)) => results[index] = Some(result),
                    Err(e) => warn!(error = %e, "Install task ended abnormally"),
                }
            }

            requests
                .into_iter()
                .zip(results)
                .map(|(request, result)| {
                    result.unwrap_or_else(|| {
                        let error = PkgError::cancelled("Install task ended abnormally");
                        self.note_failure(&request, &error);
                        UnitResult {
                            version: None,
                            failures: vec![BranchFailure {
                                package: request,
                                version: None,
                                parent: parent.clone(),
                                error,
                            }],
                        }
                    })
                })
                .collect()
        })
    }

    async fn install_one(self, request: PackageSpec, parent: Option<InstallKey>) -> UnitResult {
        let fail = |version: Option<String>, error: PkgError| {
            self.note_failure(&request, &error);
            UnitResult {
                version: version.clone(),
                failures: vec![BranchFailure {
                    package: request.clone(),
                    version,
                    parent: parent.clone(),
                    error,
                }],
            }
        };

        let resolved = match self.resolve(&request).await {
            Ok(resolved) => resolved,
            Err(error) => return fail(None, error),
        };
        let key = resolved.key.clone();

        let dependencies = match self.place(resolved).await {
            Ok(Placement::Installed(dependencies)) => dependencies,
            Ok(Placement::Skipped) => {
                return UnitResult {
                    version: Some(key.version),
                    failures: Vec::new(),
                }
            }
            Err(error) => return fail(Some(key.version.clone()), error),
        };

        if dependencies.is_empty() {
            return UnitResult {
                version: Some(key.version),
                failures: Vec::new(),
            };
        }

        debug!(key = %key, count = dependencies.len(), "Installing dependencies");
        let children = self.clone().install_all(dependencies, Some(key.clone())).await;

        UnitResult {
            version: Some(key.version),
            failures: children.into_iter().flat_map(|c| c.failures).collect(),
        }
    }

    /// Fetch metadata and pick the version for a request.
    async fn resolve(&self, request: &PackageSpec) -> Result<Resolved, PkgError> {
        self.state.cancel.check()?;

        let packument = self.packument(&request.name).await?;
        let version = resolve_version(
            &request.spec,
            &packument,
            self.state.options.version_strategy,
        )?;
        debug!(version = %version, "Resolved version");

        let meta = packument
            .version(&version)
            .cloned()
            .ok_or_else(|| PkgError::unresolvable(&request.name, &request.spec))?;

        Ok(Resolved {
            key: InstallKey::new(request.name.clone(), version),
            dir_id: packument.package_id(&request.name).to_string(),
            meta,
        })
    }

    /// Claim the key and, if granted, download and extract it.
    async fn place(&self, resolved: Resolved) -> Result<Placement, PkgError> {
        let Resolved { key, dir_id, meta } = resolved;
        let dest = module_dir(&self.state.options.modules_root, &dir_id)?;

        match self.state.graph.claim(&key, &dir_id) {
            Claim::Granted => {}
            Claim::Skipped(state) => {
                debug!(key = %key, ?state, "Already claimed, skipping");
                self.state.skipped.fetch_add(1, Ordering::SeqCst);
                return Ok(Placement::Skipped);
            }
            Claim::Shadowed(kept) => {
                warn!(
                    requested = %key,
                    kept = %kept,
                    "Another version already occupies the package directory, skipping"
                );
                self.state
                    .shadowed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(Shadowed {
                        requested: key,
                        kept,
                    });
                return Ok(Placement::Skipped);
            }
        }

        let mut touched_disk = false;
        match self.materialize(&key, &meta, &dest, &mut touched_disk).await {
            Ok(()) => {
                self.state.graph.mark_done(&key);
                Ok(Placement::Installed(
                    meta.dependencies
                        .into_iter()
                        .map(|(name, spec)| PackageSpec::new(name, spec))
                        .collect(),
                ))
            }
            Err(error) => {
                // Cleanup must finish while the key is still held, or a
                // new owner could extract into `dest` before we remove it
                if touched_disk {
                    if let Err(e) = tokio::fs::remove_dir_all(&dest).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(path = %dest.display(), error = %e, "Failed to remove partial install");
                        }
                    }
                }
                self.state.graph.release(&key);
                Err(error)
            }
        }
    }

    async fn materialize(
        &self,
        key: &InstallKey,
        meta: &VersionMeta,
        dest: &Path,
        touched_disk: &mut bool,
    ) -> Result<(), PkgError> {
        let _permit = self.acquire_permit().await?;
        self.state.graph.start(key);

        let url = meta.dist.tarball.as_str();
        if url.is_empty() {
            return Err(PkgError::malformed_metadata(format!(
                "No tarball URL for {key}"
            )));
        }

        debug!(url = %url, "Downloading tarball");
        let bytes = self
            .cancellable(self.state.registry.fetch_tarball(url))
            .await?;
        debug!(size = bytes.len(), "Downloaded tarball");

        self.state.cancel.check()?;
        *touched_disk = true;

        let target = dest.to_path_buf();
        let layout = self.state.options.archive_layout;
        let stats = tokio::task::spawn_blocking(move || extract_tgz(&bytes, &target, layout))
            .await
            .map_err(|e| PkgError::filesystem(format!("Extraction task failed: {e}")))??;

        debug!(
            path = %dest.display(),
            files = stats.files,
            bytes = stats.bytes,
            "Extracted package"
        );
        Ok(())
    }

    /// Packument for `name`, fetched at most once per run when possible.
    async fn packument(&self, name: &str) -> Result<Arc<Packument>, PkgError> {
        if let Some(cached) = self.state.packuments.read().await.get(name) {
            return Ok(Arc::clone(cached));
        }

        let fetched = {
            let _permit = self.acquire_permit().await?;
            debug!(name, "Fetching packument");
            self.cancellable(self.state.registry.fetch_metadata(name))
                .await?
        };

        let mut cache = self.state.packuments.write().await;
        let entry = cache
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(fetched));
        Ok(Arc::clone(entry))
    }

    async fn acquire_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, PkgError> {
        tokio::select! {
            biased;
            () = self.state.cancel.cancelled() => Err(self.state.cancel.reason()),
            permit = self.state.permits.acquire() => {
                permit.map_err(|_| PkgError::cancelled("Fetch permits closed"))
            }
        }
    }

    async fn cancellable<T>(
        &self,
        work: impl Future<Output = Result<T, PkgError>>,
    ) -> Result<T, PkgError> {
        tokio::select! {
            biased;
            () = self.state.cancel.cancelled() => Err(self.state.cancel.reason()),
            result = work => result,
        }
    }

    fn note_failure(&self, request: &PackageSpec, error: &PkgError) {
        if error.is_cancellation() || self.state.cancel.is_cancelled() {
            debug!(package = %request, error = %error, "Install branch stopped");
            return;
        }

        warn!(package = %request, code = error.code(), error = %error.message(), "Install branch failed");

        if self.state.options.failure_policy == FailurePolicy::FailFast {
            self.state.cancel.cancel(PkgError::cancelled(format!(
                "Install aborted after {request} failed: {}",
                error.code()
            )));
        }
    }
}

/// Target directory for a package id, which must be a plain name or `@scope/name`.
fn module_dir(modules_root: &Path, package_id: &str) -> Result<PathBuf, PkgError> {
    let relative = Path::new(package_id);
    let segments = relative.components().count();
    let plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));

    if package_id.is_empty()
        || !plain
        || segments > 2
        || (segments == 2 && !package_id.starts_with('@'))
    {
        return Err(PkgError::unsafe_path(package_id));
    }

    Ok(modules_root.join(relative))
}
