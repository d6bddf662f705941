use miette::{miette, IntoDiagnostic, Result};
use npmget_core::pkg::{
    read_manifest, ArchiveLayout, DependencyGroup, FailurePolicy, InstallOptions, InstallReport,
    Installer, ManifestIssue, PackageSpec, RegistryClient, VersionStrategy, DEFAULT_CONCURRENCY,
    MANIFEST_NAME,
};
use npmget_core::Config;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(clap::Args, Debug, Default)]
pub struct InstallArgs {
    /// Packages to install (e.g., "react", "react@^18", "@types/node@20").
    /// Installs the dependencies of package.json when omitted.
    #[arg(value_name = "PKG[@SPEC]")]
    pub packages: Vec<String>,

    /// Registry base URL
    #[arg(long, value_name = "URL")]
    pub registry: Option<String>,

    /// Directory packages are installed into
    #[arg(long, value_name = "PATH")]
    pub modules_dir: Option<PathBuf>,

    /// Maximum concurrent downloads
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Stop at the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Treat specs as exact versions after dropping one leading operator
    #[arg(long)]
    pub exact: bool,

    /// Keep the tarball's top-level directory instead of stripping it
    #[arg(long)]
    pub no_strip: bool,

    /// Skip devDependencies
    #[arg(long)]
    pub no_dev: bool,

    /// Skip peerDependencies
    #[arg(long)]
    pub no_peer: bool,

    /// Abort the install after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

/// What to install.
enum Plan {
    Packages(Vec<PackageSpec>),
    Groups(Vec<(DependencyGroup, Vec<PackageSpec>)>),
}

pub fn run(config: &Config, args: &InstallArgs) -> Result<()> {
    info!(cwd = %config.cwd.display(), "install command invoked");

    let settings = config.load_settings().into_diagnostic()?;
    let registry_url = settings.registry_url(args.registry.as_deref());
    let registry = RegistryClient::new(&registry_url).into_diagnostic()?;
    debug!(registry = %registry.base_url(), "Using registry");

    let options = InstallOptions::new(
        settings.modules_root(&config.cwd, args.modules_dir.as_deref()),
    )
    .with_concurrency(
        args.concurrency
            .or(settings.concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY),
    )
    .with_failure_policy(if args.fail_fast || settings.fail_fast.unwrap_or(false) {
        FailurePolicy::FailFast
    } else {
        FailurePolicy::BestEffort
    })
    .with_version_strategy(if args.exact {
        VersionStrategy::StripPrefix
    } else {
        VersionStrategy::HighestMatching
    })
    .with_archive_layout(if args.no_strip {
        ArchiveLayout::Verbatim
    } else {
        ArchiveLayout::StripFirst
    })
    .with_run_timeout(args.timeout.map(Duration::from_secs));

    let (plan, issues) = plan(config, args)?;

    let empty = match &plan {
        Plan::Packages(specs) => specs.is_empty(),
        Plan::Groups(groups) => groups.is_empty(),
    };
    if empty {
        if config.json_logs {
            let output = build_output(&InstallReport::default(), &issues);
            println!("{}", serde_json::to_string_pretty(&output).into_diagnostic()?);
        } else {
            print_issues(&issues);
            println!("No dependencies to install");
        }
        if !issues.is_empty() {
            std::process::exit(2);
        }
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    let installer = Installer::new(Arc::new(registry), options);
    let report = runtime.block_on(async {
        match plan {
            Plan::Packages(specs) => installer.install(specs).await,
            Plan::Groups(groups) => installer.install_groups(groups).await,
        }
    });

    let output = build_output(&report, &issues);
    if config.json_logs {
        println!("{}", serde_json::to_string_pretty(&output).into_diagnostic()?);
    } else {
        print_human(&report, &issues);
    }

    if !output.ok {
        std::process::exit(2);
    }

    Ok(())
}

/// Build the install plan from arguments or the project manifest.
fn plan(config: &Config, args: &InstallArgs) -> Result<(Plan, Vec<ManifestIssue>)> {
    if !args.packages.is_empty() {
        let specs = args
            .packages
            .iter()
            .map(|arg| PackageSpec::parse(arg))
            .collect::<Result<Vec<_>, _>>()
            .into_diagnostic()?;
        return Ok((Plan::Packages(specs), Vec::new()));
    }

    let mut keep = vec![DependencyGroup::Production];
    if !args.no_dev {
        keep.push(DependencyGroup::Dev);
    }
    if !args.no_peer {
        keep.push(DependencyGroup::Peer);
    }

    let manifest_path = config.cwd.join(MANIFEST_NAME);
    let manifest = read_manifest(&manifest_path)
        .map_err(|e| miette!("{e}"))?
        .only(&keep);

    if !config.json_logs {
        println!("Installing dependencies from {MANIFEST_NAME}");
    }

    Ok((Plan::Groups(manifest.groups), manifest.issues))
}

fn print_issues(issues: &[ManifestIssue]) {
    for issue in issues {
        eprintln!("! {}: {} {}", issue.name, issue.code, issue.message);
    }
}

fn print_human(report: &InstallReport, issues: &[ManifestIssue]) {
    print_issues(issues);

    for key in &report.installed {
        println!("+ {key}");
    }

    for shadowed in &report.shadowed {
        println!(
            "~ {} (kept {})",
            shadowed.requested, shadowed.kept.version
        );
    }

    for failure in report.failures() {
        match &failure.parent {
            Some(parent) => eprintln!(
                "! {}: {} {} (required by {parent})",
                failure.package,
                failure.error.code(),
                failure.error.message()
            ),
            None => eprintln!(
                "! {}: {} {}",
                failure.package,
                failure.error.code(),
                failure.error.message()
            ),
        }
    }

    let installed = report.installed.len();
    let noun = if installed == 1 { "package" } else { "packages" };
    println!("{installed} {noun} installed");
}

#[derive(Debug, Serialize)]
struct InstallOutput {
    ok: bool,
    installed: Vec<InstalledPackage>,
    skipped: usize,
    shadowed: Vec<ShadowedPackage>,
    requests: Vec<RequestInfo>,
    errors: Vec<ErrorInfo>,
    manifest_issues: Vec<IssueInfo>,
}

#[derive(Debug, Serialize)]
struct InstalledPackage {
    name: String,
    version: String,
}

#[derive(Debug, Serialize)]
struct ShadowedPackage {
    name: String,
    version: String,
    kept_version: String,
}

#[derive(Debug, Serialize)]
struct RequestInfo {
    name: String,
    spec: String,
    group: Option<String>,
    version: Option<String>,
    ok: bool,
}

#[derive(Debug, Serialize)]
struct ErrorInfo {
    spec: String,
    version: Option<String>,
    parent: Option<String>,
    code: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct IssueInfo {
    name: String,
    code: String,
    message: String,
}

fn build_output(report: &InstallReport, issues: &[ManifestIssue]) -> InstallOutput {
    InstallOutput {
        ok: report.is_ok() && issues.is_empty(),
        installed: report
            .installed
            .iter()
            .map(|key| InstalledPackage {
                name: key.name.clone(),
                version: key.version.clone(),
            })
            .collect(),
        skipped: report.skipped,
        shadowed: report
            .shadowed
            .iter()
            .map(|s| ShadowedPackage {
                name: s.requested.name.clone(),
                version: s.requested.version.clone(),
                kept_version: s.kept.version.clone(),
            })
            .collect(),
        requests: report
            .outcomes
            .iter()
            .map(|o| RequestInfo {
                name: o.request.name.clone(),
                spec: o.request.spec.clone(),
                group: o.group.map(|g| g.to_string()),
                version: o.version.clone(),
                ok: o.is_ok(),
            })
            .collect(),
        errors: report
            .failures()
            .map(|f| ErrorInfo {
                spec: f.package.to_string(),
                version: f.version.clone(),
                parent: f.parent.as_ref().map(ToString::to_string),
                code: f.error.code().to_string(),
                message: f.error.message().to_string(),
            })
            .collect(),
        manifest_issues: issues
            .iter()
            .map(|i| IssueInfo {
                name: i.name.clone(),
                code: i.code.to_string(),
                message: i.message.clone(),
            })
            .collect(),
    }
}
