//! Integration tests for the `npmget` binary.
//!
//! These tests use a mock npm registry to avoid network calls.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::process::{Command, Output};
use std::thread;
use std::time::Duration;
use tar::Builder;
use tempfile::TempDir;

fn npmget() -> Command {
    Command::new(env!("CARGO_BIN_EXE_npmget"))
}

/// Create a test tarball with a package.json.
fn create_test_tarball(name: &str, version: &str) -> Vec<u8> {
    let pkg_json = format!(r#"{{"name":"{name}","version":"{version}","main":"index.js"}}"#);
    let index_js = b"module.exports = 42;";

    let mut tar_bytes = Vec::new();
    {
        let mut builder = Builder::new(&mut tar_bytes);

        let mut header = tar::Header::new_gnu();
        header.set_path("package/package.json").unwrap();
        header.set_size(pkg_json.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, pkg_json.as_bytes()).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_path("package/index.js").unwrap();
        header.set_size(index_js.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &index_js[..]).unwrap();

        builder.finish().unwrap();
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}

/// Packages `a@1.0.0 -> b@2.0.0`, plus a standalone `c@3.0.0`.
fn fixture(name: &str) -> Option<(&'static str, serde_json::Value)> {
    match name {
        "a" => Some(("1.0.0", serde_json::json!({ "b": "^2.0.0" }))),
        "b" => Some(("2.0.0", serde_json::json!({}))),
        "c" => Some(("3.0.0", serde_json::json!({}))),
        _ => None,
    }
}

async fn handle_packument(Path(name): Path<String>, State(base_url): State<String>) -> Response {
    let Some((version, deps)) = fixture(&name) else {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    };

    let packument = serde_json::json!({
        "_id": name,
        "name": name,
        "dist-tags": { "latest": version },
        "versions": {
            version: {
                "name": name,
                "version": version,
                "dependencies": deps,
                "dist": { "tarball": format!("{base_url}/{name}/-/{name}-{version}.tgz") }
            }
        }
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        packument.to_string(),
    )
        .into_response()
}

async fn handle_tarball(Path((name, tarball)): Path<(String, String)>) -> Response {
    match fixture(&name) {
        Some((version, _)) if tarball == format!("{name}-{version}.tgz") => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/gzip")],
            Body::from(create_test_tarball(&name, version)),
        )
            .into_response(),
        _ => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

/// Start the mock registry server in a background thread.
/// Returns the base URL.
fn start_mock_registry() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let state = base_url.clone();

    thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let app = Router::new()
                .route("/:name", get(handle_packument))
                .route("/:name/-/:tarball", get(handle_tarball))
                .with_state(state);
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
    });

    // Give the server time to start
    thread::sleep(Duration::from_millis(100));

    base_url
}

/// Create a test project with package.json.
fn create_test_project(deps: &[(&str, &str)], dev_deps: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();

    let to_map = |entries: &[(&str, &str)]| -> serde_json::Map<String, serde_json::Value> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), serde_json::Value::String((*v).to_string())))
            .collect()
    };

    let package_json = serde_json::json!({
        "name": "test-project",
        "version": "1.0.0",
        "dependencies": to_map(deps),
        "devDependencies": to_map(dev_deps),
    });

    std::fs::write(
        dir.path().join("package.json"),
        serde_json::to_string_pretty(&package_json).unwrap(),
    )
    .unwrap();

    dir
}

fn run_install(dir: &TempDir, registry: &str, args: &[&str]) -> Output {
    npmget()
        .arg("--cwd")
        .arg(dir.path())
        .args(args)
        .env("NPMGET_REGISTRY", registry)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run npmget")
}

#[test]
fn test_help_lists_install() {
    let output = npmget().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("install"));
}

#[test]
fn test_version_prints_name() {
    let output = npmget().arg("version").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("npmget "));
}

#[test]
fn test_install_named_package_json_output() {
    let registry = start_mock_registry();
    let dir = tempfile::tempdir().unwrap();

    let output = run_install(&dir, &registry, &["--json", "install", "a"]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["ok"], true);
    let installed: Vec<String> = result["installed"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| format!("{}@{}", p["name"].as_str().unwrap(), p["version"].as_str().unwrap()))
        .collect();
    assert_eq!(installed, vec!["a@1.0.0", "b@2.0.0"]);

    assert!(dir.path().join("node_modules/a/package.json").is_file());
    assert!(dir.path().join("node_modules/b/index.js").is_file());
}

#[test]
fn test_install_alias_from_manifest_skips_dev() {
    let registry = start_mock_registry();
    let dir = create_test_project(&[("a", "^1.0.0")], &[("c", "3.0.0")]);

    let output = run_install(&dir, &registry, &["i", "--no-dev"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("+ a@1.0.0"), "stdout: {stdout}");
    assert!(stdout.contains("+ b@2.0.0"), "stdout: {stdout}");
    assert!(!dir.path().join("node_modules/c").exists());
}

#[test]
fn test_install_from_manifest_with_dev() {
    let registry = start_mock_registry();
    let dir = create_test_project(&[("a", "^1.0.0")], &[("c", "3.0.0")]);

    let output = run_install(&dir, &registry, &["--json", "install"]);
    assert!(output.status.success());

    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let groups: Vec<&str> = result["requests"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["group"].as_str().unwrap())
        .collect();
    assert_eq!(groups, vec!["dependencies", "devDependencies"]);
    assert!(dir.path().join("node_modules/c/index.js").is_file());
}

#[test]
fn test_modules_dir_override() {
    let registry = start_mock_registry();
    let dir = tempfile::tempdir().unwrap();

    let output = run_install(&dir, &registry, &["install", "c", "--modules-dir", "vendor"]);
    assert!(output.status.success());
    assert!(dir.path().join("vendor/c/index.js").is_file());
}

#[test]
fn test_missing_package_exits_with_two() {
    let registry = start_mock_registry();
    let dir = tempfile::tempdir().unwrap();

    let output = run_install(&dir, &registry, &["install", "c", "does-not-exist"]);
    assert_eq!(output.status.code(), Some(2));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("PKG_NOT_FOUND"), "stderr: {stderr}");
    // Best effort: the sibling still installs
    assert!(dir.path().join("node_modules/c/index.js").is_file());
}

#[test]
fn test_invalid_manifest_entry_exits_with_two() {
    let registry = start_mock_registry();
    let dir = tempfile::tempdir().unwrap();
    let package_json = serde_json::json!({
        "name": "test-project",
        "dependencies": { "a": "^1.0.0", "c": 3 }
    });
    std::fs::write(dir.path().join("package.json"), package_json.to_string()).unwrap();

    let output = run_install(&dir, &registry, &["--json", "install"]);
    assert_eq!(output.status.code(), Some(2));

    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["ok"], false);
    assert_eq!(result["manifest_issues"][0]["name"], "c");
    // The valid entry still installs
    assert!(dir.path().join("node_modules/a/index.js").is_file());
}

#[test]
fn test_invalid_manifest_is_setup_error() {
    let registry = start_mock_registry();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("package.json"), "{ not json").unwrap();

    let output = run_install(&dir, &registry, &["install"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_invalid_spec_is_setup_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_install(&dir, "http://127.0.0.1:9/", &["install", "@scope"]);
    assert_eq!(output.status.code(), Some(1));
}
