//! Integration tests for githost
//!
//! These tests start the real binary and verify that it can:
//! 1. Serve git push and clone over smart HTTP
//! 2. Run the post-receive hook and record the pushed commit
//! 3. Manage repositories via the HTTP API and the CLI

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::sleep;

const BINARY: &str = env!("CARGO_BIN_EXE_githost");

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Pick a free local port
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("Failed to find a free port")
}

/// Wait for a port to be available
async fn wait_for_port(port: u16, timeout_secs: u64) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(timeout_secs) {
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Start `githost serve`; the process is killed when the handle is dropped
async fn start_server(data_dir: &Path, port: u16) -> Option<Child> {
    let child = Command::new(BINARY)
        .args([
            "--data",
            data_dir.to_str().unwrap(),
            "--port",
            &port.to_string(),
            "serve",
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to start server");

    if wait_for_port(port, 10).await {
        Some(child)
    } else {
        eprintln!("HTTP server did not start in time, skipping test");
        None
    }
}

/// Run git in `dir` with a fixed identity
async fn git(dir: &Path, args: &[&str]) -> std::process::Output {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Test User")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test User")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .expect("Failed to run git")
}

/// Initialize a local git repository with some content and return its HEAD
async fn init_local_repo(dir: &Path) -> String {
    std::fs::create_dir_all(dir).expect("Failed to create work dir");
    assert!(git(dir, &["init", "--quiet"]).await.status.success());
    std::fs::write(dir.join("README.md"), "# Test Repository\n\nThis is a test.\n")
        .expect("Failed to create test file");
    assert!(git(dir, &["add", "."]).await.status.success());
    assert!(git(dir, &["commit", "--quiet", "-m", "Initial commit"])
        .await
        .status
        .success());

    let head = git(dir, &["rev-parse", "HEAD"]).await;
    String::from_utf8_lossy(&head.stdout).trim().to_string()
}

#[tokio::test]
async fn test_push_and_clone_over_http() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let data_dir = temp_dir.path().join("data");
    let port = free_port();
    let Some(_server) = start_server(&data_dir, port).await else {
        return;
    };

    let work_dir = temp_dir.path().join("work");
    let head = init_local_repo(&work_dir).await;
    let remote = format!("http://127.0.0.1:{}/demo.git", port);

    let push = git(&work_dir, &["push", &remote, "HEAD:refs/heads/main"]).await;
    assert!(
        push.status.success(),
        "push failed: {}",
        String::from_utf8_lossy(&push.stderr)
    );

    let bare = data_dir.join("repos").join("demo.git");
    assert!(bare.join("hooks").join("post-receive").exists());
    let pushed = std::fs::read_to_string(bare.join("refs").join("heads").join("main"))
        .expect("main ref should exist after push");
    assert_eq!(pushed.trim(), head);

    let clone_dir = temp_dir.path().join("clone");
    let clone = git(
        temp_dir.path(),
        &["clone", "--quiet", &remote, clone_dir.to_str().unwrap()],
    )
    .await;
    assert!(
        clone.status.success(),
        "clone failed: {}",
        String::from_utf8_lossy(&clone.stderr)
    );
    assert_eq!(
        std::fs::read_to_string(clone_dir.join("README.md")).unwrap(),
        "# Test Repository\n\nThis is a test.\n"
    );

    // The hook registers the repository and records the pushed commit
    let client = reqwest::Client::new();
    let list: serde_json::Value = client
        .get(format!("http://127.0.0.1:{}/api/repositories", port))
        .send()
        .await
        .expect("Failed to list repositories")
        .json()
        .await
        .expect("Failed to parse JSON");
    let repos = list["repositories"].as_array().unwrap();
    assert_eq!(repos.len(), 1);
    assert_eq!(repos[0]["name"], "demo");
    assert_eq!(repos[0]["latest_sha"], head.as_str());

    // No Dockerfile was pushed, so nothing was deployed
    let deployments: serde_json::Value = client
        .get(format!(
            "http://127.0.0.1:{}/api/repositories/demo/deployments",
            port
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(deployments["deployments"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_push_to_other_branch_is_accepted() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let data_dir = temp_dir.path().join("data");
    let port = free_port();
    let Some(_server) = start_server(&data_dir, port).await else {
        return;
    };

    let work_dir = temp_dir.path().join("work");
    init_local_repo(&work_dir).await;
    let remote = format!("http://127.0.0.1:{}/feature-only.git", port);

    let push = git(&work_dir, &["push", &remote, "HEAD:refs/heads/feature"]).await;
    assert!(
        push.status.success(),
        "push failed: {}",
        String::from_utf8_lossy(&push.stderr)
    );
    assert!(data_dir
        .join("repos")
        .join("feature-only.git")
        .join("refs")
        .join("heads")
        .join("feature")
        .exists());
}

#[tokio::test]
async fn test_http_api() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let data_dir = temp_dir.path().join("data");
    let port = free_port();
    let Some(_server) = start_server(&data_dir, port).await else {
        return;
    };
    let base = format!("http://127.0.0.1:{}", port);
    let client = reqwest::Client::new();

    let health = client.get(format!("{}/api/health", base)).send().await.unwrap();
    assert!(health.status().is_success());
    assert_eq!(health.text().await.unwrap(), "OK");

    let created = client
        .post(format!("{}/api/repositories", base))
        .json(&serde_json::json!({"name": "api-demo", "description": "From the API"}))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), reqwest::StatusCode::CREATED);
    let created: serde_json::Value = created.json().await.unwrap();
    assert_eq!(created["name"], "api-demo");
    assert_eq!(created["description"], "From the API");
    assert!(data_dir.join("repos").join("api-demo.git").join("HEAD").exists());

    let conflict = client
        .post(format!("{}/api/repositories", base))
        .json(&serde_json::json!({"name": "api-demo"}))
        .send()
        .await
        .unwrap();
    assert_eq!(conflict.status(), reqwest::StatusCode::CONFLICT);

    let invalid = client
        .post(format!("{}/api/repositories", base))
        .json(&serde_json::json!({"name": "../etc"}))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), reqwest::StatusCode::BAD_REQUEST);

    let check: serde_json::Value = client
        .post(format!("{}/api/check-name", base))
        .json(&serde_json::json!({"name": "fresh"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(check["name"], "fresh");
    assert_eq!(check["available"], true);
}

#[tokio::test]
async fn test_git_endpoint_rejections() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let data_dir = temp_dir.path().join("data");
    let port = free_port();
    let Some(_server) = start_server(&data_dir, port).await else {
        return;
    };
    let base = format!("http://127.0.0.1:{}", port);
    let client = reqwest::Client::new();

    let unsupported = client
        .get(format!("{}/demo.git/info/refs?service=git-upload-archive", base))
        .send()
        .await
        .unwrap();
    assert_eq!(unsupported.status(), reqwest::StatusCode::BAD_REQUEST);
    assert!(unsupported.bytes().await.unwrap().is_empty());

    let no_suffix = client
        .get(format!("{}/demo/info/refs?service=git-upload-pack", base))
        .send()
        .await
        .unwrap();
    assert_eq!(no_suffix.status(), reqwest::StatusCode::NOT_FOUND);

    let bad_name = client
        .post(format!("{}/bad%20name.git/git-upload-pack", base))
        .body("0000")
        .send()
        .await
        .unwrap();
    assert_eq!(bad_name.status(), reqwest::StatusCode::NOT_FOUND);
    assert!(bad_name.bytes().await.unwrap().is_empty());

    assert!(!data_dir.join("repos").join("demo.git").exists());
}

#[tokio::test]
async fn test_cli_create_and_list() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let data_dir = temp_dir.path().join("data");
    let data = data_dir.to_str().unwrap();

    let create = Command::new(BINARY)
        .args(["--data", data, "create-repo", "cli-demo", "--description", "From the CLI"])
        .output()
        .await
        .expect("Failed to run create-repo");
    assert!(
        create.status.success(),
        "create-repo failed: {}",
        String::from_utf8_lossy(&create.stderr)
    );

    let again = Command::new(BINARY)
        .args(["--data", data, "create-repo", "cli-demo"])
        .output()
        .await
        .expect("Failed to run create-repo");
    assert!(!again.status.success());

    let list = Command::new(BINARY)
        .args(["--data", data, "list-repos"])
        .output()
        .await
        .expect("Failed to run list-repos");
    assert!(list.status.success());
    let stdout = String::from_utf8_lossy(&list.stdout);
    assert_eq!(stdout.trim(), "cli-demo\tmain\t-");

    let hook = data_dir
        .join("repos")
        .join("cli-demo.git")
        .join("hooks")
        .join("post-receive");
    let script = std::fs::read_to_string(hook).unwrap();
    assert!(script.starts_with("#!/bin/sh\nexec "));
    assert!(script.contains("'hook' 'post-receive'"));
}
