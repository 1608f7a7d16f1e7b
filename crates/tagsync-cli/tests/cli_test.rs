//! Integration tests for the `tagsync` binary.

use std::path::Path;

use assert_cmd::Command;
use assert_cmd::assert::OutputAssertExt;
use predicates::prelude::*;
use serde_json::{Value, json};
use tagsync_core::lease::RunLease;
use tempfile::TempDir;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Get the `tagsync` command with a clean environment.
fn tagsync_cmd() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tagsync"));
    // Suppress tracing output during tests
    cmd.env("RUST_LOG", "error");
    for var in [
        "TAGSYNC_CONFIG",
        "TAGSYNC_ENDPOINT",
        "TAGSYNC_REGION",
        "AWS_REGION",
        "TAGSYNC_CONCURRENCY",
        "TAGSYNC_DRY_RUN",
        "TAGSYNC_MODE",
        "TAGSYNC_LOG_FORMAT",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn write_config(dir: &Path, endpoint: &str) -> std::path::PathBuf {
    let path = dir.join("tagsync.toml");
    let body = format!(
        r#"
[store]
endpoint = "{endpoint}"
region = "us-east-1"
request_timeout_ms = 2000

[retry]
max_retries = 0

[lease]
dir = "{}"
"#,
        dir.display()
    );
    std::fs::write(&path, body).expect("write config");
    path
}

async fn mount_single_policy(server: &MockServer, put_status: u16) {
    Mock::given(method("GET"))
        .and(path("/policies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "policies": [{"id": "p-1", "name": "ec2-readonly", "tags": {"stale": "1"}}],
            "next_token": null
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/policies/p-1/roles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "roles": [{"id": "r-1", "name": "ops", "tags": {"team": "ops"}}]
        })))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/policies/p-1/tags"))
        .respond_with(ResponseTemplate::new(put_status))
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/policies/p-1/tags"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
}

/// Run the binary off the async runtime so the mock server keeps serving.
async fn run_blocking(mut cmd: Command) -> assert_cmd::assert::Assert {
    tokio::task::spawn_blocking(move || cmd.output())
        .await
        .expect("join")
        .expect("spawn tagsync")
        .assert()
}

mod check_config {
    use super::*;

    #[test]
    fn prints_effective_config() {
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), "https://tags.example.internal");

        tagsync_cmd()
            .args(["--config", config.to_str().unwrap(), "check-config"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"region\": \"us-east-1\""))
            .stdout(predicate::str::contains("\"concurrency\": 8"));
    }

    #[test]
    fn environment_overrides_file() {
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), "https://tags.example.internal");

        tagsync_cmd()
            .env("TAGSYNC_CONCURRENCY", "21")
            .env("TAGSYNC_REGION", "eu-central-1")
            .args(["--config", config.to_str().unwrap(), "check-config"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"concurrency\": 21"))
            .stdout(predicate::str::contains("eu-central-1"));
    }

    #[test]
    fn reports_the_current_lease_holder() {
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), "https://tags.example.internal");
        let holder = Uuid::new_v4();
        let _lease = RunLease::acquire(tmp.path(), "tagsync", holder).unwrap();

        tagsync_cmd()
            .env("RUST_LOG", "info")
            .args(["--config", config.to_str().unwrap(), "check-config"])
            .assert()
            .success()
            .stderr(predicate::str::contains("Run lease is currently held"))
            .stderr(predicate::str::contains(holder.to_string()));
    }

    #[test]
    fn missing_region_is_fatal() {
        tagsync_cmd()
            .env("TAGSYNC_ENDPOINT", "https://tags.example.internal")
            .arg("check-config")
            .assert()
            .code(1)
            .stderr(predicate::str::contains("store.region"));
    }

    #[test]
    fn missing_config_file_is_fatal() {
        tagsync_cmd()
            .args(["--config", "/nonexistent/tagsync.toml", "check-config"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("failed to read config file"));
    }
}

mod run {
    use super::*;

    #[test]
    fn unreachable_store_is_fatal() {
        let tmp = TempDir::new().unwrap();
        // Port 9 (discard) is not listening on test hosts.
        let config = write_config(tmp.path(), "http://127.0.0.1:9");

        tagsync_cmd()
            .args(["--config", config.to_str().unwrap(), "run"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("policy discovery failed"));
    }

    #[test]
    fn held_lease_skips_the_run() {
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), "http://127.0.0.1:9");
        let _lease = RunLease::acquire(tmp.path(), "tagsync", Uuid::new_v4()).unwrap();

        tagsync_cmd()
            .args(["--config", config.to_str().unwrap(), "run"])
            .assert()
            .code(3)
            .stdout(predicate::str::is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn converges_and_prints_summary() {
        let server = MockServer::start().await;
        mount_single_policy(&server, 204).await;
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), &server.uri());

        let mut cmd = tagsync_cmd();
        cmd.args(["--config", config.to_str().unwrap(), "run"]);
        let assert = run_blocking(cmd).await.success();

        let summary: Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();
        assert_eq!(summary["policies_scanned"], 1);
        assert_eq!(summary["policies_mutated"], 1);
        assert_eq!(summary["failures"], json!([]));

        let requests = server.received_requests().await.unwrap();
        assert!(
            requests
                .iter()
                .all(|r| r.headers.contains_key("x-tagsync-run-id"))
        );
        assert!(requests.iter().any(|r| r.method.as_str() == "PUT"));
        assert!(requests.iter().any(|r| r.method.as_str() == "DELETE"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failures_change_exit_code_only_when_asked() {
        let server = MockServer::start().await;
        mount_single_policy(&server, 403).await;
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), &server.uri());

        let mut lenient = tagsync_cmd();
        lenient.args(["--config", config.to_str().unwrap(), "run"]);
        let assert = run_blocking(lenient).await.success();
        let summary: Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();
        assert_eq!(summary["failures"][0]["kind"], "permission");

        let mut strict = tagsync_cmd();
        strict.args(["--config", config.to_str().unwrap(), "run", "--fail-on-errors"]);
        run_blocking(strict).await.code(2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dry_run_never_writes() {
        let server = MockServer::start().await;
        mount_single_policy(&server, 204).await;
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), &server.uri());

        let mut cmd = tagsync_cmd();
        cmd.args(["--config", config.to_str().unwrap(), "run", "--dry-run"]);
        let assert = run_blocking(cmd).await.success();

        let summary: Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();
        assert_eq!(summary["dry_run"], true);
        assert_eq!(summary["policies_mutated"], 1);
        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().all(|r| r.method.as_str() == "GET"));
    }
}

mod plan {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn prints_one_line_per_pending_policy() {
        let server = MockServer::start().await;
        mount_single_policy(&server, 204).await;
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), &server.uri());

        let mut cmd = tagsync_cmd();
        cmd.args(["--config", config.to_str().unwrap(), "plan"]);
        let assert = run_blocking(cmd).await.success();

        let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
        let lines: Vec<Value> = stdout
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["policy_id"], "p-1");
        assert_eq!(lines[0]["policy_name"], "ec2-readonly");
        assert_eq!(lines[0]["to_set"], json!({"team": "ops"}));
        assert_eq!(lines[0]["to_remove"], json!(["stale"]));

        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().all(|r| r.method.as_str() == "GET"));
    }
}
