use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use reqwest::Client;
use tempfile::TempDir;
use tokio::time::sleep;

/// Find an available port
fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Write a minimal valid config into `dir` and return its path
fn write_config(dir: &Path, port: u16) -> std::path::PathBuf {
    let config = format!(
        r#"
[batch]
project_id = "sc-portal"
image = "gcr.io/sc-portal/ingest-pipeline:1.30.0"
api_url = "http://127.0.0.1:1"

[server]
host = "127.0.0.1"
port = {}

[database]
path = "{}"

[storage]
root = "{}"

[orchestrator]
tick_interval_ms = 50
"#,
        port,
        dir.join("cellingest.db").display(),
        dir.join("buckets").display()
    );
    let path = dir.join("config.toml");
    std::fs::write(&path, config).unwrap();
    path
}

async fn spawn_worker(config_path: &Path) -> tokio::process::Child {
    tokio::process::Command::new(env!("CARGO_BIN_EXE_cellingest"))
        .env("CELLINGEST_CONFIG", config_path)
        .env("RUST_LOG", "error")
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to spawn worker")
}

async fn wait_for_worker(port: u16, max_attempts: u32) -> bool {
    let client = Client::new();
    for _ in 0..max_attempts {
        if client
            .get(format!("http://127.0.0.1:{}/health", port))
            .send()
            .await
            .is_ok()
        {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_worker_serves_status_routes() {
    let temp_dir = TempDir::new().unwrap();
    let port = get_available_port();
    let config_path = write_config(temp_dir.path(), port);

    let mut worker = spawn_worker(&config_path).await;
    assert!(
        wait_for_worker(port, 100).await,
        "Worker did not start in time"
    );

    let client = Client::new();
    let health: serde_json::Value = client
        .get(format!("http://127.0.0.1:{}/health", port))
        .send()
        .await
        .expect("Failed to send request")
        .json()
        .await
        .expect("Failed to parse JSON");
    assert_eq!(health["status"], "ok");

    let status: serde_json::Value = client
        .get(format!("http://127.0.0.1:{}/status", port))
        .send()
        .await
        .expect("Failed to send request")
        .json()
        .await
        .expect("Failed to parse JSON");
    assert_eq!(status["scheduler"]["running"], true);
    assert_eq!(status["scheduler"]["scheduled"], 0);
    assert_eq!(status["config"]["batch"]["project_id"], "sc-portal");

    let metrics = client
        .get(format!("http://127.0.0.1:{}/metrics", port))
        .send()
        .await
        .expect("Failed to send request")
        .text()
        .await
        .expect("Failed to read body");
    assert!(metrics.contains("cellingest_scheduler_running 1"));

    worker.kill().await.ok();
}

#[tokio::test]
async fn test_worker_rejects_invalid_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[batch]
project_id = ""
image = "gcr.io/sc-portal/ingest-pipeline:1.30.0"
"#,
    )
    .unwrap();

    let status = tokio::process::Command::new(env!("CARGO_BIN_EXE_cellingest"))
        .env("CELLINGEST_CONFIG", &path)
        .env("RUST_LOG", "error")
        .status()
        .await
        .expect("Failed to run worker");
    assert!(!status.success());
}

#[tokio::test]
async fn test_worker_fails_without_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let status = tokio::process::Command::new(env!("CARGO_BIN_EXE_cellingest"))
        .env("CELLINGEST_CONFIG", temp_dir.path().join("missing.toml"))
        .env("RUST_LOG", "error")
        .status()
        .await
        .expect("Failed to run worker");
    assert!(!status.success());
}
