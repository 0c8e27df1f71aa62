use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::ingest::{GateConfig, OrchestratorConfig};
use crate::sizing::SizingConfig;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub batch: BatchConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Status server configuration (health, status and metrics endpoints)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    9090
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("cellingest.db")
}

/// Remote batch API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    /// Base URL of the batch API (e.g., "https://batch.googleapis.com")
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Cloud project that owns the jobs
    pub project_id: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Bearer token sent with every request. Empty means unauthenticated.
    #[serde(default)]
    pub api_token: String,
    /// Container image running the ingest pipeline
    pub image: String,
    /// Container image running the expression scatter renderer
    #[serde(default)]
    pub image_pipeline_image: Option<String>,
    /// Database name passed through to every job's environment
    #[serde(default = "default_database_name")]
    pub database_name: String,
    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u32,
    /// Boot disk size for job VMs in GB
    #[serde(default = "default_boot_disk_gb")]
    pub boot_disk_gb: u32,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_api_url() -> String {
    "https://batch.googleapis.com".to_string()
}

fn default_region() -> String {
    "us-central1".to_string()
}

fn default_database_name() -> String {
    "single_cell_portal".to_string()
}

fn default_timeout() -> u32 {
    30
}

fn default_boot_disk_gb() -> u32 {
    300
}

/// Transport retry policy for remote API calls.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Local filesystem mirror of remote buckets
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("buckets")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Address that receives admin reports
    #[serde(default = "default_admin_email")]
    pub admin_email: String,
    /// Portal base URL used in user-facing messages
    #[serde(default = "default_portal_url")]
    pub portal_url: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            admin_email: default_admin_email(),
            portal_url: default_portal_url(),
        }
    }
}

fn default_admin_email() -> String {
    "admin@localhost".to_string()
}

fn default_portal_url() -> String {
    "http://localhost:3000/single_cell".to_string()
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub batch: SanitizedBatchConfig,
    pub storage: StorageConfig,
    pub orchestrator: OrchestratorConfig,
    pub sizing: SizingConfig,
    pub gate: GateConfig,
    pub notifications: NotificationConfig,
}

/// Batch config with the API token hidden
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedBatchConfig {
    pub api_url: String,
    pub project_id: String,
    pub region: String,
    pub api_token_configured: bool,
    pub image: String,
    pub database_name: String,
    pub timeout_secs: u32,
    pub retry: RetryConfig,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            batch: SanitizedBatchConfig {
                api_url: config.batch.api_url.clone(),
                project_id: config.batch.project_id.clone(),
                region: config.batch.region.clone(),
                api_token_configured: !config.batch.api_token.is_empty(),
                image: config.batch.image.clone(),
                database_name: config.batch.database_name.clone(),
                timeout_secs: config.batch.timeout_secs,
                retry: config.batch.retry.clone(),
            },
            storage: config.storage.clone(),
            orchestrator: config.orchestrator.clone(),
            sizing: config.sizing.clone(),
            gate: config.gate.clone(),
            notifications: config.notifications.clone(),
        }
    }
}
