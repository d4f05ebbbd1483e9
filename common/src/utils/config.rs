use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    pub http_port: u16,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    #[serde(default = "default_summary_model")]
    pub summary_model: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Lease timeout for stuck `processing` jobs. Must exceed the slowest
    /// expected processing time with margin.
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: i64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// Shared secret presented by runner processes on the runner endpoints.
    pub runner_token: String,
    #[serde(default = "default_upload_max_body_bytes")]
    pub upload_max_body_bytes: usize,
    /// When set, requests presenting exactly this API key are resolved to a
    /// fixed synthetic test identity at the auth boundary. Leave unset in
    /// production deployments.
    #[serde(default)]
    pub test_identity_key: Option<String>,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_summary_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_lease_timeout_secs() -> i64 {
    900
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_upload_max_body_bytes() -> usize {
    100 * 1024 * 1024
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: "test-key".into(),
            surrealdb_address: "mem://".into(),
            surrealdb_username: "root".into(),
            surrealdb_password: "root".into(),
            surrealdb_namespace: "test".into(),
            surrealdb_database: "test".into(),
            data_dir: "/tmp/unused".into(),
            http_port: 0,
            openai_base_url: "https://example.com".into(),
            storage: StorageKind::Memory,
            transcription_model: default_transcription_model(),
            summary_model: default_summary_model(),
            max_retries: default_max_retries(),
            lease_timeout_secs: default_lease_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            runner_token: "test-runner-token".into(),
            upload_max_body_bytes: default_upload_max_body_bytes(),
            test_identity_key: None,
        }
    }
}
