use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_MAX_WEBSOCKET_FILE_KB: i64 = 600;

/// Broker configuration, loaded from a TOML file.
#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// When set, logs are written to this file instead of stderr.
    #[serde(default)]
    pub log_file_path: Option<PathBuf>,
    #[serde(default = "default_reap_delay_secs")]
    pub session_reap_delay_secs: u64,
    /// Largest file (in KB) sent inline over the WebSocket. Values outside
    /// `1..=600` fall back to 600.
    #[serde(default = "default_max_websocket_file_kb")]
    pub max_websocket_file_kb: i64,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub compute: ComputeConfig,
    /// Present when compute engines are launched through the cluster API.
    #[serde(default)]
    pub orchestration: Option<OrchestrationConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default = "default_db_name")]
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ComputeConfig {
    #[serde(default = "default_compute_host")]
    pub host: String,
    #[serde(default = "default_compute_port")]
    pub port: u16,
    /// Seconds. Negative means wait forever.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: f64,
    /// Database host handed to the compute engine, which may resolve names
    /// differently than the broker. Defaults to `database.host`.
    #[serde(default)]
    pub db_host: Option<String>,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

#[derive(Deserialize, Debug, Clone)]
pub struct OrchestrationConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub image: String,
    /// Pod manifest template. The built-in one is used when unset.
    #[serde(default)]
    pub manifest_template_path: Option<PathBuf>,
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    #[serde(default = "default_session_label")]
    pub session_label: String,
    #[serde(default = "default_compute_port")]
    pub compute_port: u16,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct AuthConfig {
    /// Key for signing login tokens.
    #[serde(default)]
    pub token_secret: Option<String>,
}

impl AppConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                Self::from_toml_str(&contents)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.session_reap_delay_secs == 0 {
            return Err(ConfigError::Invalid(
                "session_reap_delay_secs must be positive".to_string(),
            ));
        }
        let secs = self.compute.connect_timeout_secs;
        if secs.is_nan() || (secs >= 0.0 && Duration::try_from_secs_f64(secs).is_err()) {
            return Err(ConfigError::Invalid(format!(
                "compute.connect_timeout_secs {secs} is out of range"
            )));
        }
        if self.compute.max_frame_bytes == 0 || self.compute.max_frame_bytes > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "compute.max_frame_bytes must be between 1 and {}",
                u32::MAX
            )));
        }
        if let Some(orch) = &self.orchestration {
            if orch.poll_interval_ms == 0 {
                return Err(ConfigError::Invalid(
                    "orchestration.poll_interval_ms must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// `None` means connect attempts never time out.
    pub fn connect_timeout(&self) -> Option<Duration> {
        let secs = self.compute.connect_timeout_secs;
        if secs < 0.0 {
            None
        } else {
            Duration::try_from_secs_f64(secs).ok()
        }
    }

    pub fn compute_db_host(&self) -> &str {
        self.compute
            .db_host
            .as_deref()
            .unwrap_or(&self.database.host)
    }

    pub fn max_websocket_file_bytes(&self) -> u64 {
        let kb = if (1..=DEFAULT_MAX_WEBSOCKET_FILE_KB).contains(&self.max_websocket_file_kb) {
            self.max_websocket_file_kb
        } else {
            DEFAULT_MAX_WEBSOCKET_FILE_KB
        };
        kb as u64 * 1024
    }

    pub fn reap_delay(&self) -> Duration {
        Duration::from_secs(self.session_reap_delay_secs)
    }
}

impl OrchestrationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            log_file_path: None,
            session_reap_delay_secs: default_reap_delay_secs(),
            max_websocket_file_kb: default_max_websocket_file_kb(),
            database: DatabaseConfig::default(),
            compute: ComputeConfig::default(),
            orchestration: None,
            auth: AuthConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            user: default_db_user(),
            name: default_db_name(),
            password: None,
        }
    }
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            host: default_compute_host(),
            port: default_compute_port(),
            connect_timeout_secs: default_connect_timeout_secs(),
            db_host: None,
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8088".to_string()
}

fn default_reap_delay_secs() -> u64 {
    300
}

fn default_max_websocket_file_kb() -> i64 {
    DEFAULT_MAX_WEBSOCKET_FILE_KB
}

fn default_db_host() -> String {
    "dbserver".to_string()
}

fn default_db_user() -> String {
    "rc2".to_string()
}

fn default_db_name() -> String {
    "rc2".to_string()
}

fn default_compute_host() -> String {
    "compute".to_string()
}

fn default_compute_port() -> u16 {
    7714
}

fn default_connect_timeout_secs() -> f64 {
    4.0
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_api_base_url() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_token_path() -> PathBuf {
    PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
}

fn default_session_label() -> String {
    "rc2-session".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_launch_timeout_secs() -> u64 {
    120
}
