use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TICK_SECS: u64 = 60;
pub const DEFAULT_CREDENTIAL_SKEW_SECS: i64 = 60;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024; // 10 MB per attachment

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
pub const GMAIL_BASE_URL: &str = "https://gmail.googleapis.com";

/// Top-level config (recurmail.toml + RECURMAIL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecurmailConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub google: GoogleConfig,
    #[serde(default)]
    pub uploads: UploadsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Background dispatch loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Start the loop with the server (default: true).
    /// Override with env var: RECURMAIL_SCHEDULER__ENABLED=false
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Seconds between ticks. Jobs fire at most one tick late.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Due jobs dispatched in parallel within one tick. 1 = strictly sequential.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_sends: usize,
    /// A credential expiring within this many seconds is refreshed first.
    #[serde(default = "default_skew")]
    pub credential_skew_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: DEFAULT_TICK_SECS,
            max_concurrent_sends: 1,
            credential_skew_secs: DEFAULT_CREDENTIAL_SKEW_SECS,
        }
    }
}

/// Google OAuth2 client + API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_userinfo_url")]
    pub userinfo_url: String,
    #[serde(default = "default_gmail_base_url")]
    pub gmail_base_url: String,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            token_url: default_token_url(),
            userinfo_url: default_userinfo_url(),
            gmail_base_url: default_gmail_base_url(),
        }
    }
}

/// Where attachment files live. The API only accepts attachment paths
/// under `dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadsConfig {
    #[serde(default = "default_upload_dir")]
    pub dir: String,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            dir: default_upload_dir(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_max_concurrent() -> usize {
    1
}
fn default_skew() -> i64 {
    DEFAULT_CREDENTIAL_SKEW_SECS
}
fn default_token_url() -> String {
    GOOGLE_TOKEN_URL.to_string()
}
fn default_userinfo_url() -> String {
    GOOGLE_USERINFO_URL.to_string()
}
fn default_gmail_base_url() -> String {
    GMAIL_BASE_URL.to_string()
}
fn default_upload_dir() -> String {
    "uploads".to_string()
}
fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.recurmail/recurmail.db", home)
}

impl RecurmailConfig {
    /// Load config from a TOML file with RECURMAIL_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.recurmail/recurmail.toml
    ///
    /// Nested keys use a double underscore: RECURMAIL_SCHEDULER__TICK_SECS=30.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: RecurmailConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RECURMAIL_").split("__"))
            .extract()
            .map_err(|e| crate::error::RecurmailError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::error::Result<()> {
        if self.scheduler.tick_secs == 0 {
            return Err(crate::error::RecurmailError::Config(
                "scheduler.tick_secs must be > 0".to_string(),
            ));
        }
        if self.scheduler.max_concurrent_sends == 0 {
            return Err(crate::error::RecurmailError::Config(
                "scheduler.max_concurrent_sends must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.recurmail/recurmail.toml", home)
}
