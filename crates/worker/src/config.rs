use serde::{Deserialize, Serialize};

/// Loaded from `MATRIMONY_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// `redis://...`, or `memory://` for an in-process store.
    pub redis_url: String,
    /// Set to "production" for JSON logging, anything else for human-readable.
    #[serde(default)]
    pub env: String,
    /// SMTP URL (e.g., smtp://localhost:1025). Messages are only logged when unset.
    #[serde(default)]
    pub smtp_url: Option<String>,
    #[serde(default = "default_mail_from")]
    pub mail_from: String,
    /// Seconds between premium expiry runs.
    #[serde(default = "default_expiry_interval")]
    pub expiry_interval_secs: u64,
    /// Run the expiry job immediately on startup instead of after one interval.
    #[serde(default = "default_true")]
    pub run_on_start: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_mail_from() -> String {
    "Matrimony <noreply@localhost>".to_string()
}

fn default_expiry_interval() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn from_env() -> envy::Result<Self> {
        envy::prefixed("MATRIMONY_").from_env()
    }

    pub fn is_production(&self) -> bool {
        self.env == "production"
    }

    pub fn uses_memory_store(&self) -> bool {
        self.redis_url.starts_with("memory://")
    }
}
