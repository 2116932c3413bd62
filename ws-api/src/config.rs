use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_provisioner_interval")]
    pub provisioner_interval_secs: u64,

    #[serde(default = "default_reconciler_interval")]
    pub reconciler_interval_secs: u64,
}

fn default_bind_addr() -> String {
    std::env::var("WS_API_BIND").unwrap_or_else(|_| "127.0.0.1:3121".to_string())
}

fn default_db_path() -> PathBuf {
    std::env::var("WS_API_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/ws-engine/engine.db"))
}

fn interval_from_env(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(default)
}

fn default_provisioner_interval() -> u64 {
    interval_from_env("WS_API_PROVISIONER_INTERVAL", 10)
}

fn default_reconciler_interval() -> u64 {
    interval_from_env("WS_API_RECONCILER_INTERVAL", 60)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            provisioner_interval_secs: default_provisioner_interval(),
            reconciler_interval_secs: default_reconciler_interval(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}
