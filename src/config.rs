//! Configuration module for OnionWatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// HTTP port for the admin/diagnostics API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "onionwatch.db")
    pub db_path: String,
    /// SOCKS proxy every probe is routed through (default: local Tor daemon)
    pub proxy_url: String,
    /// Period of the automatic full sweep; zero disables it
    pub sweep_interval: Duration,
    /// Maximum number of probes running at once
    pub max_concurrent_probes: usize,
    /// Optional JSON seed list replacing the built-in one
    pub seed_file: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "onionwatch.db".to_string(),
            proxy_url: "socks5h://127.0.0.1:9050".to_string(),
            sweep_interval: Duration::from_secs(900),
            max_concurrent_probes: 5,
            seed_file: None,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ONIONWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `ONIONWATCH_DB_PATH`: Database file path (default: "onionwatch.db")
    /// - `ONIONWATCH_PROXY_URL`: SOCKS proxy URL (default: "socks5h://127.0.0.1:9050")
    /// - `ONIONWATCH_SWEEP_INTERVAL_SECS`: sweep period in seconds (default: 900, 0 = off)
    /// - `ONIONWATCH_MAX_CONCURRENT_PROBES`: worker pool cap (default: 5)
    /// - `ONIONWATCH_SEED_FILE`: JSON seed list (default: built-in seeds)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = lookup("ONIONWATCH_HTTP_PORT").and_then(|v| v.parse().ok()) {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("ONIONWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(proxy) = lookup("ONIONWATCH_PROXY_URL") {
            if !proxy.trim().is_empty() {
                cfg.proxy_url = proxy.trim().to_string();
            }
        }

        if let Some(secs) = lookup("ONIONWATCH_SWEEP_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            cfg.sweep_interval = Duration::from_secs(secs);
        }

        if let Some(cap) = lookup("ONIONWATCH_MAX_CONCURRENT_PROBES")
            .and_then(|v| v.parse::<usize>().ok())
        {
            // A zero-permit semaphore would stall every sweep.
            cfg.max_concurrent_probes = cap.max(1);
        }

        cfg.seed_file = lookup("ONIONWATCH_SEED_FILE").filter(|p| !p.trim().is_empty());

        cfg
    }
}
