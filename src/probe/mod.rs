//! Probe module for onion-service availability checks.
//!
//! A probe runs several attempts against one target, each attempt trying a
//! minimal request first and a browser-like request second, and classifies
//! the target from how many attempts got a clean response.

mod classify;
mod executor;
mod http;

pub use classify::*;
pub use executor::*;
pub use http::*;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("target not probeable: {0}")]
    InvalidTarget(String),
    #[error("probe cancelled")]
    Cancelled,
}

/// Random source shared by concurrent probes and the planner.
pub type SharedRng = Arc<Mutex<StdRng>>;

/// OS-seeded ChaCha generator, so probe patterns cannot be predicted.
pub fn shared_rng() -> SharedRng {
    Arc::new(Mutex::new(StdRng::from_entropy()))
}

/// Deterministic generator for tests and replays.
pub fn seeded_rng(seed: u64) -> SharedRng {
    Arc::new(Mutex::new(StdRng::seed_from_u64(seed)))
}

/// Which request profile a stage uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStage {
    /// Compact non-browser request.
    Minimal,
    /// Request dressed up as a Tor Browser navigation.
    Browser,
}

/// One HTTP GET to send through the transport.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub url: Url,
    pub stage: ProbeStage,
    pub headers: Vec<(&'static str, String)>,
    pub timeout: Duration,
    /// Stop reading the body after this many bytes.
    pub body_limit: usize,
}

/// What came back: status, time to headers and the start of the body.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    pub latency: Duration,
    pub body: Vec<u8>,
}

/// Network transport used by probes.
///
/// Implementations route traffic however they like (a SOCKS proxy in
/// production). Dropping the returned future must abort the request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ProbeRequest) -> Result<ProbeResponse, ProbeError>;
}

/// Tuning knobs for the probe executor.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub attempts_per_check: usize,
    pub minimal_timeout: Duration,
    pub browser_timeout: Duration,
    pub body_sniff_bytes: usize,
    pub allowed_suffixes: Vec<String>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            attempts_per_check: 3,
            minimal_timeout: Duration::from_secs(25),
            browser_timeout: Duration::from_secs(65),
            body_sniff_bytes: 8192,
            allowed_suffixes: vec![".onion".to_string(), ".i2p".to_string()],
        }
    }
}
