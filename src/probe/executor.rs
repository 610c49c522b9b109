//! Two-stage probe runner.

use chrono::Utc;
use rand::seq::SliceRandom;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    classify_response, overall_status, ProbeError, ProbeRequest, ProbeSettings, ProbeStage,
    SharedRng, Transport, Verdict,
};
use crate::db::{HealthStatus, MonitorTarget, ProbeOutcome};

const MINIMAL_USER_AGENT: &str = concat!("onionwatch/", env!("CARGO_PKG_VERSION"));

const BROWSER_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (Windows NT 10.0; rv:115.0) Gecko/20100101 Firefox/115.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:115.0) Gecko/20100101 Firefox/115.0",
];

const TOR_PROJECT_REFERER: &str = "https://www.torproject.org/";

/// What one attempt (up to two stages) produced.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AttemptResult {
    success: bool,
    challenged: bool,
    latency: Option<Duration>,
}

/// Runs probes against single targets through a [`Transport`].
pub struct ProbeExecutor {
    transport: Arc<dyn Transport>,
    settings: ProbeSettings,
    rng: SharedRng,
}

impl ProbeExecutor {
    pub fn new(transport: Arc<dyn Transport>, settings: ProbeSettings, rng: SharedRng) -> Self {
        Self {
            transport,
            settings,
            rng,
        }
    }

    /// Accept only absolute http(s) URLs whose host ends in an allowed suffix.
    pub fn validate_url(&self, raw: &str) -> Result<Url, ProbeError> {
        let url = Url::parse(raw.trim())
            .map_err(|e| ProbeError::InvalidTarget(format!("{}: {}", raw, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProbeError::InvalidTarget(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }

        // The parser has already applied IDNA mapping and lowercasing.
        let host = url
            .host_str()
            .map(|h| h.trim_end_matches('.').to_lowercase())
            .unwrap_or_default();
        let allowed = self
            .settings
            .allowed_suffixes
            .iter()
            .any(|suffix| host.len() > suffix.len() && host.ends_with(&suffix.to_lowercase()));
        if !allowed {
            return Err(ProbeError::InvalidTarget(format!("host {:?} not allowed", host)));
        }

        Ok(url)
    }

    /// Probe one target.
    ///
    /// Only cancellation is an error; timeouts and network failures are
    /// folded into the outcome.
    pub async fn probe(
        &self,
        target: &MonitorTarget,
        cancel: &CancellationToken,
    ) -> Result<ProbeOutcome, ProbeError> {
        let url = match self.validate_url(&target.url) {
            Ok(url) => url,
            Err(e) => {
                warn!("Target {} rejected without probing: {}", target.id, e);
                return Ok(ProbeOutcome {
                    target_id: target.id,
                    reachable_count: 0,
                    total_attempts: 0,
                    average_latency_ms: None,
                    status: HealthStatus::Offline,
                    checked_at: Utc::now(),
                });
            }
        };

        let attempts = self.settings.attempts_per_check;
        let mut successes = 0;
        let mut challenged = 0;
        let mut latencies = Vec::with_capacity(attempts);

        for attempt in 1..=attempts {
            let result = self.run_attempt(&url, cancel).await?;
            debug!("Target {} attempt {}/{}: {:?}", target.id, attempt, attempts, result);

            if result.success {
                successes += 1;
                if let Some(latency) = result.latency {
                    latencies.push(latency.as_secs_f64() * 1000.0);
                }
            } else if result.challenged {
                challenged += 1;
            }
        }

        let average_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        Ok(ProbeOutcome {
            target_id: target.id,
            reachable_count: successes as i32,
            total_attempts: attempts as i32,
            average_latency_ms,
            status: overall_status(successes, challenged),
            checked_at: Utc::now(),
        })
    }

    async fn run_attempt(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<AttemptResult, ProbeError> {
        let mut challenged = false;

        for stage in [ProbeStage::Minimal, ProbeStage::Browser] {
            match self.run_stage(url, stage, cancel).await? {
                Some((Verdict::Success, latency)) => {
                    return Ok(AttemptResult {
                        success: true,
                        challenged: false,
                        latency: Some(latency),
                    });
                }
                Some((Verdict::Challenged, _)) => challenged = true,
                _ => {}
            }
        }

        Ok(AttemptResult {
            success: false,
            challenged,
            latency: None,
        })
    }

    /// `Ok(None)` when the stage timed out or hit a network error.
    async fn run_stage(
        &self,
        url: &Url,
        stage: ProbeStage,
        cancel: &CancellationToken,
    ) -> Result<Option<(Verdict, Duration)>, ProbeError> {
        let timeout = match stage {
            ProbeStage::Minimal => self.settings.minimal_timeout,
            ProbeStage::Browser => self.settings.browser_timeout,
        };
        let request = ProbeRequest {
            url: url.clone(),
            stage,
            headers: self.headers_for(stage),
            timeout,
            body_limit: self.settings.body_sniff_bytes,
        };

        let stage_token = cancel.child_token();
        let result = tokio::select! {
            biased;
            _ = stage_token.cancelled() => return Err(ProbeError::Cancelled),
            result = tokio::time::timeout(timeout, self.transport.send(request)) => result,
        };

        match result {
            Err(_) => {
                debug!("{:?} stage for {} timed out after {:?}", stage, url, timeout);
                Ok(None)
            }
            Ok(Err(ProbeError::Cancelled)) => Err(ProbeError::Cancelled),
            Ok(Err(e)) => {
                debug!("{:?} stage for {} failed: {}", stage, url, e);
                Ok(None)
            }
            Ok(Ok(response)) => {
                let sniff = response.body.len().min(self.settings.body_sniff_bytes);
                let verdict = classify_response(response.status, &response.body[..sniff]);
                Ok(Some((verdict, response.latency)))
            }
        }
    }

    fn headers_for(&self, stage: ProbeStage) -> Vec<(&'static str, String)> {
        match stage {
            ProbeStage::Minimal => vec![
                ("User-Agent", MINIMAL_USER_AGENT.to_string()),
                ("Accept", "text/html,*/*;q=0.8".to_string()),
                ("Cache-Control", "no-cache".to_string()),
                ("Pragma", "no-cache".to_string()),
                ("Connection", "close".to_string()),
            ],
            ProbeStage::Browser => {
                let user_agent = BROWSER_USER_AGENTS
                    .choose(&mut *self.rng.lock())
                    .copied()
                    .unwrap_or(BROWSER_USER_AGENTS[0]);
                vec![
                    ("User-Agent", user_agent.to_string()),
                    (
                        "Accept",
                        "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
                    ),
                    ("Accept-Language", "en-US,en;q=0.5".to_string()),
                    ("Referer", TOR_PROJECT_REFERER.to_string()),
                    ("Sec-Fetch-Dest", "document".to_string()),
                    ("Sec-Fetch-Mode", "navigate".to_string()),
                    ("Sec-Fetch-Site", "cross-site".to_string()),
                    ("Sec-Fetch-User", "?1".to_string()),
                    ("Upgrade-Insecure-Requests", "1".to_string()),
                    ("Cache-Control", "no-cache".to_string()),
                    ("Pragma", "no-cache".to_string()),
                    ("Connection", "close".to_string()),
                ]
            }
        }
    }
}
