//! Response classification for probe attempts.

use crate::db::HealthStatus;

/// Body fragments that mark an anti-bot or WAF interstitial.
pub const CHALLENGE_PHRASES: &[&str] = &[
    "checking your browser",
    "ddos-guard",
    "cloudflare",
    "cf-ray",
    "just a moment",
    "attention required",
    "captcha",
    "service temporarily unavailable",
];

/// Status codes typically returned by challenge pages and rate limiters.
pub const CHALLENGE_STATUSES: &[u16] = &[
    401, 403, 406, 407, 409, 412, 418, 421, 425, 429, 430, 503, 520, 521, 522, 523, 524,
];

/// How a single stage response counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Challenged,
    Failed,
}

pub fn body_has_challenge(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body).to_lowercase();
    CHALLENGE_PHRASES.iter().any(|phrase| text.contains(phrase))
}

/// A clean 2xx/3xx is a success; a challenge status or phrase is a
/// challenge even when the status looks fine.
pub fn classify_response(status: u16, body: &[u8]) -> Verdict {
    let challenge_body = body_has_challenge(body);
    if (200..400).contains(&status) && !challenge_body {
        Verdict::Success
    } else if challenge_body || CHALLENGE_STATUSES.contains(&status) {
        Verdict::Challenged
    } else {
        Verdict::Failed
    }
}

/// Fold attempt counts into a health status.
///
/// Any challenge without a success reads as Degraded.
pub fn overall_status(successes: usize, challenged: usize) -> HealthStatus {
    if successes >= 2 {
        HealthStatus::Online
    } else if successes == 1 || challenged > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Offline
    }
}
