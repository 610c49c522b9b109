//! Sweep planning: group mirrors of one service and choose what to probe.
//!
//! Every group's primary is probed on each sweep. Its mirrors are sampled,
//! more aggressively when the primary is unhealthy, so a sweep looks for a
//! reachable alternative without hammering every mirror every time.

use rand::Rng;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::db::{HealthStatus, MonitorTarget};
use crate::normalize::generate_normalized_key;

/// Group key for targets with no usable name.
pub const UNKNOWN_GROUP: &str = "unknown";

/// Mirrors probed per sweep when the primary is Offline, before scaling.
const OFFLINE_BASE_SAMPLE: usize = 2;

/// Extra share of the remaining mirrors probed when the primary is Offline.
const OFFLINE_EXTRA_FRACTION: f64 = 0.25;

const LABEL_TAGS: &[&str] = &["http", "https", "onion", "primary"];

fn trailing_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*?)\s*\(([^()]*)\)\s*$").unwrap())
}

/// How strongly a name's trailing `(tag)` suggests it is the primary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TagPreference {
    /// "Service"
    Untagged,
    /// "Service (https)", "Service (mirror 2)"
    Labelled,
    /// "Service (2)"
    Numbered,
}

/// Split "Service (mirror 2)" into ("Service", Some("mirror 2")).
pub fn split_trailing_tag(name: &str) -> (String, Option<String>) {
    let trimmed = name.trim();
    match trailing_tag_re().captures(trimmed) {
        Some(caps) => (
            caps[1].trim().to_string(),
            Some(caps[2].trim().to_string()),
        ),
        None => (trimmed.to_string(), None),
    }
}

pub fn base_name_key(name: &str) -> String {
    let (base, _) = split_trailing_tag(name);
    let key = generate_normalized_key(&base);
    if key.is_empty() {
        UNKNOWN_GROUP.to_string()
    } else {
        key
    }
}

pub fn tag_preference(name: &str) -> TagPreference {
    let Some(tag) = split_trailing_tag(name).1 else {
        return TagPreference::Untagged;
    };

    let tag = tag.to_lowercase();
    if LABEL_TAGS.contains(&tag.as_str()) {
        TagPreference::Labelled
    } else if !tag.is_empty() && tag.chars().all(|c| c.is_ascii_digit()) {
        TagPreference::Numbered
    } else {
        TagPreference::Labelled
    }
}

/// Ordering used to elect a group's primary: best tag first, then the
/// target checked longest ago (never-checked first), then lowest id.
pub fn primary_order(a: &MonitorTarget, b: &MonitorTarget) -> Ordering {
    tag_preference(&a.name)
        .cmp(&tag_preference(&b.name))
        .then_with(|| a.last_checked_at.cmp(&b.last_checked_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Number of mirrors to probe given the primary's last known health.
pub fn sample_size(primary: HealthStatus, available: usize) -> usize {
    match primary {
        HealthStatus::Online | HealthStatus::Unknown => available.min(1),
        HealthStatus::Degraded => available.min(2),
        HealthStatus::Offline => {
            let base = available.min(OFFLINE_BASE_SAMPLE);
            let extra = (OFFLINE_EXTRA_FRACTION * (available - base) as f64).round_ties_even() as usize;
            available.min(base.max(base + extra))
        }
    }
}

/// Build the ordered list of targets to probe in one sweep.
///
/// Groups are visited in key order; each contributes its primary followed
/// by a uniformly random subset of its mirrors drawn from `rng`.
pub fn plan_sweep<R: Rng + ?Sized>(targets: &[MonitorTarget], rng: &mut R) -> Vec<MonitorTarget> {
    let mut groups: BTreeMap<String, Vec<&MonitorTarget>> = BTreeMap::new();
    for target in targets {
        groups.entry(base_name_key(&target.name)).or_default().push(target);
    }

    let mut plan = Vec::with_capacity(targets.len());
    for (_, mut members) in groups {
        members.sort_by(|a, b| primary_order(a, b));
        let primary = members[0];
        plan.push(primary.clone());

        let mirrors = &members[1..];
        let take = sample_size(primary.status, mirrors.len());
        if take == 0 {
            continue;
        }

        let mut keyed: Vec<(u64, &MonitorTarget)> = mirrors.iter().map(|m| (rng.gen(), *m)).collect();
        keyed.sort_by_key(|(key, _)| *key);
        plan.extend(keyed.into_iter().take(take).map(|(_, m)| m.clone()));
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn target(id: i64, name: &str, status: HealthStatus) -> MonitorTarget {
        MonitorTarget {
            id,
            name: name.to_string(),
            url: format!("http://t{}.onion", id),
            status,
            ..Default::default()
        }
    }

    #[test]
    fn test_split_trailing_tag() {
        assert_eq!(
            split_trailing_tag("Service (mirror 2)"),
            ("Service".to_string(), Some("mirror 2".to_string()))
        );
        assert_eq!(split_trailing_tag("Service"), ("Service".to_string(), None));
        assert_eq!(base_name_key("DarkMatter (mirror 1)"), base_name_key("Dark Matter"));
        assert_eq!(base_name_key("   "), UNKNOWN_GROUP);
        assert_eq!(base_name_key("(2)"), UNKNOWN_GROUP);
    }

    #[test]
    fn test_tag_preference() {
        assert_eq!(tag_preference("Service"), TagPreference::Untagged);
        assert_eq!(tag_preference("Service (HTTPS)"), TagPreference::Labelled);
        assert_eq!(tag_preference("Service (mirror 3)"), TagPreference::Labelled);
        assert_eq!(tag_preference("Service (2)"), TagPreference::Numbered);
    }

    #[test]
    fn test_sample_size_values() {
        assert_eq!(sample_size(HealthStatus::Online, 5), 1);
        assert_eq!(sample_size(HealthStatus::Unknown, 5), 1);
        assert_eq!(sample_size(HealthStatus::Online, 0), 0);
        assert_eq!(sample_size(HealthStatus::Degraded, 5), 2);
        assert_eq!(sample_size(HealthStatus::Degraded, 1), 1);
        assert_eq!(sample_size(HealthStatus::Offline, 1), 1);
        assert_eq!(sample_size(HealthStatus::Offline, 3), 2);
        assert_eq!(sample_size(HealthStatus::Offline, 10), 4);
        assert_eq!(sample_size(HealthStatus::Offline, 42), 12);
    }

    #[test]
    fn test_offline_sample_size_bounds() {
        for available in 0..=200 {
            let n = sample_size(HealthStatus::Offline, available);
            assert!(n >= available.min(2), "too few for {}", available);
            assert!(n <= available, "too many for {}", available);
        }
    }

    #[test]
    fn test_primary_selection_is_deterministic() {
        let targets = vec![
            target(1, "Service (2)", HealthStatus::Unknown),
            target(2, "Service (mirror)", HealthStatus::Unknown),
            target(3, "Service", HealthStatus::Unknown),
            target(4, "Service (https)", HealthStatus::Unknown),
        ];

        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = plan_sweep(&targets, &mut rng);
            assert_eq!(plan[0].id, 3);
            assert_eq!(plan.len(), 2);
        }
    }

    #[test]
    fn test_primary_tie_breaks_on_last_check_then_id() {
        let now = Utc::now();
        let mut a = target(1, "Dark Matter", HealthStatus::Online);
        let mut b = target(2, "DarkMatter", HealthStatus::Online);
        let c = target(3, "dark matter", HealthStatus::Online);
        a.last_checked_at = Some(now);
        b.last_checked_at = Some(now - Duration::minutes(5));

        let mut rng = StdRng::seed_from_u64(7);
        let plan = plan_sweep(&[a.clone(), b.clone(), c], &mut rng);
        assert_eq!(plan[0].id, 3);

        let plan = plan_sweep(&[a, b], &mut rng);
        assert_eq!(plan[0].id, 2);
    }

    #[test]
    fn test_offline_primary_probes_more_mirrors() {
        let mut targets = vec![target(1, "Market", HealthStatus::Offline)];
        for id in 2..=11 {
            targets.push(target(id, &format!("Market (mirror {})", id), HealthStatus::Unknown));
        }
        targets.push(target(20, "Forum", HealthStatus::Online));
        targets.push(target(21, "Forum (2)", HealthStatus::Unknown));
        targets.push(target(22, "Forum (3)", HealthStatus::Unknown));

        let mut rng = StdRng::seed_from_u64(1);
        let plan = plan_sweep(&targets, &mut rng);
        let ids: Vec<i64> = plan.iter().map(|t| t.id).collect();

        // "forum" sorts before "market".
        assert_eq!(ids[0], 20);
        assert_eq!(ids.len(), 2 + 5);
        assert_eq!(ids[2], 1);
        let unique: HashSet<i64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn test_mirror_sample_is_spread() {
        let mut targets = vec![target(1, "Market", HealthStatus::Online)];
        for id in 2..=11 {
            targets.push(target(id, &format!("Market ({})", id), HealthStatus::Unknown));
        }

        let chosen: HashSet<i64> = (0..30)
            .map(|seed| {
                let mut rng = StdRng::seed_from_u64(seed);
                plan_sweep(&targets, &mut rng)[1].id
            })
            .collect();
        assert!(chosen.len() > 1);
    }

    #[test]
    fn test_nameless_targets_share_a_group() {
        let targets = vec![
            target(1, "", HealthStatus::Online),
            target(2, "   ", HealthStatus::Online),
        ];
        let mut rng = StdRng::seed_from_u64(3);
        let plan = plan_sweep(&targets, &mut rng);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].id, 1);
        assert!(plan_sweep(&[], &mut rng).is_empty());
    }
}
