//! Static seed list merged into the registry at startup.

use serde::Deserialize;
use std::path::Path;

use crate::error::MonitorError;

/// One seed entry: a service name, its address and a category label.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SeedTarget {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub category: String,
}

impl SeedTarget {
    pub fn new(name: &str, url: &str, category: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            category: category.to_string(),
        }
    }
}

/// Well-known service name fragments, in the order they are promoted when
/// too few targets have been clicked yet.
pub const PRIORITY_SERVICES: &[&str] = &[
    "duckduckgo",
    "tor project",
    "propublica",
    "bbc",
    "new york times",
    "securedrop",
    "debian",
];

pub fn default_seeds() -> Vec<SeedTarget> {
    vec![
        SeedTarget::new(
            "DuckDuckGo",
            "https://duckduckgogg42xjoc72x3sjasowoarfbgcmvfimaftt6twagswzczad.onion/",
            "Search",
        ),
        SeedTarget::new(
            "The Tor Project",
            "http://2gzyxa5ihm7nsggfxnu52rck2vv4rvmdlkiu3zzui5du4xyclen53wid.onion/",
            "Privacy",
        ),
        SeedTarget::new(
            "ProPublica",
            "http://p53lf57qovyuvwsc6xnrppyply3vtqm7l6pcobkmyqsiofyeznfu5uqd.onion/",
            "News",
        ),
        SeedTarget::new(
            "BBC News",
            "https://www.bbcweb3hytmzhn5d532owbu6oqadra5z3ar726vq5kgwwn6aucdccrad.onion/",
            "News",
        ),
        SeedTarget::new(
            "The New York Times",
            "https://www.nytimesn7cgmftshazwhfgzm37qxb44r64ytbb2dj3x62d2lljsciiyd.onion/",
            "News",
        ),
        SeedTarget::new(
            "SecureDrop",
            "http://sdolvtfhatvsysc6l34d65ymdwxcujausv7k5jk4cy5ttzhjoi6fzvyd.onion/",
            "Privacy",
        ),
        SeedTarget::new(
            "Debian",
            "http://2s4yqjx5ul6okpp3f2gaunr2syex5jgbfpfvhxxbbjwnrsvbk5v3qbid.onion/",
            "Software",
        ),
    ]
}

/// Read a JSON array of `{name, url, category}` objects.
pub fn load_seed_file<P: AsRef<Path>>(path: P) -> Result<Vec<SeedTarget>, MonitorError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| MonitorError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| MonitorError::Config(format!("invalid seed file {}: {}", path.display(), e)))
}
