//! Name and URL canonicalization.
//!
//! Pure functions turning free-text service names and URLs into a display
//! form and into comparison keys used for deduplication.

use reqwest::Url;
use regex::Regex;
use std::sync::OnceLock;

fn mirror_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\s*\(\s*mirror\b[^)]*\)").unwrap())
}

fn trailing_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+\d+\s*$").unwrap())
}

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove every `(mirror ...)` tag from a name.
pub fn strip_mirror_suffix(name: &str) -> String {
    collapse_whitespace(&mirror_suffix_re().replace_all(name, " "))
}

/// Convert a free-text service name into its canonical display form.
///
/// "DarkMatter (mirror 2)" becomes "Dark Matter", "pitch 1" becomes
/// "Pitch". Applying it twice yields the same result as applying it once.
pub fn normalize_to_canonical(name: &str) -> String {
    let stripped = strip_duplicate_markers(name);
    let split = split_pascal_case(&stripped);

    split
        .split_whitespace()
        .map(title_case_token)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Case- and formatting-insensitive comparison key for a name.
pub fn generate_normalized_key(name: &str) -> String {
    normalize_to_canonical(name)
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// True when both names collapse to the same comparison key.
pub fn are_similar(a: &str, b: &str) -> bool {
    generate_normalized_key(a).to_lowercase() == generate_normalized_key(b).to_lowercase()
}

/// Canonical stored form of a URL.
///
/// Adds `http://` when no scheme is given, lowercases scheme and host,
/// drops the default port and a bare `/` path. Input that cannot be parsed
/// is returned trimmed but otherwise untouched.
pub fn normalize_url_for_storage(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let Some(parsed) = parse_with_default_scheme(trimmed) else {
        return trimmed.to_string();
    };

    let mut out = authority(&parsed);
    if parsed.path() != "/" {
        out.push_str(parsed.path());
    }
    if let Some(query) = parsed.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = parsed.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

/// Deduplication key for a URL, distinct from its display form.
///
/// `scheme://host[:port]` followed by path and query; a bare trailing `/`
/// is dropped when there is neither a path nor a query, and fragments never
/// participate.
pub fn build_url_comparison_key(url: &str) -> String {
    let normalized = normalize_url_for_storage(url);
    let Some(parsed) = parse_with_default_scheme(&normalized) else {
        return normalized.to_lowercase();
    };

    let mut key = authority(&parsed);
    let path = parsed.path();
    let query = parsed.query().unwrap_or("");
    if !(path == "/" && query.is_empty()) {
        key.push_str(path);
    }
    if !query.is_empty() {
        key.push('?');
        key.push_str(query);
    }
    key
}

fn parse_with_default_scheme(url: &str) -> Option<Url> {
    let candidate = if url.contains("://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    };

    let parsed = Url::parse(&candidate).ok()?;
    parsed.host_str()?;
    Some(parsed)
}

fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_lowercase();
    let mut out = format!("{}://{}", url.scheme().to_lowercase(), host);
    // `port()` is already None for the scheme's default port.
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out
}

fn strip_duplicate_markers(name: &str) -> String {
    let mut current = collapse_whitespace(name);
    loop {
        let without_mirror = strip_mirror_suffix(&current);
        let next = trailing_number_re().replace(&without_mirror, "").trim().to_string();
        if next == current {
            return current;
        }
        current = next;
    }
}

/// "MarsMarket" -> "Mars Market", "HTMLParser" -> "HTML Parser".
fn split_pascal_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 8);

    for (i, &c) in chars.iter().enumerate() {
        if i > 0 && c.is_uppercase() {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || (prev.is_uppercase() && next_is_lower) {
                out.push(' ');
            }
        }
        out.push(c);
    }

    out
}

fn title_case_token(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut segment = String::new();

    for c in token.chars() {
        if c == '-' || c == '_' {
            out.push_str(&title_case_word(&segment));
            out.push(c);
            segment.clear();
        } else {
            segment.push(c);
        }
    }
    out.push_str(&title_case_word(&segment));
    out
}

fn title_case_word(word: &str) -> String {
    let len = word.chars().count();
    if (2..=4).contains(&len) && word.chars().all(|c| c.is_ascii_uppercase()) {
        return word.to_string();
    }

    let mut chars = word.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };

    // "ß" would become "SS", which a second pass splits as PascalCase.
    let mut upper = first.to_uppercase();
    let head = match (upper.next(), upper.next()) {
        (Some(single), None) => single,
        _ => first,
    };
    std::iter::once(head)
        .chain(chars.flat_map(char::to_lowercase))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_names() {
        assert_eq!(normalize_to_canonical("MarsMarket"), "Mars Market");
        assert_eq!(normalize_to_canonical("Pitch 1"), "Pitch");
        assert_eq!(normalize_to_canonical("DarkMatter (mirror 2)"), "Dark Matter");
        assert_eq!(normalize_to_canonical("dark   matter (Mirror)"), "Dark Matter");
        assert_eq!(normalize_to_canonical("HTMLParser"), "HTML Parser");
        assert_eq!(normalize_to_canonical("the BBC news"), "The BBC News");
        assert_eq!(normalize_to_canonical("ABCDEF"), "Abcdef");
        assert_eq!(normalize_to_canonical("tor-project_site"), "Tor-Project_Site");
        assert_eq!(normalize_to_canonical("   "), "");
        assert_eq!(normalize_to_canonical("ßx"), "ßx");
    }

    #[test]
    fn test_canonical_is_idempotent() {
        let samples = [
            "MarsMarket",
            "Pitch 1",
            "Pitch 1 2",
            "DarkMatter (mirror 2)",
            "HTMLParser",
            "aBC",
            "ABCd",
            "DARKmatter",
            "iPhone forum",
            "ABCDE parser 3",
            "x (Mirror) 1 (mirror 2)",
            "dark-MATTER_market",
            "Ünïcode Straße",
            "ßx",
            "ßtraße haus",
            "(http)",
            "42",
        ];

        for sample in samples {
            let once = normalize_to_canonical(sample);
            let twice = normalize_to_canonical(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", sample);
        }
    }

    #[test]
    fn test_normalized_key_collapses_variants() {
        assert_eq!(generate_normalized_key("Dark Matter"), "darkmatter");
        assert_eq!(generate_normalized_key("darkmatter"), "darkmatter");
        assert_eq!(generate_normalized_key("DarkMatter (mirror 2)"), "darkmatter");
        assert!(are_similar("Dark Matter", "DARK-matter (Mirror 7)"));
        assert!(!are_similar("Dark Matter", "Dark Market"));
    }

    #[test]
    fn test_normalize_url_for_storage() {
        assert_eq!(normalize_url_for_storage("Example.ONION"), "http://example.onion");
        assert_eq!(normalize_url_for_storage("HTTP://Example.ONION/"), "http://example.onion");
        assert_eq!(normalize_url_for_storage("http://example.onion:80/"), "http://example.onion");
        assert_eq!(normalize_url_for_storage("https://example.onion:443/a"), "https://example.onion/a");
        assert_eq!(normalize_url_for_storage("http://example.onion:8080/"), "http://example.onion:8080");
        assert_eq!(normalize_url_for_storage("http://example.onion/Path?q=1"), "http://example.onion/Path?q=1");
        assert_eq!(normalize_url_for_storage(""), "");
    }

    #[test]
    fn test_url_comparison_key() {
        assert_eq!(
            build_url_comparison_key("HTTP://Example.ONION/"),
            build_url_comparison_key("http://example.onion")
        );
        assert_eq!(build_url_comparison_key("example.onion:80"), "http://example.onion");
        assert_eq!(build_url_comparison_key("http://example.onion/#top"), "http://example.onion");
        assert_eq!(build_url_comparison_key("http://example.onion/?a=1"), "http://example.onion/?a=1");
        assert_ne!(
            build_url_comparison_key("http://example.onion"),
            build_url_comparison_key("https://example.onion")
        );
    }
}
