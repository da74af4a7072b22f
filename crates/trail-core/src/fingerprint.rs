//! Content fingerprints.
//!
//! A fingerprint is the hex SHA-256 of an object's normalized identifying
//! content. Tabs hash their normalized URL; windows hash their kind plus the
//! sorted fingerprints of the tabs they hold.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Query parameters that never change what a page is.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "dclid", "msclkid", "mc_eid", "igshid"];

#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn of(content: &str) -> Self {
        let digest = Sha256::digest(content.as_bytes());
        Self(format!("{digest:x}"))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    #[error("no identifying content")]
    Empty,
    #[error("unparseable url: {0}")]
    InvalidUrl(String),
}

/// Canonical form of a URL for identity purposes.
///
/// Drops the fragment, tracking parameters and a trailing path slash, and
/// sorts the remaining query pairs. Scheme and host casing and default ports
/// are already canonicalized by the parser.
pub fn normalize_url(raw: &str) -> Result<String, FingerprintError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(FingerprintError::Empty);
    }
    let mut url = Url::parse(trimmed).map_err(|e| FingerprintError::InvalidUrl(e.to_string()))?;
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    if !url.cannot_be_a_base() {
        let path = url.path().to_string();
        if path.len() > 1 && path.ends_with('/') {
            url.set_path(path.trim_end_matches('/'));
        }
    }

    Ok(url.to_string())
}

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

pub fn tab_fingerprint(url: &str) -> Result<Fingerprint, FingerprintError> {
    let normalized = normalize_url(url)?;
    Ok(Fingerprint::of(&normalized))
}

/// Windows have no URL of their own; their identity is what they contain.
pub fn window_fingerprint<'a>(
    kind: &str,
    tab_urls: impl IntoIterator<Item = &'a str>,
) -> Result<Fingerprint, FingerprintError> {
    let mut parts: Vec<String> = tab_urls
        .into_iter()
        .filter_map(|u| tab_fingerprint(u).ok())
        .map(|f| f.0)
        .collect();
    if parts.is_empty() {
        return Err(FingerprintError::Empty);
    }
    parts.sort();
    Ok(Fingerprint::of(&format!("window:{kind}:{}", parts.join(","))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_fragment_and_tracking() {
        let n = normalize_url("https://Example.com/a/b/?utm_source=x&b=2&a=1#frag").unwrap();
        assert_eq!(n, "https://example.com/a/b?a=1&b=2");
    }

    #[test]
    fn normalize_keeps_root_slash() {
        assert_eq!(normalize_url("https://example.com").unwrap(), "https://example.com/");
        assert_eq!(normalize_url("https://example.com/").unwrap(), "https://example.com/");
    }

    #[test]
    fn normalize_strips_default_port() {
        assert_eq!(
            normalize_url("https://example.com:443/x").unwrap(),
            "https://example.com/x"
        );
    }

    #[test]
    fn equivalent_urls_share_fingerprint() {
        let a = tab_fingerprint("https://example.com/page?gclid=abc#top").unwrap();
        let b = tab_fingerprint("https://EXAMPLE.com/page/").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn different_urls_differ() {
        let a = tab_fingerprint("https://example.com/a").unwrap();
        let b = tab_fingerprint("https://example.com/b").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_and_garbage_fail() {
        assert_eq!(tab_fingerprint("  "), Err(FingerprintError::Empty));
        assert!(matches!(
            tab_fingerprint("not a url"),
            Err(FingerprintError::InvalidUrl(_))
        ));
    }

    #[test]
    fn internal_pages_fingerprint() {
        assert!(tab_fingerprint("about:blank").is_ok());
        assert!(tab_fingerprint("chrome://newtab/").is_ok());
    }

    #[test]
    fn window_fingerprint_ignores_tab_order() {
        let a = window_fingerprint("normal", ["https://a.com/", "https://b.com/"]).unwrap();
        let b = window_fingerprint("normal", ["https://b.com/", "https://a.com/"]).unwrap();
        let c = window_fingerprint("popup", ["https://a.com/", "https://b.com/"]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn window_without_tabs_has_no_fingerprint() {
        assert_eq!(
            window_fingerprint("normal", std::iter::empty()),
            Err(FingerprintError::Empty)
        );
    }
}
