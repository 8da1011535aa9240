use std::{fmt, ops::Range, str::FromStr};

use super::error::{Result, RewriteError};

/// A lowercase host name, e.g. `www.some-domain.com`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Domain(String);

impl Domain {
    pub fn parse(host: &str) -> Result<Self> {
        let host = host.trim().to_ascii_lowercase();

        let well_formed = !host.is_empty()
            && !host.starts_with(['.', '-'])
            && !host.ends_with(['.', '-'])
            && !host.contains("..")
            && host
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-');

        if !well_formed {
            return Err(RewriteError::InvalidDomain(host));
        }

        Ok(Domain(host))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Full, case-insensitive comparison against a host taken from a URL.
    pub fn matches(&self, host: &[u8]) -> bool {
        host.eq_ignore_ascii_case(self.0.as_bytes())
    }
}

impl FromStr for Domain {
    type Err = RewriteError;

    fn from_str(s: &str) -> Result<Self> {
        Domain::parse(s)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Restricts which URL paths may be rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathGate<'a> {
    Any,
    Prefixes(&'a [String]),
}

impl PathGate<'_> {
    pub fn admits(&self, path: &[u8]) -> bool {
        match self {
            PathGate::Any => true,
            PathGate::Prefixes(prefixes) if prefixes.is_empty() => true,
            PathGate::Prefixes(prefixes) => prefixes
                .iter()
                .any(|prefix| path_has_prefix(path, prefix.as_bytes())),
        }
    }
}

/// `/wp-content` admits `/wp-content` and `/wp-content/...` but not `/wp-contentx`.
fn path_has_prefix(path: &[u8], prefix: &[u8]) -> bool {
    if prefix.is_empty() || !path.starts_with(prefix) {
        return false;
    }

    prefix.ends_with(b"/") || matches!(path.get(prefix.len()), None | Some(b'/'))
}

/// Byte ranges of the interesting parts of a URL-shaped string.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UrlParts {
    host: Range<usize>,
    path: Range<usize>,
}

fn is_scheme(scheme: &[u8]) -> bool {
    match scheme.split_first() {
        Some((first, rest)) => {
            first.is_ascii_alphabetic()
                && rest
                    .iter()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'))
        }
        None => false,
    }
}

fn find_any(haystack: &[u8], from: usize, needles: &[u8]) -> usize {
    haystack[from..]
        .iter()
        .position(|b| needles.contains(b))
        .map_or(haystack.len(), |i| from + i)
}

/// Splits `scheme://[user@]host[:port]/path?query#fragment` or `//host/path`.
/// Anything without an authority (relative paths, bare hosts, free text) is `None`.
fn split_url(url: &[u8]) -> Option<UrlParts> {
    let start = url.iter().position(|b| !b.is_ascii_whitespace())?;
    let end = url.iter().rposition(|b| !b.is_ascii_whitespace())? + 1;
    let trimmed = &url[start..end];

    if trimmed.iter().any(u8::is_ascii_whitespace) {
        return None;
    }

    let authority_start = if trimmed.starts_with(b"//") {
        2
    } else {
        let sep = trimmed.windows(3).position(|w| w == b"://")?;
        if !is_scheme(&trimmed[..sep]) {
            return None;
        }
        sep + 3
    };

    let authority_end = find_any(trimmed, authority_start, b"/?#");
    let authority = &trimmed[authority_start..authority_end];

    let host_start = authority
        .iter()
        .rposition(|&b| b == b'@')
        .map_or(authority_start, |at| authority_start + at + 1);
    let host_end = trimmed[host_start..authority_end]
        .iter()
        .position(|&b| b == b':')
        .map_or(authority_end, |colon| host_start + colon);

    if host_start == host_end {
        return None;
    }

    let path_end = find_any(trimmed, authority_end, b"?#");

    Some(UrlParts {
        host: start + host_start..start + host_end,
        path: start + authority_end..start + path_end,
    })
}

/// `scheme://host...` or `//host...`, with nothing but the URL in `value`.
pub fn is_absolute_url(value: &[u8]) -> bool {
    split_url(value).is_some()
}

/// Swaps the host of absolute asset URLs from the source to the target domain.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    source: Domain,
    target: Domain,
}

impl HostMatcher {
    pub fn new(source: Domain, target: Domain) -> Result<Self> {
        if source == target {
            return Err(RewriteError::SameDomain(source.0));
        }

        Ok(HostMatcher { source, target })
    }

    pub fn source(&self) -> &Domain {
        &self.source
    }

    pub fn target(&self) -> &Domain {
        &self.target
    }

    /// Returns the URL with only its host replaced, or `None` when the string
    /// is not an absolute URL on the source domain admitted by `gate`.
    pub fn rewrite_if_matches(&self, url: &[u8], gate: PathGate<'_>) -> Option<Vec<u8>> {
        let parts = split_url(url)?;

        if !self.source.matches(&url[parts.host.clone()]) || !gate.admits(&url[parts.path]) {
            return None;
        }

        let target = self.target.as_bytes();
        let mut rewritten = Vec::with_capacity(url.len() - parts.host.len() + target.len());
        rewritten.extend_from_slice(&url[..parts.host.start]);
        rewritten.extend_from_slice(target);
        rewritten.extend_from_slice(&url[parts.host.end..]);

        Some(rewritten)
    }

    /// Cheap pre-check: does the source domain occur anywhere in `body`?
    pub fn mentions_source(&self, body: &[u8]) -> bool {
        let needle = self.source.as_bytes();
        body.windows(needle.len())
            .any(|window| window.eq_ignore_ascii_case(needle))
    }
}
