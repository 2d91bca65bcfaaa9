//! Content-Security-Policy `connect-src` checks run before every manifest
//! fetch and every redirect hop.
//!
//! ```text
//! fetch(url) ──► CspChecker::allow_connect_to_source ──► Allow ──► GET
//!                          │                                       │
//!                          └─► Deny ──► DownloadError::CspDenied   └─► 3xx ──► check again
//!                                                                             (did_follow_redirect)
//! ```

use async_trait::async_trait;
use url::{Origin, Url};

/// Decides whether a manifest fetch may connect to `url`.
#[async_trait]
pub trait CspChecker: Send + Sync {
    async fn allow_connect_to_source(
        &self,
        url: &Url,
        url_before_redirects: &Url,
        did_follow_redirect: bool,
    ) -> bool;
}

/// Permits every connection. Used when the embedding page has no policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllCspChecker;

#[async_trait]
impl CspChecker for AllowAllCspChecker {
    async fn allow_connect_to_source(&self, _: &Url, _: &Url, _: bool) -> bool {
        true
    }
}

/// One source expression of a `connect-src` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SourceExpression {
    SelfOrigin,
    Any,
    Scheme(String),
    Host {
        scheme: Option<String>,
        host: String,
        port: Option<PortPattern>,
        path: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortPattern {
    Any,
    Exact(u16),
}

/// A parsed `connect-src` directive evaluated against a page origin.
#[derive(Debug, Clone)]
pub struct ConnectSrcPolicy {
    self_origin: Origin,
    sources: Vec<SourceExpression>,
}

impl ConnectSrcPolicy {
    /// Parse a policy string such as
    /// `default-src 'none'; connect-src 'self' https://*.bobpay.test`.
    ///
    /// `connect-src` wins over `default-src`. A policy with neither allows
    /// everything. Unrecognised source expressions are dropped.
    pub fn parse(policy: &str, self_origin: Origin) -> Self {
        let mut connect_src = None;
        let mut default_src = None;
        for directive in policy.split(';') {
            let mut tokens = directive.split_ascii_whitespace();
            let Some(name) = tokens.next() else {
                continue;
            };
            let values: Vec<&str> = tokens.collect();
            match name.to_ascii_lowercase().as_str() {
                "connect-src" if connect_src.is_none() => connect_src = Some(values),
                "default-src" if default_src.is_none() => default_src = Some(values),
                _ => {}
            }
        }

        let sources = match connect_src.or(default_src) {
            None => vec![SourceExpression::Any],
            Some(values) => values
                .into_iter()
                .filter_map(parse_source_expression)
                .collect(),
        };

        Self {
            self_origin,
            sources,
        }
    }

    /// Whether the policy allows connecting to `url`.
    ///
    /// Path restrictions are ignored once a redirect has been followed.
    pub fn allows(&self, url: &Url, did_follow_redirect: bool) -> bool {
        self.sources
            .iter()
            .any(|source| self.source_matches(source, url, did_follow_redirect))
    }

    fn source_matches(&self, source: &SourceExpression, url: &Url, redirected: bool) -> bool {
        match source {
            SourceExpression::Any => matches!(url.scheme(), "http" | "https" | "ws" | "wss"),
            SourceExpression::SelfOrigin => url.origin() == self.self_origin,
            SourceExpression::Scheme(scheme) => scheme_matches(scheme, url.scheme()),
            SourceExpression::Host {
                scheme,
                host,
                port,
                path,
            } => {
                let scheme_ok = match scheme {
                    Some(scheme) => scheme_matches(scheme, url.scheme()),
                    None => match &self.self_origin {
                        Origin::Tuple(self_scheme, _, _) => scheme_matches(self_scheme, url.scheme()),
                        Origin::Opaque(_) => matches!(url.scheme(), "http" | "https"),
                    },
                };
                let Some(url_host) = url.host_str() else {
                    return false;
                };
                let port_ok = match port {
                    Some(PortPattern::Any) => true,
                    Some(PortPattern::Exact(expected)) => url.port_or_known_default() == Some(*expected),
                    None => url.port().is_none(),
                };
                let path_ok = redirected
                    || match path {
                        None => true,
                        Some(prefix) if prefix.ends_with('/') => url.path().starts_with(prefix),
                        Some(exact) => url.path() == exact,
                    };
                scheme_ok && host_matches(url_host, host) && port_ok && path_ok
            }
        }
    }
}

#[async_trait]
impl CspChecker for ConnectSrcPolicy {
    async fn allow_connect_to_source(
        &self,
        url: &Url,
        _url_before_redirects: &Url,
        did_follow_redirect: bool,
    ) -> bool {
        let allowed = self.allows(url, did_follow_redirect);
        if !allowed {
            tracing::debug!(url = %url, "connect-src blocks manifest fetch");
        }
        allowed
    }
}

/// `http:` sources also match `https:` URLs.
fn scheme_matches(source_scheme: &str, url_scheme: &str) -> bool {
    let source_scheme = source_scheme.to_ascii_lowercase();
    source_scheme == url_scheme || (source_scheme == "http" && url_scheme == "https")
}

/// Exact host match, or `*.suffix` matching any strict subdomain.
fn host_matches(host: &str, pattern: &str) -> bool {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    if host.is_empty() || pattern.is_empty() {
        return false;
    }
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        if suffix.is_empty() || host == suffix {
            return false;
        }
        host.ends_with(&format!(".{suffix}"))
    } else {
        host == pattern
    }
}

fn parse_source_expression(token: &str) -> Option<SourceExpression> {
    let lowered = token.to_ascii_lowercase();
    match lowered.as_str() {
        "'none'" => return None,
        "'self'" => return Some(SourceExpression::SelfOrigin),
        "*" => return Some(SourceExpression::Any),
        _ if lowered.starts_with('\'') => return None,
        _ => {}
    }

    if let Some(scheme) = lowered.strip_suffix(':')
        && !scheme.is_empty()
        && scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c))
    {
        return Some(SourceExpression::Scheme(scheme.to_string()));
    }

    let (scheme, rest) = match token.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
        None => (None, token),
    };
    let (authority, path) = match rest.find('/') {
        Some(index) => (&rest[..index], Some(rest[index..].to_string())),
        None => (rest, None),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, "*")) => (host, Some(PortPattern::Any)),
        Some((host, port)) => (host, Some(PortPattern::Exact(port.parse().ok()?))),
        None => (authority, None),
    };
    if host.is_empty() {
        return None;
    }
    Some(SourceExpression::Host {
        scheme,
        host: host.to_string(),
        port,
        path,
    })
}
