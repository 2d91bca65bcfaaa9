//! URL and origin rules shared by the fetcher, parser, and finder.

use url::{Host, Origin, Url};

/// Whether `host` names the local machine.
pub fn is_loopback_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => domain.eq_ignore_ascii_case("localhost"),
        Host::Ipv4(addr) => addr.is_loopback(),
        Host::Ipv6(addr) => addr.is_loopback(),
    }
}

/// Whether `url` may be used to fetch a payment manifest.
///
/// HTTPS is always accepted. Plain HTTP is only accepted for loopback hosts
/// and only when `allow_loopback_http` is set. Userinfo is never accepted.
pub fn is_valid_manifest_url(url: &Url, allow_loopback_http: bool) -> bool {
    if !url.username().is_empty() || url.password().is_some() {
        return false;
    }
    let Some(host) = url.host() else {
        return false;
    };
    match url.scheme() {
        "https" => true,
        "http" => allow_loopback_http && is_loopback_host(&host),
        _ => false,
    }
}

/// Parse `input` as an absolute manifest URL.
pub fn parse_manifest_url(input: &str, allow_loopback_http: bool) -> Option<Url> {
    let url = Url::parse(input.trim()).ok()?;
    is_valid_manifest_url(&url, allow_loopback_http).then_some(url)
}

/// Whether `url` is a bare origin acceptable in `supported_origins`.
pub fn is_valid_supported_origin(url: &Url, allow_loopback_http: bool) -> bool {
    is_valid_manifest_url(url, allow_loopback_http)
        && url.path() == "/"
        && url.query().is_none()
        && url.fragment().is_none()
}

/// Serialized form of an origin, e.g. `https://bobpay.test`.
pub fn serialize_origin(origin: &Origin) -> String {
    origin.ascii_serialization()
}

/// Origin of a URL payment method identifier, as compared against
/// `supported_origins`.
pub fn method_origin(method: &Url) -> Origin {
    method.origin()
}

/// An origin with no page context, unequal to every other origin.
pub fn create_opaque_origin_for_test() -> Origin {
    Origin::new_opaque()
}
