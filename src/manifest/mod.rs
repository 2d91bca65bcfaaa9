//! Payment manifest pipeline: fetch, parse, and fingerprint checks.
//!
//! ```text
//! method URL ──► downloader ──► payment-method manifest ──► parser
//!                                                            │
//!            ┌───────────── default_applications ◄───────────┘
//!            ▼
//!      downloader ──► web-app manifest ──► parser ──► sections ──► fingerprint match
//! ```

pub mod csp;
pub mod downloader;
pub mod fingerprint;
pub mod origin;
pub mod parser;

use url::Origin;
use uuid::Uuid;

pub use self::csp::{AllowAllCspChecker, ConnectSrcPolicy, CspChecker};
pub use self::downloader::{
    ManifestDownloadCallback, MethodManifestDownload, PaymentManifestDownloader, UrlRewrite,
};
pub use self::parser::{
    ManifestParseCallback, PaymentManifestParser, PaymentMethodManifest, WebAppManifestSection,
};

/// The page a payment request runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowsingContext {
    pub id: Uuid,
    pub top_level_origin: Origin,
    pub off_the_record: bool,
}

impl BrowsingContext {
    pub fn new(top_level_origin: Origin) -> Self {
        Self {
            id: Uuid::new_v4(),
            top_level_origin,
            off_the_record: false,
        }
    }

    /// A context with an opaque origin, for callers without a real page.
    pub fn for_test() -> Self {
        Self::new(origin::create_opaque_origin_for_test())
    }
}
