//! Error types for the payment app finder.

use serde::Serialize;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Manifest download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Manifest parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Frecency store error: {0}")]
    Store(#[from] StoreError),

    #[error("Payment request error: {0}")]
    PaymentRequest(#[from] PaymentRequestError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Manifest download failures.
///
/// The `Display` output is the message handed to
/// `on_manifest_download_failure` and must stay byte-for-byte stable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
    #[error("Unable to download payment manifest \"{url}\". HTTP {status}{}.", reason_suffix(.reason))]
    HttpStatus {
        url: String,
        status: u16,
        /// Canonical reason phrase; `None` for non-standard codes.
        reason: Option<String>,
    },

    #[error("Unable to download payment manifest \"{url}\".")]
    Network { url: String, detail: String },

    #[error("Unable to download payment manifest \"{url}\" because of the Content Security Policy.")]
    CspDenied { url: String },

    #[error("\"{url}\" is not a valid payment manifest URL with HTTPS scheme (or HTTP scheme for localhost).")]
    InsecureUrl { url: String },

    #[error("Redirect from \"{from}\" to \"{to}\" is not allowed for payment manifests.")]
    RedirectNotAllowed { from: String, to: String },

    #[error("Unable to download payment manifest \"{url}\" because of too many redirects.")]
    TooManyRedirects { url: String },

    #[error("No content found in payment manifest \"{url}\".")]
    EmptyContent { url: String },

    #[error("Payment manifest \"{url}\" is not valid UTF-8.")]
    InvalidUtf8 { url: String },

    #[error("Payment manifest \"{url}\" is larger than the {limit} byte limit.")]
    TooLarge { url: String, limit: usize },

    #[error("Cross-origin payment method manifest \"{manifest_url}\" not allowed for the payment method \"{method}\".")]
    CrossOriginManifest { manifest_url: String, method: String },

    #[error("Failed to build the manifest HTTP client: {0}")]
    Client(String),

    #[error("Payment manifest downloader used outside of its initialize/destroy window.")]
    NotInitialized,
}

impl DownloadError {
    /// The URL the failure refers to, when there is one.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { url, .. }
            | Self::Network { url, .. }
            | Self::CspDenied { url }
            | Self::InsecureUrl { url }
            | Self::TooManyRedirects { url }
            | Self::EmptyContent { url }
            | Self::InvalidUtf8 { url }
            | Self::TooLarge { url, .. } => Some(url),
            Self::RedirectNotAllowed { from, .. } => Some(from),
            Self::CrossOriginManifest { manifest_url, .. } => Some(manifest_url),
            Self::Client(_) | Self::NotInitialized => None,
        }
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|reason| format!(" {reason}"))
        .unwrap_or_default()
}

/// Manifest parse failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Manifest is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Manifest top-level value is not a JSON object")]
    NotAnObject,

    #[error("Manifest field \"{field}\" has the wrong type, expected {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("Wildcard \"*\" in \"supported_origins\" is not supported")]
    WildcardOrigins,

    #[error("\"{value}\" in \"{field}\" is not a valid HTTPS URL")]
    InvalidUrl { field: &'static str, value: String },

    #[error("\"{0}\" in \"supported_origins\" is not a valid HTTPS origin")]
    InvalidOrigin(String),

    #[error("Manifest field \"{field}\" has more than {limit} entries")]
    TooManyEntries { field: &'static str, limit: usize },

    #[error("Manifest field \"{0}\" is missing or empty")]
    MissingField(&'static str),

    #[error("\"min_version\" value \"{0}\" is not an integer")]
    InvalidMinVersion(String),

    #[error("Unsupported fingerprint type \"{0}\"")]
    UnsupportedFingerprintType(String),

    #[error("Invalid fingerprint: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Manifest of {size} bytes exceeds the {limit} byte parser limit")]
    TooLarge { size: usize, limit: usize },

    #[error("Manifest parser worker crashed")]
    WorkerCrashed,

    #[error("Manifest parser used outside of its create/destroy window")]
    NotCreated,

    #[error("Manifest parser is already committed to another browsing context")]
    ContextMismatch,
}

/// Certificate fingerprint codec failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    #[error("\"{0}\" is not a two-digit hex byte")]
    InvalidByte(String),

    #[error("expected 32 bytes, found {0}")]
    WrongLength(usize),
}

/// Installed-app inventory loading failures.
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("Inventory is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Signature \"{value}\" of package {package} is not hex")]
    InvalidSignature { package: String, value: String },
}

/// Frecency store persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read frecency store {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to write frecency store {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("Frecency store {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Merchant-visible payment request failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentRequestError {
    /// Surfaced to the merchant as `NotSupportedError`.
    #[error("{0}")]
    NotSupported(String),

    #[error("Payment request has not been shown")]
    NotShown,

    #[error("Payment request session is closed")]
    Closed,

    #[error("No payment app is selected")]
    NoSelection,

    #[error("Unknown payment app: {0}")]
    UnknownApp(String),
}

/// Why a factory could not produce a payment app.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppCreationFailureReason {
    ManifestDownloadFailed,
    ManifestParseFailed,
    Unknown,
}

pub type Result<T> = std::result::Result<T, Error>;
