//! Payment-method and web-app manifest parsing.
//!
//! Parsing runs on a blocking worker so hostile JSON (deep nesting, huge
//! arrays) never stalls the async runtime, and a panic inside the worker
//! becomes an ordinary parse failure.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use url::{Origin, Url};
use uuid::Uuid;

use crate::error::ParseError;
use crate::manifest::BrowsingContext;
use crate::manifest::fingerprint::{Fingerprint, parse_fingerprint};
use crate::manifest::origin::{is_valid_manifest_url, is_valid_supported_origin};

pub const MAX_DEFAULT_APPLICATIONS: usize = 100;
pub const MAX_SUPPORTED_ORIGINS: usize = 100_000;
pub const MAX_RELATED_APPLICATIONS: usize = 100;
pub const MAX_FINGERPRINTS: usize = 100;

const PLAY_PLATFORM: &str = "play";
const SHA256_CERT_TYPE: &str = "sha256_cert";

/// Parsed payment-method manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PaymentMethodManifest {
    /// `default_applications`, resolved against the manifest URL.
    pub web_app_manifest_urls: Vec<Url>,
    pub supported_origins: Vec<Origin>,
}

/// One `related_applications` entry with `platform == "play"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebAppManifestSection {
    /// Android package name.
    pub id: String,
    pub min_version: i64,
    pub fingerprints: Vec<Fingerprint>,
}

/// Receives the outcome of a callback-style parse. Exactly one method is
/// called per parse.
pub trait ManifestParseCallback: Send + Sync {
    fn on_payment_method_manifest_parse_success(
        &self,
        web_app_manifest_urls: Vec<Url>,
        supported_origins: Vec<Origin>,
    );

    fn on_web_app_manifest_parse_success(&self, sections: Vec<WebAppManifestSection>);

    fn on_manifest_parse_failure(&self);
}

/// Parse a payment-method manifest.
///
/// Both fields are optional. Every listed entry must be valid, otherwise
/// the whole manifest fails; no partial result is returned.
pub fn parse_payment_method_manifest(
    manifest_url: &Url,
    content: &str,
    allow_loopback_http: bool,
) -> Result<PaymentMethodManifest, ParseError> {
    let root = parse_object(content)?;
    let mut manifest = PaymentMethodManifest::default();

    if let Some(value) = root.get("default_applications") {
        let entries = value.as_array().ok_or(ParseError::WrongType {
            field: "default_applications",
            expected: "array of URLs",
        })?;
        if entries.len() > MAX_DEFAULT_APPLICATIONS {
            return Err(ParseError::TooManyEntries {
                field: "default_applications",
                limit: MAX_DEFAULT_APPLICATIONS,
            });
        }
        for entry in entries {
            let raw = entry.as_str().ok_or(ParseError::WrongType {
                field: "default_applications",
                expected: "string",
            })?;
            let resolved = manifest_url
                .join(raw)
                .ok()
                .filter(|url| !raw.is_empty() && is_valid_manifest_url(url, allow_loopback_http))
                .ok_or_else(|| ParseError::InvalidUrl {
                    field: "default_applications",
                    value: raw.to_string(),
                })?;
            manifest.web_app_manifest_urls.push(resolved);
        }
    }

    if let Some(value) = root.get("supported_origins") {
        if value.as_str() == Some("*") {
            return Err(ParseError::WildcardOrigins);
        }
        let entries = value.as_array().ok_or(ParseError::WrongType {
            field: "supported_origins",
            expected: "array of origins",
        })?;
        if entries.len() > MAX_SUPPORTED_ORIGINS {
            return Err(ParseError::TooManyEntries {
                field: "supported_origins",
                limit: MAX_SUPPORTED_ORIGINS,
            });
        }
        for entry in entries {
            let raw = entry.as_str().ok_or(ParseError::WrongType {
                field: "supported_origins",
                expected: "string",
            })?;
            let origin = Url::parse(raw)
                .ok()
                .filter(|url| is_valid_supported_origin(url, allow_loopback_http))
                .ok_or_else(|| ParseError::InvalidOrigin(raw.to_string()))?
                .origin();
            manifest.supported_origins.push(origin);
        }
    }

    Ok(manifest)
}

/// Parse a web-app manifest into its `play` sections.
pub fn parse_web_app_manifest(content: &str) -> Result<Vec<WebAppManifestSection>, ParseError> {
    let root = parse_object(content)?;
    let entries = root
        .get("related_applications")
        .ok_or(ParseError::MissingField("related_applications"))?
        .as_array()
        .ok_or(ParseError::WrongType {
            field: "related_applications",
            expected: "array",
        })?;
    if entries.len() > MAX_RELATED_APPLICATIONS {
        return Err(ParseError::TooManyEntries {
            field: "related_applications",
            limit: MAX_RELATED_APPLICATIONS,
        });
    }

    let mut sections = Vec::new();
    for entry in entries {
        let Some(entry) = entry.as_object() else {
            continue;
        };
        if entry.get("platform").and_then(Value::as_str) != Some(PLAY_PLATFORM) {
            continue;
        }
        sections.push(parse_play_section(entry)?);
    }
    Ok(sections)
}

fn parse_play_section(entry: &Map<String, Value>) -> Result<WebAppManifestSection, ParseError> {
    let id = entry
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or(ParseError::MissingField("id"))?;

    let min_version = entry
        .get("min_version")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or(ParseError::MissingField("min_version"))?;
    let min_version = min_version
        .parse::<i64>()
        .map_err(|_| ParseError::InvalidMinVersion(min_version.to_string()))?;

    let fingerprints = entry
        .get("fingerprints")
        .and_then(Value::as_array)
        .filter(|list| !list.is_empty())
        .ok_or(ParseError::MissingField("fingerprints"))?;
    if fingerprints.len() > MAX_FINGERPRINTS {
        return Err(ParseError::TooManyEntries {
            field: "fingerprints",
            limit: MAX_FINGERPRINTS,
        });
    }

    let mut decoded = Vec::with_capacity(fingerprints.len());
    for fingerprint in fingerprints {
        let fingerprint = fingerprint.as_object().ok_or(ParseError::WrongType {
            field: "fingerprints",
            expected: "array of objects",
        })?;
        let kind = fingerprint
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if kind != SHA256_CERT_TYPE {
            return Err(ParseError::UnsupportedFingerprintType(kind.to_string()));
        }
        let value = fingerprint
            .get("value")
            .and_then(Value::as_str)
            .ok_or(ParseError::MissingField("value"))?;
        decoded.push(parse_fingerprint(value)?);
    }

    Ok(WebAppManifestSection {
        id: id.to_string(),
        min_version,
        fingerprints: decoded,
    })
}

fn parse_object(content: &str) -> Result<Map<String, Value>, ParseError> {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ParseError::NotAnObject),
        Err(e) => Err(ParseError::InvalidJson(e.to_string())),
    }
}

#[derive(Debug)]
enum NativeState {
    Uncreated,
    Created(Uuid),
    Destroyed,
}

struct ParserInner {
    state: Mutex<NativeState>,
    max_input_bytes: usize,
    allow_loopback_http: bool,
}

/// Sandboxed manifest parser bound to a single browsing context.
///
/// Must be created with [`create_native`](Self::create_native) before use
/// and released with [`destroy_native`](Self::destroy_native).
#[derive(Clone)]
pub struct PaymentManifestParser {
    inner: Arc<ParserInner>,
}

impl PaymentManifestParser {
    pub fn new(max_input_bytes: usize, allow_loopback_http: bool) -> Self {
        Self {
            inner: Arc::new(ParserInner {
                state: Mutex::new(NativeState::Uncreated),
                max_input_bytes,
                allow_loopback_http,
            }),
        }
    }

    /// Commit this parser to `context`.
    pub fn create_native(&self, context: &BrowsingContext) -> Result<(), ParseError> {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            NativeState::Created(id) if id != context.id => {
                tracing::warn!(context = %context.id, "Manifest parser already bound to {}", id);
                Err(ParseError::ContextMismatch)
            }
            _ => {
                *state = NativeState::Created(context.id);
                Ok(())
            }
        }
    }

    pub fn destroy_native(&self) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = NativeState::Destroyed;
    }

    pub fn is_created(&self) -> bool {
        matches!(
            *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner),
            NativeState::Created(_)
        )
    }

    fn ensure_created(&self, content: &str) -> Result<(), ParseError> {
        if !self.is_created() {
            tracing::warn!("Manifest parser used outside of create_native/destroy_native");
            return Err(ParseError::NotCreated);
        }
        if content.len() > self.inner.max_input_bytes {
            return Err(ParseError::TooLarge {
                size: content.len(),
                limit: self.inner.max_input_bytes,
            });
        }
        Ok(())
    }

    /// Parse a payment-method manifest fetched from `manifest_url`.
    pub async fn parse_payment_method_manifest(
        &self,
        manifest_url: &Url,
        content: String,
    ) -> Result<PaymentMethodManifest, ParseError> {
        self.ensure_created(&content)?;
        let manifest_url = manifest_url.clone();
        let allow_loopback_http = self.inner.allow_loopback_http;
        let result = tokio::task::spawn_blocking(move || {
            parse_payment_method_manifest(&manifest_url, &content, allow_loopback_http)
        })
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("Manifest parser worker failed: {}", e);
            Err(ParseError::WorkerCrashed)
        });
        if let Err(ref e) = result {
            tracing::warn!("Payment method manifest parse failed: {}", e);
        }
        result
    }

    /// Parse a web-app manifest.
    pub async fn parse_web_app_manifest(
        &self,
        content: String,
    ) -> Result<Vec<WebAppManifestSection>, ParseError> {
        self.ensure_created(&content)?;
        let result = tokio::task::spawn_blocking(move || parse_web_app_manifest(&content))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Manifest parser worker failed: {}", e);
                Err(ParseError::WorkerCrashed)
            });
        if let Err(ref e) = result {
            tracing::warn!("Web app manifest parse failed: {}", e);
        }
        result
    }

    /// Callback form of [`parse_payment_method_manifest`](Self::parse_payment_method_manifest).
    pub fn parse_payment_method_manifest_with_callback(
        &self,
        manifest_url: Url,
        content: String,
        callback: Arc<dyn ManifestParseCallback>,
    ) {
        let parser = self.clone();
        tokio::spawn(async move {
            match parser
                .parse_payment_method_manifest(&manifest_url, content)
                .await
            {
                Ok(manifest) => callback.on_payment_method_manifest_parse_success(
                    manifest.web_app_manifest_urls,
                    manifest.supported_origins,
                ),
                Err(_) => callback.on_manifest_parse_failure(),
            }
        });
    }

    /// Callback form of [`parse_web_app_manifest`](Self::parse_web_app_manifest).
    pub fn parse_web_app_manifest_with_callback(
        &self,
        content: String,
        callback: Arc<dyn ManifestParseCallback>,
    ) {
        let parser = self.clone();
        tokio::spawn(async move {
            match parser.parse_web_app_manifest(content).await {
                Ok(sections) => callback.on_web_app_manifest_parse_success(sections),
                Err(_) => callback.on_manifest_parse_failure(),
            }
        });
    }
}
