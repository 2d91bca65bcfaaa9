//! Manifest chain resolution and signature verification.

use std::collections::BTreeSet;

use futures::future::join_all;
use url::{Origin, Url};

use crate::error::AppCreationFailureReason;
use crate::manifest::fingerprint::{Fingerprint, fingerprint_of};
use crate::manifest::{
    PaymentManifestDownloader, PaymentManifestParser, PaymentMethodManifest, WebAppManifestSection,
};
use crate::package::PackageInfo;

/// A failure worth reporting to the factory delegate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChainFailure {
    pub message: String,
    pub reason: AppCreationFailureReason,
}

/// Everything learned from one payment method's manifests.
#[derive(Debug, Clone, Default)]
pub(crate) struct ManifestChain {
    /// `None` when the payment-method manifest could not be fetched or parsed.
    pub manifest: Option<PaymentMethodManifest>,
    /// Sections from every web-app manifest that resolved.
    pub sections: Vec<WebAppManifestSection>,
}

impl ManifestChain {
    pub fn supports_origin(&self, origin: &Origin) -> bool {
        self.manifest
            .as_ref()
            .is_some_and(|m| m.supported_origins.iter().any(|o| o == origin))
    }
}

/// Fetch and parse `method`'s payment-method manifest and all of its
/// web-app manifests.
///
/// Web-app manifests are fetched concurrently. One failing web-app manifest
/// only drops its own sections.
pub(crate) async fn resolve_chain(
    downloader: &PaymentManifestDownloader,
    parser: &PaymentManifestParser,
    merchant_origin: &Origin,
    method: &Url,
) -> (ManifestChain, Vec<ChainFailure>) {
    let mut failures = Vec::new();

    let download = match downloader
        .fetch_payment_method_manifest(merchant_origin, method)
        .await
    {
        Ok(download) => download,
        Err(e) => {
            failures.push(ChainFailure {
                message: e.to_string(),
                reason: AppCreationFailureReason::ManifestDownloadFailed,
            });
            return (ManifestChain::default(), failures);
        }
    };

    let manifest = match parser
        .parse_payment_method_manifest(&download.manifest_url, download.content)
        .await
    {
        Ok(manifest) => manifest,
        Err(e) => {
            tracing::debug!(method = %method, error = %e, "Payment method manifest rejected");
            failures.push(ChainFailure {
                message: format!(
                    "Unable to parse payment method manifest \"{}\".",
                    download.manifest_url
                ),
                reason: AppCreationFailureReason::ManifestParseFailed,
            });
            return (ManifestChain::default(), failures);
        }
    };

    let manifest_origin = &download.manifest_origin;
    let results = join_all(manifest.web_app_manifest_urls.iter().map(|url| async move {
        let content = downloader
            .fetch_web_app_manifest(manifest_origin, url)
            .await
            .map_err(|e| ChainFailure {
                message: e.to_string(),
                reason: AppCreationFailureReason::ManifestDownloadFailed,
            })?;
        parser
            .parse_web_app_manifest(content)
            .await
            .map_err(|_| ChainFailure {
                message: format!("Unable to parse web app manifest \"{url}\"."),
                reason: AppCreationFailureReason::ManifestParseFailed,
            })
    }))
    .await;

    let mut sections = Vec::new();
    for result in results {
        match result {
            Ok(parsed) => sections.extend(parsed),
            Err(failure) => failures.push(failure),
        }
    }

    tracing::debug!(
        method = %method,
        sections = sections.len(),
        supported_origins = manifest.supported_origins.len(),
        "Manifest chain resolved"
    );
    (
        ManifestChain {
            manifest: Some(manifest),
            sections,
        },
        failures,
    )
}

/// SHA-256 fingerprints of every signing certificate.
pub(crate) fn app_fingerprints(signatures: &[Vec<u8>]) -> BTreeSet<Fingerprint> {
    signatures.iter().map(|cert| fingerprint_of(cert)).collect()
}

/// Whether `package` matches a section: same id, new enough, and exactly
/// the same certificate set.
pub(crate) fn verifies(sections: &[WebAppManifestSection], package: &PackageInfo) -> bool {
    if package.signatures.is_empty() {
        tracing::debug!(package = %package.package_name, "Package has no signatures");
        return false;
    }
    let fingerprints = app_fingerprints(&package.signatures);
    sections.iter().any(|section| {
        if section.id != package.package_name {
            return false;
        }
        if package.version_code < section.min_version {
            tracing::debug!(
                package = %package.package_name,
                version = package.version_code,
                min_version = section.min_version,
                "Package version is too old"
            );
            return false;
        }
        let expected: BTreeSet<Fingerprint> = section.fingerprints.iter().copied().collect();
        let matches = expected == fingerprints;
        if !matches {
            tracing::debug!(package = %package.package_name, "Signature fingerprints do not match");
        }
        matches
    })
}
