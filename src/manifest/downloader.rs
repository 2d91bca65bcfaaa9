//! Payment manifest downloads over HTTPS.
//!
//! Every connection, including each redirect hop, is cleared with the
//! context's [`CspChecker`] first. Redirects are followed by hand so each
//! hop can be checked.
//!
//! Each call is independent: the downloader holds no per-request state,
//! so concurrent downloads cannot observe each other.

use std::sync::{Arc, PoisonError, RwLock};

use reqwest::header::{LINK, LOCATION, USER_AGENT};
use url::{Origin, Url};

use crate::config::DownloaderConfig;
use crate::error::DownloadError;
use crate::manifest::BrowsingContext;
use crate::manifest::csp::CspChecker;
use crate::manifest::origin::{create_opaque_origin_for_test, is_valid_manifest_url, serialize_origin};

const PAYMENT_METHOD_MANIFEST_REL: &str = "payment-method-manifest";

/// Result of a successful payment-method manifest download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodManifestDownload {
    /// URL of the document that was used as the manifest.
    pub manifest_url: Url,
    pub manifest_origin: Origin,
    pub content: String,
}

/// Receives the outcome of a callback-style download. Exactly one method
/// is called per download.
pub trait ManifestDownloadCallback: Send + Sync {
    fn on_payment_method_manifest_download_success(
        &self,
        manifest_url: Url,
        manifest_origin: Origin,
        content: String,
    );

    fn on_web_app_manifest_download_success(&self, content: String);

    fn on_manifest_download_failure(&self, message: String);
}

/// Maps a logical manifest URL to the URL actually requested.
pub type UrlRewrite = Arc<dyn Fn(&Url) -> Url + Send + Sync>;

#[derive(Clone)]
struct ActiveContext {
    context: BrowsingContext,
    csp_checker: Arc<dyn CspChecker>,
}

struct DownloaderInner {
    client: reqwest::Client,
    config: DownloaderConfig,
    active: RwLock<Option<ActiveContext>>,
    url_rewrite: RwLock<Option<UrlRewrite>>,
}

/// Downloads payment-method and web-app manifests.
///
/// Valid between [`initialize`](Self::initialize) and
/// [`destroy`](Self::destroy). Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PaymentManifestDownloader {
    inner: Arc<DownloaderInner>,
}

impl std::fmt::Debug for PaymentManifestDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentManifestDownloader")
            .field("config", &self.inner.config)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl PaymentManifestDownloader {
    pub fn new(config: DownloaderConfig) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DownloadError::Client(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(DownloaderInner {
                client,
                config,
                active: RwLock::new(None),
                url_rewrite: RwLock::new(None),
            }),
        })
    }

    /// An origin for callers that have no page context.
    pub fn create_opaque_origin_for_test() -> Origin {
        create_opaque_origin_for_test()
    }

    /// Route requests through `rewrite` before they hit the network.
    ///
    /// Reported URLs, CSP checks, and origin rules keep using the logical
    /// URL. Used to serve `https://<host>/...` fixtures from a local server.
    pub fn set_url_rewrite(&self, rewrite: UrlRewrite) {
        *self
            .inner
            .url_rewrite
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(rewrite);
    }

    pub fn initialize(&self, context: BrowsingContext, csp_checker: Arc<dyn CspChecker>) {
        tracing::debug!(context = %context.id, "Manifest downloader initialized");
        *self.inner.active.write().unwrap_or_else(PoisonError::into_inner) = Some(ActiveContext {
            context,
            csp_checker,
        });
    }

    pub fn destroy(&self) {
        *self.inner.active.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.inner
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.inner.config
    }

    fn active(&self) -> Result<ActiveContext, DownloadError> {
        self.inner
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                tracing::warn!("Manifest downloader used outside of initialize/destroy");
                DownloadError::NotInitialized
            })
    }

    fn network_url(&self, url: &Url) -> Url {
        match &*self
            .inner
            .url_rewrite
            .read()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Some(rewrite) => rewrite(url),
            None => url.clone(),
        }
    }

    /// Download the payment-method manifest for `method_url`.
    ///
    /// A `Link: <...>; rel="payment-method-manifest"` header on the method
    /// URL response points at the manifest; without one the response body
    /// is the manifest.
    pub async fn fetch_payment_method_manifest(
        &self,
        merchant_origin: &Origin,
        method_url: &Url,
    ) -> Result<MethodManifestDownload, DownloadError> {
        let active = self.active()?;
        tracing::debug!(
            merchant = %serialize_origin(merchant_origin),
            url = %method_url,
            "Downloading payment method manifest"
        );

        let (final_url, response) = self.get(&active, method_url, true).await?;
        let link = response
            .headers()
            .get_all(LINK)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(payment_method_manifest_link)
            .map(str::to_string);

        let (manifest_url, response) = match link {
            Some(link) => {
                let manifest_url = final_url
                    .join(&link)
                    .ok()
                    .filter(|url| is_valid_manifest_url(url, self.inner.config.allow_loopback_http))
                    .ok_or_else(|| DownloadError::InsecureUrl { url: link.clone() })?;
                if manifest_url.origin() != final_url.origin() {
                    return Err(DownloadError::CrossOriginManifest {
                        manifest_url: manifest_url.to_string(),
                        method: method_url.to_string(),
                    });
                }
                self.get(&active, &manifest_url, true).await?
            }
            None => (final_url, response),
        };

        let content = self.read_body(&manifest_url, response).await?;
        Ok(MethodManifestDownload {
            manifest_origin: manifest_url.origin(),
            manifest_url,
            content,
        })
    }

    /// Download the web-app manifest at `url`.
    pub async fn fetch_web_app_manifest(
        &self,
        payment_method_manifest_origin: &Origin,
        url: &Url,
    ) -> Result<String, DownloadError> {
        let active = self.active()?;
        tracing::debug!(
            method_origin = %serialize_origin(payment_method_manifest_origin),
            url = %url,
            "Downloading web app manifest"
        );
        let (final_url, response) = self.get(&active, url, false).await?;
        self.read_body(&final_url, response).await
    }

    /// Callback form of [`fetch_payment_method_manifest`](Self::fetch_payment_method_manifest).
    pub fn download_payment_method_manifest(
        &self,
        merchant_origin: Origin,
        url: Url,
        callback: Arc<dyn ManifestDownloadCallback>,
    ) {
        let downloader = self.clone();
        tokio::spawn(async move {
            match downloader
                .fetch_payment_method_manifest(&merchant_origin, &url)
                .await
            {
                Ok(download) => callback.on_payment_method_manifest_download_success(
                    download.manifest_url,
                    download.manifest_origin,
                    download.content,
                ),
                Err(e) => {
                    tracing::warn!("{}", e);
                    callback.on_manifest_download_failure(e.to_string());
                }
            }
        });
    }

    /// Callback form of [`fetch_web_app_manifest`](Self::fetch_web_app_manifest).
    pub fn download_web_app_manifest(
        &self,
        payment_method_manifest_origin: Origin,
        url: Url,
        callback: Arc<dyn ManifestDownloadCallback>,
    ) {
        let downloader = self.clone();
        tokio::spawn(async move {
            match downloader
                .fetch_web_app_manifest(&payment_method_manifest_origin, &url)
                .await
            {
                Ok(content) => callback.on_web_app_manifest_download_success(content),
                Err(e) => {
                    tracing::warn!("{}", e);
                    callback.on_manifest_download_failure(e.to_string());
                }
            }
        });
    }

    /// GET `original`, following redirects by hand.
    ///
    /// Returns the logical final URL and a successful response.
    async fn get(
        &self,
        active: &ActiveContext,
        original: &Url,
        same_origin_redirects: bool,
    ) -> Result<(Url, reqwest::Response), DownloadError> {
        let config = &self.inner.config;
        let mut current = original.clone();
        let mut redirects = 0usize;

        loop {
            if !is_valid_manifest_url(&current, config.allow_loopback_http) {
                return Err(DownloadError::InsecureUrl {
                    url: current.to_string(),
                });
            }
            if !active
                .csp_checker
                .allow_connect_to_source(&current, original, redirects > 0)
                .await
            {
                return Err(DownloadError::CspDenied {
                    url: current.to_string(),
                });
            }

            let response = self
                .inner
                .client
                .get(self.network_url(&current))
                .header(USER_AGENT, &config.user_agent)
                .send()
                .await
                .map_err(|e| DownloadError::Network {
                    url: current.to_string(),
                    detail: e.to_string(),
                })?;
            let status = response.status();

            if status.is_redirection() {
                redirects += 1;
                if redirects > config.max_redirects {
                    return Err(DownloadError::TooManyRedirects {
                        url: original.to_string(),
                    });
                }
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let next = current
                    .join(&location)
                    .ok()
                    .filter(|next| !same_origin_redirects || next.origin() == current.origin())
                    .ok_or_else(|| DownloadError::RedirectNotAllowed {
                        from: current.to_string(),
                        to: location.clone(),
                    })?;
                tracing::debug!(from = %current, to = %next, "Following manifest redirect");
                current = next;
                continue;
            }

            if !status.is_success() {
                return Err(DownloadError::HttpStatus {
                    url: current.to_string(),
                    status: status.as_u16(),
                    reason: status.canonical_reason().map(str::to_string),
                });
            }

            tracing::trace!(context = %active.context.id, url = %current, "Manifest response");
            return Ok((current, response));
        }
    }

    async fn read_body(
        &self,
        url: &Url,
        mut response: reqwest::Response,
    ) -> Result<String, DownloadError> {
        let limit = self.inner.config.max_manifest_bytes;
        let too_large = || DownloadError::TooLarge {
            url: url.to_string(),
            limit,
        };
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| DownloadError::Network {
            url: url.to_string(),
            detail: e.to_string(),
        })? {
            if body.len() + chunk.len() > limit {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        if body.is_empty() {
            return Err(DownloadError::EmptyContent {
                url: url.to_string(),
            });
        }
        String::from_utf8(body).map_err(|_| DownloadError::InvalidUtf8 {
            url: url.to_string(),
        })
    }
}

/// Extract the target of a `rel="payment-method-manifest"` entry from one
/// `Link` header value.
fn payment_method_manifest_link(header: &str) -> Option<&str> {
    header.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts
            .next()?
            .trim()
            .strip_prefix('<')?
            .strip_suffix('>')?;
        let is_manifest = parts.any(|param| {
            let Some((name, value)) = param.split_once('=') else {
                return false;
            };
            name.trim().eq_ignore_ascii_case("rel")
                && value
                    .trim()
                    .trim_matches('"')
                    .split_ascii_whitespace()
                    .any(|rel| rel.eq_ignore_ascii_case(PAYMENT_METHOD_MANIFEST_REL))
        });
        is_manifest.then_some(target)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::csp::AllowAllCspChecker;

    #[test]
    fn link_header_parsing() {
        assert_eq!(
            payment_method_manifest_link(r#"<manifest.json>; rel="payment-method-manifest""#),
            Some("manifest.json")
        );
        assert_eq!(
            payment_method_manifest_link(
                r#"<style.css>; rel=stylesheet, </pay/m.json>; rel="preload payment-method-manifest""#
            ),
            Some("/pay/m.json")
        );
        assert_eq!(
            payment_method_manifest_link("<https://x.test/m.json>; rel=payment-method-manifest"),
            Some("https://x.test/m.json")
        );
        assert_eq!(payment_method_manifest_link("<style.css>; rel=stylesheet"), None);
        assert_eq!(payment_method_manifest_link("garbage"), None);
    }

    #[tokio::test]
    async fn downloads_require_initialize() {
        let downloader =
            PaymentManifestDownloader::new(DownloaderConfig::default()).expect("client builds");
        let url = Url::parse("https://bobpay.test/webpay").expect("valid URL");
        let origin = PaymentManifestDownloader::create_opaque_origin_for_test();

        assert_eq!(
            downloader.fetch_web_app_manifest(&origin, &url).await,
            Err(DownloadError::NotInitialized)
        );

        downloader.initialize(BrowsingContext::for_test(), Arc::new(AllowAllCspChecker));
        assert!(downloader.is_initialized());
        downloader.destroy();
        assert_eq!(
            downloader
                .fetch_payment_method_manifest(&origin, &url)
                .await,
            Err(DownloadError::NotInitialized)
        );
    }

    #[tokio::test]
    async fn insecure_urls_are_refused_before_connecting() {
        let config = DownloaderConfig {
            allow_loopback_http: false,
            ..DownloaderConfig::default()
        };
        let downloader = PaymentManifestDownloader::new(config).expect("client builds");
        downloader.initialize(BrowsingContext::for_test(), Arc::new(AllowAllCspChecker));
        let url = Url::parse("http://127.0.0.1:9/manifest.json").expect("valid URL");

        let err = downloader
            .fetch_web_app_manifest(&create_opaque_origin_for_test(), &url)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DownloadError::InsecureUrl {
                url: "http://127.0.0.1:9/manifest.json".to_string()
            }
        );
    }
}
