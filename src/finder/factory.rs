use std::sync::Arc;

use async_trait::async_trait;

use crate::app::{PaymentAppFactory, PaymentAppFactoryDelegate, PaymentRequestParams};
use crate::config::{DownloaderConfig, FinderConfig};
use crate::error::AppCreationFailureReason;
use crate::finder::{AndroidPaymentAppFinder, ReadyToPayProbe};
use crate::manifest::{PaymentManifestDownloader, PaymentManifestParser, UrlRewrite};
use crate::package::PackageManagerDelegate;

/// Creates Android payment apps for each request.
///
/// Every request gets its own downloader and parser, bound to the request's
/// browsing context and released when discovery finishes.
pub struct AndroidPaymentAppFactory {
    package_manager: Arc<dyn PackageManagerDelegate>,
    downloader_config: DownloaderConfig,
    finder_config: FinderConfig,
    url_rewrite: Option<UrlRewrite>,
    ready_to_pay_probe: Option<Arc<dyn ReadyToPayProbe>>,
}

impl AndroidPaymentAppFactory {
    pub fn new(
        package_manager: Arc<dyn PackageManagerDelegate>,
        downloader_config: DownloaderConfig,
        finder_config: FinderConfig,
    ) -> Self {
        Self {
            package_manager,
            downloader_config,
            finder_config,
            url_rewrite: None,
            ready_to_pay_probe: None,
        }
    }

    /// Route manifest requests through `rewrite`; see
    /// [`PaymentManifestDownloader::set_url_rewrite`].
    pub fn with_url_rewrite(mut self, rewrite: UrlRewrite) -> Self {
        self.url_rewrite = Some(rewrite);
        self
    }

    pub fn with_ready_to_pay_probe(mut self, probe: Arc<dyn ReadyToPayProbe>) -> Self {
        self.ready_to_pay_probe = Some(probe);
        self
    }
}

#[async_trait]
impl PaymentAppFactory for AndroidPaymentAppFactory {
    fn name(&self) -> &str {
        "android"
    }

    async fn create(&self, params: &PaymentRequestParams, delegate: &dyn PaymentAppFactoryDelegate) {
        let downloader = match PaymentManifestDownloader::new(self.downloader_config.clone()) {
            Ok(downloader) => downloader,
            Err(e) => {
                delegate.on_payment_app_creation_error(e.to_string(), AppCreationFailureReason::Unknown);
                delegate.on_done_creating_payment_apps();
                return;
            }
        };
        if let Some(rewrite) = &self.url_rewrite {
            downloader.set_url_rewrite(Arc::clone(rewrite));
        }
        downloader.initialize(params.context.clone(), delegate.csp_checker());

        let parser = PaymentManifestParser::new(
            self.downloader_config.max_manifest_bytes,
            self.downloader_config.allow_loopback_http,
        );
        if let Err(e) = parser.create_native(&params.context) {
            downloader.destroy();
            delegate.on_payment_app_creation_error(e.to_string(), AppCreationFailureReason::Unknown);
            delegate.on_done_creating_payment_apps();
            return;
        }

        let mut finder = AndroidPaymentAppFinder::new(
            Arc::clone(&self.package_manager),
            downloader.clone(),
            parser.clone(),
            self.finder_config.clone(),
        );
        if let Some(probe) = &self.ready_to_pay_probe {
            finder = finder.with_ready_to_pay_probe(Arc::clone(probe));
        }
        finder.find_android_payment_apps(params, delegate).await;

        parser.destroy_native();
        downloader.destroy();
    }
}
