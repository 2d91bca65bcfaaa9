//! Android payment app discovery.
//!
//! Candidates are the activities handling [`ACTION_PAY`]. A candidate may
//! handle a requested URL payment method `M` when either:
//!
//! - `M` is its default method and the app verifies against `M`'s
//!   `default_applications` chain, or
//! - `M` is one of its additional methods, the app verifies against its own
//!   default method's chain, and `M`'s manifest lists the default method's
//!   origin in `supported_origins`.
//!
//! App-store billing methods skip manifests entirely and follow the trusted
//! web activity rules in [`AndroidPaymentAppFinder::app_store_methods_for`].
//! Manifest chains for all candidates are resolved concurrently and joined
//! before any app is reported.

mod factory;
mod verifier;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use url::Url;

use crate::app::{
    InvocationHandle, PaymentApp, PaymentAppFactoryDelegate, PaymentAppType, PaymentRequestParams,
    SupportedDelegations,
};
use crate::config::FinderConfig;
use crate::manifest::origin::parse_manifest_url;
use crate::manifest::{PaymentManifestDownloader, PaymentManifestParser};
use crate::package::{
    ACTION_IS_READY_TO_PAY, ACTION_PAY, IntentQuery, META_DATA_DEFAULT_PAYMENT_METHOD_NAME,
    META_DATA_PAYMENT_METHOD_NAMES, META_DATA_SUPPORTED_DELEGATIONS, PackageManagerDelegate,
    ResolvedActivity,
};

use self::verifier::{ManifestChain, resolve_chain, verifies};

pub use self::factory::AndroidPaymentAppFactory;

/// Asks an app's IS_READY_TO_PAY service whether it can pay right now.
#[async_trait]
pub trait ReadyToPayProbe: Send + Sync {
    async fn is_ready_to_pay(
        &self,
        service: &ResolvedActivity,
        methods: &BTreeSet<String>,
        params: &PaymentRequestParams,
    ) -> bool;
}

/// What a payment activity declares about itself.
#[derive(Debug)]
struct Candidate {
    activity: ResolvedActivity,
    /// Default method, when it is a valid manifest URL and not an app-store method.
    default_url: Option<Url>,
    additional_urls: Vec<Url>,
    /// Every declared method that parses as a URL, for app-store matching.
    declared: BTreeSet<Url>,
    delegations: SupportedDelegations,
}

impl Candidate {
    fn package_name(&self) -> &str {
        &self.activity.package_name
    }
}

/// Requested methods split by how they are authorised.
#[derive(Debug, Default)]
struct RequestedMethods {
    /// Manifest-verified methods, with the name the merchant used.
    urls: Vec<(Url, String)>,
    app_store: BTreeMap<Url, String>,
}

/// Finds the installed Android apps usable for a request.
pub struct AndroidPaymentAppFinder {
    package_manager: Arc<dyn PackageManagerDelegate>,
    downloader: PaymentManifestDownloader,
    parser: PaymentManifestParser,
    config: FinderConfig,
    ready_to_pay_probe: Option<Arc<dyn ReadyToPayProbe>>,
}

impl AndroidPaymentAppFinder {
    /// `downloader` and `parser` must already be initialized for the request.
    pub fn new(
        package_manager: Arc<dyn PackageManagerDelegate>,
        downloader: PaymentManifestDownloader,
        parser: PaymentManifestParser,
        config: FinderConfig,
    ) -> Self {
        Self {
            package_manager,
            downloader,
            parser,
            config,
            ready_to_pay_probe: None,
        }
    }

    pub fn with_ready_to_pay_probe(mut self, probe: Arc<dyn ReadyToPayProbe>) -> Self {
        self.ready_to_pay_probe = Some(probe);
        self
    }

    pub fn bypass_is_ready_to_pay_service_in_test(&mut self) {
        self.config.bypass_is_ready_to_pay = true;
    }

    /// Register another app store whose installs may use `method`.
    pub fn add_app_store_for_test(&mut self, installer_package: &str, method: Url) {
        self.config
            .app_stores
            .insert(installer_package.to_string(), method);
    }

    /// Report every usable app to `delegate`, then signal done.
    pub async fn find_android_payment_apps(
        &self,
        params: &PaymentRequestParams,
        delegate: &dyn PaymentAppFactoryDelegate,
    ) {
        for app in self.find(params, delegate).await {
            if delegate.is_closed() {
                break;
            }
            delegate.on_payment_app_created(app);
        }
        delegate.on_done_creating_payment_apps();
    }

    async fn find(
        &self,
        params: &PaymentRequestParams,
        delegate: &dyn PaymentAppFactoryDelegate,
    ) -> Vec<PaymentApp> {
        let requested = self.classify_requested_methods(params);
        if requested.urls.is_empty() && requested.app_store.is_empty() {
            tracing::debug!("No Android payment method requested");
            return Vec::new();
        }

        let mut seen = BTreeSet::new();
        let candidates: Vec<Candidate> = self
            .package_manager
            .activities_responding_to_intent(&IntentQuery::new(ACTION_PAY), true)
            .into_iter()
            .filter(|activity| seen.insert(activity.package_name.clone()))
            .filter_map(|activity| self.read_candidate(activity))
            .collect();
        if candidates.is_empty() {
            tracing::debug!("No payment apps installed");
            return Vec::new();
        }

        let chains = self
            .resolve_chains(params, &requested, &candidates, delegate)
            .await;
        if delegate.is_closed() {
            return Vec::new();
        }

        let mut apps = Vec::new();
        for candidate in candidates {
            let mut enabled = self.verified_url_methods(&candidate, &requested, &chains);
            let mut preferred = false;
            if params.twa_package_name.as_deref() == Some(candidate.package_name()) {
                for (method, name) in self.app_store_methods_for(candidate.package_name(), &requested) {
                    if candidate.declared.contains(&method) {
                        enabled.insert(name);
                        preferred = true;
                    }
                }
            }
            if enabled.is_empty() {
                tracing::debug!(package = %candidate.package_name(), "No requested method authorised");
                continue;
            }

            let ready_to_pay = self.is_ready_to_pay(&candidate, &enabled, params).await;
            let Candidate {
                activity,
                delegations,
                ..
            } = candidate;
            apps.push(PaymentApp {
                identifier: activity.package_name.clone(),
                label: activity.application.label.clone(),
                icon: activity.icon.clone(),
                supported_methods: enabled,
                delegations,
                app_type: PaymentAppType::NativeApp,
                invocation: InvocationHandle::AndroidActivity {
                    package_name: activity.package_name.clone(),
                    activity_name: activity.name.clone(),
                },
                ready_to_pay,
                preferred,
                can_preselect: true,
                installation_key: activity.package_name,
            });
        }

        tracing::info!(apps = apps.len(), "Android payment app discovery finished");
        apps
    }

    fn classify_requested_methods(&self, params: &PaymentRequestParams) -> RequestedMethods {
        let app_store_methods: BTreeSet<&Url> = self.config.app_stores.values().collect();
        let allow_loopback_http = self.downloader.config().allow_loopback_http;

        let mut requested = RequestedMethods::default();
        for name in params.requested_methods() {
            let Ok(url) = Url::parse(name) else {
                tracing::debug!(method = name, "Ignoring non-URL payment method");
                continue;
            };
            if app_store_methods.contains(&url) {
                requested.app_store.insert(url, name.to_string());
            } else if let Some(url) = parse_manifest_url(name, allow_loopback_http) {
                requested.urls.push((url, name.to_string()));
            } else {
                tracing::debug!(method = name, "Ignoring invalid payment method URL");
            }
        }

        if !requested.app_store.is_empty() {
            if params.twa_package_name.is_none() {
                tracing::debug!("App store billing requires a trusted web activity");
                requested.app_store.clear();
            } else if params.options.requests_any_delegation() {
                tracing::debug!("App store billing cannot be combined with delegations");
                requested.app_store.clear();
            }
        }
        requested
    }

    fn read_candidate(&self, activity: ResolvedActivity) -> Option<Candidate> {
        let app = &activity.application;
        if app.label.is_empty() {
            tracing::debug!(package = %activity.package_name, "Skipping app without a label");
            return None;
        }
        if app.metadata.is_none() {
            tracing::debug!(package = %activity.package_name, "Skipping app without metadata");
            return None;
        }

        let resolve = |key: &str| {
            app.metadata_value(key)
                .and_then(|value| self.package_manager.resolve_string_array(app, value))
                .unwrap_or_default()
        };
        let default_method = resolve(META_DATA_DEFAULT_PAYMENT_METHOD_NAME)
            .into_iter()
            .next()
            .filter(|name| !name.is_empty());
        let additional = resolve(META_DATA_PAYMENT_METHOD_NAMES);
        let delegations = SupportedDelegations::from_names(&resolve(META_DATA_SUPPORTED_DELEGATIONS));

        let allow_loopback_http = self.downloader.config().allow_loopback_http;
        let is_app_store = |url: &Url| self.config.app_stores.values().any(|m| m == url);
        let default_url = default_method
            .as_deref()
            .and_then(|name| parse_manifest_url(name, allow_loopback_http))
            .filter(|url| !is_app_store(url));
        let additional_urls = additional
            .iter()
            .filter_map(|name| parse_manifest_url(name, allow_loopback_http))
            .filter(|url| !is_app_store(url))
            .collect();
        let declared = default_method
            .iter()
            .chain(&additional)
            .filter_map(|name| Url::parse(name).ok())
            .collect();

        Some(Candidate {
            activity,
            default_url,
            additional_urls,
            declared,
            delegations,
        })
    }

    /// Resolve every manifest chain some candidate needs, concurrently.
    async fn resolve_chains(
        &self,
        params: &PaymentRequestParams,
        requested: &RequestedMethods,
        candidates: &[Candidate],
        delegate: &dyn PaymentAppFactoryDelegate,
    ) -> BTreeMap<Url, ManifestChain> {
        let mut needed = BTreeSet::new();
        for candidate in candidates {
            for (method, _) in &requested.urls {
                if candidate.default_url.as_ref() == Some(method) {
                    needed.insert(method.clone());
                } else if candidate.additional_urls.contains(method)
                    && let Some(default_url) = &candidate.default_url
                {
                    needed.insert(method.clone());
                    needed.insert(default_url.clone());
                }
            }
        }
        if needed.is_empty() || delegate.is_closed() {
            return BTreeMap::new();
        }

        tracing::debug!(methods = needed.len(), "Resolving payment manifest chains");
        let merchant_origin = &params.payment_request_origin;
        let resolved = join_all(needed.into_iter().map(|method| async move {
            let (chain, failures) =
                resolve_chain(&self.downloader, &self.parser, merchant_origin, &method).await;
            (method, chain, failures)
        }))
        .await;

        let mut chains = BTreeMap::new();
        for (method, chain, failures) in resolved {
            for failure in failures {
                delegate.on_payment_app_creation_error(failure.message, failure.reason);
            }
            chains.insert(method, chain);
        }
        chains
    }

    /// Requested URL methods `candidate` is authorised for.
    fn verified_url_methods(
        &self,
        candidate: &Candidate,
        requested: &RequestedMethods,
        chains: &BTreeMap<Url, ManifestChain>,
    ) -> BTreeSet<String> {
        let mut enabled = BTreeSet::new();
        if requested.urls.is_empty() {
            return enabled;
        }
        let Some(package_info) = self.package_manager.package_info(candidate.package_name()) else {
            tracing::debug!(package = %candidate.package_name(), "Package info unavailable");
            return enabled;
        };
        let verified_by = |method: &Url| {
            chains
                .get(method)
                .is_some_and(|chain| chain.manifest.is_some() && verifies(&chain.sections, &package_info))
        };
        let default_verified = candidate.default_url.as_ref().is_some_and(verified_by);

        for (method, name) in &requested.urls {
            if candidate.default_url.as_ref() == Some(method) {
                if default_verified {
                    enabled.insert(name.clone());
                }
            } else if candidate.additional_urls.contains(method)
                && let Some(default_url) = &candidate.default_url
            {
                let origin_supported = chains
                    .get(method)
                    .is_some_and(|chain| chain.supports_origin(&default_url.origin()));
                if default_verified && origin_supported {
                    enabled.insert(name.clone());
                } else {
                    tracing::debug!(
                        package = %candidate.package_name(),
                        method = %method,
                        default_verified,
                        origin_supported,
                        "Additional payment method not authorised"
                    );
                }
            }
        }
        enabled
    }

    /// App-store methods the trusted web activity `package_name` may use.
    ///
    /// The installer must map to a requested method, unless app-store
    /// billing debugging is on, which allows every requested store method.
    fn app_store_methods_for(
        &self,
        package_name: &str,
        requested: &RequestedMethods,
    ) -> Vec<(Url, String)> {
        if requested.app_store.is_empty() {
            return Vec::new();
        }
        if self.config.app_store_billing_debug {
            tracing::debug!(package = package_name, "App store billing debug: any installer allowed");
            return requested
                .app_store
                .iter()
                .map(|(url, name)| (url.clone(), name.clone()))
                .collect();
        }
        let Some(installer) = self.package_manager.installer_package(package_name) else {
            tracing::debug!(package = package_name, "Installer unknown; app store billing disabled");
            return Vec::new();
        };
        let Some(method) = self.config.app_stores.get(&installer) else {
            tracing::debug!(package = package_name, installer = %installer, "Installer is not an app store");
            return Vec::new();
        };
        requested
            .app_store
            .get_key_value(method)
            .map(|(url, name)| (url.clone(), name.clone()))
            .into_iter()
            .collect()
    }

    async fn is_ready_to_pay(
        &self,
        candidate: &Candidate,
        methods: &BTreeSet<String>,
        params: &PaymentRequestParams,
    ) -> bool {
        if self.config.bypass_is_ready_to_pay {
            return true;
        }
        let query = IntentQuery::new(ACTION_IS_READY_TO_PAY).for_package(candidate.package_name());
        let services = self.package_manager.services_responding_to_intent(&query);
        let Some(service) = services.first() else {
            return true;
        };
        match &self.ready_to_pay_probe {
            Some(probe) => probe.is_ready_to_pay(service, methods, params).await,
            None => {
                tracing::debug!(package = %candidate.package_name(), "No readiness probe; assuming ready");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::app::PaymentOptions;
    use crate::config::DownloaderConfig;
    use crate::error::AppCreationFailureReason;
    use crate::manifest::{AllowAllCspChecker, BrowsingContext, CspChecker};
    use crate::package::InMemoryPackageManager;
    use crate::settings::{PLAY_BILLING_METHOD, PLAY_STORE_PACKAGE};

    #[derive(Default)]
    struct Recorder {
        apps: Mutex<Vec<PaymentApp>>,
        errors: Mutex<Vec<String>>,
        done: Mutex<u32>,
    }

    impl PaymentAppFactoryDelegate for Recorder {
        fn csp_checker(&self) -> Arc<dyn CspChecker> {
            Arc::new(AllowAllCspChecker)
        }

        fn on_payment_app_created(&self, app: PaymentApp) {
            self.apps.lock().unwrap().push(app);
        }

        fn on_payment_app_creation_error(&self, message: String, _: AppCreationFailureReason) {
            self.errors.lock().unwrap().push(message);
        }

        fn on_done_creating_payment_apps(&self) {
            *self.done.lock().unwrap() += 1;
        }
    }

    struct FixedProbe(bool);

    #[async_trait]
    impl ReadyToPayProbe for FixedProbe {
        async fn is_ready_to_pay(
            &self,
            _: &ResolvedActivity,
            _: &BTreeSet<String>,
            _: &PaymentRequestParams,
        ) -> bool {
            self.0
        }
    }

    fn finder(pm: &Arc<InMemoryPackageManager>) -> AndroidPaymentAppFinder {
        let downloader = PaymentManifestDownloader::new(DownloaderConfig::default()).unwrap();
        let parser = PaymentManifestParser::new(1024 * 1024, true);
        AndroidPaymentAppFinder::new(
            Arc::clone(pm) as Arc<dyn PackageManagerDelegate>,
            downloader,
            parser,
            FinderConfig::default(),
        )
    }

    fn twa_params(methods: &[&str], twa: &str) -> PaymentRequestParams {
        let mut params = PaymentRequestParams::new(BrowsingContext::for_test(), methods);
        params.twa_package_name = Some(twa.to_string());
        params
    }

    async fn find(finder: &AndroidPaymentAppFinder, params: &PaymentRequestParams) -> Recorder {
        let recorder = Recorder::default();
        finder.find_android_payment_apps(params, &recorder).await;
        assert_eq!(*recorder.done.lock().unwrap(), 1);
        recorder
    }

    fn ids(recorder: &Recorder) -> Vec<String> {
        recorder
            .apps
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.identifier.clone())
            .collect()
    }

    #[tokio::test]
    async fn no_apps_installed() {
        let pm = Arc::new(InMemoryPackageManager::new());
        let params = PaymentRequestParams::new(BrowsingContext::for_test(), &["https://bobpay.test"]);
        let recorder = find(&finder(&pm), &params).await;
        assert!(ids(&recorder).is_empty());
    }

    #[tokio::test]
    async fn non_url_methods_are_ignored() {
        let pm = Arc::new(InMemoryPackageManager::new());
        pm.install_payment_app("BobPay", "com.bobpay", Some("basic-card"), Some(b"01020304"));
        let params = PaymentRequestParams::new(
            BrowsingContext::for_test(),
            &["basic-card", "interledger", "/relative", "http://not.secure.test"],
        );
        let recorder = find(&finder(&pm), &params).await;
        assert!(ids(&recorder).is_empty());
        assert!(recorder.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn app_store_billing_in_twa() {
        let pm = Arc::new(InMemoryPackageManager::new());
        pm.install_payment_app("Merchant", "com.merchant.twa", Some(PLAY_BILLING_METHOD), Some(b"01"));
        pm.mock_installer_for_package("com.merchant.twa", Some(PLAY_STORE_PACKAGE));

        let params = twa_params(&[PLAY_BILLING_METHOD], "com.merchant.twa");
        let recorder = find(&finder(&pm), &params).await;
        let apps = recorder.apps.lock().unwrap();
        assert_eq!(apps.len(), 1);
        assert!(apps[0].preferred);
        assert!(apps[0].supports_method(PLAY_BILLING_METHOD));
    }

    #[tokio::test]
    async fn app_store_billing_outside_twa_is_dropped() {
        let pm = Arc::new(InMemoryPackageManager::new());
        pm.install_payment_app("Merchant", "com.merchant.twa", Some(PLAY_BILLING_METHOD), Some(b"01"));
        pm.mock_installer_for_package("com.merchant.twa", Some(PLAY_STORE_PACKAGE));

        let params = PaymentRequestParams::new(BrowsingContext::for_test(), &[PLAY_BILLING_METHOD]);
        assert!(ids(&find(&finder(&pm), &params).await).is_empty());
    }

    #[tokio::test]
    async fn app_store_billing_requires_known_installer() {
        let pm = Arc::new(InMemoryPackageManager::new());
        pm.install_payment_app("Merchant", "com.merchant.twa", Some(PLAY_BILLING_METHOD), Some(b"01"));
        let params = twa_params(&[PLAY_BILLING_METHOD], "com.merchant.twa");

        assert!(ids(&find(&finder(&pm), &params).await).is_empty());

        pm.mock_installer_for_package("com.merchant.twa", Some("com.sideloader"));
        assert!(ids(&find(&finder(&pm), &params).await).is_empty());

        let mut debug_finder = finder(&pm);
        debug_finder.config.app_store_billing_debug = true;
        assert_eq!(ids(&find(&debug_finder, &params).await), vec!["com.merchant.twa"]);
    }

    #[tokio::test]
    async fn app_store_billing_disallows_delegations() {
        let pm = Arc::new(InMemoryPackageManager::new());
        pm.install_payment_app("Merchant", "com.merchant.twa", Some(PLAY_BILLING_METHOD), Some(b"01"));
        pm.mock_installer_for_package("com.merchant.twa", Some(PLAY_STORE_PACKAGE));

        let mut params = twa_params(&[PLAY_BILLING_METHOD], "com.merchant.twa");
        params.options = PaymentOptions {
            request_shipping: true,
            ..PaymentOptions::default()
        };
        assert!(ids(&find(&finder(&pm), &params).await).is_empty());
    }

    #[tokio::test]
    async fn app_store_method_as_additional_method() {
        let pm = Arc::new(InMemoryPackageManager::new());
        pm.install_payment_app("Merchant", "com.merchant.twa", Some("an://invalid.url"), Some(b"01"));
        pm.set_string_array_metadata("com.merchant.twa", &[PLAY_BILLING_METHOD]);
        pm.mock_installer_for_package("com.merchant.twa", Some(PLAY_STORE_PACKAGE));

        let params = twa_params(&[PLAY_BILLING_METHOD], "com.merchant.twa");
        assert_eq!(ids(&find(&finder(&pm), &params).await), vec!["com.merchant.twa"]);
    }

    #[tokio::test]
    async fn only_the_installer_store_method_is_enabled() {
        let pm = Arc::new(InMemoryPackageManager::new());
        let other_store = "https://another-store.test/billing";
        pm.install_payment_app("Merchant", "com.merchant.twa", Some(PLAY_BILLING_METHOD), Some(b"01"));
        pm.set_string_array_metadata("com.merchant.twa", &[other_store]);
        pm.mock_installer_for_package("com.merchant.twa", Some("com.another.store"));

        let mut finder = finder(&pm);
        finder.add_app_store_for_test("com.another.store", Url::parse(other_store).unwrap());
        let params = twa_params(&[PLAY_BILLING_METHOD, other_store], "com.merchant.twa");
        let recorder = find(&finder, &params).await;
        let apps = recorder.apps.lock().unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(
            apps[0].supported_methods,
            BTreeSet::from([other_store.to_string()])
        );
    }

    #[tokio::test]
    async fn readiness_probe_decides_ready_to_pay() {
        let pm = Arc::new(InMemoryPackageManager::new());
        pm.install_payment_app("Merchant", "com.merchant.twa", Some(PLAY_BILLING_METHOD), Some(b"01"));
        pm.mock_installer_for_package("com.merchant.twa", Some(PLAY_STORE_PACKAGE));
        pm.install_ready_to_pay_service("com.merchant.twa");
        let params = twa_params(&[PLAY_BILLING_METHOD], "com.merchant.twa");

        let not_ready = finder(&pm).with_ready_to_pay_probe(Arc::new(FixedProbe(false)));
        let recorder = find(&not_ready, &params).await;
        assert!(!recorder.apps.lock().unwrap()[0].ready_to_pay);

        let mut bypassed = finder(&pm).with_ready_to_pay_probe(Arc::new(FixedProbe(false)));
        bypassed.bypass_is_ready_to_pay_service_in_test();
        let recorder = find(&bypassed, &params).await;
        assert!(recorder.apps.lock().unwrap()[0].ready_to_pay);
    }

    #[tokio::test]
    async fn apps_without_label_or_metadata_are_skipped() {
        let pm = Arc::new(InMemoryPackageManager::new());
        pm.install_payment_app("", "com.nolabel", Some(PLAY_BILLING_METHOD), Some(b"01"));
        pm.install_payment_app("No Metadata", "com.nometadata", None, Some(b"01"));
        pm.mock_installer_for_package("com.nolabel", Some(PLAY_STORE_PACKAGE));
        pm.mock_installer_for_package("com.nometadata", Some(PLAY_STORE_PACKAGE));

        for twa in ["com.nolabel", "com.nometadata"] {
            let params = twa_params(&[PLAY_BILLING_METHOD], twa);
            assert!(ids(&find(&finder(&pm), &params).await).is_empty());
        }
    }
}
