//! Runs every registered factory for one request and joins the results.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;

use crate::app::{PaymentApp, PaymentAppFactory, PaymentAppFactoryDelegate, PaymentRequestParams};
use crate::error::AppCreationFailureReason;
use crate::manifest::CspChecker;

/// A per-app failure reported by a factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCreationError {
    pub factory: String,
    pub message: String,
    pub reason: AppCreationFailureReason,
}

/// Joined output of all factories.
#[derive(Debug, Clone, Default)]
pub struct PaymentAppServiceResult {
    /// Apps in factory registration order, then creation order.
    pub apps: Vec<PaymentApp>,
    pub errors: Vec<AppCreationError>,
}

/// Collects one factory's output and drops anything after close.
struct CollectingDelegate {
    factory: String,
    csp_checker: Arc<dyn CspChecker>,
    closed: Arc<AtomicBool>,
    apps: Mutex<Vec<PaymentApp>>,
    errors: Mutex<Vec<AppCreationError>>,
    done: AtomicBool,
}

impl CollectingDelegate {
    fn new(factory: &str, csp_checker: Arc<dyn CspChecker>, closed: Arc<AtomicBool>) -> Self {
        Self {
            factory: factory.to_string(),
            csp_checker,
            closed,
            apps: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
        }
    }

    fn accepts(&self, what: &str) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!(factory = %self.factory, "Ignoring {what} after the request closed");
            return false;
        }
        if self.done.load(Ordering::SeqCst) {
            tracing::warn!(factory = %self.factory, "Ignoring {what} after the factory finished");
            return false;
        }
        true
    }

    fn into_parts(self) -> (Vec<PaymentApp>, Vec<AppCreationError>) {
        (
            self.apps.into_inner().unwrap_or_else(PoisonError::into_inner),
            self.errors.into_inner().unwrap_or_else(PoisonError::into_inner),
        )
    }
}

impl PaymentAppFactoryDelegate for CollectingDelegate {
    fn csp_checker(&self) -> Arc<dyn CspChecker> {
        Arc::clone(&self.csp_checker)
    }

    fn on_payment_app_created(&self, app: PaymentApp) {
        if !self.accepts("app") {
            return;
        }
        tracing::debug!(factory = %self.factory, app = %app.identifier, "Payment app created");
        self.apps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(app);
    }

    fn on_payment_app_creation_error(&self, message: String, reason: AppCreationFailureReason) {
        if !self.accepts("error") {
            return;
        }
        tracing::warn!(factory = %self.factory, ?reason, "{message}");
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(AppCreationError {
                factory: self.factory.clone(),
                message,
                reason,
            });
    }

    fn on_done_creating_payment_apps(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            tracing::warn!(factory = %self.factory, "Factory reported done twice");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Registry of payment app factories.
#[derive(Default, Clone)]
pub struct PaymentAppService {
    factories: Vec<Arc<dyn PaymentAppFactory>>,
}

impl std::fmt::Debug for PaymentAppService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.factories.iter().map(|factory| factory.name()))
            .finish()
    }
}

impl PaymentAppService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_factory(&mut self, factory: Arc<dyn PaymentAppFactory>) {
        self.factories.push(factory);
    }

    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }

    /// Run every factory concurrently and wait for all of them.
    ///
    /// Once `closed` is set, late output is dropped and the result is empty.
    pub async fn create(
        &self,
        params: &PaymentRequestParams,
        csp_checker: Arc<dyn CspChecker>,
        closed: Arc<AtomicBool>,
    ) -> PaymentAppServiceResult {
        let delegates: Vec<CollectingDelegate> = self
            .factories
            .iter()
            .map(|factory| {
                CollectingDelegate::new(factory.name(), Arc::clone(&csp_checker), Arc::clone(&closed))
            })
            .collect();

        join_all(
            self.factories
                .iter()
                .zip(&delegates)
                .map(|(factory, delegate)| factory.create(params, delegate)),
        )
        .await;

        let mut result = PaymentAppServiceResult::default();
        if closed.load(Ordering::SeqCst) {
            tracing::debug!("Payment request closed during app creation");
            return result;
        }

        for delegate in delegates {
            if !delegate.done.load(Ordering::SeqCst) {
                tracing::warn!(factory = %delegate.factory, "Factory returned without reporting done");
            }
            let (apps, errors) = delegate.into_parts();
            result.apps.extend(apps);
            result.errors.extend(errors);
        }
        tracing::info!(
            apps = result.apps.len(),
            errors = result.errors.len(),
            factories = self.factories.len(),
            "Payment app creation finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::app::{FactorySpeed, MockPaymentAppInstaller};
    use crate::manifest::{AllowAllCspChecker, BrowsingContext};

    fn params(methods: &[&str]) -> PaymentRequestParams {
        PaymentRequestParams::new(BrowsingContext::for_test(), methods)
    }

    #[tokio::test]
    async fn joins_fast_and_slow_factories_in_registration_order() {
        let slow = MockPaymentAppInstaller::new("slow")
            .add_app("https://alicepay.test/app", "https://alicepay.test")
            .speed(FactorySpeed::Slow(Duration::from_millis(30)))
            .build();
        let fast = MockPaymentAppInstaller::new("fast")
            .add_app("https://bobpay.test/app", "https://bobpay.test")
            .build();

        let mut service = PaymentAppService::new();
        service.add_factory(Arc::new(slow));
        service.add_factory(Arc::new(fast));

        let result = service
            .create(
                &params(&["https://alicepay.test", "https://bobpay.test"]),
                Arc::new(AllowAllCspChecker),
                Arc::new(AtomicBool::new(false)),
            )
            .await;
        let ids: Vec<_> = result.apps.iter().map(|a| a.identifier.as_str()).collect();
        assert_eq!(ids, vec!["https://alicepay.test/app", "https://bobpay.test/app"]);
    }

    #[tokio::test]
    async fn empty_factories_behave_the_same_fast_or_slow() {
        for speed in [FactorySpeed::Fast, FactorySpeed::Slow(Duration::from_millis(10))] {
            let factory = MockPaymentAppInstaller::new("empty").speed(speed).build();
            let mut service = PaymentAppService::new();
            service.add_factory(Arc::new(factory));
            let result = service
                .create(
                    &params(&["https://bobpay.test"]),
                    Arc::new(AllowAllCspChecker),
                    Arc::new(AtomicBool::new(false)),
                )
                .await;
            assert!(result.apps.is_empty());
            assert!(result.errors.is_empty());
        }
    }

    #[tokio::test]
    async fn output_after_close_is_dropped() {
        let factory = MockPaymentAppInstaller::new("slow")
            .add_app("https://bobpay.test/app", "https://bobpay.test")
            .speed(FactorySpeed::Slow(Duration::from_millis(50)))
            .build();
        let mut service = PaymentAppService::new();
        service.add_factory(Arc::new(factory));

        let closed = Arc::new(AtomicBool::new(false));
        let closer = Arc::clone(&closed);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            closer.store(true, Ordering::SeqCst);
        });

        let result = service
            .create(
                &params(&["https://bobpay.test"]),
                Arc::new(AllowAllCspChecker),
                closed,
            )
            .await;
        assert!(result.apps.is_empty());
    }
}
