//! Payment apps installed as service workers.
//!
//! A registration handles a URL-based method only when the method shares the
//! registration scope's origin; other method names (such as `basic-card`)
//! match whenever the registration lists them.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use url::Url;

use crate::app::{
    InvocationHandle, PaymentApp, PaymentAppFactory, PaymentAppFactoryDelegate, PaymentAppType,
    PaymentRequestParams, SupportedDelegations,
};

/// An installed service-worker payment handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceWorkerRegistration {
    pub registration_id: i64,
    pub scope: Url,
    pub name: String,
    pub icon: Option<Vec<u8>>,
    pub enabled_methods: Vec<String>,
    pub delegations: SupportedDelegations,
}

impl ServiceWorkerRegistration {
    fn can_handle(&self, method: &str) -> bool {
        if !self.enabled_methods.iter().any(|m| m == method) {
            return false;
        }
        match Url::parse(method) {
            Ok(url) => url.origin() == self.scope.origin(),
            Err(_) => true,
        }
    }
}

/// Installed service-worker registrations, keyed by id.
#[derive(Debug, Default)]
pub struct ServiceWorkerRegistry {
    registrations: RwLock<Vec<ServiceWorkerRegistration>>,
}

impl ServiceWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the registration with the same id.
    pub fn register(&self, registration: ServiceWorkerRegistration) {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        registrations.retain(|r| r.registration_id != registration.registration_id);
        registrations.push(registration);
    }

    pub fn unregister(&self, registration_id: i64) -> bool {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|r| r.registration_id != registration_id);
        registrations.len() != before
    }

    pub fn snapshot(&self) -> Vec<ServiceWorkerRegistration> {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Factory over a [`ServiceWorkerRegistry`].
#[derive(Debug, Default)]
pub struct ServiceWorkerPaymentAppFactory {
    registry: ServiceWorkerRegistry,
}

impl ServiceWorkerPaymentAppFactory {
    pub fn new(registry: ServiceWorkerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ServiceWorkerRegistry {
        &self.registry
    }
}

#[async_trait]
impl PaymentAppFactory for ServiceWorkerPaymentAppFactory {
    fn name(&self) -> &str {
        "service-worker"
    }

    async fn create(&self, params: &PaymentRequestParams, delegate: &dyn PaymentAppFactoryDelegate) {
        let requested = params.requested_methods();
        for registration in self.registry.snapshot() {
            if delegate.is_closed() {
                break;
            }
            let enabled: BTreeSet<String> = requested
                .iter()
                .filter(|method| registration.can_handle(method))
                .map(|method| method.to_string())
                .collect();
            if enabled.is_empty() {
                continue;
            }
            tracing::debug!(scope = %registration.scope, "Service worker payment app matched");
            delegate.on_payment_app_created(PaymentApp {
                identifier: registration.scope.to_string(),
                label: registration.name.clone(),
                can_preselect: !registration.name.is_empty() && registration.icon.is_some(),
                icon: registration.icon.clone(),
                supported_methods: enabled,
                delegations: registration.delegations,
                app_type: PaymentAppType::ServiceWorkerApp,
                invocation: InvocationHandle::ServiceWorker {
                    scope: registration.scope.clone(),
                    registration_id: registration.registration_id,
                },
                ready_to_pay: true,
                preferred: false,
                installation_key: registration.scope.to_string(),
            });
        }
        delegate.on_done_creating_payment_apps();
    }
}
