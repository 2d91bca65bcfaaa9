//! Payment apps and the factory protocol that produces them.
//!
//! Every source of apps (installed Android apps, service workers, test
//! mocks) implements [`PaymentAppFactory`]. A factory reports each app it
//! creates, any per-app failures, and finally that it is done, through a
//! [`PaymentAppFactoryDelegate`]. [`PaymentAppService`] runs all factories
//! for one request and joins their results.

pub mod mock;
pub mod service;
pub mod service_worker;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use url::{Origin, Url};

use crate::error::AppCreationFailureReason;
use crate::manifest::{BrowsingContext, CspChecker};

pub use self::mock::{FactorySpeed, MockPaymentAppFactory, MockPaymentAppInstaller};
pub use self::service::{AppCreationError, PaymentAppService, PaymentAppServiceResult};
pub use self::service_worker::{
    ServiceWorkerPaymentAppFactory, ServiceWorkerRegistration, ServiceWorkerRegistry,
};

/// Delegation names accepted in app metadata.
pub const DELEGATION_SHIPPING_ADDRESS: &str = "shippingAddress";
pub const DELEGATION_PAYER_NAME: &str = "payerName";
pub const DELEGATION_PAYER_EMAIL: &str = "payerEmail";
pub const DELEGATION_PAYER_PHONE: &str = "payerPhone";

/// Kind of app, which decides how it is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentAppType {
    NativeApp,
    ServiceWorkerApp,
    MockApp,
}

/// Information the app can provide on the merchant's behalf.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupportedDelegations {
    pub shipping_address: bool,
    pub payer_name: bool,
    pub payer_email: bool,
    pub payer_phone: bool,
}

impl SupportedDelegations {
    /// Build from metadata names. Unknown names are ignored.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut delegations = Self::default();
        for name in names {
            match name.as_ref() {
                DELEGATION_SHIPPING_ADDRESS => delegations.shipping_address = true,
                DELEGATION_PAYER_NAME => delegations.payer_name = true,
                DELEGATION_PAYER_EMAIL => delegations.payer_email = true,
                DELEGATION_PAYER_PHONE => delegations.payer_phone = true,
                other => tracing::debug!(delegation = other, "Ignoring unknown delegation"),
            }
        }
        delegations
    }

    /// Whether every piece of information `options` asks for is delegated.
    pub fn provides_all(&self, options: &PaymentOptions) -> bool {
        (!options.request_shipping || self.shipping_address)
            && (!options.request_payer_name || self.payer_name)
            && (!options.request_payer_email || self.payer_email)
            && (!options.request_payer_phone || self.payer_phone)
    }
}

/// How the browser hands control to an app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationHandle {
    AndroidActivity {
        package_name: String,
        activity_name: String,
    },
    ServiceWorker {
        scope: Url,
        registration_id: i64,
    },
    Mock,
}

/// An app that can handle at least one of the requested payment methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentApp {
    /// Package name for native apps, scope URL for service workers.
    pub identifier: String,
    pub label: String,
    pub icon: Option<Vec<u8>>,
    /// Requested methods this app is allowed to handle.
    pub supported_methods: BTreeSet<String>,
    pub delegations: SupportedDelegations,
    pub app_type: PaymentAppType,
    pub invocation: InvocationHandle,
    /// Result of the readiness probe.
    pub ready_to_pay: bool,
    /// Ranked ahead of all non-preferred apps.
    pub preferred: bool,
    /// May be highlighted as the default choice.
    pub can_preselect: bool,
    /// Apps sharing a key come from the same installation and rank together.
    pub installation_key: String,
}

impl PaymentApp {
    /// A test app with sensible defaults.
    pub fn mock(identifier: impl Into<String>, methods: &[&str]) -> Self {
        let identifier = identifier.into();
        Self {
            label: identifier.clone(),
            installation_key: identifier.clone(),
            identifier,
            icon: None,
            supported_methods: methods.iter().map(|m| m.to_string()).collect(),
            delegations: SupportedDelegations::default(),
            app_type: PaymentAppType::MockApp,
            invocation: InvocationHandle::Mock,
            ready_to_pay: true,
            preferred: false,
            can_preselect: true,
        }
    }

    pub fn supports_method(&self, method: &str) -> bool {
        self.supported_methods.contains(method)
    }
}

/// Merchant-requested information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaymentOptions {
    pub request_shipping: bool,
    pub request_payer_name: bool,
    pub request_payer_email: bool,
    pub request_payer_phone: bool,
}

impl PaymentOptions {
    pub fn requests_any_delegation(&self) -> bool {
        self.request_shipping
            || self.request_payer_name
            || self.request_payer_email
            || self.request_payer_phone
    }
}

/// One entry of the merchant's `methodData`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentMethodData {
    pub supported_method: String,
    /// Method-specific data, passed to readiness probes as-is.
    pub stringified_data: Option<String>,
}

impl PaymentMethodData {
    pub fn new(supported_method: impl Into<String>) -> Self {
        Self {
            supported_method: supported_method.into(),
            stringified_data: None,
        }
    }
}

/// Everything a factory needs to know about the request.
#[derive(Debug, Clone)]
pub struct PaymentRequestParams {
    pub context: BrowsingContext,
    /// Origin of the frame that created the request.
    pub payment_request_origin: Origin,
    pub method_data: Vec<PaymentMethodData>,
    pub options: PaymentOptions,
    /// Package of the trusted web activity hosting the page, if any.
    pub twa_package_name: Option<String>,
}

impl PaymentRequestParams {
    pub fn new(context: BrowsingContext, methods: &[&str]) -> Self {
        Self {
            payment_request_origin: context.top_level_origin.clone(),
            context,
            method_data: methods.iter().map(|m| PaymentMethodData::new(*m)).collect(),
            options: PaymentOptions::default(),
            twa_package_name: None,
        }
    }

    /// Requested method names, deduplicated, in request order.
    pub fn requested_methods(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.method_data
            .iter()
            .map(|data| data.supported_method.as_str())
            .filter(|method| seen.insert(*method))
            .collect()
    }

    pub fn method_data_for(&self, method: &str) -> Option<&PaymentMethodData> {
        self.method_data.iter().find(|d| d.supported_method == method)
    }
}

/// Receives what a factory produces.
///
/// Factories call `on_done_creating_payment_apps` exactly once, after all
/// other calls.
pub trait PaymentAppFactoryDelegate: Send + Sync {
    fn csp_checker(&self) -> Arc<dyn CspChecker>;

    fn on_payment_app_created(&self, app: PaymentApp);

    fn on_payment_app_creation_error(&self, message: String, reason: AppCreationFailureReason);

    fn on_done_creating_payment_apps(&self);

    /// Whether the request was torn down. Factories stop early when set.
    fn is_closed(&self) -> bool {
        false
    }
}

/// A source of payment apps.
#[async_trait]
pub trait PaymentAppFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Create apps for `params`. Resolves after `on_done_creating_payment_apps`.
    async fn create(&self, params: &PaymentRequestParams, delegate: &dyn PaymentAppFactoryDelegate);
}
