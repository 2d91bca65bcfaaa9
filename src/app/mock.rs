//! Fixed-app factories for tests and demos.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::app::{PaymentApp, PaymentAppFactory, PaymentAppFactoryDelegate, PaymentRequestParams};

/// How quickly a mock factory produces its apps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FactorySpeed {
    #[default]
    Fast,
    Slow(Duration),
}

/// Creates a fixed set of apps, each only when one of its methods is requested.
#[derive(Debug, Clone)]
pub struct MockPaymentAppFactory {
    name: String,
    apps: Vec<PaymentApp>,
    speed: FactorySpeed,
}

#[async_trait]
impl PaymentAppFactory for MockPaymentAppFactory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, params: &PaymentRequestParams, delegate: &dyn PaymentAppFactoryDelegate) {
        if let FactorySpeed::Slow(delay) = self.speed {
            tokio::time::sleep(delay).await;
        }

        if !delegate.is_closed() {
            let requested: BTreeSet<&str> = params.requested_methods().into_iter().collect();
            for app in &self.apps {
                let enabled: BTreeSet<String> = app
                    .supported_methods
                    .iter()
                    .filter(|method| requested.contains(method.as_str()))
                    .cloned()
                    .collect();
                if enabled.is_empty() {
                    continue;
                }
                delegate.on_payment_app_created(PaymentApp {
                    supported_methods: enabled,
                    ..app.clone()
                });
            }
        }
        delegate.on_done_creating_payment_apps();
    }
}

/// Builder for [`MockPaymentAppFactory`].
#[derive(Debug, Clone)]
pub struct MockPaymentAppInstaller {
    factory: MockPaymentAppFactory,
}

impl MockPaymentAppInstaller {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            factory: MockPaymentAppFactory {
                name: name.into(),
                apps: Vec::new(),
                speed: FactorySpeed::Fast,
            },
        }
    }

    /// Add a ready app that handles `method`.
    pub fn add_app(self, identifier: &str, method: &str) -> Self {
        self.add_payment_app(PaymentApp::mock(identifier, &[method]))
    }

    pub fn add_payment_app(mut self, app: PaymentApp) -> Self {
        self.factory.apps.push(app);
        self
    }

    pub fn speed(mut self, speed: FactorySpeed) -> Self {
        self.factory.speed = speed;
        self
    }

    pub fn build(self) -> MockPaymentAppFactory {
        self.factory
    }
}
