//! Package inspector: read-only view of the OS package database.
//!
//! The finder never talks to the OS directly. Everything it needs about
//! installed payment apps (activities, readiness services, signatures,
//! metadata, installer provenance) goes through [`PackageManagerDelegate`].
//! Implementations must tolerate installs and uninstalls between any two
//! calls; callers re-query when staleness matters.

mod memory;

use std::collections::BTreeMap;

pub use self::memory::InMemoryPackageManager;

/// Intent action advertised by payment activities.
pub const ACTION_PAY: &str = "org.chromium.intent.action.PAY";

/// Intent action advertised by readiness check services.
pub const ACTION_IS_READY_TO_PAY: &str = "org.chromium.intent.action.IS_READY_TO_PAY";

/// Metadata key for the app's default payment method name (literal string).
pub const META_DATA_DEFAULT_PAYMENT_METHOD_NAME: &str = "org.chromium.default_payment_method_name";

/// Metadata key for additional payment method names (string-array resource).
pub const META_DATA_PAYMENT_METHOD_NAMES: &str = "org.chromium.payment_method_names";

/// Metadata key for supported delegations (string-array resource).
pub const META_DATA_SUPPORTED_DELEGATIONS: &str = "org.chromium.payment_supported_delegations";

/// Identifier of a string-array resource inside an app's package.
pub type ResourceId = u32;

/// A single application metadata value.
///
/// Android metadata values are either literals or references to a
/// resource that needs a second lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Literal(String),
    ResourceRef(ResourceId),
}

/// Application-level record shared by every component of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationInfo {
    pub package_name: String,
    pub uid: u32,
    pub label: String,
    /// `None` when the application declares no metadata bundle at all.
    pub metadata: Option<BTreeMap<String, MetadataValue>>,
}

impl ApplicationInfo {
    pub fn metadata_value(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.as_ref()?.get(key)
    }
}

/// Snapshot of an activity or service resolved for an intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedActivity {
    pub package_name: String,
    /// Activity or service class name.
    pub name: String,
    pub application: ApplicationInfo,
    pub icon: Option<Vec<u8>>,
}

/// Package-level information, including signing certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub package_name: String,
    pub version_code: i64,
    /// Signing certificates in declaration order.
    pub signatures: Vec<Vec<u8>>,
}

/// An intent-equivalent query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentQuery {
    pub action: String,
    pub package: Option<String>,
}

impl IntentQuery {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            package: None,
        }
    }

    pub fn for_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }
}

/// How to address a package when asking for signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageRef<'a> {
    Name(&'a str),
    Uid(u32),
}

/// Read-only access to the installed package database.
pub trait PackageManagerDelegate: Send + Sync {
    /// Activities handling `query`. Metadata is only populated when
    /// `with_metadata` is set.
    fn activities_responding_to_intent(
        &self,
        query: &IntentQuery,
        with_metadata: bool,
    ) -> Vec<ResolvedActivity>;

    /// Services handling `query`.
    fn services_responding_to_intent(&self, query: &IntentQuery) -> Vec<ResolvedActivity>;

    /// Package info with signatures, or `None` when it cannot be retrieved.
    fn package_info(&self, package_name: &str) -> Option<PackageInfo>;

    /// Ordered signing certificates, or `None` if the package is gone.
    fn package_signatures(&self, package: PackageRef<'_>) -> Option<Vec<Vec<u8>>>;

    /// Resolves a string-array resource declared by `app`.
    fn string_array_resource(
        &self,
        app: &ApplicationInfo,
        resource_id: ResourceId,
    ) -> Option<Vec<String>>;

    /// Package that installed `package_name`, if known.
    fn installer_package(&self, package_name: &str) -> Option<String>;

    /// Resolves a metadata value into a list of strings.
    ///
    /// Literals become a one-element list. A dangling resource reference
    /// resolves to `None`.
    fn resolve_string_array(
        &self,
        app: &ApplicationInfo,
        value: &MetadataValue,
    ) -> Option<Vec<String>> {
        match value {
            MetadataValue::Literal(literal) => Some(vec![literal.clone()]),
            MetadataValue::ResourceRef(id) => self.string_array_resource(app, *id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_metadata_resolves_without_lookup() {
        let pm = InMemoryPackageManager::new();
        let app = ApplicationInfo {
            package_name: "com.bobpay".to_string(),
            uid: 1,
            label: "BobPay".to_string(),
            metadata: None,
        };
        let value = MetadataValue::Literal("https://bobpay.test/webpay".to_string());
        assert_eq!(
            pm.resolve_string_array(&app, &value),
            Some(vec!["https://bobpay.test/webpay".to_string()])
        );
        assert_eq!(
            pm.resolve_string_array(&app, &MetadataValue::ResourceRef(42)),
            None
        );
    }

    #[test]
    fn intent_query_builder() {
        let query = IntentQuery::new(ACTION_IS_READY_TO_PAY).for_package("com.bobpay");
        assert_eq!(query.action, ACTION_IS_READY_TO_PAY);
        assert_eq!(query.package.as_deref(), Some("com.bobpay"));
    }
}
