//! In-memory package manager used by tests and the CLI inventory loader.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use serde::Deserialize;

use crate::error::InventoryError;

use super::{
    ACTION_IS_READY_TO_PAY, ACTION_PAY, ApplicationInfo, IntentQuery, META_DATA_DEFAULT_PAYMENT_METHOD_NAME,
    META_DATA_PAYMENT_METHOD_NAMES, META_DATA_SUPPORTED_DELEGATIONS, MetadataValue, PackageInfo,
    PackageManagerDelegate, PackageRef, ResolvedActivity, ResourceId,
};

const DEFAULT_VERSION_CODE: i64 = 10;
const FIRST_UID: u32 = 10_000;

#[derive(Debug, Clone)]
struct InstalledApp {
    label: String,
    package_name: String,
    uid: u32,
    activity_name: String,
    metadata: Option<BTreeMap<String, MetadataValue>>,
    /// `None` means the package info cannot be retrieved.
    signatures: Option<Vec<Vec<u8>>>,
    version_code: i64,
    ready_to_pay_service: Option<String>,
    icon: Option<Vec<u8>>,
}

impl InstalledApp {
    fn application_info(&self, with_metadata: bool) -> ApplicationInfo {
        ApplicationInfo {
            package_name: self.package_name.clone(),
            uid: self.uid,
            label: self.label.clone(),
            metadata: if with_metadata {
                self.metadata.clone()
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Default)]
struct State {
    apps: Vec<InstalledApp>,
    resources: HashMap<(String, ResourceId), Vec<String>>,
    installers: HashMap<String, String>,
    next_uid: u32,
    next_resource_id: ResourceId,
}

impl State {
    fn app_mut(&mut self, package_name: &str) -> Option<&mut InstalledApp> {
        self.apps
            .iter_mut()
            .find(|app| app.package_name == package_name)
    }

    fn allocate_resource(&mut self, package_name: &str, values: Vec<String>) -> ResourceId {
        self.next_resource_id += 1;
        let id = self.next_resource_id;
        self.resources.insert((package_name.to_string(), id), values);
        id
    }
}

/// Simulates the OS package manager in memory.
///
/// All mutators take `&self` so a shared instance can be changed while a
/// discovery pass is running, the way real installs race with queries.
#[derive(Debug, Default)]
pub struct InMemoryPackageManager {
    state: RwLock<State>,
}

impl InMemoryPackageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every installed app, resource, and installer record.
    pub fn reset(&self) {
        *self.write() = State::default();
    }

    /// Install a payment app.
    ///
    /// `default_method == None` installs the app without any metadata;
    /// `Some("")` installs metadata without a default method name.
    /// `signature == None` makes the package info unavailable, while an
    /// empty slice installs an unsigned package.
    pub fn install_payment_app(
        &self,
        label: &str,
        package_name: &str,
        default_method: Option<&str>,
        signature: Option<&[u8]>,
    ) {
        let signatures = signature.map(|bytes| {
            if bytes.is_empty() {
                Vec::new()
            } else {
                vec![bytes.to_vec()]
            }
        });
        self.install(label, package_name, default_method, signatures, None);
    }

    /// Install a payment app that declares supported delegations.
    pub fn install_payment_app_with_delegations(
        &self,
        label: &str,
        package_name: &str,
        default_method: Option<&str>,
        delegations: &[&str],
        signature: Option<&[u8]>,
    ) {
        let signatures = signature.map(|bytes| {
            if bytes.is_empty() {
                Vec::new()
            } else {
                vec![bytes.to_vec()]
            }
        });
        let delegations = delegations.iter().map(|d| d.to_string()).collect();
        self.install(
            label,
            package_name,
            default_method,
            signatures,
            Some(delegations),
        );
    }

    /// Install a payment app signed by several certificates.
    pub fn install_payment_app_with_signatures(
        &self,
        label: &str,
        package_name: &str,
        default_method: Option<&str>,
        signatures: Vec<Vec<u8>>,
    ) {
        self.install(label, package_name, default_method, Some(signatures), None);
    }

    fn install(
        &self,
        label: &str,
        package_name: &str,
        default_method: Option<&str>,
        signatures: Option<Vec<Vec<u8>>>,
        delegations: Option<Vec<String>>,
    ) {
        let mut state = self.write();
        state.apps.retain(|app| app.package_name != package_name);
        if state.next_uid == 0 {
            state.next_uid = FIRST_UID;
        }
        let uid = state.next_uid;
        state.next_uid += 1;

        let metadata = match default_method {
            None => None,
            Some(method) => {
                let mut map = BTreeMap::new();
                map.insert(
                    META_DATA_DEFAULT_PAYMENT_METHOD_NAME.to_string(),
                    MetadataValue::Literal(method.to_string()),
                );
                if let Some(delegations) = delegations {
                    let id = state.allocate_resource(package_name, delegations);
                    map.insert(
                        META_DATA_SUPPORTED_DELEGATIONS.to_string(),
                        MetadataValue::ResourceRef(id),
                    );
                }
                Some(map)
            }
        };

        state.apps.push(InstalledApp {
            label: label.to_string(),
            package_name: package_name.to_string(),
            uid,
            activity_name: format!("{package_name}.PaymentActivity"),
            metadata,
            signatures,
            version_code: DEFAULT_VERSION_CODE,
            ready_to_pay_service: None,
            icon: None,
        });
    }

    /// Declare additional payment method names for an installed app.
    pub fn set_string_array_metadata(&self, package_name: &str, methods: &[&str]) {
        let mut state = self.write();
        let values: Vec<String> = methods.iter().map(|m| m.to_string()).collect();
        let id = state.allocate_resource(package_name, values);
        if let Some(app) = state.app_mut(package_name) {
            app.metadata.get_or_insert_with(BTreeMap::new).insert(
                META_DATA_PAYMENT_METHOD_NAMES.to_string(),
                MetadataValue::ResourceRef(id),
            );
        }
    }

    /// Record which package installed `package_name`. `None` clears it.
    pub fn mock_installer_for_package(&self, package_name: &str, installer: Option<&str>) {
        let mut state = self.write();
        match installer {
            Some(installer) => {
                state
                    .installers
                    .insert(package_name.to_string(), installer.to_string());
            }
            None => {
                state.installers.remove(package_name);
            }
        }
    }

    /// Give an installed app an IS_READY_TO_PAY service.
    pub fn install_ready_to_pay_service(&self, package_name: &str) {
        if let Some(app) = self.write().app_mut(package_name) {
            app.ready_to_pay_service = Some(format!("{package_name}.IsReadyToPayService"));
        }
    }

    pub fn set_version_code(&self, package_name: &str, version_code: i64) {
        if let Some(app) = self.write().app_mut(package_name) {
            app.version_code = version_code;
        }
    }

    pub fn set_icon(&self, package_name: &str, icon: Vec<u8>) {
        if let Some(app) = self.write().app_mut(package_name) {
            app.icon = Some(icon);
        }
    }

    pub fn uninstall(&self, package_name: &str) {
        let mut state = self.write();
        state.apps.retain(|app| app.package_name != package_name);
        state.resources.retain(|(package, _), _| package != package_name);
        state.installers.remove(package_name);
    }

    /// Number of installed apps.
    pub fn len(&self) -> usize {
        self.read().apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Populate from a JSON inventory (see [`InventoryEntry`]).
    ///
    /// Nothing is installed unless every entry is valid.
    pub fn load_inventory(&self, json: &str) -> Result<usize, InventoryError> {
        let entries: Vec<InventoryEntry> = serde_json::from_str(json)?;
        let mut decoded = Vec::with_capacity(entries.len());
        for entry in entries {
            let signatures = entry
                .signatures
                .as_deref()
                .map(|sigs| decode_signatures(&entry.package, sigs))
                .transpose()?;
            decoded.push((entry, signatures));
        }

        let count = decoded.len();
        for (entry, signatures) in decoded {
            self.install(
                &entry.label,
                &entry.package,
                entry.default_method.as_deref(),
                signatures,
                entry.delegations,
            );
            if !entry.payment_method_names.is_empty() {
                let methods: Vec<&str> =
                    entry.payment_method_names.iter().map(String::as_str).collect();
                self.set_string_array_metadata(&entry.package, &methods);
            }
            if let Some(version_code) = entry.version_code {
                self.set_version_code(&entry.package, version_code);
            }
            if entry.installer.is_some() {
                self.mock_installer_for_package(&entry.package, entry.installer.as_deref());
            }
            if entry.ready_to_pay_service {
                self.install_ready_to_pay_service(&entry.package);
            }
        }
        Ok(count)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn decode_signatures(package: &str, signatures: &[String]) -> Result<Vec<Vec<u8>>, InventoryError> {
    signatures
        .iter()
        .map(|sig| {
            hex::decode(sig).map_err(|_| InventoryError::InvalidSignature {
                package: package.to_string(),
                value: sig.clone(),
            })
        })
        .collect()
}

/// One installed app in a JSON inventory file.
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryEntry {
    pub label: String,
    pub package: String,
    #[serde(default)]
    pub default_method: Option<String>,
    #[serde(default)]
    pub payment_method_names: Vec<String>,
    #[serde(default)]
    pub delegations: Option<Vec<String>>,
    /// Hex-encoded signing certificates.
    #[serde(default)]
    pub signatures: Option<Vec<String>>,
    #[serde(default)]
    pub version_code: Option<i64>,
    #[serde(default)]
    pub installer: Option<String>,
    #[serde(default)]
    pub ready_to_pay_service: bool,
}

impl PackageManagerDelegate for InMemoryPackageManager {
    fn activities_responding_to_intent(
        &self,
        query: &IntentQuery,
        with_metadata: bool,
    ) -> Vec<ResolvedActivity> {
        if query.action != ACTION_PAY {
            return Vec::new();
        }
        self.read()
            .apps
            .iter()
            .filter(|app| {
                query
                    .package
                    .as_deref()
                    .is_none_or(|package| package == app.package_name)
            })
            .map(|app| ResolvedActivity {
                package_name: app.package_name.clone(),
                name: app.activity_name.clone(),
                application: app.application_info(with_metadata),
                icon: app.icon.clone(),
            })
            .collect()
    }

    fn services_responding_to_intent(&self, query: &IntentQuery) -> Vec<ResolvedActivity> {
        if query.action != ACTION_IS_READY_TO_PAY {
            return Vec::new();
        }
        self.read()
            .apps
            .iter()
            .filter(|app| {
                query
                    .package
                    .as_deref()
                    .is_none_or(|package| package == app.package_name)
            })
            .filter_map(|app| {
                let service = app.ready_to_pay_service.as_ref()?;
                Some(ResolvedActivity {
                    package_name: app.package_name.clone(),
                    name: service.clone(),
                    application: app.application_info(false),
                    icon: None,
                })
            })
            .collect()
    }

    fn package_info(&self, package_name: &str) -> Option<PackageInfo> {
        let state = self.read();
        let app = state
            .apps
            .iter()
            .find(|app| app.package_name == package_name)?;
        Some(PackageInfo {
            package_name: app.package_name.clone(),
            version_code: app.version_code,
            signatures: app.signatures.clone()?,
        })
    }

    fn package_signatures(&self, package: PackageRef<'_>) -> Option<Vec<Vec<u8>>> {
        let state = self.read();
        let app = state.apps.iter().find(|app| match package {
            PackageRef::Name(name) => app.package_name == name,
            PackageRef::Uid(uid) => app.uid == uid,
        })?;
        app.signatures.clone()
    }

    fn string_array_resource(
        &self,
        app: &ApplicationInfo,
        resource_id: ResourceId,
    ) -> Option<Vec<String>> {
        self.read()
            .resources
            .get(&(app.package_name.clone(), resource_id))
            .cloned()
    }

    fn installer_package(&self, package_name: &str) -> Option<String> {
        self.read().installers.get(package_name).cloned()
    }
}
