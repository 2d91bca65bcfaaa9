//! File-backed settings.
//!
//! Stored as TOML in ~/.payment-app-finder/config.toml.
//! Settings are loaded with env var > config.toml > default priority.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Installer package of the Google Play Store.
pub const PLAY_STORE_PACKAGE: &str = "com.android.vending";

/// Billing payment method served by the Google Play Store.
pub const PLAY_BILLING_METHOD: &str = "https://play.google.com/billing";

/// Settings persisted to disk.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub downloader: DownloaderSettings,

    #[serde(default)]
    pub finder: FinderSettings,

    #[serde(default)]
    pub frecency: FrecencySettings,
}

/// Manifest download settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DownloaderSettings {
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Redirect hops followed per manifest fetch.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Largest accepted manifest body.
    #[serde(default = "default_max_manifest_bytes")]
    pub max_manifest_bytes: usize,

    /// User-Agent header; defaults to `payment-app-finder/<version>`.
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Accept plain HTTP for localhost manifests.
    #[serde(default = "default_true")]
    pub allow_loopback_http: bool,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_redirects() -> usize {
    3
}

fn default_max_manifest_bytes() -> usize {
    1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_redirects: default_max_redirects(),
            max_manifest_bytes: default_max_manifest_bytes(),
            user_agent: None,
            allow_loopback_http: true,
        }
    }
}

/// App discovery settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FinderSettings {
    /// Allow app-store billing regardless of the installing package.
    #[serde(default)]
    pub app_store_billing_debug: bool,

    /// Treat every app as ready to pay without probing it.
    #[serde(default)]
    pub bypass_is_ready_to_pay: bool,

    /// Installer package name -> billing payment method URL.
    #[serde(default = "default_app_stores")]
    pub app_stores: BTreeMap<String, String>,
}

fn default_app_stores() -> BTreeMap<String, String> {
    BTreeMap::from([(
        PLAY_STORE_PACKAGE.to_string(),
        PLAY_BILLING_METHOD.to_string(),
    )])
}

impl Default for FinderSettings {
    fn default() -> Self {
        Self {
            app_store_billing_debug: false,
            bypass_is_ready_to_pay: false,
            app_stores: default_app_stores(),
        }
    }
}

/// Usage history settings.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct FrecencySettings {
    /// Store location; defaults to ~/.payment-app-finder/frecency.json.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

/// Root directory for everything this tool writes (~/.payment-app-finder).
pub fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".payment-app-finder")
}

impl Settings {
    /// Default TOML config file path (~/.payment-app-finder/config.toml).
    pub fn default_toml_path() -> PathBuf {
        base_dir().join("config.toml")
    }

    /// Load settings from a TOML file.
    ///
    /// Returns `None` if the file doesn't exist. Returns an error only
    /// if the file exists but can't be parsed.
    pub fn load_toml(path: &std::path::Path) -> Result<Option<Self>, String> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to read {}: {}", path.display(), e)),
        };

        let settings: Self = toml::from_str(&data)
            .map_err(|e| format!("invalid TOML in {}: {}", path.display(), e))?;
        Ok(Some(settings))
    }
}

#[cfg(test)]
mod tests {
    use crate::settings::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.downloader.timeout_ms, 10_000);
        assert_eq!(settings.downloader.max_redirects, 3);
        assert_eq!(settings.downloader.max_manifest_bytes, 1_048_576);
        assert!(settings.downloader.allow_loopback_http);
        assert_eq!(
            settings.finder.app_stores.get(PLAY_STORE_PACKAGE).map(String::as_str),
            Some(PLAY_BILLING_METHOD)
        );
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [downloader]
            timeout_ms = 2500

            [finder]
            bypass_is_ready_to_pay = true
            "#,
        )
        .unwrap();
        assert_eq!(settings.downloader.timeout_ms, 2500);
        assert_eq!(settings.downloader.max_redirects, 3);
        assert!(settings.finder.bypass_is_ready_to_pay);
        assert_eq!(settings.finder.app_stores.len(), 1);
    }

    #[test]
    fn app_stores_table_replaces_the_default_map() {
        let settings: Settings = toml::from_str(
            r#"
            [finder.app_stores]
            "com.other.store" = "https://other.store.test/billing"
            "#,
        )
        .unwrap();
        assert_eq!(settings.finder.app_stores.len(), 1);
        assert!(!settings.finder.app_stores.contains_key(PLAY_STORE_PACKAGE));
    }

    #[test]
    fn missing_toml_is_none_and_invalid_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Settings::load_toml(&dir.path().join("absent.toml")).unwrap().is_none());

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "downloader = [").unwrap();
        assert!(Settings::load_toml(&bad).is_err());
    }

    #[test]
    fn default_toml_path_under_base_dir() {
        let path = Settings::default_toml_path();
        assert!(path.to_string_lossy().contains(".payment-app-finder"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }
}
