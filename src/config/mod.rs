//! Configuration for payment-app-finder.
//!
//! Settings are loaded with priority: env var > TOML config file > default.
//! `.env` files are loaded via dotenvy before anything is resolved.

pub(crate) mod helpers;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;
use crate::manifest::origin::parse_manifest_url;
use crate::settings::{DownloaderSettings, FinderSettings, Settings, base_dir};

/// Resolved configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub downloader: DownloaderConfig,
    pub finder: FinderConfig,
    pub frecency: FrecencyConfig,
}

/// Manifest download limits.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub max_manifest_bytes: usize,
    pub user_agent: String,
    pub allow_loopback_http: bool,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        let settings = DownloaderSettings::default();
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            max_redirects: settings.max_redirects,
            max_manifest_bytes: settings.max_manifest_bytes,
            user_agent: default_user_agent(),
            allow_loopback_http: settings.allow_loopback_http,
        }
    }
}

fn default_user_agent() -> String {
    format!("payment-app-finder/{}", env!("CARGO_PKG_VERSION"))
}

impl DownloaderConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let timeout_ms = helpers::parse_optional_env::<u64>(
            "PAYMENT_MANIFEST_TIMEOUT_MS",
            "a positive integer",
        )?
        .unwrap_or(settings.downloader.timeout_ms);
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PAYMENT_MANIFEST_TIMEOUT_MS".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let max_redirects = helpers::parse_optional_env::<usize>(
            "PAYMENT_MANIFEST_MAX_REDIRECTS",
            "a non-negative integer",
        )?
        .unwrap_or(settings.downloader.max_redirects);

        let max_manifest_bytes = helpers::parse_optional_env::<usize>(
            "PAYMENT_MANIFEST_MAX_BYTES",
            "a positive integer",
        )?
        .unwrap_or(settings.downloader.max_manifest_bytes);
        if max_manifest_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PAYMENT_MANIFEST_MAX_BYTES".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let user_agent = helpers::optional_env("PAYMENT_MANIFEST_USER_AGENT")?
            .or_else(|| settings.downloader.user_agent.clone())
            .unwrap_or_else(default_user_agent);

        let allow_loopback_http = helpers::parse_bool_env("PAYMENT_MANIFEST_ALLOW_LOOPBACK_HTTP")?
            .unwrap_or(settings.downloader.allow_loopback_http);

        Ok(Self {
            timeout: Duration::from_millis(timeout_ms),
            max_redirects,
            max_manifest_bytes,
            user_agent,
            allow_loopback_http,
        })
    }
}

/// App discovery switches.
#[derive(Debug, Clone)]
pub struct FinderConfig {
    pub app_store_billing_debug: bool,
    pub bypass_is_ready_to_pay: bool,
    /// Installer package name -> billing payment method.
    pub app_stores: BTreeMap<String, Url>,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            app_store_billing_debug: false,
            bypass_is_ready_to_pay: false,
            app_stores: FinderSettings::default()
                .app_stores
                .into_iter()
                .filter_map(|(installer, method)| Some((installer, Url::parse(&method).ok()?)))
                .collect(),
        }
    }
}

impl FinderConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let app_store_billing_debug = helpers::parse_bool_env("PAYMENT_APP_STORE_BILLING_DEBUG")?
            .unwrap_or(settings.finder.app_store_billing_debug);

        let bypass_is_ready_to_pay = helpers::parse_bool_env("PAYMENT_BYPASS_IS_READY_TO_PAY")?
            .unwrap_or(settings.finder.bypass_is_ready_to_pay);

        let mut app_stores = BTreeMap::new();
        for (installer, method) in &settings.finder.app_stores {
            let url = parse_manifest_url(method, false).ok_or_else(|| ConfigError::InvalidValue {
                key: format!("finder.app_stores.{installer}"),
                message: format!("'{method}' is not an HTTPS payment method URL"),
            })?;
            app_stores.insert(installer.clone(), url);
        }

        Ok(Self {
            app_store_billing_debug,
            bypass_is_ready_to_pay,
            app_stores,
        })
    }
}

/// Usage history persistence.
#[derive(Debug, Clone)]
pub struct FrecencyConfig {
    pub store_path: PathBuf,
}

impl Default for FrecencyConfig {
    fn default() -> Self {
        Self {
            store_path: default_frecency_store_path(),
        }
    }
}

impl FrecencyConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let store_path = helpers::optional_env("PAYMENT_FRECENCY_STORE_PATH")?
            .map(PathBuf::from)
            .or_else(|| settings.frecency.store_path.clone())
            .unwrap_or_else(default_frecency_store_path);
        Ok(Self { store_path })
    }
}

fn default_frecency_store_path() -> PathBuf {
    base_dir().join("frecency.json")
}

impl Config {
    /// Load configuration from environment variables and the default
    /// TOML file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_toml(None)
    }

    /// Load from env with an optional TOML config file overlay.
    pub fn from_env_with_toml(toml_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let _ = dotenvy::from_path(base_dir().join(".env"));
        let mut settings = Settings::default();
        Self::apply_toml_overlay(&mut settings, toml_path)?;
        Self::build(&settings)
    }

    /// Replace settings with a TOML config file's contents.
    ///
    /// If `explicit_path` is `Some`, loads from that path (errors are fatal).
    /// If `None`, tries the default path `~/.payment-app-finder/config.toml`
    /// (missing file is silently ignored).
    fn apply_toml_overlay(
        settings: &mut Settings,
        explicit_path: Option<&std::path::Path>,
    ) -> Result<(), ConfigError> {
        let path = explicit_path
            .map(std::path::PathBuf::from)
            .unwrap_or_else(Settings::default_toml_path);

        match Settings::load_toml(&path) {
            Ok(Some(toml_settings)) => {
                // Absent keys already carry their defaults; tables are taken whole.
                *settings = toml_settings;
                tracing::debug!("Loaded TOML config from {}", path.display());
            }
            Ok(None) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
            }
            Err(e) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Failed to load config file {}: {}",
                        path.display(),
                        e
                    )));
                }
                tracing::warn!("Failed to load default config file: {}", e);
            }
        }
        Ok(())
    }

    /// Resolve every section from merged settings.
    pub fn build(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            downloader: DownloaderConfig::resolve(settings)?,
            finder: FinderConfig::resolve(settings)?,
            frecency: FrecencyConfig::resolve(settings)?,
        })
    }
}
