//! `payment-app-finder` command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use url::Url;

use crate::app::{PaymentAppService, PaymentOptions, PaymentRequestParams};
use crate::config::Config;
use crate::finder::AndroidPaymentAppFactory;
use crate::manifest::fingerprint::{fingerprint_of, format_fingerprint};
use crate::manifest::parser::{parse_payment_method_manifest, parse_web_app_manifest};
use crate::manifest::{AllowAllCspChecker, BrowsingContext};
use crate::package::{InMemoryPackageManager, PackageManagerDelegate};
use crate::ranking::{FrecencyStore, frecency_score};
use crate::session::PaymentRequestSession;

#[derive(Parser, Debug)]
#[command(name = "payment-app-finder", version, about = "Find, verify, and rank installed payment apps")]
pub struct Cli {
    /// TOML config file (default: ~/.payment-app-finder/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Discover and rank the apps in an inventory that can pay with the given methods.
    Find {
        /// JSON inventory of installed apps.
        #[arg(long)]
        inventory: PathBuf,

        /// Requested payment method; repeat for several.
        #[arg(long = "method", required = true)]
        methods: Vec<String>,

        /// Merchant top-level origin.
        #[arg(long)]
        origin: Option<Url>,

        /// Package of the trusted web activity hosting the merchant.
        #[arg(long)]
        twa: Option<String>,

        #[arg(long)]
        request_shipping: bool,

        #[arg(long)]
        request_payer_name: bool,

        #[arg(long)]
        request_payer_email: bool,

        #[arg(long)]
        request_payer_phone: bool,

        /// Frecency store path.
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Parse a payment-method manifest file.
    ParseMethodManifest {
        file: PathBuf,

        /// URL the manifest was served from.
        #[arg(long)]
        url: Url,
    },

    /// Parse a web-app manifest file.
    ParseWebAppManifest { file: PathBuf },

    /// Print the SHA-256 fingerprint of a DER certificate.
    Fingerprint { cert: PathBuf },

    /// Record a completed payment with an app.
    RecordUse {
        app_id: String,

        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// List recorded app usage, highest frecency first.
    Usage {
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env_with_toml(cli.config.as_deref())?;
    match cli.command {
        Command::Find {
            inventory,
            methods,
            origin,
            twa,
            request_shipping,
            request_payer_name,
            request_payer_email,
            request_payer_phone,
            store,
        } => {
            let options = PaymentOptions {
                request_shipping,
                request_payer_name,
                request_payer_email,
                request_payer_phone,
            };
            let store_path = store.unwrap_or_else(|| config.frecency.store_path.clone());
            run_find(&config, &inventory, &methods, origin, twa, options, &store_path).await
        }
        Command::ParseMethodManifest { file, url } => {
            let content = read_file(&file)?;
            let manifest =
                parse_payment_method_manifest(&url, &content, config.downloader.allow_loopback_http)?;
            println!("default_applications:");
            for url in &manifest.web_app_manifest_urls {
                println!("  {url}");
            }
            println!("supported_origins:");
            for origin in &manifest.supported_origins {
                println!("  {}", origin.ascii_serialization());
            }
            Ok(())
        }
        Command::ParseWebAppManifest { file } => {
            let content = read_file(&file)?;
            let sections = parse_web_app_manifest(&content)?;
            for section in &sections {
                println!("{} (min_version {})", section.id, section.min_version);
                for fingerprint in &section.fingerprints {
                    println!("  {}", format_fingerprint(fingerprint));
                }
            }
            Ok(())
        }
        Command::Fingerprint { cert } => {
            let bytes = std::fs::read(&cert)
                .with_context(|| format!("failed to read {}", cert.display()))?;
            println!("{}", format_fingerprint(&fingerprint_of(&bytes)));
            Ok(())
        }
        Command::RecordUse { app_id, store } => {
            let path = store.unwrap_or_else(|| config.frecency.store_path.clone());
            let mut store = FrecencyStore::load(&path)?;
            let record = store.record_use(&app_id, chrono::Utc::now().timestamp_millis());
            store.flush()?;
            println!("{app_id}: {} uses", record.use_count);
            Ok(())
        }
        Command::Usage { store } => {
            let path = store.unwrap_or_else(|| config.frecency.store_path.clone());
            let store = FrecencyStore::load(&path)?;
            let now = chrono::Utc::now().timestamp_millis();
            let mut records: Vec<_> = store.records().collect();
            records.sort_by(|a, b| frecency_score(b.1, now).total_cmp(&frecency_score(a.1, now)));
            if records.is_empty() {
                println!("No recorded usage in {}", path.display());
            }
            for (id, record) in records {
                let last_use = chrono::DateTime::from_timestamp_millis(record.last_use_date)
                    .filter(|_| record.last_use_date > 0)
                    .map(|date| date.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!("{id}\t{} uses\tlast used {last_use}", record.use_count);
            }
            Ok(())
        }
    }
}

fn read_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

async fn run_find(
    config: &Config,
    inventory: &Path,
    methods: &[String],
    origin: Option<Url>,
    twa: Option<String>,
    options: PaymentOptions,
    store_path: &Path,
) -> anyhow::Result<()> {
    let package_manager = Arc::new(InMemoryPackageManager::new());
    let installed = package_manager
        .load_inventory(&read_file(inventory)?)
        .with_context(|| format!("invalid inventory {}", inventory.display()))?;
    tracing::info!(apps = installed, "Loaded app inventory");

    let context = match origin {
        Some(origin) => BrowsingContext::new(origin.origin()),
        None => BrowsingContext::for_test(),
    };
    let method_refs: Vec<&str> = methods.iter().map(String::as_str).collect();
    let mut params = PaymentRequestParams::new(context, &method_refs);
    params.options = options;
    params.twa_package_name = twa;

    let mut service = PaymentAppService::new();
    service.add_factory(Arc::new(AndroidPaymentAppFactory::new(
        package_manager as Arc<dyn PackageManagerDelegate>,
        config.downloader.clone(),
        config.finder.clone(),
    )));

    let store = FrecencyStore::load(store_path)?.into_shared();
    let mut session = PaymentRequestSession::new(params, service, store, Arc::new(AllowAllCspChecker));
    session.start().await?;

    for error in session.creation_errors() {
        eprintln!("warning: {}", error.message);
    }
    let shown = session.show().map(|app| app.map(|a| a.identifier.clone()));
    match shown {
        Ok(preselected) => {
            for (index, app) in session.apps().iter().enumerate() {
                let marker = if preselected.as_deref() == Some(app.identifier.as_str()) {
                    "*"
                } else {
                    " "
                };
                let methods: Vec<&str> = app.supported_methods.iter().map(String::as_str).collect();
                println!(
                    "{marker}{}. {} ({}) methods=[{}] ready={} preferred={}",
                    index + 1,
                    app.label,
                    app.identifier,
                    methods.join(", "),
                    app.ready_to_pay,
                    app.preferred
                );
            }
            session.dismiss();
            Ok(())
        }
        Err(e) => {
            println!("{e}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_find_arguments() {
        let cli = Cli::try_parse_from([
            "payment-app-finder",
            "find",
            "--inventory",
            "apps.json",
            "--method",
            "https://bobpay.test/webpay",
            "--method",
            "basic-card",
            "--twa",
            "com.merchant.twa",
            "--request-shipping",
        ])
        .unwrap();
        match cli.command {
            Command::Find {
                methods,
                twa,
                request_shipping,
                request_payer_name,
                ..
            } => {
                assert_eq!(methods, vec!["https://bobpay.test/webpay", "basic-card"]);
                assert_eq!(twa.as_deref(), Some("com.merchant.twa"));
                assert!(request_shipping);
                assert!(!request_payer_name);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn find_requires_a_method() {
        assert!(Cli::try_parse_from(["payment-app-finder", "find", "--inventory", "apps.json"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["payment-app-finder", "usage", "--log-json"]).unwrap();
        assert!(cli.log_json);
        assert!(matches!(cli.command, Command::Usage { store: None }));
    }
}
