//! Full payment request flow: discovery from several factories, frecency
//! ranking, completion, and persisted usage.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use url::Url;

use payment_app_finder::app::{
    FactorySpeed, MockPaymentAppInstaller, PaymentAppService, PaymentRequestParams,
};
use payment_app_finder::config::{DownloaderConfig, FinderConfig};
use payment_app_finder::error::PaymentRequestError;
use payment_app_finder::finder::AndroidPaymentAppFactory;
use payment_app_finder::manifest::{AllowAllCspChecker, BrowsingContext};
use payment_app_finder::package::InMemoryPackageManager;
use payment_app_finder::ranking::FrecencyStore;
use payment_app_finder::session::{PaymentComplete, PaymentRequestSession};

use common::{Fixture, FixtureServer, certificate, method_manifest, web_app_manifest};

const METHOD: &str = "https://pay.test/webpay";
const BOBPAY: &str = "https://bobpay.test/webpay";
const BOB_CERT: &str = "b0b0b0b0b0b0b0b0";

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const NOW_MS: i64 = 1_760_000_000_000;

fn fixed_clock() -> i64 {
    NOW_MS
}

fn params(methods: &[&str]) -> PaymentRequestParams {
    PaymentRequestParams::new(
        BrowsingContext::new(Url::parse("https://merchant.test").unwrap().origin()),
        methods,
    )
}

fn mock_service() -> PaymentAppService {
    let mut service = PaymentAppService::new();
    service.add_factory(Arc::new(
        MockPaymentAppInstaller::new("wallets")
            .add_app("alice", METHOD)
            .add_app("bob", METHOD)
            .speed(FactorySpeed::Slow(Duration::from_millis(20)))
            .build(),
    ));
    service.add_factory(Arc::new(
        MockPaymentAppInstaller::new("cards").add_app("charlie", METHOD).build(),
    ));
    service
}

fn identifiers(session: &PaymentRequestSession) -> Vec<&str> {
    session.apps().iter().map(|app| app.identifier.as_str()).collect()
}

#[tokio::test]
async fn usage_history_drives_ranking_and_completion_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frecency.json");

    let mut store = FrecencyStore::load(&path).unwrap();
    for (id, count) in [("alice", 5), ("bob", 10), ("charlie", 15)] {
        store.set_use_count(id, count);
        store.set_last_use_date(id, NOW_MS - DAY_MS);
    }
    store.flush().unwrap();

    let mut session = PaymentRequestSession::new(
        params(&[METHOD]),
        mock_service(),
        FrecencyStore::load(&path).unwrap().into_shared(),
        Arc::new(AllowAllCspChecker),
    )
    .with_clock(fixed_clock);
    session.start().await.unwrap();
    assert_eq!(identifiers(&session), vec!["charlie", "bob", "alice"]);
    session.dismiss();

    let mut store = FrecencyStore::load(&path).unwrap();
    store.set_use_count("alice", 20);
    store.flush().unwrap();

    let mut session = PaymentRequestSession::new(
        params(&[METHOD]),
        mock_service(),
        FrecencyStore::load(&path).unwrap().into_shared(),
        Arc::new(AllowAllCspChecker),
    )
    .with_clock(fixed_clock);
    session.start().await.unwrap();
    assert_eq!(identifiers(&session), vec!["alice", "charlie", "bob"]);

    let preselected = session.show().unwrap().map(|app| app.identifier.clone());
    assert_eq!(preselected.as_deref(), Some("alice"));
    session.complete(PaymentComplete::Success).unwrap();
    assert!(session.is_closed());

    let store = FrecencyStore::load(&path).unwrap();
    assert_eq!(store.get("alice").use_count, 21);
    assert_eq!(store.get("alice").last_use_date, NOW_MS);
    assert_eq!(store.get("bob").use_count, 10);
    assert_eq!(store.get("charlie").use_count, 15);
    assert_eq!(store.get("charlie").last_use_date, NOW_MS - DAY_MS);
}

#[tokio::test]
async fn failed_payment_records_nothing() {
    let store = FrecencyStore::in_memory().into_shared();
    let mut session = PaymentRequestSession::new(
        params(&[METHOD]),
        mock_service(),
        Arc::clone(&store),
        Arc::new(AllowAllCspChecker),
    )
    .with_clock(fixed_clock);
    session.start().await.unwrap();
    session.show().unwrap();
    session.select("bob").unwrap();
    session.complete(PaymentComplete::Fail).unwrap();

    assert!(store.lock().unwrap().is_empty());
    assert_eq!(session.abort(), Err(PaymentRequestError::Closed));
}

#[tokio::test]
async fn no_matching_apps_is_not_supported() {
    let mut session = PaymentRequestSession::new(
        params(&["https://nobody.test/pay", "basic-card"]),
        mock_service(),
        FrecencyStore::in_memory().into_shared(),
        Arc::new(AllowAllCspChecker),
    );
    session.start().await.unwrap();
    assert!(!session.can_make_payment());

    assert_eq!(
        session.show().map(|app| app.cloned()),
        Err(PaymentRequestError::NotSupported(
            "The payment methods \"basic-card\", \"https://nobody.test/pay\" are not supported."
                .to_string()
        ))
    );
    assert!(session.is_closed());
}

#[tokio::test]
async fn android_and_mock_apps_share_one_ranking() {
    let server = FixtureServer::start(vec![
        (
            "bobpay.test/webpay",
            Fixture::ok(method_manifest(&["https://bobpay.test/app.json"], &[])),
        ),
        (
            "bobpay.test/app.json",
            Fixture::ok(web_app_manifest(&[("com.bobpay", "1", &[BOB_CERT])])),
        ),
    ])
    .await;
    let pm = Arc::new(InMemoryPackageManager::new());
    pm.install_payment_app("BobPay", "com.bobpay", Some(BOBPAY), Some(&certificate(BOB_CERT)));

    let finder_config = FinderConfig {
        bypass_is_ready_to_pay: true,
        ..FinderConfig::default()
    };
    let mut service = mock_service();
    service.add_factory(Arc::new(
        AndroidPaymentAppFactory::new(pm, DownloaderConfig::default(), finder_config)
            .with_url_rewrite(server.rewrite()),
    ));

    let mut store = FrecencyStore::in_memory();
    store.set_use_count("com.bobpay", 3);
    store.set_last_use_date("com.bobpay", NOW_MS);

    let mut session = PaymentRequestSession::new(
        params(&[METHOD, BOBPAY]),
        service,
        store.into_shared(),
        Arc::new(AllowAllCspChecker),
    )
    .with_clock(fixed_clock);
    session.start().await.unwrap();

    assert_eq!(identifiers(&session)[0], "com.bobpay");
    assert_eq!(session.apps().len(), 4);
    assert!(session.creation_errors().is_empty());
    assert!(session.has_enrolled_instrument());
}
