//! Shared harness: a local manifest server and a recording factory delegate.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::Response;
use url::Url;

use payment_app_finder::app::{PaymentApp, PaymentAppFactoryDelegate};
use payment_app_finder::error::AppCreationFailureReason;
use payment_app_finder::manifest::fingerprint::{fingerprint_of, format_fingerprint};
use payment_app_finder::manifest::{AllowAllCspChecker, CspChecker, UrlRewrite};

/// A canned HTTP response.
#[derive(Debug, Clone)]
pub struct Fixture {
    status: StatusCode,
    headers: Vec<(header::HeaderName, String)>,
    body: Vec<u8>,
}

impl Fixture {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: body.into().into_bytes(),
        }
    }

    /// A 200 response with an arbitrary, possibly non-UTF-8, body.
    pub fn raw(body: &[u8]) -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: body.to_vec(),
        }
    }

    /// An empty response with the given status code.
    pub fn status(code: u16) -> Self {
        Self {
            status: StatusCode::from_u16(code).unwrap(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// An HTML page whose `Link` header points at the real manifest.
    pub fn with_manifest_link(target: &str) -> Self {
        Self::ok("<html>payment method</html>").header(
            header::LINK,
            format!("<{target}>; rel=\"payment-method-manifest\""),
        )
    }

    pub fn redirect(location: &str) -> Self {
        Self {
            status: StatusCode::FOUND,
            headers: vec![(header::LOCATION, location.to_string())],
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: header::HeaderName, value: String) -> Self {
        self.headers.push((name, value));
        self
    }
}

/// Serves fixtures keyed by `<host><path>`, e.g. `bobpay.test/webpay`.
pub struct FixtureServer {
    pub addr: SocketAddr,
}

type Fixtures = Arc<HashMap<String, Fixture>>;

async fn serve_fixture(State(fixtures): State<Fixtures>, uri: Uri) -> Response {
    let key = uri.path().trim_start_matches('/');
    let (status, headers, body) = match fixtures.get(key) {
        Some(fixture) => (fixture.status, fixture.headers.clone(), fixture.body.clone()),
        None => (StatusCode::NOT_FOUND, Vec::new(), Vec::new()),
    };
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(body)).unwrap()
}

impl FixtureServer {
    pub async fn start(fixtures: Vec<(&str, Fixture)>) -> Self {
        let fixtures: HashMap<String, Fixture> = fixtures
            .into_iter()
            .map(|(key, fixture)| (key.to_string(), fixture))
            .collect();
        let app = Router::new()
            .fallback(serve_fixture)
            .with_state(Arc::new(fixtures));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr }
    }

    /// Maps `https://<host>/<path>` onto this server.
    pub fn rewrite(&self) -> UrlRewrite {
        let addr = self.addr;
        Arc::new(move |url: &Url| {
            let local = format!("http://{addr}/{}{}", url.host_str().unwrap_or_default(), url.path());
            Url::parse(&local).unwrap()
        })
    }
}

/// Raw certificate bytes for a hex signature string.
pub fn certificate(signature_hex: &str) -> Vec<u8> {
    hex::decode(signature_hex).unwrap()
}

/// Colon-hex SHA-256 fingerprint of a hex signature string.
pub fn fingerprint(signature_hex: &str) -> String {
    format_fingerprint(&fingerprint_of(&certificate(signature_hex)))
}

/// A web-app manifest with one `play` entry per `(package, min_version, signatures)`.
pub fn web_app_manifest(apps: &[(&str, &str, &[&str])]) -> String {
    let related: Vec<serde_json::Value> = apps
        .iter()
        .map(|(id, min_version, signatures)| {
            serde_json::json!({
                "platform": "play",
                "id": id,
                "min_version": min_version,
                "fingerprints": signatures
                    .iter()
                    .map(|sig| serde_json::json!({"type": "sha256_cert", "value": fingerprint(sig)}))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    serde_json::json!({ "related_applications": related }).to_string()
}

pub fn method_manifest(default_applications: &[&str], supported_origins: &[&str]) -> String {
    serde_json::json!({
        "default_applications": default_applications,
        "supported_origins": supported_origins,
    })
    .to_string()
}

/// Records everything a factory reports.
pub struct RecordingDelegate {
    csp_checker: Arc<dyn CspChecker>,
    pub apps: Mutex<Vec<PaymentApp>>,
    pub errors: Mutex<Vec<(String, AppCreationFailureReason)>>,
    pub done: Mutex<u32>,
}

impl Default for RecordingDelegate {
    fn default() -> Self {
        Self::with_csp_checker(Arc::new(AllowAllCspChecker))
    }
}

impl RecordingDelegate {
    pub fn with_csp_checker(csp_checker: Arc<dyn CspChecker>) -> Self {
        Self {
            csp_checker,
            apps: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            done: Mutex::new(0),
        }
    }

    pub fn app(&self, identifier: &str) -> Option<PaymentApp> {
        self.apps
            .lock()
            .unwrap()
            .iter()
            .find(|app| app.identifier == identifier)
            .cloned()
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.apps
            .lock()
            .unwrap()
            .iter()
            .map(|app| app.identifier.clone())
            .collect()
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors
            .lock()
            .unwrap()
            .iter()
            .map(|(message, _)| message.clone())
            .collect()
    }
}

impl PaymentAppFactoryDelegate for RecordingDelegate {
    fn csp_checker(&self) -> Arc<dyn CspChecker> {
        Arc::clone(&self.csp_checker)
    }

    fn on_payment_app_created(&self, app: PaymentApp) {
        self.apps.lock().unwrap().push(app);
    }

    fn on_payment_app_creation_error(&self, message: String, reason: AppCreationFailureReason) {
        self.errors.lock().unwrap().push((message, reason));
    }

    fn on_done_creating_payment_apps(&self) {
        *self.done.lock().unwrap() += 1;
    }
}
