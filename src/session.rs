//! One payment request from discovery to completion.
//!
//! `start` runs every factory and ranks the apps, `show` pre-selects the
//! first eligible app, and `complete`, `abort` or `dismiss` end the session.
//! Only a successful completion counts as a use of the selected app.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use crate::app::{AppCreationError, PaymentApp, PaymentAppService, PaymentRequestParams};
use crate::error::PaymentRequestError;
use crate::manifest::CspChecker;
use crate::ranking::{self, SharedFrecencyStore};

/// Merchant-reported outcome of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentComplete {
    Success,
    Fail,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Created,
    Ready,
    Shown,
    Closed,
}

/// Milliseconds since the Unix epoch.
pub type Clock = fn() -> i64;

fn system_clock() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A payment request session.
pub struct PaymentRequestSession {
    params: PaymentRequestParams,
    service: PaymentAppService,
    store: SharedFrecencyStore,
    csp_checker: Arc<dyn CspChecker>,
    closed: Arc<AtomicBool>,
    state: SessionState,
    apps: Vec<PaymentApp>,
    errors: Vec<AppCreationError>,
    selected: Option<usize>,
    clock: Clock,
}

impl PaymentRequestSession {
    pub fn new(
        params: PaymentRequestParams,
        service: PaymentAppService,
        store: SharedFrecencyStore,
        csp_checker: Arc<dyn CspChecker>,
    ) -> Self {
        Self {
            params,
            service,
            store,
            csp_checker,
            closed: Arc::new(AtomicBool::new(false)),
            state: SessionState::Created,
            apps: Vec::new(),
            errors: Vec::new(),
            selected: None,
            clock: system_clock,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Flag that closes the session when set, usable from other tasks.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed || self.closed.load(Ordering::SeqCst)
    }

    /// Discover and rank apps.
    pub async fn start(&mut self) -> Result<(), PaymentRequestError> {
        if self.is_closed() {
            return Err(PaymentRequestError::Closed);
        }
        let result = self
            .service
            .create(&self.params, Arc::clone(&self.csp_checker), Arc::clone(&self.closed))
            .await;
        if self.is_closed() {
            tracing::debug!("Payment request dismissed during app discovery");
            return Err(PaymentRequestError::Closed);
        }

        let now = (self.clock)();
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        self.apps = ranking::rank(result.apps, &*store, now);
        drop(store);
        self.errors = result.errors;
        self.state = SessionState::Ready;
        tracing::info!(apps = self.apps.len(), "Payment request ready");
        Ok(())
    }

    /// Ranked apps.
    pub fn apps(&self) -> &[PaymentApp] {
        &self.apps
    }

    pub fn creation_errors(&self) -> &[AppCreationError] {
        &self.errors
    }

    pub fn can_make_payment(&self) -> bool {
        !self.apps.is_empty()
    }

    pub fn has_enrolled_instrument(&self) -> bool {
        self.apps.iter().any(|app| app.ready_to_pay)
    }

    pub fn selected_app(&self) -> Option<&PaymentApp> {
        self.selected.and_then(|index| self.apps.get(index))
    }

    /// Show the payment sheet and return the pre-selected app, if any.
    pub fn show(&mut self) -> Result<Option<&PaymentApp>, PaymentRequestError> {
        match self.state {
            SessionState::Closed => return Err(PaymentRequestError::Closed),
            _ if self.closed.load(Ordering::SeqCst) => return Err(PaymentRequestError::Closed),
            SessionState::Created => return Err(PaymentRequestError::NotShown),
            SessionState::Ready | SessionState::Shown => {}
        }
        if self.apps.is_empty() {
            let message = not_supported_message(&self.params.requested_methods());
            self.close();
            return Err(PaymentRequestError::NotSupported(message));
        }

        self.selected = ranking::preselected_index(&self.apps);
        self.state = SessionState::Shown;
        Ok(self.selected_app())
    }

    /// Choose the app to pay with.
    pub fn select(&mut self, identifier: &str) -> Result<(), PaymentRequestError> {
        self.ensure_shown()?;
        let index = self
            .apps
            .iter()
            .position(|app| app.identifier == identifier)
            .ok_or_else(|| PaymentRequestError::UnknownApp(identifier.to_string()))?;
        self.selected = Some(index);
        Ok(())
    }

    /// Finish the payment. Only `Success` records a use of the selected app.
    pub fn complete(&mut self, result: PaymentComplete) -> Result<(), PaymentRequestError> {
        self.ensure_shown()?;
        let Some(app) = self.selected_app() else {
            return Err(PaymentRequestError::NoSelection);
        };
        let identifier = app.identifier.clone();

        if result == PaymentComplete::Success {
            let now = (self.clock)();
            let record = self
                .store
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record_use(&identifier, now);
            tracing::info!(app = %identifier, use_count = record.use_count, "Payment completed");
        } else {
            tracing::info!(app = %identifier, ?result, "Payment finished without success");
        }
        self.close();
        Ok(())
    }

    /// Merchant-initiated abort. Records nothing.
    pub fn abort(&mut self) -> Result<(), PaymentRequestError> {
        if self.is_closed() {
            return Err(PaymentRequestError::Closed);
        }
        tracing::info!("Payment request aborted");
        self.close();
        Ok(())
    }

    /// User dismissed the sheet. Safe to call at any time, repeatedly.
    pub fn dismiss(&mut self) {
        if self.state != SessionState::Closed {
            tracing::info!("Payment request dismissed");
            self.close();
        }
    }

    fn ensure_shown(&self) -> Result<(), PaymentRequestError> {
        match self.state {
            SessionState::Shown if !self.closed.load(Ordering::SeqCst) => Ok(()),
            SessionState::Shown | SessionState::Closed => Err(PaymentRequestError::Closed),
            SessionState::Created | SessionState::Ready => Err(PaymentRequestError::NotShown),
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state = SessionState::Closed;
        self.selected = None;
        if let Err(e) = self
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
        {
            tracing::warn!("Failed to save payment app usage: {}", e);
        }
    }
}

/// `NotSupportedError` message for `methods`, sorted and quoted.
pub fn not_supported_message(methods: &[&str]) -> String {
    let mut methods: Vec<&str> = methods.to_vec();
    methods.sort_unstable();
    methods.dedup();
    let quoted: Vec<String> = methods.iter().map(|m| format!("\"{m}\"")).collect();
    if quoted.len() == 1 {
        format!("The payment method {} is not supported.", quoted[0])
    } else {
        format!("The payment methods {} are not supported.", quoted.join(", "))
    }
}
