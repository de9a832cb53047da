//! Best-effort out-of-band audit channel.
//!
//! Notifier failures never propagate into the event path; a failed delivery
//! is logged at warn and dropped.

use alloy::primitives::Address;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

/// An audit record pushed out-of-band.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Short machine-readable kind, e.g. `liquidation_observed`.
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub borrower: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            borrower: None,
            block_number: None,
            detail: detail.into(),
        }
    }

    pub fn with_borrower(mut self, borrower: Address) -> Self {
        self.borrower = Some(borrower);
        self
    }

    pub fn with_block(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }
}

/// Audit sink. Implementations must be infallible from the caller's view.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: AuditEvent);
}

/// Posts audit events to a webhook as JSON.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: AuditEvent) {
        let result = self.client.post(&self.url).json(&event).send().await;

        match result.and_then(|r| r.error_for_status()) {
            Ok(_) => debug!(kind = %event.kind, "Audit event delivered"),
            Err(e) => warn!(kind = %event.kind, error = %e, "Audit delivery failed"),
        }
    }
}

/// Sink used when no webhook is configured; events go to the debug log only.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, event: AuditEvent) {
        debug!(kind = %event.kind, detail = %event.detail, "Audit event (no sink configured)");
    }
}
