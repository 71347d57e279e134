//! Inbound webhook handling.
//!
//! Parses gateway notifications, filters non-payment events, attempts
//! signature verification, and hands the payment id to the reconciler.
//!
//! Signature verification is advisory: a mismatch is logged as a warning and
//! does not block processing, because the authoritative status comes from
//! the follow-up read against the gateway's own API, not from trusting the
//! push body. Malformed bodies are logged and dropped, never errors: the
//! gateway will redeliver and the poll path exists as a backstop.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::audit::BillingAuditLogger;
use crate::error::Result;
use crate::gateway::PaymentGateway;
use crate::mailer::Mailer;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::storage::BillingStore;

/// Parsed webhook notification body.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookNotification {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub action: Option<String>,
    pub data: Option<WebhookData>,
}

/// Webhook notification data.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    /// The gateway's payment id; arrives as a string or a number.
    pub id: Option<serde_json::Value>,
}

impl WebhookNotification {
    /// Whether this notification is about a payment.
    #[must_use]
    pub fn is_payment_event(&self) -> bool {
        self.event_type.as_deref() == Some("payment")
            || self
                .action
                .as_deref()
                .is_some_and(|a| a.starts_with("payment."))
    }

    /// Extract the gateway payment id, if present.
    #[must_use]
    pub fn data_id(&self) -> Option<String> {
        match self.data.as_ref()?.id.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Outcome of webhook processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event was fed to the reconciler.
    Processed(ReconcileOutcome),
    /// Not a payment event, or the body could not be used; logged and dropped.
    Ignored,
}

/// Webhook handler for gateway notifications.
pub struct WebhookHandler<S, G, M, A>
where
    S: BillingStore,
    G: PaymentGateway,
    M: Mailer,
    A: BillingAuditLogger,
{
    reconciler: Reconciler<S, G, M, A>,
    secret: Option<SecretString>,
}

impl<S, G, M, A> WebhookHandler<S, G, M, A>
where
    S: BillingStore,
    G: PaymentGateway,
    M: Mailer,
    A: BillingAuditLogger,
{
    /// Create a new webhook handler.
    ///
    /// With `secret = None`, signature verification is skipped entirely.
    #[must_use]
    pub fn new(reconciler: Reconciler<S, G, M, A>, secret: Option<SecretString>) -> Self {
        Self { reconciler, secret }
    }

    /// Process a raw webhook delivery.
    ///
    /// `signature` is the `x-signature` header (`ts=...,v1=...`) and
    /// `request_id` the `x-request-id` header, when present.
    pub async fn handle(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<WebhookOutcome> {
        let notification: WebhookNotification = match serde_json::from_slice(payload) {
            Ok(notification) => notification,
            Err(err) => {
                tracing::warn!(
                    target: "billing::webhook",
                    error = %err,
                    "malformed webhook payload; dropped"
                );
                return Ok(WebhookOutcome::Ignored);
            }
        };

        if !notification.is_payment_event() {
            tracing::debug!(
                target: "billing::webhook",
                event_type = notification.event_type.as_deref().unwrap_or(""),
                action = notification.action.as_deref().unwrap_or(""),
                "non-payment webhook ignored"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        let Some(data_id) = notification.data_id() else {
            tracing::warn!(
                target: "billing::webhook",
                "payment webhook without data.id; dropped"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        if let Some(secret) = &self.secret {
            let verified = signature
                .is_some_and(|sig| verify_signature(secret, &data_id, sig, request_id));
            if !verified {
                // Advisory only: the reconciler re-establishes trust by
                // reading the payment from the gateway directly.
                tracing::warn!(
                    target: "billing::webhook",
                    gateway_payment_id = %data_id,
                    "webhook signature missing or mismatched; processing anyway"
                );
            }
        }

        let outcome = self.reconciler.process_payment_id(&data_id).await?;
        Ok(WebhookOutcome::Processed(outcome))
    }
}

/// Parsed signature header parts.
struct SignatureParts {
    timestamp: String,
    signature: String,
}

/// Parse the `x-signature` header (`ts=<unix>,v1=<hex>`).
fn parse_signature_header(header: &str) -> Option<SignatureParts> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let (key, value) = part.split_once('=')?;
        match key.trim() {
            "ts" => timestamp = Some(value.trim().to_string()),
            "v1" => signature = Some(value.trim().to_string()),
            _ => {}
        }
    }

    Some(SignatureParts {
        timestamp: timestamp?,
        signature: signature?,
    })
}

/// The signed manifest: `id:<data.id>;request-id:<rid>;ts:<ts>;`.
fn signature_manifest(data_id: &str, request_id: Option<&str>, timestamp: &str) -> String {
    format!(
        "id:{};request-id:{};ts:{};",
        data_id.to_lowercase(),
        request_id.unwrap_or(""),
        timestamp
    )
}

/// Compute HMAC-SHA256 over the manifest, hex-encoded.
fn compute_signature(secret: &str, manifest: &str) -> Option<String> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(manifest.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature header against the configured secret (constant-time).
fn verify_signature(
    secret: &SecretString,
    data_id: &str,
    header: &str,
    request_id: Option<&str>,
) -> bool {
    let Some(parts) = parse_signature_header(header) else {
        return false;
    };

    let manifest = signature_manifest(data_id, request_id, &parts.timestamp);
    let Some(expected) = compute_signature(secret.expose_secret(), &manifest) else {
        return false;
    };

    let Ok(expected_bytes) = hex::decode(&expected) else {
        return false;
    };
    let Ok(provided_bytes) = hex::decode(&parts.signature) else {
        return false;
    };

    expected_bytes.ct_eq(&provided_bytes).unwrap_u8() == 1
}
