//! Payment gateway client traits and wire types.
//!
//! The gateway is an opaque HTTP collaborator. Reads that fail with non-2xx
//! responses are logged and surfaced as "no data"; the reconciler treats a
//! missing payment as a dropped event and relies on the gateway's own retry
//! policy plus the poll path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;

/// A payment object as returned by the gateway's read API.
///
/// Parsed field-by-field from the raw JSON; the full object is kept in `raw`
/// and persisted as the settlement snapshot.
#[derive(Debug, Clone)]
pub struct GatewayPayment {
    /// The gateway's payment id.
    pub id: String,
    /// The gateway's status vocabulary, unmapped.
    pub status: String,
    /// The internal payment id we passed at checkout, echoed back.
    pub external_reference: Option<String>,
    pub payer_email: Option<String>,
    pub date_approved: Option<DateTime<Utc>>,
    /// The full gateway payment object.
    pub raw: serde_json::Value,
}

impl GatewayPayment {
    /// Build from a raw gateway payment object.
    ///
    /// Returns `None` when the object has no id, which is the only field the
    /// reconciler cannot proceed without.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;

        // Gateways disagree on whether ids are numbers or strings.
        let id = match obj.get("id") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return None,
        };

        let status = obj
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let external_reference = obj
            .get("external_reference")
            .and_then(|v| v.as_str())
            .map(String::from);

        let payer_email = obj
            .get("payer")
            .and_then(|v| v.get("email"))
            .and_then(|v| v.as_str())
            .map(String::from);

        let date_approved = obj
            .get("date_approved")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Some(Self {
            id,
            status,
            external_reference,
            payer_email,
            date_approved,
            raw: value,
        })
    }
}

/// Request to create a checkout preference (the gateway's checkout session).
#[derive(Debug, Clone, Serialize)]
pub struct PreferenceRequest {
    /// The internal payment id, passed through so the gateway's asynchronous
    /// callback can be joined back to internal state.
    pub external_reference: String,
    pub title: String,
    pub unit_price_cents: i64,
    pub currency: String,
    pub payer_email: String,
    pub success_url: String,
    pub failure_url: String,
    pub notification_url: Option<String>,
}

/// A created checkout preference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutPreference {
    /// The gateway's session id, persisted onto the payment row.
    pub id: String,
    /// Where to redirect the buyer.
    pub init_point: String,
}

/// Client for the payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Fetch a payment by the gateway's payment id.
    ///
    /// Non-2xx responses and timeouts resolve to `Ok(None)`: the event is
    /// simply not applied and will be retried by the gateway or the next
    /// poll.
    async fn get_payment(&self, payment_id: &str) -> Result<Option<GatewayPayment>>;

    /// Search payments by external reference (our internal payment id).
    ///
    /// Non-2xx responses resolve to an empty list.
    async fn search_by_reference(&self, external_reference: &str) -> Result<Vec<GatewayPayment>>;

    /// Create a checkout preference.
    ///
    /// Unlike the read paths, failures here surface as errors: the caller
    /// needs a redirect URL or nothing.
    async fn create_preference(&self, request: &PreferenceRequest) -> Result<CheckoutPreference>;
}

/// Mock gateway for testing.
#[cfg(any(test, feature = "test-util"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};

    /// In-memory mock of [`PaymentGateway`].
    #[derive(Default, Clone)]
    pub struct MockGateway {
        inner: Arc<MockGatewayInner>,
    }

    #[derive(Default)]
    struct MockGatewayInner {
        payments: RwLock<HashMap<String, GatewayPayment>>,
        preferences: RwLock<Vec<PreferenceRequest>>,
        unreachable: RwLock<bool>,
    }

    impl MockGateway {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a payment the gateway will return.
        pub fn add_payment(&self, payment: GatewayPayment) {
            self.inner
                .payments
                .write()
                .unwrap()
                .insert(payment.id.clone(), payment);
        }

        /// Convenience: register a payment from its parts.
        pub fn add_payment_json(&self, id: &str, status: &str, external_reference: Option<&str>) {
            let mut value = serde_json::json!({
                "id": id,
                "status": status,
                "payer": {"email": "buyer@example.com"},
                "date_approved": Utc::now().to_rfc3339(),
            });
            if let Some(reference) = external_reference {
                value["external_reference"] = serde_json::Value::String(reference.to_string());
            }
            self.add_payment(GatewayPayment::from_json(value).unwrap());
        }

        /// Make all read calls behave as if the gateway returned non-2xx.
        pub fn set_unreachable(&self, unreachable: bool) {
            *self.inner.unreachable.write().unwrap() = unreachable;
        }

        /// Preferences created so far.
        pub fn created_preferences(&self) -> Vec<PreferenceRequest> {
            self.inner.preferences.read().unwrap().clone()
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn get_payment(&self, payment_id: &str) -> Result<Option<GatewayPayment>> {
            if *self.inner.unreachable.read().unwrap() {
                return Ok(None);
            }
            Ok(self.inner.payments.read().unwrap().get(payment_id).cloned())
        }

        async fn search_by_reference(
            &self,
            external_reference: &str,
        ) -> Result<Vec<GatewayPayment>> {
            if *self.inner.unreachable.read().unwrap() {
                return Ok(Vec::new());
            }
            Ok(self
                .inner
                .payments
                .read()
                .unwrap()
                .values()
                .filter(|p| p.external_reference.as_deref() == Some(external_reference))
                .cloned()
                .collect())
        }

        async fn create_preference(
            &self,
            request: &PreferenceRequest,
        ) -> Result<CheckoutPreference> {
            if *self.inner.unreachable.read().unwrap() {
                return Err(crate::error::BillingError::service_unavailable(
                    "mock gateway unreachable",
                ));
            }
            self.inner.preferences.write().unwrap().push(request.clone());
            let id = format!("pref-{}", request.external_reference);
            Ok(CheckoutPreference {
                init_point: format!("https://gateway.example.com/checkout/{}", id),
                id,
            })
        }
    }
}
