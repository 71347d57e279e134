//! Live payment gateway client.
//!
//! Production `reqwest` implementation of [`PaymentGateway`] with secure
//! access-token handling and a bounded request timeout. Read calls absorb
//! non-2xx responses as "no data": the reconciliation that triggered them
//! simply does not apply the event, and recovery comes from the gateway's
//! webhook retries or the next poll. There is deliberately no retry loop
//! here.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

use crate::error::{BillingError, Result};
use crate::gateway::{CheckoutPreference, GatewayPayment, PaymentGateway, PreferenceRequest};

/// Configuration for the live gateway client.
#[derive(Debug, Clone)]
pub struct LiveGatewayConfig {
    /// Gateway API base URL.
    pub base_url: String,
    /// Request timeout in seconds. Applies to every call; there is no retry
    /// inside a reconciliation.
    pub timeout_seconds: u64,
}

impl Default for LiveGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.mercadopago.com".to_string(),
            timeout_seconds: 10,
        }
    }
}

impl LiveGatewayConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Error returned when access-token validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidAccessTokenError {
    pub reason: String,
}

impl std::fmt::Display for InvalidAccessTokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid gateway access token: {}", self.reason)
    }
}

impl std::error::Error for InvalidAccessTokenError {}

/// Validate a gateway access token.
///
/// Valid formats:
/// - `APP_USR-*` - production token
/// - `TEST-*` - sandbox token
fn validate_access_token(token: &str) -> std::result::Result<(), InvalidAccessTokenError> {
    const MIN_TOKEN_LENGTH: usize = 16;

    if token.is_empty() {
        return Err(InvalidAccessTokenError {
            reason: "access token cannot be empty".to_string(),
        });
    }

    if token.len() < MIN_TOKEN_LENGTH {
        return Err(InvalidAccessTokenError {
            reason: format!("access token too short (minimum {} characters)", MIN_TOKEN_LENGTH),
        });
    }

    if !token.starts_with("APP_USR-") && !token.starts_with("TEST-") {
        return Err(InvalidAccessTokenError {
            reason: "access token must start with APP_USR- or TEST-".to_string(),
        });
    }

    Ok(())
}

/// Live gateway client.
#[derive(Clone)]
pub struct LiveGateway {
    client: reqwest::Client,
    config: LiveGatewayConfig,
    access_token: SecretString,
}

impl LiveGateway {
    /// Create a new live gateway client.
    ///
    /// The access token is validated and stored securely; it won't appear in
    /// debug output.
    pub fn new(
        access_token: impl Into<SecretString>,
        config: LiveGatewayConfig,
    ) -> std::result::Result<Self, InvalidAccessTokenError> {
        let access_token: SecretString = access_token.into();
        validate_access_token(access_token.expose_secret())?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| InvalidAccessTokenError {
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            config,
            access_token,
        })
    }

    /// Create a client with default configuration.
    pub fn with_default_config(
        access_token: impl Into<SecretString>,
    ) -> std::result::Result<Self, InvalidAccessTokenError> {
        Self::new(access_token, LiveGatewayConfig::default())
    }

    /// Check if the client is using a sandbox token.
    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        self.access_token.expose_secret().starts_with("TEST-")
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token.expose_secret())
    }

    /// Perform a GET, absorbing non-2xx into `Ok(None)`.
    async fn get_json(&self, url: &str) -> Result<Option<serde_json::Value>> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    target: "billing::gateway",
                    url = %url,
                    error = %err,
                    "gateway request failed"
                );
                return Ok(None);
            }
        };

        if !response.status().is_success() {
            tracing::warn!(
                target: "billing::gateway",
                url = %url,
                status = response.status().as_u16(),
                "gateway returned non-2xx; treating as no data"
            );
            return Ok(None);
        }

        match response.json().await {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                tracing::warn!(
                    target: "billing::gateway",
                    url = %url,
                    error = %err,
                    "gateway returned unparseable body"
                );
                Ok(None)
            }
        }
    }
}

// Debug implementation that doesn't expose the access token.
impl std::fmt::Debug for LiveGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveGateway")
            .field("config", &self.config)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

/// Build the preference creation body.
fn preference_body(request: &PreferenceRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "external_reference": request.external_reference,
        "items": [{
            "title": request.title,
            "quantity": 1,
            "unit_price": request.unit_price_cents as f64 / 100.0,
            "currency_id": request.currency.to_uppercase(),
        }],
        "payer": {"email": request.payer_email},
        "back_urls": {
            "success": request.success_url,
            "failure": request.failure_url,
        },
        "auto_return": "approved",
    });
    if let Some(ref url) = request.notification_url {
        body["notification_url"] = serde_json::Value::String(url.clone());
    }
    body
}

/// Parse a created preference out of the gateway response.
fn parse_preference(value: &serde_json::Value) -> Option<CheckoutPreference> {
    let id = value.get("id")?.as_str()?.to_string();
    let init_point = value.get("init_point")?.as_str()?.to_string();
    Some(CheckoutPreference { id, init_point })
}

#[async_trait]
impl PaymentGateway for LiveGateway {
    async fn get_payment(&self, payment_id: &str) -> Result<Option<GatewayPayment>> {
        let url = format!("{}/v1/payments/{}", self.config.base_url, payment_id);
        let Some(value) = self.get_json(&url).await? else {
            return Ok(None);
        };
        Ok(GatewayPayment::from_json(value))
    }

    async fn search_by_reference(&self, external_reference: &str) -> Result<Vec<GatewayPayment>> {
        let url = format!(
            "{}/v1/payments/search?external_reference={}",
            self.config.base_url, external_reference
        );
        let Some(value) = self.get_json(&url).await? else {
            return Ok(Vec::new());
        };

        let results = value
            .get("results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(results
            .into_iter()
            .filter_map(GatewayPayment::from_json)
            .collect())
    }

    async fn create_preference(&self, request: &PreferenceRequest) -> Result<CheckoutPreference> {
        let url = format!("{}/checkout/preferences", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .json(&preference_body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                target: "billing::gateway",
                status = status.as_u16(),
                body = %body,
                "preference creation failed"
            );
            return Err(BillingError::service_unavailable(format!(
                "gateway refused preference creation (HTTP {})",
                status.as_u16()
            )));
        }

        let value: serde_json::Value = response.json().await?;
        parse_preference(&value).ok_or_else(|| {
            BillingError::internal("gateway preference response missing id/init_point")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_validation() {
        assert!(validate_access_token("APP_USR-1234567890abcdef").is_ok());
        assert!(validate_access_token("TEST-1234567890abcdef").is_ok());

        assert!(validate_access_token("").is_err());
        assert!(validate_access_token("TEST-short").is_err());
        assert!(validate_access_token("sk_live_1234567890abcdef").is_err());
    }

    #[test]
    fn test_client_modes_and_redacted_debug() {
        let sandbox =
            LiveGateway::with_default_config("TEST-1234567890abcdef".to_string()).unwrap();
        assert!(sandbox.is_test_mode());

        let production =
            LiveGateway::with_default_config("APP_USR-1234567890abcdef".to_string()).unwrap();
        assert!(!production.is_test_mode());

        let debug = format!("{:?}", production);
        assert!(!debug.contains("APP_USR"));
    }

    #[test]
    fn test_preference_body_shape() {
        let request = PreferenceRequest {
            external_reference: "pay-1".to_string(),
            title: "Tapfolio pro subscription".to_string(),
            unit_price_cents: 9_900,
            currency: "usd".to_string(),
            payer_email: "buyer@example.com".to_string(),
            success_url: "https://tapfolio.app/billing/success".to_string(),
            failure_url: "https://tapfolio.app/billing/failure".to_string(),
            notification_url: Some("https://tapfolio.app/api/webhooks/payments".to_string()),
        };

        let body = preference_body(&request);
        assert_eq!(body["external_reference"], "pay-1");
        assert_eq!(body["items"][0]["unit_price"], 99.0);
        assert_eq!(body["items"][0]["currency_id"], "USD");
        assert_eq!(body["payer"]["email"], "buyer@example.com");
        assert_eq!(
            body["notification_url"],
            "https://tapfolio.app/api/webhooks/payments"
        );

        let without_notification = PreferenceRequest {
            notification_url: None,
            ..request
        };
        let body = preference_body(&without_notification);
        assert!(body.get("notification_url").is_none());
    }

    #[test]
    fn test_parse_preference() {
        let value = serde_json::json!({
            "id": "pref-123",
            "init_point": "https://gateway.example.com/checkout/pref-123",
            "unrelated": true,
        });
        let preference = parse_preference(&value).unwrap();
        assert_eq!(preference.id, "pref-123");
        assert!(preference.init_point.ends_with("pref-123"));

        assert!(parse_preference(&serde_json::json!({"id": "x"})).is_none());
    }
}
