//! Billing configuration.
//!
//! Everything environment-specific lives here: the operator whitelist, the
//! price table, the subscription period, and the redirect/notification URLs
//! handed to the payment gateway. The whitelist is injected configuration,
//! never a hard-coded literal, so it stays testable and per-environment.

use std::collections::{HashMap, HashSet};

use url::Url;

use crate::error::{BillingError, Result};
use crate::plans::Plan;

/// Price of a plan, in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanPrice {
    pub amount_cents: i64,
    pub currency: String,
}

/// Configuration for the billing engine.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    whitelist: HashSet<String>,
    prices: HashMap<Plan, PlanPrice>,
    /// Flat subscription term applied on approval; not prorated, not stacking.
    pub subscription_period_days: i64,
    /// From address for confirmation mail.
    pub mail_from: String,
    /// Where the gateway sends the buyer after a successful checkout.
    pub success_url: String,
    /// Where the gateway sends the buyer after an abandoned/failed checkout.
    pub failure_url: String,
    /// Webhook callback URL registered with each checkout session.
    pub notification_url: Option<String>,
}

impl BillingConfig {
    /// Create a builder with defaults.
    #[must_use]
    pub fn builder() -> BillingConfigBuilder {
        BillingConfigBuilder::new()
    }

    /// Check whether an email is on the operator whitelist.
    ///
    /// Comparison is case-insensitive.
    #[must_use]
    pub fn is_whitelisted(&self, email: &str) -> bool {
        self.whitelist.contains(&email.to_lowercase())
    }

    /// Get the configured price for a plan, if any.
    ///
    /// FREE never has a price; a paid plan with no configured price cannot
    /// be checked out.
    #[must_use]
    pub fn price_of(&self, plan: Plan) -> Option<&PlanPrice> {
        self.prices.get(&plan)
    }

    /// The subscription term as a chrono duration.
    #[must_use]
    pub fn subscription_period(&self) -> chrono::Duration {
        chrono::Duration::days(self.subscription_period_days)
    }
}

/// Builder for [`BillingConfig`].
#[must_use = "builder does nothing until you call build()"]
pub struct BillingConfigBuilder {
    whitelist: HashSet<String>,
    prices: HashMap<Plan, PlanPrice>,
    subscription_period_days: i64,
    mail_from: String,
    success_url: String,
    failure_url: String,
    notification_url: Option<String>,
}

impl BillingConfigBuilder {
    pub fn new() -> Self {
        Self {
            whitelist: HashSet::new(),
            prices: HashMap::new(),
            subscription_period_days: 365,
            mail_from: "billing@tapfolio.app".to_string(),
            success_url: "https://tapfolio.app/billing/success".to_string(),
            failure_url: "https://tapfolio.app/billing/failure".to_string(),
            notification_url: None,
        }
    }

    /// Add operator emails that always resolve to ENTERPRISE.
    pub fn whitelist<I, S>(mut self, emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist
            .extend(emails.into_iter().map(|e| e.into().to_lowercase()));
        self
    }

    /// Set the price for a plan.
    pub fn price(mut self, plan: Plan, amount_cents: i64, currency: impl Into<String>) -> Self {
        self.prices.insert(
            plan,
            PlanPrice {
                amount_cents,
                currency: currency.into().to_lowercase(),
            },
        );
        self
    }

    /// Set the subscription term in days.
    pub fn subscription_period_days(mut self, days: i64) -> Self {
        self.subscription_period_days = days;
        self
    }

    pub fn mail_from(mut self, from: impl Into<String>) -> Self {
        self.mail_from = from.into();
        self
    }

    pub fn success_url(mut self, url: impl Into<String>) -> Self {
        self.success_url = url.into();
        self
    }

    pub fn failure_url(mut self, url: impl Into<String>) -> Self {
        self.failure_url = url.into();
        self
    }

    pub fn notification_url(mut self, url: impl Into<String>) -> Self {
        self.notification_url = Some(url.into());
        self
    }

    /// Layer environment variables over the current values.
    ///
    /// Recognized variables: `TAPFOLIO_WHITELIST` (comma-separated emails),
    /// `TAPFOLIO_SUBSCRIPTION_DAYS`, `TAPFOLIO_MAIL_FROM`,
    /// `TAPFOLIO_SUCCESS_URL`, `TAPFOLIO_FAILURE_URL`,
    /// `TAPFOLIO_NOTIFICATION_URL`.
    pub fn from_env(mut self) -> Self {
        if let Ok(raw) = std::env::var("TAPFOLIO_WHITELIST") {
            self = self.whitelist(raw.split(',').map(str::trim).filter(|s| !s.is_empty()));
        }
        if let Ok(days) = std::env::var("TAPFOLIO_SUBSCRIPTION_DAYS") {
            if let Ok(days) = days.parse() {
                self.subscription_period_days = days;
            }
        }
        if let Ok(from) = std::env::var("TAPFOLIO_MAIL_FROM") {
            self.mail_from = from;
        }
        if let Ok(url) = std::env::var("TAPFOLIO_SUCCESS_URL") {
            self.success_url = url;
        }
        if let Ok(url) = std::env::var("TAPFOLIO_FAILURE_URL") {
            self.failure_url = url;
        }
        if let Ok(url) = std::env::var("TAPFOLIO_NOTIFICATION_URL") {
            self.notification_url = Some(url);
        }
        self
    }

    /// Build the config, validating redirect/notification URLs.
    pub fn build(self) -> Result<BillingConfig> {
        validate_https_url(&self.success_url)?;
        validate_https_url(&self.failure_url)?;
        if let Some(ref url) = self.notification_url {
            validate_https_url(url)?;
        }
        if self.subscription_period_days <= 0 {
            return Err(BillingError::bad_request(
                "subscription period must be positive",
            ));
        }

        Ok(BillingConfig {
            whitelist: self.whitelist,
            prices: self.prices,
            subscription_period_days: self.subscription_period_days,
            mail_from: self.mail_from,
            success_url: self.success_url,
            failure_url: self.failure_url,
            notification_url: self.notification_url,
        })
    }
}

impl Default for BillingConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate that a redirect URL parses and uses HTTPS.
fn validate_https_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url)
        .map_err(|e| BillingError::bad_request(format!("Invalid redirect URL: {}", e)))?;

    if parsed.scheme() != "https" {
        return Err(BillingError::bad_request("Redirect URL must use HTTPS"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist_is_case_insensitive() {
        let config = BillingConfig::builder()
            .whitelist(["Ops@Tapfolio.App"])
            .build()
            .unwrap();

        assert!(config.is_whitelisted("ops@tapfolio.app"));
        assert!(config.is_whitelisted("OPS@TAPFOLIO.APP"));
        assert!(!config.is_whitelisted("someone@tapfolio.app"));
    }

    #[test]
    fn test_price_lookup() {
        let config = BillingConfig::builder()
            .price(Plan::Pro, 9_900, "USD")
            .price(Plan::Business, 29_900, "usd")
            .build()
            .unwrap();

        let pro = config.price_of(Plan::Pro).unwrap();
        assert_eq!(pro.amount_cents, 9_900);
        assert_eq!(pro.currency, "usd");
        assert!(config.price_of(Plan::Free).is_none());
        assert!(config.price_of(Plan::Enterprise).is_none());
    }

    #[test]
    fn test_rejects_non_https_redirect() {
        let result = BillingConfig::builder()
            .success_url("http://tapfolio.app/success")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_non_positive_period() {
        let result = BillingConfig::builder().subscription_period_days(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_defaults() {
        let config = BillingConfig::builder().build().unwrap();
        assert_eq!(config.subscription_period_days, 365);
        assert_eq!(
            config.subscription_period(),
            chrono::Duration::days(365)
        );
    }
}
