//! Operator-issued plan grants.
//!
//! A direct, trusted write that bypasses the gateway and the reconciler's
//! conditional-update machinery entirely. Operator authorization is enforced
//! at the boundary by the host application; this module assumes the caller
//! is already vetted.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::audit::{BillingAuditEvent, BillingAuditLogger};
use crate::config::BillingConfig;
use crate::error::{BillingError, Result};
use crate::plans::Plan;
use crate::storage::{BillingStore, Payment, PaymentStatus};

/// Confirmation of an applied grant.
#[derive(Debug, Clone, PartialEq)]
pub struct GrantReceipt {
    pub user_id: Uuid,
    pub email: String,
    pub plan: Plan,
    pub expires_at: Option<DateTime<Utc>>,
    /// The zero-amount audit payment row, for non-FREE grants.
    pub payment_id: Option<Uuid>,
}

/// Admin override manager.
pub struct AdminManager<S: BillingStore, A: BillingAuditLogger> {
    store: S,
    audit: A,
    config: BillingConfig,
}

impl<S: BillingStore, A: BillingAuditLogger> AdminManager<S, A> {
    #[must_use]
    pub fn new(store: S, audit: A, config: BillingConfig) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    /// Grant a plan to a user by email.
    ///
    /// The plan string is validated strictly. For any non-FREE grant an
    /// already-approved zero-amount payment row is created as the audit
    /// record, expiring after `days` (default: the standard subscription
    /// period). A FREE grant creates no payment row.
    pub async fn grant_plan(
        &self,
        operator: &str,
        target_email: &str,
        plan: &str,
        days: Option<i64>,
    ) -> Result<GrantReceipt> {
        let plan: Plan = plan
            .parse()
            .map_err(|err: crate::plans::ParsePlanError| BillingError::bad_request(err.to_string()))?;

        let user = self
            .store
            .find_user_by_email(target_email)
            .await?
            .ok_or_else(|| {
                BillingError::not_found(format!("no user with email '{}'", target_email))
            })?;

        // Operator-authoritative: no expiry check, no resolver involvement.
        self.store.set_user_plan(user.id, plan).await?;

        let days = days.unwrap_or(self.config.subscription_period_days);
        let mut payment_id = None;
        let mut expires_at = None;

        if plan != Plan::Free {
            let now = Utc::now();
            let expires = now + Duration::days(days);
            let currency = self
                .config
                .price_of(plan)
                .map(|p| p.currency.clone())
                .unwrap_or_else(|| "usd".to_string());

            let payment = Payment {
                id: Uuid::new_v4(),
                user_id: user.id,
                amount_cents: 0,
                currency,
                plan: Some(plan),
                status: PaymentStatus::Approved,
                payer_email: Some(user.email.clone()),
                preference_id: None,
                external_payment_id: None,
                gateway_response: None,
                paid_at: Some(now),
                expires_at: Some(expires),
                created_at: now,
            };
            self.store.create_payment(&payment).await?;

            payment_id = Some(payment.id);
            expires_at = Some(expires);
        }

        tracing::info!(
            target: "billing::admin",
            operator = %operator,
            target = %user.email,
            plan = %plan,
            days = days,
            "plan granted by operator"
        );
        self.audit
            .log(BillingAuditEvent::PlanGranted {
                operator: operator.to_string(),
                target_email: user.email.clone(),
                plan,
                days,
            })
            .await;

        Ok(GrantReceipt {
            user_id: user.id,
            email: user.email,
            plan,
            expires_at,
            payment_id,
        })
    }
}
