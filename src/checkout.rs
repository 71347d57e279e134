//! Checkout initiation.
//!
//! Creates a pending payment record and an external checkout session. The
//! internal payment id is passed to the gateway as its external reference;
//! that is the join key the reconciler later uses to map gateway callbacks
//! back onto internal state.
//!
//! No idempotency key is needed here: each call is a fresh purchase attempt,
//! and abandoned pending rows are invisible to the resolver (which only
//! reads approved rows).

use uuid::Uuid;

use crate::audit::{BillingAuditEvent, BillingAuditLogger};
use crate::config::BillingConfig;
use crate::entitlements::EntitlementsManager;
use crate::error::{BillingError, Result};
use crate::gateway::{PaymentGateway, PreferenceRequest};
use crate::plans::Plan;
use crate::storage::{BillingStore, MembershipStore, Payment};

/// Result of starting a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRedirect {
    pub payment_id: Uuid,
    /// Where to send the buyer.
    pub redirect_url: String,
}

/// Checkout session management.
pub struct CheckoutManager<S, O, G, A>
where
    S: BillingStore,
    O: MembershipStore,
    G: PaymentGateway,
    A: BillingAuditLogger,
{
    store: S,
    entitlements: EntitlementsManager<S, O>,
    gateway: G,
    audit: A,
    config: BillingConfig,
}

impl<S, O, G, A> CheckoutManager<S, O, G, A>
where
    S: BillingStore + Clone,
    O: MembershipStore,
    G: PaymentGateway,
    A: BillingAuditLogger,
{
    #[must_use]
    pub fn new(store: S, memberships: O, gateway: G, audit: A, config: BillingConfig) -> Self {
        Self {
            entitlements: EntitlementsManager::new(store.clone(), memberships, config.clone()),
            store,
            gateway,
            audit,
            config,
        }
    }

    /// Start a checkout for an upgrade to `target`.
    ///
    /// Rejects with a conflict when the resolved current plan is non-FREE and
    /// already ranks at or above the target; rejects with a bad request when
    /// the target has no configured price.
    pub async fn start_checkout(
        &self,
        user_id: Uuid,
        email: &str,
        target: Plan,
    ) -> Result<CheckoutRedirect> {
        let current = self.entitlements.resolve(user_id).await?;
        if current.plan != Plan::Free && current.plan.at_least(target) {
            return Err(BillingError::conflict(format!(
                "current plan '{}' already covers '{}'",
                current.plan, target
            )));
        }

        let price = self.config.price_of(target).ok_or_else(|| {
            BillingError::bad_request(format!("no price configured for plan '{}'", target))
        })?;

        let payment = Payment::new_pending(
            user_id,
            email,
            price.amount_cents,
            price.currency.clone(),
            target,
        );
        self.store.create_payment(&payment).await?;

        let preference = self
            .gateway
            .create_preference(&PreferenceRequest {
                external_reference: payment.id.to_string(),
                title: format!("Tapfolio {} subscription", target),
                unit_price_cents: price.amount_cents,
                currency: price.currency.clone(),
                payer_email: email.to_string(),
                success_url: self.config.success_url.clone(),
                failure_url: self.config.failure_url.clone(),
                notification_url: self.config.notification_url.clone(),
            })
            .await?;

        self.store
            .set_preference_id(payment.id, &preference.id)
            .await?;

        self.audit
            .log(BillingAuditEvent::CheckoutCreated {
                user_id,
                plan: target,
                payment_id: payment.id,
                preference_id: preference.id.clone(),
            })
            .await;

        Ok(CheckoutRedirect {
            payment_id: payment.id,
            redirect_url: preference.init_point,
        })
    }
}
