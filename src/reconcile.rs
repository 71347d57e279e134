//! Payment reconciliation.
//!
//! Webhook deliveries (push) and explicit verification requests (pull)
//! converge on [`Reconciler::apply`], which performs an idempotent,
//! race-safe status transition plus plan sync.
//!
//! The whole mechanism rests on one conditional update: the settle write is
//! scoped to rows whose status is still not `approved`, and the affected-row
//! count is observed. That makes "decide to approve" and "commit the
//! approval" atomic from the store's point of view, so a webhook retry
//! racing a manual poll (or two retries racing each other) can never both
//! apply the plan-sync and confirmation-mail side effects. Zero rows
//! affected is a normal branch under concurrency, not a failure.

use chrono::Utc;
use uuid::Uuid;

use crate::audit::{BillingAuditEvent, BillingAuditLogger};
use crate::config::BillingConfig;
use crate::error::Result;
use crate::gateway::{GatewayPayment, PaymentGateway};
use crate::mailer::{self, Mailer};
use crate::plans::Plan;
use crate::storage::{BillingStore, PaymentSettlement, PaymentStatus};

/// Why an event was dropped without touching internal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The gateway read returned nothing (non-2xx, timeout, or unknown id).
    GatewayMiss,
    /// The gateway payment carries no external reference.
    MissingReference,
    /// The external reference is not a valid internal payment id.
    MalformedReference,
    /// No internal payment record matches the reference.
    UnknownReference,
}

impl DropReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GatewayMiss => "gateway_miss",
            Self::MissingReference => "missing_reference",
            Self::MalformedReference => "malformed_reference",
            Self::UnknownReference => "unknown_reference",
        }
    }
}

/// Outcome of a reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The transition was written; side effects ran if it was an approval.
    Applied { status: PaymentStatus },
    /// The internal record is already approved.
    ///
    /// Post-approval gateway events land here, including `refunded` and
    /// `charged_back`: they are deliberately inert. No downgrade, no record
    /// update. Kept as an explicit branch so the choice is visible.
    AlreadyApproved,
    /// This exact gateway id and status are already recorded.
    Duplicate,
    /// A concurrent invocation won the conditional update. Treated as
    /// success; side effects are not re-applied.
    LostRace,
    /// The event could not be tied to internal state; logged and dropped.
    Dropped(DropReason),
}

impl ReconcileOutcome {
    /// Whether this attempt wrote an approval.
    #[must_use]
    pub fn approved(&self) -> bool {
        matches!(
            self,
            Self::Applied {
                status: PaymentStatus::Approved
            }
        )
    }
}

/// The webhook/polling reconciler.
pub struct Reconciler<S, G, M, A>
where
    S: BillingStore,
    G: PaymentGateway,
    M: Mailer,
    A: BillingAuditLogger,
{
    store: S,
    gateway: G,
    mailer: M,
    audit: A,
    config: BillingConfig,
}

impl<S, G, M, A> Reconciler<S, G, M, A>
where
    S: BillingStore,
    G: PaymentGateway,
    M: Mailer,
    A: BillingAuditLogger,
{
    #[must_use]
    pub fn new(store: S, gateway: G, mailer: M, audit: A, config: BillingConfig) -> Self {
        Self {
            store,
            gateway,
            mailer,
            audit,
            config,
        }
    }

    /// Push-path entry point: reconcile a gateway payment id.
    ///
    /// The payment is refetched from the gateway's read API; webhook payload
    /// fields are never trusted for the authoritative status.
    pub async fn process_payment_id(&self, gateway_payment_id: &str) -> Result<ReconcileOutcome> {
        let Some(gateway_payment) = self.gateway.get_payment(gateway_payment_id).await? else {
            tracing::warn!(
                target: "billing::reconcile",
                gateway_payment_id = %gateway_payment_id,
                "gateway returned no payment; event dropped"
            );
            return Ok(ReconcileOutcome::Dropped(DropReason::GatewayMiss));
        };
        self.apply(gateway_payment).await
    }

    /// Pull-path entry point: verify a user's pending payments.
    ///
    /// Searches the gateway by each pending payment's id (its external
    /// reference), most recent first, and feeds every match into the same
    /// transition logic.
    pub async fn verify_pending(&self, user_id: Uuid) -> Result<Vec<ReconcileOutcome>> {
        let pending = self.store.pending_payments(user_id).await?;
        let mut outcomes = Vec::with_capacity(pending.len());
        for payment in pending {
            let matches = self
                .gateway
                .search_by_reference(&payment.id.to_string())
                .await?;
            for gateway_payment in matches {
                outcomes.push(self.apply(gateway_payment).await?);
            }
        }
        Ok(outcomes)
    }

    /// The transition logic both paths converge on.
    pub async fn apply(&self, gateway_payment: GatewayPayment) -> Result<ReconcileOutcome> {
        let status = PaymentStatus::from_gateway(&gateway_payment.status);

        let Some(reference) = gateway_payment.external_reference.as_deref() else {
            return Ok(self
                .drop_event(&gateway_payment.id, DropReason::MissingReference)
                .await);
        };
        let Ok(payment_id) = Uuid::parse_str(reference) else {
            return Ok(self
                .drop_event(&gateway_payment.id, DropReason::MalformedReference)
                .await);
        };
        let Some(payment) = self.store.get_payment(payment_id).await? else {
            return Ok(self
                .drop_event(&gateway_payment.id, DropReason::UnknownReference)
                .await);
        };

        if payment.status == PaymentStatus::Approved {
            tracing::debug!(
                target: "billing::reconcile",
                payment_id = %payment.id,
                gateway_payment_id = %gateway_payment.id,
                incoming_status = %status,
                "payment already approved; event is inert"
            );
            return Ok(ReconcileOutcome::AlreadyApproved);
        }

        if payment.external_payment_id.as_deref() == Some(gateway_payment.id.as_str())
            && payment.status == status
        {
            tracing::debug!(
                target: "billing::reconcile",
                payment_id = %payment.id,
                gateway_payment_id = %gateway_payment.id,
                "duplicate delivery of an already-applied event"
            );
            return Ok(ReconcileOutcome::Duplicate);
        }

        let (paid_at, expires_at) = if status == PaymentStatus::Approved {
            // A flat term from the approval timestamp; not prorated, and it
            // does not stack on any prior subscription.
            let paid_at = gateway_payment.date_approved.unwrap_or_else(Utc::now);
            (
                Some(paid_at),
                Some(paid_at + self.config.subscription_period()),
            )
        } else {
            (None, None)
        };

        let settlement = PaymentSettlement {
            status,
            external_payment_id: gateway_payment.id.clone(),
            gateway_response: gateway_payment.raw.clone(),
            paid_at,
            expires_at,
        };

        let changed = self.store.settle_payment(payment.id, &settlement).await?;
        if !changed {
            // A concurrent invocation already won the race.
            tracing::debug!(
                target: "billing::reconcile",
                payment_id = %payment.id,
                "conditional update affected zero rows; transition already committed elsewhere"
            );
            return Ok(ReconcileOutcome::LostRace);
        }

        if status == PaymentStatus::Approved {
            let plan = payment.plan.unwrap_or(Plan::Pro);
            self.store.set_user_plan(payment.user_id, plan).await?;
            self.audit
                .log(BillingAuditEvent::PaymentApproved {
                    user_id: payment.user_id,
                    payment_id: payment.id,
                    external_payment_id: gateway_payment.id.clone(),
                    plan,
                })
                .await;
            self.send_confirmation(&payment, &gateway_payment, plan).await;
        } else {
            self.audit
                .log(BillingAuditEvent::PaymentSettled {
                    payment_id: payment.id,
                    external_payment_id: gateway_payment.id.clone(),
                    status: status.to_string(),
                })
                .await;
        }

        Ok(ReconcileOutcome::Applied { status })
    }

    /// Best-effort confirmation mail; failure never blocks the transition.
    async fn send_confirmation(
        &self,
        payment: &crate::storage::Payment,
        gateway_payment: &GatewayPayment,
        plan: Plan,
    ) {
        let user = self.store.get_user(payment.user_id).await.ok().flatten();
        let to = user
            .as_ref()
            .map(|u| u.email.clone())
            .or_else(|| payment.payer_email.clone())
            .or_else(|| gateway_payment.payer_email.clone());

        let Some(to) = to else { return };
        let name = user.as_ref().and_then(|u| u.name.clone());

        let email = mailer::payment_confirmation(&self.config.mail_from, &to, name.as_deref(), plan);
        if let Err(err) = self.mailer.send(&email).await {
            tracing::warn!(
                target: "billing::reconcile",
                payment_id = %payment.id,
                error = %err,
                "failed to send payment confirmation"
            );
        }
    }

    async fn drop_event(&self, gateway_payment_id: &str, reason: DropReason) -> ReconcileOutcome {
        tracing::warn!(
            target: "billing::reconcile",
            gateway_payment_id = %gateway_payment_id,
            reason = reason.as_str(),
            "event dropped"
        );
        self.audit
            .log(BillingAuditEvent::EventDropped {
                external_payment_id: gateway_payment_id.to_string(),
                reason: reason.as_str().to_string(),
            })
            .await;
        ReconcileOutcome::Dropped(reason)
    }
}
