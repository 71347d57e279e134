//! Audit logging for billing operations.
//!
//! Trait-based audit trail for plan changes and payment settlement. The
//! admin override and the reconciler both emit events here; the payment rows
//! themselves remain the durable record.

use std::fmt;

use uuid::Uuid;

use crate::plans::Plan;

/// Audit event types for billing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingAuditEvent {
    /// Checkout preference created.
    CheckoutCreated {
        user_id: Uuid,
        plan: Plan,
        payment_id: Uuid,
        preference_id: String,
    },
    /// A payment reached `approved` and the user's plan was synced.
    PaymentApproved {
        user_id: Uuid,
        payment_id: Uuid,
        external_payment_id: String,
        plan: Plan,
    },
    /// A payment settled to a non-approved terminal status.
    PaymentSettled {
        payment_id: Uuid,
        external_payment_id: String,
        status: String,
    },
    /// An operator granted a plan directly.
    PlanGranted {
        operator: String,
        target_email: String,
        plan: Plan,
        days: i64,
    },
    /// A user was downgraded to FREE (lazily or by the sweep).
    UserDowngraded { user_id: Uuid },
    /// A webhook or poll event could not be tied to internal state.
    EventDropped { external_payment_id: String, reason: String },
}

impl fmt::Display for BillingAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckoutCreated {
                user_id,
                plan,
                payment_id,
                preference_id,
            } => write!(
                f,
                "Checkout created: user={}, plan={}, payment={}, preference={}",
                user_id, plan, payment_id, preference_id
            ),
            Self::PaymentApproved {
                user_id,
                payment_id,
                external_payment_id,
                plan,
            } => write!(
                f,
                "Payment approved: user={}, payment={}, gateway={}, plan={}",
                user_id, payment_id, external_payment_id, plan
            ),
            Self::PaymentSettled {
                payment_id,
                external_payment_id,
                status,
            } => write!(
                f,
                "Payment settled: payment={}, gateway={}, status={}",
                payment_id, external_payment_id, status
            ),
            Self::PlanGranted {
                operator,
                target_email,
                plan,
                days,
            } => write!(
                f,
                "Plan granted: operator={}, target={}, plan={}, days={}",
                operator, target_email, plan, days
            ),
            Self::UserDowngraded { user_id } => {
                write!(f, "User downgraded: user={}", user_id)
            }
            Self::EventDropped {
                external_payment_id,
                reason,
            } => write!(
                f,
                "Event dropped: gateway={}, reason={}",
                external_payment_id, reason
            ),
        }
    }
}

/// Trait for audit logging backends.
///
/// Implementations should absorb their own failures; auditing must never
/// disrupt a billing operation.
#[allow(async_fn_in_trait)]
pub trait BillingAuditLogger: Send + Sync {
    /// Log a billing audit event.
    async fn log(&self, event: BillingAuditEvent);
}

/// No-op audit logger.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

impl BillingAuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: BillingAuditEvent) {}
}

/// Tracing-based audit logger, logging at INFO level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

impl BillingAuditLogger for TracingAuditLogger {
    async fn log(&self, event: BillingAuditEvent) {
        tracing::info!(
            target: "billing::audit",
            event_type = %event_kind(&event),
            "{}", event
        );
    }
}

/// Get the event kind as a string for structured logging.
fn event_kind(event: &BillingAuditEvent) -> &'static str {
    match event {
        BillingAuditEvent::CheckoutCreated { .. } => "checkout_created",
        BillingAuditEvent::PaymentApproved { .. } => "payment_approved",
        BillingAuditEvent::PaymentSettled { .. } => "payment_settled",
        BillingAuditEvent::PlanGranted { .. } => "plan_granted",
        BillingAuditEvent::UserDowngraded { .. } => "user_downgraded",
        BillingAuditEvent::EventDropped { .. } => "event_dropped",
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let event = BillingAuditEvent::PlanGranted {
            operator: "ops@tapfolio.app".to_string(),
            target_email: "user@example.com".to_string(),
            plan: Plan::Business,
            days: 365,
        };
        assert_eq!(
            event.to_string(),
            "Plan granted: operator=ops@tapfolio.app, target=user@example.com, plan=business, days=365"
        );
        assert_eq!(event_kind(&event), "plan_granted");
    }
}
