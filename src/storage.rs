//! Storage traits for billing data.
//!
//! Implement these traits to persist billing state to your database. An
//! in-memory implementation is provided in [`memory`] for tests and small
//! deployments; a SeaORM implementation lives behind the `database` feature.
//!
//! `User.plan` and `Payment.status` are the only shared mutable state in this
//! subsystem. `User.plan` is a denormalized entitlement cache written only by
//! the reconciler, the admin override, and the expiry sweep; profile-editing
//! code must never touch it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Result;
use crate::plans::Plan;

/// A platform user, as far as billing is concerned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    /// Denormalized entitlement cache, not the source of truth.
    pub plan: Plan,
    pub created_at: DateTime<Utc>,
}

/// Internal payment record.
///
/// Created `pending` by the checkout initiator (or already `approved` by an
/// admin grant), transitioned at most once to a terminal status by the
/// reconciler's conditional update, and never touched again after approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    /// The tier this payment grants. Legacy rows predate the column; the
    /// reconciler falls back to PRO for those.
    pub plan: Option<Plan>,
    pub status: PaymentStatus,
    pub payer_email: Option<String>,
    /// External checkout session id, set once the gateway session exists.
    pub preference_id: Option<String>,
    /// The gateway's payment id; at most one is ever attached.
    pub external_payment_id: Option<String>,
    /// Raw gateway payment object captured at settlement, for audit.
    pub gateway_response: Option<serde_json::Value>,
    pub paid_at: Option<DateTime<Utc>>,
    /// Only ever set while `status == Approved`.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    /// Create a new pending payment for a checkout attempt.
    #[must_use]
    pub fn new_pending(
        user_id: Uuid,
        payer_email: impl Into<String>,
        amount_cents: i64,
        currency: impl Into<String>,
        plan: Plan,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount_cents,
            currency: currency.into(),
            plan: Some(plan),
            status: PaymentStatus::Pending,
            payer_email: Some(payer_email.into()),
            preference_id: None,
            external_payment_id: None,
            gateway_response: None,
            paid_at: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this payment currently backs an entitlement.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Approved
            && self.expires_at.is_none_or(|expires| expires > now)
    }
}

/// Payment status, in the internal five-state vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    /// Map the gateway's status vocabulary onto the internal one.
    ///
    /// Unrecognized values map to `Pending` so a new gateway status never
    /// settles a payment by accident.
    #[must_use]
    pub fn from_gateway(status: &str) -> Self {
        match status {
            "approved" => Self::Approved,
            "pending" | "in_process" | "in_mediation" | "authorized" => Self::Pending,
            "rejected" => Self::Rejected,
            "cancelled" => Self::Cancelled,
            "refunded" | "charged_back" => Self::Refunded,
            _ => Self::Pending,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fields written by the reconciler's conditional update.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentSettlement {
    pub status: PaymentStatus,
    pub external_payment_id: String,
    pub gateway_response: serde_json::Value,
    pub paid_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Organization role.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrgRole {
    Owner,
    Admin,
    #[default]
    Member,
}

impl OrgRole {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }
}

/// Error returned when parsing a role string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRoleError {
    invalid_value: String,
}

impl fmt::Display for ParseRoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid role: '{}' (expected: owner, admin, or member)",
            self.invalid_value
        )
    }
}

impl std::error::Error for ParseRoleError {}

impl FromStr for OrgRole {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "owner" => Ok(Self::Owner),
            "admin" => Ok(Self::Admin),
            "member" => Ok(Self::Member),
            _ => Err(ParseRoleError {
                invalid_value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for OrgRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An organization membership row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub role: OrgRole,
}

/// Trait for storing billing data (users and payments).
#[async_trait]
pub trait BillingStore: Send + Sync {
    // Users

    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Write the denormalized plan cache.
    ///
    /// Writing the same plan twice must be harmless; writing to a user that
    /// no longer exists is a no-op, not an error.
    async fn set_user_plan(&self, id: Uuid, plan: Plan) -> Result<()>;

    /// All users whose cached plan is not FREE (the sweep's working set).
    async fn list_paid_users(&self) -> Result<Vec<User>>;

    // Payments

    async fn create_payment(&self, payment: &Payment) -> Result<()>;

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>>;

    /// Attach the gateway checkout session id to a pending payment.
    async fn set_preference_id(&self, id: Uuid, preference_id: &str) -> Result<()>;

    /// The user's most recent approved payment whose expiry is null or after
    /// `now`, ordered by `paid_at` descending.
    async fn latest_active_approved(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Payment>>;

    /// The user's pending payments, most recent first.
    async fn pending_payments(&self, user_id: Uuid) -> Result<Vec<Payment>>;

    /// Apply a settlement to a payment, but only while its current status is
    /// not `approved`.
    ///
    /// This is the conditional update the whole reconciler hangs on: the
    /// write is scoped by a predicate on the row's pre-write state and the
    /// affected-row count is reported. Returns `Ok(true)` if the row changed,
    /// `Ok(false)` if a concurrent invocation already approved it (or the row
    /// is gone). `Ok(false)` is an expected outcome under concurrency, not a
    /// failure.
    async fn settle_payment(&self, id: Uuid, settlement: &PaymentSettlement) -> Result<bool>;
}

/// Read-only view of organization memberships.
///
/// Membership CRUD belongs to another subsystem; billing only needs to walk
/// from a user to the owners of their organizations.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// All memberships of a user.
    async fn memberships_of(&self, user_id: Uuid) -> Result<Vec<Membership>>;

    /// The OWNER memberships of the given organizations.
    async fn owners_of(&self, org_ids: &[Uuid]) -> Result<Vec<Membership>>;
}

/// In-memory store, suitable for tests and single-process deployments.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};

    /// In-memory implementation of [`BillingStore`] and [`MembershipStore`].
    ///
    /// Wraps data in `Arc` for cheap cloning; the settle path holds the
    /// write lock across the check-and-write, so it is atomic per process.
    #[derive(Default, Clone)]
    pub struct InMemoryStore {
        inner: Arc<InMemoryStoreInner>,
    }

    #[derive(Default)]
    struct InMemoryStoreInner {
        users: RwLock<HashMap<Uuid, User>>,
        payments: RwLock<HashMap<Uuid, Payment>>,
        memberships: RwLock<Vec<Membership>>,
    }

    impl InMemoryStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert or replace a user.
        pub fn insert_user(&self, user: User) {
            self.inner.users.write().unwrap().insert(user.id, user);
        }

        /// Insert or replace a payment directly, bypassing the settle path.
        pub fn insert_payment(&self, payment: Payment) {
            self.inner
                .payments
                .write()
                .unwrap()
                .insert(payment.id, payment);
        }

        /// Add a membership row.
        pub fn insert_membership(&self, membership: Membership) {
            self.inner.memberships.write().unwrap().push(membership);
        }

        /// Snapshot of all payments (for assertions).
        pub fn all_payments(&self) -> Vec<Payment> {
            self.inner.payments.read().unwrap().values().cloned().collect()
        }
    }

    #[async_trait]
    impl BillingStore for InMemoryStore {
        async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
            Ok(self.inner.users.read().unwrap().get(&id).cloned())
        }

        async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
            let email = email.to_lowercase();
            Ok(self
                .inner
                .users
                .read()
                .unwrap()
                .values()
                .find(|u| u.email.to_lowercase() == email)
                .cloned())
        }

        async fn set_user_plan(&self, id: Uuid, plan: Plan) -> Result<()> {
            if let Some(user) = self.inner.users.write().unwrap().get_mut(&id) {
                user.plan = plan;
            }
            Ok(())
        }

        async fn list_paid_users(&self) -> Result<Vec<User>> {
            Ok(self
                .inner
                .users
                .read()
                .unwrap()
                .values()
                .filter(|u| u.plan != Plan::Free)
                .cloned()
                .collect())
        }

        async fn create_payment(&self, payment: &Payment) -> Result<()> {
            self.inner
                .payments
                .write()
                .unwrap()
                .insert(payment.id, payment.clone());
            Ok(())
        }

        async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>> {
            Ok(self.inner.payments.read().unwrap().get(&id).cloned())
        }

        async fn set_preference_id(&self, id: Uuid, preference_id: &str) -> Result<()> {
            if let Some(payment) = self.inner.payments.write().unwrap().get_mut(&id) {
                payment.preference_id = Some(preference_id.to_string());
            }
            Ok(())
        }

        async fn latest_active_approved(
            &self,
            user_id: Uuid,
            now: DateTime<Utc>,
        ) -> Result<Option<Payment>> {
            let payments = self.inner.payments.read().unwrap();
            let mut active: Vec<&Payment> = payments
                .values()
                .filter(|p| p.user_id == user_id && p.is_active_at(now))
                .collect();
            active.sort_by_key(|p| std::cmp::Reverse(p.paid_at));
            Ok(active.first().map(|p| (*p).clone()))
        }

        async fn pending_payments(&self, user_id: Uuid) -> Result<Vec<Payment>> {
            let payments = self.inner.payments.read().unwrap();
            let mut pending: Vec<Payment> = payments
                .values()
                .filter(|p| p.user_id == user_id && p.status == PaymentStatus::Pending)
                .cloned()
                .collect();
            pending.sort_by_key(|p| std::cmp::Reverse(p.created_at));
            Ok(pending)
        }

        async fn settle_payment(
            &self,
            id: Uuid,
            settlement: &PaymentSettlement,
        ) -> Result<bool> {
            let mut payments = self.inner.payments.write().unwrap();
            match payments.get_mut(&id) {
                Some(payment) if payment.status != PaymentStatus::Approved => {
                    payment.status = settlement.status;
                    payment.external_payment_id = Some(settlement.external_payment_id.clone());
                    payment.gateway_response = Some(settlement.gateway_response.clone());
                    payment.paid_at = settlement.paid_at;
                    payment.expires_at = settlement.expires_at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    #[async_trait]
    impl MembershipStore for InMemoryStore {
        async fn memberships_of(&self, user_id: Uuid) -> Result<Vec<Membership>> {
            Ok(self
                .inner
                .memberships
                .read()
                .unwrap()
                .iter()
                .filter(|m| m.user_id == user_id)
                .cloned()
                .collect())
        }

        async fn owners_of(&self, org_ids: &[Uuid]) -> Result<Vec<Membership>> {
            Ok(self
                .inner
                .memberships
                .read()
                .unwrap()
                .iter()
                .filter(|m| m.role == OrgRole::Owner && org_ids.contains(&m.org_id))
                .cloned()
                .collect())
        }
    }
}
