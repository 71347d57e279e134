//! Entitlement resolution.
//!
//! Computes the effective plan for a user on every authorization-sensitive
//! request: operator whitelist first, then the user's own paid plan checked
//! against its backing payment, then organization inheritance, then the
//! highest-ranked of the two.
//!
//! The resolver is called far more often than the state changes. Its one
//! side effect, the lazy downgrade of a stale paid plan, is idempotent:
//! writing FREE twice is harmless, so concurrent requests may race freely.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::Result;
use crate::plans::{self, Feature, Plan, PlanLimits};
use crate::storage::{BillingStore, MembershipStore};

/// The resolved entitlement of a user.
#[derive(Debug, Clone, PartialEq)]
pub struct Entitlement {
    pub plan: Plan,
    pub limits: PlanLimits,
    /// Expiry of the user's own backing payment. Whitelist grants and
    /// org-inherited upgrades carry no expiry of their own.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entitlement {
    fn for_plan(plan: Plan, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            plan,
            limits: plans::limits_for(plan),
            expires_at,
        }
    }

    /// The FREE entitlement, with no expiry.
    #[must_use]
    pub fn free() -> Self {
        Self::for_plan(Plan::Free, None)
    }
}

/// Entitlement resolver.
pub struct EntitlementsManager<S: BillingStore, O: MembershipStore> {
    store: S,
    memberships: O,
    config: BillingConfig,
}

impl<S: BillingStore, O: MembershipStore> EntitlementsManager<S, O> {
    #[must_use]
    pub fn new(store: S, memberships: O, config: BillingConfig) -> Self {
        Self {
            store,
            memberships,
            config,
        }
    }

    /// Resolve the effective plan for a user.
    pub async fn resolve(&self, user_id: Uuid) -> Result<Entitlement> {
        // Callers may race with account deletion; an unknown user is FREE,
        // not an error.
        let Some(user) = self.store.get_user(user_id).await? else {
            return Ok(Entitlement::free());
        };

        // The whitelist overrides everything, including stored state.
        if self.config.is_whitelisted(&user.email) {
            return Ok(Entitlement::for_plan(Plan::Enterprise, None));
        }

        let mut candidate = user.plan;
        let mut expires_at = None;

        if candidate != Plan::Free {
            match self
                .store
                .latest_active_approved(user.id, Utc::now())
                .await?
            {
                Some(payment) => expires_at = payment.expires_at,
                None => {
                    // The cached plan is stale. Downgrade lazily; the write
                    // is best-effort and the sweep will catch a miss.
                    if let Err(err) = self.store.set_user_plan(user.id, Plan::Free).await {
                        tracing::warn!(
                            target: "billing::entitlements",
                            user_id = %user.id,
                            error = %err,
                            "failed to persist lazy downgrade"
                        );
                    } else {
                        tracing::info!(
                            target: "billing::entitlements",
                            user_id = %user.id,
                            stale_plan = %candidate,
                            "downgraded user with no active payment"
                        );
                    }
                    candidate = Plan::Free;
                }
            }
        }

        let plan = match self.inherited_plan(user.id).await? {
            Some(inherited) if inherited > candidate => inherited,
            _ => candidate,
        };

        // Inheritance is a standing grant tied to membership, not time: the
        // expiry stays the candidate's own either way.
        Ok(Entitlement::for_plan(plan, expires_at))
    }

    /// Check a feature against the resolved entitlement.
    pub async fn has_feature(&self, user_id: Uuid, feature: Feature) -> Result<bool> {
        let entitlement = self.resolve(user_id).await?;
        Ok(plans::has_feature(entitlement.plan, feature))
    }

    /// The highest plan inherited from organization owners, if any.
    ///
    /// Only OWNERs at BUSINESS or above confer their tier; PRO and FREE
    /// owners are ignored entirely.
    async fn inherited_plan(&self, user_id: Uuid) -> Result<Option<Plan>> {
        let memberships = self.memberships.memberships_of(user_id).await?;
        if memberships.is_empty() {
            return Ok(None);
        }

        let org_ids: Vec<Uuid> = memberships.iter().map(|m| m.org_id).collect();
        let owners = self.memberships.owners_of(&org_ids).await?;

        let mut best: Option<Plan> = None;
        for owner in owners {
            // A user owning one of their own orgs contributes nothing new.
            if owner.user_id == user_id {
                continue;
            }
            let plan = self.owner_plan(owner.user_id).await?;
            if plan >= Plan::Business && best.is_none_or(|b| plan > b) {
                best = Some(plan);
            }
        }
        Ok(best)
    }

    /// Resolve an owner's plan for inheritance purposes.
    ///
    /// Depth-excluded on purpose: only the whitelist and the stored plan are
    /// consulted, never the owner's own org memberships, so mutually-owning
    /// organizations cannot recurse.
    async fn owner_plan(&self, owner_id: Uuid) -> Result<Plan> {
        let Some(owner) = self.store.get_user(owner_id).await? else {
            return Ok(Plan::Free);
        };
        if self.config.is_whitelisted(&owner.email) {
            return Ok(Plan::Enterprise);
        }
        Ok(owner.plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::{Membership, OrgRole, Payment, PaymentStatus, User};
    use chrono::Duration;

    fn config() -> BillingConfig {
        BillingConfig::builder()
            .whitelist(["founder@tapfolio.app"])
            .build()
            .unwrap()
    }

    fn manager(store: &InMemoryStore) -> EntitlementsManager<InMemoryStore, InMemoryStore> {
        EntitlementsManager::new(store.clone(), store.clone(), config())
    }

    fn seed_user(store: &InMemoryStore, email: &str, plan: Plan) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: None,
            plan,
            created_at: Utc::now(),
        };
        store.insert_user(user.clone());
        user
    }

    fn seed_approved_payment(
        store: &InMemoryStore,
        user: &User,
        plan: Plan,
        expires_at: Option<DateTime<Utc>>,
    ) -> Payment {
        let mut payment = Payment::new_pending(user.id, &user.email, 9_900, "usd", plan);
        payment.status = PaymentStatus::Approved;
        payment.paid_at = Some(Utc::now() - Duration::days(1));
        payment.expires_at = expires_at;
        store.insert_payment(payment.clone());
        payment
    }

    fn seed_org(store: &InMemoryStore, owner: &User, member: &User) -> Uuid {
        let org_id = Uuid::new_v4();
        store.insert_membership(Membership {
            org_id,
            user_id: owner.id,
            role: OrgRole::Owner,
        });
        store.insert_membership(Membership {
            org_id,
            user_id: member.id,
            role: OrgRole::Member,
        });
        org_id
    }

    #[tokio::test]
    async fn test_unknown_user_resolves_free() {
        let store = InMemoryStore::new();
        let entitlement = manager(&store).resolve(Uuid::new_v4()).await.unwrap();
        assert_eq!(entitlement.plan, Plan::Free);
        assert!(entitlement.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_whitelist_overrides_everything() {
        let store = InMemoryStore::new();
        // Stored FREE, no payments at all.
        let user = seed_user(&store, "founder@tapfolio.app", Plan::Free);

        let entitlement = manager(&store).resolve(user.id).await.unwrap();
        assert_eq!(entitlement.plan, Plan::Enterprise);
        assert!(entitlement.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_backed_paid_plan_keeps_payment_expiry() {
        let store = InMemoryStore::new();
        let user = seed_user(&store, "pro@example.com", Plan::Pro);
        let expires = Some(Utc::now() + Duration::days(200));
        seed_approved_payment(&store, &user, Plan::Pro, expires);

        let entitlement = manager(&store).resolve(user.id).await.unwrap();
        assert_eq!(entitlement.plan, Plan::Pro);
        assert_eq!(entitlement.expires_at, expires);
    }

    #[tokio::test]
    async fn test_stale_plan_downgrades_lazily() {
        let store = InMemoryStore::new();
        let user = seed_user(&store, "lapsed@example.com", Plan::Pro);
        // The only approved payment is expired.
        seed_approved_payment(
            &store,
            &user,
            Plan::Pro,
            Some(Utc::now() - Duration::days(1)),
        );

        let entitlement = manager(&store).resolve(user.id).await.unwrap();
        assert_eq!(entitlement.plan, Plan::Free);

        // The downgrade was persisted, not just computed.
        let stored = store.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.plan, Plan::Free);
    }

    #[tokio::test]
    async fn test_lazy_downgrade_is_idempotent() {
        let store = InMemoryStore::new();
        let user = seed_user(&store, "lapsed@example.com", Plan::Pro);

        let mgr = manager(&store);
        let (a, b) = tokio::join!(mgr.resolve(user.id), mgr.resolve(user.id));
        assert_eq!(a.unwrap().plan, Plan::Free);
        assert_eq!(b.unwrap().plan, Plan::Free);
        assert_eq!(
            store.get_user(user.id).await.unwrap().unwrap().plan,
            Plan::Free
        );
    }

    #[tokio::test]
    async fn test_member_inherits_from_business_owner() {
        let store = InMemoryStore::new();
        let owner = seed_user(&store, "owner@example.com", Plan::Business);
        seed_approved_payment(&store, &owner, Plan::Business, None);
        let member = seed_user(&store, "member@example.com", Plan::Free);
        seed_org(&store, &owner, &member);

        let entitlement = manager(&store).resolve(member.id).await.unwrap();
        assert_eq!(entitlement.plan, Plan::Business);
        // Inheritance carries no expiry.
        assert!(entitlement.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_member_does_not_inherit_from_pro_owner() {
        let store = InMemoryStore::new();
        let owner = seed_user(&store, "owner@example.com", Plan::Pro);
        seed_approved_payment(&store, &owner, Plan::Pro, None);
        let member = seed_user(&store, "member@example.com", Plan::Free);
        seed_org(&store, &owner, &member);

        let entitlement = manager(&store).resolve(member.id).await.unwrap();
        assert_eq!(entitlement.plan, Plan::Free);
    }

    #[tokio::test]
    async fn test_member_inherits_from_whitelisted_owner() {
        let store = InMemoryStore::new();
        let owner = seed_user(&store, "founder@tapfolio.app", Plan::Free);
        let member = seed_user(&store, "member@example.com", Plan::Free);
        seed_org(&store, &owner, &member);

        let entitlement = manager(&store).resolve(member.id).await.unwrap();
        assert_eq!(entitlement.plan, Plan::Enterprise);
    }

    #[tokio::test]
    async fn test_own_plan_wins_ties_and_keeps_expiry() {
        let store = InMemoryStore::new();
        let owner = seed_user(&store, "owner@example.com", Plan::Business);
        seed_approved_payment(&store, &owner, Plan::Business, None);
        let member = seed_user(&store, "member@example.com", Plan::Pro);
        let expires = Some(Utc::now() + Duration::days(100));
        seed_approved_payment(&store, &member, Plan::Pro, expires);
        seed_org(&store, &owner, &member);

        // Inherited BUSINESS outranks own PRO, but the expiry shown is still
        // the member's own.
        let entitlement = manager(&store).resolve(member.id).await.unwrap();
        assert_eq!(entitlement.plan, Plan::Business);
        assert_eq!(entitlement.expires_at, expires);
    }

    #[tokio::test]
    async fn test_inheritance_does_not_recurse_through_owners() {
        let store = InMemoryStore::new();
        // owner_b (ENTERPRISE by payment-backed plan) owns org B.
        let owner_b = seed_user(&store, "b@example.com", Plan::Enterprise);
        seed_approved_payment(&store, &owner_b, Plan::Enterprise, None);
        // owner_a owns org A but is only FREE; they are a member of org B,
        // so resolving owner_a directly would give ENTERPRISE.
        let owner_a = seed_user(&store, "a@example.com", Plan::Free);
        seed_org(&store, &owner_b, &owner_a);
        // member belongs to org A.
        let member = seed_user(&store, "m@example.com", Plan::Free);
        seed_org(&store, &owner_a, &member);

        // Owner resolution during inheritance is whitelist/stored-plan only:
        // owner_a's own inherited upgrade does not flow through to member.
        let entitlement = manager(&store).resolve(member.id).await.unwrap();
        assert_eq!(entitlement.plan, Plan::Free);
    }

    #[tokio::test]
    async fn test_highest_owner_plan_wins() {
        let store = InMemoryStore::new();
        let business_owner = seed_user(&store, "biz@example.com", Plan::Business);
        let enterprise_owner = seed_user(&store, "ent@example.com", Plan::Enterprise);
        let member = seed_user(&store, "member@example.com", Plan::Free);
        seed_org(&store, &business_owner, &member);
        seed_org(&store, &enterprise_owner, &member);

        let entitlement = manager(&store).resolve(member.id).await.unwrap();
        assert_eq!(entitlement.plan, Plan::Enterprise);
    }

    #[tokio::test]
    async fn test_has_feature_uses_resolved_plan() {
        let store = InMemoryStore::new();
        let owner = seed_user(&store, "owner@example.com", Plan::Business);
        let member = seed_user(&store, "member@example.com", Plan::Free);
        seed_org(&store, &owner, &member);

        let mgr = manager(&store);
        assert!(mgr
            .has_feature(member.id, Feature::OrgDashboard)
            .await
            .unwrap());
        assert!(!mgr
            .has_feature(member.id, Feature::CustomDomain)
            .await
            .unwrap());
    }
}
