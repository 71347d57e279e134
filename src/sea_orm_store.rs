//! SeaORM-backed billing storage.
//!
//! Production persistence for billing data. The settle path is a single
//! conditional UPDATE scoped to `status <> 'approved'`, checked by its
//! affected-row count; no transaction or lock is needed for the
//! exactly-once approval guarantee.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::Expr, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use uuid::Uuid;

use crate::error::{BillingError, Result};
use crate::plans::Plan;
use crate::storage::{
    BillingStore, Membership, MembershipStore, OrgRole, Payment, PaymentSettlement,
    PaymentStatus, User,
};

// =============================================================================
// SeaORM Entities
// =============================================================================

mod entity {
    use sea_orm::entity::prelude::*;

    pub mod user {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "users")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: Uuid,
            #[sea_orm(unique)]
            pub email: String,
            pub name: Option<String>,
            pub plan: String,
            pub created_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod payment {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "payments")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: Uuid,
            pub user_id: Uuid,
            pub amount_cents: i64,
            pub currency: String,
            pub plan: Option<String>,
            pub status: String,
            pub payer_email: Option<String>,
            pub preference_id: Option<String>,
            pub external_payment_id: Option<String>,
            #[sea_orm(column_type = "JsonBinary", nullable)]
            pub gateway_response: Option<Json>,
            pub paid_at: Option<DateTimeWithTimeZone>,
            pub expires_at: Option<DateTimeWithTimeZone>,
            pub created_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod org_membership {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "org_memberships")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub org_id: Uuid,
            #[sea_orm(primary_key, auto_increment = false)]
            pub user_id: Uuid,
            pub role: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{org_membership, payment, user};

// =============================================================================
// Conversions
// =============================================================================

fn model_to_user(model: user::Model) -> User {
    User {
        id: model.id,
        email: model.email,
        name: model.name,
        plan: Plan::from_db(&model.plan),
        created_at: model.created_at.with_timezone(&Utc),
    }
}

fn model_to_payment(model: payment::Model) -> Payment {
    Payment {
        id: model.id,
        user_id: model.user_id,
        amount_cents: model.amount_cents,
        currency: model.currency,
        plan: model.plan.as_deref().map(Plan::from_db),
        status: PaymentStatus::from_gateway(&model.status),
        payer_email: model.payer_email,
        preference_id: model.preference_id,
        external_payment_id: model.external_payment_id,
        gateway_response: model.gateway_response,
        paid_at: model.paid_at.map(|d| d.with_timezone(&Utc)),
        expires_at: model.expires_at.map(|d| d.with_timezone(&Utc)),
        created_at: model.created_at.with_timezone(&Utc),
    }
}

fn payment_to_active_model(p: &Payment) -> payment::ActiveModel {
    payment::ActiveModel {
        id: Set(p.id),
        user_id: Set(p.user_id),
        amount_cents: Set(p.amount_cents),
        currency: Set(p.currency.clone()),
        plan: Set(p.plan.map(|plan| plan.as_str().to_string())),
        status: Set(p.status.as_str().to_string()),
        payer_email: Set(p.payer_email.clone()),
        preference_id: Set(p.preference_id.clone()),
        external_payment_id: Set(p.external_payment_id.clone()),
        gateway_response: Set(p.gateway_response.clone()),
        paid_at: Set(p.paid_at.map(|d| d.fixed_offset())),
        expires_at: Set(p.expires_at.map(|d| d.fixed_offset())),
        created_at: Set(p.created_at.fixed_offset()),
    }
}

fn model_to_membership(model: org_membership::Model) -> Membership {
    Membership {
        org_id: model.org_id,
        user_id: model.user_id,
        role: model.role.parse().unwrap_or(OrgRole::Member),
    }
}

// =============================================================================
// SeaOrmBillingStore
// =============================================================================

/// SeaORM-backed implementation of [`BillingStore`] and [`MembershipStore`].
#[derive(Clone, Debug)]
pub struct SeaOrmBillingStore {
    db: DatabaseConnection,
}

impl SeaOrmBillingStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Get a reference to the underlying database connection.
    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl BillingStore for SeaOrmBillingStore {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let model = user::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(model.map(model_to_user))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let model = user::Entity::find()
            .filter(user::Column::Email.eq(email))
            .one(&self.db)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(model.map(model_to_user))
    }

    async fn set_user_plan(&self, id: Uuid, plan: Plan) -> Result<()> {
        // Zero rows affected means the user is gone; that is a no-op here.
        user::Entity::update_many()
            .col_expr(user::Column::Plan, Expr::value(plan.as_str()))
            .filter(user::Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_paid_users(&self) -> Result<Vec<User>> {
        let models = user::Entity::find()
            .filter(user::Column::Plan.ne(Plan::Free.as_str()))
            .all(&self.db)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(models.into_iter().map(model_to_user).collect())
    }

    async fn create_payment(&self, p: &Payment) -> Result<()> {
        payment::Entity::insert(payment_to_active_model(p))
            .exec(&self.db)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>> {
        let model = payment::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(model.map(model_to_payment))
    }

    async fn set_preference_id(&self, id: Uuid, preference_id: &str) -> Result<()> {
        payment::Entity::update_many()
            .col_expr(payment::Column::PreferenceId, Expr::value(preference_id))
            .filter(payment::Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }

    async fn latest_active_approved(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Payment>> {
        let model = payment::Entity::find()
            .filter(payment::Column::UserId.eq(user_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Approved.as_str()))
            .filter(
                Condition::any()
                    .add(payment::Column::ExpiresAt.is_null())
                    .add(payment::Column::ExpiresAt.gt(now.fixed_offset())),
            )
            .order_by_desc(payment::Column::PaidAt)
            .one(&self.db)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(model.map(model_to_payment))
    }

    async fn pending_payments(&self, user_id: Uuid) -> Result<Vec<Payment>> {
        let models = payment::Entity::find()
            .filter(payment::Column::UserId.eq(user_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending.as_str()))
            .order_by_desc(payment::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(models.into_iter().map(model_to_payment).collect())
    }

    async fn settle_payment(&self, id: Uuid, settlement: &PaymentSettlement) -> Result<bool> {
        // UPDATE payments SET ... WHERE id = $1 AND status <> 'approved'.
        // The predicate makes approval exactly-once under concurrency; the
        // affected-row count tells the caller whether it won.
        let result = payment::Entity::update_many()
            .col_expr(
                payment::Column::Status,
                Expr::value(settlement.status.as_str()),
            )
            .col_expr(
                payment::Column::ExternalPaymentId,
                Expr::value(Some(settlement.external_payment_id.clone())),
            )
            .col_expr(
                payment::Column::GatewayResponse,
                Expr::value(Some(settlement.gateway_response.clone())),
            )
            .col_expr(
                payment::Column::PaidAt,
                Expr::value(settlement.paid_at.map(|d| d.fixed_offset())),
            )
            .col_expr(
                payment::Column::ExpiresAt,
                Expr::value(settlement.expires_at.map(|d| d.fixed_offset())),
            )
            .filter(payment::Column::Id.eq(id))
            .filter(payment::Column::Status.ne(PaymentStatus::Approved.as_str()))
            .exec(&self.db)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::debug!(
            target: "billing::store",
            payment_id = %id,
            status = %settlement.status,
            rows_affected = result.rows_affected,
            "conditional settle executed"
        );

        Ok(result.rows_affected > 0)
    }
}

#[async_trait]
impl MembershipStore for SeaOrmBillingStore {
    async fn memberships_of(&self, user_id: Uuid) -> Result<Vec<Membership>> {
        let models = org_membership::Entity::find()
            .filter(org_membership::Column::UserId.eq(user_id))
            .all(&self.db)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(models.into_iter().map(model_to_membership).collect())
    }

    async fn owners_of(&self, org_ids: &[Uuid]) -> Result<Vec<Membership>> {
        if org_ids.is_empty() {
            return Ok(Vec::new());
        }
        let models = org_membership::Entity::find()
            .filter(org_membership::Column::Role.eq(OrgRole::Owner.as_str()))
            .filter(org_membership::Column::OrgId.is_in(org_ids.iter().copied()))
            .all(&self.db)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(models.into_iter().map(model_to_membership).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_round_trip() {
        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount_cents: 9_900,
            currency: "usd".to_string(),
            plan: Some(Plan::Pro),
            status: PaymentStatus::Approved,
            payer_email: Some("buyer@example.com".to_string()),
            preference_id: Some("pref-1".to_string()),
            external_payment_id: Some("gw-1".to_string()),
            gateway_response: Some(serde_json::json!({"status": "approved"})),
            paid_at: Some(now),
            expires_at: Some(now + chrono::Duration::days(365)),
            created_at: now,
        };

        let active = payment_to_active_model(&payment);
        let model = payment::Model {
            id: payment.id,
            user_id: payment.user_id,
            amount_cents: 9_900,
            currency: "usd".to_string(),
            plan: active.plan.clone().unwrap(),
            status: active.status.clone().unwrap(),
            payer_email: payment.payer_email.clone(),
            preference_id: payment.preference_id.clone(),
            external_payment_id: payment.external_payment_id.clone(),
            gateway_response: payment.gateway_response.clone(),
            paid_at: payment.paid_at.map(|d| d.fixed_offset()),
            expires_at: payment.expires_at.map(|d| d.fixed_offset()),
            created_at: now.fixed_offset(),
        };

        assert_eq!(model_to_payment(model), payment);
    }

    #[test]
    fn test_legacy_rows_degrade_gracefully() {
        let now = Utc::now().fixed_offset();
        let model = payment::Model {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount_cents: 1_000,
            currency: "usd".to_string(),
            plan: None,
            status: "weird_legacy_status".to_string(),
            payer_email: None,
            preference_id: None,
            external_payment_id: None,
            gateway_response: None,
            paid_at: None,
            expires_at: None,
            created_at: now,
        };

        let payment = model_to_payment(model);
        assert_eq!(payment.plan, None);
        assert_eq!(payment.status, PaymentStatus::Pending);

        let user_model = user::Model {
            id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            name: None,
            plan: "retired-tier".to_string(),
            created_at: now,
        };
        assert_eq!(model_to_user(user_model).plan, Plan::Free);
    }
}
