//! Tapfolio billing - plan entitlements and payment reconciliation.
//!
//! The entitlement engine behind the Tapfolio digital-profile platform:
//! which plan a user effectively has right now, and how asynchronous,
//! possibly duplicated, possibly out-of-order payment-gateway events mutate
//! that state without ever double-crediting a payment or downgrading a
//! still-valid subscriber.
//!
//! # Components
//!
//! - [`plans`] - static catalog mapping each plan to its feature limits
//! - [`entitlements`] - resolves a user's effective plan on every
//!   authorization check (whitelist, own paid plan, org inheritance)
//! - [`checkout`] - creates pending payments and gateway checkout sessions
//! - [`reconcile`] - webhook/polling reconciliation with a conditional-update
//!   state transition that commits each approval exactly once
//! - [`admin`] - operator-issued plan grants with an audit trail
//! - [`sweep`] - scheduled downgrade of lapsed subscriptions
//!
//! The HTTP layer, persistent store, payment gateway, and mailer are all
//! collaborators reached through traits; in-memory and SeaORM store
//! implementations ship with the crate.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tapfolio_billing::{
//!     BillingConfig, EntitlementsManager, Plan,
//!     NoOpAuditLogger, NoOpMailer, Reconciler, WebhookHandler,
//!     storage::memory::InMemoryStore,
//!     LiveGateway,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     tapfolio_billing::init_tracing();
//!
//!     let config = BillingConfig::builder()
//!         .whitelist(["ops@tapfolio.app"])
//!         .price(Plan::Pro, 9_900, "usd")
//!         .price(Plan::Business, 29_900, "usd")
//!         .from_env()
//!         .build()
//!         .unwrap();
//!
//!     let store = InMemoryStore::new();
//!     let gateway = LiveGateway::with_default_config(
//!         std::env::var("GATEWAY_ACCESS_TOKEN").unwrap(),
//!     )
//!     .unwrap();
//!
//!     let entitlements =
//!         EntitlementsManager::new(store.clone(), store.clone(), config.clone());
//!     let reconciler = Reconciler::new(
//!         store.clone(),
//!         gateway,
//!         NoOpMailer,
//!         NoOpAuditLogger,
//!         config,
//!     );
//!     let webhooks = WebhookHandler::new(reconciler, None);
//!     // Mount `webhooks` and `entitlements` in your router.
//!     let _ = (webhooks, entitlements);
//! }
//! ```

pub mod admin;
pub mod audit;
pub mod checkout;
pub mod config;
pub mod entitlements;
mod error;
pub mod gateway;
pub mod live_gateway;
pub mod mailer;
pub mod plans;
pub mod reconcile;
#[cfg(feature = "database")]
pub mod sea_orm_store;
pub mod storage;
pub mod sweep;
pub mod webhook;

// Plan exports
pub use plans::{has_feature, limits_for, Feature, ParsePlanError, Plan, PlanLimits, ThemeQuota};

// Config exports
pub use config::{BillingConfig, BillingConfigBuilder, PlanPrice};

// Error exports
pub use error::{BillingError, Result};

// Storage exports
pub use storage::{
    BillingStore, Membership, MembershipStore, OrgRole, Payment, PaymentSettlement,
    PaymentStatus, User,
};

// Gateway exports
pub use gateway::{CheckoutPreference, GatewayPayment, PaymentGateway, PreferenceRequest};
pub use live_gateway::{InvalidAccessTokenError, LiveGateway, LiveGatewayConfig};

// Entitlement exports
pub use entitlements::{Entitlement, EntitlementsManager};

// Checkout exports
pub use checkout::{CheckoutManager, CheckoutRedirect};

// Reconciler exports
pub use reconcile::{DropReason, ReconcileOutcome, Reconciler};

// Webhook exports
pub use webhook::{WebhookHandler, WebhookNotification, WebhookOutcome};

// Admin exports
pub use admin::{AdminManager, GrantReceipt};

// Sweep exports
pub use sweep::{ExpirySweeper, SweepReport};

// Audit exports
pub use audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger, TracingAuditLogger};

// Mailer exports
pub use mailer::{payment_confirmation, Email, Mailer, NoOpMailer};

// SeaORM storage exports
#[cfg(feature = "database")]
pub use sea_orm_store::SeaOrmBillingStore;

// Test exports
#[cfg(any(test, feature = "test-util"))]
pub use gateway::test::MockGateway;

#[cfg(any(test, feature = "test-util"))]
pub use mailer::test::CaptureMailer;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging with sensible defaults.
///
/// Call early in your application, before constructing any manager.
///
/// # Environment Variables
///
/// - `RUST_LOG`: log level (e.g. "info", "debug", "tapfolio_billing=debug")
/// - `TAPFOLIO_LOG_JSON`: set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("TAPFOLIO_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
