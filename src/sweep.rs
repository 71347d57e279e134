//! Scheduled expiry sweep.
//!
//! Downgrades users whose approved payment silently lapsed without any
//! gateway notification. The resolver performs the same downgrade lazily on
//! read; the sweep is the redundant, eventually-consistent cleanup behind
//! it. Both share [`BillingStore::latest_active_approved`], so they cannot
//! disagree about the same input.

use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};

use chrono::Utc;

use crate::audit::{BillingAuditEvent, BillingAuditLogger};
use crate::config::BillingConfig;
use crate::error::Result;
use crate::plans::Plan;
use crate::storage::BillingStore;

/// Default sweep period: once daily.
const SWEEP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Result of one sweep run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Non-FREE users examined.
    pub scanned: usize,
    /// Users downgraded to FREE.
    pub downgraded: usize,
}

/// The expiry sweep job.
pub struct ExpirySweeper<S: BillingStore, A: BillingAuditLogger> {
    store: S,
    audit: A,
    config: BillingConfig,
}

impl<S: BillingStore, A: BillingAuditLogger> ExpirySweeper<S, A> {
    #[must_use]
    pub fn new(store: S, audit: A, config: BillingConfig) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    /// Run a single sweep over every non-FREE user.
    ///
    /// Whitelisted users are skipped regardless of payment state. Everyone
    /// else keeps their plan only while an approved payment with no expiry
    /// or a future expiry exists.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let users = self.store.list_paid_users().await?;
        let mut report = SweepReport::default();

        for user in users {
            report.scanned += 1;

            if self.config.is_whitelisted(&user.email) {
                continue;
            }

            if self
                .store
                .latest_active_approved(user.id, now)
                .await?
                .is_none()
            {
                self.store.set_user_plan(user.id, Plan::Free).await?;
                self.audit
                    .log(BillingAuditEvent::UserDowngraded { user_id: user.id })
                    .await;
                tracing::info!(
                    target: "billing::sweep",
                    user_id = %user.id,
                    lapsed_plan = %user.plan,
                    "downgraded lapsed subscription"
                );
                report.downgraded += 1;
            }
        }

        tracing::info!(
            target: "billing::sweep",
            scanned = report.scanned,
            downgraded = report.downgraded,
            "expiry sweep completed"
        );
        Ok(report)
    }

    /// Run the sweep daily until a shutdown signal arrives.
    pub async fn start(self, shutdown_rx: mpsc::Receiver<()>) {
        self.start_with_period(SWEEP_PERIOD, shutdown_rx).await;
    }

    /// Run the sweep on a custom period until a shutdown signal arrives.
    ///
    /// The first run happens immediately. A run error is logged and the loop
    /// keeps going; the next tick retries against fresh state.
    pub async fn start_with_period(self, period: Duration, mut shutdown_rx: mpsc::Receiver<()>) {
        tracing::info!(target: "billing::sweep", "expiry sweeper started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.run_once().await {
                        tracing::error!(
                            target: "billing::sweep",
                            error = %err,
                            "expiry sweep failed"
                        );
                    }
                }
            }
        }

        tracing::info!(target: "billing::sweep", "expiry sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoOpAuditLogger;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::{Payment, PaymentStatus, User};
    use chrono::{DateTime, Duration as ChronoDuration};
    use uuid::Uuid;

    fn config() -> BillingConfig {
        BillingConfig::builder()
            .whitelist(["founder@tapfolio.app"])
            .build()
            .unwrap()
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

    fn seed_approved(store: &InMemoryStore, user: &User, expires_at: Option<DateTime<Utc>>) {
        let mut payment = Payment::new_pending(user.id, &user.email, 9_900, "usd", user.plan);
        payment.status = PaymentStatus::Approved;
        payment.paid_at = Some(Utc::now() - ChronoDuration::days(1));
        payment.expires_at = expires_at;
        store.insert_payment(payment);
    }

    #[tokio::test]
    async fn test_sweep_downgrades_exactly_the_lapsed() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        // Two expired PRO users.
        let expired_a = seed_user(&store, "a@example.com", Plan::Pro);
        seed_approved(&store, &expired_a, Some(now - ChronoDuration::days(2)));
        let expired_b = seed_user(&store, "b@example.com", Plan::Pro);
        seed_approved(&store, &expired_b, Some(now - ChronoDuration::hours(1)));

        // One active BUSINESS user.
        let active = seed_user(&store, "c@example.com", Plan::Business);
        seed_approved(&store, &active, Some(now + ChronoDuration::days(100)));

        // One FREE user and one whitelisted user with no payment at all.
        let free = seed_user(&store, "d@example.com", Plan::Free);
        let whitelisted = seed_user(&store, "founder@tapfolio.app", Plan::Enterprise);

        let sweeper = ExpirySweeper::new(store.clone(), NoOpAuditLogger, config());
        let report = sweeper.run_once().await.unwrap();

        assert_eq!(report.scanned, 4); // everyone but the FREE user
        assert_eq!(report.downgraded, 2);

        assert_eq!(store.get_user(expired_a.id).await.unwrap().unwrap().plan, Plan::Free);
        assert_eq!(store.get_user(expired_b.id).await.unwrap().unwrap().plan, Plan::Free);
        assert_eq!(
            store.get_user(active.id).await.unwrap().unwrap().plan,
            Plan::Business
        );
        assert_eq!(store.get_user(free.id).await.unwrap().unwrap().plan, Plan::Free);
        assert_eq!(
            store.get_user(whitelisted.id).await.unwrap().unwrap().plan,
            Plan::Enterprise
        );
    }

    #[tokio::test]
    async fn test_payment_without_expiry_never_lapses() {
        let store = InMemoryStore::new();
        let user = seed_user(&store, "lifetime@example.com", Plan::Pro);
        seed_approved(&store, &user, None);

        let sweeper = ExpirySweeper::new(store.clone(), NoOpAuditLogger, config());
        let report = sweeper.run_once().await.unwrap();

        assert_eq!(report.downgraded, 0);
        assert_eq!(store.get_user(user.id).await.unwrap().unwrap().plan, Plan::Pro);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let store = InMemoryStore::new();
        let user = seed_user(&store, "lapsed@example.com", Plan::Pro);
        seed_approved(&store, &user, Some(Utc::now() - ChronoDuration::days(1)));

        let sweeper = ExpirySweeper::new(store.clone(), NoOpAuditLogger, config());
        assert_eq!(sweeper.run_once().await.unwrap().downgraded, 1);
        // Second run finds nothing left to do.
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(report.downgraded, 0);
    }

    #[tokio::test]
    async fn test_runner_sweeps_and_shuts_down() {
        let store = InMemoryStore::new();
        let user = seed_user(&store, "lapsed@example.com", Plan::Pro);
        seed_approved(&store, &user, Some(Utc::now() - ChronoDuration::days(1)));

        let sweeper = ExpirySweeper::new(store.clone(), NoOpAuditLogger, config());
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(sweeper.start_with_period(Duration::from_millis(10), shutdown_rx));

        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap();

        assert_eq!(store.get_user(user.id).await.unwrap().unwrap().plan, Plan::Free);
    }
}
