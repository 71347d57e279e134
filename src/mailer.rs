//! Mailer trait for billing notifications.
//!
//! This trait abstracts the email backend. Confirmation mail is
//! fire-and-forget: a send failure is logged and never blocks a payment
//! state transition.

use async_trait::async_trait;

use crate::error::Result;
use crate::plans::Plan;

/// An email message to be sent.
#[derive(Debug, Clone)]
pub struct Email {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
}

impl Email {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            text: text.into(),
        }
    }
}

/// Build the payment confirmation message for a freshly approved plan.
#[must_use]
pub fn payment_confirmation(from: &str, to: &str, name: Option<&str>, plan: Plan) -> Email {
    let greeting = name.unwrap_or("there");
    Email::new(
        from,
        to,
        format!("Your Tapfolio {} subscription is active", plan),
        format!(
            "Hi {},\n\nYour payment was received and your account has been upgraded to {}. \
             Your new features are live right now.\n\n— Tapfolio",
            greeting, plan
        ),
    )
}

/// Mailer trait for sending billing emails.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send an email.
    async fn send(&self, email: &Email) -> Result<()>;
}

/// No-op mailer that drops all mail.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMailer;

#[async_trait]
impl Mailer for NoOpMailer {
    async fn send(&self, _email: &Email) -> Result<()> {
        Ok(())
    }
}

/// Test mailer that captures sent messages.
#[cfg(any(test, feature = "test-util"))]
pub mod test {
    use super::*;
    use std::sync::{Arc, RwLock};

    /// Capturing mock of [`Mailer`].
    #[derive(Default, Clone)]
    pub struct CaptureMailer {
        sent: Arc<RwLock<Vec<Email>>>,
        fail: Arc<RwLock<bool>>,
    }

    impl CaptureMailer {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make subsequent sends fail.
        pub fn set_failing(&self, fail: bool) {
            *self.fail.write().unwrap() = fail;
        }

        /// Messages sent so far.
        pub fn sent(&self) -> Vec<Email> {
            self.sent.read().unwrap().clone()
        }
    }

    #[async_trait]
    impl Mailer for CaptureMailer {
        async fn send(&self, email: &Email) -> Result<()> {
            if *self.fail.read().unwrap() {
                return Err(crate::error::BillingError::service_unavailable(
                    "mailer down",
                ));
            }
            self.sent.write().unwrap().push(email.clone());
            Ok(())
        }
    }
}
