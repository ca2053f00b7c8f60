//! Post-commit member notifications
//!
//! Notifications are dispatched on a detached task after a circulation
//! transaction has committed and released its lock. Their outcome is only
//! logged; nothing is retried and nothing is rolled back.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::{error::AppResult, models::MemberContact};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_issued(
        &self,
        contact: &MemberContact,
        book_title: &str,
        issued_at: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn notify_returned(
        &self,
        contact: &MemberContact,
        book_title: &str,
        returned_at: DateTime<Utc>,
    ) -> AppResult<()>;
}

/// Notifier used when email delivery is disabled
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_issued(
        &self,
        contact: &MemberContact,
        book_title: &str,
        issued_at: DateTime<Utc>,
    ) -> AppResult<()> {
        tracing::info!(
            to = %contact.email,
            book = %book_title,
            %issued_at,
            "Issue notification (email disabled)"
        );
        Ok(())
    }

    async fn notify_returned(
        &self,
        contact: &MemberContact,
        book_title: &str,
        returned_at: DateTime<Utc>,
    ) -> AppResult<()> {
        tracing::info!(
            to = %contact.email,
            book = %book_title,
            %returned_at,
            "Return notification (email disabled)"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Notification {
    Issued {
        contact: MemberContact,
        book_title: String,
        at: DateTime<Utc>,
    },
    Returned {
        contact: MemberContact,
        book_title: String,
        at: DateTime<Utc>,
    },
}

/// Send a notification on its own task
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (kind, result) = match &notification {
            Notification::Issued {
                contact,
                book_title,
                at,
            } => ("issue", notifier.notify_issued(contact, book_title, *at).await),
            Notification::Returned {
                contact,
                book_title,
                at,
            } => ("return", notifier.notify_returned(contact, book_title, *at).await),
        };

        if let Err(e) = result {
            tracing::warn!(kind, error = %e, "Failed to send {} notification", kind);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    fn contact() -> MemberContact {
        MemberContact {
            name: "Ada".into(),
            email: "ada@example.org".into(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failures() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify_returned()
            .times(1)
            .returning(|_, _, _| Err(AppError::Internal("smtp unreachable".into())));

        let handle = dispatch(
            Arc::new(notifier),
            Notification::Returned {
                contact: contact(),
                book_title: "Dune".into(),
                at: Utc::now(),
            },
        );
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_routes_issue() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify_issued()
            .withf(|c, title, _| c.email == "ada@example.org" && title.to_string() == "Dune")
            .times(1)
            .returning(|_, _, _| Ok(()));
        notifier.expect_notify_returned().never();

        dispatch(
            Arc::new(notifier),
            Notification::Issued {
                contact: contact(),
                book_title: "Dune".into(),
                at: Utc::now(),
            },
        )
        .await
        .unwrap();
    }
}
