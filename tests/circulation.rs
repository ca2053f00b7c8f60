//! End-to-end circulation scenarios over the in-memory store

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use circulation_server::{
    error::AppError,
    models::{Book, CreateBook, CreateMember, LoanStatus, Member, MemberContact, UpdateBook},
    repository::Repository,
    services::{notifier::Notifier, Services},
    AppResult,
};

/// Notifier whose delivery always fails
struct BrokenNotifier;

#[async_trait]
impl Notifier for BrokenNotifier {
    async fn notify_issued(&self, _: &MemberContact, _: &str, _: DateTime<Utc>) -> AppResult<()> {
        Err(AppError::Internal("smtp unreachable".into()))
    }

    async fn notify_returned(&self, _: &MemberContact, _: &str, _: DateTime<Utc>) -> AppResult<()> {
        Err(AppError::Internal("smtp unreachable".into()))
    }
}

fn services() -> Services {
    Services::with_notifier(
        Repository::in_memory(),
        Arc::new(BrokenNotifier),
        Duration::from_secs(5),
    )
}

async fn book(services: &Services, isbn: &str, copies: i32) -> Book {
    services
        .catalog
        .create_book(CreateBook {
            title: format!("Book {}", isbn),
            author: "Some Author".into(),
            isbn: isbn.into(),
            category: "Fiction".into(),
            total_copies: copies,
        })
        .await
        .unwrap()
}

async fn member(services: &Services, n: usize) -> Member {
    services
        .members
        .create_member(CreateMember {
            name: format!("Member {}", n),
            email: format!("member{}@example.org", n),
            phone: format!("555-01{:02}", n),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_issue_and_return_cycle() {
    let services = services();
    let actor = Uuid::new_v4();
    let book = book(&services, "978-0", 2).await;
    let m1 = member(&services, 1).await;
    let m2 = member(&services, 2).await;

    let first = assert_ok!(services.circulation.issue(book.id, m1.id, actor).await);
    assert_eq!(first.status, LoanStatus::Active);
    assert_eq!(first.issued_by, actor);
    assert_eq!(services.catalog.get_book(book.id).await.unwrap().available_copies, 1);

    let second = assert_ok!(services.circulation.issue(book.id, m2.id, actor).await);
    assert_eq!(services.catalog.get_book(book.id).await.unwrap().available_copies, 0);

    let m3 = member(&services, 3).await;
    let err = assert_err!(services.circulation.issue(book.id, m3.id, actor).await);
    assert!(matches!(err, AppError::Exhausted));

    let returned = assert_ok!(services.circulation.return_loan(first.id).await);
    assert_eq!(returned.status, LoanStatus::Returned);
    assert!(returned.returned_at.is_some());
    assert_eq!(services.catalog.get_book(book.id).await.unwrap().available_copies, 1);

    // The freed copy can go to the waiting member
    assert_ok!(services.circulation.issue(book.id, m3.id, actor).await);
    assert_ok!(services.circulation.return_loan(second.id).await);

    assert!(services.circulation.audit().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_loan_rejected() {
    let services = services();
    let actor = Uuid::new_v4();
    let book = book(&services, "978-1", 3).await;
    let m = member(&services, 1).await;

    let loan = assert_ok!(services.circulation.issue(book.id, m.id, actor).await);
    let err = assert_err!(services.circulation.issue(book.id, m.id, actor).await);
    assert!(matches!(err, AppError::DuplicateLoan));
    assert_eq!(services.catalog.get_book(book.id).await.unwrap().available_copies, 2);

    // Once returned, the member may borrow the same book again
    assert_ok!(services.circulation.return_loan(loan.id).await);
    assert_ok!(services.circulation.issue(book.id, m.id, actor).await);
}

#[tokio::test]
async fn test_second_return_is_rejected() {
    let services = services();
    let book = book(&services, "978-2", 1).await;
    let m = member(&services, 1).await;

    let loan = services.circulation.issue(book.id, m.id, Uuid::new_v4()).await.unwrap();
    assert_ok!(services.circulation.return_loan(loan.id).await);

    let err = assert_err!(services.circulation.return_loan(loan.id).await);
    assert!(matches!(err, AppError::AlreadyReturned));
    assert_eq!(services.catalog.get_book(book.id).await.unwrap().available_copies, 1);
}

#[tokio::test]
async fn test_unknown_references() {
    let services = services();
    let book = book(&services, "978-3", 1).await;
    let m = member(&services, 1).await;

    let err = assert_err!(services.circulation.issue(Uuid::new_v4(), m.id, Uuid::new_v4()).await);
    assert!(matches!(err, AppError::NotFound(..)));

    let err = assert_err!(
        services
            .circulation
            .issue(book.id, Uuid::new_v4(), Uuid::new_v4())
            .await
    );
    assert!(matches!(err, AppError::NotFound(..)));

    let err = assert_err!(services.circulation.return_loan(Uuid::new_v4()).await);
    assert!(matches!(err, AppError::NotFound(..)));

    assert_eq!(services.catalog.get_book(book.id).await.unwrap().available_copies, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_issues_never_oversell() {
    let services = services();
    let book = book(&services, "978-4", 3).await;

    let mut members = Vec::new();
    for n in 0..10 {
        members.push(member(&services, n).await);
    }

    let book_id = book.id;
    let handles: Vec<_> = members
        .into_iter()
        .map(|m| {
            let circulation = services.circulation.clone();
            tokio::spawn(async move { circulation.issue(book_id, m.id, Uuid::new_v4()).await })
        })
        .collect();

    let mut issued = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => issued += 1,
            Err(AppError::Exhausted) => exhausted += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(issued, 3);
    assert_eq!(exhausted, 7);
    assert_eq!(services.catalog.get_book(book.id).await.unwrap().available_copies, 0);
    assert!(services.circulation.audit().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_returns_of_one_loan() {
    let services = services();
    let book = book(&services, "978-5", 2).await;
    let m = member(&services, 1).await;
    let loan_id = services.circulation.issue(book.id, m.id, Uuid::new_v4()).await.unwrap().id;

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let circulation = services.circulation.clone();
            tokio::spawn(async move { circulation.return_loan(loan_id).await })
        })
        .collect();

    let mut returned = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => returned += 1,
            Err(AppError::AlreadyReturned) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(returned, 1);
    assert_eq!(services.catalog.get_book(book.id).await.unwrap().available_copies, 2);
}

#[tokio::test]
async fn test_total_copies_change_rederives_available() {
    let services = services();
    let book = book(&services, "978-6", 3).await;
    let m1 = member(&services, 1).await;
    let m2 = member(&services, 2).await;
    services.circulation.issue(book.id, m1.id, Uuid::new_v4()).await.unwrap();
    services.circulation.issue(book.id, m2.id, Uuid::new_v4()).await.unwrap();

    let updated = assert_ok!(
        services
            .catalog
            .update_book(
                book.id,
                UpdateBook {
                    total_copies: Some(5),
                    ..Default::default()
                },
            )
            .await
    );
    assert_eq!(updated.total_copies, 5);
    assert_eq!(updated.available_copies, 3);

    let err = assert_err!(
        services
            .catalog
            .update_book(
                book.id,
                UpdateBook {
                    total_copies: Some(1),
                    ..Default::default()
                },
            )
            .await
    );
    assert!(matches!(err, AppError::InvariantViolation(_)));
    assert_eq!(services.catalog.get_book(book.id).await.unwrap().total_copies, 5);
}

#[tokio::test]
async fn test_records_with_active_loans_cannot_be_removed() {
    let services = services();
    let book = book(&services, "978-7", 1).await;
    let m = member(&services, 1).await;
    let loan = services.circulation.issue(book.id, m.id, Uuid::new_v4()).await.unwrap();

    assert!(matches!(services.catalog.delete_book(book.id).await, Err(AppError::Conflict(_))));
    assert!(matches!(services.members.delete_member(m.id).await, Err(AppError::Conflict(_))));
    assert!(matches!(services.circulation.purge_loan(loan.id).await, Err(AppError::Conflict(_))));

    services.circulation.return_loan(loan.id).await.unwrap();
    assert_ok!(services.circulation.purge_loan(loan.id).await);
    assert_ok!(services.catalog.delete_book(book.id).await);
    assert_ok!(services.members.delete_member(m.id).await);
}

#[tokio::test]
async fn test_member_loans_and_stats() {
    let services = services();
    let b1 = book(&services, "978-8", 1).await;
    let b2 = book(&services, "978-9", 1).await;
    let m = member(&services, 1).await;

    let first = services.circulation.issue(b1.id, m.id, Uuid::new_v4()).await.unwrap();
    services.circulation.issue(b2.id, m.id, Uuid::new_v4()).await.unwrap();
    services.circulation.return_loan(first.id).await.unwrap();

    let active = services.circulation.member_loans(m.id).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].book_id, b2.id);
    assert_eq!(active[0].member_email.as_deref(), Some("member1@example.org"));

    let stats = services.circulation.stats().await.unwrap();
    assert_eq!(stats.total_active, 1);
    assert_eq!(stats.total_returned, 1);
    assert_eq!(stats.recent_active.len(), 1);
}
