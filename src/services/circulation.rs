//! Circulation engine: issue and return transactions
//!
//! Each transaction runs under the lock of the one book it touches:
//! read the book and ledger, validate, then hand both writes to the store as
//! a single atomic commit. Member notifications are sent after the lock is
//! released and never influence the outcome.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::{
    locks::BookLocks,
    notifier::{self, Notification, Notifier},
};
use crate::{
    error::{AppError, AppResult, Entity},
    models::{InventoryRow, Loan, LoanDetails, LoanQuery, LoanStats, LoanStatus, MAX_PER_PAGE},
    repository::Repository,
};

#[derive(Clone)]
pub struct CirculationService {
    repository: Repository,
    locks: BookLocks,
    notifier: Arc<dyn Notifier>,
}

/// Log a ledger/counter divergence at error level and pass it on
fn raise(error: AppError) -> AppError {
    if let AppError::InvariantViolation(ref detail) = error {
        tracing::error!(alert = true, "Circulation invariant violated: {}", detail);
    }
    error
}

impl CirculationService {
    pub fn new(repository: Repository, locks: BookLocks, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            repository,
            locks,
            notifier,
        }
    }

    /// Issue a copy of a book to a member on behalf of `actor_id`.
    ///
    /// Preconditions are checked in order: book exists, member exists,
    /// a copy is available, and the member holds no active loan of the book.
    pub async fn issue(&self, book_id: Uuid, member_id: Uuid, actor_id: Uuid) -> AppResult<Loan> {
        let guard = self.locks.acquire(book_id).await?;

        let book = self.repository.books.get(book_id).await?;
        let member = self.repository.members.get(member_id).await?;

        let active = self.repository.loans.count_active_for_book(book_id).await?;
        if let Some(mismatch) = book.counter_mismatch(active) {
            return Err(raise(AppError::InvariantViolation(mismatch)));
        }

        if book.available_copies <= 0 {
            tracing::debug!(%book_id, %member_id, "Issue rejected: no copies available");
            return Err(AppError::Exhausted);
        }

        if self
            .repository
            .loans
            .find_active(book_id, member_id)
            .await?
            .is_some()
        {
            tracing::debug!(%book_id, %member_id, "Issue rejected: duplicate active loan");
            return Err(AppError::DuplicateLoan);
        }

        let loan = Loan::issue(book_id, member_id, actor_id, Utc::now());
        let updated = self
            .repository
            .loans
            .commit_issue(&loan, book.available_copies)
            .await
            .map_err(raise)?;
        drop(guard);

        tracing::info!(
            loan_id = %loan.id,
            %book_id,
            %member_id,
            issued_by = %actor_id,
            available = updated.available_copies,
            "Book issued"
        );

        notifier::dispatch(
            self.notifier.clone(),
            Notification::Issued {
                contact: member.contact(),
                book_title: updated.title,
                at: loan.issued_at,
            },
        );

        Ok(loan)
    }

    /// Return an active loan, putting its copy back on the shelf
    pub async fn return_loan(&self, loan_id: Uuid) -> AppResult<Loan> {
        let loan = self.repository.loans.get(loan_id).await?;
        if !loan.is_active() {
            return Err(AppError::AlreadyReturned);
        }

        let guard = self.locks.acquire(loan.book_id).await?;

        // Another return may have completed while we waited for the lock
        let loan = self.repository.loans.get(loan_id).await?;
        if !loan.is_active() {
            return Err(AppError::AlreadyReturned);
        }

        let book = match self.repository.books.get(loan.book_id).await {
            Ok(book) => book,
            Err(AppError::NotFound(Entity::Book, _)) => {
                return Err(raise(AppError::InvariantViolation(format!(
                    "active loan {} references missing book {}",
                    loan.id, loan.book_id
                ))));
            }
            Err(e) => return Err(e),
        };

        let active = self.repository.loans.count_active_for_book(book.id).await?;
        if let Some(mismatch) = book.counter_mismatch(active) {
            return Err(raise(AppError::InvariantViolation(mismatch)));
        }

        let (returned, updated) = self
            .repository
            .loans
            .commit_return(&loan, Utc::now(), book.available_copies)
            .await
            .map_err(raise)?;
        drop(guard);

        tracing::info!(
            loan_id = %returned.id,
            book_id = %returned.book_id,
            member_id = %returned.member_id,
            available = updated.available_copies,
            "Book returned"
        );

        match self.repository.members.get(returned.member_id).await {
            Ok(member) => {
                notifier::dispatch(
                    self.notifier.clone(),
                    Notification::Returned {
                        contact: member.contact(),
                        book_title: updated.title,
                        at: returned.returned_at.unwrap_or_else(Utc::now),
                    },
                );
            }
            Err(e) => {
                tracing::warn!(loan_id = %returned.id, error = %e, "Skipping return notification");
            }
        }

        Ok(returned)
    }

    pub async fn get_loan(&self, id: Uuid) -> AppResult<LoanDetails> {
        self.repository.loans.details(id).await
    }

    pub async fn search_loans(&self, query: &LoanQuery) -> AppResult<(Vec<LoanDetails>, i64)> {
        self.repository.loans.search(query).await
    }

    /// Active loans held by a member
    pub async fn member_loans(&self, member_id: Uuid) -> AppResult<Vec<LoanDetails>> {
        // Verify member exists
        self.repository.members.get(member_id).await?;

        let mut query = LoanQuery {
            status: Some(LoanStatus::Active),
            member_id: Some(member_id),
            page: Some(1),
            per_page: Some(MAX_PER_PAGE),
            ..Default::default()
        };

        let mut loans = Vec::new();
        loop {
            let (batch, total) = self.repository.loans.search(&query).await?;
            let exhausted = batch.is_empty();
            loans.extend(batch);
            if exhausted || loans.len() as i64 >= total {
                return Ok(loans);
            }
            query.page = query.page.map(|page| page + 1);
        }
    }

    /// Administrative purge of a returned loan
    pub async fn purge_loan(&self, id: Uuid) -> AppResult<()> {
        self.repository.loans.delete_returned(id).await?;
        tracing::info!(loan_id = %id, "Loan purged");
        Ok(())
    }

    pub async fn stats(&self) -> AppResult<LoanStats> {
        self.repository.loans.stats().await
    }

    /// Books whose counters disagree with the ledger
    pub async fn audit(&self) -> AppResult<Vec<InventoryRow>> {
        let discrepancies: Vec<InventoryRow> = self
            .repository
            .loans
            .inventory()
            .await?
            .into_iter()
            .filter(|row| !row.is_consistent())
            .collect();

        for row in &discrepancies {
            tracing::error!(
                alert = true,
                book_id = %row.book_id,
                total = row.total_copies,
                available = row.available_copies,
                active_loans = row.active_loans,
                "Inventory audit found inconsistent counters"
            );
        }

        Ok(discrepancies)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        models::{Book, Member, MemberQuery},
        repository::{BooksStore, LoansStore, MembersStore, MemoryStore},
        services::notifier::MockNotifier,
    };

    struct Fixture {
        service: CirculationService,
        store: MemoryStore,
        locks: BookLocks,
    }

    fn silent_notifier() -> MockNotifier {
        let mut notifier = MockNotifier::new();
        notifier.expect_notify_issued().returning(|_, _, _| Ok(()));
        notifier.expect_notify_returned().returning(|_, _, _| Ok(()));
        notifier
    }

    fn fixture(notifier: MockNotifier) -> Fixture {
        let store = MemoryStore::new();
        let locks = BookLocks::new(Duration::from_millis(100));
        let service = CirculationService::new(
            Repository::from_memory(store.clone()),
            locks.clone(),
            Arc::new(notifier),
        );
        Fixture {
            service,
            store,
            locks,
        }
    }

    async fn add_book(fixture: &Fixture, copies: i32) -> Book {
        let book = Book {
            id: Uuid::new_v4(),
            title: "Neuromancer".into(),
            author: "William Gibson".into(),
            isbn: Uuid::new_v4().to_string(),
            category: "Fiction".into(),
            total_copies: copies,
            available_copies: copies,
            created_at: Utc::now(),
        };
        fixture.service.repository.books.create(&book).await.unwrap()
    }

    async fn add_member(fixture: &Fixture) -> Member {
        let id = Uuid::new_v4();
        let member = Member {
            id,
            name: "Case".into(),
            email: format!("{}@sprawl.net", id),
            phone: "555".into(),
            membership_date: Utc::now(),
        };
        fixture.service.repository.members.create(&member).await.unwrap()
    }

    async fn available(fixture: &Fixture, book: &Book) -> i32 {
        fixture.service.repository.books.get(book.id).await.unwrap().available_copies
    }

    #[tokio::test]
    async fn test_preconditions_checked_in_order() {
        let f = fixture(silent_notifier());
        let actor = Uuid::new_v4();
        let book = add_book(&f, 1).await;
        let member = add_member(&f).await;

        let err = f.service.issue(Uuid::new_v4(), Uuid::new_v4(), actor).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(Entity::Book, _)));

        let err = f.service.issue(book.id, Uuid::new_v4(), actor).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(Entity::Member, _)));

        f.service.issue(book.id, member.id, actor).await.unwrap();

        // Exhausted is reported before the duplicate check
        let err = f.service.issue(book.id, member.id, actor).await.unwrap_err();
        assert!(matches!(err, AppError::Exhausted));
    }

    #[tokio::test]
    async fn test_issue_records_actor_and_decrements() {
        let f = fixture(silent_notifier());
        let actor = Uuid::new_v4();
        let book = add_book(&f, 2).await;
        let member = add_member(&f).await;

        let loan = f.service.issue(book.id, member.id, actor).await.unwrap();
        assert_eq!(loan.status, LoanStatus::Active);
        assert_eq!(loan.issued_by, actor);
        assert!(loan.returned_at.is_none());
        assert_eq!(available(&f, &book).await, 1);
    }

    #[tokio::test]
    async fn test_second_return_is_rejected() {
        let f = fixture(silent_notifier());
        let book = add_book(&f, 1).await;
        let member = add_member(&f).await;
        let loan = f.service.issue(book.id, member.id, Uuid::new_v4()).await.unwrap();

        let returned = f.service.return_loan(loan.id).await.unwrap();
        assert_eq!(returned.status, LoanStatus::Returned);
        assert!(returned.returned_at.is_some());

        let err = f.service.return_loan(loan.id).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyReturned));
        assert_eq!(available(&f, &book).await, 1);

        let err = f.service.return_loan(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(Entity::Loan, _)));
    }

    #[tokio::test]
    async fn test_return_past_total_is_invariant_violation() {
        let f = fixture(silent_notifier());
        let book = add_book(&f, 2).await;
        let member = add_member(&f).await;
        let loan = f.service.issue(book.id, member.id, Uuid::new_v4()).await.unwrap();

        f.store.corrupt_available_copies(book.id, 2);

        let err = f.service.return_loan(loan.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvariantViolation(_)));
        // Nothing was clamped or applied
        assert_eq!(available(&f, &book).await, 2);
        assert!(f.service.repository.loans.get(loan.id).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn test_issue_refuses_inconsistent_book() {
        let f = fixture(silent_notifier());
        let book = add_book(&f, 3).await;
        let member = add_member(&f).await;
        f.store.corrupt_available_copies(book.id, 1);

        let err = f.service.issue(book.id, member.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::InvariantViolation(_)));

        let audit = f.service.audit().await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].book_id, book.id);
    }

    #[tokio::test]
    async fn test_locked_book_reports_busy() {
        let f = fixture(silent_notifier());
        let book = add_book(&f, 1).await;
        let member = add_member(&f).await;

        let held = f.locks.acquire(book.id).await.unwrap();
        let err = f.service.issue(book.id, member.id, Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(available(&f, &book).await, 1);

        drop(held);
        assert!(f.service.issue(book.id, member.id, Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_undo_issue() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut notifier = MockNotifier::new();
        notifier.expect_notify_issued().times(1).returning(move |contact, title, _| {
            tx.send((contact.email.clone(), title.to_string())).ok();
            Err(AppError::Internal("smtp unreachable".into()))
        });

        let f = fixture(notifier);
        let book = add_book(&f, 1).await;
        let member = add_member(&f).await;

        let loan = f.service.issue(book.id, member.id, Uuid::new_v4()).await.unwrap();

        let (email, title) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(email, member.email);
        assert_eq!(title, "Neuromancer");

        assert!(f.service.repository.loans.get(loan.id).await.unwrap().is_active());
        assert_eq!(available(&f, &book).await, 0);
    }

    #[tokio::test]
    async fn test_return_notifies_member() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut notifier = MockNotifier::new();
        notifier.expect_notify_issued().returning(|_, _, _| Ok(()));
        notifier.expect_notify_returned().times(1).returning(move |contact, _, _| {
            tx.send(contact.email.clone()).ok();
            Ok(())
        });

        let f = fixture(notifier);
        let book = add_book(&f, 1).await;
        let member = add_member(&f).await;
        let loan = f.service.issue(book.id, member.id, Uuid::new_v4()).await.unwrap();
        f.service.return_loan(loan.id).await.unwrap();

        let email = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(email, member.email);
    }

    #[tokio::test]
    async fn test_purge_only_returned_loans() {
        let f = fixture(silent_notifier());
        let book = add_book(&f, 1).await;
        let member = add_member(&f).await;
        let loan = f.service.issue(book.id, member.id, Uuid::new_v4()).await.unwrap();

        let err = f.service.purge_loan(loan.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        f.service.return_loan(loan.id).await.unwrap();
        f.service.purge_loan(loan.id).await.unwrap();
        assert!(f.service.get_loan(loan.id).await.is_err());
        assert_eq!(available(&f, &book).await, 1);
    }

    #[tokio::test]
    async fn test_member_loans_lists_active_only() {
        let f = fixture(silent_notifier());
        let first = add_book(&f, 1).await;
        let second = add_book(&f, 1).await;
        let member = add_member(&f).await;

        let loan = f.service.issue(first.id, member.id, Uuid::new_v4()).await.unwrap();
        f.service.issue(second.id, member.id, Uuid::new_v4()).await.unwrap();
        f.service.return_loan(loan.id).await.unwrap();

        let loans = f.service.member_loans(member.id).await.unwrap();
        assert_eq!(loans.len(), 1);
        assert_eq!(loans[0].book_id, second.id);
        assert_eq!(loans[0].member_email.as_deref(), Some(member.email.as_str()));
    }

    #[tokio::test]
    async fn test_member_loans_spans_every_page() {
        let f = fixture(silent_notifier());
        let member = add_member(&f).await;

        let count = MAX_PER_PAGE as usize + 5;
        for _ in 0..count {
            let book = add_book(&f, 1).await;
            f.service.issue(book.id, member.id, Uuid::new_v4()).await.unwrap();
        }

        let loans = f.service.member_loans(member.id).await.unwrap();
        assert_eq!(loans.len(), count);
    }

    /// Member store that removes the member right after handing it out
    struct VanishingMembers {
        inner: MemoryStore,
    }

    #[async_trait::async_trait]
    impl MembersStore for VanishingMembers {
        async fn create(&self, member: &Member) -> AppResult<Member> {
            MembersStore::create(&self.inner, member).await
        }

        async fn get(&self, id: Uuid) -> AppResult<Member> {
            let member = MembersStore::get(&self.inner, id).await?;
            MembersStore::delete(&self.inner, id).await?;
            Ok(member)
        }

        async fn search(&self, query: &MemberQuery) -> AppResult<(Vec<Member>, i64)> {
            MembersStore::search(&self.inner, query).await
        }

        async fn update(&self, member: &Member) -> AppResult<Member> {
            MembersStore::update(&self.inner, member).await
        }

        async fn delete(&self, id: Uuid) -> AppResult<()> {
            MembersStore::delete(&self.inner, id).await
        }
    }

    #[tokio::test]
    async fn test_member_deleted_during_issue_leaves_no_loan() {
        let store = MemoryStore::new();
        let repository = Repository {
            pool: None,
            books: Arc::new(store.clone()),
            members: Arc::new(VanishingMembers {
                inner: store.clone(),
            }),
            loans: Arc::new(store.clone()),
        };
        let service = CirculationService::new(
            repository,
            BookLocks::new(Duration::from_millis(100)),
            Arc::new(silent_notifier()),
        );

        let book = Book {
            id: Uuid::new_v4(),
            title: "Count Zero".into(),
            author: "William Gibson".into(),
            isbn: Uuid::new_v4().to_string(),
            category: "Fiction".into(),
            total_copies: 1,
            available_copies: 1,
            created_at: Utc::now(),
        };
        BooksStore::create(&store, &book).await.unwrap();
        let member = Member {
            id: Uuid::new_v4(),
            name: "Bobby".into(),
            email: "bobby@sprawl.net".into(),
            phone: "555".into(),
            membership_date: Utc::now(),
        };
        MembersStore::create(&store, &member).await.unwrap();

        let err = service.issue(book.id, member.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(Entity::Member, _)));

        assert_eq!(store.count_active_for_book(book.id).await.unwrap(), 0);
        let stored = BooksStore::get(&store, book.id).await.unwrap();
        assert_eq!(stored.available_copies, 1);
    }
}
