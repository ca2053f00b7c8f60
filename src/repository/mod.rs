//! Repository layer for persistence
//!
//! Each store is a trait so the circulation engine can run over Postgres or
//! the in-memory backend. The only write paths that touch
//! `available_copies` together with the ledger are
//! [`LoansStore::commit_issue`] and [`LoansStore::commit_return`], and each
//! applies both changes as one atomic unit.

pub mod books;
pub mod loans;
pub mod members;
pub mod memory;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{
        Book, BookQuery, BookStats, InventoryRow, Loan, LoanDetails, LoanQuery, LoanStats, Member,
        MemberQuery,
    },
};

pub use memory::MemoryStore;

/// Catalog store: book records and copy counters
#[async_trait]
pub trait BooksStore: Send + Sync {
    /// Insert a new book; ISBN must be unique
    async fn create(&self, book: &Book) -> AppResult<Book>;

    async fn get(&self, id: Uuid) -> AppResult<Book>;

    async fn search(&self, query: &BookQuery) -> AppResult<(Vec<Book>, i64)>;

    /// Persist descriptive fields and both counters in one write, provided the
    /// stored `available_copies` still equals `expected_available`
    async fn update(&self, book: &Book, expected_available: i32) -> AppResult<Book>;

    /// Delete a book that no active loan references
    async fn delete(&self, id: Uuid) -> AppResult<()>;

    async fn stats(&self) -> AppResult<BookStats>;
}

/// Member store
#[async_trait]
pub trait MembersStore: Send + Sync {
    /// Insert a new member; email must be unique
    async fn create(&self, member: &Member) -> AppResult<Member>;

    async fn get(&self, id: Uuid) -> AppResult<Member>;

    async fn search(&self, query: &MemberQuery) -> AppResult<(Vec<Member>, i64)>;

    async fn update(&self, member: &Member) -> AppResult<Member>;

    /// Delete a member holding no active loan
    async fn delete(&self, id: Uuid) -> AppResult<()>;
}

/// Loan ledger
#[async_trait]
pub trait LoansStore: Send + Sync {
    async fn get(&self, id: Uuid) -> AppResult<Loan>;

    async fn find_active(&self, book_id: Uuid, member_id: Uuid) -> AppResult<Option<Loan>>;

    async fn count_active_for_book(&self, book_id: Uuid) -> AppResult<i64>;

    /// Decrement the book's available copies and insert the active loan, atomically.
    ///
    /// Fails with `Busy` when the counter no longer equals `expected_available`
    /// and with `DuplicateLoan` when an active loan already exists for the pair.
    async fn commit_issue(&self, loan: &Loan, expected_available: i32) -> AppResult<Book>;

    /// Mark the loan returned and increment the book's available copies, atomically.
    ///
    /// Fails with `AlreadyReturned` when the loan is no longer active, with
    /// `InvariantViolation` when the increment would exceed the total, and
    /// with `Busy` when the counter no longer equals `expected_available`.
    async fn commit_return(
        &self,
        loan: &Loan,
        returned_at: DateTime<Utc>,
        expected_available: i32,
    ) -> AppResult<(Loan, Book)>;

    async fn search(&self, query: &LoanQuery) -> AppResult<(Vec<LoanDetails>, i64)>;

    async fn details(&self, id: Uuid) -> AppResult<LoanDetails>;

    /// Purge a returned loan from the ledger
    async fn delete_returned(&self, id: Uuid) -> AppResult<()>;

    async fn stats(&self) -> AppResult<LoanStats>;

    /// Counters of every book next to its active-loan count
    async fn inventory(&self) -> AppResult<Vec<InventoryRow>>;
}

/// Main repository struct holding the stores
#[derive(Clone)]
pub struct Repository {
    pub pool: Option<Pool<Postgres>>,
    pub books: Arc<dyn BooksStore>,
    pub members: Arc<dyn MembersStore>,
    pub loans: Arc<dyn LoansStore>,
}

impl Repository {
    /// Create a Postgres-backed repository.
    ///
    /// `lock_timeout` bounds row-lock waits inside circulation transactions.
    pub fn postgres(pool: Pool<Postgres>, lock_timeout: Duration) -> Self {
        Self {
            books: Arc::new(books::BooksRepository::new(pool.clone(), lock_timeout)),
            members: Arc::new(members::MembersRepository::new(pool.clone(), lock_timeout)),
            loans: Arc::new(loans::LoansRepository::new(pool.clone(), lock_timeout)),
            pool: Some(pool),
        }
    }

    /// Create a repository over a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::from_memory(MemoryStore::default())
    }

    pub fn from_memory(store: MemoryStore) -> Self {
        Self {
            pool: None,
            books: Arc::new(store.clone()),
            members: Arc::new(store.clone()),
            loans: Arc::new(store),
        }
    }

    /// Check that the backing database answers
    pub async fn ping(&self) -> AppResult<()> {
        if let Some(ref pool) = self.pool {
            sqlx::query("SELECT 1").execute(pool).await?;
        }
        Ok(())
    }
}

/// Open a transaction whose row-lock waits are bounded by `lock_timeout`
pub(crate) async fn begin(
    pool: &Pool<Postgres>,
    lock_timeout: Duration,
) -> AppResult<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await?;
    sqlx::query(&format!(
        "SET LOCAL lock_timeout = '{}ms'",
        lock_timeout.as_millis()
    ))
    .execute(&mut *tx)
    .await?;
    Ok(tx)
}

/// Unique index enforcing one active loan per (book, member)
pub(crate) const ONE_ACTIVE_LOAN_INDEX: &str = "loans_one_active_per_member";

/// Translate Postgres write failures into circulation errors
pub(crate) fn map_write_error(error: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(ref db) = error {
        match db.code().as_deref() {
            // lock_not_available, serialization_failure, deadlock_detected
            Some("55P03") | Some("40001") | Some("40P01") => {
                return AppError::Busy("Book is being modified by another transaction".to_string());
            }
            // check_violation on the copy counters
            Some("23514") => {
                return AppError::InvariantViolation(db.message().to_string());
            }
            _ => {}
        }
        if db.is_unique_violation() {
            return match db.constraint() {
                Some(ONE_ACTIVE_LOAN_INDEX) => AppError::DuplicateLoan,
                Some("books_isbn_key") => {
                    AppError::Conflict("A book with this ISBN already exists".to_string())
                }
                Some("members_email_key") => {
                    AppError::Conflict("A member with this email already exists".to_string())
                }
                _ => AppError::Conflict(db.message().to_string()),
            };
        }
    }
    AppError::Database(error)
}

/// Escape a user search term for `ILIKE`
pub(crate) fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}
