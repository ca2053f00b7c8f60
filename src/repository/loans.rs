//! Loans repository for database operations

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Transaction};
use uuid::Uuid;

use super::{begin, map_write_error, LoansStore};
use crate::{
    error::{AppError, AppResult, Entity},
    models::{paginate, Book, InventoryRow, Loan, LoanDetails, LoanQuery, LoanStats, LoanStatus},
};

const DETAILS_SELECT: &str = r#"
    SELECT l.*,
           b.title AS book_title, b.author AS book_author, b.isbn AS book_isbn,
           m.name AS member_name, m.email AS member_email
    FROM loans l
    LEFT JOIN books b ON b.id = l.book_id
    LEFT JOIN members m ON m.id = l.member_id
"#;

const SEARCH_FILTER: &str = r#"
    WHERE ($1::loan_status IS NULL OR l.status = $1)
      AND ($2::uuid IS NULL OR l.member_id = $2)
      AND ($3::uuid IS NULL OR l.book_id = $3)
"#;

#[derive(Clone)]
pub struct LoansRepository {
    pool: Pool<Postgres>,
    lock_timeout: Duration,
}

impl LoansRepository {
    pub fn new(pool: Pool<Postgres>, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    async fn begin(&self) -> AppResult<Transaction<'static, Postgres>> {
        begin(&self.pool, self.lock_timeout).await
    }
}

#[async_trait]
impl LoansStore for LoansRepository {
    async fn get(&self, id: Uuid) -> AppResult<Loan> {
        sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found(Entity::Loan, id))
    }

    async fn find_active(&self, book_id: Uuid, member_id: Uuid) -> AppResult<Option<Loan>> {
        let loan = sqlx::query_as::<_, Loan>(
            "SELECT * FROM loans WHERE book_id = $1 AND member_id = $2 AND status = 'active'",
        )
        .bind(book_id)
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(loan)
    }

    async fn count_active_for_book(&self, book_id: Uuid) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM loans WHERE book_id = $1 AND status = 'active'",
        )
        .bind(book_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn commit_issue(&self, loan: &Loan, expected_available: i32) -> AppResult<Book> {
        let mut tx = self.begin().await?;

        // Blocks a concurrent member delete until this loan is committed
        let member =
            sqlx::query_scalar::<_, Uuid>("SELECT id FROM members WHERE id = $1 FOR SHARE")
                .bind(loan.member_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_write_error)?;
        if member.is_none() {
            tx.rollback().await?;
            return Err(AppError::not_found(Entity::Member, loan.member_id));
        }

        let book = sqlx::query_as::<_, Book>(
            r#"
            UPDATE books SET available_copies = available_copies - 1
            WHERE id = $1 AND available_copies = $2 AND available_copies > 0
            RETURNING *
            "#,
        )
        .bind(loan.book_id)
        .bind(expected_available)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_write_error)?;

        let Some(book) = book else {
            tx.rollback().await?;
            return Err(AppError::Busy(format!(
                "Copies of book {} changed concurrently",
                loan.book_id
            )));
        };

        sqlx::query(
            r#"
            INSERT INTO loans (id, book_id, member_id, issued_at, returned_at, status, issued_by)
            VALUES ($1, $2, $3, $4, NULL, 'active', $5)
            "#,
        )
        .bind(loan.id)
        .bind(loan.book_id)
        .bind(loan.member_id)
        .bind(loan.issued_at)
        .bind(loan.issued_by)
        .execute(&mut *tx)
        .await
        .map_err(map_write_error)?;

        tx.commit().await?;
        Ok(book)
    }

    async fn commit_return(
        &self,
        loan: &Loan,
        returned_at: DateTime<Utc>,
        expected_available: i32,
    ) -> AppResult<(Loan, Book)> {
        let mut tx = self.begin().await?;

        let returned = sqlx::query_as::<_, Loan>(
            r#"
            UPDATE loans SET status = 'returned', returned_at = $2
            WHERE id = $1 AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(loan.id)
        .bind(returned_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_write_error)?;

        let Some(returned) = returned else {
            tx.rollback().await?;
            // Distinguish a purged loan from one returned meanwhile
            self.get(loan.id).await?;
            return Err(AppError::AlreadyReturned);
        };

        let book = sqlx::query_as::<_, Book>(
            r#"
            UPDATE books SET available_copies = available_copies + 1
            WHERE id = $1 AND available_copies = $2 AND available_copies < total_copies
            RETURNING *
            "#,
        )
        .bind(loan.book_id)
        .bind(expected_available)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_write_error)?;

        let Some(book) = book else {
            tx.rollback().await?;
            let current = sqlx::query_as::<_, Book>("SELECT * FROM books WHERE id = $1")
                .bind(loan.book_id)
                .fetch_optional(&self.pool)
                .await?;
            return Err(match current {
                None => AppError::InvariantViolation(format!(
                    "active loan {} references missing book {}",
                    loan.id, loan.book_id
                )),
                Some(b) if b.available_copies >= b.total_copies => {
                    AppError::InvariantViolation(format!(
                        "returning loan {} would raise book {} above {} copies",
                        loan.id, b.id, b.total_copies
                    ))
                }
                Some(b) => {
                    AppError::Busy(format!("Copies of book {} changed concurrently", b.id))
                }
            });
        };

        tx.commit().await?;
        Ok((returned, book))
    }

    async fn search(&self, query: &LoanQuery) -> AppResult<(Vec<LoanDetails>, i64)> {
        let (_, per_page, offset) = paginate(query.page, query.per_page);

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM loans l {}", SEARCH_FILTER))
                .bind(query.status)
                .bind(query.member_id)
                .bind(query.book_id)
                .fetch_one(&self.pool)
                .await?;

        let loans = sqlx::query_as::<_, LoanDetails>(&format!(
            "{} {} ORDER BY l.issued_at DESC LIMIT $4 OFFSET $5",
            DETAILS_SELECT, SEARCH_FILTER
        ))
        .bind(query.status)
        .bind(query.member_id)
        .bind(query.book_id)
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((loans, total))
    }

    async fn details(&self, id: Uuid) -> AppResult<LoanDetails> {
        sqlx::query_as::<_, LoanDetails>(&format!("{} WHERE l.id = $1", DETAILS_SELECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found(Entity::Loan, id))
    }

    async fn delete_returned(&self, id: Uuid) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM loans WHERE id = $1 AND status = 'returned'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            self.get(id).await?;
            return Err(AppError::Conflict(
                "An active loan cannot be purged; return it first".to_string(),
            ));
        }
        Ok(())
    }

    async fn stats(&self) -> AppResult<LoanStats> {
        let (total_active, total_returned): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FILTER (WHERE status = 'active'),
                   COUNT(*) FILTER (WHERE status = 'returned')
            FROM loans
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let recent_active = sqlx::query_as::<_, LoanDetails>(&format!(
            "{} WHERE l.status = $1 ORDER BY l.issued_at DESC LIMIT 5",
            DETAILS_SELECT
        ))
        .bind(LoanStatus::Active)
        .fetch_all(&self.pool)
        .await?;

        Ok(LoanStats {
            total_active,
            total_returned,
            recent_active,
        })
    }

    async fn inventory(&self) -> AppResult<Vec<InventoryRow>> {
        let rows = sqlx::query_as::<_, InventoryRow>(
            r#"
            SELECT b.id AS book_id, b.title, b.total_copies, b.available_copies,
                   COUNT(l.id)::bigint AS active_loans
            FROM books b
            LEFT JOIN loans l ON l.book_id = b.id AND l.status = 'active'
            GROUP BY b.id
            ORDER BY b.title
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
