//! Books repository for database operations

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use super::{begin, like_pattern, map_write_error, BooksStore};
use crate::{
    error::{AppError, AppResult, Entity},
    models::{paginate, Book, BookQuery, BookStats},
};

const SEARCH_FILTER: &str = r#"
    WHERE ($1::text IS NULL OR title ILIKE $1 OR author ILIKE $1 OR category ILIKE $1)
      AND ($2::text IS NULL OR category ILIKE $2)
"#;

#[derive(Clone)]
pub struct BooksRepository {
    pool: Pool<Postgres>,
    lock_timeout: Duration,
}

impl BooksRepository {
    pub fn new(pool: Pool<Postgres>, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }
}

#[async_trait]
impl BooksStore for BooksRepository {
    async fn create(&self, book: &Book) -> AppResult<Book> {
        sqlx::query_as::<_, Book>(
            r#"
            INSERT INTO books
                (id, title, author, isbn, category, total_copies, available_copies, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(book.id)
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.isbn)
        .bind(&book.category)
        .bind(book.total_copies)
        .bind(book.available_copies)
        .bind(book.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_write_error)
    }

    async fn get(&self, id: Uuid) -> AppResult<Book> {
        sqlx::query_as::<_, Book>("SELECT * FROM books WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found(Entity::Book, id))
    }

    async fn search(&self, query: &BookQuery) -> AppResult<(Vec<Book>, i64)> {
        let (_, per_page, offset) = paginate(query.page, query.per_page);
        let search = query.search.as_deref().map(like_pattern);
        let category = query.category.as_deref().map(like_pattern);

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM books {}", SEARCH_FILTER))
                .bind(&search)
                .bind(&category)
                .fetch_one(&self.pool)
                .await?;

        let books = sqlx::query_as::<_, Book>(&format!(
            "SELECT * FROM books {} ORDER BY created_at DESC LIMIT $3 OFFSET $4",
            SEARCH_FILTER
        ))
        .bind(&search)
        .bind(&category)
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((books, total))
    }

    async fn update(&self, book: &Book, expected_available: i32) -> AppResult<Book> {
        let mut tx = begin(&self.pool, self.lock_timeout).await?;

        let updated = sqlx::query_as::<_, Book>(
            r#"
            UPDATE books
            SET title = $2, author = $3, isbn = $4, category = $5,
                total_copies = $6, available_copies = $7
            WHERE id = $1 AND available_copies = $8
            RETURNING *
            "#,
        )
        .bind(book.id)
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.isbn)
        .bind(&book.category)
        .bind(book.total_copies)
        .bind(book.available_copies)
        .bind(expected_available)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_write_error)?;

        let Some(updated) = updated else {
            tx.rollback().await?;
            self.get(book.id).await?;
            return Err(AppError::Busy(format!(
                "Copies of book {} changed concurrently",
                book.id
            )));
        };

        tx.commit().await?;
        Ok(updated)
    }

    async fn delete(&self, id: Uuid) -> AppResult<()> {
        let mut tx = begin(&self.pool, self.lock_timeout).await?;

        // Row lock first so the active-loan count below sees committed issues
        let exists = sqlx::query_scalar::<_, Uuid>("SELECT id FROM books WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_write_error)?;
        if exists.is_none() {
            return Err(AppError::not_found(Entity::Book, id));
        }

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM loans WHERE book_id = $1 AND status = 'active'",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if active > 0 {
            return Err(AppError::Conflict(format!(
                "Book has {} active loan(s) and cannot be withdrawn",
                active
            )));
        }

        sqlx::query("DELETE FROM books WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn stats(&self) -> AppResult<BookStats> {
        let (total_books, total_copies, available_copies): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(total_copies), 0)::bigint,
                   COALESCE(SUM(available_copies), 0)::bigint
            FROM books
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(BookStats {
            total_books,
            total_copies,
            available_copies,
        })
    }
}
