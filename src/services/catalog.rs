//! Catalog management service

use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use super::locks::BookLocks;
use crate::{
    error::{AppError, AppResult},
    models::{Book, BookQuery, BookStats, CreateBook, UpdateBook},
    repository::Repository,
};

#[derive(Clone)]
pub struct CatalogService {
    repository: Repository,
    locks: BookLocks,
}

impl CatalogService {
    pub fn new(repository: Repository, locks: BookLocks) -> Self {
        Self { repository, locks }
    }

    /// Catalog a new title with every copy on the shelf
    pub async fn create_book(&self, request: CreateBook) -> AppResult<Book> {
        request.validate()?;
        let request = request.normalized();

        let book = Book {
            id: Uuid::new_v4(),
            title: request.title,
            author: request.author,
            isbn: request.isbn,
            category: request.category,
            total_copies: request.total_copies,
            available_copies: request.total_copies,
            created_at: Utc::now(),
        };

        let created = self.repository.books.create(&book).await?;
        tracing::info!(
            book_id = %created.id,
            isbn = %created.isbn,
            copies = created.total_copies,
            "Book cataloged"
        );
        Ok(created)
    }

    pub async fn get_book(&self, id: Uuid) -> AppResult<Book> {
        self.repository.books.get(id).await
    }

    /// Search books with filters
    pub async fn search_books(&self, query: &BookQuery) -> AppResult<(Vec<Book>, i64)> {
        self.repository.books.search(query).await
    }

    /// Update descriptive fields and, optionally, the number of owned copies.
    ///
    /// A new total re-derives `available_copies` from the active loans. The
    /// edit is refused when the total would drop below the copies currently
    /// out, or when the stored counters already disagree with the ledger.
    pub async fn update_book(&self, id: Uuid, request: UpdateBook) -> AppResult<Book> {
        request.validate()?;

        let _guard = self.locks.acquire(id).await?;
        let current = self.repository.books.get(id).await?;

        let copies = match request.total_copies {
            Some(total) if total != current.total_copies => {
                Some(self.recount(&current, total).await?)
            }
            _ => None,
        };

        if copies.is_none() && !request.has_details() {
            return Ok(current);
        }

        let mut book = current.clone();
        request.apply_details(&mut book);
        if let Some((total, available)) = copies {
            book.total_copies = total;
            book.available_copies = available;
        }

        let updated = self
            .repository
            .books
            .update(&book, current.available_copies)
            .await?;

        if let Some((total, available)) = copies {
            tracing::info!(book_id = %id, total, available, "Book copy count changed");
        }

        Ok(updated)
    }

    /// New `(total, available)` counters for a changed total
    async fn recount(&self, book: &Book, new_total: i32) -> AppResult<(i32, i32)> {
        let active = self.repository.loans.count_active_for_book(book.id).await?;

        if let Some(mismatch) = book.counter_mismatch(active) {
            tracing::error!(alert = true, book_id = %book.id, "{}", mismatch);
            return Err(AppError::InvariantViolation(mismatch));
        }

        if i64::from(new_total) < active {
            return Err(AppError::InvariantViolation(format!(
                "book {} has {} active loans, total copies cannot drop to {}",
                book.id, active, new_total
            )));
        }

        // active <= new_total, so it fits in i32
        let available = new_total - active as i32;
        Ok((new_total, available))
    }

    /// Withdraw a title no active loan references
    pub async fn delete_book(&self, id: Uuid) -> AppResult<()> {
        let _guard = self.locks.acquire(id).await?;
        self.repository.books.delete(id).await?;
        tracing::info!(book_id = %id, "Book withdrawn");
        Ok(())
    }

    pub async fn stats(&self) -> AppResult<BookStats> {
        self.repository.books.stats().await
    }
}
