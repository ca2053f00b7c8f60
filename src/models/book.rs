//! Book (catalog title) model and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

/// A catalog title together with its copy counters
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Book {
    pub id: Uuid,
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub category: String,
    /// Physical copies owned by the library (at least 1)
    pub total_copies: i32,
    /// Copies currently on the shelf
    pub available_copies: i32,
    pub created_at: DateTime<Utc>,
}

impl Book {
    /// Copies currently out on loan according to the counters
    pub fn copies_on_loan(&self) -> i64 {
        i64::from(self.total_copies) - i64::from(self.available_copies)
    }

    /// Check the counters against the number of active loans in the ledger.
    ///
    /// Returns a description of the mismatch, if any.
    pub fn counter_mismatch(&self, active_loans: i64) -> Option<String> {
        if self.available_copies < 0 || self.available_copies > self.total_copies {
            return Some(format!(
                "book {} has available_copies={} outside 0..={}",
                self.id, self.available_copies, self.total_copies
            ));
        }
        if self.copies_on_loan() != active_loans {
            return Some(format!(
                "book {} has {} copies out by its counters but {} active loans",
                self.id,
                self.copies_on_loan(),
                active_loans
            ));
        }
        None
    }
}

/// Create book request
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateBook {
    #[validate(length(min = 1, message = "Please provide a book title"))]
    pub title: String,
    #[validate(length(min = 1, message = "Please provide an author name"))]
    pub author: String,
    #[validate(length(min = 1, message = "Please provide ISBN"))]
    pub isbn: String,
    #[validate(length(min = 1, message = "Please provide a category"))]
    pub category: String,
    #[validate(range(min = 1, message = "Total copies must be at least 1"))]
    pub total_copies: i32,
}

impl CreateBook {
    /// Trim text fields the way they are stored
    pub fn normalized(mut self) -> Self {
        self.title = self.title.trim().to_string();
        self.author = self.author.trim().to_string();
        self.isbn = self.isbn.trim().to_string();
        self.category = self.category.trim().to_string();
        self
    }
}

/// Update book request.
///
/// `available_copies` is deliberately absent: it is derived from the ledger.
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateBook {
    #[validate(length(min = 1))]
    pub title: Option<String>,
    #[validate(length(min = 1))]
    pub author: Option<String>,
    #[validate(length(min = 1))]
    pub isbn: Option<String>,
    #[validate(length(min = 1))]
    pub category: Option<String>,
    #[validate(range(min = 1, message = "Total copies must be at least 1"))]
    pub total_copies: Option<i32>,
}

impl UpdateBook {
    pub fn has_details(&self) -> bool {
        self.title.is_some()
            || self.author.is_some()
            || self.isbn.is_some()
            || self.category.is_some()
    }

    /// Apply the descriptive fields onto an existing record
    pub fn apply_details(&self, book: &mut Book) {
        if let Some(ref title) = self.title {
            book.title = title.trim().to_string();
        }
        if let Some(ref author) = self.author {
            book.author = author.trim().to_string();
        }
        if let Some(ref isbn) = self.isbn {
            book.isbn = isbn.trim().to_string();
        }
        if let Some(ref category) = self.category {
            book.category = category.trim().to_string();
        }
    }
}

/// Book search parameters
#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
pub struct BookQuery {
    /// Matches title, author or category (case-insensitive)
    pub search: Option<String>,
    pub category: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// Catalog statistics for the dashboard
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BookStats {
    pub total_books: i64,
    pub total_copies: i64,
    pub available_copies: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(total: i32, available: i32) -> Book {
        Book {
            id: Uuid::new_v4(),
            title: "Dune".into(),
            author: "Frank Herbert".into(),
            isbn: "9780441013593".into(),
            category: "Fiction".into(),
            total_copies: total,
            available_copies: available,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_counter_mismatch() {
        assert!(book(3, 1).counter_mismatch(2).is_none());
        assert!(book(3, 1).counter_mismatch(1).is_some());
        assert!(book(3, 4).counter_mismatch(0).is_some());
        assert!(book(3, -1).counter_mismatch(4).is_some());
    }

    #[test]
    fn test_create_book_validation() {
        let request = CreateBook {
            title: "Dune".into(),
            author: "Frank Herbert".into(),
            isbn: "9780441013593".into(),
            category: "Fiction".into(),
            total_copies: 0,
        };
        assert!(request.validate().is_err());
    }
}
