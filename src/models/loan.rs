//! Loan (ledger entry) model and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// Loan lifecycle: `Active` transitions once, irreversibly, to `Returned`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "loan_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    Active,
    Returned,
}

/// Loan model from database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Loan {
    pub id: Uuid,
    pub book_id: Uuid,
    pub member_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub status: LoanStatus,
    /// Actor who performed the issue
    pub issued_by: Uuid,
}

impl Loan {
    /// A fresh active loan
    pub fn issue(
        book_id: Uuid,
        member_id: Uuid,
        issued_by: Uuid,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            book_id,
            member_id,
            issued_at,
            returned_at: None,
            status: LoanStatus::Active,
            issued_by,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == LoanStatus::Active
    }

    /// The returned form of this loan; `None` when it was already returned
    pub fn returned(&self, returned_at: DateTime<Utc>) -> Option<Self> {
        if !self.is_active() {
            return None;
        }
        Some(Self {
            status: LoanStatus::Returned,
            returned_at: Some(returned_at),
            ..self.clone()
        })
    }
}

/// Loan with book and member details for display.
///
/// Book and member are weak references; a purged record leaves them empty.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct LoanDetails {
    pub id: Uuid,
    pub book_id: Uuid,
    pub member_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub status: LoanStatus,
    pub issued_by: Uuid,
    pub book_title: Option<String>,
    pub book_author: Option<String>,
    pub book_isbn: Option<String>,
    pub member_name: Option<String>,
    pub member_email: Option<String>,
}

/// Issue request
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct IssueLoan {
    pub book_id: Uuid,
    pub member_id: Uuid,
}

/// Loan search parameters
#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
pub struct LoanQuery {
    pub status: Option<LoanStatus>,
    pub member_id: Option<Uuid>,
    pub book_id: Option<Uuid>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// Ledger statistics for the dashboard
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LoanStats {
    pub total_active: i64,
    pub total_returned: i64,
    /// Five most recently issued active loans
    pub recent_active: Vec<LoanDetails>,
}

/// Counters of one book next to its active-loan count
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct InventoryRow {
    pub book_id: Uuid,
    pub title: String,
    pub total_copies: i32,
    pub available_copies: i32,
    pub active_loans: i64,
}

impl InventoryRow {
    pub fn is_consistent(&self) -> bool {
        self.available_copies >= 0
            && self.available_copies <= self.total_copies
            && i64::from(self.total_copies) - i64::from(self.available_copies) == self.active_loans
    }
}
