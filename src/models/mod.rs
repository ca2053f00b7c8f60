//! Data models for the circulation server

pub mod actor;
pub mod book;
pub mod loan;
pub mod member;

// Re-export commonly used types
pub use actor::{ActorClaims, Role};
pub use book::{Book, BookQuery, BookStats, CreateBook, UpdateBook};
pub use loan::{InventoryRow, IssueLoan, Loan, LoanDetails, LoanQuery, LoanStats, LoanStatus};
pub use member::{CreateMember, Member, MemberContact, MemberQuery, UpdateMember};

/// Default and maximum page sizes for list endpoints
pub const DEFAULT_PER_PAGE: i64 = 10;
pub const MAX_PER_PAGE: i64 = 100;

/// Resolve optional page parameters into `(page, per_page, offset)`
pub fn paginate(page: Option<i64>, per_page: Option<i64>) -> (i64, i64, i64) {
    let page = page.unwrap_or(1).max(1);
    let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    (page, per_page, (page - 1).saturating_mul(per_page))
}
