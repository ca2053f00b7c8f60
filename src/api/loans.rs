//! Circulation endpoints: issue, return and the loan ledger

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{InventoryRow, IssueLoan, Loan, LoanDetails, LoanQuery, LoanStats},
};

use super::{Actor, LoanPage, Page};

/// Return response with the updated loan
#[derive(Serialize, ToSchema)]
pub struct ReturnResponse {
    /// Return status
    pub status: String,
    pub loan: Loan,
}

/// Inventory audit result
#[derive(Serialize, ToSchema)]
pub struct AuditResponse {
    pub consistent: bool,
    /// Books whose counters disagree with their active loans
    pub discrepancies: Vec<InventoryRow>,
}

/// Issue a book to a member
#[utoipa::path(
    post,
    path = "/loans",
    tag = "loans",
    security(("bearer_auth" = [])),
    request_body = IssueLoan,
    responses(
        (status = 201, description = "Loan created", body = Loan),
        (status = 404, description = "Book or member not found"),
        (status = 409, description = "No copies available or book already issued to this member"),
        (status = 503, description = "Book busy, retry")
    )
)]
pub async fn issue_loan(
    State(state): State<crate::AppState>,
    Actor(claims): Actor,
    Json(request): Json<IssueLoan>,
) -> AppResult<(StatusCode, Json<Loan>)> {
    claims.require_staff()?;

    let loan = state
        .services
        .circulation
        .issue(request.book_id, request.member_id, claims.sub)
        .await?;

    Ok((StatusCode::CREATED, Json(loan)))
}

/// Return a borrowed book
#[utoipa::path(
    post,
    path = "/loans/{id}/return",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Loan ID")
    ),
    responses(
        (status = 200, description = "Book returned", body = ReturnResponse),
        (status = 404, description = "Loan not found"),
        (status = 409, description = "Already returned"),
        (status = 503, description = "Book busy, retry")
    )
)]
pub async fn return_loan(
    State(state): State<crate::AppState>,
    Actor(claims): Actor,
    Path(loan_id): Path<Uuid>,
) -> AppResult<Json<ReturnResponse>> {
    claims.require_staff()?;

    let loan = state.services.circulation.return_loan(loan_id).await?;

    Ok(Json(ReturnResponse {
        status: "returned".to_string(),
        loan,
    }))
}

/// List loans with filters and pagination
#[utoipa::path(
    get,
    path = "/loans",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(LoanQuery),
    responses(
        (status = 200, description = "List of loans", body = LoanPage)
    )
)]
pub async fn list_loans(
    State(state): State<crate::AppState>,
    Actor(_claims): Actor,
    Query(query): Query<LoanQuery>,
) -> AppResult<Json<LoanPage>> {
    let (loans, total) = state.services.circulation.search_loans(&query).await?;
    Ok(Json(Page::new(loans, total, query.page, query.per_page)))
}

/// Get a loan with book and member details
#[utoipa::path(
    get,
    path = "/loans/{id}",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Loan ID")
    ),
    responses(
        (status = 200, description = "Loan details", body = LoanDetails),
        (status = 404, description = "Loan not found")
    )
)]
pub async fn get_loan(
    State(state): State<crate::AppState>,
    Actor(_claims): Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<LoanDetails>> {
    let loan = state.services.circulation.get_loan(id).await?;
    Ok(Json(loan))
}

/// Purge a returned loan from the ledger
#[utoipa::path(
    delete,
    path = "/loans/{id}",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Loan ID")
    ),
    responses(
        (status = 204, description = "Loan purged"),
        (status = 404, description = "Loan not found"),
        (status = 409, description = "Loan is still active")
    )
)]
pub async fn purge_loan(
    State(state): State<crate::AppState>,
    Actor(claims): Actor,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    claims.require_admin()?;

    state.services.circulation.purge_loan(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Get active loans for a specific member
#[utoipa::path(
    get,
    path = "/members/{id}/loans",
    tag = "loans",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Member ID")
    ),
    responses(
        (status = 200, description = "Member's active loans", body = Vec<LoanDetails>),
        (status = 404, description = "Member not found")
    )
)]
pub async fn member_loans(
    State(state): State<crate::AppState>,
    Actor(_claims): Actor,
    Path(member_id): Path<Uuid>,
) -> AppResult<Json<Vec<LoanDetails>>> {
    let loans = state.services.circulation.member_loans(member_id).await?;
    Ok(Json(loans))
}

/// Ledger statistics for the dashboard
#[utoipa::path(
    get,
    path = "/loans/stats",
    tag = "loans",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Loan statistics", body = LoanStats)
    )
)]
pub async fn loan_stats(
    State(state): State<crate::AppState>,
    Actor(_claims): Actor,
) -> AppResult<Json<LoanStats>> {
    let stats = state.services.circulation.stats().await?;
    Ok(Json(stats))
}

/// Compare every book's counters with its active loans
#[utoipa::path(
    get,
    path = "/loans/audit",
    tag = "loans",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Audit result", body = AuditResponse),
        (status = 403, description = "Administrator privileges required")
    )
)]
pub async fn audit_inventory(
    State(state): State<crate::AppState>,
    Actor(claims): Actor,
) -> AppResult<Json<AuditResponse>> {
    claims.require_admin()?;

    let discrepancies = state.services.circulation.audit().await?;
    Ok(Json(AuditResponse {
        consistent: discrepancies.is_empty(),
        discrepancies,
    }))
}
