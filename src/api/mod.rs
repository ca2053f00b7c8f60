//! API handlers for the REST endpoints

pub mod books;
pub mod health;
pub mod loans;
pub mod members;
pub mod openapi;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::ToSchema;

use crate::{
    error::AppError,
    models::{ActorClaims, Book, LoanDetails, Member},
    AppState,
};

/// Extractor for the authenticated actor from a bearer token
pub struct Actor(pub ActorClaims);

#[async_trait]
impl FromRequestParts<AppState> for Actor {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AppError::Authentication("Missing authorization header".to_string()))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| {
                AppError::Authentication("Invalid authorization header format".to_string())
            })?;

        let claims = ActorClaims::from_token(token, &state.config.auth.jwt_secret)
            .map_err(|e| AppError::Authentication(e.to_string()))?;

        Ok(Actor(claims))
    }
}

/// Paginated response wrapper
#[derive(Serialize, ToSchema)]
#[aliases(BookPage = Page<Book>, MemberPage = Page<Member>, LoanPage = Page<LoanDetails>)]
pub struct Page<T>
where
    T: for<'a> ToSchema<'a>,
{
    pub items: Vec<T>,
    /// Total number of matching records
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

impl<T> Page<T>
where
    T: for<'a> ToSchema<'a>,
{
    pub fn new(items: Vec<T>, total: i64, page: Option<i64>, per_page: Option<i64>) -> Self {
        let (page, per_page, _) = crate::models::paginate(page, per_page);
        Self {
            items,
            total,
            page,
            per_page,
            total_pages: (total + per_page - 1) / per_page,
        }
    }
}

/// Create the application router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_v1 = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        // Catalog
        .route("/books", get(books::list_books).post(books::create_book))
        .route("/books/stats", get(books::book_stats))
        .route(
            "/books/:id",
            get(books::get_book).put(books::update_book).delete(books::delete_book),
        )
        // Members
        .route("/members", get(members::list_members).post(members::create_member))
        .route(
            "/members/:id",
            get(members::get_member)
                .put(members::update_member)
                .delete(members::delete_member),
        )
        .route("/members/:id/loans", get(loans::member_loans))
        // Circulation
        .route("/loans", get(loans::list_loans).post(loans::issue_loan))
        .route("/loans/stats", get(loans::loan_stats))
        .route("/loans/audit", get(loans::audit_inventory))
        .route("/loans/:id", get(loans::get_loan).delete(loans::purge_loan))
        .route("/loans/:id/return", post(loans::return_loan))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_v1)
        .merge(openapi::create_openapi_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_counts() {
        let page: Page<Book> = Page::new(Vec::new(), 21, Some(2), Some(10));
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.page, 2);

        let empty: Page<Book> = Page::new(Vec::new(), 0, None, None);
        assert_eq!(empty.total_pages, 0);
    }
}
