//! Book (catalog) endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{Book, BookQuery, BookStats, CreateBook, UpdateBook},
};

use super::{Actor, BookPage, Page};

/// List books with search and pagination
#[utoipa::path(
    get,
    path = "/books",
    tag = "books",
    security(("bearer_auth" = [])),
    params(BookQuery),
    responses(
        (status = 200, description = "List of books", body = BookPage),
        (status = 401, description = "Not authenticated")
    )
)]
pub async fn list_books(
    State(state): State<crate::AppState>,
    Actor(_claims): Actor,
    Query(query): Query<BookQuery>,
) -> AppResult<Json<BookPage>> {
    let (books, total) = state.services.catalog.search_books(&query).await?;
    Ok(Json(Page::new(books, total, query.page, query.per_page)))
}

/// Get book details by ID
#[utoipa::path(
    get,
    path = "/books/{id}",
    tag = "books",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Book ID")
    ),
    responses(
        (status = 200, description = "Book details", body = Book),
        (status = 404, description = "Book not found")
    )
)]
pub async fn get_book(
    State(state): State<crate::AppState>,
    Actor(_claims): Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Book>> {
    let book = state.services.catalog.get_book(id).await?;
    Ok(Json(book))
}

/// Catalog a new book
#[utoipa::path(
    post,
    path = "/books",
    tag = "books",
    security(("bearer_auth" = [])),
    request_body = CreateBook,
    responses(
        (status = 201, description = "Book created", body = Book),
        (status = 400, description = "Invalid input"),
        (status = 409, description = "ISBN already cataloged")
    )
)]
pub async fn create_book(
    State(state): State<crate::AppState>,
    Actor(claims): Actor,
    Json(request): Json<CreateBook>,
) -> AppResult<(StatusCode, Json<Book>)> {
    claims.require_staff()?;

    let book = state.services.catalog.create_book(request).await?;
    Ok((StatusCode::CREATED, Json(book)))
}

/// Update a book; a new total re-derives the available copies
#[utoipa::path(
    put,
    path = "/books/{id}",
    tag = "books",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Book ID")
    ),
    request_body = UpdateBook,
    responses(
        (status = 200, description = "Book updated", body = Book),
        (status = 404, description = "Book not found"),
        (status = 500, description = "Total copies would fall below active loans"),
        (status = 503, description = "Book busy, retry")
    )
)]
pub async fn update_book(
    State(state): State<crate::AppState>,
    Actor(claims): Actor,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateBook>,
) -> AppResult<Json<Book>> {
    claims.require_staff()?;

    let book = state.services.catalog.update_book(id, request).await?;
    Ok(Json(book))
}

/// Withdraw a book
#[utoipa::path(
    delete,
    path = "/books/{id}",
    tag = "books",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Book ID")
    ),
    responses(
        (status = 204, description = "Book deleted"),
        (status = 404, description = "Book not found"),
        (status = 409, description = "Book has active loans")
    )
)]
pub async fn delete_book(
    State(state): State<crate::AppState>,
    Actor(claims): Actor,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    claims.require_admin()?;

    state.services.catalog.delete_book(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Catalog statistics for the dashboard
#[utoipa::path(
    get,
    path = "/books/stats",
    tag = "books",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Catalog statistics", body = BookStats)
    )
)]
pub async fn book_stats(
    State(state): State<crate::AppState>,
    Actor(_claims): Actor,
) -> AppResult<Json<BookStats>> {
    let stats = state.services.catalog.stats().await?;
    Ok(Json(stats))
}
