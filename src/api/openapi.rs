//! OpenAPI documentation

use axum::Router;
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{books, health, loans, members};

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Circulation API",
        version = "1.0.0",
        description = "Library circulation REST API: catalog, members and the issue/return ledger",
        license(name = "AGPL-3.0", url = "https://www.gnu.org/licenses/agpl-3.0.html")
    ),
    servers(
        (url = "/api/v1", description = "API v1")
    ),
    paths(
        // Health
        health::health_check,
        health::readiness_check,
        // Books
        books::list_books,
        books::get_book,
        books::create_book,
        books::update_book,
        books::delete_book,
        books::book_stats,
        // Members
        members::list_members,
        members::get_member,
        members::create_member,
        members::update_member,
        members::delete_member,
        // Loans
        loans::issue_loan,
        loans::return_loan,
        loans::list_loans,
        loans::get_loan,
        loans::purge_loan,
        loans::member_loans,
        loans::loan_stats,
        loans::audit_inventory,
    ),
    components(
        schemas(
            // Books
            crate::models::book::Book,
            crate::models::book::CreateBook,
            crate::models::book::UpdateBook,
            crate::models::book::BookStats,
            crate::api::BookPage,
            // Members
            crate::models::member::Member,
            crate::models::member::CreateMember,
            crate::models::member::UpdateMember,
            crate::api::MemberPage,
            // Loans
            crate::models::loan::Loan,
            crate::models::loan::LoanStatus,
            crate::models::loan::LoanDetails,
            crate::models::loan::IssueLoan,
            crate::models::loan::LoanStats,
            crate::models::loan::InventoryRow,
            crate::api::LoanPage,
            loans::ReturnResponse,
            loans::AuditResponse,
            // Health
            health::HealthResponse,
            // Errors
            crate::error::ErrorResponse,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "books", description = "Catalog management"),
        (name = "members", description = "Member registry"),
        (name = "loans", description = "Issue, return and loan ledger")
    )
)]
pub struct ApiDoc;

/// Create the OpenAPI documentation router
pub fn create_openapi_router() -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
