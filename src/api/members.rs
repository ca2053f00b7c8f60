//! Member registry endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{CreateMember, Member, MemberQuery, UpdateMember},
};

use super::{Actor, MemberPage, Page};

/// List members with search and pagination
#[utoipa::path(
    get,
    path = "/members",
    tag = "members",
    security(("bearer_auth" = [])),
    params(MemberQuery),
    responses(
        (status = 200, description = "List of members", body = MemberPage),
        (status = 401, description = "Not authenticated")
    )
)]
pub async fn list_members(
    State(state): State<crate::AppState>,
    Actor(_claims): Actor,
    Query(query): Query<MemberQuery>,
) -> AppResult<Json<MemberPage>> {
    let (members, total) = state.services.members.search_members(&query).await?;
    Ok(Json(Page::new(members, total, query.page, query.per_page)))
}

/// Get member details by ID
#[utoipa::path(
    get,
    path = "/members/{id}",
    tag = "members",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Member ID")
    ),
    responses(
        (status = 200, description = "Member details", body = Member),
        (status = 404, description = "Member not found")
    )
)]
pub async fn get_member(
    State(state): State<crate::AppState>,
    Actor(_claims): Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Member>> {
    let member = state.services.members.get_member(id).await?;
    Ok(Json(member))
}

/// Register a new member
#[utoipa::path(
    post,
    path = "/members",
    tag = "members",
    security(("bearer_auth" = [])),
    request_body = CreateMember,
    responses(
        (status = 201, description = "Member created", body = Member),
        (status = 400, description = "Invalid input"),
        (status = 409, description = "Email already registered")
    )
)]
pub async fn create_member(
    State(state): State<crate::AppState>,
    Actor(claims): Actor,
    Json(request): Json<CreateMember>,
) -> AppResult<(StatusCode, Json<Member>)> {
    claims.require_staff()?;

    let member = state.services.members.create_member(request).await?;
    Ok((StatusCode::CREATED, Json(member)))
}

/// Update a member
#[utoipa::path(
    put,
    path = "/members/{id}",
    tag = "members",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Member ID")
    ),
    request_body = UpdateMember,
    responses(
        (status = 200, description = "Member updated", body = Member),
        (status = 404, description = "Member not found"),
        (status = 409, description = "Email already registered")
    )
)]
pub async fn update_member(
    State(state): State<crate::AppState>,
    Actor(claims): Actor,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateMember>,
) -> AppResult<Json<Member>> {
    claims.require_staff()?;

    let member = state.services.members.update_member(id, request).await?;
    Ok(Json(member))
}

/// Remove a member
#[utoipa::path(
    delete,
    path = "/members/{id}",
    tag = "members",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Member ID")
    ),
    responses(
        (status = 204, description = "Member deleted"),
        (status = 404, description = "Member not found"),
        (status = 409, description = "Member holds active loans")
    )
)]
pub async fn delete_member(
    State(state): State<crate::AppState>,
    Actor(claims): Actor,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    claims.require_admin()?;

    state.services.members.delete_member(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
