//! Members repository for database operations

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use super::{begin, like_pattern, map_write_error, MembersStore};
use crate::{
    error::{AppError, AppResult, Entity},
    models::{paginate, Member, MemberQuery},
};

const SEARCH_FILTER: &str =
    "WHERE ($1::text IS NULL OR name ILIKE $1 OR email ILIKE $1 OR phone ILIKE $1)";

#[derive(Clone)]
pub struct MembersRepository {
    pool: Pool<Postgres>,
    lock_timeout: Duration,
}

impl MembersRepository {
    pub fn new(pool: Pool<Postgres>, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }
}

#[async_trait]
impl MembersStore for MembersRepository {
    async fn create(&self, member: &Member) -> AppResult<Member> {
        sqlx::query_as::<_, Member>(
            r#"
            INSERT INTO members (id, name, email, phone, membership_date)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(member.id)
        .bind(&member.name)
        .bind(&member.email)
        .bind(&member.phone)
        .bind(member.membership_date)
        .fetch_one(&self.pool)
        .await
        .map_err(map_write_error)
    }

    async fn get(&self, id: Uuid) -> AppResult<Member> {
        sqlx::query_as::<_, Member>("SELECT * FROM members WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found(Entity::Member, id))
    }

    async fn search(&self, query: &MemberQuery) -> AppResult<(Vec<Member>, i64)> {
        let (_, per_page, offset) = paginate(query.page, query.per_page);
        let search = query.search.as_deref().map(like_pattern);

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM members {}", SEARCH_FILTER))
                .bind(&search)
                .fetch_one(&self.pool)
                .await?;

        let members = sqlx::query_as::<_, Member>(&format!(
            "SELECT * FROM members {} ORDER BY membership_date DESC LIMIT $2 OFFSET $3",
            SEARCH_FILTER
        ))
        .bind(&search)
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((members, total))
    }

    async fn update(&self, member: &Member) -> AppResult<Member> {
        sqlx::query_as::<_, Member>(
            "UPDATE members SET name = $2, email = $3, phone = $4 WHERE id = $1 RETURNING *",
        )
        .bind(member.id)
        .bind(&member.name)
        .bind(&member.email)
        .bind(&member.phone)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_write_error)?
        .ok_or_else(|| AppError::not_found(Entity::Member, member.id))
    }

    async fn delete(&self, id: Uuid) -> AppResult<()> {
        let mut tx = begin(&self.pool, self.lock_timeout).await?;

        // Issue transactions hold this row FOR SHARE until their loan commits
        let exists =
            sqlx::query_scalar::<_, Uuid>("SELECT id FROM members WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_write_error)?;
        if exists.is_none() {
            return Err(AppError::not_found(Entity::Member, id));
        }

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM loans WHERE member_id = $1 AND status = 'active'",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if active > 0 {
            return Err(AppError::Conflict(format!(
                "Member holds {} active loan(s) and cannot be removed",
                active
            )));
        }

        sqlx::query("DELETE FROM members WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
