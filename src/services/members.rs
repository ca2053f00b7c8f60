//! Member registry service

use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::AppResult,
    models::{CreateMember, Member, MemberQuery, UpdateMember},
    repository::Repository,
};

#[derive(Clone)]
pub struct MembersService {
    repository: Repository,
}

impl MembersService {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }

    pub async fn create_member(&self, request: CreateMember) -> AppResult<Member> {
        let request = request.normalized();
        request.validate()?;

        let member = Member {
            id: Uuid::new_v4(),
            name: request.name,
            email: request.email,
            phone: request.phone,
            membership_date: Utc::now(),
        };

        let created = self.repository.members.create(&member).await?;
        tracing::info!(member_id = %created.id, "Member registered");
        Ok(created)
    }

    pub async fn get_member(&self, id: Uuid) -> AppResult<Member> {
        self.repository.members.get(id).await
    }

    pub async fn search_members(&self, query: &MemberQuery) -> AppResult<(Vec<Member>, i64)> {
        self.repository.members.search(query).await
    }

    pub async fn update_member(&self, id: Uuid, request: UpdateMember) -> AppResult<Member> {
        request.validate()?;
        let mut member = self.repository.members.get(id).await?;
        request.apply(&mut member);
        self.repository.members.update(&member).await
    }

    /// Remove a member who holds no active loan
    pub async fn delete_member(&self, id: Uuid) -> AppResult<()> {
        self.repository.members.delete(id).await?;
        tracing::info!(member_id = %id, "Member removed");
        Ok(())
    }
}
