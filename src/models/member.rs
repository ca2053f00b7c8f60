//! Member (borrower) model and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

/// Library member
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Member {
    pub id: Uuid,
    pub name: String,
    /// Unique, stored lowercased
    pub email: String,
    pub phone: String,
    pub membership_date: DateTime<Utc>,
}

impl Member {
    pub fn contact(&self) -> MemberContact {
        MemberContact {
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

/// What the notifier needs to reach a member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberContact {
    pub name: String,
    pub email: String,
}

/// Create member request
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateMember {
    #[validate(length(min = 1, message = "Please provide member name"))]
    pub name: String,
    #[validate(email(message = "Please provide a valid email"))]
    pub email: String,
    #[validate(length(min = 1, message = "Please provide phone number"))]
    pub phone: String,
}

impl CreateMember {
    pub fn normalized(mut self) -> Self {
        self.name = self.name.trim().to_string();
        self.email = self.email.trim().to_lowercase();
        self.phone = self.phone.trim().to_string();
        self
    }
}

/// Update member request
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateMember {
    #[validate(length(min = 1))]
    pub name: Option<String>,
    #[validate(email(message = "Please provide a valid email"))]
    pub email: Option<String>,
    #[validate(length(min = 1))]
    pub phone: Option<String>,
}

impl UpdateMember {
    pub fn apply(&self, member: &mut Member) {
        if let Some(ref name) = self.name {
            member.name = name.trim().to_string();
        }
        if let Some(ref email) = self.email {
            member.email = email.trim().to_lowercase();
        }
        if let Some(ref phone) = self.phone {
            member.phone = phone.trim().to_string();
        }
    }
}

/// Member search parameters
#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
pub struct MemberQuery {
    /// Matches name, email or phone (case-insensitive)
    pub search: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}
