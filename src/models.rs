use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub password_hash: String,
    pub current_tenant_id: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = tenants)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub slug: String,
    pub owner_id: Uuid,
    pub plan: String,
    pub db_name: Option<String>,
    pub has_root_ca: bool,
    pub root_ca_generated_at: Option<NaiveDateTime>,
    pub metadata: serde_json::Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tenants)]
pub struct NewTenant {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub slug: String,
    pub owner_id: Uuid,
    pub plan: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = tenant_members)]
#[diesel(belongs_to(Tenant))]
#[diesel(belongs_to(User))]
#[diesel(primary_key(tenant_id, user_id))]
pub struct TenantMember {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub is_owner: bool,
    pub joined_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tenant_members)]
pub struct NewTenantMember {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub is_owner: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = tenant_invitations)]
#[diesel(belongs_to(Tenant))]
pub struct TenantInvitation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub code: String,
    pub role: String,
    pub expires_at: NaiveDateTime,
    pub max_uses: Option<i32>,
    pub used_count: i32,
    pub created_by: Uuid,
    pub created_at: NaiveDateTime,
}

impl TenantInvitation {
    /// Valid while unexpired and under its use cap (no cap when
    /// `max_uses` is null).
    pub fn is_valid_at(&self, now: NaiveDateTime) -> bool {
        let within_uses = self.max_uses.map_or(true, |max| self.used_count < max);
        within_uses && now < self.expires_at
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tenant_invitations)]
pub struct NewTenantInvitation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub code: String,
    pub role: String,
    pub expires_at: NaiveDateTime,
    pub max_uses: Option<i32>,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = oauth_clients)]
pub struct OauthClient {
    pub id: Uuid,
    pub name: String,
    pub secret_hash: String,
    pub redirect_uri: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub run_after: NaiveDateTime,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub run_after: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = refresh_tokens)]
#[diesel(belongs_to(User))]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub revoked_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = refresh_tokens)]
pub struct NewRefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}
