//! Row types for the per-tenant schema. These are only ever loaded
//! through a connection checked out from the tenant pool registry.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::tenant_schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = roles)]
pub struct Role {
    pub id: i32,
    pub name: String,
    pub guard_name: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = roles)]
pub struct NewRole {
    pub name: String,
    pub guard_name: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = permissions)]
pub struct Permission {
    pub id: i32,
    pub name: String,
    pub guard_name: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = permissions)]
pub struct NewPermission {
    pub name: String,
    pub guard_name: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = role_permissions)]
pub struct NewRolePermission {
    pub role_id: i32,
    pub permission_id: i32,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = model_has_roles)]
pub struct ModelHasRole {
    pub model_type: String,
    pub model_id: Uuid,
    pub role_id: i32,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = model_has_roles)]
pub struct NewModelHasRole {
    pub model_type: String,
    pub model_id: Uuid,
    pub role_id: i32,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = quota_settings)]
pub struct QuotaSettings {
    pub id: i32,
    pub max_documents: Option<i32>,
    pub max_signatures: Option<i32>,
    pub max_storage_bytes: Option<i64>,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = quota_overrides)]
pub struct QuotaOverride {
    pub user_id: Uuid,
    pub max_documents: Option<i32>,
    pub max_signatures: Option<i32>,
    pub max_storage_bytes: Option<i64>,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = quota_usages)]
pub struct QuotaUsage {
    pub id: i32,
    pub used_documents: i32,
    pub used_signatures: i32,
    pub used_storage_bytes: i64,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = root_certificate_authorities)]
pub struct RootCertificateAuthority {
    pub id: i32,
    pub status: String,
    pub certificate_path: String,
    pub private_key_path: String,
    pub not_before: NaiveDateTime,
    pub not_after: NaiveDateTime,
    pub last_serial_number: i64,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = root_certificate_authorities)]
pub struct NewRootCertificateAuthority {
    pub status: String,
    pub certificate_path: String,
    pub private_key_path: String,
    pub not_before: NaiveDateTime,
    pub not_after: NaiveDateTime,
    pub last_serial_number: i64,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = oauth_clients)]
pub struct NewTenantOauthClient {
    pub id: Uuid,
    pub name: String,
    pub secret_hash: String,
    pub redirect_uri: String,
}
