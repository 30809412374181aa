use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::prelude::*;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    jobs::{enqueue_job, JOB_PROVISION_TENANT},
    models::{NewTenantInvitation, NewTenantMember, Tenant, TenantInvitation, TenantMember},
    schema::{tenant_invitations, tenant_members, tenants, users},
    state::AppState,
    tenancy::{
        acl,
        catalog::{is_known_role, normalize_role, ROLE_MEMBER, ROLE_OWNER},
        context::TenantScope,
        deprovision,
        lifecycle::register_tenant,
        quota,
    },
    tenant_models::QuotaUsage,
};

#[derive(Serialize)]
pub struct OrgResponse {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub slug: String,
    pub plan: String,
    pub has_root_ca: bool,
    pub role: Option<String>,
}

impl OrgResponse {
    fn from_tenant(tenant: Tenant, role: Option<String>) -> Self {
        Self {
            id: tenant.id,
            name: tenant.name,
            code: tenant.code,
            slug: tenant.slug,
            plan: tenant.plan,
            has_root_ca: tenant.has_root_ca,
            role,
        }
    }
}

#[derive(Deserialize)]
pub struct CreateOrgRequest {
    pub name: String,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

pub async fn create_org(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateOrgRequest>,
) -> AppResult<(StatusCode, Json<OrgResponse>)> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("organization name must not be empty"));
    }

    let mut conn = state.db()?;
    let tenant = register_tenant(
        &mut conn,
        user.user_id,
        name,
        payload.plan.as_deref().unwrap_or("free"),
        payload.metadata.unwrap_or_else(|| serde_json::json!({})),
    )
    .map_err(AppError::internal)?;

    enqueue_job(
        &mut conn,
        JOB_PROVISION_TENANT,
        serde_json::json!({ "tenant_id": tenant.id }),
        None,
    )
    .map_err(AppError::internal)?;

    diesel::update(users::table.find(user.user_id))
        .set(users::current_tenant_id.eq(Some(tenant.id)))
        .execute(&mut conn)?;

    Ok((
        StatusCode::CREATED,
        Json(OrgResponse::from_tenant(tenant, Some(ROLE_OWNER.to_string()))),
    ))
}

pub async fn list_orgs(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<OrgResponse>>> {
    let mut conn = state.db()?;

    let rows: Vec<(TenantMember, Tenant)> = tenant_members::table
        .inner_join(tenants::table)
        .filter(tenant_members::user_id.eq(user.user_id))
        .order(tenant_members::joined_at.asc())
        .load(&mut conn)?;

    let orgs = rows
        .into_iter()
        .map(|(membership, tenant)| OrgResponse::from_tenant(tenant, Some(membership.role)))
        .collect();
    Ok(Json(orgs))
}

#[derive(Serialize)]
pub struct CurrentOrgResponse {
    pub org: Option<OrgResponse>,
    pub database: Option<String>,
}

pub async fn current_org(scope: TenantScope) -> Json<CurrentOrgResponse> {
    match scope.0 {
        Some(resolved) => Json(CurrentOrgResponse {
            database: Some(resolved.database_name),
            org: Some(OrgResponse::from_tenant(
                resolved.tenant,
                Some(resolved.membership.role),
            )),
        }),
        None => Json(CurrentOrgResponse {
            org: None,
            database: None,
        }),
    }
}

#[derive(Deserialize)]
pub struct SwitchOrgRequest {
    pub tenant_id: Option<Uuid>,
}

/// Sets the caller's current-tenant default; `null` switches back to
/// personal mode. Membership is verified before the switch sticks.
pub async fn switch_org(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<SwitchOrgRequest>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;

    if let Some(tenant_id) = payload.tenant_id {
        let member: Option<TenantMember> = tenant_members::table
            .find((tenant_id, user.user_id))
            .first(&mut conn)
            .optional()?;
        if member.is_none() {
            return Err(AppError::forbidden("not a member of this organization"));
        }
    }

    diesel::update(users::table.find(user.user_id))
        .set(users::current_tenant_id.eq(payload.tenant_id))
        .execute(&mut conn)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct CreateInvitationRequest {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub expires_in_hours: Option<i64>,
    #[serde(default)]
    pub max_uses: Option<i32>,
}

#[derive(Serialize)]
pub struct InvitationResponse {
    pub code: String,
    pub role: String,
    pub expires_at: NaiveDateTime,
    pub max_uses: Option<i32>,
}

pub async fn create_invitation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    scope: TenantScope,
    Json(payload): Json<CreateInvitationRequest>,
) -> AppResult<(StatusCode, Json<InvitationResponse>)> {
    let resolved = scope.require()?;
    let mut conn = state.db()?;

    let allowed = acl::has_permission_in_tenant(
        &mut conn,
        &state.tenant_pools,
        &state.config.tenant_db_prefix,
        user.user_id,
        "members.invite",
        Some(resolved.tenant.id),
    );
    if !allowed {
        return Err(AppError::forbidden("missing members.invite permission"));
    }

    let role = normalize_role(payload.role.as_deref().unwrap_or(ROLE_MEMBER)).to_string();
    if !is_known_role(&role) || role == ROLE_OWNER {
        return Err(AppError::bad_request("invalid invitation role"));
    }

    let expires_at =
        Utc::now().naive_utc() + ChronoDuration::hours(payload.expires_in_hours.unwrap_or(72));
    let invitation = NewTenantInvitation {
        id: Uuid::new_v4(),
        tenant_id: resolved.tenant.id,
        code: invitation_code(),
        role: role.clone(),
        expires_at,
        max_uses: payload.max_uses,
        created_by: user.user_id,
    };
    diesel::insert_into(tenant_invitations::table)
        .values(&invitation)
        .execute(&mut conn)?;

    Ok((
        StatusCode::CREATED,
        Json(InvitationResponse {
            code: invitation.code,
            role,
            expires_at,
            max_uses: invitation.max_uses,
        }),
    ))
}

#[derive(Deserialize)]
pub struct JoinOrgRequest {
    pub code: String,
}

pub async fn join_org(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<JoinOrgRequest>,
) -> AppResult<(StatusCode, Json<OrgResponse>)> {
    let mut conn = state.db()?;

    let invitation: TenantInvitation = tenant_invitations::table
        .filter(tenant_invitations::code.eq(payload.code.trim()))
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| AppError::bad_request("invalid invitation code"))?;

    let membership = NewTenantMember {
        tenant_id: invitation.tenant_id,
        user_id: user.user_id,
        role: invitation.role.clone(),
        is_owner: false,
    };

    // use-count increment and validity check in one guarded statement
    // so two racing joins cannot both consume the last use; the
    // membership insert shares the transaction so a join that fails
    // gives the use back
    conn.transaction::<_, AppError, _>(|conn| {
        let consumed = diesel::update(
            tenant_invitations::table
                .find(invitation.id)
                .filter(tenant_invitations::expires_at.gt(Utc::now().naive_utc()))
                .filter(
                    tenant_invitations::max_uses
                        .is_null()
                        .or(tenant_invitations::used_count
                            .lt(tenant_invitations::max_uses.assume_not_null())),
                ),
        )
        .set(tenant_invitations::used_count.eq(tenant_invitations::used_count + 1))
        .execute(conn)?;
        if consumed == 0 {
            return Err(AppError::bad_request("invitation expired or exhausted"));
        }

        diesel::insert_into(tenant_members::table)
            .values(&membership)
            .execute(conn)
            .map_err(|err| match err {
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                ) => AppError::conflict("already a member of this organization"),
                other => AppError::from(other),
            })?;
        Ok(())
    })?;

    // role assignment lands in the tenant database; if provisioning is
    // still in flight the membership row is enough for a later repair
    if let Err(err) = acl::assign_role_in_tenant(
        &mut conn,
        &state.tenant_pools,
        &state.config.tenant_db_prefix,
        user.user_id,
        &invitation.role,
        invitation.tenant_id,
    ) {
        warn!(user = %user.user_id, tenant = %invitation.tenant_id, error = %err, "deferred tenant role assignment");
    }

    diesel::update(users::table.find(user.user_id))
        .set(users::current_tenant_id.eq(Some(invitation.tenant_id)))
        .execute(&mut conn)?;

    let tenant: Tenant = tenants::table.find(invitation.tenant_id).first(&mut conn)?;
    Ok((
        StatusCode::CREATED,
        Json(OrgResponse::from_tenant(tenant, Some(invitation.role))),
    ))
}

#[derive(Serialize)]
pub struct MemberResponse {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: String,
    pub is_owner: bool,
    pub joined_at: NaiveDateTime,
}

pub async fn list_members(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    scope: TenantScope,
) -> AppResult<Json<Vec<MemberResponse>>> {
    let resolved = scope.require()?;
    let mut conn = state.db()?;

    let allowed = acl::has_permission_in_tenant(
        &mut conn,
        &state.tenant_pools,
        &state.config.tenant_db_prefix,
        user.user_id,
        "members.view",
        Some(resolved.tenant.id),
    );
    if !allowed {
        return Err(AppError::forbidden("missing members.view permission"));
    }

    let rows: Vec<(TenantMember, (Uuid, String, String))> = tenant_members::table
        .inner_join(users::table)
        .filter(tenant_members::tenant_id.eq(resolved.tenant.id))
        .select((
            tenant_members::all_columns,
            (users::id, users::email, users::display_name),
        ))
        .order(tenant_members::joined_at.asc())
        .load(&mut conn)?;

    let members = rows
        .into_iter()
        .map(|(membership, (user_id, email, display_name))| MemberResponse {
            user_id,
            email,
            display_name,
            role: membership.role,
            is_owner: membership.is_owner,
            joined_at: membership.joined_at,
        })
        .collect();
    Ok(Json(members))
}

#[derive(Deserialize)]
pub struct UpdateMemberRoleRequest {
    pub role: String,
}

pub async fn update_member_role(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    scope: TenantScope,
    Path(member_id): Path<Uuid>,
    Json(payload): Json<UpdateMemberRoleRequest>,
) -> AppResult<StatusCode> {
    let resolved = scope.require()?;
    let mut conn = state.db()?;

    let allowed = acl::has_permission_in_tenant(
        &mut conn,
        &state.tenant_pools,
        &state.config.tenant_db_prefix,
        user.user_id,
        "members.manage",
        Some(resolved.tenant.id),
    );
    if !allowed {
        return Err(AppError::forbidden("missing members.manage permission"));
    }

    let target: TenantMember = tenant_members::table
        .find((resolved.tenant.id, member_id))
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    // the owner row is immutable, no matter who asks
    if target.is_owner {
        return Err(AppError::forbidden("the owner role cannot be reassigned"));
    }

    let role = normalize_role(&payload.role).to_string();
    if !is_known_role(&role) || role == ROLE_OWNER {
        return Err(AppError::bad_request("invalid member role"));
    }

    diesel::update(tenant_members::table.find((resolved.tenant.id, member_id)))
        .set(tenant_members::role.eq(&role))
        .execute(&mut conn)?;

    acl::assign_role_in_tenant(
        &mut conn,
        &state.tenant_pools,
        &state.config.tenant_db_prefix,
        member_id,
        &role,
        resolved.tenant.id,
    )
    .map_err(AppError::internal)?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_member(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    scope: TenantScope,
    Path(member_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let resolved = scope.require()?;
    let mut conn = state.db()?;

    let allowed = acl::has_permission_in_tenant(
        &mut conn,
        &state.tenant_pools,
        &state.config.tenant_db_prefix,
        user.user_id,
        "members.manage",
        Some(resolved.tenant.id),
    );
    if !allowed {
        return Err(AppError::forbidden("missing members.manage permission"));
    }

    let target: TenantMember = tenant_members::table
        .find((resolved.tenant.id, member_id))
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    if target.is_owner {
        return Err(AppError::forbidden("the owner cannot be removed"));
    }

    diesel::delete(tenant_members::table.find((resolved.tenant.id, member_id)))
        .execute(&mut conn)?;

    if let Err(err) = acl::remove_roles_in_tenant(
        &mut conn,
        &state.tenant_pools,
        &state.config.tenant_db_prefix,
        member_id,
        resolved.tenant.id,
    ) {
        warn!(user = %member_id, tenant = %resolved.tenant.id, error = %err, "tenant role cleanup deferred");
    }

    diesel::update(
        users::table
            .find(member_id)
            .filter(users::current_tenant_id.eq(Some(resolved.tenant.id))),
    )
    .set(users::current_tenant_id.eq(None::<Uuid>))
    .execute(&mut conn)?;

    Ok(StatusCode::NO_CONTENT)
}

/// Destroys the organization: terminates sessions, drops the physical
/// database, then removes the central rows. Owner only; irreversible.
pub async fn delete_org(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    scope: TenantScope,
) -> AppResult<StatusCode> {
    let resolved = scope.require()?;
    if !resolved.membership.is_owner || resolved.membership.user_id != user.user_id {
        return Err(AppError::forbidden("only the owner can delete an organization"));
    }

    let mut conn = state.db()?;
    deprovision::drop_tenant_database(
        &mut conn,
        &state.tenant_pools,
        &state.config.tenant_db_prefix,
        &resolved.tenant,
    )
    .map_err(AppError::internal)?;

    diesel::update(users::table.filter(users::current_tenant_id.eq(Some(resolved.tenant.id))))
        .set(users::current_tenant_id.eq(None::<Uuid>))
        .execute(&mut conn)?;

    diesel::delete(tenants::table.find(resolved.tenant.id)).execute(&mut conn)?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub struct QuotaResponse {
    pub max_documents: Option<i32>,
    pub max_signatures: Option<i32>,
    pub max_storage_bytes: Option<i64>,
    pub used_documents: i32,
    pub used_signatures: i32,
    pub used_storage_bytes: i64,
}

/// The caller's effective limits and current usage inside the active
/// organization. Everyone can see their own quota.
pub async fn my_quota(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    scope: TenantScope,
) -> AppResult<Json<QuotaResponse>> {
    let resolved = scope.require()?;

    let mut conn = state
        .tenant_pools
        .checkout(&resolved.database_name)
        .map_err(AppError::internal)?;

    let limits = quota::effective_limits(&mut conn, user.user_id).map_err(AppError::internal)?;
    let usage: QuotaUsage = crate::tenant_schema::quota_usages::table
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| AppError::internal("quota usage row missing"))?;

    Ok(Json(QuotaResponse {
        max_documents: limits.max_documents,
        max_signatures: limits.max_signatures,
        max_storage_bytes: limits.max_storage_bytes,
        used_documents: usage.used_documents,
        used_signatures: usage.used_signatures,
        used_storage_bytes: usage.used_storage_bytes,
    }))
}

fn invitation_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect::<String>()
        .to_uppercase()
}
