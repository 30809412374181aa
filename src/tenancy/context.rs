//! Request-scoped tenant context resolution.
//!
//! Priority per request, first match wins: explicit `X-Tenant-Id`
//! header (only after the caller's membership in that tenant is
//! verified — client input never bypasses the membership gate), then
//! the user's persisted current-tenant default. No match means
//! personal mode: the request runs against the central database only.
//!
//! Scoping is structural rather than procedural: the resolved scope is
//! an owned per-request value and tenant connections are checked out
//! from the pool registry per operation, so nothing can leak into the
//! next request on the same worker.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use tracing::debug;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    models::{Tenant, TenantMember},
    schema::{tenant_members, tenants, users},
    state::AppState,
    tenancy::naming::database_name_for,
};

pub const TENANT_HEADER: &str = "x-tenant-id";

#[derive(Debug)]
pub struct ResolvedScope {
    pub tenant: Tenant,
    pub membership: TenantMember,
    pub database_name: String,
}

/// The tenant context of one request. `None` is personal mode.
#[derive(Debug)]
pub struct TenantScope(pub Option<ResolvedScope>);

impl TenantScope {
    pub fn require(&self) -> AppResult<&ResolvedScope> {
        self.0
            .as_ref()
            .ok_or_else(|| AppError::bad_request("no active organization"))
    }

    pub fn tenant_id(&self) -> Option<Uuid> {
        self.0.as_ref().map(|scope| scope.tenant.id)
    }
}

/// Resolves the scope for `user_id` given an optional header value.
/// A header naming a tenant the caller does not belong to is ignored
/// and resolution falls through to the stored default; an accepted
/// header is persisted as that default so later requests in the same
/// client session agree with it.
pub fn resolve_tenant_scope(
    central: &mut PgConnection,
    db_prefix: &str,
    user_id: Uuid,
    header_tenant: Option<Uuid>,
) -> AppResult<Option<ResolvedScope>> {
    if let Some(tenant_id) = header_tenant {
        if let Some(scope) = scope_for_member(central, db_prefix, user_id, tenant_id)? {
            // skip the write when the stored default already matches
            diesel::update(
                users::table
                    .find(user_id)
                    .filter(users::current_tenant_id.is_distinct_from(tenant_id)),
            )
            .set(users::current_tenant_id.eq(Some(tenant_id)))
            .execute(central)?;
            return Ok(Some(scope));
        }
        debug!(user = %user_id, tenant = %tenant_id, "tenant header rejected: not a member");
    }

    let stored: Option<Uuid> = users::table
        .find(user_id)
        .select(users::current_tenant_id)
        .first(central)?;

    if let Some(tenant_id) = stored {
        if let Some(scope) = scope_for_member(central, db_prefix, user_id, tenant_id)? {
            return Ok(Some(scope));
        }
        debug!(user = %user_id, tenant = %tenant_id, "stored tenant default no longer valid");
    }

    Ok(None)
}

fn scope_for_member(
    central: &mut PgConnection,
    db_prefix: &str,
    user_id: Uuid,
    tenant_id: Uuid,
) -> AppResult<Option<ResolvedScope>> {
    let membership: Option<TenantMember> = tenant_members::table
        .find((tenant_id, user_id))
        .first(central)
        .optional()?;
    let Some(membership) = membership else {
        return Ok(None);
    };

    let tenant: Option<Tenant> = tenants::table.find(tenant_id).first(central).optional()?;
    let Some(tenant) = tenant else {
        return Ok(None);
    };

    let database_name = database_name_for(db_prefix, &tenant);
    Ok(Some(ResolvedScope {
        tenant,
        membership,
        database_name,
    }))
}

#[async_trait]
impl FromRequestParts<AppState> for TenantScope {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = AuthenticatedUser::from_request_parts(parts, state).await?;

        let header_tenant = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok());

        let mut conn = state.db()?;
        let scope = resolve_tenant_scope(
            &mut conn,
            &state.config.tenant_db_prefix,
            user.user_id,
            header_tenant,
        )?;
        Ok(TenantScope(scope))
    }
}
