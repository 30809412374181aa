//! Per-tenant usage limits. Tenant-wide settings live in the tenant
//! database; a per-user override row takes precedence field by field
//! where it is non-null.

use diesel::pg::PgConnection;
use diesel::prelude::*;
use thiserror::Error;
use uuid::Uuid;

use crate::tenant_models::{QuotaOverride, QuotaSettings, QuotaUsage};
use crate::tenant_schema::{quota_overrides, quota_settings, quota_usages};

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("database statement failed: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("{kind} quota exhausted ({used} of {limit})")]
    Exhausted {
        kind: &'static str,
        used: i64,
        limit: i64,
    },
}

pub type QuotaResult<T> = Result<T, QuotaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    Documents,
    Signatures,
}

impl UsageKind {
    fn label(self) -> &'static str {
        match self {
            UsageKind::Documents => "documents",
            UsageKind::Signatures => "signatures",
        }
    }
}

/// Effective limits for one user: tenant-wide settings with non-null
/// override fields layered on top. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub max_documents: Option<i32>,
    pub max_signatures: Option<i32>,
    pub max_storage_bytes: Option<i64>,
}

pub fn effective_limits(conn: &mut PgConnection, user_id: Uuid) -> QuotaResult<EffectiveLimits> {
    let settings: Option<QuotaSettings> = quota_settings::table.first(conn).optional()?;
    let overrides: Option<QuotaOverride> = quota_overrides::table
        .find(user_id)
        .first(conn)
        .optional()?;
    Ok(merge_limits(settings.as_ref(), overrides.as_ref()))
}

fn merge_limits(
    settings: Option<&QuotaSettings>,
    overrides: Option<&QuotaOverride>,
) -> EffectiveLimits {
    let base = EffectiveLimits {
        max_documents: settings.and_then(|s| s.max_documents),
        max_signatures: settings.and_then(|s| s.max_signatures),
        max_storage_bytes: settings.and_then(|s| s.max_storage_bytes),
    };
    let Some(ovr) = overrides else {
        return base;
    };
    EffectiveLimits {
        max_documents: ovr.max_documents.or(base.max_documents),
        max_signatures: ovr.max_signatures.or(base.max_signatures),
        max_storage_bytes: ovr.max_storage_bytes.or(base.max_storage_bytes),
    }
}

/// Increments a usage counter after checking it against the user's
/// effective limit. Counters only ever go up; deletes do not refund.
pub fn record_usage(conn: &mut PgConnection, user_id: Uuid, kind: UsageKind) -> QuotaResult<()> {
    let limits = effective_limits(conn, user_id)?;

    conn.transaction::<_, QuotaError, _>(|conn| {
        let usage: QuotaUsage = quota_usages::table.for_update().first(conn)?;

        let (used, limit) = match kind {
            UsageKind::Documents => (usage.used_documents, limits.max_documents),
            UsageKind::Signatures => (usage.used_signatures, limits.max_signatures),
        };
        if let Some(limit) = limit {
            if used >= limit {
                return Err(QuotaError::Exhausted {
                    kind: kind.label(),
                    used: used as i64,
                    limit: limit as i64,
                });
            }
        }

        match kind {
            UsageKind::Documents => diesel::update(quota_usages::table.find(usage.id))
                .set(quota_usages::used_documents.eq(usage.used_documents + 1))
                .execute(conn)?,
            UsageKind::Signatures => diesel::update(quota_usages::table.find(usage.id))
                .set(quota_usages::used_signatures.eq(usage.used_signatures + 1))
                .execute(conn)?,
        };
        Ok(())
    })
}
