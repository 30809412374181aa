use uuid::Uuid;

use crate::models::Tenant;

/// Physical database name for a tenant id: prefix plus the lowercased
/// id with hyphens flattened to underscores. Pure so it can run before
/// the tenant row exists.
pub fn database_name_for_id(prefix: &str, tenant_id: Uuid) -> String {
    let normalized = tenant_id.to_string().to_lowercase().replace('-', "_");
    format!("{prefix}{normalized}")
}

/// A stored override wins verbatim so databases provisioned under an
/// older naming scheme stay addressable.
pub fn database_name_for(prefix: &str, tenant: &Tenant) -> String {
    match &tenant.db_name {
        Some(name) => name.clone(),
        None => database_name_for_id(prefix, tenant.id),
    }
}
