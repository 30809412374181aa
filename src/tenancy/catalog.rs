//! Versioned role/permission catalog seeded into every tenant
//! database at provisioning time. Embedded as data so seeding stays
//! reproducible; bump [`CATALOG_VERSION`] when entries change.

pub const CATALOG_VERSION: u32 = 1;

pub const GUARD_NAME: &str = "api";

pub const ROLE_OWNER: &str = "owner";
pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_MEMBER: &str = "member";

pub const ROLES: [&str; 3] = [ROLE_OWNER, ROLE_ADMIN, ROLE_MEMBER];

pub const PERMISSIONS: [&str; 12] = [
    "documents.view",
    "documents.create",
    "documents.delete",
    "documents.sign",
    "templates.manage",
    "members.view",
    "members.invite",
    "members.manage",
    "settings.view",
    "settings.manage",
    "certificates.view",
    "quotas.manage",
];

/// Role to permission mapping. Owners are intentionally absent: the
/// access-control resolver grants them everything without a lookup.
pub const ROLE_GRANTS: [(&str, &[&str]); 2] = [
    (
        ROLE_ADMIN,
        &[
            "documents.view",
            "documents.create",
            "documents.delete",
            "documents.sign",
            "templates.manage",
            "members.view",
            "members.invite",
            "members.manage",
            "settings.view",
            "settings.manage",
            "certificates.view",
        ],
    ),
    (
        ROLE_MEMBER,
        &[
            "documents.view",
            "documents.create",
            "documents.sign",
            "members.view",
        ],
    ),
];

/// Maps retired role names onto their current equivalents. The "user"
/// role shipped in early releases and persists in old tenant data.
pub fn normalize_role(name: &str) -> &str {
    match name {
        "user" => ROLE_MEMBER,
        other => other,
    }
}

pub fn is_known_role(name: &str) -> bool {
    ROLES.contains(&normalize_role(name))
}
