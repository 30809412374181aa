use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Fixed per-tenant folder layout. `secure` holds root-CA key
/// material and must never be served.
pub const TENANT_SUBFOLDERS: [&str; 5] = [
    "documents",
    "signatures",
    "certificates",
    "root-ca",
    "secure",
];

pub trait TenantStorage: Send + Sync + 'static {
    fn ensure_directory(&self, path: &Path) -> Result<()>;
}

pub struct FsStorage;

impl TenantStorage for FsStorage {
    fn ensure_directory(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("failed to create directory {}", path.display()))
    }
}

/// Filesystem namespace of a single tenant, rooted at
/// `{storage_root}/{database_name}`.
#[derive(Debug, Clone)]
pub struct TenantPaths {
    base: PathBuf,
}

impl TenantPaths {
    pub fn new(storage_root: &Path, database_name: &str) -> Self {
        Self {
            base: storage_root.join(database_name),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn secure_dir(&self) -> PathBuf {
        self.base.join("secure")
    }

    pub fn subfolders(&self) -> Vec<PathBuf> {
        TENANT_SUBFOLDERS
            .iter()
            .map(|name| self.base.join(name))
            .collect()
    }
}

/// Creates the tenant's folder set. Safe to call repeatedly; existing
/// folders are left untouched.
pub fn ensure_tenant_layout(storage: &dyn TenantStorage, paths: &TenantPaths) -> Result<()> {
    for dir in paths.subfolders() {
        storage.ensure_directory(&dir)?;
    }
    Ok(())
}
