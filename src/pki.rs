//! Tenant signing root generation. Each tenant gets one self-signed
//! CA whose key material lives under the tenant's `secure/` folder and
//! whose serial counter lives in the tenant database.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use time::{Duration, OffsetDateTime};

use crate::models::Tenant;
use crate::tenant_models::{NewRootCertificateAuthority, RootCertificateAuthority};
use crate::tenant_schema::root_certificate_authorities as root_cas;

pub const ROOT_CA_VALIDITY_DAYS: i64 = 3650;

pub const STATUS_ACTIVE: &str = "active";

#[derive(Debug)]
pub struct RootCaMaterial {
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
    pub not_before: NaiveDateTime,
    pub not_after: NaiveDateTime,
}

/// Generates the tenant's self-signed signing root and writes the PEM
/// pair under `secure_dir`. DN fields come from the tenant's
/// registered company metadata, falling back to the tenant name.
pub fn generate_root_ca(tenant: &Tenant, secure_dir: &Path) -> Result<RootCaMaterial> {
    let common_name = company_name(tenant);

    let not_before = OffsetDateTime::now_utc();
    let not_after = not_before + Duration::days(ROOT_CA_VALIDITY_DAYS);

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{common_name} Signing Root"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_before = not_before;
    params.not_after = not_after;

    let key_pair = KeyPair::generate().context("failed to generate root CA key pair")?;
    let certificate = params
        .self_signed(&key_pair)
        .context("failed to self-sign root CA certificate")?;

    let certificate_path = secure_dir.join("root-ca.pem");
    let private_key_path = secure_dir.join("root-ca.key");

    fs::write(&certificate_path, certificate.pem())
        .with_context(|| format!("failed to write {}", certificate_path.display()))?;
    fs::write(&private_key_path, key_pair.serialize_pem())
        .with_context(|| format!("failed to write {}", private_key_path.display()))?;
    restrict_key_permissions(&private_key_path)?;

    Ok(RootCaMaterial {
        certificate_path,
        private_key_path,
        not_before: to_naive(not_before),
        not_after: to_naive(not_after),
    })
}

/// Records the generated root in the tenant database. At most one
/// active row exists (partial unique index); re-running against a
/// tenant that already has one is a no-op.
pub fn store_root_ca(conn: &mut PgConnection, material: &RootCaMaterial) -> Result<()> {
    let new_row = NewRootCertificateAuthority {
        status: STATUS_ACTIVE.to_string(),
        certificate_path: material.certificate_path.display().to_string(),
        private_key_path: material.private_key_path.display().to_string(),
        not_before: material.not_before,
        not_after: material.not_after,
        last_serial_number: 1,
    };
    diesel::insert_into(root_cas::table)
        .values(&new_row)
        .on_conflict_do_nothing()
        .execute(conn)
        .context("failed to record root CA")?;
    Ok(())
}

pub fn active_root_ca(conn: &mut PgConnection) -> Result<Option<RootCertificateAuthority>> {
    root_cas::table
        .filter(root_cas::status.eq(STATUS_ACTIVE))
        .first(conn)
        .optional()
        .context("failed to load active root CA")
}

/// Allocates the next certificate serial number. Serial uniqueness is
/// a hard signing-security requirement, so allocation is a single
/// atomic increment-and-return; a number handed out is never reused
/// even if the caller discards it.
pub fn next_serial_number(conn: &mut PgConnection) -> Result<i64> {
    let serial = diesel::update(root_cas::table.filter(root_cas::status.eq(STATUS_ACTIVE)))
        .set(root_cas::last_serial_number.eq(root_cas::last_serial_number + 1))
        .returning(root_cas::last_serial_number)
        .get_result(conn)
        .context("failed to allocate certificate serial number")?;
    Ok(serial)
}

fn company_name(tenant: &Tenant) -> String {
    tenant
        .metadata
        .get("company_name")
        .and_then(|value| value.as_str())
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(&tenant.name)
        .to_string()
}

fn to_naive(value: OffsetDateTime) -> NaiveDateTime {
    DateTime::<Utc>::from_timestamp(value.unix_timestamp(), value.nanosecond())
        .unwrap_or_default()
        .naive_utc()
}

#[cfg(unix)]
fn restrict_key_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_key_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{company_name, generate_root_ca, ROOT_CA_VALIDITY_DAYS};
    use crate::models::Tenant;

    fn tenant(metadata: serde_json::Value) -> Tenant {
        let now = Utc::now().naive_utc();
        Tenant {
            id: Uuid::now_v7(),
            name: "Acme".to_string(),
            code: "ACME1234".to_string(),
            slug: "acme".to_string(),
            owner_id: Uuid::new_v4(),
            plan: "free".to_string(),
            db_name: None,
            has_root_ca: false,
            root_ca_generated_at: None,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn company_metadata_overrides_tenant_name() {
        let t = tenant(serde_json::json!({ "company_name": "Acme GmbH" }));
        assert_eq!(company_name(&t), "Acme GmbH");
    }

    #[test]
    fn blank_company_metadata_falls_back_to_name() {
        let t = tenant(serde_json::json!({ "company_name": "  " }));
        assert_eq!(company_name(&t), "Acme");
    }

    #[test]
    fn writes_pem_pair_with_ten_year_window() {
        let dir = tempfile::tempdir().unwrap();
        let t = tenant(serde_json::json!({}));

        let material = generate_root_ca(&t, dir.path()).unwrap();

        assert!(material.certificate_path.is_file());
        assert!(material.private_key_path.is_file());
        let window = material.not_after - material.not_before;
        assert_eq!(window.num_days(), ROOT_CA_VALIDITY_DAYS);

        let pem = std::fs::read_to_string(&material.certificate_path).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }
}
