mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, body_to_vec, TestApp};
use countersign::models::Tenant;
use countersign::tenancy::naming::database_name_for_id;
use countersign::tenancy::provision::database_exists;
use countersign::tenancy::reconcile::reconcile_role_assignments;
use diesel::prelude::*;
use serde_json::json;
use uuid::Uuid;

async fn create_org(app: &TestApp, token: &str, name: &str) -> Result<Uuid> {
    let response = app
        .post_json("/api/orgs", &json!({ "name": name }), Some(token))
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_to_vec(response.into_body()).await?;
    let parsed: serde_json::Value = serde_json::from_slice(&body)?;
    Ok(serde_json::from_value(parsed["id"].clone())?)
}

async fn load_tenant(app: &TestApp, tenant_id: Uuid) -> Result<Tenant> {
    app.with_conn(move |conn| {
        use countersign::schema::tenants;
        Ok(tenants::table.find(tenant_id).first(conn)?)
    })
    .await
}

async fn tenant_database_exists(app: &TestApp, tenant_id: Uuid) -> Result<bool> {
    app.with_conn(move |conn| {
        let name = database_name_for_id(common::TEST_TENANT_DB_PREFIX, tenant_id);
        Ok(database_exists(conn, &name)?)
    })
    .await
}

#[tokio::test]
async fn provisioning_is_idempotent_and_generates_a_root_ca_once() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("owner@example.com", "pw").await?;
    let token = app.login_token("owner@example.com", "pw").await?;
    let tenant_id = create_org(&app, &token, "Fresh Org").await?;

    let before = load_tenant(&app, tenant_id).await?;
    assert!(!before.has_root_ca);
    assert!(before.root_ca_generated_at.is_none());
    assert!(!tenant_database_exists(&app, tenant_id).await?);

    app.provision_tenant(tenant_id).await?;

    let after = load_tenant(&app, tenant_id).await?;
    assert!(after.has_root_ca);
    let first_generated = after.root_ca_generated_at.unwrap();
    assert!(tenant_database_exists(&app, tenant_id).await?);

    // a second pass finds everything done and changes nothing
    app.provision_tenant(tenant_id).await?;

    let again = load_tenant(&app, tenant_id).await?;
    assert_eq!(again.root_ca_generated_at, Some(first_generated));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn database_name_derives_from_the_tenant_id() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("owner@example.com", "pw").await?;
    let token = app.login_token("owner@example.com", "pw").await?;
    let tenant_id = create_org(&app, &token, "Named Org").await?;

    let expected = format!(
        "{}{}",
        common::TEST_TENANT_DB_PREFIX,
        tenant_id.to_string().to_lowercase().replace('-', "_")
    );
    assert_eq!(
        database_name_for_id(common::TEST_TENANT_DB_PREFIX, tenant_id),
        expected
    );

    app.provision_tenant(tenant_id).await?;

    let response = app.get("/api/orgs/current", Some(&token)).await?;
    let body = body_to_vec(response.into_body()).await?;
    let current: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(current["database"], json!(expected));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn deleting_an_org_drops_the_database_despite_open_sessions() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("owner@example.com", "pw").await?;
    let token = app.login_token("owner@example.com", "pw").await?;
    let tenant_id = create_org(&app, &token, "Doomed Org").await?;
    app.provision_tenant(tenant_id).await?;

    let database_name = database_name_for_id(common::TEST_TENANT_DB_PREFIX, tenant_id);
    let pools = app.state.tenant_pools.clone();
    let held = tokio::task::spawn_blocking(move || pools.checkout(&database_name))
        .await?
        .expect("tenant database reachable after provisioning");

    let response = app.delete("/api/orgs", Some(&token)).await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    drop(held);

    assert!(!tenant_database_exists(&app, tenant_id).await?);

    let remaining: i64 = app
        .with_conn(|conn| {
            use countersign::schema::tenants;
            Ok(tenants::table.count().get_result(conn)?)
        })
        .await?;
    assert_eq!(remaining, 0);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn only_the_owner_can_delete_an_org() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("owner@example.com", "pw").await?;
    app.insert_user("member@example.com", "pw").await?;
    let owner_token = app.login_token("owner@example.com", "pw").await?;
    let member_token = app.login_token("member@example.com", "pw").await?;

    let tenant_id = create_org(&app, &owner_token, "Sticky Org").await?;
    app.provision_tenant(tenant_id).await?;

    let response = app
        .post_json(
            "/api/orgs/invitations",
            &json!({ "role": "admin" }),
            Some(&owner_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_to_vec(response.into_body()).await?;
    let invitation: serde_json::Value = serde_json::from_slice(&body)?;

    let response = app
        .post_json(
            "/api/orgs/join",
            &json!({ "code": invitation["code"] }),
            Some(&member_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    // even an admin is not the owner
    let response = app.delete("/api/orgs", Some(&member_token)).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(tenant_database_exists(&app, tenant_id).await?);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn quota_limits_gate_usage_and_surface_over_http() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let owner_id = app.insert_user("owner@example.com", "pw").await?;
    let token = app.login_token("owner@example.com", "pw").await?;
    let tenant_id = create_org(&app, &token, "Metered Org").await?;
    app.provision_tenant(tenant_id).await?;

    let response = app.get("/api/orgs/quota", Some(&token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_vec(response.into_body()).await?;
    let quota: serde_json::Value = serde_json::from_slice(&body)?;
    assert!(quota["max_documents"].is_null());
    assert_eq!(quota["used_documents"], json!(0));

    let state = app.state.clone();
    let exhausted = tokio::task::spawn_blocking(move || -> Result<bool> {
        use countersign::tenancy::quota::{record_usage, QuotaError, UsageKind};
        use countersign::tenant_schema::quota_settings;

        let database_name = database_name_for_id(&state.config.tenant_db_prefix, tenant_id);
        let mut conn = state
            .tenant_pools
            .checkout(&database_name)
            .map_err(|err| anyhow::anyhow!("{err}"))?;

        diesel::update(quota_settings::table)
            .set(quota_settings::max_documents.eq(Some(2)))
            .execute(&mut conn)?;

        record_usage(&mut conn, owner_id, UsageKind::Documents)?;
        record_usage(&mut conn, owner_id, UsageKind::Documents)?;
        let third = record_usage(&mut conn, owner_id, UsageKind::Documents);
        Ok(matches!(third, Err(QuotaError::Exhausted { .. })))
    })
    .await??;
    assert!(exhausted);

    let response = app.get("/api/orgs/quota", Some(&token)).await?;
    let body = body_to_vec(response.into_body()).await?;
    let quota: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(quota["max_documents"], json!(2));
    assert_eq!(quota["used_documents"], json!(2));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn certificate_serials_are_monotonic_and_never_reused() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("owner@example.com", "pw").await?;
    let token = app.login_token("owner@example.com", "pw").await?;
    let tenant_id = create_org(&app, &token, "Signing Org").await?;
    app.provision_tenant(tenant_id).await?;

    let state = app.state.clone();
    let serials = tokio::task::spawn_blocking(move || -> Result<Vec<i64>> {
        use countersign::pki;

        let database_name = database_name_for_id(&state.config.tenant_db_prefix, tenant_id);
        let mut conn = state
            .tenant_pools
            .checkout(&database_name)
            .map_err(|err| anyhow::anyhow!("{err}"))?;

        let active = pki::active_root_ca(&mut conn)?.expect("active root CA after provisioning");
        assert_eq!(active.status, pki::STATUS_ACTIVE);
        assert!(std::path::Path::new(&active.certificate_path).is_file());

        Ok(vec![
            pki::next_serial_number(&mut conn)?,
            pki::next_serial_number(&mut conn)?,
            pki::next_serial_number(&mut conn)?,
        ])
    })
    .await??;

    assert_eq!(serials, vec![2, 3, 4]);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn reconciliation_removes_role_rows_of_deleted_users() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("owner@example.com", "pw").await?;
    let doomed_id = app.insert_user("doomed@example.com", "pw").await?;
    let owner_token = app.login_token("owner@example.com", "pw").await?;
    let doomed_token = app.login_token("doomed@example.com", "pw").await?;

    let tenant_id = create_org(&app, &owner_token, "Sweep Org").await?;
    app.provision_tenant(tenant_id).await?;

    let response = app
        .post_json("/api/orgs/invitations", &json!({}), Some(&owner_token))
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_to_vec(response.into_body()).await?;
    let invitation: serde_json::Value = serde_json::from_slice(&body)?;

    let response = app
        .post_json(
            "/api/orgs/join",
            &json!({ "code": invitation["code"] }),
            Some(&doomed_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    // delete the user centrally; the tenant-side role row is now orphaned
    app.with_conn(move |conn| {
        use countersign::schema::users;
        diesel::delete(users::table.find(doomed_id)).execute(conn)?;
        Ok(())
    })
    .await?;

    let state = app.state.clone();
    let report = tokio::task::spawn_blocking(move || {
        let mut conn = state.pool.get()?;
        Ok::<_, anyhow::Error>(reconcile_role_assignments(
            &mut conn,
            &state.tenant_pools,
            &state.config.tenant_db_prefix,
        )?)
    })
    .await??;

    assert_eq!(report.tenants_checked, 1);
    assert_eq!(report.orphans_removed, 1);

    app.cleanup().await?;
    Ok(())
}
