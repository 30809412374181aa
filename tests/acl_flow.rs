mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, body_to_vec, TestApp};
use countersign::tenancy::acl;
use countersign::tenancy::naming::database_name_for_id;
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

async fn join_with_role(
    app: &TestApp,
    owner_token: &str,
    member_token: &str,
    role: &str,
) -> Result<()> {
    let response = app
        .post_json(
            "/api/orgs/invitations",
            &json!({ "role": role }),
            Some(owner_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_to_vec(response.into_body()).await?;
    let invitation: serde_json::Value = serde_json::from_slice(&body)?;

    let response = app
        .post_json(
            "/api/orgs/join",
            &json!({ "code": invitation["code"] }),
            Some(member_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    Ok(())
}

#[tokio::test]
async fn permission_checks_fail_closed_before_provisioning() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let owner_id = app.insert_user("owner@example.com", "pw").await?;
    let token = app.login_token("owner@example.com", "pw").await?;
    let tenant_id = create_org(&app, &token, "Unprovisioned").await?;

    // the tenant database does not exist yet, so even the owner is
    // denied rather than erroring out
    let response = app
        .post_json("/api/orgs/invitations", &json!({}), Some(&token))
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let granted = app
        .with_conn({
            let state = app.state.clone();
            move |conn| {
                Ok(acl::has_permission_in_tenant(
                    conn,
                    &state.tenant_pools,
                    &state.config.tenant_db_prefix,
                    owner_id,
                    "members.invite",
                    Some(tenant_id),
                ))
            }
        })
        .await?;
    assert!(!granted);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn member_permissions_follow_the_catalog() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("owner@example.com", "pw").await?;
    app.insert_user("member@example.com", "pw").await?;
    app.insert_user("admin@example.com", "pw").await?;
    let owner_token = app.login_token("owner@example.com", "pw").await?;
    let member_token = app.login_token("member@example.com", "pw").await?;
    let admin_token = app.login_token("admin@example.com", "pw").await?;

    let tenant_id = create_org(&app, &owner_token, "Catalog Org").await?;
    app.provision_tenant(tenant_id).await?;

    join_with_role(&app, &owner_token, &member_token, "member").await?;
    join_with_role(&app, &owner_token, &admin_token, "admin").await?;

    // members hold members.view but not members.invite
    let response = app.get("/api/orgs/members", Some(&member_token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let response = app
        .post_json("/api/orgs/invitations", &json!({}), Some(&member_token))
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // admins may invite
    let response = app
        .post_json("/api/orgs/invitations", &json!({}), Some(&admin_token))
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn role_assignment_is_exclusive_and_normalizes_legacy_aliases() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("owner@example.com", "pw").await?;
    let subject_id = app.insert_user("subject@example.com", "pw").await?;
    let owner_token = app.login_token("owner@example.com", "pw").await?;
    let tenant_id = create_org(&app, &owner_token, "Exclusive Org").await?;
    app.provision_tenant(tenant_id).await?;

    let state = app.state.clone();
    let roles = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
        let mut central = state.pool.get()?;

        // the legacy "user" alias lands as member
        acl::assign_role_in_tenant(
            &mut central,
            &state.tenant_pools,
            &state.config.tenant_db_prefix,
            subject_id,
            "user",
            tenant_id,
        )?;
        let first = acl::role_in_tenant(
            &mut central,
            &state.tenant_pools,
            &state.config.tenant_db_prefix,
            subject_id,
            Some(tenant_id),
        )
        .map(|role| role.name)
        .unwrap_or_default();

        // reassignment replaces rather than accumulates
        acl::assign_role_in_tenant(
            &mut central,
            &state.tenant_pools,
            &state.config.tenant_db_prefix,
            subject_id,
            "admin",
            tenant_id,
        )?;

        let database_name = database_name_for_id(&state.config.tenant_db_prefix, tenant_id);
        let mut tenant_conn = state
            .tenant_pools
            .checkout(&database_name)
            .map_err(|err| anyhow::anyhow!("{err}"))?;
        use countersign::tenant_schema::model_has_roles;
        let assignments: i64 = model_has_roles::table
            .filter(model_has_roles::model_id.eq(subject_id))
            .count()
            .get_result(&mut tenant_conn)?;
        assert_eq!(assignments, 1);

        // release the size-1 tenant pool's only connection before the
        // next lookup checks it out again
        drop(tenant_conn);

        let second = acl::role_in_tenant(
            &mut central,
            &state.tenant_pools,
            &state.config.tenant_db_prefix,
            subject_id,
            Some(tenant_id),
        )
        .map(|role| role.name)
        .unwrap_or_default();

        Ok(vec![first, second])
    })
    .await??;

    assert_eq!(roles, vec!["member".to_string(), "admin".to_string()]);

    // unknown roles are rejected outright
    let state = app.state.clone();
    let rejected = tokio::task::spawn_blocking(move || {
        let mut central = state.pool.get()?;
        Ok::<_, anyhow::Error>(
            acl::assign_role_in_tenant(
                &mut central,
                &state.tenant_pools,
                &state.config.tenant_db_prefix,
                subject_id,
                "superuser",
                tenant_id,
            )
            .is_err(),
        )
    })
    .await??;
    assert!(rejected);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn matching_tenant_header_skips_the_default_rewrite() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let owner_id = app.insert_user("owner@example.com", "pw").await?;
    let token = app.login_token("owner@example.com", "pw").await?;

    // creating the org already stored it as the default
    let org = create_org(&app, &token, "Sticky Org").await?;
    let before = user_row_version(&app, owner_id).await?;

    let response = app.get_scoped("/api/orgs/current", &token, org).await?;
    assert_eq!(response.status(), StatusCode::OK);

    // a header matching the stored default leaves the row untouched
    let after = user_row_version(&app, owner_id).await?;
    assert_eq!(before, after);

    app.cleanup().await?;
    Ok(())
}

/// The row's transaction id, which moves on every UPDATE even when the
/// new values equal the old ones.
async fn user_row_version(app: &TestApp, user_id: Uuid) -> Result<i64> {
    app.with_conn(move |conn| {
        #[derive(QueryableByName)]
        struct Row {
            #[diesel(sql_type = diesel::sql_types::BigInt)]
            version: i64,
        }
        let row: Row =
            diesel::sql_query("SELECT xmin::text::bigint AS version FROM users WHERE id = $1")
                .bind::<diesel::sql_types::Uuid, _>(user_id)
                .get_result(conn)?;
        Ok(row.version)
    })
    .await
}

#[tokio::test]
async fn tenant_header_is_membership_gated_and_sticky() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("owner@example.com", "pw").await?;
    app.insert_user("outsider@example.com", "pw").await?;
    let owner_token = app.login_token("owner@example.com", "pw").await?;
    let outsider_token = app.login_token("outsider@example.com", "pw").await?;

    let first = create_org(&app, &owner_token, "First Org").await?;
    let second = create_org(&app, &owner_token, "Second Org").await?;

    // a header naming a tenant the caller is no member of is ignored
    let response = app
        .get_scoped("/api/orgs/current", &outsider_token, first)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_vec(response.into_body()).await?;
    let current: serde_json::Value = serde_json::from_slice(&body)?;
    assert!(current["org"].is_null());

    // an accepted header wins over the stored default and persists
    let response = app
        .get_scoped("/api/orgs/current", &owner_token, first)
        .await?;
    let body = body_to_vec(response.into_body()).await?;
    let current: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(current["org"]["id"], json!(first));

    let response = app.get("/api/orgs/current", Some(&owner_token)).await?;
    let body = body_to_vec(response.into_body()).await?;
    let current: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(current["org"]["id"], json!(first));

    let response = app
        .get_scoped("/api/orgs/current", &owner_token, second)
        .await?;
    let body = body_to_vec(response.into_body()).await?;
    let current: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(current["org"]["id"], json!(second));

    app.cleanup().await?;
    Ok(())
}
