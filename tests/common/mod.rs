use std::env;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use countersign::auth::jwt::JwtService;
use countersign::config::AppConfig;
use countersign::db::{self, PgPool};
use countersign::models::{Job, NewUser};
use countersign::routes;
use countersign::state::AppState;
use countersign::storage::{FsStorage, TenantStorage};
use countersign::tenancy::deprovision::force_drop_database;
use countersign::tenancy::lifecycle::run_provisioning;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::Text;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use serde::Serialize;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Distinct from any production prefix so test cleanup can drop every
/// matching database without looking at the tenants table.
#[allow(dead_code)]
pub const TEST_TENANT_DB_PREFIX: &str = "ctest_";

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub struct TestApp {
    pub state: AppState,
    router: Router,
    _storage_root: tempfile::TempDir,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let storage_root = tempfile::tempdir().context("failed to create storage tempdir")?;

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            tenant_db_prefix: TEST_TENANT_DB_PREFIX.to_string(),
            tenant_pool_size: 1,
            storage_root: storage_root.path().to_path_buf(),
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: "test-issuer".to_string(),
            jwt_audience: "test-audience".to_string(),
            jwt_expiry_minutes: 60,
            refresh_token_expiry_days: 30,
            refresh_cookie_secure: false,
            refresh_cookie_domain: None,
            cors_allowed_origin: None,
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage: Arc<dyn TenantStorage> = Arc::new(FsStorage);
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(pool.clone(), config, storage, jwt);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            _storage_root: storage_root,
        })
    }

    pub async fn cleanup(&self) -> Result<()> {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = state
                .pool
                .get()
                .map_err(|err| anyhow!("failed to get cleanup connection: {err}"))?;
            drop_test_tenant_databases(&state, &mut conn)?;
            truncate_all(&mut conn)?;
            Ok(())
        })
        .await
        .context("cleanup task panicked")?
    }

    pub async fn insert_user(&self, email: &str, password: &str) -> Result<Uuid> {
        let email = email.to_string();
        let password = password.to_string();
        self.with_conn(move |conn| {
            let password_hash = hash_password(&password)?;
            let display_name = email.split('@').next().unwrap_or("user").to_string();
            let user = NewUser {
                id: Uuid::new_v4(),
                email,
                display_name,
                password_hash,
            };
            diesel::insert_into(countersign::schema::users::table)
                .values(&user)
                .execute(conn)
                .context("failed to insert user")?;
            Ok(user.id)
        })
        .await
    }

    pub async fn login_token(&self, email: &str, password: &str) -> Result<String> {
        #[derive(Serialize)]
        struct LoginPayload<'a> {
            email: &'a str,
            password: &'a str,
        }

        let response = self
            .post_json("/api/auth/login", &LoginPayload { email, password }, None)
            .await?;

        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );

        let body = body_to_vec(response.into_body()).await?;
        #[derive(serde::Deserialize)]
        struct LoginResponse {
            access_token: String,
        }
        let parsed: LoginResponse = serde_json::from_slice(&body)?;
        Ok(parsed.access_token)
    }

    /// Runs the provisioning pass synchronously, as the worker would
    /// after picking up the enqueued job.
    #[allow(dead_code)]
    pub async fn provision_tenant(&self, tenant_id: Uuid) -> Result<()> {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = state
                .pool
                .get()
                .map_err(|err| anyhow!("failed to get provisioning connection: {err}"))?;
            run_provisioning(
                &mut conn,
                &state.tenant_pools,
                state.storage.as_ref(),
                &state.config.storage_root,
                &state.config.tenant_db_prefix,
                tenant_id,
            )
            .map_err(|err| anyhow!("provisioning failed: {err}"))
        })
        .await
        .context("provisioning task panicked")?
    }

    #[allow(dead_code)]
    pub async fn jobs_by_type(&self, ty: &str) -> Result<Vec<Job>> {
        let ty = ty.to_string();
        self.with_conn(move |conn| {
            use countersign::schema::jobs::dsl::{job_type as job_type_col, jobs as jobs_table};
            let rows = jobs_table
                .filter(job_type_col.eq(&ty))
                .load::<Job>(conn)
                .context("failed to load jobs")?;
            Ok(rows)
        })
        .await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::POST, path, payload, token, None)
            .await
    }

    #[allow(dead_code)]
    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::PATCH, path, payload, token, None)
            .await
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        self.send_empty(Method::GET, path, token, None).await
    }

    #[allow(dead_code)]
    pub async fn get_scoped(
        &self,
        path: &str,
        token: &str,
        tenant: Uuid,
    ) -> Result<hyper::Response<Body>> {
        self.send_empty(Method::GET, path, Some(token), Some(tenant))
            .await
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        self.send_empty(Method::DELETE, path, token, None).await
    }

    async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
        token: Option<&str>,
        tenant: Option<Uuid>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        if let Some(tenant) = tenant {
            builder = builder.header("x-tenant-id", tenant.to_string());
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    async fn send_empty(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        tenant: Option<Uuid>,
    ) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        if let Some(tenant) = tenant {
            builder = builder.header("x-tenant-id", tenant.to_string());
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE refresh_tokens, jobs, tenant_invitations, tenant_members, tenants, oauth_clients, users RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}

/// Drops every physical database left behind by a previous test run.
fn drop_test_tenant_databases(state: &AppState, conn: &mut PgConnection) -> Result<()> {
    #[derive(QueryableByName)]
    struct DatRow {
        #[diesel(sql_type = Text)]
        datname: String,
    }

    let pattern = format!("{TEST_TENANT_DB_PREFIX}%");
    let rows: Vec<DatRow> = sql_query("SELECT datname FROM pg_database WHERE datname LIKE $1")
        .bind::<Text, _>(&pattern)
        .load(conn)
        .context("failed to list tenant databases")?;

    for row in rows {
        force_drop_database(conn, &state.tenant_pools, &row.datname)
            .map_err(|err| anyhow!("failed to drop {}: {err}", row.datname))?;
    }
    Ok(())
}

fn hash_password(password: &str) -> Result<String> {
    use argon2::password_hash::{PasswordHasher, SaltString};
    use argon2::Argon2;

    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?
        .to_string())
}
