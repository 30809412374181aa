use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task;
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
    jobs::JOB_PROVISION_TENANT,
    state::AppState,
    tenancy::lifecycle::{run_provisioning, LifecycleError},
};

use super::{JobExecution, JobHandler};

#[derive(Debug, Deserialize)]
struct ProvisionPayload {
    tenant_id: Uuid,
}

pub struct ProvisionTenantJob;

impl ProvisionTenantJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for ProvisionTenantJob {
    fn job_type(&self) -> &'static str {
        JOB_PROVISION_TENANT
    }

    async fn handle(&self, state: Arc<AppState>, job: crate::models::Job) -> JobExecution {
        let payload: ProvisionPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid provision payload: {err}"),
                }
            }
        };

        let state_clone = state.clone();
        match task::spawn_blocking(move || provision_tenant(state_clone, payload)).await {
            Ok(Ok(())) => JobExecution::Success,
            Ok(Err(ProvisionOutcome::Fatal(err))) => JobExecution::Failed { error: err },
            Ok(Err(ProvisionOutcome::Transient(err))) => {
                warn!(job_id = %job.id, error = %err, "provisioning will retry");
                JobExecution::Retry {
                    delay: Duration::from_secs(30),
                    error: err,
                }
            }
            Err(join_err) => {
                error!(job_id = %job.id, error = %join_err, "provisioning task panicked");
                JobExecution::Retry {
                    delay: Duration::from_secs(60),
                    error: format!("worker panicked: {join_err}"),
                }
            }
        }
    }
}

enum ProvisionOutcome {
    /// Re-running cannot help (tenant row gone, bad payload).
    Fatal(String),
    /// Provisioning is resumable; the queue retries with backoff.
    Transient(String),
}

fn provision_tenant(state: Arc<AppState>, payload: ProvisionPayload) -> Result<(), ProvisionOutcome> {
    let mut conn = state
        .db()
        .map_err(|err| ProvisionOutcome::Transient(format!("{err:?}")))?;

    run_provisioning(
        &mut conn,
        &state.tenant_pools,
        state.storage.as_ref(),
        &state.config.storage_root,
        &state.config.tenant_db_prefix,
        payload.tenant_id,
    )
    .map_err(|err| match err {
        LifecycleError::TenantNotFound(id) => {
            ProvisionOutcome::Fatal(format!("tenant not found: {id}"))
        }
        other => ProvisionOutcome::Transient(other.to_string()),
    })
}
