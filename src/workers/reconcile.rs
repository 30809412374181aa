use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::task;
use tracing::{error, info, warn};

use crate::{
    jobs::JOB_RECONCILE_ROLE_ASSIGNMENTS, state::AppState,
    tenancy::reconcile::reconcile_role_assignments,
};

use super::{JobExecution, JobHandler};

pub struct ReconcileRolesJob;

impl ReconcileRolesJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for ReconcileRolesJob {
    fn job_type(&self) -> &'static str {
        JOB_RECONCILE_ROLE_ASSIGNMENTS
    }

    async fn handle(&self, state: Arc<AppState>, job: crate::models::Job) -> JobExecution {
        let state_clone = state.clone();
        match task::spawn_blocking(move || reconcile(state_clone)).await {
            Ok(Ok(())) => JobExecution::Success,
            Ok(Err(err)) => {
                warn!(job_id = %job.id, error = %err, "reconciliation will retry");
                JobExecution::Retry {
                    delay: Duration::from_secs(60),
                    error: err,
                }
            }
            Err(join_err) => {
                error!(job_id = %job.id, error = %join_err, "reconciliation task panicked");
                JobExecution::Retry {
                    delay: Duration::from_secs(120),
                    error: format!("worker panicked: {join_err}"),
                }
            }
        }
    }
}

fn reconcile(state: Arc<AppState>) -> Result<(), String> {
    let mut conn = state.db().map_err(|err| format!("{err:?}"))?;
    let report = reconcile_role_assignments(
        &mut conn,
        &state.tenant_pools,
        &state.config.tenant_db_prefix,
    )
    .map_err(|err| err.to_string())?;

    info!(
        checked = report.tenants_checked,
        skipped = report.tenants_skipped,
        removed = report.orphans_removed,
        "role assignment reconciliation finished"
    );
    Ok(())
}
