//! Job, attestation and operator control handlers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use warp::reply::Response;
use warp::Rejection;

use super::generic::{error_reply, ApiResponse};
use crate::error::OracleError;
use crate::relay::redrive_job;
use crate::service::OracleService;
use crate::types::{parse_h256, JobStatus, RelayJob};
use crate::validator::AttestationRequest;

/// Query of `GET /jobs/:bridge_id`.
#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub status: Option<JobStatus>,
}

#[derive(Debug, Serialize)]
pub struct PauseState {
    pub bridge_id: String,
    pub paused: bool,
}

fn job_not_found(bridge_id: &str, message_id: &str) -> OracleError {
    OracleError::JobNotFound(format!("{}:{}", bridge_id, message_id))
}

/// Handler for `GET /jobs/:bridge_id`.
pub async fn list_jobs_handler(
    bridge_id: String,
    query: JobsQuery,
    service: Arc<OracleService>,
) -> Result<Response, Rejection> {
    if let Err(e) = service.registry().get_bridge(&bridge_id) {
        return Ok(error_reply(&e));
    }
    let jobs = match query.status {
        Some(status) => service.store().jobs_in_status(&bridge_id, status),
        None => service.store().jobs_for_bridge(&bridge_id),
    };
    match jobs {
        Ok(jobs) => Ok(ApiResponse::ok(jobs)),
        Err(e) => Ok(error_reply(&e)),
    }
}

/// Handler for `GET /jobs/:bridge_id/:message_id`.
pub async fn get_job_handler(
    bridge_id: String,
    message_id: String,
    service: Arc<OracleService>,
) -> Result<Response, Rejection> {
    let Ok(id) = parse_h256(&message_id) else {
        return Ok(error_reply(&job_not_found(&bridge_id, &message_id)));
    };
    match service.store().job(&bridge_id, &id) {
        Ok(Some(job)) => Ok(ApiResponse::ok(job)),
        Ok(None) => Ok(error_reply(&job_not_found(&bridge_id, &message_id))),
        Err(e) => Ok(error_reply(&e)),
    }
}

/// Handler for `POST /jobs/:bridge_id/:message_id/redrive`.
///
/// Moves a FAILED job back to QUORUM_MET in a new round.
pub async fn redrive_handler(
    bridge_id: String,
    message_id: String,
    service: Arc<OracleService>,
) -> Result<Response, Rejection> {
    let Ok(id) = parse_h256(&message_id) else {
        return Ok(error_reply(&job_not_found(&bridge_id, &message_id)));
    };
    match redrive_job(service.store(), &bridge_id, &id) {
        Ok(job) => {
            info!(bridge = %bridge_id, message_id = %message_id, round = job.round, "Operator re-drive");
            Ok(ApiResponse::<RelayJob>::ok(job))
        }
        Err(e) => Ok(error_reply(&e)),
    }
}

/// Handler for `POST /attestations`.
pub async fn submit_attestation_handler(
    request: AttestationRequest,
    service: Arc<OracleService>,
) -> Result<Response, Rejection> {
    match service.engine().submit_request(request).await {
        Ok(outcome) => Ok(ApiResponse::ok(outcome)),
        Err(e) => Ok(error_reply(&e)),
    }
}

/// Handler for `POST /bridges/:bridge_id/pause|resume`.
pub async fn set_paused_handler(
    bridge_id: String,
    paused: bool,
    service: Arc<OracleService>,
) -> Result<Response, Rejection> {
    let control = match service.control(&bridge_id) {
        Ok(control) => control,
        Err(e) => return Ok(error_reply(&e)),
    };
    if paused {
        control.pause();
    } else {
        control.resume();
    }
    info!(bridge = %bridge_id, paused, "Bridge pause state changed by operator");
    Ok(ApiResponse::ok(PauseState {
        bridge_id,
        paused: control.is_paused(),
    }))
}
