//! Generic API structures and handlers
//!
//! Shared response envelope, warp filter helpers, rejection handling, the
//! service-level endpoints (health, bridges, identity) and the API server.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use super::jobs;
use crate::error::OracleError;
use crate::service::OracleService;
use crate::types::hex_address;

// ============================================================================
// SHARED REQUEST/RESPONSE STRUCTURES
// ============================================================================

/// Standardized response structure for all API endpoints except `/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Response data (if successful)
    pub data: Option<T>,
    /// Error message (if failed)
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Response {
        warp::reply::json(&ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        })
        .into_response()
    }
}

/// Error reply with a status matching the error kind.
pub fn error_reply(err: &OracleError) -> Response {
    let status = match err {
        OracleError::UnknownBridge(_) | OracleError::JobNotFound(_) => StatusCode::NOT_FOUND,
        OracleError::InvalidSignature { .. } => StatusCode::BAD_REQUEST,
        OracleError::StatusMismatch { .. } | OracleError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        OracleError::InboxFull(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("API request failed: {}", err);
    }
    warp::reply::with_status(
        warp::reply::json(&ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(err.to_string()),
        }),
        status,
    )
    .into_response()
}

/// Validator entry as exposed by `/bridges`.
#[derive(Debug, Serialize)]
pub struct ValidatorSummary {
    pub id: String,
    pub scheme: crate::config::SignatureScheme,
}

/// Side entry as exposed by `/bridges`. RPC URLs are left out since they
/// often embed provider credentials.
#[derive(Debug, Serialize)]
pub struct SideSummary {
    pub name: String,
    pub chain_id: u64,
    pub bridge_contract_addr: String,
    pub start_block: u64,
    pub confirmation_depth: u64,
    pub confirmations: u64,
}

#[derive(Debug, Serialize)]
pub struct BridgeSummary {
    pub id: String,
    pub required_signatures: usize,
    pub validators: Vec<ValidatorSummary>,
    pub home: SideSummary,
    pub foreign: SideSummary,
    pub paused: bool,
}

#[derive(Debug, Serialize)]
pub struct Identity {
    pub mode: crate::config::OracleMode,
    pub validator_id: Option<String>,
    /// EVM address used to sign attestations and finalize transactions
    pub ethereum_address: Option<String>,
    /// Ed25519 public key (base64)
    pub public_key: Option<String>,
}

// ============================================================================
// GENERIC API HANDLERS
// ============================================================================

/// Handler for `GET /health`.
///
/// Returns 200 when every bridge is healthy and 503 otherwise. Each bridge
/// carries its own `healthy` flag.
pub async fn health_handler(service: Arc<OracleService>) -> Result<Response, Rejection> {
    match service.health_report().await {
        Ok(report) => {
            let status = if report.healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            Ok(warp::reply::with_status(warp::reply::json(&report), status).into_response())
        }
        Err(e) => Ok(error_reply(&e)),
    }
}

/// Handler for `GET /bridges`.
pub async fn list_bridges_handler(service: Arc<OracleService>) -> Result<Response, Rejection> {
    let side = |chain: &crate::config::ChainSideConfig| SideSummary {
        name: chain.name.clone(),
        chain_id: chain.chain_id,
        bridge_contract_addr: chain.bridge_contract_addr.clone(),
        start_block: chain.start_block,
        confirmation_depth: chain.confirmation_depth,
        confirmations: chain.confirmations,
    };

    let bridges: Vec<BridgeSummary> = service
        .registry()
        .list_bridges()
        .iter()
        .map(|bridge| BridgeSummary {
            id: bridge.id.clone(),
            required_signatures: bridge.required_signatures,
            validators: bridge
                .validators
                .iter()
                .map(|v| ValidatorSummary {
                    id: v.id.clone(),
                    scheme: v.scheme,
                })
                .collect(),
            home: side(&bridge.home),
            foreign: side(&bridge.foreign),
            paused: service
                .control(&bridge.id)
                .map(|control| control.is_paused())
                .unwrap_or(false),
        })
        .collect();

    Ok(ApiResponse::ok(bridges))
}

/// Handler for `GET /identity`.
pub async fn identity_handler(service: Arc<OracleService>) -> Result<Response, Rejection> {
    let crypto = service.crypto();
    Ok(ApiResponse::ok(Identity {
        mode: service.config().oracle.mode,
        validator_id: service.config().oracle.validator_id.clone(),
        ethereum_address: crypto.map(|c| hex_address(&c.ethereum_address())),
        public_key: crypto.map(|c| c.get_public_key()),
    }))
}

// ============================================================================
// WARP FILTER HELPERS
// ============================================================================

pub fn with_service(
    service: Arc<OracleService>,
) -> impl Filter<Extract = (Arc<OracleService>,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

// ============================================================================
// REJECTION HANDLER
// ============================================================================

/// Converts warp rejections into JSON error responses.
pub async fn handle_rejection(rej: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(err) = rej.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", err))
    } else if let Some(err) = rej.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, format!("Invalid query: {}", err))
    } else if rej.is_not_found() {
        (StatusCode::NOT_FOUND, "Endpoint not found".to_string())
    } else if rej.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        error!("Unhandled rejection: {:?}", rej);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
        }),
        status,
    ))
}

// ============================================================================
// API SERVER IMPLEMENTATION
// ============================================================================

/// REST API server exposing health, job inspection and operator controls.
pub struct ApiServer {
    service: Arc<OracleService>,
}

impl ApiServer {
    pub fn new(service: Arc<OracleService>) -> Self {
        Self { service }
    }

    /// Binds the configured address and serves until the process exits.
    pub async fn run(&self) -> anyhow::Result<()> {
        let api = &self.service.config().api;
        let addr: SocketAddr = format!("{}:{}", api.host, api.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid API address {}:{}: {}", api.host, api.port, e))?;
        info!("Starting API server on {}", addr);

        warp::serve(self.create_routes()).run(addr).await;
        Ok(())
    }

    /// Creates all routes with CORS and rejection handling applied.
    pub fn create_routes(
        &self,
    ) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
        let service = self.service.clone();

        let health = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_service(service.clone()))
            .and_then(health_handler);

        let bridges = warp::path("bridges")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_service(service.clone()))
            .and_then(list_bridges_handler);

        let identity = warp::path("identity")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_service(service.clone()))
            .and_then(identity_handler);

        // GET /jobs/:bridge_id?status=
        let list_jobs = warp::path!("jobs" / String)
            .and(warp::get())
            .and(warp::query::<jobs::JobsQuery>())
            .and(with_service(service.clone()))
            .and_then(jobs::list_jobs_handler);

        // GET /jobs/:bridge_id/:message_id
        let get_job = warp::path!("jobs" / String / String)
            .and(warp::get())
            .and(with_service(service.clone()))
            .and_then(jobs::get_job_handler);

        // POST /jobs/:bridge_id/:message_id/redrive
        let redrive = warp::path!("jobs" / String / String / "redrive")
            .and(warp::post())
            .and(with_service(service.clone()))
            .and_then(jobs::redrive_handler);

        // POST /attestations
        let attestations = warp::path("attestations")
            .and(warp::path::end())
            .and(warp::post())
            .and(warp::body::json())
            .and(with_service(service.clone()))
            .and_then(jobs::submit_attestation_handler);

        // POST /bridges/:bridge_id/pause and /resume
        let pause = warp::path!("bridges" / String / "pause")
            .and(warp::post())
            .and(with_service(service.clone()))
            .and_then(|bridge_id: String, service: Arc<OracleService>| {
                jobs::set_paused_handler(bridge_id, true, service)
            });
        let resume = warp::path!("bridges" / String / "resume")
            .and(warp::post())
            .and(with_service(service.clone()))
            .and_then(|bridge_id: String, service: Arc<OracleService>| {
                jobs::set_paused_handler(bridge_id, false, service)
            });

        let cors_origins = service.config().api.cors_origins.clone();
        let cors = if cors_origins.is_empty() {
            warp::cors().allow_any_origin()
        } else {
            warp::cors().allow_origins(cors_origins.iter().map(String::as_str))
        }
        .allow_methods(vec!["GET", "POST"])
        .allow_headers(vec!["content-type"]);

        health
            .or(bridges)
            .or(identity)
            .or(list_jobs)
            .or(get_job)
            .or(redrive)
            .or(attestations)
            .or(pause)
            .or(resume)
            .with(cors)
            .recover(handle_rejection)
    }
}
