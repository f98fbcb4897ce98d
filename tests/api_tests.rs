//! Unit tests for the REST API
//!
//! These tests build a full `OracleService` over scripted chains and call the
//! warp routes directly with `warp::test::request`.

use std::sync::Arc;

use bridge_oracle::api::ApiServer;
use bridge_oracle::config::{OracleMode, SignatureScheme};
use bridge_oracle::connector::ConnectorPool;
use bridge_oracle::monitor::EventWatcher;
use bridge_oracle::service::OracleService;
use bridge_oracle::storage::OracleStore;
use bridge_oracle::types::{hex_h256, ChainSide, JobStatus, RelayJob};
use ethereum_types::{Address, H256};
use serde_json::{json, Value};
use warp::http::StatusCode;

#[path = "mod.rs"]
mod test_helpers;

use test_helpers::{
    build_test_config, create_test_intent, create_test_job, mock_pool, sign_attestation,
    test_bridge_on, test_key, transfer_log, validators_abc, MockChain, FOREIGN_CHAIN_ID,
    HOME_CHAIN_ID, HOME_CONTRACT,
};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Healthy bridge between the two scripted chains
const BRIDGE_A: &str = "a";
/// Bridge whose chains are unreachable
const BRIDGE_B: &str = "b";

struct Harness {
    service: Arc<OracleService>,
    pool: ConnectorPool,
}

impl Harness {
    /// Service over bridge "a" (chains up, one transfer at block 5) and bridge
    /// "b" (chains down).
    fn new(crypto: Option<u8>) -> Self {
        let home = MockChain::new(HOME_CHAIN_ID);
        let foreign = MockChain::new(FOREIGN_CHAIN_ID);
        home.with(|s| {
            s.latest_block = 10;
            s.logs = vec![transfer_log(
                HOME_CONTRACT,
                H256::repeat_byte(1),
                Address::repeat_byte(0x0f),
                1_000,
                5,
                0,
            )];
        });
        foreign.set_latest_block(10);

        let down_home = MockChain::new(77);
        let down_foreign = MockChain::new(78);
        down_home.with(|s| s.down = true);
        down_foreign.with(|s| s.down = true);

        let config = build_test_config(
            OracleMode::Aggregator,
            None,
            vec![
                test_bridge_on(BRIDGE_A, HOME_CHAIN_ID, FOREIGN_CHAIN_ID, validators_abc(), 2),
                test_bridge_on(BRIDGE_B, 77, 78, validators_abc(), 2),
            ],
        );
        let pool = mock_pool(&[home, foreign, down_home, down_foreign]);
        let service = OracleService::new(
            Arc::new(config),
            OracleStore::temporary().unwrap(),
            pool.clone(),
            crypto.map(|seed| Arc::new(test_key(seed))),
        )
        .unwrap();

        Self {
            service: Arc::new(service),
            pool,
        }
    }

    /// Runs one watcher tick on every bridge.
    async fn tick(&self) {
        for bridge in self.service.registry().list_bridges() {
            let watchers: Vec<EventWatcher> = ChainSide::BOTH
                .iter()
                .map(|side| {
                    EventWatcher::new(
                        bridge.clone(),
                        *side,
                        self.pool.get(bridge.side(*side).chain_id).unwrap(),
                        self.service.store().clone(),
                        self.service.engine().clone(),
                    )
                    .unwrap()
                })
                .collect();
            self.service.watch_once(&bridge.id, &watchers).await.unwrap();
        }
    }

    fn job(&self) -> RelayJob {
        self.service
            .store()
            .job(BRIDGE_A, &H256::repeat_byte(1))
            .unwrap()
            .expect("Job should exist after the tick")
    }

    fn routes(
        &self,
    ) -> impl warp::Filter<Extract = impl warp::Reply, Error = std::convert::Infallible> + Clone {
        ApiServer::new(self.service.clone()).create_routes()
    }
}

fn body(response: &warp::http::Response<warp::hyper::body::Bytes>) -> Value {
    serde_json::from_slice(response.body()).expect("Response should be JSON")
}

// ============================================================================
// HEALTH AND BRIDGE TESTS
// ============================================================================

/// Test that /health reports each bridge and fails overall when one is down
/// Why: One failing bridge must be visible without hiding the healthy ones
#[tokio::test]
async fn test_health_reports_per_bridge() {
    let h = Harness::new(None);
    h.tick().await;

    let response = warp::test::request()
        .method("GET")
        .path("/health")
        .reply(&h.routes())
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let report = body(&response);
    assert_eq!(report["healthy"], json!(false));
    let bridges = report["bridges"].as_array().unwrap();
    assert_eq!(bridges.len(), 2);

    let a = &bridges[0];
    assert_eq!(a["id"], json!(BRIDGE_A));
    assert_eq!(a["healthy"], json!(true));
    assert_eq!(a["lastProcessedBlock"], json!(8));
    assert_eq!(a["pendingJobs"], json!(1));
    assert_eq!(a["failedJobs"], json!(0));

    let b = &bridges[1];
    assert_eq!(b["id"], json!(BRIDGE_B));
    assert_eq!(b["healthy"], json!(false));
    assert!(b["sides"][0]["lastError"].as_str().unwrap().contains("unavailable"));
}

/// Test that pendingJobs counts only jobs still collecting attestations
#[tokio::test]
async fn test_health_pending_jobs_excludes_relaying() {
    let h = Harness::new(None);
    h.tick().await;
    h.service
        .store()
        .transition(BRIDGE_A, &H256::repeat_byte(1), JobStatus::Pending, JobStatus::QuorumMet, None)
        .unwrap();

    let response = warp::test::request()
        .method("GET")
        .path("/health")
        .reply(&h.routes())
        .await;

    let a = &body(&response)["bridges"][0];
    assert_eq!(a["id"], json!(BRIDGE_A));
    assert_eq!(a["pendingJobs"], json!(0));
    assert_eq!(a["failedJobs"], json!(0));
}

/// Test that the bridge listing omits RPC URLs
#[tokio::test]
async fn test_list_bridges() {
    let h = Harness::new(None);

    let response = warp::test::request()
        .method("GET")
        .path("/bridges")
        .reply(&h.routes())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body(&response);
    assert_eq!(json["success"], json!(true));
    let bridges = json["data"].as_array().unwrap();
    assert_eq!(bridges.len(), 2);
    assert_eq!(bridges[0]["required_signatures"], json!(2));
    assert_eq!(bridges[0]["validators"].as_array().unwrap().len(), 3);
    assert_eq!(bridges[0]["home"]["chain_id"], json!(HOME_CHAIN_ID));
    assert!(bridges[0]["home"].get("rpc_url").is_none());
    assert_eq!(bridges[0]["paused"], json!(false));
}

/// Test that the identity endpoint exposes the oracle address
#[tokio::test]
async fn test_identity() {
    let h = Harness::new(Some(9));

    let response = warp::test::request()
        .method("GET")
        .path("/identity")
        .reply(&h.routes())
        .await;
    let json = body(&response);
    assert_eq!(json["data"]["mode"], json!("aggregator"));
    assert_eq!(
        json["data"]["ethereum_address"],
        json!(bridge_oracle::types::hex_address(&test_key(9).ethereum_address()))
    );
}

// ============================================================================
// PAUSE TESTS
// ============================================================================

/// Test that pausing and resuming a bridge is reflected in /health
/// What is tested: Operator pause control
/// Why: A paused bridge is reported unhealthy until resumed
#[tokio::test]
async fn test_pause_and_resume() {
    let h = Harness::new(None);
    h.tick().await;
    let routes = h.routes();

    let response = warp::test::request()
        .method("POST")
        .path("/bridges/a/pause")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(&response)["data"]["paused"], json!(true));

    let health = body(
        &warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&routes)
            .await,
    );
    assert_eq!(health["bridges"][0]["paused"], json!(true));
    assert_eq!(health["bridges"][0]["healthy"], json!(false));

    let response = warp::test::request()
        .method("POST")
        .path("/bridges/a/resume")
        .reply(&routes)
        .await;
    assert_eq!(body(&response)["data"]["paused"], json!(false));
    assert!(!h.service.control(BRIDGE_A).unwrap().is_paused());

    let response = warp::test::request()
        .method("POST")
        .path("/bridges/unknown/pause")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// JOB TESTS
// ============================================================================

/// Test job listing with and without a status filter
#[tokio::test]
async fn test_list_jobs() {
    let h = Harness::new(None);
    h.tick().await;
    let routes = h.routes();

    let all = body(&warp::test::request().path("/jobs/a").reply(&routes).await);
    assert_eq!(all["data"].as_array().unwrap().len(), 1);
    assert_eq!(all["data"][0]["status"], json!("PENDING"));

    let pending = body(
        &warp::test::request()
            .path("/jobs/a?status=PENDING")
            .reply(&routes)
            .await,
    );
    assert_eq!(pending["data"].as_array().unwrap().len(), 1);

    let confirmed = body(
        &warp::test::request()
            .path("/jobs/a?status=CONFIRMED")
            .reply(&routes)
            .await,
    );
    assert!(confirmed["data"].as_array().unwrap().is_empty());

    let response = warp::test::request()
        .path("/jobs/a?status=bogus")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = warp::test::request().path("/jobs/nope").reply(&routes).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Test fetching a single job by message id
#[tokio::test]
async fn test_get_job() {
    let h = Harness::new(None);
    h.tick().await;
    let routes = h.routes();

    let path = format!("/jobs/a/{}", hex_h256(&H256::repeat_byte(1)));
    let response = warp::test::request().path(&path).reply(&routes).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body(&response);
    assert_eq!(json["data"]["bridge_id"], json!(BRIDGE_A));
    assert_eq!(json["data"]["destination_chain"], json!("foreign"));

    let path = format!("/jobs/a/{}", hex_h256(&H256::repeat_byte(0x99)));
    let response = warp::test::request().path(&path).reply(&routes).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body(&response)["success"], json!(false));

    let response = warp::test::request().path("/jobs/a/not-hex").reply(&routes).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Test that only failed jobs can be re-driven through the API
#[tokio::test]
async fn test_redrive_endpoint() {
    let h = Harness::new(None);
    h.tick().await;
    let routes = h.routes();

    let path = format!("/jobs/a/{}/redrive", hex_h256(&H256::repeat_byte(1)));
    let response = warp::test::request()
        .method("POST")
        .path(&path)
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let mut intent = create_test_intent(2);
    intent.bridge_id = BRIDGE_A.to_string();
    let failed = create_test_job(&intent, JobStatus::Failed, &[("A", 1), ("B", 2)]);
    h.service.store().create_job_if_absent(&failed).unwrap();

    let path = format!("/jobs/a/{}/redrive", hex_h256(&failed.message_id));
    let response = warp::test::request()
        .method("POST")
        .path(&path)
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body(&response);
    assert_eq!(json["data"]["status"], json!("QUORUM_MET"));
    assert_eq!(json["data"]["round"], json!(1));
}

// ============================================================================
// ATTESTATION TESTS
// ============================================================================

fn attestation_body(job: &RelayJob, signer_id: &str, seed: u8) -> Value {
    let attestation = sign_attestation(&job.intent, signer_id, seed, SignatureScheme::Secp256k1);
    json!({
        "bridge_id": job.bridge_id,
        "message_id": hex_h256(&job.message_id),
        "signer_id": attestation.signer_id,
        "signature": attestation.signature,
    })
}

/// Test that posted attestations are verified and counted towards quorum
/// Why: Only genuine validator signatures may move a job to QUORUM_MET
#[tokio::test]
async fn test_submit_attestations() {
    let h = Harness::new(None);
    h.tick().await;
    let routes = h.routes();
    let job = h.job();

    // A's id with C's key
    let response = warp::test::request()
        .method("POST")
        .path("/attestations")
        .json(&attestation_body(&job, "A", 3))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = warp::test::request()
        .method("POST")
        .path("/attestations")
        .json(&attestation_body(&job, "A", 1))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body(&response);
    assert_eq!(json["data"]["outcome"], json!("accepted"));
    assert_eq!(json["data"]["signers"], json!(1));

    let response = warp::test::request()
        .method("POST")
        .path("/attestations")
        .json(&attestation_body(&job, "B", 2))
        .reply(&routes)
        .await;
    assert_eq!(body(&response)["data"]["outcome"], json!("quorum_reached"));
    assert_eq!(h.job().status, JobStatus::QuorumMet);
}

/// Test that attestations for unseen messages are stashed
#[tokio::test]
async fn test_submit_attestation_for_unknown_message() {
    let h = Harness::new(None);
    let mut intent = create_test_intent(4);
    intent.bridge_id = BRIDGE_A.to_string();
    let unseen = RelayJob::from_intent(intent, FOREIGN_CHAIN_ID);

    let response = warp::test::request()
        .method("POST")
        .path("/attestations")
        .json(&attestation_body(&unseen, "A", 1))
        .reply(&h.routes())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body(&response)["data"]["outcome"], json!("stashed"));
}

/// Test that malformed request bodies are rejected
#[tokio::test]
async fn test_invalid_attestation_body() {
    let h = Harness::new(None);

    let response = warp::test::request()
        .method("POST")
        .path("/attestations")
        .header("content-type", "application/json")
        .body("{not json")
        .reply(&h.routes())
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body(&response)["error"].as_str().unwrap().contains("Invalid JSON"));

    let response = warp::test::request()
        .method("POST")
        .path("/attestations")
        .json(&json!({
            "bridge_id": "nope",
            "message_id": hex_h256(&H256::repeat_byte(1)),
            "signer_id": "A",
            "signature": "0x00",
        }))
        .reply(&h.routes())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
