//! End-to-end exercise of the worker server's 402 handshake (§4.G), driven
//! directly against the `axum::Router` with `tower::ServiceExt::oneshot`
//! rather than a live TCP listener (no real clearing network or settlement
//! chain is reachable in this harness, so proof verification paths that
//! require one are exercised only as far as their failure mode).

use std::sync::Arc;

use agentpay::config::{Config, Runtime};
use agentpay::status::NoopStatusSink;
use agentpay::types::{JobId, PaymentProof};
use agentpay::work::EchoWorkCollaborator;
use agentpay::worker::{WorkerApp, routes};
use alloy_primitives::Address;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

const TEST_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

fn test_runtime() -> Runtime {
    let mut config = Config::default();
    config.client_private_key = TEST_KEY.to_string();
    config.ens_name = "worker.eth".to_string();
    // Unreachable on purpose: proof-verification tests only exercise the
    // failure path, since no sandbox chain/clearing network is reachable here.
    config.rpc_url = "http://127.0.0.1:1".parse().unwrap();
    config.clearing_url = "wss://127.0.0.1:1/ws".parse().unwrap();
    Runtime::new(config).expect("valid test identity")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_job(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/job")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn first_post_issues_a_402_with_a_fresh_bill() {
    let runtime = test_runtime();
    let app = Arc::new(WorkerApp::new(runtime, Arc::new(EchoWorkCollaborator), Arc::new(NoopStatusSink)));
    let router = routes(app);

    let response = router
        .oneshot(post_job(json!({ "taskType": "summarize", "inputData": { "doc": "hello" } })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert_eq!(body["reason"], "payment_required");
    assert!(body["bill"]["amount"].as_u64().unwrap() > 0);
    assert!(body["jobId"].as_str().is_some());
}

#[tokio::test]
async fn missing_task_type_is_a_bad_request() {
    let runtime = test_runtime();
    let app = Arc::new(WorkerApp::new(runtime, Arc::new(EchoWorkCollaborator), Arc::new(NoopStatusSink)));
    let router = routes(app);

    let response = router
        .oneshot(post_job(json!({ "inputData": {} })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_job_id_is_not_found() {
    let runtime = test_runtime();
    let app = Arc::new(WorkerApp::new(runtime, Arc::new(EchoWorkCollaborator), Arc::new(NoopStatusSink)));
    let router = routes(app);

    let response = router
        .oneshot(post_job(json!({ "jobId": "does-not-exist" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn overloaded_worker_rejects_new_jobs_with_503() {
    let mut config = Config::default();
    config.client_private_key = TEST_KEY.to_string();
    config.max_open_jobs = 1;
    config.rpc_url = "http://127.0.0.1:1".parse().unwrap();
    config.clearing_url = "wss://127.0.0.1:1/ws".parse().unwrap();
    let runtime = Runtime::new(config).unwrap();
    let app = Arc::new(WorkerApp::new(runtime, Arc::new(EchoWorkCollaborator), Arc::new(NoopStatusSink)));
    let router = routes(app);

    let first = router
        .clone()
        .oneshot(post_job(json!({ "taskType": "summarize", "inputData": {} })))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::PAYMENT_REQUIRED);

    let second = router
        .oneshot(post_job(json!({ "taskType": "summarize", "inputData": {} })))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn bad_proof_returns_402_with_the_same_bill_and_no_work_performed() {
    let runtime = test_runtime();
    let app = Arc::new(WorkerApp::new(runtime, Arc::new(EchoWorkCollaborator), Arc::new(NoopStatusSink)));
    let router = routes(app);

    let first = router
        .clone()
        .oneshot(post_job(json!({ "taskType": "summarize", "inputData": { "doc": "hello" } })))
        .await
        .unwrap();
    let first_body = body_json(first).await;
    let job_id = first_body["jobId"].as_str().unwrap().to_string();
    let bill_amount = first_body["bill"]["amount"].as_u64().unwrap();

    // An amount-too-low proof is rejected before any network call is made.
    let proof = PaymentProof::ChannelClose {
        reference: format!("0x{}", "aa".repeat(32)),
        amount: bill_amount - 1,
        worker_address: Address::ZERO,
    };
    let response = router
        .oneshot(post_job(json!({
            "jobId": job_id,
            "paymentProof": serde_json::to_value(&proof).unwrap(),
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert_eq!(body["reason"], "payment_verification_failed");
    assert_eq!(body["bill"]["amount"].as_u64().unwrap(), bill_amount);
}

#[tokio::test]
async fn job_id_helper_round_trips_through_json() {
    let id = JobId::generate();
    let value = serde_json::to_value(&id).unwrap();
    let back: JobId = serde_json::from_value(value).unwrap();
    assert_eq!(id, back);
}
