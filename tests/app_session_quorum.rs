//! Exercises the two-party quorum race (spec.md §8 scenario 3, §4.E) against
//! a minimal fake clearing-network server: whichever side submits first gets
//! `quorum not reached`; the second gets the success frame; the server then
//! pushes the first side an unsolicited `asu` notification, matching the
//! `submit_state_awaiting_quorum` fallback this system relies on.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use agentpay::clearing::ClearingClient;
use agentpay::identity::Identity;
use agentpay::payments::app_session::{self, SubmitOutcome};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const CLIENT_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
const WORKER_KEY: &str = "0x059c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690";

/// Per-session submission bookkeeping: the first caller's outbound sink (so
/// the fake server can push it an unsolicited `asu` once the second caller
/// lands), keyed by `(app_session_id, version)`.
#[derive(Default)]
struct FakeServerState {
    seen_submissions: HashSet<(String, u64)>,
    waiting_senders: HashMap<(String, u64), tokio::sync::mpsc::UnboundedSender<Message>>,
    next_session_id: u64,
}

async fn run_fake_server(listener: TcpListener, state: Arc<Mutex<FakeServerState>>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let state = state.clone();
        tokio::spawn(async move {
            let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                return;
            };
            let (mut sink, mut stream) = ws.split();
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();

            let writer = tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
            });

            while let Some(Ok(Message::Text(text))) = stream.next().await {
                let Ok(envelope) = serde_json::from_str::<Value>(&text) else { continue };
                let Some(req) = envelope.get("req").and_then(Value::as_array) else { continue };
                let id = req[0].as_u64().unwrap_or(0);
                let method = req[1].as_str().unwrap_or("");
                let payload = &req[2];

                let response = match method {
                    "auth_request" => Some(json!({"res": [id, "auth_challenge", {"challenge": "fake-challenge"}]})),
                    "auth_verify" => Some(json!({"res": [id, "auth_verify", {"success": true}]})),
                    "create_app_session" => {
                        let mut guard = state.lock().await;
                        guard.next_session_id += 1;
                        let sid = format!("sess-{}", guard.next_session_id);
                        Some(json!({"res": [id, "create_app_session", {"app_session_id": sid, "version": 1}]}))
                    }
                    "submit_app_state" => {
                        let sid = payload.get("app_session_id").and_then(Value::as_str).unwrap_or("").to_string();
                        let version = payload.get("version").and_then(Value::as_u64).unwrap_or(0);
                        let key = (sid.clone(), version);
                        let mut guard = state.lock().await;
                        if guard.seen_submissions.insert(key.clone()) {
                            // First submission for this (session, version): tell this
                            // caller to wait, and remember its sink.
                            guard.waiting_senders.insert(key, tx.clone());
                            Some(json!({"res": [id, "error", {"error": "quorum not reached"}]}))
                        } else {
                            // Second submission: succeed, and wake the first caller.
                            if let Some(waiting) = guard.waiting_senders.remove(&key) {
                                let notification =
                                    json!({"res": [0, "asu", {"app_session_id": sid, "version": version}]});
                                let _ = waiting.send(Message::Text(notification.to_string().into()));
                            }
                            Some(json!({"res": [id, "submit_app_state", {"version": version}]}))
                        }
                    }
                    "close_app_session" => Some(json!({"res": [id, "close_app_session", {"status": "closed"}]})),
                    "get_app_sessions" => Some(json!({"res": [id, "get_app_sessions", {"app_sessions": []}]})),
                    _ => None,
                };
                if let Some(response) = response {
                    if tx.send(Message::Text(response.to_string().into())).is_err() {
                        break;
                    }
                }
            }
            drop(tx);
            let _ = writer.await;
        });
    }
}

async fn spawn_fake_server() -> (Url, Arc<Mutex<FakeServerState>>) {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(Mutex::new(FakeServerState::default()));
    tokio::spawn(run_fake_server(listener, state.clone()));
    (Url::parse(&format!("ws://{addr}/ws")).unwrap(), state)
}

#[tokio::test]
async fn second_signer_wakes_the_first_via_asu_notification() {
    let (url, _state) = spawn_fake_server().await;

    let client_identity = Identity::from_private_key("client.eth", CLIENT_KEY).unwrap();
    let worker_identity = Identity::from_private_key("worker.eth", WORKER_KEY).unwrap();

    let client_conn = ClearingClient::connect(&url, &client_identity, "agentpay-test", json!({}), 9_999_999_999, "test")
        .await
        .unwrap();
    let worker_conn = ClearingClient::connect(&url, &worker_identity, "agentpay-test", json!({}), 9_999_999_999, "test")
        .await
        .unwrap();

    let session = app_session::create_session(
        &client_conn,
        "agentpay",
        1,
        client_identity.address(),
        worker_identity.address(),
        2,
        3600,
        42,
    )
    .await
    .unwrap();

    let allocations = app_session::build_allocations(
        client_identity.address(),
        worker_identity.address(),
        "ytest.usd",
        1_000_000,
    );
    let next_version = session.version + 1;

    // The client submits first and must see PartiallySigned-then-Accepted
    // once the worker's submission lands, all within the grace period.
    let client_task = {
        let app_session_id = session.app_session_id.clone();
        let allocations = allocations.clone();
        tokio::spawn(async move {
            app_session::submit_state_awaiting_quorum(
                &client_conn,
                &app_session_id,
                next_version,
                &allocations,
                Duration::from_secs(5),
            )
            .await
        })
    };

    // Give the client's submission a head start so it is guaranteed to be
    // the first of the two (and thus the one that has to wait).
    tokio::time::sleep(Duration::from_millis(200)).await;

    let worker_outcome = app_session::submit_state(&worker_conn, &session.app_session_id, next_version, &allocations)
        .await
        .unwrap();
    assert_eq!(worker_outcome, SubmitOutcome::Accepted);

    let client_outcome = client_task.await.unwrap().unwrap();
    assert_eq!(client_outcome, SubmitOutcome::Accepted);
}
