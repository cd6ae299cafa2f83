//! Clearing-Network Client (§4.C): a long-lived authenticated websocket
//! session used by the channel and app-session paths.
//!
//! Each connection is a *session actor*: one outgoing request in flight per
//! call, a response-correlation table, and a single reader task dispatching
//! frames to waiters (§5). Multiple sessions may coexist — e.g. the two
//! participants of a quorum=2 app session each own one.

pub mod frames;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::Address;
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{SolStruct, eip712_domain, sol};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{broadcast, oneshot, watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use url::Url;

use crate::error::AgentPayError;
use crate::identity::Identity;
use frames::{InboundFrame, NotificationKind, OutboundFrame, RequestId};

sol! {
    #[derive(Debug)]
    struct AuthChallenge {
        string challenge;
    }
}

/// Default per-call timeouts by method kind (§6: 20-60s).
fn timeout_for(method: &str) -> Duration {
    match method {
        "auth_request" | "auth_verify" => Duration::from_secs(20),
        "create_channel" | "close_channel" | "create_app_session" | "close_app_session" => {
            Duration::from_secs(60)
        }
        _ => Duration::from_secs(30),
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A notification the reader loop could not correlate to a pending call:
/// `asu` (app session update), `bu` (balance update), or `assets` (catalogue).
#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub payload: Value,
}

/// One authenticated connection to the clearing network.
pub struct ClearingClient {
    write: Arc<AsyncMutex<futures_util::stream::SplitSink<WsStream, Message>>>,
    pending: Arc<DashMap<RequestId, oneshot::Sender<InboundFrame>>>,
    next_id: AtomicU64,
    ephemeral_signer: PrivateKeySigner,
    notifications: broadcast::Sender<Notification>,
    channels_snapshot: watch::Receiver<Option<Value>>,
    reader: tokio::task::JoinHandle<()>,
}

impl ClearingClient {
    /// Connects and runs the four-step auth handshake (§4.C):
    /// `auth_request → auth_challenge → (identity-signed) auth_verify → auth_verify`.
    pub async fn connect(
        url: &Url,
        identity: &Identity,
        application_name: &str,
        allowances: Value,
        expires_at: u64,
        scope: &str,
    ) -> Result<Self, AgentPayError> {
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(AgentPayError::WebSocket)?;
        let (write, mut read) = ws.split();
        let pending: Arc<DashMap<RequestId, oneshot::Sender<InboundFrame>>> = Arc::new(DashMap::new());
        let (notif_tx, _) = broadcast::channel(64);
        let (channels_tx, channels_rx) = watch::channel(None);

        let pending_for_reader = pending.clone();
        let notif_for_reader = notif_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let Ok(msg) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(frame) = InboundFrame::parse(&text) else {
                    tracing::debug!(%text, "discarding unparseable clearing-network frame");
                    continue;
                };
                match &frame {
                    InboundFrame::Response { id, method, payload } => {
                        if let Some((_, sender)) = pending_for_reader.remove(id) {
                            let _ = sender.send(frame.clone());
                        } else {
                            let kind = NotificationKind::classify(method);
                            if kind != NotificationKind::Other {
                                if kind == NotificationKind::Channels {
                                    let _ = channels_tx.send(Some(payload.clone()));
                                }
                                let _ = notif_for_reader.send(Notification {
                                    kind,
                                    payload: payload.clone(),
                                });
                            } else {
                                tracing::debug!(method, "unknown clearing-network method, discarding");
                            }
                        }
                    }
                    InboundFrame::Error { id: Some(id), .. } => {
                        if let Some((_, sender)) = pending_for_reader.remove(id) {
                            let _ = sender.send(frame);
                        }
                    }
                    InboundFrame::Error { id: None, message } => {
                        tracing::warn!(message, "clearing-network sent an unsolicited error frame");
                    }
                }
            }
        });

        let client = Self {
            write: Arc::new(AsyncMutex::new(write)),
            pending,
            next_id: AtomicU64::new(1),
            ephemeral_signer: PrivateKeySigner::random(),
            notifications: notif_tx,
            channels_snapshot: channels_rx,
            reader,
        };

        client
            .authenticate(identity, application_name, allowances, expires_at, scope)
            .await?;
        Ok(client)
    }

    fn ephemeral_address(&self) -> Address {
        self.ephemeral_signer.address()
    }

    async fn authenticate(
        &self,
        identity: &Identity,
        application_name: &str,
        allowances: Value,
        expires_at: u64,
        scope: &str,
    ) -> Result<(), AgentPayError> {
        let request_payload = json!({
            "address": identity.address(),
            "application": application_name,
            "session_key": self.ephemeral_address(),
            "allowances": allowances,
            "expires_at": expires_at,
            "scope": scope,
        });
        let challenge_payload = self
            .call_as(&self.ephemeral_signer, "auth_request", request_payload, timeout_for("auth_request"))
            .await?;
        let challenge = challenge_payload
            .get("challenge")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentPayError::ClearingProtocol("auth_challenge missing challenge".into()))?;

        let domain = eip712_domain! {
            name: "agentpay-clearing",
            version: "1",
        };
        let typed = AuthChallenge {
            challenge: challenge.to_string(),
        };
        let digest = typed.eip712_signing_hash(&domain);
        let signature = identity.eip712_sign(digest).await?.as_bytes();

        let verify_payload = json!({ "signature": format!("0x{}", hex::encode(signature)) });
        let verify_response = self
            .call_as(&self.ephemeral_signer, "auth_verify", verify_payload, timeout_for("auth_verify"))
            .await
            .map_err(|e| match e {
                AgentPayError::ClearingTimeout(m) => AgentPayError::ClearingAuthRejected(m),
                other => other,
            })?;
        if verify_response
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true)
        {
            Ok(())
        } else {
            Err(AgentPayError::ClearingAuthRejected(
                verify_response.to_string(),
            ))
        }
    }

    /// Issues a signed call and awaits its response, per the authenticated
    /// framing rule: every outbound request after `auth_request` is signed
    /// with the ephemeral key.
    pub async fn call(&self, method: &str, payload: Value) -> Result<Value, AgentPayError> {
        self.call_with_timeout(method, payload, timeout_for(method)).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        payload: Value,
        call_timeout: Duration,
    ) -> Result<Value, AgentPayError> {
        let frame = self.call_as(&self.ephemeral_signer, method, payload, call_timeout).await?;
        Ok(frame)
    }

    async fn call_as(
        &self,
        signer: &PrivateKeySigner,
        method: &str,
        payload: Value,
        call_timeout: Duration,
    ) -> Result<Value, AgentPayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ts = crate::timestamp::UnixTimestamp::try_now()?.seconds_since_epoch() * 1000;
        let signing_bytes = OutboundFrame::signing_payload(id, method, &payload, ts);
        let signature = signer
            .sign_message(&signing_bytes)
            .await
            .map_err(|e| AgentPayError::ClearingProtocol(format!("failed to sign request: {e}")))?;
        let envelope = OutboundFrame::new(id, method, payload, ts, format!("0x{}", hex::encode(signature.as_bytes())));

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let text = serde_json::to_string(&envelope)?;
        {
            let mut write = self.write.lock().await;
            write
                .send(Message::Text(text.into()))
                .await
                .map_err(AgentPayError::WebSocket)?;
        }

        let response = timeout(call_timeout, rx).await.map_err(|_| {
            self.pending.remove(&id);
            AgentPayError::ClearingTimeout(format!("{method} timed out after {call_timeout:?}"))
        })?;
        let frame = response.map_err(|_| AgentPayError::Cancelled)?;
        match frame {
            InboundFrame::Response { payload, .. } => Ok(payload),
            InboundFrame::Error { ref message, .. } if message.to_lowercase().contains("quorum not reached") => {
                Err(AgentPayError::QuorumPending)
            }
            InboundFrame::Error { message, .. } => Err(AgentPayError::ClearingProtocol(message)),
        }
    }

    /// Subscribes to unsolicited `asu`/`bu`/`assets`/`channels` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Waits for the unsolicited post-auth `channels` snapshot push (§4.D).
    /// The server sends this once right after authentication completes, so a
    /// connection made before `connect` returns never misses it: the reader
    /// task records the latest push into a `watch` cell regardless of whether
    /// anyone is waiting yet. Returns `None` on timeout.
    pub async fn wait_for_channels_snapshot(&self, wait: Duration) -> Option<Value> {
        if let Some(existing) = self.channels_snapshot.borrow().clone() {
            return Some(existing);
        }
        let mut rx = self.channels_snapshot.clone();
        timeout(wait, async {
            loop {
                if rx.changed().await.is_err() {
                    return None;
                }
                if let Some(value) = rx.borrow().clone() {
                    return Some(value);
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Closes the underlying websocket with code 1000, per §4.C/§5: timeouts
    /// and cancellation both close cleanly rather than leaving the socket open.
    pub async fn close(self) -> Result<(), AgentPayError> {
        self.reader.abort();
        let mut write = self.write.lock().await;
        let _ = write
            .send(Message::Close(Some(CloseFrame {
                code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
                reason: "done".into(),
            })))
            .await;
        Ok(())
    }
}
