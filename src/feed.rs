//! Feed Abstraction (§4.J, §2 component J): a pluggable source of timeline
//! items the Autonomous Loop polls for offers and accepts. Named but not
//! detailed in the protocol body — two implementations are provided: an
//! in-process demo feed served over HTTP so multiple processes can share one
//! timeline, and an HTTP client against an external feed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use url::Url;

use crate::error::AgentPayError;

/// One timeline item: an offer or accept post, or anything else the parsers
/// in [`crate::autonomous`] don't recognize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub text: String,
}

#[async_trait]
pub trait FeedProvider: Send + Sync {
    async fn poll(&self) -> Result<Vec<FeedItem>, AgentPayError>;
}

/// Polls an external feed endpoint (`AGENTPAY_DEMO_FEED_URL`) by `GET`ting a
/// JSON array of [`FeedItem`]s.
pub struct HttpFeedProvider {
    http: reqwest::Client,
    url: Url,
}

impl HttpFeedProvider {
    pub fn new(url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl FeedProvider for HttpFeedProvider {
    async fn poll(&self) -> Result<Vec<FeedItem>, AgentPayError> {
        let items = self
            .http
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<FeedItem>>()
            .await?;
        Ok(items)
    }
}

/// An in-process, mutex-guarded timeline. Backs the `demo-feed` CLI command's
/// axum router so several local processes (autonomous-client and
/// autonomous-worker) can post to and poll a shared feed without any external
/// service.
#[derive(Default)]
pub struct DemoFeedStore {
    items: AsyncMutex<Vec<FeedItem>>,
    next_id: AtomicU64,
}

impl DemoFeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn post(&self, text: String, thread_id: Option<String>) -> FeedItem {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let item = FeedItem {
            id,
            thread_id,
            text,
        };
        self.items.lock().await.push(item.clone());
        item
    }

    pub async fn all(&self) -> Vec<FeedItem> {
        self.items.lock().await.clone()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostItemRequest {
    text: String,
    #[serde(default)]
    thread_id: Option<String>,
}

async fn get_items(State(store): State<Arc<DemoFeedStore>>) -> Json<Vec<FeedItem>> {
    Json(store.all().await)
}

async fn post_item(State(store): State<Arc<DemoFeedStore>>, Json(body): Json<PostItemRequest>) -> Json<FeedItem> {
    Json(store.post(body.text, body.thread_id).await)
}

/// Axum router for the `demo-feed` CLI command: `GET /items` lists the
/// timeline, `POST /items` appends to it.
pub fn demo_feed_routes(store: Arc<DemoFeedStore>) -> Router {
    Router::new()
        .route("/items", get(get_items).post(post_item))
        .with_state(store)
}

/// Polls the `demo-feed` command's own HTTP surface — a thin specialization
/// of [`HttpFeedProvider`] pointed at `/items`, and the counterpart used to
/// publish an offer/accept post into that same feed.
pub struct DemoFeedClient {
    http: reqwest::Client,
    base_url: Url,
}

impl DemoFeedClient {
    pub fn new(base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn items_url(&self) -> Url {
        self.base_url.join("items").unwrap_or_else(|_| self.base_url.clone())
    }

    pub async fn publish(&self, text: impl Into<String>) -> Result<FeedItem, AgentPayError> {
        let item = self
            .http
            .post(self.items_url())
            .json(&PostItemRequest {
                text: text.into(),
                thread_id: None,
            })
            .send()
            .await?
            .error_for_status()?
            .json::<FeedItem>()
            .await?;
        Ok(item)
    }
}

#[async_trait]
impl FeedProvider for DemoFeedClient {
    async fn poll(&self) -> Result<Vec<FeedItem>, AgentPayError> {
        let items = self
            .http
            .get(self.items_url())
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<FeedItem>>()
            .await?;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_feed_store_assigns_increasing_ids() {
        let store = DemoFeedStore::new();
        let a = store.post("first".to_string(), None).await;
        let b = store.post("second".to_string(), None).await;
        assert_ne!(a.id, b.id);
        assert_eq!(store.all().await.len(), 2);
    }
}
