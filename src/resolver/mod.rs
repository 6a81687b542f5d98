//! Livestream id discovery.
//!
//! Two interchangeable strategies behind [`LivestreamResolver`]:
//!   - [`RequestObserver`]: passively fed outbound requests; picks the id out
//!     of `LivestreamShop` POST payloads whose tab is `SOLD`.
//!   - [`TabUrlResolver`]: fed the active tab URL; takes the trailing path
//!     segment of a live-broadcast page.
//!
//! Both publish the current id on a watch channel. Re-publishing the same id
//! does not wake subscribers, so a subscriber only sees real changes.

use crate::config::{ResolverConfig, ResolverStrategy};
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

const SHOP_OPERATION_MARKER: &str = "graphql/?operationName=LivestreamShop";
const SOLD_TAB: &str = "SOLD";

/// Source of the currently active livestream id.
pub trait LivestreamResolver: Send + Sync {
    /// Current id, if any livestream is active.
    fn resolve(&self) -> Option<String>;
    /// Change feed of the current id.
    fn subscribe(&self) -> watch::Receiver<Option<String>>;
    fn name(&self) -> &'static str;
}

/// Store `next` if it differs from the current value. Returns true on change.
fn publish(tx: &watch::Sender<Option<String>>, next: Option<String>) -> bool {
    tx.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    })
}

// ─── Passive request sniffing ───────────────────────────────────────────────

/// An outbound request seen by the host browser.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservedRequest {
    pub url: String,
    pub method: String,
    /// Raw request body, possibly percent-encoded.
    #[serde(default)]
    pub body: String,
}

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("body is not valid percent-encoded utf-8: {0}")]
    Decode(#[from] std::string::FromUtf8Error),
    #[error("body is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sold-tab payload has no livestreamId")]
    MissingLivestreamId,
}

#[derive(Debug, Deserialize)]
struct ShopRequestBody {
    #[serde(default)]
    variables: Option<ShopVariables>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShopVariables {
    #[serde(default)]
    tab: Option<String>,
    #[serde(default)]
    livestream_id: Option<String>,
}

/// Extract the livestream id from a `LivestreamShop` request body.
/// `Ok(None)` means the payload is well-formed but not a sold-tab query.
pub fn parse_sold_livestream_id(body: &str) -> Result<Option<String>, PayloadError> {
    let decoded = urlencoding::decode(body)?;
    let parsed: ShopRequestBody = serde_json::from_str(&decoded)?;
    let Some(vars) = parsed.variables else {
        return Ok(None);
    };
    if vars.tab.as_deref() != Some(SOLD_TAB) {
        return Ok(None);
    }
    match vars.livestream_id {
        Some(id) if !id.is_empty() => Ok(Some(id)),
        _ => Err(PayloadError::MissingLivestreamId),
    }
}

pub struct RequestObserver {
    tx: watch::Sender<Option<String>>,
}

impl Default for RequestObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestObserver {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Feed one observed request. Returns the id if it is a newly detected
    /// livestream. Non-matching requests and malformed payloads change nothing.
    pub fn observe(&self, req: &ObservedRequest) -> Option<String> {
        if !req.method.eq_ignore_ascii_case("POST") || !req.url.contains(SHOP_OPERATION_MARKER) {
            return None;
        }

        match parse_sold_livestream_id(&req.body) {
            Ok(Some(id)) => {
                if publish(&self.tx, Some(id.clone())) {
                    info!(livestream_id = %id, "new livestream detected from shop request");
                    Some(id)
                } else {
                    None
                }
            }
            Ok(None) => {
                debug!("shop request for another tab, ignoring");
                None
            }
            Err(e) => {
                warn!(error = %e, url = %req.url, "could not parse observed shop request");
                None
            }
        }
    }
}

impl LivestreamResolver for RequestObserver {
    fn resolve(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }

    fn name(&self) -> &'static str {
        "request"
    }
}

// ─── Active tab inspection ──────────────────────────────────────────────────

pub struct TabUrlResolver {
    pattern: Regex,
    tx: watch::Sender<Option<String>>,
}

impl TabUrlResolver {
    /// `pattern` is matched against the URL path; capture group 1 is the id.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(pattern)?;
        let (tx, _) = watch::channel(None);
        Ok(Self { pattern, tx })
    }

    /// Livestream id encoded in `url`, if it is a live-broadcast page.
    pub fn extract(&self, url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        let caps = self.pattern.captures(parsed.path())?;
        caps.get(1)
            .map(|m| m.as_str().to_string())
            .filter(|id| !id.is_empty())
    }

    /// The active tab changed. A non-live page clears the current id.
    pub fn set_active_tab(&self, url: &str) -> Option<String> {
        let id = self.extract(url);
        if publish(&self.tx, id.clone()) {
            match id {
                Some(ref id) => info!(livestream_id = %id, "new livestream detected from active tab"),
                None => info!(url = url, "active tab is not a livestream"),
            }
        }
        id
    }
}

impl LivestreamResolver for TabUrlResolver {
    fn resolve(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }

    fn name(&self) -> &'static str {
        "tab"
    }
}

// ─── Selection ──────────────────────────────────────────────────────────────

/// The resolver picked for this environment, keeping its concrete input side.
#[derive(Clone)]
pub enum ActiveResolver {
    Request(Arc<RequestObserver>),
    Tab(Arc<TabUrlResolver>),
}

impl ActiveResolver {
    pub fn from_config(cfg: &ResolverConfig) -> Result<Self, regex::Error> {
        Ok(match cfg.strategy {
            ResolverStrategy::Request => ActiveResolver::Request(Arc::new(RequestObserver::new())),
            ResolverStrategy::Tab => {
                ActiveResolver::Tab(Arc::new(TabUrlResolver::new(&cfg.live_path_pattern)?))
            }
        })
    }

    pub fn as_resolver(&self) -> Arc<dyn LivestreamResolver> {
        match self {
            ActiveResolver::Request(r) => r.clone() as Arc<dyn LivestreamResolver>,
            ActiveResolver::Tab(r) => r.clone() as Arc<dyn LivestreamResolver>,
        }
    }
}
