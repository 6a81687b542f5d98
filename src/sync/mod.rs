//! Display sync.
//!
//! Fans the latest persisted totals out to display surfaces:
//!   - push: `SALES_UPDATED` on a broadcast channel, fire-and-forget
//!   - pull: `GET_TOTAL` reads the store
//!   - `FORCE_UPDATE` runs a tracker check out of band and answers with the
//!     freshly persisted value

use crate::store::{SalesStore, StoredTotals};
use crate::tracker::Tracker;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default push channel depth. Slow surfaces past this lag and re-pull.
pub const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Messages exchanged between the tracker and display surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    GetTotal,
    ForceUpdate,
    SalesUpdated { data: StoredTotals },
}

/// Broadcast side of the push channel.
#[derive(Clone)]
pub struct UpdateBus {
    tx: broadcast::Sender<StoredTotals>,
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new(UPDATE_CHANNEL_CAPACITY)
    }
}

impl UpdateBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send `SALES_UPDATED`. Having no listener is normal and not reported.
    pub fn publish(&self, data: StoredTotals) {
        match self.tx.send(data) {
            Ok(receivers) => debug!(receivers = receivers, "broadcast sales update"),
            Err(_) => debug!("no display surface listening"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoredTotals> {
        self.tx.subscribe()
    }
}

/// Where a display surface gets its data from.
pub trait UpdateSource: Send + Sync + 'static {
    /// Open (or reopen) the push channel.
    fn connect(&self) -> broadcast::Receiver<StoredTotals>;
    /// Pull the latest persisted totals.
    fn latest(&self) -> impl Future<Output = Option<StoredTotals>> + Send;
}

pub struct DisplaySync {
    tracker: Arc<Tracker>,
    store: SalesStore,
    bus: UpdateBus,
}

impl DisplaySync {
    pub fn new(tracker: Arc<Tracker>, store: SalesStore, bus: UpdateBus) -> Self {
        Self {
            tracker,
            store,
            bus,
        }
    }

    /// Latest persisted totals, or `None` if nothing was ever written.
    pub async fn get_latest(&self) -> Option<StoredTotals> {
        match self.store.get().await {
            Ok(totals) if totals.is_empty() => None,
            Ok(totals) => Some(totals),
            Err(e) => {
                warn!(error = %e, backend = self.store.backend_name(), "failed to read totals");
                None
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoredTotals> {
        self.bus.subscribe()
    }

    /// Run `callback` for every pushed update until the channel closes.
    pub fn on_update<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(StoredTotals) + Send + 'static,
    {
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(data) => callback(data),
                    Err(RecvError::Lagged(missed)) => {
                        debug!(missed = missed, "update listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Run a check now and return what it left in the store.
    pub async fn force_refresh(&self) -> Option<StoredTotals> {
        let outcome = self.tracker.check_sales().await;
        debug!(outcome = ?outcome, "forced refresh finished");
        self.get_latest().await
    }

    /// Answer a request message. Broadcast messages get no reply.
    pub async fn handle(&self, message: Message) -> Option<StoredTotals> {
        match message {
            Message::GetTotal => Some(self.get_latest().await.unwrap_or_default()),
            Message::ForceUpdate => Some(self.force_refresh().await.unwrap_or_default()),
            Message::SalesUpdated { .. } => {
                debug!("ignoring inbound SALES_UPDATED");
                None
            }
        }
    }
}

impl UpdateSource for DisplaySync {
    fn connect(&self) -> broadcast::Receiver<StoredTotals> {
        self.subscribe()
    }

    fn latest(&self) -> impl Future<Output = Option<StoredTotals>> + Send {
        self.get_latest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let get: Message = serde_json::from_str(r#"{"type":"GET_TOTAL"}"#).unwrap();
        assert_eq!(get, Message::GetTotal);
        let force: Message = serde_json::from_str(r#"{"type":"FORCE_UPDATE"}"#).unwrap();
        assert_eq!(force, Message::ForceUpdate);

        let update = Message::SalesUpdated {
            data: StoredTotals {
                total_sales: Some("42".to_string()),
                sales_count: Some(3),
                ..Default::default()
            },
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            serde_json::json!({"type": "SALES_UPDATED", "data": {"totalSales": "42", "salesCount": 3}})
        );
    }

    #[test]
    fn test_publish_without_listeners_is_silent() {
        let bus = UpdateBus::default();
        bus.publish(StoredTotals::default());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = UpdateBus::new(4);
        let mut rx = bus.subscribe();
        let data = StoredTotals {
            total_sales: Some("1".to_string()),
            ..Default::default()
        };
        bus.publish(data.clone());
        assert_eq!(rx.recv().await.unwrap(), data);
    }
}
