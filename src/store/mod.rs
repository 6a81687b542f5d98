//! Persisted totals store.
//!
//! Data model (one flat key per field, merged on write):
//!   totalSales               → full-precision Decimal string
//!   estimatedTotalAfterFees  → Decimal string, 2dp
//!   lastUpdated              → RFC 3339 timestamp
//!   salesCount               → integer
//!
//! Two backends: an in-process map, and Valkey (Redis-compatible) where keys
//! are namespaced as "{prefix}:{key}". Reads may come back partial or empty
//! if nothing was ever written.

use crate::aggregate::AggregateResult;
use crate::config::{StoreBackend, StoreConfig};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const KEY_TOTAL_SALES: &str = "totalSales";
pub const KEY_AFTER_FEES: &str = "estimatedTotalAfterFees";
pub const KEY_LAST_UPDATED: &str = "lastUpdated";
pub const KEY_SALES_COUNT: &str = "salesCount";

const ALL_KEYS: [&str; 4] = [
    KEY_TOTAL_SALES,
    KEY_AFTER_FEES,
    KEY_LAST_UPDATED,
    KEY_SALES_COUNT,
];

/// Persisted (and wire-visible) form of an aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTotals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_sales: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_total_after_fees: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sales_count: Option<u64>,
}

impl From<&AggregateResult> for StoredTotals {
    fn from(agg: &AggregateResult) -> Self {
        Self {
            total_sales: Some(agg.total_sales.normalize().to_string()),
            estimated_total_after_fees: Some(
                agg.total_after_fees
                    .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
                    .to_string(),
            ),
            last_updated: Some(agg.last_updated.to_rfc3339()),
            sales_count: Some(agg.sales_count as u64),
        }
    }
}

impl StoredTotals {
    pub fn is_empty(&self) -> bool {
        self.total_sales.is_none()
            && self.estimated_total_after_fees.is_none()
            && self.last_updated.is_none()
            && self.sales_count.is_none()
    }

    pub fn total_sales_decimal(&self) -> Option<Decimal> {
        self.total_sales.as_deref().and_then(|s| Decimal::from_str(s).ok())
    }

    pub fn after_fees_decimal(&self) -> Option<Decimal> {
        self.estimated_total_after_fees
            .as_deref()
            .and_then(|s| Decimal::from_str(s).ok())
    }

    fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(ALL_KEYS.len());
        if let Some(ref v) = self.total_sales {
            pairs.push((KEY_TOTAL_SALES, v.clone()));
        }
        if let Some(ref v) = self.estimated_total_after_fees {
            pairs.push((KEY_AFTER_FEES, v.clone()));
        }
        if let Some(ref v) = self.last_updated {
            pairs.push((KEY_LAST_UPDATED, v.clone()));
        }
        if let Some(v) = self.sales_count {
            pairs.push((KEY_SALES_COUNT, v.to_string()));
        }
        pairs
    }

    fn from_lookup(mut get: impl FnMut(&str) -> Option<String>) -> Self {
        Self {
            total_sales: get(KEY_TOTAL_SALES),
            estimated_total_after_fees: get(KEY_AFTER_FEES),
            last_updated: get(KEY_LAST_UPDATED),
            sales_count: get(KEY_SALES_COUNT).and_then(|s| s.parse().ok()),
        }
    }
}

/// In-process map backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    values: Arc<RwLock<HashMap<String, String>>>,
    writes: Arc<AtomicU64>,
    reject_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls served so far.
    #[cfg(test)]
    pub(crate) fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make every following `set` fail until switched back.
    #[cfg(test)]
    pub(crate) fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::Relaxed);
    }

    async fn get(&self) -> StoredTotals {
        let values = self.values.read().await;
        StoredTotals::from_lookup(|k| values.get(k).cloned())
    }

    async fn set(&self, totals: &StoredTotals) -> anyhow::Result<()> {
        if self.reject_writes.load(Ordering::Relaxed) {
            anyhow::bail!("memory store is rejecting writes");
        }
        let mut values = self.values.write().await;
        for (k, v) in totals.to_pairs() {
            values.insert(k.to_string(), v);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Valkey-backed store.
#[derive(Clone)]
pub struct ValkeyStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl ValkeyStore {
    /// Connect to Valkey/Redis.
    pub async fn connect(url: &str, prefix: &str) -> anyhow::Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = url, prefix = prefix, "connected to Valkey");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    /// Build a namespaced key: "{prefix}:{suffix}"
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    /// Test connectivity.
    pub async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(response = %pong, "Valkey ping");
        Ok(())
    }

    async fn get(&self) -> anyhow::Result<StoredTotals> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = ALL_KEYS.iter().map(|k| self.key(k)).collect();
        let values: Vec<Option<String>> = conn.mget(&keys).await?;
        let found: HashMap<&str, String> = ALL_KEYS
            .iter()
            .copied()
            .zip(values)
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect();
        Ok(StoredTotals::from_lookup(|k| found.get(k).cloned()))
    }

    async fn set(&self, totals: &StoredTotals) -> anyhow::Result<()> {
        let pairs: Vec<(String, String)> = totals
            .to_pairs()
            .into_iter()
            .map(|(k, v)| (self.key(k), v))
            .collect();
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.mset::<_, _, ()>(pairs.as_slice()).await?;
        Ok(())
    }
}

/// Key-value store for the latest totals.
#[derive(Clone)]
pub enum SalesStore {
    Memory(MemoryStore),
    Valkey(ValkeyStore),
}

impl SalesStore {
    /// Open the configured backend.
    pub async fn open(cfg: &StoreConfig) -> anyhow::Result<Self> {
        match cfg.backend {
            StoreBackend::Memory => Ok(SalesStore::Memory(MemoryStore::new())),
            StoreBackend::Valkey => {
                let store = ValkeyStore::connect(&cfg.url, &cfg.prefix).await?;
                store.ping().await?;
                Ok(SalesStore::Valkey(store))
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            SalesStore::Memory(_) => "memory",
            SalesStore::Valkey(_) => "valkey",
        }
    }

    /// Read every known key. Missing keys come back as `None`.
    pub async fn get(&self) -> anyhow::Result<StoredTotals> {
        match self {
            SalesStore::Memory(m) => Ok(m.get().await),
            SalesStore::Valkey(v) => v.get().await,
        }
    }

    /// Merge the present fields of `totals` into the store.
    pub async fn set(&self, totals: &StoredTotals) -> anyhow::Result<()> {
        match self {
            SalesStore::Memory(m) => m.set(totals).await?,
            SalesStore::Valkey(v) => v.set(totals).await?,
        }
        debug!(backend = self.backend_name(), total = ?totals.total_sales, "stored totals");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_empty_store_reads_empty() {
        let store = SalesStore::Memory(MemoryStore::new());
        let got = store.get().await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_partial_write_merges() {
        let mem = MemoryStore::new();
        let store = SalesStore::Memory(mem.clone());
        store
            .set(&StoredTotals {
                total_sales: Some("12.5".to_string()),
                sales_count: Some(3),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .set(&StoredTotals {
                sales_count: Some(4),
                ..Default::default()
            })
            .await
            .unwrap();

        let got = store.get().await.unwrap();
        assert_eq!(got.total_sales.as_deref(), Some("12.5"));
        assert_eq!(got.sales_count, Some(4));
        assert_eq!(got.last_updated, None);
        assert_eq!(mem.write_count(), 2);
    }

    #[test]
    fn test_from_aggregate_keeps_full_precision_total() {
        let agg = AggregateResult {
            total_sales: dec!(11.00),
            total_after_fees: dec!(10.401),
            sales_count: 2,
            last_updated: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };
        let stored = StoredTotals::from(&agg);
        assert_eq!(stored.total_sales.as_deref(), Some("11"));
        assert_eq!(stored.estimated_total_after_fees.as_deref(), Some("10.40"));
        assert_eq!(stored.last_updated.as_deref(), Some("2024-05-01T12:00:00+00:00"));
        assert_eq!(stored.sales_count, Some(2));
        assert_eq!(stored.total_sales_decimal(), Some(dec!(11)));
    }

    #[test]
    fn test_after_fees_rounds_half_away_from_zero() {
        // One $15 sale nets exactly 13.665.
        let agg = AggregateResult {
            total_sales: dec!(15.00),
            total_after_fees: dec!(13.665),
            sales_count: 1,
            last_updated: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };
        let stored = StoredTotals::from(&agg);
        assert_eq!(stored.estimated_total_after_fees.as_deref(), Some("13.67"));
    }

    #[tokio::test]
    async fn test_rejected_write_leaves_store_untouched() {
        let mem = MemoryStore::new();
        let store = SalesStore::Memory(mem.clone());
        mem.reject_writes(true);
        let totals = StoredTotals {
            total_sales: Some("1".to_string()),
            ..Default::default()
        };
        assert!(store.set(&totals).await.is_err());
        assert!(store.get().await.unwrap().is_empty());
        assert_eq!(mem.write_count(), 0);

        mem.reject_writes(false);
        store.set(&totals).await.unwrap();
        assert_eq!(mem.write_count(), 1);
    }

    #[test]
    fn test_wire_shape_uses_storage_keys() {
        let stored = StoredTotals {
            total_sales: Some("5".to_string()),
            sales_count: Some(1),
            ..Default::default()
        };
        let v = serde_json::to_value(&stored).unwrap();
        assert_eq!(v, serde_json::json!({"totalSales": "5", "salesCount": 1}));
    }
}
