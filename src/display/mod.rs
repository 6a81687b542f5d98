//! Display surfaces: the page overlay and the popup panel.
//!
//! Each surface pulls the latest totals when it starts, then follows push
//! updates, and re-pulls on a fixed interval in case a push was missed. A
//! closed push channel is reopened; a lagged one triggers an immediate pull.

use crate::store::StoredTotals;
use crate::sync::UpdateSource;
use chrono::{DateTime, Local};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    /// Compact box injected over the livestream page.
    Overlay,
    /// Panel with the refresh button.
    Popup,
}

impl std::fmt::Display for SurfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SurfaceKind::Overlay => write!(f, "overlay"),
            SurfaceKind::Popup => write!(f, "popup"),
        }
    }
}

/// What a surface currently shows, already formatted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SurfaceView {
    pub total_sales: String,
    pub total_after_fees: String,
    pub sales_count: String,
    pub last_updated: String,
}

impl SurfaceView {
    pub fn initial(kind: SurfaceKind) -> Self {
        match kind {
            SurfaceKind::Overlay => Self {
                total_sales: "0".to_string(),
                total_after_fees: "0".to_string(),
                sales_count: "0".to_string(),
                last_updated: String::new(),
            },
            SurfaceKind::Popup => Self {
                total_sales: "0.00".to_string(),
                total_after_fees: "0.00".to_string(),
                sales_count: "0".to_string(),
                last_updated: "Not yet updated".to_string(),
            },
        }
    }

    /// Fold `data` in. Fields that are absent or unparseable keep their value.
    pub fn apply(&mut self, kind: SurfaceKind, data: &StoredTotals) {
        let after_fees_dp = match kind {
            SurfaceKind::Overlay => 0,
            SurfaceKind::Popup => 2,
        };

        if let Some(total) = data.total_sales_decimal() {
            self.total_sales = format_amount(total, 0);
        }
        if let Some(after_fees) = data.after_fees_decimal() {
            self.total_after_fees = format_amount(after_fees, after_fees_dp);
        }
        if let Some(count) = data.sales_count {
            self.sales_count = count.to_string();
        }
        if kind == SurfaceKind::Popup {
            if let Some(ts) = data
                .last_updated
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            {
                self.last_updated =
                    format!("Last updated: {}", ts.with_timezone(&Local).format("%H:%M:%S"));
            }
        }
    }

    /// Labelled rows in display order.
    pub fn rows(&self, kind: SurfaceKind) -> Vec<(&'static str, String)> {
        match kind {
            SurfaceKind::Overlay => vec![
                ("Total Sales", format!("${}", self.total_sales)),
                ("After Fees", format!("${}", self.total_after_fees)),
                ("Sales Count", format!("{} items", self.sales_count)),
            ],
            SurfaceKind::Popup => vec![
                ("Total Sales", format!("${}", self.total_sales)),
                ("Estimated Total After Fees", format!("${}", self.total_after_fees)),
                ("Items Sold", self.sales_count.clone()),
                ("", self.last_updated.clone()),
            ],
        }
    }
}

/// en-US style amount: thousands separators, `dp` decimals, half away from zero.
pub fn format_amount(value: Decimal, dp: u32) -> String {
    let rounded = value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let plain = format!("{:.*}", dp as usize, rounded.abs());
    let (int_part, frac_part) = match plain.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (plain.as_str(), None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3 + 4);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(&grouped);
    if let Some(frac) = frac_part {
        out.push('.');
        out.push_str(frac);
    }
    out
}

enum Wake {
    Push(Result<StoredTotals, RecvError>),
    Poll,
}

pub struct DisplaySurface {
    kind: SurfaceKind,
    poll_interval: Duration,
    view: watch::Sender<SurfaceView>,
}

impl DisplaySurface {
    pub fn new(kind: SurfaceKind, poll_interval: Duration) -> Self {
        let (view, _) = watch::channel(SurfaceView::initial(kind));
        Self {
            kind,
            poll_interval,
            view,
        }
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    pub fn view(&self) -> SurfaceView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SurfaceView> {
        self.view.subscribe()
    }

    pub fn apply(&self, data: &StoredTotals) {
        let kind = self.kind;
        self.view.send_modify(|v| v.apply(kind, data));
    }

    async fn pull<S: UpdateSource>(&self, source: &S) {
        if let Some(latest) = source.latest().await {
            self.apply(&latest);
        }
    }

    /// Follow `source` until the task is aborted.
    pub async fn run<S: UpdateSource>(self: Arc<Self>, source: Arc<S>) {
        let mut rx = source.connect();
        self.pull(source.as_ref()).await;

        let mut poll = tokio::time::interval(self.poll_interval);
        // The first tick is immediate and we just pulled.
        poll.tick().await;

        info!(surface = %self.kind, "display surface attached");

        loop {
            let wake = tokio::select! {
                msg = rx.recv() => Wake::Push(msg),
                _ = poll.tick() => Wake::Poll,
            };

            match wake {
                Wake::Push(Ok(data)) => self.apply(&data),
                Wake::Push(Err(RecvError::Lagged(missed))) => {
                    debug!(surface = %self.kind, missed = missed, "push channel lagged, pulling");
                    self.pull(source.as_ref()).await;
                }
                Wake::Push(Err(RecvError::Closed)) => {
                    info!(surface = %self.kind, "push channel closed, reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    rx = source.connect();
                    self.pull(source.as_ref()).await;
                }
                Wake::Poll => self.pull(source.as_ref()).await,
            }
        }
    }

    pub fn spawn<S: UpdateSource>(self: &Arc<Self>, source: Arc<S>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::broadcast;

    /// Test source whose push channel can be swapped out, like a dropped port.
    struct FakeSource {
        tx: StdMutex<broadcast::Sender<StoredTotals>>,
        latest: StdMutex<Option<StoredTotals>>,
    }

    impl FakeSource {
        fn new() -> Self {
            let (tx, _) = broadcast::channel(8);
            Self {
                tx: StdMutex::new(tx),
                latest: StdMutex::new(None),
            }
        }

        fn push(&self, data: StoredTotals) {
            let _ = self.tx.lock().unwrap().send(data);
        }

        fn set_latest(&self, data: StoredTotals) {
            *self.latest.lock().unwrap() = Some(data);
        }

        /// Drop the current sender so every receiver sees `Closed`.
        fn drop_connection(&self) {
            let (tx, _) = broadcast::channel(8);
            *self.tx.lock().unwrap() = tx;
        }
    }

    impl UpdateSource for FakeSource {
        fn connect(&self) -> broadcast::Receiver<StoredTotals> {
            self.tx.lock().unwrap().subscribe()
        }

        fn latest(&self) -> impl Future<Output = Option<StoredTotals>> + Send {
            let latest = self.latest.lock().unwrap().clone();
            async move { latest }
        }
    }

    /// Let the surface task run until it holds a push receiver.
    async fn wait_connected(source: &FakeSource) {
        while source.tx.lock().unwrap().receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
    }

    fn totals(total: &str, count: u64) -> StoredTotals {
        StoredTotals {
            total_sales: Some(total.to_string()),
            estimated_total_after_fees: Some(total.to_string()),
            last_updated: None,
            sales_count: Some(count),
        }
    }

    async fn wait_for(rx: &mut watch::Receiver<SurfaceView>, total: &str) {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if rx.borrow_and_update().total_sales == total {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(Decimal::new(123456789, 2), 0), "1,234,568");
        assert_eq!(format_amount(Decimal::new(123456789, 2), 2), "1,234,567.89");
        assert_eq!(format_amount(Decimal::new(5, 1), 0), "1");
        assert_eq!(format_amount(Decimal::new(999, 0), 2), "999.00");
        assert_eq!(format_amount(Decimal::ZERO, 0), "0");
        assert_eq!(format_amount(Decimal::new(-12345, 1), 0), "-1,235");
    }

    #[test]
    fn test_overlay_and_popup_formatting() {
        let data = StoredTotals {
            total_sales: Some("1234.5".to_string()),
            estimated_total_after_fees: Some("1139.27".to_string()),
            last_updated: Some("2024-05-01T12:00:00+00:00".to_string()),
            sales_count: Some(42),
        };

        let mut overlay = SurfaceView::initial(SurfaceKind::Overlay);
        overlay.apply(SurfaceKind::Overlay, &data);
        assert_eq!(overlay.total_sales, "1,235");
        assert_eq!(overlay.total_after_fees, "1,139");
        assert_eq!(overlay.rows(SurfaceKind::Overlay)[2].1, "42 items");
        assert_eq!(overlay.last_updated, "");

        let mut popup = SurfaceView::initial(SurfaceKind::Popup);
        assert_eq!(popup.last_updated, "Not yet updated");
        popup.apply(SurfaceKind::Popup, &data);
        assert_eq!(popup.total_sales, "1,235");
        assert_eq!(popup.total_after_fees, "1,139.27");
        assert!(popup.last_updated.starts_with("Last updated: "));
    }

    #[test]
    fn test_partial_update_keeps_fields() {
        let mut view = SurfaceView::initial(SurfaceKind::Overlay);
        view.apply(SurfaceKind::Overlay, &totals("10", 1));
        view.apply(
            SurfaceKind::Overlay,
            &StoredTotals {
                sales_count: Some(2),
                ..Default::default()
            },
        );
        assert_eq!(view.total_sales, "10");
        assert_eq!(view.sales_count, "2");
    }

    #[tokio::test]
    async fn test_surface_pulls_then_follows_pushes() {
        let source = Arc::new(FakeSource::new());
        source.set_latest(totals("5", 1));

        let surface = Arc::new(DisplaySurface::new(SurfaceKind::Overlay, Duration::from_secs(10)));
        let mut rx = surface.watch();
        let task = surface.spawn(source.clone());

        wait_for(&mut rx, "5").await;
        wait_connected(&source).await;
        source.push(totals("7", 2));
        wait_for(&mut rx, "7").await;
        assert_eq!(surface.view().sales_count, "2");

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_surface_falls_back_to_polling() {
        let source = Arc::new(FakeSource::new());
        let surface = Arc::new(DisplaySurface::new(SurfaceKind::Popup, Duration::from_secs(10)));
        let mut rx = surface.watch();
        let task = surface.spawn(source.clone());
        wait_connected(&source).await;

        // Persisted without a push reaching the surface.
        source.set_latest(totals("11", 3));
        wait_for(&mut rx, "11").await;

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_surface_reconnects_after_close() {
        let source = Arc::new(FakeSource::new());
        let surface = Arc::new(DisplaySurface::new(SurfaceKind::Overlay, Duration::from_secs(3600)));
        let mut rx = surface.watch();
        let task = surface.spawn(source.clone());
        wait_connected(&source).await;

        source.drop_connection();
        source.set_latest(totals("3", 1));
        // Reconnect pulls immediately, long before the hourly poll.
        wait_for(&mut rx, "3").await;

        // Pushes on the new channel are received.
        wait_connected(&source).await;
        source.push(totals("4", 2));
        wait_for(&mut rx, "4").await;

        task.abort();
    }
}
