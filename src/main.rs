use sales_tracker::aggregate::FeeSchedule;
use sales_tracker::config::Config;
use sales_tracker::dashboard::{self, DashboardState};
use sales_tracker::display::{DisplaySurface, SurfaceKind};
use sales_tracker::resolver::ActiveResolver;
use sales_tracker::shop::ShopClient;
use sales_tracker::store::{MemoryStore, SalesStore};
use sales_tracker::sync::{DisplaySync, UpdateBus};
use sales_tracker::tracker::{Tracker, TrackerContext, TrackerSettings};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

const CONFIG_PATH: &str = "sales-tracker.toml";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let config = if Path::new(CONFIG_PATH).exists() {
        Config::load(Path::new(CONFIG_PATH))?
    } else {
        Config::from_env()?
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("sales-tracker v{} starting", env!("CARGO_PKG_VERSION"));

    // --- Store ---
    let store = match SalesStore::open(&config.store).await {
        Ok(s) => {
            info!(backend = s.backend_name(), "totals store ready");
            s
        }
        Err(e) => {
            warn!(
                error = %e,
                url = %config.store.url,
                "failed to open configured store, falling back to in-memory totals"
            );
            SalesStore::Memory(MemoryStore::new())
        }
    };

    // --- Resolver ---
    let resolver = ActiveResolver::from_config(&config.resolver)?;
    info!(strategy = resolver.as_resolver().name(), "livestream resolver selected");

    // --- Tracker ---
    let bus = UpdateBus::default();
    let tracker = Arc::new(Tracker::new(
        ShopClient::new(&config.shop),
        resolver.as_resolver(),
        Arc::new(TrackerContext::new()),
        store.clone(),
        bus.clone(),
        TrackerSettings {
            check_interval: config.tracker.check_interval(),
            persist_policy: config.tracker.persist_policy,
            fees: FeeSchedule::from(&config.fees),
        },
    ));
    info!(
        endpoint = %config.shop.endpoint,
        page_size = config.shop.page_size,
        page_delay_ms = config.shop.page_delay_ms,
        interval_secs = config.tracker.check_interval_secs,
        policy = ?config.tracker.persist_policy,
        "sales tracker configured"
    );

    tokio::spawn(tracker.clone().watch_livestreams());

    // --- Display surfaces ---
    let sync = Arc::new(DisplaySync::new(tracker.clone(), store, bus));
    let poll_interval = config.display.poll_interval();
    let overlay = Arc::new(DisplaySurface::new(SurfaceKind::Overlay, poll_interval));
    let popup = Arc::new(DisplaySurface::new(SurfaceKind::Popup, poll_interval));
    overlay.spawn(sync.clone());
    popup.spawn(sync.clone());

    sync.on_update(|data| {
        info!(
            total = ?data.total_sales,
            after_fees = ?data.estimated_total_after_fees,
            count = ?data.sales_count,
            "sales updated"
        );
    });

    // --- Dashboard ---
    if config.dashboard.enabled {
        let dash_state = DashboardState {
            sync: sync.clone(),
            tracker: tracker.clone(),
            resolver: resolver.clone(),
            overlay: overlay.clone(),
            popup: popup.clone(),
        };
        let bind = config.dashboard.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = dashboard::serve(dash_state, &bind).await {
                error!(error = %e, "dashboard server failed");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    tracker.stop_tracking().await;

    Ok(())
}
