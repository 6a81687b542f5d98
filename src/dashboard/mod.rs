//! Axum front end for the tracker.
//!
//! Provides:
//!   GET  /                      → index linking the surfaces
//!   GET  /overlay               → overlay surface (auto-refresh 10s)
//!   GET  /popup                 → popup surface with a Refresh button
//!   POST /popup/refresh         → FORCE_UPDATE, then back to /popup
//!   GET  /api/total             → GET_TOTAL
//!   POST /api/refresh           → FORCE_UPDATE
//!   POST /api/message           → any JSON `Message`
//!   POST /api/observed-request  → feed the request-sniffing resolver
//!   POST /api/active-tab        → feed the active-tab resolver
//!   GET  /api/livestream        → current tracker state

use crate::display::DisplaySurface;
use crate::resolver::{ActiveResolver, ObservedRequest};
use crate::sync::{DisplaySync, Message};
use crate::tracker::Tracker;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json, Redirect};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Shared state for the dashboard routes.
#[derive(Clone)]
pub struct DashboardState {
    pub sync: Arc<DisplaySync>,
    pub tracker: Arc<Tracker>,
    pub resolver: ActiveResolver,
    pub overlay: Arc<DisplaySurface>,
    pub popup: Arc<DisplaySurface>,
}

/// Build the Axum router.
pub fn build_router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(index_html))
        .route("/overlay", get(overlay_html))
        .route("/popup", get(popup_html))
        .route("/popup/refresh", post(popup_refresh))
        .route("/api/total", get(api_total))
        .route("/api/refresh", post(api_refresh))
        .route("/api/message", post(api_message))
        .route("/api/observed-request", post(api_observed_request))
        .route("/api/active-tab", post(api_active_tab))
        .route("/api/livestream", get(api_livestream))
        .with_state(state)
}

/// Start the dashboard server.
pub async fn serve(state: DashboardState, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "dashboard listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// --- API Handlers ---

async fn api_total(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.sync.handle(Message::GetTotal).await.unwrap_or_default())
}

async fn api_refresh(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.sync.handle(Message::ForceUpdate).await.unwrap_or_default())
}

async fn api_message(
    State(state): State<DashboardState>,
    Json(message): Json<Message>,
) -> impl IntoResponse {
    match state.sync.handle(message).await {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn api_observed_request(
    State(state): State<DashboardState>,
    Json(req): Json<ObservedRequest>,
) -> impl IntoResponse {
    match state.resolver {
        ActiveResolver::Request(ref observer) => {
            let detected = observer.observe(&req);
            Json(serde_json::json!({ "detected": detected })).into_response()
        }
        ActiveResolver::Tab(_) => {
            debug!("observed request ignored, tab resolver active");
            StatusCode::ACCEPTED.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ActiveTab {
    url: String,
}

async fn api_active_tab(
    State(state): State<DashboardState>,
    Json(tab): Json<ActiveTab>,
) -> impl IntoResponse {
    match state.resolver {
        ActiveResolver::Tab(ref resolver) => {
            let livestream_id = resolver.set_active_tab(&tab.url);
            Json(serde_json::json!({ "livestream_id": livestream_id })).into_response()
        }
        ActiveResolver::Request(_) => {
            debug!("active tab ignored, request resolver active");
            StatusCode::ACCEPTED.into_response()
        }
    }
}

async fn api_livestream(State(state): State<DashboardState>) -> impl IntoResponse {
    let snapshot = state.tracker.context().snapshot().await;
    let tracking = state.tracker.is_tracking().await;
    Json(serde_json::json!({
        "current_livestream_id": snapshot.current_livestream_id,
        "last_total": snapshot.last_total.to_string(),
        "tracking": tracking,
    }))
}

async fn popup_refresh(State(state): State<DashboardState>) -> Redirect {
    if let Some(latest) = state.sync.force_refresh().await {
        state.popup.apply(&latest);
    }
    Redirect::to("/popup")
}

// --- HTML ---

const PAGE_STYLE: &str = "body{font-family:-apple-system,Segoe UI,Roboto,sans-serif;margin:0;padding:16px}\
.label{font-size:12px;opacity:.8}.value{font-size:20px;font-weight:bold;margin-bottom:8px}";

fn render_surface(surface: &DisplaySurface, extra: &str) -> Html<String> {
    let kind = surface.kind();
    let view = surface.view();
    let rows: String = view
        .rows(kind)
        .into_iter()
        .map(|(label, value)| {
            if label.is_empty() {
                format!("<div class=\"label\">{}</div>", escape_html(&value))
            } else {
                format!(
                    "<div class=\"label\">{}</div><div class=\"value\">{}</div>",
                    label,
                    escape_html(&value)
                )
            }
        })
        .collect();

    Html(format!(
        "<!doctype html><html><head><meta charset=\"utf-8\">\
<meta http-equiv=\"refresh\" content=\"10\"><title>Sales Tracker {kind}</title>\
<style>{PAGE_STYLE}</style></head><body>{rows}{extra}</body></html>"
    ))
}

async fn index_html() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>Sales Tracker</title></head>\
<body><a href=\"/overlay\">overlay</a> | <a href=\"/popup\">popup</a></body></html>",
    )
}

async fn overlay_html(State(state): State<DashboardState>) -> Html<String> {
    render_surface(&state.overlay, "")
}

async fn popup_html(State(state): State<DashboardState>) -> Html<String> {
    render_surface(
        &state.popup,
        "<form method=\"post\" action=\"/popup/refresh\"><button type=\"submit\">Refresh</button></form>",
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::SurfaceKind;
    use crate::store::StoredTotals;
    use std::time::Duration;

    #[test]
    fn test_render_popup_surface() {
        let popup = DisplaySurface::new(SurfaceKind::Popup, Duration::from_secs(10));
        popup.apply(&StoredTotals {
            total_sales: Some("2500".to_string()),
            estimated_total_after_fees: Some("2302.5".to_string()),
            last_updated: None,
            sales_count: Some(100),
        });
        let Html(page) = render_surface(&popup, "<form></form>");
        assert!(page.contains("$2,500"));
        assert!(page.contains("$2,302.50"));
        assert!(page.contains("Items Sold"));
        assert!(page.contains("Not yet updated"));
        assert!(page.contains("<form></form>"));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a href=\"x\">&</a>"), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
    }
}
