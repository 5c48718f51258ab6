//! Axum + Askama status and control surface over the monitor.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use tcm_core::ComplianceAlert;
use tcm_monitor::{ForwardingTarget, Monitor};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub const CRATE_NAME: &str = "tcm-web";

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Monitor>,
}

impl AppState {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self { monitor }
    }
}

#[derive(Debug, Deserialize)]
struct ForwardRequest {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Clone)]
struct AlertRow {
    alert_id: String,
    product: String,
    restriction_type: String,
    confidence: u8,
    source: String,
    summary: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    running: bool,
    scheduler_enabled: bool,
    poll_cron: String,
    last_checked: String,
    next_poll: String,
    provenance: String,
    last_processed: String,
    forwarding_configured: bool,
    total_alerts: usize,
    recent: Vec<AlertRow>,
}

/// CORS is wide open: the dashboard endpoints are also queried from
/// third-party status pages.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/run", post(run_handler))
        .route("/alerts", get(alerts_handler))
        .route("/processed", get(processed_handler))
        .route("/config/forwarding", put(forwarding_handler))
        .route("/forward", post(forward_handler))
        .layer(cors)
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let status = state.monitor.status().await;
    match state.monitor.alerts().await {
        Ok(alerts) => {
            let total_alerts = alerts.len();
            let recent: Vec<AlertRow> = alerts.iter().rev().take(10).map(alert_row).collect();
            let tpl = IndexTemplate {
                running: status.running,
                scheduler_enabled: status.scheduler_enabled,
                poll_cron: status.poll_cron,
                last_checked: status
                    .last_checked
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string()),
                next_poll: status
                    .next_poll
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "n/a".to_string()),
                provenance: status
                    .last_run
                    .as_ref()
                    .map(|run| run.provenance.label().to_string())
                    .unwrap_or_else(|| "n/a".to_string()),
                last_processed: status
                    .last_run
                    .as_ref()
                    .map(|run| run.processed.to_string())
                    .unwrap_or_else(|| "n/a".to_string()),
                forwarding_configured: status.forwarding_configured,
                total_alerts,
                recent,
            };
            render_html(tpl)
        }
        Err(err) => server_error(err),
    }
}

fn alert_row(alert: &ComplianceAlert) -> AlertRow {
    AlertRow {
        alert_id: alert.alert_id.clone(),
        product: alert.product.clone(),
        restriction_type: alert.restriction_type.label().to_string(),
        confidence: alert.confidence,
        source: alert.source.clone(),
        summary: alert.summary.clone(),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.monitor.status().await).into_response()
}

async fn run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.monitor.try_run().await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "a check is already running" })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn alerts_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.monitor.alerts().await {
        Ok(alerts) => Json(alerts).into_response(),
        Err(err) => server_error(err),
    }
}

async fn processed_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.monitor.processed_ids().await {
        Ok(ids) => Json(ids).into_response(),
        Err(err) => server_error(err),
    }
}

async fn forwarding_handler(
    State(state): State<Arc<AppState>>,
    Json(target): Json<Option<ForwardingTarget>>,
) -> Response {
    let configured = target.is_some();
    state.monitor.set_forwarding(target).await;
    Json(serde_json::json!({ "forwardingConfigured": configured })).into_response()
}

async fn forward_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ForwardRequest>,
) -> Response {
    match state.monitor.forward_alerts(&req.ids).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => server_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tcm_monitor::MonitorConfig;
    use tcm_storage::MemoryStore;
    use tempfile::tempdir;
    use tower::ServiceExt;

    async fn mk_state(dir: &std::path::Path) -> AppState {
        let config = MonitorConfig {
            data_dir: dir.join("data"),
            sources_path: dir.join("sources.yaml"),
            query: "tariffs".to_string(),
            poll_cron: "0 */20 * * * *".to_string(),
            scheduler_enabled: false,
            http_timeout_secs: 2,
            forward_url: None,
            forward_secret: None,
            user_agent: "tcm-test/0".to_string(),
            web_port: 0,
        };
        let monitor = Monitor::new(config, Arc::new(MemoryStore::new()))
            .await
            .expect("monitor");
        AppState::new(Arc::new(monitor))
    }

    async fn body_text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.expect("body").to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    #[tokio::test]
    async fn dashboard_renders() {
        let dir = tempdir().expect("tempdir");
        let app = app(mk_state(dir.path()).await);
        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Trade Compliance Monitor"));
        assert!(text.contains("Run Manual Check"));
    }

    #[tokio::test]
    async fn health_reports_status_with_cors() {
        let dir = tempdir().expect("tempdir");
        let app = app(mk_state(dir.path()).await);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "https://dash.example")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
        let text = body_text(resp).await;
        assert!(text.contains("\"status\":\"healthy\""));
        assert!(text.contains("\"running\":false"));
    }

    #[tokio::test]
    async fn manual_run_returns_summary_json() {
        let dir = tempdir().expect("tempdir");
        let state = mk_state(dir.path()).await;
        let app = app(state);
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/run")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        // no live sources configured: the run falls back to simulated data
        assert!(text.contains("\"provenance\":\"simulated\""));
        assert!(text.contains("\"results\""));

        let alerts = app
            .oneshot(Request::builder().uri("/alerts").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(alerts.status(), StatusCode::OK);
        let text = body_text(alerts).await;
        assert!(text.contains("\"alertId\""));
    }

    #[tokio::test]
    async fn forwarding_config_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let app = app(mk_state(dir.path()).await);

        let set = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/config/forwarding")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"url":"http://127.0.0.1:1/hook","secret":"s3cret"}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(set.status(), StatusCode::OK);
        assert!(body_text(set).await.contains("\"forwardingConfigured\":true"));

        let clear = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/config/forwarding")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("null"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(clear.status(), StatusCode::OK);
        assert!(body_text(clear).await.contains("\"forwardingConfigured\":false"));
    }

    #[tokio::test]
    async fn forward_with_no_ids_reports_skipped() {
        let dir = tempdir().expect("tempdir");
        let app = app(mk_state(dir.path()).await);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/forward")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        // empty log, nothing selected
        assert!(body_text(resp).await.contains("\"status\":\"skipped\""));
    }

    #[tokio::test]
    async fn processed_ids_listed_after_run() {
        let dir = tempdir().expect("tempdir");
        let app = app(mk_state(dir.path()).await);
        app.clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/run")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        let resp = app
            .oneshot(Request::builder().uri("/processed").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("CA-"));
    }
}
