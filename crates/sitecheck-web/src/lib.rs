//! Axum JSON + server-sent-events surface for the site checker.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header::HeaderName, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use sitecheck_core::{CandidatePage, CheckEvent, ResultSet};
use sitecheck_storage::{ResultCache, ResultCaches};
use sitecheck_sync::{RunStatus, SiteCheckConfig, SiteChecker};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "sitecheck-web";

const PROGRESS_BUFFER: usize = 32;

#[derive(Clone)]
pub struct AppState {
    pub checker: Arc<SiteChecker>,
}

impl AppState {
    pub fn new(checker: SiteChecker) -> Self {
        Self {
            checker: Arc::new(checker),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SinglePageRequest {
    #[serde(default)]
    page_url: String,
    #[serde(default)]
    last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckQuery {
    use_cache: Option<bool>,
}

impl CheckQuery {
    fn use_cache(&self) -> bool {
        self.use_cache.unwrap_or(true)
    }
}

pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .route("/test", get(test_handler))
        .route("/cached", get(cached_handler))
        .route("/cached-new", get(cached_new_handler))
        .route("/clear-cache", post(clear_cache_handler))
        .route("/check-single", post(check_single_handler))
        .route("/check", get(check_handler))
        .route("/check-new", get(check_new_handler))
        .route("/check-reverse", get(check_reverse_handler));
    Router::new()
        .nest("/api/sitemap", api)
        .with_state(Arc::new(state))
}

pub async fn serve(config: SiteCheckConfig, caches: ResultCaches) -> anyhow::Result<()> {
    let checker = SiteChecker::from_config(&config, caches)?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(
        port = config.web_port,
        source = %config.source_origin,
        target = %config.target_origin,
        profile = ?config.profile,
        "sitecheck web listening"
    );
    axum::serve(listener, app(AppState::new(checker))).await?;
    Ok(())
}

/// Serves the API with results persisted under the configured cache directory.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SiteCheckConfig::from_env()?;
    let caches = ResultCaches::on_disk(config.cache_dir.clone());
    serve(config, caches).await
}

async fn test_handler() -> Response {
    Json(json!({ "message": "API is working", "timestamp": Utc::now() })).into_response()
}

async fn cached_handler(State(state): State<Arc<AppState>>) -> Response {
    cached_response(&state.checker.caches().main).await
}

async fn cached_new_handler(State(state): State<Arc<AppState>>) -> Response {
    cached_response(&state.checker.caches().new_pages).await
}

async fn cached_response(cache: &ResultCache) -> Response {
    match cache.load().await {
        Some(ResultSet { cached_at, results }) => Json(json!({
            "cached": true,
            "cachedAt": cached_at,
            "results": results,
        }))
        .into_response(),
        None => Json(json!({ "cached": false })).into_response(),
    }
}

async fn clear_cache_handler(State(state): State<Arc<AppState>>) -> Response {
    state.checker.caches().clear_all().await;
    Json(json!({ "message": "Cache cleared" })).into_response()
}

async fn check_single_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SinglePageRequest>,
) -> Response {
    let url = request.page_url.trim();
    if url.is_empty() {
        return client_error("pageUrl is required");
    }
    let page = CandidatePage::new(url).with_last_modified(request.last_modified);
    let (record, _) = state.checker.recheck(page).await;
    Json(record).into_response()
}

async fn check_handler(State(state): State<Arc<AppState>>, Query(query): Query<CheckQuery>) -> Response {
    let checker = state.checker.clone();
    let use_cache = query.use_cache();
    progress_response(move |mut tx| async move { checker.run_check(use_cache, &mut tx).await })
}

async fn check_new_handler(State(state): State<Arc<AppState>>) -> Response {
    let checker = state.checker.clone();
    progress_response(move |mut tx| async move { checker.run_incremental_check(&mut tx).await })
}

async fn check_reverse_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckQuery>,
) -> Response {
    let checker = state.checker.clone();
    let use_cache = query.use_cache();
    progress_response(move |mut tx| async move { checker.run_reverse_check(use_cache, &mut tx).await })
}

/// Spawns `run` against a channel and streams whatever it pushes as SSE `data:` lines.
///
/// When the client disconnects the receiver is dropped and the run stops at its next push.
fn progress_response<F, Fut>(run: F) -> Response
where
    F: FnOnce(mpsc::Sender<CheckEvent>) -> Fut,
    Fut: Future<Output = RunStatus> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
    let task = run(tx);
    tokio::spawn(async move {
        match task.await {
            RunStatus::Completed { processed } => debug!(processed, "progress stream finished"),
            RunStatus::ConsumerGone => info!("progress stream client disconnected"),
            RunStatus::Failed { error } => warn!(%error, "progress stream ended with error"),
        }
    });

    (
        [(HeaderName::from_static("x-accel-buffering"), "no")],
        Sse::new(event_stream(rx)).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

fn event_stream(rx: mpsc::Receiver<CheckEvent>) -> impl Stream<Item = Result<Event, Infallible>> {
    let connected = stream::once(async { Ok(Event::default().comment("connected")) });
    let events = ReceiverStream::new(rx).filter_map(|event| async move {
        match Event::default().json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(err) => {
                warn!(error = %err, "dropping unserializable progress event");
                None
            }
        }
    });
    connected.chain(events)
}

fn client_error(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use sitecheck_core::{ComparisonRecord, Outcome};
    use tower::ServiceExt;

    fn state_for(source: &str, target: &str) -> AppState {
        let mut config = SiteCheckConfig::new(source, target).unwrap();
        config.http_timeout_secs = 5;
        AppState::new(SiteChecker::from_config(&config, ResultCaches::in_memory()).unwrap())
    }

    fn record(url: &str) -> ComparisonRecord {
        ComparisonRecord {
            source_relative_path: "/a".into(),
            source_url: url.into(),
            target_relative_path: "/a".into(),
            target_url: "https://new.test/a".into(),
            outcome: Outcome::Present,
            source_title: "A".into(),
            target_title: "A".into(),
            source_og_title: String::new(),
            target_og_title: String::new(),
            title_comparison: None,
            og_title_comparison: None,
            last_modified: None,
            checked_at: Utc::now(),
        }
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn data_lines(text: &str) -> Vec<serde_json::Value> {
        text.lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|json| serde_json::from_str(json).unwrap())
            .collect()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_test_route() {
        let app = app(state_for("https://old.test", "https://new.test"));
        let resp = app.oneshot(get("/api/sitemap/test")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(json["message"], "API is working");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn cached_reports_absence_then_contents() {
        let state = state_for("https://old.test", "https://new.test");
        let app = app(state.clone());

        let resp = app.clone().oneshot(get("/api/sitemap/cached")).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(json, json!({ "cached": false }));

        state
            .checker
            .caches()
            .main
            .save(&[record("https://old.test/a")])
            .await;
        let resp = app.clone().oneshot(get("/api/sitemap/cached")).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(json["cached"], true);
        assert!(json["cachedAt"].is_string());
        assert_eq!(json["results"][0]["sourceUrl"], "https://old.test/a");
        assert_eq!(json["results"][0]["outcome"], "Present");

        let resp = app.oneshot(get("/api/sitemap/cached-new")).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(json["cached"], false);
    }

    #[tokio::test]
    async fn clear_cache_removes_both_sets() {
        let state = state_for("https://old.test", "https://new.test");
        let caches = state.checker.caches().clone();
        caches.main.save(&[record("https://old.test/a")]).await;
        caches.new_pages.save(&[record("https://old.test/b")]).await;

        let resp = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sitemap/clear-cache")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("Cache cleared"));
        assert!(caches.main.load().await.is_none());
        assert!(caches.new_pages.load().await.is_none());
    }

    #[tokio::test]
    async fn check_single_compares_and_splices() {
        let mut source = mockito::Server::new_async().await;
        let target = mockito::Server::new_async().await;
        let _page = source
            .mock("GET", "/pricing")
            .with_status(200)
            .with_body("<html><head><title>Pricing</title></head></html>")
            .create_async()
            .await;
        let state = state_for(&source.url(), &target.url());
        let caches = state.checker.caches().clone();
        let page_url = format!("{}/pricing", source.url());

        let resp = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sitemap/check-single")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({ "pageUrl": page_url, "lastModified": "2024-05-01T00:00:00Z" })
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(json["sourceRelativePath"], "/pricing");
        assert_eq!(json["sourceTitle"], "Pricing");
        assert_eq!(json["outcome"], "Missing");
        assert_eq!(json["lastModified"], "2024-05-01T00:00:00Z");

        let cached = caches.main.load().await.unwrap();
        assert_eq!(cached.results.len(), 1);
        assert_eq!(cached.results[0].source_url, page_url);
    }

    #[tokio::test]
    async fn check_single_requires_page_url() {
        let resp = app(state_for("https://old.test", "https://new.test"))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sitemap/check-single")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"pageUrl": "  "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(resp).await.contains("pageUrl"));
    }

    #[tokio::test]
    async fn check_streams_cached_results_as_sse() {
        let state = state_for("https://old.test", "https://new.test");
        state
            .checker
            .caches()
            .main
            .save(&[record("https://old.test/a"), record("https://old.test/b")])
            .await;

        let resp = app(state).oneshot(get("/api/sitemap/check")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/event-stream"
        );
        assert_eq!(resp.headers()["x-accel-buffering"], "no");

        let text = body_text(resp).await;
        assert!(text.starts_with(": connected"));
        let events = data_lines(&text);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0]["totalPages"], 2);
        assert_eq!(events[0]["processedPages"], 0);
        assert_eq!(events[2]["currentResult"]["sourceUrl"], "https://old.test/b");
        assert_eq!(events[3]["isComplete"], true);
    }

    #[tokio::test]
    async fn check_failure_is_a_single_error_event() {
        let resp = app(state_for("http://127.0.0.1:9", "http://127.0.0.1:9"))
            .oneshot(get("/api/sitemap/check?useCache=false"))
            .await
            .unwrap();
        let events = data_lines(&body_text(resp).await);
        let errors: Vec<_> = events.iter().filter(|e| e.get("error").is_some()).collect();
        assert_eq!(errors.len(), 1);
        assert!(events.last().unwrap().get("error").is_some());
        assert_eq!(events[0]["totalPages"], -1);
    }

    #[tokio::test]
    async fn reverse_check_replays_new_pages_cache() {
        let state = state_for("https://old.test", "https://new.test");
        state
            .checker
            .caches()
            .new_pages
            .save(&[record("")])
            .await;
        let resp = app(state)
            .oneshot(get("/api/sitemap/check-reverse?useCache=true"))
            .await
            .unwrap();
        let events = data_lines(&body_text(resp).await);
        assert_eq!(events.len(), 3);
        assert_eq!(events[2]["isComplete"], true);
    }

    #[tokio::test]
    async fn check_new_streams_only_uncached_pages() {
        let mut source = mockito::Server::new_async().await;
        let mut target = mockito::Server::new_async().await;
        let src = source.url();
        let _index = source
            .mock("GET", "/sitemap_index.xml")
            .with_status(200)
            .with_body(format!(
                r#"<sitemapindex><sitemap><loc>{src}/page-sitemap.xml</loc></sitemap></sitemapindex>"#
            ))
            .create_async()
            .await;
        let _pages = source
            .mock("GET", "/page-sitemap.xml")
            .with_status(200)
            .with_body(format!(
                r#"<urlset><url><loc>{src}/old</loc></url><url><loc>{src}/new</loc></url></urlset>"#
            ))
            .create_async()
            .await;
        let old_page = source.mock("GET", "/old").expect(0).create_async().await;
        let _new_page = source
            .mock("GET", "/new")
            .with_status(200)
            .with_body("<html><head><title>New</title></head></html>")
            .create_async()
            .await;
        let _gone = target
            .mock("HEAD", "/new")
            .with_status(404)
            .create_async()
            .await;

        let state = state_for(&src, &target.url());
        let caches = state.checker.caches().clone();
        caches.main.save(&[record(&format!("{src}/old"))]).await;

        let resp = app(state).oneshot(get("/api/sitemap/check-new")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let events = data_lines(&body_text(resp).await);
        assert_eq!(events.len(), 4);
        assert_eq!(events[1]["totalPages"], 2);
        assert_eq!(events[1]["processedPages"], 1);
        assert_eq!(events[2]["currentResult"]["sourceUrl"], format!("{src}/new"));
        assert_eq!(events[2]["currentResult"]["outcome"], "Missing");
        assert_eq!(events[3]["isComplete"], true);
        old_page.assert_async().await;

        let cached = caches.main.load().await.unwrap();
        assert_eq!(cached.results.len(), 2);
    }
}
