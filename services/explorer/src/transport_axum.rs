use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderValue, Response, StatusCode, header::CONTENT_TYPE},
    routing::{get, post},
};
use schema::FilterRequest;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    api::{Explorer, ExplorerError},
    transport::{HttpResponse, OutcomeCounters, TransportMetrics},
};

const MAX_HTTP_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
struct AppState {
    explorer: Arc<Explorer>,
    metrics: Arc<Mutex<TransportMetrics>>,
}

impl AppState {
    fn metrics(&self) -> MutexGuard<'_, TransportMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish<T: Serialize>(
        &self,
        bucket: fn(&mut TransportMetrics) -> &mut OutcomeCounters,
        result: Result<T, ExplorerError>,
    ) -> Response<Body> {
        let response = HttpResponse::from_result(result);
        {
            let mut metrics = self.metrics();
            metrics.http_requests_total += 1;
            bucket(&mut *metrics).observe(response.status);
        }
        response_from_transport(response)
    }
}

#[derive(Debug, Deserialize)]
struct EpochParam {
    epoch: Option<String>,
}

pub fn router(explorer: Arc<Explorer>) -> Router {
    let state = AppState {
        explorer,
        metrics: Arc::new(Mutex::new(TransportMetrics::default())),
    };
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/dslist", get(list_datasets))
        .route("/ds/:dsname", get(browse_newest))
        .route("/ds/:dsname/:epoch", get(browse_epoch))
        .route("/dsepoch/:dsname", get(dataset_epochs))
        .route("/dsleaderboard/:dsname", get(leaderboard))
        .route("/gamelogs/decisions/:dsname/:epoch", get(decisions))
        .route("/gamelogs/accumulateedits/:dsname/:epoch", get(accumulated_edits))
        .route("/advancedsearch", post(advanced_search))
        .fallback(not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_HTTP_BODY_BYTES))
}

pub async fn serve(explorer: Arc<Explorer>, bind_addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %listener.local_addr()?, "explorer listening");
    axum::serve(listener, router(explorer))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable; serving until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn root(State(state): State<AppState>) -> Response<Body> {
    state.metrics().http_requests_total += 1;
    response_from_transport(HttpResponse::json(
        &json!({ "message": "Will return you wikiloop datasets." }),
    ))
}

async fn health(State(state): State<AppState>) -> Response<Body> {
    {
        let mut metrics = state.metrics();
        metrics.http_requests_total += 1;
        metrics.health_requests_total += 1;
    }
    response_from_transport(HttpResponse::json(&json!({ "status": "ok" })))
}

async fn metrics(State(state): State<AppState>) -> Response<Body> {
    let epochs = state.explorer.epochs().metrics();
    let review = state.explorer.review().metrics();
    let body = {
        let mut metrics = state.metrics();
        metrics.http_requests_total += 1;
        metrics.metrics_requests_total += 1;
        metrics.render_prometheus(&epochs, &review)
    };
    response_from_transport(HttpResponse::ok_text(body))
}

async fn list_datasets(State(state): State<AppState>) -> Response<Body> {
    let result = state.explorer.list_datasets().await;
    state.finish(|metrics| &mut metrics.catalog, result)
}

async fn dataset_epochs(
    State(state): State<AppState>,
    Path(dsname): Path<String>,
) -> Response<Body> {
    let result = state.explorer.dataset_epochs(&dsname).await;
    state.finish(|metrics| &mut metrics.catalog, result)
}

async fn browse_newest(
    State(state): State<AppState>,
    Path(dsname): Path<String>,
) -> Response<Body> {
    let result = state.explorer.browse(&dsname, None).await;
    state.finish(|metrics| &mut metrics.browse, result)
}

async fn browse_epoch(
    State(state): State<AppState>,
    Path((dsname, epoch)): Path<(String, String)>,
) -> Response<Body> {
    let result = state.explorer.browse(&dsname, Some(&epoch)).await;
    state.finish(|metrics| &mut metrics.browse, result)
}

async fn leaderboard(
    State(state): State<AppState>,
    Path(dsname): Path<String>,
    Query(param): Query<EpochParam>,
) -> Response<Body> {
    let result = state
        .explorer
        .leaderboard(&dsname, param.epoch.as_deref())
        .await;
    state.finish(|metrics| &mut metrics.stats, result)
}

async fn decisions(
    State(state): State<AppState>,
    Path((dsname, epoch)): Path<(String, String)>,
) -> Response<Body> {
    let result = state.explorer.decision_distribution(&dsname, &epoch).await;
    state.finish(|metrics| &mut metrics.stats, result)
}

async fn accumulated_edits(
    State(state): State<AppState>,
    Path((dsname, epoch)): Path<(String, String)>,
) -> Response<Body> {
    let result = state.explorer.accumulated_edits(&dsname, &epoch).await;
    state.finish(|metrics| &mut metrics.stats, result)
}

async fn advanced_search(State(state): State<AppState>, body: Bytes) -> Response<Body> {
    let result = match serde_json::from_slice::<FilterRequest>(&body) {
        Ok(req) => state.explorer.advanced_search(req).await,
        Err(err) => {
            warn!(error = %err, "rejected search body");
            Err(ExplorerError::BadRequest(format!("invalid search request: {err}")))
        }
    };
    if let Ok(rows) = &result {
        state.metrics().search_rows_returned_total += rows.len() as u64;
    }
    state.finish(|metrics| &mut metrics.search, result)
}

async fn not_found(State(state): State<AppState>) -> Response<Body> {
    state.metrics().http_requests_total += 1;
    let mut response = response_from_transport(HttpResponse::json(
        &json!({ "errMessage": "Not found.", "code": "not_found" }),
    ));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

fn response_from_transport(response: HttpResponse) -> Response<Body> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    out.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_str(response.content_type)
            .unwrap_or(HeaderValue::from_static("application/json")),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ExplorerOptions;
    use axum::{body::to_bytes, http::Request};
    use schema::{Dataset, Row};
    use store::InMemoryStore;
    use tower::ServiceExt;

    fn app() -> Router {
        let store = Arc::new(InMemoryStore::new());
        store.add_dataset("missingdateofdeath", &["4"]).unwrap();
        store
            .insert_rows(
                &Dataset::MissingDateOfDeath.tables("4").base,
                [Row::missing_value("Q42", "P570", "r", "en")],
            )
            .unwrap();
        router(Arc::new(Explorer::new(store, ExplorerOptions::default())))
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = to_bytes(response.into_body(), MAX_HTTP_BODY_BYTES)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn root_describes_the_service() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("wikiloop datasets"));
    }

    #[tokio::test]
    async fn malformed_search_body_is_a_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/advancedsearch")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("\"code\":\"bad_request\""));
    }

    #[tokio::test]
    async fn unknown_route_is_json_not_found() {
        let request = Request::builder()
            .uri("/battlefield/getInteractionCounts")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_text(response).await.contains("not_found"));
    }
}
