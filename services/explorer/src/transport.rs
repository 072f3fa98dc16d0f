use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tracing::error;

use crate::{
    api::ExplorerError,
    epochs::EpochCacheMetrics,
    review::ReviewStrategyMetrics,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    pub fn ok_json(body: String) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body,
        }
    }

    pub fn ok_text(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/plain; version=0.0.4; charset=utf-8",
            body,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self::ok_json(body),
            Err(err) => {
                error!(error = %err, "response encoding failed");
                Self::error_body(500, "Internal server error.", "internal")
            }
        }
    }

    pub fn from_result<T: Serialize>(result: Result<T, ExplorerError>) -> Self {
        match result {
            Ok(value) => Self::json(&value),
            Err(err) => Self::error(&err),
        }
    }

    pub fn error(err: &ExplorerError) -> Self {
        Self::error_body(err.status(), &err.to_string(), err.code())
    }

    fn error_body(status: u16, message: &str, code: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: json!({ "errMessage": message, "code": code }).to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutcomeCounters {
    pub success_total: u64,
    pub client_error_total: u64,
    pub server_error_total: u64,
}

impl OutcomeCounters {
    pub fn observe(&mut self, status: u16) {
        match status {
            200..=299 => self.success_total += 1,
            400..=499 => self.client_error_total += 1,
            _ => self.server_error_total += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportMetrics {
    started_at: Instant,
    pub http_requests_total: u64,
    pub health_requests_total: u64,
    pub metrics_requests_total: u64,
    pub search: OutcomeCounters,
    pub search_rows_returned_total: u64,
    pub browse: OutcomeCounters,
    pub catalog: OutcomeCounters,
    pub stats: OutcomeCounters,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            http_requests_total: 0,
            health_requests_total: 0,
            metrics_requests_total: 0,
            search: OutcomeCounters::default(),
            search_rows_returned_total: 0,
            browse: OutcomeCounters::default(),
            catalog: OutcomeCounters::default(),
            stats: OutcomeCounters::default(),
        }
    }
}

impl TransportMetrics {
    pub fn render_prometheus(
        &self,
        epochs: &EpochCacheMetrics,
        review: &ReviewStrategyMetrics,
    ) -> String {
        let uptime_seconds = self.started_at.elapsed().as_secs_f64();
        let mut out = String::new();
        let mut metric = |kind: &str, name: &str, value: String| {
            out.push_str(&format!("# TYPE {name} {kind}\n{name} {value}\n"));
        };
        metric("gauge", "explorer_uptime_seconds", format!("{uptime_seconds:.3}"));
        metric("counter", "explorer_http_requests_total", self.http_requests_total.to_string());
        metric("counter", "explorer_health_requests_total", self.health_requests_total.to_string());
        metric(
            "counter",
            "explorer_metrics_requests_total",
            self.metrics_requests_total.to_string(),
        );
        for (prefix, counters) in [
            ("explorer_search", &self.search),
            ("explorer_browse", &self.browse),
            ("explorer_catalog", &self.catalog),
            ("explorer_stats", &self.stats),
        ] {
            metric(
                "counter",
                &format!("{prefix}_success_total"),
                counters.success_total.to_string(),
            );
            metric(
                "counter",
                &format!("{prefix}_client_error_total"),
                counters.client_error_total.to_string(),
            );
            metric(
                "counter",
                &format!("{prefix}_server_error_total"),
                counters.server_error_total.to_string(),
            );
        }
        metric(
            "counter",
            "explorer_search_rows_returned_total",
            self.search_rows_returned_total.to_string(),
        );
        metric("counter", "explorer_review_all_total", review.all_total.to_string());
        metric("counter", "explorer_review_reviewed_total", review.reviewed_total.to_string());
        metric(
            "counter",
            "explorer_unreviewed_fetch_then_subtract_total",
            review.fetch_then_subtract_total.to_string(),
        );
        metric(
            "counter",
            "explorer_unreviewed_native_anti_join_total",
            review.native_anti_join_total.to_string(),
        );
        metric(
            "counter",
            "explorer_row_estimate_failures_total",
            review.row_estimate_failures.to_string(),
        );
        metric("counter", "explorer_epoch_cache_hits_total", epochs.cache_hits.to_string());
        metric(
            "counter",
            "explorer_epoch_cache_refresh_attempts_total",
            epochs.refresh_attempts.to_string(),
        );
        metric(
            "counter",
            "explorer_epoch_cache_refresh_successes_total",
            epochs.refresh_successes.to_string(),
        );
        metric(
            "counter",
            "explorer_epoch_cache_refresh_missing_total",
            epochs.refresh_missing.to_string(),
        );
        metric(
            "counter",
            "explorer_epoch_cache_refresh_failures_total",
            epochs.refresh_failures.to_string(),
        );
        metric(
            "counter",
            "explorer_epoch_cache_invalidations_total",
            epochs.invalidations.to_string(),
        );
        out
    }
}
