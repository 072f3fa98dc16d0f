use std::{
    collections::HashSet,
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use filter::{Predicate, fetch_limit, over_fetch_limit, window};
use schema::{Column, EpochTables, Field, Intent, ReviewMode, Row, ShapeLayout};
use store::{DatasetStore, SelectPlan, StoreResult};
use tracing::{debug, warn};

use crate::deadline::QueryDeadline;

pub const DEFAULT_MAX_REVIEWED_ROWS: u64 = 200_000;

/// How the unreviewed subset is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreviewedStrategy {
    /// Read all reviewed keys, over-fetch base rows, subtract in process.
    FetchThenSubtract,
    /// Let the store run `LEFT JOIN .. IS NULL`.
    NativeAntiJoin,
}

impl UnreviewedStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FetchThenSubtract => "fetch_then_subtract",
            Self::NativeAntiJoin => "native_anti_join",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AntiJoinPolicy {
    #[default]
    FetchThenSubtract,
    NativeAntiJoin,
    /// Anti-join only once the log table is larger than `max_reviewed_rows`.
    RowCount { max_reviewed_rows: u64 },
}

impl AntiJoinPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FetchThenSubtract => "fetch_then_subtract",
            Self::NativeAntiJoin => "native_anti_join",
            Self::RowCount { .. } => "row_count",
        }
    }

    pub fn with_max_reviewed_rows(self, max_reviewed_rows: u64) -> Self {
        match self {
            Self::RowCount { .. } => Self::RowCount { max_reviewed_rows },
            other => other,
        }
    }
}

impl fmt::Display for AntiJoinPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AntiJoinPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fetch_then_subtract" => Ok(Self::FetchThenSubtract),
            "native_anti_join" => Ok(Self::NativeAntiJoin),
            "row_count" => Ok(Self::RowCount {
                max_reviewed_rows: DEFAULT_MAX_REVIEWED_ROWS,
            }),
            other => Err(format!("unknown anti-join strategy '{other}'")),
        }
    }
}

/// Everything needed to read one dataset epoch in one review mode.
#[derive(Debug, Clone)]
pub struct ReviewQuery<'a> {
    pub layout: &'static ShapeLayout,
    pub tables: &'a EpochTables,
    pub predicate: Predicate,
    /// Reviewer and decision constraints; only consulted in reviewed mode.
    pub review_filters: Predicate,
    pub mode: ReviewMode,
    pub intent: Intent,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReviewStrategyMetrics {
    pub all_total: u64,
    pub reviewed_total: u64,
    pub fetch_then_subtract_total: u64,
    pub native_anti_join_total: u64,
    pub row_estimate_failures: u64,
}

#[derive(Debug, Default)]
struct ReviewStrategyMetricAtoms {
    all_total: AtomicU64,
    reviewed_total: AtomicU64,
    fetch_then_subtract_total: AtomicU64,
    native_anti_join_total: AtomicU64,
    row_estimate_failures: AtomicU64,
}

pub struct ReviewStatusResolver {
    store: Arc<dyn DatasetStore>,
    policy: AntiJoinPolicy,
    deadline: QueryDeadline,
    metrics: ReviewStrategyMetricAtoms,
}

impl ReviewStatusResolver {
    pub fn new(
        store: Arc<dyn DatasetStore>,
        policy: AntiJoinPolicy,
        deadline: QueryDeadline,
    ) -> Self {
        Self {
            store,
            policy,
            deadline,
            metrics: ReviewStrategyMetricAtoms::default(),
        }
    }

    pub async fn resolve(&self, query: ReviewQuery<'_>) -> StoreResult<Vec<Row>> {
        match query.mode {
            ReviewMode::All => {
                self.metrics.all_total.fetch_add(1, Ordering::Relaxed);
                let plan =
                    SelectPlan::scan(query.tables.base.clone(), query.layout.projection_fields())
                        .with_predicate(query.predicate)
                        .with_limit(fetch_limit(query.intent));
                let rows = self.deadline.run(self.store.select_rows(&plan)).await?;
                Ok(window(rows, query.intent))
            }
            ReviewMode::Reviewed => {
                self.metrics.reviewed_total.fetch_add(1, Ordering::Relaxed);
                let plan = SelectPlan::scan(
                    query.tables.base.clone(),
                    query.layout.reviewed_projection_fields(),
                )
                .inner_join(query.tables.log.clone(), query.layout.join_keys)
                .with_predicate(query.predicate.and(query.review_filters))
                .with_limit(fetch_limit(query.intent));
                let rows = self.deadline.run(self.store.select_rows(&plan)).await?;
                Ok(window(rows, query.intent))
            }
            ReviewMode::Unreviewed => {
                let strategy = self.choose_strategy(query.tables).await;
                self.resolve_unreviewed(strategy, query).await
            }
        }
    }

    /// Unreviewed rows computed with an explicit strategy, bypassing the policy.
    pub async fn resolve_unreviewed(
        &self,
        strategy: UnreviewedStrategy,
        query: ReviewQuery<'_>,
    ) -> StoreResult<Vec<Row>> {
        match strategy {
            UnreviewedStrategy::FetchThenSubtract => {
                self.metrics
                    .fetch_then_subtract_total
                    .fetch_add(1, Ordering::Relaxed);
                self.fetch_then_subtract(query).await
            }
            UnreviewedStrategy::NativeAntiJoin => {
                self.metrics
                    .native_anti_join_total
                    .fetch_add(1, Ordering::Relaxed);
                let layout = query.layout;
                let plan = SelectPlan::scan(query.tables.base.clone(), layout.projection_fields())
                    .anti_join(query.tables.log.clone(), layout.review_key)
                    .with_predicate(query.predicate)
                    .with_limit(fetch_limit(query.intent));
                let rows = self.deadline.run(self.store.select_rows(&plan)).await?;
                Ok(window(rows, query.intent))
            }
        }
    }

    async fn fetch_then_subtract(&self, query: ReviewQuery<'_>) -> StoreResult<Vec<Row>> {
        let layout = query.layout;
        let key = layout.review_key;
        let reviewed = self
            .deadline
            .run(self.store.distinct_keys(&query.tables.log, key))
            .await?;

        // At most |reviewed| fetched rows can be dropped below, as long as
        // base keys are unique.
        let limit = over_fetch_limit(query.intent, reviewed.len());
        let strip_key = !layout.projects_review_key();
        let mut fields = layout.projection_fields();
        if strip_key {
            fields.push(Field::base(key));
        }
        let plan =
            SelectPlan::scan(query.tables.base.clone(), fields).with_predicate(query.predicate);
        let fetched = self
            .deadline
            .run(self.store.select_rows(&plan.clone().with_limit(limit)))
            .await?;
        let truncated = limit.is_some_and(|limit| fetched.len() >= limit);
        let mut fetched_len = fetched.len();
        let mut survivors = subtract(fetched, &reviewed, key);

        if truncated
            && let Some(cap) = fetch_limit(query.intent)
            && survivors.len() < cap
        {
            warn!(
                table = %query.tables.base,
                reviewed_keys = reviewed.len(),
                survivors = survivors.len(),
                "over-fetch fell short; refetching without limit"
            );
            let fetched = self.deadline.run(self.store.select_rows(&plan)).await?;
            fetched_len = fetched.len();
            survivors = subtract(fetched, &reviewed, key);
        }

        if strip_key {
            for row in &mut survivors {
                row.remove(key);
            }
        }
        debug!(
            table = %query.tables.base,
            reviewed_keys = reviewed.len(),
            fetch_limit = ?limit,
            fetched = fetched_len,
            survivors = survivors.len(),
            "fetch-then-subtract"
        );
        Ok(window(survivors, query.intent))
    }

    async fn choose_strategy(&self, tables: &EpochTables) -> UnreviewedStrategy {
        let max_reviewed_rows = match self.policy {
            AntiJoinPolicy::FetchThenSubtract => return UnreviewedStrategy::FetchThenSubtract,
            AntiJoinPolicy::NativeAntiJoin => return UnreviewedStrategy::NativeAntiJoin,
            AntiJoinPolicy::RowCount { max_reviewed_rows } => max_reviewed_rows,
        };
        let estimate = self
            .deadline
            .run(self.store.table_row_estimate(&tables.log))
            .await;
        let strategy = match estimate {
            Ok(Some(rows)) if rows > max_reviewed_rows => UnreviewedStrategy::NativeAntiJoin,
            Ok(_) => UnreviewedStrategy::FetchThenSubtract,
            Err(err) => {
                self.metrics
                    .row_estimate_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(table = %tables.log, error = %err, "row estimate unavailable");
                UnreviewedStrategy::FetchThenSubtract
            }
        };
        debug!(table = %tables.log, strategy = strategy.as_str(), "unreviewed strategy chosen");
        strategy
    }

    pub fn metrics(&self) -> ReviewStrategyMetrics {
        ReviewStrategyMetrics {
            all_total: self.metrics.all_total.load(Ordering::Relaxed),
            reviewed_total: self.metrics.reviewed_total.load(Ordering::Relaxed),
            fetch_then_subtract_total: self
                .metrics
                .fetch_then_subtract_total
                .load(Ordering::Relaxed),
            native_anti_join_total: self.metrics.native_anti_join_total.load(Ordering::Relaxed),
            row_estimate_failures: self.metrics.row_estimate_failures.load(Ordering::Relaxed),
        }
    }
}

fn subtract(rows: Vec<Row>, reviewed: &HashSet<String>, key: Column) -> Vec<Row> {
    rows.into_iter()
        .filter(|row| !row.get(key).is_some_and(|value| reviewed.contains(value)))
        .collect()
}
