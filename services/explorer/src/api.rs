use std::{sync::Arc, time::Duration};

use filter::{compile, compile_review_filters};
use schema::{Column, DISPLAY_CAP, Dataset, FilterRequest, Row};
use serde::Serialize;
use store::{DatasetStore, SelectPlan, StoreError};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    deadline::QueryDeadline,
    epochs::{EpochLookup, EpochResolver, RefreshPolicy},
    review::{AntiJoinPolicy, ReviewQuery, ReviewStatusResolver},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExplorerError {
    #[error("No record for this dataset!")]
    DatasetNotFound(String),
    #[error("Invalid epoch!")]
    EpochNotFound { dataset: String, epoch: String },
    #[error("{0}")]
    BadRequest(String),
    #[error("Database unreachable. Please try again later.")]
    Unavailable(String),
}

impl ExplorerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatasetNotFound(_) => "dataset_not_found",
            Self::EpochNotFound { .. } => "epoch_not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unavailable(_) => "backend_unavailable",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::DatasetNotFound(_) | Self::EpochNotFound { .. } => 404,
            Self::BadRequest(_) => 400,
            Self::Unavailable(_) => 503,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserReviewCount {
    pub user: Option<String>,
    pub num: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionCount {
    pub decision: Option<String>,
    pub num: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccumulatedEdits {
    pub date: String,
    pub accumulate_edits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExplorerOptions {
    pub epoch_refresh: RefreshPolicy,
    pub anti_join: AntiJoinPolicy,
    pub query_timeout: Option<Duration>,
}

/// Read-only query surface over the dataset store.
pub struct Explorer {
    store: Arc<dyn DatasetStore>,
    epochs: EpochResolver,
    review: ReviewStatusResolver,
    deadline: QueryDeadline,
}

impl Explorer {
    pub fn new(store: Arc<dyn DatasetStore>, options: ExplorerOptions) -> Self {
        let deadline = QueryDeadline::new(options.query_timeout);
        Self {
            epochs: EpochResolver::new(store.clone(), options.epoch_refresh, deadline),
            review: ReviewStatusResolver::new(store.clone(), options.anti_join, deadline),
            store,
            deadline,
        }
    }

    pub fn epochs(&self) -> &EpochResolver {
        &self.epochs
    }

    pub fn review(&self) -> &ReviewStatusResolver {
        &self.review
    }

    pub async fn advanced_search(&self, req: FilterRequest) -> Result<Vec<Row>, ExplorerError> {
        if req.dataset.trim().is_empty() {
            return Err(ExplorerError::BadRequest("dsname is required".into()));
        }
        let (dataset, epoch) = self
            .resolve_epoch(&req.dataset, Some(req.epoch.as_deref().unwrap_or_default()))
            .await?;
        let layout = dataset.layout();
        let tables = dataset.tables(&epoch);
        let mode = req.review_mode();
        let intent = req.intent();
        let predicate = compile(&req, layout);
        debug!(
            dataset = %dataset,
            epoch = %epoch,
            mode = mode.as_str(),
            predicate = %predicate,
            "advanced search"
        );

        let query = ReviewQuery {
            layout,
            tables: &tables,
            predicate,
            review_filters: compile_review_filters(&req, layout),
            mode,
            intent,
        };
        self.review
            .resolve(query)
            .await
            .map_err(|err| unavailable(dataset, &epoch, err))
    }

    /// First rows of an epoch with every base column; newest epoch when none is given.
    pub async fn browse(
        &self,
        dataset: &str,
        epoch: Option<&str>,
    ) -> Result<Vec<Row>, ExplorerError> {
        let (dataset, epoch) = self.resolve_epoch(dataset, epoch).await?;
        let tables = dataset.tables(&epoch);
        let plan = SelectPlan::scan(tables.base, dataset.layout().base_column_fields())
            .with_limit(Some(DISPLAY_CAP));
        self.deadline
            .run(self.store.select_rows(&plan))
            .await
            .map_err(|err| unavailable(dataset, &epoch, err))
    }

    pub async fn dataset_epochs(&self, dataset: &str) -> Result<Vec<String>, ExplorerError> {
        self.resolve_dataset(dataset).await.map(|(_, epochs)| epochs)
    }

    pub async fn list_datasets(&self) -> Result<Vec<String>, ExplorerError> {
        self.deadline
            .run(self.store.list_datasets())
            .await
            .map_err(|err| {
                error!(error = %err, "dataset listing failed");
                ExplorerError::Unavailable(err.to_string())
            })
    }

    pub async fn leaderboard(
        &self,
        dataset: &str,
        epoch: Option<&str>,
    ) -> Result<Vec<UserReviewCount>, ExplorerError> {
        let (dataset, epoch) = self.resolve_epoch(dataset, epoch).await?;
        let tables = dataset.tables(&epoch);
        let counts = self
            .deadline
            .run(self.store.count_by(&tables.log, Column::User))
            .await
            .map_err(|err| unavailable(dataset, &epoch, err))?;
        Ok(counts
            .into_iter()
            .map(|count| UserReviewCount {
                user: count.value,
                num: count.num,
            })
            .collect())
    }

    pub async fn decision_distribution(
        &self,
        dataset: &str,
        epoch: &str,
    ) -> Result<Vec<DecisionCount>, ExplorerError> {
        let (dataset, epoch) = self.resolve_epoch(dataset, Some(epoch)).await?;
        let tables = dataset.tables(&epoch);
        let counts = self
            .deadline
            .run(self.store.count_by(&tables.log, Column::Decision))
            .await
            .map_err(|err| unavailable(dataset, &epoch, err))?;
        Ok(counts
            .into_iter()
            .map(|count| DecisionCount {
                decision: count.value,
                num: count.num,
            })
            .collect())
    }

    /// Running total of reviews per day, oldest day first.
    pub async fn accumulated_edits(
        &self,
        dataset: &str,
        epoch: &str,
    ) -> Result<Vec<AccumulatedEdits>, ExplorerError> {
        let (dataset, epoch) = self.resolve_epoch(dataset, Some(epoch)).await?;
        let tables = dataset.tables(&epoch);
        let days = self
            .deadline
            .run(self.store.count_by_day(&tables.log, Column::ChangeTime))
            .await
            .map_err(|err| unavailable(dataset, &epoch, err))?;
        let mut total = 0u64;
        Ok(days
            .into_iter()
            .map(|day| {
                total = total.saturating_add(day.num);
                AccumulatedEdits {
                    date: day.date,
                    accumulate_edits: total,
                }
            })
            .collect())
    }

    async fn resolve_dataset(&self, name: &str) -> Result<(Dataset, Vec<String>), ExplorerError> {
        match self.epochs.lookup(name).await {
            EpochLookup::Known(epochs) if !epochs.is_empty() => {
                let dataset = Dataset::from_name(name)
                    .ok_or_else(|| ExplorerError::DatasetNotFound(name.to_string()))?;
                Ok((dataset, epochs))
            }
            EpochLookup::Known(_) | EpochLookup::UnknownDataset => {
                Err(ExplorerError::DatasetNotFound(name.to_string()))
            }
            EpochLookup::Unavailable(reason) => Err(ExplorerError::Unavailable(reason)),
        }
    }

    /// Validates `epoch` against the known set, or picks the newest when absent.
    async fn resolve_epoch(
        &self,
        name: &str,
        epoch: Option<&str>,
    ) -> Result<(Dataset, String), ExplorerError> {
        let (dataset, epochs) = self.resolve_dataset(name).await?;
        match epoch {
            None => Ok((dataset, epochs[0].clone())),
            Some(epoch) if epochs.iter().any(|known| known == epoch) => {
                Ok((dataset, epoch.to_string()))
            }
            Some(epoch) => {
                warn!(dataset = %dataset, epoch = %epoch, "rejected unknown epoch");
                Err(ExplorerError::EpochNotFound {
                    dataset: name.to_string(),
                    epoch: epoch.to_string(),
                })
            }
        }
    }
}

fn unavailable(dataset: Dataset, epoch: &str, err: StoreError) -> ExplorerError {
    error!(dataset = %dataset, epoch = %epoch, error = %err, "dataset fetch failed");
    ExplorerError::Unavailable(err.to_string())
}
