use std::collections::HashSet;

use async_trait::async_trait;
use filter::Predicate;
use schema::{Column, Field, Row, TableRef};
use thiserror::Error;

mod memory;
mod sql;

pub use memory::InMemoryStore;
pub use sql::{PoolOptions, SqlStore, build_select};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("query timed out after {0} ms")]
    Timeout(u64),
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error("failed to decode column {column}: {message}")]
    Decode { column: String, message: String },
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Select plans
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinKind {
    /// Keep base rows with a log row agreeing on every key column.
    Inner { keys: Vec<Column> },
    /// Keep base rows whose key never appears in the log table.
    Anti { key: Column },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanJoin {
    pub table: TableRef,
    pub kind: JoinKind,
}

/// One read against a base table, optionally joined to its log table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectPlan {
    pub base: TableRef,
    pub join: Option<PlanJoin>,
    pub fields: Vec<Field>,
    pub predicate: Predicate,
    pub limit: Option<usize>,
}

impl SelectPlan {
    pub fn scan(base: TableRef, fields: Vec<Field>) -> Self {
        Self {
            base,
            join: None,
            fields,
            predicate: Predicate::True,
            limit: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn inner_join(mut self, table: TableRef, keys: &[Column]) -> Self {
        self.join = Some(PlanJoin {
            table,
            kind: JoinKind::Inner {
                keys: keys.to_vec(),
            },
        });
        self
    }

    pub fn anti_join(mut self, table: TableRef, key: Column) -> Self {
        self.join = Some(PlanJoin {
            table,
            kind: JoinKind::Anti { key },
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCount {
    pub value: Option<String>,
    pub num: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyCount {
    pub date: String,
    pub num: u64,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DatasetStore: Send + Sync {
    async fn list_datasets(&self) -> StoreResult<Vec<String>>;

    /// Epochs of a dataset, newest first.
    async fn dataset_epochs(&self, dataset: &str) -> StoreResult<Vec<String>>;

    async fn select_rows(&self, plan: &SelectPlan) -> StoreResult<Vec<Row>>;

    async fn distinct_keys(&self, table: &TableRef, column: Column) -> StoreResult<HashSet<String>>;

    /// Cheap estimate; `None` when the backend cannot provide one.
    async fn table_row_estimate(&self, table: &TableRef) -> StoreResult<Option<u64>>;

    /// Row counts grouped by `column`, largest group first.
    async fn count_by(&self, table: &TableRef, column: Column) -> StoreResult<Vec<GroupCount>>;

    /// Row counts per calendar day of a timestamp column, oldest day first.
    async fn count_by_day(&self, table: &TableRef, column: Column) -> StoreResult<Vec<DailyCount>>;
}
