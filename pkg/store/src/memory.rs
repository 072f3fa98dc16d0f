use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering},
    },
};

use async_trait::async_trait;
use filter::{FieldSource, JoinedRow};
use schema::{Column, Field, ReviewLogEntry, Row, TableRef};

use crate::{
    DailyCount, DatasetStore, GroupCount, JoinKind, SelectPlan, StoreError, StoreResult,
};

#[derive(Debug, Default)]
struct MemoryState {
    datasets: Vec<String>,
    epochs: HashMap<String, Vec<String>>,
    tables: HashMap<TableRef, Vec<Row>>,
}

/// Process-local store used by tests, benchmarks and the demo backend.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
    queries: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a dataset in the metadata listing together with its epochs.
    pub fn add_dataset(&self, dataset: &str, epochs: &[&str]) -> StoreResult<()> {
        let mut state = self.write()?;
        if !state.datasets.iter().any(|name| name == dataset) {
            state.datasets.push(dataset.to_string());
        }
        let known = state.epochs.entry(dataset.to_string()).or_default();
        for epoch in epochs {
            if !known.iter().any(|existing| existing == epoch) {
                known.push((*epoch).to_string());
            }
        }
        Ok(())
    }

    pub fn create_table(&self, table: &TableRef) -> StoreResult<()> {
        self.write()?.tables.entry(table.clone()).or_default();
        Ok(())
    }

    pub fn insert_rows(
        &self,
        table: &TableRef,
        rows: impl IntoIterator<Item = Row>,
    ) -> StoreResult<()> {
        self.write()?
            .tables
            .entry(table.clone())
            .or_default()
            .extend(rows);
        Ok(())
    }

    pub fn insert_log_entries(
        &self,
        table: &TableRef,
        entries: impl IntoIterator<Item = ReviewLogEntry>,
    ) -> StoreResult<()> {
        self.insert_rows(table, entries.into_iter().map(ReviewLogEntry::into_row))
    }

    /// Makes every subsequent call fail as an unreachable backend would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, AtomicOrdering::Relaxed);
    }

    /// Number of backing calls served, including failed ones.
    pub fn query_count(&self) -> u64 {
        self.queries.load(AtomicOrdering::Relaxed)
    }

    fn begin(&self) -> StoreResult<RwLockReadGuard<'_, MemoryState>> {
        self.queries.fetch_add(1, AtomicOrdering::Relaxed);
        if self.unavailable.load(AtomicOrdering::Relaxed) {
            return Err(StoreError::backend("in-memory store marked unavailable"));
        }
        self.state
            .read()
            .map_err(|_| StoreError::backend("in-memory store lock poisoned"))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| StoreError::backend("in-memory store lock poisoned"))
    }
}

fn table<'a>(state: &'a MemoryState, table: &TableRef) -> StoreResult<&'a [Row]> {
    state
        .tables
        .get(table)
        .map(Vec::as_slice)
        .ok_or_else(|| StoreError::MissingTable(table.to_string()))
}

fn project<S: FieldSource>(fields: &[Field], source: &S) -> Row {
    let mut row = Row::new();
    for field in fields {
        if let Some(value) = source.value(*field) {
            row.insert(field.column, value);
        }
    }
    row
}

fn epoch_order(left: &str, right: &str) -> Ordering {
    match (left.parse::<i64>(), right.parse::<i64>()) {
        (Ok(left), Ok(right)) => left.cmp(&right),
        _ => left.cmp(right),
    }
}

fn keys_agree(base: &Row, log: &Row, keys: &[Column]) -> bool {
    keys.iter().all(|key| match (base.get(*key), log.get(*key)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    })
}

#[async_trait]
impl DatasetStore for InMemoryStore {
    async fn list_datasets(&self) -> StoreResult<Vec<String>> {
        Ok(self.begin()?.datasets.clone())
    }

    async fn dataset_epochs(&self, dataset: &str) -> StoreResult<Vec<String>> {
        let state = self.begin()?;
        let mut epochs = state
            .epochs
            .get(dataset)
            .cloned()
            .ok_or_else(|| StoreError::MissingTable(format!("metadata.{dataset}epoch")))?;
        epochs.sort_by(|left, right| epoch_order(right, left));
        Ok(epochs)
    }

    async fn select_rows(&self, plan: &SelectPlan) -> StoreResult<Vec<Row>> {
        let state = self.begin()?;
        let base = table(&state, &plan.base)?;
        let limit = plan.limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();

        match &plan.join {
            None => {
                for row in base {
                    if out.len() >= limit {
                        break;
                    }
                    if plan.predicate.matches(row) {
                        out.push(project(&plan.fields, row));
                    }
                }
            }
            Some(join) => {
                let log = table(&state, &join.table)?;
                match &join.kind {
                    JoinKind::Inner { keys } => {
                        'base: for row in base {
                            for entry in log.iter().filter(|entry| keys_agree(row, entry, keys)) {
                                if out.len() >= limit {
                                    break 'base;
                                }
                                let joined = JoinedRow { base: row, log: entry };
                                if plan.predicate.matches(&joined) {
                                    out.push(project(&plan.fields, &joined));
                                }
                            }
                        }
                    }
                    JoinKind::Anti { key } => {
                        let reviewed: HashSet<&str> =
                            log.iter().filter_map(|entry| entry.get(*key)).collect();
                        for row in base {
                            if out.len() >= limit {
                                break;
                            }
                            let seen = row.get(*key).is_some_and(|value| reviewed.contains(value));
                            if !seen && plan.predicate.matches(row) {
                                out.push(project(&plan.fields, row));
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    async fn distinct_keys(
        &self,
        table_ref: &TableRef,
        column: Column,
    ) -> StoreResult<HashSet<String>> {
        let state = self.begin()?;
        Ok(table(&state, table_ref)?
            .iter()
            .filter_map(|row| row.get(column))
            .map(str::to_string)
            .collect())
    }

    async fn table_row_estimate(&self, table_ref: &TableRef) -> StoreResult<Option<u64>> {
        let state = self.begin()?;
        Ok(state.tables.get(table_ref).map(|rows| rows.len() as u64))
    }

    async fn count_by(&self, table_ref: &TableRef, column: Column) -> StoreResult<Vec<GroupCount>> {
        let state = self.begin()?;
        let mut groups: HashMap<Option<String>, u64> = HashMap::new();
        for row in table(&state, table_ref)? {
            *groups.entry(row.get(column).map(str::to_string)).or_default() += 1;
        }
        let mut counts: Vec<GroupCount> = groups
            .into_iter()
            .map(|(value, num)| GroupCount { value, num })
            .collect();
        counts.sort_by(|left, right| {
            right
                .num
                .cmp(&left.num)
                .then_with(|| left.value.cmp(&right.value))
        });
        Ok(counts)
    }

    async fn count_by_day(
        &self,
        table_ref: &TableRef,
        column: Column,
    ) -> StoreResult<Vec<DailyCount>> {
        let state = self.begin()?;
        let mut days: BTreeMap<String, u64> = BTreeMap::new();
        for row in table(&state, table_ref)? {
            let Some(stamp) = row.get(column) else {
                continue;
            };
            let day = stamp.get(..10).unwrap_or(stamp);
            *days.entry(day.to_string()).or_default() += 1;
        }
        Ok(days
            .into_iter()
            .map(|(date, num)| DailyCount { date, num })
            .collect())
    }
}
