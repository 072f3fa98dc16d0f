use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use filter::Predicate;
use schema::{Column, Field, Row, Side, TableRef};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr, QueryResult,
    Statement,
    sea_query::{
        Alias, Asterisk, Condition, Expr, Func, JoinType, LikeExpr, MysqlQueryBuilder, Order,
        Query, SelectStatement, SimpleExpr,
    },
};
use tracing::debug;

use crate::{
    DailyCount, DatasetStore, GroupCount, JoinKind, SelectPlan, StoreError, StoreResult,
};

const BASE_ALIAS: &str = "b";
const LOG_ALIAS: &str = "l";
const DATASET_NAME_TABLE: &str = "datasetname";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_connections: Option<u32>,
    pub connect_timeout: Option<Duration>,
    pub acquire_timeout: Option<Duration>,
}

/// MySQL-backed store. Every dataset lives in its own schema; the
/// dataset listing and epoch tables live in the metadata schema.
#[derive(Debug, Clone)]
pub struct SqlStore {
    conn: DatabaseConnection,
    metadatabase: String,
}

impl From<DbErr> for StoreError {
    fn from(err: DbErr) -> Self {
        let message = err.to_string();
        if message.contains("1146") || message.contains("doesn't exist") {
            return Self::MissingTable(message);
        }
        Self::Backend(message)
    }
}

impl SqlStore {
    pub async fn connect(
        url: &str,
        metadatabase: impl Into<String>,
        pool: &PoolOptions,
    ) -> StoreResult<Self> {
        let mut options = ConnectOptions::new(url.to_string());
        if let Some(max) = pool.max_connections {
            options.max_connections(max);
        }
        if let Some(timeout) = pool.connect_timeout {
            options.connect_timeout(timeout);
        }
        if let Some(timeout) = pool.acquire_timeout {
            options.acquire_timeout(timeout);
        }
        options.sqlx_logging(false);
        let conn = Database::connect(options).await?;
        Ok(Self::from_connection(conn, metadatabase))
    }

    pub fn from_connection(conn: DatabaseConnection, metadatabase: impl Into<String>) -> Self {
        Self {
            conn,
            metadatabase: metadatabase.into(),
        }
    }

    async fn fetch(&self, select: &SelectStatement) -> StoreResult<Vec<QueryResult>> {
        let (sql, values) = select.build(MysqlQueryBuilder);
        debug!(sql = %sql, params = values.0.len(), "executing select");
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(DbBackend::MySql, sql, values))
            .await?;
        Ok(rows)
    }

    fn metadata_table(&self, table: impl Into<String>) -> (Alias, Alias) {
        (Alias::new(self.metadatabase.as_str()), Alias::new(table))
    }
}

// ---------------------------------------------------------------------------
// Plan translation
// ---------------------------------------------------------------------------

fn table_iden(table: &TableRef) -> (Alias, Alias) {
    (Alias::new(table.schema.as_str()), Alias::new(table.table.as_str()))
}

fn field_ref(field: Field) -> (Alias, Alias) {
    let alias = match field.side {
        Side::Base => BASE_ALIAS,
        Side::Log => LOG_ALIAS,
    };
    (Alias::new(alias), Alias::new(field.column.name()))
}

fn match_nothing() -> SimpleExpr {
    Expr::cust("1 = 0")
}

/// Escapes LIKE metacharacters so a needle only matches literally.
fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len());
    for ch in needle.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Renders a predicate as a condition; `None` when it constrains nothing.
fn condition(predicate: &Predicate) -> Option<Condition> {
    let leaf = |expr: SimpleExpr| Some(Condition::all().add(expr));
    match predicate {
        Predicate::True => None,
        Predicate::Eq { field, value } => leaf(Expr::col(field_ref(*field)).eq(value.as_str())),
        Predicate::In { values, .. } if values.is_empty() => leaf(match_nothing()),
        Predicate::In { field, values } => {
            leaf(Expr::col(field_ref(*field)).is_in(values.iter().map(String::as_str)))
        }
        Predicate::Contains { field, needle } => leaf(
            Expr::col(field_ref(*field))
                .like(LikeExpr::new(format!("%{}%", escape_like(needle))).escape('\\')),
        ),
        Predicate::And(parts) => {
            let parts: Vec<Condition> = parts.iter().filter_map(condition).collect();
            if parts.is_empty() {
                return None;
            }
            Some(parts.into_iter().fold(Condition::all(), Condition::add))
        }
        Predicate::Or(parts) if parts.is_empty() => leaf(match_nothing()),
        Predicate::Or(parts) => {
            let mut any = Condition::any();
            for part in parts {
                // an unconstrained branch makes the whole disjunction true
                any = any.add(condition(part)?);
            }
            Some(any)
        }
    }
}

/// Translates a plan into a parameterized MySQL select.
pub fn build_select(plan: &SelectPlan) -> SelectStatement {
    let mut select = Query::select();
    for field in &plan.fields {
        select.column(field_ref(*field));
    }
    select.from_as(table_iden(&plan.base), Alias::new(BASE_ALIAS));

    let mut filter = Condition::all();
    if let Some(join) = &plan.join {
        match &join.kind {
            JoinKind::Inner { keys } => {
                let on = keys.iter().fold(Condition::all(), |on, key| {
                    on.add(
                        Expr::col(field_ref(Field::base(*key))).equals(field_ref(Field::log(*key))),
                    )
                });
                select.join_as(
                    JoinType::InnerJoin,
                    table_iden(&join.table),
                    Alias::new(LOG_ALIAS),
                    on,
                );
            }
            JoinKind::Anti { key } => {
                select.join_as(
                    JoinType::LeftJoin,
                    table_iden(&join.table),
                    Alias::new(LOG_ALIAS),
                    Expr::col(field_ref(Field::base(*key))).equals(field_ref(Field::log(*key))),
                );
                filter = filter.add(Expr::col(field_ref(Field::log(*key))).is_null());
            }
        }
    }
    if let Some(predicate) = condition(&plan.predicate) {
        filter = filter.add(predicate);
    }
    select.cond_where(filter);
    if let Some(limit) = plan.limit {
        select.limit(limit as u64);
    }
    select
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn text(row: &QueryResult, column: &str) -> StoreResult<Option<String>> {
    row.try_get::<Option<String>>("", column)
        .map_err(|err| StoreError::decode(column, err.to_string()))
}

fn count(row: &QueryResult, column: &str) -> StoreResult<u64> {
    let num = row
        .try_get::<i64>("", column)
        .map_err(|err| StoreError::decode(column, err.to_string()))?;
    u64::try_from(num).map_err(|err| StoreError::decode(column, err.to_string()))
}

/// Epoch columns are integers in some metadata schemas and strings in others.
fn epoch(row: &QueryResult) -> StoreResult<String> {
    if let Ok(Some(value)) = row.try_get::<Option<String>>("", "epoch") {
        return Ok(value);
    }
    row.try_get::<i64>("", "epoch")
        .map(|value| value.to_string())
        .map_err(|err| StoreError::decode("epoch", err.to_string()))
}

fn decode_row(row: &QueryResult, fields: &[Field]) -> StoreResult<Row> {
    let mut out = Row::new();
    for field in fields {
        if let Some(value) = text(row, field.column.name())? {
            out.insert(field.column, value);
        }
    }
    Ok(out)
}

#[async_trait]
impl DatasetStore for SqlStore {
    async fn list_datasets(&self) -> StoreResult<Vec<String>> {
        let select = Query::select()
            .column(Alias::new("name"))
            .from(self.metadata_table(DATASET_NAME_TABLE))
            .to_owned();
        let rows = self.fetch(&select).await?;
        let mut names = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(name) = text(row, "name")? {
                names.push(name);
            }
        }
        Ok(names)
    }

    async fn dataset_epochs(&self, dataset: &str) -> StoreResult<Vec<String>> {
        let select = Query::select()
            .column(Alias::new("epoch"))
            .from(self.metadata_table(format!("{dataset}epoch")))
            .order_by(Alias::new("epoch"), Order::Desc)
            .to_owned();
        self.fetch(&select).await?.iter().map(epoch).collect()
    }

    async fn select_rows(&self, plan: &SelectPlan) -> StoreResult<Vec<Row>> {
        let select = build_select(plan);
        self.fetch(&select)
            .await?
            .iter()
            .map(|row| decode_row(row, &plan.fields))
            .collect()
    }

    async fn distinct_keys(
        &self,
        table: &TableRef,
        column: Column,
    ) -> StoreResult<HashSet<String>> {
        let select = Query::select()
            .distinct()
            .column(Alias::new(column.name()))
            .from(table_iden(table))
            .to_owned();
        let mut keys = HashSet::new();
        for row in &self.fetch(&select).await? {
            if let Some(key) = text(row, column.name())? {
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    async fn table_row_estimate(&self, table: &TableRef) -> StoreResult<Option<u64>> {
        let select = Query::select()
            .column(Alias::new("TABLE_ROWS"))
            .from((Alias::new("information_schema"), Alias::new("TABLES")))
            .and_where(Expr::col(Alias::new("TABLE_SCHEMA")).eq(table.schema.as_str()))
            .and_where(Expr::col(Alias::new("TABLE_NAME")).eq(table.table.as_str()))
            .limit(1)
            .to_owned();
        let rows = self.fetch(&select).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        row.try_get::<Option<u64>>("", "TABLE_ROWS")
            .map_err(|err| StoreError::decode("TABLE_ROWS", err.to_string()))
    }

    async fn count_by(&self, table: &TableRef, column: Column) -> StoreResult<Vec<GroupCount>> {
        let select = Query::select()
            .column(Alias::new(column.name()))
            .expr_as(Func::count(Expr::col(Asterisk)), Alias::new("num"))
            .from(table_iden(table))
            .group_by_col(Alias::new(column.name()))
            .order_by(Alias::new("num"), Order::Desc)
            .to_owned();
        self.fetch(&select)
            .await?
            .iter()
            .map(|row| {
                Ok(GroupCount {
                    value: text(row, column.name())?,
                    num: count(row, "num")?,
                })
            })
            .collect()
    }

    async fn count_by_day(&self, table: &TableRef, column: Column) -> StoreResult<Vec<DailyCount>> {
        let select = Query::select()
            .expr_as(
                Expr::cust(format!("DATE_FORMAT(`{}`, '%Y-%m-%d')", column.name())),
                Alias::new("date"),
            )
            .expr_as(Func::count(Expr::col(Asterisk)), Alias::new("num"))
            .from(table_iden(table))
            .and_where(Expr::col(Alias::new(column.name())).is_not_null())
            .group_by_col(Alias::new("date"))
            .order_by(Alias::new("date"), Order::Asc)
            .to_owned();
        let mut days = Vec::new();
        for row in &self.fetch(&select).await? {
            if let Some(date) = text(row, "date")? {
                days.push(DailyCount {
                    date,
                    num: count(row, "num")?,
                });
            }
        }
        Ok(days)
    }
}
