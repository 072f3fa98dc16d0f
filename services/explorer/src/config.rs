use std::{str::FromStr, time::Duration};

use store::PoolOptions;
use tracing::warn;

use crate::{
    api::ExplorerOptions,
    epochs::RefreshPolicy,
    review::{AntiJoinPolicy, DEFAULT_MAX_REVIEWED_ROWS},
};

const DEFAULT_PORT: u16 = 8081;
const DEFAULT_SQL_HOST: &str = "127.0.0.1:3306";
const DEFAULT_METADATABASE: &str = "metadata";
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    MySql,
    /// Seeded in-process store, for local runs without a database.
    Memory,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorerConfig {
    pub backend: StoreBackend,
    pub database_url: String,
    pub metadatabase: String,
    pub bind_addr: String,
    pub http_workers: usize,
    pub pool: PoolOptions,
    pub query_timeout: Option<Duration>,
    pub epoch_refresh: RefreshPolicy,
    pub anti_join: AntiJoinPolicy,
}

impl ExplorerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let backend = match env.first(&["EXPLORER_STORE_BACKEND"]).as_deref() {
            None | Some("mysql") => StoreBackend::MySql,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                warn!(value = other, "unknown EXPLORER_STORE_BACKEND; using mysql");
                StoreBackend::MySql
            }
        };

        let port = env
            .parse_first::<u16>(&["PORT"])
            .unwrap_or(DEFAULT_PORT);
        let bind_addr = env
            .first(&["EXPLORER_BIND"])
            .unwrap_or_else(|| format!("0.0.0.0:{port}"));

        let http_workers = env
            .parse_first::<usize>(&["EXPLORER_HTTP_WORKERS"])
            .filter(|workers| *workers > 0)
            .unwrap_or_else(default_http_workers);

        let query_timeout = match env.first(&["EXPLORER_QUERY_TIMEOUT_MS"]).as_deref() {
            Some("off") | Some("0") => None,
            _ => Some(Duration::from_millis(
                env.parse_first::<u64>(&["EXPLORER_QUERY_TIMEOUT_MS"])
                    .unwrap_or(DEFAULT_QUERY_TIMEOUT_MS),
            )),
        };

        let max_reviewed_rows = env
            .parse_first::<u64>(&["EXPLORER_ANTI_JOIN_MAX_REVIEWED_ROWS"])
            .unwrap_or(DEFAULT_MAX_REVIEWED_ROWS);
        let anti_join = env
            .parse_first::<AntiJoinPolicy>(&["EXPLORER_ANTI_JOIN_STRATEGY"])
            .unwrap_or_default()
            .with_max_reviewed_rows(max_reviewed_rows);

        Self {
            backend,
            database_url: database_url(&env),
            metadatabase: env
                .first(&["EXPLORER_METADATABASE", "METADATABASE"])
                .unwrap_or_else(|| DEFAULT_METADATABASE.to_string()),
            bind_addr,
            http_workers,
            pool: PoolOptions {
                max_connections: env.parse_first::<u32>(&["EXPLORER_DB_MAX_CONNECTIONS"]),
                connect_timeout: env
                    .parse_first::<u64>(&["EXPLORER_DB_CONNECT_TIMEOUT_MS"])
                    .map(Duration::from_millis),
                acquire_timeout: env
                    .parse_first::<u64>(&["EXPLORER_DB_ACQUIRE_TIMEOUT_MS"])
                    .map(Duration::from_millis),
            },
            query_timeout,
            epoch_refresh: RefreshPolicy::from_ttl_secs(
                env.parse_first::<u64>(&["EXPLORER_EPOCH_CACHE_TTL_SECS"]),
            ),
            anti_join,
        }
    }

    pub fn options(&self) -> ExplorerOptions {
        ExplorerOptions {
            epoch_refresh: self.epoch_refresh,
            anti_join: self.anti_join,
            query_timeout: self.query_timeout,
        }
    }

    /// The connection URL with any password masked, for logging.
    pub fn redacted_database_url(&self) -> String {
        let Some((scheme, rest)) = self.database_url.split_once("://") else {
            return self.database_url.clone();
        };
        match rest.split_once('@') {
            Some((userinfo, host)) => {
                let user = userinfo.split(':').next().unwrap_or_default();
                format!("{scheme}://{user}:***@{host}")
            }
            None => self.database_url.clone(),
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .find_map(|key| (self.lookup)(key).filter(|value| !value.trim().is_empty()))
    }

    fn parse_first<T: FromStr>(&self, keys: &[&str]) -> Option<T> {
        for key in keys {
            if let Some(value) = (self.lookup)(key) {
                match value.trim().parse::<T>() {
                    Ok(parsed) => return Some(parsed),
                    Err(_) => warn!(key = *key, value = %value, "ignoring unparseable setting"),
                }
            }
        }
        None
    }
}

fn database_url<F>(env: &Env<F>) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = env.first(&["EXPLORER_DATABASE_URL"]) {
        return url;
    }
    let user = env
        .first(&["EXPLORER_SQL_USER", "SQL_USER"])
        .unwrap_or_else(|| "root".to_string());
    let password = env
        .first(&["EXPLORER_SQL_PASSWORD", "SQL_PASSWORD"])
        .unwrap_or_default();
    let userinfo = if password.is_empty() {
        encode_userinfo(&user)
    } else {
        format!("{}:{}", encode_userinfo(&user), encode_userinfo(&password))
    };

    let production = env.first(&["NODE_ENV"]).as_deref() == Some("production");
    if production
        && let Some(instance) =
            env.first(&["EXPLORER_INSTANCE_CONNECTION_NAME", "INSTANCE_CONNECTION_NAME"])
    {
        return format!("mysql://{userinfo}@localhost/?socket=/cloudsql/{instance}");
    }
    let host = env
        .first(&["EXPLORER_SQL_HOST", "SQL_HOST"])
        .unwrap_or_else(|| DEFAULT_SQL_HOST.to_string());
    format!("mysql://{userinfo}@{host}")
}

/// Percent-encodes the characters that would break the userinfo part of a URL.
fn encode_userinfo(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn default_http_workers() -> usize {
    std::thread::available_parallelism()
        .map(|parallelism| parallelism.get().clamp(1, 32))
        .unwrap_or(4)
}
