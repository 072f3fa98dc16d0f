use std::{future::Future, time::Duration};

use store::{StoreError, StoreResult};

/// Upper bound applied to every individual backing fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryDeadline {
    timeout: Option<Duration>,
}

impl QueryDeadline {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout: timeout.filter(|timeout| !timeout.is_zero()),
        }
    }

    pub fn disabled() -> Self {
        Self { timeout: None }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub async fn run<T, F>(&self, fetch: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let Some(limit) = self.timeout else {
            return fetch.await;
        };
        match tokio::time::timeout(limit, fetch).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(
                u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }
}
