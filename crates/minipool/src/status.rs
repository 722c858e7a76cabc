//! Concurrent per-minipool status queries.
//!
//! Every id gets its own query task. With [`FanOut::Unbounded`] all of them
//! are in flight at once; [`FanOut::Bounded`] caps the number of concurrent
//! queries with a semaphore. Results are collected in completion order.
//!
//! [`StatusAggregator::fetch_all`] is all-or-nothing: the first failed query
//! aborts the rest and already-collected statuses are dropped.
//! [`StatusAggregator::fetch_partial`] waits for every query and returns the
//! successes next to the per-minipool failures.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use stakenode_core::{ChainError, MinipoolAddress, MinipoolDetails};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::collaborators::ChainState;

/// Concurrency of a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOut {
    #[default]
    Unbounded,
    /// At most this many queries in flight. Zero is treated as one.
    Bounded(usize),
}

impl FanOut {
    pub fn width(&self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Bounded(n) => Some((*n).max(1)),
        }
    }
}

/// Why an all-or-nothing fan-out produced nothing.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("query for minipool {minipool} failed: {source}")]
    QueryFailed {
        minipool: MinipoolAddress,
        #[source]
        source: ChainError,
    },
    #[error("query worker lost: {0}")]
    WorkerLost(String),
}

/// Everything a partial fan-out produced.
#[derive(Debug, Clone)]
pub struct Partial<T> {
    pub values: HashMap<MinipoolAddress, T>,
    pub failures: HashMap<MinipoolAddress, ChainError>,
}

impl<T> Partial<T> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

type QueryResult<T> = (MinipoolAddress, Result<T, ChainError>);

fn spawn_queries<T, F, Fut>(ids: &[MinipoolAddress], fan_out: FanOut, query: F) -> JoinSet<QueryResult<T>>
where
    T: Send + 'static,
    F: Fn(MinipoolAddress) -> Fut,
    Fut: Future<Output = Result<T, ChainError>> + Send + 'static,
{
    let permits = fan_out.width().map(|w| Arc::new(Semaphore::new(w)));
    let mut set = JoinSet::new();
    for &minipool in ids {
        let fut = query(minipool);
        let permits = permits.clone();
        set.spawn(async move {
            let _permit = match permits {
                Some(p) => p.acquire_owned().await.ok(),
                None => None,
            };
            let result = AssertUnwindSafe(fut)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ChainError::Rpc("query panicked".to_string())));
            (minipool, result)
        });
    }
    set
}

/// Run `query` for every id; first error aborts everything.
pub async fn query_all<T, F, Fut>(
    ids: &[MinipoolAddress],
    fan_out: FanOut,
    query: F,
) -> Result<HashMap<MinipoolAddress, T>, AggregationError>
where
    T: Send + 'static,
    F: Fn(MinipoolAddress) -> Fut,
    Fut: Future<Output = Result<T, ChainError>> + Send + 'static,
{
    let mut set = spawn_queries(ids, fan_out, query);
    let mut values = HashMap::with_capacity(ids.len());

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((minipool, Ok(value))) => {
                values.insert(minipool, value);
            }
            Ok((minipool, Err(source))) => {
                set.abort_all();
                warn!(
                    minipool = %minipool,
                    error = %source,
                    discarded = values.len(),
                    "query failed, aborting fan-out"
                );
                return Err(AggregationError::QueryFailed { minipool, source });
            }
            Err(e) => {
                set.abort_all();
                return Err(AggregationError::WorkerLost(e.to_string()));
            }
        }
    }

    Ok(values)
}

/// Run `query` for every id and keep whatever succeeded.
pub async fn query_partial<T, F, Fut>(ids: &[MinipoolAddress], fan_out: FanOut, query: F) -> Partial<T>
where
    T: Send + 'static,
    F: Fn(MinipoolAddress) -> Fut,
    Fut: Future<Output = Result<T, ChainError>> + Send + 'static,
{
    let mut set = spawn_queries(ids, fan_out, query);
    let mut pending: HashSet<MinipoolAddress> = ids.iter().copied().collect();
    let mut partial = Partial {
        values: HashMap::with_capacity(ids.len()),
        failures: HashMap::new(),
    };

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((minipool, Ok(value))) => {
                pending.remove(&minipool);
                partial.values.insert(minipool, value);
            }
            Ok((minipool, Err(e))) => {
                pending.remove(&minipool);
                debug!(minipool = %minipool, error = %e, "query failed");
                partial.failures.insert(minipool, e);
            }
            Err(e) => warn!(error = %e, "query worker lost"),
        }
    }

    // Whatever never reported back belongs to a lost worker.
    for minipool in pending {
        partial
            .failures
            .insert(minipool, ChainError::Rpc("query worker lost".to_string()));
    }

    partial
}

/// Fetches minipool details for a set of addresses.
#[derive(Clone)]
pub struct StatusAggregator {
    chain: Arc<dyn ChainState>,
    fan_out: FanOut,
}

impl StatusAggregator {
    /// Aggregator querying `chain` with the given concurrency.
    pub fn new(chain: Arc<dyn ChainState>, fan_out: FanOut) -> Self {
        Self { chain, fan_out }
    }

    pub fn fan_out(&self) -> FanOut {
        self.fan_out
    }

    /// All statuses, or the first error.
    pub async fn fetch_all(
        &self,
        ids: &[MinipoolAddress],
    ) -> Result<HashMap<MinipoolAddress, MinipoolDetails>, AggregationError> {
        let chain = Arc::clone(&self.chain);
        query_all(ids, self.fan_out, move |minipool| {
            let chain = Arc::clone(&chain);
            async move { chain.minipool_details(minipool).await }
        })
        .await
    }

    /// Statuses that could be fetched plus the per-minipool failures.
    pub async fn fetch_partial(&self, ids: &[MinipoolAddress]) -> Partial<MinipoolDetails> {
        let chain = Arc::clone(&self.chain);
        query_partial(ids, self.fan_out, move |minipool| {
            let chain = Arc::clone(&chain);
            async move { chain.minipool_details(minipool).await }
        })
        .await
    }
}
