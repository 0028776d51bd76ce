//! Bounded worker pool for RPC-heavy work.
//!
//! Archive nodes rate-limit aggressively, so every batch of snapshot queries
//! goes through a [`WorkerPool`] whose size is the concurrency limit. The pool
//! starts exactly `limit` workers that pull items from a shared queue; a
//! worker only takes its next item after the previous one has completed
//! (successfully or not), so the number of in-flight calls never exceeds the
//! limit.
//!
//! Results are funnelled through a channel to a single collector, which is
//! the only code that touches the caller's result container. Workers and the
//! collector are polled cooperatively on the calling task; nothing is
//! spawned, so borrowed sources and closures work without `'static` bounds.
//!
//! ```rust
//! # use snaplog::pool::{ConcurrencyLimit, WorkerPool};
//! # tokio_test_block_on(async {
//! let pool = WorkerPool::new(ConcurrencyLimit::new(2).unwrap());
//! let mut squares = Vec::new();
//! pool.run(1..=4u64, |n| async move { n * n }, |sq| squares.push(sq)).await;
//! squares.sort();
//! assert_eq!(squares, vec![1, 4, 9, 16]);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::mpsc;

/// Maximum number of concurrently executing tasks. Defaults to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "usize")]
pub struct ConcurrencyLimit(NonZeroUsize);

impl ConcurrencyLimit {
    pub fn new(limit: usize) -> Result<Self> {
        NonZeroUsize::new(limit)
            .map(Self)
            .ok_or_else(|| anyhow!("concurrency limit must be >= 1"))
    }

    pub fn get(&self) -> usize {
        self.0.get()
    }
}

impl Default for ConcurrencyLimit {
    fn default() -> Self {
        Self(NonZeroUsize::MIN)
    }
}

impl TryFrom<usize> for ConcurrencyLimit {
    type Error = anyhow::Error;

    fn try_from(value: usize) -> Result<Self> {
        Self::new(value)
    }
}

impl FromStr for ConcurrencyLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let n: usize = s
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid concurrency limit: '{}'", s))?;
        Self::new(n)
    }
}

impl fmt::Display for ConcurrencyLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-size pool of cooperative workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerPool {
    limit: ConcurrencyLimit,
}

impl WorkerPool {
    pub fn new(limit: ConcurrencyLimit) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> ConcurrencyLimit {
        self.limit
    }

    /// Run `work` over every item and hand each result to `collect`.
    ///
    /// Returns once every item has been processed and collected. Results
    /// arrive at `collect` in completion order, which need not match the
    /// order of `items`.
    pub async fn run<I, T, W, Fut, C>(
        &self,
        items: impl IntoIterator<Item = I>,
        work: W,
        mut collect: C,
    ) where
        W: Fn(I) -> Fut,
        Fut: Future<Output = T>,
        C: FnMut(T),
    {
        let queue: Mutex<VecDeque<I>> = Mutex::new(items.into_iter().collect());
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();

        let queue = &queue;
        let work = &work;
        let workers: Vec<_> = (0..self.limit.get())
            .map(|_| {
                let tx = tx.clone();
                async move {
                    loop {
                        let next = queue
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .pop_front();
                        let Some(item) = next else { break };
                        let result = work(item).await;
                        if tx.send(result).is_err() {
                            break;
                        }
                    }
                }
            })
            .collect();
        // Only worker-held senders remain, so the channel closes when the last worker exits.
        drop(tx);

        let drain = async {
            while let Some(result) = rx.recv().await {
                collect(result);
            }
        };

        tokio::join!(join_all(workers), drain);
    }
}
