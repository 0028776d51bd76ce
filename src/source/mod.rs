//! State source abstraction.
//!
//! The chain is only ever asked two questions: "what is the current height?"
//! and "what did the full subnet set look like at height N?". Anything that
//! can answer them implements [`SnapshotSource`]:
//!
//! | Implementation | Backend |
//! |----------------|---------|
//! | [`JsonRpcSource`] | JSON-RPC 2.0 over HTTP against an archive node |
//! | [`MemorySource`] | In-memory synthetic history for tests and dry runs |

pub mod memory;
pub mod rpc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Height, Snapshot};

pub use memory::MemorySource;
pub use rpc::JsonRpcSource;

/// A point-in-time query interface over a chain's subnet registry.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Short human-readable description (e.g. the endpoint URL).
    fn describe(&self) -> String;

    /// Returns the most recent height the source can answer for.
    async fn current_height(&self) -> Result<Height>;

    /// Returns every subnet as it existed at `height`.
    ///
    /// Any error (transport, timeout, node error, decoding) is reported as
    /// `Err`; callers decide whether that is fatal.
    async fn snapshot_at(&self, height: Height) -> Result<Snapshot>;
}
