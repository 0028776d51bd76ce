//! # snaplog
//!
//! Reconstructs the change history of subnet metadata from a chain node that
//! can only answer "what did every subnet look like at height N?".
//!
//! The work happens in two stages:
//!
//! ```text
//! ┌──────────────┐  sample every   ┌──────────────┐  binary search  ┌──────────────┐
//! │ archive node │ ──────────────▶ │ approximate  │ ──────────────▶ │    exact     │
//! │  (JSON-RPC)  │  `stride` blocks│ changes.csv  │  each window    │ changes.csv  │
//! └──────────────┘                 └──────────────┘                 └──────────────┘
//! ```
//!
//! 1. **Scan**: fetch snapshots at a fixed stride through a bounded worker
//!    pool and diff each adjacent pair. Every change is known to within one
//!    stride window.
//! 2. **Refine**: binary-search each window for the exact height at which
//!    the field took its new value.
//!
//! ## Quick Start
//!
//! ```bash
//! snaplog head                  # check connectivity and the scan window
//! snaplog scan --stride 100     # approximate changes
//! snaplog refine                # exact heights
//! snaplog run                   # both stages
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`source`] | State source trait, JSON-RPC and in-memory sources |
//! | [`fetch`] | Failure-absorbing snapshot fetch |
//! | [`pool`] | Bounded worker pool |
//! | [`store`] | Fetched snapshots keyed by height |
//! | [`diff`] | Snapshot comparison |
//! | [`scan`] | Approximate scan |
//! | [`refine`] | Exact refinement |
//! | [`table`] | CSV tables and scan manifest |
//! | [`progress`] | Progress reporting |

pub mod config;
pub mod diff;
pub mod fetch;
pub mod models;
pub mod pool;
pub mod progress;
pub mod refine;
pub mod scan;
pub mod source;
pub mod store;
pub mod table;
