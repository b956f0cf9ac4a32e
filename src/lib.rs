//! revtally: per-user, per-namespace edit counts for a MediaWiki site
//!
//! The crate walks every revision ID in `[1, total]`, asks the wiki's
//! `api.php` who authored each revision and in which namespace, and folds the
//! answers into one table:
//!
//! 1. **Download** -- The ID space is split into fixed-size chunks (one API
//!    request each) and the chunks into contiguous worker shares. One tokio
//!    task per share fetches its chunks in order, retrying transient failures
//!    with bounded backoff, and persists every response
//! 2. **Aggregate** -- The ID space is split again into report slices. Each
//!    slice is counted from the cached chunks (fetching any that are still
//!    missing), checkpointed, and the slice tables are tree-reduced
//! 3. **Report** -- The final table is written as CSV, one row per user and
//!    one column per namespace
//!
//! Both phases resume: cached chunks are never fetched twice and valid slice
//! checkpoints are never recomputed.
//!
//! # Key Modules
//!
//! - [`partition`] -- ID ranges, chunk layout, worker shares and report slices
//! - [`client`] -- `RevisionSource` seam and the MediaWiki HTTP client
//! - [`fetch`] -- Retry policy and the chunk fetcher
//! - [`cache`] -- Write-once chunk store
//! - [`extract`] -- Counting a window of IDs from cached chunks
//! - [`merge`] -- Combining tables of disjoint ranges
//! - [`checkpoint`] -- Versioned slice checkpoints
//! - [`pipeline`] -- Download and aggregation driver
//! - [`report`] -- Namespace catalog and CSV output
//! - [`models`] -- Revision records and edit tables
//! - [`error`] -- Fetch error taxonomy
//! - [`stats`] -- Atomic counters for the run summary
//! - [`config`] -- Constants and the optional settings file
//!
//! # Example Usage
//!
//! ```bash
//! # Fetch and count revisions 1..=1200000, writing editcount-<timestamp>.csv
//! revtally run --total 1200000 -d data/
//!
//! # Recount from the cached chunks, discarding old slice checkpoints
//! revtally aggregate --total 1200000 -d data/ --clean -o counts.csv
//! ```

pub mod cache;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod merge;
pub mod models;
pub mod partition;
pub mod pipeline;
pub mod report;
pub mod stats;
