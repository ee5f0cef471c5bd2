//! Execution of time-series metric queries against a regional metrics API.
//!
//! The remote API evaluates three kinds of queries, see [`Classification`]. It caps the number of
//! entries per request and caps search expressions much more tightly. This crate takes a set of
//! user-authored [`RequestQuery`]s and turns them into as few requests as possible:
//!
//!  1. Each request query is validated and [expanded](expand) into one [`FlattenedQuery`] per
//!     statistic. Input errors are attributed to the ref id of the offending query.
//!  2. The flattened queries are grouped by region and packed into [`Batch`]es by the
//!     [`BatchBuilder`].
//!  3. The [`RegionDispatcher`] sends every region's batches concurrently, one task per region.
//!  4. All answers are [regrouped](regroup) into one [`QueryResult`] per ref id, with series
//!     sorted by name.
//!
//! The [`Executor`] runs all of these steps. Clients for the remote API are supplied by the caller
//! through a [`ClientFactory`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use metriq_query::{BatchLimits, ClientFactory, DispatchConfig, Executor, QueryContext, QueryType};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run(factory: Arc<dyn ClientFactory>, context: QueryContext) {
//!     let executor = Executor::new(factory, BatchLimits::default(), DispatchConfig::default());
//!     let cancel = CancellationToken::new();
//!
//!     match executor.query(QueryType::TimeSeries, context, &cancel).await {
//!         Ok(results) => {
//!             for (ref_id, result) in results {
//!                 metriq_log::info!(ref_id = %ref_id, series = result.series.len(), "query done");
//!             }
//!         }
//!         Err(error) => metriq_log::error!(error = &error as &dyn std::error::Error),
//!     }
//! }
//! ```

#![warn(missing_docs)]

mod batch;
mod client;
mod dispatch;
mod error;
mod executor;
mod query;
mod response;
mod transform;

pub use self::batch::*;
pub use self::client::*;
pub use self::dispatch::*;
pub use self::error::*;
pub use self::executor::*;
pub use self::query::*;
pub use self::response::*;
pub use self::transform::*;
