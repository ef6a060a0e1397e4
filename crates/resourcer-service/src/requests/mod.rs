//! # Request coordination
//!
//! Many parts of an application need the same remote resources at the same time, and those
//! resources are usually authorized by short-lived tokens. This module makes sure every resource
//! is fetched once no matter how many consumers want it, that it stays alive exactly as long as
//! somebody uses it, and that expired authorization leads to a refetch instead of a failure.
//!
//! ## Request Lifecycle
//!
//! A consumer asks a [`RequestHandler`] for a reference and gets back a [`RequestHandle`]. The
//! handle carries an [`Observable`](crate::observable::Observable) of [`RequestResult`]s:
//!
//! - `Loading` while the data is fetched,
//! - `Success` once it is available, together with a way to report it as expired,
//! - `Error` when fetching failed, with the time of the next attempt if one is scheduled,
//! - `Released` once the request was destroyed.
//!
//! Requests are keyed by the uid the [`RequestDriver`] derives from their reference. The first
//! request for a uid creates a cache entry and starts a fetch. Every other request for the same
//! uid attaches to that entry and observes the very same results. When several references map
//! to the same uid, [`RequestDriver::compare_refs`] decides which one is used for the next fetch.
//!
//! Failed fetches are retried with exponential backoff according to [`RetryConfig`], unless the
//! error makes another attempt pointless. After the retries are exhausted, the error stays
//! published until the data is reported expired, replaced, or the entry is picked up again by a
//! new consumer after everybody had released it.
//!
//! Once the last consumer releases its handle, the entry becomes stale. Stale entries are kept
//! around for reuse in an LRU bounded by `max_stale`, optionally only for `stale_ttl`. A fetch
//! still in flight at that point is canceled, unless `keep_active_requests_into_stale` is set.
//! Destroying an entry publishes `Released` and hands its data to
//! [`RequestDriver::cleanup_data`] exactly once.
//!
//! ## Chained Requests
//!
//! [`create_chained_request`] derives the reference of one request from the data of another,
//! and re-derives it whenever the downstream request needs a fresh reference.
//! [`unwrap_request_result`] turns a (swappable) handle into an observable of just its data.
//!
//! ### Metrics
//!
//! Every metric is tagged with the `handler` name:
//!
//! - `requests.access`: All requests with a reference.
//! - `requests.dedup_hit`: Requests served by an existing entry.
//! - `requests.fetch`: Fetches actually started.
//! - `requests.fetch.error`: Failed fetches.
//! - `requests.retry`: Retries after a failure.
//! - `requests.evicted`: Destroyed entries.
//! - `requests.cleanup`: Data handed to the driver for cleanup.

#[macro_use]
mod log;

mod chained;
mod driver;
mod entry;
mod error;
mod handler;
mod result;
mod retry;
mod store;
mod unwrap;

pub use chained::*;
pub use driver::*;
pub use error::*;
pub use handler::*;
pub use log::LogMode;
pub use result::*;
pub use retry::*;
pub use unwrap::*;
