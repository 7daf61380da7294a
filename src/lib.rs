//! An in-memory environment document cache for feature flag edge proxies.
//!
//! # Overview
//!
//! An edge proxy answers high-volume flag requests from a local copy of *environment documents*:
//! the flags, segments and identity overrides of a tenant environment, as served by the upstream
//! management API. This crate keeps that copy fresh and tells streaming clients when it changes.
//! Flag evaluation and HTTP routing happen outside of it.
//!
//! [`EdgeProxy`] is the context object holding everything together. Create one from a
//! [`ProxyConfig`] at startup and share it with request handlers.
//!
//! [`CacheStore`] holds the latest [`EnvironmentDocument`] per allowlisted [`EnvironmentKey`].
//! Documents are immutable and replaced as a whole, so a reader always sees a consistent snapshot.
//!
//! [`UpstreamFetcher`](fetcher::UpstreamFetcher) fetches documents from the management API.
//! Environments are fetched independently and concurrently (up to a limit), each request bounded
//! by a timeout.
//!
//! [`Refresher`] runs refresh cycles: it stores documents whose [`Fingerprint`] changed and
//! publishes a [`ChangeEvent`] for each of them through the [`ChangeNotifier`]. Environments that
//! failed to fetch keep serving their last good document. [`RefresherHandle`] runs the refresher
//! on a fixed interval in a tokio task.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Per-environment fetch failures never reach
//! readers: they are logged and the stale document keeps being served. A cycle in which *every*
//! environment failed is reported as [`Error::TotalRefreshFailure`]; the refresher task then exits
//! and [`RefresherHandle::wait()`] hands the error to the owner, which is expected to restart the
//! process.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages under
//! the `edge_proxy` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into refresh operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod fetcher;

mod cache_store;
mod config;
mod environment;
mod error;
mod notifier;
mod proxy;
mod refresher;

pub use cache_store::CacheStore;
pub use config::ProxyConfig;
pub use environment::{EnvironmentDocument, EnvironmentKey, Fingerprint};
pub use error::{Error, FetchError, FetchErrorCause, Result};
pub use notifier::{ChangeEvent, ChangeNotifier, Subscription};
pub use proxy::EdgeProxy;
pub use refresher::{RefreshOutcome, RefreshReport, Refresher, RefresherConfig, RefresherHandle};
