//! Periodic refresh of the environment cache.
//!
//! [`Refresher`] runs one refresh cycle: fetch every allowlisted environment, store documents
//! whose fingerprint changed and announce them through the [`ChangeNotifier`]. Environments that
//! failed to fetch keep serving their previous document.
//!
//! [`RefresherHandle`] drives a `Refresher` on a fixed interval in a background task.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::fetcher::{fetch_all, EnvironmentSource, FetchLimits};
use crate::{CacheStore, ChangeEvent, ChangeNotifier, EnvironmentKey, Error, FetchError, Result};

/// Summary of a completed refresh cycle.
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    /// Environments whose document changed (or was fetched for the first time).
    pub updated: Vec<EnvironmentKey>,
    /// Environments fetched successfully with an unchanged fingerprint.
    pub unchanged: Vec<EnvironmentKey>,
    /// Environments that failed to fetch and keep serving stale data.
    pub failed: Vec<FetchError>,
}

/// Result of [`Refresher::refresh_once`].
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// The cycle ran to completion.
    Completed(RefreshReport),
    /// Another cycle was already in flight, nothing was done.
    Skipped,
}

/// Runs refresh cycles over all keys of a [`CacheStore`].
pub struct Refresher {
    source: Arc<dyn EnvironmentSource>,
    store: Arc<CacheStore>,
    notifier: Arc<ChangeNotifier>,
    keys: Vec<EnvironmentKey>,
    limits: FetchLimits,
    refreshing: AtomicBool,
}

impl Refresher {
    /// Create a refresher for every key allowlisted in `store`.
    pub fn new(
        source: Arc<dyn EnvironmentSource>,
        store: Arc<CacheStore>,
        notifier: Arc<ChangeNotifier>,
        limits: FetchLimits,
    ) -> Refresher {
        let mut keys: Vec<EnvironmentKey> = store.keys().cloned().collect();
        keys.sort();

        Refresher {
            source,
            store,
            notifier,
            keys,
            limits,
            refreshing: AtomicBool::new(false),
        }
    }

    /// Whether a cycle is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Run a single refresh cycle.
    ///
    /// Returns [`RefreshOutcome::Skipped`] without doing anything if another cycle is in flight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TotalRefreshFailure`] if every configured environment failed to fetch. The
    /// cache is left untouched in that case.
    pub async fn refresh_once(&self) -> Result<RefreshOutcome> {
        let Some(_guard) = RefreshGuard::acquire(&self.refreshing) else {
            log::debug!(target: "edge_proxy", "refresh already in progress, skipping");
            return Ok(RefreshOutcome::Skipped);
        };

        log::debug!(target: "edge_proxy", "refreshing environments");
        let mut results = fetch_all(&*self.source, &self.keys, self.limits).await;

        let mut report = RefreshReport::default();
        for key in &self.keys {
            let Some(document) = results.documents.remove(key) else {
                continue;
            };

            if self.store.snapshot_fingerprint(key).as_ref() == Some(&document.fingerprint) {
                report.unchanged.push(key.clone());
                continue;
            }

            match self.store.set(key, document) {
                Ok(document) => {
                    log::info!(target: "edge_proxy", key = key, fingerprint = document.fingerprint.as_str(); "environment document updated");
                    self.notifier.publish(ChangeEvent {
                        key: key.clone(),
                        document,
                    });
                    report.updated.push(key.clone());
                }
                Err(err) => {
                    log::error!(target: "edge_proxy", key = key; "failed to store environment document: {err}");
                }
            }
        }

        for failure in &results.failures {
            log::warn!(target: "edge_proxy", key = &failure.key; "{failure}, serving stale document");
        }
        report.failed = results.failures;

        if !self.keys.is_empty() && report.failed.len() == self.keys.len() {
            log::error!(target: "edge_proxy", "refresh failed for every environment");
            return Err(Error::TotalRefreshFailure {
                failures: report.failed,
            });
        }

        log::debug!(
            target: "edge_proxy",
            "refresh finished: {} updated, {} unchanged, {} failed",
            report.updated.len(),
            report.unchanged.len(),
            report.failed.len()
        );
        Ok(RefreshOutcome::Completed(report))
    }
}

/// Resets the in-flight flag when the cycle ends, including on cancellation.
struct RefreshGuard<'a>(&'a AtomicBool);

impl<'a> RefreshGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<RefreshGuard<'a>> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RefreshGuard(flag))
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Configuration for [`RefresherHandle`].
#[derive(Debug, Clone)]
pub struct RefresherConfig {
    /// Interval between the starts of two refresh cycles.
    ///
    /// Defaults to [`RefresherConfig::DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
    /// Number of consecutive cycles in which every environment failed before the refresher gives
    /// up and reports [`Error::TotalRefreshFailure`] to its owner.
    ///
    /// Defaults to [`RefresherConfig::DEFAULT_MAX_TOTAL_FAILURES`].
    pub max_total_failures: u32,
}

impl RefresherConfig {
    /// Default value for [`RefresherConfig::interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
    /// Default value for [`RefresherConfig::max_total_failures`].
    pub const DEFAULT_MAX_TOTAL_FAILURES: u32 = 1;

    /// Create a new `RefresherConfig` using default configuration.
    pub fn new() -> RefresherConfig {
        RefresherConfig::default()
    }

    /// Update poll interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> RefresherConfig {
        self.interval = interval;
        self
    }

    /// Update the number of tolerated consecutive total failures.
    pub fn with_max_total_failures(mut self, max_total_failures: u32) -> RefresherConfig {
        self.max_total_failures = max_total_failures.max(1);
        self
    }
}

impl Default for RefresherConfig {
    fn default() -> RefresherConfig {
        RefresherConfig {
            interval: RefresherConfig::DEFAULT_POLL_INTERVAL,
            max_total_failures: RefresherConfig::DEFAULT_MAX_TOTAL_FAILURES,
        }
    }
}

/// A background task refreshing the cache on a fixed interval.
///
/// The first cycle starts immediately. Ticks that fire while a cycle is still running are dropped.
/// Dropping the handle stops the task.
pub struct RefresherHandle {
    join_handle: JoinHandle<Result<()>>,

    /// Used to send a stop command to the refresher task.
    stop_sender: watch::Sender<bool>,

    /// Holds `None` until the first cycle finishes, then the cycle result.
    first_refresh: watch::Receiver<Option<Result<()>>>,
}

impl RefresherHandle {
    /// Spawn the refresher task on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn spawn(refresher: Arc<Refresher>, config: RefresherConfig) -> RefresherHandle {
        let (stop_sender, stop_receiver) = watch::channel(false);
        let (first_refresh_sender, first_refresh) = watch::channel(None);

        let join_handle = tokio::spawn(run_refresh_loop(
            refresher,
            config,
            stop_receiver,
            first_refresh_sender,
        ));

        RefresherHandle {
            join_handle,
            stop_sender,
            first_refresh,
        }
    }

    /// Wait for the first refresh cycle that fetched at least one environment.
    ///
    /// Cycles in which every environment failed are tolerated up to
    /// [`RefresherConfig::max_total_failures`]; this keeps waiting through them.
    ///
    /// # Errors
    ///
    /// - [`Error::TotalRefreshFailure`] if the refresher gave up before any cycle succeeded.
    /// - [`Error::RefresherStopped`] if the task was stopped before a cycle succeeded.
    pub async fn wait_for_first_refresh(&self) -> Result<()> {
        let mut receiver = self.first_refresh.clone();
        let result = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::RefresherStopped)?
            .clone();
        result.unwrap_or(Err(Error::RefresherStopped))
    }

    /// Whether the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Stop the refresher task.
    ///
    /// This function does not wait for the task to actually stop.
    pub fn stop(&self) {
        self.stop_sender.send_replace(true);
    }

    /// Wait for the refresher task to exit on its own.
    ///
    /// Resolves with [`Error::TotalRefreshFailure`] when the refresher gave up on an unreachable
    /// upstream. Owners are expected to treat this as fatal.
    pub async fn wait(self) -> Result<()> {
        // The handle must stay alive while waiting: dropping `stop_sender` stops the task.
        let RefresherHandle {
            join_handle,
            stop_sender: _stop_sender,
            ..
        } = self;
        join_handle.await.map_err(|_| Error::RefresherPanicked)?
    }

    /// Stop the refresher task and wait for it to exit. An in-flight cycle is abandoned.
    ///
    /// Returns the fatal error if the task had already given up before being stopped.
    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .await
            .map_err(|_| Error::RefresherPanicked)?
    }
}

async fn run_refresh_loop(
    refresher: Arc<Refresher>,
    config: RefresherConfig,
    mut stop_receiver: watch::Receiver<bool>,
    first_refresh: watch::Sender<Option<Result<()>>>,
) -> Result<()> {
    let report_first = |result: Result<()>| {
        first_refresh.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
    };

    // `interval()` panics on a zero period.
    let mut ticker = tokio::time::interval(config.interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut consecutive_total_failures = 0;

    loop {
        // A closed channel means the handle was dropped, stop in that case as well.
        tokio::select! {
            biased;
            _ = stop_receiver.changed() => {
                log::debug!(target: "edge_proxy", "refresher received stop command");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            biased;
            _ = stop_receiver.changed() => {
                log::debug!(target: "edge_proxy", "refresher received stop command, abandoning refresh");
                return Ok(());
            }
            outcome = refresher.refresh_once() => outcome,
        };

        match outcome {
            Ok(RefreshOutcome::Completed(_)) => {
                consecutive_total_failures = 0;
                report_first(Ok(()));
            }
            Ok(RefreshOutcome::Skipped) => {}
            Err(err @ Error::TotalRefreshFailure { .. }) => {
                consecutive_total_failures += 1;
                if consecutive_total_failures >= config.max_total_failures {
                    log::error!(target: "edge_proxy", "giving up after {consecutive_total_failures} failed refresh cycles");
                    report_first(Err(err.clone()));
                    return Err(err);
                }
            }
            Err(err) => {
                report_first(Err(err.clone()));
                return Err(err);
            }
        }
    }
}
