//! Per-source scan coalescing.
//!
//! A [`ScanCoalescingCache`] guarantees at most one scan in flight per
//! source. A caller arriving while a scan runs gets the last snapshot back
//! immediately instead of queueing behind it. A failed scan leaves the
//! previous snapshot in place: stale-but-present beats empty.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::discovery::SourceError;
use crate::logging::Logger;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStatus {
    /// This call ran the scan body and stored its result.
    Fresh,
    /// Another scan was in flight; the cached snapshot was returned.
    Coalesced,
    /// The scan body failed; the cached snapshot was returned unchanged.
    Failed(SourceError),
}

#[derive(Debug, Clone)]
pub struct ScanOutcome<T> {
    pub snapshot: Arc<T>,
    pub status: ScanStatus,
}

impl<T> ScanOutcome<T> {
    pub fn is_fresh(&self) -> bool {
        self.status == ScanStatus::Fresh
    }

    pub fn error(&self) -> Option<&SourceError> {
        match &self.status {
            ScanStatus::Failed(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct ScanState<T> {
    cached: Arc<T>,
    is_running: bool,
}

pub struct ScanCoalescingCache<T> {
    name: String,
    state: Mutex<ScanState<T>>,
    logger: Logger,
}

impl<T> std::fmt::Debug for ScanCoalescingCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanCoalescingCache")
            .field("name", &self.name)
            .field("is_running", &self.is_running())
            .finish()
    }
}

impl<T: Default> ScanCoalescingCache<T> {
    pub fn new(name: &str, logger: Logger) -> Self {
        Self::with_initial(name, T::default(), logger)
    }
}

impl<T> ScanCoalescingCache<T> {
    pub fn with_initial(name: &str, initial: T, logger: Logger) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(ScanState {
                cached: Arc::new(initial),
                is_running: false,
            }),
            logger,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> Arc<T> {
        Arc::clone(&self.lock().cached)
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_running
    }

    /// Runs `body` unless a scan is already in flight for this source.
    ///
    /// The lock is only held to flip the running flag and swap the snapshot,
    /// never across `body`.
    pub fn scan<F>(&self, body: F) -> ScanOutcome<T>
    where
        F: FnOnce() -> Result<T, SourceError>,
    {
        {
            let mut state = self.lock();
            if state.is_running {
                self.logger
                    .debug(format!("{}: scan in flight, serving cached snapshot", self.name));
                return ScanOutcome {
                    snapshot: Arc::clone(&state.cached),
                    status: ScanStatus::Coalesced,
                };
            }
            state.is_running = true;
        }

        let _running = RunningGuard { cache: self };
        let result = catch_unwind(AssertUnwindSafe(body))
            .unwrap_or_else(|payload| Err(SourceError::Panicked(panic_message(&*payload))));

        let mut state = self.lock();
        match result {
            Ok(value) => {
                state.cached = Arc::new(value);
                ScanOutcome {
                    snapshot: Arc::clone(&state.cached),
                    status: ScanStatus::Fresh,
                }
            }
            Err(error) => {
                self.logger.warn(format!(
                    "{}: scan failed, keeping previous snapshot: {error}",
                    self.name
                ));
                ScanOutcome {
                    snapshot: Arc::clone(&state.cached),
                    status: ScanStatus::Failed(error),
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScanState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the running flag on every exit path out of `scan`.
struct RunningGuard<'a, T> {
    cache: &'a ScanCoalescingCache<T>,
}

impl<T> Drop for RunningGuard<'_, T> {
    fn drop(&mut self) {
        self.cache.lock().is_running = false;
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic payload unavailable".to_string())
}
