//! Drivers and references for exercising request handlers without any I/O.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::cancelable::{Cancelable, Canceled};
use crate::requests::{RequestDriver, RequestError};

/// A reference understood by [`MockDriver`].
///
/// The uid is taken verbatim. A higher `version` is preferred over a lower one, and an
/// `expires_at` in the past makes the reference expired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestRef {
    pub uid: String,
    pub version: u32,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TestRef {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            version: 0,
            expires_at: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// The data [`MockDriver`] produces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestData {
    pub uid: String,
    /// The version of the reference this was fetched with.
    pub version: u32,
    /// The sequence number of the fetch that produced it, starting at 1.
    pub fetch: usize,
}

#[derive(Debug, Default)]
struct MockState {
    failures: VecDeque<RequestError>,
    fetches: Vec<TestRef>,
    cleanups: Vec<TestData>,
}

#[derive(Debug, Default)]
struct MockInner {
    latency: Duration,
    failure_rate: f64,
    fetch_count: AtomicUsize,
    canceled: AtomicUsize,
    state: Mutex<MockState>,
}

/// A [`RequestDriver`] which records everything it is asked to do.
///
/// Fetches take `latency` and then fail with the next scripted failure, if any, or randomly
/// according to `failure_rate`. Clones share their recordings.
#[derive(Clone, Debug, Default)]
pub struct MockDriver {
    inner: Arc<MockInner>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the latency of every fetch. Must be called before the driver is shared.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.configure(|inner| inner.latency = latency)
    }

    /// Lets fetches fail randomly with [`RequestError::FetchError`].
    pub fn with_failure_rate(self, failure_rate: f64) -> Self {
        self.configure(|inner| inner.failure_rate = failure_rate.clamp(0.0, 1.0))
    }

    fn configure(self, f: impl FnOnce(&mut MockInner)) -> Self {
        let mut inner = Arc::try_unwrap(self.inner).unwrap_or_else(|shared| MockInner {
            latency: shared.latency,
            failure_rate: shared.failure_rate,
            ..Default::default()
        });
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Lets the next fetch fail with `error`. Failures queue up.
    pub fn fail_next(&self, error: RequestError) {
        self.inner.state.lock().unwrap().failures.push_back(error);
    }

    /// The number of fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.inner.fetch_count.load(AtomicOrdering::Relaxed)
    }

    /// The references of all fetches started so far.
    pub fn fetches(&self) -> Vec<TestRef> {
        self.inner.state.lock().unwrap().fetches.clone()
    }

    /// All data handed back for cleanup, in order.
    pub fn cleanups(&self) -> Vec<TestData> {
        self.inner.state.lock().unwrap().cleanups.clone()
    }

    /// The number of fetches which were canceled before they finished.
    pub fn canceled_count(&self) -> usize {
        self.inner.canceled.load(AtomicOrdering::Relaxed)
    }
}

impl RequestDriver for MockDriver {
    type Ref = TestRef;
    type Data = TestData;

    fn ref_uid(&self, reference: &TestRef) -> String {
        reference.uid.clone()
    }

    fn fetch(&self, reference: TestRef) -> Cancelable<Result<TestData, RequestError>> {
        let fetch = self.inner.fetch_count.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        let scripted = {
            let mut state = self.inner.state.lock().unwrap();
            state.fetches.push(reference.clone());
            state.failures.pop_front()
        };

        let inner = Arc::clone(&self.inner);
        Cancelable::spawn_with(move |token| async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    inner.canceled.fetch_add(1, AtomicOrdering::Relaxed);
                    return Err(Canceled);
                }
                _ = tokio::time::sleep(inner.latency) => {}
            }

            if let Some(error) = scripted {
                return Ok(Err(error));
            }
            if inner.failure_rate > 0.0 && rand::rng().random_bool(inner.failure_rate) {
                return Ok(Err(RequestError::FetchError("injected failure".into())));
            }
            Ok(Ok(TestData {
                uid: reference.uid,
                version: reference.version,
                fetch,
            }))
        })
    }

    fn compare_refs(&self, a: &TestRef, b: &TestRef) -> Ordering {
        a.version.cmp(&b.version)
    }

    fn is_expired(&self, reference: &TestRef, now: DateTime<Utc>) -> bool {
        reference.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    fn cleanup_data(&self, data: TestData) {
        self.inner.state.lock().unwrap().cleanups.push(data);
    }
}
