use std::cmp::Ordering as RefOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use sentry::{Hub, SentryFutureExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cancelable::{Cancelable, Canceled};
use crate::clock::ServerClock;
use crate::config::HandlerConfig;
use crate::observable::{Observable, SubscriptionId};
use crate::utils::defer::defer;

use super::entry::{Entry, EntryState, Settle};
use super::log::RequestLog;
use super::store::Store;
use super::{
    ExpireReporter, RefreshRef, RequestDriver, RequestError, RequestHandle, RequestResult,
};

/// What [`RequestHandler::evict_or_replace`] should do with a cached request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replacement<D> {
    /// Publish this data instead of the cached data, without fetching.
    Data(D),
    /// Fetch the data again.
    MakeRequest,
}

/// Deduplicates, caches and reference-counts requests for one kind of resource.
///
/// Requests are identified by the uid of their reference. All concurrent requests for the same
/// uid share one fetch and observe the same [`RequestResult`]s. See the [module
/// docs](super) for the full lifecycle.
///
/// The handler is cheap to clone; clones share their state.
pub struct RequestHandler<D: RequestDriver> {
    shared: Arc<Shared<D>>,
}

impl<D: RequestDriver> Clone for RequestHandler<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<D: RequestDriver> {
    driver: D,
    config: HandlerConfig,
    clock: ServerClock,
    log: RequestLog,
    store: Mutex<Store<D>>,
    next_consumer: AtomicU64,
}

enum Refreshed<R> {
    Ref(R),
    Keep,
    /// The refresher had no new reference, its consumer may have moved on.
    Released,
    Canceled,
    Failed(RequestError),
}

impl<D: RequestDriver> RequestHandler<D> {
    pub fn new(driver: D, config: HandlerConfig) -> Self {
        Self::with_clock(driver, config, ServerClock::new())
    }

    /// Creates a handler which checks authorization expiry against `clock`.
    pub fn with_clock(driver: D, config: HandlerConfig, clock: ServerClock) -> Self {
        let log = RequestLog::new(config.name.clone(), config.logging);
        let store = Store::new(config.cache.max_stale);
        Self {
            shared: Arc::new(Shared {
                driver,
                config,
                clock,
                log,
                store: Mutex::new(store),
                next_consumer: AtomicU64::new(0),
            }),
        }
    }

    pub fn driver(&self) -> &D {
        &self.shared.driver
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.shared.config
    }

    pub fn clock(&self) -> &ServerClock {
        &self.shared.clock
    }

    /// Requests the data for `reference`.
    ///
    /// Without a reference, the returned handle stays [`RequestResult::Loading`] until
    /// `refresh` produces one. With a reference, the handle attaches to the cache entry of its
    /// uid, creating it and starting a fetch if necessary.
    ///
    /// `refresh` is used whenever a fresh reference is needed: after the data was reported as
    /// expired, when the authorization of the current reference expired, or after the
    /// remote rejected it with [`RequestError::Expired`].
    pub fn request(
        &self,
        reference: Option<D::Ref>,
        refresh: RefreshRef<D::Ref>,
    ) -> RequestHandle<D::Data> {
        match reference {
            Some(reference) => self.shared.attach(reference, refresh),
            None => self.request_unresolved(refresh),
        }
    }

    fn request_unresolved(&self, refresh: RefreshRef<D::Ref>) -> RequestHandle<D::Data> {
        let data = Observable::new(RequestResult::Loading);
        let link = Arc::new(Link {
            released: CancellationToken::new(),
            attached: Mutex::new(None),
        });

        let task = {
            let shared = Arc::clone(&self.shared);
            let data = data.clone();
            let link = Arc::clone(&link);
            async move {
                let mut refreshing = refresh.refresh();
                let result = tokio::select! {
                    biased;
                    _ = link.released.cancelled() => {
                        refreshing.cancel();
                        let _ = refreshing.await;
                        return;
                    }
                    result = &mut refreshing => result,
                };

                match result {
                    Ok(Ok(reference)) => {
                        let uid = shared.driver.ref_uid(&reference);
                        let refresh = relink(
                            Arc::downgrade(&shared),
                            Arc::downgrade(&link),
                            data.clone(),
                            refresh,
                        );
                        let inner = shared.attach(reference, refresh);
                        link.attach(uid, inner, &data);
                    }
                    Ok(Err(RequestError::Released)) | Err(Canceled) => {
                        request_log!(shared, "no reference was produced");
                    }
                    Ok(Err(error)) => {
                        request_log!(shared, "failed to resolve a reference: {error}");
                        if !link.released.is_cancelled() {
                            data.set(RequestResult::Error {
                                error,
                                retry_at: None,
                            });
                        }
                    }
                }
            }
        };
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        RequestHandle::new(data, move || link.release())
    }

    /// Replaces or refetches the cached data for `reference`, if there is any.
    ///
    /// `updater` receives the currently published data. Superseded data is cleaned up.
    pub fn evict_or_replace<F>(&self, reference: &D::Ref, updater: F)
    where
        F: FnOnce(Option<&D::Data>) -> Replacement<D::Data>,
    {
        let uid = self.shared.driver.ref_uid(reference);
        self.evict_or_replace_uid(&uid, updater)
    }

    /// Like [`evict_or_replace`](Self::evict_or_replace), addressing the entry by uid.
    pub fn evict_or_replace_uid<F>(&self, uid: &str, updater: F)
    where
        F: FnOnce(Option<&D::Data>) -> Replacement<D::Data>,
    {
        let entry = self.shared.store.lock().unwrap().get(uid).cloned();
        let Some(entry) = entry else {
            request_log!(self.shared, "nothing to evict for {uid}");
            return;
        };
        let current = entry.state.lock().unwrap().published.clone();
        let replacement = updater(current.as_ref());
        drop(current);
        self.shared.apply_replacement(&entry, replacement);
    }

    /// Releases every request of this handler, whether it is still in use or not.
    pub fn evict_all(&self) {
        let settles: Vec<_> = {
            let mut store = self.shared.store.lock().unwrap();
            store
                .drain()
                .into_iter()
                .map(|entry| {
                    let mut state = entry.state.lock().unwrap();
                    entry.retire(&mut state)
                })
                .collect()
        };
        request_log!(self.shared, "evicted all {} entries", settles.len());
        for settle in settles {
            self.shared.evicted(settle);
        }
    }

    /// The number of cached requests, used or not.
    pub fn len(&self) -> usize {
        let store = self.shared.store.lock().unwrap();
        store.active_len() + store.stale_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of cached requests nobody holds.
    pub fn stale_len(&self) -> usize {
        self.shared.store.lock().unwrap().stale_len()
    }

    /// The buffered log lines, when logging in [`LogMode::Buffer`](super::LogMode::Buffer).
    pub fn log_buffer(&self) -> Vec<String> {
        self.shared.log.lines()
    }
}

impl<D: RequestDriver> fmt::Debug for RequestHandler<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandler")
            .field("name", &self.shared.config.name)
            .field("len", &self.len())
            .finish()
    }
}

impl<D: RequestDriver> Shared<D> {
    fn cleanup(&self, data: D::Data) {
        metric!(counter("requests.cleanup") += 1, "handler" => self.config.name.as_str());
        self.driver.cleanup_data(data);
    }

    fn settle(&self, settle: Settle<D::Data>) {
        settle.finish(|data| self.cleanup(data));
    }

    fn evicted(&self, settle: Settle<D::Data>) {
        metric!(counter("requests.evicted") += 1, "handler" => self.config.name.as_str());
        self.settle(settle);
    }

    fn attach(self: &Arc<Self>, reference: D::Ref, refresh: RefreshRef<D::Ref>) -> RequestHandle<D::Data> {
        let name = self.config.name.as_str();
        metric!(counter("requests.access") += 1, "handler" => name);

        let uid = self.driver.ref_uid(&reference);
        let consumer = self.next_consumer.fetch_add(1, Ordering::Relaxed);

        let (entry, settle) = loop {
            let existing = self.store.lock().unwrap().get(&uid).cloned();

            let Some(entry) = existing else {
                let mut store = self.store.lock().unwrap();
                if store.get(&uid).is_some() {
                    continue;
                }
                let entry = Arc::new(Entry::new(uid.clone(), reference.clone()));
                store.insert(Arc::clone(&entry));

                let mut state = entry.state.lock().unwrap();
                state.consumers.push((consumer, refresh.clone()));
                let settle = self.begin_cycle(&entry, &mut state, false);
                drop(state);
                drop(store);

                request_log!(self, "created {uid} from {reference:?}");
                break (entry, settle);
            };

            let current = entry.state.lock().unwrap().reference.clone();
            let preferred = self.driver.compare_refs(&reference, &current) == RefOrdering::Greater;

            let mut store = self.store.lock().unwrap();
            let mut state = entry.state.lock().unwrap();
            if state.destroyed {
                // destroyed while comparing, look again
                continue;
            }
            store.activate(&entry);
            if preferred {
                request_log!(self, "{uid}: preferring {reference:?} over {current:?}");
                state.reference = reference.clone();
            }

            let was_unused = state.consumers.is_empty();
            state.consumers.push((consumer, refresh.clone()));
            let settle = if was_unused && state.exhausted {
                request_log!(self, "{uid}: retrying failed request for new consumer");
                self.begin_cycle(&entry, &mut state, false)
            } else {
                Settle::none()
            };
            drop(state);
            drop(store);

            metric!(counter("requests.dedup_hit") += 1, "handler" => name);
            break (entry, settle);
        };
        self.settle(settle);

        let shared = Arc::clone(self);
        let data = entry.data.clone();
        RequestHandle::new(data, move || shared.release(&entry, consumer))
    }

    /// Starts a new fetch cycle, canceling the one in flight.
    ///
    /// Must be called with the entry's `state` locked.
    fn begin_cycle(
        self: &Arc<Self>,
        entry: &Arc<Entry<D>>,
        state: &mut EntryState<D>,
        refresh_first: bool,
    ) -> Settle<D::Data> {
        if let Some(cycle) = state.cycle.take() {
            cycle.cancel();
        }
        state.generation += 1;
        state.exhausted = false;

        let token = CancellationToken::new();
        state.cycle = Some(token.clone());

        let settle = if entry.data.with(RequestResult::is_loading) {
            Settle::none().and_cleanup(state.published.take())
        } else {
            entry.publish(state, RequestResult::Loading)
        };

        let task = Arc::clone(self).run_cycle(
            Arc::clone(entry),
            state.generation,
            token,
            refresh_first,
        );
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        settle
    }

    async fn run_cycle(
        self: Arc<Self>,
        entry: Arc<Entry<D>>,
        generation: u64,
        token: CancellationToken,
        mut refresh_first: bool,
    ) {
        let _done = {
            let entry = Arc::clone(&entry);
            defer(move || {
                let mut state = entry.state.lock().unwrap();
                if state.generation == generation {
                    state.cycle = None;
                }
            })
        };

        let mut attempt = 0;
        loop {
            let Some((mut reference, refresher)) = self.current_reference(&entry, generation) else {
                return;
            };

            if refresh_first || self.driver.is_expired(&reference, self.clock.now()) {
                match self.refresh_reference(&entry, generation, &token, refresher).await {
                    Refreshed::Ref(refreshed) => reference = refreshed,
                    Refreshed::Keep => {}
                    Refreshed::Released => {
                        if self.abandon_unused(&entry, generation) {
                            return;
                        }
                    }
                    Refreshed::Canceled => return,
                    Refreshed::Failed(error) => {
                        if self.fail(&entry, generation, &token, &error, &mut attempt).await {
                            refresh_first = true;
                            continue;
                        }
                        return;
                    }
                }
            }

            request_log!(self, "{}: fetching {reference:?}, attempt {}", entry.uid, attempt + 1);
            metric!(counter("requests.fetch") += 1, "handler" => self.config.name.as_str());

            let mut fetch = self.driver.fetch(reference);
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    fetch.cancel();
                    if let Ok(Ok(data)) = fetch.await {
                        // nobody will ever see this
                        self.cleanup(data);
                    }
                    request_log!(self, "{}: fetch canceled", entry.uid);
                    return;
                }
                result = &mut fetch => result,
            };

            match result.unwrap_or(Err(RequestError::InternalError)) {
                Ok(data) => {
                    self.succeed(&entry, generation, data);
                    return;
                }
                Err(error) => {
                    if !self.fail(&entry, generation, &token, &error, &mut attempt).await {
                        return;
                    }
                    refresh_first = error == RequestError::Expired;
                }
            }
        }
    }

    fn current_reference(
        &self,
        entry: &Entry<D>,
        generation: u64,
    ) -> Option<(D::Ref, Option<RefreshRef<D::Ref>>)> {
        let state = entry.state.lock().unwrap();
        if state.generation != generation || state.destroyed {
            return None;
        }
        let refresher = state.consumers.last().map(|(_, refresh)| refresh.clone());
        Some((state.reference.clone(), refresher))
    }

    async fn refresh_reference(
        &self,
        entry: &Entry<D>,
        generation: u64,
        token: &CancellationToken,
        refresher: Option<RefreshRef<D::Ref>>,
    ) -> Refreshed<D::Ref> {
        let Some(refresher) = refresher else {
            return Refreshed::Keep;
        };
        request_log!(self, "{}: refreshing reference", entry.uid);

        let mut refreshing = refresher.refresh();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                refreshing.cancel();
                let _ = refreshing.await;
                return Refreshed::Canceled;
            }
            result = &mut refreshing => result,
        };

        match result {
            Ok(Ok(reference)) => {
                let uid = self.driver.ref_uid(&reference);
                if uid != entry.uid {
                    tracing::warn!(
                        handler = %self.config.name,
                        expected = %entry.uid,
                        actual = %uid,
                        "Refreshed reference has a different uid"
                    );
                    return Refreshed::Failed(RequestError::Unresolvable(format!(
                        "refreshed reference is for {uid}"
                    )));
                }
                let mut state = entry.state.lock().unwrap();
                if state.generation == generation {
                    state.reference = reference.clone();
                }
                Refreshed::Ref(reference)
            }
            Ok(Err(RequestError::Released)) => Refreshed::Released,
            Err(Canceled) => Refreshed::Keep,
            Ok(Err(error)) => Refreshed::Failed(error),
        }
    }

    /// Destroys the entry if nobody uses it anymore.
    ///
    /// Returns whether the cycle of `generation` is over.
    fn abandon_unused(&self, entry: &Arc<Entry<D>>, generation: u64) -> bool {
        let mut store = self.store.lock().unwrap();
        let mut state = entry.state.lock().unwrap();
        if state.generation != generation || state.destroyed {
            return true;
        }
        if !state.consumers.is_empty() {
            return false;
        }
        store.remove(entry);
        let settle = entry.retire(&mut state);
        drop(state);
        drop(store);

        request_log!(self, "{}: abandoned by its last consumer, destroyed", entry.uid);
        self.evicted(settle);
        true
    }

    /// Publishes `result` unless the cycle of `generation` was superseded.
    fn publish(&self, entry: &Entry<D>, generation: u64, result: RequestResult<D::Data>) -> bool {
        let mut state = entry.state.lock().unwrap();
        if state.generation != generation || state.destroyed {
            return false;
        }
        let settle = entry.publish(&mut state, result);
        drop(state);
        self.settle(settle);
        true
    }

    fn succeed(self: &Arc<Self>, entry: &Arc<Entry<D>>, generation: u64, data: D::Data) {
        let mut state = entry.state.lock().unwrap();
        if state.generation != generation || state.destroyed {
            drop(state);
            self.cleanup(data);
            return;
        }
        request_log!(self, "{}: success", entry.uid);
        let report_expired = self.expire_reporter(entry, generation);
        let settle = entry.publish(
            &mut state,
            RequestResult::Success {
                data,
                report_expired,
            },
        );
        state.cycle = None;
        drop(state);
        self.settle(settle);
    }

    /// Handles a failed attempt. Returns whether the cycle should try again.
    async fn fail(
        &self,
        entry: &Entry<D>,
        generation: u64,
        token: &CancellationToken,
        error: &RequestError,
        attempt: &mut u32,
    ) -> bool {
        let name = self.config.name.as_str();
        metric!(counter("requests.fetch.error") += 1, "handler" => name);

        let retry = &self.config.retry;
        if error.is_retryable() && *attempt < retry.max_retries {
            let delay = retry.backoff(*attempt, error);
            *attempt += 1;
            request_log!(self, "{}: {error}, retrying in {delay:?}", entry.uid);

            let pending = RequestResult::Error {
                error: error.clone(),
                retry_at: Some(Instant::now() + delay),
            };
            if !self.publish(entry, generation, pending) {
                return false;
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            metric!(counter("requests.retry") += 1, "handler" => name);
            return self.publish(entry, generation, RequestResult::Loading);
        }

        request_log!(self, "{}: {error}, giving up after {attempt} retries", entry.uid);
        let mut state = entry.state.lock().unwrap();
        if state.generation != generation || state.destroyed {
            return false;
        }
        state.exhausted = true;
        state.cycle = None;
        let settle = entry.publish(
            &mut state,
            RequestResult::Error {
                error: error.clone(),
                retry_at: None,
            },
        );
        drop(state);
        self.settle(settle);

        self.log
            .flush(&format!("Request {} failed for good: {error}", entry.uid));
        false
    }

    fn expire_reporter(self: &Arc<Self>, entry: &Arc<Entry<D>>, generation: u64) -> ExpireReporter {
        let shared = Arc::downgrade(self);
        let entry = Arc::downgrade(entry);
        ExpireReporter::new(move || {
            if let (Some(shared), Some(entry)) = (shared.upgrade(), entry.upgrade()) {
                shared.report_expired(&entry, generation);
            }
        })
    }

    fn report_expired(self: &Arc<Self>, entry: &Arc<Entry<D>>, generation: u64) {
        let mut store = self.store.lock().unwrap();
        let mut state = entry.state.lock().unwrap();
        if state.generation != generation || state.destroyed {
            drop(state);
            drop(store);
            request_log!(self, "{}: ignoring outdated expiry report", entry.uid);
            return;
        }

        if state.consumers.is_empty() {
            store.remove(entry);
            let settle = entry.retire(&mut state);
            drop(state);
            drop(store);
            request_log!(self, "{}: expired without consumers, destroyed", entry.uid);
            self.evicted(settle);
        } else {
            let settle = self.begin_cycle(entry, &mut state, true);
            drop(state);
            drop(store);
            request_log!(self, "{}: expired, refetching", entry.uid);
            self.settle(settle);
        }
    }

    fn release(self: &Arc<Self>, entry: &Arc<Entry<D>>, consumer: u64) {
        let mut store = self.store.lock().unwrap();
        let mut state = entry.state.lock().unwrap();

        let position = state.consumers.iter().position(|(id, _)| *id == consumer);
        let Some(position) = position else {
            return;
        };
        let removed = state.consumers.remove(position);
        if !state.consumers.is_empty() {
            drop(state);
            drop(store);
            drop(removed);
            return;
        }
        state.stale_epoch += 1;

        let cache = &self.config.cache;
        let mut settles = Vec::new();
        if state.cycle.is_some() && !cache.keep_active_requests_into_stale {
            store.remove(entry);
            settles.push(entry.retire(&mut state));
        } else {
            for victim in store.make_stale(entry) {
                if Arc::ptr_eq(&victim, entry) {
                    settles.push(entry.retire(&mut state));
                } else {
                    let mut victim_state = victim.state.lock().unwrap();
                    settles.push(victim.retire(&mut victim_state));
                }
            }
            if let Some(ttl) = cache.stale_ttl.filter(|_| !state.destroyed) {
                self.schedule_stale_expiry(entry, state.stale_epoch, ttl);
            }
        }
        let destroyed = state.destroyed;
        drop(state);
        drop(store);
        drop(removed);

        request_log!(
            self,
            "{}: last consumer released, {}",
            entry.uid,
            if destroyed { "destroyed" } else { "kept as stale" }
        );
        for settle in settles {
            self.evicted(settle);
        }
    }

    fn schedule_stale_expiry(self: &Arc<Self>, entry: &Arc<Entry<D>>, epoch: u64, ttl: Duration) {
        let shared = Arc::downgrade(self);
        let entry = Arc::downgrade(entry);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let (Some(shared), Some(entry)) = (shared.upgrade(), entry.upgrade()) {
                shared.expire_stale(&entry, epoch);
            }
        });
    }

    fn expire_stale(&self, entry: &Arc<Entry<D>>, epoch: u64) {
        let mut store = self.store.lock().unwrap();
        let mut state = entry.state.lock().unwrap();
        if state.destroyed || !state.consumers.is_empty() || state.stale_epoch != epoch {
            return;
        }
        store.remove(entry);
        let settle = entry.retire(&mut state);
        drop(state);
        drop(store);

        request_log!(self, "{}: unused for too long, destroyed", entry.uid);
        self.evicted(settle);
    }

    fn apply_replacement(self: &Arc<Self>, entry: &Arc<Entry<D>>, replacement: Replacement<D::Data>) {
        let mut store = self.store.lock().unwrap();
        let mut state = entry.state.lock().unwrap();
        if state.destroyed {
            drop(state);
            drop(store);
            if let Replacement::Data(data) = replacement {
                self.cleanup(data);
            }
            return;
        }

        match replacement {
            Replacement::Data(data) => {
                if let Some(cycle) = state.cycle.take() {
                    cycle.cancel();
                }
                state.generation += 1;
                state.exhausted = false;
                let report_expired = self.expire_reporter(entry, state.generation);
                let settle = entry.publish(
                    &mut state,
                    RequestResult::Success {
                        data,
                        report_expired,
                    },
                );
                drop(state);
                drop(store);
                request_log!(self, "{}: data replaced", entry.uid);
                self.settle(settle);
            }
            Replacement::MakeRequest if state.consumers.is_empty() => {
                store.remove(entry);
                let settle = entry.retire(&mut state);
                drop(state);
                drop(store);
                request_log!(self, "{}: evicted", entry.uid);
                self.evicted(settle);
            }
            Replacement::MakeRequest => {
                let settle = self.begin_cycle(entry, &mut state, false);
                drop(state);
                drop(store);
                request_log!(self, "{}: evicted, refetching", entry.uid);
                self.settle(settle);
            }
        }
    }
}

/// Connects a request started without a reference to the entry it eventually resolves to.
struct Link<T> {
    released: CancellationToken,
    attached: Mutex<Option<Attached<T>>>,
}

struct Attached<T> {
    uid: String,
    handle: RequestHandle<T>,
    subscription: SubscriptionId,
}

impl<T: Clone + Send + 'static> Link<T> {
    fn uid(&self) -> Option<String> {
        let attached = self.attached.lock().unwrap();
        attached.as_ref().map(|attached| attached.uid.clone())
    }

    /// Mirrors `inner` into `outer`, releasing the entry mirrored so far.
    fn attach(&self, uid: String, inner: RequestHandle<T>, outer: &Observable<RequestResult<T>>) {
        let mut attached = self.attached.lock().unwrap();
        if self.released.is_cancelled() {
            drop(attached);
            inner.release();
            return;
        }

        let subscription = {
            let source = inner.data().clone();
            let outer = outer.clone();
            inner.data().subscribe(move || {
                outer.set(source.get());
            })
        };
        let current = inner.get();
        let previous = attached.replace(Attached {
            uid,
            handle: inner,
            subscription,
        });
        if let Some(previous) = &previous {
            previous.handle.data().unsubscribe(previous.subscription);
        }
        drop(attached);

        outer.set(current);
        if let Some(previous) = previous {
            previous.handle.release();
        }
    }

    fn release(&self) {
        self.released.cancel();
        let attached = self.attached.lock().unwrap().take();
        if let Some(attached) = attached {
            attached.handle.data().unsubscribe(attached.subscription);
            attached.handle.release();
        }
    }
}

/// Wraps the refresher of a request started without a reference.
///
/// A refreshed reference for another uid is never handed to the current entry. Instead, the
/// request moves over to the entry of the new uid and the current entry is left alone.
fn relink<D: RequestDriver>(
    shared: Weak<Shared<D>>,
    link: Weak<Link<D::Data>>,
    outer: Observable<RequestResult<D::Data>>,
    refresh: RefreshRef<D::Ref>,
) -> RefreshRef<D::Ref> {
    RefreshRef::new(move || {
        let (Some(strong_shared), Some(strong_link)) = (shared.upgrade(), link.upgrade()) else {
            return Cancelable::resolved(Err(RequestError::Released));
        };
        if strong_link.released.is_cancelled() {
            return Cancelable::resolved(Err(RequestError::Released));
        }

        let shared = shared.clone();
        let link = link.clone();
        let outer = outer.clone();
        let refresh = refresh.clone();
        refresh.refresh().map(move |result: Result<D::Ref, RequestError>| {
            let reference = result?;
            let uid = strong_shared.driver.ref_uid(&reference);
            if strong_link.released.is_cancelled() {
                return Err(RequestError::Released);
            }
            if strong_link.uid().as_deref() == Some(uid.as_str()) {
                return Ok(reference);
            }

            request_log!(strong_shared, "moving request over to {uid}");
            let refresh = relink(shared, link, outer.clone(), refresh);
            let inner = strong_shared.attach(reference, refresh);
            strong_link.attach(uid, inner, &outer);
            Err(RequestError::Released)
        })
    })
}
