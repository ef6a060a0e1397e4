use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::cancelable::{Cancelable, Canceled};
use crate::observable::Observable;

use super::{RefreshRef, RequestDriver, RequestError, RequestHandle, RequestHandler, RequestResult};

type SyncMapper<P, R> = Arc<dyn Fn(&P) -> Result<R, RequestError> + Send + Sync>;
type AsyncMapper<P, R> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<R, RequestError>> + Send + Sync>;
type CancelableMapper<P, R> = Arc<dyn Fn(P) -> Cancelable<Result<R, RequestError>> + Send + Sync>;
type RefChanged<R, P> = Arc<dyn Fn(Option<&R>, Option<&P>) + Send + Sync>;

/// Maps the data of the upstream request to the reference of the downstream request.
///
/// A mapper fails with [`RequestError::Unresolvable`] when the upstream data does not lead to a
/// downstream resource.
pub enum ChainedMapper<P, R> {
    /// Maps synchronously.
    Sync(SyncMapper<P, R>),
    /// Maps with a future, which is dropped when it loses a race.
    Async(AsyncMapper<P, R>),
    /// Maps with a cancelable operation, which is canceled when it loses a race.
    Cancelable(CancelableMapper<P, R>),
}

impl<P, R> ChainedMapper<P, R> {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&P) -> Result<R, RequestError> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RequestError>> + Send + 'static,
    {
        Self::Async(Arc::new(move |prev| f(prev).boxed()))
    }

    pub fn cancelable<F>(f: F) -> Self
    where
        F: Fn(P) -> Cancelable<Result<R, RequestError>> + Send + Sync + 'static,
    {
        Self::Cancelable(Arc::new(f))
    }
}

impl<P, R> Clone for ChainedMapper<P, R> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(f) => Self::Sync(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
            Self::Cancelable(f) => Self::Cancelable(Arc::clone(f)),
        }
    }
}

impl<P, R> fmt::Debug for ChainedMapper<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Sync(_) => "Sync",
            Self::Async(_) => "Async",
            Self::Cancelable(_) => "Cancelable",
        };
        f.debug_tuple("ChainedMapper").field(&kind).finish()
    }
}

/// Optional hooks of a chained request.
pub struct ChainedOptions<R, P> {
    on_ref_changed: Option<RefChanged<R, P>>,
}

impl<R, P> Default for ChainedOptions<R, P> {
    fn default() -> Self {
        Self {
            on_ref_changed: None,
        }
    }
}

impl<R, P> ChainedOptions<R, P> {
    /// Called with the derived reference and the upstream data it was derived from, and with
    /// `(None, None)` whenever the previous derivation is no longer valid.
    pub fn on_ref_changed<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&R>, Option<&P>) + Send + Sync + 'static,
    {
        self.on_ref_changed = Some(Arc::new(f));
        self
    }
}

struct Chain<P, R> {
    create_previous: Box<dyn Fn() -> RequestHandle<P> + Send + Sync>,
    /// The one upstream handle this chain holds, created on first need.
    previous: Mutex<Option<RequestHandle<P>>>,
    released: Observable<bool>,
    mapper: ChainedMapper<P, R>,
    on_ref_changed: Option<RefChanged<R, P>>,
}

/// Creates a request whose reference is derived from the data of another request.
///
/// The upstream request is created lazily with `create_previous` and held by the chain until the
/// returned handle is released. Whenever `handler` needs a (fresh) reference for the downstream
/// request, the chain waits for the upstream data and maps it with `mapper`:
///
/// - If the upstream request fails the first time after a re-derivation was asked for, it is
///   recreated once. Otherwise the error is propagated downstream.
/// - If a re-derivation was asked for while the upstream data is available, the upstream data is
///   reported expired first, since the downstream reference was most likely derived from it.
/// - If the upstream result changes while a mapper is running, the mapped value is discarded
///   and the upstream result is looked at again.
///
/// Releasing the returned handle releases the upstream request as well.
pub fn create_chained_request<P, D, F>(
    create_previous: F,
    handler: &RequestHandler<D>,
    mapper: ChainedMapper<P, D::Ref>,
    options: ChainedOptions<D::Ref, P>,
) -> RequestHandle<D::Data>
where
    P: Clone + Send + Sync + 'static,
    D: RequestDriver,
    F: Fn() -> RequestHandle<P> + Send + Sync + 'static,
{
    let chain = Arc::new(Chain {
        create_previous: Box::new(create_previous),
        previous: Mutex::new(None),
        released: Observable::deduplicated(false),
        mapper,
        on_ref_changed: options.on_ref_changed,
    });
    chain.ref_changed(None, None);

    let refresh = {
        let chain = Arc::clone(&chain);
        RefreshRef::new(move || chain.derive())
    };
    let raw = handler.request(None, refresh);

    let data = raw.data().clone();
    RequestHandle::new(data, move || {
        chain.released.set(true);
        raw.release();
        chain.release_previous();
    })
}

impl<P, R> Chain<P, R>
where
    P: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    fn ref_changed(&self, reference: Option<&R>, prev: Option<&P>) {
        if let Some(on_ref_changed) = &self.on_ref_changed {
            on_ref_changed(reference, prev);
        }
    }

    fn is_released(&self) -> bool {
        self.released.get()
    }

    fn release_previous(&self) {
        let previous = self.previous.lock().unwrap().take();
        if let Some(previous) = previous {
            previous.release();
            self.ref_changed(None, None);
        }
    }

    /// Replaces the upstream handle with a freshly created one.
    ///
    /// Returns `None` if the chain was released in the meantime.
    fn renew_previous(&self) -> Option<RequestHandle<P>> {
        let handle = (self.create_previous)();
        let mut previous = self.previous.lock().unwrap();
        if self.is_released() {
            drop(previous);
            handle.release();
            return None;
        }
        let old = previous.replace(handle.clone());
        drop(previous);

        if let Some(old) = old {
            old.release();
        }
        Some(handle)
    }

    fn derive(self: &Arc<Self>) -> Cancelable<Result<R, RequestError>> {
        let chain = Arc::clone(self);
        Cancelable::spawn_with(move |token| async move { chain.run(token).await })
    }

    /// Waits until `prev` changes after `version`, or the derivation is no longer wanted.
    async fn upstream_changed(
        &self,
        prev: &RequestHandle<P>,
        version: u64,
        token: &CancellationToken,
    ) {
        tokio::select! {
            _ = prev.data().changed_since(version) => {}
            _ = token.cancelled() => {}
            _ = self.released.wait_for(|released| *released) => {}
        }
    }

    async fn run(&self, token: CancellationToken) -> Result<Result<R, RequestError>, Canceled> {
        if token.is_cancelled() {
            return Err(Canceled);
        }
        if self.is_released() {
            return Ok(Err(RequestError::Released));
        }

        let existing = self.previous.lock().unwrap().clone();
        let (mut prev, mut should_refresh) = match existing {
            Some(prev) => (prev, true),
            None => match self.renew_previous() {
                Some(prev) => (prev, false),
                None => return Ok(Err(RequestError::Released)),
            },
        };

        loop {
            if self.is_released() {
                self.release_previous();
                return Ok(Err(RequestError::Released));
            }
            if token.is_cancelled() {
                return Err(Canceled);
            }

            let version = prev.data().version();
            let (data, report_expired) = match prev.get() {
                RequestResult::Loading => {
                    should_refresh = false;
                    self.upstream_changed(&prev, version, &token).await;
                    continue;
                }
                RequestResult::Released => {
                    // evicted from underneath us
                    should_refresh = false;
                    if let Some(renewed) = self.renew_previous() {
                        prev = renewed;
                    }
                    continue;
                }
                RequestResult::Error { error, .. } => {
                    if should_refresh {
                        should_refresh = false;
                        if let Some(renewed) = self.renew_previous() {
                            prev = renewed;
                        }
                        continue;
                    }
                    return Ok(Err(error));
                }
                RequestResult::Success {
                    data,
                    report_expired,
                } => (data, report_expired),
            };

            if should_refresh {
                should_refresh = false;
                self.ref_changed(None, None);
                report_expired.report();
                self.upstream_changed(&prev, version, &token).await;
                continue;
            }

            let mapped = match &self.mapper {
                ChainedMapper::Sync(map) => map(&data),
                ChainedMapper::Async(map) => {
                    let mapping = map(data.clone());
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => continue,
                        _ = self.released.wait_for(|released| *released) => continue,
                        _ = prev.data().changed_since(version) => continue,
                        mapped = mapping => mapped,
                    }
                }
                ChainedMapper::Cancelable(map) => {
                    let mut mapping = map(data.clone());
                    let outcome = tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        _ = self.released.wait_for(|released| *released) => None,
                        _ = prev.data().changed_since(version) => None,
                        mapped = &mut mapping => Some(mapped),
                    };
                    match outcome {
                        Some(mapped) => mapped?,
                        None => {
                            mapping.cancel();
                            let _ = mapping.await;
                            continue;
                        }
                    }
                }
            };

            if self.is_released() || token.is_cancelled() || prev.data().version() != version {
                continue;
            }

            match &mapped {
                Ok(reference) => self.ref_changed(Some(reference), Some(&data)),
                Err(_) => self.ref_changed(None, Some(&data)),
            }
            return Ok(mapped);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::config::HandlerConfig;
    use crate::test::{MockDriver, TestRef};

    use super::*;

    type Changes = Arc<Mutex<Vec<(Option<String>, Option<usize>)>>>;

    fn upstream_handler() -> RequestHandler<MockDriver> {
        RequestHandler::new(
            MockDriver::new().with_latency(Duration::from_millis(100)),
            HandlerConfig::named("contents"),
        )
    }

    fn downstream_handler() -> RequestHandler<MockDriver> {
        RequestHandler::new(
            MockDriver::new().with_latency(Duration::from_millis(100)),
            HandlerConfig::named("exports"),
        )
    }

    fn create_previous(
        upstream: &RequestHandler<MockDriver>,
    ) -> impl Fn() -> RequestHandle<crate::test::TestData> + Send + Sync + 'static {
        let upstream = upstream.clone();
        move || upstream.request(Some(TestRef::new("content")), RefreshRef::never())
    }

    fn recording_options(changes: &Changes) -> ChainedOptions<TestRef, crate::test::TestData> {
        let changes = Arc::clone(changes);
        ChainedOptions::default().on_ref_changed(move |reference, prev| {
            changes.lock().unwrap().push((
                reference.map(|r: &TestRef| r.uid.clone()),
                prev.map(|data: &crate::test::TestData| data.fetch),
            ));
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_mapper() {
        let upstream = upstream_handler();
        let downstream = downstream_handler();
        let changes = Changes::default();

        let handle = create_chained_request(
            create_previous(&upstream),
            &downstream,
            ChainedMapper::sync(|data: &crate::test::TestData| {
                Ok(TestRef::new(format!("export-of-{}", data.uid)))
            }),
            recording_options(&changes),
        );

        let result = handle.settled().await;
        assert_eq!(result.data().unwrap().uid, "export-of-content");
        assert_eq!(upstream.driver().fetch_count(), 1);
        assert_eq!(downstream.driver().fetches()[0].uid, "export-of-content");

        handle.release();
        assert_eq!(
            *changes.lock().unwrap(),
            vec![
                (None, None),
                (Some("export-of-content".into()), Some(1)),
                (None, None),
            ]
        );
        // both requests are now unused
        assert_eq!(upstream.stale_len(), 1);
        assert_eq!(downstream.stale_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_mapping_is_an_error() {
        let upstream = upstream_handler();
        let downstream = downstream_handler();

        let handle = create_chained_request(
            create_previous(&upstream),
            &downstream,
            ChainedMapper::sync(|_: &crate::test::TestData| {
                Err(RequestError::Unresolvable("cannot chain".into()))
            }),
            ChainedOptions::default(),
        );

        let result = handle.settled().await;
        assert!(matches!(
            result.error(),
            Some(RequestError::Unresolvable(_))
        ));
        assert_eq!(downstream.driver().fetch_count(), 0);
        handle.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_error_propagates() {
        let upstream = upstream_handler();
        upstream.driver().fail_next(RequestError::NotFound);
        let downstream = downstream_handler();

        let handle = create_chained_request(
            create_previous(&upstream),
            &downstream,
            ChainedMapper::sync(|data: &crate::test::TestData| Ok(TestRef::new(&data.uid))),
            ChainedOptions::default(),
        );

        let result = handle.settled().await;
        assert_eq!(result.error(), Some(&RequestError::NotFound));
        assert_eq!(downstream.driver().fetch_count(), 0);
        handle.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_mid_map_cancels_mapper() {
        let upstream = upstream_handler();
        let downstream = downstream_handler();
        let canceled = Arc::new(AtomicUsize::new(0));
        let changes = Changes::default();

        let mapper = {
            let canceled = Arc::clone(&canceled);
            ChainedMapper::cancelable(move |data: crate::test::TestData| {
                let canceled = Arc::clone(&canceled);
                Cancelable::spawn_with(move |token| async move {
                    tokio::select! {
                        _ = token.cancelled() => {
                            canceled.fetch_add(1, Ordering::Relaxed);
                            Err(Canceled)
                        }
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {
                            Ok(Ok(TestRef::new(data.uid)))
                        }
                    }
                })
            })
        };

        let handle = create_chained_request(
            create_previous(&upstream),
            &downstream,
            mapper,
            recording_options(&changes),
        );

        // upstream resolves after 100ms, the mapper is running afterwards
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(upstream.len(), 1);
        assert_eq!(upstream.stale_len(), 0);

        handle.release();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(canceled.load(Ordering::Relaxed), 1);
        assert_eq!(upstream.stale_len(), 1);
        assert_eq!(downstream.driver().fetch_count(), 0);
        assert_eq!(
            changes.lock().unwrap().last(),
            Some(&(None::<String>, None::<usize>))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_change_restarts_mapping() {
        let upstream = upstream_handler();
        let downstream = downstream_handler();
        let mapped = Arc::new(Mutex::new(Vec::new()));

        let mapper = {
            let mapped = Arc::clone(&mapped);
            ChainedMapper::future(move |data: crate::test::TestData| {
                let mapped = Arc::clone(&mapped);
                async move {
                    mapped.lock().unwrap().push(data.fetch);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(TestRef::new(format!("export-{}", data.fetch)))
                }
            })
        };

        let handle = create_chained_request(
            create_previous(&upstream),
            &downstream,
            mapper,
            ChainedOptions::default(),
        );

        // let the upstream resolve and the first mapping start
        tokio::time::sleep(Duration::from_millis(300)).await;
        let observer = upstream.request(Some(TestRef::new("content")), RefreshRef::never());
        observer.get().report_expired();

        let result = handle.settled().await;
        assert_eq!(result.data().unwrap().uid, "export-2");
        assert_eq!(*mapped.lock().unwrap(), vec![1, 2]);

        let fetched: Vec<_> = downstream
            .driver()
            .fetches()
            .into_iter()
            .map(|r| r.uid)
            .collect();
        assert_eq!(fetched, vec!["export-2".to_owned()]);

        observer.release();
        handle.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_downstream_expiry_refreshes_upstream() {
        let upstream = upstream_handler();
        let downstream = downstream_handler();

        let handle = create_chained_request(
            create_previous(&upstream),
            &downstream,
            ChainedMapper::sync(|data: &crate::test::TestData| {
                Ok(TestRef::new("export").with_version(data.fetch as u32))
            }),
            ChainedOptions::default(),
        );
        handle.settled().await.report_expired();

        let result = handle.settled().await;
        assert!(result.data().is_some());
        // the upstream was reported expired before deriving a new reference
        assert_eq!(upstream.driver().fetch_count(), 2);
        let versions: Vec<_> = downstream
            .driver()
            .fetches()
            .into_iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
        handle.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rederived_reference_moves_to_its_own_entry() {
        let upstream = upstream_handler();
        let downstream = downstream_handler();

        let handle = create_chained_request(
            create_previous(&upstream),
            &downstream,
            ChainedMapper::sync(|data: &crate::test::TestData| {
                Ok(TestRef::new(format!("export-{}", data.fetch)))
            }),
            ChainedOptions::default(),
        );
        let first = handle.settled().await;
        assert_eq!(first.data().unwrap().uid, "export-1");

        first.report_expired();
        let moved = handle
            .data()
            .wait_for(|result| result.data().is_some())
            .await;
        assert_eq!(moved.data().unwrap().uid, "export-2");

        // the entry of the old export was given up, not reused for the new one
        assert_eq!(downstream.len(), 1);
        let cleaned: Vec<_> = downstream
            .driver()
            .cleanups()
            .into_iter()
            .map(|data| data.uid)
            .collect();
        assert_eq!(cleaned, vec!["export-1".to_owned()]);

        let direct = downstream.request(Some(TestRef::new("export-1")), RefreshRef::never());
        assert_eq!(direct.settled().await.data().unwrap().uid, "export-1");

        let fetched: Vec<_> = downstream
            .driver()
            .fetches()
            .into_iter()
            .map(|r| r.uid)
            .collect();
        assert_eq!(fetched, vec!["export-1", "export-2", "export-1"]);

        direct.release();
        handle.release();
    }
}
