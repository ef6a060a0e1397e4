use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::observable::{Observable, SubscriptionId};

use super::{RequestHandle, RequestResult};

type Projection<T, U> = Box<dyn Fn(Option<&RequestResult<T>>) -> U + Send + Sync>;

struct Unwrapper<T, U> {
    source: Observable<Option<RequestHandle<T>>>,
    output: Observable<U>,
    /// The result observable of the handle currently in `source`, and our subscription to it.
    bound: Mutex<Option<(Observable<RequestResult<T>>, SubscriptionId)>>,
    project: Projection<T, U>,
}

impl<T, U> Unwrapper<T, U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
{
    /// Follows the handle in `source`, moving the subscription over if it was swapped.
    fn rebind(self: &Arc<Self>) {
        let current = self
            .source
            .with(|handle| handle.as_ref().map(|handle| handle.data().clone()));

        let mut bound = self.bound.lock().unwrap();
        let unchanged = match (bound.as_ref(), current.as_ref()) {
            (Some((bound, _)), Some(current)) => bound.ptr_eq(current),
            (None, None) => true,
            _ => false,
        };
        if !unchanged {
            if let Some((old, subscription)) = bound.take() {
                old.unsubscribe(subscription);
            }
            if let Some(current) = current {
                let subscription = current.subscribe(Self::callback(Arc::downgrade(self), false));
                *bound = Some((current, subscription));
            }
        }
        drop(bound);

        self.refresh();
    }

    fn refresh(&self) {
        let data = self
            .bound
            .lock()
            .unwrap()
            .as_ref()
            .map(|(data, _)| data.clone());
        let value = match data {
            Some(data) => (self.project)(Some(&data.get())),
            None => (self.project)(None),
        };
        self.output.set(value);
    }

    fn callback(this: Weak<Self>, rebind: bool) -> impl Fn() + Send + Sync + 'static {
        move || {
            let Some(this) = this.upgrade() else {
                return;
            };
            if rebind {
                this.rebind();
            } else {
                this.refresh();
            }
        }
    }

    fn unbind(&self) {
        let bound = self.bound.lock().unwrap().take();
        if let Some((data, subscription)) = bound {
            data.unsubscribe(subscription);
        }
    }
}

/// Keeps an unwrapped observable up to date. Dropping it stops the updates.
pub struct Unwrapped {
    detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Unwrapped {
    /// Removes every subscription made on behalf of the unwrapped observable.
    ///
    /// The observable keeps its last value.
    pub fn detach(&self) {
        let detach = self.detach.lock().unwrap().take();
        if let Some(detach) = detach {
            detach();
        }
    }
}

impl Drop for Unwrapped {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Unwrapped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unwrapped")
            .field("attached", &self.detach.lock().unwrap().is_some())
            .finish()
    }
}

/// Projects a (swappable) request handle onto an observable of just its data.
///
/// The returned observable holds `on_success(data)` while the current handle is successful, and
/// `fallback(result)` otherwise. `fallback` receives `None` while `source` holds no handle.
///
/// When the handle in `source` is swapped, the subscription moves to the new handle. Nothing
/// keeps a subscription on a replaced handle. The handles themselves stay owned by `source`.
pub fn unwrap_request_result<T, U, S, F>(
    source: &Observable<Option<RequestHandle<T>>>,
    on_success: S,
    fallback: F,
) -> (Observable<U>, Unwrapped)
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    S: Fn(&T) -> U + Send + Sync + 'static,
    F: Fn(Option<&RequestResult<T>>) -> U + Send + Sync + 'static,
{
    let project: Projection<T, U> = Box::new(move |result| match result {
        Some(RequestResult::Success { data, .. }) => on_success(data),
        other => fallback(other),
    });
    let output = Observable::new(project(None));

    let unwrapper = Arc::new(Unwrapper {
        source: source.clone(),
        output: output.clone(),
        bound: Mutex::new(None),
        project,
    });
    let subscription = source.subscribe(Unwrapper::callback(Arc::downgrade(&unwrapper), true));
    unwrapper.rebind();

    let unwrapped = Unwrapped {
        detach: Mutex::new(Some(Box::new(move || {
            unwrapper.source.unsubscribe(subscription);
            unwrapper.unbind();
        }))),
    };
    (output, unwrapped)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::HandlerConfig;
    use crate::requests::{RefreshRef, RequestError, RequestHandler};
    use crate::test::{MockDriver, TestData, TestRef};

    use super::*;

    fn uid_of(data: &TestData) -> Option<String> {
        Some(data.uid.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_follows_swapped_handle() {
        let handler = RequestHandler::new(
            MockDriver::new().with_latency(Duration::from_millis(10)),
            HandlerConfig::default(),
        );
        let source = Observable::new(None);
        let (unwrapped, guard) = unwrap_request_result(&source, uid_of, |_| None);
        assert_eq!(unwrapped.get(), None);

        let first = handler.request(Some(TestRef::new("first")), RefreshRef::never());
        source.set(Some(first.clone()));
        assert_eq!(unwrapped.get(), None);
        assert_eq!(
            unwrapped.wait_for(Option::is_some).await.as_deref(),
            Some("first")
        );

        let second = handler.request(Some(TestRef::new("second")), RefreshRef::never());
        source.set(Some(second.clone()));
        assert_eq!(first.data().subscriber_count(), 0);
        assert_eq!(second.data().subscriber_count(), 1);
        assert_eq!(
            unwrapped.wait_for(Option::is_some).await.as_deref(),
            Some("second")
        );

        // changes of the replaced handle no longer reach the output
        let version = unwrapped.version();
        first.get().report_expired();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(unwrapped.version(), version);

        source.set(None);
        assert_eq!(unwrapped.get(), None);
        assert_eq!(second.data().subscriber_count(), 0);

        source.set(Some(second.clone()));
        guard.detach();
        assert_eq!(second.data().subscriber_count(), 0);
        assert_eq!(source.subscriber_count(), 0);

        first.release();
        second.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_sees_errors() {
        let driver = MockDriver::new();
        driver.fail_next(RequestError::NotFound);
        let handler = RequestHandler::new(driver, HandlerConfig::default());

        let handle = handler.request(Some(TestRef::new("missing")), RefreshRef::never());
        let source = Observable::new(Some(handle.clone()));
        let (unwrapped, _guard) = unwrap_request_result(
            &source,
            |data: &TestData| data.uid.clone(),
            |result| match result {
                Some(result) => result.kind().to_owned(),
                None => "none".to_owned(),
            },
        );

        assert_eq!(unwrapped.get(), "loading");
        assert_eq!(unwrapped.wait_for(|v| v != "loading").await, "error");
        handle.release();
    }

    #[test]
    fn test_dropping_guard_detaches() {
        let source = Observable::<Option<RequestHandle<u32>>>::new(None);
        let (unwrapped, guard) = unwrap_request_result(&source, |v| *v, |_| 0);
        assert_eq!(source.subscriber_count(), 1);
        drop(guard);
        assert_eq!(source.subscriber_count(), 0);
        assert_eq!(unwrapped.get(), 0);
    }
}
