use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use crate::cancelable::Cancelable;
use crate::observable::Observable;

use super::RequestError;

/// The lifecycle state of a request, as observed by its consumers.
pub enum RequestResult<D> {
    /// The data is being fetched, or fetching has not started yet.
    Loading,
    /// The data is available.
    Success {
        data: D,
        /// Tells the owning handler that `data` is no longer usable and must be refetched.
        report_expired: ExpireReporter,
    },
    /// Fetching the data failed.
    Error {
        error: RequestError,
        /// When the next attempt is scheduled, if any.
        retry_at: Option<Instant>,
    },
    /// The request was evicted or released. This is terminal.
    Released,
}

impl<D> RequestResult<D> {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn is_released(&self) -> bool {
        matches!(self, Self::Released)
    }

    /// The resolved data, if this is a [`Success`](Self::Success).
    pub fn data(&self) -> Option<&D> {
        match self {
            Self::Success { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&RequestError> {
        match self {
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Calls the [`ExpireReporter`] if this is a [`Success`](Self::Success).
    pub fn report_expired(&self) {
        if let Self::Success { report_expired, .. } = self {
            report_expired.report();
        }
    }

    /// A short name of the variant, used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Success { .. } => "success",
            Self::Error { .. } => "error",
            Self::Released => "released",
        }
    }
}

impl<D: Clone> Clone for RequestResult<D> {
    fn clone(&self) -> Self {
        match self {
            Self::Loading => Self::Loading,
            Self::Success {
                data,
                report_expired,
            } => Self::Success {
                data: data.clone(),
                report_expired: report_expired.clone(),
            },
            Self::Error { error, retry_at } => Self::Error {
                error: error.clone(),
                retry_at: *retry_at,
            },
            Self::Released => Self::Released,
        }
    }
}

impl<D: fmt::Debug> fmt::Debug for RequestResult<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loading => f.write_str("Loading"),
            Self::Success { data, .. } => f.debug_struct("Success").field("data", data).finish(),
            Self::Error { error, retry_at } => f
                .debug_struct("Error")
                .field("error", error)
                .field("retry_at", retry_at)
                .finish(),
            Self::Released => f.write_str("Released"),
        }
    }
}

/// A callback which flags the data of a [`RequestResult::Success`] as expired.
///
/// Reporting is a no-op once the result it was handed out with has been replaced.
#[derive(Clone)]
pub struct ExpireReporter(Arc<dyn Fn() + Send + Sync>);

impl ExpireReporter {
    pub fn new<F>(report: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self(Arc::new(report))
    }

    /// A reporter which does nothing.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn report(&self) {
        (self.0)()
    }
}

impl fmt::Debug for ExpireReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExpireReporter")
    }
}

type Releaser = Box<dyn FnOnce() + Send>;

struct HandleInner<T> {
    data: Observable<RequestResult<T>>,
    releaser: Mutex<Option<Releaser>>,
}

impl<T> HandleInner<T> {
    fn release(&self) -> bool {
        let releaser = self.releaser.lock().unwrap().take();
        match releaser {
            Some(release) => {
                release();
                true
            }
            None => false,
        }
    }
}

impl<T> Drop for HandleInner<T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// A consumer's hold on a request.
///
/// The handle exposes the [`RequestResult`] of the request as an [`Observable`]. Consumers must
/// [`release`](Self::release) the handle once they no longer need the data; releasing is
/// idempotent and shared between clones. Dropping the last clone releases the handle as well.
pub struct RequestHandle<T> {
    inner: Arc<HandleInner<T>>,
}

impl<T> Clone for RequestHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> RequestHandle<T> {
    /// Creates a handle around `data` which runs `release` when released.
    pub fn new<F>(data: Observable<RequestResult<T>>, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner: Arc::new(HandleInner {
                data,
                releaser: Mutex::new(Some(Box::new(release))),
            }),
        }
    }

    /// The observable result of this request.
    pub fn data(&self) -> &Observable<RequestResult<T>> {
        &self.inner.data
    }

    /// A copy of the current result.
    pub fn get(&self) -> RequestResult<T> {
        self.inner.data.get()
    }

    /// Waits for the request to leave [`RequestResult::Loading`] and returns the result.
    pub async fn settled(&self) -> RequestResult<T> {
        self.inner.data.wait_for(|result| !result.is_loading()).await
    }

    /// Gives up this consumer's hold on the request.
    ///
    /// Returns `false` if the handle was released before.
    pub fn release(&self) -> bool {
        self.inner.release()
    }

    pub fn is_released(&self) -> bool {
        self.inner.releaser.lock().unwrap().is_none()
    }
}

impl<T: fmt::Debug> fmt::Debug for RequestHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("data", &self.inner.data)
            .finish()
    }
}

type Refresher<R> = Arc<dyn Fn() -> Cancelable<Result<R, RequestError>> + Send + Sync>;

/// Produces a fresh reference for a request on demand.
///
/// The handler invokes it when the data of a request was reported expired, when the current
/// reference is no longer authorized, and to resolve requests started without a reference.
/// Failing with [`RequestError::Released`] means "no new reference", which keeps the request
/// as it is.
pub struct RefreshRef<R>(Refresher<R>);

impl<R> Clone for RefreshRef<R> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<R: Send + 'static> RefreshRef<R> {
    pub fn new<F>(refresh: F) -> Self
    where
        F: Fn() -> Cancelable<Result<R, RequestError>> + Send + Sync + 'static,
    {
        Self(Arc::new(refresh))
    }

    /// A refresher which never produces a new reference.
    pub fn never() -> Self {
        Self::new(|| Cancelable::resolved(Err(RequestError::Released)))
    }

    /// A refresher which always hands out the same reference.
    pub fn constant(reference: R) -> Self
    where
        R: Clone + Sync,
    {
        Self::new(move || Cancelable::resolved(Ok(reference.clone())))
    }

    pub fn refresh(&self) -> Cancelable<Result<R, RequestError>> {
        (self.0)()
    }
}

impl<R> fmt::Debug for RefreshRef<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RefreshRef")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_release_is_idempotent_across_clones() {
        let releases = Arc::new(AtomicUsize::new(0));
        let handle = {
            let releases = Arc::clone(&releases);
            RequestHandle::<u32>::new(Observable::new(RequestResult::Loading), move || {
                releases.fetch_add(1, Ordering::Relaxed);
            })
        };
        let clone = handle.clone();

        assert!(handle.release());
        assert!(!clone.release());
        assert!(clone.is_released());
        drop(handle);
        drop(clone);
        assert_eq!(releases.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dropping_last_clone_releases() {
        let releases = Arc::new(AtomicUsize::new(0));
        let handle = {
            let releases = Arc::clone(&releases);
            RequestHandle::<u32>::new(Observable::new(RequestResult::Loading), move || {
                releases.fetch_add(1, Ordering::Relaxed);
            })
        };
        let clone = handle.clone();
        drop(handle);
        assert_eq!(releases.load(Ordering::Relaxed), 0);
        drop(clone);
        assert_eq!(releases.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_result_accessors() {
        let success = RequestResult::Success {
            data: 3,
            report_expired: ExpireReporter::noop(),
        };
        assert_eq!(success.data(), Some(&3));
        assert_eq!(success.kind(), "success");

        let error = RequestResult::<u32>::Error {
            error: RequestError::NotFound,
            retry_at: None,
        };
        assert_eq!(error.error(), Some(&RequestError::NotFound));
        assert!(error.data().is_none());
        assert!(RequestResult::<u32>::Loading.is_loading());
    }
}
