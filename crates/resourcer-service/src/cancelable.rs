//! Cooperatively cancelable units of asynchronous work.
//!
//! A [`Cancelable`] starts running as soon as it is constructed, just like a spawned task, and
//! can be awaited for its result. Calling [`Cancelable::cancel`] asks the work to stop; the
//! operation then settles with [`Canceled`] unless it already produced a value. Either way it
//! settles exactly once.
//!
//! Operations built on top of other operations (see [`Cancelable::map`]) cancel their children
//! and wait for them to settle before settling themselves.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The error a [`Cancelable`] settles with when it was canceled before producing a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation canceled")]
pub struct Canceled;

enum State<T> {
    Ready(Option<Result<T, Canceled>>),
    Running(JoinHandle<Result<T, Canceled>>),
    Settled,
}

/// A unit of asynchronous work which can be canceled before it completes.
///
/// Dropping a `Cancelable` detaches the work instead of canceling it, the same way dropping a
/// [`JoinHandle`] does. Call [`cancel`](Self::cancel) to stop it.
pub struct Cancelable<T> {
    token: CancellationToken,
    state: State<T>,
}

// We never hand out pinned references to the inner value.
impl<T> Unpin for Cancelable<T> {}

impl<T: Send + 'static> Cancelable<T> {
    /// Runs `future` on the current runtime.
    ///
    /// Once canceled, the future is dropped at its next suspension point and the operation
    /// settles with [`Canceled`].
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self::spawn_with(|token| async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(Canceled),
                value = future => Ok(value),
            }
        })
    }

    /// Runs the future produced by `body` on the current runtime.
    ///
    /// The body receives the cancellation token of this operation and is responsible for
    /// observing it. This is the constructor to use when work has to be undone on cancellation.
    pub fn spawn_with<F, Fut>(body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, Canceled>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let task = tokio::spawn(body(token.clone()));
        Self {
            token,
            state: State::Running(task),
        }
    }

    /// Never produces a value; settles with [`Canceled`] once canceled.
    pub fn pending() -> Self {
        Self::spawn(futures::future::pending())
    }

    /// Maps the value of this operation.
    ///
    /// Canceling the returned operation cancels this one and waits for it to settle.
    pub fn map<U, F>(self, f: F) -> Cancelable<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let mut inner = self;
        Cancelable::spawn_with(move |token| async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    inner.cancel();
                    let _ = (&mut inner).await;
                    Err(Canceled)
                }
                result = &mut inner => result.map(f),
            }
        })
    }
}

impl<T> Cancelable<T> {
    /// An operation which is already done with the given value.
    pub fn resolved(value: T) -> Self {
        Self {
            token: CancellationToken::new(),
            state: State::Ready(Some(Ok(value))),
        }
    }

    /// An operation which is already done and was canceled.
    pub fn canceled() -> Self {
        let token = CancellationToken::new();
        token.cancel();
        Self {
            token,
            state: State::Ready(Some(Err(Canceled))),
        }
    }

    /// Requests cancellation. Idempotent, and a no-op once the operation is done.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the operation has settled, either with a value or canceled.
    pub fn done(&self) -> bool {
        match &self.state {
            State::Ready(_) | State::Settled => true,
            State::Running(task) => task.is_finished(),
        }
    }
}

impl<T> Future for Cancelable<T> {
    type Output = Result<T, Canceled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let output = match &mut this.state {
            State::Ready(value) => value.take().unwrap_or(Err(Canceled)),
            State::Running(task) => match ready!(task.poll_unpin(cx)) {
                Ok(result) => result,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => Err(Canceled),
            },
            State::Settled => panic!("`Cancelable` polled after completion"),
        };
        this.state = State::Settled;
        Poll::Ready(output)
    }
}

impl<T> fmt::Debug for Cancelable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancelable")
            .field("done", &self.done())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
