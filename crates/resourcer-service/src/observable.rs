//! A mutable cell that notifies subscribers whenever it is written to.
//!
//! [`Observable`] is how state changes propagate through this crate: request results, release
//! flags and unwrapped data are all observables. Subscribers are invoked without a payload and
//! read the current value via [`Observable::get`].

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

type Callback = Arc<dyn Fn() + Send + Sync>;
type EqualityFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Identifies a subscription created by [`Observable::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Decides whether a write to an [`Observable`] counts as a change.
///
/// The default, [`Equality::Never`], treats every write as a change. Deep comparisons are never
/// inferred; they have to be asked for explicitly.
pub enum Equality<T> {
    /// No two values are considered equal, so every write notifies.
    Never,
    /// Writes of a value equal to the current one, according to the comparator, are dropped.
    Custom(EqualityFn<T>),
}

impl<T> Equality<T> {
    fn is_equal(&self, old: &T, new: &T) -> bool {
        match self {
            Equality::Never => false,
            Equality::Custom(eq) => eq(old, new),
        }
    }
}

impl<T> Clone for Equality<T> {
    fn clone(&self) -> Self {
        match self {
            Equality::Never => Equality::Never,
            Equality::Custom(eq) => Equality::Custom(Arc::clone(eq)),
        }
    }
}

struct Slot<T> {
    value: T,
    version: u64,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: Vec<(SubscriptionId, Callback)>,
}

impl Subscribers {
    fn contains(&self, id: SubscriptionId) -> bool {
        self.callbacks.iter().any(|(existing, _)| *existing == id)
    }
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    subscribers: Mutex<Subscribers>,
    equality: Equality<T>,
    notify: Notify,
}

/// A value plus the list of callbacks interested in its changes.
///
/// Cloning an `Observable` yields another handle to the same cell.
pub struct Observable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Observable<T> {
    /// Creates a cell which notifies on every write.
    pub fn new(value: T) -> Self {
        Self::with_policy(value, Equality::Never)
    }

    /// Creates a cell which only notifies when `eq` says the new value differs.
    pub fn with_equality<F>(value: T, eq: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self::with_policy(value, Equality::Custom(Arc::new(eq)))
    }

    /// Creates a cell with an explicit [`Equality`] policy.
    pub fn with_policy(value: T, equality: Equality<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot { value, version: 0 }),
                subscribers: Mutex::new(Subscribers::default()),
                equality,
                notify: Notify::new(),
            }),
        }
    }

    /// Returns a copy of the current value.
    pub fn get(&self) -> T {
        self.inner.slot.lock().unwrap().value.clone()
    }

    /// Reads the current value without copying it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.slot.lock().unwrap().value)
    }

    /// A counter which increases with every effective write.
    pub fn version(&self) -> u64 {
        self.inner.slot.lock().unwrap().version
    }

    /// Stores `value` and notifies subscribers if it counts as a change.
    ///
    /// Returns whether subscribers were notified.
    pub fn set(&self, value: T) -> bool {
        let changed = self.replace(value);
        if changed {
            self.notify();
        }
        changed
    }

    /// Stores `value` without notifying anyone.
    ///
    /// The caller must follow up with [`notify`](Self::notify) once it is safe to run
    /// callbacks. This allows updating the value while holding other locks.
    pub(crate) fn replace(&self, value: T) -> bool {
        let mut slot = self.inner.slot.lock().unwrap();
        if self.inner.equality.is_equal(&slot.value, &value) {
            return false;
        }
        slot.value = value;
        slot.version += 1;
        true
    }

    /// Invokes all subscribers in the order they were added and wakes pending
    /// [`changed`](Self::changed) futures.
    pub(crate) fn notify(&self) {
        let snapshot: Vec<_> = self.inner.subscribers.lock().unwrap().callbacks.clone();
        for (id, callback) in snapshot {
            // an earlier callback of this round may have removed this one
            if !self.inner.subscribers.lock().unwrap().contains(id) {
                continue;
            }
            callback();
        }
        self.inner.notify.notify_waiters();
    }

    /// Registers `callback` to be invoked after every change.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        let id = SubscriptionId(subscribers.next_id);
        subscribers.next_id += 1;
        subscribers.callbacks.push((id, Arc::new(callback)));
        id
    }

    /// Removes a subscription. Returns `false` if it was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        let before = subscribers.callbacks.len();
        subscribers.callbacks.retain(|(existing, _)| *existing != id);
        subscribers.callbacks.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().callbacks.len()
    }

    /// Whether both handles refer to the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Completes on the first change after this call.
    pub fn changed(&self) -> impl Future<Output = ()> + Send + 'static {
        self.changed_since(self.version())
    }

    /// Completes as soon as the value has changed since `version` was observed.
    pub fn changed_since(&self, version: u64) -> impl Future<Output = ()> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        async move {
            loop {
                let notified = inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if inner.slot.lock().unwrap().version != version {
                    return;
                }
                notified.await;
            }
        }
    }

    /// Waits until the value satisfies `predicate` and returns that value.
    pub async fn wait_for<F>(&self, predicate: F) -> T
    where
        F: Fn(&T) -> bool,
    {
        loop {
            let (value, version) = {
                let slot = self.inner.slot.lock().unwrap();
                (slot.value.clone(), slot.version)
            };
            if predicate(&value) {
                return value;
            }
            self.changed_since(version).await;
        }
    }
}

impl<T: Clone + PartialEq + Send + 'static> Observable<T> {
    /// Creates a cell which skips writes equal to the current value.
    pub fn deduplicated(value: T) -> Self {
        Self::with_equality(value, |a, b| a == b)
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock().unwrap();
        f.debug_struct("Observable")
            .field("value", &slot.value)
            .field("version", &slot.version)
            .finish()
    }
}
