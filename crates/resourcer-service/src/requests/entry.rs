use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::observable::Observable;

use super::{RefreshRef, RequestDriver, RequestResult};

/// The shared state behind all handles for one uid.
pub(super) struct Entry<D: RequestDriver> {
    pub uid: String,
    /// The result all consumers observe.
    pub data: Observable<RequestResult<D::Data>>,
    pub state: Mutex<EntryState<D>>,
}

pub(super) struct EntryState<D: RequestDriver> {
    /// The best reference seen so far, used for the next fetch.
    pub reference: D::Ref,
    /// Attached consumers with the refresher each of them supplied.
    pub consumers: Vec<(u64, RefreshRef<D::Ref>)>,
    /// Bumped whenever the published result is superseded. Results and expiry reports
    /// carrying an older generation are dropped.
    pub generation: u64,
    /// Cancels the fetch cycle currently in flight.
    pub cycle: Option<CancellationToken>,
    /// The data of the currently published success, owned until it is cleaned up.
    pub published: Option<D::Data>,
    /// Whether the last cycle ended in an error without any retries left.
    pub exhausted: bool,
    pub destroyed: bool,
    /// Bumped every time the entry becomes unused.
    pub stale_epoch: u64,
}

impl<D: RequestDriver> Entry<D> {
    pub fn new(uid: String, reference: D::Ref) -> Self {
        Self {
            uid,
            data: Observable::new(RequestResult::Loading),
            state: Mutex::new(EntryState {
                reference,
                consumers: Vec::new(),
                generation: 0,
                cycle: None,
                published: None,
                exhausted: false,
                destroyed: false,
                stale_epoch: 0,
            }),
        }
    }

    /// Replaces the published result. Must be called with `state` locked.
    ///
    /// Returns the work that has to happen once the lock is released.
    pub fn publish(
        &self,
        state: &mut EntryState<D>,
        result: RequestResult<D::Data>,
    ) -> Settle<D::Data> {
        let old = match &result {
            RequestResult::Success { data, .. } => state.published.replace(data.clone()),
            _ => state.published.take(),
        };
        let changed = self.data.replace(result);
        Settle {
            notify: changed.then(|| self.data.clone()),
            cleanup: old,
            discard: Vec::new(),
        }
    }

    /// Marks the entry as destroyed and publishes [`RequestResult::Released`].
    ///
    /// Must be called with `state` locked, and only by whoever removes the entry from the store.
    pub fn retire(&self, state: &mut EntryState<D>) -> Settle<D::Data> {
        if state.destroyed {
            return Settle::none();
        }
        state.destroyed = true;
        state.generation += 1;
        let consumers = std::mem::take(&mut state.consumers);
        if let Some(cycle) = state.cycle.take() {
            cycle.cancel();
        }
        self.publish(state, RequestResult::Released)
            .and_discard(consumers)
    }
}

/// Notifications and cleanups deferred until no lock is held anymore.
#[must_use = "the settled result must be finished after unlocking"]
pub(super) struct Settle<T> {
    notify: Option<Observable<RequestResult<T>>>,
    cleanup: Option<T>,
    /// Values whose destructors may call back into the handler.
    discard: Vec<Box<dyn Send>>,
}

impl<T: Clone + Send + 'static> Settle<T> {
    pub fn none() -> Self {
        Self {
            notify: None,
            cleanup: None,
            discard: Vec::new(),
        }
    }

    /// Also cleans up `data` when finishing.
    pub fn and_cleanup(mut self, data: Option<T>) -> Self {
        debug_assert!(self.cleanup.is_none() || data.is_none());
        if data.is_some() {
            self.cleanup = data;
        }
        self
    }

    /// Drops `value` only when finishing.
    pub fn and_discard(mut self, value: impl Send + 'static) -> Self {
        self.discard.push(Box::new(value));
        self
    }

    /// Notifies subscribers, then hands superseded data to `cleanup`.
    pub fn finish(self, cleanup: impl FnOnce(T)) {
        if let Some(data) = self.notify {
            data.notify();
        }
        if let Some(old) = self.cleanup {
            cleanup(old);
        }
        drop(self.discard);
    }
}
