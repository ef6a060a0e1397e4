use std::cmp::Ordering;
use std::fmt::Debug;

use chrono::{DateTime, Utc};

use crate::cancelable::Cancelable;

use super::RequestError;

/// The collaborator a [`RequestHandler`](super::RequestHandler) uses to actually resolve data.
///
/// Everything the handler knows about a specific kind of resource goes through this trait:
/// how to identify it, how to fetch it, which of two references to the same resource is
/// preferable, whether a reference's authorization is still valid, and how to free data once
/// nobody uses it anymore.
pub trait RequestDriver: Send + Sync + 'static {
    /// Describes *what* is wanted, possibly carrying time-bounded authorization.
    type Ref: Clone + Send + Sync + Debug + 'static;
    /// The resolved data, shared by all consumers of a request.
    type Data: Clone + Send + Sync + 'static;

    /// A stable identity for `reference`.
    ///
    /// Volatile fields such as authorization tokens must not be part of the uid: two references
    /// with the same uid denote the same resource.
    fn ref_uid(&self, reference: &Self::Ref) -> String;

    /// Starts resolving the data for `reference`.
    fn fetch(&self, reference: Self::Ref) -> Cancelable<Result<Self::Data, RequestError>>;

    /// Decides which of two references with the same uid to keep.
    ///
    /// [`Ordering::Greater`] means `a` is preferred over `b`. The default implementation
    /// considers all references equally good, which keeps the first one seen.
    fn compare_refs(&self, a: &Self::Ref, b: &Self::Ref) -> Ordering {
        let _ = (a, b);
        Ordering::Equal
    }

    /// Whether the authorization carried by `reference` is no longer usable at `now`.
    ///
    /// `now` is the server's notion of the current time.
    fn is_expired(&self, reference: &Self::Ref, now: DateTime<Utc>) -> bool {
        let _ = (reference, now);
        false
    }

    /// Frees resources held by `data` which are not released by simply dropping it.
    ///
    /// This is called exactly once for every value produced by [`fetch`](Self::fetch), after
    /// the last consumer let go of it.
    fn cleanup_data(&self, data: Self::Data) {
        drop(data);
    }
}
