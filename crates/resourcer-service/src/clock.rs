//! The server's notion of the current time.
//!
//! Authorization tokens expire according to the server's clock, which may drift from ours.
//! [`ServerClock`] estimates that drift with Cristian's algorithm: ask the server for its time,
//! and assume the answer was produced halfway through the round trip.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::requests::RequestError;

/// How long a measured drift is trusted before it is measured again.
pub const DRIFT_TTL: Duration = Duration::from_secs(15 * 60);

/// Something that can tell the server's current time.
pub trait TimeProbe: Send + Sync {
    fn server_time(&self) -> BoxFuture<'_, Result<DateTime<Utc>, RequestError>>;
}

#[derive(Debug, Clone, Copy)]
struct Drift {
    offset: TimeDelta,
    measured_at: Instant,
}

/// A clock that follows the server's time.
///
/// Clones share the measured drift. Until [`sync`](Self::sync) succeeds the clock assumes no
/// drift at all.
#[derive(Clone, Default)]
pub struct ServerClock {
    drift: Arc<Mutex<Option<Drift>>>,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock with a known offset from local time, as if it had just been measured.
    pub fn with_offset(offset: TimeDelta) -> Self {
        let clock = Self::new();
        clock.store(offset);
        clock
    }

    /// The current server time.
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset()
    }

    /// How far the server's clock is ahead of ours.
    pub fn offset(&self) -> TimeDelta {
        self.drift
            .lock()
            .unwrap()
            .map_or_else(TimeDelta::zero, |drift| drift.offset)
    }

    fn store(&self, offset: TimeDelta) {
        *self.drift.lock().unwrap() = Some(Drift {
            offset,
            measured_at: Instant::now(),
        });
    }

    fn cached(&self) -> Option<TimeDelta> {
        let drift = (*self.drift.lock().unwrap())?;
        (drift.measured_at.elapsed() < DRIFT_TTL).then_some(drift.offset)
    }

    /// Measures the drift against `probe`, unless a recent measurement exists.
    ///
    /// If the probe fails, a zero correction is used until the next call; failed measurements
    /// are not cached.
    pub async fn sync(&self, probe: &dyn TimeProbe) -> TimeDelta {
        if let Some(offset) = self.cached() {
            return offset;
        }

        let sent_at = Utc::now();
        let started = Instant::now();
        match probe.server_time().await {
            Ok(server_time) => {
                let round_trip =
                    TimeDelta::from_std(started.elapsed()).unwrap_or_else(|_| TimeDelta::zero());
                let midpoint = sent_at + round_trip / 2;
                let offset = server_time - midpoint;
                tracing::debug!(
                    offset_ms = offset.num_milliseconds(),
                    round_trip_ms = round_trip.num_milliseconds(),
                    "Measured server clock drift"
                );
                self.store(offset);
                offset
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to measure server clock drift, assuming none");
                TimeDelta::zero()
            }
        }
    }
}

impl fmt::Debug for ServerClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerClock")
            .field("offset", &self.offset())
            .finish()
    }
}
