use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Seconds subtracted from the ack deadline so extensions reach the server in time.
const LEASE_SAFETY_MARGIN: f64 = 3.0;

/// Fraction of both limits under which a paused stream resumes.
const RESUME_THRESHOLD: f64 = 0.8;

#[derive(Clone, Debug)]
pub(crate) struct InventoryLimits {
    pub limit: usize,
    pub bytesize: usize,
    /// Maximum time a message is leased from its receipt.
    pub extension: Duration,
    /// Upper bound of one lease extension. Zero means unbounded.
    pub max_duration_per_lease_extension: Duration,
    pub use_legacy_flow_control: bool,
}

struct Lease {
    bytes: usize,
    pulled_at: Instant,
}

struct State {
    leases: HashMap<String, Lease>,
    total_bytes: usize,
    min_duration_per_lease_extension: Duration,
}

/// Messages of one stream that are being processed and whose lease is extended.
pub(crate) struct Inventory {
    limits: InventoryLimits,
    state: Mutex<State>,
    changed: Notify,
}

impl Inventory {
    pub fn new(limits: InventoryLimits, min_duration_per_lease_extension: Duration) -> Self {
        Self {
            limits,
            state: Mutex::new(State {
                leases: HashMap::new(),
                total_bytes: 0,
                min_duration_per_lease_extension,
            }),
            changed: Notify::new(),
        }
    }

    pub fn limits(&self) -> &InventoryLimits {
        &self.limits
    }

    pub fn add(&self, ack_id: &str, bytes: usize) {
        let mut state = self.state.lock();
        let previous = state.leases.insert(
            ack_id.to_string(),
            Lease {
                bytes,
                pulled_at: Instant::now(),
            },
        );
        state.total_bytes += bytes;
        if let Some(previous) = previous {
            state.total_bytes -= previous.bytes;
        }
    }

    /// Stops leasing `ack_id`. Returns false if it was not leased.
    pub fn remove(&self, ack_id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.leases.remove(ack_id) {
                Some(lease) => {
                    state.total_bytes -= lease.bytes;
                    true
                }
                None => false,
            }
        };
        if removed {
            self.changed.notify_one();
        }
        removed
    }

    /// Drops the messages leased for longer than the total lease duration.
    pub fn remove_expired(&self) -> Vec<String> {
        let expired = {
            let mut state = self.state.lock();
            let extension = self.limits.extension;
            let expired: Vec<String> = state
                .leases
                .iter()
                .filter(|(_, lease)| lease.pulled_at.elapsed() > extension)
                .map(|(ack_id, _)| ack_id.clone())
                .collect();
            for ack_id in &expired {
                if let Some(lease) = state.leases.remove(ack_id) {
                    state.total_bytes -= lease.bytes;
                }
            }
            expired
        };
        if !expired.is_empty() {
            self.changed.notify_one();
        }
        expired
    }

    pub fn ack_ids(&self) -> Vec<String> {
        self.state.lock().leases.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.state.lock().leases.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().leases.is_empty()
    }

    pub fn is_full(&self) -> bool {
        let state = self.state.lock();
        state.leases.len() >= self.limits.limit || state.total_bytes >= self.limits.bytesize
    }

    pub fn below_resume_threshold(&self) -> bool {
        let state = self.state.lock();
        (state.leases.len() as f64) < self.limits.limit as f64 * RESUME_THRESHOLD
            && (state.total_bytes as f64) < self.limits.bytesize as f64 * RESUME_THRESHOLD
    }

    pub fn min_duration_per_lease_extension(&self) -> Duration {
        self.state.lock().min_duration_per_lease_extension
    }

    pub fn set_min_duration_per_lease_extension(&self, min: Duration) {
        self.state.lock().min_duration_per_lease_extension = min;
    }

    /// Time until the next lease extension for an ack deadline of `deadline` seconds.
    ///
    /// Jittered to 80-90% of the deadline minus a safety margin, then clamped by
    /// the per extension bounds.
    pub fn lease_delay(&self, deadline: i32) -> Duration {
        let jitter = rand::rng().random_range(0.8..0.9);
        let seconds = ((deadline as f64 - LEASE_SAFETY_MARGIN) * jitter).max(0.0);
        let mut delay = Duration::from_secs_f64(seconds);
        let max = self.limits.max_duration_per_lease_extension;
        if !max.is_zero() && delay > max {
            delay = max;
        }
        let min = self.min_duration_per_lease_extension();
        if !min.is_zero() && delay < min {
            delay = min;
        }
        delay
    }

    /// Resolves after the next removal.
    pub async fn changed(&self) {
        self.changed.notified().await
    }
}
