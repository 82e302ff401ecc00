//! Engine configuration.

use std::time::Duration;

/// Deadlines and pacing knobs for the replica engine.
///
/// Control operations (open, rename, job bookkeeping) use a short fixed
/// deadline; data-moving operations scale with the file size on top of a
/// fixed floor so a slow transfer cannot block a tick indefinitely.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for control operations against a storage node.
    pub control_deadline: Duration,
    /// Minimum deadline for a data-moving transfer.
    pub transfer_floor: Duration,
    /// Assumed worst-case transfer throughput in bytes per second; the
    /// transfer deadline grows by `size / rate` over the floor.
    pub transfer_rate_floor: u64,
    /// Files younger than this are not considered for scheduling, to
    /// avoid racing writes that are still registering.
    pub min_schedule_age: Duration,
    /// Minimum interval between transfer statistics log lines.
    pub stats_interval: Duration,
    /// Deadline for the best-effort progress stat.
    pub progress_deadline: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_deadline: Duration::from_secs(30),
            transfer_floor: Duration::from_secs(60),
            transfer_rate_floor: 50 * 1024,
            min_schedule_age: Duration::from_secs(60),
            stats_interval: Duration::from_secs(30),
            progress_deadline: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Deadline for moving `size` bytes: the floor plus the time the
    /// transfer would take at the assumed worst-case throughput.
    pub fn transfer_deadline(&self, size: u64) -> Duration {
        self.transfer_floor + Duration::from_secs(size / self.transfer_rate_floor.max(1))
    }
}
