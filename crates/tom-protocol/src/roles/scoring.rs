//! Contribution metrics — tracks a node's relay activity and computes a score.
//!
//! Score formula: weighted sum of relay count, success rate, and uptime,
//! with progressive decay (5%/hour since last activity). Scores are always
//! recoverable — no permanent bans (design decision #4).

/// Decay rate: 5% per hour (expressed as fraction per ms).
const DECAY_RATE_PER_MS: f64 = 0.05 / 3_600_000.0;

// Scoring weight constants (tunable based on beta testing)

/// Weight for relay count in score calculation.
pub const RELAY_COUNT_WEIGHT: f64 = 1.0;

/// Weight for success rate (0.0–1.0) in score calculation.
pub const SUCCESS_RATE_WEIGHT: f64 = 5.0;

/// Weight for uptime hours in score calculation.
pub const UPTIME_WEIGHT: f64 = 0.5;

/// Weight for total bandwidth relayed (in MB) in score calculation.
pub const BANDWIDTH_MB_WEIGHT: f64 = 0.2;

/// Weight for give/take bandwidth ratio in score calculation.
pub const BANDWIDTH_RATIO_WEIGHT: f64 = 1.5;

/// Contribution metrics for a single node.
#[derive(Debug, Clone)]
pub struct ContributionMetrics {
    /// Total messages successfully relayed.
    pub messages_relayed: u64,
    /// Total relay failures.
    pub relay_failures: u64,
    /// Unix ms timestamp when this node was first observed.
    pub first_seen: u64,
    /// Unix ms timestamp of last activity.
    pub last_activity: u64,
    /// Cumulative uptime in milliseconds.
    pub total_uptime_ms: u64,
    /// Total bytes relayed for other peers.
    pub bytes_relayed: u64,
    /// Total bytes received from the network.
    pub bytes_received: u64,
}

impl ContributionMetrics {
    /// Create new metrics for a freshly observed node.
    pub fn new(now: u64) -> Self {
        Self {
            messages_relayed: 0,
            relay_failures: 0,
            first_seen: now,
            last_activity: now,
            total_uptime_ms: 0,
            bytes_relayed: 0,
            bytes_received: 0,
        }
    }

    /// Record a successful relay.
    pub fn record_relay(&mut self, now: u64) {
        self.messages_relayed += 1;
        let elapsed = now.saturating_sub(self.last_activity);
        self.total_uptime_ms += elapsed;
        self.last_activity = now;
    }

    /// Record a relay failure.
    pub fn record_relay_failure(&mut self, now: u64) {
        self.relay_failures += 1;
        let elapsed = now.saturating_sub(self.last_activity);
        self.total_uptime_ms += elapsed;
        self.last_activity = now;
    }

    /// Compute the contribution score at the given timestamp.
    ///
    /// The raw score is: relay_count * W_relay + success_rate * W_success + uptime_hours * W_uptime
    /// Then decayed by 5%/hour since last_activity.
    pub fn score(&self, now: u64) -> f64 {
        let total_attempts = self.messages_relayed + self.relay_failures;
        let success_rate = if total_attempts == 0 {
            0.0
        } else {
            self.messages_relayed as f64 / total_attempts as f64
        };

        let uptime_hours = self.total_uptime_ms as f64 / 3_600_000.0;

        let raw = (self.messages_relayed as f64) * RELAY_COUNT_WEIGHT
            + success_rate * SUCCESS_RATE_WEIGHT
            + uptime_hours * UPTIME_WEIGHT;

        // Progressive decay since last activity
        let idle_ms = now.saturating_sub(self.last_activity) as f64;
        let decay = (-DECAY_RATE_PER_MS * idle_ms).exp();

        raw * decay
    }
}
