//! Server-to-local time translation
//!
//! Interpolation bounds are always expressed on the local render clock, so the
//! client never depends on its wall clock agreeing with the server's. The
//! offset is re-estimated from every batch that carries a server timestamp.

/// Weight given to each new offset sample once the estimate is seeded.
const SMOOTHING: f64 = 0.1;
/// A sample this far from the estimate replaces it outright.
const RESNAP_THRESHOLD_MS: f64 = 1_000.0;

#[derive(Debug, Clone, Default)]
pub struct ServerClock {
    offset_ms: Option<f64>,
    samples: u64,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one `(server time, local receive time)` pair into the estimate.
    pub fn observe(&mut self, server_time_ms: u64, local_now_ms: f64) {
        let sample = local_now_ms - server_time_ms as f64;
        self.samples += 1;
        self.offset_ms = Some(match self.offset_ms {
            Some(offset) if (sample - offset).abs() <= RESNAP_THRESHOLD_MS => {
                offset + (sample - offset) * SMOOTHING
            }
            _ => sample,
        });
    }

    pub fn is_synced(&self) -> bool {
        self.offset_ms.is_some()
    }

    pub fn offset_ms(&self) -> Option<f64> {
        self.offset_ms
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Translates a server timestamp to the local clock. Before the first
    /// observation the server time is returned unchanged.
    pub fn to_local(&self, server_time_ms: u64) -> f64 {
        server_time_ms as f64 + self.offset_ms.unwrap_or(0.0)
    }
}
