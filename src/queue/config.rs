use serde::{Deserialize, Serialize};

/// Sizing for a [`BoundedPooledQueue`](super::BoundedPooledQueue).
///
/// # Examples
///
/// ```
/// use order_runtime::queue::QueueConfig;
///
/// let config = QueueConfig::new(64);
/// assert_eq!(config.capacity, 64);
/// assert_eq!(config.backing_up_watermark, 48);
///
/// let config = config.with_backing_up_watermark(60);
/// assert_eq!(config.backing_up_watermark, 60);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued entries, reserved ones included.
    pub capacity: usize,

    /// Occupancy at which the queue starts reporting that it is backing up.
    ///
    /// Diagnostic only; enqueues keep succeeding until `capacity`.
    pub backing_up_watermark: usize,
}

impl QueueConfig {
    /// Default capacity used by [`QueueConfig::default`].
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Config with the given capacity and a watermark at three quarters of
    /// it, kept strictly below the capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            backing_up_watermark: Self::default_watermark(capacity),
        }
    }

    /// Replaces the capacity, keeping the watermark below it.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self.backing_up_watermark = self
            .backing_up_watermark
            .min(capacity.saturating_sub(1));
        self
    }

    /// Replaces the backing-up watermark.
    #[must_use]
    pub fn with_backing_up_watermark(mut self, watermark: usize) -> Self {
        self.backing_up_watermark = watermark;
        self
    }

    fn default_watermark(capacity: usize) -> usize {
        (capacity / 4 * 3).max(1).min(capacity.saturating_sub(1))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_watermark_below_capacity() {
        let config = QueueConfig::default();
        assert_eq!(config.capacity, 1024);
        assert_eq!(config.backing_up_watermark, 768);
        assert_eq!(QueueConfig::new(2).backing_up_watermark, 1);
    }

    #[test]
    fn test_with_capacity_clamps_watermark() {
        let config = QueueConfig::new(100).with_capacity(10);
        assert_eq!(config.capacity, 10);
        assert_eq!(config.backing_up_watermark, 9);
    }

    #[test]
    fn test_tiny_capacity_watermark_stays_below_capacity() {
        assert_eq!(QueueConfig::new(0).backing_up_watermark, 0);
        assert_eq!(QueueConfig::new(1).backing_up_watermark, 0);
        assert_eq!(QueueConfig::new(2).backing_up_watermark, 1);
        assert_eq!(QueueConfig::new(4).backing_up_watermark, 3);
        assert_eq!(QueueConfig::new(8).with_capacity(1).backing_up_watermark, 0);
    }

    #[test]
    fn test_serde_round_trip_and_defaults() {
        let config = QueueConfig::new(8).with_backing_up_watermark(6);
        let json = serde_json::to_string(&config).unwrap_or_else(|e| panic!("encode: {e}"));
        let parsed: QueueConfig =
            serde_json::from_str(&json).unwrap_or_else(|e| panic!("decode: {e}"));
        assert_eq!(parsed, config);

        let empty: QueueConfig = serde_json::from_str("{}").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(empty, QueueConfig::default());
    }
}
