//! Configuration for the streaming transport.

use std::time::Duration;

/// Channel backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueType {
    /// In-process FIFO channels, for tests and single-worker pipelines.
    #[default]
    Memory,
    /// Shared-memory object-store backed channels.
    Plasma,
    /// Actor-to-actor channels over the queue wire protocol.
    StreamingQueue,
}

/// Configuration for writer, reader and channel behavior.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Minimum gap between heartbeat (empty) bundles per channel.
    ///
    /// Default: 50ms
    pub empty_message_interval: Duration,

    /// Writer ring buffer capacity per channel, in messages.
    ///
    /// Default: 512
    pub ring_buffer_capacity: usize,

    /// Per-channel bundle byte budget. Collection stops before a bundle
    /// would reach this size (a lone oversize message still goes through).
    ///
    /// Default: 10 MB
    pub queue_size: u64,

    /// Which channel backend to use.
    pub queue_type: QueueType,

    /// Per-attempt consume timeout used by the reader's channel fetch.
    ///
    /// Default: 10ms
    pub read_item_timeout: Duration,

    /// Timeout for one synchronous check-queue call.
    ///
    /// Default: 5s
    pub sync_call_timeout: Duration,

    /// Attempts for the check-queue handshake before giving up.
    ///
    /// Default: 10
    pub check_queue_retries: u32,

    /// Sleep unit for the producer's full-ring wait loop.
    ///
    /// Default: 1ms
    pub time_wait: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            empty_message_interval: Duration::from_millis(50),
            ring_buffer_capacity: 512,
            queue_size: 10 * 1000 * 1000,
            queue_type: QueueType::default(),
            read_item_timeout: Duration::from_millis(10),
            sync_call_timeout: Duration::from_secs(5),
            check_queue_retries: 10,
            time_wait: Duration::from_millis(1),
        }
    }
}

impl TransferConfig {
    /// Sets the heartbeat interval.
    pub fn with_empty_message_interval(mut self, interval: Duration) -> Self {
        self.empty_message_interval = interval;
        self
    }

    /// Sets the ring buffer capacity in messages.
    pub fn with_ring_buffer_capacity(mut self, capacity: usize) -> Self {
        self.ring_buffer_capacity = capacity;
        self
    }

    /// Sets the per-channel bundle byte budget.
    pub fn with_queue_size(mut self, size: u64) -> Self {
        self.queue_size = size;
        self
    }

    /// Sets the channel backend.
    pub fn with_queue_type(mut self, queue_type: QueueType) -> Self {
        self.queue_type = queue_type;
        self
    }

    /// Sets the per-attempt consume timeout for reader fetches.
    pub fn with_read_item_timeout(mut self, timeout: Duration) -> Self {
        self.read_item_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.empty_message_interval, Duration::from_millis(50));
        assert_eq!(config.ring_buffer_capacity, 512);
        assert_eq!(config.queue_type, QueueType::Memory);
        assert_eq!(config.check_queue_retries, 10);
    }

    #[test]
    fn test_builders() {
        let config = TransferConfig::default()
            .with_ring_buffer_capacity(4)
            .with_queue_size(100)
            .with_queue_type(QueueType::StreamingQueue);
        assert_eq!(config.ring_buffer_capacity, 4);
        assert_eq!(config.queue_size, 100);
        assert_eq!(config.queue_type, QueueType::StreamingQueue);
    }
}
