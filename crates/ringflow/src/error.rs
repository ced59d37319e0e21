//! Error types for transfer and transport operations.

use thiserror::Error;

/// Errors that can occur anywhere in the data plane.
///
/// Several variants are control-flow signals rather than failures: the
/// writer loop matches on [`EmptyRingBuffer`](TransferError::EmptyRingBuffer),
/// [`FullChannel`](TransferError::FullChannel) and
/// [`SkipSendEmptyMessage`](TransferError::SkipSendEmptyMessage) and simply
/// rechecks on the next sweep.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The writer ring buffer has nothing to drain.
    #[error("ring buffer is empty")]
    EmptyRingBuffer,

    /// The channel cannot accept more data right now (back-pressure).
    #[error("channel is full")]
    FullChannel,

    /// The channel has no item at the requested position yet.
    #[error("no such item in channel")]
    NoSuchItem,

    /// A heartbeat was skipped because a bundle is still pending commit.
    #[error("skipped empty message, ring buffer not drained")]
    SkipSendEmptyMessage,

    /// `get_bundle` exhausted its timeout budget without a bundle.
    #[error("get bundle timed out")]
    GetBundleTimeOut,

    /// The channel has been closed or destroyed.
    #[error("channel is closed")]
    ChannelClosed,

    /// Channel or queue initialization failed.
    #[error("queue init failed: {0}")]
    InitQueueFailed(String),

    /// A wire image carried the wrong magic number.
    #[error("bad magic number: 0x{0:08x}")]
    BadMagic(u32),

    /// A wire image carried an unknown message or bundle type tag.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u32),

    /// A wire image ended before its header or payload did.
    #[error("truncated buffer: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// Declared and actual payload lengths disagree.
    #[error("length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// An I/O or RPC-substrate failure.
    #[error("io error: {0}")]
    IoError(String),

    /// The operation was cancelled by shutdown.
    #[error("interrupted by shutdown")]
    Interrupted,
}

impl TransferError {
    /// Returns `true` if the writer loop recovers from this silently on the
    /// next sweep.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::EmptyRingBuffer | Self::FullChannel | Self::SkipSendEmptyMessage | Self::NoSuchItem
        )
    }

    /// Returns `true` if this error means the channel is permanently unusable.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::Interrupted)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransferError>;
