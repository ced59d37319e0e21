//! Streaming Transport Core
//!
//! The per-worker data plane of a distributed stream-processing runtime:
//! ordered, sequenced message bundles moved between upstream producer tasks
//! and downstream consumer tasks over named logical channels.
//!
//! # Guarantees
//!
//! - **At-least-once, per-channel FIFO**: a reader observes exactly the
//!   message sequence the writer committed, contiguous and in order.
//! - **K-way merge at the reader**: bundles from all input channels are
//!   interleaved by producer timestamp, with barriers fencing ahead of data
//!   and heartbeats yielding to both.
//! - **Back-pressure end to end**: a full channel parks the staged bundle in
//!   the ring's transient buffer; a full ring parks the producing thread.
//! - **Heartbeats**: idle channels emit header-only empty bundles carrying
//!   the message high-water mark, so downstream merging always progresses.
//!
//! # Example
//!
//! ```ignore
//! use ringflow::{ChannelId, DataReader, DataWriter, MessageType, TransferConfig};
//! use ringflow::transfer::{MemoryConsumer, MemoryProducer};
//! use std::time::Duration;
//!
//! let config = TransferConfig::default();
//! let channel = ChannelId::random();
//!
//! let mut writer = DataWriter::new(Box::new(MemoryProducer), config.clone());
//! writer.init(&[channel], &[0], &[10_000_000]).unwrap();
//! writer.run();
//!
//! let mut reader = DataReader::new(Box::new(MemoryConsumer), config.read_item_timeout);
//! reader.init(&[channel], None, None, config.empty_message_interval).unwrap();
//!
//! writer.write_message_to_buffer_ring(&channel, &[1, 2, 3], MessageType::Message).unwrap();
//! let bundle = reader.get_bundle(Duration::from_secs(5)).unwrap();
//! assert_eq!(bundle.from, channel);
//! ```

pub mod bundle;
pub mod config;
pub mod error;
pub mod merger;
pub mod message;
pub mod protocol;
pub mod reader;
pub mod ring;
pub mod service;
pub mod transfer;
pub mod transport;
pub mod writer;

pub use bundle::{BundleMeta, BundleType, MessageBundle};
pub use config::{QueueType, TransferConfig};
pub use error::{Result, TransferError};
pub use merger::{BundleMerger, DataBundle};
pub use message::{ActorId, ChannelId, MessageType, StreamingMessage};
pub use reader::DataReader;
pub use ring::RingBuffer;
pub use transfer::{ConsumerTransfer, ProducerTransfer, TransferContext};
pub use transport::{ActorCall, CallFunction, Transport};
pub use writer::{ChannelState, DataWriter};
