//! Data writer: the producer-side pump.
//!
//! Application threads hand messages to
//! [`DataWriter::write_message_to_buffer_ring`]; a single loop thread drains
//! each channel's ring buffer, coalesces messages into bundles under the
//! byte/type constraints, hands them to the channel backend, and emits
//! heartbeat empty bundles when a channel has been idle longer than the
//! configured interval. Back-pressure is natural: a `FullChannel` from the
//! backend leaves the staged bundle in the ring's transient buffer and the
//! sweep retries it next time around.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crossbeam_utils::Backoff;
use tracing::{debug, info, warn};

use crate::bundle::{BundleMeta, MessageBundle};
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::message::{ChannelId, MessageType, StreamingMessage};
use crate::ring::RingBuffer;
use crate::transfer::{ProducerChannelInfo, ProducerTransfer};

/// Lifecycle of a writer or reader instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Init = 0,
    Running = 1,
    Interrupted = 2,
}

/// Shared lifecycle flag, written by `init`/`stop`, read everywhere.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: ChannelState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> ChannelState {
        match self.0.load(Ordering::Acquire) {
            0 => ChannelState::Init,
            1 => ChannelState::Running,
            _ => ChannelState::Interrupted,
        }
    }

    pub(crate) fn set(&self, state: ChannelState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Wall-clock milliseconds, as stamped into bundle headers.
pub(crate) fn current_sys_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Application-facing handle of one output channel: the ring plus the
/// message id counter, both shared with the loop thread.
struct AppChannel {
    ring: Arc<RingBuffer>,
    current_message_id: Arc<std::sync::atomic::AtomicU64>,
}

/// Everything the loop thread owns exclusively.
struct WriterWorker {
    output_queue_ids: Vec<ChannelId>,
    channel_info_map: HashMap<ChannelId, ProducerChannelInfo>,
    transfer: Box<dyn ProducerTransfer>,
    config: TransferConfig,
    state: Arc<StateCell>,
}

/// The producer-side transport endpoint.
pub struct DataWriter {
    config: TransferConfig,
    state: Arc<StateCell>,
    channels: HashMap<ChannelId, AppChannel>,
    worker: Option<WriterWorker>,
    loop_thread: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DataWriter {
    pub fn new(transfer: Box<dyn ProducerTransfer>, config: TransferConfig) -> Self {
        let state = Arc::new(StateCell::new(ChannelState::Init));
        Self {
            channels: HashMap::new(),
            worker: Some(WriterWorker {
                output_queue_ids: Vec::new(),
                channel_info_map: HashMap::new(),
                transfer,
                config: config.clone(),
                state: Arc::clone(&state),
            }),
            config,
            state,
            loop_thread: std::sync::Mutex::new(None),
        }
    }

    /// Registers the output channels and transitions to Running.
    ///
    /// `channel_message_ids[i]` is the already-committed message high-water
    /// mark to resume channel `i` from (0 for a fresh channel);
    /// `queue_sizes[i]` its bundle byte budget. On error the writer stays in
    /// `Init` and must not be run.
    pub fn init(
        &mut self,
        queue_ids: &[ChannelId],
        channel_message_ids: &[u64],
        queue_sizes: &[u64],
    ) -> Result<()> {
        assert!(
            !queue_ids.is_empty()
                && queue_ids.len() == channel_message_ids.len()
                && queue_ids.len() == queue_sizes.len(),
            "queue id, message id and size vectors must align"
        );
        let worker = self.worker.as_mut().expect("writer already running");

        for (i, queue_id) in queue_ids.iter().enumerate() {
            info!(queue = %queue_id, "init channel");
            let ring = Arc::new(RingBuffer::new(self.config.ring_buffer_capacity));
            let channel_info = ProducerChannelInfo::new(
                *queue_id,
                Arc::clone(&ring),
                channel_message_ids[i],
                queue_sizes[i],
            );
            worker.transfer.create_channel(&channel_info)?;
            self.channels.insert(
                *queue_id,
                AppChannel {
                    ring,
                    current_message_id: Arc::clone(&channel_info.current_message_id),
                },
            );
            worker.channel_info_map.insert(*queue_id, channel_info);
            worker.output_queue_ids.push(*queue_id);
        }

        let abnormal = worker
            .transfer
            .wait_channels_ready(queue_ids, self.config.sync_call_timeout);
        if !abnormal.is_empty() {
            return Err(TransferError::InitQueueFailed(format!(
                "{} channel(s) never became ready",
                abnormal.len()
            )));
        }

        self.state.set(ChannelState::Running);
        Ok(())
    }

    /// Starts the loop thread. Must follow a successful [`init`](Self::init).
    pub fn run(&mut self) {
        info!("writer loop start");
        let worker = self.worker.take().expect("init must precede run");
        *self.loop_thread.lock().unwrap() = Some(std::thread::spawn(move || worker.run()));
    }

    /// Appends one message to a channel's ring buffer, assigning its seq id.
    ///
    /// Spins with back-off while the ring is full; returns
    /// `Err(Interrupted)` if the writer is stopped before space opens up.
    pub fn write_message_to_buffer_ring(
        &self,
        queue_id: &ChannelId,
        data: &[u8],
        message_type: MessageType,
    ) -> Result<u64> {
        let channel = self
            .channels
            .get(queue_id)
            .ok_or(TransferError::ChannelClosed)?;
        debug!(queue = %queue_id, data_size = data.len(), "write message to buffer ring");

        let seq_id = channel.current_message_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut message = StreamingMessage::new(seq_id, message_type, data.to_vec());
        let backoff = Backoff::new();
        loop {
            if self.state.get() != ChannelState::Running {
                warn!(queue = %queue_id, "stopped while writing to ring buffer");
                return Err(TransferError::Interrupted);
            }
            match channel.ring.try_push(message) {
                Ok(()) => return Ok(seq_id),
                Err(rejected) => {
                    message = rejected;
                    if backoff.is_completed() {
                        std::thread::sleep(self.config.time_wait);
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    /// Flips to Interrupted and joins the loop thread.
    pub fn stop(&self) {
        if self.state.get() == ChannelState::Init {
            return;
        }
        self.state.set(ChannelState::Interrupted);
        if let Some(handle) = self.loop_thread.lock().unwrap().take() {
            info!("writer loop thread waiting for join");
            let _ = handle.join();
        }
    }
}

impl Drop for DataWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WriterWorker {
    fn run(mut self) {
        let output_ids = self.output_queue_ids.clone();
        loop {
            let mut min_pass_by_ts: Option<Instant> = None;
            let mut empty_sent = 0usize;

            for queue_id in &output_ids {
                if self.state.get() != ChannelState::Running {
                    return;
                }
                let info = self
                    .channel_info_map
                    .get_mut(queue_id)
                    .expect("channel registered at init");
                let mut pushed_empty = false;
                let write_status = write_channel_process(
                    info,
                    self.transfer.as_mut(),
                    &self.config,
                    &mut pushed_empty,
                );
                match write_status {
                    Ok(()) => {
                        info.message_pass_by_ts = Instant::now();
                        if pushed_empty {
                            min_pass_by_ts = Some(
                                min_pass_by_ts
                                    .map_or(info.message_pass_by_ts, |m| m.min(info.message_pass_by_ts)),
                            );
                            empty_sent += 1;
                        }
                    }
                    // Natural back-pressure; the staged bundle is retried
                    // next sweep.
                    Err(TransferError::FullChannel) => {}
                    Err(TransferError::EmptyRingBuffer) => {}
                    Err(err) => {
                        debug!(queue = %queue_id, %err, pushed_empty, "write buffer status");
                    }
                }
            }

            // Sleep only if every channel sent nothing but a heartbeat this
            // sweep; pace off the oldest heartbeat so real traffic is never
            // starved.
            if empty_sent == output_ids.len() {
                if let Some(min_ts) = min_pass_by_ts {
                    let elapsed = min_ts.elapsed();
                    // elapsed can exceed the interval under network jitter
                    if elapsed <= self.config.empty_message_interval {
                        std::thread::sleep(self.config.empty_message_interval - elapsed);
                    }
                }
            }
        }
    }
}

fn is_message_available(info: &ProducerChannelInfo) -> bool {
    info.writer_ring_buffer.is_transient_ready() || !info.writer_ring_buffer.is_empty()
}

/// One channel step of the sweep: flush ring data if any, else emit a
/// heartbeat once the channel has been idle past the interval.
fn write_channel_process(
    info: &mut ProducerChannelInfo,
    transfer: &mut dyn ProducerTransfer,
    config: &TransferConfig,
    is_empty_message: &mut bool,
) -> Result<()> {
    match write_buffer_to_channel(info, transfer, config) {
        Err(TransferError::EmptyRingBuffer)
            if info.message_pass_by_ts.elapsed() >= config.empty_message_interval =>
        {
            *is_empty_message = true;
            let status = write_empty_message(info, transfer);
            debug!(queue = %info.channel_id, "send empty message bundle");
            status
        }
        other => other,
    }
}

fn write_buffer_to_channel(
    info: &mut ProducerChannelInfo,
    transfer: &mut dyn ProducerTransfer,
    config: &TransferConfig,
) -> Result<()> {
    if !is_message_available(info) {
        return Err(TransferError::EmptyRingBuffer);
    }

    // Flush a previously staged bundle before collecting a new one.
    if !info.writer_ring_buffer.is_transient_ready() {
        collect_from_ring_buffer(info, config.ring_buffer_capacity);
    }
    write_transient_to_channel(info, transfer)
}

/// Drains the ring front-to-back into a staged bundle. Collection breaks
/// when the message count hits `max_messages`, when the next message would
/// push the byte total to the channel budget (a non-empty bundle only), or
/// when the next message's type differs from the bundle's.
fn collect_from_ring_buffer(info: &ProducerChannelInfo, max_messages: usize) {
    let ring = &info.writer_ring_buffer;
    let max_bundle_bytes = info.queue_size;

    let mut messages: Vec<StreamingMessage> = Vec::new();
    let mut bundle_bytes = 0u64;
    while messages.len() < max_messages {
        let Some(front) = ring.front() else { break };
        let message_total_size = front.encoded_len() as u64;
        if !messages.is_empty() && bundle_bytes + message_total_size >= max_bundle_bytes {
            debug!(
                queue = %info.channel_id,
                message_total_size,
                max_bundle_bytes,
                "bundle byte budget reached"
            );
            break;
        }
        if !messages.is_empty()
            && messages.last().map(|m| m.message_type) != Some(front.message_type)
        {
            break;
        }
        bundle_bytes += message_total_size;
        messages.push(ring.pop().expect("front was present"));
    }
    debug_assert!(!messages.is_empty(), "collect called on a drained ring");

    if bundle_bytes >= info.queue_size {
        warn!(
            queue = %info.channel_id,
            bundle_bytes,
            queue_size = info.queue_size,
            "single bundle exceeds the channel byte budget"
        );
    }

    let bundle = MessageBundle::from_messages(messages, current_sys_time_ms());
    ring.realloc_transient(bundle.encoded_len());
    bundle.encode_into(ring.transient_mut());
    ring.seal_transient();
}

/// Hands the staged bundle to the backend and commits it. A Barrier bundle
/// forces the transient allocation to be released, not just cleared.
fn write_transient_to_channel(
    info: &mut ProducerChannelInfo,
    transfer: &mut dyn ProducerTransfer,
) -> Result<()> {
    transfer.produce_item(info, info.writer_ring_buffer.transient())?;
    info.current_seq_id += 1;
    let meta = BundleMeta::decode(info.writer_ring_buffer.transient())?;
    info.writer_ring_buffer.free_transient(meta.is_barrier());
    info.message_last_commit_id = meta.last_message_id;
    Ok(())
}

/// Emits a header-only heartbeat carrying the channel's message high-water
/// mark. Skipped while messages assigned ids have not all been committed;
/// a heartbeat then would race the pending bundle.
fn write_empty_message(
    info: &mut ProducerChannelInfo,
    transfer: &mut dyn ProducerTransfer,
) -> Result<()> {
    let high_water_mark = info.current_message_id.load(Ordering::SeqCst);
    if info.message_last_commit_id < high_water_mark {
        debug!(
            queue = %info.channel_id,
            last_commit_id = info.message_last_commit_id,
            channel_max_id = high_water_mark,
            "abort empty message, ring buffer not drained"
        );
        return Err(TransferError::SkipSendEmptyMessage);
    }

    let bundle = MessageBundle::empty(high_water_mark, current_sys_time_ms());
    let ring = &info.writer_ring_buffer;
    ring.realloc_transient(bundle.encoded_len());
    bundle.encode_into(ring.transient_mut());
    ring.seal_transient();

    let status = transfer.produce_item(info, ring.transient());
    ring.free_transient(false);
    status?;

    info.current_seq_id += 1;
    info.message_pass_by_ts = Instant::now();
    Ok(())
}
