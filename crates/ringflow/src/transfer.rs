//! Channel transfer: the producer/consumer façade over a pluggable backend.
//!
//! A channel is a named unidirectional stream of `(seq_id, bytes)` items.
//! [`ProducerTransfer`] and [`ConsumerTransfer`] are the writer's and
//! reader's capability surfaces; three backends implement them:
//!
//! - **Memory**: process-global FIFO channels, for tests and single-worker
//!   pipelines.
//! - **Plasma**: items parked in a shared-memory object store behind the
//!   [`ObjectStore`] seam, one object per bundle.
//! - **StreamingQueue**: actor-to-actor delivery over the queue services in
//!   [`crate::service`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::{QueueType, TransferConfig};
use crate::error::{Result, TransferError};
use crate::message::{ActorId, ChannelId};
use crate::ring::RingBuffer;
use crate::service::{DownstreamService, ReaderQueue, UpstreamService, WriterQueue};
use crate::transport::ActorCall;

/// Writer-side per-channel state. Owned by the writer loop; only the message
/// id counter and the ring are shared with the application write path.
pub struct ProducerChannelInfo {
    pub channel_id: ChannelId,
    /// Highest message seq id assigned on this channel.
    pub current_message_id: Arc<AtomicU64>,
    /// Bundle counter handed to the backend.
    pub current_seq_id: u64,
    /// Last message seq id whose bundle reached the backend.
    pub message_last_commit_id: u64,
    /// Time of the last successful outbound bundle.
    pub message_pass_by_ts: Instant,
    /// Per-bundle byte budget.
    pub queue_size: u64,
    /// Producer-side view of the consumer's reclamation watermark, updated
    /// by `refresh_channel_info`.
    pub reclaimed_offset: u64,
    pub writer_ring_buffer: Arc<RingBuffer>,
}

impl ProducerChannelInfo {
    pub fn new(
        channel_id: ChannelId,
        writer_ring_buffer: Arc<RingBuffer>,
        starting_message_id: u64,
        queue_size: u64,
    ) -> Self {
        Self {
            channel_id,
            current_message_id: Arc::new(AtomicU64::new(starting_message_id)),
            current_seq_id: 0,
            message_last_commit_id: starting_message_id,
            message_pass_by_ts: Instant::now(),
            queue_size,
            reclaimed_offset: 0,
            writer_ring_buffer,
        }
    }
}

/// Reader-side per-channel state, exposed to an external checkpointer via
/// `DataReader::offset_info`.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerChannelInfo {
    pub channel_id: ChannelId,
    /// Last delivered bundle seq id.
    pub current_seq_id: u64,
    /// Message high-water mark of the last delivered bundle.
    pub last_message_id: u64,
    /// Reclamation high-water mark this reader has reported upstream.
    pub reclaimed_offset: u64,
}

impl ConsumerChannelInfo {
    pub fn new(channel_id: ChannelId, current_seq_id: u64, last_message_id: u64) -> Self {
        Self {
            channel_id,
            current_seq_id,
            last_message_id,
            reclaimed_offset: 0,
        }
    }
}

/// Writer-side channel capability surface.
pub trait ProducerTransfer: Send + Sync {
    fn create_channel(&mut self, info: &ProducerChannelInfo) -> Result<()>;
    fn destroy_channel(&mut self, info: &ProducerChannelInfo) -> Result<()>;

    /// Hands one bundle image to the backend under seq `info.current_seq_id
    /// + 1`. The caller bumps the counter on success.
    fn produce_item(&mut self, info: &ProducerChannelInfo, data: &[u8]) -> Result<()>;

    /// Polls the peer until every channel is ready or `timeout` expires;
    /// returns the ids that never became ready.
    fn wait_channels_ready(&mut self, ids: &[ChannelId], timeout: Duration) -> Vec<ChannelId>;

    /// Producer-side reclamation: storage for items with `seq_id <= offset`
    /// may be released.
    fn notify_consumed(&mut self, info: &ProducerChannelInfo, offset: u64) -> Result<()>;

    /// Releases everything a completed checkpoint no longer needs.
    fn clear_checkpoint(
        &mut self,
        info: &ProducerChannelInfo,
        checkpoint_id: u64,
        checkpoint_offset: u64,
    ) -> Result<()>;

    /// Refreshes backend-owned fields of `info` (the reclamation watermark).
    fn refresh_channel_info(&mut self, info: &mut ProducerChannelInfo) -> Result<()>;
}

/// Reader-side channel capability surface.
pub trait ConsumerTransfer: Send {
    fn create_channel(&mut self, info: &ConsumerChannelInfo) -> Result<()>;
    fn destroy_channel(&mut self, info: &ConsumerChannelInfo) -> Result<()>;

    /// Fetches the next item. `timeout = None` blocks until one arrives;
    /// otherwise `NoSuchItem` after the timeout expires.
    fn consume_item(
        &mut self,
        info: &ConsumerChannelInfo,
        timeout: Option<Duration>,
    ) -> Result<(u64, Vec<u8>)>;

    fn wait_channels_ready(&mut self, ids: &[ChannelId], timeout: Duration) -> Vec<ChannelId>;

    /// Tells the writer that items up to `offset` will never be re-requested.
    fn notify_consumed(&mut self, info: &mut ConsumerChannelInfo, offset: u64) -> Result<()>;

    fn clear_checkpoint(
        &mut self,
        info: &ConsumerChannelInfo,
        checkpoint_id: u64,
        checkpoint_offset: u64,
    ) -> Result<()>;

    fn refresh_channel_info(&mut self, info: &mut ConsumerChannelInfo) -> Result<()>;
}

// ---------------------------------------------------------------------
// Memory backend
// ---------------------------------------------------------------------

struct MemoryChannelState {
    items: VecDeque<(u64, Vec<u8>)>,
    queued_bytes: u64,
    consumed_watermark: u64,
    closed: bool,
}

/// One process-global in-memory channel.
struct MemoryChannel {
    max_bytes: u64,
    state: Mutex<MemoryChannelState>,
    available: Condvar,
}

impl MemoryChannel {
    fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            state: Mutex::new(MemoryChannelState {
                items: VecDeque::new(),
                queued_bytes: 0,
                consumed_watermark: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn produce(&self, seq_id: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransferError::ChannelClosed);
        }
        let len = data.len() as u64;
        if state.queued_bytes + len > self.max_bytes {
            return Err(TransferError::FullChannel);
        }
        state.items.push_back((seq_id, data.to_vec()));
        state.queued_bytes += len;
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn consume(&self, timeout: Option<Duration>) -> Result<(u64, Vec<u8>)> {
        let mut state = self.state.lock().unwrap();
        match timeout {
            None => {
                while state.items.is_empty() {
                    if state.closed {
                        return Err(TransferError::ChannelClosed);
                    }
                    state = self.available.wait(state).unwrap();
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while state.items.is_empty() {
                    if state.closed {
                        return Err(TransferError::ChannelClosed);
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(TransferError::NoSuchItem);
                    }
                    let (guard, _) = self.available.wait_timeout(state, remaining).unwrap();
                    state = guard;
                }
            }
        }
        let (seq_id, data) = state.items.pop_front().unwrap();
        state.queued_bytes -= data.len() as u64;
        Ok((seq_id, data))
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.available.notify_all();
    }
}

type MemoryRegistry = Mutex<HashMap<ChannelId, Arc<MemoryChannel>>>;

static MEMORY_CHANNELS: OnceLock<MemoryRegistry> = OnceLock::new();

fn memory_registry() -> &'static MemoryRegistry {
    MEMORY_CHANNELS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn memory_channel(channel_id: &ChannelId) -> Result<Arc<MemoryChannel>> {
    memory_registry()
        .lock()
        .unwrap()
        .get(channel_id)
        .cloned()
        .ok_or(TransferError::ChannelClosed)
}

/// Writer side of the in-process backend.
#[derive(Default)]
pub struct MemoryProducer;

impl ProducerTransfer for MemoryProducer {
    fn create_channel(&mut self, info: &ProducerChannelInfo) -> Result<()> {
        memory_registry()
            .lock()
            .unwrap()
            .entry(info.channel_id)
            .or_insert_with(|| Arc::new(MemoryChannel::new(info.queue_size)));
        Ok(())
    }

    fn destroy_channel(&mut self, info: &ProducerChannelInfo) -> Result<()> {
        if let Some(channel) = memory_registry().lock().unwrap().remove(&info.channel_id) {
            channel.close();
        }
        Ok(())
    }

    fn produce_item(&mut self, info: &ProducerChannelInfo, data: &[u8]) -> Result<()> {
        memory_channel(&info.channel_id)?.produce(info.current_seq_id + 1, data)
    }

    fn wait_channels_ready(&mut self, ids: &[ChannelId], _timeout: Duration) -> Vec<ChannelId> {
        let registry = memory_registry().lock().unwrap();
        ids.iter()
            .filter(|id| !registry.contains_key(*id))
            .copied()
            .collect()
    }

    fn notify_consumed(&mut self, info: &ProducerChannelInfo, offset: u64) -> Result<()> {
        let channel = memory_channel(&info.channel_id)?;
        let mut state = channel.state.lock().unwrap();
        state.consumed_watermark = state.consumed_watermark.max(offset);
        Ok(())
    }

    fn clear_checkpoint(
        &mut self,
        info: &ProducerChannelInfo,
        checkpoint_id: u64,
        checkpoint_offset: u64,
    ) -> Result<()> {
        debug!(channel = %info.channel_id, checkpoint_id, checkpoint_offset, "clear checkpoint");
        let channel = memory_channel(&info.channel_id)?;
        let mut state = channel.state.lock().unwrap();
        while state
            .items
            .front()
            .is_some_and(|(seq, _)| *seq <= checkpoint_offset)
        {
            let (_, data) = state.items.pop_front().unwrap();
            state.queued_bytes -= data.len() as u64;
        }
        Ok(())
    }

    fn refresh_channel_info(&mut self, info: &mut ProducerChannelInfo) -> Result<()> {
        let channel = memory_channel(&info.channel_id)?;
        info.reclaimed_offset = channel.state.lock().unwrap().consumed_watermark;
        Ok(())
    }
}

/// Reader side of the in-process backend.
#[derive(Default)]
pub struct MemoryConsumer;

impl ConsumerTransfer for MemoryConsumer {
    fn create_channel(&mut self, info: &ConsumerChannelInfo) -> Result<()> {
        // The producer usually creates first; either side may win the race.
        memory_registry()
            .lock()
            .unwrap()
            .entry(info.channel_id)
            .or_insert_with(|| Arc::new(MemoryChannel::new(u64::MAX)));
        Ok(())
    }

    fn destroy_channel(&mut self, info: &ConsumerChannelInfo) -> Result<()> {
        if let Some(channel) = memory_registry().lock().unwrap().remove(&info.channel_id) {
            channel.close();
        }
        Ok(())
    }

    fn consume_item(
        &mut self,
        info: &ConsumerChannelInfo,
        timeout: Option<Duration>,
    ) -> Result<(u64, Vec<u8>)> {
        memory_channel(&info.channel_id)?.consume(timeout)
    }

    fn wait_channels_ready(&mut self, ids: &[ChannelId], _timeout: Duration) -> Vec<ChannelId> {
        let registry = memory_registry().lock().unwrap();
        ids.iter()
            .filter(|id| !registry.contains_key(*id))
            .copied()
            .collect()
    }

    fn notify_consumed(&mut self, info: &mut ConsumerChannelInfo, offset: u64) -> Result<()> {
        let channel = memory_channel(&info.channel_id)?;
        let mut state = channel.state.lock().unwrap();
        state.consumed_watermark = state.consumed_watermark.max(offset);
        info.reclaimed_offset = offset;
        Ok(())
    }

    fn clear_checkpoint(
        &mut self,
        _info: &ConsumerChannelInfo,
        _checkpoint_id: u64,
        _checkpoint_offset: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn refresh_channel_info(&mut self, info: &mut ConsumerChannelInfo) -> Result<()> {
        let channel = memory_channel(&info.channel_id)?;
        info.reclaimed_offset = channel.state.lock().unwrap().consumed_watermark;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Plasma backend
// ---------------------------------------------------------------------

/// Seam to the shared-memory object store. The store itself is an external
/// collaborator; [`MemoryObjectStore`] backs tests and demos.
pub trait ObjectStore: Send + Sync {
    fn put(&self, id: ChannelId, data: Vec<u8>) -> Result<()>;
    /// `timeout = None` blocks until the object appears.
    fn get(&self, id: &ChannelId, timeout: Option<Duration>) -> Result<Vec<u8>>;
    fn delete(&self, ids: &[ChannelId]) -> Result<()>;
    fn contains(&self, id: &ChannelId) -> bool;
}

/// Writer side over an object store: one object per bundle, id derived from
/// the channel id and the bundle seq. A marker object at the bare channel id
/// signals channel existence for the readiness probe.
pub struct PlasmaProducer {
    store: Arc<dyn ObjectStore>,
    /// Per channel: highest seq already deleted by reclamation.
    deleted_up_to: HashMap<ChannelId, u64>,
}

impl PlasmaProducer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            deleted_up_to: HashMap::new(),
        }
    }

    fn delete_range(&mut self, info: &ProducerChannelInfo, up_to: u64) -> Result<()> {
        let deleted = self.deleted_up_to.entry(info.channel_id).or_insert(0);
        if up_to <= *deleted {
            return Ok(());
        }
        let ids: Vec<ChannelId> = (*deleted + 1..=up_to)
            .map(|seq| info.channel_id.with_seq(seq))
            .collect();
        self.store.delete(&ids)?;
        *deleted = up_to;
        Ok(())
    }
}

impl ProducerTransfer for PlasmaProducer {
    fn create_channel(&mut self, info: &ProducerChannelInfo) -> Result<()> {
        self.store.put(info.channel_id, Vec::new())
    }

    fn destroy_channel(&mut self, info: &ProducerChannelInfo) -> Result<()> {
        self.store.delete(&[info.channel_id])
    }

    fn produce_item(&mut self, info: &ProducerChannelInfo, data: &[u8]) -> Result<()> {
        self.store
            .put(info.channel_id.with_seq(info.current_seq_id + 1), data.to_vec())
    }

    fn wait_channels_ready(&mut self, ids: &[ChannelId], timeout: Duration) -> Vec<ChannelId> {
        let deadline = Instant::now() + timeout;
        let mut missing: Vec<ChannelId> = ids.to_vec();
        loop {
            missing.retain(|id| !self.store.contains(id));
            if missing.is_empty() || Instant::now() >= deadline {
                return missing;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn notify_consumed(&mut self, info: &ProducerChannelInfo, offset: u64) -> Result<()> {
        self.delete_range(info, offset)
    }

    fn clear_checkpoint(
        &mut self,
        info: &ProducerChannelInfo,
        _checkpoint_id: u64,
        checkpoint_offset: u64,
    ) -> Result<()> {
        self.delete_range(info, checkpoint_offset)
    }

    fn refresh_channel_info(&mut self, info: &mut ProducerChannelInfo) -> Result<()> {
        info.reclaimed_offset = self.deleted_up_to.get(&info.channel_id).copied().unwrap_or(0);
        Ok(())
    }
}

/// Reader side over an object store: fetches `seq + 1` of each channel.
pub struct PlasmaConsumer {
    store: Arc<dyn ObjectStore>,
    /// Per channel: next seq to fetch.
    cursors: HashMap<ChannelId, u64>,
}

impl PlasmaConsumer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            cursors: HashMap::new(),
        }
    }
}

impl ConsumerTransfer for PlasmaConsumer {
    fn create_channel(&mut self, info: &ConsumerChannelInfo) -> Result<()> {
        self.cursors.insert(info.channel_id, info.current_seq_id + 1);
        Ok(())
    }

    fn destroy_channel(&mut self, info: &ConsumerChannelInfo) -> Result<()> {
        self.cursors.remove(&info.channel_id);
        Ok(())
    }

    fn consume_item(
        &mut self,
        info: &ConsumerChannelInfo,
        timeout: Option<Duration>,
    ) -> Result<(u64, Vec<u8>)> {
        let cursor = self
            .cursors
            .get_mut(&info.channel_id)
            .ok_or(TransferError::ChannelClosed)?;
        let data = self.store.get(&info.channel_id.with_seq(*cursor), timeout)?;
        let seq_id = *cursor;
        *cursor += 1;
        Ok((seq_id, data))
    }

    fn wait_channels_ready(&mut self, ids: &[ChannelId], timeout: Duration) -> Vec<ChannelId> {
        let deadline = Instant::now() + timeout;
        let mut missing: Vec<ChannelId> = ids.to_vec();
        loop {
            missing.retain(|id| !self.store.contains(id));
            if missing.is_empty() || Instant::now() >= deadline {
                return missing;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn notify_consumed(&mut self, info: &mut ConsumerChannelInfo, offset: u64) -> Result<()> {
        // Deletion is the producer's job; the reader only records the mark.
        info.reclaimed_offset = offset;
        Ok(())
    }

    fn clear_checkpoint(
        &mut self,
        _info: &ConsumerChannelInfo,
        _checkpoint_id: u64,
        _checkpoint_offset: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn refresh_channel_info(&mut self, _info: &mut ConsumerChannelInfo) -> Result<()> {
        Ok(())
    }
}

/// In-memory [`ObjectStore`] for tests and demos.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<ChannelId, Vec<u8>>>,
    arrived: Condvar,
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, id: ChannelId, data: Vec<u8>) -> Result<()> {
        self.objects.lock().unwrap().insert(id, data);
        self.arrived.notify_all();
        Ok(())
    }

    fn get(&self, id: &ChannelId, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut objects = self.objects.lock().unwrap();
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(data) = objects.get(id) {
                return Ok(data.clone());
            }
            match deadline {
                None => objects = self.arrived.wait(objects).unwrap(),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(TransferError::NoSuchItem);
                    }
                    let (guard, _) = self.arrived.wait_timeout(objects, remaining).unwrap();
                    objects = guard;
                }
            }
        }
    }

    fn delete(&self, ids: &[ChannelId]) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        for id in ids {
            objects.remove(id);
        }
        Ok(())
    }

    fn contains(&self, id: &ChannelId) -> bool {
        self.objects.lock().unwrap().contains_key(id)
    }
}

// ---------------------------------------------------------------------
// StreamingQueue backend
// ---------------------------------------------------------------------

/// Writer side over the actor-to-actor queue service.
pub struct StreamingQueueProducer {
    service: Arc<UpstreamService>,
    peer_actors: HashMap<ChannelId, ActorId>,
    queues: HashMap<ChannelId, Arc<WriterQueue>>,
    check_retries: u32,
    sync_call_timeout: Duration,
}

impl StreamingQueueProducer {
    pub fn new(
        service: Arc<UpstreamService>,
        peer_actors: HashMap<ChannelId, ActorId>,
        config: &TransferConfig,
    ) -> Self {
        Self {
            service,
            peer_actors,
            queues: HashMap::new(),
            check_retries: config.check_queue_retries,
            sync_call_timeout: config.sync_call_timeout,
        }
    }

    fn queue(&self, channel_id: &ChannelId) -> Result<&Arc<WriterQueue>> {
        self.queues
            .get(channel_id)
            .ok_or(TransferError::ChannelClosed)
    }
}

impl ProducerTransfer for StreamingQueueProducer {
    fn create_channel(&mut self, info: &ProducerChannelInfo) -> Result<()> {
        let peer = *self.peer_actors.get(&info.channel_id).ok_or_else(|| {
            TransferError::InitQueueFailed(format!("no peer actor for {}", info.channel_id))
        })?;
        let queue = self
            .service
            .create_upstream_queue(info.channel_id, peer, info.queue_size)?;
        self.queues.insert(info.channel_id, queue);
        Ok(())
    }

    fn destroy_channel(&mut self, info: &ProducerChannelInfo) -> Result<()> {
        self.queues.remove(&info.channel_id);
        Ok(())
    }

    fn produce_item(&mut self, info: &ProducerChannelInfo, data: &[u8]) -> Result<()> {
        self.queue(&info.channel_id)?
            .produce(info.current_seq_id + 1, data)
    }

    fn wait_channels_ready(&mut self, ids: &[ChannelId], timeout: Duration) -> Vec<ChannelId> {
        self.service
            .wait_queues(ids, timeout, self.check_retries, self.sync_call_timeout)
    }

    fn notify_consumed(&mut self, info: &ProducerChannelInfo, offset: u64) -> Result<()> {
        self.queue(&info.channel_id)?.on_notify(offset);
        Ok(())
    }

    fn clear_checkpoint(
        &mut self,
        info: &ProducerChannelInfo,
        checkpoint_id: u64,
        checkpoint_offset: u64,
    ) -> Result<()> {
        info!(channel = %info.channel_id, checkpoint_id, checkpoint_offset, "clear checkpoint");
        self.queue(&info.channel_id)?.on_notify(checkpoint_offset);
        Ok(())
    }

    fn refresh_channel_info(&mut self, info: &mut ProducerChannelInfo) -> Result<()> {
        info.reclaimed_offset = self.queue(&info.channel_id)?.reclaim_watermark();
        Ok(())
    }
}

/// Reader side over the actor-to-actor queue service.
pub struct StreamingQueueConsumer {
    service: Arc<DownstreamService>,
    peer_actors: HashMap<ChannelId, ActorId>,
    queues: HashMap<ChannelId, Arc<ReaderQueue>>,
}

impl StreamingQueueConsumer {
    pub fn new(service: Arc<DownstreamService>, peer_actors: HashMap<ChannelId, ActorId>) -> Self {
        Self {
            service,
            peer_actors,
            queues: HashMap::new(),
        }
    }

    fn queue(&self, channel_id: &ChannelId) -> Result<&Arc<ReaderQueue>> {
        self.queues
            .get(channel_id)
            .ok_or(TransferError::ChannelClosed)
    }
}

impl ConsumerTransfer for StreamingQueueConsumer {
    fn create_channel(&mut self, info: &ConsumerChannelInfo) -> Result<()> {
        let peer = *self.peer_actors.get(&info.channel_id).ok_or_else(|| {
            TransferError::InitQueueFailed(format!("no peer actor for {}", info.channel_id))
        })?;
        let queue = self.service.create_downstream_queue(info.channel_id, peer)?;
        self.queues.insert(info.channel_id, queue);
        Ok(())
    }

    fn destroy_channel(&mut self, info: &ConsumerChannelInfo) -> Result<()> {
        self.queues.remove(&info.channel_id);
        Ok(())
    }

    fn consume_item(
        &mut self,
        info: &ConsumerChannelInfo,
        timeout: Option<Duration>,
    ) -> Result<(u64, Vec<u8>)> {
        self.queue(&info.channel_id)?.consume(timeout)
    }

    fn wait_channels_ready(&mut self, ids: &[ChannelId], _timeout: Duration) -> Vec<ChannelId> {
        // The downstream side is ready as soon as its queues exist; the
        // probing is done by the upstream peer.
        ids.iter()
            .filter(|id| !self.queues.contains_key(*id))
            .copied()
            .collect()
    }

    fn notify_consumed(&mut self, info: &mut ConsumerChannelInfo, offset: u64) -> Result<()> {
        self.queue(&info.channel_id)?.notify_consumed(offset);
        info.reclaimed_offset = offset;
        Ok(())
    }

    fn clear_checkpoint(
        &mut self,
        _info: &ConsumerChannelInfo,
        _checkpoint_id: u64,
        _checkpoint_offset: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn refresh_channel_info(&mut self, info: &mut ConsumerChannelInfo) -> Result<()> {
        info.reclaimed_offset = self.queue(&info.channel_id)?.consumed_watermark();
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------

/// Wiring a backend needs beyond the config: the host RPC caller and actor
/// identity for streaming queues, the object store for plasma.
#[derive(Clone)]
pub struct TransferContext {
    pub caller: Option<Arc<dyn ActorCall>>,
    pub actor_id: ActorId,
    pub peer_actors: HashMap<ChannelId, ActorId>,
    pub object_store: Option<Arc<dyn ObjectStore>>,
}

impl Default for TransferContext {
    fn default() -> Self {
        Self {
            caller: None,
            actor_id: ActorId::nil(),
            peer_actors: HashMap::new(),
            object_store: None,
        }
    }
}

/// Builds the producer transfer selected by `config.queue_type`.
pub fn new_producer_transfer(
    config: &TransferConfig,
    context: &TransferContext,
) -> Result<Box<dyn ProducerTransfer>> {
    match config.queue_type {
        QueueType::Memory => Ok(Box::new(MemoryProducer)),
        QueueType::Plasma => {
            let store = context.object_store.clone().ok_or_else(|| {
                TransferError::InitQueueFailed("plasma backend needs an object store".into())
            })?;
            Ok(Box::new(PlasmaProducer::new(store)))
        }
        QueueType::StreamingQueue => {
            let caller = context.caller.clone().ok_or_else(|| {
                TransferError::InitQueueFailed("streaming queue backend needs an actor caller".into())
            })?;
            let service = UpstreamService::get_service(&caller, context.actor_id);
            Ok(Box::new(StreamingQueueProducer::new(
                service,
                context.peer_actors.clone(),
                config,
            )))
        }
    }
}

/// Builds the consumer transfer selected by `config.queue_type`.
pub fn new_consumer_transfer(
    config: &TransferConfig,
    context: &TransferContext,
) -> Result<Box<dyn ConsumerTransfer>> {
    match config.queue_type {
        QueueType::Memory => Ok(Box::new(MemoryConsumer)),
        QueueType::Plasma => {
            let store = context.object_store.clone().ok_or_else(|| {
                TransferError::InitQueueFailed("plasma backend needs an object store".into())
            })?;
            Ok(Box::new(PlasmaConsumer::new(store)))
        }
        QueueType::StreamingQueue => {
            let caller = context.caller.clone().ok_or_else(|| {
                TransferError::InitQueueFailed("streaming queue backend needs an actor caller".into())
            })?;
            let service = DownstreamService::get_service(&caller, context.actor_id);
            Ok(Box::new(StreamingQueueConsumer::new(
                service,
                context.peer_actors.clone(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer_info(channel_id: ChannelId, queue_size: u64) -> ProducerChannelInfo {
        ProducerChannelInfo::new(channel_id, Arc::new(RingBuffer::new(8)), 0, queue_size)
    }

    #[test]
    fn test_memory_produce_consume() {
        let channel_id = ChannelId::random();
        let mut producer = MemoryProducer;
        let mut consumer = MemoryConsumer;
        let mut info = producer_info(channel_id, 10_000);
        let mut consumer_info = ConsumerChannelInfo::new(channel_id, 0, 0);

        producer.create_channel(&info).unwrap();
        producer.produce_item(&info, &[1, 2, 3]).unwrap();
        info.current_seq_id += 1;

        let (seq, data) = consumer
            .consume_item(&consumer_info, Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(data, vec![1, 2, 3]);

        consumer.notify_consumed(&mut consumer_info, 1).unwrap();
        assert_eq!(
            consumer.consume_item(&consumer_info, Some(Duration::from_millis(5))),
            Err(TransferError::NoSuchItem)
        );
    }

    #[test]
    fn test_memory_reclaim_watermark_reaches_producer() {
        let channel_id = ChannelId::random();
        let mut producer = MemoryProducer;
        let mut consumer = MemoryConsumer;
        let mut info = producer_info(channel_id, 10_000);
        let mut consumer_info = ConsumerChannelInfo::new(channel_id, 0, 0);

        producer.create_channel(&info).unwrap();
        for _ in 0..3 {
            producer.produce_item(&info, &[0; 16]).unwrap();
            info.current_seq_id += 1;
        }
        for _ in 0..3 {
            consumer
                .consume_item(&consumer_info, Some(Duration::from_millis(100)))
                .unwrap();
        }
        consumer.notify_consumed(&mut consumer_info, 3).unwrap();

        producer.refresh_channel_info(&mut info).unwrap();
        assert!(info.reclaimed_offset >= 3);
    }

    #[test]
    fn test_memory_full_channel_backpressure() {
        let channel_id = ChannelId::random();
        let mut producer = MemoryProducer;
        let mut info = producer_info(channel_id, 100);

        producer.create_channel(&info).unwrap();
        producer.produce_item(&info, &[0; 80]).unwrap();
        info.current_seq_id += 1;
        assert_eq!(
            producer.produce_item(&info, &[0; 80]),
            Err(TransferError::FullChannel)
        );
    }

    #[test]
    fn test_memory_destroyed_channel_is_closed() {
        let channel_id = ChannelId::random();
        let mut producer = MemoryProducer;
        let info = producer_info(channel_id, 100);
        producer.create_channel(&info).unwrap();
        producer.destroy_channel(&info).unwrap();
        assert_eq!(
            producer.produce_item(&info, &[1]),
            Err(TransferError::ChannelClosed)
        );
    }

    #[test]
    fn test_plasma_round_trip_and_reclaim() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::default());
        let channel_id = ChannelId::random();
        let mut producer = PlasmaProducer::new(Arc::clone(&store));
        let mut consumer = PlasmaConsumer::new(Arc::clone(&store));
        let mut info = producer_info(channel_id, 10_000);
        let consumer_info = ConsumerChannelInfo::new(channel_id, 0, 0);

        producer.create_channel(&info).unwrap();
        consumer.create_channel(&consumer_info).unwrap();
        assert!(producer
            .wait_channels_ready(&[channel_id], Duration::from_millis(100))
            .is_empty());

        producer.produce_item(&info, &[7, 8, 9]).unwrap();
        info.current_seq_id += 1;
        let (seq, data) = consumer
            .consume_item(&consumer_info, Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(data, vec![7, 8, 9]);

        producer.notify_consumed(&info, 1).unwrap();
        assert!(!store.contains(&channel_id.with_seq(1)));
        producer.refresh_channel_info(&mut info).unwrap();
        assert_eq!(info.reclaimed_offset, 1);
    }

    #[test]
    fn test_backend_selection_requires_wiring() {
        let config = TransferConfig::default().with_queue_type(QueueType::Plasma);
        assert!(matches!(
            new_producer_transfer(&config, &TransferContext::default()),
            Err(TransferError::InitQueueFailed(_))
        ));

        let config = TransferConfig::default().with_queue_type(QueueType::StreamingQueue);
        assert!(matches!(
            new_consumer_transfer(&config, &TransferContext::default()),
            Err(TransferError::InitQueueFailed(_))
        ));
    }
}
