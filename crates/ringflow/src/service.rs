//! Queue services: per-process wire-protocol state and dispatch.
//!
//! One service thread per role owns all per-queue protocol state and drains
//! an inbox of inbound RPC payloads. Host-task callbacks deliver payloads
//! with [`QueueService::dispatch_message`] (fire-and-forget) or
//! [`QueueService::dispatch_message_sync`] (blocks the RPC-caller thread on
//! a one-shot reply). Handlers are non-blocking; anything slow happens on
//! the writer/reader loops, never here.
//!
//! [`UpstreamService`] lives beside the writer (receives Notifications),
//! [`DownstreamService`] beside the reader (receives Data and Check).
//! Instances are process-wide, one per actor id, held in a lazy registry and
//! released via `release_all_*_queues`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::error::{Result, TransferError};
use crate::message::{ActorId, ChannelId};
use crate::protocol::{
    CheckMessage, CheckRspMessage, DataMessage, NotificationMessage, PeerHeader, ProtocolMessage,
    QueueError,
};
use crate::transport::{ActorCall, CallFunction, Transport};

/// Async entry point on the upstream (writer) actor.
pub const UPSTREAM_ASYNC_FUNCTION: CallFunction = CallFunction::new("upstream_async");
/// Sync entry point on the upstream (writer) actor.
pub const UPSTREAM_SYNC_FUNCTION: CallFunction = CallFunction::new("upstream_sync");
/// Async entry point on the downstream (reader) actor.
pub const DOWNSTREAM_ASYNC_FUNCTION: CallFunction = CallFunction::new("downstream_async");
/// Sync entry point on the downstream (reader) actor.
pub const DOWNSTREAM_SYNC_FUNCTION: CallFunction = CallFunction::new("downstream_sync");

/// Back-off between handshake sweeps in `wait_queues`.
const WAIT_QUEUES_SWEEP_BACKOFF: Duration = Duration::from_millis(50);

enum Inbound {
    Message(Vec<u8>, Option<Sender<Vec<u8>>>),
    Stop,
}

/// Shared plumbing of both services: inbox, service thread, peer routing.
pub struct QueueService {
    actor_id: ActorId,
    caller: Arc<dyn ActorCall>,
    inbox: Sender<Inbound>,
    thread: Mutex<Option<JoinHandle<()>>>,
    transports: Mutex<HashMap<ChannelId, Transport>>,
}

impl QueueService {
    fn new<F>(actor_id: ActorId, caller: Arc<dyn ActorCall>, handler: F) -> Self
    where
        F: Fn(ProtocolMessage, Option<Sender<Vec<u8>>>) + Send + 'static,
    {
        let (inbox, rx): (Sender<Inbound>, Receiver<Inbound>) = unbounded();
        let thread = std::thread::spawn(move || {
            for inbound in rx.iter() {
                match inbound {
                    Inbound::Message(bytes, reply) => match ProtocolMessage::decode(&bytes) {
                        Ok(message) => handler(message, reply),
                        Err(err) => panic!("undecodable protocol message: {err}"),
                    },
                    Inbound::Stop => break,
                }
            }
        });
        Self {
            actor_id,
            caller,
            inbox,
            thread: Mutex::new(Some(thread)),
            transports: Mutex::new(HashMap::new()),
        }
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    /// Registers the peer actor behind a queue and opens a transport to it.
    pub fn add_peer_actor(&self, queue_id: ChannelId, peer_actor_id: ActorId) {
        self.transports
            .lock()
            .unwrap()
            .entry(queue_id)
            .or_insert_with(|| Transport::new(Arc::clone(&self.caller), peer_actor_id));
    }

    pub fn out_transport(&self, queue_id: &ChannelId) -> Option<Transport> {
        self.transports.lock().unwrap().get(queue_id).cloned()
    }

    pub fn peer_actor(&self, queue_id: &ChannelId) -> Option<ActorId> {
        self.out_transport(queue_id).map(|t| t.peer_actor_id())
    }

    /// Posts an inbound payload for the service thread; returns immediately.
    pub fn dispatch_message(&self, bytes: Vec<u8>) {
        let _ = self.inbox.send(Inbound::Message(bytes, None));
    }

    /// Posts an inbound payload and blocks until the handler replies.
    pub fn dispatch_message_sync(&self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.inbox
            .send(Inbound::Message(bytes, Some(reply_tx)))
            .map_err(|_| TransferError::ChannelClosed)?;
        reply_rx
            .recv()
            .map_err(|_| TransferError::IoError("service thread dropped reply".into()))
    }

    fn release(&self) {
        self.transports.lock().unwrap().clear();
    }

    /// Stops the service thread and joins it.
    pub fn stop(&self) {
        info!(actor = %self.actor_id, "queue service stop");
        let _ = self.inbox.send(Inbound::Stop);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// One buffered, not-yet-reclaimed item on an upstream queue.
struct BufferedItem {
    seq_id: u64,
    len: u64,
}

struct WriterQueueState {
    items: VecDeque<BufferedItem>,
    buffered_bytes: u64,
    reclaim_watermark: u64,
}

/// Upstream per-queue state: buffers produced items until the consumer's
/// Notification reclaims them, applying the channel byte budget as
/// back-pressure.
pub struct WriterQueue {
    queue_id: ChannelId,
    actor_id: ActorId,
    peer_actor_id: ActorId,
    max_bytes: u64,
    transport: Transport,
    state: Mutex<WriterQueueState>,
}

impl WriterQueue {
    fn new(
        queue_id: ChannelId,
        actor_id: ActorId,
        peer_actor_id: ActorId,
        max_bytes: u64,
        transport: Transport,
    ) -> Self {
        Self {
            queue_id,
            actor_id,
            peer_actor_id,
            max_bytes,
            transport,
            state: Mutex::new(WriterQueueState {
                items: VecDeque::new(),
                buffered_bytes: 0,
                reclaim_watermark: 0,
            }),
        }
    }

    /// Accepts one produced bundle and pushes it downstream.
    ///
    /// `FullChannel` when unreclaimed items would exceed the byte budget.
    pub fn produce(&self, seq_id: u64, data: &[u8]) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let len = data.len() as u64;
            if state.buffered_bytes + len > self.max_bytes {
                return Err(TransferError::FullChannel);
            }
            state.items.push_back(BufferedItem { seq_id, len });
            state.buffered_bytes += len;
        }
        let message = DataMessage {
            header: self.header(),
            seq_id,
            payload: data.to_vec(),
        };
        self.transport
            .send(message.to_bytes(), &DOWNSTREAM_ASYNC_FUNCTION);
        Ok(())
    }

    /// Handles a consumer Notification: items with `seq_id <= watermark` are
    /// reclaimed. Stale notifications are ignored.
    pub fn on_notify(&self, watermark: u64) {
        let mut state = self.state.lock().unwrap();
        if watermark <= state.reclaim_watermark {
            debug!(queue = %self.queue_id, watermark, "stale notification ignored");
            return;
        }
        while state
            .items
            .front()
            .is_some_and(|item| item.seq_id <= watermark)
        {
            let item = state.items.pop_front().unwrap();
            state.buffered_bytes -= item.len;
        }
        state.reclaim_watermark = watermark;
    }

    /// Highest sequence id the consumer has promised never to re-request.
    pub fn reclaim_watermark(&self) -> u64 {
        self.state.lock().unwrap().reclaim_watermark
    }

    /// Bytes currently buffered awaiting reclamation.
    pub fn buffered_bytes(&self) -> u64 {
        self.state.lock().unwrap().buffered_bytes
    }

    fn header(&self) -> PeerHeader {
        PeerHeader {
            queue_id: self.queue_id,
            actor_id: self.actor_id,
            peer_actor_id: self.peer_actor_id,
        }
    }
}

struct ReaderQueueState {
    items: VecDeque<(u64, Vec<u8>)>,
    last_received_seq: u64,
    consumed_watermark: u64,
}

/// Downstream per-queue state: an inbox of received items plus the
/// consumption watermark reported back upstream.
pub struct ReaderQueue {
    queue_id: ChannelId,
    actor_id: ActorId,
    peer_actor_id: ActorId,
    transport: Transport,
    state: Mutex<ReaderQueueState>,
    available: Condvar,
}

impl ReaderQueue {
    fn new(
        queue_id: ChannelId,
        actor_id: ActorId,
        peer_actor_id: ActorId,
        transport: Transport,
    ) -> Self {
        Self {
            queue_id,
            actor_id,
            peer_actor_id,
            transport,
            state: Mutex::new(ReaderQueueState {
                items: VecDeque::new(),
                last_received_seq: 0,
                consumed_watermark: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Accepts an inbound Data message. Re-deliveries (at-least-once
    /// upstream) are dropped by bundle sequence id.
    pub fn on_data(&self, seq_id: u64, payload: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if seq_id <= state.last_received_seq {
            warn!(queue = %self.queue_id, seq_id, "duplicate item dropped");
            return;
        }
        state.last_received_seq = seq_id;
        state.items.push_back((seq_id, payload));
        drop(state);
        self.available.notify_one();
    }

    /// Pops the oldest received item.
    ///
    /// `timeout = None` blocks until an item arrives; otherwise `NoSuchItem`
    /// after the timeout expires.
    pub fn consume(&self, timeout: Option<Duration>) -> Result<(u64, Vec<u8>)> {
        let mut state = self.state.lock().unwrap();
        match timeout {
            None => {
                while state.items.is_empty() {
                    state = self.available.wait(state).unwrap();
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while state.items.is_empty() {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(TransferError::NoSuchItem);
                    }
                    let (guard, _) = self.available.wait_timeout(state, remaining).unwrap();
                    state = guard;
                }
            }
        }
        Ok(state.items.pop_front().unwrap())
    }

    /// Reports a consumption watermark back to the writer for reclamation.
    pub fn notify_consumed(&self, seq_id: u64) {
        self.state.lock().unwrap().consumed_watermark = seq_id;
        let message = NotificationMessage {
            header: PeerHeader {
                queue_id: self.queue_id,
                actor_id: self.actor_id,
                peer_actor_id: self.peer_actor_id,
            },
            seq_id,
        };
        self.transport
            .send(message.to_bytes(), &UPSTREAM_ASYNC_FUNCTION);
    }

    pub fn consumed_watermark(&self) -> u64 {
        self.state.lock().unwrap().consumed_watermark
    }
}

type UpstreamRegistry = Mutex<HashMap<ActorId, Arc<UpstreamService>>>;
type DownstreamRegistry = Mutex<HashMap<ActorId, Arc<DownstreamService>>>;

static UPSTREAM_REGISTRY: OnceLock<UpstreamRegistry> = OnceLock::new();
static DOWNSTREAM_REGISTRY: OnceLock<DownstreamRegistry> = OnceLock::new();

/// Upstream-side (writer) queue service.
pub struct UpstreamService {
    service: Arc<QueueService>,
    queues: Arc<Mutex<HashMap<ChannelId, Arc<WriterQueue>>>>,
}

impl UpstreamService {
    /// Returns the process-wide service for `actor_id`, creating it lazily.
    pub fn get_service(caller: &Arc<dyn ActorCall>, actor_id: ActorId) -> Arc<Self> {
        let registry = UPSTREAM_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        Arc::clone(
            registry
                .lock()
                .unwrap()
                .entry(actor_id)
                .or_insert_with(|| Arc::new(Self::new(Arc::clone(caller), actor_id))),
        )
    }

    fn new(caller: Arc<dyn ActorCall>, actor_id: ActorId) -> Self {
        let queues: Arc<Mutex<HashMap<ChannelId, Arc<WriterQueue>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let handler_queues = Arc::clone(&queues);
        let service = Arc::new(QueueService::new(
            actor_id,
            caller,
            move |message, _reply| match message {
                ProtocolMessage::Notification(notify) => {
                    let queue = handler_queues
                        .lock()
                        .unwrap()
                        .get(&notify.header.queue_id)
                        .cloned();
                    match queue {
                        Some(queue) => queue.on_notify(notify.seq_id),
                        None => warn!(
                            queue = %notify.header.queue_id,
                            seq_id = notify.seq_id,
                            "notification for unknown queue, maybe destroyed, ignored"
                        ),
                    }
                }
                ProtocolMessage::CheckRsp(_) => {
                    panic!("check response must not arrive through async dispatch")
                }
                other => panic!("unexpected upstream message: {other:?}"),
            },
        ));
        Self { service, queues }
    }

    /// The dispatch surface registered with the host RPC layer.
    pub fn queue_service(&self) -> &Arc<QueueService> {
        &self.service
    }

    /// Creates (or returns the existing) upstream queue toward one peer.
    pub fn create_upstream_queue(
        &self,
        queue_id: ChannelId,
        peer_actor_id: ActorId,
        size: u64,
    ) -> Result<Arc<WriterQueue>> {
        if let Some(existing) = self.get_up_queue(&queue_id) {
            warn!(queue = %queue_id, "duplicate upstream queue creation");
            return Ok(existing);
        }
        info!(
            queue = %queue_id,
            actor = %self.service.actor_id(),
            peer = %peer_actor_id,
            "create upstream queue"
        );
        self.service.add_peer_actor(queue_id, peer_actor_id);
        let transport = self
            .service
            .out_transport(&queue_id)
            .ok_or_else(|| TransferError::InitQueueFailed(format!("no transport for {queue_id}")))?;
        let queue = Arc::new(WriterQueue::new(
            queue_id,
            self.service.actor_id(),
            peer_actor_id,
            size,
            transport,
        ));
        self.queues.lock().unwrap().insert(queue_id, Arc::clone(&queue));
        Ok(queue)
    }

    pub fn get_up_queue(&self, queue_id: &ChannelId) -> Option<Arc<WriterQueue>> {
        self.queues.lock().unwrap().get(queue_id).cloned()
    }

    pub fn upstream_queue_exists(&self, queue_id: &ChannelId) -> bool {
        self.get_up_queue(queue_id).is_some()
    }

    /// One synchronous readiness probe of the downstream peer.
    ///
    /// Panics on protocol corruption: a non-CheckRsp reply or a reply whose
    /// peer actor id does not echo this side's id.
    pub fn check_queue_sync(
        &self,
        queue_id: &ChannelId,
        retries: u32,
        call_timeout: Duration,
    ) -> bool {
        let Some(transport) = self.service.out_transport(queue_id) else {
            return false;
        };
        let message = CheckMessage {
            header: PeerHeader {
                queue_id: *queue_id,
                actor_id: self.service.actor_id(),
                peer_actor_id: transport.peer_actor_id(),
            },
        };
        let Some(reply) = transport.send_for_result_with_retry(
            &message.to_bytes(),
            &DOWNSTREAM_SYNC_FUNCTION,
            retries,
            call_timeout,
        ) else {
            return false;
        };

        let reply = match ProtocolMessage::decode(&reply) {
            Ok(ProtocolMessage::CheckRsp(rsp)) => rsp,
            Ok(other) => panic!("check reply carried wrong message kind: {other:?}"),
            Err(err) => panic!("undecodable check reply: {err}"),
        };
        debug!(queue = %reply.header.queue_id, error = ?reply.error, "check queue reply");
        assert_eq!(
            reply.header.peer_actor_id,
            self.service.actor_id(),
            "check reply echoed a foreign actor id"
        );
        reply.error == QueueError::Ok
    }

    /// Polls every queue until ready or `timeout` expires; returns the ids
    /// that never became ready.
    pub fn wait_queues(
        &self,
        queue_ids: &[ChannelId],
        timeout: Duration,
        retries: u32,
        call_timeout: Duration,
    ) -> Vec<ChannelId> {
        let mut failed: Vec<ChannelId> = queue_ids.to_vec();
        let deadline = Instant::now() + timeout;
        while !failed.is_empty() && Instant::now() < deadline {
            failed.retain(|queue_id| {
                if self.check_queue_sync(queue_id, retries, call_timeout) {
                    info!(queue = %queue_id, "queue ready");
                    false
                } else {
                    info!(queue = %queue_id, "queue not ready");
                    std::thread::sleep(WAIT_QUEUES_SWEEP_BACKOFF);
                    true
                }
            });
        }
        failed
    }

    /// Drops all upstream queues and peer routes.
    pub fn release_all_up_queues(&self) {
        info!(actor = %self.service.actor_id(), "release all upstream queues");
        self.queues.lock().unwrap().clear();
        self.service.release();
    }
}

/// Downstream-side (reader) queue service.
pub struct DownstreamService {
    service: Arc<QueueService>,
    queues: Arc<Mutex<HashMap<ChannelId, Arc<ReaderQueue>>>>,
}

impl DownstreamService {
    /// Returns the process-wide service for `actor_id`, creating it lazily.
    pub fn get_service(caller: &Arc<dyn ActorCall>, actor_id: ActorId) -> Arc<Self> {
        let registry = DOWNSTREAM_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        Arc::clone(
            registry
                .lock()
                .unwrap()
                .entry(actor_id)
                .or_insert_with(|| Arc::new(Self::new(Arc::clone(caller), actor_id))),
        )
    }

    fn new(caller: Arc<dyn ActorCall>, actor_id: ActorId) -> Self {
        let queues: Arc<Mutex<HashMap<ChannelId, Arc<ReaderQueue>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let handler_queues = Arc::clone(&queues);
        let service = Arc::new(QueueService::new(
            actor_id,
            caller,
            move |message, reply| match message {
                ProtocolMessage::Data(data) => {
                    let queue = handler_queues
                        .lock()
                        .unwrap()
                        .get(&data.header.queue_id)
                        .cloned();
                    match queue {
                        Some(queue) => queue.on_data(data.seq_id, data.payload),
                        None => warn!(
                            queue = %data.header.queue_id,
                            seq_id = data.seq_id,
                            "data for unknown queue, maybe destroyed, ignored"
                        ),
                    }
                }
                ProtocolMessage::Check(check) => {
                    let exists = handler_queues
                        .lock()
                        .unwrap()
                        .contains_key(&check.header.queue_id);
                    let error = if exists {
                        QueueError::Ok
                    } else {
                        warn!(queue = %check.header.queue_id, "check for unknown queue");
                        QueueError::QueueNotExist
                    };
                    // The reply header swaps the pair so the probing side can
                    // assert its own id is echoed back.
                    let rsp = CheckRspMessage {
                        header: PeerHeader {
                            queue_id: check.header.queue_id,
                            actor_id: check.header.peer_actor_id,
                            peer_actor_id: check.header.actor_id,
                        },
                        error,
                    };
                    if let Some(reply) = reply {
                        let _ = reply.send(rsp.to_bytes());
                    }
                }
                other => panic!("unexpected downstream message: {other:?}"),
            },
        ));
        Self { service, queues }
    }

    /// The dispatch surface registered with the host RPC layer.
    pub fn queue_service(&self) -> &Arc<QueueService> {
        &self.service
    }

    /// Creates (or returns the existing) downstream queue from one peer.
    pub fn create_downstream_queue(
        &self,
        queue_id: ChannelId,
        peer_actor_id: ActorId,
    ) -> Result<Arc<ReaderQueue>> {
        if let Some(existing) = self.get_down_queue(&queue_id) {
            warn!(queue = %queue_id, "duplicate downstream queue creation");
            return Ok(existing);
        }
        info!(
            queue = %queue_id,
            peer = %peer_actor_id,
            actor = %self.service.actor_id(),
            "create downstream queue"
        );
        self.service.add_peer_actor(queue_id, peer_actor_id);
        let transport = self
            .service
            .out_transport(&queue_id)
            .ok_or_else(|| TransferError::InitQueueFailed(format!("no transport for {queue_id}")))?;
        let queue = Arc::new(ReaderQueue::new(
            queue_id,
            self.service.actor_id(),
            peer_actor_id,
            transport,
        ));
        self.queues.lock().unwrap().insert(queue_id, Arc::clone(&queue));
        Ok(queue)
    }

    pub fn get_down_queue(&self, queue_id: &ChannelId) -> Option<Arc<ReaderQueue>> {
        self.queues.lock().unwrap().get(queue_id).cloned()
    }

    pub fn downstream_queue_exists(&self, queue_id: &ChannelId) -> bool {
        self.get_down_queue(queue_id).is_some()
    }

    /// Drops all downstream queues and peer routes.
    pub fn release_all_down_queues(&self) {
        info!(actor = %self.service.actor_id(), "release all downstream queues");
        self.queues.lock().unwrap().clear();
        self.service.release();
    }
}
