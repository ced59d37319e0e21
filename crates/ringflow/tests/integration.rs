//! End-to-end exchanges between a writer and a reader, over the in-process
//! memory backend and over the actor-to-actor streaming queue backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ringflow::service::{DownstreamService, UpstreamService};
use ringflow::transfer::{self, MemoryConsumer, MemoryProducer, TransferContext};
use ringflow::transport::{ActorCall, CallFunction, NOT_READY_REPLY_LEN};
use ringflow::{
    ActorId, BundleType, ChannelId, DataBundle, DataReader, DataWriter, MessageBundle, MessageType,
    QueueType, Result, TransferConfig, TransferError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::INFO)
        .with_test_writer()
        .try_init();
}

fn memory_pair(
    channels: &[ChannelId],
    config: &TransferConfig,
    queue_size: u64,
) -> (DataWriter, DataReader) {
    let mut writer = DataWriter::new(Box::new(MemoryProducer), config.clone());
    writer
        .init(
            channels,
            &vec![0; channels.len()],
            &vec![queue_size; channels.len()],
        )
        .unwrap();

    let mut reader = DataReader::new(Box::new(MemoryConsumer), config.read_item_timeout);
    reader
        .init(channels, None, None, config.empty_message_interval)
        .unwrap();
    (writer, reader)
}

/// Pulls bundles until a non-heartbeat one arrives.
fn next_data_bundle(reader: &mut DataReader, timeout: Duration) -> DataBundle {
    let deadline = Instant::now() + timeout;
    loop {
        assert!(Instant::now() < deadline, "no data bundle before timeout");
        let bundle = reader.get_bundle(Duration::from_millis(500)).unwrap();
        if !bundle.meta.is_empty_bundle() {
            return bundle;
        }
    }
}

#[test]
fn test_single_channel_exactly_in_order() {
    init_tracing();
    let channel = ChannelId::random();
    let config = TransferConfig::default();
    let (mut writer, mut reader) = memory_pair(&[channel], &config, 10_000_000);
    writer.run();

    let data = [0x01, 0x02, 0x03, 0xff];
    writer
        .write_message_to_buffer_ring(&channel, &data, MessageType::Message)
        .unwrap();

    let bundle = next_data_bundle(&mut reader, Duration::from_secs(5));
    assert_eq!(bundle.from, channel);
    let decoded = MessageBundle::decode(&bundle.data).unwrap();
    assert_eq!(decoded.meta.message_count, 1);
    assert_eq!(decoded.messages[0].payload, data);
    assert_eq!(decoded.messages[0].seq_id, 1);
}

#[test]
fn test_multi_channel_fanout() {
    init_tracing();
    let channels: Vec<ChannelId> = (0..4).map(|_| ChannelId::random()).collect();
    let config = TransferConfig::default();
    let (mut writer, mut reader) = memory_pair(&channels, &config, 10_000_000);
    writer.run();

    for (i, channel) in channels.iter().enumerate() {
        writer
            .write_message_to_buffer_ring(channel, &[1, 2, 3, i as u8], MessageType::Message)
            .unwrap();
    }

    let mut seen: HashMap<ChannelId, Vec<u8>> = HashMap::new();
    while seen.len() < channels.len() {
        let bundle = next_data_bundle(&mut reader, Duration::from_secs(5));
        let decoded = MessageBundle::decode(&bundle.data).unwrap();
        assert_eq!(decoded.meta.message_count, 1);
        seen.insert(bundle.from, decoded.messages[0].payload.clone());
    }

    let froms: HashSet<ChannelId> = seen.keys().copied().collect();
    assert_eq!(froms, channels.iter().copied().collect::<HashSet<_>>());
    for (i, channel) in channels.iter().enumerate() {
        assert_eq!(seen[channel], vec![1, 2, 3, i as u8]);
    }
}

#[test]
fn test_full_ring_blocks_writer_until_stopped() {
    init_tracing();
    let channel = ChannelId::random();
    let config = TransferConfig::default().with_ring_buffer_capacity(4);
    let mut writer = DataWriter::new(Box::new(MemoryProducer), config);
    writer.init(&[channel], &[0], &[10_000_000]).unwrap();
    // The loop is deliberately not started: nothing drains the ring.
    let writer = Arc::new(writer);

    let progress = Arc::new(AtomicUsize::new(0));
    let results: Arc<Mutex<Vec<Result<u64>>>> = Arc::new(Mutex::new(Vec::new()));
    let handle = {
        let writer = Arc::clone(&writer);
        let progress = Arc::clone(&progress);
        let results = Arc::clone(&results);
        std::thread::spawn(move || {
            for i in 0u8..5 {
                let result =
                    writer.write_message_to_buffer_ring(&channel, &[i], MessageType::Message);
                if result.is_ok() {
                    progress.fetch_add(1, Ordering::SeqCst);
                }
                results.lock().unwrap().push(result);
            }
        })
    };

    std::thread::sleep(Duration::from_millis(200));
    // Four writes fit the ring; the fifth is parked.
    assert_eq!(progress.load(Ordering::SeqCst), 4);

    writer.stop();
    handle.join().unwrap();
    let results = results.lock().unwrap();
    assert_eq!(results.len(), 5);
    assert_eq!(results[4], Err(TransferError::Interrupted));
}

#[test]
fn test_heartbeats_emitted_when_idle() {
    init_tracing();
    let channels: Vec<ChannelId> = (0..2).map(|_| ChannelId::random()).collect();
    let config = TransferConfig::default();
    let (mut writer, mut reader) = memory_pair(&channels, &config, 10_000_000);
    writer.run();

    let started = Instant::now();
    let mut empty_seen: HashSet<ChannelId> = HashSet::new();
    while empty_seen.len() < channels.len() {
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "heartbeats missing after 2s"
        );
        let bundle = reader.get_bundle(Duration::from_secs(1)).unwrap();
        if bundle.meta.is_empty_bundle() {
            assert_eq!(bundle.meta.message_count, 0);
            empty_seen.insert(bundle.from);
        }
    }
}

#[test]
fn test_bounded_bundling_under_byte_budget() {
    init_tracing();
    let channel = ChannelId::random();
    // 40-byte payloads; a 100-byte bundle budget holds at most two framed
    // messages, and never three.
    let config = TransferConfig::default();
    let (mut writer, mut reader) = memory_pair(&[channel], &config, 100);
    writer.run();

    let total = 10u64;
    for _ in 0..total {
        writer
            .write_message_to_buffer_ring(&channel, &[0x5a; 40], MessageType::Message)
            .unwrap();
    }

    let mut received = Vec::new();
    while (received.len() as u64) < total {
        let bundle = next_data_bundle(&mut reader, Duration::from_secs(5));
        let decoded = MessageBundle::decode(&bundle.data).unwrap();
        assert!(
            (1..=2).contains(&decoded.meta.message_count),
            "bundle with {} messages exceeds the byte budget",
            decoded.meta.message_count
        );
        received.extend(decoded.messages);
        // Let the writer reuse the channel budget.
        reader.notify_consumed_item(&channel, bundle.seq_id).unwrap();
    }

    for (i, message) in received.iter().enumerate() {
        assert_eq!(message.seq_id, i as u64 + 1, "gap or reorder in delivery");
    }
}

#[test]
fn test_fifo_contiguous_across_many_bundles() {
    init_tracing();
    let channel = ChannelId::random();
    let config = TransferConfig::default().with_ring_buffer_capacity(4);
    let (mut writer, mut reader) = memory_pair(&[channel], &config, 10_000_000);
    writer.run();

    let total = 50u64;
    for i in 0..total {
        writer
            .write_message_to_buffer_ring(&channel, &i.to_be_bytes(), MessageType::Message)
            .unwrap();
    }

    let mut next_expected = 1u64;
    while next_expected <= total {
        let bundle = next_data_bundle(&mut reader, Duration::from_secs(5));
        let decoded = MessageBundle::decode(&bundle.data).unwrap();
        for message in decoded.messages {
            assert_eq!(message.seq_id, next_expected);
            assert_eq!(message.payload, (next_expected - 1).to_be_bytes());
            next_expected += 1;
        }
    }
}

#[test]
fn test_barrier_rides_alone() {
    init_tracing();
    let channel = ChannelId::random();
    let config = TransferConfig::default();
    let mut writer = DataWriter::new(Box::new(MemoryProducer), config.clone());
    writer.init(&[channel], &[0], &[10_000_000]).unwrap();
    let mut reader = DataReader::new(Box::new(MemoryConsumer), config.read_item_timeout);
    reader
        .init(&[channel], None, None, config.empty_message_interval)
        .unwrap();

    // Queue everything before the loop starts so one sweep sees the full
    // ring: two data messages, a barrier, one more data message.
    writer
        .write_message_to_buffer_ring(&channel, &[1], MessageType::Message)
        .unwrap();
    writer
        .write_message_to_buffer_ring(&channel, &[2], MessageType::Message)
        .unwrap();
    writer
        .write_message_to_buffer_ring(&channel, &[0xbb], MessageType::Barrier)
        .unwrap();
    writer
        .write_message_to_buffer_ring(&channel, &[3], MessageType::Message)
        .unwrap();
    writer.run();

    let mut kinds = Vec::new();
    let mut delivered = 0;
    while delivered < 4 {
        let bundle = next_data_bundle(&mut reader, Duration::from_secs(5));
        let decoded = MessageBundle::decode(&bundle.data).unwrap();
        if decoded.meta.bundle_type == BundleType::Barrier {
            assert_eq!(decoded.meta.message_count, 1);
            assert_eq!(decoded.messages[0].message_type, MessageType::Barrier);
        }
        delivered += decoded.meta.message_count as usize;
        kinds.push(decoded.meta.bundle_type);
    }
    assert_eq!(
        kinds,
        vec![BundleType::Bundle, BundleType::Barrier, BundleType::Bundle]
    );
}

// ---------------------------------------------------------------------
// Streaming queue backend, wired through an in-process actor router
// ---------------------------------------------------------------------

/// Routes actor calls between the upstream and downstream services of one
/// writer/reader pair. A call to a not-yet-registered peer returns the
/// reserved 4-byte not-ready reply, exactly as a half-initialized worker
/// would.
#[derive(Default)]
struct LocalRouter {
    upstream: Mutex<Option<Arc<UpstreamService>>>,
    downstream: Mutex<Option<Arc<DownstreamService>>>,
    /// Sync calls answered with the not-ready sentinel before real dispatch.
    not_ready_remaining: AtomicU32,
}

impl LocalRouter {
    fn register_upstream(&self, service: Arc<UpstreamService>) {
        *self.upstream.lock().unwrap() = Some(service);
    }

    fn register_downstream(&self, service: Arc<DownstreamService>) {
        *self.downstream.lock().unwrap() = Some(service);
    }
}

impl ActorCall for LocalRouter {
    fn submit(&self, _peer: ActorId, function: &CallFunction, payload: Vec<u8>) -> Result<()> {
        match function.name() {
            "downstream_async" => {
                if let Some(service) = self.downstream.lock().unwrap().as_ref() {
                    service.queue_service().dispatch_message(payload);
                }
                Ok(())
            }
            "upstream_async" => {
                if let Some(service) = self.upstream.lock().unwrap().as_ref() {
                    service.queue_service().dispatch_message(payload);
                }
                Ok(())
            }
            other => Err(TransferError::IoError(format!("unknown function {other}"))),
        }
    }

    fn submit_for_result(
        &self,
        _peer: ActorId,
        function: &CallFunction,
        payload: &[u8],
        _timeout: Duration,
    ) -> Result<Vec<u8>> {
        if self
            .not_ready_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(vec![0; NOT_READY_REPLY_LEN]);
        }
        let service = match function.name() {
            "downstream_sync" => self.downstream.lock().unwrap().clone(),
            _ => None,
        };
        match service {
            Some(service) => service.queue_service().dispatch_message_sync(payload.to_vec()),
            None => Ok(vec![0; NOT_READY_REPLY_LEN]),
        }
    }
}

struct StreamingQueuePair {
    writer: DataWriter,
    reader: DataReader,
    writer_actor: ActorId,
    caller: Arc<dyn ActorCall>,
}

fn streaming_queue_pair(channel: ChannelId, not_ready_calls: u32) -> StreamingQueuePair {
    let writer_actor = ActorId::random();
    let reader_actor = ActorId::random();
    let router = Arc::new(LocalRouter {
        not_ready_remaining: AtomicU32::new(not_ready_calls),
        ..Default::default()
    });
    let caller: Arc<dyn ActorCall> = router.clone();

    router.register_upstream(UpstreamService::get_service(&caller, writer_actor));
    router.register_downstream(DownstreamService::get_service(&caller, reader_actor));

    let config = TransferConfig::default().with_queue_type(QueueType::StreamingQueue);

    // The downstream queue must exist before the writer's handshake probes.
    let reader_context = TransferContext {
        caller: Some(Arc::clone(&caller)),
        actor_id: reader_actor,
        peer_actors: HashMap::from([(channel, writer_actor)]),
        object_store: None,
    };
    let mut reader = DataReader::new(
        transfer::new_consumer_transfer(&config, &reader_context).unwrap(),
        config.read_item_timeout,
    );
    reader
        .init(&[channel], None, None, config.empty_message_interval)
        .unwrap();

    let writer_context = TransferContext {
        caller: Some(Arc::clone(&caller)),
        actor_id: writer_actor,
        peer_actors: HashMap::from([(channel, reader_actor)]),
        object_store: None,
    };
    let mut writer = DataWriter::new(
        transfer::new_producer_transfer(&config, &writer_context).unwrap(),
        config.clone(),
    );
    writer.init(&[channel], &[0], &[10_000_000]).unwrap();

    StreamingQueuePair {
        writer,
        reader,
        writer_actor,
        caller,
    }
}

#[test]
fn test_streaming_queue_exchange_and_reclamation() {
    init_tracing();
    let channel = ChannelId::random();
    let mut pair = streaming_queue_pair(channel, 0);
    pair.writer.run();

    pair.writer
        .write_message_to_buffer_ring(&channel, &[7, 7, 7], MessageType::Message)
        .unwrap();

    let bundle = next_data_bundle(&mut pair.reader, Duration::from_secs(5));
    assert_eq!(bundle.from, channel);
    let decoded = MessageBundle::decode(&bundle.data).unwrap();
    assert_eq!(decoded.messages[0].payload, vec![7, 7, 7]);

    // Reclamation: the notification travels upstream and advances the
    // writer queue's watermark.
    pair.reader
        .notify_consumed_item(&channel, bundle.seq_id)
        .unwrap();
    let upstream = UpstreamService::get_service(&pair.caller, pair.writer_actor);
    let queue = upstream.get_up_queue(&channel).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while queue.reclaim_watermark() < bundle.seq_id {
        assert!(Instant::now() < deadline, "reclamation never reached the writer");
        std::thread::sleep(Duration::from_millis(10));
    }

    pair.writer.stop();
    pair.reader.stop();
}

#[test]
fn test_handshake_retries_through_not_ready_peer() {
    init_tracing();
    let channel = ChannelId::random();
    // The first three sync calls see the 4-byte sentinel; the writer's
    // handshake must absorb them and still come up within its budget.
    let started = Instant::now();
    let pair = streaming_queue_pair(channel, 3);
    assert!(started.elapsed() < Duration::from_secs(1));
    drop(pair);
}
