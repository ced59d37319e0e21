//! Demonstration of the streaming transport over the in-process backend.
//!
//! Run with: `cargo run -p ringflow --bin demo`

use std::collections::HashMap;
use std::time::Duration;

use ringflow::transfer::{MemoryConsumer, MemoryProducer};
use ringflow::{
    BundleType, ChannelId, DataReader, DataWriter, MessageBundle, MessageType, TransferConfig,
    TransferError,
};

const CHANNELS: usize = 3;
const MESSAGES_PER_CHANNEL: u64 = 100;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::INFO)
        .init();

    println!("=== ringflow demo: {CHANNELS} channels ===\n");

    let config = TransferConfig::default();
    let channels: Vec<ChannelId> = (0..CHANNELS).map(|_| ChannelId::random()).collect();

    let mut writer = DataWriter::new(Box::new(MemoryProducer), config.clone());
    writer.init(&channels, &vec![0; CHANNELS], &vec![10_000_000; CHANNELS])?;
    writer.run();

    let mut reader = DataReader::new(Box::new(MemoryConsumer), config.read_item_timeout);
    reader.init(&channels, None, None, config.empty_message_interval)?;

    // Producer thread: interleave data over all channels, then fence each
    // channel with a barrier.
    let producer = {
        let channels = channels.clone();
        std::thread::spawn(move || -> ringflow::Result<()> {
            for i in 1..=MESSAGES_PER_CHANNEL {
                for channel in &channels {
                    writer.write_message_to_buffer_ring(
                        channel,
                        &i.to_be_bytes(),
                        MessageType::Message,
                    )?;
                }
            }
            for channel in &channels {
                writer.write_message_to_buffer_ring(channel, &[], MessageType::Barrier)?;
            }
            // Keep the writer alive until the reader has drained everything.
            std::thread::sleep(Duration::from_secs(2));
            writer.stop();
            Ok(())
        })
    };

    // Reader loop in the shape every consumer takes: barriers trigger a
    // checkpoint-style notification sweep, heartbeats are skipped, data is
    // verified in order.
    let mut received: HashMap<ChannelId, u64> = channels.iter().map(|c| (*c, 0)).collect();
    let mut barriers = 0usize;
    let mut empties = 0usize;
    while barriers < CHANNELS {
        let bundle = match reader.get_bundle(Duration::from_millis(100)) {
            Ok(bundle) => bundle,
            Err(TransferError::GetBundleTimeOut) => continue,
            Err(err) => return Err(err.into()),
        };
        match bundle.meta.bundle_type {
            BundleType::Empty => {
                empties += 1;
            }
            BundleType::Barrier => {
                barriers += 1;
                let offsets: Vec<(ChannelId, u64)> = reader
                    .offset_info()
                    .iter()
                    .map(|(id, info)| (*id, info.current_seq_id))
                    .collect();
                for (channel, seq) in offsets {
                    reader.notify_consumed_item(&channel, seq)?;
                }
                println!("barrier from {} (offsets notified)", bundle.from);
            }
            BundleType::Bundle => {
                let decoded = MessageBundle::decode(&bundle.data)?;
                let count = received.get_mut(&bundle.from).expect("known channel");
                for message in &decoded.messages {
                    *count += 1;
                    assert_eq!(message.seq_id, *count, "per-channel FIFO violated");
                }
            }
        }
    }

    for channel in &channels {
        println!("channel {channel}: {} messages", received[channel]);
        assert_eq!(received[channel], MESSAGES_PER_CHANNEL);
    }
    println!("heartbeats skipped: {empties}");

    producer.join().expect("producer thread panicked")?;
    reader.stop();
    println!("\n=== demo complete ===");
    Ok(())
}
