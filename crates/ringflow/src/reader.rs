//! Data reader: multi-channel fetch and k-way merge.
//!
//! The reader pulls bundles from every input channel, parks one bundle per
//! channel in a priority queue ([`BundleMerger`]), and serves the heap top
//! to the caller. When a bundle is popped, its source channel becomes
//! *unready* and a fresh bundle must be fetched from that same channel
//! before the next pop. This lazy placeholder refill keeps per-channel
//! FIFO intact while the merge approximates wall-clock order across
//! channels. `get_bundle` runs on the caller's thread; there is no dedicated
//! reader thread.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::bundle::BundleMeta;
use crate::error::{Result, TransferError};
use crate::merger::{BundleMerger, DataBundle};
use crate::message::ChannelId;
use crate::transfer::{ConsumerChannelInfo, ConsumerTransfer};

/// The consumer-side transport endpoint.
pub struct DataReader {
    input_queue_ids: Vec<ChannelId>,
    /// Channels whose merger slot is vacant and must be refilled before the
    /// next pop. Initially all of them.
    unready_queue_ids: Vec<ChannelId>,
    channel_info_map: HashMap<ChannelId, ConsumerChannelInfo>,
    transfer: Box<dyn ConsumerTransfer>,
    merger: BundleMerger,
    read_item_timeout: Duration,
    timer_interval: Duration,
}

impl DataReader {
    pub fn new(transfer: Box<dyn ConsumerTransfer>, read_item_timeout: Duration) -> Self {
        Self {
            input_queue_ids: Vec::new(),
            unready_queue_ids: Vec::new(),
            channel_info_map: HashMap::new(),
            transfer,
            merger: BundleMerger::new(),
            read_item_timeout,
            timer_interval: Duration::ZERO,
        }
    }

    /// Registers the input channels.
    ///
    /// `channel_seq_ids[i]` / `msg_ids[i]` are the bundle and message
    /// watermarks to resume channel `i` from; `None` starts fresh.
    /// `timer_interval` is the upstream heartbeat interval, a pacing hint
    /// for callers polling [`get_bundle`](Self::get_bundle).
    pub fn init(
        &mut self,
        input_ids: &[ChannelId],
        channel_seq_ids: Option<&[u64]>,
        msg_ids: Option<&[u64]>,
        timer_interval: Duration,
    ) -> Result<()> {
        assert!(!input_ids.is_empty(), "reader needs at least one input channel");
        self.timer_interval = timer_interval;

        for (i, channel_id) in input_ids.iter().enumerate() {
            let seq_id = channel_seq_ids.map_or(0, |ids| ids[i]);
            let msg_id = msg_ids.map_or(0, |ids| ids[i]);
            info!(channel = %channel_id, seq_id, msg_id, "init input channel");
            let channel_info = ConsumerChannelInfo::new(*channel_id, seq_id, msg_id);
            self.transfer.create_channel(&channel_info)?;
            self.channel_info_map.insert(*channel_id, channel_info);
            self.input_queue_ids.push(*channel_id);
            self.unready_queue_ids.push(*channel_id);
        }
        Ok(())
    }

    /// Returns the next bundle under the merge policy, or `GetBundleTimeOut`
    /// when `timeout` elapses before every vacant channel slot is refilled.
    pub fn get_bundle(&mut self, timeout: Duration) -> Result<DataBundle> {
        let deadline = Instant::now() + timeout;

        // Refill the merger: one fresh bundle from every channel whose slot
        // was vacated, the just-popped channel included.
        while let Some(&channel_id) = self.unready_queue_ids.last() {
            let bundle = self.get_message_from_channel(channel_id, deadline)?;
            self.merger.push(bundle);
            self.unready_queue_ids.pop();
        }

        let bundle = self.merger.pop().ok_or(TransferError::GetBundleTimeOut)?;
        let info = self
            .channel_info_map
            .get_mut(&bundle.from)
            .expect("bundle from a registered channel");
        info.current_seq_id = bundle.seq_id;
        info.last_message_id = bundle.meta.last_message_id;
        self.unready_queue_ids.push(bundle.from);
        Ok(bundle)
    }

    /// Fetches one bundle from one channel, retrying transient `NoSuchItem`
    /// at `read_item_timeout` granularity until `deadline`.
    fn get_message_from_channel(
        &mut self,
        channel_id: ChannelId,
        deadline: Instant,
    ) -> Result<DataBundle> {
        let info = self
            .channel_info_map
            .get(&channel_id)
            .ok_or(TransferError::ChannelClosed)?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(channel = %channel_id, "bundle fetch exhausted its budget");
                return Err(TransferError::GetBundleTimeOut);
            }
            let attempt = self.read_item_timeout.min(remaining);
            match self.transfer.consume_item(info, Some(attempt)) {
                Ok((seq_id, data)) => {
                    let meta = BundleMeta::decode(&data)?;
                    return Ok(DataBundle {
                        data,
                        from: channel_id,
                        seq_id,
                        meta,
                    });
                }
                Err(TransferError::NoSuchItem) => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Per-channel reader state for an external checkpointer.
    pub fn offset_info(&self) -> &HashMap<ChannelId, ConsumerChannelInfo> {
        &self.channel_info_map
    }

    /// Tells the upstream writer that items on `channel_id` up to `offset`
    /// will never be re-requested, releasing backend storage.
    pub fn notify_consumed_item(&mut self, channel_id: &ChannelId, offset: u64) -> Result<()> {
        let info = self
            .channel_info_map
            .get_mut(channel_id)
            .ok_or(TransferError::ChannelClosed)?;
        self.transfer.notify_consumed(info, offset)
    }

    /// The upstream heartbeat interval supplied at init.
    pub fn timer_interval(&self) -> Duration {
        self.timer_interval
    }

    /// Destroys the input channels. Further `get_bundle` calls fail.
    pub fn stop(&mut self) {
        info!("reader stop");
        for channel_id in std::mem::take(&mut self.input_queue_ids) {
            if let Some(channel_info) = self.channel_info_map.remove(&channel_id) {
                let _ = self.transfer.destroy_channel(&channel_info);
            }
        }
        self.unready_queue_ids.clear();
    }
}
