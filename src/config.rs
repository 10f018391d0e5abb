use crate::assets::MAX_PACKET_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for the receive pipeline.
///
/// The defaults are sized for low-latency game-stream audio (small frames at
/// a high packet rate). Applications embedding the pipeline can deserialize
/// this from their own configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Capacity of each pooled receive buffer (transport MTU).
    pub max_packet_size: usize,

    /// How long the reorder queue holds a head-of-line gap before giving
    /// up on the missing packet and emitting the earliest one available.
    pub max_reorder_delay: Duration,

    /// Upper bound on the poll interval of the depacketizer's queue pop;
    /// also bounds how long shutdown can lag behind a cancellation.
    pub poll_timeout: Duration,

    /// Cadence of the liveness datagram sent back to the remote peer.
    pub keepalive_interval: Duration,

    /// Maximum packets buffered in the reorder queue before the oldest
    /// gap is abandoned.
    pub max_queued_packets: usize,

    /// Capacity of the assembled-frame channel between the depacketize
    /// and decode stages.
    pub frame_channel_capacity: usize,

    /// Largest codec frame the depacketizer will accumulate across packets.
    pub max_frame_size: usize,

    /// How many recycled receive buffers the pool keeps around.
    pub max_free_buffers: usize,

    /// Consecutive empty polls after which a half-assembled frame is
    /// considered orphaned by a stream stall and discarded.
    pub stall_trim_ticks: u32,

    /// Sample-count hint passed to the sink when it is opened.
    pub sink_buffer_hint: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            max_reorder_delay: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(50),
            keepalive_interval: Duration::from_millis(100),
            max_queued_packets: 256,
            frame_channel_capacity: 64,
            max_frame_size: 4096,
            max_free_buffers: 32,
            stall_trim_ticks: 4,
            sink_buffer_hint: 1024,
        }
    }
}
