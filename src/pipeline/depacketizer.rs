//! Depacketization: rebuilding codec frames from the ordered packet stream
//!
//! Most frames fit a single packet and are closed by the RTP marker bit;
//! larger frames span several packets and are accumulated until the marker
//! arrives. A sequence discontinuity voids any half-built frame so that a
//! frame is never stitched across missing data.

use crate::pipeline::PipelineStage;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::reorder::{Pop, ReorderQueue, SequencedPacket};
use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::{debug, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One codec-ready frame, reassembled from one or more packets.
#[derive(Debug, Clone)]
pub struct CodecFrame {
    pub data: Bytes,
    /// RTP timestamp shared by every packet of the frame
    pub timestamp: u32,
    /// Sequence number of the packet that completed the frame
    pub last_sequence: u16,
}

/// Frame assembler fed by the reorder queue.
pub struct Depacketizer {
    partial: BytesMut,
    partial_timestamp: u32,
    last_sequence: Option<u16>,
    max_frame_size: usize,
    frames_assembled: u64,
    packets_dropped: u64,
    partials_trimmed: u64,
}

impl Depacketizer {
    /// Create an assembler refusing frames larger than `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            partial: BytesMut::new(),
            partial_timestamp: 0,
            last_sequence: None,
            max_frame_size,
            frames_assembled: 0,
            packets_dropped: 0,
            partials_trimmed: 0,
        }
    }

    /// Consume one packet; returns a frame when the packet completes one.
    ///
    /// Malformed packets (empty payload, oversized accumulation) are
    /// dropped without error; audio favors continuity over fidelity.
    pub fn push_packet(&mut self, packet: &SequencedPacket) -> Option<CodecFrame> {
        // a sequence gap voids whatever was being assembled
        if let Some(last) = self.last_sequence
            && packet.sequence != last.wrapping_add(1)
            && !self.partial.is_empty()
        {
            debug!(
                "Depacketizer: discontinuity at seq {}, discarding partial frame",
                packet.sequence
            );
            self.trim();
        }
        self.last_sequence = Some(packet.sequence);

        let payload = packet.packet.payload();
        if payload.is_empty() {
            self.packets_dropped += 1;
            return None;
        }

        // a timestamp change mid-frame means the closing marker was lost
        if !self.partial.is_empty() && packet.timestamp != self.partial_timestamp {
            self.trim();
        }

        if self.partial.len() + payload.len() > self.max_frame_size {
            self.packets_dropped += 1;
            self.trim();
            return None;
        }

        if self.partial.is_empty() {
            self.partial_timestamp = packet.timestamp;
        }
        self.partial.extend_from_slice(payload);

        if packet.marker {
            self.frames_assembled += 1;
            Some(CodecFrame {
                data: self.partial.split().freeze(),
                timestamp: self.partial_timestamp,
                last_sequence: packet.sequence,
            })
        } else {
            None
        }
    }

    /// Discard any partially-accumulated frame state.
    pub fn trim(&mut self) {
        if !self.partial.is_empty() {
            self.partial.clear();
            self.partials_trimmed += 1;
        }
    }

    /// Whether a frame is currently half-assembled.
    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }

    /// Get statistics: (assembled, dropped, trimmed)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.frames_assembled,
            self.packets_dropped,
            self.partials_trimmed,
        )
    }
}

/// Depacketize stage: drains the reorder queue and forwards assembled
/// frames to the decode stage.
pub struct DepacketizeStage {
    queue: ReorderQueue,
    depacketizer: Depacketizer,
    frame_tx: Option<mpsc::Sender<CodecFrame>>,
    frame_capacity: usize,
    cancel: CancellationToken,
    trim_requested: Arc<AtomicBool>,
    health: Arc<PipelineHealth>,
    poll_timeout: Duration,
    stall_trim_ticks: u32,
}

impl DepacketizeStage {
    /// Create a new depacketize stage
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: ReorderQueue,
        depacketizer: Depacketizer,
        frame_capacity: usize,
        cancel: CancellationToken,
        trim_requested: Arc<AtomicBool>,
        health: Arc<PipelineHealth>,
        poll_timeout: Duration,
        stall_trim_ticks: u32,
    ) -> Self {
        Self {
            queue,
            depacketizer,
            frame_tx: None,
            frame_capacity,
            cancel,
            trim_requested,
            health,
            poll_timeout,
            stall_trim_ticks,
        }
    }

    /// Get the output channel of assembled frames
    pub fn take_output(&mut self) -> mpsc::Receiver<CodecFrame> {
        let (tx, rx) = mpsc::channel::<CodecFrame>(self.frame_capacity);
        self.frame_tx = Some(tx);
        rx
    }
}

#[async_trait]
impl PipelineStage for DepacketizeStage {
    async fn run(&mut self) -> Result<()> {
        let frame_tx = self
            .frame_tx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No output channel"))?;

        info!("DepacketizeStage: started");
        let mut stall_ticks = 0u32;

        while !self.cancel.is_cancelled() {
            match self.queue.pop(self.poll_timeout).await {
                Pop::Packet(packet) => {
                    stall_ticks = 0;

                    if self.trim_requested.swap(false, Ordering::AcqRel) {
                        self.depacketizer.trim();
                    }

                    if let Some(frame) = self.depacketizer.push_packet(&packet) {
                        self.health.record_frame_assembled();
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            res = frame_tx.send(frame) => {
                                if res.is_err() {
                                    info!("DepacketizeStage: frame channel closed");
                                    break;
                                }
                            }
                        }
                    }
                    // packet dropped here; its backing buffer returns to the pool
                }
                Pop::Timeout => {
                    stall_ticks += 1;
                    if stall_ticks >= self.stall_trim_ticks && self.depacketizer.has_partial() {
                        debug!("DepacketizeStage: stream stalled mid-frame, trimming partial");
                        self.depacketizer.trim();
                        stall_ticks = 0;
                    }
                }
                Pop::Closed => {
                    info!("DepacketizeStage: input queue closed");
                    break;
                }
            }
        }

        let (assembled, dropped, trimmed) = self.depacketizer.stats();
        info!(
            "DepacketizeStage: finished ({} frames assembled, {} packets dropped, {} partials trimmed)",
            assembled, dropped, trimmed
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DepacketizeStage"
    }
}
