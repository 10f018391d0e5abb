//! Receive stage for the pipeline
//!
//! Pulls datagrams off the transport into pooled buffers, parses the RTP
//! framing and feeds audio packets to the reorder queue. Anything that is
//! not a well-formed audio packet is dropped here so the queue only ever
//! carries playable data.

use crate::net::Transport;
use crate::net::rtp::{AUDIO_PAYLOAD_TYPE, RtpHeader};
use crate::pipeline::PipelineStage;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::pool::BufferPool;
use crate::pipeline::reorder::{RawPacket, ReorderQueue, SequencedPacket};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Receive stage: transport datagrams in, sequenced packets out.
pub struct ReceiveStage {
    transport: Arc<dyn Transport>,
    pool: BufferPool,
    queue: ReorderQueue,
    cancel: CancellationToken,
    health: Arc<PipelineHealth>,
}

impl ReceiveStage {
    /// Create a new receive stage
    pub fn new(
        transport: Arc<dyn Transport>,
        pool: BufferPool,
        queue: ReorderQueue,
        cancel: CancellationToken,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            transport,
            pool,
            queue,
            cancel,
            health,
        }
    }
}

#[async_trait]
impl PipelineStage for ReceiveStage {
    async fn run(&mut self) -> Result<()> {
        info!("ReceiveStage: started");
        let mut total_packets = 0u64;
        let mut last_stats = Instant::now();

        let result = loop {
            let mut buffer = self.pool.checkout();

            let len = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                res = self.transport.recv(&mut buffer) => match res {
                    Ok(len) => len,
                    // a receive failing because abort closed the socket is
                    // a normal exit, not a failure
                    Err(_) if self.cancel.is_cancelled() => break Ok(()),
                    Err(e) => {
                        self.health.record_network_error();
                        break Err(e).context("transport receive failed");
                    }
                },
            };

            total_packets += 1;
            self.health.record_packet(len);
            if total_packets == 1 {
                info!("ReceiveStage: first packet received ({} bytes)", len);
            }

            let Some((header, payload_offset)) = RtpHeader::parse(&buffer[..len]) else {
                self.health.record_packet_dropped();
                continue;
            };
            if header.payload_type != AUDIO_PAYLOAD_TYPE {
                self.health.record_packet_dropped();
                continue;
            }

            self.queue.push(SequencedPacket {
                sequence: header.sequence,
                timestamp: header.timestamp,
                marker: header.marker,
                received_at: Instant::now(),
                packet: RawPacket::new(buffer, payload_offset, len),
            });

            // Log stats periodically
            if last_stats.elapsed().as_secs() >= 30 {
                info!("ReceiveStage: {} packets received", total_packets);
                last_stats = Instant::now();
            }
        };

        // nothing more is coming; let the depacketizer drain and exit
        self.queue.close();

        info!("ReceiveStage: finished ({} total packets)", total_packets);
        result
    }

    fn name(&self) -> &'static str {
        "ReceiveStage"
    }
}
