//! Keepalive stage for the pipeline
//!
//! Periodically sends a small liveness datagram back to the remote peer so
//! the session and any NAT binding on the path stay open. Independent of
//! the data path; shares only the transport and the lifecycle signal.

use crate::assets::{KEEPALIVE_PAYLOAD, KEEPALIVE_SSRC};
use crate::net::Transport;
use crate::net::rtp::{KEEPALIVE_PAYLOAD_TYPE, RtpHeader};
use crate::pipeline::PipelineStage;
use crate::pipeline::health::PipelineHealth;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Keepalive stage: fixed-cadence liveness pings over the transport.
pub struct KeepaliveStage {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    health: Arc<PipelineHealth>,
    interval: Duration,
    sequence: u16,
}

impl KeepaliveStage {
    /// Create a new keepalive stage
    pub fn new(
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
        health: Arc<PipelineHealth>,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            cancel,
            health,
            interval,
            sequence: 0,
        }
    }

    fn next_ping(&mut self) -> Vec<u8> {
        let header = RtpHeader {
            payload_type: KEEPALIVE_PAYLOAD_TYPE,
            marker: false,
            sequence: self.sequence,
            timestamp: 0,
            ssrc: KEEPALIVE_SSRC,
        };
        self.sequence = self.sequence.wrapping_add(1);
        header.serialize(&KEEPALIVE_PAYLOAD)
    }
}

#[async_trait]
impl PipelineStage for KeepaliveStage {
    async fn run(&mut self) -> Result<()> {
        info!("KeepaliveStage: started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent = 0u64;

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => {}
            }

            let ping = self.next_ping();
            if let Err(e) = self.transport.send(&ping).await {
                // send failing because abort closed the socket is a
                // normal exit, not a failure
                if self.cancel.is_cancelled() {
                    break Ok(());
                }
                self.health.record_network_error();
                break Err(e).context("keepalive send failed");
            }
            sent += 1;
        };

        info!("KeepaliveStage: finished ({} pings sent)", sent);
        result
    }

    fn name(&self) -> &'static str {
        "KeepaliveStage"
    }
}
