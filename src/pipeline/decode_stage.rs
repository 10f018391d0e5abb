//! Decode stage for the pipeline
//!
//! Drives the external decoder over the assembled-frame stream and hands
//! PCM to the playback sink. The sink write is blocking, so backpressure
//! from playback stalls only this stage; the receive path keeps draining
//! the network.

use crate::media::{AudioDecoder, AudioFormat, AudioSink};
use crate::pipeline::PipelineStage;
use crate::pipeline::depacketizer::CodecFrame;
use crate::pipeline::health::PipelineHealth;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Decode stage: assembled frames in, PCM out to the sink.
pub struct DecodeStage {
    decoder: Box<dyn AudioDecoder>,
    sink: Box<dyn AudioSink>,
    format: Option<AudioFormat>,
    frame_rx: Option<mpsc::Receiver<CodecFrame>>,
    cancel: CancellationToken,
    health: Arc<PipelineHealth>,
    sink_buffer_hint: usize,
}

impl DecodeStage {
    /// Create a new decode stage
    pub fn new(
        decoder: Box<dyn AudioDecoder>,
        sink: Box<dyn AudioSink>,
        cancel: CancellationToken,
        health: Arc<PipelineHealth>,
        sink_buffer_hint: usize,
    ) -> Self {
        Self {
            decoder,
            sink,
            format: None,
            frame_rx: None,
            cancel,
            health,
            sink_buffer_hint,
        }
    }

    /// Set the input channel (assembled codec frames)
    pub fn set_input(&mut self, rx: mpsc::Receiver<CodecFrame>) {
        self.frame_rx = Some(rx);
    }

    /// Initialize the decoder and open the sink.
    ///
    /// Must complete before the pipeline starts; the decoder is always
    /// initialized before the sink is opened. Any failure here is a setup
    /// failure reported to the caller of `start`, and the pipeline never
    /// reaches Running.
    pub fn setup(&mut self) -> Result<()> {
        let format = self
            .decoder
            .initialize()
            .context("decoder initialization failed")?;

        if format.channels != 1 && format.channels != 2 {
            bail!("unsupported channel count: {}", format.channels);
        }

        self.sink
            .open(&format, self.sink_buffer_hint)
            .context("failed to open audio sink")?;

        info!(
            "DecodeStage: decoder ready ({} Hz, {} channels)",
            format.sample_rate, format.channels
        );
        self.format = Some(format);
        Ok(())
    }
}

#[async_trait]
impl PipelineStage for DecodeStage {
    async fn run(&mut self) -> Result<()> {
        let mut frame_rx = self
            .frame_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No input channel"))?;
        let format = self
            .format
            .ok_or_else(|| anyhow::anyhow!("setup() not run"))?;

        // scratch PCM buffer reused across frames
        let mut samples = vec![0i16; format.max_frame_samples];
        let mut decoded_frames = 0u64;

        info!("DecodeStage: started");

        let result = loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                frame = frame_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => {
                        info!("DecodeStage: frame channel closed");
                        break Ok(());
                    }
                },
            };

            match self.decoder.decode(&frame.data, &mut samples) {
                Ok(count) => {
                    if let Err(e) = self.sink.write(&samples[..count]) {
                        break Err(e).context("audio sink write failed");
                    }
                    decoded_frames += 1;
                    self.health.record_frame_decoded();
                }
                Err(e) => {
                    // bad frame: skip it, keep the stream alive
                    self.health.record_decode_failure();
                    debug!(
                        "DecodeStage: dropping undecodable frame (seq {}): {:#}",
                        frame.last_sequence, e
                    );
                }
            }
        };

        self.sink.release();

        info!("DecodeStage: finished ({} frames decoded)", decoded_frames);
        result
    }

    fn name(&self) -> &'static str {
        "DecodeStage"
    }
}
