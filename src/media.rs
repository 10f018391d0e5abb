//! Contracts for the external media collaborators: the audio codec that
//! turns compressed frames into PCM, and the playback sink that consumes it.
//!
//! The pipeline treats both as opaque capabilities. Implementations wrap
//! whatever codec/audio backend the embedding application uses.

use anyhow::Result;

/// Negotiated output format reported by the decoder at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count; the pipeline supports mono and stereo layouts.
    pub channels: u16,
    /// Upper bound on interleaved samples produced per codec frame,
    /// used to size the decode scratch buffer.
    pub max_frame_samples: usize,
}

/// Audio decoder turning one compressed codec frame into PCM samples.
pub trait AudioDecoder: Send {
    /// One-time setup; reports the stream format. Called exactly once,
    /// before the sink is opened. Failure here is fatal to startup.
    fn initialize(&mut self) -> Result<AudioFormat>;

    /// Decode a single frame into `out` (interleaved i16 PCM), returning
    /// the number of samples written. `out` is at least
    /// [`AudioFormat::max_frame_samples`] long. A failure drops only the
    /// offending frame.
    fn decode(&mut self, frame: &[u8], out: &mut [i16]) -> Result<usize>;
}

/// Playback sink accepting decoded PCM.
pub trait AudioSink: Send {
    /// Open the sink for the negotiated format. `buffer_hint` is a
    /// suggested internal buffer size in samples.
    fn open(&mut self, format: &AudioFormat, buffer_hint: usize) -> Result<()>;

    /// Write interleaved samples for playback. May block; backpressure
    /// here stalls only the decode stage.
    fn write(&mut self, samples: &[i16]) -> Result<()>;

    /// Release playback resources. Called once during teardown.
    fn release(&mut self);
}
