//! Receive-side audio pipeline for a real-time game/media streaming client.
//!
//! Pulls RTP-encapsulated compressed audio off the network, restores
//! playback order despite jitter and reordering, reassembles codec frames,
//! decodes them to PCM and hands the samples to a playback sink — under
//! low-latency, bounded-memory constraints and with a deterministic,
//! race-free shutdown.
//!
//! The codec and the playback backend are external collaborators supplied
//! by the embedding application through the [`media::AudioDecoder`] and
//! [`media::AudioSink`] traits; the transport defaults to UDP but can be
//! swapped through [`net::Transport`].
//!
//! # Example
//!
//! ```no_run
//! use echoplay::{StreamConfig, StreamCoordinator};
//! # use echoplay::media::{AudioDecoder, AudioFormat, AudioSink};
//! # struct MyDecoder;
//! # impl AudioDecoder for MyDecoder {
//! #     fn initialize(&mut self) -> anyhow::Result<AudioFormat> { unimplemented!() }
//! #     fn decode(&mut self, _: &[u8], _: &mut [i16]) -> anyhow::Result<usize> { unimplemented!() }
//! # }
//! # struct MySink;
//! # impl AudioSink for MySink {
//! #     fn open(&mut self, _: &AudioFormat, _: usize) -> anyhow::Result<()> { unimplemented!() }
//! #     fn write(&mut self, _: &[i16]) -> anyhow::Result<()> { unimplemented!() }
//! #     fn release(&mut self) {}
//! # }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let coordinator = StreamCoordinator::new(StreamConfig::default());
//! coordinator
//!     .start("192.168.1.10:48000".parse()?, Box::new(MyDecoder), Box::new(MySink))
//!     .await?;
//!
//! // ... session runs until the remote ends it or a stop is requested ...
//!
//! coordinator.abort().await;
//! # Ok(())
//! # }
//! ```

pub mod assets;
pub mod config;
pub mod media;
pub mod net;
pub mod pipeline;

pub use config::StreamConfig;
pub use pipeline::coordinator::StreamCoordinator;
pub use pipeline::state::PipelineState;
