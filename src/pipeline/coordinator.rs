//! Stream coordinator
//!
//! Owns the lifecycle of the receive pipeline: sets up the transport,
//! decoder and sink, spawns the Receive, Depacketize, Decode and Keepalive
//! workers, and runs the abort protocol. However many triggers race
//! (a stage failure, an external stop, both at once), exactly one teardown
//! sequence runs: cancel every worker, close the transport to release a
//! blocked receive, join each worker once, and land in the terminal
//! Stopped state.

use crate::assets::MEDIA_PORT;
use crate::config::StreamConfig;
use crate::media::{AudioDecoder, AudioSink};
use crate::net::{Transport, UdpTransport};
use crate::pipeline::PipelineStage;
use crate::pipeline::decode_stage::DecodeStage;
use crate::pipeline::depacketizer::{DepacketizeStage, Depacketizer};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::keepalive_stage::KeepaliveStage;
use crate::pipeline::pool::BufferPool;
use crate::pipeline::receive_stage::ReceiveStage;
use crate::pipeline::reorder::{ReorderConfig, ReorderQueue};
use crate::pipeline::state::PipelineState;
use anyhow::{Result, bail};
use log::{debug, error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Coordinates the receive pipeline: Receive → Reorder → Depacketize →
/// Decode, with the keepalive sender alongside.
///
/// One coordinator drives one session; after it reaches
/// [`PipelineState::Stopped`] it cannot be restarted.
pub struct StreamCoordinator {
    config: StreamConfig,
    health: Arc<PipelineHealth>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<PipelineState>>,
    trim_requested: Arc<AtomicBool>,
}

impl StreamCoordinator {
    /// Create a new coordinator
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            health: Arc::new(PipelineHealth::new()),
            cancel: CancellationToken::new(),
            state: Arc::new(watch::Sender::new(PipelineState::Idle)),
            trim_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get the pipeline health metrics
    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    /// Get the current pipeline state
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Subscribe to pipeline state changes
    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Start the pipeline against `remote`, binding the well-known media
    /// port.
    ///
    /// Establishes the transport, initializes the decoder, opens the sink
    /// and spawns the workers. Any failure before that point aborts
    /// startup and is returned to the caller; the pipeline never reaches
    /// Running.
    pub async fn start(
        &self,
        remote: SocketAddr,
        decoder: Box<dyn AudioDecoder>,
        sink: Box<dyn AudioSink>,
    ) -> Result<()> {
        if !set_state(&self.state, PipelineState::Starting) {
            bail!("pipeline already started");
        }

        let transport = match UdpTransport::bind(MEDIA_PORT, remote).await {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                self.fail_startup();
                return Err(e);
            }
        };

        self.launch(transport, decoder, sink)
    }

    /// Start the pipeline over an externally supplied transport.
    ///
    /// Same contract as [`start`], for embedders that manage their own
    /// session/socket.
    ///
    /// [`start`]: StreamCoordinator::start
    pub async fn start_with_transport(
        &self,
        transport: Arc<dyn Transport>,
        decoder: Box<dyn AudioDecoder>,
        sink: Box<dyn AudioSink>,
    ) -> Result<()> {
        if !set_state(&self.state, PipelineState::Starting) {
            bail!("pipeline already started");
        }
        self.launch(transport, decoder, sink)
    }

    fn launch(
        &self,
        transport: Arc<dyn Transport>,
        decoder: Box<dyn AudioDecoder>,
        sink: Box<dyn AudioSink>,
    ) -> Result<()> {
        let pool = BufferPool::new(self.config.max_packet_size, self.config.max_free_buffers);
        let queue = ReorderQueue::new(ReorderConfig {
            max_reorder_delay: self.config.max_reorder_delay,
            max_queued_packets: self.config.max_queued_packets,
        });

        let receive = ReceiveStage::new(
            transport.clone(),
            pool,
            queue.clone(),
            self.cancel.clone(),
            self.health.clone(),
        );
        let mut depacketize = DepacketizeStage::new(
            queue.clone(),
            Depacketizer::new(self.config.max_frame_size),
            self.config.frame_channel_capacity,
            self.cancel.clone(),
            self.trim_requested.clone(),
            self.health.clone(),
            self.config.poll_timeout,
            self.config.stall_trim_ticks,
        );
        let frame_rx = depacketize.take_output();
        let mut decode = DecodeStage::new(
            decoder,
            sink,
            self.cancel.clone(),
            self.health.clone(),
            self.config.sink_buffer_hint,
        );
        decode.set_input(frame_rx);

        // decoder and sink must be ready before anything is spawned
        if let Err(e) = decode.setup() {
            transport.close();
            self.fail_startup();
            return Err(e);
        }

        let keepalive = KeepaliveStage::new(
            transport.clone(),
            self.cancel.clone(),
            self.health.clone(),
            self.config.keepalive_interval,
        );

        // spawn in dependency order; each later stage may assume the ones
        // before it are already producing
        let handles = vec![
            spawn_stage(receive, self.cancel.clone()),
            spawn_stage(depacketize, self.cancel.clone()),
            spawn_stage(decode, self.cancel.clone()),
            spawn_stage(keepalive, self.cancel.clone()),
        ];

        // supervisor: waits for the cancellation signal (from abort() or a
        // failing worker) and performs the single teardown sequence
        let cancel = self.cancel.clone();
        let state = self.state.clone();
        let health = self.health.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            set_state(&state, PipelineState::Aborting);

            // closing the transport releases a receive blocked on the socket
            transport.close();
            queue.close();

            for (name, handle) in handles {
                match handle.await {
                    Ok(()) => debug!("StreamCoordinator: {name} joined"),
                    Err(e) => error!("StreamCoordinator: {name} panicked: {e}"),
                }
            }

            set_state(&state, PipelineState::Stopped);
            info!("StreamCoordinator: pipeline stopped; {}", health.summary());
        });

        set_state(
            &self.state,
            PipelineState::Running {
                started_at: Instant::now(),
            },
        );
        info!("StreamCoordinator: pipeline running");
        Ok(())
    }

    /// Abort the pipeline and wait until it has fully stopped.
    ///
    /// Idempotent and safe to call from anywhere, including concurrently
    /// with a stage failure: all triggers collapse onto one teardown, and
    /// every caller returns only once all workers have been joined and the
    /// sink released.
    pub async fn abort(&self) {
        // never started: nothing to tear down
        let idle_stop = self.state.send_if_modified(|state| {
            if matches!(state, PipelineState::Idle) {
                *state = PipelineState::Stopped;
                true
            } else {
                false
            }
        });
        if idle_stop {
            return;
        }

        self.cancel.cancel();
        self.wait_stopped().await;
    }

    /// Wait for the pipeline to reach the terminal Stopped state.
    pub async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| matches!(state, PipelineState::Stopped))
            .await;
    }

    /// Request that any partially-assembled frame be discarded, e.g. after
    /// a known stream discontinuity.
    pub fn trim(&self) {
        self.trim_requested.store(true, Ordering::Release);
    }

    /// Mark startup as failed: the pipeline goes straight to Stopped
    /// without ever reaching Running.
    fn fail_startup(&self) {
        set_state(&self.state, PipelineState::Aborting);
        set_state(&self.state, PipelineState::Stopped);
    }
}

/// Apply a validated state transition; returns whether the state changed.
fn set_state(state: &watch::Sender<PipelineState>, next: PipelineState) -> bool {
    state.send_if_modified(|current| {
        if *current != next && current.can_transition_to(&next) {
            debug!("StreamCoordinator: {current} -> {next}");
            *current = next;
            true
        } else {
            false
        }
    })
}

fn spawn_stage<S>(mut stage: S, cancel: CancellationToken) -> (&'static str, JoinHandle<()>)
where
    S: PipelineStage + 'static,
{
    let name = stage.name();
    let handle = tokio::spawn(async move {
        if let Err(e) = stage.run().await {
            error!("{}: fatal: {:#}", stage.name(), e);
            // a failing worker takes the whole pipeline down with it
            cancel.cancel();
        }
    });
    (name, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::AudioFormat;
    use crate::net::rtp::{AUDIO_PAYLOAD_TYPE, RtpHeader};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// In-memory transport: replays preloaded datagrams, then blocks like
    /// an idle socket until closed.
    struct TestTransport {
        incoming: Mutex<VecDeque<Vec<u8>>>,
        notify: Notify,
        closed: CancellationToken,
        sent: Mutex<Vec<Vec<u8>>>,
        fail_after_drain: bool,
    }

    impl TestTransport {
        fn preloaded(datagrams: Vec<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                incoming: Mutex::new(datagrams.into()),
                notify: Notify::new(),
                closed: CancellationToken::new(),
                sent: Mutex::new(Vec::new()),
                fail_after_drain: false,
            })
        }

        fn failing_after(datagrams: Vec<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                incoming: Mutex::new(datagrams.into()),
                notify: Notify::new(),
                closed: CancellationToken::new(),
                sent: Mutex::new(Vec::new()),
                fail_after_drain: true,
            })
        }
    }

    #[async_trait]
    impl Transport for TestTransport {
        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                if self.closed.is_cancelled() {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
                }
                if let Some(datagram) = self.incoming.lock().unwrap().pop_front() {
                    buf[..datagram.len()].copy_from_slice(&datagram);
                    return Ok(datagram.len());
                }
                if self.fail_after_drain {
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer gone"));
                }
                tokio::select! {
                    _ = self.closed.cancelled() => {}
                    _ = self.notify.notified() => {}
                }
            }
        }

        async fn send(&self, data: &[u8]) -> io::Result<()> {
            if self.closed.is_cancelled() {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
            }
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn close(&self) {
            self.closed.cancel();
        }
    }

    /// Decoder stub: one sample per payload byte; a leading 0xFF byte is a
    /// frame the codec rejects.
    struct TestDecoder {
        channels: u16,
    }

    impl AudioDecoder for TestDecoder {
        fn initialize(&mut self) -> Result<AudioFormat> {
            Ok(AudioFormat {
                sample_rate: 48_000,
                channels: self.channels,
                max_frame_samples: 16,
            })
        }

        fn decode(&mut self, frame: &[u8], out: &mut [i16]) -> Result<usize> {
            if frame.first() == Some(&0xFF) {
                return Err(anyhow!("corrupt frame"));
            }
            for (sample, byte) in out.iter_mut().zip(frame) {
                *sample = i16::from(*byte);
            }
            Ok(frame.len().min(out.len()))
        }
    }

    #[derive(Clone, Default)]
    struct SinkProbe(Arc<Mutex<SinkState>>);

    #[derive(Default)]
    struct SinkState {
        written: Vec<Vec<i16>>,
        opened: u32,
        released: u32,
    }

    impl SinkProbe {
        fn written_count(&self) -> usize {
            self.0.lock().unwrap().written.len()
        }

        /// Source sequence numbers recovered from the recorded samples.
        fn sequences(&self) -> Vec<u16> {
            self.0
                .lock()
                .unwrap()
                .written
                .iter()
                .map(|samples| ((samples[0] as u16) << 8) | samples[1] as u16)
                .collect()
        }
    }

    struct TestSink {
        probe: SinkProbe,
    }

    impl AudioSink for TestSink {
        fn open(&mut self, _format: &AudioFormat, _buffer_hint: usize) -> Result<()> {
            self.probe.0.lock().unwrap().opened += 1;
            Ok(())
        }

        fn write(&mut self, samples: &[i16]) -> Result<()> {
            self.probe.0.lock().unwrap().written.push(samples.to_vec());
            Ok(())
        }

        fn release(&mut self) {
            self.probe.0.lock().unwrap().released += 1;
        }
    }

    fn audio_datagram(seq: u16) -> Vec<u8> {
        RtpHeader {
            payload_type: AUDIO_PAYLOAD_TYPE,
            marker: true,
            sequence: seq,
            timestamp: u32::from(seq) * 480,
            ssrc: 1,
        }
        .serialize(&seq.to_be_bytes())
    }

    fn test_config() -> StreamConfig {
        StreamConfig {
            max_reorder_delay: Duration::from_millis(30),
            poll_timeout: Duration::from_millis(20),
            keepalive_interval: Duration::from_millis(25),
            ..Default::default()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_end_to_end_reordered_stream() {
        let mut datagrams: Vec<Vec<u8>> = (0..100).map(audio_datagram).collect();
        // packets 37 and 38 swapped in arrival order
        datagrams.swap(37, 38);

        let transport = TestTransport::preloaded(datagrams);
        let probe = SinkProbe::default();
        let coordinator = StreamCoordinator::new(test_config());

        coordinator
            .start_with_transport(
                transport.clone(),
                Box::new(TestDecoder { channels: 2 }),
                Box::new(TestSink {
                    probe: probe.clone(),
                }),
            )
            .await
            .unwrap();
        assert!(coordinator.state().is_running());

        wait_until(|| probe.written_count() == 100, "all frames decoded").await;
        coordinator.abort().await;

        assert_eq!(coordinator.state(), PipelineState::Stopped);

        let sequences = probe.sequences();
        assert_eq!(sequences.len(), 100);
        assert!(
            sequences.windows(2).all(|w| w[0] < w[1]),
            "sink order not strictly increasing: {sequences:?}"
        );
        assert_eq!(sequences, (0..100).collect::<Vec<u16>>());

        let state = probe.0.lock().unwrap();
        assert_eq!(state.opened, 1);
        assert_eq!(state.released, 1);
    }

    #[tokio::test]
    async fn test_corrupt_packet_does_not_abort() {
        let datagrams: Vec<Vec<u8>> = (0..50)
            .map(|seq| {
                if seq == 25 {
                    RtpHeader {
                        payload_type: AUDIO_PAYLOAD_TYPE,
                        marker: true,
                        sequence: seq,
                        timestamp: u32::from(seq) * 480,
                        ssrc: 1,
                    }
                    .serialize(&[0xFF, 0xFF])
                } else {
                    audio_datagram(seq)
                }
            })
            .collect();

        let transport = TestTransport::preloaded(datagrams);
        let probe = SinkProbe::default();
        let coordinator = StreamCoordinator::new(test_config());

        coordinator
            .start_with_transport(
                transport,
                Box::new(TestDecoder { channels: 2 }),
                Box::new(TestSink {
                    probe: probe.clone(),
                }),
            )
            .await
            .unwrap();

        wait_until(|| probe.written_count() == 49, "49 good frames decoded").await;

        // the bad frame was swallowed; the pipeline is still alive
        assert!(coordinator.state().is_running());
        assert_eq!(coordinator.health().decode_failures(), 1);

        coordinator.abort().await;
        assert_eq!(coordinator.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_concurrent_abort_single_teardown() {
        let transport = TestTransport::preloaded(Vec::new());
        let probe = SinkProbe::default();
        let coordinator = Arc::new(StreamCoordinator::new(test_config()));

        coordinator
            .start_with_transport(
                transport.clone(),
                Box::new(TestDecoder { channels: 2 }),
                Box::new(TestSink {
                    probe: probe.clone(),
                }),
            )
            .await
            .unwrap();

        // two triggers race; both must return with the pipeline stopped
        let a = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.abort().await })
        };
        let b = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.abort().await })
        };
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(coordinator.state(), PipelineState::Stopped);
        assert!(transport.closed.is_cancelled());
        // exactly one teardown: the sink was released exactly once
        assert_eq!(probe.0.lock().unwrap().released, 1);

        // aborting again is a no-op
        coordinator.abort().await;
        assert_eq!(probe.0.lock().unwrap().released, 1);
    }

    #[tokio::test]
    async fn test_abort_unblocks_pending_receive() {
        // no datagrams: the receive stage blocks in the transport
        let transport = TestTransport::preloaded(Vec::new());
        let coordinator = StreamCoordinator::new(test_config());

        coordinator
            .start_with_transport(
                transport,
                Box::new(TestDecoder { channels: 2 }),
                Box::new(TestSink {
                    probe: SinkProbe::default(),
                }),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        tokio::time::timeout(Duration::from_millis(500), coordinator.abort())
            .await
            .expect("abort did not complete within the poll window");
        assert_eq!(coordinator.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_worker_failure_tears_pipeline_down() {
        // transport dies after the canned packets: fatal receive error
        let transport = TestTransport::failing_after((0..5).map(audio_datagram).collect());
        let probe = SinkProbe::default();
        let coordinator = StreamCoordinator::new(test_config());

        coordinator
            .start_with_transport(
                transport,
                Box::new(TestDecoder { channels: 2 }),
                Box::new(TestSink {
                    probe: probe.clone(),
                }),
            )
            .await
            .unwrap();

        // no external abort: the failing worker triggers the teardown
        coordinator.wait_stopped().await;
        assert_eq!(coordinator.state(), PipelineState::Stopped);
        assert_eq!(probe.0.lock().unwrap().released, 1);
        assert!(coordinator.health().network_errors() >= 1);
    }

    #[tokio::test]
    async fn test_setup_failure_never_reaches_running() {
        let transport = TestTransport::preloaded(Vec::new());
        let probe = SinkProbe::default();
        let coordinator = StreamCoordinator::new(test_config());

        let err = coordinator
            .start_with_transport(
                transport.clone(),
                Box::new(TestDecoder { channels: 6 }),
                Box::new(TestSink {
                    probe: probe.clone(),
                }),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported channel count"));

        assert_eq!(coordinator.state(), PipelineState::Stopped);
        assert!(transport.closed.is_cancelled());
        assert_eq!(probe.0.lock().unwrap().opened, 0);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let coordinator = StreamCoordinator::new(test_config());
        let probe = SinkProbe::default();

        coordinator
            .start_with_transport(
                TestTransport::preloaded(Vec::new()),
                Box::new(TestDecoder { channels: 2 }),
                Box::new(TestSink {
                    probe: probe.clone(),
                }),
            )
            .await
            .unwrap();

        let err = coordinator
            .start_with_transport(
                TestTransport::preloaded(Vec::new()),
                Box::new(TestDecoder { channels: 2 }),
                Box::new(TestSink { probe }),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already started"));

        coordinator.abort().await;
    }

    #[tokio::test]
    async fn test_abort_before_start() {
        let coordinator = StreamCoordinator::new(test_config());
        coordinator.abort().await;
        assert_eq!(coordinator.state(), PipelineState::Stopped);

        // a stopped coordinator cannot be started
        assert!(
            coordinator
                .start_with_transport(
                    TestTransport::preloaded(Vec::new()),
                    Box::new(TestDecoder { channels: 2 }),
                    Box::new(TestSink {
                        probe: SinkProbe::default(),
                    }),
                )
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_keepalive_flows_while_running() {
        let transport = TestTransport::preloaded(Vec::new());
        let coordinator = StreamCoordinator::new(test_config());

        coordinator
            .start_with_transport(
                transport.clone(),
                Box::new(TestDecoder { channels: 2 }),
                Box::new(TestSink {
                    probe: SinkProbe::default(),
                }),
            )
            .await
            .unwrap();

        wait_until(|| !transport.sent.lock().unwrap().is_empty(), "a keepalive ping").await;
        coordinator.abort().await;

        let sent = transport.sent.lock().unwrap();
        let (header, _) = RtpHeader::parse(&sent[0]).unwrap();
        assert_ne!(header.payload_type, AUDIO_PAYLOAD_TYPE);
    }
}
