//! Reorder queue (jitter buffer) between the receive and depacketize stages
//!
//! Absorbs network reordering by keeping packets sorted by RTP sequence
//! number and releasing them in order. A missing packet holds delivery back
//! for at most the configured reorder delay, after which the gap is skipped;
//! loss is never recovered, only stepped over.

use crate::pipeline::pool::PooledBuffer;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Bytes of one received datagram backed by a pooled buffer.
///
/// Exclusively owned by whichever stage currently holds it; when the
/// depacketizer drops it after consuming the payload, the backing buffer
/// returns to the pool.
pub struct RawPacket {
    buffer: PooledBuffer,
    payload_offset: usize,
    len: usize,
}

impl RawPacket {
    /// Wrap a received datagram of `len` bytes whose media payload starts
    /// at `payload_offset`.
    pub fn new(buffer: PooledBuffer, payload_offset: usize, len: usize) -> Self {
        debug_assert!(payload_offset <= len && len <= buffer.len());
        Self {
            buffer,
            payload_offset,
            len,
        }
    }

    /// The media payload, with transport framing stripped.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.payload_offset..self.len]
    }
}

/// A raw packet tagged with its RTP ordering metadata and arrival time.
pub struct SequencedPacket {
    pub sequence: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub received_at: Instant,
    pub packet: RawPacket,
}

/// Outcome of a bounded [`ReorderQueue::pop`].
pub enum Pop {
    /// The next packet in playback order.
    Packet(SequencedPacket),
    /// Nothing became deliverable within the timeout.
    Timeout,
    /// The queue was closed and has been fully drained.
    Closed,
}

/// Reorder queue configuration
#[derive(Debug, Clone)]
pub struct ReorderConfig {
    /// How long a head-of-line gap may hold delivery back before the
    /// missing packet is written off
    pub max_reorder_delay: Duration,
    /// Maximum number of packets buffered before the oldest gap is
    /// abandoned outright
    pub max_queued_packets: usize,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            max_reorder_delay: Duration::from_millis(50),
            max_queued_packets: 256,
        }
    }
}

/// Shared handle to the reorder queue.
///
/// Single producer (receive stage) and single consumer (depacketize stage);
/// both sides synchronize internally, so neither holds a lock across an
/// await point.
#[derive(Clone)]
pub struct ReorderQueue {
    shared: Arc<Shared>,
}

struct Shared {
    queue: Mutex<OrderedBuffer>,
    notify: Notify,
    closed: AtomicBool,
}

impl ReorderQueue {
    /// Create an empty queue with the given configuration
    pub fn new(config: ReorderConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(OrderedBuffer::new(config)),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Insert a packet, keeping the buffer ordered by sequence number.
    ///
    /// Non-blocking. Duplicates and packets already overtaken by the
    /// consumer are dropped.
    pub fn push(&self, packet: SequencedPacket) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        self.shared.queue.lock().unwrap().insert(packet);
        self.shared.notify.notify_one();
    }

    /// Close the queue, waking the consumer.
    ///
    /// Packets already buffered stay poppable; once drained, `pop` yields
    /// [`Pop::Closed`]. Idempotent.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for the next packet in playback order.
    ///
    /// Returns as soon as the next expected packet is available. When the
    /// head of the queue has been stuck behind a missing packet for longer
    /// than the reorder delay, the earliest buffered packet is emitted
    /// instead and the gap is counted as lost. After close, buffered
    /// packets drain immediately and `Closed` follows.
    pub async fn pop(&self, timeout: Duration) -> Pop {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let closed = self.shared.closed.load(Ordering::Acquire);
            let wait_until = {
                let mut queue = self.shared.queue.lock().unwrap();
                match queue.next_ready(Instant::now(), closed) {
                    Emit::Packet(packet) => return Pop::Packet(*packet),
                    Emit::Empty if closed => return Pop::Closed,
                    Emit::Empty => deadline,
                    Emit::WaitUntil(at) => deadline.min(tokio::time::Instant::from_std(at)),
                }
            };

            if tokio::time::Instant::now() >= deadline {
                return Pop::Timeout;
            }

            tokio::select! {
                _ = self.shared.notify.notified() => {}
                _ = tokio::time::sleep_until(wait_until) => {}
            }
        }
    }

    /// Get statistics: (received, reordered, lost, dropped, buffered)
    pub fn stats(&self) -> (u64, u64, u64, u64, usize) {
        let queue = self.shared.queue.lock().unwrap();
        (
            queue.received,
            queue.reordered,
            queue.lost,
            queue.dropped,
            queue.buffer.len(),
        )
    }
}

enum Emit {
    Packet(Box<SequencedPacket>),
    WaitUntil(Instant),
    Empty,
}

/// Sequence-ordered packet buffer with a consumer cursor.
struct OrderedBuffer {
    buffer: VecDeque<SequencedPacket>,
    /// Next sequence number the consumer expects; established by the
    /// first packet popped
    cursor: Option<u16>,
    config: ReorderConfig,
    received: u64,
    reordered: u64,
    lost: u64,
    dropped: u64,
}

impl OrderedBuffer {
    fn new(config: ReorderConfig) -> Self {
        Self {
            buffer: VecDeque::with_capacity(64),
            cursor: None,
            config,
            received: 0,
            reordered: 0,
            lost: 0,
            dropped: 0,
        }
    }

    fn insert(&mut self, packet: SequencedPacket) {
        self.received += 1;
        let seq = packet.sequence;

        // late: the consumer has already moved past this sequence number
        if let Some(cursor) = self.cursor
            && seq_before(seq, cursor)
        {
            self.dropped += 1;
            return;
        }

        if self.buffer.iter().any(|p| p.sequence == seq) {
            self.dropped += 1;
            return;
        }

        // keep ascending sequence order, wraparound-aware
        let pos = self.buffer.iter().position(|p| seq_before(seq, p.sequence));
        match pos {
            Some(i) => {
                self.buffer.insert(i, packet);
                self.reordered += 1;
            }
            None => self.buffer.push_back(packet),
        }

        // overflow: stop waiting for whatever is missing in front
        if self.buffer.len() > self.config.max_queued_packets
            && let Some(front_seq) = self.buffer.front().map(|p| p.sequence)
            && let Some(cursor) = self.cursor
            && cursor != front_seq
        {
            log::warn!(
                "ReorderQueue: overflow, abandoning gap {}..{}",
                cursor,
                front_seq
            );
            self.lost += u64::from(front_seq.wrapping_sub(cursor));
            self.cursor = Some(front_seq);
        }
    }

    /// Pop the next deliverable packet, or report how long the consumer
    /// should wait for the head-of-line gap to resolve.
    fn next_ready(&mut self, now: Instant, closed: bool) -> Emit {
        let Some(front) = self.buffer.front() else {
            return Emit::Empty;
        };

        let seq = front.sequence;
        let cursor = *self.cursor.get_or_insert(seq);

        // in order, or draining after close
        if seq == cursor || closed {
            self.lost += u64::from(seq.wrapping_sub(cursor));
            return self.emit_front();
        }

        // head-of-line gap: hold back until the earliest packet has aged out
        let ready_at = front.received_at + self.config.max_reorder_delay;
        if now >= ready_at {
            self.lost += u64::from(seq.wrapping_sub(cursor));
            self.emit_front()
        } else {
            Emit::WaitUntil(ready_at)
        }
    }

    fn emit_front(&mut self) -> Emit {
        let packet = self.buffer.pop_front().unwrap();
        self.cursor = Some(packet.sequence.wrapping_add(1));
        Emit::Packet(Box::new(packet))
    }
}

/// True when `a` logically precedes `b`, modulo 16-bit wraparound.
fn seq_before(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}
