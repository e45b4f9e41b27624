//! The streaming engine: a fixed ring of transfers kept in flight against one IN endpoint.
//!
//! All buffers are allocated and submitted on the caller's thread when a session starts. The
//! session then moves into a worker thread, which waits for the slots in round-robin order,
//! hands successful payloads to the consumer, and puts every slot straight back on the wire.
//! Stopping clears the running flag, joins the worker and releases the ring.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::driver_interface::{Completion, IsoPacket, LinkSpeed, TransferQueue, TransportError};
use crate::endpoint::EndpointDescriptor;

/// Upper bound on the length of a single transfer.
pub const MAX_TRANSFER_LEN: usize = 0x40_0000;
/// How long a slot may take to come back after its transfers were aborted.
pub const ABORT_GRACE: Duration = Duration::from_secs(2);

pub const DEFAULT_PACKETS_PER_TRANSFER: usize = 128;
pub const DEFAULT_QUEUE_DEPTH: usize = 4;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("endpoint {0:#04x} reports a zero max packet size")]
    ZeroPacketSize(u8),

    #[error("queue depth must be at least one")]
    EmptyQueue,

    #[error("no endpoint with index {0}")]
    NoEndpoint(usize),

    #[error("a streaming session is already running")]
    AlreadyRunning,

    #[error("cannot open transfer queue: {0}")]
    Open(#[source] TransportError),

    #[error("cannot allocate buffer for slot {slot}: {source}")]
    Allocation {
        slot: usize,
        #[source]
        source: TransportError,
    },

    #[error("cannot submit slot {slot}: {source}")]
    Submit {
        slot: usize,
        #[source]
        source: TransportError,
    },

    #[error("cannot spawn stream worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("stream worker panicked")]
    WorkerPanicked,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamParams {
    pub packets_per_transfer: usize,
    pub queue_depth: usize,
    pub timeout: Duration,
    pub abort_grace: Duration,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            packets_per_transfer: DEFAULT_PACKETS_PER_TRANSFER,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            timeout: DEFAULT_TIMEOUT,
            abort_grace: ABORT_GRACE,
        }
    }
}

/// Adjusts the packets-per-transfer count to what the endpoint and link can take.
///
/// A transfer never exceeds [`MAX_TRANSFER_LEN`]; when it would, the count shrinks to fit and is
/// rounded down to a multiple of 8. Isochronous endpoints on high and super speed links move at
/// least 8 packets and always a multiple of 8, and at least 128 on high speed.
pub fn clamp_packets_per_transfer(
    endpoint: &EndpointDescriptor,
    speed: Option<LinkSpeed>,
    packets_per_transfer: usize,
) -> usize {
    let max_packet_size = usize::from(endpoint.max_packet_size).max(1);
    let mut ppx = packets_per_transfer.max(1);

    let fits = max_packet_size
        .checked_mul(ppx)
        .map_or(false, |len| len <= MAX_TRANSFER_LEN);
    if !fits {
        ppx = MAX_TRANSFER_LEN / max_packet_size;
        ppx -= ppx % 8;
    }

    let fast = speed.map_or(false, |speed| speed.is_high() || speed.is_super());
    if endpoint.is_isoch() && fast {
        if ppx < 8 {
            ppx = 8;
        }
        ppx -= ppx % 8;
        if speed.map_or(false, LinkSpeed::is_high) && ppx < 128 {
            ppx = 128;
        }
    }

    ppx.max(1)
}

/// Counters shared between the worker and everybody else.
#[derive(Debug, Default)]
pub struct StreamStats {
    bytes: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    completions: AtomicU64,
}

impl StreamStats {
    /// Returns the bytes received since the previous call and restarts the count.
    pub fn take_bytes(&self) -> u64 {
        self.bytes.swap(0, Ordering::AcqRel)
    }
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Acquire)
    }
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Acquire)
    }
    /// Transfers handed back by the queue, whatever their outcome.
    pub fn completions(&self) -> u64 {
        self.completions.load(Ordering::Acquire)
    }

    pub(crate) fn record_bytes(&self, n: u64) {
        Self::add(&self.bytes, n);
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::AcqRel);
    }
}

/// Receives payloads on the worker thread. The slice is only valid for the duration of the call.
pub trait DeviceDataHandler: Send + 'static {
    fn handle_device_data(&mut self, data: &[u8]);
}

impl<F> DeviceDataHandler for F
where
    F: FnMut(&[u8]) + Send + 'static,
{
    fn handle_device_data(&mut self, data: &[u8]) {
        self(data)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SlotState {
    Submitted,
    AwaitingCompletion,
    /// The buffer is back with the engine.
    CompletedPendingResubmit,
}

struct TransferSlot<B> {
    buffer: Option<B>,
    packets: Vec<IsoPacket>,
    state: SlotState,
}

impl<B> TransferSlot<B> {
    fn in_flight(&self) -> bool {
        self.state != SlotState::CompletedPendingResubmit
    }
}

/// Parameters a session actually runs with, after clamping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionInfo {
    pub endpoint: EndpointDescriptor,
    pub packets_per_transfer: usize,
    pub queue_depth: usize,
    pub transfer_len: usize,
    pub timeout: Duration,
}

struct Pipe<Q: TransferQueue> {
    queue: Q,
    slots: Vec<TransferSlot<Q::Buffer>>,
    info: SessionInfo,
    abort_grace: Duration,
    next: usize,
    stats: Arc<StreamStats>,
}

impl<Q: TransferQueue> Pipe<Q> {
    fn fill(
        mut queue: Q,
        info: SessionInfo,
        abort_grace: Duration,
        stats: Arc<StreamStats>,
    ) -> Result<Self, StreamError> {
        let iso_packets = if info.endpoint.is_isoch() {
            info.packets_per_transfer
        } else {
            0
        };

        let mut slots = Vec::with_capacity(info.queue_depth);
        for slot in 0..info.queue_depth {
            let buffer = queue
                .allocate(info.transfer_len)
                .map_err(|source| StreamError::Allocation { slot, source })?;
            slots.push(TransferSlot {
                buffer: Some(buffer),
                packets: vec![IsoPacket::default(); iso_packets],
                state: SlotState::CompletedPendingResubmit,
            });
        }

        Ok(Self {
            queue,
            slots,
            info,
            abort_grace,
            next: 0,
            stats,
        })
    }

    fn submit(&mut self, slot: usize) -> Result<(), StreamError> {
        let buffer = match self.slots[slot].buffer.take() {
            Some(buffer) => buffer,
            None => return Ok(()),
        };
        self.queue
            .submit(slot, buffer)
            .map_err(|source| StreamError::Submit { slot, source })?;
        self.slots[slot].state = SlotState::Submitted;
        Ok(())
    }

    /// Puts every slot on the wire. On failure whatever was submitted is drained again.
    fn submit_all(&mut self) -> Result<(), StreamError> {
        for slot in 0..self.slots.len() {
            if let Err(err) = self.submit(slot) {
                self.drain();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Waits for `slot`, aborting the queue and waiting once more when it does not show up in
    /// time. Stores the returned buffer back into the slot.
    fn reclaim(&mut self, slot: usize) -> Option<Completion<()>> {
        let entry = &mut self.slots[slot];
        entry.state = SlotState::AwaitingCompletion;

        let mut completion = self
            .queue
            .await_completion(slot, self.info.timeout, &mut entry.packets);
        if completion.is_none() {
            StreamStats::add(&self.stats.timeouts, 1);
            warn!("slot {} timed out, aborting outstanding transfers", slot);
            self.queue.abort();
            completion = self
                .queue
                .await_completion(slot, self.abort_grace, &mut entry.packets);
        }

        let Completion {
            buffer,
            actual_len,
            status,
        } = completion?;
        entry.buffer = Some(buffer);
        entry.state = SlotState::CompletedPendingResubmit;
        Some(Completion {
            buffer: (),
            actual_len,
            status,
        })
    }

    fn account<H: DeviceDataHandler>(
        &mut self,
        slot: usize,
        completion: Completion<()>,
        handler: &mut H,
    ) {
        StreamStats::add(&self.stats.completions, 1);
        let entry = &mut self.slots[slot];

        if let Err(err) = completion.status {
            StreamStats::add(&self.stats.failures, 1);
            debug!("slot {} failed: {}", slot, err);
            for packet in entry.packets.iter_mut() {
                *packet = IsoPacket::default();
            }
            return;
        }

        let buffer = match entry.buffer.as_deref() {
            Some(buffer) => buffer,
            None => return,
        };
        let view = &buffer[..completion.actual_len.min(buffer.len())];

        if self.info.endpoint.is_isoch() {
            let max_packet_size = u32::from(self.info.endpoint.max_packet_size);
            let mut good = 0u64;
            let mut bytes = 0u64;
            for packet in entry.packets.iter_mut() {
                if packet.status == 0 && packet.length <= max_packet_size {
                    good += 1;
                    bytes += u64::from(packet.length);
                }
                *packet = IsoPacket::default();
            }
            let bad = entry.packets.len() as u64 - good;
            StreamStats::add(&self.stats.successes, good);
            StreamStats::add(&self.stats.failures, bad);
            self.stats.record_bytes(bytes);
            if good > 0 {
                handler.handle_device_data(view);
            }
        } else {
            StreamStats::add(&self.stats.successes, 1);
            self.stats.record_bytes(self.info.transfer_len as u64);
            handler.handle_device_data(view);
        }
    }

    fn run<H: DeviceDataHandler>(
        mut self,
        running: &AtomicBool,
        handler: &mut H,
    ) -> Result<(), StreamError> {
        let depth = self.slots.len();
        let result = loop {
            if !running.load(Ordering::Acquire) {
                break Ok(());
            }

            let slot = self.next;
            match self.reclaim(slot) {
                Some(completion) => {
                    self.account(slot, completion, handler);
                    if let Err(err) = self.submit(slot) {
                        break Err(err);
                    }
                    self.next = (slot + 1) % depth;
                }
                None => {
                    // Nothing came back even after the abort; keep waiting on the same slot.
                    StreamStats::add(&self.stats.failures, 1);
                    warn!("slot {} did not complete after abort", slot);
                }
            }
        };

        running.store(false, Ordering::Release);
        if let Err(err) = &result {
            warn!("stream session failed: {}", err);
        }
        self.drain();
        result
    }

    /// Collects every slot still in flight, starting with the one due next.
    fn drain(&mut self) {
        let depth = self.slots.len();
        for i in 0..depth {
            let slot = (self.next + i) % depth;
            if !self.slots[slot].in_flight() {
                continue;
            }
            if self.reclaim(slot).is_none() {
                warn!("slot {} abandoned while draining", slot);
            }
        }
        debug!("{} transfers still pending after drain", self.queue.pending());
    }
}

/// A running streaming session.
pub struct StreamEngine {
    running: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
    worker: Option<JoinHandle<Result<(), StreamError>>>,
    session: SessionInfo,
}

impl StreamEngine {
    /// Allocates and submits the transfer ring on `queue`, then hands it to a worker thread that
    /// feeds `handler`.
    pub fn start<Q, H>(
        queue: Q,
        endpoint: &EndpointDescriptor,
        speed: Option<LinkSpeed>,
        params: &StreamParams,
        stats: Arc<StreamStats>,
        mut handler: H,
    ) -> Result<Self, StreamError>
    where
        Q: TransferQueue + 'static,
        H: DeviceDataHandler,
    {
        if endpoint.max_packet_size == 0 {
            return Err(StreamError::ZeroPacketSize(endpoint.address));
        }
        if params.queue_depth == 0 {
            return Err(StreamError::EmptyQueue);
        }

        let packets_per_transfer =
            clamp_packets_per_transfer(endpoint, speed, params.packets_per_transfer);
        if packets_per_transfer != params.packets_per_transfer {
            info!(
                "packets per transfer adjusted from {} to {}",
                params.packets_per_transfer, packets_per_transfer
            );
        }
        let session = SessionInfo {
            endpoint: *endpoint,
            packets_per_transfer,
            queue_depth: params.queue_depth,
            transfer_len: usize::from(endpoint.max_packet_size) * packets_per_transfer,
            timeout: params.timeout,
        };

        let mut pipe = Pipe::fill(queue, session, params.abort_grace, Arc::clone(&stats))?;
        pipe.submit_all()?;

        let running = Arc::new(AtomicBool::new(true));
        let worker_running = Arc::clone(&running);
        let worker = thread::Builder::new()
            .name("fx3-stream".to_string())
            .spawn(move || pipe.run(&worker_running, &mut handler))
            .map_err(StreamError::Spawn)?;

        info!(
            "streaming from endpoint {:#04x}: {} x {} bytes in flight",
            endpoint.address, session.queue_depth, session.transfer_len
        );
        Ok(Self {
            running,
            stats,
            worker: Some(worker),
            session,
        })
    }

    /// False once stopped, and also when the worker ended the session by itself.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Signals the worker and waits for it, returning how the session ended. Stopping an already
    /// stopped engine does nothing.
    pub fn stop(&mut self) -> Result<(), StreamError> {
        self.running.store(false, Ordering::Release);
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => return Ok(()),
        };
        let result = worker.join().map_err(|_| StreamError::WorkerPanicked)?;
        info!(
            "streaming stopped: {} ok, {} failed, {} timeouts",
            self.stats.successes(),
            self.stats.failures(),
            self.stats.timeouts()
        );
        result
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("stream session ended with error: {}", err);
        }
    }
}
