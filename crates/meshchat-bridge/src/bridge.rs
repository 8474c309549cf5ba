//! SerialBridge - duplex framed link to the companion display
//!
//! Two independent workers share one [`SerialTransport`]:
//!
//! - **outbound**: dequeues text/control items, frames them as `TXTP`/`JCTL`
//!   and writes them. A failed write closes the transport; the item is not
//!   re-queued (at-most-once) and the handle is reopened when the next item
//!   is written.
//! - **inbound**: reads whatever the port has into a [`FrameDecoder`] and
//!   hands each complete frame's text to the inbound callback. Unknown tags
//!   and out-of-range lengths make the decoder slide forward to the next
//!   possible inbound tag (resync); the port's input is flushed only when
//!   no candidate tag is left in the buffer.
//!
//! ```text
//! ┌──────────────┐  send()   ┌───────────────┐  TXTP/JCTL  ┌────────────┐
//! │ ChatNode     │──────────►│ OutboundQueue │────────────►│            │
//! │              │           └───────────────┘  outbound   │ Serial     │
//! │              │  callback ┌───────────────┐  TXIN/EVNT  │ Transport  │
//! │              │◄──────────│ frame reader  │◄────────────│            │
//! └──────────────┘           └───────────────┘  inbound    └────────────┘
//! ```
//!
//! The transport is shared without an outer lock, so a read waiting for
//! data never delays a write. Each worker owns its reconnect loop; a fault
//! seen by one never stops the other. Every wait is bounded (poll interval, read timeouts) so the stop
//! flag is observed promptly.

use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, DecodeStep, Frame, FrameDecoder, FrameTag, MAX_PAYLOAD};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::queue::OutboundQueue;
use crate::transport::SerialTransport;

/// Consecutive resyncs after which the desync is reported as persistent
const PERSISTENT_DESYNC_THRESHOLD: u64 = 32;

/// Most bytes requested from the transport per read
const READ_CHUNK: usize = 4096;

/// Item destined for the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Plain text line (`TXTP`)
    Text(String),
    /// Structured control payload, JSON object text (`JCTL`)
    Control(String),
}

impl Outbound {
    /// Build a control item from a JSON value
    pub fn control(value: &serde_json::Value) -> Self {
        Outbound::Control(value.to_string())
    }

    /// Frame tag for this item
    pub fn tag(&self) -> FrameTag {
        match self {
            Outbound::Text(_) => FrameTag::TextOut,
            Outbound::Control(_) => FrameTag::ControlOut,
        }
    }

    /// Payload bytes for this item
    pub fn payload(&self) -> &[u8] {
        match self {
            Outbound::Text(text) | Outbound::Control(text) => text.as_bytes(),
        }
    }
}

/// Message received from the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Text or command line (`TXIN`)
    Text(String),
    /// Legacy structured event, JSON object text (`EVNT`)
    Event(String),
}

impl Inbound {
    /// Convert a decoded inbound frame; outbound tags yield `None`
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        match frame.tag {
            FrameTag::TextIn => Some(Inbound::Text(frame.text())),
            FrameTag::EventIn => Some(Inbound::Event(frame.text())),
            FrameTag::TextOut | FrameTag::ControlOut => None,
        }
    }

    /// Decoded payload text
    pub fn text(&self) -> &str {
        match self {
            Inbound::Text(text) | Inbound::Event(text) => text,
        }
    }
}

/// Callback invoked by the inbound worker for every received message
///
/// Errors and panics are caught, counted and logged; they never stop the
/// worker.
pub type InboundCallback =
    Arc<dyn Fn(Inbound) -> std::result::Result<(), String> + Send + Sync>;

/// Bridge statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Frames written to the peripheral
    pub frames_out: u64,
    /// Frames received and delivered to the callback
    pub frames_in: u64,
    /// Outbound items evicted by the drop-oldest policy
    pub dropped_overflow: u64,
    /// Outbound text items truncated to the frame maximum
    pub truncated: u64,
    /// Receive-side resynchronizations
    pub resyncs: u64,
    /// Transport I/O failures (both directions)
    pub io_errors: u64,
    /// Inbound callback failures
    pub callback_failures: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    frames_out: AtomicU64,
    frames_in: AtomicU64,
    dropped_overflow: AtomicU64,
    truncated: AtomicU64,
    resyncs: AtomicU64,
    io_errors: AtomicU64,
    callback_failures: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            frames_out: self.frames_out.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    queue: OutboundQueue<Outbound>,
    stop: AtomicBool,
    counters: StatsCounters,
}

impl Shared {
    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Cloneable handle for queueing items to the peripheral
#[derive(Clone)]
pub struct BridgeHandle {
    shared: Arc<Shared>,
}

impl BridgeHandle {
    /// Queue an item without blocking
    ///
    /// Oversized text is truncated on a character boundary; oversized
    /// control payloads are rejected. On overflow the oldest pending item
    /// is dropped.
    pub fn send(&self, item: Outbound) -> Result<()> {
        if self.shared.is_stopped() {
            return Err(BridgeError::BridgeClosed);
        }

        let item = match item {
            Outbound::Text(text) if text.len() > MAX_PAYLOAD => {
                warn!(
                    size = text.len(),
                    max = MAX_PAYLOAD,
                    "Outbound text too large for one frame, truncating"
                );
                StatsCounters::bump(&self.shared.counters.truncated);
                Outbound::Text(codec::truncate_utf8(&text, MAX_PAYLOAD).to_string())
            }
            Outbound::Control(json) if json.len() > MAX_PAYLOAD => {
                warn!(size = json.len(), "Dropping oversized control payload");
                return Err(BridgeError::PayloadTooLarge {
                    size: json.len(),
                    max: MAX_PAYLOAD,
                });
            }
            item => item,
        };

        if let Some(evicted) = self.shared.queue.push(item) {
            StatsCounters::bump(&self.shared.counters.dropped_overflow);
            debug!(tag = %evicted.tag(), "Outbound queue full, dropped oldest item");
        }
        Ok(())
    }

    /// Queue a plain text line
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Outbound::Text(text.into()))
    }

    /// Queue a structured control payload
    pub fn send_control(&self, value: &serde_json::Value) -> Result<()> {
        self.send(Outbound::control(value))
    }

    /// Snapshot of the bridge counters
    pub fn stats(&self) -> BridgeStats {
        self.shared.counters.snapshot()
    }

    /// Number of items waiting for the outbound worker
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Whether the bridge has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.is_stopped()
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Duplex serial bridge owning the two worker tasks
pub struct SerialBridge {
    handle: BridgeHandle,
    workers: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    join_timeout: Duration,
}

impl SerialBridge {
    /// Start both workers over `transport`
    ///
    /// Must be called from within a tokio runtime. The transport does not
    /// need to be open; the workers open it on first use.
    pub fn start<T>(transport: T, config: &BridgeConfig, on_inbound: InboundCallback) -> Self
    where
        T: SerialTransport + 'static,
    {
        let shared = Arc::new(Shared {
            queue: OutboundQueue::new(config.queue_capacity),
            stop: AtomicBool::new(false),
            counters: StatsCounters::default(),
        });

        info!(
            transport = transport.name(),
            capacity = config.queue_capacity,
            "Starting serial bridge"
        );

        let transport = Arc::new(transport);

        let outbound = tokio::spawn(run_outbound(
            shared.clone(),
            transport.clone(),
            config.clone(),
        ));
        let inbound = tokio::spawn(run_inbound(
            shared.clone(),
            transport,
            config.clone(),
            on_inbound,
        ));

        Self {
            handle: BridgeHandle { shared },
            workers: Mutex::new(vec![("outbound", outbound), ("inbound", inbound)]),
            join_timeout: config.join_timeout,
        }
    }

    /// Get a cloneable handle for queueing items
    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    /// Queue an item without blocking
    pub fn send(&self, item: Outbound) -> Result<()> {
        self.handle.send(item)
    }

    /// Snapshot of the bridge counters
    pub fn stats(&self) -> BridgeStats {
        self.handle.stats()
    }

    /// Stop both workers
    ///
    /// Waits up to the configured join timeout per worker and aborts any
    /// worker still running after that. Safe to call more than once.
    pub async fn close(&self) {
        let already_stopped = self.handle.shared.stop.swap(true, Ordering::SeqCst);
        self.handle.shared.queue.wake();

        let workers = std::mem::take(&mut *self.workers.lock());
        for (name, mut worker) in workers {
            match tokio::time::timeout(self.join_timeout, &mut worker).await {
                Ok(Ok(())) => debug!(worker = name, "Bridge worker stopped"),
                Ok(Err(e)) => warn!(worker = name, error = %e, "Bridge worker ended abnormally"),
                Err(_) => {
                    warn!(worker = name, "Bridge worker did not stop in time, aborting");
                    worker.abort();
                }
            }
        }

        let dropped = self.handle.shared.queue.drain().len();
        if !already_stopped {
            info!(unsent = dropped, "Serial bridge closed");
        }
    }
}

impl Drop for SerialBridge {
    fn drop(&mut self) {
        self.handle.shared.stop.store(true, Ordering::SeqCst);
        self.handle.shared.queue.wake();
    }
}

/// Limits repeated I/O error logging to one line per interval
struct ErrorThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl ErrorThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns the number of suppressed errors if this one should be logged
    fn check(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

async fn run_outbound<T: SerialTransport>(
    shared: Arc<Shared>,
    transport: Arc<T>,
    config: BridgeConfig,
) {
    let mut throttle = ErrorThrottle::new(config.error_log_interval);
    debug!("Outbound worker running");

    while !shared.is_stopped() {
        let Some(item) = shared.queue.pop_timeout(config.poll_interval).await else {
            continue;
        };

        let frame = match codec::encode(item.tag(), item.payload()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping unencodable outbound item");
                continue;
            }
        };

        match write_frame(&*transport, &frame).await {
            Ok(()) => {
                StatsCounters::bump(&shared.counters.frames_out);
                trace!(tag = %item.tag(), size = frame.len(), "Frame written");
            }
            Err(e) => {
                transport.close().await;
                StatsCounters::bump(&shared.counters.io_errors);
                if let Some(suppressed) = throttle.check() {
                    warn!(
                        error = %e,
                        code = e.error_code(),
                        suppressed,
                        "Serial write failed, frame dropped; reopening"
                    );
                }
                tokio::time::sleep(config.reconnect_delay).await;
            }
        }
    }

    debug!("Outbound worker exiting");
}

async fn write_frame<T: SerialTransport + ?Sized>(port: &T, frame: &[u8]) -> Result<()> {
    if !port.is_open() {
        port.open().await?;
    }
    port.write_all(frame).await
}

async fn run_inbound<T: SerialTransport>(
    shared: Arc<Shared>,
    transport: Arc<T>,
    config: BridgeConfig,
    callback: InboundCallback,
) {
    let mut throttle = ErrorThrottle::new(config.error_log_interval);
    let mut reader = FrameReader::new(&shared, &callback);
    debug!("Inbound worker running");

    while !shared.is_stopped() {
        if let Err(e) = reader.read_once(&*transport, &config).await {
            transport.close().await;
            reader.reset();
            StatsCounters::bump(&shared.counters.io_errors);
            if let Some(suppressed) = throttle.check() {
                warn!(
                    error = %e,
                    code = e.error_code(),
                    suppressed,
                    "Serial read failed; reopening"
                );
            }
            tokio::time::sleep(config.reconnect_delay).await;
        }
    }

    transport.close().await;
    debug!("Inbound worker exiting");
}

/// Receive-side state of the inbound worker
struct FrameReader<'a> {
    shared: &'a Shared,
    callback: &'a InboundCallback,
    decoder: FrameDecoder,
    /// Since when the buffer has held an incomplete frame
    partial_since: Option<Instant>,
    consecutive_desyncs: u64,
}

impl<'a> FrameReader<'a> {
    fn new(shared: &'a Shared, callback: &'a InboundCallback) -> Self {
        Self {
            shared,
            callback,
            decoder: FrameDecoder::new(),
            partial_since: None,
            consecutive_desyncs: 0,
        }
    }

    /// Read one chunk from the port and deliver every frame it completes
    async fn read_once<T: SerialTransport + ?Sized>(
        &mut self,
        port: &T,
        config: &BridgeConfig,
    ) -> Result<()> {
        if !port.is_open() {
            port.open().await?;
        }

        self.expire_partial(config.payload_timeout);

        match port.read_chunk(READ_CHUNK, config.read_timeout).await {
            Ok(chunk) => {
                self.decoder.extend(&chunk);
                self.drain(port).await
            }
            Err(e) if e.is_timeout() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn drain<T: SerialTransport + ?Sized>(&mut self, port: &T) -> Result<()> {
        loop {
            match self.decoder.next_step() {
                DecodeStep::Frame(frame) => {
                    self.consecutive_desyncs = 0;
                    self.partial_since = None;
                    trace!(tag = %frame.tag, length = frame.payload.len(), "Frame received");
                    deliver(self.shared, self.callback, &frame);
                }
                DecodeStep::NeedMore => {
                    if self.decoder.is_empty() {
                        self.partial_since = None;
                    } else if self.partial_since.is_none() {
                        self.partial_since = Some(Instant::now());
                    }
                    return Ok(());
                }
                DecodeStep::Resynced { skipped, exhausted } => {
                    StatsCounters::bump(&self.shared.counters.resyncs);
                    self.consecutive_desyncs += 1;
                    debug!(skipped, exhausted, "Frame desync, skipped to next tag");
                    if self.consecutive_desyncs == PERSISTENT_DESYNC_THRESHOLD {
                        warn!(
                            resyncs = self.consecutive_desyncs,
                            "Peripheral stream persistently out of sync"
                        );
                    }
                    if exhausted {
                        self.partial_since = None;
                        port.discard_input().await?;
                    }
                }
            }
        }
    }

    /// Drop a partial frame that stopped growing into a whole one in time
    fn expire_partial(&mut self, timeout: Duration) {
        let Some(since) = self.partial_since else {
            return;
        };
        if since.elapsed() >= timeout {
            let lost = self.decoder.clear();
            self.partial_since = None;
            debug!(lost, "Incomplete frame timed out, dropped");
        }
    }

    fn reset(&mut self) {
        self.decoder.clear();
        self.partial_since = None;
    }
}

fn deliver(shared: &Shared, callback: &InboundCallback, frame: &Frame) {
    let Some(message) = Inbound::from_frame(frame) else {
        return;
    };
    StatsCounters::bump(&shared.counters.frames_in);

    match std::panic::catch_unwind(AssertUnwindSafe(|| callback(message))) {
        Ok(Ok(())) => {}
        Ok(Err(reason)) => {
            StatsCounters::bump(&shared.counters.callback_failures);
            let err = BridgeError::CallbackFailure(reason);
            warn!(error = %err, "Inbound message handler failed");
        }
        Err(panic) => {
            StatsCounters::bump(&shared.counters.callback_failures);
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(panic = %reason, "Inbound message handler panicked");
        }
    }
}
