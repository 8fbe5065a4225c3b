//! # `swotrace`
//!
//! The SWO capture and decoding core of a trace viewer for the Black
//! Magic Probe. The probe forwards the target's SWO pin either on a USB
//! bulk endpoint or over TCP; this crate reads that byte stream on a
//! dedicated thread, reassembles ITM stimulus packets across the
//! transport's arbitrary 64-byte framing (as specified in the [ARMv7-M
//! architecture reference manual, Appendix
//! D4](https://developer.arm.com/documentation/ddi0403/ed/); any
//! references in this code base refer to that document), and demultiplexes
//! them onto the 32 stimulus channels. Decoded output goes one of two
//! ways:
//!
//! - **text trace**: payload bytes coalesce into line-oriented
//!   [`TraceLine`]s with relative timestamps, split on newlines, channel
//!   switches, length and arrival gaps;
//! - **profiling**: periodic PC samples accumulate into a per-halfword
//!   histogram over the target's code region.
//!
//! A per-channel [`Timeline`] index buckets arrival times for zoomable
//! visualization, and channels bound to a CTF stream hand their payload
//! to an external [`CtfStream`] decoder instead.
//!
//! Everything lives in one owned [`Trace`] context; the only concurrency
//! is the transport reader thread feeding the lock-free packet ring:
//!
//! ```
//! use swotrace::Trace;
//!
//! let mut trace = Trace::new();
//! // three 1-byte stimulus packets on channel 0: "H", "i", "\n"
//! trace.feed(&[0x01, b'H', 0x01, b'i', 0x01, 0x0A], 0.0);
//! assert_eq!(trace.process_text(true), 1);
//! assert_eq!(trace.store.lines()[0].text(), b"Hi");
//! ```

mod channel;
mod ctf;
mod decoder;
mod error;
mod ring;
mod status;
mod store;
mod timeline;
pub mod transport;

pub use channel::{ChannelRegistry, Rgba, CHANNEL_COUNT};
pub use ctf::{CtfMessage, CtfStream};
pub use decoder::{
    address_to_index, sample_map_len, ItmDecoder, OVERFLOW_HEADER, PC_SAMPLE_HEADER,
};
pub use error::{InitError, TransportFault};
pub use ring::{PacketFrame, FRAME_CAPACITY, RING_CAPACITY};
pub use status::{StatusEntry, StatusLog, StatusOrigin, CODE_CTF_DECODE, CODE_TRANSPORT_CLOSED};
pub use store::{TraceLine, TraceStore, CONTINUATION_TIMEOUT, LINE_MAX};
pub use timeline::{Timeline, TimelineMark, MARK_SCALES, MARK_SPACING_MIN};
pub use transport::{SystemHooks, TraceHooks, TraceLink};

use std::sync::Arc;

use crate::ring::PacketRing;
use crate::transport::{Reader, Transport};

/// One trace session: channel registry, capture pipeline, decoder, and
/// the decoded results.
///
/// The context is owned by the UI thread. [`start`](Trace::start) spawns
/// the transport reader; the UI then calls
/// [`process_text`](Trace::process_text) or
/// [`process_profile`](Trace::process_profile) on every redraw (or on
/// every [`TraceHooks::wake`]) to drain the ring.
pub struct Trace {
    /// The 32 stimulus channel slots.
    pub channels: ChannelRegistry,
    /// Decoded trace lines, in arrival order.
    pub store: TraceStore,
    /// Per-channel arrival-time index.
    pub timeline: Timeline,
    /// Connection and decode diagnostics.
    pub status: StatusLog,
    ring: Arc<PacketRing>,
    decoder: ItmDecoder,
    ctf: Option<Box<dyn CtfStream>>,
    hooks: Arc<dyn TraceHooks>,
    reader: Option<Reader>,
}

impl Default for Trace {
    fn default() -> Self {
        Trace::new()
    }
}

impl Trace {
    /// A context with the default hooks (no wake notification, process
    /// monotonic clock); suits polling consumers and tests.
    pub fn new() -> Trace {
        Trace::with_hooks(Arc::new(SystemHooks::new()))
    }

    /// A context with caller-supplied GUI hooks.
    pub fn with_hooks(hooks: Arc<dyn TraceHooks>) -> Trace {
        Trace {
            channels: ChannelRegistry::new(),
            store: TraceStore::new(),
            timeline: Timeline::new(),
            status: StatusLog::new(),
            ring: Arc::new(PacketRing::new()),
            decoder: ItmDecoder::new(),
            ctf: None,
            hooks,
            reader: None,
        }
    }

    /// Registers the external CTF decoder. Channels it reports as active
    /// bypass the plain-text coalescing from then on.
    pub fn set_ctf(&mut self, ctf: Box<dyn CtfStream>) {
        self.ctf = Some(ctf);
    }

    /// Opens the transport and spawns the reader thread. Exactly one
    /// transport can be live per context; the previous session must be
    /// [`close`](Trace::close)d first.
    pub fn start(&mut self, link: TraceLink) -> Result<(), InitError> {
        if self.reader.is_some() {
            return Err(InitError::InitFailed {
                location: transport::location::SESSION,
                source: TransportFault::Other("a trace session is already running"),
            });
        }
        let transport = Transport::open(link)?;
        let reader = Reader::spawn(transport, Arc::clone(&self.ring), Arc::clone(&self.hooks))?;
        self.reader = Some(reader);
        Ok(())
    }

    /// Stops the reader thread, releases the transport, and resets the
    /// ring and the decoder's stream state. Decoded lines, the timeline
    /// and the status log survive; clearing history is the UI's call.
    pub fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            if let Some(reason) = reader.take_exit_reason() {
                self.status
                    .push(StatusOrigin::Probe, CODE_TRANSPORT_CLOSED, reason);
            }
            reader.join();
        }
        self.ring.reset();
        self.decoder.reset();
    }

    /// Whether the reader thread is still running. `false` once the
    /// remote closed the stream or the transport failed.
    pub fn is_running(&self) -> bool {
        self.reader.as_ref().map(Reader::is_alive).unwrap_or(false)
    }

    /// Injects raw SWO bytes as if they had arrived from a transport,
    /// split into 64-byte frames. Used to replay captured streams; only
    /// valid while no reader thread is attached (the ring has a single
    /// producer). Returns `false` if frames were refused or dropped.
    pub fn feed(&mut self, bytes: &[u8], timestamp: f64) -> bool {
        if self.reader.is_some() {
            log::warn!("feed ignored: a transport reader owns the ring");
            return false;
        }
        let mut accepted = true;
        for chunk in bytes.chunks(FRAME_CAPACITY) {
            accepted &= self.ring.enqueue(chunk, timestamp);
        }
        accepted
    }

    /// Drains the ring in text mode and returns the number of trace
    /// lines created. With `enabled == false` the pending frames are
    /// consumed and discarded and the overflow counter is cleared, so a
    /// paused viewer does not accrue stale error counts.
    pub fn process_text(&mut self, enabled: bool) -> u32 {
        self.surface_reader_exit();
        let lines_before = self.store.len();
        while let Some(frame) = self.ring.dequeue() {
            if !enabled {
                continue;
            }
            let Trace {
                decoder,
                channels,
                store,
                status,
                ctf,
                ..
            } = self;
            let had_error = decoder.process_text_frame(&frame, &mut |channel, bytes, ts| {
                emit_text(channels, store, ctf, status, channel, bytes, ts);
            });
            if had_error {
                if let Some(ctf) = ctf.as_mut() {
                    ctf.reset();
                }
            }
        }
        if !enabled {
            self.ring.overflow_take();
        }
        (self.store.len() - lines_before) as u32
    }

    /// Drains the ring in profile mode: PC samples bump their bucket in
    /// `sample_map` (sized per [`sample_map_len`]), ITM overflow markers
    /// bump `overflow`. Returns the number of samples recorded. With
    /// `enabled == false` frames are consumed and discarded as in
    /// [`process_text`](Trace::process_text).
    pub fn process_profile(
        &mut self,
        enabled: bool,
        sample_map: &mut [u32],
        code_base: u32,
        code_top: u32,
        overflow: &mut u32,
    ) -> u32 {
        self.surface_reader_exit();
        let mut count = 0;
        while let Some(frame) = self.ring.dequeue() {
            if !enabled {
                continue;
            }
            count += self
                .decoder
                .process_profile_frame(&frame, sample_map, code_base, code_top, overflow);
        }
        if !enabled {
            self.ring.overflow_take();
        }
        count
    }

    /// Frames sitting in the ring, not yet decoded. A reader that exited
    /// leaves this draining towards zero.
    pub fn pending_frames(&self) -> usize {
        self.ring.len()
    }

    /// Frames dropped on ring overflow since the counter was last taken.
    pub fn overflow_count(&self) -> u32 {
        self.ring.overflow()
    }

    /// Returns and clears the overflow counter.
    pub fn take_overflow(&mut self) -> u32 {
        self.ring.overflow_take()
    }

    /// Packets dropped by the decoder (unrecognized header or word-size
    /// violation).
    pub fn packet_errors(&self) -> u32 {
        self.decoder.packet_errors()
    }

    /// The current stimulus data word size, in bytes.
    pub fn data_size(&self) -> u8 {
        self.decoder.data_size()
    }

    /// Configures the stimulus data word size; see
    /// [`ItmDecoder::set_data_size`].
    pub fn set_data_size(&mut self, size: u8, auto_grow: bool) -> bool {
        self.decoder.set_data_size(size, auto_grow)
    }

    /// Pushes the reason for an unsolicited reader exit into the status
    /// log, once.
    fn surface_reader_exit(&mut self) {
        if let Some(reader) = &self.reader {
            if let Some(reason) = reader.take_exit_reason() {
                self.status
                    .push(StatusOrigin::Probe, CODE_TRANSPORT_CLOSED, reason);
            }
        }
    }
}

impl Drop for Trace {
    fn drop(&mut self) {
        self.close();
    }
}

/// Routes one emitted stretch of stimulus payload: disabled channels are
/// dropped before anything is allocated, CTF-bound channels go through
/// the external decoder, everything else through the text coalescing
/// policy.
fn emit_text(
    channels: &ChannelRegistry,
    store: &mut TraceStore,
    ctf: &mut Option<Box<dyn CtfStream>>,
    status: &mut StatusLog,
    channel: u8,
    bytes: &[u8],
    timestamp: f64,
) {
    if !channels.is_enabled(channel) {
        return;
    }
    if let Some(ctf) = ctf {
        if ctf.stream_active(channel) {
            let produced = ctf.decode(bytes, channel);
            if produced < 0 {
                log::warn!("CTF decode failed on channel {}: {}", channel, produced);
                status.push(StatusOrigin::Ctf, produced, "CTF stream decode failed");
            }
            while let Some(message) = ctf.pop_message() {
                // sub-millisecond remote stamps mean "no timestamp"
                let ts = if message.timestamp > 0.001 {
                    message.timestamp
                } else {
                    timestamp
                };
                store.push_message(channel, &message.text, ts);
            }
            return;
        }
    }
    store.append_bytes(channel, bytes, timestamp);
}
