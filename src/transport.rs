//! Trace transports and the capture reader thread.
//!
//! The probe delivers SWO data either on a USB bulk IN endpoint or,
//! forwarded by a trace server, over a plain TCP stream. A dedicated
//! thread blocks on the transport, stamps every successful read with the
//! capture clock, pushes it into the packet ring and wakes the UI.
//!
//! Cancellation is cooperative: every blocking read carries a timeout, a
//! stop flag is polled between reads, and [`Trace::close`](crate::Trace::close)
//! joins the thread. Worst case the thread lingers for one read timeout
//! plus one backoff sleep, well under a second.

use std::io::{self, Read};
use std::net::{SocketAddr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{InitError, TransportFault};
use crate::ring::{PacketRing, FRAME_CAPACITY};

/// Acquisition-step tags carried by [`InitError`], for diagnostics.
pub mod location {
    /// Opening the USB device.
    pub const USB_OPEN: u8 = 1;
    /// Detaching a kernel driver from the trace interface.
    pub const USB_DETACH: u8 = 2;
    /// Claiming the trace interface.
    pub const USB_CLAIM: u8 = 3;
    /// Validating the bulk IN endpoint address.
    pub const USB_ENDPOINT: u8 = 4;
    /// Clearing a halted bulk IN endpoint.
    pub const USB_CLEAR_HALT: u8 = 5;
    /// Connecting the TCP stream.
    pub const TCP_CONNECT: u8 = 6;
    /// Configuring the TCP stream (read timeout).
    pub const TCP_CONFIG: u8 = 7;
    /// Spawning the reader thread.
    pub const THREAD_SPAWN: u8 = 8;
    /// Session-level checks before any transport is touched.
    pub const SESSION: u8 = 9;
}

/// Timeout on every blocking transport read; bounds how long `close` can
/// stall on a quiet stream.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Backoff after a short or timed-out USB read.
const SHORT_READ_BACKOFF: Duration = Duration::from_millis(50);

/// Callbacks the GUI collaborator provides to the capture pipeline. The
/// implementor carries whatever application handle it needs; both hooks
/// are called from the reader thread.
pub trait TraceHooks: Send + Sync {
    /// Rouses the UI after frames have been enqueued and when the reader
    /// exits. The default does nothing, which suits polling consumers.
    fn wake(&self) {}

    /// The capture clock: monotonic seconds with at least millisecond
    /// precision. Frame timestamps come from this clock.
    fn mono_clock(&self) -> f64;
}

/// Default hooks: no wake notification, timestamps from a process-local
/// monotonic clock.
pub struct SystemHooks {
    epoch: Instant,
}

impl SystemHooks {
    pub fn new() -> SystemHooks {
        SystemHooks {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemHooks {
    fn default() -> Self {
        SystemHooks::new()
    }
}

impl TraceHooks for SystemHooks {
    fn mono_clock(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

/// Where the raw SWO stream comes from.
pub enum TraceLink {
    /// A bulk IN endpoint on an already-located probe. Device discovery
    /// (VID/PID matching, hotplug) is the caller's job; the link carries
    /// the device it found.
    Usb {
        device: rusb::Device<rusb::GlobalContext>,
        /// Interface number the endpoint belongs to.
        interface: u8,
        /// Bulk IN endpoint address (direction bit set, e.g. `0x85`).
        endpoint: u8,
    },
    /// An SWO byte stream forwarded over TCP.
    Tcp(SocketAddrV4),
}

/// An open transport, owned by the reader thread.
pub(crate) enum Transport {
    Usb {
        handle: rusb::DeviceHandle<rusb::GlobalContext>,
        interface: u8,
        endpoint: u8,
    },
    Tcp(TcpStream),
}

/// What one transport read produced.
enum ReadOutcome {
    Data(usize),
    /// Nothing arrived; poll again immediately.
    Retry,
    /// Nothing arrived; back off before polling again.
    RetryBackoff,
    Eof,
    Fatal(String),
}

impl Transport {
    /// Acquires the transport described by `link`. Every failure carries
    /// the acquisition step it happened at.
    pub fn open(link: TraceLink) -> Result<Transport, InitError> {
        match link {
            TraceLink::Usb {
                device,
                interface,
                endpoint,
            } => Transport::open_usb(device, interface, endpoint),
            TraceLink::Tcp(addr) => Transport::open_tcp(addr),
        }
    }

    fn open_usb(
        device: rusb::Device<rusb::GlobalContext>,
        interface: u8,
        endpoint: u8,
    ) -> Result<Transport, InitError> {
        if endpoint & 0x80 == 0 {
            return Err(InitError::NoPipe {
                location: location::USB_ENDPOINT,
                source: TransportFault::Other("endpoint is not an IN endpoint"),
            });
        }

        let mut handle = device.open().map_err(|e| match e {
            rusb::Error::Access => InitError::NoAccess {
                location: location::USB_OPEN,
                source: e.into(),
            },
            rusb::Error::NoDevice | rusb::Error::NotFound => InitError::NoDevPath {
                location: location::USB_OPEN,
                source: e.into(),
            },
            e => InitError::InitFailed {
                location: location::USB_OPEN,
                source: e.into(),
            },
        })?;

        // not supported on all platforms; whether it mattered is decided
        // by the claim below
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            if e != rusb::Error::NotSupported {
                log::debug!("kernel driver auto-detach unavailable: {}", e);
            }
        }

        handle
            .claim_interface(interface)
            .map_err(|e| InitError::NoInterface {
                location: location::USB_CLAIM,
                source: e.into(),
            })?;

        if let Err(e) = handle.clear_halt(endpoint) {
            // a probe that was never halted reports Pipe/NotFound here;
            // only a vanished device is fatal
            if e == rusb::Error::NoDevice {
                return Err(InitError::NoPipe {
                    location: location::USB_CLEAR_HALT,
                    source: e.into(),
                });
            }
            log::debug!("clear_halt on {:#04x}: {}", endpoint, e);
        }

        Ok(Transport::Usb {
            handle,
            interface,
            endpoint,
        })
    }

    fn open_tcp(addr: SocketAddrV4) -> Result<Transport, InitError> {
        let stream = TcpStream::connect_timeout(&SocketAddr::V4(addr), Duration::from_secs(2))
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied | io::ErrorKind::ConnectionRefused => {
                    InitError::NoAccess {
                        location: location::TCP_CONNECT,
                        source: e.into(),
                    }
                }
                io::ErrorKind::AddrNotAvailable | io::ErrorKind::NotFound => {
                    InitError::NoDevPath {
                        location: location::TCP_CONNECT,
                        source: e.into(),
                    }
                }
                _ => InitError::InitFailed {
                    location: location::TCP_CONNECT,
                    source: e.into(),
                },
            })?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| InitError::InitFailed {
                location: location::TCP_CONFIG,
                source: e.into(),
            })?;
        Ok(Transport::Tcp(stream))
    }

    fn read_frame(&mut self, buf: &mut [u8; FRAME_CAPACITY]) -> ReadOutcome {
        match self {
            Transport::Usb {
                handle, endpoint, ..
            } => match handle.read_bulk(*endpoint, buf, READ_TIMEOUT) {
                Ok(0) => ReadOutcome::RetryBackoff,
                Ok(n) => ReadOutcome::Data(n),
                Err(rusb::Error::Timeout) => ReadOutcome::RetryBackoff,
                Err(rusb::Error::Interrupted) => ReadOutcome::Retry,
                Err(e) => ReadOutcome::Fatal(format!("usb bulk read failed: {}", e)),
            },
            Transport::Tcp(stream) => match stream.read(buf) {
                Ok(0) => ReadOutcome::Eof,
                Ok(n) => ReadOutcome::Data(n),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    ReadOutcome::Retry
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::Retry,
                Err(e) => ReadOutcome::Fatal(format!("tcp read failed: {}", e)),
            },
        }
    }

    fn release(&mut self) {
        if let Transport::Usb {
            handle, interface, ..
        } = self
        {
            let _ = handle.release_interface(*interface);
        }
    }
}

/// Handle to a running reader thread.
pub(crate) struct Reader {
    thread: thread::JoinHandle<()>,
    stop: Arc<AtomicBool>,
    exit_reason: Arc<Mutex<Option<String>>>,
}

impl Reader {
    /// Spawns the reader thread over an open transport.
    pub fn spawn(
        mut transport: Transport,
        ring: Arc<PacketRing>,
        hooks: Arc<dyn TraceHooks>,
    ) -> Result<Reader, InitError> {
        let stop = Arc::new(AtomicBool::new(false));
        let exit_reason = Arc::new(Mutex::new(None));

        let thread = {
            let stop = Arc::clone(&stop);
            let exit_reason = Arc::clone(&exit_reason);
            thread::Builder::new()
                .name("swo-reader".into())
                .spawn(move || {
                    run(&mut transport, &ring, &*hooks, &stop, &exit_reason);
                    transport.release();
                })
                .map_err(|e| InitError::NoThread {
                    location: location::THREAD_SPAWN,
                    source: e.into(),
                })?
        };

        Ok(Reader {
            thread,
            stop,
            exit_reason,
        })
    }

    pub fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Takes the reason the thread exited on its own, if it has.
    pub fn take_exit_reason(&self) -> Option<String> {
        self.exit_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Requests a stop and joins the thread.
    pub fn join(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.thread.join().is_err() {
            log::warn!("trace reader thread panicked");
        }
    }
}

fn run(
    transport: &mut Transport,
    ring: &PacketRing,
    hooks: &dyn TraceHooks,
    stop: &AtomicBool,
    exit_reason: &Mutex<Option<String>>,
) {
    let mut buf = [0u8; FRAME_CAPACITY];
    log::debug!("trace reader running");
    while !stop.load(Ordering::Relaxed) {
        match transport.read_frame(&mut buf) {
            ReadOutcome::Data(n) => {
                if !ring.enqueue(&buf[..n], hooks.mono_clock()) {
                    log::trace!("packet ring full, frame dropped");
                }
                hooks.wake();
            }
            ReadOutcome::Retry => {}
            ReadOutcome::RetryBackoff => thread::sleep(SHORT_READ_BACKOFF),
            ReadOutcome::Eof => {
                log::info!("trace stream closed by remote");
                *exit_reason.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some("trace connection closed".into());
                break;
            }
            ReadOutcome::Fatal(reason) => {
                log::warn!("trace reader exiting: {}", reason);
                *exit_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
                break;
            }
        }
    }
    // rouse the UI one last time so it notices the exit
    hooks.wake();
    log::debug!("trace reader stopped");
}
