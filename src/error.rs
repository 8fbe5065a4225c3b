//! Session and transport errors.

use std::io;

/// The low-level fault underlying an [`InitError`].
#[derive(Debug, thiserror::Error)]
pub enum TransportFault {
    #[error("usb: {0}")]
    Usb(#[from] rusb::Error),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(&'static str),
}

impl TransportFault {
    /// The platform error code, where one exists: the raw OS errno for
    /// I/O faults, the libusb error code for USB faults.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            TransportFault::Io(e) => e.raw_os_error(),
            TransportFault::Usb(e) => Some(libusb_code(*e)),
            TransportFault::Other(_) => None,
        }
    }
}

/// Set of failures [`Trace::start`](crate::Trace::start) can report.
/// Every variant carries the acquisition step it failed at (a stable
/// location tag, see [`location`](crate::transport::location)) for
/// diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// The probe's trace interface could not be claimed.
    #[error("cannot claim the trace interface (step {location})")]
    NoInterface {
        location: u8,
        #[source]
        source: TransportFault,
    },

    /// No usable device or endpoint path.
    #[error("no path to the trace device (step {location})")]
    NoDevPath {
        location: u8,
        #[source]
        source: TransportFault,
    },

    /// The device or remote host refused access.
    #[error("access to the trace source denied (step {location})")]
    NoAccess {
        location: u8,
        #[source]
        source: TransportFault,
    },

    /// The bulk IN pipe could not be prepared.
    #[error("trace endpoint pipe unavailable (step {location})")]
    NoPipe {
        location: u8,
        #[source]
        source: TransportFault,
    },

    /// The reader thread could not be spawned.
    #[error("failed to start the trace reader thread (step {location})")]
    NoThread {
        location: u8,
        #[source]
        source: TransportFault,
    },

    /// Any other transport initialization failure.
    #[error("trace transport initialization failed (step {location})")]
    InitFailed {
        location: u8,
        #[source]
        source: TransportFault,
    },
}

impl InitError {
    /// Which acquisition step failed; tags are stable across releases.
    pub fn location(&self) -> u8 {
        match self {
            InitError::NoInterface { location, .. }
            | InitError::NoDevPath { location, .. }
            | InitError::NoAccess { location, .. }
            | InitError::NoPipe { location, .. }
            | InitError::NoThread { location, .. }
            | InitError::InitFailed { location, .. } => *location,
        }
    }

    /// The underlying platform error code, if any.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            InitError::NoInterface { source, .. }
            | InitError::NoDevPath { source, .. }
            | InitError::NoAccess { source, .. }
            | InitError::NoPipe { source, .. }
            | InitError::NoThread { source, .. }
            | InitError::InitFailed { source, .. } => source.os_error(),
        }
    }
}

/// Maps an rusb error back to its numeric libusb code.
fn libusb_code(error: rusb::Error) -> i32 {
    match error {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_and_code_are_extractable() {
        let err = InitError::NoAccess {
            location: 3,
            source: TransportFault::Usb(rusb::Error::Access),
        };
        assert_eq!(err.location(), 3);
        assert_eq!(err.os_error(), Some(-3));

        let err = InitError::InitFailed {
            location: 7,
            source: TransportFault::Other("already running"),
        };
        assert_eq!(err.location(), 7);
        assert_eq!(err.os_error(), None);
    }
}
