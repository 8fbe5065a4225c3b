//! Interface to the external CTF (Common Trace Format) decoder.
//!
//! Stimulus channels can carry a binary CTF stream instead of plain text.
//! The metadata-driven decoder that turns those bytes into structured
//! messages lives outside this crate; the core only needs the narrow
//! surface below. Implementations are registered on the trace context
//! with [`Trace::set_ctf`](crate::Trace::set_ctf).

/// A structured message produced by the CTF decoder.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CtfMessage {
    /// CTF stream id the message was decoded from.
    pub stream_id: u16,
    /// Remote (target-supplied) timestamp in seconds, or 0.0 when the
    /// stream carries none. Values at or below 1 ms are treated as "no
    /// timestamp" and replaced with the local capture time.
    pub timestamp: f64,
    /// Rendered message text.
    pub text: String,
}

/// The operations the decoding core consumes from the CTF collaborator.
pub trait CtfStream {
    /// Whether `channel` is bound to a CTF stream. Channels that are not
    /// bound get the plain-text coalescing treatment instead.
    fn stream_active(&self, channel: u8) -> bool {
        let _ = channel;
        false
    }

    /// Feeds stimulus payload bytes from `channel` into the decoder.
    /// Returns the number of messages made available, or a negative
    /// CTF-level error code. Errors are logged but do not disturb ITM
    /// decoding.
    fn decode(&mut self, bytes: &[u8], channel: u8) -> i32;

    /// Takes the oldest decoded message, if any.
    fn pop_message(&mut self) -> Option<CtfMessage>;

    /// Drops partial decode state. Called when the ITM layer loses packet
    /// sync, since the byte stream feeding the CTF decoder is then torn.
    fn reset(&mut self) {}
}
