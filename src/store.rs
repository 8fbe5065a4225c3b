//! The decoded trace line store.
//!
//! Lines are kept in append order in a growable sequence; the last element
//! doubles as the coalescing tail that unsealed stimulus bytes are
//! appended to. A line is sealed by a CR/LF in the payload, by a channel
//! switch, by reaching the per-line length cap, or by a gap in arrival
//! time, and never grows afterwards.

use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::channel::ChannelRegistry;

/// Hard cap on a single line's text; longer output splits into
/// continuation lines.
pub const LINE_MAX: usize = 256;

/// Text buffer size a fresh line starts out with; grows by doubling up to
/// [`LINE_MAX`].
const LINE_INITIAL_CAPACITY: usize = 32;

/// Largest arrival-time gap, in seconds, that still counts as a
/// continuation of the tail line.
pub const CONTINUATION_TIMEOUT: f64 = 0.1;

/// One decoded trace line.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceLine {
    text: Vec<u8>,
    /// Stimulus channel the line arrived on.
    pub channel: u8,
    /// Capture timestamp of the first byte, in seconds.
    pub timestamp: f64,
    timefmt: String,
    sealed: bool,
}

impl TraceLine {
    /// The line's raw text bytes (no CR/LF, at most [`LINE_MAX`] bytes).
    pub fn text(&self) -> &[u8] {
        &self.text
    }

    /// The text decoded as UTF-8, with invalid sequences replaced.
    pub fn text_lossy(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.text)
    }

    /// Preformatted arrival time, in seconds relative to the first line
    /// of the capture.
    pub fn timefmt(&self) -> &str {
        &self.timefmt
    }

    /// Sealed lines never receive further bytes.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }
}

/// Append-only store of decoded [`TraceLine`]s.
#[derive(Debug, Default)]
pub struct TraceStore {
    lines: Vec<TraceLine>,
    /// Timestamp of the very first line; anchor for all relative times.
    anchor: Option<f64>,
}

impl TraceStore {
    pub fn new() -> TraceStore {
        TraceStore::default()
    }

    pub fn lines(&self) -> &[TraceLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Drops every line and the relative-time anchor.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.anchor = None;
    }

    /// Appends stimulus text for `channel`, applying the coalescing
    /// policy byte by byte:
    ///
    /// - CR or LF seals the tail line and is itself discarded (a CR/LF
    ///   with no line to seal is dropped);
    /// - a byte for a different channel than the tail's seals the tail;
    /// - a tail at [`LINE_MAX`] is sealed and the text continues on a new
    ///   line;
    /// - a byte arriving more than [`CONTINUATION_TIMEOUT`] after the
    ///   tail line started seals the tail.
    ///
    /// If growing a buffer fails the offending byte is dropped; if
    /// allocating a new line fails the byte is dropped as well. Trace is
    /// best-effort by nature, so neither is an error.
    pub(crate) fn append_bytes(&mut self, channel: u8, bytes: &[u8], timestamp: f64) {
        for &byte in bytes {
            if byte == b'\r' || byte == b'\n' {
                if let Some(tail) = self.lines.last_mut() {
                    if !tail.text.is_empty() {
                        tail.sealed = true;
                    }
                }
                continue;
            }

            let need_new = match self.lines.last_mut() {
                None => true,
                Some(tail) => {
                    if !tail.sealed
                        && (tail.channel != channel
                            || tail.text.len() >= LINE_MAX
                            || timestamp - tail.timestamp > CONTINUATION_TIMEOUT)
                    {
                        tail.sealed = true;
                    }
                    tail.sealed
                }
            };
            if need_new && !self.push_line(channel, timestamp) {
                continue;
            }
            if let Some(tail) = self.lines.last_mut() {
                if tail.text.try_reserve(1).is_err() {
                    continue;
                }
                tail.text.push(byte);
            }
        }
    }

    /// Appends one complete (sealed) line, as produced by the CTF
    /// decoder. The relative time is formatted with microsecond
    /// precision, as CTF streams carry sub-millisecond timestamps.
    pub(crate) fn push_message(&mut self, channel: u8, text: &str, timestamp: f64) {
        if self.lines.try_reserve(1).is_err() {
            return;
        }
        let anchor = *self.anchor.get_or_insert(timestamp);
        let mut buf = Vec::new();
        if buf.try_reserve_exact(text.len()).is_err() {
            return;
        }
        buf.extend_from_slice(text.as_bytes());
        self.lines.push(TraceLine {
            text: buf,
            channel,
            timestamp,
            timefmt: format!("{:.6}", timestamp - anchor),
            sealed: true,
        });
    }

    fn push_line(&mut self, channel: u8, timestamp: f64) -> bool {
        if self.lines.try_reserve(1).is_err() {
            return false;
        }
        let mut text = Vec::new();
        if text.try_reserve_exact(LINE_INITIAL_CAPACITY).is_err() {
            return false;
        }
        let anchor = *self.anchor.get_or_insert(timestamp);
        self.lines.push(TraceLine {
            text,
            channel,
            timestamp,
            timefmt: format!("{:.3}", timestamp - anchor),
            sealed: false,
        });
        true
    }

    /// Case-insensitive substring search, starting at `start` and
    /// wrapping around the list once. Every line is visited exactly one
    /// time; `None` means no line matches.
    pub fn find(&self, text: &str, start: usize) -> Option<usize> {
        if self.lines.is_empty() {
            return None;
        }
        let needle = text.to_lowercase();
        let start = start % self.lines.len();
        for offset in 0..self.lines.len() {
            let index = (start + offset) % self.lines.len();
            if self.lines[index]
                .text_lossy()
                .to_lowercase()
                .contains(&needle)
            {
                return Some(index);
            }
        }
        None
    }

    /// Index of the last line whose timestamp lies strictly before
    /// `timestamp` (the line a timeline position maps onto). Returns the
    /// first line when every timestamp is at or past `timestamp`, and
    /// `None` only for an empty store.
    pub fn find_timestamp(&self, timestamp: f64) -> Option<usize> {
        if self.lines.is_empty() {
            return None;
        }
        let mut found = 0;
        for (index, line) in self.lines.iter().enumerate() {
            if line.timestamp < timestamp {
                found = index;
            } else {
                break;
            }
        }
        Some(found)
    }

    /// Writes the whole store as CSV: a `Number,Name,Timestamp,Text`
    /// header, then one row per line with the channel number, the
    /// channel's display name, the arrival time in seconds relative to
    /// the first line, and the text. Quoted fields use RFC 4180 quoting
    /// (embedded `"` doubled).
    pub fn save(&self, path: impl AsRef<Path>, channels: &ChannelRegistry) -> io::Result<()> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        writeln!(out, "Number,Name,Timestamp,Text")?;
        let anchor = self.anchor.unwrap_or(0.0);
        for line in &self.lines {
            writeln!(
                out,
                "{},\"{}\",{:.6},\"{}\"",
                line.channel,
                csv_quoted(channels.name(line.channel)),
                line.timestamp - anchor,
                csv_quoted(&line.text_lossy()),
            )?;
        }
        out.flush()
    }
}

fn csv_quoted(field: &str) -> String {
    field.replace('"', "\"\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newline_seals_and_is_discarded() {
        let mut store = TraceStore::new();
        store.append_bytes(0, b"Hi\n", 1.0);
        assert_eq!(store.len(), 1);
        let line = &store.lines()[0];
        assert_eq!(line.text(), b"Hi");
        assert!(line.is_sealed());
        assert_eq!(line.timefmt(), "0.000");
    }

    #[test]
    fn leading_newline_is_dropped() {
        let mut store = TraceStore::new();
        store.append_bytes(0, b"\n\rfoo", 1.0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lines()[0].text(), b"foo");
        assert!(!store.lines()[0].is_sealed());
    }

    #[test]
    fn channel_switch_seals() {
        let mut store = TraceStore::new();
        store.append_bytes(0, b"foo", 1.0);
        store.append_bytes(1, b"bar", 1.0);
        assert_eq!(store.len(), 2);
        assert!(store.lines()[0].is_sealed());
        assert_eq!(store.lines()[0].channel, 0);
        assert_eq!(store.lines()[1].channel, 1);
        assert!(!store.lines()[1].is_sealed());
    }

    #[test]
    fn continuation_window() {
        let mut store = TraceStore::new();
        store.append_bytes(0, b"foo", 1.0);
        store.append_bytes(0, b"bar", 1.05);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lines()[0].text(), b"foobar");

        let mut store = TraceStore::new();
        store.append_bytes(0, b"foo", 1.0);
        store.append_bytes(0, b"bar", 1.2);
        assert_eq!(store.len(), 2);
        assert!(store.lines()[0].is_sealed());
        assert_eq!(store.lines()[1].text(), b"bar");
    }

    #[test]
    fn long_lines_split() {
        let mut store = TraceStore::new();
        store.append_bytes(0, &[b'x'; 300], 1.0);
        assert_eq!(store.len(), 2);
        assert_eq!(store.lines()[0].text().len(), LINE_MAX);
        assert!(store.lines()[0].is_sealed());
        assert_eq!(store.lines()[1].text().len(), 44);
    }

    #[test]
    fn find_is_case_insensitive_and_wraps() {
        let mut store = TraceStore::new();
        store.append_bytes(0, b"alpha\n", 1.0);
        store.append_bytes(0, b"BETA\n", 1.2);
        store.append_bytes(0, b"gamma\n", 1.4);

        assert_eq!(store.find("beta", 0), Some(1));
        // wraps past the end back to the start
        assert_eq!(store.find("Alpha", 2), Some(0));
        assert_eq!(store.find("delta", 0), None);
        assert_eq!(TraceStore::new().find("x", 0), None);
    }

    #[test]
    fn find_timestamp_picks_last_earlier_line() {
        let mut store = TraceStore::new();
        store.append_bytes(0, b"a\n", 1.0);
        store.append_bytes(0, b"b\n", 2.0);
        store.append_bytes(0, b"c\n", 3.0);

        assert_eq!(store.find_timestamp(2.5), Some(1));
        assert_eq!(store.find_timestamp(10.0), Some(2));
        assert_eq!(store.find_timestamp(0.5), Some(0));
        assert_eq!(TraceStore::new().find_timestamp(1.0), None);
    }

    #[test]
    fn csv_export_quotes_fields() {
        let mut store = TraceStore::new();
        store.append_bytes(0, b"say \"hi\"\n", 1.0);
        store.append_bytes(0, b"plain\n", 1.25);

        let mut channels = ChannelRegistry::new();
        channels.set_name(0, Some("con\"sole"));

        let path = std::env::temp_dir().join("swotrace-csv-test.csv");
        store.save(&path, &channels).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let mut rows = text.lines();
        assert_eq!(rows.next(), Some("Number,Name,Timestamp,Text"));
        assert_eq!(
            rows.next(),
            Some("0,\"con\"\"sole\",0.000000,\"say \"\"hi\"\"\"")
        );
        assert_eq!(rows.next(), Some("0,\"con\"\"sole\",0.250000,\"plain\""));
    }

    #[test]
    fn clear_resets_anchor() {
        let mut store = TraceStore::new();
        store.append_bytes(0, b"a\n", 5.0);
        store.clear();
        assert!(store.is_empty());
        store.append_bytes(0, b"b\n", 7.0);
        assert_eq!(store.lines()[0].timefmt(), "0.000");
    }
}
