//! ITM packet decoding.
//!
//! The probe delivers the SWO stream in transport frames of up to 64
//! bytes, cut without regard for packet boundaries. The decoder walks
//! each frame byte-exactly per the ARMv7-M architecture reference manual,
//! Appendix D4: a stimulus header carries the channel in bits \[7:3\] and
//! a 1/2/4-byte payload size in bits \[2:0\]; `0x17` heads a 5-byte
//! periodic PC sample; `0x70` is the overflow marker. A packet cut off by
//! the end of a frame is parked in the carry cache and completed from the
//! next frame.
//!
//! Losing sync is survivable: an unrecognized header discards only the
//! remainder of the current frame, so corruption is bounded to one
//! 64-byte window and decode resumes cleanly on the next frame.

use bitmatch::bitmatch;

use crate::ring::PacketFrame;

/// Header of a periodic PC-sample packet (hardware source packet,
/// discriminator 2, 4-byte payload).
pub const PC_SAMPLE_HEADER: u8 = 0x17;

/// The ITM overflow marker.
pub const OVERFLOW_HEADER: u8 = 0x70;

const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// A packet cut off by a frame boundary, waiting for the rest of its
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Carry {
    Empty,
    Partial {
        header: u8,
        prefix: [u8; 4],
        prefix_len: u8,
    },
}

/// Classified ITM header byte. Only the packets this core consumes get
/// their own variant; everything else (sync, timestamps, the remaining
/// hardware source packets) is noise on an SWO stimulus stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Header {
    /// Stimulus packet: channel in bits \[7:3\], payload size from the
    /// size selector in bits \[1:0\].
    Stimulus { channel: u8, len: u8 },
    /// Periodic PC sample, 4-byte little-endian payload.
    PcSample,
    /// Overflow marker, no payload.
    Overflow,
    Invalid,
}

#[bitmatch]
fn classify(header: u8) -> Header {
    #[bitmatch]
    match header {
        "0001_0111" => Header::PcSample,
        "0111_0000" => Header::Overflow,
        "cccc_c0ss" => {
            // ss = 00 is a reserved size selector (Appendix D4.2.8,
            // Table D4-4)
            if s == 0 {
                Header::Invalid
            } else {
                Header::Stimulus {
                    channel: c,
                    len: if s == 3 { 4 } else { s },
                }
            }
        }
        "????_????" => Header::Invalid,
    }
}

fn channel_of(header: u8) -> u8 {
    (header >> 3) & 0x1F
}

fn payload_len(header: u8) -> u8 {
    match header & 0x03 {
        3 => 4,
        n => n,
    }
}

/// Converts a sampled address to its histogram bucket. Thumb instructions
/// are halfword-aligned, so the profile keeps one bucket per halfword
/// above `code_base`. `addr` must not be below `code_base`.
pub fn address_to_index(addr: u32, code_base: u32) -> usize {
    ((addr - code_base) / 2) as usize
}

/// Length a PC-sample histogram must have for the given code region: one
/// bucket per halfword plus the out-of-range sentinel bucket.
pub fn sample_map_len(code_base: u32, code_top: u32) -> usize {
    address_to_index(code_top, code_base) + 1
}

/// The stateful ITM decoder.
///
/// State spans frames: the carry cache holds a packet cut by a frame
/// boundary, and the data word size tracks the payload width the target
/// writes its stimulus words with (1, 2 or 4 bytes, optionally growing
/// automatically when a wider write shows up). Word size 1 renders
/// payloads as raw text; wider words render as space-separated uppercase
/// hex pairs.
#[derive(Debug)]
pub struct ItmDecoder {
    carry: Carry,
    data_size: u8,
    auto_grow: bool,
    packet_errors: u32,
    /// Payload accumulator for the frame being decoded.
    scratch: Vec<u8>,
}

impl Default for ItmDecoder {
    fn default() -> Self {
        ItmDecoder::new()
    }
}

impl ItmDecoder {
    pub fn new() -> ItmDecoder {
        ItmDecoder {
            carry: Carry::Empty,
            data_size: 1,
            auto_grow: true,
            packet_errors: 0,
            scratch: Vec::new(),
        }
    }

    /// The current stimulus payload width in bytes.
    pub fn data_size(&self) -> u8 {
        self.data_size
    }

    /// Sets the stimulus payload width (1, 2 or 4) and whether the
    /// decoder may grow it when a wider packet arrives. Other widths are
    /// rejected.
    pub fn set_data_size(&mut self, size: u8, auto_grow: bool) -> bool {
        match size {
            1 | 2 | 4 => {
                self.data_size = size;
                self.auto_grow = auto_grow;
                true
            }
            _ => false,
        }
    }

    /// Packets dropped because of an unrecognized header or a payload
    /// wider than the configured word size.
    pub fn packet_errors(&self) -> u32 {
        self.packet_errors
    }

    /// Drops the carry cache and zeroes the error counter. The word-size
    /// configuration survives; it is configuration, not stream state.
    pub fn reset(&mut self) {
        self.carry = Carry::Empty;
        self.packet_errors = 0;
        self.scratch.clear();
    }

    /// Appends payload bytes to the frame accumulator, rendered per the
    /// current word size. A failed buffer grow drops the bytes; trace is
    /// best-effort.
    fn push_payload(&mut self, payload: &[u8]) {
        if self.data_size == 1 {
            if self.scratch.try_reserve(payload.len()).is_err() {
                return;
            }
            self.scratch.extend_from_slice(payload);
            return;
        }
        for &byte in payload {
            let sep = if self.scratch.is_empty() { 0 } else { 1 };
            if self.scratch.try_reserve(2 + sep).is_err() {
                return;
            }
            if sep != 0 {
                self.scratch.push(b' ');
            }
            self.scratch.push(HEX[(byte >> 4) as usize]);
            self.scratch.push(HEX[(byte & 0x0F) as usize]);
        }
    }

    /// Grows the data word size for a `len`-byte payload, or reports a
    /// packet error if the payload is wider than configured and growing
    /// is not allowed.
    fn apply_data_size(&mut self, len: u8) -> bool {
        if len > self.data_size {
            if !self.auto_grow {
                return false;
            }
            self.data_size = len;
        }
        true
    }

    fn stash(&mut self, header: u8, payload_prefix: &[u8]) {
        let mut prefix = [0; 4];
        prefix[..payload_prefix.len()].copy_from_slice(payload_prefix);
        self.carry = Carry::Partial {
            header,
            prefix,
            prefix_len: payload_prefix.len() as u8,
        };
    }

    /// Extends a parked packet with the whole (too short) frame.
    fn extend_stash(&mut self, header: u8, prefix: [u8; 4], prefix_len: u8, data: &[u8]) {
        let mut prefix = prefix;
        let have = prefix_len as usize;
        prefix[have..have + data.len()].copy_from_slice(data);
        self.carry = Carry::Partial {
            header,
            prefix,
            prefix_len: (have + data.len()) as u8,
        };
    }

    /// Decodes one frame in text mode, handing each completed stretch of
    /// payload to `emit` as `(channel, bytes, timestamp)`. PC samples are
    /// consumed and discarded. Returns whether the frame tripped a packet
    /// error (the caller then resets any CTF decode state).
    pub fn process_text_frame(
        &mut self,
        frame: &PacketFrame,
        emit: &mut dyn FnMut(u8, &[u8], f64),
    ) -> bool {
        let data = frame.data();
        let ts = frame.timestamp;
        let mut channel = None;
        let mut pos = 0;
        self.scratch.clear();

        // complete a packet parked at the previous frame's end
        if let Carry::Partial {
            header,
            prefix,
            prefix_len,
        } = self.carry
        {
            let have = prefix_len as usize;
            if header == PC_SAMPLE_HEADER {
                // a PC sample parked by profile mode; discard it here
                let want = 4 - have;
                if data.len() < want {
                    self.extend_stash(header, prefix, prefix_len, data);
                    return false;
                }
                self.carry = Carry::Empty;
                pos = want;
            } else {
                let len = payload_len(header);
                if !self.apply_data_size(len) {
                    self.carry = Carry::Empty;
                    self.packet_errors += 1;
                    log::debug!(
                        "stimulus payload of {} bytes exceeds word size {}; frame dropped",
                        len,
                        self.data_size
                    );
                    return true;
                }
                let want = len as usize - have;
                if data.len() < want {
                    self.extend_stash(header, prefix, prefix_len, data);
                    return false;
                }
                self.carry = Carry::Empty;
                self.push_payload(&prefix[..have]);
                self.push_payload(&data[..want]);
                channel = Some(channel_of(header));
                pos = want;
            }
        }

        while pos < data.len() {
            let header = data[pos];
            let remaining = data.len() - pos;
            match classify(header) {
                Header::PcSample if remaining >= 5 => {
                    pos += 5;
                }
                Header::Stimulus {
                    channel: new_channel,
                    len,
                } => {
                    if channel != Some(new_channel) {
                        if let Some(channel) = channel {
                            if !self.scratch.is_empty() {
                                emit(channel, &self.scratch, ts);
                                self.scratch.clear();
                            }
                        }
                        channel = Some(new_channel);
                    }
                    if remaining < len as usize + 1 {
                        self.stash(header, &data[pos + 1..]);
                        break;
                    }
                    if !self.apply_data_size(len) {
                        self.flush(channel, ts, emit);
                        self.packet_errors += 1;
                        return true;
                    }
                    self.push_payload(&data[pos + 1..pos + 1 + len as usize]);
                    pos += len as usize + 1;
                }
                // a truncated PC sample and every header this core does
                // not parse in text mode (overflow included) desyncs the
                // frame
                _ => {
                    self.flush(channel, ts, emit);
                    self.packet_errors += 1;
                    log::debug!("invalid ITM header {:#04x}; rest of frame dropped", header);
                    return true;
                }
            }
        }

        self.flush(channel, ts, emit);
        false
    }

    /// Emits the accumulated payload, if any.
    fn flush(&mut self, channel: Option<u8>, ts: f64, emit: &mut dyn FnMut(u8, &[u8], f64)) {
        if let Some(channel) = channel {
            if !self.scratch.is_empty() {
                emit(channel, &self.scratch, ts);
            }
        }
        self.scratch.clear();
    }

    /// Decodes one frame in profile mode: PC samples inside
    /// `code_base..code_top` bump their halfword bucket in `sample_map`,
    /// out-of-range samples bump the sentinel bucket, overflow markers
    /// bump `overflow`. Stimulus packets are skipped (but still subject
    /// to the word-size policy and the carry cache). Returns the number
    /// of samples recorded.
    pub fn process_profile_frame(
        &mut self,
        frame: &PacketFrame,
        sample_map: &mut [u32],
        code_base: u32,
        code_top: u32,
        overflow: &mut u32,
    ) -> u32 {
        let data = frame.data();
        let mut count = 0;
        let mut pos = 0;

        if let Carry::Partial {
            header,
            prefix,
            prefix_len,
        } = self.carry
        {
            let have = prefix_len as usize;
            if header == PC_SAMPLE_HEADER {
                let want = 4 - have;
                if data.len() < want {
                    self.extend_stash(header, prefix, prefix_len, data);
                    return 0;
                }
                self.carry = Carry::Empty;
                let mut pc = [0; 4];
                pc[..have].copy_from_slice(&prefix[..have]);
                pc[have..].copy_from_slice(&data[..want]);
                bucket(sample_map, u32::from_le_bytes(pc), code_base, code_top);
                count += 1;
                pos = want;
            } else {
                let len = payload_len(header);
                if !self.apply_data_size(len) {
                    self.carry = Carry::Empty;
                    self.packet_errors += 1;
                    return 0;
                }
                let want = len as usize - have;
                if data.len() < want {
                    self.extend_stash(header, prefix, prefix_len, data);
                    return 0;
                }
                self.carry = Carry::Empty;
                pos = want;
            }
        }

        while pos < data.len() {
            let header = data[pos];
            let remaining = data.len() - pos;
            match classify(header) {
                Header::PcSample => {
                    if remaining < 5 {
                        self.stash(header, &data[pos + 1..]);
                        break;
                    }
                    let pc = u32::from_le_bytes([
                        data[pos + 1],
                        data[pos + 2],
                        data[pos + 3],
                        data[pos + 4],
                    ]);
                    bucket(sample_map, pc, code_base, code_top);
                    count += 1;
                    pos += 5;
                }
                Header::Overflow => {
                    *overflow += 1;
                    pos += 1;
                }
                Header::Stimulus { len, .. } => {
                    if remaining < len as usize + 1 {
                        self.stash(header, &data[pos + 1..]);
                        break;
                    }
                    if !self.apply_data_size(len) {
                        self.packet_errors += 1;
                        break;
                    }
                    pos += len as usize + 1;
                }
                Header::Invalid => {
                    self.packet_errors += 1;
                    log::debug!("invalid ITM header {:#04x}; rest of frame dropped", header);
                    break;
                }
            }
        }

        count
    }
}

fn bucket(sample_map: &mut [u32], pc: u32, code_base: u32, code_top: u32) {
    let index = if pc < code_base || pc >= code_top {
        address_to_index(code_top, code_base)
    } else {
        address_to_index(pc, code_base)
    };
    if let Some(slot) = sample_map.get_mut(index) {
        *slot += 1;
    } else {
        log::debug!("sample map too small for bucket {}", index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: &[u8], ts: f64) -> PacketFrame {
        PacketFrame::new(data, ts)
    }

    fn decode_text(decoder: &mut ItmDecoder, data: &[u8], ts: f64) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        decoder.process_text_frame(&frame(data, ts), &mut |ch, bytes, _| {
            out.push((ch, bytes.to_vec()));
        });
        out
    }

    #[test]
    fn header_classification() {
        assert_eq!(classify(0x17), Header::PcSample);
        assert_eq!(classify(0x70), Header::Overflow);
        assert_eq!(classify(0x01), Header::Stimulus { channel: 0, len: 1 });
        assert_eq!(classify(0x0A), Header::Stimulus { channel: 1, len: 2 });
        assert_eq!(
            classify(0xFB),
            Header::Stimulus {
                channel: 31,
                len: 4
            }
        );
        // reserved size selector, hardware source packets, sync
        assert_eq!(classify(0x08), Header::Invalid);
        assert_eq!(classify(0x05), Header::Invalid);
        assert_eq!(classify(0x00), Header::Invalid);
        assert_eq!(classify(0xFF), Header::Invalid);
    }

    #[test]
    fn single_frame_text() {
        let mut decoder = ItmDecoder::new();
        let out = decode_text(&mut decoder, &[0x01, b'H', 0x01, b'i'], 1.0);
        assert_eq!(out, vec![(0, b"Hi".to_vec())]);
        assert_eq!(decoder.packet_errors(), 0);
    }

    #[test]
    fn channel_switch_emits_separately() {
        let mut decoder = ItmDecoder::new();
        // channel 0 then channel 1 (header 0b00001_001 = 0x09)
        let out = decode_text(&mut decoder, &[0x01, b'a', 0x09, b'b'], 1.0);
        assert_eq!(out, vec![(0, b"a".to_vec()), (1, b"b".to_vec())]);
    }

    #[test]
    fn carry_spans_frames() {
        let mut decoder = ItmDecoder::new();
        // 4-byte packet split after two payload bytes
        let first = decode_text(&mut decoder, &[0x03, 0x11, 0x22], 1.0);
        assert!(first.is_empty());
        let second = decode_text(&mut decoder, &[0x33, 0x44], 1.01);
        assert_eq!(second, vec![(0, b"11 22 33 44".to_vec())]);
        assert_eq!(decoder.carry, Carry::Empty);
    }

    #[test]
    fn carry_survives_tiny_frames() {
        let mut decoder = ItmDecoder::new();
        assert!(decode_text(&mut decoder, &[0x03, 0xAA], 1.0).is_empty());
        assert!(decode_text(&mut decoder, &[0xBB], 1.0).is_empty());
        assert!(decode_text(&mut decoder, &[0xCC], 1.0).is_empty());
        let out = decode_text(&mut decoder, &[0xDD], 1.0);
        assert_eq!(out, vec![(0, b"AA BB CC DD".to_vec())]);
    }

    #[test]
    fn auto_grow_widens_word_size() {
        let mut decoder = ItmDecoder::new();
        assert_eq!(decoder.data_size(), 1);
        let out = decode_text(&mut decoder, &[0x03, 0xDE, 0xAD, 0xBE, 0xEF], 1.0);
        assert_eq!(decoder.data_size(), 4);
        assert_eq!(out, vec![(0, b"DE AD BE EF".to_vec())]);
    }

    #[test]
    fn fixed_word_size_rejects_wider_packets() {
        let mut decoder = ItmDecoder::new();
        assert!(decoder.set_data_size(1, false));
        let mut emitted = Vec::new();
        let saw_error = decoder.process_text_frame(
            &frame(&[0x02, 0x11, 0x22, 0x01, b'x'], 1.0),
            &mut |ch, bytes, _| emitted.push((ch, bytes.to_vec())),
        );
        assert!(saw_error);
        assert_eq!(decoder.packet_errors(), 1);
        // the rest of the frame is dropped
        assert!(emitted.is_empty());
        assert_eq!(decoder.data_size(), 1);
    }

    #[test]
    fn invalid_header_drops_rest_of_frame() {
        let mut decoder = ItmDecoder::new();
        let out = decode_text(&mut decoder, &[0x01, b'a', 0xFF, 0x01, b'b'], 1.0);
        // accumulated output survives, the rest of the frame does not
        assert_eq!(out, vec![(0, b"a".to_vec())]);
        assert_eq!(decoder.packet_errors(), 1);

        // the next frame decodes cleanly
        let out = decode_text(&mut decoder, &[0x01, b'c'], 1.1);
        assert_eq!(out, vec![(0, b"c".to_vec())]);
        assert_eq!(decoder.packet_errors(), 1);
    }

    #[test]
    fn pc_samples_are_skipped_in_text_mode() {
        let mut decoder = ItmDecoder::new();
        let out = decode_text(
            &mut decoder,
            &[0x17, 0x00, 0x10, 0x00, 0x20, 0x01, b'x'],
            1.0,
        );
        assert_eq!(out, vec![(0, b"x".to_vec())]);
        assert_eq!(decoder.packet_errors(), 0);
    }

    #[test]
    fn profile_buckets_samples() {
        let mut decoder = ItmDecoder::new();
        let mut map = vec![0u32; sample_map_len(0x2000_1000, 0x2000_2000)];
        let mut overflow = 0;
        let count = decoder.process_profile_frame(
            &frame(&[0x17, 0x00, 0x10, 0x00, 0x20], 1.0),
            &mut map,
            0x2000_1000,
            0x2000_2000,
            &mut overflow,
        );
        assert_eq!(count, 1);
        assert_eq!(map[0], 1);
        assert_eq!(overflow, 0);
    }

    #[test]
    fn profile_out_of_range_hits_sentinel() {
        let mut decoder = ItmDecoder::new();
        let base = 0x2000_1000;
        let top = 0x2000_2000;
        let mut map = vec![0u32; sample_map_len(base, top)];
        let mut overflow = 0;
        // pc = 0x10000000, below code_base
        decoder.process_profile_frame(
            &frame(&[0x17, 0x00, 0x00, 0x00, 0x10], 1.0),
            &mut map,
            base,
            top,
            &mut overflow,
        );
        assert_eq!(map[address_to_index(top, base)], 1);
    }

    #[test]
    fn profile_counts_overflow_markers() {
        let mut decoder = ItmDecoder::new();
        let mut map = vec![0u32; 16];
        let mut overflow = 0;
        let count = decoder.process_profile_frame(
            &frame(&[0x70, 0x70, 0x01, b'x'], 1.0),
            &mut map,
            0,
            16,
            &mut overflow,
        );
        assert_eq!(count, 0);
        assert_eq!(overflow, 2);
        assert_eq!(decoder.packet_errors(), 0);
    }

    #[test]
    fn profile_carry_completes_sample() {
        let mut decoder = ItmDecoder::new();
        let base = 0x2000_1000;
        let top = 0x2000_2000;
        let mut map = vec![0u32; sample_map_len(base, top)];
        let mut overflow = 0;

        let count = decoder.process_profile_frame(
            &frame(&[0x17, 0x02, 0x10], 1.0),
            &mut map,
            base,
            top,
            &mut overflow,
        );
        assert_eq!(count, 0);
        let count = decoder.process_profile_frame(
            &frame(&[0x00, 0x20], 1.01),
            &mut map,
            base,
            top,
            &mut overflow,
        );
        assert_eq!(count, 1);
        // pc = 0x20001002 -> bucket 1
        assert_eq!(map[1], 1);
    }

    #[test]
    fn reset_clears_stream_state_but_not_config() {
        let mut decoder = ItmDecoder::new();
        decoder.set_data_size(4, false);
        decode_text(&mut decoder, &[0xFF], 1.0);
        decode_text(&mut decoder, &[0x03, 0x01], 1.0);
        assert_eq!(decoder.packet_errors(), 1);
        assert_ne!(decoder.carry, Carry::Empty);

        decoder.reset();
        assert_eq!(decoder.packet_errors(), 0);
        assert_eq!(decoder.carry, Carry::Empty);
        assert_eq!(decoder.data_size(), 4);
    }
}
