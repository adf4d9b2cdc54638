//! # GNSS framing codec
//!
//! Byte-driven parser for the GNSS receiver's proprietary binary frames,
//! interleaved with plain NMEA-0183 text on the same UART. Frame shape:
//! `magic1 | magic2 | len(2 LE) | class(1) | id(1) | payload(len) | checksum(4 LE)`.
//!
//! Checksum = `((id<<24)+(class<<16)+len) + sum(payload as little-endian u32
//! words, payload length rounded down to a multiple of 4)`, wrapping modulo
//! 2^32 (CASIC-style).
//!
//! Bytes that never join a binary frame (the Idle-state fallthrough, and the
//! byte that breaks a tentative magic-byte match) are handed back to the
//! caller as [`FeedOutcome::Nmea`] for the surrounding NMEA parser.

use embassy_time::{Duration, Instant};
use heapless::Vec;

/// First magic byte of every binary frame.
pub const MAGIC1: u8 = 0xBA;
/// Second magic byte of every binary frame.
pub const MAGIC2: u8 = 0xCE;

/// `class`/`id` of an ACK frame (spec.md 3).
pub const ACK_CLASS: u8 = 0x05;
pub const ACK_ID: u8 = 0x01;
/// `class`/`id` of a NACK frame.
pub const NACK_CLASS: u8 = 0x05;
pub const NACK_ID: u8 = 0x00;

/// Internal reset reasons, surfaced for logging/tests only — per spec.md 7,
/// framing errors are never propagated to the state machine; a bad frame
/// simply never publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum FramingError {
    LenOverflow,
    ChecksumMismatch,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    H1,
    Len0,
    Len1,
    Class,
    Id,
    Payload,
    Csum0,
    Csum1,
    Csum2,
    Csum3,
}

/// A received (or about-to-be-emitted) binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<const N: usize> {
    pub class: u8,
    pub id: u8,
    pub payload: Vec<u8, N>,
}

impl<const N: usize> Frame<N> {
    pub fn is_ack(&self) -> bool {
        self.class == ACK_CLASS && self.id == ACK_ID
    }

    pub fn is_nack(&self) -> bool {
        self.class == NACK_CLASS && self.id == NACK_ID
    }
}

/// Result of feeding one byte to the parser.
#[derive(Debug)]
pub enum FeedOutcome<const N: usize> {
    /// Not part of a binary frame; forward it to the NMEA text parser.
    Nmea(u8),
    /// Consumed, no complete frame yet.
    Pending,
    /// A complete, checksum-valid frame.
    Frame(Frame<N>),
}

/// Runtime-tunable parser limits (spec.md 6: max payload size >= 256 B,
/// per-frame deadline >= 1 s).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FramingConfig {
    pub frame_timeout: Duration,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self { frame_timeout: Duration::from_secs(1) }
    }
}

/// Streaming parser. `N` is the maximum payload size the receiver's frames
/// can carry; it must be at least 256 per spec.md 4.3.
pub struct FrameParser<const N: usize> {
    state: State,
    config: FramingConfig,
    len: usize,
    class: u8,
    id: u8,
    payload: Vec<u8, N>,
    payload_remaining: usize,
    csum_bytes: [u8; 4],
    csum_idx: usize,
    last_advance: Instant,
    last_error: Option<FramingError>,
}

impl<const N: usize> FrameParser<N> {
    pub fn new(config: FramingConfig, now: Instant) -> Self {
        Self {
            state: State::Idle,
            config,
            len: 0,
            class: 0,
            id: 0,
            payload: Vec::new(),
            payload_remaining: 0,
            csum_bytes: [0; 4],
            csum_idx: 0,
            last_advance: now,
            last_error: None,
        }
    }

    /// The last internal reset reason, if any, consumed on read.
    pub fn take_error(&mut self) -> Option<FramingError> {
        self.last_error.take()
    }

    fn reset(&mut self, now: Instant, error: Option<FramingError>) {
        self.state = State::Idle;
        self.payload.clear();
        self.csum_idx = 0;
        self.last_advance = now;
        if error.is_some() {
            self.last_error = error;
        }
    }

    fn advance(&mut self, state: State, now: Instant) {
        self.state = state;
        self.last_advance = now;
    }

    /// Feed one byte, observing the current time for the per-frame deadline.
    pub fn feed(&mut self, byte: u8, now: Instant) -> FeedOutcome<N> {
        if self.state != State::Idle && now - self.last_advance >= self.config.frame_timeout {
            self.reset(now, Some(FramingError::Timeout));
        }

        match self.state {
            State::Idle => {
                if byte == MAGIC1 {
                    self.advance(State::H1, now);
                    FeedOutcome::Pending
                } else {
                    FeedOutcome::Nmea(byte)
                }
            }
            State::H1 => {
                if byte == MAGIC2 {
                    self.advance(State::Len0, now);
                    FeedOutcome::Pending
                } else if byte == MAGIC1 {
                    self.advance(State::H1, now);
                    FeedOutcome::Pending
                } else {
                    self.reset(now, None);
                    FeedOutcome::Nmea(byte)
                }
            }
            State::Len0 => {
                self.len = byte as usize;
                self.advance(State::Len1, now);
                FeedOutcome::Pending
            }
            State::Len1 => {
                self.len |= (byte as usize) << 8;
                if self.len > N {
                    self.reset(now, Some(FramingError::LenOverflow));
                    return FeedOutcome::Pending;
                }
                self.advance(State::Class, now);
                FeedOutcome::Pending
            }
            State::Class => {
                self.class = byte;
                self.advance(State::Id, now);
                FeedOutcome::Pending
            }
            State::Id => {
                self.id = byte;
                self.payload.clear();
                self.payload_remaining = self.len;
                if self.payload_remaining == 0 {
                    self.advance(State::Csum0, now);
                } else {
                    self.advance(State::Payload, now);
                }
                FeedOutcome::Pending
            }
            State::Payload => {
                let _ = self.payload.push(byte);
                self.payload_remaining -= 1;
                if self.payload_remaining == 0 {
                    self.advance(State::Csum0, now);
                } else {
                    self.last_advance = now;
                }
                FeedOutcome::Pending
            }
            State::Csum0 => {
                self.csum_bytes[0] = byte;
                self.advance(State::Csum1, now);
                FeedOutcome::Pending
            }
            State::Csum1 => {
                self.csum_bytes[1] = byte;
                self.advance(State::Csum2, now);
                FeedOutcome::Pending
            }
            State::Csum2 => {
                self.csum_bytes[2] = byte;
                self.advance(State::Csum3, now);
                FeedOutcome::Pending
            }
            State::Csum3 => {
                self.csum_bytes[3] = byte;
                let received = u32::from_le_bytes(self.csum_bytes);
                let computed = checksum(self.class, self.id, &self.payload);
                if received == computed {
                    let frame = Frame { class: self.class, id: self.id, payload: self.payload.clone() };
                    self.reset(now, None);
                    FeedOutcome::Frame(frame)
                } else {
                    self.reset(now, Some(FramingError::ChecksumMismatch));
                    FeedOutcome::Pending
                }
            }
        }
    }
}

/// Checksum over `class`/`id`/`payload` as described in spec.md 3.
pub fn checksum(class: u8, id: u8, payload: &[u8]) -> u32 {
    let len = payload.len() as u32;
    let mut sum = ((id as u32) << 24).wrapping_add((class as u32) << 16).wrapping_add(len);
    let whole_words = payload.len() / 4;
    for i in 0..whole_words {
        let word = u32::from_le_bytes(payload[i * 4..i * 4 + 4].try_into().unwrap());
        sum = sum.wrapping_add(word);
    }
    sum
}

/// Compose a frame into `out`, returning the number of bytes written.
pub fn emit(class: u8, id: u8, payload: &[u8], out: &mut [u8]) -> Option<usize> {
    let total = 2 + 2 + 1 + 1 + payload.len() + 4;
    if out.len() < total || payload.len() > u16::MAX as usize {
        return None;
    }
    out[0] = MAGIC1;
    out[1] = MAGIC2;
    out[2..4].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    out[4] = class;
    out[5] = id;
    out[6..6 + payload.len()].copy_from_slice(payload);
    let csum = checksum(class, id, payload);
    out[6 + payload.len()..total].copy_from_slice(&csum.to_le_bytes());
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_then_parse_round_trips() {
        let now = Instant::from_millis(0);
        let mut buf = [0u8; 32];
        let n = emit(0x08, 0x01, b"hello", &mut buf).unwrap();

        let mut parser: FrameParser<256> = FrameParser::new(FramingConfig::default(), now);
        let mut frame = None;
        for &b in &buf[..n] {
            if let FeedOutcome::Frame(f) = parser.feed(b, now) {
                frame = Some(f);
            }
        }
        let frame = frame.unwrap();
        assert_eq!(frame.class, 0x08);
        assert_eq!(frame.id, 0x01);
        assert_eq!(&frame.payload[..], b"hello");
    }

    #[test]
    fn ack_and_nack_predicates() {
        let ack: Frame<4> = Frame { class: ACK_CLASS, id: ACK_ID, payload: Vec::new() };
        let nack: Frame<4> = Frame { class: NACK_CLASS, id: NACK_ID, payload: Vec::new() };
        assert!(ack.is_ack());
        assert!(!ack.is_nack());
        assert!(nack.is_nack());
        assert!(!nack.is_ack());
    }

    #[test]
    fn non_magic_bytes_are_forwarded_as_nmea() {
        let now = Instant::from_millis(0);
        let mut parser: FrameParser<256> = FrameParser::new(FramingConfig::default(), now);
        match parser.feed(b'$', now) {
            FeedOutcome::Nmea(b) => assert_eq!(b, b'$'),
            _ => panic!("expected Nmea byte"),
        }
    }

    #[test]
    fn oversize_length_resets_to_idle() {
        let now = Instant::from_millis(0);
        let mut parser: FrameParser<16> = FrameParser::new(FramingConfig::default(), now);
        parser.feed(MAGIC1, now);
        parser.feed(MAGIC2, now);
        parser.feed(0xFF, now); // len lo
        parser.feed(0xFF, now); // len hi -> len = 65535 > 16
        assert_eq!(parser.take_error(), Some(FramingError::LenOverflow));
        // Parser is back in Idle and ready for the next magic byte.
        match parser.feed(b'G', now) {
            FeedOutcome::Nmea(b'G') => {}
            other => panic!("expected Nmea, got {other:?}"),
        }
    }

    #[test]
    fn checksum_mismatch_never_yields_a_frame() {
        let now = Instant::from_millis(0);
        let mut buf = [0u8; 32];
        let n = emit(0x08, 0x01, b"hello", &mut buf).unwrap();
        buf[n - 1] ^= 0xFF; // corrupt checksum

        let mut parser: FrameParser<256> = FrameParser::new(FramingConfig::default(), now);
        for &b in &buf[..n] {
            if let FeedOutcome::Frame(_) = parser.feed(b, now) {
                panic!("should not have parsed a frame with a bad checksum");
            }
        }
        assert_eq!(parser.take_error(), Some(FramingError::ChecksumMismatch));
    }

    #[test]
    fn timeout_resets_a_stalled_frame() {
        let t0 = Instant::from_millis(0);
        let config = FramingConfig { frame_timeout: Duration::from_secs(1) };
        let mut parser: FrameParser<256> = FrameParser::new(config, t0);
        parser.feed(MAGIC1, t0);
        let t1 = t0 + Duration::from_millis(1500);
        match parser.feed(MAGIC2, t1) {
            FeedOutcome::Nmea(_) | FeedOutcome::Pending => {}
            FeedOutcome::Frame(_) => panic!("timeout should have reset the parser"),
        }
        assert_eq!(parser.take_error(), Some(FramingError::Timeout));
    }
}
