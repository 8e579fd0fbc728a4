// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire frame encode/decode.
//!
//! `SOF(0x01) | ADDR | LEN_LE(u16) | CODE | PAYLOAD | CHKSUM_LE(u16) |
//! EOF(0x1A)`, where `LEN` counts everything from `ADDR` through `CHKSUM`
//! inclusive and `CHKSUM` is the arithmetic sum of those same bytes, mod
//! 2^16. Decode is a resumable byte-at-a-time state machine so it can sit
//! on top of an interrupt-fed receive ring without ever blocking.

#![cfg_attr(not(test), no_std)]

use arrayvec::ArrayVec;
use loader_time::{Clock, Timer};

pub const SOF: u8 = 0x01;
pub const EOF: u8 = 0x1A;
pub const MAX_LEN: u16 = 512;
pub const HEADER_AND_CHECKSUM_LEN: u16 = 6; // ADDR + LEN(2) + CODE + CHKSUM(2)
pub const MAX_PAYLOAD: usize = (MAX_LEN - HEADER_AND_CHECKSUM_LEN) as usize;

pub const INTER_CHARACTER_TIMEOUT_MS: u32 = 10;

/// A decoded (or about-to-be-encoded) frame. `code` carries the opcode on a
/// request and the status byte on a response; the wire doesn't distinguish
/// the two, only the direction does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub code: u8,
    pub payload: ArrayVec<u8, MAX_PAYLOAD>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    BadStart,
    LengthOutOfRange,
    InterCharTimeout,
    BadEnd,
    BadChecksum,
    BadAddress,
    OverallTimeout,
}

/// The result of feeding one byte (or one timeout tick) to a [`FrameDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    NeedMore,
    Done(Frame),
    Err(DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitSof,
    Address,
    LengthLow,
    LengthHigh,
    Code,
    Payload,
    ChecksumLow,
    ChecksumHigh,
    Eof,
}

/// Which slave addresses a frame may be addressed to.
#[derive(Debug, Clone, Copy)]
pub struct AddressFilter {
    pub primary: u8,
    pub alternate: u8,
    pub broadcast: Option<u8>,
}

impl AddressFilter {
    fn accepts(&self, addr: u8) -> bool {
        addr == self.primary || addr == self.alternate || self.broadcast == Some(addr)
    }
}

/// Resumable frame decoder. One instance is reset and reused for every
/// frame; it never allocates and never panics on malformed input.
pub struct FrameDecoder {
    state: State,
    address: u8,
    len: u16,
    remaining_payload: usize,
    code: u8,
    payload: ArrayVec<u8, MAX_PAYLOAD>,
    running_sum: u16,
    checksum_lo: u8,
    wire_checksum: u16,
    inter_char: Timer,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            state: State::AwaitSof,
            address: 0,
            len: 0,
            remaining_payload: 0,
            code: 0,
            payload: ArrayVec::new(),
            running_sum: 0,
            checksum_lo: 0,
            wire_checksum: 0,
            inter_char: Timer::expired_at_zero(),
        }
    }

    /// Abandons any partially-received frame and goes back to awaiting SOF.
    /// Used both on a framing error and by the bus arbiter when a candidate
    /// transport loses arbitration.
    pub fn reset(&mut self) {
        self.state = State::AwaitSof;
        self.payload.clear();
        self.running_sum = 0;
    }

    /// Feeds one received byte to the decoder.
    ///
    /// The inter-character timer is rearmed on every call that does not
    /// itself return `Done`/`Err`, so `poll_timeout` only ever fires between
    /// bytes, never immediately after one.
    pub fn on_byte(&mut self, byte: u8, clock: &impl Clock, filter: &AddressFilter) -> Step {
        let result = self.advance(byte, filter);
        match &result {
            Step::NeedMore => self.inter_char.rearm(clock, INTER_CHARACTER_TIMEOUT_MS),
            Step::Done(_) | Step::Err(_) => self.reset(),
        }
        result
    }

    /// Called when no byte is available; detects inter-character and
    /// overall timeouts. `overall` is owned by the caller (the bus arbiter
    /// tracks one overall timer per in-flight message).
    pub fn poll_timeout(&mut self, clock: &impl Clock, overall: &Timer) -> Option<DecodeError> {
        if self.state == State::AwaitSof {
            // No message in flight yet; only the overall timer (tracked by
            // the caller across the whole wait) can matter here.
            return if overall.expired(clock) {
                Some(DecodeError::OverallTimeout)
            } else {
                None
            };
        }
        if self.inter_char.expired(clock) {
            self.reset();
            return Some(DecodeError::InterCharTimeout);
        }
        if overall.expired(clock) {
            self.reset();
            return Some(DecodeError::OverallTimeout);
        }
        None
    }

    fn advance(&mut self, byte: u8, filter: &AddressFilter) -> Step {
        match self.state {
            State::AwaitSof => {
                if byte != SOF {
                    return Step::Err(DecodeError::BadStart);
                }
                self.running_sum = 0;
                self.payload.clear();
                self.state = State::Address;
                Step::NeedMore
            }
            State::Address => {
                self.address = byte;
                self.running_sum = self.running_sum.wrapping_add(byte as u16);
                self.state = State::LengthLow;
                Step::NeedMore
            }
            State::LengthLow => {
                self.len = byte as u16;
                self.running_sum = self.running_sum.wrapping_add(byte as u16);
                self.state = State::LengthHigh;
                Step::NeedMore
            }
            State::LengthHigh => {
                self.len |= (byte as u16) << 8;
                self.running_sum = self.running_sum.wrapping_add(byte as u16);
                if self.len > MAX_LEN || self.len < HEADER_AND_CHECKSUM_LEN {
                    return Step::Err(DecodeError::LengthOutOfRange);
                }
                self.remaining_payload = (self.len - HEADER_AND_CHECKSUM_LEN) as usize;
                self.state = State::Code;
                Step::NeedMore
            }
            State::Code => {
                self.code = byte;
                self.running_sum = self.running_sum.wrapping_add(byte as u16);
                self.state = if self.remaining_payload == 0 {
                    State::ChecksumLow
                } else {
                    State::Payload
                };
                Step::NeedMore
            }
            State::Payload => {
                self.running_sum = self.running_sum.wrapping_add(byte as u16);
                // Capacity is guaranteed by the LengthOutOfRange check above.
                let _ = self.payload.try_push(byte);
                self.remaining_payload -= 1;
                if self.remaining_payload == 0 {
                    self.state = State::ChecksumLow;
                }
                Step::NeedMore
            }
            State::ChecksumLow => {
                self.checksum_lo = byte;
                self.state = State::ChecksumHigh;
                Step::NeedMore
            }
            State::ChecksumHigh => {
                self.wire_checksum = u16::from_le_bytes([self.checksum_lo, byte]);
                self.state = State::Eof;
                Step::NeedMore
            }
            State::Eof => {
                if byte != EOF {
                    return Step::Err(DecodeError::BadEnd);
                }
                if self.running_sum != self.wire_checksum {
                    return Step::Err(DecodeError::BadChecksum);
                }
                if !filter.accepts(self.address) {
                    return Step::Err(DecodeError::BadAddress);
                }
                Step::Done(Frame {
                    address: self.address,
                    code: self.code,
                    payload: self.payload.clone(),
                })
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Maximum size of an encoded frame: `SOF + header/checksum + payload + EOF`.
pub const MAX_ENCODED_LEN: usize = 2 + HEADER_AND_CHECKSUM_LEN as usize + MAX_PAYLOAD;

/// Encodes a response (or request) frame. Stateless: computing the
/// checksum and writing the bytes out is the whole job, half-duplex
/// turnaround is the transport's concern.
pub fn encode(address: u8, code: u8, payload: &[u8]) -> ArrayVec<u8, MAX_ENCODED_LEN> {
    let mut out = ArrayVec::new();
    let len = HEADER_AND_CHECKSUM_LEN as usize + payload.len();
    let len = len as u16;
    let len_bytes = len.to_le_bytes();

    let mut sum: u16 = 0;
    sum = sum.wrapping_add(address as u16);
    sum = sum.wrapping_add(len_bytes[0] as u16);
    sum = sum.wrapping_add(len_bytes[1] as u16);
    sum = sum.wrapping_add(code as u16);
    for &b in payload {
        sum = sum.wrapping_add(b as u16);
    }
    let sum_bytes = sum.to_le_bytes();

    out.push(SOF);
    out.push(address);
    out.push(len_bytes[0]);
    out.push(len_bytes[1]);
    out.push(code);
    for &b in payload {
        out.push(b);
    }
    out.push(sum_bytes[0]);
    out.push(sum_bytes[1]);
    out.push(EOF);
    out
}

/// Feeds every byte of `bytes` through a fresh decoder; used by tests and
/// by the property checks in §8 of the design. Returns the first
/// `Done`/`Err` produced, or `None` if the bytes run out mid-frame.
pub fn decode_all(bytes: &[u8], clock: &impl Clock, filter: &AddressFilter) -> Option<Step> {
    let mut decoder = FrameDecoder::new();
    let mut last = None;
    for &b in bytes {
        match decoder.on_byte(b, clock, filter) {
            Step::NeedMore => continue,
            done => {
                last = Some(done);
                break;
            }
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct FixedClock;
    impl Clock for FixedClock {
        fn now_ms(&self) -> u32 {
            0
        }
    }

    fn filter() -> AddressFilter {
        AddressFilter { primary: 0x8C, alternate: 0x00, broadcast: None }
    }

    fn round_trip(address: u8, code: u8, payload: &[u8]) -> Frame {
        let encoded = encode(address, code, payload);
        match decode_all(&encoded, &FixedClock, &filter()).expect("frame fully decoded") {
            Step::Done(frame) => frame,
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn round_trips_empty_payload() {
        let frame = round_trip(0x8C, 0, &[]);
        assert_eq!(frame.address, 0x8C);
        assert_eq!(frame.code, 0);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn round_trips_single_byte_payload() {
        let frame = round_trip(0x8C, 37, &[0xAB]);
        assert_eq!(&frame.payload[..], &[0xAB]);
    }

    #[test]
    fn round_trips_maximum_payload() {
        let payload = [0x5Au8; MAX_PAYLOAD];
        let frame = round_trip(0x8C, 37, &payload);
        assert_eq!(frame.payload.len(), MAX_PAYLOAD);
    }

    #[test]
    fn rejects_bad_start_byte() {
        let bytes = [0x00u8];
        assert_eq!(
            decode_all(&bytes, &FixedClock, &filter()),
            Some(Step::Err(DecodeError::BadStart))
        );
    }

    #[test]
    fn rejects_checksum_off_by_one() {
        let mut encoded = encode(0x8C, 0, &[1, 2, 3]);
        let last_idx = encoded.len() - 2; // checksum low byte
        encoded[last_idx] = encoded[last_idx].wrapping_add(1);
        assert_eq!(
            decode_all(&encoded, &FixedClock, &filter()),
            Some(Step::Err(DecodeError::BadChecksum))
        );
    }

    #[test]
    fn rejects_foreign_address() {
        let encoded = encode(0x11, 0, &[]);
        assert_eq!(
            decode_all(&encoded, &FixedClock, &filter()),
            Some(Step::Err(DecodeError::BadAddress))
        );
    }

    #[test]
    fn rejects_oversize_length_field() {
        // SOF, addr, len_lo=0xFF, len_hi=0xFF (len=0xFFFF) -> out of range.
        let bytes = [SOF, 0x8C, 0xFF, 0xFF];
        assert_eq!(
            decode_all(&bytes, &FixedClock, &filter()),
            Some(Step::Err(DecodeError::LengthOutOfRange))
        );
    }

    #[test]
    fn decode_never_panics_on_arbitrary_bytes() {
        // A sweep over small arbitrary byte strings; the property test
        // below covers this more exhaustively, this is a quick smoke check.
        for seed in 0u8..=255 {
            let bytes = [seed, seed.wrapping_mul(7), seed.wrapping_add(3)];
            let _ = decode_all(&bytes, &FixedClock, &filter());
        }
    }

    proptest! {
        #[test]
        fn decode_is_safe_on_arbitrary_input(bytes in prop::collection::vec(any::<u8>(), 0..600)) {
            // Must not panic; any outcome (None/Done/Err) is acceptable.
            let _ = decode_all(&bytes, &FixedClock, &filter());
        }

        #[test]
        fn round_trip_holds_for_arbitrary_well_formed_frames(
            address in any::<u8>(),
            code in any::<u8>(),
            payload in prop::collection::vec(any::<u8>(), 0..MAX_PAYLOAD),
        ) {
            let filter = AddressFilter { primary: address, alternate: address, broadcast: None };
            let encoded = encode(address, code, &payload);
            let decoded = decode_all(&encoded, &FixedClock, &filter);
            match decoded {
                Some(Step::Done(frame)) => {
                    prop_assert_eq!(frame.address, address);
                    prop_assert_eq!(frame.code, code);
                    prop_assert_eq!(&frame.payload[..], &payload[..]);
                }
                other => prop_assert!(false, "expected Done, got {:?}", other),
            }
        }
    }
}
