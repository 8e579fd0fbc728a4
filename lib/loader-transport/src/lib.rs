// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! First-message-wins arbitration between candidate transports, and the
//! trait boundary the transport layer is reached through. The protocol
//! engine never sees a UART register; it sees `try_read_byte`.

#![cfg_attr(not(test), no_std)]

use arrayvec::ArrayVec;
use loader_frame::{AddressFilter, DecodeError, Frame, FrameDecoder, Step};
use loader_time::{Clock, Timer};

/// One half-duplex byte channel. ISRs fill a receive ring and drain a
/// transmit ring behind this; the engine only ever sees the synchronous
/// view described here.
pub trait Transport {
    /// Non-blocking poll for the next received byte.
    fn try_read_byte(&mut self) -> Option<u8>;

    /// Queues one byte for transmission. The transport is expected to be
    /// in transmit mode already (see `set_transmit_mode`).
    fn write_byte(&mut self, byte: u8);

    /// Switches the half-duplex line direction. `true` = drive the line
    /// (after the fixed turnaround delay the caller already waited out);
    /// `false` = listen.
    fn set_transmit_mode(&mut self, transmitting: bool);

    /// Polls whether every queued byte has left the transmit ring.
    fn transmit_idle(&mut self) -> bool;

    /// Called on a transport that lost arbitration: stop feeding its
    /// receive ring into anything the loader looks at.
    fn disable_receive(&mut self);
}

pub const MAX_CANDIDATES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Frame(Frame),
    Timeout,
}

/// Binds the system bus to whichever candidate transport produces the
/// first byte, then serves only that transport for the rest of the boot
/// session.
pub struct BusArbiter<'a> {
    candidates: ArrayVec<&'a mut dyn Transport, MAX_CANDIDATES>,
    bound: Option<usize>,
    decoder: FrameDecoder,
}

impl<'a> BusArbiter<'a> {
    pub fn new(candidates: ArrayVec<&'a mut dyn Transport, MAX_CANDIDATES>) -> Self {
        BusArbiter { candidates, bound: None, decoder: FrameDecoder::new() }
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    fn bind(&mut self, index: usize) {
        self.bound = Some(index);
        for (i, transport) in self.candidates.iter_mut().enumerate() {
            if i != index {
                transport.disable_receive();
            }
        }
    }

    /// Spins until a complete, valid frame arrives or `overall` expires.
    /// Framing errors (bad start/checksum/address/inter-character timeout)
    /// never terminate the wait; they are reported through
    /// `on_framing_error` purely for tracing and otherwise swallowed,
    /// matching the rule that the surface is authoritative and will retry.
    pub fn wait_for_message(
        &mut self,
        clock: &impl Clock,
        overall: &Timer,
        filter: &AddressFilter,
        mut on_framing_error: impl FnMut(DecodeError),
    ) -> WaitOutcome {
        loop {
            if let Some(bound) = self.bound {
                let byte = self.candidates[bound].try_read_byte();
                if let Some(byte) = byte {
                    match self.decoder.on_byte(byte, clock, filter) {
                        Step::Done(frame) => return WaitOutcome::Frame(frame),
                        Step::Err(e) => on_framing_error(e),
                        Step::NeedMore => {}
                    }
                } else if let Some(err) = self.decoder.poll_timeout(clock, overall) {
                    match err {
                        DecodeError::OverallTimeout => return WaitOutcome::Timeout,
                        other => on_framing_error(other),
                    }
                }
            } else {
                let mut bound_this_round = None;
                for i in 0..self.candidates.len() {
                    if let Some(byte) = self.candidates[i].try_read_byte() {
                        bound_this_round = Some((i, byte));
                        break;
                    }
                }
                if let Some((i, byte)) = bound_this_round {
                    self.bind(i);
                    match self.decoder.on_byte(byte, clock, filter) {
                        Step::Done(frame) => return WaitOutcome::Frame(frame),
                        Step::Err(e) => on_framing_error(e),
                        Step::NeedMore => {}
                    }
                } else if let Some(DecodeError::OverallTimeout) =
                    self.decoder.poll_timeout(clock, overall)
                {
                    return WaitOutcome::Timeout;
                }
            }
        }
    }

    /// Sends a response frame out the bound transport. If the bus is not
    /// yet bound there is nothing to reply to; callers only invoke this
    /// after `wait_for_message` returned `Frame`.
    pub fn send(&mut self, clock: &impl Clock, turnaround_ms: u32, bytes: &[u8]) {
        let Some(bound) = self.bound else { return };
        let transport = &mut self.candidates[bound];
        transport.set_transmit_mode(true);
        busy_wait(clock, turnaround_ms);
        for &b in bytes {
            transport.write_byte(b);
        }
        while !transport.transmit_idle() {}
        transport.set_transmit_mode(false);
    }
}

fn busy_wait(clock: &impl Clock, ms: u32) {
    let timer = Timer::arm(clock, ms);
    while !timer.expired(clock) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};
    use loader_frame::encode;
    use std::collections::VecDeque;

    struct FakeClock(Cell<u32>);
    impl FakeClock {
        fn new() -> Self {
            FakeClock(Cell::new(0))
        }
        fn advance(&self, ms: u32) {
            self.0.set(self.0.get().wrapping_add(ms));
        }
    }
    impl Clock for FakeClock {
        fn now_ms(&self) -> u32 {
            self.0.get()
        }
    }

    struct FakeTransport {
        rx: RefCell<VecDeque<u8>>,
        tx: RefCell<Vec<u8>>,
        receive_disabled: Cell<bool>,
        clock: &'static FakeClock,
    }

    impl FakeTransport {
        fn new(clock: &'static FakeClock) -> Self {
            FakeTransport {
                rx: RefCell::new(VecDeque::new()),
                tx: RefCell::new(Vec::new()),
                receive_disabled: Cell::new(false),
                clock,
            }
        }
        fn push_bytes(&self, bytes: &[u8]) {
            self.rx.borrow_mut().extend(bytes.iter().copied());
        }
    }

    impl Transport for FakeTransport {
        fn try_read_byte(&mut self) -> Option<u8> {
            if self.receive_disabled.get() {
                return None;
            }
            let byte = self.rx.borrow_mut().pop_front();
            if byte.is_none() {
                // Advance the clock a tick so inter-character/overall
                // timers make progress even though nothing arrived.
                self.clock.advance(1);
            }
            byte
        }
        fn write_byte(&mut self, byte: u8) {
            self.tx.borrow_mut().push(byte);
        }
        fn set_transmit_mode(&mut self, _transmitting: bool) {}
        fn transmit_idle(&mut self) -> bool {
            true
        }
        fn disable_receive(&mut self) {
            self.receive_disabled.set(true);
        }
    }

    fn filter() -> AddressFilter {
        AddressFilter { primary: 0x8C, alternate: 0x00, broadcast: None }
    }

    #[test]
    fn binds_to_first_transport_with_a_byte() {
        // Leaked so the 'static borrow in FakeTransport stays valid for
        // the test's duration without extra lifetime plumbing.
        let clock: &'static FakeClock = Box::leak(Box::new(FakeClock::new()));
        let mut primary = FakeTransport::new(clock);
        let mut secondary = FakeTransport::new(clock);
        let frame_bytes = encode(0x8C, 0, &[1, 2, 3]);
        primary.push_bytes(&frame_bytes);

        let mut candidates: ArrayVec<&mut dyn Transport, MAX_CANDIDATES> = ArrayVec::new();
        candidates.push(&mut primary);
        candidates.push(&mut secondary);
        let mut arbiter = BusArbiter::new(candidates);

        let overall = Timer::arm(clock, 120_000);
        let outcome = arbiter.wait_for_message(clock, &overall, &filter(), |_| {});
        match outcome {
            WaitOutcome::Frame(frame) => {
                assert_eq!(frame.address, 0x8C);
                assert_eq!(&frame.payload[..], &[1, 2, 3]);
            }
            WaitOutcome::Timeout => panic!("expected a frame"),
        }
        assert!(arbiter.is_bound());
        assert!(secondary.receive_disabled.get());
    }

    #[test]
    fn times_out_when_nothing_arrives() {
        let clock: &'static FakeClock = Box::leak(Box::new(FakeClock::new()));
        let mut primary = FakeTransport::new(clock);
        let mut candidates: ArrayVec<&mut dyn Transport, MAX_CANDIDATES> = ArrayVec::new();
        candidates.push(&mut primary);
        let mut arbiter = BusArbiter::new(candidates);

        let overall = Timer::arm(clock, 50);
        let outcome = arbiter.wait_for_message(clock, &overall, &filter(), |_| {});
        assert_eq!(outcome, WaitOutcome::Timeout);
    }
}
