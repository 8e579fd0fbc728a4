// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ties the frame codec, bus arbiter, and opcode dispatcher into the
//! blocking session loop a real binary runs, and supplies the one
//! `BoardConfig` this tool variant ships.
//!
//! A concrete binary crate links this, provides `FlashDevice`, `Transport`,
//! `Clock`, and [`Platform`] implementations for its silicon, and calls
//! [`run`] from its reset handler. Nothing in here is aware of a register
//! map; that boundary is exactly where spec.md draws it.

#![cfg_attr(not(test), no_std)]

use loader_crc::Crc16;
use loader_partition::{FlashDevice, PartitionMap, PartitionRecord, StagingPolicy};
use loader_protocol::{
    Baseline, BoardConfig, IdentityConfig, LoaderContext, LoopOutcome, RESET_DRAIN_MS,
    TRANSMIT_TURNAROUND_MS,
};
use loader_time::{Clock, Timer};
use loader_transport::{BusArbiter, WaitOutcome};

include!(concat!(env!("OUT_DIR"), "/consts.rs"));

// Sector bit assignments for the default build's erase primitive. Which bit
// maps to which physical sector is entirely a platform convention; the core
// only ever treats these as opaque masks passed to `FlashDevice::erase_sectors`.
const SECTOR_BOOT: u32 = 1 << 0;
const SECTOR_PARAMETER: u32 = 1 << 1;
const SECTOR_APPLICATION: u32 = 0b1111_1100; // sectors C..H, bits 2..7

/// The default tool variant's `BoardConfig`, per spec.md §6's partition
/// layout: boot `0x338000..0x33FF7F`, application `0x300000..0x32FFFF`,
/// parameter `0x330000..0x337FFF`, config disabled.
pub fn default_board_config() -> BoardConfig {
    BoardConfig {
        primary_address: 0x8C,
        alternate_address: 0x00,
        broadcast_address: None,
        partition_map: PartitionMap {
            records: [
                PartitionRecord {
                    start_word: 0x338000,
                    crc_slot_word: 0x33FF7F,
                    sector_mask: SECTOR_BOOT,
                    length_words: 0x33FF7F - 0x338000 + 1,
                },
                PartitionRecord {
                    start_word: 0x300000,
                    crc_slot_word: 0x32FFFF,
                    sector_mask: SECTOR_APPLICATION,
                    length_words: 0x32FFFF - 0x300000 + 1,
                },
                PartitionRecord {
                    start_word: 0x330000,
                    crc_slot_word: 0x337FFF,
                    sector_mask: SECTOR_PARAMETER,
                    length_words: 0x337FFF - 0x330000 + 1,
                },
                PartitionRecord { start_word: 0, crc_slot_word: 0, sector_mask: 0, length_words: 0 },
            ],
            allow_bootloader_programming: false,
        },
        // The legacy tool's own `tool_specific_config.h` ships
        // `ALLOW_INCREMENTAL_FLASH_WRITE TRUE`: every partition here is far
        // larger than the fixed `SCRATCH_WORDS` RAM buffer, so
        // `DoubleBuffered` could never stage a full application, parameter,
        // or boot image. Incremental is the only policy this layout
        // actually supports.
        staging_policy: StagingPolicy::Incremental,
        jump_to_app_with_bad_crc: false,
        identity: IdentityConfig {
            variant_tag: *b"XPB   ",
            major_version: 1,
            minor_version: 0,
            baseline: Baseline::Commercial,
            build_number: LOADER_BUILD_VERSION as u16,
        },
    }
}

/// What a boot session ended with: the two terminal [`LoopOutcome`]
/// variants, surfaced without the `Continue` case a caller never sees
/// returned from [`run_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    JumpToApp(u32),
    Reset,
}

/// Runs one boot session to completion: binds the bus, self-tests both
/// images, then loops waiting for frames and dispatching them until the
/// loader timer lapses or a handler decides to jump or reset.
///
/// Framing errors are swallowed here exactly as spec.md requires of the bus
/// arbiter: the loop simply waits for the next SOF, no response is sent.
pub fn run_session<F: FlashDevice>(
    board: &BoardConfig,
    flash: &mut F,
    crc: &impl Crc16,
    clock: &impl Clock,
    mut arbiter: BusArbiter<'_>,
) -> SessionOutcome {
    let self_test = loader_protocol::self_test(flash, crc, &board.partition_map);
    let mut ctx = LoaderContext::new(board, self_test, clock);
    let filter = board.address_filter();

    loop {
        let overall = ctx.loader_timer;
        match arbiter.wait_for_message(clock, &overall, &filter, |_framing_error| {}) {
            WaitOutcome::Timeout => {
                return if ctx.state == loader_protocol::LoaderState::Waiting {
                    match loader_protocol::waiting_timeout_disposition(&ctx.self_test, board) {
                        LoopOutcome::JumpToApp(addr) => SessionOutcome::JumpToApp(addr),
                        LoopOutcome::Reset => SessionOutcome::Reset,
                        LoopOutcome::Continue => unreachable!("waiting disposition never continues"),
                    }
                } else {
                    // spec.md §4.6: an overall-timer expiry outside Waiting
                    // means an update was left mid-flight; always reset.
                    SessionOutcome::Reset
                };
            }
            WaitOutcome::Frame(frame) => {
                let outcome = loader_protocol::dispatch(&mut ctx, flash, clock, &frame);
                if let Some(reply) = &outcome.reply {
                    let bytes = loader_protocol::encode_reply(board, reply);
                    arbiter.send(clock, TRANSMIT_TURNAROUND_MS, &bytes);
                }
                ctx.run_deferred(flash, crc, outcome.deferred);
                match outcome.outcome {
                    LoopOutcome::Continue => {}
                    LoopOutcome::JumpToApp(addr) => return SessionOutcome::JumpToApp(addr),
                    LoopOutcome::Reset => return SessionOutcome::Reset,
                }
            }
        }
    }
}

/// The two ways out of the loader that a real binary cannot express in
/// safe, returning Rust: a CPU reset and a jump to the application's entry
/// point. Kept as a trait so `run_session` above stays entirely testable
/// against fakes, with only this terminal step left platform-specific.
pub trait Platform {
    fn jump_to_application(&mut self, entry_word: u32) -> !;
    fn reset(&mut self) -> !;
}

/// Runs a session and then, after the fixed reset-drain delay, hands off to
/// the platform. This is what a binary's reset handler calls; it never
/// returns.
pub fn run<F: FlashDevice>(
    board: &BoardConfig,
    flash: &mut F,
    crc: &impl Crc16,
    clock: &impl Clock,
    arbiter: BusArbiter<'_>,
    platform: &mut impl Platform,
) -> ! {
    let outcome = run_session(board, flash, crc, clock, arbiter);
    let drain = Timer::arm(clock, RESET_DRAIN_MS);
    while !drain.expired(clock) {}
    match outcome {
        SessionOutcome::JumpToApp(addr) => platform.jump_to_application(addr),
        SessionOutcome::Reset => platform.reset(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrayvec::ArrayVec;
    use core::cell::{Cell, RefCell};
    use loader_crc::Xmodem16;
    use loader_frame::encode;
    use loader_partition::FlashOpStatus;
    use loader_transport::Transport;
    use std::collections::VecDeque;

    const FLASH_WORDS: usize = 0x340000;

    struct FakeFlash {
        words: RefCell<Vec<u16>>,
    }

    impl FakeFlash {
        fn blank() -> Self {
            FakeFlash { words: RefCell::new(vec![0xFFFFu16; FLASH_WORDS]) }
        }
    }

    impl FlashDevice for FakeFlash {
        fn read_words(&self, start_word: u32, out: &mut [u16]) {
            let words = self.words.borrow();
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = words[start_word as usize + i];
            }
        }
        fn write_words(&mut self, start_word: u32, data: &[u16]) -> Result<(), FlashOpStatus> {
            let mut words = self.words.borrow_mut();
            for (i, &w) in data.iter().enumerate() {
                words[start_word as usize + i] = w;
            }
            Ok(())
        }
        fn erase_sectors(&mut self, _sector_mask: u32) -> Result<(), FlashOpStatus> {
            Ok(())
        }
        fn sector_is_blank(&self, _sector_bit: u32) -> bool {
            false
        }
    }

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
        idle_advance_ms: u32,
    }

    impl FakeTransport {
        fn new(clock: &'static FakeClock, idle_advance_ms: u32) -> Self {
            FakeTransport {
                rx: RefCell::new(VecDeque::new()),
                tx: RefCell::new(Vec::new()),
                receive_disabled: Cell::new(false),
                clock,
                idle_advance_ms,
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
                self.clock.advance(self.idle_advance_ms);
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

    fn board() -> BoardConfig {
        let mut board = default_board_config();
        board.partition_map.allow_bootloader_programming = false;
        board
    }

    #[test]
    fn boots_straight_to_a_good_application() {
        let clock: &'static FakeClock = Box::leak(Box::new(FakeClock::new()));
        let mut flash = FakeFlash::blank();
        let crc = Xmodem16;
        let board = board();

        // A blank application region CRCs to a known value; plant that
        // value in its CRC slot so self-test reports it as valid, which
        // picks the short (5s) Waiting timeout and the jump-on-timeout
        // disposition.
        let app = board.partition_map.record(loader_partition::PartitionId::Application);
        let data_words = app.data_word_count() as usize;
        let buf = vec![0xFFFFu16; data_words];
        let actual = crc.checksum(&buf);
        flash.write_words(app.crc_slot_word, &[actual]).unwrap();

        let mut primary = FakeTransport::new(clock, 500);
        let mut candidates: ArrayVec<&mut dyn Transport, { loader_transport::MAX_CANDIDATES }> =
            ArrayVec::new();
        candidates.push(&mut primary);
        let arbiter = BusArbiter::new(candidates);

        let outcome = run_session(&board, &mut flash, &crc, clock, arbiter);
        assert_eq!(outcome, SessionOutcome::JumpToApp(app.start_word));
    }

    #[test]
    fn a_well_formed_identify_request_keeps_the_session_alive_past_the_first_reply() {
        let clock: &'static FakeClock = Box::leak(Box::new(FakeClock::new()));
        let mut flash = FakeFlash::blank();
        let crc = Xmodem16;
        let board = board();

        let mut primary = FakeTransport::new(clock, 5_000);
        // Identify (opcode 2), then nothing further: the session should
        // reply once and then time out to a reset, since the application
        // image (all-0xFF, no CRC planted) is invalid and
        // jump_to_app_with_bad_crc is false.
        primary.push_bytes(&encode(board.primary_address, 2, &[]));
        let mut candidates: ArrayVec<&mut dyn Transport, { loader_transport::MAX_CANDIDATES }> =
            ArrayVec::new();
        candidates.push(&mut primary);
        let arbiter = BusArbiter::new(candidates);

        let outcome = run_session(&board, &mut flash, &crc, clock, arbiter);
        assert_eq!(outcome, SessionOutcome::Reset);
        assert!(!primary.tx.borrow().is_empty());
    }
}
