// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The static partition map, the `FlashDevice` trait boundary, and the
//! byte/word endianness conversions that sit between the wire protocol and
//! on-chip flash.

#![cfg_attr(not(test), no_std)]

use loader_crc::Crc16;
use num_derive::{FromPrimitive, ToPrimitive};

/// A raw platform status code from a flash operation. `0` means success by
/// convention; any other value is passed back to the surface verbatim as
/// an error-code payload byte.
pub type FlashOpStatus = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum PartitionId {
    Boot = 0,
    Application = 1,
    Parameter = 2,
    Config = 3,
}

/// The fixed description of one flash region. Addresses are 16-bit-word
/// addresses, matching the DSP's native word-addressed flash (a 4-byte
/// wire address is a word address, not a byte address).
#[derive(Debug, Clone, Copy)]
pub struct PartitionRecord {
    pub start_word: u32,
    /// Exclusive: the CRC slot word, not part of the programmable data
    /// range.
    pub crc_slot_word: u32,
    pub sector_mask: u32,
    /// Total words in the region, including the CRC slot. Zero means the
    /// partition is not configured on this build (e.g. `config` disabled).
    pub length_words: u32,
}

impl PartitionRecord {
    /// Data words available for program/erase, excluding the CRC slot.
    pub fn data_word_count(&self) -> u32 {
        self.length_words.saturating_sub(1)
    }

    pub fn contains_range(&self, start_word: u32, word_count: u32) -> bool {
        if word_count == 0 || self.length_words == 0 {
            return false;
        }
        let Some(end) = start_word.checked_add(word_count) else {
            return false;
        };
        start_word >= self.start_word && end <= self.crc_slot_word
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingPolicy {
    DoubleBuffered,
    Incremental,
}

/// Raised by partition-level accesses; distinct from the raw
/// [`FlashOpStatus`] a [`FlashDevice`] hands back, which is wrapped in the
/// `Flash` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionAccessError {
    NoActivePartition,
    OutOfRange,
    WriteProtected,
    Flash(FlashOpStatus),
}

/// The external flash-primitive collaborator: synchronous read/program/
/// erase, plus a per-sector blank check used to skip redundant erases.
pub trait FlashDevice {
    fn read_words(&self, start_word: u32, out: &mut [u16]);
    fn write_words(&mut self, start_word: u32, data: &[u16]) -> Result<(), FlashOpStatus>;
    fn erase_sectors(&mut self, sector_mask: u32) -> Result<(), FlashOpStatus>;
    /// `sector_bit` is the index (0..32) of one bit of a sector mask.
    fn sector_is_blank(&self, sector_bit: u32) -> bool;
}

pub const SCRATCH_WORDS: usize = 0x1000;
pub const SCRATCH_BASE_WORD: u32 = 0xF000;

/// The RAM staging area used under [`StagingPolicy::DoubleBuffered`]. Sized
/// to the largest partition, per the legacy contract.
pub struct Scratch {
    words: [u16; SCRATCH_WORDS],
}

impl Scratch {
    pub fn blank() -> Self {
        Scratch { words: [0xFFFF; SCRATCH_WORDS] }
    }

    pub fn fill_blank(&mut self) {
        self.words = [0xFFFF; SCRATCH_WORDS];
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    pub fn write(&mut self, offset_words: u32, data: &[u16]) -> Result<(), PartitionAccessError> {
        let start = offset_words as usize;
        let end = start.checked_add(data.len()).ok_or(PartitionAccessError::OutOfRange)?;
        if end > SCRATCH_WORDS {
            return Err(PartitionAccessError::OutOfRange);
        }
        self.words[start..end].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, offset_words: u32, out: &mut [u16]) -> Result<(), PartitionAccessError> {
        let start = offset_words as usize;
        let end = start.checked_add(out.len()).ok_or(PartitionAccessError::OutOfRange)?;
        if end > SCRATCH_WORDS {
            return Err(PartitionAccessError::OutOfRange);
        }
        out.copy_from_slice(&self.words[start..end]);
        Ok(())
    }
}

impl Default for Scratch {
    fn default() -> Self {
        Self::blank()
    }
}

/// The mutable state of a partition currently being updated. At most one
/// of these is alive at a time; it is owned by the update engine, not by
/// the partition map.
#[derive(Debug, Clone, Copy)]
pub struct PartitionContext {
    pub id: PartitionId,
    pub record: PartitionRecord,
    pub prepared: bool,
    pub programmed: bool,
    pub last_status: FlashOpStatus,
}

impl PartitionContext {
    pub fn new(id: PartitionId, record: PartitionRecord) -> Self {
        PartitionContext { id, record, prepared: false, programmed: false, last_status: 0 }
    }
}

/// A snapshot of the active context, threaded through read/write/CRC so
/// they can redirect to scratch when appropriate. `None` means no
/// partition context is currently open.
pub type ActiveContext<'a> = Option<(&'a PartitionContext, &'a Scratch, StagingPolicy)>;

/// Largest chunk a single download/upload opcode can carry: a 1-byte
/// length field tops out at 255 bytes, which is at most 128 words.
pub const MAX_CHUNK_WORDS: usize = 128;

fn be_bytes_to_words(data: &[u8], out: &mut [u16]) -> usize {
    let mut n = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        out[n] = u16::from_be_bytes([pair[0], pair[1]]);
        n += 1;
    }
    if let [last] = chunks.remainder() {
        out[n] = u16::from_be_bytes([*last, 0]);
        n += 1;
    }
    n
}

fn words_to_be_bytes(words: &[u16], out: &mut [u8]) -> usize {
    let mut n = 0;
    for w in words {
        let b = w.to_be_bytes();
        out[n] = b[0];
        out[n + 1] = b[1];
        n += 2;
    }
    n
}

/// The static description of the four flash regions plus the build-time
/// permission policy. One instance exists per `BoardConfig`.
#[derive(Debug, Clone)]
pub struct PartitionMap {
    pub records: [PartitionRecord; 4],
    pub allow_bootloader_programming: bool,
}

impl PartitionMap {
    pub fn record(&self, id: PartitionId) -> PartitionRecord {
        self.records[id as usize]
    }

    pub fn describe(&self, id: PartitionId) -> PartitionRecord {
        self.record(id)
    }

    pub fn is_valid(&self, id: PartitionId) -> bool {
        match id {
            PartitionId::Application => true,
            PartitionId::Boot => self.allow_bootloader_programming,
            PartitionId::Parameter | PartitionId::Config => self.record(id).length_words != 0,
        }
    }

    /// Scans every masked sector for blankness and skips re-erasing any
    /// that are already entirely `0xFFFF`.
    pub fn erase<F: FlashDevice>(
        &self,
        flash: &mut F,
        id: PartitionId,
    ) -> Result<(), FlashOpStatus> {
        let record = self.record(id);
        let mut effective_mask = 0u32;
        for bit in 0..32 {
            let bit_mask = 1u32 << bit;
            if record.sector_mask & bit_mask != 0 && !flash.sector_is_blank(bit) {
                effective_mask |= bit_mask;
            }
        }
        if effective_mask == 0 {
            return Ok(());
        }
        flash.erase_sectors(effective_mask)
    }

    pub fn program_memory_write<F: FlashDevice>(
        &self,
        flash: &mut F,
        ctx: &mut PartitionContext,
        scratch: &mut Scratch,
        policy: StagingPolicy,
        start_word: u32,
        data_be: &[u8],
    ) -> Result<(), PartitionAccessError> {
        if ctx.id == PartitionId::Boot && !self.allow_bootloader_programming {
            return Err(PartitionAccessError::WriteProtected);
        }
        let mut words = [0u16; MAX_CHUNK_WORDS];
        let word_count = be_bytes_to_words(data_be, &mut words);
        if !ctx.record.contains_range(start_word, word_count as u32) {
            return Err(PartitionAccessError::OutOfRange);
        }
        match policy {
            StagingPolicy::DoubleBuffered => {
                let offset = start_word - ctx.record.start_word;
                scratch.write(offset, &words[..word_count])
            }
            StagingPolicy::Incremental => flash
                .write_words(start_word, &words[..word_count])
                .map_err(PartitionAccessError::Flash),
        }
    }

    /// Reads are redirected to scratch when the active context is prepared
    /// but not yet programmed under the double-buffered policy; otherwise
    /// they come straight from flash. With no active context, a direct
    /// flash read is permitted (the upload-anywhere debug path).
    pub fn program_memory_read<F: FlashDevice>(
        &self,
        flash: &F,
        active: ActiveContext<'_>,
        word_address: u32,
        out_be: &mut [u8],
    ) -> Result<(), PartitionAccessError> {
        if out_be.len() % 2 != 0 {
            return Err(PartitionAccessError::OutOfRange);
        }
        let word_count = (out_be.len() / 2).min(MAX_CHUNK_WORDS);
        let mut words = [0u16; MAX_CHUNK_WORDS];
        match active {
            Some((ctx, scratch, StagingPolicy::DoubleBuffered)) if ctx.prepared && !ctx.programmed => {
                let offset = word_address.saturating_sub(ctx.record.start_word);
                scratch.read(offset, &mut words[..word_count])?;
            }
            _ => flash.read_words(word_address, &mut words[..word_count]),
        }
        words_to_be_bytes(&words[..word_count], out_be);
        Ok(())
    }

    pub fn calculate_crc<F: FlashDevice, C: Crc16>(
        &self,
        flash: &F,
        crc: &C,
        active: ActiveContext<'_>,
        id: PartitionId,
    ) -> u16 {
        let record = self.record(id);
        let data_words = record.data_word_count();
        match active {
            Some((ctx, scratch, StagingPolicy::DoubleBuffered))
                if ctx.id == id && ctx.prepared && !ctx.programmed =>
            {
                // `scratch` is the fixed `SCRATCH_WORDS`-sized RAM buffer, not
                // necessarily as large as the partition (see `BoardConfig`'s
                // staging-policy note); clamp so a board that pairs
                // `DoubleBuffered` with an oversized partition reports a
                // truncated CRC instead of indexing past the buffer.
                let n = (data_words as usize).min(scratch.words().len());
                crc.checksum(&scratch.words()[..n])
            }
            _ => {
                let mut running = crc.start();
                let mut buf = [0u16; 64];
                let mut addr = record.start_word;
                let mut remaining = data_words;
                while remaining > 0 {
                    let n = remaining.min(64) as usize;
                    flash.read_words(addr, &mut buf[..n]);
                    crc.update(&mut running, &buf[..n]);
                    addr += n as u32;
                    remaining -= n as u32;
                }
                crc.finish(running)
            }
        }
    }

    pub fn expected_crc<F: FlashDevice>(&self, flash: &F, id: PartitionId) -> u16 {
        let record = self.record(id);
        let mut buf = [0u16; 1];
        flash.read_words(record.crc_slot_word, &mut buf);
        buf[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loader_crc::Xmodem16;
    use std::cell::RefCell;

    struct FakeFlash {
        words: RefCell<[u16; 0x10000]>,
    }

    impl FakeFlash {
        fn blank() -> Self {
            FakeFlash { words: RefCell::new([0xFFFF; 0x10000]) }
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

    fn test_map(allow_boot: bool, config_len: u32) -> PartitionMap {
        PartitionMap {
            records: [
                PartitionRecord {
                    start_word: 0x8000,
                    crc_slot_word: 0x8100,
                    sector_mask: 0b1,
                    length_words: 0x101,
                },
                PartitionRecord {
                    start_word: 0x0000,
                    crc_slot_word: 0x4000,
                    sector_mask: 0b1111110,
                    length_words: 0x4001,
                },
                PartitionRecord {
                    start_word: 0x4100,
                    crc_slot_word: 0x4200,
                    sector_mask: 0b10,
                    length_words: 0x101,
                },
                PartitionRecord {
                    start_word: 0,
                    crc_slot_word: 0,
                    sector_mask: 0,
                    length_words: config_len,
                },
            ],
            allow_bootloader_programming: allow_boot,
        }
    }

    #[test]
    fn is_valid_matches_every_permission_combination() {
        for &allow_boot in &[false, true] {
            for &config_len in &[0, 0x10] {
                let map = test_map(allow_boot, config_len);
                assert_eq!(map.is_valid(PartitionId::Application), true);
                assert_eq!(map.is_valid(PartitionId::Boot), allow_boot);
                assert_eq!(map.is_valid(PartitionId::Parameter), true);
                assert_eq!(map.is_valid(PartitionId::Config), config_len != 0);
            }
        }
    }

    #[test]
    fn write_rejects_boot_partition_without_permission() {
        let map = test_map(false, 0x10);
        let mut flash = FakeFlash::blank();
        let mut ctx = PartitionContext::new(PartitionId::Boot, map.record(PartitionId::Boot));
        let mut scratch = Scratch::blank();
        let result = map.program_memory_write(
            &mut flash,
            &mut ctx,
            &mut scratch,
            StagingPolicy::Incremental,
            0x8000,
            &[0, 1],
        );
        assert_eq!(result, Err(PartitionAccessError::WriteProtected));
    }

    #[test]
    fn write_rejects_out_of_range_chunk() {
        let map = test_map(true, 0x10);
        let mut flash = FakeFlash::blank();
        let mut ctx =
            PartitionContext::new(PartitionId::Application, map.record(PartitionId::Application));
        let mut scratch = Scratch::blank();
        // Application partition starts at 0x0000; target way outside it.
        let result = map.program_memory_write(
            &mut flash,
            &mut ctx,
            &mut scratch,
            StagingPolicy::Incremental,
            0x8000,
            &[0, 1],
        );
        assert_eq!(result, Err(PartitionAccessError::OutOfRange));
    }

    #[test]
    fn double_buffered_write_then_crc_matches_read_back() {
        let map = test_map(true, 0x10);
        let mut flash = FakeFlash::blank();
        let mut ctx =
            PartitionContext::new(PartitionId::Application, map.record(PartitionId::Application));
        ctx.prepared = true;
        let mut scratch = Scratch::blank();
        map.program_memory_write(
            &mut flash,
            &mut ctx,
            &mut scratch,
            StagingPolicy::DoubleBuffered,
            0x0000,
            &[0x12, 0x34, 0x56, 0x78],
        )
        .unwrap();

        let crc = Xmodem16;
        let active: ActiveContext<'_> = Some((&ctx, &scratch, StagingPolicy::DoubleBuffered));
        let computed = map.calculate_crc(&flash, &crc, active, PartitionId::Application);
        let again = map.calculate_crc(&flash, &crc, active, PartitionId::Application);
        assert_eq!(computed, again);

        let mut out = [0u8; 4];
        map.program_memory_read(&flash, active, 0x0000, &mut out).unwrap();
        assert_eq!(out, [0x12, 0x34, 0x56, 0x78]);
    }
}
