// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The prepare/download/validate/commit lifecycle for one partition at a
//! time. This is the part of the legacy contract that used to live inside
//! opcode 39's three-way `switch`; here it is three named operations
//! (`prepare`, `write_chunk`, `validate_and_begin_commit`) plus the two
//! poll queries the surface uses to observe progress across a blocking,
//! single-threaded main loop.

#![cfg_attr(not(test), no_std)]

use loader_crc::Crc16;
use loader_partition::{
    ActiveContext, FlashDevice, FlashOpStatus, PartitionAccessError, PartitionContext,
    PartitionId, PartitionMap, Scratch, StagingPolicy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitState {
    NotBegun,
    InProgress,
    InvalidCrc,
    Failed(FlashOpStatus),
    Succeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreparePoll {
    Ready,
    Failed(FlashOpStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPoll {
    Done,
    InProgress,
    VerifyFailed,
    Failed(FlashOpStatus),
}

/// Owns the scratch buffer and the single in-flight [`PartitionContext`].
/// There is exactly one of these per loader; it outlives any individual
/// partition update and is reused across `prepare` cycles.
pub struct UpdateEngine {
    policy: StagingPolicy,
    scratch: Scratch,
    active: Option<PartitionContext>,
    commit_state: CommitState,
}

impl UpdateEngine {
    pub fn new(policy: StagingPolicy) -> Self {
        UpdateEngine {
            policy,
            scratch: Scratch::blank(),
            active: None,
            commit_state: CommitState::NotBegun,
        }
    }

    pub fn policy(&self) -> StagingPolicy {
        self.policy
    }

    pub fn active_partition(&self) -> Option<PartitionId> {
        self.active.as_ref().map(|ctx| ctx.id)
    }

    pub fn is_prepared(&self) -> bool {
        self.active.is_some()
    }

    pub fn was_prepared_successfully(&self) -> bool {
        self.active.as_ref().is_some_and(|ctx| ctx.prepared)
    }

    pub fn was_programmed(&self) -> bool {
        self.active.as_ref().is_some_and(|ctx| ctx.programmed)
    }

    fn active_context(&self) -> ActiveContext<'_> {
        self.active.as_ref().map(|ctx| (ctx, &self.scratch, self.policy))
    }

    /// Blanks the scratch region or erases flash, synchronously. The
    /// response frame telling the surface "prepare has started" is sent by
    /// the caller before this is invoked, matching the legacy contract's
    /// "acknowledge first, because erase may take seconds" rule.
    pub fn prepare<F: FlashDevice>(&mut self, map: &PartitionMap, flash: &mut F, id: PartitionId) -> bool {
        if !map.is_valid(id) {
            return false;
        }
        let mut ctx = PartitionContext::new(id, map.record(id));
        let result = match self.policy {
            StagingPolicy::DoubleBuffered => {
                self.scratch.fill_blank();
                Ok(())
            }
            StagingPolicy::Incremental => map.erase(flash, id),
        };
        match result {
            Ok(()) => {
                ctx.prepared = true;
                ctx.last_status = 0;
            }
            Err(status) => {
                ctx.prepared = false;
                ctx.last_status = status;
            }
        }
        self.commit_state = CommitState::NotBegun;
        let prepared = ctx.prepared;
        self.active = Some(ctx);
        prepared
    }

    pub fn poll_prepare(&self) -> PreparePoll {
        match &self.active {
            Some(ctx) if ctx.prepared => PreparePoll::Ready,
            Some(ctx) => PreparePoll::Failed(ctx.last_status),
            None => PreparePoll::Failed(0),
        }
    }

    pub fn write_chunk<F: FlashDevice>(
        &mut self,
        map: &PartitionMap,
        flash: &mut F,
        start_word: u32,
        data_be: &[u8],
    ) -> Result<(), PartitionAccessError> {
        let policy = self.policy;
        let Some(ctx) = self.active.as_mut() else {
            return Err(PartitionAccessError::NoActivePartition);
        };
        if ctx.programmed {
            return Err(PartitionAccessError::WriteProtected);
        }
        map.program_memory_write(flash, ctx, &mut self.scratch, policy, start_word, data_be)
    }

    pub fn read_chunk<F: FlashDevice>(
        &self,
        map: &PartitionMap,
        flash: &F,
        word_address: u32,
        out_be: &mut [u8],
    ) -> Result<(), PartitionAccessError> {
        map.program_memory_read(flash, self.active_context(), word_address, out_be)
    }

    /// The CRC the active context would be validated against right now —
    /// over scratch if double-buffered and not yet committed, over flash
    /// otherwise. `None` if no partition is active.
    pub fn calculate_crc<F: FlashDevice, C: Crc16>(
        &self,
        map: &PartitionMap,
        flash: &F,
        crc: &C,
    ) -> Option<u16> {
        let id = self.active_partition()?;
        Some(map.calculate_crc(flash, crc, self.active_context(), id))
    }

    /// Computes the CRC over the staged (or committed) data and compares it
    /// to `expected`. Only if it matches does it go on to erase+copy (or,
    /// under the incremental policy, just write the CRC slot) — all
    /// synchronously, for the same reason `prepare` is synchronous.
    pub fn validate_and_begin_commit<F: FlashDevice, C: Crc16>(
        &mut self,
        map: &PartitionMap,
        flash: &mut F,
        crc: &C,
        expected: u16,
    ) -> bool {
        let Some(id) = self.active_partition() else {
            return false;
        };
        let computed = map.calculate_crc(flash, crc, self.active_context(), id);
        if computed != expected {
            self.commit_state = CommitState::InvalidCrc;
            return false;
        }
        self.commit_state = CommitState::InProgress;

        // The CRC slot is never reachable through ordinary download chunks
        // (`PartitionRecord::contains_range` excludes it); both policies
        // write it here, as the one atomic act of commit.
        let record = map.record(id);
        let result = match self.policy {
            StagingPolicy::DoubleBuffered => map.erase(flash, id).and_then(|()| {
                // Clamped for the same reason as `PartitionMap::calculate_crc`:
                // `scratch` is fixed-size and may be smaller than the
                // partition on a board that pairs `DoubleBuffered` with a
                // partition larger than `SCRATCH_WORDS`.
                let data_words = (record.data_word_count() as usize).min(self.scratch.words().len());
                flash.write_words(record.start_word, &self.scratch.words()[..data_words])?;
                flash.write_words(record.crc_slot_word, &[expected])
            }),
            StagingPolicy::Incremental => flash.write_words(record.crc_slot_word, &[expected]),
        };

        let ctx = self.active.as_mut().expect("active partition checked above");
        match result {
            Ok(()) => {
                ctx.programmed = true;
                ctx.last_status = 0;
                self.commit_state = CommitState::Succeeded;
                true
            }
            Err(status) => {
                ctx.last_status = status;
                self.commit_state = CommitState::Failed(status);
                false
            }
        }
    }

    pub fn poll_commit(&self) -> CommitPoll {
        let Some(ctx) = self.active.as_ref() else {
            return CommitPoll::Failed(0);
        };
        if ctx.programmed {
            return CommitPoll::Done;
        }
        match self.commit_state {
            CommitState::InProgress => CommitPoll::InProgress,
            CommitState::InvalidCrc => CommitPoll::VerifyFailed,
            CommitState::Failed(status) => CommitPoll::Failed(status),
            CommitState::NotBegun | CommitState::Succeeded => CommitPoll::Failed(ctx.last_status),
        }
    }

    /// Retired on reset, jump, or the next `prepare` call (which replaces
    /// `self.active` outright); exposed separately so the dispatcher can
    /// retire the context without starting a new one.
    pub fn retire(&mut self) {
        self.active = None;
        self.commit_state = CommitState::NotBegun;
    }
}
