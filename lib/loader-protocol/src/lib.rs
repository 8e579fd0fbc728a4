// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The opcode dispatcher, loader state machine, and per-opcode handlers.
//!
//! This is the piece the legacy contract spread across `main.c`'s giant
//! `switch` and a handful of file-scope globals. Here it is one pure
//! function, [`dispatch`], that takes a decoded [`Frame`] and a
//! [`LoaderContext`] and returns a [`DispatchOutcome`]: the reply to send
//! (if any), any flash work to perform only *after* that reply is on the
//! wire, and what the surrounding loop should do next.

#![cfg_attr(not(test), no_std)]

use arrayvec::ArrayVec;
use loader_crc::Crc16;
use loader_frame::{AddressFilter, Frame};
use loader_partition::{
    FlashDevice, PartitionAccessError, PartitionId, PartitionMap, StagingPolicy,
};
use loader_time::{Clock, Timer};
use loader_update::{CommitPoll, PreparePoll, UpdateEngine};
use num_derive::{FromPrimitive, ToPrimitive};
use ringbuf::*;

pub const WAITING_GOOD_CRC_TIMEOUT_MS: u32 = 5_000;
pub const WAITING_BAD_CRC_TIMEOUT_MS: u32 = 120_000;
pub const LOADER_MODE_TIMEOUT_MS: u32 = 120_000;
pub const RESET_DRAIN_MS: u32 = 500;
pub const TRANSMIT_TURNAROUND_MS: u32 = 8;

/// Response status codes (and, on a request, the opcode byte occupies the
/// same wire position). Values match the legacy wire contract exactly;
/// this is not a value the core is free to renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    InvalidOpcode = 2,
    InvalidMessage = 3,
    Timeout = 4,
    CanLength = 5,
    FormatInProgress = 6,
    CannotFormat = 7,
    WrongParameterCount = 9,
    CanChecksum = 10,
    ParameterOutOfRange = 27,
    VerifyFailed = 29,
}

/// The eight-state progression from idle through activated, downloading or
/// uploading, preparing, and programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Waiting,
    Activated,
    Downloading,
    Uploading,
    Preparing,
    ScratchPrepared,
    Programming,
    DoneProgramming,
}

/// Which build-time policy governs a field-upgrade of the bootloader
/// partition, and whether the loader falls through to the application on a
/// bad application CRC rather than resetting.
#[derive(Debug, Clone, Copy)]
pub struct IdentityConfig {
    /// Left-padded with spaces to exactly 6 ASCII bytes, e.g. `*b"XPB   "`.
    pub variant_tag: [u8; 6],
    pub major_version: u16,
    pub minor_version: u16,
    pub baseline: Baseline,
    pub build_number: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Baseline {
    Alpha,
    Beta,
    Commercial,
}

impl Baseline {
    fn as_byte(self) -> u8 {
        match self {
            Baseline::Alpha => b'A',
            Baseline::Beta => b'B',
            Baseline::Commercial => b'C',
        }
    }
}

/// The build-time description of one tool variant: its bus addresses,
/// partition layout, staging policy, and the handful of policy flags the
/// original source expressed as `#define`s. Exactly one of these exists
/// per shipped binary; the protocol engine is generic over it rather than
/// baking any of it in as a `const`.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    pub primary_address: u8,
    pub alternate_address: u8,
    /// Compiled out by default (REDESIGN FLAGS / Open Question (c)); `Some`
    /// only on a build that has explicitly opted in.
    pub broadcast_address: Option<u8>,
    pub partition_map: PartitionMap,
    pub staging_policy: StagingPolicy,
    pub jump_to_app_with_bad_crc: bool,
    pub identity: IdentityConfig,
}

impl BoardConfig {
    pub fn address_filter(&self) -> AddressFilter {
        AddressFilter {
            primary: self.primary_address,
            alternate: self.alternate_address,
            broadcast: self.broadcast_address,
        }
    }
}

/// The boolean result (and raw CRC) of checking one image against its CRC
/// slot at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCheck {
    pub valid: bool,
    pub actual_crc: u16,
}

/// The self-test performed once, at loader entry: CRC the bootloader and
/// application regions and compare each to its own CRC slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfTestResult {
    pub boot: ImageCheck,
    pub app: ImageCheck,
}

fn check_image<F: FlashDevice, C: Crc16>(
    flash: &F,
    crc: &C,
    map: &PartitionMap,
    id: PartitionId,
) -> ImageCheck {
    let actual = map.calculate_crc(flash, crc, None, id);
    let expected = map.expected_crc(flash, id);
    ImageCheck { valid: actual == expected, actual_crc: actual }
}

/// Runs the C7 self-test: CRCs the bootloader and application regions.
/// Called once at loader entry; the result is cached in [`LoaderContext`]
/// for the rest of the boot session rather than recomputed per request.
pub fn self_test<F: FlashDevice, C: Crc16>(flash: &F, crc: &C, map: &PartitionMap) -> SelfTestResult {
    SelfTestResult {
        boot: check_image(flash, crc, map, PartitionId::Boot),
        app: check_image(flash, crc, map, PartitionId::Application),
    }
}

/// The initial `Waiting`-state timeout, chosen by the application image's
/// CRC validity at boot: short if the application looks good (so a
/// surface that wants to intervene must be quick), long if it looks bad
/// (generous time for a reflash).
pub fn initial_waiting_timeout_ms(result: &SelfTestResult) -> u32 {
    if result.app.valid {
        WAITING_GOOD_CRC_TIMEOUT_MS
    } else {
        WAITING_BAD_CRC_TIMEOUT_MS
    }
}

/// What the main loop should do when it is outside `Waiting` or when the
/// `Waiting` timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Continue,
    /// Jump to the application entry point (a word address, matching the
    /// wire convention the rest of the partition engine uses).
    JumpToApp(u32),
    Reset,
}

/// The disposition when the `Waiting` timer expires with nothing having
/// activated the loader: jump to the application if its CRC is good, or if
/// the build has opted in to jumping anyway; otherwise a clean reset so the
/// next boot re-runs the self-test.
pub fn waiting_timeout_disposition(result: &SelfTestResult, board: &BoardConfig) -> LoopOutcome {
    if result.app.valid || board.jump_to_app_with_bad_crc {
        LoopOutcome::JumpToApp(board.partition_map.record(PartitionId::Application).start_word)
    } else {
        LoopOutcome::Reset
    }
}

/// Work that must happen only *after* the reply for this request is
/// already on the wire, because it can take seconds (a flash erase or a
/// double-buffered commit copy). The surface is required to poll opcode
/// 39 subfield 1 to observe completion; see [`LoaderContext::poll_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferred {
    None,
    Prepare(PartitionId),
    Commit(u16),
}

/// A response frame's payload, sized to the largest single reply this
/// core ever sends (an upload chunk, at most 255 bytes).
pub const MAX_REPLY_PAYLOAD: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u8,
    pub payload: ArrayVec<u8, MAX_REPLY_PAYLOAD>,
}

impl Reply {
    fn status(status: Status) -> Self {
        Reply { code: status as u8, payload: ArrayVec::new() }
    }

    fn status_with(status: Status, bytes: &[u8]) -> Self {
        let mut payload = ArrayVec::new();
        for &b in bytes {
            let _ = payload.try_push(b);
        }
        Reply { code: status as u8, payload }
    }

    fn ok() -> Self {
        Self::status(Status::Ok)
    }

    fn ok_with(bytes: &[u8]) -> Self {
        Self::status_with(Status::Ok, bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// `None` only for opcode 255, the reserved debug-side-channel no-op,
    /// which must never provoke a reply.
    pub reply: Option<Reply>,
    pub deferred: Deferred,
    pub outcome: LoopOutcome,
}

fn no_change(reply: Reply) -> DispatchOutcome {
    DispatchOutcome { reply: Some(reply), deferred: Deferred::None, outcome: LoopOutcome::Continue }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Trace {
    StateChange(LoaderStateTag, LoaderStateTag),
    FrameIn(u8),
    InvalidOpcodeInState(u8),
    PrepareBegin(u8),
    CommitBegin,
    None,
}

#[derive(Copy, Clone, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
enum LoaderStateTag {
    Waiting,
    Activated,
    Downloading,
    Uploading,
    Preparing,
    ScratchPrepared,
    Programming,
    DoneProgramming,
}

impl From<LoaderState> for LoaderStateTag {
    fn from(s: LoaderState) -> Self {
        match s {
            LoaderState::Waiting => LoaderStateTag::Waiting,
            LoaderState::Activated => LoaderStateTag::Activated,
            LoaderState::Downloading => LoaderStateTag::Downloading,
            LoaderState::Uploading => LoaderStateTag::Uploading,
            LoaderState::Preparing => LoaderStateTag::Preparing,
            LoaderState::ScratchPrepared => LoaderStateTag::ScratchPrepared,
            LoaderState::Programming => LoaderStateTag::Programming,
            LoaderState::DoneProgramming => LoaderStateTag::DoneProgramming,
        }
    }
}

ringbuf!(Trace, 64, Trace::None);

/// The mutable protocol state that persists across every request in a boot
/// session: the state machine's current state, the partition-update
/// engine, the overall loader timer, and the cached self-test result.
pub struct LoaderContext<'a> {
    pub board: &'a BoardConfig,
    pub state: LoaderState,
    pub engine: UpdateEngine,
    pub loader_timer: Timer,
    pub self_test: SelfTestResult,
}

impl<'a> LoaderContext<'a> {
    pub fn new(board: &'a BoardConfig, self_test: SelfTestResult, clock: &impl Clock) -> Self {
        let timeout = initial_waiting_timeout_ms(&self_test);
        LoaderContext {
            board,
            state: LoaderState::Waiting,
            engine: UpdateEngine::new(board.staging_policy),
            loader_timer: Timer::arm(clock, timeout),
            self_test,
        }
    }

    fn set_state(&mut self, next: LoaderState) {
        if next != self.state {
            ringbuf_entry!(Trace::StateChange(self.state.into(), next.into()));
        }
        self.state = next;
    }

    /// Per the overall-timer invariant: once the loader has left
    /// `Waiting`, every accepted opcode rearms the loader-mode timeout.
    /// `Waiting` itself keeps counting down against the self-test-chosen
    /// initial timeout until opcode 0 activates the loader.
    fn touch_timer(&mut self, clock: &impl Clock) {
        if self.state != LoaderState::Waiting {
            self.loader_timer.rearm(clock, LOADER_MODE_TIMEOUT_MS);
        }
    }

    /// Runs whatever [`Deferred`] work a previous `dispatch` call asked
    /// for, after the caller has already put that call's reply on the
    /// wire. Safe to call with `Deferred::None`.
    pub fn run_deferred<F: FlashDevice, C: Crc16>(
        &mut self,
        flash: &mut F,
        crc: &C,
        deferred: Deferred,
    ) {
        match deferred {
            Deferred::None => {}
            Deferred::Prepare(id) => {
                self.engine.prepare(&self.board.partition_map, flash, id);
            }
            Deferred::Commit(expected) => {
                self.engine.validate_and_begin_commit(
                    &self.board.partition_map,
                    flash,
                    crc,
                    expected,
                );
            }
        }
    }
}

fn parse_u32_le(bytes: &[u8]) -> Option<u32> {
    if bytes.len() != 4 {
        return None;
    }
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn handle_activate(ctx: &mut LoaderContext<'_>, clock: &impl Clock) -> DispatchOutcome {
    if !matches!(ctx.state, LoaderState::Waiting | LoaderState::Activated) {
        return invalid_opcode(ctx, 0);
    }
    ctx.set_state(LoaderState::Activated);
    ctx.loader_timer.rearm(clock, LOADER_MODE_TIMEOUT_MS);
    no_change(Reply::ok())
}

fn handle_jump(payload: &[u8]) -> DispatchOutcome {
    let Some(addr) = parse_u32_le(payload) else {
        return no_change(Reply::status(Status::WrongParameterCount));
    };
    DispatchOutcome {
        reply: Some(Reply::ok()),
        deferred: Deferred::None,
        outcome: LoopOutcome::JumpToApp(addr),
    }
}

fn identity_bytes(board: &BoardConfig, self_test: &SelfTestResult) -> [u8; 19] {
    let mut out = [0u8; 19];
    let subtype: &[u8; 3] = if self_test.boot.valid && self_test.app.valid { b"BL " } else { b"bE " };
    out[0..3].copy_from_slice(subtype);
    out[3..9].copy_from_slice(&board.identity.variant_tag);
    write_decimal3(&mut out[9..12], board.identity.major_version);
    write_decimal3(&mut out[12..15], board.identity.minor_version);
    out[15] = board.identity.baseline.as_byte();
    write_decimal3(&mut out[16..19], board.identity.build_number);
    out
}

fn write_decimal3(out: &mut [u8], value: u16) {
    let v = value.min(999);
    out[0] = b'0' + (v / 100) as u8;
    out[1] = b'0' + ((v / 10) % 10) as u8;
    out[2] = b'0' + (v % 10) as u8;
}

fn handle_identify(ctx: &LoaderContext<'_>) -> DispatchOutcome {
    let bytes = identity_bytes(ctx.board, &ctx.self_test);
    no_change(Reply::ok_with(&bytes))
}

fn handle_self_test_status(ctx: &LoaderContext<'_>) -> DispatchOutcome {
    let mut payload = ArrayVec::<u8, MAX_REPLY_PAYLOAD>::new();
    let _ = payload.try_push(ctx.self_test.boot.valid as u8);
    let crc = ctx.self_test.boot.actual_crc.to_le_bytes();
    let _ = payload.try_push(crc[0]);
    let _ = payload.try_push(crc[1]);
    let _ = payload.try_push(ctx.self_test.app.valid as u8);
    let crc = ctx.self_test.app.actual_crc.to_le_bytes();
    let _ = payload.try_push(crc[0]);
    let _ = payload.try_push(crc[1]);
    // Serial-port self-test is not exercised in this core; 0 = untested.
    let _ = payload.try_push(0);
    no_change(Reply { code: Status::Ok as u8, payload })
}

fn invalid_opcode(_ctx: &mut LoaderContext<'_>, opcode: u8) -> DispatchOutcome {
    ringbuf_entry!(Trace::InvalidOpcodeInState(opcode));
    no_change(Reply::status(Status::InvalidOpcode))
}

fn handle_download<F: FlashDevice>(
    ctx: &mut LoaderContext<'_>,
    flash: &mut F,
    payload: &[u8],
) -> DispatchOutcome {
    if !matches!(ctx.state, LoaderState::ScratchPrepared | LoaderState::Downloading) {
        return invalid_opcode(ctx, 37);
    }
    if payload.len() < 5 {
        return no_change(Reply::status(Status::WrongParameterCount));
    }
    let addr = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let chunk_len = payload[4] as usize;
    if payload.len() != 5 + chunk_len {
        return no_change(Reply::status(Status::WrongParameterCount));
    }
    let data = &payload[5..];
    let result = ctx.engine.write_chunk(&ctx.board.partition_map, flash, addr, data);
    match result {
        Ok(()) => {
            ctx.set_state(LoaderState::Downloading);
            no_change(Reply::ok())
        }
        Err(PartitionAccessError::OutOfRange) => {
            no_change(Reply::status(Status::ParameterOutOfRange))
        }
        Err(PartitionAccessError::WriteProtected) => {
            no_change(Reply::status(Status::CannotFormat))
        }
        Err(PartitionAccessError::Flash(status)) => {
            no_change(Reply::status_with(Status::CannotFormat, &[status as u8]))
        }
        Err(PartitionAccessError::NoActivePartition) => {
            invalid_opcode(ctx, 37)
        }
    }
}

pub const MAX_UPLOAD_BYTES: usize = 255;

fn handle_upload<F: FlashDevice>(
    ctx: &mut LoaderContext<'_>,
    flash: &F,
    payload: &[u8],
) -> DispatchOutcome {
    // opcode038.c accepts this from ACTIVATED and DOWNLOADING as well as
    // UPLOADING itself — a verify-only upload is legal mid-download.
    if !matches!(
        ctx.state,
        LoaderState::Activated | LoaderState::Downloading | LoaderState::Uploading
    ) {
        return invalid_opcode(ctx, 38);
    }
    if payload.len() != 5 {
        return no_change(Reply::status(Status::WrongParameterCount));
    }
    let addr = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let len = payload[4] as usize;
    let mut out = [0u8; MAX_UPLOAD_BYTES];
    match ctx.engine.read_chunk(&ctx.board.partition_map, flash, addr, &mut out[..len]) {
        Ok(()) => {
            ctx.set_state(LoaderState::Uploading);
            no_change(Reply::ok_with(&out[..len]))
        }
        Err(_) => no_change(Reply::status(Status::ParameterOutOfRange)),
    }
}

fn handle_unprotect(ctx: &mut LoaderContext<'_>, payload: &[u8]) -> DispatchOutcome {
    if payload.len() != 3 {
        return no_change(Reply::status(Status::WrongParameterCount));
    }
    let subfield = payload[0];
    match subfield {
        0 => handle_prepare_subfield(ctx, payload),
        1 => handle_poll_subfield(ctx),
        2 => handle_commit_subfield(ctx, payload),
        _ => no_change(Reply::status(Status::ParameterOutOfRange)),
    }
}

fn handle_prepare_subfield(ctx: &mut LoaderContext<'_>, payload: &[u8]) -> DispatchOutcome {
    if ctx.state != LoaderState::Activated {
        return invalid_opcode(ctx, 39);
    }
    let id_raw = u16::from_le_bytes([payload[1], payload[2]]);
    let id: Option<PartitionId> = num_traits::FromPrimitive::from_u16(id_raw);
    let Some(id) = id else {
        return no_change(Reply::status(Status::ParameterOutOfRange));
    };
    if !ctx.board.partition_map.is_valid(id) {
        return no_change(Reply::status(Status::ParameterOutOfRange));
    }
    ctx.set_state(LoaderState::Preparing);
    ringbuf_entry!(Trace::PrepareBegin(id_raw as u8));
    DispatchOutcome {
        reply: Some(Reply::ok()),
        deferred: Deferred::Prepare(id),
        outcome: LoopOutcome::Continue,
    }
}

fn handle_poll_subfield(ctx: &mut LoaderContext<'_>) -> DispatchOutcome {
    if ctx.engine.was_programmed() {
        ctx.set_state(LoaderState::DoneProgramming);
        return no_change(Reply::ok());
    }
    if ctx.state == LoaderState::Preparing {
        return match ctx.engine.poll_prepare() {
            PreparePoll::Ready => {
                ctx.set_state(LoaderState::ScratchPrepared);
                no_change(Reply::ok())
            }
            PreparePoll::Failed(status) => {
                no_change(Reply::status_with(Status::CannotFormat, &[status as u8]))
            }
        };
    }
    // Any other state (including polling before a partition was ever
    // unprotected, e.g. while `Activated`) falls through to the commit
    // engine's own view, which gracefully reports "nothing to report" via
    // `CommitPoll::Failed(0)` when no partition is active.
    match ctx.engine.poll_commit() {
        CommitPoll::Done => {
            ctx.set_state(LoaderState::DoneProgramming);
            no_change(Reply::ok())
        }
        CommitPoll::InProgress => no_change(Reply::status(Status::FormatInProgress)),
        CommitPoll::VerifyFailed => no_change(Reply::status(Status::VerifyFailed)),
        CommitPoll::Failed(status) => {
            no_change(Reply::status_with(Status::CannotFormat, &[status as u8]))
        }
    }
}

fn handle_commit_subfield(ctx: &mut LoaderContext<'_>, payload: &[u8]) -> DispatchOutcome {
    if !matches!(ctx.state, LoaderState::Downloading | LoaderState::Uploading) {
        return invalid_opcode(ctx, 39);
    }
    let expected = u16::from_le_bytes([payload[1], payload[2]]);
    ctx.set_state(LoaderState::Programming);
    ringbuf_entry!(Trace::CommitBegin);
    DispatchOutcome {
        reply: Some(Reply::ok()),
        deferred: Deferred::Commit(expected),
        outcome: LoopOutcome::Continue,
    }
}

fn handle_reset() -> DispatchOutcome {
    DispatchOutcome { reply: Some(Reply::ok()), deferred: Deferred::None, outcome: LoopOutcome::Reset }
}

/// Maps a decoded request to its handler, enforcing the state-machine
/// preconditions named in the loader state table before the handler body
/// runs. `flash` is threaded through so download/upload/commit can touch
/// the partition engine; `clock` only matters to the handlers that arm a
/// timer (activate).
pub fn dispatch<F: FlashDevice>(
    ctx: &mut LoaderContext<'_>,
    flash: &mut F,
    clock: &impl Clock,
    frame: &Frame,
) -> DispatchOutcome {
    ringbuf_entry!(Trace::FrameIn(frame.code));
    ctx.touch_timer(clock);

    match frame.code {
        0 => handle_activate(ctx, clock),
        1 => handle_jump(&frame.payload),
        2 | 201 => handle_identify(ctx),
        8 => no_change(Reply::ok_with(&[0, 0, 0, 0])),
        13 => no_change(Reply::ok()),
        16 => no_change(Reply::ok_with(&[0])),
        21 => handle_self_test_status(ctx),
        37 => handle_download(ctx, flash, &frame.payload),
        38 => handle_upload(ctx, flash, &frame.payload),
        39 => handle_unprotect(ctx, &frame.payload),
        46 => no_change(Reply::ok()),
        70 | 211 => handle_reset(),
        191 => no_change(Reply::status(Status::InvalidOpcode)),
        204..=208 | 217 | 219 => no_change(Reply::status(Status::InvalidOpcode)),
        221 => no_change(Reply::ok()),
        255 => DispatchOutcome { reply: None, deferred: Deferred::None, outcome: LoopOutcome::Continue },
        other => invalid_opcode(ctx, other),
    }
}

/// Encodes a [`Reply`] to a wire frame, keyed to this device's primary
/// address (responses are always addressed back to the device's own
/// address, matching the legacy contract's reply framing).
pub fn encode_reply(board: &BoardConfig, reply: &Reply) -> ArrayVec<u8, { loader_frame::MAX_ENCODED_LEN }> {
    loader_frame::encode(board.primary_address, reply.code, &reply.payload)
}
