// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Thread Interrupt Management Area MMIO.
//!
//! The TIMA exposes the thread context registers through four page
//! views (HW, HV, OS, User), each with its own per-byte access rights.
//! The context is mapped twice within each page: accesses below 2K read
//! and write the raw register values, accesses above 2K are special
//! operations with side effects, dispatched by exact (page, offset,
//! size) match. Accesses from a more privileged page are allowed to use
//! the operations of a less privileged one.

use log::warn;

use crate::regs::*;
use crate::router::{need_resend, XiveRouter};
use crate::tctx::{Ring, Tctx};

// Register accessibility bits of the four page views:
//
//    0x0 - no access
//    0x1 - write only
//    0x2 - read only
//    0x3 - read/write

#[rustfmt::skip]
const TM_HW_VIEW: [u8; 64] = [
    3, 0, 0, 0,   0, 0, 0, 0,   3, 3, 3, 3,   0, 0, 0, 0, /* QW-0 User */
    3, 3, 3, 3,   3, 3, 0, 2,   3, 3, 3, 3,   0, 0, 0, 0, /* QW-1 OS   */
    0, 0, 3, 3,   0, 3, 3, 0,   3, 3, 3, 3,   0, 0, 0, 0, /* QW-2 POOL */
    3, 3, 3, 3,   0, 3, 0, 2,   3, 0, 0, 3,   3, 3, 3, 0, /* QW-3 PHYS */
];

#[rustfmt::skip]
const TM_HV_VIEW: [u8; 64] = [
    3, 0, 0, 0,   0, 0, 0, 0,   3, 3, 3, 3,   0, 0, 0, 0, /* QW-0 User */
    3, 3, 3, 3,   3, 3, 0, 2,   3, 3, 3, 3,   0, 0, 0, 0, /* QW-1 OS   */
    0, 0, 3, 3,   0, 3, 3, 0,   0, 3, 3, 3,   0, 0, 0, 0, /* QW-2 POOL */
    3, 3, 3, 3,   0, 3, 0, 2,   3, 0, 0, 3,   0, 0, 0, 0, /* QW-3 PHYS */
];

#[rustfmt::skip]
const TM_OS_VIEW: [u8; 64] = [
    3, 0, 0, 0,   0, 0, 0, 0,   3, 3, 3, 3,   0, 0, 0, 0, /* QW-0 User */
    2, 3, 2, 2,   2, 2, 0, 2,   0, 0, 0, 0,   0, 0, 0, 0, /* QW-1 OS   */
    0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0, /* QW-2 POOL */
    0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0, /* QW-3 PHYS */
];

#[rustfmt::skip]
const TM_USER_VIEW: [u8; 64] = [
    3, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0, /* QW-0 User */
    0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0, /* QW-1 OS   */
    0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0, /* QW-2 POOL */
    0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0,   0, 0, 0, 0, /* QW-3 PHYS */
];

const TM_VIEWS: [&[u8; 64]; 4] = [&TM_HW_VIEW, &TM_HV_VIEW, &TM_OS_VIEW, &TM_USER_VIEW];

/// Computes a register access mask for a given offset in the TIMA.
fn tm_mask(offset: u64, size: usize, write: bool) -> u64 {
    let page_offset = ((offset >> TM_SHIFT) & 0x3) as usize;
    let reg_offset = (offset & TM_REG_OFFSET) as usize;
    let reg_mask = if write { 0x1 } else { 0x2 };
    let mut mask: u64 = 0;

    for i in 0..size {
        if TM_VIEWS[page_offset][reg_offset + i] & reg_mask != 0 {
            mask |= 0xffu64 << (8 * (size - i - 1));
        }
    }

    mask
}

/// Raw store of the register values, filtering out reserved bytes. Only
/// 4 and 8 byte stores are allowed and the User ring is excluded.
pub(crate) fn raw_write(tctx: &mut Tctx, offset: u64, value: u64, size: usize) {
    let ring_offset = offset & TM_RING_OFFSET;
    let reg_offset = (offset & TM_REG_OFFSET) as usize;
    let mask = tm_mask(offset, size, true);

    if size < 4 || mask == 0 || ring_offset == TM_QW0_USER as u64 {
        warn!("XIVE: invalid write access at TIMA @0x{:x}", offset);
        return;
    }

    for i in 0..size {
        let byte_mask = (mask >> (8 * (size - i - 1))) as u8;
        if byte_mask != 0 {
            tctx.regs[reg_offset + i] = (value >> (8 * (size - i - 1))) as u8 & byte_mask;
        }
    }
}

/// Raw load of the register values, reserved bytes read as zero. Only 4
/// and 8 byte loads are allowed and the User ring is excluded.
pub(crate) fn raw_read(tctx: &Tctx, offset: u64, size: usize) -> u64 {
    let ring_offset = offset & TM_RING_OFFSET;
    let reg_offset = (offset & TM_REG_OFFSET) as usize;
    let mask = tm_mask(offset, size, false);

    if size < 4 || mask == 0 || ring_offset == TM_QW0_USER as u64 {
        warn!("XIVE: invalid read access at TIMA @0x{:x}", offset);
        return u64::MAX;
    }

    let mut ret: u64 = 0;
    for i in 0..size {
        ret |= (tctx.regs[reg_offset + i] as u64) << (8 * (size - i - 1));
    }

    ret & mask
}

/// One entry of a special-operation dispatch table.
pub(crate) struct TmOp<W, R> {
    pub page: u8,
    pub offset: u64,
    pub size: usize,
    pub write: Option<W>,
    pub read: Option<R>,
}

/// Looks up the operation matching an access. Accesses done from a more
/// privileged TIMA page are allowed.
pub(crate) fn find_op<W: Copy, R: Copy>(
    ops: &[TmOp<W, R>],
    offset: u64,
    size: usize,
    write: bool,
) -> Option<&TmOp<W, R>> {
    let page_offset = ((offset >> TM_SHIFT) & 0x3) as u8;
    let op_offset = offset & TM_ADDRESS_MASK;

    ops.iter().find(|op| {
        op.page >= page_offset
            && op.offset == op_offset
            && op.size == size
            && (if write {
                op.write.is_some()
            } else {
                op.read.is_some()
            })
    })
}

#[derive(Clone, Copy)]
enum TmWriteOp {
    SetOsCppr,
    PushOsCtx,
    SetHvCppr,
    VtPush,
    SetOsPending,
}

#[derive(Clone, Copy)]
enum TmReadOp {
    VtPoll,
    AckOsReg,
    PullOsCtx,
    AckHvReg,
    PullPoolCtx,
    PullPhysCtx,
}

/// Generation 1 special operations.
#[rustfmt::skip]
static TM_OPERATIONS: &[TmOp<TmWriteOp, TmReadOp>] = &[
    // MMIOs below 2K: raw values and special operations without side
    // effects
    TmOp { page: TM_OS_PAGE, offset: (TM_QW1_OS + TM_CPPR) as u64,       size: 1,
           write: Some(TmWriteOp::SetOsCppr), read: None },
    TmOp { page: TM_HV_PAGE, offset: (TM_QW1_OS + TM_WORD2) as u64,      size: 4,
           write: Some(TmWriteOp::PushOsCtx), read: None },
    TmOp { page: TM_HV_PAGE, offset: (TM_QW3_HV_PHYS + TM_CPPR) as u64,  size: 1,
           write: Some(TmWriteOp::SetHvCppr), read: None },
    TmOp { page: TM_HV_PAGE, offset: (TM_QW3_HV_PHYS + TM_WORD2) as u64, size: 1,
           write: Some(TmWriteOp::VtPush), read: None },
    TmOp { page: TM_HV_PAGE, offset: (TM_QW3_HV_PHYS + TM_WORD2) as u64, size: 1,
           write: None, read: Some(TmReadOp::VtPoll) },

    // MMIOs above 2K: special operations with side effects
    TmOp { page: TM_OS_PAGE, offset: TM_SPC_ACK_OS_REG,     size: 2,
           write: None, read: Some(TmReadOp::AckOsReg) },
    TmOp { page: TM_OS_PAGE, offset: TM_SPC_SET_OS_PENDING, size: 1,
           write: Some(TmWriteOp::SetOsPending), read: None },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_OS_CTX,    size: 4,
           write: None, read: Some(TmReadOp::PullOsCtx) },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_OS_CTX,    size: 8,
           write: None, read: Some(TmReadOp::PullOsCtx) },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_ACK_HV_REG,     size: 2,
           write: None, read: Some(TmReadOp::AckHvReg) },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_POOL_CTX,  size: 4,
           write: None, read: Some(TmReadOp::PullPoolCtx) },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_POOL_CTX,  size: 8,
           write: None, read: Some(TmReadOp::PullPoolCtx) },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_PHYS_CTX,  size: 1,
           write: None, read: Some(TmReadOp::PullPhysCtx) },
];

fn os_cam_decode(cam: u32) -> (u8, u32, bool) {
    (
        nvt_cam_blk(cam),
        nvt_cam_idx(cam),
        cam & TM_QW1W2_VO != 0,
    )
}

/// Pulls the OS context: the CAM line is invalidated and the previous
/// word returned to the guest.
pub(crate) fn pull_os_ctx(tctx: &mut Tctx) -> u64 {
    let qw1w2 = tctx.word2(Ring::Os);
    let (nvt_blk, nvt_idx, vo) = os_cam_decode(qw1w2);

    if !vo {
        warn!("XIVE: pulling invalid NVT {:x}/{:x} !?", nvt_blk, nvt_idx);
    }

    tctx.set_word2(Ring::Os, qw1w2 & !TM_QW1W2_VO);
    tctx.reset_signal(Ring::Os);
    qw1w2 as u64
}

pub(crate) fn pull_pool_ctx(tctx: &mut Tctx) -> u64 {
    let qw2w2 = tctx.word2(Ring::HvPool);
    tctx.set_word2(Ring::HvPool, qw2w2 & !TM_QW2W2_VP);
    tctx.reset_signal(Ring::HvPool);
    qw2w2 as u64
}

pub(crate) fn pull_phys_ctx(tctx: &mut Tctx) -> u64 {
    let qw3b8 = tctx.reg(Ring::HvPhys, TM_WORD2);
    tctx.set_reg(Ring::HvPhys, TM_WORD2, qw3b8 & !TM_QW3B8_VT);
    tctx.reset_signal(Ring::HvPhys);
    qw3b8 as u64
}

/// Pushes a new OS context: updating the CAM line can trigger a resend
/// of the interrupts accumulated for the VP while it was not resident.
fn push_os_ctx(xrtr: &mut dyn XiveRouter, tctx: &mut Tctx, cam: u32) {
    let (nvt_blk, nvt_idx, vo) = os_cam_decode(cam);

    // First update the registers
    tctx.set_word2(Ring::Os, cam);

    // Then check the interrupt pending bits
    if vo {
        need_resend(xrtr, tctx, nvt_blk, nvt_idx);
    }
}

/// TIMA store handler for generation 1 presenters.
pub fn tm_write(
    xrtr: &mut dyn XiveRouter,
    tctx: &mut Tctx,
    offset: u64,
    value: u64,
    size: usize,
) {
    // Check for special operations in the 2K region, then in the
    // region below 2K.
    let op = find_op(TM_OPERATIONS, offset, size, true);
    if offset & TM_SPECIAL_OP != 0 && op.is_none() {
        warn!("XIVE: invalid write access at TIMA @0x{:x}", offset);
        return;
    }

    if let Some(op) = op {
        match op.write.unwrap() {
            TmWriteOp::SetOsCppr => tctx.set_cppr(Ring::Os, (value & 0xff) as u8),
            TmWriteOp::SetHvCppr => tctx.set_cppr(Ring::HvPhys, (value & 0xff) as u8),
            TmWriteOp::VtPush => tctx.set_reg(Ring::HvPhys, TM_WORD2, (value & 0xff) as u8),
            TmWriteOp::SetOsPending => tctx.pipr_update(Ring::Os, (value & 0xff) as u8, 0),
            TmWriteOp::PushOsCtx => push_os_ctx(xrtr, tctx, value as u32),
        }
        return;
    }

    // Finish with raw access to the register values
    raw_write(tctx, offset, value, size);
}

/// TIMA load handler for generation 1 presenters.
pub fn tm_read(
    _xrtr: &mut dyn XiveRouter,
    tctx: &mut Tctx,
    offset: u64,
    size: usize,
) -> u64 {
    let op = find_op(TM_OPERATIONS, offset, size, false);
    if offset & TM_SPECIAL_OP != 0 && op.is_none() {
        warn!("XIVE: invalid read access to TIMA @0x{:x}", offset);
        return u64::MAX;
    }

    if let Some(op) = op {
        return match op.read.unwrap() {
            TmReadOp::AckOsReg => tctx.accept(Ring::Os),
            TmReadOp::AckHvReg => tctx.accept(Ring::HvPhys),
            TmReadOp::PullOsCtx => pull_os_ctx(tctx),
            TmReadOp::PullPoolCtx => pull_pool_ctx(tctx),
            TmReadOp::PullPhysCtx => pull_phys_ctx(tctx),
            TmReadOp::VtPoll => tctx.reg(Ring::HvPhys, TM_WORD2) as u64,
        };
    }

    raw_read(tctx, offset, size)
}
