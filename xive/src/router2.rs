// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! XIVE2 router.
//!
//! The second generation of the engine extends the routing protocol
//! with VP groups and crowds: an END can target a whole group of
//! virtual processors, interrupts with no resident thread accumulate in
//! per-priority NVG/NVC backlog counters, threads advertise their group
//! eligibility through the LGS register, and a pulled context hands its
//! live group exception back to the backlog so another thread can pick
//! it up. Thread contexts can also be saved to and restored from the
//! NVP automatically.

use log::warn;

use crate::esb::pq_trigger;
use crate::field::{get_field32, set_field32};
use crate::regs::*;
use crate::regs2::*;
use crate::router::{lisn_block, lisn_index, MatchOutcome, NvtMatchSpec};
use crate::tctx::{restore_ring, save_ring, Ring, Tctx};
use crate::tima::{find_op, raw_read, raw_write, TmOp};
use crate::{Error, GuestMemoryAtomic, GuestMemoryMmap, PresenterConfig, Result};

/// Table and presenter operations of a generation 2 chip.
pub trait Xive2Router: Send {
    fn get_eas(&mut self, blk: u8, idx: u32) -> Result<Eas2>;
    fn get_pq(&mut self, blk: u8, idx: u32) -> Result<u8>;
    fn set_pq(&mut self, blk: u8, idx: u32, pq: u8) -> Result<()>;
    fn get_end(&mut self, blk: u8, idx: u32) -> Result<End2>;
    fn write_end(&mut self, blk: u8, idx: u32, end: &End2, word: Option<usize>) -> Result<()>;
    fn get_nvp(&mut self, blk: u8, idx: u32) -> Result<Nvp>;
    fn write_nvp(&mut self, blk: u8, idx: u32, nvp: &Nvp, word: Option<usize>) -> Result<()>;
    fn get_nvgc(&mut self, crowd: bool, blk: u8, idx: u32) -> Result<Nvgc>;
    fn write_nvgc(&mut self, crowd: bool, blk: u8, idx: u32, nvgc: &Nvgc) -> Result<()>;

    fn block_id(&self) -> u8;
    fn config(&self) -> PresenterConfig;
    fn memory(&self) -> GuestMemoryAtomic<GuestMemoryMmap>;

    fn match_nvt(&mut self, spec: &NvtMatchSpec) -> Result<MatchOutcome>;
    fn present(&mut self, thread: usize, ring: Ring, priority: u8, group_level: u8);

    /// Advertises a freshly backlogged group interrupt to the eligible
    /// threads, as an LSMFB hint.
    fn broadcast(&mut self, spec: &NvtMatchSpec);

    fn end_notify(&mut self, eas: &Eas2);
}

/// Round-robin presenter scan. Group candidates qualify only when the
/// target ring runs at a less favored priority; a match that cannot
/// take the interrupt now reports the target as precluded. The cursor
/// makes group delivery fair across calls; the caller owns it and
/// resets it on device reset.
pub fn scan_for_match2(
    threads: &[(bool, &Tctx)],
    spec: &NvtMatchSpec,
    cursor: usize,
) -> Result<(MatchOutcome, usize)> {
    let count = threads.len();
    if count == 0 {
        return Ok((MatchOutcome::NotFound, 0));
    }

    let grouped = spec.cam_ignore || spec.crowd;
    let mut found: Option<(usize, Ring)> = None;
    let mut precluded = false;

    for i in 0..count {
        let thread = (cursor + i) % count;
        let (enabled, tctx) = &threads[thread];
        if !enabled {
            continue;
        }

        let Some(ring) = tctx.match_ring2(
            spec.format,
            spec.nvt_blk,
            spec.nvt_idx,
            spec.crowd,
            spec.cam_ignore,
            spec.logic_serv,
        ) else {
            continue;
        };

        if grouped {
            // Group interrupts are delivered to the first thread that
            // can take them now, the others stay candidates.
            let alt = ring.signal_ring();
            if spec.priority < tctx.reg(alt, TM_CPPR) {
                return Ok((MatchOutcome::Found { thread, ring }, thread + 1));
            }
            precluded = true;
        } else {
            if found.is_some() {
                return Err(Error::DuplicateMatch(spec.nvt_blk, spec.nvt_idx));
            }
            found = Some((thread, ring));
        }
    }

    Ok(match found {
        Some((thread, ring)) => (MatchOutcome::Found { thread, ring }, cursor),
        None if precluded => (MatchOutcome::Precluded, cursor),
        None => (MatchOutcome::NotFound, cursor),
    })
}

/// LSMFB hint applied to one thread for a backlogged group interrupt.
pub fn backlog_hint(tctx: &mut Tctx, spec: &NvtMatchSpec) {
    if let Some(ring) = tctx.match_ring2(
        spec.format,
        spec.nvt_blk,
        spec.nvt_idx,
        spec.crowd,
        spec.cam_ignore,
        spec.logic_serv,
    ) {
        if spec.priority < tctx.reg(ring, TM_LSMFB) {
            tctx.set_reg(ring, TM_LSMFB, spec.priority);
        }
    }
}

/// Bumps the backlog counter of a group/crowd target. Returns the new
/// count, or None when the NVGC cannot be used.
fn backlog_incr(
    xrtr: &mut dyn Xive2Router,
    crowd: bool,
    nvx_blk: u8,
    nvx_idx: u32,
    level: u8,
    priority: u8,
) -> Option<u32> {
    let blk = nvc_block(nvx_blk, level);
    let idx = nvgc_index(nvx_idx, level);

    let mut nvgc = match xrtr.get_nvgc(crowd, blk, idx) {
        Ok(nvgc) => nvgc,
        Err(_) => {
            warn!("XIVE: no NVGC {:x}/{:x}", blk, idx);
            return None;
        }
    };
    if !nvgc.is_valid() {
        warn!("XIVE: NVGC {:x}/{:x} is invalid", blk, idx);
        return None;
    }

    let count = nvgc.backlog_add(priority, 1);
    if let Err(e) = xrtr.write_nvgc(crowd, blk, idx, &nvgc) {
        warn!("XIVE: {}", e);
    }
    Some(count)
}

/// Walks the chain of group levels looking for the most favored pending
/// backlogged priority below `bound`. Returns (priority, level) and
/// claims one interrupt from the counter.
fn backlog_scan_claim(
    xrtr: &mut dyn Xive2Router,
    nvx_blk: u8,
    nvx_idx: u32,
    first_group: u8,
    bound: u8,
) -> Option<(u8, u8)> {
    if first_group == 0 {
        return None;
    }

    for priority in 0..=PRIORITY_MAX {
        if priority >= bound {
            break;
        }

        let mut level = first_group & TM_NSR_GRP_LVL;
        while level != 0 {
            let crowd = level_crowd_size(level) != 0;
            let blk = nvc_block(nvx_blk, level);
            let idx = nvgc_index(nvx_idx, level);

            let mut nvgc = match xrtr.get_nvgc(crowd, blk, idx) {
                Ok(nvgc) => nvgc,
                Err(_) => break,
            };
            if !nvgc.is_valid() {
                break;
            }

            if nvgc.backlog(priority) > 0 {
                nvgc.backlog_add(priority, -1);
                if let Err(e) = xrtr.write_nvgc(crowd, blk, idx, &nvgc) {
                    warn!("XIVE: {}", e);
                }
                return Some((priority, level));
            }

            level = nvgc.pgonext() & TM_NSR_GRP_LVL;
        }
    }
    None
}

/// Recomputes the pending state of a ring: local IPB first, then the
/// group backlog when the thread advertises group eligibility through
/// LGS. A backlogged interrupt found there is claimed and presented.
pub fn process_pending(xrtr: &mut dyn Xive2Router, tctx: &mut Tctx, ring: Ring) {
    let alt_ring = ring.signal_ring();

    let mut pipr = ipb_to_pipr(tctx.reg(ring, TM_IPB));
    if ring == Ring::HvPhys && tctx.word2(Ring::HvPool) & TM_QW2W2_VP != 0 {
        pipr = pipr.min(ipb_to_pipr(tctx.reg(Ring::HvPool, TM_IPB)));
    }
    let mut group_level = 0;

    if tctx.is_valid(ring) && tctx.reg(ring, TM_LGS) != 0 {
        let cam = tctx.word2(ring);
        let nvp_blk = nvt_cam_blk(cam);
        let nvp_idx = nvt_cam_idx(cam);

        let first_group = match xrtr.get_nvp(nvp_blk, nvp_idx) {
            Ok(nvp) if nvp.is_valid() => nvp.pgofirst(),
            _ => 0,
        };

        let bound = pipr.min(tctx.reg(alt_ring, TM_CPPR));
        if let Some((priority, level)) =
            backlog_scan_claim(xrtr, nvp_blk, nvp_idx, first_group, bound)
        {
            if priority < tctx.reg(ring, TM_LSMFB) {
                tctx.set_reg(ring, TM_LSMFB, priority);
            }
            pipr = priority;
            group_level = level;
        }
    }

    tctx.set_reg(alt_ring, TM_PIPR, pipr);
    tctx.notify(ring, group_level);
}

/// Generation 2 CPPR update: beyond the local IPB, lowering the gate
/// can uncover a backlogged group interrupt.
pub fn tctx_set_cppr2(xrtr: &mut dyn Xive2Router, tctx: &mut Tctx, ring: Ring, cppr: u8) {
    let cppr = if cppr > PRIORITY_MAX { 0xff } else { cppr };
    tctx.set_reg(ring, TM_CPPR, cppr);
    process_pending(xrtr, tctx, ring);
}

/// Hands a live group exception back to the group: the backlog counter
/// is re-incremented exactly once and the eligible threads get the
/// LSMFB hint, so a later scan finds the interrupt again.
pub fn redistribute(xrtr: &mut dyn Xive2Router, tctx: &mut Tctx, ring: Ring) {
    let alt_ring = ring.signal_ring();
    let nsr = tctx.reg(alt_ring, TM_NSR);
    let level = nsr & TM_NSR_GRP_LVL;
    if level == 0 {
        return;
    }

    let cam = tctx.word2(ring);
    let nvp_blk = nvt_cam_blk(cam);
    let nvp_idx = nvt_cam_idx(cam);
    let priority = tctx.reg(alt_ring, TM_PIPR);
    let crowd = level_crowd_size(level) != 0;

    backlog_incr(xrtr, crowd, nvp_blk, nvp_idx, level, priority);
    xrtr.broadcast(&NvtMatchSpec {
        format: 0,
        nvt_blk: nvp_blk,
        nvt_idx: nvp_idx,
        crowd,
        cam_ignore: true,
        priority,
        logic_serv: 0,
    });

    // The exception is no longer this thread's to take.
    tctx.set_reg(alt_ring, TM_NSR, 0);
    let pipr = ipb_to_pipr(tctx.reg(ring, TM_IPB));
    tctx.set_reg(alt_ring, TM_PIPR, pipr);
    tctx.reset_signal(ring);
}

fn os_cam_decode(cam: u32) -> (u8, u32, bool, bool) {
    (
        nvt_cam_blk(cam),
        nvt_cam_idx(cam),
        cam & TM_QW1W2_VO != 0,
        cam & TM_QW1W2_HO != 0,
    )
}

/// Pushes an OS context, restoring the VP state saved in the NVP when
/// the hardware bit asks for it, and resending the interrupts that
/// accumulated while the VP was not resident.
fn push_os_ctx2(xrtr: &mut dyn Xive2Router, tctx: &mut Tctx, value: u64, size: usize) {
    let cam = if size == 8 {
        (value >> 32) as u32
    } else {
        value as u32
    };
    let (nvp_blk, nvp_idx, vo, ho) = os_cam_decode(cam);

    tctx.set_word2(Ring::Os, cam);

    if !vo {
        return;
    }

    let mut nvp = match xrtr.get_nvp(nvp_blk, nvp_idx) {
        Ok(nvp) => nvp,
        Err(_) => {
            warn!("XIVE: invalid NVP {:x}/{:x}", nvp_blk, nvp_idx);
            return;
        }
    };
    if !nvp.is_valid() {
        warn!("XIVE: invalid NVP {:x}/{:x}", nvp_blk, nvp_idx);
        return;
    }

    if xrtr.config().contains(PresenterConfig::VP_SAVE_RESTORE) && ho {
        // Automatic restore: the ring context comes out of the NVP,
        // which then records the thread checkout.
        restore_ring(tctx, Ring::Os, &nvp);
        nvp.set_ipb(0);
        nvp.set_checked_out(true, tctx.pir as u16);
        if let Err(e) = xrtr.write_nvp(nvp_blk, nvp_idx, &nvp, None) {
            warn!("XIVE: {}", e);
        }
    } else {
        let ipb = nvp.ipb();
        if ipb != 0 {
            nvp.set_ipb(0);
            if let Err(e) = xrtr.write_nvp(nvp_blk, nvp_idx, &nvp, Some(2)) {
                warn!("XIVE: {}", e);
            }
            let merged = tctx.reg(Ring::Os, TM_IPB) | ipb;
            tctx.set_reg(Ring::Os, TM_IPB, merged);
        }
    }

    process_pending(xrtr, tctx, Ring::Os);
}

/// Pulls the OS context. A live group exception is redistributed, and
/// the VP state is saved back into the NVP when save/restore is on.
fn pull_os_ctx2(xrtr: &mut dyn Xive2Router, tctx: &mut Tctx) -> u64 {
    let qw1w2 = tctx.word2(Ring::Os);
    let (nvp_blk, nvp_idx, vo, ho) = os_cam_decode(qw1w2);

    if !vo {
        warn!("XIVE: pulling invalid NVP {:x}/{:x} !?", nvp_blk, nvp_idx);
    }

    if tctx.reg(Ring::Os, TM_NSR) & TM_NSR_GRP_LVL != 0 {
        redistribute(xrtr, tctx, Ring::Os);
    }

    if vo && xrtr.config().contains(PresenterConfig::VP_SAVE_RESTORE) && ho {
        match xrtr.get_nvp(nvp_blk, nvp_idx) {
            Ok(mut nvp) if nvp.is_valid() => {
                save_ring(tctx, Ring::Os, &mut nvp);
                nvp.set_checked_out(false, 0);
                if let Err(e) = xrtr.write_nvp(nvp_blk, nvp_idx, &nvp, None) {
                    warn!("XIVE: {}", e);
                }
            }
            _ => warn!("XIVE: invalid NVP {:x}/{:x}", nvp_blk, nvp_idx),
        }
    }

    tctx.set_word2(Ring::Os, qw1w2 & !(TM_QW1W2_VO | TM_QW1W2_HO));
    tctx.reset_signal(Ring::Os);
    qw1w2 as u64
}

/// An END trigger, either from a source event or from an escalation.
pub fn end_notify2(xrtr: &mut dyn Xive2Router, eas: &Eas2) {
    let end_blk = eas.end_block();
    let end_idx = eas.end_index();
    let end_data = eas.end_data();

    let mut end = match xrtr.get_end(end_blk, end_idx) {
        Ok(end) => end,
        Err(_) => {
            warn!("XIVE: No END {:x}/{:x}", end_blk, end_idx);
            return;
        }
    };

    if !end.is_valid() {
        warn!("XIVE: END {:x}/{:x} is invalid", end_blk, end_idx);
        return;
    }

    if end.is_enqueue() {
        let before = end.qgen();
        end_enqueue2(&xrtr.memory(), &mut end, end_data);
        if end.qgen() != before {
            // Tell the END cache the generation flipped, the queue
            // wrapped behind the guest's back.
            end.set_gen_flipped(true);
        }
        if let Err(e) = xrtr.write_end(end_blk, end_idx, &end, Some(1)) {
            warn!("XIVE: {}", e);
        }
    }

    if !end.is_silent_escalation() && !end_notify_present2(xrtr, end_blk, end_idx, &mut end) {
        return;
    }

    if !end.is_escalate() {
        return;
    }

    if !end.is_uncond_escalation() {
        // ESe[Q]=1: end of escalation
        if !end_es_notify2(xrtr, end_blk, end_idx, &mut end, END2_W1_ESE) {
            return;
        }
    }

    if end.is_escalate_end() {
        // The escalation is routed into another END.
        let (blk, idx, data) = end.escalation_end();
        let esc = Eas2::new(blk, idx, data);
        xrtr.end_notify(&esc);
    } else {
        // Classic escalation: a store-trigger on the configured LISN.
        router2_notify(xrtr, end.escalation_lisn(), false);
    }
}

fn end_es_notify2(
    xrtr: &mut dyn Xive2Router,
    end_blk: u8,
    end_idx: u32,
    end: &mut End2,
    end_esmask: u32,
) -> bool {
    let mut pq = get_field32(end_esmask, end.w[1]) as u8;
    let notify = pq_trigger(&mut pq);

    if pq as u32 != get_field32(end_esmask, end.w[1]) {
        end.w[1] = set_field32(end_esmask, end.w[1], pq as u32);
        if let Err(e) = xrtr.write_end(end_blk, end_idx, end, Some(1)) {
            warn!("XIVE: {}", e);
        }
    }

    notify
}

fn end_enqueue2(mem: &GuestMemoryAtomic<GuestMemoryMmap>, end: &mut End2, data: u32) {
    use byteorder::{BigEndian, ByteOrder};
    use vm_memory::{Bytes, GuestAddress, GuestAddressSpace};

    let qaddr = end.qaddr() + (end.qindex() as u64) * 4;
    let qdata = (end.qgen() << 31) | (data & 0x7fff_ffff);

    let mut bytes = [0u8; 4];
    BigEndian::write_u32(&mut bytes, qdata);
    if mem.memory().write_slice(&bytes, GuestAddress(qaddr)).is_err() {
        warn!("XIVE: failed to write END data @0x{:x}", qaddr);
        return;
    }

    let qindex = (end.qindex() + 1) & (end.qentries() - 1);
    if qindex == 0 {
        end.set_qgen(end.qgen() ^ 1);
    }
    end.set_qindex(qindex);
}

/// The notification half of a generation 2 END trigger. Returns whether
/// the caller should go on and consider escalation.
fn end_notify_present2(
    xrtr: &mut dyn Xive2Router,
    end_blk: u8,
    end_idx: u32,
    end: &mut End2,
) -> bool {
    let format = end.format();
    let priority = end.priority();

    // The END is masked
    if format == 0 && priority == 0xff {
        return false;
    }

    if !end.is_notify() && !end_es_notify2(xrtr, end_blk, end_idx, end, END2_W1_ESN) {
        return false;
    }

    let nvp_blk = end.vp_block();
    let nvp_idx = end.vp_index();
    let crowd = end.is_crowd();
    let cam_ignore = end.is_ignore();

    let mut nvp = match xrtr.get_nvp(nvp_blk, nvp_idx) {
        Ok(nvp) => nvp,
        Err(_) => {
            warn!("XIVE: no NVP {:x}/{:x}", nvp_blk, nvp_idx);
            return true;
        }
    };

    if !nvp.is_valid() {
        warn!("XIVE: NVP {:x}/{:x} is invalid", nvp_blk, nvp_idx);
        return true;
    }

    let spec = NvtMatchSpec {
        format,
        nvt_blk: nvp_blk,
        nvt_idx: nvp_idx,
        crowd,
        cam_ignore,
        priority,
        logic_serv: end.log_server_id(),
    };

    let outcome = match xrtr.match_nvt(&spec) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("XIVE: {}", e);
            return false;
        }
    };

    if let MatchOutcome::Found { thread, ring } = outcome {
        let level = group_level(crowd, cam_ignore, nvp_blk, nvp_idx);
        xrtr.present(thread, ring, priority, level);
        return false;
    }

    if !cam_ignore && !crowd {
        // Specific VP: record the priority in the NVP if backlog is
        // activated; it is resent at the next context push.
        if end.is_backlog() {
            if format == 1 {
                warn!(
                    "XIVE: END {:x}/{:x} invalid config: F1 & backlog",
                    end_blk, end_idx
                );
                return false;
            }
            nvp.set_ipb(nvp.ipb() | priority_to_ipb(priority));
            if let Err(e) = xrtr.write_nvp(nvp_blk, nvp_idx, &nvp, Some(2)) {
                warn!("XIVE: {}", e);
            }
        }
        return true;
    }

    // Group or crowd target: account the interrupt in the backlog. The
    // ordering between the counter update, the broadcast and the
    // escalation fall-through mirrors an intentionally approximate
    // area of the hardware.
    let level = group_level(crowd, cam_ignore, nvp_blk, nvp_idx);
    let count = backlog_incr(xrtr, crowd, nvp_blk, nvp_idx, level, priority);

    if end.is_precluded_escalation() {
        // Precluded escalation skips the broadcast and asks for an
        // escalation right away, even on the first backlogged event.
        return true;
    }

    if count == Some(1) {
        xrtr.broadcast(&spec);
    }

    true
}

/// Router entry point for a generation 2 source event notification.
pub fn router2_notify(xrtr: &mut dyn Xive2Router, lisn: u32, pq_checked: bool) {
    let eas_blk = lisn_block(lisn);
    let eas_idx = lisn_index(lisn);

    let eas = match xrtr.get_eas(eas_blk, eas_idx) {
        Ok(eas) => eas,
        Err(_) => {
            warn!("XIVE: Unknown LISN {:x}", lisn);
            return;
        }
    };

    if !pq_checked {
        let mut pq = match xrtr.get_pq(eas_blk, eas_idx) {
            Ok(pq) => pq,
            Err(e) => {
                warn!("XIVE: {}", e);
                return;
            }
        };

        let notify = pq_trigger(&mut pq);

        if let Err(e) = xrtr.set_pq(eas_blk, eas_idx, pq) {
            warn!("XIVE: {}", e);
            return;
        }

        if !notify {
            return;
        }
    }

    if !eas.is_valid() {
        warn!("XIVE: invalid LISN {:x}", lisn);
        return;
    }

    if eas.is_masked() {
        // Notification completed
        return;
    }

    xrtr.end_notify(&eas);
}

//
// Generation 2 TIMA dispatch
//

#[derive(Clone, Copy)]
enum Tm2WriteOp {
    SetOsCppr,
    PushOsCtx,
    SetOsLgs,
    SetHvCppr,
    VtPush,
    SetHvTarget,
    SetOsPending,
    PullOsCtxOl,
    PullPhysCtxOl,
}

#[derive(Clone, Copy)]
enum Tm2ReadOp {
    VtPoll,
    AckOsReg,
    AckHvReg,
    PullOsCtx,
    PullPoolCtx,
    PullPhysCtx,
}

/// Generation 2 special operations.
#[rustfmt::skip]
static TM2_OPERATIONS: &[TmOp<Tm2WriteOp, Tm2ReadOp>] = &[
    // MMIOs below 2K: raw values and special operations without side
    // effects
    TmOp { page: TM_OS_PAGE, offset: (TM_QW1_OS + TM_CPPR) as u64,       size: 1,
           write: Some(Tm2WriteOp::SetOsCppr), read: None },
    TmOp { page: TM_HV_PAGE, offset: (TM_QW1_OS + TM_WORD2) as u64,      size: 4,
           write: Some(Tm2WriteOp::PushOsCtx), read: None },
    TmOp { page: TM_HV_PAGE, offset: (TM_QW1_OS + TM_WORD2) as u64,      size: 8,
           write: Some(Tm2WriteOp::PushOsCtx), read: None },
    TmOp { page: TM_OS_PAGE, offset: (TM_QW1_OS + TM_LGS) as u64,        size: 1,
           write: Some(Tm2WriteOp::SetOsLgs), read: None },
    TmOp { page: TM_HV_PAGE, offset: (TM_QW3_HV_PHYS + TM_CPPR) as u64,  size: 1,
           write: Some(Tm2WriteOp::SetHvCppr), read: None },
    TmOp { page: TM_HV_PAGE, offset: (TM_QW3_HV_PHYS + TM_WORD2) as u64, size: 1,
           write: Some(Tm2WriteOp::VtPush), read: None },
    TmOp { page: TM_HV_PAGE, offset: (TM_QW3_HV_PHYS + TM_WORD2) as u64, size: 1,
           write: None, read: Some(Tm2ReadOp::VtPoll) },
    TmOp { page: TM_HV_PAGE, offset: (TM_QW3_HV_PHYS + TM_T) as u64,     size: 1,
           write: Some(Tm2WriteOp::SetHvTarget), read: None },

    // MMIOs above 2K: special operations with side effects
    TmOp { page: TM_OS_PAGE, offset: TM_SPC_ACK_OS_REG,      size: 2,
           write: None, read: Some(Tm2ReadOp::AckOsReg) },
    TmOp { page: TM_OS_PAGE, offset: TM_SPC_SET_OS_PENDING,  size: 1,
           write: Some(Tm2WriteOp::SetOsPending), read: None },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_OS_CTX_G2,  size: 4,
           write: None, read: Some(Tm2ReadOp::PullOsCtx) },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_OS_CTX,     size: 4,
           write: None, read: Some(Tm2ReadOp::PullOsCtx) },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_OS_CTX,     size: 8,
           write: None, read: Some(Tm2ReadOp::PullOsCtx) },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_ACK_HV_REG,      size: 2,
           write: None, read: Some(Tm2ReadOp::AckHvReg) },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_POOL_CTX_G2, size: 4,
           write: None, read: Some(Tm2ReadOp::PullPoolCtx) },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_POOL_CTX,   size: 4,
           write: None, read: Some(Tm2ReadOp::PullPoolCtx) },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_POOL_CTX,   size: 8,
           write: None, read: Some(Tm2ReadOp::PullPoolCtx) },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_OS_CTX_OL,  size: 1,
           write: Some(Tm2WriteOp::PullOsCtxOl), read: None },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_PHYS_CTX_G2, size: 4,
           write: None, read: Some(Tm2ReadOp::PullPhysCtx) },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_PHYS_CTX,   size: 1,
           write: None, read: Some(Tm2ReadOp::PullPhysCtx) },
    TmOp { page: TM_HV_PAGE, offset: TM_SPC_PULL_PHYS_CTX_OL, size: 1,
           write: Some(Tm2WriteOp::PullPhysCtxOl), read: None },
];

/// TIMA store handler for generation 2 presenters.
pub fn tm_write2(
    xrtr: &mut dyn Xive2Router,
    tctx: &mut Tctx,
    offset: u64,
    value: u64,
    size: usize,
) {
    let op = find_op(TM2_OPERATIONS, offset, size, true);
    if offset & TM_SPECIAL_OP != 0 && op.is_none() {
        warn!("XIVE: invalid write access at TIMA @0x{:x}", offset);
        return;
    }

    if let Some(op) = op {
        match op.write.unwrap() {
            Tm2WriteOp::SetOsCppr => tctx_set_cppr2(xrtr, tctx, Ring::Os, (value & 0xff) as u8),
            Tm2WriteOp::SetHvCppr => {
                tctx_set_cppr2(xrtr, tctx, Ring::HvPhys, (value & 0xff) as u8)
            }
            Tm2WriteOp::PushOsCtx => push_os_ctx2(xrtr, tctx, value, size),
            Tm2WriteOp::SetOsLgs => tctx.set_lgs(Ring::Os, (value & 0xff) as u8),
            Tm2WriteOp::VtPush => tctx.set_reg(Ring::HvPhys, TM_WORD2, (value & 0xff) as u8),
            Tm2WriteOp::SetHvTarget => tctx.set_reg(Ring::HvPhys, TM_T, (value & 0xff) as u8),
            Tm2WriteOp::SetOsPending => tctx.pipr_update(Ring::Os, (value & 0xff) as u8, 0),
            Tm2WriteOp::PullOsCtxOl => {
                pull_os_ctx2(xrtr, tctx);
            }
            Tm2WriteOp::PullPhysCtxOl => {
                pull_phys_ctx2(xrtr, tctx);
            }
        }
        return;
    }

    raw_write(tctx, offset, value, size);
}

/// TIMA load handler for generation 2 presenters.
pub fn tm_read2(
    xrtr: &mut dyn Xive2Router,
    tctx: &mut Tctx,
    offset: u64,
    size: usize,
) -> u64 {
    let op = find_op(TM2_OPERATIONS, offset, size, false);
    if offset & TM_SPECIAL_OP != 0 && op.is_none() {
        warn!("XIVE: invalid read access to TIMA @0x{:x}", offset);
        return u64::MAX;
    }

    if let Some(op) = op {
        return match op.read.unwrap() {
            Tm2ReadOp::AckOsReg => {
                let ret = tctx.accept(Ring::Os);
                process_pending(xrtr, tctx, Ring::Os);
                ret
            }
            Tm2ReadOp::AckHvReg => {
                let ret = tctx.accept(Ring::HvPhys);
                process_pending(xrtr, tctx, Ring::HvPhys);
                ret
            }
            Tm2ReadOp::PullOsCtx => pull_os_ctx2(xrtr, tctx),
            Tm2ReadOp::PullPoolCtx => crate::tima::pull_pool_ctx(tctx),
            Tm2ReadOp::PullPhysCtx => pull_phys_ctx2(xrtr, tctx),
            Tm2ReadOp::VtPoll => tctx.reg(Ring::HvPhys, TM_WORD2) as u64,
        };
    }

    raw_read(tctx, offset, size)
}

/// Pulls the PHYS context; a live group exception is redistributed.
fn pull_phys_ctx2(xrtr: &mut dyn Xive2Router, tctx: &mut Tctx) -> u64 {
    if tctx.reg(Ring::HvPhys, TM_NSR) & TM_NSR_GRP_LVL != 0 {
        redistribute(xrtr, tctx, Ring::HvPhys);
    }
    let qw3b8 = tctx.reg(Ring::HvPhys, TM_WORD2);
    tctx.set_reg(Ring::HvPhys, TM_WORD2, qw3b8 & !TM_QW3B8_VT);
    tctx.reset_signal(Ring::HvPhys);
    qw3b8 as u64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tctx::test_helpers::RecordedLine;
    use byteorder::{BigEndian, ByteOrder};
    use std::sync::Arc;
    use vm_memory::{Bytes, GuestAddress, GuestAddressSpace};

    /// A single-block generation 2 router with in-memory tables.
    pub(crate) struct TestRouter2 {
        pub eat: Vec<Eas2>,
        pub endt: Vec<End2>,
        pub nvpt: Vec<Nvp>,
        pub nvgt: Vec<Nvgc>,
        pub nvct: Vec<Nvgc>,
        pub pq: Vec<u8>,
        pub threads: Vec<(bool, Tctx)>,
        pub os_lines: Vec<Arc<RecordedLine>>,
        pub mem: GuestMemoryAtomic<GuestMemoryMmap>,
        pub config: PresenterConfig,
        pub cursor: usize,
    }

    impl TestRouter2 {
        pub fn new(nr_threads: usize) -> Self {
            let mut threads = Vec::new();
            let mut os_lines = Vec::new();
            for pir in 0..nr_threads {
                let os_line = RecordedLine::new();
                let mut tctx = Tctx::new(os_line.clone(), RecordedLine::new());
                tctx.reset(PresenterConfig::empty());
                tctx.pir = pir as u32;
                os_lines.push(os_line);
                threads.push((true, tctx));
            }
            TestRouter2 {
                eat: vec![Eas2::default(); 64],
                endt: vec![End2::default(); 64],
                nvpt: vec![Nvp::default(); 0x800],
                nvgt: vec![Nvgc::default(); 0x800],
                nvct: vec![Nvgc::default(); 0x100],
                pq: vec![0; 64],
                threads,
                os_lines,
                mem: GuestMemoryAtomic::new(
                    GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 1 << 20)]).unwrap(),
                ),
                config: PresenterConfig::empty(),
                cursor: 0,
            }
        }

        pub fn read_queue(&self, qaddr: u64, pos: u32) -> u32 {
            let mut bytes = [0u8; 4];
            self.mem
                .memory()
                .read_slice(&mut bytes, GuestAddress(qaddr + pos as u64 * 4))
                .unwrap();
            BigEndian::read_u32(&bytes)
        }
    }

    impl Xive2Router for TestRouter2 {
        fn get_eas(&mut self, blk: u8, idx: u32) -> Result<Eas2> {
            if blk != 0 || idx as usize >= self.eat.len() {
                return Err(Error::UnknownEas(blk, idx));
            }
            Ok(self.eat[idx as usize])
        }
        fn get_pq(&mut self, blk: u8, idx: u32) -> Result<u8> {
            if blk != 0 || idx as usize >= self.pq.len() {
                return Err(Error::UnknownEas(blk, idx));
            }
            Ok(self.pq[idx as usize])
        }
        fn set_pq(&mut self, blk: u8, idx: u32, pq: u8) -> Result<()> {
            if blk != 0 || idx as usize >= self.pq.len() {
                return Err(Error::UnknownEas(blk, idx));
            }
            self.pq[idx as usize] = pq;
            Ok(())
        }
        fn get_end(&mut self, blk: u8, idx: u32) -> Result<End2> {
            if blk != 0 || idx as usize >= self.endt.len() {
                return Err(Error::UnknownEnd(blk, idx));
            }
            Ok(self.endt[idx as usize])
        }
        fn write_end(&mut self, blk: u8, idx: u32, end: &End2, word: Option<usize>) -> Result<()> {
            if blk != 0 || idx as usize >= self.endt.len() {
                return Err(Error::UnknownEnd(blk, idx));
            }
            match word {
                Some(w) => self.endt[idx as usize].w[w] = end.w[w],
                None => self.endt[idx as usize] = *end,
            }
            Ok(())
        }
        fn get_nvp(&mut self, blk: u8, idx: u32) -> Result<Nvp> {
            if blk != 0 || idx as usize >= self.nvpt.len() {
                return Err(Error::UnknownNvp(blk, idx));
            }
            Ok(self.nvpt[idx as usize])
        }
        fn write_nvp(&mut self, blk: u8, idx: u32, nvp: &Nvp, word: Option<usize>) -> Result<()> {
            if blk != 0 || idx as usize >= self.nvpt.len() {
                return Err(Error::UnknownNvp(blk, idx));
            }
            match word {
                Some(w) => self.nvpt[idx as usize].w[w] = nvp.w[w],
                None => self.nvpt[idx as usize] = *nvp,
            }
            Ok(())
        }
        fn get_nvgc(&mut self, crowd: bool, blk: u8, idx: u32) -> Result<Nvgc> {
            let table = if crowd { &self.nvct } else { &self.nvgt };
            if blk != 0 || idx as usize >= table.len() {
                return Err(Error::UnknownNvgc(blk, idx));
            }
            Ok(table[idx as usize])
        }
        fn write_nvgc(&mut self, crowd: bool, blk: u8, idx: u32, nvgc: &Nvgc) -> Result<()> {
            let table = if crowd { &mut self.nvct } else { &mut self.nvgt };
            if blk != 0 || idx as usize >= table.len() {
                return Err(Error::UnknownNvgc(blk, idx));
            }
            table[idx as usize] = *nvgc;
            Ok(())
        }
        fn block_id(&self) -> u8 {
            0
        }
        fn config(&self) -> PresenterConfig {
            self.config
        }
        fn memory(&self) -> GuestMemoryAtomic<GuestMemoryMmap> {
            self.mem.clone()
        }
        fn match_nvt(&mut self, spec: &NvtMatchSpec) -> Result<MatchOutcome> {
            let threads: Vec<(bool, &Tctx)> =
                self.threads.iter().map(|(e, t)| (*e, t)).collect();
            let (outcome, cursor) = scan_for_match2(&threads, spec, self.cursor)?;
            self.cursor = cursor;
            Ok(outcome)
        }
        fn present(&mut self, thread: usize, ring: Ring, priority: u8, group_level: u8) {
            self.threads[thread].1.pipr_update(ring, priority, group_level);
        }
        fn broadcast(&mut self, spec: &NvtMatchSpec) {
            for (enabled, tctx) in self.threads.iter_mut() {
                if *enabled {
                    backlog_hint(tctx, spec);
                }
            }
        }
        fn end_notify(&mut self, eas: &Eas2) {
            end_notify2(self, eas);
        }
    }

    pub(crate) fn group_end(qaddr: u64, vp_idx: u32, priority: u8) -> End2 {
        let mut end = End2::default();
        end.w[0] = END2_W0_VALID | END2_W0_ENQUEUE | END2_W0_UCOND_NOTIFY;
        end.w[1] = set_field32(END2_W1_GENERATION, 0, 1);
        end.w[2] = set_field32(END2_W2_EQ_ADDR_HI, 0, (qaddr >> 32) as u32);
        end.w[3] = (qaddr as u32) & END2_W3_EQ_ADDR_LO;
        end.w[6] = END2_W6_IGNORE | set_field32(END2_W6_VP_OFFSET, 0, vp_idx);
        end.w[7] = set_field32(END2_W7_F0_PRIORITY, 0, priority as u32);
        end
    }

    pub(crate) fn specific_end(qaddr: u64, vp_idx: u32, priority: u8) -> End2 {
        let mut end = group_end(qaddr, vp_idx, priority);
        end.w[6] &= !END2_W6_IGNORE;
        end
    }

    fn dispatch_os(rtr: &mut TestRouter2, thread: usize, nvp_idx: u32, cppr: u8) {
        let tctx = &mut rtr.threads[thread].1;
        tctx.set_word2(Ring::Os, TM_QW1W2_VO | nvt_cam_line(0, nvp_idx));
        tctx.set_cppr(Ring::Os, cppr);
    }

    #[test]
    fn test_specific_notify_and_backlog() {
        let mut rtr = TestRouter2::new(1);
        rtr.eat[7] = Eas2::new(0, 4, 0x20);
        let mut end = specific_end(0x1_0000, 0x440, 5);
        end.w[0] |= END2_W0_BACKLOG;
        rtr.endt[4] = end;
        rtr.nvpt[0x440].w[0] = NVP2_W0_VALID;

        // Not dispatched: the priority is recorded in the NVP.
        router2_notify(&mut rtr, 7, true);
        assert_eq!(rtr.nvpt[0x440].ipb(), priority_to_ipb(5));
        assert_eq!(rtr.read_queue(0x1_0000, 0), (1 << 31) | 0x20);

        // Dispatched: presented directly.
        dispatch_os(&mut rtr, 0, 0x440, 7);
        router2_notify(&mut rtr, 7, true);
        assert_eq!(rtr.threads[0].1.reg(Ring::Os, TM_PIPR), 5);
        assert!(rtr.os_lines[0].level());
    }

    #[test]
    fn test_group_notify_presents_to_eligible_thread() {
        let mut rtr = TestRouter2::new(2);
        rtr.eat[1] = Eas2::new(0, 2, 0);
        rtr.endt[2] = group_end(0x1_0000, 0x441, 3);
        rtr.nvpt[0x441].w[0] = NVP2_W0_VALID;

        // Thread 0 runs the group member 0x440 but is masked, thread 1
        // runs 0x442 and can take the interrupt.
        dispatch_os(&mut rtr, 0, 0x440, 2);
        dispatch_os(&mut rtr, 1, 0x442, 7);

        router2_notify(&mut rtr, 1, true);

        assert!(!rtr.os_lines[0].level());
        assert!(rtr.os_lines[1].level());
        let tctx = &rtr.threads[1].1;
        // Group presentation: PIPR driven directly, no IPB bit.
        assert_eq!(tctx.reg(Ring::Os, TM_PIPR), 3);
        assert_eq!(tctx.reg(Ring::Os, TM_IPB), 0);
        assert_ne!(tctx.reg(Ring::Os, TM_NSR) & TM_NSR_GRP_LVL, 0);
    }

    #[test]
    fn test_group_backlog_and_hint_when_nobody_eligible() {
        let mut rtr = TestRouter2::new(1);
        rtr.eat[1] = Eas2::new(0, 2, 0);
        rtr.endt[2] = group_end(0x1_0000, 0x441, 3);
        rtr.nvpt[0x441].w[0] = NVP2_W0_VALID;
        let level = group_level(false, true, 0, 0x441);
        rtr.nvgt[nvgc_index(0x441, level) as usize].w[0] = NVGC2_W0_VALID;

        // The only group member is running at a more favored priority.
        dispatch_os(&mut rtr, 0, 0x440, 2);

        router2_notify(&mut rtr, 1, true);

        let nvgc = rtr.nvgt[nvgc_index(0x441, level) as usize];
        assert_eq!(nvgc.backlog(3), 1);
        // The thread got the LSMFB hint.
        assert_eq!(rtr.threads[0].1.reg(Ring::Os, TM_LSMFB), 3);
        assert!(!rtr.os_lines[0].level());
    }

    #[test]
    fn test_cppr_raise_claims_backlogged_group_interrupt() {
        let mut rtr = TestRouter2::new(1);
        rtr.eat[1] = Eas2::new(0, 2, 0);
        rtr.endt[2] = group_end(0x1_0000, 0x441, 3);
        rtr.nvpt[0x441].w[0] = NVP2_W0_VALID;
        let level = group_level(false, true, 0, 0x441);
        let gidx = nvgc_index(0x441, level) as usize;
        rtr.nvgt[gidx].w[0] = NVGC2_W0_VALID;

        // Group membership of thread 0's VP starts at this level.
        rtr.nvpt[0x440].w[0] =
            NVP2_W0_VALID | set_field32(NVP2_W0_PGOFIRST, 0, level as u32);

        dispatch_os(&mut rtr, 0, 0x440, 2);
        rtr.threads[0].1.set_lgs(Ring::Os, 1);

        router2_notify(&mut rtr, 1, true);
        assert_eq!(rtr.nvgt[gidx].backlog(3), 1);

        // Raising the CPPR makes the thread eligible: the scan claims
        // the backlogged interrupt and presents it.
        let mut tctx = std::mem::take(&mut rtr.threads[0].1);
        tctx_set_cppr2(&mut rtr, &mut tctx, Ring::Os, 6);
        rtr.threads[0].1 = tctx;

        assert_eq!(rtr.nvgt[gidx].backlog(3), 0);
        let tctx = &rtr.threads[0].1;
        assert_eq!(tctx.reg(Ring::Os, TM_PIPR), 3);
        assert_ne!(tctx.reg(Ring::Os, TM_NSR) & TM_NSR_GRP_LVL, 0);
        assert!(rtr.os_lines[0].level());
    }

    #[test]
    fn test_pull_redistributes_group_exception_exactly_once() {
        let mut rtr = TestRouter2::new(2);
        rtr.eat[1] = Eas2::new(0, 2, 0);
        rtr.endt[2] = group_end(0x1_0000, 0x441, 3);
        rtr.nvpt[0x441].w[0] = NVP2_W0_VALID;
        let level = group_level(false, true, 0, 0x441);
        let gidx = nvgc_index(0x441, level) as usize;
        rtr.nvgt[gidx].w[0] = NVGC2_W0_VALID;
        rtr.nvpt[0x442].w[0] =
            NVP2_W0_VALID | set_field32(NVP2_W0_PGOFIRST, 0, level as u32);

        dispatch_os(&mut rtr, 0, 0x440, 7);
        router2_notify(&mut rtr, 1, true);
        assert!(rtr.os_lines[0].level());
        assert_eq!(rtr.nvgt[gidx].backlog(3), 0);

        // Pull thread 0's OS context with the group exception live.
        let mut tctx = std::mem::take(&mut rtr.threads[0].1);
        let offset = ((TM_HV_PAGE as u64) << TM_SHIFT) + TM_SPC_PULL_OS_CTX;
        let val = tm_read2(&mut rtr, &mut tctx, offset, 4);
        rtr.threads[0].1 = tctx;

        assert_eq!(val as u32 & TM_QW1W2_VO, TM_QW1W2_VO);
        assert!(!rtr.threads[0].1.is_valid(Ring::Os));
        assert!(!rtr.os_lines[0].level());
        // Re-incremented exactly once.
        assert_eq!(rtr.nvgt[gidx].backlog(3), 1);

        // A fresh eligible thread finds the interrupt again.
        dispatch_os(&mut rtr, 1, 0x442, 7);
        rtr.threads[1].1.set_lgs(Ring::Os, 1);
        let mut tctx = std::mem::take(&mut rtr.threads[1].1);
        process_pending(&mut rtr, &mut tctx, Ring::Os);
        rtr.threads[1].1 = tctx;

        assert_eq!(rtr.nvgt[gidx].backlog(3), 0);
        assert_eq!(rtr.threads[1].1.reg(Ring::Os, TM_PIPR), 3);
        assert!(rtr.os_lines[1].level());
    }

    #[test]
    fn test_precluded_escalation_falls_through() {
        let mut rtr = TestRouter2::new(1);
        rtr.eat[1] = Eas2::new(0, 2, 0);

        let mut end = group_end(0x1_0000, 0x441, 3);
        end.w[0] |= END2_W0_PRECL_ESC_CTL
            | END2_W0_ESCALATE_CTL
            | END2_W0_UNCOND_ESCALATE
            | END2_W0_ADAPTIVE_ESC;
        end.w[4] = set_field32(END2_W4_ESC_END_INDEX, 0, 5);
        end.w[5] = 0x77;
        rtr.endt[2] = end;
        rtr.nvpt[0x441].w[0] = NVP2_W0_VALID;
        let level = group_level(false, true, 0, 0x441);
        let gidx = nvgc_index(0x441, level) as usize;
        rtr.nvgt[gidx].w[0] = NVGC2_W0_VALID;

        // Escalation END with a dispatched specific target.
        rtr.endt[5] = specific_end(0x3_0000, 0x500, 0);
        rtr.nvpt[0x500].w[0] = NVP2_W0_VALID;
        dispatch_os(&mut rtr, 0, 0x500, 4);

        router2_notify(&mut rtr, 1, true);

        // Backlogged, no broadcast hint, and the escalation fired.
        assert_eq!(rtr.nvgt[gidx].backlog(3), 1);
        assert_ne!(rtr.threads[0].1.reg(Ring::Os, TM_LSMFB), 3);
        assert_eq!(rtr.read_queue(0x3_0000, 0), (1 << 31) | 0x77);
        assert_eq!(rtr.threads[0].1.reg(Ring::Os, TM_PIPR), 0);
    }

    #[test]
    fn test_round_robin_cursor_rotates_group_delivery() {
        let mut rtr = TestRouter2::new(2);
        rtr.eat[1] = Eas2::new(0, 2, 0);
        let mut end = group_end(0x1_0000, 0x441, 3);
        end.w[0] &= !END2_W0_ENQUEUE;
        rtr.endt[2] = end;
        rtr.nvpt[0x441].w[0] = NVP2_W0_VALID;

        dispatch_os(&mut rtr, 0, 0x440, 7);
        dispatch_os(&mut rtr, 1, 0x442, 7);

        router2_notify(&mut rtr, 1, true);
        let first = if rtr.os_lines[0].level() { 0 } else { 1 };
        rtr.threads[first].1.accept(Ring::Os);

        router2_notify(&mut rtr, 1, true);
        let second = if rtr.os_lines[0].level() { 0 } else { 1 };
        assert_ne!(first, second);
    }

    #[test]
    fn test_save_restore_context_round_trip() {
        let mut rtr = TestRouter2::new(1);
        rtr.config = PresenterConfig::VP_SAVE_RESTORE;
        rtr.nvpt[0x450].w[0] = NVP2_W0_VALID;

        // Push with the hardware-managed bit: state restored from the
        // NVP (all defaults), checkout recorded.
        let mut tctx = std::mem::take(&mut rtr.threads[0].1);
        let cam = (TM_QW1W2_VO | TM_QW1W2_HO | nvt_cam_line(0, 0x450)) as u64;
        let offset = ((TM_HV_PAGE as u64) << TM_SHIFT) + (TM_QW1_OS + TM_WORD2) as u64;
        tm_write2(&mut rtr, &mut tctx, offset, cam, 4);

        assert!(rtr.nvpt[0x450].is_checked_out());

        // Give the ring some state and pull it back out.
        tctx_set_cppr2(&mut rtr, &mut tctx, Ring::Os, 5);
        tctx.set_lgs(Ring::Os, 2);
        let pull = ((TM_HV_PAGE as u64) << TM_SHIFT) + TM_SPC_PULL_OS_CTX;
        tm_read2(&mut rtr, &mut tctx, pull, 4);
        rtr.threads[0].1 = tctx;

        let nvp = &rtr.nvpt[0x450];
        assert!(!nvp.is_checked_out());
        assert_eq!(nvp.cppr(), 5);
        assert_eq!(nvp.lgs(), 2);
    }
}
