// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Thread interrupt management context.
//!
//! Each hardware thread carries four 16-byte register rings (User, OS,
//! Pool, Phys), one per privilege level, holding the pending priority
//! state and a CAM line identifying the virtual processor dispatched on
//! the ring. The POOL ring is special: it shares the NSR, CPPR and PIPR
//! registers of the PHYS ring.

use std::result;
use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};
use vm_migration::{Migratable, MigratableError, Pausable, Snapshot, Snapshottable};

use crate::field::get_field32;
use crate::regs::*;
use crate::regs2;
use crate::{DummyLine, InterruptLine, PresenterConfig};

/// The four TIMA rings, by register file byte offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ring {
    User = TM_QW0_USER as isize,
    Os = TM_QW1_OS as isize,
    HvPool = TM_QW2_HV_POOL as isize,
    HvPhys = TM_QW3_HV_PHYS as isize,
}

impl Ring {
    pub fn offset(self) -> usize {
        self as usize
    }

    /// The ring whose NSR/CPPR/PIPR registers signal for this ring:
    /// POOL interrupts are signalled through the PHYS registers.
    pub fn signal_ring(self) -> Ring {
        match self {
            Ring::HvPool => Ring::HvPhys,
            ring => ring,
        }
    }
}

/// One thread's interrupt management state.
pub struct Tctx {
    /// The 64 bytes of ring registers, in TIMA layout. Word values are
    /// stored big-endian, as seen by the guest.
    pub regs: [u8; TM_RING_COUNT * TM_RING_SIZE],
    /// Hardwired CAM line of the PHYS ring, derived from the chip block
    /// and the thread PIR by the owning presenter.
    pub hw_cam: u32,
    /// Processor identification of the hardware thread.
    pub pir: u32,
    os_output: Arc<dyn InterruptLine>,
    hv_output: Arc<dyn InterruptLine>,
}

#[derive(Serialize, Deserialize)]
pub struct TctxState {
    regs: Vec<u8>,
}

impl Default for Tctx {
    fn default() -> Self {
        Tctx::new(Arc::new(DummyLine), Arc::new(DummyLine))
    }
}

impl Tctx {
    pub fn new(os_output: Arc<dyn InterruptLine>, hv_output: Arc<dyn InterruptLine>) -> Self {
        Tctx {
            regs: [0; TM_RING_COUNT * TM_RING_SIZE],
            hw_cam: 0,
            pir: 0,
            os_output,
            hv_output,
        }
    }

    fn output(&self, ring: Ring) -> Option<&dyn InterruptLine> {
        match ring {
            // Not supported
            Ring::User => None,
            Ring::Os => Some(self.os_output.as_ref()),
            Ring::HvPool | Ring::HvPhys => Some(self.hv_output.as_ref()),
        }
    }

    pub fn reg(&self, ring: Ring, offset: usize) -> u8 {
        self.regs[ring.offset() + offset]
    }

    pub fn set_reg(&mut self, ring: Ring, offset: usize, val: u8) {
        self.regs[ring.offset() + offset] = val;
    }

    /// The CAM word of a ring, decoded from its big-endian bytes.
    pub fn word2(&self, ring: Ring) -> u32 {
        let off = ring.offset() + TM_WORD2;
        u32::from_be_bytes(self.regs[off..off + 4].try_into().unwrap())
    }

    pub fn set_word2(&mut self, ring: Ring, word: u32) {
        let off = ring.offset() + TM_WORD2;
        self.regs[off..off + 4].copy_from_slice(&word.to_be_bytes());
    }

    /// Acknowledges the pending interrupt of a ring: the CPPR takes the
    /// PIPR value, the priority bit is consumed from the IPB, the
    /// exception is dropped and the line lowered. Returns the (NSR,
    /// CPPR) pair captured for the guest.
    pub fn accept(&mut self, ring: Ring) -> u64 {
        let nsr = self.reg(ring, TM_NSR);

        if let Some(line) = self.output(ring) {
            line.set_level(false);
        }

        if nsr != 0 {
            let cppr = self.reg(ring, TM_PIPR);

            // POOL interrupts keep their IPB in the POOL ring while
            // signalling through the PHYS registers.
            let alt_ring = if ring == Ring::HvPhys
                && nsr & (TM_QW3_NSR_HE_POOL << 6) != 0
                && nsr & TM_QW3_NSR_HE != (TM_QW3_NSR_HE_PHYS << 6)
            {
                Ring::HvPool
            } else {
                ring
            };

            self.set_reg(ring, TM_CPPR, cppr);

            // If the interrupt was for a specific VP, reset the pending
            // buffer bit, otherwise clear the group level indicator.
            if nsr & TM_NSR_GRP_LVL != 0 {
                // Group interrupts do not latch an IPB bit.
            } else {
                let ipb = self.reg(alt_ring, TM_IPB) & !priority_to_ipb(cppr);
                self.set_reg(alt_ring, TM_IPB, ipb);
            }

            // Drop the exception bit and any group/crowd level.
            self.set_reg(ring, TM_NSR, 0);

            // Recompute the pending priority from what is left.
            self.refresh_pipr(ring);
        }

        ((nsr as u64) << 8) | self.reg(ring, TM_CPPR) as u64
    }

    /// Recomputes the PIPR of a ring from its IPB; the PHYS ring takes
    /// the most favored of the PHYS and POOL pending priorities.
    fn refresh_pipr(&mut self, ring: Ring) {
        let mut pipr = ipb_to_pipr(self.reg(ring, TM_IPB));

        if ring == Ring::HvPhys && self.word2(Ring::HvPool) & TM_QW2W2_VP != 0 {
            pipr = pipr.min(ipb_to_pipr(self.reg(Ring::HvPool, TM_IPB)));
        }

        self.set_reg(ring.signal_ring(), TM_PIPR, pipr);
    }

    /// Raises the exception for a ring if its pending priority is more
    /// favored than the CPPR gate.
    pub fn notify(&mut self, ring: Ring, group_level: u8) {
        let alt_ring = ring.signal_ring();

        if self.reg(alt_ring, TM_PIPR) < self.reg(alt_ring, TM_CPPR) {
            let nsr = match ring {
                Ring::Os => TM_QW1_NSR_EO | (group_level & TM_NSR_GRP_LVL),
                Ring::HvPool => (TM_QW3_NSR_HE_POOL << 6) | (group_level & TM_NSR_GRP_LVL),
                Ring::HvPhys => (TM_QW3_NSR_HE_PHYS << 6) | (group_level & TM_NSR_GRP_LVL),
                Ring::User => unreachable!("USER ring cannot signal"),
            };
            self.set_reg(alt_ring, TM_NSR, nsr);
            if let Some(line) = self.output(ring) {
                line.set_level(true);
            }
        }
    }

    /// Lowers the exception line of a ring without touching the
    /// registers. Used when pulling a context, to avoid catching the
    /// signal in a higher privilege context; pushing the context back
    /// raises it again when needed.
    pub fn reset_signal(&mut self, ring: Ring) {
        if let Some(line) = self.output(ring) {
            line.set_level(false);
        }
    }

    /// Sets the CPPR of a ring and re-evaluates the exception state.
    pub fn set_cppr(&mut self, ring: Ring, cppr: u8) {
        let cppr = if cppr > PRIORITY_MAX { 0xff } else { cppr };

        self.set_reg(ring, TM_CPPR, cppr);

        // Recompute the PIPR from the local pending interrupts. The
        // PHYS ring takes the most favored of the PHYS and POOL values.
        let mut pipr_min = ipb_to_pipr(self.reg(ring, TM_IPB));
        let mut ring_min = ring;

        if ring == Ring::HvPhys && self.word2(Ring::HvPool) & TM_QW2W2_VP != 0 {
            let pool_pipr = ipb_to_pipr(self.reg(Ring::HvPool, TM_IPB));
            if pool_pipr < pipr_min {
                pipr_min = pool_pipr;
                ring_min = Ring::HvPool;
            }
        }

        self.set_reg(ring.signal_ring(), TM_PIPR, pipr_min);

        // The CPPR change may uncover a pending exception.
        self.notify(ring_min, 0);
    }

    /// Records a new pending priority and re-evaluates the exception
    /// state. A non-zero group level marks a group presentation, which
    /// drives the PIPR directly without latching an IPB bit.
    pub fn pipr_update(&mut self, ring: Ring, priority: u8, group_level: u8) {
        let alt_ring = ring.signal_ring();

        if group_level == 0 {
            // VP-specific
            let ipb = self.reg(ring, TM_IPB) | priority_to_ipb(priority);
            self.set_reg(ring, TM_IPB, ipb);
            self.set_reg(alt_ring, TM_PIPR, ipb_to_pipr(ipb));
        } else {
            // VP-group
            self.set_reg(alt_ring, TM_PIPR, priority_to_pipr(priority));
        }
        self.notify(ring, group_level);
    }

    pub fn set_lgs(&mut self, ring: Ring, lgs: u8) {
        self.set_reg(ring, TM_LGS, lgs);
    }

    /// Matches a ring CAM against a specific or group target. Rings are
    /// scanned most privileged first, as the architecture requires.
    pub fn match_ring(
        &self,
        format: u8,
        nvt_blk: u8,
        nvt_idx: u32,
        cam_ignore: bool,
        logic_serv: u32,
    ) -> Option<Ring> {
        let cam = nvt_cam_line(nvt_blk, nvt_idx);
        let qw3w2 = self.word2(Ring::HvPhys);
        let qw2w2 = self.word2(Ring::HvPool);
        let qw1w2 = self.word2(Ring::Os);
        let qw0w2 = self.word2(Ring::User);

        if format == 0 {
            if cam_ignore {
                // F=0 & i=1: Logical server notification (bits ignored
                // at the end of the NVT identifier)
                warn!("XIVE: no support for LS NVT {:x}/{:x}", nvt_blk, nvt_idx);
                return None;
            }

            // F=0 & i=0: Specific NVT notification
            if qw3w2 & TM_QW3W2_VT != 0 && cam == self.hw_cam {
                return Some(Ring::HvPhys);
            }
            if qw2w2 & TM_QW2W2_VP != 0 && cam == get_field32(TM_QW2W2_POOL_CAM, qw2w2) {
                return Some(Ring::HvPool);
            }
            if qw1w2 & TM_QW1W2_VO != 0 && cam == get_field32(TM_QW1W2_OS_CAM, qw1w2) {
                return Some(Ring::Os);
            }
        } else {
            // F=1: User level Event-Based Branch (EBB) notification
            if qw1w2 & TM_QW1W2_VO != 0
                && cam == get_field32(TM_QW1W2_OS_CAM, qw1w2)
                && qw0w2 & TM_QW0W2_VU != 0
                && logic_serv == get_field32(TM_QW0W2_LOGIC_SERV, qw0w2)
            {
                return Some(Ring::User);
            }
        }
        None
    }

    /// Generation 2 match: group and crowd targets compare with the
    /// corresponding low-order identifier bits masked out.
    pub fn match_ring2(
        &self,
        format: u8,
        nvt_blk: u8,
        nvt_idx: u32,
        crowd: bool,
        cam_ignore: bool,
        logic_serv: u32,
    ) -> Option<Ring> {
        if format != 0 {
            return self.match_ring(format, nvt_blk, nvt_idx, cam_ignore, logic_serv);
        }

        let qw3w2 = self.word2(Ring::HvPhys);
        let qw2w2 = self.word2(Ring::HvPool);
        let qw1w2 = self.word2(Ring::Os);

        if qw3w2 & TM_QW3W2_VT != 0 && cam_match(self.hw_cam, nvt_blk, nvt_idx, crowd, cam_ignore)
        {
            return Some(Ring::HvPhys);
        }
        if qw2w2 & TM_QW2W2_VP != 0
            && cam_match(
                get_field32(TM_QW2W2_POOL_CAM, qw2w2),
                nvt_blk,
                nvt_idx,
                crowd,
                cam_ignore,
            )
        {
            return Some(Ring::HvPool);
        }
        if qw1w2 & TM_QW1W2_VO != 0
            && cam_match(
                get_field32(TM_QW1W2_OS_CAM, qw1w2),
                nvt_blk,
                nvt_idx,
                crowd,
                cam_ignore,
            )
        {
            return Some(Ring::Os);
        }
        None
    }

    /// Whether a ring is dispatched with a valid context.
    pub fn is_valid(&self, ring: Ring) -> bool {
        match ring {
            Ring::User => self.word2(Ring::User) & TM_QW0W2_VU != 0,
            Ring::Os => self.word2(Ring::Os) & TM_QW1W2_VO != 0,
            Ring::HvPool => self.word2(Ring::HvPool) & TM_QW2W2_VP != 0,
            Ring::HvPhys => self.word2(Ring::HvPhys) & TM_QW3W2_VT != 0,
        }
    }

    pub fn reset(&mut self, config: PresenterConfig) {
        self.regs = [0; TM_RING_COUNT * TM_RING_SIZE];

        // Set some defaults
        self.set_reg(Ring::Os, TM_LSMFB, 0xff);
        self.set_reg(Ring::Os, TM_ACK_CNT, 0xff);
        self.set_reg(Ring::Os, TM_AGE, 0xff);
        if !config.contains(PresenterConfig::GEN1_TIMA_OS) {
            self.set_reg(Ring::Os, TM_OGEN, 2);
        }

        // Initialize the PIPRs to 0xFF to avoid phantom interrupts when
        // the CPPR is first set.
        let os_pipr = ipb_to_pipr(self.reg(Ring::Os, TM_IPB));
        self.set_reg(Ring::Os, TM_PIPR, os_pipr);
        let phys_pipr = ipb_to_pipr(self.reg(Ring::HvPhys, TM_IPB));
        self.set_reg(Ring::HvPhys, TM_PIPR, phys_pipr);
    }

    fn state(&self) -> TctxState {
        TctxState {
            regs: self.regs.to_vec(),
        }
    }

    fn set_state(&mut self, state: &TctxState) {
        if state.regs.len() == self.regs.len() {
            self.regs.copy_from_slice(&state.regs);
        } else {
            warn!("XIVE: thread context state size mismatch");
        }
    }
}

/// Masked CAM compare used for group and crowd matches: a group target
/// covers all identifiers sharing the index high-order bits, a crowd
/// additionally covers a span of blocks.
fn cam_match(cam: u32, nvt_blk: u8, nvt_idx: u32, crowd: bool, cam_ignore: bool) -> bool {
    let cam_blk = nvt_cam_blk(cam) as u32;
    let cam_idx = nvt_cam_idx(cam);

    let blk_mask = if crowd {
        let span = (!(nvt_blk as u32)).trailing_zeros() + 1;
        (1u32 << span) - 1
    } else {
        0
    };
    let idx_mask = if cam_ignore {
        let span = (!nvt_idx).trailing_zeros() + 1;
        if span >= 31 {
            warn!("XIVE: invalid group index 0x{:08x}", nvt_idx);
            return false;
        }
        (1u32 << span) - 1
    } else {
        0
    };

    if !cam_ignore && !crowd {
        return cam == nvt_cam_line(nvt_blk, nvt_idx);
    }

    (cam_blk | blk_mask) == (nvt_blk as u32 | blk_mask)
        && (cam_idx | idx_mask) == (nvt_idx | idx_mask)
}

impl Pausable for Tctx {}

impl Snapshottable for Tctx {
    fn id(&self) -> String {
        String::from("xive-tctx")
    }

    fn snapshot(&mut self) -> result::Result<Snapshot, MigratableError> {
        Snapshot::new_from_state(&self.state())
    }

    fn restore(&mut self, snapshot: Snapshot) -> result::Result<(), MigratableError> {
        self.set_state(&snapshot.to_state()?);
        Ok(())
    }
}

impl Migratable for Tctx {}

/// Saves a ring context into its NVP save/restore bytes (generation 2
/// automatic context save).
pub fn save_ring(tctx: &Tctx, ring: Ring, nvp: &mut regs2::Nvp) {
    nvp.set_cppr(tctx.reg(ring, TM_CPPR));
    nvp.set_ipb(tctx.reg(ring, TM_IPB));
    nvp.set_lsmfb(tctx.reg(ring, TM_LSMFB));
    nvp.set_lgs(tctx.reg(ring, TM_LGS));
    nvp.set_target(tctx.reg(ring, TM_T));
}

/// Restores a ring context from its NVP save/restore bytes. The PIPR is
/// not architected state: it is recomputed from the restored IPB.
pub fn restore_ring(tctx: &mut Tctx, ring: Ring, nvp: &regs2::Nvp) {
    tctx.set_reg(ring, TM_CPPR, nvp.cppr());
    tctx.set_reg(ring, TM_IPB, tctx.reg(ring, TM_IPB) | nvp.ipb());
    tctx.set_reg(ring, TM_LSMFB, nvp.lsmfb());
    tctx.set_reg(ring, TM_LGS, nvp.lgs());
    tctx.set_reg(ring, TM_T, nvp.target());
}
