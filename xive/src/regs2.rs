// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Generation 2 in-memory structure layouts.
//!
//! XIVE2 reworks the table entries: the END grows escalation variants
//! and a generation-flipped indicator, the NVT becomes the NVP with
//! save/restore bytes and a checked-out thread binding, and two new
//! aggregate structures (NVG for groups, NVC for crowds) carry 24-bit
//! per-priority backlog counters.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::field::{
    get_field32, get_field64, ppc_bit, ppc_bit32, ppc_bitmask, ppc_bitmask32, set_field32,
    set_field64,
};
use crate::regs::Eas;

pub const EAS2_VALID: u64 = ppc_bit(0);
pub const EAS2_END_BLOCK: u64 = ppc_bitmask(4, 7);
pub const EAS2_END_INDEX: u64 = ppc_bitmask(8, 31);
pub const EAS2_MASKED: u64 = ppc_bit(32);
pub const EAS2_END_DATA: u64 = ppc_bitmask(33, 63);

/// Generation 2 Event Assignment Structure. Same size as the
/// generation 1 EAS but the mask bit moved to the low word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eas2 {
    pub w: u64,
}

impl Eas2 {
    pub fn new(end_blk: u8, end_idx: u32, data: u32) -> Self {
        let mut w = EAS2_VALID;
        w = set_field64(EAS2_END_BLOCK, w, end_blk as u64);
        w = set_field64(EAS2_END_INDEX, w, end_idx as u64);
        w = set_field64(EAS2_END_DATA, w, data as u64);
        Eas2 { w }
    }

    pub fn is_valid(&self) -> bool {
        self.w & EAS2_VALID != 0
    }

    pub fn is_masked(&self) -> bool {
        self.w & EAS2_MASKED != 0
    }

    pub fn end_block(&self) -> u8 {
        get_field64(EAS2_END_BLOCK, self.w) as u8
    }

    pub fn end_index(&self) -> u32 {
        get_field64(EAS2_END_INDEX, self.w) as u32
    }

    pub fn end_data(&self) -> u32 {
        get_field64(EAS2_END_DATA, self.w) as u32
    }
}

// END word 0
pub const END2_W0_VALID: u32 = ppc_bit32(0);
pub const END2_W0_ENQUEUE: u32 = ppc_bit32(5);
pub const END2_W0_UCOND_NOTIFY: u32 = ppc_bit32(6);
pub const END2_W0_SILENT_ESCALATE: u32 = ppc_bit32(7);
pub const END2_W0_BACKLOG: u32 = ppc_bit32(8);
pub const END2_W0_PRECL_ESC_CTL: u32 = ppc_bit32(9);
pub const END2_W0_ESCALATE_CTL: u32 = ppc_bit32(10);
pub const END2_W0_ADAPTIVE_ESC: u32 = ppc_bit32(11);
pub const END2_W0_UNCOND_ESCALATE: u32 = ppc_bit32(12);
pub const END2_W0_FIRMWARE1: u32 = ppc_bit32(16);
pub const END2_W0_FIRMWARE2: u32 = ppc_bit32(17);
// END word 1
pub const END2_W1_ESN: u32 = ppc_bitmask32(0, 1);
pub const END2_W1_ESE: u32 = ppc_bitmask32(2, 3);
pub const END2_W1_GEN_FLIPPED: u32 = ppc_bit32(8);
pub const END2_W1_GENERATION: u32 = ppc_bit32(9);
pub const END2_W1_PAGE_OFF: u32 = ppc_bitmask32(10, 31);
// END word 2
pub const END2_W2_EQ_ADDR_HI: u32 = ppc_bitmask32(8, 31);
// END word 3
pub const END2_W3_EQ_ADDR_LO: u32 = ppc_bitmask32(0, 27);
pub const END2_W3_QSIZE: u32 = ppc_bitmask32(28, 31);
// END word 4
pub const END2_W4_END_BLOCK: u32 = ppc_bitmask32(4, 7);
pub const END2_W4_ESC_END_INDEX: u32 = ppc_bitmask32(8, 31);
pub const END2_W4_ESB_LISN: u32 = ppc_bitmask32(0, 31);
// END word 5
pub const END2_W5_ESC_END_DATA: u32 = ppc_bitmask32(1, 31);
// END word 6
pub const END2_W6_CROWD: u32 = ppc_bit32(0);
pub const END2_W6_IGNORE: u32 = ppc_bit32(1);
pub const END2_W6_FORMAT_BIT: u32 = ppc_bit32(8);
pub const END2_W6_VP_BLOCK: u32 = ppc_bitmask32(9, 12);
pub const END2_W6_VP_OFFSET: u32 = ppc_bitmask32(13, 31);
// END word 7
pub const END2_W7_F0_PRIORITY: u32 = ppc_bitmask32(8, 15);
pub const END2_W7_F1_LOG_SERVER_ID: u32 = ppc_bitmask32(1, 31);

/// Generation 2 Event Notification Descriptor, eight 32-bit words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct End2 {
    pub w: [u32; 8],
}

impl End2 {
    pub fn is_valid(&self) -> bool {
        self.w[0] & END2_W0_VALID != 0
    }

    pub fn is_enqueue(&self) -> bool {
        self.w[0] & END2_W0_ENQUEUE != 0
    }

    pub fn is_notify(&self) -> bool {
        self.w[0] & END2_W0_UCOND_NOTIFY != 0
    }

    pub fn is_backlog(&self) -> bool {
        self.w[0] & END2_W0_BACKLOG != 0
    }

    pub fn is_precluded_escalation(&self) -> bool {
        self.w[0] & END2_W0_PRECL_ESC_CTL != 0
    }

    pub fn is_escalate(&self) -> bool {
        self.w[0] & END2_W0_ESCALATE_CTL != 0
    }

    pub fn is_escalate_end(&self) -> bool {
        self.w[0] & END2_W0_ADAPTIVE_ESC != 0
    }

    pub fn is_uncond_escalation(&self) -> bool {
        self.w[0] & END2_W0_UNCOND_ESCALATE != 0
    }

    pub fn is_silent_escalation(&self) -> bool {
        self.w[0] & END2_W0_SILENT_ESCALATE != 0
    }

    pub fn is_firmware1(&self) -> bool {
        self.w[0] & END2_W0_FIRMWARE1 != 0
    }

    pub fn is_firmware2(&self) -> bool {
        self.w[0] & END2_W0_FIRMWARE2 != 0
    }

    pub fn qaddr(&self) -> u64 {
        ((get_field32(END2_W2_EQ_ADDR_HI, self.w[2]) as u64) << 32)
            | (self.w[3] & END2_W3_EQ_ADDR_LO) as u64
    }

    pub fn qentries(&self) -> u32 {
        1 << (get_field32(END2_W3_QSIZE, self.w[3]) + 10)
    }

    pub fn qindex(&self) -> u32 {
        get_field32(END2_W1_PAGE_OFF, self.w[1])
    }

    pub fn set_qindex(&mut self, qindex: u32) {
        self.w[1] = set_field32(END2_W1_PAGE_OFF, self.w[1], qindex);
    }

    pub fn qgen(&self) -> u32 {
        get_field32(END2_W1_GENERATION, self.w[1])
    }

    pub fn set_qgen(&mut self, qgen: u32) {
        self.w[1] = set_field32(END2_W1_GENERATION, self.w[1], qgen);
    }

    pub fn set_gen_flipped(&mut self, flipped: bool) {
        self.w[1] = set_field32(END2_W1_GEN_FLIPPED, self.w[1], flipped as u32);
    }

    pub fn format(&self) -> u8 {
        get_field32(END2_W6_FORMAT_BIT, self.w[6]) as u8
    }

    pub fn is_crowd(&self) -> bool {
        self.w[6] & END2_W6_CROWD != 0
    }

    pub fn is_ignore(&self) -> bool {
        self.w[6] & END2_W6_IGNORE != 0
    }

    pub fn vp_block(&self) -> u8 {
        get_field32(END2_W6_VP_BLOCK, self.w[6]) as u8
    }

    pub fn vp_index(&self) -> u32 {
        get_field32(END2_W6_VP_OFFSET, self.w[6])
    }

    pub fn priority(&self) -> u8 {
        get_field32(END2_W7_F0_PRIORITY, self.w[7]) as u8
    }

    pub fn log_server_id(&self) -> u32 {
        get_field32(END2_W7_F1_LOG_SERVER_ID, self.w[7])
    }

    /// Escalation routed through another END, adaptive escalation.
    pub fn escalation_end(&self) -> (u8, u32, u32) {
        (
            get_field32(END2_W4_END_BLOCK, self.w[4]) as u8,
            get_field32(END2_W4_ESC_END_INDEX, self.w[4]),
            get_field32(END2_W5_ESC_END_DATA, self.w[5]),
        )
    }

    /// Escalation routed through a source ESB store, classic escalation.
    pub fn escalation_lisn(&self) -> u32 {
        self.w[4]
    }

    /// The escalation words of a generation 1 style END hold a plain EAS.
    pub fn escalation_eas(&self) -> Eas {
        Eas {
            w: ((self.w[4] as u64) << 32) | self.w[5] as u64,
        }
    }
}

// NVP word 0
pub const NVP2_W0_VALID: u32 = ppc_bit32(0);
pub const NVP2_W0_HW: u32 = ppc_bit32(7);
pub const NVP2_W0_PGOFIRST: u32 = ppc_bitmask32(26, 31);
// NVP word 1: checked-out thread binding and the saved target byte.
pub const NVP2_W1_CO: u32 = ppc_bit32(13);
pub const NVP2_W1_CO_PRIV: u32 = ppc_bitmask32(14, 15);
pub const NVP2_W1_CO_THRID_VALID: u32 = ppc_bit32(16);
pub const NVP2_W1_CO_THRID: u32 = ppc_bitmask32(17, 31);
pub const NVP2_W1_T: u32 = ppc_bitmask32(0, 7);
// NVP word 2: save/restore bytes.
pub const NVP2_W2_CPPR: u32 = ppc_bitmask32(0, 7);
pub const NVP2_W2_IPB: u32 = ppc_bitmask32(8, 15);
pub const NVP2_W2_LSMFB: u32 = ppc_bitmask32(16, 23);
pub const NVP2_W2_LGS: u32 = ppc_bitmask32(24, 31);

/// Notification Virtual Processor, eight 32-bit big-endian words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nvp {
    pub w: [u32; 8],
}

impl Nvp {
    pub fn is_valid(&self) -> bool {
        self.w[0] & NVP2_W0_VALID != 0
    }

    pub fn is_hw(&self) -> bool {
        self.w[0] & NVP2_W0_HW != 0
    }

    pub fn ipb(&self) -> u8 {
        get_field32(NVP2_W2_IPB, self.w[2]) as u8
    }

    pub fn set_ipb(&mut self, ipb: u8) {
        self.w[2] = set_field32(NVP2_W2_IPB, self.w[2], ipb as u32);
    }

    pub fn cppr(&self) -> u8 {
        get_field32(NVP2_W2_CPPR, self.w[2]) as u8
    }

    pub fn set_cppr(&mut self, cppr: u8) {
        self.w[2] = set_field32(NVP2_W2_CPPR, self.w[2], cppr as u32);
    }

    pub fn lsmfb(&self) -> u8 {
        get_field32(NVP2_W2_LSMFB, self.w[2]) as u8
    }

    pub fn set_lsmfb(&mut self, lsmfb: u8) {
        self.w[2] = set_field32(NVP2_W2_LSMFB, self.w[2], lsmfb as u32);
    }

    pub fn lgs(&self) -> u8 {
        get_field32(NVP2_W2_LGS, self.w[2]) as u8
    }

    pub fn set_lgs(&mut self, lgs: u8) {
        self.w[2] = set_field32(NVP2_W2_LGS, self.w[2], lgs as u32);
    }

    pub fn target(&self) -> u8 {
        get_field32(NVP2_W1_T, self.w[1]) as u8
    }

    pub fn set_target(&mut self, t: u8) {
        self.w[1] = set_field32(NVP2_W1_T, self.w[1], t as u32);
    }

    pub fn pgofirst(&self) -> u8 {
        get_field32(NVP2_W0_PGOFIRST, self.w[0]) as u8
    }

    pub fn is_checked_out(&self) -> bool {
        self.w[1] & NVP2_W1_CO != 0
    }

    pub fn set_checked_out(&mut self, co: bool, thread: u16) {
        self.w[1] = set_field32(NVP2_W1_CO, self.w[1], co as u32);
        self.w[1] = set_field32(NVP2_W1_CO_THRID_VALID, self.w[1], co as u32);
        self.w[1] = set_field32(NVP2_W1_CO_THRID, self.w[1], thread as u32);
    }
}

// NVG/NVC word 0
pub const NVGC2_W0_VALID: u32 = ppc_bit32(0);
pub const NVGC2_W0_PGONEXT: u32 = ppc_bitmask32(26, 31);

/// Byte offset of the first backlog counter inside the structure. The
/// eight counters are 3-byte big-endian values laid out back to back
/// from word 2 on.
const NVGC_BACKLOG_BASE: usize = 2 * 4;
const NVGC_BACKLOG_MAX: u32 = 0xff_ffff;

/// Notification Virtual Group/Crowd: the aggregate backlog bookkeeping
/// for group and crowd interrupts, eight 32-bit big-endian words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nvgc {
    pub w: [u32; 8],
}

impl Nvgc {
    pub fn is_valid(&self) -> bool {
        self.w[0] & NVGC2_W0_VALID != 0
    }

    pub fn pgonext(&self) -> u8 {
        get_field32(NVGC2_W0_PGONEXT, self.w[0]) as u8
    }

    fn backlog_bytes(&self, priority: u8) -> Option<usize> {
        if priority > crate::regs::PRIORITY_MAX {
            warn!("XIVE: invalid backlog priority {}", priority);
            return None;
        }
        Some(NVGC_BACKLOG_BASE + priority as usize * 3)
    }

    /// Reads the 24-bit backlog counter for `priority`.
    pub fn backlog(&self, priority: u8) -> u32 {
        let Some(offset) = self.backlog_bytes(priority) else {
            return 0;
        };
        let mut val: u32 = 0;
        for i in offset..offset + 3 {
            val = (val << 8) | self.byte(i) as u32;
        }
        val
    }

    /// Adds `delta` to the counter, saturating at its 24-bit range: the
    /// counter never wraps and never goes negative.
    pub fn backlog_add(&mut self, priority: u8, delta: i32) -> u32 {
        let Some(offset) = self.backlog_bytes(priority) else {
            return 0;
        };
        let old = self.backlog(priority);
        let new = old
            .saturating_add_signed(delta)
            .min(NVGC_BACKLOG_MAX);
        for i in 0..3 {
            self.set_byte(offset + i, (new >> (8 * (2 - i))) as u8);
        }
        new
    }

    fn byte(&self, offset: usize) -> u8 {
        let word = self.w[offset / 4];
        (word >> (8 * (3 - offset % 4))) as u8
    }

    fn set_byte(&mut self, offset: usize, val: u8) {
        let shift = 8 * (3 - offset % 4);
        let word = &mut self.w[offset / 4];
        *word = (*word & !(0xff << shift)) | ((val as u32) << shift);
    }
}

/// Size of a VP group: the position of the first zero, counting from
/// the least significant bit of the NVP index, gives the group span.
pub fn vp_group_size(nvp_index: u32) -> u32 {
    let first_zero = (!nvp_index).trailing_zeros();
    if first_zero >= 31 {
        warn!("XIVE: invalid group index 0x{:08x}", nvp_index);
        return 0;
    }
    1 << (first_zero + 1)
}

/// Encodes the 6-bit group level carried in the NSR: the group span in
/// the low four bits, the crowd span in the upper two.
pub fn group_level(crowd: bool, ignore: bool, nvp_blk: u8, nvp_index: u32) -> u8 {
    if !ignore {
        return 0;
    }

    let first_zero = (!nvp_index).trailing_zeros();
    if first_zero >= 31 {
        warn!("XIVE: invalid group index 0x{:08x}", nvp_index);
        return 0;
    }
    let mut level = ((first_zero + 1) & 0xf) as u8;

    if crowd {
        let first_zero = (!(nvp_blk as u32)).trailing_zeros();
        if first_zero >= 31 {
            warn!("XIVE: invalid crowd block 0x{:02x}", nvp_blk);
            return 0;
        }
        // Crowd spans of 2^1, 2^2 and 2^4 blocks are architected; the
        // 2^4 span is encoded as the value 3.
        let blk = match first_zero + 1 {
            1 => 1,
            2 => 2,
            4 => 3,
            _ => {
                warn!("XIVE: invalid crowd block 0x{:02x}", nvp_blk);
                return 0;
            }
        };
        level |= (blk as u8) << 4;
    }
    level
}

/// Group bits of an NSR group level.
pub fn level_group_size(level: u8) -> u8 {
    level & 0xf
}

/// Crowd bits of an NSR group level, decoded back to a block span.
pub fn level_crowd_size(level: u8) -> u8 {
    match (level >> 4) & 0x3 {
        3 => 4,
        x => x,
    }
}

/// Index of the NVG (or NVC) entry covering `idx` at group level
/// `level`: the level low-order bits are compressed away.
pub fn nvgc_index(idx: u32, level: u8) -> u32 {
    idx >> level_group_size(level)
}

/// Block of the NVC entry covering `blk` for a crowd level.
pub fn nvc_block(blk: u8, level: u8) -> u8 {
    blk >> level_crowd_size(level)
}
