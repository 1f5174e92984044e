// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Generation 1 in-memory structure layouts and the thread interrupt
//! management area register map.
//!
//! All words are big-endian on the wire; the layouts below are the ABI
//! shared with guest firmware and must be preserved bit for bit.

use serde::{Deserialize, Serialize};

use crate::field::{
    get_field32, get_field64, ppc_bit, ppc_bit32, ppc_bit8, ppc_bitmask, ppc_bitmask32,
    set_field32, set_field64,
};

/// Interrupt priorities are 0 (most favored) to 7 (least favored).
pub const PRIORITY_MAX: u8 = 7;

/// Converts a priority to its Interrupt Pending Buffer bit.
pub fn priority_to_ipb(priority: u8) -> u8 {
    if priority <= PRIORITY_MAX {
        0x80 >> priority
    } else {
        0
    }
}

/// Converts an IPB to a Pending Interrupt Priority value: the position
/// of the highest (most favored) bit set, or 0xFF when the IPB is empty.
pub fn ipb_to_pipr(ipb: u8) -> u8 {
    if ipb == 0 {
        0xff
    } else {
        ipb.leading_zeros() as u8
    }
}

/// Converts a raw priority to a PIPR value without going through the IPB,
/// used when presenting group interrupts.
pub fn priority_to_pipr(priority: u8) -> u8 {
    if priority <= PRIORITY_MAX {
        priority
    } else {
        0xff
    }
}

/// Event Assignment Structure: the source to END binding, one 64-bit
/// big-endian word per interrupt source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eas {
    pub w: u64,
}

pub const EAS_VALID: u64 = ppc_bit(0);
pub const EAS_MASKED: u64 = ppc_bit(1);
pub const EAS_END_BLOCK: u64 = ppc_bitmask(4, 7);
pub const EAS_END_INDEX: u64 = ppc_bitmask(8, 31);
pub const EAS_END_DATA: u64 = ppc_bitmask(33, 63);

impl Eas {
    pub fn new(end_blk: u8, end_idx: u32, data: u32) -> Self {
        let mut w = EAS_VALID;
        w = set_field64(EAS_END_BLOCK, w, end_blk as u64);
        w = set_field64(EAS_END_INDEX, w, end_idx as u64);
        w = set_field64(EAS_END_DATA, w, data as u64);
        Eas { w }
    }

    pub fn is_valid(&self) -> bool {
        self.w & EAS_VALID != 0
    }

    pub fn is_masked(&self) -> bool {
        self.w & EAS_MASKED != 0
    }

    pub fn set_masked(&mut self, masked: bool) {
        if masked {
            self.w |= EAS_MASKED;
        } else {
            self.w &= !EAS_MASKED;
        }
    }

    pub fn end_block(&self) -> u8 {
        get_field64(EAS_END_BLOCK, self.w) as u8
    }

    pub fn end_index(&self) -> u32 {
        get_field64(EAS_END_INDEX, self.w) as u32
    }

    pub fn end_data(&self) -> u32 {
        get_field64(EAS_END_DATA, self.w) as u32
    }
}

// END word 0
pub const END_W0_VALID: u32 = ppc_bit32(0);
pub const END_W0_ENQUEUE: u32 = ppc_bit32(1);
pub const END_W0_UCOND_NOTIFY: u32 = ppc_bit32(2);
pub const END_W0_BACKLOG: u32 = ppc_bit32(3);
pub const END_W0_PRECL_ESC_CTL: u32 = ppc_bit32(4);
pub const END_W0_ESCALATE_CTL: u32 = ppc_bit32(5);
pub const END_W0_UNCOND_ESCALATE: u32 = ppc_bit32(6);
pub const END_W0_SILENT_ESCALATE: u32 = ppc_bit32(7);
pub const END_W0_QSIZE: u32 = ppc_bitmask32(12, 15);
pub const END_W0_FIRMWARE: u32 = ppc_bit32(16);
// END word 1
pub const END_W1_ESN: u32 = ppc_bitmask32(0, 1);
pub const END_W1_ESE: u32 = ppc_bitmask32(2, 3);
pub const END_W1_GENERATION: u32 = ppc_bit32(9);
pub const END_W1_PAGE_OFF: u32 = ppc_bitmask32(10, 31);
// END word 2
pub const END_W2_OP_DESC_HI: u32 = ppc_bitmask32(4, 31);
// END word 4
pub const END_W4_ESC_END_BLOCK: u32 = ppc_bitmask32(4, 7);
pub const END_W4_ESC_END_INDEX: u32 = ppc_bitmask32(8, 31);
// END word 5
pub const END_W5_ESC_END_DATA: u32 = ppc_bitmask32(1, 31);
// END word 6
pub const END_W6_FORMAT_BIT: u32 = ppc_bit32(8);
pub const END_W6_NVT_BLOCK: u32 = ppc_bitmask32(9, 12);
pub const END_W6_NVT_INDEX: u32 = ppc_bitmask32(13, 31);
// END word 7
pub const END_W7_F0_IGNORE: u32 = ppc_bit32(0);
pub const END_W7_F0_BLK_GROUPING: u32 = ppc_bit32(1);
pub const END_W7_F0_PRIORITY: u32 = ppc_bitmask32(8, 15);
pub const END_W7_F1_ELIGIBLE: u32 = ppc_bit32(0);
pub const END_W7_F1_LOG_SERVER_ID: u32 = ppc_bitmask32(1, 31);

/// Event Notification Descriptor: the event queue and notification
/// target configuration for one (target, priority) pair. Eight 32-bit
/// big-endian words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct End {
    pub w: [u32; 8],
}

impl End {
    pub fn is_valid(&self) -> bool {
        self.w[0] & END_W0_VALID != 0
    }

    pub fn is_enqueue(&self) -> bool {
        self.w[0] & END_W0_ENQUEUE != 0
    }

    pub fn is_notify(&self) -> bool {
        self.w[0] & END_W0_UCOND_NOTIFY != 0
    }

    pub fn is_backlog(&self) -> bool {
        self.w[0] & END_W0_BACKLOG != 0
    }

    pub fn is_escalate(&self) -> bool {
        self.w[0] & END_W0_ESCALATE_CTL != 0
    }

    pub fn is_uncond_escalation(&self) -> bool {
        self.w[0] & END_W0_UNCOND_ESCALATE != 0
    }

    pub fn is_silent_escalation(&self) -> bool {
        self.w[0] & END_W0_SILENT_ESCALATE != 0
    }

    pub fn is_firmware(&self) -> bool {
        self.w[0] & END_W0_FIRMWARE != 0
    }

    /// Base address of the event queue in guest memory.
    pub fn qaddr(&self) -> u64 {
        (((self.w[2] & 0x0fff_ffff) as u64) << 32) | self.w[3] as u64
    }

    /// Number of 32-bit entries in the event queue.
    pub fn qentries(&self) -> u32 {
        1 << (get_field32(END_W0_QSIZE, self.w[0]) + 10)
    }

    pub fn qindex(&self) -> u32 {
        get_field32(END_W1_PAGE_OFF, self.w[1])
    }

    pub fn set_qindex(&mut self, qindex: u32) {
        self.w[1] = set_field32(END_W1_PAGE_OFF, self.w[1], qindex);
    }

    pub fn qgen(&self) -> u32 {
        get_field32(END_W1_GENERATION, self.w[1])
    }

    pub fn set_qgen(&mut self, qgen: u32) {
        self.w[1] = set_field32(END_W1_GENERATION, self.w[1], qgen);
    }

    pub fn format(&self) -> u8 {
        get_field32(END_W6_FORMAT_BIT, self.w[6]) as u8
    }

    pub fn nvt_block(&self) -> u8 {
        get_field32(END_W6_NVT_BLOCK, self.w[6]) as u8
    }

    pub fn nvt_index(&self) -> u32 {
        get_field32(END_W6_NVT_INDEX, self.w[6])
    }

    pub fn priority(&self) -> u8 {
        get_field32(END_W7_F0_PRIORITY, self.w[7]) as u8
    }

    pub fn is_ignore(&self) -> bool {
        self.w[7] & END_W7_F0_IGNORE != 0
    }

    pub fn log_server_id(&self) -> u32 {
        get_field32(END_W7_F1_LOG_SERVER_ID, self.w[7])
    }

    /// Words 4 and 5 hold an EAS routing the escalation event.
    pub fn escalation_eas(&self) -> Eas {
        Eas {
            w: ((self.w[4] as u64) << 32) | self.w[5] as u64,
        }
    }
}

// NVT word 0
pub const NVT_W0_VALID: u32 = ppc_bit32(0);
// NVT word 4
pub const NVT_W4_IPB: u32 = ppc_bitmask32(16, 23);

/// Notification Virtual Target: the per virtual processor interrupt
/// context descriptor. Sixteen 32-bit big-endian words.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nvt {
    pub w: [u32; 16],
}

impl Default for Nvt {
    fn default() -> Self {
        Nvt { w: [0; 16] }
    }
}

impl Nvt {
    pub fn is_valid(&self) -> bool {
        self.w[0] & NVT_W0_VALID != 0
    }

    pub fn ipb(&self) -> u8 {
        get_field32(NVT_W4_IPB, self.w[4]) as u8
    }

    pub fn set_ipb(&mut self, ipb: u8) {
        self.w[4] = set_field32(NVT_W4_IPB, self.w[4], ipb as u32);
    }
}

/// NVT identifiers are 19-bit indexes qualified by a 4-bit block.
pub const NVT_INDEX_BITS: u32 = 19;

/// Encodes a CAM line value from an NVT identifier.
pub fn nvt_cam_line(nvt_blk: u8, nvt_idx: u32) -> u32 {
    ((nvt_blk as u32) << NVT_INDEX_BITS) | (nvt_idx & ((1 << NVT_INDEX_BITS) - 1))
}

pub fn nvt_cam_blk(cam: u32) -> u8 {
    ((cam >> NVT_INDEX_BITS) & 0xf) as u8
}

pub fn nvt_cam_idx(cam: u32) -> u32 {
    cam & ((1 << NVT_INDEX_BITS) - 1)
}

//
// Thread Interrupt Management Area
//
// The four rings of the thread context, as byte offsets into the 64
// byte register file.
//
pub const TM_QW0_USER: usize = 0x0;
pub const TM_QW1_OS: usize = 0x10;
pub const TM_QW2_HV_POOL: usize = 0x20;
pub const TM_QW3_HV_PHYS: usize = 0x30;

pub const TM_RING_COUNT: usize = 4;
pub const TM_RING_SIZE: usize = 0x10;

// Byte offsets of the registers inside a ring.
pub const TM_NSR: usize = 0x0;
pub const TM_CPPR: usize = 0x1;
pub const TM_IPB: usize = 0x2;
pub const TM_LSMFB: usize = 0x3;
pub const TM_ACK_CNT: usize = 0x4;
pub const TM_INC: usize = 0x5;
pub const TM_LGS: usize = 0x5;
pub const TM_AGE: usize = 0x6;
pub const TM_T: usize = 0x6;
pub const TM_PIPR: usize = 0x7;
pub const TM_WORD2: usize = 0x8;
pub const TM_OGEN: usize = 0xf;

// CAM line word 2 layouts, per ring.
pub const TM_QW0W2_VU: u32 = ppc_bit32(0);
pub const TM_QW0W2_LOGIC_SERV: u32 = ppc_bitmask32(1, 31);
pub const TM_QW1W2_VO: u32 = ppc_bit32(0);
pub const TM_QW1W2_HO: u32 = ppc_bit32(1);
pub const TM_QW1W2_OS_CAM: u32 = ppc_bitmask32(8, 31);
pub const TM_QW2W2_VP: u32 = ppc_bit32(0);
pub const TM_QW2W2_POOL_CAM: u32 = ppc_bitmask32(8, 31);
pub const TM_QW3W2_VT: u32 = ppc_bit32(0);
pub const TM_QW3B8_VT: u8 = ppc_bit8(0);

// Notification Status Register encodings.
pub const TM_QW1_NSR_EO: u8 = ppc_bit8(0);
pub const TM_QW3_NSR_HE: u8 = 0xc0;
pub const TM_QW3_NSR_HE_NONE: u8 = 0;
pub const TM_QW3_NSR_HE_POOL: u8 = 1;
pub const TM_QW3_NSR_HE_PHYS: u8 = 2;
pub const TM_QW3_NSR_HE_LSI: u8 = 3;
pub const TM_NSR_GRP_LVL: u8 = 0x3f;

// TIMA address decoding: four page views of the same registers, with a
// special-operation region flagged by bit 11.
pub const TM_SHIFT: u64 = 12;
pub const TM_RING_OFFSET: u64 = 0x30;
pub const TM_REG_OFFSET: u64 = 0x3f;
pub const TM_ADDRESS_MASK: u64 = 0xfff;
pub const TM_SPECIAL_OP: u64 = 0x800;

pub const TM_HW_PAGE: u8 = 0;
pub const TM_HV_PAGE: u8 = 1;
pub const TM_OS_PAGE: u8 = 2;
pub const TM_USER_PAGE: u8 = 3;

// Special operations, dispatched by exact (page, offset, size) match.
pub const TM_SPC_ACK_EBB: u64 = 0x800;
pub const TM_SPC_PULL_USR_CTX: u64 = 0x808;
pub const TM_SPC_ACK_OS_REG: u64 = 0x810;
pub const TM_SPC_PULL_OS_CTX_G2: u64 = 0x810;
pub const TM_SPC_SET_OS_PENDING: u64 = 0x812;
pub const TM_SPC_PULL_OS_CTX: u64 = 0x818;
pub const TM_SPC_PULL_POOL_CTX_G2: u64 = 0x820;
pub const TM_SPC_PULL_POOL_CTX: u64 = 0x828;
pub const TM_SPC_ACK_HV_REG: u64 = 0x830;
pub const TM_SPC_PULL_PHYS_CTX_G2: u64 = 0x830;
pub const TM_SPC_PULL_PHYS_CTX: u64 = 0x838;
pub const TM_SPC_PULL_USR_CTX_OL: u64 = 0xc08;
pub const TM_SPC_ACK_OS_EL: u64 = 0xc10;
pub const TM_SPC_PULL_OS_CTX_OL: u64 = 0xc18;
pub const TM_SPC_ACK_HV_POOL_EL: u64 = 0xc20;
pub const TM_SPC_ACK_HV_EL: u64 = 0xc30;
pub const TM_SPC_PULL_PHYS_CTX_OL: u64 = 0xc38;
