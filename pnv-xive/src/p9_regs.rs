// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! POWER9 interrupt controller register map.
//!
//! The IC register page is split between the three sub-engines:
//! 0x000-0x3FF holds the common queue (PowerBus bridge) registers,
//! 0x400-0x7FF the presenter controller, 0x800-0xFFF the
//! virtualization controller. All registers are 64 bits wide and
//! 8-byte aligned.

use xive::field::{ppc_bit, ppc_bitmask};

//
// CQ: PowerBus bridge configuration and BARs
//
pub const CQ_CFG_PB_GEN: u64 = 0x050;
pub const CQ_MSGSND: u64 = 0x058;
pub const CQ_IC_BAR: u64 = 0x080;
pub const CQ_TM1_BAR: u64 = 0x088;
pub const CQ_TM2_BAR: u64 = 0x090;
pub const CQ_PC_BARM: u64 = 0x098;
pub const CQ_PC_BAR: u64 = 0x0a0;
pub const CQ_VC_BARM: u64 = 0x0a8;
pub const CQ_VC_BAR: u64 = 0x0b0;
pub const CQ_PBI_CTL: u64 = 0x0b8;
pub const CQ_FIRMASK_OR: u64 = 0x0e0;
pub const CQ_RST_CTL: u64 = 0x0e8;
pub const CQ_TAR: u64 = 0x0f0;
pub const CQ_TDR: u64 = 0x0f8;

pub const CQ_IC_BAR_VALID: u64 = ppc_bit(0);
pub const CQ_IC_BAR_64K: u64 = ppc_bit(1);
pub const CQ_TM_BAR_VALID: u64 = ppc_bit(0);
pub const CQ_TM_BAR_64K: u64 = ppc_bit(1);
pub const CQ_PC_BAR_VALID: u64 = ppc_bit(0);
pub const CQ_VC_BAR_VALID: u64 = ppc_bit(0);
pub const CQ_PBI_PC_64K: u64 = ppc_bit(5);
pub const CQ_PBI_VC_64K: u64 = ppc_bit(6);

// Table address register: table select, entry select, auto-increment.
pub const CQ_TAR_TSEL: u64 = ppc_bitmask(0, 2);
pub const CQ_TAR_TBL_AUTOINC: u64 = ppc_bit(3);
pub const CQ_TAR_TSEL_INDEX: u64 = ppc_bitmask(58, 63);

pub const CQ_TAR_TSEL_BLK: u64 = 0;
pub const CQ_TAR_TSEL_MIG: u64 = 1;
pub const CQ_TAR_TSEL_VDT: u64 = 2;
pub const CQ_TAR_TSEL_EDT: u64 = 3;

// EDT entries split the VC space between IPI and END ESB pages.
pub const CQ_TDR_EDT_TYPE: u64 = ppc_bitmask(0, 3);
pub const CQ_TDR_EDT_IPI: u64 = 0;
pub const CQ_TDR_EDT_EQ: u64 = 1;

//
// PC: presenter controller
//
pub const PC_GLOBAL_CONFIG: u64 = 0x400;
pub const PC_TCTXT_CFG: u64 = 0x408;
pub const PC_TCTXT_TRACK: u64 = 0x410;
pub const PC_THREAD_EN_REG0: u64 = 0x418;
pub const PC_THREAD_EN_REG0_SET: u64 = 0x420;
pub const PC_THREAD_EN_REG0_CLR: u64 = 0x428;
pub const PC_THREAD_EN_REG1: u64 = 0x430;
pub const PC_THREAD_EN_REG1_SET: u64 = 0x438;
pub const PC_THREAD_EN_REG1_CLR: u64 = 0x440;
pub const PC_TCTXT_INDIR0: u64 = 0x448;
pub const PC_TCTXT_INDIR1: u64 = 0x450;
pub const PC_TCTXT_INDIR2: u64 = 0x458;
pub const PC_TCTXT_INDIR3: u64 = 0x460;
pub const PC_VSD_TABLE_ADDR: u64 = 0x468;
pub const PC_VSD_TABLE_DATA: u64 = 0x470;
pub const PC_VPC_CWATCH_SPEC: u64 = 0x478;
pub const PC_VPC_CWATCH_DAT0: u64 = 0x480;
pub const PC_VPC_CWATCH_DAT7: u64 = 0x4b8;
pub const PC_VPC_SCRUB_TRIG: u64 = 0x4c0;
pub const PC_VPC_SCRUB_MASK: u64 = 0x4c8;
pub const PC_AT_KILL: u64 = 0x4d0;
pub const PC_AT_KILL_MASK: u64 = 0x4d8;

pub const PC_TCTXT_CHIPID_OVERRIDE: u64 = ppc_bit(0);
pub const PC_TCTXT_CHIPID: u64 = ppc_bitmask(8, 11);
pub const PC_VPC_CWATCH_CONFLICT: u64 = ppc_bit(0);
pub const PC_VPC_CWATCH_FULL: u64 = ppc_bit(8);
pub const PC_VPC_CWATCH_BLOCKID: u64 = ppc_bitmask(4, 7);
pub const PC_VPC_CWATCH_OFFSET: u64 = ppc_bitmask(8, 31);
pub const PC_AT_KILL_VALID: u64 = ppc_bit(0);

//
// VC: virtualization controller
//
pub const VC_GLOBAL_CONFIG: u64 = 0x800;
pub const VC_VSD_TABLE_ADDR: u64 = 0x808;
pub const VC_VSD_TABLE_DATA: u64 = 0x810;
pub const VC_SBC_CONFIG: u64 = 0x818;
pub const VC_EQC_CONFIG: u64 = 0x820;
pub const VC_EQC_CWATCH_SPEC: u64 = 0x828;
pub const VC_EQC_CWATCH_DAT0: u64 = 0x830;
pub const VC_EQC_CWATCH_DAT3: u64 = 0x848;
pub const VC_EQC_SCRUB_TRIG: u64 = 0x850;
pub const VC_EQC_SCRUB_MASK: u64 = 0x858;
pub const VC_IVC_SCRUB_TRIG: u64 = 0x860;
pub const VC_IVC_SCRUB_MASK: u64 = 0x868;
pub const VC_AIB_TX_ORDER_TAG2: u64 = 0x870;
pub const VC_AT_MACRO_KILL: u64 = 0x878;
pub const VC_AT_MACRO_KILL_MASK: u64 = 0x880;
pub const VC_IRQ_CONFIG_IPI: u64 = 0x888;
pub const VC_IRQ_CONFIG_HW: u64 = 0x890;
pub const VC_IRQ_CONFIG_CASCADE1: u64 = 0x898;
pub const VC_IRQ_CONFIG_CASCADE2: u64 = 0x8a0;
pub const VC_IRQ_CONFIG_REDIST: u64 = 0x8a8;
pub const VC_IRQ_CONFIG_IPI_CASC: u64 = 0x8b0;

pub const VC_GCONF_INDIRECT: u64 = ppc_bit(32);
pub const VC_SBC_CONF_CPLX_CIST: u64 = ppc_bit(44);
pub const VC_SBC_CONF_CIST_BOTH: u64 = ppc_bit(45);
pub const VC_EQC_SYNC_MASK: u64 = ppc_bitmask(56, 63);
pub const VC_EQC_CWATCH_CONFLICT: u64 = ppc_bit(0);
pub const VC_EQC_CWATCH_FULL: u64 = ppc_bit(8);
pub const VC_EQC_CWATCH_BLOCKID: u64 = ppc_bitmask(4, 7);
pub const VC_EQC_CWATCH_OFFSET: u64 = ppc_bitmask(8, 31);
pub const VC_KILL_VALID: u64 = ppc_bit(0);
pub const VC_SCRUB_VALID: u64 = ppc_bit(0);

// VSD table selection, shared by the VC and PC programming models.
pub const VST_TABLE_SELECT: u64 = ppc_bitmask(8, 15);
pub const VST_TABLE_BLOCK: u64 = ppc_bitmask(16, 23);

/// Size of the modeled register file.
pub const IC_REG_SIZE: usize = 0x1000;

//
// Notify port page
//
pub const NOTIFY_FORWARD_IPI: u64 = 0x800;
pub const NOTIFY_FORWARD_HW: u64 = 0x880;
pub const NOTIFY_FORWARD_OS_ESC: u64 = 0x900;
pub const NOTIFY_FORWARD_HW_ESC: u64 = 0x980;
pub const NOTIFY_FORWARD_REDIS: u64 = 0xa00;
pub const NOTIFY_SYNC_IPI: u64 = 0xc00;
pub const NOTIFY_SYNC_HW: u64 = 0xc80;
pub const NOTIFY_SYNC_OS_ESC: u64 = 0xd00;
pub const NOTIFY_SYNC_HW_ESC: u64 = 0xd80;
pub const NOTIFY_SYNC_REDIS: u64 = 0xe00;
pub const NOTIFY_SYNC_PULL: u64 = 0xe80;
pub const NOTIFY_SYNC_PUSH: u64 = 0xf00;
pub const NOTIFY_SYNC_VPC: u64 = 0xf80;
