// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! POWER9 chip interrupt controller.
//!
//! The chip front-end owns the configuration surface: the BARs carving
//! the MMIO windows, the set translation tables splitting the VC space
//! between IPI and END ESB pages, the VSD registration protocol feeding
//! the VST resolver, the thread enable registers gating the presenter,
//! and the cache watch engines that read and write table entries word
//! by word. It implements the router operations over the tables it
//! resolves in guest memory.

use std::result;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use vm_memory::GuestAddressSpace;
use vm_migration::{Migratable, MigratableError, Pausable, Snapshot, Snapshottable};
use xive::field::{get_field64, ppc_bit, set_field64, words_from_be, words_to_be};
use xive::regs::{nvt_cam_line, Eas, End, Nvt};
use xive::router::{
    end_notify, lisn, router_notify, scan_for_match, MatchOutcome, NvtMatchSpec, XiveRouter,
};
use xive::source::{SourceFlags, XiveSource, ESB_64K_2PAGE};
use xive::tctx::{Ring, Tctx};
use xive::{
    tima, BusDevice, Error, GuestMemoryAtomic, GuestMemoryMmap, InterruptLine, PresenterConfig,
    Result,
};

use crate::p9_regs::*;
use crate::vst::{
    page_size_allowed, vsd_mode, vsd_page_shift, Vst, VstInfo, VSD_ADDRESS_MASK, VSD_INDIRECT,
    VSD_MODE_EXCLUSIVE, VSD_MODE_FORWARD,
};
use xive::end_source::EndSource;
use xive::source::ESB_64K;

// Virtual structure tables of the POWER9 engine.
pub const VST_TSEL_IVT: usize = 0;
pub const VST_TSEL_SBE: usize = 1;
pub const VST_TSEL_EQDT: usize = 2;
pub const VST_TSEL_VPDT: usize = 3;
pub const VST_TSEL_IRQ: usize = 4;

const SBE_PER_BYTE: u64 = 4;

static VST_INFOS: &[VstInfo] = &[
    VstInfo { name: "EAT", size: 8, max_blocks: 16 },
    VstInfo { name: "SBE", size: 1, max_blocks: 16 },
    VstInfo { name: "ENDT", size: 32, max_blocks: 16 },
    VstInfo { name: "VPDT", size: 64, max_blocks: 32 },
    // Interrupt fifo backing store table (not modeled)
    VstInfo { name: "IRQ", size: 1, max_blocks: 6 },
];

const TABLE_BLK_MAX: usize = 16;
const TABLE_MIG_MAX: usize = 16;
const TABLE_VDT_MAX: usize = 64;
const TABLE_EDT_MAX: usize = 64;

/// Number of interrupt sources of the internal IPI source.
const NR_IPIS: u32 = 4096;
/// Number of ENDs served by the END ESB window.
const NR_ENDS: u32 = 256;

/// POWER9 chip interrupt controller.
pub struct PnvXive {
    id: String,
    chip_id: u8,

    regs: Vec<u64>,
    blk: [u64; TABLE_BLK_MAX],
    mig: [u64; TABLE_MIG_MAX],
    vdt: [u64; TABLE_VDT_MAX],
    edt: [u64; TABLE_EDT_MAX],

    vst: Vst,
    ipi_source: XiveSource,
    end_source: EndSource,
    threads: Vec<Tctx>,

    /// Chip id presented on the CAM lines, normally the chip id but it
    /// can be overridden for debug.
    tctx_chipid: u8,

    ic_base: u64,
    ic_shift: u32,
    tm_base: u64,
    tm_shift: u32,
    pc_base: u64,
    vc_base: u64,

    mem: GuestMemoryAtomic<GuestMemoryMmap>,
}

#[derive(Serialize, Deserialize)]
pub struct PnvXiveState {
    regs: Vec<u64>,
    blk: Vec<u64>,
    mig: Vec<u64>,
    vdt: Vec<u64>,
    edt: Vec<u64>,
    vsds: Vec<Vec<u64>>,
    tctx_chipid: u8,
}

impl PnvXive {
    pub fn new(
        id: String,
        chip_id: u8,
        mem: GuestMemoryAtomic<GuestMemoryMmap>,
    ) -> result::Result<Self, xive::source::Error> {
        let ipi_source = XiveSource::new(
            format!("{}-ipi", id),
            NR_IPIS,
            ESB_64K_2PAGE,
            SourceFlags::empty(),
        )?;
        let end_source = EndSource::new(NR_ENDS, ESB_64K).expect("END source setting");

        Ok(PnvXive {
            id,
            chip_id,
            regs: vec![0; IC_REG_SIZE >> 3],
            blk: [0; TABLE_BLK_MAX],
            mig: [0; TABLE_MIG_MAX],
            vdt: [0; TABLE_VDT_MAX],
            edt: [0; TABLE_EDT_MAX],
            vst: Vst::new(VST_INFOS),
            ipi_source,
            end_source,
            threads: Vec::new(),
            tctx_chipid: chip_id,
            ic_base: 0,
            ic_shift: 12,
            tm_base: 0,
            tm_shift: 12,
            pc_base: 0,
            vc_base: 0,
            mem,
        })
    }

    /// Creates the interrupt management context of one hardware thread.
    pub fn add_thread(
        &mut self,
        pir: u32,
        os_line: Arc<dyn InterruptLine>,
        hv_line: Arc<dyn InterruptLine>,
    ) -> usize {
        let mut tctx = Tctx::new(os_line, hv_line);
        tctx.pir = pir;
        // The HW CAM line is hardwired from the chip and thread ids in
        // block group mode: chip << 19 | 0b1 << 7 | thread.
        tctx.hw_cam = nvt_cam_line(self.tctx_chipid, (1 << 7) | (pir & 0x7f));
        tctx.reset(self.presenter_config());
        self.threads.push(tctx);
        self.threads.len() - 1
    }

    pub fn presenter_config(&self) -> PresenterConfig {
        PresenterConfig::GEN1_TIMA_OS
    }

    pub fn ipi_source(&mut self) -> &mut XiveSource {
        &mut self.ipi_source
    }

    pub fn thread(&mut self, index: usize) -> &mut Tctx {
        &mut self.threads[index]
    }

    fn reg(&self, offset: u64) -> u64 {
        self.regs[(offset >> 3) as usize]
    }

    fn set_reg(&mut self, offset: u64, val: u64) {
        self.regs[(offset >> 3) as usize] = val;
    }

    fn thread_index(&self, pir: u32) -> Option<usize> {
        self.threads.iter().position(|t| t.pir == pir)
    }

    fn thread_enabled(&self, pir: u32) -> bool {
        let reg = if pir & 0x40 == 0 {
            PC_THREAD_EN_REG0
        } else {
            PC_THREAD_EN_REG1
        };
        self.reg(reg) & ppc_bit(pir & 0x3f) != 0
    }

    /// Enables a hardware thread, the firmware path being a store to
    /// the PC_THREAD_EN_REGx_SET register.
    pub fn enable_thread(&mut self, pir: u32) {
        let reg = if pir & 0x40 == 0 {
            PC_THREAD_EN_REG0
        } else {
            PC_THREAD_EN_REG1
        };
        let val = self.reg(reg) | ppc_bit(pir & 0x3f);
        self.set_reg(reg, val);
    }

    //
    // EDT: the VC BAR is sub-divided into 64 sets mapped to either the
    // IPI ESB pages or the END ESB pages, at the firmware's choice.
    //

    fn vc_size(&self) -> u64 {
        (!self.reg(CQ_VC_BARM)).wrapping_add(1) & 0x0000_ffff_ffff_ffff
    }

    fn edt_shift(&self) -> u32 {
        (self.vc_size() / TABLE_EDT_MAX as u64).trailing_zeros()
    }

    /// Overall size of the IPI or the END ESB windows.
    pub fn edt_size(&self, edt_type: u64) -> u64 {
        let edt_size = 1u64 << self.edt_shift();

        self.edt
            .iter()
            .filter(|&&entry| get_field64(CQ_TDR_EDT_TYPE, entry) == edt_type)
            .count() as u64
            * edt_size
    }

    /// Maps an offset of the VC region into the IPI or END region,
    /// using the layout defined by the EDT table.
    pub fn edt_offset(&self, vc_offset: u64, edt_type: u64) -> u64 {
        let edt_size = 1u64 << self.edt_shift();
        let mut edt_offset = vc_offset;

        for i in 0..TABLE_EDT_MAX {
            if (i as u64 * edt_size) >= vc_offset {
                break;
            }
            if get_field64(CQ_TDR_EDT_TYPE, self.edt[i]) != edt_type {
                edt_offset -= edt_size;
            }
        }

        edt_offset
    }

    //
    // Table configuration: a table select write to CQ_TAR followed by
    // data writes to CQ_TDR.
    //

    fn table_set_data(&mut self, val: u64) {
        let tar = self.reg(CQ_TAR);
        let tsel = get_field64(CQ_TAR_TSEL, tar);
        let mut tsel_index = get_field64(CQ_TAR_TSEL_INDEX, tar) as usize;

        let max_index = match tsel {
            CQ_TAR_TSEL_BLK => self.blk.len(),
            CQ_TAR_TSEL_MIG => self.mig.len(),
            CQ_TAR_TSEL_EDT => self.edt.len(),
            CQ_TAR_TSEL_VDT => self.vdt.len(),
            _ => {
                warn!("XIVE[{:x}] - IC: invalid table {}", self.chip_id, tsel);
                return;
            }
        };

        if tsel_index >= max_index {
            warn!("XIVE[{:x}] - IC: invalid index {}", self.chip_id, tsel_index);
            return;
        }

        match tsel {
            CQ_TAR_TSEL_BLK => self.blk[tsel_index] = val,
            CQ_TAR_TSEL_MIG => self.mig[tsel_index] = val,
            CQ_TAR_TSEL_EDT => self.edt[tsel_index] = val,
            CQ_TAR_TSEL_VDT => self.vdt[tsel_index] = val,
            _ => unreachable!(),
        }

        if tar & CQ_TAR_TBL_AUTOINC != 0 {
            tsel_index += 1;
            self.set_reg(CQ_TAR, set_field64(CQ_TAR_TSEL_INDEX, tar, tsel_index as u64));
        }
    }

    //
    // VSD registration
    //

    fn vst_set_exclusive(&mut self, table: usize, blk: u8, vsd: u64) {
        let info = self.vst.info(table);
        let page_shift = vsd_page_shift(vsd);
        let vst_addr = vsd & VSD_ADDRESS_MASK;

        if vsd & VSD_INDIRECT != 0 {
            if self.reg(VC_GLOBAL_CONFIG) & VC_GCONF_INDIRECT == 0 {
                warn!(
                    "XIVE[{:x}] - VST: {} indirect tables are not enabled",
                    self.chip_id, info.name
                );
                return;
            }
            if !page_size_allowed(page_shift) {
                warn!(
                    "XIVE[{:x}] - VST: invalid {} page shift {}",
                    self.chip_id, info.name, page_shift
                );
                return;
            }
        }

        if vst_addr % (1u64 << page_shift) != 0 {
            warn!(
                "XIVE[{:x}] - VST: {} table address 0x{:x} is not aligned with page shift {}",
                self.chip_id, info.name, vst_addr, page_shift
            );
            return;
        }

        // Record the table configuration (in SRAM on HW)
        self.vst.set_vsd(table, blk, vsd);
    }

    fn vst_set_data(&mut self, vsd: u64, pc_engine: bool) {
        let table_addr = self.reg(VC_VSD_TABLE_ADDR);
        let table = get_field64(VST_TABLE_SELECT, table_addr) as usize;
        let blk = get_field64(VST_TABLE_BLOCK, table_addr) as u8;
        let vst_addr = vsd & VSD_ADDRESS_MASK;

        if table > VST_TSEL_IRQ {
            warn!("XIVE[{:x}] - VST: invalid table type {}", self.chip_id, table);
            return;
        }

        if blk as u32 >= self.vst.info(table).max_blocks {
            warn!(
                "XIVE[{:x}] - VST: invalid block id {} for {} table",
                self.chip_id,
                blk,
                self.vst.info(table).name
            );
            return;
        }

        // Only the VC sub-engine configuration is taken into account:
        // the router model combines both VC and PC sub-engines.
        if pc_engine {
            return;
        }

        if vst_addr == 0 {
            warn!(
                "XIVE[{:x}] - VST: invalid {} table address",
                self.chip_id,
                self.vst.info(table).name
            );
            return;
        }

        match vsd_mode(vsd) {
            VSD_MODE_FORWARD => self.vst.set_vsd(table, blk, vsd),
            VSD_MODE_EXCLUSIVE => self.vst_set_exclusive(table, blk, vsd),
            mode => {
                warn!("XIVE[{:x}] - VST: unsupported table mode {}", self.chip_id, mode);
            }
        }
    }

    /// Number of interrupts provisioned by the firmware through the SBE
    /// backing store.
    pub fn nr_ipis(&self) -> u64 {
        let vsd = self.vst.vsd(VST_TSEL_SBE, self.chip_id);
        self.vst.declared_size(&self.mem.memory(), vsd) * SBE_PER_BYTE
    }

    /// Number of ENDs provisioned by the firmware.
    pub fn nr_ends(&self) -> u64 {
        let vsd = self.vst.vsd(VST_TSEL_EQDT, self.chip_id);
        self.vst.declared_size(&self.mem.memory(), vsd) / VST_INFOS[VST_TSEL_EQDT].size as u64
    }

    //
    // Cache watch engines: the SPEC register selects an entry, the DATA
    // registers image it. Writing DATA0 triggers the table update,
    // reading DATA0 loads the entry image.
    //

    fn end_update(&mut self) {
        let spec = self.reg(VC_EQC_CWATCH_SPEC);
        let blk = get_field64(VC_EQC_CWATCH_BLOCKID, spec) as u8;
        let idx = get_field64(VC_EQC_CWATCH_OFFSET, spec) as u32;

        let mut end = End::default();
        for i in 0..4 {
            let dword = self.reg(VC_EQC_CWATCH_DAT0 + 8 * i as u64);
            end.w[i * 2] = (dword >> 32) as u32;
            end.w[i * 2 + 1] = dword as u32;
        }

        if self.write_end(blk, idx, &end, None).is_err() {
            warn!("XIVE[{:x}] - VST: no END entry {:x}/{:x} !?", self.chip_id, blk, idx);
        }
    }

    fn end_cache_load(&mut self) {
        let spec = self.reg(VC_EQC_CWATCH_SPEC);
        let blk = get_field64(VC_EQC_CWATCH_BLOCKID, spec) as u8;
        let idx = get_field64(VC_EQC_CWATCH_OFFSET, spec) as u32;

        let end = match self.get_end(blk, idx) {
            Ok(end) => end,
            Err(_) => {
                warn!("XIVE[{:x}] - VST: no END entry {:x}/{:x} !?", self.chip_id, blk, idx);
                End::default()
            }
        };

        for i in 0..4 {
            let dword = ((end.w[i * 2] as u64) << 32) | end.w[i * 2 + 1] as u64;
            self.set_reg(VC_EQC_CWATCH_DAT0 + 8 * i as u64, dword);
        }
    }

    fn nvt_update(&mut self) {
        let spec = self.reg(PC_VPC_CWATCH_SPEC);
        let blk = get_field64(PC_VPC_CWATCH_BLOCKID, spec) as u8;
        let idx = get_field64(PC_VPC_CWATCH_OFFSET, spec) as u32;

        let mut nvt = Nvt::default();
        for i in 0..8 {
            let dword = self.reg(PC_VPC_CWATCH_DAT0 + 8 * i as u64);
            nvt.w[i * 2] = (dword >> 32) as u32;
            nvt.w[i * 2 + 1] = dword as u32;
        }

        if self.write_nvt(blk, idx, &nvt, None).is_err() {
            warn!("XIVE[{:x}] - VST: no NVT entry {:x}/{:x} !?", self.chip_id, blk, idx);
        }
    }

    fn nvt_cache_load(&mut self) {
        let spec = self.reg(PC_VPC_CWATCH_SPEC);
        let blk = get_field64(PC_VPC_CWATCH_BLOCKID, spec) as u8;
        let idx = get_field64(PC_VPC_CWATCH_OFFSET, spec) as u32;

        let nvt = match self.get_nvt(blk, idx) {
            Ok(nvt) => nvt,
            Err(_) => {
                warn!("XIVE[{:x}] - VST: no NVT entry {:x}/{:x} !?", self.chip_id, blk, idx);
                Nvt::default()
            }
        };

        for i in 0..8 {
            let dword = ((nvt.w[i * 2] as u64) << 32) | nvt.w[i * 2 + 1] as u64;
            self.set_reg(PC_VPC_CWATCH_DAT0 + 8 * i as u64, dword);
        }
    }

    //
    // IC register MMIO
    //

    pub fn ic_reg_write(&mut self, offset: u64, val: u64) {
        let mut val = val;

        match offset {
            // XIVE CQ (PowerBus bridge) settings
            CQ_MSGSND | CQ_FIRMASK_OR | CQ_CFG_PB_GEN | CQ_RST_CTL => {}
            CQ_PBI_CTL => {
                // 64K ESB pages for the PC and VC spaces
            }

            // XIVE Virtualization Controller settings
            VC_GLOBAL_CONFIG => {}

            // XIVE Presenter Controller settings
            PC_GLOBAL_CONFIG | PC_TCTXT_TRACK => {}
            PC_TCTXT_CFG => {
                // Overrides the hardwired chip ID with the chip ID
                // field for CAM compares (DEBUG)
                if val & PC_TCTXT_CHIPID_OVERRIDE != 0 {
                    self.tctx_chipid = get_field64(PC_TCTXT_CHIPID, val) as u8;
                }
            }

            // Store EOI configuration
            VC_SBC_CONFIG => {
                if val & (VC_SBC_CONF_CPLX_CIST | VC_SBC_CONF_CIST_BOTH) != 0 {
                    let flags = self.ipi_source.flags() | SourceFlags::STORE_EOI;
                    self.ipi_source.set_flags(flags);
                }
            }

            VC_EQC_CONFIG | VC_AIB_TX_ORDER_TAG2 => {}

            // XIVE BAR settings
            CQ_IC_BAR => {
                self.ic_shift = if val & CQ_IC_BAR_64K != 0 { 16 } else { 12 };
                self.ic_base = if val & CQ_IC_BAR_VALID != 0 {
                    val & !(CQ_IC_BAR_VALID | CQ_IC_BAR_64K)
                } else {
                    0
                };
            }
            CQ_TM1_BAR | CQ_TM2_BAR => {
                self.tm_shift = if val & CQ_TM_BAR_64K != 0 { 16 } else { 12 };
                self.tm_base = if val & CQ_TM_BAR_VALID != 0 {
                    val & !(CQ_TM_BAR_VALID | CQ_TM_BAR_64K)
                } else {
                    0
                };
            }
            CQ_PC_BARM => {}
            CQ_PC_BAR => {
                self.pc_base = if val & CQ_PC_BAR_VALID != 0 {
                    val & !CQ_PC_BAR_VALID
                } else {
                    0
                };
            }
            CQ_VC_BARM => {}
            CQ_VC_BAR => {
                self.vc_base = if val & CQ_VC_BAR_VALID != 0 {
                    val & !CQ_VC_BAR_VALID
                } else {
                    0
                };
            }

            // XIVE Table settings
            CQ_TAR => {}
            CQ_TDR => self.table_set_data(val),

            // XIVE VC & PC Virtual Structure Table settings
            VC_VSD_TABLE_ADDR | PC_VSD_TABLE_ADDR => {}
            VC_VSD_TABLE_DATA => self.vst_set_data(val, false),
            PC_VSD_TABLE_DATA => self.vst_set_data(val, true),

            // Interrupt fifo overflow in memory backing store
            VC_IRQ_CONFIG_IPI | VC_IRQ_CONFIG_HW | VC_IRQ_CONFIG_CASCADE1
            | VC_IRQ_CONFIG_CASCADE2 | VC_IRQ_CONFIG_REDIST | VC_IRQ_CONFIG_IPI_CASC => {}

            // XIVE hardware thread enablement
            PC_THREAD_EN_REG0 | PC_THREAD_EN_REG1 => {}
            PC_THREAD_EN_REG0_SET => {
                let v = self.reg(PC_THREAD_EN_REG0) | val;
                self.set_reg(PC_THREAD_EN_REG0, v);
            }
            PC_THREAD_EN_REG1_SET => {
                let v = self.reg(PC_THREAD_EN_REG1) | val;
                self.set_reg(PC_THREAD_EN_REG1, v);
            }
            PC_THREAD_EN_REG0_CLR => {
                let v = self.reg(PC_THREAD_EN_REG0) & !val;
                self.set_reg(PC_THREAD_EN_REG0, v);
            }
            PC_THREAD_EN_REG1_CLR => {
                let v = self.reg(PC_THREAD_EN_REG1) & !val;
                self.set_reg(PC_THREAD_EN_REG1, v);
            }

            // Indirect TIMA access set up
            PC_TCTXT_INDIR0 | PC_TCTXT_INDIR1 | PC_TCTXT_INDIR2 | PC_TCTXT_INDIR3 => {}

            // XIVE PC & VC cache updates for EAS, NVT and END
            VC_IVC_SCRUB_MASK | VC_IVC_SCRUB_TRIG => {}
            VC_EQC_CWATCH_SPEC => {
                // HW resets the conflict bit
                val &= !VC_EQC_CWATCH_CONFLICT;
            }
            o if (VC_EQC_CWATCH_DAT0 + 8..=VC_EQC_CWATCH_DAT3).contains(&o) => {}
            VC_EQC_CWATCH_DAT0 => {
                // Writing to DATA0 triggers the cache write
                self.set_reg(offset, val);
                self.end_update();
            }
            VC_EQC_SCRUB_MASK | VC_EQC_SCRUB_TRIG => {}

            PC_VPC_CWATCH_SPEC => {
                val &= !PC_VPC_CWATCH_CONFLICT;
            }
            o if (PC_VPC_CWATCH_DAT0 + 8..=PC_VPC_CWATCH_DAT7).contains(&o) => {}
            PC_VPC_CWATCH_DAT0 => {
                self.set_reg(offset, val);
                self.nvt_update();
            }
            PC_VPC_SCRUB_MASK | PC_VPC_SCRUB_TRIG => {}

            // XIVE PC & VC cache invalidation
            PC_AT_KILL | PC_AT_KILL_MASK | VC_AT_MACRO_KILL | VC_AT_MACRO_KILL_MASK => {}

            _ => {
                warn!("XIVE[{:x}] - IC: invalid write to reg=0x{:x}", self.chip_id, offset);
                return;
            }
        }

        self.set_reg(offset, val);
    }

    pub fn ic_reg_read(&mut self, offset: u64) -> u64 {
        match offset {
            CQ_CFG_PB_GEN | CQ_IC_BAR | CQ_TM1_BAR | CQ_TM2_BAR | CQ_PC_BAR | CQ_PC_BARM
            | CQ_VC_BAR | CQ_VC_BARM | CQ_TAR | CQ_TDR | CQ_PBI_CTL | PC_TCTXT_CFG
            | PC_TCTXT_TRACK | PC_TCTXT_INDIR0 | PC_TCTXT_INDIR1 | PC_TCTXT_INDIR2
            | PC_TCTXT_INDIR3 | PC_GLOBAL_CONFIG | PC_VPC_SCRUB_MASK | VC_GLOBAL_CONFIG
            | VC_AIB_TX_ORDER_TAG2 | VC_IRQ_CONFIG_IPI | VC_IRQ_CONFIG_HW
            | VC_IRQ_CONFIG_CASCADE1 | VC_IRQ_CONFIG_CASCADE2 | VC_IRQ_CONFIG_REDIST
            | VC_IRQ_CONFIG_IPI_CASC | VC_EQC_SCRUB_MASK | VC_IVC_SCRUB_MASK | VC_SBC_CONFIG
            | VC_AT_MACRO_KILL_MASK | VC_VSD_TABLE_ADDR | PC_VSD_TABLE_ADDR
            | VC_VSD_TABLE_DATA | PC_VSD_TABLE_DATA | PC_THREAD_EN_REG0 | PC_THREAD_EN_REG1
            | PC_AT_KILL_MASK => self.reg(offset),

            PC_THREAD_EN_REG0_SET | PC_THREAD_EN_REG0_CLR => self.reg(PC_THREAD_EN_REG0),
            PC_THREAD_EN_REG1_SET | PC_THREAD_EN_REG1_CLR => self.reg(PC_THREAD_EN_REG1),

            // Identifies which cores have msgsnd enabled
            CQ_MSGSND => 0xffffff00_00000000,

            VC_EQC_CWATCH_SPEC => {
                // The engine has completed and no conflict was seen
                let val = self.reg(offset) & !(VC_EQC_CWATCH_FULL | VC_EQC_CWATCH_CONFLICT);
                self.set_reg(offset, val);
                val
            }
            VC_EQC_CWATCH_DAT0 => {
                // Load DATA registers from the entry selected by SPEC
                self.end_cache_load();
                self.reg(offset)
            }
            o if (VC_EQC_CWATCH_DAT0 + 8..=VC_EQC_CWATCH_DAT3).contains(&o) => self.reg(offset),

            PC_VPC_CWATCH_SPEC => {
                let val = self.reg(offset) & !(PC_VPC_CWATCH_FULL | PC_VPC_CWATCH_CONFLICT);
                self.set_reg(offset, val);
                val
            }
            PC_VPC_CWATCH_DAT0 => {
                self.nvt_cache_load();
                self.reg(offset)
            }
            o if (PC_VPC_CWATCH_DAT0 + 8..=PC_VPC_CWATCH_DAT7).contains(&o) => self.reg(offset),

            PC_VPC_SCRUB_TRIG | VC_IVC_SCRUB_TRIG | VC_EQC_SCRUB_TRIG => {
                let val = self.reg(offset) & !VC_SCRUB_VALID;
                self.set_reg(offset, val);
                val
            }

            PC_AT_KILL => {
                let val = self.reg(offset) & !PC_AT_KILL_VALID;
                self.set_reg(offset, val);
                val
            }
            VC_AT_MACRO_KILL => {
                let val = self.reg(offset) & !VC_KILL_VALID;
                self.set_reg(offset, val);
                val
            }

            // XIVE synchronisation
            VC_EQC_CONFIG => VC_EQC_SYNC_MASK,

            _ => {
                warn!("XIVE[{:x}] - IC: invalid read reg=0x{:x}", self.chip_id, offset);
                0
            }
        }
    }

    //
    // Notify port page: HW triggers at the low offsets, forwards and
    // syncs above.
    //

    pub fn notify_write(&mut self, addr: u64, val: u64) {
        match addr {
            // The source interrupt number is already encoded with the
            // chip block id by the sending device.
            0x000..=0x7ff => router_notify(self, val as u32, true),

            NOTIFY_FORWARD_IPI | NOTIFY_FORWARD_HW | NOTIFY_FORWARD_OS_ESC
            | NOTIFY_FORWARD_HW_ESC | NOTIFY_FORWARD_REDIS => {
                warn!(
                    "XIVE[{:x}] - IC: forwarded at @0x{:x} IRQ 0x{:x}",
                    self.chip_id, addr, val
                );
            }

            NOTIFY_SYNC_IPI | NOTIFY_SYNC_HW | NOTIFY_SYNC_OS_ESC | NOTIFY_SYNC_HW_ESC
            | NOTIFY_SYNC_REDIS | NOTIFY_SYNC_PULL | NOTIFY_SYNC_PUSH | NOTIFY_SYNC_VPC => {}

            _ => {
                warn!("XIVE[{:x}] - IC: invalid notify write @0x{:x}", self.chip_id, addr);
            }
        }
    }

    //
    // ESB and TIMA windows
    //

    /// IPI ESB window access. The notification, when one results, is
    /// routed on the spot.
    pub fn ipi_esb_read(&mut self, addr: u64, size: usize) -> u64 {
        let (ret, notif) = self.ipi_source.esb_read(addr, size);
        if let Some(n) = notif {
            let lisn = lisn(self.block_id(), n.srcno);
            router_notify(self, lisn, n.pq_checked);
        }
        ret
    }

    pub fn ipi_esb_write(&mut self, addr: u64, val: u64, size: usize) {
        if let Some(n) = self.ipi_source.esb_write(addr, val, size) {
            let lisn = lisn(self.block_id(), n.srcno);
            router_notify(self, lisn, n.pq_checked);
        }
    }

    pub fn end_esb_read(&mut self, addr: u64, size: usize) -> u64 {
        let end_source = self.end_source.clone();
        end_source.read(self, addr, size)
    }

    pub fn end_esb_write(&mut self, addr: u64, val: u64, size: usize) {
        let end_source = self.end_source.clone();
        end_source.write(self, addr, val, size);
    }

    /// TIMA access of the thread `pir`.
    pub fn tm_write(&mut self, pir: u32, offset: u64, value: u64, size: usize) {
        if !self.thread_enabled(pir) {
            warn!("XIVE[{:x}] - IC: CPU {:x} is not enabled", self.chip_id, pir);
        }
        let Some(index) = self.thread_index(pir) else {
            warn!("XIVE[{:x}] - IC: no thread context for CPU {:x}", self.chip_id, pir);
            return;
        };

        let mut tctx = std::mem::take(&mut self.threads[index]);
        tima::tm_write(self, &mut tctx, offset, value, size);
        self.threads[index] = tctx;
    }

    pub fn tm_read(&mut self, pir: u32, offset: u64, size: usize) -> u64 {
        if !self.thread_enabled(pir) {
            warn!("XIVE[{:x}] - IC: CPU {:x} is not enabled", self.chip_id, pir);
        }
        let Some(index) = self.thread_index(pir) else {
            warn!("XIVE[{:x}] - IC: no thread context for CPU {:x}", self.chip_id, pir);
            return u64::MAX;
        };

        let mut tctx = std::mem::take(&mut self.threads[index]);
        let ret = tima::tm_read(self, &mut tctx, offset, size);
        self.threads[index] = tctx;
        ret
    }

    pub fn reset(&mut self) {
        self.regs.iter_mut().for_each(|r| *r = 0);
        self.blk = [0; TABLE_BLK_MAX];
        self.mig = [0; TABLE_MIG_MAX];
        self.vdt = [0; TABLE_VDT_MAX];
        self.edt = [0; TABLE_EDT_MAX];
        self.vst = Vst::new(VST_INFOS);
        self.tctx_chipid = self.chip_id;
        self.ipi_source.reset();
        let config = self.presenter_config();
        for tctx in self.threads.iter_mut() {
            tctx.reset(config);
        }
    }

    fn state(&self) -> PnvXiveState {
        PnvXiveState {
            regs: self.regs.clone(),
            blk: self.blk.to_vec(),
            mig: self.mig.to_vec(),
            vdt: self.vdt.to_vec(),
            edt: self.edt.to_vec(),
            vsds: self.vst.state(),
            tctx_chipid: self.tctx_chipid,
        }
    }

    fn set_state(&mut self, state: &PnvXiveState) {
        if state.regs.len() != self.regs.len()
            || state.blk.len() != self.blk.len()
            || state.mig.len() != self.mig.len()
            || state.vdt.len() != self.vdt.len()
            || state.edt.len() != self.edt.len()
        {
            warn!("XIVE[{:x}] - IC: register state mismatch", self.chip_id);
            return;
        }
        self.regs.clone_from(&state.regs);
        self.blk.copy_from_slice(&state.blk);
        self.mig.copy_from_slice(&state.mig);
        self.vdt.copy_from_slice(&state.vdt);
        self.edt.copy_from_slice(&state.edt);
        self.vst.set_state(&state.vsds);
        self.tctx_chipid = state.tctx_chipid;
    }

    fn vst_read_entry(&mut self, table: usize, blk: u8, idx: u32, data: &mut [u8]) -> Result<()> {
        self.vst
            .read(&self.mem, None, table, blk, idx, data)
            .map_err(|_| match table {
                VST_TSEL_IVT => Error::UnknownEas(blk, idx),
                VST_TSEL_EQDT => Error::UnknownEnd(blk, idx),
                _ => Error::UnknownNvt(blk, idx),
            })
    }
}

impl XiveRouter for PnvXive {
    fn get_eas(&mut self, blk: u8, idx: u32) -> Result<Eas> {
        if blk != self.block_id() {
            warn!("XIVE[{:x}] - VST: EAS {:x}/{:x} is remote !?", self.chip_id, blk, idx);
            return Err(Error::RemoteBlock(blk));
        }
        let mut bytes = [0u8; 8];
        self.vst_read_entry(VST_TSEL_IVT, blk, idx, &mut bytes)?;
        Ok(Eas {
            w: u64::from_be_bytes(bytes),
        })
    }

    fn get_pq(&mut self, blk: u8, idx: u32) -> Result<u8> {
        if blk != self.block_id() {
            warn!("XIVE[{:x}] - VST: EAS {:x}/{:x} is remote !?", self.chip_id, blk, idx);
            return Err(Error::RemoteBlock(blk));
        }
        Ok(self.ipi_source.esb_get(idx))
    }

    fn set_pq(&mut self, blk: u8, idx: u32, pq: u8) -> Result<()> {
        if blk != self.block_id() {
            warn!("XIVE[{:x}] - VST: EAS {:x}/{:x} is remote !?", self.chip_id, blk, idx);
            return Err(Error::RemoteBlock(blk));
        }
        self.ipi_source.esb_set(idx, pq);
        Ok(())
    }

    fn get_end(&mut self, blk: u8, idx: u32) -> Result<End> {
        let mut bytes = [0u8; 32];
        self.vst_read_entry(VST_TSEL_EQDT, blk, idx, &mut bytes)?;
        let mut end = End::default();
        words_from_be(&bytes, &mut end.w);
        Ok(end)
    }

    fn write_end(&mut self, blk: u8, idx: u32, end: &End, word: Option<usize>) -> Result<()> {
        let mut bytes = [0u8; 32];
        words_to_be(&end.w, &mut bytes);
        self.vst
            .write(&self.mem, None, VST_TSEL_EQDT, blk, idx, &bytes, word)
            .map_err(|_| Error::UnknownEnd(blk, idx))
    }

    fn get_nvt(&mut self, blk: u8, idx: u32) -> Result<Nvt> {
        let mut bytes = [0u8; 64];
        self.vst_read_entry(VST_TSEL_VPDT, blk, idx, &mut bytes)?;
        let mut nvt = Nvt::default();
        words_from_be(&bytes, &mut nvt.w);
        Ok(nvt)
    }

    fn write_nvt(&mut self, blk: u8, idx: u32, nvt: &Nvt, word: Option<usize>) -> Result<()> {
        let mut bytes = [0u8; 64];
        words_to_be(&nvt.w, &mut bytes);
        self.vst
            .write(&self.mem, None, VST_TSEL_VPDT, blk, idx, &bytes, word)
            .map_err(|_| Error::UnknownNvt(blk, idx))
    }

    fn block_id(&self) -> u8 {
        self.tctx_chipid
    }

    fn memory(&self) -> GuestMemoryAtomic<GuestMemoryMmap> {
        self.mem.clone()
    }

    fn match_nvt(&mut self, spec: &NvtMatchSpec) -> Result<MatchOutcome> {
        let threads: Vec<(bool, &Tctx)> = self
            .threads
            .iter()
            .map(|t| (self.thread_enabled(t.pir), t))
            .collect();
        scan_for_match(&threads, spec)
    }

    fn present(&mut self, thread: usize, ring: Ring, priority: u8, group_level: u8) {
        self.threads[thread].pipr_update(ring, priority, group_level);
    }

    fn end_notify(&mut self, eas: &Eas) {
        end_notify(self, eas);
    }
}

impl BusDevice for PnvXive {
    /// The IC BAR window: page 0 holds the sub-engine registers, page 1
    /// the notify port. The LSI and indirect TIMA pages are not
    /// modeled.
    fn read(&mut self, _base: u64, offset: u64, data: &mut [u8]) {
        let page = offset >> self.ic_shift;
        let page_offset = offset & ((1 << self.ic_shift) - 1);

        let val = match page {
            0 if data.len() == 8 => self.ic_reg_read(page_offset),
            1 => {
                warn!("XIVE[{:x}] - IC: invalid notify read @0x{:x}", self.chip_id, offset);
                u64::MAX
            }
            _ => {
                warn!("XIVE[{:x}] - IC: invalid read @0x{:x}", self.chip_id, offset);
                u64::MAX
            }
        };

        debug!("XIVE[{:x}] - IC read @0x{:x} -> 0x{:x}", self.chip_id, offset, val);
        if data.len() == 8 {
            BigEndian::write_u64(data, val);
        }
    }

    fn write(&mut self, _base: u64, offset: u64, data: &[u8]) {
        if data.len() != 8 {
            warn!("XIVE[{:x}] - IC: invalid write size {}", self.chip_id, data.len());
            return;
        }
        let val = BigEndian::read_u64(data);
        let page = offset >> self.ic_shift;
        let page_offset = offset & ((1 << self.ic_shift) - 1);

        debug!("XIVE[{:x}] - IC write @0x{:x} <- 0x{:x}", self.chip_id, offset, val);
        match page {
            0 => self.ic_reg_write(page_offset, val),
            1 => self.notify_write(page_offset, val),
            _ => {
                warn!("XIVE[{:x}] - IC: invalid write @0x{:x}", self.chip_id, offset);
            }
        }
    }
}

impl Pausable for PnvXive {}

impl Snapshottable for PnvXive {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn snapshot(&mut self) -> result::Result<Snapshot, MigratableError> {
        let mut snapshot = Snapshot::new_from_state(&self.state())?;
        snapshot.add_snapshot(self.ipi_source.id(), self.ipi_source.snapshot()?);
        for (i, tctx) in self.threads.iter_mut().enumerate() {
            snapshot.add_snapshot(format!("tctx{}", i), tctx.snapshot()?);
        }
        Ok(snapshot)
    }

    fn restore(&mut self, snapshot: Snapshot) -> result::Result<(), MigratableError> {
        self.set_state(&snapshot.to_state()?);
        if let Some(s) = snapshot.snapshots.get(&self.ipi_source.id()).cloned() {
            self.ipi_source.restore(s)?;
        }
        for (i, tctx) in self.threads.iter_mut().enumerate() {
            if let Some(s) = snapshot.snapshots.get(&format!("tctx{}", i)).cloned() {
                tctx.restore(s)?;
            }
        }
        Ok(())
    }
}

impl Migratable for PnvXive {}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_memory::Bytes;
    use xive::esb::PQ_PENDING;
    use xive::field::set_field32;
    use xive::regs::*;
    use xive::tctx::Ring;
    use xive::GuestAddress;

    struct TestLine(std::sync::atomic::AtomicBool);
    impl TestLine {
        fn new() -> Arc<Self> {
            Arc::new(TestLine(std::sync::atomic::AtomicBool::new(false)))
        }
        fn level(&self) -> bool {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }
    }
    impl InterruptLine for TestLine {
        fn set_level(&self, level: bool) {
            self.0.store(level, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn test_mem() -> GuestMemoryAtomic<GuestMemoryMmap> {
        GuestMemoryAtomic::new(
            GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 64 << 20)]).unwrap(),
        )
    }

    fn direct_vsd(addr: u64, page_shift: u32) -> u64 {
        (VSD_MODE_EXCLUSIVE << 62) | (addr & VSD_ADDRESS_MASK) | (page_shift as u64 - 12)
    }

    /// Configures the standard firmware layout: EAT at 1M, ENDT at 2M,
    /// VPDT at 4M, all 64K direct tables on block 0.
    fn configure(xive: &mut PnvXive) {
        for (table, addr) in [
            (VST_TSEL_IVT, 0x10_0000u64),
            (VST_TSEL_SBE, 0x18_0000),
            (VST_TSEL_EQDT, 0x20_0000),
            (VST_TSEL_VPDT, 0x40_0000),
        ] {
            let table_addr = set_field64(VST_TABLE_SELECT, 0, table as u64);
            xive.ic_reg_write(VC_VSD_TABLE_ADDR, table_addr);
            xive.ic_reg_write(VC_VSD_TABLE_DATA, direct_vsd(addr, 16));
        }
    }

    fn store_eas(xive: &mut PnvXive, idx: u32, eas: Eas) {
        let addr = 0x10_0000 + idx as u64 * 8;
        xive.mem
            .memory()
            .write_slice(&eas.w.to_be_bytes(), GuestAddress(addr))
            .unwrap();
    }

    fn store_end(xive: &mut PnvXive, idx: u32, end: &End) {
        let mut bytes = [0u8; 32];
        words_to_be(&end.w, &mut bytes);
        xive.mem
            .memory()
            .write_slice(&bytes, GuestAddress(0x20_0000 + idx as u64 * 32))
            .unwrap();
    }

    fn store_nvt(xive: &mut PnvXive, idx: u32, nvt: &Nvt) {
        let mut bytes = [0u8; 64];
        words_to_be(&nvt.w, &mut bytes);
        xive.mem
            .memory()
            .write_slice(&bytes, GuestAddress(0x40_0000 + idx as u64 * 64))
            .unwrap();
    }

    fn routed_chip() -> (PnvXive, Arc<TestLine>) {
        let mut xive = PnvXive::new(String::from("pnv-xive"), 0, test_mem()).unwrap();
        configure(&mut xive);

        let os_line = TestLine::new();
        xive.add_thread(0, os_line.clone(), TestLine::new());
        xive.enable_thread(0);

        // EAS 5 -> END 2 -> NVT 0x400, priority 3; arm the source.
        xive.ipi_source().esb_set(5, xive::esb::PQ_RESET);
        store_eas(&mut xive, 5, Eas::new(0, 2, 0));
        let mut end = End::default();
        end.w[0] = END_W0_VALID | END_W0_ENQUEUE | END_W0_UCOND_NOTIFY;
        end.w[1] = set_field32(END_W1_GENERATION, 0, 1);
        end.w[3] = 0x80_0000;
        end.w[6] = set_field32(END_W6_NVT_INDEX, 0, 0x400);
        end.w[7] = set_field32(END_W7_F0_PRIORITY, 0, 3);
        store_end(&mut xive, 2, &end);
        let mut nvt = Nvt::default();
        nvt.w[0] = NVT_W0_VALID;
        store_nvt(&mut xive, 0x400, &nvt);

        // Dispatch the NVT on the OS ring
        let tctx = xive.thread(0);
        tctx.set_word2(Ring::Os, TM_QW1W2_VO | nvt_cam_line(0, 0x400));
        tctx.set_cppr(Ring::Os, 4);

        (xive, os_line)
    }

    #[test]
    fn test_vsd_configuration_validation() {
        let mut xive = PnvXive::new(String::from("pnv-xive"), 0, test_mem()).unwrap();

        // Misaligned table address is rejected.
        let table_addr = set_field64(VST_TABLE_SELECT, 0, VST_TSEL_EQDT as u64);
        xive.ic_reg_write(VC_VSD_TABLE_ADDR, table_addr);
        xive.ic_reg_write(VC_VSD_TABLE_DATA, direct_vsd(0x2_0800, 16));
        assert_eq!(xive.vst.vsd(VST_TSEL_EQDT, 0), 0);

        // Indirect tables require the global enable.
        let vsd = (VSD_MODE_EXCLUSIVE << 62) | VSD_INDIRECT | 0x1_0000 | (16 - 12);
        xive.ic_reg_write(VC_VSD_TABLE_DATA, vsd);
        assert_eq!(xive.vst.vsd(VST_TSEL_EQDT, 0), 0);

        xive.ic_reg_write(VC_GLOBAL_CONFIG, VC_GCONF_INDIRECT);
        xive.ic_reg_write(VC_VSD_TABLE_DATA, vsd);
        assert_eq!(xive.vst.vsd(VST_TSEL_EQDT, 0), vsd);
    }

    #[test]
    fn test_full_routing_path() {
        let (mut xive, os_line) = routed_chip();

        // Trigger source 5 through its ESB trigger page.
        let trigger = 5u64 << ESB_64K_2PAGE;
        xive.ipi_esb_write(trigger, 0, 8);

        assert_eq!(xive.ipi_source().esb_get(5), PQ_PENDING);
        assert!(os_line.level());
        let tctx = xive.thread(0);
        assert_eq!(tctx.reg(Ring::Os, TM_PIPR), 3);
        assert_eq!(tctx.reg(Ring::Os, TM_IPB), priority_to_ipb(3));

        // The queue entry carries generation 1 and data 0.
        let mut bytes = [0u8; 4];
        xive.mem
            .memory()
            .read_slice(&mut bytes, GuestAddress(0x80_0000))
            .unwrap();
        assert_eq!(BigEndian::read_u32(&bytes), 1 << 31);

        // Accept through the TIMA.
        let ack = xive.tm_read(
            0,
            ((TM_OS_PAGE as u64) << TM_SHIFT) + TM_SPC_ACK_OS_REG,
            2,
        );
        assert_eq!(ack & 0xff, 3);
        assert!(!os_line.level());
    }

    #[test]
    fn test_end_cache_watch_word_update() {
        let (mut xive, _line) = routed_chip();

        // Select END 0/2 and load it through the watch engine.
        let spec = set_field64(VC_EQC_CWATCH_OFFSET, 0, 2);
        xive.ic_reg_write(VC_EQC_CWATCH_SPEC, spec);
        let dat0 = xive.ic_reg_read(VC_EQC_CWATCH_DAT0);
        assert_eq!((dat0 >> 32) as u32 & END_W0_VALID, END_W0_VALID);

        // Patch word 7 (priority) and write the entry back.
        let dat3 = xive.ic_reg_read(VC_EQC_CWATCH_DAT0 + 24);
        let patched = (dat3 & !0xffff_ffff) | set_field32(END_W7_F0_PRIORITY, 0, 5) as u64;
        xive.ic_reg_write(VC_EQC_CWATCH_DAT0 + 24, patched);
        xive.ic_reg_write(VC_EQC_CWATCH_DAT0, dat0);

        let end = xive.get_end(0, 2).unwrap();
        assert_eq!(end.priority(), 5);

        // The watch engine reports free and conflict-less on SPEC read.
        let spec = xive.ic_reg_read(VC_EQC_CWATCH_SPEC);
        assert_eq!(spec & (VC_EQC_CWATCH_FULL | VC_EQC_CWATCH_CONFLICT), 0);
    }

    #[test]
    fn test_remote_eas_rejected() {
        let (mut xive, _line) = routed_chip();
        assert!(matches!(
            xive.get_eas(3, 5),
            Err(Error::RemoteBlock(3))
        ));
    }

    #[test]
    fn test_thread_enable_gates_matching() {
        let (mut xive, os_line) = routed_chip();

        // Disable the thread: the interrupt is not presented.
        xive.ic_reg_write(PC_THREAD_EN_REG0_CLR, ppc_bit(0));
        let trigger = 5u64 << ESB_64K_2PAGE;
        xive.ipi_esb_write(trigger, 0, 8);
        assert!(!os_line.level());
    }

    #[test]
    fn test_edt_split() {
        let mut xive = PnvXive::new(String::from("pnv-xive"), 0, test_mem()).unwrap();
        // VC space of 64 sets of 64M: BARM covers 4G.
        xive.ic_reg_write(CQ_VC_BARM, !(0x1_0000_0000u64 - 1));

        // First half IPI, second half END.
        for i in 0..64u64 {
            let tar = set_field64(CQ_TAR_TSEL, 0, CQ_TAR_TSEL_EDT);
            let tar = set_field64(CQ_TAR_TSEL_INDEX, tar, i);
            xive.ic_reg_write(CQ_TAR, tar);
            let edt_type = if i < 32 { CQ_TDR_EDT_IPI } else { CQ_TDR_EDT_EQ };
            xive.ic_reg_write(CQ_TDR, set_field64(CQ_TDR_EDT_TYPE, 0, edt_type));
        }

        let set_size = 0x1_0000_0000u64 / 64;
        assert_eq!(xive.edt_size(CQ_TDR_EDT_IPI), 32 * set_size);
        assert_eq!(xive.edt_size(CQ_TDR_EDT_EQ), 32 * set_size);
        // An offset in the second half maps into the END region.
        assert_eq!(xive.edt_offset(32 * set_size, CQ_TDR_EDT_EQ), 0);
        assert_eq!(xive.edt_offset(33 * set_size, CQ_TDR_EDT_EQ), set_size);
    }

    #[test]
    fn test_table_autoincrement() {
        let mut xive = PnvXive::new(String::from("pnv-xive"), 0, test_mem()).unwrap();
        let tar = set_field64(CQ_TAR_TSEL, 0, CQ_TAR_TSEL_BLK) | CQ_TAR_TBL_AUTOINC;
        xive.ic_reg_write(CQ_TAR, tar);
        xive.ic_reg_write(CQ_TDR, 0x11);
        xive.ic_reg_write(CQ_TDR, 0x22);
        assert_eq!(xive.blk[0], 0x11);
        assert_eq!(xive.blk[1], 0x22);
    }

    #[test]
    fn test_snapshot_restore_reproduces_routing() {
        let (mut xive, _line) = routed_chip();
        let trigger = 5u64 << ESB_64K_2PAGE;
        xive.ipi_esb_write(trigger, 0, 8);

        let snapshot = xive.snapshot().unwrap();

        let mut other = PnvXive::new(String::from("pnv-xive"), 0, test_mem()).unwrap();
        other.add_thread(0, TestLine::new(), TestLine::new());
        other.restore(snapshot).unwrap();

        assert_eq!(other.ipi_source().esb_get(5), PQ_PENDING);
        assert_eq!(other.thread(0).reg(Ring::Os, TM_PIPR), 3);
        // A second trigger on the restored chip is coalesced, as it
        // would have been on the source.
        assert_eq!(other.ipi_source().esb_get(5), PQ_PENDING);
        let n = other.ipi_source().set_irq(5, true);
        assert!(n.is_none());
    }

    #[test]
    fn test_reset() {
        let (mut xive, _line) = routed_chip();
        let trigger = 5u64 << ESB_64K_2PAGE;
        xive.ipi_esb_write(trigger, 0, 8);

        xive.reset();
        // Sources come back disabled, thread contexts parked.
        assert_eq!(xive.ipi_source().esb_get(5), 0b01);
        assert_eq!(xive.thread(0).reg(Ring::Os, TM_PIPR), 0xff);
        assert!(!xive.thread_enabled(0));
    }
}
