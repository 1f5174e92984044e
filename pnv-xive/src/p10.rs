// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! POWER10 chip interrupt controller.
//!
//! The XIVE2 front-end: separate CQ/PC/VC/TCTXT register files, the
//! generation 2 table set including the NVG and NVC aggregates, and
//! four parallel cache watch engines per cache. An engine is claimed by
//! reading the ASSIGN register and released when its SPEC register is
//! read; when all four are busy the ASSIGN read returns a sentinel and
//! the firmware retries.

use std::result;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use vm_memory::GuestAddressSpace;
use vm_migration::{Migratable, MigratableError, Pausable, Snapshot, Snapshottable};
use xive::end_source::End2Source;
use xive::field::{get_field64, ppc_bit, set_field64, words_from_be, words_to_be};
use xive::regs::nvt_cam_line;
use xive::regs2::{Eas2, End2, Nvgc, Nvp};
use xive::router::{lisn, MatchOutcome, NvtMatchSpec};
use xive::router2::{
    backlog_hint, end_notify2, router2_notify, scan_for_match2, tm_read2, tm_write2, Xive2Router,
};
use xive::source::{SourceFlags, XiveSource, ESB_64K, ESB_64K_2PAGE};
use xive::tctx::{Ring, Tctx};
use xive::{
    BusDevice, Error, GuestMemoryAtomic, GuestMemoryMmap, InterruptLine, PresenterConfig, Result,
};

use crate::p10_regs::*;
use crate::vst::{
    page_size_allowed, vsd_mode, vsd_page_shift, SiblingVsds, Vst, VstInfo, VSD_ADDRESS_MASK,
    VSD_INDIRECT, VSD_MODE_EXCLUSIVE, VSD_MODE_FORWARD,
};

// Virtual structure tables of the POWER10 engine.
pub const VST_EAS: usize = 0;
pub const VST_ESB: usize = 1;
pub const VST_END: usize = 2;
pub const VST_NVP: usize = 3;
pub const VST_NVG: usize = 4;
pub const VST_NVC: usize = 5;
pub const VST_IC: usize = 6;
pub const VST_SYNC: usize = 7;
pub const VST_ERQ: usize = 8;

static VST_INFOS: &[VstInfo] = &[
    VstInfo { name: "EAT", size: 8, max_blocks: 16 },
    VstInfo { name: "ESB", size: 1, max_blocks: 16 },
    VstInfo { name: "ENDT", size: 32, max_blocks: 16 },
    VstInfo { name: "NVPT", size: 32, max_blocks: 16 },
    VstInfo { name: "NVGT", size: 32, max_blocks: 16 },
    VstInfo { name: "NVCT", size: 32, max_blocks: 16 },
    VstInfo { name: "IC", size: 1, max_blocks: 16 },
    VstInfo { name: "SYNC", size: 1, max_blocks: 16 },
    // Backing store pages for the interrupt fifos of the VC sub-engine
    // in case of overflow (not modeled)
    VstInfo { name: "ERQ", size: 1, max_blocks: 7 },
];

const NR_IPIS: u32 = 4096;
const NR_ENDS: u32 = 256;

// Structure watched by a PC engine.
const NXC_TYPE_NVP: u64 = 0;
const NXC_TYPE_NVG: u64 = 1;
const NXC_TYPE_NVC: u64 = 2;

/// POWER10 chip interrupt controller.
pub struct PnvXive2 {
    id: String,
    chip_id: u8,

    cq_regs: Vec<u64>,
    pc_regs: Vec<u64>,
    vc_regs: Vec<u64>,
    tctxt_regs: Vec<u64>,

    /// Set translation tables, NVPG/ESB/END.
    tables: [[u64; CQ_TABLE_ENTRIES]; 3],

    vst: Vst,
    ipi_source: XiveSource,
    end_source: End2Source,
    threads: Vec<Tctx>,

    /// Busy bitmasks of the END and NVP/NVG/NVC cache watch engines.
    endc_watch_busy: u8,
    nxc_watch_busy: u8,

    /// Fairness cursor of the group presenter scan.
    match_cursor: usize,

    siblings: Option<Arc<dyn SiblingVsds>>,
    mem: GuestMemoryAtomic<GuestMemoryMmap>,
}

#[derive(Serialize, Deserialize)]
pub struct PnvXive2State {
    cq_regs: Vec<u64>,
    pc_regs: Vec<u64>,
    vc_regs: Vec<u64>,
    tctxt_regs: Vec<u64>,
    tables: Vec<Vec<u64>>,
    vsds: Vec<Vec<u64>>,
    endc_watch_busy: u8,
    nxc_watch_busy: u8,
    match_cursor: usize,
}

impl PnvXive2 {
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
        let end_source = End2Source::new(NR_ENDS, ESB_64K).expect("END source setting");

        Ok(PnvXive2 {
            id,
            chip_id,
            cq_regs: vec![0; IC_PAGE_SIZE >> 3],
            pc_regs: vec![0; IC_PAGE_SIZE >> 3],
            vc_regs: vec![0; IC_PAGE_SIZE >> 3],
            tctxt_regs: vec![0; IC_PAGE_SIZE >> 3],
            tables: [[0; CQ_TABLE_ENTRIES]; 3],
            vst: Vst::new(VST_INFOS),
            ipi_source,
            end_source,
            threads: Vec::new(),
            endc_watch_busy: 0,
            nxc_watch_busy: 0,
            match_cursor: 0,
            siblings: None,
            mem,
        })
    }

    /// Hooks the sibling chips in, for forwarded table resolution.
    pub fn set_siblings(&mut self, siblings: Arc<dyn SiblingVsds>) {
        self.siblings = Some(siblings);
    }

    pub fn add_thread(
        &mut self,
        pir: u32,
        os_line: Arc<dyn InterruptLine>,
        hv_line: Arc<dyn InterruptLine>,
    ) -> usize {
        let thread_mask = if self.config().contains(PresenterConfig::THREADID_8BITS) {
            0xff
        } else {
            0x7f
        };
        let mut tctx = Tctx::new(os_line, hv_line);
        tctx.pir = pir;
        tctx.hw_cam = nvt_cam_line(self.block_id(), (1 << 7) | (pir & thread_mask));
        tctx.reset(self.config());
        self.threads.push(tctx);
        self.threads.len() - 1
    }

    pub fn ipi_source(&mut self) -> &mut XiveSource {
        &mut self.ipi_source
    }

    pub fn thread(&mut self, index: usize) -> &mut Tctx {
        &mut self.threads[index]
    }

    fn thread_index(&self, pir: u32) -> Option<usize> {
        self.threads.iter().position(|t| t.pir == pir)
    }

    fn thread_enabled(&self, pir: u32) -> bool {
        let reg = if pir & 0x40 == 0 { TCTXT_EN0 } else { TCTXT_EN1 };
        self.tctxt_regs[(reg >> 3) as usize] & ppc_bit(pir & 0x3f) != 0
    }

    pub fn enable_thread(&mut self, pir: u32) {
        let reg = if pir & 0x40 == 0 { TCTXT_EN0 } else { TCTXT_EN1 };
        self.tctxt_regs[(reg >> 3) as usize] |= ppc_bit(pir & 0x3f);
    }

    //
    // Set translation tables
    //

    fn stt_set_data(&mut self, val: u64) {
        let tar = self.cq_regs[(CQ_TAR >> 3) as usize];
        let tsel = get_field64(CQ_TAR_SELECT, tar);
        let mut entry = get_field64(CQ_TAR_ENTRY_SELECT, tar) as usize;

        match tsel {
            CQ_TAR_NVPG | CQ_TAR_ESB | CQ_TAR_END => {
                if entry >= CQ_TABLE_ENTRIES {
                    warn!("XIVE[{:x}] - IC: invalid table entry {}", self.chip_id, entry);
                    return;
                }
                self.tables[tsel as usize][entry] = val;
            }
            _ => {
                warn!("XIVE[{:x}] - IC: unsupported table {}", self.chip_id, tsel);
                return;
            }
        }

        if tar & CQ_TAR_AUTOINC != 0 {
            entry += 1;
            self.cq_regs[(CQ_TAR >> 3) as usize] =
                set_field64(CQ_TAR_ENTRY_SELECT, tar, entry as u64);
        }
    }

    //
    // VSD registration
    //

    fn vst_set_exclusive(&mut self, table: usize, blk: u8, vsd: u64) {
        let info = self.vst.info(table);
        let page_shift = vsd_page_shift(vsd);
        let vst_addr = vsd & VSD_ADDRESS_MASK;

        if vsd & VSD_INDIRECT != 0 && !page_size_allowed(page_shift) {
            warn!(
                "XIVE[{:x}] - VST: invalid {} page shift {}",
                self.chip_id, info.name, page_shift
            );
            return;
        }

        if vst_addr % (1u64 << page_shift) != 0 {
            warn!(
                "XIVE[{:x}] - VST: {} table address 0x{:x} is not aligned with page shift {}",
                self.chip_id, info.name, vst_addr, page_shift
            );
            return;
        }

        self.vst.set_vsd(table, blk, vsd);
    }

    fn vst_set_data(&mut self, vsd: u64, table_addr: u64) {
        let table = get_field64(VSD_TABLE_SELECT, table_addr) as usize;
        let blk = get_field64(VSD_TABLE_BLOCK, table_addr) as u8;
        let vst_addr = vsd & VSD_ADDRESS_MASK;

        if table > VST_ERQ {
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

    //
    // Watch engines. The SPEC/DATA registers of engine `i` live at
    // WATCH0_SPEC + i * WATCH_STRIDE.
    //

    fn watch_claim(busy: &mut u8) -> u64 {
        for engine in 0..WATCH_ENGINES {
            if *busy & (1 << engine) == 0 {
                *busy |= 1 << engine;
                return engine as u64;
            }
        }
        WATCH_ALL_BUSY
    }

    fn end_watch_update(&mut self, engine: usize) {
        let base = (VC_ENDC_WATCH0_SPEC + engine as u64 * WATCH_STRIDE) >> 3;
        let spec = self.vc_regs[base as usize];
        let blk = get_field64(VC_ENDC_WATCH_BLOCK_ID, spec) as u8;
        let idx = get_field64(VC_ENDC_WATCH_INDEX, spec) as u32;

        let data_base = ((VC_ENDC_WATCH0_DATA0 + engine as u64 * WATCH_STRIDE) >> 3) as usize;
        let mut end = End2::default();
        for i in 0..4 {
            let dword = self.vc_regs[data_base + i];
            end.w[i * 2] = (dword >> 32) as u32;
            end.w[i * 2 + 1] = dword as u32;
        }

        if self.write_end(blk, idx, &end, None).is_err() {
            warn!("XIVE[{:x}] - VST: no END entry {:x}/{:x} !?", self.chip_id, blk, idx);
        }
    }

    fn end_watch_load(&mut self, engine: usize) {
        let base = (VC_ENDC_WATCH0_SPEC + engine as u64 * WATCH_STRIDE) >> 3;
        let spec = self.vc_regs[base as usize];
        let blk = get_field64(VC_ENDC_WATCH_BLOCK_ID, spec) as u8;
        let idx = get_field64(VC_ENDC_WATCH_INDEX, spec) as u32;

        let end = match self.get_end(blk, idx) {
            Ok(end) => end,
            Err(_) => {
                warn!("XIVE[{:x}] - VST: no END entry {:x}/{:x} !?", self.chip_id, blk, idx);
                End2::default()
            }
        };

        let data_base = ((VC_ENDC_WATCH0_DATA0 + engine as u64 * WATCH_STRIDE) >> 3) as usize;
        for i in 0..4 {
            self.vc_regs[data_base + i] =
                ((end.w[i * 2] as u64) << 32) | end.w[i * 2 + 1] as u64;
        }
    }

    fn nxc_watch_update(&mut self, engine: usize) {
        let base = (PC_NXC_WATCH0_SPEC + engine as u64 * WATCH_STRIDE) >> 3;
        let spec = self.pc_regs[base as usize];
        let wtype = get_field64(PC_NXC_WATCH_TYPE, spec);
        let blk = get_field64(PC_NXC_WATCH_BLOCK_ID, spec) as u8;
        let idx = get_field64(PC_NXC_WATCH_INDEX, spec) as u32;

        let data_base = ((PC_NXC_WATCH0_DATA0 + engine as u64 * WATCH_STRIDE) >> 3) as usize;
        let mut w = [0u32; 8];
        for i in 0..4 {
            let dword = self.pc_regs[data_base + i];
            w[i * 2] = (dword >> 32) as u32;
            w[i * 2 + 1] = dword as u32;
        }

        let res = match wtype {
            NXC_TYPE_NVP => self.write_nvp(blk, idx, &Nvp { w }, None),
            NXC_TYPE_NVG => self.write_nvgc(false, blk, idx, &Nvgc { w }),
            NXC_TYPE_NVC => self.write_nvgc(true, blk, idx, &Nvgc { w }),
            _ => {
                warn!("XIVE[{:x}] - VST: invalid NxC watch type {}", self.chip_id, wtype);
                return;
            }
        };

        if res.is_err() {
            warn!("XIVE[{:x}] - VST: no NxC entry {:x}/{:x} !?", self.chip_id, blk, idx);
        }
    }

    fn nxc_watch_load(&mut self, engine: usize) {
        let base = (PC_NXC_WATCH0_SPEC + engine as u64 * WATCH_STRIDE) >> 3;
        let spec = self.pc_regs[base as usize];
        let wtype = get_field64(PC_NXC_WATCH_TYPE, spec);
        let blk = get_field64(PC_NXC_WATCH_BLOCK_ID, spec) as u8;
        let idx = get_field64(PC_NXC_WATCH_INDEX, spec) as u32;

        let w = match wtype {
            NXC_TYPE_NVP => self.get_nvp(blk, idx).map(|nvp| nvp.w),
            NXC_TYPE_NVG => self.get_nvgc(false, blk, idx).map(|nvgc| nvgc.w),
            NXC_TYPE_NVC => self.get_nvgc(true, blk, idx).map(|nvgc| nvgc.w),
            _ => {
                warn!("XIVE[{:x}] - VST: invalid NxC watch type {}", self.chip_id, wtype);
                return;
            }
        }
        .unwrap_or_else(|_| {
            warn!("XIVE[{:x}] - VST: no NxC entry {:x}/{:x} !?", self.chip_id, blk, idx);
            [0u32; 8]
        });

        let data_base = ((PC_NXC_WATCH0_DATA0 + engine as u64 * WATCH_STRIDE) >> 3) as usize;
        for i in 0..4 {
            self.pc_regs[data_base + i] = ((w[i * 2] as u64) << 32) | w[i * 2 + 1] as u64;
        }
    }

    //
    // Register pages
    //

    pub fn cq_read(&mut self, offset: u64) -> u64 {
        match offset {
            CQ_XIVE_CAP | CQ_XIVE_CFG | CQ_TAR | CQ_TDR | CQ_IC_BAR | CQ_TM_BAR | CQ_ESB_BAR
            | CQ_END_BAR | CQ_NVC_BAR | CQ_NVPG_BAR | CQ_RST_CTL => {
                self.cq_regs[(offset >> 3) as usize]
            }
            CQ_MSGSND => 0xffffff00_00000000,
            _ => {
                warn!("XIVE[{:x}] - CQ: invalid read @0x{:x}", self.chip_id, offset);
                0
            }
        }
    }

    pub fn cq_write(&mut self, offset: u64, val: u64) {
        match offset {
            CQ_XIVE_CFG | CQ_RST_CTL | CQ_MSGSND | CQ_FIRMASK_OR => {}
            CQ_IC_BAR | CQ_TM_BAR | CQ_ESB_BAR | CQ_END_BAR | CQ_NVC_BAR | CQ_NVPG_BAR => {}
            CQ_TAR => {}
            CQ_TDR => {
                self.cq_regs[(offset >> 3) as usize] = val;
                self.stt_set_data(val);
                return;
            }
            _ => {
                warn!("XIVE[{:x}] - CQ: invalid write @0x{:x}", self.chip_id, offset);
                return;
            }
        }
        self.cq_regs[(offset >> 3) as usize] = val;
    }

    pub fn vc_read(&mut self, offset: u64) -> u64 {
        match offset {
            VC_VSD_TABLE_ADDR | VC_VSD_TABLE_DATA | VC_ENDC_CFG => {
                self.vc_regs[(offset >> 3) as usize]
            }

            VC_ENDC_WATCH_ASSIGN => Self::watch_claim(&mut self.endc_watch_busy),

            o if (VC_ENDC_WATCH0_SPEC
                ..VC_ENDC_WATCH0_SPEC + WATCH_ENGINES as u64 * WATCH_STRIDE)
                .contains(&o) =>
            {
                let engine = ((o - VC_ENDC_WATCH0_SPEC) / WATCH_STRIDE) as usize;
                let reg = (o - engine as u64 * WATCH_STRIDE) & !0x7;

                match reg {
                    VC_ENDC_WATCH0_SPEC => {
                        // Releases the engine and reports completion.
                        self.endc_watch_busy &= !(1 << engine);
                        let idx = (o >> 3) as usize;
                        self.vc_regs[idx] &=
                            !(VC_ENDC_WATCH_FULL | VC_ENDC_WATCH_CONFLICT);
                        self.vc_regs[idx]
                    }
                    VC_ENDC_WATCH0_DATA0 => {
                        self.end_watch_load(engine);
                        self.vc_regs[(o >> 3) as usize]
                    }
                    _ => self.vc_regs[(o >> 3) as usize],
                }
            }

            _ => {
                warn!("XIVE[{:x}] - VC: invalid read @0x{:x}", self.chip_id, offset);
                0
            }
        }
    }

    pub fn vc_write(&mut self, offset: u64, val: u64) {
        match offset {
            VC_VSD_TABLE_ADDR | VC_ENDC_CFG => {
                self.vc_regs[(offset >> 3) as usize] = val;
            }
            VC_VSD_TABLE_DATA => {
                self.vc_regs[(offset >> 3) as usize] = val;
                let table_addr = self.vc_regs[(VC_VSD_TABLE_ADDR >> 3) as usize];
                self.vst_set_data(val, table_addr);
            }

            o if (VC_ENDC_WATCH0_SPEC
                ..VC_ENDC_WATCH0_SPEC + WATCH_ENGINES as u64 * WATCH_STRIDE)
                .contains(&o) =>
            {
                let engine = ((o - VC_ENDC_WATCH0_SPEC) / WATCH_STRIDE) as usize;
                let reg = (o - engine as u64 * WATCH_STRIDE) & !0x7;

                match reg {
                    VC_ENDC_WATCH0_SPEC => {
                        // HW will set the conflict bit
                        self.vc_regs[(o >> 3) as usize] = val & !VC_ENDC_WATCH_CONFLICT;
                    }
                    VC_ENDC_WATCH0_DATA0 => {
                        // Writing DATA0 triggers the cache write
                        self.vc_regs[(o >> 3) as usize] = val;
                        self.end_watch_update(engine);
                    }
                    _ => self.vc_regs[(o >> 3) as usize] = val,
                }
            }

            _ => {
                warn!("XIVE[{:x}] - VC: invalid write @0x{:x}", self.chip_id, offset);
            }
        }
    }

    pub fn pc_read(&mut self, offset: u64) -> u64 {
        match offset {
            PC_VSD_TABLE_ADDR | PC_VSD_TABLE_DATA | PC_NXC_PROC_CONFIG => {
                self.pc_regs[(offset >> 3) as usize]
            }

            PC_NXC_WATCH_ASSIGN => Self::watch_claim(&mut self.nxc_watch_busy),

            o if (PC_NXC_WATCH0_SPEC..PC_NXC_WATCH0_SPEC + WATCH_ENGINES as u64 * WATCH_STRIDE)
                .contains(&o) =>
            {
                let engine = ((o - PC_NXC_WATCH0_SPEC) / WATCH_STRIDE) as usize;
                let reg = (o - engine as u64 * WATCH_STRIDE) & !0x7;

                match reg {
                    PC_NXC_WATCH0_SPEC => {
                        self.nxc_watch_busy &= !(1 << engine);
                        let idx = (o >> 3) as usize;
                        self.pc_regs[idx] &= !(PC_NXC_WATCH_FULL | PC_NXC_WATCH_CONFLICT);
                        self.pc_regs[idx]
                    }
                    PC_NXC_WATCH0_DATA0 => {
                        self.nxc_watch_load(engine);
                        self.pc_regs[(o >> 3) as usize]
                    }
                    _ => self.pc_regs[(o >> 3) as usize],
                }
            }

            _ => {
                warn!("XIVE[{:x}] - PC: invalid read @0x{:x}", self.chip_id, offset);
                0
            }
        }
    }

    pub fn pc_write(&mut self, offset: u64, val: u64) {
        match offset {
            PC_VSD_TABLE_ADDR | PC_NXC_PROC_CONFIG => {
                self.pc_regs[(offset >> 3) as usize] = val;
            }
            PC_VSD_TABLE_DATA => {
                self.pc_regs[(offset >> 3) as usize] = val;
                let table_addr = self.pc_regs[(PC_VSD_TABLE_ADDR >> 3) as usize];
                self.vst_set_data(val, table_addr);
            }

            o if (PC_NXC_WATCH0_SPEC..PC_NXC_WATCH0_SPEC + WATCH_ENGINES as u64 * WATCH_STRIDE)
                .contains(&o) =>
            {
                let engine = ((o - PC_NXC_WATCH0_SPEC) / WATCH_STRIDE) as usize;
                let reg = (o - engine as u64 * WATCH_STRIDE) & !0x7;

                match reg {
                    PC_NXC_WATCH0_SPEC => {
                        self.pc_regs[(o >> 3) as usize] = val & !PC_NXC_WATCH_CONFLICT;
                    }
                    PC_NXC_WATCH0_DATA0 => {
                        self.pc_regs[(o >> 3) as usize] = val;
                        self.nxc_watch_update(engine);
                    }
                    _ => self.pc_regs[(o >> 3) as usize] = val,
                }
            }

            _ => {
                warn!("XIVE[{:x}] - PC: invalid write @0x{:x}", self.chip_id, offset);
            }
        }
    }

    pub fn tctxt_read(&mut self, offset: u64) -> u64 {
        match offset {
            TCTXT_EN0 | TCTXT_EN1 => self.tctxt_regs[(offset >> 3) as usize],
            TCTXT_EN0_SET | TCTXT_EN0_CLR => self.tctxt_regs[(TCTXT_EN0 >> 3) as usize],
            TCTXT_EN1_SET | TCTXT_EN1_CLR => self.tctxt_regs[(TCTXT_EN1 >> 3) as usize],
            _ => {
                warn!("XIVE[{:x}] - TCTXT: invalid read @0x{:x}", self.chip_id, offset);
                0
            }
        }
    }

    pub fn tctxt_write(&mut self, offset: u64, val: u64) {
        match offset {
            TCTXT_EN0 | TCTXT_EN1 => self.tctxt_regs[(offset >> 3) as usize] = val,
            TCTXT_EN0_SET => self.tctxt_regs[(TCTXT_EN0 >> 3) as usize] |= val,
            TCTXT_EN1_SET => self.tctxt_regs[(TCTXT_EN1 >> 3) as usize] |= val,
            TCTXT_EN0_CLR => self.tctxt_regs[(TCTXT_EN0 >> 3) as usize] &= !val,
            TCTXT_EN1_CLR => self.tctxt_regs[(TCTXT_EN1 >> 3) as usize] &= !val,
            _ => {
                warn!("XIVE[{:x}] - TCTXT: invalid write @0x{:x}", self.chip_id, offset);
            }
        }
    }

    /// Notify port page, HW triggers with the block already encoded.
    pub fn notify_write(&mut self, _addr: u64, val: u64) {
        router2_notify(self, val as u32, true);
    }

    //
    // ESB and TIMA windows
    //

    pub fn ipi_esb_read(&mut self, addr: u64, size: usize) -> u64 {
        let (ret, notif) = self.ipi_source.esb_read(addr, size);
        if let Some(n) = notif {
            let lisn = lisn(self.block_id(), n.srcno);
            router2_notify(self, lisn, n.pq_checked);
        }
        ret
    }

    pub fn ipi_esb_write(&mut self, addr: u64, val: u64, size: usize) {
        if let Some(n) = self.ipi_source.esb_write(addr, val, size) {
            let lisn = lisn(self.block_id(), n.srcno);
            router2_notify(self, lisn, n.pq_checked);
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

    pub fn tm_write(&mut self, pir: u32, offset: u64, value: u64, size: usize) {
        if !self.thread_enabled(pir) {
            warn!("XIVE[{:x}] - IC: CPU {:x} is not enabled", self.chip_id, pir);
        }
        let Some(index) = self.thread_index(pir) else {
            warn!("XIVE[{:x}] - IC: no thread context for CPU {:x}", self.chip_id, pir);
            return;
        };

        let mut tctx = std::mem::take(&mut self.threads[index]);
        tm_write2(self, &mut tctx, offset, value, size);
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
        let ret = tm_read2(self, &mut tctx, offset, size);
        self.threads[index] = tctx;
        ret
    }

    pub fn reset(&mut self) {
        self.cq_regs.iter_mut().for_each(|r| *r = 0);
        self.pc_regs.iter_mut().for_each(|r| *r = 0);
        self.vc_regs.iter_mut().for_each(|r| *r = 0);
        self.tctxt_regs.iter_mut().for_each(|r| *r = 0);
        self.tables = [[0; CQ_TABLE_ENTRIES]; 3];
        self.vst = Vst::new(VST_INFOS);
        self.endc_watch_busy = 0;
        self.nxc_watch_busy = 0;
        self.match_cursor = 0;
        self.ipi_source.reset();
        let config = self.config();
        for tctx in self.threads.iter_mut() {
            tctx.reset(config);
        }
    }

    fn state(&self) -> PnvXive2State {
        PnvXive2State {
            cq_regs: self.cq_regs.clone(),
            pc_regs: self.pc_regs.clone(),
            vc_regs: self.vc_regs.clone(),
            tctxt_regs: self.tctxt_regs.clone(),
            tables: self.tables.iter().map(|t| t.to_vec()).collect(),
            vsds: self.vst.state(),
            endc_watch_busy: self.endc_watch_busy,
            nxc_watch_busy: self.nxc_watch_busy,
            match_cursor: self.match_cursor,
        }
    }

    fn set_state(&mut self, state: &PnvXive2State) {
        self.cq_regs.clone_from(&state.cq_regs);
        self.pc_regs.clone_from(&state.pc_regs);
        self.vc_regs.clone_from(&state.vc_regs);
        self.tctxt_regs.clone_from(&state.tctxt_regs);
        for (table, saved) in self.tables.iter_mut().zip(&state.tables) {
            table.copy_from_slice(saved);
        }
        self.vst.set_state(&state.vsds);
        self.endc_watch_busy = state.endc_watch_busy;
        self.nxc_watch_busy = state.nxc_watch_busy;
        self.match_cursor = state.match_cursor;
    }

    fn vst_read_entry(&mut self, table: usize, blk: u8, idx: u32, data: &mut [u8]) -> Result<()> {
        self.vst
            .read(&self.mem, self.siblings.as_deref(), table, blk, idx, data)
            .map_err(|_| match table {
                VST_EAS => Error::UnknownEas(blk, idx),
                VST_END => Error::UnknownEnd(blk, idx),
                VST_NVP => Error::UnknownNvp(blk, idx),
                _ => Error::UnknownNvgc(blk, idx),
            })
    }

    fn vst_write_entry(
        &mut self,
        table: usize,
        blk: u8,
        idx: u32,
        data: &[u8],
        word: Option<usize>,
    ) -> Result<()> {
        self.vst
            .write(&self.mem, self.siblings.as_deref(), table, blk, idx, data, word)
            .map_err(|_| match table {
                VST_EAS => Error::UnknownEas(blk, idx),
                VST_END => Error::UnknownEnd(blk, idx),
                VST_NVP => Error::UnknownNvp(blk, idx),
                _ => Error::UnknownNvgc(blk, idx),
            })
    }
}

impl Xive2Router for PnvXive2 {
    fn get_eas(&mut self, blk: u8, idx: u32) -> Result<Eas2> {
        if blk != self.block_id() {
            warn!("XIVE[{:x}] - VST: EAS {:x}/{:x} is remote !?", self.chip_id, blk, idx);
            return Err(Error::RemoteBlock(blk));
        }
        let mut bytes = [0u8; 8];
        self.vst_read_entry(VST_EAS, blk, idx, &mut bytes)?;
        Ok(Eas2 {
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

    fn get_end(&mut self, blk: u8, idx: u32) -> Result<End2> {
        let mut bytes = [0u8; 32];
        self.vst_read_entry(VST_END, blk, idx, &mut bytes)?;
        let mut end = End2::default();
        words_from_be(&bytes, &mut end.w);
        Ok(end)
    }

    fn write_end(&mut self, blk: u8, idx: u32, end: &End2, word: Option<usize>) -> Result<()> {
        let mut bytes = [0u8; 32];
        words_to_be(&end.w, &mut bytes);
        self.vst_write_entry(VST_END, blk, idx, &bytes, word)
    }

    fn get_nvp(&mut self, blk: u8, idx: u32) -> Result<Nvp> {
        let mut bytes = [0u8; 32];
        self.vst_read_entry(VST_NVP, blk, idx, &mut bytes)?;
        let mut nvp = Nvp::default();
        words_from_be(&bytes, &mut nvp.w);
        Ok(nvp)
    }

    fn write_nvp(&mut self, blk: u8, idx: u32, nvp: &Nvp, word: Option<usize>) -> Result<()> {
        let mut bytes = [0u8; 32];
        words_to_be(&nvp.w, &mut bytes);
        self.vst_write_entry(VST_NVP, blk, idx, &bytes, word)
    }

    fn get_nvgc(&mut self, crowd: bool, blk: u8, idx: u32) -> Result<Nvgc> {
        let table = if crowd { VST_NVC } else { VST_NVG };
        let mut bytes = [0u8; 32];
        self.vst_read_entry(table, blk, idx, &mut bytes)?;
        let mut nvgc = Nvgc::default();
        words_from_be(&bytes, &mut nvgc.w);
        Ok(nvgc)
    }

    fn write_nvgc(&mut self, crowd: bool, blk: u8, idx: u32, nvgc: &Nvgc) -> Result<()> {
        let table = if crowd { VST_NVC } else { VST_NVG };
        let mut bytes = [0u8; 32];
        words_to_be(&nvgc.w, &mut bytes);
        self.vst_write_entry(table, blk, idx, &bytes, None)
    }

    fn block_id(&self) -> u8 {
        let cfg = self.cq_regs[(CQ_XIVE_CFG >> 3) as usize];
        if cfg & CQ_XIVE_CFG_HYP_HARD_BLKID_OVERRIDE != 0 {
            get_field64(CQ_XIVE_CFG_HYP_HARD_BLOCK_ID, cfg) as u8
        } else {
            self.chip_id
        }
    }

    fn config(&self) -> PresenterConfig {
        let cfg_val = self.cq_regs[(CQ_XIVE_CFG >> 3) as usize];
        let mut cfg = PresenterConfig::empty();

        if cfg_val & CQ_XIVE_CFG_GEN1_TIMA_OS != 0 {
            cfg |= PresenterConfig::GEN1_TIMA_OS;
        }
        if cfg_val & CQ_XIVE_CFG_EN_VP_SAVE_RESTORE != 0 {
            cfg |= PresenterConfig::VP_SAVE_RESTORE;
        }
        if get_field64(CQ_XIVE_CFG_HYP_HARD_RANGE, cfg_val) == CQ_XIVE_CFG_THREADID_8BITS {
            cfg |= PresenterConfig::THREADID_8BITS;
        }
        cfg
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
        let (outcome, cursor) = scan_for_match2(&threads, spec, self.match_cursor)?;
        self.match_cursor = cursor;
        Ok(outcome)
    }

    fn present(&mut self, thread: usize, ring: Ring, priority: u8, group_level: u8) {
        self.threads[thread].pipr_update(ring, priority, group_level);
    }

    fn broadcast(&mut self, spec: &NvtMatchSpec) {
        let enabled: Vec<bool> = self
            .threads
            .iter()
            .map(|t| self.thread_enabled(t.pir))
            .collect();
        for (tctx, enabled) in self.threads.iter_mut().zip(enabled) {
            if enabled {
                backlog_hint(tctx, spec);
            }
        }
    }

    fn end_notify(&mut self, eas: &Eas2) {
        end_notify2(self, eas);
    }
}

impl BusDevice for PnvXive2 {
    /// The IC BAR window: one register page per sub-engine, then the
    /// notify, sync and LSI pages.
    fn read(&mut self, _base: u64, offset: u64, data: &mut [u8]) {
        let page = offset >> 12;
        let page_offset = offset & 0xfff;

        let val = match page {
            IC_PAGE_CQ if data.len() == 8 => self.cq_read(page_offset),
            IC_PAGE_PC if data.len() == 8 => self.pc_read(page_offset),
            IC_PAGE_VC if data.len() == 8 => self.vc_read(page_offset),
            IC_PAGE_TCTXT if data.len() == 8 => self.tctxt_read(page_offset),
            IC_PAGE_LSI_MGMT => u64::MAX,
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
        let page = offset >> 12;
        let page_offset = offset & 0xfff;

        debug!("XIVE[{:x}] - IC write @0x{:x} <- 0x{:x}", self.chip_id, offset, val);
        match page {
            IC_PAGE_CQ => self.cq_write(page_offset, val),
            IC_PAGE_PC => self.pc_write(page_offset, val),
            IC_PAGE_VC => self.vc_write(page_offset, val),
            IC_PAGE_TCTXT => self.tctxt_write(page_offset, val),
            IC_PAGE_NOTIFY => self.notify_write(page_offset, val),
            // Sync and LSI pages are dataless operations, acknowledged.
            IC_PAGE_SYNC_POLL | IC_PAGE_SYNC_INJECT | IC_PAGE_LSI_TRIGGER | IC_PAGE_LSI_MGMT => {}
            _ => {
                warn!("XIVE[{:x}] - IC: invalid write @0x{:x}", self.chip_id, offset);
            }
        }
    }
}

impl Pausable for PnvXive2 {}

impl Snapshottable for PnvXive2 {
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

impl Migratable for PnvXive2 {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vm_memory::Bytes;
    use xive::field::set_field32;
    use xive::regs::*;
    use xive::regs2::*;
    use xive::GuestAddress;

    struct TestLine(AtomicBool);
    impl TestLine {
        fn new() -> Arc<Self> {
            Arc::new(TestLine(AtomicBool::new(false)))
        }
        fn level(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }
    impl InterruptLine for TestLine {
        fn set_level(&self, level: bool) {
            self.0.store(level, Ordering::SeqCst);
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

    const EAT_BASE: u64 = 0x10_0000;
    const ENDT_BASE: u64 = 0x20_0000;
    const NVPT_BASE: u64 = 0x40_0000;
    const NVGT_BASE: u64 = 0x48_0000;
    const QUEUE_BASE: u64 = 0x80_0000;

    fn configure(xive: &mut PnvXive2) {
        for (table, addr) in [
            (VST_EAS, EAT_BASE),
            (VST_END, ENDT_BASE),
            (VST_NVP, NVPT_BASE),
            (VST_NVG, NVGT_BASE),
            (VST_NVC, 0x50_0000),
        ] {
            let table_addr = set_field64(VSD_TABLE_SELECT, 0, table as u64);
            xive.vc_write(VC_VSD_TABLE_ADDR, table_addr);
            xive.vc_write(VC_VSD_TABLE_DATA, direct_vsd(addr, 16));
        }
    }

    fn store_words(xive: &PnvXive2, addr: u64, w: &[u32]) {
        let mut bytes = vec![0u8; w.len() * 4];
        words_to_be(w, &mut bytes);
        xive.mem.memory().write_slice(&bytes, GuestAddress(addr)).unwrap();
    }

    fn store_eas(xive: &PnvXive2, idx: u32, eas: Eas2) {
        xive.mem
            .memory()
            .write_slice(&eas.w.to_be_bytes(), GuestAddress(EAT_BASE + idx as u64 * 8))
            .unwrap();
    }

    fn group_end(vp_idx: u32, priority: u8) -> End2 {
        let mut end = End2::default();
        end.w[0] = END2_W0_VALID | END2_W0_ENQUEUE | END2_W0_UCOND_NOTIFY;
        end.w[1] = set_field32(END2_W1_GENERATION, 0, 1);
        end.w[3] = QUEUE_BASE as u32;
        end.w[6] = END2_W6_IGNORE | set_field32(END2_W6_VP_OFFSET, 0, vp_idx);
        end.w[7] = set_field32(END2_W7_F0_PRIORITY, 0, priority as u32);
        end
    }

    fn routed_chip() -> (PnvXive2, Arc<TestLine>) {
        let mut xive = PnvXive2::new(String::from("pnv-xive2"), 0, test_mem()).unwrap();
        configure(&mut xive);

        let os_line = TestLine::new();
        xive.add_thread(0, os_line.clone(), TestLine::new());
        xive.enable_thread(0);

        // EAS 5 -> END 2 -> group of NVP 0x441, priority 3; arm the
        // source.
        xive.ipi_source().esb_set(5, xive::esb::PQ_RESET);
        store_eas(&xive, 5, Eas2::new(0, 2, 0));
        store_words(&xive, ENDT_BASE + 2 * 32, &group_end(0x441, 3).w);
        let mut nvp = Nvp::default();
        nvp.w[0] = NVP2_W0_VALID;
        store_words(&xive, NVPT_BASE + 0x441 * 32, &nvp.w);
        let mut nvgc = Nvgc::default();
        nvgc.w[0] = NVGC2_W0_VALID;
        let level = group_level(false, true, 0, 0x441);
        store_words(
            &xive,
            NVGT_BASE + nvgc_index(0x441, level) as u64 * 32,
            &nvgc.w,
        );

        (xive, os_line)
    }

    fn dispatch_os(xive: &mut PnvXive2, thread: usize, nvp_idx: u32, cppr: u8) {
        let blk = xive.block_id();
        let tctx = xive.thread(thread);
        tctx.set_word2(Ring::Os, TM_QW1W2_VO | nvt_cam_line(blk, nvp_idx));
        tctx.set_cppr(Ring::Os, cppr);
    }

    #[test]
    fn test_group_routing_through_vst() {
        let (mut xive, os_line) = routed_chip();
        dispatch_os(&mut xive, 0, 0x440, 7);

        let trigger = 5u64 << ESB_64K_2PAGE;
        xive.ipi_esb_write(trigger, 0, 8);

        assert!(os_line.level());
        let tctx = xive.thread(0);
        assert_eq!(tctx.reg(Ring::Os, TM_PIPR), 3);
        assert_ne!(tctx.reg(Ring::Os, TM_NSR) & TM_NSR_GRP_LVL, 0);

        // The queue entry landed in guest memory.
        let mut bytes = [0u8; 4];
        xive.mem
            .memory()
            .read_slice(&mut bytes, GuestAddress(QUEUE_BASE))
            .unwrap();
        assert_eq!(BigEndian::read_u32(&bytes), 1 << 31);
    }

    #[test]
    fn test_backlog_persists_in_guest_memory() {
        let (mut xive, os_line) = routed_chip();
        // Nobody dispatched: the interrupt lands in the NVG counters.
        let trigger = 5u64 << ESB_64K_2PAGE;
        xive.ipi_esb_write(trigger, 0, 8);
        assert!(!os_line.level());

        let level = group_level(false, true, 0, 0x441);
        let nvgc = xive
            .get_nvgc(false, 0, nvgc_index(0x441, level))
            .unwrap();
        assert_eq!(nvgc.backlog(3), 1);
    }

    #[test]
    fn test_watch_engine_assignment() {
        let (mut xive, _line) = routed_chip();

        // Claim all four engines.
        for expected in 0..4u64 {
            assert_eq!(xive.vc_read(VC_ENDC_WATCH_ASSIGN), expected);
        }
        // All busy: the firmware gets the sentinel and retries.
        assert_eq!(xive.vc_read(VC_ENDC_WATCH_ASSIGN), WATCH_ALL_BUSY);

        // Reading SPEC of engine 2 releases it.
        xive.vc_read(VC_ENDC_WATCH0_SPEC + 2 * WATCH_STRIDE);
        assert_eq!(xive.vc_read(VC_ENDC_WATCH_ASSIGN), 2);
    }

    #[test]
    fn test_end_watch_update_and_load() {
        let (mut xive, _line) = routed_chip();

        let engine = xive.vc_read(VC_ENDC_WATCH_ASSIGN) as u64;
        let spec_reg = VC_ENDC_WATCH0_SPEC + engine * WATCH_STRIDE;
        let data0_reg = VC_ENDC_WATCH0_DATA0 + engine * WATCH_STRIDE;

        // Select END 0/2 and load it.
        xive.vc_write(spec_reg, set_field64(VC_ENDC_WATCH_INDEX, 0, 2));
        let dat0 = xive.vc_read(data0_reg);
        assert_eq!((dat0 >> 32) as u32 & END2_W0_VALID, END2_W0_VALID);

        // Rewrite word 7 with a new priority and push the update.
        let dat3 = xive.vc_read(data0_reg + 24);
        let patched =
            (dat3 & !0xffff_ffff) | set_field32(END2_W7_F0_PRIORITY, 0, 6) as u64;
        xive.vc_write(data0_reg + 24, patched);
        xive.vc_write(data0_reg, dat0);

        assert_eq!(xive.get_end(0, 2).unwrap().priority(), 6);

        // SPEC read releases the engine with no conflict reported.
        let spec = xive.vc_read(spec_reg);
        assert_eq!(spec & (VC_ENDC_WATCH_FULL | VC_ENDC_WATCH_CONFLICT), 0);
        assert_eq!(xive.vc_read(VC_ENDC_WATCH_ASSIGN), engine);
    }

    #[test]
    fn test_nxc_watch_nvp_update() {
        let (mut xive, _line) = routed_chip();

        let engine = xive.pc_read(PC_NXC_WATCH_ASSIGN) as u64;
        let spec_reg = PC_NXC_WATCH0_SPEC + engine * WATCH_STRIDE;
        let data0_reg = PC_NXC_WATCH0_DATA0 + engine * WATCH_STRIDE;

        xive.pc_write(spec_reg, set_field64(PC_NXC_WATCH_INDEX, 0, 0x441));
        let dat0 = xive.pc_read(data0_reg);
        assert_eq!((dat0 >> 32) as u32 & NVP2_W0_VALID, NVP2_W0_VALID);

        // Patch word 2 (the save/restore bytes) through the engine.
        let mut nvp = Nvp::default();
        nvp.set_cppr(5);
        xive.pc_write(data0_reg + 8, ((nvp.w[2] as u64) << 32) | 0);
        xive.pc_write(data0_reg, dat0);

        assert_eq!(xive.get_nvp(0, 0x441).unwrap().cppr(), 5);
    }

    #[test]
    fn test_block_id_override() {
        let (mut xive, _line) = routed_chip();
        assert_eq!(xive.block_id(), 0);

        let cfg = CQ_XIVE_CFG_HYP_HARD_BLKID_OVERRIDE
            | set_field64(CQ_XIVE_CFG_HYP_HARD_BLOCK_ID, 0, 0xc);
        xive.cq_write(CQ_XIVE_CFG, cfg);
        assert_eq!(xive.block_id(), 0xc);
    }

    #[test]
    fn test_config_bits() {
        let (mut xive, _line) = routed_chip();
        assert_eq!(xive.config(), PresenterConfig::empty());

        xive.cq_write(
            CQ_XIVE_CFG,
            CQ_XIVE_CFG_GEN1_TIMA_OS | CQ_XIVE_CFG_EN_VP_SAVE_RESTORE,
        );
        let cfg = xive.config();
        assert!(cfg.contains(PresenterConfig::GEN1_TIMA_OS));
        assert!(cfg.contains(PresenterConfig::VP_SAVE_RESTORE));
    }

    #[test]
    fn test_end_trigger_page() {
        let (mut xive, os_line) = routed_chip();
        dispatch_os(&mut xive, 0, 0x440, 7);

        // A store on the END page triggers the END directly.
        xive.end_esb_write(2 << (ESB_64K + 1), 0x15, 8);
        assert!(os_line.level());

        let mut bytes = [0u8; 4];
        xive.mem
            .memory()
            .read_slice(&mut bytes, GuestAddress(QUEUE_BASE))
            .unwrap();
        assert_eq!(BigEndian::read_u32(&bytes), (1 << 31) | 0x15);
    }

    #[test]
    fn test_stt_autoincrement() {
        let (mut xive, _line) = routed_chip();
        let tar = set_field64(CQ_TAR_SELECT, 0, CQ_TAR_ESB) | CQ_TAR_AUTOINC;
        xive.cq_write(CQ_TAR, tar);
        xive.cq_write(CQ_TDR, 0xaa);
        xive.cq_write(CQ_TDR, 0xbb);
        assert_eq!(xive.tables[CQ_TAR_ESB as usize][0], 0xaa);
        assert_eq!(xive.tables[CQ_TAR_ESB as usize][1], 0xbb);
    }

    #[test]
    fn test_snapshot_restore() {
        let (mut xive, _line) = routed_chip();
        xive.enable_thread(1);
        let trigger = 5u64 << ESB_64K_2PAGE;
        xive.ipi_esb_write(trigger, 0, 8);

        let snapshot = xive.snapshot().unwrap();

        let mut other =
            PnvXive2::new(String::from("pnv-xive2"), 0, xive.memory()).unwrap();
        other.add_thread(0, TestLine::new(), TestLine::new());
        other.restore(snapshot).unwrap();

        assert!(other.thread_enabled(1));
        assert_eq!(other.ipi_source().esb_get(5), xive.ipi_source().esb_get(5));
        // The restored chip resolves the same tables.
        assert!(other.get_end(0, 2).unwrap().is_valid());
    }
}
