// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! sPAPR (pseries) XIVE interrupt controller.
//!
//! The paravirtualized machine keeps the EAS and END tables in the
//! device rather than in guest memory: the guest configures routing
//! through hypercalls instead of writing structures and VSDs. Event
//! queues still live in guest pages, handed over by the queue
//! configuration hypercall. The controller is a single block and every
//! vCPU context is permanently dispatched on its thread.

#[macro_use]
extern crate bitflags;

use std::result;
use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};
use vm_memory::GuestAddressSpace;
use vm_migration::{Migratable, MigratableError, Pausable, Snapshot, Snapshottable};
use xive::end_source::EndSource;
use xive::regs::{nvt_cam_line, Eas, End, Nvt, NVT_W0_VALID, TM_QW1W2_VO};
use xive::router::{
    end_notify, lisn, router_notify, scan_for_match, MatchOutcome, NvtMatchSpec, XiveRouter,
};
use xive::source::{SourceFlags, XiveSource, ESB_64K, ESB_64K_2PAGE};
use xive::tctx::{Ring, Tctx};
use xive::{
    tima, Error, GuestMemoryAtomic, GuestMemoryMmap, InterruptLine, PresenterConfig, Result,
};

pub mod hcall;

/// The sPAPR machine is a single XIVE block.
pub const SPAPR_XIVE_BLOCK_ID: u8 = 0;

/// NVT identifiers of the vCPUs start at this offset; identifiers below
/// are reserved to the hypervisor.
pub const SPAPR_XIVE_NVT_BASE: u32 = 0x400;

/// One END per priority per vCPU.
const END_PER_TARGET: u32 = 8;

/// Paravirtualized XIVE interrupt controller.
pub struct SpaprXive {
    id: String,
    nr_irqs: u32,
    pub(crate) nr_servers: u32,

    /// Guest assignable interrupts, one EAS each.
    pub(crate) eat: Vec<Eas>,
    /// One END per (server, priority).
    pub(crate) endt: Vec<End>,
    /// Per-vCPU interrupt state, the backlog IPB in particular. The
    /// machine has no NVT backing store; the table is device memory.
    nvtt: Vec<Nvt>,

    pub(crate) source: XiveSource,
    end_source: EndSource,
    threads: Vec<Tctx>,

    /// XIVE exploitation mode has been negotiated by the guest.
    pub(crate) enabled: bool,

    mem: GuestMemoryAtomic<GuestMemoryMmap>,
}

#[derive(Serialize, Deserialize)]
pub struct SpaprXiveState {
    eat: Vec<Eas>,
    endt: Vec<End>,
    nvtt: Vec<Nvt>,
    enabled: bool,
}

impl SpaprXive {
    pub fn new(
        id: String,
        nr_irqs: u32,
        nr_servers: u32,
        mem: GuestMemoryAtomic<GuestMemoryMmap>,
    ) -> result::Result<Self, xive::source::Error> {
        let source = XiveSource::new(
            format!("{}-source", id),
            nr_irqs,
            ESB_64K_2PAGE,
            SourceFlags::STORE_EOI,
        )?;
        let nr_ends = nr_servers * END_PER_TARGET;
        let end_source = EndSource::new(nr_ends, ESB_64K).expect("END source setting");

        Ok(SpaprXive {
            id,
            nr_irqs,
            nr_servers,
            eat: vec![Eas::default(); nr_irqs as usize],
            endt: vec![End::default(); nr_ends as usize],
            nvtt: vec![Nvt::default(); nr_servers as usize],
            source,
            end_source,
            threads: Vec::new(),
            enabled: false,
            mem,
        })
    }

    pub fn nr_irqs(&self) -> u32 {
        self.nr_irqs
    }

    pub fn source(&mut self) -> &mut XiveSource {
        &mut self.source
    }

    pub fn thread(&mut self, vp_id: u32) -> &mut Tctx {
        &mut self.threads[vp_id as usize]
    }

    /// Switches the guest interrupt mode. The tables survive, the
    /// hypercall surface only answers in exploitation mode.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Connects a vCPU: its interrupt context is created and the OS
    /// ring comes up dispatched with the vCPU's NVT, as the machine
    /// does not schedule virtual processors on threads.
    pub fn add_vcpu(
        &mut self,
        os_line: Arc<dyn InterruptLine>,
        hv_line: Arc<dyn InterruptLine>,
    ) -> u32 {
        let vp_id = self.threads.len() as u32;
        assert!(vp_id < self.nr_servers);

        let mut tctx = Tctx::new(os_line, hv_line);
        tctx.pir = vp_id;
        tctx.hw_cam = nvt_cam_line(SPAPR_XIVE_BLOCK_ID, (1 << 7) | vp_id);
        tctx.reset(PresenterConfig::GEN1_TIMA_OS);

        let nvt_idx = SPAPR_XIVE_NVT_BASE + vp_id;
        tctx.set_word2(
            Ring::Os,
            TM_QW1W2_VO | nvt_cam_line(SPAPR_XIVE_BLOCK_ID, nvt_idx),
        );

        self.nvtt[vp_id as usize].w[0] = NVT_W0_VALID;
        self.threads.push(tctx);
        vp_id
    }

    /// Reserves an interrupt number for a device.
    pub fn claim_irq(&mut self, lisn: u32, lsi: bool) -> Result<()> {
        if lisn >= self.nr_irqs {
            return Err(Error::UnknownEas(SPAPR_XIVE_BLOCK_ID, lisn));
        }
        if lsi {
            self.source.set_irq_lsi(lisn);
        }
        // Claimed interrupts start out valid and masked.
        self.eat[lisn as usize].w = xive::regs::EAS_VALID | xive::regs::EAS_MASKED;
        Ok(())
    }

    pub fn end_index(target: u32, priority: u8) -> u32 {
        target * END_PER_TARGET + priority as u32
    }

    pub fn nvt_to_target(nvt_idx: u32) -> Option<u32> {
        nvt_idx.checked_sub(SPAPR_XIVE_NVT_BASE)
    }

    /// Input line update from a device.
    pub fn set_irq(&mut self, srcno: u32, level: bool) {
        if let Some(n) = self.source.set_irq(srcno, level) {
            let lisn = lisn(SPAPR_XIVE_BLOCK_ID, n.srcno);
            router_notify(self, lisn, n.pq_checked);
        }
    }

    /// Source ESB MMIO window.
    pub fn esb_read(&mut self, addr: u64, size: usize) -> u64 {
        let (ret, notif) = self.source.esb_read(addr, size);
        if let Some(n) = notif {
            let lisn = lisn(SPAPR_XIVE_BLOCK_ID, n.srcno);
            router_notify(self, lisn, n.pq_checked);
        }
        ret
    }

    pub fn esb_write(&mut self, addr: u64, val: u64, size: usize) {
        if let Some(n) = self.source.esb_write(addr, val, size) {
            let lisn = lisn(SPAPR_XIVE_BLOCK_ID, n.srcno);
            router_notify(self, lisn, n.pq_checked);
        }
    }

    /// END ESB MMIO window.
    pub fn end_esb_read(&mut self, addr: u64, size: usize) -> u64 {
        let end_source = self.end_source.clone();
        end_source.read(self, addr, size)
    }

    /// TIMA window of one vCPU thread.
    pub fn tm_write(&mut self, vp_id: u32, offset: u64, value: u64, size: usize) {
        let Some(index) = self.thread_index(vp_id) else {
            warn!("XIVE: no thread context for vCPU {:x}", vp_id);
            return;
        };
        let mut tctx = std::mem::take(&mut self.threads[index]);
        tima::tm_write(self, &mut tctx, offset, value, size);
        self.threads[index] = tctx;
    }

    pub fn tm_read(&mut self, vp_id: u32, offset: u64, size: usize) -> u64 {
        let Some(index) = self.thread_index(vp_id) else {
            warn!("XIVE: no thread context for vCPU {:x}", vp_id);
            return u64::MAX;
        };
        let mut tctx = std::mem::take(&mut self.threads[index]);
        let ret = tima::tm_read(self, &mut tctx, offset, size);
        self.threads[index] = tctx;
        ret
    }

    fn thread_index(&self, vp_id: u32) -> Option<usize> {
        ((vp_id as usize) < self.threads.len()).then_some(vp_id as usize)
    }

    pub fn reset(&mut self) {
        for eas in self.eat.iter_mut() {
            *eas = Eas::default();
        }
        for end in self.endt.iter_mut() {
            *end = End::default();
        }
        self.source.reset();
        for (vp_id, tctx) in self.threads.iter_mut().enumerate() {
            tctx.reset(PresenterConfig::GEN1_TIMA_OS);
            let nvt_idx = SPAPR_XIVE_NVT_BASE + vp_id as u32;
            tctx.set_word2(
                Ring::Os,
                TM_QW1W2_VO | nvt_cam_line(SPAPR_XIVE_BLOCK_ID, nvt_idx),
            );
        }
        for nvt in self.nvtt.iter_mut() {
            let valid = nvt.is_valid();
            *nvt = Nvt::default();
            if valid {
                nvt.w[0] = NVT_W0_VALID;
            }
        }
    }

    fn state(&self) -> SpaprXiveState {
        SpaprXiveState {
            eat: self.eat.clone(),
            endt: self.endt.clone(),
            nvtt: self.nvtt.clone(),
            enabled: self.enabled,
        }
    }

    fn set_state(&mut self, state: &SpaprXiveState) {
        if state.eat.len() != self.eat.len() || state.endt.len() != self.endt.len() {
            warn!("XIVE: table state mismatch");
            return;
        }
        self.eat.clone_from(&state.eat);
        self.endt.clone_from(&state.endt);
        self.nvtt.clone_from(&state.nvtt);
        self.enabled = state.enabled;
    }
}

impl XiveRouter for SpaprXive {
    fn get_eas(&mut self, blk: u8, idx: u32) -> Result<Eas> {
        if blk != SPAPR_XIVE_BLOCK_ID || idx >= self.nr_irqs {
            return Err(Error::UnknownEas(blk, idx));
        }
        Ok(self.eat[idx as usize])
    }

    fn get_pq(&mut self, blk: u8, idx: u32) -> Result<u8> {
        if blk != SPAPR_XIVE_BLOCK_ID || idx >= self.nr_irqs {
            return Err(Error::UnknownEas(blk, idx));
        }
        Ok(self.source.esb_get(idx))
    }

    fn set_pq(&mut self, blk: u8, idx: u32, pq: u8) -> Result<()> {
        if blk != SPAPR_XIVE_BLOCK_ID || idx >= self.nr_irqs {
            return Err(Error::UnknownEas(blk, idx));
        }
        self.source.esb_set(idx, pq);
        Ok(())
    }

    fn get_end(&mut self, blk: u8, idx: u32) -> Result<End> {
        if blk != SPAPR_XIVE_BLOCK_ID || idx as usize >= self.endt.len() {
            return Err(Error::UnknownEnd(blk, idx));
        }
        Ok(self.endt[idx as usize])
    }

    fn write_end(&mut self, blk: u8, idx: u32, end: &End, word: Option<usize>) -> Result<()> {
        if blk != SPAPR_XIVE_BLOCK_ID || idx as usize >= self.endt.len() {
            return Err(Error::UnknownEnd(blk, idx));
        }
        match word {
            Some(w) => self.endt[idx as usize].w[w] = end.w[w],
            None => self.endt[idx as usize] = *end,
        }
        Ok(())
    }

    fn get_nvt(&mut self, blk: u8, idx: u32) -> Result<Nvt> {
        let target = Self::nvt_to_target(idx);
        match target {
            Some(t) if blk == SPAPR_XIVE_BLOCK_ID && (t as usize) < self.nvtt.len() => {
                Ok(self.nvtt[t as usize])
            }
            _ => Err(Error::UnknownNvt(blk, idx)),
        }
    }

    fn write_nvt(&mut self, blk: u8, idx: u32, nvt: &Nvt, word: Option<usize>) -> Result<()> {
        let target = Self::nvt_to_target(idx);
        match target {
            Some(t) if blk == SPAPR_XIVE_BLOCK_ID && (t as usize) < self.nvtt.len() => {
                match word {
                    Some(w) => self.nvtt[t as usize].w[w] = nvt.w[w],
                    None => self.nvtt[t as usize] = *nvt,
                }
                Ok(())
            }
            _ => Err(Error::UnknownNvt(blk, idx)),
        }
    }

    fn block_id(&self) -> u8 {
        SPAPR_XIVE_BLOCK_ID
    }

    fn memory(&self) -> GuestMemoryAtomic<GuestMemoryMmap> {
        self.mem.clone()
    }

    fn match_nvt(&mut self, spec: &NvtMatchSpec) -> Result<MatchOutcome> {
        let threads: Vec<(bool, &Tctx)> = self.threads.iter().map(|t| (true, t)).collect();
        scan_for_match(&threads, spec)
    }

    fn present(&mut self, thread: usize, ring: Ring, priority: u8, group_level: u8) {
        self.threads[thread].pipr_update(ring, priority, group_level);
    }

    fn end_notify(&mut self, eas: &Eas) {
        end_notify(self, eas);
    }
}

impl Pausable for SpaprXive {}

impl Snapshottable for SpaprXive {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn snapshot(&mut self) -> result::Result<Snapshot, MigratableError> {
        let mut snapshot = Snapshot::new_from_state(&self.state())?;
        snapshot.add_snapshot(self.source.id(), self.source.snapshot()?);
        for (i, tctx) in self.threads.iter_mut().enumerate() {
            snapshot.add_snapshot(format!("tctx{}", i), tctx.snapshot()?);
        }
        Ok(snapshot)
    }

    fn restore(&mut self, snapshot: Snapshot) -> result::Result<(), MigratableError> {
        self.set_state(&snapshot.to_state()?);
        if let Some(s) = snapshot.snapshots.get(&self.source.id()).cloned() {
            self.source.restore(s)?;
        }
        for (i, tctx) in self.threads.iter_mut().enumerate() {
            if let Some(s) = snapshot.snapshots.get(&format!("tctx{}", i)).cloned() {
                tctx.restore(s)?;
            }
        }
        Ok(())
    }
}

impl Migratable for SpaprXive {}
