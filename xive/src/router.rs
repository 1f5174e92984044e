// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! XIVE router.
//!
//! The router turns a source event into a thread exception: it resolves
//! the Event Assignment Structure of the source, feeds the target Event
//! Notification Descriptor (enqueue into the guest-visible event queue,
//! per-END coalescing), resolves the Notification Virtual Target and
//! asks the presenter to scan the thread contexts. Interrupts with no
//! resident target are recorded in the NVT backlog, and coalesced or
//! precluded interrupts can escalate through a secondary END.
//!
//! The chip front-ends implement [`XiveRouter`] to provide the table
//! accesses and the thread context scan; the routing algorithm itself
//! is common.

use byteorder::{BigEndian, ByteOrder};
use log::warn;
use vm_memory::{Bytes, GuestAddress, GuestAddressSpace};

use crate::esb::pq_trigger;
use crate::field::{get_field32, set_field32};
use crate::regs::*;
use crate::regs2::group_level;
use crate::tctx::{Ring, Tctx};
use crate::{Error, GuestMemoryAtomic, GuestMemoryMmap, Result};

/// Global interrupt numbers carry the chip block in their top nibble.
pub fn lisn(blk: u8, srcno: u32) -> u32 {
    ((blk as u32) << 28) | srcno
}

pub fn lisn_block(lisn: u32) -> u8 {
    (lisn >> 28) as u8
}

pub fn lisn_index(lisn: u32) -> u32 {
    lisn & 0x0fff_ffff
}

/// A target specification submitted to the presenter scan.
#[derive(Clone, Copy, Debug)]
pub struct NvtMatchSpec {
    pub format: u8,
    pub nvt_blk: u8,
    pub nvt_idx: u32,
    pub crowd: bool,
    pub cam_ignore: bool,
    pub priority: u8,
    pub logic_serv: u32,
}

/// Outcome of a presenter scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchOutcome {
    /// A dispatched thread context matched.
    Found { thread: usize, ring: Ring },
    /// At least one thread matched but runs at a more favored
    /// priority, so it cannot take the interrupt now.
    Precluded,
    /// No thread context matched.
    NotFound,
}

/// Table and presenter operations the routing algorithm needs from a
/// chip. Writes taking a `word` update a single 32-bit word of the
/// entry, which is how the chip cache-update engines expose them.
pub trait XiveRouter: Send {
    fn get_eas(&mut self, blk: u8, idx: u32) -> Result<Eas>;
    fn get_pq(&mut self, blk: u8, idx: u32) -> Result<u8>;
    fn set_pq(&mut self, blk: u8, idx: u32, pq: u8) -> Result<()>;
    fn get_end(&mut self, blk: u8, idx: u32) -> Result<End>;
    fn write_end(&mut self, blk: u8, idx: u32, end: &End, word: Option<usize>) -> Result<()>;
    fn get_nvt(&mut self, blk: u8, idx: u32) -> Result<Nvt>;
    fn write_nvt(&mut self, blk: u8, idx: u32, nvt: &Nvt, word: Option<usize>) -> Result<()>;

    /// The block served by this router.
    fn block_id(&self) -> u8;

    /// Guest memory holding the event queues.
    fn memory(&self) -> GuestMemoryAtomic<GuestMemoryMmap>;

    /// Scans the thread contexts for a dispatched target.
    fn match_nvt(&mut self, spec: &NvtMatchSpec) -> Result<MatchOutcome>;

    /// Presents a pending priority to a matched thread ring.
    fn present(&mut self, thread: usize, ring: Ring, priority: u8, group_level: u8);

    /// END trigger entry point, so escalations can be rerouted by
    /// backends that do not handle them locally.
    fn end_notify(&mut self, eas: &Eas);
}

/// Appends `data` to the event queue of an END. The store is a single
/// 32-bit big-endian word: the top bit carries the queue generation,
/// which flips when the write offset wraps.
pub fn end_enqueue(mem: &GuestMemoryAtomic<GuestMemoryMmap>, end: &mut End, data: u32) {
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

/// Notification using the END ESn/ESe bits, an Event State Buffer
/// giving the router one more level of coalescing per END.
fn end_es_notify(
    xrtr: &mut dyn XiveRouter,
    end_blk: u8,
    end_idx: u32,
    end: &mut End,
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

    // ESn/e[Q]=1: end of notification
    notify
}

/// Routes a presented event to a matched thread, or reports how the
/// caller must fall back.
fn presenter_notify(
    xrtr: &mut dyn XiveRouter,
    spec: &NvtMatchSpec,
) -> (bool, bool) {
    let outcome = match xrtr.match_nvt(spec) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("XIVE: {}", e);
            return (false, false);
        }
    };

    match outcome {
        MatchOutcome::Found { thread, ring } => {
            let level = group_level(spec.crowd, spec.cam_ignore, spec.nvt_blk, spec.nvt_idx);
            xrtr.present(thread, ring, spec.priority, level);
            (true, false)
        }
        MatchOutcome::Precluded => (false, true),
        MatchOutcome::NotFound => (false, false),
    }
}

/// An END trigger can come from an event trigger or from another END
/// escalating; both carry the same EAS-shaped parameters.
pub fn end_notify(xrtr: &mut dyn XiveRouter, eas: &Eas) {
    let end_blk = eas.end_block();
    let end_idx = eas.end_index();
    let end_data = eas.end_data();

    // END cache lookup
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
        end_enqueue(&xrtr.memory(), &mut end, end_data);
        // Enqueuing event data modifies the EQ toggle and index
        if let Err(e) = xrtr.write_end(end_blk, end_idx, &end, Some(1)) {
            warn!("XIVE: {}", e);
        }
    }

    // When the END is silent, the notification part is skipped.
    if !end.is_silent_escalation() {
        if !end_notify_present(xrtr, end_blk, end_idx, &mut end) {
            return;
        }
    }

    // If activated, escalate the notification using the ESe bits and
    // the EAS in words 4-5.
    if !end.is_escalate() {
        return;
    }

    if !end.is_uncond_escalation() {
        // ESe[Q]=1: end of escalation
        if !end_es_notify(xrtr, end_blk, end_idx, &mut end, END_W1_ESE) {
            return;
        }
    }

    // The END trigger becomes an Escalation trigger
    let esc_eas = end.escalation_eas();
    xrtr.end_notify(&esc_eas);
}

/// The notification half of an END trigger. Returns whether the caller
/// should go on and consider escalation.
fn end_notify_present(
    xrtr: &mut dyn XiveRouter,
    end_blk: u8,
    end_idx: u32,
    end: &mut End,
) -> bool {
    // The W7 format depends on the F bit in W6:
    //
    //   F=0: single or multiple NVT notification
    //   F=1: User level Event-Based Branch (EBB) notification, no
    //        priority
    let format = end.format();
    let priority = end.priority();

    // The END is masked
    if format == 0 && priority == 0xff {
        return false;
    }

    // Check the END ESn (Event State Buffer for notification) for even
    // further coalescing in the Router
    if !end.is_notify() && !end_es_notify(xrtr, end_blk, end_idx, end, END_W1_ESN) {
        return false;
    }

    let nvt_blk = end.nvt_block();
    let nvt_idx = end.nvt_index();

    // NVT cache lookup
    let mut nvt = match xrtr.get_nvt(nvt_blk, nvt_idx) {
        Ok(nvt) => nvt,
        Err(_) => {
            warn!("XIVE: no NVT {:x}/{:x}", nvt_blk, nvt_idx);
            return true;
        }
    };

    if !nvt.is_valid() {
        warn!("XIVE: NVT {:x}/{:x} is invalid", nvt_blk, nvt_idx);
        return true;
    }

    let spec = NvtMatchSpec {
        format,
        nvt_blk,
        nvt_idx,
        crowd: false,
        cam_ignore: end.is_ignore(),
        priority,
        logic_serv: end.log_server_id(),
    };
    let (found, _precluded) = presenter_notify(xrtr, &spec);

    // A presented interrupt does not escalate.
    if found {
        return false;
    }

    // If no matching NVT is dispatched on a HW thread:
    // - specific VP: update the NVT structure if backlog is activated
    // - logical server: forward request to the presentation engine (not
    //   supported)
    if end.is_backlog() {
        if format == 1 {
            warn!(
                "XIVE: END {:x}/{:x} invalid config: F1 & backlog",
                end_blk, end_idx
            );
            return false;
        }
        // Record the IPB in the associated NVT structure for later
        // use. The presenter will resend the interrupt when the vCPU
        // is dispatched again on a HW thread.
        let ipb = nvt.ipb() | priority_to_ipb(spec.priority);
        nvt.set_ipb(ipb);
        if let Err(e) = xrtr.write_nvt(nvt_blk, nvt_idx, &nvt, Some(4)) {
            warn!("XIVE: {}", e);
        }
    }

    true
}

/// Router entry point for a source event notification.
pub fn router_notify(xrtr: &mut dyn XiveRouter, lisn: u32, pq_checked: bool) {
    let eas_blk = lisn_block(lisn);
    let eas_idx = lisn_index(lisn);

    // EAS cache lookup
    let eas = match xrtr.get_eas(eas_blk, eas_idx) {
        Ok(eas) => eas,
        Err(_) => {
            warn!("XIVE: Unknown LISN {:x}", lisn);
            return;
        }
    };

    if !pq_checked {
        // PQ cache lookup
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

    // The event trigger becomes an END trigger
    xrtr.end_notify(&eas);
}

/// Grabs the pending bits accumulated in the NVT while the VP was not
/// dispatched and merges them into the OS ring, then re-evaluates the
/// pending priority. Used when pushing an OS context.
pub(crate) fn need_resend(xrtr: &mut dyn XiveRouter, tctx: &mut Tctx, nvt_blk: u8, nvt_idx: u32) {
    let mut nvt = match xrtr.get_nvt(nvt_blk, nvt_idx) {
        Ok(nvt) => nvt,
        Err(_) => {
            warn!("XIVE: invalid NVT {:x}/{:x}", nvt_blk, nvt_idx);
            return;
        }
    };

    if !nvt.is_valid() {
        warn!("XIVE: invalid NVT {:x}/{:x}", nvt_blk, nvt_idx);
        return;
    }

    let ipb = nvt.ipb();
    if ipb != 0 {
        // Reset the NVT value
        nvt.set_ipb(0);
        if let Err(e) = xrtr.write_nvt(nvt_blk, nvt_idx, &nvt, Some(4)) {
            warn!("XIVE: {}", e);
        }

        let merged = tctx.reg(Ring::Os, TM_IPB) | ipb;
        tctx.set_reg(Ring::Os, TM_IPB, merged);
    }

    // Always re-evaluate the PIPR: even without pending bits recorded
    // in the NVT, an interrupt could have been saved when the context
    // was pulled, and the PIPR is not saved/restored.
    tctx.pipr_update(Ring::Os, 0xff, 0);
}

/// Looks up a thread context match over a bank of threads, the common
/// scan used by chip presenters. Duplicate matches for a specific VP
/// are a guest configuration error.
pub fn scan_for_match(
    threads: &[(bool, &Tctx)],
    spec: &NvtMatchSpec,
) -> Result<MatchOutcome> {
    let mut found: Option<(usize, Ring)> = None;

    for (thread, (enabled, tctx)) in threads.iter().enumerate() {
        if !enabled {
            continue;
        }

        let ring = tctx.match_ring(
            spec.format,
            spec.nvt_blk,
            spec.nvt_idx,
            spec.cam_ignore,
            spec.logic_serv,
        );

        if let Some(ring) = ring {
            // Save the context and follow on to catch duplicates, which
            // the hardware does not allow for a specific VP.
            if found.is_some() {
                return Err(Error::DuplicateMatch(spec.nvt_blk, spec.nvt_idx));
            }
            found = Some((thread, ring));
        }
    }

    Ok(match found {
        Some((thread, ring)) => MatchOutcome::Found { thread, ring },
        None => MatchOutcome::NotFound,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tctx::test_helpers::RecordedLine;
    use crate::PresenterConfig;
    use std::sync::Arc;

    /// A router with no tables behind it, for exercising the error
    /// paths and the TIMA operations that do not touch tables.
    pub(crate) struct NullRouter {
        mem: GuestMemoryAtomic<GuestMemoryMmap>,
    }

    impl Default for NullRouter {
        fn default() -> Self {
            NullRouter {
                mem: GuestMemoryAtomic::new(
                    GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap(),
                ),
            }
        }
    }

    impl XiveRouter for NullRouter {
        fn get_eas(&mut self, blk: u8, idx: u32) -> Result<Eas> {
            Err(Error::UnknownEas(blk, idx))
        }
        fn get_pq(&mut self, blk: u8, idx: u32) -> Result<u8> {
            Err(Error::UnknownEas(blk, idx))
        }
        fn set_pq(&mut self, blk: u8, idx: u32, _pq: u8) -> Result<()> {
            Err(Error::UnknownEas(blk, idx))
        }
        fn get_end(&mut self, blk: u8, idx: u32) -> Result<End> {
            Err(Error::UnknownEnd(blk, idx))
        }
        fn write_end(&mut self, blk: u8, idx: u32, _end: &End, _word: Option<usize>) -> Result<()> {
            Err(Error::UnknownEnd(blk, idx))
        }
        fn get_nvt(&mut self, blk: u8, idx: u32) -> Result<Nvt> {
            Err(Error::UnknownNvt(blk, idx))
        }
        fn write_nvt(&mut self, blk: u8, idx: u32, _nvt: &Nvt, _word: Option<usize>) -> Result<()> {
            Err(Error::UnknownNvt(blk, idx))
        }
        fn block_id(&self) -> u8 {
            0
        }
        fn memory(&self) -> GuestMemoryAtomic<GuestMemoryMmap> {
            self.mem.clone()
        }
        fn match_nvt(&mut self, _spec: &NvtMatchSpec) -> Result<MatchOutcome> {
            Ok(MatchOutcome::NotFound)
        }
        fn present(&mut self, _thread: usize, _ring: Ring, _priority: u8, _group_level: u8) {}
        fn end_notify(&mut self, _eas: &Eas) {}
    }

    /// A single-block router backed by in-memory tables and one thread,
    /// close to what the machine front-ends provide.
    pub(crate) struct TestRouter {
        pub eat: Vec<Eas>,
        pub endt: Vec<End>,
        pub nvtt: Vec<Nvt>,
        pub pq: Vec<u8>,
        pub threads: Vec<(bool, Tctx)>,
        pub mem: GuestMemoryAtomic<GuestMemoryMmap>,
        pub os_lines: Vec<Arc<RecordedLine>>,
    }

    impl TestRouter {
        pub fn new(nr_threads: usize) -> Self {
            let mut threads = Vec::new();
            let mut os_lines = Vec::new();
            for _ in 0..nr_threads {
                let os_line = RecordedLine::new();
                let mut tctx = Tctx::new(os_line.clone(), RecordedLine::new());
                tctx.reset(PresenterConfig::empty());
                os_lines.push(os_line);
                threads.push((true, tctx));
            }
            TestRouter {
                eat: vec![Eas::default(); 64],
                endt: vec![End::default(); 64],
                nvtt: vec![Nvt::default(); 0x800],
                pq: vec![0; 64],
                threads,
                os_lines,
                mem: GuestMemoryAtomic::new(
                    GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 1 << 20)]).unwrap(),
                ),
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

    impl XiveRouter for TestRouter {
        fn get_eas(&mut self, blk: u8, idx: u32) -> Result<Eas> {
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
        fn get_end(&mut self, blk: u8, idx: u32) -> Result<End> {
            if blk != 0 || idx as usize >= self.endt.len() {
                return Err(Error::UnknownEnd(blk, idx));
            }
            Ok(self.endt[idx as usize])
        }
        fn write_end(&mut self, blk: u8, idx: u32, end: &End, word: Option<usize>) -> Result<()> {
            if blk != 0 || idx as usize >= self.endt.len() {
                return Err(Error::UnknownEnd(blk, idx));
            }
            match word {
                Some(w) => self.endt[idx as usize].w[w] = end.w[w],
                None => self.endt[idx as usize] = *end,
            }
            Ok(())
        }
        fn get_nvt(&mut self, blk: u8, idx: u32) -> Result<Nvt> {
            if blk != 0 || idx as usize >= self.nvtt.len() {
                return Err(Error::UnknownNvt(blk, idx));
            }
            Ok(self.nvtt[idx as usize])
        }
        fn write_nvt(&mut self, blk: u8, idx: u32, nvt: &Nvt, word: Option<usize>) -> Result<()> {
            if blk != 0 || idx as usize >= self.nvtt.len() {
                return Err(Error::UnknownNvt(blk, idx));
            }
            match word {
                Some(w) => self.nvtt[idx as usize].w[w] = nvt.w[w],
                None => self.nvtt[idx as usize] = *nvt,
            }
            Ok(())
        }
        fn block_id(&self) -> u8 {
            0
        }
        fn memory(&self) -> GuestMemoryAtomic<GuestMemoryMmap> {
            self.mem.clone()
        }
        fn match_nvt(&mut self, spec: &NvtMatchSpec) -> Result<MatchOutcome> {
            let threads: Vec<(bool, &Tctx)> =
                self.threads.iter().map(|(e, t)| (*e, t)).collect();
            scan_for_match(&threads, spec)
        }
        fn present(&mut self, thread: usize, ring: Ring, priority: u8, group_level: u8) {
            self.threads[thread].1.pipr_update(ring, priority, group_level);
        }
        fn end_notify(&mut self, eas: &Eas) {
            end_notify(self, eas);
        }
    }

    fn queue_end(qaddr: u64, qsize_log2: u32, nvt_idx: u32, priority: u8) -> End {
        let mut end = End::default();
        end.w[0] = END_W0_VALID | END_W0_ENQUEUE | END_W0_UCOND_NOTIFY;
        end.w[0] = set_field32(END_W0_QSIZE, end.w[0], qsize_log2 - 10);
        end.w[1] = set_field32(END_W1_GENERATION, 0, 1);
        end.w[2] = (qaddr >> 32) as u32;
        end.w[3] = qaddr as u32;
        end.w[6] = set_field32(END_W6_NVT_INDEX, 0, nvt_idx);
        end.w[7] = set_field32(END_W7_F0_PRIORITY, 0, priority as u32);
        end
    }

    #[test]
    fn test_lisn_encoding() {
        assert_eq!(lisn(0x3, 0x42), 0x3000_0042);
        assert_eq!(lisn_block(0x3000_0042), 0x3);
        assert_eq!(lisn_index(0x3000_0042), 0x42);
    }

    #[test]
    fn test_notify_resident_target() {
        let mut rtr = TestRouter::new(1);
        rtr.eat[5] = Eas::new(0, 2, 0);
        rtr.endt[2] = queue_end(0x1_0000, 10, 0x400, 3);
        rtr.nvtt[0x400].w[0] = NVT_W0_VALID;

        // Dispatch the NVT on thread 0, OS ring, CPPR 4.
        rtr.threads[0]
            .1
            .set_word2(Ring::Os, TM_QW1W2_VO | nvt_cam_line(0, 0x400));
        rtr.threads[0].1.set_cppr(Ring::Os, 4);

        router_notify(&mut rtr, lisn(0, 5), true);

        // One word in the queue, generation 1, data 0.
        assert_eq!(rtr.read_queue(0x1_0000, 0), 1 << 31);
        assert_eq!(rtr.endt[2].qindex(), 1);

        let tctx = &rtr.threads[0].1;
        assert_eq!(tctx.reg(Ring::Os, TM_IPB), priority_to_ipb(3));
        assert_eq!(tctx.reg(Ring::Os, TM_PIPR), 3);
        assert_eq!(tctx.reg(Ring::Os, TM_NSR), TM_QW1_NSR_EO);
        assert!(rtr.os_lines[0].level());

        // Accept: CPPR takes the priority, the line drops.
        let ack = rtr.threads[0].1.accept(Ring::Os);
        assert_eq!(ack & 0xff, 3);
        assert_eq!(ack >> 8, TM_QW1_NSR_EO as u64);
        assert_eq!(rtr.threads[0].1.reg(Ring::Os, TM_PIPR), 0xff);
        assert!(!rtr.os_lines[0].level());
    }

    #[test]
    fn test_queue_generation_flips_on_wrap() {
        let mut rtr = TestRouter::new(0);
        rtr.eat[1] = Eas::new(0, 0, 0);
        // Smallest architected queue: 1K entries.
        rtr.endt[0] = queue_end(0x2_0000, 10, 0x400, 0xff);

        let entries = rtr.endt[0].qentries();
        for i in 0..entries + 3 {
            let eas = Eas::new(0, 0, i);
            end_notify(&mut rtr, &eas);
        }

        // After qentries + 3 events the generation flipped once.
        assert_eq!(rtr.endt[0].qgen(), 0);
        assert_eq!(rtr.endt[0].qindex(), 3);
        // The wrapped entries carry the new generation.
        assert_eq!(rtr.read_queue(0x2_0000, 0), entries);
        assert_eq!(rtr.read_queue(0x2_0000, 2), entries + 2);
        // The not-yet-overwritten tail still has the old generation.
        assert_eq!(rtr.read_queue(0x2_0000, 3), (1 << 31) | 3);
    }

    #[test]
    fn test_masked_eas_completes_silently() {
        let mut rtr = TestRouter::new(1);
        let mut eas = Eas::new(0, 2, 0);
        eas.set_masked(true);
        rtr.eat[5] = eas;
        rtr.endt[2] = queue_end(0x1_0000, 10, 0x400, 3);

        router_notify(&mut rtr, lisn(0, 5), true);
        assert_eq!(rtr.endt[2].qindex(), 0);
    }

    #[test]
    fn test_router_runs_pq_check_when_not_done() {
        let mut rtr = TestRouter::new(1);
        rtr.eat[5] = Eas::new(0, 2, 0);
        rtr.endt[2] = queue_end(0x1_0000, 10, 0x400, 3);

        // First trigger goes through and latches PENDING.
        router_notify(&mut rtr, lisn(0, 5), false);
        assert_eq!(rtr.pq[5], crate::esb::PQ_PENDING);
        assert_eq!(rtr.endt[2].qindex(), 1);

        // Second one is coalesced.
        router_notify(&mut rtr, lisn(0, 5), false);
        assert_eq!(rtr.pq[5], crate::esb::PQ_QUEUED);
        assert_eq!(rtr.endt[2].qindex(), 1);
    }

    #[test]
    fn test_backlog_records_ipb_when_not_dispatched() {
        let mut rtr = TestRouter::new(1);
        rtr.eat[5] = Eas::new(0, 2, 0);
        let mut end = queue_end(0x1_0000, 10, 0x410, 2);
        end.w[0] |= END_W0_BACKLOG;
        rtr.endt[2] = end;
        rtr.nvtt[0x410].w[0] = NVT_W0_VALID;

        // Nothing dispatched: the priority lands in the NVT IPB.
        router_notify(&mut rtr, lisn(0, 5), true);
        assert_eq!(rtr.nvtt[0x410].ipb(), priority_to_ipb(2));

        // Pushing the context resends the pending interrupt.
        let mut tctx = std::mem::take(&mut rtr.threads[0].1);
        tctx.set_cppr(Ring::Os, 7);
        crate::tima::tm_write(
            &mut rtr,
            &mut tctx,
            ((TM_HV_PAGE as u64) << TM_SHIFT) + (TM_QW1_OS + TM_WORD2) as u64,
            (TM_QW1W2_VO | nvt_cam_line(0, 0x410)) as u64,
            4,
        );
        rtr.threads[0].1 = tctx;

        assert_eq!(rtr.nvtt[0x410].ipb(), 0);
        let tctx = &rtr.threads[0].1;
        assert_eq!(tctx.reg(Ring::Os, TM_IPB), priority_to_ipb(2));
        assert_eq!(tctx.reg(Ring::Os, TM_PIPR), 2);
        assert!(rtr.os_lines[0].level());
    }

    #[test]
    fn test_esn_coalesces_when_notify_not_unconditional() {
        let mut rtr = TestRouter::new(1);
        rtr.eat[5] = Eas::new(0, 2, 0);
        let mut end = queue_end(0x1_0000, 10, 0x400, 3);
        end.w[0] &= !END_W0_UCOND_NOTIFY;
        rtr.endt[2] = end;
        rtr.nvtt[0x400].w[0] = NVT_W0_VALID;
        rtr.threads[0]
            .1
            .set_word2(Ring::Os, TM_QW1W2_VO | nvt_cam_line(0, 0x400));
        rtr.threads[0].1.set_cppr(Ring::Os, 7);

        router_notify(&mut rtr, lisn(0, 5), true);
        // First notification goes through, ESn latches PENDING.
        assert_eq!(get_field32(END_W1_ESN, rtr.endt[2].w[1]), 0b10);
        assert_eq!(rtr.threads[0].1.reg(Ring::Os, TM_PIPR), 3);

        // A second event is enqueued but not notified again.
        rtr.threads[0].1.accept(Ring::Os);
        router_notify(&mut rtr, lisn(0, 5), true);
        assert_eq!(get_field32(END_W1_ESN, rtr.endt[2].w[1]), 0b11);
        assert_eq!(rtr.threads[0].1.reg(Ring::Os, TM_PIPR), 0xff);
        assert_eq!(rtr.endt[2].qindex(), 2);
    }

    #[test]
    fn test_escalation_chains_to_second_end() {
        let mut rtr = TestRouter::new(1);
        rtr.eat[5] = Eas::new(0, 2, 0);

        // Silent target END that escalates into END 3.
        let mut end = queue_end(0x1_0000, 10, 0x400, 0xff);
        end.w[0] |= END_W0_SILENT_ESCALATE | END_W0_ESCALATE_CTL | END_W0_UNCOND_ESCALATE;
        let esc = Eas::new(0, 3, 0x11);
        end.w[4] = (esc.w >> 32) as u32;
        end.w[5] = esc.w as u32;
        rtr.endt[2] = end;

        rtr.endt[3] = queue_end(0x3_0000, 10, 0x404, 1);
        rtr.nvtt[0x404].w[0] = NVT_W0_VALID;
        rtr.threads[0]
            .1
            .set_word2(Ring::Os, TM_QW1W2_VO | nvt_cam_line(0, 0x404));
        rtr.threads[0].1.set_cppr(Ring::Os, 4);

        router_notify(&mut rtr, lisn(0, 5), true);

        // The escalation event landed in END 3's queue and was
        // presented at the escalation priority.
        assert_eq!(rtr.endt[3].qindex(), 1);
        assert_eq!(rtr.read_queue(0x3_0000, 0), 0x11);
        assert_eq!(rtr.threads[0].1.reg(Ring::Os, TM_PIPR), 1);
    }

    #[test]
    fn test_duplicate_specific_match_is_error() {
        let mut rtr = TestRouter::new(2);
        for t in 0..2 {
            rtr.threads[t]
                .1
                .set_word2(Ring::Os, TM_QW1W2_VO | nvt_cam_line(0, 0x400));
        }
        let spec = NvtMatchSpec {
            format: 0,
            nvt_blk: 0,
            nvt_idx: 0x400,
            crowd: false,
            cam_ignore: false,
            priority: 3,
            logic_serv: 0,
        };
        assert!(matches!(
            rtr.match_nvt(&spec),
            Err(Error::DuplicateMatch(0, 0x400))
        ));
    }

    #[test]
    fn test_disabled_thread_not_matched() {
        let mut rtr = TestRouter::new(1);
        rtr.threads[0]
            .1
            .set_word2(Ring::Os, TM_QW1W2_VO | nvt_cam_line(0, 0x400));
        rtr.threads[0].0 = false;
        let spec = NvtMatchSpec {
            format: 0,
            nvt_blk: 0,
            nvt_idx: 0x400,
            crowd: false,
            cam_ignore: false,
            priority: 3,
            logic_serv: 0,
        };
        assert_eq!(rtr.match_nvt(&spec).unwrap(), MatchOutcome::NotFound);
    }
}
