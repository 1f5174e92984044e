// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! XIVE interrupt source.
//!
//! An interrupt source owns one Event State Buffer byte per interrupt
//! and exposes them through per-source MMIO pages: loads and stores at
//! encoded offsets trigger the interrupt, EOI it, or manage the P/Q
//! bits directly. The source does not route anything itself; when an
//! operation decides an event must be forwarded it hands a
//! [`Notification`] back to the caller, which owns the router.

use std::result;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_migration::{Migratable, MigratableError, Pausable, Snapshot, Snapshottable};

use crate::esb::{
    pq_eoi, pq_trigger, ESB_GET, ESB_SET_PQ_00, ESB_SET_PQ_11, ESB_STORE_EOI, PQ_OFF, PQ_PENDING,
    PQ_QUEUED, PQ_RESET,
};

/// 4K ESB pages, one page per source.
pub const ESB_4K: u32 = 12;
/// 4K ESB pages, separate trigger and management pages.
pub const ESB_4K_2PAGE: u32 = 13;
/// 64K ESB pages, one page per source.
pub const ESB_64K: u32 = 16;
/// 64K ESB pages, separate trigger and management pages.
pub const ESB_64K_2PAGE: u32 = 17;

/// P/Q bits live in the low two bits of the status byte; the LSI
/// assertion level is tracked next to them.
const STATUS_ASSERTED: u8 = 0x4;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SourceFlags: u64 {
        /// EOI through a store to the management page is supported.
        const STORE_EOI = 1 << 0;
        /// The P/Q state bits of MSIs are offloaded, every trigger is
        /// forwarded unconditionally.
        const PQ_DISABLE = 1 << 1;
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Number of interrupts needs to be greater than 0")]
    NoInterrupts,
    #[error("Invalid ESB shift setting {0}")]
    BadEsbShift(u32),
}

type Result<T> = result::Result<T, Error>;

/// The result of an ESB operation that must be forwarded to the router.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Notification {
    pub srcno: u32,
    /// Whether the source already ran the P/Q coalescing check. When
    /// false the router performs it against its own backing store.
    pub pq_checked: bool,
}

/// A bank of interrupt sources sharing an ESB MMIO window.
pub struct XiveSource {
    id: String,
    nr_irqs: u32,
    esb_shift: u32,
    flags: SourceFlags,
    reset_pq: u8,
    status: Vec<u8>,
    lsi_map: Vec<bool>,
}

#[derive(Serialize, Deserialize)]
pub struct XiveSourceState {
    status: Vec<u8>,
}

impl XiveSource {
    /// By default sources come up with two 64K pages and the P/Q bits
    /// at OFF, which corresponds to "interrupts disabled".
    pub fn new(id: String, nr_irqs: u32, esb_shift: u32, flags: SourceFlags) -> Result<Self> {
        Self::with_reset_pq(id, nr_irqs, esb_shift, flags, PQ_OFF)
    }

    pub fn with_reset_pq(
        id: String,
        nr_irqs: u32,
        esb_shift: u32,
        flags: SourceFlags,
        reset_pq: u8,
    ) -> Result<Self> {
        if nr_irqs == 0 {
            return Err(Error::NoInterrupts);
        }
        if !matches!(esb_shift, ESB_4K | ESB_4K_2PAGE | ESB_64K | ESB_64K_2PAGE) {
            return Err(Error::BadEsbShift(esb_shift));
        }

        Ok(XiveSource {
            id,
            nr_irqs,
            esb_shift,
            flags,
            reset_pq,
            status: vec![reset_pq; nr_irqs as usize],
            lsi_map: vec![false; nr_irqs as usize],
        })
    }

    pub fn nr_irqs(&self) -> u32 {
        self.nr_irqs
    }

    pub fn esb_shift(&self) -> u32 {
        self.esb_shift
    }

    pub fn flags(&self) -> SourceFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: SourceFlags) {
        self.flags = flags;
    }

    /// Total size of the ESB MMIO window.
    pub fn esb_len(&self) -> u64 {
        (1u64 << self.esb_shift) * self.nr_irqs as u64
    }

    pub fn has_2page(&self) -> bool {
        self.esb_shift == ESB_4K_2PAGE || self.esb_shift == ESB_64K_2PAGE
    }

    /// Offset of the management page of `srcno` within the window.
    pub fn esb_mgmt_offset(&self, srcno: u32) -> u64 {
        if self.has_2page() {
            ((srcno as u64) << self.esb_shift) + (1 << (self.esb_shift - 1))
        } else {
            (srcno as u64) << self.esb_shift
        }
    }

    pub fn irq_is_lsi(&self, srcno: u32) -> bool {
        self.lsi_map[srcno as usize]
    }

    pub fn set_irq_lsi(&mut self, srcno: u32) {
        self.lsi_map[srcno as usize] = true;
    }

    pub fn is_asserted(&self, srcno: u32) -> bool {
        self.status[srcno as usize] & STATUS_ASSERTED != 0
    }

    fn set_asserted(&mut self, srcno: u32, asserted: bool) {
        if asserted {
            self.status[srcno as usize] |= STATUS_ASSERTED;
        } else {
            self.status[srcno as usize] &= !STATUS_ASSERTED;
        }
    }

    pub fn esb_get(&self, srcno: u32) -> u8 {
        self.status[srcno as usize] & 0x3
    }

    pub fn esb_set(&mut self, srcno: u32, pq: u8) -> u8 {
        let status = &mut self.status[srcno as usize];
        let old = *status & 0x3;
        *status = (*status & !0x3) | (pq & 0x3);
        old
    }

    /// Sources with PQ offloading skip the coalescing check for MSIs.
    fn esb_disabled(&self, srcno: u32) -> bool {
        self.flags.contains(SourceFlags::PQ_DISABLE) && !self.irq_is_lsi(srcno)
    }

    /// Returns whether the event notification should be forwarded.
    fn lsi_trigger(&mut self, srcno: u32) -> bool {
        let old_pq = self.esb_get(srcno);

        self.set_asserted(srcno, true);

        match old_pq {
            PQ_RESET => {
                self.esb_set(srcno, PQ_PENDING);
                true
            }
            _ => false,
        }
    }

    /// Returns whether the event notification should be forwarded.
    pub fn esb_trigger(&mut self, srcno: u32) -> bool {
        if self.esb_disabled(srcno) {
            return true;
        }

        let status = &mut self.status[srcno as usize];
        let mut pq = *status & 0x3;
        let ret = pq_trigger(&mut pq);
        *status = (*status & !0x3) | pq;

        if self.irq_is_lsi(srcno) && self.esb_get(srcno) == PQ_QUEUED {
            warn!("XIVE: queued an event on LSI IRQ {}", srcno);
        }

        ret
    }

    /// Returns whether a coalesced event should be re-forwarded.
    pub fn esb_eoi(&mut self, srcno: u32) -> bool {
        if self.esb_disabled(srcno) {
            warn!("XIVE: invalid EOI for IRQ {}", srcno);
            return false;
        }

        let status = &mut self.status[srcno as usize];
        let mut pq = *status & 0x3;
        let mut ret = pq_eoi(&mut pq);
        *status = (*status & !0x3) | pq;

        // LSI sources do not queue, but they can still be asserted, in
        // which case a new event notification must be forwarded.
        if self.irq_is_lsi(srcno) && self.is_asserted(srcno) {
            ret = self.lsi_trigger(srcno);
        }

        ret
    }

    fn notification(&self, srcno: u32) -> Notification {
        Notification {
            srcno,
            pq_checked: !self.esb_disabled(srcno),
        }
    }

    /// Input line update, used by devices wired straight to the source.
    pub fn set_irq(&mut self, srcno: u32, level: bool) -> Option<Notification> {
        let notify = if self.irq_is_lsi(srcno) {
            if level {
                self.lsi_trigger(srcno)
            } else {
                self.set_asserted(srcno, false);
                false
            }
        } else {
            level && self.esb_trigger(srcno)
        };

        notify.then(|| self.notification(srcno))
    }

    /// In a two pages ESB MMIO setting, even page is the trigger page,
    /// odd page is for management.
    fn is_trigger_page(&self, addr: u64) -> bool {
        self.has_2page() && (addr >> (self.esb_shift - 1)) & 1 == 0
    }

    /// ESB MMIO load handler. Returns the load result and, for an EOI
    /// that uncovered a coalesced event, the notification to forward.
    pub fn esb_read(&mut self, addr: u64, _size: usize) -> (u64, Option<Notification>) {
        let offset = addr & 0xfff;
        let srcno = (addr >> self.esb_shift) as u32;

        if srcno >= self.nr_irqs {
            warn!("XIVE: invalid ESB load addr 0x{:x}", addr);
            return (u64::MAX, None);
        }

        if self.is_trigger_page(addr) {
            warn!(
                "XIVE: invalid load on IRQ {} trigger page at 0x{:x}",
                srcno, addr
            );
            return (u64::MAX, None);
        }

        match offset {
            o if o < ESB_GET => {
                // Load EOI
                let notify = self.esb_eoi(srcno);
                let ret = notify as u64;
                (ret, notify.then(|| self.notification(srcno)))
            }
            o if o < ESB_SET_PQ_00 => (self.esb_get(srcno) as u64, None),
            o if o <= ESB_SET_PQ_11 + 0xff => {
                let pq = ((offset >> 8) & 0x3) as u8;
                (self.esb_set(srcno, pq) as u64, None)
            }
            _ => {
                warn!("XIVE: invalid ESB load addr 0x{:x}", offset);
                (u64::MAX, None)
            }
        }
    }

    /// ESB MMIO store handler. Returns the notification to forward, if
    /// the store translated into an event.
    pub fn esb_write(&mut self, addr: u64, _value: u64, _size: usize) -> Option<Notification> {
        let offset = addr & 0xfff;
        let srcno = (addr >> self.esb_shift) as u32;

        if srcno >= self.nr_irqs {
            warn!("XIVE: invalid ESB write addr 0x{:x}", addr);
            return None;
        }

        // In a two pages ESB MMIO setting, trigger page only triggers.
        if self.is_trigger_page(addr) {
            return self
                .esb_trigger(srcno)
                .then(|| self.notification(srcno));
        }

        let notify = match offset {
            o if o < ESB_STORE_EOI => self.esb_trigger(srcno),
            o if o < ESB_GET => {
                if !self.flags.contains(SourceFlags::STORE_EOI) {
                    warn!("XIVE: invalid Store EOI for IRQ {}", srcno);
                    return None;
                }
                self.esb_eoi(srcno)
            }
            // Internal offset used to inject triggers when the P/Q
            // state bits are not controlled locally, such as for LSIs
            // under alternate trigger mode.
            o if o < ESB_SET_PQ_00 => true,
            o if o <= ESB_SET_PQ_11 + 0xff => {
                let pq = ((offset >> 8) & 0x3) as u8;
                self.esb_set(srcno, pq);
                false
            }
            _ => {
                warn!("XIVE: invalid ESB write addr 0x{:x}", offset);
                false
            }
        };

        notify.then(|| self.notification(srcno))
    }

    /// Reset does not clear the LSI map, only the P/Q state.
    pub fn reset(&mut self) {
        for status in self.status.iter_mut() {
            *status = self.reset_pq;
        }
    }

    fn state(&self) -> XiveSourceState {
        XiveSourceState {
            status: self.status.clone(),
        }
    }

    fn set_state(&mut self, state: &XiveSourceState) {
        if state.status.len() == self.status.len() {
            self.status.clone_from(&state.status);
        } else {
            warn!(
                "XIVE: source state mismatch: {} IRQs, expected {}",
                state.status.len(),
                self.status.len()
            );
        }
    }
}

impl Pausable for XiveSource {}

impl Snapshottable for XiveSource {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn snapshot(&mut self) -> result::Result<Snapshot, MigratableError> {
        Snapshot::new_from_state(&self.state())
    }

    fn restore(&mut self, snapshot: Snapshot) -> result::Result<(), MigratableError> {
        self.set_state(&snapshot.to_state()?);
        Ok(())
    }
}

impl Migratable for XiveSource {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esb::ESB_LOAD_EOI;

    fn test_source(nr_irqs: u32) -> XiveSource {
        let mut xsrc = XiveSource::new(
            String::from("ipi-source"),
            nr_irqs,
            ESB_64K_2PAGE,
            SourceFlags::empty(),
        )
        .unwrap();
        // Most tests want sources armed rather than disabled.
        for srcno in 0..nr_irqs {
            xsrc.esb_set(srcno, PQ_RESET);
        }
        xsrc
    }

    #[test]
    fn test_new_validation() {
        assert!(matches!(
            XiveSource::new(String::from("s"), 0, ESB_64K, SourceFlags::empty()),
            Err(Error::NoInterrupts)
        ));
        assert!(matches!(
            XiveSource::new(String::from("s"), 1, 14, SourceFlags::empty()),
            Err(Error::BadEsbShift(14))
        ));
    }

    #[test]
    fn test_reset_pq_default_is_off() {
        let xsrc =
            XiveSource::new(String::from("s"), 4, ESB_64K, SourceFlags::empty()).unwrap();
        for srcno in 0..4 {
            assert_eq!(xsrc.esb_get(srcno), PQ_OFF);
        }
    }

    #[test]
    fn test_msi_trigger_sequence() {
        let mut xsrc = test_source(2);

        assert!(xsrc.esb_trigger(0));
        assert_eq!(xsrc.esb_get(0), PQ_PENDING);
        // Coalesced while in flight.
        assert!(!xsrc.esb_trigger(0));
        assert_eq!(xsrc.esb_get(0), PQ_QUEUED);
        // EOI uncovers the queued event.
        assert!(xsrc.esb_eoi(0));
        assert_eq!(xsrc.esb_get(0), PQ_PENDING);
        assert!(!xsrc.esb_eoi(0));
        assert_eq!(xsrc.esb_get(0), PQ_RESET);
    }

    #[test]
    fn test_lsi_retrigger_on_eoi() {
        let mut xsrc = test_source(2);
        xsrc.set_irq_lsi(1);

        let n = xsrc.set_irq(1, true).unwrap();
        assert_eq!(n.srcno, 1);
        assert!(n.pq_checked);
        assert_eq!(xsrc.esb_get(1), PQ_PENDING);

        // EOI with the line still asserted re-triggers.
        assert!(xsrc.esb_eoi(1));
        assert_eq!(xsrc.esb_get(1), PQ_PENDING);

        // Deassert, then EOI goes back to RESET.
        assert!(xsrc.set_irq(1, false).is_none());
        assert!(!xsrc.esb_eoi(1));
        assert_eq!(xsrc.esb_get(1), PQ_RESET);
    }

    #[test]
    fn test_pq_disable_bypasses_state_machine() {
        let mut xsrc = XiveSource::new(
            String::from("s"),
            2,
            ESB_64K_2PAGE,
            SourceFlags::PQ_DISABLE,
        )
        .unwrap();

        // Every trigger notifies, with pq_checked clear so the router
        // runs the check against its own backing store.
        let n = xsrc.set_irq(0, true).unwrap();
        assert!(!n.pq_checked);
        let n = xsrc.set_irq(0, true).unwrap();
        assert!(!n.pq_checked);
    }

    #[test]
    fn test_esb_mmio_get_and_set_pq() {
        let mut xsrc = test_source(4);
        let mgmt = xsrc.esb_mgmt_offset(2);

        let (val, n) = xsrc.esb_read(mgmt + ESB_GET, 8);
        assert_eq!(val, PQ_RESET as u64);
        assert!(n.is_none());

        // SET_PQ_10 forces PENDING, returns the old state.
        let (old, _) = xsrc.esb_read(mgmt + 0xe00, 8);
        assert_eq!(old, PQ_RESET as u64);
        assert_eq!(xsrc.esb_get(2), PQ_PENDING);

        // SET_PQ_01 parks the source OFF.
        let (old, _) = xsrc.esb_read(mgmt + 0xd00, 8);
        assert_eq!(old, PQ_PENDING as u64);
        assert_eq!(xsrc.esb_get(2), PQ_OFF);
    }

    #[test]
    fn test_esb_mmio_trigger_page() {
        let mut xsrc = test_source(4);
        let trigger_page = (3u64) << xsrc.esb_shift();

        let n = xsrc.esb_write(trigger_page, 0, 8).unwrap();
        assert_eq!(n.srcno, 3);
        assert_eq!(xsrc.esb_get(3), PQ_PENDING);

        // Loads on the trigger page are invalid.
        let (val, n) = xsrc.esb_read(trigger_page, 8);
        assert_eq!(val, u64::MAX);
        assert!(n.is_none());
    }

    #[test]
    fn test_esb_mmio_load_eoi() {
        let mut xsrc = test_source(4);
        xsrc.esb_trigger(1);
        xsrc.esb_trigger(1);
        assert_eq!(xsrc.esb_get(1), PQ_QUEUED);

        let mgmt = xsrc.esb_mgmt_offset(1);
        let (val, n) = xsrc.esb_read(mgmt + ESB_LOAD_EOI, 8);
        assert_eq!(val, 1);
        assert_eq!(n.unwrap().srcno, 1);
        assert_eq!(xsrc.esb_get(1), PQ_PENDING);
    }

    #[test]
    fn test_store_eoi_needs_flag() {
        let mut xsrc = test_source(2);
        xsrc.esb_trigger(0);
        xsrc.esb_trigger(0);

        let mgmt = xsrc.esb_mgmt_offset(0);
        assert!(xsrc.esb_write(mgmt + ESB_STORE_EOI, 0, 8).is_none());
        assert_eq!(xsrc.esb_get(0), PQ_QUEUED);

        xsrc.set_flags(SourceFlags::STORE_EOI);
        let n = xsrc.esb_write(mgmt + ESB_STORE_EOI, 0, 8);
        assert!(n.is_some());
        assert_eq!(xsrc.esb_get(0), PQ_PENDING);
    }

    #[test]
    fn test_reset_keeps_lsi_map() {
        let mut xsrc = test_source(2);
        xsrc.set_irq_lsi(0);
        xsrc.esb_trigger(1);

        xsrc.reset();
        assert_eq!(xsrc.esb_get(1), PQ_OFF);
        assert!(xsrc.irq_is_lsi(0));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut xsrc = test_source(4);
        xsrc.esb_trigger(0);
        xsrc.esb_trigger(2);
        xsrc.esb_trigger(2);

        let snapshot = xsrc.snapshot().unwrap();

        let mut other = test_source(4);
        other.restore(snapshot).unwrap();
        assert_eq!(other.esb_get(0), PQ_PENDING);
        assert_eq!(other.esb_get(2), PQ_QUEUED);
        assert_eq!(other.esb_get(3), PQ_RESET);
    }
}
