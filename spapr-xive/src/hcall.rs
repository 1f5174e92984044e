// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! XIVE exploitation mode hypercalls.
//!
//! The guest drives the controller through a small set of operations:
//! query a source, bind it to a (target, priority) pair, hand over the
//! event queue pages, and access the ESBs when it cannot map them. Each
//! operation first checks that exploitation mode has been negotiated
//! and validates its parameters in order, reporting the offending one.

use log::warn;
use thiserror::Error;
use xive::field::{get_field32, get_field64, set_field32, set_field64};
use xive::regs::{
    Eas, End, EAS_END_BLOCK, EAS_END_DATA, EAS_END_INDEX, EAS_MASKED, EAS_VALID, END_W0_ENQUEUE,
    END_W0_QSIZE, END_W0_UCOND_NOTIFY, END_W0_VALID, END_W1_GENERATION, END_W1_PAGE_OFF,
    PRIORITY_MAX,
};
use xive::source::ESB_64K;

use crate::{SpaprXive, SPAPR_XIVE_BLOCK_ID};

/// Failure codes of the hypercall surface. Success is the `Ok` arm of
/// the operation result.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HcallError {
    /// XIVE exploitation mode is not available.
    #[error("Function not available")]
    FunctionNotAvailable,
    /// Parameter `n` of the operation is invalid.
    #[error("Invalid parameter {0}")]
    Parameter(u8),
    /// The operation failed in the hardware.
    #[error("Hardware error")]
    Hardware,
}

pub type HcallResult<T> = std::result::Result<T, HcallError>;

bitflags! {
    /// Flags of the source configuration operation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SourceConfigFlags: u64 {
        /// The EISN parameter carries the event data to enqueue.
        const SET_EISN = 1 << 0;
    }
}

bitflags! {
    /// Flags of the queue configuration operation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct QueueFlags: u64 {
        /// Notify the target on every event, do not coalesce at the
        /// END level.
        const ALWAYS_NOTIFY = 1 << 0;
    }
}

/// Source characteristics returned to the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    pub lsi: bool,
    pub store_eoi: bool,
    /// Offset of the management page in the source ESB window.
    pub esb_page: u64,
    /// Offset of the trigger page.
    pub trigger_page: u64,
    pub esb_shift: u32,
}

/// Queue characteristics returned to the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    pub qpage: u64,
    /// log2 of the queue size in bytes, 0 when the queue is disabled.
    pub qsize: u64,
    pub qindex: u32,
    pub qgen: u32,
    pub always_notify: bool,
}

/// The architected event queue sizes, log2 of bytes.
fn queue_size_valid(qsize: u64) -> bool {
    matches!(qsize, 12 | 16 | 21 | 24)
}

/// Priority 7 is reserved to the hypervisor for escalations.
fn priority_reserved(priority: u8) -> bool {
    priority > PRIORITY_MAX - 1
}

impl SpaprXive {
    fn check_enabled(&self) -> HcallResult<()> {
        if !self.enabled {
            return Err(HcallError::FunctionNotAvailable);
        }
        Ok(())
    }

    fn check_lisn(&mut self, lisn: u32) -> HcallResult<Eas> {
        use xive::router::XiveRouter;
        let eas = self
            .get_eas(SPAPR_XIVE_BLOCK_ID, lisn)
            .map_err(|_| HcallError::Parameter(2))?;
        if !eas.is_valid() {
            return Err(HcallError::Parameter(2));
        }
        Ok(eas)
    }

    /// Returns the ESB characteristics of an interrupt source.
    pub fn h_int_get_source_info(&mut self, _flags: u64, lisn: u32) -> HcallResult<SourceInfo> {
        self.check_enabled()?;
        self.check_lisn(lisn)?;

        let esb_shift = self.source().esb_shift();
        let esb_page = self.source().esb_mgmt_offset(lisn);
        Ok(SourceInfo {
            lsi: self.source().irq_is_lsi(lisn),
            store_eoi: self
                .source()
                .flags()
                .contains(xive::source::SourceFlags::STORE_EOI),
            esb_page,
            trigger_page: (lisn as u64) << esb_shift,
            esb_shift,
        })
    }

    /// Binds a source to a (target, priority) pair. A priority of 0xff
    /// masks the source without forgetting its routing.
    pub fn h_int_set_source_config(
        &mut self,
        flags: SourceConfigFlags,
        lisn: u32,
        target: u32,
        priority: u8,
        eisn: u32,
    ) -> HcallResult<()> {
        self.check_enabled()?;
        let old = self.check_lisn(lisn)?;

        if priority == 0xff {
            // Masking: only the EAS mask bit changes.
            self.eat[lisn as usize].w |= EAS_MASKED;
            return Ok(());
        }

        if target >= self.nr_servers {
            return Err(HcallError::Parameter(3));
        }
        if priority_reserved(priority) {
            warn!(
                "XIVE: priority {} is reserved for the hypervisor",
                priority
            );
            return Err(HcallError::Parameter(4));
        }

        let end_idx = Self::end_index(target, priority);
        let data = if flags.contains(SourceConfigFlags::SET_EISN) {
            eisn as u64
        } else {
            get_field64(EAS_END_DATA, old.w)
        };

        let mut w = EAS_VALID;
        w = set_field64(EAS_END_BLOCK, w, SPAPR_XIVE_BLOCK_ID as u64);
        w = set_field64(EAS_END_INDEX, w, end_idx as u64);
        w = set_field64(EAS_END_DATA, w, data);
        self.eat[lisn as usize].w = w;

        Ok(())
    }

    /// Returns the (target, priority, eisn) binding of a source.
    pub fn h_int_get_source_config(
        &mut self,
        _flags: u64,
        lisn: u32,
    ) -> HcallResult<(u32, u8, u32)> {
        self.check_enabled()?;
        let eas = self.check_lisn(lisn)?;

        let end_idx = eas.end_index();
        let target = end_idx / 8;
        let priority = (end_idx % 8) as u8;
        Ok((target, priority, eas.end_data()))
    }

    /// Returns the END ESB address of a (target, priority) pair.
    pub fn h_int_get_queue_info(
        &mut self,
        _flags: u64,
        target: u32,
        priority: u8,
    ) -> HcallResult<(u64, u64)> {
        self.check_enabled()?;

        if target >= self.nr_servers {
            return Err(HcallError::Parameter(2));
        }
        if priority_reserved(priority) {
            return Err(HcallError::Parameter(3));
        }

        let end_idx = Self::end_index(target, priority);
        // Each END is assigned an even/odd pair of ESB pages.
        let mmio_offset = (end_idx as u64) << (ESB_64K + 1);
        let end = &self.endt[end_idx as usize];
        let qsize = if end.is_enqueue() {
            get_field32(END_W0_QSIZE, end.w[0]) as u64 + 12
        } else {
            0
        };
        Ok((mmio_offset, qsize))
    }

    /// Hands over (or takes back, with a zero size) the event queue
    /// pages of a (target, priority) pair.
    pub fn h_int_set_queue_config(
        &mut self,
        flags: QueueFlags,
        target: u32,
        priority: u8,
        qpage: u64,
        qsize: u64,
    ) -> HcallResult<()> {
        self.check_enabled()?;

        if target >= self.nr_servers {
            return Err(HcallError::Parameter(2));
        }
        if priority_reserved(priority) {
            return Err(HcallError::Parameter(3));
        }

        let end_idx = Self::end_index(target, priority);
        let mut end = End::default();

        match qsize {
            0 => {
                // Unconfigured: the END stays valid but silent.
            }
            s if queue_size_valid(s) => {
                if qpage & ((1 << s) - 1) != 0 {
                    warn!("XIVE: EQ @0x{:x} misaligned", qpage);
                    return Err(HcallError::Parameter(5));
                }
                end.w[0] |= END_W0_ENQUEUE;
                end.w[0] = set_field32(END_W0_QSIZE, end.w[0], (s - 12) as u32);
                end.w[2] = (qpage >> 32) as u32;
                end.w[3] = qpage as u32;
            }
            _ => {
                warn!("XIVE: invalid EQ size {}", qsize);
                return Err(HcallError::Parameter(4));
            }
        }

        end.w[0] |= END_W0_VALID;
        if flags.contains(QueueFlags::ALWAYS_NOTIFY) {
            end.w[0] |= END_W0_UCOND_NOTIFY;
        }

        // The guest-visible queue state starts over: index 0,
        // generation 1.
        end.w[1] = set_field32(END_W1_GENERATION, 0, 1);
        end.w[1] = set_field32(END_W1_PAGE_OFF, end.w[1], 0);

        // Target the vCPU's NVT.
        end.w[6] = set_field32(
            xive::regs::END_W6_NVT_INDEX,
            0,
            crate::SPAPR_XIVE_NVT_BASE + target,
        );
        end.w[7] = set_field32(xive::regs::END_W7_F0_PRIORITY, 0, priority as u32);

        self.endt[end_idx as usize] = end;
        Ok(())
    }

    /// Returns the queue configuration of a (target, priority) pair.
    pub fn h_int_get_queue_config(
        &mut self,
        _flags: u64,
        target: u32,
        priority: u8,
    ) -> HcallResult<QueueConfig> {
        self.check_enabled()?;

        if target >= self.nr_servers {
            return Err(HcallError::Parameter(2));
        }
        if priority_reserved(priority) {
            return Err(HcallError::Parameter(3));
        }

        let end = self.endt[Self::end_index(target, priority) as usize];
        Ok(QueueConfig {
            qpage: end.qaddr(),
            qsize: if end.is_enqueue() {
                get_field32(END_W0_QSIZE, end.w[0]) as u64 + 12
            } else {
                0
            },
            qindex: end.qindex(),
            qgen: end.qgen(),
            always_notify: end.is_notify(),
        })
    }

    /// ESB access on behalf of a guest that cannot map the ESB pages.
    pub fn h_int_esb(
        &mut self,
        lisn: u32,
        offset: u64,
        data: u64,
        store: bool,
    ) -> HcallResult<u64> {
        self.check_enabled()?;
        self.check_lisn(lisn)?;

        if offset > 0xfff {
            return Err(HcallError::Parameter(3));
        }

        let addr = self.source.esb_mgmt_offset(lisn) + offset;
        if store {
            self.esb_write(addr, data, 8);
            Ok(u64::MAX)
        } else {
            Ok(self.esb_read(addr, 8))
        }
    }

    /// Orders the completion of in-flight events of a source.
    ///
    /// Everything is synchronous in this model, so the operation only
    /// validates its parameters.
    pub fn h_int_sync(&mut self, _flags: u64, lisn: u32) -> HcallResult<()> {
        self.check_enabled()?;
        self.check_lisn(lisn)?;
        Ok(())
    }

    /// Resets the controller: EAS bindings, ENDs and ESB states.
    pub fn h_int_reset(&mut self, _flags: u64) -> HcallResult<()> {
        self.check_enabled()?;

        let claimed: Vec<bool> = self.eat.iter().map(|eas| eas.w != 0).collect();
        self.reset();

        // Claimed interrupts come back valid and masked.
        for (eas, claimed) in self.eat.iter_mut().zip(claimed) {
            if claimed {
                eas.w = EAS_VALID | EAS_MASKED;
            }
        }
        Ok(())
    }
}
