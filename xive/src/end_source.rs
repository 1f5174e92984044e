// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! END ESB MMIO front-end.
//!
//! Each END is assigned an even/odd pair of MMIO pages: the even page
//! manages the ESn notification buffer, the odd page the ESe escalation
//! buffer. Loads use the same encoded offsets as the source ESB pages.
//! Stores are invalid on the first generation; the second generation
//! uses them to trigger the END directly.

use log::warn;

use crate::esb::{
    pq_eoi, pq_set, ESB_GET, ESB_LOAD_EOI, ESB_SET_PQ_00, ESB_SET_PQ_11,
};
use crate::field::{get_field32, set_field32};
use crate::regs::{END_W1_ESE, END_W1_ESN};
use crate::regs2::{Eas2, END2_W1_ESE, END2_W1_ESN};
use crate::router::XiveRouter;
use crate::router2::Xive2Router;
use crate::source::{ESB_4K, ESB_64K};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Number of ENDs needs to be greater than 0")]
    NoEnds,
    #[error("Invalid ESB shift setting {0}")]
    BadEsbShift(u32),
}

/// The ESB pages of the END table of one block.
#[derive(Clone)]
pub struct EndSource {
    nr_ends: u32,
    esb_shift: u32,
}

impl EndSource {
    pub fn new(nr_ends: u32, esb_shift: u32) -> Result<Self, Error> {
        if nr_ends == 0 {
            return Err(Error::NoEnds);
        }
        if esb_shift != ESB_4K && esb_shift != ESB_64K {
            return Err(Error::BadEsbShift(esb_shift));
        }
        Ok(EndSource { nr_ends, esb_shift })
    }

    /// Total size of the END ESB MMIO window.
    pub fn esb_len(&self) -> u64 {
        (1u64 << (self.esb_shift + 1)) * self.nr_ends as u64
    }

    fn decode(&self, addr: u64) -> (u32, bool) {
        // Even page: ESn, odd page: ESe.
        let end_idx = (addr >> (self.esb_shift + 1)) as u32;
        let odd = (addr >> self.esb_shift) & 1 != 0;
        (end_idx, odd)
    }

    /// END ESB load: EOI, GET and SET_PQ operations over the ESn/ESe
    /// bits held in END word 1.
    pub fn read(&self, xrtr: &mut dyn XiveRouter, addr: u64, _size: usize) -> u64 {
        let offset = addr & 0xfff;
        // The block is implied: the window belongs to a single chip.
        let end_blk = xrtr.block_id();
        let (end_idx, odd) = self.decode(addr);

        if end_idx >= self.nr_ends {
            warn!("XIVE: invalid END ESB load addr 0x{:x}", addr);
            return u64::MAX;
        }

        let mut end = match xrtr.get_end(end_blk, end_idx) {
            Ok(end) => end,
            Err(_) => {
                warn!("XIVE: No END {:x}/{:x}", end_blk, end_idx);
                return u64::MAX;
            }
        };

        if !end.is_valid() {
            warn!("XIVE: END {:x}/{:x} is invalid", end_blk, end_idx);
            return u64::MAX;
        }

        let end_esmask = if odd { END_W1_ESE } else { END_W1_ESN };
        let mut pq = get_field32(end_esmask, end.w[1]) as u8;

        let ret = match offset {
            o if (ESB_LOAD_EOI..ESB_GET).contains(&o) => pq_eoi(&mut pq) as u64,
            o if o < ESB_SET_PQ_00 => pq as u64,
            o if o <= ESB_SET_PQ_11 + 0xff => pq_set(&mut pq, ((offset >> 8) & 0x3) as u8) as u64,
            _ => {
                warn!("XIVE: invalid END ESB load addr 0x{:x}", offset);
                return u64::MAX;
            }
        };

        if pq as u32 != get_field32(end_esmask, end.w[1]) {
            end.w[1] = set_field32(end_esmask, end.w[1], pq as u32);
            if let Err(e) = xrtr.write_end(end_blk, end_idx, &end, Some(1)) {
                warn!("XIVE: {}", e);
            }
        }

        ret
    }

    /// END ESB stores are invalid on generation 1 hardware.
    pub fn write(&self, _xrtr: &mut dyn XiveRouter, addr: u64, _value: u64, _size: usize) {
        warn!("XIVE: invalid END ESB write addr 0x{:x}", addr);
    }
}

/// Generation 2 variant: stores on the even page trigger the END.
#[derive(Clone)]
pub struct End2Source {
    nr_ends: u32,
    esb_shift: u32,
}

impl End2Source {
    pub fn new(nr_ends: u32, esb_shift: u32) -> Result<Self, Error> {
        if nr_ends == 0 {
            return Err(Error::NoEnds);
        }
        if esb_shift != ESB_4K && esb_shift != ESB_64K {
            return Err(Error::BadEsbShift(esb_shift));
        }
        Ok(End2Source { nr_ends, esb_shift })
    }

    pub fn esb_len(&self) -> u64 {
        (1u64 << (self.esb_shift + 1)) * self.nr_ends as u64
    }

    pub fn read(&self, xrtr: &mut dyn Xive2Router, addr: u64, _size: usize) -> u64 {
        let offset = addr & 0xfff;
        let end_blk = xrtr.block_id();
        let end_idx = (addr >> (self.esb_shift + 1)) as u32;
        let odd = (addr >> self.esb_shift) & 1 != 0;

        if end_idx >= self.nr_ends {
            warn!("XIVE: invalid END ESB load addr 0x{:x}", addr);
            return u64::MAX;
        }

        let mut end = match xrtr.get_end(end_blk, end_idx) {
            Ok(end) => end,
            Err(_) => {
                warn!("XIVE: No END {:x}/{:x}", end_blk, end_idx);
                return u64::MAX;
            }
        };

        if !end.is_valid() {
            warn!("XIVE: END {:x}/{:x} is invalid", end_blk, end_idx);
            return u64::MAX;
        }

        let end_esmask = if odd { END2_W1_ESE } else { END2_W1_ESN };
        let mut pq = get_field32(end_esmask, end.w[1]) as u8;

        let ret = match offset {
            o if (ESB_LOAD_EOI..ESB_GET).contains(&o) => pq_eoi(&mut pq) as u64,
            o if o < ESB_SET_PQ_00 => pq as u64,
            o if o <= ESB_SET_PQ_11 + 0xff => pq_set(&mut pq, ((offset >> 8) & 0x3) as u8) as u64,
            _ => {
                warn!("XIVE: invalid END ESB load addr 0x{:x}", offset);
                return u64::MAX;
            }
        };

        if pq as u32 != get_field32(end_esmask, end.w[1]) {
            end.w[1] = set_field32(end_esmask, end.w[1], pq as u32);
            if let Err(e) = xrtr.write_end(end_blk, end_idx, &end, Some(1)) {
                warn!("XIVE: {}", e);
            }
        }

        ret
    }

    /// An END trigger: the store data becomes the event data.
    pub fn write(&self, xrtr: &mut dyn Xive2Router, addr: u64, value: u64, _size: usize) {
        let end_blk = xrtr.block_id();
        let end_idx = (addr >> (self.esb_shift + 1)) as u32;

        if end_idx >= self.nr_ends {
            warn!("XIVE: invalid END ESB write addr 0x{:x}", addr);
            return;
        }

        let eas = Eas2::new(end_blk, end_idx, (value & 0x7fff_ffff) as u32);
        xrtr.end_notify(&eas);
    }
}
