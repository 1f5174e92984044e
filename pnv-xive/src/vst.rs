// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Virtual Structure Table resolver.
//!
//! The interrupt structures (EAS, END, NVT, ...) live in guest memory,
//! described per (table type, block) by a 64-bit Virtual Structure
//! Descriptor. A VSD points at a direct table, at a two-level indirect
//! table whose first level is an array of per-page VSDs, or forwards
//! the whole block to another chip. The resolver turns a (type, block,
//! index) triple into the physical address of the entry.

use byteorder::{BigEndian, ByteOrder};
use log::warn;
use vm_memory::{Bytes, GuestAddress, GuestAddressSpace};
use xive::field::{get_field64, ppc_bit, ppc_bitmask};
use xive::{GuestMemoryAtomic, GuestMemoryMmap};

pub const VSD_MODE: u64 = ppc_bitmask(0, 1);
pub const VSD_MODE_SHARED: u64 = 1;
pub const VSD_MODE_EXCLUSIVE: u64 = 2;
pub const VSD_MODE_FORWARD: u64 = 3;
pub const VSD_ADDRESS_MASK: u64 = ppc_bitmask(8, 51);
pub const VSD_MIGRATION_REG: u64 = ppc_bitmask(52, 55);
pub const VSD_INDIRECT: u64 = ppc_bit(56);
pub const VSD_TSIZE: u64 = ppc_bitmask(59, 63);

/// Size of a Virtual Structure Descriptor.
pub const VSD_SIZE: u64 = 8;

/// Static description of one table type.
pub struct VstInfo {
    pub name: &'static str,
    /// Size in bytes of one table entry.
    pub size: u32,
    pub max_blocks: u32,
}

/// Indirect page size can be 4K, 64K, 2M or 16M.
pub fn page_size_allowed(page_shift: u32) -> bool {
    page_shift == 12 || page_shift == 16 || page_shift == 21 || page_shift == 24
}

pub fn vsd_mode(vsd: u64) -> u64 {
    get_field64(VSD_MODE, vsd)
}

pub fn vsd_page_shift(vsd: u64) -> u32 {
    get_field64(VSD_TSIZE, vsd) as u32 + 12
}

fn ldq_be(mem: &GuestMemoryMmap, addr: u64) -> Option<u64> {
    let mut bytes = [0u8; 8];
    if mem.read_slice(&mut bytes, GuestAddress(addr)).is_err() {
        warn!("VST: failed to read VSD @0x{:x}", addr);
        return None;
    }
    Some(BigEndian::read_u64(&bytes))
}

/// Lookup hook resolving a forwarded block on a sibling chip: returns
/// the VSD the remote chip holds for (table, block).
pub trait SiblingVsds: Send + Sync {
    fn vsd(&self, table: usize, blk: u8) -> Option<u64>;
}

/// The per-chip bank of VSDs, one row of blocks per table type.
pub struct Vst {
    infos: &'static [VstInfo],
    vsds: Vec<Vec<u64>>,
}

impl Vst {
    pub fn new(infos: &'static [VstInfo]) -> Self {
        Vst {
            vsds: infos
                .iter()
                .map(|info| vec![0; info.max_blocks as usize])
                .collect(),
            infos,
        }
    }

    pub fn info(&self, table: usize) -> &'static VstInfo {
        &self.infos[table]
    }

    pub fn nr_tables(&self) -> usize {
        self.infos.len()
    }

    pub fn vsd(&self, table: usize, blk: u8) -> u64 {
        self.vsds[table][blk as usize]
    }

    pub fn set_vsd(&mut self, table: usize, blk: u8, vsd: u64) {
        self.vsds[table][blk as usize] = vsd;
    }

    /// Raw descriptor state, for serialization.
    pub fn state(&self) -> Vec<Vec<u64>> {
        self.vsds.clone()
    }

    pub fn set_state(&mut self, state: &[Vec<u64>]) {
        if state.len() == self.vsds.len()
            && state.iter().zip(&self.vsds).all(|(a, b)| a.len() == b.len())
        {
            self.vsds = state.to_vec();
        } else {
            warn!("VST: descriptor state mismatch");
        }
    }

    /// Declared size in bytes of a table, reading through the first
    /// descriptor when the table is indirect.
    pub fn declared_size(&self, mem: &GuestMemoryMmap, vsd: u64) -> u64 {
        let vst_tsize = 1u64 << vsd_page_shift(vsd);

        if vsd & VSD_INDIRECT != 0 {
            let nr_pages = vst_tsize / VSD_SIZE;
            let Some(first) = ldq_be(mem, vsd & VSD_ADDRESS_MASK) else {
                return 0;
            };
            let page_shift = vsd_page_shift(first);
            if !page_size_allowed(page_shift) {
                return 0;
            }
            return nr_pages * (1u64 << page_shift);
        }

        vst_tsize
    }

    fn addr_direct(&self, table: usize, vsd: u64, idx: u32) -> Option<u64> {
        let info = self.info(table);
        let vst_addr = vsd & VSD_ADDRESS_MASK;
        let vst_tsize = 1u64 << vsd_page_shift(vsd);

        let idx_max = (vst_tsize / info.size as u64).saturating_sub(1);
        if idx as u64 > idx_max {
            warn!(
                "VST: {} entry {:x} out of range [ 0 .. {:x} ] !?",
                info.name, idx, idx_max
            );
            return None;
        }

        Some(vst_addr + idx as u64 * info.size as u64)
    }

    fn addr_indirect(
        &self,
        mem: &GuestMemoryMmap,
        table: usize,
        vsd: u64,
        idx: u32,
    ) -> Option<u64> {
        let info = self.info(table);

        // Get the page size of the indirect table.
        let mut vsd_addr = vsd & VSD_ADDRESS_MASK;
        let mut vsd = ldq_be(mem, vsd_addr)?;

        if vsd & VSD_ADDRESS_MASK == 0 {
            warn!("VST: invalid {} entry {:x} !?", info.name, idx);
            return None;
        }

        let page_shift = vsd_page_shift(vsd);

        if !page_size_allowed(page_shift) {
            warn!("VST: invalid {} page shift {}", info.name, page_shift);
            return None;
        }

        let vst_per_page = (1u64 << page_shift) / info.size as u64;
        let vsd_idx = idx as u64 / vst_per_page;

        // Load the VSD we are looking for, if not already done.
        if vsd_idx != 0 {
            vsd_addr += vsd_idx * VSD_SIZE;
            vsd = ldq_be(mem, vsd_addr)?;

            if vsd & VSD_ADDRESS_MASK == 0 {
                warn!("VST: invalid {} entry {:x} !?", info.name, idx);
                return None;
            }

            // Check that the pages have a consistent size across the
            // indirect table.
            if page_shift != vsd_page_shift(vsd) {
                warn!(
                    "VST: {} entry {:x} indirect page size differ !?",
                    info.name, idx
                );
                return None;
            }
        }

        self.addr_direct(table, vsd, (idx as u64 % vst_per_page) as u32)
    }

    /// Resolves (table, block, index) into the physical address of the
    /// entry. `siblings` resolves forwarded blocks; without it, the
    /// forward address is treated as a plain one-word indirection.
    pub fn addr(
        &self,
        mem: &GuestMemoryMmap,
        siblings: Option<&dyn SiblingVsds>,
        table: usize,
        blk: u8,
        idx: u32,
    ) -> Option<u64> {
        let info = self.info(table);

        if blk as u32 >= info.max_blocks {
            warn!(
                "VST: invalid block id {} for VST {} {} !?",
                blk, info.name, idx
            );
            return None;
        }

        let mut vsd = self.vsds[table][blk as usize];

        // Remote VST access
        if vsd_mode(vsd) == VSD_MODE_FORWARD {
            vsd = match siblings.and_then(|s| s.vsd(table, blk)) {
                Some(remote) => remote,
                // Multi-chip interconnect is not modeled: the forward
                // address holds the remote descriptor.
                None => ldq_be(mem, vsd & VSD_ADDRESS_MASK)?,
            };

            if vsd_mode(vsd) != VSD_MODE_EXCLUSIVE {
                warn!("VST: {} forward for block {} unresolved", info.name, blk);
                return None;
            }
        }

        if vsd & VSD_INDIRECT != 0 {
            return self.addr_indirect(mem, table, vsd, idx);
        }

        self.addr_direct(table, vsd, idx)
    }

    /// Bounds-checked copy of one entry out of the table.
    pub fn read(
        &self,
        mem: &GuestMemoryAtomic<GuestMemoryMmap>,
        siblings: Option<&dyn SiblingVsds>,
        table: usize,
        blk: u8,
        idx: u32,
        data: &mut [u8],
    ) -> Result<(), ()> {
        let mem = mem.memory();
        let addr = self.addr(&mem, siblings, table, blk, idx).ok_or(())?;

        mem.read_slice(data, GuestAddress(addr)).map_err(|_| {
            warn!(
                "VST: failed to read {} entry {:x}/{:x} @0x{:x}",
                self.info(table).name,
                blk,
                idx,
                addr
            );
        })
    }

    /// Writes one entry, or a single 32-bit word of it when `word` is
    /// given; the on-chip cache watch registers update entries one word
    /// at a time.
    pub fn write(
        &self,
        mem: &GuestMemoryAtomic<GuestMemoryMmap>,
        siblings: Option<&dyn SiblingVsds>,
        table: usize,
        blk: u8,
        idx: u32,
        data: &[u8],
        word: Option<usize>,
    ) -> Result<(), ()> {
        let mem = mem.memory();
        let addr = self.addr(&mem, siblings, table, blk, idx).ok_or(())?;

        let res = match word {
            Some(w) if (w + 1) * 4 <= data.len() => {
                mem.write_slice(&data[w * 4..w * 4 + 4], GuestAddress(addr + w as u64 * 4))
            }
            Some(_) => return Err(()),
            None => mem.write_slice(data, GuestAddress(addr)),
        };

        res.map_err(|_| {
            warn!(
                "VST: failed to write {} entry {:x}/{:x} @0x{:x}",
                self.info(table).name,
                blk,
                idx,
                addr
            );
        })
    }
}
