// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Emulation of the XIVE and XIVE2 interrupt virtualization engines
//! found in POWER9 and POWER10 systems.
//!
//! The crate models the routing fabric between interrupt sources and
//! target hardware threads: the per-source Event State Buffers, the
//! Event Notification Descriptors and their guest-visible event queues,
//! the per-thread interrupt management context, and the router tying
//! them together through the Event Assignment Structures. Chip-level
//! configuration front-ends live in separate crates and drive these
//! engines through the router traits.

#[macro_use]
extern crate bitflags;

use thiserror::Error;

pub mod end_source;
pub mod esb;
pub mod field;
pub mod regs;
pub mod regs2;
pub mod router;
pub mod router2;
pub mod source;
pub mod tctx;
pub mod tima;

/// Guest memory, without dirty-bitmap tracking.
pub type GuestMemoryMmap = vm_memory::GuestMemoryMmap<()>;
pub use vm_memory::{GuestAddress, GuestMemoryAtomic};

/// Faults raised while walking the in-memory interrupt structures.
///
/// These are all guest-triggerable: callers log them and complete the
/// current operation with no further effect, they are never fatal to
/// the emulation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("No EAS {0:x}/{1:x}")]
    UnknownEas(u8, u32),
    #[error("No END {0:x}/{1:x}")]
    UnknownEnd(u8, u32),
    #[error("No NVT {0:x}/{1:x}")]
    UnknownNvt(u8, u32),
    #[error("No NVP {0:x}/{1:x}")]
    UnknownNvp(u8, u32),
    #[error("No NVGC {0:x}/{1:x}")]
    UnknownNvgc(u8, u32),
    #[error("Block {0:x} is remote, access must be local")]
    RemoteBlock(u8),
    #[error("Guest memory access at 0x{0:x} failed")]
    GuestMemory(u64),
    #[error("Duplicate thread context match for NVT {0:x}/{1:x}")]
    DuplicateMatch(u8, u32),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Trait for devices that respond to reads or writes in an arbitrary
/// address space. The device does not care where it lives in the
/// address space: each access is given an offset into its window.
#[allow(unused_variables)]
pub trait BusDevice: Send {
    /// Reads at `offset` from this device
    fn read(&mut self, base: u64, offset: u64, data: &mut [u8]) {}
    /// Writes at `offset` into this device
    fn write(&mut self, base: u64, offset: u64, data: &[u8]) {}
}

/// An exception line into a processor thread, raised and lowered by the
/// presenter as interrupts become pending or are accepted.
pub trait InterruptLine: Send + Sync {
    fn set_level(&self, level: bool);
}

/// Line sink for threads that have no exception wiring, e.g. the USER
/// ring which cannot signal.
#[derive(Default)]
pub struct DummyLine;

impl InterruptLine for DummyLine {
    fn set_level(&self, _level: bool) {}
}

bitflags! {
    /// Presenter behaviour toggles surfaced by the chip configuration
    /// registers.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PresenterConfig: u32 {
        /// The OS TIMA page keeps the generation 1 register layout.
        const GEN1_TIMA_OS = 1 << 0;
        /// Thread context save/restore through the NVP is enabled.
        const VP_SAVE_RESTORE = 1 << 1;
        /// Hardwired thread identifiers use the 8-bit range.
        const THREADID_8BITS = 1 << 2;
    }
}
