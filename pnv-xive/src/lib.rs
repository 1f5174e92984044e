// Copyright © 2024 The XIVE Emulation Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! PowerNV chip-level XIVE interrupt controllers.
//!
//! The POWER9 and POWER10 front-ends: chip register files, BAR and
//! table configuration, the Virtual Structure Table resolver giving the
//! routers access to the interrupt structures in guest memory, and the
//! cache watch engines the firmware uses to update them.

pub mod p10;
pub mod p10_regs;
pub mod p9;
pub mod p9_regs;
pub mod vst;

pub use p10::PnvXive2;
pub use p9::PnvXive;
