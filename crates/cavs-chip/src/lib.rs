//! Silicon model for Intel cAVS (1.5 / 1.8 / 2.5) audio DSPs.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the silicon and of the formats the ROM and firmware speak:
//! register offsets, PCI identifiers, the IPC doorbell word, buffer
//! descriptor lists, the extended-manifest firmware header, and the
//! winstream log header.
//!
//! Everything that touches memory lives in `cavs-driver`.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/class codes, device-id → generation table, core masks |
//! | [`regs`] | HD-Audio, stream descriptor and DSP register maps |
//! | [`windows`] | SRAM memory windows inside BAR4, firmware status codes |
//! | [`ipc`] | Doorbell word layout, `PURGE_FW`, host command set |
//! | [`firmware`] | Extended manifest detection and trimming |
//! | [`bdl`] | Buffer descriptor list construction |
//! | [`winstream`] | Log ring header and the pure read plan |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bdl;
pub mod firmware;
pub mod ipc;
pub mod pcie;
pub mod regs;
pub mod windows;
pub mod winstream;

/// Size of a regular page, used for `/proc/self/pagemap` indexing.
pub const PAGE_SIZE: usize = 4096;

/// Size of the huge page backing every DMA buffer (2 MiB).
pub const HUGEPAGE_SIZE: usize = 2 * 1024 * 1024;
