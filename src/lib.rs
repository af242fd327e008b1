//! # sd-spi-disk
//!
//! > An SPI SD card block device driver for Embedded Rust
//!
//! This crate turns a raw SPI peripheral and a chip-select pin into a block
//! device an embedded FAT library can mount: a bus controller that
//! arbitrates the shared wires, a card protocol driver that speaks the
//! SD-over-SPI command set, and a thin set of disk entry points in the shape
//! a FAT port expects. It is `#![no_std]`, uses no `alloc`, and is designed
//! for readability over performance.
//!
//! ## Using the crate
//!
//! Hand the bus controller your HAL's SPI peripheral (implementing
//! `embedded_hal::blocking::spi::Transfer<u8>` plus this crate's
//! [`SpiSpeed`] for baud-rate switching), the chip-select `OutputPin`, a
//! microsecond delay and a millisecond [`Clock`]:
//!
//! ```rust,ignore
//! use sd_spi_disk::{BusConfig, BusController, SdCard};
//!
//! let bus = BusController::new(spi, cs, delay, BusConfig::default());
//! let mut card = SdCard::new(&bus, clock);
//! card.initialize()?;
//! let mut sector = [0u8; 512];
//! card.read_sectors(0, &mut sector)?;
//! ```
//!
//! For a FAT library port, wrap the card in [`diskio::SdDisk`] to get the
//! classic status/initialize/read/write/ioctl entry points.
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over
//!   defmt instead.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is
//! enabled.

#![cfg_attr(not(test), no_std)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[macro_use]
mod structure;

pub mod block_device;
pub mod bus;
pub mod clock;
pub mod diskio;
pub mod sdcard;
pub mod sdcard_proto;

pub use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice};
pub use crate::bus::{BusConfig, BusController, BusError, BusGuard, SpiSpeed};
pub use crate::clock::{Clock, Deadline};
pub use crate::sdcard::Error as SdCardError;
pub use crate::sdcard::SdCard;
pub use crate::sdcard_proto::Csd;

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
