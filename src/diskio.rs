//! sd-spi-disk - Filesystem-facing disk entry points
//!
//! A stateless translation shim between a generic FAT filesystem port and
//! the card driver: status/initialize/read/write/ioctl keyed by a logical
//! unit number. The driver handle is passed in at construction instead of
//! living in a mutable global, so the adapter can never be called against an
//! unregistered driver.

use core::cell::RefCell;

use crate::bus::SpiSpeed;
use crate::clock::Clock;
use crate::sdcard::{Error, SdCard};
use crate::sdcard_proto::SECTOR_SIZE;

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

#[cfg(feature = "log")]
use log::debug;

#[cfg(feature = "defmt-log")]
use defmt::debug;

/// The single logical unit this adapter serves.
pub const LOGICAL_UNIT: u8 = 0;

/// Erase blocks are reported as one sector; the card handles erasure itself.
pub const ERASE_BLOCK_SIZE: u32 = 1;

bitflags::bitflags! {
    /// Disk status word, in the style of a FAT library's `DSTATUS`.
    /// An empty value means the drive is ready.
    pub struct DiskStatus: u8 {
        /// The drive has not been initialized.
        const NO_INIT = 0x01;
    }
}

impl DiskStatus {
    /// Is the drive initialized and usable?
    pub fn is_ready(self) -> bool {
        self.is_empty()
    }
}

/// Failures of a disk entry point.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiskError {
    /// A bad argument: wrong unit, zero count or a mis-sized buffer. The
    /// bus was never touched.
    Parameter,
    /// The card driver reported a failure.
    Device,
}

impl From<Error> for DiskError {
    fn from(_: Error) -> DiskError {
        DiskError::Device
    }
}

/// Control operations multiplexed through [`SdDisk::ioctl`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlCmd {
    /// Flush pending writes. Always succeeds: every write here is
    /// synchronous.
    Sync,
    /// Query the erase block size, in sectors.
    GetEraseBlockSize,
    /// Query the total sector count.
    GetSectorCount,
}

/// Answers to [`IoctlCmd`]s.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlResponse {
    /// The operation completed with nothing to report.
    Done,
    /// The erase block size, in sectors.
    EraseBlockSize(u32),
    /// The total number of sectors.
    SectorCount(u64),
}

/// The five disk entry points a FAT filesystem port expects, forwarding to
/// one [`SdCard`].
pub struct SdDisk<'card, 'bus, SPI, CS, D, C>
where
    SPI: Transfer<u8> + SpiSpeed,
    CS: OutputPin,
    D: DelayUs<u8>,
    C: Clock,
{
    card: &'card RefCell<SdCard<'bus, SPI, CS, D, C>>,
}

impl<'card, 'bus, SPI, CS, D, C> SdDisk<'card, 'bus, SPI, CS, D, C>
where
    SPI: Transfer<u8> + SpiSpeed,
    CS: OutputPin,
    D: DelayUs<u8>,
    C: Clock,
{
    /// Bind the adapter to its card driver. Done once at startup.
    pub fn new(card: &'card RefCell<SdCard<'bus, SPI, CS, D, C>>) -> Self {
        SdDisk { card }
    }

    /// Current drive status.
    pub fn status(&self, unit: u8) -> DiskStatus {
        if unit != LOGICAL_UNIT {
            return DiskStatus::NO_INIT;
        }
        if self.card.borrow().is_initialized() {
            DiskStatus::empty()
        } else {
            DiskStatus::NO_INIT
        }
    }

    /// Initialize the drive, reporting the resulting status.
    pub fn initialize(&self, unit: u8) -> DiskStatus {
        if unit != LOGICAL_UNIT {
            return DiskStatus::NO_INIT;
        }
        match self.card.borrow_mut().initialize() {
            Ok(()) => DiskStatus::empty(),
            Err(e) => {
                debug!("disk initialize failed: {:?}", e);
                DiskStatus::NO_INIT
            }
        }
    }

    /// Read `count` sectors starting at `start_sector` into `buffer`.
    pub fn read(
        &self,
        unit: u8,
        buffer: &mut [u8],
        start_sector: u32,
        count: u32,
    ) -> Result<(), DiskError> {
        check_args(unit, buffer.len(), count)?;
        self.card
            .borrow_mut()
            .read_sectors(start_sector, buffer)
            .map_err(DiskError::from)
    }

    /// Write `count` sectors starting at `start_sector` from `buffer`.
    pub fn write(
        &self,
        unit: u8,
        buffer: &[u8],
        start_sector: u32,
        count: u32,
    ) -> Result<(), DiskError> {
        check_args(unit, buffer.len(), count)?;
        self.card
            .borrow_mut()
            .write_sectors(start_sector, buffer)
            .map_err(DiskError::from)
    }

    /// Control operations.
    pub fn ioctl(&self, unit: u8, cmd: IoctlCmd) -> Result<IoctlResponse, DiskError> {
        if unit != LOGICAL_UNIT {
            return Err(DiskError::Parameter);
        }
        match cmd {
            IoctlCmd::Sync => Ok(IoctlResponse::Done),
            IoctlCmd::GetEraseBlockSize => Ok(IoctlResponse::EraseBlockSize(ERASE_BLOCK_SIZE)),
            IoctlCmd::GetSectorCount => {
                let sectors = self.card.borrow().sector_count();
                if sectors == 0 {
                    Err(DiskError::Device)
                } else {
                    Ok(IoctlResponse::SectorCount(sectors))
                }
            }
        }
    }
}

fn check_args(unit: u8, buffer_len: usize, count: u32) -> Result<(), DiskError> {
    if unit != LOGICAL_UNIT || count == 0 {
        return Err(DiskError::Parameter);
    }
    if buffer_len != count as usize * SECTOR_SIZE {
        return Err(DiskError::Parameter);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, BusController};

    struct DummySpi;
    struct DummyCs;
    struct DummyDelay;
    struct DummyClock;

    impl Transfer<u8> for DummySpi {
        type Error = ();
        fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], ()> {
            for w in words.iter_mut() {
                *w = 0xFF;
            }
            Ok(words)
        }
    }

    impl SpiSpeed for DummySpi {
        fn set_speed(&mut self, _hz: u32) {}
    }

    impl OutputPin for DummyCs {
        type Error = ();
        fn set_low(&mut self) -> Result<(), ()> {
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), ()> {
            Ok(())
        }
    }

    impl DelayUs<u8> for DummyDelay {
        fn delay_us(&mut self, _us: u8) {}
    }

    impl Clock for DummyClock {
        fn ticks_ms(&self) -> u64 {
            0
        }
    }

    fn with_disk(f: impl FnOnce(&SdDisk<'_, '_, DummySpi, DummyCs, DummyDelay, DummyClock>)) {
        let bus = BusController::new(DummySpi, DummyCs, DummyDelay, BusConfig::default());
        let card = RefCell::new(SdCard::new(&bus, DummyClock));
        f(&SdDisk::new(&card));
    }

    #[test]
    fn wrong_unit_is_rejected_before_the_bus() {
        with_disk(|disk| {
            assert_eq!(disk.status(1), DiskStatus::NO_INIT);
            assert_eq!(disk.initialize(1), DiskStatus::NO_INIT);
            let mut buf = [0u8; 512];
            assert_eq!(disk.read(1, &mut buf, 0, 1), Err(DiskError::Parameter));
            assert_eq!(disk.write(1, &buf, 0, 1), Err(DiskError::Parameter));
            assert_eq!(disk.ioctl(1, IoctlCmd::Sync), Err(DiskError::Parameter));
        });
    }

    #[test]
    fn buffer_and_count_validation() {
        with_disk(|disk| {
            let mut buf = [0u8; 512];
            assert_eq!(disk.read(0, &mut buf, 0, 0), Err(DiskError::Parameter));
            assert_eq!(disk.read(0, &mut buf, 0, 2), Err(DiskError::Parameter));
            assert_eq!(disk.write(0, &buf[..100], 0, 1), Err(DiskError::Parameter));
        });
    }

    #[test]
    fn uninitialized_card_reads_fail_as_device_errors() {
        with_disk(|disk| {
            assert!(!disk.status(0).is_ready());
            let mut buf = [0u8; 512];
            assert_eq!(disk.read(0, &mut buf, 0, 1), Err(DiskError::Device));
        });
    }

    #[test]
    fn ioctl_answers() {
        with_disk(|disk| {
            assert_eq!(disk.ioctl(0, IoctlCmd::Sync), Ok(IoctlResponse::Done));
            assert_eq!(
                disk.ioctl(0, IoctlCmd::GetEraseBlockSize),
                Ok(IoctlResponse::EraseBlockSize(1))
            );
            // No capacity decoded yet: the query fails rather than report 0.
            assert_eq!(
                disk.ioctl(0, IoctlCmd::GetSectorCount),
                Err(DiskError::Device)
            );
        });
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
