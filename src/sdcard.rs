//! sd-spi-disk - Card Protocol Driver
//!
//! Drives an SD card in SPI mode: command framing, the initialization state
//! machine, capacity register decoding and single-sector data transfers with
//! token handshaking. Every byte moves through a [`BusController`]
//! acquisition; this module is the only place response bytes and timing are
//! interpreted.

use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx};
use crate::bus::{BusController, BusError, BusGuard, SpiSpeed, FILL_BYTE};
use crate::clock::{Clock, Deadline};
use crate::sdcard_proto::*;

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// How long to poll for the response to a framed command.
const COMMAND_TIMEOUT_MS: u32 = 200;
/// How long to poll for a data-start token or for busy to clear.
const DATA_TIMEOUT_MS: u32 = 500;
/// Overall bound on the operating-condition negotiation loop.
const INIT_TIMEOUT_MS: u32 = 1_000;

/// The possible errors the card driver can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the SPI peripheral
    Transport,
    /// Couldn't set the chip-select pin
    Gpio,
    /// No response to this command within the polling window
    TimeoutCommand(u8),
    /// No response to this application-specific command within the
    /// negotiation window
    TimeoutACommand(u8),
    /// The command was answered with an unexpected status byte
    CommandError(u8, u8),
    /// The data-start token never arrived
    TimeoutDataToken,
    /// An error token arrived while waiting for the data-start token
    UnexpectedToken(u8),
    /// The card never signalled ready while we waited for busy to clear
    TimeoutWaitNotBusy,
    /// The card refused the data we wrote (data response token)
    WriteRejected(u8),
    /// The capacity register decoded to zero sectors
    CapacityDecodeError,
    /// Nothing answered the reset command; no card, or one we can't drive
    CardNotFound,
    /// Can't perform this operation before the card is initialized
    NotInitialized,
    /// The caller's buffer is not a whole number of sectors
    BadBufferLength,
}

impl From<BusError> for Error {
    fn from(e: BusError) -> Error {
        match e {
            BusError::Transport => Error::Transport,
            BusError::Gpio => Error::Gpio,
        }
    }
}

/// The steps of the initialization ladder.
///
/// [`SdCard::initialize`] walks these in order under one bus acquisition;
/// any failure leaves the session uninitialized. `SettingBlockLength` is
/// skipped for sector-addressed cards.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum InitState {
    Resetting,
    NegotiatingVoltage,
    WaitingForReady,
    ReadingOcr,
    SettingBlockLength,
    Ready,
}

/// An SD card behind a shared SPI bus.
///
/// Holds the session state for exactly one card: whether initialization
/// completed, whether the card is sector-addressed, and the decoded sector
/// count. All three are zeroed at construction and populated by
/// [`initialize`](SdCard::initialize); there is no hot-swap detection.
pub struct SdCard<'bus, SPI, CS, D, C>
where
    SPI: Transfer<u8> + SpiSpeed,
    CS: OutputPin,
    D: DelayUs<u8>,
    C: Clock,
{
    bus: &'bus BusController<SPI, CS, D>,
    clock: C,
    initialized: bool,
    high_capacity: bool,
    sector_count: u64,
}

impl<'bus, SPI, CS, D, C> SdCard<'bus, SPI, CS, D, C>
where
    SPI: Transfer<u8> + SpiSpeed,
    CS: OutputPin,
    D: DelayUs<u8>,
    C: Clock,
{
    /// Create a driver for the card on the given bus.
    pub fn new(bus: &'bus BusController<SPI, CS, D>, clock: C) -> Self {
        SdCard {
            bus,
            clock,
            initialized: false,
            high_capacity: false,
            sector_count: 0,
        }
    }

    /// Has [`initialize`](SdCard::initialize) completed successfully?
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Is the card addressed in sectors rather than bytes?
    pub fn is_high_capacity(&self) -> bool {
        self.high_capacity
    }

    /// Total number of 512-byte sectors, zero until initialized.
    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    /// Bring the card from power-on to the ready state.
    ///
    /// Single attempt: the idle-clock preamble, then the command ladder
    /// under one bus acquisition, then the clock switch and the capacity
    /// read under a second acquisition. Already-initialized sessions return
    /// immediately. Any failure surfaces to the caller and leaves the
    /// session uninitialized.
    pub fn initialize(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Ok(());
        }

        self.bus.configure()?;
        self.bus.set_slow_clock();
        self.bus.send_init_clocks()?;

        {
            let mut bus = self.bus.acquire()?;
            let mut state = InitState::Resetting;
            while state != InitState::Ready {
                state = self.advance(&mut bus, state)?;
            }
        }

        self.bus.set_fast_clock();
        self.refresh_sector_count()?;
        self.initialized = true;
        debug!(
            "card ready: high_capacity={} sectors={}",
            self.high_capacity, self.sector_count
        );
        Ok(())
    }

    /// Read `dst.len() / 512` sectors starting at `start_sector`.
    ///
    /// Each sector is its own bus transaction; the first failure aborts the
    /// call and earlier sectors stay read. The buffer must be a nonzero
    /// whole number of sectors.
    pub fn read_sectors(&mut self, start_sector: u32, dst: &mut [u8]) -> Result<(), Error> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        if dst.is_empty() || dst.len() % SECTOR_SIZE != 0 {
            return Err(Error::BadBufferLength);
        }
        for (index, chunk) in dst.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.read_one_block(start_sector + index as u32, chunk)?;
        }
        Ok(())
    }

    /// Write `src.len() / 512` sectors starting at `start_sector`.
    ///
    /// Same per-sector transaction model as [`read_sectors`]: no rollback of
    /// sectors already written when a later one fails.
    ///
    /// [`read_sectors`]: SdCard::read_sectors
    pub fn write_sectors(&mut self, start_sector: u32, src: &[u8]) -> Result<(), Error> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        if src.is_empty() || src.len() % SECTOR_SIZE != 0 {
            return Err(Error::BadBufferLength);
        }
        for (index, chunk) in src.chunks_exact(SECTOR_SIZE).enumerate() {
            self.write_one_block(start_sector + index as u32, chunk)?;
        }
        Ok(())
    }

    /// Read the raw capacity register under its own bus acquisition.
    pub fn read_csd(&mut self) -> Result<Csd, Error> {
        let mut bus = self.bus.acquire()?;
        let status = self.card_command(&mut bus, CMD9, 0)?;
        if status != R1_READY_STATE {
            return Err(Error::CommandError(CMD9, status));
        }
        self.wait_data_token(&mut bus)?;
        let mut data = [0u8; CSD_LEN];
        bus.read_bytes(&mut data)?;
        // Trailing CRC, clocked and discarded.
        bus.receive_byte()?;
        bus.receive_byte()?;
        Ok(Csd::from_bytes(data))
    }

    fn advance(
        &mut self,
        bus: &mut BusGuard<'_, SPI, CS, D>,
        state: InitState,
    ) -> Result<InitState, Error> {
        match state {
            InitState::Resetting => self.step_reset(bus),
            InitState::NegotiatingVoltage => self.step_negotiate_voltage(bus),
            InitState::WaitingForReady => self.step_wait_ready(bus),
            InitState::ReadingOcr => self.step_read_ocr(bus),
            InitState::SettingBlockLength => self.step_set_block_length(bus),
            InitState::Ready => Ok(InitState::Ready),
        }
    }

    fn step_reset(&mut self, bus: &mut BusGuard<'_, SPI, CS, D>) -> Result<InitState, Error> {
        trace!("reset card..");
        let status = self.card_command(bus, CMD0, 0)?;
        if status != R1_IDLE_STATE {
            return Err(Error::CardNotFound);
        }
        Ok(InitState::NegotiatingVoltage)
    }

    fn step_negotiate_voltage(
        &mut self,
        bus: &mut BusGuard<'_, SPI, CS, D>,
    ) -> Result<InitState, Error> {
        let status = self.card_command(bus, CMD8, CMD8_CHECK_PATTERN)?;
        // No idle marker here means no card, or a card too old to support
        // the interface-condition command.
        if status != R1_IDLE_STATE {
            return Err(Error::CardNotFound);
        }
        let mut trailer = [0u8; 4];
        bus.read_bytes(&mut trailer)?;
        trace!("interface condition echo: {:x}", trailer[3]);
        Ok(InitState::WaitingForReady)
    }

    fn step_wait_ready(&mut self, bus: &mut BusGuard<'_, SPI, CS, D>) -> Result<InitState, Error> {
        let deadline = Deadline::after(&self.clock, INIT_TIMEOUT_MS);
        loop {
            let status = self.card_acmd(bus, ACMD41, ACMD41_HIGH_CAPACITY)?;
            if status == R1_READY_STATE {
                return Ok(InitState::ReadingOcr);
            }
            if deadline.expired(&self.clock) {
                return Err(Error::TimeoutACommand(ACMD41));
            }
        }
    }

    fn step_read_ocr(&mut self, bus: &mut BusGuard<'_, SPI, CS, D>) -> Result<InitState, Error> {
        let status = self.card_command(bus, CMD58, 0)?;
        if status != R1_READY_STATE {
            return Err(Error::CommandError(CMD58, status));
        }
        let mut ocr = [0u8; 4];
        bus.read_bytes(&mut ocr)?;
        self.high_capacity = (ocr[0] & OCR_HIGH_CAPACITY) != 0;
        if self.high_capacity {
            Ok(InitState::Ready)
        } else {
            Ok(InitState::SettingBlockLength)
        }
    }

    // Byte-addressed cards may power up with a different block length.
    fn step_set_block_length(
        &mut self,
        bus: &mut BusGuard<'_, SPI, CS, D>,
    ) -> Result<InitState, Error> {
        let status = self.card_command(bus, CMD16, SECTOR_SIZE as u32)?;
        if status != R1_READY_STATE {
            return Err(Error::CommandError(CMD16, status));
        }
        Ok(InitState::Ready)
    }

    fn refresh_sector_count(&mut self) -> Result<(), Error> {
        let csd = self.read_csd()?;
        let sectors = csd.sector_count();
        if sectors == 0 {
            return Err(Error::CapacityDecodeError);
        }
        self.sector_count = sectors;
        Ok(())
    }

    /// Frame and send one command, then poll for the first response byte.
    fn card_command(
        &self,
        bus: &mut BusGuard<'_, SPI, CS, D>,
        command: u8,
        arg: u32,
    ) -> Result<u8, Error> {
        let frame = [
            0x40 | command,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            frame_crc(command),
        ];
        bus.write_bytes(&frame)?;

        let deadline = Deadline::after(&self.clock, COMMAND_TIMEOUT_MS);
        loop {
            let byte = bus.receive_byte()?;
            if byte & R1_ERROR_MASK == 0 {
                trace!("CMD{} arg {:x} -> {:x}", command, arg, byte);
                return Ok(byte);
            }
            if deadline.expired(&self.clock) {
                return Err(Error::TimeoutCommand(command));
            }
        }
    }

    /// Send an application-specific command (CMD55 prefix, then the command).
    fn card_acmd(
        &self,
        bus: &mut BusGuard<'_, SPI, CS, D>,
        command: u8,
        arg: u32,
    ) -> Result<u8, Error> {
        self.card_command(bus, CMD55, 0)?;
        self.card_command(bus, command, arg)
    }

    /// Spin until the card stops holding the line low, or time out.
    fn wait_ready(&self, bus: &mut BusGuard<'_, SPI, CS, D>) -> Result<(), Error> {
        let deadline = Deadline::after(&self.clock, DATA_TIMEOUT_MS);
        loop {
            if bus.receive_byte()? == FILL_BYTE {
                return Ok(());
            }
            if deadline.expired(&self.clock) {
                return Err(Error::TimeoutWaitNotBusy);
            }
        }
    }

    /// Wait for the data-start token. Any other non-idle byte is an error
    /// token and fails immediately.
    fn wait_data_token(&self, bus: &mut BusGuard<'_, SPI, CS, D>) -> Result<(), Error> {
        let deadline = Deadline::after(&self.clock, DATA_TIMEOUT_MS);
        loop {
            let byte = bus.receive_byte()?;
            if byte == DATA_START_BLOCK {
                return Ok(());
            }
            if byte != FILL_BYTE {
                warn!("error token while waiting for data: {:x}", byte);
                return Err(Error::UnexpectedToken(byte));
            }
            if deadline.expired(&self.clock) {
                return Err(Error::TimeoutDataToken);
            }
        }
    }

    /// Convert a sector number into a command argument. Sector-addressed
    /// cards take the sector number; byte-addressed cards take the offset.
    /// Applied on every data command, never cached.
    fn sector_argument(&self, sector: u32) -> u32 {
        if self.high_capacity {
            sector
        } else {
            sector * SECTOR_SIZE as u32
        }
    }

    // Named so it cannot be confused with the trait-provided
    // `BlockDevice::read_block`, which resolves first on `&mut self` calls.
    fn read_one_block(&self, sector: u32, dst: &mut [u8]) -> Result<(), Error> {
        // The guard releases the bus on every exit path, timeouts included.
        let mut bus = self.bus.acquire()?;
        let status = self.card_command(&mut bus, CMD17, self.sector_argument(sector))?;
        if status != R1_READY_STATE {
            return Err(Error::CommandError(CMD17, status));
        }
        self.wait_data_token(&mut bus)?;
        bus.read_bytes(dst)?;
        bus.receive_byte()?;
        bus.receive_byte()?;
        Ok(())
    }

    fn write_one_block(&self, sector: u32, src: &[u8]) -> Result<(), Error> {
        let mut bus = self.bus.acquire()?;
        // The previous write's internal flush may still be in progress.
        self.wait_ready(&mut bus)?;
        let status = self.card_command(&mut bus, CMD24, self.sector_argument(sector))?;
        if status != R1_READY_STATE {
            return Err(Error::CommandError(CMD24, status));
        }
        bus.transfer_byte(DATA_START_BLOCK)?;
        bus.write_bytes(src)?;
        bus.write_bytes(&[PLACEHOLDER_CRC; 2])?;
        let response = bus.receive_byte()?;
        if response & DATA_RES_MASK != DATA_RES_ACCEPTED {
            return Err(Error::WriteRejected(response));
        }
        // Command accepted and data accepted; still wait out the card's own
        // programming time before declaring success.
        self.wait_ready(&mut bus)?;
        Ok(())
    }
}

fn frame_crc(command: u8) -> u8 {
    // Only the two pre-negotiation commands are CRC-checked in SPI mode.
    match command {
        CMD0 => CMD0_CRC,
        CMD8 => CMD8_CRC,
        _ => PLACEHOLDER_CRC,
    }
}

impl<'bus, SPI, CS, D, C> BlockDevice for SdCard<'bus, SPI, CS, D, C>
where
    SPI: Transfer<u8> + SpiSpeed,
    CS: OutputPin,
    D: DelayUs<u8>,
    C: Clock,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        for (index, block) in blocks.iter_mut().enumerate() {
            self.read_sectors(start_block_idx.0 + index as u32, &mut block.contents)?;
        }
        Ok(())
    }

    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        for (index, block) in blocks.iter().enumerate() {
            self.write_sectors(start_block_idx.0 + index as u32, &block.contents)?;
        }
        Ok(())
    }

    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        Ok(BlockCount(self.sector_count as u32))
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
