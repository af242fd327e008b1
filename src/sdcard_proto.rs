//! sd-spi-disk - Constants from the SD Specifications
//!
//! Command indices, response markers, token bytes and the two capacity
//! register layouts used by the card protocol driver. Only the fields the
//! driver actually interprets are defined; everything is expressed as named
//! byte/bit offsets rather than overlapping structure layouts.

/// GO_IDLE_STATE - reset the card into SPI mode if CS is low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify the card's interface operating condition
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data register
pub const CMD9: u8 = 0x09;
/// SET_BLOCKLEN - select the block length for following transfers
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// APP_CMD - escape prefix for application-specific commands
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the operating conditions register
pub const CMD58: u8 = 0x3A;
/// SD_SEND_OP_COND - negotiate operating conditions, start initialization
pub const ACMD41: u8 = 0x29;

/// Status for a card in the ready state
pub const R1_READY_STATE: u8 = 0x00;
/// Status for a card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// A response byte has arrived once the high bit is clear
pub const R1_ERROR_MASK: u8 = 0x80;

/// Start token for a single-block read or write
pub const DATA_START_BLOCK: u8 = 0xFE;
/// Mask for the data response token after a block write
pub const DATA_RES_MASK: u8 = 0x1F;
/// Data response pattern meaning the write data was accepted
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// Card capacity status bit in the first OCR byte of the CMD58 response
pub const OCR_HIGH_CAPACITY: u8 = 0x40;

/// Host capacity support bit in the ACMD41 argument
pub const ACMD41_HIGH_CAPACITY: u32 = 0x4000_0000;
/// Voltage range and check pattern sent with CMD8
pub const CMD8_CHECK_PATTERN: u32 = 0x0000_01AA;

/// Valid CRC for CMD0 with argument zero
pub const CMD0_CRC: u8 = 0x95;
/// Valid CRC for CMD8 with the standard check pattern
pub const CMD8_CRC: u8 = 0x87;
/// Placeholder CRC accepted by cards in SPI mode for every other command
pub const PLACEHOLDER_CRC: u8 = 0xFF;

/// Every data transaction moves exactly one 512-byte sector
pub const SECTOR_SIZE: usize = 512;
/// The capacity register is a fixed 16-byte block
pub const CSD_LEN: usize = 16;

/// Card Specific Data, version 1 (byte-addressed cards)
#[derive(Default)]
pub struct CsdV1 {
    /// The 16 raw bytes of the register
    pub data: [u8; CSD_LEN],
}

impl CsdV1 {
    fn data(&self) -> &[u8; CSD_LEN] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(permanent_write_protection, bool, 14, 5);
    define_field!(temporary_write_protection, bool, 14, 4);

    /// Usable card capacity in bytes.
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }
}

/// Card Specific Data, version 2 (sector-addressed cards)
#[derive(Default)]
pub struct CsdV2 {
    /// The 16 raw bytes of the register
    pub data: [u8; CSD_LEN],
}

impl CsdV2 {
    fn data(&self) -> &[u8; CSD_LEN] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(permanent_write_protection, bool, 14, 5);
    define_field!(temporary_write_protection, bool, 14, 4);

    /// Usable card capacity in bytes.
    pub fn card_capacity_bytes(&self) -> u64 {
        self.card_capacity_sectors() * u64::from(SECTOR_SIZE as u32)
    }

    fn card_capacity_sectors(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 1024
    }
}

/// Card Specific Data, either layout.
pub enum Csd {
    /// A version 1 register
    V1(CsdV1),
    /// A version 2 register
    V2(CsdV2),
}

impl Csd {
    /// Pick the layout from the version field (bits 7:6 of byte 0) and wrap
    /// the raw register. Version 1 in that field means the high-capacity
    /// layout; anything else is decoded as the legacy layout.
    pub fn from_bytes(data: [u8; CSD_LEN]) -> Csd {
        let version = (data[0] >> 6) & 0x03;
        if version == 1 {
            Csd::V2(CsdV2 { data })
        } else {
            Csd::V1(CsdV1 { data })
        }
    }

    /// Total number of 512-byte sectors the card holds.
    ///
    /// Zero means the register did not decode to a usable capacity; the
    /// caller decides what to do about it.
    pub fn sector_count(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_bytes() / SECTOR_SIZE as u64,
            Csd::V2(csd) => csd.card_capacity_sectors(),
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
