use core::ops::{Deref, DerefMut};

/// One 512-byte sector's worth of data.
#[derive(Clone)]
pub struct Block {
    /// The raw sector contents.
    pub contents: [u8; Block::LEN],
}

impl Block {
    /// All transfers move whole sectors of this size.
    pub const LEN: usize = 512;

    /// Create a zeroed block.
    pub fn new() -> Block {
        Block {
            contents: [0u8; Block::LEN],
        }
    }
}

impl Default for Block {
    fn default() -> Block {
        Block::new()
    }
}

impl Deref for Block {
    type Target = [u8; Block::LEN];
    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.contents
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(fmt, "Block(len={})", self.contents.len())
    }
}

/// The zero-based index of a block on a device.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockIdx(pub u32);

impl BlockIdx {
    /// The byte offset at which this block starts.
    pub fn into_bytes(self) -> u64 {
        u64::from(self.0) * Block::LEN as u64
    }
}

/// A number of blocks.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockCount(pub u32);

impl core::ops::Add<BlockCount> for BlockIdx {
    type Output = BlockIdx;
    fn add(self, rhs: BlockCount) -> BlockIdx {
        BlockIdx(self.0 + rhs.0)
    }
}
