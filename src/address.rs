//! Block and sector arithmetic for the two MIFARE Classic geometries.
//!
//! A 1K card is 16 sectors of 4 blocks. A 4K card is 32 sectors of 4 blocks
//! (blocks 0..128) followed by 8 sectors of 16 blocks (blocks 128..256). The
//! second region is handled explicitly everywhere; there is no single
//! formula that covers both.

use std::fmt;
use std::str::FromStr;

use crate::error::{MifareError, Result};

/// Bytes per block on every MIFARE Classic card.
pub const BLOCK_SIZE: usize = 16;

/// Sectors in the small-sector region of a 4K card.
const SMALL_SECTORS_4K: u8 = 32;
/// First block of the large-sector region of a 4K card.
const LARGE_REGION_START: u8 = 128;
const SMALL_SECTOR_BLOCKS: u8 = 4;
const LARGE_SECTOR_BLOCKS: u8 = 16;

/// Physical layout of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Geometry {
    #[default]
    Unknown,
    Classic1K,
    Classic4K,
}

impl Geometry {
    pub fn block_count(self) -> u16 {
        match self {
            Geometry::Unknown => 0,
            Geometry::Classic1K => 64,
            Geometry::Classic4K => 256,
        }
    }

    pub fn sector_count(self) -> u8 {
        match self {
            Geometry::Unknown => 0,
            Geometry::Classic1K => 16,
            Geometry::Classic4K => 40,
        }
    }

    /// Card capacity in bytes.
    pub fn total_bytes(self) -> usize {
        self.block_count() as usize * BLOCK_SIZE
    }

    pub fn is_valid_block(self, block: u8) -> bool {
        u16::from(block) < self.block_count()
    }

    pub fn is_valid_sector(self, sector: u8) -> bool {
        sector < self.sector_count()
    }

    fn check_block(self, block: u8) -> Result<()> {
        if self.is_valid_block(block) {
            Ok(())
        } else {
            Err(MifareError::InvalidBlock {
                block,
                geometry: self,
            })
        }
    }

    fn check_sector(self, sector: u8) -> Result<()> {
        if self.is_valid_sector(sector) {
            Ok(())
        } else {
            Err(MifareError::InvalidSector {
                sector,
                geometry: self,
            })
        }
    }

    /// Sector that owns `block`.
    pub fn sector_of(self, block: u8) -> Result<u8> {
        self.check_block(block)?;
        Ok(match self {
            Geometry::Classic4K if block >= LARGE_REGION_START => {
                SMALL_SECTORS_4K + (block - LARGE_REGION_START) / LARGE_SECTOR_BLOCKS
            }
            _ => block / SMALL_SECTOR_BLOCKS,
        })
    }

    /// First (lowest-numbered) block of `sector`.
    pub fn first_block_of(self, sector: u8) -> Result<u8> {
        self.check_sector(sector)?;
        Ok(match self {
            Geometry::Classic4K if sector >= SMALL_SECTORS_4K => {
                LARGE_REGION_START + (sector - SMALL_SECTORS_4K) * LARGE_SECTOR_BLOCKS
            }
            _ => sector * SMALL_SECTOR_BLOCKS,
        })
    }

    /// Number of blocks in `sector`, trailer included.
    pub fn blocks_in_sector(self, sector: u8) -> Result<u8> {
        self.check_sector(sector)?;
        Ok(match self {
            Geometry::Classic4K if sector >= SMALL_SECTORS_4K => LARGE_SECTOR_BLOCKS,
            _ => SMALL_SECTOR_BLOCKS,
        })
    }

    /// Block holding the keys and access bits of `sector`.
    pub fn trailer_block_of(self, sector: u8) -> Result<u8> {
        let first = self.first_block_of(sector)?;
        let len = self.blocks_in_sector(sector)?;
        Ok(first + (len - 1))
    }

    pub fn is_trailer_block(self, block: u8) -> Result<bool> {
        self.check_block(block)?;
        Ok(match self {
            Geometry::Classic4K if block >= LARGE_REGION_START => {
                (block - LARGE_REGION_START + 1) % LARGE_SECTOR_BLOCKS == 0
            }
            _ => (block + 1) % SMALL_SECTOR_BLOCKS == 0,
        })
    }

    /// Every block of `sector`, in ascending order.
    pub fn sector_blocks(self, sector: u8) -> Result<std::ops::RangeInclusive<u8>> {
        let first = self.first_block_of(sector)?;
        Ok(first..=self.trailer_block_of(sector)?)
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Geometry::Unknown => "Unknown",
            Geometry::Classic1K => "MIFARE Classic 1K",
            Geometry::Classic4K => "MIFARE Classic 4K",
        })
    }
}

impl FromStr for Geometry {
    type Err = MifareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1k" | "classic1k" => Ok(Geometry::Classic1K),
            "4k" | "classic4k" => Ok(Geometry::Classic4K),
            other => Err(MifareError::malformed(format!(
                "unknown card geometry \"{}\" (expected 1k or 4k)",
                other
            ))),
        }
    }
}
