//! Block device view of a [`Flash`].
//!
//! Blocks are flash sectors. Writes avoid erasing whenever the new data can be
//! programmed over what is already stored.

use crate::transport::Transport;
use crate::{Error, Flash, Result, PAGE_SIZE};

/// Value of an erased byte.
const ERASED: u8 = 0xFF;

/// How `write_blocks` stored its data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WritePath {
    /// The data was all 0xFF, so the sectors were only erased.
    Erased,
    /// Only new data was programmed, without an erase; `pages` pages were programmed.
    Programmed { pages: usize },
    /// Some stored bit had to return to 1, so the sectors were erased and fully rewritten.
    Rewritten,
}

/// Sector-addressed block device on top of a [`Flash`].
///
/// Each write reads back the target sectors before deciding how to store the data, so
/// callers must not write the same blocks from several threads at once.
pub struct BlockDevice<T: Transport> {
    flash: Flash<T>,
    open: bool,
}

impl<T: Transport> BlockDevice<T> {
    pub fn new(flash: Flash<T>) -> Self {
        BlockDevice { flash, open: false }
    }

    /// Initialize the flash device. Does nothing if already open.
    pub fn open(&mut self) -> Result<()> {
        if !self.open {
            self.flash.initialize()?;
            self.open = true;
        }
        Ok(())
    }

    /// Return the flash device to its default state.
    pub fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.flash.uninitialize()?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Block size in bytes; one flash sector.
    pub fn block_size(&self) -> usize {
        self.flash.sector_size()
    }

    pub fn block_count(&self) -> usize {
        self.flash.sector_count()
    }

    /// Writes complete before `write_blocks` returns, so there is nothing to flush.
    pub fn sync(&self) -> Result<()> {
        Ok(())
    }

    pub fn flash(&self) -> &Flash<T> {
        &self.flash
    }

    pub fn into_inner(self) -> Flash<T> {
        self.flash
    }

    /// Read `count` blocks starting at `block`.
    pub fn read_blocks(&self, block: u32, count: usize) -> Result<Vec<u8>> {
        let length = self.blocks_length(count)?;
        self.flash.read_sector(block, length)
    }

    /// Write `data` to `count` blocks starting at `block`.
    ///
    /// `data` must be exactly `count` blocks long.
    pub fn write_blocks(&self, block: u32, count: usize, data: &[u8]) -> Result<WritePath> {
        let length = self.blocks_length(count)?;
        if data.len() != length {
            log::error!("Block write of {} bytes for {} blocks", data.len(), count);
            return Err(Error::InvalidLength { expected: length, actual: data.len() });
        }
        let last = block as u64 + count as u64;
        if last > self.block_count() as u64 {
            return Err(Error::InvalidAddress {
                address: (last * self.block_size() as u64).min(u32::MAX as u64) as u32,
            });
        }
        if count == 0 {
            return Ok(WritePath::Programmed { pages: 0 });
        }
        let address = block * self.block_size() as u32;

        if data.iter().all(|&b| b == ERASED) {
            log::debug!("Blocks {}+{} written with erased data, erasing only", block, count);
            self.erase_blocks(block, count)?;
            return Ok(WritePath::Erased);
        }

        // Decide for every page before programming anything.
        let current = self.flash.read(address, length)?;
        let mut pages = Vec::new();
        for (idx, (new, old)) in data.chunks(PAGE_SIZE).zip(current.chunks(PAGE_SIZE)).enumerate() {
            if new == old {
                continue;
            }
            if new.iter().zip(old).any(|(n, o)| n != o && *o != ERASED) {
                log::debug!("Page {} of blocks {}+{} needs an erase, rewriting",
                            idx, block, count);
                self.erase_blocks(block, count)?;
                self.flash.write(address, data)?;
                return Ok(WritePath::Rewritten);
            }
            pages.push(idx);
        }

        log::debug!("Programming {} changed pages of blocks {}+{} without erase",
                    pages.len(), block, count);
        for &idx in pages.iter() {
            let offset = idx * PAGE_SIZE;
            let end = usize::min(offset + PAGE_SIZE, length);
            self.flash.write(address + offset as u32, &data[offset..end])?;
        }
        Ok(WritePath::Programmed { pages: pages.len() })
    }

    fn blocks_length(&self, count: usize) -> Result<usize> {
        let block_size = self.block_size();
        if block_size == 0 {
            return Err(Error::NotInitialized);
        }
        count.checked_mul(block_size).ok_or(Error::InvalidLength { expected: 0, actual: count })
    }

    /// Erase exactly the target sectors.
    fn erase_blocks(&self, block: u32, count: usize) -> Result<()> {
        for sector in block..block + count as u32 {
            self.flash.erase_sector(sector)?;
        }
        Ok(())
    }
}
