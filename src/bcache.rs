use std::sync::Arc;

use crate::blk_dev::BlockDevice;
use crate::common::*;
use crate::error::{FsError, Result};

pub type Block = [u8; BSIZE];

/// The block-cache interface the engine needs: read a block, write a block,
/// obtain a zeroed block. Write-through; any write-back policy belongs to the
/// device layer below, not here.
pub struct Bcache {
    dev: Arc<dyn BlockDevice>,
}

impl Bcache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self { dev }
    }

    pub fn blocks(&self) -> usize {
        self.dev.num_blocks()
    }

    pub fn read(&self, bno: u32, buf: &mut Block) -> Result<()> {
        if bno as usize >= self.dev.num_blocks() {
            return Err(FsError::InvalidArgument);
        }
        self.dev.read_block(bno as usize, buf)?;
        Ok(())
    }

    pub fn write(&self, bno: u32, buf: &Block) -> Result<()> {
        if bno as usize >= self.dev.num_blocks() {
            return Err(FsError::InvalidArgument);
        }
        self.dev.write_block(bno as usize, buf)?;
        Ok(())
    }

    /// Zero-fill `bno` on disk and hand back the zeroed image.
    pub fn zero(&self, bno: u32) -> Result<Box<Block>> {
        let blk = Box::new([0u8; BSIZE]);
        self.write(bno, &blk)?;
        Ok(blk)
    }
}
