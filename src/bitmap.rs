//! Bitmap allocator over one on-disk bitmap region (block map or inode map).
//!
//! The whole region lives in memory for the lifetime of the mount. Bit flips
//! only mark the containing bitmap block dirty; nothing hits the disk until
//! an explicit [`Bitmap::flush`], bounding write amplification.

use crate::bcache::Bcache;
use crate::common::*;
use crate::error::{FsError, Result};

pub struct Bitmap {
    /// full region image, `nblocks * BSIZE` bytes
    bits: Vec<u8>,
    /// valid bits; bits past this are unused and stay zero
    bitcount: u32,
    /// first on-disk block of the region
    start: u32,
    /// region size in blocks
    nblocks: u32,
    /// per-region-block dirty marks
    dirty: Vec<bool>,
}

impl Bitmap {
    pub fn new_zeroed(start: u32, nblocks: u32, bitcount: u32) -> Self {
        Self {
            bits: vec![0u8; nblocks as usize * BSIZE],
            bitcount,
            start,
            nblocks,
            dirty: vec![false; nblocks as usize],
        }
    }

    /// Load the region from disk, whole. Discarded (not written back) unless
    /// flushed.
    pub fn load(bc: &Bcache, start: u32, nblocks: u32, bitcount: u32) -> Result<Self> {
        let mut bm = Self::new_zeroed(start, nblocks, bitcount);
        let mut blk = [0u8; BSIZE];
        for n in 0..nblocks {
            bc.read(start + n, &mut blk)?;
            bm.bits[n as usize * BSIZE..(n as usize + 1) * BSIZE].copy_from_slice(&blk);
        }
        Ok(bm)
    }

    pub fn bitcount(&self) -> u32 {
        self.bitcount
    }

    pub fn get(&self, n: u32) -> bool {
        debug_assert!(n < self.bitcount);
        self.bits[n as usize / 8] & (1 << (n % 8)) != 0
    }

    fn set_bit(&mut self, n: u32) {
        self.bits[n as usize / 8] |= 1 << (n % 8);
        self.dirty[n as usize / BPB] = true;
    }

    fn clear_bit(&mut self, n: u32) {
        self.bits[n as usize / 8] &= !(1 << (n % 8));
        self.dirty[n as usize / BPB] = true;
    }

    /// Scan from `hint` (wrapping) for the first clear bit and claim it.
    /// Callers pass the previously allocated unit to favor locality; no
    /// stronger placement policy is applied.
    pub fn alloc(&mut self, hint: u32) -> Result<u32> {
        if self.bitcount == 0 {
            return Err(FsError::OutOfSpace);
        }
        let hint = hint % self.bitcount;
        for i in 0..self.bitcount {
            let n = (hint + i) % self.bitcount;
            if !self.get(n) {
                self.set_bit(n);
                return Ok(n);
            }
        }
        Err(FsError::OutOfSpace)
    }

    /// Claim a specific unit; used by mkfs and repair. Claiming a unit that
    /// is already taken is a double allocation.
    pub fn reserve(&mut self, n: u32) -> Result<()> {
        if n >= self.bitcount {
            return Err(FsError::InvalidArgument);
        }
        if self.get(n) {
            return Err(FsError::AlreadyInUse);
        }
        self.set_bit(n);
        Ok(())
    }

    /// Release a unit. Freeing a unit that is not allocated is a logic error
    /// in the caller and is reported, not ignored.
    pub fn free(&mut self, n: u32) -> Result<()> {
        if n >= self.bitcount || !self.get(n) {
            return Err(FsError::NotFound);
        }
        self.clear_bit(n);
        Ok(())
    }

    /// Write dirty bitmap blocks back to the region.
    pub fn flush(&mut self, bc: &Bcache) -> Result<()> {
        for n in 0..self.nblocks as usize {
            if !self.dirty[n] {
                continue;
            }
            let mut blk = [0u8; BSIZE];
            blk.copy_from_slice(&self.bits[n * BSIZE..(n + 1) * BSIZE]);
            bc.write(self.start + n as u32, &blk)?;
            self.dirty[n] = false;
        }
        Ok(())
    }

    /// Write the whole region regardless of dirty marks (mkfs, repair).
    pub fn flush_all(&mut self, bc: &Bcache) -> Result<()> {
        for d in self.dirty.iter_mut() {
            *d = true;
        }
        self.flush(bc)
    }
}
