//! Formatter: lay an empty, valid volume onto a raw block device.
//!
//! Not transactional. A write failure partway through leaves the device in an
//! indeterminate, unmountable state; the superblock is written last so a
//! truncated format at least fails validation on the next mount.

use log::info;

use crate::bcache::Bcache;
use crate::bitmap::Bitmap;
use crate::common::*;
use crate::disk::{dir_init, unix_now, DInode, FileKind, SuperBlock};
use crate::error::{FsError, Result};
use crate::vnode::write_slot;

/// Smallest device worth formatting: superblock, one block per bitmap, one
/// inode-table block, one data block for the root directory.
const MIN_BLOCKS: u32 = 8;

/// Format the device: superblock, both bitmaps with the allocator metadata
/// marked used, zeroed inode table, and a root directory whose "." and ".."
/// point at itself.
pub fn mkfs(bc: &Bcache) -> Result<SuperBlock> {
    let block_count = bc.blocks() as u32;
    if block_count < MIN_BLOCKS {
        return Err(FsError::InvalidArgument);
    }

    // inode count is a fixed ratio of the volume size (one inode per four
    // blocks), rounded up to a full inode-table block; not configurable
    let inode_count = (block_count / 4).max(IPB as u32);
    let ino_blocks = inode_count.div_ceil(IPB as u32);
    let inode_count = ino_blocks * IPB as u32;

    let abm_blocks = block_count.div_ceil(BPB as u32);
    let ibm_blocks = inode_count.div_ceil(BPB as u32);
    let abm_block = 1;
    let ibm_block = abm_block + abm_blocks;
    let ino_block = ibm_block + ibm_blocks;
    let dat_block = ino_block + ino_blocks;
    if dat_block >= block_count {
        return Err(FsError::InvalidArgument);
    }

    let info = SuperBlock {
        magic: FSMAGIC,
        version: FSVERSION,
        block_size: BSIZE as u32,
        block_count,
        inode_count,
        abm_blocks,
        ibm_blocks,
        abm_block,
        ibm_block,
        ino_block,
        dat_block,
    };
    info.check_info(block_count)?;
    info!(
        "mkfs: {} blocks, {} inodes, bitmaps at {}+{}/{}+{}, inode table at {}, data at {}",
        block_count, inode_count, abm_block, abm_blocks, ibm_block, ibm_blocks, ino_block, dat_block
    );

    // the device may hold a previous volume; the inode table must start out
    // all slots unallocated
    for bno in ino_block..dat_block {
        bc.zero(bno)?;
    }

    let mut block_map = Bitmap::new_zeroed(abm_block, abm_blocks, info.data_blocks());
    let mut inode_map = Bitmap::new_zeroed(ibm_block, ibm_blocks, inode_count);
    inode_map.reserve(0)?; // inode 0 reserved, never handed out
    inode_map.reserve(ROOTINO)?;
    block_map.reserve(0)?; // data bit 0: the root directory's block

    let mut root = DInode::new(FileKind::Directory, unix_now());
    root.nlink = 2;
    root.size = BSIZE as u32;
    root.block_count = 1;
    root.dnum[0] = dat_block;
    write_slot(bc, &info, ROOTINO, &root)?;

    let mut blk = [0u8; BSIZE];
    dir_init(&mut blk, ROOTINO, ROOTINO)?;
    bc.write(dat_block, &blk)?;

    block_map.flush_all(bc)?;
    inode_map.flush_all(bc)?;
    let sb = info.encode()?;
    bc.write(0, &sb)?;
    Ok(info)
}
