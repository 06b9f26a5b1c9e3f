//! On-disk structures and their fixed-slot encoding.
//!
//! Every structure is bincoded (fixed-width little-endian integers) into its
//! slot and padded with zeros: the superblock into block 0, each inode into a
//! 128-byte slot of the inode table. Directory entries are variable length
//! and hand-packed, see [`DirEnt`].

use serde::{Deserialize, Serialize};

use crate::bcache::Block;
use crate::common::*;
use crate::error::{FsError, Result};

#[repr(C)]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SuperBlock {
    /// Must be FSMAGIC
    pub magic: u32,
    /// Must be FSVERSION
    pub version: u32,
    /// Block size in bytes, must be BSIZE
    pub block_size: u32,
    /// Size of the volume (blocks)
    pub block_count: u32,
    /// Number of inode slots in the inode table
    pub inode_count: u32,
    /// Number of blocks occupied by the block bitmap
    pub abm_blocks: u32,
    /// Number of blocks occupied by the inode bitmap
    pub ibm_blocks: u32,
    /// First block of the block bitmap
    pub abm_block: u32,
    /// First block of the inode bitmap
    pub ibm_block: u32,
    /// First block of the inode table
    pub ino_block: u32,
    /// First block of the data region
    pub dat_block: u32,
}

impl SuperBlock {
    /// Number of data blocks, i.e. valid bits in the block bitmap.
    pub fn data_blocks(&self) -> u32 {
        self.block_count - self.dat_block
    }

    /// Inode-table block holding inode `ino`.
    pub fn iblock(&self, ino: u32) -> u32 {
        self.ino_block + ino / IPB as u32
    }

    pub fn encode(&self) -> Result<Box<Block>> {
        let mut blk = Box::new([0u8; BSIZE]);
        let bytes =
            bincode::serialize(self).map_err(|_| FsError::CorruptSuperblock("encode failed"))?;
        blk[..bytes.len()].copy_from_slice(&bytes);
        Ok(blk)
    }

    pub fn decode(blk: &Block) -> Result<Self> {
        bincode::deserialize(&blk[..]).map_err(|_| FsError::CorruptSuperblock("undecodable"))
    }

    /// Sanity-check the layout before anything else trusts it. `max` is the
    /// device size in blocks.
    pub fn check_info(&self, max: u32) -> Result<()> {
        if self.magic != FSMAGIC {
            return Err(FsError::CorruptSuperblock("bad magic"));
        }
        if self.version != FSVERSION {
            return Err(FsError::CorruptSuperblock("bad version"));
        }
        if self.block_size != BSIZE as u32 {
            return Err(FsError::CorruptSuperblock("bad block size"));
        }
        if self.block_count > max {
            return Err(FsError::CorruptSuperblock("block count exceeds device"));
        }
        // regions must be laid out back to back, in order, inside the volume
        if self.abm_block != 1
            || self.ibm_block != self.abm_block + self.abm_blocks
            || self.ino_block != self.ibm_block + self.ibm_blocks
            || self.dat_block < self.ino_block
            || self.dat_block >= self.block_count
        {
            return Err(FsError::CorruptSuperblock("bad region layout"));
        }
        let ino_blocks = self.dat_block - self.ino_block;
        if self.inode_count as usize > ino_blocks as usize * IPB {
            return Err(FsError::CorruptSuperblock("inode table too small"));
        }
        if self.data_blocks() as usize > self.abm_blocks as usize * BPB {
            return Err(FsError::CorruptSuperblock("block bitmap too small"));
        }
        if self.inode_count as usize > self.ibm_blocks as usize * BPB {
            return Err(FsError::CorruptSuperblock("inode bitmap too small"));
        }
        if self.inode_count <= ROOTINO {
            return Err(FsError::CorruptSuperblock("no room for root inode"));
        }
        Ok(())
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FileKind {
    #[default]
    None = 0,
    Directory = 1,
    File = 2,
}

impl FileKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(FileKind::None),
            1 => Some(FileKind::Directory),
            2 => Some(FileKind::File),
            _ => None,
        }
    }
}

/// inode on disk: one fixed 128-byte slot of the inode table, owned
/// exclusively by its inode number.
#[repr(C)]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DInode {
    /// File type, see [`FileKind`]
    pub kind: u32,
    /// Number of directory entries referencing this inode
    pub nlink: u32,
    /// Size of file (bytes)
    pub size: u32,
    /// Blocks addressed by this inode, indirect pointer blocks included
    pub block_count: u32,
    /// Last content change (seconds since epoch)
    pub modify_time: u64,
    /// Last attribute change (seconds since epoch)
    pub change_time: u64,
    /// Direct data block addresses; 0 = hole
    pub dnum: [u32; NDIRECT],
    /// Indirect pointer blocks, each an array of u32 addresses; 0 = unset
    pub inum: [u32; NINDIRECT],
}

impl DInode {
    pub fn new(kind: FileKind, now: u64) -> Self {
        DInode {
            kind: kind as u32,
            modify_time: now,
            change_time: now,
            ..Default::default()
        }
    }

    pub fn file_kind(&self) -> Option<FileKind> {
        FileKind::from_raw(self.kind)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory as u32
    }

    pub fn encode_into(&self, slot: &mut [u8]) -> Result<()> {
        debug_assert_eq!(slot.len(), INODE_SZ);
        let bytes = bincode::serialize(self).map_err(|_| FsError::InvalidArgument)?;
        slot.fill(0);
        slot[..bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    /// An undecodable slot means the table holds an inode of a format we do
    /// not understand; surfaced as `NotSupported`, never silently zeroed.
    pub fn decode(slot: &[u8]) -> Result<Self> {
        debug_assert_eq!(slot.len(), INODE_SZ);
        bincode::deserialize(slot).map_err(|_| FsError::NotSupported)
    }
}

/// Directory entry: `ino: u32, kind: u8, namelen: u8, name bytes`, packed
/// back to back inside a data block, never spanning blocks. `ino == 0`
/// terminates the valid region of a block.
#[derive(Clone, Debug, PartialEq)]
pub struct DirEnt {
    pub ino: u32,
    pub kind: u8,
    pub name: String,
}

pub const DIRENT_HDR: usize = 6;

impl DirEnt {
    pub fn new(ino: u32, kind: FileKind, name: &str) -> Self {
        DirEnt {
            ino,
            kind: kind as u32 as u8,
            name: name.to_string(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        DIRENT_HDR + self.name.len()
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        let name = self.name.as_bytes();
        if name.is_empty() || name.len() > MAXNAMELEN || self.ino == 0 {
            return Err(FsError::InvalidArgument);
        }
        let len = DIRENT_HDR + name.len();
        if buf.len() < len {
            return Err(FsError::InvalidArgument);
        }
        buf[0..4].copy_from_slice(&self.ino.to_le_bytes());
        buf[4] = self.kind;
        buf[5] = name.len() as u8;
        buf[6..len].copy_from_slice(name);
        Ok(len)
    }

    /// Decode the entry at the front of `buf`. `Ok(None)` at the block
    /// terminator or end of block; a malformed entry is `InvalidArgument`.
    pub fn decode(buf: &[u8]) -> Result<Option<(DirEnt, usize)>> {
        if buf.len() < DIRENT_HDR {
            return Ok(None);
        }
        let ino = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if ino == 0 {
            return Ok(None);
        }
        let kind = buf[4];
        let namelen = buf[5] as usize;
        if namelen == 0 || DIRENT_HDR + namelen > buf.len() {
            return Err(FsError::InvalidArgument);
        }
        let name = std::str::from_utf8(&buf[DIRENT_HDR..DIRENT_HDR + namelen])
            .map_err(|_| FsError::InvalidArgument)?
            .to_string();
        Ok(Some((DirEnt { ino, kind, name }, DIRENT_HDR + namelen)))
    }

    /// Walk every entry packed into one directory data block.
    pub fn decode_block(blk: &Block) -> Result<Vec<DirEnt>> {
        let mut out = Vec::new();
        let mut off = 0;
        while let Some((ent, len)) = DirEnt::decode(&blk[off..])? {
            out.push(ent);
            off += len;
        }
        Ok(out)
    }
}

/// Write the initial image of a directory data block: "." then "..". Giving
/// every directory these two entries up front is what spares the rest of the
/// engine from special-casing root.
pub fn dir_init(blk: &mut Block, ino_self: u32, ino_parent: u32) -> Result<()> {
    blk.fill(0);
    let dot = DirEnt::new(ino_self, FileKind::Directory, ".");
    let dotdot = DirEnt::new(ino_parent, FileKind::Directory, "..");
    let n = dot.encode_into(&mut blk[..])?;
    dotdot.encode_into(&mut blk[n..])?;
    Ok(())
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
