/// root i-number; inode 0 is reserved and never allocated
pub const ROOTINO: u32 = 1;

pub const FSMAGIC: u32 = 0x6e4d_4653;

pub const FSVERSION: u32 = 1;

/// block size
pub const BSIZE: usize = 1024;

/// direct block pointers in an inode
pub const NDIRECT: usize = 16;

/// indirect pointer blocks in an inode
pub const NINDIRECT: usize = 4;

/// block pointers per indirect block
pub const PTRS_PER_BLOCK: usize = BSIZE / size_of::<u32>();

/// max # of blocks a single file can address
pub const MAXFILE: usize = NDIRECT + NINDIRECT * PTRS_PER_BLOCK;

/// on-disk inode slot size
pub const INODE_SZ: usize = 128;

/// inodes per inode-table block
pub const IPB: usize = BSIZE / INODE_SZ;

/// bitmap bits per block
pub const BPB: usize = BSIZE * 8;

/// vnode hash table: 2^8 buckets, bucket picked by fnv1a of the ino
pub const HASH_BITS: u32 = 8;
pub const NBUCKETS: usize = 1 << HASH_BITS;

/// directory entry name limit (namelen is one byte on disk)
pub const MAXNAMELEN: usize = 255;
