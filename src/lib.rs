//! minfs: a compact block/inode-bitmap filesystem metadata engine.
//!
//! Disk layout:
//! [ super block | block bitmap | inode bitmap | inode table | data blocks ]
//!
//! The engine owns the allocation bitmaps and the vnode cache of one mounted
//! volume. All operations must be invoked from a single serialized execution
//! context; serializing requests is the dispatch layer's job, not ours.

mod bcache;
mod bitmap;
mod blk_dev;
mod common;
mod disk;
mod error;
mod fs;
mod fsck;
mod mkfs;
mod vnode;

pub use bcache::{Bcache, Block};
pub use blk_dev::{BlockDevice, FileDevice, MemDevice};
pub use common::*;
pub use disk::{dir_init, DInode, DirEnt, FileKind, SuperBlock};
pub use error::{FsError, Result};
pub use fs::Minfs;
pub use fsck::{check, CheckReport, Divergence};
pub use mkfs::mkfs;
pub use vnode::{SyncFlags, Vnode, VnodeRef};
