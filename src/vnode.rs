//! In-memory vnodes and the fixed-bucket vnode cache.
//!
//! One vnode wraps exactly one inode number plus a cached copy of its on-disk
//! inode. The cache is the single source of truth: at most one live vnode
//! exists per inode number, and all access routes through it.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use log::warn;

use crate::bcache::Bcache;
use crate::bitmap::Bitmap;
use crate::common::*;
use crate::disk::{unix_now, DInode, FileKind, SuperBlock};
use crate::error::{FsError, Result};

bitflags! {
    /// Which timestamp fields a flush updates. Content changes carry MTIME,
    /// attribute changes carry CTIME, neither for a plain writeback.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SyncFlags: u32 {
        const MTIME = 1 << 0;
        const CTIME = 1 << 1;
    }
}

pub struct Vnode {
    ino: u32,
    /// active holders; maintained by get/release, not by Arc
    refcnt: u32,
    dirty: bool,
    /// timestamp updates owed at the next flush
    pending: SyncFlags,
    /// cached copy of the on-disk inode
    pub inode: DInode,
}

pub type VnodeRef = Arc<Mutex<Vnode>>;

impl Vnode {
    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flag the cached inode as diverged from its slot; `flags` pick which
    /// timestamps the next flush stamps.
    pub fn mark_dirty(&mut self, flags: SyncFlags) {
        self.dirty = true;
        self.pending |= flags;
    }
}

fn fnv1a(ino: u32) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in ino.to_le_bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// bucket index: fnv1a of the ino truncated to HASH_BITS
fn ino_hash(ino: u32) -> usize {
    (fnv1a(ino) & (NBUCKETS as u32 - 1)) as usize
}

/// Fixed-bucket hash table mapping inode number -> live vnode. The ino is
/// kept beside the handle so lookups need not take the vnode lock.
pub struct VnodeCache {
    buckets: Vec<Vec<(u32, VnodeRef)>>,
}

impl VnodeCache {
    pub fn new() -> Self {
        Self {
            buckets: (0..NBUCKETS).map(|_| Vec::new()).collect(),
        }
    }

    fn find(&self, ino: u32) -> Option<VnodeRef> {
        self.buckets[ino_hash(ino)]
            .iter()
            .find(|(n, _)| *n == ino)
            .map(|(_, vn)| vn.clone())
    }

    pub fn contains(&self, ino: u32) -> bool {
        self.find(ino).is_some()
    }

    fn insert(&mut self, ino: u32, inode: DInode) -> VnodeRef {
        let vn = Arc::new(Mutex::new(Vnode {
            ino,
            refcnt: 1,
            dirty: false,
            pending: SyncFlags::empty(),
            inode,
        }));
        self.buckets[ino_hash(ino)].push((ino, vn.clone()));
        vn
    }

    /// Return the live vnode for `ino`, bumping its reference count, or read
    /// the inode slot and materialize one. The inode must be allocated.
    pub fn get_or_load(
        &mut self,
        bc: &Bcache,
        info: &SuperBlock,
        inode_map: &Bitmap,
        ino: u32,
    ) -> Result<VnodeRef> {
        if ino == 0 || ino >= info.inode_count || !inode_map.get(ino) {
            return Err(FsError::NotFound);
        }
        if let Some(vn) = self.find(ino) {
            vn.lock().unwrap().refcnt += 1;
            return Ok(vn);
        }
        let inode = read_slot(bc, info, ino)?;
        Ok(self.insert(ino, inode))
    }

    /// Materialize a vnode over a freshly allocated inode, zero-initializing
    /// the on-disk slot with `kind` set. The allocator has already claimed
    /// `ino`; the slot must not be live in the cache.
    pub fn create_new(
        &mut self,
        bc: &Bcache,
        info: &SuperBlock,
        ino: u32,
        kind: FileKind,
    ) -> Result<VnodeRef> {
        if self.contains(ino) {
            return Err(FsError::AlreadyInUse);
        }
        let inode = DInode::new(kind, unix_now());
        write_slot(bc, info, ino, &inode)?;
        Ok(self.insert(ino, inode))
    }

    /// Drop one reference. At zero the vnode is flushed if dirty, unlinked
    /// from its bucket, and freed.
    pub fn release(&mut self, bc: &Bcache, info: &SuperBlock, vn: &VnodeRef) -> Result<()> {
        let ino;
        {
            let mut guard = vn.lock().unwrap();
            if guard.refcnt == 0 {
                return Err(FsError::InvalidArgument);
            }
            guard.refcnt -= 1;
            if guard.refcnt > 0 {
                return Ok(());
            }
            if guard.dirty {
                flush_locked(bc, info, &mut guard)?;
            }
            ino = guard.ino;
        }
        self.buckets[ino_hash(ino)].retain(|(n, _)| *n != ino);
        Ok(())
    }

    /// Flush every dirty cached vnode; used by instance-wide sync and
    /// unmount. Vnodes stay cached.
    pub fn flush_all(&mut self, bc: &Bcache, info: &SuperBlock) -> Result<()> {
        for bucket in &self.buckets {
            for (_, vn) in bucket {
                let mut guard = vn.lock().unwrap();
                if guard.dirty {
                    flush_locked(bc, info, &mut guard)?;
                }
            }
        }
        Ok(())
    }

    /// Live vnodes still held by callers; unmount warns about these.
    pub fn live_count(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }
}

pub(crate) fn read_slot(bc: &Bcache, info: &SuperBlock, ino: u32) -> Result<DInode> {
    let mut blk = [0u8; BSIZE];
    bc.read(info.iblock(ino), &mut blk)?;
    let off = (ino as usize % IPB) * INODE_SZ;
    DInode::decode(&blk[off..off + INODE_SZ])
}

pub(crate) fn write_slot(bc: &Bcache, info: &SuperBlock, ino: u32, inode: &DInode) -> Result<()> {
    let mut blk = [0u8; BSIZE];
    let bno = info.iblock(ino);
    bc.read(bno, &mut blk)?;
    let off = (ino as usize % IPB) * INODE_SZ;
    inode.encode_into(&mut blk[off..off + INODE_SZ])?;
    bc.write(bno, &blk)
}

fn flush_locked(bc: &Bcache, info: &SuperBlock, vn: &mut Vnode) -> Result<()> {
    let now = unix_now();
    if vn.pending.contains(SyncFlags::MTIME) {
        vn.inode.modify_time = now;
    }
    if vn.pending.contains(SyncFlags::CTIME) {
        vn.inode.change_time = now;
    }
    write_slot(bc, info, vn.ino, &vn.inode)?;
    vn.dirty = false;
    vn.pending = SyncFlags::empty();
    Ok(())
}

/// Write the vnode's cached inode to its slot now, stamping timestamps per
/// `flags` on top of whatever updates were already pending.
pub fn sync_vnode(bc: &Bcache, info: &SuperBlock, vn: &VnodeRef, flags: SyncFlags) -> Result<()> {
    let mut guard = vn.lock().unwrap();
    guard.pending |= flags;
    if let Err(e) = flush_locked(bc, info, &mut guard) {
        warn!("vnode {} flush failed: {}", guard.ino, e);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_index_is_stable_and_in_range() {
        for ino in 0..10_000u32 {
            let h = ino_hash(ino);
            assert!(h < NBUCKETS);
            assert_eq!(h, ino_hash(ino));
        }
    }

    #[test]
    fn hash_spreads_sequential_inos() {
        use std::collections::HashSet;
        let used: HashSet<usize> = (1..256u32).map(ino_hash).collect();
        // fnv1a over sequential keys should touch a good share of buckets
        assert!(used.len() > NBUCKETS / 2);
    }
}
