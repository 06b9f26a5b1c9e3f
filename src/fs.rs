//! The Filesystem Instance: owns the validated layout, both allocation
//! bitmaps, and the vnode cache of one mounted volume.
//!
//! One instance per mounted volume, created by [`Minfs::mount`] and consumed
//! by [`Minfs::unmount`]. The engine does no internal locking; the dispatch
//! layer above serializes every call.

use log::{debug, info, warn};

use crate::bcache::{Bcache, Block};
use crate::bitmap::Bitmap;
use crate::common::*;
use crate::disk::{dir_init, DInode, DirEnt, FileKind, SuperBlock};
use crate::error::{FsError, Result};
use crate::vnode::{self, read_slot, write_slot, SyncFlags, VnodeCache, VnodeRef};

pub struct Minfs {
    bc: Bcache,
    info: SuperBlock,
    block_map: Bitmap,
    inode_map: Bitmap,
    vcache: VnodeCache,
    root: VnodeRef,
    /// last allocated data block / inode, fed back as the scan hint
    blk_hint: u32,
    ino_hint: u32,
}

impl Minfs {
    /// Validate the superblock, load both bitmaps whole, and materialize the
    /// root directory vnode.
    pub fn mount(bc: Bcache) -> Result<Minfs> {
        let mut blk = [0u8; BSIZE];
        bc.read(0, &mut blk)?;
        let info = SuperBlock::decode(&blk)?;
        info.check_info(bc.blocks() as u32)?;

        let block_map = Bitmap::load(&bc, info.abm_block, info.abm_blocks, info.data_blocks())?;
        let inode_map = Bitmap::load(&bc, info.ibm_block, info.ibm_blocks, info.inode_count)?;

        let mut vcache = VnodeCache::new();
        let root = vcache.get_or_load(&bc, &info, &inode_map, ROOTINO)?;
        info!(
            "mounted: {} blocks ({} data), {} inodes",
            info.block_count,
            info.data_blocks(),
            info.inode_count
        );
        Ok(Minfs {
            bc,
            info,
            block_map,
            inode_map,
            vcache,
            root,
            blk_hint: 0,
            ino_hint: ROOTINO,
        })
    }

    /// Flush dirty vnodes and bitmap blocks, release the root reference,
    /// discard in-memory state. Consumes the instance; preventing use after
    /// unmount is the dispatcher's job and comes for free from ownership.
    pub fn unmount(self) -> Result<()> {
        let Minfs {
            bc,
            info,
            mut block_map,
            mut inode_map,
            mut vcache,
            root,
            ..
        } = self;
        vcache.release(&bc, &info, &root)?;
        drop(root);
        vcache.flush_all(&bc, &info)?;
        let live = vcache.live_count();
        if live > 0 {
            warn!("unmount with {live} vnodes still referenced");
        }
        block_map.flush(&bc)?;
        inode_map.flush(&bc)?;
        info!("unmounted");
        Ok(())
    }

    pub fn info(&self) -> &SuperBlock {
        &self.info
    }

    /// The root directory vnode; the mount holds its own reference, callers
    /// who keep the handle must take their own via [`Minfs::vnode_get`].
    pub fn root(&self) -> VnodeRef {
        self.root.clone()
    }

    // ── vnode operations ────────────────────────────────────────────────

    pub fn vnode_get(&mut self, ino: u32) -> Result<VnodeRef> {
        self.vcache
            .get_or_load(&self.bc, &self.info, &self.inode_map, ino)
    }

    /// Allocate a fresh inode of `kind` and return its vnode.
    pub fn vnode_new(&mut self, kind: FileKind) -> Result<VnodeRef> {
        if kind == FileKind::None {
            return Err(FsError::InvalidArgument);
        }
        let ino = self.inode_map.alloc(self.ino_hint)?;
        self.ino_hint = ino;
        debug!("vnode_new: ino {ino} ({kind:?})");
        self.vcache.create_new(&self.bc, &self.info, ino, kind)
    }

    /// Drop one reference; at zero the vnode is flushed and evicted.
    pub fn vnode_put(&mut self, vn: &VnodeRef) -> Result<()> {
        self.vcache.release(&self.bc, &self.info, vn)
    }

    /// Write the vnode's inode to its slot now, stamping timestamps per
    /// `flags`.
    pub fn sync_vnode(&self, vn: &VnodeRef, flags: SyncFlags) -> Result<()> {
        vnode::sync_vnode(&self.bc, &self.info, vn, flags)
    }

    pub fn mark_dirty(&self, vn: &VnodeRef, flags: SyncFlags) {
        vn.lock().unwrap().mark_dirty(flags);
    }

    // ── block allocation ────────────────────────────────────────────────

    /// Allocate a data block and zero-fill it on disk. The only sanctioned
    /// way to obtain a writable data block: the allocator alone does not
    /// zero, and stale content must never cross file boundaries.
    pub fn new_block(&mut self, hint: u32) -> Result<(u32, Box<Block>)> {
        let bit = self.block_map.alloc(hint.saturating_sub(self.info.dat_block))?;
        let bno = self.info.dat_block + bit;
        let blk = self.bc.zero(bno)?;
        self.blk_hint = bno;
        Ok((bno, blk))
    }

    pub fn free_block(&mut self, bno: u32) -> Result<()> {
        if bno < self.info.dat_block || bno >= self.info.block_count {
            return Err(FsError::InvalidArgument);
        }
        self.block_map.free(bno - self.info.dat_block)
    }

    /// Whether a data block is currently marked allocated.
    pub fn block_allocated(&self, bno: u32) -> bool {
        bno >= self.info.dat_block
            && bno < self.info.block_count
            && self.block_map.get(bno - self.info.dat_block)
    }

    /// Free every data block the inode references, the indirect pointer
    /// blocks themselves, then the inode bit. Best-effort: an individual
    /// failure is reported and counted, not allowed to abort the rest.
    /// Returns the number of blocks actually freed.
    pub fn free_inode_and_blocks(&mut self, ino: u32) -> Result<u32> {
        if ino == 0 || ino >= self.info.inode_count || !self.inode_map.get(ino) {
            return Err(FsError::NotFound);
        }
        if self.vcache.contains(ino) {
            return Err(FsError::AlreadyInUse);
        }
        let inode = read_slot(&self.bc, &self.info, ino)?;
        let mut freed = 0u32;
        let mut failed = 0u32;
        for &bno in inode.dnum.iter().filter(|&&b| b != 0) {
            self.reclaim_block(ino, bno, &mut freed, &mut failed);
        }
        for &ib in inode.inum.iter().filter(|&&b| b != 0) {
            let mut blk = [0u8; BSIZE];
            match self.bc.read(ib, &mut blk) {
                Ok(()) => {
                    for e in blk.chunks_exact(4) {
                        let bno = u32::from_le_bytes([e[0], e[1], e[2], e[3]]);
                        if bno != 0 {
                            self.reclaim_block(ino, bno, &mut freed, &mut failed);
                        }
                    }
                }
                Err(e) => {
                    warn!("ino {ino}: reading indirect block {ib} failed: {e}");
                    failed += 1;
                }
            }
            self.reclaim_block(ino, ib, &mut freed, &mut failed);
        }
        write_slot(&self.bc, &self.info, ino, &DInode::default())?;
        self.inode_map.free(ino)?;
        if failed > 0 {
            warn!("ino {ino}: freed {freed} blocks, {failed} failures");
        } else {
            debug!("ino {ino}: freed {freed} blocks");
        }
        Ok(freed)
    }

    fn reclaim_block(&mut self, ino: u32, bno: u32, freed: &mut u32, failed: &mut u32) {
        match self.free_block(bno) {
            Ok(()) => *freed += 1,
            Err(e) => {
                warn!("ino {ino}: freeing block {bno} failed: {e}");
                *failed += 1;
            }
        }
    }

    /// Flush dirty bitmap blocks and every dirty cached vnode.
    pub fn sync(&mut self) -> Result<()> {
        self.vcache.flush_all(&self.bc, &self.info)?;
        self.block_map.flush(&self.bc)?;
        self.inode_map.flush(&self.bc)?;
        Ok(())
    }

    // ── data plumbing ───────────────────────────────────────────────────

    /// Map a logical block of `vn` to its absolute block number, allocating
    /// (zeroed) data and indirect pointer blocks on the way when `alloc`.
    /// Returns 0 for a hole when not allocating.
    pub fn vn_block(&mut self, vn: &VnodeRef, lbn: u32, alloc: bool) -> Result<u32> {
        if lbn as usize >= MAXFILE {
            return Err(FsError::InvalidArgument);
        }
        let hint = self.blk_hint;
        if (lbn as usize) < NDIRECT {
            let cur = vn.lock().unwrap().inode.dnum[lbn as usize];
            if cur != 0 || !alloc {
                return Ok(cur);
            }
            let (bno, _) = self.new_block(hint)?;
            let mut guard = vn.lock().unwrap();
            guard.inode.dnum[lbn as usize] = bno;
            guard.inode.block_count += 1;
            guard.mark_dirty(SyncFlags::MTIME);
            return Ok(bno);
        }
        let idx = lbn as usize - NDIRECT;
        let which = idx / PTRS_PER_BLOCK;
        let off = (idx % PTRS_PER_BLOCK) * 4;
        let mut ib = vn.lock().unwrap().inode.inum[which];
        if ib == 0 {
            if !alloc {
                return Ok(0);
            }
            let (bno, _) = self.new_block(hint)?;
            let mut guard = vn.lock().unwrap();
            guard.inode.inum[which] = bno;
            guard.inode.block_count += 1;
            guard.mark_dirty(SyncFlags::MTIME);
            ib = bno;
        }
        let mut blk = [0u8; BSIZE];
        self.bc.read(ib, &mut blk)?;
        let cur = u32::from_le_bytes([blk[off], blk[off + 1], blk[off + 2], blk[off + 3]]);
        if cur != 0 || !alloc {
            return Ok(cur);
        }
        let (bno, _) = self.new_block(ib)?;
        blk[off..off + 4].copy_from_slice(&bno.to_le_bytes());
        self.bc.write(ib, &blk)?;
        let mut guard = vn.lock().unwrap();
        guard.inode.block_count += 1;
        guard.mark_dirty(SyncFlags::MTIME);
        Ok(bno)
    }

    /// Read up to `buf.len()` bytes at `off`, clamped to the file size.
    /// Holes read as zeros.
    pub fn read_data(&mut self, vn: &VnodeRef, off: u32, buf: &mut [u8]) -> Result<usize> {
        let size = vn.lock().unwrap().inode.size;
        if off >= size {
            return Ok(0);
        }
        let n = buf.len().min((size - off) as usize);
        let mut done = 0;
        while done < n {
            let pos = off as usize + done;
            let lbn = (pos / BSIZE) as u32;
            let boff = pos % BSIZE;
            let cnt = (BSIZE - boff).min(n - done);
            let bno = self.vn_block(vn, lbn, false)?;
            if bno == 0 {
                buf[done..done + cnt].fill(0);
            } else {
                let mut blk = [0u8; BSIZE];
                self.bc.read(bno, &mut blk)?;
                buf[done..done + cnt].copy_from_slice(&blk[boff..boff + cnt]);
            }
            done += cnt;
        }
        Ok(n)
    }

    /// Write `data` at `off`, growing the file (and its size) as needed.
    pub fn write_data(&mut self, vn: &VnodeRef, off: u32, data: &[u8]) -> Result<()> {
        let end = off as usize + data.len();
        if end > MAXFILE * BSIZE {
            return Err(FsError::InvalidArgument);
        }
        let mut done = 0;
        while done < data.len() {
            let pos = off as usize + done;
            let lbn = (pos / BSIZE) as u32;
            let boff = pos % BSIZE;
            let cnt = (BSIZE - boff).min(data.len() - done);
            let bno = self.vn_block(vn, lbn, true)?;
            let mut blk = [0u8; BSIZE];
            if cnt < BSIZE {
                self.bc.read(bno, &mut blk)?;
            }
            blk[boff..boff + cnt].copy_from_slice(&data[done..done + cnt]);
            self.bc.write(bno, &blk)?;
            done += cnt;
        }
        let mut guard = vn.lock().unwrap();
        if end as u32 > guard.inode.size {
            guard.inode.size = end as u32;
        }
        guard.mark_dirty(SyncFlags::MTIME);
        Ok(())
    }

    // ── directories ─────────────────────────────────────────────────────

    /// Every entry of a directory, "." and ".." included.
    pub fn dir_entries(&mut self, dir: &VnodeRef) -> Result<Vec<DirEnt>> {
        let (size, is_dir) = {
            let guard = dir.lock().unwrap();
            (guard.inode.size, guard.inode.is_dir())
        };
        if !is_dir {
            return Err(FsError::NotSupported);
        }
        let mut out = Vec::new();
        for lbn in 0..(size as usize / BSIZE) as u32 {
            let bno = self.vn_block(dir, lbn, false)?;
            if bno == 0 {
                continue;
            }
            let mut blk = [0u8; BSIZE];
            self.bc.read(bno, &mut blk)?;
            out.extend(DirEnt::decode_block(&blk)?);
        }
        Ok(out)
    }

    pub fn lookup(&mut self, dir: &VnodeRef, name: &str) -> Result<DirEnt> {
        self.dir_entries(dir)?
            .into_iter()
            .find(|e| e.name == name)
            .ok_or(FsError::NotFound)
    }

    /// Append an entry into the first block with room, growing the directory
    /// by one block if none has any. Entries never span blocks.
    fn dir_append(&mut self, dir: &VnodeRef, ent: &DirEnt) -> Result<()> {
        let len = ent.encoded_len();
        let nblocks = dir.lock().unwrap().inode.size as usize / BSIZE;
        for lbn in 0..nblocks as u32 {
            let bno = self.vn_block(dir, lbn, false)?;
            if bno == 0 {
                continue;
            }
            let mut blk = [0u8; BSIZE];
            self.bc.read(bno, &mut blk)?;
            let mut off = 0;
            while let Some((_, l)) = DirEnt::decode(&blk[off..])? {
                off += l;
            }
            if BSIZE - off >= len {
                ent.encode_into(&mut blk[off..])?;
                self.bc.write(bno, &blk)?;
                self.sync_vnode(dir, SyncFlags::MTIME)?;
                return Ok(());
            }
        }
        let bno = self.vn_block(dir, nblocks as u32, true)?;
        let mut blk = [0u8; BSIZE];
        ent.encode_into(&mut blk[..])?;
        self.bc.write(bno, &blk)?;
        dir.lock().unwrap().inode.size += BSIZE as u32;
        self.sync_vnode(dir, SyncFlags::MTIME)
    }

    /// Create a file or directory under `parent`. A new directory gets its
    /// own data block with "." and ".." before it becomes visible in the
    /// parent.
    pub fn create(&mut self, parent: &VnodeRef, name: &str, kind: FileKind) -> Result<VnodeRef> {
        if name.is_empty() || name.len() > MAXNAMELEN || name == "." || name == ".." {
            return Err(FsError::InvalidArgument);
        }
        if !parent.lock().unwrap().inode.is_dir() {
            return Err(FsError::NotSupported);
        }
        match self.lookup(parent, name) {
            Ok(_) => return Err(FsError::AlreadyInUse),
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
        let vn = self.vnode_new(kind)?;
        let ino = vn.lock().unwrap().ino();
        match kind {
            FileKind::Directory => {
                let parent_ino = parent.lock().unwrap().ino();
                let hint = self.blk_hint;
                let (bno, mut blk) = self.new_block(hint)?;
                dir_init(&mut blk, ino, parent_ino)?;
                self.bc.write(bno, &blk)?;
                {
                    let mut guard = vn.lock().unwrap();
                    guard.inode.dnum[0] = bno;
                    guard.inode.size = BSIZE as u32;
                    guard.inode.block_count = 1;
                    guard.inode.nlink = 2; // "." plus the parent's entry
                }
                let mut guard = parent.lock().unwrap();
                guard.inode.nlink += 1; // the child's ".."
                guard.mark_dirty(SyncFlags::CTIME);
            }
            FileKind::File => {
                vn.lock().unwrap().inode.nlink = 1;
            }
            FileKind::None => unreachable!("rejected by vnode_new"),
        }
        self.sync_vnode(&vn, SyncFlags::CTIME)?;
        self.dir_append(parent, &DirEnt::new(ino, kind, name))?;
        Ok(vn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blk_dev::MemDevice;
    use crate::mkfs::mkfs;
    use std::sync::Arc;

    fn fresh_fs() -> Minfs {
        let bc = Bcache::new(Arc::new(MemDevice::new(1000)));
        mkfs(&bc).unwrap();
        Minfs::mount(bc).unwrap()
    }

    #[test]
    fn vn_block_reports_holes_and_allocates_on_demand() {
        let mut fs = fresh_fs();
        let root = fs.root();
        let vn = fs.create(&root, "f", FileKind::File).unwrap();
        assert_eq!(fs.vn_block(&vn, 3, false).unwrap(), 0);
        let bno = fs.vn_block(&vn, 3, true).unwrap();
        assert!(bno >= fs.info().dat_block);
        assert_eq!(fs.vn_block(&vn, 3, false).unwrap(), bno);
        // indirect range
        let far = (NDIRECT + PTRS_PER_BLOCK + 5) as u32;
        assert_eq!(fs.vn_block(&vn, far, false).unwrap(), 0);
        let bno = fs.vn_block(&vn, far, true).unwrap();
        assert_eq!(fs.vn_block(&vn, far, false).unwrap(), bno);
        assert!(matches!(
            fs.vn_block(&vn, MAXFILE as u32, false),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn write_then_read_round_trips_across_blocks() {
        let mut fs = fresh_fs();
        let root = fs.root();
        let vn = fs.create(&root, "f", FileKind::File).unwrap();
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        fs.write_data(&vn, 100, &data).unwrap();
        assert_eq!(vn.lock().unwrap().inode.size, 3100);
        let mut out = vec![0u8; 3000];
        assert_eq!(fs.read_data(&vn, 100, &mut out).unwrap(), 3000);
        assert_eq!(out, data);
        // the unwritten prefix reads back as zeros
        let mut head = [0xffu8; 100];
        fs.read_data(&vn, 0, &mut head).unwrap();
        assert!(head.iter().all(|&b| b == 0));
    }

    #[test]
    fn create_rejects_duplicates_and_bad_names() {
        let mut fs = fresh_fs();
        let root = fs.root();
        fs.create(&root, "a", FileKind::File).unwrap();
        assert!(matches!(
            fs.create(&root, "a", FileKind::File),
            Err(FsError::AlreadyInUse)
        ));
        assert!(matches!(
            fs.create(&root, ".", FileKind::Directory),
            Err(FsError::InvalidArgument)
        ));
        assert!(matches!(
            fs.create(&root, "", FileKind::File),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn new_directory_carries_dot_entries_and_link_counts() {
        let mut fs = fresh_fs();
        let root = fs.root();
        let sub = fs.create(&root, "sub", FileKind::Directory).unwrap();
        let ents = fs.dir_entries(&sub).unwrap();
        let sub_ino = sub.lock().unwrap().ino();
        assert_eq!(ents[0].name, ".");
        assert_eq!(ents[0].ino, sub_ino);
        assert_eq!(ents[1].name, "..");
        assert_eq!(ents[1].ino, ROOTINO);
        assert_eq!(sub.lock().unwrap().inode.nlink, 2);
        assert_eq!(root.lock().unwrap().inode.nlink, 3);
    }

    #[test]
    fn dir_append_spills_into_a_second_block() {
        let mut fs = fresh_fs();
        let root = fs.root();
        // enough long names to overflow one 1024-byte block of entries
        for i in 0..20 {
            let name = format!("{:0>60}", i);
            fs.create(&root, &name, FileKind::File).unwrap();
        }
        assert_eq!(root.lock().unwrap().inode.size as usize, 2 * BSIZE);
        let ents = fs.dir_entries(&root).unwrap();
        assert_eq!(ents.len(), 22); // "." ".." + 20
    }

    #[test]
    fn free_inode_and_blocks_is_guarded() {
        let mut fs = fresh_fs();
        let root = fs.root();
        let vn = fs.create(&root, "f", FileKind::File).unwrap();
        let ino = vn.lock().unwrap().ino();
        // still referenced by the cache
        assert!(matches!(
            fs.free_inode_and_blocks(ino),
            Err(FsError::AlreadyInUse)
        ));
        fs.vnode_put(&vn).unwrap();
        fs.free_inode_and_blocks(ino).unwrap();
        assert!(matches!(fs.vnode_get(ino), Err(FsError::NotFound)));
        assert!(matches!(
            fs.free_inode_and_blocks(ino),
            Err(FsError::NotFound)
        ));
    }
}
