//! Consistency checker: a read-only pass over raw blocks, no live instance.
//!
//! Reconstructs the reachable block and inode sets by walking the directory
//! tree from root, then reconciles them against the on-disk bitmaps. Every
//! divergence found is reported; the pass never stops at the first. Repair
//! rewrites the bitmaps to match the reachable sets (reachability is ground
//! truth) and must never run concurrently with a mount of the same device.

use std::collections::{HashMap, HashSet};
use std::fmt;

use log::{info, warn};

use crate::bcache::Bcache;
use crate::bitmap::Bitmap;
use crate::common::*;
use crate::disk::{DInode, DirEnt, FileKind, SuperBlock};
use crate::error::{FsError, Result};
use crate::vnode::read_slot;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Divergence {
    /// reachable through the tree but bitmap bit clear: would be handed out
    /// again by the allocator
    BlockNotMarked(u32),
    /// bitmap bit set but nothing references it: space never reclaimed
    BlockNotReachable(u32),
    InodeNotMarked(u32),
    InodeNotReachable(u32),
    /// stored link count differs from the number of directory entries
    /// referencing the inode ("." counts the directory, ".." its parent)
    BadLinkCount { ino: u32, stored: u32, counted: u32 },
    /// directory reached again while still on the walk stack
    DirCycle(u32),
    /// ".." does not point at the actual parent
    BadParent { dir: u32, expected: u32, found: u32 },
    /// inode slot that cannot be interpreted
    BadInode { ino: u32, detail: &'static str },
    /// malformed or inconsistent directory entry
    BadEntry {
        dir: u32,
        name: String,
        detail: &'static str,
    },
    /// block pointer outside the data region
    BadBlockPointer { ino: u32, bno: u32 },
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Divergence::BlockNotMarked(bno) => {
                write!(f, "block {bno} reachable but not marked allocated")
            }
            Divergence::BlockNotReachable(bno) => {
                write!(f, "block {bno} marked allocated but unreachable")
            }
            Divergence::InodeNotMarked(ino) => {
                write!(f, "inode {ino} reachable but not marked allocated")
            }
            Divergence::InodeNotReachable(ino) => {
                write!(f, "inode {ino} marked allocated but unreachable")
            }
            Divergence::BadLinkCount {
                ino,
                stored,
                counted,
            } => write!(f, "inode {ino} link count {stored}, {counted} references"),
            Divergence::DirCycle(ino) => write!(f, "directory cycle through inode {ino}"),
            Divergence::BadParent {
                dir,
                expected,
                found,
            } => write!(f, "directory {dir}: '..' is {found}, parent is {expected}"),
            Divergence::BadInode { ino, detail } => write!(f, "inode {ino}: {detail}"),
            Divergence::BadEntry { dir, name, detail } => {
                write!(f, "directory {dir}, entry {name:?}: {detail}")
            }
            Divergence::BadBlockPointer { ino, bno } => {
                write!(f, "inode {ino}: block pointer {bno} outside data region")
            }
        }
    }
}

pub struct CheckReport {
    pub divergences: Vec<Divergence>,
    pub repaired: bool,
}

impl CheckReport {
    pub fn passed(&self) -> bool {
        self.divergences.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    Visiting,
    Done,
}

struct Checker<'a> {
    bc: &'a Bcache,
    info: &'a SuperBlock,
    reachable_blocks: HashSet<u32>,
    reachable_inos: HashSet<u32>,
    counted_links: HashMap<u32, u32>,
    inodes: HashMap<u32, DInode>,
    state: HashMap<u32, Visit>,
    report: Vec<Divergence>,
}

impl<'a> Checker<'a> {
    fn new(bc: &'a Bcache, info: &'a SuperBlock) -> Self {
        Checker {
            bc,
            info,
            reachable_blocks: HashSet::new(),
            reachable_inos: HashSet::new(),
            counted_links: HashMap::new(),
            inodes: HashMap::new(),
            state: HashMap::new(),
            report: Vec::new(),
        }
    }

    fn block_in_data_region(&self, bno: u32) -> bool {
        bno >= self.info.dat_block && bno < self.info.block_count
    }

    /// Record every block the inode addresses: direct, entries of each
    /// indirect block, and the indirect pointer blocks themselves.
    fn mark_inode_blocks(&mut self, ino: u32, inode: &DInode) -> Result<()> {
        for &bno in inode.dnum.iter().filter(|&&b| b != 0) {
            if self.block_in_data_region(bno) {
                self.reachable_blocks.insert(bno);
            } else {
                self.report.push(Divergence::BadBlockPointer { ino, bno });
            }
        }
        for &ib in inode.inum.iter().filter(|&&b| b != 0) {
            if !self.block_in_data_region(ib) {
                self.report.push(Divergence::BadBlockPointer { ino, bno: ib });
                continue;
            }
            self.reachable_blocks.insert(ib);
            let mut blk = [0u8; BSIZE];
            self.bc.read(ib, &mut blk)?;
            for e in blk.chunks_exact(4) {
                let bno = u32::from_le_bytes([e[0], e[1], e[2], e[3]]);
                if bno == 0 {
                    continue;
                }
                if self.block_in_data_region(bno) {
                    self.reachable_blocks.insert(bno);
                } else {
                    self.report.push(Divergence::BadBlockPointer { ino, bno });
                }
            }
        }
        Ok(())
    }

    fn load_inode(&mut self, ino: u32) -> Result<Option<DInode>> {
        if let Some(inode) = self.inodes.get(&ino) {
            return Ok(Some(inode.clone()));
        }
        match read_slot(self.bc, self.info, ino) {
            Ok(inode) => {
                self.inodes.insert(ino, inode.clone());
                Ok(Some(inode))
            }
            Err(FsError::NotSupported) => {
                self.report.push(Divergence::BadInode {
                    ino,
                    detail: "undecodable inode slot",
                });
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn walk_file(&mut self, ino: u32) -> Result<()> {
        if !self.reachable_inos.insert(ino) {
            return Ok(()); // hard link to a file already walked
        }
        if let Some(inode) = self.load_inode(ino)? {
            self.mark_inode_blocks(ino, &inode)?;
        }
        Ok(())
    }

    fn walk_dir(&mut self, ino: u32, parent: u32) -> Result<()> {
        match self.state.get(&ino) {
            Some(Visit::Visiting) => {
                self.report.push(Divergence::DirCycle(ino));
                return Ok(());
            }
            Some(Visit::Done) => return Ok(()),
            None => {}
        }
        self.state.insert(ino, Visit::Visiting);
        self.reachable_inos.insert(ino);
        let inode = match self.load_inode(ino)? {
            Some(inode) => inode,
            None => return Ok(()),
        };
        self.mark_inode_blocks(ino, &inode)?;

        for ent in self.dir_block_entries(ino, &inode)? {
            if ent.ino >= self.info.inode_count {
                self.report.push(Divergence::BadEntry {
                    dir: ino,
                    name: ent.name,
                    detail: "inode number out of range",
                });
                continue;
            }
            *self.counted_links.entry(ent.ino).or_insert(0) += 1;
            if ent.name == "." {
                if ent.ino != ino {
                    self.report.push(Divergence::BadEntry {
                        dir: ino,
                        name: ent.name,
                        detail: "self entry points elsewhere",
                    });
                }
                continue;
            }
            if ent.name == ".." {
                if ent.ino != parent {
                    self.report.push(Divergence::BadParent {
                        dir: ino,
                        expected: parent,
                        found: ent.ino,
                    });
                }
                continue;
            }
            let child = match self.load_inode(ent.ino)? {
                Some(child) => child,
                None => continue,
            };
            if child.file_kind() != FileKind::from_raw(ent.kind as u32) {
                self.report.push(Divergence::BadEntry {
                    dir: ino,
                    name: ent.name.clone(),
                    detail: "entry kind disagrees with inode",
                });
            }
            match child.file_kind() {
                Some(FileKind::Directory) => self.walk_dir(ent.ino, ino)?,
                Some(FileKind::File) => self.walk_file(ent.ino)?,
                _ => self.report.push(Divergence::BadEntry {
                    dir: ino,
                    name: ent.name,
                    detail: "entry references an unallocated inode",
                }),
            }
        }
        self.state.insert(ino, Visit::Done);
        Ok(())
    }

    /// Data block numbers of an inode in logical order: direct pointers,
    /// then the entries of each indirect block. Out-of-region pointers are
    /// skipped here; mark_inode_blocks already reported them.
    fn inode_data_blocks(&self, inode: &DInode) -> Result<Vec<u32>> {
        let mut out: Vec<u32> = inode
            .dnum
            .iter()
            .copied()
            .filter(|&b| self.block_in_data_region(b))
            .collect();
        for &ib in inode.inum.iter().filter(|&&b| b != 0) {
            if !self.block_in_data_region(ib) {
                continue;
            }
            let mut blk = [0u8; BSIZE];
            self.bc.read(ib, &mut blk)?;
            for e in blk.chunks_exact(4) {
                let bno = u32::from_le_bytes([e[0], e[1], e[2], e[3]]);
                if self.block_in_data_region(bno) {
                    out.push(bno);
                }
            }
        }
        Ok(out)
    }

    /// Entries of every data block of a directory; a malformed block is
    /// reported and skipped, not fatal.
    fn dir_block_entries(&mut self, ino: u32, inode: &DInode) -> Result<Vec<DirEnt>> {
        let mut out = Vec::new();
        for bno in self.inode_data_blocks(inode)? {
            let mut blk = [0u8; BSIZE];
            self.bc.read(bno, &mut blk)?;
            match DirEnt::decode_block(&blk) {
                Ok(ents) => out.extend(ents),
                Err(_) => self.report.push(Divergence::BadEntry {
                    dir: ino,
                    name: String::new(),
                    detail: "malformed entry block",
                }),
            }
        }
        Ok(out)
    }

    fn reconcile(&mut self, block_map: &Bitmap, inode_map: &Bitmap) {
        for bit in 0..self.info.data_blocks() {
            let bno = self.info.dat_block + bit;
            let reachable = self.reachable_blocks.contains(&bno);
            match (reachable, block_map.get(bit)) {
                (true, false) => self.report.push(Divergence::BlockNotMarked(bno)),
                (false, true) => self.report.push(Divergence::BlockNotReachable(bno)),
                _ => {}
            }
        }
        // inode 0 is reserved and lives outside reconciliation
        for ino in 1..self.info.inode_count {
            let reachable = self.reachable_inos.contains(&ino);
            match (reachable, inode_map.get(ino)) {
                (true, false) => self.report.push(Divergence::InodeNotMarked(ino)),
                (false, true) => self.report.push(Divergence::InodeNotReachable(ino)),
                _ => {}
            }
        }
        for ino in 1..self.info.inode_count {
            if !self.reachable_inos.contains(&ino) {
                continue;
            }
            let stored = self.inodes.get(&ino).map(|i| i.nlink).unwrap_or(0);
            let counted = self.counted_links.get(&ino).copied().unwrap_or(0);
            if stored != counted {
                self.report.push(Divergence::BadLinkCount {
                    ino,
                    stored,
                    counted,
                });
            }
        }
    }
}

/// Check the volume; with `repair`, rewrite both bitmaps to match the
/// reachable sets after the report pass. Returns the full multi-error
/// report; `passed()` means zero divergences were found.
pub fn check(bc: &Bcache, repair: bool) -> Result<CheckReport> {
    let mut blk = [0u8; BSIZE];
    bc.read(0, &mut blk)?;
    let info = SuperBlock::decode(&blk)?;
    info.check_info(bc.blocks() as u32)?;

    let block_map = Bitmap::load(bc, info.abm_block, info.abm_blocks, info.data_blocks())?;
    let inode_map = Bitmap::load(bc, info.ibm_block, info.ibm_blocks, info.inode_count)?;

    let mut ck = Checker::new(bc, &info);
    ck.walk_dir(ROOTINO, ROOTINO)?;
    ck.reconcile(&block_map, &inode_map);

    for d in &ck.report {
        warn!("fsck: {d}");
    }
    info!(
        "fsck: {} inodes and {} blocks reachable, {} divergences",
        ck.reachable_inos.len(),
        ck.reachable_blocks.len(),
        ck.report.len()
    );

    let mut report = CheckReport {
        divergences: ck.report,
        repaired: false,
    };
    if repair && !report.passed() {
        let mut block_map = Bitmap::new_zeroed(info.abm_block, info.abm_blocks, info.data_blocks());
        for &bno in &ck.reachable_blocks {
            block_map.reserve(bno - info.dat_block)?;
        }
        block_map.flush_all(bc)?;

        let mut inode_map = Bitmap::new_zeroed(info.ibm_block, info.ibm_blocks, info.inode_count);
        inode_map.reserve(0)?;
        for &ino in &ck.reachable_inos {
            inode_map.reserve(ino)?;
        }
        inode_map.flush_all(bc)?;
        info!("fsck: bitmaps rewritten from the reachable sets");
        report.repaired = true;
    }
    Ok(report)
}
