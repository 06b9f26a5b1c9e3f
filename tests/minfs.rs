//! End-to-end tests against a file-backed image: format, mount, populate,
//! remount, and fsck scenarios.

use std::path::Path;
use std::sync::Arc;

use minfs::{
    check, dir_init, mkfs, Bcache, BlockDevice, DInode, DirEnt, Divergence, FileDevice, FileKind,
    FsError, Minfs, SuperBlock, VnodeRef, BSIZE, INODE_SZ, IPB, NDIRECT, ROOTINO,
};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fresh formatted image; returns a device handle usable for raw access
/// alongside the engine's Bcache.
fn format_image(path: &Path, blocks: usize) -> Arc<FileDevice> {
    let dev = Arc::new(FileDevice::create(path, blocks).unwrap());
    let bc = Bcache::new(dev.clone());
    mkfs(&bc).unwrap();
    dev
}

fn bcache(dev: &Arc<FileDevice>) -> Bcache {
    Bcache::new(dev.clone())
}

fn read_superblock(dev: &Arc<FileDevice>) -> SuperBlock {
    let mut blk = [0u8; BSIZE];
    dev.read_block(0, &mut blk).unwrap();
    SuperBlock::decode(&blk).unwrap()
}

/// Raw inode-slot access behind the engine's back, for corruption setups.
fn read_inode(dev: &Arc<FileDevice>, info: &SuperBlock, ino: u32) -> DInode {
    let mut blk = [0u8; BSIZE];
    dev.read_block(info.iblock(ino) as usize, &mut blk).unwrap();
    let off = (ino as usize % IPB) * INODE_SZ;
    DInode::decode(&blk[off..off + INODE_SZ]).unwrap()
}

fn write_inode(dev: &Arc<FileDevice>, info: &SuperBlock, ino: u32, inode: &DInode) {
    let mut blk = [0u8; BSIZE];
    let bno = info.iblock(ino) as usize;
    dev.read_block(bno, &mut blk).unwrap();
    let off = (ino as usize % IPB) * INODE_SZ;
    inode.encode_into(&mut blk[off..off + INODE_SZ]).unwrap();
    dev.write_block(bno, &blk).unwrap();
}

/// Recursive tree snapshot: (path, ino, kind, size, content), sorted by path.
fn snapshot(fs: &mut Minfs) -> Vec<(String, u32, u32, u32, Vec<u8>)> {
    fn walk(fs: &mut Minfs, dir: &VnodeRef, prefix: &str, out: &mut Vec<(String, u32, u32, u32, Vec<u8>)>) {
        for ent in fs.dir_entries(dir).unwrap() {
            if ent.name == "." || ent.name == ".." {
                continue;
            }
            let vn = fs.vnode_get(ent.ino).unwrap();
            let (kind, size) = {
                let guard = vn.lock().unwrap();
                (guard.inode.kind, guard.inode.size)
            };
            let mut content = vec![0u8; size as usize];
            fs.read_data(&vn, 0, &mut content).unwrap();
            let path = format!("{prefix}/{}", ent.name);
            if kind == FileKind::Directory as u32 {
                walk(fs, &vn, &path, out);
                content.clear(); // entry bytes compared via the recursion
            }
            out.push((path, ent.ino, kind, size, content));
            fs.vnode_put(&vn).unwrap();
        }
    }
    let root = fs.root();
    let mut out = Vec::new();
    walk(fs, &root, "", &mut out);
    out.sort();
    out
}

#[test]
fn vnode_cache_keeps_one_live_vnode_per_ino() {
    init_log();
    let tmp = tempfile::tempdir().unwrap();
    let dev = format_image(&tmp.path().join("v.img"), 1000);
    let mut fs = Minfs::mount(bcache(&dev)).unwrap();

    // the mount holds the root reference already
    let a = fs.vnode_get(ROOTINO).unwrap();
    assert!(Arc::ptr_eq(&a, &fs.root()));
    assert_eq!(a.lock().unwrap().refcnt(), 2);
    let b = fs.vnode_get(ROOTINO).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(b.lock().unwrap().refcnt(), 3);
    fs.vnode_put(&a).unwrap();
    fs.vnode_put(&b).unwrap();
    assert_eq!(fs.root().lock().unwrap().refcnt(), 1);

    // a released-to-zero vnode is evicted; the next get loads a fresh one
    let root = fs.root();
    let f = fs.create(&root, "f", FileKind::File).unwrap();
    let ino = f.lock().unwrap().ino();
    let again = fs.vnode_get(ino).unwrap();
    assert!(Arc::ptr_eq(&f, &again));
    fs.vnode_put(&again).unwrap();
    fs.vnode_put(&f).unwrap();
    let fresh = fs.vnode_get(ino).unwrap();
    assert!(!Arc::ptr_eq(&f, &fresh));
    assert_eq!(fresh.lock().unwrap().refcnt(), 1);
    fs.vnode_put(&fresh).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn format_mount_populate_remount_round_trips() {
    init_log();
    let tmp = tempfile::tempdir().unwrap();
    let dev = format_image(&tmp.path().join("v.img"), 2000);
    let mut fs = Minfs::mount(bcache(&dev)).unwrap();
    let root = fs.root();

    let docs = fs.create(&root, "docs", FileKind::Directory).unwrap();
    let a = fs.create(&docs, "a.txt", FileKind::File).unwrap();
    let a_data: Vec<u8> = (0..2500u32).map(|i| (i % 241) as u8).collect();
    fs.write_data(&a, 0, &a_data).unwrap();

    // b.bin reaches past the direct pointers into the indirect range
    let b = fs.create(&root, "b.bin", FileKind::File).unwrap();
    let far = (NDIRECT * BSIZE) as u32;
    fs.write_data(&b, far, b"tail beyond the direct blocks").unwrap();
    fs.write_data(&b, 0, b"head").unwrap();

    let nested = fs.create(&docs, "nested", FileKind::Directory).unwrap();
    fs.vnode_put(&nested).unwrap();
    fs.vnode_put(&b).unwrap();
    fs.vnode_put(&a).unwrap();
    fs.vnode_put(&docs).unwrap();

    let before = snapshot(&mut fs);
    fs.unmount().unwrap();

    let mut fs = Minfs::mount(bcache(&dev)).unwrap();
    let after = snapshot(&mut fs);
    assert_eq!(before, after);

    // spot checks on the remounted contents
    let root = fs.root();
    let docs_ent = fs.lookup(&root, "docs").unwrap();
    let docs = fs.vnode_get(docs_ent.ino).unwrap();
    let a_ent = fs.lookup(&docs, "a.txt").unwrap();
    let a = fs.vnode_get(a_ent.ino).unwrap();
    let mut out = vec![0u8; a_data.len()];
    assert_eq!(fs.read_data(&a, 0, &mut out).unwrap(), a_data.len());
    assert_eq!(out, a_data);
    fs.vnode_put(&a).unwrap();
    fs.vnode_put(&docs).unwrap();
    fs.unmount().unwrap();

    let report = check(&bcache(&dev), false).unwrap();
    assert!(report.passed(), "{:?}", report.divergences);
}

#[test]
fn fsck_passes_on_a_fresh_volume() {
    init_log();
    let tmp = tempfile::tempdir().unwrap();
    let dev = format_image(&tmp.path().join("v.img"), 1000);
    let report = check(&bcache(&dev), false).unwrap();
    assert!(report.passed());
    assert!(report.divergences.is_empty());
    assert!(!report.repaired);
}

#[test]
fn fsck_reports_exactly_one_unmarked_reachable_block() {
    init_log();
    let tmp = tempfile::tempdir().unwrap();
    let dev = format_image(&tmp.path().join("v.img"), 1000);
    let mut fs = Minfs::mount(bcache(&dev)).unwrap();
    let root = fs.root();
    let f = fs.create(&root, "f", FileKind::File).unwrap();
    fs.write_data(&f, 0, &[7u8; BSIZE]).unwrap();
    let bno = fs.vn_block(&f, 0, false).unwrap();
    fs.vnode_put(&f).unwrap();
    fs.unmount().unwrap();

    // clear the referenced block's bitmap bit behind the engine's back
    let info = read_superblock(&dev);
    let bit = bno - info.dat_block;
    let abm = info.abm_block + bit / (BSIZE as u32 * 8);
    let mut blk = [0u8; BSIZE];
    dev.read_block(abm as usize, &mut blk).unwrap();
    blk[(bit / 8) as usize] &= !(1 << (bit % 8));
    dev.write_block(abm as usize, &blk).unwrap();

    let report = check(&bcache(&dev), false).unwrap();
    assert_eq!(report.divergences, vec![Divergence::BlockNotMarked(bno)]);
}

#[test]
fn fsck_repair_rewrites_bitmaps_from_reachability() {
    init_log();
    let tmp = tempfile::tempdir().unwrap();
    let dev = format_image(&tmp.path().join("v.img"), 1000);
    let info = read_superblock(&dev);

    // a stray data-block bit and a stray inode bit, both unreachable
    let mut blk = [0u8; BSIZE];
    dev.read_block(info.abm_block as usize, &mut blk).unwrap();
    blk[5] |= 1 << 3;
    dev.write_block(info.abm_block as usize, &blk).unwrap();
    let mut blk = [0u8; BSIZE];
    dev.read_block(info.ibm_block as usize, &mut blk).unwrap();
    blk[2] |= 1 << 1;
    dev.write_block(info.ibm_block as usize, &blk).unwrap();

    let report = check(&bcache(&dev), false).unwrap();
    assert_eq!(report.divergences.len(), 2);
    assert!(report
        .divergences
        .iter()
        .any(|d| matches!(d, Divergence::BlockNotReachable(_))));
    assert!(report
        .divergences
        .iter()
        .any(|d| matches!(d, Divergence::InodeNotReachable(17))));

    let report = check(&bcache(&dev), true).unwrap();
    assert!(report.repaired);
    let report = check(&bcache(&dev), false).unwrap();
    assert!(report.passed(), "{:?}", report.divergences);

    // repaired volume still mounts and allocates
    let mut fs = Minfs::mount(bcache(&dev)).unwrap();
    let (_, blk) = fs.new_block(0).unwrap();
    assert!(blk.iter().all(|&b| b == 0));
    fs.unmount().unwrap();
}

#[test]
fn fsck_reports_a_wrong_stored_link_count() {
    init_log();
    let tmp = tempfile::tempdir().unwrap();
    let dev = format_image(&tmp.path().join("v.img"), 1000);
    let mut fs = Minfs::mount(bcache(&dev)).unwrap();
    let root = fs.root();
    let d = fs.create(&root, "d", FileKind::Directory).unwrap();
    let ino = d.lock().unwrap().ino();
    fs.vnode_put(&d).unwrap();
    fs.unmount().unwrap();

    // an empty directory's references are its own "." plus the parent entry
    let info = read_superblock(&dev);
    let mut inode = read_inode(&dev, &info, ino);
    assert_eq!(inode.nlink, 2);
    inode.nlink = 7;
    write_inode(&dev, &info, ino, &inode);

    let report = check(&bcache(&dev), false).unwrap();
    assert_eq!(
        report.divergences,
        vec![Divergence::BadLinkCount {
            ino,
            stored: 7,
            counted: 2,
        }]
    );
}

#[test]
fn fsck_reports_a_dotdot_entry_pointing_away_from_the_parent() {
    init_log();
    let tmp = tempfile::tempdir().unwrap();
    let dev = format_image(&tmp.path().join("v.img"), 1000);
    let mut fs = Minfs::mount(bcache(&dev)).unwrap();
    let root = fs.root();
    let d = fs.create(&root, "d", FileKind::Directory).unwrap();
    let ino = d.lock().unwrap().ino();
    fs.vnode_put(&d).unwrap();
    fs.unmount().unwrap();

    // rewrite the directory's block so ".." names the directory itself
    let info = read_superblock(&dev);
    let inode = read_inode(&dev, &info, ino);
    let mut blk = [0u8; BSIZE];
    dir_init(&mut blk, ino, ino).unwrap();
    dev.write_block(inode.dnum[0] as usize, &blk).unwrap();

    let report = check(&bcache(&dev), false).unwrap();
    assert!(report.divergences.contains(&Divergence::BadParent {
        dir: ino,
        expected: ROOTINO,
        found: ino,
    }));
    // the redirected ".." also moves one counted link from root to the child
    assert!(report
        .divergences
        .iter()
        .all(|d| matches!(
            d,
            Divergence::BadParent { .. } | Divergence::BadLinkCount { .. }
        )));
}

#[test]
fn fsck_reports_a_directory_cycle() {
    init_log();
    let tmp = tempfile::tempdir().unwrap();
    let dev = format_image(&tmp.path().join("v.img"), 1000);
    let mut fs = Minfs::mount(bcache(&dev)).unwrap();
    let root = fs.root();
    let a = fs.create(&root, "a", FileKind::Directory).unwrap();
    let b = fs.create(&a, "b", FileKind::Directory).unwrap();
    let a_ino = a.lock().unwrap().ino();
    let b_ino = b.lock().unwrap().ino();
    fs.vnode_put(&b).unwrap();
    fs.vnode_put(&a).unwrap();
    fs.unmount().unwrap();

    // graft an entry in a/b that points back up at a
    let info = read_superblock(&dev);
    let b_inode = read_inode(&dev, &info, b_ino);
    let bno = b_inode.dnum[0] as usize;
    let mut blk = [0u8; BSIZE];
    dev.read_block(bno, &mut blk).unwrap();
    let off: usize = DirEnt::decode_block(&blk)
        .unwrap()
        .iter()
        .map(|e| e.encoded_len())
        .sum();
    DirEnt::new(a_ino, FileKind::Directory, "loop")
        .encode_into(&mut blk[off..])
        .unwrap();
    dev.write_block(bno, &blk).unwrap();

    let report = check(&bcache(&dev), false).unwrap();
    assert!(!report.passed());
    assert!(report.divergences.contains(&Divergence::DirCycle(a_ino)));
}

#[test]
fn freeing_an_inode_releases_every_referenced_block() {
    init_log();
    let tmp = tempfile::tempdir().unwrap();
    let dev = format_image(&tmp.path().join("v.img"), 2000);
    let mut fs = Minfs::mount(bcache(&dev)).unwrap();
    let root = fs.root();
    let f = fs.create(&root, "f", FileKind::File).unwrap();
    fs.write_data(&f, 0, &vec![1u8; 3 * BSIZE]).unwrap();
    // one block in the indirect range as well
    fs.write_data(&f, (NDIRECT * BSIZE) as u32, &[2u8; 16]).unwrap();

    let ino = f.lock().unwrap().ino();
    let mut bnos: Vec<u32> = (0..3)
        .map(|lbn| fs.vn_block(&f, lbn, false).unwrap())
        .collect();
    bnos.push(fs.vn_block(&f, NDIRECT as u32, false).unwrap());
    let indirect = f.lock().unwrap().inode.inum[0];
    bnos.push(indirect);
    assert!(bnos.iter().all(|&b| b != 0 && fs.block_allocated(b)));

    fs.vnode_put(&f).unwrap();
    let freed = fs.free_inode_and_blocks(ino).unwrap();
    assert_eq!(freed as usize, bnos.len());
    assert!(bnos.iter().all(|&b| !fs.block_allocated(b)));
    assert!(matches!(fs.vnode_get(ino), Err(FsError::NotFound)));
    fs.unmount().unwrap();

    // the bitmaps agree with reachability again; only the stale root entry
    // for the freed inode remains, and entry removal is the front end's job
    let report = check(&bcache(&dev), false).unwrap();
    assert!(!report.divergences.is_empty());
    assert!(report
        .divergences
        .iter()
        .all(|d| matches!(d, Divergence::BadEntry { .. })));
}

#[test]
fn new_block_always_hands_out_zeroed_blocks() {
    init_log();
    let tmp = tempfile::tempdir().unwrap();
    let dev = format_image(&tmp.path().join("v.img"), 1000);
    let mut fs = Minfs::mount(bcache(&dev)).unwrap();
    let root = fs.root();

    // fill a block with junk through a file, then free it
    let f = fs.create(&root, "junk", FileKind::File).unwrap();
    fs.write_data(&f, 0, &[0xab; BSIZE]).unwrap();
    let bno = fs.vn_block(&f, 0, false).unwrap();
    let ino = f.lock().unwrap().ino();
    fs.vnode_put(&f).unwrap();
    fs.sync().unwrap();
    fs.free_inode_and_blocks(ino).unwrap();

    // the hint hands the same block straight back; it must come back zeroed
    let (bno2, blk) = fs.new_block(bno).unwrap();
    assert_eq!(bno2, bno);
    assert!(blk.iter().all(|&b| b == 0));
    let mut raw = [0u8; BSIZE];
    dev.read_block(bno as usize, &mut raw).unwrap();
    assert!(raw.iter().all(|&b| b == 0));
    fs.unmount().unwrap();
}
