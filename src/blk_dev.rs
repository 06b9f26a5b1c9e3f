use std::fs::{File, OpenOptions};
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::common::*;

/// A device of fixed-size blocks addressed by block number. The engine treats
/// reads and writes as synchronous; `buf` is always exactly `BSIZE` bytes.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()>;
    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()>;
    fn num_blocks(&self) -> usize;
}

/// Image-file backed device, used by mkfs/fsck tooling and the tests.
pub struct FileDevice {
    file: Mutex<File>,
    blocks: usize,
}

impl FileDevice {
    /// Create (or truncate) an image of `blocks` blocks.
    pub fn create<P: AsRef<Path>>(path: P, blocks: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((blocks * BSIZE) as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            blocks,
        })
    }

    /// Open an existing image; size must be block aligned.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len % BSIZE != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "image size not block aligned",
            ));
        }
        Ok(Self {
            file: Mutex::new(file),
            blocks: len / BSIZE,
        })
    }
}

impl BlockDevice for FileDevice {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BSIZE) as u64))?;
        file.read_exact(buf)
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BSIZE) as u64))?;
        file.write_all(buf)
    }

    fn num_blocks(&self) -> usize {
        self.blocks
    }
}

/// In-memory device for unit tests.
pub struct MemDevice(Mutex<Vec<u8>>);

impl MemDevice {
    pub fn new(blocks: usize) -> Self {
        Self(Mutex::new(vec![0u8; blocks * BSIZE]))
    }
}

impl BlockDevice for MemDevice {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()> {
        let data = self.0.lock().unwrap();
        let start = block_id * BSIZE;
        buf.copy_from_slice(&data[start..start + BSIZE]);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()> {
        let mut data = self.0.lock().unwrap();
        let start = block_id * BSIZE;
        data[start..start + BSIZE].copy_from_slice(buf);
        Ok(())
    }

    fn num_blocks(&self) -> usize {
        self.0.lock().unwrap().len() / BSIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_device_round_trips_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.img");
        let dev = FileDevice::create(&path, 8).unwrap();
        let mut blk = [0u8; BSIZE];
        blk[0] = 0xa5;
        blk[BSIZE - 1] = 0x5a;
        dev.write_block(3, &blk).unwrap();

        let dev = FileDevice::open(&path).unwrap();
        assert_eq!(dev.num_blocks(), 8);
        let mut out = [0u8; BSIZE];
        dev.read_block(3, &mut out).unwrap();
        assert_eq!(out[0], 0xa5);
        assert_eq!(out[BSIZE - 1], 0x5a);
        dev.read_block(2, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }
}
