#![forbid(unsafe_code)]
//! Disk I/O layer.
//!
//! Positional reads and writes against the backing image, with block
//! granularity helpers on [`Disk`]. Reads and writes are each serialized by
//! their own process-wide mutex, so two reads never interleave and two writes
//! never interleave, while a read may still overlap a write. Callers that
//! need read/write atomicity serialize above this layer.

use kfs_error::{KfsError, Result};
use kfs_types::{BlockNumber, BlockSize, ByteOffset, EXT4_SUPERBLOCK_OFFSET, EXT4_SUPERBLOCK_SIZE};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn short_transfer(op: &str, offset: u64, len: usize, dev_len: u64) -> KfsError {
    KfsError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("short {op}: offset={offset} len={len} device_len={dev_len}"),
    ))
}

fn checked_end(offset: u64, len: usize) -> Result<u64> {
    u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| KfsError::Format(format!("I/O range overflows u64: offset={offset}")))
}

/// File-backed byte device.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image, falling back to read-only when the file is
    /// not writable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) an image file of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if checked_end(offset, buf.len())? > self.len {
            return Err(short_transfer("read", offset, buf.len(), self.len));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(KfsError::ReadOnly);
        }
        if checked_end(offset, buf.len())? > self.len {
            return Err(short_transfer("write", offset, buf.len(), self.len));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device, used by tests and by the formatter's dry runs.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: RwLock<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0; len]),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let end = checked_end(offset, buf.len())?;
        if end > bytes.len() as u64 {
            return Err(short_transfer("read", offset, buf.len(), bytes.len() as u64));
        }
        #[allow(clippy::cast_possible_truncation)] // bounded by bytes.len()
        let start = offset as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let end = checked_end(offset, buf.len())?;
        if end > bytes.len() as u64 {
            return Err(short_transfer("write", offset, buf.len(), bytes.len() as u64));
        }
        #[allow(clippy::cast_possible_truncation)] // bounded by bytes.len()
        let start = offset as usize;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Disk ────────────────────────────────────────────────────────────────────

/// The backing image as seen by the engine.
///
/// `Disk` owns the device and two independent locks: one held for the whole
/// of every read, one for the whole of every write. The block size is fixed
/// once the superblock has been read; until then only byte-addressed calls
/// are meaningful.
pub struct Disk {
    dev: Box<dyn ByteDevice>,
    block_size: BlockSize,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk")
            .field("len", &self.dev.len_bytes())
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl Disk {
    /// Wrap a device. `block_size` may be changed later with [`Disk::with_block_size`].
    #[must_use]
    pub fn new(dev: Box<dyn ByteDevice>, block_size: BlockSize) -> Self {
        Self {
            dev,
            block_size,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        }
    }

    /// Open an image file. The block size starts at 1024 until the caller
    /// rebinds it from the superblock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let dev = FileByteDevice::open(path)?;
        let bs = BlockSize::new(1024).map_err(KfsError::from)?;
        Ok(Self::new(Box::new(dev), bs))
    }

    /// Rebind the block size used by the block helpers.
    #[must_use]
    pub fn with_block_size(mut self, block_size: BlockSize) -> Self {
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.dev.len_bytes()
    }

    /// Total whole blocks on the device.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.dev.len_bytes() / u64::from(self.block_size.get())
    }

    pub fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let _guard = self.read_lock.lock();
        trace!(offset = offset.0, len = buf.len(), "disk read");
        self.dev.read_exact_at(offset.0, buf)
    }

    pub fn write_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock();
        trace!(offset = offset.0, len = buf.len(), "disk write");
        self.dev.write_all_at(offset.0, buf)
    }

    fn block_offset(&self, block: BlockNumber) -> Result<ByteOffset> {
        block
            .to_byte_offset(self.block_size)
            .ok_or_else(|| KfsError::corrupt_at(block.0, "block offset overflows u64"))
    }

    /// Read `buf.len()` bytes starting at the beginning of `block`.
    ///
    /// `buf` may span several consecutive blocks.
    pub fn read_blocks(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        let offset = self.block_offset(block)?;
        self.read_at(offset, buf)
    }

    /// Read one whole block into a fresh buffer.
    pub fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; self.block_size.as_usize()];
        self.read_blocks(block, &mut buf)?;
        Ok(buf)
    }

    /// Write `data` starting at the beginning of `block`.
    pub fn write_blocks(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let offset = self.block_offset(block)?;
        self.write_at(offset, data)
    }

    /// Write zeroes over `count` blocks starting at `block`.
    pub fn zero_blocks(&self, block: BlockNumber, count: u64) -> Result<()> {
        let zero = vec![0_u8; self.block_size.as_usize()];
        for i in 0..count {
            let target = block
                .checked_add(i)
                .ok_or_else(|| KfsError::corrupt_at(block.0, "block range overflows u64"))?;
            self.write_blocks(target, &zero)?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        debug!("disk sync");
        self.dev.sync()
    }
}

/// Read the raw 1024-byte ext4 superblock region.
pub fn read_superblock_region(disk: &Disk) -> Result<[u8; EXT4_SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; EXT4_SUPERBLOCK_SIZE];
    disk.read_at(ByteOffset(EXT4_SUPERBLOCK_OFFSET as u64), &mut buf)?;
    Ok(buf)
}

/// Overwrite the raw 1024-byte ext4 superblock region.
pub fn write_superblock_region(disk: &Disk, region: &[u8; EXT4_SUPERBLOCK_SIZE]) -> Result<()> {
    disk.write_at(ByteOffset(EXT4_SUPERBLOCK_OFFSET as u64), region)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn mem_disk(blocks: usize) -> Disk {
        let dev = MemoryByteDevice::new(blocks * 1024);
        Disk::new(Box::new(dev), BlockSize::new(1024).unwrap())
    }

    #[test]
    fn block_round_trip() {
        let disk = mem_disk(8);
        let data = vec![0xAB_u8; 1024];
        disk.write_blocks(BlockNumber(3), &data).unwrap();
        assert_eq!(disk.read_block(BlockNumber(3)).unwrap(), data);
        assert_eq!(disk.read_block(BlockNumber(2)).unwrap(), vec![0_u8; 1024]);
        assert_eq!(disk.block_count(), 8);
    }

    #[test]
    fn short_read_is_io_error() {
        let disk = mem_disk(2);
        let err = disk.read_block(BlockNumber(2)).unwrap_err();
        match err {
            KfsError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io, got {other:?}"),
        }
        assert!(disk.write_blocks(BlockNumber(1), &[0_u8; 1025]).is_err());
    }

    #[test]
    fn zero_blocks_clears_range() {
        let disk = mem_disk(4);
        disk.write_blocks(BlockNumber(1), &[0xFF_u8; 2048]).unwrap();
        disk.zero_blocks(BlockNumber(1), 2).unwrap();
        let mut buf = [1_u8; 2048];
        disk.read_blocks(BlockNumber(1), &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn superblock_region_helpers() {
        let disk = mem_disk(4);
        let mut region = [0_u8; EXT4_SUPERBLOCK_SIZE];
        region[0x38] = 0x53;
        region[0x39] = 0xEF;
        write_superblock_region(&disk, &region).unwrap();
        let back = read_superblock_region(&disk).unwrap();
        assert_eq!(back[0x38..0x3A], [0x53, 0xEF]);
        assert_eq!(disk.read_block(BlockNumber(1)).unwrap()[0x38], 0x53);
    }

    #[test]
    fn concurrent_writers_do_not_interleave() {
        let disk = Arc::new(mem_disk(16));
        let handles: Vec<_> = (0_u8..8)
            .map(|i| {
                let disk = Arc::clone(&disk);
                thread::spawn(move || {
                    for _ in 0..50 {
                        disk.write_blocks(BlockNumber(0), &[i; 4096]).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut buf = [0_u8; 4096];
        disk.read_blocks(BlockNumber(0), &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == buf[0]));
    }

    #[test]
    fn file_device_create_and_reopen() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let dev = FileByteDevice::create(tmp.path(), 8192).unwrap();
        dev.write_all_at(4096, b"kfs").unwrap();
        dev.sync().unwrap();
        let reopened = FileByteDevice::open(tmp.path()).unwrap();
        assert_eq!(reopened.len_bytes(), 8192);
        let mut buf = [0_u8; 3];
        reopened.read_exact_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"kfs");
        assert!(reopened.read_exact_at(8190, &mut buf).is_err());
    }
}
