//! Named shared-memory region for the ipc backend.
//!
//! Layout: a fixed header followed by one interleaved f32 block.
//!
//! ```text
//! offset  size  field
//!      0     4  magic  ("CNDO")
//!      4     4  version
//!      8     8  epoch          (program generation; bumped on swap)
//!     16     8  block counter  (bumped after each block is written)
//!     24     4  block size     (frames)
//!     28     4  channels
//!     32     4  sample rate
//!     36     4  padding
//!     40     …  payload        (block_size * channels f32, little endian)
//! ```
//!
//! A consumer polls the block counter and re-reads the header whenever the
//! epoch changes, so a stale consumer detects program swaps instead of
//! misreading the payload.
//!
//! The two `unsafe` blocks below are the only unsafe code in the workspace;
//! `memmap2` requires them for the mapping itself. All header and payload
//! access goes through safe byte-slice reads and writes.

#![allow(unsafe_code)]

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use conducto_core::BackendError;

/// Region magic: `"CNDO"`.
pub const REGION_MAGIC: u32 = u32::from_le_bytes(*b"CNDO");
/// Region layout version.
pub const REGION_VERSION: u32 = 1;

const HEADER_LEN: usize = 40;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_EPOCH: usize = 8;
const OFF_COUNTER: usize = 16;
const OFF_BLOCK_SIZE: usize = 24;
const OFF_CHANNELS: usize = 28;
const OFF_SAMPLE_RATE: usize = 32;

fn region_path(name: &str) -> PathBuf {
    // Prefer the kernel shm filesystem where present; fall back to tmp.
    let base = Path::new("/dev/shm");
    if base.is_dir() {
        base.join(name)
    } else {
        std::env::temp_dir().join(name)
    }
}

/// A writable shared-memory audio exchange region.
pub struct ShmRegion {
    map: MmapMut,
    path: PathBuf,
    block_size: usize,
    channels: usize,
    owned: bool,
}

impl ShmRegion {
    /// Create (or truncate) a named region sized for one block.
    pub fn create(
        name: &str,
        block_size: usize,
        channels: usize,
        sample_rate: u32,
    ) -> Result<Self, BackendError> {
        let path = region_path(name);
        let len = HEADER_LEN + block_size * channels * 4;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(len as u64)?;

        // SAFETY: the file was just created with the exact mapped length and
        // stays open for the mapping's lifetime.
        let map = unsafe { MmapMut::map_mut(&file)? };

        let mut region = Self {
            map,
            path,
            block_size,
            channels,
            owned: true,
        };
        region.write_u32(OFF_MAGIC, REGION_MAGIC);
        region.write_u32(OFF_VERSION, REGION_VERSION);
        region.write_u64(OFF_EPOCH, 0);
        region.write_u64(OFF_COUNTER, 0);
        region.write_u32(OFF_BLOCK_SIZE, block_size as u32);
        region.write_u32(OFF_CHANNELS, channels as u32);
        region.write_u32(OFF_SAMPLE_RATE, sample_rate);
        Ok(region)
    }

    /// Open an existing region (consumer side).
    pub fn open(name: &str) -> Result<Self, BackendError> {
        let path = region_path(name);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len() as usize;
        if len < HEADER_LEN {
            return Err(BackendError::Lost(format!(
                "region {} too small ({len} bytes)",
                path.display()
            )));
        }

        // SAFETY: mapped read-write over the full file; length checked above.
        let map = unsafe { MmapMut::map_mut(&file)? };

        let mut region = Self {
            map,
            path,
            block_size: 0,
            channels: 0,
            owned: false,
        };
        if region.read_u32(OFF_MAGIC) != REGION_MAGIC {
            return Err(BackendError::Lost(format!(
                "region {} has wrong magic",
                region.path.display()
            )));
        }
        if region.read_u32(OFF_VERSION) != REGION_VERSION {
            return Err(BackendError::Lost(format!(
                "region {} has unsupported version {}",
                region.path.display(),
                region.read_u32(OFF_VERSION)
            )));
        }
        region.block_size = region.read_u32(OFF_BLOCK_SIZE) as usize;
        region.channels = region.read_u32(OFF_CHANNELS) as usize;
        Ok(region)
    }

    /// Frames per block the region was sized for.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Channels the region was sized for.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Sample rate recorded in the header.
    pub fn sample_rate(&self) -> u32 {
        self.read_u32(OFF_SAMPLE_RATE)
    }

    /// Program epoch recorded in the header.
    pub fn epoch(&self) -> u64 {
        self.read_u64(OFF_EPOCH)
    }

    /// Record a new program epoch.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.write_u64(OFF_EPOCH, epoch);
    }

    /// Blocks written so far.
    pub fn block_counter(&self) -> u64 {
        self.read_u64(OFF_COUNTER)
    }

    /// Write one interleaved block and bump the counter.
    pub fn publish_block(&mut self, interleaved: &[f32]) {
        let expected = self.block_size * self.channels;
        debug_assert_eq!(interleaved.len(), expected);
        for (i, sample) in interleaved.iter().enumerate().take(expected) {
            let off = HEADER_LEN + i * 4;
            self.map[off..off + 4].copy_from_slice(&sample.to_le_bytes());
        }
        let counter = self.block_counter() + 1;
        self.write_u64(OFF_COUNTER, counter);
    }

    /// Read the current block payload.
    pub fn read_block(&self) -> Vec<f32> {
        let expected = self.block_size * self.channels;
        (0..expected)
            .map(|i| {
                let off = HEADER_LEN + i * 4;
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&self.map[off..off + 4]);
                f32::from_le_bytes(bytes)
            })
            .collect()
    }

    fn read_u32(&self, off: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.map[off..off + 4]);
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&mut self, off: usize, value: u32) {
        self.map[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u64(&self, off: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.map[off..off + 8]);
        u64::from_le_bytes(bytes)
    }

    fn write_u64(&mut self, off: usize, value: u64) {
        self.map[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("conducto-test-{tag}-{}", std::process::id())
    }

    #[test]
    fn create_and_reopen() {
        let name = unique_name("reopen");
        let region = ShmRegion::create(&name, 64, 2, 48000).unwrap();
        assert_eq!(region.block_size(), 64);
        assert_eq!(region.channels(), 2);
        assert_eq!(region.sample_rate(), 48000);

        let consumer = ShmRegion::open(&name).unwrap();
        assert_eq!(consumer.block_size(), 64);
        assert_eq!(consumer.channels(), 2);
    }

    #[test]
    fn publish_and_read_block() {
        let name = unique_name("payload");
        let mut region = ShmRegion::create(&name, 4, 2, 44100).unwrap();
        let block: Vec<f32> = (0..8).map(|i| i as f32 * 0.125).collect();
        region.publish_block(&block);
        assert_eq!(region.block_counter(), 1);

        let consumer = ShmRegion::open(&name).unwrap();
        assert_eq!(consumer.read_block(), block);
        assert_eq!(consumer.block_counter(), 1);
    }

    #[test]
    fn epoch_roundtrip() {
        let name = unique_name("epoch");
        let mut region = ShmRegion::create(&name, 4, 2, 44100).unwrap();
        assert_eq!(region.epoch(), 0);
        region.set_epoch(7);

        let consumer = ShmRegion::open(&name).unwrap();
        assert_eq!(consumer.epoch(), 7);
    }

    #[test]
    fn open_missing_region_fails() {
        assert!(ShmRegion::open(&unique_name("missing")).is_err());
    }
}
