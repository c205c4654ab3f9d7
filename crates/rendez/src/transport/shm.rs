// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory ring for SHM channels.
//!
//! # Memory Layout
//!
//! ```text
//! +-------------------------------------------------------------+
//! | RingHeader (64 bytes)                                       |
//! +-------------------------------------------------------------+
//! | slot[0]: SlotHeader (16 bytes) + payload (slot_size bytes)  |
//! | slot[1]                                                     |
//! | ...                                                         |
//! +-------------------------------------------------------------+
//! ```
//!
//! Each slot is padded to a multiple of 64 bytes. The number of slots is
//! whatever fits in the segment size advertised by the publisher.
//!
//! # Synchronization Protocol
//!
//! Writer push:
//! 1. Mark slot as writing: `slot.seq = (msg_seq << 1) | 1`
//! 2. Write payload length and data
//! 3. Commit: `slot.seq = msg_seq << 1` (Release)
//! 4. Publish head: `header.head = msg_seq + 1` (Release)
//!
//! Reader try_pop:
//! 1. Load head (Acquire), check for overrun
//! 2. Load slot.seq (Acquire), verify `seq == expected << 1`
//! 3. Copy payload
//! 4. Re-check slot.seq (detect torn read)

use std::ffi::CString;
use std::fmt;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const MAGIC: u64 = 0x5245_4e44_455a_0001; // "RENDEZ" v1
const HEADER_SIZE: usize = 64;
const SLOT_HEADER_SIZE: usize = 16;
const SLOT_ALIGN: usize = 64;

/// Errors from SHM channel operations.
#[derive(Debug)]
pub enum ShmError {
    /// Shared memory segment creation failed
    SegmentCreate(io::Error),

    /// Shared memory segment open failed
    SegmentOpen(io::Error),

    /// Memory mapping failed
    Mmap(io::Error),

    /// Segment does not exist (yet)
    NotFound(String),

    /// Invalid segment name
    InvalidName(String),

    /// Segment too small for even one slot
    TooSmall { size: usize, slot_size: usize },

    /// Payload larger than a slot
    PayloadTooLarge { size: usize, capacity: usize },

    /// Header does not describe a ring
    Corruption,

    /// Reader fell behind by more than the ring capacity
    Overrun { skipped: u64 },
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "shared memory segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "memory mapping failed: {e}"),
            Self::NotFound(name) => write!(f, "segment not found: {name}"),
            Self::InvalidName(name) => write!(f, "invalid segment name: {name}"),
            Self::TooSmall { size, slot_size } => {
                write!(f, "segment of {size} bytes cannot hold a {slot_size}-byte slot")
            }
            Self::PayloadTooLarge { size, capacity } => {
                write!(f, "payload of {size} bytes exceeds slot capacity {capacity}")
            }
            Self::Corruption => write!(f, "segment header is corrupted"),
            Self::Overrun { skipped } => write!(f, "reader overrun, {skipped} messages lost"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShmError>;

#[repr(C, align(64))]
struct RingHeader {
    magic: AtomicU64,
    capacity: AtomicU32,
    slot_size: AtomicU32,
    head: AtomicU64,
    closed: AtomicU32,
}

#[repr(C)]
struct SlotHeader {
    seq: AtomicU64,
    len: AtomicU32,
    _pad: u32,
}

const fn slot_stride(slot_size: usize) -> usize {
    (SLOT_HEADER_SIZE + slot_size).div_ceil(SLOT_ALIGN) * SLOT_ALIGN
}

/// Number of slots of `slot_size` bytes fitting in `segment_size`.
pub fn ring_capacity(segment_size: usize, slot_size: usize) -> usize {
    segment_size.saturating_sub(HEADER_SIZE) / slot_stride(slot_size)
}

/// Mapped POSIX shared memory segment. Unmapped on drop, never unlinked.
struct Segment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the mapping is shared memory accessed only through the atomic
// header and slot fields; payload bytes are guarded by the slot sequence.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = c_name(name)?;
        // SAFETY:
        // - c_name is a valid null-terminated CString
        // - shm_unlink on a missing name only returns an error, ignored here
        // - shm_open returns a valid fd or -1 (checked below)
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(ShmError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY: fd is valid from the successful shm_open above.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used afterwards.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(ShmError::SegmentCreate(err));
        }

        let ptr = map(fd, size)?;
        // SAFETY: ptr maps exactly `size` writable bytes nobody else sees yet.
        unsafe { ptr::write_bytes(ptr, 0, size) };
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    fn open(name: &str, size: usize) -> Result<Self> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is a valid CString; shm_open returns an fd or -1.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }
        let ptr = map(fd, size)?;
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    fn header(&self) -> &RingHeader {
        // SAFETY:
        // - the mapping is page aligned and at least HEADER_SIZE bytes long
        //   (checked by the ring constructors)
        // - RingHeader only contains atomics, safe to share across processes
        unsafe { &*(self.ptr as *const RingHeader) }
    }

    fn slot(&self, index: usize, slot_size: usize) -> (&SlotHeader, *mut u8) {
        let offset = HEADER_SIZE + index * slot_stride(slot_size);
        debug_assert!(offset + slot_stride(slot_size) <= self.size);
        // SAFETY:
        // - index < capacity, so the slot lies inside the mapping
        // - slot offsets are multiples of 64, aligned for SlotHeader
        // - the payload follows the 16-byte slot header
        unsafe {
            let base = self.ptr.add(offset);
            (&*(base as *const SlotHeader), base.add(SLOT_HEADER_SIZE))
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

fn c_name(name: &str) -> Result<CString> {
    if !name.starts_with('/') || name[1..].contains('/') || name.len() > 255 {
        return Err(ShmError::InvalidName(name.to_string()));
    }
    CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))
}

fn map(fd: libc::c_int, size: usize) -> Result<*mut u8> {
    // SAFETY:
    // - null address lets the kernel choose the placement
    // - fd is a valid shared memory descriptor sized by the creator
    // - MAP_FAILED is checked below
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    // SAFETY: the mapping keeps its own reference; fd is not used again.
    unsafe { libc::close(fd) };
    if ptr == libc::MAP_FAILED {
        return Err(ShmError::Mmap(io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}

/// Single producer of an SHM channel. Owns and unlinks the segment.
pub struct ShmRingWriter {
    segment: Segment,
    capacity: usize,
    slot_size: usize,
    next_seq: u64,
}

impl ShmRingWriter {
    /// Create `name` with `segment_size` bytes of `slot_size`-byte slots.
    pub fn create(name: &str, segment_size: usize, slot_size: usize) -> Result<Self> {
        let capacity = ring_capacity(segment_size, slot_size);
        if capacity == 0 || slot_size > u32::MAX as usize {
            return Err(ShmError::TooSmall {
                size: segment_size,
                slot_size,
            });
        }
        let segment = Segment::create(name, segment_size)?;
        let header = segment.header();
        header.capacity.store(capacity as u32, Ordering::Relaxed);
        header.slot_size.store(slot_size as u32, Ordering::Relaxed);
        header.magic.store(MAGIC, Ordering::Release);
        log::debug!(
            "[shm] created {} ({} slots of {} bytes)",
            name,
            capacity,
            slot_size
        );
        Ok(Self {
            segment,
            capacity,
            slot_size,
            next_seq: 0,
        })
    }

    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.slot_size {
            return Err(ShmError::PayloadTooLarge {
                size: data.len(),
                capacity: self.slot_size,
            });
        }
        let msg_seq = self.next_seq;
        let (slot, payload) = self.segment.slot((msg_seq % self.capacity as u64) as usize, self.slot_size);

        slot.seq.store((msg_seq << 1) | 1, Ordering::Relaxed);
        slot.len.store(data.len() as u32, Ordering::Relaxed);
        // SAFETY:
        // - payload points at slot_size bytes inside the mapping
        // - data.len() <= slot_size was checked above
        // - single writer; readers skip odd (in-progress) sequences
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), payload, data.len()) };
        slot.seq.store(msg_seq << 1, Ordering::Release);

        self.segment.header().head.store(msg_seq + 1, Ordering::Release);
        self.next_seq = msg_seq + 1;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn name(&self) -> &str {
        &self.segment.name
    }
}

impl Drop for ShmRingWriter {
    fn drop(&mut self) {
        self.segment.header().closed.store(1, Ordering::Release);
        if let Ok(c_name) = c_name(&self.segment.name) {
            // SAFETY: c_name is valid; unlinking a missing name is harmless.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

/// One consumer of an SHM channel. Starts at the current head.
pub struct ShmRingReader {
    segment: Segment,
    capacity: usize,
    slot_size: usize,
    next_seq: u64,
}

impl ShmRingReader {
    pub fn attach(name: &str, segment_size: usize) -> Result<Self> {
        if segment_size < HEADER_SIZE {
            return Err(ShmError::TooSmall {
                size: segment_size,
                slot_size: 0,
            });
        }
        let segment = Segment::open(name, segment_size)?;
        let header = segment.header();
        if header.magic.load(Ordering::Acquire) != MAGIC {
            return Err(ShmError::Corruption);
        }
        let capacity = header.capacity.load(Ordering::Relaxed) as usize;
        let slot_size = header.slot_size.load(Ordering::Relaxed) as usize;
        if capacity == 0 || ring_capacity(segment_size, slot_size) < capacity {
            return Err(ShmError::Corruption);
        }
        let next_seq = header.head.load(Ordering::Acquire);
        Ok(Self {
            segment,
            capacity,
            slot_size,
            next_seq,
        })
    }

    /// The writer dropped its end.
    pub fn is_closed(&self) -> bool {
        self.segment.header().closed.load(Ordering::Acquire) != 0
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Copy the next message into `buf`.
    ///
    /// `Ok(false)` means nothing new (or a write in progress). An overrun
    /// resynchronizes on the oldest message still in the ring and reports
    /// how many were lost.
    pub fn try_pop(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        let head = self.segment.header().head.load(Ordering::Acquire);
        if self.next_seq >= head {
            return Ok(false);
        }
        let lag = head - self.next_seq;
        if lag > self.capacity as u64 {
            let oldest = head - self.capacity as u64;
            let skipped = oldest - self.next_seq;
            self.next_seq = oldest;
            return Err(ShmError::Overrun { skipped });
        }

        let expected = self.next_seq;
        let (slot, payload) = self.segment.slot((expected % self.capacity as u64) as usize, self.slot_size);
        if slot.seq.load(Ordering::Acquire) != expected << 1 {
            return Ok(false);
        }
        let len = (slot.len.load(Ordering::Relaxed) as usize).min(self.slot_size);
        buf.clear();
        buf.resize(len, 0);
        // SAFETY:
        // - payload points at slot_size bytes inside the mapping; len <= slot_size
        // - a concurrent overwrite is detected by the sequence re-check below
        unsafe { ptr::copy_nonoverlapping(payload as *const u8, buf.as_mut_ptr(), len) };
        if slot.seq.load(Ordering::Acquire) != expected << 1 {
            // Torn read: the writer lapped us while copying.
            let head = self.segment.header().head.load(Ordering::Acquire);
            let oldest = head.saturating_sub(self.capacity as u64);
            let skipped = oldest.saturating_sub(self.next_seq).max(1);
            self.next_seq = oldest.max(self.next_seq + 1);
            return Err(ShmError::Overrun { skipped });
        }
        self.next_seq += 1;
        Ok(true)
    }
}

static SEGMENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Fresh segment name for this process.
pub fn segment_name() -> String {
    format!(
        "/rendez_{}_{}",
        std::process::id(),
        SEGMENT_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_math() {
        assert_eq!(slot_stride(1), 64);
        assert_eq!(slot_stride(48), 64);
        assert_eq!(slot_stride(49), 128);
        assert_eq!(ring_capacity(64 + 4 * 128, 100), 4);
        assert_eq!(ring_capacity(32, 8), 0);
    }

    #[test]
    fn test_push_and_pop() {
        let name = segment_name();
        let mut writer = ShmRingWriter::create(&name, 64 + 8 * 128, 100).unwrap();
        let mut reader = ShmRingReader::attach(&name, 64 + 8 * 128).unwrap();
        assert_eq!(reader.slot_size(), 100);

        let mut buf = Vec::new();
        assert!(!reader.try_pop(&mut buf).unwrap());

        writer.push(b"first").unwrap();
        writer.push(b"second").unwrap();
        assert!(reader.try_pop(&mut buf).unwrap());
        assert_eq!(buf, b"first");
        assert!(reader.try_pop(&mut buf).unwrap());
        assert_eq!(buf, b"second");
        assert!(!reader.try_pop(&mut buf).unwrap());

        let err = writer.push(&[0u8; 101]).unwrap_err();
        assert!(matches!(err, ShmError::PayloadTooLarge { size: 101, capacity: 100 }));
    }

    #[test]
    fn test_overrun_is_reported_and_recovered() {
        let name = segment_name();
        let size = 64 + 4 * 64;
        let mut writer = ShmRingWriter::create(&name, size, 16).unwrap();
        let mut reader = ShmRingReader::attach(&name, size).unwrap();
        assert_eq!(writer.capacity(), 4);

        for i in 0u8..10 {
            writer.push(&[i]).unwrap();
        }
        let mut buf = Vec::new();
        assert!(matches!(
            reader.try_pop(&mut buf),
            Err(ShmError::Overrun { skipped: 6 })
        ));
        assert!(reader.try_pop(&mut buf).unwrap());
        assert_eq!(buf, [6]);
    }

    #[test]
    fn test_reader_sees_writer_close() {
        let name = segment_name();
        let writer = ShmRingWriter::create(&name, 4096, 64).unwrap();
        let reader = ShmRingReader::attach(&name, 4096).unwrap();
        assert!(!reader.is_closed());
        drop(writer);
        assert!(reader.is_closed());
        assert!(matches!(
            ShmRingReader::attach(&name, 4096),
            Err(ShmError::NotFound(_))
        ));
    }

    #[test]
    fn test_too_small_segment() {
        assert!(matches!(
            ShmRingWriter::create(&segment_name(), 100, 4096),
            Err(ShmError::TooSmall { .. })
        ));
    }
}
