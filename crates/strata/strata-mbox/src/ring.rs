//! Circular store of variable-length, sender-tagged frames.
//!
//! The store lives entirely inside a caller-owned byte region (a mailbox slot
//! in the arena), so it holds no pointers: positions are offsets into the
//! data area that follows the header.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────────┐
//! │ RingHeader   │ data (size bytes, frames wrap at the end)        │
//! └──────────────┴──────────────────────────────────────────────────┘
//!
//! frame: ┌──────────┬────────────┬──────────────────┐
//!        │ len: u32 │ sender (8) │ payload          │   len = 8 + payload
//!        └──────────┴────────────┴──────────────────┘
//! ```
//!
//! A frame is written whole or not at all. Frame sizes reported in the
//! statistics include the sender prefix.

use crate::error::RingError;
use crate::id::Mid;
use crate::shm_layout::align_up;
use std::mem::size_of;
use std::ptr;

/// Number of fill-level buckets, 10% each.
pub const FILL_BUCKETS: usize = 10;

/// Per-frame bytes on top of the payload: length word plus sender prefix.
pub const FRAME_OVERHEAD: usize = size_of::<u32>() + Mid::ENCODED_LEN;

const RING_MAGIC: u32 = 0x5249_4E47; // "RING"
const HEADER_LEN: usize = align_up(size_of::<RingHeader>(), 8);

#[repr(C)]
#[derive(Clone, Copy)]
struct RingHeader {
    magic: u32,
    _reserved: u32,
    /// Bytes in the data area.
    size: u64,
    /// Offset of the oldest frame.
    head: u64,
    /// Bytes held by stored frames.
    used: u64,
    /// Frames currently stored.
    pending: u64,
    count: u64,
    total_bytes: u64,
    min_size: u64,
    max_size: u64,
    reject_count: u64,
    fill_histogram: [u64; FILL_BUCKETS],
}

/// Snapshot of a store's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Successful puts since creation.
    pub count: u64,
    pub avg_size: u64,
    pub min_size: u64,
    pub max_size: u64,
    /// How often each fill level (0-10%, 10-20%, ...) was seen after a put.
    pub fill_histogram: [u64; FILL_BUCKETS],
    pub reject_count: u64,
    pub ring_size: u64,
    pub used_bytes: u64,
    /// Frames waiting to be read.
    pub pending: u64,
}

impl RingStats {
    pub fn available(&self) -> u64 {
        self.ring_size - self.used_bytes
    }

    /// Histogram as percentages of all recorded puts.
    pub fn fill_percentages(&self) -> [f64; FILL_BUCKETS] {
        let total: u64 = self.fill_histogram.iter().sum();
        let mut out = [0.0; FILL_BUCKETS];
        if total == 0 {
            return out;
        }
        for (pct, &hits) in out.iter_mut().zip(self.fill_histogram.iter()) {
            *pct = hits as f64 * 100.0 / total as f64;
        }
        out
    }
}

/// Bytes needed to hold `num_msg` frames of up to `msg_size` payload bytes.
pub const fn required_size(num_msg: usize, msg_size: usize) -> usize {
    HEADER_LEN + num_msg * (FRAME_OVERHEAD + msg_size)
}

/// A view of a store inside borrowed bytes.
pub struct RingStore<'a> {
    buf: &'a mut [u8],
}

impl<'a> RingStore<'a> {
    /// Resets `buf` to an empty store using all of it.
    pub fn init(buf: &'a mut [u8]) -> Result<Self, RingError> {
        let needed = HEADER_LEN + FRAME_OVERHEAD;
        if buf.len() < needed {
            return Err(RingError::RegionTooSmall {
                size: buf.len(),
                needed,
            });
        }

        let size = (buf.len() - HEADER_LEN) as u64;
        let mut store = Self { buf };
        store.store_header(&RingHeader {
            magic: RING_MAGIC,
            _reserved: 0,
            size,
            head: 0,
            used: 0,
            pending: 0,
            count: 0,
            total_bytes: 0,
            min_size: u64::MAX,
            max_size: 0,
            reject_count: 0,
            fill_histogram: [0; FILL_BUCKETS],
        });
        Ok(store)
    }

    /// Views a store previously set up by [`RingStore::init`].
    pub fn attach(buf: &'a mut [u8]) -> Result<Self, RingError> {
        if buf.len() < HEADER_LEN {
            return Err(RingError::Corrupt("region shorter than header"));
        }
        let store = Self { buf };
        let h = store.load_header();
        if h.magic != RING_MAGIC {
            return Err(RingError::Corrupt("bad magic"));
        }
        if h.size as usize > store.buf.len() - HEADER_LEN || h.used > h.size || h.head >= h.size {
            return Err(RingError::Corrupt("inconsistent header"));
        }
        Ok(store)
    }

    #[inline(always)]
    fn load_header(&self) -> RingHeader {
        // SAFETY: buf holds at least HEADER_LEN bytes; unaligned read.
        unsafe { ptr::read_unaligned(self.buf.as_ptr() as *const RingHeader) }
    }

    #[inline(always)]
    fn store_header(&mut self, h: &RingHeader) {
        // SAFETY: as above.
        unsafe { ptr::write_unaligned(self.buf.as_mut_ptr() as *mut RingHeader, *h) }
    }

    fn data_mut(&mut self, size: u64) -> &mut [u8] {
        &mut self.buf[HEADER_LEN..HEADER_LEN + size as usize]
    }

    fn data(&self, size: u64) -> &[u8] {
        &self.buf[HEADER_LEN..HEADER_LEN + size as usize]
    }

    /// Copies `src` in at `pos`, wrapping at the end. Returns the next position.
    fn copy_in(&mut self, size: u64, pos: u64, src: &[u8]) -> u64 {
        let data = self.data_mut(size);
        let pos = pos as usize;
        let first = src.len().min(data.len() - pos);
        data[pos..pos + first].copy_from_slice(&src[..first]);
        data[..src.len() - first].copy_from_slice(&src[first..]);
        ((pos + src.len()) % data.len()) as u64
    }

    fn copy_out(&self, size: u64, pos: u64, dst: &mut [u8]) -> u64 {
        let data = self.data(size);
        let pos = pos as usize;
        let first = dst.len().min(data.len() - pos);
        let (head, tail) = dst.split_at_mut(first);
        head.copy_from_slice(&data[pos..pos + first]);
        tail.copy_from_slice(&data[..tail.len()]);
        ((pos + dst.len()) % data.len()) as u64
    }

    /// Appends one frame made of `segments` concatenated.
    ///
    /// Returns the number of payload bytes stored. On `NoSpace` nothing is
    /// written and the reject counter goes up.
    pub fn put(&mut self, sender: &Mid, segments: &[&[u8]]) -> Result<usize, RingError> {
        let mut h = self.load_header();
        let payload: usize = segments.iter().map(|s| s.len()).sum();
        let frame = Mid::ENCODED_LEN + payload;
        let needed = size_of::<u32>() + frame;
        let available = (h.size - h.used) as usize;

        let len_word = u32::try_from(frame).ok().filter(|_| needed <= available);
        let Some(len_word) = len_word else {
            h.reject_count += 1;
            self.store_header(&h);
            return Err(RingError::NoSpace { needed, available });
        };

        let mut pos = (h.head + h.used) % h.size;
        pos = self.copy_in(h.size, pos, &len_word.to_le_bytes());
        pos = self.copy_in(h.size, pos, &sender.encode());
        for seg in segments {
            pos = self.copy_in(h.size, pos, seg);
        }

        h.used += needed as u64;
        h.pending += 1;
        h.count += 1;
        h.total_bytes += frame as u64;
        h.min_size = h.min_size.min(frame as u64);
        h.max_size = h.max_size.max(frame as u64);
        let bucket = ((h.used * FILL_BUCKETS as u64) / h.size).min(FILL_BUCKETS as u64 - 1);
        h.fill_histogram[bucket as usize] += 1;
        self.store_header(&h);

        Ok(payload)
    }

    /// Payload length of the oldest frame, if any.
    pub fn peek_len(&self) -> Option<usize> {
        let h = self.load_header();
        if h.pending == 0 {
            return None;
        }
        let mut word = [0u8; 4];
        self.copy_out(h.size, h.head, &mut word);
        Some(u32::from_le_bytes(word) as usize - Mid::ENCODED_LEN)
    }

    /// Removes the oldest frame, copying its payload into `out`.
    ///
    /// `Ok(None)` means the store is empty. If `out` is too short the frame
    /// stays in place.
    pub fn get(&mut self, out: &mut [u8]) -> Result<Option<(Mid, usize)>, RingError> {
        let mut h = self.load_header();
        if h.pending == 0 {
            return Ok(None);
        }

        let mut word = [0u8; 4];
        let mut pos = self.copy_out(h.size, h.head, &mut word);
        let frame = u32::from_le_bytes(word) as usize;
        if frame < Mid::ENCODED_LEN || (size_of::<u32>() + frame) as u64 > h.used {
            return Err(RingError::Corrupt("bad frame length"));
        }

        let payload = frame - Mid::ENCODED_LEN;
        if out.len() < payload {
            return Err(RingError::TooSmall {
                needed: payload,
                provided: out.len(),
            });
        }

        let mut sender = [0u8; Mid::ENCODED_LEN];
        pos = self.copy_out(h.size, pos, &mut sender);
        pos = self.copy_out(h.size, pos, &mut out[..payload]);

        h.used -= (size_of::<u32>() + frame) as u64;
        h.pending -= 1;
        h.head = if h.pending == 0 { 0 } else { pos };
        self.store_header(&h);

        Ok(Some((Mid::decode(&sender), payload)))
    }

    pub fn is_empty(&self) -> bool {
        self.load_header().pending == 0
    }

    pub fn stats(&self) -> RingStats {
        let h = self.load_header();
        RingStats {
            count: h.count,
            avg_size: h.total_bytes.checked_div(h.count).unwrap_or(0),
            min_size: if h.count == 0 { 0 } else { h.min_size },
            max_size: h.max_size,
            fill_histogram: h.fill_histogram,
            reject_count: h.reject_count,
            ring_size: h.size,
            used_bytes: h.used,
            pending: h.pending,
        }
    }
}
