//! Binary layout of the shared regions.
//!
//! # Arena
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ PoolHeader                                                   │
//! │  magic │ version │ num_slots │ capacity │ SlotEntry[N]       │
//! ├──────────────────────────────────────────────────────────────┤
//! │ data: capacity bytes                                         │
//! │  [slot a][slot b][slot c] ........ free (always at the end)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Slot entries store byte offsets relative to the start of `data`, never
//! pointers, so the table reads the same in every process whatever address
//! the region is mapped at.
//!
//! # Semaphore set
//!
//! ```text
//! ┌───────────────────────────────┬──────────────────────────────┐
//! │ SemSetHeader                  │ sem_t[N] (process-shared)    │
//! └───────────────────────────────┴──────────────────────────────┘
//! ```

use crate::id::NUM_COMPONENTS;
use std::mem::{align_of, size_of};

/// ASCII "STRATAPL".
pub const POOL_MAGIC: u64 = 0x5354_5241_5441_504C;
pub const POOL_VERSION: u32 = 1;

/// ASCII "STRATASM".
pub const SEM_MAGIC: u64 = 0x5354_5241_5441_534D;
pub const SEM_VERSION: u32 = 1;

/// Slot sizes and offsets are kept on this boundary so every slot can hold
/// `repr(C)` headers with `u64` fields.
pub const SLOT_ALIGN: usize = 8;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotEntry {
    pub in_use: u32,
    pub _reserved: u32,
    pub size: u64,
    pub offset: u64,
}

#[repr(C)]
pub struct PoolHeader {
    pub magic: u64,
    pub version: u32,
    pub num_slots: u32,
    /// Bytes available for slots, i.e. region size minus this header.
    pub capacity: u64,
    pub slots: [SlotEntry; NUM_COMPONENTS],
}

impl PoolHeader {
    pub fn validate(&self, region_len: usize) -> Result<(), &'static str> {
        if self.magic != POOL_MAGIC {
            return Err("bad magic");
        }
        if self.version != POOL_VERSION {
            return Err("wrong version");
        }
        if self.num_slots as usize != NUM_COMPONENTS {
            return Err("component count mismatch");
        }
        if self.capacity as usize + pool_header_size() > region_len {
            return Err("capacity larger than region");
        }
        Ok(())
    }
}

#[repr(C)]
pub struct SemSetHeader {
    pub magic: u64,
    pub version: u32,
    pub count: u32,
    pub key: u32,
    pub _reserved: u32,
}

impl SemSetHeader {
    pub fn validate(&self, key: u32) -> Result<(), &'static str> {
        if self.magic != SEM_MAGIC {
            return Err("bad magic");
        }
        if self.version != SEM_VERSION {
            return Err("wrong version");
        }
        if self.count as usize != NUM_COMPONENTS {
            return Err("component count mismatch");
        }
        if self.key != key {
            return Err("key mismatch");
        }
        Ok(())
    }
}

/// Bytes taken by the pool header; the data area starts right after.
pub const fn pool_header_size() -> usize {
    align_up(size_of::<PoolHeader>(), SLOT_ALIGN)
}

/// Offset of the first semaphore in a semaphore-set region.
pub const fn sem_array_offset() -> usize {
    align_up(size_of::<SemSetHeader>(), align_of::<libc::sem_t>())
}

/// Total bytes for a semaphore set of `NUM_COMPONENTS` entries.
pub const fn bytes_for_sem_set() -> usize {
    sem_array_offset() + NUM_COMPONENTS * size_of::<libc::sem_t>()
}

#[inline]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}
