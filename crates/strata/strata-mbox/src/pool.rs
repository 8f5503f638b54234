//! Compacting object pool over a fixed byte region.
//!
//! The region is divided into one slot per component id. Live slots are
//! always packed from offset 0 with no gaps: a new slot goes right after the
//! live ones, and deleting a slot shifts everything behind it to the left.
//! Because slot contents move, callers must never keep an address returned
//! by [`ObjectPool::slot_addr`] across a create or delete of any slot.
//!
//! The pool does no locking. Structural changes (`create_slot`,
//! `delete_slot`) must only run while the caller excludes every other user of
//! the region; `Arena` does that by holding every mailbox lock.

use crate::error::PoolError;
use crate::id::{ComponentId, NUM_COMPONENTS};
use crate::shm_layout::{
    POOL_MAGIC, POOL_VERSION, PoolHeader, SLOT_ALIGN, SlotEntry, align_up, pool_header_size,
};
use std::mem::align_of;
use std::ptr::{self, NonNull};

/// An in-use slot as recorded in the slot table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: ComponentId,
    pub offset: usize,
    pub size: usize,
}

/// Handle on a pool living in memory the caller provides.
///
/// The handle holds only the base address; it is neither `Send` nor `Sync`
/// on its own.
pub struct ObjectPool {
    base: NonNull<u8>,
    len: usize,
}

impl ObjectPool {
    /// Stamps a fresh, empty pool into `memory`.
    ///
    /// # Safety
    /// `memory` must be valid for reads and writes of `size` bytes for as
    /// long as the returned handle is used.
    pub unsafe fn init(memory: *mut u8, size: usize) -> Result<Self, PoolError> {
        let pool = Self::wrap(memory, size)?;

        // SAFETY: wrap() checked alignment and that the header fits.
        unsafe {
            ptr::write_bytes(memory, 0, pool_header_size());
            let h = pool.header_ptr();
            (*h).magic = POOL_MAGIC;
            (*h).version = POOL_VERSION;
            (*h).num_slots = NUM_COMPONENTS as u32;
            (*h).capacity = (size - pool_header_size()) as u64;
        }

        Ok(pool)
    }

    /// Attaches to a pool another process already initialised.
    ///
    /// # Safety
    /// Same contract as [`ObjectPool::init`].
    pub unsafe fn attach(memory: *mut u8, size: usize) -> Result<Self, PoolError> {
        let pool = Self::wrap(memory, size)?;
        // SAFETY: the header lies within the region.
        unsafe { &*pool.header_ptr() }
            .validate(size)
            .map_err(PoolError::BadHeader)?;
        Ok(pool)
    }

    fn wrap(memory: *mut u8, size: usize) -> Result<Self, PoolError> {
        let base = NonNull::new(memory).ok_or(PoolError::Misaligned)?;
        if (memory as usize) % align_of::<PoolHeader>() != 0 {
            return Err(PoolError::Misaligned);
        }
        if size < pool_header_size() {
            return Err(PoolError::TooSmall {
                size,
                needed: pool_header_size(),
            });
        }
        Ok(Self { base, len: size })
    }

    #[inline(always)]
    fn header_ptr(&self) -> *mut PoolHeader {
        self.base.as_ptr() as *mut PoolHeader
    }

    #[inline(always)]
    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: the header fits in the region (checked by wrap()).
        unsafe { self.base.as_ptr().add(pool_header_size()) }
    }

    #[inline]
    fn entry(&self, id: ComponentId) -> SlotEntry {
        let idx = id.index();
        // SAFETY: idx < NUM_COMPONENTS and the header is initialised.
        unsafe { ptr::read(ptr::addr_of!((*self.header_ptr()).slots[idx])) }
    }

    #[inline]
    fn set_entry(&self, id: ComponentId, entry: SlotEntry) {
        let idx = id.index();
        // SAFETY: as above.
        unsafe { ptr::write(ptr::addr_of_mut!((*self.header_ptr()).slots[idx]), entry) }
    }

    /// Bytes available to slots.
    pub fn capacity(&self) -> usize {
        // SAFETY: header initialised.
        unsafe { (*self.header_ptr()).capacity as usize }
    }

    /// Region size including the header.
    pub fn region_len(&self) -> usize {
        self.len
    }

    /// Bytes taken by live slots; also the offset of the free area.
    pub fn used(&self) -> usize {
        self.slots().map(|s| s.size).sum()
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.used()
    }

    pub fn slots(&self) -> impl Iterator<Item = SlotInfo> + '_ {
        ComponentId::all().filter_map(move |id| {
            let e = self.entry(id);
            (e.in_use != 0).then_some(SlotInfo {
                id,
                offset: e.offset as usize,
                size: e.size as usize,
            })
        })
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.entry(id).in_use != 0
    }

    /// Reserves `size` bytes (rounded up to 8) for `id` right after the live
    /// slots. The new bytes are left as they are.
    pub fn create_slot(&self, id: ComponentId, size: usize) -> Result<(), PoolError> {
        if self.contains(id) {
            return Err(PoolError::AlreadyExists(id));
        }

        let size = align_up(size.max(1), SLOT_ALIGN);
        let offset = self.used();
        let available = self.capacity() - offset;
        if size > available {
            return Err(PoolError::OutOfSpace {
                id,
                requested: size,
                available,
            });
        }

        self.set_entry(
            id,
            SlotEntry {
                in_use: 1,
                _reserved: 0,
                size: size as u64,
                offset: offset as u64,
            },
        );
        Ok(())
    }

    /// Frees the slot of `id` and closes the gap it leaves.
    pub fn delete_slot(&self, id: ComponentId) -> Result<(), PoolError> {
        let victim = self.entry(id);
        if victim.in_use == 0 {
            return Err(PoolError::NotFound(id));
        }

        let used = self.used();
        let start = victim.offset as usize;
        let size = victim.size as usize;
        let tail = start + size;
        let data = self.data_ptr();

        // SAFETY: every range below lies within [0, used) ⊆ [0, capacity).
        unsafe {
            ptr::write_bytes(data.add(start), 0, size);
            ptr::copy(data.add(tail), data.add(start), used - tail);
            ptr::write_bytes(data.add(used - size), 0, size);
        }

        self.set_entry(id, SlotEntry::default());

        for other in ComponentId::all() {
            let mut e = self.entry(other);
            if e.in_use != 0 && e.offset > victim.offset {
                e.offset -= victim.size;
                self.set_entry(other, e);
            }
        }
        Ok(())
    }

    /// Current address of the bytes of `id`, if the slot is live.
    pub fn slot_addr(&self, id: ComponentId) -> Option<NonNull<u8>> {
        let e = self.entry(id);
        if e.in_use == 0 {
            return None;
        }
        // SAFETY: live slots lie within the data area.
        NonNull::new(unsafe { self.data_ptr().add(e.offset as usize) })
    }

    pub fn slot_size(&self, id: ComponentId) -> Option<usize> {
        let e = self.entry(id);
        (e.in_use != 0).then_some(e.size as usize)
    }
}
