//! Mailboxes: a ring store plus counters and watcher flags, stored in one
//! pool slot and guarded by the mailbox lock of the same id.
//!
//! ```text
//! slot: ┌──────────────────────────────────────────┬─────────────────────┐
//!       │ MailboxHeader                            │ RingStore           │
//!       │ owner │ read │ received │ ring_len │ w[] │ (ring_len bytes)    │
//!       └──────────────────────────────────────────┴─────────────────────┘
//! ```
//!
//! # Wakeups
//!
//! Every component has one wakeup semaphore in the arena's `Notifier`.
//! - A successful send posts the destination mailbox's owner.
//! - A receive posts every component flagged as a watcher of that mailbox.
//! - Deleting a mailbox posts its watchers so they see it is gone.
//!
//! A blocked sender shares its semaphore with whatever else wakes that
//! component, so it gives back any post it consumed without seeing the
//! mailbox's read counter move.

use crate::arena::Arena;
use crate::error::{MboxError, RingError};
use crate::id::{ComponentId, Mid, NUM_COMPONENTS};
use crate::mailbox_set::MailboxSet;
use crate::ring::{self, RingStore};
use crate::sem::MailboxGuard;
use crate::shm_layout::align_up;
use crate::stats::{ArenaStats, MailboxStats};
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::slice;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

#[repr(C)]
struct MailboxHeader {
    owner: u16,
    _reserved: u16,
    read_count: u32,
    received_count: u32,
    ring_len: u32,
    watchers: [u8; NUM_COMPONENTS],
}

const HEADER_LEN: usize = align_up(size_of::<MailboxHeader>(), 8);

/// Bytes a mailbox of `num_msg` messages of `msg_size` takes in the arena.
pub const fn mailbox_size(num_msg: usize, msg_size: usize) -> usize {
    HEADER_LEN + ring::required_size(num_msg, msg_size)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendMode {
    /// Wait for room when the mailbox is full.
    Blocking,
    /// Fail with `NoSpace` when the mailbox is full.
    NonBlocking,
}

/// Locked view of a live mailbox.
struct Mailbox<'g> {
    header: &'g mut MailboxHeader,
    ring: &'g mut [u8],
}

impl<'g> Mailbox<'g> {
    /// # Safety
    /// `addr` must start a live, initialised mailbox slot of `size` bytes
    /// that nothing else reads or writes for `'g`.
    unsafe fn from_raw(addr: NonNull<u8>, size: usize) -> Self {
        debug_assert_eq!(addr.as_ptr() as usize % align_of::<MailboxHeader>(), 0);
        // SAFETY: guaranteed by the caller.
        let bytes = unsafe { slice::from_raw_parts_mut(addr.as_ptr(), size) };
        let (head, rest) = bytes.split_at_mut(HEADER_LEN);
        // SAFETY: slots are 8-byte aligned and at least HEADER_LEN long.
        let header = unsafe { &mut *(head.as_mut_ptr() as *mut MailboxHeader) };
        let ring_len = header.ring_len as usize;
        Self {
            header,
            ring: &mut rest[..ring_len],
        }
    }

    fn owner(&self) -> ComponentId {
        ComponentId(self.header.owner)
    }

    fn store(&mut self) -> Result<RingStore<'_>, RingError> {
        RingStore::attach(self.ring)
    }

    fn set_watcher(&mut self, id: ComponentId, on: bool) {
        self.header.watchers[id.index()] = on as u8;
    }

    fn watchers(&self) -> impl Iterator<Item = ComponentId> + '_ {
        ComponentId::all().filter(|id| self.header.watchers[id.index()] != 0)
    }

    /// Frames are queued, or the counters moved since the last read.
    fn has_unread(&mut self) -> Result<bool, RingError> {
        let counters_moved = self.header.read_count != self.header.received_count;
        Ok(counters_moved || !self.store()?.is_empty())
    }
}

/// What a send attempt decided while holding the lock.
enum Step {
    Done(Result<(usize, ComponentId), MboxError>),
    Wait,
}

impl Arena {
    /// Resolves the locked mailbox to its current bytes. The view borrows
    /// the guard, so it cannot outlive the lock.
    fn mailbox<'g>(&'g self, guard: &'g mut MailboxGuard<'_>) -> Option<Mailbox<'g>> {
        let id = guard.id();
        let addr = self.pool().slot_addr(id)?;
        let size = self.pool().slot_size(id)?;
        // SAFETY: the slot is live and we hold its lock, so nothing else
        // reads, writes or moves these bytes until the guard is dropped.
        Some(unsafe { Mailbox::from_raw(addr, size) })
    }

    /// Creates mailbox `id`, owned by `owner`, sized for `num_msg` messages
    /// of up to `msg_size` bytes.
    pub fn create_mailbox(
        &self,
        owner: ComponentId,
        id: ComponentId,
        num_msg: usize,
        msg_size: usize,
    ) -> Result<(), MboxError> {
        assert!(owner.is_valid(), "invalid owner {owner}");
        assert!(id.is_valid(), "invalid mailbox id {id}");
        let ring_len = ring::required_size(num_msg, msg_size);
        let ring_len_word = u32::try_from(ring_len).map_err(|_| MboxError::OutOfSpace {
            id,
            requested: HEADER_LEN + ring_len,
            available: self.pool().capacity(),
        })?;

        let all = self.locks.lock_all()?;
        let pool = self.pool_for_update(&all);
        pool.create_slot(id, HEADER_LEN + ring_len)?;

        let addr = pool.slot_addr(id).ok_or(MboxError::NotFound(id))?;
        let size = HEADER_LEN + ring_len;
        // SAFETY: freshly created slot of at least `size` bytes; every lock
        // is held.
        let bytes = unsafe { slice::from_raw_parts_mut(addr.as_ptr(), size) };
        let (head, rest) = bytes.split_at_mut(HEADER_LEN);
        head.fill(0);
        // SAFETY: aligned, zeroed, HEADER_LEN bytes.
        let header = unsafe { &mut *(head.as_mut_ptr() as *mut MailboxHeader) };
        header.owner = owner.0;
        header.ring_len = ring_len_word;

        if let Err(e) = RingStore::init(rest) {
            pool.delete_slot(id)?;
            return Err(e.into());
        }

        debug!(mailbox = %id, owner = %owner, num_msg, msg_size, bytes = size, "created mailbox");
        Ok(())
    }

    /// Deletes mailbox `id` and wakes any sender blocked on it.
    pub fn delete_mailbox(&self, id: ComponentId) -> Result<(), MboxError> {
        let all = self.locks.lock_all()?;
        let pool = self.pool_for_update(&all);

        let Some(addr) = pool.slot_addr(id) else {
            warn!(mailbox = %id, "delete of missing mailbox");
            return Err(MboxError::NotFound(id));
        };
        // SAFETY: every lock is held; the header sits at the start of the slot.
        let header = unsafe { &*(addr.as_ptr() as *const MailboxHeader) };
        let watchers: Vec<ComponentId> = ComponentId::all()
            .filter(|w| header.watchers[w.index()] != 0)
            .collect();

        pool.delete_slot(id)?;
        drop(all);

        for w in watchers {
            self.post(w);
        }
        debug!(mailbox = %id, "deleted mailbox");
        Ok(())
    }

    pub fn mailbox_exists(&self, id: ComponentId) -> Result<bool, MboxError> {
        let mut guard = self.locks.lock(id)?;
        Ok(self.mailbox(&mut guard).is_some())
    }

    /// Sends one message made of `segments` from `from` to mailbox `to`.
    ///
    /// Returns the payload size. In blocking mode a full mailbox makes the
    /// caller sleep until a receive on `to` happened, then retry; there is no
    /// way to abort such a wait other than a receive or deleting `to`.
    pub fn send(
        &self,
        from: ComponentId,
        to: ComponentId,
        mode: SendMode,
        mid: &Mid,
        segments: &[&[u8]],
    ) -> Result<usize, MboxError> {
        assert!(from.is_valid(), "invalid sender {from}");
        let mut stale_wakeups = 0u32;
        let outcome = self.send_locked(from, to, mode, mid, segments, &mut stale_wakeups);

        if let Ok((_, owner)) = &outcome {
            self.post(*owner);
        }
        for _ in 0..stale_wakeups {
            self.post(from);
        }

        match outcome {
            Ok((n, _)) => {
                trace!(mailbox = %to, sender = %from, bytes = n, "sent");
                Ok(n)
            }
            Err(e) => {
                if let MboxError::NotFound(_) = e {
                    warn!(mailbox = %to, sender = %from, "send to missing mailbox");
                }
                Err(e)
            }
        }
    }

    /// The locked part of `send`. Every lock is released on return; wakeups
    /// consumed without a receive on `to` are counted in `stale_wakeups`.
    fn send_locked(
        &self,
        from: ComponentId,
        to: ComponentId,
        mode: SendMode,
        mid: &Mid,
        segments: &[&[u8]],
        stale_wakeups: &mut u32,
    ) -> Result<(usize, ComponentId), MboxError> {
        let mut guard = self.locks.lock(to)?;
        let mut last_read: Option<u32> = None;

        loop {
            let step = match self.mailbox(&mut guard) {
                None => Step::Done(Err(MboxError::NotFound(to))),
                Some(mut mbox) => {
                    if last_read.is_some_and(|seen| seen == mbox.header.read_count) {
                        // not a receive on `to`: give this wakeup back later
                        *stale_wakeups += 1;
                        mbox.set_watcher(from, true);
                        Step::Wait
                    } else {
                        let put = mbox.store().and_then(|mut ring| ring.put(mid, segments));
                        match put {
                            Ok(n) => {
                                mbox.header.received_count = mbox.header.received_count.wrapping_add(1);
                                mbox.set_watcher(from, false);
                                Step::Done(Ok((n, mbox.owner())))
                            }
                            Err(RingError::NoSpace { needed, available })
                                if mode == SendMode::Blocking =>
                            {
                                debug!(mailbox = %to, sender = %from, needed, available, "mailbox full, waiting");
                                mbox.set_watcher(from, true);
                                last_read = Some(mbox.header.read_count);
                                Step::Wait
                            }
                            Err(e) => {
                                if matches!(e, RingError::NoSpace { .. }) {
                                    debug!(mailbox = %to, sender = %from, "mailbox full");
                                }
                                mbox.set_watcher(from, false);
                                Step::Done(Err(e.into()))
                            }
                        }
                    }
                }
            };

            match step {
                Step::Done(result) => return result,
                Step::Wait => {
                    drop(guard);
                    let woke = self.notify.wait_uninterrupted(from);
                    guard = match self.locks.lock(to) {
                        Ok(guard) => guard,
                        Err(e) => {
                            // only a destroyed lock set fails here; the watcher
                            // flag went with it
                            warn!(mailbox = %to, sender = %from, error = %e, "relock after wakeup failed");
                            return Err(e.into());
                        }
                    };
                    if let Err(e) = woke {
                        if let Some(mut mbox) = self.mailbox(&mut guard) {
                            mbox.set_watcher(from, false);
                        }
                        return Err(e.into());
                    }
                    trace!(mailbox = %to, sender = %from, "blocked sender woke up");
                }
            }
        }
    }

    /// Posts the wakeup semaphore of `id`. A failed post is logged, not
    /// returned: callers use it after their change is already visible.
    fn post(&self, id: ComponentId) {
        if let Err(e) = self.notify.notify(id) {
            error!(component = %id, error = %e, "failed to post wakeup");
        }
    }

    /// Takes the oldest message of mailbox `id` into `out`.
    ///
    /// `Ok(None)` means the mailbox was empty. Every call, even one that
    /// finds nothing or fails with `TooSmall`, counts as a read and wakes the
    /// watchers of `id`.
    pub fn receive(&self, id: ComponentId, out: &mut [u8]) -> Result<Option<(Mid, usize)>, MboxError> {
        let mut guard = self.locks.lock(id)?;
        let Some(mut mbox) = self.mailbox(&mut guard) else {
            warn!(mailbox = %id, "receive from missing mailbox");
            return Err(MboxError::NotFound(id));
        };

        let got = mbox.store().and_then(|mut ring| ring.get(out));
        mbox.header.read_count = mbox.header.read_count.wrapping_add(1);
        for w in mbox.watchers() {
            self.post(w);
        }
        drop(guard);

        if let Ok(Some((sender, n))) = &got {
            trace!(mailbox = %id, sender = %sender, bytes = n, "received");
        }
        got.map_err(Into::into)
    }

    /// Blocks until a mailbox of `set` changed or `timeout` elapsed.
    ///
    /// # Panics
    /// Panics if the set, or any live mailbox in it, is not owned by `waiter`.
    pub fn wait_one(
        &self,
        waiter: ComponentId,
        set: &MailboxSet,
        timeout: Option<Duration>,
    ) -> Result<(), MboxError> {
        assert_eq!(set.owner(), waiter, "mailbox set belongs to another component");
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            self.notify.wait(waiter, remaining)?;
            if self.set_has_unread(waiter, set)? {
                return Ok(());
            }
        }
    }

    fn set_has_unread(&self, waiter: ComponentId, set: &MailboxSet) -> Result<bool, MboxError> {
        let mut guards = self.locks.lock_sorted(set.as_slice())?;
        let mut unread = false;
        for guard in guards.iter_mut() {
            let id = guard.id();
            // a mailbox may vanish between wakeup and lock
            if let Some(mut mbox) = self.mailbox(guard) {
                assert_eq!(
                    mbox.owner(),
                    waiter,
                    "component {waiter} waits on mailbox {id} it does not own"
                );
                unread |= mbox.has_unread()?;
            }
        }
        Ok(unread)
    }

    /// Whether `watcher` is currently blocked sending into `mailbox`.
    pub fn is_watching(&self, mailbox: ComponentId, watcher: ComponentId) -> Result<bool, MboxError> {
        let mut guard = self.locks.lock(mailbox)?;
        let mbox = self.mailbox(&mut guard).ok_or(MboxError::NotFound(mailbox))?;
        Ok(mbox.header.watchers[watcher.index()] != 0)
    }

    pub fn mailbox_stats(&self, id: ComponentId) -> Result<MailboxStats, MboxError> {
        let mut guard = self.locks.lock(id)?;
        let slot_size = self.pool().slot_size(id).ok_or(MboxError::NotFound(id))?;
        let mut mbox = self.mailbox(&mut guard).ok_or(MboxError::NotFound(id))?;
        Self::stats_of(id, slot_size, &mut mbox)
    }

    fn stats_of(id: ComponentId, slot_size: usize, mbox: &mut Mailbox<'_>) -> Result<MailboxStats, MboxError> {
        let ring = mbox.store()?.stats();
        Ok(MailboxStats {
            id,
            owner: mbox.owner(),
            read_count: mbox.header.read_count,
            received_count: mbox.header.received_count,
            slot_size,
            ring,
        })
    }

    /// Consistent snapshot of every mailbox, taken with all locks held.
    pub fn snapshot(&self) -> Result<ArenaStats, MboxError> {
        let all = self.locks.lock_all()?;
        let pool = self.pool_for_update(&all);
        let mut mailboxes = Vec::new();
        for slot in pool.slots() {
            let Some(addr) = pool.slot_addr(slot.id) else {
                continue;
            };
            // SAFETY: every lock is held, so this is the only view.
            let mut mbox = unsafe { Mailbox::from_raw(addr, slot.size) };
            mailboxes.push(Self::stats_of(slot.id, slot.size, &mut mbox)?);
        }
        Ok(ArenaStats {
            capacity: pool.capacity(),
            used: pool.used(),
            mailboxes,
        })
    }
}
