//! Process-shared counting semaphores, one per component id.
//!
//! A [`SemSet`] is a small file-backed region holding `NUM_COMPONENTS` POSIX
//! semaphores initialised with `pshared = 1`, so any process mapping the same
//! file waits on and posts the same kernel objects.
//!
//! Two wrappers give the two sets their meaning:
//! - [`MailboxLocks`]: binary semaphores used as mutexes. Holding one is
//!   represented by a guard; holding all of them by an [`AllLocksGuard`] that
//!   can only be built by taking every lock in ascending id order.
//! - [`Notifier`]: wakeup counters with no ownership. Anyone may post, only
//!   the component itself waits on its own entry.

use crate::error::SemError;
use crate::id::{ComponentId, NUM_COMPONENTS};
use crate::shm_layout::{SEM_MAGIC, SEM_VERSION, SemSetHeader, bytes_for_sem_set, sem_array_offset};
use std::io;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{Ordering, fence};
use std::time::Duration;
use strata_mmap::MmapFileMut;

pub struct SemSet {
    _mm: MmapFileMut,
    base: *mut u8,
    key: u32,
}

// SAFETY: sem_* calls are thread-safe and the header is read-only after
// creation.
unsafe impl Send for SemSet {}
unsafe impl Sync for SemSet {}

impl SemSet {
    /// Creates the set at `path` (which must not exist) with every semaphore
    /// at `initial`.
    pub fn create<P: AsRef<Path>>(path: P, key: u32, initial: u32) -> Result<Self, SemError> {
        let mut mm = MmapFileMut::create_new_rw(path, bytes_for_sem_set() as u64)?;
        let base = mm.as_mut_ptr();
        let set = Self { _mm: mm, base, key };

        for id in ComponentId::all() {
            // SAFETY: the slot lies within the freshly mapped region.
            let rc = unsafe { libc::sem_init(set.sem(id), 1, initial) };
            if rc != 0 {
                return Err(io::Error::last_os_error().into());
            }
        }

        // SAFETY: the header lies at the start of the region we own.
        unsafe {
            let h = base as *mut SemSetHeader;
            ptr::addr_of_mut!((*h).version).write(SEM_VERSION);
            ptr::addr_of_mut!((*h).count).write(NUM_COMPONENTS as u32);
            ptr::addr_of_mut!((*h).key).write(key);
            // openers validate the magic; publish it last
            fence(Ordering::Release);
            ptr::addr_of_mut!((*h).magic).write_volatile(SEM_MAGIC);
        }

        Ok(set)
    }

    /// Maps a set some other process created.
    pub fn open<P: AsRef<Path>>(path: P, key: u32) -> Result<Self, SemError> {
        let mut mm = MmapFileMut::open_rw(path)?;
        if mm.len() < bytes_for_sem_set() {
            return Err(SemError::BadHeader {
                key,
                reason: "region too small",
            });
        }
        let base = mm.as_mut_ptr();

        // SAFETY: region is at least as large as the header.
        let h = unsafe { &*(base as *const SemSetHeader) };
        fence(Ordering::Acquire);
        h.validate(key)
            .map_err(|reason| SemError::BadHeader { key, reason })?;

        Ok(Self { _mm: mm, base, key })
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    #[inline(always)]
    fn sem(&self, id: ComponentId) -> *mut libc::sem_t {
        let idx = id.index();
        // SAFETY: idx < NUM_COMPONENTS, the array fits in the region.
        unsafe { (self.base.add(sem_array_offset()) as *mut libc::sem_t).add(idx) }
    }

    pub fn post(&self, id: ComponentId) -> Result<(), SemError> {
        // SAFETY: initialised process-shared semaphore.
        if unsafe { libc::sem_post(self.sem(id)) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Blocks until the count of `id` can be decremented.
    pub fn wait(&self, id: ComponentId) -> Result<(), SemError> {
        // SAFETY: as above.
        if unsafe { libc::sem_wait(self.sem(id)) } != 0 {
            return Err(classify(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Decrements if possible without blocking. Returns whether it did.
    pub fn try_wait(&self, id: ComponentId) -> Result<bool, SemError> {
        // SAFETY: as above.
        if unsafe { libc::sem_trywait(self.sem(id)) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(false);
            }
            return Err(classify(err));
        }
        Ok(true)
    }

    pub fn timed_wait(&self, id: ComponentId, timeout: Duration) -> Result<(), SemError> {
        let deadline = realtime_deadline(timeout);
        // SAFETY: as above; deadline is a valid timespec.
        if unsafe { libc::sem_timedwait(self.sem(id), &deadline) } != 0 {
            return Err(classify(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Current count of `id`.
    pub fn value(&self, id: ComponentId) -> Result<u32, SemError> {
        let mut v: libc::c_int = 0;
        // SAFETY: as above.
        if unsafe { libc::sem_getvalue(self.sem(id), &mut v) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(v.max(0) as u32)
    }

    /// Destroys every semaphore. Other processes must have stopped using the
    /// set; the backing file is left for the caller to remove.
    pub fn destroy(self) -> Result<(), SemError> {
        for id in ComponentId::all() {
            // SAFETY: as above.
            if unsafe { libc::sem_destroy(self.sem(id)) } != 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }
}

fn classify(err: io::Error) -> SemError {
    match err.raw_os_error() {
        Some(libc::EINTR) => SemError::Interrupted,
        Some(libc::ETIMEDOUT) => SemError::TimedOut,
        _ => SemError::Io(err),
    }
}

/// `sem_timedwait` takes an absolute CLOCK_REALTIME deadline.
fn realtime_deadline(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: valid out-pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

    let mut sec = now.tv_sec as i64 + timeout.as_secs() as i64;
    let mut nsec = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec as _,
        tv_nsec: nsec as _,
    }
}

/// Per-mailbox mutual exclusion.
pub struct MailboxLocks {
    set: SemSet,
}

/// Holds the lock of one mailbox; released on drop.
pub struct MailboxGuard<'a> {
    locks: &'a MailboxLocks,
    id: ComponentId,
}

/// Holds every mailbox lock. Only [`MailboxLocks::lock_all`] builds one, so
/// owning it proves the locks were taken in the single global order.
pub struct AllLocksGuard<'a> {
    locks: &'a MailboxLocks,
}

impl MailboxLocks {
    pub fn create<P: AsRef<Path>>(path: P, key: u32) -> Result<Self, SemError> {
        Ok(Self {
            set: SemSet::create(path, key, 1)?,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, key: u32) -> Result<Self, SemError> {
        Ok(Self {
            set: SemSet::open(path, key)?,
        })
    }

    pub fn destroy(self) -> Result<(), SemError> {
        self.set.destroy()
    }

    fn acquire(&self, id: ComponentId) -> Result<(), SemError> {
        loop {
            match self.set.wait(id) {
                Err(SemError::Interrupted) => continue,
                other => return other,
            }
        }
    }

    fn release(&self, id: ComponentId) {
        if let Err(e) = self.set.post(id) {
            tracing::error!(mailbox = %id, error = %e, "failed to release mailbox lock");
        }
    }

    pub fn lock(&self, id: ComponentId) -> Result<MailboxGuard<'_>, SemError> {
        self.acquire(id)?;
        Ok(MailboxGuard { locks: self, id })
    }

    /// Locks `ids`, which must be strictly ascending. Sentinel entries
    /// (`ComponentId::NONE`) are skipped.
    pub fn lock_sorted(&self, ids: &[ComponentId]) -> Result<Vec<MailboxGuard<'_>>, SemError> {
        let live: Vec<ComponentId> = ids
            .iter()
            .copied()
            .filter(|&id| id != ComponentId::NONE)
            .collect();
        assert!(
            live.windows(2).all(|w| w[0] < w[1]),
            "mailbox locks must be taken in ascending order: {live:?}"
        );

        let mut guards = Vec::with_capacity(live.len());
        for id in live {
            // on error the guards taken so far unlock on drop
            guards.push(self.lock(id)?);
        }
        Ok(guards)
    }

    pub fn lock_all(&self) -> Result<AllLocksGuard<'_>, SemError> {
        let mut taken = Vec::with_capacity(NUM_COMPONENTS);
        for id in ComponentId::all() {
            if let Err(e) = self.acquire(id) {
                for &held in taken.iter().rev() {
                    self.release(held);
                }
                return Err(e);
            }
            taken.push(id);
        }
        Ok(AllLocksGuard { locks: self })
    }
}

impl MailboxGuard<'_> {
    pub fn id(&self) -> ComponentId {
        self.id
    }
}

impl Drop for MailboxGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(self.id);
    }
}

impl Drop for AllLocksGuard<'_> {
    fn drop(&mut self) {
        for id in ComponentId::all().rev() {
            self.locks.release(id);
        }
    }
}

/// Per-component wakeup channel.
pub struct Notifier {
    set: SemSet,
}

impl Notifier {
    pub fn create<P: AsRef<Path>>(path: P, key: u32) -> Result<Self, SemError> {
        Ok(Self {
            set: SemSet::create(path, key, 0)?,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, key: u32) -> Result<Self, SemError> {
        Ok(Self {
            set: SemSet::open(path, key)?,
        })
    }

    pub fn destroy(self) -> Result<(), SemError> {
        self.set.destroy()
    }

    /// Wakes `id` (or lets its next wait return at once).
    pub fn notify(&self, id: ComponentId) -> Result<(), SemError> {
        self.set.post(id)
    }

    /// Consumes one wakeup of `id`, blocking up to `timeout` (forever if
    /// `None`). A pending wakeup is taken even with a zero timeout.
    pub fn wait(&self, id: ComponentId, timeout: Option<Duration>) -> Result<(), SemError> {
        match timeout {
            None => self.set.wait(id),
            Some(t) => {
                if self.set.try_wait(id)? {
                    return Ok(());
                }
                if t.is_zero() {
                    return Err(SemError::TimedOut);
                }
                self.set.timed_wait(id, t)
            }
        }
    }

    /// Like `wait(id, None)` but retries when a signal interrupts the wait.
    pub fn wait_uninterrupted(&self, id: ComponentId) -> Result<(), SemError> {
        loop {
            match self.set.wait(id) {
                Err(SemError::Interrupted) => continue,
                other => return other,
            }
        }
    }

    /// Wakeups queued for `id`.
    pub fn pending(&self, id: ComponentId) -> Result<u32, SemError> {
        self.set.value(id)
    }
}
