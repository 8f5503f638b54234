//! The machine-wide shared state: the pool region and both semaphore sets.
//!
//! One bootstrapping process calls [`Arena::create_all`]; every other process
//! calls [`Arena::map_all`] with the same configuration. Teardown mirrors
//! that: [`Arena::delete_all`] by the bootstrapper, [`Arena::unmap_all`] (or
//! drop) everywhere else.

use crate::error::{MboxError, SemError};
use crate::pool::ObjectPool;
use crate::sem::{AllLocksGuard, MailboxLocks, Notifier};
use std::io;
use std::path::{Path, PathBuf};
use strata_config::MboxConfig;
use strata_mmap::MmapFileMut;
use tracing::{debug, info};

pub struct Arena {
    /// Owns the mapping `pool` points into.
    _mm: MmapFileMut,
    pool: ObjectPool,
    pub(crate) locks: MailboxLocks,
    pub(crate) notify: Notifier,
    paths: [PathBuf; 3],
}

// SAFETY: the pool is only touched while holding mailbox locks: a single
// mailbox lock for that mailbox's bytes, every lock for slot table changes.
// The semaphore sets are thread-safe.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Creates the arena and both semaphore sets. Fails with
    /// [`MboxError::ArenaExists`] if any of them already exists.
    pub fn create_all(cfg: &MboxConfig) -> Result<Self, MboxError> {
        let arena_path = cfg.arena_path();
        let lock_path = cfg.lock_sem_path();
        let wait_path = cfg.wait_sem_path();

        let mut mm = MmapFileMut::create_new_rw(&arena_path, cfg.arena_size as u64)
            .map_err(|e| exists_or(e, &arena_path))?;

        // SAFETY: the mapping lives in `Arena` alongside the pool handle.
        let pool = match unsafe { ObjectPool::init(mm.as_mut_ptr(), mm.len()) } {
            Ok(pool) => pool,
            Err(e) => {
                let _ = strata_mmap::remove(&arena_path);
                return Err(e.into());
            }
        };

        let locks = match MailboxLocks::create(&lock_path, cfg.lock_sem_key) {
            Ok(locks) => locks,
            Err(e) => {
                let _ = strata_mmap::remove(&arena_path);
                return Err(sem_exists_or(e, &lock_path));
            }
        };

        let notify = match Notifier::create(&wait_path, cfg.wait_sem_key) {
            Ok(notify) => notify,
            Err(e) => {
                let _ = locks.destroy();
                let _ = strata_mmap::remove(&lock_path);
                let _ = strata_mmap::remove(&arena_path);
                return Err(sem_exists_or(e, &wait_path));
            }
        };

        info!(
            arena = %arena_path.display(),
            size = cfg.arena_size,
            lock_key = format_args!("{:#010x}", cfg.lock_sem_key),
            wait_key = format_args!("{:#010x}", cfg.wait_sem_key),
            "created mailbox arena"
        );

        Ok(Self {
            _mm: mm,
            pool,
            locks,
            notify,
            paths: [arena_path, lock_path, wait_path],
        })
    }

    /// Attaches to an arena created by another process.
    pub fn map_all(cfg: &MboxConfig) -> Result<Self, MboxError> {
        let arena_path = cfg.arena_path();
        let lock_path = cfg.lock_sem_path();
        let wait_path = cfg.wait_sem_path();

        let mut mm = MmapFileMut::open_rw(&arena_path)?;
        // SAFETY: as in create_all.
        let pool = unsafe { ObjectPool::attach(mm.as_mut_ptr(), mm.len()) }?;
        let locks = MailboxLocks::open(&lock_path, cfg.lock_sem_key)?;
        let notify = Notifier::open(&wait_path, cfg.wait_sem_key)?;

        debug!(arena = %arena_path.display(), "mapped mailbox arena");

        Ok(Self {
            _mm: mm,
            pool,
            locks,
            notify,
            paths: [arena_path, lock_path, wait_path],
        })
    }

    /// Destroys the semaphores and removes every backing file. Processes that
    /// still have the arena mapped must not use it afterwards.
    pub fn delete_all(self) -> Result<(), MboxError> {
        let Self {
            _mm,
            pool,
            locks,
            notify,
            paths,
        } = self;
        drop(pool);
        drop(_mm);
        locks.destroy()?;
        notify.destroy()?;
        for path in &paths {
            strata_mmap::remove(path)?;
        }
        info!(arena = %paths[0].display(), "deleted mailbox arena");
        Ok(())
    }

    /// Drops this process' mappings; the shared state stays.
    pub fn unmap_all(self) {
        debug!(arena = %self.paths[0].display(), "unmapped mailbox arena");
    }

    pub fn arena_path(&self) -> &Path {
        &self.paths[0]
    }

    /// The pool for lookups of a single slot. Callers hold that slot's lock.
    pub(crate) fn pool(&self) -> &ObjectPool {
        &self.pool
    }

    /// The pool for structural changes, reachable only with every lock held.
    pub(crate) fn pool_for_update<'g>(&'g self, _all: &'g AllLocksGuard<'_>) -> &'g ObjectPool {
        &self.pool
    }
}

fn exists_or(e: io::Error, path: &Path) -> MboxError {
    if e.kind() == io::ErrorKind::AlreadyExists {
        MboxError::ArenaExists(path.to_path_buf())
    } else {
        MboxError::Io(e)
    }
}

fn sem_exists_or(e: SemError, path: &Path) -> MboxError {
    match e {
        SemError::Io(io) => exists_or(io, path),
        other => other.into(),
    }
}
