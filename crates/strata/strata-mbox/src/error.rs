use crate::id::ComponentId;
use std::{io, path::PathBuf};

/// Object pool allocator failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool memory too small: {size} bytes, header alone needs {needed}")]
    TooSmall { size: usize, needed: usize },

    #[error("pool memory is not 8-byte aligned")]
    Misaligned,

    #[error("invalid pool header: {0}")]
    BadHeader(&'static str),

    #[error("slot {0} already exists")]
    AlreadyExists(ComponentId),

    #[error("no space for slot {id}: {requested} bytes requested, {available} available")]
    OutOfSpace {
        id: ComponentId,
        requested: usize,
        available: usize,
    },

    #[error("slot {0} not found")]
    NotFound(ComponentId),
}

/// Ring buffer store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("ring full: frame needs {needed} bytes, {available} available")]
    NoSpace { needed: usize, available: usize },

    #[error("receive buffer too small: frame holds {needed} bytes, buffer has {provided}")]
    TooSmall { needed: usize, provided: usize },

    #[error("ring region too small: {size} bytes, need at least {needed}")]
    RegionTooSmall { size: usize, needed: usize },

    #[error("corrupt ring: {0}")]
    Corrupt(&'static str),
}

/// Semaphore set failures.
#[derive(Debug, thiserror::Error)]
pub enum SemError {
    #[error("semaphore set {key:#010x} is invalid: {reason}")]
    BadHeader { key: u32, reason: &'static str },

    #[error("wait timed out")]
    TimedOut,

    #[error("wait interrupted by a signal")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors surfaced by mailbox operations.
///
/// Capacity, existence and truncation failures from the pool and the ring
/// keep their meaning: `PoolError::NotFound` becomes `MboxError::NotFound`,
/// `RingError::NoSpace` becomes `MboxError::NoSpace`, and so on.
#[derive(Debug, thiserror::Error)]
pub enum MboxError {
    #[error("mailbox {0} not found")]
    NotFound(ComponentId),

    #[error("mailbox {0} already exists")]
    AlreadyExists(ComponentId),

    #[error("arena out of space for mailbox {id}: {requested} bytes requested, {available} available")]
    OutOfSpace {
        id: ComponentId,
        requested: usize,
        available: usize,
    },

    #[error("mailbox full: frame needs {needed} bytes, {available} available")]
    NoSpace { needed: usize, available: usize },

    #[error("receive buffer too small: frame holds {needed} bytes, buffer has {provided}")]
    TooSmall { needed: usize, provided: usize },

    #[error("message of {0} bytes is shorter than a message header")]
    ShortMessage(usize),

    #[error("wait timed out")]
    TimedOut,

    #[error("wait interrupted by a signal")]
    Interrupted,

    #[error("shared region '{}' already exists", .0.display())]
    ArenaExists(PathBuf),

    #[error(transparent)]
    Pool(PoolError),

    #[error(transparent)]
    Ring(RingError),

    #[error(transparent)]
    Sem(SemError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MboxError {
    /// True for failures a caller can recover from by waiting or retrying.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::NoSpace { .. } | Self::OutOfSpace { .. })
    }
}

impl From<PoolError> for MboxError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::NotFound(id) => Self::NotFound(id),
            PoolError::AlreadyExists(id) => Self::AlreadyExists(id),
            PoolError::OutOfSpace {
                id,
                requested,
                available,
            } => Self::OutOfSpace {
                id,
                requested,
                available,
            },
            other => Self::Pool(other),
        }
    }
}

impl From<RingError> for MboxError {
    fn from(e: RingError) -> Self {
        match e {
            RingError::NoSpace { needed, available } => Self::NoSpace { needed, available },
            RingError::TooSmall { needed, provided } => Self::TooSmall { needed, provided },
            other => Self::Ring(other),
        }
    }
}

impl From<SemError> for MboxError {
    fn from(e: SemError) -> Self {
        match e {
            SemError::TimedOut => Self::TimedOut,
            SemError::Interrupted => Self::Interrupted,
            SemError::Io(e) => Self::Io(e),
            other => Self::Sem(other),
        }
    }
}
