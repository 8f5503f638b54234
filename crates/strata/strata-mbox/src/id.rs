//! Component identifiers and sender metadata.
//!
//! A `ComponentId` names a daemon, a mailbox slot and a semaphore index at the
//! same time. The range is small and dense so every per-component table in
//! shared memory is a flat array indexed by `id.0`.

use std::fmt;

pub const FIRST_ID: u16 = 0;
pub const LAST_ID: u16 = 63;

/// Size of every per-component table (slot table, both semaphore sets,
/// watcher flags).
pub const NUM_COMPONENTS: usize = (LAST_ID - FIRST_ID + 1) as usize;

#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentId(pub u16);

impl ComponentId {
    pub const ADMIND: Self = Self(0);
    pub const CMSGD: Self = Self(1);
    pub const CSUPD: Self = Self(2);
    pub const VRT: Self = Self(3);
    pub const VRT_EVENTS: Self = Self(4);
    pub const NBD_SERVER: Self = Self(5);
    pub const NBD_CLIENT: Self = Self(6);
    pub const ISCSI: Self = Self(7);
    pub const LUM: Self = Self(8);
    pub const TOKEN_MANAGER: Self = Self(9);
    pub const MONITORD: Self = Self(10);
    pub const LOGD: Self = Self(11);

    /// First of the ids reserved for tests and ad-hoc tools.
    pub const TEST_FIRST: Self = Self(48);
    pub const TEST_LAST: Self = Self(LAST_ID);

    /// Sentinel for an unused mailbox-set slot. Sorts after every valid id.
    pub const NONE: Self = Self(u16::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        (FIRST_ID..=LAST_ID).contains(&self.0)
    }

    /// Table index for this id.
    ///
    /// # Panics
    /// Panics on an id outside `[FIRST_ID, LAST_ID]`; that is a caller bug.
    #[inline]
    pub fn index(self) -> usize {
        assert!(self.is_valid(), "invalid component id {}", self.0);
        (self.0 - FIRST_ID) as usize
    }

    pub fn all() -> impl DoubleEndedIterator<Item = ComponentId> {
        (FIRST_ID..=LAST_ID).map(ComponentId)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            f.write_str("none")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Cluster node number. Node 0 is the local machine.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u32);

/// Message identifier: who sent a frame.
///
/// Stored as the fixed prefix of every frame so a forwarder relaying messages
/// from another node can keep the original sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Mid {
    pub id: ComponentId,
    pub node: NodeId,
}

impl Mid {
    /// Encoded size: id (2) + reserved (2) + node (4).
    pub const ENCODED_LEN: usize = 8;

    pub fn local(id: ComponentId) -> Self {
        Self {
            id,
            node: NodeId::default(),
        }
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..2].copy_from_slice(&self.id.0.to_le_bytes());
        out[4..8].copy_from_slice(&self.node.0.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; Self::ENCODED_LEN]) -> Self {
        Self {
            id: ComponentId(u16::from_le_bytes([bytes[0], bytes[1]])),
            node: NodeId(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])),
        }
    }
}

impl fmt::Display for Mid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.node.0)
    }
}
