//! The mailboxes one component waits on.

use crate::id::ComponentId;

/// Mailboxes a single `MailboxSet` can hold.
pub const MAILBOX_SET_CAPACITY: usize = 2;

/// Owner-scoped, sorted set of mailbox ids.
///
/// Unused entries hold [`ComponentId::NONE`], which sorts after every real
/// id, so the array is always in the ascending order `lock_sorted` needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxSet {
    owner: ComponentId,
    ids: [ComponentId; MAILBOX_SET_CAPACITY],
}

impl MailboxSet {
    pub fn new(owner: ComponentId) -> Self {
        assert!(owner.is_valid(), "invalid set owner {owner}");
        Self {
            owner,
            ids: [ComponentId::NONE; MAILBOX_SET_CAPACITY],
        }
    }

    pub fn owner(&self) -> ComponentId {
        self.owner
    }

    /// Adds `id`, keeping the set sorted. Adding a member again does nothing.
    ///
    /// # Panics
    /// Panics on an invalid id or when the set is full.
    pub fn add(&mut self, id: ComponentId) {
        assert!(id.is_valid(), "invalid mailbox id {id}");
        let len = self.len();
        let pos = match self.ids[..len].binary_search(&id) {
            Ok(_) => return,
            Err(pos) => pos,
        };
        assert!(
            len < MAILBOX_SET_CAPACITY,
            "mailbox set of {} is full",
            self.owner
        );
        self.ids.copy_within(pos..len, pos + 1);
        self.ids[pos] = id;
    }

    /// Removes `id`; returns whether it was a member.
    pub fn remove(&mut self, id: ComponentId) -> bool {
        let len = self.len();
        let Ok(pos) = self.ids[..len].binary_search(&id) else {
            return false;
        };
        self.ids.copy_within(pos + 1..len, pos);
        self.ids[len - 1] = ComponentId::NONE;
        true
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        id.is_valid() && self.as_slice().binary_search(&id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.ids
            .iter()
            .position(|id| *id == ComponentId::NONE)
            .unwrap_or(MAILBOX_SET_CAPACITY)
    }

    pub fn is_empty(&self) -> bool {
        self.ids[0] == ComponentId::NONE
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.as_slice().iter().copied()
    }

    pub fn as_slice(&self) -> &[ComponentId] {
        &self.ids[..self.len()]
    }
}
