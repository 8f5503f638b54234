//! Per-component handle: the component's own mailboxes, the set it waits
//! on, and typed messages.
//!
//! Every message an endpoint sends starts with a [`MsgHeader`], written as a
//! separate segment so the body is never copied before it reaches the ring.

use crate::arena::Arena;
use crate::error::MboxError;
use crate::id::{ComponentId, Mid};
use crate::mailbox::SendMode;
use crate::mailbox_set::MailboxSet;
use std::fmt;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MsgType(pub u16);

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Leading bytes of every endpoint message: `[msg_type u16 LE][flags u16 LE]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgHeader {
    pub msg_type: MsgType,
    pub flags: u16,
}

impl MsgHeader {
    pub const ENCODED_LEN: usize = 4;

    pub fn new(msg_type: MsgType) -> Self {
        Self { msg_type, flags: 0 }
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..2].copy_from_slice(&self.msg_type.0.to_le_bytes());
        out[2..4].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Splits a received payload into its header and body.
    pub fn decode(payload: &[u8]) -> Option<(Self, &[u8])> {
        let (head, body) = payload.split_first_chunk::<{ Self::ENCODED_LEN }>()?;
        let header = Self {
            msg_type: MsgType(u16::from_le_bytes([head[0], head[1]])),
            flags: u16::from_le_bytes([head[2], head[3]]),
        };
        Some((header, body))
    }
}

/// One message taken out of an endpoint's mailboxes. `body` borrows the
/// endpoint's receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Received<'a> {
    pub mailbox: ComponentId,
    pub from: Mid,
    pub header: MsgHeader,
    pub body: &'a [u8],
}

pub struct Endpoint<'a> {
    arena: &'a Arena,
    id: ComponentId,
    set: MailboxSet,
    buf: Vec<u8>,
}

impl<'a> Endpoint<'a> {
    /// Creates mailbox `id` owned by `id`, sized for `num_msg` bodies of up
    /// to `msg_size` bytes, and starts waiting on it.
    pub fn open(arena: &'a Arena, id: ComponentId, num_msg: usize, msg_size: usize) -> Result<Self, MboxError> {
        let mut ep = Self {
            arena,
            id,
            set: MailboxSet::new(id),
            buf: Vec::new(),
        };
        ep.add_mailbox(id, num_msg, msg_size)?;
        Ok(ep)
    }

    /// Creates another mailbox owned by this component, e.g. a separate
    /// event queue, and adds it to the wait set.
    pub fn add_mailbox(&mut self, mailbox: ComponentId, num_msg: usize, msg_size: usize) -> Result<(), MboxError> {
        let payload = MsgHeader::ENCODED_LEN + msg_size;
        self.arena.create_mailbox(self.id, mailbox, num_msg, payload)?;
        self.set.add(mailbox);
        if self.buf.len() < payload {
            self.buf.resize(payload, 0);
        }
        debug!(component = %self.id, mailbox = %mailbox, "endpoint mailbox added");
        Ok(())
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn mailboxes(&self) -> &MailboxSet {
        &self.set
    }

    /// Sends `body` to mailbox `to`, waiting while it is full.
    pub fn send_msg(&self, to: ComponentId, msg_type: MsgType, body: &[u8]) -> Result<usize, MboxError> {
        self.send_with(SendMode::Blocking, to, msg_type, body)
    }

    /// Like [`send_msg`](Self::send_msg) but fails with `NoSpace` instead of
    /// waiting.
    pub fn try_send_msg(&self, to: ComponentId, msg_type: MsgType, body: &[u8]) -> Result<usize, MboxError> {
        self.send_with(SendMode::NonBlocking, to, msg_type, body)
    }

    fn send_with(&self, mode: SendMode, to: ComponentId, msg_type: MsgType, body: &[u8]) -> Result<usize, MboxError> {
        let header = MsgHeader::new(msg_type).encode();
        let mid = Mid::local(self.id);
        self.arena.send(self.id, to, mode, &mid, &[&header, body])
    }

    /// Takes the oldest message of the first non-empty owned mailbox, in
    /// ascending mailbox order.
    ///
    /// Senders are not held to the size the mailbox was created for, so a
    /// frame that does not fit grows the receive buffer and is read again.
    pub fn recv_msg(&mut self) -> Result<Option<Received<'_>>, MboxError> {
        let mut found = None;
        for mailbox in self.set.iter() {
            let got = loop {
                match self.arena.receive(mailbox, &mut self.buf) {
                    Err(MboxError::TooSmall { needed, provided }) => {
                        debug!(component = %self.id, mailbox = %mailbox, needed, provided, "growing receive buffer");
                        self.buf.resize(needed, 0);
                    }
                    other => break other?,
                }
            };
            if let Some((from, len)) = got {
                found = Some((mailbox, from, len));
                break;
            }
        }
        let Some((mailbox, from, len)) = found else {
            return Ok(None);
        };
        let (header, body) = MsgHeader::decode(&self.buf[..len]).ok_or(MboxError::ShortMessage(len))?;
        Ok(Some(Received {
            mailbox,
            from,
            header,
            body,
        }))
    }

    /// Blocks until one of the owned mailboxes has unread messages.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), MboxError> {
        self.arena.wait_one(self.id, &self.set, timeout)
    }

    /// Deletes every mailbox this endpoint created.
    pub fn close(self) -> Result<(), MboxError> {
        for mailbox in self.set.iter() {
            self.arena.delete_mailbox(mailbox)?;
        }
        debug!(component = %self.id, "endpoint closed");
        Ok(())
    }
}
