//! Operator-facing statistics dump.

use crate::arena::Arena;
use crate::error::MboxError;
use crate::id::ComponentId;
use crate::ring::{FILL_BUCKETS, RingStats};
use std::fmt;
use std::io;

/// Counters and ring statistics of one mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxStats {
    pub id: ComponentId,
    pub owner: ComponentId,
    pub read_count: u32,
    pub received_count: u32,
    pub slot_size: usize,
    pub ring: RingStats,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArenaStats {
    pub capacity: usize,
    pub used: usize,
    pub mailboxes: Vec<MailboxStats>,
}

impl fmt::Display for MailboxStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.ring;
        writeln!(
            f,
            "mailbox {} (owner {}): slot {} B, ring {} B, available {} B",
            self.id,
            self.owner,
            self.slot_size,
            r.ring_size,
            r.available()
        )?;
        writeln!(
            f,
            "  messages: {} sent, {} pending, {} rejected (received {}, reads {})",
            r.count, r.pending, r.reject_count, self.received_count, self.read_count
        )?;
        writeln!(
            f,
            "  size: avg {} B, min {} B, max {} B",
            r.avg_size, r.min_size, r.max_size
        )?;
        let pct = r.fill_percentages();
        write!(f, "  fill:")?;
        for bucket in 0..FILL_BUCKETS {
            write!(
                f,
                " {:>3}%:{}({:.1}%)",
                (bucket + 1) * 100 / FILL_BUCKETS,
                r.fill_histogram[bucket],
                pct[bucket]
            )?;
        }
        writeln!(f)
    }
}

impl fmt::Display for ArenaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "arena: {} of {} bytes used, {} mailbox(es)",
            self.used,
            self.capacity,
            self.mailboxes.len()
        )?;
        for mbox in &self.mailboxes {
            write!(f, "{mbox}")?;
        }
        Ok(())
    }
}

impl Arena {
    /// Writes a human-readable report of every mailbox to `out`.
    ///
    /// The snapshot is taken under the global lock; writing happens after the
    /// locks are released.
    pub fn dump_stats<W: io::Write>(&self, out: &mut W) -> Result<(), MboxError> {
        let stats = self.snapshot()?;
        tracing::info!(
            mailboxes = stats.mailboxes.len(),
            used = stats.used,
            capacity = stats.capacity,
            "mailbox stats dump"
        );
        write!(out, "{stats}")?;
        Ok(())
    }
}
