mod arena;
mod endpoint;
mod error;
mod id;
mod mailbox;
mod mailbox_set;
mod pool;
mod ring;
mod sem;
mod shm_layout;
mod stats;

pub use arena::Arena;
pub use endpoint::{Endpoint, MsgHeader, MsgType, Received};
pub use error::{MboxError, PoolError, RingError, SemError};
pub use id::{ComponentId, FIRST_ID, LAST_ID, Mid, NUM_COMPONENTS, NodeId};
pub use mailbox::{SendMode, mailbox_size};
pub use mailbox_set::{MAILBOX_SET_CAPACITY, MailboxSet};
pub use pool::{ObjectPool, SlotInfo};
pub use ring::{FILL_BUCKETS, FRAME_OVERHEAD, RingStats, RingStore, required_size};
pub use sem::{AllLocksGuard, MailboxGuard, MailboxLocks, Notifier, SemSet};
pub use stats::{ArenaStats, MailboxStats};
pub use strata_config::MboxConfig;
