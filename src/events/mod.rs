//! In-process event fabric: keyed buses, event families, and client streams.

pub mod bus;
pub mod stream;
pub mod types;

pub use bus::{EventBus, Subscription};
pub use stream::{
    ActivityLog, EventSequencer, EventStream, PageSummary, SequencedEvent, Snapshot,
    SnapshotSource, StreamEvent,
};
pub use types::{
    ActivityEvent, ActivityKind, ConversationEvent, EventHub, GlobalTopic, LifecycleState,
    MindEvent, Role,
};
