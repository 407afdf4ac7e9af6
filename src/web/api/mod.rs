//! API endpoints module.

pub mod events;
pub mod minds;

pub use events::{conversation_events, stream_events};
pub use minds::{
    deliver, list_minds, report_event, sleep_mind, start_mind, stop_mind, wake_mind, ApiError,
};
