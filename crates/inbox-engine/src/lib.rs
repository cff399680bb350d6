//! Triage pipeline: the poll loop, push-event fan-out, the ask service and
//! inbox reset.

pub mod ask;
pub mod broadcast;
pub mod poller;
pub mod reset;

pub use ask::{AskError, AskService};
pub use broadcast::{EventBroadcaster, Subscription};
pub use poller::{CycleOutcome, CycleReport, PollConfig, PollHandle, PollLoop, PollTrigger};
pub use reset::reset_inbox;
