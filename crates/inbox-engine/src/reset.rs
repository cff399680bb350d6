use tracing::warn;

use inbox_core::PushEvent;
use inbox_store::{EmailRepo, StoreError};

use crate::broadcast::EventBroadcaster;
use crate::poller::PollHandle;

/// Clear every stored email and the poll cursor, announce it, and ask the
/// poll loop to start over. Returns the number of records deleted.
pub fn reset_inbox(
    repo: &EmailRepo,
    broadcaster: &EventBroadcaster,
    poll: &PollHandle,
) -> Result<u64, StoreError> {
    let deleted = repo.reset()?;
    let _ = broadcaster.publish(PushEvent::Reset { deleted });
    if !poll.trigger() {
        warn!("poll loop is not running; reset will not be followed by a poll");
    }
    Ok(deleted)
}
