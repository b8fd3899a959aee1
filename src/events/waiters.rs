use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, trace};

use crate::error::LinkError;
use crate::events::{Event, EventKind, WaitOutcome};
use crate::link::LinkCore;
use crate::routing::table::{EventWaiter, SharedTable};

#[derive(Clone)]
pub(crate) struct EventWaiters {
    core: Arc<LinkCore>,
}

impl EventWaiters {
    pub fn new(core: Arc<LinkCore>) -> EventWaiters {
        EventWaiters { core }
    }

    /// Waits for the next occurrence of an event kind. The subscription is single-shot, and it is
    ///  removed on every exit path including cancellation of the returned future.
    pub async fn wait_for(&self, kind: EventKind, timeout: Duration) -> Result<WaitOutcome, LinkError> {
        let (responder, receiver) = oneshot::channel();
        let id = {
            let mut table = self.core.table.lock();
            if table.disconnected {
                return match kind {
                    EventKind::Disconnect => Ok(WaitOutcome::Fired(Event::disconnect())),
                    _ => Err(LinkError::Connection("link is disconnected".to_string())),
                };
            }
            let id = table.next_id();
            table.waiters.entry(kind).or_default().push(EventWaiter { id, responder });
            id
        };
        let _subscription = Subscription { table: &self.core.table, kind, id };
        trace!("waiting for {:?} event for up to {:?}", kind, timeout);

        match time::timeout(timeout, receiver).await {
            Ok(Ok(Ok(event))) => Ok(WaitOutcome::Fired(event)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(LinkError::Connection("link closed while waiting for an event".to_string())),
            Err(_) => {
                debug!("no {:?} event within {:?}", kind, timeout);
                Ok(WaitOutcome::TimedOut)
            }
        }
    }
}

struct Subscription<'a> {
    table: &'a SharedTable,
    kind: EventKind,
    id: u64,
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.table.lock().remove_waiter(self.kind, self.id);
    }
}
