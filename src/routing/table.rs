use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};

use crate::error::LinkError;
use crate::events::{Event, EventKind};
use crate::link::Response;
use crate::transfer::{TransferDirection, TransferState};

pub type LogHandler = Arc<dyn Fn(&str) + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identifies a registered log or event handler so it can be removed again.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct HandlerId(pub(crate) u64);

pub(crate) struct PendingRequest {
    pub id: u64,
    pub responder: oneshot::Sender<Result<Response, LinkError>>,
    pub logs: Vec<String>,
    /// the transfer this request initiates, if any
    pub initiates_transfer: Option<u64>,
}

pub(crate) struct EventWaiter {
    pub id: u64,
    pub responder: oneshot::Sender<Result<Event, LinkError>>,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum TransferEvent {
    Data(Bytes),
    Ack(u64),
    End,
    Failed(LinkError),
}

pub(crate) struct TransferEntry {
    pub id: u64,
    pub direction: TransferDirection,
    pub state: TransferState,
    pub expected_len: Option<u64>,
    pub received_len: u64,
    pub received_chunks: u32,
    pub events: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferEntry {
    /// A download that received all of its data only waits for the reader to consume the end of
    ///  stream; nothing arriving on the link can fail it any more.
    pub fn is_in_flight(&self) -> bool {
        self.state.is_live() && !(self.direction == TransferDirection::Download && self.state == TransferState::Completing)
    }

    pub fn fail(&mut self, error: LinkError) {
        self.state = TransferState::Failed;
        let _ = self.events.send(TransferEvent::Failed(error));
    }
}

/// Everything inbound messages can be routed to. Inbound processing must never suspend, so the
///  table is guarded by a synchronous lock that is never held across an `.await`.
#[derive(Default)]
pub(crate) struct RoutingTable {
    pub disconnected: bool,
    pub pending: Option<PendingRequest>,
    pub transfer: Option<TransferEntry>,
    pub waiters: FxHashMap<EventKind, Vec<EventWaiter>>,
    pub log_handlers: Vec<(HandlerId, LogHandler)>,
    pub event_handlers: Vec<(HandlerId, EventKind, EventHandler)>,
    next_id: u64,
}

impl RoutingTable {
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn transfer_mut(&mut self, id: u64) -> Option<&mut TransferEntry> {
        self.transfer.as_mut()
            .filter(|t| t.id == id)
    }

    pub fn remove_transfer(&mut self, id: u64) -> Option<TransferEntry> {
        if self.transfer.as_ref().is_some_and(|t| t.id == id) {
            self.transfer.take()
        }
        else {
            None
        }
    }

    pub fn remove_waiter(&mut self, kind: EventKind, id: u64) {
        if let Some(waiters) = self.waiters.get_mut(&kind) {
            waiters.retain(|w| w.id != id);
            if waiters.is_empty() {
                self.waiters.remove(&kind);
            }
        }
    }

    pub fn num_waiters(&self, kind: EventKind) -> usize {
        self.waiters.get(&kind)
            .map(|w| w.len())
            .unwrap_or(0)
    }
}

#[derive(Clone, Default)]
pub(crate) struct SharedTable(Arc<Mutex<RoutingTable>>);

impl SharedTable {
    pub fn lock(&self) -> MutexGuard<'_, RoutingTable> {
        self.0.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
