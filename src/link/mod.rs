//! A connected link and everything that runs on it: the outbound writer, the inbound receive loop,
//!  request / response correlation, bulk transfers and event waiters.

mod correlator;
mod receive_loop;
mod writer;

pub use correlator::Response;
pub(crate) use correlator::Correlator;
pub(crate) use writer::OutboundWriter;

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BusyPolicy, LinkConfig};
use crate::error::LinkError;
use crate::events::{Event, EventKind, EventWaiters, WaitOutcome};
use crate::protocol::{signal, Chunker, MessageKind, StreamFrame};
use crate::routing::{HandlerId, Router};
use crate::routing::table::SharedTable;
use crate::stats::{LinkStats, LinkStatsSnapshot};
use crate::transfer::{DownloadHandle, ResourceId, TransferManager, UploadHandle};
use crate::transport::{Connection, Transport};

/// State shared by everything operating on a single link.
pub(crate) struct LinkCore {
    pub config: LinkConfig,
    pub peer: String,
    pub table: SharedTable,
    pub router: Router,
    pub writer: OutboundWriter,
    /// the single pending request
    pub request_slot: Arc<Semaphore>,
    /// the single active transfer
    pub transfer_slot: Arc<Semaphore>,
    pub stats: Arc<LinkStats>,
}

impl LinkCore {
    /// Resolves everything pending with a connection error, and makes all future operations
    ///  fail. Returns `false` if the link was shut down already.
    pub fn shutdown(&self, reason: &str) -> bool {
        self.request_slot.close();
        self.transfer_slot.close();
        self.router.route_disconnect(reason)
    }

    pub fn is_connected(&self) -> bool {
        !self.table.lock().disconnected
    }

    pub async fn send_message(&self, kind: MessageKind, error: bool, payload: &[u8]) -> Result<(), LinkError> {
        let result = self.writer.send_message(kind, error, payload).await;
        self.after_send(result).await
    }

    pub async fn send_stream_frame(&self, frame: &StreamFrame) -> Result<(), LinkError> {
        let result = self.writer.send_stream_frame(frame).await;
        self.after_send(result).await
    }

    pub async fn send_signal(&self, signal: u8) -> Result<(), LinkError> {
        let result = self.writer.send_signal(signal).await;
        self.after_send(result).await
    }

    /// A failed write leaves the device with a partial message, and the link is unusable. This
    ///  resolves everything pending right away instead of waiting for the transport to report
    ///  the loss.
    async fn after_send(&self, result: Result<(), LinkError>) -> Result<(), LinkError> {
        if let Err(e) = &result {
            if self.shutdown(&format!("sending failed: {}", e)) {
                warn!("closing link to {} after a failed write", self.peer);
                if let Err(e) = self.writer.close().await {
                    debug!("error closing transport: {}", e);
                }
            }
        }
        result
    }
}

pub(crate) async fn acquire_slot(slot: &Arc<Semaphore>, policy: BusyPolicy, name: &'static str) -> Result<OwnedSemaphorePermit, LinkError> {
    match policy {
        BusyPolicy::Queue => slot.clone().acquire_owned().await
            .map_err(|_| LinkError::Connection("link is disconnected".to_string())),
        BusyPolicy::Reject => slot.clone().try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => LinkError::Busy(name),
                TryAcquireError::Closed => LinkError::Connection("link is disconnected".to_string()),
            }),
    }
}

/// A connected device. All operations may be called concurrently from any number of tasks.
///
/// Dropping the link (or calling [Link::disconnect]) resolves every pending operation with a
///  connection error.
pub struct Link {
    core: Arc<LinkCore>,
    transport: Arc<dyn Transport>,
    correlator: Correlator,
    transfers: TransferManager,
    waiters: EventWaiters,
    receive_task: JoinHandle<()>,
}

impl Link {
    /// Starts operating on an established connection. This spawns the link's receive loop, so it
    ///  must be called from inside a Tokio runtime.
    pub fn start(config: LinkConfig, connection: Connection) -> anyhow::Result<Link> {
        config.validate()?;

        let max_fragment_len = connection.transport.max_write_len();
        if max_fragment_len < LinkConfig::MIN_FRAGMENT_LEN {
            bail!("link to {} allows writes of {} bytes, at least {} are required", connection.peer, max_fragment_len, LinkConfig::MIN_FRAGMENT_LEN);
        }

        let stats = Arc::new(LinkStats::default());
        let table = SharedTable::default();
        let router = Router::new(table.clone(), stats.clone(), config.max_transfer_len);
        let core = Arc::new(LinkCore {
            config,
            peer: connection.peer,
            table,
            router,
            writer: OutboundWriter::new(connection.transport.clone(), Chunker::new(max_fragment_len)?, stats.clone()),
            request_slot: Arc::new(Semaphore::new(1)),
            transfer_slot: Arc::new(Semaphore::new(1)),
            stats,
        });
        info!("link to {} established, fragments of up to {} bytes", core.peer, max_fragment_len);

        let correlator = Correlator::new(core.clone());
        Ok(Link {
            transport: connection.transport,
            transfers: TransferManager::new(core.clone(), correlator.clone()),
            waiters: EventWaiters::new(core.clone()),
            correlator,
            receive_task: tokio::spawn(receive_loop::receive_loop(core.clone(), connection.inbound)),
            core,
        })
    }

    pub fn peer(&self) -> &str {
        &self.core.peer
    }

    pub fn config(&self) -> &LinkConfig {
        &self.core.config
    }

    /// Sends a request and waits up to `timeout` for the device's response.
    pub async fn call(&self, request: impl AsRef<[u8]>, timeout: Duration) -> Result<Response, LinkError> {
        self.correlator.call(request.as_ref(), timeout).await
    }

    pub async fn call_with_default_timeout(&self, request: impl AsRef<[u8]>) -> Result<Response, LinkError> {
        self.correlator.call(request.as_ref(), self.core.config.default_timeout).await
    }

    pub async fn fire_and_forget(&self, request: impl AsRef<[u8]>) -> Result<(), LinkError> {
        self.correlator.fire_and_forget(request.as_ref()).await
    }

    pub async fn start_download(&self, resource: &ResourceId) -> Result<DownloadHandle, LinkError> {
        self.transfers.start_download(resource).await
    }

    pub async fn start_upload(&self, resource: &ResourceId, len: u64) -> Result<UploadHandle, LinkError> {
        self.transfers.start_upload(resource, len).await
    }

    /// Waits for the next event of a given kind. Running into the timeout is not an error.
    pub async fn wait_for(&self, kind: EventKind, timeout: Duration) -> Result<WaitOutcome, LinkError> {
        self.waiters.wait_for(kind, timeout).await
    }

    /// Registers a handler for every log line the device emits, including lines emitted while a
    ///  request is pending (which are also part of its [Response]). Handlers are called from the
    ///  receive loop and must not block.
    pub fn on_log(&self, handler: impl Fn(&str) + Send + Sync + 'static) -> HandlerId {
        let mut table = self.core.table.lock();
        let id = HandlerId(table.next_id());
        table.log_handlers.push((id, Arc::new(handler)));
        id
    }

    /// Registers a persistent handler for an event kind. Unlike [Link::wait_for], the handler
    ///  stays registered until it is removed.
    pub fn on_event(&self, kind: EventKind, handler: impl Fn(&Event) + Send + Sync + 'static) -> HandlerId {
        let mut table = self.core.table.lock();
        let id = HandlerId(table.next_id());
        table.event_handlers.push((id, kind, Arc::new(handler)));
        id
    }

    /// returns `false` if there is no handler with this id
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut table = self.core.table.lock();
        let num_handlers = table.log_handlers.len() + table.event_handlers.len();
        table.log_handlers.retain(|(handler_id, _)| *handler_id != id);
        table.event_handlers.retain(|(handler_id, _, _)| *handler_id != id);
        table.log_handlers.len() + table.event_handlers.len() < num_handlers
    }

    /// Interrupts the script currently running on the device.
    pub async fn send_break_signal(&self) -> Result<(), LinkError> {
        self.send_signal(signal::BREAK).await
    }

    /// Restarts the device's script engine.
    pub async fn send_reset_signal(&self) -> Result<(), LinkError> {
        self.send_signal(signal::RESET).await
    }

    async fn send_signal(&self, signal: u8) -> Result<(), LinkError> {
        if !self.core.is_connected() {
            return Err(LinkError::Connection("link is disconnected".to_string()));
        }
        self.core.send_signal(signal).await
    }

    /// the largest fragment, including its header, sent or received over this link
    pub fn max_fragment_len(&self) -> usize {
        self.core.writer.chunker().max_fragment_len()
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Closes the link. Calling this on a link that is disconnected already has no effect.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        if !self.core.shutdown("disconnected by the application") {
            debug!("link to {} is disconnected already", self.core.peer);
            return Ok(());
        }
        self.receive_task.abort();
        self.transport.disconnect().await
            .map_err(LinkError::from_transport)
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<LinkCore> {
        &self.core
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.receive_task.abort();
        if self.core.shutdown("link dropped") {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let transport = self.transport.clone();
                runtime.spawn(async move {
                    let _ = transport.disconnect().await;
                });
            }
        }
    }
}
