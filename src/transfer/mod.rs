//! Bulk transfers: moving payloads that are too big for a single message (files, photos, audio)
//!  through the stream channel.
//!
//! Every transfer goes through the same states:
//!
//! ```ascii
//!  initiating --> active --> completing --> done
//!       |            |            |
//!       +------------+------------+--> failed / cancelled
//! ```
//!
//! A transfer is *initiated* by a regular request that the device answers with the total size
//!  (downloads) or an acknowledgement (uploads). The response activates the transfer, after which
//!  stream messages carry the data. A download completes when all announced bytes arrived or the
//!  device sends an explicit end of stream; an upload completes when the device confirms the end
//!  of stream sent by the host.
//!
//! At most one transfer is active per link.

pub mod download;
pub mod pacing;
pub mod resource;
pub mod upload;

pub use download::{DownloadHandle, TransferChunk};
pub use pacing::{AckWindow, FixedInterval, PacingPolicy, Unpaced};
pub use resource::{AudioParams, FrameScriptAddressing, MeteringMode, PhotoParams, PhotoQuality, ResourceId, TransferAddressing};
pub use upload::UploadHandle;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::debug;

use crate::error::LinkError;
use crate::link::{acquire_slot, Correlator, LinkCore};
use crate::protocol::MessageKind;
use crate::routing::table::{TransferEntry, TransferEvent};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferDirection {
    Download,
    Upload,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferState {
    Initiating,
    Active,
    /// A download received all of its data, which is buffered until the reader reaches the end
    ///  of stream. An upload sent its end of stream and waits for the device's confirmation.
    Completing,
    Done,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Done | TransferState::Failed | TransferState::Cancelled)
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Clone)]
pub(crate) struct TransferManager {
    core: Arc<LinkCore>,
    correlator: Correlator,
}

impl TransferManager {
    pub fn new(core: Arc<LinkCore>, correlator: Correlator) -> TransferManager {
        TransferManager { core, correlator }
    }

    pub async fn start_download(&self, resource: &ResourceId) -> Result<DownloadHandle, LinkError> {
        let request = self.core.config.addressing.download_request(resource)
            .map_err(|e| LinkError::Protocol(format!("invalid download request: {:#}", e)))?;

        let (guard, events) = self.initiate(TransferDirection::Download, &request).await?;
        debug!("download {} of {:?} started", guard.id(), resource);
        Ok(DownloadHandle::new(guard, events, &self.core.config))
    }

    pub async fn start_upload(&self, resource: &ResourceId, len: u64) -> Result<UploadHandle, LinkError> {
        let request = self.core.config.addressing.upload_request(resource, len)
            .map_err(|e| LinkError::Protocol(format!("invalid upload request: {:#}", e)))?;

        let (guard, events) = self.initiate(TransferDirection::Upload, &request).await?;
        debug!("upload {} of {} bytes to {:?} started", guard.id(), len, resource);
        Ok(UploadHandle::new(guard, events, &self.core.config, len))
    }

    async fn initiate(&self, direction: TransferDirection, request: &Bytes) -> Result<(TransferGuard, mpsc::UnboundedReceiver<TransferEvent>), LinkError> {
        let permit = acquire_slot(&self.core.transfer_slot, self.core.config.transfer_busy_policy, "transfer slot").await?;

        let (sender, events) = mpsc::unbounded_channel();
        let id = {
            let mut table = self.core.table.lock();
            if table.disconnected {
                return Err(LinkError::Connection("link is disconnected".to_string()));
            }
            let id = table.next_id();
            table.transfer = Some(TransferEntry {
                id,
                direction,
                state: TransferState::Initiating,
                expected_len: None,
                received_len: 0,
                received_chunks: 0,
                events: sender,
            });
            id
        };
        let guard = TransferGuard {
            core: self.core.clone(),
            id,
            permit: Some(permit),
            final_state: None,
        };

        match self.correlator.call_initiating(request, self.core.config.default_timeout, id).await {
            Ok(_) => Ok((guard, events)),
            Err(e @ LinkError::Protocol(_)) => {
                // the device accepted the transfer, but the host can not take it
                guard.abort().await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

/// Owns a transfer's slot and routing table entry. The entry is removed and the slot released
///  when the transfer reaches a terminal state, or when the guard is dropped - in which case an
///  abort is sent to the device if the transfer was still live.
pub(crate) struct TransferGuard {
    core: Arc<LinkCore>,
    id: u64,
    permit: Option<OwnedSemaphorePermit>,
    final_state: Option<TransferState>,
}

impl TransferGuard {
    const ABORT_REASON: &'static [u8] = b"cancelled";

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn core(&self) -> &LinkCore {
        &self.core
    }

    pub fn final_state(&self) -> Option<TransferState> {
        self.final_state
    }

    pub fn state(&self) -> TransferState {
        if let Some(state) = self.final_state {
            return state;
        }
        self.core.table.lock()
            .transfer_mut(self.id)
            .map(|t| t.state)
            .unwrap_or(TransferState::Failed)
    }

    pub fn expected_len(&self) -> Option<u64> {
        self.core.table.lock()
            .transfer_mut(self.id)
            .and_then(|t| t.expected_len)
    }

    pub fn set_state(&self, state: TransferState) {
        if let Some(transfer) = self.core.table.lock().transfer_mut(self.id) {
            transfer.state = state;
        }
    }

    pub fn finish(&mut self, state: TransferState) {
        self.core.table.lock().remove_transfer(self.id);
        self.final_state = Some(state);
        self.permit = None;
        debug!("transfer {} finished: {:?}", self.id, state);
    }

    /// best effort, a failure to reach the device is only logged
    pub async fn abort(&self) {
        if let Err(e) = self.core.send_message(MessageKind::Stream, true, Self::ABORT_REASON).await {
            debug!("could not send abort for transfer {}: {}", self.id, e);
        }
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if self.final_state.is_some() {
            return;
        }

        let removed = self.core.table.lock().remove_transfer(self.id);
        if removed.is_some_and(|t| t.is_in_flight()) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let core = self.core.clone();
                let id = self.id;
                runtime.spawn(async move {
                    debug!("aborting abandoned transfer {}", id);
                    let _ = core.send_message(MessageKind::Stream, true, Self::ABORT_REASON).await;
                });
            }
        }
    }
}
