use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{info, trace, warn};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::protocol::StreamFrame;
use crate::routing::table::TransferEvent;
use crate::transfer::pacing::PacingPolicy;
use crate::transfer::{TransferGuard, TransferState};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransferChunk {
    Data(Bytes),
    End,
}

/// Receiving side of an active download. Dropping the handle before the download completes
///  cancels it.
pub struct DownloadHandle {
    guard: TransferGuard,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    pacing: Arc<dyn PacingPolicy>,
    idle_timeout: Duration,
    max_prealloc_len: usize,
    expected_len: Option<u64>,
    received_len: u64,
    acknowledged_len: u64,
    failure: Option<LinkError>,
}

impl DownloadHandle {
    pub(crate) fn new(guard: TransferGuard, events: mpsc::UnboundedReceiver<TransferEvent>, config: &LinkConfig) -> DownloadHandle {
        DownloadHandle {
            expected_len: guard.expected_len(),
            guard,
            events,
            pacing: config.pacing.clone(),
            idle_timeout: config.transfer_idle_timeout,
            max_prealloc_len: config.max_message_len,
            received_len: 0,
            acknowledged_len: 0,
            failure: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.guard.id()
    }

    pub fn state(&self) -> TransferState {
        self.guard.state()
    }

    /// the total size announced by the device, if it was known when the download started
    pub fn expected_len(&self) -> Option<u64> {
        self.expected_len
    }

    /// number of bytes returned by [DownloadHandle::read] so far
    pub fn received_len(&self) -> u64 {
        self.received_len
    }

    /// Returns the next chunk of data, or [TransferChunk::End] once the download is complete.
    ///  Reading after the end keeps returning [TransferChunk::End].
    pub async fn read(&mut self) -> Result<TransferChunk, LinkError> {
        if let Some(state) = self.guard.final_state() {
            return match state {
                TransferState::Done => Ok(TransferChunk::End),
                _ => Err(self.terminal_error(state)),
            };
        }

        loop {
            let event = match time::timeout(self.idle_timeout, self.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(self.fail(LinkError::Connection("link closed during download".to_string()))),
                Err(_) => {
                    self.guard.abort().await;
                    let e = LinkError::Timeout(format!("download {} made no progress for {:?}", self.id(), self.idle_timeout));
                    return Err(self.fail(e));
                }
            };

            match event {
                TransferEvent::Data(data) => {
                    self.received_len += data.len() as u64;
                    self.acknowledge().await?;
                    return Ok(TransferChunk::Data(data));
                }
                TransferEvent::End => {
                    info!("download {} complete: {} bytes", self.id(), self.received_len);
                    self.guard.finish(TransferState::Done);
                    return Ok(TransferChunk::End);
                }
                TransferEvent::Failed(e) => return Err(self.fail(e)),
                TransferEvent::Ack(_) => trace!("ignoring acknowledgement for download {}", self.id()),
            }
        }
    }

    pub async fn read_to_end(&mut self) -> Result<Bytes, LinkError> {
        let capacity = self.expected_len
            .and_then(|len| usize::try_from(len).ok())
            .unwrap_or(0)
            .min(self.max_prealloc_len);
        let mut buf = BytesMut::with_capacity(capacity);
        loop {
            match self.read().await? {
                TransferChunk::Data(data) => buf.extend_from_slice(&data),
                TransferChunk::End => return Ok(buf.freeze()),
            }
        }
    }

    /// Stops the download and asks the device to stop sending. Data that was already received
    ///  but not read is discarded.
    pub async fn cancel(&mut self) {
        if self.guard.final_state().is_some() {
            return;
        }
        info!("cancelling download {} after {} bytes", self.id(), self.received_len);
        self.guard.finish(TransferState::Cancelled);
        self.guard.abort().await;
    }

    async fn acknowledge(&mut self) -> Result<(), LinkError> {
        let Some(acknowledged) = self.pacing.download_ack(self.received_len, self.acknowledged_len) else {
            return Ok(());
        };

        trace!("acknowledging {} bytes of download {}", acknowledged, self.id());
        match self.guard.core().send_stream_frame(&StreamFrame::Ack { acknowledged }).await {
            Ok(()) => {
                self.acknowledged_len = acknowledged;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, e: LinkError) -> LinkError {
        warn!("download {} failed: {}", self.id(), e);
        self.guard.finish(TransferState::Failed);
        self.failure = Some(e.clone());
        e
    }

    fn terminal_error(&self, state: TransferState) -> LinkError {
        match &self.failure {
            Some(e) => e.clone(),
            None => LinkError::Protocol(format!("download {} is {:?}", self.id(), state)),
        }
    }
}
