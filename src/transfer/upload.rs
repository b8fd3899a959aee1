use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time;
use tracing::{info, trace, warn};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::protocol::StreamFrame;
use crate::routing::table::TransferEvent;
use crate::transfer::pacing::PacingPolicy;
use crate::transfer::{TransferGuard, TransferState};

/// Sending side of an active upload. The total length is declared when the upload is started,
///  and [UploadHandle::finish] must be called after all of it was written. Dropping the handle
///  before that cancels the upload.
pub struct UploadHandle {
    guard: TransferGuard,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    pacing: Arc<dyn PacingPolicy>,
    idle_timeout: Duration,
    declared_len: u64,
    written_len: u64,
    acknowledged_len: u64,
    chunks_sent: u32,
    chunk_len: usize,
    failure: Option<LinkError>,
}

impl UploadHandle {
    pub(crate) fn new(guard: TransferGuard, events: mpsc::UnboundedReceiver<TransferEvent>, config: &LinkConfig, declared_len: u64) -> UploadHandle {
        // one stream message per fragment unless configured otherwise: the opcode takes one byte
        let chunk_len = config.upload_chunk_len
            .unwrap_or_else(|| guard.core().writer.chunker().max_payload_per_fragment().saturating_sub(1))
            .max(1);

        UploadHandle {
            guard,
            events,
            pacing: config.pacing.clone(),
            idle_timeout: config.transfer_idle_timeout,
            declared_len,
            written_len: 0,
            acknowledged_len: 0,
            chunks_sent: 0,
            chunk_len,
            failure: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.guard.id()
    }

    pub fn state(&self) -> TransferState {
        self.guard.state()
    }

    pub fn declared_len(&self) -> u64 {
        self.declared_len
    }

    pub fn written_len(&self) -> u64 {
        self.written_len
    }

    /// the highest cumulative acknowledgement received from the device
    pub fn acknowledged_len(&self) -> u64 {
        self.acknowledged_len
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.check_writable()?;

        if self.written_len + data.len() as u64 > self.declared_len {
            return Err(LinkError::Protocol(format!("writing {} bytes would exceed the declared length of {} ({} written)",
                data.len(), self.declared_len, self.written_len)));
        }

        for chunk in data.chunks(self.chunk_len) {
            self.drain_events()?;
            self.await_window(chunk.len() as u64).await?;

            let frame = StreamFrame::Data(Bytes::copy_from_slice(chunk));
            if let Err(e) = self.guard.core().send_stream_frame(&frame).await {
                return Err(self.fail(e));
            }
            self.written_len += chunk.len() as u64;
            self.chunks_sent = self.chunks_sent.wrapping_add(1);
            trace!("upload {}: {} of {} bytes written", self.id(), self.written_len, self.declared_len);

            if let Some(interval) = self.pacing.chunk_interval() {
                time::sleep(interval).await;
            }
        }
        Ok(())
    }

    /// Sends the end of stream and waits for the device to confirm it.
    pub async fn finish(&mut self) -> Result<(), LinkError> {
        self.check_writable()?;

        if self.written_len != self.declared_len {
            return Err(LinkError::Protocol(format!("upload {} declared {} bytes, but only {} were written",
                self.id(), self.declared_len, self.written_len)));
        }

        self.drain_events()?;
        self.guard.set_state(TransferState::Completing);
        let end = StreamFrame::End { chunk_count: Some(self.chunks_sent) };
        if let Err(e) = self.guard.core().send_stream_frame(&end).await {
            return Err(self.fail(e));
        }

        loop {
            match self.next_event().await? {
                TransferEvent::End => {
                    info!("upload {} complete: {} bytes in {} chunks", self.id(), self.written_len, self.chunks_sent);
                    self.guard.finish(TransferState::Done);
                    return Ok(());
                }
                TransferEvent::Ack(acknowledged) => self.on_ack(acknowledged),
                TransferEvent::Data(_) => trace!("ignoring data for upload {}", self.id()),
                TransferEvent::Failed(e) => return Err(self.fail(e)),
            }
        }
    }

    pub async fn cancel(&mut self) {
        if self.guard.final_state().is_some() {
            return;
        }
        info!("cancelling upload {} after {} bytes", self.id(), self.written_len);
        self.guard.finish(TransferState::Cancelled);
        self.guard.abort().await;
    }

    fn check_writable(&self) -> Result<(), LinkError> {
        match self.guard.final_state() {
            None => Ok(()),
            Some(state) => Err(match &self.failure {
                Some(e) => e.clone(),
                None => LinkError::Protocol(format!("upload {} is {:?}", self.id(), state)),
            }),
        }
    }

    /// waits until sending `len` more bytes stays inside the pacing window
    async fn await_window(&mut self, len: u64) -> Result<(), LinkError> {
        let Some(window) = self.pacing.upload_window() else {
            return Ok(());
        };

        while self.written_len + len > self.acknowledged_len + window.max(len) {
            trace!("upload {} waits for acknowledgement: {} written, {} acknowledged", self.id(), self.written_len, self.acknowledged_len);
            match self.next_event().await? {
                TransferEvent::Ack(acknowledged) => self.on_ack(acknowledged),
                TransferEvent::Failed(e) => return Err(self.fail(e)),
                TransferEvent::End => return Err(self.fail(LinkError::Protocol("device ended the upload before it was complete".to_string()))),
                TransferEvent::Data(_) => trace!("ignoring data for upload {}", self.id()),
            }
        }
        Ok(())
    }

    /// processes everything the device sent so far without waiting
    fn drain_events(&mut self) -> Result<(), LinkError> {
        loop {
            match self.events.try_recv() {
                Ok(TransferEvent::Ack(acknowledged)) => self.on_ack(acknowledged),
                Ok(TransferEvent::Failed(e)) => return Err(self.fail(e)),
                Ok(TransferEvent::End) => return Err(self.fail(LinkError::Protocol("device ended the upload before it was complete".to_string()))),
                Ok(TransferEvent::Data(_)) => trace!("ignoring data for upload {}", self.id()),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(self.fail(LinkError::Connection("link closed during upload".to_string()))),
            }
        }
    }

    async fn next_event(&mut self) -> Result<TransferEvent, LinkError> {
        match time::timeout(self.idle_timeout, self.events.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(self.fail(LinkError::Connection("link closed during upload".to_string()))),
            Err(_) => {
                self.guard.abort().await;
                let e = LinkError::Timeout(format!("upload {} made no progress for {:?}", self.id(), self.idle_timeout));
                Err(self.fail(e))
            }
        }
    }

    fn on_ack(&mut self, acknowledged: u64) {
        if acknowledged > self.written_len {
            warn!("device acknowledged {} bytes of upload {}, but only {} were written", acknowledged, self.id(), self.written_len);
        }
        self.acknowledged_len = self.acknowledged_len.max(acknowledged.min(self.written_len));
    }

    fn fail(&mut self, e: LinkError) -> LinkError {
        warn!("upload {} failed: {}", self.id(), e);
        self.guard.finish(TransferState::Failed);
        self.failure = Some(e.clone());
        e
    }
}
