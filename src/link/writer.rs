use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::Mutex;
use tracing::{error, trace};

use crate::error::LinkError;
use crate::protocol::{Chunker, MessageKind, StreamFrame};
use crate::stats::LinkStats;
use crate::transport::Transport;

/// The single writer of a link. Fragments of different messages must not interleave on the wire,
///  so a message's fragments are sent while holding the send lock.
pub(crate) struct OutboundWriter {
    transport: Arc<dyn Transport>,
    chunker: Chunker,
    send_lock: Mutex<()>,
    stats: Arc<LinkStats>,
}

impl OutboundWriter {
    pub fn new(transport: Arc<dyn Transport>, chunker: Chunker, stats: Arc<LinkStats>) -> OutboundWriter {
        OutboundWriter {
            transport,
            chunker,
            send_lock: Mutex::new(()),
            stats,
        }
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub async fn send_message(&self, kind: MessageKind, error: bool, payload: &[u8]) -> Result<(), LinkError> {
        let _send_lock = self.send_lock.lock().await;

        let fragments = self.chunker.chunk(kind, error, payload);
        trace!("sending {:?} message of {} bytes in {} fragments", kind, payload.len(), fragments.len());

        let mut buf = BytesMut::with_capacity(self.chunker.max_fragment_len());
        for fragment in fragments {
            buf.clear();
            fragment.ser(&mut buf);
            self.send_raw(&buf).await?;
        }
        Ok(())
    }

    pub async fn send_stream_frame(&self, frame: &StreamFrame) -> Result<(), LinkError> {
        self.send_message(MessageKind::Stream, false, &frame.to_bytes()).await
    }

    /// sends a single untagged control byte, see [crate::protocol::signal]
    pub async fn send_signal(&self, signal: u8) -> Result<(), LinkError> {
        let _send_lock = self.send_lock.lock().await;
        trace!("sending signal {:#04x}", signal);
        self.send_raw(&[signal]).await
    }

    /// closes the underlying transport after a failed write
    pub async fn close(&self) -> anyhow::Result<()> {
        self.transport.disconnect().await
    }

    async fn send_raw(&self, data: &[u8]) -> Result<(), LinkError> {
        if let Err(e) = self.transport.send(data).await {
            error!("error sending to the device: {}", e);
            return Err(LinkError::from_transport(e));
        }
        self.stats.on_fragment_sent(data.len());
        Ok(())
    }
}
