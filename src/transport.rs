use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

/// What the physical link reports to the host, in order of arrival.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkSignal {
    /// a single physical notification, i.e. one fragment or one untagged print
    Notification(Bytes),
    Disconnected,
}

/// The raw outbound primitive of a connected link. Implementations forward each call to a single
///  physical write; framing is done by the caller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The largest buffer a single [Transport::send] accepts, i.e. the negotiated MTU minus the
    ///  attribute protocol overhead.
    fn max_write_len(&self) -> usize;

    async fn send(&self, data: &[u8]) -> anyhow::Result<()>;

    async fn disconnect(&self) -> anyhow::Result<()>;
}

/// A freshly established link: the outbound primitive plus the receiving end of the inbound
///  notification channel.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::UnboundedReceiver<LinkSignal>,
    /// human readable identification of the device, for logging
    pub peer: String,
}
