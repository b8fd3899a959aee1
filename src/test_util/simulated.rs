use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::config::LinkConfig;
use crate::events::{Event, EventKind};
use crate::link::Link;
use crate::protocol::{Chunker, FragmentHeader, LogicalMessage, MessageKind, Reassembler, StreamFrame};
use crate::session::{Connector, DeviceTarget};
use crate::transport::{Connection, LinkSignal, Transport};

/// An in-memory device on the other end of a link. Tests script the device's side of the
///  conversation: read what the host sent with [SimulatedDevice::next_message], and answer with
///  responses, logs, events and stream data.
///
/// Outbound notifications are chunked with the same fragment length the host uses.
#[derive(Clone)]
pub struct SimulatedDevice {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    chunker: Chunker,
    /// `None` once the channel was closed
    notifications: StdMutex<Option<mpsc::UnboundedSender<LinkSignal>>>,
    received: Mutex<ReceivedWrites>,
    signals: StdMutex<Vec<u8>>,
    link_lost: AtomicBool,
    num_disconnects: AtomicUsize,
}

struct ReceivedWrites {
    writes: mpsc::UnboundedReceiver<Bytes>,
    reassembler: Reassembler,
}

impl SimulatedDevice {
    /// Creates a device and the host side [Connection] to it.
    pub fn pair(max_fragment_len: usize) -> (SimulatedDevice, Connection) {
        SimulatedDevice::pair_with_peer(max_fragment_len, "simulated device")
    }

    fn pair_with_peer(max_fragment_len: usize, peer: &str) -> (SimulatedDevice, Connection) {
        let (notifications, inbound) = mpsc::unbounded_channel();
        let (write_sender, writes) = mpsc::unbounded_channel();

        let device = SimulatedDevice {
            inner: Arc::new(DeviceInner {
                chunker: Chunker::new(max_fragment_len).expect("fragment length must exceed the header length"),
                notifications: StdMutex::new(Some(notifications)),
                received: Mutex::new(ReceivedWrites {
                    writes,
                    reassembler: Reassembler::new(usize::MAX, false),
                }),
                signals: Default::default(),
                link_lost: AtomicBool::new(false),
                num_disconnects: AtomicUsize::new(0),
            }),
        };

        let transport = SimulatedTransport {
            device: device.clone(),
            writes: write_sender,
            max_write_len: max_fragment_len,
        };
        let connection = Connection {
            transport: Arc::new(transport),
            inbound,
            peer: peer.to_string(),
        };
        (device, connection)
    }

    /// Creates a device and starts a [Link] to it.
    ///
    /// Panics if the configuration is invalid.
    pub fn connected(config: LinkConfig, max_fragment_len: usize) -> (SimulatedDevice, Arc<Link>) {
        let (device, connection) = SimulatedDevice::pair(max_fragment_len);
        let link = Link::start(config, connection).expect("link to a simulated device should start");
        (device, Arc::new(link))
    }

    /// Waits for the next complete message from the host. Raw signals are recorded separately,
    ///  see [SimulatedDevice::signals].
    ///
    /// Panics if the host side of the link is gone.
    pub async fn next_message(&self) -> LogicalMessage {
        let mut received = self.inner.received.lock().await;
        loop {
            let write = received.writes.recv().await.expect("host side of the link was dropped");
            if let Some(message) = self.on_write(&mut received, write) {
                return message;
            }
        }
    }

    /// returns a complete message if the host sent one, without waiting
    pub fn try_next_message(&self) -> Option<LogicalMessage> {
        let mut received = self.inner.received.try_lock().ok()?;
        while let Ok(write) = received.writes.try_recv() {
            if let Some(message) = self.on_write(&mut received, write) {
                return Some(message);
            }
        }
        None
    }

    fn on_write(&self, received: &mut ReceivedWrites, write: Bytes) -> Option<LogicalMessage> {
        match write.first() {
            Some(&first_byte) if !FragmentHeader::is_tagged(first_byte) && write.len() == 1 => {
                self.inner.signals.lock().unwrap_or_else(PoisonError::into_inner).push(first_byte);
                None
            }
            _ => received.reassembler.feed(&write).expect("host sent a malformed fragment"),
        }
    }

    /// the raw signals (break, reset) the host sent so far
    pub fn signals(&self) -> Vec<u8> {
        self.inner.signals.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// number of times the host disconnected the transport
    pub fn num_disconnects(&self) -> usize {
        self.inner.num_disconnects.load(Ordering::SeqCst)
    }

    pub fn respond(&self, body: &[u8]) {
        self.send(MessageKind::Response, false, body);
    }

    pub fn respond_error(&self, message: &[u8]) {
        self.send(MessageKind::Response, true, message);
    }

    /// a tagged log line
    pub fn log(&self, line: &str) {
        self.send(MessageKind::Log, false, line.as_bytes());
    }

    /// an untagged print of the device's script engine
    pub fn print(&self, line: &str) {
        self.notify_raw(line.as_bytes());
    }

    pub fn event(&self, kind: EventKind, data: &[u8]) {
        let mut buf = BytesMut::new();
        Event::new(kind, Bytes::copy_from_slice(data))
            .ser(&mut buf)
            .expect("local events can not be sent by a device");
        self.send(MessageKind::Event, false, &buf);
    }

    pub fn stream_data(&self, data: &[u8]) {
        self.send_stream_frame(&StreamFrame::Data(Bytes::copy_from_slice(data)));
    }

    pub fn stream_end(&self, chunk_count: Option<u32>) {
        self.send_stream_frame(&StreamFrame::End { chunk_count });
    }

    pub fn stream_ack(&self, acknowledged: u64) {
        self.send_stream_frame(&StreamFrame::Ack { acknowledged });
    }

    pub fn stream_error(&self, reason: &[u8]) {
        self.send(MessageKind::Stream, true, reason);
    }

    fn send_stream_frame(&self, frame: &StreamFrame) {
        self.send(MessageKind::Stream, false, &frame.to_bytes());
    }

    fn send(&self, kind: MessageKind, error: bool, payload: &[u8]) {
        for fragment in self.inner.chunker.chunk(kind, error, payload) {
            self.notify_raw(&fragment.to_bytes());
        }
    }

    /// a single notification exactly as given
    pub fn notify_raw(&self, raw: &[u8]) {
        trace!("simulated device notifies {:?}", raw);
        self.signal_host(LinkSignal::Notification(Bytes::copy_from_slice(raw)));
    }

    fn signal_host(&self, signal: LinkSignal) {
        if let Some(notifications) = self.inner.notifications.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            let _ = notifications.send(signal);
        }
    }

    /// The link goes down as if the device went out of range: the host is notified, and further
    ///  writes fail.
    pub fn drop_link(&self) {
        self.inner.link_lost.store(true, Ordering::SeqCst);
        self.signal_host(LinkSignal::Disconnected);
    }

    /// Writes from the host fail from now on, but the host is not notified of a lost link.
    pub fn fail_writes(&self) {
        self.inner.link_lost.store(true, Ordering::SeqCst);
    }

    /// Ends the notification channel without an explicit disconnect notification, the way a
    ///  transport implementation that is dropped ends it.
    pub fn close_channel(&self) {
        self.inner.link_lost.store(true, Ordering::SeqCst);
        self.inner.notifications.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Lets all other tasks run until they are idle.
    pub async fn quiesce(&self) {
        for _ in 0..Self::SETTLE_ROUNDS {
            tokio::task::yield_now().await;
        }
    }

    /// Lets other tasks run until `condition` holds.
    ///
    /// Panics if it does not hold after a generous number of scheduling rounds.
    pub async fn settle(&self, condition: impl Fn() -> bool) {
        for _ in 0..Self::SETTLE_ROUNDS {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        assert!(condition(), "condition did not hold after {} scheduling rounds", Self::SETTLE_ROUNDS);
    }

    const SETTLE_ROUNDS: usize = 1000;
}

struct SimulatedTransport {
    device: SimulatedDevice,
    writes: mpsc::UnboundedSender<Bytes>,
    max_write_len: usize,
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        if data.len() > self.max_write_len {
            bail!("write of {} bytes exceeds the maximum of {}", data.len(), self.max_write_len);
        }
        if self.device.inner.link_lost.load(Ordering::SeqCst) {
            bail!("not connected");
        }
        self.writes.send(Bytes::copy_from_slice(data))
            .map_err(|_| anyhow!("simulated device is gone"))
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        if self.device.inner.link_lost.load(Ordering::SeqCst) {
            bail!("not connected");
        }
        self.device.inner.link_lost.store(true, Ordering::SeqCst);
        self.device.inner.num_disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out connections to fresh [SimulatedDevice]s, optionally failing a number of attempts
///  first.
#[derive(Default)]
pub struct SimulatedConnector {
    max_fragment_len: usize,
    num_failures_left: AtomicUsize,
    num_attempts: AtomicUsize,
    devices: StdMutex<Vec<SimulatedDevice>>,
}

impl SimulatedConnector {
    pub fn new(max_fragment_len: usize) -> SimulatedConnector {
        SimulatedConnector {
            max_fragment_len,
            ..Default::default()
        }
    }

    /// the next `n` connection attempts fail
    pub fn fail_next(&self, n: usize) {
        self.num_failures_left.store(n, Ordering::SeqCst);
    }

    pub fn num_attempts(&self) -> usize {
        self.num_attempts.load(Ordering::SeqCst)
    }

    /// the device of the most recent successful connection
    pub fn device(&self) -> Option<SimulatedDevice> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner).last().cloned()
    }

    pub fn num_connections(&self) -> usize {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn connect(&self, target: &DeviceTarget) -> anyhow::Result<Connection> {
        self.num_attempts.fetch_add(1, Ordering::SeqCst);
        let failures_left = self.num_failures_left.load(Ordering::SeqCst);
        if failures_left > 0 {
            self.num_failures_left.store(failures_left - 1, Ordering::SeqCst);
            bail!("no device found for {:?}", target);
        }

        let (device, connection) = SimulatedDevice::pair_with_peer(self.max_fragment_len, &format!("simulated {:?}", target));
        self.devices.lock().unwrap_or_else(PoisonError::into_inner).push(device);
        Ok(connection)
    }
}
