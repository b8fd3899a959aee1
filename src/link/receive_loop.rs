use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, span, trace, warn, Level};
use uuid::Uuid;

use crate::link::LinkCore;
use crate::protocol::{FragmentHeader, MessageKind, Reassembler};
use crate::transport::LinkSignal;

/// Processes inbound notifications in arrival order until the link goes down. Routing never
///  suspends, so a slow consumer can not stall the link.
pub(crate) async fn receive_loop(core: Arc<LinkCore>, mut inbound: mpsc::UnboundedReceiver<LinkSignal>) {
    let mut reassembler = Reassembler::new(core.config.max_message_len, core.config.accept_untagged_prints);

    while let Some(signal) = inbound.recv().await {
        match signal {
            LinkSignal::Notification(raw) => on_notification(&core, &mut reassembler, &raw),
            LinkSignal::Disconnected => {
                debug!("transport reported disconnect from {}", core.peer);
                break;
            }
        }
    }

    core.shutdown("link lost");
}

fn on_notification(core: &LinkCore, reassembler: &mut Reassembler, raw: &[u8]) {
    let correlation_id = Uuid::new_v4();
    let span = span!(Level::TRACE, "notification_received", ?correlation_id);
    let _entered = span.enter();

    core.stats.on_notification();
    trace!("received notification: {:?}", raw);

    let result = reassembler.feed(raw);
    core.stats.set_resyncs(reassembler.num_resyncs());

    match result {
        Ok(Some(message)) => {
            let kind = message.kind;
            let outcome = core.router.route(message);
            trace!("{:?} message routed: {:?}", kind, outcome);
        }
        Ok(None) => {}
        Err(e) => {
            warn!("discarding notification: {}", e);
            core.stats.on_protocol_error();
            if is_stream_fragment(raw) {
                core.router.on_stream_corruption(&e);
            }
        }
    }
}

fn is_stream_fragment(raw: &[u8]) -> bool {
    FragmentHeader::deser(&mut &raw[..])
        .is_ok_and(|header| header.kind == MessageKind::Stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::events::{EventKind, WaitOutcome};
    use crate::protocol::{Chunker, FragmentPosition, StreamFrame};
    use crate::test_util::simulated::SimulatedDevice;
    use crate::transfer::{ResourceId, TransferState};
    use crate::error::LinkError;
    use std::sync::Mutex;
    use std::time::Duration;

    fn config() -> LinkConfig {
        let mut config = LinkConfig::new();
        config.break_on_connect = false;
        config
    }

    #[rstest::rstest]
    #[case::stream(MessageKind::Stream, true)]
    #[case::response(MessageKind::Response, false)]
    #[case::event(MessageKind::Event, false)]
    fn test_is_stream_fragment(#[case] kind: MessageKind, #[case] expected: bool) {
        let header = FragmentHeader { kind, position: FragmentPosition::Last, error: false, sequence: 3 };
        let mut buf = bytes::BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(is_stream_fragment(&buf), expected);
        assert!(!is_stream_fragment(b"print"));
        assert!(!is_stream_fragment(b""));
    }

    #[tokio::test]
    async fn test_malformed_notifications_are_counted() {
        let (device, link) = SimulatedDevice::connected(config(), 20);

        device.notify_raw(&[]);
        device.notify_raw(&[0x90, 0x00]); // reserved bit
        device.settle(|| link.stats().protocol_errors == 2).await;
        assert_eq!(link.stats().notifications_received, 2);
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn test_resync() {
        let (device, link) = SimulatedDevice::connected(config(), 20);
        let lines = Arc::new(Mutex::new(Vec::new()));
        {
            let lines = lines.clone();
            link.on_log(move |line| lines.lock().unwrap().push(line.to_string()));
        }

        // the first run never completes, the second replaces it
        let chunker = Chunker::new(12).unwrap();
        let first_run = chunker.chunk(MessageKind::Log, false, b"lost message, never finished").next().unwrap().to_bytes();
        device.notify_raw(&first_run);
        device.log("complete");

        device.settle(|| !lines.lock().unwrap().is_empty()).await;
        assert_eq!(*lines.lock().unwrap(), vec!["complete".to_string()]);
        assert_eq!(link.stats().resyncs, 1);
    }

    #[tokio::test]
    async fn test_corrupted_stream_fails_download() {
        let (device, link) = SimulatedDevice::connected(config(), 20);

        let device_task = {
            let device = device.clone();
            tokio::spawn(async move {
                device.next_message().await;
                device.respond(b"");

                // a continuation without an open run
                let chunker = Chunker::new(12).unwrap();
                let payload = StreamFrame::Data(bytes::Bytes::from_static(b"0123456789abcdef")).to_bytes();
                let continuation = chunker.chunk(MessageKind::Stream, false, &payload).nth(1).unwrap().to_bytes();
                device.notify_raw(&continuation);
            })
        };

        let mut download = link.start_download(&ResourceId::File("x".to_string())).await.unwrap();
        device_task.await.unwrap();
        assert!(matches!(download.read().await, Err(LinkError::Protocol(_))));
        assert_eq!(download.state(), TransferState::Failed);
    }

    #[tokio::test]
    async fn test_transport_closing_the_channel_disconnects() {
        let (device, link) = SimulatedDevice::connected(config(), 20);

        let disconnect = {
            let link = link.clone();
            tokio::spawn(async move { link.wait_for(EventKind::Disconnect, Duration::from_secs(5)).await })
        };
        device.settle(|| link.core().table.lock().num_waiters(EventKind::Disconnect) == 1).await;
        device.close_channel();

        assert!(matches!(disconnect.await.unwrap(), Ok(WaitOutcome::Fired(_))));
        assert!(!link.is_connected());
    }
}
