use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::error::LinkError;
use crate::events::{Event, EventKind};
use crate::link::Response;
use crate::protocol::{LogicalMessage, MessageKind, StreamFrame};
use crate::routing::table::{SharedTable, TransferEntry, TransferEvent};
use crate::stats::LinkStats;
use crate::transfer::{TransferDirection, TransferState};

/// Where a message ended up. Exactly one destination per message, or none at all.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteOutcome {
    /// resolved the pending request
    Resolved,
    /// a log line, appended to the pending request's logs and / or passed to log handlers
    Logged,
    /// fed to the active transfer
    Transferred,
    /// delivered to event waiters and / or event handlers
    Fired,
    /// no live recipient
    Dropped,
}

/// Classifies complete inbound messages and hands them to their single recipient. Routing is
///  synchronous: it never waits for a recipient, completion signals are fire-and-forget.
pub(crate) struct Router {
    table: SharedTable,
    stats: Arc<LinkStats>,
    max_transfer_len: u64,
}

impl Router {
    pub fn new(table: SharedTable, stats: Arc<LinkStats>, max_transfer_len: u64) -> Router {
        Router { table, stats, max_transfer_len }
    }

    pub fn route(&self, message: LogicalMessage) -> RouteOutcome {
        let outcome = match message.kind {
            MessageKind::Event => self.route_event(message.payload),
            MessageKind::Stream => self.route_stream(message.error, message.payload),
            MessageKind::Response => self.route_response(message.error, message.payload),
            MessageKind::Log => self.route_log(message.payload),
        };

        if outcome == RouteOutcome::Dropped {
            self.stats.on_stray();
        }
        else {
            self.stats.on_routed();
        }
        outcome
    }

    fn route_event(&self, payload: Bytes) -> RouteOutcome {
        let event = match Event::deser(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("malformed event: {}", e);
                self.stats.on_protocol_error();
                return RouteOutcome::Dropped;
            }
        };
        self.fire(event)
    }

    /// Completes all waiters for an event's kind and invokes the handlers registered for it.
    ///  Handlers are called after the table lock is released, so they may use the link.
    fn fire(&self, event: Event) -> RouteOutcome {
        let (waiters, handlers) = {
            let mut table = self.table.lock();
            let waiters = table.waiters.remove(&event.kind).unwrap_or_default();
            let handlers = table.event_handlers.iter()
                .filter(|(_, kind, _)| *kind == event.kind)
                .map(|(_, _, handler)| handler.clone())
                .collect::<Vec<_>>();
            (waiters, handlers)
        };

        let mut num_notified = 0;
        for waiter in waiters {
            if waiter.responder.send(Ok(event.clone())).is_ok() {
                num_notified += 1;
            }
        }
        for handler in &handlers {
            handler(&event);
        }
        num_notified += handlers.len();

        if num_notified == 0 {
            debug!("no subscriber for {:?} event - dropping", event.kind);
            RouteOutcome::Dropped
        }
        else {
            debug!("{:?} event delivered to {} subscribers", event.kind, num_notified);
            RouteOutcome::Fired
        }
    }

    fn route_log(&self, payload: Bytes) -> RouteOutcome {
        let line = String::from_utf8_lossy(&payload).into_owned();
        trace!("device log: {}", line);

        let (to_request, handlers) = {
            let mut table = self.table.lock();
            let to_request = match table.pending.as_mut() {
                Some(pending) => {
                    pending.logs.push(line.clone());
                    true
                }
                None => false,
            };
            let handlers = table.log_handlers.iter()
                .map(|(_, handler)| handler.clone())
                .collect::<Vec<_>>();
            (to_request, handlers)
        };

        for handler in &handlers {
            handler(&line);
        }

        if to_request || !handlers.is_empty() {
            RouteOutcome::Logged
        }
        else {
            debug!("no recipient for log line {:?} - dropping", line);
            RouteOutcome::Dropped
        }
    }

    fn route_response(&self, error: bool, payload: Bytes) -> RouteOutcome {
        let mut table = self.table.lock();
        let Some(pending) = table.pending.take() else {
            drop(table);
            debug!("response without a pending request - dropping");
            return RouteOutcome::Dropped;
        };

        let result = if error {
            Err(LinkError::Device(String::from_utf8_lossy(&payload).into_owned()))
        }
        else {
            Ok(Response {
                body: payload,
                logs: pending.logs,
            })
        };

        let initiated_transfer = match pending.initiates_transfer {
            Some(id) => table.transfer_mut(id),
            None => None,
        };
        let result = match initiated_transfer {
            Some(transfer) => Self::on_transfer_initiated(transfer, result, self.max_transfer_len),
            None => result,
        };
        drop(table);

        if pending.responder.send(result).is_err() {
            debug!("request {} was abandoned before its response arrived - dropping", pending.id);
            return RouteOutcome::Dropped;
        }
        trace!("resolved request {}", pending.id);
        RouteOutcome::Resolved
    }

    /// The response to a transfer's initiation request activates the transfer. This happens while
    ///  routing the response rather than in the requesting task, so stream data following the
    ///  response immediately finds an active transfer.
    fn on_transfer_initiated(transfer: &mut TransferEntry, result: Result<Response, LinkError>, max_transfer_len: u64) -> Result<Response, LinkError> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                debug!("transfer {} was refused by the device: {}", transfer.id, e);
                transfer.state = TransferState::Failed;
                return Err(e);
            }
        };

        if transfer.direction == TransferDirection::Download {
            match parse_announced_len(&response.body) {
                Ok(Some(expected_len)) if expected_len > max_transfer_len => {
                    warn!("transfer {} announces {} bytes, exceeding the limit of {}", transfer.id, expected_len, max_transfer_len);
                    transfer.state = TransferState::Failed;
                    return Err(LinkError::Protocol(format!("announced transfer size {} exceeds the limit of {} bytes", expected_len, max_transfer_len)));
                }
                Ok(expected_len) => transfer.expected_len = expected_len,
                Err(e) => {
                    transfer.state = TransferState::Failed;
                    return Err(e);
                }
            }
        }

        debug!("transfer {} is active, expecting {:?} bytes", transfer.id, transfer.expected_len);
        transfer.state = TransferState::Active;
        if transfer.expected_len == Some(0) {
            transfer.state = TransferState::Completing;
            let _ = transfer.events.send(TransferEvent::End);
        }
        Ok(response)
    }

    fn route_stream(&self, error: bool, payload: Bytes) -> RouteOutcome {
        let mut table = self.table.lock();
        let Some(transfer) = table.transfer.as_mut() else {
            debug!("stream message without an active transfer - dropping");
            return RouteOutcome::Dropped;
        };

        if error {
            if !transfer.is_in_flight() {
                debug!("device reported failure for transfer {} in state {:?} - dropping", transfer.id, transfer.state);
                return RouteOutcome::Dropped;
            }
            let reason = String::from_utf8_lossy(&payload).into_owned();
            warn!("device reported failure of transfer {}: {}", transfer.id, reason);
            transfer.fail(LinkError::Device(reason));
            return RouteOutcome::Transferred;
        }

        let frame = match StreamFrame::deser(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("malformed stream message: {}", e);
                self.stats.on_protocol_error();
                if transfer.is_in_flight() {
                    transfer.fail(LinkError::Protocol(format!("malformed stream message: {}", e)));
                    return RouteOutcome::Transferred;
                }
                return RouteOutcome::Dropped;
            }
        };

        match (transfer.direction, transfer.state, frame) {
            (TransferDirection::Download, TransferState::Active, StreamFrame::Data(data)) => {
                Self::on_download_data(transfer, data, self.max_transfer_len);
            }
            (TransferDirection::Download, TransferState::Active, StreamFrame::End { chunk_count }) => {
                Self::on_download_end(transfer, chunk_count);
            }
            (TransferDirection::Download, TransferState::Completing, StreamFrame::End { .. }) => {
                trace!("end of stream after all announced bytes of transfer {} were received", transfer.id);
            }
            (TransferDirection::Upload, TransferState::Active | TransferState::Completing, StreamFrame::Ack { acknowledged }) => {
                trace!("device acknowledged {} bytes of transfer {}", acknowledged, transfer.id);
                let _ = transfer.events.send(TransferEvent::Ack(acknowledged));
            }
            (TransferDirection::Upload, TransferState::Completing, StreamFrame::End { .. }) => {
                debug!("device confirmed upload {}", transfer.id);
                transfer.state = TransferState::Done;
                let _ = transfer.events.send(TransferEvent::End);
            }
            (TransferDirection::Upload, TransferState::Active, StreamFrame::End { .. }) => {
                transfer.fail(LinkError::Protocol("device ended the upload before it was complete".to_string()));
            }
            (direction, state, frame) => {
                debug!("{:?} does not match {:?} transfer {} in state {:?} - dropping", frame, direction, transfer.id, state);
                return RouteOutcome::Dropped;
            }
        }
        RouteOutcome::Transferred
    }

    fn on_download_data(transfer: &mut TransferEntry, data: Bytes, max_transfer_len: u64) {
        transfer.received_len += data.len() as u64;
        transfer.received_chunks = transfer.received_chunks.wrapping_add(1);

        match transfer.expected_len {
            Some(expected_len) if transfer.received_len > expected_len => {
                transfer.fail(LinkError::Protocol(format!("received {} bytes, but only {} were announced", transfer.received_len, expected_len)));
                return;
            }
            None if transfer.received_len > max_transfer_len => {
                transfer.fail(LinkError::Protocol(format!("transfer exceeds the limit of {} bytes", max_transfer_len)));
                return;
            }
            _ => {}
        }

        let _ = transfer.events.send(TransferEvent::Data(data));

        if transfer.expected_len == Some(transfer.received_len) {
            debug!("transfer {} received all {} announced bytes", transfer.id, transfer.received_len);
            transfer.state = TransferState::Completing;
            let _ = transfer.events.send(TransferEvent::End);
        }
    }

    fn on_download_end(transfer: &mut TransferEntry, chunk_count: Option<u32>) {
        if let Some(expected_len) = transfer.expected_len {
            if transfer.received_len != expected_len {
                transfer.fail(LinkError::Protocol(format!("end of stream after {} of {} announced bytes", transfer.received_len, expected_len)));
                return;
            }
        }
        if let Some(chunk_count) = chunk_count {
            if chunk_count != transfer.received_chunks {
                transfer.fail(LinkError::Protocol(format!("device sent {} chunks, but {} were received", chunk_count, transfer.received_chunks)));
                return;
            }
        }

        debug!("transfer {} complete after {} bytes", transfer.id, transfer.received_len);
        transfer.state = TransferState::Completing;
        let _ = transfer.events.send(TransferEvent::End);
    }

    /// A fragment of a stream message could not be reassembled. The data it carried is lost, so
    ///  an active download can not complete correctly any more.
    pub fn on_stream_corruption(&self, error: &LinkError) {
        let mut table = self.table.lock();
        if let Some(transfer) = table.transfer.as_mut() {
            if transfer.is_in_flight() {
                warn!("transfer {} is corrupted: {}", transfer.id, error);
                transfer.fail(error.clone());
            }
        }
    }

    /// Resolves everything that waits for inbound traffic with a connection error, except for
    ///  waiters for the disconnect event itself. Returns `false` if the link was disconnected
    ///  already.
    pub fn route_disconnect(&self, reason: &str) -> bool {
        let (pending, other_waiters) = {
            let mut table = self.table.lock();
            if table.disconnected {
                return false;
            }
            table.disconnected = true;

            if let Some(transfer) = table.transfer.as_mut() {
                if transfer.is_in_flight() {
                    transfer.fail(LinkError::Connection(reason.to_string()));
                }
            }

            let pending = table.pending.take();
            let other_waiters = table.waiters.iter_mut()
                .filter(|(kind, _)| **kind != EventKind::Disconnect)
                .flat_map(|(_, waiters)| waiters.drain(..))
                .collect::<Vec<_>>();
            table.waiters.retain(|_, waiters| !waiters.is_empty());
            (pending, other_waiters)
        };
        info!("link disconnected: {}", reason);

        if let Some(pending) = pending {
            let _ = pending.responder.send(Err(LinkError::Connection(reason.to_string())));
        }
        for waiter in other_waiters {
            let _ = waiter.responder.send(Err(LinkError::Connection(reason.to_string())));
        }
        self.fire(Event::disconnect());
        true
    }
}

/// A download's initiation response announces the total size as ASCII decimal, or nothing if the
///  size is not known in advance.
fn parse_announced_len(body: &[u8]) -> Result<Option<u64>, LinkError> {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse::<u64>()
        .map(Some)
        .map_err(|_| LinkError::Protocol(format!("invalid transfer size {:?}", text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::table::{EventWaiter, PendingRequest};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, oneshot};

    fn router() -> (Router, SharedTable, Arc<LinkStats>) {
        let table = SharedTable::default();
        let stats = Arc::new(LinkStats::default());
        (Router::new(table.clone(), stats.clone(), 1_000_000), table, stats)
    }

    fn pending(table: &SharedTable, initiates_transfer: Option<u64>) -> oneshot::Receiver<Result<Response, LinkError>> {
        let (responder, receiver) = oneshot::channel();
        let mut table = table.lock();
        let id = table.next_id();
        table.pending = Some(PendingRequest { id, responder, logs: vec![], initiates_transfer });
        receiver
    }

    fn transfer(table: &SharedTable, direction: TransferDirection, state: TransferState, expected_len: Option<u64>) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (events, receiver) = mpsc::unbounded_channel();
        let mut table = table.lock();
        table.transfer = Some(TransferEntry {
            id: 77,
            direction,
            state,
            expected_len,
            received_len: 0,
            received_chunks: 0,
            events,
        });
        receiver
    }

    fn waiter(table: &SharedTable, kind: EventKind) -> oneshot::Receiver<Result<Event, LinkError>> {
        let (responder, receiver) = oneshot::channel();
        let mut table = table.lock();
        let id = table.next_id();
        table.waiters.entry(kind).or_default().push(EventWaiter { id, responder });
        receiver
    }

    fn stream(frame: StreamFrame) -> LogicalMessage {
        LogicalMessage::new(MessageKind::Stream, false, frame.to_bytes())
    }

    fn state(table: &SharedTable) -> TransferState {
        table.lock().transfer.as_ref().unwrap().state
    }

    #[test]
    fn test_response_with_logs() {
        let (router, table, stats) = router();
        let mut receiver = pending(&table, None);

        assert_eq!(router.route(LogicalMessage::new(MessageKind::Log, false, &b"step 1"[..])), RouteOutcome::Logged);
        assert_eq!(router.route(LogicalMessage::new(MessageKind::Log, false, &b"step 2"[..])), RouteOutcome::Logged);
        assert_eq!(router.route(LogicalMessage::new(MessageKind::Response, false, &b"42"[..])), RouteOutcome::Resolved);

        let response = receiver.try_recv().unwrap().unwrap();
        assert_eq!(response.body.as_ref(), b"42");
        assert_eq!(response.logs, vec!["step 1".to_string(), "step 2".to_string()]);
        assert!(table.lock().pending.is_none());
        assert_eq!(stats.snapshot().messages_routed, 3);
    }

    #[test]
    fn test_device_error() {
        let (router, table, _) = router();
        let mut receiver = pending(&table, None);

        assert_eq!(router.route(LogicalMessage::new(MessageKind::Response, true, &b"no such file"[..])), RouteOutcome::Resolved);
        assert_eq!(receiver.try_recv().unwrap(), Err(LinkError::Device("no such file".to_string())));
    }

    #[rstest]
    #[case::response(LogicalMessage::new(MessageKind::Response, false, &b"late"[..]))]
    #[case::log(LogicalMessage::new(MessageKind::Log, false, &b"print"[..]))]
    #[case::stream(LogicalMessage::new(MessageKind::Stream, false, StreamFrame::Data(Bytes::from_static(b"x")).to_bytes()))]
    #[case::event(LogicalMessage::new(MessageKind::Event, false, Bytes::from_static(&[0x04])))]
    #[case::malformed_event(LogicalMessage::new(MessageKind::Event, false, Bytes::new()))]
    fn test_stray(#[case] message: LogicalMessage) {
        let (router, _, stats) = router();
        assert_eq!(router.route(message), RouteOutcome::Dropped);
        assert_eq!(stats.snapshot().stray_messages, 1);
        assert_eq!(stats.snapshot().messages_routed, 0);
    }

    #[test]
    fn test_abandoned_request() {
        let (router, table, stats) = router();
        let receiver = pending(&table, None);
        drop(receiver);

        assert_eq!(router.route(LogicalMessage::new(MessageKind::Response, false, &b"late"[..])), RouteOutcome::Dropped);
        assert_eq!(stats.snapshot().stray_messages, 1);
    }

    #[test]
    fn test_event_broadcast() {
        let (router, table, _) = router();
        let mut tap_1 = waiter(&table, EventKind::Tap);
        let mut tap_2 = waiter(&table, EventKind::Tap);
        let mut wake = waiter(&table, EventKind::Wake);
        let num_handled = Arc::new(AtomicUsize::new(0));
        let num_handled_2 = num_handled.clone();
        table.lock().event_handlers.push((crate::routing::HandlerId(1), EventKind::Tap, Arc::new(move |_: &Event| { num_handled_2.fetch_add(1, Ordering::SeqCst); })));

        assert_eq!(router.route(LogicalMessage::new(MessageKind::Event, false, Bytes::from_static(&[0x04, 9]))), RouteOutcome::Fired);

        let expected = Event::new(EventKind::Tap, Bytes::from_static(&[9]));
        assert_eq!(tap_1.try_recv().unwrap(), Ok(expected.clone()));
        assert_eq!(tap_2.try_recv().unwrap(), Ok(expected));
        assert!(wake.try_recv().is_err());
        assert_eq!(num_handled.load(Ordering::SeqCst), 1);
        assert_eq!(table.lock().num_waiters(EventKind::Tap), 0);
        assert_eq!(table.lock().num_waiters(EventKind::Wake), 1);
    }

    #[test]
    fn test_log_handlers_without_request() {
        let (router, table, _) = router();
        let lines = Arc::new(std::sync::Mutex::new(Vec::new()));
        let lines_2 = lines.clone();
        table.lock().log_handlers.push((crate::routing::HandlerId(1), Arc::new(move |line: &str| lines_2.lock().unwrap().push(line.to_string()))));

        assert_eq!(router.route(LogicalMessage::new(MessageKind::Log, false, &b"hello"[..])), RouteOutcome::Logged);
        assert_eq!(*lines.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[rstest]
    #[case::known_size(b"5000".to_vec(), Ok(Some(5000)))]
    #[case::whitespace(b" 12\n".to_vec(), Ok(Some(12)))]
    #[case::unknown_size(vec![], Ok(None))]
    #[case::garbage(b"lots".to_vec(), Err(LinkError::Protocol("invalid transfer size \"lots\"".to_string())))]
    #[case::negative(b"-1".to_vec(), Err(LinkError::Protocol("invalid transfer size \"-1\"".to_string())))]
    fn test_parse_announced_len(#[case] body: Vec<u8>, #[case] expected: Result<Option<u64>, LinkError>) {
        assert_eq!(parse_announced_len(&body), expected);
    }

    #[test]
    fn test_download_complete_by_size() {
        let (router, table, _) = router();
        let mut events = transfer(&table, TransferDirection::Download, TransferState::Initiating, None);
        let mut response = pending(&table, Some(77));

        assert_eq!(router.route(LogicalMessage::new(MessageKind::Response, false, &b"5000"[..])), RouteOutcome::Resolved);
        assert!(response.try_recv().unwrap().is_ok());
        assert_eq!(state(&table), TransferState::Active);

        for _ in 0..4 {
            assert_eq!(router.route(stream(StreamFrame::Data(Bytes::from(vec![1u8; 1000])))), RouteOutcome::Transferred);
        }
        assert_eq!(state(&table), TransferState::Active);
        assert_eq!(router.route(stream(StreamFrame::Data(Bytes::from(vec![2u8; 1000])))), RouteOutcome::Transferred);
        assert_eq!(state(&table), TransferState::Completing);

        for _ in 0..5 {
            assert!(matches!(events.try_recv(), Ok(TransferEvent::Data(d)) if d.len() == 1000));
        }
        assert_eq!(events.try_recv(), Ok(TransferEvent::End));

        assert_eq!(router.route(stream(StreamFrame::End { chunk_count: Some(5) })), RouteOutcome::Transferred);
        assert!(events.try_recv().is_err());
    }

    #[rstest]
    #[case::at_limit(b"1000000".to_vec(), true)]
    #[case::above_limit(b"1000001".to_vec(), false)]
    #[case::u64_max(b"18446744073709551615".to_vec(), false)]
    fn test_announced_size_limit(#[case] body: Vec<u8>, #[case] accepted: bool) {
        let (router, table, _) = router();
        let _events = transfer(&table, TransferDirection::Download, TransferState::Initiating, None);
        let mut response = pending(&table, Some(77));

        router.route(LogicalMessage::new(MessageKind::Response, false, body));
        if accepted {
            assert!(response.try_recv().unwrap().is_ok());
            assert_eq!(state(&table), TransferState::Active);
        }
        else {
            assert!(matches!(response.try_recv().unwrap(), Err(LinkError::Protocol(_))));
            assert_eq!(state(&table), TransferState::Failed);
        }
    }

    #[test]
    fn test_unknown_size_exceeding_limit() {
        let (router, table, _) = router();
        let mut events = transfer(&table, TransferDirection::Download, TransferState::Active, None);

        router.route(stream(StreamFrame::Data(Bytes::from(vec![0u8; 600_000]))));
        assert_eq!(state(&table), TransferState::Active);
        router.route(stream(StreamFrame::Data(Bytes::from(vec![0u8; 600_000]))));
        assert_eq!(state(&table), TransferState::Failed);

        assert!(matches!(events.try_recv(), Ok(TransferEvent::Data(_))));
        assert!(matches!(events.try_recv(), Ok(TransferEvent::Failed(LinkError::Protocol(_)))));
    }

    #[test]
    fn test_completed_download_survives_disconnect() {
        let (router, table, _) = router();
        let mut events = transfer(&table, TransferDirection::Download, TransferState::Active, Some(3));

        router.route(stream(StreamFrame::Data(Bytes::from_static(b"abc"))));
        assert_eq!(state(&table), TransferState::Completing);

        assert!(router.route_disconnect("link lost"));
        assert_eq!(state(&table), TransferState::Completing);
        assert!(matches!(events.try_recv(), Ok(TransferEvent::Data(_))));
        assert_eq!(events.try_recv(), Ok(TransferEvent::End));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_download_refused() {
        let (router, table, _) = router();
        let _events = transfer(&table, TransferDirection::Download, TransferState::Initiating, None);
        let mut response = pending(&table, Some(77));

        router.route(LogicalMessage::new(MessageKind::Response, true, &b"file not found"[..]));
        assert_eq!(response.try_recv().unwrap(), Err(LinkError::Device("file not found".to_string())));
        assert_eq!(state(&table), TransferState::Failed);
    }

    #[test]
    fn test_empty_download() {
        let (router, table, _) = router();
        let mut events = transfer(&table, TransferDirection::Download, TransferState::Initiating, None);
        let _response = pending(&table, Some(77));

        router.route(LogicalMessage::new(MessageKind::Response, false, &b"0"[..]));
        assert_eq!(state(&table), TransferState::Completing);
        assert_eq!(events.try_recv(), Ok(TransferEvent::End));
    }

    #[rstest]
    #[case::matching_count(None, Some(2), TransferState::Completing)]
    #[case::without_count(None, None, TransferState::Completing)]
    #[case::count_mismatch(None, Some(3), TransferState::Failed)]
    #[case::size_mismatch(Some(100), None, TransferState::Failed)]
    fn test_download_end(#[case] expected_len: Option<u64>, #[case] chunk_count: Option<u32>, #[case] expected_state: TransferState) {
        let (router, table, _) = router();
        let mut events = transfer(&table, TransferDirection::Download, TransferState::Active, expected_len);

        router.route(stream(StreamFrame::Data(Bytes::from_static(b"abc"))));
        router.route(stream(StreamFrame::Data(Bytes::from_static(b"def"))));
        router.route(stream(StreamFrame::End { chunk_count }));
        assert_eq!(state(&table), expected_state);

        assert!(matches!(events.try_recv(), Ok(TransferEvent::Data(_))));
        assert!(matches!(events.try_recv(), Ok(TransferEvent::Data(_))));
        match expected_state {
            TransferState::Completing => assert_eq!(events.try_recv(), Ok(TransferEvent::End)),
            _ => assert!(matches!(events.try_recv(), Ok(TransferEvent::Failed(LinkError::Protocol(_))))),
        }
    }

    #[test]
    fn test_download_overrun() {
        let (router, table, _) = router();
        let mut events = transfer(&table, TransferDirection::Download, TransferState::Active, Some(2));

        router.route(stream(StreamFrame::Data(Bytes::from_static(b"abc"))));
        assert_eq!(state(&table), TransferState::Failed);
        assert!(matches!(events.try_recv(), Ok(TransferEvent::Failed(LinkError::Protocol(_)))));
    }

    #[test]
    fn test_device_reported_transfer_failure() {
        let (router, table, _) = router();
        let mut events = transfer(&table, TransferDirection::Download, TransferState::Active, None);

        assert_eq!(router.route(LogicalMessage::new(MessageKind::Stream, true, &b"camera busy"[..])), RouteOutcome::Transferred);
        assert_eq!(state(&table), TransferState::Failed);
        assert_eq!(events.try_recv(), Ok(TransferEvent::Failed(LinkError::Device("camera busy".to_string()))));
    }

    #[test]
    fn test_upload_acks_and_confirmation() {
        let (router, table, _) = router();
        let mut events = transfer(&table, TransferDirection::Upload, TransferState::Active, None);

        assert_eq!(router.route(stream(StreamFrame::Ack { acknowledged: 100 })), RouteOutcome::Transferred);
        assert_eq!(events.try_recv(), Ok(TransferEvent::Ack(100)));

        table.lock().transfer_mut(77).unwrap().state = TransferState::Completing;
        assert_eq!(router.route(stream(StreamFrame::End { chunk_count: None })), RouteOutcome::Transferred);
        assert_eq!(state(&table), TransferState::Done);
        assert_eq!(events.try_recv(), Ok(TransferEvent::End));
    }

    #[test]
    fn test_upload_ended_early() {
        let (router, table, _) = router();
        let mut events = transfer(&table, TransferDirection::Upload, TransferState::Active, None);

        router.route(stream(StreamFrame::End { chunk_count: None }));
        assert_eq!(state(&table), TransferState::Failed);
        assert!(matches!(events.try_recv(), Ok(TransferEvent::Failed(LinkError::Protocol(_)))));
    }

    #[test]
    fn test_stream_corruption() {
        let (router, table, _) = router();
        let mut events = transfer(&table, TransferDirection::Download, TransferState::Active, None);

        router.on_stream_corruption(&LinkError::Protocol("out of sequence".to_string()));
        assert_eq!(state(&table), TransferState::Failed);
        assert_eq!(events.try_recv(), Ok(TransferEvent::Failed(LinkError::Protocol("out of sequence".to_string()))));
    }

    #[test]
    fn test_disconnect() {
        let (router, table, _) = router();
        let mut response = pending(&table, None);
        let mut events = transfer(&table, TransferDirection::Download, TransferState::Active, None);
        let mut tap = waiter(&table, EventKind::Tap);
        let mut disconnect = waiter(&table, EventKind::Disconnect);

        assert!(router.route_disconnect("link lost"));

        let expected = LinkError::Connection("link lost".to_string());
        assert_eq!(response.try_recv().unwrap(), Err(expected.clone()));
        assert_eq!(events.try_recv(), Ok(TransferEvent::Failed(expected.clone())));
        assert_eq!(tap.try_recv().unwrap(), Err(expected));
        assert_eq!(disconnect.try_recv().unwrap(), Ok(Event::disconnect()));
        assert!(table.lock().waiters.is_empty());
        assert_eq!(state(&table), TransferState::Failed);

        assert!(!router.route_disconnect("again"));
    }
}
