use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::error::LinkError;
use crate::link::{acquire_slot, LinkCore};
use crate::protocol::MessageKind;
use crate::routing::table::PendingRequest;

/// The device's answer to a request, together with everything it logged while processing it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub body: Bytes,
    pub logs: Vec<String>,
}

impl Response {
    /// the body as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Serializes request / response traffic: at most one request is pending at any time, and
///  callers wait for the request slot in FIFO order.
#[derive(Clone)]
pub(crate) struct Correlator {
    core: Arc<LinkCore>,
}

impl Correlator {
    pub fn new(core: Arc<LinkCore>) -> Correlator {
        Correlator { core }
    }

    /// `timeout` covers waiting for the response, not waiting for the request slot
    pub async fn call(&self, request: &[u8], timeout: Duration) -> Result<Response, LinkError> {
        let correlation_id = Uuid::new_v4();
        self.do_call(request, timeout, None)
            .instrument(span!(Level::TRACE, "call", ?correlation_id))
            .await
    }

    /// Sends a transfer's initiation request. The router activates the transfer when it routes
    ///  the response.
    pub async fn call_initiating(&self, request: &[u8], timeout: Duration, transfer_id: u64) -> Result<Response, LinkError> {
        let correlation_id = Uuid::new_v4();
        self.do_call(request, timeout, Some(transfer_id))
            .instrument(span!(Level::TRACE, "initiate_transfer", ?correlation_id, transfer_id))
            .await
    }

    /// Sends a request without waiting for a response.
    ///
    /// The device may answer anyway. Such an answer must not resolve the next caller's request, so
    ///  the request stays pending in the background, holding the request slot, until the answer
    ///  arrives or [crate::config::LinkConfig::fire_and_forget_reply_window] passes. The answer is
    ///  discarded.
    pub async fn fire_and_forget(&self, request: &[u8]) -> Result<(), LinkError> {
        let correlation_id = Uuid::new_v4();
        self.do_fire_and_forget(request)
            .instrument(span!(Level::TRACE, "fire_and_forget", ?correlation_id))
            .await
    }

    async fn do_fire_and_forget(&self, request: &[u8]) -> Result<(), LinkError> {
        let permit = acquire_slot(&self.core.request_slot, self.core.config.request_busy_policy, "request slot").await?;
        let reply_window = self.core.config.fire_and_forget_reply_window;

        if reply_window.is_zero() {
            if self.core.table.lock().disconnected {
                return Err(LinkError::Connection("link is disconnected".to_string()));
            }
            trace!("sending request of {} bytes without waiting for a response", request.len());
            return self.core.send_message(MessageKind::Response, false, request).await;
        }

        let (responder, receiver) = oneshot::channel();
        let pending = self.register(responder, None)?;
        self.core.send_message(MessageKind::Response, false, request).await?;

        let id = pending.id;
        trace!("request {} sent, discarding any response within {:?}", id, reply_window);
        tokio::spawn(async move {
            let _permit = permit;
            let _pending = pending;
            match time::timeout(reply_window, receiver).await {
                Ok(Ok(Ok(response))) => debug!("discarding response to request {}: {:?}", id, response.text()),
                Ok(Ok(Err(LinkError::Device(e)))) => warn!("request {} failed on the device: {}", id, e),
                Ok(Ok(Err(e))) => debug!("request {} ended: {}", id, e),
                Ok(Err(_)) => {}
                Err(_) => trace!("no response to request {} within {:?}", id, reply_window),
            }
        }.in_current_span());
        Ok(())
    }

    async fn do_call(&self, request: &[u8], timeout: Duration, initiates_transfer: Option<u64>) -> Result<Response, LinkError> {
        let _permit = acquire_slot(&self.core.request_slot, self.core.config.request_busy_policy, "request slot").await?;

        let (responder, receiver) = oneshot::channel();
        let pending = self.register(responder, initiates_transfer)?;
        let id = pending.id;

        self.core.send_message(MessageKind::Response, false, request).await?;
        trace!("request {} sent, waiting for response", id);

        match time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Connection("link closed while waiting for a response".to_string())),
            Err(_) => {
                debug!("no response to request {} within {:?}", id, timeout);
                Err(LinkError::Timeout(format!("no response within {:?}", timeout)))
            }
        }
    }

    /// must be called while holding the request slot
    fn register(&self, responder: oneshot::Sender<Result<Response, LinkError>>, initiates_transfer: Option<u64>) -> Result<PendingGuard, LinkError> {
        let mut table = self.core.table.lock();
        if table.disconnected {
            return Err(LinkError::Connection("link is disconnected".to_string()));
        }
        let id = table.next_id();
        table.pending = Some(PendingRequest {
            id,
            responder,
            logs: Vec::new(),
            initiates_transfer,
        });
        Ok(PendingGuard { core: self.core.clone(), id })
    }
}

/// Clears the pending request unless it was resolved already. A response arriving after this
///  finds no pending request and is dropped as stray.
struct PendingGuard {
    core: Arc<LinkCore>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut table = self.core.table.lock();
        if table.pending.as_ref().is_some_and(|p| p.id == self.id) {
            table.pending = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusyPolicy, LinkConfig};
    use crate::test_util::simulated::SimulatedDevice;

    fn config() -> LinkConfig {
        let mut config = LinkConfig::new();
        config.break_on_connect = false;
        config
    }

    #[tokio::test]
    async fn test_call() {
        let (device, link) = SimulatedDevice::connected(config(), 20);

        let device_task = {
            let device = device.clone();
            tokio::spawn(async move {
                let request = device.next_message().await;
                assert_eq!(request.kind, MessageKind::Response);
                assert_eq!(request.payload.as_ref(), b"print(battery_level())");
                device.log("measuring");
                device.print("still measuring");
                device.respond(b"87");
            })
        };

        let response = link.call(b"print(battery_level())", Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.text(), "87");
        assert_eq!(response.logs, vec!["measuring".to_string(), "still measuring".to_string()]);
        device_task.await.unwrap();
        assert!(link.core().table.lock().pending.is_none());
    }

    #[tokio::test]
    async fn test_fifo() {
        let (device, link) = SimulatedDevice::connected(config(), 20);

        let calls = (0..5)
            .map(|i| {
                let link = link.clone();
                tokio::spawn(async move { link.call(format!("request {}", i).as_bytes(), Duration::from_secs(5)).await })
            })
            .collect::<Vec<_>>();

        for i in 0..5 {
            let request = device.next_message().await;
            assert_eq!(request.payload.as_ref(), format!("request {}", i).as_bytes());
            // only one request is on the wire at any time
            device.quiesce().await;
            assert!(device.try_next_message().is_none());
            device.respond(format!("response {}", i).as_bytes());
        }

        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().unwrap().text(), format!("response {}", i));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_slot() {
        let (device, link) = SimulatedDevice::connected(config(), 20);

        let result = link.call(b"slow()", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(LinkError::Timeout(_))));
        assert!(link.core().table.lock().pending.is_none());

        assert_eq!(device.next_message().await.payload.as_ref(), b"slow()");
        device.respond(b"late");
        device.settle(|| link.stats().stray_messages == 1).await;

        let device_task = {
            let device = device.clone();
            tokio::spawn(async move {
                assert_eq!(device.next_message().await.payload.as_ref(), b"fast()");
                device.respond(b"ok");
            })
        };
        assert_eq!(link.call(b"fast()", Duration::from_secs(1)).await.unwrap().text(), "ok");
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_device_error() {
        let (device, link) = SimulatedDevice::connected(config(), 20);
        let device_task = {
            let device = device.clone();
            tokio::spawn(async move {
                device.next_message().await;
                device.respond_error(b"attempt to call a nil value");
            })
        };

        let result = link.call(b"undefined()", Duration::from_secs(5)).await;
        assert_eq!(result, Err(LinkError::Device("attempt to call a nil value".to_string())));
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reject_when_busy() {
        let mut config = config();
        config.request_busy_policy = BusyPolicy::Reject;
        let (device, link) = SimulatedDevice::connected(config, 20);

        let first = {
            let link = link.clone();
            tokio::spawn(async move { link.call(b"first", Duration::from_secs(5)).await })
        };
        device.next_message().await;

        assert_eq!(link.call(b"second", Duration::from_secs(5)).await, Err(LinkError::Busy("request slot")));
        assert_eq!(link.fire_and_forget(b"third").await, Err(LinkError::Busy("request slot")));

        device.respond(b"done");
        assert_eq!(first.await.unwrap().unwrap().text(), "done");
    }

    #[tokio::test]
    async fn test_cancelled_call_releases_slot() {
        let (device, link) = SimulatedDevice::connected(config(), 20);

        let abandoned = {
            let link = link.clone();
            tokio::spawn(async move { link.call(b"abandoned", Duration::from_secs(60)).await })
        };
        device.next_message().await;
        abandoned.abort();
        device.settle(|| link.core().table.lock().pending.is_none()).await;

        let device_task = {
            let device = device.clone();
            tokio::spawn(async move {
                assert_eq!(device.next_message().await.payload.as_ref(), b"next");
                device.respond(b"ok");
            })
        };
        assert_eq!(link.call(b"next", Duration::from_secs(5)).await.unwrap().text(), "ok");
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_fire_and_forget() {
        let (device, link) = SimulatedDevice::connected(config(), 20);

        link.fire_and_forget(b"frame.display.show()").await.unwrap();
        assert_eq!(device.next_message().await.payload.as_ref(), b"frame.display.show()");
        assert!(link.core().table.lock().pending.is_some());

        device.respond(b"nil");
        device.settle(|| link.core().table.lock().pending.is_none()).await;
        assert_eq!(link.stats().stray_messages, 0);
    }

    #[tokio::test]
    async fn test_fire_and_forget_response_goes_to_its_request() {
        let (device, link) = SimulatedDevice::connected(config(), 20);

        link.fire_and_forget(b"show()").await.unwrap();
        let call = {
            let link = link.clone();
            tokio::spawn(async move { link.call(b"battery()", Duration::from_secs(5)).await })
        };

        assert_eq!(device.next_message().await.payload.as_ref(), b"show()");
        // the call waits until the first request was answered
        device.quiesce().await;
        assert!(device.try_next_message().is_none());
        device.respond(b"reply to show");

        assert_eq!(device.next_message().await.payload.as_ref(), b"battery()");
        device.respond(b"87");
        assert_eq!(call.await.unwrap().unwrap().text(), "87");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_forget_reply_window() {
        let (device, link) = SimulatedDevice::connected(config(), 20);

        let started = time::Instant::now();
        link.fire_and_forget(b"show()").await.unwrap();
        let call = {
            let link = link.clone();
            tokio::spawn(async move { link.call(b"battery()", Duration::from_secs(5)).await })
        };

        assert_eq!(device.next_message().await.payload.as_ref(), b"show()");
        assert_eq!(device.next_message().await.payload.as_ref(), b"battery()");
        assert!(started.elapsed() >= link.config().fire_and_forget_reply_window);

        device.respond(b"87");
        assert_eq!(call.await.unwrap().unwrap().text(), "87");
    }

    #[tokio::test]
    async fn test_fire_and_forget_without_reply_window() {
        let mut config = config();
        config.fire_and_forget_reply_window = Duration::ZERO;
        let (device, link) = SimulatedDevice::connected(config, 20);

        link.fire_and_forget(b"frame.display.show()").await.unwrap();
        assert_eq!(device.next_message().await.payload.as_ref(), b"frame.display.show()");
        assert!(link.core().table.lock().pending.is_none());
        assert_eq!(link.core().request_slot.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_resolves_all_callers() {
        let (device, link) = SimulatedDevice::connected(config(), 20);

        let calls = (0..3)
            .map(|i| {
                let link = link.clone();
                tokio::spawn(async move { link.call(format!("{}", i).as_bytes(), Duration::from_secs(60)).await })
            })
            .collect::<Vec<_>>();
        device.next_message().await;
        device.quiesce().await;

        device.drop_link();
        for call in calls {
            assert!(matches!(call.await.unwrap(), Err(LinkError::Connection(_))));
        }
        assert!(matches!(link.call(b"after", Duration::from_secs(1)).await, Err(LinkError::Connection(_))));
        assert!(matches!(link.fire_and_forget(b"after").await, Err(LinkError::Connection(_))));
    }
}
