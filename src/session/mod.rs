//! Owning a link over its lifetime: finding and connecting to a device, and reconnecting after
//!  the link was lost.

pub mod backoff;
#[cfg(feature = "ble")]
pub mod ble;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{LinkConfig, ReconnectPolicy};
use crate::error::LinkError;
use crate::events::EventKind;
use crate::link::Link;
use crate::session::backoff::ExponentialBackoff;
use crate::transport::Connection;

/// Which device to connect to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceTarget {
    /// the device with the strongest signal among those advertising the device service
    Nearest,
    /// a specific device by its platform specific address
    Address(String),
    /// the first device advertising this local name
    Named(String),
}

/// Discovery, pairing and subscription: everything it takes to turn a [DeviceTarget] into an
///  established [Connection].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, target: &DeviceTarget) -> anyhow::Result<Connection>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    Connected { peer: String },
    Disconnected { peer: String },
}

/// Owns the current [Link] to a device. The link is replaced when the session connects again,
///  either explicitly or - with [ReconnectPolicy::Retry] - implicitly when a lost link is
///  requested through [LinkSession::link].
pub struct LinkSession {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    target: DeviceTarget,
    link: Mutex<Option<Arc<Link>>>,
    event_notifier: broadcast::Sender<SessionEvent>,
}

impl LinkSession {
    pub fn new(config: LinkConfig, connector: Arc<dyn Connector>, target: DeviceTarget) -> anyhow::Result<LinkSession> {
        config.validate()?;

        let (event_notifier, _) = broadcast::channel(32);
        Ok(LinkSession {
            config,
            connector,
            target,
            link: Mutex::new(None),
            event_notifier,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_notifier.subscribe()
    }

    /// Connects to the target device, returning the current link if it is still connected.
    ///  Connection attempts are retried as configured.
    pub async fn connect(&self) -> Result<Arc<Link>, LinkError> {
        let mut current = self.link.lock().await;
        if let Some(link) = current.as_ref() {
            if link.is_connected() {
                return Ok(link.clone());
            }
        }

        let link = self.establish().await?;
        *current = Some(link.clone());
        Ok(link)
    }

    /// The current link. If it was lost, this reconnects for [ReconnectPolicy::Retry] and fails
    ///  with a connection error for [ReconnectPolicy::Fail].
    pub async fn link(&self) -> Result<Arc<Link>, LinkError> {
        {
            let current = self.link.lock().await;
            match current.as_ref() {
                Some(link) if link.is_connected() => return Ok(link.clone()),
                None => return Err(LinkError::Connection("session is not connected".to_string())),
                Some(_) => {}
            }
        }

        match self.config.reconnect {
            ReconnectPolicy::Fail => Err(LinkError::Connection("link was lost".to_string())),
            ReconnectPolicy::Retry { .. } => {
                info!("link to {:?} was lost - reconnecting", self.target);
                self.connect().await
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await
            .as_ref()
            .is_some_and(|link| link.is_connected())
    }

    /// Disconnects the current link, if any. Calling this repeatedly has no effect.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let link = self.link.lock().await.take();
        match link {
            Some(link) => link.disconnect().await,
            None => {
                debug!("session is not connected - nothing to disconnect");
                Ok(())
            }
        }
    }

    async fn establish(&self) -> Result<Arc<Link>, LinkError> {
        let mut backoff = match self.config.reconnect {
            ReconnectPolicy::Fail => None,
            ReconnectPolicy::Retry { max_attempts, initial_delay, max_delay } => Some(ExponentialBackoff::new(initial_delay, max_delay, max_attempts)),
        };

        loop {
            match self.try_connect().await {
                Ok(link) => return Ok(link),
                Err(e) => match backoff.as_mut().and_then(|b| b.next_delay()) {
                    Some(delay) => {
                        warn!("connecting to {:?} failed, retrying in {:?}: {:#}", self.target, delay, e);
                        sleep(delay).await;
                    }
                    None => {
                        warn!("connecting to {:?} failed: {:#}", self.target, e);
                        return Err(LinkError::Connection(format!("{:#}", e)));
                    }
                },
            }
        }
    }

    async fn try_connect(&self) -> anyhow::Result<Arc<Link>> {
        let connection = self.connector.connect(&self.target).await?;
        let link = Link::start(self.config.clone(), connection)?;

        if self.config.break_on_connect {
            link.send_break_signal().await?;
        }

        let peer = link.peer().to_string();
        let event_notifier = self.event_notifier.clone();
        let disconnected_peer = peer.clone();
        link.on_event(EventKind::Disconnect, move |_| {
            let _ = event_notifier.send(SessionEvent::Disconnected { peer: disconnected_peer.clone() });
        });

        info!("connected to {}", peer);
        let _ = self.event_notifier.send(SessionEvent::Connected { peer });
        Ok(Arc::new(link))
    }
}
