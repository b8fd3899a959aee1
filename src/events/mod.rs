//! Unsolicited device events and the primitives for waiting on them.

mod waiters;

pub(crate) use waiters::EventWaiters;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    /// the wearer tapped the device
    Tap,
    /// the device woke up from sleep
    Wake,
    /// The link was lost or closed. This is synthesized on the host and never sent by the device.
    Disconnect,
    /// application specific event codes
    Custom(u8),
}

impl EventKind {
    const WAKE_CODE: u8 = 0x03;
    const TAP_CODE: u8 = 0x04;

    pub fn from_code(code: u8) -> EventKind {
        match code {
            Self::WAKE_CODE => EventKind::Wake,
            Self::TAP_CODE => EventKind::Tap,
            other => EventKind::Custom(other),
        }
    }

    /// wire code of the event kind, `None` for the purely local [EventKind::Disconnect]
    pub fn code(&self) -> Option<u8> {
        match self {
            EventKind::Wake => Some(Self::WAKE_CODE),
            EventKind::Tap => Some(Self::TAP_CODE),
            EventKind::Disconnect => None,
            EventKind::Custom(code) => Some(*code),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub data: Bytes,
}

impl Event {
    pub fn new(kind: EventKind, data: impl Into<Bytes>) -> Event {
        Event {
            kind,
            data: data.into(),
        }
    }

    pub(crate) fn disconnect() -> Event {
        Event::new(EventKind::Disconnect, Bytes::new())
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let Some(code) = self.kind.code() else {
            bail!("{:?} events are local and have no wire representation", self.kind);
        };
        buf.put_u8(code);
        buf.put_slice(&self.data);
        Ok(())
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<Event> {
        if !buf.has_remaining() {
            bail!("event without event code");
        }
        let kind = EventKind::from_code(buf.get_u8());
        Ok(Event { kind, data: buf })
    }
}

/// Result of waiting for an event. Running into the timeout is an expected outcome rather than
///  an error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    Fired(Event),
    TimedOut,
}

impl WaitOutcome {
    pub fn is_fired(&self) -> bool {
        matches!(self, WaitOutcome::Fired(_))
    }
}
