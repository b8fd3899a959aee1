use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for a single link. They are updated without locking and can be read at any time.
#[derive(Debug, Default)]
pub struct LinkStats {
    notifications_received: AtomicU64,
    messages_routed: AtomicU64,
    stray_messages: AtomicU64,
    protocol_errors: AtomicU64,
    resyncs: AtomicU64,
    fragments_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LinkStatsSnapshot {
    pub notifications_received: u64,
    pub messages_routed: u64,
    /// complete messages that had no recipient and were dropped
    pub stray_messages: u64,
    pub protocol_errors: u64,
    pub resyncs: u64,
    pub fragments_sent: u64,
    pub bytes_sent: u64,
}

impl LinkStats {
    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            notifications_received: self.notifications_received.load(Ordering::Relaxed),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            stray_messages: self.stray_messages.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            fragments_sent: self.fragments_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn on_notification(&self) {
        self.notifications_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_routed(&self) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_stray(&self) {
        self.stray_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_resyncs(&self, resyncs: u64) {
        self.resyncs.store(resyncs, Ordering::Relaxed);
    }

    pub(crate) fn on_fragment_sent(&self, len: usize) {
        self.fragments_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }
}
