use bytes::{Bytes, BytesMut};
use tracing::{trace, warn};

use crate::error::LinkError;
use crate::protocol::fragment::{FragmentHeader, FragmentPosition, MessageKind};

/// A complete message reassembled from a run of fragments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogicalMessage {
    pub kind: MessageKind,
    /// set if the device flagged this message as an error report
    pub error: bool,
    pub payload: Bytes,
}

impl LogicalMessage {
    pub fn new(kind: MessageKind, error: bool, payload: impl Into<Bytes>) -> LogicalMessage {
        LogicalMessage {
            kind,
            error,
            payload: payload.into(),
        }
    }
}

struct PartialRun {
    error: bool,
    next_sequence: u8,
    buf: BytesMut,
}

/// Turns inbound notifications back into [LogicalMessage]s. There is one buffer per message kind,
///  so runs of different kinds may interleave, while runs of the same kind may not: A 'first'
///  fragment discards an unterminated run of its kind and starts over (resync).
///
/// Notifications that do not start with a fragment marker are plain prints of the device's script
///  engine. They are turned into complete log messages if `accept_untagged` is set, and rejected
///  otherwise.
pub struct Reassembler {
    runs: [Option<PartialRun>; 4],
    max_message_len: usize,
    accept_untagged: bool,
    num_resyncs: u64,
}

impl Reassembler {
    pub fn new(max_message_len: usize, accept_untagged: bool) -> Reassembler {
        Reassembler {
            runs: Default::default(),
            max_message_len,
            accept_untagged,
            num_resyncs: 0,
        }
    }

    /// number of incomplete runs that were discarded because a new run of the same kind started
    pub fn num_resyncs(&self) -> u64 {
        self.num_resyncs
    }

    pub fn has_partial(&self, kind: MessageKind) -> bool {
        self.runs[kind.index()].is_some()
    }

    /// Drops all partial runs, e.g. after the link was lost.
    pub fn clear(&mut self) {
        self.runs = Default::default();
    }

    /// Consumes a single inbound notification, returning a message once its last fragment arrives.
    ///
    /// Errors are protocol errors concerning this fragment; the reassembler stays usable. An error
    ///  for a continuation fragment discards the partial run it was supposed to continue, so a
    ///  corrupted message is never returned.
    pub fn feed(&mut self, raw: &[u8]) -> Result<Option<LogicalMessage>, LinkError> {
        let Some(&first_byte) = raw.first() else {
            return Err(LinkError::Protocol("empty notification".to_string()));
        };

        if !FragmentHeader::is_tagged(first_byte) {
            if self.accept_untagged {
                trace!("untagged notification of {} bytes - treating it as a print", raw.len());
                return Ok(Some(LogicalMessage::new(MessageKind::Log, false, Bytes::copy_from_slice(raw))));
            }
            return Err(LinkError::Protocol(format!("untagged notification starting with {:#04x}", first_byte)));
        }

        let mut parse_buf = raw;
        let header = FragmentHeader::deser(&mut parse_buf)
            .map_err(|e| LinkError::Protocol(format!("malformed fragment header: {}", e)))?;
        let payload = parse_buf;
        let slot = &mut self.runs[header.kind.index()];

        if header.position.is_first() {
            if header.sequence != 0 {
                return Err(LinkError::Protocol(format!("{:?} fragment starts with sequence number {}", header.kind, header.sequence)));
            }
            if slot.take().is_some() {
                warn!("new {:?} message started before the previous one was complete - discarding the incomplete message", header.kind);
                self.num_resyncs += 1;
            }
            if payload.len() > self.max_message_len {
                return Err(LinkError::Protocol(format!("{:?} message exceeds the maximum length of {} bytes", header.kind, self.max_message_len)));
            }

            if header.position == FragmentPosition::Only {
                return Ok(Some(LogicalMessage::new(header.kind, header.error, Bytes::copy_from_slice(payload))));
            }

            let mut buf = BytesMut::with_capacity(payload.len() * 4);
            buf.extend_from_slice(payload);
            *slot = Some(PartialRun {
                error: header.error,
                next_sequence: 1,
                buf,
            });
            return Ok(None);
        }

        let Some(run) = slot.as_mut() else {
            return Err(LinkError::Protocol(format!("{:?} fragment #{} without a preceding first fragment", header.kind, header.sequence)));
        };
        if header.sequence != run.next_sequence {
            let expected = run.next_sequence;
            *slot = None;
            return Err(LinkError::Protocol(format!("{:?} fragment out of sequence: expected #{}, got #{} - discarding the message", header.kind, expected, header.sequence)));
        }
        if run.buf.len() + payload.len() > self.max_message_len {
            *slot = None;
            return Err(LinkError::Protocol(format!("{:?} message exceeds the maximum length of {} bytes", header.kind, self.max_message_len)));
        }

        run.buf.extend_from_slice(payload);
        run.next_sequence = run.next_sequence.wrapping_add(1);

        if header.position == FragmentPosition::Last {
            if let Some(run) = slot.take() {
                trace!("completed {:?} message of {} bytes", header.kind, run.buf.len());
                return Ok(Some(LogicalMessage::new(header.kind, run.error, run.buf.freeze())));
            }
        }
        Ok(None)
    }
}
