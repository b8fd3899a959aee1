use std::cmp::min;

use anyhow::bail;

use crate::protocol::fragment::{Fragment, FragmentHeader, FragmentPosition, MessageKind};

/// Splits outbound messages into fragments that fit the link's maximum write length.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Chunker {
    max_fragment_len: usize,
}

impl Chunker {
    /// `max_fragment_len` is the full length of a fragment including its header, i.e. the
    ///  largest write the link accepts (ATT MTU - 3 on BLE).
    pub fn new(max_fragment_len: usize) -> anyhow::Result<Chunker> {
        if max_fragment_len <= FragmentHeader::SERIALIZED_LEN {
            bail!("maximum fragment length {} leaves no room for payload", max_fragment_len);
        }
        Ok(Chunker { max_fragment_len })
    }

    pub fn max_fragment_len(&self) -> usize {
        self.max_fragment_len
    }

    pub fn max_payload_per_fragment(&self) -> usize {
        self.max_fragment_len - FragmentHeader::SERIALIZED_LEN
    }

    pub fn num_fragments(&self, payload_len: usize) -> usize {
        if payload_len == 0 {
            1
        }
        else {
            payload_len.div_ceil(self.max_payload_per_fragment())
        }
    }

    /// Returns the lazy sequence of fragments for a payload. The returned iterator borrows the
    ///  payload and can be cloned to start over.
    pub fn chunk<'a>(&self, kind: MessageKind, error: bool, payload: &'a [u8]) -> Fragments<'a> {
        Fragments {
            kind,
            error,
            remaining: payload,
            piece_len: self.max_payload_per_fragment(),
            sequence: 0,
            started: false,
            done: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Fragments<'a> {
    kind: MessageKind,
    error: bool,
    remaining: &'a [u8],
    piece_len: usize,
    sequence: u8,
    started: bool,
    done: bool,
}

impl<'a> Iterator for Fragments<'a> {
    type Item = Fragment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let is_first = !self.started;
        let (piece, rest) = self.remaining.split_at(min(self.piece_len, self.remaining.len()));
        let is_last = rest.is_empty();

        let fragment = Fragment {
            header: FragmentHeader {
                kind: self.kind,
                position: FragmentPosition::new(is_first, is_last),
                error: self.error,
                sequence: self.sequence,
            },
            payload: piece,
        };

        self.sequence = self.sequence.wrapping_add(1);
        self.remaining = rest;
        self.started = true;
        self.done = is_last;
        Some(fragment)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = if self.done {
            0
        }
        else if self.remaining.is_empty() {
            1
        }
        else {
            self.remaining.len().div_ceil(self.piece_len)
        };
        (n, Some(n))
    }
}

impl ExactSizeIterator for Fragments<'_> {}
