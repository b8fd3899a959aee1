use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The closed set of logical message kinds. Each kind has its own reassembly buffer, and the
///  router switches on it to find the (single) destination of a message.
///
/// On the outbound characteristic, `Response` is the request channel: requests travel with this
///  kind, and the device answers with it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    Response = 0,
    Log = 1,
    Stream = 2,
    Event = 3,
}
impl MessageKind {
    pub const ALL: [MessageKind; 4] = [MessageKind::Response, MessageKind::Log, MessageKind::Stream, MessageKind::Event];

    pub(crate) fn index(self) -> usize {
        u8::from(self) as usize
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FragmentPosition {
    Continuation = 0,
    First = 1,
    Last = 2,
    /// a message that fits a single fragment, i.e. both first and last
    Only = 3,
}
impl FragmentPosition {
    pub fn new(is_first: bool, is_last: bool) -> FragmentPosition {
        match (is_first, is_last) {
            (true, true) => FragmentPosition::Only,
            (true, false) => FragmentPosition::First,
            (false, true) => FragmentPosition::Last,
            (false, false) => FragmentPosition::Continuation,
        }
    }

    pub fn is_first(self) -> bool {
        matches!(self, FragmentPosition::First | FragmentPosition::Only)
    }

    pub fn is_last(self) -> bool {
        matches!(self, FragmentPosition::Last | FragmentPosition::Only)
    }
}

/// Two-byte header in front of every tagged fragment:
///
/// ```ascii
/// byte 0: 1 0 E R K K P P
///         |   | | |   +-- position (continuation, first, last, only)
///         |   | | +------ message kind
///         |   | +-------- reserved, must be 0
///         |   +---------- error flag
///         +-------------- marker '10'
/// byte 1: sequence number inside the message, starting at 0 and wrapping
/// ```
///
/// Bytes 0x80..=0xBF are UTF-8 continuation bytes and never start a valid string, so a tagged
///  fragment can always be told apart from a plain text print of the device's script engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FragmentHeader {
    pub kind: MessageKind,
    pub position: FragmentPosition,
    pub error: bool,
    pub sequence: u8,
}

impl FragmentHeader {
    pub const SERIALIZED_LEN: usize = 2;

    const MARKER_MASK: u8 = 0b1100_0000;
    const MARKER: u8 = 0b1000_0000;
    const ERROR_FLAG: u8 = 0b0010_0000;
    const RESERVED: u8 = 0b0001_0000;

    pub fn is_tagged(first_byte: u8) -> bool {
        first_byte & Self::MARKER_MASK == Self::MARKER
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let mut flags = Self::MARKER
            | (u8::from(self.kind) << 2)
            | u8::from(self.position);
        if self.error {
            flags |= Self::ERROR_FLAG;
        }
        buf.put_u8(flags);
        buf.put_u8(self.sequence);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FragmentHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("fragment of {} bytes is shorter than its header", buf.remaining());
        }

        let flags = buf.get_u8();
        if !Self::is_tagged(flags) {
            bail!("missing fragment marker: {:#04x}", flags);
        }
        if flags & Self::RESERVED != 0 {
            bail!("reserved header bit is set: {:#04x}", flags);
        }

        Ok(FragmentHeader {
            kind: MessageKind::try_from((flags >> 2) & 0b11)?,
            position: FragmentPosition::try_from(flags & 0b11)?,
            error: flags & Self::ERROR_FLAG != 0,
            sequence: buf.get_u8(),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fragment<'a> {
    pub header: FragmentHeader,
    pub payload: &'a [u8],
}

impl Fragment<'_> {
    pub fn serialized_len(&self) -> usize {
        FragmentHeader::SERIALIZED_LEN + self.payload.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.header.ser(buf);
        buf.put_slice(self.payload);
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf
    }
}
