use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum StreamOpcode {
    Data = 0,
    End = 1,
    Ack = 2,
}

/// Payload of a (non-error) stream message, i.e. the bulk transfer sub-protocol.
///
/// ```ascii
/// DATA: 0x00, payload bytes
/// END:  0x01, [u32 number of DATA messages in the transfer]
/// ACK:  0x02, u64 cumulative number of bytes acknowledged
/// ```
///
/// A stream message with the error flag set carries a UTF-8 reason instead: a device reporting a
///  failed transfer, or the host aborting one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamFrame {
    Data(Bytes),
    End { chunk_count: Option<u32> },
    Ack { acknowledged: u64 },
}

impl StreamFrame {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            StreamFrame::Data(data) => {
                buf.put_u8(StreamOpcode::Data.into());
                buf.put_slice(data);
            }
            StreamFrame::End { chunk_count } => {
                buf.put_u8(StreamOpcode::End.into());
                if let Some(chunk_count) = chunk_count {
                    buf.put_u32(*chunk_count);
                }
            }
            StreamFrame::Ack { acknowledged } => {
                buf.put_u8(StreamOpcode::Ack.into());
                buf.put_u64(*acknowledged);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<StreamFrame> {
        if !buf.has_remaining() {
            bail!("empty stream message");
        }

        match StreamOpcode::try_from(buf.get_u8())? {
            StreamOpcode::Data => Ok(StreamFrame::Data(buf)),
            StreamOpcode::End => {
                match buf.remaining() {
                    0 => Ok(StreamFrame::End { chunk_count: None }),
                    4 => Ok(StreamFrame::End { chunk_count: Some(buf.get_u32()) }),
                    n => bail!("end of stream with {} trailing bytes", n),
                }
            }
            StreamOpcode::Ack => {
                if buf.remaining() != size_of::<u64>() {
                    bail!("stream ack with {} bytes instead of 8", buf.remaining());
                }
                Ok(StreamFrame::Ack { acknowledged: buf.get_u64() })
            }
        }
    }
}
