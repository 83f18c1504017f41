//! The wire codec: every command travels in a self-describing frame, see the crate documentation
//!  for the byte layout.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::connection_id::ConnectionId;
use crate::packet_id::PacketId;
use crate::util::buf::BufExt;

pub const MAGIC: u32 = 0x5253_4F4B;

/// magic number, command kind, total frame length
pub const HEADER_LEN: usize = size_of::<u32>() + size_of::<u16>() + size_of::<u32>();

/// An upper bound for everything in a DATA frame except the payload: header, the connection id
///  (a 36 character UUID with its length prefix, plus the counter), packet id and payload length
pub const MAX_HEADER_AND_DATA_OVERHEAD: usize = HEADER_LEN + (2 + 36 + 4) + 4 + 4;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum CommandKind {
    NewConnection = 1,
    JoinConnection = 2,
    CloseConnection = 3,
    Acknowledge = 4,
    Data = 5,
    DataReceived = 6,
    DataRequest = 7,
    DataRequestOnReconnect = 8,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Command {
    NewConnection,
    JoinConnection,
    CloseConnection,
    /// Confirms receipt of a command. The meaning of `param` depends on the acknowledged command:
    ///  it is the handshake step (1 or 2) for NEW_CONNECTION / JOIN_CONNECTION, the first packet
    ///  id the sender is missing for DATA_REQUEST_ON_RECONNECT, and 0 for CLOSE_CONNECTION.
    Acknowledge { acked: CommandKind, param: u32 },
    Data { packet_id: PacketId, payload: Bytes },
    /// cumulative: all packets up to and including `last_packet_id` were received
    DataReceived { last_packet_id: PacketId },
    /// the receiver saw a gap; the sender is expected to re-send starting at this id
    DataRequest { first_missing: PacketId },
    /// sent by the acceptor when a re-join completes
    DataRequestOnReconnect { first_missing: PacketId },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::NewConnection => CommandKind::NewConnection,
            Command::JoinConnection => CommandKind::JoinConnection,
            Command::CloseConnection => CommandKind::CloseConnection,
            Command::Acknowledge { .. } => CommandKind::Acknowledge,
            Command::Data { .. } => CommandKind::Data,
            Command::DataReceived { .. } => CommandKind::DataReceived,
            Command::DataRequest { .. } => CommandKind::DataRequest,
            Command::DataRequestOnReconnect { .. } => CommandKind::DataRequestOnReconnect,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub connection_id: ConnectionId,
    pub command: Command,
}

impl Frame {
    pub fn new(connection_id: ConnectionId, command: Command) -> Frame {
        Frame { connection_id, command }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameHeader {
    pub kind: CommandKind,
    pub frame_len: usize,
}

/// Appends the encoded frame to `buf`. If encoding fails, `buf` is left unchanged.
pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) -> anyhow::Result<()> {
    let start = buf.len();
    let result = do_encode_frame(frame, buf, start);
    if result.is_err() {
        buf.truncate(start);
    }
    result
}

fn do_encode_frame(frame: &Frame, buf: &mut BytesMut, start: usize) -> anyhow::Result<()> {
    buf.put_u32(MAGIC);
    buf.put_u16(frame.command.kind().into());
    buf.put_u32(0); // placeholder for the total length, patched below
    frame.connection_id.ser(buf)?;

    match &frame.command {
        Command::NewConnection | Command::JoinConnection | Command::CloseConnection => {}
        Command::Acknowledge { acked, param } => {
            buf.put_u16((*acked).into());
            buf.put_u32(*param);
        }
        Command::Data { packet_id, payload } => {
            let payload_len: u32 = payload.len().try_into()
                .map_err(|_| anyhow!("payload of {} bytes is too long for a DATA frame", payload.len()))?;
            buf.put_u32(packet_id.to_raw());
            buf.put_u32(payload_len);
            buf.put_slice(payload);
        }
        Command::DataReceived { last_packet_id } => {
            buf.put_u32(last_packet_id.to_raw());
        }
        Command::DataRequest { first_missing } | Command::DataRequestOnReconnect { first_missing } => {
            buf.put_u32(first_missing.to_raw());
        }
    }

    let frame_len = buf.len() - start;
    let frame_len: u32 = frame_len.try_into()
        .map_err(|_| anyhow!("frame of {} bytes exceeds the maximum frame length", frame_len))?;
    buf[start+6..start+10].copy_from_slice(&frame_len.to_be_bytes());
    Ok(())
}

pub fn encode_frame_to_bytes(frame: &Frame) -> anyhow::Result<Bytes> {
    let mut buf = BytesMut::new();
    encode_frame(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Parses and validates the fixed-size header at the start of every frame. A wrong magic number,
///  an unknown command kind or an implausible length are all protocol errors.
pub fn decode_header(raw: &[u8; HEADER_LEN], max_frame_len: usize) -> anyhow::Result<FrameHeader> {
    let mut buf = raw.as_slice();

    let magic = buf.get_u32();
    if magic != MAGIC {
        bail!("wrong magic number {:#010x}", magic);
    }

    let raw_kind = buf.get_u16();
    let kind = CommandKind::try_from(raw_kind)
        .map_err(|_| anyhow!("unknown command kind {}", raw_kind))?;

    let frame_len = buf.get_u32() as usize;
    if frame_len < HEADER_LEN {
        bail!("declared frame length {} is shorter than the frame header", frame_len);
    }
    if frame_len > max_frame_len {
        bail!("declared frame length {} exceeds the configured maximum of {}", frame_len, max_frame_len);
    }

    Ok(FrameHeader { kind, frame_len })
}

/// Decodes one complete frame, i.e. `raw` must hold exactly the number of bytes declared in the
///  frame's header
pub fn decode_frame(raw: &[u8], max_frame_len: usize) -> anyhow::Result<Frame> {
    let header: &[u8; HEADER_LEN] = raw.get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| anyhow!("frame of {} bytes is shorter than the frame header", raw.len()))?;
    let header = decode_header(header, max_frame_len)?;
    if header.frame_len != raw.len() {
        bail!("declared frame length {} does not match the actual length {}", header.frame_len, raw.len());
    }

    let mut buf = &raw[HEADER_LEN..];
    let connection_id = ConnectionId::try_deser(&mut buf)?;

    let command = match header.kind {
        CommandKind::NewConnection => Command::NewConnection,
        CommandKind::JoinConnection => Command::JoinConnection,
        CommandKind::CloseConnection => Command::CloseConnection,
        CommandKind::Acknowledge => {
            let raw_acked = buf.get_u16_checked()?;
            let acked = CommandKind::try_from(raw_acked)
                .map_err(|_| anyhow!("acknowledgement for unknown command kind {}", raw_acked))?;
            let param = buf.get_u32_checked()?;
            Command::Acknowledge { acked, param }
        }
        CommandKind::Data => {
            let packet_id = PacketId::from_raw(buf.get_u32_checked()?);
            let payload_len = buf.get_u32_checked()? as usize;
            if payload_len > buf.remaining() {
                bail!("declared payload length {} exceeds the remaining frame of {} bytes", payload_len, buf.remaining());
            }
            let payload = Bytes::copy_from_slice(&buf[..payload_len]);
            buf.advance(payload_len);
            Command::Data { packet_id, payload }
        }
        CommandKind::DataReceived => Command::DataReceived { last_packet_id: PacketId::from_raw(buf.get_u32_checked()?) },
        CommandKind::DataRequest => Command::DataRequest { first_missing: PacketId::from_raw(buf.get_u32_checked()?) },
        CommandKind::DataRequestOnReconnect => Command::DataRequestOnReconnect { first_missing: PacketId::from_raw(buf.get_u32_checked()?) },
    };

    if buf.has_remaining() {
        bail!("{} unexpected trailing bytes in {:?} frame", buf.remaining(), header.kind);
    }

    Ok(Frame { connection_id, command })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use uuid::Uuid;

    const MAX: usize = 1024;

    fn id() -> ConnectionId {
        ConnectionId {
            initiator: Uuid::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef),
            connection: 7,
        }
    }

    /// the serialized connection id from [id()]
    fn id_bytes() -> Vec<u8> {
        let mut result = vec![0, 36];
        result.extend_from_slice(b"01234567-89ab-cdef-0123-456789abcdef");
        result.extend_from_slice(&[0, 0, 0, 7]);
        result
    }

    fn frame_bytes(kind: u16, body: &[u8]) -> Vec<u8> {
        let id_bytes = id_bytes();
        let len = (HEADER_LEN + id_bytes.len() + body.len()) as u32;

        let mut result = vec![0x52, 0x53, 0x4f, 0x4b];
        result.extend_from_slice(&kind.to_be_bytes());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&id_bytes);
        result.extend_from_slice(body);
        result
    }

    #[rstest]
    #[case::new_connection(Command::NewConnection, 1, vec![])]
    #[case::join_connection(Command::JoinConnection, 2, vec![])]
    #[case::close_connection(Command::CloseConnection, 3, vec![])]
    #[case::ack(Command::Acknowledge { acked: CommandKind::JoinConnection, param: 2 }, 4, vec![0,2, 0,0,0,2])]
    #[case::ack_close(Command::Acknowledge { acked: CommandKind::CloseConnection, param: 0 }, 4, vec![0,3, 0,0,0,0])]
    #[case::data(Command::Data { packet_id: PacketId::from_raw(258), payload: Bytes::from_static(b"abc") }, 5, vec![0,0,1,2, 0,0,0,3, 97,98,99])]
    #[case::data_empty(Command::Data { packet_id: PacketId::ZERO, payload: Bytes::new() }, 5, vec![0,0,0,0, 0,0,0,0])]
    #[case::data_received(Command::DataReceived { last_packet_id: PacketId::from_raw(5) }, 6, vec![0,0,0,5])]
    #[case::data_request(Command::DataRequest { first_missing: PacketId::from_raw(6) }, 7, vec![0,0,0,6])]
    #[case::data_request_on_reconnect(Command::DataRequestOnReconnect { first_missing: PacketId::from_raw(65536) }, 8, vec![0,1,0,0])]
    fn test_encode_decode(#[case] command: Command, #[case] kind: u16, #[case] body: Vec<u8>) {
        let frame = Frame::new(id(), command);
        let expected = frame_bytes(kind, &body);

        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        assert_eq!(buf.as_ref(), expected.as_slice());

        assert_eq!(decode_frame(&expected, MAX).unwrap(), frame);
    }

    #[test]
    fn test_encode_appends() {
        let mut buf = BytesMut::from(b"xyz".as_slice());
        encode_frame(&Frame::new(id(), Command::CloseConnection), &mut buf).unwrap();

        assert_eq!(&buf[..3], b"xyz");
        assert_eq!(&buf[3..], frame_bytes(3, &[]).as_slice());
    }

    #[rstest]
    #[case::valid([0x52,0x53,0x4f,0x4b, 0,5, 0,0,0,50], Some(FrameHeader { kind: CommandKind::Data, frame_len: 50 }))]
    #[case::minimal([0x52,0x53,0x4f,0x4b, 0,1, 0,0,0,10], Some(FrameHeader { kind: CommandKind::NewConnection, frame_len: 10 }))]
    #[case::max_len([0x52,0x53,0x4f,0x4b, 0,1, 0,0,4,0], Some(FrameHeader { kind: CommandKind::NewConnection, frame_len: 1024 }))]
    #[case::wrong_magic([0x52,0x53,0x4f,0x4c, 0,1, 0,0,0,50], None)]
    #[case::zero_kind([0x52,0x53,0x4f,0x4b, 0,0, 0,0,0,50], None)]
    #[case::unknown_kind([0x52,0x53,0x4f,0x4b, 0,9, 0,0,0,50], None)]
    #[case::shorter_than_header([0x52,0x53,0x4f,0x4b, 0,1, 0,0,0,9], None)]
    #[case::too_long([0x52,0x53,0x4f,0x4b, 0,1, 0,0,4,1], None)]
    fn test_decode_header(#[case] raw: [u8; HEADER_LEN], #[case] expected: Option<FrameHeader>) {
        assert_eq!(decode_header(&raw, MAX).ok(), expected);
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut raw = frame_bytes(1, &[]);
        raw.push(0);
        assert!(decode_frame(&raw, MAX).is_err());
        assert!(decode_frame(&raw[..raw.len()-2], MAX).is_err());
    }

    #[rstest]
    #[case::trailing_bytes(6, vec![0,0,0,5, 1])]
    #[case::truncated_packet_id(6, vec![0,0,5])]
    #[case::payload_too_long(5, vec![0,0,0,1, 0,0,0,4, 1,2,3])]
    #[case::unknown_acked_kind(4, vec![0,99, 0,0,0,1])]
    #[case::truncated_ack(4, vec![0,1, 0,0])]
    fn test_decode_invalid_body(#[case] kind: u16, #[case] body: Vec<u8>) {
        assert!(decode_frame(&frame_bytes(kind, &body), MAX).is_err());
    }

    #[test]
    fn test_decode_too_short_for_header() {
        assert!(decode_frame(&[0x52,0x53,0x4f,0x4b, 0,1], MAX).is_err());
    }
}
