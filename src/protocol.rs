//! Client side of the Minecraft server-list ping.
//!
//! One exchange per call: a handshake with next-state = status, an empty status
//! request, then a single status response frame carrying a JSON document.
//! Every failure (refused, reset, timeout, garbage) ends as
//! [`PingOutcome::NoResponse`]; nothing here returns an error to the caller.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

use crate::error::ProtocolError;

pub const HANDSHAKE_PACKET_ID: i32 = 0x00;
pub const STATUS_RESPONSE_PACKET_ID: i32 = 0x00;
const NEXT_STATE_STATUS: i32 = 1;

/// Length-prefixed status request with an empty body.
pub const STATUS_REQUEST: [u8; 2] = [0x01, 0x00];

/// Largest frame a three-byte varint length can announce.
pub const MAX_FRAME_LEN: usize = 2_097_151;

const MAX_VARINT_LEN: usize = 5;

/// Append `value` as a varint (7 bits per byte, low group first, two's complement for negatives).
pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7f == 0 {
            buf.push(v as u8);
            return;
        }
        buf.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintError {
    /// Ran out of bytes before the terminating byte.
    Incomplete,
    /// Continuation bit still set after five bytes.
    TooLong,
}

/// Decode a varint from the front of `buf`, returning the value and bytes consumed.
pub fn read_varint(buf: &[u8]) -> Result<(i32, usize), VarintError> {
    let mut value: u32 = 0;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value as i32, i + 1));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        Err(VarintError::TooLong)
    } else {
        Err(VarintError::Incomplete)
    }
}

/// Build the length-prefixed handshake frame announcing a status request.
///
/// The frame length is a full varint, so long server addresses stay well-formed.
pub fn encode_handshake(host: &str, port: u16, protocol_version: i32) -> Vec<u8> {
    let mut body = Vec::with_capacity(host.len() + 16);
    write_varint(&mut body, HANDSHAKE_PACKET_ID);
    write_varint(&mut body, protocol_version);
    write_varint(&mut body, host.len() as i32);
    body.extend_from_slice(host.as_bytes());
    body.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut body, NEXT_STATE_STATUS);

    let mut frame = Vec::with_capacity(body.len() + MAX_VARINT_LEN);
    write_varint(&mut frame, body.len() as i32);
    frame.extend_from_slice(&body);
    frame
}

/// Try to decode a status response from the bytes received so far.
///
/// `Ok(None)` means the frame is not complete yet and more bytes are needed.
pub fn decode_status_frame(buf: &[u8]) -> Result<Option<Value>, ProtocolError> {
    let (frame_len, header) = match read_varint(buf) {
        Ok(v) => v,
        Err(VarintError::Incomplete) => return Ok(None),
        Err(VarintError::TooLong) => return Err(ProtocolError::MalformedVarint),
    };
    let frame_len = usize::try_from(frame_len).map_err(|_| ProtocolError::MalformedVarint)?;
    if frame_len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(frame_len));
    }
    if buf.len() < header + frame_len {
        return Ok(None);
    }
    let frame = &buf[header..header + frame_len];

    let (packet_id, id_len) = read_varint(frame).map_err(|_| ProtocolError::MalformedVarint)?;
    if packet_id != STATUS_RESPONSE_PACKET_ID {
        return Err(ProtocolError::UnexpectedPacket(packet_id));
    }
    let rest = &frame[id_len..];
    let (json_len, len_len) = read_varint(rest).map_err(|_| ProtocolError::MalformedVarint)?;
    let json_len = usize::try_from(json_len).map_err(|_| ProtocolError::MalformedVarint)?;
    let json = rest
        .get(len_len..len_len + json_len)
        .ok_or(ProtocolError::StringOverrun(json_len))?;
    Ok(Some(serde_json::from_slice(json)?))
}

/// What a single status ping produced.
#[derive(Debug)]
pub enum PingOutcome {
    Online(Value),
    NoResponse(ProtocolError),
}

impl PingOutcome {
    pub fn is_online(&self) -> bool {
        matches!(self, PingOutcome::Online(_))
    }
}

/// Ping `ip:port` and wait at most `timeout` for the whole exchange.
///
/// On expiry the in-flight future is dropped, which closes the socket.
pub async fn ping(ip: Ipv4Addr, port: u16, protocol_version: i32, timeout: Duration) -> PingOutcome {
    match time::timeout(timeout, exchange(ip, port, protocol_version)).await {
        Ok(Ok(status)) => PingOutcome::Online(status),
        Ok(Err(e)) => PingOutcome::NoResponse(e),
        Err(_) => PingOutcome::NoResponse(ProtocolError::Timeout),
    }
}

async fn exchange(ip: Ipv4Addr, port: u16, protocol_version: i32) -> Result<Value, ProtocolError> {
    let mut stream = TcpStream::connect(SocketAddr::from((ip, port)))
        .await
        .map_err(ProtocolError::Connect)?;

    let mut request = encode_handshake(&ip.to_string(), port, protocol_version);
    request.extend_from_slice(&STATUS_REQUEST);
    stream.write_all(&request).await?;

    // Status responses with a favicon routinely span several reads.
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProtocolError::Truncated(buf.len()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(status) = decode_status_frame(&buf)? {
            return Ok(status);
        }
    }
}

/// Something that can ask an endpoint for its status.
///
/// The scheduler is generic over this so tests can stand in for the network.
pub trait StatusProbe: Send + Sync + 'static {
    fn probe(&self, ip: Ipv4Addr, port: u16) -> impl Future<Output = PingOutcome> + Send;
}

/// Real TCP ping with a fixed protocol hint and timeout.
#[derive(Debug, Clone, Copy)]
pub struct TcpStatusProbe {
    pub protocol_version: i32,
    pub timeout: Duration,
}

impl StatusProbe for TcpStatusProbe {
    fn probe(&self, ip: Ipv4Addr, port: u16) -> impl Future<Output = PingOutcome> + Send {
        ping(ip, port, self.protocol_version, self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint(v: i32) -> Vec<u8> {
        let mut b = Vec::new();
        write_varint(&mut b, v);
        b
    }

    #[test]
    fn varint_known_encodings() {
        assert_eq!(varint(0), vec![0x00]);
        assert_eq!(varint(1), vec![0x01]);
        assert_eq!(varint(127), vec![0x7f]);
        assert_eq!(varint(128), vec![0x80, 0x01]);
        assert_eq!(varint(25565), vec![0xdd, 0xc7, 0x01]);
        assert_eq!(varint(2_097_151), vec![0xff, 0xff, 0x7f]);
        assert_eq!(varint(-1), vec![0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[test]
    fn varint_decode_reports_consumed_bytes() {
        assert_eq!(read_varint(&[0xdd, 0xc7, 0x01, 0x42]), Ok((25565, 3)));
        assert_eq!(read_varint(&[0xff, 0xff, 0xff, 0xff, 0x0f]), Ok((-1, 5)));
    }

    #[test]
    fn varint_incomplete_and_overlong() {
        assert_eq!(read_varint(&[]), Err(VarintError::Incomplete));
        assert_eq!(read_varint(&[0x80, 0x80]), Err(VarintError::Incomplete));
        assert_eq!(read_varint(&[0xff; 6]), Err(VarintError::TooLong));
    }

    #[test]
    fn handshake_wire_layout() {
        let frame = encode_handshake("127.0.0.1", 25565, 0);
        let mut expected = vec![0x0f, 0x00, 0x00, 0x09];
        expected.extend_from_slice(b"127.0.0.1");
        expected.extend_from_slice(&[0x63, 0xdd, 0x01]);
        assert_eq!(frame, expected);
    }

    #[test]
    fn long_host_gets_multibyte_length() {
        let host = "a".repeat(200);
        let frame = encode_handshake(&host, 25565, 763);
        let (len, header) = read_varint(&frame).unwrap();
        assert_eq!(header, 2);
        assert_eq!(len as usize, frame.len() - header);
    }

    fn response_frame(json: &str) -> Vec<u8> {
        let mut body = Vec::new();
        write_varint(&mut body, STATUS_RESPONSE_PACKET_ID);
        write_varint(&mut body, json.len() as i32);
        body.extend_from_slice(json.as_bytes());
        let mut frame = Vec::new();
        write_varint(&mut frame, body.len() as i32);
        frame.extend_from_slice(&body);
        frame
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let frame = response_frame(r#"{"description":"hi"}"#);
        for cut in 0..frame.len() {
            assert!(decode_status_frame(&frame[..cut]).unwrap().is_none(), "cut at {cut}");
        }
        let status = decode_status_frame(&frame).unwrap().unwrap();
        assert_eq!(status["description"], "hi");
    }

    #[test]
    fn decode_rejects_wrong_packet_and_bad_json() {
        let mut frame = response_frame("{}");
        frame[1] = 0x02;
        assert!(matches!(
            decode_status_frame(&frame),
            Err(ProtocolError::UnexpectedPacket(2))
        ));

        let frame = response_frame("{not json");
        assert!(matches!(
            decode_status_frame(&frame),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn decode_rejects_string_longer_than_frame() {
        // frame says 3 bytes: id 0, string length 10, one byte of data
        let frame = [0x03, 0x00, 0x0a, b'{'];
        assert!(matches!(
            decode_status_frame(&frame),
            Err(ProtocolError::StringOverrun(10))
        ));
    }

    #[test]
    fn decode_rejects_oversized_frame() {
        let mut frame = Vec::new();
        write_varint(&mut frame, (MAX_FRAME_LEN + 1) as i32);
        assert!(matches!(
            decode_status_frame(&frame),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}
