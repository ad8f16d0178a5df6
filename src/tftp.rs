use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Fixed DATA payload size. A payload shorter than this ends the transfer.
pub const BLOCK_SIZE: usize = 512;

/// Largest well-formed packet on the wire: a full DATA block plus the
/// 2-byte opcode and 2-byte block number.
pub const MAX_PACKET_SIZE: usize = BLOCK_SIZE + 4;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP socket handler.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {e}"),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {e}"),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {e}"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents a TFTP error code carried by an ERROR packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
///
/// The mode in a request is kept as the raw string from the wire; whether a
/// mode is acceptable is a server policy decision, not a codec one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A read request packet.
    ReadReq { filename: String, mode: String },

    /// A write request packet.
    WriteReq { filename: String, mode: String },

    /// A data packet carrying one block of 0..=512 payload bytes.
    Data { block: u16, data: Vec<u8> },

    /// An acknowledgment packet.
    Ack { block: u16 },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

/// Given a buffer, concatenates from the start of the buffer until it finds
/// a zero byte, which terminates the string.
///
/// Returns the extracted string and the position of the zero byte (or the
/// length of the buffer, if no zero byte was encountered).
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let mut s = String::new();
    for (i, &c) in buf.iter().enumerate() {
        if c == 0x00 {
            return (s, i);
        }
        s.push(char::from(c));
    }

    (s, buf.len())
}

#[derive(Debug, PartialEq, Eq)]
enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(SocketError::PacketParse(format!(
            "unknown opcode retrieved: {rawcode}"
        ))),
    }
}

/// Parses the two NUL-terminated strings of a request body. Trailing bytes
/// after the mode terminator make the packet malformed.
fn parse_filename_and_mode(buf: &[u8]) -> TftpResult<(String, String)> {
    let (filename, filename_end) = string_from_buffer(buf);
    if filename_end == buf.len() {
        return Err(SocketError::PacketParse(
            "request filename is not NUL-terminated".to_string(),
        ));
    }

    let rest = &buf[filename_end + 1..];
    let (mode, mode_end) = string_from_buffer(rest);
    if mode_end == rest.len() {
        return Err(SocketError::PacketParse(
            "request mode is not NUL-terminated".to_string(),
        ));
    }
    if mode_end + 1 != rest.len() {
        return Err(SocketError::PacketParse(
            "trailing bytes after request mode".to_string(),
        ));
    }

    Ok((filename, mode))
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (filename, mode) = parse_filename_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { filename, mode })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (filename, mode) = parse_filename_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { filename, mode })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    let data = &buf[4..];
    if data.len() > BLOCK_SIZE {
        return Err(SocketError::PacketParse(format!(
            "data payload of {} bytes exceeds the {BLOCK_SIZE}-byte block size",
            data.len()
        )));
    }
    Ok(Packet::Data {
        block,
        data: data.to_vec(),
    })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() != 4 {
        return Err(SocketError::PacketParse(format!(
            "ack packet must be exactly 4 bytes, got {}",
            buf.len()
        )));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < 5 {
        return Err(SocketError::PacketParse(
            "error packet too short for code and message".to_string(),
        ));
    }
    let code = ErrorCode::from_u16(u16_from_buffer(&buf[2..4]));

    let rest = &buf[4..];
    let (message, message_end) = string_from_buffer(rest);
    if message_end == rest.len() {
        return Err(SocketError::PacketParse(
            "error message is not NUL-terminated".to_string(),
        ));
    }
    if message_end + 1 != rest.len() {
        return Err(SocketError::PacketParse(
            "trailing bytes after error message".to_string(),
        ));
    }

    Ok(Packet::Error { code, message })
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend(s.chars().map(|c| c as u8));
    out.push(0x00);
}

impl Packet {
    pub fn parse(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 4 {
            return Err(SocketError::PacketParse("packet too short".to_string()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    /// Serializes the packet for the wire: big-endian 16-bit integers,
    /// zero-terminated strings, no padding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_PACKET_SIZE);
        match self {
            Packet::ReadReq { filename, mode } => {
                push_u16(&mut out, 1);
                push_cstr(&mut out, filename);
                push_cstr(&mut out, mode);
            }
            Packet::WriteReq { filename, mode } => {
                push_u16(&mut out, 2);
                push_cstr(&mut out, filename);
                push_cstr(&mut out, mode);
            }
            Packet::Data { block, data } => {
                push_u16(&mut out, 3);
                push_u16(&mut out, *block);
                out.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                push_u16(&mut out, 4);
                push_u16(&mut out, *block);
            }
            Packet::Error { code, message } => {
                push_u16(&mut out, 5);
                push_u16(&mut out, code.code());
                push_cstr(&mut out, message);
            }
        }
        out
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that speaks in `Packet`s on the send side
/// and hands back raw datagrams on the receive side. Receives stay raw
/// because the caller must judge the source address before trusting the
/// bytes enough to parse them.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.to_bytes(), dst).await?;
        Ok(())
    }

    /// Reads one datagram, waiting at most `ttl`. The returned bytes are a
    /// copy, so the next receive cannot clobber a datagram still being
    /// handled elsewhere.
    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = [0; MAX_PACKET_SIZE];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;
        Ok((buf[..total_written].to_vec(), src))
    }

    /// Reads one datagram into the caller's buffer with no deadline.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.sock.recv_from(buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01, // filename: cheese with terminating nullchar
            0x63, 0x68, 0x65, 0x65, 0x73, 0x65, 0x00, // mode: octet
            0x6F, 0x63, 0x74, 0x65, 0x74, 0x00,
        ];

        let packet = Packet::parse(&buf);
        assert_eq!(
            packet.unwrap(),
            Packet::ReadReq {
                filename: "cheese".to_string(),
                mode: "octet".to_string()
            }
        );
    }

    #[test]
    fn test_packet_write_req() {
        let buf = vec![
            // opcode
            0x00, 0x02, // filename: hi with terminating nullchar
            0x68, 0x69, 0x00, // mode: OcTeT (case preserved by the codec)
            0x4F, 0x63, 0x54, 0x65, 0x54, 0x00,
        ];

        let packet = Packet::parse(&buf);
        assert_eq!(
            packet.unwrap(),
            Packet::WriteReq {
                filename: "hi".to_string(),
                mode: "OcTeT".to_string()
            }
        );
    }

    #[test]
    fn test_packet_parses_netascii_request() {
        // A netascii request is well-formed on the wire; rejecting the mode
        // is the listener's job.
        let mut buf = vec![0x00, 0x01];
        buf.extend_from_slice(b"cheese\x00netascii\x00");
        assert_eq!(
            Packet::parse(&buf).unwrap(),
            Packet::ReadReq {
                filename: "cheese".to_string(),
                mode: "netascii".to_string()
            }
        );
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![
            // opcode
            0x00, 0x03, // block number
            0x12, 0x34, // data
            0xDE, 0xAD, 0xBE, 0xEF,
        ];

        let packet = Packet::parse(&buf);
        assert_eq!(
            packet.unwrap(),
            Packet::Data {
                block: 0x1234,
                data: vec![0xDE, 0xAD, 0xBE, 0xEF]
            }
        );
    }

    #[test]
    fn test_packet_parses_empty_data() {
        let buf = vec![0x00, 0x03, 0x00, 0x05];
        assert_eq!(
            Packet::parse(&buf).unwrap(),
            Packet::Data {
                block: 5,
                data: vec![]
            }
        );
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        let packet = Packet::parse(&buf);
        assert_eq!(packet.unwrap(), Packet::Ack { block: 0x102f });
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05, // error code
            0x00, 0x01, // message: File not found
            0x46, 0x69, 0x6C, 0x65, 0x20, 0x6E, 0x6F, 0x74, 0x20, 0x66, 0x6F, 0x75, 0x6E, 0x64,
            0x00,
        ];

        let packet = Packet::parse(&buf);
        assert_eq!(
            packet.unwrap(),
            Packet::Error {
                code: ErrorCode::FileNotFound,
                message: "File not found".to_string()
            }
        );
    }

    #[test]
    fn test_packet_parse_failures() {
        // Too short / invalid opcodes
        assert!(Packet::parse(&[0x10]).is_err());
        assert!(Packet::parse(&[0x10, 0x00]).is_err());
        assert!(Packet::parse(&[0x00, 0x09, 0x00, 0x00]).is_err());
        // Request with unterminated filename
        assert!(Packet::parse(&[0x00, 0x01, 0x68, 0x69]).is_err());
        // Request missing the mode string entirely
        assert!(Packet::parse(&[0x00, 0x01, 0x68, 0x69, 0x00]).is_err());
        // Request mode missing its terminator
        assert!(Packet::parse(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x6F, 0x63]).is_err());
        // Request with trailing garbage after the mode terminator
        assert!(Packet::parse(&[0x00, 0x01, 0x68, 0x00, 0x6F, 0x00, 0x42]).is_err());
        // Ack with a trailing byte
        assert!(Packet::parse(&[0x00, 0x04, 0x00, 0x01, 0x00]).is_err());
        // Error message without a terminator
        assert!(Packet::parse(&[0x00, 0x05, 0x00, 0x00, 0x68, 0x69]).is_err());
    }

    #[test]
    fn test_packet_rejects_oversize_data() {
        let mut buf = vec![0x00, 0x03, 0x00, 0x01];
        buf.extend_from_slice(&[0xAA; BLOCK_SIZE + 1]);
        assert!(Packet::parse(&buf).is_err());
    }

    #[test]
    fn test_serialize_exact_bytes() {
        assert_eq!(
            Packet::Ack { block: 0x102f }.to_bytes(),
            vec![0x00, 0x04, 0x10, 0x2f]
        );
        assert_eq!(
            Packet::Data {
                block: 1,
                data: vec![0xDE, 0xAD]
            }
            .to_bytes(),
            vec![0x00, 0x03, 0x00, 0x01, 0xDE, 0xAD]
        );
        assert_eq!(
            Packet::Error {
                code: ErrorCode::FileNotFound,
                message: "File not found".to_string()
            }
            .to_bytes(),
            b"\x00\x05\x00\x01File not found\x00".to_vec()
        );
        assert_eq!(
            Packet::ReadReq {
                filename: "cheese".to_string(),
                mode: "octet".to_string()
            }
            .to_bytes(),
            b"\x00\x01cheese\x00octet\x00".to_vec()
        );
    }

    #[test]
    fn test_round_trip() {
        let packets = vec![
            Packet::ReadReq {
                filename: "a/b.txt".to_string(),
                mode: "netascii".to_string(),
            },
            Packet::WriteReq {
                filename: "greeting".to_string(),
                mode: "octet".to_string(),
            },
            Packet::Data {
                block: 0xFFFF,
                data: vec![0x42; BLOCK_SIZE],
            },
            Packet::Data {
                block: 7,
                data: vec![],
            },
            Packet::Ack { block: 0 },
            Packet::Error {
                code: ErrorCode::UnknownTid,
                message: "TID is not known to this server".to_string(),
            },
        ];

        for packet in packets {
            let bytes = packet.to_bytes();
            assert_eq!(Packet::parse(&bytes).unwrap(), packet);
            // and byte-for-byte the other way around
            assert_eq!(Packet::parse(&bytes).unwrap().to_bytes(), bytes);
        }
    }
}
