//! Online-player query against a running Bedrock server.
//!
//! Bedrock answers a RakNet *unconnected ping* on its game port with an
//! *unconnected pong* whose payload is a `;`-separated status string:
//! `MCPE;<motd>;<protocol>;<version>;<online>;<max>;<guid>;...`.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

const UNCONNECTED_PING: u8 = 0x01;
const UNCONNECTED_PONG: u8 = 0x1c;
const OFFLINE_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];
// id + ping time + server guid + magic + string length
const PONG_HEADER_LEN: usize = 1 + 8 + 8 + 16 + 2;
const CLIENT_GUID: u64 = 0x6273_772d_7374_6174;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("server on port {port} did not answer the status query within {timeout_ms} ms")]
    Timeout { port: u16, timeout_ms: u128 },
    #[error("malformed status reply: {0}")]
    Malformed(String),
    #[error("status query io error: {0}")]
    Io(#[from] io::Error),
}

pub trait StatusProbe {
    fn players_online(&self, port: u16) -> Result<u32, StatusError>;
}

impl<T: StatusProbe + ?Sized> StatusProbe for &T {
    fn players_online(&self, port: u16) -> Result<u32, StatusError> {
        (**self).players_online(port)
    }
}

/// Queries `127.0.0.1:<port>` with a single ping and no retries.
#[derive(Debug, Clone)]
pub struct RakNetProbe {
    timeout: Duration,
}

impl RakNetProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl StatusProbe for RakNetProbe {
    fn players_online(&self, port: u16) -> Result<u32, StatusError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_read_timeout(Some(self.timeout))?;
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let ping_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        socket.send_to(&encode_ping(ping_time), target)?;

        let mut buf = [0u8; 2048];
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Err(StatusError::Timeout {
                    port,
                    timeout_ms: self.timeout.as_millis(),
                })
            }
            Err(err) => return Err(StatusError::Io(err)),
        };
        let status = decode_pong(&buf[..len])?;
        let online = parse_online_players(&status)?;
        debug!(port, online, "status query answered");
        Ok(online)
    }
}

fn encode_ping(ping_time: u64) -> Vec<u8> {
    let mut packet = Vec::with_capacity(1 + 8 + 16 + 8);
    packet.push(UNCONNECTED_PING);
    packet.extend_from_slice(&ping_time.to_be_bytes());
    packet.extend_from_slice(&OFFLINE_MAGIC);
    packet.extend_from_slice(&CLIENT_GUID.to_be_bytes());
    packet
}

fn decode_pong(packet: &[u8]) -> Result<String, StatusError> {
    if packet.len() < PONG_HEADER_LEN {
        return Err(StatusError::Malformed(format!(
            "reply too short ({} bytes)",
            packet.len()
        )));
    }
    if packet[0] != UNCONNECTED_PONG {
        return Err(StatusError::Malformed(format!(
            "unexpected packet id 0x{:02x}",
            packet[0]
        )));
    }
    if packet[17..33] != OFFLINE_MAGIC {
        return Err(StatusError::Malformed("offline magic mismatch".to_string()));
    }
    let declared = u16::from_be_bytes([packet[33], packet[34]]) as usize;
    let body = &packet[PONG_HEADER_LEN..];
    if body.len() < declared {
        return Err(StatusError::Malformed(format!(
            "status string truncated ({} of {} bytes)",
            body.len(),
            declared
        )));
    }
    Ok(String::from_utf8_lossy(&body[..declared]).to_string())
}

fn parse_online_players(status: &str) -> Result<u32, StatusError> {
    let field = status
        .split(';')
        .nth(4)
        .ok_or_else(|| StatusError::Malformed(format!("missing player count in {status:?}")))?;
    field
        .trim()
        .parse()
        .map_err(|_| StatusError::Malformed(format!("player count is not a number: {field:?}")))
}
