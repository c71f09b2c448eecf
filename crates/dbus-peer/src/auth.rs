//! SASL authentication handshake
//!
//! Before any D-Bus frame is exchanged, client and server speak a
//! line-based ASCII protocol:
//!
//! ```text
//! C: \0AUTH EXTERNAL 31303030\r\n
//! S: OK 1234deadbeef...\r\n
//! C: NEGOTIATE_UNIX_FD\r\n
//! S: AGREE_UNIX_FD\r\n
//! C: BEGIN\r\n
//! ```
//!
//! After `BEGIN` the wire carries raw frames and nothing here applies
//! any more. Unix-fd negotiation is best effort: a refusal only disables
//! descriptor passing for this connection.

use crate::error::{Error, Result};
use crate::sys;
use crate::transport::Transport;
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, trace};

/// Longest line we accept before declaring the handshake broken
const MAX_LINE_LEN: usize = 16 * 1024;

/// Offered SASL mechanisms, tried in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// Out-of-band credentials (uid over unix sockets)
    External,
    Anonymous,
}

impl AuthMechanism {
    /// The default mechanism list
    pub fn default_order() -> Vec<AuthMechanism> {
        vec![AuthMechanism::External, AuthMechanism::Anonymous]
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::External => f.write_str("EXTERNAL"),
            Self::Anonymous => f.write_str("ANONYMOUS"),
        }
    }
}

/// Outcome of a completed handshake
#[derive(Debug, Clone)]
pub struct AuthResult {
    /// Server GUID from the OK line
    pub guid: String,
    /// Whether both sides agreed to pass unix fds
    pub unix_fd: bool,
}

/// Buffered CRLF line reader over a transport
struct LineReader {
    buf: BytesMut,
    fds: VecDeque<std::os::unix::io::RawFd>,
}

impl LineReader {
    fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            fds: VecDeque::new(),
        }
    }

    async fn next_line(&mut self, transport: &Transport) -> Result<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let raw = self.buf.split_to(pos + 1);
                let line = std::str::from_utf8(&raw)
                    .map_err(|_| Error::AuthFailed("non-ASCII line".to_string()))?
                    .trim_end_matches(|c| c == '\r' || c == '\n')
                    .to_string();
                trace!(line = %line, "auth line received");
                return Ok(line);
            }
            if self.buf.len() > MAX_LINE_LEN {
                return Err(Error::AuthFailed("line too long".to_string()));
            }
            let n = transport.read_buf(&mut self.buf, &mut self.fds).await?;
            if n == 0 {
                return Err(Error::AuthFailed(
                    "connection closed during handshake".to_string(),
                ));
            }
        }
    }

    /// Consume the single NUL credentials byte that precedes the first
    /// client command.
    async fn expect_nul(&mut self, transport: &Transport) -> Result<()> {
        while self.buf.is_empty() {
            let n = transport.read_buf(&mut self.buf, &mut self.fds).await?;
            if n == 0 {
                return Err(Error::AuthFailed(
                    "connection closed during handshake".to_string(),
                ));
            }
        }
        if self.buf[0] != 0 {
            return Err(Error::AuthFailed("missing NUL preamble".to_string()));
        }
        self.buf.advance(1);
        Ok(())
    }
}

async fn send_line(transport: &Transport, line: &str) -> Result<()> {
    trace!(line = %line, "auth line sent");
    let mut data = Vec::with_capacity(line.len() + 2);
    data.extend_from_slice(line.as_bytes());
    data.extend_from_slice(b"\r\n");
    transport.write_all(&data, &[]).await
}

fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Run the client half of the handshake.
///
/// Mechanisms are tried in order; `REJECTED` moves on to the next one,
/// anything other than `OK` fails the connection.
pub async fn authenticate_client(
    transport: &Transport,
    mechanisms: &[AuthMechanism],
    negotiate_unix_fd: bool,
) -> Result<AuthResult> {
    transport.write_all(&[0], &[]).await?;

    let mut reader = LineReader::new();
    let mut guid = None;

    'mechanisms: for mechanism in mechanisms {
        let command = match mechanism {
            AuthMechanism::External => {
                let uid = sys::getuid().to_string();
                format!("AUTH EXTERNAL {}", hex_encode(uid.as_bytes()))
            }
            AuthMechanism::Anonymous => "AUTH ANONYMOUS".to_string(),
        };
        send_line(transport, &command).await?;

        let line = reader.next_line(transport).await?;
        if let Some(rest) = line.strip_prefix("OK") {
            guid = Some(rest.trim().to_string());
            debug!(mechanism = %mechanism, "authenticated");
            break 'mechanisms;
        }
        if line.starts_with("REJECTED") {
            debug!(mechanism = %mechanism, "mechanism rejected");
            continue;
        }
        return Err(Error::AuthFailed(format!("unexpected reply: {}", line)));
    }

    let guid = match guid {
        Some(g) => g,
        None => {
            return Err(Error::AuthFailed(
                "no mechanism accepted by server".to_string(),
            ))
        }
    };

    let mut unix_fd = false;
    if negotiate_unix_fd && transport.supports_fd_passing() {
        send_line(transport, "NEGOTIATE_UNIX_FD").await?;
        let line = reader.next_line(transport).await?;
        if line == "AGREE_UNIX_FD" {
            unix_fd = true;
        } else if line.starts_with("ERROR") {
            debug!("server refused unix fd passing");
        } else {
            return Err(Error::AuthFailed(format!("unexpected reply: {}", line)));
        }
    }

    send_line(transport, "BEGIN").await?;
    Ok(AuthResult { guid, unix_fd })
}

/// Run the server half of the handshake (peer-to-peer listeners).
///
/// Accepts `EXTERNAL` and `ANONYMOUS` without verifying credentials
/// beyond their presence, answers fd negotiation according to the
/// socket family, and returns once the client sends `BEGIN`.
pub async fn authenticate_server(transport: &Transport, guid: &str) -> Result<AuthResult> {
    let mut reader = LineReader::new();
    reader.expect_nul(transport).await?;

    let mut authenticated = false;
    let mut unix_fd = false;
    loop {
        let line = reader.next_line(transport).await?;
        let mut words = line.split_ascii_whitespace();
        match (words.next(), authenticated) {
            (Some("AUTH"), false) => match words.next() {
                Some("EXTERNAL") | Some("ANONYMOUS") => {
                    send_line(transport, &format!("OK {}", guid)).await?;
                    authenticated = true;
                }
                _ => send_line(transport, "REJECTED EXTERNAL ANONYMOUS").await?,
            },
            (Some("NEGOTIATE_UNIX_FD"), true) => {
                if transport.supports_fd_passing() {
                    unix_fd = true;
                    send_line(transport, "AGREE_UNIX_FD").await?;
                } else {
                    send_line(transport, "ERROR fd passing unsupported").await?;
                }
            }
            (Some("BEGIN"), true) => {
                return Ok(AuthResult {
                    guid: guid.to_string(),
                    unix_fd,
                });
            }
            (Some("CANCEL"), _) | (Some("ERROR"), _) => {
                send_line(transport, "REJECTED EXTERNAL ANONYMOUS").await?;
                authenticated = false;
            }
            _ => {
                send_line(transport, "ERROR unknown command").await?;
            }
        }
    }
}

/// Generate a server GUID: 32 hex digits
pub fn generate_guid() -> String {
    let mut bytes = [0u8; 16];
    match std::fs::File::open("/dev/urandom") {
        Ok(mut f) => {
            use std::io::Read;
            let _ = f.read_exact(&mut bytes);
        }
        Err(_) => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            let mix = now.as_nanos() as u64 ^ (std::process::id() as u64).rotate_left(32);
            bytes[..8].copy_from_slice(&mix.to_le_bytes());
            bytes[8..].copy_from_slice(&now.as_secs().to_le_bytes());
        }
    }
    hex_encode(&bytes)
}
