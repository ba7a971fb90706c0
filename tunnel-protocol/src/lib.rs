//! # Tunnel Wire Protocol
//!
//! The length-framed message codec shared by `tunnel-server` and
//! `tunnel-client`. Every message on both the control channel and the data
//! channel starts with a fixed 16-byte header in network byte order,
//! followed by `data_len` bytes of payload:
//!
//! ```text
//! | magic (4B) | type (4B) | session_id (4B) | data_len (4B) | payload (data_len B) |
//! ```
//!
//! The codec performs no allocation beyond the caller-supplied buffer and
//! never consumes a partial message: a `recv` call either returns a complete
//! payload or an error, and on error the connection is considered poisoned —
//! callers must close it rather than attempt to keep reading.

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// "TUNL" as a big-endian u32.
pub const MAGIC: u32 = 0x5455_4E4C;

/// Header size on the wire: four network-order u32 fields.
pub const HEADER_LEN: usize = 16;

/// Default ceiling on `data_len` a receiver accepts before closing the
/// connection. Matches `TUNNEL_BUFFER_SIZE` in the original implementation.
pub const DEFAULT_MAX_PAYLOAD: u32 = 65536;

/// Fixed width of the `token` and `subdomain` fields in [`ConnectRequest`].
pub const TOKEN_LEN: usize = 64;
pub const SUBDOMAIN_LEN: usize = 64;
/// Fixed width of the `public_url` field in [`DomainAssignment`].
pub const PUBLIC_URL_LEN: usize = 256;

/// The kind of a [`TunnelMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    Connect = 1,
    Accept = 2,
    Reject = 3,
    Data = 4,
    Close = 5,
    Heartbeat = 6,
    AssignDomain = 7,
}

impl MsgType {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Connect),
            2 => Some(Self::Accept),
            3 => Some(Self::Reject),
            4 => Some(Self::Data),
            5 => Some(Self::Close),
            6 => Some(Self::Heartbeat),
            7 => Some(Self::AssignDomain),
            _ => None,
        }
    }
}

/// Errors the codec can return. Any of these means the connection is dead;
/// the caller must close the socket rather than issue another `recv`.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic in tunnel header")]
    BadMagic,
    #[error("unknown message type {0}")]
    UnknownType(u32),
    #[error("payload too large: {len} exceeds cap {cap}")]
    PayloadTooLarge { len: u32, cap: u32 },
    #[error("connection closed")]
    Eof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// The decoded 16-byte header of a [`TunnelMessage`].
#[derive(Debug, Clone, Copy)]
pub struct TunnelHeader {
    pub msg_type: MsgType,
    pub session_id: u32,
    pub data_len: u32,
}

/// Sends one framed message: a 16-byte header followed by `payload`.
///
/// Retries partial writes until the header and payload are fully written or
/// the connection fails. The payload length is taken from `payload.len()`.
pub async fn send<W>(conn: &mut W, msg_type: MsgType, session_id: u32, payload: &[u8]) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut header = BytesMut::with_capacity(HEADER_LEN);
    header.put_u32(MAGIC);
    header.put_u32(msg_type as u32);
    header.put_u32(session_id);
    header.put_u32(payload.len() as u32);

    conn.write_all(&header).await?;
    if !payload.is_empty() {
        conn.write_all(payload).await?;
    }
    Ok(())
}

/// Receives one framed message. Reads exactly [`HEADER_LEN`] header bytes
/// (looping on short reads via `read_exact`), validates the magic and the
/// `data_len` ceiling, then reads exactly `data_len` payload bytes into a
/// freshly allocated buffer.
///
/// `max_payload` is the receive ceiling from §3: a header whose `data_len`
/// exceeds it is treated the same as a bad magic — the connection must be
/// closed by the caller.
pub async fn recv<R>(conn: &mut R, max_payload: u32) -> Result<(TunnelHeader, Vec<u8>)>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    match conn.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ProtocolError::Eof),
        Err(e) => return Err(e.into()),
    }

    let mut buf = &header_buf[..];
    let magic = buf.get_u32();
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    let type_raw = buf.get_u32();
    let session_id = buf.get_u32();
    let data_len = buf.get_u32();

    if data_len > max_payload {
        return Err(ProtocolError::PayloadTooLarge {
            len: data_len,
            cap: max_payload,
        });
    }
    let msg_type = MsgType::from_u32(type_raw).ok_or(ProtocolError::UnknownType(type_raw))?;

    let mut payload = vec![0u8; data_len as usize];
    if data_len > 0 {
        conn.read_exact(&mut payload).await?;
    }

    Ok((
        TunnelHeader {
            msg_type,
            session_id,
            data_len,
        },
        payload,
    ))
}

fn write_fixed_str(dst: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
    dst[n..].fill(0);
}

fn read_fixed_str(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

/// Payload of a CONNECT message sent client→server on a fresh control
/// connection. `token` and `subdomain` are NUL-terminated within their fixed
/// widths; `local_port` is informational only (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub token: String,
    pub local_port: i32,
    pub subdomain: String,
}

impl ConnectRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; TOKEN_LEN + 4 + SUBDOMAIN_LEN];
        write_fixed_str(&mut buf[0..TOKEN_LEN], &self.token);
        buf[TOKEN_LEN..TOKEN_LEN + 4].copy_from_slice(&self.local_port.to_be_bytes());
        write_fixed_str(
            &mut buf[TOKEN_LEN + 4..TOKEN_LEN + 4 + SUBDOMAIN_LEN],
            &self.subdomain,
        );
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TOKEN_LEN + 4 + SUBDOMAIN_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                len: buf.len() as u32,
                cap: (TOKEN_LEN + 4 + SUBDOMAIN_LEN) as u32,
            });
        }
        let token = read_fixed_str(&buf[0..TOKEN_LEN]);
        let mut port_bytes = [0u8; 4];
        port_bytes.copy_from_slice(&buf[TOKEN_LEN..TOKEN_LEN + 4]);
        let local_port = i32::from_be_bytes(port_bytes);
        let subdomain = read_fixed_str(&buf[TOKEN_LEN + 4..TOKEN_LEN + 4 + SUBDOMAIN_LEN]);
        Ok(Self {
            token,
            local_port,
            subdomain,
        })
    }
}

/// Payload of an ASSIGN_DOMAIN message sent server→client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainAssignment {
    pub public_url: String,
    pub public_port: i32,
}

impl DomainAssignment {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; PUBLIC_URL_LEN + 4];
        write_fixed_str(&mut buf[0..PUBLIC_URL_LEN], &self.public_url);
        buf[PUBLIC_URL_LEN..PUBLIC_URL_LEN + 4].copy_from_slice(&self.public_port.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PUBLIC_URL_LEN + 4 {
            return Err(ProtocolError::PayloadTooLarge {
                len: buf.len() as u32,
                cap: (PUBLIC_URL_LEN + 4) as u32,
            });
        }
        let public_url = read_fixed_str(&buf[0..PUBLIC_URL_LEN]);
        let mut port_bytes = [0u8; 4];
        port_bytes.copy_from_slice(&buf[PUBLIC_URL_LEN..PUBLIC_URL_LEN + 4]);
        let public_port = i32::from_be_bytes(port_bytes);
        Ok(Self {
            public_url,
            public_port,
        })
    }
}

/// Splices a raw byte stream (the public HTTP socket on the server side, or
/// the local service socket on the client side) against a framed tunnel
/// data connection, implementing the §4.1/§4.2 "bytes phase" contract from
/// whichever side calls it: bytes read off `raw` are wrapped in DATA frames
/// and written to `data`; DATA frames read off `data` are unwrapped and
/// written raw to `raw`. A framed CLOSE received on `data`, or EOF/error on
/// either side, triggers orderly shutdown: the closing side sends CLOSE on
/// `data` (if it was the raw side that closed) and half-closes its own
/// write half; `idle_timeout` bounds how long either direction waits for
/// its next byte before giving up.
pub async fn splice_raw_and_framed<A, B>(raw: A, data: B, session_id: u32, max_payload: u32, idle_timeout: Duration)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut raw_r, mut raw_w) = tokio::io::split(raw);
    let (mut data_r, mut data_w) = tokio::io::split(data);

    let raw_to_data = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = match tokio::time::timeout(idle_timeout, raw_r.read(&mut buf)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => n,
                Ok(Err(_)) => break,
            };
            if send(&mut data_w, MsgType::Data, session_id, &buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = send(&mut data_w, MsgType::Close, session_id, &[]).await;
        let _ = data_w.shutdown().await;
    };

    let data_to_raw = async {
        loop {
            match tokio::time::timeout(idle_timeout, recv(&mut data_r, max_payload)).await {
                Ok(Ok((header, payload))) => match header.msg_type {
                    MsgType::Data => {
                        if !payload.is_empty() && raw_w.write_all(&payload).await.is_err() {
                            break;
                        }
                    }
                    MsgType::Close => break,
                    _ => break,
                },
                _ => break,
            }
        }
        let _ = raw_w.shutdown().await;
    };

    tokio::join!(raw_to_data, data_to_raw);
}
