//! Message transport between client and server.
//!
//! The transport delivers whole multipart messages over TCP. Each message
//! is sealed as one AEAD unit and framed with a big-endian length:
//!
//! ```text
//! [u32: sealed_len][sealed bytes]
//!
//! sealed plaintext:
//!   [u8: frame count]
//!   per frame: [u32: len][bytes]
//! ```
//!
//! A connection starts with a plaintext handshake:
//!
//! ```text
//! C -> S: [5 bytes magic "CONV1"][16 bytes identity]
//!         [u16: key id len][key id UTF-8]
//!         [u32: c2s nonce prefix][u32: s2c nonce prefix]
//! S -> C: [1 byte: 0x01 accepted / 0x00 rejected]
//! ```
//!
//! The server looks the key id up in the authorization store; unknown ids
//! are rejected before any protocol message flows. All subsequent traffic
//! is sealed under the pre-shared key with the negotiated nonce prefixes.
//! The identity is chosen by the client per upload attempt and survives
//! reconnects, which is what lets the server resume an interrupted upload.

use crate::auth::{ClientKey, KeyStore};
use crate::crypto::{FrameOpener, FrameSealer};
use crate::error::UploadError;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

const MAGIC: &[u8; 5] = b"CONV1";
const AUTH_OK: u8 = 0x01;
const AUTH_REJECTED: u8 = 0x00;

/// Upper bound on one sealed message; anything larger is malformed.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
/// Upper bound on frames per message; the widest real message has five.
pub const MAX_FRAMES: usize = 8;
const MAX_KEY_ID_LEN: usize = 256;

/// Transport-level identity of one upload attempt.
///
/// A random 128-bit value chosen by the client; the server routes
/// messages by this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub [u8; 16]);

impl ClientId {
    /// A fresh random identity for one upload attempt.
    pub fn random() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

fn encode_multipart(frames: &[Bytes]) -> Result<Vec<u8>, UploadError> {
    if frames.is_empty() || frames.len() > MAX_FRAMES {
        return Err(UploadError::Protocol(format!(
            "message must have 1..={MAX_FRAMES} frames, got {}",
            frames.len()
        )));
    }
    let total: usize = frames.iter().map(|f| 4 + f.len()).sum();
    let mut buf = Vec::with_capacity(1 + total);
    buf.push(frames.len() as u8);
    for frame in frames {
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }
    Ok(buf)
}

fn decode_multipart(mut buf: &[u8]) -> Result<Vec<Bytes>, UploadError> {
    let malformed = |what: &str| UploadError::Protocol(format!("malformed multipart: {what}"));
    let (&count, rest) = buf.split_first().ok_or_else(|| malformed("empty"))?;
    buf = rest;
    if count == 0 || count as usize > MAX_FRAMES {
        return Err(malformed("bad frame count"));
    }
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if buf.len() < 4 {
            return Err(malformed("truncated frame length"));
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        buf = &buf[4..];
        if buf.len() < len {
            return Err(malformed("truncated frame body"));
        }
        frames.push(Bytes::copy_from_slice(&buf[..len]));
        buf = &buf[len..];
    }
    if !buf.is_empty() {
        return Err(malformed("trailing bytes"));
    }
    Ok(frames)
}

/// Reads sealed multipart messages from one transport direction.
pub struct FrameReader<R> {
    inner: R,
    opener: FrameOpener,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, opener: FrameOpener) -> Self {
        Self { inner, opener }
    }

    /// Reads, opens and splits the next message.
    pub async fn read_message(&mut self) -> Result<Vec<Bytes>, UploadError> {
        let len = self.inner.read_u32().await? as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(UploadError::Protocol(format!(
                "message of {len} bytes exceeds limit"
            )));
        }
        let mut sealed = vec![0u8; len];
        self.inner.read_exact(&mut sealed).await?;
        self.opener.open(&mut sealed)?;
        decode_multipart(&sealed)
    }
}

/// Writes sealed multipart messages to one transport direction.
pub struct FrameWriter<W> {
    inner: W,
    sealer: FrameSealer,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, sealer: FrameSealer) -> Self {
        Self { inner, sealer }
    }

    /// Seals and writes one message.
    pub async fn write_message(&mut self, frames: &[Bytes]) -> Result<(), UploadError> {
        let mut buf = encode_multipart(frames)?;
        self.sealer.seal(&mut buf)?;
        self.inner.write_u32(buf.len() as u32).await?;
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Client side of the handshake, generic for testability.
pub async fn client_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    key: &ClientKey,
    identity: ClientId,
    c2s_prefix: u32,
    s2c_prefix: u32,
) -> Result<(), UploadError> {
    if key.id.len() > MAX_KEY_ID_LEN {
        return Err(UploadError::Config("key id too long".into()));
    }
    stream.write_all(MAGIC).await?;
    stream.write_all(&identity.0).await?;
    stream.write_u16(key.id.len() as u16).await?;
    stream.write_all(key.id.as_bytes()).await?;
    stream.write_u32(c2s_prefix).await?;
    stream.write_u32(s2c_prefix).await?;
    stream.flush().await?;

    match stream.read_u8().await? {
        AUTH_OK => Ok(()),
        _ => Err(UploadError::Unauthorized),
    }
}

/// Server side of the handshake.
///
/// Returns the peer identity and the secret plus nonce prefixes to build
/// the sealed channel from. Unknown key ids are answered with a rejection
/// byte and an error.
pub async fn server_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    keys: &KeyStore,
) -> Result<(ClientId, [u8; 32], u32, u32), UploadError> {
    let mut magic = [0u8; 5];
    stream.read_exact(&mut magic).await?;
    if &magic != MAGIC {
        return Err(UploadError::Protocol("bad handshake magic".into()));
    }
    let mut identity = [0u8; 16];
    stream.read_exact(&mut identity).await?;
    let id_len = stream.read_u16().await? as usize;
    if id_len == 0 || id_len > MAX_KEY_ID_LEN {
        return Err(UploadError::Protocol("bad key id length".into()));
    }
    let mut key_id = vec![0u8; id_len];
    stream.read_exact(&mut key_id).await?;
    let key_id = String::from_utf8(key_id)
        .map_err(|_| UploadError::Protocol("key id is not valid UTF-8".into()))?;
    let c2s_prefix = stream.read_u32().await?;
    let s2c_prefix = stream.read_u32().await?;

    let Some(secret) = keys.lookup(&key_id) else {
        stream.write_u8(AUTH_REJECTED).await?;
        stream.flush().await?;
        return Err(UploadError::Unauthorized);
    };
    stream.write_u8(AUTH_OK).await?;
    stream.flush().await?;
    debug!(identity = %ClientId(identity), key_id, "handshake accepted");
    Ok((ClientId(identity), secret, c2s_prefix, s2c_prefix))
}

/// Client endpoint: one sealed connection to the server.
pub struct ClientEndpoint {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    identity: ClientId,
}

impl ClientEndpoint {
    /// Connects, handshakes and builds the sealed channel.
    ///
    /// Reconnection is a fresh `connect` with the same identity.
    pub async fn connect(
        addr: &str,
        key: &ClientKey,
        identity: ClientId,
    ) -> Result<Self, UploadError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        // Fresh nonce prefixes per connection so counters never repeat
        // under the long-term key.
        let nonce_seed = uuid::Uuid::new_v4();
        let seed = nonce_seed.as_bytes();
        let c2s_prefix = u32::from_be_bytes([seed[0], seed[1], seed[2], seed[3]]);
        let s2c_prefix = u32::from_be_bytes([seed[4], seed[5], seed[6], seed[7]]);

        client_handshake(&mut stream, key, identity, c2s_prefix, s2c_prefix).await?;

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(read_half, FrameOpener::new(&key.secret, s2c_prefix)?),
            writer: FrameWriter::new(write_half, FrameSealer::new(&key.secret, c2s_prefix)?),
            identity,
        })
    }

    pub fn identity(&self) -> ClientId {
        self.identity
    }

    pub async fn send(&mut self, frames: &[Bytes]) -> Result<(), UploadError> {
        self.writer.write_message(frames).await
    }

    pub async fn recv(&mut self) -> Result<Vec<Bytes>, UploadError> {
        self.reader.read_message().await
    }
}

/// Accepts one client connection on the server side.
///
/// Performs the handshake against the authorization store and returns the
/// peer identity with the two sealed channel halves.
pub async fn accept_client(
    stream: TcpStream,
    keys: &KeyStore,
) -> Result<
    (
        ClientId,
        FrameReader<OwnedReadHalf>,
        FrameWriter<OwnedWriteHalf>,
    ),
    UploadError,
> {
    stream.set_nodelay(true)?;
    let mut stream = stream;
    let (identity, secret, c2s_prefix, s2c_prefix) = server_handshake(&mut stream, keys).await?;
    let (read_half, write_half) = stream.into_split();
    Ok((
        identity,
        FrameReader::new(read_half, FrameOpener::new(&secret, c2s_prefix)?),
        FrameWriter::new(write_half, FrameSealer::new(&secret, s2c_prefix)?),
    ))
}
