//! Wire messages exchanged between client and server.
//!
//! Every message is a multi-frame record. Frame 0 is an ASCII command tag;
//! the remaining frames are positional arguments. Integers are big-endian
//! and fixed width, strings are UTF-8, metadata is UTF-8 JSON text.
//!
//! The codec is strict: a wrong frame count, an unknown tag, an integer
//! frame of the wrong length, or invalid UTF-8 in a declared string field
//! all reject the message. Unknown tags indicate version skew and are a
//! protocol error, not something to skip.

use crate::error::UploadError;
use bytes::Bytes;

/// Last-chunk marker on `post-chunk`. All other flag bits must be zero.
pub const FLAG_LAST_CHUNK: u32 = 1;

/// Length of the SHA-256 trailer frame in bytes.
pub const CHECKSUM_LEN: usize = 32;

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Announces a new upload: flags (reserved, zero), filename, metadata.
    PostFile {
        flags: u32,
        filename: String,
        meta: String,
    },
    /// Carries one chunk of file data at the given byte offset.
    ///
    /// The checksum trailer is present iff `flags & FLAG_LAST_CHUNK` is set
    /// and covers the whole file.
    PostChunk {
        flags: u32,
        seek: u64,
        data: Bytes,
        checksum: Option<[u8; CHECKSUM_LEN]>,
    },
    /// Asks the server for the current write offset and credit.
    QueryStatus,
    /// Reports a client-side failure.
    Error { code: u32, msg: String },
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Accepts an upload and hands out the negotiated parameters.
    UploadApproved {
        credit: u32,
        chunksize: u32,
        maxqueue: u32,
    },
    /// Grants additional send credit.
    TransferCredit { amount: u32 },
    /// Authoritative statement of the persisted offset and current credit.
    StatusReport { seek: u64, credit: u32 },
    /// The upload was committed under the given id.
    UploadFinished { upload_id: String },
    /// Reports a server-side failure.
    Error { code: u32, msg: String },
}

impl ClientMessage {
    /// Whether this is a `post-chunk` with the last-chunk bit set.
    pub fn is_last_chunk(&self) -> bool {
        matches!(self, ClientMessage::PostChunk { flags, .. } if flags & FLAG_LAST_CHUNK != 0)
    }

    /// Encodes the message into wire frames.
    pub fn encode(&self) -> Vec<Bytes> {
        match self {
            ClientMessage::PostFile {
                flags,
                filename,
                meta,
            } => vec![
                Bytes::from_static(b"post-file"),
                Bytes::copy_from_slice(&flags.to_be_bytes()),
                Bytes::copy_from_slice(filename.as_bytes()),
                Bytes::copy_from_slice(meta.as_bytes()),
            ],
            ClientMessage::PostChunk {
                flags,
                seek,
                data,
                checksum,
            } => {
                let mut frames = vec![
                    Bytes::from_static(b"post-chunk"),
                    Bytes::copy_from_slice(&flags.to_be_bytes()),
                    Bytes::copy_from_slice(&seek.to_be_bytes()),
                    data.clone(),
                ];
                if let Some(sum) = checksum {
                    frames.push(Bytes::copy_from_slice(sum));
                }
                frames
            }
            ClientMessage::QueryStatus => vec![Bytes::from_static(b"query-status")],
            ClientMessage::Error { code, msg } => vec![
                Bytes::from_static(b"error"),
                Bytes::copy_from_slice(&code.to_be_bytes()),
                Bytes::copy_from_slice(msg.as_bytes()),
            ],
        }
    }

    /// Decodes wire frames into a client message.
    pub fn decode(frames: &[Bytes]) -> Result<Self, UploadError> {
        let tag = frames
            .first()
            .ok_or_else(|| protocol("empty message"))?
            .as_ref();
        match tag {
            b"post-file" => {
                expect_frames(frames, 4)?;
                Ok(ClientMessage::PostFile {
                    flags: be_u32(&frames[1], "flags")?,
                    filename: utf8(&frames[2], "filename")?,
                    meta: utf8(&frames[3], "meta")?,
                })
            }
            b"post-chunk" => {
                if frames.len() < 4 {
                    return Err(protocol("post-chunk needs at least 4 frames"));
                }
                let flags = be_u32(&frames[1], "flags")?;
                if flags & !FLAG_LAST_CHUNK != 0 {
                    return Err(protocol("post-chunk carries unknown flag bits"));
                }
                let seek = be_u64(&frames[2], "seek")?;
                let data = frames[3].clone();
                let is_last = flags & FLAG_LAST_CHUNK != 0;
                let checksum = if is_last {
                    expect_frames(frames, 5)?;
                    let sum = frames[4].as_ref();
                    if sum.len() != CHECKSUM_LEN {
                        return Err(protocol("checksum trailer must be 32 bytes"));
                    }
                    let mut out = [0u8; CHECKSUM_LEN];
                    out.copy_from_slice(sum);
                    Some(out)
                } else {
                    expect_frames(frames, 4)?;
                    None
                };
                Ok(ClientMessage::PostChunk {
                    flags,
                    seek,
                    data,
                    checksum,
                })
            }
            b"query-status" => {
                expect_frames(frames, 1)?;
                Ok(ClientMessage::QueryStatus)
            }
            b"error" => {
                expect_frames(frames, 3)?;
                Ok(ClientMessage::Error {
                    code: be_u32(&frames[1], "code")?,
                    msg: utf8(&frames[2], "msg")?,
                })
            }
            other => Err(protocol(&format!(
                "unknown command tag: {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

impl ServerMessage {
    /// Encodes the message into wire frames.
    pub fn encode(&self) -> Vec<Bytes> {
        match self {
            ServerMessage::UploadApproved {
                credit,
                chunksize,
                maxqueue,
            } => vec![
                Bytes::from_static(b"upload-approved"),
                Bytes::copy_from_slice(&credit.to_be_bytes()),
                Bytes::copy_from_slice(&chunksize.to_be_bytes()),
                Bytes::copy_from_slice(&maxqueue.to_be_bytes()),
            ],
            ServerMessage::TransferCredit { amount } => vec![
                Bytes::from_static(b"transfer-credit"),
                Bytes::copy_from_slice(&amount.to_be_bytes()),
            ],
            ServerMessage::StatusReport { seek, credit } => vec![
                Bytes::from_static(b"status-report"),
                Bytes::copy_from_slice(&seek.to_be_bytes()),
                Bytes::copy_from_slice(&credit.to_be_bytes()),
            ],
            ServerMessage::UploadFinished { upload_id } => vec![
                Bytes::from_static(b"upload-finished"),
                Bytes::copy_from_slice(upload_id.as_bytes()),
            ],
            ServerMessage::Error { code, msg } => vec![
                Bytes::from_static(b"error"),
                Bytes::copy_from_slice(&code.to_be_bytes()),
                Bytes::copy_from_slice(msg.as_bytes()),
            ],
        }
    }

    /// Decodes wire frames into a server message.
    pub fn decode(frames: &[Bytes]) -> Result<Self, UploadError> {
        let tag = frames
            .first()
            .ok_or_else(|| protocol("empty message"))?
            .as_ref();
        match tag {
            b"upload-approved" => {
                expect_frames(frames, 4)?;
                Ok(ServerMessage::UploadApproved {
                    credit: be_u32(&frames[1], "credit")?,
                    chunksize: be_u32(&frames[2], "chunksize")?,
                    maxqueue: be_u32(&frames[3], "maxqueue")?,
                })
            }
            b"transfer-credit" => {
                expect_frames(frames, 2)?;
                Ok(ServerMessage::TransferCredit {
                    amount: be_u32(&frames[1], "amount")?,
                })
            }
            b"status-report" => {
                expect_frames(frames, 3)?;
                Ok(ServerMessage::StatusReport {
                    seek: be_u64(&frames[1], "seek")?,
                    credit: be_u32(&frames[2], "credit")?,
                })
            }
            b"upload-finished" => {
                expect_frames(frames, 2)?;
                Ok(ServerMessage::UploadFinished {
                    upload_id: utf8(&frames[1], "upload_id")?,
                })
            }
            b"error" => {
                expect_frames(frames, 3)?;
                Ok(ServerMessage::Error {
                    code: be_u32(&frames[1], "code")?,
                    msg: utf8(&frames[2], "msg")?,
                })
            }
            other => Err(protocol(&format!(
                "unknown command tag: {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

fn protocol(msg: &str) -> UploadError {
    UploadError::Protocol(msg.to_string())
}

fn expect_frames(frames: &[Bytes], want: usize) -> Result<(), UploadError> {
    if frames.len() != want {
        return Err(protocol(&format!(
            "wrong frame count: expected {want}, got {}",
            frames.len()
        )));
    }
    Ok(())
}

fn be_u32(frame: &Bytes, field: &str) -> Result<u32, UploadError> {
    let bytes: [u8; 4] = frame
        .as_ref()
        .try_into()
        .map_err(|_| protocol(&format!("field {field} must be 4 bytes")))?;
    Ok(u32::from_be_bytes(bytes))
}

fn be_u64(frame: &Bytes, field: &str) -> Result<u64, UploadError> {
    let bytes: [u8; 8] = frame
        .as_ref()
        .try_into()
        .map_err(|_| protocol(&format!("field {field} must be 8 bytes")))?;
    Ok(u64::from_be_bytes(bytes))
}

fn utf8(frame: &Bytes, field: &str) -> Result<String, UploadError> {
    String::from_utf8(frame.to_vec())
        .map_err(|_| protocol(&format!("field {field} is not valid UTF-8")))
}
