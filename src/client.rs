//! Client-side upload state machine and driver.
//!
//! The protocol logic lives in [`UploadMachine`], an explicit state
//! machine whose handlers consume one event and return the messages to
//! send. It never touches the network, which makes every transition
//! testable without a transport. [`Uploader`] couples a machine to a
//! [`ClientEndpoint`], timers and reconnection.
//!
//! The machine moves through
//! `Init -> AwaitApproval -> Streaming -> Draining -> AwaitFinish -> Done`,
//! with `Failed` reachable from every state. While streaming it reads the
//! source in chunk-sized pieces, feeds a running SHA-256 in send order,
//! retains emitted chunks in the [`ChunkRing`] and spends one credit per
//! emission. The final chunk carries the digest of the whole file as its
//! trailer.

use crate::auth::ClientKey;
use crate::config::ClientConfig;
use crate::error::{ErrorCode, UploadError};
use crate::messages::{ClientMessage, ServerMessage, FLAG_LAST_CHUNK};
use crate::progress::TransferProgress;
use crate::retention::{ChunkRecord, ChunkRing};
use crate::transport::{ClientEndpoint, ClientId};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info, warn};

/// States of one client upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Init,
    AwaitApproval,
    Streaming,
    Draining,
    AwaitFinish,
    Done,
    Failed,
}

/// Why an upload ended in `Failed`.
#[derive(Debug, Clone)]
pub enum FailureKind {
    /// Local read failure.
    Io(String),
    /// The server reported an error.
    Remote { code: u32, msg: String },
    /// The retry budget for unanswered probes ran out.
    Timeout,
    /// The server asked for data below the retention window.
    RetentionExhausted { wanted: u64, low_water: u64 },
    /// The front end cancelled the upload.
    Cancelled,
}

impl FailureKind {
    fn into_error(self) -> UploadError {
        match self {
            FailureKind::Io(msg) => {
                UploadError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg))
            }
            FailureKind::Remote { code, msg } => UploadError::Remote { code, msg },
            FailureKind::Timeout => UploadError::Timeout,
            FailureKind::RetentionExhausted { wanted, low_water } => {
                UploadError::RetentionExhausted { wanted, low_water }
            }
            FailureKind::Cancelled => UploadError::Cancelled,
        }
    }
}

/// Sequential chunk reader with a one-chunk lookahead.
///
/// The lookahead is what lets the machine set the last-chunk flag on the
/// final piece of data itself instead of sending a trailing empty chunk:
/// a chunk is last exactly when nothing follows it. A zero-byte source
/// yields a single empty last chunk whose trailer is the digest of the
/// empty string.
struct ChunkSource<R> {
    reader: R,
    chunksize: usize,
    lookahead: Option<Bytes>,
    next_seek: u64,
    hasher: Option<Sha256>,
    finished: bool,
}

impl<R: Read> ChunkSource<R> {
    fn new(reader: R, chunksize: usize) -> Self {
        Self {
            reader,
            chunksize,
            lookahead: None,
            next_seek: 0,
            hasher: Some(Sha256::new()),
            finished: false,
        }
    }

    /// Reads until the buffer is full or the source is exhausted.
    fn fill(&mut self) -> std::io::Result<Bytes> {
        let mut buf = vec![0u8; self.chunksize];
        let mut read = 0;
        while read < self.chunksize {
            let n = self.reader.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(Bytes::from(buf))
    }

    fn next(&mut self) -> std::io::Result<Option<ChunkRecord>> {
        if self.finished {
            return Ok(None);
        }
        let current = match self.lookahead.take() {
            Some(chunk) => chunk,
            None => self.fill()?,
        };
        let upcoming = self.fill()?;
        let is_last = upcoming.is_empty();
        self.lookahead = Some(upcoming);

        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&current);
        }
        let seek = self.next_seek;
        self.next_seek += current.len() as u64;

        let checksum = if is_last {
            self.finished = true;
            let digest = self.hasher.take().map(|h| h.finalize());
            digest.map(|d| {
                let mut out = [0u8; 32];
                out.copy_from_slice(&d);
                out
            })
        } else {
            None
        };

        Ok(Some(ChunkRecord {
            seek,
            payload: current,
            is_last,
            checksum,
        }))
    }

    /// Total bytes read from the source so far.
    fn bytes_read(&self) -> u64 {
        self.next_seek + self.lookahead.as_ref().map(|b| b.len() as u64).unwrap_or(0)
    }
}

/// The client upload protocol engine.
pub struct UploadMachine<R> {
    state: UploadState,
    filename: String,
    meta: String,
    reader: Option<R>,
    source: Option<ChunkSource<R>>,
    ring: ChunkRing,
    /// Records to re-emit (from the ring) before fresh reads resume.
    pending: VecDeque<ChunkRecord>,
    credit: u32,
    maxqueue: u32,
    /// Next seek the server expects from us.
    cursor: u64,
    /// The last chunk has been emitted at least once.
    last_sent: bool,
    probes_left: u32,
    retry_budget: u32,
    failure: Option<FailureKind>,
    upload_id: Option<String>,
}

impl<R: Read> UploadMachine<R> {
    pub fn new(filename: String, meta: String, reader: R, retry_budget: u32) -> Self {
        Self {
            state: UploadState::Init,
            filename,
            meta,
            reader: Some(reader),
            source: None,
            ring: ChunkRing::new(1),
            pending: VecDeque::new(),
            credit: 0,
            maxqueue: 0,
            cursor: 0,
            last_sent: false,
            probes_left: retry_budget,
            retry_budget,
            failure: None,
            upload_id: None,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Set once the machine reaches `Done`.
    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    /// Set once the machine reaches `Failed`.
    pub fn failure(&self) -> Option<&FailureKind> {
        self.failure.as_ref()
    }

    /// Bytes consumed from the source; drives the progress display.
    pub fn bytes_read(&self) -> u64 {
        self.source.as_ref().map(|s| s.bytes_read()).unwrap_or(0)
    }

    fn post_file(&self) -> ClientMessage {
        ClientMessage::PostFile {
            flags: 0,
            filename: self.filename.clone(),
            meta: self.meta.clone(),
        }
    }

    fn fail(&mut self, kind: FailureKind) {
        self.state = UploadState::Failed;
        self.failure = Some(kind);
        self.ring.clear();
        self.pending.clear();
    }

    /// Announces the upload. `Init -> AwaitApproval`.
    pub fn start(&mut self) -> Vec<ClientMessage> {
        debug_assert_eq!(self.state, UploadState::Init);
        self.state = UploadState::AwaitApproval;
        vec![self.post_file()]
    }

    /// Handles one server message.
    pub fn on_message(&mut self, msg: ServerMessage) -> Vec<ClientMessage> {
        self.probes_left = self.retry_budget;
        match msg {
            ServerMessage::UploadApproved {
                credit,
                chunksize,
                maxqueue,
            } => self.on_approved(credit, chunksize, maxqueue),
            ServerMessage::TransferCredit { amount } => self.on_credit(amount),
            ServerMessage::StatusReport { seek, credit } => self.on_status_report(seek, credit),
            ServerMessage::UploadFinished { upload_id } => self.on_finished(upload_id),
            ServerMessage::Error { code, msg } => {
                warn!(code, msg = %msg, "server reported error");
                self.fail(FailureKind::Remote { code, msg });
                Vec::new()
            }
        }
    }

    fn on_approved(&mut self, credit: u32, chunksize: u32, maxqueue: u32) -> Vec<ClientMessage> {
        if self.state != UploadState::AwaitApproval {
            // Idempotent re-announcement answered twice; nothing to do.
            debug!("duplicate upload-approved ignored");
            return Vec::new();
        }
        if chunksize == 0 || maxqueue == 0 {
            self.fail(FailureKind::Remote {
                code: ErrorCode::MalformedFrame.code(),
                msg: "approved with zero chunksize or maxqueue".into(),
            });
            return vec![ClientMessage::Error {
                code: ErrorCode::MalformedFrame.code(),
                msg: "invalid upload parameters".into(),
            }];
        }
        debug!(credit, chunksize, maxqueue, "upload approved");
        let reader = self.reader.take().expect("reader consumed exactly once");
        self.source = Some(ChunkSource::new(reader, chunksize as usize));
        self.ring = ChunkRing::new(maxqueue as usize);
        self.credit = credit.min(maxqueue);
        self.maxqueue = maxqueue;
        self.state = UploadState::Streaming;
        self.pump()
    }

    fn on_credit(&mut self, amount: u32) -> Vec<ClientMessage> {
        if !matches!(
            self.state,
            UploadState::Streaming | UploadState::Draining | UploadState::AwaitFinish
        ) {
            return Vec::new();
        }
        self.credit = (self.credit + amount).min(self.maxqueue);
        debug!(amount, credit = self.credit, "credit received");
        if self.state == UploadState::Draining {
            self.state = UploadState::Streaming;
        }
        self.pump()
    }

    fn on_status_report(&mut self, seek: u64, credit: u32) -> Vec<ClientMessage> {
        if !matches!(
            self.state,
            UploadState::Streaming | UploadState::Draining | UploadState::AwaitFinish
        ) {
            return Vec::new();
        }
        debug!(seek, credit, cursor = self.cursor, "status report");
        self.credit = credit.min(self.maxqueue);
        if seek < self.cursor {
            // The server is behind us: rewind and re-emit from retention.
            match self.ring.resend_from(seek) {
                Ok(records) => {
                    self.pending = records.into();
                    self.cursor = seek;
                }
                Err(UploadError::RetentionExhausted { wanted, low_water }) => {
                    self.fail(FailureKind::RetentionExhausted { wanted, low_water });
                    return vec![ClientMessage::Error {
                        code: ErrorCode::Internal.code(),
                        msg: "retention-exhausted".into(),
                    }];
                }
                Err(_) => unreachable!("resend_from only fails with RetentionExhausted"),
            }
        }
        self.state = UploadState::Streaming;
        self.pump()
    }

    fn on_finished(&mut self, upload_id: String) -> Vec<ClientMessage> {
        if !matches!(
            self.state,
            UploadState::Streaming | UploadState::Draining | UploadState::AwaitFinish
        ) {
            return Vec::new();
        }
        info!(upload_id = %upload_id, "upload finished");
        self.upload_id = Some(upload_id);
        self.state = UploadState::Done;
        self.ring.clear();
        self.pending.clear();
        Vec::new()
    }

    /// The inactivity timer fired while waiting for the server.
    pub fn on_idle_timeout(&mut self) -> Vec<ClientMessage> {
        if !matches!(
            self.state,
            UploadState::AwaitApproval
                | UploadState::Streaming
                | UploadState::Draining
                | UploadState::AwaitFinish
        ) {
            return Vec::new();
        }
        if self.probes_left == 0 {
            warn!("server unresponsive, giving up");
            self.fail(FailureKind::Timeout);
            return vec![ClientMessage::Error {
                code: ErrorCode::Timeout.code(),
                msg: "no response from server".into(),
            }];
        }
        self.probes_left -= 1;
        if self.state == UploadState::AwaitApproval {
            // The announcement may have been lost; repeating it is safe.
            debug!("re-announcing upload");
            vec![self.post_file()]
        } else {
            debug!(probes_left = self.probes_left, "probing server status");
            vec![ClientMessage::QueryStatus]
        }
    }

    /// The transport reconnected under the same identity.
    ///
    /// Before approval the announcement is repeated; afterwards the
    /// position handshake starts with `query-status`, and the server's
    /// status report is the first authoritative word on where to resume.
    pub fn on_reconnect(&mut self) -> Vec<ClientMessage> {
        self.probes_left = self.retry_budget;
        match self.state {
            UploadState::AwaitApproval => vec![self.post_file()],
            UploadState::Streaming | UploadState::Draining | UploadState::AwaitFinish => {
                vec![ClientMessage::QueryStatus]
            }
            _ => Vec::new(),
        }
    }

    /// Front-end cancellation; tells the server and releases the ring.
    pub fn cancel(&mut self) -> Vec<ClientMessage> {
        if matches!(self.state, UploadState::Done | UploadState::Failed) {
            return Vec::new();
        }
        self.fail(FailureKind::Cancelled);
        vec![ClientMessage::Error {
            code: ErrorCode::Cancelled.code(),
            msg: "client-cancelled".into(),
        }]
    }

    /// Emits chunks while credit lasts, retransmits first.
    fn pump(&mut self) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while self.state == UploadState::Streaming && self.credit > 0 {
            let record = if let Some(record) = self.pending.pop_front() {
                record
            } else {
                match self.source.as_mut().expect("source set on approval").next() {
                    Ok(Some(record)) => {
                        self.ring.push(record.clone());
                        record
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let msg = format!("local read failed: {e}");
                        self.fail(FailureKind::Io(msg.clone()));
                        out.push(ClientMessage::Error {
                            code: ErrorCode::Internal.code(),
                            msg,
                        });
                        return out;
                    }
                }
            };

            self.cursor = record.seek + record.payload.len() as u64;
            self.credit -= 1;
            let is_last = record.is_last;
            out.push(ClientMessage::PostChunk {
                flags: if is_last { FLAG_LAST_CHUNK } else { 0 },
                seek: record.seek,
                data: record.payload,
                checksum: record.checksum,
            });
            if is_last {
                self.last_sent = true;
                self.state = UploadState::AwaitFinish;
            }
        }

        if self.state == UploadState::Streaming {
            if self.pending.is_empty() && self.last_sent && self.source_drained() {
                // Everything re-sent; back to waiting for the commit.
                self.state = UploadState::AwaitFinish;
            } else if self.credit == 0 {
                self.state = UploadState::Draining;
            }
        }
        out
    }

    fn source_drained(&self) -> bool {
        self.source.as_ref().map(|s| s.finished).unwrap_or(false)
    }
}

/// Drives an [`UploadMachine`] over a live connection.
pub struct Uploader {
    machine: UploadMachine<Box<dyn Read + Send>>,
    endpoint: ClientEndpoint,
    addr: String,
    key: ClientKey,
    config: ClientConfig,
    progress: TransferProgress,
}

impl Uploader {
    /// Connects to the server and prepares the upload.
    pub async fn connect(
        addr: String,
        key: ClientKey,
        filename: String,
        meta: String,
        reader: Box<dyn Read + Send>,
        source_len: Option<u64>,
        config: ClientConfig,
    ) -> Result<Self, UploadError> {
        let identity = ClientId::random();
        let endpoint = ClientEndpoint::connect(&addr, &key, identity).await?;
        info!(server = %addr, identity = %identity, file = %filename, "connected");
        let machine = UploadMachine::new(filename, meta, reader, config.retry_count);
        let progress = TransferProgress::new(source_len, config.progress_bar);
        Ok(Self {
            machine,
            endpoint,
            addr,
            key,
            config,
            progress,
        })
    }

    /// Runs the upload to completion and returns the server's upload id.
    pub async fn run(mut self) -> Result<String, UploadError> {
        let opening = self.machine.start();
        self.dispatch(opening).await?;

        let idle = Duration::from_secs(self.config.inactivity_timeout_secs);
        loop {
            match self.machine.state() {
                UploadState::Done => {
                    self.progress.finish();
                    return Ok(self
                        .machine
                        .upload_id()
                        .unwrap_or_default()
                        .to_string());
                }
                UploadState::Failed => {
                    let failure = self
                        .machine
                        .failure()
                        .cloned()
                        .unwrap_or(FailureKind::Timeout);
                    return Err(failure.into_error());
                }
                _ => {}
            }

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("cancelling upload");
                    let goodbye = self.machine.cancel();
                    // Best effort; the server also times us out.
                    let _ = self.send_all(&goodbye).await;
                    return Err(UploadError::Cancelled);
                }
                received = tokio::time::timeout(idle, self.endpoint.recv()) => {
                    let out = match received {
                        Ok(Ok(frames)) => {
                            let msg = ServerMessage::decode(&frames)?;
                            self.machine.on_message(msg)
                        }
                        Ok(Err(e)) => {
                            debug!(error = %e, "transport dropped, reconnecting");
                            self.reconnect().await?;
                            self.machine.on_reconnect()
                        }
                        Err(_) => self.machine.on_idle_timeout(),
                    };
                    self.dispatch(out).await?;
                }
            }
        }
    }

    /// Sends machine output, reconnecting and resyncing on send failure.
    async fn dispatch(&mut self, msgs: Vec<ClientMessage>) -> Result<(), UploadError> {
        if self.send_all(&msgs).await.is_err() {
            debug!("send failed, reconnecting");
            self.reconnect().await?;
            let resync = self.machine.on_reconnect();
            self.send_all(&resync).await?;
        }
        self.progress.set_position(self.machine.bytes_read());
        Ok(())
    }

    async fn send_all(&mut self, msgs: &[ClientMessage]) -> Result<(), UploadError> {
        for msg in msgs {
            self.endpoint.send(&msg.encode()).await?;
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), UploadError> {
        let identity = self.endpoint.identity();
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        let mut last_err = UploadError::Timeout;
        for attempt in 1..=self.config.reconnect_attempts {
            tokio::time::sleep(delay * attempt).await;
            match ClientEndpoint::connect(&self.addr, &self.key, identity).await {
                Ok(endpoint) => {
                    info!(attempt, "reconnected");
                    self.endpoint = endpoint;
                    return Ok(());
                }
                Err(e @ UploadError::Unauthorized) => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}
