//! Server-side upload engine and event loop.
//!
//! All protocol state lives in [`Engine`], a synchronous structure driven
//! by one event loop task; connection tasks only move sealed frames
//! between sockets and the loop's channel. That keeps every state
//! transition serialized without locks and makes the engine testable
//! without a listener.
//!
//! One [`UploadSession`] exists per connected identity and walks
//! `Validating -> Writing -> Committing -> Finished`, with `Rejected` and
//! `Aborted` as terminal side exits. Chunks are validated against the
//! expected write offset: stale chunks are dropped silently, chunks from
//! the future provoke a status report, and only the chunk at exactly
//! `write_offset` is written. The final chunk's trailer gates promotion.

use crate::config::ServerConfig;
use crate::credit::CreditController;
use crate::error::{ErrorCode, UploadError};
use crate::messages::{ClientMessage, ServerMessage};
use crate::storage::{StagedUpload, Storage};
use crate::transport::{accept_client, ClientId};
use crate::validate::{MetadataValidator, Validation};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// States of one server-side upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Validating,
    Writing,
    Committing,
    Finished,
    Rejected,
    Aborted,
}

/// One in-flight upload, keyed by client identity.
struct UploadSession {
    upload_id: String,
    filename: String,
    staged: StagedUpload,
    hasher: Sha256,
    write_offset: u64,
    chunksize: u32,
    state: SessionState,
    last_activity: Instant,
    last_probe: Option<Instant>,
    probes_sent: u32,
}

/// Messages addressed to one identity.
type Outbox = Vec<(ClientId, ServerMessage)>;

/// The upload protocol engine: sessions, credit and storage.
///
/// Time is passed in explicitly so timeout behavior is testable.
pub struct Engine<V> {
    config: ServerConfig,
    storage: Storage,
    validator: V,
    credit: CreditController,
    sessions: HashMap<ClientId, UploadSession>,
    last_status_log: Instant,
}

impl<V: MetadataValidator> Engine<V> {
    pub fn new(
        config: ServerConfig,
        storage: Storage,
        validator: V,
        now: Instant,
    ) -> Self {
        let credit = CreditController::new(
            config.credit_budget,
            config.credit_low_watermark,
            config.topup_threshold,
        );
        Self {
            config,
            storage,
            validator,
            credit,
            sessions: HashMap::new(),
            last_status_log: now,
        }
    }

    /// Number of live upload sessions.
    pub fn active_uploads(&self) -> usize {
        self.sessions.len()
    }

    /// Handles one decoded message from a client.
    pub fn handle_message(&mut self, id: ClientId, msg: ClientMessage, now: Instant) -> Outbox {
        match msg {
            ClientMessage::PostFile {
                flags: _,
                filename,
                meta,
            } => self.handle_post_file(id, filename, meta, now),
            ClientMessage::PostChunk {
                flags: _,
                seek,
                data,
                checksum,
            } => self.handle_post_chunk(id, seek, data, checksum, now),
            ClientMessage::QueryStatus => self.handle_query_status(id, now),
            ClientMessage::Error { code, msg } => {
                warn!(identity = %id, code, msg = %msg, "client reported error");
                self.abort_session(id, None);
                Vec::new()
            }
        }
    }

    /// A connection delivered bytes that failed to decode.
    ///
    /// Malformed frames are fatal to the session.
    pub fn handle_malformed(&mut self, id: ClientId, err: &UploadError) -> Outbox {
        warn!(identity = %id, error = %err, "malformed message");
        self.abort_session(
            id,
            Some(error_msg(ErrorCode::MalformedFrame, "malformed message")),
        )
    }

    fn handle_post_file(
        &mut self,
        id: ClientId,
        filename: String,
        meta: String,
        now: Instant,
    ) -> Outbox {
        if let Some(session) = self.sessions.get_mut(&id) {
            if session.filename == filename {
                // Idempotent re-announcement, typically after a reconnect
                // that lost our approval. Answer with the current
                // parameters and position.
                debug!(upload_id = %session.upload_id, "repeated post-file");
                session.last_activity = now;
                self.credit.on_activity(id, now);
                let credit = self.credit.credit_of(id);
                return vec![
                    (
                        id,
                        ServerMessage::UploadApproved {
                            credit,
                            chunksize: session.chunksize,
                            maxqueue: self.config.max_queue,
                        },
                    ),
                    (
                        id,
                        ServerMessage::StatusReport {
                            seek: session.write_offset,
                            credit,
                        },
                    ),
                ];
            }
            // Conflicting announcement: the in-flight upload dies and the
            // new one is refused.
            let upload_id = session.upload_id.clone();
            error!(
                identity = %id,
                upload_id = %upload_id,
                old = %session.filename,
                new = %filename,
                "conflicting post-file, aborting upload"
            );
            self.abort_session(id, None);
            return vec![(
                id,
                error_msg(ErrorCode::Conflict, "conflicting upload in progress"),
            )];
        }

        // Fresh announcement: validate, stage, approve.
        debug!(identity = %id, file = %filename, state = ?SessionState::Validating, "validating upload");
        if let Err(e) = crate::storage::validate_filename(&filename) {
            warn!(identity = %id, error = %e, "bad filename in post-file");
            return vec![(id, error_msg(ErrorCode::MalformedFrame, &e.to_string()))];
        }
        let parsed: serde_json::Value = match serde_json::from_str(&meta) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            Ok(_) => {
                return vec![(
                    id,
                    error_msg(ErrorCode::MalformedFrame, "metadata must be a JSON object"),
                )];
            }
            Err(e) => {
                return vec![(
                    id,
                    error_msg(ErrorCode::MalformedFrame, &format!("invalid metadata: {e}")),
                )];
            }
        };
        match self.validator.validate(&filename, &parsed) {
            Validation::Ok => {}
            Validation::Transient(msg) => {
                info!(identity = %id, msg = %msg, "transient validation failure");
                return vec![(
                    id,
                    error_msg(ErrorCode::NoCapacity, &format!("{msg}; retry later")),
                )];
            }
            Validation::Permanent { code, msg } => {
                info!(identity = %id, code, msg = %msg, state = ?SessionState::Rejected, "metadata rejected");
                return vec![(id, ServerMessage::Error { code, msg })];
            }
        }

        let upload_id = Uuid::new_v4().simple().to_string();
        let staged = match self.storage.open_staging(&upload_id, &filename, &meta) {
            Ok(staged) => staged,
            Err(UploadError::Remote { code, msg }) => {
                info!(identity = %id, code, msg = %msg, "upload refused by storage");
                return vec![(id, ServerMessage::Error { code, msg })];
            }
            Err(e) => {
                error!(identity = %id, error = %e, "failed to open staging file");
                return vec![(
                    id,
                    error_msg(ErrorCode::Internal, "failed to create upload"),
                )];
            }
        };

        let credit = self.credit.on_accept(id, self.config.max_queue, now);
        info!(
            upload_id = %upload_id,
            identity = %id,
            file = %filename,
            credit,
            "upload approved"
        );
        self.sessions.insert(
            id,
            UploadSession {
                upload_id,
                filename,
                staged,
                hasher: Sha256::new(),
                write_offset: 0,
                chunksize: self.config.chunk_size,
                state: SessionState::Writing,
                last_activity: now,
                last_probe: None,
                probes_sent: 0,
            },
        );
        vec![(
            id,
            ServerMessage::UploadApproved {
                credit,
                chunksize: self.config.chunk_size,
                maxqueue: self.config.max_queue,
            },
        )]
    }

    fn handle_post_chunk(
        &mut self,
        id: ClientId,
        seek: u64,
        data: Bytes,
        checksum: Option<[u8; 32]>,
        now: Instant,
    ) -> Outbox {
        let Some(session) = self.sessions.get_mut(&id) else {
            debug!(identity = %id, "chunk for unknown connection");
            return vec![(id, error_msg(ErrorCode::MalformedFrame, "unknown connection"))];
        };
        debug_assert_eq!(session.state, SessionState::Writing);
        session.last_activity = now;
        session.probes_sent = 0;
        session.last_probe = None;
        self.credit.on_activity(id, now);

        if data.len() as u64 > session.chunksize as u64 {
            let upload_id = session.upload_id.clone();
            warn!(upload_id = %upload_id, size = data.len(), "oversized chunk");
            self.abort_session(id, None);
            return vec![(
                id,
                error_msg(ErrorCode::ChunkTooLarge, "chunk exceeds negotiated size"),
            )];
        }
        if seek < session.write_offset {
            // Duplicate retransmit of data we already persisted.
            debug!(
                upload_id = %session.upload_id,
                seek,
                write_offset = session.write_offset,
                "discarding stale chunk"
            );
            return Vec::new();
        }
        if seek > session.write_offset {
            // Further ahead than credit accounting permits; tell the
            // client where we really are.
            debug!(
                upload_id = %session.upload_id,
                seek,
                write_offset = session.write_offset,
                "out-of-order chunk"
            );
            return vec![(
                id,
                ServerMessage::StatusReport {
                    seek: session.write_offset,
                    credit: self.credit.credit_of(id),
                },
            )];
        }

        if let Err(e) = session.staged.write_at(seek, &data) {
            let upload_id = session.upload_id.clone();
            error!(upload_id = %upload_id, error = %e, "chunk write failed");
            self.abort_session(id, None);
            return vec![(id, error_msg(ErrorCode::Internal, "write failed"))];
        }
        session.hasher.update(&data);
        session.write_offset += data.len() as u64;
        self.credit.on_write_complete(id, now);

        let mut out = Vec::new();
        if let Some(trailer) = checksum {
            out.extend(self.commit(id, trailer));
        } else if self.credit.needs_distribution() {
            out.extend(self.distribute());
        }
        out
    }

    /// Verifies the trailer and promotes the staged file.
    fn commit(&mut self, id: ClientId, trailer: [u8; 32]) -> Outbox {
        let mut session = self
            .sessions
            .remove(&id)
            .expect("commit is called with a live session");
        session.state = SessionState::Committing;
        self.credit.on_disconnect(id);

        let digest = session.hasher.finalize();
        let dest = session.staged.dest_path().to_path_buf();
        if digest.as_slice() != trailer {
            warn!(
                upload_id = %session.upload_id,
                "checksum mismatch, removing staged upload"
            );
            session.staged.abort();
            self.storage.release(&dest);
            return vec![(
                id,
                error_msg(ErrorCode::ChecksumMismatch, "checksum-mismatch"),
            )];
        }

        match session.staged.finalize(&hex::encode(digest)) {
            Ok(_) => {
                session.state = SessionState::Finished;
                info!(
                    upload_id = %session.upload_id,
                    file = %session.filename,
                    bytes = session.write_offset,
                    state = ?session.state,
                    "upload committed"
                );
                self.storage.release(&dest);
                vec![(
                    id,
                    ServerMessage::UploadFinished {
                        upload_id: session.upload_id,
                    },
                )]
            }
            Err(e) => {
                error!(
                    upload_id = %session.upload_id,
                    error = %e,
                    "promotion failed"
                );
                self.storage.release(&dest);
                vec![(id, error_msg(ErrorCode::Internal, "failed to store upload"))]
            }
        }
    }

    fn handle_query_status(&mut self, id: ClientId, now: Instant) -> Outbox {
        let Some(session) = self.sessions.get_mut(&id) else {
            debug!(identity = %id, "status query for unknown connection");
            return vec![(id, error_msg(ErrorCode::MalformedFrame, "unknown connection"))];
        };
        debug_assert_eq!(session.state, SessionState::Writing);
        session.last_activity = now;
        session.probes_sent = 0;
        session.last_probe = None;
        self.credit.on_activity(id, now);
        vec![(
            id,
            ServerMessage::StatusReport {
                seek: session.write_offset,
                credit: self.credit.credit_of(id),
            },
        )]
    }

    /// Periodic work: probes, timeouts, credit distribution, status log.
    pub fn tick(&mut self, now: Instant) -> Outbox {
        let mut out = Vec::new();

        let probe_idle = Duration::from_secs(self.config.probe_idle_secs);
        let hard_idle = Duration::from_secs(self.config.idle_abort_secs);
        let mut timed_out = Vec::new();
        let mut probes = Vec::new();
        for (&id, session) in &mut self.sessions {
            let idle = now.duration_since(session.last_activity);
            if idle >= hard_idle || session.probes_sent >= self.config.probe_limit {
                timed_out.push(id);
                continue;
            }
            let probe_due = match session.last_probe {
                Some(last) => now.duration_since(last) >= probe_idle,
                None => idle >= probe_idle,
            };
            if probe_due {
                session.probes_sent += 1;
                session.last_probe = Some(now);
                probes.push((id, session.write_offset, session.upload_id.clone()));
            }
        }
        for (id, write_offset, upload_id) in probes {
            // Reclaim the grant while the upload is silent; the status
            // report tells the client to stop sending until re-funded.
            let reclaimed = self.credit.on_timeout(id);
            debug!(upload_id = %upload_id, reclaimed, "probing idle upload");
            out.push((
                id,
                ServerMessage::StatusReport {
                    seek: write_offset,
                    credit: 0,
                },
            ));
        }
        for id in timed_out {
            if let Some(session) = self.sessions.get(&id) {
                warn!(upload_id = %session.upload_id, "upload timed out");
            }
            out.extend(self.abort_session(
                id,
                Some(error_msg(ErrorCode::Timeout, "upload timed out")),
            ));
        }

        if self.credit.needs_distribution() {
            out.extend(self.distribute());
        }

        if now.duration_since(self.last_status_log)
            >= Duration::from_secs(self.config.status_log_secs)
        {
            self.last_status_log = now;
            info!(
                uploads = self.sessions.len(),
                outstanding_credit = self.credit.debt(),
                "server status"
            );
        }
        out
    }

    fn distribute(&mut self) -> Outbox {
        self.credit
            .distribute()
            .into_iter()
            .map(|(id, amount)| {
                debug!(identity = %id, amount, "transferring credit");
                (id, ServerMessage::TransferCredit { amount })
            })
            .collect()
    }

    /// Tears a session down, optionally notifying the client first.
    ///
    /// Removes the staging file, releases the destination claim and
    /// returns the upload's credit to the pool. Terminal errors are
    /// logged with the upload id.
    fn abort_session(&mut self, id: ClientId, notice: Option<ServerMessage>) -> Outbox {
        let mut out = Vec::new();
        if let Some(mut session) = self.sessions.remove(&id) {
            session.state = SessionState::Aborted;
            if let Some(msg) = notice {
                if let ServerMessage::Error { code, ref msg } = msg {
                    error!(upload_id = %session.upload_id, code, msg = %msg, "upload aborted");
                }
                out.push((id, msg));
            } else {
                info!(upload_id = %session.upload_id, "upload aborted");
            }
            let dest = session.staged.dest_path().to_path_buf();
            session.staged.abort();
            self.storage.release(&dest);
            self.credit.on_disconnect(id);
        } else if let Some(msg) = notice {
            out.push((id, msg));
        }
        out
    }

    /// Cancels every active upload; used at shutdown.
    pub fn shutdown(&mut self) -> Outbox {
        let ids: Vec<ClientId> = self.sessions.keys().copied().collect();
        let mut out = Vec::new();
        for id in ids {
            out.extend(self.abort_session(
                id,
                Some(error_msg(ErrorCode::NoCapacity, "server shutdown")),
            ));
        }
        out
    }
}

fn error_msg(code: ErrorCode, msg: &str) -> ServerMessage {
    ServerMessage::Error {
        code: code.code(),
        msg: msg.to_string(),
    }
}

/// Events flowing from connection tasks into the engine loop.
enum LoopEvent {
    /// A connection completed its handshake; messages for this identity
    /// go to `tx` from now on.
    Attach {
        id: ClientId,
        tx: mpsc::UnboundedSender<ServerMessage>,
    },
    Message {
        id: ClientId,
        msg: ClientMessage,
    },
    Malformed {
        id: ClientId,
        err: UploadError,
    },
}

/// The network-facing upload server.
pub struct Server<V> {
    config: ServerConfig,
    validator: V,
}

impl<V: MetadataValidator + 'static> Server<V> {
    pub fn new(config: ServerConfig, validator: V) -> Self {
        Self { config, validator }
    }

    /// Binds the listener and serves until interrupted.
    pub async fn run(self) -> Result<(), UploadError> {
        let keys = crate::auth::KeyStore::load(&self.config.authorized_keys_dir)?;
        if keys.is_empty() {
            warn!("authorization store is empty, all clients will be rejected");
        }
        let storage = Storage::open(&self.config.staging_dir, &self.config.destination_dir)?;
        let mut engine = Engine::new(self.config.clone(), storage, self.validator, Instant::now());

        let bind = format!("{}:{}", self.config.address, self.config.port);
        let listener = TcpListener::bind(&bind).await?;
        info!(address = %bind, "upload server listening");

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<LoopEvent>();
        let keys = std::sync::Arc::new(keys);

        // Connection acceptor: handshake and pump frames into the loop.
        let acceptor = {
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            debug!(remote = %addr, "connection accepted");
                            let keys = keys.clone();
                            let event_tx = event_tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, &keys, event_tx).await {
                                    debug!(remote = %addr, error = %e, "connection ended");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }
            })
        };

        // The event loop: single owner of the engine.
        let mut routes: HashMap<ClientId, mpsc::UnboundedSender<ServerMessage>> = HashMap::new();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            let outbox = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    let outbox = engine.shutdown();
                    route_all(&mut routes, outbox);
                    break;
                }
                _ = ticker.tick() => engine.tick(Instant::now()),
                event = event_rx.recv() => match event {
                    Some(LoopEvent::Attach { id, tx }) => {
                        // Latest connection wins the route; an older one
                        // for the same identity is superseded.
                        routes.insert(id, tx);
                        Vec::new()
                    }
                    Some(LoopEvent::Message { id, msg }) => {
                        engine.handle_message(id, msg, Instant::now())
                    }
                    Some(LoopEvent::Malformed { id, err }) => {
                        engine.handle_malformed(id, &err)
                    }
                    None => break,
                },
            };
            route_all(&mut routes, outbox);
        }

        acceptor.abort();
        Ok(())
    }
}

fn route_all(
    routes: &mut HashMap<ClientId, mpsc::UnboundedSender<ServerMessage>>,
    outbox: Outbox,
) {
    for (id, msg) in outbox {
        if let Some(tx) = routes.get(&id) {
            if tx.send(msg).is_err() {
                routes.remove(&id);
            }
        } else {
            debug!(identity = %id, "no route for outgoing message");
        }
    }
}

/// Runs one authenticated connection: a writer task drains the outbound
/// queue while this task forwards inbound messages to the engine loop.
async fn serve_connection(
    stream: tokio::net::TcpStream,
    keys: &crate::auth::KeyStore,
    event_tx: mpsc::UnboundedSender<LoopEvent>,
) -> Result<(), UploadError> {
    let (id, mut reader, mut writer) = accept_client(stream, keys).await?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    if event_tx.send(LoopEvent::Attach { id, tx: out_tx }).is_err() {
        return Ok(());
    }

    let mut writer_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if writer.write_message(&msg.encode()).await.is_err() {
                break;
            }
        }
    });

    loop {
        match reader.read_message().await {
            Ok(frames) => match ClientMessage::decode(&frames) {
                Ok(msg) => {
                    if event_tx.send(LoopEvent::Message { id, msg }).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    // Fatal to the session; the connection is done too.
                    let _ = event_tx.send(LoopEvent::Malformed { id, err });
                    break;
                }
            },
            Err(_) => break,
        }
    }

    // Give the writer a moment to flush any final error before tearing
    // the connection down.
    if tokio::time::timeout(Duration::from_secs(1), &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::{AcceptAll, RequiredFields};
    use std::fs;
    use tempfile::TempDir;

    const CHUNK: u32 = 4;

    fn test_config(dir: &TempDir) -> ServerConfig {
        ServerConfig {
            staging_dir: dir.path().join("staging"),
            destination_dir: dir.path().join("incoming"),
            authorized_keys_dir: dir.path().join("keys"),
            chunk_size: CHUNK,
            max_queue: 3,
            credit_budget: 6,
            credit_low_watermark: 6,
            topup_threshold: 3,
            probe_idle_secs: 30,
            probe_limit: 2,
            idle_abort_secs: 300,
            status_log_secs: 3600,
            ..ServerConfig::default()
        }
    }

    fn engine(dir: &TempDir) -> Engine<AcceptAll> {
        let config = test_config(dir);
        let storage = Storage::open(&config.staging_dir, &config.destination_dir).unwrap();
        Engine::new(config, storage, AcceptAll, Instant::now())
    }

    fn id(n: u8) -> ClientId {
        ClientId([n; 16])
    }

    fn post_file(name: &str) -> ClientMessage {
        ClientMessage::PostFile {
            flags: 0,
            filename: name.into(),
            meta: r#"{"project":"alpha"}"#.into(),
        }
    }

    fn chunk(seek: u64, data: &'static [u8]) -> ClientMessage {
        ClientMessage::PostChunk {
            flags: 0,
            seek,
            data: Bytes::from_static(data),
            checksum: None,
        }
    }

    fn last_chunk(seek: u64, data: &'static [u8], whole_file: &[u8]) -> ClientMessage {
        let mut sum = [0u8; 32];
        sum.copy_from_slice(&Sha256::digest(whole_file));
        ClientMessage::PostChunk {
            flags: crate::messages::FLAG_LAST_CHUNK,
            seek,
            data: Bytes::from_static(data),
            checksum: Some(sum),
        }
    }

    fn approved_credit(out: &Outbox) -> u32 {
        match &out[0].1 {
            ServerMessage::UploadApproved { credit, .. } => *credit,
            other => panic!("expected upload-approved, got {other:?}"),
        }
    }

    #[test]
    fn test_happy_path_three_chunks() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let now = Instant::now();

        let out = eng.handle_message(id(1), post_file("hello.bin"), now);
        assert_eq!(out.len(), 1);
        match &out[0].1 {
            ServerMessage::UploadApproved {
                credit,
                chunksize,
                maxqueue,
            } => {
                assert_eq!((*credit, *chunksize, *maxqueue), (3, 4, 3));
            }
            other => panic!("expected upload-approved, got {other:?}"),
        }

        // Ordinary chunk writes produce at most benign credit top-ups.
        let out = eng.handle_message(id(1), chunk(0, b"hell"), now);
        assert!(out
            .iter()
            .all(|(_, m)| matches!(m, ServerMessage::TransferCredit { .. })));
        let out = eng.handle_message(id(1), chunk(4, b"owor"), now);
        assert!(out
            .iter()
            .all(|(_, m)| matches!(m, ServerMessage::TransferCredit { .. })));
        let out = eng.handle_message(id(1), last_chunk(8, b"ld", b"helloworld"), now);
        assert_eq!(out.len(), 1);
        let upload_id = match &out[0].1 {
            ServerMessage::UploadFinished { upload_id } => upload_id.clone(),
            other => panic!("expected upload-finished, got {other:?}"),
        };
        assert!(!upload_id.is_empty());
        assert_eq!(eng.active_uploads(), 0);

        let dest = dir.path().join("incoming").join("hello.bin");
        assert_eq!(fs::read(&dest).unwrap(), b"helloworld");
        assert_eq!(
            fs::read_to_string(dir.path().join("incoming").join("hello.bin.meta")).unwrap(),
            r#"{"project":"alpha"}"#
        );
        let sum = fs::read_to_string(dir.path().join("incoming").join("hello.bin.sha256")).unwrap();
        assert_eq!(sum.trim(), hex::encode(Sha256::digest(b"helloworld")));
        // Staging is empty again.
        assert_eq!(fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    #[test]
    fn test_zero_byte_upload() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let now = Instant::now();

        eng.handle_message(id(1), post_file("empty.bin"), now);
        let out = eng.handle_message(id(1), last_chunk(0, b"", b""), now);
        assert!(matches!(&out[0].1, ServerMessage::UploadFinished { .. }));

        let dest = dir.path().join("incoming").join("empty.bin");
        assert_eq!(fs::read(&dest).unwrap(), b"");
    }

    #[test]
    fn test_duplicate_chunk_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let now = Instant::now();

        eng.handle_message(id(1), post_file("dup.bin"), now);
        eng.handle_message(id(1), chunk(0, b"aaaa"), now);
        // Same chunk again: silently discarded, no messages, offset kept.
        let out = eng.handle_message(id(1), chunk(0, b"aaaa"), now);
        assert!(out.is_empty());

        let out = eng.handle_message(id(1), ClientMessage::QueryStatus, now);
        assert!(matches!(
            &out[0].1,
            ServerMessage::StatusReport { seek: 4, .. }
        ));

        let out = eng.handle_message(id(1), last_chunk(4, b"bb", b"aaaabb"), now);
        assert!(matches!(&out[0].1, ServerMessage::UploadFinished { .. }));
        assert_eq!(
            fs::read(dir.path().join("incoming").join("dup.bin")).unwrap(),
            b"aaaabb"
        );
    }

    #[test]
    fn test_out_of_order_chunk_gets_status_report() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let now = Instant::now();

        eng.handle_message(id(1), post_file("ooo.bin"), now);
        let out = eng.handle_message(id(1), chunk(8, b"late"), now);
        assert!(matches!(
            &out[0].1,
            ServerMessage::StatusReport { seek: 0, .. }
        ));
        // Nothing was written.
        let out = eng.handle_message(id(1), ClientMessage::QueryStatus, now);
        assert!(matches!(
            &out[0].1,
            ServerMessage::StatusReport { seek: 0, .. }
        ));
    }

    #[test]
    fn test_oversized_chunk_aborts() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let now = Instant::now();

        eng.handle_message(id(1), post_file("big.bin"), now);
        let out = eng.handle_message(id(1), chunk(0, b"toolarge"), now);
        assert!(matches!(
            &out[0].1,
            ServerMessage::Error { code: 413, .. }
        ));
        assert_eq!(eng.active_uploads(), 0);
        assert_eq!(fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    #[test]
    fn test_checksum_mismatch_removes_staging() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let now = Instant::now();

        eng.handle_message(id(1), post_file("bad.bin"), now);
        eng.handle_message(id(1), chunk(0, b"aaaa"), now);
        // Trailer computed over different bytes.
        let out = eng.handle_message(id(1), last_chunk(4, b"bb", b"corrupted!"), now);
        assert!(matches!(
            &out[0].1,
            ServerMessage::Error { code: 422, msg } if msg == "checksum-mismatch"
        ));
        assert!(!dir.path().join("incoming").join("bad.bin").exists());
        assert!(!dir.path().join("incoming").join("bad.bin.meta").exists());
        assert_eq!(fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    #[test]
    fn test_metadata_rejection() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let storage = Storage::open(&config.staging_dir, &config.destination_dir).unwrap();
        let validator = RequiredFields::new(vec!["project".into()]);
        let mut eng = Engine::new(config, storage, validator, Instant::now());
        let now = Instant::now();

        let out = eng.handle_message(
            id(1),
            ClientMessage::PostFile {
                flags: 0,
                filename: "nometa.bin".into(),
                meta: r#"{"sample":"S1"}"#.into(),
            },
            now,
        );
        assert!(matches!(
            &out[0].1,
            ServerMessage::Error { code: 403, msg } if msg.contains("project")
        ));
        // No session, no staging file.
        assert_eq!(eng.active_uploads(), 0);
        assert_eq!(fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    #[test]
    fn test_invalid_metadata_json() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let out = eng.handle_message(
            id(1),
            ClientMessage::PostFile {
                flags: 0,
                filename: "x.bin".into(),
                meta: "not json".into(),
            },
            Instant::now(),
        );
        assert!(matches!(&out[0].1, ServerMessage::Error { code: 400, .. }));
    }

    #[test]
    fn test_bad_filename_rejected() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let now = Instant::now();
        for name in ["", "a/b", "..evil"] {
            let out = eng.handle_message(
                id(1),
                ClientMessage::PostFile {
                    flags: 0,
                    filename: name.into(),
                    meta: "{}".into(),
                },
                now,
            );
            assert!(
                matches!(&out[0].1, ServerMessage::Error { code: 400, .. }),
                "filename {name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_duplicate_post_file_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let now = Instant::now();

        eng.handle_message(id(1), post_file("same.bin"), now);
        eng.handle_message(id(1), chunk(0, b"aaaa"), now);

        // Identical re-announcement: current parameters plus a status
        // report, and the write offset is untouched.
        let out = eng.handle_message(id(1), post_file("same.bin"), now);
        assert_eq!(out.len(), 2);
        match (&out[0].1, &out[1].1) {
            (
                ServerMessage::UploadApproved {
                    chunksize, maxqueue, ..
                },
                ServerMessage::StatusReport { seek, .. },
            ) => {
                assert_eq!((*chunksize, *maxqueue), (4, 3));
                assert_eq!(*seek, 4);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(eng.active_uploads(), 1);
    }

    #[test]
    fn test_conflicting_post_file_aborts_upload() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let now = Instant::now();

        eng.handle_message(id(1), post_file("first.bin"), now);
        eng.handle_message(id(1), chunk(0, b"aaaa"), now);

        let out = eng.handle_message(id(1), post_file("second.bin"), now);
        assert!(matches!(&out[0].1, ServerMessage::Error { code: 409, .. }));
        assert_eq!(eng.active_uploads(), 0);
        assert_eq!(fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
        // The identity is free again for a fresh announcement.
        let out = eng.handle_message(id(1), post_file("third.bin"), now);
        assert!(matches!(&out[0].1, ServerMessage::UploadApproved { .. }));
    }

    #[test]
    fn test_unknown_connection_chunk() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let out = eng.handle_message(id(9), chunk(0, b"aaaa"), Instant::now());
        assert!(matches!(&out[0].1, ServerMessage::Error { code: 400, .. }));
    }

    #[test]
    fn test_resumption_after_reconnect() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let now = Instant::now();

        eng.handle_message(id(1), post_file("resume.bin"), now);
        eng.handle_message(id(1), chunk(0, b"hell"), now);
        eng.handle_message(id(1), chunk(4, b"owor"), now);

        // Transport dropped and came back: the session survives, and the
        // status query is answered with the persisted position.
        let out = eng.handle_message(id(1), ClientMessage::QueryStatus, now);
        match &out[0].1 {
            ServerMessage::StatusReport { seek, credit } => {
                assert_eq!(*seek, 8);
                assert!(*credit <= 3);
            }
            other => panic!("expected status-report, got {other:?}"),
        }

        let out = eng.handle_message(id(1), last_chunk(8, b"ld", b"helloworld"), now);
        assert!(matches!(&out[0].1, ServerMessage::UploadFinished { .. }));
        assert_eq!(
            fs::read(dir.path().join("incoming").join("resume.bin")).unwrap(),
            b"helloworld"
        );
    }

    #[test]
    fn test_client_error_aborts_silently() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let now = Instant::now();

        eng.handle_message(id(1), post_file("gone.bin"), now);
        eng.handle_message(id(1), chunk(0, b"aaaa"), now);
        let out = eng.handle_message(
            id(1),
            ClientMessage::Error {
                code: 499,
                msg: "client-cancelled".into(),
            },
            now,
        );
        assert!(out.is_empty());
        assert_eq!(eng.active_uploads(), 0);
        assert_eq!(fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    #[test]
    fn test_malformed_message_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let now = Instant::now();

        eng.handle_message(id(1), post_file("mal.bin"), now);
        let out = eng.handle_malformed(id(1), &UploadError::Protocol("bad frame".into()));
        assert!(matches!(&out[0].1, ServerMessage::Error { code: 400, .. }));
        assert_eq!(eng.active_uploads(), 0);
    }

    #[test]
    fn test_credit_exhaustion_and_topup() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let now = Instant::now();

        // Budget 6, maxqueue 3: two uploads drain the budget.
        let out = eng.handle_message(id(1), post_file("a.bin"), now);
        assert_eq!(approved_credit(&out), 3);
        let out = eng.handle_message(id(2), post_file("b.bin"), now);
        assert_eq!(approved_credit(&out), 3);
        // Third upload is approved but quiescent.
        let out = eng.handle_message(id(3), post_file("c.bin"), now);
        assert_eq!(approved_credit(&out), 0);

        // id(1) writes a chunk: budget frees up and the starved upload
        // gets credit on the next distribution pass.
        let out = eng.handle_message(id(1), chunk(0, b"aaaa"), now);
        let granted: Vec<_> = out
            .iter()
            .filter_map(|(to, msg)| match msg {
                ServerMessage::TransferCredit { amount } => Some((*to, *amount)),
                _ => None,
            })
            .collect();
        assert_eq!(granted, vec![(id(3), 1)]);
    }

    #[test]
    fn test_idle_probe_then_abort() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let t0 = Instant::now();

        eng.handle_message(id(1), post_file("idle.bin"), t0);

        // Before the probe window: nothing happens.
        assert!(eng.tick(t0 + Duration::from_secs(1)).is_empty());

        // First probe reclaims the grant and reports credit 0.
        let out = eng.tick(t0 + Duration::from_secs(31));
        assert!(matches!(
            &out[0].1,
            ServerMessage::StatusReport { seek: 0, credit: 0 }
        ));

        // Second probe.
        let out = eng.tick(t0 + Duration::from_secs(62));
        assert!(out
            .iter()
            .any(|(_, m)| matches!(m, ServerMessage::StatusReport { .. })));

        // Probe limit reached: the upload is cancelled with a timeout.
        let out = eng.tick(t0 + Duration::from_secs(93));
        assert!(out
            .iter()
            .any(|(_, m)| matches!(m, ServerMessage::Error { code: 408, .. })));
        assert_eq!(eng.active_uploads(), 0);
    }

    #[test]
    fn test_probe_counter_resets_on_activity() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let t0 = Instant::now();

        eng.handle_message(id(1), post_file("live.bin"), t0);
        eng.tick(t0 + Duration::from_secs(31));
        // The client answers the probe.
        eng.handle_message(
            id(1),
            ClientMessage::QueryStatus,
            t0 + Duration::from_secs(32),
        );

        // Probe accounting starts over; no abort at the old schedule.
        let out = eng.tick(t0 + Duration::from_secs(40));
        assert!(!out
            .iter()
            .any(|(_, m)| matches!(m, ServerMessage::Error { .. })));
        assert_eq!(eng.active_uploads(), 1);
    }

    #[test]
    fn test_hard_idle_abort() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let t0 = Instant::now();

        eng.handle_message(id(1), post_file("dead.bin"), t0);
        let out = eng.tick(t0 + Duration::from_secs(301));
        assert!(out
            .iter()
            .any(|(_, m)| matches!(m, ServerMessage::Error { code: 408, .. })));
        assert_eq!(eng.active_uploads(), 0);
    }

    #[test]
    fn test_shutdown_cancels_uploads() {
        let dir = TempDir::new().unwrap();
        let mut eng = engine(&dir);
        let now = Instant::now();

        eng.handle_message(id(1), post_file("a.bin"), now);
        eng.handle_message(id(2), post_file("b.bin"), now);

        let out = eng.shutdown();
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .all(|(_, m)| matches!(m, ServerMessage::Error { code: 503, .. })));
        assert_eq!(eng.active_uploads(), 0);
        assert_eq!(fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    // The two state machines, wired back to back without a transport.
    mod end_to_end {
        use super::*;
        use crate::client::{UploadMachine, UploadState};
        use std::io::Cursor;

        fn drive(
            eng: &mut Engine<AcceptAll>,
            machine: &mut UploadMachine<Cursor<Vec<u8>>>,
            cid: ClientId,
        ) {
            let now = Instant::now();
            let mut to_server: Vec<ClientMessage> = machine.start();
            let mut rounds = 0;
            while !matches!(machine.state(), UploadState::Done | UploadState::Failed) {
                rounds += 1;
                assert!(rounds < 100, "machines stopped making progress");
                let mut to_client = Vec::new();
                for msg in to_server.drain(..) {
                    to_client.extend(eng.handle_message(cid, msg, now));
                }
                if to_client.is_empty() {
                    break;
                }
                for (_, msg) in to_client {
                    to_server.extend(machine.on_message(msg));
                }
            }
        }

        #[test]
        fn test_full_upload_roundtrip() {
            let dir = TempDir::new().unwrap();
            let mut eng = engine(&dir);
            let payload: Vec<u8> = (0u8..=255).cycle().take(50).collect();
            let mut machine = UploadMachine::new(
                "e2e.bin".into(),
                r#"{"project":"alpha"}"#.into(),
                Cursor::new(payload.clone()),
                3,
            );

            drive(&mut eng, &mut machine, id(1));

            assert_eq!(machine.state(), UploadState::Done);
            assert!(machine.upload_id().is_some());
            let written = fs::read(dir.path().join("incoming").join("e2e.bin")).unwrap();
            assert_eq!(written, payload);
            let sum =
                fs::read_to_string(dir.path().join("incoming").join("e2e.bin.sha256")).unwrap();
            assert_eq!(sum.trim(), hex::encode(Sha256::digest(&payload)));
        }

        #[test]
        fn test_roundtrip_with_limited_credit() {
            let dir = TempDir::new().unwrap();
            let config = ServerConfig {
                credit_budget: 1,
                credit_low_watermark: 1,
                topup_threshold: 1,
                ..test_config(&dir)
            };
            let storage = Storage::open(&config.staging_dir, &config.destination_dir).unwrap();
            let mut eng = Engine::new(config, storage, AcceptAll, Instant::now());

            let payload = b"0123456789ABCDEF".to_vec();
            let mut machine = UploadMachine::new(
                "slow.bin".into(),
                "{}".into(),
                Cursor::new(payload.clone()),
                3,
            );

            drive(&mut eng, &mut machine, id(1));

            assert_eq!(machine.state(), UploadState::Done);
            let written = fs::read(dir.path().join("incoming").join("slow.bin")).unwrap();
            assert_eq!(written, payload);
        }

        #[test]
        fn test_roundtrip_zero_byte_file() {
            let dir = TempDir::new().unwrap();
            let mut eng = engine(&dir);
            let mut machine =
                UploadMachine::new("nil.bin".into(), "{}".into(), Cursor::new(Vec::new()), 3);

            drive(&mut eng, &mut machine, id(1));

            assert_eq!(machine.state(), UploadState::Done);
            assert_eq!(
                fs::read(dir.path().join("incoming").join("nil.bin")).unwrap(),
                b""
            );
        }

        #[test]
        fn test_roundtrip_checksum_mismatch() {
            let dir = TempDir::new().unwrap();
            let mut eng = engine(&dir);
            let now = Instant::now();

            // Hand-roll a client that lies about the checksum.
            eng.handle_message(id(1), post_file("liar.bin"), now);
            let out = eng.handle_message(id(1), last_chunk(0, b"data", b"other"), now);
            assert!(matches!(
                &out[0].1,
                ServerMessage::Error { code: 422, .. }
            ));
            assert!(!dir.path().join("incoming").join("liar.bin").exists());
        }
    }
}
