//! Authorization store for the transport handshake.
//!
//! The server keeps a directory of approved client key files. Each file is
//! named `<key-id>.key` and holds the client's 32-byte pre-shared secret
//! as 64 hex characters. A client presents its key id during the
//! handshake; an unknown id is rejected before any protocol message is
//! seen. The client keeps a single key file of the form
//! `<key-id>:<hex-secret>`.

use crate::error::UploadError;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Length of a pre-shared secret in bytes.
pub const SECRET_LEN: usize = 32;

fn parse_secret(hex_str: &str) -> Result<[u8; SECRET_LEN], UploadError> {
    let raw = hex::decode(hex_str.trim())
        .map_err(|e| UploadError::Config(format!("invalid key hex: {e}")))?;
    let secret: [u8; SECRET_LEN] = raw
        .try_into()
        .map_err(|_| UploadError::Config("key must be 32 bytes (64 hex chars)".into()))?;
    Ok(secret)
}

/// The client's identity and pre-shared secret.
#[derive(Clone)]
pub struct ClientKey {
    pub id: String,
    pub secret: [u8; SECRET_LEN],
}

impl ClientKey {
    /// Loads a key file of the form `<key-id>:<hex-secret>`.
    pub fn load(path: &Path) -> Result<Self, UploadError> {
        let content = fs::read_to_string(path)?;
        let (id, hex_secret) = content
            .trim()
            .split_once(':')
            .ok_or_else(|| UploadError::Config("key file must be '<key-id>:<hex-secret>'".into()))?;
        if id.is_empty() {
            return Err(UploadError::Config("key id must not be empty".into()));
        }
        Ok(Self {
            id: id.to_string(),
            secret: parse_secret(hex_secret)?,
        })
    }

    /// Creates a fresh key under the given id.
    pub fn generate(id: &str) -> Result<Self, UploadError> {
        Ok(Self {
            id: id.to_string(),
            secret: crate::crypto::generate_secret()?,
        })
    }

    /// Writes the key file in the client format.
    pub fn save(&self, path: &Path) -> Result<(), UploadError> {
        fs::write(path, format!("{}:{}\n", self.id, hex::encode(self.secret)))?;
        Ok(())
    }
}

impl std::fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("ClientKey").field("id", &self.id).finish()
    }
}

/// Directory-backed store of approved client keys.
#[derive(Debug, Default)]
pub struct KeyStore {
    keys: HashMap<String, [u8; SECRET_LEN]>,
}

impl KeyStore {
    /// Loads every `*.key` file in `dir`; the file stem is the key id.
    pub fn load(dir: &Path) -> Result<Self, UploadError> {
        let mut keys = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("key") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match fs::read_to_string(&path)
                .map_err(UploadError::from)
                .and_then(|content| parse_secret(&content))
            {
                Ok(secret) => {
                    keys.insert(id.to_string(), secret);
                }
                Err(e) => {
                    warn!(key = %path.display(), error = %e, "skipping unreadable key file");
                }
            }
        }
        info!(keys = keys.len(), dir = %dir.display(), "authorization store loaded");
        Ok(Self { keys })
    }

    /// Secret for the given key id, if approved.
    pub fn lookup(&self, id: &str) -> Option<[u8; SECRET_LEN]> {
        self.keys.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
