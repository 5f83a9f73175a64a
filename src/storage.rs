//! On-disk storage for incoming uploads.
//!
//! Every accepted upload writes into a staging file named after its upload
//! id; nothing under the staging root is ever considered delivered. On
//! commit the staged file is promoted into the destination directory with
//! an atomic rename, together with two sidecars: `<name>.meta` holding the
//! accepted metadata JSON verbatim and `<name>.sha256` holding the hex
//! digest on a single line. Aborting removes the staging file and no final
//! file appears.

use crate::config::MAX_FILENAME_BYTES;
use crate::error::UploadError;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Checks the server-side filename constraints.
///
/// Accepted names are non-empty, at most 256 UTF-8 bytes, free of path
/// separators and NUL, and do not start with `..`.
pub fn validate_filename(name: &str) -> Result<(), UploadError> {
    if name.is_empty() {
        return Err(UploadError::InvalidFilename("empty filename".into()));
    }
    if name.len() > MAX_FILENAME_BYTES {
        return Err(UploadError::InvalidFilename(format!(
            "filename exceeds {MAX_FILENAME_BYTES} bytes"
        )));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(UploadError::InvalidFilename(
            "filename must not contain path separators".into(),
        ));
    }
    if name.contains('\0') {
        return Err(UploadError::InvalidFilename(
            "filename must not contain NUL".into(),
        ));
    }
    if name.starts_with("..") {
        return Err(UploadError::InvalidFilename(
            "filename must not start with '..'".into(),
        ));
    }
    Ok(())
}

/// Root of the staging and destination directories.
#[derive(Debug)]
pub struct Storage {
    staging_root: PathBuf,
    destination: PathBuf,
    /// Destinations of in-flight uploads, so two uploads cannot race for
    /// the same final name.
    claimed: HashSet<PathBuf>,
}

impl Storage {
    /// Opens (and creates if needed) the staging and destination roots.
    pub fn open(staging_root: &Path, destination: &Path) -> Result<Self, UploadError> {
        fs::create_dir_all(staging_root)?;
        fs::create_dir_all(destination)?;
        info!(
            staging = %staging_root.display(),
            destination = %destination.display(),
            "storage initialized"
        );
        Ok(Self {
            staging_root: staging_root.to_path_buf(),
            destination: destination.to_path_buf(),
            claimed: HashSet::new(),
        })
    }

    /// Opens a staging file for a freshly approved upload.
    ///
    /// Refuses names that violate the filename rules, collide with an
    /// existing destination file, or collide with another in-flight
    /// upload.
    pub fn open_staging(
        &mut self,
        upload_id: &str,
        filename: &str,
        meta: &str,
    ) -> Result<StagedUpload, UploadError> {
        validate_filename(filename)?;

        let dest_path = self.destination.join(filename);
        if self.claimed.contains(&dest_path) {
            return Err(UploadError::Remote {
                code: 409,
                msg: format!("file is being uploaded already: {filename}"),
            });
        }
        if dest_path.exists() {
            return Err(UploadError::Remote {
                code: 409,
                msg: format!("file exists on server: {filename}"),
            });
        }

        let staging_path = self.staging_root.join(upload_id);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&staging_path)?;
        debug!(upload_id, staging = %staging_path.display(), "staging file opened");

        self.claimed.insert(dest_path.clone());
        Ok(StagedUpload {
            file,
            staging_path,
            dest_path,
            meta: meta.to_string(),
        })
    }

    /// Releases the destination claim of a finished or aborted upload.
    pub fn release(&mut self, staged_dest: &Path) {
        self.claimed.remove(staged_dest);
    }

    /// Number of destinations currently claimed by in-flight uploads.
    pub fn num_active(&self) -> usize {
        self.claimed.len()
    }
}

/// A partial upload in the staging directory.
#[derive(Debug)]
pub struct StagedUpload {
    file: File,
    staging_path: PathBuf,
    dest_path: PathBuf,
    meta: String,
}

impl StagedUpload {
    /// Writes `data` at the given byte offset.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), UploadError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Final location this upload will be promoted to.
    pub fn dest_path(&self) -> &Path {
        &self.dest_path
    }

    /// Promotes the staged file to its destination.
    ///
    /// The metadata and checksum sidecars are written first; if the rename
    /// itself fails they are removed again so a destination file and its
    /// sidecars only ever appear together.
    pub fn finalize(mut self, checksum_hex: &str) -> Result<PathBuf, UploadError> {
        self.file.flush()?;
        self.file.sync_all()?;

        let meta_path = sidecar(&self.dest_path, "meta");
        let sum_path = sidecar(&self.dest_path, "sha256");
        fs::write(&meta_path, self.meta.as_bytes())?;
        fs::write(&sum_path, format!("{checksum_hex}\n"))?;

        if let Err(e) = fs::rename(&self.staging_path, &self.dest_path) {
            let _ = fs::remove_file(&meta_path);
            let _ = fs::remove_file(&sum_path);
            let _ = fs::remove_file(&self.staging_path);
            return Err(e.into());
        }
        info!(destination = %self.dest_path.display(), "upload promoted");
        Ok(self.dest_path)
    }

    /// Removes the staging file; the upload never becomes visible.
    pub fn abort(self) {
        if let Err(e) = fs::remove_file(&self.staging_path) {
            warn!(
                staging = %self.staging_path.display(),
                error = %e,
                "failed to remove staging file"
            );
        }
    }
}

fn sidecar(dest: &Path, extension: &str) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(extension);
    dest.with_file_name(name)
}
