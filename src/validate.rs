//! Pluggable metadata validation.
//!
//! The upload engine treats metadata as an opaque JSON object; admission
//! policy lives behind [`MetadataValidator`]. A rejection is either
//! transient (the client may retry later) or permanent (fatal to the
//! upload, reported with a wire error code).

use crate::error::ErrorCode;
use serde_json::Value;

/// Outcome of validating an upload announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Ok,
    /// Retryable; the message is sent to the client as a retry hint.
    Transient(String),
    /// Fatal; `(code, msg)` goes on the wire verbatim.
    Permanent { code: u32, msg: String },
}

/// Decides whether an announced upload is admitted.
pub trait MetadataValidator: Send {
    fn validate(&self, filename: &str, meta: &Value) -> Validation;
}

/// Admits everything; useful for tests and open drop directories.
#[derive(Debug, Default)]
pub struct AcceptAll;

impl MetadataValidator for AcceptAll {
    fn validate(&self, _filename: &str, _meta: &Value) -> Validation {
        Validation::Ok
    }
}

/// Requires a fixed set of top-level metadata fields to be present.
#[derive(Debug)]
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

impl MetadataValidator for RequiredFields {
    fn validate(&self, _filename: &str, meta: &Value) -> Validation {
        let Some(object) = meta.as_object() else {
            return Validation::Permanent {
                code: ErrorCode::MetadataRejected.code(),
                msg: "metadata must be a JSON object".to_string(),
            };
        };
        for field in &self.fields {
            if !object.contains_key(field) {
                return Validation::Permanent {
                    code: ErrorCode::MetadataRejected.code(),
                    msg: format!("missing required metadata field: {field}"),
                };
            }
        }
        Validation::Ok
    }
}
