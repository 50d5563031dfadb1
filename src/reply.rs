//! Typed command outcomes.
//!
//! A reply that decodes but reports failure is data, not an exception:
//! callers receive the counts and per-item errors so partial success can
//! be inspected.

use serde::Deserialize;

/// Per-document failure inside a write command reply.
#[derive(Debug, Clone, Deserialize)]
pub struct WriteError {
    pub index: i32,
    pub code: i32,
    pub errmsg: String,
}

/// Outcome of a write command (insert, update, delete).
#[derive(Debug, Clone, Deserialize)]
pub struct WriteReply {
    #[serde(default)]
    pub ok: f64,
    /// Number of documents the server applied the write to.
    #[serde(default)]
    pub n: i64,
    #[serde(default, rename = "writeErrors")]
    pub write_errors: Vec<WriteError>,
    #[serde(default)]
    pub errmsg: Option<String>,
    #[serde(default)]
    pub code: Option<i32>,
}

impl WriteReply {
    /// Whether the server reported complete success.
    pub fn is_ok(&self) -> bool {
        self.ok == 1.0 && self.write_errors.is_empty()
    }
}
