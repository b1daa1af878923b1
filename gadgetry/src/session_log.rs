//! Optional request/response file logging.
//!
//! Purely observational: write failures are logged and never affect
//! execution. Files are named `NNNN.request` / `NNNN.response` with a
//! zero-padded monotonic counter per session; the response written after
//! a request shares its number.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use tracing::warn;

use crate::transport::LlmRequest;

/// Writes numbered request/response files into a directory.
#[derive(Debug)]
pub struct SessionLog {
    dir: PathBuf,
    counter: AtomicU64,
}

impl SessionLog {
    /// Create a log writing into `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            counter: AtomicU64::new(0),
        })
    }

    /// Write the next `NNNN.request` file.
    pub fn write_request(&self, request: &LlmRequest) {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let body = json!({
            "model": request.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "messages": request.messages,
        });
        let path = self.dir.join(format!("{n:04}.request"));
        let pretty = serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string());
        if let Err(e) = std::fs::write(&path, pretty) {
            warn!(path = %path.display(), error = %e, "failed to write request log");
        }
    }

    /// Write the `NNNN.response` file paired with the last request.
    pub fn write_response(&self, response: &str) {
        let n = self.counter.load(Ordering::SeqCst).max(1);
        let path = self.dir.join(format!("{n:04}.response"));
        if let Err(e) = std::fs::write(&path, response) {
            warn!(path = %path.display(), error = %e, "failed to write response log");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn writes_numbered_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path()).unwrap();

        let request = LlmRequest::new("m", vec![Message::user("hi")]);
        log.write_request(&request);
        log.write_response("hello");
        log.write_request(&request);
        log.write_response("again");

        assert!(dir.path().join("0001.request").exists());
        assert!(dir.path().join("0001.response").exists());
        assert!(dir.path().join("0002.request").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("0002.response")).unwrap(),
            "again"
        );

        let req = std::fs::read_to_string(dir.path().join("0001.request")).unwrap();
        assert!(req.contains("\"model\""));
        assert!(req.contains("hi"));
    }
}
