//! Best-effort on-disk diagnostics under `.sidechat/`.
//!
//! Write failures are ignored throughout: diagnostics must never take down
//! a stream that is otherwise healthy.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

const DIAG_DIR: &str = ".sidechat";

/// Set to any value to record dropped stream frames.
pub const DEBUG_ENV: &str = "SIDECHAT_DEBUG";

fn diag_dir() -> PathBuf {
    let dir = PathBuf::from(DIAG_DIR);
    let _ = fs::create_dir_all(&dir);
    dir
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn append(file: &str, entry: &str) {
    let path = diag_dir().join(file);
    let _ = OpenOptions::new().create(true).append(true).open(path).and_then(|mut f| {
        f.write_all(entry.as_bytes())
    });
}

/// Append a terminal failure to the error log.
pub fn log_error(msg: &str) {
    append("errors.log", &format!("[{}] {}\n", now_secs(), msg));
}

/// Dump the last request body to disk, overwritten each call.
/// Credentials travel in a header config file, never in the body, so the
/// dump is safe to keep around.
pub fn dump_request(body: &[u8]) {
    let pretty = serde_json::from_slice::<serde_json::Value>(body)
        .and_then(|v| serde_json::to_vec_pretty(&v))
        .unwrap_or_else(|_| body.to_vec());
    let _ = fs::write(diag_dir().join("last_request.json"), pretty);
}

/// Record a stream line that failed to decode. Only active when the
/// `SIDECHAT_DEBUG` environment variable is set.
pub fn log_dropped_frame(line: &str) {
    if std::env::var_os(DEBUG_ENV).is_none() {
        return;
    }
    append("dropped_frames.log", &format!("[{}] {}\n", now_secs(), line));
}
