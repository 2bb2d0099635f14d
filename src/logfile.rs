//! Run-scoped text log: a plain append-only file operators read after a run.
//!
//! The file is truncated on the first write of each process run and appended
//! to afterwards. Strictly a side channel: never used for control flow, and
//! write failures only produce a log line.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::error;

pub struct RunLog {
    path: PathBuf,
    started: AtomicBool,
    // serializes appends so interleaved worker messages stay line-atomic
    write_guard: Mutex<()>,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            started: AtomicBool::new(false),
            write_guard: Mutex::new(()),
        }
    }

    pub fn append_line(&self, message: &str) {
        let _guard = self.write_guard.lock();
        let truncate = !self.started.swap(true, Ordering::SeqCst);
        let result = OpenOptions::new()
            .create(true)
            .append(!truncate)
            .write(true)
            .truncate(truncate)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{message}"));
        if let Err(e) = result {
            error!(path = %self.path.display(), error = %e, "failed writing run log");
        }
    }
}
