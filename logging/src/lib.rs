//! Ambient logging plumbing. Every engine-loop thread, backend worker, and
//! job-exec supervisor process logs through the `log` facade; this crate
//! decides *where* those lines go.
//!
//! Lines are routed per-thread (and per-task, for tokio tasks) to a
//! [`Destination`]: either the process's own stderr (used by the CLI before
//! a Req opens its audit channel) or a Req's output file under
//! `outputs/<iso-timestamp>/`. This is what lets two concurrent Reqs log
//! without interleaving each other's lines (§4.H point 2, §5 ordering
//! guarantees).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

#[derive(Clone)]
pub enum Destination {
    /// Not yet attributed to a Req: goes to the process's stderr.
    Stderr,
    /// Attributed to a specific Req's output file.
    File(Arc<Mutex<std::fs::File>>),
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Stderr => write!(f, "Destination::Stderr"),
            Destination::File(_) => write!(f, "Destination::File(..)"),
        }
    }
}

impl Destination {
    pub fn to_file(path: &Path) -> Result<Destination, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("{e}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| format!("failed to open log file {}: {e}", path.display()))?;
        Ok(Destination::File(Arc::new(Mutex::new(file))))
    }

    fn write_line(&self, line: &str) {
        match self {
            Destination::Stderr => {
                eprintln!("{line}");
            }
            Destination::File(file) => {
                let mut file = file.lock();
                let _ = writeln!(file, "{line}");
            }
        }
    }
}

thread_local! {
    static THREAD_DESTINATION: std::cell::RefCell<Destination> = std::cell::RefCell::new(Destination::Stderr);
}

tokio::task_local! {
    static TASK_DESTINATION: Destination;
}

/// Returns the destination for the calling context: the task-local one if
/// we're inside a task that set one, else the thread-local one.
pub fn get_destination() -> Destination {
    TASK_DESTINATION
        .try_with(|d| d.clone())
        .unwrap_or_else(|_| THREAD_DESTINATION.with(|d| d.borrow().clone()))
}

pub fn set_thread_destination(destination: Destination) {
    THREAD_DESTINATION.with(|d| *d.borrow_mut() = destination);
}

pub async fn scope_task_destination<F: std::future::Future>(
    destination: Destination,
    future: F,
) -> F::Output {
    TASK_DESTINATION.scope(destination, future).await
}

pub fn scope_sync_destination<F: FnOnce() -> R, R>(destination: Destination, f: F) -> R {
    let previous = get_destination();
    set_thread_destination(destination);
    let result = f();
    set_thread_destination(previous);
    result
}

struct DestinationLogger {
    level: LevelFilter,
}

impl Log for DestinationLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let destination = get_destination();
        let now = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
        let line = format!(
            "{now} {:<5} {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
        destination.write_line(&line);
    }

    fn flush(&self) {}
}

/// Installs the global `log` backend. Idempotent: a second call is a no-op
/// (mirrors `env_logger::try_init`'s tolerance of repeated test setup).
pub fn init(level: LevelFilter) {
    let logger = Box::new(DestinationLogger { level });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}

pub fn level_from_verbosity(quiet: bool, verbose: bool) -> LevelFilter {
    match (quiet, verbose) {
        (true, _) => LevelFilter::Warn,
        (false, true) => LevelFilter::Debug,
        (false, false) => LevelFilter::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_defaults_to_stderr_on_bare_thread() {
        matches!(get_destination(), Destination::Stderr);
    }

    #[tokio::test]
    async fn task_scoped_destination_does_not_leak_to_caller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("req.log");
        let destination = Destination::to_file(&path).unwrap();
        scope_task_destination(destination, async {
            log::info!("inside scope");
        })
        .await;
        matches!(get_destination(), Destination::Stderr);
    }

    #[test]
    fn verbosity_mapping() {
        assert_eq!(level_from_verbosity(true, false), LevelFilter::Warn);
        assert_eq!(level_from_verbosity(false, true), LevelFilter::Debug);
        assert_eq!(level_from_verbosity(false, false), LevelFilter::Info);
    }
}
