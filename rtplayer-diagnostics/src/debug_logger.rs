//! Process-wide file logging
//!
//! [`enable_file_logging`] opens `<dir>/rtplayer-<timestamp>/rtplayer.log`
//! and routes `tracing` events into it. The subscriber is installed once per
//! process; enabling again while a file is open returns the open file, and
//! [`disable_file_logging`] closes it so a later enable starts a new one.
//!
//! Applications that install their own subscriber can add [`file_layer`] to
//! it instead; the layer writes to whatever file is currently open.

use parking_lot::Mutex;
use rtplayer_core::{PlayerError, PlayerResult};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Once;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Name of the log file inside the session directory
pub const LOG_FILE_NAME: &str = "rtplayer.log";

#[derive(Debug)]
struct OpenLog {
    file: File,
    path: PathBuf,
}

static LOG: Mutex<Option<OpenLog>> = parking_lot::const_mutex(None);
static INSTALL: Once = Once::new();

/// Writer handed to the fmt layer; drops output while no file is open
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFileWriter;

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match LOG.lock().as_mut() {
            Some(log) => log.file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match LOG.lock().as_mut() {
            Some(log) => log.file.flush(),
            None => Ok(()),
        }
    }
}

/// Default parent directory for log sessions
pub fn default_log_dir() -> PathBuf {
    std::env::temp_dir().join("rtplayer-logs")
}

/// Formatting layer that writes to the currently open log file
pub fn file_layer<S>() -> impl Layer<S> + Send + Sync
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_ansi(false)
        .with_thread_ids(true)
        .with_target(true)
        .with_writer(|| LogFileWriter)
}

/// Start logging to a new file under the default directory
pub fn enable_file_logging() -> PlayerResult<PathBuf> {
    enable_file_logging_in(default_log_dir())
}

/// Start logging to a new file under `dir`
///
/// Returns the path of the log file. If logging is already enabled the
/// existing path is returned and nothing changes.
pub fn enable_file_logging_in(dir: impl AsRef<Path>) -> PlayerResult<PathBuf> {
    let mut log = LOG.lock();
    if let Some(open) = log.as_ref() {
        return Ok(open.path.clone());
    }

    let session_dir = dir.as_ref().join(format!(
        "rtplayer-{}",
        chrono::Local::now().format("%Y%m%d-%H%M%S%.3f")
    ));
    fs::create_dir_all(&session_dir).map_err(|e| PlayerError::Initialization {
        reason: format!("cannot create log directory {}: {}", session_dir.display(), e),
    })?;

    let path = session_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| PlayerError::Initialization {
            reason: format!("cannot open log file {}: {}", path.display(), e),
        })?;
    *log = Some(OpenLog {
        file,
        path: path.clone(),
    });
    drop(log);

    install_subscriber();
    info!("File logging enabled at {}", path.display());
    Ok(path)
}

/// Close the log file; events are discarded until logging is enabled again
pub fn disable_file_logging() {
    let closed = LOG.lock().take();
    if let Some(mut log) = closed {
        let _ = log.file.flush();
        debug!("File logging to {} closed", log.path.display());
    }
}

/// Path of the open log file, if any
pub fn log_file_path() -> Option<PathBuf> {
    LOG.lock().as_ref().map(|log| log.path.clone())
}

fn install_subscriber() {
    INSTALL.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let installed = tracing_subscriber::registry()
            .with(file_layer::<tracing_subscriber::Registry>().with_filter(filter))
            .try_init();
        if installed.is_err() {
            // another global subscriber owns the process; it must add file_layer() itself
            debug!("Global subscriber already set, file layer not installed");
        }
    });
}
