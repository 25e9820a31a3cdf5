// Rotating asynchronous line writer

//! # Rotating Async Writer
//!
//! A background writer for line-oriented sinks such as the JSONL returner.
//! Producers call [`RotatingWriter::write_line`], which only enqueues; a single
//! owner task holds the file and does all I/O.
//!
//! ## Flushing
//!
//! The owner buffers lines in memory and writes them out when either
//! - the buffer exceeds `flush_threshold` bytes, or
//! - `flush_timeout` seconds passed since the last line arrived.
//!
//! ## Rotation
//!
//! Before each write-out the owner rotates to a new file when the current one
//! reached `rotation.size` bytes or its expiration passed. The expiration of a
//! file is fixed when it is opened as the earlier of `now + rotation.interval`
//! and the next tick of `rotation.cron`.
//!
//! ## Back Pressure
//!
//! Bytes accepted but not yet on disk are counted. A line that would push the
//! count past `buffer_size` is refused with `storage_full`. Crossing
//! `buffer_high_watermark` logs one warning and reports
//! [`WriteStatus::HighWatermark`] until the backlog drains.
//!
//! ## File Names
//!
//! `filename` is a template: `{now:<strftime>}`, `{uid}`, `{pid}` and `{tid}`
//! are substituted when a file is opened.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::utils::secs;
use crate::{EdmpError, Result};

/// When to start a new file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationPolicy {
    /// Rotate once the file reaches this many bytes
    pub size: Option<u64>,
    /// Rotate this many seconds after the file was opened
    pub interval: Option<f64>,
    /// Rotate at the next tick of this cron expression (seconds field first)
    pub cron: Option<String>,
}

impl RotationPolicy {
    /// Parsed cron schedule, if any
    pub fn schedule(&self) -> Result<Option<cron::Schedule>> {
        self.cron
            .as_deref()
            .map(|expression| {
                cron::Schedule::from_str(expression).map_err(|e| {
                    EdmpError::InvalidInput(format!("invalid rotation cron '{}': {}", expression, e))
                })
            })
            .transpose()
    }

    /// Expiration of a file opened at `now`: min(now + interval, next cron tick)
    pub fn expiration(&self, schedule: Option<&cron::Schedule>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let by_interval = self
            .interval
            .filter(|interval| *interval > 0.0)
            .and_then(|interval| chrono::Duration::from_std(secs(interval)).ok())
            .map(|interval| now + interval);
        let by_cron = schedule.and_then(|schedule| schedule.after(&now).next());

        match (by_interval, by_cron) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

fn default_filename() -> String {
    "{now:%y%m%d%H%M%S}_{pid}.log".to_string()
}

/// Writer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub directory: String,
    /// File name template
    pub filename: String,
    pub flush_threshold: usize,
    /// Seconds of inactivity after which buffered lines are written
    pub flush_timeout: f64,
    pub buffer_size: usize,
    pub buffer_high_watermark: usize,
    pub rotation: RotationPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            directory: "/var/lib/edmp".to_string(),
            filename: default_filename(),
            flush_threshold: 64 * 1024,
            flush_timeout: 5.0,
            buffer_size: 4 * 1024 * 1024,
            buffer_high_watermark: 3 * 1024 * 1024,
            rotation: RotationPolicy::default(),
        }
    }
}

/// Substitute `{now:<fmt>}`, `{uid}`, `{pid}` and `{tid}` in a file name template
pub fn render_template(template: &str, now: DateTime<Utc>) -> Result<String> {
    let mut rendered = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            return Err(EdmpError::InvalidInput(format!("unclosed placeholder in '{}'", template)));
        };
        let placeholder = &after[..end];

        match placeholder {
            "uid" => rendered.push_str(&process_uid().to_string()),
            "pid" => rendered.push_str(&std::process::id().to_string()),
            "tid" => rendered.push_str(&thread_id()),
            _ => match placeholder.strip_prefix("now:") {
                Some(format) => write!(rendered, "{}", now.format(format)).map_err(|_| {
                    EdmpError::InvalidInput(format!("invalid time format '{}'", format))
                })?,
                None => {
                    return Err(EdmpError::InvalidInput(format!(
                        "unknown placeholder '{{{}}}' in '{}'",
                        placeholder, template
                    )))
                }
            },
        }
        rest = &after[end + 1..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

#[cfg(unix)]
fn process_uid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").map(|m| m.uid()).unwrap_or(0)
}

#[cfg(not(unix))]
fn process_uid() -> u32 {
    0
}

fn thread_id() -> String {
    let id = format!("{:?}", std::thread::current().id());
    id.chars().filter(char::is_ascii_digit).collect()
}

/// Whether a line went in cleanly or the backlog is getting large
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Accepted,
    HighWatermark,
}

enum Command {
    Line(String),
    Flush(oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
}

/// Handle to a background writer
pub struct RotatingWriter {
    name: String,
    config: WriterConfig,
    tx: mpsc::UnboundedSender<Command>,
    backlog: Arc<AtomicUsize>,
    warned: AtomicBool,
    closed: AtomicBool,
    owner: Mutex<Option<JoinHandle<()>>>,
}

impl RotatingWriter {
    /// Validate the configuration and start the owner task
    pub fn spawn(name: impl Into<String>, config: WriterConfig) -> Result<Self> {
        let name = name.into();
        let schedule = config.rotation.schedule()?;
        render_template(&config.filename, Utc::now())?;

        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        let owner = Owner {
            name: name.clone(),
            config: config.clone(),
            schedule,
            backlog: backlog.clone(),
            buffer: Vec::new(),
            current: None,
            opened: HashSet::new(),
        };
        let handle = tokio::spawn(owner.run(rx));
        debug!(writer = %name, directory = %config.directory, "writer started");

        Ok(Self {
            name,
            config,
            tx,
            backlog,
            warned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            owner: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Bytes accepted but not yet written out
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    /// Queue one line (a newline is appended)
    pub fn write_line(&self, line: impl Into<String>) -> Result<WriteStatus> {
        if self.is_closed() {
            return Err(EdmpError::ResourceClosed(format!("writer '{}'", self.name)));
        }
        let mut line = line.into();
        line.push('\n');
        let size = line.len();

        let reserved = self
            .backlog
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |backlog| {
                (backlog + size <= self.config.buffer_size).then_some(backlog + size)
            });
        let backlog = match reserved {
            Ok(previous) => previous + size,
            Err(backlog) => {
                return Err(EdmpError::StorageFull(format!(
                    "writer '{}' has {} bytes pending, limit {}",
                    self.name, backlog, self.config.buffer_size
                )))
            }
        };

        if self.tx.send(Command::Line(line)).is_err() {
            self.backlog.fetch_sub(size, Ordering::SeqCst);
            return Err(EdmpError::ResourceClosed(format!("writer '{}'", self.name)));
        }

        if backlog > self.config.buffer_high_watermark {
            if !self.warned.swap(true, Ordering::SeqCst) {
                warn!(writer = %self.name, backlog, watermark = self.config.buffer_high_watermark, "writer backlog above high watermark");
            }
            Ok(WriteStatus::HighWatermark)
        } else {
            self.warned.store(false, Ordering::SeqCst);
            Ok(WriteStatus::Accepted)
        }
    }

    /// Write out everything accepted so far
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(tx))
            .map_err(|_| EdmpError::ResourceClosed(format!("writer '{}'", self.name)))?;
        rx.await
            .map_err(|_| EdmpError::ResourceClosed(format!("writer '{}'", self.name)))?
    }

    /// Drain, close the file and stop the owner task; later writes fail
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        let outcome = if self.tx.send(Command::Close(tx)).is_ok() {
            rx.await.unwrap_or(Ok(()))
        } else {
            Ok(())
        };
        if let Some(handle) = self.owner.lock().await.take() {
            let _ = handle.await;
        }
        info!(writer = %self.name, "writer closed");
        outcome
    }
}

struct OpenFile {
    path: PathBuf,
    file: File,
    size: u64,
    expires_at: Option<DateTime<Utc>>,
}

/// The single task that owns the file
struct Owner {
    name: String,
    config: WriterConfig,
    schedule: Option<cron::Schedule>,
    backlog: Arc<AtomicUsize>,
    buffer: Vec<u8>,
    current: Option<OpenFile>,
    opened: HashSet<PathBuf>,
}

impl Owner {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let flush_timeout = secs(self.config.flush_timeout);
        let mut last_line = Instant::now();

        loop {
            let idle_deadline = last_line + flush_timeout;
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Line(line)) => {
                        self.buffer.extend_from_slice(line.as_bytes());
                        last_line = Instant::now();
                        if self.buffer.len() > self.config.flush_threshold {
                            self.write_out_logged().await;
                        }
                    }
                    Some(Command::Flush(reply)) => {
                        let _ = reply.send(self.write_out().await);
                    }
                    Some(Command::Close(reply)) => {
                        let outcome = self.write_out().await;
                        let outcome = match self.current.take() {
                            Some(mut open) => outcome.and(open.file.sync_all().await.map_err(EdmpError::from)),
                            None => outcome,
                        };
                        let _ = reply.send(outcome);
                        break;
                    }
                    None => {
                        self.write_out_logged().await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(idle_deadline), if !self.buffer.is_empty() => {
                    self.write_out_logged().await;
                }
            }
        }
        debug!(writer = %self.name, "writer task stopped");
    }

    async fn write_out_logged(&mut self) {
        if let Err(e) = self.write_out().await {
            error!(writer = %self.name, error = %e, "failed to write buffered lines");
        }
    }

    /// Rotate if due, then append the buffer to the current file
    async fn write_out(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if self.rotation_due(Utc::now()) {
            if let Some(mut previous) = self.current.take() {
                previous.file.flush().await?;
                info!(writer = %self.name, path = %previous.path.display(), size = previous.size, "rotated");
            }
        }
        if self.current.is_none() {
            self.current = Some(self.open_next().await?);
        }

        let Some(open) = self.current.as_mut() else {
            return Ok(());
        };
        open.file.write_all(&self.buffer).await?;
        open.file.flush().await?;

        let written = self.buffer.len();
        open.size += written as u64;
        self.buffer.clear();
        self.backlog.fetch_sub(written, Ordering::SeqCst);
        Ok(())
    }

    fn rotation_due(&self, now: DateTime<Utc>) -> bool {
        let Some(open) = &self.current else {
            return false;
        };
        let by_size = self
            .config
            .rotation
            .size
            .map_or(false, |limit| open.size >= limit);
        let by_time = open.expires_at.map_or(false, |at| now >= at);
        by_size || by_time
    }

    async fn open_next(&mut self) -> Result<OpenFile> {
        let now = Utc::now();
        let directory = Path::new(&self.config.directory);
        fs::create_dir_all(directory).await?;

        let name = render_template(&self.config.filename, now)?;
        let mut path = directory.join(&name);
        let mut suffix = 1;
        // Never append to a file this writer already rotated away from
        while self.opened.contains(&path) {
            path = directory.join(format!("{}.{}", name, suffix));
            suffix += 1;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        self.opened.insert(path.clone());
        debug!(writer = %self.name, path = %path.display(), "opened file");

        Ok(OpenFile {
            path,
            file,
            size,
            expires_at: self.config.rotation.expiration(self.schedule.as_ref(), now),
        })
    }
}
