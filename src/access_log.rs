//! Access log
//!
//! Request handlers call [`AccessLogger::log`], which never waits: records go
//! onto one bounded queue and a single writer task drains it to a file or
//! stdout. When the queue is full the configured overflow policy decides
//! which record is lost, and every loss is counted.

use crate::config::{AccessLogConfig, AccessLogFormat, OverflowPolicy};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Records written per sink write
const BATCH_SIZE: usize = 256;

/// One request, as logged
#[derive(Debug, Clone, Serialize)]
pub struct AccessRecord {
    pub timestamp: DateTime<Utc>,
    pub client: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub backend: Option<String>,
    pub router: Option<String>,
    pub entrypoint: String,
}

impl AccessRecord {
    pub fn format(&self, format: AccessLogFormat) -> String {
        match format {
            AccessLogFormat::Json => serde_json::to_string(self).unwrap_or_default(),
            AccessLogFormat::Common => format!(
                "{} - - [{}] \"{} {}\" {} - \"{}\" \"{}\" \"{}\" {}ms",
                self.client,
                self.timestamp.format("%d/%b/%Y:%H:%M:%S %z"),
                self.method,
                self.path,
                self.status,
                self.host,
                self.router.as_deref().unwrap_or("-"),
                self.backend.as_deref().unwrap_or("-"),
                self.latency_ms,
            ),
        }
    }
}

/// Where the writer sends lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    File(PathBuf),
}

impl LogTarget {
    pub fn from_config(config: &AccessLogConfig) -> Self {
        match &config.path {
            Some(path) => LogTarget::File(PathBuf::from(path)),
            None => LogTarget::Stdout,
        }
    }
}

enum Sink {
    Stdout(tokio::io::Stdout),
    File(tokio::fs::File),
}

impl Sink {
    async fn open(target: &LogTarget) -> std::io::Result<Self> {
        match target {
            LogTarget::Stdout => Ok(Sink::Stdout(tokio::io::stdout())),
            LogTarget::File(path) => tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map(Sink::File),
        }
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Sink::Stdout(out) => {
                out.write_all(data).await?;
                out.flush().await
            }
            Sink::File(file) => {
                file.write_all(data).await?;
                file.flush().await
            }
        }
    }
}

pub struct AccessLogger {
    queue: Mutex<VecDeque<AccessRecord>>,
    capacity: usize,
    overflow: OverflowPolicy,
    dropped: AtomicU64,
    notify: Notify,
    enabled: bool,
}

impl AccessLogger {
    pub fn new(config: &AccessLogConfig) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: config.buffer_size.max(1),
            overflow: config.overflow,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            enabled: config.enabled,
        })
    }

    /// Logger that discards everything
    pub fn disabled() -> Arc<Self> {
        Self::new(&AccessLogConfig {
            enabled: false,
            ..AccessLogConfig::default()
        })
    }

    /// Queue a record
    pub fn log(&self, record: AccessRecord) {
        if !self.enabled {
            return;
        }
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match self.overflow {
                    OverflowPolicy::DropNewest => return,
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                    }
                }
            }
            queue.push_back(record);
        }
        self.notify.notify_one();
    }

    /// Records lost to overflow so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    fn take_batch(&self) -> Vec<AccessRecord> {
        let mut queue = self.queue.lock();
        let n = queue.len().min(BATCH_SIZE);
        queue.drain(..n).collect()
    }

    /// Put an unwritten batch back in front of newer records
    fn requeue(&self, batch: Vec<AccessRecord>) {
        let mut queue = self.queue.lock();
        for record in batch.into_iter().rev() {
            queue.push_front(record);
        }
        let excess = queue.len().saturating_sub(self.capacity);
        if excess > 0 {
            self.dropped.fetch_add(excess as u64, Ordering::Relaxed);
            match self.overflow {
                OverflowPolicy::DropNewest => queue.truncate(self.capacity),
                OverflowPolicy::DropOldest => {
                    queue.drain(..excess);
                }
            }
        }
    }

    /// Drain the queue into `target` until shutdown
    pub fn spawn_writer(
        self: &Arc<Self>,
        target: LogTarget,
        format: AccessLogFormat,
        reopen_interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let logger = Arc::clone(self);
        tokio::spawn(async move {
            info!(target_sink = ?target, format = ?format, "Access log writer started");
            let mut sink: Option<Sink> = None;
            let mut shutting_down = false;

            loop {
                if sink.is_none() {
                    match Sink::open(&target).await {
                        Ok(s) => {
                            debug!(target_sink = ?target, "Access log sink opened");
                            sink = Some(s);
                        }
                        Err(e) => {
                            warn!(
                                target_sink = ?target,
                                error = %e,
                                queued = logger.queued(),
                                "Access log sink unavailable"
                            );
                            if shutting_down {
                                break;
                            }
                            tokio::select! {
                                _ = tokio::time::sleep(reopen_interval) => {}
                                _ = shutdown_rx.changed() => {
                                    shutting_down = *shutdown_rx.borrow();
                                }
                            }
                            continue;
                        }
                    }
                }

                let batch = logger.take_batch();
                if batch.is_empty() {
                    if shutting_down {
                        break;
                    }
                    tokio::select! {
                        _ = logger.notify.notified() => {}
                        _ = shutdown_rx.changed() => {
                            shutting_down = *shutdown_rx.borrow();
                        }
                    }
                    continue;
                }

                let mut buf = String::new();
                for record in &batch {
                    buf.push_str(&record.format(format));
                    buf.push('\n');
                }
                if let Some(s) = sink.as_mut() {
                    if let Err(e) = s.write(buf.as_bytes()).await {
                        warn!(target_sink = ?target, error = %e, "Access log write failed");
                        logger.requeue(batch);
                        sink = None;
                        if shutting_down {
                            break;
                        }
                    }
                }
            }

            info!(dropped = logger.dropped(), "Access log writer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str) -> AccessRecord {
        AccessRecord {
            timestamp: DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            client: "192.0.2.7".to_string(),
            method: "GET".to_string(),
            host: "app.example.com".to_string(),
            path: path.to_string(),
            status: 200,
            latency_ms: 12,
            backend: Some("10.0.0.5:8080".to_string()),
            router: Some("app".to_string()),
            entrypoint: "web".to_string(),
        }
    }

    fn config(buffer_size: usize, overflow: OverflowPolicy) -> AccessLogConfig {
        AccessLogConfig {
            enabled: true,
            buffer_size,
            overflow,
            ..AccessLogConfig::default()
        }
    }

    fn queued_paths(logger: &AccessLogger) -> Vec<String> {
        logger.queue.lock().iter().map(|r| r.path.clone()).collect()
    }

    #[test]
    fn test_drop_newest_keeps_oldest() {
        let logger = AccessLogger::new(&config(2, OverflowPolicy::DropNewest));
        for p in ["/1", "/2", "/3", "/4"] {
            logger.log(record(p));
        }
        assert_eq!(queued_paths(&logger), vec!["/1", "/2"]);
        assert_eq!(logger.dropped(), 2);
    }

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let logger = AccessLogger::new(&config(2, OverflowPolicy::DropOldest));
        for p in ["/1", "/2", "/3", "/4"] {
            logger.log(record(p));
        }
        assert_eq!(queued_paths(&logger), vec!["/3", "/4"]);
        assert_eq!(logger.dropped(), 2);
    }

    #[test]
    fn test_requeue_respects_capacity() {
        let logger = AccessLogger::new(&config(3, OverflowPolicy::DropNewest));
        logger.log(record("/1"));
        logger.log(record("/2"));
        let batch = logger.take_batch();
        logger.log(record("/3"));
        logger.log(record("/4"));
        logger.requeue(batch);
        assert_eq!(queued_paths(&logger), vec!["/1", "/2", "/3"]);
        assert_eq!(logger.dropped(), 1);
    }

    #[test]
    fn test_disabled_logger_discards() {
        let logger = AccessLogger::disabled();
        logger.log(record("/"));
        assert_eq!(logger.queued(), 0);
    }

    #[test]
    fn test_json_field_order() {
        let line = record("/api").format(AccessLogFormat::Json);
        let keys = [
            "timestamp",
            "client",
            "method",
            "host",
            "path",
            "status",
            "latency_ms",
            "backend",
            "router",
            "entrypoint",
        ];
        let positions: Vec<usize> = keys
            .iter()
            .map(|k| line.find(&format!("\"{}\"", k)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{}", line);
        assert!(line.contains("\"timestamp\":\"2026-03-01T12:00:00Z\""));
    }

    #[test]
    fn test_common_format() {
        let line = record("/api").format(AccessLogFormat::Common);
        assert_eq!(
            line,
            "192.0.2.7 - - [01/Mar/2026:12:00:00 +0000] \"GET /api\" 200 - \"app.example.com\" \"app\" \"10.0.0.5:8080\" 12ms"
        );
    }

    #[tokio::test]
    async fn test_writer_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "existing\n").unwrap();

        let logger = AccessLogger::new(&config(16, OverflowPolicy::DropNewest));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = logger.spawn_writer(
            LogTarget::File(path.clone()),
            AccessLogFormat::Json,
            Duration::from_millis(50),
            shutdown_rx,
        );

        logger.log(record("/a"));
        logger.log(record("/b"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "existing");
        assert!(lines[1].contains("\"path\":\"/a\""));
        assert!(lines[2].contains("\"path\":\"/b\""));
    }

    #[tokio::test]
    async fn test_records_kept_until_sink_available() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("later");
        let path = log_dir.join("access.log");

        let logger = AccessLogger::new(&config(16, OverflowPolicy::DropNewest));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = logger.spawn_writer(
            LogTarget::File(path.clone()),
            AccessLogFormat::Common,
            Duration::from_millis(50),
            shutdown_rx,
        );

        logger.log(record("/kept"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(logger.queued(), 1);

        std::fs::create_dir_all(&log_dir).unwrap();
        let mut written = String::new();
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            written = std::fs::read_to_string(&path).unwrap_or_default();
            if !written.is_empty() {
                break;
            }
        }
        assert!(written.contains("\"GET /kept\""));
        assert_eq!(logger.queued(), 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
