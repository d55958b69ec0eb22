// src/logger.rs
//! Asynchronous logging: callers format into a bounded queue and a single
//! writer thread owns the sink. Overflow drops the line instead of blocking
//! the event loop.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use log::{LevelFilter, Log, Metadata, Record};

use crate::error::{PetrelError, PetrelResult};
use crate::queue::BoundedQueue;

struct AsyncLogger {
    queue: Arc<BoundedQueue<String>>,
    level: LevelFilter,
}

impl Log for AsyncLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record);
        // Full queue means the writer is behind; losing a line is better
        // than stalling the caller.
        let _ = self.queue.push(line);
    }

    fn flush(&self) {}
}

fn format_line(record: &Record) -> String {
    format!(
        "{} {:<5} [{}] {}",
        httpdate::fmt_http_date(SystemTime::now()),
        record.level(),
        record.target(),
        record.args()
    )
}

fn writer_loop(queue: Arc<BoundedQueue<String>>, mut sink: Box<dyn Write + Send>) {
    while let Some(line) = queue.pop() {
        let _ = writeln!(sink, "{}", line);
        let _ = sink.flush();
    }
}

/// Keeps the writer thread alive; dropping it closes the queue and waits
/// for the remaining lines to reach the sink.
pub struct LoggerHandle {
    queue: Arc<BoundedQueue<String>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for LoggerHandle {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Installs the global logger. With a path the sink is an append-mode file,
/// otherwise stderr.
pub fn init(
    path: Option<PathBuf>,
    queue_capacity: usize,
    level: LevelFilter,
) -> PetrelResult<LoggerHandle> {
    let queue = Arc::new(BoundedQueue::new(queue_capacity));
    let sink: Box<dyn Write + Send> = match path {
        Some(p) => Box::new(BufWriter::new(
            OpenOptions::new().create(true).append(true).open(&p)?,
        )),
        None => Box::new(std::io::stderr()),
    };

    let writer_queue = queue.clone();
    let thread = thread::Builder::new()
        .name("petrel-log".to_string())
        .spawn(move || writer_loop(writer_queue, sink))
        .map_err(|e| PetrelError::Other(format!("spawning log writer: {}", e)))?;

    log::set_boxed_logger(Box::new(AsyncLogger {
        queue: queue.clone(),
        level,
    }))
    .map_err(|e| PetrelError::Other(format!("installing logger: {}", e)))?;
    log::set_max_level(level);

    Ok(LoggerHandle {
        queue,
        thread: Some(thread),
    })
}
