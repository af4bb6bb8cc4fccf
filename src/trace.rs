//! Chrome-tracing span export (enable the `trace` feature).
//!
//! Workers record one span per executed job into a thread-local buffer, so
//! tracing adds no contention to the hot path. Buffers fold into a
//! process-wide list when each worker exits (background workers do this on
//! their own; call [`collect_thread_spans`] for the foreground thread) and
//! can be written as a JSON array loadable in chrome://tracing or
//! ui.perfetto.dev.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// One completed job span.
#[derive(Debug, Clone)]
pub struct SpanEvent {
    pub name: &'static str,
    pub worker: usize,
    pub start_us: u64,
    pub duration_us: u64,
}

thread_local! {
    static SPANS: RefCell<Vec<SpanEvent>> = RefCell::new(Vec::with_capacity(4096));
}

lazy_static::lazy_static! {
    static ref TRACE_EPOCH: Instant = Instant::now();
    static ref WALL_OFFSET_US: u64 = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    static ref COLLECTED: Mutex<Vec<SpanEvent>> = Mutex::new(Vec::new());
}

/// Appends a span to the current thread's buffer.
pub fn record_span(name: &'static str, worker: usize, start: Instant, duration: Duration) {
    let start_us = start.duration_since(*TRACE_EPOCH).as_micros() as u64 + *WALL_OFFSET_US;
    SPANS.with(|buffer| {
        buffer.borrow_mut().push(SpanEvent {
            name,
            worker,
            start_us,
            duration_us: duration.as_micros() as u64,
        });
    });
}

/// Folds the current thread's buffer into the process-wide list. Each worker
/// does this when it exits; the foreground thread must call it before
/// exporting if it executed jobs itself.
pub fn collect_thread_spans() {
    SPANS.with(|buffer| {
        let mut local = buffer.borrow_mut();
        if !local.is_empty() {
            COLLECTED.lock().append(&mut local);
        }
    });
}

/// Discards every collected span.
pub fn clear() {
    COLLECTED.lock().clear();
}

/// Writes the collected spans as chrome-tracing "complete" events.
pub fn export_to_file(path: &str) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let spans = COLLECTED.lock();

    writeln!(writer, "[")?;
    for (at, span) in spans.iter().enumerate() {
        let separator = if at + 1 == spans.len() { "" } else { "," };
        writeln!(
            writer,
            "{{\"name\":\"{}\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\"pid\":1,\"tid\":{}}}{}",
            span.name, span.start_us, span.duration_us, span.worker, separator,
        )?;
    }
    writeln!(writer, "]")?;
    writer.flush()
}

/// RAII span: records from construction to drop.
pub struct SpanGuard {
    name: &'static str,
    worker: usize,
    start: Instant,
}

impl SpanGuard {
    pub fn new(name: &'static str, worker: usize) -> Self {
        SpanGuard {
            name,
            worker,
            start: Instant::now(),
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        record_span(self.name, self.worker, self.start, self.start.elapsed());
    }
}

/// RAII collector: folds the thread's buffer into the global list on drop.
pub struct CollectorGuard;

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        collect_thread_spans();
    }
}
