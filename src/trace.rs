//! Optional binary trace stream.
//!
//! Records begin/end events in three categories (`compute`,
//! `schedule`, `taskqueue`) to a caller-supplied file between
//! `start_trace` and `end_trace`. When tracing is off, emitting an
//! event costs a single relaxed atomic load.
//!
//! Record layout, little-endian:
//!   kind: u8 (0 = begin, 1 = end)
//!   category: u8
//!   thread: u32
//!   t_ns: u64 (nanoseconds since start_trace)
//!   name_len: u16, name bytes (empty for end records)

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Category {
    Compute = 0,
    Schedule = 1,
    TaskQueue = 2,
}

struct Stream {
    out: BufWriter<File>,
    epoch: Instant,
}

static ENABLED: AtomicBool = AtomicBool::new(false);
static STREAM: Mutex<Option<Stream>> = Mutex::new(None);

static NEXT_THREAD: AtomicU32 = AtomicU32::new(0);
thread_local! {
    static THREAD_ID: u32 = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
}

/// Begin writing trace events to `path`.
pub fn start_trace(path: &str) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut guard = STREAM.lock().unwrap();
    *guard = Some(Stream {
        out: BufWriter::new(file),
        epoch: Instant::now(),
    });
    ENABLED.store(true, Ordering::Release);
    log::info!("trace started: {path}");
    Ok(())
}

/// Stop tracing and flush the stream.
pub fn end_trace() {
    ENABLED.store(false, Ordering::Release);
    let mut guard = STREAM.lock().unwrap();
    if let Some(mut stream) = guard.take() {
        let _ = stream.out.flush();
    }
    log::info!("trace stopped");
}

#[inline]
pub fn event_begin(cat: Category, name: &str) {
    if ENABLED.load(Ordering::Relaxed) {
        emit(0, cat, name);
    }
}

#[inline]
pub fn event_end(cat: Category) {
    if ENABLED.load(Ordering::Relaxed) {
        emit(1, cat, "");
    }
}

#[cold]
fn emit(kind: u8, cat: Category, name: &str) {
    let tid = THREAD_ID.with(|id| *id);
    let mut guard = STREAM.lock().unwrap();
    if let Some(stream) = guard.as_mut() {
        let t_ns = stream.epoch.elapsed().as_nanos() as u64;
        let name = name.as_bytes();
        let mut rec = Vec::with_capacity(16 + name.len());
        rec.push(kind);
        rec.push(cat as u8);
        rec.extend_from_slice(&tid.to_le_bytes());
        rec.extend_from_slice(&t_ns.to_le_bytes());
        rec.extend_from_slice(&(name.len() as u16).to_le_bytes());
        rec.extend_from_slice(name);
        let _ = stream.out.write_all(&rec);
    }
}
