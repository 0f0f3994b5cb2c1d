//! The `.events` ring buffer: a lossy, line-aligned log of filesystem
//! mutations for an agent to tail. Writers never block on readers —
//! falling behind costs the reader whole lines off the tail, never a
//! partial one.

use parking_lot::Mutex;
use serde::Serialize;

use crate::model::Timestamp;

pub const RING_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Write,
    Unlink,
    Mkdir,
    Rmdir,
    Rename,
    Setattr,
    Setxattr,
    Removexattr,
    Link,
}

#[derive(Serialize)]
struct EventRecord<'a> {
    seq: u64,
    #[serde(rename = "type")]
    kind: EventKind,
    ino: u64,
    path: &'a str,
    ts: i64,
}

struct RingState {
    buf: Vec<u8>,
    /// Total bytes ever written; indexes into `buf` via `% RING_SIZE`.
    head: u64,
    /// Position of the oldest byte still intact, always at a line start.
    tail: u64,
    seq: u64,
    waiter: Option<Box<dyn FnOnce() + Send>>,
}

/// A reader's cursor into the ring, created at open time so a reader only
/// ever sees events emitted after it opened.
pub struct Reader {
    pub read_pos: u64,
}

pub struct EventRing {
    state: Mutex<RingState>,
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRing {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RingState {
                buf: vec![0u8; RING_SIZE],
                head: 0,
                tail: 0,
                seq: 0,
                waiter: None,
            }),
        }
    }

    pub fn open_reader(&self) -> Reader {
        let state = self.state.lock();
        Reader { read_pos: state.head }
    }

    /// Append one JSON-lines event record, evicting whole lines from the
    /// tail if the write overruns the buffer, then wake any poll waiter.
    pub fn emit(&self, kind: EventKind, ino: u64, path: &str) {
        let mut state = self.state.lock();
        state.seq += 1;
        let record = EventRecord {
            seq: state.seq,
            kind,
            ino,
            path,
            ts: Timestamp::now().secs,
        };
        let mut line = serde_json::to_vec(&record).expect("event record serialization is infallible");
        line.push(b'\n');

        for byte in &line {
            let idx = (state.head % RING_SIZE as u64) as usize;
            state.buf[idx] = *byte;
            state.head += 1;
        }

        if state.head - state.tail > RING_SIZE as u64 {
            state.tail = state.head - RING_SIZE as u64;
            while state.tail < state.head && state.buf[(state.tail % RING_SIZE as u64) as usize] != b'\n' {
                state.tail += 1;
            }
            if state.tail < state.head {
                state.tail += 1;
            }
        }

        if let Some(waiter) = state.waiter.take() {
            waiter();
        }
    }

    /// Copy up to `max_len` unread bytes into a fresh buffer, advancing
    /// `reader`. Snaps forward to the tail first if wraparound has
    /// overwritten what the reader was about to see.
    pub fn read(&self, reader: &mut Reader, max_len: usize) -> Vec<u8> {
        let state = self.state.lock();
        if reader.read_pos < state.tail {
            reader.read_pos = state.tail;
        }
        let avail = (state.head - reader.read_pos) as usize;
        let n = avail.min(max_len);
        let mut out = vec![0u8; n];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = state.buf[((reader.read_pos + i as u64) % RING_SIZE as u64) as usize];
        }
        reader.read_pos += n as u64;
        out
    }

    pub fn has_data(&self, reader: &Reader) -> bool {
        let state = self.state.lock();
        reader.read_pos < state.head
    }

    /// Register a one-shot callback fired on the next `emit`, replacing
    /// any previously registered waiter — mirrors a single pending poll
    /// handle per ring.
    pub fn register_waiter(&self, waiter: Box<dyn FnOnce() + Send>) {
        self.state.lock().waiter = Some(waiter);
    }

    /// `(head, tail, seq)` for the `.agentfs` status query.
    pub fn stats(&self) -> (u64, u64, u64) {
        let state = self.state.lock();
        (state.head, state.tail, state.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn reader_opened_after_events_sees_nothing_retroactively() {
        let ring = EventRing::new();
        ring.emit(EventKind::Create, 5, "/a");
        let mut reader = ring.open_reader();
        assert!(!ring.has_data(&reader));
        ring.emit(EventKind::Write, 5, "/a");
        assert!(ring.has_data(&reader));
        let bytes = ring.read(&mut reader, 4096);
        let line = String::from_utf8(bytes).unwrap();
        assert!(line.contains("\"type\":\"write\""));
        assert!(line.contains("\"seq\":2"));
    }

    #[test]
    fn wraparound_evicts_whole_lines_only() {
        let ring = EventRing::new();
        let mut reader = ring.open_reader();
        let long_path: String = "x".repeat(200);
        for _ in 0..5000 {
            ring.emit(EventKind::Write, 1, &long_path);
        }
        let bytes = ring.read(&mut reader, RING_SIZE * 2);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with('{'));
        assert!(text.ends_with('\n'));
        for line in text.lines() {
            assert!(line.starts_with('{') && line.ends_with('}'));
        }
    }

    #[test]
    fn emit_wakes_registered_waiter_once() {
        let ring = EventRing::new();
        let woken = Arc::new(AtomicBool::new(false));
        let woken2 = woken.clone();
        ring.register_waiter(Box::new(move || woken2.store(true, Ordering::SeqCst)));
        ring.emit(EventKind::Mkdir, 2, "/d");
        assert!(woken.load(Ordering::SeqCst));
    }
}
