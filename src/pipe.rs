//! In-memory single-producer / single-consumer byte pipe.
//!
//! The writer never blocks: bytes are appended to a buffer and the reader is
//! woken. The reader blocks until bytes arrive or the pipe is closed.
//! [`PipeWriter::close`] waits, up to the close timeout, for the reader to
//! drain what is left, unless no read was ever issued, in which case the
//! buffered bytes are dropped and close returns at once.
//!
//! Used to hand a streamed upload from async code to a blocking consumer
//! (archive extraction) and for install log streaming.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

/// Default bound on how long `close` waits for the reader.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Default)]
struct State {
    buf: VecDeque<u8>,
    closed: bool,
    /// Set by the first read.
    reader_ready: bool,
    reader_gone: bool,
    /// Set by `abort`; surfaced to the reader after the buffer drains.
    failed: Option<String>,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    close_timeout: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct PipeWriter {
    shared: Arc<Shared>,
}

pub struct PipeReader {
    shared: Arc<Shared>,
}

/// How a close completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The reader consumed everything.
    Drained,
    /// No reader was ready; buffered bytes were dropped.
    Abandoned,
    /// The timeout passed with bytes still buffered.
    TimedOut { pending: usize },
}

/// A connected pipe whose close waits at most `close_timeout`.
pub fn pipe(close_timeout: Duration) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::default()),
        cond: Condvar::new(),
        close_timeout,
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

impl PipeWriter {
    /// Bytes written but not yet read.
    pub fn pending(&self) -> usize {
        self.shared.lock().buf.len()
    }

    /// End the stream with an error. The reader gets the buffered bytes,
    /// then `reason` instead of end-of-file.
    pub fn abort(self, reason: impl Into<String>) {
        let mut state = self.shared.lock();
        state.failed = Some(reason.into());
        state.closed = true;
        self.shared.cond.notify_all();
    }

    /// Close the write side and wait for the reader to drain.
    pub fn close(self) -> CloseOutcome {
        self.close_inner()
    }

    fn close_inner(&self) -> CloseOutcome {
        let shared = &self.shared;
        let mut state = shared.lock();
        state.closed = true;
        shared.cond.notify_all();

        if !state.reader_ready || state.reader_gone {
            let dropped = state.buf.len();
            state.buf.clear();
            if dropped > 0 {
                debug!(dropped, "pipe closed without a reader, dropping buffered bytes");
            }
            return CloseOutcome::Abandoned;
        }

        let (state, timeout) = shared
            .cond
            .wait_timeout_while(state, shared.close_timeout, |s| {
                !s.buf.is_empty() && !s.reader_gone
            })
            .unwrap_or_else(PoisonError::into_inner);

        if timeout.timed_out() && !state.buf.is_empty() {
            let pending = state.buf.len();
            warn!(pending, "pipe close timed out waiting for the reader");
            return CloseOutcome::TimedOut { pending };
        }
        CloseOutcome::Drained
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        if state.reader_gone {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"));
        }
        state.buf.extend(data);
        self.shared.cond.notify_all();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if !state.closed {
            // end of stream for the reader, without waiting on it
            state.closed = true;
            self.shared.cond.notify_all();
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let shared = &self.shared;
        let mut state = shared.lock();
        if !state.reader_ready {
            state.reader_ready = true;
        }

        let mut state = shared
            .cond
            .wait_while(state, |s| s.buf.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        if state.buf.is_empty() {
            if let Some(reason) = &state.failed {
                return Err(io::Error::other(reason.clone()));
            }
        }
        let n = out.len().min(state.buf.len());
        for (dst, src) in out.iter_mut().zip(state.buf.drain(..n)) {
            *dst = src;
        }
        if state.buf.is_empty() {
            shared.cond.notify_all();
        }
        Ok(n)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.reader_gone = true;
        self.shared.cond.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn close_without_reader_returns_immediately() {
        let (mut w, _r) = pipe(Duration::from_secs(60));
        w.write_all(&[1u8; 1024]).unwrap();

        let start = Instant::now();
        assert_eq!(w.close(), CloseOutcome::Abandoned);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn close_waits_for_reader_to_drain() {
        let (mut w, mut r) = pipe(Duration::from_secs(60));

        // first read blocks, marking the reader ready
        let reader = thread::spawn(move || {
            let mut out = Vec::new();
            r.read_to_end(&mut out).unwrap();
            out
        });
        while !w.shared.lock().reader_ready {
            thread::sleep(Duration::from_millis(1));
        }

        w.write_all(&[7u8; 1024]).unwrap();
        assert_eq!(w.close(), CloseOutcome::Drained);

        let out = reader.join().unwrap();
        assert_eq!(out.len(), 1024);
        assert!(out.iter().all(|b| *b == 7));
    }

    #[test]
    fn close_gives_up_after_timeout() {
        let (mut w, mut r) = pipe(Duration::from_millis(50));
        w.write_all(b"x").unwrap();

        let mut one = [0u8; 1];
        assert_eq!(r.read(&mut one).unwrap(), 1);
        w.write_all(b"left over").unwrap();

        assert_eq!(w.close(), CloseOutcome::TimedOut { pending: 9 });
    }

    #[test]
    fn writes_fail_once_reader_is_gone() {
        let (mut w, r) = pipe(DEFAULT_CLOSE_TIMEOUT);
        drop(r);
        let err = w.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn dropped_writer_ends_the_stream() {
        let (mut w, mut r) = pipe(DEFAULT_CLOSE_TIMEOUT);
        w.write_all(b"hello").unwrap();
        drop(w);

        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn aborted_writer_fails_the_reader_after_the_buffer() {
        let (mut w, mut r) = pipe(DEFAULT_CLOSE_TIMEOUT);
        w.write_all(b"abc").unwrap();
        w.abort("upload reset");

        let mut out = [0u8; 8];
        assert_eq!(r.read(&mut out).unwrap(), 3);
        let err = r.read(&mut out).unwrap_err();
        assert_eq!(err.to_string(), "upload reset");
    }
}
