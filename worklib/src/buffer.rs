//! An append-only byte log with change notification.
//!
//! One producer appends a job's merged stdout/stderr; any number of readers
//! replay the stream from the first byte, tailing live output until the
//! buffer is closed. Closing marks end-of-stream: readers drain whatever is
//! left and then see EOF.

use std::cmp;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::error::{Error, Result};

// TODO: spill to a backing file once the buffer crosses a threshold; a
// long-running job with chatty output can grow this without bound.
struct State {
    data: Vec<u8>,
    closed: bool,
}

struct Inner {
    state: RwLock<State>,
    seq: watch::Sender<u64>,
}

/// A thread-safe, automatically growing byte buffer.
///
/// This is a cheap handle; clones share one underlying buffer. Writers are
/// serialized through the inner lock. Every append bumps a monotonically
/// increasing sequence number on a watch channel, which is what wakes
/// blocked readers; close bumps it one final time.
#[derive(Clone)]
pub struct NotifyingBuffer {
    inner: Arc<Inner>,
}

impl NotifyingBuffer {
    pub fn new() -> Self {
        let (seq, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    data: Vec::new(),
                    closed: false,
                }),
                seq,
            }),
        }
    }

    /// Appends `bytes` and wakes all waiting readers.
    ///
    /// Fails with [`Error::BufferClosed`] once the buffer was closed.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        {
            let mut state = self.inner.state.write().unwrap();
            if state.closed {
                return Err(Error::BufferClosed);
            }
            state.data.extend_from_slice(bytes);
        }
        self.inner.seq.send_modify(|s| *s += 1);
        Ok(bytes.len())
    }

    /// Marks end-of-stream and wakes all waiting readers. Idempotent;
    /// subsequent writes fail.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.write().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.inner.seq.send_modify(|s| *s += 1);
    }

    /// Atomic snapshot of `(len, closed)`.
    pub fn status(&self) -> (usize, bool) {
        let state = self.inner.state.read().unwrap();
        (state.data.len(), state.closed)
    }

    /// Returns a new reader positioned at the start of the buffer.
    pub fn reader(&self) -> OutputReader {
        OutputReader {
            pos: 0,
            closed: false,
            seq: self.inner.seq.subscribe(),
            buffer: self.clone(),
        }
    }
}

impl Default for NotifyingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A cursor over a [`NotifyingBuffer`].
///
/// Readers never consume: every reader observes the exact byte sequence ever
/// written, in order, regardless of when it was opened.
pub struct OutputReader {
    pos: usize,
    closed: bool,
    seq: watch::Receiver<u64>,
    buffer: NotifyingBuffer,
}

impl OutputReader {
    /// Copies buffered bytes from the cursor into `dst`.
    ///
    /// Returns the number of bytes copied, or `0` for end-of-stream. Blocks
    /// only while the cursor is at the end of a still-open buffer; it is
    /// released by a new append, by the buffer closing, or by this reader
    /// being closed. Dropping the returned future while blocked is safe and
    /// is the usual cancellation path for a disconnecting watcher.
    pub async fn read(&mut self, dst: &mut [u8]) -> usize {
        loop {
            if self.closed {
                return 0;
            }
            // Mark the current sequence seen before inspecting the state, so
            // an append between the check and the wait still wakes us.
            self.seq.borrow_and_update();
            {
                let state = self.buffer.inner.state.read().unwrap();
                if self.pos < state.data.len() {
                    let n = cmp::min(dst.len(), state.data.len() - self.pos);
                    dst[..n].copy_from_slice(&state.data[self.pos..self.pos + n]);
                    self.pos += n;
                    return n;
                }
                if state.closed {
                    return 0;
                }
            }
            if self.seq.changed().await.is_err() {
                // writer side gone; nothing more will arrive
                return 0;
            }
        }
    }

    /// Marks this reader as done; subsequent reads return end-of-stream.
    /// Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn drain(mut reader: OutputReader) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 7]; // deliberately small to force short reads
        loop {
            let n = reader.read(&mut chunk).await;
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn replays_from_the_start() {
        let buf = NotifyingBuffer::new();
        buf.write(b"hello ").unwrap();
        buf.write(b"world").unwrap();
        buf.close();

        assert_eq!(drain(buf.reader()).await, b"hello world");
    }

    #[tokio::test]
    async fn late_reader_sees_full_history() {
        let buf = NotifyingBuffer::new();
        for i in 0..100u8 {
            buf.write(&[i]).unwrap();
        }
        buf.close();

        // opened long after the writes finished
        let got = drain(buf.reader()).await;
        assert_eq!(got, (0..100u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn concurrent_readers_observe_identical_bytes() {
        let buf = NotifyingBuffer::new();
        let early = tokio::spawn(drain(buf.reader()));

        let writer = {
            let buf = buf.clone();
            tokio::spawn(async move {
                for i in 0..50u8 {
                    buf.write(&[i, i, i]).unwrap();
                    tokio::task::yield_now().await;
                }
                buf.close();
            })
        };
        writer.await.unwrap();

        let late = drain(buf.reader()).await;
        let early = early.await.unwrap();
        assert_eq!(early, late);
        assert_eq!(early.len(), 150);
    }

    #[tokio::test]
    async fn blocked_read_released_by_write() {
        let buf = NotifyingBuffer::new();
        let mut reader = buf.reader();

        let pending = tokio::spawn(async move {
            let mut chunk = [0u8; 16];
            let n = reader.read(&mut chunk).await;
            (n, chunk)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        buf.write(b"data").unwrap();

        let (n, chunk) = pending.await.unwrap();
        assert_eq!(&chunk[..n], b"data");
    }

    #[tokio::test]
    async fn close_without_writes_yields_immediate_eof() {
        let buf = NotifyingBuffer::new();
        let mut reader = buf.reader();

        let pending = tokio::spawn(async move { reader.read(&mut [0u8; 16]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        buf.close();

        assert_eq!(pending.await.unwrap(), 0);
        assert_eq!(buf.status(), (0, true));
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let buf = NotifyingBuffer::new();
        buf.write(b"ok").unwrap();
        buf.close();
        buf.close(); // idempotent
        assert!(matches!(buf.write(b"nope"), Err(Error::BufferClosed)));
        assert_eq!(drain(buf.reader()).await, b"ok");
    }

    #[tokio::test]
    async fn zero_length_write_is_harmless() {
        let buf = NotifyingBuffer::new();
        assert_eq!(buf.write(b"").unwrap(), 0);
        buf.write(b"x").unwrap();
        buf.close();
        assert_eq!(drain(buf.reader()).await, b"x");
    }

    #[tokio::test]
    async fn closed_reader_reports_eof() {
        let buf = NotifyingBuffer::new();
        buf.write(b"pending data").unwrap();

        let mut reader = buf.reader();
        reader.close();
        reader.close(); // idempotent
        assert_eq!(reader.read(&mut [0u8; 16]).await, 0);
    }
}
