//! Ingest buffer – the hand-over point between a reader task that pulls
//! bytes off a capture pipe and the segment loop that drains them.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Pause before reading again after an end-of-stream.
const EOF_RETRY: Duration = Duration::from_millis(500);

/// Byte accumulator shared by one producer and one consumer.
///
/// The lock is held only for in-memory work, never across I/O.
#[derive(Debug, Default)]
pub struct IngestBuffer {
    pending: Mutex<Vec<u8>>,
}

impl IngestBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    pub fn is_data_available(&self) -> bool {
        !self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        !self.is_data_available()
    }

    /// Move everything appended so far into `dest` and return its length.
    ///
    /// `dest` is swapped with the accumulator, so both allocations keep
    /// being reused.  An empty buffer leaves `dest` untouched and returns 0.
    pub fn drain(&self, dest: &mut Vec<u8>) -> usize {
        let mut pending = self.lock();
        if pending.is_empty() {
            return 0;
        }
        dest.clear();
        std::mem::swap(&mut *pending, dest);
        dest.len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // A panic while holding the lock cannot leave the Vec half-written.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Copy `source` into `buffer` until cancelled.
///
/// End-of-stream is not terminal: the pump waits and reads again.
/// Cancellation is observed at end-of-stream, so bytes that are still in
/// the pipe when the process exits are not dropped.  Returns the number of
/// bytes ingested.
pub async fn pump<R>(
    mut source: R,
    buffer: &IngestBuffer,
    op_size: usize,
    cancel: CancellationToken,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut op = vec![0u8; op_size.max(1)];
    let mut total = 0u64;

    loop {
        let read = source.read(&mut op).await?;
        if read == 0 {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(total),
                _ = tokio::time::sleep(EOF_RETRY) => continue,
            }
        }
        buffer.append(&op[..read]);
        total += read as u64;
    }
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_drain_returns_appended_bytes() {
        let buffer = IngestBuffer::new();
        buffer.append(b"hello ");
        buffer.append(b"world");
        assert!(buffer.is_data_available());
        assert_eq!(buffer.len(), 11);

        let mut dest = Vec::new();
        assert_eq!(buffer.drain(&mut dest), 11);
        assert_eq!(dest, b"hello world");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_empty_does_not_allocate() {
        let buffer = IngestBuffer::new();
        let mut dest = Vec::new();
        assert_eq!(buffer.drain(&mut dest), 0);
        assert_eq!(dest.capacity(), 0);
        assert_eq!(buffer.lock().capacity(), 0);
    }

    #[test]
    fn test_drain_reuses_allocations() {
        let buffer = IngestBuffer::new();
        let mut dest = Vec::with_capacity(4096);
        let dest_ptr = dest.as_ptr();

        buffer.append(&[1u8; 100]);
        assert_eq!(buffer.drain(&mut dest), 100);
        // the old scratch allocation now backs the accumulator
        buffer.append(&[2u8; 10]);
        assert_eq!(buffer.lock().as_ptr(), dest_ptr);

        let mut second = Vec::new();
        assert_eq!(buffer.drain(&mut second), 10);
        assert_eq!(second, vec![2u8; 10]);
    }

    #[test]
    fn test_concurrent_append_and_drain_preserve_order() {
        let buffer = Arc::new(IngestBuffer::new());
        let producer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                for i in 0..5000u32 {
                    buffer.append(&i.to_le_bytes());
                }
            })
        };

        let mut received = Vec::new();
        let mut scratch = Vec::new();
        loop {
            let done = producer.is_finished();
            let n = buffer.drain(&mut scratch);
            received.extend_from_slice(&scratch[..n]);
            if done && buffer.is_empty() {
                break;
            }
        }
        producer.join().unwrap();

        let expected: Vec<u8> = (0..5000u32).flat_map(|i| i.to_le_bytes()).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_pump_stops_on_cancel_after_eof() {
        let buffer = IngestBuffer::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let source: &[u8] = b"matroska bytes";
        let total = pump(source, &buffer, 4, cancel).await.unwrap();
        assert_eq!(total, 14);

        let mut dest = Vec::new();
        buffer.drain(&mut dest);
        assert_eq!(dest, b"matroska bytes");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_waits_at_eof_until_cancelled() {
        let buffer = Arc::new(IngestBuffer::new());
        let cancel = CancellationToken::new();
        let task = {
            let buffer = buffer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pump(&b"abc"[..], &buffer, 16, cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!task.is_finished());

        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap(), 3);
    }
}
