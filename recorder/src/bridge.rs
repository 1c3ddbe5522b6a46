//! Stream bridge – an in-memory `Write` sink between the archive writer,
//! which pushes bytes as they are produced, and the uploader, which wants
//! everything produced since the last upload as one block.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Cloneable handle to the current destination buffer.
///
/// The archive writer owns one clone and writes through it; the segment
/// loop owns another and moves the buffer out with [`take`](Self::take),
/// uploads it, then hands the same allocation back with
/// [`rebind`](Self::rebind).
#[derive(Debug, Clone, Default)]
pub struct StreamBridge {
    dest: Arc<Mutex<Vec<u8>>>,
}

impl StreamBridge {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            dest: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
        }
    }

    #[cfg(test)]
    /// Bytes written since the last rebind.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move the bound buffer out, leaving an unallocated one in its place.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.lock())
    }

    /// Bind `buf`, cleared, as the new destination.
    pub fn rebind(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut dest = self.lock();
        debug_assert!(dest.is_empty(), "bridge written to while unbound");
        *dest = buf;
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.dest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for StreamBridge {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
