//! Overflow Buffer: an append-only byte log backing live output streaming.
//!
//! One buffer exists per target (local, or each server) for the lifetime of a
//! task run. Writers are serialized; readers never block on a writer and may
//! read at arbitrary offsets, including offsets past the current tail.

use std::sync::RwLock;

/// Append-only byte log with a monotonically advancing write position and a
/// one-shot `sealed` flag.
///
/// Concurrency: unlimited concurrent readers, writers serialized through a
/// single `RwLock` (writers take it exclusively, readers take it shared) per
/// §5's mutex discipline for the Overflow Buffer.
#[derive(Debug, Default)]
pub struct OverflowBuffer {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    data: Vec<u8>,
    sealed: bool,
}

/// Result of a [`OverflowBuffer::read_at`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub n: usize,
    pub eof: bool,
}

impl OverflowBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes`. Never blocks a reader. Fails only if already sealed.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, BufferSealed> {
        let mut inner = self.inner.write().expect("overflow buffer lock poisoned");
        if inner.sealed {
            return Err(BufferSealed);
        }
        inner.data.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    /// Copies bytes starting at `offset` into `dst`, returning how many bytes
    /// were copied and whether the stream has ended.
    ///
    /// If `offset` is beyond the tail and the buffer is sealed, returns eof.
    /// If `offset` is beyond the tail but not sealed, returns `n = 0` without
    /// eof — the caller should back off and retry.
    pub fn read_at(&self, dst: &mut [u8], offset: usize) -> ReadOutcome {
        let inner = self.inner.read().expect("overflow buffer lock poisoned");
        if offset >= inner.data.len() {
            return ReadOutcome {
                n: 0,
                eof: inner.sealed,
            };
        }
        let available = &inner.data[offset..];
        let n = available.len().min(dst.len());
        dst[..n].copy_from_slice(&available[..n]);
        ReadOutcome { n, eof: false }
    }

    /// Idempotent. After sealing, `write` fails and `read_at` past the tail
    /// reports eof.
    pub fn seal(&self) {
        let mut inner = self.inner.write().expect("overflow buffer lock poisoned");
        inner.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.read().expect("overflow buffer lock poisoned").sealed
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("overflow buffer lock poisoned").data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("overflow buffer is sealed")]
pub struct BufferSealed;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_at_zero_returns_all_bytes() {
        let buf = OverflowBuffer::new();
        buf.write(b"hello").unwrap();
        let mut dst = [0u8; 16];
        let out = buf.read_at(&mut dst, 0);
        assert_eq!(out, ReadOutcome { n: 5, eof: false });
        assert_eq!(&dst[..5], b"hello");
    }

    #[test]
    fn read_past_tail_unsealed_backs_off() {
        let buf = OverflowBuffer::new();
        buf.write(b"hi").unwrap();
        let mut dst = [0u8; 4];
        let out = buf.read_at(&mut dst, 2);
        assert_eq!(out, ReadOutcome { n: 0, eof: false });
    }

    #[test]
    fn read_past_tail_sealed_reports_eof() {
        let buf = OverflowBuffer::new();
        buf.write(b"hi").unwrap();
        buf.seal();
        let mut dst = [0u8; 4];
        let out = buf.read_at(&mut dst, 2);
        assert_eq!(out, ReadOutcome { n: 0, eof: true });
    }

    #[test]
    fn write_after_seal_fails() {
        let buf = OverflowBuffer::new();
        buf.seal();
        assert!(buf.write(b"too late").is_err());
    }

    #[test]
    fn seal_is_idempotent() {
        let buf = OverflowBuffer::new();
        buf.seal();
        buf.seal();
        assert!(buf.is_sealed());
    }

    #[test]
    fn concurrent_writer_and_readers_see_consistent_prefix() {
        use std::sync::Arc;
        use std::thread;

        let buf = Arc::new(OverflowBuffer::new());
        let writer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                for chunk in [b"one-".as_slice(), b"two-", b"three"] {
                    buf.write(chunk).unwrap();
                }
                buf.seal();
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let buf = Arc::clone(&buf);
            readers.push(thread::spawn(move || {
                let mut offset = 0;
                let mut collected = Vec::new();
                loop {
                    let mut dst = [0u8; 4];
                    let out = buf.read_at(&mut dst, offset);
                    if out.n == 0 {
                        if out.eof {
                            break;
                        }
                        continue;
                    }
                    collected.extend_from_slice(&dst[..out.n]);
                    offset += out.n;
                }
                collected
            }));
        }

        writer.join().unwrap();
        for r in readers {
            assert_eq!(r.join().unwrap(), b"one-two-three".to_vec());
        }
    }
}
