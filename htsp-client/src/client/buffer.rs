//! Unbounded byte queue between the socket reader and the framer.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;

use htsp_protocol::LENGTH_PREFIX_SIZE;

/// A FIFO byte queue for one producer and one consumer.
///
/// The socket reader appends whatever it received; the framer waits for
/// exactly as many bytes as the next frame needs. There is no upper bound:
/// a stalled consumer lets the queue grow without limit.
pub struct ByteBuffer {
    inner: Mutex<Inner>,
    /// Wakes the consumer after an append or close.
    notify: Notify,
}

struct Inner {
    data: BytesMut,
    closed: bool,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: BytesMut::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append bytes at the back. Ignored once the buffer is closed.
    pub fn append(&self, bytes: &[u8]) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.data.extend_from_slice(bytes);
        }
        self.notify.notify_one();
    }

    /// Wait until `n` bytes are available, then remove and return them.
    ///
    /// Returns None if the buffer is closed before enough bytes arrive.
    pub async fn take_exact(&self, n: usize) -> Option<Bytes> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if inner.data.len() >= n {
                    return Some(inner.data.split_to(n).freeze());
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Wait for the four-byte big-endian length prefix of the next frame
    /// without consuming it.
    pub async fn peek_length_prefix(&self) -> Option<u32> {
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.inner.lock();
                if inner.data.len() >= LENGTH_PREFIX_SIZE {
                    let d = &inner.data;
                    return Some(u32::from_be_bytes([d[0], d[1], d[2], d[3]]));
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the buffer and wake the consumer. Buffered bytes stay readable.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of buffered bytes.
    pub fn available(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_append_take() {
        let buffer = ByteBuffer::new();

        buffer.append(&[1, 2, 3]);
        buffer.append(&[4, 5]);
        assert_eq!(buffer.available(), 5);

        let taken = buffer.take_exact(4).await.unwrap();
        assert_eq!(&taken[..], &[1, 2, 3, 4]);
        assert_eq!(buffer.available(), 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let buffer = ByteBuffer::new();
        buffer.append(&[0, 0, 1, 0, 0xAA]);

        assert_eq!(buffer.peek_length_prefix().await, Some(256));
        assert_eq!(buffer.available(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_take_waits_for_producer() {
        let buffer = Arc::new(ByteBuffer::new());

        let producer = Arc::clone(&buffer);
        let handle = tokio::spawn(async move {
            for b in 0u8..=99 {
                producer.append(&[b]);
                if b % 10 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        });

        let taken = buffer.take_exact(100).await.unwrap();
        let expected: Vec<u8> = (0u8..=99).collect();
        assert_eq!(&taken[..], &expected[..]);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_wakes_consumer() {
        let buffer = Arc::new(ByteBuffer::new());
        buffer.append(&[1, 2]);

        let closer = Arc::clone(&buffer);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });

        assert_eq!(buffer.take_exact(3).await, None);
        assert!(buffer.is_closed());

        // Bytes already buffered are still delivered.
        assert_eq!(&buffer.take_exact(2).await.unwrap()[..], &[1, 2]);

        buffer.append(&[9]);
        assert!(buffer.is_empty());
    }
}
