//! Single-producer/single-consumer byte FIFO of heterogeneous blocks (§4.1).
//!
//! Built on `tokio::sync::Mutex` + `tokio::sync::Notify` rather than a raw
//! mutex+condvar pair, per the redesign note in §9: the contract (blocking
//! read/peek until data-or-EOS, unconditional non-blocking write, sticky EOS,
//! flush) is what must be preserved, not the original primitives.

use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

use crate::interrupt::Interrupt;

struct Inner {
    blocks: VecDeque<Vec<u8>>,
    /// Byte offset already consumed from the front block (read), independent
    /// of what `peek` has looked at.
    head_offset: usize,
    eos: bool,
}

/// A single-producer/single-consumer byte FIFO.
pub struct BufferedStream {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl BufferedStream {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                blocks: VecDeque::new(),
                head_offset: 0,
                eos: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append one block. Never blocks; wakes any reader.
    pub async fn write(&self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().await;
        inner.blocks.push_back(bytes);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Consume up to `len` bytes in order. Blocks while empty-and-not-EOS.
    /// Returns the bytes actually copied (empty iff EOS observed on an empty
    /// stream).
    pub async fn read(&self, len: usize, interrupt: &Interrupt) -> Result<Vec<u8>, crate::error::HlsError> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if Self::available(&inner) > 0 {
                    return Ok(Self::drain(&mut inner, len));
                }
                if inner.eos {
                    return Ok(Vec::new());
                }
            }
            tokio::select! {
                _ = interrupt.cancelled() => return Err(crate::error::HlsError::Cancelled),
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Non-destructive read of `len` bytes starting `offset` bytes past the
    /// current head. Blocks on empty-and-not-EOS like `read`.
    pub async fn peek(
        &self,
        len: usize,
        offset: usize,
        interrupt: &Interrupt,
    ) -> Result<Vec<u8>, crate::error::HlsError> {
        loop {
            {
                let inner = self.inner.lock().await;
                let available = Self::available(&inner);
                if available > offset {
                    return Ok(Self::copy_from(&inner, offset, len));
                }
                if inner.eos {
                    return Ok(Vec::new());
                }
            }
            tokio::select! {
                _ = interrupt.cancelled() => return Err(crate::error::HlsError::Cancelled),
                _ = self.notify.notified() => {}
            }
        }
    }

    pub async fn set_eos(&self, flag: bool) {
        let mut inner = self.inner.lock().await;
        inner.eos = flag;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Drop all blocks; retains the EOS flag.
    pub async fn flush(&self) {
        let mut inner = self.inner.lock().await;
        inner.blocks.clear();
        inner.head_offset = 0;
    }

    fn available(inner: &Inner) -> usize {
        inner.blocks.iter().map(|b| b.len()).sum::<usize>() - inner.head_offset
    }

    fn drain(inner: &mut Inner, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let Some(front) = inner.blocks.front() else {
                break;
            };
            let take = (front.len() - inner.head_offset).min(len - out.len());
            out.extend_from_slice(&front[inner.head_offset..inner.head_offset + take]);
            inner.head_offset += take;
            if inner.head_offset == front.len() {
                inner.blocks.pop_front();
                inner.head_offset = 0;
            }
        }
        out
    }

    fn copy_from(inner: &Inner, offset: usize, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut skip = inner.head_offset + offset;
        for block in inner.blocks.iter() {
            if out.len() >= len {
                break;
            }
            if skip >= block.len() {
                skip -= block.len();
                continue;
            }
            let start = skip;
            let take = (block.len() - start).min(len - out.len());
            out.extend_from_slice(&block[start..start + take]);
            skip = 0;
        }
        out
    }
}

impl Default for BufferedStream {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::collection::vec as pvec;
    use proptest::prelude::*;

    /// Write order is preserved regardless of how the input is chunked into
    /// blocks, and regardless of how the consumer slices its reads.
    fn order_preserved(write_chunks: Vec<Vec<u8>>, read_sizes: Vec<usize>) -> bool {
        let expected: Vec<u8> = write_chunks.iter().flatten().copied().collect();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async move {
            let stream = BufferedStream::new();
            for chunk in write_chunks {
                stream.write(chunk).await;
            }
            stream.set_eos(true).await;

            let interrupt = Interrupt::new();
            let mut got = Vec::new();
            let mut sizes = read_sizes.into_iter().cycle();
            loop {
                let len = sizes.next().unwrap_or(1).max(1);
                let chunk = stream.read(len, &interrupt).await.unwrap();
                if chunk.is_empty() {
                    break;
                }
                got.extend(chunk);
            }
            got == expected
        })
    }

    proptest! {
        #[test]
        fn read_reassembles_written_bytes_in_order(
            write_chunks in pvec(pvec(any::<u8>(), 0..8), 0..8),
            read_sizes in pvec(1usize..5, 1..8),
        ) {
            prop_assert!(order_preserved(write_chunks, read_sizes));
        }
    }
}
