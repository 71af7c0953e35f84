//! Bounded FIFO of MediaObject references with full/empty/EOS/timeout
//! signalling (§4.3).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::error::{HlsError, Result};
use crate::media_object::MediaObject;

/// `-1` in the source's "wait indefinitely" timeout convention.
pub const WAIT_INDEFINITELY: Option<Duration> = None;

struct Inner {
    capacity: usize,
    items: VecDeque<Arc<MediaObject>>,
    eos: bool,
}

pub struct MediaObjectBuffer {
    inner: Mutex<Inner>,
    not_full: Notify,
    not_empty: Notify,
}

impl MediaObjectBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity,
                items: VecDeque::new(),
                eos: false,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
        }
    }

    /// `put(obj, timeout)`: blocks while full and not-EOS. `timeout = Some(0)`
    /// fails fast with `Full`; `None` waits indefinitely; otherwise an
    /// absolute deadline relative to the call.
    pub async fn put(&self, obj: Arc<MediaObject>, timeout: Option<Duration>) -> Result<()> {
        if timeout == Some(Duration::ZERO) {
            let mut inner = self.inner.lock().await;
            if inner.eos {
                return Err(HlsError::Eos);
            }
            if inner.items.len() >= inner.capacity {
                return Err(HlsError::Full);
            }
            inner.items.push_back(obj);
            drop(inner);
            self.not_empty.notify_waiters();
            return Ok(());
        }

        let deadline = timeout.map(|d| tokio::time::Instant::now() + d);
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.eos {
                    return Err(HlsError::Eos);
                }
                if inner.items.len() < inner.capacity {
                    inner.items.push_back(obj);
                    drop(inner);
                    self.not_empty.notify_waiters();
                    return Ok(());
                }
            }
            if let Some(deadline) = deadline {
                tokio::select! {
                    _ = self.not_full.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => return Err(HlsError::BufferTimeout),
                }
            } else {
                self.not_full.notified().await;
            }
        }
    }

    /// `get(timeout)`: dual of `put`, blocks while empty-and-not-EOS.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Arc<MediaObject>> {
        let deadline = timeout.map(|d| tokio::time::Instant::now() + d);
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.not_full.notify_waiters();
                    return Ok(item);
                }
                if inner.eos {
                    return Err(HlsError::Eos);
                }
            }
            if timeout == Some(Duration::ZERO) {
                return Err(HlsError::Empty);
            }
            if let Some(deadline) = deadline {
                tokio::select! {
                    _ = self.not_empty.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => return Err(HlsError::BufferTimeout),
                }
            } else {
                self.not_empty.notified().await;
            }
        }
    }

    pub async fn set_eos(&self, flag: bool) {
        let mut inner = self.inner.lock().await;
        inner.eos = flag;
        drop(inner);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Deletes (stops the download of) any contained MediaObjects.
    pub async fn flush(&self) {
        let items: Vec<_> = {
            let mut inner = self.inner.lock().await;
            inner.items.drain(..).collect()
        };
        for item in items {
            item.stop_download().await;
        }
        self.not_full.notify_waiters();
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.items.is_empty()
    }

    pub async fn is_full(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.items.len() >= inner.capacity
    }

    pub async fn status(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        (inner.capacity, inner.capacity - inner.items.len())
    }
}
