//! Process-wide AES-128 key cache, FIFO-bounded at `max_key_store_size`
//! (§4.2: MAX_KEY_STORE_SIZE = 3). Recast per §9 as an explicitly-initialised
//! service object rather than ambient global state.

use std::collections::VecDeque;
use tokio::sync::Mutex;

use crate::config::HlsConfig;

struct Inner {
    capacity: usize,
    order: VecDeque<String>,
    bytes: std::collections::HashMap<String, [u8; 16]>,
}

pub struct KeyCache {
    inner: Mutex<Inner>,
}

impl KeyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity: capacity.max(1),
                order: VecDeque::new(),
                bytes: std::collections::HashMap::new(),
            }),
        }
    }

    /// Sizes the cache from `HlsConfig::max_key_store_size` rather than a
    /// bare literal, so the builder override in `HlsConfig` is honoured.
    pub fn from_config(config: &HlsConfig) -> Self {
        Self::new(config.max_key_store_size)
    }

    pub async fn get(&self, url: &str) -> Option<[u8; 16]> {
        self.inner.lock().await.bytes.get(url).copied()
    }

    /// Insert, FIFO-evicting the oldest entry if at capacity.
    pub async fn insert(&self, url: String, key: [u8; 16]) {
        let mut inner = self.inner.lock().await;
        if inner.bytes.contains_key(&url) {
            return;
        }
        if inner.order.len() >= inner.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.bytes.remove(&oldest);
            }
        }
        inner.order.push_back(url.clone());
        inner.bytes.insert(url, key);
    }
}
