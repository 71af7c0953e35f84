//! Per-playlist prefetch loop, init-section cache, seek, and playlist
//! hot-swap (§4.5).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::config::HlsConfig;
use crate::error::{HlsError, Result};
use crate::interrupt::Interrupt;
use crate::key_cache::KeyCache;
use crate::media_object::MediaObject;
use crate::media_object_buffer::MediaObjectBuffer;
use crate::model::{InitSection, Micros, Playlist};
use crate::playlist;
use crate::transport::{SegmentByteReader, Transport};

/// A small FIFO cache of in-flight/recently-downloaded init-section
/// MediaObjects, keyed by absolute URL per §9's redesign note (pointer
/// identity in the source is replaced with URL identity here).
struct InitCache {
    capacity: usize,
    order: VecDeque<String>,
    objects: std::collections::HashMap<String, Arc<MediaObject>>,
}

impl InitCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            objects: std::collections::HashMap::new(),
        }
    }

    fn get(&self, url: &str) -> Option<Arc<MediaObject>> {
        self.objects.get(url).cloned()
    }

    fn insert(&mut self, url: String, obj: Arc<MediaObject>) {
        if self.objects.contains_key(&url) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.objects.remove(&oldest);
            }
        }
        self.order.push_back(url.clone());
        self.objects.insert(url, obj);
    }
}

#[derive(Default)]
struct ConsumerState {
    current_segment: Option<Arc<MediaObject>>,
    current_segment_start_pts: Option<Micros>,
    current_init: Option<Arc<MediaObject>>,
    init_offset: usize,
}

pub type BandwidthCallback = Arc<dyn Fn(&Arc<Playlist>, u64) + Send + Sync>;

pub struct Receiver {
    playlist: std::sync::RwLock<Arc<Playlist>>,
    buffer: Arc<MediaObjectBuffer>,
    config: Arc<HlsConfig>,
    transport: Arc<dyn Transport>,
    key_cache: Arc<KeyCache>,
    interrupt: Interrupt,
    current_seq: AtomicU64,
    init_cache: Mutex<InitCache>,
    consumer: Mutex<ConsumerState>,
    bandwidth_callback: Option<BandwidthCallback>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Receiver {
    pub fn new(
        playlist: Arc<Playlist>,
        parent_interrupt: &Interrupt,
        transport: Arc<dyn Transport>,
        key_cache: Arc<KeyCache>,
        config: Arc<HlsConfig>,
        bandwidth_callback: Option<BandwidthCallback>,
    ) -> Arc<Self> {
        let capacity = config.buffer_capacities.for_playlist(playlist.is_finished());
        let init_cache_capacity = config.max_init_segments;
        Arc::new(Self {
            playlist: std::sync::RwLock::new(playlist),
            buffer: Arc::new(MediaObjectBuffer::new(capacity)),
            config,
            transport,
            key_cache,
            interrupt: parent_interrupt.child(),
            current_seq: AtomicU64::new(0),
            init_cache: Mutex::new(InitCache::new(init_cache_capacity)),
            consumer: Mutex::new(ConsumerState::default()),
            bandwidth_callback,
            worker: Mutex::new(None),
        })
    }

    fn playlist(&self) -> Arc<Playlist> {
        self.playlist.read().unwrap().clone()
    }

    /// The underlying MediaObjectBuffer, for callers (and tests) that want to
    /// observe prefetched MediaObjects directly rather than through `read`.
    pub fn buffer(&self) -> Arc<MediaObjectBuffer> {
        self.buffer.clone()
    }

    /// Cursor initialisation (§4.5): VOD starts at `startSeqNo`; live starts
    /// two segments from the live edge.
    fn initial_cursor(playlist: &Playlist) -> u64 {
        let start = playlist.start_sequence_number();
        if playlist.is_finished() {
            start
        } else {
            start + playlist.segment_count().saturating_sub(2) as u64
        }
    }

    pub fn start(self: &Arc<Self>) {
        let initial = Self::initial_cursor(&self.playlist());
        self.current_seq.store(initial, Ordering::Release);
        let this = self.clone();
        let handle = tokio::spawn(async move { this.prefetch_loop().await });
        *self.worker.try_lock().unwrap() = Some(handle);
    }

    #[instrument(skip(self))]
    async fn prefetch_loop(self: Arc<Self>) {
        let playlist = self.playlist();
        let mut reload_interval = Self::reload_interval(&playlist);

        loop {
            if self.interrupt.is_cancelled() {
                break;
            }

            let playlist = self.playlist();
            if !playlist.is_finished() {
                let due = playlist
                    .last_load()
                    .map(|t| t.elapsed() >= reload_interval)
                    .unwrap_or(true);
                if due {
                    if let Err(e) = playlist::refresh_playlist(&*self.transport, &playlist, &self.interrupt).await {
                        warn!(error = %e, "playlist refresh failed, retrying next tick");
                    } else {
                        reload_interval = Self::reload_interval(&playlist);
                    }
                }
            }

            let seq = self.current_seq.load(Ordering::Acquire);
            let idx = seq.saturating_sub(playlist.start_sequence_number()) as usize;
            let segment = if idx < playlist.segment_count() {
                playlist.segment_at(idx)
            } else {
                None
            };

            let Some(segment) = segment else {
                if playlist.is_finished() && self.buffer.is_empty().await {
                    break;
                }
                tokio::select! {
                    _ = self.interrupt.cancelled() => break,
                    _ = tokio::time::sleep(self.config.prefetch_idle_sleep) => {}
                }
                if !playlist.is_finished() {
                    reload_interval = (reload_interval / 2).max(self.config.min_reload_interval);
                }
                continue;
            };

            if let Some(section) = &segment.init_section {
                let already_cached = self.init_cache.lock().await.get(&section.url).is_some();
                if !already_cached {
                    self.download_init_section(section.clone()).await;
                }
            }

            let obj = MediaObject::create_with_metadata(
                segment.url.clone(),
                segment.sequence_number,
                segment.byte_range,
                segment.encryption.clone(),
                segment.start_pts,
                segment.init_section.clone(),
                &self.interrupt,
                self.transport.clone(),
                self.key_cache.clone(),
                self.config.retry_policy.clone(),
            );
            obj.start_download();

            if self.buffer.put(obj.clone(), None).await.is_err() {
                break;
            }

            obj.wait_for_end().await;
            debug!(sequence_number = segment.sequence_number, "segment download complete");
            if let Some(cb) = &self.bandwidth_callback {
                cb(&playlist, obj.bandwidth_bps());
            }
            self.current_seq.store(seq + 1, Ordering::Release);
        }

        self.buffer.set_eos(true).await;
    }

    async fn download_init_section(&self, section: Arc<InitSection>) {
        let obj = MediaObject::create_with_metadata(
            section.url.clone(),
            0,
            section.byte_range,
            section.encryption.clone(),
            None,
            None,
            &self.interrupt,
            self.transport.clone(),
            self.key_cache.clone(),
            self.config.retry_policy.clone(),
        );
        obj.start_download();
        let mut cache = self.init_cache.lock().await;
        cache.insert(section.url.clone(), obj);
    }

    fn reload_interval(playlist: &Playlist) -> Duration {
        let count = playlist.segment_count();
        let micros = if count > 0 {
            playlist.segment_at(count - 1).map(|s| s.duration).unwrap_or(playlist.target_duration())
        } else {
            playlist.target_duration()
        };
        Duration::from_micros(micros.max(0) as u64)
    }

    /// Consumer read (§4.5): drains the init-section MediaObject via `peek`
    /// before falling through to the segment payload.
    pub async fn read(&self, len: usize) -> Result<Vec<u8>> {
        loop {
            let need_new = self.consumer.lock().await.current_segment.is_none();
            if need_new {
                let obj = self.buffer.get(None).await?;
                let mut state = self.consumer.lock().await;
                state.current_segment_start_pts = obj.start_pts();
                state.current_init = match obj.init_section() {
                    Some(section) => self.init_cache.lock().await.get(&section.url),
                    None => None,
                };
                state.init_offset = 0;
                state.current_segment = Some(obj);
            }

            let (init, offset) = {
                let state = self.consumer.lock().await;
                (state.current_init.clone(), state.init_offset)
            };

            if let Some(init_obj) = init {
                let chunk = init_obj.peek(len, offset, &self.interrupt).await?;
                if !chunk.is_empty() {
                    self.consumer.lock().await.init_offset += chunk.len();
                    return Ok(chunk);
                }
                self.consumer.lock().await.current_init = None;
            }

            let segment_obj = self.consumer.lock().await.current_segment.clone();
            let Some(segment_obj) = segment_obj else {
                continue;
            };
            match segment_obj.read(len, &self.interrupt).await {
                Ok(chunk) => return Ok(chunk),
                Err(e) => {
                    let mut state = self.consumer.lock().await;
                    state.current_segment = None;
                    state.current_init = None;
                    return Err(e);
                }
            }
        }
    }

    /// Segment start PTS of the segment currently being consumed, if known.
    pub async fn current_segment_start_pts(&self) -> Option<Micros> {
        self.consumer.lock().await.current_segment_start_pts
    }

    /// True once the owning playlist is finished, no segment is queued or
    /// being consumed, and the buffer has latched EOS: there is nothing left
    /// for this Receiver to ever deliver. Used by the façade to distinguish
    /// "segment boundary, advance" from "session truly finished" on a
    /// container-demuxer EOF (§4.6 step 1).
    pub async fn is_exhausted(&self) -> bool {
        let has_current = self.consumer.lock().await.current_segment.is_some();
        !has_current && self.buffer.is_empty().await && self.playlist().is_finished()
    }

    /// Seek (§4.5): stop the prefetch loop, compute the new cursor from the
    /// playlist's prefix-sum duration table, restart.
    pub async fn seek(self: &Arc<Self>, target: Micros) -> Result<()> {
        self.stop().await;
        let playlist = self.playlist();
        let k = playlist.seek_index_for_timestamp(target);
        self.current_seq
            .store(playlist.start_sequence_number() + k as u64, Ordering::Release);
        *self.consumer.lock().await = ConsumerState::default();
        self.buffer.set_eos(false).await;
        let this = self.clone();
        let handle = tokio::spawn(async move { this.prefetch_loop().await });
        *self.worker.lock().await = Some(handle);
        Ok(())
    }

    /// Playlist hot-swap (§4.5, §9): clamp the cursor into the new
    /// playlist's sequence range so the prefetch loop re-targets cleanly.
    pub fn swap_playlist(&self, new_playlist: Arc<Playlist>) {
        let lo = new_playlist.start_sequence_number();
        let hi = lo + new_playlist.segment_count() as u64;
        let clamped = self.current_seq.load(Ordering::Acquire).clamp(lo, hi.saturating_sub(1).max(lo));
        self.current_seq.store(clamped, Ordering::Release);
        *self.playlist.write().unwrap() = new_playlist;
    }

    /// Mirrors Session close (§5): latches EOS, flushes the buffer (deleting
    /// queued MediaObjects), joins the prefetch task, tears down the
    /// currently consumed MediaObject.
    pub async fn stop(&self) {
        self.interrupt.cancel();
        self.buffer.set_eos(true).await;
        self.buffer.flush().await;
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let mut state = self.consumer.lock().await;
        if let Some(obj) = state.current_segment.take() {
            obj.stop_download().await;
        }
        state.current_init = None;
    }
}

#[async_trait::async_trait]
impl SegmentByteReader for Receiver {
    async fn read(&self, max_len: usize, _interrupt: &Interrupt) -> Result<bytes::Bytes> {
        Receiver::read(self, max_len).await.map(bytes::Bytes::from)
    }
}
