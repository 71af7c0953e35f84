//! Demuxer façade (§4.6): one Session per Playlist in the chosen Variant,
//! bandwidth-driven variant switching, and DTS-ordered packet merge across
//! sessions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument};

use crate::config::{HlsConfig, VariantSelectionPolicy};
use crate::error::{HlsError, Result};
use crate::interrupt::Interrupt;
use crate::key_cache::KeyCache;
use crate::model::{Micros, Variant};
use crate::receiver::Receiver;
use crate::transport::{ContainerDemuxer, DemuxedPacket, Transport, AV_PKT_FLAG_SEGMENT_CHANGED};

/// 33-bit modular comparison: `a` precedes `b` if stepping forward from `a`
/// to `b` (mod 2^33) is less than half the modulus. Handles MPEG-TS PTS
/// wraparound and inter-session discontinuity (§4.6, §9).
pub fn dts_precedes(a: i64, b: i64) -> bool {
    const MASK: i64 = (1i64 << 33) - 1;
    let am = a & MASK;
    let bm = b & MASK;
    let forward = (bm - am) & MASK;
    forward != 0 && forward < (1i64 << 32)
}

/// Builds a fresh demuxer instance; invoked once per Session at open and
/// again at every segment boundary.
pub type DemuxerFactory = Arc<dyn Fn() -> Box<dyn ContainerDemuxer> + Send + Sync>;

struct Session {
    receiver: Arc<Receiver>,
    demuxer: AsyncMutex<Box<dyn ContainerDemuxer>>,
    demuxer_factory: DemuxerFactory,
    queued_packet: AsyncMutex<Option<DemuxedPacket>>,
    segment_changed: AtomicBool,
    at_eof: AtomicBool,
    stream_map: AsyncMutex<std::collections::HashMap<usize, usize>>,
    /// Per-stream "segment start PTS" (§3): the start PTS of the segment
    /// currently backing this session's sub-demuxer, refreshed from the
    /// Receiver on every segment advance so boundary detection has a
    /// reference point independent of the raw packet PTS stream.
    segment_start_pts: AsyncMutex<Option<Micros>>,
}

/// Picks the variant with the highest bandwidth strictly less than
/// `measured`, ties broken by smallest positive shortfall (§4.6, §8
/// "variant selection idempotence").
pub fn select_variant_for_bandwidth(variants: &[Arc<Variant>], measured: u64) -> Option<usize> {
    variants
        .iter()
        .enumerate()
        .filter(|(_, v)| v.bandwidth < measured)
        .min_by_key(|(_, v)| measured - v.bandwidth)
        .map(|(i, _)| i)
}

pub struct Facade {
    variants: Vec<Arc<Variant>>,
    sessions: AsyncMutex<Vec<Arc<Session>>>,
    current_variant_index: AtomicUsize,
    probing: AtomicBool,
    transport: Arc<dyn Transport>,
    key_cache: Arc<KeyCache>,
    config: Arc<HlsConfig>,
    interrupt: Interrupt,
    manual_index: Option<usize>,
    next_outward_id: AtomicUsize,
    pending_seek: AsyncMutex<Option<(Micros, Option<usize>)>>,
}

impl Facade {
    pub fn new(
        variants: Vec<Arc<Variant>>,
        transport: Arc<dyn Transport>,
        key_cache: Arc<KeyCache>,
        config: Arc<HlsConfig>,
        interrupt: Interrupt,
        manual_index: Option<usize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            variants,
            sessions: AsyncMutex::new(Vec::new()),
            current_variant_index: AtomicUsize::new(0),
            probing: AtomicBool::new(true),
            transport,
            key_cache,
            config,
            interrupt,
            manual_index,
            next_outward_id: AtomicUsize::new(0),
            pending_seek: AsyncMutex::new(None),
        })
    }

    /// Host entrypoint "open" (§6): opens one Session per Playlist in the
    /// chosen Variant (position 0 main, rest renditions), with probing
    /// suppressed for variant switching.
    pub async fn open(
        self: &Arc<Self>,
        demuxer_factory: impl Fn() -> Box<dyn ContainerDemuxer> + Send + Sync + 'static,
    ) -> Result<()> {
        let demuxer_factory: DemuxerFactory = Arc::new(demuxer_factory);
        let index = self
            .manual_index
            .unwrap_or(0)
            .min(self.variants.len().saturating_sub(1));
        self.current_variant_index.store(index, Ordering::Release);
        let variant = self.variants[index].clone();

        let mut sessions = Vec::new();
        let playlists = variant.playlists.read().unwrap().clone();
        for (i, playlist) in playlists.iter().enumerate() {
            let callback = if i == 0 {
                let this = self.clone();
                Some(Arc::new(move |_playlist: &Arc<crate::model::Playlist>, bw: u64| {
                    this.on_main_bandwidth_observed(bw);
                }) as crate::receiver::BandwidthCallback)
            } else {
                None
            };
            let receiver = Receiver::new(
                playlist.clone(),
                &self.interrupt,
                self.transport.clone(),
                self.key_cache.clone(),
                self.config.clone(),
                callback,
            );
            receiver.start();
            let mut demuxer = demuxer_factory();
            demuxer.open(&*receiver, &self.interrupt).await?;
            sessions.push(Arc::new(Session {
                receiver,
                demuxer: AsyncMutex::new(demuxer),
                demuxer_factory: demuxer_factory.clone(),
                queued_packet: AsyncMutex::new(None),
                segment_changed: AtomicBool::new(false),
                at_eof: AtomicBool::new(false),
                stream_map: AsyncMutex::new(std::collections::HashMap::new()),
                segment_start_pts: AsyncMutex::new(None),
            }));
        }
        *self.sessions.lock().await = sessions;
        self.probing.store(false, Ordering::Release);
        Ok(())
    }

    fn on_main_bandwidth_observed(self: &Arc<Self>, measured: u64) {
        if self.probing.load(Ordering::Acquire) {
            return;
        }
        let Some(new_index) = select_variant_for_bandwidth(&self.variants, measured) else {
            return;
        };
        if new_index == self.current_variant_index.load(Ordering::Acquire) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.switch_to_variant(new_index).await;
        });
    }

    async fn switch_to_variant(&self, new_index: usize) {
        let sessions = self.sessions.lock().await;
        let Some(main) = sessions.first() else { return };
        let new_playlist = self.variants[new_index].main_playlist();
        info!(new_index, "switching main-stream variant");
        main.receiver.swap_playlist(new_playlist);
        self.current_variant_index.store(new_index, Ordering::Release);
    }

    /// `read_packet` (§4.6): polls every session, merges by minimum DTS under
    /// 33-bit modular comparison, flags segment boundaries.
    #[instrument(skip(self))]
    pub async fn read_packet(&self) -> Result<Option<DemuxedPacket>> {
        let sessions = self.sessions.lock().await.clone();
        if sessions.is_empty() {
            return Ok(None);
        }

        let pending_seek = self.pending_seek.lock().await.clone();

        for session in &sessions {
            if session.at_eof.load(Ordering::Acquire) {
                continue;
            }
            loop {
                if self.interrupt.is_cancelled() {
                    return Err(HlsError::Cancelled);
                }
                if session.queued_packet.lock().await.is_some() {
                    break;
                }
                let mut demuxer = session.demuxer.lock().await;
                match demuxer.read_packet(&*session.receiver, &self.interrupt).await {
                    Ok(Some(mut pkt)) => {
                        if let Some((target, stream)) = &pending_seek {
                            let on_seeked_stream = stream.map(|s| s == pkt.stream_index).unwrap_or(true);
                            if on_seeked_stream && dts_precedes(pkt.dts, *target) {
                                continue;
                            }
                        }
                        let outward = {
                            let mut map = session.stream_map.lock().await;
                            *map.entry(pkt.stream_index).or_insert_with(|| {
                                self.next_outward_id.fetch_add(1, Ordering::AcqRel)
                            })
                        };
                        pkt.stream_index = outward;
                        if session.segment_changed.swap(false, Ordering::AcqRel) {
                            pkt.flags |= AV_PKT_FLAG_SEGMENT_CHANGED;
                        }
                        *session.queued_packet.lock().await = Some(pkt);
                        break;
                    }
                    Ok(None) => {
                        if session.receiver.is_exhausted().await {
                            session.at_eof.store(true, Ordering::Release);
                            break;
                        }
                        let mut fresh = (session.demuxer_factory)();
                        if let Err(e) = fresh.open(&*session.receiver, &self.interrupt).await {
                            debug!(error = %e, "failed to reopen demuxer at segment boundary");
                            session.at_eof.store(true, Ordering::Release);
                            break;
                        }
                        demuxer.close().await;
                        *demuxer = fresh;
                        *session.segment_start_pts.lock().await =
                            session.receiver.current_segment_start_pts().await;
                        session.segment_changed.store(true, Ordering::Release);
                        debug!("session advanced to next segment, demuxer reopened");
                        continue;
                    }
                    Err(HlsError::Cancelled) => return Err(HlsError::Cancelled),
                    Err(e) => {
                        debug!(error = %e, "session read error, treating as session EOF");
                        session.at_eof.store(true, Ordering::Release);
                        break;
                    }
                }
            }
        }

        if pending_seek.is_some() {
            *self.pending_seek.lock().await = None;
        }

        let mut best: Option<(usize, i64)> = None;
        for (i, session) in sessions.iter().enumerate() {
            let Some(pkt) = session.queued_packet.lock().await.clone() else {
                continue;
            };
            best = match best {
                None => Some((i, pkt.dts)),
                Some((_, best_dts)) if dts_precedes(pkt.dts, best_dts) => Some((i, pkt.dts)),
                other => other,
            };
        }

        let Some((idx, _)) = best else {
            return Ok(None);
        };
        let pkt = sessions[idx].queued_packet.lock().await.take();
        Ok(pkt)
    }

    /// Seek (§4.5 + §4.6): stops every Receiver, seeks each to `target`, and
    /// arms the "drop packets before target" filter for the next reads.
    pub async fn seek(self: &Arc<Self>, target: Micros, stream: Option<usize>) -> Result<()> {
        let sessions = self.sessions.lock().await.clone();
        for session in &sessions {
            session.receiver.seek(target).await?;
            *session.queued_packet.lock().await = None;
            session.at_eof.store(false, Ordering::Release);
        }
        *self.pending_seek.lock().await = Some((target, stream));
        Ok(())
    }

    pub async fn close(&self) {
        let sessions = self.sessions.lock().await.clone();
        for session in &sessions {
            session.demuxer.lock().await.close().await;
            session.receiver.stop().await;
        }
        self.interrupt.cancel();
    }

    /// Total duration (§6 "open"): only computable when the main playlist is
    /// finished, per the prefix-sum PTS invariant (§8 scenario 1).
    pub fn duration(&self) -> Option<Micros> {
        let variant = &self.variants[self.current_variant_index.load(Ordering::Acquire)];
        let playlist = variant.main_playlist();
        if !playlist.is_finished() {
            return None;
        }
        let segments = playlist.segments();
        let last = segments.last()?;
        Some(last.start_pts.unwrap_or(0) + last.duration)
    }
}
