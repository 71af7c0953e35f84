//! The parsed manifest data model (§3): HLSInfo, Variant, Rendition,
//! Playlist, Segment, InitSection.

use std::sync::{Arc, RwLock};
use std::time::Instant;

/// A microsecond-timebase duration/timestamp, as named throughout the spec.
pub type Micros = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMethod {
    None,
    Aes128,
}

#[derive(Debug, Clone)]
pub struct EncryptionInfo {
    pub method: KeyMethod,
    pub key_url: Option<String>,
    /// 16-byte IV, already resolved: either parsed from the manifest or
    /// synthesised per §3/§4.4 IV-synthesis rule.
    pub iv: [u8; 16],
}

impl EncryptionInfo {
    pub fn none() -> Self {
        Self {
            method: KeyMethod::None,
            key_url: None,
            iv: [0u8; 16],
        }
    }
}

/// Synthesise an IV for a segment/init-section lacking an explicit `IV=` per
/// §3: 12 zero bytes followed by the big-endian 32-bit sequence number.
pub fn synthesise_iv(sequence_number: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[12..16].copy_from_slice(&sequence_number.to_be_bytes());
    iv
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// -1 (represented as `None`) means "whole resource".
    pub length: Option<u64>,
    pub offset: Option<u64>,
}

impl ByteRange {
    pub const WHOLE: ByteRange = ByteRange {
        length: None,
        offset: None,
    };
}

#[derive(Debug, Clone)]
pub struct InitSection {
    pub url: String,
    pub byte_range: ByteRange,
    pub encryption: EncryptionInfo,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub url: String,
    pub sequence_number: u64,
    /// Assigned post-parse only for finished playlists (§3, §4.4 post-parse).
    pub start_pts: Option<Micros>,
    pub duration: Micros,
    pub byte_range: ByteRange,
    pub encryption: EncryptionInfo,
    pub init_section: Option<Arc<InitSection>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistType {
    Unspecified,
    Event,
    Vod,
}

#[derive(Debug)]
pub struct Playlist {
    pub url: String,
    inner: RwLock<PlaylistInner>,
}

#[derive(Debug)]
struct PlaylistInner {
    playlist_type: PlaylistType,
    target_duration: Micros,
    start_sequence_number: u64,
    finished: bool,
    segments: Vec<Segment>,
    init_sections: Vec<Arc<InitSection>>,
    last_load: Option<Instant>,
}

impl Playlist {
    pub fn new(url: String, playlist_type: PlaylistType, target_duration: Micros) -> Self {
        Self {
            url,
            inner: RwLock::new(PlaylistInner {
                playlist_type,
                target_duration,
                start_sequence_number: 0,
                finished: false,
                segments: Vec::new(),
                init_sections: Vec::new(),
                last_load: None,
            }),
        }
    }

    pub fn playlist_type(&self) -> PlaylistType {
        self.inner.read().unwrap().playlist_type
    }

    pub fn target_duration(&self) -> Micros {
        self.inner.read().unwrap().target_duration
    }

    pub fn start_sequence_number(&self) -> u64 {
        self.inner.read().unwrap().start_sequence_number
    }

    /// Re-stamps the playlist's type/target-duration/start-sequence-number
    /// from a freshly parsed manifest (§4.4 initial load and refresh both
    /// call this — the values are placeholders at `Playlist::new` time for
    /// child playlists discovered before their body has been fetched).
    pub fn apply_parsed_metadata(
        &self,
        playlist_type: PlaylistType,
        target_duration: Micros,
        start_sequence_number: u64,
    ) {
        let mut inner = self.inner.write().unwrap();
        inner.playlist_type = playlist_type;
        inner.target_duration = target_duration;
        inner.start_sequence_number = start_sequence_number;
    }

    pub fn is_finished(&self) -> bool {
        self.inner.read().unwrap().finished
    }

    pub fn set_finished(&self, finished: bool) {
        self.inner.write().unwrap().finished = finished;
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.inner.read().unwrap().segments.clone()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.read().unwrap().segments.len()
    }

    pub fn segment_at(&self, index: usize) -> Option<Segment> {
        self.inner.read().unwrap().segments.get(index).cloned()
    }

    pub fn set_segments(&self, segments: Vec<Segment>) {
        self.inner.write().unwrap().segments = segments;
    }

    pub fn record_load(&self) {
        self.inner.write().unwrap().last_load = Some(Instant::now());
    }

    pub fn last_load(&self) -> Option<Instant> {
        self.inner.read().unwrap().last_load
    }

    pub fn init_sections(&self) -> Vec<Arc<InitSection>> {
        self.inner.read().unwrap().init_sections.clone()
    }

    pub fn push_init_section(&self, section: Arc<InitSection>) {
        self.inner.write().unwrap().init_sections.push(section);
    }

    /// Fixed point for a finished playlist: start PTSs form a strictly
    /// increasing prefix sum of durations from 0 (§3, §8 invariant).
    pub fn assign_prefix_sum_pts(&self) {
        let mut inner = self.inner.write().unwrap();
        if !inner.finished {
            return;
        }
        let mut acc: Micros = 0;
        for seg in inner.segments.iter_mut() {
            seg.start_pts = Some(acc);
            acc += seg.duration;
        }
    }

    /// Lowest index `k` such that the prefix sum of durations up to and
    /// including `k` exceeds `target` (§4.5 Seek).
    pub fn seek_index_for_timestamp(&self, target: Micros) -> usize {
        let inner = self.inner.read().unwrap();
        let mut acc: Micros = 0;
        for (i, seg) in inner.segments.iter().enumerate() {
            acc += seg.duration;
            if acc > target {
                return i;
            }
        }
        inner.segments.len().saturating_sub(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenditionKind {
    Audio,
    Video,
    Subtitle,
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct RenditionDisposition {
    pub default: bool,
    pub forced: bool,
    pub hearing_impaired: bool,
    pub visual_impaired: bool,
}

#[derive(Debug)]
pub struct Rendition {
    pub kind: RenditionKind,
    pub group_id: String,
    pub language: Option<String>,
    pub name: String,
    pub disposition: RenditionDisposition,
    pub playlist: Option<Arc<Playlist>>,
}

#[derive(Debug)]
pub struct Variant {
    pub bandwidth: u64,
    pub audio_group: Option<String>,
    pub video_group: Option<String>,
    pub subtitle_group: Option<String>,
    /// Position 0 is the main stream; 1..N are rendition playlists attached
    /// during post-parse resolution (§3, §4.4).
    pub playlists: RwLock<Vec<Arc<Playlist>>>,
}

impl Variant {
    pub fn main_playlist(&self) -> Arc<Playlist> {
        self.playlists.read().unwrap()[0].clone()
    }

    pub fn attach_rendition_playlist(&self, playlist: Arc<Playlist>) {
        self.playlists.write().unwrap().push(playlist);
    }
}

#[derive(Default)]
pub struct HlsInfo {
    pub playlists: Vec<Arc<Playlist>>,
    pub variants: Vec<Arc<Variant>>,
    pub renditions: Vec<Arc<Rendition>>,
}

impl HlsInfo {
    /// Dedup rule (§3, §4.4): every new Playlist URL is resolved to absolute
    /// form and compared against existing Playlists; duplicates return the
    /// same instance.
    pub fn find_or_insert_playlist(
        &mut self,
        url: &str,
        playlist_type: PlaylistType,
        target_duration: Micros,
    ) -> Arc<Playlist> {
        if let Some(existing) = self.playlists.iter().find(|p| p.url == url) {
            return existing.clone();
        }
        let playlist = Arc::new(Playlist::new(url.to_string(), playlist_type, target_duration));
        self.playlists.push(playlist.clone());
        playlist
    }
}
