//! End-to-end scenarios against fake transports, standing in for the
//! external HTTP/decryption transport (§6).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use hls_pipeline::config::HlsConfig;
use hls_pipeline::error::Result;
use hls_pipeline::interrupt::Interrupt;
use hls_pipeline::key_cache::KeyCache;
use hls_pipeline::model::{ByteRange, EncryptionInfo, InitSection, KeyMethod, Playlist, PlaylistType, Segment};
use hls_pipeline::receiver::Receiver;
use hls_pipeline::transport::{OpenOptions, Transport};

/// Records every `open()` call and serves canned byte payloads by URL.
struct RecordingTransport {
    pages: HashMap<String, Vec<u8>>,
    opened_urls: Mutex<Vec<(String, OpenOptions)>>,
    cursor: Mutex<HashMap<String, usize>>,
    current: Mutex<Option<String>>,
    open_counts: Mutex<HashMap<String, u32>>,
}

impl RecordingTransport {
    fn new(pages: HashMap<String, Vec<u8>>) -> Self {
        Self {
            pages,
            opened_urls: Mutex::new(Vec::new()),
            cursor: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            open_counts: Mutex::new(HashMap::new()),
        }
    }

    fn strip_scheme(url: &str) -> &str {
        url.strip_prefix("crypto+").unwrap_or(url)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn open(&self, url: &str, options: &OpenOptions, _interrupt: &Interrupt) -> Result<String> {
        self.opened_urls.lock().unwrap().push((url.to_string(), options.clone()));
        let plain = Self::strip_scheme(url).to_string();
        *self.open_counts.lock().unwrap().entry(plain.clone()).or_insert(0) += 1;
        self.cursor.lock().unwrap().insert(plain.clone(), 0);
        *self.current.lock().unwrap() = Some(plain);
        Ok(url.to_string())
    }

    async fn read(&self, max_len: usize, _interrupt: &Interrupt) -> Result<Bytes> {
        let url = self.current.lock().unwrap().clone().unwrap();
        let page = self.pages.get(&url).cloned().unwrap_or_default();
        let mut cursor = self.cursor.lock().unwrap();
        let pos = cursor.entry(url).or_insert(0);
        if *pos >= page.len() {
            return Ok(Bytes::new());
        }
        let end = (*pos + max_len).min(page.len());
        let chunk = Bytes::copy_from_slice(&page[*pos..end]);
        *pos = end;
        Ok(chunk)
    }

    async fn close(&self) {}
}

fn seg(url: &str, seq: u64, encryption: EncryptionInfo, init: Option<Arc<InitSection>>) -> Segment {
    Segment {
        url: url.to_string(),
        sequence_number: seq,
        start_pts: Some(seq as i64 * 4_000_000),
        duration: 4_000_000,
        byte_range: ByteRange::WHOLE,
        encryption,
        init_section: init,
    }
}

/// Scenario 2: live playlist with 5 segments, sequence 100..104. First
/// consumed segment must have sequence 103 (= 100 + max(5-2,0)).
#[tokio::test]
async fn live_edge_start_picks_sequence_103() {
    let playlist = Arc::new(Playlist::new(
        "http://host/live.m3u8".into(),
        PlaylistType::Unspecified,
        4_000_000,
    ));
    let segments: Vec<_> = (100..105)
        .map(|seq| seg(&format!("http://host/seg{seq}.ts"), seq, EncryptionInfo::none(), None))
        .collect();
    playlist.set_segments(segments);
    playlist.record_load();

    let mut pages = HashMap::new();
    for seq in 100..105 {
        pages.insert(format!("http://host/seg{seq}.ts"), b"x".to_vec());
    }
    let transport = Arc::new(RecordingTransport::new(pages));

    let config = Arc::new(HlsConfig::default());
    let receiver = Receiver::new(
        playlist,
        &Interrupt::new(),
        transport,
        Arc::new(KeyCache::from_config(&config)),
        config,
        None,
    );
    receiver.start();

    let obj = receiver.buffer().get(None).await.unwrap();
    assert_eq!(obj.sequence_number(), 103);
    receiver.stop().await;
}

/// Scenario 4: segment with no IV tag, sequence number 0x01020304, AES-128
/// key URL. Expect `crypto+<url>` with the exact key/IV hex values.
#[tokio::test]
async fn aes128_segment_opens_with_exact_key_and_iv_hex() {
    let mut pages = HashMap::new();
    pages.insert("http://host/key".to_string(), b"0123456789abcdef".to_vec());
    pages.insert("http://host/seg.ts".to_string(), b"payload".to_vec());
    let transport = Arc::new(RecordingTransport::new(pages));

    let encryption = EncryptionInfo {
        method: KeyMethod::Aes128,
        key_url: Some("http://host/key".into()),
        iv: hls_pipeline::model::synthesise_iv(0x01020304),
    };

    let config = HlsConfig::default();
    let obj = hls_pipeline::media_object::MediaObject::create(
        "http://host/seg.ts".into(),
        0x01020304,
        ByteRange::WHOLE,
        encryption,
        &Interrupt::new(),
        transport.clone(),
        Arc::new(KeyCache::from_config(&config)),
    );
    obj.start_download();
    obj.wait_for_end().await;

    let opened = transport.opened_urls.lock().unwrap().clone();
    let segment_open = opened
        .iter()
        .find(|(url, _)| url.starts_with("crypto+"))
        .expect("segment should open with crypto+ scheme");
    assert_eq!(segment_open.0, "crypto+http://host/seg.ts");
    assert_eq!(segment_open.1.key_hex.as_deref(), Some("30313233343536373839616263646566"));
    assert_eq!(segment_open.1.iv_hex.as_deref(), Some("00000000000000000000000001020304"));
}

/// Scenario 6: two consecutive segments sharing an InitSection. The init
/// section must be downloaded exactly once.
#[tokio::test]
async fn shared_init_section_is_downloaded_exactly_once() {
    let init = Arc::new(InitSection {
        url: "http://host/init.mp4".into(),
        byte_range: ByteRange::WHOLE,
        encryption: EncryptionInfo::none(),
    });

    let playlist = Arc::new(Playlist::new(
        "http://host/vod.m3u8".into(),
        PlaylistType::Vod,
        4_000_000,
    ));
    playlist.set_finished(true);
    playlist.set_segments(vec![
        seg("http://host/seg0.mp4", 0, EncryptionInfo::none(), Some(init.clone())),
        seg("http://host/seg1.mp4", 1, EncryptionInfo::none(), Some(init.clone())),
    ]);
    playlist.record_load();

    let mut pages = HashMap::new();
    pages.insert("http://host/init.mp4".to_string(), b"INIT".to_vec());
    pages.insert("http://host/seg0.mp4".to_string(), b"seg0-body".to_vec());
    pages.insert("http://host/seg1.mp4".to_string(), b"seg1-body".to_vec());
    let transport = Arc::new(RecordingTransport::new(pages));

    let config = Arc::new(HlsConfig::default());
    let receiver = Receiver::new(
        playlist,
        &Interrupt::new(),
        transport.clone(),
        Arc::new(KeyCache::from_config(&config)),
        config,
        None,
    );
    receiver.start();

    // Drain both segments through the consumer read path.
    for _ in 0..2 {
        loop {
            match receiver.read(64).await {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
    receiver.stop().await;

    let counts = transport.open_counts.lock().unwrap();
    assert_eq!(counts.get("http://host/init.mp4").copied().unwrap_or(0), 1);
}

/// Scenario 1 (partial, at the Playlist level): a finished VOD playlist of
/// three 4-second segments has total duration 12s via the prefix-sum PTS
/// invariant, matching what the façade's `duration()` reports.
#[tokio::test]
async fn vod_playlist_duration_is_sum_of_segment_durations() {
    let playlist = Playlist::new("http://host/vod.m3u8".into(), PlaylistType::Vod, 4_000_000);
    playlist.set_finished(true);
    playlist.set_segments(vec![
        seg("http://host/a.ts", 0, EncryptionInfo::none(), None),
        seg("http://host/b.ts", 1, EncryptionInfo::none(), None),
        seg("http://host/c.ts", 2, EncryptionInfo::none(), None),
    ]);
    playlist.assign_prefix_sum_pts();
    let segments = playlist.segments();
    let last = segments.last().unwrap();
    let duration = last.start_pts.unwrap() + last.duration;
    assert_eq!(duration, 12_000_000);
}

/// Scenario 5: finished playlist with four 3-second segments, seek to 7s
/// lands on the segment covering t in [6,9), i.e. `startSeqNo + 2`.
#[tokio::test]
async fn seek_to_seven_seconds_lands_on_third_segment() {
    let playlist = Arc::new(Playlist::new(
        "http://host/vod.m3u8".into(),
        PlaylistType::Vod,
        3_000_000,
    ));
    playlist.set_finished(true);
    playlist.set_segments(
        (0..4)
            .map(|seq| Segment {
                url: format!("http://host/seg{seq}.ts"),
                sequence_number: seq,
                start_pts: None,
                duration: 3_000_000,
                byte_range: ByteRange::WHOLE,
                encryption: EncryptionInfo::none(),
                init_section: None,
            })
            .collect(),
    );
    playlist.record_load();

    let mut pages = HashMap::new();
    for seq in 0..4 {
        pages.insert(format!("http://host/seg{seq}.ts"), b"x".to_vec());
    }
    let transport = Arc::new(RecordingTransport::new(pages));

    let config = Arc::new(HlsConfig::default());
    let receiver = Receiver::new(
        playlist,
        &Interrupt::new(),
        transport,
        Arc::new(KeyCache::from_config(&config)),
        config,
        None,
    );
    receiver.start();
    receiver.seek(7_000_000).await.unwrap();

    let obj = receiver.buffer().get(None).await.unwrap();
    assert_eq!(obj.sequence_number(), 2);
    receiver.stop().await;
}
