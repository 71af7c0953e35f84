//! Single-pass, line-oriented M3U8 parsing (§4.4), built on `m3u8-rs` for
//! tag/attribute tokenizing plus the business logic the spec layers on top:
//! key/IV carry-forward, BYTERANGE offset inference, IV synthesis, and
//! post-parse PTS prefix-summing.

use std::sync::Arc;
use url::Url;

use crate::error::{HlsError, Result};
use crate::model::{
    ByteRange, EncryptionInfo, InitSection, KeyMethod as OurKeyMethod, Micros, PlaylistType,
    Segment, synthesise_iv,
};

pub(crate) fn resolve_url(base: &Url, maybe_relative: &str) -> Result<String> {
    base.join(maybe_relative)
        .map(|u| u.to_string())
        .map_err(|e| HlsError::Parse(format!("invalid URI {maybe_relative}: {e}")))
}

fn to_micros(seconds: f32) -> Micros {
    (seconds as f64 * 1_000_000.0).round() as Micros
}

fn parse_hex_iv(s: &str) -> Result<[u8; 16]> {
    let trimmed = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    let bytes = hex::decode(trimmed).map_err(|e| HlsError::InvalidIv(e.to_string()))?;
    if bytes.len() != 16 {
        return Err(HlsError::InvalidIv(format!("expected 16 bytes, got {}", bytes.len())));
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn convert_key_method(method: &m3u8_rs::KeyMethod) -> OurKeyMethod {
    match method {
        m3u8_rs::KeyMethod::AES128 => OurKeyMethod::Aes128,
        _ => OurKeyMethod::None,
    }
}

/// Resolve a [`m3u8_rs::Key`] (the currently active `#EXT-X-KEY`) plus a
/// sequence number into concrete [`EncryptionInfo`], synthesising the IV per
/// §3/§4.4 when the manifest doesn't supply one.
fn resolve_encryption(
    key: Option<&m3u8_rs::Key>,
    base: &Url,
    sequence_number: u64,
) -> Result<EncryptionInfo> {
    let Some(key) = key else {
        return Ok(EncryptionInfo::none());
    };
    let method = convert_key_method(&key.method);
    if method == OurKeyMethod::None {
        return Ok(EncryptionInfo::none());
    }
    let key_url = key
        .uri
        .as_deref()
        .map(|u| resolve_url(base, u))
        .transpose()?;
    let iv = match &key.iv {
        Some(hex_iv) => parse_hex_iv(hex_iv)?,
        None => synthesise_iv(sequence_number as u32),
    };
    Ok(EncryptionInfo {
        method,
        key_url,
        iv,
    })
}

pub struct ParsedMediaPlaylist {
    pub playlist_type: PlaylistType,
    pub finished: bool,
    pub target_duration: Micros,
    pub start_sequence_number: u64,
    pub segments: Vec<Segment>,
    pub init_sections: Vec<Arc<InitSection>>,
}

/// Convert an already-parsed [`m3u8_rs::MediaPlaylist`] into our model,
/// applying key/IV carry-forward, BYTERANGE inference, and init-section
/// dedup-by-URL (§4.4).
pub fn convert_media_playlist(
    media: &m3u8_rs::MediaPlaylist,
    base: &Url,
) -> Result<ParsedMediaPlaylist> {
    let playlist_type = match media.playlist_type {
        Some(m3u8_rs::MediaPlaylistType::Vod) => PlaylistType::Vod,
        Some(m3u8_rs::MediaPlaylistType::Event) => PlaylistType::Event,
        None => PlaylistType::Unspecified,
    };

    let mut segments = Vec::with_capacity(media.segments.len());
    let mut init_sections: Vec<Arc<InitSection>> = Vec::new();
    let mut init_by_url: std::collections::HashMap<String, Arc<InitSection>> =
        std::collections::HashMap::new();

    let mut active_key: Option<m3u8_rs::Key> = None;
    let mut active_map: Option<Arc<InitSection>> = None;
    let mut prev_range_end: Option<u64> = None;

    for (i, seg) in media.segments.iter().enumerate() {
        let sequence_number = media.media_sequence + i as u64;

        if let Some(key) = &seg.key {
            active_key = Some(key.clone());
        }

        let encryption = resolve_encryption(active_key.as_ref(), base, sequence_number)?;

        let byte_range = match &seg.byte_range {
            None => {
                prev_range_end = None;
                ByteRange::WHOLE
            }
            Some(br) => {
                let offset = br.offset.unwrap_or_else(|| prev_range_end.unwrap_or(0));
                prev_range_end = Some(offset + br.length);
                ByteRange {
                    length: Some(br.length),
                    offset: Some(offset),
                }
            }
        };

        if let Some(map) = &seg.map {
            let url = resolve_url(base, &map.uri)?;
            let section = if let Some(existing) = init_by_url.get(&url) {
                existing.clone()
            } else {
                let map_encryption = resolve_encryption(active_key.as_ref(), base, sequence_number)?;
                let map_range = match &map.byte_range {
                    None => ByteRange::WHOLE,
                    Some(br) => ByteRange {
                        length: Some(br.length),
                        offset: br.offset,
                    },
                };
                let section = Arc::new(InitSection {
                    url: url.clone(),
                    byte_range: map_range,
                    encryption: map_encryption,
                });
                init_by_url.insert(url, section.clone());
                init_sections.push(section.clone());
                section
            };
            active_map = Some(section);
        }

        let url = resolve_url(base, &seg.uri)?;
        segments.push(Segment {
            url,
            sequence_number,
            start_pts: None,
            duration: to_micros(seg.duration),
            byte_range,
            encryption,
            init_section: active_map.clone(),
        });
    }

    Ok(ParsedMediaPlaylist {
        playlist_type,
        finished: media.end_list,
        target_duration: to_micros(media.target_duration),
        start_sequence_number: media.media_sequence,
        segments,
        init_sections,
    })
}

/// Hard-parse-errors on a missing `#EXTM3U` header (m3u8-rs itself enforces
/// this); everything else unrecognised is silently skipped (§4.4, §7).
pub fn parse_bytes(bytes: &[u8]) -> Result<m3u8_rs::Playlist> {
    m3u8_rs::parse_playlist_res(bytes).map_err(|e| HlsError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://example.com/path/index.m3u8").unwrap()
    }

    #[test]
    fn missing_extm3u_header_is_a_parse_error() {
        let result = parse_bytes(b"not a playlist\n");
        assert!(result.is_err());
    }

    #[test]
    fn media_playlist_parses_segments_and_endlist() {
        let text = b"#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\n#EXT-X-ENDLIST\n";
        let parsed = parse_bytes(text).unwrap();
        let m3u8_rs::Playlist::MediaPlaylist(media) = parsed else {
            panic!("expected media playlist")
        };
        let converted = convert_media_playlist(&media, &base()).unwrap();
        assert!(converted.finished);
        assert_eq!(converted.segments.len(), 2);
        assert_eq!(converted.segments[0].url, "http://example.com/path/seg0.ts");
        assert_eq!(converted.segments[0].duration, 4_000_000);
    }

    #[test]
    fn key_carries_forward_until_replaced() {
        let text = b"#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-KEY:METHOD=AES-128,URI=\"key1\"\n#EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\n#EXT-X-ENDLIST\n";
        let parsed = parse_bytes(text).unwrap();
        let m3u8_rs::Playlist::MediaPlaylist(media) = parsed else {
            panic!("expected media playlist")
        };
        let converted = convert_media_playlist(&media, &base()).unwrap();
        assert_eq!(converted.segments[0].encryption.method, OurKeyMethod::Aes128);
        assert_eq!(converted.segments[1].encryption.method, OurKeyMethod::Aes128);
        assert_eq!(
            converted.segments[0].encryption.key_url.as_deref(),
            Some("http://example.com/path/key1")
        );
    }

    #[test]
    fn iv_is_synthesised_when_absent() {
        let text = b"#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:16909060\n#EXT-X-KEY:METHOD=AES-128,URI=\"key1\"\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n";
        let parsed = parse_bytes(text).unwrap();
        let m3u8_rs::Playlist::MediaPlaylist(media) = parsed else {
            panic!("expected media playlist")
        };
        let converted = convert_media_playlist(&media, &base()).unwrap();
        // sequence number 16909060 = 0x01020304
        let expected: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0x02, 0x03, 0x04];
        assert_eq!(converted.segments[0].encryption.iv, expected);
    }

    #[test]
    fn byterange_offset_is_inferred_from_previous_segment() {
        let text = b"#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-BYTERANGE:1000@0\n#EXTINF:4.0,\nseg.ts\n#EXT-X-BYTERANGE:500\n#EXTINF:4.0,\nseg.ts\n#EXT-X-ENDLIST\n";
        let parsed = parse_bytes(text).unwrap();
        let m3u8_rs::Playlist::MediaPlaylist(media) = parsed else {
            panic!("expected media playlist")
        };
        let converted = convert_media_playlist(&media, &base()).unwrap();
        assert_eq!(converted.segments[0].byte_range.offset, Some(0));
        assert_eq!(converted.segments[0].byte_range.length, Some(1000));
        assert_eq!(converted.segments[1].byte_range.offset, Some(1000));
        assert_eq!(converted.segments[1].byte_range.length, Some(500));
    }

    #[test]
    fn init_section_is_reused_by_url_across_segments() {
        let text = b"#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-MAP:URI=\"init.mp4\"\n#EXTINF:4.0,\nseg0.mp4\n#EXTINF:4.0,\nseg1.mp4\n#EXT-X-ENDLIST\n";
        let parsed = parse_bytes(text).unwrap();
        let m3u8_rs::Playlist::MediaPlaylist(media) = parsed else {
            panic!("expected media playlist")
        };
        let converted = convert_media_playlist(&media, &base()).unwrap();
        assert_eq!(converted.init_sections.len(), 1);
        let a = converted.segments[0].init_section.as_ref().unwrap();
        let b = converted.segments[1].init_section.as_ref().unwrap();
        assert!(Arc::ptr_eq(a, b));
    }
}
