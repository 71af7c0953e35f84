//! Orchestrates the M3U8 Parser (§4.4): initial full-manifest load (master +
//! child playlists, variant/rendition resolution) and live playlist refresh.

pub mod parser;

use std::sync::Arc;
use url::Url;

use crate::error::{HlsError, Result};
use crate::interrupt::Interrupt;
use crate::model::{
    HlsInfo, Playlist, PlaylistType, Rendition, RenditionDisposition, RenditionKind, Variant,
};
use crate::transport::{OpenOptions, Transport};

const FETCH_CHUNK: usize = 32 * 1024;

async fn fetch_text(transport: &dyn Transport, url: &str, interrupt: &Interrupt) -> Result<String> {
    transport.open(url, &OpenOptions::default(), interrupt).await?;
    let mut buf = Vec::new();
    loop {
        let chunk = transport.read(FETCH_CHUNK, interrupt).await?;
        if chunk.is_empty() {
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    transport.close().await;
    String::from_utf8(buf).map_err(|e| HlsError::Parse(e.to_string()))
}

fn convert_rendition_kind(media_type: &m3u8_rs::AlternativeMediaType) -> RenditionKind {
    match media_type {
        m3u8_rs::AlternativeMediaType::Audio => RenditionKind::Audio,
        m3u8_rs::AlternativeMediaType::Video => RenditionKind::Video,
        m3u8_rs::AlternativeMediaType::Subtitles => RenditionKind::Subtitle,
        _ => RenditionKind::Unknown,
    }
}

fn disposition_from(alt: &m3u8_rs::AlternativeMedia) -> RenditionDisposition {
    let characteristics = alt.characteristics.as_deref().unwrap_or("");
    RenditionDisposition {
        default: alt.default,
        forced: alt.forced,
        hearing_impaired: characteristics.contains("describes-music-and-sound")
            || characteristics.contains("transcribes-spoken-dialog"),
        visual_impaired: characteristics.contains("describes-video"),
    }
}

/// Applies freshly parsed segment/init data onto an existing `Playlist`
/// record, used for both the first load and every subsequent refresh.
async fn load_playlist_body(
    transport: &dyn Transport,
    playlist: &Arc<Playlist>,
    interrupt: &Interrupt,
) -> Result<()> {
    let text = fetch_text(transport, &playlist.url, interrupt).await?;
    let base = Url::parse(&playlist.url).map_err(|e| HlsError::Parse(e.to_string()))?;
    let parsed = parser::parse_bytes(text.as_bytes())?;
    let m3u8_rs::Playlist::MediaPlaylist(media) = parsed else {
        return Err(HlsError::Parse(format!(
            "{} is a master playlist, expected a media playlist",
            playlist.url
        )));
    };
    let converted = parser::convert_media_playlist(&media, &base)?;
    playlist.apply_parsed_metadata(
        converted.playlist_type,
        converted.target_duration,
        converted.start_sequence_number,
    );
    playlist.set_finished(converted.finished);
    playlist.set_segments(converted.segments);
    for section in converted.init_sections {
        playlist.push_init_section(section);
    }
    playlist.assign_prefix_sum_pts();
    playlist.record_load();
    Ok(())
}

/// Full manifest load (§4.4 post-parse): fetches the root URL, distinguishes
/// master vs. media playlist, fetches every child playlist, resolves
/// variant/rendition attachment, and computes PTS prefix sums.
pub async fn load_manifest(
    transport: &dyn Transport,
    root_url: &str,
    interrupt: &Interrupt,
) -> Result<HlsInfo> {
    let text = fetch_text(transport, root_url, interrupt).await?;
    let base = Url::parse(root_url).map_err(|e| HlsError::Parse(e.to_string()))?;
    let parsed = parser::parse_bytes(text.as_bytes())?;

    let mut info = HlsInfo::default();

    match parsed {
        m3u8_rs::Playlist::MediaPlaylist(media) => {
            let converted = parser::convert_media_playlist(&media, &base)?;
            let playlist = info.find_or_insert_playlist(
                root_url,
                converted.playlist_type,
                converted.target_duration,
            );
            playlist.apply_parsed_metadata(
                converted.playlist_type,
                converted.target_duration,
                converted.start_sequence_number,
            );
            playlist.set_finished(converted.finished);
            playlist.set_segments(converted.segments);
            for section in converted.init_sections {
                playlist.push_init_section(section);
            }
            playlist.assign_prefix_sum_pts();
            playlist.record_load();

            info.variants.push(Arc::new(Variant {
                bandwidth: 0,
                audio_group: None,
                video_group: None,
                subtitle_group: None,
                playlists: std::sync::RwLock::new(vec![playlist]),
            }));
        }
        m3u8_rs::Playlist::MasterPlaylist(master) => {
            for alt in &master.alternatives {
                let playlist = match &alt.uri {
                    Some(uri) => {
                        let absolute = parser::resolve_url(&base, uri)?;
                        Some(info.find_or_insert_playlist(
                            &absolute,
                            PlaylistType::Unspecified,
                            0,
                        ))
                    }
                    None => None,
                };
                info.renditions.push(Arc::new(Rendition {
                    kind: convert_rendition_kind(&alt.media_type),
                    group_id: alt.group_id.clone(),
                    language: alt.language.clone(),
                    name: alt.name.clone(),
                    disposition: disposition_from(alt),
                    playlist,
                }));
            }

            for vs in &master.variants {
                let absolute = parser::resolve_url(&base, &vs.uri)?;
                let main_playlist =
                    info.find_or_insert_playlist(&absolute, PlaylistType::Unspecified, 0);
                let variant = Arc::new(Variant {
                    bandwidth: vs.bandwidth,
                    audio_group: vs.audio.clone(),
                    video_group: vs.video.clone(),
                    subtitle_group: vs.subtitles.clone(),
                    playlists: std::sync::RwLock::new(vec![main_playlist]),
                });
                for group in [&vs.audio, &vs.video, &vs.subtitles].into_iter().flatten() {
                    for rendition in &info.renditions {
                        if &rendition.group_id == group {
                            if let Some(p) = &rendition.playlist {
                                variant.attach_rendition_playlist(p.clone());
                            }
                        }
                    }
                }
                info.variants.push(variant);
            }

            for playlist in info.playlists.clone() {
                load_playlist_body(transport, &playlist, interrupt).await?;
            }
        }
    }

    Ok(info)
}

/// Live refresh (§4.4 `updatePlaylist`): reparses just this playlist's URL
/// and replaces its segment list atomically from the caller's perspective.
pub async fn refresh_playlist(
    transport: &dyn Transport,
    playlist: &Arc<Playlist>,
    interrupt: &Interrupt,
) -> Result<()> {
    load_playlist_body(transport, playlist, interrupt).await
}
