//! HLS master playlists, thumbnail WebVTT manifests, and VTT helpers.
//!
//! All writers here are pure string builders; stages decide where the
//! results land on disk.

pub mod dash;

use std::time::Duration;

use regex::Regex;

use crate::domain::{EncodingTier, Quality};

/// Single-tier master: one variant per quality, URIs relative to the
/// playlist (`{quality}.m3u8`). 2160p only ships when `include_4k` is
/// set. `origin` has no fixed resolution, so the attribute is omitted.
pub fn master_playlist(qualities: &[Quality], include_4k: bool) -> String {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n\n");

    for quality in qualities {
        if *quality == Quality::Q2160p && !include_4k {
            continue;
        }
        match quality.params() {
            Some(params) => {
                let bandwidth =
                    (params.video_bitrate_kbps + params.audio_bitrate_kbps) as u64 * 1000;
                out.push_str(&format!(
                    "#EXT-X-STREAM-INF:BANDWIDTH={bandwidth},RESOLUTION={}x{},NAME=\"{quality}\"\n",
                    params.width, params.height
                ));
            }
            None => {
                out.push_str(&format!(
                    "#EXT-X-STREAM-INF:BANDWIDTH=0,NAME=\"{quality}\"\n"
                ));
            }
        }
        out.push_str(&format!("{quality}.m3u8\n\n"));
    }

    out
}

/// Multi-tier master: one variant per (tier, quality) with CODECS from
/// the tier config and bandwidth scaled by the codec multiplier. Players
/// pick the best tier they can decode.
pub fn multi_tier_master_playlist(
    qualities: &[Quality],
    tiers: &[EncodingTier],
    include_4k: bool,
) -> String {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:7\n");
    out.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n\n");

    for tier in tiers {
        let config = tier.config();
        out.push_str(&format!(
            "# {tier} tier ({}/{})\n",
            config.video_codec.as_str(),
            config.audio_codec.as_str()
        ));
        for quality in qualities {
            if *quality == Quality::Q2160p && !include_4k {
                continue;
            }
            match quality.params() {
                Some(params) => {
                    let video = (params.video_bitrate_kbps as f64
                        * config.video_codec.bitrate_multiplier())
                    .ceil() as u64;
                    let bandwidth = (video + params.audio_bitrate_kbps as u64) * 1000;
                    out.push_str(&format!(
                        "#EXT-X-STREAM-INF:BANDWIDTH={bandwidth},RESOLUTION={}x{},CODECS=\"{}\",NAME=\"{quality}-{tier}\"\n",
                        params.width,
                        params.height,
                        config.codecs_attr()
                    ));
                }
                None => {
                    out.push_str(&format!(
                        "#EXT-X-STREAM-INF:BANDWIDTH=0,CODECS=\"{}\",NAME=\"{quality}-{tier}\"\n",
                        config.codecs_attr()
                    ));
                }
            }
            out.push_str(&format!("{tier}/{quality}.m3u8\n"));
        }
        out.push('\n');
    }

    out
}

/// One cue per tile cell, addressing into the mosaic with
/// `media#xywh=x,y,w,h`. `frame_count` bounds the cue list so the last
/// tile does not advertise empty cells.
pub fn thumbnail_vtt(
    tile_names: &[String],
    frame_count: usize,
    interval_sec: f64,
    width: u32,
    height: u32,
    tile_x: u32,
    tile_y: u32,
) -> String {
    let mut out = String::from("WEBVTT\n\n");
    let per_tile = (tile_x * tile_y) as usize;
    let max_cues = frame_count.min(tile_names.len() * per_tile);

    for index in 0..max_cues {
        let tile = &tile_names[index / per_tile];
        let cell = (index % per_tile) as u32;
        let x = (cell % tile_x) * width;
        let y = (cell / tile_x) * height;
        let start = Duration::from_secs_f64(index as f64 * interval_sec);
        let end = Duration::from_secs_f64((index + 1) as f64 * interval_sec);
        out.push_str(&format!(
            "{} --> {}\n{tile}#xywh={x},{y},{width},{height}\n\n",
            format_vtt_timestamp(start),
            format_vtt_timestamp(end)
        ));
    }

    out
}

pub fn format_vtt_timestamp(d: Duration) -> String {
    let total_ms = d.as_millis();
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

pub fn parse_vtt_timestamp(ts: &str) -> Option<Duration> {
    let mut parts = ts.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds_part = parts.next()?;
    let (seconds, millis): (u64, u64) = match seconds_part.split_once('.') {
        Some((s, ms)) => (s.parse().ok()?, ms.parse().ok()?),
        None => (seconds_part.parse().ok()?, 0u64),
    };
    Some(Duration::from_millis(
        hours * 3_600_000 + minutes * 60_000 + seconds * 1000 + millis,
    ))
}

/// Shifts every cue timing in a VTT document forward, used after an
/// intro clip is prepended to the renditions.
pub fn shift_vtt_timestamps(content: &str, shift: Duration) -> String {
    let cue_timing =
        Regex::new(r"(\d{2}:\d{2}:\d{2}\.\d{3})\s*-->\s*(\d{2}:\d{2}:\d{2}\.\d{3})").unwrap();
    content
        .lines()
        .map(|line| {
            if let Some(captures) = cue_timing.captures(line) {
                let start = parse_vtt_timestamp(&captures[1]);
                let end = parse_vtt_timestamp(&captures[2]);
                if let (Some(start), Some(end)) = (start, end) {
                    return format!(
                        "{} --> {}",
                        format_vtt_timestamp(start + shift),
                        format_vtt_timestamp(end + shift)
                    );
                }
            }
            line.to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_tier_master_lists_variants() {
        let content = master_playlist(&[Quality::Q480p, Quality::Q720p], true);
        assert!(content.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(content.contains(
            "#EXT-X-STREAM-INF:BANDWIDTH=1628000,RESOLUTION=854x480,NAME=\"480p\"\n480p.m3u8"
        ));
        assert!(content.contains(
            "#EXT-X-STREAM-INF:BANDWIDTH=3192000,RESOLUTION=1280x720,NAME=\"720p\"\n720p.m3u8"
        ));
    }

    #[test]
    fn origin_variant_has_no_resolution() {
        let content = master_playlist(&[Quality::Origin], true);
        assert!(content.contains("#EXT-X-STREAM-INF:BANDWIDTH=0,NAME=\"origin\"\norigin.m3u8"));
        assert!(!content.contains("RESOLUTION"));
    }

    #[test]
    fn uhd_needs_the_flag() {
        let without = master_playlist(&[Quality::Q1080p, Quality::Q2160p], false);
        assert!(!without.contains("2160p"));
        let with = master_playlist(&[Quality::Q1080p, Quality::Q2160p], true);
        assert!(with.contains("2160p.m3u8"));
    }

    #[test]
    fn multi_tier_master_scales_bandwidth_and_sets_codecs() {
        let content = multi_tier_master_playlist(
            &[Quality::Q720p],
            &[EncodingTier::Legacy, EncodingTier::Modern],
            true,
        );
        assert!(content.starts_with(
            "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-INDEPENDENT-SEGMENTS\n"
        ));
        // Legacy: (3000 + 192) kbps.
        assert!(content.contains(
            "BANDWIDTH=3192000,RESOLUTION=1280x720,CODECS=\"avc1.640028,mp4a.40.2\",NAME=\"720p-legacy\"\nlegacy/720p.m3u8"
        ));
        // Modern: (3000 * 0.6 + 192) kbps.
        assert!(content.contains(
            "BANDWIDTH=1992000,RESOLUTION=1280x720,CODECS=\"hvc1.1.6.L120.90,mp4a.40.2\",NAME=\"720p-modern\"\nmodern/720p.m3u8"
        ));
    }

    #[test]
    fn thumbnail_vtt_addresses_tile_cells() {
        let tiles = vec!["tile_000.jpg".to_string()];
        let content = thumbnail_vtt(&tiles, 3, 2.0, 160, 90, 2, 2);
        assert!(content.starts_with("WEBVTT\n\n"));
        assert!(content.contains("00:00:00.000 --> 00:00:02.000\ntile_000.jpg#xywh=0,0,160,90"));
        assert!(content.contains("00:00:02.000 --> 00:00:04.000\ntile_000.jpg#xywh=160,0,160,90"));
        assert!(content.contains("00:00:04.000 --> 00:00:06.000\ntile_000.jpg#xywh=0,90,160,90"));
        // Only three frames: the fourth cell is not advertised.
        assert!(!content.contains("xywh=160,90"));
    }

    #[test]
    fn thumbnail_vtt_spans_multiple_tiles() {
        let tiles = vec!["tile_000.jpg".to_string(), "tile_001.jpg".to_string()];
        let content = thumbnail_vtt(&tiles, 5, 1.0, 160, 90, 2, 2);
        assert!(content.contains("00:00:04.000 --> 00:00:05.000\ntile_001.jpg#xywh=0,0,160,90"));
    }

    #[test]
    fn vtt_timestamps_round_trip() {
        let ts = Duration::from_millis(3_723_456);
        let formatted = format_vtt_timestamp(ts);
        assert_eq!(formatted, "01:02:03.456");
        assert_eq!(parse_vtt_timestamp(&formatted), Some(ts));
    }

    #[test]
    fn shifting_moves_only_cue_timings() {
        let vtt = "WEBVTT\n\n00:00:01.000 --> 00:00:04.000\nHello\n\n00:01:00.500 --> 00:01:02.000\nWorld\n";
        let shifted = shift_vtt_timestamps(vtt, Duration::from_millis(2500));
        assert!(shifted.contains("00:00:03.500 --> 00:00:06.500"));
        assert!(shifted.contains("00:01:03.000 --> 00:01:04.500"));
        assert!(shifted.contains("Hello"));
        assert!(shifted.contains("World"));
        assert!(shifted.starts_with("WEBVTT"));
    }
}
