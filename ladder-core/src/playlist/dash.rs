//! DASH MPD generation for fMP4 tiers.
//!
//! The fMP4 segments written for HLS are CMAF-compatible, so the same
//! files back both protocols; the MPD only has to reference them.

use crate::domain::{EncodingTier, Quality};

#[derive(Debug, Clone)]
pub struct DashManifest {
    pub duration_sec: f64,
    pub segment_duration_sec: u32,
    pub qualities: Vec<Quality>,
    pub tier: EncodingTier,
    pub frame_rate: f64,
    pub base_url: Option<String>,
}

/// Renders a static MPD with one video AdaptationSet over the requested
/// qualities and one audio AdaptationSet built from the top rung.
pub fn mpd(manifest: &DashManifest) -> String {
    let config = manifest.tier.config();
    let tier_dir = manifest.tier.as_str();
    let frame_rate = if manifest.frame_rate > 0.0 {
        manifest.frame_rate.round() as u32
    } else {
        24
    };

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!(
        "<MPD xmlns=\"urn:mpeg:dash:schema:mpd:2011\" \
         xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" \
         xsi:schemaLocation=\"urn:mpeg:dash:schema:mpd:2011 DASH-MPD.xsd\" \
         profiles=\"urn:mpeg:dash:profile:isoff-live:2011,urn:com:dashif:dash264\" \
         type=\"static\" \
         mediaPresentationDuration=\"{}\" \
         minBufferTime=\"PT2S\">\n",
        iso8601_duration(manifest.duration_sec)
    ));

    if let Some(base_url) = &manifest.base_url {
        out.push_str(&format!("  <BaseURL>{base_url}</BaseURL>\n"));
    }

    out.push_str("  <Period>\n");
    out.push_str(
        "    <AdaptationSet mimeType=\"video/mp4\" segmentAlignment=\"true\" startWithSAP=\"1\">\n",
    );

    // Tallest rung first; origin has no fixed resolution and is skipped.
    let mut sorted: Vec<_> = manifest
        .qualities
        .iter()
        .filter_map(|q| q.params().map(|params| (*q, params)))
        .collect();
    sorted.sort_by_key(|(_, params)| std::cmp::Reverse(params.width as u64 * params.height as u64));

    let timescale_duration = manifest.segment_duration_sec * 1000;

    for (quality, params) in &sorted {
        let bandwidth = (params.video_bitrate_kbps as f64
            * config.video_codec.bitrate_multiplier())
        .ceil() as u64
            * 1000;
        out.push_str(&format!(
            "      <Representation id=\"{quality}\" bandwidth=\"{bandwidth}\" width=\"{}\" height=\"{}\" codecs=\"{}\" frameRate=\"{frame_rate}\">\n",
            params.width, params.height, config.video_codec_string
        ));
        out.push_str(&format!(
            "        <SegmentTemplate timescale=\"1000\" duration=\"{timescale_duration}\" initialization=\"{tier_dir}/{quality}_init.mp4\" media=\"{tier_dir}/{quality}_$Number%05d$.m4s\" startNumber=\"0\"/>\n"
        ));
        out.push_str("      </Representation>\n");
    }

    out.push_str("    </AdaptationSet>\n");
    out.push_str(
        "    <AdaptationSet mimeType=\"audio/mp4\" segmentAlignment=\"true\" startWithSAP=\"1\" lang=\"und\">\n",
    );

    if let Some((reference, params)) = sorted.first() {
        let bandwidth = params.audio_bitrate_kbps as u64 * 1000;
        out.push_str(&format!(
            "      <Representation id=\"audio\" bandwidth=\"{bandwidth}\" codecs=\"{}\" audioSamplingRate=\"48000\">\n",
            config.audio_codec_string
        ));
        out.push_str(
            "        <AudioChannelConfiguration schemeIdUri=\"urn:mpeg:dash:23003:3:audio_channel_configuration:2011\" value=\"2\"/>\n",
        );
        out.push_str(&format!(
            "        <SegmentTemplate timescale=\"1000\" duration=\"{timescale_duration}\" initialization=\"{tier_dir}/{reference}_init.mp4\" media=\"{tier_dir}/{reference}_$Number%05d$.m4s\" startNumber=\"0\"/>\n"
        ));
        out.push_str("      </Representation>\n");
    }

    out.push_str("    </AdaptationSet>\n");
    out.push_str("  </Period>\n");
    out.push_str("</MPD>\n");
    out
}

/// ISO-8601 duration with millisecond precision, e.g. `PT0H10M32.512S`.
pub fn iso8601_duration(total_sec: f64) -> String {
    let total_ms = (total_sec.max(0.0) * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms % 60_000) as f64 / 1000.0;
    format!("PT{hours}H{minutes}M{seconds:.3}S")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> DashManifest {
        DashManifest {
            duration_sec: 632.512,
            segment_duration_sec: 4,
            qualities: vec![Quality::Q720p, Quality::Q1080p, Quality::Origin],
            tier: EncodingTier::Modern,
            frame_rate: 29.97,
            base_url: None,
        }
    }

    #[test]
    fn mpd_is_static_with_iso_duration() {
        let content = mpd(&manifest());
        assert!(content.contains("type=\"static\""));
        assert!(content.contains("mediaPresentationDuration=\"PT0H10M32.512S\""));
    }

    #[test]
    fn representations_are_sorted_tallest_first_and_skip_origin() {
        let content = mpd(&manifest());
        let pos_1080 = content.find("id=\"1080p\"").unwrap();
        let pos_720 = content.find("id=\"720p\"").unwrap();
        assert!(pos_1080 < pos_720);
        assert!(!content.contains("id=\"origin\""));
    }

    #[test]
    fn segment_templates_reference_tier_directory() {
        let content = mpd(&manifest());
        assert!(content.contains("initialization=\"modern/1080p_init.mp4\""));
        assert!(content.contains("media=\"modern/1080p_$Number%05d$.m4s\""));
        assert!(content.contains("duration=\"4000\""));
        assert!(content.contains("startNumber=\"0\""));
    }

    #[test]
    fn bandwidth_reflects_h265_multiplier() {
        let content = mpd(&manifest());
        // 6000 kbps * 0.6 for the 1080p video representation.
        assert!(content.contains("id=\"1080p\" bandwidth=\"3600000\""));
        assert!(content.contains("codecs=\"hvc1.1.6.L120.90\""));
        assert!(content.contains("frameRate=\"30\""));
    }

    #[test]
    fn audio_set_uses_top_rung() {
        let content = mpd(&manifest());
        assert!(content.contains("id=\"audio\" bandwidth=\"256000\" codecs=\"mp4a.40.2\""));
        assert!(content.contains("initialization=\"modern/1080p_init.mp4\""));
    }

    #[test]
    fn duration_round_trips_within_a_millisecond() {
        let formatted = iso8601_duration(632.512);
        // PT0H10M32.512S
        let body = formatted
            .strip_prefix("PT")
            .and_then(|s| s.strip_suffix('S'))
            .unwrap();
        let mut parts = body.split(['H', 'M']);
        let hours: f64 = parts.next().unwrap().parse().unwrap();
        let minutes: f64 = parts.next().unwrap().parse().unwrap();
        let seconds: f64 = parts.next().unwrap().parse().unwrap();
        let total = hours * 3600.0 + minutes * 60.0 + seconds;
        assert!((total - 632.512).abs() < 0.001);
    }
}
