//! Pure construction of transcoder argv. Nothing here touches the
//! filesystem or spawns processes; every function maps inputs to a
//! `BuiltCommand` the runner can execute.

use std::path::{Path, PathBuf};

use crate::domain::{
    ContainerFormat, EncodingTier, Profile, Quality, QualityParams, VideoCodec, VideoMetadata,
};

use super::encryption::EncryptionInfo;

const DEFAULT_GOP: u32 = 48;

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltCommand {
    pub args: Vec<String>,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CommandBuilder {
    enable_gpu: bool,
    h265_preset: String,
    h265_crf: u8,
}

impl CommandBuilder {
    pub fn new(enable_gpu: bool, h265_preset: impl Into<String>, h265_crf: u8) -> Self {
        Self {
            enable_gpu,
            h265_preset: h265_preset.into(),
            h265_crf,
        }
    }

    /// Transcode the source into one MP4 at `(quality, tier)`.
    pub fn transcode(
        &self,
        input: &Path,
        output_dir: &Path,
        quality: Quality,
        tier: EncodingTier,
        metadata: &VideoMetadata,
        profile: &Profile,
    ) -> BuiltCommand {
        let output_path = output_dir.join(format!("{quality}.mp4"));
        let mut args = vec!["-y".to_string()];

        if self.enable_gpu {
            push(&mut args, ["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"]);
        }

        push(&mut args, ["-i", &input.to_string_lossy()]);
        push(&mut args, ["-progress", "pipe:1", "-stats_period", "1"]);

        let gop = effective_gop(profile);
        match (tier.config().video_codec, self.enable_gpu) {
            (VideoCodec::H264, false) => self.h264_cpu_args(&mut args, quality, gop),
            (VideoCodec::H264, true) => self.h264_gpu_args(&mut args, quality, gop),
            (VideoCodec::H265, false) => self.h265_cpu_args(&mut args, quality, gop),
            (VideoCodec::H265, true) => self.h265_gpu_args(&mut args, quality, gop),
        }

        self.audio_args(&mut args, metadata, profile);

        push(&mut args, ["-movflags", "+faststart"]);
        args.push(output_path.to_string_lossy().into_owned());

        BuiltCommand { args, output_path }
    }

    fn h264_cpu_args(&self, args: &mut Vec<String>, quality: Quality, gop: u32) {
        push(
            args,
            [
                "-c:v", "libx264", "-preset", "slower", "-crf", "23", "-profile:v", "high",
                "-level", "4.1", "-threads", "2",
            ],
        );
        if let Some(params) = quality.params() {
            push(args, ["-vf", &cpu_scale_filter(&params)]);
            bitrate_args(args, &params, VideoCodec::H264);
        }
        push(args, ["-g", &gop.to_string()]);
        push(args, ["-keyint_min", &gop.to_string(), "-sc_threshold", "0"]);
    }

    fn h264_gpu_args(&self, args: &mut Vec<String>, quality: Quality, gop: u32) {
        push(
            args,
            [
                "-c:v",
                "h264_nvenc",
                "-preset",
                "p2",
                "-tune",
                "hq",
                "-rc",
                "vbr",
                "-cq",
                "23",
                "-b_ref_mode",
                "middle",
                "-spatial_aq",
                "1",
                "-temporal_aq",
                "1",
            ],
        );
        if let Some(params) = quality.params() {
            push(args, ["-vf", &gpu_scale_filter(&params)]);
            bitrate_args(args, &params, VideoCodec::H264);
        }
        push(args, ["-g", &gop.to_string()]);
    }

    fn h265_cpu_args(&self, args: &mut Vec<String>, quality: Quality, gop: u32) {
        push(
            args,
            [
                "-c:v",
                "libx265",
                "-preset",
                &self.h265_preset,
                "-crf",
                &self.h265_crf.to_string(),
                "-tag:v",
                "hvc1",
                "-x265-params",
                "log-level=error:pools=2",
                "-threads",
                "2",
            ],
        );
        if let Some(params) = quality.params() {
            push(args, ["-vf", &cpu_scale_filter(&params)]);
            bitrate_args(args, &params, VideoCodec::H265);
        }
        push(args, ["-g", &gop.to_string()]);
        push(args, ["-keyint_min", &gop.to_string(), "-sc_threshold", "0"]);
    }

    fn h265_gpu_args(&self, args: &mut Vec<String>, quality: Quality, gop: u32) {
        push(
            args,
            [
                "-c:v",
                "hevc_nvenc",
                "-preset",
                "p2",
                "-tune",
                "hq",
                "-rc",
                "vbr",
                "-cq",
                &self.h265_crf.to_string(),
                "-tag:v",
                "hvc1",
                "-b_ref_mode",
                "middle",
                "-spatial_aq",
                "1",
                "-temporal_aq",
                "1",
            ],
        );
        if let Some(params) = quality.params() {
            push(args, ["-vf", &gpu_scale_filter(&params)]);
            bitrate_args(args, &params, VideoCodec::H265);
        }
        push(args, ["-g", &gop.to_string()]);
    }

    fn audio_args(&self, args: &mut Vec<String>, metadata: &VideoMetadata, profile: &Profile) {
        push(args, ["-c:a", "aac", "-ar", "48000", "-ac", "2", "-b:a", "192k"]);
        if metadata.needs_downmix() {
            let filter = format!("aresample=async={}", profile.algorithm.aresample_async);
            push(args, ["-af", &filter]);
        }
    }

    /// Copy-only HLS segmentation of an already-transcoded MP4.
    pub fn hls_segment(
        &self,
        input: &Path,
        output_dir: &Path,
        quality_label: &str,
        segment_duration_sec: u32,
        tier: EncodingTier,
        encryption: Option<&EncryptionInfo>,
    ) -> BuiltCommand {
        let config = tier.config();
        let playlist_path = output_dir.join(format!("{quality_label}.m3u8"));
        let segment_pattern = output_dir.join(format!(
            "{quality_label}_%05d{}",
            config.container.segment_extension()
        ));

        let mut args = vec!["-y".to_string()];
        push(&mut args, ["-i", &input.to_string_lossy()]);
        push(&mut args, ["-c", "copy", "-f", "hls"]);
        push(&mut args, ["-hls_time", &segment_duration_sec.to_string()]);
        push(&mut args, ["-hls_playlist_type", "vod"]);
        if config.container == ContainerFormat::Fmp4 {
            push(&mut args, ["-hls_segment_type", "fmp4"]);
            push(
                &mut args,
                ["-hls_fmp4_init_filename", &format!("{quality_label}_init.mp4")],
            );
        }
        push(
            &mut args,
            ["-hls_segment_filename", &segment_pattern.to_string_lossy()],
        );
        push(&mut args, ["-hls_list_size", "0"]);
        if let Some(encryption) = encryption {
            push(
                &mut args,
                ["-hls_key_info_file", &encryption.key_info_path.to_string_lossy()],
            );
        }
        push(&mut args, ["-progress", "pipe:1"]);
        args.push(playlist_path.to_string_lossy().into_owned());

        BuiltCommand {
            args,
            output_path: playlist_path,
        }
    }

    /// Stream-mapped WebVTT export for one subtitle stream.
    pub fn subtitle_extract(
        &self,
        input: &Path,
        output_path: &Path,
        stream_index: u32,
    ) -> BuiltCommand {
        let mut args = vec!["-y".to_string()];
        push(&mut args, ["-i", &input.to_string_lossy()]);
        push(&mut args, ["-map", &format!("0:{stream_index}")]);
        push(&mut args, ["-c:s", "webvtt"]);
        args.push(output_path.to_string_lossy().into_owned());
        BuiltCommand {
            args,
            output_path: output_path.to_path_buf(),
        }
    }

    /// Frame extraction at a fixed sampling interval.
    pub fn thumbnails(
        &self,
        input: &Path,
        output_pattern: &Path,
        interval_sec: f64,
        width: u32,
        height: u32,
    ) -> BuiltCommand {
        let mut args = vec!["-y".to_string()];
        push(&mut args, ["-i", &input.to_string_lossy()]);
        push(
            &mut args,
            [
                "-vf",
                &format!("fps=1/{interval_sec},scale={width}:{height}"),
                "-vsync",
                "vfr",
            ],
        );
        push(&mut args, ["-progress", "pipe:1"]);
        args.push(output_pattern.to_string_lossy().into_owned());
        BuiltCommand {
            args,
            output_path: output_pattern.to_path_buf(),
        }
    }

    /// Packs a concat list of frames into one `tile_x`×`tile_y` mosaic.
    pub fn tile(
        &self,
        concat_list: &Path,
        output_path: &Path,
        tile_x: u32,
        tile_y: u32,
    ) -> BuiltCommand {
        let mut args = vec!["-y".to_string()];
        push(&mut args, ["-f", "concat", "-safe", "0"]);
        push(&mut args, ["-i", &concat_list.to_string_lossy()]);
        push(&mut args, ["-vf", &format!("tile={tile_x}x{tile_y}")]);
        args.push(output_path.to_string_lossy().into_owned());
        BuiltCommand {
            args,
            output_path: output_path.to_path_buf(),
        }
    }

    /// Two-input concat producing a single re-encoded MP4 (intro prepend).
    pub fn concat(&self, intro: &Path, main: &Path, output_path: &Path) -> BuiltCommand {
        let mut args = vec!["-y".to_string()];
        push(&mut args, ["-i", &intro.to_string_lossy()]);
        push(&mut args, ["-i", &main.to_string_lossy()]);
        push(
            &mut args,
            [
                "-filter_complex",
                "[0:v:0][0:a:0][1:v:0][1:a:0]concat=n=2:v=1:a=1[outv][outa]",
                "-map",
                "[outv]",
                "-map",
                "[outa]",
                "-c:v",
                "libx264",
                "-preset",
                "slower",
                "-crf",
                "23",
                "-threads",
                "2",
                "-c:a",
                "aac",
                "-b:a",
                "192k",
                "-progress",
                "pipe:1",
            ],
        );
        args.push(output_path.to_string_lossy().into_owned());
        BuiltCommand {
            args,
            output_path: output_path.to_path_buf(),
        }
    }
}

/// `ceil(base × multiplier)`, preserving the `k` suffix convention.
pub fn scale_bitrate_kbps(base_kbps: u32, codec: VideoCodec) -> u32 {
    (base_kbps as f64 * codec.bitrate_multiplier()).ceil() as u32
}

fn bitrate_args(args: &mut Vec<String>, params: &QualityParams, codec: VideoCodec) {
    push(
        args,
        [
            "-b:v",
            &format!("{}k", scale_bitrate_kbps(params.video_bitrate_kbps, codec)),
            "-maxrate",
            &format!("{}k", scale_bitrate_kbps(params.max_bitrate_kbps, codec)),
            "-bufsize",
            &format!("{}k", scale_bitrate_kbps(params.bufsize_kbps, codec)),
        ],
    );
}

fn cpu_scale_filter(params: &QualityParams) -> String {
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
        w = params.width,
        h = params.height
    )
}

fn gpu_scale_filter(params: &QualityParams) -> String {
    // -2 keeps the height even, which both encoders require.
    format!("scale_npp=w={}:h=-2:interp_algo=super", params.width)
}

fn effective_gop(profile: &Profile) -> u32 {
    if profile.algorithm.gop == 0 {
        DEFAULT_GOP
    } else {
        profile.algorithm.gop
    }
}

fn push<const N: usize>(args: &mut Vec<String>, items: [&str; N]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AudioTrackInfo;

    fn metadata_with_channels(channels: u32) -> VideoMetadata {
        VideoMetadata {
            width: 1920,
            height: 1080,
            audio_tracks: vec![AudioTrackInfo {
                channels,
                ..AudioTrackInfo::default()
            }],
            ..VideoMetadata::default()
        }
    }

    #[test]
    fn cpu_h264_transcode_uses_slow_preset_and_scale_pad() {
        let builder = CommandBuilder::new(false, "medium", 26);
        let cmd = builder.transcode(
            Path::new("/tmp/in.mp4"),
            Path::new("/tmp/out"),
            Quality::Q720p,
            EncodingTier::Legacy,
            &metadata_with_channels(2),
            &Profile::default(),
        );
        let joined = cmd.args.join(" ");
        assert!(joined.contains("-c:v libx264 -preset slower -crf 23"));
        assert!(joined.contains(
            "scale=1280:720:force_original_aspect_ratio=decrease,pad=1280:720:(ow-iw)/2:(oh-ih)/2"
        ));
        assert!(joined.contains("-b:v 3000k -maxrate 4000k -bufsize 6000k"));
        assert!(joined.contains("-g 48 -keyint_min 48 -sc_threshold 0"));
        assert!(joined.contains("-c:a aac -ar 48000 -ac 2 -b:a 192k"));
        assert!(joined.contains("-movflags +faststart"));
        assert!(!joined.contains("aresample"));
        assert_eq!(cmd.output_path, Path::new("/tmp/out/720p.mp4"));
    }

    #[test]
    fn modern_tier_scales_bitrates_down() {
        let builder = CommandBuilder::new(false, "slow", 28);
        let cmd = builder.transcode(
            Path::new("/tmp/in.mp4"),
            Path::new("/tmp/out"),
            Quality::Q1080p,
            EncodingTier::Modern,
            &metadata_with_channels(2),
            &Profile::default(),
        );
        let joined = cmd.args.join(" ");
        assert!(joined.contains("-c:v libx265 -preset slow -crf 28 -tag:v hvc1"));
        // 6000/8000/12000 kbps at the 0.6 multiplier.
        assert!(joined.contains("-b:v 3600k -maxrate 4800k -bufsize 7200k"));
    }

    #[test]
    fn gpu_path_enables_cuda_decode_and_nvenc() {
        let builder = CommandBuilder::new(true, "medium", 26);
        let cmd = builder.transcode(
            Path::new("/tmp/in.mp4"),
            Path::new("/tmp/out"),
            Quality::Q480p,
            EncodingTier::Legacy,
            &metadata_with_channels(2),
            &Profile::default(),
        );
        let joined = cmd.args.join(" ");
        assert!(joined.starts_with("-y -hwaccel cuda -hwaccel_output_format cuda"));
        assert!(joined.contains("-c:v h264_nvenc -preset p2 -tune hq -rc vbr -cq 23"));
        assert!(joined.contains("-spatial_aq 1 -temporal_aq 1"));
        assert!(joined.contains("scale_npp=w=854:h=-2:interp_algo=super"));
    }

    #[test]
    fn origin_quality_skips_scaling_and_bitrate_caps() {
        let builder = CommandBuilder::new(false, "medium", 26);
        let cmd = builder.transcode(
            Path::new("/tmp/in.mp4"),
            Path::new("/tmp/out"),
            Quality::Origin,
            EncodingTier::Legacy,
            &metadata_with_channels(2),
            &Profile::default(),
        );
        let joined = cmd.args.join(" ");
        assert!(!joined.contains("-vf"));
        assert!(!joined.contains("-maxrate"));
        assert_eq!(cmd.output_path, Path::new("/tmp/out/origin.mp4"));
    }

    #[test]
    fn surround_audio_gets_async_resample() {
        let builder = CommandBuilder::new(false, "medium", 26);
        let cmd = builder.transcode(
            Path::new("/tmp/in.mkv"),
            Path::new("/tmp/out"),
            Quality::Q720p,
            EncodingTier::Legacy,
            &metadata_with_channels(6),
            &Profile::default(),
        );
        assert!(cmd.args.join(" ").contains("-af aresample=async=1000"));
    }

    #[test]
    fn ts_segmenter_is_copy_only() {
        let builder = CommandBuilder::new(false, "medium", 26);
        let cmd = builder.hls_segment(
            Path::new("/tmp/720p.mp4"),
            Path::new("/tmp/hls/legacy"),
            "720p",
            4,
            EncodingTier::Legacy,
            None,
        );
        let joined = cmd.args.join(" ");
        assert!(joined.contains("-c copy -f hls -hls_time 4 -hls_playlist_type vod"));
        assert!(joined.contains("720p_%05d.ts"));
        assert!(!joined.contains("fmp4"));
        assert_eq!(cmd.output_path, Path::new("/tmp/hls/legacy/720p.m3u8"));
    }

    #[test]
    fn fmp4_segmenter_names_init_segment() {
        let builder = CommandBuilder::new(false, "medium", 26);
        let cmd = builder.hls_segment(
            Path::new("/tmp/720p.mp4"),
            Path::new("/tmp/hls/modern"),
            "720p",
            6,
            EncodingTier::Modern,
            None,
        );
        let joined = cmd.args.join(" ");
        assert!(joined.contains("-hls_segment_type fmp4"));
        assert!(joined.contains("-hls_fmp4_init_filename 720p_init.mp4"));
        assert!(joined.contains("720p_%05d.m4s"));
        assert!(joined.contains("-hls_time 6"));
    }

    #[test]
    fn encryption_adds_key_info_file() {
        let builder = CommandBuilder::new(false, "medium", 26);
        let encryption = EncryptionInfo {
            key: vec![0u8; 16],
            iv: vec![0u8; 16],
            key_path: "/tmp/hls/encryption.key".into(),
            key_info_path: "/tmp/hls/encryption.keyinfo".into(),
            key_url: "enc.key".into(),
        };
        let cmd = builder.hls_segment(
            Path::new("/tmp/480p.mp4"),
            Path::new("/tmp/hls"),
            "480p",
            4,
            EncodingTier::Legacy,
            Some(&encryption),
        );
        assert!(cmd
            .args
            .join(" ")
            .contains("-hls_key_info_file /tmp/hls/encryption.keyinfo"));
    }

    #[test]
    fn subtitle_extract_maps_stream_index() {
        let builder = CommandBuilder::new(false, "medium", 26);
        let cmd = builder.subtitle_extract(
            Path::new("/tmp/in.mkv"),
            Path::new("/tmp/subs/eng.vtt"),
            3,
        );
        let joined = cmd.args.join(" ");
        assert!(joined.contains("-map 0:3 -c:s webvtt"));
    }

    #[test]
    fn thumbnail_and_tile_filters() {
        let builder = CommandBuilder::new(false, "medium", 26);
        let thumbs = builder.thumbnails(
            Path::new("/tmp/in.mp4"),
            Path::new("/tmp/thumbs/thumb_%05d.jpg"),
            2.5,
            160,
            90,
        );
        assert!(thumbs.args.join(" ").contains("fps=1/2.5,scale=160:90"));

        let tile = builder.tile(
            Path::new("/tmp/thumbs/tile_000_concat.txt"),
            Path::new("/tmp/thumbs/tile_000.jpg"),
            5,
            5,
        );
        let joined = tile.args.join(" ");
        assert!(joined.contains("-f concat -safe 0"));
        assert!(joined.contains("tile=5x5"));
    }

    #[test]
    fn bitrate_scaling_rounds_up() {
        assert_eq!(scale_bitrate_kbps(1500, VideoCodec::H265), 900);
        assert_eq!(scale_bitrate_kbps(2500, VideoCodec::H265), 1500);
        // 2000 * 0.6 = 1200 exactly; 1999 * 0.6 = 1199.4 rounds up.
        assert_eq!(scale_bitrate_kbps(1999, VideoCodec::H265), 1200);
        assert_eq!(scale_bitrate_kbps(3000, VideoCodec::H264), 3000);
    }
}
