mod artifact;
mod codec;
mod error;
mod job;
mod metadata;
mod profile;

pub use artifact::{Artifact, ArtifactType};
pub use codec::{AudioCodec, ContainerFormat, EncodingTier, TierConfig, VideoCodec};
pub use error::{ConversionError, ErrorClass, ErrorCode};
pub use job::{overall_progress, Job, JobStatus, Stage};
pub use metadata::{
    is_audio_codec_supported, is_container_supported, is_video_codec_supported,
    normalize_container, AudioTrackInfo, SubtitleTrackInfo, VideoMetadata,
};
pub use profile::{
    AlgorithmParams, HlsParams, IntroParams, Profile, Quality, QualityParams, ThumbnailParams,
};
