//! Transcode profile specification
//!
//! A `ProfileSpec` is immutable for the lifetime of a session. Profiles are
//! defined in configuration (plus built-in defaults) and referenced by name
//! in start intents.

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Audio bitrates at or above this support 5.1-or-stereo layout selection;
/// below it the encoder is forced to stereo.
pub const SURROUND_BITRATE_K: u32 = 160;

/// Immutable per-session transcode parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileSpec {
    pub name: String,

    /// Re-encode video instead of stream copy
    #[serde(default)]
    pub transcode_video: bool,

    #[serde(default = "default_video_codec")]
    pub video_codec: String,

    #[serde(default = "default_video_crf")]
    pub video_crf: u8,

    /// Cap the output width, preserving aspect; implies transcode
    #[serde(default)]
    pub video_max_width: Option<u32>,

    #[serde(default = "default_audio_bitrate_k")]
    pub audio_bitrate_k: u32,

    /// 0 = live-only rolling window
    #[serde(default)]
    pub dvr_window_sec: u32,

    #[serde(default)]
    pub vod: bool,

    #[serde(default)]
    pub llhls: bool,

    /// yadif(1) deinterlace, preserving temporal resolution; implies transcode
    #[serde(default)]
    pub deinterlace: bool,

    #[serde(default = "default_segment_duration")]
    pub segment_duration_sec: u32,
}

fn default_video_codec() -> String {
    "h264".to_string()
}

fn default_video_crf() -> u8 {
    23
}

fn default_audio_bitrate_k() -> u32 {
    128
}

fn default_segment_duration() -> u32 {
    4
}

impl ProfileSpec {
    /// Built-in profile used when a start intent names no profile
    pub fn builtin_live() -> Self {
        ProfileSpec {
            name: "live-h264-aac-2s".to_string(),
            transcode_video: false,
            video_codec: default_video_codec(),
            video_crf: default_video_crf(),
            video_max_width: None,
            audio_bitrate_k: default_audio_bitrate_k(),
            dvr_window_sec: 0,
            vod: false,
            llhls: false,
            deinterlace: false,
            segment_duration_sec: 2,
        }
    }

    /// Whether any video re-encode is in effect (requested, width cap, LLHLS
    /// or deinterlace all force it)
    pub fn video_transcode_active(&self) -> bool {
        self.transcode_video || self.video_max_width.is_some() || self.llhls || self.deinterlace
    }

    /// fMP4 segmentation (init.mp4 + .m4s) is used for LL-HLS output
    pub fn uses_fmp4(&self) -> bool {
        self.llhls
    }

    pub fn segment_extension(&self) -> &'static str {
        if self.uses_fmp4() { "m4s" } else { "ts" }
    }

    /// Whether finished sessions keep their segments (DVR window or VOD)
    pub fn retains_output(&self) -> bool {
        self.vod || self.dvr_window_sec > 0
    }

    /// 5.1-or-stereo layout selection instead of forced stereo
    pub fn allows_surround(&self) -> bool {
        self.audio_bitrate_k >= SURROUND_BITRATE_K
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.is_empty() {
            return Err(AppError::validation("profile name must not be empty"));
        }
        if self.llhls && self.vod {
            return Err(AppError::validation(format!(
                "profile {:?}: at most one of llhls/vod may be set",
                self.name
            )));
        }
        if !(1..=30).contains(&self.segment_duration_sec) {
            return Err(AppError::validation(format!(
                "profile {:?}: segment duration must be 1-30s, got {}",
                self.name, self.segment_duration_sec
            )));
        }
        if self.transcode_video && self.video_codec != "h264" {
            return Err(AppError::validation(format!(
                "profile {:?}: unsupported video codec {:?}",
                self.name, self.video_codec
            )));
        }
        if self.video_crf > 51 {
            return Err(AppError::validation(format!(
                "profile {:?}: video crf must be 0-51",
                self.name
            )));
        }
        if self.audio_bitrate_k == 0 || self.audio_bitrate_k > 640 {
            return Err(AppError::validation(format!(
                "profile {:?}: audio bitrate must be 1-640 kbit/s",
                self.name
            )));
        }
        Ok(())
    }
}
