//! Capability and decision types
//!
//! Inputs and outputs of the playback decision engine: what the source looks
//! like, what the client can do, and the resulting direct-play / transcode /
//! deny verdict.

use serde::{Deserialize, Serialize};

/// Stable reason strings carried in decision records, ordered by rule
pub mod reasons {
    pub const MISSING_SOURCE_FIELDS: &str = "source_probe_incomplete";
    pub const DIRECT_PLAY_SUPPORTED: &str = "client_supports_source_directly";
    pub const CONTAINER_NOT_SUPPORTED: &str = "container_not_supported_by_client";
    pub const VIDEO_NOT_SUPPORTED: &str = "video_codec_not_supported_by_client";
    pub const AUDIO_NOT_SUPPORTED: &str = "audio_codec_not_supported_by_client";
    pub const RANGE_NOT_SUPPORTED: &str = "range_not_supported";
    pub const TRANSCODE_ALLOWED: &str = "transcode_allowed_by_policy";
    pub const TRANSCODE_FORBIDDEN: &str = "transcode_forbidden_by_policy";
    pub const HLS_NOT_SUPPORTED: &str = "hls_not_supported_by_client";
}

/// Media probe of the upstream source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceProbe {
    pub container: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub bitrate_kbps: Option<u32>,
}

/// What a client declares it can play; immutable for a given request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityProfile {
    #[serde(default)]
    pub containers: Vec<String>,
    #[serde(default)]
    pub video_codecs: Vec<String>,
    #[serde(default)]
    pub audio_codecs: Vec<String>,
    #[serde(default)]
    pub supports_hls: bool,
    /// Direct play requires this to be explicitly true; absent is not true
    pub supports_range: Option<bool>,
    pub max_video_width: Option<u32>,
    pub device_type: Option<String>,
}

/// Operator policy input to the decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPolicy {
    pub allow_transcode: bool,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        DecisionPolicy {
            allow_transcode: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionMode {
    #[serde(rename = "directPlay")]
    DirectPlay,
    #[serde(rename = "transcode")]
    Transcode,
    #[serde(rename = "deny")]
    Deny,
}

impl DecisionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionMode::DirectPlay => "directPlay",
            DecisionMode::Transcode => "transcode",
            DecisionMode::Deny => "deny",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mp4,
    Hls,
    None,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Mp4 => "mp4",
            Protocol::Hls => "hls",
            Protocol::None => "none",
        }
    }
}

/// Decision record emitted by the engine
///
/// Invariants (mechanically checked before a decision ships): deny carries
/// no outputs and protocol none; transcode is always HLS; direct play
/// requires `supports_range` explicitly true on the input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub mode: DecisionMode,
    pub protocol: Protocol,
    /// Ordered: first entry is the primary reason
    pub reasons: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_output: Option<String>,
}

impl Decision {
    pub fn primary_reason(&self) -> &str {
        self.reasons.first().map(String::as_str).unwrap_or("")
    }
}
