//! FFmpeg argument synthesis
//!
//! Builds the full argument vector for one HLS transcode child from a
//! profile. Arguments are passed as a vector, never through a shell, and any
//! session id that fails the safety regex is rejected before a path is ever
//! derived from it.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use crate::errors::RunnerError;
use crate::models::ProfileSpec;

/// URL-safe, at most 64 chars, no leading separator material
static SESSION_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("session id regex"));

/// Number of segments advertised in a live rolling playlist
const LIVE_LIST_SIZE: u32 = 6;

pub fn validate_session_id(id: &str) -> Result<(), RunnerError> {
    if SESSION_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(RunnerError::UnsafeSessionId(id.to_string()))
    }
}

/// Builds the ffmpeg argument vector for a session
pub struct HlsCommandBuilder<'a> {
    profile: &'a ProfileSpec,
    session_dir: &'a Path,
}

impl<'a> HlsCommandBuilder<'a> {
    pub fn new(profile: &'a ProfileSpec, session_dir: &'a Path) -> Self {
        HlsCommandBuilder {
            profile,
            session_dir,
        }
    }

    pub fn build(&self) -> Vec<String> {
        let mut args = Vec::new();
        self.add_global_args(&mut args);
        self.add_input_args(&mut args);
        self.add_mapping_args(&mut args);
        self.add_video_args(&mut args);
        self.add_audio_args(&mut args);
        self.add_hls_args(&mut args);
        args
    }

    fn add_global_args(&self, args: &mut Vec<String>) {
        args.extend(
            ["-hide_banner", "-nostats", "-loglevel", "warning", "-y"]
                .map(str::to_string),
        );
    }

    /// DVB streams send late codec headers and broken timestamps; regenerate
    /// PTS, skip input buffering, tolerate soft decoder errors, and give the
    /// container probe a 2 s / 5 MB budget.
    fn add_input_args(&self, args: &mut Vec<String>) {
        args.extend(
            [
                "-fflags",
                "+genpts+nobuffer+discardcorrupt",
                "-err_detect",
                "ignore_err",
                "-analyzeduration",
                "2000000",
                "-probesize",
                "5000000",
                "-i",
                "pipe:0",
            ]
            .map(str::to_string),
        );
    }

    fn add_mapping_args(&self, args: &mut Vec<String>) {
        args.extend(["-map", "0:v:0", "-map", "0:a:0"].map(str::to_string));
    }

    fn add_video_args(&self, args: &mut Vec<String>) {
        if !self.profile.video_transcode_active() {
            args.extend(["-c:v", "copy"].map(str::to_string));
            return;
        }

        let seg = self.profile.segment_duration_sec;
        args.extend(["-c:v", "libx264"].map(str::to_string));
        args.extend(["-preset".to_string(), "veryfast".to_string()]);
        args.extend(["-crf".to_string(), self.profile.video_crf.to_string()]);
        args.extend(
            [
                "-pix_fmt", "yuv420p", "-profile:v", "high", "-level:v", "4.0",
            ]
            .map(str::to_string),
        );
        // GOP aligned to segment boundaries; keyframes forced at segment times
        args.extend(["-g".to_string(), (seg * 50).to_string()]);
        args.extend(["-sc_threshold".to_string(), "0".to_string()]);
        args.extend([
            "-force_key_frames".to_string(),
            format!("expr:gte(t,n_forced*{seg})"),
        ]);

        if let Some(filter) = self.video_filter() {
            args.extend(["-vf".to_string(), filter]);
        }
    }

    fn video_filter(&self) -> Option<String> {
        let mut filters = Vec::new();
        if self.profile.deinterlace {
            // yadif(1) keeps temporal resolution (one frame per field)
            filters.push("yadif=1".to_string());
        }
        if let Some(max_width) = self.profile.video_max_width {
            filters.push(format!("scale='min({max_width},iw)':-2"));
        }
        if filters.is_empty() {
            None
        } else {
            Some(filters.join(","))
        }
    }

    /// Audio is always normalized to AAC-LC. Upstream AC-3/MP2/partial-AAC
    /// breaks browsers; AAC is the one layout every client plays.
    fn add_audio_args(&self, args: &mut Vec<String>) {
        args.extend(["-c:a", "aac"].map(str::to_string));
        args.extend([
            "-b:a".to_string(),
            format!("{}k", self.profile.audio_bitrate_k),
        ]);
        args.extend(["-ar".to_string(), "48000".to_string()]);
        if self.profile.allows_surround() {
            args.extend([
                "-af".to_string(),
                "aformat=channel_layouts=5.1|stereo".to_string(),
            ]);
        } else {
            args.extend(["-ac".to_string(), "2".to_string()]);
        }
    }

    fn add_hls_args(&self, args: &mut Vec<String>) {
        let profile = self.profile;
        let seg = profile.segment_duration_sec;

        args.extend(["-f", "hls"].map(str::to_string));
        args.extend(["-hls_time".to_string(), seg.to_string()]);

        if profile.vod {
            args.extend(["-hls_list_size".to_string(), "0".to_string()]);
            args.extend([
                "-hls_flags".to_string(),
                "temp_file+independent_segments+program_date_time".to_string(),
            ]);
            args.extend(["-hls_playlist_type".to_string(), "vod".to_string()]);
        } else if profile.dvr_window_sec > 0 {
            let window_segments = (profile.dvr_window_sec + seg - 1) / seg;
            args.extend([
                "-hls_list_size".to_string(),
                window_segments.to_string(),
            ]);
            args.extend([
                "-hls_flags".to_string(),
                "omit_endlist+append_list+independent_segments+program_date_time".to_string(),
            ]);
            args.extend(["-hls_playlist_type".to_string(), "event".to_string()]);
        } else {
            args.extend([
                "-hls_list_size".to_string(),
                LIVE_LIST_SIZE.to_string(),
            ]);
            args.extend([
                "-hls_flags".to_string(),
                "delete_segments+omit_endlist+temp_file".to_string(),
            ]);
        }

        if profile.uses_fmp4() {
            args.extend(["-hls_segment_type".to_string(), "fmp4".to_string()]);
            args.extend([
                "-hls_fmp4_init_filename".to_string(),
                "init.mp4".to_string(),
            ]);
        }

        args.extend([
            "-hls_segment_filename".to_string(),
            self.session_dir
                .join(format!("seg_%06d.{}", profile.segment_extension()))
                .to_string_lossy()
                .into_owned(),
        ]);
        args.push(
            self.session_dir
                .join("index.m3u8.tmp")
                .to_string_lossy()
                .into_owned(),
        );
    }
}
