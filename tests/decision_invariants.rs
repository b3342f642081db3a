//! Property sweep over the decision engine's post-conditions.

use proptest::option;
use proptest::prelude::*;

use xg2g::decision::{DecisionInput, decide};
use xg2g::errors::DecisionError;
use xg2g::metrics::Metrics;
use xg2g::models::{
    CapabilityProfile, DecisionMode, DecisionPolicy, Protocol, SourceProbe,
};

fn token() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "mp4".to_string(),
        "mpegts".to_string(),
        "avi".to_string(),
        "mkv".to_string(),
        "h264".to_string(),
        "hevc".to_string(),
        "mpeg2video".to_string(),
        "aac".to_string(),
        "ac3".to_string(),
        "mp2".to_string(),
    ])
}

fn probe_strategy() -> impl Strategy<Value = SourceProbe> {
    (
        option::of(token()),
        option::of(token()),
        option::of(token()),
        option::of(320u32..4096),
        option::of(240u32..2160),
    )
        .prop_map(|(container, video_codec, audio_codec, width, height)| SourceProbe {
            container,
            video_codec,
            audio_codec,
            width,
            height,
            fps: Some(25.0),
            bitrate_kbps: Some(8000),
        })
}

fn caps_strategy() -> impl Strategy<Value = CapabilityProfile> {
    (
        prop::collection::vec(token(), 0..4),
        prop::collection::vec(token(), 0..4),
        prop::collection::vec(token(), 0..4),
        any::<bool>(),
        option::of(any::<bool>()),
    )
        .prop_map(
            |(containers, video_codecs, audio_codecs, supports_hls, supports_range)| {
                CapabilityProfile {
                    containers,
                    video_codecs,
                    audio_codecs,
                    supports_hls,
                    supports_range,
                    max_video_width: None,
                    device_type: None,
                }
            },
        )
}

proptest! {
    #[test]
    fn decide_never_ships_a_malformed_decision(
        probe in probe_strategy(),
        caps in caps_strategy(),
        allow_transcode in any::<bool>(),
    ) {
        let metrics = Metrics::new();
        let policy = DecisionPolicy { allow_transcode };
        let result = decide(
            DecisionInput {
                probe: &probe,
                capabilities: &caps,
                policy: &policy,
                request_id: "req-prop",
                direct_url: Some("http://example/direct.mp4".to_string()),
                hls_url: Some("/hls/sess/index.m3u8".to_string()),
            },
            &metrics,
        );

        match result {
            Ok(decision) => {
                // the probe was complete, or we would have gotten Ambiguous
                prop_assert!(probe.container.is_some());
                prop_assert!(probe.video_codec.is_some());
                prop_assert!(probe.audio_codec.is_some());

                match decision.mode {
                    DecisionMode::Deny => {
                        prop_assert_eq!(decision.protocol, Protocol::None);
                        prop_assert!(decision.outputs.is_empty());
                        prop_assert!(decision.selected_output.is_none());
                    }
                    DecisionMode::Transcode => {
                        prop_assert_eq!(decision.protocol, Protocol::Hls);
                        prop_assert!(allow_transcode && caps.supports_hls);
                    }
                    DecisionMode::DirectPlay => {
                        prop_assert_eq!(decision.protocol, Protocol::Mp4);
                        prop_assert_eq!(caps.supports_range, Some(true));
                    }
                }
                // the reason list is never empty and leads with the primary
                prop_assert!(!decision.reasons.is_empty());
            }
            Err(DecisionError::Ambiguous { missing }) => {
                prop_assert!(!missing.is_empty());
                prop_assert!(
                    probe.container.is_none()
                        || probe.video_codec.is_none()
                        || probe.audio_codec.is_none()
                );
            }
            Err(DecisionError::InvariantViolation { detail }) => {
                prop_assert!(false, "invariant violation escaped: {detail}");
            }
        }
    }

    #[test]
    fn every_evaluation_increments_exactly_one_counter(
        probe in probe_strategy(),
        caps in caps_strategy(),
    ) {
        let metrics = Metrics::new();
        let policy = DecisionPolicy::default();
        let _ = decide(
            DecisionInput {
                probe: &probe,
                capabilities: &caps,
                policy: &policy,
                request_id: "req-prop",
                direct_url: None,
                hls_url: None,
            },
            &metrics,
        );
        let total: u64 = metrics.snapshot().decisions.iter().map(|d| d.count).sum();
        prop_assert_eq!(total, 1);
    }
}
