//! Capability & decision engine
//!
//! Pure rule evaluation from (source probe, client capabilities, policy) to
//! a direct-play / transcode / deny decision. Post-conditions are checked
//! mechanically before a decision ships; a malformed decision is replaced by
//! an invariant-violation error, never returned.

use tracing::info_span;

use crate::errors::DecisionError;
use crate::metrics::Metrics;
use crate::models::{
    CapabilityProfile, Decision, DecisionMode, DecisionPolicy, Protocol, SourceProbe, reasons,
};

/// Everything the engine needs for one evaluation
pub struct DecisionInput<'a> {
    pub probe: &'a SourceProbe,
    pub capabilities: &'a CapabilityProfile,
    pub policy: &'a DecisionPolicy,
    pub request_id: &'a str,
    /// Candidate output URL for direct play, when the caller has one
    pub direct_url: Option<String>,
    /// Candidate HLS playlist URL for transcode, when the caller has one
    pub hls_url: Option<String>,
}

/// Evaluate the decision rules.
///
/// Emits exactly one `decision` tracing span and one labelled counter
/// increment per call, including the ambiguous and violation outcomes.
pub fn decide(input: DecisionInput<'_>, metrics: &Metrics) -> Result<Decision, DecisionError> {
    let outcome = evaluate(&input);

    let (mode, protocol, primary, all_reasons) = match &outcome {
        Ok(decision) => (
            decision.mode.as_str(),
            decision.protocol.as_str(),
            decision.primary_reason().to_string(),
            decision.reasons.clone(),
        ),
        Err(DecisionError::Ambiguous { .. }) => (
            // hardened fallback: an ambiguous probe is reported as a deny
            DecisionMode::Deny.as_str(),
            Protocol::None.as_str(),
            reasons::MISSING_SOURCE_FIELDS.to_string(),
            vec![reasons::MISSING_SOURCE_FIELDS.to_string()],
        ),
        Err(DecisionError::InvariantViolation { .. }) => (
            DecisionMode::Deny.as_str(),
            Protocol::None.as_str(),
            "invariant_violation".to_string(),
            vec!["invariant_violation".to_string()],
        ),
    };

    let span = info_span!(
        "decision",
        mode,
        protocol,
        primary_reason = %primary,
        reasons = ?all_reasons,
        request_id = input.request_id,
    );
    let _entered = span.enter();
    metrics.record_decision(mode, protocol, &primary);

    outcome
}

fn evaluate(input: &DecisionInput<'_>) -> Result<Decision, DecisionError> {
    let probe = input.probe;
    let caps = input.capabilities;

    // rule 1: every required source field must be present
    let mut missing = Vec::new();
    if probe.container.is_none() {
        missing.push("container");
    }
    if probe.video_codec.is_none() {
        missing.push("video_codec");
    }
    if probe.audio_codec.is_none() {
        missing.push("audio_codec");
    }
    if !missing.is_empty() {
        return Err(DecisionError::Ambiguous { missing });
    }

    let container = probe.container.as_deref().unwrap_or_default();
    let video = probe.video_codec.as_deref().unwrap_or_default();
    let audio = probe.audio_codec.as_deref().unwrap_or_default();

    let container_ok = contains_ci(&caps.containers, container);
    let video_ok = contains_ci(&caps.video_codecs, video);
    let audio_ok = contains_ci(&caps.audio_codecs, audio);
    let range_ok = caps.supports_range == Some(true);
    let transcodable = input.policy.allow_transcode && caps.supports_hls;

    // rule 2: full client support plus explicit range support
    let decision = if container_ok && video_ok && audio_ok && range_ok {
        Decision {
            mode: DecisionMode::DirectPlay,
            protocol: Protocol::Mp4,
            reasons: vec![reasons::DIRECT_PLAY_SUPPORTED.to_string()],
            outputs: input.direct_url.iter().cloned().collect(),
            selected_output: input.direct_url.clone(),
        }
    } else if !container_ok && !transcodable {
        // rule 3: unsupported container with no transcode path
        Decision {
            mode: DecisionMode::Deny,
            protocol: Protocol::None,
            reasons: vec![reasons::CONTAINER_NOT_SUPPORTED.to_string()],
            outputs: Vec::new(),
            selected_output: None,
        }
    } else if transcodable {
        // rule 4: transcode to HLS
        let mut rs = vec![reasons::TRANSCODE_ALLOWED.to_string()];
        rs.extend(mismatch_reasons(container_ok, video_ok, audio_ok, range_ok));
        Decision {
            mode: DecisionMode::Transcode,
            protocol: Protocol::Hls,
            reasons: rs,
            outputs: input.hls_url.iter().cloned().collect(),
            selected_output: input.hls_url.clone(),
        }
    } else {
        // rule 5: nothing left but deny
        let mut rs = mismatch_reasons(container_ok, video_ok, audio_ok, range_ok);
        if !input.policy.allow_transcode {
            rs.push(reasons::TRANSCODE_FORBIDDEN.to_string());
        } else if !caps.supports_hls {
            rs.push(reasons::HLS_NOT_SUPPORTED.to_string());
        }
        Decision {
            mode: DecisionMode::Deny,
            protocol: Protocol::None,
            reasons: rs,
            outputs: Vec::new(),
            selected_output: None,
        }
    };

    verify_invariants(&decision, caps)?;
    Ok(decision)
}

fn mismatch_reasons(
    container_ok: bool,
    video_ok: bool,
    audio_ok: bool,
    range_ok: bool,
) -> Vec<String> {
    let mut rs = Vec::new();
    if !container_ok {
        rs.push(reasons::CONTAINER_NOT_SUPPORTED.to_string());
    }
    if !video_ok {
        rs.push(reasons::VIDEO_NOT_SUPPORTED.to_string());
    }
    if !audio_ok {
        rs.push(reasons::AUDIO_NOT_SUPPORTED.to_string());
    }
    if !range_ok {
        rs.push(reasons::RANGE_NOT_SUPPORTED.to_string());
    }
    rs
}

fn contains_ci(haystack: &[String], needle: &str) -> bool {
    haystack.iter().any(|h| h.eq_ignore_ascii_case(needle))
}

/// Mechanical post-condition check; a violation is fatal for the request
pub fn verify_invariants(
    decision: &Decision,
    capabilities: &CapabilityProfile,
) -> Result<(), DecisionError> {
    match decision.mode {
        DecisionMode::DirectPlay => {
            if capabilities.supports_range != Some(true) {
                return Err(DecisionError::InvariantViolation {
                    detail: "directPlay without explicit range support".to_string(),
                });
            }
        }
        DecisionMode::Transcode => {
            if decision.protocol != Protocol::Hls {
                return Err(DecisionError::InvariantViolation {
                    detail: format!(
                        "transcode with protocol {}",
                        decision.protocol.as_str()
                    ),
                });
            }
        }
        DecisionMode::Deny => {
            if decision.protocol != Protocol::None
                || !decision.outputs.is_empty()
                || decision.selected_output.is_some()
            {
                return Err(DecisionError::InvariantViolation {
                    detail: "deny with outputs or protocol".to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(container: &str, vcodec: &str, acodec: &str) -> SourceProbe {
        SourceProbe {
            container: Some(container.to_string()),
            video_codec: Some(vcodec.to_string()),
            audio_codec: Some(acodec.to_string()),
            width: Some(1920),
            height: Some(1080),
            fps: Some(25.0),
            bitrate_kbps: Some(8000),
        }
    }

    fn caps(containers: &[&str]) -> CapabilityProfile {
        CapabilityProfile {
            containers: containers.iter().map(|s| s.to_string()).collect(),
            video_codecs: vec!["h264".to_string()],
            audio_codecs: vec!["aac".to_string()],
            supports_hls: false,
            supports_range: None,
            max_video_width: None,
            device_type: None,
        }
    }

    fn run(
        probe: &SourceProbe,
        caps: &CapabilityProfile,
        policy: &DecisionPolicy,
    ) -> Result<Decision, DecisionError> {
        let metrics = Metrics::new();
        decide(
            DecisionInput {
                probe,
                capabilities: caps,
                policy,
                request_id: "req-test",
                direct_url: Some("http://example/direct.mp4".to_string()),
                hls_url: Some("/hls/sess/index.m3u8".to_string()),
            },
            &metrics,
        )
    }

    #[test]
    fn avi_source_for_mp4_only_client_is_denied() {
        // literal scenario from the delivery contract
        let decision = run(
            &probe("avi", "h264", "aac"),
            &caps(&["mp4"]),
            &DecisionPolicy::default(),
        )
        .unwrap();
        assert_eq!(decision.mode, DecisionMode::Deny);
        assert_eq!(decision.protocol, Protocol::None);
        assert_eq!(
            decision.reasons,
            vec!["container_not_supported_by_client".to_string()]
        );
        assert!(decision.outputs.is_empty());
        assert!(decision.selected_output.is_none());
    }

    #[test]
    fn direct_play_requires_explicit_range_support() {
        let mut c = caps(&["mpegts"]);
        c.supports_range = Some(true);
        let decision = run(
            &probe("mpegts", "h264", "aac"),
            &c,
            &DecisionPolicy::default(),
        )
        .unwrap();
        assert_eq!(decision.mode, DecisionMode::DirectPlay);
        assert_eq!(decision.protocol, Protocol::Mp4);
        assert_eq!(decision.selected_output.as_deref(), Some("http://example/direct.mp4"));

        // absent range support falls off the direct-play rule entirely
        c.supports_range = None;
        let decision = run(
            &probe("mpegts", "h264", "aac"),
            &c,
            &DecisionPolicy::default(),
        )
        .unwrap();
        assert_eq!(decision.mode, DecisionMode::Deny);
        assert!(decision.reasons.contains(&"range_not_supported".to_string()));
    }

    #[test]
    fn transcode_path_is_always_hls() {
        let mut c = caps(&["mp4"]);
        c.supports_hls = true;
        let decision = run(
            &probe("mpegts", "mpeg2video", "ac3"),
            &c,
            &DecisionPolicy::default(),
        )
        .unwrap();
        assert_eq!(decision.mode, DecisionMode::Transcode);
        assert_eq!(decision.protocol, Protocol::Hls);
        assert_eq!(decision.primary_reason(), "transcode_allowed_by_policy");
        assert_eq!(decision.selected_output.as_deref(), Some("/hls/sess/index.m3u8"));
    }

    #[test]
    fn policy_can_forbid_transcode() {
        let mut c = caps(&["mp4"]);
        c.supports_hls = true;
        let decision = run(
            &probe("mpegts", "h264", "ac3"),
            &c,
            &DecisionPolicy {
                allow_transcode: false,
            },
        )
        .unwrap();
        assert_eq!(decision.mode, DecisionMode::Deny);
        assert!(
            decision
                .reasons
                .contains(&"transcode_forbidden_by_policy".to_string())
        );
    }

    #[test]
    fn incomplete_probe_is_ambiguous() {
        let mut p = probe("mpegts", "h264", "aac");
        p.audio_codec = None;
        let err = run(&p, &caps(&["mp4"]), &DecisionPolicy::default()).unwrap_err();
        assert!(matches!(err, DecisionError::Ambiguous { missing } if missing == ["audio_codec"]));
    }

    #[test]
    fn decision_counter_is_incremented_once_with_labels() {
        let metrics = Metrics::new();
        let p = probe("avi", "h264", "aac");
        let c = caps(&["mp4"]);
        let input = DecisionInput {
            probe: &p,
            capabilities: &c,
            policy: &DecisionPolicy::default(),
            request_id: "req-1",
            direct_url: None,
            hls_url: None,
        };
        decide(input, &metrics).unwrap();
        assert_eq!(
            metrics.decision_count("deny", "none", "container_not_supported_by_client"),
            1
        );
    }

    #[test]
    fn invariant_check_rejects_malformed_decisions() {
        let c = caps(&["mp4"]);
        let bad = Decision {
            mode: DecisionMode::Deny,
            protocol: Protocol::Hls,
            reasons: vec![],
            outputs: vec!["x".to_string()],
            selected_output: None,
        };
        assert!(matches!(
            verify_invariants(&bad, &c),
            Err(DecisionError::InvariantViolation { .. })
        ));

        let bad_direct = Decision {
            mode: DecisionMode::DirectPlay,
            protocol: Protocol::Mp4,
            reasons: vec![],
            outputs: vec![],
            selected_output: None,
        };
        assert!(verify_invariants(&bad_direct, &c).is_err());
    }
}
