//! Chapter state: the hidden progress/risk/exposure counters, the per-node
//! timeline, and the settlement rules that end a chapter.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChapterConfig {
    pub min_nodes: i64,
    pub max_nodes: i64,
    pub pass_threshold: i64,
    pub fail_threshold: i64,
}

impl Default for ChapterConfig {
    fn default() -> Self {
        Self {
            min_nodes: 6,
            max_nodes: 22,
            pass_threshold: 80,
            fail_threshold: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChapterState {
    pub progress: i64,
    pub risk: i64,
    pub exposure: i64,
}

/// Hidden per-option effects. Never serialized toward a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChoiceEffects {
    #[serde(default)]
    pub delta_progress: i64,
    #[serde(default)]
    pub delta_risk: i64,
    #[serde(default)]
    pub delta_exposure: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEntry {
    pub node: i64,
    pub choice: String,
    pub impact: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MicroFeedback {
    pub progress_hint: String,
    pub risk_hint: String,
    pub exposure_hint: String,
    pub micro_message: String,
}

/// The chapter block stored inside node metadata. Deserialization is
/// tolerant: older or partially-populated blocks fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterBlock {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: ChapterConfig,
    #[serde(default)]
    pub state: ChapterState,
    #[serde(default)]
    pub timeline: Vec<TimelineEntry>,
    #[serde(default = "default_node_index")]
    pub node_index: i64,
    #[serde(default)]
    pub image_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub micro_feedback: Option<MicroFeedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement: Option<Value>,
    #[serde(default)]
    pub hidden_effects_map: HashMap<String, ChoiceEffects>,
}

fn default_enabled() -> bool {
    true
}

fn default_node_index() -> i64 {
    1
}

impl ChapterBlock {
    pub fn initial(config: ChapterConfig, image_token: String) -> Self {
        Self {
            enabled: true,
            config,
            state: ChapterState::default(),
            timeline: Vec::new(),
            node_index: 1,
            image_token,
            micro_feedback: None,
            settlement: None,
            hidden_effects_map: HashMap::new(),
        }
    }

    /// Pull the chapter block out of a node metadata value; defaults when
    /// absent or malformed.
    pub fn from_metadata(metadata: &Value, fallback_config: ChapterConfig) -> Self {
        metadata
            .get("chapter")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_else(|| Self::initial(fallback_config, String::new()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementResult {
    Success,
    Fail,
    Auto,
}

impl SettlementResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementResult::Success => "success",
            SettlementResult::Fail => "fail",
            SettlementResult::Auto => "auto",
        }
    }
}

pub fn clamp(value: i64) -> i64 {
    value.clamp(0, 100)
}

pub fn apply_effects(state: ChapterState, effects: &ChoiceEffects) -> ChapterState {
    ChapterState {
        progress: clamp(state.progress + effects.delta_progress),
        risk: clamp(state.risk + effects.delta_risk),
        exposure: clamp(state.exposure + effects.delta_exposure),
    }
}

fn hint_for_delta(delta: i64) -> &'static str {
    if delta >= 10 {
        "up_big"
    } else if delta >= 5 {
        "up_mid"
    } else if delta >= 2 {
        "up_small"
    } else if delta <= -10 {
        "down_big"
    } else if delta <= -5 {
        "down_mid"
    } else if delta <= -2 {
        "down_small"
    } else {
        "flat"
    }
}

/// Per-axis band hints plus a short composite message. Deliberately vague:
/// the player must never see numbers.
pub fn micro_feedback(prev: ChapterState, cur: ChapterState) -> MicroFeedback {
    let dp = cur.progress - prev.progress;
    let dr = cur.risk - prev.risk;
    let de = cur.exposure - prev.exposure;

    let mut parts: Vec<&str> = Vec::new();
    if dp >= 5 {
        parts.push("推进显著");
    } else if dp >= 2 {
        parts.push("推进可见");
    } else if dp <= -2 {
        parts.push("推进受挫");
    }
    if dr >= 5 {
        parts.push("风声渐紧");
    } else if dr <= -2 {
        parts.push("风险回落");
    }
    if de >= 4 {
        parts.push("曝光上扬");
    } else if de <= -2 {
        parts.push("更为隐蔽");
    }

    let micro_message = if parts.is_empty() {
        "风向未明".to_string()
    } else {
        parts.join("，")
    };

    MicroFeedback {
        progress_hint: hint_for_delta(dp).to_string(),
        risk_hint: hint_for_delta(dr).to_string(),
        exposure_hint: hint_for_delta(de).to_string(),
        micro_message,
    }
}

/// Settlement decision, evaluated in order: fail beats auto beats success.
pub fn should_settle(
    state: ChapterState,
    nodes_count: i64,
    config: ChapterConfig,
) -> Option<SettlementResult> {
    if state.risk >= config.fail_threshold || state.exposure >= config.fail_threshold {
        return Some(SettlementResult::Fail);
    }
    if nodes_count >= config.max_nodes {
        return Some(SettlementResult::Auto);
    }
    if nodes_count >= config.min_nodes && state.progress >= config.pass_threshold {
        return Some(SettlementResult::Success);
    }
    None
}

/// Letter grade: progress minus a penalty for running hot on risk/exposure.
pub fn compute_grade(state: ChapterState) -> &'static str {
    let base = state.progress as f64;
    let penalty = ((state.risk - 70).max(0) as f64) * 0.6 + ((state.exposure - 70).max(0) as f64) * 0.4;
    let finalscore = clamp((base - penalty).round() as i64);
    if finalscore >= 90 {
        "S"
    } else if finalscore >= 75 {
        "A"
    } else if finalscore >= 60 {
        "B"
    } else {
        "C"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ChapterConfig {
        ChapterConfig {
            min_nodes: 6,
            max_nodes: 22,
            pass_threshold: 80,
            fail_threshold: 90,
        }
    }

    #[test]
    fn settlement_triggers_at_exact_thresholds() {
        // risk == fail_threshold -> fail
        let state = ChapterState {
            progress: 10,
            risk: 90,
            exposure: 0,
        };
        assert_eq!(should_settle(state, 3, cfg()), Some(SettlementResult::Fail));

        // exposure == fail_threshold -> fail
        let state = ChapterState {
            progress: 10,
            risk: 0,
            exposure: 90,
        };
        assert_eq!(should_settle(state, 3, cfg()), Some(SettlementResult::Fail));

        // progress == pass_threshold and nodes_count == min_nodes -> success
        let state = ChapterState {
            progress: 80,
            risk: 10,
            exposure: 10,
        };
        assert_eq!(
            should_settle(state, 6, cfg()),
            Some(SettlementResult::Success)
        );

        // one short of min_nodes -> no settlement
        assert_eq!(should_settle(state, 5, cfg()), None);
    }

    #[test]
    fn fail_takes_precedence_over_auto_and_success() {
        let state = ChapterState {
            progress: 100,
            risk: 95,
            exposure: 0,
        };
        assert_eq!(
            should_settle(state, 30, cfg()),
            Some(SettlementResult::Fail)
        );
    }

    #[test]
    fn max_nodes_forces_auto() {
        let state = ChapterState {
            progress: 10,
            risk: 10,
            exposure: 10,
        };
        assert_eq!(should_settle(state, 22, cfg()), Some(SettlementResult::Auto));
    }

    #[test]
    fn effects_clamp_to_unit_range() {
        let state = ChapterState {
            progress: 95,
            risk: 3,
            exposure: 50,
        };
        let effects = ChoiceEffects {
            delta_progress: 20,
            delta_risk: -10,
            delta_exposure: 200,
            tags: None,
        };
        let next = apply_effects(state, &effects);
        assert_eq!(next.progress, 100);
        assert_eq!(next.risk, 0);
        assert_eq!(next.exposure, 100);
    }

    #[test]
    fn grade_bands() {
        let grade = |progress, risk, exposure| {
            compute_grade(ChapterState {
                progress,
                risk,
                exposure,
            })
        };
        assert_eq!(grade(95, 0, 0), "S");
        assert_eq!(grade(85, 0, 0), "A");
        assert_eq!(grade(85, 40, 30), "A"); // scenario: no penalty below 70
        assert_eq!(grade(60, 0, 0), "B");
        assert_eq!(grade(59, 0, 0), "C");
        // penalty: 90 - (80-70)*0.6 = 84 -> A
        assert_eq!(grade(90, 80, 0), "A");
    }

    #[test]
    fn micro_feedback_bands() {
        let prev = ChapterState {
            progress: 10,
            risk: 10,
            exposure: 10,
        };
        let cur = ChapterState {
            progress: 22,
            risk: 16,
            exposure: 8,
        };
        let feedback = micro_feedback(prev, cur);
        assert_eq!(feedback.progress_hint, "up_big");
        assert_eq!(feedback.risk_hint, "up_mid");
        assert_eq!(feedback.exposure_hint, "down_small");
        assert_eq!(feedback.micro_message, "推进显著，风声渐紧，更为隐蔽");

        let flat = micro_feedback(prev, prev);
        assert_eq!(flat.progress_hint, "flat");
        assert_eq!(flat.micro_message, "风向未明");
    }

    #[test]
    fn chapter_block_roundtrips_and_tolerates_missing_fields() {
        let block = ChapterBlock::initial(cfg(), "tok-1".into());
        let value = serde_json::to_value(&block).unwrap();
        let back: ChapterBlock = serde_json::from_value(value).unwrap();
        assert_eq!(back.node_index, 1);
        assert!(back.timeline.is_empty());

        let sparse: ChapterBlock =
            serde_json::from_value(serde_json::json!({"state": {"progress": 5, "risk": 1, "exposure": 2}}))
                .unwrap();
        assert_eq!(sparse.state.progress, 5);
        assert_eq!(sparse.node_index, 1);
        assert!(sparse.enabled);
    }
}
