//! Story engine: turns a wish and a path through the tree into the next
//! node payload, evolving the hidden chapter state as it goes.

pub mod history;
pub mod json;
pub mod prompts;
pub mod state;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::images::ImageService;
use crate::providers::chat::ChatMessage;
use crate::providers::llm::{GenerateOptions, LlmClient};
use self::history::build_prompt_context;
use self::json::extract_json;
use self::state::{
    apply_effects, compute_grade, micro_feedback, should_settle, ChapterBlock, ChapterConfig,
    ChoiceEffects, SettlementResult, TimelineEntry,
};
use self::types::{DisplayChoice, EngineError, LevelBrief, NodePayload};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Inputs for continuing a story one node past `parent_metadata`'s node.
pub struct ContinueRequest<'a> {
    pub wish: &'a str,
    pub history: &'a [ChatMessage],
    pub choice: &'a str,
    /// Summary text of the chosen option (from the parent's display
    /// choices); becomes the timeline impact line.
    pub choice_summary: Option<&'a str>,
    pub chapter_number: i64,
    pub parent_success_rate: Option<i64>,
    pub parent_metadata: &'a Value,
}

/// The seam between generation and everything that schedules it. The
/// interactive path and the speculation scheduler both call through this so
/// tests can substitute a scripted generator.
#[async_trait]
pub trait StoryGenerator: Send + Sync {
    async fn start_story(&self, wish: &str) -> Result<NodePayload, EngineError>;

    async fn continue_story(&self, request: ContinueRequest<'_>)
        -> Result<NodePayload, EngineError>;

    async fn prepare_level(&self, wish: &str) -> Result<LevelBrief, EngineError>;
}

pub struct StoryEngine {
    llm: Arc<LlmClient>,
    images: Arc<ImageService>,
    chapter_config: ChapterConfig,
}

/// Result of parsing one NODE response: display choices stripped of
/// anything numeric, and the hidden map keyed by option text.
struct ParsedNode {
    text: String,
    choices_display: Vec<DisplayChoice>,
    hidden_effects_map: HashMap<String, ChoiceEffects>,
    image_token: Option<String>,
}

impl StoryEngine {
    pub fn new(llm: Arc<LlmClient>, images: Arc<ImageService>, chapter_config: ChapterConfig) -> Self {
        Self {
            llm,
            images,
            chapter_config,
        }
    }

    fn generate_image_token(wish: &str) -> String {
        let base: String = WHITESPACE
            .replace_all(wish, "-")
            .chars()
            .take(24)
            .collect();
        format!("{}-{}", base, Utc::now().format("%H%M%S"))
    }

    fn parse_node(json_str: &str) -> Result<ParsedNode, String> {
        let data: Value =
            serde_json::from_str(json_str).map_err(|e| format!("JSON parse failed: {e}"))?;

        let text = data
            .get("text")
            .and_then(Value::as_str)
            .ok_or("node is missing 'text'")?
            .to_string();
        let choices = data
            .get("choices")
            .and_then(Value::as_array)
            .ok_or("node is missing 'choices'")?;
        if choices.len() != 3 {
            return Err(format!("node must carry exactly 3 choices, got {}", choices.len()));
        }

        let mut choices_display = Vec::with_capacity(3);
        let mut hidden_effects_map = HashMap::with_capacity(3);
        for entry in choices {
            let option = entry
                .get("option")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or("choice is missing 'option'")?;
            let summary = entry
                .get("summary")
                .and_then(Value::as_str)
                .map(str::trim)
                .ok_or("choice is missing 'summary'")?;

            let effects = entry.get("effects").cloned().unwrap_or(Value::Null);
            let effects: ChoiceEffects = serde_json::from_value(effects).unwrap_or_default();

            hidden_effects_map.insert(option.to_string(), effects);
            choices_display.push(DisplayChoice::new(option, summary));
        }

        let image_token = data
            .get("image_continuity_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|t| !t.is_empty());

        Ok(ParsedNode {
            text,
            choices_display,
            hidden_effects_map,
            image_token,
        })
    }

    /// Parse the model reply; on failure, run one JSON-repair round trip
    /// with a stricter preamble before giving up.
    async fn parse_node_with_repair(&self, raw: &str) -> Result<ParsedNode, EngineError> {
        let extracted = extract_json(raw);
        match Self::parse_node(&extracted) {
            Ok(parsed) => Ok(parsed),
            Err(first_error) => {
                tracing::warn!(%first_error, "node parse failed, attempting JSON repair");
                if raw.trim().len() < 10 {
                    return Err(EngineError::InvalidModelOutput(
                        "model response too short to repair".into(),
                    ));
                }

                let repair_prompt = prompts::render(prompts::REPAIR_PROMPT, &[("raw", raw)]);
                let repaired = self
                    .llm
                    .generate(
                        &repair_prompt,
                        &[],
                        GenerateOptions {
                            temperature: Some(0.1),
                            max_tokens: Some(2000),
                            system_override: Some(prompts::REPAIR_PREAMBLE.to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;

                Self::parse_node(&extract_json(&repaired)).map_err(|repair_error| {
                    EngineError::InvalidModelOutput(format!(
                        "repair failed ({repair_error}); original error: {first_error}"
                    ))
                })
            }
        }
    }

    async fn generate_settlement(
        &self,
        timeline: &[TimelineEntry],
        result: SettlementResult,
        grade: &str,
    ) -> Value {
        let lines: Vec<String> = timeline
            .iter()
            .map(|t| format!("- 第{}步：选择《{}》，影响：{}", t.node, t.choice, t.impact))
            .collect();
        let timeline_block = if lines.is_empty() {
            "- （时间线极短）".to_string()
        } else {
            lines.join("\n")
        };

        let prompt = prompts::render(
            prompts::SETTLEMENT_PROMPT,
            &[
                ("timeline_block", timeline_block.as_str()),
                ("result", result.as_str()),
                ("grade", grade),
            ],
        );

        let parsed = match self
            .llm
            .generate(
                &prompt,
                &[],
                GenerateOptions {
                    system_override: Some(prompts::SETTLEMENT_PREAMBLE.to_string()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(raw) => serde_json::from_str::<Value>(&extract_json(&raw)).ok(),
            Err(error) => {
                tracing::warn!(%error, "settlement oracle call failed");
                None
            }
        };

        // The settlement itself never fails: fall back to a fixed skeleton.
        let mut data = parsed.filter(Value::is_object).unwrap_or_else(|| {
            json!({
                "chapter_summary": "本章收束，故事暂告一段。",
                "timeline": timeline,
                "key_impacts": [],
                "next_chapter_hook": "新的变局正在酝酿……",
                "cover_image_prompt": "写实风 章末总结 构图严谨 光影凝重",
            })
        });
        data["result"] = json!(result.as_str());
        data["grade"] = json!(grade);
        data
    }
}

#[async_trait]
impl StoryGenerator for StoryEngine {
    async fn start_story(&self, wish: &str) -> Result<NodePayload, EngineError> {
        tracing::info!(%wish, "starting new story");
        let context = build_prompt_context(wish);
        let image_token = Self::generate_image_token(wish);

        let prompt = prompts::render(
            prompts::NODE_PROMPT,
            &[
                ("history_context", context.context_block.as_str()),
                ("image_token", image_token.as_str()),
            ],
        );
        let raw = self
            .llm
            .generate(
                &prompt,
                &[],
                GenerateOptions {
                    system_override: Some(prompts::NODE_PREAMBLE.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        let parsed = self.parse_node_with_repair(&raw).await?;

        let image_url = self.images.get_image_for_story(&parsed.text).await;

        let mut chapter = ChapterBlock::initial(
            self.chapter_config,
            parsed.image_token.clone().unwrap_or(image_token),
        );
        chapter.hidden_effects_map = parsed.hidden_effects_map;

        let metadata = json!({
            "generated_at": Utc::now().to_rfc3339(),
            "wish": wish,
            "type": "start",
            "chapter_number": 1,
            "history_profile": context.profile,
            "recommended_chapter_count": context.profile.recommended_chapter_count,
            "anchor_events": context.profile.anchors,
            "chapter": chapter,
        });

        Ok(NodePayload {
            text: parsed.text,
            choices: parsed.choices_display,
            image_url,
            success_rate: None,
            metadata,
        })
    }

    async fn continue_story(
        &self,
        request: ContinueRequest<'_>,
    ) -> Result<NodePayload, EngineError> {
        tracing::info!(choice = %request.choice, "continuing story");
        let context = build_prompt_context(request.wish);

        let previous = ChapterBlock::from_metadata(request.parent_metadata, self.chapter_config);
        let image_token = if previous.image_token.is_empty() {
            Self::generate_image_token(request.wish)
        } else {
            previous.image_token.clone()
        };

        let prompt = prompts::render(
            prompts::NODE_PROMPT,
            &[
                ("history_context", context.context_block.as_str()),
                ("image_token", image_token.as_str()),
            ],
        );
        // The chosen branch goes in as the final user turn so the model
        // responds to it; the node prompt itself carries no choice text.
        let mut history = request.history.to_vec();
        history.push(ChatMessage::user(format!("我选择了：{}", request.choice)));
        let raw = self
            .llm
            .generate(
                &prompt,
                &history,
                GenerateOptions {
                    system_override: Some(prompts::NODE_PREAMBLE.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        let parsed = self.parse_node_with_repair(&raw).await?;

        // The chosen option belongs to the parent, so its effects come from
        // the parent's hidden map; unknown choices fall back to zero deltas.
        let effects = previous
            .hidden_effects_map
            .get(request.choice)
            .cloned()
            .unwrap_or_default();
        let state_current = apply_effects(previous.state, &effects);
        let feedback = micro_feedback(previous.state, state_current);

        let mut timeline = previous.timeline.clone();
        timeline.push(TimelineEntry {
            node: previous.node_index,
            choice: request.choice.to_string(),
            impact: request.choice_summary.unwrap_or_default().to_string(),
        });

        let settle = should_settle(state_current, previous.node_index, self.chapter_config);
        let grade = compute_grade(state_current);
        let settlement = match settle {
            Some(result) => Some(self.generate_settlement(&timeline, result, grade).await),
            None => None,
        };

        let choices_display = if settlement.is_some() {
            Vec::new()
        } else {
            parsed.choices_display
        };

        let image_url = self.images.get_image_for_story(&parsed.text).await;

        let chapter = ChapterBlock {
            enabled: true,
            config: self.chapter_config,
            state: state_current,
            timeline,
            node_index: previous.node_index + 1,
            image_token: parsed.image_token.clone().unwrap_or(image_token),
            micro_feedback: Some(feedback),
            settlement,
            hidden_effects_map: parsed.hidden_effects_map,
        };

        let metadata = json!({
            "generated_at": Utc::now().to_rfc3339(),
            "user_choice": request.choice,
            "type": "continue",
            "history_length": request.history.len(),
            "chapter_number": request.chapter_number + 1,
            "history_profile": context.profile,
            "recommended_chapter_count": context.profile.recommended_chapter_count,
            "anchor_events": context.profile.anchors,
            "chapter": chapter,
        });

        Ok(NodePayload {
            text: parsed.text,
            choices: choices_display,
            image_url,
            success_rate: None,
            metadata,
        })
    }

    async fn prepare_level(&self, wish: &str) -> Result<LevelBrief, EngineError> {
        let context = build_prompt_context(wish);
        let prompt = prompts::render(
            prompts::PREPARE_LEVEL_PROMPT,
            &[
                ("history_context", context.context_block.as_str()),
                ("wish", wish),
            ],
        );
        let raw = self
            .llm
            .generate(
                &prompt,
                &[],
                GenerateOptions {
                    system_override: Some(prompts::PREPARE_LEVEL_PREAMBLE.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        serde_json::from_str::<LevelBrief>(&extract_json(&raw))
            .map_err(|e| EngineError::InvalidModelOutput(format!("level brief parse failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::images::ImageStorage;
    use crate::providers::errors::ProviderError;
    use crate::providers::mock::MockChatProvider;
    use tempfile::TempDir;

    fn node_json(text: &str) -> String {
        json!({
            "text": text,
            "choices": [
                {"option": "假装醉酒接近守卫", "summary": "冒险的潜入", "effects": {"delta_progress": 8, "delta_risk": 4, "delta_exposure": 2, "tags": ["stealth"]}},
                {"option": "贿赂看守", "summary": "花钱消灾", "effects": {"delta_progress": 5, "delta_risk": -1, "delta_exposure": 1}},
                {"option": "等待换班", "summary": "稳妥观察", "effects": {"delta_progress": 3, "delta_risk": -2, "delta_exposure": -1}},
            ],
            "image_prompts": ["写实古风"],
            "image_continuity_token": "tok-42",
        })
        .to_string()
    }

    fn engine_with(provider: MockChatProvider, tmp: &TempDir) -> (StoryEngine, Arc<MockChatProvider>) {
        let mut settings = Settings::from_env();
        settings.llm_max_retries = 0;
        settings.llm_retry_backoff_min_ms = 1;
        settings.llm_retry_backoff_max_ms = 1;

        let library = tmp.path().join("library");
        std::fs::create_dir_all(&library).unwrap();
        std::fs::write(library.join("fallback.png"), b"x").unwrap();

        let provider = Arc::new(provider);
        let llm = Arc::new(LlmClient::new(provider.clone(), &settings));
        let storage = ImageStorage::new(
            tmp.path().join("generated"),
            "http://127.0.0.1:8000/static/generated".into(),
        )
        .unwrap();
        let images = Arc::new(ImageService::new(
            None,
            storage,
            &library,
            "http://127.0.0.1:8000".into(),
        ));
        (
            StoryEngine::new(llm, images, ChapterConfig::default()),
            provider,
        )
    }

    #[tokio::test]
    async fn start_story_builds_initial_chapter_block() {
        let tmp = TempDir::new().unwrap();
        let (engine, _) = engine_with(
            MockChatProvider::scripted(vec![Ok(node_json("第一章开场"))]),
            &tmp,
        );

        let payload = engine.start_story("李世民").await.unwrap();
        assert_eq!(payload.text, "第一章开场");
        assert_eq!(payload.choices.len(), 3);
        assert!(payload.success_rate.is_none());
        for choice in &payload.choices {
            assert!(choice.success_rate_delta.is_none());
            assert!(choice.risk_level.is_none());
            assert!(choice.tags.is_none());
        }

        let chapter = &payload.metadata["chapter"];
        assert_eq!(chapter["node_index"], 1);
        assert_eq!(chapter["state"]["progress"], 0);
        assert_eq!(chapter["image_token"], "tok-42");
        assert_eq!(
            chapter["hidden_effects_map"]["假装醉酒接近守卫"]["delta_progress"],
            8
        );
        assert_eq!(payload.metadata["chapter_number"], 1);
        assert_eq!(payload.metadata["history_profile"]["era"], "唐朝");
        assert!(payload
            .image_url
            .starts_with("http://127.0.0.1:8000/static/"));
    }

    #[tokio::test]
    async fn continue_story_applies_parent_effects_and_extends_timeline() {
        let tmp = TempDir::new().unwrap();
        let (engine, _) = engine_with(
            MockChatProvider::scripted(vec![Ok(node_json("第二幕"))]),
            &tmp,
        );

        let parent_metadata = json!({
            "chapter": {
                "enabled": true,
                "config": {"min_nodes": 6, "max_nodes": 22, "pass_threshold": 80, "fail_threshold": 90},
                "state": {"progress": 10, "risk": 5, "exposure": 0},
                "timeline": [],
                "node_index": 2,
                "image_token": "tok-old",
                "hidden_effects_map": {
                    "突袭粮道": {"delta_progress": 12, "delta_risk": 6, "delta_exposure": 3}
                }
            }
        });

        let history = vec![ChatMessage::assistant("第一幕"), ChatMessage::user("我选择了：突袭粮道")];
        let payload = engine
            .continue_story(ContinueRequest {
                wish: "项羽",
                history: &history,
                choice: "突袭粮道",
                choice_summary: Some("奇袭的代价"),
                chapter_number: 2,
                parent_success_rate: None,
                parent_metadata: &parent_metadata,
            })
            .await
            .unwrap();

        let chapter = &payload.metadata["chapter"];
        assert_eq!(chapter["state"]["progress"], 22);
        assert_eq!(chapter["state"]["risk"], 11);
        assert_eq!(chapter["state"]["exposure"], 3);
        assert_eq!(chapter["node_index"], 3);
        assert_eq!(chapter["timeline"][0]["choice"], "突袭粮道");
        assert_eq!(chapter["timeline"][0]["impact"], "奇袭的代价");
        assert_eq!(chapter["micro_feedback"]["progress_hint"], "up_big");
        assert!(chapter["settlement"].is_null());
        assert_eq!(payload.metadata["chapter_number"], 3);
        assert_eq!(payload.choices.len(), 3);

        // the new node's own options replace the hidden map
        assert!(chapter["hidden_effects_map"]["贿赂看守"].is_object());
    }

    #[tokio::test]
    async fn settlement_triggers_with_empty_choices_and_grade() {
        let tmp = TempDir::new().unwrap();
        // node reply, then an unusable settlement reply: the skeleton fallback
        // must still settle the chapter.
        let (engine, _) = engine_with(
            MockChatProvider::scripted(vec![
                Ok(node_json("终局之战")),
                Ok("这不是JSON".into()),
            ]),
            &tmp,
        );

        let parent_metadata = json!({
            "chapter": {
                "config": {"min_nodes": 6, "max_nodes": 22, "pass_threshold": 80, "fail_threshold": 90},
                "state": {"progress": 85, "risk": 40, "exposure": 30},
                "timeline": [{"node": 6, "choice": "前一步", "impact": "铺垫"}],
                "node_index": 7,
                "image_token": "tok",
                "hidden_effects_map": {"静观其变": {"delta_progress": 0, "delta_risk": 0, "delta_exposure": 0}}
            }
        });

        let payload = engine
            .continue_story(ContinueRequest {
                wish: "李世民",
                history: &[],
                choice: "静观其变",
                choice_summary: Some("按兵不动"),
                chapter_number: 7,
                parent_success_rate: None,
                parent_metadata: &parent_metadata,
            })
            .await
            .unwrap();

        assert!(payload.choices.is_empty());
        let settlement = &payload.metadata["chapter"]["settlement"];
        assert_eq!(settlement["result"], "success");
        assert_eq!(settlement["grade"], "A");
        assert_eq!(settlement["chapter_summary"], "本章收束，故事暂告一段。");
    }

    #[tokio::test]
    async fn json_repair_recovers_then_gives_up() {
        let tmp = TempDir::new().unwrap();
        let (engine, provider) = engine_with(
            MockChatProvider::scripted(vec![
                Ok("模型输出了一堆闲聊，没有JSON对象可言，这里足够长".into()),
                Ok(node_json("修复后的开场")),
            ]),
            &tmp,
        );
        let payload = engine.start_story("刘邦").await.unwrap();
        assert_eq!(payload.text, "修复后的开场");
        assert_eq!(provider.call_count(), 2);

        let tmp = TempDir::new().unwrap();
        let (engine, _) = engine_with(
            MockChatProvider::scripted(vec![
                Ok("模型输出了一堆闲聊，没有JSON对象可言，这里足够长".into()),
                Ok("修复也失败了，还是没有JSON".into()),
            ]),
            &tmp,
        );
        let error = engine.start_story("刘邦").await.unwrap_err();
        assert!(matches!(error, EngineError::InvalidModelOutput(_)));
    }

    #[tokio::test]
    async fn llm_outage_surfaces_as_provider_error() {
        let tmp = TempDir::new().unwrap();
        let (engine, _) = engine_with(
            MockChatProvider::always_err(ProviderError::NetworkError("down".into())),
            &tmp,
        );
        let error = engine.start_story("李世民").await.unwrap_err();
        assert!(matches!(
            error,
            EngineError::Provider(ProviderError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn prepare_level_parses_brief() {
        let tmp = TempDir::new().unwrap();
        let (engine, _) = engine_with(
            MockChatProvider::scripted(vec![Ok(json!({
                "level_title": "玄武门前夜",
                "background": "长安暗流涌动……",
                "main_quest": "在三日内赢得禁军支持",
            })
            .to_string())]),
            &tmp,
        );
        let brief = engine.prepare_level("李世民").await.unwrap();
        assert_eq!(brief.level_title, "玄武门前夜");
        assert_eq!(brief.main_quest, "在三日内赢得禁军支持");
    }
}
