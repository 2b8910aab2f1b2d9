//! End-to-end route tests against a scripted story generator: no network,
//! real SQLite, real scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use rebirth::config::Settings;
use rebirth::engine::types::{DisplayChoice, EngineError, LevelBrief, NodePayload};
use rebirth::engine::{ContinueRequest, StoryGenerator};
use rebirth::priming::FirstStoryCache;
use rebirth::providers::chat::OpenAiCompatProvider;
use rebirth::providers::llm::LlmClient;
use rebirth::speculation::{SpeculationConfig, SpeculationService};
use rebirth::storage::{StoryStore, User};
use rebirth_server::auth::mint_access_token;
use rebirth_server::routes;
use rebirth_server::state::AppState;

struct ScriptedGenerator {
    start_calls: AtomicUsize,
    continue_calls: AtomicUsize,
}

impl ScriptedGenerator {
    fn new() -> Self {
        Self {
            start_calls: AtomicUsize::new(0),
            continue_calls: AtomicUsize::new(0),
        }
    }

    fn node_payload(text: &str, options: [&str; 3], chapter_number: i64) -> NodePayload {
        let choices: Vec<DisplayChoice> = options
            .iter()
            .map(|option| DisplayChoice::new(*option, format!("{option}的走向")))
            .collect();
        let effects: Value = options
            .iter()
            .map(|option| {
                (
                    option.to_string(),
                    json!({"delta_progress": 5, "delta_risk": 1, "delta_exposure": 0}),
                )
            })
            .collect::<serde_json::Map<String, Value>>()
            .into();
        NodePayload {
            text: text.to_string(),
            choices,
            image_url: "http://127.0.0.1:8000/static/scene.png".into(),
            success_rate: None,
            metadata: json!({
                "chapter_number": chapter_number,
                "type": if chapter_number == 1 { "start" } else { "continue" },
                "chapter": {
                    "node_index": chapter_number,
                    "state": {"progress": 0, "risk": 0, "exposure": 0},
                    "hidden_effects_map": effects,
                },
            }),
        }
    }
}

#[async_trait]
impl StoryGenerator for ScriptedGenerator {
    async fn start_story(&self, _wish: &str) -> Result<NodePayload, EngineError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::node_payload("开场", ["选项一", "选项二", "选项三"], 1))
    }

    async fn continue_story(
        &self,
        request: ContinueRequest<'_>,
    ) -> Result<NodePayload, EngineError> {
        self.continue_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::node_payload(
            &format!("续写：{}", request.choice),
            ["后续一", "后续二", "后续三"],
            request.chapter_number + 1,
        ))
    }

    async fn prepare_level(&self, _wish: &str) -> Result<LevelBrief, EngineError> {
        Ok(LevelBrief {
            level_title: "玄武门前夜".into(),
            background: "长安暗流涌动".into(),
            main_quest: "赢得禁军支持".into(),
        })
    }
}

struct TestApp {
    app: Router,
    store: StoryStore,
    generator: Arc<ScriptedGenerator>,
    settings: Arc<Settings>,
    _tmp: TempDir,
}

impl TestApp {
    async fn new(speculation_enabled: bool) -> Self {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("library")).unwrap();
        std::fs::create_dir_all(tmp.path().join("generated")).unwrap();

        let mut settings = Settings::from_env();
        settings.secret_key = "test-secret-key-that-is-long-enough!!".into();
        settings.database_path = tmp.path().join("api.db");
        settings.image_library_dir = tmp.path().join("library");
        settings.generated_image_dir = tmp.path().join("generated");
        settings.llm_base_url = "http://127.0.0.1:9".into();
        settings.llm_max_retries = 0;
        settings.llm_retry_backoff_min_ms = 1;
        settings.llm_retry_backoff_max_ms = 1;
        settings.start_cache_wait_seconds = 2;
        settings.start_cache_poll_interval_ms = 25;
        settings.race_wait_interval_ms = 20;
        settings.race_wait_max_seconds = 5;
        settings.node_ready_poll_interval_ms = 20;
        settings.node_ready_max_wait_seconds = 1;
        settings.speculation_enabled = speculation_enabled;
        settings.speculation_max_depth = 1;

        let store = StoryStore::open(&settings.database_path).await.unwrap();
        let provider = Arc::new(OpenAiCompatProvider::from_settings(&settings).unwrap());
        let llm = Arc::new(LlmClient::new(provider, &settings));
        let generator = Arc::new(ScriptedGenerator::new());
        let speculation = SpeculationService::new(
            SpeculationConfig::from_settings(&settings),
            store.clone(),
            generator.clone(),
        );
        let priming = Arc::new(FirstStoryCache::new(settings.first_story_cache_max_entries));

        let settings = Arc::new(settings);
        let state = AppState::new(
            settings.clone(),
            store.clone(),
            generator.clone(),
            llm,
            speculation,
            priming,
        );
        let app = routes::configure(state);

        Self {
            app,
            store,
            generator,
            settings,
            _tmp: tmp,
        }
    }

    async fn user(&self, email: &str) -> (User, String) {
        let user = self.store.create_user(email, "x").await.unwrap();
        let token = mint_access_token(&self.settings, &user).unwrap();
        (user, token)
    }

    async fn request(&self, method: &str, uri: &str, token: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::COOKIE, format!("access_token={token}"));
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = self
            .app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn wait_for_node_count(&self, session_id: i64, expected: i64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let count = self.store.count_session_nodes(session_id).await.unwrap();
            if count >= expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {expected} nodes, still at {count}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

fn assert_sanitized(segment: &Value) {
    assert!(segment["success_rate"].is_null());
    let chapter = &segment["metadata"]["chapter"];
    if !chapter.is_null() {
        assert!(
            chapter.get("hidden_effects_map").is_none(),
            "hidden_effects_map leaked: {chapter}"
        );
        assert_eq!(chapter["hide_success_rate"], true);
    }
    for choice in segment["choices"].as_array().unwrap() {
        assert!(choice["success_rate_delta"].is_null());
        assert!(choice["risk_level"].is_null());
        assert!(choice["tags"].is_null());
    }
}

#[tokio::test]
async fn start_returns_sanitized_segment_and_primes_frontier() {
    let app = TestApp::new(true).await;
    let (_, token) = app.user("player@example.com").await;

    let (status, segment) = app
        .request("POST", "/api/story/start", &token, Some(json!({"wish": "李世民"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(segment["text"], "开场");
    assert_eq!(segment["metadata"]["chapter_number"], 1);
    assert_sanitized(&segment);
    assert_eq!(app.generator.start_calls.load(Ordering::SeqCst), 1);

    // depth-1 speculation expands all three root choices
    let session_id = segment["session_id"].as_i64().unwrap();
    app.wait_for_node_count(session_id, 4).await;
    assert_eq!(app.generator.continue_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn two_phase_start_reuses_the_primed_root() {
    let app = TestApp::new(false).await;
    let (_, token) = app.user("player@example.com").await;

    let (status, prepared) = app
        .request(
            "POST",
            "/api/story/prepare_start",
            &token,
            Some(json!({"wish": "李世民"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(prepared["level_title"], "玄武门前夜");

    // start polls the priming cache, so it picks up the background root
    // without generating a second one
    let (status, segment) = app
        .request("POST", "/api/story/start", &token, Some(json!({"wish": "李世民"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.generator.start_calls.load(Ordering::SeqCst), 1);

    let session_id = segment["session_id"].as_i64().unwrap();
    let root = app.store.root_node(session_id).await.unwrap().unwrap();
    assert_eq!(segment["node_id"].as_i64().unwrap(), root.id);
    assert!(!root.is_speculative);
}

#[tokio::test]
async fn continue_promotes_the_speculative_child() {
    let app = TestApp::new(true).await;
    let (_, token) = app.user("player@example.com").await;

    let (_, segment) = app
        .request("POST", "/api/story/start", &token, Some(json!({"wish": "李世民"})))
        .await;
    let session_id = segment["session_id"].as_i64().unwrap();
    let root_id = segment["node_id"].as_i64().unwrap();
    app.wait_for_node_count(session_id, 4).await;

    let calls_before = app.generator.continue_calls.load(Ordering::SeqCst);
    let expected = app
        .store
        .get_child_by_parent_and_choice(session_id, root_id, "选项一")
        .await
        .unwrap()
        .unwrap();
    assert!(expected.is_speculative);

    let (status, next) = app
        .request(
            "POST",
            "/api/story/continue",
            &token,
            Some(json!({"session_id": session_id, "node_id": root_id, "choice": "选项一"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(next["node_id"].as_i64().unwrap(), expected.id);
    assert_eq!(next["metadata"]["chapter_number"], 2);
    assert_sanitized(&next);

    let promoted = app.store.get_node(expected.id).await.unwrap().unwrap();
    assert!(!promoted.is_speculative);
    assert!(promoted.speculative_depth.is_none());

    // served from the speculative cache: no inline generation beyond the
    // re-expansion of the new frontier
    let calls_after = app.generator.continue_calls.load(Ordering::SeqCst);
    assert!(calls_after >= calls_before);
}

#[tokio::test]
async fn concurrent_continues_converge_on_one_child() {
    let app = TestApp::new(false).await;
    let (_, token) = app.user("player@example.com").await;

    let (_, segment) = app
        .request("POST", "/api/story/start", &token, Some(json!({"wish": "项羽"})))
        .await;
    let session_id = segment["session_id"].as_i64().unwrap();
    let root_id = segment["node_id"].as_i64().unwrap();

    let body = json!({"session_id": session_id, "node_id": root_id, "choice": "选项二"});
    let (first, second) = tokio::join!(
        app.request("POST", "/api/story/continue", &token, Some(body.clone())),
        app.request("POST", "/api/story/continue", &token, Some(body.clone())),
    );
    assert_eq!(first.0, StatusCode::OK);
    assert_eq!(second.0, StatusCode::OK);
    assert_eq!(first.1["node_id"], second.1["node_id"]);

    let children = app.store.get_children(root_id).await.unwrap();
    assert_eq!(children.len(), 1);
}

#[tokio::test]
async fn continue_rejects_foreign_sessions_and_empty_choices() {
    let app = TestApp::new(false).await;
    let (_, token) = app.user("player@example.com").await;
    let (_, stranger_token) = app.user("stranger@example.com").await;

    let (_, segment) = app
        .request("POST", "/api/story/start", &token, Some(json!({"wish": "刘邦"})))
        .await;
    let session_id = segment["session_id"].as_i64().unwrap();
    let root_id = segment["node_id"].as_i64().unwrap();

    let (status, _) = app
        .request(
            "POST",
            "/api/story/continue",
            &stranger_token,
            Some(json!({"session_id": session_id, "node_id": root_id, "choice": "选项一"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .request(
            "POST",
            "/api/story/continue",
            &token,
            Some(json!({"session_id": session_id, "node_id": root_id, "choice": "  "})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .request(
            "POST",
            "/api/story/continue",
            &token,
            Some(json!({"session_id": session_id, "node_id": 999_999, "choice": "选项一"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retry_demotes_descendants_and_later_continue_reuses_them() {
    let app = TestApp::new(false).await;
    let (_, token) = app.user("player@example.com").await;

    let (_, segment) = app
        .request("POST", "/api/story/start", &token, Some(json!({"wish": "李世民"})))
        .await;
    let session_id = segment["session_id"].as_i64().unwrap();
    let root_id = segment["node_id"].as_i64().unwrap();

    let (_, child_segment) = app
        .request(
            "POST",
            "/api/story/continue",
            &token,
            Some(json!({"session_id": session_id, "node_id": root_id, "choice": "选项一"})),
        )
        .await;
    let child_id = child_segment["node_id"].as_i64().unwrap();

    let (_, grandchild_segment) = app
        .request(
            "POST",
            "/api/story/continue",
            &token,
            Some(json!({"session_id": session_id, "node_id": child_id, "choice": "后续一"})),
        )
        .await;
    let grandchild_id = grandchild_segment["node_id"].as_i64().unwrap();
    let calls_after_build = app.generator.continue_calls.load(Ordering::SeqCst);

    let (status, retried) = app
        .request(
            "POST",
            "/api/story/retry",
            &token,
            Some(json!({"node_id": child_id})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(retried["node_id"].as_i64().unwrap(), child_id);
    assert_eq!(retried["metadata"]["source"], "retry");

    // the grandchild was demoted, not deleted
    let demoted = app.store.get_node(grandchild_id).await.unwrap().unwrap();
    assert!(demoted.is_speculative);

    // re-entering the same path reuses the cached subtree with no new
    // generation
    let (status, revisited) = app
        .request(
            "POST",
            "/api/story/continue",
            &token,
            Some(json!({"session_id": session_id, "node_id": child_id, "choice": "后续一"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(revisited["node_id"].as_i64().unwrap(), grandchild_id);
    assert_eq!(
        app.generator.continue_calls.load(Ordering::SeqCst),
        calls_after_build
    );

    let refetched = app.store.get_node(grandchild_id).await.unwrap().unwrap();
    assert!(!refetched.is_speculative);
}

#[tokio::test]
async fn chronicle_lists_confirmed_nodes_only() {
    let app = TestApp::new(true).await;
    let (_, token) = app.user("player@example.com").await;

    let (_, segment) = app
        .request("POST", "/api/story/start", &token, Some(json!({"wish": "李世民"})))
        .await;
    let session_id = segment["session_id"].as_i64().unwrap();
    app.wait_for_node_count(session_id, 4).await;

    let (status, detail) = app
        .request("GET", &format!("/api/story/sessions/{session_id}"), &token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    // speculative children are spoilers and stay hidden
    assert_eq!(detail["nodes"].as_array().unwrap().len(), 1);
    assert_eq!(detail["nodes"][0]["chapter_number"], 1);

    let (status, latest) = app
        .request("GET", "/api/story/latest", &token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(latest["session_id"].as_i64().unwrap(), session_id);
    assert_sanitized(&latest);
}

#[tokio::test]
async fn saves_crud_with_status_validation() {
    let app = TestApp::new(false).await;
    let (_, token) = app.user("player@example.com").await;

    let (_, segment) = app
        .request("POST", "/api/story/start", &token, Some(json!({"wish": "项羽"})))
        .await;
    let session_id = segment["session_id"].as_i64().unwrap();
    let node_id = segment["node_id"].as_i64().unwrap();

    let (status, save) = app
        .request(
            "POST",
            "/api/story/saves",
            &token,
            Some(json!({"session_id": session_id, "node_id": node_id, "title": "第一章"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let save_id = save["id"].as_i64().unwrap();
    assert_eq!(save["status"], "active");

    let (status, _) = app
        .request("GET", "/api/story/saves?status=paused", &token, None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, listed) = app
        .request("GET", "/api/story/saves?status=active", &token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, updated) = app
        .request(
            "PATCH",
            &format!("/api/story/saves/{save_id}"),
            &token,
            Some(json!({"status": "completed"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["status"], "completed");

    let (status, detail) = app
        .request("GET", &format!("/api/story/saves/{save_id}"), &token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["node"]["node_id"].as_i64().unwrap(), node_id);

    let (status, _) = app
        .request("DELETE", &format!("/api/story/saves/{save_id}"), &token, None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app
        .request("GET", &format!("/api/story/saves/{save_id}"), &token, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn check_wish_rejects_banned_words_and_fails_open_on_llm_outage() {
    let app = TestApp::new(false).await;
    let (_, token) = app.user("player@example.com").await;

    // banned word: rejected locally, no LLM involved
    let (status, verdict) = app
        .request(
            "POST",
            "/api/story/check_wish",
            &token,
            Some(json!({"wish": "我想重生去贩毒"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verdict["ok"], false);
    assert!(verdict["reason"].as_str().unwrap().contains("敏感词"));

    // clean wish: the (unreachable) LLM classifier fails open
    let (status, verdict) = app
        .request(
            "POST",
            "/api/story/check_wish",
            &token,
            Some(json!({"wish": "李世民"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verdict["ok"], true);
}

#[tokio::test]
async fn bumped_token_version_invalidates_old_tokens() {
    let app = TestApp::new(false).await;
    let (user, token) = app.user("player@example.com").await;

    let (status, _) = app
        .request("POST", "/api/story/start", &token, Some(json!({"wish": "李世民"})))
        .await;
    assert_eq!(status, StatusCode::OK);

    // logging in elsewhere bumps the version; the old cookie dies
    app.store.bump_token_version(&user.id).await.unwrap();
    let (status, body) = app
        .request("POST", "/api/story/start", &token, Some(json!({"wish": "李世民"})))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("登录状态已失效"));
}

#[tokio::test]
async fn auth_is_required_and_metrics_respond() {
    let app = TestApp::new(false).await;

    let (status, _) = app
        .request("POST", "/api/story/start", "not-a-token", Some(json!({"wish": "x"})))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, token) = app.user("player@example.com").await;
    let (status, metrics) = app.request("GET", "/api/story/metrics", &token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(metrics["llm"]["calls_total"].is_number());
    assert_eq!(metrics["speculation"]["enabled"], false);
    assert!(metrics["speculation"]["pending_jobs"].is_number());
}
