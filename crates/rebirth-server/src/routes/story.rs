//! Interactive story endpoints: wish check, two-phase start, continue,
//! retry, and the metrics snapshot.

use std::time::Duration;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use utoipa::ToSchema;

use rebirth::engine::ContinueRequest;
use rebirth::moderation;
use rebirth::priming::{PrimeKey, PrimedStory};
use rebirth::speculation::extract_chapter_number;
use rebirth::storage::{GameSession, NewNode, StoreError, StoryNode};

use crate::auth::CurrentUser;
use crate::errors::ApiError;
use crate::segment::{segment_from_node, StorySegment};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/story/check_wish", post(check_wish))
        .route("/story/prepare_start", post(prepare_start))
        .route("/story/start", post(start_story))
        .route("/story/continue", post(continue_story))
        .route("/story/retry", post(retry_story))
        .route("/story/metrics", get(metrics))
}

#[derive(Deserialize, ToSchema)]
pub struct WishRequest {
    pub wish: String,
}

#[derive(Serialize, ToSchema)]
pub struct WishCheckResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct PrepareStartResponse {
    pub level_title: String,
    pub background: String,
    pub main_quest: String,
    #[schema(value_type = Object)]
    pub metadata: Value,
}

#[derive(Deserialize, ToSchema)]
pub struct StoryContinueRequest {
    pub session_id: i64,
    pub node_id: i64,
    pub choice: String,
}

#[derive(Deserialize, ToSchema)]
pub struct StoryRetryRequest {
    pub node_id: i64,
}

fn validate_wish(wish: &str) -> Result<String, ApiError> {
    moderation::check_wish_basic(wish)
        .map_err(|rejection| ApiError::Invalid(rejection.reason))?;
    Ok(wish.trim().to_string())
}

async fn check_wish(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<WishRequest>,
) -> Result<Json<WishCheckResponse>, ApiError> {
    let verdict = moderation::check_wish(&state.llm, &request.wish).await;

    let (status, reason, category) = match &verdict {
        Ok(()) => ("approved", None, None),
        Err(rejection) => (
            "rejected",
            Some(rejection.reason.clone()),
            rejection.category.clone(),
        ),
    };
    state
        .store
        .record_wish_moderation(Some(&user.0.id), request.wish.trim(), status, reason.as_deref())
        .await?;

    Ok(Json(WishCheckResponse {
        ok: verdict.is_ok(),
        reason,
        category,
    }))
}

/// Reuse or create the session and its root node. The root uniqueness index
/// linearizes concurrent creators; losers read the winner's row.
async fn ensure_root(
    state: &AppState,
    user_id: &str,
    wish: &str,
) -> Result<(GameSession, StoryNode, &'static str), ApiError> {
    let session = state.store.create_session(user_id, wish).await?;

    if let Some(root) = state.store.root_node(session.id).await? {
        return Ok((session, root, "reused"));
    }

    let payload = state.generator.start_story(wish).await?;
    match state
        .store
        .create_node(NewNode {
            session_id: session.id,
            parent_id: None,
            user_choice: None,
            payload: &payload,
            speculative: false,
            speculative_depth: None,
        })
        .await
    {
        Ok(root) => Ok((session, root, "generated")),
        Err(StoreError::Conflict(_)) => {
            let root = state
                .store
                .root_node(session.id)
                .await?
                .ok_or_else(|| ApiError::Internal("root winner missing after collision".into()))?;
            Ok((session, root, "reused"))
        }
        Err(error) => Err(error.into()),
    }
}

/// Background half of the two-phase start: generate (or reuse) the root,
/// publish it in the priming cache, and pre-expand one level short of the
/// full depth. Any failure clears the cache key; the player's `start` then
/// falls through to the synchronous path none the wiser.
async fn prime_first_story(state: AppState, user_id: String, wish: String) {
    let key = PrimeKey::new(&user_id, &wish);
    let outcome: Result<(), ApiError> = async {
        let (session, root, trace) = ensure_root(&state, &user_id, &wish).await?;
        state.priming.store(
            key.clone(),
            PrimedStory {
                session_id: session.id,
                root_node_id: root.id,
                trace: trace.to_string(),
            },
        );
        let depth = state.settings.speculation_max_depth.saturating_sub(1);
        if depth > 0 {
            state.speculation.enqueue(session.id, root.id, Some(depth));
        }
        Ok(())
    }
    .await;

    if let Err(error) = outcome {
        tracing::warn!(%wish, ?error, "background first-story priming failed");
        state.priming.remove(&key);
    }
}

async fn prepare_start(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<WishRequest>,
) -> Result<Json<PrepareStartResponse>, ApiError> {
    let wish = validate_wish(&request.wish)?;

    let brief = state.generator.prepare_level(&wish).await?;

    tokio::spawn(prime_first_story(state.clone(), user.0.id.clone(), wish.clone()));

    Ok(Json(PrepareStartResponse {
        level_title: brief.level_title,
        background: brief.background,
        main_quest: brief.main_quest,
        metadata: json!({
            "wish": wish,
            "generated_at": chrono::Utc::now().to_rfc3339(),
        }),
    }))
}

async fn start_story(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<WishRequest>,
) -> Result<Json<StorySegment>, ApiError> {
    let wish = validate_wish(&request.wish)?;
    let key = PrimeKey::new(&user.0.id, &wish);

    // Give the background prime task its poll budget before generating
    // synchronously.
    let deadline = Instant::now() + Duration::from_secs(state.settings.start_cache_wait_seconds);
    let poll = Duration::from_millis(state.settings.start_cache_poll_interval_ms);
    let mut primed: Option<PrimedStory> = state.priming.pop(&key);
    while primed.is_none() && Instant::now() < deadline {
        tokio::time::sleep(poll).await;
        primed = state.priming.pop(&key);
    }

    let (session, root) = match primed {
        Some(primed) => {
            tracing::info!(trace = %primed.trace, "start served from priming cache");
            let session = state
                .store
                .get_session(primed.session_id)
                .await?
                .filter(|s| s.user_id == user.0.id);
            let root = state.store.get_node(primed.root_node_id).await?;
            match (session, root) {
                (Some(session), Some(root)) => (session, root),
                // cache pointed at rows that vanished; regenerate
                _ => {
                    let (session, root, _) = ensure_root(&state, &user.0.id, &wish).await?;
                    (session, root)
                }
            }
        }
        None => {
            tracing::info!("priming cache miss, generating root synchronously");
            let (session, root, _) = ensure_root(&state, &user.0.id, &wish).await?;
            (session, root)
        }
    };

    state.speculation.enqueue(session.id, root.id, None);

    Ok(Json(segment_from_node(&root, 1, None)))
}

async fn continue_story(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<StoryContinueRequest>,
) -> Result<Json<StorySegment>, ApiError> {
    let choice = request.choice.trim().to_string();
    if choice.is_empty() {
        return Err(ApiError::Invalid("用户选择不能为空".into()));
    }

    let session = state
        .store
        .get_session(request.session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("会话 {} 不存在", request.session_id)))?;
    if session.user_id != user.0.id {
        return Err(ApiError::Forbidden("无权访问该会话".into()));
    }
    let parent = state
        .store
        .get_node(request.node_id)
        .await?
        .filter(|node| node.session_id == session.id)
        .ok_or_else(|| ApiError::NotFound(format!("节点 {} 不存在", request.node_id)))?;

    // A speculative worker may be generating this exact branch right now;
    // waiting for it reuses its result instead of paying a second LLM call.
    // The wait is bounded: past the deadline we fall through to inline
    // generation, which the uniqueness constraint keeps safe.
    let race_deadline =
        Instant::now() + Duration::from_secs(state.settings.race_wait_max_seconds);
    let race_poll = Duration::from_millis(state.settings.race_wait_interval_ms);
    while state
        .speculation
        .is_choice_generating(session.id, parent.id, &choice)
    {
        if Instant::now() >= race_deadline {
            tracing::warn!(
                parent = parent.id,
                %choice,
                "race wait exceeded, falling through to inline generation"
            );
            break;
        }
        tokio::time::sleep(race_poll).await;
    }

    let node = match state
        .store
        .get_child_by_parent_and_choice(session.id, parent.id, &choice)
        .await?
    {
        Some(existing) => {
            let node = if existing.is_speculative {
                state.store.finalize_speculative(existing.id).await?
            } else {
                existing
            };

            let ready = state
                .store
                .wait_for_node_complete(
                    node.id,
                    &state.settings.generated_image_dir,
                    Duration::from_millis(state.settings.node_ready_poll_interval_ms),
                    Duration::from_secs(state.settings.node_ready_max_wait_seconds),
                )
                .await?;
            if !ready {
                tracing::warn!(node = node.id, "node still incomplete after readiness wait");
            }
            node
        }
        None => {
            // Inline generation happens outside any transaction: LLM calls
            // take seconds and must not hold database locks.
            let history = state.store.conversation_history(&parent).await?;
            let parent_metadata = parent.metadata_value();
            let chapter_number = extract_chapter_number(&parent_metadata);
            let choice_summary = parent
                .display_choices()
                .into_iter()
                .find(|c| c.option == choice)
                .map(|c| c.summary);

            let payload = state
                .generator
                .continue_story(ContinueRequest {
                    wish: &session.wish,
                    history: &history,
                    choice: &choice,
                    choice_summary: choice_summary.as_deref(),
                    chapter_number,
                    parent_success_rate: parent.success_rate,
                    parent_metadata: &parent_metadata,
                })
                .await?;

            let (node, created) = state
                .store
                .create_child_guarded(NewNode {
                    session_id: session.id,
                    parent_id: Some(parent.id),
                    user_choice: Some(&choice),
                    payload: &payload,
                    speculative: false,
                    speculative_depth: None,
                })
                .await?;

            // Lost the race to a speculative worker: promote its node.
            if !created && node.is_speculative {
                state.store.finalize_speculative(node.id).await?
            } else {
                node
            }
        }
    };

    state.speculation.enqueue(session.id, node.id, None);

    let chapter_number = state.store.calculate_chapter_number(&node).await?;
    Ok(Json(segment_from_node(&node, chapter_number, None)))
}

async fn retry_story(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<StoryRetryRequest>,
) -> Result<Json<StorySegment>, ApiError> {
    let node = state
        .store
        .get_node(request.node_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("节点 {} 不存在", request.node_id)))?;
    let session = state
        .store
        .get_session(node.session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("会话 {} 不存在", node.session_id)))?;
    if session.user_id != user.0.id {
        return Err(ApiError::Forbidden("无权访问该会话".into()));
    }

    let node = state
        .store
        .prune_after_node(node.id, state.settings.speculation_max_depth)
        .await?;

    let chapter_number = state.store.calculate_chapter_number(&node).await?;
    Ok(Json(segment_from_node(&node, chapter_number, Some("retry"))))
}

async fn metrics(State(state): State<AppState>, _user: CurrentUser) -> Json<Value> {
    Json(json!({
        "llm": state.llm.metrics_snapshot(),
        "speculation": state.speculation.metrics_snapshot(),
    }))
}
