//! Read-side chronicle queries: sessions, per-session history, latest and
//! deepest nodes. Speculative nodes never appear here — they are unvisited
//! branches and would spoil the story.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use rebirth::engine::types::DisplayChoice;
use rebirth::storage::GameSession;

use crate::auth::CurrentUser;
use crate::errors::ApiError;
use crate::segment::{sanitize_choices, segment_from_node, StorySegment};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/story/sessions", get(list_sessions))
        .route("/story/sessions/{id}", get(session_detail))
        .route("/story/sessions/{id}/latest", get(latest_in_session))
        .route("/story/latest", get(deepest_for_user))
}

#[derive(Serialize, ToSchema)]
pub struct SessionSummary {
    pub id: i64,
    pub wish: String,
    pub created_at: String,
}

impl From<GameSession> for SessionSummary {
    fn from(session: GameSession) -> Self {
        Self {
            id: session.id,
            wish: session.wish,
            created_at: session.created_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct SessionNodeDetail {
    pub id: i64,
    pub text: String,
    pub image_url: String,
    pub user_choice: Option<String>,
    pub created_at: String,
    pub chapter_number: i64,
    #[schema(value_type = Vec<Object>)]
    pub choices: Vec<DisplayChoice>,
}

#[derive(Serialize, ToSchema)]
pub struct SessionDetail {
    pub id: i64,
    pub wish: String,
    pub created_at: String,
    pub nodes: Vec<SessionNodeDetail>,
}

async fn list_sessions(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let sessions = state.store.list_sessions_for_user(&user.0.id).await?;
    Ok(Json(sessions.into_iter().map(SessionSummary::from).collect()))
}

async fn session_detail(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<i64>,
) -> Result<Json<SessionDetail>, ApiError> {
    let session = state
        .store
        .get_session(session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("会话 {session_id} 不存在")))?;
    if session.user_id != user.0.id {
        return Err(ApiError::Forbidden("无权访问该会话".into()));
    }

    let nodes = state.store.get_session_history(session.id).await?;
    let nodes = nodes
        .into_iter()
        .enumerate()
        .map(|(index, node)| SessionNodeDetail {
            id: node.id,
            text: node.story_text.clone(),
            image_url: node.image_url.clone(),
            user_choice: node.user_choice.clone(),
            created_at: node.created_at.clone(),
            // history is already path-ordered; position is the chapter
            chapter_number: index as i64 + 1,
            choices: sanitize_choices(node.display_choices()),
        })
        .collect();

    Ok(Json(SessionDetail {
        id: session.id,
        wish: session.wish,
        created_at: session.created_at,
        nodes,
    }))
}

async fn latest_in_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<i64>,
) -> Result<Json<StorySegment>, ApiError> {
    let session = state
        .store
        .get_session(session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("会话 {session_id} 不存在")))?;
    if session.user_id != user.0.id {
        return Err(ApiError::Forbidden("无权访问该会话".into()));
    }

    let node = state
        .store
        .latest_node_in_session(session.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("该会话还没有故事节点".into()))?;
    let chapter_number = state.store.calculate_chapter_number(&node).await?;
    Ok(Json(segment_from_node(&node, chapter_number, None)))
}

async fn deepest_for_user(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<StorySegment>, ApiError> {
    let (_, node) = state
        .store
        .get_deepest_node_for_user(&user.0.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("还没有任何故事".into()))?;
    let chapter_number = state.store.calculate_chapter_number(&node).await?;
    Ok(Json(segment_from_node(&node, chapter_number, None)))
}
