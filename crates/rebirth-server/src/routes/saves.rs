//! Save bookmarks: user-named markers onto story nodes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use rebirth::storage::{SaveStatus, StorySave};

use crate::auth::CurrentUser;
use crate::errors::ApiError;
use crate::segment::{segment_from_node, StorySegment};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/story/saves", post(create_save).get(list_saves))
        .route(
            "/story/saves/{id}",
            get(get_save).patch(update_save).delete(delete_save),
        )
}

#[derive(Deserialize, ToSchema)]
pub struct SaveCreateRequest {
    pub session_id: i64,
    pub node_id: i64,
    pub title: String,
}

#[derive(Deserialize, ToSchema)]
pub struct SaveUpdateRequest {
    pub title: Option<String>,
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct SaveListQuery {
    pub status: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct SaveDetail {
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub save: StorySave,
    pub node: StorySegment,
}

fn parse_status(raw: &str) -> Result<SaveStatus, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::Invalid(format!("无效的存档状态: {raw}")))
}

fn validate_title(title: &str) -> Result<&str, ApiError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ApiError::Invalid("存档标题不能为空".into()));
    }
    if title.chars().count() > 100 {
        return Err(ApiError::Invalid("存档标题过长，请控制在100字以内".into()));
    }
    Ok(title)
}

async fn create_save(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<SaveCreateRequest>,
) -> Result<(StatusCode, Json<StorySave>), ApiError> {
    let title = validate_title(&request.title)?;
    let save = state
        .store
        .create_save(&user.0.id, request.session_id, request.node_id, title)
        .await?;
    Ok((StatusCode::CREATED, Json(save)))
}

async fn list_saves(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<SaveListQuery>,
) -> Result<Json<Vec<StorySave>>, ApiError> {
    let status = query.status.as_deref().map(parse_status).transpose()?;
    let saves = state.store.list_saves(&user.0.id, status).await?;
    Ok(Json(saves))
}

async fn get_save(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(save_id): Path<i64>,
) -> Result<Json<SaveDetail>, ApiError> {
    let save = state
        .store
        .get_save(&user.0.id, save_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("存档 {save_id} 不存在")))?;

    let node = state
        .store
        .get_node(save.node_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("节点 {} 不存在", save.node_id)))?;
    let chapter_number = state.store.calculate_chapter_number(&node).await?;

    Ok(Json(SaveDetail {
        node: segment_from_node(&node, chapter_number, None),
        save,
    }))
}

async fn update_save(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(save_id): Path<i64>,
    Json(request): Json<SaveUpdateRequest>,
) -> Result<Json<StorySave>, ApiError> {
    let title = request.title.as_deref().map(validate_title).transpose()?;
    let status = request.status.as_deref().map(parse_status).transpose()?;
    if title.is_none() && status.is_none() {
        return Err(ApiError::Invalid("没有需要更新的字段".into()));
    }

    let save = state
        .store
        .update_save(&user.0.id, save_id, title, status)
        .await?;
    Ok(Json(save))
}

async fn delete_save(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(save_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_save(&user.0.id, save_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
