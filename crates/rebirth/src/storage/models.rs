use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::types::DisplayChoice;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub token_version: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GameSession {
    pub id: i64,
    pub user_id: String,
    pub wish: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoryNode {
    pub id: i64,
    pub session_id: i64,
    pub parent_id: Option<i64>,
    pub user_choice: Option<String>,
    pub story_text: String,
    pub image_url: String,
    /// JSON array of display choices (no effects — those live in metadata).
    pub choices: String,
    /// JSON object; carries the chapter block.
    pub metadata: String,
    pub success_rate: Option<i64>,
    pub is_speculative: bool,
    pub speculative_depth: Option<i64>,
    pub speculative_expires_at: Option<String>,
    pub created_at: String,
}

impl StoryNode {
    pub fn display_choices(&self) -> Vec<DisplayChoice> {
        serde_json::from_str(&self.choices).unwrap_or_default()
    }

    pub fn metadata_value(&self) -> Value {
        serde_json::from_str(&self.metadata).unwrap_or(Value::Null)
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StorySave {
    pub id: i64,
    pub session_id: i64,
    pub node_id: i64,
    pub title: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStatus {
    Active,
    Completed,
    Failed,
}

impl SaveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveStatus::Active => "active",
            SaveStatus::Completed => "completed",
            SaveStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SaveStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SaveStatus::Active),
            "completed" => Ok(SaveStatus::Completed),
            "failed" => Ok(SaveStatus::Failed),
            other => Err(format!("invalid save status: {other}")),
        }
    }
}
