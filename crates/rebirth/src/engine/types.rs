use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::providers::errors::ProviderError;

/// A choice as shown to the player. Scoring fields are part of the wire
/// shape but are always null: numbers never reach the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayChoice {
    pub option: String,
    pub summary: String,
    #[serde(default)]
    pub success_rate_delta: Option<i64>,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl DisplayChoice {
    pub fn new(option: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            option: option.into(),
            summary: summary.into(),
            success_rate_delta: None,
            risk_level: None,
            tags: None,
        }
    }
}

/// Everything the engine produces for one story node, ready to persist.
/// `metadata` carries the chapter block including the hidden effects map;
/// the server strips that map before anything is serialized to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePayload {
    pub text: String,
    pub choices: Vec<DisplayChoice>,
    pub image_url: String,
    pub success_rate: Option<i64>,
    pub metadata: Value,
}

/// Synopsis returned by `prepare_start` while the root node generates in the
/// background.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelBrief {
    pub level_title: String,
    pub background: String,
    pub main_quest: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The model produced output that could not be coerced into the node
    /// schema even after one repair round trip.
    #[error("invalid model output: {0}")]
    InvalidModelOutput(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}
