//! The client-facing story segment, and the single chokepoint where hidden
//! scoring data is stripped before serialization.

use serde::Serialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

use rebirth::engine::types::DisplayChoice;
use rebirth::storage::StoryNode;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StorySegment {
    pub session_id: i64,
    pub node_id: i64,
    pub text: String,
    #[schema(value_type = Vec<Object>)]
    pub choices: Vec<DisplayChoice>,
    pub image_url: String,
    /// Always null: scores are product-hidden.
    pub success_rate: Option<i64>,
    #[schema(value_type = Object)]
    pub metadata: Value,
}

/// Strip everything a client must not see from node metadata and stamp the
/// response-level fields. This is the only place that handles
/// `hidden_effects_map`; every outgoing segment passes through here.
pub fn sanitize_metadata(metadata: Value, chapter_number: i64, source: Option<&str>) -> Value {
    let mut metadata = match metadata {
        Value::Object(map) => Value::Object(map),
        _ => json!({}),
    };

    metadata["chapter_number"] = json!(chapter_number);
    if let Some(source) = source {
        metadata["source"] = json!(source);
    }

    if let Some(chapter) = metadata.get_mut("chapter").and_then(Value::as_object_mut) {
        chapter.remove("hidden_effects_map");
        chapter.insert("hide_success_rate".to_string(), json!(true));
    }

    metadata
}

/// Display choices with every scoring field forced to null, whatever was
/// stored.
pub fn sanitize_choices(choices: Vec<DisplayChoice>) -> Vec<DisplayChoice> {
    choices
        .into_iter()
        .map(|choice| DisplayChoice::new(choice.option, choice.summary))
        .collect()
}

pub fn segment_from_node(node: &StoryNode, chapter_number: i64, source: Option<&str>) -> StorySegment {
    StorySegment {
        session_id: node.session_id,
        node_id: node.id,
        text: node.story_text.clone(),
        choices: sanitize_choices(node.display_choices()),
        image_url: node.image_url.clone(),
        success_rate: None,
        metadata: sanitize_metadata(node.metadata_value(), chapter_number, source),
    }
}
