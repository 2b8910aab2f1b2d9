mod manager;
mod migrations;
mod models;
mod store;

pub use manager::StorageManager;
pub use migrations::CURRENT_SCHEMA_VERSION;
pub use models::{GameSession, SaveStatus, StorySave, StoryNode, User};
pub use store::{NewNode, StoreError, StoryStore};

pub const DB_NAME: &str = "rebirth.db";
