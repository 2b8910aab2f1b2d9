use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use sqlx::{Pool, Sqlite};
use thiserror::Error;
use tokio::time::Instant;

use super::models::{GameSession, SaveStatus, StorySave, StoryNode, User};
use super::StorageManager;
use crate::engine::types::NodePayload;
use crate::providers::chat::ChatMessage;

/// Upper bound on parent-pointer walks. The invariants make cycles
/// impossible; the cap keeps a corrupted database from hanging a request.
const MAX_ANCESTRY_WALK: usize = 4096;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-constraint collision. Not a failure: the caller reads the row
    /// another actor created first and continues.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

/// Parameters for inserting one story node.
pub struct NewNode<'a> {
    pub session_id: i64,
    pub parent_id: Option<i64>,
    pub user_choice: Option<&'a str>,
    pub payload: &'a NodePayload,
    pub speculative: bool,
    pub speculative_depth: Option<i64>,
}

#[derive(Clone)]
pub struct StoryStore {
    pool: Pool<Sqlite>,
}

impl StoryStore {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        let pool = StorageManager::open(db_path).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Connectivity probe for health checks.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    /// Total node count for a session, speculative included.
    pub async fn count_session_nodes(&self, session_id: i64) -> Result<i64, StoreError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM story_nodes WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ---- users ----

    pub async fn create_user(&self, email: &str, password_hash: &str) -> Result<User, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO users (id, email, password_hash) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(email)
            .bind(password_hash)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!("user email already registered: {email}"))
                } else {
                    e.into()
                }
            })?;
        self.get_user_by_id(&id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    pub async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn bump_token_version(&self, user_id: &str) -> Result<i64, StoreError> {
        sqlx::query("UPDATE users SET token_version = token_version + 1 WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        let version =
            sqlx::query_scalar::<_, i64>("SELECT token_version FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        Ok(version)
    }

    // ---- sessions ----

    /// Create the user's session for `wish`, or return the existing one.
    /// Concurrent callers serialize on UNIQUE(user_id, wish) and converge on
    /// the same row.
    pub async fn create_session(
        &self,
        user_id: &str,
        wish: &str,
    ) -> Result<GameSession, StoreError> {
        let inserted = sqlx::query("INSERT INTO game_sessions (user_id, wish) VALUES (?, ?)")
            .bind(user_id)
            .bind(wish)
            .execute(&self.pool)
            .await;

        match inserted {
            Ok(result) => {
                let id = result.last_insert_rowid();
                self.get_session(id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
            }
            Err(e) if is_unique_violation(&e) => self
                .get_session_by_user_and_wish(user_id, wish)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("session for wish '{wish}'"))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_session(&self, id: i64) -> Result<Option<GameSession>, StoreError> {
        let session = sqlx::query_as::<_, GameSession>("SELECT * FROM game_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    pub async fn get_session_by_user_and_wish(
        &self,
        user_id: &str,
        wish: &str,
    ) -> Result<Option<GameSession>, StoreError> {
        let session = sqlx::query_as::<_, GameSession>(
            "SELECT * FROM game_sessions WHERE user_id = ? AND wish = ?",
        )
        .bind(user_id)
        .bind(wish)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    pub async fn list_sessions_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<GameSession>, StoreError> {
        let sessions = sqlx::query_as::<_, GameSession>(
            "SELECT * FROM game_sessions WHERE user_id = ? ORDER BY id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    // ---- nodes ----

    /// Insert one node. A unique-index collision surfaces as
    /// [`StoreError::Conflict`]; callers fetch the winner and continue.
    pub async fn create_node(&self, new: NewNode<'_>) -> Result<StoryNode, StoreError> {
        if let Some(parent_id) = new.parent_id {
            let parent = self
                .get_node(parent_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("parent node {parent_id}")))?;
            if parent.session_id != new.session_id {
                return Err(StoreError::Invalid(format!(
                    "parent node {} does not belong to session {}",
                    parent_id, new.session_id
                )));
            }
        }

        let choices_json = serde_json::to_string(&new.payload.choices)?;
        let metadata_json = serde_json::to_string(&new.payload.metadata)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO story_nodes
                (session_id, parent_id, user_choice, story_text, image_url, choices,
                 metadata, success_rate, is_speculative, speculative_depth, speculative_expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
        "#,
        )
        .bind(new.session_id)
        .bind(new.parent_id)
        .bind(new.user_choice)
        .bind(&new.payload.text)
        .bind(&new.payload.image_url)
        .bind(&choices_json)
        .bind(&metadata_json)
        .bind(new.payload.success_rate)
        .bind(new.speculative)
        .bind(new.speculative_depth)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(result) => {
                let id = result.last_insert_rowid();
                self.get_node(id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("node {id}")))
            }
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                "node for (session={}, parent={:?}, choice={:?}) already exists",
                new.session_id, new.parent_id, new.user_choice
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// The short-transaction pattern used by the interactive continue path:
    /// re-read the parent (the row-lock analog — SQLite serializes writers at
    /// the connection level, the unique index is the backstop), double-check
    /// for an existing child, insert otherwise. Returns the node and whether
    /// this call created it.
    pub async fn create_child_guarded(
        &self,
        new: NewNode<'_>,
    ) -> Result<(StoryNode, bool), StoreError> {
        let parent_id = new
            .parent_id
            .ok_or_else(|| StoreError::Invalid("create_child_guarded requires a parent".into()))?;
        let choice = new
            .user_choice
            .ok_or_else(|| StoreError::Invalid("create_child_guarded requires a choice".into()))?;

        let mut tx = self.pool.begin().await?;

        let parent = sqlx::query_as::<_, StoryNode>("SELECT * FROM story_nodes WHERE id = ?")
            .bind(parent_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("parent node {parent_id}")))?;
        if parent.session_id != new.session_id {
            return Err(StoreError::Invalid(format!(
                "parent node {} does not belong to session {}",
                parent_id, new.session_id
            )));
        }

        if let Some(existing) = sqlx::query_as::<_, StoryNode>(
            r#"
            SELECT * FROM story_nodes
            WHERE session_id = ? AND parent_id = ? AND user_choice = ?
            ORDER BY id DESC LIMIT 1
        "#,
        )
        .bind(new.session_id)
        .bind(parent_id)
        .bind(choice)
        .fetch_optional(&mut *tx)
        .await?
        {
            tx.rollback().await?;
            return Ok((existing, false));
        }

        let choices_json = serde_json::to_string(&new.payload.choices)?;
        let metadata_json = serde_json::to_string(&new.payload.metadata)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO story_nodes
                (session_id, parent_id, user_choice, story_text, image_url, choices,
                 metadata, success_rate, is_speculative, speculative_depth, speculative_expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
        "#,
        )
        .bind(new.session_id)
        .bind(parent_id)
        .bind(choice)
        .bind(&new.payload.text)
        .bind(&new.payload.image_url)
        .bind(&choices_json)
        .bind(&metadata_json)
        .bind(new.payload.success_rate)
        .bind(new.speculative)
        .bind(new.speculative_depth)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(result) => {
                let id = result.last_insert_rowid();
                tx.commit().await?;
                let node = self
                    .get_node(id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("node {id}")))?;
                Ok((node, true))
            }
            Err(e) if is_unique_violation(&e) => {
                // A concurrent writer won between our check and insert.
                tx.rollback().await?;
                let winner = self
                    .get_child_by_parent_and_choice(new.session_id, parent_id, choice)
                    .await?
                    .ok_or_else(|| {
                        StoreError::NotFound(format!(
                            "winning child for (session={}, parent={}, choice={})",
                            new.session_id, parent_id, choice
                        ))
                    })?;
                Ok((winner, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_node(&self, id: i64) -> Result<Option<StoryNode>, StoreError> {
        let node = sqlx::query_as::<_, StoryNode>("SELECT * FROM story_nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(node)
    }

    pub async fn root_node(&self, session_id: i64) -> Result<Option<StoryNode>, StoreError> {
        let node = sqlx::query_as::<_, StoryNode>(
            "SELECT * FROM story_nodes WHERE session_id = ? AND parent_id IS NULL",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(node)
    }

    pub async fn get_children(&self, node_id: i64) -> Result<Vec<StoryNode>, StoreError> {
        let children = sqlx::query_as::<_, StoryNode>(
            "SELECT * FROM story_nodes WHERE parent_id = ? ORDER BY id ASC",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(children)
    }

    /// Latest (highest-id) child for `(parent, choice)`, speculative or not.
    pub async fn get_child_by_parent_and_choice(
        &self,
        session_id: i64,
        parent_id: i64,
        choice: &str,
    ) -> Result<Option<StoryNode>, StoreError> {
        let node = sqlx::query_as::<_, StoryNode>(
            r#"
            SELECT * FROM story_nodes
            WHERE session_id = ? AND parent_id = ? AND user_choice = ?
            ORDER BY id DESC LIMIT 1
        "#,
        )
        .bind(session_id)
        .bind(parent_id)
        .bind(choice)
        .fetch_optional(&self.pool)
        .await?;
        Ok(node)
    }

    /// Promote a speculative node to confirmed. Idempotent.
    pub async fn finalize_speculative(&self, node_id: i64) -> Result<StoryNode, StoreError> {
        sqlx::query(
            r#"
            UPDATE story_nodes
            SET is_speculative = FALSE, speculative_depth = NULL, speculative_expires_at = NULL
            WHERE id = ?
        "#,
        )
        .bind(node_id)
        .execute(&self.pool)
        .await?;
        self.get_node(node_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))
    }

    /// Demote every descendant of `node_id` to speculative so the subtree can
    /// be reused if the player re-enters the same path. The node itself is
    /// untouched and nothing is deleted.
    pub async fn prune_after_node(
        &self,
        node_id: i64,
        max_depth: u32,
    ) -> Result<StoryNode, StoreError> {
        let node = self
            .get_node(node_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))?;

        // Explicit stack, not recursion: subtrees can be deep.
        let mut descendants: Vec<i64> = Vec::new();
        let mut visited: HashSet<i64> = HashSet::from([node_id]);
        let mut stack: Vec<i64> = vec![node_id];
        while let Some(current) = stack.pop() {
            for child in self.get_children(current).await? {
                if visited.insert(child.id) {
                    descendants.push(child.id);
                    stack.push(child.id);
                }
            }
        }

        let depth = max_depth.saturating_sub(1) as i64;
        let depth: Option<i64> = (depth > 0).then_some(depth);

        let mut tx = self.pool.begin().await?;
        for id in &descendants {
            sqlx::query(
                r#"
                UPDATE story_nodes
                SET is_speculative = TRUE, speculative_depth = ?, speculative_expires_at = NULL
                WHERE id = ?
            "#,
            )
            .bind(depth)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.get_node(node_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))
    }

    /// Confirmed nodes of a session, oldest first.
    pub async fn get_session_history(
        &self,
        session_id: i64,
    ) -> Result<Vec<StoryNode>, StoreError> {
        let nodes = sqlx::query_as::<_, StoryNode>(
            r#"
            SELECT * FROM story_nodes
            WHERE session_id = ? AND is_speculative = FALSE
            ORDER BY id ASC
        "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(nodes)
    }

    /// 1-based depth of `node` measured by walking parent pointers to the
    /// root. Cycles are impossible by construction; the walk is capped anyway.
    pub async fn calculate_chapter_number(&self, node: &StoryNode) -> Result<i64, StoreError> {
        let mut depth: i64 = 1;
        let mut visited: HashSet<i64> = HashSet::from([node.id]);
        let mut parent_id = node.parent_id;

        while let Some(id) = parent_id {
            if !visited.insert(id) || visited.len() > MAX_ANCESTRY_WALK {
                tracing::error!(node_id = node.id, "ancestry walk aborted (cycle or cap)");
                break;
            }
            depth += 1;
            parent_id = match self.get_node(id).await? {
                Some(parent) => parent.parent_id,
                None => break,
            };
        }
        Ok(depth)
    }

    /// Conversation history from the root down to (and including) `node`,
    /// shaped as alternating assistant/user turns for the LLM.
    pub async fn conversation_history(
        &self,
        node: &StoryNode,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let mut path: Vec<StoryNode> = vec![node.clone()];
        let mut visited: HashSet<i64> = HashSet::from([node.id]);
        let mut parent_id = node.parent_id;

        while let Some(id) = parent_id {
            if !visited.insert(id) || visited.len() > MAX_ANCESTRY_WALK {
                break;
            }
            match self.get_node(id).await? {
                Some(parent) => {
                    parent_id = parent.parent_id;
                    path.push(parent);
                }
                None => break,
            }
        }
        path.reverse();

        let mut history = Vec::with_capacity(path.len() * 2);
        for item in &path {
            if let Some(choice) = &item.user_choice {
                history.push(ChatMessage::user(format!("我选择了：{choice}")));
            }
            history.push(ChatMessage::assistant(item.story_text.clone()));
        }
        Ok(history)
    }

    /// The user's "deepest" story: the session with the most confirmed
    /// nodes (ties broken by larger session id), and that session's
    /// highest-id confirmed node. Speculative branches are spoilers and are
    /// never considered.
    pub async fn get_deepest_node_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<(GameSession, StoryNode)>, StoreError> {
        let session_id = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT s.id FROM game_sessions s
            JOIN story_nodes n ON n.session_id = s.id AND n.is_speculative = FALSE
            WHERE s.user_id = ?
            GROUP BY s.id
            ORDER BY COUNT(n.id) DESC, s.id DESC
            LIMIT 1
        "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(session_id) = session_id else {
            return Ok(None);
        };
        let session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        let node = self.latest_node_in_session(session_id).await?;
        Ok(node.map(|n| (session, n)))
    }

    /// Highest-id confirmed node of a session.
    pub async fn latest_node_in_session(
        &self,
        session_id: i64,
    ) -> Result<Option<StoryNode>, StoreError> {
        let node = sqlx::query_as::<_, StoryNode>(
            r#"
            SELECT * FROM story_nodes
            WHERE session_id = ? AND is_speculative = FALSE
            ORDER BY id DESC LIMIT 1
        "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(node)
    }

    // ---- node readiness ----

    /// Poll until the node is presentable: text and image URL set, and a
    /// locally-generated image actually readable on disk. Returns false when
    /// `max_wait` elapses first; callers respond with the node regardless.
    pub async fn wait_for_node_complete(
        &self,
        node_id: i64,
        generated_dir: &Path,
        poll: Duration,
        max_wait: Duration,
    ) -> Result<bool, StoreError> {
        let deadline = Instant::now() + max_wait;
        loop {
            if let Some(node) = self.get_node(node_id).await? {
                if node_is_complete(&node, generated_dir) {
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(poll.min(deadline - Instant::now())).await;
        }
    }

    // ---- saves ----

    pub async fn create_save(
        &self,
        user_id: &str,
        session_id: i64,
        node_id: i64,
        title: &str,
    ) -> Result<StorySave, StoreError> {
        let session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        if session.user_id != user_id {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        let node = self
            .get_node(node_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))?;
        if node.session_id != session_id {
            return Err(StoreError::Invalid(format!(
                "node {node_id} does not belong to session {session_id}"
            )));
        }

        let result = sqlx::query(
            "INSERT INTO story_saves (session_id, node_id, title) VALUES (?, ?, ?)",
        )
        .bind(session_id)
        .bind(node_id)
        .bind(title)
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();
        self.get_save(user_id, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("save {id}")))
    }

    pub async fn list_saves(
        &self,
        user_id: &str,
        status: Option<SaveStatus>,
    ) -> Result<Vec<StorySave>, StoreError> {
        let saves = match status {
            Some(status) => {
                sqlx::query_as::<_, StorySave>(
                    r#"
                    SELECT sv.* FROM story_saves sv
                    JOIN game_sessions s ON s.id = sv.session_id
                    WHERE s.user_id = ? AND sv.status = ?
                    ORDER BY sv.updated_at DESC, sv.id DESC
                "#,
                )
                .bind(user_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, StorySave>(
                    r#"
                    SELECT sv.* FROM story_saves sv
                    JOIN game_sessions s ON s.id = sv.session_id
                    WHERE s.user_id = ?
                    ORDER BY sv.updated_at DESC, sv.id DESC
                "#,
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(saves)
    }

    pub async fn get_save(
        &self,
        user_id: &str,
        save_id: i64,
    ) -> Result<Option<StorySave>, StoreError> {
        let save = sqlx::query_as::<_, StorySave>(
            r#"
            SELECT sv.* FROM story_saves sv
            JOIN game_sessions s ON s.id = sv.session_id
            WHERE s.user_id = ? AND sv.id = ?
        "#,
        )
        .bind(user_id)
        .bind(save_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(save)
    }

    pub async fn update_save(
        &self,
        user_id: &str,
        save_id: i64,
        title: Option<&str>,
        status: Option<SaveStatus>,
    ) -> Result<StorySave, StoreError> {
        let existing = self
            .get_save(user_id, save_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("save {save_id}")))?;

        let title = title.unwrap_or(&existing.title);
        let status = status
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| existing.status.clone());

        sqlx::query(
            "UPDATE story_saves SET title = ?, status = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(title)
        .bind(&status)
        .bind(save_id)
        .execute(&self.pool)
        .await?;

        self.get_save(user_id, save_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("save {save_id}")))
    }

    pub async fn delete_save(&self, user_id: &str, save_id: i64) -> Result<(), StoreError> {
        self.get_save(user_id, save_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("save {save_id}")))?;
        sqlx::query("DELETE FROM story_saves WHERE id = ?")
            .bind(save_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- moderation ----

    pub async fn record_wish_moderation(
        &self,
        user_id: Option<&str>,
        wish: &str,
        status: &str,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO wish_moderation_records (user_id, wish_text, status, reason) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(wish)
        .bind(status)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn node_is_complete(node: &StoryNode, generated_dir: &Path) -> bool {
    if node.story_text.trim().is_empty() || node.image_url.trim().is_empty() {
        return false;
    }
    // Library images resolve by construction; generated artifacts must be
    // readable on disk before the client is pointed at them.
    if let Some(filename) = node
        .image_url
        .split_once("/static/generated/")
        .map(|(_, rest)| rest)
    {
        let path = generated_dir.join(filename);
        let readable = std::fs::File::open(&path)
            .and_then(|mut f| {
                let mut byte = [0u8; 1];
                f.read(&mut byte)
            })
            .map(|n| n == 1)
            .unwrap_or(false);
        let non_empty = std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        return readable && non_empty;
    }
    true
}
