//! Speculative pre-generation: keeps the player's frontier expanded up to
//! `max_depth` levels ahead so choosing a branch lands on a node that
//! already exists.
//!
//! One detached worker runs per enqueued `(session, node)`; a second
//! enqueue while it runs only raises the depth the worker will honor before
//! exiting. All shared state (pending jobs, per-user counts, per-choice
//! in-flight markers, counters) lives behind a single mutex; nothing is
//! awaited while it is held.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Settings;
use crate::engine::{ContinueRequest, StoryGenerator};
use crate::providers::chat::ChatMessage;
use crate::storage::{GameSession, NewNode, StoreError, StoryNode, StoryStore};

/// Chapter number recorded in node metadata, defaulting to the first.
pub fn extract_chapter_number(metadata: &serde_json::Value) -> i64 {
    metadata
        .get("chapter_number")
        .and_then(serde_json::Value::as_i64)
        .filter(|n| *n > 0)
        .unwrap_or(1)
}

#[derive(Debug, Clone, Copy)]
pub struct SpeculationConfig {
    pub enabled: bool,
    pub max_depth: u32,
    pub choice_workers: usize,
    pub level_cap: usize,
    pub max_concurrency_per_user: usize,
}

impl SpeculationConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            enabled: settings.speculation_enabled,
            max_depth: settings.speculation_max_depth,
            choice_workers: settings.speculation_choice_workers.max(1),
            level_cap: settings.speculation_level_cap,
            max_concurrency_per_user: settings.speculation_max_concurrency_per_user,
        }
    }
}

#[derive(Debug, Default)]
struct Metrics {
    enqueued_total: u64,
    started_total: u64,
    finished_total: u64,
    failed_total: u64,
    nodes_generated_total: u64,
    nodes_failed_total: u64,
    dropped_total: u64,
    active_workers: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeculationMetricsSnapshot {
    pub enabled: bool,
    pub max_depth: u32,
    pub active_workers: u64,
    pub enqueued_total: u64,
    pub started_total: u64,
    pub finished_total: u64,
    pub failed_total: u64,
    pub nodes_generated_total: u64,
    pub nodes_failed_total: u64,
    pub dropped_total: u64,
    pub pending_jobs: usize,
    pub timestamp: String,
}

#[derive(Default)]
struct SchedulerState {
    /// `(session, node)` -> highest requested depth. Presence means a worker
    /// is active (or about to be) for that subtree.
    pending: HashMap<(i64, i64), u32>,
    user_active: HashMap<String, usize>,
    /// `(session, parent, choice)` currently being generated.
    generating: HashSet<(i64, i64, String)>,
    metrics: Metrics,
}

pub struct SpeculationService {
    config: SpeculationConfig,
    store: StoryStore,
    generator: Arc<dyn StoryGenerator>,
    state: Mutex<SchedulerState>,
}

impl SpeculationService {
    pub fn new(
        config: SpeculationConfig,
        store: StoryStore,
        generator: Arc<dyn StoryGenerator>,
    ) -> Arc<Self> {
        if config.enabled && config.max_depth > 0 {
            tracing::info!(
                depth = config.max_depth,
                choice_workers = config.choice_workers,
                "speculation enabled"
            );
        } else {
            tracing::info!("speculation disabled");
        }
        Arc::new(Self {
            config,
            store,
            generator,
            state: Mutex::new(SchedulerState::default()),
        })
    }

    /// Request expansion of the subtree under `node_id` to `depth` levels
    /// (defaulting to the configured maximum). Non-blocking and idempotent:
    /// an already-pending job only has its depth raised.
    pub fn enqueue(self: &Arc<Self>, session_id: i64, node_id: i64, depth: Option<u32>) {
        if !self.config.enabled {
            return;
        }
        let target = depth.unwrap_or(self.config.max_depth);
        if target == 0 {
            return;
        }

        let key = (session_id, node_id);
        {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.pending.get_mut(&key) {
                if target > *existing {
                    tracing::debug!(session_id, node_id, from = *existing, to = target, "raising pending depth");
                    *existing = target;
                } else {
                    tracing::debug!(session_id, node_id, depth = target, "duplicate enqueue ignored");
                }
                return;
            }
            state.pending.insert(key, target);
            state.metrics.enqueued_total += 1;
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.run_worker(session_id, node_id, target).await;
        });
    }

    /// True while an in-flight worker is generating this exact child.
    pub fn is_choice_generating(&self, session_id: i64, parent_id: i64, choice: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .generating
            .contains(&(session_id, parent_id, choice.to_string()))
    }

    pub fn metrics_snapshot(&self) -> SpeculationMetricsSnapshot {
        let state = self.state.lock().unwrap();
        SpeculationMetricsSnapshot {
            enabled: self.config.enabled,
            max_depth: self.config.max_depth,
            active_workers: state.metrics.active_workers,
            enqueued_total: state.metrics.enqueued_total,
            started_total: state.metrics.started_total,
            finished_total: state.metrics.finished_total,
            failed_total: state.metrics.failed_total,
            nodes_generated_total: state.metrics.nodes_generated_total,
            nodes_failed_total: state.metrics.nodes_failed_total,
            dropped_total: state.metrics.dropped_total,
            pending_jobs: state.pending.len(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    async fn run_worker(self: Arc<Self>, session_id: i64, node_id: i64, depth: u32) {
        let key = (session_id, node_id);
        {
            let mut state = self.state.lock().unwrap();
            state.metrics.started_total += 1;
            state.metrics.active_workers += 1;
        }

        let mut user_slot: Option<String> = None;
        let result = self
            .worker_loop(session_id, node_id, depth, &mut user_slot)
            .await;

        let mut state = self.state.lock().unwrap();
        if let Err(error) = result {
            tracing::error!(session_id, node_id, depth, %error, "speculation worker failed");
            state.metrics.failed_total += 1;
            state.pending.remove(&key);
        }
        state.metrics.finished_total += 1;
        state.metrics.active_workers = state.metrics.active_workers.saturating_sub(1);
        if let Some(user_id) = user_slot {
            if let Some(count) = state.user_active.get_mut(&user_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.user_active.remove(&user_id);
                }
            }
        }
    }

    async fn worker_loop(
        self: &Arc<Self>,
        session_id: i64,
        node_id: i64,
        initial_depth: u32,
        user_slot: &mut Option<String>,
    ) -> Result<(), StoreError> {
        let key = (session_id, node_id);

        let Some(session) = self.store.get_session(session_id).await? else {
            self.state.lock().unwrap().pending.remove(&key);
            return Ok(());
        };

        // Fairness: one user never monopolizes pre-generation.
        let limit = self.config.max_concurrency_per_user;
        if limit > 0 {
            let mut state = self.state.lock().unwrap();
            let current = state.user_active.get(&session.user_id).copied().unwrap_or(0);
            if current >= limit {
                tracing::info!(
                    user_id = %session.user_id,
                    session_id,
                    node_id,
                    "dropping speculation job: per-user concurrency limit"
                );
                state.metrics.dropped_total += 1;
                state.pending.remove(&key);
                return Ok(());
            }
            state.user_active.insert(session.user_id.clone(), current + 1);
            *user_slot = Some(session.user_id.clone());
        }

        // Depth top-up loop: another enqueue may raise the bar mid-run.
        let mut requested = {
            let state = self.state.lock().unwrap();
            state.pending.get(&key).copied().unwrap_or(initial_depth)
        };
        loop {
            self.expand_children(&session, node_id, requested).await?;

            let mut state = self.state.lock().unwrap();
            let latest = state.pending.get(&key).copied().unwrap_or(0);
            if latest > requested {
                tracing::debug!(session_id, node_id, from = requested, to = latest, "depth top-up detected");
                requested = latest;
                continue;
            }
            state.pending.remove(&key);
            return Ok(());
        }
    }

    /// Expand one parent: generate every missing, not-in-flight choice with
    /// a bounded per-node worker pool, then enqueue each child one level
    /// shallower.
    async fn expand_children(
        self: &Arc<Self>,
        session: &GameSession,
        parent_node_id: i64,
        remaining_depth: u32,
    ) -> Result<(), StoreError> {
        if remaining_depth == 0 {
            return Ok(());
        }

        let Some(parent) = self.store.get_node(parent_node_id).await? else {
            return Ok(());
        };

        let choices = parent.display_choices();
        if choices.is_empty() {
            // Settlement node: the branch ends here.
            tracing::debug!(node_id = parent_node_id, "no choices, expansion ends");
            return Ok(());
        }

        let history = self.store.conversation_history(&parent).await?;
        let existing: HashMap<String, StoryNode> = self
            .store
            .get_children(parent_node_id)
            .await?
            .into_iter()
            .filter_map(|child| child.user_choice.clone().map(|choice| (choice, child)))
            .collect();

        let mut candidates = Vec::new();
        for choice in &choices {
            if let Some(child) = existing.get(&choice.option) {
                if remaining_depth > 1 {
                    self.enqueue(session.id, child.id, Some(remaining_depth - 1));
                }
                continue;
            }
            candidates.push(choice.clone());
        }

        // Claim in-flight markers under one lock; the level cap bounds how
        // many new children a single expansion may create.
        let mut claimed = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let cap = if self.config.level_cap > 0 {
                self.config.level_cap
            } else {
                usize::MAX
            };
            for choice in candidates {
                if claimed.len() >= cap {
                    break;
                }
                let marker = (session.id, parent_node_id, choice.option.clone());
                if state.generating.contains(&marker) {
                    tracing::debug!(choice = %choice.option, "choice already generating, skipped");
                    continue;
                }
                state.generating.insert(marker);
                claimed.push(choice);
            }
        }

        if claimed.is_empty() {
            tracing::debug!(node_id = parent_node_id, "no new choices to generate");
            return Ok(());
        }

        tracing::debug!(
            node_id = parent_node_id,
            count = claimed.len(),
            "generating children"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.choice_workers));
        let mut tasks = JoinSet::new();
        for choice in claimed {
            let service = Arc::clone(self);
            let session = session.clone();
            let parent = parent.clone();
            let history = history.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                let child = service
                    .generate_child_node(&session, &parent, &choice.option, &history)
                    .await;
                {
                    let mut state = service.state.lock().unwrap();
                    state
                        .generating
                        .remove(&(session.id, parent.id, choice.option.clone()));
                }
                if let Some(child) = child {
                    if remaining_depth > 1 {
                        service.enqueue(session.id, child.id, Some(remaining_depth - 1));
                    }
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                tracing::error!(%error, "speculation child task panicked");
            }
        }
        Ok(())
    }

    /// Generate and persist one speculative child. Failures are metrics-only;
    /// a unique-index collision means another actor created the child first
    /// and its row is returned instead.
    async fn generate_child_node(
        &self,
        session: &GameSession,
        parent: &StoryNode,
        choice: &str,
        history: &[ChatMessage],
    ) -> Option<StoryNode> {
        tracing::info!(parent = parent.id, %choice, "speculative generation start");

        let parent_metadata = parent.metadata_value();
        let chapter_number = extract_chapter_number(&parent_metadata);
        let choice_summary = parent
            .display_choices()
            .into_iter()
            .find(|c| c.option == choice)
            .map(|c| c.summary);

        let payload = match self
            .generator
            .continue_story(ContinueRequest {
                wish: &session.wish,
                history,
                choice,
                choice_summary: choice_summary.as_deref(),
                chapter_number,
                parent_success_rate: parent.success_rate,
                parent_metadata: &parent_metadata,
            })
            .await
        {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(parent = parent.id, %choice, %error, "speculative generation failed");
                self.state.lock().unwrap().metrics.nodes_failed_total += 1;
                return None;
            }
        };

        let depth = parent
            .speculative_depth
            .unwrap_or(self.config.max_depth as i64)
            .saturating_sub(1)
            .max(0);

        let created = self
            .store
            .create_node(NewNode {
                session_id: session.id,
                parent_id: Some(parent.id),
                user_choice: Some(choice),
                payload: &payload,
                speculative: true,
                speculative_depth: Some(depth),
            })
            .await;

        let child = match created {
            Ok(child) => child,
            Err(StoreError::Conflict(_)) => {
                match self
                    .store
                    .get_child_by_parent_and_choice(session.id, parent.id, choice)
                    .await
                {
                    Ok(Some(existing)) => existing,
                    _ => {
                        tracing::error!(parent = parent.id, %choice, "winner missing after collision");
                        return None;
                    }
                }
            }
            Err(error) => {
                tracing::error!(parent = parent.id, %choice, %error, "speculative persist failed");
                return None;
            }
        };

        tracing::info!(parent = parent.id, %choice, node = child.id, "speculative generation complete");
        self.state.lock().unwrap().metrics.nodes_generated_total += 1;
        Some(child)
    }
}
