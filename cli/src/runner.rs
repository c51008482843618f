//! The sequential annotation loop.
//!
//! ```text
//! scenes.jsonl -> Runner::run()
//!                   for each scene:
//!                     thread boundary? -> finish / start thread
//!                     build request (compact first if over threshold)
//!                     agent chat -> record user + assistant turns
//!                     progress, checkpoint every N scenes
//!                     cancelled? -> checkpoint, stop
//! ```
//!
//! Agent errors abort the run without a checkpoint; the last checkpoint is
//! the recovery point.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use annotator_config::{AnnotatorConfig, ContextConfig};
use annotator_context::{
    ANNOTATOR_SYSTEM_PROMPT, AnnotationContext, CompactionInput, CompactionState,
    CompactorConfig, ContextCompactor, Glossary, GlossaryStore, NewSnapshot, ProgressTracker,
    PromptFrame, RunUpdate, SnapshotStore, SnapshotType, ThreadField, ThreadStatus,
    ThreadSummarizer, ThreadUpdate, TokenCounter,
};
use annotator_providers::{AgentBackend, ChatRequest};
use annotator_types::{GlossaryEntry, PostId, Role, Scene, SnapshotId, ThreadId, TurnTags};

/// Glossary entries shown alongside each scene.
const MAX_RELEVANT_ENTRIES: usize = 20;

/// Set by the first Ctrl-C; checked after each scene.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub scenes_path: PathBuf,
    /// Process at most this many scenes in this run.
    pub limit: Option<usize>,
    pub resume: bool,
}

/// Outcome of one [`Runner::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub scenes_processed: usize,
    pub scenes_skipped: usize,
    pub checkpoints_written: usize,
    pub last_snapshot: Option<SnapshotId>,
    pub resumed_from: Option<SnapshotId>,
    pub interrupted: bool,
}

#[derive(Debug, Clone)]
struct ChatSettings {
    temperature: f32,
    max_tokens: u32,
    model: Option<String>,
}

pub struct Runner {
    agent: Arc<dyn AgentBackend>,
    glossary: GlossaryStore,
    snapshots: SnapshotStore,
    progress: ProgressTracker,
    compactor: ContextCompactor,
    context: AnnotationContext,
    state: CompactionState,
    chat: ChatSettings,
    checkpoint_interval: u32,
    cancel: Arc<CancelFlag>,
    /// Last post fully processed: `(post, thread)`.
    last_post: Option<(PostId, ThreadId)>,
    scenes_since_checkpoint: u32,
}

#[must_use]
pub fn compactor_config(context: &ContextConfig) -> CompactorConfig {
    CompactorConfig {
        budget: context.budget,
        soft_ratio: context.soft_ratio,
        thread_compact_ratio: context.thread_compact_ratio,
        emergency_ratio: context.emergency_ratio,
        target_ratio: context.target_ratio,
        scenes_per_chunk: context.scenes_per_chunk,
        preserve_recent_chunks: context.preserve_recent_chunks,
    }
}

/// One scene per line; blank lines are ignored.
pub fn load_scenes(path: &Path) -> Result<Vec<Scene>> {
    let file =
        File::open(path).with_context(|| format!("failed to open scenes {}", path.display()))?;
    let mut scenes = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let scene: Scene = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid scene", path.display(), index + 1))?;
        if scene.is_empty() {
            tracing::warn!(line = index + 1, thread_id = %scene.thread_id, "Skipping scene without posts");
            continue;
        }
        scenes.push(scene);
    }
    Ok(scenes)
}

impl Runner {
    /// Open the database at `[run].annotator_db` and wire the compactor to `agent`.
    pub fn open(
        config: &AnnotatorConfig,
        agent: Arc<dyn AgentBackend>,
        cancel: Arc<CancelFlag>,
    ) -> Result<Self> {
        let db_path = &config.run.annotator_db;
        let glossary = GlossaryStore::open(db_path)
            .with_context(|| format!("failed to open glossary {}", db_path.display()))?;
        let snapshots = SnapshotStore::open(db_path).context("failed to open snapshot store")?;
        let progress = ProgressTracker::open(db_path).context("failed to open progress tracker")?;

        let ctx = &config.context;
        let compactor = ContextCompactor::new(
            compactor_config(ctx),
            TokenCounter::with_backend(Arc::clone(&agent), ctx.chars_per_token),
            ThreadSummarizer::new(
                Some(Arc::clone(&agent)),
                ctx.summary_max_tokens,
                ctx.chars_per_token,
            ),
            Some(Arc::clone(&agent)),
        );

        Ok(Self {
            agent,
            glossary,
            snapshots,
            progress,
            compactor,
            context: AnnotationContext::new(ANNOTATOR_SYSTEM_PROMPT),
            state: CompactionState::new(),
            chat: ChatSettings {
                temperature: config.agent.temperature,
                max_tokens: config.agent.max_tokens,
                model: config.agent.model.clone(),
            },
            checkpoint_interval: config.run.checkpoint_interval.max(1),
            cancel,
            last_post: None,
            scenes_since_checkpoint: 0,
        })
    }

    #[cfg(test)]
    fn context(&self) -> &AnnotationContext {
        &self.context
    }

    #[cfg(test)]
    fn state(&self) -> &CompactionState {
        &self.state
    }

    pub async fn run(&mut self, options: &RunOptions) -> Result<RunSummary> {
        if !self.agent.health().await.unwrap_or(false) {
            bail!("agent server is not healthy");
        }

        let scenes = load_scenes(&options.scenes_path)?;
        tracing::info!(scenes = scenes.len(), path = %options.scenes_path.display(), "Loaded scenes");

        let mut summary = RunSummary::default();
        let resume_after = if options.resume {
            self.resume(&mut summary)?
        } else {
            None
        };
        self.progress.start_run().context("failed to start run")?;

        for scene in &scenes {
            let Some(last_post) = scene.last_post_id() else {
                continue;
            };
            if resume_after.is_some_and(|after| last_post <= after) {
                summary.scenes_skipped += 1;
                continue;
            }
            if options.limit.is_some_and(|limit| summary.scenes_processed >= limit) {
                tracing::info!(limit = ?options.limit, "Scene limit reached");
                break;
            }

            self.process_scene(scene).await?;
            summary.scenes_processed += 1;
            self.scenes_since_checkpoint += 1;

            if self.cancel.is_cancelled() {
                tracing::warn!("Interrupted, writing checkpoint");
                summary.interrupted = true;
                break;
            }
            if self.scenes_since_checkpoint >= self.checkpoint_interval {
                self.checkpoint(&mut summary)?;
            }
        }

        let finished = !summary.interrupted
            && summary.scenes_processed > 0
            && summary.scenes_processed + summary.scenes_skipped == scenes.len()
            && self.finish_thread()?;
        // A thread finished after the last interval checkpoint still has to be saved.
        if finished || self.scenes_since_checkpoint > 0 {
            self.checkpoint(&mut summary)?;
        }

        tracing::info!(
            processed = summary.scenes_processed,
            skipped = summary.scenes_skipped,
            checkpoints = summary.checkpoints_written,
            interrupted = summary.interrupted,
            "Run finished"
        );
        tracing::info!("{}", self.compactor.stats().summary());
        Ok(summary)
    }

    /// Restore the latest checkpoint. Returns the last post it covered.
    fn resume(&mut self, summary: &mut RunSummary) -> Result<Option<PostId>> {
        let Some(snapshot) = self
            .snapshots
            .latest(Some(SnapshotType::Checkpoint))
            .context("failed to look up latest checkpoint")?
        else {
            tracing::info!("No checkpoint found, starting fresh");
            return Ok(None);
        };
        let (context, state) = self
            .snapshots
            .restore_context(snapshot.id)
            .with_context(|| format!("failed to restore snapshot {}", snapshot.id))?;
        self.context = context;
        self.state = state;
        self.last_post = Some((snapshot.last_post_id, snapshot.last_thread_id));
        summary.resumed_from = Some(snapshot.id);
        tracing::info!(
            snapshot_id = %snapshot.id,
            last_post_id = %snapshot.last_post_id,
            thread_id = %snapshot.last_thread_id,
            "Resuming from checkpoint"
        );
        Ok(Some(snapshot.last_post_id))
    }

    async fn process_scene(&mut self, scene: &Scene) -> Result<()> {
        let thread_id = scene.thread_id;
        if self.state.current_thread_id() != Some(thread_id) {
            self.finish_thread()?;
            self.state.start_new_thread(thread_id);
            self.progress
                .update_thread_state(thread_id, &ThreadUpdate::status(ThreadStatus::InProgress))
                .context("failed to mark thread in progress")?;
            tracing::info!(%thread_id, "Started thread");
        }
        let scene_index = self.state.current_scene_index();

        let relevant = self.relevant_entries(thread_id)?;
        let mut messages = self.context.build_messages(&PromptFrame::from_state(
            &self.state,
            Some(scene),
            &relevant,
        ));
        if self.compactor.should_compact(&messages) {
            let input = CompactionInput {
                scene: Some(scene),
                relevant_entries: &relevant,
                glossary: &self.glossary,
            };
            let (compacted, result) = self
                .compactor
                .compact(&mut self.context, &mut self.state, &input)
                .await;
            if !result.target_reached {
                tracing::warn!(
                    %thread_id,
                    scene_index,
                    final_tokens = result.final_tokens,
                    "Compaction did not reach target"
                );
            }
            messages = compacted;
        }
        let (tokens, percent) = self.compactor.current_usage(&messages);
        self.compactor.stats_mut().record_usage(percent);
        tracing::debug!(%thread_id, scene_index, tokens, percent, "Sending scene");

        // The scene payload is always the last message.
        let payload = messages
            .last()
            .map(|m| m.content().to_string())
            .unwrap_or_default();
        let mut request = ChatRequest::new(messages, self.chat.max_tokens, self.chat.temperature);
        request.model.clone_from(&self.chat.model);
        let reply = self
            .agent
            .chat(&request)
            .await
            .with_context(|| format!("agent request failed for thread {thread_id} scene {scene_index}"))?;

        let tags = TurnTags::new(thread_id, scene_index);
        self.context.record_turn(Role::User, payload, None, tags)?;
        self.context.record_message(reply.message, tags)?;
        self.state.advance_scene();

        let posts = scene.posts.len() as u64;
        let last_post = scene
            .last_post_id()
            .context("scene has no posts")?;
        self.progress
            .update(&RunUpdate {
                last_post_id: Some(last_post),
                last_thread_id: Some(thread_id),
                posts_processed_delta: posts,
                ..RunUpdate::default()
            })
            .context("failed to update run progress")?;
        self.progress
            .update_thread_state(
                thread_id,
                &ThreadUpdate {
                    posts_processed_delta: posts,
                    ..ThreadUpdate::default()
                },
            )
            .context("failed to update thread progress")?;
        self.last_post = Some((last_post, thread_id));
        Ok(())
    }

    fn relevant_entries(&self, thread_id: ThreadId) -> Result<Vec<GlossaryEntry>> {
        let mut entries = self
            .glossary
            .get_by_thread(thread_id, ThreadField::LastUpdated)
            .context("failed to fetch thread entries")?;
        entries.truncate(MAX_RELEVANT_ENTRIES);
        Ok(entries)
    }

    /// Queue the current thread for eviction and mark it completed. Returns
    /// false when there was nothing to finish.
    fn finish_thread(&mut self) -> Result<bool> {
        let Some(thread_id) = self.state.current_thread_id() else {
            return Ok(false);
        };
        if self.state.completed_thread_ids().contains(&thread_id) {
            return Ok(false);
        }
        self.state.finish_current_thread();
        self.progress
            .update_thread_state(thread_id, &ThreadUpdate::status(ThreadStatus::Completed))
            .context("failed to mark thread completed")?;
        tracing::info!(%thread_id, scenes = self.state.current_scene_index(), "Finished thread");
        Ok(true)
    }

    fn checkpoint(&mut self, summary: &mut RunSummary) -> Result<()> {
        let Some((post_id, thread_id)) = self.last_post else {
            return Ok(());
        };
        let frame = PromptFrame::from_state(&self.state, None, &[]);
        let (tokens, _) = self
            .compactor
            .current_usage(&self.context.build_messages(&frame));
        let mut header = NewSnapshot::new(
            SnapshotType::Checkpoint,
            post_id,
            thread_id,
            self.state.current_scene_index(),
        );
        header.token_count = Some(tokens);

        let id = self
            .snapshots
            .create(&header, &self.context, &self.state, &self.glossary)
            .context("failed to write checkpoint")?;
        self.progress
            .update(&RunUpdate {
                current_snapshot_id: Some(id),
                ..RunUpdate::default()
            })
            .context("failed to record checkpoint")?;
        self.scenes_since_checkpoint = 0;
        summary.checkpoints_written += 1;
        summary.last_snapshot = Some(id);
        tracing::info!(snapshot_id = %id, %post_id, %thread_id, tokens, "Checkpoint written");
        Ok(())
    }
}
