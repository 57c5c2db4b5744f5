//! The state machine that drives one [`Execution`] through the fixed CTI
//! stage DAG (§4.1): `trigger` creates and enqueues, `run` is the worker
//! loop body that advances an Execution to a terminal state, `get`/`list`
//! are read paths, `cancel` requests early termination.
//!
//! The DAG itself (§4.1, `Vec<Arc<dyn StageExecutor>>`) is fixed rather
//! than user-defined — this engine's scope is the one CTI pipeline, not an
//! arbitrary workflow graph (see DESIGN.md).

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::queue::{TriggerMessage, WorkQueue};
use super::retry::{backoff_delay, MAX_ATTEMPTS};
use super::stages::{
    ExtractSupervisorStage, JunkFilterStage, OsDetectStage, RankStage, SigmaGenStage, SimilarityMatchStage,
    StageContext, StageError, StageExecutor, StageOutcome,
};
use super::storage::CatalogStore;
use crate::llm::LlmGateway;
use crate::models::{
    Article, Execution, ExecutionError, StageName, StageOutput, StageResult, TerminationReason, WorkflowConfig,
};
use crate::similarity::CorpusIndex;
use crate::{EngineError, Result};

/// Per-execution wall-clock budget (§5 "Cancellation & timeouts").
pub const DEFAULT_EXECUTION_DEADLINE: Duration = Duration::from_secs(30 * 60);

/// `trigger()` caller-supplied knobs.
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    /// Overrides [`DEFAULT_EXECUTION_DEADLINE`] for this one execution;
    /// consumed by the worker that calls `run` for it.
    pub deadline: Option<Duration>,
}

/// `trigger()`'s result (§4.1 public contract).
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub execution_id: Uuid,
    pub accepted: bool,
    pub reason: Option<String>,
}

/// `get()`'s result: the Execution row plus its ordered stage attempt
/// history (§4.1 "`get(execution_id)`: returns the Execution snapshot plus
/// ordered StageResults").
#[derive(Debug, Clone)]
pub struct ExecutionSnapshot {
    pub execution: Execution,
    pub stage_results: Vec<StageResult>,
}

fn default_stage_dag() -> Vec<Arc<dyn StageExecutor>> {
    vec![
        Arc::new(OsDetectStage),
        Arc::new(JunkFilterStage),
        Arc::new(RankStage),
        Arc::new(ExtractSupervisorStage),
        Arc::new(SigmaGenStage),
        Arc::new(SimilarityMatchStage),
    ]
}

/// The outcome of one stage's full retry loop, handed back to [`WorkflowEngine::run`]
/// to decide the execution's next transition.
enum StageLoopOutcome {
    Success(StageOutcome),
    Cancelled,
    DeadlineExceeded,
    Failed(ExecutionError),
}

/// Orchestrates `trigger`/`run`/`get`/`list`/`cancel` over a [`CatalogStore`],
/// a [`WorkQueue`], an [`LlmGateway`], and an optional [`CorpusIndex`] (§2.1–2.9).
pub struct WorkflowEngine {
    store: Arc<dyn CatalogStore>,
    queue: Arc<dyn WorkQueue>,
    gateway: Arc<LlmGateway>,
    corpus: Option<Arc<dyn CorpusIndex>>,
    stages: Vec<Arc<dyn StageExecutor>>,
    deadline: Duration,
    /// One `CancellationToken` per in-flight execution, flipped by
    /// [`WorkflowEngine::cancel`] and observed at the stage loop's
    /// suspension points (§5 "External cancel").
    cancel_flags: DashMap<Uuid, CancellationToken>,
    /// Per-execution deadline overrides from [`TriggerOptions::deadline`],
    /// consumed (and removed) the first time `run` processes that execution.
    deadline_overrides: DashMap<Uuid, Duration>,
    /// Snapshot cache keyed by config version, populated at `trigger` time
    /// so `run` need not re-fetch on the common path (§9 "snapshot at
    /// start"). [`InMemoryCatalogStore`](super::storage::InMemoryCatalogStore)
    /// only ever holds one "latest" config, so this is also how a worker
    /// recovers the exact version an execution was created against even
    /// after a later edit overwrote the store's latest pointer.
    config_cache: DashMap<u32, WorkflowConfig>,
    /// Serializes the check-then-insert in `trigger` per article, so two
    /// concurrent `trigger` calls against an in-memory store (no unique
    /// index) cannot both observe "no active execution" and both insert.
    /// `PgCatalogStore`'s partial unique index is the cross-process
    /// equivalent; this lock only needs to cover one process.
    trigger_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        queue: Arc<dyn WorkQueue>,
        gateway: Arc<LlmGateway>,
        corpus: Option<Arc<dyn CorpusIndex>>,
    ) -> Self {
        Self {
            store,
            queue,
            gateway,
            corpus,
            stages: default_stage_dag(),
            deadline: DEFAULT_EXECUTION_DEADLINE,
            cancel_flags: DashMap::new(),
            deadline_overrides: DashMap::new(),
            config_cache: DashMap::new(),
            trigger_locks: DashMap::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    /// Creates a new Execution in `queued` and enqueues a trigger message,
    /// iff no non-terminal execution exists for `article_id` (§4.1, §8
    /// invariant 5: idempotent trigger).
    #[instrument(skip(self, options), fields(article_id = %article_id))]
    pub async fn trigger(&self, article_id: Uuid, options: TriggerOptions) -> Result<TriggerOutcome> {
        self.store
            .get_article(article_id)
            .await?
            .ok_or(EngineError::ArticleNotFound(article_id))?;

        let lock = self
            .trigger_locks
            .entry(article_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.active_execution_for_article(article_id).await? {
            return Ok(already_active(existing.id));
        }

        let config = self.store.latest_workflow_config().await?;
        self.config_cache.insert(config.version, config.clone());

        let execution = Execution::new(article_id, config.version);
        if let Err(err) = self.store.create_execution(execution.clone()).await {
            if is_unique_violation(&err) {
                let existing = self
                    .store
                    .active_execution_for_article(article_id)
                    .await?
                    .ok_or_else(|| EngineError::Internal("lost trigger race but no active execution found".to_string()))?;
                return Ok(already_active(existing.id));
            }
            return Err(err);
        }

        if let Some(deadline) = options.deadline {
            self.deadline_overrides.insert(execution.id, deadline);
        }

        let message = TriggerMessage {
            execution_id: execution.id,
            article_id,
            config_version: config.version,
            enqueued_at: Utc::now(),
        };
        self.queue.enqueue(message).await?;

        info!(execution_id = %execution.id, "execution triggered");
        Ok(TriggerOutcome { execution_id: execution.id, accepted: true, reason: None })
    }

    /// Advances one Execution through the stage DAG until it reaches a
    /// terminal state. Consumed by a worker loop over `WorkQueue::dequeue`;
    /// tolerates duplicate delivery via the `claim` compare-and-swap.
    #[instrument(skip(self, message), fields(execution_id = %message.execution_id, article_id = %message.article_id))]
    pub async fn run(&self, message: TriggerMessage) -> Result<()> {
        if !self.store.claim(message.execution_id).await? {
            info!(execution_id = %message.execution_id, "duplicate delivery, execution already claimed");
            return Ok(());
        }

        let mut execution = self
            .store
            .get_execution(message.execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(message.execution_id))?;

        let article = self
            .store
            .get_article(message.article_id)
            .await?
            .ok_or(EngineError::ArticleNotFound(message.article_id))?;

        let config = match self.config_cache.get(&message.config_version) {
            Some(entry) => entry.clone(),
            None => {
                let config = self.store.latest_workflow_config().await?;
                self.config_cache.insert(config.version, config.clone());
                config
            }
        };

        let cancel = self
            .cancel_flags
            .entry(message.execution_id)
            .or_insert_with(CancellationToken::new)
            .clone();

        let deadline = self
            .deadline_overrides
            .remove(&message.execution_id)
            .map(|(_, d)| d)
            .unwrap_or(self.deadline);
        let deadline_at = Instant::now() + deadline;

        // JunkFilter's output lives only on this in-memory working copy;
        // the stored Article row is immutable (§3).
        let mut working_article = article.clone();
        let mut prior_outputs: Vec<StageOutput> = Vec::new();

        for stage in &self.stages {
            let outcome = self
                .run_stage_with_retries(stage, execution.id, &working_article, &config, &prior_outputs, &cancel, deadline_at)
                .await?;

            match outcome {
                StageLoopOutcome::Success(stage_outcome) => {
                    if let StageOutput::JunkFilter { filtered_content, .. } = &stage_outcome.output {
                        working_article.filtered_content = Some(filtered_content.clone());
                    }

                    apply_stage_output(&mut execution, &stage_outcome.output);

                    if let Some(reason) = stage_outcome.terminate {
                        prior_outputs.push(stage_outcome.output);
                        execution.terminate_early(reason);
                        self.store.update_execution(execution.clone()).await?;
                        info!(execution_id = %execution.id, reason = reason.as_str(), "execution terminated early");
                        self.cancel_flags.remove(&execution.id);
                        return Ok(());
                    }

                    // Early termination rule 4 (§4.1): with no huntables and the
                    // Sigma fallback disabled, Sigma and Similarity never run.
                    let skip_remaining = stage.stage_name() == StageName::ExtractSupervisor
                        && execution.discrete_huntables_count == 0
                        && !config.sigma_fallback_enabled;

                    prior_outputs.push(stage_outcome.output);

                    if skip_remaining {
                        execution.complete();
                        self.store.update_execution(execution.clone()).await?;
                        info!(execution_id = %execution.id, "no huntables and sigma fallback disabled, skipping sigma and similarity");
                        self.cancel_flags.remove(&execution.id);
                        return Ok(());
                    }
                }
                StageLoopOutcome::Cancelled => {
                    execution.terminate_early(TerminationReason::Cancelled);
                    self.store.update_execution(execution.clone()).await?;
                    info!(execution_id = %execution.id, "execution cancelled");
                    self.cancel_flags.remove(&execution.id);
                    return Ok(());
                }
                StageLoopOutcome::DeadlineExceeded => {
                    execution.fail(ExecutionError {
                        stage: stage.stage_name(),
                        kind: TerminationReason::DeadlineExceeded.as_str().to_string(),
                        detail: "execution exceeded its wall-clock deadline".to_string(),
                    });
                    self.store.update_execution(execution.clone()).await?;
                    warn!(execution_id = %execution.id, "execution failed: deadline exceeded");
                    self.cancel_flags.remove(&execution.id);
                    return Ok(());
                }
                StageLoopOutcome::Failed(error) => {
                    execution.fail(error);
                    self.store.update_execution(execution.clone()).await?;
                    warn!(execution_id = %execution.id, "execution failed");
                    self.cancel_flags.remove(&execution.id);
                    return Ok(());
                }
            }
        }

        execution.complete();
        self.store.update_execution(execution.clone()).await?;
        info!(execution_id = %execution.id, "execution completed");
        self.cancel_flags.remove(&execution.id);
        Ok(())
    }

    /// Runs one stage's attempt loop to a terminal StageLoopOutcome:
    /// Transient errors retry with backoff, ValidationFailure errors retry
    /// with the error text fed back into the next prompt, everything else
    /// is terminal, all bounded to [`MAX_ATTEMPTS`] (§4.1 "Retries per
    /// stage"). Cancellation and deadline are checked synchronously at
    /// every attempt boundary and always take priority over the stage's
    /// own retry classification, since a cancelled gateway call surfaces
    /// as an ordinary `LlmError::Transient`.
    #[allow(clippy::too_many_arguments)]
    async fn run_stage_with_retries(
        &self,
        stage: &Arc<dyn StageExecutor>,
        execution_id: Uuid,
        article: &Article,
        config: &WorkflowConfig,
        prior_outputs: &[StageOutput],
        cancel: &CancellationToken,
        deadline_at: Instant,
    ) -> Result<StageLoopOutcome> {
        let stage_name = stage.stage_name();
        let fingerprint = fingerprint_for(stage_name, article, prior_outputs);
        let mut feedback: Option<String> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if Instant::now() >= deadline_at {
                let result = StageResult::started(execution_id, stage_name, attempt, fingerprint.clone())
                    .fail("execution exceeded its wall-clock deadline", true);
                self.store.append_stage_result(result).await?;
                warn!(execution_id = %execution_id, stage = %stage_name, "execution deadline exceeded");
                return Ok(StageLoopOutcome::DeadlineExceeded);
            }
            if cancel.is_cancelled() {
                let result = StageResult::started(execution_id, stage_name, attempt, fingerprint.clone())
                    .fail("execution cancellation requested", false);
                self.store.append_stage_result(result).await?;
                info!(execution_id = %execution_id, stage = %stage_name, "execution cancelled before stage start");
                return Ok(StageLoopOutcome::Cancelled);
            }

            let result = StageResult::started(execution_id, stage_name, attempt, fingerprint.clone());
            let ctx = StageContext {
                article,
                config,
                gateway: self.gateway.as_ref(),
                corpus: self.corpus.clone(),
                cancel,
                retry_feedback: feedback.clone(),
                prior_outputs,
            };

            info!(execution_id = %execution_id, stage = %stage_name, attempt, "stage attempt starting");

            match stage.execute(&ctx).await {
                Ok(stage_outcome) => {
                    let result = result.succeed(stage_outcome.output.clone(), stage_outcome.telemetry.clone());
                    self.store.append_stage_result(result).await?;
                    info!(execution_id = %execution_id, stage = %stage_name, attempt, "stage attempt succeeded");
                    return Ok(StageLoopOutcome::Success(stage_outcome));
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        let result = result.fail("execution cancellation requested", false);
                        self.store.append_stage_result(result).await?;
                        return Ok(StageLoopOutcome::Cancelled);
                    }
                    if Instant::now() >= deadline_at {
                        let result = result.fail("execution exceeded its wall-clock deadline", true);
                        self.store.append_stage_result(result).await?;
                        return Ok(StageLoopOutcome::DeadlineExceeded);
                    }

                    let retryable = matches!(err, StageError::Transient(_) | StageError::ValidationFailure(_))
                        && attempt < MAX_ATTEMPTS;

                    let result = result.fail(err.to_string(), false);
                    self.store.append_stage_result(result).await?;
                    warn!(execution_id = %execution_id, stage = %stage_name, attempt, error = %err, "stage attempt failed");

                    if !retryable {
                        return Ok(StageLoopOutcome::Failed(ExecutionError {
                            stage: stage_name,
                            kind: err.kind_str().to_string(),
                            detail: err.detail(),
                        }));
                    }

                    if let StageError::ValidationFailure(detail) = &err {
                        feedback = Some(detail.clone());
                    }
                    if matches!(err, StageError::Transient(_)) {
                        tokio::select! {
                            _ = tokio::time::sleep(backoff_delay(attempt)) => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                }
            }
        }

        Ok(StageLoopOutcome::Failed(ExecutionError {
            stage: stage_name,
            kind: "unexpected".to_string(),
            detail: "stage retry loop exhausted without a terminal result".to_string(),
        }))
    }

    /// Requests early termination (§5 "External cancel"): flips this
    /// execution's cancellation token, observed at the next suspension
    /// point. Returns an error if the execution is already terminal (HTTP
    /// layer maps this to 409, §6).
    pub async fn cancel(&self, execution_id: Uuid) -> Result<()> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        if execution.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal(execution_id));
        }
        self.cancel_flags
            .entry(execution_id)
            .or_insert_with(CancellationToken::new)
            .cancel();
        Ok(())
    }

    /// Returns the Execution plus its ordered StageResults (§4.1 `get`).
    pub async fn get(&self, execution_id: Uuid) -> Result<ExecutionSnapshot> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        let stage_results = self.store.list_stage_results(execution_id).await?;
        Ok(ExecutionSnapshot { execution, stage_results })
    }

    /// Returns recent executions, optionally scoped to one article (§4.1 `list`).
    pub async fn list(&self, article_id: Option<Uuid>) -> Result<Vec<Execution>> {
        match article_id {
            Some(id) => self.store.list_executions_for_article(id).await,
            None => self.store.list_recent_executions(50).await,
        }
    }
}

fn already_active(execution_id: Uuid) -> TriggerOutcome {
    TriggerOutcome { execution_id, accepted: false, reason: Some("already_active".to_string()) }
}

fn is_unique_violation(err: &EngineError) -> bool {
    match err {
        EngineError::Database(e) => {
            matches!(e.as_database_error().and_then(|d| d.code()), Some(code) if code == "23505")
        }
        _ => false,
    }
}

/// Writes a successful stage's typed output onto the execution's
/// first-class fields (§6 "Persisted state layout"); OSDetect/JunkFilter/Rank
/// outputs are not promoted since they carry no execution-level aggregate.
fn apply_stage_output(execution: &mut Execution, output: &StageOutput) {
    match output {
        StageOutput::Extract(extraction) => {
            execution.discrete_huntables_count = extraction.discrete_huntables_count as u32;
            execution.extraction_result = Some(extraction.clone());
        }
        StageOutput::Sigma { rules } => {
            execution.sigma_rules = rules.clone();
        }
        StageOutput::Similarity { matches } => {
            execution.similarity_results = matches.clone();
        }
        StageOutput::OsDetect { .. } | StageOutput::JunkFilter { .. } | StageOutput::Rank { .. } => {}
    }
}

/// A stable per-`(stage, input)` fingerprint so the Catalog Store can
/// record what a stage attempt actually saw. Built from the article's
/// content hash and a serialization of every prior stage's output, rather
/// than the article/config ids alone, so a JunkFilter-mutated
/// `filtered_content` changes downstream stages' fingerprints too.
fn fingerprint_for(stage: StageName, article: &Article, prior_outputs: &[StageOutput]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    stage.as_str().hash(&mut hasher);
    article.content_hash.hash(&mut hasher);
    article.filtered_content.hash(&mut hasher);
    for output in prior_outputs {
        if let Ok(bytes) = serde_json::to_vec(output) {
            bytes.hash(&mut hasher);
        }
    }
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex as StdMutex;

    use crate::engine::queue::InMemoryWorkQueue;
    use crate::engine::storage::InMemoryCatalogStore;
    use crate::llm::{ChatMessage, CompletionRequest, CompletionResponse, LLMProviderType, LlmError, LlmProviderClient, LlmResult, Usage};
    use crate::models::{AgentModelConfig, ExecutionStatus, SigmaRule, Thresholds};
    use crate::similarity::InMemoryCorpusIndex;

    #[derive(Clone)]
    enum ScriptedReply {
        Text(String),
        Transient,
    }

    /// Replies to a [`CompletionRequest`] by looking up its system message
    /// (the agent prompt text, which tests control directly via
    /// [`WorkflowConfig::agent_prompts`]) against a per-agent scripted
    /// queue. The final queued reply repeats indefinitely, so concurrent
    /// callers sharing one queue (ExtractSupervisor's sub-agents, SigmaGen's
    /// parallel candidates) don't race over who drains it.
    struct ScriptedClient {
        replies: DashMap<String, StdMutex<VecDeque<ScriptedReply>>>,
    }

    impl ScriptedClient {
        fn new() -> Self {
            Self { replies: DashMap::new() }
        }

        fn script(&self, system_prompt: &str, replies: Vec<ScriptedReply>) {
            self.replies.insert(system_prompt.to_string(), StdMutex::new(replies.into_iter().collect()));
        }
    }

    #[async_trait::async_trait]
    impl LlmProviderClient for ScriptedClient {
        fn provider_type(&self) -> LLMProviderType {
            LLMProviderType::OpenAi
        }

        async fn complete(&self, request: &CompletionRequest, _api_key: &str) -> LlmResult<CompletionResponse> {
            let system = request.messages.first().map(|m| m.content.clone()).unwrap_or_default();
            let reply = match self.replies.get(&system) {
                Some(queue) => {
                    let mut queue = queue.lock().unwrap();
                    if queue.len() > 1 {
                        queue.pop_front().unwrap()
                    } else {
                        queue.front().cloned().unwrap_or(ScriptedReply::Text(String::new()))
                    }
                }
                None => ScriptedReply::Text(String::new()),
            };
            match reply {
                ScriptedReply::Transient => Err(LlmError::Transient("scripted transient failure".to_string())),
                ScriptedReply::Text(text) => {
                    Ok(CompletionResponse { text, finish_reason: "stop".to_string(), usage: Usage { prompt_tokens: 8, completion_tokens: 8 }, latency_ms: 1 })
                }
            }
        }

        async fn embed(&self, _text: &str, _model: &str, _api_key: &str) -> LlmResult<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn model(agent: &str) -> AgentModelConfig {
        AgentModelConfig {
            provider: LLMProviderType::OpenAi,
            model: format!("scripted-{agent}"),
            temperature: 0.0,
            top_p: 1.0,
            max_tokens: 512,
        }
    }

    fn base_config() -> WorkflowConfig {
        let agents = [
            "os_detect",
            "junk_filter",
            "rank",
            "cmdline_extract",
            "proctree_extract",
            "hunt_queries_extract",
            "qa",
            "sigma_gen",
            "embedding",
        ];
        let mut agent_models = HashMap::new();
        let mut agent_prompts = HashMap::new();
        for agent in agents {
            agent_models.insert(agent.to_string(), model(agent));
            agent_prompts.insert(agent.to_string(), format!("SYSTEM PROMPT FOR {agent}"));
        }

        WorkflowConfig {
            version: 1,
            agent_models,
            agent_prompts,
            thresholds: Thresholds { ranking: 5.0, junk_min_huntable_chunks: 1, similarity_duplicate: 0.95, similarity_similar: 0.80 },
            qa_enabled: HashMap::new(),
            enabled_subagents: HashSet::from([
                "cmdline_extract".to_string(),
                "proctree_extract".to_string(),
                "hunt_queries_extract".to_string(),
            ]),
            sigma_fallback_enabled: false,
            similarity_k: 10,
            os_detect_proceed_on_unknown: true,
            auto_trigger_threshold: 5.0,
        }
    }

    fn sample_article(content: &str) -> Article {
        Article {
            id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            canonical_url: "https://example.test/article".to_string(),
            title: "test article".to_string(),
            content: content.to_string(),
            filtered_content: None,
            content_hash: format!("{:x}", content.len()),
            published_at: Utc::now(),
            threat_hunting_score: 8.0,
            ml_hunt_score: 8.0,
            metadata: HashMap::new(),
        }
    }

    struct Harness {
        engine: WorkflowEngine,
        store: Arc<InMemoryCatalogStore>,
        queue: Arc<InMemoryWorkQueue>,
        client: Arc<ScriptedClient>,
    }

    async fn harness(config: WorkflowConfig) -> Harness {
        let store = Arc::new(InMemoryCatalogStore::new());
        store.set_workflow_config(config).await;
        let queue = Arc::new(InMemoryWorkQueue::new());
        let client = Arc::new(ScriptedClient::new());
        let gateway = Arc::new(LlmGateway::with_client(client.clone()));
        let corpus = Arc::new(InMemoryCorpusIndex::default());
        // Embeddings from ScriptedClient::embed are always [1.0, 0.0], so a
        // corpus rule with the same embedding gives every similarity test a
        // deterministic, maximally-similar neighbor to classify against.
        corpus
            .insert(SigmaRule {
                id: Uuid::new_v4(),
                yaml_text: "title: corpus baseline rule\n".to_string(),
                embedding: vec![1.0, 0.0],
                tags: vec!["baseline".to_string()],
            })
            .await;

        let engine = WorkflowEngine::new(
            store.clone() as Arc<dyn CatalogStore>,
            queue.clone() as Arc<dyn WorkQueue>,
            gateway,
            Some(corpus as Arc<dyn CorpusIndex>),
        );

        Harness { engine, store, queue, client }
    }

    async fn trigger_and_run(h: &Harness, article_id: Uuid) -> Uuid {
        let outcome = h.engine.trigger(article_id, TriggerOptions::default()).await.unwrap();
        assert!(outcome.accepted);
        let message = h.queue.dequeue().await.unwrap().unwrap();
        h.engine.run(message).await.unwrap();
        outcome.execution_id
    }

    #[tokio::test]
    async fn os_detect_terminates_non_windows_articles() {
        let config = base_config();
        let h = harness(config).await;
        h.client.script("SYSTEM PROMPT FOR os_detect", vec![ScriptedReply::Text("macos".to_string())]);

        let article = sample_article("a macOS TCC bypass writeup");
        h.store.insert_article(article.clone()).await.unwrap();

        let execution_id = trigger_and_run(&h, article.id).await;
        let snapshot = h.engine.get(execution_id).await.unwrap();

        assert_eq!(snapshot.execution.status, ExecutionStatus::TerminatedEarly);
        assert_eq!(snapshot.execution.termination_reason, Some(TerminationReason::NonWindowsOsDetected));
        assert_eq!(snapshot.stage_results.len(), 1);
        assert_eq!(snapshot.stage_results[0].stage_name, StageName::OsDetect);
    }

    #[tokio::test]
    async fn junk_filter_terminates_articles_with_no_huntable_content() {
        let config = base_config();
        let h = harness(config).await;
        h.client.script("SYSTEM PROMPT FOR os_detect", vec![ScriptedReply::Text("windows".to_string())]);
        h.client.script("SYSTEM PROMPT FOR junk_filter", vec![ScriptedReply::Text("junk".to_string())]);

        let article = sample_article("Best practices for cybersecurity awareness training programs.");
        h.store.insert_article(article.clone()).await.unwrap();

        let execution_id = trigger_and_run(&h, article.id).await;
        let snapshot = h.engine.get(execution_id).await.unwrap();

        assert_eq!(snapshot.execution.status, ExecutionStatus::TerminatedEarly);
        assert_eq!(snapshot.execution.termination_reason, Some(TerminationReason::JunkFiltered));
    }

    #[tokio::test]
    async fn rank_terminates_below_threshold_articles() {
        let config = base_config();
        let h = harness(config).await;
        h.client.script("SYSTEM PROMPT FOR os_detect", vec![ScriptedReply::Text("windows".to_string())]);
        h.client.script("SYSTEM PROMPT FOR junk_filter", vec![ScriptedReply::Text("huntable".to_string())]);
        h.client.script("SYSTEM PROMPT FOR rank", vec![ScriptedReply::Text(r#"{"score": 2.0, "rationale": "low severity"}"#.to_string())]);

        let article = sample_article("rundll32.exe user32.dll,LockWorkStation");
        h.store.insert_article(article.clone()).await.unwrap();

        let execution_id = trigger_and_run(&h, article.id).await;
        let snapshot = h.engine.get(execution_id).await.unwrap();

        assert_eq!(snapshot.execution.status, ExecutionStatus::TerminatedEarly);
        assert_eq!(snapshot.execution.termination_reason, Some(TerminationReason::BelowRankThreshold));
    }

    #[tokio::test]
    async fn happy_path_completes_with_sigma_rule_and_similarity_classification() {
        let config = base_config();
        let h = harness(config).await;
        h.client.script("SYSTEM PROMPT FOR os_detect", vec![ScriptedReply::Text("windows".to_string())]);
        h.client.script("SYSTEM PROMPT FOR junk_filter", vec![ScriptedReply::Text("huntable".to_string())]);
        h.client.script("SYSTEM PROMPT FOR rank", vec![ScriptedReply::Text(r#"{"score": 8.5, "rationale": "credible T1059 abuse"}"#.to_string())]);
        h.client.script(
            "SYSTEM PROMPT FOR cmdline_extract",
            vec![ScriptedReply::Text(r#"{"count": 1, "items": ["rundll32.exe user32.dll,LockWorkStation"]}"#.to_string())],
        );
        h.client.script(
            "SYSTEM PROMPT FOR proctree_extract",
            vec![ScriptedReply::Text(r#"{"process_lineage": [], "count": 0}"#.to_string())],
        );
        h.client.script(
            "SYSTEM PROMPT FOR hunt_queries_extract",
            vec![ScriptedReply::Text(
                r#"{"queries": [{"query": "SecurityEvent | where CommandLine contains \"LockWorkStation\"", "type": "kql"}], "query_count": 1}"#.to_string(),
            )],
        );
        let valid_rule = r#"
title: Suspicious rundll32 LockWorkStation
logsource:
  category: process_creation
  product: windows
detection:
  selection:
    CommandLine|contains: 'LockWorkStation'
  condition: selection
level: medium
"#;
        h.client.script("SYSTEM PROMPT FOR sigma_gen", vec![ScriptedReply::Text(valid_rule.to_string())]);

        let article = sample_article("rundll32.exe user32.dll,LockWorkStation and a KQL hunt query");
        h.store.insert_article(article.clone()).await.unwrap();

        let execution_id = trigger_and_run(&h, article.id).await;
        let snapshot = h.engine.get(execution_id).await.unwrap();

        assert_eq!(snapshot.execution.status, ExecutionStatus::Completed);
        assert_eq!(snapshot.execution.discrete_huntables_count, 2);
        assert!(!snapshot.execution.sigma_rules.is_empty());
        assert_eq!(snapshot.execution.similarity_results.len(), snapshot.execution.sigma_rules.len());
    }

    #[tokio::test]
    async fn duplicate_trigger_is_idempotent() {
        let config = base_config();
        let h = harness(config).await;
        let article = sample_article("content");
        h.store.insert_article(article.clone()).await.unwrap();

        let first = h.engine.trigger(article.id, TriggerOptions::default()).await.unwrap();
        assert!(first.accepted);

        let second = h.engine.trigger(article.id, TriggerOptions::default()).await.unwrap();
        assert!(!second.accepted);
        assert_eq!(second.execution_id, first.execution_id);
        assert_eq!(second.reason.as_deref(), Some("already_active"));

        let executions = h.store.list_executions_for_article(article.id).await.unwrap();
        assert_eq!(executions.len(), 1);
    }

    #[tokio::test]
    async fn sub_agent_partial_failure_is_isolated() {
        let config = base_config();
        let h = harness(config).await;
        h.client.script("SYSTEM PROMPT FOR os_detect", vec![ScriptedReply::Text("windows".to_string())]);
        h.client.script("SYSTEM PROMPT FOR junk_filter", vec![ScriptedReply::Text("huntable".to_string())]);
        h.client.script("SYSTEM PROMPT FOR rank", vec![ScriptedReply::Text(r#"{"score": 9.0, "rationale": "ok"}"#.to_string())]);
        h.client.script(
            "SYSTEM PROMPT FOR cmdline_extract",
            vec![ScriptedReply::Text(r#"{"count": 2, "items": ["whoami", "net user"]}"#.to_string())],
        );
        // Unparseable: triggers a SubAgentResult error for proctree_extract
        // while the sibling sub-agents still contribute (§4.3.d).
        h.client.script("SYSTEM PROMPT FOR proctree_extract", vec![ScriptedReply::Text("not json at all".to_string())]);
        h.client.script(
            "SYSTEM PROMPT FOR hunt_queries_extract",
            vec![ScriptedReply::Text(r#"{"queries": [{"query": "index=main whoami", "type": "splunk"}], "query_count": 1}"#.to_string())],
        );
        let valid_rule = r#"
title: Reconnaissance command execution
logsource:
  category: process_creation
detection:
  selection:
    CommandLine|contains: 'whoami'
  condition: selection
level: low
"#;
        h.client.script("SYSTEM PROMPT FOR sigma_gen", vec![ScriptedReply::Text(valid_rule.to_string())]);

        let article = sample_article("whoami and net user with a splunk query");
        h.store.insert_article(article.clone()).await.unwrap();

        let execution_id = trigger_and_run(&h, article.id).await;
        let snapshot = h.engine.get(execution_id).await.unwrap();

        assert_eq!(snapshot.execution.status, ExecutionStatus::Completed);
        assert_eq!(snapshot.execution.discrete_huntables_count, 3);
        let extraction = snapshot.execution.extraction_result.as_ref().unwrap();
        assert!(extraction.subresults[&crate::models::ObservableType::ProcessLineage].error.is_some());
    }

    #[tokio::test]
    async fn sigma_gen_recovers_from_invalid_yaml_via_feedback() {
        let mut config = base_config();
        config.sigma_fallback_enabled = true;
        let h = harness(config).await;
        h.client.script("SYSTEM PROMPT FOR os_detect", vec![ScriptedReply::Text("windows".to_string())]);
        h.client.script("SYSTEM PROMPT FOR junk_filter", vec![ScriptedReply::Text("huntable".to_string())]);
        h.client.script("SYSTEM PROMPT FOR rank", vec![ScriptedReply::Text(r#"{"score": 7.0, "rationale": "ok"}"#.to_string())]);
        // No sub-agents enabled here would error the stage; keep the three
        // extract agents but make every one of them come back empty so the
        // run falls through to the fallback-content Sigma path.
        h.client.script("SYSTEM PROMPT FOR cmdline_extract", vec![ScriptedReply::Text(r#"{"count": 0, "items": []}"#.to_string())]);
        h.client.script("SYSTEM PROMPT FOR proctree_extract", vec![ScriptedReply::Text(r#"{"process_lineage": [], "count": 0}"#.to_string())]);
        h.client.script("SYSTEM PROMPT FOR hunt_queries_extract", vec![ScriptedReply::Text(r#"{"queries": [], "query_count": 0}"#.to_string())]);

        let valid_rule = r#"
title: Reconnaissance via whoami
logsource:
  category: process_creation
detection:
  selection:
    CommandLine|contains: 'whoami'
  condition: selection
level: low
"#;
        // First queued reply is malformed YAML; every subsequent reply
        // (including the repeated final one the concurrent candidates all
        // converge on) is valid, exercising the per-candidate
        // retry-with-feedback loop (§4.1).
        h.client.script(
            "SYSTEM PROMPT FOR sigma_gen",
            vec![ScriptedReply::Text("title: [unterminated".to_string()), ScriptedReply::Text(valid_rule.to_string())],
        );

        let article = sample_article("whoami is run repeatedly across hosts");
        h.store.insert_article(article.clone()).await.unwrap();

        let execution_id = trigger_and_run(&h, article.id).await;
        let snapshot = h.engine.get(execution_id).await.unwrap();

        assert_eq!(snapshot.execution.status, ExecutionStatus::Completed);
        assert!(!snapshot.execution.sigma_rules.is_empty());
    }

    #[tokio::test]
    async fn gateway_transient_failures_exhaust_retries_and_fail_the_execution() {
        let config = base_config();
        let h = harness(config).await;
        h.client.script("SYSTEM PROMPT FOR os_detect", vec![ScriptedReply::Transient]);

        let article = sample_article("content that never classifies");
        h.store.insert_article(article.clone()).await.unwrap();

        let execution_id = trigger_and_run(&h, article.id).await;
        let snapshot = h.engine.get(execution_id).await.unwrap();

        assert_eq!(snapshot.execution.status, ExecutionStatus::Failed);
        assert_eq!(snapshot.execution.error.as_ref().unwrap().stage, StageName::OsDetect);
        assert_eq!(snapshot.stage_results.len(), MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn operator_cancel_terminates_a_queued_execution() {
        let config = base_config();
        let h = harness(config).await;
        let article = sample_article("content");
        h.store.insert_article(article.clone()).await.unwrap();

        let outcome = h.engine.trigger(article.id, TriggerOptions::default()).await.unwrap();
        h.engine.cancel(outcome.execution_id).await.unwrap();

        let message = h.queue.dequeue().await.unwrap().unwrap();
        h.engine.run(message).await.unwrap();

        let snapshot = h.engine.get(outcome.execution_id).await.unwrap();
        assert_eq!(snapshot.execution.status, ExecutionStatus::TerminatedEarly);
        assert_eq!(snapshot.execution.termination_reason, Some(TerminationReason::Cancelled));
    }

    #[tokio::test]
    async fn cancel_on_a_terminal_execution_is_rejected() {
        let config = base_config();
        let h = harness(config).await;
        h.client.script("SYSTEM PROMPT FOR os_detect", vec![ScriptedReply::Text("macos".to_string())]);
        let article = sample_article("macOS content");
        h.store.insert_article(article.clone()).await.unwrap();

        let execution_id = trigger_and_run(&h, article.id).await;
        let result = h.engine.cancel(execution_id).await;
        assert!(matches!(result, Err(EngineError::AlreadyTerminal(_))));
    }
}
