use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Article, Execution, ExecutionStatus, Source, StageOutput, StageResult, WorkflowConfig};
use crate::Result;

/// Durable storage for articles, sources, executions, and per-stage
/// results (§2.1, §3). `claim` is the engine's sole mutual-exclusion
/// primitive (§5 "Locking discipline"): a conditional
/// `queued -> running` update keyed by `(execution_id, status=queued)`,
/// returning whether *this* call performed the transition.
#[async_trait::async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_article(&self, id: Uuid) -> Result<Option<Article>>;
    async fn insert_article(&self, article: Article) -> Result<()>;
    async fn list_unprocessed_articles(&self, min_score: f64, config_version: u32) -> Result<Vec<Article>>;

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>>;
    async fn insert_source(&self, source: Source) -> Result<()>;

    async fn latest_workflow_config(&self) -> Result<WorkflowConfig>;

    async fn create_execution(&self, execution: Execution) -> Result<()>;
    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>>;
    async fn update_execution(&self, execution: Execution) -> Result<()>;
    /// Returns the execution id of any execution in `{queued, running}`
    /// for `article_id`, if one exists (§3 invariant: at most one
    /// non-terminal execution per article).
    async fn active_execution_for_article(&self, article_id: Uuid) -> Result<Option<Execution>>;
    async fn list_executions_for_article(&self, article_id: Uuid) -> Result<Vec<Execution>>;
    async fn list_recent_executions(&self, limit: usize) -> Result<Vec<Execution>>;
    /// The optimistic `queued -> running` claim (§4.1 "Claiming"):
    /// returns `true` only for the caller that performed the transition.
    async fn claim(&self, execution_id: Uuid) -> Result<bool>;

    async fn append_stage_result(&self, result: StageResult) -> Result<()>;
    async fn list_stage_results(&self, execution_id: Uuid) -> Result<Vec<StageResult>>;
    async fn has_successful_execution_at_version(&self, article_id: Uuid, config_version: u32) -> Result<bool>;
}

/// In-memory implementation for tests and single-process development:
/// `RwLock<HashMap<_, _>>` per entity, `Default`-derivable.
#[derive(Default)]
pub struct InMemoryCatalogStore {
    articles: RwLock<HashMap<Uuid, Article>>,
    sources: RwLock<HashMap<Uuid, Source>>,
    executions: RwLock<HashMap<Uuid, Execution>>,
    stage_results: RwLock<HashMap<Uuid, Vec<StageResult>>>,
    config: RwLock<Option<WorkflowConfig>>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_workflow_config(&self, config: WorkflowConfig) {
        *self.config.write().await = Some(config);
    }
}

#[async_trait::async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn get_article(&self, id: Uuid) -> Result<Option<Article>> {
        Ok(self.articles.read().await.get(&id).cloned())
    }

    async fn insert_article(&self, article: Article) -> Result<()> {
        self.articles.write().await.insert(article.id, article);
        Ok(())
    }

    async fn list_unprocessed_articles(&self, min_score: f64, config_version: u32) -> Result<Vec<Article>> {
        let articles = self.articles.read().await;
        let mut out = Vec::new();
        for article in articles.values() {
            if article.threat_hunting_score < min_score {
                continue;
            }
            if self.active_execution_for_article(article.id).await?.is_some() {
                continue;
            }
            if self.has_successful_execution_at_version(article.id, config_version).await? {
                continue;
            }
            out.push(article.clone());
        }
        out.sort_by_key(|a| a.id);
        Ok(out)
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>> {
        Ok(self.sources.read().await.get(&id).cloned())
    }

    async fn insert_source(&self, source: Source) -> Result<()> {
        self.sources.write().await.insert(source.id, source);
        Ok(())
    }

    async fn latest_workflow_config(&self) -> Result<WorkflowConfig> {
        self.config
            .read()
            .await
            .clone()
            .ok_or_else(|| crate::EngineError::Internal("no workflow config has been set".to_string()))
    }

    async fn create_execution(&self, execution: Execution) -> Result<()> {
        self.executions.write().await.insert(execution.id, execution);
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn update_execution(&self, execution: Execution) -> Result<()> {
        self.executions.write().await.insert(execution.id, execution);
        Ok(())
    }

    async fn active_execution_for_article(&self, article_id: Uuid) -> Result<Option<Execution>> {
        let executions = self.executions.read().await;
        Ok(executions
            .values()
            .find(|e| e.article_id == article_id && !e.status.is_terminal())
            .cloned())
    }

    async fn list_executions_for_article(&self, article_id: Uuid) -> Result<Vec<Execution>> {
        let executions = self.executions.read().await;
        let mut out: Vec<Execution> = executions.values().filter(|e| e.article_id == article_id).cloned().collect();
        out.sort_by_key(|e| e.created_at);
        Ok(out)
    }

    async fn list_recent_executions(&self, limit: usize) -> Result<Vec<Execution>> {
        let executions = self.executions.read().await;
        let mut out: Vec<Execution> = executions.values().cloned().collect();
        out.sort_by_key(|e| std::cmp::Reverse(e.created_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn claim(&self, execution_id: Uuid) -> Result<bool> {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&execution_id) {
            Some(execution) if execution.status == ExecutionStatus::Queued => {
                execution.status = ExecutionStatus::Running;
                execution.started_at = Some(Utc::now());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(crate::EngineError::ExecutionNotFound(execution_id)),
        }
    }

    async fn append_stage_result(&self, result: StageResult) -> Result<()> {
        self.stage_results.write().await.entry(result.execution_id).or_default().push(result);
        Ok(())
    }

    async fn list_stage_results(&self, execution_id: Uuid) -> Result<Vec<StageResult>> {
        Ok(self.stage_results.read().await.get(&execution_id).cloned().unwrap_or_default())
    }

    async fn has_successful_execution_at_version(&self, article_id: Uuid, config_version: u32) -> Result<bool> {
        let executions = self.executions.read().await;
        Ok(executions.values().any(|e| {
            e.article_id == article_id && e.config_version == config_version && e.status == ExecutionStatus::Completed
        }))
    }
}

/// Production catalog backed by `sqlx::PgPool` (§2: "durable relational
/// store"). Structured fields (`extraction_result`,
/// `sigma_rules`, `similarity_results`, `metadata`) are stored as `jsonb`
/// columns via [`sqlx::types::Json`]; fields accessed as first-class are
/// also promoted to real columns (`status`, `discrete_huntables_count`,
/// `termination_reason`), per §6 "Persisted state layout". The optimistic
/// `queued -> running` claim (§4.1 "Claiming") is a single `UPDATE ...
/// WHERE status = 'queued'`, using the affected-row count as the
/// single-writer signal rather than a separate lock.
pub struct PgCatalogStore {
    pool: sqlx::PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Creates the catalog's tables if they don't already exist. Run once
    /// at process start; there is no separate migrations directory since
    /// the schema is small and stable (see DESIGN.md).
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id uuid PRIMARY KEY,
    identifier text NOT NULL,
    url text NOT NULL,
    rss_url text,
    active boolean NOT NULL,
    check_frequency_s bigint NOT NULL,
    lookback_days integer NOT NULL,
    allow_filters jsonb NOT NULL DEFAULT '[]',
    deny_filters jsonb NOT NULL DEFAULT '[]',
    created_at timestamptz NOT NULL,
    updated_at timestamptz NOT NULL
);

CREATE TABLE IF NOT EXISTS articles (
    id uuid PRIMARY KEY,
    source_id uuid NOT NULL,
    canonical_url text NOT NULL,
    title text NOT NULL,
    content text NOT NULL,
    filtered_content text,
    content_hash text NOT NULL,
    published_at timestamptz NOT NULL,
    threat_hunting_score double precision NOT NULL,
    ml_hunt_score double precision NOT NULL,
    metadata jsonb NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS workflow_configs (
    version integer PRIMARY KEY,
    agent_models jsonb NOT NULL,
    agent_prompts jsonb NOT NULL,
    thresholds jsonb NOT NULL,
    qa_enabled jsonb NOT NULL,
    enabled_subagents jsonb NOT NULL,
    sigma_fallback_enabled boolean NOT NULL,
    similarity_k integer NOT NULL,
    os_detect_proceed_on_unknown boolean NOT NULL,
    auto_trigger_threshold double precision NOT NULL
);

CREATE TABLE IF NOT EXISTS executions (
    id uuid PRIMARY KEY,
    article_id uuid NOT NULL REFERENCES articles(id),
    status text NOT NULL,
    termination_reason text,
    config_version integer NOT NULL,
    started_at timestamptz,
    finished_at timestamptz,
    discrete_huntables_count integer NOT NULL DEFAULT 0,
    extraction_result jsonb,
    sigma_rules jsonb NOT NULL DEFAULT '[]',
    similarity_results jsonb NOT NULL DEFAULT '[]',
    error jsonb,
    created_at timestamptz NOT NULL
);

CREATE INDEX IF NOT EXISTS executions_article_id_idx ON executions(article_id);

-- At most one non-terminal execution per article (§3), enforced at the
-- database level so the trigger-time dedup check is correct across worker
-- processes, not just within one.
CREATE UNIQUE INDEX IF NOT EXISTS executions_one_active_per_article
    ON executions(article_id) WHERE status IN ('queued', 'running');

CREATE TABLE IF NOT EXISTS stage_results (
    execution_id uuid NOT NULL REFERENCES executions(id),
    stage_name text NOT NULL,
    attempt integer NOT NULL,
    status text NOT NULL,
    started_at timestamptz NOT NULL,
    finished_at timestamptz,
    input_fingerprint text NOT NULL,
    nonce uuid NOT NULL,
    output jsonb,
    llm_telemetry jsonb,
    error text,
    PRIMARY KEY (execution_id, stage_name, attempt)
);
"#;

#[derive(sqlx::FromRow)]
struct ArticleRow {
    id: Uuid,
    source_id: Uuid,
    canonical_url: String,
    title: String,
    content: String,
    filtered_content: Option<String>,
    content_hash: String,
    published_at: chrono::DateTime<Utc>,
    threat_hunting_score: f64,
    ml_hunt_score: f64,
    metadata: sqlx::types::Json<HashMap<String, serde_json::Value>>,
}

impl From<ArticleRow> for Article {
    fn from(row: ArticleRow) -> Self {
        Article {
            id: row.id,
            source_id: row.source_id,
            canonical_url: row.canonical_url,
            title: row.title,
            content: row.content,
            filtered_content: row.filtered_content,
            content_hash: row.content_hash,
            published_at: row.published_at,
            threat_hunting_score: row.threat_hunting_score,
            ml_hunt_score: row.ml_hunt_score,
            metadata: row.metadata.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SourceRow {
    id: Uuid,
    identifier: String,
    url: String,
    rss_url: Option<String>,
    active: bool,
    check_frequency_s: i64,
    lookback_days: i32,
    allow_filters: sqlx::types::Json<Vec<String>>,
    deny_filters: sqlx::types::Json<Vec<String>>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl From<SourceRow> for Source {
    fn from(row: SourceRow) -> Self {
        Source {
            id: row.id,
            identifier: row.identifier,
            url: row.url,
            rss_url: row.rss_url,
            active: row.active,
            check_frequency_s: row.check_frequency_s as u64,
            lookback_days: row.lookback_days as u32,
            allow_filters: row.allow_filters.0,
            deny_filters: row.deny_filters.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    article_id: Uuid,
    status: String,
    termination_reason: Option<String>,
    config_version: i32,
    started_at: Option<chrono::DateTime<Utc>>,
    finished_at: Option<chrono::DateTime<Utc>>,
    discrete_huntables_count: i32,
    extraction_result: Option<sqlx::types::Json<crate::models::ExtractionResult>>,
    sigma_rules: sqlx::types::Json<Vec<crate::models::GeneratedSigmaRule>>,
    similarity_results: sqlx::types::Json<Vec<crate::models::SimilarityMatchResult>>,
    error: Option<sqlx::types::Json<crate::models::ExecutionError>>,
    created_at: chrono::DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = crate::EngineError;

    fn try_from(row: ExecutionRow) -> std::result::Result<Self, Self::Error> {
        let status = serde_json::from_value(serde_json::Value::String(row.status))
            .map_err(|e| crate::EngineError::Internal(format!("bad execution status in db: {e}")))?;
        let termination_reason = row
            .termination_reason
            .map(|s| serde_json::from_value(serde_json::Value::String(s)))
            .transpose()
            .map_err(|e| crate::EngineError::Internal(format!("bad termination reason in db: {e}")))?;
        Ok(Execution {
            id: row.id,
            article_id: row.article_id,
            status,
            termination_reason,
            config_version: row.config_version as u32,
            started_at: row.started_at,
            finished_at: row.finished_at,
            discrete_huntables_count: row.discrete_huntables_count as u32,
            extraction_result: row.extraction_result.map(|j| j.0),
            sigma_rules: row.sigma_rules.0,
            similarity_results: row.similarity_results.0,
            error: row.error.map(|j| j.0),
            created_at: row.created_at,
        })
    }
}

#[async_trait::async_trait]
impl CatalogStore for PgCatalogStore {
    async fn get_article(&self, id: Uuid) -> Result<Option<Article>> {
        let row: Option<ArticleRow> = sqlx::query_as(
            "SELECT id, source_id, canonical_url, title, content, filtered_content, content_hash, \
             published_at, threat_hunting_score, ml_hunt_score, metadata FROM articles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Article::from))
    }

    async fn insert_article(&self, article: Article) -> Result<()> {
        sqlx::query(
            "INSERT INTO articles (id, source_id, canonical_url, title, content, filtered_content, \
             content_hash, published_at, threat_hunting_score, ml_hunt_score, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(article.id)
        .bind(article.source_id)
        .bind(&article.canonical_url)
        .bind(&article.title)
        .bind(&article.content)
        .bind(&article.filtered_content)
        .bind(&article.content_hash)
        .bind(article.published_at)
        .bind(article.threat_hunting_score)
        .bind(article.ml_hunt_score)
        .bind(sqlx::types::Json(&article.metadata))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_unprocessed_articles(&self, min_score: f64, config_version: u32) -> Result<Vec<Article>> {
        let rows: Vec<ArticleRow> = sqlx::query_as(
            "SELECT a.id, a.source_id, a.canonical_url, a.title, a.content, a.filtered_content, \
             a.content_hash, a.published_at, a.threat_hunting_score, a.ml_hunt_score, a.metadata \
             FROM articles a \
             WHERE a.threat_hunting_score >= $1 \
               AND NOT EXISTS ( \
                 SELECT 1 FROM executions e WHERE e.article_id = a.id \
                   AND e.status IN ('queued', 'running') \
               ) \
               AND NOT EXISTS ( \
                 SELECT 1 FROM executions e WHERE e.article_id = a.id \
                   AND e.config_version = $2 AND e.status = 'completed' \
               ) \
             ORDER BY a.id",
        )
        .bind(min_score)
        .bind(config_version as i32)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Article::from).collect())
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>> {
        let row: Option<SourceRow> = sqlx::query_as(
            "SELECT id, identifier, url, rss_url, active, check_frequency_s, lookback_days, \
             allow_filters, deny_filters, created_at, updated_at FROM sources WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Source::from))
    }

    async fn insert_source(&self, source: Source) -> Result<()> {
        sqlx::query(
            "INSERT INTO sources (id, identifier, url, rss_url, active, check_frequency_s, \
             lookback_days, allow_filters, deny_filters, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(source.id)
        .bind(&source.identifier)
        .bind(&source.url)
        .bind(&source.rss_url)
        .bind(source.active)
        .bind(source.check_frequency_s as i64)
        .bind(source.lookback_days as i32)
        .bind(sqlx::types::Json(&source.allow_filters))
        .bind(sqlx::types::Json(&source.deny_filters))
        .bind(source.created_at)
        .bind(source.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_workflow_config(&self) -> Result<WorkflowConfig> {
        let row: Option<(
            i32,
            sqlx::types::Json<HashMap<String, crate::models::AgentModelConfig>>,
            sqlx::types::Json<HashMap<String, String>>,
            sqlx::types::Json<crate::models::Thresholds>,
            sqlx::types::Json<HashMap<String, bool>>,
            sqlx::types::Json<std::collections::HashSet<String>>,
            bool,
            i32,
            bool,
            f64,
        )> = sqlx::query_as(
            "SELECT version, agent_models, agent_prompts, thresholds, qa_enabled, enabled_subagents, \
             sigma_fallback_enabled, similarity_k, os_detect_proceed_on_unknown, auto_trigger_threshold \
             FROM workflow_configs ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let (
            version,
            agent_models,
            agent_prompts,
            thresholds,
            qa_enabled,
            enabled_subagents,
            sigma_fallback_enabled,
            similarity_k,
            os_detect_proceed_on_unknown,
            auto_trigger_threshold,
        ) = row.ok_or_else(|| crate::EngineError::Internal("no workflow config row present".to_string()))?;

        Ok(WorkflowConfig {
            version: version as u32,
            agent_models: agent_models.0,
            agent_prompts: agent_prompts.0,
            thresholds: thresholds.0,
            qa_enabled: qa_enabled.0,
            enabled_subagents: enabled_subagents.0,
            sigma_fallback_enabled,
            similarity_k: similarity_k as u32,
            os_detect_proceed_on_unknown,
            auto_trigger_threshold,
        })
    }

    async fn create_execution(&self, execution: Execution) -> Result<()> {
        sqlx::query(
            "INSERT INTO executions (id, article_id, status, termination_reason, config_version, \
             started_at, finished_at, discrete_huntables_count, extraction_result, sigma_rules, \
             similarity_results, error, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(execution.id)
        .bind(execution.article_id)
        .bind(serde_json::to_value(execution.status)?.as_str().unwrap_or_default().to_string())
        .bind(execution.termination_reason.map(|r| r.as_str().to_string()))
        .bind(execution.config_version as i32)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.discrete_huntables_count as i32)
        .bind(execution.extraction_result.map(sqlx::types::Json))
        .bind(sqlx::types::Json(execution.sigma_rules))
        .bind(sqlx::types::Json(execution.similarity_results))
        .bind(execution.error.map(sqlx::types::Json))
        .bind(execution.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        let row: Option<ExecutionRow> = sqlx::query_as(
            "SELECT id, article_id, status, termination_reason, config_version, started_at, \
             finished_at, discrete_huntables_count, extraction_result, sigma_rules, \
             similarity_results, error, created_at FROM executions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Execution::try_from).transpose()
    }

    async fn update_execution(&self, execution: Execution) -> Result<()> {
        sqlx::query(
            "UPDATE executions SET status = $2, termination_reason = $3, started_at = $4, \
             finished_at = $5, discrete_huntables_count = $6, extraction_result = $7, \
             sigma_rules = $8, similarity_results = $9, error = $10 WHERE id = $1",
        )
        .bind(execution.id)
        .bind(serde_json::to_value(execution.status)?.as_str().unwrap_or_default().to_string())
        .bind(execution.termination_reason.map(|r| r.as_str().to_string()))
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.discrete_huntables_count as i32)
        .bind(execution.extraction_result.map(sqlx::types::Json))
        .bind(sqlx::types::Json(execution.sigma_rules))
        .bind(sqlx::types::Json(execution.similarity_results))
        .bind(execution.error.map(sqlx::types::Json))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_execution_for_article(&self, article_id: Uuid) -> Result<Option<Execution>> {
        let row: Option<ExecutionRow> = sqlx::query_as(
            "SELECT id, article_id, status, termination_reason, config_version, started_at, \
             finished_at, discrete_huntables_count, extraction_result, sigma_rules, \
             similarity_results, error, created_at FROM executions \
             WHERE article_id = $1 AND status IN ('queued', 'running') LIMIT 1",
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Execution::try_from).transpose()
    }

    async fn list_executions_for_article(&self, article_id: Uuid) -> Result<Vec<Execution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            "SELECT id, article_id, status, termination_reason, config_version, started_at, \
             finished_at, discrete_huntables_count, extraction_result, sigma_rules, \
             similarity_results, error, created_at FROM executions \
             WHERE article_id = $1 ORDER BY created_at",
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Execution::try_from).collect()
    }

    async fn list_recent_executions(&self, limit: usize) -> Result<Vec<Execution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            "SELECT id, article_id, status, termination_reason, config_version, started_at, \
             finished_at, discrete_huntables_count, extraction_result, sigma_rules, \
             similarity_results, error, created_at FROM executions \
             ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Execution::try_from).collect()
    }

    /// The sole mutual-exclusion primitive (§5): a conditional update
    /// keyed by `(execution_id, status='queued')`, using
    /// `rows_affected()` as the "did I win the claim" signal rather than
    /// a row lock, so it composes correctly under process-level
    /// parallelism (§9 "Cross-process concurrency").
    async fn claim(&self, execution_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'running', started_at = now() \
             WHERE id = $1 AND status = 'queued'",
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            Ok(true)
        } else {
            let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM executions WHERE id = $1")
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(crate::EngineError::ExecutionNotFound(execution_id));
            }
            Ok(false)
        }
    }

    async fn append_stage_result(&self, result: StageResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO stage_results (execution_id, stage_name, attempt, status, started_at, \
             finished_at, input_fingerprint, nonce, output, llm_telemetry, error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(result.execution_id)
        .bind(result.stage_name.as_str())
        .bind(result.attempt as i32)
        .bind(serde_json::to_value(result.status)?.as_str().unwrap_or_default().to_string())
        .bind(result.started_at)
        .bind(result.finished_at)
        .bind(&result.input_fingerprint)
        .bind(result.nonce)
        .bind(result.output.map(sqlx::types::Json))
        .bind(result.llm_telemetry.map(sqlx::types::Json))
        .bind(&result.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_stage_results(&self, execution_id: Uuid) -> Result<Vec<StageResult>> {
        let rows: Vec<(
            Uuid,
            String,
            i32,
            String,
            chrono::DateTime<Utc>,
            Option<chrono::DateTime<Utc>>,
            String,
            Uuid,
            Option<sqlx::types::Json<StageOutput>>,
            Option<sqlx::types::Json<crate::models::LlmTelemetry>>,
            Option<String>,
        )> = sqlx::query_as(
            "SELECT execution_id, stage_name, attempt, status, started_at, finished_at, \
             input_fingerprint, nonce, output, llm_telemetry, error FROM stage_results \
             WHERE execution_id = $1 ORDER BY attempt",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(
                    execution_id,
                    stage_name,
                    attempt,
                    status,
                    started_at,
                    finished_at,
                    input_fingerprint,
                    nonce,
                    output,
                    llm_telemetry,
                    error,
                )| {
                    Ok(StageResult {
                        execution_id,
                        stage_name: serde_json::from_value(serde_json::Value::String(stage_name))
                            .map_err(|e| crate::EngineError::Internal(format!("bad stage name in db: {e}")))?,
                        attempt: attempt as u32,
                        status: serde_json::from_value(serde_json::Value::String(status))
                            .map_err(|e| crate::EngineError::Internal(format!("bad stage status in db: {e}")))?,
                        started_at,
                        finished_at,
                        input_fingerprint,
                        nonce,
                        output: output.map(|j| j.0),
                        llm_telemetry: llm_telemetry.map(|j| j.0),
                        error,
                    })
                },
            )
            .collect()
    }

    async fn has_successful_execution_at_version(&self, article_id: Uuid, config_version: u32) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM executions WHERE article_id = $1 AND config_version = $2 \
             AND status = 'completed')",
        )
        .bind(article_id)
        .bind(config_version as i32)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .next()
        .unwrap_or((false,));
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionStatus;

    fn sample_execution(article_id: Uuid) -> Execution {
        Execution::new(article_id, 1)
    }

    #[tokio::test]
    async fn claim_transitions_exactly_once() {
        let store = InMemoryCatalogStore::new();
        let execution = sample_execution(Uuid::new_v4());
        let id = execution.id;
        store.create_execution(execution).await.unwrap();

        assert!(store.claim(id).await.unwrap());
        assert!(!store.claim(id).await.unwrap());

        let fetched = store.get_execution(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn active_execution_lookup_respects_terminal_status() {
        let store = InMemoryCatalogStore::new();
        let article_id = Uuid::new_v4();
        let mut execution = sample_execution(article_id);
        execution.complete();
        store.create_execution(execution).await.unwrap();

        assert!(store.active_execution_for_article(article_id).await.unwrap().is_none());
    }
}
