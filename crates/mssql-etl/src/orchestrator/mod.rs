//! Migration orchestrator - main workflow coordinator.
//!
//! One run goes through PREPARING, CONNECTING, PRE_PROCESSING,
//! EXTRACTING_VARIABLES, DELETING (ordered strategy only), MIGRATING and
//! POST_PROCESSING, recording each phase and query in the progress snapshot.

mod query;
mod summary;

pub use summary::{HealthStatus, QueryCheck, QueryResult, RunSummary, ValidationReport};

use crate::config::{Config, DeleteStrategy, QuerySpec};
use crate::core::TableName;
use crate::db::{default_handle, Database, DatabaseSet, MetadataCache, MssqlDatabase};
use crate::deletion::{
    disable_constraints, enable_constraints, resolve_order, ChunkedDeleter,
};
use crate::error::{MigrateError, Result};
use crate::progress::{Phase, PhaseStatus, ProgressTracker, QueryStatus, RunStatus};
use crate::script::{validate_single_select, FailureMode, ScriptProcessor};
use crate::transfer::estimate_rows;
use crate::variables::{DynamicExtractor, VariableStore};
use chrono::Utc;
use query::{Prefetched, QueryEnv};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State threaded through one run.
pub struct RunContext {
    pub variables: VariableStore,
    pub progress: ProgressTracker,
    pub metadata: MetadataCache,
}

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    databases: Option<DatabaseSet>,
    cancel: CancellationToken,
}

/// How the query phases of a run ended.
#[derive(Default)]
struct RunOutcome {
    results: Vec<QueryResult>,
    skipped: usize,
    cancelled: bool,
    /// A failure inside the run transaction stopped the run.
    aborted: bool,
}

/// Result of the ordered deletion phase.
#[derive(Default)]
struct DeletePhase {
    prefetched: HashMap<String, Prefetched>,
    failed: Vec<QueryResult>,
    circular: Vec<TableName>,
    aborted: bool,
    cancelled: bool,
}

impl Orchestrator {
    /// Create an orchestrator. Connections are opened when the run starts.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            databases: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Use already-open databases instead of connecting from the config.
    pub fn with_databases(mut self, databases: DatabaseSet) -> Self {
        self.databases = Some(databases);
        self
    }

    /// Token checked between queries and batches. A cancelled run ends PAUSED.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Check every enabled query offline: static substitution and the
    /// single-SELECT rule. Dynamic variables are not extracted.
    pub fn validate(&self) -> ValidationReport {
        let plan = &self.config.plan;
        let variables = VariableStore::from_plan(&plan.variables);
        let dynamic: HashSet<&str> = plan
            .dynamic_variables
            .iter()
            .filter(|d| d.enabled)
            .map(|d| d.name.as_str())
            .collect();

        let queries = plan
            .enabled_queries()
            .map(|spec| {
                let substituted = variables.substitute(spec.source_text());
                let unresolved: Vec<String> = substituted
                    .unresolved
                    .into_iter()
                    .filter(|p| !dynamic.contains(p.split('.').next().unwrap_or(p)))
                    .collect();

                let message = match validate_single_select(&spec.id, &substituted.sql) {
                    Err(e) => Some(e.to_string()),
                    Ok(()) if !unresolved.is_empty() && self.config.settings.fail_on_unresolved => {
                        Some(format!("unresolved placeholders: {}", unresolved.join(", ")))
                    }
                    Ok(()) => None,
                };
                QueryCheck {
                    query_id: spec.id.clone(),
                    valid: message.is_none(),
                    message,
                    unresolved,
                }
            })
            .collect();

        ValidationReport {
            plan_name: plan.name.clone(),
            plan_hash: self.config.hash(),
            queries,
            dynamic_variables: plan.dynamic_variables.iter().filter(|d| d.enabled).count(),
            pre_process_groups: plan.pre_process.iter().filter(|g| g.enabled).count(),
            post_process_groups: plan.post_process.iter().filter(|g| g.enabled).count(),
        }
    }

    /// Try every configured database.
    pub async fn health_check(&self) -> Vec<HealthStatus> {
        let mut statuses = Vec::new();
        for name in self.config.database_names() {
            let result = match self.databases {
                Some(ref set) => match set.get(&name) {
                    Ok(db) => db.test_connection().await,
                    Err(e) => Err(e),
                },
                None => match self.config.database(&name) {
                    Some(db_config) => match MssqlDatabase::connect(&name, db_config.clone(), 1).await {
                        Ok(db) => {
                            db.close().await;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                    None => continue,
                },
            };
            statuses.push(HealthStatus {
                database: name,
                healthy: result.is_ok(),
                message: result.err().map(|e| e.to_string()),
            });
        }
        statuses
    }

    /// Run the plan, or resume the run `resume_id`.
    ///
    /// Query failures do not make this return `Err`: they are recorded and
    /// the summary reports them. Fatal failures (connection, global
    /// pre-processing, variable extraction, progress persistence) are
    /// recorded in the snapshot and returned.
    pub async fn run(self, resume_id: Option<&str>) -> Result<RunSummary> {
        let Orchestrator {
            config,
            databases,
            cancel,
        } = self;
        let started_at = Utc::now();
        let settings = &config.settings;
        let plan_hash = config.hash();
        let enabled: Vec<&QuerySpec> = config.plan.enabled_queries().collect();

        let mut progress = match resume_id {
            Some(id) => ProgressTracker::resume(&settings.progress_dir, id, &plan_hash, &enabled)?,
            None => ProgressTracker::create(
                &settings.progress_dir,
                &plan_hash,
                config.plan.name.as_deref(),
                &enabled,
            )?,
        };
        progress.start_phase(Phase::Preparing)?;
        progress.complete_phase(Phase::Preparing)?;
        progress.set_status(RunStatus::Running)?;
        progress.start_autosave(Duration::from_secs(settings.save_interval_secs));
        info!(
            "Starting migration {} ({} enabled queries)",
            progress.migration_id(),
            enabled.len()
        );

        progress.start_phase(Phase::Connecting)?;
        let databases = match connect(&config, databases).await {
            Ok(set) => set,
            Err(e) => {
                error!("Connection failed: {}", e);
                record_quietly(progress.fail_phase(Phase::Connecting, &e));
                record_quietly(progress.finish(RunStatus::Failed).map(|_| ()));
                return Err(e);
            }
        };
        progress.complete_phase(Phase::Connecting)?;

        let mut ctx = RunContext {
            variables: VariableStore::from_plan(&config.plan.variables),
            progress,
            metadata: MetadataCache::new(),
        };

        let result = execute(&config, &databases, &mut ctx, &cancel).await;
        databases.close_all().await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let status = match e {
                    MigrateError::Cancelled => RunStatus::Paused,
                    _ => RunStatus::Failed,
                };
                error!("Migration {}: {}", ctx.progress.migration_id(), e);
                record_quietly(ctx.progress.finish(status).map(|_| ()));
                return Err(e);
            }
        };

        let failure_count = outcome
            .results
            .iter()
            .filter(|r| r.status == QueryStatus::Failed)
            .count();
        let success_count = outcome
            .results
            .iter()
            .filter(|r| r.status == QueryStatus::Completed)
            .count();
        let status = if outcome.cancelled {
            RunStatus::Paused
        } else if failure_count > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let snapshot = ctx.progress.finish(status)?;

        let completed_at = Utc::now();
        let summary = RunSummary {
            success: status == RunStatus::Completed,
            status,
            migration_id: snapshot.migration_id,
            progress_file: ctx.progress.path().to_path_buf(),
            total_processed: outcome
                .results
                .iter()
                .filter(|r| r.status == QueryStatus::Completed)
                .map(|r| r.rows_inserted)
                .sum(),
            success_count,
            failure_count,
            skipped_count: outcome.skipped,
            per_query_results: outcome.results,
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
        };

        info!(
            "Migration {} {}: {} succeeded, {} failed, {} skipped, {} rows in {:.1}s",
            summary.migration_id,
            summary.status,
            summary.success_count,
            summary.failure_count,
            summary.skipped_count,
            summary.total_processed,
            summary.duration_seconds
        );
        Ok(summary)
    }
}

fn record_quietly(result: Result<()>) {
    if let Err(e) = result {
        warn!("Progress update failed: {}", e);
    }
}

/// Injected databases are only checked; otherwise pools are opened.
async fn connect(config: &Config, injected: Option<DatabaseSet>) -> Result<DatabaseSet> {
    let Some(set) = injected else {
        return DatabaseSet::connect(config).await;
    };
    for name in config.database_names() {
        let db = set
            .get(&name)
            .map_err(|_| MigrateError::connection(&name, "database not available"))?;
        db.test_connection().await?;
    }
    Ok(set)
}

/// Everything between CONNECTING and finalization.
async fn execute(
    config: &Config,
    databases: &DatabaseSet,
    ctx: &mut RunContext,
    cancel: &CancellationToken,
) -> Result<RunOutcome> {
    run_global_pre_process(config, databases, ctx).await?;
    extract_variables(config, databases, ctx).await?;

    let ctx: &RunContext = ctx;
    let enabled: Vec<&QuerySpec> = config.plan.enabled_queries().collect();
    let working: Vec<&QuerySpec> = enabled
        .iter()
        .copied()
        .filter(|q| ctx.progress.query_status(&q.id) != Some(QueryStatus::Completed))
        .collect();
    let outcome = RunOutcome {
        skipped: enabled.len() - working.len(),
        ..Default::default()
    };
    if outcome.skipped > 0 {
        info!("Skipping {} query(ies) completed by an earlier attempt", outcome.skipped);
    }

    let env = QueryEnv {
        config,
        databases,
        ctx,
        cancel,
    };
    if config.settings.estimate_rows {
        estimate(&env, &working).await?;
    }

    let target = databases.target()?;
    if !config.settings.use_transaction {
        return load(&env, &working, outcome, false).await;
    }

    target.begin_transaction().await?;
    info!("Opened run transaction on {}", target.name());
    let outcome = match load(&env, &working, outcome, true).await {
        Ok(outcome) => outcome,
        Err(e) => {
            abandon_transaction(target.as_ref(), ctx, &e).await;
            return Err(e);
        }
    };
    let discard = outcome.aborted || outcome.cancelled;
    finish_transaction(target.as_ref(), ctx, outcome, discard).await
}

/// DELETING, MIGRATING and POST_PROCESSING.
async fn load(
    env: &QueryEnv<'_>,
    working: &[&QuerySpec],
    mut outcome: RunOutcome,
    in_tx: bool,
) -> Result<RunOutcome> {
    let QueryEnv {
        config,
        databases,
        ctx,
        cancel,
    } = *env;
    let target = databases.target()?;

    let mut deletion = DeletePhase::default();
    if config.settings.delete_strategy == DeleteStrategy::Ordered
        && working.iter().any(|q| q.delete_before_insert)
    {
        ctx.progress.start_phase(Phase::Deleting)?;
        deletion = match ordered_delete(env, working, in_tx).await {
            Ok(d) => d,
            Err(e) => {
                ctx.progress.fail_phase(Phase::Deleting, &e)?;
                return Err(e);
            }
        };
        let status = if deletion.failed.is_empty() {
            PhaseStatus::Completed
        } else {
            PhaseStatus::Failed
        };
        ctx.progress.end_phase(Phase::Deleting, status)?;
    } else {
        ctx.progress.skip_phase(Phase::Deleting)?;
    }

    let failed_early: HashSet<String> = deletion.failed.iter().map(|r| r.query_id.clone()).collect();
    outcome.aborted = deletion.aborted;
    outcome.cancelled = deletion.cancelled;
    outcome.results.append(&mut deletion.failed);

    if outcome.aborted || outcome.cancelled {
        ctx.progress.skip_phase(Phase::Migrating)?;
    } else {
        ctx.progress.start_phase(Phase::Migrating)?;
        for spec in working {
            if failed_early.contains(&spec.id) {
                continue;
            }
            if cancel.is_cancelled() {
                warn!("Cancellation requested, stopping before {}", spec.id);
                outcome.cancelled = true;
                break;
            }

            let start = Instant::now();
            match env.run(spec, deletion.prefetched.remove(&spec.id)).await {
                Ok(result) => {
                    if !in_tx {
                        ctx.progress.complete_query(&spec.id)?;
                    }
                    info!(
                        "{}: completed, {} rows inserted ({:.1}s)",
                        spec.id, result.rows_inserted, result.duration_seconds
                    );
                    outcome.results.push(result);
                }
                Err(MigrateError::Cancelled) => {
                    warn!("{}: cancelled between batches", spec.id);
                    outcome.cancelled = true;
                    break;
                }
                Err(e) => {
                    error!("{}: {}", spec.id, e);
                    ctx.progress.fail_query(&spec.id, &e)?;
                    outcome.results.push(QueryResult::failed(
                        &spec.id,
                        &spec.target_table,
                        e.to_string(),
                        start.elapsed().as_secs_f64(),
                    ));
                    if in_tx {
                        outcome.aborted = true;
                        break;
                    }
                }
            }
        }
        let any_failed = outcome.results.iter().any(|r| r.status == QueryStatus::Failed);
        let status = if any_failed {
            PhaseStatus::Failed
        } else {
            PhaseStatus::Completed
        };
        ctx.progress.end_phase(Phase::Migrating, status)?;
    }

    let discard = in_tx && (outcome.aborted || outcome.cancelled);
    if !deletion.circular.is_empty() && !discard {
        enable_constraints(target.as_ref(), default_handle(target.as_ref()), &deletion.circular).await;
    }

    if outcome.aborted || outcome.cancelled {
        ctx.progress.skip_phase(Phase::PostProcessing)?;
    } else {
        run_global_post_process(config, databases, ctx).await?;
    }
    Ok(outcome)
}

async fn run_global_pre_process(
    config: &Config,
    databases: &DatabaseSet,
    ctx: &RunContext,
) -> Result<()> {
    let groups: Vec<_> = config.plan.pre_process.iter().filter(|g| g.enabled).collect();
    if groups.is_empty() {
        return ctx.progress.skip_phase(Phase::PreProcessing);
    }

    ctx.progress.start_phase(Phase::PreProcessing)?;
    let scripts = ScriptProcessor::new(databases, &ctx.metadata);
    for group in groups {
        if let Err(e) = scripts
            .run_group(group, &ctx.variables, FailureMode::Fatal)
            .await
        {
            error!("Pre-processing group {} failed: {}", group.id, e);
            ctx.progress.fail_phase(Phase::PreProcessing, &e)?;
            return Err(e);
        }
    }
    ctx.metadata.clear();
    ctx.progress.complete_phase(Phase::PreProcessing)
}

async fn extract_variables(
    config: &Config,
    databases: &DatabaseSet,
    ctx: &mut RunContext,
) -> Result<()> {
    let specs = &config.plan.dynamic_variables;
    if !specs.iter().any(|d| d.enabled) {
        return ctx.progress.skip_phase(Phase::ExtractingVariables);
    }

    ctx.progress.start_phase(Phase::ExtractingVariables)?;
    ctx.variables.clear_dynamic();
    match DynamicExtractor::new(databases)
        .extract_all(specs, &mut ctx.variables)
        .await
    {
        Ok(count) => {
            info!("Extracted {} dynamic variable(s)", count);
            ctx.progress.complete_phase(Phase::ExtractingVariables)
        }
        Err(e) => {
            error!("Variable extraction failed: {}", e);
            ctx.progress.fail_phase(Phase::ExtractingVariables, &e)?;
            Err(e)
        }
    }
}

async fn run_global_post_process(
    config: &Config,
    databases: &DatabaseSet,
    ctx: &RunContext,
) -> Result<()> {
    let groups: Vec<_> = config.plan.post_process.iter().filter(|g| g.enabled).collect();
    if groups.is_empty() {
        return ctx.progress.skip_phase(Phase::PostProcessing);
    }

    ctx.progress.start_phase(Phase::PostProcessing)?;
    let scripts = ScriptProcessor::new(databases, &ctx.metadata);
    for group in groups {
        match scripts
            .run_group(group, &ctx.variables, FailureMode::Continue)
            .await
        {
            Ok(o) if o.failed > 0 => warn!(
                "Post-processing group {}: {} of {} statements failed",
                group.id, o.failed, o.statements
            ),
            Ok(_) => {}
            Err(e) => warn!("Post-processing group {} failed: {}", group.id, e),
        }
    }
    ctx.progress.complete_phase(Phase::PostProcessing)
}

/// Best-effort row totals for progress and ETA. Queries that fail the
/// single-SELECT check are not run here.
async fn estimate(env: &QueryEnv<'_>, working: &[&QuerySpec]) -> Result<()> {
    for spec in working {
        let sql = env.ctx.variables.substitute(spec.source_text()).sql;
        if validate_single_select(&spec.id, &sql).is_err() {
            continue;
        }
        let db = match env.databases.get(&spec.source_database) {
            Ok(db) => db,
            Err(e) => {
                warn!("{}: row estimate skipped: {}", spec.id, e);
                continue;
            }
        };
        match estimate_rows(db.as_ref(), &spec.id, &sql).await {
            Ok(rows) => {
                let batch = spec
                    .batch_size
                    .unwrap_or(env.config.settings.default_batch_size)
                    .max(1);
                debug!("{}: estimated {} rows", spec.id, rows);
                env.ctx
                    .progress
                    .set_query_totals(&spec.id, rows, (rows as usize).div_ceil(batch))?;
            }
            Err(e) => warn!("{}: row estimate failed: {}", spec.id, e),
        }
    }
    Ok(())
}

/// Fetch and delete for every `delete_before_insert` query, referencing
/// tables first. Tables in a reference cycle get their constraints disabled
/// for the run.
async fn ordered_delete(
    env: &QueryEnv<'_>,
    working: &[&QuerySpec],
    in_tx: bool,
) -> Result<DeletePhase> {
    let mut phase = DeletePhase::default();
    let candidates: Vec<(&QuerySpec, TableName)> = working
        .iter()
        .filter(|q| q.delete_before_insert)
        .map(|q| TableName::parse(&q.target_table).map(|t| (*q, t)))
        .collect::<Result<_>>()?;

    let mut tables: Vec<TableName> = Vec::new();
    for (_, table) in &candidates {
        if !tables.iter().any(|t| t.key() == table.key()) {
            tables.push(table.clone());
        }
    }

    let order = resolve_order(env.databases, &tables, false).await?;
    let target = env.databases.target()?;
    if order.has_circular_reference {
        let names: Vec<String> = order.circular_tables.iter().map(|t| t.to_string()).collect();
        warn!(
            "Circular foreign keys between {}, constraints disabled until the data is loaded",
            names.join(", ")
        );
        disable_constraints(target.as_ref(), default_handle(target.as_ref()), &order.circular_tables)
            .await?;
        phase.circular = order.circular_tables.clone();
    }

    'tables: for table in order.deletion_order() {
        for (spec, _) in candidates.iter().filter(|(_, t)| t.key() == table.key()) {
            if env.cancel.is_cancelled() {
                phase.cancelled = true;
                break 'tables;
            }
            let start = Instant::now();
            match delete_ahead(env, spec).await {
                Ok(prefetched) => {
                    phase.prefetched.insert(spec.id.clone(), prefetched);
                }
                Err(e) => {
                    error!("{}: {}", spec.id, e);
                    env.ctx.progress.fail_query(&spec.id, &e)?;
                    phase.failed.push(QueryResult::failed(
                        &spec.id,
                        &spec.target_table,
                        e.to_string(),
                        start.elapsed().as_secs_f64(),
                    ));
                    if in_tx {
                        phase.aborted = true;
                        break 'tables;
                    }
                }
            }
        }
    }
    Ok(phase)
}

async fn delete_ahead(env: &QueryEnv<'_>, spec: &QuerySpec) -> Result<Prefetched> {
    env.ctx.progress.start_query(&spec.id)?;
    let prepared = env.prepare(spec).await?;
    let rows = env.fetch(spec, &prepared).await?;

    let target = env.databases.target()?;
    let outcome = ChunkedDeleter::new(
        target.as_ref(),
        &env.ctx.metadata,
        default_handle(target.as_ref()),
    )
    .delete_matching(&spec.id, &prepared.table, &spec.identity_columns, &rows)
    .await?;
    env.ctx.progress.record_delete(&spec.id, outcome.rows_deleted)?;

    Ok(Prefetched {
        rows,
        deleted: outcome.rows_deleted,
    })
}

/// Roll back the run transaction after an error that stopped the run.
async fn abandon_transaction(target: &dyn Database, ctx: &RunContext, err: &MigrateError) {
    match target.rollback().await {
        Ok(()) => warn!("Rolled back run transaction on {} after: {}", target.name(), err),
        Err(e) => warn!("Rollback on {} failed: {}", target.name(), e),
    }
    record_quietly(ctx.progress.record_error(err));
}

/// Commit, or roll back and revise the results of queries whose rows were
/// discarded with the transaction.
async fn finish_transaction(
    target: &dyn Database,
    ctx: &RunContext,
    mut outcome: RunOutcome,
    discard: bool,
) -> Result<RunOutcome> {
    if !discard {
        if let Err(e) = target.commit().await {
            abandon_transaction(target, ctx, &e).await;
            return Err(e);
        }
        info!("Committed run transaction on {}", target.name());
        for result in outcome.results.iter().filter(|r| r.status == QueryStatus::Completed) {
            ctx.progress.complete_query(&result.query_id)?;
        }
        return Ok(outcome);
    }

    if let Err(e) = target.rollback().await {
        warn!("Rollback on {} failed: {}", target.name(), e);
    }
    warn!("Rolled back run transaction on {}", target.name());

    let aborted = outcome.aborted;
    for result in outcome
        .results
        .iter_mut()
        .filter(|r| r.status == QueryStatus::Completed)
    {
        if aborted {
            let err = MigrateError::query(&result.query_id, "rolled back with the run transaction");
            ctx.progress.fail_query(&result.query_id, &err)?;
            result.status = QueryStatus::Failed;
            result.error = Some(err.to_string());
        } else {
            result.status = QueryStatus::Pending;
            result.error = Some("rolled back, will run again on resume".to_string());
        }
    }
    Ok(outcome)
}
