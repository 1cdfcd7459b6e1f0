//! Multi-statement script processing for pre/post-processing groups.
//!
//! A script goes through substitution, INSERT...SELECT alignment, comment
//! stripping and statement splitting, then runs one statement at a time.

mod align;
mod lexer;
mod validate;

pub use align::align_insert_selects;
pub use lexer::{mask_literals, split_statements, strip_comments};
pub use validate::validate_single_select;

use crate::config::ProcessGroup;
use crate::db::{default_handle, ConnectionHandle, DatabaseSet, MetadataCache};
use crate::error::{MigrateError, Result};
use crate::variables::VariableStore;
use tracing::{debug, error, info, warn};

/// What happens when a statement fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Log, count and keep going.
    Continue,
    /// Stop at the first failure with a `ScriptStatement` error.
    Fatal,
}

/// Result of running one process group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub statements: usize,
    pub executed: usize,
    pub failed: usize,
    pub rows_affected: u64,
    pub errors: Vec<String>,
}

/// Runs process groups against the run's databases.
pub struct ScriptProcessor<'a> {
    databases: &'a DatabaseSet,
    metadata: &'a MetadataCache,
}

impl<'a> ScriptProcessor<'a> {
    pub fn new(databases: &'a DatabaseSet, metadata: &'a MetadataCache) -> Self {
        Self {
            databases,
            metadata,
        }
    }

    /// Run one group. Disabled groups do nothing.
    pub async fn run_group(
        &self,
        group: &ProcessGroup,
        variables: &VariableStore,
        mode: FailureMode,
    ) -> Result<ScriptOutcome> {
        if !group.enabled {
            debug!("Process group {} is disabled", group.id);
            return Ok(ScriptOutcome::default());
        }

        let db = self.databases.get(group.database_name())?;

        let substituted = variables.substitute(group.script_text());
        if !substituted.is_complete() {
            warn!(
                "Process group {}: unresolved placeholders {}",
                group.id,
                substituted.unresolved.join(", ")
            );
        }
        let (aligned, rewritten) =
            align_insert_selects(&substituted.sql, db.as_ref(), self.metadata).await;
        if rewritten > 0 {
            debug!("Process group {}: {} INSERT column lists aligned", group.id, rewritten);
        }
        let statements = split_statements(&strip_comments(&aligned));

        let reserved = if group.session {
            db.begin_session().await?
        } else {
            false
        };
        let handle = if group.session {
            ConnectionHandle::Session
        } else {
            default_handle(db.as_ref())
        };

        let mut outcome = ScriptOutcome {
            statements: statements.len(),
            ..Default::default()
        };
        info!(
            "Process group {} ({}): {} statement(s) on {}",
            group.id,
            group.description,
            statements.len(),
            db.name()
        );

        let mut fatal = None;
        for (i, stmt) in statements.iter().enumerate() {
            match db.execute(handle, stmt, &[]).await {
                Ok(rows) => {
                    outcome.executed += 1;
                    outcome.rows_affected += rows;
                    debug!("{} statement {}: {} rows", group.id, i + 1, rows);
                }
                Err(e) => {
                    outcome.failed += 1;
                    let message = format!("statement {}: {}", i + 1, e);
                    error!("Process group {} {}", group.id, message);
                    outcome.errors.push(message);
                    if mode == FailureMode::Fatal {
                        fatal = Some(MigrateError::ScriptStatement {
                            group: group.id.clone(),
                            index: i + 1,
                            message: e.to_string(),
                        });
                        break;
                    }
                }
            }
        }

        if reserved {
            db.end_session().await?;
        }
        if let Some(err) = fatal {
            return Err(err);
        }

        info!(
            "Process group {}: {} executed, {} failed, {} rows affected",
            group.id, outcome.executed, outcome.failed, outcome.rows_affected
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::{FakeDatabase, FakeResponse};
    use crate::db::Database;
    use std::sync::Arc;

    fn group(script: &str) -> ProcessGroup {
        ProcessGroup {
            id: "g1".into(),
            description: "test".into(),
            enabled: true,
            script: Some(script.into()),
            script_file: None,
            database: None,
            session: false,
        }
    }

    fn setup() -> (Arc<FakeDatabase>, DatabaseSet) {
        let target = Arc::new(FakeDatabase::new("target"));
        let set = DatabaseSet::from_databases([target.clone() as Arc<dyn Database>]);
        (target, set)
    }

    #[tokio::test]
    async fn test_runs_statements_in_order_with_substitution() {
        let (target, set) = setup();
        target.on("update", FakeResponse::Affected(3));
        let cache = MetadataCache::new();
        let mut vars = VariableStore::new();
        vars.set_static(
            "flag",
            crate::variables::VariableValue::Scalar(crate::core::SqlValue::I64(1)),
        );

        let outcome = ScriptProcessor::new(&set, &cache)
            .run_group(
                &group("-- refresh flags\nUPDATE t SET f = ${flag};\nDELETE FROM log /* old */;"),
                &vars,
                FailureMode::Continue,
            )
            .await
            .unwrap();

        assert_eq!(target.statements(), vec!["UPDATE t SET f = 1", "DELETE FROM log"]);
        assert_eq!(outcome.executed, 2);
        assert_eq!(outcome.rows_affected, 3);
    }

    #[tokio::test]
    async fn test_continue_mode_tolerates_failures() {
        let (target, set) = setup();
        target.on("bad", FakeResponse::Fail("Invalid object name".into()));
        let cache = MetadataCache::new();

        let outcome = ScriptProcessor::new(&set, &cache)
            .run_group(
                &group("UPDATE bad SET x = 1; UPDATE good SET x = 1"),
                &VariableStore::new(),
                FailureMode::Continue,
            )
            .await
            .unwrap();
        assert_eq!((outcome.executed, outcome.failed), (1, 1));
        assert!(outcome.errors[0].contains("statement 1"));
    }

    #[tokio::test]
    async fn test_fatal_mode_stops_at_first_failure() {
        let (target, set) = setup();
        target.on("bad", FakeResponse::Fail("Invalid object name".into()));
        let cache = MetadataCache::new();

        let err = ScriptProcessor::new(&set, &cache)
            .run_group(
                &group("UPDATE a SET x = 1; UPDATE bad SET x = 1; UPDATE c SET x = 1"),
                &VariableStore::new(),
                FailureMode::Fatal,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::ScriptStatement { index: 2, .. }));
        assert_eq!(target.statements().len(), 2);
    }

    #[tokio::test]
    async fn test_session_group_uses_reserved_connection() {
        let (target, set) = setup();
        let cache = MetadataCache::new();
        let mut g = group("CREATE TABLE #ids (id int)\nGO\nINSERT INTO #ids VALUES (1)");
        g.session = true;

        ScriptProcessor::new(&set, &cache)
            .run_group(&g, &VariableStore::new(), FailureMode::Fatal)
            .await
            .unwrap();

        let recorded = target.recorded();
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|r| r.handle == ConnectionHandle::Session));
        assert!(!target.has_session());
    }

    #[tokio::test]
    async fn test_disabled_group_is_skipped() {
        let (target, set) = setup();
        let cache = MetadataCache::new();
        let mut g = group("UPDATE t SET x = 1");
        g.enabled = false;
        let outcome = ScriptProcessor::new(&set, &cache)
            .run_group(&g, &VariableStore::new(), FailureMode::Fatal)
            .await
            .unwrap();
        assert_eq!(outcome, ScriptOutcome::default());
        assert!(target.statements().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_database_is_config_error() {
        let (_, set) = setup();
        let cache = MetadataCache::new();
        let mut g = group("SELECT 1");
        g.database = Some("archive".into());
        let err = ScriptProcessor::new(&set, &cache)
            .run_group(&g, &VariableStore::new(), FailureMode::Continue)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }
}
