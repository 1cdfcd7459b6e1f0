//! Configuration validation.

use super::{Config, DatabaseConfig, ExtractionType, ProcessGroup};
use crate::error::{MigrateError, Result};
use std::collections::HashSet;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_database("source", &config.source)?;
    validate_database("target", &config.target)?;
    for (name, db) in &config.databases {
        if name.eq_ignore_ascii_case("source") || name.eq_ignore_ascii_case("target") {
            return Err(MigrateError::Config(format!(
                "databases.{} shadows a built-in database name",
                name
            )));
        }
        validate_database(&format!("databases.{}", name), db)?;
    }

    // Cannot migrate to the same database
    if config.source.same_database(&config.target) {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    if config.settings.default_batch_size == 0 {
        return Err(MigrateError::Config(
            "settings.default_batch_size must be at least 1".into(),
        ));
    }
    if config.settings.max_connections == 0 {
        return Err(MigrateError::Config(
            "settings.max_connections must be at least 1".into(),
        ));
    }
    if config.settings.save_interval_secs == 0 {
        return Err(MigrateError::Config(
            "settings.save_interval_secs must be at least 1".into(),
        ));
    }

    let plan = &config.plan;
    if plan.queries.is_empty() {
        return Err(MigrateError::Config("plan has no queries".into()));
    }

    let mut names = HashSet::new();
    for name in plan.variables.keys() {
        if !names.insert(name.to_lowercase()) {
            return Err(MigrateError::Config(format!("duplicate variable name '{}'", name)));
        }
    }

    let mut ids = HashSet::new();
    for var in &plan.dynamic_variables {
        if !ids.insert(var.id.as_str()) {
            return Err(MigrateError::Config(format!(
                "duplicate dynamic variable id '{}'",
                var.id
            )));
        }
        if var.name.trim().is_empty() {
            return Err(MigrateError::Config(format!(
                "dynamic variable '{}' has no name",
                var.id
            )));
        }
        if !names.insert(var.name.to_lowercase()) {
            return Err(MigrateError::Config(format!("duplicate variable name '{}'", var.name)));
        }
        if var.query.trim().is_empty() {
            return Err(MigrateError::Config(format!(
                "dynamic variable '{}' has an empty query",
                var.id
            )));
        }
        check_database(config, &var.database, &format!("dynamic variable '{}'", var.id))?;
        if var.extraction_type == Some(ExtractionType::SingleColumn) && var.column.is_none() {
            return Err(MigrateError::Config(format!(
                "dynamic variable '{}' uses single_column but names no column",
                var.id
            )));
        }
    }

    let mut query_ids = HashSet::new();
    for query in &plan.queries {
        if query.id.trim().is_empty() {
            return Err(MigrateError::Config("query with empty id".into()));
        }
        if !query_ids.insert(query.id.as_str()) {
            return Err(MigrateError::Config(format!("duplicate query id '{}'", query.id)));
        }
        if query.target_table.trim().is_empty() {
            return Err(MigrateError::Config(format!(
                "query '{}' has no target_table",
                query.id
            )));
        }
        if query.source_text().trim().is_empty() {
            return Err(MigrateError::Config(format!(
                "query '{}' has no source_query or source_file",
                query.id
            )));
        }
        if let Some(0) = query.batch_size {
            return Err(MigrateError::Config(format!(
                "query '{}': batch_size must be at least 1",
                query.id
            )));
        }
        if query.delete_before_insert && query.identity_columns.is_empty() {
            return Err(MigrateError::Config(format!(
                "query '{}': delete_before_insert requires identity_columns",
                query.id
            )));
        }
        check_database(config, &query.source_database, &format!("query '{}'", query.id))?;
        for group in query.pre_process.iter().chain(query.post_process.iter()) {
            check_group(config, group)?;
        }
    }

    let mut group_ids = HashSet::new();
    for group in plan.pre_process.iter().chain(plan.post_process.iter()) {
        if !group_ids.insert(group.id.as_str()) {
            return Err(MigrateError::Config(format!(
                "duplicate process group id '{}'",
                group.id
            )));
        }
        check_group(config, group)?;
    }

    Ok(())
}

fn validate_database(label: &str, db: &DatabaseConfig) -> Result<()> {
    if db.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", label)));
    }
    if db.database.is_empty() {
        return Err(MigrateError::Config(format!("{}.database is required", label)));
    }
    if db.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", label)));
    }
    Ok(())
}

fn check_database(config: &Config, name: &str, owner: &str) -> Result<()> {
    if config.database(name).is_none() {
        return Err(MigrateError::Config(format!(
            "{} references unknown database '{}'",
            owner, name
        )));
    }
    Ok(())
}

fn check_group(config: &Config, group: &ProcessGroup) -> Result<()> {
    if group.enabled && group.script_text().trim().is_empty() {
        return Err(MigrateError::Config(format!(
            "process group '{}' has no script or script_file",
            group.id
        )));
    }
    check_database(config, group.database_name(), &format!("process group '{}'", group.id))
}
