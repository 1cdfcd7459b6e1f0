//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{MigrateError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

impl Config {
    /// Load a plan file. `.json` files are parsed as JSON, everything else as
    /// YAML. `source_file` and `script_file` references are resolved relative
    /// to the plan file's directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Config(format!("cannot read plan file {}: {}", path.display(), e))
        })?;

        let mut config: Config = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => serde_json::from_str(&content)
                .map_err(|e| MigrateError::Config(format!("invalid JSON plan: {}", e)))?,
            _ => serde_yaml::from_str(&content)?,
        };

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_files(base)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string. File references resolve
    /// against the current directory.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(yaml)?;
        config.resolve_files(Path::new("."))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 of the serialized plan. Connection settings are excluded so a
    /// rotated password does not invalidate a resumable run.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(&self.plan).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Look up a database by logical name: `source`, `target` or a key of
    /// `databases`.
    pub fn database(&self, name: &str) -> Option<&DatabaseConfig> {
        if name.eq_ignore_ascii_case(SOURCE) {
            Some(&self.source)
        } else if name.eq_ignore_ascii_case(TARGET) {
            Some(&self.target)
        } else {
            self.databases.get(name)
        }
    }

    /// Every logical database name, source and target first.
    pub fn database_names(&self) -> Vec<String> {
        let mut names = vec![SOURCE.to_string(), TARGET.to_string()];
        names.extend(self.databases.keys().cloned());
        names
    }

    /// Inline the contents of `source_file` / `script_file` references.
    fn resolve_files(&mut self, base: &Path) -> Result<()> {
        for query in &mut self.plan.queries {
            if let Some(ref file) = query.source_file {
                if query.source_query.is_none() {
                    query.source_query = Some(read_sql_file(base, file)?);
                }
            }
            for group in [&mut query.pre_process, &mut query.post_process]
                .into_iter()
                .flatten()
            {
                resolve_group(base, group)?;
            }
        }
        for group in self
            .plan
            .pre_process
            .iter_mut()
            .chain(self.plan.post_process.iter_mut())
        {
            resolve_group(base, group)?;
        }
        Ok(())
    }
}

fn resolve_group(base: &Path, group: &mut ProcessGroup) -> Result<()> {
    if let Some(ref file) = group.script_file {
        if group.script.is_none() {
            group.script = Some(read_sql_file(base, file)?);
        }
    }
    Ok(())
}

fn read_sql_file(base: &Path, file: &Path) -> Result<String> {
    let full: PathBuf = if file.is_absolute() {
        file.to_path_buf()
    } else {
        base.join(file)
    };
    debug!("Reading SQL from {}", full.display());
    std::fs::read_to_string(&full).map_err(|e| {
        MigrateError::Config(format!("cannot read SQL file {}: {}", full.display(), e))
    })
}

impl DatabaseConfig {
    /// Normalized `encrypt` flag.
    pub fn encrypt_enabled(&self) -> bool {
        !matches!(
            self.encrypt.to_lowercase().as_str(),
            "false" | "no" | "0" | "disable"
        )
    }

    /// Identity of the physical database, used to reject source == target.
    pub fn same_database(&self, other: &DatabaseConfig) -> bool {
        self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
            && self.database.eq_ignore_ascii_case(&other.database)
    }
}
