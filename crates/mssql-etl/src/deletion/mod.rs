//! Target-side deletion: foreign-key ordering and PK-chunked deletes.

mod chunked;
mod order;

pub use chunked::{ChunkedDeleter, DeleteOutcome, MAX_PARAMETERS};
pub use order::{order_tables, resolve_order, DependencyOrder};

use crate::core::TableName;
use crate::db::{ConnectionHandle, Database};
use crate::error::Result;
use tracing::{info, warn};

/// Disable FK checks on tables caught in a reference cycle.
pub async fn disable_constraints(
    db: &dyn Database,
    handle: ConnectionHandle,
    tables: &[TableName],
) -> Result<()> {
    for table in tables {
        let sql = format!("ALTER TABLE {} NOCHECK CONSTRAINT ALL", table.quoted()?);
        db.execute(handle, &sql, &[]).await?;
        info!("Constraints disabled on {}", table);
    }
    Ok(())
}

/// Re-enable and re-validate FK checks. Failures are logged, not returned:
/// the data is already written and the constraint stays untrusted.
pub async fn enable_constraints(db: &dyn Database, handle: ConnectionHandle, tables: &[TableName]) {
    for table in tables {
        let sql = match table.quoted() {
            Ok(q) => format!("ALTER TABLE {} WITH CHECK CHECK CONSTRAINT ALL", q),
            Err(e) => {
                warn!("Cannot re-enable constraints on {}: {}", table, e);
                continue;
            }
        };
        match db.execute(handle, &sql, &[]).await {
            Ok(_) => info!("Constraints re-enabled on {}", table),
            Err(e) => warn!("Re-enabling constraints on {} failed: {}", table, e),
        }
    }
}
