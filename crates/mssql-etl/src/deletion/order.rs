//! Foreign-key dependency ordering of tables.
//!
//! Edges run from a referenced table to the table referencing it, so the
//! resulting order never puts a table before one it depends on. Deleting in
//! reverse of that order removes referencing rows first. ON DELETE CASCADE
//! relations add no edge; the database removes those rows itself.

use crate::core::TableName;
use crate::db::{DatabaseSet, ForeignKeyRelation, ReferentialAction};
use crate::error::Result;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// Tables in dependency order plus any cycle that prevented a full sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyOrder {
    /// Referenced tables before the tables that reference them. Tables
    /// caught in a cycle are appended in input order.
    pub order: Vec<TableName>,
    pub has_circular_reference: bool,
    pub circular_tables: Vec<TableName>,
}

impl DependencyOrder {
    /// Order in which rows can be deleted: referencing tables first.
    pub fn deletion_order(&self) -> Vec<TableName> {
        self.order.iter().rev().cloned().collect()
    }
}

/// Fetch live FK metadata from the source or target database and order
/// `tables` by it.
pub async fn resolve_order(
    databases: &DatabaseSet,
    tables: &[TableName],
    is_source: bool,
) -> Result<DependencyOrder> {
    let db = if is_source {
        databases.source()?
    } else {
        databases.target()?
    };
    let relations = db.foreign_keys().await?;
    debug!(
        "{}: ordering {} tables against {} foreign key columns",
        db.name(),
        tables.len(),
        relations.len()
    );
    Ok(order_tables(tables, &relations))
}

/// Kahn's algorithm over the tables; ties resolve in input order.
pub fn order_tables(tables: &[TableName], relations: &[ForeignKeyRelation]) -> DependencyOrder {
    let mut nodes: Vec<TableName> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for table in tables {
        let key = table.key();
        if !index.contains_key(&key) {
            index.insert(key, nodes.len());
            nodes.push(table.clone());
        }
    }

    let n = nodes.len();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree = vec![0usize; n];
    let mut edges = HashSet::new();

    for rel in relations {
        if rel.on_delete == ReferentialAction::Cascade {
            continue;
        }
        let (Some(&from), Some(&to)) = (
            index.get(&rel.referenced_table.key()),
            index.get(&rel.parent_table.key()),
        ) else {
            continue;
        };
        if from == to || !edges.insert((from, to)) {
            continue;
        }
        dependents[from].push(to);
        in_degree[to] += 1;
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(n);
    let mut placed = vec![false; n];

    while let Some(i) = ready.pop_first() {
        sorted.push(i);
        placed[i] = true;
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    let circular: Vec<usize> = (0..n).filter(|&i| !placed[i]).collect();
    if !circular.is_empty() {
        warn!(
            "Circular foreign key references between: {}",
            circular
                .iter()
                .map(|&i| nodes[i].to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    DependencyOrder {
        order: sorted
            .iter()
            .chain(circular.iter())
            .map(|&i| nodes[i].clone())
            .collect(),
        has_circular_reference: !circular.is_empty(),
        circular_tables: circular.iter().map(|&i| nodes[i].clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakeDatabase;
    use crate::db::Database;
    use std::sync::Arc;

    fn t(name: &str) -> TableName {
        TableName::parse(name).unwrap()
    }

    fn fk(parent: &str, referenced: &str, on_delete: ReferentialAction) -> ForeignKeyRelation {
        ForeignKeyRelation {
            parent_table: t(parent),
            parent_column: "ref_id".into(),
            referenced_table: t(referenced),
            referenced_column: "id".into(),
            on_delete,
        }
    }

    fn names(tables: &[TableName]) -> Vec<String> {
        tables.iter().map(|t| t.name.clone()).collect()
    }

    #[test]
    fn test_chain_orders_referenced_first() {
        // A references B, B references C
        let rels = vec![
            fk("A", "B", ReferentialAction::NoAction),
            fk("B", "C", ReferentialAction::NoAction),
        ];
        let order = order_tables(&[t("A"), t("B"), t("C")], &rels);
        assert_eq!(names(&order.order), vec!["C", "B", "A"]);
        assert_eq!(names(&order.deletion_order()), vec!["A", "B", "C"]);
        assert!(!order.has_circular_reference);
    }

    #[test]
    fn test_cycle_is_reported_and_appended() {
        let rels = vec![
            fk("A", "B", ReferentialAction::NoAction),
            fk("B", "A", ReferentialAction::NoAction),
        ];
        let order = order_tables(&[t("A"), t("B"), t("C")], &rels);
        assert!(order.has_circular_reference);
        assert_eq!(names(&order.circular_tables), vec!["A", "B"]);
        assert_eq!(names(&order.order), vec!["C", "A", "B"]);
    }

    #[test]
    fn test_cascade_and_self_references_add_no_edges() {
        let rels = vec![
            fk("A", "B", ReferentialAction::Cascade),
            fk("B", "B", ReferentialAction::NoAction),
        ];
        let order = order_tables(&[t("A"), t("B")], &rels);
        assert_eq!(names(&order.order), vec!["A", "B"]);
        assert!(!order.has_circular_reference);
    }

    #[test]
    fn test_names_match_across_spellings() {
        let rels = vec![fk("dbo.Orders", "dbo.Customers", ReferentialAction::NoAction)];
        let order = order_tables(&[t("[ORDERS]"), t("customers")], &rels);
        assert_eq!(names(&order.order), vec!["customers", "ORDERS"]);
    }

    #[test]
    fn test_relations_outside_the_set_are_ignored() {
        let rels = vec![
            fk("A", "Z", ReferentialAction::NoAction),
            fk("A", "B", ReferentialAction::NoAction),
            fk("A", "B", ReferentialAction::NoAction),
        ];
        let order = order_tables(&[t("A"), t("B"), t("A")], &rels);
        assert_eq!(names(&order.order), vec!["B", "A"]);
    }

    #[tokio::test]
    async fn test_resolve_order_uses_chosen_database() {
        let source = Arc::new(FakeDatabase::new("source"));
        let target = Arc::new(FakeDatabase::new("target"));
        target.add_foreign_key("A", "B", ReferentialAction::NoAction);
        let set = DatabaseSet::from_databases([
            source as Arc<dyn Database>,
            target as Arc<dyn Database>,
        ]);

        let from_target = resolve_order(&set, &[t("A"), t("B")], false).await.unwrap();
        assert_eq!(names(&from_target.order), vec!["B", "A"]);
        let from_source = resolve_order(&set, &[t("A"), t("B")], true).await.unwrap();
        assert_eq!(names(&from_source.order), vec!["A", "B"]);
    }
}
