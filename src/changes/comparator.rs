// src/changes/comparator.rs

//! Branch divergence, conflict detection, and merge.
//!
//! Two branches are compared by change id over their link tables.
//! Planning is side-effect-free: the candidate changes are replayed
//! against the target's schema snapshot to prove they are legal
//! before anything mutates. Applying holds the target's maintenance
//! lock end-to-end and replays plan entries through the change
//! applier.

use crate::changes::applier::ChangeApplier;
use crate::changes::Change;
use crate::config::MAIN;
use crate::engine::EngineCtx;
use crate::error::{Error, Result};
use crate::maintenance::MaintenanceLock;
use crate::metadata::models::BranchRecord;
use crate::schema::SchemaSnapshot;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Two changes touching the same schema entity on both sides of a
/// divergence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    /// `table:<name>` or `column:<table>.<column>` style key
    pub entity: String,
    pub source_change_id: String,
    pub target_change_id: String,
}

/// Ordered set of changes a merge would replay onto the target
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub changes: Vec<Change>,
    pub fast_forward: bool,
}

/// Result of a merge execution (or dry run)
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub plan: MergePlan,
    pub applied: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct ChangeComparator {
    ctx: Arc<EngineCtx>,
    database: String,
}

/// Conflict-detection key for a change: table-level for tables,
/// `table.column`-level for column changes.
fn entity_key(change: &Change) -> String {
    format!("{}:{}", change.entity_type.as_str(), change.entity_name)
}

fn sort_chronologically(changes: &mut [Change]) {
    changes.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

impl ChangeComparator {
    pub(crate) fn new(ctx: Arc<EngineCtx>, database: &str) -> Self {
        Self {
            ctx,
            database: database.to_string(),
        }
    }

    fn branch(&self, name: &str) -> Result<BranchRecord> {
        let conn = self.ctx.meta.conn();
        let db = crate::branch::resolve_database(&conn, &self.database)?;
        crate::branch::resolve_branch(&conn, &db, name)
    }

    fn branch_changes(&self, branch_id: &str) -> Result<Vec<Change>> {
        let conn = self.ctx.meta.conn();
        Change::list_for_branch(&conn, branch_id)
    }

    /// Changes present on only one side, each sorted chronologically
    pub fn divergent(&self, source: &str, target: &str) -> Result<(Vec<Change>, Vec<Change>)> {
        let source_branch = self.branch(source)?;
        let target_branch = self.branch(target)?;

        let source_changes = self.branch_changes(&source_branch.id)?;
        let target_changes = self.branch_changes(&target_branch.id)?;

        let source_ids: HashSet<&str> = source_changes.iter().map(|c| c.id.as_str()).collect();
        let target_ids: HashSet<&str> = target_changes.iter().map(|c| c.id.as_str()).collect();

        let mut source_only: Vec<Change> = source_changes
            .iter()
            .filter(|c| !target_ids.contains(c.id.as_str()))
            .cloned()
            .collect();
        let mut target_only: Vec<Change> = target_changes
            .iter()
            .filter(|c| !source_ids.contains(c.id.as_str()))
            .cloned()
            .collect();

        sort_chronologically(&mut source_only);
        sort_chronologically(&mut target_only);
        Ok((source_only, target_only))
    }

    /// Most recent change present in both histories
    pub fn common_ancestor(&self, source: &str, target: &str) -> Result<Option<String>> {
        let source_branch = self.branch(source)?;
        let target_branch = self.branch(target)?;

        let source_changes = self.branch_changes(&source_branch.id)?;
        let target_ids: HashSet<String> = self
            .branch_changes(&target_branch.id)?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let mut common: Vec<Change> = source_changes
            .into_iter()
            .filter(|c| target_ids.contains(&c.id))
            .collect();
        sort_chronologically(&mut common);
        Ok(common.last().map(|c| c.id.clone()))
    }

    /// True when the target has no changes the source lacks and the
    /// source has something new to offer
    pub fn can_fast_forward(&self, source: &str, target: &str) -> Result<bool> {
        let (source_only, target_only) = self.divergent(source, target)?;
        Ok(target_only.is_empty() && !source_only.is_empty())
    }

    /// Alias for [`divergent`](Self::divergent), matching the engine
    /// API's `compare` operation
    pub fn compare(&self, source: &str, target: &str) -> Result<(Vec<Change>, Vec<Change>)> {
        self.divergent(source, target)
    }

    /// Whether an unforced merge would be accepted
    pub fn can_merge(&self, source: &str, target: &str) -> Result<bool> {
        match self.merge_plan(source, target, false) {
            Ok(_) => Ok(true),
            Err(Error::MergeConflict { .. }) | Err(Error::MergeRefused(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Scan the divergent sets for operations on the same entity
    pub fn detect_conflicts(&self, source: &str, target: &str) -> Result<Vec<MergeConflict>> {
        let (source_only, target_only) = self.divergent(source, target)?;

        let mut conflicts = Vec::new();
        for source_change in &source_only {
            let key = entity_key(source_change);
            for target_change in &target_only {
                if entity_key(target_change) == key {
                    conflicts.push(MergeConflict {
                        entity: key.clone(),
                        source_change_id: source_change.id.clone(),
                        target_change_id: target_change.id.clone(),
                    });
                    break;
                }
            }
        }
        Ok(conflicts)
    }

    /// Build (without side effects) the ordered list of changes a
    /// merge would replay. Refuses conflicted merges and
    /// non-fast-forward merges into `main` unless forced.
    pub fn merge_plan(&self, source: &str, target: &str, force: bool) -> Result<MergePlan> {
        let (source_only, target_only) = self.divergent(source, target)?;

        if !force {
            let conflicts = self.detect_conflicts(source, target)?;
            if !conflicts.is_empty() {
                return Err(Error::MergeConflict {
                    conflicts: conflicts
                        .iter()
                        .map(|c| format!("both branches modified {}", c.entity))
                        .collect(),
                });
            }
        }

        let fast_forward = target_only.is_empty();
        if !fast_forward && target == MAIN && !force {
            return Err(Error::MergeRefused(format!(
                "'{target}' has {} change(s) '{source}' lacks; merge the other way first or force",
                target_only.len()
            )));
        }

        // Prove each candidate replays cleanly on the target schema
        let target_branch = self.branch(target)?;
        let target_changes = self.branch_changes(&target_branch.id)?;
        let mut snapshot = SchemaSnapshot::from_changes(target_changes.iter())?;
        for change in &source_only {
            snapshot.apply_change(change).map_err(|e| Error::MergeConflict {
                conflicts: vec![format!(
                    "change {} ({} {}) is not applicable to '{target}': {e}",
                    change.id,
                    change.change_type.as_str(),
                    change.entity_name
                )],
            })?;
        }

        debug!(
            "Merge plan {source} -> {target}: {} change(s), fast_forward={fast_forward}",
            source_only.len()
        );
        Ok(MergePlan {
            changes: source_only,
            fast_forward,
        })
    }

    /// Execute (or dry-run) a merge of `source` into `target`.
    pub fn merge(&self, source: &str, target: &str, dry_run: bool) -> Result<MergeOutcome> {
        let plan = self.merge_plan(source, target, false)?;
        self.execute(source, target, plan, dry_run)
    }

    /// Merge into `main` with the strict policy: non-fast-forward
    /// replays require the explicit `force` flag.
    pub fn merge_into_main(&self, source: &str, force: bool) -> Result<MergeOutcome> {
        let plan = self.merge_plan(source, MAIN, force)?;
        self.execute(source, MAIN, plan, false)
    }

    fn execute(
        &self,
        source: &str,
        target: &str,
        plan: MergePlan,
        dry_run: bool,
    ) -> Result<MergeOutcome> {
        if dry_run || plan.changes.is_empty() {
            return Ok(MergeOutcome {
                applied: 0,
                dry_run,
                plan,
            });
        }

        let source_branch = self.branch(source)?;
        let target_branch = self.branch(target)?;

        let lock = MaintenanceLock::acquire(
            &self.ctx.meta,
            &target_branch.id,
            target,
            "merging branches",
        )?;

        {
            let conn = self.ctx.meta.conn();
            for change in &plan.changes {
                let order = Change::next_order(&conn, &target_branch.id)?;
                Change::link(
                    &conn,
                    &target_branch.id,
                    &change.id,
                    false,
                    order,
                    Some(&source_branch.id),
                )?;
            }
        }

        let applier = ChangeApplier::new(
            self.ctx.clone(),
            &self.database,
            target,
            &target_branch.id,
        );
        let applied = applier.apply_unapplied_locked()?;
        lock.release()?;

        info!(
            "Merged {} change(s) from {}/{} into {}/{}",
            applied, self.database, source, self.database, target
        );
        Ok(MergeOutcome {
            applied,
            dry_run: false,
            plan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchManager;
    use crate::engine::test_support::materialized_ctx;
    use crate::schema::table::TableManager;
    use crate::schema::{Column, ColumnType};

    fn setup() -> (tempfile::TempDir, Arc<EngineCtx>, ChangeComparator) {
        let (temp, ctx) = materialized_ctx();
        TableManager::new(ctx.clone(), "app", "main")
            .create("users", vec![Column::new("name", ColumnType::Text)], None)
            .unwrap();
        let comparator = ChangeComparator::new(ctx.clone(), "app");
        (temp, ctx, comparator)
    }

    #[test]
    fn test_fork_and_diverge_then_fast_forward() {
        let (_temp, ctx, comparator) = setup();

        BranchManager::new(ctx.clone(), "app").create("main", "feat").unwrap();
        TableManager::new(ctx.clone(), "app", "feat")
            .create("posts", vec![Column::new("title", ColumnType::Text)], None)
            .unwrap();

        let (source_only, target_only) = comparator.divergent("feat", "main").unwrap();
        assert_eq!(source_only.len(), 1);
        assert_eq!(source_only[0].entity_name, "posts");
        assert!(target_only.is_empty());

        assert!(comparator.can_fast_forward("feat", "main").unwrap());
        assert!(!comparator.can_fast_forward("main", "feat").unwrap());

        let outcome = comparator.merge("feat", "main", false).unwrap();
        assert!(outcome.plan.fast_forward);
        assert_eq!(outcome.applied, 1);

        // main now has users and posts in its template
        let empty = crate::paths::tenant_db_path(&ctx.root, "app", "main", "__empty__");
        let conn = rusqlite::Connection::open(&empty).unwrap();
        for table in ["users", "posts"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "main missing {table}");
        }

        // Replaying the same merge is a no-op
        let again = comparator.merge("feat", "main", false).unwrap();
        assert_eq!(again.applied, 0);
    }

    #[test]
    fn test_common_ancestor() {
        let (_temp, ctx, comparator) = setup();

        let branches = BranchManager::new(ctx.clone(), "app");
        branches.create("main", "feat").unwrap();

        // The shared CREATE users change is the ancestor
        let ancestor = comparator.common_ancestor("feat", "main").unwrap();
        assert!(ancestor.is_some());

        TableManager::new(ctx.clone(), "app", "feat")
            .create("posts", vec![], None)
            .unwrap();
        let after = comparator.common_ancestor("feat", "main").unwrap();
        assert_eq!(ancestor, after);
    }

    #[test]
    fn test_conflicting_forks_refused_without_force() {
        let (_temp, ctx, comparator) = setup();

        let branches = BranchManager::new(ctx.clone(), "app");
        branches.create("main", "f1").unwrap();
        branches.create("main", "f2").unwrap();

        TableManager::new(ctx.clone(), "app", "f1")
            .create("orders", vec![Column::new("total", ColumnType::Real)], None)
            .unwrap();
        TableManager::new(ctx.clone(), "app", "f2")
            .create("orders", vec![Column::new("note", ColumnType::Text)], None)
            .unwrap();

        let conflicts = comparator.detect_conflicts("f1", "f2").unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].entity, "table:orders");

        assert!(matches!(
            comparator.merge("f1", "f2", false),
            Err(Error::MergeConflict { .. })
        ));
    }

    #[test]
    fn test_non_fast_forward_into_main_refused() {
        let (_temp, ctx, comparator) = setup();

        let branches = BranchManager::new(ctx.clone(), "app");
        branches.create("main", "feat").unwrap();

        // Both sides advance on distinct entities
        TableManager::new(ctx.clone(), "app", "feat")
            .create("posts", vec![], None)
            .unwrap();
        TableManager::new(ctx.clone(), "app", "main")
            .create("audits", vec![], None)
            .unwrap();

        assert!(!comparator.can_fast_forward("feat", "main").unwrap());
        assert!(matches!(
            comparator.merge_into_main("feat", false),
            Err(Error::MergeRefused(_))
        ));

        // Forced replay goes through
        let outcome = comparator.merge_into_main("feat", true).unwrap();
        assert_eq!(outcome.applied, 1);

        // Non-FF into a non-main branch is allowed without force
        TableManager::new(ctx.clone(), "app", "main")
            .create("extra", vec![], None)
            .unwrap();
        let outcome = comparator.merge("main", "feat", false).unwrap();
        assert!(outcome.applied >= 1);
    }

    #[test]
    fn test_dry_run_has_no_side_effects() {
        let (_temp, ctx, comparator) = setup();

        let branches = BranchManager::new(ctx.clone(), "app");
        branches.create("main", "feat").unwrap();
        TableManager::new(ctx.clone(), "app", "feat")
            .create("posts", vec![], None)
            .unwrap();

        let outcome = comparator.merge("feat", "main", true).unwrap();
        assert!(outcome.dry_run);
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.plan.changes.len(), 1);

        // Target untouched: posts still only on feat
        let (source_only, _) = comparator.divergent("feat", "main").unwrap();
        assert_eq!(source_only.len(), 1);
    }

    #[test]
    fn test_copy_then_merge_new_changes_only() {
        let (_temp, ctx, comparator) = setup();

        // Fork carries the full history; merging right away is a no-op
        BranchManager::new(ctx.clone(), "app").create("main", "feat").unwrap();
        let outcome = comparator.merge("feat", "main", false).unwrap();
        assert_eq!(outcome.applied, 0);
        assert!(outcome.plan.changes.is_empty());
    }
}
