//! Ordered queue of pending writes.
//!
//! Actions run in a fixed order that keeps foreign keys valid:
//!
//! 1. orphan removals
//! 2. insertions (in dependency order)
//! 3. updates
//! 4. collection removals
//! 5. collection updates
//! 6. collection creations
//! 7. deletions

use crate::action::{
    AfterCompletion, BeforeCompletion, CollectionAction, CollectionActionKind,
    EntityDeleteAction, EntityInsertAction, EntityUpdateAction, Executable, ExecutionContext,
};
use crate::factory::SessionFactory;
use crate::persistence_context::PersistenceContext;
use orm_core::{EntityHandle, Result};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// Number of queued actions per list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub orphan_removals: usize,
    pub insertions: usize,
    pub updates: usize,
    pub collection_removals: usize,
    pub collection_updates: usize,
    pub collection_creations: usize,
    pub deletions: usize,
}

impl QueueCounts {
    /// Sum of all lists.
    pub fn total(&self) -> usize {
        self.orphan_removals
            + self.insertions
            + self.updates
            + self.collection_removals
            + self.collection_updates
            + self.collection_creations
            + self.deletions
    }
}

/// Pending database writes of one session.
#[derive(Default)]
pub struct ActionQueue {
    orphan_removals: Vec<EntityDeleteAction>,
    insertions: Vec<EntityInsertAction>,
    updates: Vec<EntityUpdateAction>,
    collection_removals: Vec<CollectionAction>,
    collection_updates: Vec<CollectionAction>,
    collection_creations: Vec<CollectionAction>,
    deletions: Vec<EntityDeleteAction>,
    before_completion: Vec<BeforeCompletion>,
    after_completion: Vec<AfterCompletion>,
    order_inserts: bool,
    order_updates: bool,
}

impl ActionQueue {
    /// Create an empty queue.
    pub fn new(order_inserts: bool, order_updates: bool) -> Self {
        Self {
            order_inserts,
            order_updates,
            ..Self::default()
        }
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    pub(crate) fn add_insert(&mut self, action: EntityInsertAction) {
        tracing::trace!(entity = %action.entity_name(), id = %action.id(), "Queueing insert");
        self.insertions.push(action);
    }

    /// Queue an update. An update already queued for the same instance,
    /// left behind by a failed flush, is replaced rather than duplicated.
    pub(crate) fn add_update(&mut self, action: EntityUpdateAction) {
        if let Some(queued) = self.updates.iter_mut().find(|a| a.entity().ptr_eq(action.entity())) {
            tracing::trace!(entity = %action.entity_name(), id = %action.id(), "Replacing queued update");
            *queued = action;
            return;
        }
        tracing::trace!(entity = %action.entity_name(), id = %action.id(), "Queueing update");
        self.updates.push(action);
    }

    pub(crate) fn add_delete(&mut self, action: EntityDeleteAction) {
        tracing::trace!(
            entity = %action.entity_name(),
            id = %action.id(),
            orphan = action.is_orphan_removal(),
            "Queueing delete"
        );
        if action.is_orphan_removal() {
            self.orphan_removals.push(action);
        } else {
            self.deletions.push(action);
        }
    }

    /// Queue a collection write, replacing a queued one of the same kind
    /// for the same role and key.
    pub(crate) fn add_collection_action(&mut self, action: CollectionAction) {
        let list = match action.kind() {
            CollectionActionKind::Recreate => &mut self.collection_creations,
            CollectionActionKind::Remove => &mut self.collection_removals,
            CollectionActionKind::Update => &mut self.collection_updates,
        };
        if let Some(queued) = list
            .iter_mut()
            .find(|a| a.role() == action.role() && a.key() == action.key())
        {
            tracing::trace!(role = %action.role(), kind = ?action.kind(), "Replacing queued collection action");
            *queued = action;
            return;
        }
        tracing::trace!(role = %action.role(), kind = ?action.kind(), "Queueing collection action");
        list.push(action);
    }

    pub(crate) fn register_before_completion(&mut self, process: BeforeCompletion) {
        self.before_completion.push(process);
    }

    /// Drop a scheduled deletion of `entity`. Returns whether one was queued.
    pub fn un_schedule_deletion(&mut self, entity: &EntityHandle) -> bool {
        let before = self.deletions.len() + self.orphan_removals.len();
        self.deletions.retain(|a| !a.entity().ptr_eq(entity));
        self.orphan_removals.retain(|a| !a.entity().ptr_eq(entity));
        before != self.deletions.len() + self.orphan_removals.len()
    }

    /// Drop a scheduled insertion of `entity`.
    pub(crate) fn un_schedule_insertion(&mut self, entity: &EntityHandle) -> Option<EntityInsertAction> {
        let index = self.insertions.iter().position(|a| a.entity().ptr_eq(entity))?;
        Some(self.insertions.remove(index))
    }

    /// Is an insertion of `entity` queued?
    pub fn has_queued_insertion(&self, entity: &EntityHandle) -> bool {
        self.insertions.iter().any(|a| a.entity().ptr_eq(entity))
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Per-list counts.
    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            orphan_removals: self.orphan_removals.len(),
            insertions: self.insertions.len(),
            updates: self.updates.len(),
            collection_removals: self.collection_removals.len(),
            collection_updates: self.collection_updates.len(),
            collection_creations: self.collection_creations.len(),
            deletions: self.deletions.len(),
        }
    }

    /// Number of queued insertions.
    pub fn insertions_count(&self) -> usize {
        self.insertions.len()
    }

    /// Number of queued updates.
    pub fn updates_count(&self) -> usize {
        self.updates.len()
    }

    /// Number of queued deletions, orphan removals included.
    pub fn deletions_count(&self) -> usize {
        self.deletions.len() + self.orphan_removals.len()
    }

    /// Number of queued collection removals.
    pub fn collection_removals_count(&self) -> usize {
        self.collection_removals.len()
    }

    /// Number of queued collection updates.
    pub fn collection_updates_count(&self) -> usize {
        self.collection_updates.len()
    }

    /// Number of queued collection creations.
    pub fn collection_creations_count(&self) -> usize {
        self.collection_creations.len()
    }

    /// Is anything queued?
    pub fn has_any_queued_actions(&self) -> bool {
        self.counts().total() > 0
    }

    /// Are inserts or deletes queued?
    pub fn are_insertions_or_deletions_queued(&self) -> bool {
        !self.insertions.is_empty() || !self.deletions.is_empty() || !self.orphan_removals.is_empty()
    }

    /// Would executing the queue write any of `spaces` (entity names or roles)?
    pub fn are_tables_to_be_updated(&self, spaces: &[&str]) -> bool {
        spaces.iter().any(|space| {
            self.orphan_removals.iter().any(|a| a.affects(space))
                || self.insertions.iter().any(|a| a.affects(space))
                || self.updates.iter().any(|a| a.affects(space))
                || self.collection_removals.iter().any(|a| a.affects(space))
                || self.collection_updates.iter().any(|a| a.affects(space))
                || self.collection_creations.iter().any(|a| a.affects(space))
                || self.deletions.iter().any(|a| a.affects(space))
        })
    }

    /// Pending transaction-completion processes.
    pub fn completion_process_count(&self) -> (usize, usize) {
        (self.before_completion.len(), self.after_completion.len())
    }

    /// Undo the actions a flush-needed check scheduled.
    ///
    /// `previous` holds the counts taken before the check; updates and
    /// collection writes queued earlier survive.
    pub fn clear_from_flush_needed_check(&mut self, previous: QueueCounts) {
        self.updates.truncate(previous.updates);
        self.collection_removals.truncate(previous.collection_removals);
        self.collection_updates.truncate(previous.collection_updates);
        self.collection_creations.truncate(previous.collection_creations);
    }

    /// Forget every queued action.
    pub fn clear(&mut self) {
        self.orphan_removals.clear();
        self.insertions.clear();
        self.updates.clear();
        self.collection_removals.clear();
        self.collection_updates.clear();
        self.collection_creations.clear();
        self.deletions.clear();
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Execute every queued action in order.
    ///
    /// On failure the failed action and everything after it stay queued.
    pub(crate) fn execute_actions(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        if self.order_inserts {
            self.insertions = InsertActionSorter::sort(std::mem::take(&mut self.insertions));
        }
        if self.order_updates {
            self.updates.sort_by(compare_updates);
        }
        let total = self.counts().total();
        execute_list(&mut self.orphan_removals, ctx, &mut self.after_completion)?;
        execute_list(&mut self.insertions, ctx, &mut self.after_completion)?;
        execute_list(&mut self.updates, ctx, &mut self.after_completion)?;
        execute_list(&mut self.collection_removals, ctx, &mut self.after_completion)?;
        execute_list(&mut self.collection_updates, ctx, &mut self.after_completion)?;
        execute_list(&mut self.collection_creations, ctx, &mut self.after_completion)?;
        execute_list(&mut self.deletions, ctx, &mut self.after_completion)?;
        tracing::debug!(count = total, "Executed queued actions");
        Ok(())
    }

    /// Execute queued insertions only.
    pub(crate) fn execute_inserts(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        execute_list(&mut self.insertions, ctx, &mut self.after_completion)
    }

    /// Execute one insert right away instead of queueing it.
    pub(crate) fn execute_insert_now(
        &mut self,
        mut action: EntityInsertAction,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<()> {
        if let Some(process) = action.execute(ctx)? {
            self.after_completion.push(process);
        }
        Ok(())
    }

    /// Run version checks and forced increments registered by lock requests.
    pub(crate) fn before_transaction_completion(
        &mut self,
        pc: &mut PersistenceContext,
        factory: &SessionFactory,
    ) -> Result<()> {
        for process in std::mem::take(&mut self.before_completion) {
            process.run(pc, factory)?;
        }
        Ok(())
    }

    /// Finish cache work. Failures are logged: the transaction is already over.
    pub(crate) fn after_transaction_completion(&mut self, success: bool, factory: &SessionFactory) {
        self.before_completion.clear();
        let processes = std::mem::take(&mut self.after_completion);
        tracing::debug!(count = processes.len(), success, "Running after-completion processes");
        for process in processes {
            if let Err(e) = process.run(success, factory) {
                tracing::warn!(error = %e, "After-completion process failed");
            }
        }
    }
}

fn execute_list<A: Executable>(
    list: &mut Vec<A>,
    ctx: &mut ExecutionContext<'_>,
    after_completion: &mut Vec<AfterCompletion>,
) -> Result<()> {
    let mut pending = std::mem::take(list).into_iter();
    while let Some(mut action) = pending.next() {
        match action.execute(ctx) {
            Ok(Some(process)) => after_completion.push(process),
            Ok(None) => {}
            Err(e) => {
                list.push(action);
                list.extend(pending);
                return Err(e);
            }
        }
    }
    Ok(())
}

fn compare_updates(a: &EntityUpdateAction, b: &EntityUpdateAction) -> Ordering {
    a.entity_name().cmp(b.entity_name()).then_with(|| {
        a.id()
            .compare_numeric(b.id())
            .unwrap_or_else(|| a.id().to_string().cmp(&b.id().to_string()))
    })
}

impl fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionQueue")
            .field("counts", &self.counts())
            .field("before_completion", &self.before_completion.len())
            .field("after_completion", &self.after_completion.len())
            .finish()
    }
}

// ============================================================================
// Insert ordering
// ============================================================================

/// Groups inserts of the same entity into contiguous batches while keeping
/// every row after the rows it references.
pub struct InsertActionSorter;

impl InsertActionSorter {
    /// Reorder `actions` into batches.
    pub fn sort(actions: Vec<EntityInsertAction>) -> Vec<EntityInsertAction> {
        let mut batches: Vec<Vec<EntityInsertAction>> = Vec::new();
        let mut latest_batch: HashMap<String, usize> = HashMap::new();
        let mut batch_of_entity: HashMap<usize, usize> = HashMap::new();

        for action in actions {
            let required = action
                .referenced_entities()
                .iter()
                .filter_map(|e| batch_of_entity.get(&e.object_id()).copied())
                .max();
            let batch = match latest_batch.get(action.entity_name()) {
                Some(&candidate) if required.is_none_or(|r| candidate > r) => candidate,
                _ => {
                    batches.push(Vec::new());
                    batches.len() - 1
                }
            };
            latest_batch.insert(action.entity_name().to_string(), batch);
            batch_of_entity.insert(action.entity().object_id(), batch);
            batches[batch].push(action);
        }

        tracing::trace!(batches = batches.len(), "Sorted insert actions");
        batches.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Status;
    use crate::key::EntityKey;
    use orm_core::{
        EntityMetadata, EntityPersister, IdGeneration, LockMode, PropertyMetadata, Value,
    };
    use orm_memory::{MemoryDatabase, MemoryEntityPersister};
    use std::sync::Arc;

    struct Fixture {
        db: Arc<MemoryDatabase>,
        factory: Arc<SessionFactory>,
        team: Arc<dyn EntityPersister>,
        player: Arc<dyn EntityPersister>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(MemoryDatabase::new());
        let team_meta = EntityMetadata::new("Team")
            .identifier("id", IdGeneration::Assigned)
            .property(PropertyMetadata::basic("name"))
            .build()
            .unwrap();
        let player_meta = EntityMetadata::new("Player")
            .identifier("id", IdGeneration::Assigned)
            .property(PropertyMetadata::basic("name"))
            .property(PropertyMetadata::many_to_one("team", "Team"))
            .build()
            .unwrap();
        let team: Arc<dyn EntityPersister> =
            Arc::new(MemoryEntityPersister::new(team_meta, Arc::clone(&db)));
        let player: Arc<dyn EntityPersister> =
            Arc::new(MemoryEntityPersister::new(player_meta, Arc::clone(&db)));
        let factory = SessionFactory::builder()
            .entity(Arc::clone(&team))
            .entity(Arc::clone(&player))
            .build()
            .unwrap();
        Fixture {
            db,
            factory,
            team,
            player,
        }
    }

    fn insert(
        pc: &mut PersistenceContext,
        persister: &Arc<dyn EntityPersister>,
        id: i64,
        state: Vec<orm_core::PropertyValue>,
    ) -> EntityInsertAction {
        let entity = EntityHandle::with_id(persister.metadata(), id);
        entity.set_state(state.clone()).unwrap();
        pc.add_entity_with_entry(
            &entity,
            EntityKey::for_entity(persister.metadata(), Value::BigInt(id)),
            Status::Saving,
            Some(state.clone()),
            Value::Null,
            LockMode::Write,
            false,
            Arc::clone(persister),
            false,
        );
        EntityInsertAction::new(entity, Value::BigInt(id), state, Value::Null, Arc::clone(persister))
    }

    #[test]
    fn test_sorter_batches_by_entity_respecting_references() {
        let f = fixture();
        let mut pc = PersistenceContext::default();
        let t1 = insert(&mut pc, &f.team, 1, vec![Value::from("A").into()]);
        let t1_handle = t1.entity().clone();
        let p1 = insert(
            &mut pc,
            &f.player,
            10,
            vec![Value::from("x").into(), (&t1_handle).into()],
        );
        let t2 = insert(&mut pc, &f.team, 2, vec![Value::from("B").into()]);
        let t2_handle = t2.entity().clone();
        let p2 = insert(
            &mut pc,
            &f.player,
            11,
            vec![Value::from("y").into(), (&t2_handle).into()],
        );

        let sorted = InsertActionSorter::sort(vec![t1, p1, t2, p2]);
        let order: Vec<(String, Value)> = sorted
            .iter()
            .map(|a| (a.entity_name().to_string(), a.id().clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("Team".to_string(), Value::BigInt(1)),
                ("Team".to_string(), Value::BigInt(2)),
                ("Player".to_string(), Value::BigInt(10)),
                ("Player".to_string(), Value::BigInt(11)),
            ]
        );
    }

    #[test]
    fn test_execute_runs_inserts_and_marks_entries() {
        let f = fixture();
        let mut pc = PersistenceContext::default();
        let mut queue = ActionQueue::new(false, false);
        let action = insert(&mut pc, &f.team, 1, vec![Value::from("A").into()]);
        let team = action.entity().clone();
        queue.add_insert(action);
        assert!(queue.are_insertions_or_deletions_queued());
        assert!(queue.are_tables_to_be_updated(&["Team"]));
        assert!(!queue.are_tables_to_be_updated(&["Player"]));

        let mut ctx = ExecutionContext {
            pc: &mut pc,
            factory: &f.factory,
            cache_mode: orm_core::CacheMode::Normal,
        };
        queue.execute_actions(&mut ctx).unwrap();
        assert!(!queue.has_any_queued_actions());
        assert_eq!(f.db.count("insert"), 1);
        let entry = pc.get_entry(&team).unwrap();
        assert_eq!(entry.status(), Status::Managed);
        assert!(entry.exists_in_database());
        assert!(pc.was_inserted_during_transaction("Team", &Value::BigInt(1)));
    }

    #[test]
    fn test_failed_action_stays_queued() {
        let f = fixture();
        let mut pc = PersistenceContext::default();
        let mut queue = ActionQueue::new(false, false);
        queue.add_insert(insert(&mut pc, &f.team, 1, vec![Value::from("A").into()]));
        queue.add_insert(insert(&mut pc, &f.team, 2, vec![Value::from("B").into()]));
        f.db.fail_on("insert", None);

        let mut ctx = ExecutionContext {
            pc: &mut pc,
            factory: &f.factory,
            cache_mode: orm_core::CacheMode::Normal,
        };
        assert!(queue.execute_actions(&mut ctx).is_err());
        assert_eq!(queue.insertions_count(), 2);

        f.db.clear_failures();
        queue.execute_inserts(&mut ctx).unwrap();
        assert_eq!(queue.insertions_count(), 0);
        assert_eq!(f.db.row_count("Team"), 2);
    }

    #[test]
    fn test_un_schedule_deletion() {
        let f = fixture();
        let mut queue = ActionQueue::default();
        let team = EntityHandle::with_id(f.team.metadata(), 1_i64);
        queue.add_delete(EntityDeleteAction::new(
            team.clone(),
            Value::BigInt(1),
            Value::Null,
            Arc::clone(&f.team),
            false,
        ));
        assert_eq!(queue.deletions_count(), 1);
        assert!(queue.un_schedule_deletion(&team));
        assert!(!queue.un_schedule_deletion(&team));
        assert!(!queue.has_any_queued_actions());
    }

    #[test]
    fn test_clear_from_flush_needed_check_keeps_earlier_actions() {
        let f = fixture();
        let mut queue = ActionQueue::default();
        let team = EntityHandle::with_id(f.team.metadata(), 1_i64);
        let team_handle = team.clone();
        queue.add_update(EntityUpdateAction::new(
            team.clone(),
            Value::BigInt(1),
            Vec::new(),
            vec![0],
            Value::Null,
            Value::Null,
            Arc::clone(&f.team),
        ));
        queue.add_insert(EntityInsertAction::new(
            team,
            Value::BigInt(1),
            Vec::new(),
            Value::Null,
            Arc::clone(&f.team),
        ));
        let before = queue.counts();
        queue.add_update(EntityUpdateAction::new(
            EntityHandle::with_id(f.team.metadata(), 2_i64),
            Value::BigInt(2),
            Vec::new(),
            vec![0],
            Value::Null,
            Value::Null,
            Arc::clone(&f.team),
        ));
        assert_eq!(queue.updates_count(), 2);

        queue.clear_from_flush_needed_check(before);
        assert_eq!(queue.counts(), before);
        assert!(queue.updates[0].entity().ptr_eq(&team_handle));
    }

    #[test]
    fn test_update_for_queued_instance_replaces_it() {
        let f = fixture();
        let mut queue = ActionQueue::default();
        let team = EntityHandle::with_id(f.team.metadata(), 1_i64);
        for dirty in [vec![0], vec![0, 1]] {
            queue.add_update(EntityUpdateAction::new(
                team.clone(),
                Value::BigInt(1),
                Vec::new(),
                dirty,
                Value::Null,
                Value::Null,
                Arc::clone(&f.team),
            ));
        }
        assert_eq!(queue.updates_count(), 1);
        assert_eq!(queue.updates[0].dirty_properties(), &[0, 1]);
    }

    #[test]
    fn test_update_ordering() {
        let f = fixture();
        let mut queue = ActionQueue::new(false, true);
        for (persister, id) in [(&f.team, 3), (&f.player, 1), (&f.team, 1)] {
            let entity = EntityHandle::with_id(persister.metadata(), id);
            queue.add_update(EntityUpdateAction::new(
                entity,
                Value::BigInt(id),
                Vec::new(),
                Vec::new(),
                Value::Null,
                Value::Null,
                Arc::clone(persister),
            ));
        }
        queue.updates.sort_by(compare_updates);
        let order: Vec<(&str, Value)> = queue
            .updates
            .iter()
            .map(|a| (a.entity_name(), a.id().clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("Player", Value::BigInt(1)),
                ("Team", Value::BigInt(1)),
                ("Team", Value::BigInt(3)),
            ]
        );
    }
}
