//! Replicate: copy an instance from another datastore, keeping its identifier.

use crate::Session;
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction};
use crate::entry::Status;
use crate::event::ReplicationMode;
use crate::key::EntityKey;
use orm_core::{EntityHandle, EntityPersister, Error, LockMode, Result, Value};
use std::sync::Arc;

impl Session {
    /// Make the state of a detached instance persistent under its current
    /// identifier. `mode` decides what happens when the row already exists.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn replicate(&mut self, entity: &EntityHandle, mode: ReplicationMode) -> Result<()> {
        self.check_open()?;
        self.replicate_internal(entity, mode)
    }

    pub(crate) fn replicate_internal(
        &mut self,
        entity: &EntityHandle,
        mode: ReplicationMode,
    ) -> Result<()> {
        if self.pc.reassociate_if_uninitialized_proxy(entity) {
            tracing::trace!("Uninitialized proxy passed to replicate");
            return Ok(());
        }
        let entity = self.pc.unproxy_and_reassociate(entity);
        if self.pc.is_entry_for(&entity) {
            tracing::trace!("Instance already associated with the session");
            return Ok(());
        }

        let persister = self.persister_for(&entity)?;
        let id = persister.get_identifier(&entity);
        if id.is_null() {
            return Err(Error::TransientObject(format!(
                "cannot replicate object with null identifier: {}",
                persister.entity_name()
            )));
        }

        let existing = persister.load(&id, LockMode::None)?;
        let Some(row) = existing else {
            return self.replicate_as_insert(&entity, &persister, id, mode);
        };
        let replaced = mode.should_overwrite_current_version(
            persister.entity_name(),
            &id,
            &row.version,
            &persister.get_version(&entity),
            persister.version_type(),
        )?;
        if !replaced {
            tracing::debug!(entity = %persister.entity_name(), id = %id, "Existing row kept");
            return Ok(());
        }
        tracing::debug!(entity = %persister.entity_name(), id = %id, "Replicating over existing row");
        self.perform_replication(&entity, &persister, id, row.version, mode)
    }

    fn replicate_as_insert(
        &mut self,
        entity: &EntityHandle,
        persister: &Arc<dyn EntityPersister>,
        id: Value,
        mode: ReplicationMode,
    ) -> Result<()> {
        tracing::debug!(entity = %persister.entity_name(), id = %id, "No row found; inserting");
        let requested = if persister.metadata().uses_identity() {
            None
        } else {
            Some(id)
        };
        self.save_transient(
            entity,
            requested,
            CascadingAction::Replicate(mode),
            &mut CascadeContext::new(),
        )
        .map(drop)
    }

    /// Reattach an instance whose row exists so the next flush writes its
    /// state over the row without touching the version.
    fn perform_replication(
        &mut self,
        entity: &EntityHandle,
        persister: &Arc<dyn EntityPersister>,
        id: Value,
        previous_version: Value,
        mode: ReplicationMode,
    ) -> Result<()> {
        let mut ctx = CascadeContext::new();
        self.cascade(
            CascadingAction::Replicate(mode),
            CascadePoint::BeforeInsertAfterDelete,
            persister,
            entity,
            &mut ctx,
        )?;
        let key = EntityKey::for_entity(persister.metadata(), id);
        self.pc.check_uniqueness(&key, entity)?;
        let status = if persister.metadata().mutable {
            Status::Managed
        } else {
            Status::ReadOnly
        };
        self.pc.add_entity_with_entry(
            entity,
            key,
            status,
            None,
            previous_version,
            LockMode::None,
            true,
            Arc::clone(persister),
            true,
        );
        self.cascade(
            CascadingAction::Replicate(mode),
            CascadePoint::AfterInsertBeforeDelete,
            persister,
            entity,
            &mut ctx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{account, fixture, persist_committed, team};

    #[test]
    fn test_replicate_missing_row_inserts_with_same_id() {
        let fx = fixture();
        let mut session = fx.factory.open_session();
        let t = team(&fx, 5, "Reds");
        session.replicate(&t, ReplicationMode::Exception).unwrap();
        session.flush().unwrap();
        assert!(fx.db.row("Team", &Value::BigInt(5)).is_some());
    }

    #[test]
    fn test_exception_mode_rejects_existing_row() {
        let fx = fixture();
        let t = team(&fx, 5, "Reds");
        persist_committed(&fx, &t);

        let mut session = fx.factory.open_session();
        let err = session
            .replicate(&team(&fx, 5, "Blues"), ReplicationMode::Exception)
            .unwrap_err();
        assert!(matches!(err, Error::NonUniqueObject(_)));
    }

    #[test]
    fn test_overwrite_replaces_row_keeping_version() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);
        fx.db.clear_log();

        let copy = account(&fx, "bob");
        copy.set_id(a.id());
        copy.set_version(Value::BigInt(7));

        let mut session = fx.factory.open_session();
        session.replicate(&copy, ReplicationMode::Overwrite).unwrap();
        session.flush().unwrap();
        assert_eq!(fx.db.count("update"), 1);
        assert_eq!(copy.version(), Value::BigInt(7));
        assert_eq!(copy.value("owner").unwrap(), Value::from("bob"));
    }

    #[test]
    fn test_ignore_mode_keeps_existing_row() {
        let fx = fixture();
        let t = team(&fx, 5, "Reds");
        persist_committed(&fx, &t);
        fx.db.clear_log();

        let mut session = fx.factory.open_session();
        let copy = team(&fx, 5, "Blues");
        session.replicate(&copy, ReplicationMode::Ignore).unwrap();
        assert!(!session.contains(&copy));
        session.flush().unwrap();
        assert_eq!(fx.db.count("update"), 0);
    }

    #[test]
    fn test_latest_version_skips_older_copy() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);
        fx.db.set_version("Account", &a.id(), Value::BigInt(3));

        let copy = account(&fx, "bob");
        copy.set_id(a.id());
        copy.set_version(Value::BigInt(1));

        let mut session = fx.factory.open_session();
        session
            .replicate(&copy, ReplicationMode::LatestVersion)
            .unwrap();
        assert!(!session.contains(&copy));
    }
}
