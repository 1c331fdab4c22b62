//! Lock: reattach without writing, and upgrade row locks.

use crate::Session;
use crate::action::BeforeCompletion;
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction};
use crate::entry::Status;
use crate::event::update::Reattach;
use orm_core::{CacheKey, EntityHandle, EntityPersister, Error, LockMode, Result, SoftLockGuard};
use std::sync::Arc;

impl Session {
    /// Obtain `mode` on an instance, reattaching it first when detached.
    ///
    /// Lock modes only ever go up: requesting a mode no stronger than the
    /// one held does nothing.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn lock(&mut self, entity: &EntityHandle, mode: LockMode) -> Result<()> {
        self.check_open()?;
        self.lock_internal(entity, mode)
    }

    pub(crate) fn lock_internal(&mut self, entity: &EntityHandle, mode: LockMode) -> Result<()> {
        if mode == LockMode::Write {
            return Err(Error::Usage("invalid lock mode for lock(): WRITE".to_string()));
        }
        let entity = if entity.is_uninitialized() {
            self.initialize_proxy(entity)?
        } else {
            self.pc.unproxy_and_reassociate(entity)
        };

        if !self.pc.is_entry_for(&entity) {
            let persister = self.persister_for(&entity)?;
            if self.is_transient(&entity, Some(false))? {
                return Err(Error::TransientObject(format!(
                    "cannot lock an unsaved transient instance: {}",
                    persister.entity_name()
                )));
            }
            let id = persister.get_identifier(&entity);
            self.reassociate(&entity, &persister, id, Reattach::Lock, true)?;
            self.cascade(
                CascadingAction::Lock(mode),
                CascadePoint::AfterLock,
                &persister,
                &entity,
                &mut CascadeContext::new(),
            )?;
        }
        self.upgrade_lock(&entity, mode)
    }

    /// Raise the lock held on a managed instance to `requested`.
    ///
    /// When the instance is cached, the item is soft-locked around the
    /// database work so no other session reads a stale copy meanwhile.
    pub(crate) fn upgrade_lock(&mut self, entity: &EntityHandle, requested: LockMode) -> Result<()> {
        let Some(entry) = self.pc.get_entry(entity).cloned() else {
            return Err(Error::TransientObject(format!(
                "instance was not associated with this session: {entity:?}"
            )));
        };
        if !requested.greater_than(entry.lock_mode()) {
            return Ok(());
        }
        if entry.status() != Status::Managed {
            return Err(Error::object_deleted(
                entry.entity_name(),
                entry.id(),
                "attempted to lock a deleted instance",
            ));
        }
        let persister = Arc::clone(entry.persister());
        tracing::debug!(
            entity = %entry.entity_name(),
            id = %entry.id(),
            from = ?entry.lock_mode(),
            to = ?requested,
            "Upgrading lock"
        );

        let guard = match self.factory.entity_cache(persister.as_ref()) {
            Some(cache) => Some(SoftLockGuard::acquire(
                cache,
                CacheKey::entity(persister.metadata().root_name(), entry.id().clone()),
                entry.version(),
            )?),
            None => None,
        };

        self.apply_lock(entity, &persister, requested)
            .inspect_err(|e| {
                if e.is_optimistic_failure() {
                    self.factory.statistics().optimistic_failure();
                }
            })?;
        match guard {
            Some(guard) => guard.release(),
            None => Ok(()),
        }
    }

    fn apply_lock(
        &mut self,
        entity: &EntityHandle,
        persister: &Arc<dyn EntityPersister>,
        requested: LockMode,
    ) -> Result<()> {
        let Some(entry) = self.pc.get_entry_mut(entity) else {
            return Ok(());
        };
        let id = entry.id().clone();
        let version = entry.version().clone();
        match requested {
            LockMode::Optimistic | LockMode::OptimisticForceIncrement => {
                if !persister.is_versioned() {
                    return Err(Error::Usage(format!(
                        "{} is not versioned; optimistic lock modes need a version",
                        persister.entity_name()
                    )));
                }
                entry.set_lock_mode(requested);
                let process = if requested == LockMode::Optimistic {
                    BeforeCompletion::VerifyVersion {
                        entity: entity.clone(),
                    }
                } else {
                    BeforeCompletion::IncrementVersion {
                        entity: entity.clone(),
                    }
                };
                self.action_queue.register_before_completion(process);
            }
            mode if mode.increments_immediately() && persister.is_versioned() => {
                let next = persister.force_version_increment(&id, &version)?;
                entry.force_locked(entity, next);
                entry.set_lock_mode(mode);
            }
            mode => {
                persister.lock(&id, &version, mode)?;
                entry.set_lock_mode(mode);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{account, fixture, persist_committed};
    use orm_core::Value;

    #[test]
    fn test_write_mode_is_rejected() {
        let fx = fixture();
        let mut session = fx.factory.open_session();
        let err = session.lock(&account(&fx, "ada"), LockMode::Write).unwrap_err();
        assert!(err.is_usage_error());
    }

    #[test]
    fn test_transient_instance_cannot_be_locked() {
        let fx = fixture();
        let mut session = fx.factory.open_session();
        let err = session.lock(&account(&fx, "ada"), LockMode::None).unwrap_err();
        assert!(matches!(err, Error::TransientObject(_)));
    }

    #[test]
    fn test_lock_none_reattaches_without_writing() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);
        fx.db.clear_log();

        let mut session = fx.factory.open_session();
        session.lock(&a, LockMode::None).unwrap();
        assert!(session.contains(&a));
        session.flush().unwrap();
        assert_eq!(fx.db.count("update"), 0);
        assert_eq!(fx.db.count("lock"), 0);
    }

    #[test]
    fn test_upgrade_is_monotonic_and_soft_locked() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);

        let mut session = fx.factory.open_session();
        let loaded = session.get("Account", a.id()).unwrap().unwrap();
        fx.db.clear_log();
        let before = fx.accounts.counters();

        session.lock(&loaded, LockMode::PessimisticWrite).unwrap();
        session.lock(&loaded, LockMode::PessimisticRead).unwrap();
        session.lock(&loaded, LockMode::PessimisticWrite).unwrap();

        let after = fx.accounts.counters();
        assert_eq!(after.locks - before.locks, 1);
        assert_eq!(after.unlocks - before.unlocks, 1);
        assert_eq!(fx.db.count("lock"), 1);
        assert_eq!(
            session.get_current_lock_mode(&loaded).unwrap(),
            LockMode::PessimisticWrite
        );
    }

    #[test]
    fn test_force_increments_version() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);

        let mut session = fx.factory.open_session();
        let loaded = session.get("Account", a.id()).unwrap().unwrap();
        session.lock(&loaded, LockMode::Force).unwrap();
        assert_eq!(loaded.version(), Value::BigInt(1));
        assert_eq!(fx.db.count("increment-version"), 1);
    }

    #[test]
    fn test_optimistic_lock_verifies_at_commit() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);

        let mut session = fx.factory.open_session();
        let loaded = session.get("Account", a.id()).unwrap().unwrap();
        session.lock(&loaded, LockMode::Optimistic).unwrap();
        assert_eq!(session.action_queue().completion_process_count().0, 1);

        fx.db.set_version("Account", &a.id(), Value::BigInt(9));
        let err = session.commit().unwrap_err();
        assert!(err.is_optimistic_failure());
    }

    #[test]
    fn test_deleted_instance_cannot_be_locked() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);

        let mut session = fx.factory.open_session();
        let loaded = session.get("Account", a.id()).unwrap().unwrap();
        session.delete(&loaded).unwrap();
        let err = session.lock(&loaded, LockMode::PessimisticWrite).unwrap_err();
        assert!(matches!(err, Error::ObjectDeleted(_)));
    }
}
