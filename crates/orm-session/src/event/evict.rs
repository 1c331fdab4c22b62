//! Evict: detach an instance from the session.

use crate::Session;
use crate::cascade::{CascadeContext, CascadePoint, CascadingAction};
use crate::key::EntityKey;
use orm_core::{EntityHandle, EntityPersister, PropertyValue, Result};
use std::sync::Arc;

impl Session {
    /// Remove an instance, its collections and its proxy from the session.
    ///
    /// Pending changes to the instance are no longer flushed. Evicting an
    /// instance the session does not know is a no-op.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn evict(&mut self, entity: &EntityHandle) -> Result<()> {
        self.check_open()?;
        self.evict_internal(entity)
    }

    pub(crate) fn evict_internal(&mut self, entity: &EntityHandle) -> Result<()> {
        if entity.is_proxy() {
            let key = EntityKey::for_entity(&entity.metadata(), entity.id());
            self.pc.remove_proxy(&key);
            return match entity.implementation() {
                Some(target) => self.evict_instance(&target),
                None => {
                    tracing::trace!(key = %key, "Evicted uninitialized proxy");
                    Ok(())
                }
            };
        }
        self.evict_instance(entity)
    }

    fn evict_instance(&mut self, entity: &EntityHandle) -> Result<()> {
        let Some(entry) = self.pc.remove_entry(entity) else {
            tracing::trace!("Instance not associated with the session");
            return Ok(());
        };
        let persister = Arc::clone(entry.persister());
        let key = EntityKey::for_entity(persister.metadata(), entry.id().clone());
        self.pc.remove_entity(&key);
        self.pc.remove_proxy(&key);
        tracing::debug!(entity = %entry.entity_name(), id = %entry.id(), "Evicting instance");

        self.evict_collections(entity, &persister)?;
        self.cascade(
            CascadingAction::Evict,
            CascadePoint::AfterEvict,
            &persister,
            entity,
            &mut CascadeContext::new(),
        )
    }

    /// Detach every collection an instance references.
    pub(crate) fn evict_collections(
        &mut self,
        entity: &EntityHandle,
        persister: &Arc<dyn EntityPersister>,
    ) -> Result<()> {
        for value in persister.get_property_values(entity)? {
            if let PropertyValue::Collection(Some(collection)) = value {
                if self.pc.remove_collection_entry(&collection).is_some() {
                    tracing::trace!(role = %collection.role(), "Evicted collection");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{account, fixture, persist_committed, player, team};
    use orm_core::{Element, Value};

    #[test]
    fn test_evicted_changes_are_not_flushed() {
        let fx = fixture();
        let a = account(&fx, "ada");
        persist_committed(&fx, &a);

        let mut session = fx.factory.open_session();
        let loaded = session.get("Account", a.id()).unwrap().unwrap();
        loaded.set("owner", Value::from("bob")).unwrap();
        session.evict(&loaded).unwrap();
        assert!(!session.contains(&loaded));
        session.flush().unwrap();
        assert_eq!(fx.db.count("update"), 0);

        let again = session.get("Account", a.id()).unwrap().unwrap();
        assert!(!again.ptr_eq(&loaded));
    }

    #[test]
    fn test_evict_cascades_to_collection_elements() {
        let fx = fixture();
        let t = team(&fx, 1, "Reds");
        t.collection("players")
            .unwrap()
            .unwrap()
            .add(Element::Entity(player(&fx, 10, "Ann")))
            .unwrap();
        persist_committed(&fx, &t);

        let mut session = fx.factory.open_session();
        let loaded = session.get("Team", 1).unwrap().unwrap();
        let players = loaded.collection("players").unwrap().unwrap();
        session.initialize_collection(&players).unwrap();
        let ann = players.loaded_elements()[0].as_entity().unwrap().clone();
        let ann = session.initialize_proxy(&ann).unwrap();
        assert!(session.contains(&ann));

        session.evict(&loaded).unwrap();
        assert!(!session.contains(&ann));
        assert_eq!(session.persistence_context().collection_count(), 0);
    }

    #[test]
    fn test_evict_unknown_instance_is_a_no_op() {
        let fx = fixture();
        let mut session = fx.factory.open_session();
        session.evict(&team(&fx, 1, "Reds")).unwrap();
    }

    #[test]
    fn test_evict_proxy() {
        let fx = fixture();
        let t = team(&fx, 1, "Reds");
        persist_committed(&fx, &t);

        let mut session = fx.factory.open_session();
        let proxy = session.load("Team", 1).unwrap();
        session.evict(&proxy).unwrap();
        assert!(!session.persistence_context().contains_proxy(&proxy));
    }
}
