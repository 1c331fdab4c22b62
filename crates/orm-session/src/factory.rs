//! Session factory: persister registry, shared options and statistics.

use crate::Session;
use crate::config::{SessionConfig, SessionFactoryOptions};
use orm_core::{
    CollectionPersister, ElementKind, EntityPersister, Error, Interceptor, NoopInterceptor,
    PropertyKind, PropertyMetadata, RegionAccessStrategy, Result, Statistics,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Immutable registry of mappings shared by all sessions.
pub struct SessionFactory {
    options: SessionFactoryOptions,
    entity_persisters: HashMap<String, Arc<dyn EntityPersister>>,
    collection_persisters: HashMap<String, Arc<dyn CollectionPersister>>,
    statistics: Arc<Statistics>,
    interceptor: Arc<dyn Interceptor>,
}

impl SessionFactory {
    /// Start building a factory.
    pub fn builder() -> SessionFactoryBuilder {
        SessionFactoryBuilder::default()
    }

    /// Persister of an entity.
    pub fn entity_persister(&self, entity_name: &str) -> Result<Arc<dyn EntityPersister>> {
        self.entity_persisters
            .get(entity_name)
            .cloned()
            .ok_or_else(|| Error::Mapping(format!("unknown entity: {entity_name}")))
    }

    /// Persister of a collection role.
    pub fn collection_persister(&self, role: &str) -> Result<Arc<dyn CollectionPersister>> {
        self.collection_persisters
            .get(role)
            .cloned()
            .ok_or_else(|| Error::Mapping(format!("unknown collection role: {role}")))
    }

    /// Registered entity names, sorted.
    pub fn entity_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entity_persisters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Owner property that maps the collection `role`.
    pub fn collection_property(&self, role: &str) -> Option<PropertyMetadata> {
        let persister = self.collection_persisters.get(role)?;
        let owner = self.entity_persisters.get(&persister.metadata().owner)?;
        owner
            .metadata()
            .properties
            .iter()
            .find(|p| matches!(&p.kind, PropertyKind::Collection { role: r } if r == role))
            .cloned()
    }

    /// Does the owner mapping delete elements removed from `role`?
    pub fn is_orphan_delete(&self, role: &str) -> bool {
        self.collection_property(role)
            .is_some_and(|p| p.cascade.has_orphan_delete())
    }

    /// Cache access of an entity, when the second-level cache is enabled.
    pub(crate) fn entity_cache(
        &self,
        persister: &dyn EntityPersister,
    ) -> Option<Arc<dyn RegionAccessStrategy>> {
        if self.options.use_second_level_cache {
            persister.cache_access()
        } else {
            None
        }
    }

    /// Cache access of a collection role, when the second-level cache is enabled.
    pub(crate) fn collection_cache(
        &self,
        persister: &dyn CollectionPersister,
    ) -> Option<Arc<dyn RegionAccessStrategy>> {
        if self.options.use_second_level_cache {
            persister.cache_access()
        } else {
            None
        }
    }

    /// Shared statistics sink.
    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.statistics
    }

    /// Application hook.
    pub fn interceptor(&self) -> &Arc<dyn Interceptor> {
        &self.interceptor
    }

    /// Factory options.
    pub fn options(&self) -> &SessionFactoryOptions {
        &self.options
    }

    /// Open a session with the factory defaults.
    pub fn open_session(self: &Arc<Self>) -> Session {
        self.open_session_with(SessionConfig::from_options(&self.options))
    }

    /// Open a session with explicit settings.
    pub fn open_session_with(self: &Arc<Self>, config: SessionConfig) -> Session {
        self.statistics.session_opened();
        Session::new(Arc::clone(self), config)
    }

    /// Drop every cached item of an entity's region.
    pub fn evict_entity_region(&self, entity_name: &str) -> Result<()> {
        let persister = self.entity_persister(entity_name)?;
        if let Some(cache) = persister.cache_access() {
            tracing::debug!(entity = %entity_name, region = %cache.region_name(), "Evicting entity region");
            cache.evict_all()?;
        }
        Ok(())
    }

    /// Drop every cached item of a collection role's region.
    pub fn evict_collection_region(&self, role: &str) -> Result<()> {
        let persister = self.collection_persister(role)?;
        if let Some(cache) = persister.cache_access() {
            tracing::debug!(role = %role, region = %cache.region_name(), "Evicting collection region");
            cache.evict_all()?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("entities", &self.entity_persisters.len())
            .field("collections", &self.collection_persisters.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Collects persisters and settings, then validates the mapping.
#[derive(Default)]
pub struct SessionFactoryBuilder {
    options: SessionFactoryOptions,
    entity_persisters: Vec<Arc<dyn EntityPersister>>,
    collection_persisters: Vec<Arc<dyn CollectionPersister>>,
    interceptor: Option<Arc<dyn Interceptor>>,
}

impl SessionFactoryBuilder {
    /// Register an entity persister.
    #[must_use]
    pub fn entity(mut self, persister: Arc<dyn EntityPersister>) -> Self {
        self.entity_persisters.push(persister);
        self
    }

    /// Register a collection persister.
    #[must_use]
    pub fn collection(mut self, persister: Arc<dyn CollectionPersister>) -> Self {
        self.collection_persisters.push(persister);
        self
    }

    /// Replace the options.
    #[must_use]
    pub fn options(mut self, options: SessionFactoryOptions) -> Self {
        self.options = options;
        self
    }

    /// Install an interceptor.
    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Validate the mapping and build the factory.
    pub fn build(self) -> Result<Arc<SessionFactory>> {
        let mut entity_persisters: HashMap<String, Arc<dyn EntityPersister>> = HashMap::new();
        for persister in self.entity_persisters {
            let metadata = persister.metadata();
            metadata.validate()?;
            let name = metadata.name.clone();
            if entity_persisters.insert(name.clone(), persister).is_some() {
                return Err(Error::Mapping(format!("entity mapped twice: {name}")));
            }
        }

        let mut collection_persisters: HashMap<String, Arc<dyn CollectionPersister>> =
            HashMap::new();
        for persister in self.collection_persisters {
            let role = persister.metadata().role.clone();
            if collection_persisters.insert(role.clone(), persister).is_some() {
                return Err(Error::Mapping(format!("collection role mapped twice: {role}")));
            }
        }

        for persister in entity_persisters.values() {
            let metadata = persister.metadata();
            if !entity_persisters.contains_key(metadata.root_name()) {
                return Err(Error::Mapping(format!(
                    "{}: root entity {} is not mapped",
                    metadata.name,
                    metadata.root_name()
                )));
            }
            validate_properties(
                &metadata.name,
                &metadata.properties,
                &entity_persisters,
                &collection_persisters,
            )?;
        }

        for persister in collection_persisters.values() {
            let metadata = persister.metadata();
            if let ElementKind::Entity { target } = &metadata.element {
                let element = entity_persisters.get(target).ok_or_else(|| {
                    Error::Mapping(format!(
                        "{}: unknown element entity {target}",
                        metadata.role
                    ))
                })?;
                if let Some(mapped_by) = &metadata.mapped_by {
                    if element.metadata().property_index(mapped_by).is_none() {
                        return Err(Error::Mapping(format!(
                            "{}: element {target} has no property '{mapped_by}'",
                            metadata.role
                        )));
                    }
                }
            }
        }

        let statistics = Arc::new(Statistics::new(self.options.statistics_enabled));
        tracing::info!(
            entities = entity_persisters.len(),
            collections = collection_persisters.len(),
            "Session factory built"
        );
        Ok(Arc::new(SessionFactory {
            options: self.options,
            entity_persisters,
            collection_persisters,
            statistics,
            interceptor: self
                .interceptor
                .unwrap_or_else(|| Arc::new(NoopInterceptor)),
        }))
    }
}

fn validate_properties(
    entity: &str,
    properties: &[PropertyMetadata],
    entities: &HashMap<String, Arc<dyn EntityPersister>>,
    collections: &HashMap<String, Arc<dyn CollectionPersister>>,
) -> Result<()> {
    for property in properties {
        match &property.kind {
            PropertyKind::ManyToOne { target } | PropertyKind::OneToOne { target } => {
                if !entities.contains_key(target) {
                    return Err(Error::Mapping(format!(
                        "{entity}.{}: unknown target entity {target}",
                        property.name
                    )));
                }
            }
            PropertyKind::Collection { role } => {
                let persister = collections.get(role).ok_or_else(|| {
                    Error::Mapping(format!(
                        "{entity}.{}: unknown collection role {role}",
                        property.name
                    ))
                })?;
                let owner = &persister.metadata().owner;
                let owner_matches = entities
                    .get(entity)
                    .is_some_and(|p| p.metadata().is_instance_of(owner) || owner == entity);
                if !owner_matches {
                    return Err(Error::Mapping(format!(
                        "{entity}.{}: collection {role} is owned by {owner}",
                        property.name
                    )));
                }
            }
            PropertyKind::Component { properties: nested } => {
                validate_properties(entity, nested, entities, collections)?;
            }
            PropertyKind::Basic => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orm_core::{CascadeStyle, CollectionMetadata, EntityMetadata, IdGeneration};
    use orm_memory::{MemoryCollectionPersister, MemoryDatabase, MemoryEntityPersister};

    fn team_and_member() -> (Arc<EntityMetadata>, Arc<EntityMetadata>) {
        let team = EntityMetadata::new("Team")
            .identifier("id", IdGeneration::Assigned)
            .property(PropertyMetadata::basic("name"))
            .property(
                PropertyMetadata::collection("members", "Team.members")
                    .cascade(CascadeStyle::ALL_DELETE_ORPHAN),
            )
            .build()
            .unwrap();
        let member = EntityMetadata::new("Member")
            .identifier("id", IdGeneration::Assigned)
            .property(PropertyMetadata::many_to_one("team", "Team"))
            .build()
            .unwrap();
        (team, member)
    }

    #[test]
    fn test_build_and_lookup() {
        let db = Arc::new(MemoryDatabase::new());
        let (team, member) = team_and_member();
        let members = CollectionMetadata::entities("Team", "members", "Member")
            .build()
            .unwrap();
        let factory = SessionFactory::builder()
            .entity(Arc::new(MemoryEntityPersister::new(team, Arc::clone(&db))))
            .entity(Arc::new(MemoryEntityPersister::new(member, Arc::clone(&db))))
            .collection(Arc::new(MemoryCollectionPersister::new(members, Arc::clone(&db))))
            .build()
            .unwrap();

        assert_eq!(factory.entity_names(), vec!["Member", "Team"]);
        assert!(factory.entity_persister("Team").is_ok());
        assert!(matches!(
            factory.entity_persister("Nope"),
            Err(Error::Mapping(_))
        ));
        assert!(factory.is_orphan_delete("Team.members"));
        assert_eq!(
            factory.collection_property("Team.members").unwrap().name,
            "members"
        );
    }

    #[test]
    fn test_unknown_targets_are_rejected() {
        let db = Arc::new(MemoryDatabase::new());
        let (team, member) = team_and_member();

        // Member without Team
        let err = SessionFactory::builder()
            .entity(Arc::new(MemoryEntityPersister::new(member, Arc::clone(&db))))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown target entity Team"));

        // Team without its collection persister
        let err = SessionFactory::builder()
            .entity(Arc::new(MemoryEntityPersister::new(team, Arc::clone(&db))))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
        assert!(err.to_string().contains("unknown collection role Team.members"));
    }

    #[test]
    fn test_inverse_mapped_by_must_exist() {
        let db = Arc::new(MemoryDatabase::new());
        let (team, member) = team_and_member();
        let members = CollectionMetadata::entities("Team", "members", "Member")
            .inverse("owner")
            .build()
            .unwrap();
        let err = SessionFactory::builder()
            .entity(Arc::new(MemoryEntityPersister::new(team, Arc::clone(&db))))
            .entity(Arc::new(MemoryEntityPersister::new(member, Arc::clone(&db))))
            .collection(Arc::new(MemoryCollectionPersister::new(members, Arc::clone(&db))))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("has no property 'owner'"));
    }
}
