//! Entity and collection mapping metadata.
//!
//! Metadata is produced by an external mapping layer and consumed read-only
//! by the session. Each entity is described by an ordered property list; the
//! same ordering is used for object state, loaded snapshots and the
//! disassembled rows handed to persisters.

use crate::{CascadeStyle, Error, Result, Value, VersionType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// How identifiers of new instances are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdGeneration {
    /// The application sets the identifier before saving.
    Assigned,
    /// The database generates the identifier during the insert.
    Identity,
    /// The persister hands out identifiers before the insert.
    Sequence,
}

/// Identifier values that mark an instance as not yet saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IdUnsavedValue {
    /// Always unsaved.
    Any,
    /// Never unsaved.
    None,
    /// Unsaved when the identifier is null.
    Null,
    /// Unsaved when the identifier equals this value.
    Value(Value),
    /// Cannot tell from the identifier alone.
    Undefined,
}

/// Version values that mark an instance as not yet saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionUnsavedValue {
    /// Unsaved when null; otherwise defer to the identifier.
    Undefined,
    /// Unsaved exactly when null.
    Null,
    /// Unsaved when null or negative.
    Negative,
}

impl IdUnsavedValue {
    /// Does `id` mark an unsaved instance? `None` means undecided.
    pub fn is_unsaved(&self, id: &Value) -> Option<bool> {
        match self {
            IdUnsavedValue::Any => Some(true),
            IdUnsavedValue::None => Some(false),
            IdUnsavedValue::Null => Some(id.is_null()),
            IdUnsavedValue::Value(v) => Some(id.is_null() || id.same_identifier(v)),
            IdUnsavedValue::Undefined => id.is_null().then_some(true),
        }
    }
}

impl VersionUnsavedValue {
    /// Does `version` mark an unsaved instance? `None` means undecided.
    pub fn is_unsaved(self, version: &Value) -> Option<bool> {
        match self {
            VersionUnsavedValue::Undefined => version.is_null().then_some(true),
            VersionUnsavedValue::Null => Some(version.is_null()),
            VersionUnsavedValue::Negative => Some(
                version.is_null() || version.as_i64().is_some_and(|v| v < 0),
            ),
        }
    }
}

/// Version property of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub name: String,
    pub version_type: VersionType,
    pub unsaved_value: VersionUnsavedValue,
}

/// Direction of the foreign key behind an association, relative to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeyDirection {
    /// The owner row holds the key (many-to-one). The target must exist first.
    FromParent,
    /// The target rows hold the key (collections, one-to-one). The owner must exist first.
    ToParent,
}

/// What a property holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyKind {
    /// A column value.
    Basic,
    /// Reference to another entity through a foreign key on this row.
    ManyToOne { target: String },
    /// Reference to another entity that shares this entity's key.
    OneToOne { target: String },
    /// A persistent collection identified by its role.
    Collection { role: String },
    /// An embedded value with nested properties.
    Component { properties: Vec<PropertyMetadata> },
}

impl PropertyKind {
    /// Entity name of a to-one target.
    pub fn entity_target(&self) -> Option<&str> {
        match self {
            PropertyKind::ManyToOne { target } | PropertyKind::OneToOne { target } => Some(target),
            _ => None,
        }
    }

    /// Foreign key direction of an association, `None` for values.
    pub fn foreign_key_direction(&self) -> Option<ForeignKeyDirection> {
        match self {
            PropertyKind::ManyToOne { .. } => Some(ForeignKeyDirection::FromParent),
            PropertyKind::OneToOne { .. } | PropertyKind::Collection { .. } => {
                Some(ForeignKeyDirection::ToParent)
            }
            PropertyKind::Basic | PropertyKind::Component { .. } => None,
        }
    }

    /// Is this an entity or collection association?
    pub fn is_association(&self) -> bool {
        self.foreign_key_direction().is_some()
    }
}

/// One mapped property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMetadata {
    pub name: String,
    pub kind: PropertyKind,
    pub cascade: CascadeStyle,
    pub nullable: bool,
    pub insertable: bool,
    pub updatable: bool,
    /// Whether a change to this property bumps the version.
    pub optimistic_lock: bool,
}

impl PropertyMetadata {
    fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            cascade: CascadeStyle::NONE,
            nullable: true,
            insertable: true,
            updatable: true,
            optimistic_lock: true,
        }
    }

    /// A column value.
    pub fn basic(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Basic)
    }

    /// A many-to-one reference.
    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            PropertyKind::ManyToOne {
                target: target.into(),
            },
        )
    }

    /// A one-to-one reference sharing the owner's key.
    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            PropertyKind::OneToOne {
                target: target.into(),
            },
        )
    }

    /// A collection property.
    pub fn collection(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Collection { role: role.into() })
    }

    /// An embedded component.
    pub fn component(name: impl Into<String>, properties: Vec<PropertyMetadata>) -> Self {
        Self::new(name, PropertyKind::Component { properties })
    }

    /// Set the cascade style.
    #[must_use]
    pub fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    /// Set whether null is allowed.
    #[must_use]
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Exclude the property from updates.
    #[must_use]
    pub fn updatable(mut self, updatable: bool) -> Self {
        self.updatable = updatable;
        self
    }

    /// Exclude the property from inserts.
    #[must_use]
    pub fn insertable(mut self, insertable: bool) -> Self {
        self.insertable = insertable;
        self
    }

    /// Exclude the property from optimistic version checks.
    #[must_use]
    pub fn optimistic_lock(mut self, enabled: bool) -> Self {
        self.optimistic_lock = enabled;
        self
    }
}

/// Mapping of one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub name: String,
    /// Root of the inheritance hierarchy, when this entity is a subclass.
    pub root_entity: Option<String>,
    pub identifier_name: String,
    pub id_generation: IdGeneration,
    pub id_unsaved_value: IdUnsavedValue,
    pub version: Option<VersionMetadata>,
    pub properties: Vec<PropertyMetadata>,
    pub mutable: bool,
    /// Whether references may be represented by uninitialized proxies.
    pub lazy: bool,
    pub select_before_update: bool,
    pub dynamic_update: bool,
    pub cache_region: Option<String>,
}

impl EntityMetadata {
    /// Start describing an entity with an assigned `id` identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root_entity: None,
            identifier_name: "id".to_string(),
            id_generation: IdGeneration::Assigned,
            id_unsaved_value: IdUnsavedValue::Undefined,
            version: None,
            properties: Vec::new(),
            mutable: true,
            lazy: true,
            select_before_update: false,
            dynamic_update: false,
            cache_region: None,
        }
    }

    /// Set the identifier property and its generation strategy.
    ///
    /// Generated identifiers default to a null unsaved-value.
    #[must_use]
    pub fn identifier(mut self, name: impl Into<String>, generation: IdGeneration) -> Self {
        self.identifier_name = name.into();
        self.id_generation = generation;
        self.id_unsaved_value = match generation {
            IdGeneration::Assigned => IdUnsavedValue::Undefined,
            IdGeneration::Identity | IdGeneration::Sequence => IdUnsavedValue::Null,
        };
        self
    }

    /// Declare this entity a subclass sharing `root`'s identifier space.
    #[must_use]
    pub fn subclass_of(mut self, root: impl Into<String>) -> Self {
        self.root_entity = Some(root.into());
        self
    }

    /// Override the identifier unsaved-value.
    #[must_use]
    pub fn id_unsaved_value(mut self, unsaved: IdUnsavedValue) -> Self {
        self.id_unsaved_value = unsaved;
        self
    }

    /// Make the entity versioned.
    #[must_use]
    pub fn version(mut self, name: impl Into<String>, version_type: VersionType) -> Self {
        self.version = Some(VersionMetadata {
            name: name.into(),
            version_type,
            unsaved_value: VersionUnsavedValue::Undefined,
        });
        self
    }

    /// Override the version unsaved-value.
    #[must_use]
    pub fn version_unsaved_value(mut self, unsaved: VersionUnsavedValue) -> Self {
        if let Some(version) = self.version.as_mut() {
            version.unsaved_value = unsaved;
        }
        self
    }

    /// Append a property.
    #[must_use]
    pub fn property(mut self, property: PropertyMetadata) -> Self {
        self.properties.push(property);
        self
    }

    /// Mark the entity immutable (never updated).
    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Set whether proxies may stand in for unloaded instances.
    #[must_use]
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Select the current row before re-attaching a detached instance.
    #[must_use]
    pub fn select_before_update(mut self, enabled: bool) -> Self {
        self.select_before_update = enabled;
        self
    }

    /// Only write changed properties on update.
    #[must_use]
    pub fn dynamic_update(mut self, enabled: bool) -> Self {
        self.dynamic_update = enabled;
        self
    }

    /// Cache instances in the named second-level cache region.
    #[must_use]
    pub fn cache_region(mut self, region: impl Into<String>) -> Self {
        self.cache_region = Some(region.into());
        self
    }

    /// Validate and freeze the metadata.
    pub fn build(self) -> Result<Arc<EntityMetadata>> {
        self.validate()?;
        Ok(Arc::new(self))
    }

    /// Check structural consistency.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Mapping("entity name must not be empty".to_string()));
        }
        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(&self.identifier_name);
        if let Some(version) = &self.version {
            if !seen.insert(&version.name) {
                return Err(Error::Mapping(format!(
                    "{}: version property '{}' clashes with the identifier",
                    self.name, version.name
                )));
            }
        }
        validate_properties(&self.name, &self.properties, &mut seen)
    }

    /// Name identifying the identifier space (the hierarchy root).
    pub fn root_name(&self) -> &str {
        self.root_entity.as_deref().unwrap_or(&self.name)
    }

    /// Is an instance of this entity also an instance of `entity_name`?
    pub fn is_instance_of(&self, entity_name: &str) -> bool {
        self.name == entity_name || self.root_name() == entity_name
    }

    /// Number of mapped properties.
    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    /// Index of a property by name.
    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    /// Names of all properties, in state order.
    pub fn property_names(&self) -> Vec<&str> {
        self.properties.iter().map(|p| p.name.as_str()).collect()
    }

    /// Is this entity versioned?
    pub fn is_versioned(&self) -> bool {
        self.version.is_some()
    }

    /// Version type, when versioned.
    pub fn version_type(&self) -> Option<VersionType> {
        self.version.as_ref().map(|v| v.version_type)
    }

    /// Is an identifier generated before the insert executes?
    pub fn uses_identity(&self) -> bool {
        self.id_generation == IdGeneration::Identity
    }

    /// Does this entity have a second-level cache region?
    pub fn has_cache(&self) -> bool {
        self.cache_region.is_some()
    }

    /// Decide from unsaved-values alone whether an instance is transient.
    ///
    /// Returns `None` when neither the version nor the identifier settles it.
    pub fn is_transient_by_unsaved_value(&self, id: &Value, version: &Value) -> Option<bool> {
        if id.is_null() {
            return Some(true);
        }
        if id.is_generated_placeholder() {
            return Some(false);
        }
        if let Some(v) = &self.version {
            if let Some(unsaved) = v.unsaved_value.is_unsaved(version) {
                return Some(unsaved);
            }
        }
        self.id_unsaved_value.is_unsaved(id)
    }
}

fn validate_properties<'a>(
    entity: &str,
    properties: &'a [PropertyMetadata],
    seen: &mut HashSet<&'a str>,
) -> Result<()> {
    for property in properties {
        if !seen.insert(&property.name) {
            return Err(Error::Mapping(format!(
                "{entity}: duplicate property '{}'",
                property.name
            )));
        }
        if let PropertyKind::Component { properties: nested } = &property.kind {
            let mut nested_seen = HashSet::new();
            validate_properties(entity, nested, &mut nested_seen)?;
            if nested
                .iter()
                .any(|p| matches!(p.kind, PropertyKind::Collection { .. }))
            {
                return Err(Error::Mapping(format!(
                    "{entity}.{}: collections inside components are not supported",
                    property.name
                )));
            }
        }
    }
    Ok(())
}

/// What a collection holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElementKind {
    /// Column values.
    Value,
    /// References to entities.
    Entity { target: String },
}

/// Mapping of one collection role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    /// `Owner.property`
    pub role: String,
    pub owner: String,
    pub element: ElementKind,
    /// The other side of a bidirectional association owns the link.
    pub inverse: bool,
    /// For inverse one-to-many: the element property pointing back at the owner.
    pub mapped_by: Option<String>,
    pub mutable: bool,
    pub cache_region: Option<String>,
    /// Filters that restrict the loaded elements when enabled.
    pub filters: Vec<String>,
}

impl CollectionMetadata {
    /// Describe a value collection owned by `owner.property`.
    pub fn values(owner: impl Into<String>, property: &str) -> Self {
        let owner = owner.into();
        Self {
            role: format!("{owner}.{property}"),
            owner,
            element: ElementKind::Value,
            inverse: false,
            mapped_by: None,
            mutable: true,
            cache_region: None,
            filters: Vec::new(),
        }
    }

    /// Describe an entity collection owned by `owner.property`.
    pub fn entities(owner: impl Into<String>, property: &str, target: impl Into<String>) -> Self {
        Self {
            element: ElementKind::Entity {
                target: target.into(),
            },
            ..Self::values(owner, property)
        }
    }

    /// Mark the collection inverse, mapped by `property` on the element.
    #[must_use]
    pub fn inverse(mut self, mapped_by: impl Into<String>) -> Self {
        self.inverse = true;
        self.mapped_by = Some(mapped_by.into());
        self
    }

    /// Mark the collection immutable.
    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Cache the collection in the named region.
    #[must_use]
    pub fn cache_region(mut self, region: impl Into<String>) -> Self {
        self.cache_region = Some(region.into());
        self
    }

    /// Register a filter that affects this collection.
    #[must_use]
    pub fn filter(mut self, name: impl Into<String>) -> Self {
        self.filters.push(name.into());
        self
    }

    /// Entity name of the elements, for entity collections.
    pub fn element_entity(&self) -> Option<&str> {
        match &self.element {
            ElementKind::Entity { target } => Some(target),
            ElementKind::Value => None,
        }
    }

    /// Does this collection have a second-level cache region?
    pub fn has_cache(&self) -> bool {
        self.cache_region.is_some()
    }

    /// Validate and freeze the metadata.
    pub fn build(self) -> Result<Arc<CollectionMetadata>> {
        if self.mapped_by.is_some() && self.element_entity().is_none() {
            return Err(Error::Mapping(format!(
                "{}: only entity collections can be mapped by an element property",
                self.role
            )));
        }
        Ok(Arc::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> EntityMetadata {
        EntityMetadata::new("Person")
            .identifier("id", IdGeneration::Identity)
            .version("version", VersionType::Integer)
            .property(PropertyMetadata::basic("name"))
            .property(PropertyMetadata::many_to_one("team", "Team").cascade(CascadeStyle::ALL))
            .property(PropertyMetadata::collection("nicknames", "Person.nicknames"))
    }

    #[test]
    fn test_property_lookup() {
        let meta = person().build().unwrap();
        assert_eq!(meta.property_index("team"), Some(1));
        assert_eq!(meta.property_names(), vec!["name", "team", "nicknames"]);
        assert!(meta.is_versioned());
        assert!(meta.uses_identity());
    }

    #[test]
    fn test_duplicate_property_rejected() {
        let err = person()
            .property(PropertyMetadata::basic("name"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
    }

    #[test]
    fn test_collection_in_component_rejected() {
        let err = EntityMetadata::new("Order")
            .property(PropertyMetadata::component(
                "address",
                vec![PropertyMetadata::collection("lines", "Order.lines")],
            ))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
    }

    #[test]
    fn test_transient_by_unsaved_value() {
        let meta = person().build().unwrap();
        assert_eq!(
            meta.is_transient_by_unsaved_value(&Value::Null, &Value::Null),
            Some(true)
        );
        assert_eq!(
            meta.is_transient_by_unsaved_value(&Value::BigInt(1), &Value::BigInt(0)),
            Some(false)
        );
        assert_eq!(
            meta.is_transient_by_unsaved_value(&Value::BigInt(1), &Value::Null),
            Some(true)
        );

        let assigned = EntityMetadata::new("Tag").build().unwrap();
        assert_eq!(
            assigned.is_transient_by_unsaved_value(&Value::Text("rust".into()), &Value::Null),
            None
        );
    }

    #[test]
    fn test_hierarchy_root() {
        let employee = EntityMetadata::new("Employee")
            .subclass_of("Person")
            .build()
            .unwrap();
        assert_eq!(employee.root_name(), "Person");
        assert!(employee.is_instance_of("Person"));
        assert!(employee.is_instance_of("Employee"));
        assert!(!employee.is_instance_of("Customer"));
        assert_eq!(person().build().unwrap().root_name(), "Person");
    }

    #[test]
    fn test_foreign_key_direction() {
        let meta = person().build().unwrap();
        assert_eq!(
            meta.properties[1].kind.foreign_key_direction(),
            Some(ForeignKeyDirection::FromParent)
        );
        assert_eq!(
            meta.properties[2].kind.foreign_key_direction(),
            Some(ForeignKeyDirection::ToParent)
        );
        assert_eq!(meta.properties[0].kind.foreign_key_direction(), None);
    }

    #[test]
    fn test_collection_metadata() {
        let coll = CollectionMetadata::entities("Team", "members", "Person")
            .inverse("team")
            .cache_region("team-members")
            .build()
            .unwrap();
        assert_eq!(coll.role, "Team.members");
        assert_eq!(coll.element_entity(), Some("Person"));
        assert!(coll.inverse);
        assert!(coll.has_cache());

        assert!(
            CollectionMetadata::values("Team", "tags")
                .inverse("team")
                .build()
                .is_err()
        );
    }
}
