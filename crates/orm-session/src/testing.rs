//! Shared fixtures for unit tests.

use crate::{SessionFactory, SessionFactoryOptions};
use orm_core::{
    CascadeStyle, CollectionHandle, CollectionMetadata, EntityHandle, EntityMetadata,
    IdGeneration, PropertyMetadata, RegionAccessStrategy, Value, VersionType,
};
use orm_memory::{MemoryCollectionPersister, MemoryDatabase, MemoryEntityPersister, MemoryRegion};
use std::sync::Arc;

/// A league mapping over one memory database.
///
/// * `Team`: assigned id, `name`, `players` (cascade all, orphans deleted).
/// * `Player`: assigned id, `name`, `team` (many-to-one, no cascade).
/// * `Account`: sequence id, integer version, cached in `accounts`.
/// * `Note`: identity id, `text`.
pub(crate) struct Fixture {
    pub(crate) db: Arc<MemoryDatabase>,
    pub(crate) factory: Arc<SessionFactory>,
    pub(crate) accounts: Arc<MemoryRegion>,
    pub(crate) rosters: Arc<MemoryRegion>,
}

pub(crate) fn fixture() -> Fixture {
    fixture_with(SessionFactoryOptions::default())
}

pub(crate) fn fixture_with(options: SessionFactoryOptions) -> Fixture {
    let db = Arc::new(MemoryDatabase::new());
    let accounts = Arc::new(MemoryRegion::new("accounts"));
    let rosters = Arc::new(MemoryRegion::new("rosters"));

    let team = EntityMetadata::new("Team")
        .identifier("id", IdGeneration::Assigned)
        .property(PropertyMetadata::basic("name"))
        .property(
            PropertyMetadata::collection("players", "Team.players")
                .cascade(CascadeStyle::ALL_DELETE_ORPHAN),
        )
        .build()
        .unwrap();
    let player = EntityMetadata::new("Player")
        .identifier("id", IdGeneration::Assigned)
        .property(PropertyMetadata::basic("name"))
        .property(PropertyMetadata::many_to_one("team", "Team").nullable(true))
        .build()
        .unwrap();
    let account = EntityMetadata::new("Account")
        .identifier("id", IdGeneration::Sequence)
        .version("version", VersionType::Integer)
        .property(PropertyMetadata::basic("owner"))
        .cache_region("accounts")
        .lazy(false)
        .build()
        .unwrap();
    let note = EntityMetadata::new("Note")
        .identifier("id", IdGeneration::Identity)
        .property(PropertyMetadata::basic("text"))
        .build()
        .unwrap();
    let roster = CollectionMetadata::entities("Team", "players", "Player")
        .cache_region("rosters")
        .build()
        .unwrap();

    let account_cache: Arc<dyn RegionAccessStrategy> = accounts.clone();
    let roster_cache: Arc<dyn RegionAccessStrategy> = rosters.clone();
    let factory = SessionFactory::builder()
        .entity(Arc::new(MemoryEntityPersister::new(team, Arc::clone(&db))))
        .entity(Arc::new(MemoryEntityPersister::new(Arc::clone(&player), Arc::clone(&db))))
        .entity(Arc::new(
            MemoryEntityPersister::new(account, Arc::clone(&db)).with_cache(account_cache),
        ))
        .entity(Arc::new(MemoryEntityPersister::new(note, Arc::clone(&db))))
        .collection(Arc::new(
            MemoryCollectionPersister::new(roster, Arc::clone(&db))
                .with_element_metadata(player)
                .with_cache(roster_cache),
        ))
        .options(options)
        .build()
        .unwrap();

    Fixture {
        db,
        factory,
        accounts,
        rosters,
    }
}

fn metadata(fx: &Fixture, name: &str) -> Arc<EntityMetadata> {
    Arc::clone(fx.factory.entity_persister(name).unwrap().metadata())
}

/// A transient team with an empty roster.
pub(crate) fn team(fx: &Fixture, id: i64, name: &str) -> EntityHandle {
    let team = EntityHandle::with_id(&metadata(fx, "Team"), id);
    team.set("name", Value::from(name)).unwrap();
    team.set("players", &CollectionHandle::new("Team.players"))
        .unwrap();
    team
}

/// A transient player without a team.
pub(crate) fn player(fx: &Fixture, id: i64, name: &str) -> EntityHandle {
    let player = EntityHandle::with_id(&metadata(fx, "Player"), id);
    player.set("name", Value::from(name)).unwrap();
    player
}

/// A transient account; the sequence assigns its id on save.
pub(crate) fn account(fx: &Fixture, owner: &str) -> EntityHandle {
    let account = EntityHandle::new(&metadata(fx, "Account"));
    account.set("owner", Value::from(owner)).unwrap();
    account
}

/// A transient note; the database assigns its id on insert.
pub(crate) fn note(fx: &Fixture, text: &str) -> EntityHandle {
    let note = EntityHandle::new(&metadata(fx, "Note"));
    note.set("text", Value::from(text)).unwrap();
    note
}

/// Save `entity` in a fresh session and commit.
pub(crate) fn persist_committed(fx: &Fixture, entity: &EntityHandle) -> Value {
    let mut session = fx.factory.open_session();
    let id = session.save(entity).unwrap();
    session.commit().unwrap();
    session.close().unwrap();
    id
}
