//! League mapping shared by the integration tests.

#![allow(dead_code)]

use orm::RegionAccessStrategy;
use orm::prelude::*;

pub struct League {
    pub db: Arc<MemoryDatabase>,
    pub factory: Arc<SessionFactory>,
    pub accounts: Arc<MemoryRegion>,
    pub rosters: Arc<MemoryRegion>,
}

pub fn league() -> League {
    league_with(SessionFactoryOptions::default())
}

pub fn league_with(options: SessionFactoryOptions) -> League {
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
        .expect("team mapping");
    let player = EntityMetadata::new("Player")
        .identifier("id", IdGeneration::Assigned)
        .property(PropertyMetadata::basic("name"))
        .property(PropertyMetadata::many_to_one("team", "Team").nullable(true))
        .build()
        .expect("player mapping");
    let account = EntityMetadata::new("Account")
        .identifier("id", IdGeneration::Sequence)
        .version("version", VersionType::Integer)
        .property(PropertyMetadata::basic("owner"))
        .cache_region("accounts")
        .lazy(false)
        .build()
        .expect("account mapping");
    let note = EntityMetadata::new("Note")
        .identifier("id", IdGeneration::Identity)
        .property(PropertyMetadata::basic("text"))
        .build()
        .expect("note mapping");
    let roster = CollectionMetadata::entities("Team", "players", "Player")
        .cache_region("rosters")
        .build()
        .expect("roster mapping");

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
        .expect("session factory");

    League {
        db,
        factory,
        accounts,
        rosters,
    }
}

impl League {
    fn metadata(&self, name: &str) -> Arc<EntityMetadata> {
        let persister = self.factory.entity_persister(name).expect("mapped entity");
        Arc::clone(persister.metadata())
    }

    pub fn team(&self, id: i64, name: &str) -> EntityHandle {
        let team = EntityHandle::with_id(&self.metadata("Team"), id);
        team.set("name", Value::from(name)).expect("name");
        team.set("players", &CollectionHandle::new("Team.players"))
            .expect("players");
        team
    }

    pub fn player(&self, id: i64, name: &str) -> EntityHandle {
        let player = EntityHandle::with_id(&self.metadata("Player"), id);
        player.set("name", Value::from(name)).expect("name");
        player
    }

    pub fn account(&self, owner: &str) -> EntityHandle {
        let account = EntityHandle::new(&self.metadata("Account"));
        account.set("owner", Value::from(owner)).expect("owner");
        account
    }

    pub fn note(&self, text: &str) -> EntityHandle {
        let note = EntityHandle::new(&self.metadata("Note"));
        note.set("text", Value::from(text)).expect("text");
        note
    }

    /// Save in a fresh session and commit.
    pub fn persist_committed(&self, entity: &EntityHandle) -> Value {
        let mut session = self.factory.open_session();
        let id = session.save(entity).expect("save");
        session.commit().expect("commit");
        session.close().expect("close");
        id
    }

    /// A committed team whose roster holds one player per name, ids from 10.
    pub fn committed_team(&self, id: i64, names: &[&str]) -> EntityHandle {
        let team = self.team(id, "Reds");
        let players = team.collection("players").expect("players").expect("roster");
        for (i, name) in names.iter().enumerate() {
            let player_id = 10 + i64::try_from(i).expect("small roster");
            players
                .add(Element::Entity(self.player(player_id, name)))
                .expect("add player");
        }
        self.persist_committed(&team);
        team
    }
}
