mod common;

use common::{league, league_with};
use orm::CacheKey;
use orm::prelude::*;

fn with_statistics() -> SessionFactoryOptions {
    SessionFactoryOptions {
        statistics_enabled: true,
        ..Default::default()
    }
}

#[test]
fn committed_insert_is_served_from_cache() {
    let lg = league_with(with_statistics());
    let a = lg.account("ada");
    let id = lg.persist_committed(&a);
    lg.db.clear_log();

    let mut session = lg.factory.open_session();
    let loaded = session.get("Account", id).unwrap().unwrap();
    assert_eq!(loaded.value("owner").unwrap(), Value::from("ada"));
    assert_eq!(lg.db.count("select"), 0);

    let stats = lg.factory.statistics().snapshot();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.regions["accounts"].hits, 1);
}

#[test]
fn committed_update_replaces_cached_state() {
    let lg = league();
    let a = lg.account("ada");
    let id = lg.persist_committed(&a);

    let mut writer = lg.factory.open_session();
    let loaded = writer.get("Account", id.clone()).unwrap().unwrap();
    loaded.set("owner", Value::from("bob")).unwrap();
    writer.commit().unwrap();
    writer.close().unwrap();
    lg.db.clear_log();

    let mut reader = lg.factory.open_session();
    let reread = reader.get("Account", id).unwrap().unwrap();
    assert_eq!(reread.value("owner").unwrap(), Value::from("bob"));
    assert_eq!(reread.version(), Value::BigInt(1));
    assert_eq!(lg.db.count("select"), 0);
}

#[test]
fn flushed_update_soft_locks_item_until_completion() {
    let lg = league();
    let a = lg.account("ada");
    let id = lg.persist_committed(&a);
    let key = CacheKey::entity("Account", id.clone());

    let mut writer = lg.factory.open_session();
    let loaded = writer.get("Account", id.clone()).unwrap().unwrap();
    loaded.set("owner", Value::from("bob")).unwrap();
    writer.flush().unwrap();
    assert!(lg.accounts.is_locked(&key));

    lg.db.clear_log();
    let mut reader = lg.factory.open_session();
    reader.get("Account", id).unwrap().unwrap();
    assert_eq!(lg.db.count("select"), 1);

    writer.commit().unwrap();
    assert!(!lg.accounts.is_locked(&key));
    assert_eq!(lg.accounts.peek(&key).unwrap().version, Value::BigInt(1));
}

#[test]
fn delete_removes_cached_item() {
    let lg = league();
    let a = lg.account("ada");
    let id = lg.persist_committed(&a);
    let key = CacheKey::entity("Account", id.clone());
    assert!(lg.accounts.peek(&key).is_some());

    let mut session = lg.factory.open_session();
    let loaded = session.get("Account", id.clone()).unwrap().unwrap();
    session.delete(&loaded).unwrap();
    session.commit().unwrap();
    session.close().unwrap();

    assert!(lg.accounts.peek(&key).is_none());
    let mut reader = lg.factory.open_session();
    assert!(reader.get("Account", id).unwrap().is_none());
}

#[test]
fn roster_is_read_from_collection_cache() {
    let lg = league();
    lg.committed_team(1, &["Ann", "Bo"]);

    let mut first = lg.factory.open_session();
    let team = first.get("Team", 1).unwrap().unwrap();
    first
        .initialize_collection(&team.collection("players").unwrap().unwrap())
        .unwrap();
    first.close().unwrap();
    assert_eq!(lg.rosters.item_count(), 1);
    lg.db.clear_log();

    let mut second = lg.factory.open_session();
    let team = second.get("Team", 1).unwrap().unwrap();
    let players = team.collection("players").unwrap().unwrap();
    second.initialize_collection(&players).unwrap();
    assert_eq!(players.len().unwrap(), 2);
    assert_eq!(lg.db.count("collection-select"), 0);
}

#[test]
fn ignore_cache_mode_reads_the_database() {
    let lg = league();
    let a = lg.account("ada");
    let id = lg.persist_committed(&a);
    lg.db.clear_log();
    let before = lg.accounts.counters();

    let mut session = lg.factory.open_session();
    session.set_cache_mode(CacheMode::Ignore);
    session.get("Account", id).unwrap().unwrap();
    assert_eq!(lg.db.count("select"), 1);
    assert_eq!(lg.accounts.counters().gets, before.gets);
}
