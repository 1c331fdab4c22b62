mod common;

use common::league;
use orm::Status;
use orm::prelude::*;

#[test]
fn identity_map_returns_one_instance_per_row() {
    let lg = league();
    lg.committed_team(1, &[]);
    lg.db.clear_log();

    let mut session = lg.factory.open_session();
    let first = session.get("Team", 1).unwrap().unwrap();
    let second = session.get("Team", 1).unwrap().unwrap();
    assert!(first.ptr_eq(&second));
    assert_eq!(lg.db.count("select"), 1);
    assert!(session.get("Team", 2).unwrap().is_none());
}

#[test]
fn commit_writes_modified_instances_once() {
    let lg = league();
    let a = lg.account("ada");
    let id = lg.persist_committed(&a);
    lg.db.clear_log();

    let mut session = lg.factory.open_session();
    let loaded = session.get("Account", id.clone()).unwrap().unwrap();
    loaded.set("owner", Value::from("bob")).unwrap();
    session.commit().unwrap();
    session.commit().unwrap();

    assert_eq!(lg.db.count("update"), 1);
    let row = lg.db.row("Account", &id).unwrap();
    assert_eq!(row.version, Value::BigInt(1));
}

#[test]
fn concurrent_update_fails_optimistic_check() {
    let lg = league();
    let a = lg.account("ada");
    let id = lg.persist_committed(&a);

    let mut first = lg.factory.open_session();
    let mut second = lg.factory.open_session();
    let mine = first.get("Account", id.clone()).unwrap().unwrap();
    let theirs = second.get("Account", id).unwrap().unwrap();

    mine.set("owner", Value::from("bob")).unwrap();
    first.commit().unwrap();

    theirs.set("owner", Value::from("cy")).unwrap();
    let err = second.commit().unwrap_err();
    assert!(err.is_optimistic_failure());
}

#[test]
fn dirty_check_does_not_queue_work() {
    let lg = league();
    let a = lg.account("ada");
    let id = lg.persist_committed(&a);

    let mut session = lg.factory.open_session();
    let loaded = session.get("Account", id).unwrap().unwrap();
    assert!(!session.is_dirty().unwrap());

    loaded.set("owner", Value::from("bob")).unwrap();
    assert!(session.is_dirty().unwrap());
    assert!(session.is_dirty().unwrap());
    assert_eq!(session.pending_update_count(), 0);
}

#[test]
fn identity_save_waits_for_flush() {
    let lg = league();
    let mut session = lg.factory.open_session();
    let n = lg.note("hello");
    session.save(&n).unwrap();
    assert_eq!(session.entry_status(&n), Some(Status::Saving));
    assert_eq!(lg.db.row_count("Note"), 0);

    session.commit().unwrap();
    assert_eq!(session.entry_status(&n), Some(Status::Managed));
    assert!(lg.db.row("Note", &n.id()).is_some());
}

#[test]
fn update_of_deleted_instance_is_rejected() {
    let lg = league();
    let a = lg.account("ada");
    let id = lg.persist_committed(&a);

    let mut session = lg.factory.open_session();
    let loaded = session.get("Account", id).unwrap().unwrap();
    session.delete(&loaded).unwrap();
    let err = session.update(&loaded).unwrap_err();
    assert!(matches!(err, Error::ObjectDeleted(_)));
}

#[test]
fn orphan_removed_in_later_session_is_deleted() {
    let lg = league();
    lg.committed_team(1, &["Ann", "Bo"]);

    let mut session = lg.factory.open_session();
    let team = session.get("Team", 1).unwrap().unwrap();
    let players = team.collection("players").unwrap().unwrap();
    session.initialize_collection(&players).unwrap();
    let dropped = players
        .elements()
        .unwrap()
        .into_iter()
        .find(|e| e.as_entity().is_some_and(|p| p.id() == Value::BigInt(10)))
        .unwrap();
    players.remove(&dropped).unwrap();
    session.commit().unwrap();

    assert!(lg.db.row("Player", &Value::BigInt(10)).is_none());
    assert!(lg.db.row("Player", &Value::BigInt(11)).is_some());
    assert_eq!(lg.db.collection_rows("Team.players", &Value::BigInt(1)).len(), 1);
}

#[test]
fn manual_flush_mode_defers_writes_past_commit() {
    let lg = league();
    let mut session = lg.factory.open_session();
    session.set_flush_mode(FlushMode::Manual);
    session.save(&lg.team(1, "Reds")).unwrap();
    session.commit().unwrap();
    assert_eq!(lg.db.row_count("Team"), 0);

    session.flush().unwrap();
    assert_eq!(lg.db.row_count("Team"), 1);
}

#[test]
fn pessimistic_lock_is_only_taken_once() {
    let lg = league();
    let a = lg.account("ada");
    let id = lg.persist_committed(&a);

    let mut session = lg.factory.open_session();
    let loaded = session.get("Account", id).unwrap().unwrap();
    lg.db.clear_log();
    session.lock(&loaded, LockMode::PessimisticWrite).unwrap();
    session.lock(&loaded, LockMode::Read).unwrap();
    assert_eq!(lg.db.count("lock"), 1);
    assert_eq!(
        session.get_current_lock_mode(&loaded).unwrap(),
        LockMode::PessimisticWrite
    );

    session.commit().unwrap();
    assert_eq!(session.get_current_lock_mode(&loaded).unwrap(), LockMode::None);
}
